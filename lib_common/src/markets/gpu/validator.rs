//! # Offer Validator
//!
//! Turns untyped upstream records into `RawOffer`s. Upstream data is noisy by
//! nature, so a record that is missing a required field or carries a field of
//! the wrong type is dropped silently; callers only get a count.
//!
//! Numeric fields accept JSON numbers and numeric-looking strings (`"1.25"`,
//! `" 8 "`); anything else rejects the record.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use super::model::RawOffer;

/// Result of validating one batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchOutcome {
    /// Accepted, de-duplicated offers in order of first appearance.
    pub offers: Vec<RawOffer>,
    /// Records dropped for missing or mistyped fields.
    pub rejected: usize,
    /// Records collapsed into an earlier record with the same key.
    pub duplicates: usize,
}

/// Validates a single record.
///
/// Required: `model`, `usd_hr`, `region`, `availability`, `instance_type`,
/// `provider`. `model` and `region` must be non-empty; price and availability
/// must not be negative.
pub fn validate(record: &Value) -> Option<RawOffer> {
    let obj = record.as_object()?;

    let model = non_empty_str(obj, "model")?;
    let region = non_empty_str(obj, "region")?;
    let instance_type = obj.get("instance_type")?.as_str()?.to_string();
    let provider = obj.get("provider")?.as_str()?.to_string();

    let usd_hr = coerce_f64(obj.get("usd_hr")?)?;
    if !usd_hr.is_finite() || usd_hr < 0.0 {
        return None;
    }
    let availability = coerce_u32(obj.get("availability")?)?;

    // Optional fields never reject the record; a malformed value is dropped.
    let total_instance_price = obj
        .get("total_instance_price")
        .and_then(coerce_f64)
        .filter(|p| p.is_finite() && *p >= 0.0);
    let gpu_memory_gb = obj.get("gpu_memory_gb").and_then(coerce_u32);
    let timestamp = obj.get("timestamp").and_then(parse_timestamp);
    let synthetic = obj.get("synthetic").map(coerce_bool).unwrap_or(false);

    Some(RawOffer {
        model,
        usd_hr,
        region,
        availability,
        instance_type,
        provider,
        total_instance_price,
        gpu_memory_gb,
        timestamp,
        synthetic,
    })
}

/// Validates and de-duplicates a batch. Never aborts on a bad record.
///
/// Duplicates share `(provider, instance_type, region, model)`; the newest
/// observation wins and keeps the slot of the first occurrence.
pub fn validate_batch<'a, I>(records: I) -> BatchOutcome
where
    I: IntoIterator<Item = &'a Value>,
{
    let mut outcome = BatchOutcome::default();
    let mut index: HashMap<(String, String, String, String), usize> = HashMap::new();

    for record in records {
        let Some(offer) = validate(record) else {
            outcome.rejected += 1;
            continue;
        };

        let (p, i, r, m) = offer.dedup_key();
        let key = (p.to_string(), i.to_string(), r.to_string(), m.to_string());
        match index.get(&key) {
            Some(&slot) => {
                outcome.duplicates += 1;
                if is_newer(&offer, &outcome.offers[slot]) {
                    outcome.offers[slot] = offer;
                }
            }
            None => {
                index.insert(key, outcome.offers.len());
                outcome.offers.push(offer);
            }
        }
    }

    if outcome.rejected > 0 || outcome.duplicates > 0 {
        log::debug!(
            "Batch validated: {} accepted, {} rejected, {} duplicates",
            outcome.offers.len(),
            outcome.rejected,
            outcome.duplicates
        );
    }
    outcome
}

fn is_newer(candidate: &RawOffer, current: &RawOffer) -> bool {
    match (candidate.timestamp, current.timestamp) {
        (Some(a), Some(b)) => a > b,
        (Some(_), None) => true,
        _ => false,
    }
}

fn non_empty_str(obj: &Map<String, Value>, key: &str) -> Option<String> {
    let s = obj.get(key)?.as_str()?.trim();
    if s.is_empty() { None } else { Some(s.to_string()) }
}

fn coerce_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()),
        _ => None,
    }
}

fn coerce_u32(v: &Value) -> Option<u32> {
    let f = coerce_f64(v)?;
    if f < 0.0 || f.fract() != 0.0 || f > u32::MAX as f64 {
        return None;
    }
    Some(f as u32)
}

fn coerce_bool(v: &Value) -> bool {
    match v {
        Value::Bool(b) => *b,
        Value::String(s) => s.eq_ignore_ascii_case("true"),
        _ => false,
    }
}

pub(crate) fn parse_timestamp(v: &Value) -> Option<DateTime<Utc>> {
    let s = v.as_str()?;
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Some(ts.with_timezone(&Utc));
    }
    // Python's isoformat() omits the offset for naive datetimes; those are UTC upstream.
    chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn a100() -> Value {
        json!({
            "model": "A100",
            "usd_hr": 1.20,
            "region": "us-east-1",
            "availability": 8,
            "instance_type": "p4d.24xlarge",
            "provider": "aws_spot",
            "timestamp": "2024-05-01T12:00:00Z"
        })
    }

    #[test]
    fn accepts_complete_record() {
        let offer = validate(&a100()).unwrap();
        assert_eq!(offer.model, "A100");
        assert_eq!(offer.availability, 8);
        assert!(!offer.synthetic);
        assert!(offer.timestamp.is_some());
    }

    #[test]
    fn rejects_missing_required_fields() {
        for field in ["model", "usd_hr", "region", "availability", "instance_type", "provider"] {
            let mut rec = a100();
            rec.as_object_mut().unwrap().remove(field);
            assert!(validate(&rec).is_none(), "record without {field} was accepted");
        }
    }

    #[test]
    fn coerces_numeric_strings_and_rejects_garbage() {
        let mut rec = a100();
        rec["usd_hr"] = json!("0.75");
        rec["availability"] = json!(" 3 ");
        let offer = validate(&rec).unwrap();
        assert_eq!(offer.usd_hr, 0.75);
        assert_eq!(offer.availability, 3);

        rec["usd_hr"] = json!("cheap");
        assert!(validate(&rec).is_none());

        let mut rec = a100();
        rec["availability"] = json!(-1);
        assert!(validate(&rec).is_none());

        let mut rec = a100();
        rec["model"] = json!(100);
        assert!(validate(&rec).is_none());
    }

    #[test]
    fn bad_optional_fields_do_not_reject() {
        let mut rec = a100();
        rec["timestamp"] = json!("yesterday");
        rec["gpu_memory_gb"] = json!("lots");
        rec["synthetic"] = json!("TRUE");
        let offer = validate(&rec).unwrap();
        assert!(offer.timestamp.is_none());
        assert!(offer.gpu_memory_gb.is_none());
        assert!(offer.synthetic);
    }

    #[test]
    fn naive_iso_timestamps_are_utc() {
        let mut rec = a100();
        rec["timestamp"] = json!("2024-05-01T12:00:00.123456");
        let offer = validate(&rec).unwrap();
        assert_eq!(offer.timestamp.unwrap().to_rfc3339(), "2024-05-01T12:00:00.123456+00:00");
    }

    #[test]
    fn batch_counts_rejects_and_keeps_going() {
        let records = vec![a100(), json!({"model": "T4"}), json!("not an object"), a100()];
        let outcome = validate_batch(&records);
        assert_eq!(outcome.offers.len(), 1);
        assert_eq!(outcome.rejected, 2);
        assert_eq!(outcome.duplicates, 1);
    }

    #[test]
    fn duplicate_keeps_newest_in_first_slot() {
        let mut older = a100();
        older["usd_hr"] = json!(1.0);
        older["timestamp"] = json!("2024-05-01T10:00:00Z");
        let mut t4 = a100();
        t4["model"] = json!("T4");
        t4["instance_type"] = json!("g4dn.xlarge");
        let mut newer = a100();
        newer["usd_hr"] = json!(1.5);
        newer["timestamp"] = json!("2024-05-01T11:00:00Z");

        let records = vec![older, t4, newer];
        let outcome = validate_batch(&records);
        assert_eq!(outcome.offers.len(), 2);
        assert_eq!(outcome.offers[0].model, "A100");
        assert_eq!(outcome.offers[0].usd_hr, 1.5);
        assert_eq!(outcome.offers[1].model, "T4");
    }
}
