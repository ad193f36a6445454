//! # Query Engine
//!
//! Stateless views over a `Snapshot`: free-text / price-ceiling filtering,
//! stable sorting and aggregate statistics. Nothing here holds state, so the
//! same snapshot and query always yield the same result.

use std::collections::BTreeSet;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::model::{EnrichedOffer, Freshness, RiskClass, Snapshot};
use super::reference::ReferenceTables;

/// Sort key for offer listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortKey {
    #[default]
    Price,
    Yield,
    Risk,
}

impl FromStr for SortKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "price" => Ok(SortKey::Price),
            "yield" => Ok(SortKey::Yield),
            "risk" => Ok(SortKey::Risk),
            other => Err(format!("unknown sort key '{}'", other)),
        }
    }
}

/// A consumer-side query over the current snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OfferQuery {
    /// Case-insensitive substring over model, region code, instance type and
    /// region display name.
    pub search: Option<String>,
    /// Offers priced above this are excluded.
    pub max_price: Option<f64>,
    pub sort: SortKey,
    /// Reverses the comparator.
    pub descending: bool,
}

/// Aggregate statistics over a snapshot.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct OfferStats {
    pub total_offers: usize,
    pub average_price: f64,
    pub min_price: f64,
    pub max_price: f64,
    pub unique_models: BTreeSet<String>,
    pub unique_regions: BTreeSet<String>,
    pub low_risk_count: usize,
    pub live_count: usize,
    pub has_live_data: bool,
    pub has_synthetic_data: bool,
}

/// True when `offer` matches the free-text `needle` (already lower-cased).
fn matches_search(offer: &EnrichedOffer, needle: &str, tables: &ReferenceTables) -> bool {
    let o = &offer.offer;
    [
        o.model.as_str(),
        o.region.as_str(),
        o.instance_type.as_str(),
        tables.region_name(&o.region),
    ]
    .iter()
    .any(|field| field.to_lowercase().contains(needle))
}

/// Applies search and price ceiling, keeping snapshot order.
pub fn filter<'a>(
    offers: &'a [EnrichedOffer],
    query: &OfferQuery,
    tables: &ReferenceTables,
) -> Vec<&'a EnrichedOffer> {
    let needle = query
        .search
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_lowercase);

    offers
        .iter()
        .filter(|o| needle.as_deref().map_or(true, |n| matches_search(o, n, tables)))
        .filter(|o| query.max_price.map_or(true, |max| o.offer.usd_hr <= max))
        .collect()
}

/// Stable sort by `key`; equal elements keep their input order in both
/// directions.
pub fn sort(offers: &mut [&EnrichedOffer], key: SortKey, descending: bool) {
    offers.sort_by(|a, b| {
        let ord = match key {
            SortKey::Price => a.offer.usd_hr.total_cmp(&b.offer.usd_hr),
            SortKey::Yield => a
                .yield_metrics
                .net_yield
                .total_cmp(&b.yield_metrics.net_yield),
            SortKey::Risk => a.interruption_risk.cmp(&b.interruption_risk),
        };
        if descending { ord.reverse() } else { ord }
    });
}

/// Filter then sort, the usual listing pipeline.
pub fn run<'a>(snapshot: &'a Snapshot, query: &OfferQuery) -> Vec<&'a EnrichedOffer> {
    let mut rows = filter(&snapshot.offers, query, ReferenceTables::shared());
    sort(&mut rows, query.sort, query.descending);
    rows
}

/// Aggregates over any slice of offers. Empty input yields zeros, never NaN.
pub fn stats<'a, I>(offers: I) -> OfferStats
where
    I: IntoIterator<Item = &'a EnrichedOffer>,
{
    let mut s = OfferStats::default();
    let mut sum = 0.0;
    for e in offers {
        let price = e.offer.usd_hr;
        if s.total_offers == 0 {
            s.min_price = price;
            s.max_price = price;
        } else {
            s.min_price = s.min_price.min(price);
            s.max_price = s.max_price.max(price);
        }
        s.total_offers += 1;
        sum += price;
        s.unique_models.insert(e.offer.model.clone());
        s.unique_regions.insert(e.offer.region.clone());
        if e.interruption_risk == RiskClass::Low {
            s.low_risk_count += 1;
        }
        if e.data_freshness == Freshness::Live {
            s.live_count += 1;
        }
        if e.offer.synthetic {
            s.has_synthetic_data = true;
        }
    }
    s.average_price = if s.total_offers > 0 { sum / s.total_offers as f64 } else { 0.0 };
    s.has_live_data = s.live_count > 0;
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::markets::gpu::enricher::enrich;
    use crate::markets::gpu::model::{RawOffer, SnapshotMetadata};
    use chrono::{Duration, TimeZone, Utc};

    fn snapshot(rows: &[(&str, f64, &str, u32, &str)]) -> Snapshot {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let offers: Vec<EnrichedOffer> = rows
            .iter()
            .map(|(model, price, region, availability, instance)| {
                let raw = RawOffer {
                    model: model.to_string(),
                    usd_hr: *price,
                    region: region.to_string(),
                    availability: *availability,
                    instance_type: instance.to_string(),
                    provider: "aws_spot".into(),
                    total_instance_price: None,
                    gpu_memory_gb: None,
                    timestamp: Some(now - Duration::minutes(10)),
                    synthetic: false,
                };
                enrich(&raw, now, ReferenceTables::shared())
            })
            .collect();
        let metadata = SnapshotMetadata::derive(&offers, Some(now));
        Snapshot { sequence: 1, origin: None, offers, metadata, error: None }
    }

    fn sample() -> Snapshot {
        snapshot(&[
            ("A100", 1.20, "us-east-1", 8, "p4d.24xlarge"),
            ("T4", 0.16, "us-west-2", 1, "g4dn.xlarge"),
            ("V100", 0.79, "eu-west-1", 4, "p3.8xlarge"),
            ("A10G", 0.35, "us-west-2", 2, "g5.xlarge"),
            ("H100", 2.45, "us-east-1", 8, "p5.48xlarge"),
        ])
    }

    fn models(rows: &[&EnrichedOffer]) -> Vec<String> {
        rows.iter().map(|o| o.offer.model.clone()).collect()
    }

    #[test]
    fn search_matches_display_name_case_insensitively() {
        let snap = sample();
        let q = OfferQuery { search: Some("oregon".into()), ..Default::default() };
        assert_eq!(models(&run(&snap, &q)), vec!["T4", "A10G"]);

        let q = OfferQuery { search: Some("P4D".into()), ..Default::default() };
        assert_eq!(models(&run(&snap, &q)), vec!["A100"]);
    }

    #[test]
    fn price_ceiling_is_inclusive() {
        let snap = sample();
        let q = OfferQuery { max_price: Some(0.79), ..Default::default() };
        assert_eq!(models(&run(&snap, &q)), vec!["T4", "A10G", "V100"]);
    }

    #[test]
    fn descending_price_is_exact_reverse() {
        let snap = sample();
        let asc = run(&snap, &OfferQuery::default());
        let desc = run(&snap, &OfferQuery { descending: true, ..Default::default() });
        let mut reversed = models(&asc);
        reversed.reverse();
        assert_eq!(models(&desc), reversed);
    }

    #[test]
    fn risk_sort_is_stable() {
        let snap = sample();
        let q = OfferQuery { sort: SortKey::Risk, ..Default::default() };
        assert_eq!(models(&run(&snap, &q)), vec!["A100", "V100", "H100", "A10G", "T4"]);
        // Repeated queries over an unchanged snapshot are identical.
        assert_eq!(models(&run(&snap, &q)), models(&run(&snap, &q)));
    }

    #[test]
    fn yield_sort_ascending() {
        let snap = sample();
        let q = OfferQuery { sort: SortKey::Yield, ..Default::default() };
        let rows = run(&snap, &q);
        assert!(rows
            .windows(2)
            .all(|w| w[0].yield_metrics.net_yield <= w[1].yield_metrics.net_yield));
    }

    #[test]
    fn stats_over_sample_and_empty() {
        let snap = sample();
        let s = stats(&snap.offers);
        assert_eq!(s.total_offers, 5);
        assert_eq!(s.low_risk_count, 3);
        assert_eq!(s.live_count, 5);
        assert!(s.has_live_data);
        assert!(!s.has_synthetic_data);
        assert_eq!(s.min_price, 0.16);
        assert_eq!(s.max_price, 2.45);
        assert!((s.average_price - 0.99).abs() < 1e-9);

        let empty = stats(&Snapshot::empty().offers);
        assert_eq!(empty.average_price, 0.0);
        assert!(!empty.average_price.is_nan());
        assert!(empty.unique_models.is_empty());
        assert!(!empty.has_live_data);
    }

    #[test]
    fn sort_key_parses() {
        assert_eq!("Yield".parse::<SortKey>().unwrap(), SortKey::Yield);
        assert!("cheapest".parse::<SortKey>().is_err());
    }
}
