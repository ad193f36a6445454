//! # Offer Enricher
//!
//! Pure transform from a `RawOffer` and an observation instant to an
//! `EnrichedOffer`. Nothing here reads a clock or mutates its input: the same
//! offer, instant and tables always produce bit-identical output.

use chrono::{DateTime, Duration, Utc};

use super::model::{EnrichedOffer, Freshness, HardwareSpecs, RawOffer, RiskClass, YieldMetrics};
use super::reference::ReferenceTables;

/// Classifies interruption risk from the available-unit count.
/// Boundaries belong to the better bucket: 4 is low, 2 is medium.
pub fn interruption_risk(availability: u32) -> RiskClass {
    if availability >= 4 {
        RiskClass::Low
    } else if availability >= 2 {
        RiskClass::Medium
    } else {
        RiskClass::High
    }
}

/// Classifies freshness by age at `now`. A missing timestamp is stale.
/// Timestamps in the future (clock skew) count as age zero.
pub fn freshness(observed: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Freshness {
    let Some(ts) = observed else {
        return Freshness::Stale;
    };
    let age = (now - ts).max(Duration::zero());
    if age < Duration::hours(1) {
        Freshness::Live
    } else if age < Duration::hours(6) {
        Freshness::Recent
    } else {
        Freshness::Stale
    }
}

/// Yield metrics for running one GPU of `offer.model` in `offer.region`.
pub fn yield_metrics(offer: &RawOffer, tables: &ReferenceTables) -> YieldMetrics {
    let power_cost_per_hour =
        (tables.tdp_watts(&offer.model) / 1000.0) * tables.power_cost_kwh(&offer.region);
    let net_yield = offer.usd_hr - power_cost_per_hour;
    let margin = if offer.usd_hr > 0.0 {
        (net_yield / offer.usd_hr) * 100.0
    } else {
        0.0
    };
    YieldMetrics {
        power_cost_per_hour,
        net_yield,
        margin,
        break_even: net_yield > 0.0,
    }
}

/// Enriches one offer.
pub fn enrich(offer: &RawOffer, now: DateTime<Utc>, tables: &ReferenceTables) -> EnrichedOffer {
    let specs = tables
        .instance(&offer.instance_type)
        .map(|s| s.to_specs())
        .unwrap_or_default();

    EnrichedOffer {
        offer: offer.clone(),
        interruption_risk: interruption_risk(offer.availability),
        data_freshness: freshness(offer.timestamp, now),
        specs,
        yield_metrics: yield_metrics(offer, tables),
    }
}

/// Enriches a batch against the built-in tables.
pub fn enrich_batch(offers: &[RawOffer], now: DateTime<Utc>) -> Vec<EnrichedOffer> {
    let tables = ReferenceTables::shared();
    offers.iter().map(|o| enrich(o, now, tables)).collect()
}

/// Anything that can be brought to the enriched form.
///
/// Enriching an already-enriched offer re-derives every field from its core
/// `RawOffer`, so `x.enrich(t).enrich(t) == x.enrich(t)`.
pub trait Enrich {
    fn enrich_at(&self, now: DateTime<Utc>, tables: &ReferenceTables) -> EnrichedOffer;
}

impl Enrich for RawOffer {
    fn enrich_at(&self, now: DateTime<Utc>, tables: &ReferenceTables) -> EnrichedOffer {
        enrich(self, now, tables)
    }
}

impl Enrich for EnrichedOffer {
    fn enrich_at(&self, now: DateTime<Utc>, tables: &ReferenceTables) -> EnrichedOffer {
        enrich(&self.offer, now, tables)
    }
}

impl EnrichedOffer {
    /// Hardware fields present on this offer, if any.
    pub fn has_specs(&self) -> bool {
        self.specs != HardwareSpecs::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn a100(availability: u32) -> RawOffer {
        RawOffer {
            model: "A100".into(),
            usd_hr: 1.20,
            region: "us-east-1".into(),
            availability,
            instance_type: "p4d.24xlarge".into(),
            provider: "aws_spot".into(),
            total_instance_price: Some(9.6),
            gpu_memory_gb: Some(40),
            timestamp: Some(now() - Duration::minutes(5)),
            synthetic: false,
        }
    }

    #[test]
    fn scenario_a_low_risk_a100() {
        let e = enrich(&a100(8), now(), ReferenceTables::shared());
        assert_eq!(e.interruption_risk, RiskClass::Low);
        assert_eq!(e.data_freshness, Freshness::Live);
        assert!((e.yield_metrics.power_cost_per_hour - 0.04).abs() < 1e-9);
        assert!((e.yield_metrics.net_yield - 1.16).abs() < 1e-9);
        assert!((e.yield_metrics.margin - 96.666_666).abs() < 1e-3);
        assert!(e.yield_metrics.break_even);
        assert_eq!(e.specs.vcpu_count, Some(96));
        assert_eq!(e.specs.network_performance.as_deref(), Some("400 Gbps"));
    }

    #[test]
    fn scenario_b_availability_only_moves_risk() {
        let low = enrich(&a100(8), now(), ReferenceTables::shared());
        let high = enrich(&a100(1), now(), ReferenceTables::shared());
        assert_eq!(high.interruption_risk, RiskClass::High);
        assert_eq!(high.yield_metrics, low.yield_metrics);
    }

    #[test]
    fn scenario_c_missing_timestamp_is_stale() {
        let mut o = a100(8);
        o.timestamp = None;
        assert_eq!(enrich(&o, now(), ReferenceTables::shared()).data_freshness, Freshness::Stale);
    }

    #[test]
    fn risk_boundaries() {
        let expected = [
            (0, RiskClass::High),
            (1, RiskClass::High),
            (2, RiskClass::Medium),
            (3, RiskClass::Medium),
            (4, RiskClass::Low),
            (64, RiskClass::Low),
        ];
        for (units, risk) in expected {
            assert_eq!(interruption_risk(units), risk, "availability {units}");
        }
    }

    #[test]
    fn freshness_boundaries_and_skew() {
        let n = now();
        assert_eq!(freshness(Some(n - Duration::minutes(59)), n), Freshness::Live);
        assert_eq!(freshness(Some(n - Duration::hours(1)), n), Freshness::Recent);
        assert_eq!(freshness(Some(n - Duration::minutes(359)), n), Freshness::Recent);
        assert_eq!(freshness(Some(n - Duration::hours(6)), n), Freshness::Stale);
        assert_eq!(freshness(Some(n + Duration::minutes(10)), n), Freshness::Live);
    }

    #[test]
    fn zero_price_has_zero_margin() {
        let mut o = a100(8);
        o.usd_hr = 0.0;
        let y = yield_metrics(&o, ReferenceTables::shared());
        assert_eq!(y.margin, 0.0);
        assert!(!y.break_even);
        assert!(y.net_yield < 0.0);
    }

    #[test]
    fn unknown_model_and_region_use_defaults() {
        let mut o = a100(8);
        o.model = "MI300X".into();
        o.region = "sa-east-1".into();
        o.instance_type = "custom.metal".into();
        let e = enrich(&o, now(), ReferenceTables::shared());
        assert!((e.yield_metrics.power_cost_per_hour - 0.036).abs() < 1e-9);
        assert!(!e.has_specs());
    }

    #[test]
    fn enrichment_is_idempotent_and_keeps_core_fields() {
        let tables = ReferenceTables::shared();
        for units in 0..6 {
            let raw = a100(units);
            let once = raw.enrich_at(now(), tables);
            let twice = once.enrich_at(now(), tables);
            assert_eq!(once, twice);
            assert_eq!(twice.offer, raw);
        }
    }
}
