//! # GPU Offer Data Model
//!
//! Strongly-typed representation of the offers that flow through the engine,
//! from the raw market quote received on the wire to the enriched record and the
//! published `Snapshot`.
//!
//! Field names follow the upstream JSON (`usd_hr`, `availability`,
//! `instance_type`, ...) so the same structs deserialize the REST responses and
//! the stream frames without an intermediate mapping layer.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use super::validator::parse_timestamp;

/// # Raw Offer
///
/// One market quote as accepted by the validator. Core fields are never
/// altered by enrichment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawOffer {
    /// GPU model name (e.g. "A100").
    pub model: String,
    /// Hourly price of one GPU unit in USD. Never negative.
    pub usd_hr: f64,
    /// Region code (e.g. "us-east-1").
    pub region: String,
    /// Number of GPU units available on the instance.
    pub availability: u32,
    /// Hardware instance identifier (e.g. "p4d.24xlarge").
    pub instance_type: String,
    /// Provider tag (e.g. "aws_spot").
    pub provider: String,
    /// Price of the whole instance, when reported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_instance_price: Option<f64>,
    /// GPU memory in GB, when reported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_memory_gb: Option<u32>,
    /// Instant the quote was observed upstream.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    /// Marks demo / non-live data.
    #[serde(default)]
    pub synthetic: bool,
}

impl RawOffer {
    /// Key used to collapse duplicate quotes within one batch.
    pub fn dedup_key(&self) -> (&str, &str, &str, &str) {
        (&self.provider, &self.instance_type, &self.region, &self.model)
    }
}

/// Spot interruption risk derived from the available-unit count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskClass {
    /// Four or more units available.
    Low,
    /// Two or three units available.
    Medium,
    /// Fewer than two units available.
    High,
}

/// How recently an offer was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Freshness {
    /// Observed less than one hour ago.
    Live,
    /// Observed less than six hours ago.
    Recent,
    /// Older, or never timestamped.
    Stale,
}

/// Hardware specs looked up by instance identifier.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HardwareSpecs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vcpu_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ram_gb: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_performance: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_gb: Option<u32>,
}

/// Operator economics of running the GPU for one hour.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct YieldMetrics {
    /// Electricity cost of the GPU for one hour, USD.
    pub power_cost_per_hour: f64,
    /// `usd_hr - power_cost_per_hour`.
    pub net_yield: f64,
    /// Net yield as a percentage of the unit price; 0 when the price is 0.
    pub margin: f64,
    /// True when the net yield is strictly positive.
    pub break_even: bool,
}

/// # Enriched Offer
///
/// A `RawOffer` plus the fields derived from it by the enricher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedOffer {
    #[serde(flatten)]
    pub offer: RawOffer,
    pub interruption_risk: RiskClass,
    pub data_freshness: Freshness,
    #[serde(flatten)]
    pub specs: HardwareSpecs,
    pub yield_metrics: YieldMetrics,
}

/// Where the data in a snapshot came from, as far as the feed reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataSourceMode {
    Live,
    Synthetic,
    #[default]
    None,
}

impl DataSourceMode {
    /// Derives the mode from the offers of a batch: empty batches are `None`,
    /// any synthetic record makes the whole batch `Synthetic`.
    pub fn from_offers<'a, I>(offers: I) -> Self
    where
        I: IntoIterator<Item = &'a EnrichedOffer>,
    {
        let mut seen = false;
        for o in offers {
            if o.offer.synthetic {
                return DataSourceMode::Synthetic;
            }
            seen = true;
        }
        if seen { DataSourceMode::Live } else { DataSourceMode::None }
    }
}

impl fmt::Display for DataSourceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DataSourceMode::Live => "live",
            DataSourceMode::Synthetic => "synthetic",
            DataSourceMode::None => "none",
        };
        f.write_str(s)
    }
}

/// Which ingestor produced a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Stream,
    Poll,
}

/// Metadata published together with the offers of a snapshot. Always derived
/// from the offers themselves so counts and sets match the contents.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub total_count: usize,
    pub last_updated: Option<DateTime<Utc>>,
    pub regions: BTreeSet<String>,
    pub models: BTreeSet<String>,
    pub data_source: DataSourceMode,
}

impl SnapshotMetadata {
    /// Builds metadata for `offers` observed at `last_updated`.
    pub fn derive(offers: &[EnrichedOffer], last_updated: Option<DateTime<Utc>>) -> Self {
        Self {
            total_count: offers.len(),
            last_updated,
            regions: offers.iter().map(|o| o.offer.region.clone()).collect(),
            models: offers.iter().map(|o| o.offer.model.clone()).collect(),
            data_source: DataSourceMode::from_offers(offers),
        }
    }
}

/// # Snapshot
///
/// The complete, internally-consistent set of currently-known offers. Once
/// published a snapshot is never mutated; it is replaced as a unit.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Snapshot {
    /// Monotonic count of data publishes; 0 is the empty loading snapshot.
    /// An error update keeps the sequence of the data it accompanies.
    pub sequence: u64,
    /// Ingestor that produced the batch, `None` for the loading snapshot.
    pub origin: Option<SourceKind>,
    pub offers: Vec<EnrichedOffer>,
    pub metadata: SnapshotMetadata,
    /// Last transport failure, carried next to the last good offers until the
    /// next successful publish.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Snapshot {
    /// The empty snapshot held before the first accepted update.
    pub fn empty() -> Self {
        Self::default()
    }

    /// True while nothing has been published yet.
    pub fn is_loading(&self) -> bool {
        self.sequence == 0
    }
}

/// Perspective the upstream applies to the offers it returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ViewType {
    #[default]
    Operator,
    Renter,
}

impl ViewType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ViewType::Operator => "operator",
            ViewType::Renter => "renter",
        }
    }
}

/// # Filter Parameters
///
/// Parameters sent with every poll request and also applied locally to stream
/// batches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FilterParams {
    pub region: Option<String>,
    pub model: Option<String>,
    pub min_availability: Option<u32>,
    pub view_type: ViewType,
    pub include_synthetic: bool,
    pub limit: usize,
}

impl Default for FilterParams {
    fn default() -> Self {
        Self {
            region: None,
            model: None,
            min_availability: None,
            view_type: ViewType::Operator,
            include_synthetic: true,
            limit: 50,
        }
    }
}

impl FilterParams {
    /// Query-string pairs for the REST endpoint. Unset filters are omitted.
    pub fn to_query(&self) -> Vec<(&'static str, String)> {
        let mut q = Vec::with_capacity(6);
        if let Some(r) = &self.region {
            q.push(("region", r.clone()));
        }
        if let Some(m) = &self.model {
            q.push(("model", m.clone()));
        }
        if let Some(a) = self.min_availability {
            q.push(("min_availability", a.to_string()));
        }
        q.push(("view_type", self.view_type.as_str().to_string()));
        q.push(("include_synthetic", self.include_synthetic.to_string()));
        q.push(("limit", self.limit.to_string()));
        q
    }

    /// Applies the filters to a locally received batch, keeping input order.
    pub fn apply(&self, offers: Vec<EnrichedOffer>) -> Vec<EnrichedOffer> {
        offers
            .into_iter()
            .filter(|o| self.region.as_deref().map_or(true, |r| o.offer.region == r))
            .filter(|o| self.model.as_deref().map_or(true, |m| o.offer.model == m))
            .filter(|o| self.min_availability.map_or(true, |a| o.offer.availability >= a))
            .filter(|o| self.include_synthetic || !o.offer.synthetic)
            .take(self.limit)
            .collect()
    }
}

/// Metadata block of the REST prices response.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResponseMetadata {
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub last_updated: Option<DateTime<Utc>>,
    #[serde(default)]
    pub regions_available: Vec<String>,
    #[serde(default)]
    pub models_available: Vec<String>,
    /// Mode claimed by the upstream; the snapshot derives its own.
    #[serde(default)]
    pub data_source: Option<String>,
}

/// Batch-level timestamps accept the same forms as record timestamps; anything
/// else reads as absent instead of failing the whole body.
fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(parse_timestamp))
}

/// Body of `GET /api/{feed}/prices`. Offers stay untyped until validated.
#[derive(Debug, Clone, Deserialize)]
pub struct PricesResponse {
    #[serde(default)]
    pub offers: Vec<serde_json::Value>,
    #[serde(default)]
    pub total_count: u64,
    #[serde(default)]
    pub metadata: ResponseMetadata,
}

/// One frame of the push stream.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamFrame {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub offers: Vec<serde_json::Value>,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, rename = "dataSource")]
    pub data_source: Option<String>,
}

/// Entry of the auxiliary region list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionInfo {
    pub code: String,
    pub name: String,
    #[serde(default = "default_true")]
    pub available: bool,
}

/// Entry of the auxiliary model list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    #[serde(default = "default_true")]
    pub available: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegionsResponse {
    #[serde(default)]
    pub regions: Vec<RegionInfo>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelsResponse {
    #[serde(default)]
    pub models: Vec<ModelInfo>,
}

/// Min / max pair used by the summary endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PriceRange {
    pub min: f64,
    pub max: f64,
}

/// Body of `GET /api/{feed}/summary`, the low-frequency aggregate view.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MarketSummary {
    #[serde(default)]
    pub total_offers: u64,
    #[serde(default)]
    pub unique_models: u64,
    #[serde(default)]
    pub unique_regions: u64,
    #[serde(default)]
    pub price_range: PriceRange,
    #[serde(default)]
    pub avg_price: f64,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub last_updated: Option<DateTime<Utc>>,
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default)]
    pub regions: Vec<String>,
}
