use lib_common::engine::EngineStatus;
use lib_common::markets::gpu::{
    EnrichedOffer, FilterParams, OfferQuery, OfferStats, Snapshot, SnapshotMetadata, SortKey,
};
use serde::{Deserialize, Serialize};

/// Requests a downstream client may send over the socket.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum ClientMessage {
    Refresh,
    SetFilters { filters: FilterParams },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage<'a> {
    Snapshot(&'a Snapshot),
    Status(EngineStatus),
    Error { message: String },
}

/// Query string of `GET /snapshot` and `GET /stats`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SnapshotParams {
    pub q: Option<String>,
    pub max_price: Option<f64>,
    pub sort: Option<String>,
    #[serde(default)]
    pub desc: bool,
}

impl SnapshotParams {
    pub fn to_query(&self) -> Result<OfferQuery, String> {
        let sort = match &self.sort {
            Some(s) => s.parse::<SortKey>()?,
            None => SortKey::default(),
        };
        Ok(OfferQuery {
            search: self.q.clone(),
            max_price: self.max_price,
            sort,
            descending: self.desc,
        })
    }
}

/// Body of `GET /snapshot`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotView<'a> {
    pub sequence: u64,
    pub loading: bool,
    /// Last transport failure, shown next to the last good offers.
    pub error: Option<&'a str>,
    pub metadata: &'a SnapshotMetadata,
    pub offers: Vec<&'a EnrichedOffer>,
}

/// Body of `GET /stats`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsView {
    pub sequence: u64,
    pub stats: OfferStats,
}
