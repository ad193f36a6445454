//! # GPU Offer Market
//!
//! Everything that is pure in the offer pipeline: the data model, the static
//! reference tables, record validation, enrichment and the query engine.
//! None of these modules perform I/O or hold state, so they are usable from
//! the engine runtime, the servers and tests alike.
//!
//! ## Contained Modules:
//!
//! - **`model`**: `RawOffer`, `EnrichedOffer`, `Snapshot` and the wire types of
//!   the REST and stream endpoints.
//! - **`reference`**: instance specs, power costs, GPU power draw and region
//!   display names.
//! - **`validator`**: untyped record → `RawOffer`, with batch de-duplication.
//! - **`enricher`**: `RawOffer` + instant → `EnrichedOffer`.
//! - **`query`**: filtering, sorting and aggregates over a snapshot.

#![forbid(unsafe_code)]

pub mod enricher;
pub mod model;
pub mod query;
pub mod reference;
pub mod validator;

pub use enricher::{enrich, enrich_batch, Enrich};
pub use model::{
    DataSourceMode, EnrichedOffer, FilterParams, Freshness, MarketSummary, ModelInfo, RawOffer,
    RegionInfo, RiskClass, Snapshot, SnapshotMetadata, SourceKind, ViewType,
};
pub use query::{OfferQuery, OfferStats, SortKey};
pub use reference::ReferenceTables;
pub use validator::{validate, validate_batch, BatchOutcome};
