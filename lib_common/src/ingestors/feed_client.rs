//! # Feed REST Client
//!
//! Typed access to the REST side of one feed:
//!
//! - `GET /api/{feed}/prices?region=&model=&min_availability=&view_type=&include_synthetic=&limit=`
//! - `GET /api/{feed}/summary`
//! - `GET /api/{feed}/regions`, `GET /api/{feed}/models`
//!
//! Two `ApiClient`s are kept. The prices client has middleware retries
//! disabled because `PollSource` runs its own attempt loop; the auxiliary
//! client keeps the middleware default.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use super::SourceError;
use crate::configs::EngineConfig;
use crate::markets::gpu::model::{
    FilterParams, MarketSummary, ModelInfo, ModelsResponse, PricesResponse,
    RegionInfo, RegionsResponse,
};
use crate::markets::gpu::reference::ReferenceTables;
use crate::retrieve::ky_http::{ApiClient, ClientOptions};

/// Untyped result of one prices request.
#[derive(Debug, Clone)]
pub struct PollBatch {
    pub offers: Vec<Value>,
    pub last_updated: Option<DateTime<Utc>>,
    /// Data source the upstream claims for the batch.
    pub data_source: Option<String>,
}

/// Region and model lists for filter controls.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Catalog {
    pub regions: Vec<RegionInfo>,
    pub models: Vec<ModelInfo>,
    /// True when either list came from the built-in fallback.
    pub fallback: bool,
}

impl Catalog {
    /// The built-in catalog.
    pub fn fallback() -> Self {
        let tables = ReferenceTables::shared();
        Self {
            regions: tables.fallback_regions(),
            models: tables.fallback_models(),
            fallback: true,
        }
    }
}

#[derive(Clone)]
pub struct FeedClient {
    prices: ApiClient,
    aux: ApiClient,
    prices_path: String,
    summary_path: String,
    regions_path: String,
    models_path: String,
}

impl FeedClient {
    pub fn new(config: &EngineConfig) -> Result<Self, SourceError> {
        let timeout = config.request_timeout;
        let prices = ApiClient::with_options(
            &config.base_url,
            ClientOptions { max_retries: 0, timeout, ..ClientOptions::default() },
        )?;
        let aux = ApiClient::with_options(
            &config.base_url,
            ClientOptions { timeout, ..ClientOptions::default() },
        )?;

        Ok(Self {
            prices,
            aux,
            prices_path: config.endpoint("prices"),
            summary_path: config.endpoint("summary"),
            regions_path: config.endpoint("regions"),
            models_path: config.endpoint("models"),
        })
    }

    /// One prices request with `filters` as the query string. No retries.
    pub async fn fetch_prices(&self, filters: &FilterParams) -> Result<PollBatch, SourceError> {
        let body: PricesResponse = get(&self.prices, &self.prices_path, &filters.to_query()).await?;
        if body.total_count > body.offers.len() as u64 {
            log::debug!("Upstream reports {} offers, sent {}", body.total_count, body.offers.len());
        }
        Ok(PollBatch {
            offers: body.offers,
            last_updated: body.metadata.last_updated,
            data_source: body.metadata.data_source,
        })
    }

    pub async fn fetch_summary(&self) -> Result<MarketSummary, SourceError> {
        get(&self.aux, &self.summary_path, &[]).await
    }

    pub async fn fetch_regions(&self) -> Result<Vec<RegionInfo>, SourceError> {
        let body: RegionsResponse = get(&self.aux, &self.regions_path, &[]).await?;
        Ok(body.regions)
    }

    pub async fn fetch_models(&self) -> Result<Vec<ModelInfo>, SourceError> {
        let body: ModelsResponse = get(&self.aux, &self.models_path, &[]).await?;
        Ok(body.models)
    }

    /// Regions and models, each falling back to the built-in list on failure
    /// or when the upstream returns an empty list.
    pub async fn fetch_catalog(&self) -> Catalog {
        let (regions, models) = tokio::join!(self.fetch_regions(), self.fetch_models());
        let tables = ReferenceTables::shared();
        let mut fallback = false;

        let regions = match regions {
            Ok(r) if !r.is_empty() => r,
            Ok(_) => {
                fallback = true;
                tables.fallback_regions()
            }
            Err(e) => {
                log::warn!("Region list unavailable, using built-in list: {}", e);
                fallback = true;
                tables.fallback_regions()
            }
        };
        let models = match models {
            Ok(m) if !m.is_empty() => m
                .into_iter()
                .map(|mut m| {
                    if m.category.is_none() {
                        m.category = Some(tables.model_category(&m.name).to_string());
                    }
                    m
                })
                .collect(),
            Ok(_) => {
                fallback = true;
                tables.fallback_models()
            }
            Err(e) => {
                log::warn!("Model list unavailable, using built-in list: {}", e);
                fallback = true;
                tables.fallback_models()
            }
        };

        Catalog { regions, models, fallback }
    }
}

async fn get<T: DeserializeOwned>(
    client: &ApiClient,
    path: &str,
    query: &[(&str, String)],
) -> Result<T, SourceError> {
    let response = client.get_json::<T>(path, query).await?;
    if !response.success {
        return Err(SourceError::Status {
            status: response.status,
            body: response.error_body.unwrap_or_default(),
        });
    }
    response
        .data
        .ok_or_else(|| SourceError::Decode(format!("empty body from {}", path)))
}
