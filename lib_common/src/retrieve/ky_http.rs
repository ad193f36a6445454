//! # HTTP Retrieval Utilities
//!
//! An asynchronous API client wrapper around `reqwest`, with optional
//! exponential-backoff retry middleware and standardized JSON response
//! handling.
//!
//! Callers that own their retry policy (the offer poller retries on a fixed
//! spacing and logs every attempt) build the client with `max_retries: 0`;
//! one-shot fetches keep the middleware default of 3.

use std::time::Duration;

use reqwest::{header::HeaderMap, Method, Url};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use serde::de::DeserializeOwned;

/// A standardized container for API responses.
///
/// Wraps the deserialized data along with the status code and headers of the
/// HTTP transaction.
#[derive(Debug)]
pub struct ApiResponse<T> {
    /// The successfully deserialized response body, if any.
    pub data: Option<T>,
    /// The raw error body returned by the server if the request failed.
    pub error_body: Option<String>,
    /// The numeric HTTP status code.
    pub status: u16,
    /// Indicates if the status code was in the 2xx range.
    pub success: bool,
    /// The headers returned by the server.
    pub headers: HeaderMap,
}

/// Construction options for `ApiClient`.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Transient-failure retries performed by the middleware. `0` disables it.
    pub max_retries: u32,
    /// Per-request timeout.
    pub timeout: Duration,
    /// Value of the `User-Agent` header.
    pub user_agent: String,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            timeout: Duration::from_secs(10),
            user_agent: concat!("gpu-offers/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// A flexible asynchronous HTTP client.
///
/// Built on top of `reqwest_middleware`, it handles base URLs, query strings
/// and automatic retries.
#[derive(Clone)]
pub struct ApiClient {
    inner: ClientWithMiddleware,
    base_url: Url,
}

impl ApiClient {
    /// Creates a client with the default options.
    ///
    /// # Errors
    /// Fails if `base_url` is not an absolute URL.
    pub fn new(base_url: &str) -> anyhow::Result<Self> {
        Self::with_options(base_url, ClientOptions::default())
    }

    /// Creates a client with explicit retry and timeout settings.
    pub fn with_options(base_url: &str, options: ClientOptions) -> anyhow::Result<Self> {
        let mut url = Url::parse(base_url)?;
        // `Url::join` drops the last segment unless the base ends with '/'.
        if !url.path().ends_with('/') {
            let path = format!("{}/", url.path());
            url.set_path(&path);
        }

        let http = reqwest::Client::builder()
            .timeout(options.timeout)
            .user_agent(options.user_agent)
            .build()?;

        let mut builder = ClientBuilder::new(http);
        if options.max_retries > 0 {
            let retry_policy =
                ExponentialBackoff::builder().build_with_max_retries(options.max_retries);
            builder = builder.with(RetryTransientMiddleware::new_with_policy(retry_policy));
        }

        Ok(Self {
            inner: builder.build(),
            base_url: url,
        })
    }

    /// The normalized base URL (always ends with `/`).
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Performs a generic HTTP request and handles the response.
    ///
    /// `path` is joined to the base URL (leading `/` is ignored so the base
    /// path is kept). Non-2xx responses are returned with `success: false`
    /// and the raw body in `error_body`, not as an `Err`.
    ///
    /// # Errors
    /// Returns an error if URL joining, the network round-trip or body
    /// deserialization fails.
    pub async fn request<T>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
    ) -> anyhow::Result<ApiResponse<T>>
    where
        T: DeserializeOwned,
    {
        let full_url = self.base_url.join(path.trim_start_matches('/'))?;
        let mut req = self.inner.request(method, full_url);

        if !query.is_empty() {
            req = req.query(query);
        }

        let response: reqwest::Response = req.send().await?;
        let status = response.status();
        let resp_headers = response.headers().clone();

        if status.is_success() {
            let data = response.json::<T>().await?;
            Ok(ApiResponse {
                data: Some(data),
                error_body: None,
                status: status.as_u16(),
                success: true,
                headers: resp_headers,
            })
        } else {
            let error_text = response.text().await.ok();
            Ok(ApiResponse {
                data: None,
                error_body: error_text,
                status: status.as_u16(),
                success: false,
                headers: resp_headers,
            })
        }
    }

    /// `GET path?query` deserialized as `T`.
    pub async fn get_json<T>(&self, path: &str, query: &[(&str, String)]) -> anyhow::Result<ApiResponse<T>>
    where
        T: DeserializeOwned,
    {
        self.request::<T>(Method::GET, path, query).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_gets_trailing_slash() {
        let c = ApiClient::new("http://127.0.0.1:8080/proxy").unwrap();
        assert_eq!(c.base_url().as_str(), "http://127.0.0.1:8080/proxy/");
        let joined = c.base_url().join("api/aws-spot/prices").unwrap();
        assert_eq!(joined.as_str(), "http://127.0.0.1:8080/proxy/api/aws-spot/prices");
    }

    #[test]
    fn relative_base_url_is_rejected() {
        assert!(ApiClient::new("api/aws-spot").is_err());
    }
}
