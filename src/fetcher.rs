//! Remote source of feature flags.
use std::{
    future::Future,
    sync::atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use reqwest::{StatusCode, Url};

use crate::{Error, FlagSet, Result};

/// Fetches the authoritative flag set, usually over the network.
///
/// Any error is treated by the pipeline as "no value from remote", never as fatal.
///
/// Implemented for async closures:
///
/// ```
/// # use feature_flags::{FetchFeatureGating, FlagSet};
/// fn assert_fetcher(_: impl FetchFeatureGating) {}
///
/// assert_fetcher(|| async { Ok::<_, feature_flags::Error>(FlagSet::new()) });
/// ```
#[async_trait]
pub trait FetchFeatureGating: Send + Sync {
    /// Fetch the current flag set.
    async fn fetch_feature_gating(&self) -> Result<FlagSet>;
}

#[async_trait]
impl<F, Fut> FetchFeatureGating for F
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<FlagSet>> + Send,
{
    async fn fetch_feature_gating(&self) -> Result<FlagSet> {
        self().await
    }
}

/// Configuration for [`HttpFetcher`].
#[derive(Debug, Clone)]
pub struct HttpFetcherConfig {
    /// Base URL; the feature gating endpoint is appended to it.
    pub base_url: String,
    /// API key sent as the `apiKey` query parameter.
    pub api_key: String,
}

impl HttpFetcherConfig {
    /// Default base URL for API calls.
    pub const DEFAULT_BASE_URL: &'static str = "http://localhost:8080/api";

    /// Create a configuration for the default base URL.
    pub fn from_api_key(api_key: impl Into<String>) -> HttpFetcherConfig {
        HttpFetcherConfig {
            base_url: HttpFetcherConfig::DEFAULT_BASE_URL.to_owned(),
            api_key: api_key.into(),
        }
    }

    /// Override base URL for API calls.
    pub fn base_url(mut self, base_url: impl Into<String>) -> HttpFetcherConfig {
        self.base_url = base_url.into();
        self
    }
}

const FEATURE_GATING_ENDPOINT: &str = "/feature-gating";

/// A [`FetchFeatureGating`] that requests the flag set from an HTTP endpoint.
///
/// The endpoint must answer with a flat JSON object of booleans.
pub struct HttpFetcher {
    // Client holds a connection pool internally, so we're reusing the client between requests.
    client: reqwest::Client,
    url: Url,
    /// If we receive a 401 Unauthorized error during a request, it means the API key is not
    /// valid. We cache this error so we don't issue additional requests to the server.
    unauthorized: AtomicBool,
}

impl HttpFetcher {
    /// Create a fetcher.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidBaseUrl`] if `base_url` cannot be parsed.
    pub fn new(config: HttpFetcherConfig) -> Result<HttpFetcher> {
        let url = Url::parse_with_params(
            &format!("{}{}", config.base_url, FEATURE_GATING_ENDPOINT),
            &[
                ("apiKey", &*config.api_key),
                ("sdkVersion", env!("CARGO_PKG_VERSION")),
            ],
        )
        .map_err(Error::InvalidBaseUrl)?;

        Ok(HttpFetcher {
            client: reqwest::Client::new(),
            url,
            unauthorized: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl FetchFeatureGating for HttpFetcher {
    async fn fetch_feature_gating(&self) -> Result<FlagSet> {
        if self.unauthorized.load(Ordering::Relaxed) {
            return Err(Error::Unauthorized);
        }

        log::debug!(target: "feature_flags", "fetching feature gating");
        let response = self.client.get(self.url.clone()).send().await?;

        let response = response.error_for_status().map_err(|err| {
            if err.status() == Some(StatusCode::UNAUTHORIZED) {
                log::warn!(target: "feature_flags", "client is not authorized. Check your API key");
                self.unauthorized.store(true, Ordering::Relaxed);
                Error::Unauthorized
            } else {
                log::warn!(target: "feature_flags", "received non-200 response while fetching feature gating: {:?}", err);
                Error::from(err)
            }
        })?;

        let body: serde_json::Value = response.json().await?;
        let flags = FlagSet::from_value(body)?;

        log::debug!(target: "feature_flags", flag_count = flags.len(); "successfully fetched feature gating");
        Ok(flags)
    }
}
