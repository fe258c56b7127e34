use std::sync::Arc;

/// Represents a result type for operations in this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Enum representing possible errors that can occur while acquiring feature flags.
///
/// Only [`Error::MissingFetcher`] and [`Error::Timeout`] (in strict mode) are ever returned from
/// [`FlagClient::pull_feature_flags`](crate::FlagClient::pull_feature_flags). All other variants
/// are produced by individual sources and get downgraded to "this source has no value".
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// `fetch_feature_gating` was not provided in [`PullConfig`](crate::PullConfig).
    #[error("fetch_feature_gating is required")]
    MissingFetcher,

    /// No source produced flags before the timeout and strict mode is on.
    #[error("Fetch Feature Flags timeout.")]
    Timeout,

    /// Flags were read before the storage was initialized.
    #[error("feature flags are read before initialization")]
    NotInitialized,

    /// The bootstrap promise was rejected (or its resolver went away without settling).
    #[error("context promise rejected: {0}")]
    ContextRejected(String),

    /// A value that should be a flag set contains a non-boolean value.
    #[error("value is not a flat object of booleans")]
    InvalidFlagShape,

    /// Invalid base URL configuration.
    #[error("invalid base_url configuration")]
    InvalidBaseUrl(#[source] url::ParseError),

    /// The request was unauthorized, possibly due to an invalid API key.
    #[error("unauthorized, api_key is likely invalid")]
    Unauthorized,

    /// An I/O error.
    #[error(transparent)]
    // std::io::Error is not clonable, so we're wrapping it in an Arc.
    Io(Arc<std::io::Error>),

    /// JSON (de)serialization error.
    #[error(transparent)]
    Json(Arc<serde_json::Error>),

    /// Network error.
    #[error(transparent)]
    Network(Arc<reqwest::Error>),
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(Arc::new(value))
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(Arc::new(value))
    }
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        Error::Network(Arc::new(value.without_url()))
    }
}
