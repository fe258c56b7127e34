use std::{sync::Arc, time::Duration};

use crate::{Error, FetchFeatureGating, Result};

/// Caller-supplied configuration for [`FlagClient::pull_feature_flags`][crate::FlagClient::pull_feature_flags].
///
/// Every field is optional; fields left as `None` fall back to defaults. Only
/// [`fetch_feature_gating`](PullConfig::fetch_feature_gating) is mandatory.
///
/// # Examples
/// ```
/// # use std::time::Duration;
/// # use feature_flags::{FlagSet, PullConfig};
/// let config = PullConfig::new()
///     .fetch_feature_gating(|| async { Ok::<_, feature_flags::Error>(FlagSet::new()) })
///     .timeout(Duration::from_secs(3))
///     .strict(true);
/// ```
#[derive(Clone, Default)]
pub struct PullConfig {
    /// How long to wait for a good source before bailing out.
    pub timeout: Option<Duration>,
    /// Fail instead of falling back to an empty flag set when every source times out.
    pub strict: Option<bool>,
    /// Delay before pulling again after a low-confidence result.
    pub polling_interval: Option<Duration>,
    /// Random amount subtracted from each polling delay.
    pub polling_jitter: Option<Duration>,
    /// Remote source of flags.
    pub fetch_feature_gating: Option<Arc<dyn FetchFeatureGating>>,
}

impl PullConfig {
    /// Default value for [`PullConfig::timeout`].
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(2000);
    /// Default value for [`PullConfig::polling_interval`].
    pub const DEFAULT_POLLING_INTERVAL: Duration = Duration::from_millis(5000);
    /// Default value for [`PullConfig::polling_jitter`].
    pub const DEFAULT_POLLING_JITTER: Duration = Duration::ZERO;
    /// Lower bound applied to the timeout when the pipeline runs.
    pub const MIN_TIMEOUT: Duration = Duration::from_millis(1000);

    /// Create an empty configuration.
    pub fn new() -> PullConfig {
        PullConfig::default()
    }

    /// Set the remote source of flags.
    pub fn fetch_feature_gating(mut self, fetcher: impl FetchFeatureGating + 'static) -> PullConfig {
        self.fetch_feature_gating = Some(Arc::new(fetcher));
        self
    }

    /// Update timeout with `timeout`.
    pub fn timeout(mut self, timeout: Duration) -> PullConfig {
        self.timeout = Some(timeout);
        self
    }

    /// Update strict mode with `strict`.
    pub fn strict(mut self, strict: bool) -> PullConfig {
        self.strict = Some(strict);
        self
    }

    /// Update polling interval with `interval`.
    pub fn polling_interval(mut self, interval: Duration) -> PullConfig {
        self.polling_interval = Some(interval);
        self
    }

    /// Update polling jitter with `jitter`.
    pub fn polling_jitter(mut self, jitter: Duration) -> PullConfig {
        self.polling_jitter = Some(jitter);
        self
    }

    /// Merge the supplied fields over the defaults.
    ///
    /// # Errors
    ///
    /// - [`Error::MissingFetcher`] if no fetcher was supplied.
    pub fn normalize(&self) -> Result<PullFeatureFlagsParams> {
        let fetch_feature_gating = self
            .fetch_feature_gating
            .clone()
            .ok_or(Error::MissingFetcher)?;

        Ok(PullFeatureFlagsParams {
            timeout: self.timeout.unwrap_or(PullConfig::DEFAULT_TIMEOUT),
            strict: self.strict.unwrap_or(false),
            polling_interval: self
                .polling_interval
                .unwrap_or(PullConfig::DEFAULT_POLLING_INTERVAL),
            polling_jitter: self
                .polling_jitter
                .unwrap_or(PullConfig::DEFAULT_POLLING_JITTER),
            fetch_feature_gating,
        })
    }
}

impl std::fmt::Debug for PullConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PullConfig")
            .field("timeout", &self.timeout)
            .field("strict", &self.strict)
            .field("polling_interval", &self.polling_interval)
            .field("polling_jitter", &self.polling_jitter)
            .field("fetch_feature_gating", &self.fetch_feature_gating.is_some())
            .finish()
    }
}

/// Normalized configuration of a single pipeline run.
#[derive(Clone)]
pub struct PullFeatureFlagsParams {
    /// Configured timeout, before [`PullConfig::MIN_TIMEOUT`] is applied.
    pub timeout: Duration,
    /// See [`PullConfig::strict`].
    pub strict: bool,
    /// See [`PullConfig::polling_interval`].
    pub polling_interval: Duration,
    /// See [`PullConfig::polling_jitter`].
    pub polling_jitter: Duration,
    /// Remote source of flags.
    pub fetch_feature_gating: Arc<dyn FetchFeatureGating>,
}

impl PullFeatureFlagsParams {
    /// The timeout the race actually uses: never below [`PullConfig::MIN_TIMEOUT`].
    pub fn effective_timeout(&self) -> Duration {
        self.timeout.max(PullConfig::MIN_TIMEOUT)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::FlagSet;

    fn with_fetcher() -> PullConfig {
        PullConfig::new().fetch_feature_gating(|| async { Ok::<_, Error>(FlagSet::new()) })
    }

    #[test]
    fn missing_fetcher_fails_fast() {
        assert!(matches!(
            PullConfig::new().normalize(),
            Err(Error::MissingFetcher)
        ));
    }

    #[test]
    fn defaults_fill_unset_fields() {
        let params = with_fetcher().normalize().unwrap();

        assert_eq!(params.timeout, Duration::from_millis(2000));
        assert!(!params.strict);
        assert_eq!(params.polling_interval, Duration::from_millis(5000));
        assert_eq!(params.polling_jitter, Duration::ZERO);
    }

    #[test]
    fn explicit_none_means_default() {
        let config = PullConfig {
            timeout: None,
            strict: None,
            ..with_fetcher()
        };

        assert_eq!(
            config.normalize().unwrap().timeout,
            PullConfig::DEFAULT_TIMEOUT
        );
    }

    #[test]
    fn supplied_fields_override_defaults() {
        let params = with_fetcher()
            .timeout(Duration::from_millis(3000))
            .strict(true)
            .polling_interval(Duration::from_secs(60))
            .normalize()
            .unwrap();

        assert_eq!(params.timeout, Duration::from_millis(3000));
        assert!(params.strict);
        assert_eq!(params.polling_interval, Duration::from_secs(60));
    }

    #[test]
    fn effective_timeout_has_a_floor() {
        let params = with_fetcher().timeout(Duration::ZERO).normalize().unwrap();
        assert_eq!(params.effective_timeout(), Duration::from_millis(1000));

        let params = with_fetcher()
            .timeout(Duration::from_millis(2500))
            .normalize()
            .unwrap();
        assert_eq!(params.effective_timeout(), Duration::from_millis(2500));
    }
}
