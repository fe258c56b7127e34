use std::sync::Arc;

use tokio::time::Instant;

#[cfg(doc)]
use crate::Error;
use crate::{
    config::PullConfig,
    context::FlagContext,
    persist_cache::{MemoryStore, PersistCache},
    pipeline::{run_pipeline, Sources, WorkResult, WorkSource},
    poller::Poller,
    storage::FeatureFlagStorage,
    FlagSet, Result,
};

/// A client that resolves feature flags and keeps them in a [`FeatureFlagStorage`].
///
/// The host application owns the storage and shares it with the client and with consumers.
/// Cloning a client is cheap; clones share the storage, the sources and the polling state.
///
/// # Examples
/// ```no_run
/// # use std::sync::Arc;
/// # use feature_flags::{FeatureFlagStorage, FlagClient, FlagSet, PullConfig};
/// # async fn test() -> feature_flags::Result<()> {
/// let storage = Arc::new(FeatureFlagStorage::new());
/// let client = FlagClient::new(storage.clone());
///
/// client
///     .pull_feature_flags(PullConfig::new().fetch_feature_gating(|| async {
///         Ok::<_, feature_flags::Error>(FlagSet::new())
///     }))
///     .await?;
///
/// let enabled = storage.get_flags()?.get("new-editor");
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct FlagClient {
    storage: Arc<FeatureFlagStorage>,
    sources: Sources,
    poller: Poller,
}

impl FlagClient {
    /// Create a client writing into `storage`, with no bootstrap context and an in-memory cache.
    pub fn new(storage: Arc<FeatureFlagStorage>) -> FlagClient {
        FlagClient {
            storage,
            sources: Sources {
                context: Arc::new(FlagContext::new()),
                cache: PersistCache::new(Arc::new(MemoryStore::new())),
            },
            poller: Poller::new(),
        }
    }

    /// Read bootstrap values from `context`.
    pub fn with_context(mut self, context: Arc<FlagContext>) -> FlagClient {
        self.sources.context = context;
        self
    }

    /// Persist resolved flags with `cache`.
    pub fn with_cache(mut self, cache: PersistCache) -> FlagClient {
        self.sources.cache = cache;
        self
    }

    /// Storage the client writes into.
    pub fn storage(&self) -> &Arc<FeatureFlagStorage> {
        &self.storage
    }

    /// Resolve flags from the fastest available source and store them.
    ///
    /// If the flags came from a low-confidence source ([`WorkSource::Persist`] or
    /// [`WorkSource::Bailout`]), another pull is scheduled in the background after the polling
    /// interval, and repeated until a better source answers. The returned future does not wait
    /// for those retries. [`FlagClient::stop_polling`] ends retries of pulls started before it;
    /// later pulls schedule their own.
    ///
    /// In non-strict mode a total failure stores an empty flag set and is reported as a
    /// [`WorkSource::Bailout`] result.
    ///
    /// # Errors
    ///
    /// - [`Error::MissingFetcher`] if `config` has no fetcher. Nothing else is started.
    /// - [`Error::Timeout`] in strict mode if no source answered in time. The storage is left
    ///   untouched and no retry is scheduled.
    pub async fn pull_feature_flags(&self, config: PullConfig) -> Result<WorkResult> {
        let generation = self.poller.generation();
        let result = self.pull_once(&config).await?;

        if result.source.is_low_confidence() {
            self.schedule_retry(config, generation);
        }

        Ok(result)
    }

    /// Stop background retries of pulls started so far. Flags that are already stored stay in
    /// place.
    pub fn stop_polling(&self) {
        log::debug!(target: "feature_flags", "stopping background pulls");
        self.poller.stop();
    }

    async fn pull_once(&self, config: &PullConfig) -> Result<WorkResult> {
        let params = config.normalize()?;

        let start = Instant::now();
        log::debug!(target: "feature_flags", "start");

        match run_pipeline(&params, &self.sources).await {
            Ok(result) => {
                log::info!(target: "feature_flags",
                    source = result.source.as_str(),
                    flag_count = result.values.len(),
                    elapsed_ms = start.elapsed().as_millis() as u64;
                    "feature flags resolved");
                let values = &result.values;
                log::trace!(target: "feature_flags", values:serde; "resolved flag values");
                self.storage.set_flags(result.values.clone());
                Ok(result)
            }
            Err(err) if !params.strict => {
                log::error!(target: "feature_flags", "failed to resolve feature flags, using defaults: {err}");
                let result = WorkResult::new(FlagSet::new(), WorkSource::Bailout);
                self.storage.set_flags(result.values.clone());
                Ok(result)
            }
            Err(err) => {
                log::error!(target: "feature_flags", "failed to resolve feature flags: {err}");
                Err(err)
            }
        }
    }

    fn schedule_retry(&self, config: PullConfig, generation: u64) {
        // `config` was normalized successfully by the caller already.
        let Ok(params) = config.normalize() else {
            return;
        };

        let client = self.clone();
        tokio::spawn(async move {
            loop {
                if !client
                    .poller
                    .wait(generation, params.polling_interval, params.polling_jitter)
                    .await
                {
                    log::debug!(target: "feature_flags", "background pulls stopped");
                    return;
                }

                match client.pull_once(&config).await {
                    Ok(result) if result.source.is_low_confidence() => {
                        log::debug!(target: "feature_flags", source = result.source.as_str(); "flags are still low-confidence, pulling again later");
                    }
                    Ok(_) => return,
                    Err(err) => {
                        log::error!(target: "feature_flags", "background pull failed: {err}");
                        return;
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use super::*;
    use crate::{persist_cache::KeyValueStore, Error};

    fn flags(values: &[(&str, bool)]) -> FlagSet {
        values.iter().map(|(k, v)| (*k, *v)).collect()
    }

    struct Setup {
        client: FlagClient,
        store: Arc<MemoryStore>,
        fetches: Arc<AtomicUsize>,
        changes: Arc<AtomicUsize>,
    }

    fn setup() -> Setup {
        let _ = env_logger::builder().is_test(true).try_init();

        let storage = Arc::new(FeatureFlagStorage::new());
        let changes = Arc::new(AtomicUsize::new(0));
        {
            let changes = changes.clone();
            storage.on(move |_| {
                changes.fetch_add(1, Ordering::SeqCst);
            });
        }

        let store = Arc::new(MemoryStore::new());
        let client = FlagClient::new(storage).with_cache(PersistCache::new(store.clone()));

        Setup {
            client,
            store,
            fetches: Arc::new(AtomicUsize::new(0)),
            changes,
        }
    }

    impl Setup {
        /// A fetcher that fails for the first `failures` calls, then answers `values`.
        fn fetcher(&self, failures: usize, values: FlagSet) -> PullConfig {
            let fetches = self.fetches.clone();
            PullConfig::new().fetch_feature_gating(move || {
                let call = fetches.fetch_add(1, Ordering::SeqCst);
                let values = values.clone();
                async move {
                    if call < failures {
                        Err(Error::from(std::io::Error::other("offline")))
                    } else {
                        Ok(values)
                    }
                }
            })
        }

        fn seed_cache(&self, values: &FlagSet) {
            let cache = PersistCache::new(self.store.clone());
            self.store
                .set_item(cache.key(), &serde_json::to_string(values).unwrap())
                .unwrap();
        }

        fn fetches(&self) -> usize {
            self.fetches.load(Ordering::SeqCst)
        }

        fn changes(&self) -> usize {
            self.changes.load(Ordering::SeqCst)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn remote_flags_end_up_in_storage() {
        let setup = setup();

        let result = setup
            .client
            .pull_feature_flags(setup.fetcher(0, flags(&[("foo", true)])))
            .await
            .unwrap();

        assert_eq!(result.source, WorkSource::Remote);
        let view = setup.client.storage().get_flags().unwrap();
        assert!(view.get("foo"));
        assert_eq!(view.keys(), vec!["foo".to_owned()]);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_fetcher_fails_before_any_work() {
        let setup = setup();

        let result = setup.client.pull_feature_flags(PullConfig::new()).await;

        assert!(matches!(result, Err(Error::MissingFetcher)));
        assert!(!setup.client.storage().is_inited());
    }

    #[tokio::test(start_paused = true)]
    async fn strict_timeout_leaves_storage_untouched() {
        let setup = setup();

        let result = setup
            .client
            .pull_feature_flags(
                setup
                    .fetcher(usize::MAX, FlagSet::new())
                    .strict(true)
                    .timeout(Duration::from_millis(1000)),
            )
            .await;

        assert!(matches!(result, Err(Error::Timeout)));
        assert!(!setup.client.storage().is_inited());
        assert_eq!(setup.changes(), 0);

        // No retry in strict mode.
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(setup.fetches(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn persisted_flags_are_replaced_by_a_later_pull() {
        let setup = setup();
        setup.seed_cache(&flags(&[("foo", false)]));

        let result = setup
            .client
            .pull_feature_flags(
                setup
                    .fetcher(1, flags(&[("foo", true)]))
                    .polling_interval(Duration::from_secs(5)),
            )
            .await
            .unwrap();

        assert_eq!(result.source, WorkSource::Persist);
        assert!(!setup.client.storage().get_flags().unwrap().get("foo"));
        assert_eq!(setup.changes(), 1);
        assert_eq!(setup.fetches(), 1);

        // One more pull after the polling interval.
        tokio::time::sleep(Duration::from_millis(5100)).await;
        assert_eq!(setup.fetches(), 2);
        assert!(setup.client.storage().get_flags().unwrap().get("foo"));
        assert_eq!(setup.changes(), 2);

        // The remote answer is high-confidence, so polling stops.
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(setup.fetches(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn bailout_stores_empty_flags_and_keeps_retrying() {
        let setup = setup();

        let result = setup
            .client
            .pull_feature_flags(setup.fetcher(usize::MAX, FlagSet::new()))
            .await
            .unwrap();

        assert_eq!(result.source, WorkSource::Bailout);
        let view = setup.client.storage().get_flags().unwrap();
        assert!(view.is_inited());
        assert!(!view.get("foo"));

        // Retries run every polling interval plus the bailout delay.
        tokio::time::sleep(Duration::from_secs(15)).await;
        assert!(setup.fetches() >= 3, "{} fetches", setup.fetches());
        // Identical empty results don't notify again.
        assert_eq!(setup.changes(), 1);

        setup.client.stop_polling();
        let fetches = setup.fetches();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(setup.fetches(), fetches);
    }

    #[tokio::test(start_paused = true)]
    async fn pulls_after_stop_polling_retry_again() {
        let setup = setup();
        setup.client.stop_polling();

        let result = setup
            .client
            .pull_feature_flags(setup.fetcher(usize::MAX, FlagSet::new()))
            .await
            .unwrap();
        assert_eq!(result.source, WorkSource::Bailout);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(setup.fetches() >= 3, "{} fetches", setup.fetches());

        setup.client.stop_polling();
        let fetches = setup.fetches();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(setup.fetches(), fetches);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_polling_during_a_pull_cancels_its_retries() {
        let setup = setup();
        {
            let client = setup.client.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(500)).await;
                client.stop_polling();
            });
        }

        let result = setup
            .client
            .pull_feature_flags(setup.fetcher(usize::MAX, FlagSet::new()))
            .await
            .unwrap();
        assert_eq!(result.source, WorkSource::Bailout);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(setup.fetches(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn static_context_needs_no_retry() {
        let setup = setup();
        let context = Arc::new(FlagContext::new().with_values(flags(&[("foo", true)])));
        let client = setup.client.clone().with_context(context);

        let result = client
            .pull_feature_flags(setup.fetcher(0, FlagSet::new()))
            .await
            .unwrap();

        assert_eq!(result.source, WorkSource::StaticContext);
        assert!(client.storage().get_flags().unwrap().get("foo"));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(setup.fetches(), 0);
    }
}
