//! The flag acquisition race.
//!
//! [`run_pipeline`] first checks the static bootstrap context. If that has nothing, it spawns
//! four independent tasks and returns the first value any of them reports:
//!
//! | task | on success | on failure |
//! |---|---|---|
//! | remote fetch | immediately, [`WorkSource::Remote`] | silent after `timeout + 1ms` |
//! | context promise | immediately, [`WorkSource::Context`] | silent after `timeout + 1ms` |
//! | persisted cache | after `timeout - 17ms`, [`WorkSource::Persist`] | silent after `timeout + 1ms` |
//! | bailout | after `timeout + 17ms`, [`WorkSource::Bailout`] or [`Error::Timeout`] in strict mode | - |
//!
//! The delays make the remote and context sources preferred over the persisted cache, and
//! everything preferred over the bailout. Tasks that lose the race keep running; their results
//! are dropped, but their side effects (cache writes) still happen.
use std::{future::Future, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::{
    config::PullFeatureFlagsParams, context::FlagContext, persist_cache::PersistCache, Error,
    FetchFeatureGating, FlagSet, Result,
};

/// Keeps the persisted cache one frame behind the bailout and the context sources.
const SLACK: Duration = Duration::from_millis(17);
/// How long past the timeout a failed source waits before giving up.
const STALL: Duration = Duration::from_millis(1);

/// Provenance of a resolved flag set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkSource {
    /// Bootstrap promise.
    Context,
    /// Remote fetch.
    Remote,
    /// Nothing was available in time; the flag set is empty.
    Bailout,
    /// Locally persisted copy from an earlier run.
    Persist,
    /// Bootstrap values available synchronously.
    StaticContext,
}

impl WorkSource {
    /// Sources whose result should be replaced by polling again later.
    pub fn is_low_confidence(self) -> bool {
        matches!(self, WorkSource::Bailout | WorkSource::Persist)
    }

    /// Name used in logs.
    pub fn as_str(self) -> &'static str {
        match self {
            WorkSource::Context => "context",
            WorkSource::Remote => "remote",
            WorkSource::Bailout => "bailout",
            WorkSource::Persist => "persist",
            WorkSource::StaticContext => "static_context",
        }
    }
}

impl std::fmt::Display for WorkSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A flag set together with the source it came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkResult {
    /// Resolved flags.
    pub values: FlagSet,
    /// Where `values` came from.
    pub source: WorkSource,
    /// When the source produced `values`.
    pub resolved_at: DateTime<Utc>,
}

impl WorkResult {
    pub(crate) fn new(values: FlagSet, source: WorkSource) -> WorkResult {
        WorkResult {
            values,
            source,
            resolved_at: Utc::now(),
        }
    }
}

/// Local flag sources consulted by the pipeline besides the remote fetcher.
#[derive(Clone)]
pub struct Sources {
    /// Bootstrap values injected by the host.
    pub context: Arc<FlagContext>,
    /// Persisted copy of the last good flag set.
    pub cache: PersistCache,
}

/// Resolve a flag set from the fastest available source.
///
/// # Errors
///
/// - [`Error::Timeout`] if `params.strict` is set and no source produced flags in time.
pub async fn run_pipeline(params: &PullFeatureFlagsParams, sources: &Sources) -> Result<WorkResult> {
    if let Some(values) = sources.context.read_fg_values_from_context() {
        save_in_background(&sources.cache, values.clone());
        return Ok(WorkResult::new(values, WorkSource::StaticContext));
    }

    let timeout = params.effective_timeout();
    let (tx, mut rx) = mpsc::channel(4);

    spawn_work(
        &tx,
        work_remote(
            Arc::clone(&params.fetch_feature_gating),
            sources.cache.clone(),
            timeout,
        ),
    );
    spawn_work(
        &tx,
        work_context(Arc::clone(&sources.context), sources.cache.clone(), timeout),
    );
    spawn_work(&tx, work_persist(sources.cache.clone(), timeout));
    spawn_work(&tx, work_bailout(timeout, params.strict));
    drop(tx);

    match rx.recv().await {
        Some(result) => result,
        // The bailout task always reports, so this only happens if it panicked.
        None => bailout(params.strict),
    }
}

/// Run `work` detached from the caller. Its result, if any, is offered to the race.
fn spawn_work<F>(tx: &mpsc::Sender<Result<WorkResult>>, work: F)
where
    F: Future<Output = Option<Result<WorkResult>>> + Send + 'static,
{
    let tx = tx.clone();
    tokio::spawn(async move {
        if let Some(result) = work.await {
            // Err means the race is already settled.
            let _ = tx.send(result).await;
        }
    });
}

fn save_in_background(cache: &PersistCache, values: FlagSet) {
    let cache = cache.clone();
    tokio::spawn(async move { cache.save_to_cache(&values).await });
}

async fn stall(timeout: Duration) {
    tokio::time::sleep(timeout + STALL).await;
}

async fn work_remote(
    fetcher: Arc<dyn FetchFeatureGating>,
    cache: PersistCache,
    timeout: Duration,
) -> Option<Result<WorkResult>> {
    match fetcher.fetch_feature_gating().await {
        Ok(values) => {
            save_in_background(&cache, values.clone());
            Some(Ok(WorkResult::new(values, WorkSource::Remote)))
        }
        Err(err) => {
            log::error!(target: "feature_flags", source = "remote"; "failed to fetch feature gating: {err}");
            stall(timeout).await;
            None
        }
    }
}

async fn work_context(
    context: Arc<FlagContext>,
    cache: PersistCache,
    timeout: Duration,
) -> Option<Result<WorkResult>> {
    match context.read_fg_promise_from_context().await {
        Ok(Some(values)) => {
            save_in_background(&cache, values.clone());
            Some(Ok(WorkResult::new(values, WorkSource::Context)))
        }
        Ok(None) => {
            stall(timeout).await;
            None
        }
        Err(err) => {
            log::error!(target: "feature_flags", source = "context"; "failed to read flags from context: {err}");
            stall(timeout).await;
            None
        }
    }
}

async fn work_persist(cache: PersistCache, timeout: Duration) -> Option<Result<WorkResult>> {
    match cache.read_from_cache().await {
        Some(values) => {
            tokio::time::sleep(timeout.saturating_sub(SLACK)).await;
            Some(Ok(WorkResult::new(values, WorkSource::Persist)))
        }
        None => {
            stall(timeout).await;
            None
        }
    }
}

async fn work_bailout(timeout: Duration, strict: bool) -> Option<Result<WorkResult>> {
    tokio::time::sleep(timeout + SLACK).await;
    Some(bailout(strict))
}

fn bailout(strict: bool) -> Result<WorkResult> {
    if strict {
        Err(Error::Timeout)
    } else {
        Ok(WorkResult::new(FlagSet::new(), WorkSource::Bailout))
    }
}
