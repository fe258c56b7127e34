//! A feature flag acquisition client.
//!
//! # Overview
//!
//! The client resolves a [`FlagSet`] (flag name → boolean) from whichever source answers first and
//! keeps it in a [`FeatureFlagStorage`] that the rest of the application reads from.
//!
//! Sources, in order of preference:
//! - static bootstrap values injected into a [`FlagContext`] by the host (checked first, no
//!   waiting);
//! - the remote [`FetchFeatureGating`] collaborator and the bootstrap [`ContextPromise`],
//!   whichever settles first;
//! - the copy persisted by [`PersistCache`] during an earlier run;
//! - an empty flag set once the timeout passes (or [`Error::Timeout`] in strict mode).
//!
//! Results from the persisted cache or the bailout are considered low-confidence: the client
//! stores them and keeps pulling in the background until a better source answers.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use feature_flags::*;
//! # async fn test() -> Result<()> {
//! let storage = Arc::new(FeatureFlagStorage::new());
//! let client = FlagClient::new(storage.clone())
//!     .with_cache(PersistCache::new(Arc::new(FileStore::new("/var/cache/my-app"))));
//!
//! let fetcher = HttpFetcher::new(HttpFetcherConfig::from_api_key("api-key"))?;
//! client
//!     .pull_feature_flags(PullConfig::new().fetch_feature_gating(fetcher))
//!     .await?;
//!
//! if storage.get_flags()?.get("new-editor") {
//!     // ...
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Overrides
//!
//! Interceptors registered with [`FeatureFlagStorage::use_interceptor`] are consulted before the
//! resolved flags. See [`overrides`] for ready-made ones.
//!
//! # Error Handling
//!
//! Errors are represented by the [`Error`] enum. Failures of individual sources are logged and
//! never reach the caller; only a missing fetcher and a strict-mode timeout do.
//!
//! # Logging
//!
//! The package uses the [`log`](https://docs.rs/log/latest/log/) crate with the `feature_flags`
//! target. Consider integrating a `log`-compatible logger implementation for better visibility
//! into flag resolution.

#![warn(rustdoc::missing_crate_level_docs)]
#![warn(missing_docs)]

pub mod overrides;

mod client;
mod config;
mod context;
mod error;
mod fetcher;
mod flags;
mod persist_cache;
mod pipeline;
mod poller;
mod storage;
mod use_flags;

pub use client::FlagClient;
pub use config::{PullConfig, PullFeatureFlagsParams};
pub use context::{context_promise, ContextPayload, ContextPromise, ContextResolver, FlagContext};
pub use error::{Error, Result};
pub use fetcher::{FetchFeatureGating, HttpFetcher, HttpFetcherConfig};
pub use flags::{is_flags_shape, FlagSet};
pub use persist_cache::{FileStore, KeyValueStore, MemoryStore, PersistCache};
pub use pipeline::{run_pipeline, Sources, WorkResult, WorkSource};
pub use storage::{FeatureFlagStorage, FlagsView, Interceptor, Listener, ListenerId, StorageMode};
pub use use_flags::{use_flags, FlagsSubscription};
