//! Flags injected into the process by a host or bootstrap layer before the client starts.
//!
//! There are two shapes of bootstrap data:
//! - a flag set that is available synchronously (e.g., rendered into the page by a server), read
//!   with [`FlagContext::read_fg_values_from_context`];
//! - a pending value that settles later (e.g., a request started by a bootstrap script), read with
//!   [`FlagContext::read_fg_promise_from_context`].
use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::{Error, FlagSet, Result};

/// Payload carried by a [`ContextPromise`]. Mirrors the bootstrap JSON `{ "data": { ... } }`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextPayload {
    /// Resolved flags, if the bootstrap request produced any.
    pub data: Option<FlagSet>,
}

type Settlement = Option<std::result::Result<ContextPayload, String>>;

/// A value that settles once, possibly after the client has started waiting on it.
///
/// Cloning is cheap and every clone observes the same settlement.
#[derive(Debug, Clone)]
pub struct ContextPromise {
    rx: watch::Receiver<Settlement>,
}

/// Settles the paired [`ContextPromise`].
///
/// Dropping a resolver without settling rejects the promise.
#[derive(Debug)]
pub struct ContextResolver {
    tx: watch::Sender<Settlement>,
}

/// Create a pending [`ContextPromise`] together with its resolver.
pub fn context_promise() -> (ContextResolver, ContextPromise) {
    let (tx, rx) = watch::channel(None);
    (ContextResolver { tx }, ContextPromise { rx })
}

impl ContextResolver {
    /// Fulfill the promise with `payload`.
    pub fn resolve(self, payload: ContextPayload) {
        self.tx.send_replace(Some(Ok(payload)));
    }

    /// Reject the promise.
    pub fn reject(self, reason: impl Into<String>) {
        self.tx.send_replace(Some(Err(reason.into())));
    }
}

impl ContextPromise {
    /// A promise that is already fulfilled with `payload`.
    pub fn resolved(payload: ContextPayload) -> ContextPromise {
        let (resolver, promise) = context_promise();
        resolver.resolve(payload);
        promise
    }

    /// Wait for the promise to settle.
    pub async fn settled(&self) -> Result<ContextPayload> {
        let mut rx = self.rx.clone();
        let settlement = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| Error::ContextRejected("resolver dropped before settling".to_owned()))?;

        match &*settlement {
            Some(Ok(payload)) => Ok(payload.clone()),
            Some(Err(reason)) => Err(Error::ContextRejected(reason.clone())),
            None => Err(Error::ContextRejected("promise is not settled".to_owned())),
        }
    }
}

/// Holder of the bootstrap values. Shared between the host that injects values and the pipeline
/// that reads them.
#[derive(Debug, Default)]
pub struct FlagContext {
    values: RwLock<Option<FlagSet>>,
    promise: RwLock<Option<ContextPromise>>,
}

impl FlagContext {
    /// Create an empty context (no bootstrap data).
    pub fn new() -> FlagContext {
        FlagContext::default()
    }

    /// Inject a synchronously available flag set.
    pub fn with_values(self, values: FlagSet) -> FlagContext {
        self.set_values(values);
        self
    }

    /// Inject a pending flag set.
    pub fn with_promise(self, promise: ContextPromise) -> FlagContext {
        self.set_promise(promise);
        self
    }

    /// Inject (or replace) a synchronously available flag set.
    pub fn set_values(&self, values: FlagSet) {
        *self.values.write().unwrap_or_else(PoisonError::into_inner) = Some(values);
    }

    /// Inject (or replace) a pending flag set.
    pub fn set_promise(&self, promise: ContextPromise) {
        *self.promise.write().unwrap_or_else(PoisonError::into_inner) = Some(promise);
    }

    /// Return the injected flag set if present and non-empty.
    pub fn read_fg_values_from_context(&self) -> Option<FlagSet> {
        let values = self.values.read().unwrap_or_else(PoisonError::into_inner);
        values.as_ref().filter(|values| !values.is_empty()).cloned()
    }

    /// Wait for the injected promise and unwrap its `data`.
    ///
    /// Returns `Ok(None)` if no promise was injected.
    ///
    /// # Errors
    ///
    /// - [`Error::ContextRejected`] if the promise was rejected.
    pub async fn read_fg_promise_from_context(&self) -> Result<Option<FlagSet>> {
        let promise = self
            .promise
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let Some(promise) = promise else {
            return Ok(None);
        };

        Ok(promise.settled().await?.data)
    }
}
