//! Binding from storage change events to a consumer's re-render.
//!
//! A UI layer calls [`use_flags`] when a component mounts, passing its own "re-render" primitive.
//! Every effective flag change triggers exactly one re-render per subscription; the component
//! reads fresh flags with [`FlagsSubscription::flags`] while rendering. Dropping the subscription
//! (unmount) unsubscribes.
use std::sync::Arc;

use crate::{
    storage::{FeatureFlagStorage, FlagsView, ListenerId},
    Result,
};

/// Subscribe `rerender` to flag changes in `storage`.
///
/// ```
/// # use std::sync::Arc;
/// # use feature_flags::{use_flags, FeatureFlagStorage, FlagSet};
/// let storage = Arc::new(FeatureFlagStorage::new());
/// let subscription = use_flags(&storage, || println!("flags changed, render again"));
///
/// storage.set_flags([("new-editor", true)].into_iter().collect::<FlagSet>());
/// assert!(subscription.flags().unwrap().get("new-editor"));
/// ```
pub fn use_flags(
    storage: &Arc<FeatureFlagStorage>,
    rerender: impl Fn() + Send + Sync + 'static,
) -> FlagsSubscription {
    let listener = storage.on(move |_| rerender());
    FlagsSubscription {
        storage: Arc::clone(storage),
        listener,
    }
}

/// A live subscription created by [`use_flags`]. Unsubscribes on drop.
#[derive(Debug)]
pub struct FlagsSubscription {
    storage: Arc<FeatureFlagStorage>,
    listener: ListenerId,
}

impl FlagsSubscription {
    /// Current flags, read synchronously from the storage.
    pub fn flags(&self) -> Result<FlagsView<'_>> {
        self.storage.get_flags()
    }
}

impl Drop for FlagsSubscription {
    fn drop(&mut self) {
        self.storage.off(self.listener);
    }
}
