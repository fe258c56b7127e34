//! A thread-safe in-memory storage for the currently resolved flag set.
//!
//! [`FeatureFlagStorage`] is the single shared mutable resource of the client: the pipeline writes
//! into it with [`FeatureFlagStorage::set_flags`], UI code and flag checks read from it through a
//! read-only [`FlagsView`], and subscribers get notified on every effective change.
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex, PoisonError, RwLock,
};

use tokio::sync::watch;

use crate::{Error, FlagSet, Result};

/// A flag lookup layered above the resolved flag set.
///
/// Returns `Some(value)` to decide the flag, or `None` to defer to the next interceptor.
pub type Interceptor = Arc<dyn Fn(&str) -> Option<bool> + Send + Sync>;

/// A change listener registered with [`FeatureFlagStorage::on`].
///
/// Listeners run outside the storage locks. When [`FeatureFlagStorage::set_flags`] races on
/// several threads, events may arrive out of order, so the payload can be older than the stored
/// flags. Read [`FeatureFlagStorage::get_flags`] or [`FeatureFlagStorage::current`] from the
/// listener for the latest values.
pub type Listener = Arc<dyn Fn(&FlagSet) + Send + Sync>;

/// Handle returned by [`FeatureFlagStorage::on`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// How [`FeatureFlagStorage::get_flags`] behaves when flags are read before initialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageMode {
    /// Reading uninitialized flags is an error.
    Development,
    /// Reading uninitialized flags is logged and yields an empty view.
    Production,
}

impl Default for StorageMode {
    fn default() -> StorageMode {
        if cfg!(debug_assertions) {
            StorageMode::Development
        } else {
            StorageMode::Production
        }
    }
}

#[derive(Default)]
struct State {
    cache: Option<Arc<FlagSet>>,
    inited: bool,
}

/// `FeatureFlagStorage` holds the resolved flags. The flag set itself is immutable and only ever
/// replaced completely.
///
/// The host application creates one storage at startup and shares it (`Arc`) with the client and
/// with every consumer.
pub struct FeatureFlagStorage {
    state: RwLock<State>,
    interceptors: RwLock<Vec<Interceptor>>,
    listeners: Mutex<Vec<(ListenerId, Listener)>>,
    next_listener_id: AtomicU64,
    inited: watch::Sender<bool>,
    mode: StorageMode,
}

impl Default for FeatureFlagStorage {
    fn default() -> Self {
        FeatureFlagStorage::with_mode(StorageMode::default())
    }
}

impl std::fmt::Debug for FeatureFlagStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeatureFlagStorage")
            .field("inited", &self.is_inited())
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

impl FeatureFlagStorage {
    /// Create a new uninitialized storage using the build's default [`StorageMode`].
    pub fn new() -> Self {
        FeatureFlagStorage::default()
    }

    /// Create a new uninitialized storage with an explicit [`StorageMode`].
    pub fn with_mode(mode: StorageMode) -> Self {
        let (inited, _) = watch::channel(false);
        FeatureFlagStorage {
            state: RwLock::new(State::default()),
            interceptors: RwLock::new(Vec::new()),
            listeners: Mutex::new(Vec::new()),
            next_listener_id: AtomicU64::new(0),
            inited,
            mode,
        }
    }

    /// Replace the stored flags with `values`.
    ///
    /// Returns `false` and does nothing if `values` is structurally equal to the stored flags.
    /// Otherwise stores `values`, marks the storage initialized, notifies listeners and returns
    /// `true`.
    pub fn set_flags(&self, values: FlagSet) -> bool {
        let values = Arc::new(values);
        {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            if state.cache.as_deref() == Some(&*values) {
                return false;
            }
            state.cache = Some(Arc::clone(&values));
            state.inited = true;
        }

        self.inited.send_replace(true);
        self.notify(&values);
        true
    }

    /// Get a read-only view of the flags.
    ///
    /// # Errors
    ///
    /// - [`Error::NotInitialized`] if no flags were set yet and the storage runs in
    ///   [`StorageMode::Development`]. In [`StorageMode::Production`] an empty view is returned
    ///   instead.
    pub fn get_flags(&self) -> Result<FlagsView<'_>> {
        if !self.is_inited() {
            log::error!(target: "feature_flags", "feature flags are read before initialization");
            if self.mode == StorageMode::Development {
                return Err(Error::NotInitialized);
            }
        }
        Ok(FlagsView { storage: self })
    }

    /// Currently stored flag set, without interceptors applied.
    pub fn current(&self) -> Option<Arc<FlagSet>> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.cache.clone()
    }

    /// Whether flags have been set since creation (or since the last [`clear`](Self::clear)).
    pub fn is_inited(&self) -> bool {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .inited
    }

    /// Register an interceptor with the highest priority.
    pub fn use_interceptor(
        &self,
        interceptor: impl Fn(&str) -> Option<bool> + Send + Sync + 'static,
    ) {
        let interceptor: Interceptor = Arc::new(interceptor);
        self.interceptors
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(0, interceptor);
    }

    /// Subscribe to change events.
    pub fn on(&self, listener: impl Fn(&FlagSet) + Send + Sync + 'static) -> ListenerId {
        let id = ListenerId(self.next_listener_id.fetch_add(1, Ordering::Relaxed));
        let listener: Listener = Arc::new(listener);
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, listener));
        id
    }

    /// Unsubscribe a listener. Returns `false` if it was not subscribed.
    pub fn off(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|(listener_id, _)| *listener_id != id);
        listeners.len() != before
    }

    /// Emit a change event carrying `values` to every listener.
    pub fn notify(&self, values: &FlagSet) {
        // Listeners may subscribe or unsubscribe from inside the callback.
        let listeners: Vec<Listener> = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();

        for listener in listeners {
            listener(values);
        }
    }

    /// Drop the stored flags and mark the storage uninitialized.
    pub fn clear(&self) {
        {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            state.cache = None;
            state.inited = false;
        }
        self.inited.send_replace(false);
    }

    /// Wait until flags are set.
    pub async fn wait_for_flags(&self) {
        let mut inited = self.inited.subscribe();
        // The sender lives as long as `self`, so the channel cannot close here.
        let _ = inited.wait_for(|inited| *inited).await;
    }

    fn lookup(&self, key: &str) -> Option<bool> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.cache.as_ref()?.get(key).copied()
    }
}

/// Read-only view over a [`FeatureFlagStorage`].
///
/// Reads always reflect the latest stored flags.
#[derive(Debug, Clone, Copy)]
pub struct FlagsView<'a> {
    storage: &'a FeatureFlagStorage,
}

impl FlagsView<'_> {
    /// Resolve a flag. Interceptors are consulted most recently registered first, then the stored
    /// flag set; a flag nobody knows about is `false`.
    pub fn get(&self, key: &str) -> bool {
        let interceptors = self
            .storage
            .interceptors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        interceptors
            .iter()
            .find_map(|interceptor| interceptor(key))
            .or_else(|| self.storage.lookup(key))
            .unwrap_or(false)
    }

    /// Names of the stored flags (empty if uninitialized).
    pub fn keys(&self) -> Vec<String> {
        self.storage
            .current()
            .map(|flags| flags.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Whether the underlying storage is initialized.
    pub fn is_inited(&self) -> bool {
        self.storage.is_inited()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        time::Duration,
    };

    use super::*;

    fn flags(values: &[(&str, bool)]) -> FlagSet {
        values.iter().map(|(k, v)| (*k, *v)).collect()
    }

    fn count_changes(storage: &FeatureFlagStorage) -> Arc<AtomicUsize> {
        let changes = Arc::new(AtomicUsize::new(0));
        {
            let changes = changes.clone();
            storage.on(move |_| {
                changes.fetch_add(1, Ordering::SeqCst);
            });
        }
        changes
    }

    #[test]
    fn listeners_can_read_the_latest_flags() {
        let storage = Arc::new(FeatureFlagStorage::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let weak = Arc::downgrade(&storage);
            let seen = seen.clone();
            storage.on(move |_| {
                let current = weak.upgrade().and_then(|storage| storage.current());
                seen.lock().unwrap().push(current);
            });
        }

        storage.set_flags(flags(&[("foo", true)]));
        storage.set_flags(flags(&[("foo", false)]));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].as_deref(), Some(&flags(&[("foo", true)])));
        assert_eq!(seen[1].as_deref(), Some(&flags(&[("foo", false)])));
    }

    #[test]
    fn set_flags_is_idempotent() {
        let storage = FeatureFlagStorage::new();
        let changes = count_changes(&storage);

        assert!(storage.set_flags(flags(&[("foo", true)])));
        assert!(!storage.set_flags(flags(&[("foo", true)])));

        assert_eq!(changes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn set_flags_replaces_on_any_difference() {
        let storage = FeatureFlagStorage::new();
        let changes = count_changes(&storage);

        assert!(storage.set_flags(flags(&[("foo", true)])));
        assert!(storage.set_flags(flags(&[("foo", false)])));
        assert!(storage.set_flags(flags(&[("foo", false), ("bar", false)])));
        assert!(storage.set_flags(flags(&[("bar", false)])));

        assert_eq!(changes.load(Ordering::SeqCst), 4);
        assert_eq!(storage.current().as_deref(), Some(&flags(&[("bar", false)])));
    }

    #[test]
    fn empty_set_initializes_storage() {
        let storage = FeatureFlagStorage::new();

        assert!(storage.set_flags(FlagSet::new()));
        assert!(storage.is_inited());
        assert!(!storage.set_flags(FlagSet::new()));
    }

    #[test]
    fn get_flags_before_init_depends_on_mode() {
        let development = FeatureFlagStorage::with_mode(StorageMode::Development);
        assert!(matches!(development.get_flags(), Err(Error::NotInitialized)));

        let production = FeatureFlagStorage::with_mode(StorageMode::Production);
        let view = production.get_flags().unwrap();
        assert!(!view.is_inited());
        assert!(view.keys().is_empty());
        assert!(!view.get("foo"));
    }

    #[test]
    fn view_resolves_flags_with_default_false() {
        let storage = FeatureFlagStorage::new();
        storage.set_flags(flags(&[("foo", true), ("bar", false)]));

        let view = storage.get_flags().unwrap();
        assert!(view.get("foo"));
        assert!(!view.get("bar"));
        assert!(!view.get("missing"));
        assert!(view.is_inited());

        let mut keys = view.keys();
        keys.sort();
        assert_eq!(keys, vec!["bar".to_owned(), "foo".to_owned()]);
    }

    #[test]
    fn latest_interceptor_wins() {
        let storage = FeatureFlagStorage::new();
        storage.set_flags(flags(&[("foo", false), ("bar", true)]));

        storage.use_interceptor(|key| (key == "foo").then_some(true));
        storage.use_interceptor(|key| match key {
            "foo" | "bar" => Some(false),
            _ => None,
        });

        let view = storage.get_flags().unwrap();
        assert!(!view.get("foo"));
        assert!(!view.get("bar"));

        storage.use_interceptor(|key| (key == "foo").then_some(true));
        assert!(view.get("foo"));
    }

    #[test]
    fn interceptors_fall_through_to_stored_flags() {
        let storage = FeatureFlagStorage::new();
        storage.set_flags(flags(&[("foo", true)]));
        storage.use_interceptor(|_| None);

        assert!(storage.get_flags().unwrap().get("foo"));
    }

    #[test]
    fn view_observes_later_writes() {
        let storage = FeatureFlagStorage::new();
        storage.set_flags(flags(&[("foo", false)]));
        let view = storage.get_flags().unwrap();

        storage.set_flags(flags(&[("foo", true)]));

        assert!(view.get("foo"));
    }

    #[test]
    fn off_stops_notifications() {
        let storage = FeatureFlagStorage::new();
        let changes = Arc::new(AtomicUsize::new(0));
        let id = {
            let changes = changes.clone();
            storage.on(move |_| {
                changes.fetch_add(1, Ordering::SeqCst);
            })
        };

        storage.notify(&FlagSet::new());
        assert!(storage.off(id));
        assert!(!storage.off(id));
        storage.notify(&FlagSet::new());

        assert_eq!(changes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn notify_passes_values_without_storing_them() {
        let storage = FeatureFlagStorage::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = seen.clone();
            storage.on(move |values| seen.lock().unwrap().push(values.clone()));
        }

        storage.notify(&flags(&[("foo", true)]));

        assert_eq!(*seen.lock().unwrap(), vec![flags(&[("foo", true)])]);
        assert!(!storage.is_inited());
    }

    #[test]
    fn clear_resets_storage() {
        let storage = FeatureFlagStorage::with_mode(StorageMode::Development);
        storage.set_flags(flags(&[("foo", true)]));

        storage.clear();

        assert!(!storage.is_inited());
        assert!(storage.current().is_none());
        assert!(matches!(storage.get_flags(), Err(Error::NotInitialized)));
        assert!(storage.set_flags(flags(&[("foo", true)])));
    }

    #[test]
    fn can_set_flags_from_another_thread() {
        let storage = Arc::new(FeatureFlagStorage::new());

        assert!(storage.current().is_none());

        {
            let storage = storage.clone();
            let _ = std::thread::spawn(move || {
                storage.set_flags(flags(&[("foo", true)]));
            })
            .join();
        }

        assert!(storage.get_flags().unwrap().get("foo"));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_flags_resolves_after_first_write() {
        let storage = Arc::new(FeatureFlagStorage::new());

        {
            let storage = storage.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                storage.set_flags(FlagSet::new());
            });
        }

        storage.wait_for_flags().await;
        assert!(storage.is_inited());
    }
}
