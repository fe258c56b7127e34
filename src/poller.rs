//! Delays between background pulls, and the signal that stops them.
use std::{sync::Arc, time::Duration};

use rand::{thread_rng, Rng};
use tokio::sync::watch;

/// Stop switch shared by the background pulls of a client.
///
/// Each batch of background pulls remembers the generation it was started in. Stopping bumps the
/// generation, which ends every batch started before it; batches started afterwards run normally.
#[derive(Debug, Clone)]
pub(crate) struct Poller {
    generation: Arc<watch::Sender<u64>>,
}

impl Poller {
    pub(crate) fn new() -> Poller {
        let (generation, _) = watch::channel(0);
        Poller {
            generation: Arc::new(generation),
        }
    }

    /// Stop background pulls started so far.
    pub(crate) fn stop(&self) {
        self.generation.send_modify(|generation| *generation += 1);
    }

    pub(crate) fn generation(&self) -> u64 {
        *self.generation.borrow()
    }

    /// Sleep for `interval` minus a random `jitter`.
    ///
    /// Returns `false` if pulls of `generation` were stopped before or while waiting.
    pub(crate) async fn wait(&self, generation: u64, interval: Duration, jitter: Duration) -> bool {
        let mut current = self.generation.subscribe();
        if *current.borrow_and_update() != generation {
            return false;
        }

        let timeout = self::jitter(interval, jitter);
        let stopped = tokio::select! {
            _ = tokio::time::sleep(timeout) => false,
            _ = current.wait_for(|current| *current != generation) => true,
        };

        !stopped && self.generation() == generation
    }
}

/// Apply randomized `jitter` to `interval`.
fn jitter(interval: Duration, jitter: Duration) -> Duration {
    Duration::saturating_sub(interval, thread_rng().gen_range(Duration::ZERO..=jitter))
}
