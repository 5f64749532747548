//! Completion barrier gating winner delivery.
//!
//! Every agency registers once it has sent its last batch. When the number
//! of distinct registered agencies reaches the expected count, a `watch`
//! channel flips from `false` to `true`. That flip happens once per run and
//! is observed by every waiter, early or late.
//!
//! If fewer agencies than expected ever register, waiters block until the
//! server shuts down.

use std::collections::BTreeSet;

use tokio::sync::{watch, Mutex};
use tracing::info;

pub struct CompletionBarrier {
    expected: usize,
    finished: Mutex<BTreeSet<u32>>,
    released: watch::Sender<bool>,
}

/// What a single registration changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// First registration of this agency; the threshold is still ahead.
    Counted { finished: usize },
    /// This registration reached the threshold and released everyone.
    Released,
    /// The agency had registered before, or the barrier was already open.
    AlreadyCounted,
}

impl CompletionBarrier {
    pub fn new(expected: usize) -> Self {
        let (released, _) = watch::channel(false);
        Self {
            expected,
            finished: Mutex::new(BTreeSet::new()),
            released,
        }
    }

    pub fn expected(&self) -> usize {
        self.expected
    }

    pub fn is_released(&self) -> bool {
        *self.released.borrow()
    }

    pub async fn finished(&self) -> usize {
        self.finished.lock().await.len()
    }

    /// Records `agency` as done without waiting.
    pub async fn register(&self, agency: u32) -> Registration {
        let mut finished = self.finished.lock().await;
        if !finished.insert(agency) {
            return Registration::AlreadyCounted;
        }
        if finished.len() < self.expected {
            info!(agency, finished = finished.len(), expected = self.expected, "agency finished");
            return Registration::Counted {
                finished: finished.len(),
            };
        }

        let opened = self.released.send_if_modified(|released| {
            let was_closed = !*released;
            *released = true;
            was_closed
        });
        if opened {
            info!(agency, expected = self.expected, "all agencies finished, releasing barrier");
            Registration::Released
        } else {
            Registration::AlreadyCounted
        }
    }

    /// Suspends until the barrier has been released.
    pub async fn wait(&self) {
        let mut released = self.released.subscribe();
        // The sender lives as long as `self`, so the channel cannot close here.
        let _ = released.wait_for(|released| *released).await;
    }

    /// Registers `agency` and suspends until every expected agency has.
    pub async fn register_done_and_wait(&self, agency: u32) -> Registration {
        let registration = self.register(agency).await;
        self.wait().await;
        registration
    }
}
