//! Periodic eviction of the lineages which are not seen anymore, buffers
//! freed without going through a `free` probe would otherwise fill the
//! tables.

use std::{sync::Arc, time::Duration};

use probe_common::time::Timestamp;
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};

use crate::tracking::{Collected, Tracker};

pub struct TrackingGc {
    tracker: Arc<Tracker>,
    interval: Duration,
    old_limit: Duration,
}

impl TrackingGc {
    pub fn new(tracker: Arc<Tracker>, interval: Duration, old_limit: Duration) -> Self {
        Self {
            tracker,
            interval,
            old_limit,
        }
    }

    /// Evict entries not seen in the `old_limit` preceding `now`.
    pub fn collect(&self, now: Timestamp) -> Collected {
        let old_limit = u64::try_from(self.old_limit.as_nanos()).unwrap_or(u64::MAX);
        self.tracker.collect(now.as_nanos().saturating_sub(old_limit))
    }

    /// Run the collection every `interval` until `exit` changes or its
    /// sender is dropped.
    pub fn spawn(self, mut exit: watch::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let collected = self.collect(Timestamp::now());
                        if collected != Collected::default() {
                            log::debug!(
                                "evicted {} identities and {} stack entries",
                                collected.identities,
                                collected.stacks
                            );
                        }
                    }
                    _ = exit.changed() => break,
                }
            }
            log::debug!("tracking gc stopped");
        })
    }
}
