//! The RPKI change-event plumbing.
//!
//! The RTR client transport is an external collaborator; what the server
//! consumes is the stream of ROA and ASPA changes it produces. Those arrive
//! through [`RpkiFeed`], get queued as [`RpkiEvent`]s, and are applied to
//! the caches by a single worker thread, so all RTR-driven mutations are
//! serialized with respect to each other.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use chrono::{DateTime, Utc};
use crossbeam_queue::SegQueue;
use log::{debug, info};
use crate::aspa::{validate_aspa, AspaStore};
use crate::aspath::AsPathCache;
use crate::payload::{AddressPrefix, ResultUpdate};
use crate::prefixes::PrefixCache;
use crate::updates::UpdateCache;


//------------ RpkiEvent -----------------------------------------------------

/// A single change reported by the RTR feed.
#[derive(Clone, Debug)]
pub enum RpkiEvent {
    RoaAdded {
        origin: u32,
        prefix: AddressPrefix,
        max_len: u8,
        session_id: u32,
        cache_id: u32,
    },
    RoaWithdrawn {
        origin: u32,
        prefix: AddressPrefix,
        max_len: u8,
        session_id: u32,
        cache_id: u32,
    },
    AspaAdded {
        customer: u32,
        providers: Vec<u32>,
        afi: u16,
    },
    AspaWithdrawn {
        customer: u32,
        afi: u16,
    },
    EndOfData {
        cache_id: u32,
        timestamp: DateTime<Utc>,
    },
}


//------------ RpkiQueue -----------------------------------------------------

/// The queue between the RTR feed and the RPKI worker.
#[derive(Debug, Default)]
pub struct RpkiQueue {
    events: SegQueue<RpkiEvent>,
    open: Mutex<bool>,
    cond: Condvar,
}

impl RpkiQueue {
    pub fn new() -> Self {
        RpkiQueue {
            events: SegQueue::new(),
            open: Mutex::new(true),
            cond: Condvar::new(),
        }
    }

    pub fn push(&self, event: RpkiEvent) {
        self.events.push(event);
        self.cond.notify_one();
    }

    /// Pops the next event, waiting up to `timeout`.
    ///
    /// Returns `None` on timeout or once the queue is closed and drained;
    /// [`is_open`][Self::is_open] tells the two apart.
    pub fn pop(&self, timeout: Duration) -> Option<RpkiEvent> {
        if let Some(event) = self.events.pop() {
            return Some(event)
        }
        let open = self.open.lock().expect("poisoned lock");
        if !*open {
            return self.events.pop()
        }
        let (_open, _result) = self.cond
            .wait_timeout(open, timeout)
            .expect("poisoned lock");
        self.events.pop()
    }

    pub fn close(&self) {
        *self.open.lock().expect("poisoned lock") = false;
        self.cond.notify_all();
    }

    pub fn is_open(&self) -> bool {
        *self.open.lock().expect("poisoned lock")
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}


//------------ RpkiFeed ------------------------------------------------------

/// The callback surface the RTR client drives.
///
/// Each callback only enqueues; the heavy lifting happens on the RPKI
/// worker thread.
#[derive(Clone)]
pub struct RpkiFeed {
    queue: Arc<RpkiQueue>,
}

impl RpkiFeed {
    pub fn new(queue: Arc<RpkiQueue>) -> Self {
        RpkiFeed { queue }
    }

    pub fn roa_added(
        &self, origin: u32, prefix: AddressPrefix, max_len: u8,
        session_id: u32, cache_id: u32,
    ) {
        self.queue.push(RpkiEvent::RoaAdded {
            origin, prefix, max_len, session_id, cache_id
        });
    }

    pub fn roa_withdrawn(
        &self, origin: u32, prefix: AddressPrefix, max_len: u8,
        session_id: u32, cache_id: u32,
    ) {
        self.queue.push(RpkiEvent::RoaWithdrawn {
            origin, prefix, max_len, session_id, cache_id
        });
    }

    pub fn aspa_added(&self, customer: u32, providers: Vec<u32>, afi: u16) {
        self.queue.push(RpkiEvent::AspaAdded { customer, providers, afi });
    }

    pub fn aspa_withdrawn(&self, customer: u32, afi: u16) {
        self.queue.push(RpkiEvent::AspaWithdrawn { customer, afi });
    }

    pub fn end_of_data(&self, cache_id: u32, timestamp: DateTime<Utc>) {
        self.queue.push(RpkiEvent::EndOfData { cache_id, timestamp });
    }
}


//------------ RpkiWorker ----------------------------------------------------

/// The caches the RPKI worker applies events to.
pub struct RpkiWorker {
    pub queue: Arc<RpkiQueue>,
    pub prefix_cache: Arc<PrefixCache>,
    pub aspa_store: Arc<AspaStore>,
    pub aspath_cache: Arc<AsPathCache>,
    pub update_cache: Arc<UpdateCache>,
}

impl RpkiWorker {
    /// Spawns the worker thread. It exits once the queue is closed.
    pub fn spawn(self) -> JoinHandle<()> {
        thread::Builder::new()
            .name("rpki-worker".into())
            .spawn(move || self.run())
            .expect("failed to spawn the RPKI worker")
    }

    fn run(self) {
        debug!("RPKI worker started");
        loop {
            match self.queue.pop(Duration::from_millis(100)) {
                Some(event) => self.process(event),
                None => {
                    if !self.queue.is_open() && self.queue.is_empty() {
                        break
                    }
                }
            }
        }
        debug!("RPKI worker stopped");
    }

    fn process(&self, event: RpkiEvent) {
        match event {
            RpkiEvent::RoaAdded {
                origin, prefix, max_len, session_id, cache_id
            } => {
                self.prefix_cache.add_roa(
                    origin, prefix, max_len, session_id, cache_id
                );
            }
            RpkiEvent::RoaWithdrawn {
                origin, prefix, max_len, session_id, cache_id
            } => {
                self.prefix_cache.del_roa(
                    origin, prefix, max_len, session_id, cache_id
                );
            }
            RpkiEvent::AspaAdded { customer, providers, afi } => {
                self.aspa_store.add(customer, providers, afi);
                self.revalidate_customer(customer);
            }
            RpkiEvent::AspaWithdrawn { customer, afi } => {
                if self.aspa_store.withdraw(customer, afi) {
                    self.revalidate_customer(customer);
                }
            }
            RpkiEvent::EndOfData { cache_id, timestamp } => {
                let stale = self.aspath_cache.stale_paths(timestamp);
                info!(
                    "end of data from cache {}: revalidating {} paths",
                    cache_id, stale.len()
                );
                for path_id in stale {
                    self.revalidate_path(path_id);
                }
            }
        }
    }

    /// Revalidates every referenced path that contains the customer ASN.
    fn revalidate_customer(&self, customer: u32) {
        for path_id in self.aspath_cache.paths_containing(customer) {
            self.revalidate_path(path_id);
        }
    }

    /// Re-runs ASPA validation for one path and fans out the result.
    fn revalidate_path(&self, path_id: u32) {
        let info = match self.aspath_cache.info(path_id) {
            Some(info) => info,
            None => return,
        };
        let result = validate_aspa(
            &info.as_path, info.kind, info.direction, info.afi,
            &self.aspa_store,
        );
        if !self.aspath_cache.set_result(path_id, result) {
            return
        }
        for update_id in self.aspath_cache.updates_of(path_id) {
            if !self.update_cache.modify_result(
                update_id, ResultUpdate::aspa(result)
            ) {
                // The update has been reaped; drop the stale reference.
                self.aspath_cache.release_update(path_id, update_id);
            }
        }
    }
}


//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use crate::payload::{
        AsPathKind, BgpsecData, DefaultResult, PathDirection, UpdateId,
        ValidationState,
    };
    use crate::updates::{ResultChange, UpdateListener};

    #[derive(Default)]
    struct Tracker {
        states: Mutex<HashMap<UpdateId, ValidationState>>,
    }

    impl Tracker {
        fn aspa_of(&self, update_id: UpdateId) -> Option<ValidationState> {
            self.states.lock().expect("poisoned lock")
                .get(&update_id).copied()
        }
    }

    impl UpdateListener for Tracker {
        fn update_result_changed(&self, change: &ResultChange) {
            self.states.lock().expect("poisoned lock")
                .insert(change.update_id, change.result.aspa);
        }
    }

    struct Rig {
        tracker: Arc<Tracker>,
        update_cache: Arc<UpdateCache>,
        worker: RpkiWorker,
    }

    fn rig() -> Rig {
        let tracker = Arc::new(Tracker::default());
        let update_cache = Arc::new(UpdateCache::new(tracker.clone()));
        let worker = RpkiWorker {
            queue: Arc::new(RpkiQueue::new()),
            prefix_cache: Arc::new(
                PrefixCache::new(update_cache.clone())
            ),
            aspa_store: Arc::new(AspaStore::new()),
            aspath_cache: Arc::new(AsPathCache::new()),
            update_cache: update_cache.clone(),
        };
        Rig { tracker, update_cache, worker }
    }

    #[test]
    fn aspa_event_revalidates_referencing_updates() {
        let rig = rig();
        let update_id = UpdateId(1);
        rig.update_cache.store(
            update_id, "10.0.0.0/16".parse().unwrap(), 65000,
            BgpsecData::default(), DefaultResult::default(), 1,
        );
        let path_id = rig.worker.aspath_cache.intern(
            &[65001, 65000], AsPathKind::Sequence,
            PathDirection::UpStream, 1, update_id,
        );

        rig.worker.process(RpkiEvent::AspaAdded {
            customer: 65000, providers: vec![65001], afi: 1,
        });
        assert_eq!(
            rig.worker.aspath_cache.info(path_id).unwrap().aspa_result,
            ValidationState::Valid
        );
        assert_eq!(
            rig.tracker.aspa_of(update_id), Some(ValidationState::Valid)
        );

        rig.worker.process(RpkiEvent::AspaWithdrawn {
            customer: 65000, afi: 1,
        });
        assert_eq!(
            rig.tracker.aspa_of(update_id),
            Some(ValidationState::Unknown)
        );
    }

    #[test]
    fn end_of_data_touches_stale_paths_only() {
        let rig = rig();
        let update_id = UpdateId(1);
        rig.update_cache.store(
            update_id, "10.0.0.0/16".parse().unwrap(), 65000,
            BgpsecData::default(), DefaultResult::default(), 1,
        );
        let path_id = rig.worker.aspath_cache.intern(
            &[65001, 65000], AsPathKind::Sequence,
            PathDirection::UpStream, 1, update_id,
        );
        rig.worker.aspath_cache.set_result(
            path_id, ValidationState::Valid
        );

        // An end-of-data older than the entry leaves it alone.
        rig.worker.process(RpkiEvent::EndOfData {
            cache_id: 1,
            timestamp: Utc::now() - chrono::Duration::hours(1),
        });
        assert_eq!(
            rig.worker.aspath_cache.info(path_id).unwrap().aspa_result,
            ValidationState::Valid
        );

        // A current one revalidates against the (empty) store.
        rig.worker.process(RpkiEvent::EndOfData {
            cache_id: 1,
            timestamp: Utc::now() + chrono::Duration::seconds(1),
        });
        assert_eq!(
            rig.worker.aspath_cache.info(path_id).unwrap().aspa_result,
            ValidationState::Unknown
        );
        assert_eq!(
            rig.tracker.aspa_of(update_id),
            Some(ValidationState::Unknown)
        );
    }

    #[test]
    fn roa_events_reach_the_prefix_cache() {
        let rig = rig();
        let update_id = UpdateId(1);
        rig.update_cache.store(
            update_id, "10.0.1.0/24".parse().unwrap(), 65000,
            BgpsecData::default(), DefaultResult::default(), 1,
        );
        rig.worker.prefix_cache.request_update_validation(
            update_id, "10.0.1.0/24".parse().unwrap(), 65000
        );
        rig.worker.process(RpkiEvent::RoaAdded {
            origin: 65000,
            prefix: "10.0.0.0/16".parse().unwrap(),
            max_len: 24,
            session_id: 1,
            cache_id: 1,
        });
        assert_eq!(
            rig.worker.prefix_cache.roa_match_of(update_id), Some(1)
        );
    }
}
