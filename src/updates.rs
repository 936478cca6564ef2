//! The update cache.
//!
//! The update cache is the fingerprint-keyed store of all updates the server
//! currently knows about, together with their validation results and the
//! set of clients that subscribed to them. It is the one place result
//! changes funnel through: whoever computes a new result calls
//! [`UpdateCache::modify_result`] and the cache notifies the registered
//! [`UpdateListener`] about every observable change.
//!
//! Updates whose last subscriber detaches are not dropped immediately but
//! linger as zombies for a keep window, so a rebooting router finds its
//! state again when it reconnects.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use log::{debug, warn};
use crate::payload::{
    AddressPrefix, BgpsecData, DefaultResult, ResultUpdate, RouteResult,
    UpdateId, VerifyFlags,
};


//------------ UpdateListener ------------------------------------------------

/// A callback target for result changes.
///
/// The server installs a broadcaster that fans changes out to the client
/// sockets; tests install a collector.
pub trait UpdateListener: Send + Sync {
    fn update_result_changed(&self, change: &ResultChange);
}

/// A single observable result change of an update.
#[derive(Clone, Debug)]
pub struct ResultChange {
    /// The update whose result changed.
    pub update_id: UpdateId,

    /// The full result tuple after the change.
    pub result: RouteResult,

    /// The axes that actually changed.
    pub changed: VerifyFlags,

    /// The client slots subscribed at the time of the change.
    pub clients: Vec<u8>,
}


//------------ StoreOutcome --------------------------------------------------

/// What happened when an update was offered to the cache.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StoreOutcome {
    /// The update was new and has been inserted under this id.
    Created(UpdateId),

    /// An update with identical payload already existed under this id.
    ///
    /// The caller’s default result was ignored.
    AlreadyPresent(UpdateId),
}

impl StoreOutcome {
    pub fn update_id(self) -> UpdateId {
        match self {
            StoreOutcome::Created(id) => id,
            StoreOutcome::AlreadyPresent(id) => id,
        }
    }
}


//------------ UpdateInfo ----------------------------------------------------

/// A snapshot of the parts of an update the command handler works with.
#[derive(Clone, Debug)]
pub struct UpdateInfo {
    pub update_id: UpdateId,
    pub prefix: AddressPrefix,
    pub origin: u32,
    pub bgpsec: BgpsecData,
    pub path_id: u32,
    pub default: DefaultResult,
    pub current: RouteResult,
}


//------------ SignatureRecord -----------------------------------------------

/// A cached signing result for an update.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SignatureRecord {
    pub peer_as: u32,
    pub prepend_counter: u32,
    pub algorithm: u16,
    pub signature: Vec<u8>,
}


//------------ UpdateCache ---------------------------------------------------

/// The update cache.
pub struct UpdateCache {
    /// All updates keyed by their final, collision-free id.
    ///
    /// The outer lock protects the map structure, the inner lock one
    /// entry. The listener is never invoked while either is held.
    entries: RwLock<HashMap<UpdateId, Arc<Mutex<Entry>>>>,

    /// The target of change notifications.
    listener: Arc<dyn UpdateListener>,

    /// Client slots currently undergoing a bulk unregister.
    ///
    /// While a slot is marked here, no new subscriptions for it are
    /// accepted so the sweep cannot race new registrations.
    locked_clients: Mutex<ClientSet>,
}

struct Entry {
    prefix: AddressPrefix,
    origin: u32,
    bgpsec: BgpsecData,
    path_id: u32,
    default: DefaultResult,
    current: RouteResult,
    clients: ClientSet,
    lifecycle: Lifecycle,
    signature: Option<SignatureRecord>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Lifecycle {
    /// At least one client is subscribed.
    Active,

    /// No subscribers; reap after the deadline.
    Zombie(Instant),
}

impl UpdateCache {
    /// Creates a new update cache notifying the given listener.
    pub fn new(listener: Arc<dyn UpdateListener>) -> Self {
        UpdateCache {
            entries: RwLock::new(HashMap::new()),
            listener,
            locked_clients: Mutex::new(ClientSet::empty()),
        }
    }

    /// Returns the number of updates currently stored, zombies included.
    pub fn len(&self) -> usize {
        self.entries.read().expect("poisoned lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns a snapshot of an update if it exists.
    pub fn lookup(&self, update_id: UpdateId) -> Option<UpdateInfo> {
        let entry = self.entry(update_id)?;
        let entry = entry.lock().expect("poisoned lock");
        Some(UpdateInfo {
            update_id,
            prefix: entry.prefix,
            origin: entry.origin,
            bgpsec: entry.bgpsec.clone(),
            path_id: entry.path_id,
            default: entry.default,
            current: entry.current,
        })
    }

    /// Checks whether `update_id` is taken by a different update.
    ///
    /// Returns `true` iff an entry with this id exists whose normalized
    /// payload differs from the probe. Callers resolve a collision by
    /// incrementing the id and probing again.
    pub fn collision_check(
        &self,
        update_id: UpdateId,
        prefix: AddressPrefix,
        origin: u32,
        bgpsec: &BgpsecData,
    ) -> bool {
        match self.entry(update_id) {
            Some(entry) => {
                let entry = entry.lock().expect("poisoned lock");
                entry.prefix != prefix
                    || entry.origin != origin
                    || entry.bgpsec != *bgpsec
            }
            None => false
        }
    }

    /// Stores an update, subscribing `client` if it is a real slot.
    ///
    /// The caller must have resolved fingerprint collisions beforehand via
    /// [`collision_check`][Self::collision_check]. If the update already
    /// exists, the supplied default result is ignored.
    pub fn store(
        &self,
        update_id: UpdateId,
        prefix: AddressPrefix,
        origin: u32,
        bgpsec: BgpsecData,
        default: DefaultResult,
        client: u8,
    ) -> StoreOutcome {
        let mut entries = self.entries.write().expect("poisoned lock");
        if let Some(entry) = entries.get(&update_id) {
            let mut entry = entry.lock().expect("poisoned lock");
            if client > 0 && !self.client_is_locked(client) {
                entry.clients.add(client);
                entry.lifecycle = Lifecycle::Active;
            }
            return StoreOutcome::AlreadyPresent(update_id)
        }
        let mut clients = ClientSet::empty();
        let lifecycle = if client > 0 {
            clients.add(client);
            Lifecycle::Active
        }
        else {
            Lifecycle::Zombie(Instant::now())
        };
        entries.insert(update_id, Arc::new(Mutex::new(Entry {
            prefix,
            origin,
            bgpsec,
            path_id: 0,
            default,
            current: RouteResult::undefined(),
            clients,
            lifecycle,
            signature: None,
        })));
        debug!("update {}: stored", update_id);
        StoreOutcome::Created(update_id)
    }

    /// Subscribes a client slot to an update.
    ///
    /// Fails if the update does not exist or the slot is currently being
    /// unregistered.
    pub fn subscribe(&self, update_id: UpdateId, client: u8) -> bool {
        if client == 0 || self.client_is_locked(client) {
            return false
        }
        match self.entry(update_id) {
            Some(entry) => {
                let mut entry = entry.lock().expect("poisoned lock");
                entry.clients.add(client);
                entry.lifecycle = Lifecycle::Active;
                true
            }
            None => false
        }
    }

    /// Detaches a client slot from an update.
    ///
    /// If this was the last subscriber, the update becomes a zombie that is
    /// kept for at least `keep_window` before reaping.
    pub fn unsubscribe(
        &self, update_id: UpdateId, client: u8, keep_window: Duration
    ) -> bool {
        match self.entry(update_id) {
            Some(entry) => {
                let mut entry = entry.lock().expect("poisoned lock");
                if !entry.clients.remove(client) {
                    return false
                }
                if entry.clients.is_empty() {
                    entry.lifecycle = Lifecycle::Zombie(
                        Instant::now() + keep_window
                    );
                }
                true
            }
            None => false
        }
    }

    /// Returns the client slots subscribed to an update.
    pub fn clients_of(&self, update_id: UpdateId) -> Vec<u8> {
        match self.entry(update_id) {
            Some(entry) => {
                entry.lock().expect("poisoned lock").clients.to_vec()
            }
            None => Vec::new()
        }
    }

    /// Applies a partial result change to an update.
    ///
    /// Axes left at `None` stay untouched. Every axis that actually changes
    /// is reported to the listener in a single notification; a change that
    /// leaves all values as they were is a no-op and stays silent.
    ///
    /// Returns `false` if the update does not exist.
    pub fn modify_result(
        &self, update_id: UpdateId, update: ResultUpdate
    ) -> bool {
        let entry = match self.entry(update_id) {
            Some(entry) => entry,
            None => {
                warn!(
                    "result change for unknown update {} dropped", update_id
                );
                return false
            }
        };
        let change = {
            let mut entry = entry.lock().expect("poisoned lock");
            let changed = entry.current.apply(update);
            if changed.is_empty() {
                return true
            }
            ResultChange {
                update_id,
                result: entry.current,
                changed,
                clients: entry.clients.to_vec(),
            }
        };
        // The entry lock is gone; per-update changes stay totally ordered
        // because each validation axis has a single writer.
        self.listener.update_result_changed(&change);
        true
    }

    /// Records the interned path id of an update.
    pub fn set_path_id(&self, update_id: UpdateId, path_id: u32) -> bool {
        match self.entry(update_id) {
            Some(entry) => {
                entry.lock().expect("poisoned lock").path_id = path_id;
                true
            }
            None => false
        }
    }

    /// Returns a cached signature if one matches the request.
    pub fn signature_of(
        &self, update_id: UpdateId, peer_as: u32, prepend_counter: u32,
        algorithm: u16,
    ) -> Option<Vec<u8>> {
        let entry = self.entry(update_id)?;
        let entry = entry.lock().expect("poisoned lock");
        let record = entry.signature.as_ref()?;
        if record.peer_as == peer_as
            && record.prepend_counter == prepend_counter
            && record.algorithm == algorithm
        {
            Some(record.signature.clone())
        }
        else {
            None
        }
    }

    /// Caches a signing result for an update.
    pub fn store_signature(
        &self, update_id: UpdateId, record: SignatureRecord
    ) -> bool {
        match self.entry(update_id) {
            Some(entry) => {
                entry.lock().expect("poisoned lock")
                    .signature = Some(record);
                true
            }
            None => false
        }
    }

    /// Detaches a client slot from every update it is subscribed to.
    ///
    /// Updates left without subscribers become zombies with the given keep
    /// window. While the sweep runs, new subscriptions for the slot are
    /// refused. Returns the number of detached subscriptions.
    pub fn unregister_client(
        &self, client: u8, keep_window: Duration
    ) -> usize {
        if client == 0 {
            return 0
        }
        self.locked_clients.lock().expect("poisoned lock").add(client);
        let entries: Vec<_> = self.entries.read().expect("poisoned lock")
            .values().cloned().collect();
        let mut count = 0;
        let deadline = Instant::now() + keep_window;
        for entry in entries {
            let mut entry = entry.lock().expect("poisoned lock");
            if entry.clients.remove(client) {
                count += 1;
                if entry.clients.is_empty() {
                    entry.lifecycle = Lifecycle::Zombie(deadline);
                }
            }
        }
        self.locked_clients.lock().expect("poisoned lock").remove(client);
        debug!(
            "client {:#04x}: detached from {} updates", client, count
        );
        count
    }

    /// Drops all zombie updates whose keep window has expired.
    ///
    /// Returns the number of reaped updates.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().expect("poisoned lock");
        let before = entries.len();
        entries.retain(|_, entry| {
            match entry.lock().expect("poisoned lock").lifecycle {
                Lifecycle::Zombie(deadline) => deadline > now,
                Lifecycle::Active => true,
            }
        });
        before - entries.len()
    }

    fn entry(&self, update_id: UpdateId) -> Option<Arc<Mutex<Entry>>> {
        self.entries.read().expect("poisoned lock")
            .get(&update_id).cloned()
    }

    fn client_is_locked(&self, client: u8) -> bool {
        self.locked_clients.lock().expect("poisoned lock").contains(client)
    }
}


//------------ ClientSet -----------------------------------------------------

/// A set of client slot ids as a 256 bit bitmap.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ClientSet([u64; 4]);

impl ClientSet {
    pub fn empty() -> Self {
        ClientSet([0; 4])
    }

    pub fn add(&mut self, client: u8) {
        self.0[usize::from(client >> 6)] |= 1 << (client & 0x3f);
    }

    /// Removes a client, returning whether it was present.
    pub fn remove(&mut self, client: u8) -> bool {
        let slot = &mut self.0[usize::from(client >> 6)];
        let mask = 1 << (client & 0x3f);
        let present = *slot & mask != 0;
        *slot &= !mask;
        present
    }

    pub fn contains(&self, client: u8) -> bool {
        self.0[usize::from(client >> 6)] & (1 << (client & 0x3f)) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|word| *word == 0)
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let mut res = Vec::new();
        for client in 0..=255u8 {
            if self.contains(client) {
                res.push(client)
            }
        }
        res
    }
}


//============ Tests =========================================================
