//! The AS path cache.
//!
//! AS paths arrive with every verify request but repeat heavily across
//! updates. The cache interns each path once under a deterministic path id
//! and remembers the last ASPA validation result together with when it was
//! computed, so a path shared by many updates is validated once and
//! revalidated only when the ASPA store changed underneath it.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use chrono::{DateTime, Utc};
use log::debug;
use crate::payload::{
    path_fingerprint, AsPathKind, PathDirection, UpdateId, ValidationState,
};


//------------ PathInfo ------------------------------------------------------

/// A snapshot of an interned path.
#[derive(Clone, Debug)]
pub struct PathInfo {
    pub path_id: u32,
    pub as_path: Vec<u32>,
    pub kind: AsPathKind,
    pub direction: PathDirection,
    pub afi: u16,
    pub aspa_result: ValidationState,
    pub last_modified: DateTime<Utc>,
}


//------------ AsPathCache ---------------------------------------------------

/// The AS path cache.
#[derive(Debug, Default)]
pub struct AsPathCache {
    entries: RwLock<HashMap<u32, Entry>>,
}

#[derive(Debug)]
struct Entry {
    as_path: Vec<u32>,
    kind: AsPathKind,
    direction: PathDirection,
    afi: u16,
    aspa_result: ValidationState,
    last_modified: DateTime<Utc>,
    updates: HashSet<UpdateId>,
}

impl AsPathCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().expect("poisoned lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().expect("poisoned lock").is_empty()
    }

    /// Interns a path and registers the referencing update.
    ///
    /// Returns the path id. An existing entry keeps its cached result; its
    /// direction and AFI are refreshed from the latest request.
    pub fn intern(
        &self,
        path: &[u32],
        kind: AsPathKind,
        direction: PathDirection,
        afi: u16,
        update_id: UpdateId,
    ) -> u32 {
        let path_id = path_fingerprint(path, kind);
        let mut entries = self.entries.write().expect("poisoned lock");
        let entry = entries.entry(path_id).or_insert_with(|| {
            debug!("as path cache: interned path 0x{:08X}", path_id);
            Entry {
                as_path: path.to_vec(),
                kind,
                direction,
                afi,
                aspa_result: ValidationState::Undefined,
                last_modified: Utc::now(),
                updates: HashSet::new(),
            }
        });
        entry.direction = direction;
        entry.afi = afi;
        entry.updates.insert(update_id);
        path_id
    }

    /// Returns a snapshot of an interned path.
    pub fn info(&self, path_id: u32) -> Option<PathInfo> {
        let entries = self.entries.read().expect("poisoned lock");
        entries.get(&path_id).map(|entry| PathInfo {
            path_id,
            as_path: entry.as_path.clone(),
            kind: entry.kind,
            direction: entry.direction,
            afi: entry.afi,
            aspa_result: entry.aspa_result,
            last_modified: entry.last_modified,
        })
    }

    /// Writes back a validation result.
    ///
    /// The modification time is only touched when the result actually
    /// changed. Returns whether it did.
    pub fn set_result(
        &self, path_id: u32, result: ValidationState
    ) -> bool {
        let mut entries = self.entries.write().expect("poisoned lock");
        match entries.get_mut(&path_id) {
            Some(entry) => {
                if entry.aspa_result == result {
                    return false
                }
                entry.aspa_result = result;
                entry.last_modified = Utc::now();
                true
            }
            None => false
        }
    }

    /// Returns the updates referencing a path.
    pub fn updates_of(&self, path_id: u32) -> Vec<UpdateId> {
        self.entries.read().expect("poisoned lock")
            .get(&path_id)
            .map(|entry| entry.updates.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Drops an update reference, e.g. after the update was reaped.
    pub fn release_update(&self, path_id: u32, update_id: UpdateId) {
        let mut entries = self.entries.write().expect("poisoned lock");
        if let Some(entry) = entries.get_mut(&path_id) {
            entry.updates.remove(&update_id);
        }
    }

    /// Returns the referenced paths not validated since the given time.
    pub fn stale_paths(&self, since: DateTime<Utc>) -> Vec<u32> {
        self.entries.read().expect("poisoned lock")
            .iter()
            .filter(|(_, entry)| {
                entry.last_modified < since && !entry.updates.is_empty()
            })
            .map(|(path_id, _)| *path_id)
            .collect()
    }

    /// Returns the referenced paths that contain the given ASN.
    pub fn paths_containing(&self, asn: u32) -> Vec<u32> {
        self.entries.read().expect("poisoned lock")
            .iter()
            .filter(|(_, entry)| {
                !entry.updates.is_empty() && entry.as_path.contains(&asn)
            })
            .map(|(path_id, _)| *path_id)
            .collect()
    }
}


//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intern_is_deterministic_and_shared() {
        let cache = AsPathCache::new();
        let a = cache.intern(
            &[65001, 65000], AsPathKind::Sequence,
            PathDirection::UpStream, 1, UpdateId(1),
        );
        let b = cache.intern(
            &[65001, 65000], AsPathKind::Sequence,
            PathDirection::UpStream, 1, UpdateId(2),
        );
        assert_eq!(a, b);
        assert_eq!(cache.len(), 1);
        let mut updates = cache.updates_of(a);
        updates.sort();
        assert_eq!(updates, vec![UpdateId(1), UpdateId(2)]);

        // Kind is part of the identity.
        let c = cache.intern(
            &[65001, 65000], AsPathKind::Set,
            PathDirection::UpStream, 1, UpdateId(3),
        );
        assert_ne!(a, c);
    }

    #[test]
    fn result_cache_round_trip() {
        let cache = AsPathCache::new();
        let id = cache.intern(
            &[65001, 65000], AsPathKind::Sequence,
            PathDirection::UpStream, 1, UpdateId(1),
        );
        assert_eq!(
            cache.info(id).unwrap().aspa_result,
            ValidationState::Undefined
        );
        assert!(cache.set_result(id, ValidationState::Valid));
        assert!(!cache.set_result(id, ValidationState::Valid));
        assert_eq!(
            cache.info(id).unwrap().aspa_result, ValidationState::Valid
        );
        assert!(!cache.set_result(0xdead_beef, ValidationState::Valid));
    }

    #[test]
    fn stale_paths_report_referenced_entries_only() {
        let cache = AsPathCache::new();
        let id = cache.intern(
            &[65001, 65000], AsPathKind::Sequence,
            PathDirection::UpStream, 1, UpdateId(1),
        );
        cache.set_result(id, ValidationState::Unknown);
        let after = Utc::now() + chrono::Duration::seconds(1);
        assert_eq!(cache.stale_paths(after), vec![id]);
        assert!(cache.stale_paths(
            Utc::now() - chrono::Duration::hours(1)
        ).is_empty());

        // Without referencing updates the path is skipped.
        cache.release_update(id, UpdateId(1));
        assert!(cache.stale_paths(after).is_empty());
    }

    #[test]
    fn paths_containing_finds_members() {
        let cache = AsPathCache::new();
        let id = cache.intern(
            &[65001, 65000], AsPathKind::Sequence,
            PathDirection::UpStream, 1, UpdateId(1),
        );
        assert_eq!(cache.paths_containing(65000), vec![id]);
        assert!(cache.paths_containing(65099).is_empty());
    }
}
