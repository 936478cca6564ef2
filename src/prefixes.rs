//! The prefix cache.
//!
//! The prefix cache joins the ROA whitelist received from the RTR feed with
//! the updates awaiting origin validation. Both are attached to the nodes of
//! a shared patricia trie: each payload-carrying node knows the ROAs rooted
//! at its prefix, the updates announced for exactly its prefix, and the
//! validation state non-matching updates at this prefix have
//! (`state_of_other`).
//!
//! The cache maintains three counters that make incremental revalidation
//! cheap: `roa_coverage` on a prefix counts the ROA copies covering it from
//! this node or any ancestor, `roa_match` on an update counts the ROA
//! copies matching its origin, and an update sits in the `valid` list iff
//! `roa_match > 0`. ROA arrival and withdrawal only touch the subtree below
//! the ROA prefix; update arrival only walks the ancestor chain.
//!
//! Result changes are collected while the tree lock is held and handed to
//! the update cache only after it has been released.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use log::{debug, error, info, warn};
use crate::payload::{AddressPrefix, ResultUpdate, UpdateId, ValidationState};
use crate::trie::{NodeIx, PrefixTree};
use crate::updates::UpdateCache;


//------------ belongs_to_rfc5398 --------------------------------------------

/// Returns whether an AS number is reserved for documentation use.
pub fn belongs_to_rfc5398(asn: u32) -> bool {
    (64496..=64511).contains(&asn) || (65536..=65551).contains(&asn)
}


//------------ OtherState ----------------------------------------------------

/// The validation state of the updates in a prefix’ `other` list.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum OtherState {
    NotFound,
    Invalid,
}

impl From<OtherState> for ValidationState {
    fn from(state: OtherState) -> Self {
        match state {
            OtherState::NotFound => ValidationState::NotFound,
            OtherState::Invalid => ValidationState::Invalid,
        }
    }
}


//------------ PcPrefix and friends ------------------------------------------

/// The payload of a trie node that carries ROAs or updates.
#[derive(Debug)]
struct PcPrefix {
    /// ROA copies covering this prefix from here or any ancestor.
    roa_coverage: u32,

    /// The state of updates whose origin no covering ROA matches.
    state_of_other: OtherState,

    /// The origin ASes attached to this prefix.
    as_list: Vec<PcAs>,

    /// Updates at this prefix with at least one matching ROA copy.
    valid: Vec<UpdateId>,

    /// All remaining updates at this prefix.
    other: Vec<UpdateId>,
}

impl PcPrefix {
    fn new(state_of_other: OtherState) -> Self {
        PcPrefix {
            roa_coverage: 0,
            state_of_other,
            as_list: Vec::new(),
            valid: Vec::new(),
            other: Vec::new(),
        }
    }

    fn as_entry(&mut self, asn: u32) -> &mut PcAs {
        if let Some(pos)
            = self.as_list.iter().position(|entry| entry.asn == asn)
        {
            return &mut self.as_list[pos]
        }
        self.as_list.push(PcAs {
            asn,
            update_count: 0,
            roas: Vec::new(),
        });
        self.as_list.last_mut().expect("just pushed")
    }

    fn move_to_valid(&mut self, update_id: UpdateId) {
        if let Some(pos)
            = self.other.iter().position(|uid| *uid == update_id)
        {
            self.other.remove(pos);
            self.valid.push(update_id);
        }
    }

    fn move_to_other(&mut self, update_id: UpdateId) {
        if let Some(pos)
            = self.valid.iter().position(|uid| *uid == update_id)
        {
            self.valid.remove(pos);
            self.other.push(update_id);
        }
    }
}

/// An origin AS attached to a prefix.
#[derive(Debug)]
struct PcAs {
    asn: u32,
    update_count: u32,
    roas: Vec<PcRoa>,
}

/// One distinct ROA whitelist entry attached to an AS.
///
/// Identical entries received multiple times (or from multiple caches via
/// distinct `cache_id`s) share one `PcRoa` with `roa_count` keeping the
/// multiplicity.
#[derive(Debug)]
struct PcRoa {
    max_len: u8,
    cache_id: u32,
    roa_count: u32,
    deferred_count: u32,
    update_count: u32,
}

/// An update known to the prefix cache.
#[derive(Debug)]
struct PcUpdate {
    origin: u32,
    node: NodeIx,
    roa_match: u32,
}


//------------ PrefixCache ---------------------------------------------------

/// The prefix cache.
pub struct PrefixCache {
    update_cache: Arc<UpdateCache>,
    tree: RwLock<CacheTree>,
}

/// Everything behind the tree lock.
struct CacheTree {
    trie: PrefixTree<PcPrefix>,
    updates: HashMap<UpdateId, PcUpdate>,
}

/// Result changes collected during a mutation.
type Notes = Vec<(UpdateId, ValidationState)>;

impl PrefixCache {
    /// Creates a prefix cache pushing result changes into an update cache.
    pub fn new(update_cache: Arc<UpdateCache>) -> Self {
        PrefixCache {
            update_cache,
            tree: RwLock::new(CacheTree {
                trie: PrefixTree::new(),
                updates: HashMap::new(),
            }),
        }
    }

    /// Returns the number of updates the cache tracks.
    pub fn update_count(&self) -> usize {
        self.tree.read().expect("poisoned lock").updates.len()
    }

    /// Returns how many ROA copies currently match an update’s origin.
    pub fn roa_match_of(&self, update_id: UpdateId) -> Option<u32> {
        self.tree.read().expect("poisoned lock")
            .updates.get(&update_id).map(|update| update.roa_match)
    }

    /// Returns the coverage counter of a prefix if it carries a payload.
    pub fn coverage_of(&self, prefix: AddressPrefix) -> Option<u32> {
        let tree = self.tree.read().expect("poisoned lock");
        let node = tree.trie.get(prefix)?;
        tree.trie.payload(node).map(|payload| payload.roa_coverage)
    }

    /// Performs origin validation for a newly arrived update.
    ///
    /// The update is installed at its prefix, matched against the ROAs
    /// covering it, and its initial ROA result is pushed into the update
    /// cache. Each update must only be requested once; later ROA changes
    /// keep it current automatically.
    pub fn request_update_validation(
        &self, update_id: UpdateId, prefix: AddressPrefix, origin: u32
    ) {
        let mut notes = Notes::new();
        {
            let mut tree = self.tree.write().expect("poisoned lock");
            if tree.updates.contains_key(&update_id) {
                warn!(
                    "prefix cache: update {} validated more than once",
                    update_id
                );
                return
            }
            self.install_update(&mut tree, update_id, prefix, origin,
                                &mut notes);
        }
        self.apply(notes);
    }

    /// Adds a ROA whitelist entry.
    ///
    /// Entries for documentation ASNs are silently ignored. Returns whether
    /// the entry was installed.
    pub fn add_roa(
        &self,
        origin: u32,
        prefix: AddressPrefix,
        max_len: u8,
        _session_id: u32,
        cache_id: u32,
    ) -> bool {
        if belongs_to_rfc5398(origin) {
            warn!(
                "ignoring whitelist entry for reserved AS{} from cache {}",
                origin, cache_id
            );
            return false
        }
        let mut notes = Notes::new();
        {
            let mut tree = self.tree.write().expect("poisoned lock");
            let node = tree.trie.insert_or_get(prefix);
            if tree.trie.payload(node).is_none() {
                let state = self.inherited_state(&tree, node);
                tree.trie.set_payload(node, PcPrefix::new(state));
                if state != OtherState::NotFound {
                    self.inherit_coverage(&mut tree, node, prefix);
                }
            }

            // Find or create the ROA entry below its origin AS.
            let payload = tree.trie.payload_mut(node).expect("just set");
            let as_entry = payload.as_entry(origin);
            match as_entry.roas.iter_mut().find(|roa| {
                roa.cache_id == cache_id && roa.max_len == max_len
            }) {
                Some(roa) => {
                    if roa.deferred_count > 0 {
                        // Re-affirmation after a session restart; the copy
                        // is already counted.
                        roa.deferred_count -= 1;
                        return true
                    }
                    roa.roa_count += 1;
                }
                None => {
                    as_entry.roas.push(PcRoa {
                        max_len,
                        cache_id,
                        roa_count: 1,
                        deferred_count: 0,
                        update_count: 0,
                    });
                }
            }

            self.verify_updates_add(
                &mut tree, node, node, origin, cache_id, max_len, &mut notes
            );
        }
        self.apply(notes);
        true
    }

    /// Withdraws a ROA whitelist entry.
    ///
    /// A withdrawal for an entry that was never installed is logged and
    /// ignored; for documentation ASNs that is the expected outcome.
    /// Returns whether an entry was removed.
    pub fn del_roa(
        &self,
        origin: u32,
        prefix: AddressPrefix,
        max_len: u8,
        _session_id: u32,
        cache_id: u32,
    ) -> bool {
        let mut notes = Notes::new();
        let removed = {
            let mut tree = self.tree.write().expect("poisoned lock");
            let node = tree.trie.get(prefix)
                .filter(|node| tree.trie.payload(*node).is_some());
            let node = match node {
                Some(node) => node,
                None => {
                    self.log_missing_withdrawal(origin, prefix, cache_id);
                    return false
                }
            };
            let found = {
                let payload = tree.trie.payload(node).expect("checked");
                payload.as_list.iter()
                    .find(|entry| entry.asn == origin)
                    .and_then(|entry| {
                        entry.roas.iter().find(|roa| {
                            roa.cache_id == cache_id
                                && roa.max_len == max_len
                        })
                    })
                    .map(|roa| roa.roa_count)
            };
            let roa_count = match found {
                Some(count) => count,
                None => {
                    self.log_missing_withdrawal(origin, prefix, cache_id);
                    return false
                }
            };

            let parent_state = self.inherited_state(&tree, node);
            self.revalidate_del(
                &mut tree, node, node, origin, cache_id, max_len,
                roa_count == 1, parent_state, &mut notes
            );
            self.drop_roa_copy(&mut tree, node, origin, cache_id, max_len);
            true
        };
        self.apply(notes);
        removed
    }

    /// Marks all entries of a validation cache as deferred.
    ///
    /// Used when the cache’s session restarts: entries re-affirmed by the
    /// incoming snapshot clear their mark in [`add_roa`][Self::add_roa];
    /// the rest is swept by [`clean_deferred`][Self::clean_deferred].
    pub fn flag_deferred(&self, cache_id: u32) -> usize {
        let mut tree = self.tree.write().expect("poisoned lock");
        let nodes = self.payload_nodes(&tree);
        let mut count = 0;
        for node in nodes {
            let payload = match tree.trie.payload_mut(node) {
                Some(payload) => payload,
                None => continue,
            };
            for as_entry in &mut payload.as_list {
                for roa in &mut as_entry.roas {
                    if roa.cache_id == cache_id {
                        roa.deferred_count = roa.roa_count;
                        count += 1;
                    }
                }
            }
        }
        count
    }

    /// Withdraws all ROA copies of a cache still flagged as deferred.
    pub fn clean_deferred(&self, cache_id: u32) -> usize {
        let stale = {
            let tree = self.tree.read().expect("poisoned lock");
            let mut stale = Vec::new();
            for node in self.payload_nodes(&tree) {
                let payload = match tree.trie.payload(node) {
                    Some(payload) => payload,
                    None => continue,
                };
                let prefix = tree.trie.prefix(node);
                for as_entry in &payload.as_list {
                    for roa in &as_entry.roas {
                        if roa.cache_id == cache_id
                            && roa.deferred_count > 0
                        {
                            stale.push((
                                as_entry.asn, prefix, roa.max_len,
                                roa.deferred_count
                            ));
                        }
                    }
                }
            }
            stale
        };
        let mut count = 0;
        for (origin, prefix, max_len, copies) in stale {
            for _ in 0..copies {
                if self.del_roa(origin, prefix, max_len, 0, cache_id) {
                    count += 1;
                }
            }
        }
        count
    }

    //--- Internal machinery. Everything below runs under the tree lock.

    /// Installs an update and matches it against the covering ROAs.
    fn install_update(
        &self,
        tree: &mut CacheTree,
        update_id: UpdateId,
        prefix: AddressPrefix,
        origin: u32,
        notes: &mut Notes,
    ) {
        let node = tree.trie.insert_or_get(prefix);
        let is_new = tree.trie.payload(node).is_none();
        if is_new {
            let state = self.inherited_state(tree, node);
            tree.trie.set_payload(node, PcPrefix::new(state));
        }
        tree.trie.payload_mut(node).expect("just set")
            .as_entry(origin).update_count += 1;

        let mut update = PcUpdate { origin, node, roa_match: 0 };
        let update_len = prefix.address_length();

        // Walk the ancestor chain while ROAs may cover this prefix. For a
        // fresh node an inherited `Invalid` state is the signal that ROAs
        // exist further up; a known node keeps the accumulated coverage.
        let mut coverage_gain = 0;
        let mut cur = Some(node);
        while let Some(cur_node) = cur {
            let proceed = {
                let payload = match tree.trie.payload(cur_node) {
                    Some(payload) => payload,
                    None => break,
                };
                if is_new {
                    payload.state_of_other == OtherState::Invalid
                }
                else {
                    payload.roa_coverage > 0
                }
            };
            if !proceed {
                break
            }
            let payload = tree.trie.payload_mut(cur_node).expect("checked");
            for as_entry in &mut payload.as_list {
                for roa in &mut as_entry.roas {
                    if roa.max_len < update_len {
                        continue
                    }
                    if is_new {
                        coverage_gain += roa.roa_count;
                    }
                    if as_entry.asn == origin {
                        update.roa_match += roa.roa_count;
                        roa.update_count += 1;
                    }
                }
            }
            cur = tree.trie.parent_with_payload(cur_node);
        }
        if coverage_gain > 0 {
            tree.trie.payload_mut(node).expect("just set")
                .roa_coverage += coverage_gain;
        }

        let payload = tree.trie.payload_mut(node).expect("just set");
        if update.roa_match > 0 {
            payload.valid.push(update_id);
            notes.push((update_id, ValidationState::Valid));
        }
        else {
            payload.other.push(update_id);
            notes.push((update_id, payload.state_of_other.into()));
        }
        tree.updates.insert(update_id, update);
        debug!(
            "prefix cache: update {} installed at {}", update_id, prefix
        );
    }

    /// Returns the `state_of_other` the closest carrying ancestor dictates.
    fn inherited_state(&self, tree: &CacheTree, node: NodeIx) -> OtherState {
        tree.trie.parent_with_payload(node)
            .and_then(|parent| tree.trie.payload(parent))
            .map(|payload| payload.state_of_other)
            .unwrap_or(OtherState::NotFound)
    }

    /// Accumulates coverage a freshly created prefix inherits from above.
    fn inherit_coverage(
        &self, tree: &mut CacheTree, node: NodeIx, prefix: AddressPrefix
    ) {
        let len = prefix.address_length();
        let mut gain = 0;
        let mut cur = tree.trie.parent_with_payload(node);
        while let Some(cur_node) = cur {
            let payload = match tree.trie.payload(cur_node) {
                Some(payload) => payload,
                None => break,
            };
            if payload.roa_coverage == 0 {
                break
            }
            for as_entry in &payload.as_list {
                for roa in &as_entry.roas {
                    if roa.max_len >= len {
                        gain += roa.roa_count;
                    }
                }
            }
            cur = tree.trie.parent_with_payload(cur_node);
        }
        if gain > 0 {
            tree.trie.payload_mut(node).expect("payload present")
                .roa_coverage += gain;
        }
    }

    /// Revalidates the subtree after one ROA copy arrived.
    #[allow(clippy::too_many_arguments)]
    fn verify_updates_add(
        &self,
        tree: &mut CacheTree,
        cur: NodeIx,
        roa_node: NodeIx,
        origin: u32,
        cache_id: u32,
        max_len: u8,
        notes: &mut Notes,
    ) {
        let covers = tree.trie.prefix(cur).address_length() <= max_len;
        let mut matched = 0;
        if covers {
            let payload = tree.trie.payload_mut(cur).expect("carrier");
            payload.roa_coverage += 1;

            // Updates that were already valid gain one matching copy.
            let valid = payload.valid.clone();
            let others = payload.other.clone();
            for uid in valid {
                let update = match tree.updates.get_mut(&uid) {
                    Some(update) => update,
                    None => {
                        error!(
                            "prefix cache: update {} listed but not \
                             tracked", uid
                        );
                        continue
                    }
                };
                if update.origin == origin {
                    update.roa_match += 1;
                    matched += 1;
                }
            }
            // Matching updates from `other` become valid now.
            for uid in others {
                let update = match tree.updates.get_mut(&uid) {
                    Some(update) => update,
                    None => {
                        error!(
                            "prefix cache: update {} listed but not \
                             tracked", uid
                        );
                        continue
                    }
                };
                if update.origin == origin {
                    update.roa_match += 1;
                    matched += 1;
                    tree.trie.payload_mut(cur).expect("carrier")
                        .move_to_valid(uid);
                    notes.push((uid, ValidationState::Valid));
                }
            }
            let payload = tree.trie.payload_mut(cur).expect("carrier");
            if payload.state_of_other == OtherState::NotFound {
                payload.state_of_other = OtherState::Invalid;
                for uid in &payload.other {
                    notes.push((*uid, ValidationState::Invalid));
                }
            }
        }
        else {
            let payload = tree.trie.payload_mut(cur).expect("carrier");
            if payload.state_of_other == OtherState::NotFound {
                payload.state_of_other = OtherState::Invalid;
                for uid in &payload.other {
                    notes.push((*uid, ValidationState::Invalid));
                }
            }
            else {
                // Nothing changed here, so nothing can change below.
                return
            }
        }
        self.bump_roa_update_count(
            tree, roa_node, origin, cache_id, max_len, matched as i64
        );
        for child in tree.trie.children_with_payload(cur) {
            self.verify_updates_add(
                tree, child, roa_node, origin, cache_id, max_len, notes
            );
        }
    }

    /// Revalidates the subtree before one ROA copy is removed.
    #[allow(clippy::too_many_arguments)]
    fn revalidate_del(
        &self,
        tree: &mut CacheTree,
        cur: NodeIx,
        roa_node: NodeIx,
        origin: u32,
        cache_id: u32,
        max_len: u8,
        last_copy: bool,
        parent_state: OtherState,
        notes: &mut Notes,
    ) {
        let covers = tree.trie.prefix(cur).address_length() <= max_len;
        let mut recurse = false;
        if covers {
            {
                let cur_prefix = tree.trie.prefix(cur);
                let payload = tree.trie.payload_mut(cur).expect("carrier");
                if payload.roa_coverage == 0 {
                    error!(
                        "prefix cache: coverage of {} would drop below \
                         zero, ignoring",
                        cur_prefix
                    );
                }
                else {
                    payload.roa_coverage -= 1;
                }
                if parent_state == OtherState::NotFound
                    && payload.roa_coverage == 0
                {
                    payload.state_of_other = OtherState::NotFound;
                    for uid in &payload.other {
                        notes.push((*uid, ValidationState::NotFound));
                    }
                }
            }

            // Matching updates lose one copy; at zero they move to other.
            let mut remaining = self.roa_update_count(
                tree, roa_node, origin, cache_id, max_len
            );
            let mut removed = 0;
            let valid = tree.trie.payload(cur).expect("carrier")
                .valid.clone();
            for uid in valid {
                if remaining == 0 {
                    break
                }
                let update = match tree.updates.get_mut(&uid) {
                    Some(update) => update,
                    None => {
                        error!(
                            "prefix cache: update {} listed but not \
                             tracked", uid
                        );
                        continue
                    }
                };
                if update.origin != origin {
                    continue
                }
                if update.roa_match == 0 {
                    error!(
                        "prefix cache: match count of update {} would \
                         drop below zero, ignoring",
                        uid
                    );
                    continue
                }
                update.roa_match -= 1;
                if last_copy {
                    remaining -= 1;
                    removed += 1;
                }
                if update.roa_match == 0 {
                    let payload
                        = tree.trie.payload_mut(cur).expect("carrier");
                    payload.move_to_other(uid);
                    notes.push((uid, payload.state_of_other.into()));
                }
            }
            if removed > 0 {
                self.bump_roa_update_count(
                    tree, roa_node, origin, cache_id, max_len, -removed
                );
            }
            recurse = true;
        }
        else {
            let payload = tree.trie.payload_mut(cur).expect("carrier");
            if payload.roa_coverage == 0
                && parent_state == OtherState::NotFound
            {
                payload.state_of_other = OtherState::NotFound;
                for uid in &payload.other {
                    notes.push((*uid, ValidationState::NotFound));
                }
                recurse = true;
            }
        }

        if recurse {
            let state = tree.trie.payload(cur).expect("carrier")
                .state_of_other;
            for child in tree.trie.children_with_payload(cur) {
                self.revalidate_del(
                    tree, child, roa_node, origin, cache_id, max_len,
                    last_copy, state, notes
                );
            }
        }
    }

    /// Removes one ROA copy and cascades empty containers.
    fn drop_roa_copy(
        &self,
        tree: &mut CacheTree,
        node: NodeIx,
        origin: u32,
        cache_id: u32,
        max_len: u8,
    ) {
        let payload = match tree.trie.payload_mut(node) {
            Some(payload) => payload,
            None => return,
        };
        let as_pos = match payload.as_list.iter()
            .position(|entry| entry.asn == origin)
        {
            Some(pos) => pos,
            None => return,
        };
        let as_entry = &mut payload.as_list[as_pos];
        let roa_pos = match as_entry.roas.iter().position(|roa| {
            roa.cache_id == cache_id && roa.max_len == max_len
        }) {
            Some(pos) => pos,
            None => return,
        };
        let roa = &mut as_entry.roas[roa_pos];
        roa.roa_count = roa.roa_count.saturating_sub(1);
        if roa.roa_count == 0 {
            as_entry.roas.remove(roa_pos);
            if as_entry.roas.is_empty() && as_entry.update_count == 0 {
                payload.as_list.remove(as_pos);
                if payload.as_list.is_empty() {
                    // Updates may still sit here; keep the payload then.
                    if payload.valid.is_empty() && payload.other.is_empty() {
                        tree.trie.clear_payload(node);
                    }
                }
            }
        }
    }

    fn roa_update_count(
        &self, tree: &CacheTree, node: NodeIx, origin: u32, cache_id: u32,
        max_len: u8,
    ) -> i64 {
        tree.trie.payload(node)
            .and_then(|payload| {
                payload.as_list.iter().find(|entry| entry.asn == origin)
            })
            .and_then(|entry| {
                entry.roas.iter().find(|roa| {
                    roa.cache_id == cache_id && roa.max_len == max_len
                })
            })
            .map(|roa| i64::from(roa.update_count))
            .unwrap_or(0)
    }

    fn bump_roa_update_count(
        &self, tree: &mut CacheTree, node: NodeIx, origin: u32,
        cache_id: u32, max_len: u8, delta: i64,
    ) {
        if delta == 0 {
            return
        }
        let roa = tree.trie.payload_mut(node)
            .and_then(|payload| {
                payload.as_list.iter_mut()
                    .find(|entry| entry.asn == origin)
            })
            .and_then(|entry| {
                entry.roas.iter_mut().find(|roa| {
                    roa.cache_id == cache_id && roa.max_len == max_len
                })
            });
        if let Some(roa) = roa {
            let count = i64::from(roa.update_count) + delta;
            if count < 0 {
                error!(
                    "prefix cache: ROA update count would drop below zero, \
                     clamping"
                );
                roa.update_count = 0;
            }
            else {
                roa.update_count = count as u32;
            }
        }
    }

    /// Collects all payload-carrying nodes.
    fn payload_nodes(&self, tree: &CacheTree) -> Vec<NodeIx> {
        tree.trie.carriers()
    }

    fn log_missing_withdrawal(
        &self, origin: u32, prefix: AddressPrefix, cache_id: u32
    ) {
        if belongs_to_rfc5398(origin) {
            info!(
                "whitelist withdrawal for reserved AS{} from cache {}; \
                 entry was never installed, as expected",
                origin, cache_id
            );
        }
        else {
            warn!(
                "whitelist withdrawal for unknown entry AS{} {} from \
                 cache {}",
                origin, prefix, cache_id
            );
        }
    }

    /// Applies collected result changes to the update cache.
    ///
    /// Runs strictly after the tree lock has been released.
    fn apply(&self, notes: Notes) {
        for (update_id, state) in notes {
            self.update_cache.modify_result(
                update_id, ResultUpdate::roa(state)
            );
        }
    }
}


//============ Tests =========================================================
