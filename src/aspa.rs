//! ASPA objects and AS path validation.
//!
//! The ASPA store keeps the customer-to-provider authorizations received
//! from the RTR feed. The validator walks an AS path against the store,
//! upstream or downstream, and reduces the per-hop lookups to a single
//! validation state for the path.

use std::collections::HashMap;
use std::sync::RwLock;
use log::debug;
use crate::payload::{AsPathKind, PathDirection, ValidationState};


//------------ Afi -----------------------------------------------------------

/// The address family identifiers the ASPA store distinguishes.
pub const AFI_IPV4: u16 = 1;
pub const AFI_IPV6: u16 = 2;

/// Clamps an AFI value to something the store knows.
fn usable_afi(afi: u16) -> u16 {
    if afi == 0 || afi > AFI_IPV6 {
        AFI_IPV4
    }
    else {
        afi
    }
}


//------------ AspaObject ----------------------------------------------------

/// A single ASPA object.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AspaObject {
    pub customer: u32,
    pub providers: Vec<u32>,
    pub afi: u16,
}


//------------ HopCheck ------------------------------------------------------

/// The outcome of a single customer/provider lookup.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HopCheck {
    /// An object for the customer lists the provider.
    Valid,

    /// An object for the customer exists but does not list the provider.
    Invalid,

    /// No object for the customer exists.
    Unknown,
}


//------------ AspaStore -----------------------------------------------------

/// The customer-AS keyed set of ASPA objects.
#[derive(Debug, Default)]
pub struct AspaStore {
    /// All objects, keyed by customer ASN. At most one object per AFI.
    objects: RwLock<HashMap<u32, Vec<AspaObject>>>,
}

impl AspaStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored objects.
    pub fn len(&self) -> usize {
        self.objects.read().expect("poisoned lock")
            .values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().expect("poisoned lock").is_empty()
    }

    /// Adds an object, replacing a previous one for the same customer/AFI.
    pub fn add(&self, customer: u32, providers: Vec<u32>, afi: u16) {
        let afi = usable_afi(afi);
        let mut objects = self.objects.write().expect("poisoned lock");
        let list = objects.entry(customer).or_default();
        list.retain(|object| object.afi != afi);
        list.push(AspaObject { customer, providers, afi });
        debug!("aspa store: object for AS{} (afi {}) installed",
               customer, afi);
    }

    /// Withdraws the object for a customer/AFI pair.
    pub fn withdraw(&self, customer: u32, afi: u16) -> bool {
        let afi = usable_afi(afi);
        let mut objects = self.objects.write().expect("poisoned lock");
        match objects.get_mut(&customer) {
            Some(list) => {
                let before = list.len();
                list.retain(|object| object.afi != afi);
                let removed = list.len() != before;
                if list.is_empty() {
                    objects.remove(&customer);
                }
                removed
            }
            None => false
        }
    }

    /// Returns whether any object for the customer exists.
    pub fn contains_customer(&self, customer: u32) -> bool {
        self.objects.read().expect("poisoned lock")
            .contains_key(&customer)
    }

    /// Performs the per-hop lookup of the validation algorithm.
    pub fn hop_check(
        &self, customer: u32, provider: u32, afi: u16
    ) -> HopCheck {
        let afi = usable_afi(afi);
        let objects = self.objects.read().expect("poisoned lock");
        match objects.get(&customer) {
            Some(list) => {
                let listed = list.iter().any(|object| {
                    object.afi == afi
                        && object.providers.contains(&provider)
                });
                if listed {
                    HopCheck::Valid
                }
                else {
                    HopCheck::Invalid
                }
            }
            None => HopCheck::Unknown
        }
    }
}


//------------ validate_aspa -------------------------------------------------

/// Validates an AS path against the ASPA store.
///
/// Anything that is not a plain AS_SEQUENCE has no hop order to walk and
/// is `Unverifiable` before a single lookup happens. For a sequence, the
/// path is taken in wire order, i.e., towards the originator with the
/// originator last, and reversed to originator-first order before the hop
/// walk. Any `Invalid` hop short-circuits the whole path to `Invalid`;
/// otherwise a path with unknown hops is `Unknown` and a fully attested
/// path `Valid`.
pub fn validate_aspa(
    path: &[u32],
    kind: AsPathKind,
    direction: PathDirection,
    afi: u16,
    store: &AspaStore,
) -> ValidationState {
    if kind != AsPathKind::Sequence {
        return ValidationState::Unverifiable
    }
    let afi = usable_afi(afi);
    let mut unknown = false;

    // Originator-first order.
    let mut list: Vec<u32> = path.to_vec();
    list.reverse();
    let n = list.len();

    match direction {
        PathDirection::UpStream | PathDirection::UnknownStream => {
            for idx in 0..n.saturating_sub(1) {
                match store.hop_check(list[idx], list[idx + 1], afi) {
                    HopCheck::Valid => {}
                    HopCheck::Unknown => unknown = true,
                    HopCheck::Invalid => {
                        return ValidationState::Invalid
                    }
                }
            }
        }
        PathDirection::DownStream => {
            if n > 1 {
                // The longest attested run from the originator side.
                let mut i_max = 0;
                for idx in 1..=n - 2 {
                    if store.hop_check(list[idx - 1], list[idx], afi)
                        == HopCheck::Valid
                    {
                        i_max = idx;
                    }
                    else {
                        break
                    }
                }
                let k = i_max + 1;
                if k != n - 1 {
                    // The longest attested run from the receiver side.
                    let mut j_max = 0;
                    for idx in 1..=n - k - 1 {
                        if store.hop_check(
                            list[n - idx], list[n - idx - 1], afi
                        ) == HopCheck::Valid
                        {
                            j_max = idx;
                        }
                        else {
                            break
                        }
                    }
                    let l = n - j_max;
                    if l - k >= 2 {
                        // Scan the interior forward for the first invalid
                        // hop, then backwards from there.
                        let mut first_invalid = 0;
                        for idx in k..=l - 2 {
                            if store.hop_check(
                                list[idx - 1], list[idx], afi
                            ) == HopCheck::Invalid
                            {
                                first_invalid = idx;
                                break
                            }
                            unknown = true;
                        }
                        if first_invalid != 0 {
                            for idx in first_invalid + 1..=l - 1 {
                                if store.hop_check(
                                    list[idx], list[idx - 1], afi
                                ) == HopCheck::Invalid
                                {
                                    return ValidationState::Invalid
                                }
                                unknown = true;
                            }
                        }
                    }
                }
            }
        }
    }

    if unknown {
        ValidationState::Unknown
    }
    else {
        ValidationState::Valid
    }
}


//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn store(objects: &[(u32, &[u32], u16)]) -> AspaStore {
        let store = AspaStore::new();
        for (customer, providers, afi) in objects {
            store.add(*customer, providers.to_vec(), *afi);
        }
        store
    }

    fn upstream(path: &[u32], store: &AspaStore) -> ValidationState {
        validate_aspa(
            path, AsPathKind::Sequence, PathDirection::UpStream,
            AFI_IPV4, store,
        )
    }

    fn downstream(path: &[u32], store: &AspaStore) -> ValidationState {
        validate_aspa(
            path, AsPathKind::Sequence, PathDirection::DownStream,
            AFI_IPV4, store,
        )
    }

    #[test]
    fn store_replaces_per_afi() {
        let store = store(&[(65000, &[65010], AFI_IPV4)]);
        assert_eq!(
            store.hop_check(65000, 65010, AFI_IPV4), HopCheck::Valid
        );
        store.add(65000, vec![65020], AFI_IPV4);
        assert_eq!(
            store.hop_check(65000, 65010, AFI_IPV4), HopCheck::Invalid
        );
        assert_eq!(
            store.hop_check(65000, 65020, AFI_IPV4), HopCheck::Valid
        );
        // A v6 object lives alongside the v4 one.
        store.add(65000, vec![65010], AFI_IPV6);
        assert_eq!(
            store.hop_check(65000, 65020, AFI_IPV4), HopCheck::Valid
        );
        assert_eq!(
            store.hop_check(65000, 65010, AFI_IPV6), HopCheck::Valid
        );
        assert!(store.withdraw(65000, AFI_IPV6));
        assert!(!store.withdraw(65000, AFI_IPV6));
        assert_eq!(
            store.hop_check(65000, 65010, AFI_IPV6), HopCheck::Invalid
        );
    }

    #[test]
    fn hop_check_unknown_without_object() {
        let store = store(&[]);
        assert_eq!(
            store.hop_check(65000, 65010, AFI_IPV4), HopCheck::Unknown
        );
    }

    // The wire path is originator-last, so [65020, 65010, 65000] means
    // 65000 originated and 65020 is next to the receiving router.

    #[test]
    fn upstream_fully_valid() {
        let store = store(&[
            (65000, &[65010], AFI_IPV4),
            (65010, &[65020], AFI_IPV4),
        ]);
        assert_eq!(
            upstream(&[65020, 65010, 65000], &store),
            ValidationState::Valid
        );
    }

    #[test]
    fn upstream_invalid_hop_short_circuits() {
        let store = store(&[
            (65000, &[65099], AFI_IPV4),
            (65010, &[65020], AFI_IPV4),
        ]);
        assert_eq!(
            upstream(&[65020, 65010, 65000], &store),
            ValidationState::Invalid
        );
    }

    #[test]
    fn upstream_unknown_without_objects() {
        let store = store(&[]);
        assert_eq!(
            upstream(&[65020, 65010, 65000], &store),
            ValidationState::Unknown
        );
    }

    #[test]
    fn upstream_single_hop_is_valid() {
        let store = store(&[]);
        assert_eq!(upstream(&[65000], &store), ValidationState::Valid);
    }

    #[test]
    fn as_set_is_unverifiable() {
        let store = store(&[]);
        assert_eq!(
            validate_aspa(
                &[65020, 65010, 65000], AsPathKind::Set,
                PathDirection::UpStream, AFI_IPV4, &store,
            ),
            ValidationState::Unverifiable
        );
    }

    #[test]
    fn as_set_short_circuits_before_any_lookup() {
        // The same path as a sequence walks into an invalid hop; as an
        // AS_SET it never reaches the store at all.
        let store = store(&[(65000, &[65099], AFI_IPV4)]);
        assert_eq!(
            upstream(&[65020, 65010, 65000], &store),
            ValidationState::Invalid
        );
        assert_eq!(
            validate_aspa(
                &[65020, 65010, 65000], AsPathKind::Set,
                PathDirection::UpStream, AFI_IPV4, &store,
            ),
            ValidationState::Unverifiable
        );
        assert_eq!(
            validate_aspa(
                &[65020, 65010, 65000], AsPathKind::Set,
                PathDirection::DownStream, AFI_IPV4, &store,
            ),
            ValidationState::Unverifiable
        );
    }

    #[test]
    fn downstream_valid_chain() {
        // Wire order [A, B, C]: C originated. ASPAs attest C->B and B->A.
        let store = store(&[
            (65002, &[65001], AFI_IPV4),    // C -> B
            (65001, &[65000], AFI_IPV4),    // B -> A
        ]);
        assert_eq!(
            downstream(&[65000, 65001, 65002], &store),
            ValidationState::Valid
        );
    }

    #[test]
    fn downstream_peak_is_valid() {
        // Customer cone rises to a peak and descends: both ends attested.
        let store = store(&[
            (65000, &[65001], AFI_IPV4),
            (65004, &[65003], AFI_IPV4),
        ]);
        // Originator-first: 65000 65001 | 65003 65004.
        assert_eq!(
            downstream(&[65004, 65003, 65001, 65000], &store),
            ValidationState::Valid
        );
    }

    #[test]
    fn downstream_interior_invalid_both_ways() {
        // Originator-first list: 65000 65001 65002 65003 65004 with an
        // interior hop that is invalid in both directions.
        let store = store(&[
            (65000, &[65001], AFI_IPV4),            // K run
            (65004, &[65003], AFI_IPV4),            // L run
            (65001, &[65099], AFI_IPV4),            // 65001->65002 invalid
            (65003, &[65099], AFI_IPV4),            // 65003->65002 invalid
        ]);
        assert_eq!(
            downstream(&[65004, 65003, 65002, 65001, 65000], &store),
            ValidationState::Invalid
        );
    }

    #[test]
    fn downstream_interior_without_invalid_is_unknown() {
        let store = store(&[
            (65000, &[65001], AFI_IPV4),
            (65004, &[65003], AFI_IPV4),
        ]);
        assert_eq!(
            downstream(&[65004, 65003, 65002, 65001, 65000], &store),
            ValidationState::Unknown
        );
    }

    #[test]
    fn downstream_two_hops_is_valid() {
        let store = store(&[]);
        assert_eq!(
            downstream(&[65001, 65000], &store), ValidationState::Valid
        );
    }
}
