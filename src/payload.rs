//! The data types moving through the server.
//!
//! This module contains the value types every other part of the server deals
//! in: address prefixes, validation states and result tuples, the update
//! fingerprint, and the BGPsec data attached to a verify request. All types
//! are plain values; shared state lives in the caches.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;


//------------ AddressPrefix -------------------------------------------------

/// An IP address prefix: an IP address and a prefix length.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct AddressPrefix {
    addr: IpAddr,
    len: u8,
}

impl AddressPrefix {
    /// Creates a new prefix from an address and a length.
    ///
    /// Host bits beyond the prefix length are zeroed out so that two
    /// spellings of the same prefix compare equal.
    pub fn new(addr: IpAddr, len: u8) -> Self {
        match addr {
            IpAddr::V4(addr) => {
                let len = len.min(32);
                let mask = if len == 0 { 0 }
                           else { u32::MAX << (32 - len) };
                AddressPrefix {
                    addr: IpAddr::V4(Ipv4Addr::from(
                        u32::from(addr) & mask
                    )),
                    len
                }
            }
            IpAddr::V6(addr) => {
                let len = len.min(128);
                let mask = if len == 0 { 0 }
                           else { u128::MAX << (128 - len) };
                AddressPrefix {
                    addr: IpAddr::V6(Ipv6Addr::from(
                        u128::from(addr) & mask
                    )),
                    len
                }
            }
        }
    }

    /// Returns the address portion of the prefix.
    pub fn address(self) -> IpAddr {
        self.addr
    }

    /// Returns the length portion of the prefix.
    pub fn address_length(self) -> u8 {
        self.len
    }

    /// Returns whether this is an IPv4 prefix.
    pub fn is_v4(self) -> bool {
        self.addr.is_ipv4()
    }

    /// Returns the address bits left-aligned in a `u128`.
    ///
    /// IPv4 addresses occupy the upper 32 bits. Only useful together with
    /// [`address_length`][Self::address_length].
    pub fn bits(self) -> u128 {
        match self.addr {
            IpAddr::V4(addr) => (u32::from(addr) as u128) << 96,
            IpAddr::V6(addr) => u128::from(addr),
        }
    }

    /// Returns whether the prefix covers `other`.
    ///
    /// A prefix covers another prefix if it is equal to or less specific
    /// than the other prefix and both agree on the covered bits.
    pub fn covers(self, other: Self) -> bool {
        if self.is_v4() != other.is_v4() || self.len > other.len {
            return false
        }
        if self.len == 0 {
            return true
        }
        let mask = u128::MAX << (128 - self.len);
        self.bits() & mask == other.bits() & mask
    }
}

impl FromStr for AddressPrefix {
    type Err = FromStrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut iter = s.splitn(2, '/');
        let addr = iter.next().ok_or(FromStrError)?;
        let len = iter.next().ok_or(FromStrError)?;
        let addr = IpAddr::from_str(addr).map_err(|_| FromStrError)?;
        let len = u8::from_str(len).map_err(|_| FromStrError)?;
        if len > 128 || (addr.is_ipv4() && len > 32) {
            return Err(FromStrError)
        }
        Ok(AddressPrefix::new(addr, len))
    }
}

impl fmt::Display for AddressPrefix {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.len)
    }
}


//------------ FromStrError --------------------------------------------------

/// A string could not be parsed into an address prefix.
#[derive(Clone, Copy, Debug)]
pub struct FromStrError;

impl fmt::Display for FromStrError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("invalid prefix")
    }
}


//------------ ValidationState -----------------------------------------------

/// The validation state of one axis of an update.
///
/// The numeric values are the values used on the wire.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ValidationState {
    /// The update passed validation.
    Valid,

    /// No covering ROA exists. Origin validation only.
    NotFound,

    /// The update failed validation.
    Invalid,

    /// This server has not validated the update yet.
    Undefined,

    /// The AS path cannot be subjected to ASPA validation.
    Unverifiable,

    /// No ASPA object covers the path.
    Unknown,
}

impl ValidationState {
    /// Returns the wire representation of the state.
    pub fn into_wire(self) -> u8 {
        match self {
            ValidationState::Valid => 0,
            ValidationState::NotFound => 1,
            ValidationState::Invalid => 2,
            ValidationState::Undefined => 3,
            ValidationState::Unverifiable => 4,
            ValidationState::Unknown => 5,
        }
    }

    /// Creates a state from its wire representation.
    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(ValidationState::Valid),
            1 => Some(ValidationState::NotFound),
            2 => Some(ValidationState::Invalid),
            3 => Some(ValidationState::Undefined),
            4 => Some(ValidationState::Unverifiable),
            5 => Some(ValidationState::Unknown),
            _ => None,
        }
    }
}

impl fmt::Display for ValidationState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match *self {
            ValidationState::Valid => "valid",
            ValidationState::NotFound => "not-found",
            ValidationState::Invalid => "invalid",
            ValidationState::Undefined => "undefined",
            ValidationState::Unverifiable => "unverifiable",
            ValidationState::Unknown => "unknown",
        })
    }
}


//------------ ResultSource --------------------------------------------------

/// Where a default validation result came from.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ResultSource {
    Srx,
    Router,
    Igp,
    Unknown,
}

impl ResultSource {
    pub fn from_wire(value: u8) -> Self {
        match value {
            0 => ResultSource::Srx,
            1 => ResultSource::Router,
            2 => ResultSource::Igp,
            _ => ResultSource::Unknown,
        }
    }

    pub fn into_wire(self) -> u8 {
        match self {
            ResultSource::Srx => 0,
            ResultSource::Router => 1,
            ResultSource::Igp => 2,
            ResultSource::Unknown => 3,
        }
    }
}


//------------ RouteResult ---------------------------------------------------

/// The validation result tuple of an update.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RouteResult {
    pub roa: ValidationState,
    pub bgpsec: ValidationState,
    pub aspa: ValidationState,
}

impl RouteResult {
    /// Returns a result with all axes undefined.
    pub fn undefined() -> Self {
        RouteResult {
            roa: ValidationState::Undefined,
            bgpsec: ValidationState::Undefined,
            aspa: ValidationState::Undefined,
        }
    }

    /// Applies a partial update, returning the mask of axes that changed.
    pub fn apply(&mut self, update: ResultUpdate) -> VerifyFlags {
        let mut changed = VerifyFlags::empty();
        if let Some(roa) = update.roa {
            if self.roa != roa {
                self.roa = roa;
                changed = changed.with(VerifyFlags::ROA);
            }
        }
        if let Some(bgpsec) = update.bgpsec {
            if self.bgpsec != bgpsec {
                self.bgpsec = bgpsec;
                changed = changed.with(VerifyFlags::BGPSEC);
            }
        }
        if let Some(aspa) = update.aspa {
            if self.aspa != aspa {
                self.aspa = aspa;
                changed = changed.with(VerifyFlags::ASPA);
            }
        }
        changed
    }
}

impl Default for RouteResult {
    fn default() -> Self {
        Self::undefined()
    }
}


//------------ ResultUpdate --------------------------------------------------

/// A partial change to a result tuple.
///
/// Axes set to `None` are left untouched. This replaces the `DoNotUse`
/// sentinel value of the wire protocol within the server.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ResultUpdate {
    pub roa: Option<ValidationState>,
    pub bgpsec: Option<ValidationState>,
    pub aspa: Option<ValidationState>,
}

impl ResultUpdate {
    pub fn roa(state: ValidationState) -> Self {
        ResultUpdate { roa: Some(state), ..Default::default() }
    }

    pub fn bgpsec(state: ValidationState) -> Self {
        ResultUpdate { bgpsec: Some(state), ..Default::default() }
    }

    pub fn aspa(state: ValidationState) -> Self {
        ResultUpdate { aspa: Some(state), ..Default::default() }
    }

    pub fn is_empty(self) -> bool {
        self.roa.is_none() && self.bgpsec.is_none() && self.aspa.is_none()
    }
}


//------------ DefaultResult -------------------------------------------------

/// The default result and its sources as provided by the router.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DefaultResult {
    pub result: RouteResult,
    pub roa_source: ResultSource,
    pub bgpsec_source: ResultSource,
}

impl Default for DefaultResult {
    fn default() -> Self {
        DefaultResult {
            result: RouteResult::undefined(),
            roa_source: ResultSource::Unknown,
            bgpsec_source: ResultSource::Unknown,
        }
    }
}


//------------ VerifyFlags ---------------------------------------------------

/// The flags field of a verify request or notification.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct VerifyFlags(u8);

impl VerifyFlags {
    pub const ROA: u8 = 0x01;
    pub const BGPSEC: u8 = 0x02;
    pub const ASPA: u8 = 0x04;
    pub const RECEIPT: u8 = 0x80;

    pub fn empty() -> Self {
        VerifyFlags(0)
    }

    pub fn from_wire(value: u8) -> Self {
        VerifyFlags(value & 0x87)
    }

    pub fn into_wire(self) -> u8 {
        self.0
    }

    pub fn with(self, bits: u8) -> Self {
        VerifyFlags(self.0 | bits)
    }

    pub fn has(self, bits: u8) -> bool {
        self.0 & bits == bits
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Returns the flags restricted to the three validation axes.
    pub fn axes(self) -> Self {
        VerifyFlags(self.0 & 0x07)
    }
}


//------------ AsPathKind ----------------------------------------------------

/// The kind of segment an AS path was built from.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AsPathKind {
    /// An ordered AS_SEQUENCE. The only path-validatable kind.
    Sequence,

    /// An unordered AS_SET.
    Set,
}

impl AsPathKind {
    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            1 => Some(AsPathKind::Sequence),
            2 => Some(AsPathKind::Set),
            _ => None,
        }
    }

    pub fn into_wire(self) -> u8 {
        match self {
            AsPathKind::Sequence => 1,
            AsPathKind::Set => 2,
        }
    }
}


//------------ PathDirection -------------------------------------------------

/// The direction an update travelled relative to the customer cone.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PathDirection {
    UnknownStream,
    UpStream,
    DownStream,
}

impl PathDirection {
    pub fn from_wire(value: u8) -> Self {
        match value {
            1 => PathDirection::UpStream,
            2 => PathDirection::DownStream,
            _ => PathDirection::UnknownStream,
        }
    }

    pub fn into_wire(self) -> u8 {
        match self {
            PathDirection::UnknownStream => 0,
            PathDirection::UpStream => 1,
            PathDirection::DownStream => 2,
        }
    }
}


//------------ BgpsecData ----------------------------------------------------

/// The BGPsec portion of a verify request.
///
/// Either the path or the attribute may be empty. The AS path is kept in the
/// order it arrived in, i.e., towards the originator with the originator
/// last.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct BgpsecData {
    pub afi: u16,
    pub safi: u8,
    pub local_as: u32,
    pub as_path: Vec<u32>,
    pub path_attr: Vec<u8>,
}

impl BgpsecData {
    pub fn is_empty(&self) -> bool {
        self.as_path.is_empty() && self.path_attr.is_empty()
    }
}


//------------ UpdateId ------------------------------------------------------

/// The fingerprint identifying an update within the server.
///
/// The id is derived deterministically from origin AS, prefix, AS path, and
/// BGPsec path attribute. Two distinct updates may still hash to the same
/// value; the update cache resolves such collisions by incrementing the id
/// until its collision check passes.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct UpdateId(pub u32);

impl UpdateId {
    /// Computes the fingerprint of an update.
    pub fn fingerprint(
        origin: u32, prefix: AddressPrefix, bgpsec: &BgpsecData
    ) -> Self {
        let mut hash = Fnv32::new();
        hash.update(&origin.to_be_bytes());
        match prefix.address() {
            IpAddr::V4(addr) => {
                hash.update(&[4u8, prefix.address_length()]);
                hash.update(&addr.octets());
            }
            IpAddr::V6(addr) => {
                hash.update(&[6u8, prefix.address_length()]);
                hash.update(&addr.octets());
            }
        }
        for asn in &bgpsec.as_path {
            hash.update(&asn.to_be_bytes());
        }
        hash.update(&bgpsec.path_attr);
        UpdateId(hash.finish())
    }

    /// Returns the next id for collision probing.
    pub fn next(self) -> Self {
        UpdateId(self.0.wrapping_add(1))
    }
}

impl From<u32> for UpdateId {
    fn from(value: u32) -> Self {
        UpdateId(value)
    }
}

impl From<UpdateId> for u32 {
    fn from(id: UpdateId) -> Self {
        id.0
    }
}

impl fmt::Display for UpdateId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "0x{:08X}", self.0)
    }
}


//------------ path_fingerprint ----------------------------------------------

/// Computes the deterministic identifier of an interned AS path.
///
/// The id is derived from the path in wire order and its segment kind, so
/// the same path reaches the same AS path cache entry from any update.
pub fn path_fingerprint(path: &[u32], kind: AsPathKind) -> u32 {
    let mut hash = Fnv32::new();
    hash.update(&[kind.into_wire()]);
    for asn in path {
        hash.update(&asn.to_be_bytes());
    }
    hash.finish()
}


//------------ Fnv32 ---------------------------------------------------------

/// 32 bit FNV-1a.
///
/// The update fingerprint has to be deterministic from the payload alone
/// across runs and platforms, which rules out the std hasher.
struct Fnv32(u32);

impl Fnv32 {
    fn new() -> Self {
        Fnv32(0x811c_9dc5)
    }

    fn update(&mut self, data: &[u8]) {
        for &octet in data {
            self.0 ^= u32::from(octet);
            self.0 = self.0.wrapping_mul(0x0100_0193);
        }
    }

    fn finish(&self) -> u32 {
        self.0
    }
}


//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn prefix(s: &str) -> AddressPrefix {
        AddressPrefix::from_str(s).unwrap()
    }

    #[test]
    fn prefix_from_str() {
        let p = prefix("10.0.0.0/16");
        assert_eq!(p.address_length(), 16);
        assert!(p.is_v4());
        assert!(AddressPrefix::from_str("10.0.0.0").is_err());
        assert!(AddressPrefix::from_str("10.0.0.0/33").is_err());
        assert!(AddressPrefix::from_str("2001:db8::/129").is_err());
    }

    #[test]
    fn prefix_normalizes_host_bits() {
        assert_eq!(prefix("10.0.1.1/16"), prefix("10.0.0.0/16"));
        assert_eq!(prefix("2001:db8::1/32"), prefix("2001:db8::/32"));
    }

    #[test]
    fn prefix_covers() {
        assert!(prefix("10.0.0.0/16").covers(prefix("10.0.1.0/24")));
        assert!(prefix("10.0.0.0/16").covers(prefix("10.0.0.0/16")));
        assert!(!prefix("10.0.1.0/24").covers(prefix("10.0.0.0/16")));
        assert!(!prefix("10.1.0.0/16").covers(prefix("10.0.1.0/24")));
        assert!(!prefix("10.0.0.0/16").covers(prefix("2001:db8::/32")));
        assert!(prefix("0.0.0.0/0").covers(prefix("192.0.2.0/24")));
    }

    #[test]
    fn fingerprint_is_deterministic() {
        let data = BgpsecData {
            as_path: vec![65000, 65001],
            path_attr: vec![1, 2, 3],
            ..Default::default()
        };
        let a = UpdateId::fingerprint(65000, prefix("10.0.0.0/16"), &data);
        let b = UpdateId::fingerprint(65000, prefix("10.0.0.0/16"), &data);
        assert_eq!(a, b);
    }

    #[test]
    fn fingerprint_depends_on_payload() {
        let data = BgpsecData::default();
        let a = UpdateId::fingerprint(65000, prefix("10.0.0.0/16"), &data);
        let b = UpdateId::fingerprint(65001, prefix("10.0.0.0/16"), &data);
        let c = UpdateId::fingerprint(65000, prefix("10.0.0.0/17"), &data);
        assert_ne!(a, b);
        assert_ne!(a, c);
        let with_attr = BgpsecData {
            path_attr: vec![0xde, 0xad],
            ..Default::default()
        };
        let d = UpdateId::fingerprint(
            65000, prefix("10.0.0.0/16"), &with_attr
        );
        assert_ne!(a, d);
    }

    #[test]
    fn result_apply_reports_changes() {
        let mut result = RouteResult::undefined();
        let changed = result.apply(ResultUpdate::roa(ValidationState::Valid));
        assert!(changed.has(VerifyFlags::ROA));
        assert!(!changed.has(VerifyFlags::BGPSEC));
        assert_eq!(result.roa, ValidationState::Valid);

        // Applying the same value again is a no-op.
        let changed = result.apply(ResultUpdate::roa(ValidationState::Valid));
        assert!(changed.is_empty());
    }
}
