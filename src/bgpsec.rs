//! The BGPsec crypto capability.
//!
//! Path signing and signature verification are delegated to a
//! [`CryptoProvider`]. The core never sees key material; it hands the
//! provider the update data and gets back a verdict or a signature blob.
//! The default provider is backed by ring's ECDSA P-256, the algorithm of
//! BGPsec algorithm suite 1. A server without configured keys falls back
//! to [`NullCrypto`], which fails every request the way the error policy
//! demands: verification yields `Invalid`, signing an internal error.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use log::{debug, error, warn};
use ring::rand::SystemRandom;
use ring::signature::{
    EcdsaKeyPair, UnparsedPublicKey, ECDSA_P256_SHA256_ASN1,
    ECDSA_P256_SHA256_ASN1_SIGNING,
};
use crate::error::Failed;
use crate::payload::ValidationState;
use crate::updates::UpdateInfo;


/// The algorithm identifier of BGPsec algorithm suite 1 (ECDSA P-256).
pub const ALGO_BGPSEC_P256: u16 = 1;


//------------ KeyKind -------------------------------------------------------

/// Which kind of keys to load from a key directory.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum KeyKind {
    Public,
    Private,
    Both,
}


//------------ SignError -----------------------------------------------------

/// Signing could not be performed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SignError {
    /// The requested algorithm is not supported.
    UnsupportedAlgorithm,

    /// No signing key is available for the local AS.
    KeyNotFound,

    /// The provider failed internally.
    Failed,
}


//------------ CryptoProvider ------------------------------------------------

/// The capability the command handler signs and verifies through.
pub trait CryptoProvider: Send + Sync {
    /// Verifies the BGPsec attribute of an update.
    ///
    /// Returns `Valid` or `Invalid`; there is no not-found for signatures.
    fn verify_signature(&self, update: &UpdateInfo) -> ValidationState;

    /// Signs an update towards a peer.
    fn sign(
        &self,
        update: &UpdateInfo,
        peer_as: u32,
        prepend_counter: u32,
        algorithm: u16,
    ) -> Result<Vec<u8>, SignError>;
}


//------------ NullCrypto ----------------------------------------------------

/// The provider used when no keys are configured.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullCrypto;

impl CryptoProvider for NullCrypto {
    fn verify_signature(&self, _update: &UpdateInfo) -> ValidationState {
        ValidationState::Invalid
    }

    fn sign(
        &self, _update: &UpdateInfo, _peer_as: u32, _prepend_counter: u32,
        _algorithm: u16,
    ) -> Result<Vec<u8>, SignError> {
        Err(SignError::KeyNotFound)
    }
}


//------------ RingProvider --------------------------------------------------

/// A crypto provider backed by ring's ECDSA P-256.
pub struct RingProvider {
    /// Router public keys by ASN, as uncompressed curve points.
    public: HashMap<u32, Vec<u8>>,

    /// Private signing keys by ASN.
    private: HashMap<u32, EcdsaKeyPair>,

    rng: SystemRandom,
}

impl RingProvider {
    /// Loads keys from a directory.
    ///
    /// The directory holds one file per key: `<asn>.pub` with the public
    /// key as an uncompressed curve point and `<asn>.key` with a PKCS#8
    /// private key. Files that cannot be parsed are skipped with a
    /// warning; a directory without a single usable key is an error.
    pub fn load_keys(path: &Path, kind: KeyKind) -> Result<Self, Failed> {
        let mut res = RingProvider {
            public: HashMap::new(),
            private: HashMap::new(),
            rng: SystemRandom::new(),
        };
        let dir = fs::read_dir(path).map_err(|err| {
            error!(
                "Failed to read key directory {}: {}", path.display(), err
            );
            Failed
        })?;
        for entry in dir {
            let entry = entry.map_err(|err| {
                error!(
                    "Failed to read key directory {}: {}",
                    path.display(), err
                );
                Failed
            })?;
            let file = entry.path();
            let asn = match file.file_stem()
                .and_then(|stem| stem.to_str())
                .and_then(|stem| stem.parse::<u32>().ok())
            {
                Some(asn) => asn,
                None => continue,
            };
            match file.extension().and_then(|ext| ext.to_str()) {
                Some("pub") if kind != KeyKind::Private => {
                    match fs::read(&file) {
                        Ok(data) => {
                            res.public.insert(asn, data);
                        }
                        Err(err) => {
                            warn!(
                                "Skipping public key {}: {}",
                                file.display(), err
                            );
                        }
                    }
                }
                Some("key") if kind != KeyKind::Public => {
                    let data = match fs::read(&file) {
                        Ok(data) => data,
                        Err(err) => {
                            warn!(
                                "Skipping private key {}: {}",
                                file.display(), err
                            );
                            continue
                        }
                    };
                    match EcdsaKeyPair::from_pkcs8(
                        &ECDSA_P256_SHA256_ASN1_SIGNING, &data
                    ) {
                        Ok(key) => {
                            res.private.insert(asn, key);
                        }
                        Err(err) => {
                            warn!(
                                "Skipping private key {}: {}",
                                file.display(), err
                            );
                        }
                    }
                }
                _ => {}
            }
        }
        if res.public.is_empty() && res.private.is_empty() {
            error!(
                "No usable keys found in {}", path.display()
            );
            return Err(Failed)
        }
        debug!(
            "Loaded {} public and {} private keys",
            res.public.len(), res.private.len()
        );
        Ok(res)
    }
}

impl CryptoProvider for RingProvider {
    fn verify_signature(&self, update: &UpdateInfo) -> ValidationState {
        if update.bgpsec.path_attr.is_empty() {
            return ValidationState::Invalid
        }
        let key = match self.public.get(&update.origin) {
            Some(key) => key,
            None => return ValidationState::Invalid,
        };
        let message = signing_message(update, update.origin, 0);
        let key = UnparsedPublicKey::new(&ECDSA_P256_SHA256_ASN1, key);
        match key.verify(&message, &update.bgpsec.path_attr) {
            Ok(()) => ValidationState::Valid,
            Err(_) => ValidationState::Invalid,
        }
    }

    fn sign(
        &self, update: &UpdateInfo, peer_as: u32, prepend_counter: u32,
        algorithm: u16,
    ) -> Result<Vec<u8>, SignError> {
        if algorithm != ALGO_BGPSEC_P256 {
            return Err(SignError::UnsupportedAlgorithm)
        }
        let key = self.private.get(&update.bgpsec.local_as)
            .or_else(|| self.private.get(&update.origin))
            .ok_or(SignError::KeyNotFound)?;
        let message = signing_message(update, peer_as, prepend_counter);
        key.sign(&self.rng, &message)
            .map(|sig| sig.as_ref().to_vec())
            .map_err(|_| SignError::Failed)
    }
}


//------------ TestSigner ----------------------------------------------------

/// A deterministic provider for tests.
///
/// This is the test signing mode: no production path constructs it. It
/// returns a canned verdict and signature, making protocol flows
/// byte-for-byte reproducible.
pub struct TestSigner {
    pub verdict: ValidationState,
    pub signature: Vec<u8>,
}

impl TestSigner {
    pub fn new(verdict: ValidationState, signature: Vec<u8>) -> Self {
        TestSigner { verdict, signature }
    }
}

impl CryptoProvider for TestSigner {
    fn verify_signature(&self, _update: &UpdateInfo) -> ValidationState {
        self.verdict
    }

    fn sign(
        &self, _update: &UpdateInfo, _peer_as: u32, _prepend_counter: u32,
        algorithm: u16,
    ) -> Result<Vec<u8>, SignError> {
        if algorithm != ALGO_BGPSEC_P256 {
            return Err(SignError::UnsupportedAlgorithm)
        }
        Ok(self.signature.clone())
    }
}


//------------ signing_message -----------------------------------------------

/// Builds the octet string a signature covers.
fn signing_message(
    update: &UpdateInfo, peer_as: u32, prepend_counter: u32
) -> Vec<u8> {
    let mut message = Vec::new();
    message.extend_from_slice(&peer_as.to_be_bytes());
    message.extend_from_slice(&prepend_counter.to_be_bytes());
    message.extend_from_slice(&update.origin.to_be_bytes());
    message.push(if update.prefix.is_v4() { 4 } else { 6 });
    message.push(update.prefix.address_length());
    match update.prefix.address() {
        std::net::IpAddr::V4(addr) => {
            message.extend_from_slice(&addr.octets())
        }
        std::net::IpAddr::V6(addr) => {
            message.extend_from_slice(&addr.octets())
        }
    }
    for asn in &update.bgpsec.as_path {
        message.extend_from_slice(&asn.to_be_bytes());
    }
    message
}


//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use ring::signature::KeyPair;
    use crate::payload::{
        AddressPrefix, BgpsecData, DefaultResult, RouteResult, UpdateId,
    };

    fn update(origin: u32, path_attr: Vec<u8>) -> UpdateInfo {
        UpdateInfo {
            update_id: UpdateId(1),
            prefix: "10.0.0.0/16".parse::<AddressPrefix>().unwrap(),
            origin,
            bgpsec: BgpsecData {
                local_as: origin,
                as_path: vec![65001, origin],
                path_attr,
                ..Default::default()
            },
            path_id: 0,
            default: DefaultResult::default(),
            current: RouteResult::undefined(),
        }
    }

    #[test]
    fn null_crypto_refuses_everything() {
        let provider = NullCrypto;
        assert_eq!(
            provider.verify_signature(&update(65000, vec![1, 2, 3])),
            ValidationState::Invalid
        );
        assert_eq!(
            provider.sign(&update(65000, Vec::new()), 65001, 1,
                          ALGO_BGPSEC_P256),
            Err(SignError::KeyNotFound)
        );
    }

    #[test]
    fn ring_provider_signs_and_verifies() {
        let rng = SystemRandom::new();
        let pkcs8 = EcdsaKeyPair::generate_pkcs8(
            &ECDSA_P256_SHA256_ASN1_SIGNING, &rng
        ).expect("key generation");
        let pair = EcdsaKeyPair::from_pkcs8(
            &ECDSA_P256_SHA256_ASN1_SIGNING, pkcs8.as_ref()
        ).expect("key parses");

        let dir = tempfile::tempdir().expect("temp dir");
        fs::write(dir.path().join("65000.key"), pkcs8.as_ref())
            .expect("written");
        fs::write(
            dir.path().join("65000.pub"), pair.public_key().as_ref()
        ).expect("written");

        let provider = RingProvider::load_keys(dir.path(), KeyKind::Both)
            .expect("keys load");

        // Sign for the origin and feed the signature back as the
        // attribute of the same update.
        let unsigned = update(65000, Vec::new());
        let signature = provider.sign(
            &unsigned, 65000, 0, ALGO_BGPSEC_P256
        ).expect("signs");
        let signed = update(65000, signature);
        assert_eq!(
            provider.verify_signature(&signed), ValidationState::Valid
        );

        // A damaged signature fails.
        let mut bad = signed.clone();
        bad.bgpsec.path_attr[0] ^= 0xff;
        assert_eq!(
            provider.verify_signature(&bad), ValidationState::Invalid
        );

        // An unknown algorithm is refused.
        assert_eq!(
            provider.sign(&unsigned, 65000, 0, 0xffff),
            Err(SignError::UnsupportedAlgorithm)
        );
    }

    #[test]
    fn load_keys_requires_some_key() {
        let dir = tempfile::tempdir().expect("temp dir");
        assert!(RingProvider::load_keys(dir.path(), KeyKind::Both).is_err());
    }
}
