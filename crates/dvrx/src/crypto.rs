//! Keystream generation and the key store
//!
//! Voice and data frames arrive encrypted under a per-call descriptor
//! of `(algorithm, key id, message indicator)`. This module owns the
//! mapping from that descriptor to keystream bytes; the cipher
//! primitives behind the stronger algorithms are NOT implemented here.
//! Basic Privacy and RC4 ship built in; DES/3DES/AES and the vendor
//! LFSR schemes are satisfied by registering an external
//! [`KeystreamGenerator`]. A call whose algorithm has no registered
//! generator (or no loaded key) is reported as [`CryptoError`] and the
//! mixer mutes it.

use std::collections::HashMap;

use thiserror::Error;

#[cfg(not(test))]
use log::{debug, warn};

#[cfg(test)]
use std::println as debug;

#[cfg(test)]
use std::println as warn;

/// Encryption algorithm identifier, unified across protocols
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, strum_macros::Display)]
pub enum Algorithm {
    /// No encryption
    #[strum(serialize = "clear")]
    Clear,
    /// DMR Basic Privacy (16-bit XOR)
    #[strum(serialize = "Basic Privacy")]
    BasicPrivacy,
    /// RC4 / P25 ADP
    #[strum(serialize = "RC4")]
    Rc4,
    /// DES-OFB
    #[strum(serialize = "DES")]
    Des,
    /// Triple DES
    #[strum(serialize = "3DES")]
    TripleDes,
    /// AES-128 OFB
    #[strum(serialize = "AES-128")]
    Aes128,
    /// AES-256 OFB
    #[strum(serialize = "AES-256")]
    Aes256,
    /// Opaque vendor LFSR scheme
    #[strum(serialize = "vendor LFSR")]
    VendorLfsr,
}

impl Algorithm {
    /// Map a P25 ALGID octet
    pub fn from_p25_algid(algid: u8) -> Self {
        match algid {
            0x80 => Algorithm::Clear,
            0x81 => Algorithm::Des,
            0x83 => Algorithm::TripleDes,
            0x84 => Algorithm::Aes256,
            0x89 => Algorithm::Aes128,
            0xAA => Algorithm::Rc4,
            _ => Algorithm::VendorLfsr,
        }
    }

    /// Map a DMR privacy indicator (PI header ALG field)
    pub fn from_dmr_alg(alg: u8) -> Self {
        match alg {
            0x00 => Algorithm::Clear,
            0x01 => Algorithm::BasicPrivacy,
            0x02 => Algorithm::Rc4,
            0x03 => Algorithm::TripleDes,
            0x04 => Algorithm::Aes128,
            0x05 => Algorithm::Aes256,
            _ => Algorithm::VendorLfsr,
        }
    }
}

/// Keystream failures surfaced to the caller as ENC-mute
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("no key loaded for key id {0:#06x}")]
    MissingKey(u16),

    #[error("no keystream generator registered for {0}")]
    NoGenerator(Algorithm),

    #[error("key material has wrong length for {alg}: {len} bytes")]
    BadKeyLength { alg: Algorithm, len: usize },
}

/// A pure keystream generator
///
/// Implementations must be deterministic in `(key, mi)`: the receiver
/// re-derives the stream on late entry and on retries.
pub trait KeystreamGenerator: Send + Sync {
    /// Algorithm this generator serves
    fn algorithm(&self) -> Algorithm;

    /// Produce `nbytes` of keystream for the given key material and
    /// message indicator
    fn keystream(&self, key: &[u8], mi: &[u8], nbytes: usize) -> Result<Vec<u8>, CryptoError>;
}

/// DMR Basic Privacy: the 16-bit key repeated
pub struct BasicPrivacyKeystream;

impl KeystreamGenerator for BasicPrivacyKeystream {
    fn algorithm(&self) -> Algorithm {
        Algorithm::BasicPrivacy
    }

    fn keystream(&self, key: &[u8], _mi: &[u8], nbytes: usize) -> Result<Vec<u8>, CryptoError> {
        if key.len() != 2 {
            return Err(CryptoError::BadKeyLength {
                alg: Algorithm::BasicPrivacy,
                len: key.len(),
            });
        }
        Ok((0..nbytes).map(|i| key[i % 2]).collect())
    }
}

/// RC4 with the message indicator appended to the key
///
/// P25 ADP and DMR "enhanced privacy" both run RC4 over `key || mi`
/// and discard an initial segment of the stream.
pub struct Rc4Keystream {
    /// Leading keystream bytes discarded before use
    pub drop: usize,
}

impl Rc4Keystream {
    /// The ADP profile drops 256 bytes
    pub fn adp() -> Self {
        Self { drop: 256 }
    }
}

impl KeystreamGenerator for Rc4Keystream {
    fn algorithm(&self) -> Algorithm {
        Algorithm::Rc4
    }

    fn keystream(&self, key: &[u8], mi: &[u8], nbytes: usize) -> Result<Vec<u8>, CryptoError> {
        if key.is_empty() {
            return Err(CryptoError::BadKeyLength {
                alg: Algorithm::Rc4,
                len: 0,
            });
        }
        let mut seed = key.to_vec();
        seed.extend_from_slice(mi);

        // key scheduling
        let mut s: [u8; 256] = std::array::from_fn(|i| i as u8);
        let mut j = 0u8;
        for i in 0..256 {
            j = j
                .wrapping_add(s[i])
                .wrapping_add(seed[i % seed.len()]);
            s.swap(i, j as usize);
        }

        // stream generation
        let mut out = Vec::with_capacity(nbytes);
        let mut i = 0u8;
        let mut j = 0u8;
        for n in 0..self.drop + nbytes {
            i = i.wrapping_add(1);
            j = j.wrapping_add(s[i as usize]);
            s.swap(i as usize, j as usize);
            let k = s[(s[i as usize].wrapping_add(s[j as usize])) as usize];
            if n >= self.drop {
                out.push(k);
            }
        }
        Ok(out)
    }
}

/// Process-wide key table with pluggable generators
///
/// Keys are keyed by their over-the-air key id. Generators for the
/// built-in algorithms are registered by [`KeyStore::new`]; external
/// cipher implementations register via [`KeyStore::register`].
pub struct KeyStore {
    keys: HashMap<u16, Vec<u8>>,
    generators: HashMap<Algorithm, Box<dyn KeystreamGenerator>>,
}

impl KeyStore {
    pub fn new() -> Self {
        let mut s = Self {
            keys: HashMap::new(),
            generators: HashMap::new(),
        };
        s.register(Box::new(BasicPrivacyKeystream));
        s.register(Box::new(Rc4Keystream { drop: 0 }));
        s
    }

    /// Register (or replace) a keystream generator
    pub fn register(&mut self, gen: Box<dyn KeystreamGenerator>) {
        debug!("keystore: generator for {}", gen.algorithm());
        self.generators.insert(gen.algorithm(), gen);
    }

    /// Load key material for a key id
    pub fn load_key(&mut self, key_id: u16, material: Vec<u8>) {
        debug!("keystore: key {:#06x} ({} bytes)", key_id, material.len());
        self.keys.insert(key_id, material);
    }

    /// Forget all keys
    pub fn clear(&mut self) {
        self.keys.clear();
    }

    /// True when a key is loaded for `key_id`
    pub fn has_key(&self, key_id: u16) -> bool {
        self.keys.contains_key(&key_id)
    }

    /// Number of loaded keys
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Derive `nbytes` of keystream for a call descriptor
    pub fn keystream(
        &self,
        alg: Algorithm,
        key_id: u16,
        mi: &[u8],
        nbytes: usize,
    ) -> Result<Vec<u8>, CryptoError> {
        let key = self
            .keys
            .get(&key_id)
            .ok_or(CryptoError::MissingKey(key_id))?;
        let gen = self
            .generators
            .get(&alg)
            .ok_or(CryptoError::NoGenerator(alg))?;
        gen.keystream(key, mi, nbytes).map_err(|e| {
            warn!("keystore: {}", e);
            e
        })
    }
}

impl Default for KeyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for KeyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyStore")
            .field("keys", &self.keys.len())
            .field("generators", &self.generators.len())
            .finish()
    }
}

/// XOR keystream into a byte buffer, skipping the first `skip` bytes
/// and leaving the last `tail` bytes (pad and CRC) untouched
pub fn apply_keystream(buf: &mut [u8], ks: &[u8], skip: usize, tail: usize) {
    let end = buf.len().saturating_sub(tail);
    for (n, b) in buf[skip.min(end)..end].iter_mut().enumerate() {
        if n < ks.len() {
            *b ^= ks[n];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rc4_known_vector() {
        // classic test vector: key "Key" -> EB 9F 77 81 B7 34 CA 72 A7 19
        let rc4 = Rc4Keystream { drop: 0 };
        let ks = rc4.keystream(b"Key", &[], 10).unwrap();
        assert_eq!(
            ks,
            vec![0xEB, 0x9F, 0x77, 0x81, 0xB7, 0x34, 0xCA, 0x72, 0xA7, 0x19]
        );
    }

    #[test]
    fn test_rc4_drop_shifts_stream() {
        let plain = Rc4Keystream { drop: 0 };
        let adp = Rc4Keystream { drop: 256 };
        let long = plain.keystream(b"Key", b"mi", 300).unwrap();
        let dropped = adp.keystream(b"Key", b"mi", 44).unwrap();
        assert_eq!(&long[256..300], &dropped[..]);
    }

    #[test]
    fn test_xor_identity() {
        // applying the same keystream twice restores the plaintext
        let mut store = KeyStore::new();
        store.load_key(0x0101, b"secret".to_vec());

        let reference = b"the quick brown fox jumps".to_vec();
        let mut buf = reference.clone();
        let ks = store
            .keystream(Algorithm::Rc4, 0x0101, &[1, 2, 3, 4], buf.len())
            .unwrap();
        apply_keystream(&mut buf, &ks, 0, 0);
        assert_ne!(buf, reference);
        apply_keystream(&mut buf, &ks, 0, 0);
        assert_eq!(buf, reference);
    }

    #[test]
    fn test_basic_privacy_repeats_key() {
        let bp = BasicPrivacyKeystream;
        let ks = bp.keystream(&[0xAB, 0xCD], &[], 5).unwrap();
        assert_eq!(ks, vec![0xAB, 0xCD, 0xAB, 0xCD, 0xAB]);

        let err = bp.keystream(&[1, 2, 3], &[], 4).unwrap_err();
        assert!(matches!(err, CryptoError::BadKeyLength { len: 3, .. }));
    }

    #[test]
    fn test_missing_key_and_generator() {
        let store = KeyStore::new();
        assert_eq!(
            store.keystream(Algorithm::Rc4, 0x0202, &[], 8),
            Err(CryptoError::MissingKey(0x0202))
        );

        let mut store = KeyStore::new();
        store.load_key(0x0202, vec![0; 32]);
        assert_eq!(
            store.keystream(Algorithm::Aes256, 0x0202, &[], 8),
            Err(CryptoError::NoGenerator(Algorithm::Aes256))
        );
    }

    #[test]
    fn test_apply_keystream_respects_skip_and_tail() {
        let mut buf = vec![0u8; 10];
        let ks = vec![0xFF; 10];
        apply_keystream(&mut buf, &ks, 2, 3);
        assert_eq!(buf, vec![0, 0, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0, 0, 0]);
    }

    #[test]
    fn test_algid_maps() {
        assert_eq!(Algorithm::from_p25_algid(0x84), Algorithm::Aes256);
        assert_eq!(Algorithm::from_p25_algid(0xAA), Algorithm::Rc4);
        assert_eq!(Algorithm::from_p25_algid(0x80), Algorithm::Clear);
        assert_eq!(Algorithm::from_dmr_alg(0x01), Algorithm::BasicPrivacy);
    }
}
