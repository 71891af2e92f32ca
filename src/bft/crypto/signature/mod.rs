//! Digital signatures, used to authenticate every message exchanged
//! between replicas and clients.
//!
//! Backed by Ed25519, through the `ring` crate (feature
//! `crypto_signature_ring_ed25519`). Every `Header` sent over the wire
//! (see [`crate::bft::communication::message`]) carries one of these,
//! computed over the header's other fields plus the serialized payload.

#[cfg(feature = "serialize_serde")]
use serde::{Deserialize, Serialize};

use ring::rand::SystemRandom;
use ring::signature::{Ed25519KeyPair, KeyPair as RingKeyPair, UnparsedPublicKey, ED25519};

use crate::bft::error::*;

/// An Ed25519 key pair, owning both the secret and public components.
pub struct KeyPair {
    inner: Ed25519KeyPair,
    raw_public: [u8; PublicKey::LENGTH],
}

impl KeyPair {
    /// Generates a new `KeyPair` from a 32 byte Ed25519 seed.
    pub fn from_bytes(raw_seed: &[u8]) -> Result<Self> {
        let inner = Ed25519KeyPair::from_seed_unchecked(raw_seed)
            .simple(ErrorKind::CryptoSignature)?;
        let mut raw_public = [0; PublicKey::LENGTH];
        raw_public.copy_from_slice(inner.public_key().as_ref());
        Ok(Self { inner, raw_public })
    }

    /// Generates a fresh, random `KeyPair`.
    pub fn generate() -> Result<Self> {
        let rng = SystemRandom::new();
        let pkcs8 = Ed25519KeyPair::generate_pkcs8(&rng).simple(ErrorKind::CryptoSignature)?;
        let inner = Ed25519KeyPair::from_pkcs8(pkcs8.as_ref()).simple(ErrorKind::CryptoSignature)?;
        let mut raw_public = [0; PublicKey::LENGTH];
        raw_public.copy_from_slice(inner.public_key().as_ref());
        Ok(Self { inner, raw_public })
    }

    /// Returns the public half of this `KeyPair`.
    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.raw_public)
    }

    /// Signs an arbitrary byte sequence, producing a [`Signature`].
    pub fn sign(&self, message: &[u8]) -> Signature {
        let sig = self.inner.sign(message);
        let mut inner = [0; Signature::LENGTH];
        inner.copy_from_slice(sig.as_ref());
        Signature(inner)
    }
}

/// The public half of an Ed25519 [`KeyPair`], used to verify signatures.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
pub struct PublicKey([u8; Self::LENGTH]);

impl PublicKey {
    /// The length, in bytes, of a raw Ed25519 public key.
    pub const LENGTH: usize = 32;

    /// Constructs a `PublicKey` from its raw byte representation.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != Self::LENGTH {
            return Err("Invalid public key length").wrapped(ErrorKind::CryptoSignature);
        }
        let mut inner = [0; Self::LENGTH];
        inner.copy_from_slice(bytes);
        Ok(PublicKey(inner))
    }

    /// Returns the raw bytes of this public key.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0[..]
    }

    /// Verifies that `signature` is a valid Ed25519 signature of
    /// `message`, produced by the `KeyPair` this public key belongs to.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<()> {
        let key = UnparsedPublicKey::new(&ED25519, &self.0[..]);
        key.verify(message, &signature.0[..])
            .simple(ErrorKind::CryptoSignature)
    }
}

impl From<&KeyPair> for PublicKey {
    fn from(kp: &KeyPair) -> Self {
        kp.public_key()
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in &self.0[..4] {
            write!(f, "{:02x}", byte)?;
        }
        write!(f, "..")
    }
}

/// An Ed25519 signature.
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct Signature([u8; Self::LENGTH]);

impl Signature {
    /// The length, in bytes, of a raw Ed25519 signature.
    pub const LENGTH: usize = 64;

    /// Constructs a `Signature` from its raw byte representation.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != Self::LENGTH {
            return Err("Invalid signature length").wrapped(ErrorKind::CryptoSignature);
        }
        let mut inner = [0; Self::LENGTH];
        inner.copy_from_slice(bytes);
        Ok(Signature(inner))
    }

    /// Returns the raw bytes of this signature.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0[..]
    }
}

impl std::fmt::Debug for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in &self.0[..4] {
            write!(f, "{:02x}", byte)?;
        }
        write!(f, "..")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify_roundtrip() {
        let kp = KeyPair::generate().unwrap();
        let pk = kp.public_key();
        let sig = kp.sign(b"hello world");
        assert!(pk.verify(b"hello world", &sig).is_ok());
        assert!(pk.verify(b"tampered", &sig).is_err());
    }
}
