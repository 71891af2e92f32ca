//! Cryptographic digests.
//!
//! Backed by `blake3` by default (feature `crypto_hash_blake3_blake3`),
//! a non-cryptographically-exotic but fast and well-audited hash, used
//! wherever the protocol needs a fixed-length content fingerprint: a
//! client request's digest, the identity of a batch of operations, or a
//! checkpoint's application-state digest.

#[cfg(feature = "crypto_hash_blake3_blake3")]
mod blake3_backend;

#[cfg(feature = "crypto_hash_blake3_blake3")]
use self::blake3_backend as backend;

#[cfg(feature = "serialize_serde")]
use serde::{Deserialize, Serialize};

use crate::bft::error::*;

/// A cryptographic digest, computed over an arbitrary byte sequence.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
pub struct Digest([u8; Self::LENGTH]);

impl Digest {
    /// The length of the digest, in bytes.
    pub const LENGTH: usize = 32;

    /// Constructs a `Digest` from a byte slice of the correct length.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != Self::LENGTH {
            return Err("Invalid digest length").wrapped(ErrorKind::CryptoHash);
        }
        let mut inner = [0; Self::LENGTH];
        inner.copy_from_slice(bytes);
        Ok(Digest(inner))
    }

    /// Returns a view of this digest's bytes.
    pub fn as_ref(&self) -> &[u8] {
        &self.0[..]
    }

    /// Returns the inner byte array.
    pub fn into_bytes(self) -> [u8; Self::LENGTH] {
        self.0
    }
}

impl std::fmt::Debug for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in &self.0[..4] {
            write!(f, "{:02x}", byte)?;
        }
        write!(f, "..")
    }
}

impl std::fmt::Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl Digest {
    /// Parses the lower-case hex encoding produced by `Display` back
    /// into a `Digest`. Used to recover a digest that was only kept
    /// around as a storage-key component (e.g.
    /// `OperationManager::prepared_operations_since`), since hex never
    /// contains the `_`/`\` bytes `storage::typed::escape` guards
    /// against, so it round-trips through a key unescaped.
    pub fn from_hex(s: &str) -> Result<Self> {
        if s.len() != Self::LENGTH * 2 {
            return Err("invalid digest hex length").wrapped(ErrorKind::CryptoHash);
        }
        let mut out = [0u8; Self::LENGTH];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16).wrapped(ErrorKind::CryptoHash)?;
        }
        Ok(Digest(out))
    }
}

impl Ord for Digest {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

impl PartialOrd for Digest {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Incremental hasher, used to digest a byte stream without first
/// collecting it into a single contiguous buffer.
pub struct Context {
    inner: backend::Context,
}

impl Context {
    /// Creates a new, empty hashing `Context`.
    pub fn new() -> Self {
        Self {
            inner: backend::Context::new(),
        }
    }

    /// Feeds more data into the digest being computed.
    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    /// Finalizes the digest, consuming the `Context`.
    pub fn finish(self) -> Digest {
        self.inner.finish()
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

/// Convenience one-shot digest of a single byte buffer.
pub fn digest(data: &[u8]) -> Digest {
    let mut ctx = Context::new();
    ctx.update(data);
    ctx.finish()
}
