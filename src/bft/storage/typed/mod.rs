//! A typed, lexicographically-ordered view over a raw byte-oriented
//! [`Storage`](super::Storage).
//!
//! Keys are built out of component parts — integers zero-padded to 20
//! digits, strings escaped so a literal separator byte in the string
//! can't be confused with the separator itself — so that a naive
//! lexicographic range scan over the underlying store still visits
//! entries in the order their numeric components would imply. This
//! mirrors the key discipline the original system's persistent
//! operation store used to keep `(sequence, view)`-ordered evidence
//! scannable without a secondary index.

use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::Storage;
use crate::bft::error::*;

/// Width, in decimal digits, used to zero-pad integer key components.
///
/// Wide enough that a `u64` sequence number never overflows it.
pub const KEY_DIGITS: usize = 20;

/// Formats `n` as a `KEY_DIGITS`-wide, zero-padded decimal string, so
/// that lexicographic and numeric order coincide.
pub fn pad(n: u64) -> String {
    format!("{:0width$}", n, width = KEY_DIGITS)
}

/// Escapes `_` and `\` in `s`, so it can be safely joined with other
/// key components using `_` as a separator without ambiguity.
pub fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        if ch == '_' || ch == '\\' {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

/// Joins pre-escaped/pre-padded key components with `_`.
pub fn join_key(parts: &[&str]) -> Vec<u8> {
    parts.join("_").into_bytes()
}

/// A single typed, JSON-serialized value, stored at one fixed key.
///
/// On construction, the value in storage (if any) wins over whatever
/// in-memory default the caller might otherwise have used: this is
/// what lets a replica resume exactly where it left off after a
/// crash-restart, rather than silently reverting some piece of
/// consensus state to its initial value.
pub struct Persistent<'s, T> {
    storage: &'s dyn Storage,
    key: Vec<u8>,
    _marker: PhantomData<T>,
}

impl<'s, T> Persistent<'s, T>
where
    T: Serialize + DeserializeOwned,
{
    /// Opens a persistent value at `key`, backed by `storage`.
    pub fn open(storage: &'s dyn Storage, key: Vec<u8>) -> Self {
        Self {
            storage,
            key,
            _marker: PhantomData,
        }
    }

    /// Rehydrates the value from storage, if it was ever written.
    pub fn get(&self) -> Result<Option<T>> {
        match self.storage.read(&self.key)? {
            Some(bytes) => {
                let value = serde_json::from_slice(&bytes).wrapped(ErrorKind::Storage)?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Rehydrates the value from storage, falling back to `default` the
    /// first time this value is ever read.
    pub fn get_or(&self, default: T) -> Result<T> {
        Ok(self.get()?.unwrap_or(default))
    }

    /// Overwrites the stored value.
    pub fn set(&self, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec(value).wrapped(ErrorKind::Storage)?;
        self.storage.update(&self.key, &bytes)
    }

    /// Removes the stored value.
    pub fn remove(&self) -> Result<()> {
        self.storage.remove(&self.key)
    }
}

/// A token used to detect when two `Persistent` handles opened against
/// the same logical value have silently diverged — e.g. a stale handle
/// held across a view-change that rewrote the underlying key. Callers
/// bump the epoch whenever they write through a new handle and compare
/// it against what they last observed before trusting a cached read.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, serde::Deserialize)]
pub struct Epoch(pub u64);

impl Epoch {
    pub const INITIAL: Epoch = Epoch(0);

    pub fn next(self) -> Epoch {
        Epoch(self.0.wrapping_add(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bft::storage::mem::MemStorage;

    #[test]
    fn pad_preserves_numeric_order() {
        assert!(pad(9) < pad(10));
        assert!(pad(99) < pad(100));
    }

    #[test]
    fn escape_is_unambiguous() {
        assert_eq!(escape("a_b"), "a\\_b");
        assert_eq!(escape("a\\b"), "a\\\\b");
    }

    #[test]
    fn persistent_rehydrates_after_write() {
        let storage = MemStorage::new();
        let key = join_key(&[&pad(1), "seq"]);
        let handle: Persistent<u32> = Persistent::open(&storage, key.clone());
        assert_eq!(handle.get().unwrap(), None);
        handle.set(&42).unwrap();
        let reopened: Persistent<u32> = Persistent::open(&storage, key);
        assert_eq!(reopened.get().unwrap(), Some(42));
    }
}
