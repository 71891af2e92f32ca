//! An in-memory [`Storage`] backend, keyed by a `BTreeMap` so that
//! range scans come out in lexicographic key order the same way a
//! real, disk-backed store's would.
//!
//! Grounded on the reference in-memory storage engine used by the
//! original system's test suite, which exists purely to give unit
//! tests a fast, dependency-free backend with the same ordering
//! guarantees as the production store.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Mutex;

use super::{check_value_size, Storage};
use crate::bft::error::*;

#[derive(Default)]
pub struct MemStorage {
    inner: Mutex<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemStorage {
    fn create(&self, key: &[u8], value: &[u8]) -> Result<()> {
        check_value_size(value)?;
        let mut guard = self.inner.lock().unwrap();
        if guard.contains_key(key) {
            return Err("key already exists").wrapped(ErrorKind::Storage);
        }
        guard.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn read(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let guard = self.inner.lock().unwrap();
        Ok(guard.get(key).cloned())
    }

    fn update(&self, key: &[u8], value: &[u8]) -> Result<()> {
        check_value_size(value)?;
        let mut guard = self.inner.lock().unwrap();
        guard.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn remove(&self, key: &[u8]) -> Result<()> {
        let mut guard = self.inner.lock().unwrap();
        guard.remove(key);
        Ok(())
    }

    fn read_range(&self, start: &[u8], end: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let guard = self.inner.lock().unwrap();
        let range = (Bound::Included(start.to_vec()), Bound::Excluded(end.to_vec()));
        Ok(guard
            .range(range)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn remove_range(&self, start: &[u8], end: &[u8]) -> Result<()> {
        let mut guard = self.inner.lock().unwrap();
        let keys: Vec<_> = {
            let range = (Bound::Included(start.to_vec()), Bound::Excluded(end.to_vec()));
            guard.range(range).map(|(k, _)| k.clone()).collect()
        };
        for key in keys {
            guard.remove(&key);
        }
        Ok(())
    }

    fn export_snapshot(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let guard = self.inner.lock().unwrap();
        Ok(guard.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    }

    fn import_snapshot(&self, entries: Vec<(Vec<u8>, Vec<u8>)>) -> Result<()> {
        let mut guard = self.inner.lock().unwrap();
        guard.clear();
        guard.extend(entries);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_scan_is_ordered() {
        let store = MemStorage::new();
        store.create(b"b", b"2").unwrap();
        store.create(b"a", b"1").unwrap();
        store.create(b"c", b"3").unwrap();
        let entries = store.read_range(b"a", b"c").unwrap();
        assert_eq!(entries, vec![(b"a".to_vec(), b"1".to_vec()), (b"b".to_vec(), b"2".to_vec())]);
    }

    #[test]
    fn create_rejects_duplicate() {
        let store = MemStorage::new();
        store.create(b"k", b"v").unwrap();
        assert!(store.create(b"k", b"v2").is_err());
    }
}
