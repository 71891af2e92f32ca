//! A `sled`-backed [`Storage`] implementation.
//!
//! `sled`'s own write path is crash-safe (it fsyncs on flush and
//! replays its log on reopen), which is exactly the durability
//! guarantee every caller of [`Storage`] depends on.

use super::{check_value_size, Storage};
use crate::bft::error::*;

pub struct SledStorage {
    tree: sled::Db,
}

impl SledStorage {
    /// Opens (or creates) a `sled` database at `path`.
    pub fn open<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let tree = sled::open(path).wrapped(ErrorKind::Storage)?;
        Ok(Self { tree })
    }
}

impl Storage for SledStorage {
    fn create(&self, key: &[u8], value: &[u8]) -> Result<()> {
        check_value_size(value)?;
        let prev = self
            .tree
            .compare_and_swap(key, None as Option<&[u8]>, Some(value))
            .wrapped(ErrorKind::Storage)?;
        if prev.is_err() {
            return Err("key already exists").wrapped(ErrorKind::Storage);
        }
        self.tree.flush().wrapped(ErrorKind::StorageNotSaved)?;
        Ok(())
    }

    fn read(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self
            .tree
            .get(key)
            .wrapped(ErrorKind::Storage)?
            .map(|ivec| ivec.to_vec()))
    }

    fn update(&self, key: &[u8], value: &[u8]) -> Result<()> {
        check_value_size(value)?;
        self.tree.insert(key, value).wrapped(ErrorKind::Storage)?;
        self.tree.flush().wrapped(ErrorKind::StorageNotSaved)?;
        Ok(())
    }

    fn remove(&self, key: &[u8]) -> Result<()> {
        self.tree.remove(key).wrapped(ErrorKind::Storage)?;
        self.tree.flush().wrapped(ErrorKind::StorageNotSaved)?;
        Ok(())
    }

    fn read_range(&self, start: &[u8], end: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut out = Vec::new();
        for entry in self.tree.range(start..end) {
            let (k, v) = entry.wrapped(ErrorKind::Storage)?;
            out.push((k.to_vec(), v.to_vec()));
        }
        Ok(out)
    }

    fn remove_range(&self, start: &[u8], end: &[u8]) -> Result<()> {
        let keys: Vec<_> = self
            .tree
            .range(start..end)
            .map(|entry| entry.map(|(k, _)| k.to_vec()))
            .collect::<std::result::Result<_, _>>()
            .wrapped(ErrorKind::Storage)?;
        for key in keys {
            self.tree.remove(key).wrapped(ErrorKind::Storage)?;
        }
        self.tree.flush().wrapped(ErrorKind::StorageNotSaved)?;
        Ok(())
    }

    fn export_snapshot(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut out = Vec::new();
        for entry in self.tree.iter() {
            let (k, v) = entry.wrapped(ErrorKind::Storage)?;
            out.push((k.to_vec(), v.to_vec()));
        }
        Ok(out)
    }

    fn import_snapshot(&self, entries: Vec<(Vec<u8>, Vec<u8>)>) -> Result<()> {
        self.tree.clear().wrapped(ErrorKind::Storage)?;
        for (k, v) in entries {
            self.tree.insert(k, v).wrapped(ErrorKind::Storage)?;
        }
        self.tree.flush().wrapped(ErrorKind::StorageNotSaved)?;
        Ok(())
    }
}
