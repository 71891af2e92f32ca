use super::Digest;

pub struct Context {
    inner: blake3::Hasher,
}

impl Context {
    pub fn new() -> Self {
        Self {
            inner: blake3::Hasher::new(),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    pub fn finish(self) -> Digest {
        let hash = self.inner.finalize();
        Digest::from_bytes(hash.as_bytes()).expect("blake3 digest is always 32 bytes")
    }
}
