pub const LENGTH: usize = blake3::OUT_LEN;

pub struct Context {
    hasher: blake3::Hasher,
}

impl Context {
    pub fn new() -> Self {
        Self {
            hasher: blake3::Hasher::new(),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    pub fn finish(self) -> [u8; LENGTH] {
        *self.hasher.finalize().as_bytes()
    }
}
