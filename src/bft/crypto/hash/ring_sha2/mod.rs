use ring::digest::{self, SHA256_OUTPUT_LEN};

pub const LENGTH: usize = SHA256_OUTPUT_LEN;

pub struct Context {
    ctx: digest::Context,
}

impl Context {
    pub fn new() -> Self {
        Self {
            ctx: digest::Context::new(&digest::SHA256),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.ctx.update(data);
    }

    pub fn finish(self) -> [u8; LENGTH] {
        let mut out = [0; LENGTH];
        out.copy_from_slice(self.ctx.finish().as_ref());
        out
    }
}
