//! Abstractions over different cryptographic hash digest backends.
//!
//! The backend is selected at compile time with one of the feature
//! flags `crypto_hash_blake3_blake3` or `crypto_hash_ring_sha2`.

use std::fmt;

use crate::bft::error::*;

#[cfg(feature = "crypto_hash_blake3_blake3")]
mod blake3_blake3;

#[cfg(feature = "crypto_hash_blake3_blake3")]
use blake3_blake3 as imp;

#[cfg(all(
    feature = "crypto_hash_ring_sha2",
    not(feature = "crypto_hash_blake3_blake3")
))]
mod ring_sha2;

#[cfg(all(
    feature = "crypto_hash_ring_sha2",
    not(feature = "crypto_hash_blake3_blake3")
))]
use ring_sha2 as imp;

/// An incremental hashing context, used to produce a `Digest`
/// over multiple inputs.
pub struct Context {
    inner: imp::Context,
}

/// The result of hashing a byte payload with a `Context`.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
#[repr(transparent)]
pub struct Digest([u8; Digest::LENGTH]);

impl Context {
    /// Creates a new hashing context.
    pub fn new() -> Self {
        Self {
            inner: imp::Context::new(),
        }
    }

    /// Feeds more bytes into this hashing context.
    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    /// Consumes the context, producing the digest of every byte
    /// fed into it.
    pub fn finish(self) -> Digest {
        Digest(self.inner.finish())
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl Digest {
    /// The length of a `Digest`, in bytes.
    pub const LENGTH: usize = imp::LENGTH;

    /// Hash a single byte payload.
    pub fn from_payload(data: &[u8]) -> Self {
        let mut ctx = Context::new();
        ctx.update(data);
        ctx.finish()
    }

    /// Construct a `Digest` from raw bytes.
    pub fn from_bytes(raw_bytes: &[u8]) -> Result<Self> {
        if raw_bytes.len() < Self::LENGTH {
            return Err("Digest has an invalid length").wrapped(ErrorKind::CryptoHash);
        }
        let mut inner = [0; Self::LENGTH];
        inner.copy_from_slice(&raw_bytes[..Self::LENGTH]);
        Ok(Self(inner))
    }

    /// The all zeroes digest, used as the root of empty structures.
    pub const fn blank() -> Self {
        Self([0; Self::LENGTH])
    }
}

impl AsRef<[u8]> for Digest {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest(")?;
        for b in &self.0[..4] {
            write!(f, "{:02x}", b)?;
        }
        write!(f, "..)")
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

#[cfg(feature = "serialize_serde")]
impl serde::Serialize for Digest {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serde_bytes::Bytes::new(&self.0).serialize(serializer)
    }
}

#[cfg(feature = "serialize_serde")]
impl<'de> serde::Deserialize<'de> for Digest {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        let buf: &serde_bytes::Bytes = serde::Deserialize::deserialize(deserializer)?;
        Digest::from_bytes(buf).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digests_are_deterministic() {
        let d1 = Digest::from_payload(b"I am a cool payload!");
        let d2 = Digest::from_payload(b"I am a cool payload!");
        let d3 = Digest::from_payload(b"I am a cooler payload!");
        assert_eq!(d1, d2);
        assert_ne!(d1, d3);
    }

    #[test]
    fn incremental_hashing_matches_oneshot() {
        let mut ctx = Context::new();
        ctx.update(b"I am a cool ");
        ctx.update(b"payload!");
        assert_eq!(ctx.finish(), Digest::from_payload(b"I am a cool payload!"));
    }

    #[test]
    fn from_bytes_checks_the_length() {
        assert!(Digest::from_bytes(&[0; 4]).is_err());
        assert!(Digest::from_bytes(&[0; Digest::LENGTH]).is_ok());
    }
}
