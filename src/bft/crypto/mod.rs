//! Cryptographic primitives used by the ordering pool.
//!
//! Only collision resistant hashing lives in the crate; signatures
//! and BLS multi-signatures are verified by the transport layer
//! before messages reach the core.

pub mod hash;
