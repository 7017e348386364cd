//! `azazel` is a Byzantine fault tolerant ordering pool, implementing
//! a multi-instance variant of the PBFT three-phase protocol over a
//! set of replicated, append-only ledgers.
//!
//! A pool of `n = 3f + 1` validator nodes runs `f + 1` protocol
//! instances in parallel. Instance zero, the master, orders client
//! requests and commits them to application ledgers; the backup
//! instances order the same traffic without committing, so their
//! throughput can be compared against the master's. When the master
//! degrades or its primary misbehaves, a view change elects a new
//! primary assignment across all instances.
//!
//! The crate contains the consensus core only. Network transport,
//! signatures, and persistent storage engines are collaborators the
//! embedding process supplies through the contracts in
//! [`bft::message`], [`bft::executable`] and [`bft::ledger`].

pub mod bft;
