//! The narrow seam between the consensus core and the ledger storage
//! engines.
//!
//! Real deployments back these traits with an append-only merkle
//! ledger and an authenticated state trie; the in-memory
//! implementations in this module authenticate with a plain hash
//! chain, which is enough for the contracts the core relies on:
//! stable roots for equal histories, and verifiable extension proofs.

use std::collections::BTreeMap;

#[cfg(feature = "serialize_serde")]
use serde::{Deserialize, Serialize};

use crate::bft::crypto::hash::{Context, Digest};
use crate::bft::error::*;

/// Identifies one of the logical ledgers a pool replicates.
///
/// The numeric order of the ids is also the catch-up order: the pool
/// ledger must be synced before the ledgers whose validator set it
/// defines.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[repr(transparent)]
pub struct LedgerId(u8);

impl LedgerId {
    pub const POOL: Self = LedgerId(0);
    pub const CONFIG: Self = LedgerId(1);
    pub const DOMAIN: Self = LedgerId(2);
}

impl From<u8> for LedgerId {
    #[inline]
    fn from(id: u8) -> LedgerId {
        LedgerId(id)
    }
}

impl From<LedgerId> for u8 {
    #[inline]
    fn from(id: LedgerId) -> u8 {
        id.0
    }
}

/// A transaction stored in a ledger.
#[derive(Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
pub struct LedgerTxn {
    seq_no: u64,
    digest: Digest,
    txn_type: u16,
    #[cfg_attr(feature = "serialize_serde", serde(with = "serde_bytes"))]
    payload: Vec<u8>,
}

impl LedgerTxn {
    /// Creates a transaction which has not been assigned a sequence
    /// number yet.
    pub fn new(txn_type: u16, digest: Digest, payload: Vec<u8>) -> Self {
        Self {
            seq_no: 0,
            digest,
            txn_type,
            payload,
        }
    }

    /// The position of this transaction in its ledger, starting at one.
    pub fn seq_no(&self) -> u64 {
        self.seq_no
    }

    /// The digest of the request this transaction was created from.
    pub fn digest(&self) -> &Digest {
        &self.digest
    }

    /// The type tag routing this transaction to its handler.
    pub fn txn_type(&self) -> u16 {
        self.txn_type
    }

    /// The serialized transaction content.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

/// A summary of one ledger, exchanged during view changes and used
/// to compare peers' progress.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
pub struct LedgerInfo {
    pub ledger_id: LedgerId,
    pub size: u64,
    pub root: Digest,
}

/// An append-only, authenticated transaction log.
pub trait Ledger {
    fn ledger_id(&self) -> LedgerId;

    /// Number of committed transactions.
    fn size(&self) -> u64;

    /// Number of committed plus uncommitted transactions.
    fn uncommitted_size(&self) -> u64;

    /// Root over the committed transactions.
    fn root_hash(&self) -> Digest;

    /// Root over committed and uncommitted transactions.
    fn uncommitted_root_hash(&self) -> Digest;

    /// Appends transactions without committing them, assigning their
    /// sequence numbers.
    fn append_uncommitted(&mut self, txns: &mut [LedgerTxn]);

    /// Drops every uncommitted transaction.
    fn discard_uncommitted(&mut self);

    /// Drops the `count` newest uncommitted transactions, reverting
    /// a single applied batch.
    fn discard_txns(&mut self, count: u64);

    /// Commits the `count` oldest uncommitted transactions, returning
    /// them.
    fn commit(&mut self, count: u64) -> Result<Vec<LedgerTxn>>;

    /// Looks up a committed transaction by sequence number.
    fn get_by_seq_no(&self, seq_no: u64) -> Option<LedgerTxn>;

    /// Returns the committed transactions in `from..=to`.
    fn get_range(&self, from: u64, to: u64) -> Vec<LedgerTxn>;

    /// Produces the proof material showing that the committed prefix
    /// of size `from` extends to the prefix of size `to`.
    fn consistency_proof(&self, from: u64, to: u64) -> Vec<Digest>;

    /// Appends transactions received from catch-up, verifying that
    /// the resulting root matches `expected_root`. On mismatch the
    /// ledger is left untouched.
    fn append_verified(&mut self, txns: &[LedgerTxn], expected_root: &Digest) -> Result<()>;
}

/// An authenticated key-value state, with an uncommitted head that
/// can be reverted.
pub trait StateStore {
    /// Root of the committed state, or of the uncommitted head.
    fn head_root(&self, committed: bool) -> Digest;

    /// Applies a write to the uncommitted head.
    fn apply(&mut self, key: Vec<u8>, value: Vec<u8>);

    /// Makes the uncommitted head the committed state.
    fn commit(&mut self);

    /// Commits uncommitted writes up to (and including) the write
    /// that produced `root`, leaving later writes uncommitted. Used
    /// when several batches are applied ahead and commit one by one.
    fn commit_till(&mut self, root: &Digest) -> Result<()>;

    /// Rolls the uncommitted head back to a previously observed root.
    fn revert_to_head(&mut self, root: &Digest) -> Result<()>;

    /// Reads a key, preferring the uncommitted head.
    fn get(&self, key: &[u8]) -> Option<Vec<u8>>;
}

fn chain(prev: &Digest, digest: &Digest) -> Digest {
    let mut ctx = Context::new();
    ctx.update(prev.as_ref());
    ctx.update(digest.as_ref());
    ctx.finish()
}

/// An in-memory `Ledger`, authenticated with a hash chain.
pub struct MemoryLedger {
    id: LedgerId,
    txns: Vec<LedgerTxn>,
    // roots[i] authenticates the prefix of size i
    roots: Vec<Digest>,
    uncommitted: Vec<LedgerTxn>,
    uncommitted_roots: Vec<Digest>,
}

impl MemoryLedger {
    pub fn new(id: LedgerId) -> Self {
        Self {
            id,
            txns: Vec::new(),
            roots: vec![Digest::blank()],
            uncommitted: Vec::new(),
            uncommitted_roots: Vec::new(),
        }
    }

    fn last_root(&self) -> Digest {
        match self.uncommitted_roots.last() {
            Some(root) => *root,
            None => *self.roots.last().unwrap_or(&Digest::blank()),
        }
    }
}

impl Ledger for MemoryLedger {
    fn ledger_id(&self) -> LedgerId {
        self.id
    }

    fn size(&self) -> u64 {
        self.txns.len() as u64
    }

    fn uncommitted_size(&self) -> u64 {
        (self.txns.len() + self.uncommitted.len()) as u64
    }

    fn root_hash(&self) -> Digest {
        self.roots[self.txns.len()]
    }

    fn uncommitted_root_hash(&self) -> Digest {
        self.last_root()
    }

    fn append_uncommitted(&mut self, txns: &mut [LedgerTxn]) {
        for txn in txns {
            txn.seq_no = self.uncommitted_size() + 1;
            let root = chain(&self.last_root(), &txn.digest);
            self.uncommitted.push(txn.clone());
            self.uncommitted_roots.push(root);
        }
    }

    fn discard_uncommitted(&mut self) {
        self.uncommitted.clear();
        self.uncommitted_roots.clear();
    }

    fn discard_txns(&mut self, count: u64) {
        let keep = self.uncommitted.len().saturating_sub(count as usize);
        self.uncommitted.truncate(keep);
        self.uncommitted_roots.truncate(keep);
    }

    fn commit(&mut self, count: u64) -> Result<Vec<LedgerTxn>> {
        if count as usize > self.uncommitted.len() {
            return Err("Commit past the uncommitted tail").wrapped(ErrorKind::Ledger);
        }
        let committed: Vec<_> = self.uncommitted.drain(..count as usize).collect();
        let roots: Vec<_> = self.uncommitted_roots.drain(..count as usize).collect();
        self.txns.extend(committed.iter().cloned());
        self.roots.extend(roots);
        Ok(committed)
    }

    fn get_by_seq_no(&self, seq_no: u64) -> Option<LedgerTxn> {
        if seq_no == 0 {
            return None;
        }
        self.txns.get(seq_no as usize - 1).cloned()
    }

    fn get_range(&self, from: u64, to: u64) -> Vec<LedgerTxn> {
        if from == 0 || from > to {
            return Vec::new();
        }
        let to = to.min(self.size());
        self.txns[from as usize - 1..to as usize].to_vec()
    }

    fn consistency_proof(&self, from: u64, to: u64) -> Vec<Digest> {
        let to = to.min(self.size());
        if from > to {
            return Vec::new();
        }
        self.roots[from as usize..=to as usize].to_vec()
    }

    fn append_verified(&mut self, txns: &[LedgerTxn], expected_root: &Digest) -> Result<()> {
        let mut root = self.root_hash();
        for txn in txns {
            root = chain(&root, &txn.digest);
        }
        if root != *expected_root {
            return Err("Caught up transactions do not match the target root")
                .wrapped(ErrorKind::Ledger);
        }
        if !self.uncommitted.is_empty() {
            return Err("Ledger has uncommitted transactions").wrapped(ErrorKind::Ledger);
        }
        for txn in txns {
            let mut txn = txn.clone();
            txn.seq_no = self.size() + 1;
            let root = chain(&self.root_hash(), &txn.digest);
            self.txns.push(txn);
            self.roots.push(root);
        }
        Ok(())
    }
}

/// An in-memory `StateStore`, authenticated with a hash chain over
/// the applied writes.
pub struct MemoryState {
    committed: BTreeMap<Vec<u8>, Vec<u8>>,
    committed_root: Digest,
    // (root after the write, key, value)
    uncommitted: Vec<(Digest, Vec<u8>, Vec<u8>)>,
}

impl MemoryState {
    pub fn new() -> Self {
        Self {
            committed: BTreeMap::new(),
            committed_root: Digest::blank(),
            uncommitted: Vec::new(),
        }
    }
}

impl Default for MemoryState {
    fn default() -> Self {
        Self::new()
    }
}

impl StateStore for MemoryState {
    fn head_root(&self, committed: bool) -> Digest {
        if committed {
            self.committed_root
        } else {
            self.uncommitted
                .last()
                .map(|(root, _, _)| *root)
                .unwrap_or(self.committed_root)
        }
    }

    fn apply(&mut self, key: Vec<u8>, value: Vec<u8>) {
        let mut ctx = Context::new();
        ctx.update(self.head_root(false).as_ref());
        ctx.update(&key);
        ctx.update(&value);
        let root = ctx.finish();
        self.uncommitted.push((root, key, value));
    }

    fn commit(&mut self) {
        for (root, key, value) in self.uncommitted.drain(..) {
            self.committed.insert(key, value);
            self.committed_root = root;
        }
    }

    fn commit_till(&mut self, root: &Digest) -> Result<()> {
        if *root == self.committed_root {
            return Ok(());
        }
        let till = self.uncommitted.iter().position(|(r, _, _)| r == root);
        match till {
            Some(till) => {
                for (root, key, value) in self.uncommitted.drain(..=till) {
                    self.committed.insert(key, value);
                    self.committed_root = root;
                }
                Ok(())
            }
            None => Err("Unknown state root").wrapped(ErrorKind::Ledger),
        }
    }

    fn revert_to_head(&mut self, root: &Digest) -> Result<()> {
        if *root == self.committed_root {
            self.uncommitted.clear();
            return Ok(());
        }
        while let Some((head, _, _)) = self.uncommitted.last() {
            if head == root {
                return Ok(());
            }
            self.uncommitted.pop();
        }
        Err("Unknown state root").wrapped(ErrorKind::Ledger)
    }

    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.uncommitted
            .iter()
            .rev()
            .find(|(_, k, _)| k == key)
            .map(|(_, _, v)| v.clone())
            .or_else(|| self.committed.get(key).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn txn(tag: u8) -> LedgerTxn {
        LedgerTxn::new(1, Digest::from_payload(&[tag]), vec![tag])
    }

    #[test]
    fn equal_histories_have_equal_roots() {
        let mut a = MemoryLedger::new(LedgerId::DOMAIN);
        let mut b = MemoryLedger::new(LedgerId::DOMAIN);
        for ledger in [&mut a, &mut b] {
            let mut txns = vec![txn(1), txn(2)];
            ledger.append_uncommitted(&mut txns);
            ledger.commit(2).unwrap();
        }
        assert_eq!(a.root_hash(), b.root_hash());
        assert_eq!(a.size(), 2);
    }

    #[test]
    fn discarding_uncommitted_restores_the_root() {
        let mut ledger = MemoryLedger::new(LedgerId::DOMAIN);
        let root = ledger.root_hash();
        let mut txns = vec![txn(1)];
        ledger.append_uncommitted(&mut txns);
        assert_ne!(ledger.uncommitted_root_hash(), root);
        ledger.discard_uncommitted();
        assert_eq!(ledger.uncommitted_root_hash(), root);
    }

    #[test]
    fn append_verified_rejects_wrong_roots() {
        let mut source = MemoryLedger::new(LedgerId::DOMAIN);
        let mut txns = vec![txn(1), txn(2)];
        source.append_uncommitted(&mut txns);
        source.commit(2).unwrap();

        let mut target = MemoryLedger::new(LedgerId::DOMAIN);
        let caught_up = source.get_range(1, 2);
        assert!(target
            .append_verified(&caught_up, &Digest::from_payload(b"bogus"))
            .is_err());
        assert_eq!(target.size(), 0);

        target
            .append_verified(&caught_up, &source.root_hash())
            .unwrap();
        assert_eq!(target.root_hash(), source.root_hash());
    }

    #[test]
    fn state_commits_one_batch_at_a_time() {
        let mut state = MemoryState::new();
        state.apply(b"k1".to_vec(), b"v1".to_vec());
        let first = state.head_root(false);
        state.apply(b"k2".to_vec(), b"v2".to_vec());
        let second = state.head_root(false);

        state.commit_till(&first).unwrap();
        assert_eq!(state.head_root(true), first);
        assert_eq!(state.head_root(false), second);

        state.commit_till(&second).unwrap();
        assert_eq!(state.head_root(true), second);
        assert!(state.commit_till(&Digest::from_payload(b"bogus")).is_err());
    }

    #[test]
    fn state_reverts_to_observed_roots() {
        let mut state = MemoryState::new();
        state.apply(b"k1".to_vec(), b"v1".to_vec());
        let mid = state.head_root(false);
        state.apply(b"k2".to_vec(), b"v2".to_vec());
        state.revert_to_head(&mid).unwrap();
        assert_eq!(state.head_root(false), mid);
        assert_eq!(state.get(b"k2"), None);

        state.commit();
        assert_eq!(state.head_root(true), mid);
        assert_eq!(state.get(b"k1"), Some(b"v1".to_vec()));
    }
}
