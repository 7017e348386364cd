//! User application execution business logic.
//!
//! Application semantics live in request handlers: one per ledger,
//! each claiming a set of transaction type tags. The consensus core
//! never interprets request payloads; it routes them through the
//! registry in this module, applies them against the handler's
//! uncommitted state while batching, and commits them once their
//! batch is ordered.

use std::collections::BTreeMap;

use crate::bft::collections::{self, HashMap};
use crate::bft::crypto::hash::Digest;
use crate::bft::error::*;
use crate::bft::ledger::{
    Ledger, LedgerId, LedgerInfo, LedgerTxn, MemoryLedger, MemoryState, StateStore,
};
use crate::bft::message::Request;

/// Application logic of one ledger.
///
/// Handlers own their ledger and authenticated state; the consensus
/// layers reach both only through the narrow accessors below, which
/// keeps every mutation on the single code path the replica drives.
pub trait RequestHandler {
    /// The ledger this handler commits to.
    fn ledger_id(&self) -> LedgerId;

    /// The transaction type tags this handler claims.
    fn operation_types(&self) -> &[u16];

    /// Checks a request is well formed, without consulting state.
    fn do_static_validation(&self, request: &Request) -> Result<()>;

    /// Checks a request can be applied to the current uncommitted
    /// state.
    fn validate(&self, request: &Request) -> Result<()>;

    /// Applies a request to the uncommitted state and ledger,
    /// returning the assigned ledger sequence number and the
    /// resulting transaction.
    fn apply(&mut self, request: &Request, cons_time: u64) -> Result<(u64, LedgerTxn)>;

    /// Applies a forced request ahead of consensus.
    fn apply_forced(&mut self, request: &Request) -> Result<()>;

    /// Commits the `count` oldest uncommitted transactions, checking
    /// they produce the agreed roots. Returns the committed
    /// transactions.
    fn commit(
        &mut self,
        count: u64,
        state_root: &Digest,
        txn_root: &Digest,
        cons_time: u64,
    ) -> Result<Vec<LedgerTxn>>;

    /// Replays transactions into the state, used by catch-up.
    fn update_state(&mut self, txns: &[LedgerTxn], committed: bool) -> Result<()>;

    /// Type tags this handler answers without consensus.
    fn query_types(&self) -> &[u16] {
        &[]
    }

    /// Answers a read-only query against the committed state.
    fn query(&self, _request: &Request) -> Result<Vec<u8>> {
        Err("Handler does not serve queries").wrapped(ErrorKind::Executable)
    }

    fn ledger(&self) -> &dyn Ledger;
    fn ledger_mut(&mut self) -> &mut dyn Ledger;
    fn state(&self) -> &dyn StateStore;
    fn state_mut(&mut self) -> &mut dyn StateStore;
}

/// Routes requests to handlers, by transaction type for ingress and
/// by ledger for ordered batches.
pub struct HandlerRegistry {
    handlers: BTreeMap<LedgerId, Box<dyn RequestHandler>>,
    types: HashMap<u16, LedgerId>,
}

impl HandlerRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            handlers: BTreeMap::new(),
            types: collections::hash_map(),
        }
    }

    /// Registers a handler, claiming its ledger and operation types.
    ///
    /// Fails if another handler already claims one of them.
    pub fn register(&mut self, handler: Box<dyn RequestHandler>) -> Result<()> {
        let ledger_id = handler.ledger_id();
        if self.handlers.contains_key(&ledger_id) {
            return Err("Ledger already claimed by another handler")
                .wrapped(ErrorKind::Executable);
        }
        for txn_type in handler.operation_types() {
            if self.types.contains_key(txn_type) {
                return Err("Operation type already claimed by another handler")
                    .wrapped(ErrorKind::Executable);
            }
        }
        for txn_type in handler.operation_types() {
            self.types.insert(*txn_type, ledger_id);
        }
        self.handlers.insert(ledger_id, handler);
        Ok(())
    }

    /// The ledger a transaction type routes to.
    pub fn ledger_for_type(&self, txn_type: u16) -> Option<LedgerId> {
        self.types.get(&txn_type).copied()
    }

    /// The handler owning a ledger.
    pub fn handler(&self, ledger_id: LedgerId) -> Option<&dyn RequestHandler> {
        self.handlers.get(&ledger_id).map(Box::as_ref)
    }

    /// Mutable access to the handler owning a ledger.
    pub fn handler_mut(&mut self, ledger_id: LedgerId) -> Option<&mut Box<dyn RequestHandler>> {
        self.handlers.get_mut(&ledger_id)
    }

    /// The handler a request routes to.
    pub fn handler_for_request(&self, request: &Request) -> Option<&dyn RequestHandler> {
        self.ledger_for_type(request.txn_type())
            .and_then(|id| self.handler(id))
    }

    /// Every registered ledger, in catch-up order.
    pub fn ledger_ids(&self) -> Vec<LedgerId> {
        self.handlers.keys().copied().collect()
    }

    /// The handler answering a query type, if any claims it.
    pub fn handler_for_query(&self, txn_type: u16) -> Option<&dyn RequestHandler> {
        self.handlers
            .values()
            .find(|h| h.query_types().contains(&txn_type))
            .map(Box::as_ref)
    }

    /// A summary of every ledger, in catch-up order.
    pub fn ledger_summary(&self) -> Vec<LedgerInfo> {
        self.handlers
            .values()
            .map(|h| LedgerInfo {
                ledger_id: h.ledger_id(),
                size: h.ledger().size(),
                root: h.ledger().root_hash(),
            })
            .collect()
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// A key-value request handler over the in-memory ledger and state.
///
/// Payloads are `key '\0' value` pairs; the empty key fails static
/// validation and overwriting a key with the same value fails dynamic
/// validation, which gives tests a cheap source of rejected requests.
pub struct KvRequestHandler {
    ledger: MemoryLedger,
    state: MemoryState,
    types: [u16; 1],
    query_types: [u16; 1],
}

impl KvRequestHandler {
    /// The bit distinguishing the read-only companion of a write
    /// type tag.
    pub const QUERY_BIT: u16 = 0x8000;

    pub fn new(ledger_id: LedgerId, txn_type: u16) -> Self {
        Self {
            ledger: MemoryLedger::new(ledger_id),
            state: MemoryState::new(),
            types: [txn_type],
            query_types: [txn_type | Self::QUERY_BIT],
        }
    }

    fn split_payload(payload: &[u8]) -> Result<(&[u8], &[u8])> {
        let pos = payload
            .iter()
            .position(|b| *b == 0)
            .ok_or_else(|| Error::simple(ErrorKind::Executable))?;
        Ok((&payload[..pos], &payload[pos + 1..]))
    }
}

impl RequestHandler for KvRequestHandler {
    fn ledger_id(&self) -> LedgerId {
        self.ledger.ledger_id()
    }

    fn operation_types(&self) -> &[u16] {
        &self.types
    }

    fn do_static_validation(&self, request: &Request) -> Result<()> {
        let (key, _) = Self::split_payload(request.payload())?;
        if key.is_empty() {
            return Err("Empty key").wrapped(ErrorKind::Executable);
        }
        Ok(())
    }

    fn validate(&self, request: &Request) -> Result<()> {
        let (key, value) = Self::split_payload(request.payload())?;
        if self.state.get(key).as_deref() == Some(value) {
            return Err("Value already written").wrapped(ErrorKind::Executable);
        }
        Ok(())
    }

    fn apply(&mut self, request: &Request, _cons_time: u64) -> Result<(u64, LedgerTxn)> {
        let (key, value) = Self::split_payload(request.payload())?;
        self.state.apply(key.to_vec(), value.to_vec());
        let mut txns = [LedgerTxn::new(
            request.txn_type(),
            request.digest(),
            request.payload().to_vec(),
        )];
        self.ledger.append_uncommitted(&mut txns);
        let [txn] = txns;
        Ok((txn.seq_no(), txn))
    }

    fn apply_forced(&mut self, request: &Request) -> Result<()> {
        let (key, value) = Self::split_payload(request.payload())?;
        self.state.apply(key.to_vec(), value.to_vec());
        self.state.commit();
        Ok(())
    }

    fn commit(
        &mut self,
        count: u64,
        state_root: &Digest,
        txn_root: &Digest,
        _cons_time: u64,
    ) -> Result<Vec<LedgerTxn>> {
        let txns = self.ledger.commit(count)?;
        if self.ledger.root_hash() != *txn_root {
            return Err("Committed transaction root diverged").wrapped(ErrorKind::Executable);
        }
        // later batches may already be applied ahead; only the
        // writes belonging to this batch become committed
        self.state.commit_till(state_root)?;
        if self.state.head_root(true) != *state_root {
            return Err("Committed state root diverged").wrapped(ErrorKind::Executable);
        }
        Ok(txns)
    }

    fn update_state(&mut self, txns: &[LedgerTxn], committed: bool) -> Result<()> {
        for txn in txns {
            let (key, value) = Self::split_payload(txn.payload())?;
            self.state.apply(key.to_vec(), value.to_vec());
        }
        if committed {
            self.state.commit();
        }
        Ok(())
    }

    fn query_types(&self) -> &[u16] {
        &self.query_types
    }

    fn query(&self, request: &Request) -> Result<Vec<u8>> {
        self.state
            .get(request.payload())
            .ok_or_else(|| Error::simple(ErrorKind::Executable))
    }

    fn ledger(&self) -> &dyn Ledger {
        &self.ledger
    }

    fn ledger_mut(&mut self) -> &mut dyn Ledger {
        &mut self.ledger
    }

    fn state(&self) -> &dyn StateStore {
        &self.state
    }

    fn state_mut(&mut self) -> &mut dyn StateStore {
        &mut self.state
    }
}
