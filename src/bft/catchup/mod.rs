//! Per-ledger catch-up coordination.
//!
//! A node reconciles its ledgers with the pool before it takes part
//! in ordering: for each ledger, in a fixed order, it advertises its
//! own LEDGER_STATUS, waits for a weak quorum of peers to either
//! confirm it is current or prove a longer prefix exists, fetches the
//! missing transactions in chunks, and verifies them against the
//! agreed target root before feeding them to the request handler.
//! The pool ledger is always first, since it defines the validator
//! set the remaining ledgers are verified against.

use std::collections::BTreeMap;

use log::{debug, info, warn};

use crate::bft::collections::{self, HashMap};
use crate::bft::config::PoolConfig;
use crate::bft::crypto::hash::Digest;
use crate::bft::executable::HandlerRegistry;
use crate::bft::ledger::{LedgerId, LedgerTxn};
use crate::bft::message::{
    CatchupRep, CatchupReq, ConsistencyProof, LedgerStatus, SystemMessage,
};
use crate::bft::ordering::{compare_3pc_keys, ThreePhaseKey};
use crate::bft::registry::{NodeId, NodeRegistry};

/// The synchronization state of one ledger.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum LedgerSyncState {
    NotSynced,
    Syncing,
    Synced,
}

/// Everything the ledger manager asked the node to do during one
/// call.
#[derive(Default)]
pub struct CatchupEffects {
    /// Messages to broadcast to every validator.
    pub broadcast: Vec<SystemMessage>,
    /// Messages to send to one validator.
    pub directed: Vec<(NodeId, SystemMessage)>,
    /// Ledgers which finished syncing during this call.
    pub synced_ledgers: Vec<LedgerId>,
    /// Catch-up finished for every ledger; carries the last
    /// three-phase key observed by the pool.
    pub complete: Option<Option<ThreePhaseKey>>,
    /// A round timeout to arm: `(ledger, round, delay)`.
    pub schedule_round: Option<(LedgerId, u64, u64)>,
}

/// Node state the ledger manager borrows for one call.
pub struct CatchupContext<'a> {
    pub registry: &'a NodeRegistry,
    pub handlers: &'a mut HandlerRegistry,
    pub node_id: NodeId,
    /// The last batch the master replica ordered, advertised in our
    /// own LEDGER_STATUS messages.
    pub last_ordered_3pc: Option<ThreePhaseKey>,
    pub effects: CatchupEffects,
}

impl<'a> CatchupContext<'a> {
    pub fn new(
        registry: &'a NodeRegistry,
        handlers: &'a mut HandlerRegistry,
        node_id: NodeId,
        last_ordered_3pc: Option<ThreePhaseKey>,
    ) -> Self {
        Self {
            registry,
            handlers,
            node_id,
            last_ordered_3pc,
            effects: CatchupEffects::default(),
        }
    }
}

struct CatchupTarget {
    size: u64,
    root: Digest,
}

struct LedgerCatchup {
    ledger_id: LedgerId,
    state: LedgerSyncState,
    // peers confirming our prefix is current
    agreeing: collections::HashSet<NodeId>,
    proofs: HashMap<NodeId, ConsistencyProof>,
    target: Option<CatchupTarget>,
    // received chunks, keyed by the sequence number they start at
    received: BTreeMap<u64, Vec<LedgerTxn>>,
    round: u64,
    attempts: u32,
}

impl LedgerCatchup {
    fn new(ledger_id: LedgerId) -> Self {
        Self {
            ledger_id,
            state: LedgerSyncState::NotSynced,
            agreeing: collections::hash_set(),
            proofs: collections::hash_map(),
            target: None,
            received: BTreeMap::new(),
            round: 0,
            attempts: 0,
        }
    }

    fn reset_round(&mut self) {
        self.agreeing.clear();
        self.proofs.clear();
        self.target = None;
        self.received.clear();
    }
}

/// Coordinates catch-up across every registered ledger.
pub struct LedgerManager {
    config: PoolConfig,
    ledgers: Vec<LedgerCatchup>,
    active: Option<usize>,
    in_progress: bool,
    last_caught_up_3pc: Option<ThreePhaseKey>,
}

impl LedgerManager {
    /// Creates a manager over the ledgers of a handler registry.
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            ledgers: Vec::new(),
            active: None,
            in_progress: false,
            last_caught_up_3pc: None,
        }
    }

    /// Whether a catch-up is currently running.
    pub fn is_in_progress(&self) -> bool {
        self.in_progress
    }

    /// The last three-phase key the previous catch-up observed.
    pub fn last_caught_up_3pc(&self) -> Option<ThreePhaseKey> {
        self.last_caught_up_3pc
    }

    /// The synchronization state of one ledger.
    pub fn state_of(&self, ledger_id: LedgerId) -> LedgerSyncState {
        self.ledgers
            .iter()
            .find(|l| l.ledger_id == ledger_id)
            .map(|l| l.state)
            .unwrap_or(LedgerSyncState::NotSynced)
    }

    /// Starts (or restarts) a catch-up over every ledger, in
    /// catch-up order.
    pub fn start_catchup(&mut self, ctx: &mut CatchupContext<'_>) {
        info!("starting catch-up over {:?}", ctx.handlers.ledger_ids());
        self.ledgers = ctx
            .handlers
            .ledger_ids()
            .into_iter()
            .map(LedgerCatchup::new)
            .collect();
        self.in_progress = true;
        self.last_caught_up_3pc = None;
        self.active = None;
        self.advance(ctx);
    }

    // moves to the next unsynced ledger, or completes
    fn advance(&mut self, ctx: &mut CatchupContext<'_>) {
        let next = self
            .ledgers
            .iter()
            .position(|l| l.state != LedgerSyncState::Synced);
        match next {
            Some(idx) => {
                self.active = Some(idx);
                self.start_ledger(idx, ctx);
            }
            None => {
                info!("catch-up complete, last observed 3PC {:?}", self.last_caught_up_3pc);
                self.active = None;
                self.in_progress = false;
                ctx.effects.complete = Some(self.last_caught_up_3pc);
            }
        }
    }

    fn start_ledger(&mut self, idx: usize, ctx: &mut CatchupContext<'_>) {
        let (status, ledger_id, round, delay) = {
            let ledger = &mut self.ledgers[idx];
            ledger.state = LedgerSyncState::Syncing;
            ledger.reset_round();
            ledger.round += 1;
            ledger.attempts += 1;
            let delay = self.config.catchup_round_timeout << ledger.attempts.min(6).saturating_sub(1);
            (
                own_status(ledger.ledger_id, ctx),
                ledger.ledger_id,
                ledger.round,
                delay,
            )
        };
        debug!("syncing {:?}: advertising size {}", ledger_id, status.size);
        ctx.effects
            .broadcast
            .push(SystemMessage::LedgerStatus(status));
        ctx.effects.schedule_round = Some((ledger_id, round, delay));
    }

    // ------------------------------------------------------------------
    // inbound

    /// Processes a LEDGER_STATUS a catching-up peer broadcast,
    /// answering with a consistency proof: a real one when we hold a
    /// longer prefix, or a null proof confirming the peer is
    /// current.
    ///
    /// Statuses never trigger statuses, so two current nodes cannot
    /// echo confirmations back and forth.
    pub fn process_ledger_status(
        &mut self,
        msg: LedgerStatus,
        sender: NodeId,
        ctx: &mut CatchupContext<'_>,
    ) {
        if msg.protocol_version != LedgerStatus::CURRENT_VERSION {
            debug!("discarding LEDGER_STATUS with version {}", msg.protocol_version);
            return;
        }
        let handler = match ctx.handlers.handler(msg.ledger_id) {
            Some(handler) => handler,
            None => {
                debug!("LEDGER_STATUS for unknown ledger {:?}", msg.ledger_id);
                return;
            }
        };
        let our_size = handler.ledger().size();
        let our_root = handler.ledger().root_hash();

        let proof = if msg.size < our_size {
            // the sender lags us; prove our longer prefix to it
            let hashes = handler.ledger().consistency_proof(msg.size, our_size);
            ConsistencyProof {
                ledger_id: msg.ledger_id,
                size_from: msg.size,
                size_to: our_size,
                last_3pc: ctx.last_ordered_3pc,
                old_root: hashes.first().copied().unwrap_or_else(Digest::blank),
                new_root: hashes.last().copied().unwrap_or_else(Digest::blank),
                hashes,
            }
        } else if msg.size == our_size && msg.root == our_root {
            // the sender is current; confirm with a null proof
            ConsistencyProof {
                ledger_id: msg.ledger_id,
                size_from: our_size,
                size_to: our_size,
                last_3pc: ctx.last_ordered_3pc,
                old_root: our_root,
                new_root: our_root,
                hashes: Vec::new(),
            }
        } else {
            // the sender is ahead of us; our own catch-up handles it
            return;
        };
        ctx.effects
            .directed
            .push((sender, SystemMessage::ConsistencyProof(proof)));
    }

    /// Processes a CONSISTENCY_PROOF: a weak quorum of null proofs
    /// confirms the active ledger is current, and a weak quorum of
    /// proofs agreeing on a longer target starts the transaction
    /// fetch.
    pub fn process_consistency_proof(
        &mut self,
        msg: ConsistencyProof,
        sender: NodeId,
        ctx: &mut CatchupContext<'_>,
    ) {
        let (our_size, our_root) = match ctx.handlers.handler(msg.ledger_id) {
            Some(handler) => (handler.ledger().size(), handler.ledger().root_hash()),
            None => return,
        };
        let syncing_this = self
            .active_ledger()
            .map(|l| l.ledger_id == msg.ledger_id && l.state == LedgerSyncState::Syncing)
            .unwrap_or(false);
        if !syncing_this {
            return;
        }

        if msg.size_to == our_size && msg.new_root == our_root {
            // a confirmation that our prefix is current
            let ledger = self.active_ledger_mut().expect("syncing");
            ledger.agreeing.insert(sender);
            let agreeing = ledger.agreeing.len();
            self.note_last_3pc(msg.last_3pc);
            if agreeing >= ctx.registry.quorums().weak() {
                self.mark_active_synced(ctx);
            }
            return;
        }
        if msg.size_to <= our_size {
            return;
        }
        if msg.size_from != our_size {
            debug!(
                "consistency proof for {:?} starts at {}, we hold {}",
                msg.ledger_id, msg.size_from, our_size,
            );
            return;
        }

        let last_3pc = msg.last_3pc;
        let (target_reached, ledger_id) = {
            let ledger = self.active_ledger_mut().expect("syncing");
            if ledger.target.is_some() {
                return;
            }
            ledger.proofs.insert(sender, msg);
            // weak quorum of proofs agreeing on (size, root)
            let mut counts: HashMap<(u64, Digest), usize> = collections::hash_map();
            for proof in ledger.proofs.values() {
                *counts.entry((proof.size_to, proof.new_root)).or_insert(0) += 1;
            }
            let agreed = counts
                .into_iter()
                .find(|(_, count)| *count >= ctx.registry.quorums().weak())
                .map(|((size, root), _)| CatchupTarget { size, root });
            match agreed {
                Some(target) => {
                    ledger.target = Some(target);
                    (true, ledger.ledger_id)
                }
                None => (false, ledger.ledger_id),
            }
        };
        if !target_reached {
            return;
        }
        self.note_last_3pc(last_3pc);

        let target_size = self
            .active_ledger()
            .and_then(|l| l.target.as_ref())
            .map(|t| t.size)
            .expect("just set");
        info!(
            "catching {:?} up from {} to {}",
            ledger_id, our_size, target_size,
        );
        self.request_txns(ledger_id, our_size, target_size, ctx);
    }

    // fans chunked CATCHUP_REQs out over the other validators
    fn request_txns(
        &mut self,
        ledger_id: LedgerId,
        from_size: u64,
        target_size: u64,
        ctx: &mut CatchupContext<'_>,
    ) {
        let peers: Vec<NodeId> = ctx
            .registry
            .ids()
            .filter(|id| *id != ctx.node_id)
            .collect();
        if peers.is_empty() {
            return;
        }
        let chunk = self.config.catchup_chunk_size as u64;
        let mut seq_no_from = from_size + 1;
        let mut peer = 0usize;
        while seq_no_from <= target_size {
            let seq_no_to = (seq_no_from + chunk - 1).min(target_size);
            let req = CatchupReq {
                ledger_id,
                seq_no_from,
                seq_no_to,
                catchup_till: target_size,
            };
            ctx.effects
                .directed
                .push((peers[peer % peers.len()], SystemMessage::CatchupReq(req)));
            peer += 1;
            seq_no_from = seq_no_to + 1;
        }
    }

    /// Serves a CATCHUP_REQ from a peer out of the local ledger.
    pub fn process_catchup_req(
        &mut self,
        msg: CatchupReq,
        sender: NodeId,
        ctx: &mut CatchupContext<'_>,
    ) {
        let handler = match ctx.handlers.handler(msg.ledger_id) {
            Some(handler) => handler,
            None => return,
        };
        let txns = handler.ledger().get_range(msg.seq_no_from, msg.seq_no_to);
        if txns.is_empty() {
            debug!(
                "cannot serve catch-up of {:?} [{}, {}]",
                msg.ledger_id, msg.seq_no_from, msg.seq_no_to,
            );
            return;
        }
        let proof = handler
            .ledger()
            .consistency_proof(msg.seq_no_from.saturating_sub(1), msg.catchup_till);
        let rep = CatchupRep {
            ledger_id: msg.ledger_id,
            txns,
            proof,
        };
        ctx.effects
            .directed
            .push((sender, SystemMessage::CatchupRep(rep)));
    }

    /// Processes a CATCHUP_REP chunk; once the full target range is
    /// buffered, verifies it against the agreed root and applies it.
    pub fn process_catchup_rep(
        &mut self,
        msg: CatchupRep,
        sender: NodeId,
        ctx: &mut CatchupContext<'_>,
    ) {
        let syncing_this = self
            .active_ledger()
            .map(|l| l.ledger_id == msg.ledger_id && l.target.is_some())
            .unwrap_or(false);
        if !syncing_this {
            debug!("unsolicited CATCHUP_REP from {:?}", sender);
            return;
        }
        let first_seq_no = match msg.first_seq_no() {
            Some(seq_no) => seq_no,
            None => return,
        };
        {
            let ledger = self.active_ledger_mut().expect("syncing");
            ledger.received.entry(first_seq_no).or_insert(msg.txns);
        }
        self.try_apply_received(ctx);
    }

    fn try_apply_received(&mut self, ctx: &mut CatchupContext<'_>) {
        let (ledger_id, target_size, target_root) = {
            let ledger = match self.active_ledger() {
                Some(ledger) => ledger,
                None => return,
            };
            let target = match &ledger.target {
                Some(target) => target,
                None => return,
            };
            (ledger.ledger_id, target.size, target.root)
        };
        let our_size = match ctx.handlers.handler(ledger_id) {
            Some(handler) => handler.ledger().size(),
            None => return,
        };

        // assemble the contiguous run from our prefix to the target
        let mut assembled: Vec<LedgerTxn> = Vec::new();
        let mut next = our_size + 1;
        {
            let ledger = self.active_ledger().expect("syncing");
            while next <= target_size {
                match ledger.received.get(&next) {
                    Some(chunk) => {
                        assembled.extend(chunk.iter().cloned());
                        next += chunk.len() as u64;
                    }
                    None => return, // still missing a chunk
                }
            }
        }

        let handler = ctx.handlers.handler_mut(ledger_id).expect("just checked");
        match handler.ledger_mut().append_verified(&assembled, &target_root) {
            Ok(()) => {
                if let Err(e) = handler.update_state(&assembled, true) {
                    warn!("state replay failed after catch-up of {:?}: {}", ledger_id, e);
                }
                info!(
                    "{:?} caught up with {} transactions, size now {}",
                    ledger_id,
                    assembled.len(),
                    target_size,
                );
                self.mark_active_synced(ctx);
            }
            Err(e) => {
                // probable inconsistent state; retry the ledger from
                // a fresh status exchange
                warn!("catch-up of {:?} failed verification: {}", ledger_id, e);
                let idx = self.active.expect("syncing");
                self.ledgers[idx].reset_round();
                self.start_ledger(idx, ctx);
            }
        }
    }

    fn mark_active_synced(&mut self, ctx: &mut CatchupContext<'_>) {
        let idx = match self.active {
            Some(idx) => idx,
            None => return,
        };
        self.ledgers[idx].state = LedgerSyncState::Synced;
        ctx.effects.synced_ledgers.push(self.ledgers[idx].ledger_id);
        self.advance(ctx);
    }

    /// Handles a round timeout previously armed through the effects:
    /// restarts the round if the ledger is still syncing.
    pub fn on_round_timeout(
        &mut self,
        ledger_id: LedgerId,
        round: u64,
        ctx: &mut CatchupContext<'_>,
    ) {
        let idx = match self.active {
            Some(idx)
                if self.ledgers[idx].ledger_id == ledger_id
                    && self.ledgers[idx].round == round
                    && self.ledgers[idx].state == LedgerSyncState::Syncing =>
            {
                idx
            }
            _ => return,
        };
        debug!("catch-up round {} of {:?} ran dry, retrying", round, ledger_id);
        self.ledgers[idx].reset_round();
        self.start_ledger(idx, ctx);
    }

    fn active_ledger(&self) -> Option<&LedgerCatchup> {
        self.active.map(|idx| &self.ledgers[idx])
    }

    fn active_ledger_mut(&mut self) -> Option<&mut LedgerCatchup> {
        let idx = self.active?;
        Some(&mut self.ledgers[idx])
    }

    fn note_last_3pc(&mut self, last_3pc: Option<ThreePhaseKey>) {
        if compare_3pc_keys(last_3pc, self.last_caught_up_3pc) == std::cmp::Ordering::Greater {
            self.last_caught_up_3pc = last_3pc;
        }
    }
}

// the status advertising our committed prefix of one ledger
fn own_status(ledger_id: LedgerId, ctx: &CatchupContext<'_>) -> LedgerStatus {
    let handler = ctx.handlers.handler(ledger_id).expect("registered");
    LedgerStatus {
        ledger_id,
        size: handler.ledger().size(),
        last_3pc: ctx.last_ordered_3pc,
        root: handler.ledger().root_hash(),
        protocol_version: LedgerStatus::CURRENT_VERSION,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bft::executable::{KvRequestHandler, RequestHandler};
    use crate::bft::message::{Request, RequestKey};

    const TXN_TYPE: u16 = 7;

    const N1: NodeId = NodeId::new(0);
    const N2: NodeId = NodeId::new(1);
    const N3: NodeId = NodeId::new(2);

    fn registry() -> NodeRegistry {
        NodeRegistry::new(
            ["N1", "N2", "N3", "N4"]
                .iter()
                .enumerate()
                .map(|(i, n)| (n.to_string(), NodeId::from(i as u32))),
        )
        .unwrap()
    }

    fn handlers_with_txns(count: u64) -> HandlerRegistry {
        let mut handlers = HandlerRegistry::new();
        let mut handler = KvRequestHandler::new(LedgerId::DOMAIN, TXN_TYPE);
        for i in 0..count {
            let mut payload = format!("key-{}", i).into_bytes();
            payload.push(0);
            payload.extend_from_slice(b"value");
            let request = Request::new(RequestKey::new("client-a", i), TXN_TYPE, payload);
            handler.apply(&request, 0).unwrap();
            let state_root = handler.state().head_root(false);
            let txn_root = handler.ledger().uncommitted_root_hash();
            handler.commit(1, &state_root, &txn_root, 0).unwrap();
        }
        handlers.register(Box::new(handler)).unwrap();
        handlers
    }

    fn config() -> PoolConfig {
        PoolConfig {
            catchup_chunk_size: 2,
            ..Default::default()
        }
    }

    #[test]
    fn up_to_date_ledger_syncs_from_null_proofs() {
        let registry = registry();
        let mut handlers = handlers_with_txns(2);
        let mut manager = LedgerManager::new(config());

        let status = {
            let mut ctx = CatchupContext::new(&registry, &mut handlers, N1, None);
            manager.start_catchup(&mut ctx);
            assert!(manager.is_in_progress());
            ctx.effects
                .broadcast
                .iter()
                .find_map(|m| match m {
                    SystemMessage::LedgerStatus(s) => Some(s.clone()),
                    _ => None,
                })
                .expect("status advertised")
        };

        // a current peer answers our advertisement with a null proof
        let null_proof = {
            let mut peer = LedgerManager::new(config());
            let mut peer_handlers = handlers_with_txns(2);
            let mut ctx = CatchupContext::new(
                &registry,
                &mut peer_handlers,
                N2,
                Some(ThreePhaseKey::new(0u64, 7u64)),
            );
            peer.process_ledger_status(status, N1, &mut ctx);
            ctx.effects
                .directed
                .iter()
                .find_map(|(to, m)| match m {
                    SystemMessage::ConsistencyProof(p) if *to == N1 => Some(p.clone()),
                    _ => None,
                })
                .expect("peer confirms with a null proof")
        };
        assert_eq!(null_proof.size_from, null_proof.size_to);
        assert!(null_proof.hashes.is_empty());

        // two confirmations (f + 1 = 2) conclude the ledger is
        // current
        let mut ctx = CatchupContext::new(&registry, &mut handlers, N1, None);
        manager.process_consistency_proof(null_proof.clone(), N2, &mut ctx);
        assert!(manager.is_in_progress());
        manager.process_consistency_proof(null_proof, N3, &mut ctx);

        assert!(!manager.is_in_progress());
        assert_eq!(
            ctx.effects.complete,
            Some(Some(ThreePhaseKey::new(0u64, 7u64))),
        );
        assert_eq!(manager.state_of(LedgerId::DOMAIN), LedgerSyncState::Synced);
    }

    #[test]
    fn lagging_ledger_catches_up_through_proofs_and_chunks() {
        let registry = registry();
        // the pool holds five transactions, we hold none
        let mut peer_handlers = handlers_with_txns(5);
        let mut local_handlers = handlers_with_txns(0);
        let mut manager = LedgerManager::new(config());

        let status = {
            let mut ctx = CatchupContext::new(&registry, &mut local_handlers, N1, None);
            manager.start_catchup(&mut ctx);
            ctx.effects
                .broadcast
                .iter()
                .find_map(|m| match m {
                    SystemMessage::LedgerStatus(s) => Some(s.clone()),
                    _ => None,
                })
                .expect("status advertised")
        };

        // a peer manager serves the proof for our status
        let proof = {
            let mut peer = LedgerManager::new(config());
            let mut ctx = CatchupContext::new(
                &registry,
                &mut peer_handlers,
                N2,
                Some(ThreePhaseKey::new(0u64, 5u64)),
            );
            peer.process_ledger_status(status, N1, &mut ctx);
            ctx.effects
                .directed
                .iter()
                .find_map(|(to, m)| match m {
                    SystemMessage::ConsistencyProof(p) if *to == N1 => Some(p.clone()),
                    _ => None,
                })
                .expect("peer proves its longer prefix")
        };
        assert_eq!(proof.size_from, 0);
        assert_eq!(proof.size_to, 5);

        // a weak quorum of matching proofs commits us to the target
        let reqs = {
            let mut ctx = CatchupContext::new(&registry, &mut local_handlers, N1, None);
            manager.process_consistency_proof(proof.clone(), N2, &mut ctx);
            manager.process_consistency_proof(proof, N3, &mut ctx);
            ctx.effects
                .directed
                .iter()
                .filter_map(|(to, m)| match m {
                    SystemMessage::CatchupReq(r) => Some((*to, r.clone())),
                    _ => None,
                })
                .collect::<Vec<_>>()
        };
        // five transactions in chunks of two
        assert_eq!(reqs.len(), 3);
        assert_eq!(reqs[0].1.seq_no_from, 1);
        assert_eq!(reqs[2].1.seq_no_to, 5);

        // peers serve the chunks; the last chunk completes the run
        let mut reps = Vec::new();
        for (_, req) in &reqs {
            let mut peer = LedgerManager::new(config());
            let mut ctx = CatchupContext::new(&registry, &mut peer_handlers, N2, None);
            peer.process_catchup_req(req.clone(), N1, &mut ctx);
            reps.extend(ctx.effects.directed.iter().filter_map(|(_, m)| match m {
                SystemMessage::CatchupRep(r) => Some(r.clone()),
                _ => None,
            }));
        }
        assert_eq!(reps.len(), 3);

        let mut ctx = CatchupContext::new(&registry, &mut local_handlers, N1, None);
        // deliver out of order; the manager assembles them
        manager.process_catchup_rep(reps[2].clone(), N3, &mut ctx);
        manager.process_catchup_rep(reps[0].clone(), N2, &mut ctx);
        assert!(manager.is_in_progress());
        manager.process_catchup_rep(reps[1].clone(), N2, &mut ctx);

        assert!(!manager.is_in_progress());
        assert_eq!(manager.state_of(LedgerId::DOMAIN), LedgerSyncState::Synced);
        let local = local_handlers.handler(LedgerId::DOMAIN).unwrap();
        let peer = peer_handlers.handler(LedgerId::DOMAIN).unwrap();
        assert_eq!(local.ledger().size(), 5);
        assert_eq!(local.ledger().root_hash(), peer.ledger().root_hash());
    }

    #[test]
    fn round_timeouts_rebroadcast_the_status() {
        let registry = registry();
        let mut handlers = handlers_with_txns(0);
        let mut manager = LedgerManager::new(config());

        let mut ctx = CatchupContext::new(&registry, &mut handlers, N1, None);
        manager.start_catchup(&mut ctx);
        let (ledger_id, round, _) = ctx.effects.schedule_round.expect("round armed");

        let mut ctx = CatchupContext::new(&registry, &mut handlers, N1, None);
        manager.on_round_timeout(ledger_id, round, &mut ctx);
        assert!(ctx
            .effects
            .broadcast
            .iter()
            .any(|m| matches!(m, SystemMessage::LedgerStatus(_))));
        // a stale round handle does nothing
        let mut ctx = CatchupContext::new(&registry, &mut handlers, N1, None);
        manager.on_round_timeout(ledger_id, round, &mut ctx);
        assert!(ctx.effects.broadcast.is_empty());
    }
}
