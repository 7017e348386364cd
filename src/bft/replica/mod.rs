//! A single protocol instance of the three-phase commit protocol.
//!
//! Each node runs `f + 1` replicas over the same finalized request
//! traffic. A replica accepts PRE-PREPAREs from the primary of its
//! instance, echoes them with PREPAREs, commits with COMMITs, and
//! emits ordered batches once a commit quorum closes over a batch
//! whose predecessors are ordered. The master instance additionally
//! applies batches to the uncommitted ledgers while they travel
//! through the protocol, so the roots it votes on are its own.
//!
//! The replica never blocks and never calls out of the core: waiting
//! is materialized in explicit stashes, and every outward action is
//! collected in the `ReplicaContext` the caller hands in.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use either::{Left, Right};
use log::{debug, info, trace, warn};
use smallvec::SmallVec;

use crate::bft::collections::{self, HashMap, HashSet, OrderedMap};
use crate::bft::config::PoolConfig;
use crate::bft::crypto::hash::{Context, Digest};
use crate::bft::executable::{HandlerRegistry, RequestHandler};
use crate::bft::ledger::LedgerId;
use crate::bft::message::{
    CheckpointMessage, Commit, ConsensusMessage, ConsensusMessageKind, MessageReq, Prepare,
    PrePrepare, SystemMessage, ThreePcMsgKind,
};
use crate::bft::ordering::{SeqNo, ThreePhaseKey, ViewNo};
use crate::bft::registry::{InstanceId, NodeId, NodeRegistry};
use crate::bft::requests::RequestStore;
use crate::bft::suspicion::Suspicion;

/// A batch ordered by a replica, handed to the node for execution.
#[derive(Clone, Debug)]
pub struct OrderedBatch {
    pub instance_id: InstanceId,
    pub key: ThreePhaseKey,
    pub pp_time: u64,
    /// The digests of the requests which passed dynamic validation,
    /// in proposal order.
    pub req_digests: Vec<Digest>,
    pub ledger_id: LedgerId,
    pub state_root: Digest,
    pub txn_root: Digest,
}

/// Everything a replica asked the node to do during one call.
#[derive(Default)]
pub struct ReplicaEffects {
    /// Messages to broadcast to every validator.
    pub broadcast: Vec<SystemMessage>,
    /// Messages to send to one validator.
    pub directed: Vec<(NodeId, SystemMessage)>,
    /// Batches ordered by this replica.
    pub ordered: Vec<OrderedBatch>,
    /// Requests rejected during batch formation, with the reason.
    pub rejects: Vec<(Digest, String)>,
    /// Suspicions raised against peers.
    pub suspicions: Vec<(NodeId, Suspicion)>,
    /// Digests whose PROPAGATEs should be re-requested.
    pub request_propagates: Vec<Digest>,
    /// Requests freed by checkpoint garbage collection.
    pub freed_requests: Vec<Digest>,
    /// The replica fell too far behind and wants a catch-up.
    pub needs_catchup: bool,
}

/// The node-owned resources a replica borrows for one call, plus the
/// effect buffers it fills.
///
/// Replicas never store this; it is rebuilt per call, which keeps the
/// node and its replicas free of reference cycles.
pub struct ReplicaContext<'a> {
    pub registry: &'a NodeRegistry,
    pub requests: &'a RequestStore,
    pub handlers: &'a mut HandlerRegistry,
    pub participating: bool,
    pub effects: ReplicaEffects,
}

impl<'a> ReplicaContext<'a> {
    pub fn new(
        registry: &'a NodeRegistry,
        requests: &'a RequestStore,
        handlers: &'a mut HandlerRegistry,
        participating: bool,
    ) -> Self {
        Self {
            registry,
            requests,
            handlers,
            participating,
            effects: ReplicaEffects::default(),
        }
    }
}

/// Counters over the three-phase traffic of one replica.
#[derive(Default, Debug, Clone)]
pub struct Stats {
    pub pre_prepares_sent: u64,
    pub pre_prepares_rcvd: u64,
    pub prepares_sent: u64,
    pub prepares_rcvd: u64,
    pub commits_sent: u64,
    pub commits_rcvd: u64,
    pub batches_ordered: u64,
    pub checkpoints_sent: u64,
}

// why a PRE-PREPARE cannot be processed right now
enum PpCheck {
    NotFromPrimary,
    ToPrimary,
    Duplicate,
    Redelivery,
    Old,
    RequestsNotFinalized(Vec<Digest>),
    WrongTime,
    NotNext,
}

// why applying a PRE-PREPARE on the master failed
enum PpApply {
    RejectWrong,
    DigestWrong,
    StateWrong,
    TxnWrong,
}

struct PrepareVotes {
    votes: HashMap<NodeId, Prepare>,
}

struct CommitVotes {
    votes: HashMap<NodeId, Commit>,
}

struct CheckpointState {
    seq: SeqNo,
    digests: Vec<Digest>,
    digest: Option<Digest>,
    received: HashMap<NodeId, Digest>,
    stable: bool,
}

struct BatchInfo {
    ledger_id: LedgerId,
    valid: u64,
    prev_state_root: Digest,
}

/// A single instance of the three-phase protocol.
pub struct Replica {
    node_id: NodeId,
    instance_id: InstanceId,
    config: PoolConfig,

    view_no: ViewNo,
    primary: Option<NodeId>,
    view_change_in_progress: bool,
    last_prepared_before_view_change: Option<ThreePhaseKey>,

    // finalized request queues, one per ledger, insertion ordered
    req_queues: BTreeMap<LedgerId, OrderedMap<Digest, ()>>,
    last_batch_created: u64,

    sent_pre_prepares: BTreeMap<ThreePhaseKey, PrePrepare>,
    pre_prepares: BTreeMap<ThreePhaseKey, PrePrepare>,
    prepares: BTreeMap<ThreePhaseKey, PrepareVotes>,
    commits: BTreeMap<ThreePhaseKey, CommitVotes>,
    ordered: BTreeSet<ThreePhaseKey>,
    batches: BTreeMap<ThreePhaseKey, BatchInfo>,

    last_ordered: ThreePhaseKey,
    last_pp_seq_no: SeqNo,
    last_accepted_pp_time: u64,

    h: SeqNo,
    checkpoints: BTreeMap<(u64, u64), CheckpointState>,
    stashed_checkpoints: BTreeMap<ViewNo, BTreeMap<(u64, u64), HashMap<NodeId, Digest>>>,

    // stashes; every kind of waiting the replica does lives here
    stashed_outside_watermarks: VecDeque<(ConsensusMessage, NodeId)>,
    pre_prepares_pending_fin_reqs: Vec<(ConsensusMessage, NodeId)>,
    pre_prepares_pending_prev_pp: BTreeMap<ThreePhaseKey, (ConsensusMessage, NodeId)>,
    prepares_waiting_for_pre_prepare: HashMap<ThreePhaseKey, Vec<(ConsensusMessage, NodeId)>>,
    commits_waiting_for_prepare: HashMap<ThreePhaseKey, Vec<(ConsensusMessage, NodeId)>>,
    pre_prepares_stashed_for_incorrect_time: BTreeMap<ThreePhaseKey, (ConsensusMessage, NodeId)>,
    stashed_out_of_order_commits: BTreeMap<ViewNo, BTreeMap<SeqNo, ThreePhaseKey>>,
    requested_msgs: HashSet<(ThreePcMsgKind, ThreePhaseKey)>,

    pub stats: Stats,
}

impl Replica {
    /// Creates a replica for one protocol instance of a node.
    pub fn new(node_id: NodeId, instance_id: InstanceId, config: PoolConfig) -> Self {
        Self {
            node_id,
            instance_id,
            config,
            view_no: ViewNo::ZERO,
            primary: None,
            view_change_in_progress: false,
            last_prepared_before_view_change: None,
            req_queues: BTreeMap::new(),
            last_batch_created: 0,
            sent_pre_prepares: BTreeMap::new(),
            pre_prepares: BTreeMap::new(),
            prepares: BTreeMap::new(),
            commits: BTreeMap::new(),
            ordered: BTreeSet::new(),
            batches: BTreeMap::new(),
            last_ordered: ThreePhaseKey::ZERO,
            last_pp_seq_no: SeqNo::ZERO,
            last_accepted_pp_time: 0,
            h: SeqNo::ZERO,
            checkpoints: BTreeMap::new(),
            stashed_checkpoints: BTreeMap::new(),
            stashed_outside_watermarks: VecDeque::new(),
            pre_prepares_pending_fin_reqs: Vec::new(),
            pre_prepares_pending_prev_pp: BTreeMap::new(),
            prepares_waiting_for_pre_prepare: collections::hash_map(),
            commits_waiting_for_prepare: collections::hash_map(),
            pre_prepares_stashed_for_incorrect_time: BTreeMap::new(),
            stashed_out_of_order_commits: BTreeMap::new(),
            requested_msgs: collections::hash_set(),
            stats: Stats::default(),
        }
    }

    /// The instance this replica runs.
    pub fn instance_id(&self) -> InstanceId {
        self.instance_id
    }

    /// Whether this replica runs the master instance.
    pub fn is_master(&self) -> bool {
        self.instance_id.is_master()
    }

    /// The view this replica is in.
    pub fn view_no(&self) -> ViewNo {
        self.view_no
    }

    /// The primary of this instance in the current view.
    pub fn primary(&self) -> Option<NodeId> {
        self.primary
    }

    /// Whether this node is the primary of this instance.
    pub fn is_primary(&self) -> bool {
        self.primary == Some(self.node_id)
    }

    /// The low watermark.
    pub fn h(&self) -> SeqNo {
        self.h
    }

    /// The high watermark.
    pub fn high_watermark(&self) -> SeqNo {
        SeqNo::from(self.config.high_watermark(u64::from(self.h)))
    }

    /// The key of the last batch this replica ordered.
    pub fn last_ordered_3pc(&self) -> ThreePhaseKey {
        self.last_ordered
    }

    /// Whether a view change is currently in progress.
    pub fn view_change_in_progress(&self) -> bool {
        self.view_change_in_progress
    }

    /// Registers a ledger this replica batches requests for.
    pub fn register_ledger(&mut self, ledger_id: LedgerId) {
        self.req_queues
            .entry(ledger_id)
            .or_insert_with(collections::ordered_map);
    }

    /// Installs the primary of this instance, e.g. after a view
    /// change completed or the initial view was adopted.
    pub fn set_primary(&mut self, primary: Option<NodeId>) {
        self.primary = primary;
    }

    /// Number of requests queued for batching.
    pub fn queued_requests(&self) -> usize {
        self.req_queues.values().map(OrderedMap::len).sum()
    }

    // ------------------------------------------------------------------
    // request intake

    /// Queues a finalized request for batching, and retries any
    /// PRE-PREPARE stashed for requests that were not finalized.
    pub fn enqueue_finalized_request(
        &mut self,
        digest: Digest,
        ledger_id: LedgerId,
        now: u64,
        ctx: &mut ReplicaContext<'_>,
    ) {
        self.req_queues
            .entry(ledger_id)
            .or_insert_with(collections::ordered_map)
            .insert(digest, ());
        self.retry_pre_prepares_pending_fin_reqs(now, ctx);
    }

    fn retry_pre_prepares_pending_fin_reqs(&mut self, now: u64, ctx: &mut ReplicaContext<'_>) {
        if self.pre_prepares_pending_fin_reqs.is_empty() {
            return;
        }
        let pending = std::mem::take(&mut self.pre_prepares_pending_fin_reqs);
        for (msg, sender) in pending {
            // messages which are still missing requests re-stash
            self.process_consensus(msg, sender, now, ctx);
        }
    }

    // ------------------------------------------------------------------
    // batch formation

    /// Drives this replica forward: proposes batches when it is the
    /// primary, and rescans commits stashed out of order.
    pub fn tick(&mut self, now: u64, ctx: &mut ReplicaContext<'_>) {
        if self.is_primary() && !self.view_change_in_progress {
            self.send_3pc_batches(now, ctx);
        }
        if !self.stashed_out_of_order_commits.is_empty() {
            self.process_stashed_out_of_order_commits(ctx);
        }
    }

    fn send_3pc_batches(&mut self, now: u64, ctx: &mut ReplicaContext<'_>) {
        let ledgers: SmallVec<[LedgerId; 4]> = self.req_queues.keys().copied().collect();
        for ledger_id in ledgers {
            loop {
                let queued = self.req_queues[&ledger_id].len();
                if queued == 0 {
                    break;
                }
                let full = queued >= self.config.max_batch_size;
                let waited =
                    now.saturating_sub(self.last_batch_created) >= self.config.max_batch_wait;
                if !full && !waited {
                    break;
                }
                if u64::from(self.last_pp_seq_no.next())
                    > self.config.high_watermark(u64::from(self.h))
                {
                    // watermark window exhausted; wait for a stable
                    // checkpoint before proposing further
                    break;
                }
                self.create_3pc_batch(ledger_id, now, ctx);
                if !full {
                    break;
                }
            }
        }
    }

    fn create_3pc_batch(&mut self, ledger_id: LedgerId, now: u64, ctx: &mut ReplicaContext<'_>) {
        let pp_time = now.max(self.last_accepted_pp_time);
        let pp_seq_no = self.last_pp_seq_no.next();
        let key = ThreePhaseKey::new(self.view_no, pp_seq_no);

        let drained: Vec<Digest> = {
            let queue = self.req_queues.get_mut(&ledger_id).expect("registered");
            let count = queue.len().min(self.config.max_batch_size);
            (0..count)
                .filter_map(|_| queue.pop_front().map(|(digest, ())| digest))
                .collect()
        };

        let (req_digests, discarded, state_root, txn_root, prev_state_root) =
            if self.is_master() && ctx.participating {
                self.apply_batch_as_primary(ledger_id, &drained, pp_time, ctx)
            } else {
                // backup instances order without touching state
                (
                    drained.clone(),
                    drained.len() as u64,
                    Digest::blank(),
                    Digest::blank(),
                    Digest::blank(),
                )
            };

        let digest = PrePrepare::batch_digest(&req_digests);
        let pp = PrePrepare {
            pp_time,
            req_digests,
            discarded,
            digest,
            ledger_id,
            state_root,
            txn_root,
            bls_multi_sig: None,
        };

        debug!(
            "replica {:?}:{:?} sending PRE-PREPARE {} with {} requests ({} valid)",
            self.node_id,
            self.instance_id,
            key,
            pp.req_digests.len(),
            discarded,
        );

        self.batches.insert(
            key,
            BatchInfo {
                ledger_id,
                valid: discarded,
                prev_state_root,
            },
        );
        self.sent_pre_prepares.insert(key, pp.clone());
        self.last_pp_seq_no = pp_seq_no;
        self.last_accepted_pp_time = pp_time;
        self.last_batch_created = now;
        self.stats.pre_prepares_sent += 1;

        let msg = ConsensusMessage::new(
            self.instance_id,
            self.view_no,
            pp_seq_no,
            ConsensusMessageKind::PrePrepare(pp),
        );
        ctx.effects.broadcast.push(SystemMessage::Consensus(msg));
    }

    // runs dynamic validation and applies the batch to the
    // uncommitted ledger and state; returns the reordered digests
    // (valid first), the valid count, and the post-apply roots
    fn apply_batch_as_primary(
        &mut self,
        ledger_id: LedgerId,
        drained: &[Digest],
        pp_time: u64,
        ctx: &mut ReplicaContext<'_>,
    ) -> (Vec<Digest>, u64, Digest, Digest, Digest) {
        let handler = ctx.handlers.handler_mut(ledger_id).expect("registered");
        let prev_state_root = handler.state().head_root(false);

        let mut valid = Vec::with_capacity(drained.len());
        let mut invalid = Vec::new();
        for digest in drained {
            let request = match ctx.requests.get(digest) {
                Some(request) => request,
                None => {
                    // finalized entry raced a concurrent free; skip
                    warn!("request {:?} vanished while batching", digest);
                    continue;
                }
            };
            match handler.validate(request) {
                Ok(()) => match handler.apply(request, pp_time) {
                    Ok(_) => valid.push(*digest),
                    Err(e) => {
                        ctx.effects.rejects.push((*digest, e.to_string()));
                        invalid.push(*digest);
                    }
                },
                Err(e) => {
                    ctx.effects.rejects.push((*digest, e.to_string()));
                    invalid.push(*digest);
                }
            }
        }

        let discarded = valid.len() as u64;
        valid.extend(invalid);
        let state_root = handler.state().head_root(false);
        let txn_root = handler.ledger().uncommitted_root_hash();
        (valid, discarded, state_root, txn_root, prev_state_root)
    }

    // ------------------------------------------------------------------
    // message intake

    /// Processes a three-phase message received from a peer replica.
    pub fn process_consensus(
        &mut self,
        msg: ConsensusMessage,
        sender: NodeId,
        now: u64,
        ctx: &mut ReplicaContext<'_>,
    ) {
        let key = msg.three_phase_key();

        if key.view_no < self.view_no {
            // ordering from an older view is only allowed for
            // commits covered by the last prepared certificate
            // observed before the view change started
            let allowed = self.view_change_in_progress
                && matches!(msg.kind(), ConsensusMessageKind::Commit(_))
                && self
                    .last_prepared_before_view_change
                    .map(|last| key <= last)
                    .unwrap_or(false);
            if !allowed {
                trace!("discarding {} from view {} (old view)", key, key.view_no);
                return;
            }
        }

        // watermark window; checkpointed state below h is gone
        if key.pp_seq_no <= self.h {
            trace!("discarding {} at or below stable checkpoint {}", key, self.h);
            return;
        }
        if key.pp_seq_no > self.high_watermark() {
            match key.pp_seq_no.index(self.h, self.config.log_size) {
                Right(_) => {
                    debug!("stashing {} outside watermarks (h = {})", key, self.h);
                    self.stashed_outside_watermarks.push_back((msg, sender));
                }
                Left(_) => {
                    // far past the window; most likely a malicious
                    // sender flooding the stash
                    warn!("discarding {} far beyond the watermark window", key);
                }
            }
            return;
        }

        let kind = match msg.kind() {
            ConsensusMessageKind::PrePrepare(_) => ThreePcMsgKind::PrePrepare,
            ConsensusMessageKind::Prepare(_) => ThreePcMsgKind::Prepare,
            ConsensusMessageKind::Commit(_) => ThreePcMsgKind::Commit,
        };
        match kind {
            ThreePcMsgKind::PrePrepare => self.process_pre_prepare(msg, sender, now, true, ctx),
            ThreePcMsgKind::Prepare => self.process_prepare(msg, sender, now, ctx),
            ThreePcMsgKind::Commit => self.process_commit(msg, sender, now, ctx),
        }
    }

    // ------------------------------------------------------------------
    // PRE-PREPARE

    fn process_pre_prepare(
        &mut self,
        msg: ConsensusMessage,
        sender: NodeId,
        now: u64,
        verify_time: bool,
        ctx: &mut ReplicaContext<'_>,
    ) {
        let key = msg.three_phase_key();
        let pp = match msg.kind() {
            ConsensusMessageKind::PrePrepare(pp) => pp,
            _ => return,
        };
        self.stats.pre_prepares_rcvd += 1;

        match self.can_process_pre_prepare(key, pp, sender, now, verify_time, ctx) {
            None => {
                if let Some(why) = self.accept_pre_prepare(key, msg, sender, now, ctx) {
                    let suspicion = match why {
                        PpApply::RejectWrong => Suspicion::PprRejectWrong,
                        PpApply::DigestWrong => Suspicion::PprDigestWrong,
                        PpApply::StateWrong => Suspicion::PprStateWrong,
                        PpApply::TxnWrong => Suspicion::PprTxnWrong,
                    };
                    ctx.effects.suspicions.push((sender, suspicion));
                }
            }
            Some(PpCheck::NotFromPrimary) => {
                ctx.effects
                    .suspicions
                    .push((sender, Suspicion::PprFromNonPrimary));
            }
            Some(PpCheck::ToPrimary) => {
                ctx.effects
                    .suspicions
                    .push((sender, Suspicion::PprToPrimary));
            }
            Some(PpCheck::Duplicate) => {
                ctx.effects
                    .suspicions
                    .push((sender, Suspicion::DuplicatePprSent));
            }
            Some(PpCheck::Redelivery) => {
                trace!("ignoring redelivered PRE-PREPARE {}", key);
            }
            Some(PpCheck::Old) => {
                debug!("PRE-PREPARE {} is older than the last accepted one", key);
            }
            Some(PpCheck::RequestsNotFinalized(missing)) => {
                debug!(
                    "PRE-PREPARE {} references {} unfinalized requests",
                    key,
                    missing.len(),
                );
                ctx.effects.request_propagates.extend(missing);
                self.pre_prepares_pending_fin_reqs.push((msg, sender));
            }
            Some(PpCheck::WrongTime) => {
                warn!("PRE-PREPARE {} carries an unacceptable time", key);
                self.pre_prepares_stashed_for_incorrect_time
                    .insert(key, (msg, sender));
                ctx.effects
                    .suspicions
                    .push((sender, Suspicion::PprTimeWrong));
            }
            Some(PpCheck::NotNext) => {
                self.request_missing_pre_prepares(key, sender, ctx);
                self.pre_prepares_pending_prev_pp.insert(key, (msg, sender));
            }
        }
    }

    fn can_process_pre_prepare(
        &self,
        key: ThreePhaseKey,
        pp: &PrePrepare,
        sender: NodeId,
        now: u64,
        verify_time: bool,
        ctx: &ReplicaContext<'_>,
    ) -> Option<PpCheck> {
        if self.primary != Some(sender) {
            return Some(PpCheck::NotFromPrimary);
        }
        if self.is_primary() {
            return Some(PpCheck::ToPrimary);
        }
        if let Some(held) = self.pre_prepares.get(&key) {
            return Some(if held == pp {
                PpCheck::Redelivery
            } else {
                PpCheck::Duplicate
            });
        }
        if key <= self.last_pp_3pc() {
            return Some(PpCheck::Old);
        }
        let missing: Vec<Digest> = pp
            .req_digests
            .iter()
            .filter(|digest| !ctx.requests.is_finalized(digest))
            .copied()
            .collect();
        if !missing.is_empty() {
            return Some(PpCheck::RequestsNotFinalized(missing));
        }
        if verify_time && !self.is_pre_prepare_time_acceptable(pp.pp_time, now) {
            return Some(PpCheck::WrongTime);
        }
        if !self.is_next_pre_prepare(key) {
            return Some(PpCheck::NotNext);
        }
        None
    }

    fn is_pre_prepare_time_acceptable(&self, pp_time: u64, now: u64) -> bool {
        if pp_time < self.last_accepted_pp_time {
            return false;
        }
        let deviation = now.max(pp_time) - now.min(pp_time);
        deviation <= self.config.acceptable_deviation
    }

    fn last_pp_3pc(&self) -> ThreePhaseKey {
        let last_held = self
            .pre_prepares
            .keys()
            .next_back()
            .copied()
            .unwrap_or(ThreePhaseKey::ZERO);
        last_held.max(self.last_ordered)
    }

    fn is_next_pre_prepare(&self, key: ThreePhaseKey) -> bool {
        if key.view_no != self.view_no {
            return false;
        }
        let last = self.last_pp_3pc();
        let expected = if last.view_no == self.view_no && last != ThreePhaseKey::ZERO {
            last.pp_seq_no.next()
        } else {
            // first batch of a view always carries sequence one,
            // unless catch-up already moved the watermark
            self.h.next().max(SeqNo::ONE)
        };
        key.pp_seq_no == expected
    }

    fn request_missing_pre_prepares(
        &mut self,
        key: ThreePhaseKey,
        primary: NodeId,
        ctx: &mut ReplicaContext<'_>,
    ) {
        let last = self.last_pp_3pc();
        let seq_frm = if last.view_no == key.view_no {
            u64::from(last.pp_seq_no) + 1
        } else {
            u64::from(self.h) + 1
        };
        let seq_to = u64::from(key.pp_seq_no).saturating_sub(1);
        if seq_to < seq_frm || seq_to - seq_frm + 1 > self.config.chk_freq {
            // a gap wider than one checkpoint interval is served by
            // catch-up, not point recovery
            return;
        }
        warn!(
            "replica {:?}:{:?} missing PRE-PREPAREs {}..={} of view {}, requesting",
            self.node_id, self.instance_id, seq_frm, seq_to, key.view_no,
        );
        for seq in seq_frm..=seq_to {
            let missing = ThreePhaseKey::new(key.view_no, seq);
            if self.pre_prepares.contains_key(&missing) {
                continue;
            }
            if self
                .requested_msgs
                .insert((ThreePcMsgKind::PrePrepare, missing))
            {
                let req = MessageReq {
                    kind: ThreePcMsgKind::PrePrepare,
                    instance_id: self.instance_id,
                    view_no: missing.view_no,
                    pp_seq_no: missing.pp_seq_no,
                };
                ctx.effects
                    .directed
                    .push((primary, SystemMessage::MessageReq(req)));
            }
        }
    }

    // applies the batch (master) and installs the PRE-PREPARE,
    // sending our PREPARE; returns the reason when the apply phase
    // disagrees with the primary
    fn accept_pre_prepare(
        &mut self,
        key: ThreePhaseKey,
        msg: ConsensusMessage,
        sender: NodeId,
        now: u64,
        ctx: &mut ReplicaContext<'_>,
    ) -> Option<PpApply> {
        let pp = match msg.into_kind() {
            ConsensusMessageKind::PrePrepare(pp) => pp,
            _ => return None,
        };

        if PrePrepare::batch_digest(&pp.req_digests) != pp.digest {
            return Some(PpApply::DigestWrong);
        }

        if self.is_master() && ctx.participating {
            if let Some(why) = self.apply_pre_prepare(key, &pp, ctx) {
                return Some(why);
            }
        }

        debug!(
            "replica {:?}:{:?} accepted PRE-PREPARE {} from {:?}",
            self.node_id, self.instance_id, key, sender,
        );

        self.last_accepted_pp_time = pp.pp_time;
        let prepare = Prepare {
            pp_time: pp.pp_time,
            digest: pp.digest,
            state_root: pp.state_root,
            txn_root: pp.txn_root,
            bls_share: None,
        };
        self.pre_prepares.insert(key, pp);

        // our own PREPARE vote; the primary's PRE-PREPARE substitutes
        // for its own PREPARE, but a primary never reaches this path
        if !self.is_primary() {
            self.add_prepare_vote(key, self.node_id, prepare.clone());
            let msg = ConsensusMessage::new(
                self.instance_id,
                key.view_no,
                key.pp_seq_no,
                ConsensusMessageKind::Prepare(prepare),
            );
            ctx.effects.broadcast.push(SystemMessage::Consensus(msg));
            self.stats.prepares_sent += 1;
        }

        self.dequeue_waiting_votes(key, now, ctx);
        self.try_commit(key, ctx);

        // the accepted batch may close the gap in front of a stashed
        // successor
        let next = ThreePhaseKey::new(key.view_no, key.pp_seq_no.next());
        if let Some((msg, sender)) = self.pre_prepares_pending_prev_pp.remove(&next) {
            self.process_pre_prepare(msg, sender, now, false, ctx);
        }
        None
    }

    fn apply_pre_prepare(
        &mut self,
        key: ThreePhaseKey,
        pp: &PrePrepare,
        ctx: &mut ReplicaContext<'_>,
    ) -> Option<PpApply> {
        let handler = match ctx.handlers.handler_mut(pp.ledger_id) {
            Some(handler) => handler,
            None => {
                warn!("PRE-PREPARE {} targets an unknown ledger", key);
                return Some(PpApply::RejectWrong);
            }
        };
        let prev_state_root = handler.state().head_root(false);

        fn revert(handler: &mut Box<dyn RequestHandler>, applied: u64, prev_root: &Digest) {
            handler.ledger_mut().discard_txns(applied);
            if let Err(e) = handler.state_mut().revert_to_head(prev_root) {
                warn!("state revert after failed apply: {}", e);
            }
        }

        let mut applied = 0u64;
        let mut valid = 0u64;
        let mut reject_mismatch = false;
        for (idx, digest) in pp.req_digests.iter().enumerate() {
            let request = match ctx.requests.get(digest) {
                Some(request) => request,
                None => {
                    reject_mismatch = true;
                    break;
                }
            };
            let is_valid = handler.validate(request).is_ok();
            if is_valid {
                if handler.apply(request, pp.pp_time).is_err() {
                    reject_mismatch = true;
                    break;
                }
                applied += 1;
                valid += 1;
                if idx as u64 >= pp.discarded {
                    // the primary claimed this request invalid
                    reject_mismatch = true;
                    break;
                }
            } else if (idx as u64) < pp.discarded {
                // the primary claimed this request valid
                reject_mismatch = true;
                break;
            }
        }

        if reject_mismatch || valid != pp.discarded {
            revert(handler, applied, &prev_state_root);
            return Some(PpApply::RejectWrong);
        }
        if handler.state().head_root(false) != pp.state_root {
            revert(handler, applied, &prev_state_root);
            return Some(PpApply::StateWrong);
        }
        if handler.ledger().uncommitted_root_hash() != pp.txn_root {
            revert(handler, applied, &prev_state_root);
            return Some(PpApply::TxnWrong);
        }

        self.batches.insert(
            key,
            BatchInfo {
                ledger_id: pp.ledger_id,
                valid,
                prev_state_root,
            },
        );
        None
    }

    fn dequeue_waiting_votes(&mut self, key: ThreePhaseKey, now: u64, ctx: &mut ReplicaContext<'_>) {
        if let Some(waiting) = self.prepares_waiting_for_pre_prepare.remove(&key) {
            for (msg, sender) in waiting {
                self.process_prepare(msg, sender, now, ctx);
            }
        }
        if let Some(waiting) = self.commits_waiting_for_prepare.remove(&key) {
            for (msg, sender) in waiting {
                self.process_commit(msg, sender, now, ctx);
            }
        }
    }

    // ------------------------------------------------------------------
    // PREPARE

    fn process_prepare(
        &mut self,
        msg: ConsensusMessage,
        sender: NodeId,
        now: u64,
        ctx: &mut ReplicaContext<'_>,
    ) {
        let key = msg.three_phase_key();
        let prepare = match msg.kind() {
            ConsensusMessageKind::Prepare(prepare) => prepare.clone(),
            _ => return,
        };
        self.stats.prepares_rcvd += 1;

        if self.primary == Some(sender) {
            ctx.effects
                .suspicions
                .push((sender, Suspicion::PrFromPrimary));
            return;
        }
        if let Some(votes) = self.prepares.get(&key) {
            if let Some(held) = votes.votes.get(&sender) {
                if *held != prepare {
                    ctx.effects
                        .suspicions
                        .push((sender, Suspicion::DuplicatePrSent));
                }
                return;
            }
        }

        let accepted = match self.accepted_pre_prepare(key) {
            Some(pp) => pp.clone(),
            None => {
                if self.is_primary() {
                    // we never proposed this batch
                    ctx.effects
                        .suspicions
                        .push((sender, Suspicion::UnknownPrSent));
                    return;
                }
                self.prepares_waiting_for_pre_prepare
                    .entry(key)
                    .or_default()
                    .push((msg, sender));
                self.try_rescue_stashed_pre_prepare(key, now, ctx);
                return;
            }
        };

        if prepare.digest != accepted.digest {
            ctx.effects
                .suspicions
                .push((sender, Suspicion::PrDigestWrong));
            return;
        }
        if prepare.state_root != accepted.state_root {
            ctx.effects
                .suspicions
                .push((sender, Suspicion::PrStateWrong));
            return;
        }
        if prepare.txn_root != accepted.txn_root {
            ctx.effects
                .suspicions
                .push((sender, Suspicion::PrTxnWrong));
            return;
        }

        self.add_prepare_vote(key, sender, prepare);
        self.try_commit(key, ctx);
    }

    fn accepted_pre_prepare(&self, key: ThreePhaseKey) -> Option<&PrePrepare> {
        self.pre_prepares
            .get(&key)
            .or_else(|| self.sent_pre_prepares.get(&key))
    }

    fn add_prepare_vote(&mut self, key: ThreePhaseKey, sender: NodeId, prepare: Prepare) {
        self.prepares
            .entry(key)
            .or_insert_with(|| PrepareVotes {
                votes: collections::hash_map(),
            })
            .votes
            .insert(sender, prepare);
    }

    // a PRE-PREPARE stashed for a bad timestamp is rescued when a
    // timestamp quorum of PREPAREs agrees with its time
    fn try_rescue_stashed_pre_prepare(
        &mut self,
        key: ThreePhaseKey,
        now: u64,
        ctx: &mut ReplicaContext<'_>,
    ) {
        let pp_time = match self.pre_prepares_stashed_for_incorrect_time.get(&key) {
            Some((msg, _)) => match msg.kind() {
                ConsensusMessageKind::PrePrepare(pp) => pp.pp_time,
                _ => return,
            },
            None => return,
        };
        let matching = self
            .prepares_waiting_for_pre_prepare
            .get(&key)
            .map(|waiting| {
                waiting
                    .iter()
                    .filter(|(m, _)| match m.kind() {
                        ConsensusMessageKind::Prepare(p) => p.pp_time == pp_time,
                        _ => false,
                    })
                    .count()
            })
            .unwrap_or(0);
        if matching < ctx.registry.quorums().timestamp() {
            return;
        }
        info!("rescuing PRE-PREPARE {} stashed for incorrect time", key);
        if let Some((msg, sender)) = self.pre_prepares_stashed_for_incorrect_time.remove(&key) {
            self.process_pre_prepare(msg, sender, now, false, ctx);
        }
    }

    // ------------------------------------------------------------------
    // COMMIT

    fn try_commit(&mut self, key: ThreePhaseKey, ctx: &mut ReplicaContext<'_>) {
        let already_voted = self
            .commits
            .get(&key)
            .map(|c| c.votes.contains_key(&self.node_id))
            .unwrap_or(false);
        if already_voted {
            return;
        }
        if self.accepted_pre_prepare(key).is_none() {
            return;
        }
        let votes = self.prepares.get(&key).map(|v| v.votes.len()).unwrap_or(0);
        if votes < ctx.registry.quorums().prepare() {
            return;
        }

        let commit = Commit { bls_sig: None };
        self.add_commit_vote(key, self.node_id, commit.clone());
        self.stats.commits_sent += 1;
        let msg = ConsensusMessage::new(
            self.instance_id,
            key.view_no,
            key.pp_seq_no,
            ConsensusMessageKind::Commit(commit),
        );
        ctx.effects.broadcast.push(SystemMessage::Consensus(msg));
        self.try_order(key, ctx);
    }

    fn process_commit(
        &mut self,
        msg: ConsensusMessage,
        sender: NodeId,
        _now: u64,
        ctx: &mut ReplicaContext<'_>,
    ) {
        let key = msg.three_phase_key();
        let commit = match msg.kind() {
            ConsensusMessageKind::Commit(commit) => commit.clone(),
            _ => return,
        };
        self.stats.commits_rcvd += 1;

        if let Some(votes) = self.commits.get(&key) {
            if let Some(held) = votes.votes.get(&sender) {
                if *held != commit {
                    ctx.effects
                        .suspicions
                        .push((sender, Suspicion::DuplicateCmSent));
                }
                return;
            }
        }

        if !self.has_prepared(key, ctx) {
            self.commits_waiting_for_prepare
                .entry(key)
                .or_default()
                .push((msg, sender));
            return;
        }

        self.add_commit_vote(key, sender, commit);
        self.try_order(key, ctx);
    }

    fn add_commit_vote(&mut self, key: ThreePhaseKey, sender: NodeId, commit: Commit) {
        self.commits
            .entry(key)
            .or_insert_with(|| CommitVotes {
                votes: collections::hash_map(),
            })
            .votes
            .insert(sender, commit);
    }

    fn has_prepared(&self, key: ThreePhaseKey, ctx: &ReplicaContext<'_>) -> bool {
        self.accepted_pre_prepare(key).is_some()
            && self
                .prepares
                .get(&key)
                .map(|v| v.votes.len() >= ctx.registry.quorums().prepare())
                .unwrap_or(false)
    }

    // the highest key with a local prepare certificate, recorded when
    // a view change starts so late commits can still be honored
    fn last_prepared_certificate_in_view(&self, ctx: &ReplicaContext<'_>) -> Option<ThreePhaseKey> {
        self.prepares
            .keys()
            .rev()
            .find(|key| self.has_prepared(**key, ctx))
            .copied()
    }

    // ------------------------------------------------------------------
    // ordering

    fn try_order(&mut self, key: ThreePhaseKey, ctx: &mut ReplicaContext<'_>) {
        let votes = self.commits.get(&key).map(|v| v.votes.len()).unwrap_or(0);
        if votes < ctx.registry.quorums().commit() {
            return;
        }
        if self.ordered.contains(&key) || key <= self.last_ordered {
            return;
        }
        if !self.all_prev_ordered(key) {
            debug!("stashing out of order commit {}", key);
            self.stashed_out_of_order_commits
                .entry(key.view_no)
                .or_default()
                .insert(key.pp_seq_no, key);
            return;
        }
        self.do_order(key, ctx);
        self.process_stashed_out_of_order_commits(ctx);
    }

    fn all_prev_ordered(&self, key: ThreePhaseKey) -> bool {
        if self.last_ordered == key.prev_in_view() {
            return true;
        }
        if key.prev_in_view().pp_seq_no <= self.h {
            // the predecessor is covered by a stable checkpoint or
            // by catch-up
            return true;
        }
        self.ordered.contains(&key.prev_in_view())
    }

    fn do_order(&mut self, key: ThreePhaseKey, ctx: &mut ReplicaContext<'_>) {
        let pp = match self.accepted_pre_prepare(key) {
            Some(pp) => pp.clone(),
            None => {
                // ordering without a PRE-PREPARE is a local logic
                // error; abort rather than diverge
                panic!("ordering {} without an accepted PRE-PREPARE", key);
            }
        };

        info!(
            "replica {:?}:{:?} ordered batch {} ({} requests, {} valid)",
            self.node_id,
            self.instance_id,
            key,
            pp.req_digests.len(),
            pp.discarded,
        );

        self.ordered.insert(key);
        if key > self.last_ordered {
            self.last_ordered = key;
        }
        self.stats.batches_ordered += 1;

        // ordered requests leave the batching queues
        if let Some(queue) = self.req_queues.get_mut(&pp.ledger_id) {
            for digest in &pp.req_digests {
                queue.remove(digest);
            }
        }

        ctx.effects.ordered.push(OrderedBatch {
            instance_id: self.instance_id,
            key,
            pp_time: pp.pp_time,
            req_digests: pp.valid_digests().to_vec(),
            ledger_id: pp.ledger_id,
            state_root: pp.state_root,
            txn_root: pp.txn_root,
        });

        self.add_to_checkpoint(key, pp.digest, ctx);
    }

    /// Rescans commits which were stashed because a predecessor had
    /// not been ordered yet, ordering every batch whose gap closed.
    pub fn process_stashed_out_of_order_commits(&mut self, ctx: &mut ReplicaContext<'_>) {
        loop {
            let mut candidate = None;
            'search: for (view, seqs) in &self.stashed_out_of_order_commits {
                if *view < self.last_ordered.view_no {
                    continue;
                }
                for key in seqs.values() {
                    if self.ordered.contains(key) || *key <= self.last_ordered {
                        continue;
                    }
                    if self.all_prev_ordered(*key) {
                        candidate = Some(*key);
                        break 'search;
                    }
                }
            }
            match candidate {
                Some(key) => {
                    if let Some(seqs) = self.stashed_out_of_order_commits.get_mut(&key.view_no) {
                        seqs.remove(&key.pp_seq_no);
                    }
                    self.do_order(key, ctx);
                }
                None => break,
            }
        }
        // drop stale views and keys which got ordered along the way
        let last_ordered = self.last_ordered;
        let ordered = &self.ordered;
        self.stashed_out_of_order_commits.retain(|view, seqs| {
            if *view < last_ordered.view_no {
                return false;
            }
            seqs.retain(|_, key| !ordered.contains(key) && *key > last_ordered);
            !seqs.is_empty()
        });
    }

    // ------------------------------------------------------------------
    // checkpoints and garbage collection

    fn add_to_checkpoint(
        &mut self,
        key: ThreePhaseKey,
        digest: Digest,
        ctx: &mut ReplicaContext<'_>,
    ) {
        let interval = self.config.checkpoint_interval(key.pp_seq_no.into());
        let state = self
            .checkpoints
            .entry(interval)
            .or_insert_with(|| CheckpointState {
                seq: SeqNo::ZERO,
                digests: Vec::new(),
                digest: None,
                received: collections::hash_map(),
                stable: false,
            });
        state.digests.push(digest);
        state.seq = key.pp_seq_no;

        if u64::from(state.seq) == interval.1 && state.digests.len() as u64 == self.config.chk_freq
        {
            let mut hash = Context::new();
            for digest in &state.digests {
                hash.update(digest.as_ref());
            }
            let cp_digest = hash.finish();
            state.digest = Some(cp_digest);
            state.digests.clear();
            self.stats.checkpoints_sent += 1;
            info!(
                "replica {:?}:{:?} sending CHECKPOINT ({}, {})",
                self.node_id, self.instance_id, interval.0, interval.1,
            );
            ctx.effects
                .broadcast
                .push(SystemMessage::Checkpoint(CheckpointMessage {
                    instance_id: self.instance_id,
                    view_no: key.view_no,
                    seq_no_start: SeqNo::from(interval.0),
                    seq_no_end: SeqNo::from(interval.1),
                    digest: cp_digest,
                }));
            self.adopt_stashed_checkpoints(key.view_no, interval, ctx);
        }
    }

    /// Processes a CHECKPOINT attestation from a peer.
    pub fn process_checkpoint(
        &mut self,
        msg: CheckpointMessage,
        sender: NodeId,
        ctx: &mut ReplicaContext<'_>,
    ) {
        if msg.seq_no_end <= self.h {
            trace!("checkpoint ending at {} already stable", msg.seq_no_end);
            return;
        }
        let interval = (u64::from(msg.seq_no_start), u64::from(msg.seq_no_end));
        if self
            .checkpoints
            .get(&interval)
            .map(|state| state.stable)
            .unwrap_or(false)
        {
            return;
        }

        let complete = self
            .checkpoints
            .get(&interval)
            .map(|state| state.digest.is_some())
            .unwrap_or(false);
        if !complete {
            debug!(
                "stashing checkpoint ({}, {}) from {:?}",
                interval.0, interval.1, sender,
            );
            self.stashed_checkpoints
                .entry(msg.view_no)
                .or_default()
                .entry(interval)
                .or_insert_with(collections::hash_map)
                .insert(sender, msg.digest);
            self.start_catchup_if_needed(ctx);
            return;
        }

        let state = self.checkpoints.get_mut(&interval).expect("just checked");
        if self.instance_id.is_master() && state.digest != Some(msg.digest) {
            warn!(
                "received an incorrect digest for checkpoint ({}, {}) from {:?}",
                interval.0, interval.1, sender,
            );
            return;
        }
        state.received.insert(sender, msg.digest);
        self.check_if_checkpoint_stable(interval, ctx);
    }

    // counts a completed local checkpoint towards stashed peer votes
    // received before it completed
    fn adopt_stashed_checkpoints(
        &mut self,
        view_no: ViewNo,
        interval: (u64, u64),
        ctx: &mut ReplicaContext<'_>,
    ) {
        let stashed = self
            .stashed_checkpoints
            .get_mut(&view_no)
            .and_then(|per_view| per_view.remove(&interval));
        if let Some(votes) = stashed {
            let our_digest = self
                .checkpoints
                .get(&interval)
                .and_then(|state| state.digest);
            let is_master = self.instance_id.is_master();
            if let Some(state) = self.checkpoints.get_mut(&interval) {
                for (sender, digest) in votes {
                    if !is_master || Some(digest) == our_digest {
                        state.received.insert(sender, digest);
                    }
                }
            }
            self.check_if_checkpoint_stable(interval, ctx);
        }
    }

    fn check_if_checkpoint_stable(&mut self, interval: (u64, u64), ctx: &mut ReplicaContext<'_>) {
        let stable = {
            let state = match self.checkpoints.get(&interval) {
                Some(state) => state,
                None => return,
            };
            state.received.len() >= ctx.registry.quorums().checkpoint()
        };
        if stable {
            self.mark_checkpoint_stable(SeqNo::from(interval.1), ctx);
        }
    }

    fn mark_checkpoint_stable(&mut self, seq_no: SeqNo, ctx: &mut ReplicaContext<'_>) {
        info!(
            "replica {:?}:{:?} marked checkpoint {} stable",
            self.node_id, self.instance_id, seq_no,
        );
        self.h = seq_no;
        let end = u64::from(seq_no);
        self.checkpoints.retain(|(_, e), state| {
            if *e == end {
                state.stable = true;
            }
            *e >= end
        });
        for per_view in self.stashed_checkpoints.values_mut() {
            per_view.retain(|(_, e), _| *e > end);
        }
        self.stashed_checkpoints
            .retain(|_, per_view| !per_view.is_empty());
        let till = ThreePhaseKey::new(self.view_no, seq_no);
        self.gc(till, ctx);
        self.process_stashed_msgs_for_new_watermarks(ctx);
    }

    fn gc(&mut self, till: ThreePhaseKey, ctx: &mut ReplicaContext<'_>) {
        let mut freed: Vec<Digest> = Vec::new();
        for (_, pp) in self.sent_pre_prepares.range(..=till) {
            freed.extend(pp.req_digests.iter().copied());
        }
        for (_, pp) in self.pre_prepares.range(..=till) {
            freed.extend(pp.req_digests.iter().copied());
        }

        self.sent_pre_prepares.retain(|key, _| *key > till);
        self.pre_prepares.retain(|key, _| *key > till);
        self.prepares.retain(|key, _| *key > till);
        self.commits.retain(|key, _| *key > till);
        self.batches.retain(|key, _| *key > till);
        self.pre_prepares_stashed_for_incorrect_time
            .retain(|key, _| *key > till);
        self.pre_prepares_pending_prev_pp.retain(|key, _| *key > till);
        self.requested_msgs.retain(|(_, key)| *key > till);
        self.ordered.retain(|key| *key > till);

        debug!(
            "replica {:?}:{:?} cleaned up till {}; freeing {} request keys",
            self.node_id,
            self.instance_id,
            till,
            freed.len(),
        );
        ctx.effects.freed_requests.extend(freed);
    }

    fn process_stashed_msgs_for_new_watermarks(&mut self, ctx: &mut ReplicaContext<'_>) {
        // consume each stashed item at most once; re-stashed messages
        // wait for the next stable checkpoint
        let to_consume = self.stashed_outside_watermarks.len();
        for _ in 0..to_consume {
            match self.stashed_outside_watermarks.pop_front() {
                Some((msg, sender)) => {
                    // the wall clock check already ran on first
                    // reception
                    let now = self.last_accepted_pp_time;
                    let is_pp = matches!(msg.kind(), ConsensusMessageKind::PrePrepare(_));
                    if is_pp {
                        self.process_pre_prepare(msg, sender, now, false, ctx);
                    } else {
                        self.process_consensus(msg, sender, now, ctx);
                    }
                }
                None => break,
            }
        }
    }

    // intervals ahead of our own progress with a stability quorum
    fn stashed_checkpoints_with_quorum(&self, ctx: &ReplicaContext<'_>) -> Vec<u64> {
        let quorum = ctx.registry.quorums().checkpoint();
        let mut ends: Vec<u64> = self
            .stashed_checkpoints
            .values()
            .flat_map(|per_view| {
                per_view
                    .iter()
                    .filter(|(_, votes)| votes.len() >= quorum)
                    .map(|((_, end), _)| *end)
            })
            .collect();
        ends.sort_unstable();
        ends.dedup();
        ends
    }

    fn start_catchup_if_needed(&mut self, ctx: &mut ReplicaContext<'_>) {
        let stashed_ends = self.stashed_checkpoints_with_quorum(ctx);
        if stashed_ends.len() <= self.config.stashed_checkpoints_before_catchup {
            return;
        }
        let highest = match stashed_ends.last() {
            Some(end) => *end,
            None => return,
        };
        info!(
            "replica {:?}:{:?} lagged {} checkpoints, advancing watermarks to {}",
            self.node_id,
            self.instance_id,
            stashed_ends.len(),
            highest,
        );
        self.h = SeqNo::from(highest);
        self.process_stashed_msgs_for_new_watermarks(ctx);
        if self.is_master() && !self.is_primary() {
            ctx.effects.needs_catchup = true;
        }
    }

    // ------------------------------------------------------------------
    // point-to-point recovery

    /// Serves a MESSAGE_REQ from a peer, replying with the requested
    /// three-phase message if this replica holds it.
    pub fn process_message_req(
        &mut self,
        req: MessageReq,
        sender: NodeId,
        ctx: &mut ReplicaContext<'_>,
    ) {
        let key = ThreePhaseKey::new(req.view_no, req.pp_seq_no);
        let kind = match req.kind {
            ThreePcMsgKind::PrePrepare => self
                .accepted_pre_prepare(key)
                .cloned()
                .map(ConsensusMessageKind::PrePrepare),
            ThreePcMsgKind::Prepare => self
                .prepares
                .get(&key)
                .and_then(|votes| votes.votes.get(&self.node_id))
                .cloned()
                .map(ConsensusMessageKind::Prepare),
            ThreePcMsgKind::Commit => self
                .commits
                .get(&key)
                .and_then(|votes| votes.votes.get(&self.node_id))
                .cloned()
                .map(ConsensusMessageKind::Commit),
        };
        match kind {
            Some(kind) => {
                let msg = ConsensusMessage::new(self.instance_id, req.view_no, req.pp_seq_no, kind);
                ctx.effects
                    .directed
                    .push((sender, SystemMessage::MessageRep(Box::new(msg))));
            }
            None => {
                trace!("no {:?} held for {}", req.kind, key);
            }
        }
    }

    /// Processes a MESSAGE_REP, accepting it only if the message was
    /// actually requested from the sender.
    pub fn process_message_rep(
        &mut self,
        msg: ConsensusMessage,
        sender: NodeId,
        now: u64,
        ctx: &mut ReplicaContext<'_>,
    ) {
        let key = msg.three_phase_key();
        let kind = match msg.kind() {
            ConsensusMessageKind::PrePrepare(_) => ThreePcMsgKind::PrePrepare,
            ConsensusMessageKind::Prepare(_) => ThreePcMsgKind::Prepare,
            ConsensusMessageKind::Commit(_) => ThreePcMsgKind::Commit,
        };
        if !self.requested_msgs.remove(&(kind, key)) {
            debug!("unsolicited MESSAGE_REP for {} from {:?}", key, sender);
            return;
        }
        self.process_consensus(msg, sender, now, ctx);
    }

    // ------------------------------------------------------------------
    // view change integration

    /// Called when a view change begins: freezes batching, records
    /// the last locally prepared certificate so commits covered by
    /// it may still be ordered while the view changes, and unwinds
    /// every batch applied ahead but not ordered.
    pub fn on_view_change_start(&mut self, ctx: &mut ReplicaContext<'_>) {
        self.view_change_in_progress = true;
        self.last_prepared_before_view_change = self.last_prepared_certificate_in_view(ctx);
        if self.is_master() {
            self.revert_unordered_batches(ctx);
        }
        debug!(
            "replica {:?}:{:?} entering view change; last prepared {:?}",
            self.node_id, self.instance_id, self.last_prepared_before_view_change,
        );
    }

    // unwinds the uncommitted applies of batches which will never be
    // ordered in the old view, newest first, so the state lands on
    // the oldest batch's pre-apply root
    fn revert_unordered_batches(&mut self, ctx: &mut ReplicaContext<'_>) {
        let keys: Vec<ThreePhaseKey> = self
            .batches
            .keys()
            .rev()
            .filter(|key| **key > self.last_ordered && !self.ordered.contains(*key))
            .copied()
            .collect();
        for key in keys {
            if let Some(info) = self.batches.remove(&key) {
                info!(
                    "replica {:?}:{:?} reverting unordered batch {}",
                    self.node_id, self.instance_id, key,
                );
                if let Some(handler) = ctx.handlers.handler_mut(info.ledger_id) {
                    handler.ledger_mut().discard_txns(info.valid);
                    if let Err(e) = handler.state_mut().revert_to_head(&info.prev_state_root) {
                        warn!("state revert before view change: {}", e);
                    }
                }
            }
        }
    }

    /// Called when the view change completed and a new primary
    /// assignment is in place.
    pub fn on_view_change_done(
        &mut self,
        view_no: ViewNo,
        primary: Option<NodeId>,
        ctx: &mut ReplicaContext<'_>,
    ) {
        // old-view state is garbage collected wholesale; everything
        // still relevant was covered by catch-up
        let till = self.last_ordered;
        self.gc(till, ctx);
        self.checkpoints.clear();
        self.stashed_checkpoints.clear();
        self.pre_prepares_pending_fin_reqs.clear();
        self.pre_prepares_pending_prev_pp.clear();
        self.prepares_waiting_for_pre_prepare.clear();
        self.commits_waiting_for_prepare.clear();
        self.pre_prepares_stashed_for_incorrect_time.clear();
        self.stashed_outside_watermarks.clear();

        self.view_no = view_no;
        self.primary = primary;
        self.view_change_in_progress = false;
        self.last_prepared_before_view_change = None;
        self.h = SeqNo::ZERO;
        self.last_pp_seq_no = SeqNo::ZERO;
        self.last_ordered = ThreePhaseKey::new(view_no, SeqNo::ZERO);
        info!(
            "replica {:?}:{:?} completed view change to view {}, primary {:?}",
            self.node_id, self.instance_id, view_no, primary,
        );
    }

    /// Called when a catch-up round completed, with the last
    /// three-phase key observed by the pool.
    pub fn on_catchup_complete(&mut self, last_caught_up: Option<ThreePhaseKey>) {
        let key = match last_caught_up {
            Some(key) => key,
            None => return,
        };
        if key <= self.last_ordered {
            return;
        }
        info!(
            "replica {:?}:{:?} caught up till {}",
            self.node_id, self.instance_id, key,
        );
        self.last_ordered = key;
        self.ordered.insert(key);
        self.h = key.pp_seq_no;
        self.sent_pre_prepares.retain(|k, _| *k > key);
        self.pre_prepares.retain(|k, _| *k > key);
        self.prepares.retain(|k, _| *k > key);
        self.commits.retain(|k, _| *k > key);
        self.batches.retain(|k, _| *k > key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bft::executable::KvRequestHandler;
    use crate::bft::message::{Request, RequestKey};
    use crate::bft::registry::NodeRegistry;

    const TXN_TYPE: u16 = 7;
    const NOW: u64 = 1_000_000;

    const N1: NodeId = NodeId::new(0);
    const N2: NodeId = NodeId::new(1);
    const N3: NodeId = NodeId::new(2);
    const N4: NodeId = NodeId::new(3);

    fn registry() -> NodeRegistry {
        NodeRegistry::new(
            ["N1", "N2", "N3", "N4"]
                .iter()
                .enumerate()
                .map(|(i, n)| (n.to_string(), NodeId::from(i as u32))),
        )
        .unwrap()
    }

    fn config() -> PoolConfig {
        PoolConfig {
            max_batch_size: 3,
            max_batch_wait: 0,
            chk_freq: 3,
            log_size: 9,
            acceptable_deviation: 1_000,
            ..Default::default()
        }
    }

    fn kv_request(req_id: u64) -> Request {
        let mut payload = format!("key-{}", req_id).into_bytes();
        payload.push(0);
        payload.extend_from_slice(b"value");
        Request::new(RequestKey::new("client-a", req_id), TXN_TYPE, payload)
    }

    struct Bench {
        registry: NodeRegistry,
        requests: RequestStore,
        handlers: HandlerRegistry,
    }

    impl Bench {
        fn new(requests: &[Request]) -> Self {
            let mut store = RequestStore::new();
            for request in requests {
                store.add_propagate(request.clone(), N1, 2);
                store.add_propagate(request.clone(), N2, 2);
            }
            let mut handlers = HandlerRegistry::new();
            handlers
                .register(Box::new(KvRequestHandler::new(LedgerId::DOMAIN, TXN_TYPE)))
                .unwrap();
            Self {
                registry: registry(),
                requests: store,
                handlers,
            }
        }

        fn ctx(&mut self) -> ReplicaContext<'_> {
            ReplicaContext::new(&self.registry, &self.requests, &mut self.handlers, true)
        }
    }

    // N1 is the master primary of view 0
    fn primary_replica() -> Replica {
        let mut replica = Replica::new(N1, InstanceId::MASTER, config());
        replica.register_ledger(LedgerId::DOMAIN);
        replica.set_primary(Some(N1));
        replica
    }

    fn backup_replica(node: NodeId) -> Replica {
        let mut replica = Replica::new(node, InstanceId::MASTER, config());
        replica.register_ledger(LedgerId::DOMAIN);
        replica.set_primary(Some(N1));
        replica
    }

    fn extract_consensus(
        effects: &ReplicaEffects,
        want: fn(&ConsensusMessageKind) -> bool,
    ) -> Option<ConsensusMessage> {
        effects.broadcast.iter().find_map(|msg| match msg {
            SystemMessage::Consensus(c) if want(c.kind()) => Some(c.clone()),
            _ => None,
        })
    }

    fn is_pre_prepare(kind: &ConsensusMessageKind) -> bool {
        matches!(kind, ConsensusMessageKind::PrePrepare(_))
    }

    fn is_prepare(kind: &ConsensusMessageKind) -> bool {
        matches!(kind, ConsensusMessageKind::Prepare(_))
    }

    fn is_commit(kind: &ConsensusMessageKind) -> bool {
        matches!(kind, ConsensusMessageKind::Commit(_))
    }

    // drives a primary over a set of requests and returns the
    // PRE-PREPAREs it broadcast
    fn propose(
        primary: &mut Replica,
        bench: &mut Bench,
        requests: &[Request],
        now: u64,
    ) -> Vec<ConsensusMessage> {
        let mut ctx = bench.ctx();
        for request in requests {
            primary.enqueue_finalized_request(request.digest(), LedgerId::DOMAIN, now, &mut ctx);
        }
        primary.tick(now, &mut ctx);
        ctx.effects
            .broadcast
            .iter()
            .filter_map(|msg| match msg {
                SystemMessage::Consensus(c) if is_pre_prepare(c.kind()) => Some(c.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn happy_path_batch_is_ordered() {
        let requests = [kv_request(1)];
        let mut primary_bench = Bench::new(&requests);
        let mut backup_bench = Bench::new(&requests);

        let mut primary = primary_replica();
        let mut backup = backup_replica(N3);

        let pps = propose(&mut primary, &mut primary_bench, &requests, NOW);
        assert_eq!(pps.len(), 1);
        let pp_msg = pps[0].clone();
        assert_eq!(pp_msg.three_phase_key(), ThreePhaseKey::new(0u64, 1u64));

        // backup accepts the proposal and votes PREPARE
        let prepare = {
            let mut ctx = backup_bench.ctx();
            backup.process_consensus(pp_msg.clone(), N1, NOW, &mut ctx);
            assert!(ctx.effects.suspicions.is_empty());
            extract_consensus(&ctx.effects, is_prepare).expect("backup votes PREPARE")
        };

        // N4's matching PREPARE closes the prepare quorum (2f = 2,
        // own vote included), triggering our COMMIT
        let commit = {
            let mut ctx = backup_bench.ctx();
            backup.process_consensus(prepare.clone(), N4, NOW, &mut ctx);
            extract_consensus(&ctx.effects, is_commit).expect("prepare quorum reached")
        };

        // two more COMMITs close the commit quorum (2f + 1 = 3)
        let mut ctx = backup_bench.ctx();
        backup.process_consensus(commit.clone(), N1, NOW, &mut ctx);
        backup.process_consensus(commit.clone(), N4, NOW, &mut ctx);

        assert_eq!(ctx.effects.ordered.len(), 1);
        let ordered = &ctx.effects.ordered[0];
        assert_eq!(ordered.key, ThreePhaseKey::new(0u64, 1u64));
        assert_eq!(ordered.req_digests, vec![requests[0].digest()]);
        assert_eq!(ordered.ledger_id, LedgerId::DOMAIN);
        assert_eq!(backup.last_ordered_3pc(), ThreePhaseKey::new(0u64, 1u64));
    }

    #[test]
    fn pre_prepare_from_non_primary_is_suspicious() {
        let requests = [kv_request(1)];
        let mut primary_bench = Bench::new(&requests);
        let mut backup_bench = Bench::new(&requests);

        let mut primary = primary_replica();
        let mut backup = backup_replica(N3);

        let pps = propose(&mut primary, &mut primary_bench, &requests, NOW);
        let mut ctx = backup_bench.ctx();
        backup.process_consensus(pps[0].clone(), N4, NOW, &mut ctx);
        assert_eq!(
            ctx.effects.suspicions,
            vec![(N4, Suspicion::PprFromNonPrimary)],
        );
    }

    #[test]
    fn duplicate_pre_prepare_with_different_digest_is_suspicious() {
        let requests = [kv_request(1), kv_request(2)];
        let mut backup_bench = Bench::new(&requests);
        let mut bench_a = Bench::new(&requests[..1]);
        let mut bench_b = Bench::new(&requests[1..]);

        let mut backup = backup_replica(N3);

        // two different proposals under the same key (0, 1)
        let pp_a = propose(&mut primary_replica(), &mut bench_a, &requests[..1], NOW)[0].clone();
        let pp_b = propose(&mut primary_replica(), &mut bench_b, &requests[1..], NOW)[0].clone();
        assert_eq!(pp_a.three_phase_key(), pp_b.three_phase_key());

        let mut ctx = backup_bench.ctx();
        backup.process_consensus(pp_a.clone(), N1, NOW, &mut ctx);
        assert!(ctx.effects.suspicions.is_empty());

        let mut ctx = backup_bench.ctx();
        backup.process_consensus(pp_b, N1, NOW, &mut ctx);
        assert_eq!(
            ctx.effects.suspicions,
            vec![(N1, Suspicion::DuplicatePprSent)],
        );

        // redelivering the accepted one is not suspicious
        let mut ctx = backup_bench.ctx();
        backup.process_consensus(pp_a, N1, NOW, &mut ctx);
        assert!(ctx.effects.suspicions.is_empty());
    }

    #[test]
    fn gap_stashes_and_requests_missing_pre_prepares() {
        let requests: Vec<Request> = (1..=3).map(kv_request).collect();
        let mut primary_bench = Bench::new(&requests);
        let mut backup_bench = Bench::new(&requests);

        let mut primary = primary_replica();
        let mut backup = backup_replica(N3);

        // one batch per request
        let mut pps = Vec::new();
        for (i, request) in requests.iter().enumerate() {
            let batch = propose(
                &mut primary,
                &mut primary_bench,
                std::slice::from_ref(request),
                NOW + i as u64,
            );
            pps.extend(batch);
        }
        assert_eq!(pps.len(), 3);

        // deliver (0,1), skip (0,2), deliver (0,3)
        let mut ctx = backup_bench.ctx();
        backup.process_consensus(pps[0].clone(), N1, NOW, &mut ctx);
        backup.process_consensus(pps[2].clone(), N1, NOW, &mut ctx);

        // the gap triggered a MESSAGE_REQ for (0,2) to the primary
        let requested: Vec<_> = ctx
            .effects
            .directed
            .iter()
            .filter_map(|(to, msg)| match msg {
                SystemMessage::MessageReq(req) => Some((*to, req.clone())),
                _ => None,
            })
            .collect();
        assert_eq!(requested.len(), 1);
        assert_eq!(requested[0].0, N1);
        assert_eq!(requested[0].1.kind, ThreePcMsgKind::PrePrepare);
        assert_eq!(requested[0].1.pp_seq_no, SeqNo::from(2));

        // primary serves the request; the reply unblocks (0,2) and
        // the stashed (0,3)
        let rep = {
            let mut primary_ctx = primary_bench.ctx();
            primary.process_message_req(requested[0].1.clone(), N3, &mut primary_ctx);
            primary_ctx
                .effects
                .directed
                .iter()
                .find_map(|(_, msg)| match msg {
                    SystemMessage::MessageRep(inner) => Some((**inner).clone()),
                    _ => None,
                })
                .expect("primary holds the requested PRE-PREPARE")
        };
        backup.process_message_rep(rep, N1, NOW, &mut ctx);

        // all three accepted, in order
        assert!(backup.accepted_pre_prepare(ThreePhaseKey::new(0u64, 1u64)).is_some());
        assert!(backup.accepted_pre_prepare(ThreePhaseKey::new(0u64, 2u64)).is_some());
        assert!(backup.accepted_pre_prepare(ThreePhaseKey::new(0u64, 3u64)).is_some());
    }

    #[test]
    fn bad_timestamp_is_stashed_and_rescued_by_prepares() {
        let requests = [kv_request(1)];
        let mut primary_bench = Bench::new(&requests);
        let mut backup_bench = Bench::new(&requests);

        let mut primary = primary_replica();
        let mut backup = backup_replica(N3);

        // the primary's clock runs far ahead
        let skewed = NOW + 10 * config().acceptable_deviation;
        let pps = propose(&mut primary, &mut primary_bench, &requests, skewed);
        let pp_msg = pps[0].clone();
        let pp_time = match pp_msg.kind() {
            ConsensusMessageKind::PrePrepare(pp) => pp.pp_time,
            _ => unreachable!(),
        };

        let mut ctx = backup_bench.ctx();
        backup.process_consensus(pp_msg, N1, NOW, &mut ctx);
        assert_eq!(ctx.effects.suspicions, vec![(N1, Suspicion::PprTimeWrong)]);
        assert!(extract_consensus(&ctx.effects, is_prepare).is_none());

        // f + 1 = 2 PREPAREs carrying the same ppTime rescue it;
        // their roots echo what the primary computed for the batch
        let primary_handler = primary_bench.handlers.handler(LedgerId::DOMAIN).unwrap();
        let prepare = ConsensusMessage::new(
            InstanceId::MASTER,
            ViewNo::ZERO,
            SeqNo::ONE,
            ConsensusMessageKind::Prepare(Prepare {
                pp_time,
                digest: PrePrepare::batch_digest(&[requests[0].digest()]),
                state_root: primary_handler.state().head_root(false),
                txn_root: primary_handler.ledger().uncommitted_root_hash(),
                bls_share: None,
            }),
        );
        let mut ctx = backup_bench.ctx();
        backup.process_consensus(prepare.clone(), N2, NOW, &mut ctx);
        backup.process_consensus(prepare, N4, NOW, &mut ctx);

        assert!(backup
            .accepted_pre_prepare(ThreePhaseKey::new(0u64, 1u64))
            .is_some());
    }

    #[test]
    fn checkpoint_stability_advances_watermarks_and_collects_garbage() {
        let requests: Vec<Request> = (1..=3).map(kv_request).collect();
        let mut primary_bench = Bench::new(&requests);
        let mut backup_bench = Bench::new(&requests);

        let mut primary = primary_replica();
        let mut backup = backup_replica(N3);

        assert_eq!(backup.h(), SeqNo::ZERO);

        // order ppSeqNo 1..=3 on the backup
        let mut checkpoint = None;
        for (i, request) in requests.iter().enumerate() {
            let pp = propose(
                &mut primary,
                &mut primary_bench,
                std::slice::from_ref(request),
                NOW + i as u64,
            )[0]
            .clone();
            let mut ctx = backup_bench.ctx();
            backup.process_consensus(pp, N1, NOW, &mut ctx);
            let prepare = extract_consensus(&ctx.effects, is_prepare).unwrap();

            let mut ctx = backup_bench.ctx();
            backup.process_consensus(prepare, N4, NOW, &mut ctx);
            let commit = extract_consensus(&ctx.effects, is_commit).unwrap();

            let mut ctx = backup_bench.ctx();
            backup.process_consensus(commit.clone(), N1, NOW, &mut ctx);
            backup.process_consensus(commit, N4, NOW, &mut ctx);
            assert_eq!(ctx.effects.ordered.len(), 1);
            if let Some(msg) = ctx.effects.broadcast.iter().find_map(|m| match m {
                SystemMessage::Checkpoint(cp) => Some(cp.clone()),
                _ => None,
            }) {
                checkpoint = Some(msg);
            }
        }

        // after chk_freq = 3 orderings the replica checkpointed
        let checkpoint = checkpoint.expect("CHECKPOINT emitted after three batches");
        assert_eq!(checkpoint.seq_no_start, SeqNo::ONE);
        assert_eq!(checkpoint.seq_no_end, SeqNo::from(3));

        // a stability quorum (2f + 1 = 3, own attestation included
        // via two peers) stabilizes it
        let mut ctx = backup_bench.ctx();
        backup.process_checkpoint(checkpoint.clone(), N1, &mut ctx);
        backup.process_checkpoint(checkpoint.clone(), N2, &mut ctx);
        backup.process_checkpoint(checkpoint, N4, &mut ctx);

        assert_eq!(backup.h(), SeqNo::from(3));
        assert_eq!(backup.high_watermark(), SeqNo::from(3 + 9));
        // all three-phase state at or below the checkpoint is gone
        assert!(backup.pre_prepares.is_empty());
        assert!(backup.prepares.is_empty());
        assert!(backup.commits.is_empty());
        // ordered request keys were freed
        assert_eq!(ctx.effects.freed_requests.len(), 3);
    }

    #[test]
    fn out_of_order_commits_are_stashed_until_the_gap_closes() {
        let requests: Vec<Request> = (1..=2).map(kv_request).collect();
        let mut primary_bench = Bench::new(&requests);
        let mut backup_bench = Bench::new(&requests);

        let mut primary = primary_replica();
        let mut backup = backup_replica(N3);

        let pp1 = propose(&mut primary, &mut primary_bench, &requests[..1], NOW)[0].clone();
        let pp2 = propose(&mut primary, &mut primary_bench, &requests[1..], NOW + 1)[0].clone();

        // accept both proposals and prepare both
        let mut commits = Vec::new();
        for pp in [pp1, pp2] {
            let mut ctx = backup_bench.ctx();
            backup.process_consensus(pp, N1, NOW, &mut ctx);
            let prepare = extract_consensus(&ctx.effects, is_prepare).unwrap();
            let mut ctx = backup_bench.ctx();
            backup.process_consensus(prepare, N4, NOW, &mut ctx);
            commits.push(extract_consensus(&ctx.effects, is_commit).unwrap());
        }

        // commit quorum closes over (0,2) first; it must wait
        let mut ctx = backup_bench.ctx();
        backup.process_consensus(commits[1].clone(), N1, NOW, &mut ctx);
        backup.process_consensus(commits[1].clone(), N4, NOW, &mut ctx);
        assert!(ctx.effects.ordered.is_empty());

        // once (0,1) closes, both order, in order
        let mut ctx = backup_bench.ctx();
        backup.process_consensus(commits[0].clone(), N1, NOW, &mut ctx);
        backup.process_consensus(commits[0].clone(), N4, NOW, &mut ctx);
        let keys: Vec<_> = ctx.effects.ordered.iter().map(|o| o.key).collect();
        assert_eq!(
            keys,
            vec![ThreePhaseKey::new(0u64, 1u64), ThreePhaseKey::new(0u64, 2u64)],
        );
    }

    #[test]
    fn messages_beyond_the_high_watermark_are_stashed() {
        let requests = [kv_request(1)];
        let mut bench = Bench::new(&requests);
        let mut backup = backup_replica(N3);

        let commit_at = |seq: u64| {
            ConsensusMessage::new(
                InstanceId::MASTER,
                ViewNo::ZERO,
                SeqNo::from(seq),
                ConsensusMessageKind::Commit(Commit { bls_sig: None }),
            )
        };

        // H = h + log_size = 9; seq 11 waits for the watermark to
        // move
        let mut ctx = bench.ctx();
        backup.process_consensus(commit_at(11), N1, NOW, &mut ctx);
        assert_eq!(backup.stashed_outside_watermarks.len(), 1);
        assert!(backup.commits.is_empty());

        // a far future sequence number is dropped, not stashed
        backup.process_consensus(commit_at(500), N1, NOW, &mut ctx);
        assert_eq!(backup.stashed_outside_watermarks.len(), 1);
    }

    #[test]
    fn view_change_resets_the_ordering_window() {
        let requests = [kv_request(1)];
        let mut bench = Bench::new(&requests);
        let mut backup = backup_replica(N3);

        {
            let mut ctx = bench.ctx();
            backup.on_view_change_start(&mut ctx);
        }
        assert!(backup.view_change_in_progress());

        let mut ctx = bench.ctx();
        backup.on_view_change_done(ViewNo::from(1), Some(N2), &mut ctx);
        assert!(!backup.view_change_in_progress());
        assert_eq!(backup.view_no(), ViewNo::from(1));
        assert_eq!(backup.primary(), Some(N2));
        assert_eq!(backup.h(), SeqNo::ZERO);
        assert_eq!(
            backup.last_ordered_3pc(),
            ThreePhaseKey::new(1u64, 0u64),
        );
    }
}
