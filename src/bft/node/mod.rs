//! The validator node orchestrator.
//!
//! A `Node` hosts the replicas, the view changer, the ledger
//! manager, and the monitor, routes every inbound message to the
//! right component, drives the request pipeline from ingress through
//! propagation into the replicas, and executes ordered batches
//! against the request handlers. It runs entirely inside the
//! caller's loop: the transport delivers messages with `deliver()`,
//! pumps the node with `prod()`, and ships whatever accumulated in
//! the outboxes with `drain_outbox()`.

use std::collections::{BTreeMap, VecDeque};

use intmap::IntMap;
use log::{debug, info, warn};

use crate::bft::catchup::{CatchupContext, CatchupEffects, LedgerManager};
use crate::bft::collections::{self, HashMap, HashSet};
use crate::bft::config::PoolConfig;
use crate::bft::crypto::hash::Digest;
use crate::bft::error::*;
use crate::bft::executable::HandlerRegistry;
use crate::bft::ledger::LedgerId;
use crate::bft::message::{Reply, Request, SystemMessage};
use crate::bft::monitor::Monitor;
use crate::bft::ordering::{SeqNo, ThreePhaseKey, ViewNo};
use crate::bft::registry::{InstanceId, NodeId, NodeRegistry, PoolTxn};
use crate::bft::replica::{OrderedBatch, Replica, ReplicaContext, ReplicaEffects};
use crate::bft::requests::RequestStore;
use crate::bft::suspicion::Suspicion;
use crate::bft::sync::{SyncContext, SyncEffects, ViewChanger};
use crate::bft::timeouts::{TimeoutKind, Timeouts};

/// The lifecycle stage of a node.
///
/// Only a `Participating` node commits ordered batches to its
/// application ledgers.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub enum Mode {
    Starting,
    /// Syncing the pool ledger, which defines the validator set.
    Discovering,
    /// Syncing the remaining ledgers.
    Syncing,
    Synced,
    Participating,
}

/// Messages a node wants shipped, drained by the transport.
#[derive(Default)]
pub struct Outbox {
    pub broadcast: VecDeque<SystemMessage>,
    pub directed: VecDeque<(NodeId, SystemMessage)>,
    /// Replies and acknowledgements, keyed by client identifier.
    pub clients: VecDeque<(String, SystemMessage)>,
}

/// A validator node of the ordering pool.
pub struct Node {
    name: String,
    id: NodeId,
    config: PoolConfig,
    mode: Mode,

    registry: NodeRegistry,
    requests: RequestStore,
    handlers: HandlerRegistry,
    replicas: Vec<Replica>,
    view_changer: ViewChanger,
    ledger_manager: LedgerManager,
    monitor: Monitor,
    timeouts: Timeouts,

    inbox: VecDeque<(NodeId, SystemMessage)>,
    outbox: Outbox,

    msgs_for_future_views: BTreeMap<ViewNo, Vec<(NodeId, SystemMessage)>>,
    msgs_for_future_replicas: BTreeMap<InstanceId, Vec<(NodeId, SystemMessage)>>,
    stashed_ordered_reqs: VecDeque<OrderedBatch>,

    // digest of an ordered request -> where it was committed
    seq_no_db: HashMap<Digest, (LedgerId, u64)>,
    suspicion_counts: IntMap<u64>,
    disconnected: HashSet<NodeId>,

    stopped_at: Option<u64>,
}

impl Node {
    /// Creates a node over a membership registry and a handler
    /// registry. One replica per required protocol instance is
    /// spawned, each batching over every registered ledger.
    pub fn new(
        name: impl Into<String>,
        id: NodeId,
        config: PoolConfig,
        registry: NodeRegistry,
        handlers: HandlerRegistry,
    ) -> Result<Self> {
        let name = name.into();
        if registry.id_of(&name) != Some(id) {
            return Err("Node is not part of its own registry").wrapped(ErrorKind::Node);
        }
        let instances = registry.params().required_instances();
        let mut replicas = Vec::with_capacity(instances);
        for instance in 0..instances {
            let mut replica = Replica::new(id, InstanceId::from(instance as u16), config.clone());
            for ledger_id in handlers.ledger_ids() {
                replica.register_ledger(ledger_id);
            }
            replicas.push(replica);
        }
        let monitor = Monitor::new(
            instances,
            config.monitor_warmup_batches,
            config.degradation_threshold,
        );
        let view_changer = ViewChanger::new(id, &config);
        let ledger_manager = LedgerManager::new(config.clone());
        Ok(Self {
            name,
            id,
            config,
            mode: Mode::Starting,
            registry,
            requests: RequestStore::new(),
            handlers,
            replicas,
            view_changer,
            ledger_manager,
            monitor,
            timeouts: Timeouts::new(),
            inbox: VecDeque::new(),
            outbox: Outbox::default(),
            msgs_for_future_views: BTreeMap::new(),
            msgs_for_future_replicas: BTreeMap::new(),
            stashed_ordered_reqs: VecDeque::new(),
            seq_no_db: collections::hash_map(),
            suspicion_counts: IntMap::new(),
            disconnected: collections::hash_set(),
            stopped_at: None,
        })
    }

    /// The name of this node.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The transport id of this node.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// The lifecycle stage of this node.
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// The view this node is in.
    pub fn view_no(&self) -> ViewNo {
        self.view_changer.view_no()
    }

    /// The membership registry, kept current with committed pool
    /// transactions.
    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    /// The request handlers, e.g. to inspect committed ledgers.
    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    /// The master replica.
    pub fn master_replica(&self) -> &Replica {
        &self.replicas[0]
    }

    /// Starts the node: it begins discovering the pool by catching
    /// up its ledgers, and arms the periodic sweeps.
    pub fn start(&mut self, now: u64) {
        info!("{} starting", self.name);
        self.mode = Mode::Discovering;
        self.timeouts.schedule(
            TimeoutKind::PerformanceCheck,
            self.config.perf_check_interval,
            now,
        );
        self.timeouts.schedule(
            TimeoutKind::OutOfOrderScan,
            self.config.out_of_order_scan_interval,
            now,
        );
        self.start_catchup(now);
    }

    /// Records the node's shutdown; the transport should drain the
    /// outbox one final time afterwards.
    pub fn shutdown(&mut self, now: u64) {
        info!("{} stopping", self.name);
        self.stopped_at = Some(now);
        self.inbox.clear();
    }

    /// Hands an inbound message to the node; it is processed during
    /// the next `prod()`.
    pub fn deliver(&mut self, from: NodeId, msg: SystemMessage) {
        if self.stopped_at.is_some() {
            return;
        }
        self.inbox.push_back((from, msg));
    }

    /// Takes everything the node wants shipped.
    pub fn drain_outbox(&mut self) -> Outbox {
        std::mem::take(&mut self.outbox)
    }

    // ------------------------------------------------------------------
    // the event loop

    /// Services the node: fires due timeouts, routes up to `limit`
    /// inbound messages, and drives batch formation.
    ///
    /// A batch commit failure is fatal and surfaces here; the caller
    /// must not keep running the node past it.
    pub fn prod(&mut self, now: u64, limit: usize) -> Result<usize> {
        if self.stopped_at.is_some() {
            return Ok(0);
        }
        for kind in self.timeouts.pop_due(now) {
            self.handle_timeout(kind, now)?;
        }

        let mut processed = 0;
        while processed < limit {
            let (from, msg) = match self.inbox.pop_front() {
                Some(entry) => entry,
                None => break,
            };
            self.route(from, msg, now)?;
            processed += 1;
        }

        self.for_each_replica(now, |replica, ctx| replica.tick(now, ctx))?;
        Ok(processed)
    }

    // iterates the replicas by index, re-checking the bound every
    // step: a committed pool transaction may grow or shrink the
    // replica set mid-iteration
    fn for_each_replica(
        &mut self,
        now: u64,
        f: impl Fn(&mut Replica, &mut ReplicaContext<'_>),
    ) -> Result<()> {
        let mut instance = 0;
        while instance < self.replicas.len() {
            self.with_replica(instance, now, |replica, ctx| f(replica, ctx))?;
            instance += 1;
        }
        Ok(())
    }

    fn handle_timeout(&mut self, kind: TimeoutKind, now: u64) -> Result<()> {
        match kind {
            TimeoutKind::ProposeViewChange(view_no) => {
                let primary_gone = self
                    .master_primary_id()
                    .map(|id| self.disconnected.contains(&id))
                    .unwrap_or(false);
                if primary_gone && self.view_changer.view_no() < view_no {
                    self.with_sync(now, |changer, ctx| changer.on_primary_loss(now, ctx))?;
                }
            }
            TimeoutKind::ViewChangeComplete(view_no) => {
                self.with_sync(now, |changer, ctx| {
                    changer.on_view_change_not_completed_in_time(view_no, now, ctx)
                })?;
            }
            TimeoutKind::CatchupRound(ledger_id, round) => {
                self.with_catchup(now, |manager, ctx| {
                    manager.on_round_timeout(ledger_id, round, ctx)
                })?;
            }
            TimeoutKind::CatchupDuringViewChange => {
                if self.view_changer.view_change_in_progress() {
                    self.start_catchup(now);
                }
            }
            TimeoutKind::PerformanceCheck => {
                self.timeouts.schedule(
                    TimeoutKind::PerformanceCheck,
                    self.config.perf_check_interval,
                    now,
                );
                if self.mode == Mode::Participating
                    && !self.view_changer.view_change_in_progress()
                    && self.monitor.is_master_degraded()
                {
                    warn!("{} sees a degraded master", self.name);
                    self.with_sync(now, |changer, ctx| changer.on_master_degradation(now, ctx))?;
                }
            }
            TimeoutKind::OutOfOrderScan => {
                self.timeouts.schedule(
                    TimeoutKind::OutOfOrderScan,
                    self.config.out_of_order_scan_interval,
                    now,
                );
                self.for_each_replica(now, |replica, ctx| {
                    replica.process_stashed_out_of_order_commits(ctx)
                })?;
            }
        }
        Ok(())
    }

    fn route(&mut self, from: NodeId, msg: SystemMessage, now: u64) -> Result<()> {
        match msg {
            SystemMessage::Batch(inner) => {
                // inner messages dispatch as if received individually
                for msg in inner {
                    self.route(from, msg, now)?;
                }
            }
            SystemMessage::Request(request) => {
                self.submit_request(request, None, now)?;
            }
            SystemMessage::Propagate(request, client) => {
                self.process_propagate(request, client, from, now)?;
            }
            SystemMessage::Consensus(consensus) => {
                let instance = consensus.instance_id();
                let view_no = consensus.view_no();
                let msg = SystemMessage::Consensus(consensus);
                if let Some(msg) = self.stash_if_early(instance, view_no, from, msg) {
                    if let SystemMessage::Consensus(consensus) = msg {
                        self.with_replica(usize::from(instance), now, |replica, ctx| {
                            replica.process_consensus(consensus, from, now, ctx)
                        })?;
                    }
                }
            }
            SystemMessage::Checkpoint(checkpoint) => {
                let instance = checkpoint.instance_id;
                if usize::from(instance) >= self.replicas.len() {
                    self.msgs_for_future_replicas
                        .entry(instance)
                        .or_default()
                        .push((from, SystemMessage::Checkpoint(checkpoint)));
                    return Ok(());
                }
                self.with_replica(usize::from(instance), now, |replica, ctx| {
                    replica.process_checkpoint(checkpoint, from, ctx)
                })?;
            }
            SystemMessage::InstanceChange(instance_change) => {
                self.with_sync(now, |changer, ctx| {
                    changer.process_instance_change(instance_change, from, ctx)
                })?;
            }
            SystemMessage::ViewChangeDone(vcd) => {
                self.with_sync(now, |changer, ctx| {
                    changer.process_view_change_done(vcd, from, ctx)
                })?;
            }
            SystemMessage::FutureViewChangeDone(vcd) => {
                self.with_sync(now, |changer, ctx| {
                    changer.process_future_view_change_done(vcd, from, ctx)
                })?;
            }
            SystemMessage::CurrentState(state) => {
                self.with_sync(now, |changer, ctx| {
                    changer.process_current_state(state, from, ctx)
                })?;
            }
            SystemMessage::LedgerStatus(status) => {
                self.with_catchup(now, |manager, ctx| {
                    manager.process_ledger_status(status, from, ctx)
                })?;
            }
            SystemMessage::ConsistencyProof(proof) => {
                self.with_catchup(now, |manager, ctx| {
                    manager.process_consistency_proof(proof, from, ctx)
                })?;
            }
            SystemMessage::CatchupReq(req) => {
                self.with_catchup(now, |manager, ctx| {
                    manager.process_catchup_req(req, from, ctx)
                })?;
            }
            SystemMessage::CatchupRep(rep) => {
                self.with_catchup(now, |manager, ctx| {
                    manager.process_catchup_rep(rep, from, ctx)
                })?;
            }
            SystemMessage::MessageReq(req) => {
                let instance = usize::from(req.instance_id);
                if instance < self.replicas.len() {
                    self.with_replica(instance, now, |replica, ctx| {
                        replica.process_message_req(req, from, ctx)
                    })?;
                }
            }
            SystemMessage::MessageRep(consensus) => {
                let instance = usize::from(consensus.instance_id());
                if instance < self.replicas.len() {
                    self.with_replica(instance, now, |replica, ctx| {
                        replica.process_message_rep(*consensus, from, now, ctx)
                    })?;
                }
            }
            other => {
                // client-facing traffic has no business on the
                // validator-to-validator channel
                debug!("{} discarding {:?} from {:?}", self.name, other, from);
            }
        }
        Ok(())
    }

    // future-view and future-instance messages wait until the node
    // gets there
    fn stash_if_early(
        &mut self,
        instance: InstanceId,
        view_no: ViewNo,
        from: NodeId,
        msg: SystemMessage,
    ) -> Option<SystemMessage> {
        if usize::from(instance) >= self.replicas.len() {
            self.msgs_for_future_replicas
                .entry(instance)
                .or_default()
                .push((from, msg));
            return None;
        }
        if view_no > self.view_changer.view_no() {
            self.msgs_for_future_views
                .entry(view_no)
                .or_default()
                .push((from, msg));
            return None;
        }
        Some(msg)
    }

    // ------------------------------------------------------------------
    // request pipeline

    /// Ingresses a client request: validates it, propagates it to
    /// the pool, and acknowledges it to the client.
    pub fn submit_request(
        &mut self,
        request: Request,
        client: Option<String>,
        now: u64,
    ) -> Result<()> {
        let key = request.key().clone();
        let reply_to = client
            .clone()
            .unwrap_or_else(|| key.identifier.clone());

        let handler = match self.handlers.handler_for_request(&request) {
            Some(handler) => handler,
            None => {
                self.outbox.clients.push_back((
                    reply_to,
                    SystemMessage::RequestNack(key, "unknown operation type".into()),
                ));
                return Ok(());
            }
        };
        if let Err(e) = handler.do_static_validation(&request) {
            self.outbox
                .clients
                .push_back((reply_to, SystemMessage::RequestNack(key, e.to_string())));
            return Ok(());
        }

        let digest = request.digest();
        if let Some((ledger_id, seq_no)) = self.seq_no_db.get(&digest).copied() {
            // already ordered; replay the reply from the ledger
            self.replay_reply(&request, ledger_id, seq_no, reply_to);
            return Ok(());
        }

        self.requests.add_client_request(request.clone(), client.clone());
        let finalized = self.requests.add_propagate(
            request.clone(),
            self.id,
            self.registry.quorums().weak(),
        );
        self.outbox
            .clients
            .push_back((reply_to, SystemMessage::RequestAck(key)));
        self.outbox
            .broadcast
            .push_back(SystemMessage::Propagate(request.clone(), client));
        if finalized {
            self.enqueue_finalized(digest, &request, now)?;
        }
        Ok(())
    }

    /// Applies a forced request ahead of consensus, for
    /// configuration changes which must take effect on ingress.
    pub fn apply_forced(&mut self, request: &Request) -> Result<()> {
        let ledger_id = self
            .handlers
            .ledger_for_type(request.txn_type())
            .ok_or_else(|| Error::simple(ErrorKind::Node))?;
        let handler = self
            .handlers
            .handler_mut(ledger_id)
            .ok_or_else(|| Error::simple(ErrorKind::Node))?;
        handler.apply_forced(request)
    }

    /// Serves a read-only query outside of consensus.
    pub fn handle_query(&self, request: &Request) -> Result<Vec<u8>> {
        let handler = self
            .handlers
            .handler_for_query(request.txn_type())
            .ok_or_else(|| Error::simple(ErrorKind::Node))?;
        handler.query(request)
    }

    fn process_propagate(
        &mut self,
        request: Request,
        _client: Option<String>,
        from: NodeId,
        now: u64,
    ) -> Result<()> {
        if !self.registry.contains(from) {
            debug!("{} ignoring PROPAGATE from unknown node {:?}", self.name, from);
            return Ok(());
        }
        let digest = request.digest();
        if self.seq_no_db.contains_key(&digest) {
            return Ok(());
        }
        let weak = self.registry.quorums().weak();
        let mut finalized = self.requests.add_propagate(request.clone(), from, weak);
        if !self.requests.has_propagated(&digest, self.id) {
            // forward our own PROPAGATE exactly once per request
            finalized |= self.requests.add_propagate(request.clone(), self.id, weak);
            self.outbox
                .broadcast
                .push_back(SystemMessage::Propagate(request.clone(), None));
        }
        if finalized {
            debug!("{} finalized request {:?}", self.name, digest);
            self.enqueue_finalized(digest, &request, now)?;
        }
        Ok(())
    }

    fn enqueue_finalized(&mut self, digest: Digest, request: &Request, now: u64) -> Result<()> {
        let ledger_id = match self.handlers.ledger_for_type(request.txn_type()) {
            Some(ledger_id) => ledger_id,
            None => return Ok(()),
        };
        self.for_each_replica(now, |replica, ctx| {
            replica.enqueue_finalized_request(digest, ledger_id, now, ctx)
        })
    }

    fn replay_reply(&mut self, request: &Request, ledger_id: LedgerId, seq_no: u64, reply_to: String) {
        let handler = match self.handlers.handler(ledger_id) {
            Some(handler) => handler,
            None => return,
        };
        if let Some(txn) = handler.ledger().get_by_seq_no(seq_no) {
            let reply = Reply {
                key: request.key().clone(),
                ledger_id,
                seq_no: txn.seq_no(),
                digest: request.digest(),
            };
            self.outbox
                .clients
                .push_back((reply_to, SystemMessage::Reply(reply)));
        }
    }

    // ------------------------------------------------------------------
    // ordered batches

    fn handle_ordered(&mut self, batch: OrderedBatch, now: u64) -> Result<()> {
        self.monitor
            .batch_ordered(batch.instance_id, batch.req_digests.len() as u64);
        if !batch.instance_id.is_master() {
            return Ok(());
        }
        if self.mode != Mode::Participating {
            debug!(
                "{} stashing ordered batch {} while {:?}",
                self.name, batch.key, self.mode,
            );
            self.stashed_ordered_reqs.push_back(batch);
            return Ok(());
        }
        self.execute_ordered(batch, now)
    }

    // commits an ordered batch; failures here are fatal, the node
    // must not keep ordering on top of a failed commit
    fn execute_ordered(&mut self, batch: OrderedBatch, now: u64) -> Result<()> {
        let handler = self
            .handlers
            .handler_mut(batch.ledger_id)
            .ok_or_else(|| Error::simple(ErrorKind::Node))?;
        let txns = handler.commit(
            batch.req_digests.len() as u64,
            &batch.state_root,
            &batch.txn_root,
            batch.pp_time,
        )?;

        for txn in &txns {
            let digest = *txn.digest();
            self.seq_no_db
                .insert(digest, (batch.ledger_id, txn.seq_no()));
            self.requests.mark_executed(&digest);
            if let Some(request) = self.requests.get(&digest) {
                let reply_to = self
                    .requests
                    .client_of(&digest)
                    .unwrap_or(&request.key().identifier)
                    .to_string();
                let reply = Reply {
                    key: request.key().clone(),
                    ledger_id: batch.ledger_id,
                    seq_no: txn.seq_no(),
                    digest,
                };
                self.outbox
                    .clients
                    .push_back((reply_to, SystemMessage::Reply(reply)));
            }
        }

        if batch.ledger_id == LedgerId::POOL {
            for txn in &txns {
                self.on_pool_txn_committed(txn.payload(), now)?;
            }
        }
        Ok(())
    }

    // applies a committed pool transaction to the membership,
    // growing or shrinking the replica set as the parameters change
    fn on_pool_txn_committed(&mut self, payload: &[u8], now: u64) -> Result<()> {
        let txn = PoolTxn::from_payload(payload)?;
        info!("{} applying pool transaction {:?}", self.name, txn);
        let required = self.registry.on_pool_txn_committed(&txn)?;

        while self.replicas.len() < required {
            let instance = InstanceId::from(self.replicas.len() as u16);
            let mut replica = Replica::new(self.id, instance, self.config.clone());
            for ledger_id in self.handlers.ledger_ids() {
                replica.register_ledger(ledger_id);
            }
            self.replicas.push(replica);
            // deliver any traffic stashed for the instance
            if let Some(stashed) = self.msgs_for_future_replicas.remove(&instance) {
                for (from, msg) in stashed {
                    self.inbox.push_back((from, msg));
                }
            }
        }
        while self.replicas.len() > required {
            self.replicas.pop();
        }
        self.monitor.resize(self.replicas.len());
        self.select_primaries(self.view_changer.view_no(), now)?;
        Ok(())
    }

    fn process_stashed_ordered_reqs(&mut self, now: u64) -> Result<()> {
        let last_caught_up = self.ledger_manager.last_caught_up_3pc();
        while let Some(batch) = self.stashed_ordered_reqs.pop_front() {
            if let Some(caught_up) = last_caught_up {
                if batch.key <= caught_up {
                    // already contained in the caught-up ledgers
                    continue;
                }
            }
            self.apply_and_execute_stashed(batch, now)?;
        }
        Ok(())
    }

    // a batch ordered while not participating was never applied to
    // the uncommitted state; replay it before committing
    fn apply_and_execute_stashed(&mut self, batch: OrderedBatch, now: u64) -> Result<()> {
        let handler = self
            .handlers
            .handler_mut(batch.ledger_id)
            .ok_or_else(|| Error::simple(ErrorKind::Node))?;
        for digest in &batch.req_digests {
            let request = self
                .requests
                .get(digest)
                .ok_or_else(|| Error::simple(ErrorKind::Node))?
                .clone();
            handler.apply(&request, batch.pp_time)?;
        }
        let state_root = handler.state().head_root(false);
        let txn_root = handler.ledger().uncommitted_root_hash();
        let batch = OrderedBatch {
            state_root,
            txn_root,
            ..batch
        };
        self.execute_ordered(batch, now)
    }

    // ------------------------------------------------------------------
    // component glue

    fn with_replica<R>(
        &mut self,
        instance: usize,
        now: u64,
        f: impl FnOnce(&mut Replica, &mut ReplicaContext<'_>) -> R,
    ) -> Result<R> {
        let participating = self.mode == Mode::Participating;
        let (effects, result) = {
            let mut ctx = ReplicaContext::new(
                &self.registry,
                &self.requests,
                &mut self.handlers,
                participating,
            );
            let result = f(&mut self.replicas[instance], &mut ctx);
            (ctx.effects, result)
        };
        self.apply_replica_effects(instance, effects, now)?;
        Ok(result)
    }

    fn apply_replica_effects(
        &mut self,
        instance: usize,
        effects: ReplicaEffects,
        now: u64,
    ) -> Result<()> {
        for msg in effects.broadcast {
            self.outbox.broadcast.push_back(msg);
        }
        for (to, msg) in effects.directed {
            self.outbox.directed.push_back((to, msg));
        }
        for (digest, reason) in effects.rejects {
            if let Some(request) = self.requests.get(&digest) {
                let reply_to = self
                    .requests
                    .client_of(&digest)
                    .unwrap_or(&request.key().identifier)
                    .to_string();
                self.outbox.clients.push_back((
                    reply_to,
                    SystemMessage::Reject(request.key().clone(), reason),
                ));
            }
        }
        for digest in effects.request_propagates {
            // nudge the pool: propagating our copy again prompts
            // peers which saw the request to do the same
            if let Some(request) = self.requests.get(&digest) {
                self.outbox
                    .broadcast
                    .push_back(SystemMessage::Propagate(request.clone(), None));
            }
        }
        if instance == 0 {
            // the digest -> seq_no index survives garbage collection,
            // it is what makes re-delivered requests idempotent
            for digest in effects.freed_requests {
                self.requests.free(&digest);
            }
        }
        for (sender, suspicion) in effects.suspicions {
            self.report_suspicion(sender, suspicion, now)?;
        }
        for batch in effects.ordered {
            self.handle_ordered(batch, now)?;
        }
        if effects.needs_catchup && !self.ledger_manager.is_in_progress() {
            self.start_catchup(now);
        }
        Ok(())
    }

    fn report_suspicion(&mut self, sender: NodeId, suspicion: Suspicion, now: u64) -> Result<()> {
        warn!("{} suspects {:?}: {}", self.name, sender, suspicion);
        let count = self.suspicion_counts.remove(u64::from(sender)).unwrap_or(0);
        self.suspicion_counts.insert(u64::from(sender), count + 1);
        // a single incident is never grounds for blacklisting; the
        // counts only feed operator tooling
        if suspicion.is_primary_suspicion()
            && self.mode == Mode::Participating
            && !self.view_changer.view_change_in_progress()
        {
            self.with_sync(now, |changer, ctx| {
                changer.on_suspicious_primary(suspicion, now, ctx)
            })?;
        }
        Ok(())
    }

    fn with_sync<R>(
        &mut self,
        now: u64,
        f: impl FnOnce(&mut ViewChanger, &mut SyncContext<'_>) -> R,
    ) -> Result<R> {
        let is_synced = self.mode >= Mode::Synced;
        let summary = self.handlers.ledger_summary();
        let (effects, result) = {
            let mut ctx = SyncContext::new(&self.registry, &self.name, is_synced, summary);
            let result = f(&mut self.view_changer, &mut ctx);
            (ctx.effects, result)
        };
        self.apply_sync_effects(effects, now)?;
        Ok(result)
    }

    fn apply_sync_effects(&mut self, effects: SyncEffects, now: u64) -> Result<()> {
        for msg in effects.broadcast {
            self.outbox.broadcast.push_back(msg);
        }
        if let Some(view_no) = effects.view_change_started {
            self.on_view_change_started(view_no, now)?;
        }
        if let Some((view_no, primary)) = effects.view_change_completed {
            self.on_view_change_completed(view_no, &primary, now)?;
        }
        if effects.catchup_again {
            self.timeouts.schedule(
                TimeoutKind::CatchupDuringViewChange,
                self.config.min_catchup_timeout_during_view_change,
                now,
            );
        }
        Ok(())
    }

    fn on_view_change_started(&mut self, view_no: ViewNo, now: u64) -> Result<()> {
        info!("{} view change to {} started", self.name, view_no);
        // the master replica unwinds its own uncommitted applies
        self.for_each_replica(now, |replica, ctx| replica.on_view_change_start(ctx))?;
        self.monitor.reset();
        if self.mode == Mode::Participating {
            self.mode = Mode::Synced;
        }
        self.timeouts.schedule(
            TimeoutKind::ViewChangeComplete(view_no),
            self.config.view_change_timeout,
            now,
        );
        self.start_catchup(now);
        Ok(())
    }

    fn on_view_change_completed(&mut self, view_no: ViewNo, primary: &str, now: u64) -> Result<()> {
        info!(
            "{} view change to {} completed, master primary {}",
            self.name, view_no, primary,
        );
        self.select_primaries(view_no, now)?;
        self.monitor.reset();
        if self.mode == Mode::Synced && !self.ledger_manager.is_in_progress() {
            self.mode = Mode::Participating;
        }
        self.process_stashed_future_view_msgs(view_no);
        self.process_stashed_ordered_reqs(now)?;
        Ok(())
    }

    // installs the deterministic primary assignment of a view on
    // every replica
    fn select_primaries(&mut self, view_no: ViewNo, now: u64) -> Result<()> {
        let primaries: Vec<Option<NodeId>> = self
            .registry
            .primaries(view_no)
            .into_iter()
            .map(|name| self.registry.id_of(name))
            .collect();
        debug!("{} primaries of view {}: {:?}", self.name, view_no, primaries);
        let mut instance = 0;
        while instance < self.replicas.len() {
            let primary = primaries.get(instance).copied().flatten();
            self.with_replica(instance, now, |replica, ctx| {
                if replica.view_no() != view_no || replica.view_change_in_progress() {
                    replica.on_view_change_done(view_no, primary, ctx);
                } else {
                    replica.set_primary(primary);
                }
            })?;
            instance += 1;
        }
        Ok(())
    }

    fn process_stashed_future_view_msgs(&mut self, view_no: ViewNo) {
        let ready: Vec<ViewNo> = self
            .msgs_for_future_views
            .keys()
            .filter(|view| **view <= view_no)
            .copied()
            .collect();
        for view in ready {
            if let Some(stashed) = self.msgs_for_future_views.remove(&view) {
                for (from, msg) in stashed {
                    self.inbox.push_back((from, msg));
                }
            }
        }
    }

    fn with_catchup<R>(
        &mut self,
        now: u64,
        f: impl FnOnce(&mut LedgerManager, &mut CatchupContext<'_>) -> R,
    ) -> Result<R> {
        let last_ordered = {
            let key = self.replicas[0].last_ordered_3pc();
            (key != ThreePhaseKey::ZERO && key.pp_seq_no != SeqNo::ZERO).then_some(key)
        };
        let (effects, result) = {
            let mut ctx =
                CatchupContext::new(&self.registry, &mut self.handlers, self.id, last_ordered);
            let result = f(&mut self.ledger_manager, &mut ctx);
            (ctx.effects, result)
        };
        self.apply_catchup_effects(effects, now)?;
        Ok(result)
    }

    fn apply_catchup_effects(&mut self, effects: CatchupEffects, now: u64) -> Result<()> {
        for msg in effects.broadcast {
            self.outbox.broadcast.push_back(msg);
        }
        for (to, msg) in effects.directed {
            self.outbox.directed.push_back((to, msg));
        }
        if let Some((ledger_id, round, delay)) = effects.schedule_round {
            self.timeouts
                .schedule(TimeoutKind::CatchupRound(ledger_id, round), delay, now);
        }
        for ledger_id in effects.synced_ledgers {
            if ledger_id == LedgerId::POOL && self.mode == Mode::Discovering {
                self.mode = Mode::Syncing;
            }
        }
        if let Some(last_caught_up) = effects.complete {
            self.on_catchup_complete(last_caught_up, now)?;
        }
        Ok(())
    }

    fn start_catchup(&mut self, now: u64) {
        if self.ledger_manager.is_in_progress() {
            return;
        }
        if self.mode > Mode::Discovering {
            self.mode = Mode::Syncing;
        }
        let result = self.with_catchup(now, |manager, ctx| manager.start_catchup(ctx));
        if let Err(e) = result {
            warn!("{} failed to start catch-up: {}", self.name, e);
        }
    }

    fn on_catchup_complete(&mut self, last_caught_up: Option<ThreePhaseKey>, now: u64) -> Result<()> {
        info!(
            "{} caught up, last observed 3PC {:?}",
            self.name, last_caught_up,
        );
        self.mode = Mode::Synced;
        self.for_each_replica(now, |replica, _| replica.on_catchup_complete(last_caught_up))?;
        if self.view_changer.view_change_in_progress() {
            self.with_sync(now, |changer, ctx| changer.on_catchup_complete(ctx))?;
            // selection may already have a quorum waiting on us
            self.with_sync(now, |changer, ctx| changer.retry_selection(ctx))?;
            return Ok(());
        }
        if self.view_changer.master_primary().is_none() {
            // a freshly bootstrapped pool adopts the deterministic
            // assignment of view zero
            let primary = self.registry.master_primary(ViewNo::ZERO).to_string();
            self.view_changer.adopt_initial_primary(primary);
            self.select_primaries(ViewNo::ZERO, now)?;
        }
        self.mode = Mode::Participating;
        self.process_stashed_ordered_reqs(now)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // connectivity

    fn master_primary_id(&self) -> Option<NodeId> {
        self.view_changer
            .master_primary()
            .and_then(|name| self.registry.id_of(name))
    }

    /// The transport lost the connection to a peer.
    pub fn on_peer_disconnected(&mut self, peer: NodeId, now: u64) {
        self.disconnected.insert(peer);
        if self.master_primary_id() == Some(peer) {
            warn!("{} lost the master primary {:?}", self.name, peer);
            self.timeouts.schedule(
                TimeoutKind::ProposeViewChange(self.view_no().next()),
                self.config.tolerate_primary_disconnection,
                now,
            );
        }
    }

    /// The transport (re-)established the connection to a peer;
    /// shares the established view with it.
    pub fn on_peer_connected(&mut self, peer: NodeId) {
        self.disconnected.remove(&peer);
        let state = self.view_changer.current_state();
        if !state.primary_messages.is_empty() {
            self.outbox
                .directed
                .push_back((peer, SystemMessage::CurrentState(state)));
        }
    }

    /// Votes for a view change by hand, e.g. from operator tooling.
    pub fn propose_view_change(&mut self, now: u64) -> Result<()> {
        self.with_sync(now, |changer, ctx| changer.on_master_degradation(now, ctx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bft::executable::KvRequestHandler;
    use crate::bft::message::RequestKey;

    const DOMAIN_TXN: u16 = 7;
    const POOL_TXN: u16 = 1;

    fn names() -> Vec<String> {
        ["N1", "N2", "N3", "N4"].iter().map(|s| s.to_string()).collect()
    }

    fn registry() -> NodeRegistry {
        NodeRegistry::new(
            names()
                .into_iter()
                .enumerate()
                .map(|(i, n)| (n, NodeId::from(i as u32))),
        )
        .unwrap()
    }

    fn config() -> PoolConfig {
        PoolConfig {
            max_batch_size: 1,
            max_batch_wait: 0,
            chk_freq: 3,
            log_size: 9,
            acceptable_deviation: 60_000,
            ..Default::default()
        }
    }

    fn handlers() -> HandlerRegistry {
        let mut handlers = HandlerRegistry::new();
        handlers
            .register(Box::new(KvRequestHandler::new(LedgerId::POOL, POOL_TXN)))
            .unwrap();
        handlers
            .register(Box::new(KvRequestHandler::new(LedgerId::DOMAIN, DOMAIN_TXN)))
            .unwrap();
        handlers
    }

    fn kv_request(req_id: u64, key: &str, value: &str) -> Request {
        let mut payload = key.as_bytes().to_vec();
        payload.push(0);
        payload.extend_from_slice(value.as_bytes());
        Request::new(RequestKey::new("client-a", req_id), DOMAIN_TXN, payload)
    }

    struct TestPool {
        nodes: Vec<Node>,
        clients: Vec<Vec<(String, SystemMessage)>>,
        now: u64,
    }

    impl TestPool {
        fn new() -> Self {
            let nodes: Vec<Node> = names()
                .into_iter()
                .enumerate()
                .map(|(i, name)| {
                    Node::new(
                        name,
                        NodeId::from(i as u32),
                        config(),
                        registry(),
                        handlers(),
                    )
                    .unwrap()
                })
                .collect();
            let clients = nodes.iter().map(|_| Vec::new()).collect();
            Self {
                nodes,
                clients,
                now: 1_000_000,
            }
        }

        fn start(&mut self) {
            let now = self.now;
            for node in &mut self.nodes {
                node.start(now);
            }
            self.run(20);
        }

        // runs rounds of prod + full message delivery
        fn run(&mut self, rounds: usize) {
            for _ in 0..rounds {
                for node in &mut self.nodes {
                    node.prod(self.now, 1_000).unwrap();
                }
                self.deliver_all();
                self.now += 100;
            }
        }

        fn deliver_all(&mut self) {
            let ids: Vec<NodeId> = self.nodes.iter().map(Node::id).collect();
            for i in 0..self.nodes.len() {
                let outbox = self.nodes[i].drain_outbox();
                let from = ids[i];
                for msg in outbox.broadcast {
                    for j in 0..self.nodes.len() {
                        if i != j {
                            self.nodes[j].deliver(from, msg.clone());
                        }
                    }
                }
                for (to, msg) in outbox.directed {
                    if let Some(j) = ids.iter().position(|id| *id == to) {
                        self.nodes[j].deliver(from, msg);
                    }
                }
                for entry in outbox.clients {
                    self.clients[i].push(entry);
                }
            }
        }

        fn node(&self, name: &str) -> &Node {
            self.nodes.iter().find(|n| n.name() == name).unwrap()
        }

        fn node_mut(&mut self, name: &str) -> &mut Node {
            self.nodes.iter_mut().find(|n| n.name() == name).unwrap()
        }

        fn client_msgs(&self, name: &str) -> &[(String, SystemMessage)] {
            let idx = self.nodes.iter().position(|n| n.name() == name).unwrap();
            &self.clients[idx]
        }

        fn domain_roots(&self) -> Vec<Digest> {
            self.nodes
                .iter()
                .map(|n| {
                    n.handlers()
                        .handler(LedgerId::DOMAIN)
                        .unwrap()
                        .ledger()
                        .root_hash()
                })
                .collect()
        }
    }

    #[test]
    fn bootstrapped_pool_reaches_participation() {
        let mut pool = TestPool::new();
        pool.start();
        for node in &pool.nodes {
            assert_eq!(node.mode(), Mode::Participating, "{}", node.name());
            assert_eq!(node.view_no(), ViewNo::ZERO);
            // view 0 master primary is the lowest ranked name
            assert_eq!(node.master_replica().primary(), Some(NodeId::from(0)));
        }
        // exactly one primary node
        let primaries = pool
            .nodes
            .iter()
            .filter(|n| n.master_replica().is_primary())
            .count();
        assert_eq!(primaries, 1);
        assert!(pool.node("N1").master_replica().is_primary());
    }

    #[test]
    fn happy_path_request_is_ordered_and_replied_everywhere() {
        let mut pool = TestPool::new();
        pool.start();

        let request = kv_request(1, "k", "v");
        let digest = request.digest();
        let now = pool.now;
        pool.node_mut("N1")
            .submit_request(request, Some("client-a".into()), now)
            .unwrap();
        pool.run(20);

        // every node committed the same transaction at seq 1
        for node in &pool.nodes {
            let handler = node.handlers().handler(LedgerId::DOMAIN).unwrap();
            assert_eq!(handler.ledger().size(), 1, "{}", node.name());
            assert_eq!(handler.ledger().get_by_seq_no(1).unwrap().digest(), &digest);
            assert_eq!(
                node.master_replica().last_ordered_3pc(),
                ThreePhaseKey::new(0u64, 1u64),
            );
        }
        let roots = pool.domain_roots();
        assert!(roots.iter().all(|r| *r == roots[0]));

        // the ingress node acknowledged and replied
        let msgs = pool.client_msgs("N1");
        assert!(msgs
            .iter()
            .any(|(_, m)| matches!(m, SystemMessage::RequestAck(_))));
        let reply = msgs
            .iter()
            .find_map(|(to, m)| match m {
                SystemMessage::Reply(reply) => Some((to.clone(), reply.clone())),
                _ => None,
            })
            .expect("a Reply was sent");
        assert_eq!(reply.0, "client-a");
        assert_eq!(reply.1.seq_no, 1);
        assert_eq!(reply.1.digest, digest);
    }

    #[test]
    fn redelivered_request_replays_the_reply_without_reordering() {
        let mut pool = TestPool::new();
        pool.start();

        let request = kv_request(1, "k", "v");
        let now = pool.now;
        pool.node_mut("N1")
            .submit_request(request.clone(), Some("client-a".into()), now)
            .unwrap();
        pool.run(20);

        let before = pool
            .node("N1")
            .master_replica()
            .last_ordered_3pc();

        let now = pool.now;
        pool.node_mut("N1")
            .submit_request(request, Some("client-a".into()), now)
            .unwrap();
        pool.run(10);

        assert_eq!(pool.node("N1").master_replica().last_ordered_3pc(), before);
        let replies = pool
            .client_msgs("N1")
            .iter()
            .filter(|(_, m)| matches!(m, SystemMessage::Reply(_)))
            .count();
        assert_eq!(replies, 2);
        for node in &pool.nodes {
            let handler = node.handlers().handler(LedgerId::DOMAIN).unwrap();
            assert_eq!(handler.ledger().size(), 1);
        }
    }

    #[test]
    fn checkpoints_stabilize_after_chk_freq_batches() {
        let mut pool = TestPool::new();
        pool.start();

        for i in 1..=3 {
            let request = kv_request(i, &format!("k{}", i), "v");
            let now = pool.now;
            pool.node_mut("N1")
                .submit_request(request, None, now)
                .unwrap();
            pool.run(15);
        }

        for node in &pool.nodes {
            assert_eq!(
                node.master_replica().h(),
                SeqNo::from(3),
                "{} did not stabilize the checkpoint",
                node.name(),
            );
        }
    }

    #[test]
    fn dynamically_invalid_request_is_rejected_but_counted() {
        let mut pool = TestPool::new();
        pool.start();

        let now = pool.now;
        pool.node_mut("N1")
            .submit_request(kv_request(1, "k", "v"), Some("client-a".into()), now)
            .unwrap();
        pool.run(15);

        // the same write again fails dynamic validation everywhere
        let now = pool.now;
        pool.node_mut("N1")
            .submit_request(kv_request(2, "k", "v"), Some("client-a".into()), now)
            .unwrap();
        pool.run(20);

        let msgs = pool.client_msgs("N1");
        assert!(msgs
            .iter()
            .any(|(_, m)| matches!(m, SystemMessage::Reject(_, _))));
        for node in &pool.nodes {
            let handler = node.handlers().handler(LedgerId::DOMAIN).unwrap();
            assert_eq!(handler.ledger().size(), 1, "{}", node.name());
        }
        // ordering advanced past the all-invalid batch
        assert_eq!(
            pool.node("N1").master_replica().last_ordered_3pc(),
            ThreePhaseKey::new(0u64, 2u64),
        );
    }

    #[test]
    fn view_change_elects_the_next_primary_and_resumes_ordering() {
        let mut pool = TestPool::new();
        pool.start();

        // three nodes vote the master out
        for name in ["N2", "N3", "N4"] {
            let now = pool.now;
            pool.node_mut(name).propose_view_change(now).unwrap();
        }
        pool.run(30);

        for node in &pool.nodes {
            assert_eq!(node.view_no(), ViewNo::from(1), "{}", node.name());
            assert_eq!(node.mode(), Mode::Participating, "{}", node.name());
            // the master primary of view 1 is the node at rank 1
            assert_eq!(node.master_replica().primary(), Some(NodeId::from(1)));
        }
        assert!(pool.node("N2").master_replica().is_primary());

        // consensus resumes at ppSeqNo 1 of the new view
        let now = pool.now;
        pool.node_mut("N1")
            .submit_request(kv_request(9, "k9", "v"), None, now)
            .unwrap();
        pool.run(20);
        for node in &pool.nodes {
            assert_eq!(
                node.master_replica().last_ordered_3pc(),
                ThreePhaseKey::new(1u64, 1u64),
                "{}",
                node.name(),
            );
            let handler = node.handlers().handler(LedgerId::DOMAIN).unwrap();
            assert_eq!(handler.ledger().size(), 1);
        }
    }

    #[test]
    fn primary_disconnection_triggers_a_view_change() {
        let mut pool = TestPool::new();
        pool.start();

        // every backup node sees the master primary drop off
        for name in ["N2", "N3", "N4"] {
            let now = pool.now;
            pool.node_mut(name).on_peer_disconnected(NodeId::from(0), now);
        }
        // nothing happens inside the tolerated disconnection window
        pool.run(5);
        for node in &pool.nodes {
            assert_eq!(node.view_no(), ViewNo::ZERO);
        }

        // past the window the nodes vote, and the pool moves to the
        // next view
        pool.run(60);
        for node in &pool.nodes {
            assert_eq!(node.view_no(), ViewNo::from(1), "{}", node.name());
            assert_eq!(node.master_replica().primary(), Some(NodeId::from(1)));
        }
    }

    #[test]
    fn committed_pool_txn_updates_every_membership() {
        let mut pool = TestPool::new();
        pool.start();

        let txn = PoolTxn::AddNode {
            name: "N5".into(),
            id: NodeId::from(4),
        };
        let request = Request::new(
            RequestKey::new("steward", 1),
            POOL_TXN,
            txn.to_payload(),
        );
        let now = pool.now;
        pool.node_mut("N1")
            .submit_request(request, None, now)
            .unwrap();
        pool.run(20);

        for node in &pool.nodes {
            assert_eq!(node.registry().params().n(), 5, "{}", node.name());
            assert_eq!(node.registry().rank_of("N5"), Some(4));
        }
    }

    #[test]
    fn queries_are_answered_without_consensus() {
        let mut pool = TestPool::new();
        pool.start();

        let now = pool.now;
        pool.node_mut("N1")
            .submit_request(kv_request(1, "k", "v"), None, now)
            .unwrap();
        pool.run(20);

        let query = Request::new(
            RequestKey::new("client-a", 2),
            DOMAIN_TXN | KvRequestHandler::QUERY_BIT,
            b"k".to_vec(),
        );
        let value = pool.node("N2").handle_query(&query).unwrap();
        assert_eq!(value, b"v".to_vec());
        // no ordering happened for the query
        assert_eq!(
            pool.node("N2").master_replica().last_ordered_3pc(),
            ThreePhaseKey::new(0u64, 1u64),
        );
    }

    #[test]
    fn forced_requests_take_effect_without_consensus() {
        let mut pool = TestPool::new();
        pool.start();

        let request = kv_request(1, "cfg", "on");
        pool.node_mut("N1").apply_forced(&request).unwrap();

        let query = Request::new(
            RequestKey::new("client-a", 2),
            DOMAIN_TXN | KvRequestHandler::QUERY_BIT,
            b"cfg".to_vec(),
        );
        assert_eq!(pool.node("N1").handle_query(&query).unwrap(), b"on".to_vec());
        // nothing was ordered
        assert_eq!(
            pool.node("N1").master_replica().last_ordered_3pc(),
            ThreePhaseKey::ZERO,
        );
    }

    #[test]
    fn unknown_operation_type_is_nacked() {
        let mut pool = TestPool::new();
        pool.start();

        let request = Request::new(RequestKey::new("client-a", 1), 999, b"k\0v".to_vec());
        let now = pool.now;
        pool.node_mut("N1")
            .submit_request(request, Some("client-a".into()), now)
            .unwrap();
        pool.deliver_all();

        assert!(pool
            .client_msgs("N1")
            .iter()
            .any(|(_, m)| matches!(m, SystemMessage::RequestNack(_, _))));
    }
}
