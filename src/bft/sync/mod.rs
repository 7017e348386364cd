//! The view change sub-protocol.
//!
//! Nodes vote INSTANCE_CHANGE when they suspect the master primary;
//! once a strong quorum of votes names a view ahead of the current
//! one, every node moves to it: ordering freezes, the ledgers are
//! caught up afresh, and VIEW_CHANGE_DONE announcements are
//! exchanged. The view is declared once a quorum of identical
//! announcements arrives, among them one from the node that the
//! deterministic selection expects to be the next primary.
//!
//! A joining node runs a relaxed variant of the same exchange: with
//! no master primary adopted yet and the pool still in view zero, a
//! weak quorum of CURRENT_STATE-carried announcements is enough to
//! adopt the established view.

use std::collections::BTreeMap;

use log::{debug, info, warn};

use crate::bft::collections::{self, HashMap, HashSet};
use crate::bft::config::PoolConfig;
use crate::bft::ledger::LedgerInfo;
use crate::bft::message::{CurrentState, InstanceChange, SystemMessage, ViewChangeDone};
use crate::bft::ordering::ViewNo;
use crate::bft::registry::{NodeId, NodeRegistry};
use crate::bft::suspicion::Suspicion;

/// Everything the view changer asked the node to do during one call.
#[derive(Default)]
pub struct SyncEffects {
    /// Messages to broadcast to every validator.
    pub broadcast: Vec<SystemMessage>,
    /// A view change began; replicas must freeze ordering and a
    /// fresh catch-up must start.
    pub view_change_started: Option<ViewNo>,
    /// A view change completed with the named master primary; the
    /// node must select primaries and resume ordering.
    pub view_change_completed: Option<(ViewNo, String)>,
    /// The node is behind the accepted ledger summary and must catch
    /// up again before declaring the view change done.
    pub catchup_again: bool,
}

/// Node state the view changer consults for one call.
pub struct SyncContext<'a> {
    pub registry: &'a NodeRegistry,
    pub node_name: &'a str,
    pub is_synced: bool,
    /// The local ledger summary, in catch-up order.
    pub ledger_summary: Vec<LedgerInfo>,
    pub effects: SyncEffects,
}

impl<'a> SyncContext<'a> {
    pub fn new(
        registry: &'a NodeRegistry,
        node_name: &'a str,
        is_synced: bool,
        ledger_summary: Vec<LedgerInfo>,
    ) -> Self {
        Self {
            registry,
            node_name,
            is_synced,
            ledger_summary,
            effects: SyncEffects::default(),
        }
    }
}

// spacing of instance change votes ratchets apart with every vote in
// the window, up to the configured peak
struct Throttler {
    window: u64,
    votes_in_window: u32,
    last_vote: Option<u64>,
}

impl Throttler {
    fn new(window: u64) -> Self {
        Self {
            window,
            votes_in_window: 0,
            last_vote: None,
        }
    }

    fn cooldown(&self) -> u64 {
        let delay_secs = 2.0 * 2f64.powf(0.05 * f64::from(self.votes_in_window)) + 1.0;
        ((delay_secs * 1_000.0) as u64).min(self.window)
    }

    fn acquire(&mut self, now: u64) -> bool {
        match self.last_vote {
            Some(last) if now.saturating_sub(last) < self.cooldown() => false,
            Some(last) => {
                if now.saturating_sub(last) >= self.window {
                    self.votes_in_window = 0;
                }
                self.votes_in_window += 1;
                self.last_vote = Some(now);
                true
            }
            None => {
                self.votes_in_window = 1;
                self.last_vote = Some(now);
                true
            }
        }
    }
}

/// Drives instance changes, view transitions, and new primary
/// adoption for one node.
pub struct ViewChanger {
    node_id: NodeId,

    view_no: ViewNo,
    view_change_in_progress: bool,
    // relaxed quorum mode for nodes adopting an established view
    propagate_primary: bool,
    // master primary name adopted for the current view, if any
    master_primary: Option<String>,

    // view -> voter -> suspicion code
    instance_changes: BTreeMap<ViewNo, HashMap<NodeId, u16>>,
    // voter -> announced (primary, ledger summary)
    view_change_done: HashMap<NodeId, (String, Vec<LedgerInfo>)>,
    accepted: Option<(String, Vec<LedgerInfo>)>,
    // future views peers have already moved past us into
    next_view_indications: BTreeMap<ViewNo, HashSet<NodeId>>,

    throttler: Throttler,
}

impl ViewChanger {
    /// Creates a view changer for one node, starting in view zero
    /// with no adopted primary.
    pub fn new(node_id: NodeId, config: &PoolConfig) -> Self {
        let throttler = Throttler::new(config.instance_change_window);
        Self {
            node_id,
            view_no: ViewNo::ZERO,
            view_change_in_progress: false,
            propagate_primary: false,
            master_primary: None,
            instance_changes: BTreeMap::new(),
            view_change_done: collections::hash_map(),
            accepted: None,
            next_view_indications: BTreeMap::new(),
            throttler,
        }
    }

    /// The view this node is in.
    pub fn view_no(&self) -> ViewNo {
        self.view_no
    }

    /// Whether a view change is in progress.
    pub fn view_change_in_progress(&self) -> bool {
        self.view_change_in_progress
    }

    /// The master primary name adopted for the current view.
    pub fn master_primary(&self) -> Option<&str> {
        self.master_primary.as_deref()
    }

    /// Adopts an initial primary without a protocol exchange, used
    /// when a freshly bootstrapped pool selects the primaries of
    /// view zero deterministically.
    pub fn adopt_initial_primary(&mut self, primary: String) {
        debug_assert!(self.master_primary.is_none());
        self.master_primary = Some(primary);
    }

    // ------------------------------------------------------------------
    // instance changes

    /// Records an INSTANCE_CHANGE vote from a peer, starting the view
    /// change once the vote quorum is reached.
    pub fn process_instance_change(
        &mut self,
        msg: InstanceChange,
        sender: NodeId,
        ctx: &mut SyncContext<'_>,
    ) {
        if msg.view_no <= self.view_no {
            debug!(
                "ignoring INSTANCE_CHANGE for view {} at view {}",
                msg.view_no, self.view_no,
            );
            return;
        }
        let votes = self.instance_changes.entry(msg.view_no).or_default();
        if votes.contains_key(&sender) {
            return;
        }
        votes.insert(sender, msg.code);
        self.do_view_change_if_possible(msg.view_no, ctx);
    }

    /// Broadcasts an INSTANCE_CHANGE vote of our own, throttled so a
    /// flapping monitor cannot flood the pool.
    pub fn send_instance_change(
        &mut self,
        view_no: ViewNo,
        suspicion: Suspicion,
        now: u64,
        ctx: &mut SyncContext<'_>,
    ) {
        if !self.throttler.acquire(now) {
            debug!("instance change for view {} throttled", view_no);
            return;
        }
        info!(
            "{} voting INSTANCE_CHANGE to view {} ({})",
            ctx.node_name, view_no, suspicion,
        );
        let msg = InstanceChange {
            view_no,
            code: suspicion.code(),
        };
        ctx.effects
            .broadcast
            .push(SystemMessage::InstanceChange(msg));
        self.instance_changes
            .entry(view_no)
            .or_default()
            .insert(self.node_id, suspicion.code());
        self.do_view_change_if_possible(view_no, ctx);
    }

    /// The master fell behind the backups.
    pub fn on_master_degradation(&mut self, now: u64, ctx: &mut SyncContext<'_>) {
        self.send_instance_change(self.view_no.next(), Suspicion::PrimaryDegraded, now, ctx);
    }

    /// The master primary disconnected.
    pub fn on_primary_loss(&mut self, now: u64, ctx: &mut SyncContext<'_>) {
        self.send_instance_change(self.view_no.next(), Suspicion::PrimaryDisconnected, now, ctx);
    }

    /// A replica raised a primary-related suspicion.
    pub fn on_suspicious_primary(
        &mut self,
        suspicion: Suspicion,
        now: u64,
        ctx: &mut SyncContext<'_>,
    ) {
        self.send_instance_change(self.view_no.next(), suspicion, now, ctx);
    }

    /// The view change we started did not complete in time; vote to
    /// move past the proposed view as well.
    pub fn on_view_change_not_completed_in_time(
        &mut self,
        view_no: ViewNo,
        now: u64,
        ctx: &mut SyncContext<'_>,
    ) {
        if !self.view_change_in_progress || self.view_no != view_no {
            return;
        }
        warn!(
            "{} view change to {} timed out, voting for the next view",
            ctx.node_name, view_no,
        );
        self.send_instance_change(view_no.next(), Suspicion::ViewChangeTimeout, now, ctx);
    }

    fn do_view_change_if_possible(&mut self, view_no: ViewNo, ctx: &mut SyncContext<'_>) {
        let votes = self
            .instance_changes
            .get(&view_no)
            .map(HashMap::len)
            .unwrap_or(0);
        if votes < ctx.registry.quorums().view_change() {
            return;
        }
        if view_no <= self.view_no {
            return;
        }
        self.propagate_primary = false;
        self.start_view_change(view_no, ctx);
    }

    fn start_view_change(&mut self, view_no: ViewNo, ctx: &mut SyncContext<'_>) {
        info!(
            "{} starting view change from view {} to view {}",
            ctx.node_name, self.view_no, view_no,
        );
        self.view_no = view_no;
        self.view_change_in_progress = true;
        self.view_change_done.clear();
        self.accepted = None;
        self.next_view_indications
            .retain(|view, _| *view > view_no);
        ctx.effects.view_change_started = Some(view_no);
    }

    // ------------------------------------------------------------------
    // view change done

    /// Called once the fresh catch-up ordered for this view change
    /// completed; announces VIEW_CHANGE_DONE.
    pub fn on_catchup_complete(&mut self, ctx: &mut SyncContext<'_>) {
        if !self.view_change_in_progress {
            return;
        }
        let primary = ctx.registry.master_primary(self.view_no).to_string();
        let msg = ViewChangeDone {
            view_no: self.view_no,
            primary: primary.clone(),
            ledger_summary: ctx.ledger_summary.clone(),
        };
        debug!(
            "{} announcing VIEW_CHANGE_DONE for view {} with primary {}",
            ctx.node_name, self.view_no, primary,
        );
        ctx.effects
            .broadcast
            .push(SystemMessage::ViewChangeDone(msg.clone()));
        self.record_view_change_done(msg, self.node_id, ctx);
    }

    /// Records a VIEW_CHANGE_DONE announcement from a peer.
    pub fn process_view_change_done(
        &mut self,
        msg: ViewChangeDone,
        sender: NodeId,
        ctx: &mut SyncContext<'_>,
    ) {
        if msg.view_no < self.view_no {
            debug!(
                "ignoring VIEW_CHANGE_DONE for view {} at view {}",
                msg.view_no, self.view_no,
            );
            return;
        }
        if msg.view_no > self.view_no {
            self.process_future_view_change_done(msg, sender, ctx);
            return;
        }
        self.record_view_change_done(msg, sender, ctx);
    }

    /// Records a VIEW_CHANGE_DONE relayed for a view ahead of ours;
    /// a weak quorum of such indications moves us forward.
    pub fn process_future_view_change_done(
        &mut self,
        msg: ViewChangeDone,
        sender: NodeId,
        ctx: &mut SyncContext<'_>,
    ) {
        if msg.view_no <= self.view_no {
            return;
        }
        let indications = self.next_view_indications.entry(msg.view_no).or_insert_with(collections::hash_set);
        indications.insert(sender);
        let count = indications.len();
        if count >= ctx.registry.quorums().propagate_primary() {
            info!(
                "{} saw {} nodes ahead in view {}, jumping forward",
                ctx.node_name, count, msg.view_no,
            );
            self.propagate_primary = true;
            self.start_view_change(msg.view_no, ctx);
        }
    }

    /// Processes the CURRENT_STATE a peer sent to us as a joining
    /// node. Only honored while no master primary was ever adopted
    /// and the pool is still in view zero.
    pub fn process_current_state(
        &mut self,
        msg: CurrentState,
        sender: NodeId,
        ctx: &mut SyncContext<'_>,
    ) {
        if self.view_no != ViewNo::ZERO || self.master_primary.is_some() {
            debug!("ignoring CURRENT_STATE from {:?}: view established", sender);
            return;
        }
        self.propagate_primary = true;
        for vcd in msg.primary_messages {
            if vcd.view_no == msg.view_no {
                self.record_view_change_done(vcd, sender, ctx);
            }
        }
    }

    fn record_view_change_done(
        &mut self,
        msg: ViewChangeDone,
        sender: NodeId,
        ctx: &mut SyncContext<'_>,
    ) {
        if msg.view_no != self.view_no {
            return;
        }
        self.view_change_done
            .insert(sender, (msg.primary, msg.ledger_summary));
        self.start_selection(ctx);
    }

    // quorum of identical announcements required to declare the view
    fn selection_quorum(&self, ctx: &SyncContext<'_>) -> usize {
        if self.propagate_primary {
            ctx.registry.quorums().propagate_primary()
        } else {
            ctx.registry.quorums().view_change_done()
        }
    }

    fn sufficient_same_view_change_done(
        &self,
        ctx: &SyncContext<'_>,
    ) -> Option<(String, Vec<LedgerInfo>)> {
        if let Some(accepted) = &self.accepted {
            return Some(accepted.clone());
        }
        let mut counts: HashMap<&(String, Vec<LedgerInfo>), usize> = collections::hash_map();
        for vote in self.view_change_done.values() {
            *counts.entry(vote).or_insert(0) += 1;
        }
        counts
            .into_iter()
            .find(|(_, count)| *count >= self.selection_quorum(ctx))
            .map(|(vote, _)| vote.clone())
    }

    fn has_view_change_from_expected_primary(&self, ctx: &SyncContext<'_>) -> bool {
        let expected = ctx.registry.master_primary(self.view_no);
        ctx.registry
            .id_of(expected)
            .map(|id| self.view_change_done.contains_key(&id))
            .unwrap_or(false)
    }

    fn is_behind_accepted_summary(&self, summary: &[LedgerInfo], ctx: &SyncContext<'_>) -> bool {
        for accepted in summary {
            let local = ctx
                .ledger_summary
                .iter()
                .find(|info| info.ledger_id == accepted.ledger_id);
            match local {
                Some(local) if local.size >= accepted.size => (),
                _ => return true,
            }
        }
        false
    }

    fn start_selection(&mut self, ctx: &mut SyncContext<'_>) {
        if !self.view_change_in_progress && self.master_primary.is_some() {
            // stragglers after a completed view change
            return;
        }
        if !ctx.is_synced {
            debug!("{} cannot select a primary: not synced", ctx.node_name);
            return;
        }
        let (new_primary, ledger_summary) = match self.sufficient_same_view_change_done(ctx) {
            Some(accepted) => accepted,
            None => return,
        };
        if !self.propagate_primary && !self.has_view_change_from_expected_primary(ctx) {
            debug!(
                "{} has a quorum but no announcement from the expected primary",
                ctx.node_name,
            );
            return;
        }
        if !self.propagate_primary {
            let expected = ctx.registry.master_primary(self.view_no);
            if new_primary != expected {
                warn!(
                    "{} expected next primary {} but the quorum declared {}",
                    ctx.node_name, expected, new_primary,
                );
                return;
            }
        }
        self.accepted = Some((new_primary.clone(), ledger_summary.clone()));

        if self.is_behind_accepted_summary(&ledger_summary, ctx) {
            info!(
                "{} has the view change quorum but lags the accepted ledgers, catching up again",
                ctx.node_name,
            );
            ctx.effects.catchup_again = true;
            return;
        }

        info!(
            "{} completing view change to view {}, master primary {}",
            ctx.node_name, self.view_no, new_primary,
        );
        self.view_change_in_progress = false;
        self.propagate_primary = false;
        self.master_primary = Some(new_primary.clone());
        let view_no = self.view_no;
        self.instance_changes.retain(|view, _| *view > view_no);
        ctx.effects.view_change_completed = Some((view_no, new_primary));
    }

    /// Re-runs primary selection, used after an additional catch-up
    /// round closed the ledger gap.
    pub fn retry_selection(&mut self, ctx: &mut SyncContext<'_>) {
        if self.view_change_in_progress {
            self.start_selection(ctx);
        }
    }

    /// The announcements which established the current view, relayed
    /// to joining nodes.
    pub fn current_state(&self) -> CurrentState {
        let primary_messages = self
            .view_change_done
            .iter()
            .map(|(_, (primary, summary))| ViewChangeDone {
                view_no: self.view_no,
                primary: primary.clone(),
                ledger_summary: summary.clone(),
            })
            .collect();
        CurrentState {
            view_no: self.view_no,
            primary_messages,
        }
    }
}
