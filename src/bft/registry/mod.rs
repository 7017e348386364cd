//! Pool membership, quorum arithmetic, and primary selection.
//!
//! The registry holds the set of known validators, keyed by their
//! stable names, and derives every quantity the protocol layers
//! consume: the Byzantine bound `f`, the quorums, the number of
//! protocol instances, and the deterministic primary assignment of
//! each view. All derived values are recomputed in one step whenever
//! the membership changes, so consumers always observe a consistent
//! snapshot.

use std::collections::BTreeMap;

#[cfg(feature = "serialize_serde")]
use serde::{Deserialize, Serialize};

use crate::bft::error::*;
use crate::bft::ordering::ViewNo;

/// A `NodeId` represents the transport handle of a validator in the
/// pool.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[repr(transparent)]
pub struct NodeId(u32);

impl NodeId {
    pub const fn new(id: u32) -> Self {
        NodeId(id)
    }

    pub fn targets<I>(into_iterator: I) -> impl Iterator<Item = Self>
    where
        I: IntoIterator<Item = u32>,
    {
        into_iterator.into_iter().map(Self)
    }
}

impl From<u32> for NodeId {
    #[inline]
    fn from(id: u32) -> NodeId {
        NodeId(id)
    }
}

impl From<NodeId> for usize {
    #[inline]
    fn from(id: NodeId) -> usize {
        id.0 as usize
    }
}

impl From<NodeId> for u64 {
    #[inline]
    fn from(id: NodeId) -> u64 {
        id.0 as u64
    }
}

impl From<NodeId> for u32 {
    #[inline]
    fn from(id: NodeId) -> u32 {
        id.0
    }
}

/// Identifies one of the `f + 1` protocol instances a node runs.
///
/// Instance zero is the master.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[repr(transparent)]
pub struct InstanceId(u16);

impl InstanceId {
    pub const MASTER: Self = InstanceId(0);

    pub fn is_master(self) -> bool {
        self.0 == 0
    }
}

impl From<u16> for InstanceId {
    #[inline]
    fn from(id: u16) -> InstanceId {
        InstanceId(id)
    }
}

impl From<InstanceId> for usize {
    #[inline]
    fn from(id: InstanceId) -> usize {
        id.0 as usize
    }
}

/// The `n` and `f` parameters of the pool.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct SystemParams {
    n: usize,
    f: usize,
}

impl SystemParams {
    /// Derive the parameters from the current number of validators.
    ///
    /// This function will fail for pools smaller than four nodes,
    /// since they cannot tolerate any fault.
    pub fn new(n: usize) -> Result<Self> {
        if n < 4 {
            return Err("Invalid number of validators").wrapped(ErrorKind::Registry);
        }
        Ok(Self { n, f: (n - 1) / 3 })
    }

    /// Returns the total number of validators in the pool.
    pub fn n(&self) -> usize {
        self.n
    }

    /// Returns the number of tolerated Byzantine validators.
    pub fn f(&self) -> usize {
        self.f
    }

    /// Number of protocol instances the pool runs, `f + 1`.
    pub fn required_instances(&self) -> usize {
        self.f + 1
    }
}

/// Every vote threshold used by the protocol layers, derived from
/// `SystemParams` in one place.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct Quorums {
    strong: usize,
    weak: usize,
    prepare: usize,
    commit: usize,
    checkpoint: usize,
    view_change: usize,
    view_change_done: usize,
    propagate_primary: usize,
    timestamp: usize,
}

impl Quorums {
    fn new(params: SystemParams) -> Self {
        let f = params.f();
        Self {
            strong: 2 * f + 1,
            weak: f + 1,
            prepare: 2 * f,
            commit: 2 * f + 1,
            checkpoint: 2 * f + 1,
            view_change: 2 * f + 1,
            view_change_done: 2 * f + 1,
            propagate_primary: f + 1,
            timestamp: f + 1,
        }
    }

    /// The strong quorum, `2f + 1` matching votes.
    pub fn strong(&self) -> usize {
        self.strong
    }

    /// The weak quorum, `f + 1` matching votes; enough to guarantee
    /// one of the voters is correct.
    pub fn weak(&self) -> usize {
        self.weak
    }

    /// Votes required to send a COMMIT, excluding the primary.
    pub fn prepare(&self) -> usize {
        self.prepare
    }

    /// Votes required to order a batch.
    pub fn commit(&self) -> usize {
        self.commit
    }

    /// Votes required to mark a checkpoint stable.
    pub fn checkpoint(&self) -> usize {
        self.checkpoint
    }

    /// Instance change votes required to start a view change.
    pub fn view_change(&self) -> usize {
        self.view_change
    }

    /// Matching VIEW_CHANGE_DONE messages required to finish one.
    pub fn view_change_done(&self) -> usize {
        self.view_change_done
    }

    /// Relaxed quorum used by a joining node adopting the current
    /// primary from CURRENT_STATE messages.
    pub fn propagate_primary(&self) -> usize {
        self.propagate_primary
    }

    /// Matching PREPARE timestamps required to rescue a PRE-PREPARE
    /// stashed for an incorrect time.
    pub fn timestamp(&self) -> usize {
        self.timestamp
    }
}

/// A committed pool transaction updating the validator set.
#[derive(Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
pub enum PoolTxn {
    AddNode { name: String, id: NodeId },
    RemoveNode { name: String },
}

impl PoolTxn {
    /// Encodes this transaction as a `name NUL verb` request payload.
    ///
    /// Transport framing is out of scope here, so pool requests use
    /// the same `key NUL value` payload convention as any other
    /// request.
    pub fn to_payload(&self) -> Vec<u8> {
        let mut payload;
        match self {
            PoolTxn::AddNode { name, id } => {
                payload = name.as_bytes().to_vec();
                payload.push(0);
                payload.extend_from_slice(format!("add:{}", u32::from(*id)).as_bytes());
            }
            PoolTxn::RemoveNode { name } => {
                payload = name.as_bytes().to_vec();
                payload.push(0);
                payload.extend_from_slice(b"remove");
            }
        }
        payload
    }

    /// Decodes a pool request payload.
    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        let pos = payload
            .iter()
            .position(|b| *b == 0)
            .ok_or_else(|| Error::simple(ErrorKind::Registry))?;
        let name = std::str::from_utf8(&payload[..pos])
            .wrapped(ErrorKind::Registry)?
            .to_string();
        let verb = std::str::from_utf8(&payload[pos + 1..]).wrapped(ErrorKind::Registry)?;
        if verb == "remove" {
            return Ok(PoolTxn::RemoveNode { name });
        }
        match verb.strip_prefix("add:") {
            Some(id) => {
                let id: u32 = id.parse().wrapped(ErrorKind::Registry)?;
                Ok(PoolTxn::AddNode {
                    name,
                    id: NodeId::from(id),
                })
            }
            None => Err("Unknown pool transaction verb").wrapped(ErrorKind::Registry),
        }
    }
}

/// The set of known validators, and everything derived from it.
#[derive(Clone, Debug)]
pub struct NodeRegistry {
    // name ordered; ranks are positions in this order
    nodes: BTreeMap<String, NodeId>,
    params: SystemParams,
    quorums: Quorums,
}

impl NodeRegistry {
    /// Builds a registry over the given named validators.
    pub fn new<I>(nodes: I) -> Result<Self>
    where
        I: IntoIterator<Item = (String, NodeId)>,
    {
        let nodes: BTreeMap<_, _> = nodes.into_iter().collect();
        let params = SystemParams::new(nodes.len())?;
        let quorums = Quorums::new(params);
        Ok(Self {
            nodes,
            params,
            quorums,
        })
    }

    /// Returns the system parameters of the current membership.
    pub fn params(&self) -> SystemParams {
        self.params
    }

    /// Returns the quorums of the current membership.
    pub fn quorums(&self) -> Quorums {
        self.quorums
    }

    /// The rank of a validator, i.e. its position in the name-sorted
    /// registry, or `None` for unknown names.
    pub fn rank_of(&self, name: &str) -> Option<usize> {
        self.nodes.keys().position(|n| n == name)
    }

    /// The name holding a given rank.
    pub fn name_at_rank(&self, rank: usize) -> Option<&str> {
        self.nodes.keys().nth(rank).map(String::as_str)
    }

    /// The transport id of a named validator.
    pub fn id_of(&self, name: &str) -> Option<NodeId> {
        self.nodes.get(name).copied()
    }

    /// The name of a validator, looked up by transport id.
    pub fn name_of(&self, id: NodeId) -> Option<&str> {
        self.nodes
            .iter()
            .find(|(_, v)| **v == id)
            .map(|(k, _)| k.as_str())
    }

    /// Whether the registry contains the given transport id.
    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.values().any(|v| *v == id)
    }

    /// All validator ids, in rank order.
    pub fn ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes.values().copied()
    }

    /// All validator names, in rank order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(String::as_str)
    }

    /// Applies a committed pool transaction, atomically recomputing
    /// the derived parameters and quorums.
    ///
    /// Returns the new number of required instances, so the caller
    /// can grow or shrink its replica set.
    pub fn on_pool_txn_committed(&mut self, txn: &PoolTxn) -> Result<usize> {
        match txn {
            PoolTxn::AddNode { name, id } => {
                self.nodes.insert(name.clone(), *id);
            }
            PoolTxn::RemoveNode { name } => {
                self.nodes.remove(name);
            }
        }
        self.params = SystemParams::new(self.nodes.len())?;
        self.quorums = Quorums::new(self.params);
        Ok(self.params.required_instances())
    }

    /// The name of the master primary of the given view.
    pub fn master_primary(&self, view_no: ViewNo) -> &str {
        let rank = view_no.primary_rank(self.params.n());
        // the registry is never empty, the modulus is always in range
        self.name_at_rank(rank).unwrap_or_default()
    }

    /// The full primary assignment of a view, one name per protocol
    /// instance, master first.
    ///
    /// Backup instance `i` takes the next rank after
    /// `(master_rank + i) mod n` which is not already the primary of
    /// a lower instance.
    pub fn primaries(&self, view_no: ViewNo) -> Vec<&str> {
        let n = self.params.n();
        let instances = self.params.required_instances();
        let master_rank = view_no.primary_rank(n);
        let mut chosen: Vec<&str> = Vec::with_capacity(instances);
        chosen.push(self.name_at_rank(master_rank).unwrap_or_default());
        for inst in 1..instances {
            let mut rank = (master_rank + inst) % n;
            loop {
                let name = self.name_at_rank(rank).unwrap_or_default();
                if !chosen.contains(&name) {
                    chosen.push(name);
                    break;
                }
                rank = (rank + 1) % n;
            }
        }
        chosen
    }

    /// The primary of one instance in the given view.
    pub fn primary_of(&self, view_no: ViewNo, instance_id: InstanceId) -> Option<NodeId> {
        let primaries = self.primaries(view_no);
        primaries
            .get(usize::from(instance_id))
            .and_then(|name| self.id_of(name))
    }

    /// The name of the expected master primary of the view after
    /// `view_no`, used to validate VIEW_CHANGE_DONE messages.
    pub fn next_primary_name(&self, view_no: ViewNo) -> &str {
        self.master_primary(view_no)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn four_nodes() -> NodeRegistry {
        NodeRegistry::new(
            ["N1", "N2", "N3", "N4"]
                .iter()
                .enumerate()
                .map(|(i, n)| (n.to_string(), NodeId::from(i as u32))),
        )
        .unwrap()
    }

    #[test]
    fn quorums_derive_from_f() {
        let reg = four_nodes();
        assert_eq!(reg.params().f(), 1);
        assert_eq!(reg.params().required_instances(), 2);
        assert_eq!(reg.quorums().strong(), 3);
        assert_eq!(reg.quorums().weak(), 2);
        assert_eq!(reg.quorums().prepare(), 2);
        assert_eq!(reg.quorums().commit(), 3);
        assert_eq!(reg.quorums().view_change(), 3);
    }

    #[test]
    fn ranks_are_lexicographic() {
        let reg = four_nodes();
        assert_eq!(reg.rank_of("N1"), Some(0));
        assert_eq!(reg.rank_of("N4"), Some(3));
        assert_eq!(reg.name_at_rank(2), Some("N3"));
        assert_eq!(reg.rank_of("N9"), None);
    }

    #[test]
    fn master_primary_rotates_with_the_view() {
        let reg = four_nodes();
        assert_eq!(reg.master_primary(ViewNo::ZERO), "N1");
        assert_eq!(reg.master_primary(ViewNo::from(1)), "N2");
        assert_eq!(reg.master_primary(ViewNo::from(5)), "N2");
    }

    #[test]
    fn backup_primaries_skip_assigned_nodes() {
        let reg = four_nodes();
        // view 0: master N1, backup instance takes rank 1
        assert_eq!(reg.primaries(ViewNo::ZERO), vec!["N1", "N2"]);
        // view 3: master N4, backup wraps around to N1
        assert_eq!(reg.primaries(ViewNo::from(3)), vec!["N4", "N1"]);
    }

    #[test]
    fn membership_changes_recompute_params() {
        let mut reg = four_nodes();
        let txn = PoolTxn::AddNode {
            name: "N5".into(),
            id: NodeId::from(4),
        };
        assert_eq!(reg.on_pool_txn_committed(&txn).unwrap(), 2);
        assert_eq!(reg.params().n(), 5);

        for (name, id) in [("N6", 5u32), ("N7", 6u32)] {
            let txn = PoolTxn::AddNode {
                name: name.into(),
                id: NodeId::from(id),
            };
            reg.on_pool_txn_committed(&txn).unwrap();
        }
        assert_eq!(reg.params().f(), 2);
        assert_eq!(reg.params().required_instances(), 3);
        assert_eq!(reg.quorums().commit(), 5);
    }

    #[test]
    fn pool_txn_payloads_round_trip() {
        let add = PoolTxn::AddNode {
            name: "N5".into(),
            id: NodeId::from(4),
        };
        let remove = PoolTxn::RemoveNode { name: "N2".into() };
        assert_eq!(PoolTxn::from_payload(&add.to_payload()).unwrap(), add);
        assert_eq!(PoolTxn::from_payload(&remove.to_payload()).unwrap(), remove);
        assert!(PoolTxn::from_payload(b"garbage").is_err());
    }

    #[test]
    fn too_small_pools_are_rejected() {
        let nodes = ["N1", "N2", "N3"]
            .iter()
            .enumerate()
            .map(|(i, n)| (n.to_string(), NodeId::from(i as u32)));
        assert!(NodeRegistry::new(nodes).is_err());
    }
}
