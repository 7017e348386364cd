//! This module contains types associated with messages traded
//! between the validator nodes of the pool.
//!
//! Transport framing, signatures, and per-sender verification happen
//! below this layer; what arrives here is a deserialized
//! `SystemMessage` together with the authenticated `NodeId` of its
//! sender.

#[cfg(feature = "serialize_serde")]
use serde::{Deserialize, Serialize};

use crate::bft::crypto::hash::{Context, Digest};
use crate::bft::ledger::{LedgerId, LedgerInfo, LedgerTxn};
use crate::bft::ordering::{Orderable, SeqNo, ThreePhaseKey, ViewNo};
use crate::bft::registry::InstanceId;

/// Identifies a client request: the client identifier paired with the
/// client-chosen request number.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
pub struct RequestKey {
    pub identifier: String,
    pub req_id: u64,
}

impl RequestKey {
    pub fn new(identifier: impl Into<String>, req_id: u64) -> Self {
        Self {
            identifier: identifier.into(),
            req_id,
        }
    }
}

/// Represents a request from a client.
///
/// The operation payload is opaque to the consensus core; the type
/// tag routes it to the request handler claiming it, which also
/// determines the target ledger.
#[derive(Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
pub struct Request {
    key: RequestKey,
    txn_type: u16,
    #[cfg_attr(feature = "serialize_serde", serde(with = "serde_bytes"))]
    payload: Vec<u8>,
    signature: Option<Vec<u8>>,
}

impl Request {
    /// Creates a new `Request`.
    pub fn new(key: RequestKey, txn_type: u16, payload: Vec<u8>) -> Self {
        Self {
            key,
            txn_type,
            payload,
            signature: None,
        }
    }

    /// Attaches a client signature to this request.
    pub fn signed(mut self, signature: Vec<u8>) -> Self {
        self.signature = Some(signature);
        self
    }

    /// Returns the key identifying this request.
    pub fn key(&self) -> &RequestKey {
        &self.key
    }

    /// Returns the type tag of the operation.
    pub fn txn_type(&self) -> u16 {
        self.txn_type
    }

    /// Returns the opaque operation payload.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Returns the client signature, if one was attached.
    pub fn signature(&self) -> Option<&[u8]> {
        self.signature.as_deref()
    }

    /// The collision resistant digest of the canonicalized request,
    /// under which it is propagated, batched, and ordered.
    pub fn digest(&self) -> Digest {
        let mut ctx = Context::new();
        ctx.update(self.key.identifier.as_bytes());
        ctx.update(&self.key.req_id.to_le_bytes());
        ctx.update(&self.txn_type.to_le_bytes());
        ctx.update(&self.payload);
        ctx.finish()
    }
}

/// A PRE-PREPARE: the primary's proposal of a batch of finalized
/// requests at a given three-phase key.
#[derive(Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
pub struct PrePrepare {
    pub pp_time: u64,
    pub req_digests: Vec<Digest>,
    /// Number of requests which passed dynamic validation; the valid
    /// requests come first in `req_digests`.
    pub discarded: u64,
    /// Digest over the concatenated request digests.
    pub digest: Digest,
    pub ledger_id: LedgerId,
    pub state_root: Digest,
    pub txn_root: Digest,
    pub bls_multi_sig: Option<Vec<u8>>,
}

impl PrePrepare {
    /// Digest of a proposed batch: the hash over the concatenated
    /// digests of its requests.
    pub fn batch_digest(req_digests: &[Digest]) -> Digest {
        let mut ctx = Context::new();
        for digest in req_digests {
            ctx.update(digest.as_ref());
        }
        ctx.finish()
    }

    /// The request digests which passed dynamic validation.
    pub fn valid_digests(&self) -> &[Digest] {
        &self.req_digests[..self.discarded as usize]
    }
}

/// A PREPARE vote, echoing the contents of an accepted PRE-PREPARE.
#[derive(Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
pub struct Prepare {
    pub pp_time: u64,
    pub digest: Digest,
    pub state_root: Digest,
    pub txn_root: Digest,
    pub bls_share: Option<Vec<u8>>,
}

/// A COMMIT vote.
#[derive(Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
pub struct Commit {
    pub bls_sig: Option<Vec<u8>>,
}

/// Represents one of the three consensus stages.
#[derive(Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
pub enum ConsensusMessageKind {
    PrePrepare(PrePrepare),
    Prepare(Prepare),
    Commit(Commit),
}

/// Represents a message from the three-phase sub-protocol of one
/// instance.
#[derive(Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
pub struct ConsensusMessage {
    instance_id: InstanceId,
    view_no: ViewNo,
    pp_seq_no: SeqNo,
    kind: ConsensusMessageKind,
}

impl ConsensusMessage {
    /// Creates a new `ConsensusMessage` at the given three-phase
    /// coordinates, of the kind `kind`.
    pub fn new(
        instance_id: InstanceId,
        view_no: ViewNo,
        pp_seq_no: SeqNo,
        kind: ConsensusMessageKind,
    ) -> Self {
        Self {
            instance_id,
            view_no,
            pp_seq_no,
            kind,
        }
    }

    /// Returns the instance this message belongs to.
    pub fn instance_id(&self) -> InstanceId {
        self.instance_id
    }

    /// Returns the view this message was sent in.
    pub fn view_no(&self) -> ViewNo {
        self.view_no
    }

    /// Returns the three-phase key of this message.
    pub fn three_phase_key(&self) -> ThreePhaseKey {
        ThreePhaseKey {
            view_no: self.view_no,
            pp_seq_no: self.pp_seq_no,
        }
    }

    /// Returns a reference to the consensus message kind.
    pub fn kind(&self) -> &ConsensusMessageKind {
        &self.kind
    }

    /// Returns an owned consensus message kind.
    pub fn into_kind(self) -> ConsensusMessageKind {
        self.kind
    }
}

impl Orderable for ConsensusMessage {
    fn sequence_number(&self) -> SeqNo {
        self.pp_seq_no
    }
}

/// A quorum-attested summary over one checkpoint interval of ordered
/// batches.
#[derive(Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
pub struct CheckpointMessage {
    pub instance_id: InstanceId,
    pub view_no: ViewNo,
    pub seq_no_start: SeqNo,
    pub seq_no_end: SeqNo,
    pub digest: Digest,
}

/// A vote to leave the current view behind, carrying the code of the
/// suspicion that prompted it.
#[derive(Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
pub struct InstanceChange {
    pub view_no: ViewNo,
    pub code: u16,
}

/// Announces that the sender finished catching up for a view change,
/// naming the primary it expects and summarizing its ledgers.
#[derive(Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
pub struct ViewChangeDone {
    pub view_no: ViewNo,
    pub primary: String,
    pub ledger_summary: Vec<LedgerInfo>,
}

/// Sent to a joining node: the current view and the VIEW_CHANGE_DONE
/// messages which established it.
#[derive(Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
pub struct CurrentState {
    pub view_no: ViewNo,
    pub primary_messages: Vec<ViewChangeDone>,
}

/// Advertises the state of one local ledger to a peer.
#[derive(Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
pub struct LedgerStatus {
    pub ledger_id: LedgerId,
    pub size: u64,
    pub last_3pc: Option<ThreePhaseKey>,
    pub root: Digest,
    pub protocol_version: u32,
}

impl LedgerStatus {
    /// The current version of the catch-up protocol.
    pub const CURRENT_VERSION: u32 = 2;
}

/// Proof that the receiver's ledger prefix extends to the sender's,
/// allowing a lagging node to commit to a catch-up target.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
pub struct ConsistencyProof {
    pub ledger_id: LedgerId,
    pub size_from: u64,
    pub size_to: u64,
    pub last_3pc: Option<ThreePhaseKey>,
    pub old_root: Digest,
    pub new_root: Digest,
    pub hashes: Vec<Digest>,
}

/// Requests a chunk of committed transactions from a peer.
#[derive(Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
pub struct CatchupReq {
    pub ledger_id: LedgerId,
    pub seq_no_from: u64,
    pub seq_no_to: u64,
    pub catchup_till: u64,
}

/// A chunk of committed transactions, with the proof material needed
/// to verify them against the agreed target root.
#[derive(Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
pub struct CatchupRep {
    pub ledger_id: LedgerId,
    pub txns: Vec<LedgerTxn>,
    pub proof: Vec<Digest>,
}

impl CatchupRep {
    /// Sequence number of the first transaction in the chunk, if the
    /// chunk is not empty.
    pub fn first_seq_no(&self) -> Option<u64> {
        self.txns.first().map(LedgerTxn::seq_no)
    }
}

/// The kind of three-phase message requested point-to-point from a
/// peer.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
pub enum ThreePcMsgKind {
    PrePrepare,
    Prepare,
    Commit,
}

/// Point-to-point request for a missed three-phase message.
#[derive(Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
pub struct MessageReq {
    pub kind: ThreePcMsgKind,
    pub instance_id: InstanceId,
    pub view_no: ViewNo,
    pub pp_seq_no: SeqNo,
}

/// A reply to a client, sent once its request was ordered and
/// committed to a ledger.
#[derive(Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
pub struct Reply {
    pub key: RequestKey,
    pub ledger_id: LedgerId,
    pub seq_no: u64,
    pub digest: Digest,
}

/// A `SystemMessage` corresponds to a message regarding one of the
/// sub-protocols of the pool, or to client traffic flowing through a
/// node.
#[derive(Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
pub enum SystemMessage {
    /// A request received from a client.
    Request(Request),
    /// A client request relayed between nodes, with the name of the
    /// client connection it arrived on.
    Propagate(Request, Option<String>),
    /// Acknowledges the reception of a request to the client.
    RequestAck(RequestKey),
    /// Informs the client its request failed static validation.
    RequestNack(RequestKey, String),
    /// Informs the client its request failed dynamic validation.
    Reject(RequestKey, String),
    /// The committed result of an ordered request.
    Reply(Reply),
    /// A three-phase protocol message.
    Consensus(ConsensusMessage),
    /// A checkpoint attestation.
    Checkpoint(CheckpointMessage),
    /// A vote to change the view.
    InstanceChange(InstanceChange),
    /// A view change completion announcement.
    ViewChangeDone(ViewChangeDone),
    /// The established view, sent to a joining node.
    CurrentState(CurrentState),
    /// A VIEW_CHANGE_DONE for a view ahead of the receiver's,
    /// relayed so lagging nodes can jump forward.
    FutureViewChangeDone(ViewChangeDone),
    /// A ledger summary advertisement.
    LedgerStatus(LedgerStatus),
    /// A catch-up target proof.
    ConsistencyProof(ConsistencyProof),
    /// A catch-up chunk request.
    CatchupReq(CatchupReq),
    /// A catch-up chunk reply.
    CatchupRep(CatchupRep),
    /// Point-to-point recovery request for a three-phase message.
    MessageReq(MessageReq),
    /// Point-to-point recovery reply.
    MessageRep(Box<ConsensusMessage>),
    /// Several messages packed together by the transport; inner
    /// messages must be dispatched as if received individually.
    Batch(Vec<SystemMessage>),
}

impl SystemMessage {
    /// Whether this message is exempt from per-sender signature
    /// verification.
    ///
    /// The whitelist covers exactly the internal three-phase and
    /// control messages: their authenticity rests on the
    /// authenticated channel to the sending validator. `Batch` is
    /// whitelisted only because each inner message is checked again
    /// after unpacking.
    pub fn signature_exempt(&self) -> bool {
        matches!(
            self,
            SystemMessage::Consensus(_)
                | SystemMessage::Checkpoint(_)
                | SystemMessage::InstanceChange(_)
                | SystemMessage::ViewChangeDone(_)
                | SystemMessage::CurrentState(_)
                | SystemMessage::FutureViewChangeDone(_)
                | SystemMessage::LedgerStatus(_)
                | SystemMessage::ConsistencyProof(_)
                | SystemMessage::CatchupReq(_)
                | SystemMessage::CatchupRep(_)
                | SystemMessage::MessageReq(_)
                | SystemMessage::MessageRep(_)
                | SystemMessage::Batch(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(req_id: u64) -> Request {
        Request::new(RequestKey::new("client-a", req_id), 7, vec![1, 2, 3])
    }

    #[test]
    fn request_digests_cover_the_key() {
        let r1 = request(1);
        let r2 = request(2);
        assert_ne!(r1.digest(), r2.digest());
        assert_eq!(r1.digest(), request(1).digest());
    }

    #[test]
    fn batch_digest_is_order_sensitive() {
        let d1 = request(1).digest();
        let d2 = request(2).digest();
        assert_ne!(
            PrePrepare::batch_digest(&[d1, d2]),
            PrePrepare::batch_digest(&[d2, d1]),
        );
    }

    #[test]
    fn client_traffic_is_not_signature_exempt() {
        let msg = SystemMessage::Request(request(1));
        assert!(!msg.signature_exempt());
        let msg = SystemMessage::Propagate(request(1), None);
        assert!(!msg.signature_exempt());
        let msg = SystemMessage::Checkpoint(CheckpointMessage {
            instance_id: InstanceId::MASTER,
            view_no: ViewNo::ZERO,
            seq_no_start: SeqNo::ONE,
            seq_no_end: SeqNo::from(3),
            digest: Digest::blank(),
        });
        assert!(msg.signature_exempt());
        let msg = SystemMessage::Batch(vec![]);
        assert!(msg.signature_exempt());
    }

    #[cfg(feature = "serialize_serde")]
    #[test]
    fn consensus_messages_survive_serialization() {
        let pp = PrePrepare {
            pp_time: 42,
            req_digests: vec![request(1).digest()],
            discarded: 1,
            digest: PrePrepare::batch_digest(&[request(1).digest()]),
            ledger_id: LedgerId::DOMAIN,
            state_root: Digest::blank(),
            txn_root: Digest::blank(),
            bls_multi_sig: None,
        };
        let msg = ConsensusMessage::new(
            InstanceId::MASTER,
            ViewNo::ZERO,
            SeqNo::ONE,
            ConsensusMessageKind::PrePrepare(pp),
        );
        let bytes = bincode::serialize(&msg).unwrap();
        let back: ConsensusMessage = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, msg);
    }
}
