//! Coded classifications of peer misbehavior.
//!
//! A suspicion is raised whenever a peer steps outside the protocol:
//! a wrong digest, a duplicate vote, a batch from a node which is not
//! the primary. Suspicions about the primary itself escalate to a
//! view change; the rest are only recorded against the sender.

use std::fmt;

/// Represents a protocol violation observed on a peer node.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Suspicion {
    /// A PRE-PREPARE was received from a node which is not the
    /// primary of the instance.
    PprFromNonPrimary,
    /// A PRE-PREPARE was addressed to the primary of the instance.
    PprToPrimary,
    /// The primary sent two PRE-PREPAREs with the same three-phase
    /// key but different contents.
    DuplicatePprSent,
    /// The batch digest in a PRE-PREPARE does not match the digests
    /// of the requests it references.
    PprDigestWrong,
    /// The primary included a request the local node rejects, or
    /// rejected one the local node accepts.
    PprRejectWrong,
    /// The state root in a PRE-PREPARE does not match the root
    /// obtained by applying the batch locally.
    PprStateWrong,
    /// The transaction root in a PRE-PREPARE does not match the root
    /// obtained by applying the batch locally.
    PprTxnWrong,
    /// The timestamp of a PRE-PREPARE is outside the acceptable
    /// window.
    PprTimeWrong,
    /// The primary sent a PREPARE for its own batch.
    PrFromPrimary,
    /// A node sent two different PREPAREs for the same key.
    DuplicatePrSent,
    /// The primary received a PREPARE for a batch it never proposed.
    UnknownPrSent,
    /// A PREPARE disagrees with the accepted PRE-PREPARE's batch
    /// digest.
    PrDigestWrong,
    /// A PREPARE disagrees with the accepted PRE-PREPARE's state
    /// root.
    PrStateWrong,
    /// A PREPARE disagrees with the accepted PRE-PREPARE's
    /// transaction root.
    PrTxnWrong,
    /// A node sent two different COMMITs for the same key.
    DuplicateCmSent,
    /// The master instance fell behind the backups.
    PrimaryDegraded,
    /// The master primary disconnected from the pool.
    PrimaryDisconnected,
    /// A view change did not complete in time.
    ViewChangeTimeout,
    /// The pool moved past the local view.
    PrimaryAboutToBeDisconnected,
}

impl Suspicion {
    /// Stable numeric code carried in INSTANCE_CHANGE messages.
    pub fn code(self) -> u16 {
        match self {
            Suspicion::PprFromNonPrimary => 1,
            Suspicion::PprToPrimary => 2,
            Suspicion::DuplicatePprSent => 3,
            Suspicion::PprDigestWrong => 4,
            Suspicion::PprRejectWrong => 5,
            Suspicion::PprStateWrong => 6,
            Suspicion::PprTxnWrong => 7,
            Suspicion::PprTimeWrong => 8,
            Suspicion::PrFromPrimary => 9,
            Suspicion::DuplicatePrSent => 10,
            Suspicion::UnknownPrSent => 11,
            Suspicion::PrDigestWrong => 12,
            Suspicion::PrStateWrong => 13,
            Suspicion::PrTxnWrong => 14,
            Suspicion::DuplicateCmSent => 15,
            Suspicion::PrimaryDegraded => 16,
            Suspicion::PrimaryDisconnected => 17,
            Suspicion::ViewChangeTimeout => 18,
            Suspicion::PrimaryAboutToBeDisconnected => 19,
        }
    }

    /// Whether this suspicion points at the primary of an instance,
    /// and should therefore escalate to a view change.
    pub fn is_primary_suspicion(self) -> bool {
        matches!(
            self,
            Suspicion::PprFromNonPrimary
                | Suspicion::DuplicatePprSent
                | Suspicion::PprDigestWrong
                | Suspicion::PprRejectWrong
                | Suspicion::PprStateWrong
                | Suspicion::PprTxnWrong
                | Suspicion::PprTimeWrong
                | Suspicion::PrFromPrimary
                | Suspicion::UnknownPrSent
                | Suspicion::PrimaryDegraded
                | Suspicion::PrimaryDisconnected
                | Suspicion::ViewChangeTimeout
                | Suspicion::PrimaryAboutToBeDisconnected
        )
    }
}

impl fmt::Display for Suspicion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} (code {})", self, self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primary_suspicions_escalate() {
        assert!(Suspicion::DuplicatePprSent.is_primary_suspicion());
        assert!(Suspicion::PrimaryDegraded.is_primary_suspicion());
        assert!(!Suspicion::DuplicatePrSent.is_primary_suspicion());
        assert!(!Suspicion::DuplicateCmSent.is_primary_suspicion());
    }
}
