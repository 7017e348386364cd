//! Sequence numbers, views, and the total order imposed on
//! three-phase protocol batches.

use std::cmp::Ordering;
use std::fmt;

use either::{Either, Left, Right};

#[cfg(feature = "serialize_serde")]
use serde::{Deserialize, Serialize};

/// Represents the number of a view, i.e. an epoch with a fixed
/// primary assignment across all protocol instances.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Debug, Default, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash)]
#[repr(transparent)]
pub struct ViewNo(u64);

/// Represents the sequence number attributed to a batch of client
/// requests by the primary of a protocol instance.
///
/// Sequence numbers restart at one in every new view.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Debug, Default, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash)]
#[repr(transparent)]
pub struct SeqNo(u64);

/// Identifies a batch within the whole protocol history: the pair of
/// the view it was proposed in and its sequence number in that view.
///
/// Keys compare lexicographically, view first.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Debug, Default, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash)]
pub struct ThreePhaseKey {
    pub view_no: ViewNo,
    pub pp_seq_no: SeqNo,
}

pub(crate) enum InvalidSeqNo {
    Old,
    Big,
}

impl From<u64> for ViewNo {
    #[inline]
    fn from(view: u64) -> ViewNo {
        ViewNo(view)
    }
}

impl From<ViewNo> for u64 {
    #[inline]
    fn from(view: ViewNo) -> u64 {
        view.0
    }
}

impl ViewNo {
    pub const ZERO: Self = ViewNo(0);

    /// Returns the following view number.
    #[inline]
    pub fn next(self) -> ViewNo {
        ViewNo(self.0 + 1)
    }

    /// Rank of the master primary for this view, over a registry
    /// of `n` validators.
    #[inline]
    pub fn primary_rank(self, n: usize) -> usize {
        (self.0 % n as u64) as usize
    }
}

impl From<u64> for SeqNo {
    #[inline]
    fn from(seq: u64) -> SeqNo {
        SeqNo(seq)
    }
}

impl From<SeqNo> for u64 {
    #[inline]
    fn from(seq: SeqNo) -> u64 {
        seq.0
    }
}

impl SeqNo {
    pub const ZERO: Self = SeqNo(0);
    pub const ONE: Self = SeqNo(1);

    /// Returns the following sequence number.
    #[inline]
    pub fn next(self) -> SeqNo {
        SeqNo(self.0 + 1)
    }

    /// Returns the preceding sequence number, saturating at zero.
    #[inline]
    pub fn prev(self) -> SeqNo {
        SeqNo(self.0.saturating_sub(1))
    }

    /// Return the offset of `self` relative to `other`, to index a
    /// windowed container such as the watermark stash.
    ///
    /// Sequence numbers below `other`, or further ahead of it than
    /// `window`, are reported as invalid, which protects the stashes
    /// from a malicious node flooding them with far-future messages.
    #[inline]
    pub(crate) fn index(self, other: SeqNo, window: u64) -> Either<InvalidSeqNo, usize> {
        if self.0 <= other.0 {
            return Left(InvalidSeqNo::Old);
        }
        let index = self.0 - other.0 - 1;
        if index > window + (window >> 1) {
            Left(InvalidSeqNo::Big)
        } else {
            Right(index as usize)
        }
    }
}

impl fmt::Display for ViewNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for SeqNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl ThreePhaseKey {
    pub const ZERO: Self = ThreePhaseKey {
        view_no: ViewNo::ZERO,
        pp_seq_no: SeqNo::ZERO,
    };

    /// Creates a new key from raw view and sequence numbers.
    pub fn new<V: Into<ViewNo>, S: Into<SeqNo>>(view_no: V, pp_seq_no: S) -> Self {
        Self {
            view_no: view_no.into(),
            pp_seq_no: pp_seq_no.into(),
        }
    }

    /// The key of the batch preceding this one within the same view.
    pub fn prev_in_view(self) -> Self {
        Self {
            view_no: self.view_no,
            pp_seq_no: self.pp_seq_no.prev(),
        }
    }
}

impl fmt::Display for ThreePhaseKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.view_no, self.pp_seq_no)
    }
}

/// Types which are identified by a sequence number.
pub trait Orderable {
    /// Returns the sequence number of this value.
    fn sequence_number(&self) -> SeqNo;
}

/// Compare two optional three-phase keys, treating `None` as the
/// smallest possible key. Used when peers report the last batch they
/// have ordered, which may be no batch at all.
pub fn compare_3pc_keys(a: Option<ThreePhaseKey>, b: Option<ThreePhaseKey>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => a.cmp(&b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn three_phase_keys_order_lexicographically() {
        let a = ThreePhaseKey::new(0u64, 10u64);
        let b = ThreePhaseKey::new(1u64, 1u64);
        let c = ThreePhaseKey::new(1u64, 2u64);
        assert!(a < b);
        assert!(b < c);
        assert_eq!(b, ThreePhaseKey::new(1u64, 1u64));
    }

    #[test]
    fn index_rejects_old_and_far_future_seq_nos() {
        let h = SeqNo::from(10);
        assert!(SeqNo::from(5).index(h, 300).is_left());
        assert!(SeqNo::from(10).index(h, 300).is_left());
        assert_eq!(SeqNo::from(11).index(h, 300).right(), Some(0));
        assert_eq!(SeqNo::from(300).index(h, 300).right(), Some(289));
        assert!(SeqNo::from(10_000).index(h, 300).is_left());
    }

    #[test]
    fn none_compares_below_any_key() {
        let key = ThreePhaseKey::new(0u64, 1u64);
        assert_eq!(compare_3pc_keys(None, Some(key)), Ordering::Less);
        assert_eq!(compare_3pc_keys(Some(key), Some(key)), Ordering::Equal);
    }
}
