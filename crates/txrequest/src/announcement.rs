//! The per-`(peer, txhash)` announcement record and its state machine.

use alloy_primitives::B256;
use derive_more::Display;

/// A transaction hash, in either identifier flavor.
pub type TxHash = B256;

/// Opaque peer identifier assigned by the caller.
pub type PeerId = u64;

/// Microsecond timestamp. Reqtimes, exptimes and `now` all share one
/// caller-chosen epoch; the tracker only ever compares them.
pub type Micros = u64;

/// Announcement priority as produced by
/// [`PriorityComputer`](crate::PriorityComputer). Lower is better.
pub type Priority = u64;

/// Monotonic announcement counter, used to report requestable transactions in
/// announcement order.
pub type Sequence = u64;

/// A transaction identifier as it appears in an announcement: the same 32-byte
/// hash space carries two flavors, and the flavor a peer announced with is
/// echoed back to the caller when the request is scheduled.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum GenTxid {
    /// Identifier over the transaction without witness data.
    Txid(TxHash),
    /// Identifier over the full transaction.
    Wtxid(TxHash),
}

impl GenTxid {
    /// Returns the underlying hash, regardless of flavor.
    pub const fn hash(&self) -> &TxHash {
        match self {
            Self::Txid(hash) | Self::Wtxid(hash) => hash,
        }
    }

    /// Whether this is the witness flavor.
    pub const fn is_wtxid(&self) -> bool {
        matches!(self, Self::Wtxid(_))
    }

    pub(crate) const fn from_parts(is_wtxid: bool, hash: TxHash) -> Self {
        if is_wtxid {
            Self::Wtxid(hash)
        } else {
            Self::Txid(hash)
        }
    }
}

/// State of an announcement.
///
/// The declaration order is load-bearing: it is the sort rank used by the
/// by-txhash ordering, which keeps a txhash's entries grouped as DELAYED,
/// then the selected entry (BEST or REQUESTED), then READY by ascending
/// priority, then COMPLETED. The selection algorithms read their neighbors
/// under exactly this order.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) enum State {
    /// Candidate whose reqtime has not been reached.
    #[display(fmt = "candidate-delayed")]
    CandidateDelayed,
    /// The candidate that will be handed out for its txhash. At most one per
    /// txhash, and only while no request is in flight.
    #[display(fmt = "candidate-best")]
    CandidateBest,
    /// Request in flight; `time` holds the expiry deadline.
    #[display(fmt = "requested")]
    Requested,
    /// Eligible candidate that lost selection to a better one.
    #[display(fmt = "candidate-ready")]
    CandidateReady,
    /// Tried and failed (timeout or miss). Kept only to block re-requesting
    /// from the same peer.
    #[display(fmt = "completed")]
    Completed,
}

/// Flag bit: no later preferred announcement for the txhash may take the
/// first marker.
pub(crate) const NO_MORE_PREFERRED_FIRST: u8 = 1 << 0;
/// Flag bit: no later non-preferred announcement for the txhash may take the
/// first marker.
pub(crate) const NO_MORE_NONPREFERRED_FIRST: u8 = 1 << 1;

/// One tracked `(peer, txhash)` pair.
///
/// `txhash`, `peer`, `is_wtxid`, `sequence`, `preferred` and `first` are fixed
/// at creation; only `state`, `time` and `per_txhash` change afterwards.
#[derive(Clone, Debug)]
pub(crate) struct Announcement {
    /// Hash the peer announced.
    pub(crate) txhash: TxHash,
    /// Identifier flavor the peer announced with.
    pub(crate) is_wtxid: bool,
    /// The announcing peer.
    pub(crate) peer: PeerId,
    /// Reqtime while a candidate, exptime while requested, meaningless once
    /// completed.
    pub(crate) time: Micros,
    /// Position in global announcement order.
    pub(crate) sequence: Sequence,
    /// Whether the peer is preferred by the caller.
    pub(crate) preferred: bool,
    /// Whether this announcement holds the first marker for its class.
    pub(crate) first: bool,
    /// Current scheduling state.
    pub(crate) state: State,
    /// Sticky per-txhash flag bits. Authoritative only on the last entry of
    /// the txhash group in by-txhash order; any other entry carries a subset.
    pub(crate) per_txhash: u8,
}

impl Announcement {
    pub(crate) fn new(
        gtxid: GenTxid,
        peer: PeerId,
        preferred: bool,
        reqtime: Micros,
        sequence: Sequence,
        first: bool,
    ) -> Self {
        Self {
            txhash: *gtxid.hash(),
            is_wtxid: gtxid.is_wtxid(),
            peer,
            time: reqtime,
            sequence,
            preferred,
            first,
            state: State::CandidateDelayed,
            per_txhash: 0,
        }
    }

    pub(crate) const fn gtxid(&self) -> GenTxid {
        GenTxid::from_parts(self.is_wtxid, self.txhash)
    }

    /// Whether this entry occupies its txhash's single selected slot.
    pub(crate) fn is_selected(&self) -> bool {
        matches!(self.state, State::CandidateBest | State::Requested)
    }

    /// Whether this entry is waiting for a point in time (reqtime or exptime).
    pub(crate) fn is_waiting(&self) -> bool {
        matches!(self.state, State::Requested | State::CandidateDelayed)
    }

    /// Whether this entry could take the selected slot if it frees up.
    pub(crate) fn is_selectable(&self) -> bool {
        matches!(self.state, State::CandidateReady | State::CandidateBest)
    }

    /// Class for the by-time ordering: waiting entries come first so the
    /// forward sweep of the time pipeline only ever inspects them, completed
    /// entries next, selectable entries last so the backward sweep only ever
    /// inspects those.
    pub(crate) fn time_class(&self) -> u8 {
        if self.is_waiting() {
            0
        } else if self.is_selectable() {
            2
        } else {
            1
        }
    }
}
