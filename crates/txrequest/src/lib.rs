#![warn(missing_docs, unreachable_pub)]
#![deny(unused_must_use, rust_2018_idioms)]
#![doc(test(
    no_crate_inject,
    attr(deny(warnings, rust_2018_idioms), allow(dead_code, unused_variables))
))]

//! Scheduler for downloading announced transactions from gossip peers.
//!
//! Peers announce transactions by hash; fetching the corresponding bodies is
//! deferred and coordinated by the [`TxRequestTracker`]. It records one
//! announcement per `(peer, txhash)` pair and decides, for every txhash,
//! which peer to request it from and when, subject to these rules:
//!
//! - At most one request per txhash is in flight at any time. A second peer is
//!   only tried after the first request timed out or the peer answered with a
//!   miss. This avoids spending bandwidth on duplicate copies of the same
//!   transaction.
//!
//! - A transaction is never requested twice from the same peer, unless all
//!   tracking for it was dropped in between and the peer re-announced it.
//!   Re-announcements otherwise would let a peer bias request assignment in
//!   its favor.
//!
//! - Announcements are only forgotten when the announcing peer disconnects,
//!   when the transaction is obtained, or when every candidate peer has been
//!   tried and failed. As long as untried candidates remain, failed ones are
//!   remembered so they are not asked again.
//!
//! - A request to a peer is not sent before the caller-chosen `reqtime` for
//!   that announcement. Callers use this to delay requests to peers they
//!   trust less, giving better peers a head start.
//!
//! - When several peers are eligible for the same txhash, *preferred* peers
//!   (a caller-set flag, typically outbound connections) always win over
//!   non-preferred ones. Within a class, the peer holding the *first* marker
//!   wins if one exists; otherwise the tie is broken by a salted hash of
//!   `(txhash, peer)` that an attacker cannot predict.
//!
//! The first marker is handed to at most one announcement per txhash and
//! preference class: the earliest one whose peer was not flagged as
//! overloaded, provided no request for the txhash had been attempted yet. It
//! is a one-shot latency bet on the fastest announcer; once a request has
//! been sent, no later announcement can obtain it.
//!
//! Time never advances on its own: every [`TxRequestTracker::get_requestable`]
//! call carries `now`, and all reqtime/exptime processing happens at that
//! point. The tracker performs no I/O, holds no locks, and spawns nothing;
//! callers that share it across threads wrap it in their own mutex.
//!
//! # Example
//!
//! ```
//! use txrequest::{GenTxid, TxRequestTracker};
//! use alloy_primitives::B256;
//!
//! let mut tracker = TxRequestTracker::new();
//! let wtxid = GenTxid::Wtxid(B256::repeat_byte(0xab));
//!
//! // Peer 7 announces; we may ask it from time 5_000 on.
//! tracker.received_inv(7, wtxid, true, false, 5_000);
//!
//! // Later, ask what to request from peer 7.
//! for gtxid in tracker.get_requestable(7, 6_000) {
//!     // send the request on the wire, then:
//!     tracker.requested_tx(7, gtxid, 6_000 + 60_000_000);
//! }
//! ```

mod announcement;
mod index;
mod priority;
mod tracker;

pub use announcement::{GenTxid, Micros, PeerId, Priority, Sequence, TxHash};
pub use priority::PriorityComputer;
pub use tracker::TxRequestTracker;
