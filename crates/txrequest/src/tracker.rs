//! The tracker: public operations and the time-driven state pipeline.

use crate::{
    announcement::{
        Announcement, GenTxid, Micros, PeerId, Priority, Sequence, State, TxHash,
        NO_MORE_NONPREFERRED_FIRST, NO_MORE_PREFERRED_FIRST,
    },
    index::{AnnouncementId, AnnouncementIndex, PeerInfo},
    priority::PriorityComputer,
};
use itertools::Itertools;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, trace};

/// Tracks announced transactions and schedules download requests.
///
/// See the [crate docs](crate) for the selection rules. All operations
/// complete synchronously; time only moves when the caller passes `now` to
/// [`get_requestable`](Self::get_requestable).
pub struct TxRequestTracker {
    index: AnnouncementIndex,
    /// Next sequence number to hand out. Bumped once per accepted
    /// announcement, never reset, so announcement order is total even across
    /// clock reversals.
    sequence: Sequence,
}

impl Default for TxRequestTracker {
    fn default() -> Self {
        Self::new()
    }
}

// === impl TxRequestTracker ===

impl TxRequestTracker {
    /// A tracker with a random priority salt.
    pub fn new() -> Self {
        Self { index: AnnouncementIndex::new(PriorityComputer::new()), sequence: 0 }
    }

    /// A tracker whose priority salt is zeroed, making candidate selection
    /// reproducible across runs. Test use.
    pub fn new_deterministic() -> Self {
        Self { index: AnnouncementIndex::new(PriorityComputer::deterministic()), sequence: 0 }
    }

    /// The tracker's priority computer, for ranking candidates externally.
    pub fn priority_computer(&self) -> &PriorityComputer {
        self.index.computer()
    }

    /// Records a transaction announcement from a peer.
    ///
    /// A no-op if an announcement for `(peer, txhash)` already exists, in any
    /// state and under either identifier flavor. The announcement starts out
    /// delayed until `reqtime` is reached. It receives the first marker for
    /// its preference class if the peer is not overloaded, no request for the
    /// txhash has been attempted yet, and the marker for the class has not
    /// been given out before.
    pub fn received_inv(
        &mut self,
        peer: PeerId,
        gtxid: GenTxid,
        preferred: bool,
        overloaded: bool,
        reqtime: Micros,
    ) {
        let txhash = *gtxid.hash();
        if self.index.contains(peer, &txhash) {
            return;
        }

        // The authoritative sticky flags live on the last entry of the group.
        let mut per_txhash =
            self.index.group_last(&txhash).map_or(0, |last| self.index.get(last).per_txhash);

        let mut first = false;
        if !overloaded {
            if preferred && per_txhash & NO_MORE_PREFERRED_FIRST == 0 {
                first = true;
                per_txhash |= NO_MORE_PREFERRED_FIRST;
            } else if !preferred && per_txhash & NO_MORE_NONPREFERRED_FIRST == 0 {
                first = true;
                per_txhash |= NO_MORE_NONPREFERRED_FIRST;
            }
        }

        self.index.insert(Announcement::new(gtxid, peer, preferred, reqtime, self.sequence, first));
        self.sequence += 1;

        // The new entry may or may not have become the last of its group;
        // either way the accumulated flags belong on whichever entry is.
        self.index.or_flags_on_group_last(&txhash, per_txhash);

        trace!(
            target: "txrequest",
            peer,
            txhash = %txhash,
            preferred,
            first,
            reqtime,
            "tracking new announcement"
        );
    }

    /// Drops all state for a disconnected peer.
    ///
    /// Announcements of other peers for the affected txhashes are reselected
    /// as if each of this peer's entries had completed: an in-flight request
    /// frees the selected slot for the best remaining candidate, and groups
    /// left with only completed entries are deleted.
    pub fn deleted_peer(&mut self, peer: PeerId) {
        let members = self.index.peer_members(peer);
        if members.is_empty() {
            return;
        }
        let removed = members.len();

        for id in members {
            // Completing first keeps the per-txhash invariants for the other
            // peers; the group delete inside may already erase the entry.
            if self.make_completed(id) {
                self.index.erase(id);
            }
        }

        debug!(target: "txrequest", peer, removed, "dropped announcements of disconnected peer");
    }

    /// Drops all state for a transaction that is no longer wanted, e.g.
    /// because it was obtained through other means.
    ///
    /// Every announcement for the txhash is erased outright, with no
    /// reselection; the identifier flavor of `gtxid` is ignored.
    pub fn already_have_tx(&mut self, gtxid: GenTxid) {
        let txhash = *gtxid.hash();
        let members = self.index.group_members(&txhash);
        if members.is_empty() {
            return;
        }
        let removed = members.len();

        for id in members {
            self.index.erase(id);
        }

        debug!(target: "txrequest", txhash = %txhash, removed, "dropped no longer wanted transaction");
    }

    /// Records that a peer answered for a txhash, with either the transaction
    /// or a miss.
    ///
    /// The peer's announcement completes, matching on the txhash alone
    /// (either flavor). Unknown `(peer, txhash)` pairs are ignored. When the
    /// transaction itself was acceptable, call
    /// [`already_have_tx`](Self::already_have_tx) instead of (or in addition
    /// to) this.
    pub fn received_response(&mut self, peer: PeerId, gtxid: GenTxid) {
        if let Some(id) = self.index.find(peer, gtxid.hash()) {
            self.make_completed(id);
        }
    }

    /// Marks a previously returned best candidate as requested on the wire,
    /// with `exptime` as the request deadline.
    ///
    /// May only be called for pairs returned by the last
    /// [`get_requestable`](Self::get_requestable) call for the same peer,
    /// with only [`already_have_tx`](Self::already_have_tx) and other
    /// `requested_tx` calls (for different txhashes) in between. Anything
    /// else is a caller bug and panics.
    pub fn requested_tx(&mut self, peer: PeerId, gtxid: GenTxid, exptime: Micros) {
        let txhash = *gtxid.hash();
        let Some(id) = self.index.find_best(peer, &txhash) else {
            panic!("requested_tx for pair not returned by get_requestable: peer {peer}, {txhash}");
        };
        debug_assert_eq!(self.index.get(id).state, State::CandidateBest);

        self.index.modify(id, |a| {
            a.state = State::Requested;
            a.time = exptime;
        });

        // A request has now been attempted: no future announcement in either
        // class may take the first marker for this txhash.
        self.index.or_flags_on_group_last(
            &txhash,
            NO_MORE_PREFERRED_FIRST | NO_MORE_NONPREFERRED_FIRST,
        );

        trace!(target: "txrequest", peer, txhash = %txhash, exptime, "announcement requested");
    }

    /// Advances time to `now` and returns the transactions to request from
    /// `peer`, in announcement order.
    ///
    /// The returned entries stay selected; for each one the caller either
    /// sends a request and reports it via [`requested_tx`](Self::requested_tx)
    /// or leaves it for a later call.
    pub fn get_requestable(&mut self, peer: PeerId, now: Micros) -> Vec<GenTxid> {
        self.set_time_point(now);

        let requestable = self
            .index
            .best_candidates(peer)
            .into_iter()
            .map(|id| {
                let a = self.index.get(id);
                debug_assert_eq!(a.state, State::CandidateBest);
                (a.sequence, a.gtxid())
            })
            .sorted_unstable_by_key(|&(sequence, _)| sequence)
            .map(|(_, gtxid)| gtxid)
            .collect::<Vec<_>>();

        trace!(target: "txrequest", peer, now, count = requestable.len(), "computed requestable set");

        requestable
    }

    /// Number of in-flight requests to a peer.
    pub fn count_in_flight(&self, peer: PeerId) -> usize {
        self.index.in_flight(peer)
    }

    /// Number of announcements tracked for a peer, in any state.
    pub fn count_tracked(&self, peer: PeerId) -> usize {
        self.index.tracked(peer)
    }

    /// Total number of announcements, across all peers and transactions.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Whether nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Turns a delayed candidate whose reqtime has passed into a ready one,
    /// taking the selected slot if it wins it.
    ///
    /// Under by-txhash order the new ready entry lands right behind its
    /// group's selected entry if one exists; inspecting its immediate
    /// predecessor therefore decides the outcome. No selected predecessor
    /// means the slot is free and the entry takes it. A best-candidate
    /// predecessor is challenged on priority; an in-flight predecessor is
    /// left alone.
    fn promote_candidate_new(&mut self, id: AnnouncementId) {
        debug_assert_eq!(self.index.get(id).state, State::CandidateDelayed);

        self.index.modify(id, |a| a.state = State::CandidateReady);

        let pred = self.index.group_pred(id);
        let pred_state = pred.map(|pred| self.index.get(pred).state);
        match (pred, pred_state) {
            // No selected entry for this txhash yet; take the slot.
            (None, _) | (_, Some(State::CandidateDelayed)) => {
                self.index.modify(id, |a| a.state = State::CandidateBest);
            }
            (Some(pred), Some(State::CandidateBest)) => {
                if self.index.priority(id) < self.index.priority(pred) {
                    self.index.modify(pred, |a| a.state = State::CandidateReady);
                    self.index.modify(id, |a| a.state = State::CandidateBest);
                }
            }
            // An in-flight request blocks the slot regardless of priority.
            _ => {}
        }
    }

    /// Moves an entry out of the selected slot into `new_state`, promoting
    /// the best remaining ready candidate into the slot if there is one.
    ///
    /// By-txhash order puts that candidate immediately after the selected
    /// entry, so no search is needed.
    fn change_and_reselect(&mut self, id: AnnouncementId, new_state: State) {
        if self.index.get(id).is_selected() {
            if let Some(succ) = self.index.group_succ(id) {
                if self.index.get(succ).state == State::CandidateReady {
                    self.index.modify(succ, |a| a.state = State::CandidateBest);
                }
            }
        }
        self.index.modify(id, |a| a.state = new_state);
        debug_assert!(!self.index.get(id).is_selected());
    }

    /// Completes an entry, reselecting or garbage-collecting its group as
    /// needed. Returns whether the entry still exists afterwards.
    ///
    /// When completing would leave the group with completed entries only,
    /// the whole group is erased instead: such a group can never produce a
    /// request again and would only pin memory.
    fn make_completed(&mut self, id: AnnouncementId) -> bool {
        if self.index.get(id).state == State::Completed {
            return true;
        }

        // First of its group, and everything after it already completed
        // (completed entries sort last)?
        let first_of_group = self.index.group_pred(id).is_none();
        let rest_completed = self
            .index
            .group_succ(id)
            .map_or(true, |succ| self.index.get(succ).state == State::Completed);
        if first_of_group && rest_completed {
            let txhash = self.index.get(id).txhash;
            for member in self.index.group_members(&txhash) {
                self.index.erase(member);
            }
            return false;
        }

        self.change_and_reselect(id, State::Completed);
        true
    }

    /// Brings every announcement in line with `now`.
    ///
    /// Forward over the by-time order: delayed candidates whose reqtime has
    /// passed become ready (or best), in-flight requests past their deadline
    /// complete. Backward: if the clock ran backwards, ready and best
    /// entries with a reqtime in the future fall back to delayed.
    fn set_time_point(&mut self, now: Micros) {
        loop {
            let Some(id) = self.index.time_first() else { break };
            let (state, time) = {
                let a = self.index.get(id);
                (a.state, a.time)
            };
            match state {
                State::CandidateDelayed if time <= now => self.promote_candidate_new(id),
                State::Requested if time <= now => {
                    let a = self.index.get(id);
                    trace!(
                        target: "txrequest",
                        peer = a.peer,
                        txhash = %a.txhash,
                        exptime = a.time,
                        "request expired"
                    );
                    self.make_completed(id);
                }
                _ => break,
            }
        }

        loop {
            let Some(id) = self.index.time_last() else { break };
            let a = self.index.get(id);
            if a.is_selectable() && a.time > now {
                self.change_and_reselect(id, State::CandidateDelayed);
            } else {
                break;
            }
        }
    }

    /// Aborts if any structural invariant is violated. Test use.
    pub fn sanity_check(&self) {
        self.index.assert_coherent();

        // Recompute the per-peer counters from scratch; this also catches
        // stale zero-count rows.
        let mut peer_info: HashMap<PeerId, PeerInfo> = HashMap::new();
        for (_, a) in self.index.iter() {
            let info = peer_info.entry(a.peer).or_default();
            info.total += 1;
            info.requested += usize::from(a.state == State::Requested);
        }
        assert_eq!(&peer_info, self.index.peer_info());

        #[derive(Default)]
        struct Counts {
            delayed: usize,
            ready: usize,
            best: usize,
            requested: usize,
            completed: usize,
            best_priority: Priority,
            min_ready_priority: Priority,
            peers: Vec<PeerId>,
            any_preferred_first: bool,
            any_nonpreferred_first: bool,
            or_all_flags: u8,
        }

        let mut table: BTreeMap<TxHash, Counts> = BTreeMap::new();
        for (id, a) in self.index.iter() {
            let counts = table.entry(a.txhash).or_insert_with(|| Counts {
                min_ready_priority: Priority::MAX,
                ..Default::default()
            });
            match a.state {
                State::CandidateDelayed => counts.delayed += 1,
                State::CandidateReady => {
                    counts.ready += 1;
                    counts.min_ready_priority =
                        counts.min_ready_priority.min(self.index.priority(id));
                }
                State::CandidateBest => {
                    counts.best += 1;
                    counts.best_priority = self.index.priority(id);
                }
                State::Requested => counts.requested += 1,
                State::Completed => counts.completed += 1,
            }
            counts.peers.push(a.peer);
            counts.any_preferred_first |= a.first && a.preferred;
            counts.any_nonpreferred_first |= a.first && !a.preferred;
            counts.or_all_flags |= a.per_txhash;
        }

        for (txhash, counts) in table {
            // A group of only completed entries should have been deleted.
            assert!(counts.delayed + counts.ready + counts.best + counts.requested > 0);
            // At most one selected entry per txhash.
            assert!(counts.best + counts.requested <= 1);
            // Ready entries imply a selected one...
            if counts.ready > 0 {
                assert_eq!(counts.best + counts.requested, 1);
            }
            // ...and a best candidate must outrank all of them.
            if counts.ready > 0 && counts.best > 0 {
                assert!(counts.best_priority <= counts.min_ready_priority);
            }
            // No duplicate (peer, txhash) pairs.
            let mut peers = counts.peers;
            let group_size = peers.len();
            peers.sort_unstable();
            peers.dedup();
            assert_eq!(peers.len(), group_size);

            // Sticky flags: history implies at least these bits somewhere in
            // the group (completion or deletion of the entries that set them
            // may have left more bits than history now shows)...
            let mut expected = 0;
            if counts.any_preferred_first || counts.requested > 0 {
                expected |= NO_MORE_PREFERRED_FIRST;
            }
            if counts.any_nonpreferred_first || counts.requested > 0 {
                expected |= NO_MORE_NONPREFERRED_FIRST;
            }
            assert_eq!(expected & !counts.or_all_flags, 0);
            // ...and the last entry of the group carries the OR of them all.
            let last = self.index.group_last(&txhash).expect("group is non-empty");
            assert_eq!(self.index.get(last).per_txhash, counts.or_all_flags);
        }
    }

    /// Aborts if any announcement's state disagrees with `now`. Only
    /// expected to hold right after a
    /// [`get_requestable`](Self::get_requestable) call for the same `now`.
    /// Test use.
    pub fn time_sanity_check(&self, now: Micros) {
        for (_, a) in self.index.iter() {
            if a.is_waiting() {
                // Should have become ready/completed by now otherwise.
                assert!(a.time > now);
            } else if a.is_selectable() {
                // Should have fallen back to delayed otherwise.
                assert!(a.time <= now);
            }
        }
    }
}
