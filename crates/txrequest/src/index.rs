//! Arena storage and the three ordered views over the announcement set.
//!
//! Announcements live in a [`Slab`]; the orderings are kept as `BTreeMap`/
//! `BTreeSet` keyed by the sort fields plus the arena id, which makes the
//! non-unique orderings total. Every mutation goes through [`insert`],
//! [`modify`] or [`erase`] below, which keep all three views, the per-peer
//! counters, and the sticky per-txhash flags in sync.
//!
//! [`insert`]: AnnouncementIndex::insert
//! [`modify`]: AnnouncementIndex::modify
//! [`erase`]: AnnouncementIndex::erase

use crate::{
    announcement::{Announcement, Micros, PeerId, Priority, State, TxHash},
    priority::PriorityComputer,
};
use slab::Slab;
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    ops::Bound,
};

/// Stable handle of an announcement in the arena.
///
/// Ids participate as the final component of the ordering keys, so they must
/// not be reused while any key referencing them is live; the wrappers below
/// remove all keys before freeing a slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct AnnouncementId(usize);

impl AnnouncementId {
    const MIN: Self = Self(0);
    const MAX: Self = Self(usize::MAX);
}

const TXHASH_MAX: TxHash = TxHash::repeat_byte(0xff);

/// Ordering key of the unique by-peer view: `(peer, is best candidate,
/// txhash)`. Grouping the selected candidates per peer lets
/// `get_requestable` walk exactly the requestable set without scanning the
/// peer's delayed or completed entries.
type ByPeerKey = (PeerId, bool, TxHash);

/// Ordering key of the by-txhash view: `(txhash, state rank, priority)`.
/// Within one txhash this yields delayed entries, then the selected entry,
/// then ready entries best-first, then completed ones; the promotion and
/// reselection logic reads its immediate neighbors under this order.
type ByTxHashKey = (TxHash, State, Priority, AnnouncementId);

/// Ordering key of the by-time view: `(time class, time)`. Waiting entries
/// (class 0) are swept forward from the oldest, selectable entries (class 2)
/// backward from the newest; completed entries (class 1) sit in between and
/// are never visited by either sweep.
type ByTimeKey = (u8, Micros, AnnouncementId);

/// Per-peer accounting, kept incrementally so the count accessors are O(1).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct PeerInfo {
    /// Number of announcements for this peer.
    pub(crate) total: usize,
    /// Number of those in the requested state.
    pub(crate) requested: usize,
}

/// The announcement set with its three orderings and per-peer counters.
pub(crate) struct AnnouncementIndex {
    computer: PriorityComputer,
    arena: Slab<Announcement>,
    by_peer: BTreeMap<ByPeerKey, AnnouncementId>,
    by_txhash: BTreeSet<ByTxHashKey>,
    by_time: BTreeSet<ByTimeKey>,
    peer_info: HashMap<PeerId, PeerInfo>,
}

// === impl AnnouncementIndex ===

impl AnnouncementIndex {
    pub(crate) fn new(computer: PriorityComputer) -> Self {
        Self {
            computer,
            arena: Slab::new(),
            by_peer: BTreeMap::new(),
            by_txhash: BTreeSet::new(),
            by_time: BTreeSet::new(),
            peer_info: HashMap::new(),
        }
    }

    pub(crate) fn computer(&self) -> &PriorityComputer {
        &self.computer
    }

    pub(crate) fn len(&self) -> usize {
        self.arena.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }

    pub(crate) fn get(&self, id: AnnouncementId) -> &Announcement {
        &self.arena[id.0]
    }

    /// Iterates over all announcements, in no particular order.
    pub(crate) fn iter(&self) -> impl Iterator<Item = (AnnouncementId, &Announcement)> + '_ {
        self.arena.iter().map(|(slot, announcement)| (AnnouncementId(slot), announcement))
    }

    /// Priority of an announcement under this index's salt.
    pub(crate) fn priority(&self, id: AnnouncementId) -> Priority {
        let a = self.get(id);
        self.computer.compute(&a.txhash, a.peer, a.preferred, a.first)
    }

    pub(crate) fn tracked(&self, peer: PeerId) -> usize {
        self.peer_info.get(&peer).map_or(0, |info| info.total)
    }

    pub(crate) fn in_flight(&self, peer: PeerId) -> usize {
        self.peer_info.get(&peer).map_or(0, |info| info.requested)
    }

    pub(crate) fn peer_info(&self) -> &HashMap<PeerId, PeerInfo> {
        &self.peer_info
    }

    /// Looks up the announcement for `(peer, txhash)`, probing both by-peer
    /// buckets.
    pub(crate) fn find(&self, peer: PeerId, txhash: &TxHash) -> Option<AnnouncementId> {
        self.by_peer
            .get(&(peer, false, *txhash))
            .or_else(|| self.by_peer.get(&(peer, true, *txhash)))
            .copied()
    }

    /// Looks up the best-candidate entry for `(peer, txhash)`, if the peer's
    /// announcement currently is one.
    pub(crate) fn find_best(&self, peer: PeerId, txhash: &TxHash) -> Option<AnnouncementId> {
        self.by_peer.get(&(peer, true, *txhash)).copied()
    }

    pub(crate) fn contains(&self, peer: PeerId, txhash: &TxHash) -> bool {
        self.find(peer, txhash).is_some()
    }

    /// All announcements of one peer, in by-peer order.
    pub(crate) fn peer_members(&self, peer: PeerId) -> Vec<AnnouncementId> {
        self.by_peer
            .range((peer, false, TxHash::ZERO)..=(peer, true, TXHASH_MAX))
            .map(|(_, id)| *id)
            .collect()
    }

    /// The peer's best-candidate entries, in by-peer order.
    pub(crate) fn best_candidates(&self, peer: PeerId) -> Vec<AnnouncementId> {
        self.by_peer
            .range((peer, true, TxHash::ZERO)..=(peer, true, TXHASH_MAX))
            .map(|(_, id)| *id)
            .collect()
    }

    /// All announcements for one txhash, in by-txhash order.
    pub(crate) fn group_members(&self, txhash: &TxHash) -> Vec<AnnouncementId> {
        self.by_txhash.range(Self::group_range(txhash)).map(|&(.., id)| id).collect()
    }

    /// The last announcement for one txhash in by-txhash order, the one that
    /// carries the authoritative sticky flags.
    pub(crate) fn group_last(&self, txhash: &TxHash) -> Option<AnnouncementId> {
        self.by_txhash.range(Self::group_range(txhash)).next_back().map(|&(.., id)| id)
    }

    /// The announcement immediately preceding `id` in by-txhash order, if it
    /// belongs to the same txhash.
    pub(crate) fn group_pred(&self, id: AnnouncementId) -> Option<AnnouncementId> {
        let a = self.get(id);
        let key = Self::txhash_key(&self.computer, id, a);
        self.by_txhash
            .range(..key)
            .next_back()
            .and_then(|&(txhash, .., pred)| (txhash == a.txhash).then_some(pred))
    }

    /// The announcement immediately following `id` in by-txhash order, if it
    /// belongs to the same txhash.
    pub(crate) fn group_succ(&self, id: AnnouncementId) -> Option<AnnouncementId> {
        let a = self.get(id);
        let key = Self::txhash_key(&self.computer, id, a);
        self.by_txhash
            .range((Bound::Excluded(key), Bound::Unbounded))
            .next()
            .and_then(|&(txhash, .., succ)| (txhash == a.txhash).then_some(succ))
    }

    /// The oldest entry in by-time order.
    pub(crate) fn time_first(&self) -> Option<AnnouncementId> {
        self.by_time.iter().next().map(|&(.., id)| id)
    }

    /// The newest entry in by-time order.
    pub(crate) fn time_last(&self) -> Option<AnnouncementId> {
        self.by_time.iter().next_back().map(|&(.., id)| id)
    }

    /// ORs flag bits into the last entry of a txhash group, where the
    /// authoritative value lives, without reindexing; the flags do not
    /// participate in any ordering key. No-op when the group is empty.
    pub(crate) fn or_flags_on_group_last(&mut self, txhash: &TxHash, flags: u8) {
        if let Some(last) = self.group_last(txhash) {
            self.arena[last.0].per_txhash |= flags;
        }
    }

    /// Adds a freshly created announcement. The caller must have ruled out a
    /// duplicate `(peer, txhash)` beforehand.
    pub(crate) fn insert(&mut self, announcement: Announcement) -> AnnouncementId {
        debug_assert_eq!(announcement.state, State::CandidateDelayed);
        let peer = announcement.peer;

        let id = AnnouncementId(self.arena.insert(announcement));
        let (peer_key, txhash_key, time_key) = {
            let a = &self.arena[id.0];
            (Self::peer_key(a), Self::txhash_key(&self.computer, id, a), Self::time_key(id, a))
        };

        let _replaced = self.by_peer.insert(peer_key, id);
        debug_assert!(_replaced.is_none());
        let _was_inserted = self.by_txhash.insert(txhash_key);
        debug_assert!(_was_inserted);
        let _was_inserted = self.by_time.insert(time_key);
        debug_assert!(_was_inserted);

        self.peer_info.entry(peer).or_default().total += 1;

        id
    }

    /// Removes an announcement from the arena and all three views.
    ///
    /// If the entry is the last of its txhash group, its sticky flags are
    /// first ORed into its predecessor, which becomes the new last.
    pub(crate) fn erase(&mut self, id: AnnouncementId) {
        let (peer, was_requested) = {
            let a = &self.arena[id.0];
            (a.peer, a.state == State::Requested)
        };
        let info = self.peer_info.get_mut(&peer).expect("peer accounting out of sync");
        info.requested -= usize::from(was_requested);
        info.total -= 1;
        if info.total == 0 {
            self.peer_info.remove(&peer);
        }

        if let Some(pred) = self.group_pred(id) {
            let flags = self.arena[id.0].per_txhash;
            self.arena[pred.0].per_txhash |= flags;
        }

        let (peer_key, txhash_key, time_key) = {
            let a = &self.arena[id.0];
            (Self::peer_key(a), Self::txhash_key(&self.computer, id, a), Self::time_key(id, a))
        };
        let _removed = self.by_peer.remove(&peer_key);
        debug_assert_eq!(_removed, Some(id));
        let _was_removed = self.by_txhash.remove(&txhash_key);
        debug_assert!(_was_removed);
        let _was_removed = self.by_time.remove(&time_key);
        debug_assert!(_was_removed);

        self.arena.remove(id.0);
    }

    /// Mutates an announcement in place and reindexes it.
    ///
    /// The sticky-flag bracketing happens around the mutation: the entry's
    /// flags are pushed into its predecessor beforehand (the entry may stop
    /// being the last of its group), and the predecessor's flags are pulled
    /// into the entry afterwards (it may have become the last).
    pub(crate) fn modify(&mut self, id: AnnouncementId, f: impl FnOnce(&mut Announcement)) {
        let (peer, was_requested) = {
            let a = &self.arena[id.0];
            (a.peer, a.state == State::Requested)
        };
        self.peer_info.get_mut(&peer).expect("peer accounting out of sync").requested -=
            usize::from(was_requested);

        if let Some(pred) = self.group_pred(id) {
            let flags = self.arena[id.0].per_txhash;
            self.arena[pred.0].per_txhash |= flags;
        }

        let (peer_key, txhash_key, time_key) = {
            let a = &self.arena[id.0];
            (Self::peer_key(a), Self::txhash_key(&self.computer, id, a), Self::time_key(id, a))
        };
        let _removed = self.by_peer.remove(&peer_key);
        debug_assert_eq!(_removed, Some(id));
        let _was_removed = self.by_txhash.remove(&txhash_key);
        debug_assert!(_was_removed);
        let _was_removed = self.by_time.remove(&time_key);
        debug_assert!(_was_removed);

        f(&mut self.arena[id.0]);

        let (peer_key, txhash_key, time_key) = {
            let a = &self.arena[id.0];
            (Self::peer_key(a), Self::txhash_key(&self.computer, id, a), Self::time_key(id, a))
        };
        let _replaced = self.by_peer.insert(peer_key, id);
        debug_assert!(_replaced.is_none());
        let _was_inserted = self.by_txhash.insert(txhash_key);
        debug_assert!(_was_inserted);
        let _was_inserted = self.by_time.insert(time_key);
        debug_assert!(_was_inserted);

        if let Some(pred) = self.group_pred(id) {
            let flags = self.arena[pred.0].per_txhash;
            self.arena[id.0].per_txhash |= flags;
        }

        let now_requested = self.arena[id.0].state == State::Requested;
        self.peer_info.get_mut(&peer).expect("peer accounting out of sync").requested +=
            usize::from(now_requested);
    }

    /// Asserts that the arena and the three views agree. Test use, via
    /// `TxRequestTracker::sanity_check`.
    pub(crate) fn assert_coherent(&self) {
        assert_eq!(self.arena.len(), self.by_peer.len());
        assert_eq!(self.arena.len(), self.by_txhash.len());
        assert_eq!(self.arena.len(), self.by_time.len());
        for (slot, a) in self.arena.iter() {
            let id = AnnouncementId(slot);
            assert_eq!(self.by_peer.get(&Self::peer_key(a)), Some(&id));
            assert!(self.by_txhash.contains(&Self::txhash_key(&self.computer, id, a)));
            assert!(self.by_time.contains(&Self::time_key(id, a)));
        }
    }

    fn group_range(
        txhash: &TxHash,
    ) -> std::ops::RangeInclusive<(TxHash, State, Priority, AnnouncementId)> {
        (*txhash, State::CandidateDelayed, 0, AnnouncementId::MIN)..=
            (*txhash, State::Completed, Priority::MAX, AnnouncementId::MAX)
    }

    fn peer_key(a: &Announcement) -> ByPeerKey {
        (a.peer, a.state == State::CandidateBest, a.txhash)
    }

    fn txhash_key(computer: &PriorityComputer, id: AnnouncementId, a: &Announcement) -> ByTxHashKey {
        let priority = if a.state == State::CandidateReady {
            computer.compute(&a.txhash, a.peer, a.preferred, a.first)
        } else {
            0
        };
        (a.txhash, a.state, priority, id)
    }

    fn time_key(id: AnnouncementId, a: &Announcement) -> ByTimeKey {
        (a.time_class(), a.time, id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::announcement::{GenTxid, NO_MORE_PREFERRED_FIRST};

    fn index() -> AnnouncementIndex {
        AnnouncementIndex::new(PriorityComputer::deterministic())
    }

    fn announce(index: &mut AnnouncementIndex, peer: PeerId, hash: u8, seq: u64) -> AnnouncementId {
        let gtxid = GenTxid::Wtxid(TxHash::repeat_byte(hash));
        index.insert(Announcement::new(gtxid, peer, false, 100, seq, false))
    }

    #[test]
    fn insert_and_erase_keep_counters() {
        let mut index = index();
        let a = announce(&mut index, 1, 0x11, 0);
        let b = announce(&mut index, 1, 0x22, 1);
        let c = announce(&mut index, 2, 0x11, 2);

        assert_eq!(index.len(), 3);
        assert_eq!(index.tracked(1), 2);
        assert_eq!(index.tracked(2), 1);
        assert_eq!(index.in_flight(1), 0);
        index.assert_coherent();

        index.erase(a);
        index.erase(b);
        assert_eq!(index.tracked(1), 0);
        assert!(index.peer_info().get(&1).is_none());
        index.assert_coherent();

        index.erase(c);
        assert!(index.is_empty());
    }

    #[test]
    fn modify_tracks_requested_count() {
        let mut index = index();
        let id = announce(&mut index, 7, 0x33, 0);

        index.modify(id, |a| a.state = State::CandidateBest);
        assert_eq!(index.in_flight(7), 0);
        assert!(index.find_best(7, &TxHash::repeat_byte(0x33)).is_some());

        index.modify(id, |a| {
            a.state = State::Requested;
            a.time = 500;
        });
        assert_eq!(index.in_flight(7), 1);
        assert!(index.find_best(7, &TxHash::repeat_byte(0x33)).is_none());
        assert!(index.find(7, &TxHash::repeat_byte(0x33)).is_some());
        index.assert_coherent();
    }

    #[test]
    fn group_order_follows_state_rank() {
        let mut index = index();
        let hash = TxHash::repeat_byte(0x44);
        let delayed = announce(&mut index, 1, 0x44, 0);
        let best = announce(&mut index, 2, 0x44, 1);
        let completed = announce(&mut index, 3, 0x44, 2);
        index.modify(best, |a| a.state = State::CandidateBest);
        index.modify(completed, |a| a.state = State::Completed);

        assert_eq!(index.group_members(&hash), vec![delayed, best, completed]);
        assert_eq!(index.group_last(&hash), Some(completed));
        assert_eq!(index.group_pred(best), Some(delayed));
        assert_eq!(index.group_succ(best), Some(completed));
        assert_eq!(index.group_pred(delayed), None);
        assert_eq!(index.group_succ(completed), None);
    }

    #[test]
    fn erase_propagates_flags_to_new_last() {
        let mut index = index();
        let hash = TxHash::repeat_byte(0x55);
        let first = announce(&mut index, 1, 0x55, 0);
        let last = announce(&mut index, 2, 0x55, 1);
        index.modify(last, |a| a.state = State::Completed);
        index.or_flags_on_group_last(&hash, NO_MORE_PREFERRED_FIRST);
        assert_eq!(index.get(first).per_txhash, 0);

        index.erase(last);
        assert_eq!(index.group_last(&hash), Some(first));
        assert_eq!(index.get(first).per_txhash, NO_MORE_PREFERRED_FIRST);
    }

    #[test]
    fn time_order_groups_waiting_first() {
        let mut index = index();
        // waiting (delayed), reqtime 100
        let delayed = announce(&mut index, 1, 0x66, 0);
        // selectable, reqtime 50
        let ready = announce(&mut index, 2, 0x66, 1);
        index.modify(ready, |a| {
            a.state = State::CandidateReady;
            a.time = 50;
        });
        // completed, arbitrary time
        let completed = announce(&mut index, 3, 0x66, 2);
        index.modify(completed, |a| {
            a.state = State::Completed;
            a.time = 10;
        });

        assert_eq!(index.time_first(), Some(delayed));
        assert_eq!(index.time_last(), Some(ready));
    }
}
