//! Per-peer replication bookkeeping.
//!
//! Tracks, for every remote peer, the newest patch seen and the contiguous
//! frontier: the highest sequence number below which no patch is missing.
//! A gap between the frontier and the newest sequence is what the
//! maintenance loop turns into retransmission requests.
//!
//! The frontier only advances when an arriving patch closes the gap
//! exactly. A later sequence that arrived early does not advance it
//! retroactively; the next in-order arrival catches the frontier up.

use std::collections::HashMap;

use serde::Serialize;

use patchsync_core::Hlc;

/// Replication state for one remote peer. All fields start at zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PeerStats {
    /// Timestamp of the newest patch seen from this peer.
    pub last_patch_at: Hlc,
    /// Highest sequence number seen from this peer.
    pub last_seq_id: i64,
    /// Timestamp at the contiguous frontier.
    pub guaranteed_contiguous_at: Hlc,
    /// Highest sequence number up to which every patch has been seen.
    pub guaranteed_contiguous_seq: i64,
    /// Wall clock of the last message from this peer, Unix ms.
    pub last_message_time_ms: i64,
}

/// Lazily populated map of peer id to [`PeerStats`].
#[derive(Debug, Default)]
pub struct PeerTable {
    peers: HashMap<i64, PeerStats>,
}

impl PeerTable {
    /// Registers a peer with empty stats; no-op for known peers.
    pub fn add(&mut self, peer: i64) {
        self.peers.entry(peer).or_default();
    }

    /// Records an arriving patch from `peer`.
    pub fn observe_patch(&mut self, peer: i64, seq: i64, at: Hlc, now_ms: i64, debug: bool) {
        let stats = self.peers.entry(peer).or_default();
        stats.last_message_time_ms = now_ms;

        let gap = seq - stats.guaranteed_contiguous_seq;
        if gap == 1 {
            stats.guaranteed_contiguous_seq = seq;
            stats.guaranteed_contiguous_at = at;
        } else if gap > 1 && debug {
            tracing::debug!(
                peer,
                seq,
                frontier = stats.guaranteed_contiguous_seq,
                "sequence gap observed"
            );
        }

        if seq > stats.last_seq_id {
            stats.last_seq_id = seq;
            stats.last_patch_at = at;
        }
    }

    /// Records a ping from `peer`, advancing only the high-water marks.
    pub fn observe_ping(&mut self, peer: i64, last_seq: i64, last_at: Hlc, now_ms: i64) {
        let stats = self.peers.entry(peer).or_default();
        stats.last_message_time_ms = now_ms;
        if last_seq > stats.last_seq_id {
            stats.last_seq_id = last_seq;
            stats.last_patch_at = last_at;
        }
    }

    /// Whether this node has contiguously seen `peer`'s patches through `seq`.
    ///
    /// An unknown peer answers `true`: a node that has never heard of the
    /// peer has no evidence of a gap.
    #[must_use]
    pub fn is_consistent(&self, peer: i64, seq: i64) -> bool {
        self.peers
            .get(&peer)
            .is_none_or(|stats| stats.guaranteed_contiguous_seq >= seq)
    }

    /// Returns the stats entry for `peer`, if any.
    #[must_use]
    pub fn get(&self, peer: i64) -> Option<&PeerStats> {
        self.peers.get(&peer)
    }

    /// Peers whose contiguous frontier trails their newest sequence.
    pub fn gapped(&self) -> impl Iterator<Item = (i64, &PeerStats)> {
        self.peers
            .iter()
            .filter(|(_, stats)| stats.guaranteed_contiguous_seq < stats.last_seq_id)
            .map(|(peer, stats)| (*peer, stats))
    }

    /// Returns an owned copy of every peer's stats.
    #[must_use]
    pub fn snapshot(&self) -> HashMap<i64, PeerStats> {
        self.peers.clone()
    }
}

#[cfg(test)]
mod tests {
    use patchsync_core::EPOCH_MS;

    use super::*;

    fn at(ms: i64) -> Hlc {
        Hlc::from_parts(EPOCH_MS + ms, 0).unwrap()
    }

    #[test]
    fn in_order_arrivals_advance_frontier() {
        let mut table = PeerTable::default();
        table.observe_patch(2, 1, at(10), 100, false);
        table.observe_patch(2, 2, at(20), 101, false);

        let stats = table.get(2).unwrap();
        assert_eq!(stats.guaranteed_contiguous_seq, 2);
        assert_eq!(stats.guaranteed_contiguous_at, at(20));
        assert_eq!(stats.last_seq_id, 2);
        assert_eq!(stats.last_message_time_ms, 101);
    }

    #[test]
    fn gap_freezes_frontier_but_tracks_newest() {
        let mut table = PeerTable::default();
        table.observe_patch(2, 1, at(10), 100, false);
        table.observe_patch(2, 2, at(20), 100, false);
        table.observe_patch(2, 4, at(40), 100, false);

        let stats = table.get(2).unwrap();
        assert_eq!(stats.guaranteed_contiguous_seq, 2);
        assert_eq!(stats.last_seq_id, 4);
        assert_eq!(stats.last_patch_at, at(40));
    }

    #[test]
    fn buffered_sequence_does_not_advance_retroactively() {
        let mut table = PeerTable::default();
        table.observe_patch(2, 2, at(20), 100, false);
        table.observe_patch(2, 1, at(10), 100, false);

        // Frontier reaches 1 when the gap closes; seq 2 was seen earlier
        // but is not re-scanned. The next in-order patch (3) will carry it.
        let stats = table.get(2).unwrap();
        assert_eq!(stats.guaranteed_contiguous_seq, 1);
        assert_eq!(stats.last_seq_id, 2);

        table.observe_patch(2, 3, at(30), 100, false);
        assert_eq!(table.get(2).unwrap().guaranteed_contiguous_seq, 2);
    }

    #[test]
    fn duplicate_arrival_changes_nothing() {
        let mut table = PeerTable::default();
        table.observe_patch(2, 1, at(10), 100, false);
        let before = *table.get(2).unwrap();
        table.observe_patch(2, 1, at(10), 100, false);
        let mut expected = before;
        expected.last_message_time_ms = 100;
        assert_eq!(*table.get(2).unwrap(), expected);
    }

    #[test]
    fn consistency_probe() {
        let mut table = PeerTable::default();
        assert!(table.is_consistent(99, 1_000_000)); // unknown peer: optimistic

        table.observe_patch(2, 1, at(10), 100, false);
        assert!(table.is_consistent(2, 1));
        assert!(!table.is_consistent(2, 2));
    }

    #[test]
    fn ping_advances_high_water_only() {
        let mut table = PeerTable::default();
        table.observe_ping(3, 9, at(90), 100);
        let stats = table.get(3).unwrap();
        assert_eq!(stats.last_seq_id, 9);
        assert_eq!(stats.guaranteed_contiguous_seq, 0);

        let gapped: Vec<i64> = table.gapped().map(|(peer, _)| peer).collect();
        assert_eq!(gapped, vec![3]);
    }

    #[test]
    fn add_is_idempotent_and_lazy() {
        let mut table = PeerTable::default();
        table.add(5);
        table.observe_patch(5, 1, at(10), 100, false);
        table.add(5);
        assert_eq!(table.get(5).unwrap().last_seq_id, 1);
    }
}
