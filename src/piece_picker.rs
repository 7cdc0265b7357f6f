//! Rarest-first piece selection.
//!
//! Tracks, for every piece, whether we have it, have requested it, or are
//! still missing it, alongside each connected peer's advertised
//! availability. [`PiecePicker::pick_piece`] then picks, among the pieces a
//! given peer can supply, the one held by the fewest other peers, breaking
//! ties by the lowest index.

use std::collections::HashMap;

use crate::{bitfield::Bitfield, PeerId, PieceIndex};

/// The state of a single piece from the download's point of view.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PieceStatus {
    /// Not yet requested from anyone.
    Missing,
    /// Currently being downloaded from one or more peers.
    Requested,
    /// Downloaded and verified.
    Have,
}

/// Tracks piece availability across connected peers and picks the next
/// piece to request using a rarest-first strategy.
pub struct PiecePicker {
    statuses: Vec<PieceStatus>,
    peer_bitfields: HashMap<PeerId, Bitfield>,
}

impl PiecePicker {
    /// Creates a picker for a torrent with `piece_count` pieces, none of
    /// which we have yet.
    pub fn new(piece_count: usize) -> Self {
        Self {
            statuses: vec![PieceStatus::Missing; piece_count],
            peer_bitfields: HashMap::new(),
        }
    }

    /// Seeds the picker with pieces we already have, e.g. when resuming a
    /// partially downloaded torrent.
    pub fn with_own_bitfield(piece_count: usize, own: &Bitfield) -> Self {
        let mut picker = Self::new(piece_count);
        for i in own.iter_ones() {
            picker.statuses[i] = PieceStatus::Have;
        }
        picker
    }

    pub fn piece_count(&self) -> usize {
        self.statuses.len()
    }

    /// Builds a bitfield of the pieces we currently have, suitable for
    /// sending to a newly connected peer.
    pub fn own_bitfield(&self) -> Bitfield {
        let mut bitfield = Bitfield::new(self.piece_count());
        for (index, status) in self.statuses.iter().enumerate() {
            if *status == PieceStatus::Have {
                bitfield.insert(index);
            }
        }
        bitfield
    }

    /// Registers a peer's full bitfield, overwriting any previous record for
    /// it.
    pub fn register_peer(&mut self, peer: PeerId, bitfield: Bitfield) {
        self.peer_bitfields.insert(peer, bitfield);
    }

    /// Records a single `have` announcement from a peer, registering it with
    /// an empty bitfield first if this is the first message we've seen from
    /// it.
    pub fn update_peer_have(&mut self, peer: PeerId, index: PieceIndex) {
        let piece_count = self.piece_count();
        self.peer_bitfields
            .entry(peer)
            .or_insert_with(|| Bitfield::new(piece_count))
            .insert(index);
    }

    /// Drops a peer's availability record, e.g. on disconnect.
    pub fn unregister_peer(&mut self, peer: &PeerId) {
        self.peer_bitfields.remove(peer);
    }

    /// Returns `true` if `peer` has at least one piece we don't have yet,
    /// i.e. whether we should express interest in it.
    pub fn is_interested_in(&self, peer: &PeerId) -> bool {
        match self.peer_bitfields.get(peer) {
            Some(bf) => (0..self.piece_count())
                .any(|i| self.statuses[i] != PieceStatus::Have && bf.test(i)),
            None => false,
        }
    }

    pub fn status(&self, index: PieceIndex) -> PieceStatus {
        self.statuses[index]
    }

    pub fn mark_requested(&mut self, index: PieceIndex) {
        self.statuses[index] = PieceStatus::Requested;
    }

    pub fn mark_have(&mut self, index: PieceIndex) {
        self.statuses[index] = PieceStatus::Have;
    }

    /// Resets a piece back to missing, e.g. after it failed hash
    /// verification or its only source disconnected mid-download.
    pub fn mark_missing(&mut self, index: PieceIndex) {
        self.statuses[index] = PieceStatus::Missing;
    }

    /// Picks the rarest piece `peer` has that we're still missing, breaking
    /// ties by the lowest piece index. Returns `None` if `peer` is unknown
    /// or has nothing left we need.
    pub fn pick_piece(&self, peer: &PeerId) -> Option<PieceIndex> {
        let peer_bitfield = self.peer_bitfields.get(peer)?;

        let mut best: Option<(usize, PieceIndex)> = None;
        for index in 0..self.piece_count() {
            if self.statuses[index] != PieceStatus::Missing || !peer_bitfield.test(index) {
                continue;
            }
            let availability = self
                .peer_bitfields
                .values()
                .filter(|bf| bf.test(index))
                .count();
            match best {
                Some((best_count, _)) if availability >= best_count => {}
                _ => best = Some((availability, index)),
            }
        }
        best.map(|(_, index)| index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer_id(byte: u8) -> PeerId {
        [byte; 20]
    }

    fn bitfield_from(piece_count: usize, indices: &[usize]) -> Bitfield {
        let mut bf = Bitfield::new(piece_count);
        for &i in indices {
            bf.insert(i);
        }
        bf
    }

    #[test]
    fn picks_the_rarest_available_piece() {
        let mut picker = PiecePicker::new(4);
        picker.register_peer(peer_id(1), bitfield_from(4, &[0, 1, 2, 3]));
        picker.register_peer(peer_id(2), bitfield_from(4, &[0, 1]));
        picker.register_peer(peer_id(3), bitfield_from(4, &[0]));
        // availability: 0->3, 1->2, 2->1, 3->1; peer 1 has all, rarest among
        // them with lowest index on ties is piece 2.
        assert_eq!(picker.pick_piece(&peer_id(1)), Some(2));
    }

    #[test]
    fn does_not_repick_a_piece_we_already_have() {
        let mut picker = PiecePicker::new(2);
        picker.register_peer(peer_id(1), bitfield_from(2, &[0, 1]));
        picker.mark_have(0);
        assert_eq!(picker.pick_piece(&peer_id(1)), Some(1));
    }

    #[test]
    fn unknown_peer_yields_no_pick() {
        let picker = PiecePicker::new(2);
        assert_eq!(picker.pick_piece(&peer_id(9)), None);
    }

    #[test]
    fn interest_reflects_whether_peer_has_anything_we_lack() {
        let mut picker = PiecePicker::new(2);
        picker.register_peer(peer_id(1), bitfield_from(2, &[0]));
        assert!(picker.is_interested_in(&peer_id(1)));
        picker.mark_have(0);
        assert!(!picker.is_interested_in(&peer_id(1)));
    }

    #[test]
    fn have_message_lazily_registers_the_peer() {
        let mut picker = PiecePicker::new(4);
        picker.update_peer_have(peer_id(1), 2);
        assert!(picker.is_interested_in(&peer_id(1)));
        assert_eq!(picker.pick_piece(&peer_id(1)), Some(2));
    }

    #[test]
    fn unregistering_a_peer_removes_it_from_availability_counts() {
        let mut picker = PiecePicker::new(2);
        picker.register_peer(peer_id(1), bitfield_from(2, &[0]));
        picker.unregister_peer(&peer_id(1));
        assert_eq!(picker.pick_piece(&peer_id(1)), None);
    }

    #[test]
    fn own_bitfield_reflects_pieces_we_have() {
        let mut picker = PiecePicker::new(3);
        picker.mark_have(0);
        picker.mark_have(2);
        let bitfield = picker.own_bitfield();
        assert!(bitfield.test(0));
        assert!(!bitfield.test(1));
        assert!(bitfield.test(2));
    }

    #[test]
    fn marking_missing_makes_a_piece_requestable_again() {
        let mut picker = PiecePicker::new(1);
        picker.register_peer(peer_id(1), bitfield_from(1, &[0]));
        picker.mark_requested(0);
        assert_eq!(picker.pick_piece(&peer_id(1)), None);
        picker.mark_missing(0);
        assert_eq!(picker.pick_piece(&peer_id(1)), Some(0));
    }
}
