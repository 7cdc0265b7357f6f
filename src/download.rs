//! Tracking of a single piece's in-flight block requests.
//!
//! A [`PieceDownload`] doesn't know anything about peers or sockets: it
//! just keeps track of which of a piece's blocks have been requested and
//! which have arrived, so the peer session can ask it "give me up to N more
//! blocks to request" and "is this piece done yet".

use crate::{block_count, block_len, BlockInfo, PieceIndex, BLOCK_LEN};

/// The state of a single piece's block-level download progress.
pub(crate) struct PieceDownload {
    piece_index: PieceIndex,
    piece_len: u32,
    block_count: usize,
    /// The index of the next block that hasn't been picked for a request
    /// yet. Blocks are always picked in order; once picked, a block is
    /// never re-picked even if its request is later dropped, as the owning
    /// peer session manages request timeouts and retries itself.
    next_unpicked_block: usize,
    received: Vec<bool>,
}

impl PieceDownload {
    /// Starts tracking a new download for piece `piece_index`, which is
    /// `piece_len` bytes long.
    pub fn new(piece_index: PieceIndex, piece_len: u32) -> Self {
        let block_count = block_count(piece_len);
        Self {
            piece_index,
            piece_len,
            block_count,
            next_unpicked_block: 0,
            received: vec![false; block_count],
        }
    }

    pub fn piece_index(&self) -> PieceIndex {
        self.piece_index
    }

    /// Appends up to `count` not-yet-picked blocks from this piece to
    /// `blocks`. May append fewer than `count` if the piece doesn't have
    /// that many blocks left to pick.
    pub fn pick_blocks(&mut self, count: usize, blocks: &mut Vec<BlockInfo>) {
        let mut picked = 0;
        while picked < count && self.next_unpicked_block < self.block_count {
            let index = self.next_unpicked_block;
            self.next_unpicked_block += 1;

            let offset = index as u32 * BLOCK_LEN;
            let len = block_len(self.piece_len, index);
            blocks.push(BlockInfo {
                piece_index: self.piece_index,
                offset,
                len,
            });
            picked += 1;
        }
    }

    /// Marks a block as received.
    pub fn received_block(&mut self, block_info: BlockInfo) {
        debug_assert_eq!(block_info.piece_index, self.piece_index);
        let index = block_info.index_in_piece();
        self.received[index] = true;
    }

    /// Returns the number of blocks not yet received.
    pub fn count_missing_blocks(&self) -> usize {
        self.received.iter().filter(|received| !**received).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_blocks_in_order_up_to_the_requested_count() {
        let piece_len = 3 * BLOCK_LEN;
        let mut download = PieceDownload::new(0, piece_len);
        let mut blocks = Vec::new();
        download.pick_blocks(2, &mut blocks);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].offset, 0);
        assert_eq!(blocks[1].offset, BLOCK_LEN);
    }

    #[test]
    fn does_not_pick_past_the_piece_s_block_count() {
        let piece_len = BLOCK_LEN + 100;
        let mut download = PieceDownload::new(0, piece_len);
        let mut blocks = Vec::new();
        download.pick_blocks(10, &mut blocks);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[1].len, 100);
    }

    #[test]
    fn tracks_missing_blocks_as_they_arrive() {
        let piece_len = 2 * BLOCK_LEN;
        let mut download = PieceDownload::new(5, piece_len);
        let mut blocks = Vec::new();
        download.pick_blocks(2, &mut blocks);
        assert_eq!(download.count_missing_blocks(), 2);

        download.received_block(blocks[0]);
        assert_eq!(download.count_missing_blocks(), 1);

        download.received_block(blocks[1]);
        assert_eq!(download.count_missing_blocks(), 0);
    }

    #[test]
    fn piece_index_is_reported_verbatim() {
        let download = PieceDownload::new(42, BLOCK_LEN);
        assert_eq!(download.piece_index(), 42);
    }
}
