//! The storage collaborator contract.
//!
//! On-disk layout, memory-mapping, and file-handle management are out of
//! scope for this crate (see the old `disk` module, kept around only as a
//! reference for how the teacher shaped that layer). What the engine itself
//! needs is just the narrow contract below: somewhere to read and write
//! piece blocks, with piece-hash verification happening on the write path.
//! [`InMemoryStorage`] is a minimal implementation of that contract used in
//! tests and by embedders that don't need real persistence.

use std::convert::TryInto;

use sha1::{Digest, Sha1};

use crate::{
    block_len, error::Result, metainfo::Metainfo, storage_info::StorageInfo,
    BlockInfo, PieceIndex, Sha1Hash,
};

/// The outcome of writing a block to storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOutcome {
    /// `Some(true)` if this write completed the piece and its hash matched
    /// the expected hash; `Some(false)` if it completed the piece but the
    /// hash did not match (the piece is discarded and must be re-downloaded);
    /// `None` if the piece isn't complete yet.
    pub verified: Option<bool>,
}

/// The contract a storage backend must offer the engine: reading and
/// writing piece blocks, with the backend responsible for verifying a
/// piece's hash once all of its blocks have arrived.
pub trait StorageEngine: Send + Sync {
    /// The number of pieces in the torrent this storage serves.
    fn piece_count(&self) -> usize;

    /// The length, in bytes, of the piece at `index`.
    fn piece_length(&self, index: PieceIndex) -> Result<u32>;

    /// The torrent's total length, in bytes.
    fn total_length(&self) -> u64;

    /// Reads the bytes described by `info` back out of storage. Only valid
    /// once the relevant piece is complete and verified.
    fn read_block(&self, info: BlockInfo) -> Result<Vec<u8>>;

    /// Writes `data` at the location described by `info`. Returns whether
    /// this write completed (and verified) the containing piece.
    fn write_block(&mut self, info: BlockInfo, data: &[u8]) -> Result<WriteOutcome>;
}

/// An in-memory [`StorageEngine`] with no real persistence: pieces live in
/// a `Vec<u8>` per piece, accumulated block by block and hash-verified once
/// complete.
pub struct InMemoryStorage {
    info: StorageInfo,
    piece_hashes: Vec<Sha1Hash>,
    pieces: Vec<PieceSlot>,
}

struct PieceSlot {
    buf: Vec<u8>,
    bytes_written: u32,
    verified: bool,
}

impl InMemoryStorage {
    /// Creates storage sized for `metainfo`'s pieces.
    pub fn new(metainfo: &Metainfo, download_dir: std::path::PathBuf) -> Self {
        let info = StorageInfo::new(metainfo, download_dir);
        let piece_count = info.piece_count;
        let pieces = (0..piece_count)
            .map(|i| {
                let len = info.piece_len(i).unwrap_or(info.piece_len) as usize;
                PieceSlot {
                    buf: vec![0; len],
                    bytes_written: 0,
                    verified: false,
                }
            })
            .collect();
        Self {
            info,
            piece_hashes: metainfo.piece_hashes.clone(),
            pieces,
        }
    }
}

impl StorageEngine for InMemoryStorage {
    fn piece_count(&self) -> usize {
        self.info.piece_count
    }

    fn piece_length(&self, index: PieceIndex) -> Result<u32> {
        self.info.piece_len(index)
    }

    fn total_length(&self) -> u64 {
        self.info.download_len
    }

    fn read_block(&self, info: BlockInfo) -> Result<Vec<u8>> {
        let piece = &self.pieces[info.piece_index];
        let start = info.offset as usize;
        let end = start + info.len as usize;
        Ok(piece.buf[start..end].to_vec())
    }

    fn write_block(&mut self, info: BlockInfo, data: &[u8]) -> Result<WriteOutcome> {
        let piece_len = self.piece_length(info.piece_index)?;
        let piece = &mut self.pieces[info.piece_index];

        let start = info.offset as usize;
        let end = start + data.len();
        piece.buf[start..end].copy_from_slice(data);
        piece.bytes_written += data.len() as u32;

        if piece.bytes_written < piece_len {
            return Ok(WriteOutcome { verified: None });
        }

        let digest = Sha1::digest(&piece.buf);
        let expected = &self.piece_hashes[info.piece_index];
        let matches = digest.as_slice() == expected.as_slice();
        piece.verified = matches;
        if !matches {
            // discard so the piece can be re-requested from scratch
            piece.bytes_written = 0;
        }

        Ok(WriteOutcome {
            verified: Some(matches),
        })
    }
}

/// Returns the block length for the last block in a piece whose blocks are
/// otherwise the default 16 KiB, mirroring `block_len` but bounded to a
/// specific piece's actual length rather than the torrent-wide default.
pub(crate) fn last_block_len(piece_len: u32, block_count: usize) -> u32 {
    block_len(piece_len, block_count.saturating_sub(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metainfo::{RawFile, RawInfo, RawMetainfo};

    fn build_metainfo(piece_len: u32, data: &[u8]) -> Metainfo {
        let pieces: Vec<u8> = data
            .chunks(piece_len as usize)
            .flat_map(|chunk| {
                let digest = Sha1::digest(chunk);
                digest.to_vec()
            })
            .collect();
        let raw = RawMetainfo {
            info: RawInfo {
                name: "test".to_owned(),
                pieces,
                piece_length: piece_len as u64,
                length: Some(data.len() as u64),
                files: None,
                private: None,
            },
            announce: None,
            announce_list: None,
        };
        let bytes = serde_bencode::to_bytes(&raw).unwrap();
        Metainfo::from_bytes(&bytes).unwrap()
    }

    #[test]
    fn write_then_read_a_full_piece() {
        let data = vec![42u8; 16];
        let metainfo = build_metainfo(16, &data);
        let mut storage = InMemoryStorage::new(&metainfo, std::env::temp_dir());

        let info = BlockInfo {
            piece_index: 0,
            offset: 0,
            len: 16,
        };
        let outcome = storage.write_block(info, &data).unwrap();
        assert_eq!(outcome.verified, Some(true));

        let read_back = storage.read_block(info).unwrap();
        assert_eq!(read_back, data);
    }

    #[test]
    fn mismatched_hash_is_reported_and_piece_is_reset() {
        let data = vec![1u8; 16];
        let metainfo = build_metainfo(16, &data);
        let mut storage = InMemoryStorage::new(&metainfo, std::env::temp_dir());

        let info = BlockInfo {
            piece_index: 0,
            offset: 0,
            len: 16,
        };
        let wrong_data = vec![2u8; 16];
        let outcome = storage.write_block(info, &wrong_data).unwrap();
        assert_eq!(outcome.verified, Some(false));

        // can be retried
        let outcome = storage.write_block(info, &data).unwrap();
        assert_eq!(outcome.verified, Some(true));
    }

    #[test]
    fn incomplete_piece_reports_no_verdict_yet() {
        let data = vec![9u8; 32];
        let metainfo = build_metainfo(32, &data);
        let mut storage = InMemoryStorage::new(&metainfo, std::env::temp_dir());

        let first_half = BlockInfo {
            piece_index: 0,
            offset: 0,
            len: 16,
        };
        let outcome = storage.write_block(first_half, &data[..16]).unwrap();
        assert_eq!(outcome.verified, None);
    }
}
