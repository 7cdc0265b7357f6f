//! Parsing and normalization of `.torrent` metainfo dictionaries.
//!
//! [`RawMetainfo`] mirrors the bencoded dictionary as it appears on the
//! wire/on disk. [`Metainfo`] is the normalized form the rest of the engine
//! actually works with: a flat [`FsStructure`](crate::storage_info::FsStructure),
//! a `u32` piece length, and the per-piece SHA-1 hashes split out of the
//! concatenated `pieces` string.

use std::path::PathBuf;

use sha1::{Digest, Sha1};

use crate::{
    error::{Error, Result},
    storage_info::{FileInfo, FsStructure},
    PieceIndex, Sha1Hash,
};

/// The raw bencoded metainfo dictionary, as read directly off disk.
#[derive(Debug, Serialize, Deserialize)]
pub struct RawMetainfo {
    pub info: RawInfo,
    #[serde(default)]
    pub announce: Option<String>,
    #[serde(default, rename = "announce-list")]
    pub announce_list: Option<Vec<Vec<String>>>,
}

/// The raw bencoded `info` dictionary.
#[derive(Debug, Serialize, Deserialize)]
pub struct RawInfo {
    pub name: String,
    #[serde(with = "serde_bytes")]
    pub pieces: Vec<u8>,
    #[serde(rename = "piece length")]
    pub piece_length: u64,
    pub length: Option<u64>,
    pub files: Option<Vec<RawFile>>,
    pub private: Option<u8>,
}

/// An entry of the raw `files` list, for multi-file torrents.
#[derive(Debug, Serialize, Deserialize)]
pub struct RawFile {
    pub path: Vec<String>,
    pub length: u64,
}

/// A normalized, validated view of a torrent's metainfo, plus its derived
/// info hash.
#[derive(Clone, Debug)]
pub struct Metainfo {
    /// The torrent's (or, for a multi-file torrent, the containing
    /// directory's) name.
    pub name: String,
    /// The SHA-1 hash of the bencoded `info` dictionary, uniquely
    /// identifying this torrent.
    pub info_hash: Sha1Hash,
    /// The length of all pieces save for the last, in bytes.
    pub piece_len: u32,
    /// The expected SHA-1 hash of each piece, in piece order.
    pub piece_hashes: Vec<Sha1Hash>,
    /// The file(s) this torrent's data is split across.
    pub structure: FsStructure,
    /// Trackers gathered from `announce` and `announce-list`, in the order
    /// they should be tried (the primary tracker first).
    pub trackers: Vec<String>,
    /// BEP 27's private flag: if set, the torrent must only be discovered
    /// through the trackers above, never via DHT or peer exchange.
    pub private: bool,
}

impl Metainfo {
    /// Parses and validates a bencoded `.torrent` file's contents.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let raw: RawMetainfo = serde_bencode::from_bytes(buf)
            .map_err(|e| Error::InvalidMetainfo(e.to_string()))?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawMetainfo) -> Result<Self> {
        let info_hash = Self::hash_info(&raw.info)?;
        let piece_hashes = split_piece_hashes(&raw.info.pieces)?;

        let structure = match raw.info.files {
            Some(files) => {
                let mut torrent_offset = 0;
                let files = files
                    .into_iter()
                    .map(|f| {
                        let len = f.length;
                        let file = FileInfo {
                            path: f.path.into_iter().collect::<PathBuf>(),
                            len,
                            torrent_offset,
                        };
                        torrent_offset += len;
                        file
                    })
                    .collect();
                FsStructure::Archive { files }
            }
            None => {
                let len = raw.info.length.ok_or_else(|| {
                    Error::InvalidMetainfo(
                        "single-file torrent missing `length`".into(),
                    )
                })?;
                FsStructure::File(FileInfo {
                    path: PathBuf::from(&raw.info.name),
                    len,
                    torrent_offset: 0,
                })
            }
        };

        let piece_length: u32 = raw.info.piece_length.try_into().map_err(|_| {
            Error::InvalidMetainfo("piece length overflows u32".into())
        })?;

        let mut trackers = Vec::new();
        if let Some(announce) = raw.announce {
            trackers.push(announce);
        }
        if let Some(tiers) = raw.announce_list {
            for tier in tiers {
                for url in tier {
                    if !trackers.contains(&url) {
                        trackers.push(url);
                    }
                }
            }
        }

        let private = raw.info.private.unwrap_or(0) == 1;

        Ok(Self {
            name: raw.info.name,
            info_hash,
            piece_len: piece_length,
            piece_hashes,
            structure,
            trackers,
            private,
        })
    }

    /// Returns the number of pieces in the torrent.
    pub fn piece_count(&self) -> usize {
        self.piece_hashes.len()
    }

    /// Returns the expected hash of the piece at `index`, if it's in range.
    pub fn piece_hash(&self, index: PieceIndex) -> Option<&Sha1Hash> {
        self.piece_hashes.get(index)
    }

    fn hash_info(info: &RawInfo) -> Result<Sha1Hash> {
        let bytes = serde_bencode::to_bytes(info)
            .map_err(|e| Error::InvalidMetainfo(e.to_string()))?;
        let digest = Sha1::digest(&bytes);
        let mut info_hash = [0; 20];
        info_hash.copy_from_slice(&digest);
        Ok(info_hash)
    }
}

fn split_piece_hashes(pieces: &[u8]) -> Result<Vec<Sha1Hash>> {
    if pieces.len() % 20 != 0 {
        return Err(Error::InvalidMetainfo(
            "pieces string length is not a multiple of 20".into(),
        ));
    }
    Ok(pieces
        .chunks_exact(20)
        .map(|chunk| {
            let mut hash = [0; 20];
            hash.copy_from_slice(chunk);
            hash
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_file_torrent_bytes() -> Vec<u8> {
        let raw = RawMetainfo {
            info: RawInfo {
                name: "foo.txt".to_owned(),
                pieces: vec![7; 40], // two pieces
                piece_length: 16384,
                length: Some(20000),
                files: None,
                private: None,
            },
            announce: Some("https://tracker.example/announce".to_owned()),
            announce_list: Some(vec![
                vec!["https://tracker.example/announce".to_owned()],
                vec!["udp://backup.example:80".to_owned()],
            ]),
        };
        serde_bencode::to_bytes(&raw).unwrap()
    }

    #[test]
    fn parses_single_file_torrent() {
        let bytes = single_file_torrent_bytes();
        let metainfo = Metainfo::from_bytes(&bytes).unwrap();
        assert_eq!(metainfo.name, "foo.txt");
        assert_eq!(metainfo.piece_count(), 2);
        assert_eq!(metainfo.piece_len, 16384);
        assert!(!metainfo.structure.is_archive());
        assert_eq!(metainfo.structure.download_len(), 20000);
    }

    #[test]
    fn dedupes_trackers_preserving_order() {
        let bytes = single_file_torrent_bytes();
        let metainfo = Metainfo::from_bytes(&bytes).unwrap();
        assert_eq!(
            metainfo.trackers,
            vec![
                "https://tracker.example/announce".to_owned(),
                "udp://backup.example:80".to_owned(),
            ]
        );
    }

    #[test]
    fn rejects_malformed_pieces_length() {
        let raw = RawMetainfo {
            info: RawInfo {
                name: "bad.txt".to_owned(),
                pieces: vec![1; 19],
                piece_length: 16384,
                length: Some(100),
                files: None,
                private: None,
            },
            announce: None,
            announce_list: None,
        };
        let bytes = serde_bencode::to_bytes(&raw).unwrap();
        assert!(Metainfo::from_bytes(&bytes).is_err());
    }

    #[test]
    fn propagates_the_private_flag_from_the_raw_info_dict() {
        let raw = RawMetainfo {
            info: RawInfo {
                name: "private.txt".to_owned(),
                pieces: vec![7; 20],
                piece_length: 16384,
                length: Some(100),
                files: None,
                private: Some(1),
            },
            announce: None,
            announce_list: None,
        };
        let bytes = serde_bencode::to_bytes(&raw).unwrap();
        let metainfo = Metainfo::from_bytes(&bytes).unwrap();
        assert!(metainfo.private);
    }

    #[test]
    fn defaults_to_public_when_private_is_absent() {
        let bytes = single_file_torrent_bytes();
        let metainfo = Metainfo::from_bytes(&bytes).unwrap();
        assert!(!metainfo.private);
    }

    #[test]
    fn same_info_dict_hashes_identically() {
        let bytes = single_file_torrent_bytes();
        let a = Metainfo::from_bytes(&bytes).unwrap();
        let b = Metainfo::from_bytes(&bytes).unwrap();
        assert_eq!(a.info_hash, b.info_hash);
    }
}
