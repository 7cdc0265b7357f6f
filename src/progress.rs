//! Persisted transfer counters.
//!
//! Each torrent's upload/download/left counters are persisted to a small
//! resume file next to its data so that a restarted client doesn't have to
//! re-derive them from scratch by re-checking every piece on disk.

use std::{
    fs,
    path::Path,
    sync::atomic::{AtomicU64, Ordering},
};

use crate::error::Result;

/// The three counters a BEP 3 tracker announce reports: bytes uploaded,
/// bytes downloaded, and bytes left to download.
///
/// Each field is independently atomic so that peer session tasks can update
/// them concurrently without a lock.
#[derive(Debug)]
pub struct Progress {
    uploaded: AtomicU64,
    downloaded: AtomicU64,
    left: AtomicU64,
}

impl Progress {
    /// Creates a fresh counter set for a torrent of the given total length,
    /// with nothing uploaded or downloaded yet.
    pub fn new(total_len: u64) -> Self {
        Self {
            uploaded: AtomicU64::new(0),
            downloaded: AtomicU64::new(0),
            left: AtomicU64::new(total_len),
        }
    }

    pub fn uploaded(&self) -> u64 {
        self.uploaded.load(Ordering::Relaxed)
    }

    pub fn downloaded(&self) -> u64 {
        self.downloaded.load(Ordering::Relaxed)
    }

    pub fn left(&self) -> u64 {
        self.left.load(Ordering::Relaxed)
    }

    /// Records `len` bytes sent to a peer.
    pub fn record_upload(&self, len: u64) {
        self.uploaded.fetch_add(len, Ordering::Relaxed);
    }

    /// Records `len` newly verified bytes received from peers, decrementing
    /// `left` by the same amount (saturating at zero, in case of duplicate
    /// accounting across concurrent peer sessions).
    pub fn record_download(&self, len: u64) {
        self.downloaded.fetch_add(len, Ordering::Relaxed);
        self.left.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |left| {
            Some(left.saturating_sub(len))
        })
        .ok();
    }

    /// Loads a persisted counter set from `path`. If the file doesn't exist,
    /// returns the default for a torrent of `total_len` bytes, none of which
    /// has been downloaded yet.
    pub fn load(path: &Path, total_len: u64) -> Result<Self> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::new(total_len));
            }
            Err(e) => return Err(e.into()),
        };

        let mut fields = contents.split_whitespace();
        let parse_field = |s: Option<&str>| -> Option<u64> { s?.parse().ok() };
        let (uploaded, downloaded, left) = (
            parse_field(fields.next()),
            parse_field(fields.next()),
            parse_field(fields.next()),
        );

        match (uploaded, downloaded, left) {
            (Some(uploaded), Some(downloaded), Some(left)) => Ok(Self {
                uploaded: AtomicU64::new(uploaded),
                downloaded: AtomicU64::new(downloaded),
                left: AtomicU64::new(left),
            }),
            _ => Ok(Self::new(total_len)),
        }
    }

    /// Persists the counters to `path` as `"{uploaded} {downloaded} {left}"`.
    pub fn save(&self, path: &Path) -> Result<()> {
        let contents =
            format!("{} {} {}", self.uploaded(), self.downloaded(), self.left());
        fs::write(path, contents)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_upload_and_download() {
        let progress = Progress::new(100);
        progress.record_upload(10);
        progress.record_download(30);
        assert_eq!(progress.uploaded(), 10);
        assert_eq!(progress.downloaded(), 30);
        assert_eq!(progress.left(), 70);
    }

    #[test]
    fn download_does_not_underflow_left() {
        let progress = Progress::new(10);
        progress.record_download(30);
        assert_eq!(progress.left(), 0);
    }

    #[test]
    fn round_trips_through_a_file() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!(
            "torrent-core-progress-test-{:?}",
            std::thread::current().id()
        ));

        let progress = Progress::new(1000);
        progress.record_upload(5);
        progress.record_download(200);
        progress.save(&path).unwrap();

        let loaded = Progress::load(&path, 1000).unwrap();
        assert_eq!(loaded.uploaded(), 5);
        assert_eq!(loaded.downloaded(), 200);
        assert_eq!(loaded.left(), 800);

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn missing_file_yields_fresh_defaults() {
        let path = std::env::temp_dir().join("torrent-core-progress-missing-file");
        std::fs::remove_file(&path).ok();
        let progress = Progress::load(&path, 500).unwrap();
        assert_eq!(progress.uploaded(), 0);
        assert_eq!(progress.downloaded(), 0);
        assert_eq!(progress.left(), 500);
    }
}
