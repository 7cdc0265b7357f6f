//! The top-level client engine.
//!
//! A [`ClientSession`] is the root object an embedding application creates:
//! it owns the client-wide connection slot pool shared across every swarm
//! (so no single torrent can starve the others of sockets), the DHT
//! collaborator, and the handle map that makes each opened torrent
//! idempotently addressable by its info hash, per §4.7.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
};

use tokio::sync::Mutex as AsyncMutex;

use crate::{
    conf::{Conf, DEFAULT_CLIENT_ID},
    dht::{DhtHandle, NullDhtHandle},
    handle::Handle,
    metainfo::Metainfo,
    peer_id,
    progress::Progress,
    storage::{InMemoryStorage, StorageEngine},
    storage_info::{FileInfo, FsStructure, StorageInfo},
    swarm::SlotPool,
    InfoHash, PeerId,
};

/// A point-in-time snapshot of transfer counters summed across every
/// torrent the session currently has open.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AggregateProgress {
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
}

/// The top-level torrent engine, owning every torrent an embedding
/// application has opened.
pub struct ClientSession {
    peer_id: PeerId,
    conf: Conf,
    client_slots: SlotPool,
    dht: Arc<AsyncMutex<dyn DhtHandle>>,
    next_torrent_id: AtomicU32,
    handles: AsyncMutex<HashMap<InfoHash, Arc<Handle>>>,
    progresses: AsyncMutex<HashMap<InfoHash, Arc<Progress>>>,
}

impl ClientSession {
    /// Creates a new, empty client session. A fresh, random [`PeerId`] is
    /// generated per BEP 20 unless `conf.engine.client_id` was explicitly set
    /// away from [`DEFAULT_CLIENT_ID`], in which case that fixed id is used
    /// instead (useful for reproducible tests).
    pub fn new(conf: Conf) -> Self {
        let peer_id = if conf.engine.client_id == *DEFAULT_CLIENT_ID {
            peer_id::generate_default()
        } else {
            conf.engine.client_id
        };
        Self {
            peer_id,
            client_slots: SlotPool::new(conf.engine.max_threads),
            dht: Arc::new(AsyncMutex::new(NullDhtHandle::new())),
            next_torrent_id: AtomicU32::new(0),
            conf,
            handles: AsyncMutex::new(HashMap::new()),
            progresses: AsyncMutex::new(HashMap::new()),
        }
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Opens a handle for a torrent we already have the full metainfo for.
    ///
    /// Idempotent by info hash: if a handle already exists for
    /// `metainfo.info_hash`, it's returned unchanged (no new `TorrentAdded`
    /// event is published). Otherwise a fresh, `Stopped` handle is created
    /// with storage allocated under `conf.torrent.download_dir`.
    ///
    /// Privacy is intrinsic to the metainfo (BEP 27): if `metainfo.private`
    /// is set, the resulting handle never registers itself with the DHT
    /// collaborator, regardless of what the caller knows or intends.
    pub async fn open_torrent(&self, metainfo: Metainfo) -> Arc<Handle> {
        let private = metainfo.private;
        let mut handles = self.handles.lock().await;
        if let Some(handle) = handles.get(&metainfo.info_hash) {
            return Arc::clone(handle);
        }

        let download_dir = self.conf.torrent.download_dir.clone();
        let storage_info = StorageInfo::new(&metainfo, download_dir.clone());
        let progress = Arc::new(Progress::new(storage_info.download_len));
        let storage: Box<dyn StorageEngine> =
            Box::new(InMemoryStorage::new(&metainfo, download_dir));

        let handle = self.build_handle(
            metainfo.info_hash,
            private,
            metainfo.trackers,
            storage_info,
            storage,
            Arc::clone(&progress),
        );

        handles.insert(metainfo.info_hash, Arc::clone(&handle));
        drop(handles);
        self.progresses.lock().await.insert(metainfo.info_hash, progress);
        handle
    }

    /// Opens a handle from just a magnet link's info hash, with no metainfo
    /// yet available.
    ///
    /// Resolving the rest of the metainfo over the wire (BEP 9) is out of
    /// scope for this engine; the returned handle tracks only the info hash
    /// and the trackers parsed out of the magnet URI, and has nothing to
    /// seed or verify against until an embedder supplies the real metainfo
    /// (at which point it should close this handle and call
    /// [`Self::open_torrent`] instead). `start`ing a magnet-only handle
    /// still runs the tracker announce loop and accepts inbound peers, but
    /// there is no piece data behind it.
    pub async fn open_magnet(&self, info_hash: InfoHash, trackers: Vec<String>) -> Arc<Handle> {
        let mut handles = self.handles.lock().await;
        if let Some(handle) = handles.get(&info_hash) {
            return Arc::clone(handle);
        }

        let storage_info = placeholder_storage_info(self.conf.torrent.download_dir.clone());
        let progress = Arc::new(Progress::new(0));
        let storage: Box<dyn StorageEngine> = Box::new(placeholder_storage(&storage_info));

        // private = false: magnet links carry no BEP 27 private flag in this
        // minimal form, so we default to DHT-assisted discovery.
        let handle = self.build_handle(
            info_hash,
            false,
            trackers,
            storage_info,
            storage,
            Arc::clone(&progress),
        );

        handles.insert(info_hash, Arc::clone(&handle));
        drop(handles);
        self.progresses.lock().await.insert(info_hash, progress);
        handle
    }

    fn build_handle(
        &self,
        info_hash: InfoHash,
        private: bool,
        trackers: Vec<String>,
        storage_info: StorageInfo,
        storage: Box<dyn StorageEngine>,
        progress: Arc<Progress>,
    ) -> Arc<Handle> {
        let id = self.next_torrent_id.fetch_add(1, Ordering::Relaxed);
        let dht = if private { None } else { Some(Arc::clone(&self.dht)) };
        Arc::new(Handle::new(
            id,
            info_hash,
            self.peer_id,
            private,
            trackers,
            self.conf.torrent.clone(),
            storage_info,
            storage,
            progress,
            self.client_slots.clone(),
            dht,
        ))
    }

    /// Looks up a previously opened handle.
    pub async fn handle(&self, info_hash: &InfoHash) -> Option<Arc<Handle>> {
        self.handles.lock().await.get(info_hash).cloned()
    }

    /// Stops and releases a torrent, removing it from the handle map.
    pub async fn close_handle(&self, info_hash: &InfoHash) {
        let handle = self.handles.lock().await.remove(info_hash);
        if let Some(handle) = handle {
            handle.close().await;
        }
        self.progresses.lock().await.remove(info_hash);
    }

    /// The number of torrents currently open.
    pub async fn swarm_count(&self) -> usize {
        self.handles.lock().await.len()
    }

    /// The number of peer connection slots currently in use, summed across
    /// every swarm: `maxThreads - availableThreadPermits`.
    pub fn peer_count(&self) -> usize {
        self.conf.engine.max_threads - self.client_slots.available()
    }

    /// Sums the upload/download/left counters across every open torrent.
    pub async fn current_progress(&self) -> AggregateProgress {
        let progresses = self.progresses.lock().await;
        progresses.values().fold(AggregateProgress::default(), |mut acc, p| {
            acc.uploaded += p.uploaded();
            acc.downloaded += p.downloaded();
            acc.left += p.left();
            acc
        })
    }
}

/// A degenerate single, empty, already-"complete" piece standing in for a
/// torrent whose metainfo hasn't been resolved yet.
fn placeholder_storage_info(download_dir: std::path::PathBuf) -> StorageInfo {
    StorageInfo {
        piece_count: 1,
        piece_len: 0,
        last_piece_len: 0,
        download_len: 0,
        download_dir,
        structure: FsStructure::Archive { files: Vec::<FileInfo>::new() },
    }
}

fn placeholder_storage(info: &StorageInfo) -> impl StorageEngine {
    PlaceholderStorage { info: info.clone() }
}

struct PlaceholderStorage {
    info: StorageInfo,
}

impl StorageEngine for PlaceholderStorage {
    fn piece_count(&self) -> usize {
        self.info.piece_count
    }

    fn piece_length(&self, index: crate::PieceIndex) -> crate::error::Result<u32> {
        self.info.piece_len(index)
    }

    fn total_length(&self) -> u64 {
        self.info.download_len
    }

    fn read_block(&self, _info: crate::BlockInfo) -> crate::error::Result<Vec<u8>> {
        Ok(Vec::new())
    }

    fn write_block(
        &mut self,
        _info: crate::BlockInfo,
        _data: &[u8],
    ) -> crate::error::Result<crate::storage::WriteOutcome> {
        Ok(crate::storage::WriteOutcome { verified: None })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_conf() -> Conf {
        Conf::new(std::env::temp_dir())
    }

    fn build_metainfo_with_privacy(private: Option<u8>) -> Metainfo {
        use sha1::{Digest, Sha1};

        let data = vec![7u8; 16];
        let raw = crate::metainfo::RawMetainfo {
            info: crate::metainfo::RawInfo {
                name: "engine-test".to_owned(),
                pieces: Sha1::digest(&data).to_vec(),
                piece_length: 16,
                length: Some(data.len() as u64),
                files: None,
                private,
            },
            announce: Some("https://tracker.example/announce".to_owned()),
            announce_list: None,
        };
        let bytes = serde_bencode::to_bytes(&raw).unwrap();
        Metainfo::from_bytes(&bytes).unwrap()
    }

    fn build_metainfo() -> Metainfo {
        build_metainfo_with_privacy(None)
    }

    #[tokio::test]
    async fn opening_the_same_torrent_twice_returns_the_same_handle() {
        let session = ClientSession::new(test_conf());
        let metainfo = build_metainfo();

        let first = session.open_torrent(metainfo.clone()).await;
        let second = session.open_torrent(metainfo.clone()).await;
        assert_eq!(first.info_hash, second.info_hash);
        assert_eq!(session.swarm_count().await, 1);
    }

    #[tokio::test]
    async fn closing_a_handle_removes_it_from_the_session() {
        let session = ClientSession::new(test_conf());
        let metainfo = build_metainfo();

        session.open_torrent(metainfo.clone()).await;
        assert_eq!(session.swarm_count().await, 1);

        session.close_handle(&metainfo.info_hash).await;
        assert_eq!(session.swarm_count().await, 0);
        assert!(session.handle(&metainfo.info_hash).await.is_none());
    }

    #[tokio::test]
    async fn a_private_metainfo_produces_a_private_handle() {
        let session = ClientSession::new(test_conf());
        let metainfo = build_metainfo_with_privacy(Some(1));
        assert!(metainfo.private);

        let handle = session.open_torrent(metainfo).await;
        assert!(handle.private);
    }

    #[tokio::test]
    async fn a_public_metainfo_produces_a_public_handle() {
        let session = ClientSession::new(test_conf());
        let metainfo = build_metainfo();
        assert!(!metainfo.private);

        let handle = session.open_torrent(metainfo).await;
        assert!(!handle.private);
    }

    #[tokio::test]
    async fn magnet_only_handles_are_idempotent_too() {
        let session = ClientSession::new(test_conf());
        let info_hash = [3u8; 20];
        let trackers = vec!["udp://tracker.example:80".to_owned()];

        let first = session.open_magnet(info_hash, trackers.clone()).await;
        let second = session.open_magnet(info_hash, trackers).await;
        assert_eq!(first.info_hash, second.info_hash);
        assert_eq!(session.swarm_count().await, 1);
    }
}
