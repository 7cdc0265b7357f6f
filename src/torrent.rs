//! State shared between every peer session of a single torrent.
//!
//! A torrent's swarm spawns one [`crate::peer::PeerSession`] per connected
//! peer; all of them need read access to the same metainfo-derived facts and
//! a way to reach the same storage backend, hence this small bundle of
//! `Arc`-friendly, mostly-immutable state.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex as AsyncMutex};

use crate::{
    progress::Progress, storage::StorageEngine, storage_info::StorageInfo, InfoHash, PeerId,
    PieceIndex, TorrentId,
};

/// Shared, read-mostly information about a torrent, held behind an `Arc` by
/// every peer session belonging to its swarm.
pub(crate) struct SharedStatus {
    /// The torrent's engine-assigned id.
    pub id: TorrentId,
    pub info_hash: InfoHash,
    /// Our own client id, sent in the handshake with every peer.
    pub client_id: PeerId,
    pub storage_info: StorageInfo,
    /// The storage backend, shared and mutably locked since peer sessions
    /// write and read blocks concurrently.
    pub storage: AsyncMutex<Box<dyn StorageEngine>>,
    /// Upload/download/left counters, updated directly by peer sessions as
    /// blocks are sent and received.
    pub progress: Arc<Progress>,
    /// Signals the swarm that a piece has been fully received and verified,
    /// so it can be announced to every other connected peer.
    pub piece_completed_tx: mpsc::UnboundedSender<PieceIndex>,
}

impl SharedStatus {
    pub fn new(
        id: TorrentId,
        info_hash: InfoHash,
        client_id: PeerId,
        storage_info: StorageInfo,
        storage: Box<dyn StorageEngine>,
        progress: Arc<Progress>,
        piece_completed_tx: mpsc::UnboundedSender<PieceIndex>,
    ) -> Self {
        Self {
            id,
            info_hash,
            client_id,
            storage_info,
            storage: AsyncMutex::new(storage),
            progress,
            piece_completed_tx,
        }
    }
}
