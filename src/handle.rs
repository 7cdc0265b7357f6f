//! The user-facing control surface for a single torrent.
//!
//! A [`Handle`] wraps a [`crate::swarm::Swarm`] with the start/stop lifecycle
//! and event stream an embedding application actually wants to drive,
//! keeping the swarm's own API narrowly focused on peer and tracker
//! mechanics.

use std::{sync::Arc, time::Duration};

use tokio::sync::{broadcast, mpsc, watch, Mutex as AsyncMutex};

use crate::{
    conf::TorrentConf,
    dht::DhtHandle,
    progress::Progress,
    storage::StorageEngine,
    storage_info::StorageInfo,
    swarm::{SlotPool, Swarm},
    torrent::SharedStatus,
    tracker::Event as TrackerEvent,
    InfoHash, PeerId, TorrentId,
};

/// How long [`Handle::stop`] waits for the best-effort `Stopped` announce
/// before giving up.
const STOP_ANNOUNCE_DEADLINE: Duration = Duration::from_secs(5);

/// A torrent's lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    Stopped,
    Running,
    Paused,
}

/// An event published on a [`Handle`]'s event stream as its torrent's state
/// changes.
#[derive(Clone, Debug)]
pub enum HandleEvent {
    /// A handle was just created for this info hash.
    TorrentAdded(InfoHash),
    StatusChanged(Status),
    Warning(String),
}

/// The user-facing control surface for a single torrent: open, start, stop,
/// and subscribe to its lifecycle, per §4.8.
pub struct Handle {
    pub info_hash: InfoHash,
    /// Private torrents (BEP 27) never get DHT-announced.
    pub private: bool,
    status: AsyncMutex<Status>,
    swarm: Arc<AsyncMutex<Swarm>>,
    trackers: Vec<String>,
    events: broadcast::Sender<HandleEvent>,
    dht: Option<Arc<AsyncMutex<dyn DhtHandle>>>,
    /// Set while an announce loop task is running; dropping or sending on
    /// this tells it to wind down.
    run_signal: AsyncMutex<Option<watch::Sender<bool>>>,
}

impl Handle {
    /// Creates a new, `Stopped` handle for a torrent, idempotently slotted
    /// into the client's handle map by `open_torrent`/`open_magnet` (this
    /// constructor itself is unconditional; the idempotence lives in
    /// `crate::engine::ClientSession`, which is the only thing allowed to
    /// call it).
    pub(crate) fn new(
        id: TorrentId,
        info_hash: InfoHash,
        client_id: PeerId,
        private: bool,
        trackers: Vec<String>,
        torrent_conf: TorrentConf,
        storage_info: StorageInfo,
        storage: Box<dyn StorageEngine>,
        progress: Arc<Progress>,
        client_slots: SlotPool,
        dht: Option<Arc<AsyncMutex<dyn DhtHandle>>>,
    ) -> Self {
        let piece_count = storage_info.piece_count;
        let (piece_completed_tx, piece_completed_rx) = mpsc::unbounded_channel();
        let torrent = Arc::new(SharedStatus::new(
            id,
            info_hash,
            client_id,
            storage_info,
            storage,
            Arc::clone(&progress),
            piece_completed_tx,
        ));
        let piece_picker = Arc::new(tokio::sync::RwLock::new(
            crate::piece_picker::PiecePicker::new(piece_count),
        ));
        let swarm = Swarm::new(
            torrent,
            piece_picker,
            torrent_conf,
            client_id,
            Arc::clone(&progress),
            dht.clone(),
            client_slots,
        );

        let (events, _) = broadcast::channel(32);
        let _ = events.send(HandleEvent::TorrentAdded(info_hash));

        let swarm = Arc::new(AsyncMutex::new(swarm));
        tokio::spawn(Self::run_piece_completion_loop(
            Arc::clone(&swarm),
            progress,
            trackers.clone(),
            piece_completed_rx,
        ));

        Self {
            info_hash,
            private,
            status: AsyncMutex::new(Status::Stopped),
            swarm,
            trackers,
            events,
            dht,
            run_signal: AsyncMutex::new(None),
        }
    }

    /// Subscribes to this torrent's lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<HandleEvent> {
        self.events.subscribe()
    }

    pub async fn status(&self) -> Status {
        *self.status.lock().await
    }

    /// Registers an already-accepted inbound connection with this torrent's
    /// swarm.
    pub async fn accept_peer(&self, addr: std::net::SocketAddr, socket: tokio::net::TcpStream) {
        self.swarm.lock().await.accept_peer(addr, socket);
    }

    /// Transitions `Stopped -> Running`, starting the tracker announce
    /// loop. A no-op (beyond re-publishing the event) if already running.
    pub async fn start(&self) {
        let mut status = self.status.lock().await;
        if *status == Status::Running {
            let _ = self.events.send(HandleEvent::StatusChanged(Status::Running));
            return;
        }
        *status = Status::Running;
        drop(status);

        if !self.private {
            if let Some(dht) = &self.dht {
                // We advertise ourselves under our own peer id so other
                // nodes can find us for this info hash; a real DHT client
                // would instead announce the info hash itself, but the
                // minimal `DhtHandle` contract only models contact storage.
                dht.lock()
                    .await
                    .insert(self.info_hash_as_peer_id(), self.listening_addr());
            }
        }

        let (run_tx, run_rx) = watch::channel(true);
        *self.run_signal.lock().await = Some(run_tx);

        let swarm = Arc::clone(&self.swarm);
        let trackers = self.trackers.clone();
        tokio::spawn(Self::run_announce_loop(swarm, trackers, run_rx));

        let _ = self.events.send(HandleEvent::StatusChanged(Status::Running));
    }

    /// Transitions `Running -> Stopped`, sending a best-effort `Stopped`
    /// announce and deregistering from the DHT. Idempotent.
    pub async fn stop(&self) {
        let mut status = self.status.lock().await;
        if *status != Status::Running {
            *status = Status::Stopped;
            let _ = self.events.send(HandleEvent::StatusChanged(Status::Stopped));
            return;
        }
        *status = Status::Stopped;
        drop(status);

        if let Some(run_tx) = self.run_signal.lock().await.take() {
            let _ = run_tx.broadcast(false);
        }

        if !self.private {
            if let Some(dht) = &self.dht {
                dht.lock().await.delete(&self.info_hash_as_peer_id());
            }
        }

        self.swarm
            .lock()
            .await
            .announce_stop(&self.trackers, STOP_ANNOUNCE_DEADLINE)
            .await;

        let _ = self.events.send(HandleEvent::StatusChanged(Status::Stopped));
    }

    /// Stops the torrent and tears down its swarm's connected sessions.
    pub async fn close(&self) {
        self.stop().await;
        self.swarm.lock().await.shutdown();
    }

    /// Announces a newly completed and verified piece to the swarm, and
    /// sends a one-time `Completed` announce if this brought the torrent to
    /// 100%.
    pub async fn notify_piece_completed(&self, index: crate::PieceIndex, is_complete: bool) {
        let mut swarm = self.swarm.lock().await;
        swarm.notify_piece_completed(index);
        if is_complete {
            swarm.tick(&self.trackers, Some(TrackerEvent::Completed)).await;
        }
    }

    /// Forwards piece completions reported by peer sessions (over
    /// `SharedStatus::piece_completed_tx`) into the swarm's `Have` broadcast,
    /// and fires a one-time `Completed` tracker announce once nothing is
    /// left to download. Runs for the handle's whole lifetime, independent
    /// of `start`/`stop`, since a piece can only complete while peer
    /// sessions are actually running.
    async fn run_piece_completion_loop(
        swarm: Arc<AsyncMutex<Swarm>>,
        progress: Arc<Progress>,
        trackers: Vec<String>,
        mut piece_completed_rx: mpsc::UnboundedReceiver<crate::PieceIndex>,
    ) {
        while let Some(index) = piece_completed_rx.recv().await {
            let mut swarm = swarm.lock().await;
            swarm.notify_piece_completed(index);
            if progress.left() == 0 {
                swarm.tick(&trackers, Some(TrackerEvent::Completed)).await;
            }
        }
    }

    async fn run_announce_loop(
        swarm: Arc<AsyncMutex<Swarm>>,
        trackers: Vec<String>,
        mut run_rx: watch::Receiver<bool>,
    ) {
        use futures::{future::FutureExt, select};

        // `watch::Receiver::recv` always yields the channel's current value
        // on its first call; consume that priming `true` here so later
        // calls in the loop below only resolve once `stop` actually flips
        // it to `false`.
        let _ = run_rx.recv().await;

        let mut interval = Duration::from_secs(0);
        let mut event = Some(TrackerEvent::Started);

        loop {
            let mut delay = tokio::time::delay_for(interval).fuse();
            select! {
                _ = delay => {},
                stopped = run_rx.recv().fuse() => {
                    if !stopped.unwrap_or(true) {
                        break;
                    }
                }
            }
            if !*run_rx.borrow() {
                break;
            }

            let mut swarm = swarm.lock().await;
            interval = swarm.tick(&trackers, event.take()).await;
        }
    }

    /// A placeholder address for our own listener; a full implementation
    /// would plumb through the port the client's inbound listener actually
    /// bound to.
    fn listening_addr(&self) -> std::net::SocketAddr {
        std::net::SocketAddr::from(([0, 0, 0, 0], 6881))
    }

    /// Derives a stand-in `PeerId` from the info hash for DHT bookkeeping
    /// purposes, since the minimal `DhtHandle` contract keys contacts by
    /// peer id rather than info hash.
    fn info_hash_as_peer_id(&self) -> PeerId {
        self.info_hash
    }
}
