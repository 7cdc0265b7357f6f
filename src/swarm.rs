//! Per-torrent swarm coordination.
//!
//! A [`Swarm`] owns everything scoped to a single torrent: the tracker
//! announce loop (falling back across tiers and between the HTTP and UDP
//! transports), the set of currently connected peer sessions, and the
//! admission control that keeps any one torrent from starving the others of
//! connection slots.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{atomic::{AtomicUsize, Ordering}, Arc},
    time::Duration,
};

use tokio::{
    net::TcpStream,
    sync::{mpsc, Mutex as AsyncMutex, RwLock},
};

use crate::{
    conf::TorrentConf,
    dht::DhtHandle,
    peer::{self, PeerSession},
    piece_picker::PiecePicker,
    progress::Progress,
    torrent::SharedStatus,
    tracker::{http, udp, Announce, Event, Response},
    PeerId, PieceIndex,
};

/// A counting pool of connection slots.
///
/// `tokio::sync::Semaphore`'s permit borrows from the semaphore itself,
/// which doesn't survive being moved into a `'static` spawned task, so
/// vacancies are instead modeled as unit values traveling through a bounded
/// channel: taking a slot is receiving one, giving it back is sending it.
#[derive(Clone)]
pub(crate) struct SlotPool {
    acquire: Arc<AsyncMutex<mpsc::Receiver<()>>>,
    release: mpsc::Sender<()>,
    available: Arc<AtomicUsize>,
}

impl SlotPool {
    pub fn new(capacity: usize) -> Self {
        let (mut release, acquire) = mpsc::channel(capacity.max(1));
        for _ in 0..capacity {
            release
                .try_send(())
                .expect("freshly created channel has room for its own capacity");
        }
        Self {
            acquire: Arc::new(AsyncMutex::new(acquire)),
            release,
            available: Arc::new(AtomicUsize::new(capacity)),
        }
    }

    /// Waits for a free slot, returning a guard that gives it back once
    /// dropped.
    async fn acquire(&self) -> SlotGuard {
        let mut acquire = self.acquire.lock().await;
        acquire
            .recv()
            .await
            .expect("the pool always retains its own release sender");
        drop(acquire);
        self.available.fetch_sub(1, Ordering::SeqCst);
        SlotGuard {
            release: self.release.clone(),
            available: Arc::clone(&self.available),
        }
    }

    /// The number of slots not currently held by a live guard. Best-effort,
    /// for observability only.
    pub fn available(&self) -> usize {
        self.available.load(Ordering::SeqCst)
    }
}

struct SlotGuard {
    release: mpsc::Sender<()>,
    available: Arc<AtomicUsize>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        let _ = self.release.try_send(());
        self.available.fetch_add(1, Ordering::SeqCst);
    }
}

/// The two-slot-pool admission protocol: a peer session is only spawned
/// once a client-wide slot and a per-torrent vacancy slot have both been
/// acquired, in that order, so a single torrent can never starve the others
/// of connections, and a single client can never open more sockets than
/// `EngineConf::max_threads` allows in total.
async fn acquire_slot(client_slots: &SlotPool, torrent_slots: &SlotPool) -> (SlotGuard, SlotGuard) {
    let client_permit = client_slots.acquire().await;
    let torrent_permit = torrent_slots.acquire().await;
    (client_permit, torrent_permit)
}

/// A tracker client capable of both transports; which one is used is
/// decided per-URL by its scheme.
enum Tracker {
    Http(http::Tracker),
    Udp(udp::Tracker),
}

impl Tracker {
    fn for_url(url: &str) -> Option<Self> {
        if url.starts_with("http://") || url.starts_with("https://") {
            Some(Self::Http(http::Tracker::new()))
        } else if let Some(rest) = url.strip_prefix("udp://") {
            let addr = rest.split('/').next()?.to_socket_addrs_first()?;
            Some(Self::Udp(udp::Tracker::new(addr)))
        } else {
            None
        }
    }

    async fn announce(&self, url: &str, params: &Announce) -> crate::tracker::TrackerResult<Response> {
        match self {
            Self::Http(tracker) => tracker.announce(url, params).await,
            Self::Udp(tracker) => tracker.announce(params).await,
        }
    }
}

/// A tiny helper trait so [`Tracker::for_url`] can parse `host:port` out of
/// a `udp://` URL without pulling in a full URL parser just for this.
trait FirstSocketAddr {
    fn to_socket_addrs_first(&self) -> Option<SocketAddr>;
}

impl FirstSocketAddr for str {
    fn to_socket_addrs_first(&self) -> Option<SocketAddr> {
        use std::net::ToSocketAddrs;
        self.to_socket_addrs().ok()?.next()
    }
}

/// Coordinates a single torrent's peers and tracker announces.
pub(crate) struct Swarm {
    torrent: Arc<SharedStatus>,
    piece_picker: Arc<RwLock<PiecePicker>>,
    conf: TorrentConf,
    client_id: PeerId,
    progress: Arc<Progress>,
    dht: Option<Arc<AsyncMutex<dyn DhtHandle>>>,
    client_slots: SlotPool,
    /// Per-torrent vacancy permits; acquired after the client-wide permit,
    /// so a single torrent's connections are capped independently of how
    /// busy the rest of the client is.
    torrent_slots: SlotPool,
    sessions: HashMap<SocketAddr, peer::Sender>,
}

impl Swarm {
    pub fn new(
        torrent: Arc<SharedStatus>,
        piece_picker: Arc<RwLock<PiecePicker>>,
        conf: TorrentConf,
        client_id: PeerId,
        progress: Arc<Progress>,
        dht: Option<Arc<AsyncMutex<dyn DhtHandle>>>,
        client_slots: SlotPool,
    ) -> Self {
        let torrent_slots = SlotPool::new(conf.seed_slot_count + conf.leech_slot_count);
        Self {
            torrent,
            piece_picker,
            conf,
            client_id,
            progress,
            dht,
            client_slots,
            torrent_slots,
            sessions: HashMap::new(),
        }
    }

    /// Runs a single announce and connects to any newly discovered peers,
    /// returning how long to wait before the next one. Called repeatedly by
    /// the owning handle's announce loop; a single iteration is exposed
    /// (rather than an internal infinite loop) so the handle can interleave
    /// it with accepting inbound connections and observing a shutdown
    /// signal without needing concurrent mutable access to the swarm.
    pub async fn tick(&mut self, trackers: &[String], event: Option<Event>) -> Duration {
        match self.announce_to_first_working_tracker(trackers, event).await {
            Some(response) => {
                let interval = response
                    .min_interval
                    .unwrap_or(response.interval)
                    .max(self.conf.announce_interval.min(response.interval));
                for peer in response.peers {
                    self.connect_to_peer(peer.addr);
                }
                interval
            }
            None => {
                log::warn!(
                    "All trackers failed for torrent {}, backing off",
                    hex::encode(self.torrent.info_hash)
                );
                self.conf.announce_interval
            }
        }
    }

    /// Sends a best-effort `Stopped` announce to the first tracker that
    /// accepts it, bounded by `deadline` so shutdown never hangs on a
    /// unresponsive tracker.
    pub async fn announce_stop(&self, trackers: &[String], deadline: Duration) {
        let announce = self.announce_to_first_working_tracker(trackers, Some(Event::Stopped));
        if tokio::time::timeout(deadline, announce).await.is_err() {
            log::warn!(
                "Stopped announce for torrent {} timed out after {:?}",
                hex::encode(self.torrent.info_hash),
                deadline
            );
        }
    }

    /// Tries each tracker in order, returning the first successful
    /// response.
    async fn announce_to_first_working_tracker(
        &self,
        trackers: &[String],
        event: Option<Event>,
    ) -> Option<Response> {
        let params = Announce {
            info_hash: self.torrent.info_hash,
            peer_id: self.client_id,
            port: 6881,
            uploaded: self.progress.uploaded(),
            downloaded: self.progress.downloaded(),
            left: self.progress.left(),
            event,
            peer_count: Some(self.conf.min_requested_peer_count),
        };

        for url in trackers {
            let tracker = match Tracker::for_url(url) {
                Some(tracker) => tracker,
                None => continue,
            };
            match tracker.announce(url, &params).await {
                Ok(response) => return Some(response),
                Err(e) => {
                    log::warn!("Tracker {} announce failed: {}", url, e);
                }
            }
        }
        None
    }

    /// Spawns a peer session for `addr` if we aren't already connected to
    /// it, once slots are available. Does not block the caller: admission
    /// happens in the spawned task so a slow/full swarm doesn't stall the
    /// announce loop.
    fn connect_to_peer(&mut self, addr: SocketAddr) {
        if self.sessions.contains_key(&addr) {
            return;
        }

        let (session, cmd_chan) = PeerSession::outbound(
            Arc::clone(&self.torrent),
            Arc::clone(&self.piece_picker),
            self.dht.clone(),
            addr,
        );
        self.sessions.insert(addr, cmd_chan);
        self.spawn_session(session, addr);
    }

    /// Registers and runs an already-accepted inbound connection.
    pub fn accept_peer(&mut self, addr: SocketAddr, socket: TcpStream) {
        let (mut session, cmd_chan) = PeerSession::inbound(
            Arc::clone(&self.torrent),
            Arc::clone(&self.piece_picker),
            self.dht.clone(),
            addr,
        );
        self.sessions.insert(addr, cmd_chan);

        let client_slots = self.client_slots.clone();
        let torrent_slots = self.torrent_slots.clone();
        tokio::spawn(async move {
            let (_client_permit, _torrent_permit) =
                acquire_slot(&client_slots, &torrent_slots).await;
            if let Err(e) = session.start_accepted(socket).await {
                log::warn!("Peer {} session ended: {}", addr, e);
            }
        });
    }

    fn spawn_session(&self, mut session: PeerSession, addr: SocketAddr) {
        let client_slots = self.client_slots.clone();
        let torrent_slots = self.torrent_slots.clone();
        tokio::spawn(async move {
            let (_client_permit, _torrent_permit) =
                acquire_slot(&client_slots, &torrent_slots).await;
            if let Err(e) = session.start().await {
                log::warn!("Peer {} session ended: {}", addr, e);
            }
        });
    }

    /// Announces a newly completed and verified piece to every connected
    /// peer.
    pub fn notify_piece_completed(&mut self, index: PieceIndex) {
        self.sessions.retain(|addr, sender| {
            if sender.send(peer::Command::PieceCompleted(index)).is_err() {
                log::debug!("Peer {} session channel closed, dropping", addr);
                false
            } else {
                true
            }
        });
    }

    /// Requests every connected peer session to shut down.
    pub fn shutdown(&mut self) {
        for (_, sender) in self.sessions.drain() {
            let _ = sender.send(peer::Command::Shutdown);
        }
    }
}
