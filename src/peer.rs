mod codec;

use {
    futures::{
        future::FutureExt,
        select,
        stream::{Fuse, SplitSink, SplitStream},
        SinkExt, StreamExt,
    },
    std::{net::SocketAddr, sync::Arc, time::Duration},
    tokio::{
        net::TcpStream,
        sync::{
            mpsc::{self, UnboundedReceiver, UnboundedSender},
            Mutex as AsyncMutex, RwLock,
        },
    },
    tokio_util::codec::{Framed, FramedParts},
};

use {
    crate::{
        dht::DhtHandle, download::PieceDownload, error::PeerError, error::PeerResult,
        piece_picker::PiecePicker, torrent::SharedStatus, Bitfield, BlockInfo, PeerId, PieceIndex,
    },
    codec::*,
};

type PeerSink = SplitSink<Framed<TcpStream, PeerCodec>, Message>;
type PeerStream = SplitStream<Framed<TcpStream, PeerCodec>>;

/// If nothing at all arrives from a peer for this long, the connection is
/// considered dead and dropped.
const INCOMING_TIMEOUT: Duration = Duration::from_secs(120);
/// How often we send a keep-alive to the peer during idle periods, so our
/// own side of the connection doesn't get dropped by their timeout.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(90);

pub(crate) struct PeerSession {
    /// Shared information of the torrent.
    torrent: Arc<SharedStatus>,
    /// The piece picker picks the next most optimal piece to download and is
    /// shared by other entities in the same torrent.
    piece_picker: Arc<RwLock<PiecePicker>>,
    /// Inserted into with every `Port` message we see; `None` if no DHT
    /// collaborator is wired in (e.g. the torrent was opened without DHT
    /// support).
    dht: Option<Arc<AsyncMutex<dyn DhtHandle>>>,
    /// The port on which peer session receives commands.
    cmd_port: Fuse<Receiver>,
    /// The remote address of the peer.
    addr: SocketAddr,
    /// Whether we initiated the connection or accepted it from a listener.
    is_outbound: bool,
    /// Session related information.
    status: Status,
    /// These are the active piece downloads in which this session is
    /// participating.
    downloads: Vec<PieceDownload>,
    /// Our pending requests that we sent to peer. It represents the blocks
    /// that we are expecting. Thus, if we receive a block that is not in
    /// this list, it is dropped. If we receive a block whose request entry
    /// is in here, the entry is removed.
    ///
    /// Since the Fast extension is not supported (yet), this is emptied when
    /// we're choked, as in that case we don't expect outstanding requests to
    /// be served.
    outgoing_requests: Vec<BlockInfo>,
    /// Information about a peer that is set after a successful handshake.
    peer_info: Option<PeerInfo>,
}

impl PeerSession {
    /// Creates a new outbound session that will connect to the peer at
    /// `addr` once [`start`](Self::start) is called.
    pub fn outbound(
        torrent: Arc<SharedStatus>,
        piece_picker: Arc<RwLock<PiecePicker>>,
        dht: Option<Arc<AsyncMutex<dyn DhtHandle>>>,
        addr: SocketAddr,
    ) -> (Self, Sender) {
        Self::new(torrent, piece_picker, dht, addr, true)
    }

    /// Creates a new inbound session for a connection already accepted by
    /// the torrent's listener.
    pub fn inbound(
        torrent: Arc<SharedStatus>,
        piece_picker: Arc<RwLock<PiecePicker>>,
        dht: Option<Arc<AsyncMutex<dyn DhtHandle>>>,
        addr: SocketAddr,
    ) -> (Self, Sender) {
        Self::new(torrent, piece_picker, dht, addr, false)
    }

    fn new(
        torrent: Arc<SharedStatus>,
        piece_picker: Arc<RwLock<PiecePicker>>,
        dht: Option<Arc<AsyncMutex<dyn DhtHandle>>>,
        addr: SocketAddr,
        is_outbound: bool,
    ) -> (Self, Sender) {
        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
        (
            Self {
                torrent,
                piece_picker,
                dht,
                cmd_port: cmd_port.fuse(),
                addr,
                is_outbound,
                status: Status::default(),
                downloads: Vec::new(),
                outgoing_requests: Vec::new(),
                peer_info: None,
            },
            cmd_chan,
        )
    }

    /// Connects to the peer and runs the session until the connection
    /// closes or an unrecoverable error occurs.
    pub async fn start(&mut self) -> PeerResult<()> {
        log::info!("Starting peer {} session", self.addr);
        log::info!("Connecting to peer {}", self.addr);
        self.status.state = State::Connecting;
        let socket = TcpStream::connect(self.addr).await?;
        log::info!("Connected to peer {}", self.addr);
        self.run_handshake(socket).await
    }

    /// Runs the session over an already-accepted inbound connection.
    pub async fn start_accepted(&mut self, socket: TcpStream) -> PeerResult<()> {
        log::info!("Starting accepted peer {} session", self.addr);
        self.run_handshake(socket).await
    }

    /// Performs the handshake (initiating it if outbound, responding to it
    /// if inbound), then switches the connection over to the peer message
    /// codec and runs the session loop.
    async fn run_handshake(&mut self, socket: TcpStream) -> PeerResult<()> {
        self.status.state = State::Handshaking;
        let mut socket = Framed::new(socket, HandshakeCodec);
        let handshake = Handshake::new(self.torrent.info_hash, self.torrent.client_id);

        if self.is_outbound {
            log::info!("Sending handshake to peer {}", self.addr);
            socket.send(handshake).await?;
        }

        log::info!("Waiting for peer {} handshake", self.addr);
        let peer_handshake = socket.next().await.ok_or(PeerError::Disconnected)??;
        log::info!("Received handshake from peer {}", self.addr);
        log::debug!("Peer {} handshake: {:?}", self.addr, peer_handshake);
        // codec should only return handshake if the protocol string in it
        // is valid
        debug_assert_eq!(&peer_handshake.prot[..], PROTOCOL_STRING.as_bytes());

        if peer_handshake.info_hash != self.torrent.info_hash {
            log::info!("Peer {} handshake invalid info hash", self.addr);
            return Err(PeerError::InvalidInfoHash);
        }

        if !self.is_outbound {
            log::info!("Sending handshake to peer {}", self.addr);
            socket.send(handshake).await?;
        }

        self.peer_info = Some(PeerInfo {
            peer_id: peer_handshake.peer_id,
            pieces: None,
        });

        // now that we have the handshake, we need to switch to the peer
        // message codec (reusing the buffers, which may already contain
        // bytes of a message the peer sent right after the handshake)
        let old_parts = socket.into_parts();
        let mut new_parts = FramedParts::new(old_parts.io, PeerCodec);
        new_parts.read_buf = old_parts.read_buf;
        new_parts.write_buf = old_parts.write_buf;
        let socket = Framed::from_parts(new_parts);

        self.status.state = State::AvailabilityExchange;
        log::info!(
            "Peer {} session state: {:?}",
            self.addr,
            self.status.state
        );

        let result = self.run(socket).await;
        self.disconnect_cleanup().await;
        result
    }

    /// Runs the session after the handshake and codec switch: sends our own
    /// bitfield (if we have any pieces), then loops exchanging messages and
    /// commands until the connection closes.
    async fn run(&mut self, socket: Framed<TcpStream, PeerCodec>) -> PeerResult<()> {
        let (mut sink, stream) = socket.split();
        let mut stream = stream.fuse();

        let own_bitfield = self.piece_picker.read().await.own_bitfield();
        if !own_bitfield.have_none() {
            log::info!("Sending bitfield to peer {}", self.addr);
            sink.send(Message::Bitfield(own_bitfield)).await?;
        }

        self.message_loop(&mut sink, &mut stream).await
    }

    async fn message_loop(
        &mut self,
        sink: &mut PeerSink,
        stream: &mut Fuse<PeerStream>,
    ) -> PeerResult<()> {
        let mut incoming_timeout = tokio::time::delay_for(INCOMING_TIMEOUT).fuse();
        let mut keepalive_interval = tokio::time::interval(KEEPALIVE_INTERVAL).fuse();

        loop {
            select! {
                msg = stream.select_next_some() => {
                    let msg = msg?;
                    log::debug!(
                        "Received message {:?} from peer {}",
                        msg.id(),
                        self.addr,
                    );
                    incoming_timeout = tokio::time::delay_for(INCOMING_TIMEOUT).fuse();

                    // the bitfield message may only be received directly
                    // after the handshake; if the peer sends anything else
                    // first, it simply has no pieces to declare
                    if self.status.state == State::AvailabilityExchange {
                        if let Message::Bitfield(bitfield) = msg {
                            self.handle_bitfield_msg(sink, bitfield).await?;
                            self.status.state = State::Connected;
                        } else {
                            self.status.state = State::Connected;
                            log::info!(
                                "Peer {} session state: {:?}",
                                self.addr,
                                self.status.state
                            );
                            self.handle_msg(sink, msg).await?;
                        }
                    } else {
                        self.handle_msg(sink, msg).await?;
                    }
                }
                cmd = self.cmd_port.select_next_some() => {
                    match cmd {
                        Command::Shutdown => {
                            log::info!("Shutting down peer {} session", self.addr);
                            break;
                        }
                        Command::PieceCompleted(index) => {
                            log::debug!(
                                "Announcing piece {} to peer {}",
                                index,
                                self.addr
                            );
                            sink.send(Message::Have { piece_index: index }).await?;
                        }
                    }
                }
                _ = incoming_timeout => {
                    log::info!(
                        "Peer {} sent nothing for {:?}, disconnecting",
                        self.addr,
                        INCOMING_TIMEOUT
                    );
                    return Err(PeerError::Disconnected);
                }
                _ = keepalive_interval.next() => {
                    log::debug!("Sending keep-alive to peer {}", self.addr);
                    sink.send(Message::KeepAlive).await?;
                }
            }
        }

        Ok(())
    }

    /// Handles the message expected in the `AvailabilityExchange` state.
    async fn handle_bitfield_msg(
        &mut self,
        sink: &mut PeerSink,
        mut bitfield: Bitfield,
    ) -> PeerResult<()> {
        debug_assert_eq!(self.status.state, State::AvailabilityExchange);
        log::info!("Handling peer {} Bitfield message", self.addr);
        log::trace!("Bitfield: {:?}", bitfield);

        // the bitfield raw data sent over the wire may be longer than the
        // logical pieces it represents, if the number of pieces isn't a
        // multiple of 8; truncate (or pad) it to the torrent's actual piece
        // count
        bitfield.adjust_size(self.torrent.storage_info.piece_count);

        let peer_id = self.peer_id();
        {
            let mut piece_picker = self.piece_picker.write().await;
            piece_picker.register_peer(peer_id, bitfield.clone());
            self.status.is_interested = piece_picker.is_interested_in(&peer_id);
        }
        if let Some(peer_info) = &mut self.peer_info {
            peer_info.pieces = Some(bitfield);
        }

        if self.status.is_interested {
            log::info!("Interested in peer {}", self.addr);
            sink.send(Message::Interested).await?;
            // This is the start of the download, so set the request queue
            // size so we can request blocks. Set it optimistically to 4 for
            // now, but later we'll have a TCP-like slow start algorithm for
            // quickly finding the ideal request queue size.
            self.status.best_request_queue_len = Some(4);
        }

        Ok(())
    }

    /// Handles messages expected in the `Connected` state.
    async fn handle_msg(&mut self, sink: &mut PeerSink, msg: Message) -> PeerResult<()> {
        match msg {
            Message::Bitfield(_) => {
                log::info!(
                    "Peer {} sent bitfield message not after handshake",
                    self.addr
                );
                return Err(PeerError::BitfieldNotAfterHandshake);
            }
            Message::KeepAlive => {
                log::info!("Peer {} sent keep alive", self.addr);
            }
            Message::Choke => {
                if !self.status.is_choked {
                    log::info!("Peer {} choked us", self.addr);
                    // since we're choked we don't expect to receive blocks
                    // for our pending requests
                    self.outgoing_requests.clear();
                    self.status.is_choked = true;
                }
            }
            Message::Unchoke => {
                if self.status.is_choked {
                    log::info!("Peer {} unchoked us", self.addr);
                    self.status.is_choked = false;
                    // now that we are allowed to request blocks, start the
                    // download pipeline if we're interested
                    self.make_requests(sink).await?;
                }
            }
            Message::Interested => {
                if !self.status.is_peer_interested {
                    log::info!("Peer {} is interested", self.addr);
                    self.status.is_peer_interested = true;
                }
                if self.status.is_peer_choked {
                    // no congestion control or slot accounting in this
                    // session: any interested peer gets unchoked, trusting
                    // the swarm's admission semaphores to bound how many
                    // peers we're connected to in the first place
                    log::info!("Unchoking peer {}", self.addr);
                    self.status.is_peer_choked = false;
                    sink.send(Message::Unchoke).await?;
                }
            }
            Message::NotInterested => {
                if self.status.is_peer_interested {
                    log::info!("Peer {} is not interested", self.addr);
                    self.status.is_peer_interested = false;
                }
            }
            Message::Have { piece_index } => {
                self.handle_have_msg(sink, piece_index).await?;
            }
            Message::Request(block_info) => {
                self.handle_request_msg(sink, block_info).await?;
            }
            Message::Cancel(block_info) => {
                log::debug!(
                    "Peer {} cancelled request {:?} (ignored, replies are synchronous)",
                    self.addr,
                    block_info
                );
            }
            Message::Port(port) => {
                self.handle_port_msg(port).await;
            }
            Message::Block {
                piece_index,
                offset,
                data,
            } => {
                let block_info = BlockInfo {
                    piece_index,
                    offset,
                    len: data.len() as u32,
                };
                self.handle_block_msg(block_info, data).await?;

                // we may be able to make more requests now that a block has
                // arrived
                self.make_requests(sink).await?;
            }
        }

        Ok(())
    }

    async fn handle_have_msg(
        &mut self,
        sink: &mut PeerSink,
        piece_index: PieceIndex,
    ) -> PeerResult<()> {
        log::info!("Peer {} has piece {}", self.addr, piece_index);
        let peer_id = self.peer_id();
        let became_interesting = {
            let mut piece_picker = self.piece_picker.write().await;
            piece_picker.update_peer_have(peer_id, piece_index);
            !self.status.is_interested && piece_picker.is_interested_in(&peer_id)
        };
        if became_interesting {
            self.status.is_interested = true;
            sink.send(Message::Interested).await?;
            if self.status.best_request_queue_len.is_none() {
                self.status.best_request_queue_len = Some(4);
            }
        }
        Ok(())
    }

    async fn handle_request_msg(
        &mut self,
        sink: &mut PeerSink,
        block_info: BlockInfo,
    ) -> PeerResult<()> {
        if self.status.is_peer_choked {
            log::debug!(
                "Peer {} requested block {:?} while choked, ignoring",
                self.addr,
                block_info
            );
            return Ok(());
        }

        log::info!("Peer {} requested block {:?}", self.addr, block_info);
        let data = {
            let storage = self.torrent.storage.lock().await;
            storage
                .read_block(block_info)
                .map_err(|e| PeerError::Protocol(e.to_string()))?
        };
        self.status.uploaded_block_bytes_count += data.len() as u64;
        self.torrent.progress.record_upload(data.len() as u64);
        sink.send(Message::Block {
            piece_index: block_info.piece_index,
            offset: block_info.offset,
            data,
        })
        .await?;

        Ok(())
    }

    async fn handle_port_msg(&mut self, port: u16) {
        log::info!("Peer {} advertised DHT port {}", self.addr, port);
        if let (Some(peer_info), Some(dht)) = (&self.peer_info, &self.dht) {
            let dht_addr = SocketAddr::new(self.addr.ip(), port);
            dht.lock().await.insert(peer_info.peer_id, dht_addr);
        }
    }

    /// Fills the session's download pipeline with the optimal number of
    /// requests.
    async fn make_requests(&mut self, sink: &mut PeerSink) -> PeerResult<()> {
        log::trace!("Making requests to peer {}", self.addr);

        let mut blocks = Vec::new();

        // If we have active downloads, prefer to continue those. This will
        // result in less in-progress pieces.
        for download in self.downloads.iter_mut() {
            log::debug!(
                "Peer {} trying to continue download {}",
                self.addr,
                download.piece_index()
            );

            debug_assert!(
                self.status.best_request_queue_len.unwrap_or_default()
                    >= self.outgoing_requests.len()
            );
            let to_request_count = self.status.best_request_queue_len.unwrap_or_default()
                - self.outgoing_requests.len();
            if to_request_count == 0 {
                break;
            }

            download.pick_blocks(to_request_count, &mut blocks);
        }

        // while we can make more requests we start new download(s)
        let peer_id = self.peer_id();
        loop {
            debug_assert!(
                self.status.best_request_queue_len.unwrap_or_default()
                    >= self.outgoing_requests.len()
            );
            let request_queue_len = self.status.best_request_queue_len.unwrap_or_default()
                - self.outgoing_requests.len();
            if request_queue_len == 0 {
                break;
            }

            log::debug!("Session {} starting new piece download", self.addr);

            let picked = {
                let mut piece_picker = self.piece_picker.write().await;
                let picked = piece_picker.pick_piece(&peer_id);
                if let Some(index) = picked {
                    piece_picker.mark_requested(index);
                }
                picked
            };

            if let Some(index) = picked {
                log::info!("Session {} picked piece {}", self.addr, index);

                let piece_len = self
                    .torrent
                    .storage_info
                    .piece_len(index)
                    .map_err(|e| PeerError::Protocol(e.to_string()))?;
                let mut download = PieceDownload::new(index, piece_len);

                download.pick_blocks(request_queue_len, &mut blocks);
                self.downloads.push(download);
            } else {
                log::debug!("Could not pick more pieces from peer {}", self.addr);
                break;
            }
        }

        self.outgoing_requests.extend_from_slice(&blocks);
        for block in blocks.iter() {
            sink.send(Message::Request(*block)).await?;
        }

        Ok(())
    }

    /// Verifies block validity, registers the download (and finishes a
    /// piece download if this was the last missing block in piece) and
    /// updates statistics about the download.
    async fn handle_block_msg(&mut self, block_info: BlockInfo, data: Vec<u8>) -> PeerResult<()> {
        log::info!("Received block from peer {}: {:?}", self.addr, block_info);

        let block_pos = match self
            .outgoing_requests
            .iter()
            .position(|b| *b == block_info)
        {
            Some(pos) => pos,
            None => {
                log::warn!(
                    "Peer {} sent not requested block: {:?}",
                    self.addr,
                    block_info,
                );
                // silently ignore this block if we didn't expect it
                return Ok(());
            }
        };
        self.outgoing_requests.remove(block_pos);

        let download_pos = self
            .downloads
            .iter()
            .position(|d| d.piece_index() == block_info.piece_index);
        // this fires as a result of a broken invariant: we shouldn't have an
        // entry in `outgoing_requests` without a corresponding entry in
        // `downloads`
        debug_assert!(download_pos.is_some());
        let download_pos = download_pos.unwrap();
        let download = &mut self.downloads[download_pos];
        download.received_block(block_info);
        let missing_blocks_count = download.count_missing_blocks();

        let outcome = {
            let mut storage = self.torrent.storage.lock().await;
            storage
                .write_block(block_info, &data)
                .map_err(|e| PeerError::Protocol(e.to_string()))?
        };
        self.torrent.progress.record_download(data.len() as u64);

        if missing_blocks_count == 0 {
            self.downloads.remove(download_pos);
            let mut piece_picker = self.piece_picker.write().await;
            match outcome.verified {
                Some(true) => {
                    log::info!(
                        "Finished and verified piece {} via peer {}",
                        block_info.piece_index,
                        self.addr
                    );
                    piece_picker.mark_have(block_info.piece_index);
                    if self
                        .torrent
                        .piece_completed_tx
                        .send(block_info.piece_index)
                        .is_err()
                    {
                        log::debug!(
                            "Piece {} completed but the swarm's completion \
                             channel is already closed",
                            block_info.piece_index
                        );
                    }
                }
                Some(false) => {
                    log::warn!(
                        "Piece {} failed hash verification, will retry",
                        block_info.piece_index
                    );
                    piece_picker.mark_missing(block_info.piece_index);
                }
                None => {
                    log::error!(
                        "Piece {} had no missing blocks left but storage \
                         reported it incomplete",
                        block_info.piece_index
                    );
                    piece_picker.mark_missing(block_info.piece_index);
                }
            }
        }

        self.status.downloaded_block_bytes_count += block_info.len as u64;

        Ok(())
    }

    fn peer_id(&self) -> PeerId {
        self.peer_info
            .as_ref()
            .expect("peer id only available after handshake")
            .peer_id
    }

    /// Unregisters this session from the shared piece picker and releases
    /// any pieces it had in flight back to `Missing`, so other sessions can
    /// pick them up.
    async fn disconnect_cleanup(&mut self) {
        let peer_id = self.peer_info.as_ref().map(|info| info.peer_id);
        let mut piece_picker = self.piece_picker.write().await;
        if let Some(peer_id) = peer_id {
            piece_picker.unregister_peer(&peer_id);
        }
        for download in &self.downloads {
            piece_picker.mark_missing(download.piece_index());
        }
    }
}

/// The channel on which torrent can send a command to the peer session task.
pub(crate) type Sender = UnboundedSender<Command>;
type Receiver = UnboundedReceiver<Command>;

/// The commands peer session can receive.
pub(crate) enum Command {
    /// Eventually shut down the peer session.
    Shutdown,
    /// Another session in this torrent finished and verified a piece;
    /// advertise it to this session's peer.
    PieceCompleted(PieceIndex),
}

/// The status of a peer session.
///
/// By default, both sides of the connection start off as choked and not
/// interested in the other.
#[derive(Clone, Copy, Debug)]
struct Status {
    /// The current state of the session.
    state: State,
    /// If we're choked, peer doesn't allow us to download pieces from them.
    is_choked: bool,
    /// If we're interested, peer has pieces that we don't have.
    is_interested: bool,
    /// If peer is choked, we don't allow them to download pieces from us.
    is_peer_choked: bool,
    /// If peer is interested in us, they mean to download pieces that we
    /// have.
    is_peer_interested: bool,
    /// The request queue size, which is the number of block requests we
    /// keep outstanding to fully saturate the link. Only set once we start
    /// downloading.
    best_request_queue_len: Option<usize>,
    /// The number of piece/block bytes downloaded.
    downloaded_block_bytes_count: u64,
    /// The number of piece/block bytes uploaded.
    uploaded_block_bytes_count: u64,
}

impl Default for Status {
    fn default() -> Self {
        Self {
            state: State::default(),
            is_choked: true,
            is_interested: false,
            is_peer_choked: true,
            is_peer_interested: false,
            best_request_queue_len: None,
            downloaded_block_bytes_count: 0,
            uploaded_block_bytes_count: 0,
        }
    }
}

/// At any given time, a connection with a peer is in one of the below
/// states.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum State {
    /// The peer connection has not yet been connected or it had been
    /// connected before but has been stopped.
    Disconnected,
    /// The state during which the TCP connection is established.
    Connecting,
    /// The state after establishing the TCP connection and exchanging the
    /// initial BitTorrent handshake.
    Handshaking,
    /// Used to verify that the bitfield exchange occurs right after the
    /// handshake and not later. Set once the handshakes are exchanged and
    /// changed as soon as we receive the bitfield, or any other message,
    /// whichever comes first.
    AvailabilityExchange,
    /// The normal state of a peer session, in which any messages apart from
    /// the handshake and the bitfield (sent elsewhere than right after the
    /// handshake) may be exchanged.
    Connected,
}

impl Default for State {
    fn default() -> Self {
        Self::Disconnected
    }
}

/// Information about the peer we're connected to.
struct PeerInfo {
    /// Peer's 20 byte BitTorrent id.
    peer_id: PeerId,
    /// All pieces peer has, updated when it announces to us a new piece.
    pieces: Option<Bitfield>,
}
