//! The crate-wide error type and the error taxonomy used across the engine.
//!
//! Peer-level errors never escape the peer session task, and tracker errors
//! never escape the swarm task that owns the tracker client (see
//! `peer::session` and `swarm`, respectively); only the handful of fatal
//! variants below are meant to reach the [`crate::handle::Handle`] layer.

use std::{fmt, io};

/// The crate-wide result type, for convenience.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// All errors that may surface from the engine's public API.
///
/// This does not include peer- or tracker-local errors, which are contained
/// to their owning task; see [`PeerError`] and [`TrackerError`].
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// A torrent id was used that doesn't correspond to any swarm known to
    /// the client.
    InvalidTorrentId,
    /// A piece index was used that is out of bounds for the torrent.
    InvalidPieceIndex,
    /// The `.torrent` metainfo could not be parsed, or was structurally
    /// invalid (e.g. a `pieces` string not a multiple of 20 bytes).
    InvalidMetainfo(String),
    /// The storage engine reported an I/O failure.
    Storage(io::Error),
    /// A fatal, client-terminating condition: out of memory, the timer
    /// service died, or the listener couldn't bind to any port in its
    /// default range.
    Fatal(FatalError),
}

/// Conditions that terminate the whole client, not just a single torrent or
/// peer session.
#[derive(Debug)]
pub enum FatalError {
    /// The allocator reported it's out of memory while handling engine
    /// state.
    OutOfMemory,
    /// The shared timer service could not be driven any further.
    TimerServiceFailure,
    /// None of the ports in the default listener range (6881..6889) could be
    /// bound.
    ListenerBindFailure,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidTorrentId => write!(f, "invalid torrent id"),
            Self::InvalidPieceIndex => write!(f, "invalid piece index"),
            Self::InvalidMetainfo(detail) => write!(f, "invalid metainfo: {}", detail),
            Self::Storage(e) => write!(f, "storage error: {}", e),
            Self::Fatal(e) => write!(f, "fatal error: {}", e),
        }
    }
}

impl fmt::Display for FatalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory => write!(f, "out of memory"),
            Self::TimerServiceFailure => write!(f, "timer service failure"),
            Self::ListenerBindFailure => {
                write!(f, "could not bind to any default listener port")
            }
        }
    }
}

impl std::error::Error for Error {}
impl std::error::Error for FatalError {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Storage(e)
    }
}

/// Errors that are local to a single peer session.
///
/// Per §5/§7 of the design, none of these escape the session task that
/// produced them: the session logs the error and transitions to `Closed`.
#[derive(Debug)]
#[non_exhaustive]
pub enum PeerError {
    /// A malformed handshake or wire message was received. Carries a short,
    /// human-readable description of what was wrong.
    Protocol(String),
    /// The peer's handshake carried an info hash different from ours.
    InvalidInfoHash,
    /// A `Bitfield` message arrived somewhere other than immediately after
    /// the handshake.
    BitfieldNotAfterHandshake,
    /// An unknown peer-wire message id was received.
    UnknownMessageId(u8),
    /// The 120s incoming-data timer expired with nothing received from the
    /// peer, or the peer otherwise cleanly closed the socket.
    Disconnected,
    /// The underlying socket errored.
    Io(io::Error),
}

pub type PeerResult<T> = std::result::Result<T, PeerError>;

impl fmt::Display for PeerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Protocol(detail) => write!(f, "protocol error: {}", detail),
            Self::InvalidInfoHash => {
                write!(f, "peer handshake info hash mismatch")
            }
            Self::BitfieldNotAfterHandshake => {
                write!(f, "bitfield message sent outside of availability exchange")
            }
            Self::UnknownMessageId(id) => {
                write!(f, "unknown message id: {}", id)
            }
            Self::Disconnected => write!(f, "peer disconnected"),
            Self::Io(e) => write!(f, "peer io error: {}", e),
        }
    }
}

impl std::error::Error for PeerError {}

impl From<io::Error> for PeerError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

