//! The tracker client: HTTP (BEP 3) and UDP (BEP 15) announce/scrape.
//!
//! Both transports speak the same logical protocol (announce our progress,
//! get back an interval and a peer list; optionally scrape swarm-wide
//! stats), so the request/response types here are transport-agnostic and
//! [`http`] / [`udp`] each provide a concrete client implementing the
//! wire-level differences.

pub mod http;
pub mod udp;

use std::{fmt, io, net::SocketAddr, time::Duration};

use crate::{InfoHash, PeerId};

/// Errors that may occur while talking to a tracker.
///
/// As with [`crate::error::PeerError`], these never escape the swarm task
/// that owns the tracker client; a failed announce just means the swarm
/// falls back to its next tracker tier, or waits and retries.
#[derive(Debug)]
#[non_exhaustive]
pub enum TrackerError {
    /// The underlying HTTP request failed.
    Http(reqwest::Error),
    /// The tracker's bencoded response couldn't be parsed.
    Bencode(String),
    /// The UDP response's transaction id didn't match the one we sent.
    TransactionIdMismatch,
    /// The UDP response's action code didn't match what we requested.
    UnexpectedAction(u32),
    /// The UDP response was shorter than its fixed header requires.
    ResponseTooShort,
    /// The tracker reported a failure reason in its response body.
    Failure(String),
    /// All retry attempts were exhausted without a usable response.
    RetriesExhausted,
    /// The underlying UDP socket errored.
    Io(io::Error),
}

impl fmt::Display for TrackerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http(e) => write!(f, "tracker http error: {}", e),
            Self::Bencode(detail) => write!(f, "tracker bencode error: {}", detail),
            Self::TransactionIdMismatch => {
                write!(f, "tracker response transaction id mismatch")
            }
            Self::UnexpectedAction(action) => {
                write!(f, "tracker response had unexpected action: {}", action)
            }
            Self::ResponseTooShort => write!(f, "tracker response too short"),
            Self::Failure(reason) => write!(f, "tracker reported failure: {}", reason),
            Self::RetriesExhausted => write!(f, "tracker retries exhausted"),
            Self::Io(e) => write!(f, "tracker io error: {}", e),
        }
    }
}

impl std::error::Error for TrackerError {}

impl From<reqwest::Error> for TrackerError {
    fn from(e: reqwest::Error) -> Self {
        Self::Http(e)
    }
}

impl From<io::Error> for TrackerError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

pub type TrackerResult<T> = std::result::Result<T, TrackerError>;

/// The event to report on an announce, per BEP 3.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Event {
    /// Sent on the first announce of a download.
    Started,
    /// Sent once the download completes.
    Completed,
    /// Sent when the client is gracefully shutting down.
    Stopped,
}

impl Event {
    /// The string used for the HTTP `event` query parameter.
    pub fn as_http_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Completed => "completed",
            Self::Stopped => "stopped",
        }
    }

    /// The numeric code used for the UDP announce request's `event` field.
    pub fn as_udp_code(&self) -> u32 {
        match self {
            Self::Started => 2,
            Self::Completed => 1,
            Self::Stopped => 3,
        }
    }
}

/// The parameters of an announce request, shared between the HTTP and UDP
/// transports.
#[derive(Clone, Debug)]
pub struct Announce {
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: Option<Event>,
    /// If set, only peers compatible with this count are requested; `None`
    /// lets the tracker pick a default.
    pub peer_count: Option<usize>,
}

/// A peer contact returned by a tracker, either from a compact byte-string
/// (BEP 23) or a full peer dictionary.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Peer {
    pub addr: SocketAddr,
}

/// The normalized result of an announce, regardless of transport.
#[derive(Clone, Debug)]
pub struct Response {
    /// How long to wait before the next announce.
    pub interval: Duration,
    /// The tracker's requested minimum interval, if any; clients should
    /// never announce more often than this even on error retries.
    pub min_interval: Option<Duration>,
    pub seeder_count: Option<u32>,
    pub leecher_count: Option<u32>,
    pub peers: Vec<Peer>,
}

/// The normalized result of a scrape, for a single torrent.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScrapeInfo {
    pub seeder_count: u32,
    pub completed_count: u32,
    pub leecher_count: u32,
}

/// Derives a scrape URL from an announce URL, per the convention (not
/// codified by the original BitTorrent spec, but followed by essentially
/// every tracker and client) that scrape lives at the same path with its
/// last segment, `announce`, replaced by `scrape`.
///
/// Returns `None` if the announce URL's last path segment isn't literally
/// `announce`, since scraping isn't supported in that case.
///
/// The split only ever looks at the path component, before any `?` query
/// string, per BEP 48 — a query string may itself contain `/`, which would
/// otherwise be mistaken for a path separator.
///
/// ```text
/// http://example.com/announce           -> http://example.com/scrape
/// http://example.com/x/announce         -> http://example.com/x/scrape
/// http://example.com/announce.php       -> http://example.com/scrape.php
/// http://example.com/announce?x=2/4     -> http://example.com/scrape?x=2/4
/// http://example.com/a                   -> None
/// http://example.com/announce/x          -> None
/// ```
pub fn derive_scrape_url(announce: &str) -> Option<String> {
    let (path, query) = match announce.find('?') {
        Some(idx) => (&announce[..idx], &announce[idx..]),
        None => (announce, ""),
    };
    let (prefix, last_segment) = path.rsplit_once('/')?;
    let suffix = last_segment.strip_prefix("announce")?;
    Some(format!("{}/scrape{}{}", prefix, suffix, query))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_scrape_url_from_plain_announce_path() {
        assert_eq!(
            derive_scrape_url("http://example.com/announce"),
            Some("http://example.com/scrape".to_owned())
        );
    }

    #[test]
    fn derives_scrape_url_from_nested_announce_path() {
        assert_eq!(
            derive_scrape_url("http://example.com/x/announce"),
            Some("http://example.com/x/scrape".to_owned())
        );
    }

    #[test]
    fn derives_scrape_url_preserving_a_suffix() {
        assert_eq!(
            derive_scrape_url("http://example.com/announce.php"),
            Some("http://example.com/scrape.php".to_owned())
        );
    }

    #[test]
    fn no_scrape_url_when_last_segment_is_not_announce() {
        assert_eq!(derive_scrape_url("http://example.com/a"), None);
        assert_eq!(derive_scrape_url("http://example.com/announce/x"), None);
    }

    #[test]
    fn derives_scrape_url_ignoring_slashes_in_the_query_string() {
        assert_eq!(
            derive_scrape_url("http://example.com/announce?x=2/4"),
            Some("http://example.com/scrape?x=2/4".to_owned())
        );
        assert_eq!(
            derive_scrape_url("http://example.com/a/announce?x=4"),
            Some("http://example.com/a/scrape?x=4".to_owned())
        );
    }

    #[test]
    fn no_scrape_url_when_query_string_masks_a_non_announce_last_segment() {
        assert_eq!(
            derive_scrape_url("http://example.com/a?x=announce"),
            None
        );
    }

    #[test]
    fn event_http_and_udp_encodings_agree_on_identity() {
        for event in [Event::Started, Event::Completed, Event::Stopped] {
            // just exercise both encodings; no shared representation is
            // implied, but each should be stable and non-empty/non-zero.
            assert!(!event.as_http_str().is_empty());
            assert!(event.as_udp_code() > 0);
        }
    }
}
