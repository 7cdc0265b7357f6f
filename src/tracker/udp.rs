//! The UDP tracker transport (BEP 15).
//!
//! The wire format is raw big-endian binary, not bencode: a `connect`
//! round trip establishes a short-lived connection id, which is then
//! included in `announce`/`scrape` requests. All three request kinds share
//! the same retry schedule: resend with a `15 * 2^n` second timeout, up to
//! [`crate::conf::UDP_TRACKER_MAX_RETRY_ATTEMPTS`] attempts, per BEP 15.

use std::{
    collections::HashMap,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::{Duration, Instant},
};

use bytes::{Buf, BufMut, BytesMut};
use rand::Rng;
use tokio::{net::UdpSocket, sync::Mutex, time::timeout};

use super::{Announce, Peer, Response, ScrapeInfo, TrackerError, TrackerResult};
use crate::{conf::UDP_TRACKER_MAX_RETRY_ATTEMPTS, InfoHash};

/// The magic constant that must open every `connect` request, per BEP 15.
const PROTOCOL_MAGIC: i64 = 0x0004_1727_1019_80;
const ACTION_CONNECT: i32 = 0;
const ACTION_ANNOUNCE: i32 = 1;
const ACTION_SCRAPE: i32 = 2;
const ACTION_ERROR: i32 = 3;

/// A connection id is only valid for this long after it's issued; after
/// that, a fresh `connect` round trip is required before announcing or
/// scraping.
const CONNECTION_ID_TTL: Duration = Duration::from_secs(60);

struct Connection {
    id: i64,
    established_at: Instant,
}

impl Connection {
    fn is_live(&self) -> bool {
        self.established_at.elapsed() < CONNECTION_ID_TTL
    }
}

/// A UDP tracker client for a single remote address. Caches its connection
/// id across announce/scrape calls until it expires.
pub struct Tracker {
    addr: SocketAddr,
    connection: Mutex<Option<Connection>>,
}

impl Tracker {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            connection: Mutex::new(None),
        }
    }

    async fn connection_id(&self, socket: &UdpSocket) -> TrackerResult<i64> {
        {
            let guard = self.connection.lock().await;
            if let Some(conn) = guard.as_ref() {
                if conn.is_live() {
                    return Ok(conn.id);
                }
            }
        }

        let transaction_id: i32 = rand::thread_rng().gen();
        let mut req = BytesMut::with_capacity(16);
        req.put_i64(PROTOCOL_MAGIC);
        req.put_i32(ACTION_CONNECT);
        req.put_i32(transaction_id);

        let resp = self.send_with_retries(socket, &req).await?;
        let id = parse_connect_response(&resp, transaction_id)?;

        let mut guard = self.connection.lock().await;
        *guard = Some(Connection {
            id,
            established_at: Instant::now(),
        });
        Ok(id)
    }

    /// Resends `req` to `self.addr`, doubling the timeout each attempt per
    /// the `15 * 2^n` schedule, until a response arrives or the retry
    /// budget is exhausted.
    async fn send_with_retries(
        &self,
        socket: &UdpSocket,
        req: &[u8],
    ) -> TrackerResult<Vec<u8>> {
        let mut buf = vec![0u8; 2048];
        for attempt in 0..UDP_TRACKER_MAX_RETRY_ATTEMPTS {
            socket.send_to(req, self.addr).await?;
            let deadline = Instant::now() + Duration::from_secs(15 * 2u64.pow(attempt));
            // Keep reading until a packet from `self.addr` arrives or the
            // attempt's timeout elapses; anything from another sender is a
            // spoofed or stray packet and must not be mistaken for our
            // tracker's reply.
            loop {
                let remaining = match deadline.checked_duration_since(Instant::now()) {
                    Some(remaining) => remaining,
                    None => break,
                };
                match timeout(remaining, socket.recv_from(&mut buf)).await {
                    Ok(Ok((len, from))) if from == self.addr => {
                        buf.truncate(len);
                        return Ok(buf);
                    }
                    Ok(Ok(_)) => continue,
                    _ => break,
                }
            }
        }
        Err(TrackerError::RetriesExhausted)
    }

    pub async fn announce(&self, params: &Announce) -> TrackerResult<Response> {
        let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;
        let connection_id = self.connection_id(&socket).await?;

        let transaction_id: i32 = rand::thread_rng().gen();
        let req = encode_announce_request(connection_id, transaction_id, params);
        let resp = self.send_with_retries(&socket, &req).await?;
        parse_announce_response(&resp, transaction_id)
    }

    pub async fn scrape(
        &self,
        info_hashes: &[InfoHash],
    ) -> TrackerResult<HashMap<InfoHash, ScrapeInfo>> {
        let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;
        let connection_id = self.connection_id(&socket).await?;

        let transaction_id: i32 = rand::thread_rng().gen();
        let mut req = BytesMut::with_capacity(16 + 20 * info_hashes.len());
        req.put_i64(connection_id);
        req.put_i32(ACTION_SCRAPE);
        req.put_i32(transaction_id);
        for hash in info_hashes {
            req.put(&hash[..]);
        }

        let resp = self.send_with_retries(&socket, &req).await?;
        parse_scrape_response(&resp, transaction_id, info_hashes)
    }
}

fn parse_connect_response(resp: &[u8], expected_transaction_id: i32) -> TrackerResult<i64> {
    if resp.len() < 16 {
        return Err(TrackerError::ResponseTooShort);
    }
    let mut body = resp;
    let action = body.get_i32();
    let transaction_id = body.get_i32();
    if transaction_id != expected_transaction_id {
        return Err(TrackerError::TransactionIdMismatch);
    }
    if action != ACTION_CONNECT {
        return Err(TrackerError::UnexpectedAction(action as u32));
    }
    Ok(body.get_i64())
}

fn encode_announce_request(
    connection_id: i64,
    transaction_id: i32,
    params: &Announce,
) -> BytesMut {
    let mut req = BytesMut::with_capacity(98);
    req.put_i64(connection_id);
    req.put_i32(ACTION_ANNOUNCE);
    req.put_i32(transaction_id);
    req.put(&params.info_hash[..]);
    req.put(&params.peer_id[..]);
    req.put_i64(params.downloaded as i64);
    req.put_i64(params.left as i64);
    req.put_i64(params.uploaded as i64);
    req.put_i32(params.event.map(|e| e.as_udp_code() as i32).unwrap_or(0));
    // IP address: 0 tells the tracker to use the request's source address.
    req.put_i32(0);
    req.put_u32(rand::thread_rng().gen());
    req.put_i32(params.peer_count.map(|c| c as i32).unwrap_or(-1));
    req.put_u16(params.port);
    req
}

fn parse_announce_response(
    resp: &[u8],
    expected_transaction_id: i32,
) -> TrackerResult<Response> {
    if resp.len() < 8 {
        return Err(TrackerError::ResponseTooShort);
    }
    let mut body = resp;
    let action = body.get_i32();
    let transaction_id = body.get_i32();
    if transaction_id != expected_transaction_id {
        return Err(TrackerError::TransactionIdMismatch);
    }
    if action == ACTION_ERROR {
        let message = String::from_utf8_lossy(body).into_owned();
        return Err(TrackerError::Failure(message));
    }
    if action != ACTION_ANNOUNCE {
        return Err(TrackerError::UnexpectedAction(action as u32));
    }
    if body.remaining() < 12 {
        return Err(TrackerError::ResponseTooShort);
    }

    let interval = body.get_i32().max(0) as u64;
    let leecher_count = body.get_i32().max(0) as u32;
    let seeder_count = body.get_i32().max(0) as u32;

    let mut peers = Vec::new();
    while body.remaining() >= 6 {
        let mut octets = [0u8; 4];
        body.copy_to_slice(&mut octets);
        let port = body.get_u16();
        peers.push(Peer {
            addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), port),
        });
    }

    Ok(Response {
        interval: Duration::from_secs(interval),
        min_interval: None,
        seeder_count: Some(seeder_count),
        leecher_count: Some(leecher_count),
        peers,
    })
}

fn parse_scrape_response(
    resp: &[u8],
    expected_transaction_id: i32,
    info_hashes: &[InfoHash],
) -> TrackerResult<HashMap<InfoHash, ScrapeInfo>> {
    if resp.len() < 8 {
        return Err(TrackerError::ResponseTooShort);
    }
    let mut body = resp;
    let action = body.get_i32();
    let transaction_id = body.get_i32();
    if transaction_id != expected_transaction_id {
        return Err(TrackerError::TransactionIdMismatch);
    }
    if action != ACTION_SCRAPE {
        return Err(TrackerError::UnexpectedAction(action as u32));
    }

    let mut out = HashMap::new();
    for hash in info_hashes {
        if body.remaining() < 12 {
            break;
        }
        let seeder_count = body.get_i32().max(0) as u32;
        let completed_count = body.get_i32().max(0) as u32;
        let leecher_count = body.get_i32().max(0) as u32;
        out.insert(
            *hash,
            ScrapeInfo {
                seeder_count,
                completed_count,
                leecher_count,
            },
        );
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::Event;

    fn sample_params() -> Announce {
        Announce {
            info_hash: [1; 20],
            peer_id: [2; 20],
            port: 6881,
            uploaded: 10,
            downloaded: 20,
            left: 30,
            event: Some(Event::Started),
            peer_count: Some(50),
        }
    }

    #[test]
    fn parses_a_matching_connect_response() {
        let transaction_id = 42;
        let mut resp = BytesMut::new();
        resp.put_i32(ACTION_CONNECT);
        resp.put_i32(transaction_id);
        resp.put_i64(123456789);

        let id = parse_connect_response(&resp, transaction_id).unwrap();
        assert_eq!(id, 123456789);
    }

    #[test]
    fn rejects_a_mismatched_connect_transaction_id() {
        let mut resp = BytesMut::new();
        resp.put_i32(ACTION_CONNECT);
        resp.put_i32(1);
        resp.put_i64(1);

        let err = parse_connect_response(&resp, 2).unwrap_err();
        assert!(matches!(err, TrackerError::TransactionIdMismatch));
    }

    #[test]
    fn encodes_and_parses_an_announce_round_trip() {
        let transaction_id = 7;
        let params = sample_params();
        let req = encode_announce_request(999, transaction_id, &params);
        // the request itself carries our info hash/peer id verbatim
        assert_eq!(&req[16..36], &params.info_hash[..]);
        assert_eq!(&req[36..56], &params.peer_id[..]);

        let mut resp = BytesMut::new();
        resp.put_i32(ACTION_ANNOUNCE);
        resp.put_i32(transaction_id);
        resp.put_i32(1800); // interval
        resp.put_i32(3); // leechers
        resp.put_i32(5); // seeders
        resp.put_slice(&[127, 0, 0, 1]);
        resp.put_u16(6881);

        let parsed = parse_announce_response(&resp, transaction_id).unwrap();
        assert_eq!(parsed.interval, Duration::from_secs(1800));
        assert_eq!(parsed.leecher_count, Some(3));
        assert_eq!(parsed.seeder_count, Some(5));
        assert_eq!(parsed.peers.len(), 1);
        assert_eq!(parsed.peers[0].addr.port(), 6881);
    }

    #[test]
    fn announce_error_action_surfaces_as_a_tracker_failure() {
        let transaction_id = 3;
        let mut resp = BytesMut::new();
        resp.put_i32(ACTION_ERROR);
        resp.put_i32(transaction_id);
        resp.put_slice(b"rate limited");

        let err = parse_announce_response(&resp, transaction_id).unwrap_err();
        match err {
            TrackerError::Failure(message) => assert_eq!(message, "rate limited"),
            other => panic!("expected Failure, got {:?}", other),
        }
    }

    #[test]
    fn parses_a_scrape_response_for_multiple_info_hashes() {
        let transaction_id = 55;
        let hashes = [[1; 20], [2; 20]];
        let mut resp = BytesMut::new();
        resp.put_i32(ACTION_SCRAPE);
        resp.put_i32(transaction_id);
        for (seeders, completed, leechers) in [(5, 10, 1), (0, 0, 0)] {
            resp.put_i32(seeders);
            resp.put_i32(completed);
            resp.put_i32(leechers);
        }

        let parsed = parse_scrape_response(&resp, transaction_id, &hashes).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(
            parsed[&hashes[0]],
            ScrapeInfo {
                seeder_count: 5,
                completed_count: 10,
                leecher_count: 1,
            }
        );
    }

    #[tokio::test]
    async fn rejects_a_response_from_an_unexpected_sender() {
        let server = UdpSocket::bind(("127.0.0.1", 0)).await.unwrap();
        let server_addr = server.local_addr().unwrap();
        let spoofer = UdpSocket::bind(("127.0.0.1", 0)).await.unwrap();

        let tracker = Tracker::new(server_addr);
        let client = UdpSocket::bind(("127.0.0.1", 0)).await.unwrap();
        let client_addr = client.local_addr().unwrap();

        let transaction_id = 9;
        let mut spoofed = BytesMut::new();
        spoofed.put_i32(ACTION_CONNECT);
        spoofed.put_i32(transaction_id);
        spoofed.put_i64(1);

        tokio::spawn(async move {
            let mut req = vec![0u8; 16];
            let _ = server.recv_from(&mut req).await;
            spoofer.send_to(&spoofed, client_addr).await.unwrap();
        });

        let mut req = BytesMut::with_capacity(16);
        req.put_i64(PROTOCOL_MAGIC);
        req.put_i32(ACTION_CONNECT);
        req.put_i32(transaction_id);

        let result = tokio::time::timeout(
            Duration::from_secs(2),
            tracker.send_with_retries(&client, &req),
        )
        .await;
        // the spoofed packet must be ignored; since the real server never
        // replies, this times out against our own (much longer) retry
        // schedule rather than completing with the spoofed bytes.
        assert!(result.is_err());
    }

    #[test]
    fn connection_id_expires_after_its_ttl() {
        let conn = Connection {
            id: 1,
            established_at: Instant::now() - Duration::from_secs(61),
        };
        assert!(!conn.is_live());

        let fresh = Connection {
            id: 1,
            established_at: Instant::now(),
        };
        assert!(fresh.is_live());
    }
}
