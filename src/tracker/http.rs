//! The HTTP tracker transport (BEP 3).

use std::{
    collections::HashMap,
    fmt,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    time::Duration,
};

use percent_encoding::{percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::{
    de::{self, Visitor},
    Deserialize, Deserializer,
};

use super::{Announce, Peer, Response, ScrapeInfo, TrackerError, TrackerResult};
use crate::InfoHash;

/// The characters `reqwest`'s query-string encoder would otherwise mangle
/// when encoding the raw, non-UTF8 `info_hash`/`peer_id` bytes. We
/// percent-encode those two fields ourselves and splice them directly into
/// the URL, since `serde_urlencoded` (used internally by `reqwest::query`)
/// assumes valid UTF-8 parameters.
const URL_ENCODE_RESERVED: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'~')
    .remove(b'.');

/// An HTTP tracker client.
#[derive(Debug)]
pub struct Tracker {
    client: reqwest::Client,
}

impl Tracker {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    /// Sends an announce request to `url` and parses the response.
    pub async fn announce(
        &self,
        url: &str,
        params: &Announce,
    ) -> TrackerResult<Response> {
        let info_hash = percent_encode(&params.info_hash, URL_ENCODE_RESERVED);
        let peer_id = percent_encode(&params.peer_id, URL_ENCODE_RESERVED);
        let base = format!(
            "{}?info_hash={}&peer_id={}",
            url, info_hash, peer_id
        );

        let mut query: Vec<(&str, String)> = vec![
            ("port", params.port.to_string()),
            ("uploaded", params.uploaded.to_string()),
            ("downloaded", params.downloaded.to_string()),
            ("left", params.left.to_string()),
            ("compact", "1".to_owned()),
        ];
        if let Some(event) = params.event {
            query.push(("event", event.as_http_str().to_owned()));
        }
        if let Some(peer_count) = params.peer_count {
            query.push(("numwant", peer_count.to_string()));
        }

        let resp = self.client.get(&base).query(&query).send().await?;
        let bytes = resp.bytes().await?;
        let raw: RawResponse = serde_bencode::from_bytes(&bytes)
            .map_err(|e| TrackerError::Bencode(e.to_string()))?;

        if let Some(failure) = raw.failure_reason {
            return Err(TrackerError::Failure(failure));
        }

        let mut peers = raw.peers.0;
        peers.extend(raw.peers6.0);

        Ok(Response {
            interval: Duration::from_secs(raw.interval),
            min_interval: raw.min_interval.map(Duration::from_secs),
            seeder_count: raw.complete,
            leecher_count: raw.incomplete,
            peers,
        })
    }

    /// Sends a scrape request to `url` for the given info hashes.
    pub async fn scrape(
        &self,
        url: &str,
        info_hashes: &[InfoHash],
    ) -> TrackerResult<HashMap<InfoHash, ScrapeInfo>> {
        let mut request = self.client.get(url);
        for hash in info_hashes {
            let encoded = percent_encode(hash, URL_ENCODE_RESERVED).to_string();
            request = request.query(&[("info_hash", encoded)]);
        }
        let resp = request.send().await?;
        let bytes = resp.bytes().await?;
        let raw: RawScrapeResponse = serde_bencode::from_bytes(&bytes)
            .map_err(|e| TrackerError::Bencode(e.to_string()))?;

        Ok(raw
            .files
            .into_iter()
            .map(|(hash, stats)| {
                (
                    hash,
                    ScrapeInfo {
                        seeder_count: stats.complete,
                        completed_count: stats.downloaded,
                        leecher_count: stats.incomplete,
                    },
                )
            })
            .collect())
    }
}

impl Default for Tracker {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
struct RawResponse {
    #[serde(default, rename = "failure reason")]
    failure_reason: Option<String>,
    #[serde(default, rename = "warning message")]
    #[allow(dead_code)]
    warning_message: Option<String>,
    #[serde(default)]
    interval: u64,
    #[serde(default, rename = "min interval")]
    min_interval: Option<u64>,
    #[serde(default, rename = "tracker id")]
    #[allow(dead_code)]
    tracker_id: Option<String>,
    #[serde(default)]
    complete: Option<u32>,
    #[serde(default)]
    incomplete: Option<u32>,
    #[serde(default)]
    peers: PeerList,
    // BEP 23's IPv6 compact peer list, a separate top-level key from `peers`
    // rather than a variant of the same one; most trackers only ever send
    // one or the other, but nothing stops a dual-stack tracker sending both.
    #[serde(default, rename = "peers6")]
    peers6: PeerList6,
}

#[derive(Debug, Default)]
struct PeerList(Vec<Peer>);

impl<'de> Deserialize<'de> for PeerList {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct PeerListVisitor;

        impl<'de> Visitor<'de> for PeerListVisitor {
            type Value = PeerList;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a compact peer byte string or a list of peer dictionaries")
            }

            // the compact (BEP 23) representation: a byte string, 6 bytes
            // per peer (4-byte IPv4 address, 2-byte big-endian port).
            fn visit_bytes<E>(self, bytes: &[u8]) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                let peers = bytes
                    .chunks_exact(6)
                    .map(|chunk| {
                        let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
                        let port = u16::from_be_bytes([chunk[4], chunk[5]]);
                        Peer {
                            addr: SocketAddr::new(IpAddr::V4(ip), port),
                        }
                    })
                    .collect();
                Ok(PeerList(peers))
            }

            fn visit_byte_buf<E>(self, bytes: Vec<u8>) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                self.visit_bytes(&bytes)
            }

            // the non-compact representation: a list of `{ip, port,
            // peer id}` dictionaries.
            fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
            where
                A: de::SeqAccess<'de>,
            {
                let mut peers = Vec::new();
                while let Some(entry) = seq.next_element::<RawPeerDict>()? {
                    let ip: IpAddr = entry
                        .ip
                        .parse()
                        .map_err(|_| de::Error::custom("invalid peer ip"))?;
                    peers.push(Peer {
                        addr: SocketAddr::new(ip, entry.port),
                    });
                }
                Ok(PeerList(peers))
            }
        }

        deserializer.deserialize_any(PeerListVisitor)
    }
}

#[derive(Debug, Default)]
struct PeerList6(Vec<Peer>);

impl<'de> Deserialize<'de> for PeerList6 {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct PeerList6Visitor;

        impl<'de> Visitor<'de> for PeerList6Visitor {
            type Value = PeerList6;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a compact IPv6 peer byte string")
            }

            // the compact (BEP 23) IPv6 representation: a byte string, 18
            // bytes per peer (16-byte IPv6 address, 2-byte big-endian port).
            fn visit_bytes<E>(self, bytes: &[u8]) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                let peers = bytes
                    .chunks_exact(18)
                    .map(|chunk| {
                        let mut octets = [0u8; 16];
                        octets.copy_from_slice(&chunk[..16]);
                        let ip = Ipv6Addr::from(octets);
                        let port = u16::from_be_bytes([chunk[16], chunk[17]]);
                        Peer {
                            addr: SocketAddr::new(IpAddr::V6(ip), port),
                        }
                    })
                    .collect();
                Ok(PeerList6(peers))
            }

            fn visit_byte_buf<E>(self, bytes: Vec<u8>) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                self.visit_bytes(&bytes)
            }
        }

        deserializer.deserialize_any(PeerList6Visitor)
    }
}

#[derive(Debug, Deserialize)]
struct RawPeerDict {
    ip: String,
    port: u16,
}

#[derive(Debug, Deserialize)]
struct RawScrapeResponse {
    files: HashMap<InfoHash, RawScrapeStats>,
}

#[derive(Debug, Deserialize)]
struct RawScrapeStats {
    complete: u32,
    downloaded: u32,
    incomplete: u32,
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
            uploaded: 0,
            downloaded: 0,
            left: 1000,
            event: Some(Event::Started),
            peer_count: Some(50),
        }
    }

    #[test]
    fn should_parse_compact_peer_list() {
        let mut compact = vec![127u8, 0, 0, 1];
        compact.extend_from_slice(&6881u16.to_be_bytes());
        let mut body = Vec::new();
        body.extend_from_slice(b"d8:completei5e10:incompletei2e8:intervali1800e5:peers6:");
        body.extend_from_slice(&compact);
        body.push(b'e');

        let raw: RawResponse =
            serde_bencode::from_bytes(&body).expect("cannot decode compact peer list");
        assert_eq!(raw.peers.0.len(), 1);
        assert_eq!(raw.peers.0[0].addr.port(), 6881);
        assert_eq!(raw.complete, Some(5));
        assert_eq!(raw.incomplete, Some(2));
    }

    #[test]
    fn should_parse_full_peer_list() {
        let body = b"d8:completei1e10:incompletei0e8:intervali900e5:peersld2:ip9:127.0.0.17:peer id20:aaaaaaaaaaaaaaaaaaaa4:porti6882eeee";
        let raw: RawResponse =
            serde_bencode::from_bytes(body).expect("cannot decode full peer list");
        assert_eq!(raw.peers.0.len(), 1);
        assert_eq!(raw.peers.0[0].addr.port(), 6882);
    }

    #[test]
    fn should_parse_compact_ipv6_peer_list() {
        let ip = Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1);
        let mut compact = ip.octets().to_vec();
        compact.extend_from_slice(&6882u16.to_be_bytes());
        let mut body = Vec::new();
        body.extend_from_slice(b"d8:completei1e10:incompletei0e8:intervali900e6:peers618:");
        body.extend_from_slice(&compact);
        body.push(b'e');

        let raw: RawResponse =
            serde_bencode::from_bytes(&body).expect("cannot decode compact ipv6 peer list");
        assert_eq!(raw.peers6.0.len(), 1);
        assert_eq!(raw.peers6.0[0].addr, SocketAddr::new(IpAddr::V6(ip), 6882));
    }

    #[tokio::test]
    async fn should_return_ipv4_and_ipv6_peers_on_announce() {
        use mockito::{mock, Matcher};

        let addr = mockito::server_url();
        let tracker = Tracker::new();

        let peer_ip4 = Ipv4Addr::new(2, 156, 201, 254);
        let peer_port4 = 49123;
        let mut compact4 = vec![2u8, 156, 201, 254];
        compact4.extend_from_slice(&peer_port4.to_be_bytes());

        let peer_ip6 = Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 2);
        let peer_port6 = 49124;
        let mut compact6 = peer_ip6.octets().to_vec();
        compact6.extend_from_slice(&peer_port6.to_be_bytes());

        let mut body = Vec::new();
        body.extend_from_slice(
            b"d8:completei5e10:incompletei3e8:intervali15e5:peers6:",
        );
        body.extend_from_slice(&compact4);
        body.extend_from_slice(b"6:peers618:");
        body.extend_from_slice(&compact6);
        body.push(b'e');

        let params = sample_params();
        let _m = mock("GET", Matcher::Any)
            .match_query(Matcher::UrlEncoded("compact".into(), "1".into()))
            .with_status(200)
            .with_body(body)
            .create();

        let resp = tracker.announce(&addr, &params).await.unwrap();
        assert_eq!(
            resp.peers,
            vec![
                Peer {
                    addr: SocketAddr::new(IpAddr::V4(peer_ip4), peer_port4),
                },
                Peer {
                    addr: SocketAddr::new(IpAddr::V6(peer_ip6), peer_port6),
                },
            ]
        );
    }

    #[tokio::test]
    async fn should_return_peers_on_announce() {
        use mockito::{mock, Matcher};

        let addr = mockito::server_url();
        let tracker = Tracker::new();

        let peer_ip = Ipv4Addr::new(2, 156, 201, 254);
        let peer_port = 49123;
        let mut compact = vec![2u8, 156, 201, 254];
        compact.extend_from_slice(&peer_port.to_be_bytes());
        let mut body = Vec::new();
        body.extend_from_slice(
            b"d8:completei5e10:incompletei3e8:intervali15e12:min intervali10e5:peers6:",
        );
        body.extend_from_slice(&compact);
        body.push(b'e');

        let params = sample_params();
        let _m = mock("GET", Matcher::Any)
            .match_query(Matcher::UrlEncoded("compact".into(), "1".into()))
            .with_status(200)
            .with_body(body)
            .create();

        let resp = tracker.announce(&addr, &params).await.unwrap();
        assert_eq!(resp.interval, Duration::from_secs(15));
        assert_eq!(resp.min_interval, Some(Duration::from_secs(10)));
        assert_eq!(resp.seeder_count, Some(5));
        assert_eq!(resp.leecher_count, Some(3));
        assert_eq!(
            resp.peers,
            vec![Peer {
                addr: SocketAddr::new(IpAddr::V4(peer_ip), peer_port),
            }]
        );
    }

    #[tokio::test]
    async fn should_surface_a_failure_reason() {
        use mockito::{mock, Matcher};

        let addr = mockito::server_url();
        let tracker = Tracker::new();
        let _m = mock("GET", Matcher::Any)
            .with_status(200)
            .with_body(b"d14:failure reason17:bad info hash!!!e".to_vec())
            .create();

        let err = tracker
            .announce(&addr, &sample_params())
            .await
            .unwrap_err();
        assert!(matches!(err, TrackerError::Failure(_)));
    }
}
