//! HTTP tracker announce, integrated into the shared event loop instead of
//! opening a private `Poll` per call: `TrackerClient` is a resumable state
//! machine driven by `feed_writable`/`feed_readable`, mirroring the same
//! redesign applied to `PeerSession`.

use anyhow::{anyhow, bail, Context, Result};
use log::debug;
use mio::net::TcpStream;
use mio::Token;
use serde::{Deserialize, Serialize};
use std::net::{SocketAddr, ToSocketAddrs};
use url::Url;
use urlencoding::encode_binary;

/// Compact-form peer list, both the only form this client sends
/// (`compact=1`) and the only form it parses back.
#[derive(Debug, Clone)]
pub struct Peers(pub Vec<SocketAddr>);

impl<'de> Deserialize<'de> for Peers {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::{Error as _, Visitor};
        use std::fmt;
        use std::net::{Ipv4Addr, SocketAddrV4};

        struct PeersVisitor;
        impl<'de> Visitor<'de> for PeersVisitor {
            type Value = Peers;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a compact (6-byte-per-peer) IPv4 peer list")
            }

            fn visit_bytes<E>(self, v: &[u8]) -> std::result::Result<Peers, E>
            where
                E: serde::de::Error,
            {
                if v.len() % 6 != 0 {
                    return Err(E::custom("compact peer list length not a multiple of 6"));
                }
                let peers = v
                    .chunks_exact(6)
                    .map(|c| {
                        let addr = Ipv4Addr::new(c[0], c[1], c[2], c[3]);
                        let port = u16::from_be_bytes([c[4], c[5]]);
                        SocketAddr::V4(SocketAddrV4::new(addr, port))
                    })
                    .collect();
                Ok(Peers(peers))
            }
        }

        deserializer.deserialize_bytes(PeersVisitor)
    }
}

#[derive(Debug, Deserialize)]
pub struct AnnounceResponse {
    pub failure_reason: Option<String>,
    pub warning_message: Option<String>,
    pub interval: u64,
    pub min_interval: Option<u64>,
    pub tracker_id: Option<String>,
    pub complete: Option<u64>,
    pub incomplete: Option<u64>,
    #[serde(default = "Vec::new")]
    #[serde(deserialize_with = "deserialize_peers_or_empty")]
    pub peers: Vec<SocketAddr>,
}

fn deserialize_peers_or_empty<'de, D>(deserializer: D) -> std::result::Result<Vec<SocketAddr>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Peers::deserialize(deserializer)?.0)
}

/// The tracker `event` parameter, sent on the first announce, the last one,
/// and on completion; omitted for every regular re-announce in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceEvent {
    Started,
    Completed,
    Stopped,
    None,
}

impl AnnounceEvent {
    fn as_str(self) -> Option<&'static str> {
        match self {
            AnnounceEvent::Started => Some("started"),
            AnnounceEvent::Completed => Some("completed"),
            AnnounceEvent::Stopped => Some("stopped"),
            AnnounceEvent::None => None,
        }
    }
}

fn build_request(
    url: &Url,
    info_hash: &[u8; 20],
    peer_id: &[u8; 20],
    port: u16,
    uploaded: u64,
    downloaded: u64,
    left: u64,
    event: AnnounceEvent,
) -> Result<String> {
    let host = url.host_str().ok_or_else(|| anyhow!("announce URL has no host"))?;
    let mut query = format!(
        "?info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1",
        encode_binary(info_hash),
        encode_binary(peer_id),
        port,
        uploaded,
        downloaded,
        left
    );
    if let Some(event) = event.as_str() {
        query.push_str(&format!("&event={event}"));
    }
    Ok(format!(
        "GET {}{} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        url.path(),
        query,
        host
    ))
}

fn resolve(url: &Url) -> Result<SocketAddr> {
    let host = url.host_str().ok_or_else(|| anyhow!("announce URL has no host"))?;
    let port = url.port().unwrap_or(6969);
    format!("{host}:{port}")
        .to_socket_addrs()
        .with_context(|| format!("resolving tracker host {host}"))?
        .next()
        .ok_or_else(|| anyhow!("no addresses for tracker host {host}"))
}

#[derive(Debug, PartialEq, Eq)]
enum Phase {
    Connecting,
    SendingRequest,
    ReadingResponse,
}

/// One in-flight announce to a single tracker, registered on the shared
/// event loop under `token`.
pub struct TrackerClient {
    pub token: Token,
    pub url: Url,
    stream: TcpStream,
    phase: Phase,
    request: Vec<u8>,
    sent: usize,
    response_buf: Vec<u8>,
}

/// Everything a DNS-resolution worker thread needs to hand back to the main
/// loop once it has resolved the tracker host and dialed it: the connected
/// stream and the already-built request, so the main loop only ever touches
/// the socket after it's ready for `mio` registration.
pub struct ResolvedTracker {
    pub token: Token,
    pub url: Url,
    pub stream: std::net::TcpStream,
    pub request: Vec<u8>,
}

/// Performs the blocking resolve + connect + request-build off the main
/// thread. Intended to run inside `std::thread::spawn`, with the result
/// handed back over an `mpsc::Sender` for the main loop to register.
pub fn resolve_and_connect(
    token: Token,
    announce_url: &str,
    info_hash: &[u8; 20],
    peer_id: &[u8; 20],
    port: u16,
    uploaded: u64,
    downloaded: u64,
    left: u64,
    event: AnnounceEvent,
) -> Result<ResolvedTracker> {
    let url = Url::parse(announce_url).context("parsing announce URL")?;
    let addr = resolve(&url)?;
    let stream = std::net::TcpStream::connect(addr).context("connecting to tracker")?;
    stream.set_nonblocking(true).context("setting tracker socket non-blocking")?;
    let request = build_request(&url, info_hash, peer_id, port, uploaded, downloaded, left, event)?
        .into_bytes();
    Ok(ResolvedTracker { token, url, stream, request })
}

impl TrackerClient {
    /// Wraps an already-connected, already-non-blocking stream (handed back
    /// by `resolve_and_connect` via the DNS worker thread) for registration
    /// on the main loop's `Poll`. The main loop must never call
    /// `Poll::registry().register` from the worker thread itself.
    pub fn from_resolved(resolved: ResolvedTracker) -> Result<TrackerClient> {
        let stream = TcpStream::from_std(resolved.stream);
        Ok(TrackerClient {
            token: resolved.token,
            url: resolved.url,
            stream,
            phase: Phase::Connecting,
            request: resolved.request,
            sent: 0,
            response_buf: Vec::new(),
        })
    }

    #[cfg(test)]
    pub fn connect(
        token: Token,
        announce_url: &str,
        info_hash: &[u8; 20],
        peer_id: &[u8; 20],
        port: u16,
        uploaded: u64,
        downloaded: u64,
        left: u64,
        event: AnnounceEvent,
    ) -> Result<TrackerClient> {
        let resolved = resolve_and_connect(
            token, announce_url, info_hash, peer_id, port, uploaded, downloaded, left, event,
        )?;
        Self::from_resolved(resolved)
    }

    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    /// Call when the registered token becomes writable. Sends (or resumes
    /// sending) the GET request. Returns `true` once it has been fully sent.
    pub fn on_writable(&mut self) -> Result<bool> {
        use std::io::Write;
        if self.phase == Phase::Connecting {
            self.phase = Phase::SendingRequest;
        }
        while self.sent < self.request.len() {
            match self.stream.write(&self.request[self.sent..]) {
                Ok(0) => anyhow::bail!("tracker closed connection before accepting request"),
                Ok(n) => self.sent += n,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) => return Err(e.into()),
            }
        }
        self.phase = Phase::ReadingResponse;
        Ok(true)
    }

    /// Call when the registered token becomes readable. Accumulates bytes;
    /// returns `Some(response)` once the connection has been closed by the
    /// tracker (HTTP/1.1 `Connection: close`, so EOF marks the end).
    pub fn on_readable(&mut self) -> Result<Option<AnnounceResponse>> {
        use std::io::Read;
        let mut buf = [0u8; 4096];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => return Ok(Some(parse_announce_response(&self.response_buf)?)),
                Ok(n) => self.response_buf.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(None),
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Tracker announce responses are always bencoded; some trackers instead
/// return an HTML error page on failure, identifiable by `Content-Type`
/// without attempting (and failing) a bencode parse first.
fn is_html_response(headers: &str) -> bool {
    headers
        .lines()
        .find_map(|line| line.strip_prefix("Content-Type:").or_else(|| line.strip_prefix("content-type:")))
        .map(|value| value.trim().to_ascii_lowercase().starts_with("text/html"))
        .unwrap_or(false)
}

fn parse_announce_response(raw: &[u8]) -> Result<AnnounceResponse> {
    let header_end = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|i| i + 4)
        .ok_or_else(|| anyhow!("tracker response missing header terminator"))?;

    let headers = String::from_utf8_lossy(&raw[..header_end]);
    debug!("tracker response headers: {headers}");

    if is_html_response(&headers) {
        bail!("tracker returned an HTML response instead of bencode (likely an error page)");
    }

    let body = &raw[header_end..];
    serde_bencode::from_bytes(body).context("decoding bencoded tracker response body")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_request_includes_event_only_when_present() {
        let url = Url::parse("http://tracker.example.com:6969/announce").unwrap();
        let with_event = build_request(&url, &[1; 20], &[2; 20], 6881, 0, 0, 100, AnnounceEvent::Started).unwrap();
        assert!(with_event.contains("event=started"));

        let without_event = build_request(&url, &[1; 20], &[2; 20], 6881, 0, 0, 100, AnnounceEvent::None).unwrap();
        assert!(!without_event.contains("event="));
    }

    #[test]
    fn build_request_always_sends_compact() {
        let url = Url::parse("http://tracker.example.com:6969/announce").unwrap();
        let request = build_request(&url, &[0; 20], &[0; 20], 6881, 0, 0, 0, AnnounceEvent::None).unwrap();
        assert!(request.contains("compact=1"));
    }

    #[test]
    fn parse_announce_response_decodes_compact_peers() {
        let body = b"d8:intervali1800e5:peers6:\x7f\x00\x00\x01\x1a\xe1e";
        let mut raw = b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\n\r\n".to_vec();
        raw.extend_from_slice(body);

        let response = parse_announce_response(&raw).unwrap();
        assert_eq!(response.interval, 1800);
        assert_eq!(response.peers.len(), 1);
        assert_eq!(response.peers[0].to_string(), "127.0.0.1:6881");
    }

    #[test]
    fn parse_announce_response_rejects_missing_header_terminator() {
        assert!(parse_announce_response(b"not a real http response").is_err());
    }

    #[test]
    fn parse_announce_response_rejects_html_content_type() {
        let raw = b"HTTP/1.1 500 Internal Server Error\r\nContent-Type: text/html\r\n\r\n<html>error</html>";
        let err = parse_announce_response(raw).unwrap_err();
        assert!(err.to_string().contains("HTML"));
    }
}
