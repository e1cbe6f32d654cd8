//! Transport seam between the crawler and the peer-to-peer stack.
//!
//! The production overlay transport (secio/TLS handshakes, stream
//! multiplexing, multistream protocol negotiation) lives behind these
//! traits; the crawler core only ever dials, opens one DHT stream per
//! harvest and exchanges length-prefixed byte messages on it.
//!
//! Deadlines are the caller's concern: harvest code wraps every call in
//! `tokio::time::timeout_at`, so implementations stay free of context
//! plumbing and are simply cancelled mid-await when the attempt expires.
//!
//! [`TcpTransport`] is a minimal adapter for lab networks that speak the
//! same varint-framed protobuf over plain TCP. It is deliberately not a
//! libp2p implementation.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::trace;

use crate::error::CrawlError;
use crate::peer::{AddrInfo, PeerId};
use crate::wire;

/// One DHT stream to a remote peer. Within a stream, messages are
/// delivered in FIFO order; nothing is guaranteed across streams.
#[async_trait]
pub trait MsgStream: Send {
    /// Length-prefixed send of one encoded message.
    async fn write_msg(&mut self, bytes: &[u8]) -> Result<(), CrawlError>;

    /// Length-prefixed receive of one encoded message. Pends until a
    /// message arrives; cancel via an outer deadline.
    async fn read_msg(&mut self) -> Result<Vec<u8>, CrawlError>;

    /// The DHT protocol id that was actually negotiated.
    fn protocol(&self) -> &str;

    /// Release the stream. Called on every harvest exit path; must not fail.
    async fn close(&mut self);
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    type Stream: MsgStream + 'static;

    /// Dial the peer on any of its listed addresses. Succeeds once one
    /// address accepts.
    async fn connect(&self, target: &AddrInfo) -> Result<(), CrawlError>;

    /// Open a DHT stream to a connected peer, negotiating the first
    /// mutually supported protocol from `protocols`.
    async fn open_stream(
        &self,
        peer: &PeerId,
        protocols: &[String],
    ) -> Result<Self::Stream, CrawlError>;

    /// Best-effort agent string learned during connection establishment.
    fn agent_version(&self, peer: &PeerId) -> Option<String>;
}

/// Plain-TCP transport for lab deployments: one connection per peer,
/// varint-framed messages straight on the socket, no handshake and no
/// real protocol negotiation (the first configured protocol id is
/// assumed).
pub struct TcpTransport {
    conns: Mutex<HashMap<PeerId, TcpStream>>,
}

impl TcpTransport {
    pub fn new() -> Self {
        Self { conns: Mutex::new(HashMap::new()) }
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for TcpTransport {
    type Stream = TcpMsgStream;

    async fn connect(&self, target: &AddrInfo) -> Result<(), CrawlError> {
        let mut last_err = String::from("no dialable addresses");
        for addr in &target.addrs {
            let Some(dial) = dial_target(addr) else {
                continue;
            };
            match TcpStream::connect(&dial).await {
                Ok(stream) => {
                    trace!(peer = %target.id, %dial, "tcp connect");
                    self.conns.lock().await.insert(target.id.clone(), stream);
                    return Ok(());
                }
                Err(e) => last_err = format!("{dial}: {e}"),
            }
        }
        Err(CrawlError::DialFailed(last_err))
    }

    async fn open_stream(
        &self,
        peer: &PeerId,
        protocols: &[String],
    ) -> Result<Self::Stream, CrawlError> {
        let stream = self
            .conns
            .lock()
            .await
            .remove(peer)
            .ok_or_else(|| CrawlError::StreamFailed(format!("no connection to {peer}")))?;
        let protocol = protocols
            .first()
            .cloned()
            .ok_or_else(|| CrawlError::StreamFailed("no protocols configured".into()))?;
        Ok(TcpMsgStream { stream, protocol })
    }

    fn agent_version(&self, _peer: &PeerId) -> Option<String> {
        None
    }
}

#[derive(Debug)]
pub struct TcpMsgStream {
    stream: TcpStream,
    protocol: String,
}

#[async_trait]
impl MsgStream for TcpMsgStream {
    async fn write_msg(&mut self, bytes: &[u8]) -> Result<(), CrawlError> {
        wire::write_frame(&mut self.stream, bytes)
            .await
            .map_err(|e| CrawlError::ProtocolIo(e.to_string()))
    }

    async fn read_msg(&mut self) -> Result<Vec<u8>, CrawlError> {
        wire::read_frame(&mut self.stream)
            .await
            .map_err(|e| CrawlError::ProtocolIo(e.to_string()))
    }

    fn protocol(&self) -> &str {
        &self.protocol
    }

    async fn close(&mut self) {
        let _ = self.stream.shutdown().await;
    }
}

/// Reduce an address string to something `TcpStream::connect` accepts.
///
/// Handles `/ip4/H/tcp/P`, `/ip6/H/tcp/P`, `/dns…/H/tcp/P` multiaddrs and
/// plain `host:port` strings; anything else (relay circuits, udp-only
/// addrs) is skipped.
fn dial_target(addr: &str) -> Option<String> {
    if let Some(rest) = addr.strip_prefix('/') {
        let parts: Vec<&str> = rest.split('/').collect();
        return match parts.as_slice() {
            ["ip6", host, "tcp", port, ..] => Some(format!("[{host}]:{port}")),
            [proto, host, "tcp", port, ..]
                if *proto == "ip4" || proto.starts_with("dns") =>
            {
                Some(format!("{host}:{port}"))
            }
            _ => None,
        };
    }
    if addr.contains(':') {
        Some(addr.to_string())
    } else {
        None
    }
}
