//! Per-peer neighbourhood harvesting.
//!
//! A [`Harvester`] owns one local host on the overlay and extracts, from a
//! single remote peer, every peer that remote knows. It does so by walking
//! the remote's routing table bucket by bucket: each FIND_NODE target is a
//! precomputed preimage landing at the next common prefix length, so
//! successive queries read successively deeper buckets.
//!
//! ## Loop bounds
//!
//! At least [`MIN_FIND_NODE_ROUNDS`] buckets are always probed; routing
//! tables are often sparse near the root yet dense further down, so a few
//! empty responses up front do not mean the remote knows nobody. The walk
//! stops once a round past the floor learns nothing new, or after
//! [`MAX_FIND_NODE_ROUNDS`] buckets, the preimage precomputation depth.
//!
//! ## Partial results
//!
//! A harvest that learned at least one peer is reported as a success even
//! when a later step failed: the remote answered, and whatever part of its
//! routing table was read is real data. The underlying error is logged.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Local;
use rand::Rng;
use tokio::time::{sleep, timeout_at, Duration, Instant};
use tracing::{debug, trace};

use crate::config::WorkerConfig;
use crate::error::CrawlError;
use crate::events::{CrawlEvent, EventBus};
use crate::metrics;
use crate::peer::{strip_local_addrs, AddrInfo, PeerId};
use crate::preimage::PreimageTable;
use crate::transport::{MsgStream, Transport};
use crate::wire;

/// Buckets probed even when the first responses come back empty.
pub const MIN_FIND_NODE_ROUNDS: u8 = 4;

/// Bucket ceiling; matches the preimage precomputation depth.
pub const MAX_FIND_NODE_ROUNDS: u8 = 24;

/// Timestamp format recorded in harvest results (ISO-8601, local offset).
const KNOWS_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%z";

/// Identity metadata learned alongside a harvest. Re-crawls replace the
/// whole struct (last writer wins).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeInfo {
    /// Remote agent string; empty when the peerstore had none.
    pub version: String,
    /// DHT protocol id that was actually negotiated.
    pub protocol: String,
    /// Local wall-clock time at harvest completion.
    pub knows_timestamp: String,
}

/// Everything one harvest learned about a peer.
#[derive(Clone, Debug)]
pub struct NodeKnows {
    pub id: PeerId,
    /// Discovery-ordered, duplicate-free list of peers the remote returned.
    pub knows: Vec<AddrInfo>,
    pub info: NodeInfo,
}

/// Capability set the dispatcher needs from a worker: how many harvests it
/// can run at once, and how to run one.
#[async_trait]
pub trait CrawlWorker: Send + Sync {
    fn capacity(&self) -> usize;
    async fn crawl_peer(&self, target: &AddrInfo) -> Result<NodeKnows, CrawlError>;
}

pub struct Harvester<T: Transport> {
    id: usize,
    transport: Arc<T>,
    preimages: Arc<PreimageTable>,
    config: WorkerConfig,
    events: EventBus,
}

impl<T: Transport> Harvester<T> {
    pub fn new(
        id: usize,
        transport: Arc<T>,
        preimages: Arc<PreimageTable>,
        config: WorkerConfig,
        events: EventBus,
    ) -> Self {
        Self { id, transport, preimages, config, events }
    }

    /// Walk the remote's buckets over an open stream, accumulating an
    /// insertion-order deduplicated peer list. On failure the accumulated
    /// partial list is kept alongside the error.
    async fn full_neighbour_crawl(
        &self,
        stream: &mut T::Stream,
        remote: &AddrInfo,
        deadline: Instant,
    ) -> (Vec<AddrInfo>, Option<CrawlError>) {
        let mut peers: Vec<AddrInfo> = Vec::new();
        let mut seen: HashSet<PeerId> = HashSet::new();
        let mut round: u8 = 0;

        loop {
            let target = match self.preimages.find_preimage_for_cpl(&remote.id, round) {
                Ok(t) => t,
                Err(e) => return (peers, Some(e)),
            };
            let request = wire::encode(&wire::find_node(target));

            match timeout_at(deadline, stream.write_msg(&request)).await {
                Ok(Ok(())) => {}
                // The stream is in an undefined state after a failed
                // write; no further rounds.
                Ok(Err(e)) => return (peers, Some(e)),
                Err(_) => return (peers, Some(CrawlError::Deadline)),
            }

            let raw = match timeout_at(deadline, stream.read_msg()).await {
                Ok(Ok(bytes)) => bytes,
                Ok(Err(e)) => return (peers, Some(e)),
                Err(_) => return (peers, Some(CrawlError::Deadline)),
            };

            let response = match wire::decode(&raw) {
                Ok(msg) => msg,
                Err(e) => return (peers, Some(e.into())),
            };

            let mut newly_learned = 0usize;
            for peer in wire::closer_addr_infos(&response) {
                if seen.insert(peer.id.clone()) {
                    peers.push(peer);
                    newly_learned += 1;
                }
            }
            trace!(
                worker = self.id,
                peer = %remote.id,
                cpl = round,
                newly_learned,
                "harvest round complete"
            );

            round += 1;
            if round >= MAX_FIND_NODE_ROUNDS {
                return (peers, Some(CrawlError::PrefixLimitReached));
            }
            if round >= MIN_FIND_NODE_ROUNDS && newly_learned == 0 {
                return (peers, None);
            }
        }
    }
}

#[async_trait]
impl<T: Transport> CrawlWorker for Harvester<T> {
    fn capacity(&self) -> usize {
        self.config.queue_size
    }

    async fn crawl_peer(&self, target: &AddrInfo) -> Result<NodeKnows, CrawlError> {
        let remote = strip_local_addrs(target);
        if remote.addrs.is_empty() {
            return Err(CrawlError::NoRoutableAddress { peer: remote.id.to_hex() });
        }

        // Jitter so repeated runs don't hit the remote at the same instant.
        if self.config.max_back_off_time > 0 {
            let backoff = rand::thread_rng().gen_range(0..self.config.max_back_off_time);
            sleep(Duration::from_millis(backoff)).await;
        }

        let deadline = Instant::now() + self.config.connect_deadline();

        let dial_started = std::time::Instant::now();
        let dialed = timeout_at(deadline, self.transport.connect(&remote)).await;
        metrics::CONNECT_DURATION.observe(dial_started.elapsed().as_secs_f64());
        match dialed {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(worker = self.id, peer = %remote.id, error = %e, "could not connect");
                return Err(e);
            }
            Err(_) => {
                debug!(worker = self.id, peer = %remote.id, "dial deadline expired");
                return Err(CrawlError::DialFailed("dial deadline expired".into()));
            }
        }

        let mut stream = match timeout_at(
            deadline,
            self.transport.open_stream(&remote.id, &self.config.protocol_strings),
        )
        .await
        {
            Ok(Ok(s)) => s,
            Ok(Err(e)) => {
                debug!(worker = self.id, peer = %remote.id, error = %e, "could not open stream");
                return Err(e);
            }
            Err(_) => {
                return Err(CrawlError::StreamFailed("stream open deadline expired".into()))
            }
        };

        let (peers, harvest_err) = self.full_neighbour_crawl(&mut stream, &remote, deadline).await;
        let protocol = stream.protocol().to_string();
        stream.close().await;

        if let Some(err) = harvest_err {
            if peers.is_empty() {
                debug!(worker = self.id, peer = %remote.id, error = %err, "harvest failed");
                return Err(err);
            }
            // The remote answered at least once; keep the partial table.
            debug!(
                worker = self.id,
                peer = %remote.id,
                learned = peers.len(),
                error = %err,
                "keeping partial harvest"
            );
        }

        let version = self.transport.agent_version(&remote.id).unwrap_or_default();
        self.events.emit(CrawlEvent::Connected { peer: remote.clone() });
        metrics::RAW_OBTAINED_IDS.observe(peers.len() as f64);

        Ok(NodeKnows {
            id: remote.id.clone(),
            knows: peers,
            info: NodeInfo {
                version,
                protocol,
                knows_timestamp: Local::now().format(KNOWS_TIMESTAMP_FORMAT).to_string(),
            },
        })
    }
}
