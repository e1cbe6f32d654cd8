//! # Kadscan - Kademlia DHT Network Crawler
//!
//! Kadscan walks a Kademlia-style DHT overlay (IPFS/Filecoin family) from a
//! handful of bootstrap peers and produces a point-in-time snapshot of the
//! network graph: every reachable node, the addresses it advertises, the
//! peers it knows, and its agent/protocol metadata.
//!
//! ## Architecture
//!
//! Two subsystems do the heavy lifting:
//!
//! - **Neighbourhood harvest** (`harvester`): given a live stream to a
//!   remote, iterated FIND_NODE queries whose targets come from a
//!   precomputed preimage table traverse the remote's routing table bucket
//!   by bucket until nothing new is learned.
//! - **Dispatch loop** (`crawler`): a single task owning the frontier, a
//!   token bucket of worker capacity, the result intake channel, and all
//!   dedup state. Harvests run concurrently and talk back only through
//!   channels.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `peer` | Peer identities, address filtering, keyspace hashing |
//! | `preimage` | Precomputed FIND_NODE targets per common prefix length |
//! | `wire` | DHT protobuf messages and varint stream framing |
//! | `transport` | Dial/stream traits the crawler runs against |
//! | `harvester` | Per-peer neighbourhood extraction |
//! | `crawler` | Frontier, token bucket, dedup, termination |
//! | `report` | Snapshot types, JSON output, canary sanity check |
//! | `config` | Worker and crawl-run configuration |
//! | `metrics` | Prometheus counters, gauges and histograms |
//! | `events` | Lifecycle event broadcast |

pub mod config;
pub mod crawler;
pub mod error;
pub mod events;
pub mod harvester;
pub mod metrics;
pub mod peer;
pub mod preimage;
pub mod report;
pub mod transport;
pub mod wire;

pub use config::{CrawlConfig, CrawlOptions, OutputConfig, WorkerConfig};
pub use crawler::{CrawlManager, CrawlResult, CrawlState};
pub use error::CrawlError;
pub use events::{CrawlEvent, EventBus};
pub use harvester::{CrawlWorker, Harvester, NodeInfo, NodeKnows};
pub use peer::{strip_local_addrs, AddrInfo, PeerId};
pub use preimage::PreimageTable;
pub use report::{CrawlOutput, CrawledNode};
pub use transport::{MsgStream, TcpTransport, Transport};
