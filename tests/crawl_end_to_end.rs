//! End-to-end crawl scenarios against a mocked overlay.
//!
//! The mock network scripts, per peer, which addresses accept a dial and
//! what each FIND_NODE round returns. Everything else (harvest loop,
//! dispatch, dedup, snapshot) is the real crawl pipeline.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::timeout;

use kadscan::harvester::{MAX_FIND_NODE_ROUNDS, MIN_FIND_NODE_ROUNDS};
use kadscan::preimage::flipped_prefix;
use kadscan::{
    wire, AddrInfo, CrawlError, CrawlManager, CrawlOptions, CrawlOutput, EventBus, Harvester,
    MsgStream, PeerId, PreimageTable, Transport, WorkerConfig,
};

const TEST_TIMEOUT: Duration = Duration::from_secs(30);

fn pid(seed: u8) -> PeerId {
    PeerId::from_bytes(vec![seed; 34])
}

fn addr(seed: u8) -> String {
    format!("/ip4/203.0.113.{seed}/tcp/4001")
}

fn info_of(seed: u8, addrs: &[&str]) -> AddrInfo {
    AddrInfo::new(pid(seed), addrs.iter().map(|s| s.to_string()).collect())
}

#[derive(Clone)]
enum RoundReply {
    Peers(Vec<AddrInfo>),
    Fail,
}

#[derive(Clone, Default)]
struct MockPeer {
    /// Addresses this peer actually answers on.
    dial_addrs: Vec<String>,
    /// Scripted FIND_NODE replies by round; empty replies afterwards.
    rounds: Vec<RoundReply>,
    agent: String,
}

/// Shared mock overlay: scripted peers plus dial/request journals.
#[derive(Default)]
struct MockNetwork {
    peers: Mutex<HashMap<PeerId, MockPeer>>,
    dials: Mutex<Vec<(PeerId, Vec<String>)>>,
    find_nodes: Mutex<HashMap<PeerId, usize>>,
}

impl MockNetwork {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn register(&self, id: PeerId, peer: MockPeer) {
        self.peers.lock().unwrap().insert(id, peer);
    }

    fn dials_of(&self, id: &PeerId) -> Vec<Vec<String>> {
        self.dials
            .lock()
            .unwrap()
            .iter()
            .filter(|(p, _)| p == id)
            .map(|(_, addrs)| addrs.clone())
            .collect()
    }

    fn find_nodes_sent_to(&self, id: &PeerId) -> usize {
        self.find_nodes.lock().unwrap().get(id).copied().unwrap_or(0)
    }
}

struct MockTransport {
    network: Arc<MockNetwork>,
}

struct MockStream {
    network: Arc<MockNetwork>,
    remote: PeerId,
    rounds: Vec<RoundReply>,
    next_round: AtomicUsize,
    pending_reads: AtomicUsize,
}

#[async_trait]
impl Transport for MockTransport {
    type Stream = MockStream;

    async fn connect(&self, target: &AddrInfo) -> Result<(), CrawlError> {
        self.network
            .dials
            .lock()
            .unwrap()
            .push((target.id.clone(), target.addrs.clone()));
        let peers = self.network.peers.lock().unwrap();
        match peers.get(&target.id) {
            Some(peer) if target.addrs.iter().any(|a| peer.dial_addrs.contains(a)) => Ok(()),
            _ => Err(CrawlError::DialFailed("no address accepted".into())),
        }
    }

    async fn open_stream(
        &self,
        peer: &PeerId,
        _protocols: &[String],
    ) -> Result<Self::Stream, CrawlError> {
        let rounds = self
            .network
            .peers
            .lock()
            .unwrap()
            .get(peer)
            .map(|p| p.rounds.clone())
            .ok_or_else(|| CrawlError::StreamFailed("unknown peer".into()))?;
        Ok(MockStream {
            network: self.network.clone(),
            remote: peer.clone(),
            rounds,
            next_round: AtomicUsize::new(0),
            pending_reads: AtomicUsize::new(0),
        })
    }

    fn agent_version(&self, peer: &PeerId) -> Option<String> {
        self.network
            .peers
            .lock()
            .unwrap()
            .get(peer)
            .map(|p| p.agent.clone())
            .filter(|a| !a.is_empty())
    }
}

#[async_trait]
impl MsgStream for MockStream {
    async fn write_msg(&mut self, bytes: &[u8]) -> Result<(), CrawlError> {
        let msg = wire::decode(bytes)?;
        assert_eq!(msg.r#type, wire::MessageType::FindNode as i32);
        *self
            .network
            .find_nodes
            .lock()
            .unwrap()
            .entry(self.remote.clone())
            .or_insert(0) += 1;
        self.pending_reads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn read_msg(&mut self) -> Result<Vec<u8>, CrawlError> {
        assert!(
            self.pending_reads.swap(0, Ordering::SeqCst) > 0,
            "read without a preceding request"
        );
        let round = self.next_round.fetch_add(1, Ordering::SeqCst);
        let reply = self.rounds.get(round).cloned().unwrap_or(RoundReply::Peers(vec![]));
        match reply {
            RoundReply::Fail => Err(CrawlError::ProtocolIo("stream reset by peer".into())),
            RoundReply::Peers(peers) => {
                let closer = peers
                    .iter()
                    .map(|p| wire::Peer {
                        id: p.id.as_bytes().to_vec(),
                        addrs: p.addrs.iter().map(|a| a.as_bytes().to_vec()).collect(),
                        connection: wire::ConnectionType::Connected as i32,
                    })
                    .collect();
                let msg = wire::Message {
                    r#type: wire::MessageType::FindNode as i32,
                    key: Vec::new(),
                    closer_peers: closer,
                    cluster_level_raw: 0,
                };
                Ok(wire::encode(&msg))
            }
        }
    }

    fn protocol(&self) -> &str {
        "/ipfs/kad/1.0.0"
    }

    async fn close(&mut self) {}
}

/// Sparse preimage table covering the walk buckets of every scripted peer.
/// The preimage bytes are irrelevant to the mock; only coverage matters.
fn table_for(ids: &[PeerId]) -> PreimageTable {
    let mut rows: HashMap<u32, Vec<u8>> = HashMap::new();
    for id in ids {
        let key = id.kad_key();
        for cpl in 0..24u8 {
            rows.entry(flipped_prefix(&key, cpl, 24)).or_insert(vec![cpl]);
        }
    }
    PreimageTable::from_rows(24, rows).unwrap()
}

fn test_worker_config() -> WorkerConfig {
    WorkerConfig {
        max_back_off_time: 0,
        connect_timeout: 5,
        queue_size: 4,
        ..WorkerConfig::default()
    }
}

fn manager_for(network: &Arc<MockNetwork>, table_peers: &[PeerId]) -> CrawlManager {
    let events = EventBus::new();
    let mut manager = CrawlManager::new(CrawlOptions::default(), events.clone());
    let worker = Harvester::new(
        0,
        Arc::new(MockTransport { network: network.clone() }),
        Arc::new(table_for(table_peers)),
        test_worker_config(),
        events,
    );
    manager.add_worker(Arc::new(worker));
    manager
}

async fn crawl(manager: &CrawlManager, bootstraps: Vec<AddrInfo>) -> CrawlOutput {
    timeout(TEST_TIMEOUT, manager.crawl_network(bootstraps))
        .await
        .expect("crawl did not terminate")
        .expect("crawl failed")
}

#[tokio::test]
async fn single_bootstrap_with_no_neighbours() {
    let network = MockNetwork::new();
    network.register(
        pid(1),
        MockPeer {
            dial_addrs: vec![addr(1)],
            rounds: vec![],
            agent: "kubo/0.32.0".into(),
        },
    );

    let manager = manager_for(&network, &[pid(1)]);
    let output = crawl(&manager, vec![info_of(1, &[&addr(1)])]).await;

    assert_eq!(output.nodes.len(), 1);
    let node = &output.nodes[&pid(1)];
    assert!(node.reachable);
    assert!(node.neighbours.is_empty());
    assert_eq!(node.agent_version, "kubo/0.32.0");
    assert!(!node.timestamp.is_empty());
    // The walk always probes the bucket floor.
    assert_eq!(
        network.find_nodes_sent_to(&pid(1)),
        MIN_FIND_NODE_ROUNDS as usize
    );
}

#[tokio::test]
async fn chain_of_peers_is_fully_discovered() {
    let network = MockNetwork::new();
    network.register(
        pid(1),
        MockPeer {
            dial_addrs: vec![addr(1)],
            rounds: vec![RoundReply::Peers(vec![info_of(2, &[&addr(2)])])],
            agent: "a/1".into(),
        },
    );
    network.register(
        pid(2),
        MockPeer {
            dial_addrs: vec![addr(2)],
            rounds: vec![RoundReply::Peers(vec![info_of(3, &[&addr(3)])])],
            agent: "b/1".into(),
        },
    );
    network.register(
        pid(3),
        MockPeer { dial_addrs: vec![addr(3)], rounds: vec![], agent: "c/1".into() },
    );

    let manager = manager_for(&network, &[pid(1), pid(2), pid(3)]);
    let output = crawl(&manager, vec![info_of(1, &[&addr(1)])]).await;

    assert_eq!(output.nodes.len(), 3);
    assert!(output.nodes.values().all(|n| n.reachable));
    assert_eq!(output.nodes[&pid(1)].neighbours, vec![pid(2)]);
    assert_eq!(output.nodes[&pid(2)].neighbours, vec![pid(3)]);
    assert!(output.nodes[&pid(3)].neighbours.is_empty());
}

#[tokio::test]
async fn unreachable_peer_is_retried_on_newly_learned_address() {
    let network = MockNetwork::new();
    // A knows B under a dead address, and knows C. C knows B under the
    // address B actually answers on.
    network.register(
        pid(1),
        MockPeer {
            dial_addrs: vec![addr(1)],
            rounds: vec![RoundReply::Peers(vec![
                info_of(2, &[&addr(20)]),
                info_of(3, &[&addr(3)]),
            ])],
            ..MockPeer::default()
        },
    );
    network.register(
        pid(3),
        MockPeer {
            dial_addrs: vec![addr(3)],
            rounds: vec![RoundReply::Peers(vec![info_of(2, &[&addr(2)])])],
            ..MockPeer::default()
        },
    );
    network.register(
        pid(2),
        MockPeer { dial_addrs: vec![addr(2)], rounds: vec![], ..MockPeer::default() },
    );

    let manager = manager_for(&network, &[pid(1), pid(2), pid(3)]);
    let output = crawl(&manager, vec![info_of(1, &[&addr(1)])]).await;

    assert!(output.nodes[&pid(2)].reachable);
    // B was dialled again carrying only the newly learned address.
    let dials = network.dials_of(&pid(2));
    assert!(dials.contains(&vec![addr(2)]));
    assert!(dials.contains(&vec![addr(20)]));
    // The snapshot keeps the union of everything announced for B.
    let mut addrs = output.nodes[&pid(2)].multi_addrs.clone();
    addrs.sort();
    assert_eq!(addrs, vec![addr(2), addr(20)]);
}

#[tokio::test]
async fn prefix_exhaustion_is_reported_as_a_full_success() {
    let network = MockNetwork::new();
    // Every bucket up to the precomputation depth yields a previously
    // unseen peer, so the walk runs the full 24 rounds.
    let rounds = (0..MAX_FIND_NODE_ROUNDS)
        .map(|round| RoundReply::Peers(vec![info_of(100 + round, &[])]))
        .collect();
    network.register(
        pid(1),
        MockPeer {
            dial_addrs: vec![addr(1)],
            rounds,
            agent: "kubo/0.32.0".into(),
        },
    );

    let manager = manager_for(&network, &[pid(1)]);
    let output = crawl(&manager, vec![info_of(1, &[&addr(1)])]).await;

    assert_eq!(
        network.find_nodes_sent_to(&pid(1)),
        MAX_FIND_NODE_ROUNDS as usize
    );
    let node = &output.nodes[&pid(1)];
    assert!(node.reachable);
    assert_eq!(node.neighbours.len(), MAX_FIND_NODE_ROUNDS as usize);
    // Exhaustion is not an error at the dispatcher level; every announced
    // peer still enters the snapshot.
    assert_eq!(output.nodes.len(), 1 + MAX_FIND_NODE_ROUNDS as usize);
}

#[tokio::test]
async fn local_only_peer_is_recorded_but_never_dialled() {
    let network = MockNetwork::new();
    network.register(
        pid(1),
        MockPeer {
            dial_addrs: vec![addr(1)],
            rounds: vec![RoundReply::Peers(vec![info_of(
                9,
                &["/ip4/127.0.0.1/tcp/4001"],
            )])],
            ..MockPeer::default()
        },
    );

    let manager = manager_for(&network, &[pid(1)]);
    let output = crawl(&manager, vec![info_of(1, &[&addr(1)])]).await;

    let node = &output.nodes[&pid(9)];
    assert!(!node.reachable);
    assert!(node.multi_addrs.is_empty());
    assert!(network.dials_of(&pid(9)).is_empty());
}

#[tokio::test]
async fn partial_harvest_counts_as_reachable() {
    let network = MockNetwork::new();
    network.register(
        pid(1),
        MockPeer {
            dial_addrs: vec![addr(1)],
            rounds: vec![
                RoundReply::Peers(vec![info_of(2, &[])]),
                RoundReply::Peers(vec![info_of(3, &[])]),
                RoundReply::Peers(vec![info_of(4, &[])]),
                RoundReply::Fail,
            ],
            ..MockPeer::default()
        },
    );

    let manager = manager_for(&network, &[pid(1)]);
    let output = crawl(&manager, vec![info_of(1, &[&addr(1)])]).await;

    let node = &output.nodes[&pid(1)];
    assert!(node.reachable);
    assert_eq!(node.neighbours, vec![pid(2), pid(3), pid(4)]);
    assert_eq!(network.find_nodes_sent_to(&pid(1)), 4);
}

#[tokio::test]
async fn every_reported_peer_appears_exactly_once_and_knows_is_unique() {
    let network = MockNetwork::new();
    // Both A and B announce the same overlapping peer set.
    let shared = vec![info_of(2, &[&addr(2)]), info_of(3, &[])];
    network.register(
        pid(1),
        MockPeer {
            dial_addrs: vec![addr(1)],
            rounds: vec![
                RoundReply::Peers(shared.clone()),
                RoundReply::Peers(shared.clone()),
            ],
            ..MockPeer::default()
        },
    );
    network.register(
        pid(2),
        MockPeer {
            dial_addrs: vec![addr(2)],
            rounds: vec![RoundReply::Peers(shared.clone())],
            ..MockPeer::default()
        },
    );

    let manager = manager_for(&network, &[pid(1), pid(2)]);
    let output = crawl(&manager, vec![info_of(1, &[&addr(1)])]).await;

    assert_eq!(output.nodes.len(), 3);
    for node in output.nodes.values() {
        let unique: HashSet<_> = node.neighbours.iter().collect();
        assert_eq!(unique.len(), node.neighbours.len(), "duplicate neighbours");
    }
}

#[tokio::test]
async fn repeated_crawls_of_a_static_network_agree() {
    let network = MockNetwork::new();
    network.register(
        pid(1),
        MockPeer {
            dial_addrs: vec![addr(1)],
            rounds: vec![RoundReply::Peers(vec![info_of(2, &[&addr(2)])])],
            ..MockPeer::default()
        },
    );
    network.register(
        pid(2),
        MockPeer {
            dial_addrs: vec![addr(2)],
            rounds: vec![RoundReply::Peers(vec![info_of(1, &[&addr(1)])])],
            ..MockPeer::default()
        },
    );

    let mut summaries = Vec::new();
    for _ in 0..2 {
        let manager = manager_for(&network, &[pid(1), pid(2)]);
        let output = crawl(&manager, vec![info_of(1, &[&addr(1)])]).await;
        let mut summary: Vec<(PeerId, bool, Vec<PeerId>)> = output
            .nodes
            .into_values()
            .map(|n| (n.id, n.reachable, n.neighbours))
            .collect();
        summary.sort();
        summaries.push(summary);
    }
    assert_eq!(summaries[0], summaries[1]);
}
