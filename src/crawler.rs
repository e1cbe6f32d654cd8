//! Crawl dispatch: frontier, token bucket and result intake.
//!
//! One dispatcher task owns all mutable crawl state ([`CrawlState`]) and
//! runs a select loop over three channels and two timers. Harvest work
//! happens in spawned tasks that talk back exclusively through the
//! `reports` channel and the token bucket; nothing else is shared.
//!
//! ## Token bucket
//!
//! The bucket is a bounded channel holding worker ids, one entry per unit
//! of worker capacity. Taking a token both rate-limits the crawl and picks
//! the worker for the dispatch; the dispatch wrapper puts the token back
//! on every exit path, so free slots always equal capacity minus in-flight
//! harvests.
//!
//! ## Termination
//!
//! The run ends when every token is home, the frontier is empty and no
//! report is pending, or when a full idle interval passes without any
//! report arriving. A graceful stop can also be requested through
//! [`CrawlManager::shutdown_handle`]; the loop then breaks early and the
//! partial snapshot is still produced.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use anyhow::{bail, Result};
use chrono::Local;
use tokio::sync::{mpsc, Notify};
use tokio::time::{interval, sleep, Duration, Instant};
use tracing::{debug, info};

use crate::config::CrawlOptions;
use crate::error::CrawlError;
use crate::events::{CrawlEvent, EventBus};
use crate::harvester::{CrawlWorker, NodeInfo, NodeKnows};
use crate::metrics;
use crate::peer::{find_new_addrs, strip_local_addrs, AddrInfo, PeerId};
use crate::report::{CrawlOutput, CrawledNode};

/// A run terminates after this long without a single harvest report.
const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Cadence of the human-readable status line.
const INFO_INTERVAL: Duration = Duration::from_secs(20);

/// Cadence of gauge refreshes.
const GAUGE_INTERVAL: Duration = Duration::from_secs(1);

/// One completed harvest attempt, successful or not.
pub struct CrawlResult {
    pub peer: PeerId,
    pub outcome: Result<NodeKnows, CrawlError>,
}

/// All mutable state of a crawl run. Owned by the dispatcher task; workers
/// never see it.
#[derive(Default)]
pub struct CrawlState {
    /// Every peer an attempt was ever enqueued for, with the union of all
    /// non-local addresses announced for it.
    crawled: HashMap<PeerId, Vec<String>>,
    /// Peers with at least one successful harvest.
    online: HashSet<PeerId>,
    /// Most recent successful neighbour list per peer.
    knows: HashMap<PeerId, Vec<PeerId>>,
    /// Most recent successful identity metadata per peer (last writer
    /// wins on re-crawl).
    info: HashMap<PeerId, NodeInfo>,
    frontier: VecDeque<AddrInfo>,
}

impl CrawlState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a discovered peer to the frontier, deduplicating against
    /// everything seen so far:
    ///
    /// - already crawled and online: drop;
    /// - already crawled but offline: re-admit only the genuinely new
    ///   addresses, so unreachable peers are retried on alternate routes
    ///   and nothing else;
    /// - unseen: record it and enqueue as announced.
    pub fn handle_input(&mut self, node: &AddrInfo) {
        if let Some(known) = self.crawled.get_mut(&node.id) {
            if self.online.contains(&node.id) {
                return;
            }
            let stripped = strip_local_addrs(node);
            let new_addrs = find_new_addrs(known, &stripped.addrs);
            if new_addrs.is_empty() {
                return;
            }
            debug!(peer = %node.id, new = new_addrs.len(), "retrying offline peer on new addresses");
            known.extend(new_addrs.iter().cloned());
            self.frontier.push_back(AddrInfo::new(node.id.clone(), new_addrs));
            return;
        }
        metrics::NUMBER_OF_NEW_IDS.with_label_values(&["all"]).inc();
        self.crawled
            .insert(node.id.clone(), strip_local_addrs(node).addrs);
        debug!(peer = %node.id, "admitting newly seen peer");
        self.frontier.push_back(node.clone());
    }

    /// Fold a successful harvest into the state and feed every announced
    /// peer through [`Self::handle_input`].
    pub fn record_success(&mut self, result: NodeKnows) {
        self.online.insert(result.id.clone());
        metrics::NUMBER_OF_NEW_IDS
            .with_label_values(&["reachable"])
            .inc();
        self.knows.insert(
            result.id.clone(),
            result.knows.iter().map(|p| p.id.clone()).collect(),
        );
        self.info.insert(result.id.clone(), result.info);
        for peer in &result.knows {
            self.handle_input(peer);
        }
    }

    fn pop_frontier(&mut self) -> Option<AddrInfo> {
        self.frontier.pop_front()
    }

    /// Build the final snapshot. Every crawled peer gets an entry;
    /// unreachable peers keep defaults for the harvest-derived fields.
    pub fn into_output(mut self, start_date: String, end_date: String) -> CrawlOutput {
        let mut nodes = std::collections::BTreeMap::new();
        for (id, addrs) in self.crawled {
            let info = self.info.remove(&id).unwrap_or_default();
            let node = CrawledNode {
                id: id.clone(),
                multi_addrs: addrs,
                reachable: self.online.contains(&id),
                agent_version: info.version,
                neighbours: self.knows.remove(&id).unwrap_or_default(),
                timestamp: info.knows_timestamp,
            };
            nodes.insert(id, node);
        }
        CrawlOutput { start_date, end_date, nodes }
    }
}

pub struct CrawlManager {
    workers: Vec<Arc<dyn CrawlWorker>>,
    options: CrawlOptions,
    events: EventBus,
    shutdown: Arc<Notify>,
}

impl CrawlManager {
    pub fn new(options: CrawlOptions, events: EventBus) -> Self {
        metrics::register_metrics();
        Self {
            workers: Vec::new(),
            options,
            events,
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn add_worker(&mut self, worker: Arc<dyn CrawlWorker>) {
        self.workers.push(worker);
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Handle for requesting a graceful stop: the event loop finishes its
    /// current iteration, skips the remaining frontier and returns the
    /// snapshot of everything gathered so far. Notifying before the run
    /// starts stops it on the first iteration.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    pub fn options(&self) -> &CrawlOptions {
        &self.options
    }

    /// Seed the token bucket round-robin across workers: one pass per
    /// capacity step, each pass pushing every worker that still has
    /// capacity at that step. Interleaving keeps heterogeneous workers
    /// drained fairly instead of one worker monopolising the early
    /// tokens. Exactly `capacity(w)` tokens are pushed per worker,
    /// totalling the bucket's size.
    fn seed_token_bucket(
        &self,
        total: usize,
    ) -> (mpsc::Sender<usize>, mpsc::Receiver<usize>) {
        let max_cap = self
            .workers
            .iter()
            .map(|w| w.capacity())
            .max()
            .unwrap_or(0);
        let (tx, rx) = mpsc::channel(total);
        for step in 0..max_cap {
            for (id, worker) in self.workers.iter().enumerate() {
                if worker.capacity() > step {
                    tx.try_send(id).expect("token bucket sized to total capacity");
                }
            }
        }
        (tx, rx)
    }

    /// Crawl the overlay starting from `bootstraps` and return the final
    /// snapshot.
    pub async fn crawl_network(&self, bootstraps: Vec<AddrInfo>) -> Result<CrawlOutput> {
        if self.workers.is_empty() {
            bail!("cannot start a crawl without workers");
        }
        let capacity: usize = self.workers.iter().map(|w| w.capacity()).sum();
        if capacity == 0 {
            bail!("workers have zero total capacity");
        }

        let date_format = self.options.data_output.filename_time_format.clone();
        let start = Local::now();
        info!(
            bootstraps = bootstraps.len(),
            workers = self.workers.len(),
            capacity,
            "starting crawl"
        );
        self.events.emit(CrawlEvent::Started { bootstraps: bootstraps.len() });

        let mut state = CrawlState::new();
        for bootstrap in &bootstraps {
            state.handle_input(bootstrap);
        }

        let (token_tx, mut token_rx) = self.seed_token_bucket(capacity);
        let (report_tx, mut report_rx) = mpsc::channel::<CrawlResult>(capacity);
        let mut in_flight: usize = 0;

        let mut info_ticker = interval(INFO_INTERVAL);
        let mut gauge_ticker = interval(GAUGE_INTERVAL);
        let idle = sleep(IDLE_TIMEOUT);
        tokio::pin!(idle);

        loop {
            if in_flight == 0 && state.frontier.is_empty() {
                info!("frontier exhausted, stopping crawl");
                break;
            }

            tokio::select! {
                Some(report) = report_rx.recv() => {
                    in_flight -= 1;
                    idle.as_mut().reset(Instant::now() + IDLE_TIMEOUT);
                    match report.outcome {
                        Ok(node) => {
                            state.record_success(node);
                            debug!(
                                in_flight,
                                frontier = state.frontier.len(),
                                "harvest folded in"
                            );
                        }
                        Err(e) => {
                            debug!(peer = %report.peer, error = %e, "crawl attempt failed");
                        }
                    }
                }

                Some(worker_id) = token_rx.recv(), if !state.frontier.is_empty() => {
                    if let Some(node) = state.pop_frontier() {
                        in_flight += 1;
                        debug!(peer = %node.id, worker = worker_id, "dispatching crawl");
                        let worker = self.workers[worker_id].clone();
                        let report_tx = report_tx.clone();
                        let token_tx = token_tx.clone();
                        tokio::spawn(async move {
                            let outcome = worker.crawl_peer(&node).await;
                            let result = CrawlResult { peer: node.id.clone(), outcome };
                            // Result first, then the token; the token must
                            // come home on every path.
                            let _ = report_tx.send(result).await;
                            let _ = token_tx.send(worker_id).await;
                        });
                    }
                }

                _ = info_ticker.tick() => {
                    info!(
                        found = state.crawled.len(),
                        online = state.online.len(),
                        in_flight,
                        frontier = state.frontier.len(),
                        "crawl status"
                    );
                }

                _ = gauge_ticker.tick() => {
                    metrics::WAITING_FOR_REQUESTS.set(in_flight as f64);
                    metrics::TOKEN_BUCKET_FREE.set((capacity - in_flight) as f64);
                }

                _ = &mut idle => {
                    info!(
                        idle_secs = IDLE_TIMEOUT.as_secs(),
                        "no reports within the idle window, stopping crawl"
                    );
                    break;
                }

                _ = self.shutdown.notified() => {
                    info!(
                        frontier = state.frontier.len(),
                        in_flight,
                        "shutdown requested, stopping crawl early"
                    );
                    break;
                }
            }
        }

        let end = Local::now();
        self.events.emit(CrawlEvent::Finished {
            found: state.crawled.len(),
            online: state.online.len(),
        });
        info!(
            nodes = state.crawled.len(),
            online = state.online.len(),
            "crawl finished"
        );
        Ok(state.into_output(
            start.format(&date_format).to_string(),
            end.format(&date_format).to_string(),
        ))
    }
}
