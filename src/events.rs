//! Crawl lifecycle events.
//!
//! A broadcast bus decouples the crawl core from observers (status UIs,
//! canary watchers). Emission never blocks and never fails; events sent
//! while nobody subscribes are dropped.

use tokio::sync::broadcast;

use crate::peer::AddrInfo;

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Clone, Debug)]
pub enum CrawlEvent {
    /// A crawl run began with the given number of bootstrap peers.
    Started { bootstraps: usize },
    /// A remote peer was dialled and answered on a DHT stream.
    Connected { peer: AddrInfo },
    /// The crawl run finished.
    Finished { found: usize, online: usize },
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<CrawlEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CrawlEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: CrawlEvent) {
        // No receivers is fine; observers are optional.
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
