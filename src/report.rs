//! Crawl snapshot types and output adapters.
//!
//! The snapshot is the crawler's product: one entry per peer ever
//! enqueued, whether or not it was reachable. Entries are keyed by hex
//! peer id in a sorted map so serialized snapshots are stable across
//! runs.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Local;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::OutputConfig;
use crate::peer::PeerId;

/// Final state of one peer after a crawl run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrawledNode {
    pub id: PeerId,
    pub multi_addrs: Vec<String>,
    pub reachable: bool,
    pub agent_version: String,
    pub neighbours: Vec<PeerId>,
    pub timestamp: String,
}

/// Point-in-time snapshot of the overlay.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrawlOutput {
    pub start_date: String,
    pub end_date: String,
    pub nodes: BTreeMap<PeerId, CrawledNode>,
}

impl CrawlOutput {
    pub fn reachable_count(&self) -> usize {
        self.nodes.values().filter(|n| n.reachable).count()
    }
}

/// Write the snapshot as JSON under the configured output directory,
/// named by the configured time format. Returns the file path.
pub fn write_snapshot(output: &CrawlOutput, cfg: &OutputConfig) -> Result<PathBuf> {
    fs::create_dir_all(&cfg.outpath)
        .with_context(|| format!("creating output dir {}", cfg.outpath.display()))?;
    let stamp = Local::now().format(&cfg.filename_time_format).to_string();
    let path = cfg.outpath.join(format!("visited_peers_{stamp}.json"));
    let file =
        File::create(&path).with_context(|| format!("creating snapshot {}", path.display()))?;
    serde_json::to_writer_pretty(file, output).context("serializing snapshot")?;
    info!(path = %path.display(), nodes = output.nodes.len(), "wrote crawl snapshot");
    Ok(path)
}

/// Outcome of comparing a snapshot against the canary list.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SanitySummary {
    pub expected: usize,
    pub found: usize,
    pub reachable: usize,
}

/// Compare the snapshot against a list of well-known peer ids (one hex id
/// per line; `#` comments and blank lines ignored). A healthy crawl finds
/// all of them reachable; anything else is logged per canary.
pub fn sanity_check(output: &CrawlOutput, canary_path: &Path) -> Result<SanitySummary> {
    let file = File::open(canary_path)
        .with_context(|| format!("opening canary file {}", canary_path.display()))?;

    let mut summary = SanitySummary::default();
    for line in BufReader::new(file).lines() {
        let line = line.context("reading canary file")?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let id = PeerId::from_hex(line)
            .with_context(|| format!("canary id {line} is not valid hex"))?;
        summary.expected += 1;
        match output.nodes.get(&id) {
            Some(node) if node.reachable => {
                summary.found += 1;
                summary.reachable += 1;
            }
            Some(_) => {
                summary.found += 1;
                warn!(canary = %id, "canary peer found but unreachable");
            }
            None => warn!(canary = %id, "canary peer missing from snapshot"),
        }
    }
    info!(
        expected = summary.expected,
        found = summary.found,
        reachable = summary.reachable,
        "sanity check complete"
    );
    Ok(summary)
}
