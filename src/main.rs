use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use kadscan::{
    metrics, report, AddrInfo, CrawlConfig, CrawlManager, EventBus, Harvester, PeerId,
    PreimageTable, TcpTransport,
};

#[derive(Clone, Debug)]
struct BootstrapPeer {
    info: AddrInfo,
}

impl FromStr for BootstrapPeer {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (addr_part, id_part) = s
            .rsplit_once('/')
            .context("bootstrap peer must include an id (format: ADDR/HEXID)")?;
        let id = PeerId::from_hex(id_part).context("invalid hex peer id")?;
        Ok(BootstrapPeer {
            info: AddrInfo::new(id, vec![addr_part.to_string()]),
        })
    }
}

#[derive(Parser, Debug)]
#[command(name = "kadscan")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (JSON). Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Preimage table file (CSV, `.gz` accepted).
    #[arg(short, long)]
    preimages: PathBuf,

    /// Bootstrap peers, `ADDR/HEXID` (repeatable).
    #[arg(short = 'B', long = "bootstrap", value_name = "PEER", required = true)]
    bootstrap: Vec<BootstrapPeer>,

    /// Dump gathered metrics to stderr after the run.
    #[arg(long)]
    dump_metrics: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let config = CrawlConfig::load_or_default(args.config.as_deref())?;
    let preimages = Arc::new(PreimageTable::load(&args.preimages)?);
    if u32::from(preimages.depth()) < u32::from(kadscan::harvester::MAX_FIND_NODE_ROUNDS) {
        anyhow::bail!(
            "preimage table depth {} is too shallow for a full crawl (need {})",
            preimages.depth(),
            kadscan::harvester::MAX_FIND_NODE_ROUNDS
        );
    }

    let events = EventBus::new();
    let mut manager = CrawlManager::new(config.crawloptions.clone(), events.clone());
    for worker_id in 0..config.worker.count.max(1) {
        let worker = Harvester::new(
            worker_id,
            Arc::new(TcpTransport::new()),
            preimages.clone(),
            config.worker.clone(),
            events.clone(),
        );
        manager.add_worker(Arc::new(worker));
    }

    // Graceful shutdown on Ctrl+C: the dispatcher drains out early and the
    // partial snapshot is still written below.
    let shutdown = manager.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, finishing crawl early");
            shutdown.notify_one();
        }
    });

    let bootstraps: Vec<AddrInfo> = args.bootstrap.into_iter().map(|b| b.info).collect();
    let output = manager.crawl_network(bootstraps).await?;

    info!(
        nodes = output.nodes.len(),
        reachable = output.reachable_count(),
        start = %output.start_date,
        end = %output.end_date,
        "crawl summary"
    );

    if config.crawloptions.data_output.data_output_enabled {
        report::write_snapshot(&output, &config.crawloptions.data_output)?;
    }

    if config.crawloptions.sanity_enabled {
        match report::sanity_check(&output, &config.crawloptions.canaryfile) {
            Ok(summary) if summary.reachable == summary.expected => {
                info!("all canary peers reachable");
            }
            Ok(summary) => warn!(
                expected = summary.expected,
                reachable = summary.reachable,
                "some canary peers were not reachable"
            ),
            Err(e) => warn!(error = %e, "sanity check failed"),
        }
    }

    if args.dump_metrics {
        eprintln!("{}", metrics::gather());
    }

    Ok(())
}
