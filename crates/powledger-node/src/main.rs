mod api;

use anyhow::Context;
use clap::Parser;
use powledger_core::{
    constants::{BLOCK_LOG_TARGET, DEFAULT_BLOCK_CAP, DEFAULT_DIFFICULTY, DEFAULT_POW_WIDTH},
    BlockProducer, Chain, Miner, MinerConfig, ProducerConfig, SimulatedSource,
    SimulatedSourceConfig,
};
use std::{
    fs::OpenOptions,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::sync::watch;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{
    filter::Targets, fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer,
};

#[derive(Parser, Debug)]
#[command(name = "powledger-node")]
#[command(about = "Proof-of-work ledger simulator")]
struct Args {
    /// Address the inspection API listens on, e.g. 127.0.0.1:8080
    #[arg(long, default_value = "127.0.0.1:8080")]
    listen: String,

    /// Do not start the inspection API
    #[arg(long)]
    no_api: bool,

    /// Leading zero hex digits required of each proof-of-work digest
    #[arg(long, default_value_t = DEFAULT_DIFFICULTY)]
    difficulty: u32,

    /// Transactions per block
    #[arg(long, default_value_t = DEFAULT_BLOCK_CAP)]
    block_cap: usize,

    /// Byte width of the encoded proof-of-work
    #[arg(long, default_value_t = DEFAULT_POW_WIDTH)]
    pow_width: usize,

    /// Search proof-of-work candidates on all cores
    #[arg(long)]
    parallel_mining: bool,

    /// Simulated network delay before each transaction, in milliseconds
    #[arg(long)]
    tx_delay_ms: Option<u64>,

    /// Upper bound of a random delay range starting at --tx-delay-ms
    #[arg(long, requires = "tx_delay_ms")]
    tx_delay_max_ms: Option<u64>,

    /// Give up waiting for a single transaction after this many milliseconds
    #[arg(long)]
    tx_timeout_ms: Option<u64>,

    /// Stop after this many blocks past genesis
    #[arg(long)]
    max_blocks: Option<u64>,

    /// Seed for the simulated transaction feed
    #[arg(long)]
    seed: Option<u64>,

    /// Append-only log of produced blocks
    #[arg(long, default_value = "blocks.log")]
    log_file: PathBuf,
}

impl Args {
    fn miner_config(&self) -> MinerConfig {
        MinerConfig {
            difficulty: self.difficulty,
            pow_width: self.pow_width,
            parallel: self.parallel_mining,
        }
    }

    fn producer_config(&self) -> ProducerConfig {
        ProducerConfig {
            block_cap: self.block_cap,
            tx_timeout: self.tx_timeout_ms.map(Duration::from_millis),
            max_blocks: self.max_blocks,
        }
    }

    fn source_config(&self) -> SimulatedSourceConfig {
        let delay = self.tx_delay_ms.map(|min| {
            let max = self.tx_delay_max_ms.unwrap_or(min);
            (Duration::from_millis(min), Duration::from_millis(max))
        });
        SimulatedSourceConfig {
            delay,
            seed: self.seed,
            ..SimulatedSourceConfig::default()
        }
    }
}

/// Console output follows `RUST_LOG`; block events are also appended to `log_file`.
fn init_tracing(log_file: &Path) -> anyhow::Result<()> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file)
        .with_context(|| format!("opening block log {}", log_file.display()))?;

    let console = fmt::layer().with_filter(
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    );
    let block_log = fmt::layer()
        .with_ansi(false)
        .with_target(false)
        .with_writer(Mutex::new(file))
        .with_filter(Targets::new().with_target(BLOCK_LOG_TARGET, Level::INFO));

    tracing_subscriber::registry()
        .with(console)
        .with(block_log)
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(&args.log_file)?;

    let miner = Miner::new(args.miner_config())?;
    let chain = Chain::new(miner);
    let source = SimulatedSource::new(args.source_config())?;
    let mut producer = BlockProducer::new(chain.clone(), source, args.producer_config())?;

    let (stop_tx, stop_rx) = watch::channel(false);
    let stop_tx = Arc::new(stop_tx);

    tokio::spawn({
        let stop_tx = stop_tx.clone();
        async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                error!(%err, "cannot listen for ctrl-c; stop the node another way");
                return;
            }
            info!("ctrl-c received, stopping");
            let _ = stop_tx.send(true);
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("second ctrl-c, exiting without waiting for the producer");
                std::process::exit(130);
            }
        }
    });

    let producing = tokio::spawn({
        let stop_tx = stop_tx.clone();
        let shutdown = stop_rx.clone();
        async move {
            let result = producer.run(shutdown).await;
            // the API has nothing left to watch once the producer is done
            let _ = stop_tx.send(true);
            result
        }
    });

    if !args.no_api {
        let addr: SocketAddr = args.listen.parse()?;
        api::serve(addr, api::AppState { chain: chain.clone() }, stop_rx).await?;
    }

    let appended = producing.await??;
    let tail = chain.tail().ok().map(|b| b.id());
    info!(appended, ?tail, "powledger-node stopped");
    Ok(())
}
