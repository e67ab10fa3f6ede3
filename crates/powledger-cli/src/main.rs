use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use powledger_core::{
    chain::validate_blocks,
    constants::{DEFAULT_DIFFICULTY, DEFAULT_POW_WIDTH},
    Block, Miner, MinerConfig,
};
use serde::Deserialize;
use tracing::debug;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "powledger-cli")]
#[command(about = "CLI client for the proof-of-work ledger node")]
struct Cli {
    /// Node base URL (e.g. http://127.0.0.1:8080)
    #[arg(long, global = true, default_value = "http://127.0.0.1:8080")]
    node: String,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show the current tail of the chain
    Head,
    /// Print a single block
    Block {
        #[arg(long)]
        id: u64,
    },
    /// Fetch the whole chain and re-check every link and proof locally
    Verify {
        /// Difficulty the node was started with
        #[arg(long, default_value_t = DEFAULT_DIFFICULTY)]
        difficulty: u32,
        /// Proof-of-work width the node was started with
        #[arg(long, default_value_t = DEFAULT_POW_WIDTH)]
        pow_width: usize,
    },
}

#[derive(Debug, Deserialize)]
struct BlockRow {
    hash: String,
    block: Block,
}

/// Every advertised hash must match the one recomputed from the block itself.
fn check_rows(rows: &[BlockRow], miner: &Miner) -> Result<()> {
    for row in rows {
        let actual = hex::encode(row.block.chain_hash());
        if actual != row.hash {
            bail!(
                "block {} advertises hash {} but hashes to {}",
                row.block.id(),
                row.hash,
                actual
            );
        }
    }
    validate_blocks(rows.iter().map(|r| &r.block), miner)?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .pretty()
        .init();

    let cli = Cli::parse();
    let client = reqwest::Client::new();
    match cli.cmd {
        Command::Head => {
            let res = client.get(format!("{}/chain/head", cli.node)).send().await?;
            let status = res.status();
            let body = res.text().await?;
            println!("status: {}", status);
            println!("{body}");
        }
        Command::Block { id } => {
            let res = client
                .get(format!("{}/chain/blocks/{id}", cli.node))
                .send()
                .await?;
            let status = res.status();
            let body = res.text().await?;
            println!("status: {}", status);
            println!("{body}");
        }
        Command::Verify {
            difficulty,
            pow_width,
        } => {
            let miner = Miner::new(MinerConfig {
                difficulty,
                pow_width,
                parallel: false,
            })?;
            let rows: Vec<BlockRow> = client
                .get(format!("{}/chain/blocks", cli.node))
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;
            debug!(blocks = rows.len(), "fetched chain");
            check_rows(&rows, &miner)?;
            println!("chain of {} blocks verified", rows.len());
        }
    }
    Ok(())
}
