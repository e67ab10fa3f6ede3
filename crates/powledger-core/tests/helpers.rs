use powledger_core::{Block, Chain, Miner, Timestamp, Transaction};

pub const GENESIS_TIMESTAMP: f64 = 1_700_000_000.5;

pub fn tx(id: u64, from: &str, to: &str, amount: u64) -> Transaction {
    Transaction::new(id, from, to, amount).expect("valid transaction")
}

pub fn genesis_tx() -> Transaction {
    tx(0, "Jason", "James", 1)
}

/// Chain with the fixed genesis block mined at `difficulty`.
pub fn chain_with_genesis(difficulty: u32) -> Chain {
    let chain = Chain::new(Miner::with_difficulty(difficulty).expect("valid difficulty"));
    chain
        .init_genesis_at(
            genesis_tx(),
            Timestamp::from_secs_f64(GENESIS_TIMESTAMP).expect("finite timestamp"),
        )
        .expect("genesis");
    chain
}

/// Mines a successor of the current tail without appending it.
pub fn mine_next(chain: &Chain, txs: Vec<Transaction>) -> Block {
    let candidate = chain
        .next_candidate(txs, Timestamp::now().expect("clock after epoch"))
        .expect("candidate");
    chain.miner().mine(candidate).expect("mined")
}
