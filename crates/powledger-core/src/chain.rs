//! The single linear chain: genesis bootstrap, linkage-checked appends and reads.
use crate::{constants::BLOCK_LOG_TARGET, Block, ChainError, Miner, Timestamp, Transaction};
use serde::Serialize;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{error, info};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainState {
    Empty,
    HasGenesis,
    Growing,
}

/// Shared handle over the ordered block sequence.
///
/// Only one task may append at a time; any number of clones can read concurrently.
/// Mining never happens under the lock.
#[derive(Clone, Debug)]
pub struct Chain {
    blocks: Arc<RwLock<Vec<Arc<Block>>>>,
    miner: Miner,
}

impl Chain {
    pub fn new(miner: Miner) -> Self {
        Self {
            blocks: Arc::new(RwLock::new(Vec::new())),
            miner,
        }
    }

    pub fn miner(&self) -> &Miner {
        &self.miner
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<Arc<Block>>> {
        self.blocks.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Arc<Block>>> {
        self.blocks.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> ChainState {
        match self.read().len() {
            0 => ChainState::Empty,
            1 => ChainState::HasGenesis,
            _ => ChainState::Growing,
        }
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn init_genesis(&self, first_transaction: Transaction) -> Result<Arc<Block>, ChainError> {
        self.init_genesis_at(first_transaction, Timestamp::now()?)
    }

    /// Mines block 0 around `first_transaction` and installs it as the chain's root.
    pub fn init_genesis_at(
        &self,
        first_transaction: Transaction,
        timestamp: Timestamp,
    ) -> Result<Arc<Block>, ChainError> {
        if !self.is_empty() {
            return Err(ChainError::GenesisExists);
        }
        let genesis = self.miner.mine(Block::genesis(first_transaction, timestamp))?;
        self.install_genesis(genesis)
    }

    /// Installs an already mined block 0. The chain must still be empty.
    pub fn install_genesis(&self, genesis: Block) -> Result<Arc<Block>, ChainError> {
        if genesis.id() != 0 {
            return Err(ChainError::Sequence {
                expected: 0,
                found: genesis.id(),
            });
        }
        if let Some(prev) = genesis.prev_hash() {
            return Err(ChainError::ChainLinkage {
                id: 0,
                expected: String::new(),
                found: hex::encode(prev),
            });
        }
        if !self.miner.verify(&genesis) {
            return Err(ChainError::InvalidProof { id: 0 });
        }

        let mut blocks = self.write();
        if !blocks.is_empty() {
            return Err(ChainError::GenesisExists);
        }
        let genesis = Arc::new(genesis);
        blocks.push(genesis.clone());
        info!(
            target: BLOCK_LOG_TARGET,
            id = genesis.id(),
            hash = %hex::encode(genesis.chain_hash()),
            "genesis {}",
            genesis.canonical_string(true)
        );
        Ok(genesis)
    }

    pub fn tail(&self) -> Result<Arc<Block>, ChainError> {
        self.read().last().cloned().ok_or(ChainError::EmptyChain)
    }

    pub fn get(&self, id: u64) -> Option<Arc<Block>> {
        let index = usize::try_from(id).ok()?;
        self.read().get(index).cloned()
    }

    /// Snapshot of every block, genesis first.
    pub fn blocks(&self) -> Vec<Arc<Block>> {
        self.read().clone()
    }

    /// Unmined successor of the current tail holding `transactions`.
    pub fn next_candidate(
        &self,
        transactions: Vec<Transaction>,
        timestamp: Timestamp,
    ) -> Result<Block, ChainError> {
        let tail = self.tail()?;
        Ok(Block::new(
            tail.id() + 1,
            transactions,
            timestamp,
            Some(tail.chain_hash()),
        ))
    }

    /// Appends a mined block after re-checking linkage, sequence and proof-of-work.
    /// A rejected block leaves the chain untouched.
    pub fn append(&self, candidate: Block) -> Result<Arc<Block>, ChainError> {
        let mut blocks = self.write();
        let tail = blocks.last().ok_or(ChainError::EmptyChain)?;

        let expected = tail.chain_hash();
        if candidate.prev_hash() != Some(&expected) {
            let err = ChainError::ChainLinkage {
                id: candidate.id(),
                expected: hex::encode(expected),
                found: candidate.prev_hash().map(hex::encode).unwrap_or_default(),
            };
            error!(target: BLOCK_LOG_TARGET, %err, "rejected block");
            return Err(err);
        }
        if candidate.id() != tail.id() + 1 {
            return Err(ChainError::Sequence {
                expected: tail.id() + 1,
                found: candidate.id(),
            });
        }
        if !self.miner.verify(&candidate) {
            return Err(ChainError::InvalidProof { id: candidate.id() });
        }

        let block = Arc::new(candidate);
        blocks.push(block.clone());
        info!(
            target: BLOCK_LOG_TARGET,
            id = block.id(),
            txs = block.transactions().len(),
            hash = %hex::encode(block.chain_hash()),
            "{}: {}",
            block.id(),
            block.canonical_string(true)
        );
        Ok(block)
    }

    /// Re-validates the whole chain from genesis.
    pub fn validate(&self) -> Result<(), ChainError> {
        let blocks = self.read();
        validate_blocks(blocks.iter().map(|b| b.as_ref()), &self.miner)
    }
}

/// Checks an ordered block sequence: genesis at id 0 with the sentinel prev_hash,
/// contiguous ids, valid proofs and `prev_hash == predecessor.chain_hash()` throughout.
pub fn validate_blocks<'a>(
    blocks: impl IntoIterator<Item = &'a Block>,
    miner: &Miner,
) -> Result<(), ChainError> {
    let mut prev: Option<&Block> = None;
    for block in blocks {
        let (expected_id, expected_hash) = match prev {
            None => (0, None),
            Some(p) => (p.id() + 1, Some(p.chain_hash())),
        };
        if block.prev_hash() != expected_hash.as_ref() {
            return Err(ChainError::ChainLinkage {
                id: block.id(),
                expected: expected_hash.map(hex::encode).unwrap_or_default(),
                found: block.prev_hash().map(hex::encode).unwrap_or_default(),
            });
        }
        if block.id() != expected_id {
            return Err(ChainError::Sequence {
                expected: expected_id,
                found: block.id(),
            });
        }
        if !miner.verify(block) {
            return Err(ChainError::InvalidProof { id: block.id() });
        }
        prev = Some(block);
    }
    Ok(())
}
