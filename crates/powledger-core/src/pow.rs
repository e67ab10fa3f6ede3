//! Difficulty predicate and the miner that searches for a block's proof-of-work.
use crate::{
    constants::{DEFAULT_DIFFICULTY, DEFAULT_POW_WIDTH, HASH_HEX_SIZE},
    mine, Block, ChainError, Hash, Pow,
};
use std::sync::atomic::AtomicBool;
use tracing::debug;

/// Number of leading `0` hex digits in `hash`.
pub fn count_leading_zero_nibbles(hash: &Hash) -> u32 {
    let mut total = 0u32;
    for b in hash {
        if *b == 0 {
            total += 2;
        } else {
            if *b < 0x10 {
                total += 1;
            }
            break;
        }
    }
    total
}

pub fn meets_difficulty(hash: &Hash, difficulty: u32) -> bool {
    count_leading_zero_nibbles(hash) >= difficulty
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MinerConfig {
    /// Leading zero hex digits required of the proof digest.
    pub difficulty: u32,
    /// Byte width of the big-endian pow encoding.
    pub pow_width: usize,
    /// Search candidates on the rayon pool instead of the calling thread.
    pub parallel: bool,
}

impl Default for MinerConfig {
    fn default() -> Self {
        Self {
            difficulty: DEFAULT_DIFFICULTY,
            pow_width: DEFAULT_POW_WIDTH,
            parallel: false,
        }
    }
}

/// Brute-force proof-of-work search. Cheap to clone; holds only its validated config.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Miner {
    config: MinerConfig,
}

impl Miner {
    pub fn new(config: MinerConfig) -> Result<Self, ChainError> {
        if config.difficulty >= HASH_HEX_SIZE as u32 {
            return Err(ChainError::InvalidDifficulty {
                difficulty: config.difficulty,
                max: HASH_HEX_SIZE as u32,
            });
        }
        if config.pow_width == 0 {
            return Err(ChainError::InvalidPowWidth(config.pow_width));
        }
        Ok(Self { config })
    }

    pub fn with_difficulty(difficulty: u32) -> Result<Self, ChainError> {
        Self::new(MinerConfig {
            difficulty,
            ..MinerConfig::default()
        })
    }

    pub fn difficulty(&self) -> u32 {
        self.config.difficulty
    }

    pub fn pow_width(&self) -> usize {
        self.config.pow_width
    }

    /// Seals `block` with the smallest positive pow whose proof digest meets the
    /// difficulty. A block that is already mined comes back unchanged.
    pub fn mine(&self, block: Block) -> Result<Block, ChainError> {
        self.mine_cancellable(block, &AtomicBool::new(false))
    }

    /// Like [`Miner::mine`], but the search gives up with `MiningCancelled` soon after
    /// `cancel` is set.
    pub fn mine_cancellable(
        &self,
        block: Block,
        cancel: &AtomicBool,
    ) -> Result<Block, ChainError> {
        if block.is_mined() {
            return Ok(block);
        }
        let prefix = block.mining_prefix();
        let MinerConfig {
            difficulty,
            pow_width,
            parallel,
        } = self.config;
        let value = if parallel {
            mine::search_parallel(&prefix, difficulty, pow_width, cancel)?
        } else {
            mine::search_sequential(&prefix, difficulty, pow_width, cancel)?
        };
        let pow = Pow::encode(value, self.config.pow_width)?;
        debug!(
            id = block.id(),
            pow = value,
            difficulty = self.config.difficulty,
            "found proof-of-work"
        );
        Ok(block.seal(pow))
    }

    /// Re-checks a block's pow instead of trusting it.
    pub fn verify(&self, block: &Block) -> bool {
        match (block.pow(), block.proof_hash()) {
            (Some(pow), Some(hash)) => {
                pow.width() == self.config.pow_width && meets_difficulty(&hash, self.config.difficulty)
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Timestamp, Transaction};

    fn genesis_fixture() -> Block {
        Block::genesis(
            Transaction::new(0, "Jason", "James", 1).unwrap(),
            Timestamp::from_secs_f64(1_700_000_000.5).unwrap(),
        )
    }

    #[test]
    fn leading_zero_nibbles_examples() {
        let mut h = [0u8; 32];
        assert_eq!(count_leading_zero_nibbles(&h), 64);
        h[0] = 0x0F;
        assert_eq!(count_leading_zero_nibbles(&h), 1);
        h[0] = 0x10;
        assert_eq!(count_leading_zero_nibbles(&h), 0);
        h = [0u8; 32];
        h[1] = 0x80;
        assert_eq!(count_leading_zero_nibbles(&h), 2);
        h[1] = 0x05;
        assert_eq!(count_leading_zero_nibbles(&h), 3);
    }

    #[test]
    fn difficulty_at_hash_width_is_rejected() {
        assert_eq!(
            Miner::with_difficulty(64),
            Err(ChainError::InvalidDifficulty {
                difficulty: 64,
                max: 64
            })
        );
        assert!(Miner::with_difficulty(63).is_ok());
    }

    #[test]
    fn zero_pow_width_is_rejected() {
        let config = MinerConfig {
            pow_width: 0,
            ..MinerConfig::default()
        };
        assert_eq!(Miner::new(config), Err(ChainError::InvalidPowWidth(0)));
    }

    #[test]
    fn genesis_mines_with_one_leading_zero() {
        let miner = Miner::with_difficulty(1).unwrap();
        let mined = miner.mine(genesis_fixture()).unwrap();
        assert_eq!(mined.pow().and_then(Pow::value), Some(2));
        let proof = hex::encode(mined.proof_hash().unwrap());
        assert!(proof.starts_with('0'));
        assert!(miner.verify(&mined));
    }

    #[test]
    fn mining_finds_the_smallest_pow() {
        let miner = Miner::with_difficulty(2).unwrap();
        let mined = miner.mine(genesis_fixture()).unwrap();
        assert_eq!(mined.pow().and_then(Pow::value), Some(335));
        assert_eq!(
            hex::encode(mined.chain_hash()),
            "0d842e1cd0dd573d7cf149625e06399ac2ccc03e47367b9f3edea9fa05837249"
        );
    }

    #[test]
    fn narrow_pow_width_changes_the_search() {
        let miner = Miner::new(MinerConfig {
            difficulty: 2,
            pow_width: 4,
            parallel: false,
        })
        .unwrap();
        let mined = miner.mine(genesis_fixture()).unwrap();
        let pow = mined.pow().unwrap();
        assert_eq!(pow.width(), 4);
        assert_eq!(pow.value(), Some(506));
    }

    #[test]
    fn parallel_search_agrees_with_sequential() {
        let sequential = Miner::with_difficulty(3).unwrap();
        let parallel = Miner::new(MinerConfig {
            difficulty: 3,
            parallel: true,
            ..MinerConfig::default()
        })
        .unwrap();
        let a = sequential.mine(genesis_fixture()).unwrap();
        let b = parallel.mine(genesis_fixture()).unwrap();
        assert_eq!(a.pow().and_then(Pow::value), Some(3831));
        assert_eq!(a, b);
    }

    #[test]
    fn mining_is_idempotent() {
        let miner = Miner::with_difficulty(2).unwrap();
        let once = miner.mine(genesis_fixture()).unwrap();
        let twice = miner.mine(once.clone()).unwrap();
        assert_eq!(once.pow(), twice.pow());

        // a stricter miner still leaves an already mined block alone
        let stricter = Miner::with_difficulty(4).unwrap();
        assert_eq!(stricter.mine(once.clone()).unwrap(), once);
    }

    #[test]
    fn verify_rejects_unmined_and_tampered_blocks() {
        let miner = Miner::with_difficulty(2).unwrap();
        assert!(!miner.verify(&genesis_fixture()));

        let forged = genesis_fixture().seal(Pow::encode(1, 32).unwrap());
        assert!(!miner.verify(&forged));
    }

    #[test]
    fn cancelled_search_gives_up() {
        let cancel = AtomicBool::new(true);
        for parallel in [false, true] {
            let miner = Miner::new(MinerConfig {
                difficulty: 12,
                parallel,
                ..MinerConfig::default()
            })
            .unwrap();
            assert_eq!(
                miner.mine_cancellable(genesis_fixture(), &cancel),
                Err(ChainError::MiningCancelled)
            );
        }
    }

    #[test]
    fn cancel_reaches_a_running_search() {
        use std::sync::{atomic::Ordering, Arc};
        use std::time::{Duration, Instant};

        let cancel = Arc::new(AtomicBool::new(false));
        let miner = Miner::with_difficulty(20).unwrap();
        let worker = std::thread::spawn({
            let cancel = cancel.clone();
            move || miner.mine_cancellable(genesis_fixture(), &cancel)
        });
        std::thread::sleep(Duration::from_millis(50));
        let started = Instant::now();
        cancel.store(true, Ordering::Relaxed);
        assert_eq!(worker.join().unwrap(), Err(ChainError::MiningCancelled));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn exhausted_width_reports_overflow() {
        // one byte holds pow values 1..=127, far too few for six zero digits
        let miner = Miner::new(MinerConfig {
            difficulty: 6,
            pow_width: 1,
            parallel: false,
        })
        .unwrap();
        assert_eq!(
            miner.mine(genesis_fixture()),
            Err(ChainError::EncodingOverflow { width: 1 })
        );
    }
}
