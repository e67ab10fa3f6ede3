//! Where transactions come from. The node runs on the simulated feed; tests and
//! embedders can push their own through a channel.
use crate::{constants::MAX_SIM_AMOUNT, ChainError, Transaction};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::trace;

/// Roster the simulated feed draws senders and receivers from.
pub const DEFAULT_NAMES: &[&str] = &[
    "John", "James", "Peter", "Harry", "Marcus", "Adrian", "Anna", "Beatrice", "Cindy", "Diana",
    "Eason", "Francis", "Gregory", "Hannah", "Ken", "Elizabeth", "Monty", "Thomas", "Samuel",
];

/// A feed of transactions arriving from outside the chain.
pub trait TransactionSource: Send {
    /// Waits for the next transaction. Must be safe to drop mid-wait.
    fn next_transaction(&mut self) -> impl Future<Output = Result<Transaction, ChainError>> + Send;
}

/// Hands out process-unique, monotonically increasing ids.
#[derive(Debug, Default)]
pub struct IdAllocator {
    next: u64,
}

impl IdAllocator {
    pub fn starting_at(next: u64) -> Self {
        Self { next }
    }

    pub fn next_id(&mut self) -> u64 {
        let id = self.next;
        self.next += 1;
        id
    }

    pub fn peek(&self) -> u64 {
        self.next
    }
}

#[derive(Clone, Debug)]
pub struct SimulatedSourceConfig {
    pub names: Vec<String>,
    pub max_amount: u64,
    /// Inclusive range of simulated network delay before each transaction.
    pub delay: Option<(Duration, Duration)>,
    pub seed: Option<u64>,
}

impl Default for SimulatedSourceConfig {
    fn default() -> Self {
        Self {
            names: DEFAULT_NAMES.iter().map(|n| n.to_string()).collect(),
            max_amount: MAX_SIM_AMOUNT,
            delay: None,
            seed: None,
        }
    }
}

/// Random transfers between distinct members of a fixed roster.
#[derive(Debug)]
pub struct SimulatedSource {
    rng: StdRng,
    ids: IdAllocator,
    names: Vec<String>,
    max_amount: u64,
    delay: Option<(Duration, Duration)>,
}

impl SimulatedSource {
    pub fn new(config: SimulatedSourceConfig) -> Result<Self, ChainError> {
        let mut names: Vec<String> = Vec::with_capacity(config.names.len());
        for name in config.names {
            if name.is_empty() {
                return Err(ChainError::Validation("empty name in roster".into()));
            }
            if !names.contains(&name) {
                names.push(name);
            }
        }
        if names.len() < 2 {
            return Err(ChainError::Validation(
                "roster needs at least two distinct names".into(),
            ));
        }
        if let Some((min, max)) = config.delay {
            if min > max {
                return Err(ChainError::Validation(format!(
                    "delay range {min:?}..={max:?} is empty"
                )));
            }
        }
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Ok(Self {
            rng,
            ids: IdAllocator::default(),
            names,
            max_amount: config.max_amount,
            delay: config.delay,
        })
    }

    /// Builds one transaction immediately, without the simulated delay.
    pub fn generate(&mut self) -> Result<Transaction, ChainError> {
        let sender = self.rng.gen_range(0..self.names.len());
        // draw from the other n-1 names so the receiver never equals the sender
        let mut receiver = self.rng.gen_range(0..self.names.len() - 1);
        if receiver >= sender {
            receiver += 1;
        }
        let amount = self.rng.gen_range(0..=self.max_amount);
        let tx = Transaction::new(
            self.ids.next_id(),
            self.names[sender].clone(),
            self.names[receiver].clone(),
            amount,
        )?;
        trace!(
            id = tx.id(),
            "{} gives {} {}",
            tx.sender(),
            tx.receiver(),
            tx.amount()
        );
        Ok(tx)
    }
}

impl TransactionSource for SimulatedSource {
    async fn next_transaction(&mut self) -> Result<Transaction, ChainError> {
        if let Some((min, max)) = self.delay {
            let wait = self.rng.gen_range(min..=max);
            tokio::time::sleep(wait).await;
        }
        self.generate()
    }
}

/// Transactions pushed in by another task.
#[derive(Debug)]
pub struct ChannelSource {
    rx: mpsc::Receiver<Transaction>,
}

impl ChannelSource {
    pub fn new(rx: mpsc::Receiver<Transaction>) -> Self {
        Self { rx }
    }

    pub fn channel(buffer: usize) -> (mpsc::Sender<Transaction>, Self) {
        let (tx, rx) = mpsc::channel(buffer);
        (tx, Self::new(rx))
    }
}

impl TransactionSource for ChannelSource {
    async fn next_transaction(&mut self) -> Result<Transaction, ChainError> {
        self.rx.recv().await.ok_or(ChainError::SourceClosed)
    }
}
