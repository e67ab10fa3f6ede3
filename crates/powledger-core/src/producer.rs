//! The batching loop: pull transactions, build a candidate on the current tail,
//! mine it off the async runtime and append it.
use crate::{
    constants::DEFAULT_BLOCK_CAP, Block, Chain, ChainError, Miner, Timestamp, Transaction,
    TransactionSource,
};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{sync::watch, task::JoinHandle, time::timeout};
use tracing::{debug, error, info, warn};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProducerConfig {
    /// Exact number of transactions per block.
    pub block_cap: usize,
    /// Longest wait for a single transaction before `SourceTimeout` is raised.
    pub tx_timeout: Option<Duration>,
    /// Stop after this many blocks past genesis.
    pub max_blocks: Option<u64>,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            block_cap: DEFAULT_BLOCK_CAP,
            tx_timeout: None,
            max_blocks: None,
        }
    }
}

/// Resolves once `true` has been sent, or the sender has gone away.
async fn stop_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

async fn join_worker<T>(task: &mut JoinHandle<Result<T, ChainError>>) -> Result<T, ChainError> {
    task.await
        .map_err(|e| ChainError::Worker(e.to_string()))?
}

/// Mines `candidate` on the blocking pool. A stop request cancels the search and waits
/// for the worker to exit before returning `None`.
async fn mine_until_stopped(
    miner: Miner,
    candidate: Block,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<Option<Block>, ChainError> {
    let cancel = Arc::new(AtomicBool::new(false));
    let mut task = tokio::task::spawn_blocking({
        let cancel = cancel.clone();
        move || miner.mine_cancellable(candidate, &cancel)
    });
    tokio::select! {
        biased;
        _ = stop_requested(shutdown) => {
            debug!("stop requested, cancelling in-flight mining");
            cancel.store(true, Ordering::Relaxed);
            // a block found in the meantime is discarded along with the cancelled error
            let _ = join_worker(&mut task).await;
            Ok(None)
        }
        mined = join_worker(&mut task) => mined.map(Some),
    }
}

/// Sole writer of a [`Chain`].
pub struct BlockProducer<S> {
    chain: Chain,
    source: S,
    config: ProducerConfig,
    pending: Vec<Transaction>,
}

impl<S: TransactionSource> BlockProducer<S> {
    pub fn new(chain: Chain, source: S, config: ProducerConfig) -> Result<Self, ChainError> {
        if config.block_cap == 0 {
            return Err(ChainError::Validation(
                "block cap must be at least one transaction".into(),
            ));
        }
        Ok(Self {
            chain,
            source,
            config,
            pending: Vec::new(),
        })
    }

    pub fn chain(&self) -> &Chain {
        &self.chain
    }

    /// Transactions received but not yet sealed into a block.
    pub fn pending(&self) -> &[Transaction] {
        &self.pending
    }

    /// Next transaction from the source, or `None` once a stop is requested.
    async fn pull(
        &mut self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Option<Transaction>, ChainError> {
        let limit = self.config.tx_timeout;
        let source = &mut self.source;
        let fetch = async move {
            match limit {
                Some(limit) => timeout(limit, source.next_transaction())
                    .await
                    .unwrap_or(Err(ChainError::SourceTimeout(limit))),
                None => source.next_transaction().await,
            }
        };
        tokio::select! {
            biased;
            _ = stop_requested(shutdown) => Ok(None),
            tx = fetch => tx.map(Some),
        }
    }

    /// Installs genesis from the first sourced transaction if the chain is still empty.
    /// Returns the current tail, or `None` when stopped before genesis existed; a
    /// transaction already pulled for genesis then stays pending.
    pub async fn bootstrap(
        &mut self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Option<Arc<Block>>, ChainError> {
        if let Ok(tail) = self.chain.tail() {
            return Ok(Some(tail));
        }
        let first = if self.pending.is_empty() {
            loop {
                match self.pull(shutdown).await {
                    Ok(Some(tx)) => break tx,
                    Ok(None) => return Ok(None),
                    Err(ChainError::SourceTimeout(limit)) => {
                        warn!(?limit, "still waiting for a genesis transaction")
                    }
                    Err(err) => return Err(err),
                }
            }
        } else {
            self.pending.remove(0)
        };
        let candidate = match Timestamp::now() {
            Ok(ts) => Block::genesis(first.clone(), ts),
            Err(err) => {
                self.pending.insert(0, first);
                return Err(err);
            }
        };
        let miner = self.chain.miner().clone();
        match mine_until_stopped(miner, candidate, shutdown).await {
            Ok(Some(genesis)) => self.chain.install_genesis(genesis).map(Some),
            Ok(None) => {
                self.pending.insert(0, first);
                Ok(None)
            }
            Err(err) => {
                self.pending.insert(0, first);
                Err(err)
            }
        }
    }

    /// Fills one batch of exactly `block_cap` transactions, mines it and appends it.
    ///
    /// Returns `None` when stopped; transactions already pulled stay pending and a
    /// cancelled mining run never reaches the chain.
    pub async fn produce_block(
        &mut self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Option<Arc<Block>>, ChainError> {
        while self.pending.len() < self.config.block_cap {
            match self.pull(shutdown).await? {
                Some(tx) => self.pending.push(tx),
                None => return Ok(None),
            }
        }
        let batch: Vec<Transaction> = self.pending.drain(..self.config.block_cap).collect();
        let candidate =
            match Timestamp::now().and_then(|ts| self.chain.next_candidate(batch.clone(), ts)) {
                Ok(candidate) => candidate,
                Err(err) => {
                    self.restore(batch);
                    return Err(err);
                }
            };
        debug!(id = candidate.id(), txs = batch.len(), "mining candidate");

        let miner = self.chain.miner().clone();
        match mine_until_stopped(miner, candidate, shutdown).await {
            Ok(Some(mined)) => self.chain.append(mined).map(Some),
            Ok(None) => {
                self.restore(batch);
                Ok(None)
            }
            Err(err) => {
                self.restore(batch);
                Err(err)
            }
        }
    }

    fn restore(&mut self, mut batch: Vec<Transaction>) {
        batch.append(&mut self.pending);
        self.pending = batch;
    }

    /// Runs until stopped, `max_blocks` is reached or an unrecoverable error occurs.
    /// Source timeouts are logged and waited out; a linkage failure ends the loop.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<u64, ChainError> {
        if self.bootstrap(&mut shutdown).await?.is_none() {
            info!("block producer stopped before genesis");
            return Ok(0);
        }

        let mut appended = 0u64;
        while self.config.max_blocks.map_or(true, |max| appended < max) {
            match self.produce_block(&mut shutdown).await {
                Ok(Some(_)) => appended += 1,
                Ok(None) => break,
                Err(ChainError::SourceTimeout(limit)) => {
                    warn!(?limit, pending = self.pending.len(), "transaction source timed out")
                }
                Err(err) => {
                    error!(%err, appended, "block producer halted");
                    return Err(err);
                }
            }
        }
        info!(appended, "block producer stopped");
        Ok(appended)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ChannelSource, Miner, SimulatedSource, SimulatedSourceConfig};

    fn tx(id: u64) -> Transaction {
        Transaction::new(id, "Anna", "Ken", id).unwrap()
    }

    fn easy_chain() -> Chain {
        Chain::new(Miner::with_difficulty(1).unwrap())
    }

    async fn queued_source(count: u64) -> (tokio::sync::mpsc::Sender<Transaction>, ChannelSource) {
        let (sender, source) = ChannelSource::channel(count as usize + 1);
        for id in 0..count {
            sender.send(tx(id)).await.unwrap();
        }
        (sender, source)
    }

    #[test]
    fn zero_block_cap_is_rejected() {
        let (_tx, source) = ChannelSource::channel(1);
        let config = ProducerConfig {
            block_cap: 0,
            ..ProducerConfig::default()
        };
        assert!(BlockProducer::new(easy_chain(), source, config).is_err());
    }

    #[tokio::test]
    async fn block_cap_is_exact() {
        let (_sender, source) = queued_source(22).await;
        let config = ProducerConfig {
            block_cap: 20,
            ..ProducerConfig::default()
        };
        let mut producer = BlockProducer::new(easy_chain(), source, config).unwrap();
        let (_stop, mut shutdown) = watch::channel(false);

        let genesis = producer.bootstrap(&mut shutdown).await.unwrap().unwrap();
        assert_eq!(genesis.transactions(), &[tx(0)]);

        let block = producer.produce_block(&mut shutdown).await.unwrap().unwrap();
        assert_eq!(block.id(), 1);
        assert_eq!(block.transactions().len(), 20);
        let ids: Vec<u64> = block.transactions().iter().map(Transaction::id).collect();
        assert_eq!(ids, (1..=20).collect::<Vec<_>>());
        assert!(producer.pending().is_empty());
    }

    #[tokio::test]
    async fn twenty_one_transactions_fill_a_block_of_twenty_one() {
        let (_sender, source) = queued_source(22).await;
        let config = ProducerConfig {
            block_cap: 21,
            ..ProducerConfig::default()
        };
        let mut producer = BlockProducer::new(easy_chain(), source, config).unwrap();
        let (_stop, mut shutdown) = watch::channel(false);
        producer.bootstrap(&mut shutdown).await.unwrap();

        let block = producer.produce_block(&mut shutdown).await.unwrap().unwrap();
        assert_eq!(block.transactions().len(), 21);
        assert_eq!(producer.chain().len(), 2);
    }

    #[tokio::test]
    async fn run_stops_after_max_blocks() {
        let source = SimulatedSource::new(SimulatedSourceConfig {
            seed: Some(11),
            ..SimulatedSourceConfig::default()
        })
        .unwrap();
        let config = ProducerConfig {
            block_cap: 5,
            max_blocks: Some(3),
            ..ProducerConfig::default()
        };
        let mut producer = BlockProducer::new(easy_chain(), source, config).unwrap();
        let (_stop, shutdown) = watch::channel(false);

        assert_eq!(producer.run(shutdown).await.unwrap(), 3);
        let chain = producer.chain();
        assert_eq!(chain.len(), 4);
        chain.validate().unwrap();
        let ids: Vec<u64> = chain
            .blocks()
            .iter()
            .flat_map(|b| b.transactions().iter().map(Transaction::id).collect::<Vec<_>>())
            .collect();
        assert_eq!(ids, (0..16).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn stop_before_genesis_leaves_chain_empty() {
        let (_sender, source) = ChannelSource::channel(1);
        let mut producer =
            BlockProducer::new(easy_chain(), source, ProducerConfig::default()).unwrap();
        let (stop, shutdown) = watch::channel(false);
        stop.send(true).unwrap();

        assert_eq!(producer.run(shutdown).await.unwrap(), 0);
        assert!(producer.chain().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_mid_batch_keeps_pending_transactions() {
        let (_sender, source) = queued_source(6).await;
        let config = ProducerConfig {
            block_cap: 10,
            ..ProducerConfig::default()
        };
        let mut producer = BlockProducer::new(easy_chain(), source, config).unwrap();
        let (stop, mut shutdown) = watch::channel(false);
        producer.bootstrap(&mut shutdown).await.unwrap();

        let stopper = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            stop.send(true).unwrap();
        };
        let (produced, ()) = tokio::join!(producer.produce_block(&mut shutdown), stopper);
        assert!(produced.unwrap().is_none());
        assert_eq!(producer.pending().len(), 5);
        assert_eq!(producer.chain().len(), 1);
    }

    #[tokio::test]
    async fn stop_cancels_genesis_mining() {
        let (_sender, source) = queued_source(1).await;
        let chain = Chain::new(Miner::with_difficulty(20).unwrap());
        let mut producer = BlockProducer::new(chain, source, ProducerConfig::default()).unwrap();
        let (stop, mut shutdown) = watch::channel(false);

        let stopper = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            stop.send(true).unwrap();
        };
        let (booted, ()) = tokio::time::timeout(
            Duration::from_secs(5),
            async { tokio::join!(producer.bootstrap(&mut shutdown), stopper) },
        )
        .await
        .expect("bootstrap ignored the stop");
        assert!(booted.unwrap().is_none());
        assert!(producer.chain().is_empty());
        assert_eq!(producer.pending(), &[tx(0)]);
    }

    #[tokio::test]
    async fn stop_cancels_block_mining() {
        // the fixed genesis sealed with this pow has eight leading zero digits
        let chain = Chain::new(Miner::with_difficulty(8).unwrap());
        let genesis = Block::genesis(
            Transaction::new(0, "Jason", "James", 1).unwrap(),
            Timestamp::from_secs_f64(1_700_000_000.5).unwrap(),
        )
        .seal(crate::Pow::encode(36_526_241, 32).unwrap());
        chain.install_genesis(genesis).unwrap();

        let (_sender, source) = queued_source(2).await;
        let config = ProducerConfig {
            block_cap: 1,
            ..ProducerConfig::default()
        };
        let mut producer = BlockProducer::new(chain, source, config).unwrap();
        let (stop, mut shutdown) = watch::channel(false);

        let stopper = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            stop.send(true).unwrap();
        };
        let (produced, ()) = tokio::time::timeout(
            Duration::from_secs(5),
            async { tokio::join!(producer.produce_block(&mut shutdown), stopper) },
        )
        .await
        .expect("mining ignored the stop");
        assert!(produced.unwrap().is_none());
        assert_eq!(producer.chain().len(), 1);
        assert_eq!(producer.pending(), &[tx(0)]);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_source_times_out() {
        let (_sender, source) = queued_source(3).await;
        let config = ProducerConfig {
            block_cap: 4,
            tx_timeout: Some(Duration::from_millis(100)),
            ..ProducerConfig::default()
        };
        let mut producer = BlockProducer::new(easy_chain(), source, config).unwrap();
        let (_stop, mut shutdown) = watch::channel(false);
        producer.bootstrap(&mut shutdown).await.unwrap();

        let err = producer.produce_block(&mut shutdown).await.unwrap_err();
        assert_eq!(err, ChainError::SourceTimeout(Duration::from_millis(100)));
        assert_eq!(producer.pending().len(), 2);
    }

    #[tokio::test]
    async fn closed_source_halts_the_loop() {
        let (sender, source) = queued_source(3).await;
        drop(sender);
        let config = ProducerConfig {
            block_cap: 5,
            ..ProducerConfig::default()
        };
        let mut producer = BlockProducer::new(easy_chain(), source, config).unwrap();
        let (_stop, shutdown) = watch::channel(false);

        assert_eq!(producer.run(shutdown).await.unwrap_err(), ChainError::SourceClosed);
        assert_eq!(producer.chain().len(), 1);
        assert_eq!(producer.pending().len(), 2);
    }
}
