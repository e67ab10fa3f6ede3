//! Core data model for the proof-of-work ledger simulator: transactions, blocks,
//! their canonical encodings, the miner and the single-writer chain.
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

pub mod chain;
pub mod constants;
pub mod error;
mod mine;
pub mod pow;
pub mod producer;
pub mod source;

pub use chain::{Chain, ChainState};
pub use constants::HASH_SIZE;
pub use error::ChainError;
pub use pow::{Miner, MinerConfig};
pub use producer::{BlockProducer, ProducerConfig};
pub use source::{ChannelSource, IdAllocator, SimulatedSource, SimulatedSourceConfig, TransactionSource};

pub type Hash = [u8; HASH_SIZE];

pub fn sha256(data: &[u8]) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(data);
    finish(hasher)
}

pub(crate) fn finish(hasher: Sha256) -> Hash {
    let digest = hasher.finalize();
    let mut out = [0u8; HASH_SIZE];
    out.copy_from_slice(&digest[..]);
    out
}

/// A single transfer. Immutable once built; `sender` and `receiver` always differ.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "TransactionRecord")]
pub struct Transaction {
    id: u64,
    sender: String,
    receiver: String,
    amount: u64,
}

/// Wire shape accepted when decoding; wide enough to see (and reject) negative amounts.
#[derive(Deserialize)]
struct TransactionRecord {
    id: u64,
    sender: String,
    receiver: String,
    amount: i128,
}

impl TryFrom<TransactionRecord> for Transaction {
    type Error = ChainError;

    fn try_from(record: TransactionRecord) -> Result<Self, Self::Error> {
        let amount = u64::try_from(record.amount).map_err(|_| {
            ChainError::Validation(format!("amount {} is out of range", record.amount))
        })?;
        Transaction::new(record.id, record.sender, record.receiver, amount)
    }
}

impl Transaction {
    pub fn new(
        id: u64,
        sender: impl Into<String>,
        receiver: impl Into<String>,
        amount: u64,
    ) -> Result<Self, ChainError> {
        let sender = sender.into();
        let receiver = receiver.into();
        if sender.is_empty() || receiver.is_empty() {
            return Err(ChainError::Validation(format!(
                "transaction {id} has an empty party"
            )));
        }
        if sender == receiver {
            return Err(ChainError::Validation(format!(
                "transaction {id} sends from {sender} to itself"
            )));
        }
        Ok(Self {
            id,
            sender,
            receiver,
            amount,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn sender(&self) -> &str {
        &self.sender
    }

    pub fn receiver(&self) -> &str {
        &self.receiver
    }

    pub fn amount(&self) -> u64 {
        self.amount
    }

    /// Canonical `(id,sender,receiver,amount)` form used inside block encodings.
    pub fn encode(&self) -> String {
        self.to_string()
    }

    pub fn to_json(&self) -> Result<String, ChainError> {
        serde_json::to_string(self).map_err(|e| ChainError::Validation(e.to_string()))
    }

    pub fn from_json(data: &str) -> Result<Self, ChainError> {
        serde_json::from_str(data).map_err(|e| ChainError::Validation(e.to_string()))
    }
}

impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({},{},{},{})",
            self.id, self.sender, self.receiver, self.amount
        )
    }
}

/// Seconds since the Unix epoch with sub-second precision. Always finite.
#[derive(Clone, Copy, Debug, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(into = "f64", try_from = "f64")]
pub struct Timestamp(f64);

impl Timestamp {
    /// Wall-clock time. A clock set before the epoch is an error, not a zero timestamp.
    pub fn now() -> Result<Self, ChainError> {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| Self(d.as_secs_f64()))
            .map_err(|e| {
                ChainError::InvalidTimestamp(format!("system clock is before the epoch: {e}"))
            })
    }

    pub fn from_secs_f64(secs: f64) -> Result<Self, ChainError> {
        if !secs.is_finite() {
            return Err(ChainError::InvalidTimestamp(format!(
                "{secs} is not a finite number of seconds"
            )));
        }
        Ok(Self(secs))
    }

    pub fn as_secs_f64(&self) -> f64 {
        self.0
    }
}

impl From<Timestamp> for f64 {
    fn from(ts: Timestamp) -> Self {
        ts.as_secs_f64()
    }
}

impl TryFrom<f64> for Timestamp {
    type Error = ChainError;

    fn try_from(secs: f64) -> Result<Self, Self::Error> {
        Timestamp::from_secs_f64(secs)
    }
}

impl fmt::Display for Timestamp {
    // Whole seconds still render with a trailing ".0".
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.fract() == 0.0 {
            write!(f, "{:.1}", self.0)
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Largest proof-of-work value a positive two's-complement integer of `width` bytes can hold,
/// capped at `u64::MAX`. Fields wider than eight bytes keep the extra high-order bytes as
/// zero padding, so their search space ends at `u64::MAX` rather than at `2^(8*width-1) - 1`.
pub fn max_pow_value(width: usize) -> u64 {
    if width == 0 {
        0
    } else if width > 8 {
        u64::MAX
    } else {
        (1u64 << (width * constants::BYTE - 1)) - 1
    }
}

/// The low-order bytes of `value` that land in a `width`-byte big-endian field.
/// Anything wider than eight bytes is zero padding in front of these.
pub(crate) fn pow_value_bytes(value: u64, width: usize) -> Vec<u8> {
    let be = value.to_be_bytes();
    be[be.len() - width.min(be.len())..].to_vec()
}

/// Proof-of-work value in its fixed-width big-endian byte form.
///
/// The value itself is a `u64`: any width above eight bytes only adds leading zero
/// bytes, and [`max_pow_value`] bounds the search accordingly.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Pow(Vec<u8>);

impl Pow {
    pub fn encode(value: u64, width: usize) -> Result<Self, ChainError> {
        if width == 0 {
            return Err(ChainError::InvalidPowWidth(width));
        }
        if value > max_pow_value(width) {
            return Err(ChainError::EncodingOverflow { width });
        }
        let mut bytes = vec![0u8; width.saturating_sub(8)];
        bytes.extend(pow_value_bytes(value, width));
        Ok(Self(bytes))
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn width(&self) -> usize {
        self.0.len()
    }

    /// Integer value, if it is non-negative and fits in a `u64`.
    pub fn value(&self) -> Option<u64> {
        match self.0.first() {
            None => return None,
            Some(b) if b & 0x80 != 0 => return None,
            Some(_) => {}
        }
        let (padding, tail) = self.0.split_at(self.0.len().saturating_sub(8));
        if padding.iter().any(|b| *b != 0) {
            return None;
        }
        Some(tail.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b)))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }
}

/// Everything a block commits to apart from its proof-of-work.
#[derive(Clone, Debug, PartialEq)]
pub struct BlockBody {
    pub id: u64,
    pub transactions: Vec<Transaction>,
    pub timestamp: Timestamp,
    /// `None` is the genesis sentinel.
    pub prev_hash: Option<Hash>,
}

/// A block is either still waiting for its proof-of-work or sealed with one.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(into = "BlockRecord", try_from = "BlockRecord")]
pub enum Block {
    Unmined(BlockBody),
    Mined { body: BlockBody, pow: Pow },
}

impl Block {
    pub fn new(
        id: u64,
        transactions: Vec<Transaction>,
        timestamp: Timestamp,
        prev_hash: Option<Hash>,
    ) -> Self {
        Block::Unmined(BlockBody {
            id,
            transactions,
            timestamp,
            prev_hash,
        })
    }

    pub fn genesis(first_transaction: Transaction, timestamp: Timestamp) -> Self {
        Block::new(0, vec![first_transaction], timestamp, None)
    }

    /// Seals an unmined block. A block that already carries a pow is returned untouched.
    pub fn seal(self, pow: Pow) -> Self {
        match self {
            Block::Unmined(body) => Block::Mined { body, pow },
            mined @ Block::Mined { .. } => mined,
        }
    }

    pub fn body(&self) -> &BlockBody {
        match self {
            Block::Unmined(body) | Block::Mined { body, .. } => body,
        }
    }

    pub fn into_body(self) -> BlockBody {
        match self {
            Block::Unmined(body) | Block::Mined { body, .. } => body,
        }
    }

    pub fn id(&self) -> u64 {
        self.body().id
    }

    pub fn transactions(&self) -> &[Transaction] {
        &self.body().transactions
    }

    pub fn timestamp(&self) -> Timestamp {
        self.body().timestamp
    }

    pub fn prev_hash(&self) -> Option<&Hash> {
        self.body().prev_hash.as_ref()
    }

    pub fn pow(&self) -> Option<&Pow> {
        match self {
            Block::Unmined(_) => None,
            Block::Mined { pow, .. } => Some(pow),
        }
    }

    pub fn is_mined(&self) -> bool {
        matches!(self, Block::Mined { .. })
    }

    /// `{id;[tx;tx;...];timestamp;prev_hash_hex}`, followed by `+pow_hex}` when
    /// `include_pow` is set. Hex is lower-case; an unmined block has an empty pow.
    pub fn canonical_string(&self, include_pow: bool) -> String {
        let body = self.body();
        let transactions = body
            .transactions
            .iter()
            .map(Transaction::encode)
            .collect::<Vec<_>>()
            .join(";");
        let prev_hash = body.prev_hash.map(hex::encode).unwrap_or_default();
        let mut out = format!(
            "{{{};[{}];{};{}}}",
            body.id, transactions, body.timestamp, prev_hash
        );
        if include_pow {
            let pow = self.pow().map(Pow::to_hex).unwrap_or_default();
            out.push_str(&format!("+{pow}}}"));
        }
        out
    }

    /// Bytes the miner extends with a candidate pow: the canonical form without pow plus `+`.
    pub fn mining_prefix(&self) -> Vec<u8> {
        let mut prefix = self.canonical_string(false).into_bytes();
        prefix.push(b'+');
        prefix
    }

    /// Hash a successor must carry as its `prev_hash`.
    pub fn chain_hash(&self) -> Hash {
        sha256(self.canonical_string(true).as_bytes())
    }

    /// Digest the difficulty predicate is tested against. `None` until mined.
    pub fn proof_hash(&self) -> Option<Hash> {
        let pow = self.pow()?;
        let mut input = self.mining_prefix();
        input.extend_from_slice(pow.as_bytes());
        Some(sha256(&input))
    }

    pub fn to_json(&self) -> Result<String, ChainError> {
        serde_json::to_string(self).map_err(|e| ChainError::MalformedBlock(e.to_string()))
    }

    pub fn from_json(data: &str) -> Result<Self, ChainError> {
        serde_json::from_str(data).map_err(|e| ChainError::MalformedBlock(e.to_string()))
    }
}

/// Structured interchange form of a block: hashes and pow as base64.
#[derive(Serialize, Deserialize)]
struct BlockRecord {
    id: u64,
    transactions: Vec<Transaction>,
    prev_hash: String,
    pow: String,
    timestamp: Timestamp,
}

impl From<Block> for BlockRecord {
    fn from(block: Block) -> Self {
        let pow = block.pow().map(|p| STANDARD.encode(p.as_bytes())).unwrap_or_default();
        let body = block.into_body();
        Self {
            id: body.id,
            transactions: body.transactions,
            prev_hash: body.prev_hash.map(|h| STANDARD.encode(h)).unwrap_or_default(),
            pow,
            timestamp: body.timestamp,
        }
    }
}

impl TryFrom<BlockRecord> for Block {
    type Error = ChainError;

    fn try_from(record: BlockRecord) -> Result<Self, Self::Error> {
        let prev_hash = STANDARD
            .decode(&record.prev_hash)
            .map_err(|e| ChainError::MalformedBlock(format!("prev_hash: {e}")))?;
        let prev_hash = match prev_hash.len() {
            0 => None,
            HASH_SIZE => {
                let mut out = [0u8; HASH_SIZE];
                out.copy_from_slice(&prev_hash);
                Some(out)
            }
            n => {
                return Err(ChainError::MalformedBlock(format!(
                    "prev_hash is {n} bytes, expected {HASH_SIZE}"
                )))
            }
        };
        let pow = STANDARD
            .decode(&record.pow)
            .map_err(|e| ChainError::MalformedBlock(format!("pow: {e}")))?;
        let block = Block::new(record.id, record.transactions, record.timestamp, prev_hash);
        Ok(if pow.is_empty() {
            block
        } else {
            block.seal(Pow::from_bytes(pow))
        })
    }
}
