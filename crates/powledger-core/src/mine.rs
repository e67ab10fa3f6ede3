use crate::{finish, max_pow_value, pow::meets_difficulty, ChainError, Hash};
use rayon::prelude::*;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicBool, Ordering};

/// Candidates tried between two looks at the cancel flag on the sequential path.
const CANCEL_CHECK_INTERVAL: u64 = 4096;

/// Hasher state already fed with the block prefix and any zero padding of the pow field,
/// so each candidate only adds its significant bytes.
fn base_hasher(prefix: &[u8], width: usize) -> Sha256 {
    let mut hasher = Sha256::new();
    hasher.update(prefix);
    hasher.update(vec![0u8; width.saturating_sub(8)]);
    hasher
}

fn candidate_hash(base: &Sha256, value: u64, width: usize) -> Hash {
    let be = value.to_be_bytes();
    let mut hasher = base.clone();
    hasher.update(&be[be.len() - width.min(be.len())..]);
    finish(hasher)
}

/// Walks candidates upward from 1 on the calling thread, giving up with
/// `MiningCancelled` once `cancel` is set.
pub(crate) fn search_sequential(
    prefix: &[u8],
    difficulty: u32,
    width: usize,
    cancel: &AtomicBool,
) -> Result<u64, ChainError> {
    let base = base_hasher(prefix, width);
    for value in 1..=max_pow_value(width) {
        if (value - 1) % CANCEL_CHECK_INTERVAL == 0 && cancel.load(Ordering::Relaxed) {
            return Err(ChainError::MiningCancelled);
        }
        if meets_difficulty(&candidate_hash(&base, value, width), difficulty) {
            return Ok(value);
        }
    }
    Err(ChainError::EncodingOverflow { width })
}

/// Same contract as [`search_sequential`]; rayon splits the range across threads and
/// `find_map_first` still reports the lowest matching candidate.
pub(crate) fn search_parallel(
    prefix: &[u8],
    difficulty: u32,
    width: usize,
    cancel: &AtomicBool,
) -> Result<u64, ChainError> {
    let base = base_hasher(prefix, width);
    (1..=max_pow_value(width))
        .into_par_iter()
        .find_map_first(|value| {
            if cancel.load(Ordering::Relaxed) {
                Some(Err(ChainError::MiningCancelled))
            } else if meets_difficulty(&candidate_hash(&base, value, width), difficulty) {
                Some(Ok(value))
            } else {
                None
            }
        })
        .unwrap_or(Err(ChainError::EncodingOverflow { width }))
}
