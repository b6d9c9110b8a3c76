use alloy_primitives::{hex, keccak256, U256};
use ripemd::Ripemd160;
use sha2::{Digest, Sha256};
use shared::types::Work;

pub mod group;
pub mod hasher;
pub mod solution;

/// The puzzle hash chain, read as a big-endian unsigned integer.
pub fn puzzle_hash(input: &[u8]) -> U256 {
    let keccak = keccak256(input);
    let ripe = Ripemd160::digest(keccak);
    let sha = Sha256::digest(ripe);
    U256::from_be_slice(&sha)
}

/// The fixed part of the hashed message: challenge bytes followed by the
/// miner's address bytes. The decimal nonce string is appended per attempt.
pub fn puzzle_prefix(work: &Work) -> Result<Vec<u8>, hasher::HasherError> {
    let addr = hex::decode(&work.public_addr)
        .map_err(|_| hasher::HasherError::BadAddress(work.public_addr.clone()))?;
    let mut prefix = Vec::with_capacity(32 + addr.len() + 20);
    prefix.extend_from_slice(work.challenge.hash.as_slice());
    prefix.extend_from_slice(&addr);
    Ok(prefix)
}

pub fn meets_difficulty(hash: U256, difficulty: U256) -> bool {
    !difficulty.is_zero() && (hash % difficulty).is_zero()
}

/// Recomputes the predicate for a claimed solution.
pub fn verify_nonce(work: &Work, nonce: &str) -> bool {
    let Ok(mut input) = puzzle_prefix(work) else { return false };
    input.extend_from_slice(nonce.as_bytes());
    meets_difficulty(puzzle_hash(&input), work.challenge.difficulty)
}

#[cfg(test)]
pub(crate) fn test_work(challenge_seed: u64, difficulty: u64) -> Work {
    use alloy_primitives::B256;
    use shared::types::Challenge;

    let mut hash = [0u8; 32];
    hash[24..].copy_from_slice(&challenge_seed.to_be_bytes());
    Work {
        challenge: Challenge {
            hash: B256::from(hash),
            difficulty: U256::from(difficulty),
            request_ids: [1, 2, 3, 4, 5],
            tip: U256::ZERO,
        },
        start: 0,
        n: u64::MAX / 2,
        public_addr: "724d1b69a7ba352f11d73fdbdeb7ff869cb22e19".to_string(),
    }
}
