use alloy_primitives::{B256, U256};
use serde::{Deserialize, Serialize};

/// One round of the on-chain mining game. Immutable once published by the
/// contract; superseded when the contract advances.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    pub hash: B256,
    pub difficulty: U256,
    pub request_ids: [u64; 5],
    pub tip: U256,
}

/// A challenge plus the nonce range one dispatch covers.
#[derive(Debug, Clone)]
pub struct Work {
    pub challenge: Challenge,
    pub start: u64,
    pub n: u64,
    /// Miner address as lowercase hex without the 0x prefix. The puzzle
    /// hashes text, so the exact representation matters.
    pub public_addr: String,
}

/// A winning nonce for the work that produced it.
#[derive(Debug, Clone)]
pub struct MineResult {
    pub work: Work,
    pub nonce: String,
}

/// One priced observation of a symbol from one source.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Unix milliseconds.
    pub ts: i64,
    pub value: f64,
}

/// What went on-chain for one solved challenge.
#[derive(Debug, Clone)]
pub struct Submission {
    pub nonce: String,
    pub challenge: B256,
    pub values: [U256; 5],
    pub tx_hash: B256,
    /// Position among the round's first five correct submitters, when known.
    pub slot: Option<u8>,
}
