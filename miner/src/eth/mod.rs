use alloy_primitives::{keccak256, Address, B256, U256};
use async_trait::async_trait;
use shared::errors::ClientError;

pub mod submitter;

#[cfg(test)]
pub mod mock;

/// The miner's identity. The private key comes from the `PRIVATE_KEY`
/// environment variable and is read-only after startup.
#[derive(Debug, Clone)]
pub struct Account {
    pub address: Address,
    pub private_key: B256,
}

impl Account {
    pub fn from_env(public_address: &str) -> anyhow::Result<Self> {
        let address: Address = public_address
            .parse()
            .map_err(|e| anyhow::anyhow!("bad publicAddress {public_address:?}: {e}"))?;
        let raw = std::env::var("PRIVATE_KEY")
            .map_err(|_| anyhow::anyhow!("PRIVATE_KEY environment variable is not set"))?;
        let private_key: B256 = raw
            .trim()
            .trim_start_matches("0x")
            .parse()
            .map_err(|e| anyhow::anyhow!("bad PRIVATE_KEY: {e}"))?;
        Ok(Account { address, private_key })
    }

    /// Lowercase hex without the 0x prefix, the form the puzzle hashes.
    pub fn lower_hex(&self) -> String {
        format!("{:x}", self.address)
    }
}

/// Storage slot key for a staker's last-submit timestamp: the address
/// left-padded to 32 bytes, keccak hashed.
pub fn staker_slot_key(address: Address) -> B256 {
    let mut padded = [0u8; 32];
    padded[12..].copy_from_slice(address.as_slice());
    keccak256(padded)
}

#[derive(Debug, Clone)]
pub struct CurrentVariables {
    pub challenge: B256,
    pub request_ids: [u64; 5],
    pub difficulty: U256,
    pub query_string: String,
    pub granularity: u64,
    pub tip: U256,
}

/// Options for one signed call attempt. Built by the submitter, consumed by
/// the contract adapter; the adapter never sees retry state.
#[derive(Debug, Clone, Copy)]
pub struct TxOpts {
    pub from: Address,
    pub nonce: u64,
    pub value: U256,
    pub gas_limit: u64,
    pub gas_price: U256,
}

#[derive(Debug, Clone, Copy)]
pub struct Transaction {
    pub hash: B256,
    pub nonce: u64,
    pub gas_price: U256,
}

#[derive(Debug, Clone, Copy)]
pub struct BlockHeader {
    pub number: u64,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct TxInfo {
    pub hash: B256,
    pub nonce: u64,
    pub gas_price: U256,
}

#[derive(Debug, Clone, Copy)]
pub struct Receipt {
    pub tx_hash: B256,
    pub status: bool,
    pub gas_used: U256,
    pub effective_gas_price: U256,
}

#[derive(Debug, Clone)]
pub struct NonceSubmittedEvent {
    pub miner: Address,
    pub nonce: String,
    pub challenge: B256,
    pub request_ids: [u64; 5],
    pub values: [U256; 5],
    pub block_number: u64,
    pub tx_hash: B256,
}

#[derive(Debug, Clone)]
pub struct TransferredEvent {
    pub from: Address,
    pub to: Address,
    pub value: U256,
    pub block_number: u64,
    pub tx_hash: B256,
}

/// Node surface the pipeline needs. The concrete implementation lives in the
/// rpc module; tests use mocks.
#[async_trait]
pub trait EthClient: Send + Sync {
    async fn nonce_at(&self, address: Address) -> Result<u64, ClientError>;
    async fn pending_nonce_at(&self, address: Address) -> Result<u64, ClientError>;
    async fn balance_at(&self, address: Address) -> Result<U256, ClientError>;
    async fn suggest_gas_price(&self) -> Result<U256, ClientError>;
    async fn network_id(&self) -> Result<u64, ClientError>;
    /// `None` asks for the latest header.
    async fn header_by_number(&self, number: Option<u64>) -> Result<BlockHeader, ClientError>;
    async fn transaction_by_hash(&self, hash: B256) -> Result<Option<TxInfo>, ClientError>;
    async fn transaction_receipt(&self, hash: B256) -> Result<Option<Receipt>, ClientError>;
}

/// Oracle contract surface. ABI plumbing stays behind this trait.
#[async_trait]
pub trait Contract: Send + Sync {
    async fn get_current_variables(&self) -> Result<CurrentVariables, ClientError>;
    async fn did_mine(&self, challenge: B256, miner: Address) -> Result<bool, ClientError>;
    async fn get_staker_info(&self, miner: Address) -> Result<(U256, U256), ClientError>;
    async fn get_uint_var(&self, key: B256) -> Result<U256, ClientError>;
    async fn current_reward(&self) -> Result<U256, ClientError>;
    async fn balance_of(&self, address: Address) -> Result<U256, ClientError>;
    async fn get_dispute_info(&self, dispute_id: U256)
        -> Result<(u64, U256, bool), ClientError>;

    async fn submit_solution(
        &self,
        opts: &TxOpts,
        nonce: &str,
        request_ids: [u64; 5],
        values: [U256; 5],
    ) -> Result<Transaction, ClientError>;
    async fn add_tip(
        &self,
        opts: &TxOpts,
        request_id: u64,
        amount: U256,
    ) -> Result<Transaction, ClientError>;
    async fn transfer(&self, opts: &TxOpts, to: Address, amount: U256)
        -> Result<Transaction, ClientError>;
    async fn approve(&self, opts: &TxOpts, spender: Address, amount: U256)
        -> Result<Transaction, ClientError>;
    async fn deposit_stake(&self, opts: &TxOpts) -> Result<Transaction, ClientError>;
    async fn request_staking_withdraw(&self, opts: &TxOpts) -> Result<Transaction, ClientError>;
    async fn withdraw_stake(&self, opts: &TxOpts) -> Result<Transaction, ClientError>;
    async fn begin_dispute(
        &self,
        opts: &TxOpts,
        request_id: u64,
        timestamp: U256,
        miner_index: u64,
    ) -> Result<Transaction, ClientError>;
    async fn vote(&self, opts: &TxOpts, dispute_id: U256, supports: bool)
        -> Result<Transaction, ClientError>;

    async fn nonce_submitted_logs(
        &self,
        from_block: u64,
        to_block: u64,
        miners: Option<&[Address]>,
    ) -> Result<Vec<NonceSubmittedEvent>, ClientError>;
    async fn transferred_logs(
        &self,
        from_block: u64,
        to_block: u64,
        to: &[Address],
    ) -> Result<Vec<TransferredEvent>, ClientError>;
}

/// How the submitter must react to a failed call attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxErrorKind {
    /// A prior transaction with this nonce confirmed; bump and resend.
    NonceStale,
    /// A prior transaction with this nonce is stuck; raise the gas price.
    Underpriced,
    Other,
}

/// The node client exposes no typed error surface, so known message
/// fragments are mapped to a retry strategy here and nowhere else.
pub fn classify(err: &ClientError) -> TxErrorKind {
    if err.0.contains("nonce too low") {
        TxErrorKind::NonceStale
    } else if err.0.contains("replacement transaction underpriced") {
        TxErrorKind::Underpriced
    } else {
        TxErrorKind::Other
    }
}
