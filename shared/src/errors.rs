use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store i/o: {0}")]
    Sled(#[from] sled::Error),
    #[error("corrupt value under key {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

/// Raw failure from the node or contract adapter. Classification into a
/// retry strategy happens in one place, see `classify` in the eth module.
#[derive(Error, Debug, Clone)]
#[error("{0}")]
pub struct ClientError(pub String);

impl ClientError {
    pub fn new(msg: impl Into<String>) -> Self {
        ClientError(msg.into())
    }
}

#[derive(Error, Debug)]
pub enum SubmitError {
    #[error("getting nonce for miner address: {0}")]
    Nonce(ClientError),
    #[error("insufficient funds to send transaction: {balance} < {cost}")]
    InsufficientFunds { balance: String, cost: String },
    #[error("submit context canceled")]
    Canceled,
    #[error("submit txn after {attempts} attempts ctx:{ctx_name}: {last}")]
    Exhausted {
        attempts: usize,
        ctx_name: &'static str,
        last: ClientError,
    },
}

/// Why a mined solution was not handed to the submitter.
#[derive(Error, Debug)]
pub enum SubmitAbort {
    #[error("cannot submit value, within fifteen minutes ({since_last}s since last)")]
    TooSoon { since_last: u64 },
    #[error("no value available for request id {0}")]
    NoValue(u64),
    #[error("challenge is no longer current")]
    ChallengeSuperseded,
    #[error("already mined the current challenge")]
    AlreadyMined,
    #[error("no confident samples around the submission time")]
    NoConfidentSamples,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Tx(#[from] SubmitError),
    #[error(transparent)]
    Client(#[from] ClientError),
}
