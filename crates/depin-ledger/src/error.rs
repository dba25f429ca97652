use thiserror::Error;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("DAS error: {0}")]
    Das(String),

    #[error("account not found: {0}")]
    AccountNotFound(String),

    #[error("invalid account type: expected {expected}, found {found}")]
    WrongAccountType { expected: u8, found: u8 },

    #[error("failed to decode {account}: {reason}")]
    Decode {
        account: &'static str,
        reason: String,
    },

    #[error("account already initialized")]
    AlreadyInitialized,

    #[error("transaction rejected: {reason}")]
    TransactionFailed { reason: String, logs: Vec<String> },

    #[error("invalid pubkey: {0}")]
    InvalidPubkey(String),

    #[error("keypair error: {0}")]
    Keypair(String),
}

impl LedgerError {
    /// Worth retrying: the request may succeed unchanged.
    pub fn is_transient(&self) -> bool {
        matches!(self, LedgerError::Rpc(_) | LedgerError::Das(_))
    }
}
