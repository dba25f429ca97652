use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("period {period} exceeds ledger limit {limit}")]
    PeriodOutOfRange { period: u64, limit: u64 },

    #[error("invalid checker population: {0}")]
    InvalidPopulation(i64),

    #[error("invalid signature")]
    InvalidSignature,

    #[error("unsupported signature scheme: {0}")]
    UnsupportedScheme(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("payload serialization failed: {0}")]
    Serialization(String),

    #[error("invalid metrics: {0}")]
    InvalidMetrics(String),
}
