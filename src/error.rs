use rust_decimal::Decimal;
use thiserror::Error;

/// Failures of wager placement and settlement. These are expected outcomes
/// returned to the caller, not faults.
#[derive(Debug, Error)]
pub enum SettlementError {
    #[error("wager {0} is already settled")]
    AlreadySettled(i64),

    #[error("wager {0} not found")]
    WagerNotFound(i64),

    #[error("user {0} not found")]
    UserNotFound(i64),

    #[error("proposition {0} not found")]
    PropositionNotFound(i64),

    #[error("proposition {0} is no longer active")]
    PropositionInactive(i64),

    #[error("amount must be positive, got ${0}")]
    InvalidAmount(Decimal),

    #[error("odds must be greater than 1.0, got {0}")]
    InvalidOdds(Decimal),

    #[error("{0} is out of range")]
    OutOfRange(&'static str),

    #[error("insufficient bankroll: ${requested} exceeds available ${available}")]
    InsufficientBankroll { requested: Decimal, available: Decimal },

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Failures of a single proposition upsert.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A second active row for one identity key. Fatal for this record only.
    #[error("duplicate active proposition for identity {0}")]
    DuplicateActive(String),

    #[error("storage error: {0}")]
    Sql(#[from] rusqlite::Error),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Errors on a feed connection. All of them feed the reconnect/backoff logic.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(std::time::Duration),

    #[error("no frame for {0:?}, heartbeat missed")]
    HeartbeatMissed(std::time::Duration),

    #[error("server closed the stream")]
    Closed,

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("bad feed url: {0}")]
    Url(#[from] url::ParseError),
}
