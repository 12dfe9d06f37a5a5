use thiserror::Error;

/// Error taxonomy surfaced through the RPC layer and logged internally.
///
/// Transient adapter failures are absorbed by retry loops and never fail a
/// deal. Permanent failures at the edges (input validation, tokens) are
/// rejected outright; permanent failures mid-settlement trigger refund
/// planning or operator escalation, depending on the deal stage.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid or expired party token")]
    InvalidToken,

    #[error("deal not found: {0}")]
    NotFound(String),

    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    #[error("chain adapter unavailable: {0}")]
    AdapterTransient(String),

    #[error("chain adapter failure: {0}")]
    AdapterPermanent(String),

    #[error("reorg detected: {0}")]
    ReorgDetected(String),

    #[error("price oracle unavailable: {0}")]
    OracleUnavailable(String),

    #[error("fatal: {0}")]
    Fatal(String),

    #[error("storage error: {0}")]
    Store(#[from] sqlx::Error),

    /// Optimistic-concurrency retry signal. Never surfaced to clients; the
    /// caller re-reads the deal and re-applies its mutation.
    #[error("concurrent modification of deal {0}")]
    VersionConflict(String),
}

impl BrokerError {
    /// Errors that the engine retries with backoff instead of acting on.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BrokerError::AdapterTransient(_)
                | BrokerError::OracleUnavailable(_)
                | BrokerError::VersionConflict(_)
                | BrokerError::Store(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, BrokerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_are_retryable() {
        assert!(BrokerError::AdapterTransient("rpc timeout".into()).is_retryable());
        assert!(BrokerError::VersionConflict("d1".into()).is_retryable());
        assert!(!BrokerError::AdapterPermanent("bad signature".into()).is_retryable());
        assert!(!BrokerError::InvalidToken.is_retryable());
    }
}
