//! Errors raised while capturing and delivering changes.
use thiserror::Error;
use tokio_postgres::error::SqlState;

pub type CdcResult<T> = std::result::Result<T, CdcError>;

#[derive(Debug, Error)]
pub enum CdcError {
    /// Creating the publication or the slot failed for a reason other than
    /// the object already existing.
    #[error("failed to provision {object}: {reason}")]
    Provisioning { object: String, reason: String },

    #[error("source connection failed: {0}")]
    SourceConnection(#[source] tokio_postgres::Error),

    /// Another consumer already holds the replication slot.
    #[error("replication slot {0} is already in use by another process")]
    SlotInUse(String),

    /// The source ended the stream or stopped answering.
    #[error("replication stream stalled: {0}")]
    StreamStalled(String),

    #[error("failed to write object {object}: {reason}")]
    SinkWrite { object: String, reason: String },

    /// The batch was delivered but the watermark could not be persisted.
    #[error("failed to persist watermark {position}: {reason}")]
    WatermarkPersist { position: String, reason: String },

    #[error("failed to load watermark: {0}")]
    InvalidWatermark(String),

    #[error("failed to decode change data: {0}")]
    Decode(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl CdcError {
    /// Whether the failing step may be attempted again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CdcError::SourceConnection(_) | CdcError::StreamStalled(_) | CdcError::SinkWrite { .. }
        )
    }

    /// Whether a stream session must be reopened from the committed watermark.
    pub fn requires_reconnect(&self) -> bool {
        matches!(
            self,
            CdcError::SourceConnection(_) | CdcError::StreamStalled(_)
        )
    }
}

impl From<tokio_postgres::Error> for CdcError {
    fn from(err: tokio_postgres::Error) -> Self {
        CdcError::SourceConnection(err)
    }
}

pub(crate) fn is_duplicate_object(err: &tokio_postgres::Error) -> bool {
    err.code() == Some(&SqlState::DUPLICATE_OBJECT)
}

pub(crate) fn is_object_in_use(err: &tokio_postgres::Error) -> bool {
    err.code() == Some(&SqlState::OBJECT_IN_USE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(CdcError::StreamStalled("closed".to_string()).is_retryable());
        assert!(CdcError::SinkWrite {
            object: "cdc/a.csv".to_string(),
            reason: "503".to_string()
        }
        .is_retryable());
        assert!(!CdcError::SinkWrite {
            object: "cdc/a.csv".to_string(),
            reason: "503".to_string()
        }
        .requires_reconnect());
        assert!(!CdcError::SlotInUse("slot".to_string()).is_retryable());
        assert!(!CdcError::WatermarkPersist {
            position: "0/15".to_string(),
            reason: "disk full".to_string()
        }
        .is_retryable());
        assert!(!CdcError::Provisioning {
            object: "slot".to_string(),
            reason: "permission denied".to_string()
        }
        .is_retryable());
    }
}
