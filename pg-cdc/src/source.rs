//! Capabilities the capture pipeline needs from the source database.
//!
//! [`Source`] covers both capture modes: polling a logical decoding cursor
//! with [`Source::poll_changes`], or holding a replication connection open
//! with [`Source::open_stream`]. The Postgres implementation lives in
//! [`crate::postgres`]; tests use the in-memory one from `test_utilities`.
use async_trait::async_trait;
use std::time::Duration;

use crate::cdc_types::{DecodingPlugin, LogPosition, SlotConfig};
use crate::change::ChangeRecord;
use crate::error::CdcResult;

#[async_trait]
pub trait Source: Send + Sync {
    async fn publication_exists(&self, publication: &str) -> CdcResult<bool>;

    /// Creates a publication over `tables`, or over every table when empty.
    async fn create_publication(&self, publication: &str, tables: &[String]) -> CdcResult<()>;

    async fn slot_exists(&self, slot_name: &str) -> CdcResult<bool>;

    async fn create_slot(&self, slot_name: &str, plugin: DecodingPlugin) -> CdcResult<()>;

    /// Returns every transaction retained by the slot that ended past `since`,
    /// whole and in commit order. The call either returns the complete result
    /// or fails; it never consumes the changes, see [`Source::confirm`].
    async fn poll_changes(
        &self,
        slot: &SlotConfig,
        since: Option<LogPosition>,
    ) -> CdcResult<Vec<ChangeRecord>>;

    /// Tells the source everything up to `position` was handled,
    /// so the log space can be reclaimed.
    async fn confirm(&self, slot: &SlotConfig, position: LogPosition) -> CdcResult<()>;

    /// Opens a streaming session on a dedicated connection.
    /// Fails with [`crate::error::CdcError::SlotInUse`] if another session holds the slot.
    async fn open_stream(
        &self,
        slot: &SlotConfig,
        start: Option<LogPosition>,
    ) -> CdcResult<Box<dyn ReplicationSession>>;
}

/// What a streaming session produced while the caller was waiting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Change(ChangeRecord),
    /// The timeout elapsed without a change.
    Idle,
}

/// A live streaming session. It has no natural end: any termination is
/// either [`ReplicationSession::close`] or an error.
#[async_trait]
pub trait ReplicationSession: Send {
    /// Waits at most `timeout` for the next change.
    async fn next(&mut self, timeout: Duration) -> CdcResult<SessionEvent>;

    /// Confirms every change up to `position` as durably handled.
    /// Must be called periodically even when nothing arrived.
    async fn acknowledge(&mut self, position: LogPosition) -> CdcResult<()>;

    async fn close(self: Box<Self>) -> CdcResult<()>;
}
