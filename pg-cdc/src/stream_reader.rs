use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::time::{timeout_at, Instant};
use tokio_postgres::{Client, CopyBothDuplex};
use tracing::{debug, trace};

use crate::cdc_types::{DecodingPlugin, LogPosition};
use crate::change::{ChangePayload, ChangeRecord};
use crate::error::{CdcError, CdcResult};
use crate::protocol::{standby_status_update, ReplicationFrame, TransactionTracker};
use crate::source::{ReplicationSession, SessionEvent};

/// A `START_REPLICATION` session on a dedicated replication connection.
pub struct PgReplicationSession {
    // Keeps the replication connection open for as long as the stream lives.
    _client: Client,
    stream: Pin<Box<CopyBothDuplex<Bytes>>>,
    binary: bool,
    tracker: TransactionTracker,
    acknowledged: LogPosition,
}

impl PgReplicationSession {
    pub(crate) fn new(
        client: Client,
        stream: CopyBothDuplex<Bytes>,
        plugin: DecodingPlugin,
        start: LogPosition,
    ) -> PgReplicationSession {
        PgReplicationSession {
            _client: client,
            stream: Box::pin(stream),
            binary: plugin.is_binary(),
            tracker: TransactionTracker::default(),
            acknowledged: start,
        }
    }

    async fn send_status(&mut self, position: LogPosition) -> CdcResult<()> {
        trace!("Sending standby status update at {}", position);
        self.stream
            .send(standby_status_update(position, chrono::Utc::now()))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ReplicationSession for PgReplicationSession {
    async fn next(&mut self, timeout: Duration) -> CdcResult<SessionEvent> {
        let deadline = Instant::now() + timeout;
        loop {
            let frame = match timeout_at(deadline, self.stream.next()).await {
                Err(_) => return Ok(SessionEvent::Idle),
                Ok(None) => {
                    return Err(CdcError::StreamStalled(
                        "server ended the replication stream".to_string(),
                    ))
                }
                Ok(Some(frame)) => frame?,
            };

            match ReplicationFrame::parse(frame)? {
                ReplicationFrame::XLogData {
                    wal_start, data, ..
                } => {
                    let xid = self.tracker.observe(&data, self.binary);
                    let payload = ChangePayload::from_plugin_output(data.to_vec(), self.binary);
                    debug!("Received change at {} ({} bytes)", wal_start, payload.len());
                    return Ok(SessionEvent::Change(ChangeRecord::new(
                        wal_start, xid, payload,
                    )));
                }
                ReplicationFrame::PrimaryKeepalive {
                    wal_end,
                    reply_requested,
                    ..
                } => {
                    trace!("Keepalive, server at {}", wal_end);
                    if reply_requested {
                        self.send_status(self.acknowledged).await?;
                    }
                }
            }
        }
    }

    async fn acknowledge(&mut self, position: LogPosition) -> CdcResult<()> {
        let position = position.max(self.acknowledged);
        self.send_status(position).await?;
        self.acknowledged = position;
        Ok(())
    }

    async fn close(mut self: Box<Self>) -> CdcResult<()> {
        debug!("Closing replication stream at {}", self.acknowledged);
        self.stream.close().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cdc_types::SlotConfig;
    use crate::postgres::{PgConnectionConfig, PgSource};
    use crate::provisioning::SlotProvisioner;
    use crate::source::Source;
    use pg_cdc_test_utils::{
        create_test_table, drop_replication_objects, get_uri, populate_test_table, unique_name,
    };

    #[tokio::test]
    #[ignore]
    async fn test_stream_receives_inserted_rows() {
        let source = PgSource::connect(PgConnectionConfig::from_uri(&get_uri()).unwrap())
            .await
            .unwrap();
        let table = create_test_table(source.client()).await.unwrap();
        let name = unique_name();
        let slot = SlotConfig::new(format!("{name}_slot"), format!("{name}_pub"))
            .with_tables(vec![format!("public.{table}")]);
        SlotProvisioner::ensure(&source, &slot).await.unwrap();
        populate_test_table(source.client(), &table, 2).await.unwrap();

        let mut session = source.open_stream(&slot, None).await.unwrap();
        let mut changes = vec![];
        while changes.len() < 6 {
            match session.next(Duration::from_secs(5)).await.unwrap() {
                SessionEvent::Change(record) => changes.push(record),
                SessionEvent::Idle => break,
            }
        }

        // Two transactions: BEGIN, INSERT, COMMIT each.
        assert_eq!(changes.len(), 6);
        assert!(changes.iter().all(|c| c.xid.is_some()));
        assert!(changes.windows(2).all(|w| w[0].position <= w[1].position));

        let last = changes.last().unwrap().position;
        session.acknowledge(last).await.unwrap();
        session.close().await.unwrap();
        drop_replication_objects(source.client(), &slot.slot_name, &slot.publication_name)
            .await
            .unwrap();
    }
}
