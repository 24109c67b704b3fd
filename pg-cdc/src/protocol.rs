//! Frames exchanged inside a logical replication COPY BOTH stream.
use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, TimeZone, Utc};

use crate::cdc_types::LogPosition;
use crate::error::{CdcError, CdcResult};

const XLOG_DATA_TAG: u8 = b'w';
const KEEPALIVE_TAG: u8 = b'k';
const STATUS_UPDATE_TAG: u8 = b'r';

const XLOG_DATA_HEADER_LEN: usize = 8 + 8 + 8;
const KEEPALIVE_LEN: usize = 8 + 8 + 1;

/// Messages the server sends on a replication connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationFrame {
    XLogData {
        wal_start: LogPosition,
        wal_end: LogPosition,
        sent_at: i64,
        data: Bytes,
    },
    PrimaryKeepalive {
        wal_end: LogPosition,
        sent_at: i64,
        reply_requested: bool,
    },
}

impl ReplicationFrame {
    pub fn parse(mut buf: Bytes) -> CdcResult<ReplicationFrame> {
        if !buf.has_remaining() {
            return Err(CdcError::Decode("empty replication frame".to_string()));
        }
        match buf.get_u8() {
            XLOG_DATA_TAG => {
                check_len(&buf, XLOG_DATA_HEADER_LEN, "XLogData")?;
                let wal_start = LogPosition::new(buf.get_u64());
                let wal_end = LogPosition::new(buf.get_u64());
                let sent_at = buf.get_i64();
                Ok(ReplicationFrame::XLogData {
                    wal_start,
                    wal_end,
                    sent_at,
                    data: buf,
                })
            }
            KEEPALIVE_TAG => {
                check_len(&buf, KEEPALIVE_LEN, "primary keepalive")?;
                Ok(ReplicationFrame::PrimaryKeepalive {
                    wal_end: LogPosition::new(buf.get_u64()),
                    sent_at: buf.get_i64(),
                    reply_requested: buf.get_u8() == 1,
                })
            }
            tag => Err(CdcError::Decode(format!(
                "unknown replication frame tag {:?}",
                tag as char
            ))),
        }
    }
}

fn check_len(buf: &Bytes, expected: usize, frame: &str) -> CdcResult<()> {
    if buf.remaining() < expected {
        return Err(CdcError::Decode(format!(
            "truncated {} frame: {} bytes, expected at least {}",
            frame,
            buf.remaining(),
            expected
        )));
    }
    Ok(())
}

/// Replication timestamps count microseconds from 2000-01-01 UTC.
pub fn postgres_epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0)
        .single()
        .unwrap_or_default()
}

pub fn to_postgres_micros(at: DateTime<Utc>) -> i64 {
    (at - postgres_epoch()).num_microseconds().unwrap_or(i64::MAX)
}

/// Standby status update reporting `position` as written, flushed and applied.
pub fn standby_status_update(position: LogPosition, at: DateTime<Utc>) -> Bytes {
    let mut buf = BytesMut::with_capacity(1 + 8 * 4 + 1);
    buf.put_u8(STATUS_UPDATE_TAG);
    buf.put_u64(position.as_u64());
    buf.put_u64(position.as_u64());
    buf.put_u64(position.as_u64());
    buf.put_i64(to_postgres_micros(at));
    buf.put_u8(0);
    buf.freeze()
}

/// Remembers the transaction the next changes belong to.
///
/// `test_decoding` announces transactions with `BEGIN <xid>` text lines,
/// `pgoutput` with binary `B` messages carrying the xid after the final LSN
/// and commit timestamp.
#[derive(Debug, Default)]
pub struct TransactionTracker {
    current: Option<u32>,
}

impl TransactionTracker {
    /// Updates the state with one decoded payload and returns the xid the
    /// payload belongs to.
    pub fn observe(&mut self, data: &[u8], binary: bool) -> Option<u32> {
        if binary {
            self.observe_pgoutput(data)
        } else {
            self.observe_text(data)
        }
    }

    fn observe_text(&mut self, data: &[u8]) -> Option<u32> {
        let line = std::str::from_utf8(data).unwrap_or_default();
        if let Some(rest) = line.strip_prefix("BEGIN ") {
            self.current = rest.trim().parse().ok();
            return self.current;
        }
        if line.starts_with("COMMIT") {
            return self.current.take().or_else(|| {
                line.strip_prefix("COMMIT ")
                    .and_then(|rest| rest.split_whitespace().next())
                    .and_then(|xid| xid.parse().ok())
            });
        }
        self.current
    }

    fn observe_pgoutput(&mut self, data: &[u8]) -> Option<u32> {
        match data.first() {
            Some(b'B') if data.len() >= 21 => {
                let mut xid = &data[17..21];
                self.current = Some(xid.get_u32());
                self.current
            }
            Some(b'C') => self.current.take(),
            _ => self.current,
        }
    }
}
