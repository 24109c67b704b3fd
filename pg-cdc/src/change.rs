//! A module representing a single captured change.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::cdc_types::LogPosition;

/// Content of a change as produced by the decoding plugin.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "encoding", content = "data", rename_all = "lowercase")]
pub enum ChangePayload {
    Text(String),
    Binary(#[serde(with = "hex_bytes")] Vec<u8>),
}

impl ChangePayload {
    /// Interprets raw plugin output, keeping it textual when possible.
    pub fn from_plugin_output(data: Vec<u8>, binary: bool) -> ChangePayload {
        if binary {
            return ChangePayload::Binary(data);
        }
        match String::from_utf8(data) {
            Ok(text) => ChangePayload::Text(text),
            Err(err) => ChangePayload::Binary(err.into_bytes()),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ChangePayload::Text(text) => text.len(),
            ChangePayload::Binary(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One mutation read from the replication slot.
///
/// Logical decoding emits whole transactions in commit order. Positions grow
/// inside a transaction, but a transaction that began earlier than the previous
/// one committed starts below it.
/// `captured_at` is the local observation time and is never used for ordering.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    #[serde(rename = "lsn")]
    pub position: LogPosition,
    pub xid: Option<u32>,
    pub payload: ChangePayload,
    pub captured_at: DateTime<Utc>,
}

impl ChangeRecord {
    pub fn new(position: LogPosition, xid: Option<u32>, payload: ChangePayload) -> ChangeRecord {
        ChangeRecord {
            position,
            xid,
            payload,
            captured_at: Utc::now(),
        }
    }
}

impl fmt::Display for ChangeRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let xid = self
            .xid
            .map(|xid| xid.to_string())
            .unwrap_or_else(|| "-".to_string());
        match &self.payload {
            ChangePayload::Text(text) => {
                write!(f, "lsn: {}, xid: {}, data: {}", self.position, xid, text)
            }
            ChangePayload::Binary(bytes) => write!(
                f,
                "lsn: {}, xid: {}, data: \\x{}",
                self.position,
                xid,
                hex::encode(bytes)
            ),
        }
    }
}

/// Drops every transaction that ended at or before `since`.
///
/// A transaction is a run of consecutive records with the same `xid` and
/// ends at its last record, usually the commit. Records without an `xid`
/// stand alone. Rows of a transaction that committed past `since` are kept
/// even when their own position is lower.
pub fn transactions_ending_after(
    records: Vec<ChangeRecord>,
    since: Option<LogPosition>,
) -> Vec<ChangeRecord> {
    let Some(since) = since else {
        return records;
    };

    let mut kept = Vec::with_capacity(records.len());
    let mut transaction: Vec<ChangeRecord> = vec![];
    for record in records {
        let same = matches!(
            (transaction.last(), record.xid),
            (Some(last), Some(xid)) if last.xid == Some(xid)
        );
        if !same {
            keep_if_ended_after(&mut kept, std::mem::take(&mut transaction), since);
        }
        transaction.push(record);
    }
    keep_if_ended_after(&mut kept, transaction, since);
    kept
}

fn keep_if_ended_after(
    kept: &mut Vec<ChangeRecord>,
    transaction: Vec<ChangeRecord>,
    since: LogPosition,
) {
    let end = transaction.iter().map(|r| r.position).max();
    if end.is_some_and(|end| end > since) {
        kept.extend(transaction);
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}
