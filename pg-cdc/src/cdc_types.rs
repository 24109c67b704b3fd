//! A module containing types related to the replication slot and its log.
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::CdcError;

/// A position in the source's write-ahead log (an LSN).
///
/// Printed and parsed in the same `XXXXXXXX/XXXXXXXX` form Postgres uses,
/// so the value persisted by a watermark store can be pasted into SQL as is.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd, Default)]
pub struct LogPosition(u64);

impl LogPosition {
    pub const ZERO: LogPosition = LogPosition(0);

    pub fn new(value: u64) -> LogPosition {
        LogPosition(value)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl From<u64> for LogPosition {
    fn from(value: u64) -> Self {
        LogPosition(value)
    }
}

impl fmt::Display for LogPosition {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 & 0xFFFF_FFFF)
    }
}

impl FromStr for LogPosition {
    type Err = CdcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || CdcError::Decode(format!("invalid log position: {s:?}"));
        let (high, low) = s.trim().split_once('/').ok_or_else(invalid)?;
        let high = u32::from_str_radix(high, 16).map_err(|_| invalid())?;
        let low = u32::from_str_radix(low, 16).map_err(|_| invalid())?;

        Ok(LogPosition((u64::from(high) << 32) | u64::from(low)))
    }
}

impl Serialize for LogPosition {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for LogPosition {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Output plugin the replication slot is bound to.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
pub enum DecodingPlugin {
    /// Textual output, one row per change. Readable with the plain
    /// `pg_logical_slot_*_changes` functions.
    #[default]
    TestDecoding,
    /// Binary logical replication protocol, scoped by the publication.
    PgOutput,
}

impl DecodingPlugin {
    pub fn name(&self) -> &'static str {
        match self {
            DecodingPlugin::TestDecoding => "test_decoding",
            DecodingPlugin::PgOutput => "pgoutput",
        }
    }

    pub fn is_binary(&self) -> bool {
        matches!(self, DecodingPlugin::PgOutput)
    }
}

impl fmt::Display for DecodingPlugin {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DecodingPlugin {
    type Err = CdcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "test_decoding" => Ok(DecodingPlugin::TestDecoding),
            "pgoutput" => Ok(DecodingPlugin::PgOutput),
            other => Err(CdcError::Config(format!(
                "unsupported decoding plugin: {other}"
            ))),
        }
    }
}

/// The source-side objects a capture session reads from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotConfig {
    pub slot_name: String,
    pub publication_name: String,
    pub plugin: DecodingPlugin,
    /// Tables in `schema.table` form. Empty means every table.
    pub tables: Vec<String>,
}

impl SlotConfig {
    pub fn new(slot_name: impl Into<String>, publication_name: impl Into<String>) -> SlotConfig {
        SlotConfig {
            slot_name: slot_name.into(),
            publication_name: publication_name.into(),
            plugin: DecodingPlugin::default(),
            tables: vec![],
        }
    }

    pub fn with_plugin(mut self, plugin: DecodingPlugin) -> SlotConfig {
        self.plugin = plugin;
        self
    }

    pub fn with_tables(mut self, tables: Vec<String>) -> SlotConfig {
        self.tables = tables;
        self
    }
}
