//! Delivery of batches to an object store.
//!
//! [`Sink`] is the raw object store capability; [`BatchWriter`] turns a
//! [`Batch`] into one immutable, uniquely named object. Object names follow
//! `<prefix>/<entity>_<YYYYMMDD>_<HHMMSS>_<max lsn>.<ext>`, so a batch
//! redelivered after a crash lands next to the first copy instead of over it.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};

use crate::batch::Batch;
use crate::cdc_types::LogPosition;
use crate::change::ChangeRecord;
use crate::error::{CdcError, CdcResult};

/// Object store holding delivered batches, bound to a single bucket.
#[async_trait]
pub trait Sink: Send + Sync {
    async fn bucket_exists(&self) -> anyhow::Result<bool>;

    async fn create_bucket(&self) -> anyhow::Result<()>;

    /// Writes the whole object or nothing.
    async fn put(&self, object_name: &str, bytes: Vec<u8>, content_type: &str)
        -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BatchFormat {
    #[default]
    Csv,
    JsonLines,
}

impl BatchFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            BatchFormat::Csv => "csv",
            BatchFormat::JsonLines => "jsonl",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            BatchFormat::Csv => "text/csv",
            BatchFormat::JsonLines => "application/x-ndjson",
        }
    }

    pub fn encode(&self, records: &[ChangeRecord]) -> CdcResult<Vec<u8>> {
        match self {
            BatchFormat::Csv => Ok(csv::encode(records)),
            BatchFormat::JsonLines => {
                let mut data = Vec::new();
                for record in records {
                    serde_json::to_writer(&mut data, record)
                        .map_err(|e| CdcError::Decode(e.to_string()))?;
                    data.push(b'\n');
                }
                Ok(data)
            }
        }
    }

    pub fn decode(&self, bytes: &[u8]) -> CdcResult<Vec<ChangeRecord>> {
        match self {
            BatchFormat::Csv => csv::decode(bytes),
            BatchFormat::JsonLines => bytes
                .split(|b| *b == b'\n')
                .filter(|line| !line.is_empty())
                .map(|line| {
                    serde_json::from_slice(line).map_err(|e| CdcError::Decode(e.to_string()))
                })
                .collect(),
        }
    }

    /// Guesses the format from an object name.
    pub fn from_object_name(name: &str) -> Option<BatchFormat> {
        match name.rsplit_once('.')?.1 {
            "csv" => Some(BatchFormat::Csv),
            "jsonl" => Some(BatchFormat::JsonLines),
            _ => None,
        }
    }
}

impl fmt::Display for BatchFormat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BatchFormat::Csv => f.write_str("csv"),
            BatchFormat::JsonLines => f.write_str("jsonl"),
        }
    }
}

impl FromStr for BatchFormat {
    type Err = CdcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "csv" => Ok(BatchFormat::Csv),
            "jsonl" | "json-lines" => Ok(BatchFormat::JsonLines),
            other => Err(CdcError::Config(format!("unsupported batch format: {other}"))),
        }
    }
}

/// Writes batches as objects through a [`Sink`].
pub struct BatchWriter {
    sink: Arc<dyn Sink>,
    prefix: String,
    entity: String,
    format: BatchFormat,
}

impl BatchWriter {
    pub fn new(sink: Arc<dyn Sink>, prefix: &str, entity: &str, format: BatchFormat) -> BatchWriter {
        BatchWriter {
            sink,
            prefix: prefix.trim_end_matches('/').to_string(),
            entity: entity.to_string(),
            format,
        }
    }

    pub fn format(&self) -> BatchFormat {
        self.format
    }

    /// Creates the bucket unless it already exists.
    pub async fn ensure_bucket(&self) -> CdcResult<()> {
        let exists = self.sink.bucket_exists().await.map_err(|e| CdcError::SinkWrite {
            object: "<bucket>".to_string(),
            reason: format!("{e:#}"),
        })?;
        if !exists {
            self.sink.create_bucket().await.map_err(|e| CdcError::SinkWrite {
                object: "<bucket>".to_string(),
                reason: format!("{e:#}"),
            })?;
            info!("Created bucket for prefix {}", self.prefix);
        }
        Ok(())
    }

    pub fn object_name(&self, batch: &Batch) -> String {
        object_name(
            &self.prefix,
            &self.entity,
            batch.created_at,
            batch.max_position.unwrap_or_default(),
            self.format,
        )
    }

    /// Makes a single delivery attempt and returns the object name.
    pub async fn deliver(&self, batch: &Batch) -> CdcResult<String> {
        let name = self.object_name(batch);
        self.deliver_as(&name, batch).await?;
        Ok(name)
    }

    /// Writes `batch` under a name computed earlier, so that retries of the
    /// same batch overwrite the same object with the same content.
    pub async fn deliver_as(&self, object_name: &str, batch: &Batch) -> CdcResult<()> {
        let bytes = self.format.encode(&batch.records)?;
        debug!(
            "Writing {} records ({} bytes) to {}",
            batch.len(),
            bytes.len(),
            object_name
        );

        self.sink
            .put(object_name, bytes, self.format.content_type())
            .await
            .map_err(|e| CdcError::SinkWrite {
                object: object_name.to_string(),
                reason: format!("{e:#}"),
            })
    }
}

fn object_name(
    prefix: &str,
    entity: &str,
    captured_at: DateTime<Utc>,
    max_position: LogPosition,
    format: BatchFormat,
) -> String {
    let file = format!(
        "{}_{}_{:016X}.{}",
        entity,
        captured_at.format("%Y%m%d_%H%M%S"),
        max_position.as_u64(),
        format.extension()
    );
    if prefix.is_empty() {
        file
    } else {
        format!("{prefix}/{file}")
    }
}

/// RFC 4180 encoding with a fixed header. Binary payloads are hex encoded
/// and flagged in the `encoding` column.
mod csv {
    use chrono::{DateTime, Utc};

    use crate::cdc_types::LogPosition;
    use crate::change::{ChangePayload, ChangeRecord};
    use crate::error::{CdcError, CdcResult};

    pub(super) const HEADER: &str = "lsn,xid,captured_at,encoding,data";

    pub(super) fn encode(records: &[ChangeRecord]) -> Vec<u8> {
        let mut out = String::with_capacity(64 * (records.len() + 1));
        out.push_str(HEADER);
        out.push_str("\r\n");

        for record in records {
            let (encoding, data) = match &record.payload {
                ChangePayload::Text(text) => ("text", text.clone()),
                ChangePayload::Binary(bytes) => ("binary", hex::encode(bytes)),
            };
            let xid = record.xid.map(|x| x.to_string()).unwrap_or_default();
            let fields = [
                record.position.to_string(),
                xid,
                record.captured_at.to_rfc3339(),
                encoding.to_string(),
                data,
            ];
            for (i, field) in fields.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                push_field(&mut out, field);
            }
            out.push_str("\r\n");
        }

        out.into_bytes()
    }

    fn push_field(out: &mut String, field: &str) {
        if field.contains(|c| matches!(c, ',' | '"' | '\r' | '\n')) {
            out.push('"');
            out.push_str(&field.replace('"', "\"\""));
            out.push('"');
        } else {
            out.push_str(field);
        }
    }

    pub(super) fn decode(bytes: &[u8]) -> CdcResult<Vec<ChangeRecord>> {
        let text = std::str::from_utf8(bytes).map_err(|e| CdcError::Decode(e.to_string()))?;
        let mut rows = parse_rows(text)?.into_iter();

        match rows.next() {
            Some(header) if header.join(",") == HEADER => {}
            Some(header) => {
                return Err(CdcError::Decode(format!(
                    "unexpected csv header: {}",
                    header.join(",")
                )))
            }
            None => return Ok(vec![]),
        }

        rows.map(|row| parse_record(&row)).collect()
    }

    fn parse_record(row: &[String]) -> CdcResult<ChangeRecord> {
        let [lsn, xid, captured_at, encoding, data] = row else {
            return Err(CdcError::Decode(format!(
                "expected 5 csv fields, got {}",
                row.len()
            )));
        };

        let position: LogPosition = lsn.parse()?;
        let xid = match xid.as_str() {
            "" => None,
            xid => Some(
                xid.parse::<u32>()
                    .map_err(|e| CdcError::Decode(format!("invalid xid {xid:?}: {e}")))?,
            ),
        };
        let captured_at = DateTime::parse_from_rfc3339(captured_at)
            .map_err(|e| CdcError::Decode(format!("invalid timestamp {captured_at:?}: {e}")))?
            .with_timezone(&Utc);
        let payload = match encoding.as_str() {
            "text" => ChangePayload::Text(data.clone()),
            "binary" => ChangePayload::Binary(
                hex::decode(data).map_err(|e| CdcError::Decode(e.to_string()))?,
            ),
            other => return Err(CdcError::Decode(format!("unknown encoding {other:?}"))),
        };

        Ok(ChangeRecord {
            position,
            xid,
            payload,
            captured_at,
        })
    }

    fn parse_rows(text: &str) -> CdcResult<Vec<Vec<String>>> {
        let mut rows = vec![];
        let mut row = vec![];
        let mut field = String::new();
        let mut quoted = false;
        let mut chars = text.chars().peekable();

        while let Some(c) = chars.next() {
            if quoted {
                match c {
                    '"' if chars.peek() == Some(&'"') => {
                        chars.next();
                        field.push('"');
                    }
                    '"' => quoted = false,
                    c => field.push(c),
                }
                continue;
            }
            match c {
                '"' if field.is_empty() => quoted = true,
                ',' => row.push(std::mem::take(&mut field)),
                '\r' if chars.peek() == Some(&'\n') => {}
                '\n' => {
                    row.push(std::mem::take(&mut field));
                    rows.push(std::mem::take(&mut row));
                }
                c => field.push(c),
            }
        }

        if quoted {
            return Err(CdcError::Decode("unterminated quoted csv field".to_string()));
        }
        if !field.is_empty() || !row.is_empty() {
            row.push(field);
            rows.push(row);
        }

        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{BatchAssembler, FlushPolicy};
    use crate::change::ChangePayload;
    use crate::test_utilities::MemorySink;
    use chrono::TimeZone;

    fn records() -> Vec<ChangeRecord> {
        vec![
            ChangeRecord::new(
                LogPosition::new(10),
                Some(731),
                ChangePayload::Text("BEGIN 731".to_string()),
            ),
            ChangeRecord::new(
                LogPosition::new(12),
                Some(731),
                ChangePayload::Text(
                    "table db_loja.clientes: INSERT: id[integer]:1 nome[text]:'Ana, \"a\"\nSilva'"
                        .to_string(),
                ),
            ),
            ChangeRecord::new(LogPosition::new(14), None, ChangePayload::Binary(vec![0x43, 0, 7])),
            ChangeRecord::new(
                LogPosition::new(15),
                Some(731),
                ChangePayload::Text(String::new()),
            ),
        ]
    }

    #[test]
    fn test_csv_round_trip() {
        let records = records();
        let bytes = BatchFormat::Csv.encode(&records).unwrap();

        assert!(bytes.starts_with(b"lsn,xid,captured_at,encoding,data\r\n"));
        assert_eq!(BatchFormat::Csv.decode(&bytes).unwrap(), records);
    }

    #[test]
    fn test_json_lines_round_trip() {
        let records = records();
        let bytes = BatchFormat::JsonLines.encode(&records).unwrap();

        assert_eq!(bytes.iter().filter(|b| **b == b'\n').count(), records.len());
        assert_eq!(BatchFormat::JsonLines.decode(&bytes).unwrap(), records);
    }

    #[test]
    fn test_csv_rejects_foreign_header() {
        assert!(BatchFormat::Csv.decode(b"lsn,xid,data\r\n0/1,2,x\r\n").is_err());
        assert!(BatchFormat::Csv.decode(b"").unwrap().is_empty());
    }

    #[test]
    fn test_object_name_layout() {
        let captured_at = Utc.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap();
        let name = object_name(
            "cdc",
            "cdc_changes",
            captured_at,
            LogPosition::new(0x16_B374_D848),
            BatchFormat::Csv,
        );

        assert_eq!(name, "cdc/cdc_changes_20240309_070501_00000016B374D848.csv");
        assert_eq!(BatchFormat::from_object_name(&name), Some(BatchFormat::Csv));
    }

    #[tokio::test]
    async fn test_deliver_writes_one_object() {
        let sink = Arc::new(MemorySink::new());
        let writer = BatchWriter::new(sink.clone(), "cdc/", "cdc_changes", BatchFormat::JsonLines);
        let mut assembler = BatchAssembler::new(FlushPolicy::SourceExhausted);
        assembler.extend(records());
        let batch = assembler.drain();

        writer.ensure_bucket().await.unwrap();
        let name = writer.deliver(&batch).await.unwrap();

        assert!(name.starts_with("cdc/cdc_changes_"));
        assert!(name.ends_with("_000000000000000F.jsonl"));
        let objects = sink.objects();
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0].content_type, "application/x-ndjson");
        assert_eq!(
            BatchFormat::JsonLines.decode(&objects[0].bytes).unwrap(),
            batch.records
        );
    }

    #[tokio::test]
    async fn test_failed_put_is_a_sink_error() {
        let sink = Arc::new(MemorySink::new());
        sink.fail_next_puts(1);
        let writer = BatchWriter::new(sink.clone(), "cdc", "cdc_changes", BatchFormat::Csv);
        let mut assembler = BatchAssembler::new(FlushPolicy::SourceExhausted);
        assembler.extend(records());

        let err = writer.deliver(&assembler.drain()).await.unwrap_err();

        assert!(matches!(err, CdcError::SinkWrite { .. }));
        assert!(sink.objects().is_empty());
    }
}
