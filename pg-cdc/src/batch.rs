//! Grouping of consumed changes into delivery batches.
use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::cdc_types::LogPosition;
use crate::change::ChangeRecord;

/// An ordered group of changes flushed to the sink as one object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub records: Vec<ChangeRecord>,
    /// Becomes the new watermark once the batch is delivered.
    pub max_position: Option<LogPosition>,
    pub created_at: DateTime<Utc>,
}

impl Batch {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }
}

/// Decides when the assembled batch is ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushPolicy {
    /// Flush once the source reported it has nothing more (poll mode).
    SourceExhausted,
    /// Flush when either limit is reached (stream mode).
    Threshold {
        max_records: usize,
        max_age: Duration,
    },
}

pub struct BatchAssembler {
    policy: FlushPolicy,
    records: Vec<ChangeRecord>,
    max_position: Option<LogPosition>,
    created_at: DateTime<Utc>,
    exhausted: bool,
}

impl BatchAssembler {
    pub fn new(policy: FlushPolicy) -> BatchAssembler {
        BatchAssembler {
            policy,
            records: vec![],
            max_position: None,
            created_at: Utc::now(),
            exhausted: false,
        }
    }

    /// The first record of an empty batch starts its age.
    pub fn append(&mut self, record: ChangeRecord) {
        if self.records.is_empty() {
            self.created_at = Utc::now();
        }
        self.max_position = self.max_position.max(Some(record.position));
        self.records.push(record);
    }

    pub fn extend(&mut self, records: impl IntoIterator<Item = ChangeRecord>) {
        for record in records {
            self.append(record);
        }
    }

    /// Marks the current poll as complete.
    pub fn mark_exhausted(&mut self) {
        self.exhausted = true;
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn should_flush(&self, now: DateTime<Utc>) -> bool {
        match self.policy {
            FlushPolicy::SourceExhausted => self.exhausted,
            FlushPolicy::Threshold {
                max_records,
                max_age,
            } => {
                let age = (now - self.created_at).to_std().unwrap_or_default();
                self.records.len() >= max_records || age >= max_age
            }
        }
    }

    /// Hands out the current batch and starts a new, empty one.
    pub fn drain(&mut self) -> Batch {
        let batch = Batch {
            records: std::mem::take(&mut self.records),
            max_position: self.max_position.take(),
            created_at: self.created_at,
        };
        self.created_at = Utc::now();
        self.exhausted = false;
        batch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::ChangePayload;

    fn record(position: u64) -> ChangeRecord {
        ChangeRecord::new(
            LogPosition::new(position),
            Some(7),
            ChangePayload::Text(format!("change at {position}")),
        )
    }

    #[test]
    fn test_drain_tracks_max_position() {
        let mut assembler = BatchAssembler::new(FlushPolicy::SourceExhausted);
        assembler.extend([10, 12, 15].map(record));

        let batch = assembler.drain();

        assert_eq!(batch.len(), 3);
        assert_eq!(batch.max_position, Some(LogPosition::new(15)));
        assert_eq!(
            batch
                .records
                .iter()
                .map(|r| r.position.as_u64())
                .collect::<Vec<_>>(),
            vec![10, 12, 15]
        );
        assert!(assembler.is_empty());
    }

    #[test]
    fn test_empty_drain() {
        let mut assembler = BatchAssembler::new(FlushPolicy::SourceExhausted);
        assembler.mark_exhausted();

        let batch = assembler.drain();

        assert!(batch.is_empty());
        assert_eq!(batch.max_position, None);
    }

    #[test]
    fn test_poll_policy_waits_for_exhaustion() {
        let mut assembler = BatchAssembler::new(FlushPolicy::SourceExhausted);
        assembler.append(record(1));
        assert!(!assembler.should_flush(Utc::now()));

        assembler.mark_exhausted();
        assert!(assembler.should_flush(Utc::now()));

        assembler.drain();
        assert!(!assembler.should_flush(Utc::now()));
    }

    #[test]
    fn test_threshold_policy() {
        let mut assembler = BatchAssembler::new(FlushPolicy::Threshold {
            max_records: 2,
            max_age: Duration::from_secs(10),
        });
        let start = Utc::now();

        assembler.append(record(1));
        assert!(!assembler.should_flush(start));
        assembler.append(record(2));
        assert!(assembler.should_flush(start));

        assembler.drain();
        assembler.append(record(3));
        assert!(!assembler.should_flush(Utc::now()));
        assert!(assembler.should_flush(Utc::now() + chrono::Duration::seconds(11)));
    }

    #[test]
    fn test_age_starts_at_first_record() {
        let mut assembler = BatchAssembler::new(FlushPolicy::Threshold {
            max_records: 100,
            max_age: Duration::from_millis(20),
        });
        std::thread::sleep(Duration::from_millis(40));

        let before = Utc::now();
        assembler.append(record(1));
        assert!(!assembler.should_flush(before));

        let batch = assembler.drain();
        assert!(batch.created_at >= before);
    }
}
