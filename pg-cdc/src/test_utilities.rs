//! In-memory fakes of the capture capabilities, with failure injection.
use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::bail;
use async_trait::async_trait;

use crate::cdc_types::{DecodingPlugin, LogPosition, SlotConfig};
use crate::change::{transactions_ending_after, ChangeRecord};
use crate::checkpoints::WatermarkStore;
use crate::error::{CdcError, CdcResult};
use crate::sink::Sink;
use crate::source::{ReplicationSession, SessionEvent, Source};

static UNIQUE_COUNTER: AtomicUsize = AtomicUsize::new(0);

pub fn unique_name() -> String {
    let cnt = UNIQUE_COUNTER.fetch_add(1, Ordering::SeqCst);
    format!(
        "test_rust_{}_{}_{}",
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs(),
        std::process::id(),
        cnt
    )
}

/// Creates an empty directory under the system temp dir.
pub fn unique_temp_dir() -> PathBuf {
    let dir = std::env::temp_dir().join(unique_name());
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

/// One scripted step of a fake replication stream.
#[derive(Debug, Clone)]
pub enum StreamStep {
    Change(ChangeRecord),
    /// The whole wait passes without changes.
    Idle,
    /// The server ends the session.
    Stall,
}

/// Calls made on fake replication sessions, in order, across reconnects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCall {
    Open(Option<LogPosition>),
    Next,
    Acknowledge(LogPosition),
    Close,
}

pub type ProvisionedState = (BTreeMap<String, Vec<String>>, BTreeMap<String, DecodingPlugin>);

#[derive(Default)]
struct SourceState {
    publications: BTreeMap<String, Vec<String>>,
    slots: BTreeMap<String, DecodingPlugin>,
    create_calls: usize,
    slot_creation_failure: Option<String>,
    retained: Vec<ChangeRecord>,
    confirmed: Option<LogPosition>,
    polls: Vec<Option<LogPosition>>,
    script: VecDeque<StreamStep>,
    slot_in_use: bool,
    session_calls: Vec<SessionCall>,
}

/// A source keeping publications, slots and the retained log in memory.
#[derive(Clone, Default)]
pub struct MemorySource {
    state: Arc<Mutex<SourceState>>,
}

impl MemorySource {
    pub fn new() -> MemorySource {
        MemorySource::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, SourceState> {
        self.state.lock().unwrap()
    }

    /// Appends changes to the log retained by the slot.
    pub fn push_changes(&self, records: impl IntoIterator<Item = ChangeRecord>) {
        self.state().retained.extend(records);
    }

    /// Queues steps served by stream sessions, shared across reconnects.
    pub fn script_stream(&self, steps: impl IntoIterator<Item = StreamStep>) {
        self.state().script.extend(steps);
    }

    pub fn fail_slot_creation(&self, reason: &str) {
        self.state().slot_creation_failure = Some(reason.to_string());
    }

    /// Makes every stream open fail as if another consumer held the slot.
    pub fn occupy_slot(&self) {
        self.state().slot_in_use = true;
    }

    pub fn publication_tables(&self, publication: &str) -> Option<Vec<String>> {
        self.state().publications.get(publication).cloned()
    }

    pub fn slot_plugin(&self, slot_name: &str) -> Option<DecodingPlugin> {
        self.state().slots.get(slot_name).copied()
    }

    pub fn provisioned_state(&self) -> ProvisionedState {
        let state = self.state();
        (state.publications.clone(), state.slots.clone())
    }

    pub fn create_calls(&self) -> usize {
        self.state().create_calls
    }

    pub fn confirmed(&self) -> Option<LogPosition> {
        self.state().confirmed
    }

    pub fn retained_positions(&self) -> Vec<LogPosition> {
        self.state().retained.iter().map(|r| r.position).collect()
    }

    /// The `since` argument of every poll so far.
    pub fn polls(&self) -> Vec<Option<LogPosition>> {
        self.state().polls.clone()
    }

    pub fn session_calls(&self) -> Vec<SessionCall> {
        self.state().session_calls.clone()
    }

    fn require_slot(&self, slot_name: &str) -> CdcResult<()> {
        if self.state().slots.contains_key(slot_name) {
            Ok(())
        } else {
            Err(CdcError::Config(format!(
                "replication slot {slot_name} does not exist"
            )))
        }
    }
}

#[async_trait]
impl Source for MemorySource {
    async fn publication_exists(&self, publication: &str) -> CdcResult<bool> {
        Ok(self.state().publications.contains_key(publication))
    }

    async fn create_publication(&self, publication: &str, tables: &[String]) -> CdcResult<()> {
        let mut state = self.state();
        state.create_calls += 1;
        state
            .publications
            .insert(publication.to_string(), tables.to_vec());
        Ok(())
    }

    async fn slot_exists(&self, slot_name: &str) -> CdcResult<bool> {
        Ok(self.state().slots.contains_key(slot_name))
    }

    async fn create_slot(&self, slot_name: &str, plugin: DecodingPlugin) -> CdcResult<()> {
        let mut state = self.state();
        state.create_calls += 1;
        if let Some(reason) = &state.slot_creation_failure {
            return Err(CdcError::Provisioning {
                object: format!("replication slot {slot_name}"),
                reason: reason.clone(),
            });
        }
        state.slots.insert(slot_name.to_string(), plugin);
        Ok(())
    }

    async fn poll_changes(
        &self,
        slot: &SlotConfig,
        since: Option<LogPosition>,
    ) -> CdcResult<Vec<ChangeRecord>> {
        self.require_slot(&slot.slot_name)?;
        let mut state = self.state();
        state.polls.push(since);
        Ok(transactions_ending_after(state.retained.clone(), since))
    }

    /// Forgets the transactions that ended at or before `position`.
    async fn confirm(&self, slot: &SlotConfig, position: LogPosition) -> CdcResult<()> {
        self.require_slot(&slot.slot_name)?;
        let mut state = self.state();
        state.confirmed = state.confirmed.max(Some(position));
        let retained = std::mem::take(&mut state.retained);
        state.retained = transactions_ending_after(retained, Some(position));
        Ok(())
    }

    async fn open_stream(
        &self,
        slot: &SlotConfig,
        start: Option<LogPosition>,
    ) -> CdcResult<Box<dyn ReplicationSession>> {
        self.require_slot(&slot.slot_name)?;
        let mut state = self.state();
        if state.slot_in_use {
            return Err(CdcError::SlotInUse(slot.slot_name.clone()));
        }
        state.session_calls.push(SessionCall::Open(start));
        Ok(Box::new(MemorySession {
            state: self.state.clone(),
        }))
    }
}

/// Serves the steps scripted on its [`MemorySource`]. Once the script runs
/// dry, `next` waits out the timeout and reports `Idle`.
pub struct MemorySession {
    state: Arc<Mutex<SourceState>>,
}

#[async_trait]
impl ReplicationSession for MemorySession {
    async fn next(&mut self, timeout: Duration) -> CdcResult<SessionEvent> {
        let step = {
            let mut state = self.state.lock().unwrap();
            state.session_calls.push(SessionCall::Next);
            state.script.pop_front()
        };
        match step {
            Some(StreamStep::Change(record)) => Ok(SessionEvent::Change(record)),
            Some(StreamStep::Idle) => {
                tokio::time::sleep(timeout).await;
                Ok(SessionEvent::Idle)
            }
            Some(StreamStep::Stall) => Err(CdcError::StreamStalled(
                "server closed the replication stream".to_string(),
            )),
            None => {
                tokio::time::sleep(timeout).await;
                Ok(SessionEvent::Idle)
            }
        }
    }

    async fn acknowledge(&mut self, position: LogPosition) -> CdcResult<()> {
        let mut state = self.state.lock().unwrap();
        state.session_calls.push(SessionCall::Acknowledge(position));
        state.confirmed = state.confirmed.max(Some(position));
        Ok(())
    }

    async fn close(self: Box<Self>) -> CdcResult<()> {
        self.state
            .lock()
            .unwrap()
            .session_calls
            .push(SessionCall::Close);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub name: String,
    pub bytes: Vec<u8>,
    pub content_type: String,
}

#[derive(Default)]
struct SinkState {
    bucket_exists: bool,
    objects: Vec<StoredObject>,
    failures_left: usize,
    put_attempts: usize,
}

#[derive(Default)]
pub struct MemorySink {
    state: Mutex<SinkState>,
}

impl MemorySink {
    pub fn new() -> MemorySink {
        MemorySink::default()
    }

    /// Every successful put, in order. A name written twice appears twice.
    pub fn objects(&self) -> Vec<StoredObject> {
        self.state.lock().unwrap().objects.clone()
    }

    pub fn fail_next_puts(&self, count: usize) {
        self.state.lock().unwrap().failures_left = count;
    }

    pub fn put_attempts(&self) -> usize {
        self.state.lock().unwrap().put_attempts
    }

    pub fn has_bucket(&self) -> bool {
        self.state.lock().unwrap().bucket_exists
    }
}

#[async_trait]
impl Sink for MemorySink {
    async fn bucket_exists(&self) -> anyhow::Result<bool> {
        Ok(self.state.lock().unwrap().bucket_exists)
    }

    async fn create_bucket(&self) -> anyhow::Result<()> {
        self.state.lock().unwrap().bucket_exists = true;
        Ok(())
    }

    async fn put(
        &self,
        object_name: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.put_attempts += 1;
        if state.failures_left > 0 {
            state.failures_left -= 1;
            bail!("injected failure writing {}", object_name);
        }
        state.objects.push(StoredObject {
            name: object_name.to_string(),
            bytes,
            content_type: content_type.to_string(),
        });
        Ok(())
    }
}

#[derive(Default)]
struct WatermarkState {
    position: Option<LogPosition>,
    saves: Vec<LogPosition>,
    failures_left: usize,
}

#[derive(Default)]
pub struct MemoryWatermarkStore {
    state: Mutex<WatermarkState>,
}

impl MemoryWatermarkStore {
    pub fn new() -> MemoryWatermarkStore {
        MemoryWatermarkStore::default()
    }

    pub fn with_position(position: LogPosition) -> MemoryWatermarkStore {
        let store = MemoryWatermarkStore::default();
        store.state.lock().unwrap().position = Some(position);
        store
    }

    pub fn position(&self) -> Option<LogPosition> {
        self.state.lock().unwrap().position
    }

    /// Successful saves, in order.
    pub fn saves(&self) -> Vec<LogPosition> {
        self.state.lock().unwrap().saves.clone()
    }

    pub fn fail_next_saves(&self, count: usize) {
        self.state.lock().unwrap().failures_left = count;
    }
}

#[async_trait]
impl WatermarkStore for MemoryWatermarkStore {
    async fn load(&self) -> anyhow::Result<Option<LogPosition>> {
        Ok(self.state.lock().unwrap().position)
    }

    async fn save(&self, position: LogPosition) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.failures_left > 0 {
            state.failures_left -= 1;
            bail!("injected failure saving {}", position);
        }
        state.position = Some(position);
        state.saves.push(position);
        Ok(())
    }
}
