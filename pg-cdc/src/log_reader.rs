//! Drives provisioning, capture, delivery and watermark commits.
//!
//! Poll mode is a single cycle, see [`CDCLogReaderBuilder::run_once`].
//! Stream mode runs a worker until [`CDCLogReader::stop`] is called, see
//! [`CDCLogReaderBuilder::start`].
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::RemoteHandle;
use futures::FutureExt;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::batch::{Batch, BatchAssembler, FlushPolicy};
use crate::cdc_types::{LogPosition, SlotConfig};
use crate::checkpoints::WatermarkStore;
use crate::error::{CdcError, CdcResult};
use crate::provisioning::SlotProvisioner;
use crate::retry::RetryPolicy;
use crate::sink::BatchWriter;
use crate::source::{ReplicationSession, SessionEvent, Source};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CaptureMode {
    #[default]
    Poll,
    Stream,
}

impl fmt::Display for CaptureMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureMode::Poll => write!(f, "poll"),
            CaptureMode::Stream => write!(f, "stream"),
        }
    }
}

impl FromStr for CaptureMode {
    type Err = CdcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "poll" => Ok(CaptureMode::Poll),
            "stream" => Ok(CaptureMode::Stream),
            other => Err(CdcError::Config(format!("unknown capture mode {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CaptureConfig {
    pub mode: CaptureMode,
    pub slot: SlotConfig,
    /// Stream mode flushes once this many records are pending.
    pub flush_threshold: usize,
    /// Cadence of stream acknowledgements, and the maximum age of a pending batch.
    pub keepalive_interval: Duration,
    /// Upper bound of a single wait for stream data.
    pub poll_timeout: Duration,
    pub retry: RetryPolicy,
}

impl CaptureConfig {
    pub fn new(slot: SlotConfig) -> CaptureConfig {
        CaptureConfig {
            mode: CaptureMode::default(),
            slot,
            flush_threshold: 10_000,
            keepalive_interval: Duration::from_secs(10),
            poll_timeout: Duration::from_secs(1),
            retry: RetryPolicy::default(),
        }
    }

    fn stream_flush_policy(&self) -> FlushPolicy {
        FlushPolicy::Threshold {
            max_records: self.flush_threshold.max(1),
            max_age: self.keepalive_interval,
        }
    }

    fn validate(&self) -> CdcResult<()> {
        if self.slot.slot_name.is_empty() || self.slot.publication_name.is_empty() {
            return Err(CdcError::Config(
                "slot and publication names must not be empty".to_string(),
            ));
        }
        if self.keepalive_interval.is_zero() || self.poll_timeout.is_zero() {
            return Err(CdcError::Config(
                "keepalive interval and poll timeout must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Result of a poll mode cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunSummary {
    NoChanges,
    Delivered {
        object_name: String,
        records: usize,
        watermark: LogPosition,
    },
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunSummary::NoChanges => write!(f, "no new changes"),
            RunSummary::Delivered {
                object_name,
                records,
                watermark,
            } => write!(
                f,
                "delivered {records} changes to {object_name}, watermark {watermark}"
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Provisioning,
    Fetching,
    Assembling,
    Delivering,
    Committing,
    Done,
    Stopping,
    Failed,
}

impl fmt::Display for CaptureState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CaptureState::Provisioning => "provisioning",
            CaptureState::Fetching => "fetching",
            CaptureState::Assembling => "assembling",
            CaptureState::Delivering => "delivering",
            CaptureState::Committing => "committing",
            CaptureState::Done => "done",
            CaptureState::Stopping => "stopping",
            CaptureState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Handle to a running stream capture.
pub struct CDCLogReader {
    // Tells the worker to stop
    stop: watch::Sender<bool>,
}

impl CDCLogReader {
    /// Asks the worker to finish the batch in flight, flush what is pending
    /// and close the session.
    pub fn stop(&mut self) {
        let _ = self.stop.send(true);
    }
}

pub struct CDCLogReaderBuilder {
    source: Option<Arc<dyn Source>>,
    writer: Option<BatchWriter>,
    watermark_store: Option<Arc<dyn WatermarkStore>>,
    config: Option<CaptureConfig>,
}

impl Default for CDCLogReaderBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CDCLogReaderBuilder {
    pub fn new() -> CDCLogReaderBuilder {
        CDCLogReaderBuilder {
            source: None,
            writer: None,
            watermark_store: None,
            config: None,
        }
    }

    pub fn source(mut self, source: Arc<dyn Source>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn writer(mut self, writer: BatchWriter) -> Self {
        self.writer = Some(writer);
        self
    }

    pub fn watermark_store(mut self, store: Arc<dyn WatermarkStore>) -> Self {
        self.watermark_store = Some(store);
        self
    }

    pub fn config(mut self, config: CaptureConfig) -> Self {
        self.config = Some(config);
        self
    }

    fn into_worker(self) -> CdcResult<CaptureWorker> {
        let missing = |what: &str| CdcError::Config(format!("{what} is not set"));
        let config = self.config.ok_or_else(|| missing("capture config"))?;
        config.validate()?;
        Ok(CaptureWorker {
            source: self.source.ok_or_else(|| missing("source"))?,
            writer: self.writer.ok_or_else(|| missing("batch writer"))?,
            store: self
                .watermark_store
                .ok_or_else(|| missing("watermark store"))?,
            config,
            state: CaptureState::Provisioning,
        })
    }

    /// Runs one poll cycle: everything retained past the watermark becomes
    /// at most one object.
    pub async fn run_once(self) -> CdcResult<RunSummary> {
        let mut worker = self.into_worker()?;
        match worker.poll_cycle().await {
            Ok(summary) => Ok(summary),
            Err(err) => Err(worker.fail(err)),
        }
    }

    /// Provisions, opens the first stream session and spawns the worker.
    /// Startup failures, such as the slot being held by another process,
    /// are returned here rather than through the handle.
    pub async fn start(self) -> CdcResult<(CDCLogReader, RemoteHandle<CdcResult<()>>)> {
        let mut worker = self.into_worker()?;
        let (session, committed) = match worker.open_first_session().await {
            Ok(opened) => opened,
            Err(err) => return Err(worker.fail(err)),
        };

        let (stop_sender, stop_receiver) = watch::channel(false);
        let (fut, handle) = async move {
            let result = worker.stream(session, committed, stop_receiver).await;
            result.map_err(|err| worker.fail(err))
        }
        .remote_handle();
        tokio::task::spawn(fut);
        Ok((CDCLogReader { stop: stop_sender }, handle))
    }
}

enum StepOutcome {
    Continue,
    Stop,
}

struct StreamContext {
    session: Box<dyn ReplicationSession>,
    stop: watch::Receiver<bool>,
    assembler: BatchAssembler,
    committed: Option<LogPosition>,
    // Sessions lost in a row without a flush or acknowledgement in between.
    reconnects: u32,
    next_keepalive: Instant,
}

struct CaptureWorker {
    source: Arc<dyn Source>,
    writer: BatchWriter,
    store: Arc<dyn WatermarkStore>,
    config: CaptureConfig,
    state: CaptureState,
}

impl CaptureWorker {
    fn transition(&mut self, state: CaptureState) {
        if self.state != state {
            info!("Capture state {} -> {}", self.state, state);
            self.state = state;
        }
    }

    fn fail(&mut self, err: CdcError) -> CdcError {
        error!("Capture failed while {}: {}", self.state, err);
        self.state = CaptureState::Failed;
        err
    }

    async fn provision(&mut self) -> CdcResult<()> {
        self.transition(CaptureState::Provisioning);
        let retry = self.config.retry;
        let (source, slot) = (&self.source, &self.config.slot);
        retry
            .retry("provisioning", move || SlotProvisioner::ensure(source.as_ref(), slot))
            .await?;
        let writer = &self.writer;
        retry
            .retry("bucket check", move || writer.ensure_bucket())
            .await
    }

    async fn load_watermark(&self) -> CdcResult<Option<LogPosition>> {
        let watermark = self
            .store
            .load()
            .await
            .map_err(|e| CdcError::InvalidWatermark(format!("{e:#}")))?;
        match watermark {
            Some(position) => info!("Resuming after watermark {}", position),
            None => info!("No watermark found, reading everything the slot retains"),
        }
        Ok(watermark)
    }

    /// Writes the batch and then persists its maximum position. A batch made
    /// of transactions that began below `committed` never moves it back.
    async fn deliver_and_commit(
        &mut self,
        batch: &Batch,
        committed: Option<LogPosition>,
    ) -> CdcResult<(String, LogPosition)> {
        let position = match batch.max_position {
            Some(max) => committed.map_or(max, |committed| committed.max(max)),
            None => {
                return Err(CdcError::Config(
                    "refusing to deliver an empty batch".to_string(),
                ))
            }
        };

        self.transition(CaptureState::Delivering);
        let name = self.writer.object_name(batch);
        let (writer, object) = (&self.writer, name.as_str());
        self.config
            .retry
            .retry("delivery", move || writer.deliver_as(object, batch))
            .await?;
        info!("Delivered {} changes to {}", batch.len(), name);

        self.transition(CaptureState::Committing);
        self.store
            .save(position)
            .await
            .map_err(|e| CdcError::WatermarkPersist {
                position: position.to_string(),
                reason: format!("{e:#}"),
            })?;
        info!("Committed watermark {}", position);
        Ok((name, position))
    }

    async fn poll_cycle(&mut self) -> CdcResult<RunSummary> {
        self.provision().await?;

        self.transition(CaptureState::Fetching);
        let watermark = self.load_watermark().await?;
        let (source, slot) = (&self.source, &self.config.slot);
        let records = self
            .config
            .retry
            .retry("poll", move || source.poll_changes(slot, watermark))
            .await?;

        let mut assembler = BatchAssembler::new(FlushPolicy::SourceExhausted);
        assembler.extend(records);
        assembler.mark_exhausted();

        self.transition(CaptureState::Assembling);
        let batch = assembler.drain();
        if batch.is_empty() {
            info!("No new changes on slot {}", self.config.slot.slot_name);
            self.transition(CaptureState::Done);
            return Ok(RunSummary::NoChanges);
        }

        let (object_name, position) = self.deliver_and_commit(&batch, watermark).await?;
        // Polling past the watermark skips these transactions, so a failed
        // confirm only delays reclaiming WAL.
        if let Err(err) = self.source.confirm(&self.config.slot, position).await {
            warn!(
                "Could not advance slot {} to {}: {}",
                self.config.slot.slot_name, position, err
            );
        }

        self.transition(CaptureState::Done);
        Ok(RunSummary::Delivered {
            object_name,
            records: batch.len(),
            watermark: position,
        })
    }

    async fn open_session(
        &self,
        start: Option<LogPosition>,
    ) -> CdcResult<Box<dyn ReplicationSession>> {
        let (source, slot) = (&self.source, &self.config.slot);
        self.config
            .retry
            .retry("stream open", move || source.open_stream(slot, start))
            .await
    }

    async fn open_first_session(
        &mut self,
    ) -> CdcResult<(Box<dyn ReplicationSession>, Option<LogPosition>)> {
        self.provision().await?;
        self.transition(CaptureState::Fetching);
        let committed = self.load_watermark().await?;
        let session = self.open_session(committed).await?;
        Ok((session, committed))
    }

    async fn stream(
        &mut self,
        session: Box<dyn ReplicationSession>,
        committed: Option<LogPosition>,
        stop: watch::Receiver<bool>,
    ) -> CdcResult<()> {
        let mut ctx = StreamContext {
            session,
            stop,
            assembler: BatchAssembler::new(self.config.stream_flush_policy()),
            committed,
            reconnects: 0,
            next_keepalive: Instant::now() + self.config.keepalive_interval,
        };

        loop {
            match self.stream_step(&mut ctx).await {
                Ok(StepOutcome::Continue) => {}
                Ok(StepOutcome::Stop) => break,
                Err(err) if err.requires_reconnect() => self.reconnect(&mut ctx, err).await?,
                Err(err) => return Err(err),
            }
        }

        self.transition(CaptureState::Stopping);
        info!("Stopping capture on slot {}", self.config.slot.slot_name);
        if !ctx.assembler.is_empty() {
            self.flush(&mut ctx).await?;
        }
        ctx.session.close().await?;
        self.transition(CaptureState::Done);
        Ok(())
    }

    async fn stream_step(&mut self, ctx: &mut StreamContext) -> CdcResult<StepOutcome> {
        if *ctx.stop.borrow() {
            return Ok(StepOutcome::Stop);
        }
        self.transition(CaptureState::Fetching);

        let until_keepalive = ctx
            .next_keepalive
            .saturating_duration_since(Instant::now());
        let wait = self.config.poll_timeout.min(until_keepalive);
        let event = tokio::select! {
            _ = ctx.stop.changed() => return Ok(StepOutcome::Stop),
            event = ctx.session.next(wait) => event?,
        };

        // The server skips transactions committed at or before the start
        // position, so everything arriving here is new.
        if let SessionEvent::Change(record) = event {
            ctx.assembler.append(record);
        }

        let keepalive_due = Instant::now() >= ctx.next_keepalive;
        let flush_due = keepalive_due || ctx.assembler.should_flush(Utc::now());
        if flush_due && !ctx.assembler.is_empty() {
            self.flush(ctx).await?;
        } else if keepalive_due {
            let position = ctx.committed.unwrap_or(LogPosition::ZERO);
            debug!("Keepalive, acknowledging {}", position);
            ctx.session.acknowledge(position).await?;
            ctx.reconnects = 0;
            ctx.next_keepalive = Instant::now() + self.config.keepalive_interval;
        }
        Ok(StepOutcome::Continue)
    }

    async fn flush(&mut self, ctx: &mut StreamContext) -> CdcResult<()> {
        self.transition(CaptureState::Assembling);
        let batch = ctx.assembler.drain();
        let (_, position) = self.deliver_and_commit(&batch, ctx.committed).await?;
        ctx.committed = Some(position);
        ctx.session.acknowledge(position).await?;
        ctx.reconnects = 0;
        ctx.next_keepalive = Instant::now() + self.config.keepalive_interval;
        Ok(())
    }

    /// Replaces a broken session with one starting at the committed watermark.
    /// Pending records were never acknowledged and will be sent again.
    /// Gives up with `cause` once `max_attempts` sessions were lost in a row.
    async fn reconnect(&mut self, ctx: &mut StreamContext, cause: CdcError) -> CdcResult<()> {
        let retry = self.config.retry;
        ctx.reconnects += 1;
        if ctx.reconnects >= retry.max_attempts {
            return Err(cause);
        }

        let discarded = ctx.assembler.drain();
        let delay = retry.delay_after(ctx.reconnects);
        warn!(
            "Replication session lost ({}, {}/{}), discarding {} pending changes and resuming after {:?} in {:?}",
            cause,
            ctx.reconnects,
            retry.max_attempts,
            discarded.len(),
            ctx.committed,
            delay
        );
        tokio::time::sleep(delay).await;
        ctx.session = self.open_session(ctx.committed).await?;
        ctx.next_keepalive = Instant::now() + self.config.keepalive_interval;
        Ok(())
    }
}
