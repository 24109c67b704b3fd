use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tokio::select;
use tracing::info;

use pg_cdc::checkpoints::FileWatermarkStore;
use pg_cdc::log_reader::{CDCLogReaderBuilder, CaptureConfig, CaptureMode};
use pg_cdc::postgres::{PgConnectionConfig, PgSource};
use pg_cdc::sink::{BatchFormat, BatchWriter, Sink};
use pg_cdc::source::Source;

use crate::s3_sink::{S3Config, S3Sink};

/// Everything needed to wire a capture run together.
#[derive(Debug, Clone)]
pub struct UploaderSettings {
    pub postgres: PgConnectionConfig,
    pub s3: S3Config,
    pub prefix: String,
    pub entity: String,
    pub format: BatchFormat,
    pub watermark_path: PathBuf,
    pub capture: CaptureConfig,
}

pub struct Uploader {
    builder: CDCLogReaderBuilder,
    mode: CaptureMode,
}

impl Uploader {
    pub async fn connect(settings: &UploaderSettings) -> anyhow::Result<Uploader> {
        let source = PgSource::connect(settings.postgres.clone())
            .await
            .context("failed to connect to Postgres")?;
        let sink = S3Sink::new(&settings.s3).await;
        Ok(Uploader::new(Arc::new(source), Arc::new(sink), settings))
    }

    pub fn new(source: Arc<dyn Source>, sink: Arc<dyn Sink>, settings: &UploaderSettings) -> Uploader {
        let writer = BatchWriter::new(sink, &settings.prefix, &settings.entity, settings.format);
        let builder = CDCLogReaderBuilder::new()
            .source(source)
            .writer(writer)
            .watermark_store(Arc::new(FileWatermarkStore::new(&settings.watermark_path)))
            .config(settings.capture.clone());
        Uploader {
            builder,
            mode: settings.capture.mode,
        }
    }

    /// Poll mode returns after one cycle. Stream mode runs until `shutdown`
    /// resolves or the worker fails.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> anyhow::Result<()> {
        match self.mode {
            CaptureMode::Poll => {
                let summary = self.builder.run_once().await.context("capture run failed")?;
                info!("Capture run finished: {}", summary);
                Ok(())
            }
            CaptureMode::Stream => {
                let (mut reader, mut handle) = self
                    .builder
                    .start()
                    .await
                    .context("failed to start streaming capture")?;
                select! {
                    _ = shutdown => {
                        info!("Shutting down...");
                        reader.stop();
                        handle.await.context("streaming capture failed while stopping")
                    }
                    res = &mut handle => res.context("streaming capture failed"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use pg_cdc::cdc_types::{LogPosition, SlotConfig};
    use pg_cdc::change::{ChangePayload, ChangeRecord};
    use pg_cdc::checkpoints::WatermarkStore;
    use pg_cdc::retry::RetryPolicy;
    use pg_cdc::test_utilities::{unique_temp_dir, MemorySink, MemorySource, StreamStep};

    fn change(position: u64) -> ChangeRecord {
        ChangeRecord::new(
            LogPosition::new(position),
            Some(9),
            ChangePayload::Text(format!("table db_loja.clientes: UPDATE: id[integer]:{position}")),
        )
    }

    fn settings(mode: CaptureMode) -> UploaderSettings {
        let mut capture = CaptureConfig::new(SlotConfig::new("data_sync_slot", "data_sync_pub"));
        capture.mode = mode;
        capture.keepalive_interval = Duration::from_millis(20);
        capture.poll_timeout = Duration::from_millis(20);
        capture.retry = RetryPolicy::no_retry();
        UploaderSettings {
            postgres: PgConnectionConfig::from_uri("postgresql://cdc@localhost/loja").unwrap(),
            s3: S3Config {
                endpoint_url: None,
                region: "us-east-1".to_string(),
                bucket: "raw".to_string(),
                access_key_id: None,
                secret_access_key: None,
            },
            prefix: "cdc".to_string(),
            entity: "cdc_changes".to_string(),
            format: BatchFormat::Csv,
            watermark_path: unique_temp_dir().join("last_lsn.txt"),
            capture,
        }
    }

    #[tokio::test]
    async fn test_poll_run_writes_watermark_file() {
        let settings = settings(CaptureMode::Poll);
        let source = MemorySource::new();
        source.push_changes([3, 4].map(change));
        let sink = Arc::new(MemorySink::new());

        Uploader::new(Arc::new(source), sink.clone(), &settings)
            .run(std::future::pending())
            .await
            .unwrap();

        assert_eq!(sink.objects().len(), 1);
        assert!(sink.objects()[0].name.starts_with("cdc/cdc_changes_"));
        let store = FileWatermarkStore::new(&settings.watermark_path);
        assert_eq!(store.load().await.unwrap(), Some(LogPosition::new(4)));
        assert_eq!(
            std::fs::read_to_string(&settings.watermark_path).unwrap(),
            "0/4"
        );
    }

    #[tokio::test]
    async fn test_stream_run_stops_on_shutdown() {
        let settings = settings(CaptureMode::Stream);
        let source = MemorySource::new();
        source.script_stream([StreamStep::Change(change(7))]);
        let sink = Arc::new(MemorySink::new());

        Uploader::new(Arc::new(source), sink.clone(), &settings)
            .run(tokio::time::sleep(Duration::from_millis(100)))
            .await
            .unwrap();

        assert_eq!(sink.objects().len(), 1);
        let store = FileWatermarkStore::new(&settings.watermark_path);
        assert_eq!(store.load().await.unwrap(), Some(LogPosition::new(7)));
    }

    #[tokio::test]
    async fn test_stream_failure_ends_run() {
        let settings = settings(CaptureMode::Stream);
        let source = MemorySource::new();
        source.script_stream([StreamStep::Change(change(7)), StreamStep::Idle]);
        let sink = Arc::new(MemorySink::new());
        sink.fail_next_puts(1);

        let err = Uploader::new(Arc::new(source), sink.clone(), &settings)
            .run(std::future::pending())
            .await
            .unwrap_err();

        assert!(format!("{err:#}").contains("failed to write object"));
        assert!(!settings.watermark_path.exists());
    }
}
