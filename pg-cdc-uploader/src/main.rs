mod s3_sink;
mod uploader;

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use pg_cdc::cdc_types::{DecodingPlugin, SlotConfig};
use pg_cdc::log_reader::{CaptureConfig, CaptureMode};
use pg_cdc::postgres::PgConnectionConfig;
use pg_cdc::retry::RetryPolicy;
use pg_cdc::sink::BatchFormat;

use crate::s3_sink::S3Config;
use crate::uploader::{Uploader, UploaderSettings};

#[derive(Parser, Debug)]
#[clap(about = "Captures PostgreSQL changes from a replication slot into S3 compatible storage")]
struct Args {
    /// Capture mode: `poll` runs a single cycle, `stream` runs until interrupted
    #[clap(long, env = "CDC_MODE", default_value = "poll")]
    mode: CaptureMode,

    /// Replication slot name
    #[clap(long, env = "CDC_SLOT_NAME", default_value = "data_sync_slot")]
    slot_name: String,

    /// Publication name
    #[clap(long, env = "CDC_PUBLICATION_NAME", default_value = "data_sync_pub")]
    publication_name: String,

    /// Logical decoding plugin: `test_decoding` or `pgoutput`
    #[clap(long, env = "CDC_PLUGIN", default_value = "test_decoding")]
    plugin: DecodingPlugin,

    /// Tables as `schema.table` provided as a comma delimited string; all tables when empty
    #[clap(long, env = "CDC_TABLES", default_value = "")]
    tables: String,

    /// Number of pending changes that triggers a flush in stream mode
    #[clap(long, env = "CDC_FLUSH_THRESHOLD", default_value_t = 10_000)]
    flush_threshold: usize,

    /// Keepalive interval in seconds
    #[clap(long, env = "CDC_KEEPALIVE_INTERVAL", default_value_t = 10.)]
    keepalive_interval: f64,

    /// Longest single wait for stream data, in seconds
    #[clap(long, env = "CDC_POLL_TIMEOUT", default_value_t = 1.)]
    poll_timeout: f64,

    /// Attempts made for retryable failures before giving up
    #[clap(long, env = "CDC_MAX_ATTEMPTS", default_value_t = 5)]
    max_attempts: u32,

    /// File holding the last delivered LSN
    #[clap(long, env = "CDC_WATERMARK_PATH", default_value = "last_lsn.txt")]
    watermark_path: PathBuf,

    /// Batch object format: `csv` or `jsonl`
    #[clap(long, env = "CDC_FORMAT", default_value = "csv")]
    format: BatchFormat,

    #[clap(long, env = "PG_HOST", default_value = "localhost")]
    pg_host: String,

    #[clap(long, env = "PG_PORT", default_value_t = 5432)]
    pg_port: u16,

    #[clap(long, env = "PG_DATABASE", default_value = "postgres")]
    pg_database: String,

    #[clap(long, env = "PG_USER", default_value = "postgres")]
    pg_user: String,

    #[clap(long, env = "PG_PASSWORD", hide_env_values = true)]
    pg_password: Option<String>,

    /// Endpoint of an S3 compatible service, e.g. http://minio:9000
    #[clap(long, env = "S3_ENDPOINT")]
    s3_endpoint: Option<String>,

    #[clap(long, env = "S3_REGION", default_value = "us-east-1")]
    s3_region: String,

    #[clap(long, env = "S3_BUCKET", default_value = "raw")]
    s3_bucket: String,

    /// Key prefix of delivered objects
    #[clap(long, env = "S3_PREFIX", default_value = "cdc")]
    s3_prefix: String,

    /// Entity name used in object names
    #[clap(long, env = "CDC_ENTITY", default_value = "cdc_changes")]
    entity: String,

    #[clap(long, env = "S3_ACCESS_KEY", hide_env_values = true)]
    s3_access_key: Option<String>,

    #[clap(long, env = "S3_SECRET_KEY", hide_env_values = true)]
    s3_secret_key: Option<String>,
}

impl Args {
    fn tables(&self) -> Vec<String> {
        self.tables
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
            .collect()
    }

    fn into_settings(self) -> anyhow::Result<UploaderSettings> {
        let seconds = |name: &str, value: f64| {
            if value.is_finite() && value > 0. {
                Ok(Duration::from_secs_f64(value))
            } else {
                Err(anyhow::anyhow!("{name} must be a positive number of seconds"))
            }
        };

        let slot = SlotConfig::new(&self.slot_name, &self.publication_name)
            .with_plugin(self.plugin)
            .with_tables(self.tables());
        let mut capture = CaptureConfig::new(slot);
        capture.mode = self.mode;
        capture.flush_threshold = self.flush_threshold;
        capture.keepalive_interval = seconds("keepalive interval", self.keepalive_interval)?;
        capture.poll_timeout = seconds("poll timeout", self.poll_timeout)?;
        capture.retry = RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            ..Default::default()
        };

        Ok(UploaderSettings {
            postgres: PgConnectionConfig {
                host: self.pg_host,
                port: self.pg_port,
                dbname: self.pg_database,
                user: self.pg_user,
                password: self.pg_password,
            },
            s3: S3Config {
                endpoint_url: self.s3_endpoint,
                region: self.s3_region,
                bucket: self.s3_bucket,
                access_key_id: self.s3_access_key,
                secret_access_key: self.s3_secret_key,
            },
            prefix: self.s3_prefix,
            entity: self.entity,
            format: self.format,
            watermark_path: self.watermark_path,
            capture,
        })
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", err);
        std::future::pending::<()>().await;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = Args::parse().into_settings()?;
    tracing::info!(
        "Capturing slot {} in {} mode into bucket {}",
        settings.capture.slot.slot_name,
        settings.capture.mode,
        settings.s3.bucket
    );

    let uploader = Uploader::connect(&settings).await?;
    uploader.run(shutdown_signal()).await
}
