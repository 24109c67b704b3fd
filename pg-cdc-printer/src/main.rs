pub mod printer;

use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use pg_cdc::cdc_types::{DecodingPlugin, LogPosition, SlotConfig};
use pg_cdc::checkpoints::{FileWatermarkStore, WatermarkStore};
use pg_cdc::postgres::{PgConnectionConfig, PgSource};

use crate::printer::{peek, print_records, read_object};

/// Prints changes pending on a replication slot without consuming them,
/// or the content of a delivered batch object.
#[derive(Parser)]
struct Args {
    /// Delivered batch object (.csv or .jsonl) to print instead of querying the slot
    #[clap(long)]
    object: Option<PathBuf>,

    /// Connection string of the source database
    #[clap(
        long,
        env = "PG_URI",
        default_value = "postgresql://postgres@localhost:5432/postgres",
        hide_env_values = true
    )]
    uri: String,

    /// Replication slot name
    #[clap(short, long, default_value = "data_sync_slot")]
    slot_name: String,

    /// Publication name, used by pgoutput slots
    #[clap(short, long, default_value = "data_sync_pub")]
    publication_name: String,

    #[clap(long, default_value = "test_decoding")]
    plugin: DecodingPlugin,

    /// Only print transactions that ended after this LSN
    #[clap(long, conflicts_with = "watermark_path")]
    since: Option<LogPosition>,

    /// Only print transactions that ended after the watermark stored in this file
    #[clap(long)]
    watermark_path: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();
    let args = Args::parse();

    let records = match &args.object {
        Some(path) => read_object(path)?,
        None => {
            let since = match &args.watermark_path {
                Some(path) => FileWatermarkStore::new(path).load().await?,
                None => args.since,
            };
            let source = PgSource::connect(PgConnectionConfig::from_uri(&args.uri)?).await?;
            let slot = SlotConfig::new(&args.slot_name, &args.publication_name)
                .with_plugin(args.plugin);
            peek(&source, &slot, since).await?
        }
    };

    print_records(&mut std::io::stdout().lock(), &records)?;
    Ok(())
}
