use std::io::Write;
use std::path::Path;

use anyhow::{anyhow, Context};
use pg_cdc::cdc_types::{LogPosition, SlotConfig};
use pg_cdc::change::ChangeRecord;
use pg_cdc::sink::BatchFormat;
use pg_cdc::source::Source;

/// Transactions retained by the slot that ended past `since`. Nothing is consumed.
pub async fn peek(
    source: &dyn Source,
    slot: &SlotConfig,
    since: Option<LogPosition>,
) -> anyhow::Result<Vec<ChangeRecord>> {
    source
        .poll_changes(slot, since)
        .await
        .with_context(|| format!("failed to peek slot {}", slot.slot_name))
}

/// Decodes a delivered batch object, picking the format from its extension.
pub fn read_object(path: &Path) -> anyhow::Result<Vec<ChangeRecord>> {
    let name = path.to_string_lossy();
    let format = BatchFormat::from_object_name(&name)
        .ok_or_else(|| anyhow!("cannot tell the format of {}", name))?;
    let bytes = std::fs::read(path).with_context(|| format!("failed to read {name}"))?;
    Ok(format.decode(&bytes)?)
}

pub fn print_records(out: &mut impl Write, records: &[ChangeRecord]) -> std::io::Result<()> {
    for record in records {
        writeln!(out, "{record}")?;
    }
    match (records.first(), records.last()) {
        (Some(first), Some(last)) => writeln!(
            out,
            "{} changes, lsn {} to {}",
            records.len(),
            first.position,
            last.position
        ),
        _ => writeln!(out, "no changes"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pg_cdc::change::ChangePayload;
    use pg_cdc::postgres::{PgConnectionConfig, PgSource};
    use pg_cdc::provisioning::SlotProvisioner;
    use pg_cdc::test_utilities::{unique_temp_dir, MemorySource};
    use pg_cdc_test_utils::{
        create_test_table, drop_replication_objects, get_uri, populate_test_table, unique_name,
    };

    fn records() -> Vec<ChangeRecord> {
        vec![
            ChangeRecord::new(
                LogPosition::new(0x10),
                Some(5),
                ChangePayload::Text("BEGIN 5".to_string()),
            ),
            ChangeRecord::new(LogPosition::new(0x18), Some(5), ChangePayload::Binary(vec![1, 2])),
        ]
    }

    #[test]
    fn test_print_records() {
        let mut out = Vec::new();
        print_records(&mut out, &records()).unwrap();

        let text = String::from_utf8(out).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].contains("BEGIN 5"));
        assert!(lines[1].contains("\\x0102"));
        assert_eq!(lines[2], "2 changes, lsn 0/10 to 0/18");
    }

    #[test]
    fn test_print_nothing() {
        let mut out = Vec::new();
        print_records(&mut out, &[]).unwrap();
        assert_eq!(out, b"no changes\n");
    }

    #[test]
    fn test_read_object() {
        let dir = unique_temp_dir();
        for format in [BatchFormat::Csv, BatchFormat::JsonLines] {
            let path = dir.join(format!("cdc_changes_20240101_000000_0000000000000018.{}", format.extension()));
            std::fs::write(&path, format.encode(&records()).unwrap()).unwrap();

            assert_eq!(read_object(&path).unwrap(), records());
        }
        assert!(read_object(&dir.join("notes.txt")).is_err());
    }

    #[tokio::test]
    async fn test_peek_leaves_changes_in_place() {
        let source = MemorySource::new();
        let slot = SlotConfig::new("data_sync_slot", "data_sync_pub");
        SlotProvisioner::ensure(&source, &slot).await.unwrap();
        source.push_changes(records());

        assert_eq!(peek(&source, &slot, None).await.unwrap().len(), 2);
        // The transaction ends past 0x10, so it is printed whole.
        assert_eq!(
            peek(&source, &slot, Some(LogPosition::new(0x10)))
                .await
                .unwrap()
                .len(),
            2
        );
        assert!(peek(&source, &slot, Some(LogPosition::new(0x18)))
            .await
            .unwrap()
            .is_empty());
        assert_eq!(source.retained_positions().len(), 2);
    }

    #[tokio::test]
    #[ignore]
    async fn test_peek_live_slot() {
        let source = PgSource::connect(PgConnectionConfig::from_uri(&get_uri()).unwrap())
            .await
            .unwrap();
        let table = create_test_table(source.client()).await.unwrap();
        let name = unique_name();
        let slot = SlotConfig::new(format!("{name}_slot"), format!("{name}_pub"))
            .with_tables(vec![format!("public.{table}")]);
        SlotProvisioner::ensure(&source, &slot).await.unwrap();
        populate_test_table(source.client(), &table, 1).await.unwrap();

        let first = peek(&source, &slot, None).await.unwrap();
        let second = peek(&source, &slot, None).await.unwrap();
        assert_eq!(first.len(), 3);
        assert_eq!(first.len(), second.len());

        drop_replication_objects(source.client(), &slot.slot_name, &slot.publication_name)
            .await
            .unwrap();
    }
}
