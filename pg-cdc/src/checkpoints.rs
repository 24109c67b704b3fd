//! A module representing the logic behind saving progress.
//!
//! Progress is a single watermark: the highest log position whose batch has
//! already been written to the sink. It is the only state a capture run
//! needs in order to resume.
use anyhow::{self, Context};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::cdc_types::LogPosition;

/// Customizable trait responsible for persisting the watermark.
#[async_trait]
pub trait WatermarkStore: Send + Sync {
    /// Loads the last committed position, `None` if nothing was committed yet.
    async fn load(&self) -> anyhow::Result<Option<LogPosition>>;
    /// Overwrites the committed position.
    /// Must leave either the old or the new value behind if the process dies midway.
    async fn save(&self, position: LogPosition) -> anyhow::Result<()>;
}

/// Default implementation for [`WatermarkStore`] trait.
/// Keeps the position as text in a local file.
/// A missing file means capture starts from the slot's retained history.
///
/// Only one process may write to a given file. Running several capture
/// processes against the same slot requires a store backed by the source itself.
#[derive(Debug, Clone)]
pub struct FileWatermarkStore {
    path: PathBuf,
}

impl FileWatermarkStore {
    pub fn new(path: impl Into<PathBuf>) -> FileWatermarkStore {
        FileWatermarkStore { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temporary_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    // Makes the rename itself durable. Not every platform lets a directory
    // be opened for syncing, so a failure here is only logged.
    async fn sync_parent_dir(&self) {
        let parent = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let result = match fs::File::open(parent).await {
            Ok(dir) => dir.sync_all().await,
            Err(err) => Err(err),
        };
        if let Err(err) = result {
            warn!("Syncing directory {} failed: {}", parent.display(), err);
        }
    }
}

#[async_trait]
impl WatermarkStore for FileWatermarkStore {
    async fn load(&self) -> anyhow::Result<Option<LogPosition>> {
        let contents = match fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| format!("reading {}", self.path.display()))
            }
        };

        let position = contents
            .trim()
            .parse::<LogPosition>()
            .with_context(|| format!("parsing {}", self.path.display()))?;

        Ok(Some(position))
    }

    /// Writes a sibling temporary file, syncs it and renames it over the old one.
    async fn save(&self, position: LogPosition) -> anyhow::Result<()> {
        let tmp_path = self.temporary_path();

        let mut file = fs::File::create(&tmp_path)
            .await
            .with_context(|| format!("creating {}", tmp_path.display()))?;
        file.write_all(position.to_string().as_bytes()).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&tmp_path, &self.path)
            .await
            .with_context(|| format!("replacing {}", self.path.display()))?;
        self.sync_parent_dir().await;

        debug!("Saved watermark {} to {}", position, self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utilities::unique_temp_dir;

    #[tokio::test]
    async fn test_load_missing_file_means_no_watermark() {
        let dir = unique_temp_dir();
        let store = FileWatermarkStore::new(dir.join("last_lsn.txt"));

        assert_eq!(store.load().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_save_watermark_multiple_times() {
        const N: u64 = 20;
        let dir = unique_temp_dir();
        let store = FileWatermarkStore::new(dir.join("last_lsn.txt"));

        let mut position = LogPosition::new(128);
        for i in 0..N {
            position = LogPosition::new(128 + i * 32);
            store.save(position).await.unwrap();
        }

        assert_eq!(store.load().await.unwrap(), Some(position));
        assert!(!store.temporary_path().exists());

        let on_disk = std::fs::read_to_string(store.path()).unwrap();
        assert_eq!(on_disk, position.to_string());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_an_error() {
        let dir = unique_temp_dir();
        let path = dir.join("last_lsn.txt");
        std::fs::write(&path, "not an lsn").unwrap();

        let store = FileWatermarkStore::new(&path);
        assert!(store.load().await.is_err());
    }

    #[tokio::test]
    async fn test_leftover_temporary_file_is_ignored() {
        let dir = unique_temp_dir();
        let store = FileWatermarkStore::new(dir.join("last_lsn.txt"));
        store.save(LogPosition::new(0x15)).await.unwrap();

        // A crash after writing the temporary file but before the rename.
        std::fs::write(store.temporary_path(), "0/9").unwrap();

        assert_eq!(store.load().await.unwrap(), Some(LogPosition::new(0x15)));
        store.save(LogPosition::new(0x20)).await.unwrap();
        assert_eq!(store.load().await.unwrap(), Some(LogPosition::new(0x20)));
    }

    #[tokio::test]
    async fn test_save_into_missing_directory_fails() {
        let dir = unique_temp_dir();
        let store = FileWatermarkStore::new(dir.join("missing").join("last_lsn.txt"));

        assert!(store.save(LogPosition::new(1)).await.is_err());
    }
}
