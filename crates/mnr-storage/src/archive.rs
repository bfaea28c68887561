use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use mnr_core::RegionCode;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct ArchivedPage {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Content-addressed copies of fetched pages, kept so a failed extraction can
/// be replayed against the exact markup that caused it.
#[derive(Debug, Clone)]
pub struct PageArchive {
    root: PathBuf,
}

impl PageArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    /// `<REGION>/<YYYYMMDD>/<sha256>.html`
    pub fn page_relative_path(
        &self,
        region: &RegionCode,
        fetched_at: DateTime<Utc>,
        content_hash: &str,
    ) -> PathBuf {
        PathBuf::from(region.as_str())
            .join(fetched_at.format("%Y%m%d").to_string())
            .join(format!("{content_hash}.html"))
    }

    pub async fn store_page(
        &self,
        region: &RegionCode,
        fetched_at: DateTime<Utc>,
        page: &str,
    ) -> anyhow::Result<ArchivedPage> {
        let content_hash = Self::sha256_hex(page.as_bytes());
        let relative_path = self.page_relative_path(region, fetched_at, &content_hash);
        let absolute_path = self.root.join(&relative_path);

        let written = if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking archive path {}", absolute_path.display()))?
        {
            false
        } else {
            write_atomic(&absolute_path, page.as_bytes()).await?
        };

        Ok(ArchivedPage {
            content_hash,
            relative_path,
            absolute_path,
            byte_size: page.len(),
            deduplicated: !written,
        })
    }
}

/// Write through a temp file in the destination directory and rename it into
/// place. Returns `false` when another writer won the rename race.
pub(crate) async fn write_atomic(dest: &Path, bytes: &[u8]) -> anyhow::Result<bool> {
    let parent = dest
        .parent()
        .with_context(|| format!("{} has no parent directory", dest.display()))?;
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);

    match fs::rename(&temp_path, dest).await {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
            let _ = fs::remove_file(&temp_path).await;
            Ok(false)
        }
        Err(err) => {
            let _ = fs::remove_file(&temp_path).await;
            Err(err).with_context(|| {
                format!("renaming {} -> {}", temp_path.display(), dest.display())
            })
        }
    }
}
