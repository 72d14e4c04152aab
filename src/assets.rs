//! Content-addressed image storage.
//!
//! Uploads are keyed by the sha256 of the bytes as received. The first upload
//! of a digest is transformed and written to disk; every later upload of the
//! same bytes resolves to the stored asset without touching the filesystem.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use log::{debug, info, warn};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::catalog::Catalog;
use crate::error::{Error, Result};
use crate::imaging::{ImageTransform, TransformedImage};
use crate::models::{Asset, NewAsset};

pub fn digest_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

#[derive(Clone)]
pub struct AssetStore {
    root: PathBuf,
    catalog: Arc<dyn Catalog>,
    transform: Arc<ImageTransform>,
    inflight: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

/// Files written for one ingestion, relative and absolute.
struct StoredFiles {
    path: String,
    thumb_path: String,
    absolute: [PathBuf; 2],
    bytes: u64,
}

impl StoredFiles {
    async fn remove(&self) {
        for path in &self.absolute {
            if let Err(err) = fs::remove_file(path).await {
                warn!("could not remove {}: {err}", path.display());
            }
        }
    }
}

impl AssetStore {
    pub async fn new(
        root: impl Into<PathBuf>,
        catalog: Arc<dyn Catalog>,
        transform: ImageTransform,
    ) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        Ok(AssetStore {
            root,
            catalog,
            transform: Arc::new(transform),
            inflight: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn absolute(&self, relative: &str) -> PathBuf {
        self.root.join(relative)
    }

    /// Returns the asset for `bytes`, ingesting it on first sight.
    ///
    /// Uploads of the same digest are serialized, so concurrent duplicates
    /// wait for the first one and then reuse its asset. Ingestion runs on its
    /// own task: dropping the returned future does not interrupt it, so files
    /// and the digest lock are always settled.
    pub async fn resolve(&self, bytes: &[u8]) -> Result<Asset> {
        let digest = digest_hex(bytes);
        if let Some(existing) = self.catalog.asset_by_digest(&digest).await? {
            debug!("asset {} reused for digest {digest}", existing.id);
            return Ok(existing);
        }

        let store = self.clone();
        let input = bytes.to_vec();
        tokio::spawn(async move {
            let lock = store.digest_lock(&digest).await;
            let guard = lock.lock().await;
            let resolved = store.ingest(&digest, input).await;
            drop(guard);
            store.release_digest_lock(&digest, lock).await;
            resolved
        })
        .await
        .map_err(|err| Error::Storage(format!("asset ingest task failed: {err}")))?
    }

    async fn ingest(&self, digest: &str, input: Vec<u8>) -> Result<Asset> {
        // A concurrent upload may have finished while we waited for the lock.
        if let Some(existing) = self.catalog.asset_by_digest(digest).await? {
            return Ok(existing);
        }

        let transform = Arc::clone(&self.transform);
        let image = tokio::task::spawn_blocking(move || transform.transform(&input))
            .await
            .map_err(|err| Error::Storage(format!("image transform task failed: {err}")))??;

        let files = self.write_files(&image).await?;
        let new_asset = NewAsset {
            path: files.path.clone(),
            thumb_path: files.thumb_path.clone(),
            mime: image.mime().to_string(),
            width: image.full.width,
            height: image.full.height,
            bytes: files.bytes,
            sha256: digest.to_string(),
        };

        match self.catalog.insert_asset(new_asset).await {
            Ok(asset) => {
                info!(
                    "stored asset {} ({}x{}, {} bytes) at {}",
                    asset.id, asset.width, asset.height, asset.bytes, asset.path
                );
                Ok(asset)
            }
            Err(Error::Conflict(_)) => {
                // Another writer sharing the catalog got there first.
                files.remove().await;
                self.catalog
                    .asset_by_digest(digest)
                    .await?
                    .ok_or_else(|| Error::Storage(format!("asset {digest} vanished after a conflict")))
            }
            Err(err) => {
                files.remove().await;
                Err(err)
            }
        }
    }

    async fn write_files(&self, image: &TransformedImage) -> Result<StoredFiles> {
        let day = Utc::now().format("%Y/%m/%d").to_string();
        fs::create_dir_all(self.root.join(&day)).await?;

        let stem = Uuid::new_v4();
        let extension = image.format.extension();
        let path = format!("{day}/{stem}.{extension}");
        let thumb_path = format!("{day}/{stem}_thumb.{extension}");
        let mut files = StoredFiles {
            absolute: [self.absolute(&path), self.absolute(&thumb_path)],
            path,
            thumb_path,
            bytes: 0,
        };

        let written = async {
            write_durably(&files.absolute[0], &image.full.bytes).await?;
            write_durably(&files.absolute[1], &image.thumbnail.bytes).await?;
            Ok::<_, Error>(fs::metadata(&files.absolute[0]).await?.len())
        }
        .await;

        match written {
            Ok(bytes) => {
                files.bytes = bytes;
                Ok(files)
            }
            Err(err) => {
                files.remove().await;
                Err(err)
            }
        }
    }

    async fn digest_lock(&self, digest: &str) -> Arc<Mutex<()>> {
        let mut inflight = self.inflight.lock().await;
        Arc::clone(inflight.entry(digest.to_string()).or_default())
    }

    async fn release_digest_lock(&self, digest: &str, lock: Arc<Mutex<()>>) {
        let mut inflight = self.inflight.lock().await;
        drop(lock);
        if inflight
            .get(digest)
            .is_some_and(|entry| Arc::strong_count(entry) == 1)
        {
            inflight.remove(digest);
        }
    }
}

async fn write_durably(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut file = fs::File::create(path).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    Ok(())
}
