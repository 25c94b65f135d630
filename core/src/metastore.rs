//! Durable on-disk projection of a `Resource`: the `<id>.meta` file, its two
//! on-disk layouts, and the debounced save policy.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use common::rangeset::Interval;
use common::{CacheError, RangeSet};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{instrument, warn};

use crate::resource::Resource;

/// A save is (re)scheduled on every mutation and fires this long after the
/// last one, unless forced sooner by completion/pause/shutdown.
pub const SAVE_DEBOUNCE: Duration = Duration::from_millis(750);

#[derive(Serialize, Deserialize)]
struct RangeEntry {
    start: u64,
    end: u64,
}

#[derive(Serialize, Deserialize)]
struct MetaHeader {
    id: String,
    #[serde(rename = "totalSize")]
    total_size: u64,
    #[serde(rename = "originalUrl")]
    original_url: String,
    #[serde(rename = "mimeType")]
    mime_type: Option<String>,
    #[serde(rename = "fileName")]
    file_name: Option<String>,
    #[serde(rename = "targetPath")]
    target_path: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct MetaJsonList {
    #[serde(flatten)]
    header: MetaHeader,
    ranges: Vec<RangeEntry>,
}

fn meta_path(storage_dir: &Path, id: &str) -> PathBuf {
    storage_dir.join(format!("{id}.meta"))
}

pub fn data_path(storage_dir: &Path, id: &str) -> PathBuf {
    storage_dir.join(format!("{id}.video"))
}

/// Serializes a `Resource`'s attributes and `cached_set` into the on-disk
/// bytes for its meta file, picking the layout that matches the
/// representation `cached_set` already settled on.
fn encode(resource: &mut Resource) -> Vec<u8> {
    let header = MetaHeader {
        id: resource.id.clone(),
        total_size: resource.total_size,
        original_url: resource.origin_url.clone(),
        mime_type: resource.mime_type.clone(),
        file_name: resource.file_name.clone(),
        target_path: resource
            .promotion_target
            .as_ref()
            .map(|p| p.to_string_lossy().to_string()),
    };

    if let Some(intervals) = resource.cached_set.list_intervals() {
        let doc = MetaJsonList {
            header,
            ranges: intervals
                .into_iter()
                .map(|iv| RangeEntry { start: iv.start, end: iv.end })
                .collect(),
        };
        serde_json::to_vec(&doc).expect("meta json serialization cannot fail")
    } else {
        let header_bytes = serde_json::to_vec(&header).expect("meta json serialization cannot fail");
        let bitmap = resource.cached_set.bitmap_bytes().expect("non-list RangeSet must be bitmap");
        let mut buf = Vec::with_capacity(4 + header_bytes.len() + bitmap.len());
        buf.extend_from_slice(&(header_bytes.len() as u32).to_be_bytes());
        buf.extend_from_slice(&header_bytes);
        buf.extend_from_slice(bitmap);
        buf
    }
}

/// Parses the bytes of a meta file back into a `Resource`. Tries the list
/// (pure-JSON) layout first; a parse failure there means it must be the
/// bitmap layout (whose length-prefixed binary header bytes will not, in
/// practice, also happen to be valid JSON).
fn decode(id: &str, bytes: &[u8]) -> Result<Resource, CacheError> {
    if let Ok(doc) = serde_json::from_slice::<MetaJsonList>(bytes) {
        let mut resource = Resource::new(doc.header.id, doc.header.original_url, doc.header.total_size);
        resource.mime_type = doc.header.mime_type;
        resource.file_name = doc.header.file_name;
        resource.promotion_target = doc.header.target_path.map(PathBuf::from);
        let intervals = doc
            .ranges
            .into_iter()
            .map(|r| Interval { start: r.start, end: r.end })
            .collect();
        resource.cached_set = RangeSet::from_intervals(resource.total_size, intervals);
        return Ok(resource);
    }

    if bytes.len() < 4 {
        return Err(CacheError::MetaCorrupt {
            id: id.to_string(),
            reason: "file too short for bitmap header".into(),
        });
    }
    let header_len = u32::from_be_bytes(bytes[0..4].try_into().unwrap()) as usize;
    let header_bytes = bytes.get(4..4 + header_len).ok_or_else(|| CacheError::MetaCorrupt {
        id: id.to_string(),
        reason: "bitmap header length exceeds file size".into(),
    })?;
    let header: MetaHeader = serde_json::from_slice(header_bytes).map_err(|e| CacheError::MetaCorrupt {
        id: id.to_string(),
        reason: format!("bitmap header is not valid json: {e}"),
    })?;

    let bitmap_bytes = bytes[4 + header_len..].to_vec();
    let mut resource = Resource::new(header.id, header.original_url, header.total_size);
    resource.mime_type = header.mime_type;
    resource.file_name = header.file_name;
    resource.promotion_target = header.target_path.map(PathBuf::from);
    resource.cached_set = RangeSet::from_bitmap_bytes(resource.total_size, bitmap_bytes);
    Ok(resource)
}

/// Writes the meta file for `resource` atomically (write-then-rename), so a
/// crash mid-write never leaves a half-written `.meta` behind.
#[instrument(skip(resource), fields(id = %resource.id))]
pub async fn save(storage_dir: &Path, resource: &mut Resource) -> Result<(), CacheError> {
    let bytes = encode(resource);
    let path = meta_path(storage_dir, &resource.id);
    let tmp_path = storage_dir.join(format!("{}.meta.tmp", resource.id));

    tokio::fs::write(&tmp_path, &bytes)
        .await
        .map_err(|source| CacheError::StorageIo { id: resource.id.clone(), source })?;
    tokio::fs::rename(&tmp_path, &path)
        .await
        .map_err(|source| CacheError::StorageIo { id: resource.id.clone(), source })?;
    Ok(())
}

/// Loads a `<id>.meta` file. A malformed file is logged and reported as
/// `MetaCorrupt`; callers treat that the same as "no meta" (empty
/// `cached_set`), per §4.B.
#[instrument(skip_all, fields(id))]
pub async fn load(storage_dir: &Path, id: &str) -> Result<Resource, CacheError> {
    let path = meta_path(storage_dir, id);
    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|source| CacheError::StorageIo { id: id.to_string(), source })?;

    match decode(id, &bytes) {
        Ok(resource) => Ok(resource),
        Err(err) => {
            warn!(%id, error = %err, "meta file corrupt, treating resource as needs-redownload");
            Err(err)
        }
    }
}

pub async fn delete(storage_dir: &Path, id: &str) -> std::io::Result<()> {
    let path = meta_path(storage_dir, id);
    match tokio::fs::remove_file(&path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

pub async fn exists(storage_dir: &Path, id: &str) -> bool {
    tokio::fs::try_exists(meta_path(storage_dir, id)).await.unwrap_or(false)
}

/// One pending save timer per resource; (re)scheduling cancels the prior
/// timer (teacher's oneshot-cancel/abort_handle idea, here collapsed into
/// a single `JoinHandle::abort`).
pub struct DebouncedSaver {
    pending: Mutex<Option<JoinHandle<()>>>,
    delay: Duration,
}

impl DebouncedSaver {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(None),
            delay: SAVE_DEBOUNCE,
        }
    }

    /// Schedules `save_fn` to run after the debounce delay, cancelling any
    /// previously pending save for this resource.
    pub async fn schedule<F>(self: &Arc<Self>, save_fn: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let mut guard = self.pending.lock().await;
        if let Some(handle) = guard.take() {
            handle.abort();
        }
        let delay = self.delay;
        *guard = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            save_fn.await;
        }));
    }

    /// Cancels any pending timer and runs `save_fn` immediately. Used on
    /// completion, pause, and `dispose()`.
    pub async fn flush_now<F>(&self, save_fn: F)
    where
        F: std::future::Future<Output = ()>,
    {
        let mut guard = self.pending.lock().await;
        if let Some(handle) = guard.take() {
            handle.abort();
        }
        save_fn.await;
    }
}

impl Default for DebouncedSaver {
    fn default() -> Self {
        Self::new()
    }
}
