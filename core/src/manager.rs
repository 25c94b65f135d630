//! `Manager`: the lifecycle facade threaded through every operation —
//! identity, the resource/origin/debouncer registries, startup validation,
//! promotion, removal, and the event-broadcast channels. This is the
//! `init()`/`dispose()` handle described by the programmatic surface.
//!
//! Modeled on the teacher's actor-registry shape (`ESMRegistry`,
//! `TaskRunner`'s `DashMap<LibraryUuid, Arc<Mutex<Option<RunningTask>>>>`)
//! but collapsed to direct async methods on a shared `Arc<Manager>` rather
//! than a message-passing bus — the design notes explicitly call for "an
//! explicit object threaded through operations, not a hidden global", and
//! a bus adds indirection this system doesn't need.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use common::rangeset::BLOCK_SIZE;
use common::{CacheConfig, CacheError};
use dashmap::DashMap;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::metastore::{self, DebouncedSaver};
use crate::origin::{self, OriginSource};
use crate::resource::Resource;

/// Hybrid-loop / completer fetch granularity.
pub const CHUNK: u64 = 1024 * 1024;

/// Bridges `CacheError` into the `std::io::Error` the response body stream
/// needs, for the one place (the tail of an already-started body) where a
/// mid-stream failure can't be expressed as an HTTP status anymore.
fn to_io_error(err: CacheError) -> std::io::Error {
    std::io::Error::other(err.to_string())
}

const PROGRESS_CHANNEL_CAPACITY: usize = 1024;
const FILESTAT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize)]
pub struct FileStat {
    pub origin_url: String,
    pub file_name: Option<String>,
    pub total_size: Option<u64>,
    pub mime_type: Option<String>,
    pub extension: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DownloadInfo {
    pub id: String,
    pub local_path: PathBuf,
    pub total_size: u64,
    pub is_complete: bool,
    pub progress: f64,
    pub file_name: Option<String>,
    pub origin_url: Option<String>,
}

struct CompleterHandle {
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

/// id -> everything a resource needs: the shared Resource (behind the
/// per-resource mutex), its OriginSource, and its debounce timer.
struct Entry {
    resource: Arc<Mutex<Resource>>,
    origin: Arc<dyn OriginSource>,
    saver: Arc<DebouncedSaver>,
}

pub struct Manager {
    config: CacheConfig,
    entries: DashMap<String, Entry>,
    completers: DashMap<String, CompleterHandle>,
    progress_tx: broadcast::Sender<(String, f64)>,
    filestat_tx: broadcast::Sender<FileStat>,
    http_task: Mutex<Option<JoinHandle<()>>>,
}

impl Manager {
    /// `init()`: creates the storage directory, runs startup validation
    /// (resuming in-progress resources, promoting orphaned completed
    /// ones), and starts the loopback HTTP server. There is no
    /// process-wide singleton here — the caller owns the returned handle,
    /// per the design notes' preference for an explicit object.
    #[instrument(skip(config))]
    pub async fn init(config: CacheConfig) -> Result<Arc<Self>, CacheError> {
        tokio::fs::create_dir_all(&config.storage.storage_dir)
            .await
            .map_err(|source| CacheError::StorageIo { id: "<init>".into(), source })?;
        tokio::fs::create_dir_all(config.storage.collections_dir())
            .await
            .map_err(|source| CacheError::StorageIo { id: "<init>".into(), source })?;

        let (progress_tx, _) = broadcast::channel(PROGRESS_CHANNEL_CAPACITY);
        let (filestat_tx, _) = broadcast::channel(FILESTAT_CHANNEL_CAPACITY);

        let manager = Arc::new(Manager {
            config,
            entries: DashMap::new(),
            completers: DashMap::new(),
            progress_tx,
            filestat_tx,
            http_task: Mutex::new(None),
        });

        manager.validate_storage().await;

        let http_task = crate::http::spawn_server(manager.clone()).await?;
        *manager.http_task.lock().await = Some(http_task);

        info!(port = manager.config.http.port, "cache manager initialized");
        Ok(manager)
    }

    pub fn port(&self) -> u16 {
        self.config.http.port
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn proxy_url_for(&self, origin_url: &str) -> String {
        format!(
            "http://127.0.0.1:{}/stream?url={}",
            self.config.http.port,
            percent_encoding::utf8_percent_encode(origin_url, percent_encoding::NON_ALPHANUMERIC)
        )
    }

    // ---- startup validation --------------------------------------------

    #[instrument(skip(self))]
    async fn validate_storage(&self) {
        let dir = self.config.storage.storage_dir.clone();
        let mut read_dir = match tokio::fs::read_dir(&dir).await {
            Ok(rd) => rd,
            Err(e) => {
                warn!(error = %e, "failed to read storage dir during startup validation");
                return;
            }
        };

        let mut ids = Vec::new();
        while let Ok(Some(entry)) = read_dir.next_entry().await {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(id) = name.strip_suffix(".video") {
                ids.push(id.to_string());
            }
        }

        for id in ids {
            let has_meta = metastore::exists(&dir, &id).await;
            if has_meta {
                match metastore::load(&dir, &id).await {
                    Ok(resource) => {
                        debug!(%id, "resumed resource from meta");
                        self.adopt_resumed(resource).await;
                    }
                    Err(_) => {
                        // MetaCorrupt: treat as needs-redownload, an empty
                        // cached_set against whatever total_size we can
                        // still discover. Without a total_size we cannot
                        // safely construct a Resource, so leave the data
                        // file in place and require a fresh HEAD on the
                        // next live request (ensure_resource rebuilds it).
                        warn!(%id, "meta corrupt, resource will redownload on next access");
                    }
                }
            } else {
                // no meta => already complete (promoted or delete-meta
                // step already ran). Promote now if not already promoted.
                if let Err(e) = self.promote_orphan(&id).await {
                    warn!(%id, error = %e, "failed to promote orphaned complete file");
                }
            }
        }
    }

    async fn adopt_resumed(&self, resource: Resource) {
        let id = resource.id.clone();
        let origin = match origin::build_origin_source(&resource.origin_url, &self.config) {
            Ok(o) => o,
            Err(e) => {
                warn!(%id, error = %e, "failed to rebuild origin source for resumed resource");
                return;
            }
        };
        self.entries.insert(
            id,
            Entry {
                resource: Arc::new(Mutex::new(resource)),
                origin,
                saver: Arc::new(DebouncedSaver::new()),
            },
        );
    }

    async fn promote_orphan(&self, id: &str) -> Result<(), CacheError> {
        let data_path = metastore::data_path(&self.config.storage.storage_dir, id);
        let target = self.config.storage.collections_dir().join(format!("{id}.mp4"));
        if tokio::fs::try_exists(&target).await.unwrap_or(false) {
            return Ok(());
        }
        tokio::fs::rename(&data_path, &target)
            .await
            .map_err(|source| CacheError::StorageIo { id: id.to_string(), source })?;
        info!(%id, path = %target.display(), "promoted orphaned complete file at startup");
        Ok(())
    }

    // ---- resource access --------------------------------------------

    fn resource_handle(&self, id: &str) -> Option<(Arc<Mutex<Resource>>, Arc<dyn OriginSource>, Arc<DebouncedSaver>)> {
        self.entries
            .get(id)
            .map(|e| (e.resource.clone(), e.origin.clone(), e.saver.clone()))
    }

    /// Ensures a `Resource` + `OriginSource` exist for `url`, issuing the
    /// first `HEAD` if this is the first time the id has been seen and
    /// allocating the sparse data file.
    #[instrument(skip(self))]
    pub async fn ensure_resource(&self, url: &str) -> Result<Arc<Mutex<Resource>>, CacheError> {
        let id = common::id::resource_id(url);

        if let Some((resource, _, _)) = self.resource_handle(&id) {
            return Ok(resource);
        }

        let origin = origin::build_origin_source(url, &self.config)?;
        let head = origin.head().await?;
        if head.total_size == 0 {
            return Err(CacheError::OriginUnavailable("origin reported zero length".into()));
        }

        let mut resource = Resource::new(id.clone(), url.to_string(), head.total_size);
        resource.file_name = head.file_name.clone();
        resource.mime_type = head.mime_type.clone().or_else(|| {
            let name = resource.file_name.as_deref().unwrap_or(url);
            crate::mime::guess_from_name(name)
        });

        let extension = resource.extension();

        let data_path = metastore::data_path(&self.config.storage.storage_dir, &id);
        let file = tokio::fs::File::create(&data_path)
            .await
            .map_err(|source| CacheError::StorageIo { id: id.clone(), source })?;
        file.set_len(head.total_size)
            .await
            .map_err(|source| CacheError::StorageIo { id: id.clone(), source })?;

        let resource_arc = Arc::new(Mutex::new(resource));
        self.entries.insert(
            id.clone(),
            Entry {
                resource: resource_arc.clone(),
                origin,
                saver: Arc::new(DebouncedSaver::new()),
            },
        );

        let _ = self.filestat_tx.send(FileStat {
            origin_url: url.to_string(),
            file_name: head.file_name,
            total_size: Some(head.total_size),
            mime_type: head.mime_type,
            extension: Some(extension),
        });

        Ok(resource_arc)
    }

    /// Enqueues the completer the first time a live request is seen for
    /// `id`; a no-op on subsequent calls (one completer per resource).
    pub fn note_first_request(self: &Arc<Self>, id: &str) {
        self.start_background_by_id(id);
    }

    // ---- resource introspection, shared by the hybrid loop and the completer --

    /// `(total_size, content_type)` for an id already known to the manager.
    pub async fn resource_snapshot(&self, id: &str) -> Result<(u64, String), CacheError> {
        let (resource, _, _) = self.resource_handle(id).ok_or(CacheError::NotFound)?;
        let r = resource.lock().await;
        Ok((r.total_size, r.content_type()))
    }

    /// True iff every byte of `[start, end]` is already on disk.
    pub async fn range_cached(&self, id: &str, start: u64, end: u64) -> Result<bool, CacheError> {
        let (resource, _, _) = self.resource_handle(id).ok_or(CacheError::NotFound)?;
        let mut r = resource.lock().await;
        Ok(r.cached_set.contains(start, end))
    }

    /// Nearest missing interval at or after `pos`, per `RangeSet::next_gap`.
    pub async fn next_gap(&self, id: &str, pos: u64) -> Result<Option<(u64, u64)>, CacheError> {
        let (resource, _, _) = self.resource_handle(id).ok_or(CacheError::NotFound)?;
        let mut r = resource.lock().await;
        Ok(r.cached_set.next_gap(pos))
    }

    // ---- chunked fetch/read, shared by the hybrid loop and the completer --

    /// Reads an already-cached byte range from the sparse data file.
    pub async fn read_range(&self, id: &str, start: u64, end: u64) -> Result<Bytes, CacheError> {
        let (resource, _, _) = self
            .resource_handle(id)
            .ok_or(CacheError::NotFound)?;
        let _guard = resource.lock().await;
        let path = metastore::data_path(&self.config.storage.storage_dir, id);
        let mut file = tokio::fs::File::open(&path)
            .await
            .map_err(|source| CacheError::StorageIo { id: id.to_string(), source })?;
        file.seek(SeekFrom::Start(start))
            .await
            .map_err(|source| CacheError::StorageIo { id: id.to_string(), source })?;
        let len = (end - start + 1) as usize;
        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf)
            .await
            .map_err(|source| CacheError::StorageIo { id: id.to_string(), source })?;
        Ok(Bytes::from(buf))
    }

    /// Writes one network-sized chunk to the data file at `start` and
    /// folds it into the resource's `cached_set`. The per-resource mutex
    /// is held for exactly this seek+write+insert, never across the
    /// network read that produced `chunk`.
    async fn write_chunk_and_insert(&self, id: &str, start: u64, chunk: &[u8]) -> Result<(), CacheError> {
        let (resource, _, _) = self
            .resource_handle(id)
            .ok_or(CacheError::NotFound)?;
        let path = metastore::data_path(&self.config.storage.storage_dir, id);

        let mut guard = resource.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(&path)
            .await
            .map_err(|source| CacheError::StorageIo { id: id.to_string(), source })?;
        file.seek(SeekFrom::Start(start))
            .await
            .map_err(|source| CacheError::StorageIo { id: id.to_string(), source })?;
        file.write_all(chunk)
            .await
            .map_err(|source| CacheError::StorageIo { id: id.to_string(), source })?;
        drop(file);

        let end = start + chunk.len() as u64 - 1;
        guard.cached_set.insert(start, end);
        if start == 0 {
            guard.sniff_mime(chunk);
        }
        Ok(())
    }

    /// Rounds `[start, end]` out to whole cache blocks when the resource is
    /// bitmap-backed, so a fetch/insert never claims bytes outside what was
    /// actually written as present (`rangeset::BitmapSet`'s soundness
    /// argument only holds for block-aligned insertions). A no-op for the
    /// list representation, where alignment doesn't matter.
    async fn align_to_cache_blocks(&self, id: &str, start: u64, end: u64) -> Result<(u64, u64), CacheError> {
        let (resource, _, _) = self.resource_handle(id).ok_or(CacheError::NotFound)?;
        let r = resource.lock().await;
        if !r.cached_set.is_bitmap() {
            return Ok((start, end));
        }
        let total = r.total_size;
        let aligned_start = (start / BLOCK_SIZE) * BLOCK_SIZE;
        let aligned_end = (end / BLOCK_SIZE + 1) * BLOCK_SIZE - 1;
        Ok((aligned_start, aligned_end.min(total.saturating_sub(1))))
    }

    /// Fetches `[start, end]` from the origin, tee-ing each network chunk to
    /// the data file as it arrives, and forwarding to `tx` only the bytes
    /// within `deliver` (the range the live reader actually asked for —
    /// `[start, end]` may be wider, rounded out to cache block boundaries by
    /// the caller). `tx` is `None` for the completer, which has no live
    /// reader and always fetches already block-aligned gaps.
    #[instrument(skip(self, tx))]
    pub async fn fetch_into_cache(
        self: &Arc<Self>,
        id: &str,
        start: u64,
        end: u64,
        deliver: (u64, u64),
        tx: Option<&mpsc::Sender<Result<Bytes, std::io::Error>>>,
    ) -> Result<(), CacheError> {
        let (_, origin, _) = self.resource_handle(id).ok_or(CacheError::NotFound)?;
        let mut stream = origin.fetch(start, end).await?;
        let (deliver_start, deliver_end) = deliver;

        let mut pos = start;
        while let Some(item) = stream.next().await {
            let chunk = item?;
            if chunk.is_empty() {
                continue;
            }
            self.write_chunk_and_insert(id, pos, &chunk).await?;
            let chunk_start = pos;
            let chunk_end = pos + chunk.len() as u64 - 1;
            pos += chunk.len() as u64;

            if let Some(tx) = tx {
                let send_start = chunk_start.max(deliver_start);
                let send_end = chunk_end.min(deliver_end);
                if send_start > send_end {
                    continue;
                }
                let slice = if send_start == chunk_start && send_end == chunk_end {
                    chunk
                } else {
                    let from = (send_start - chunk_start) as usize;
                    let to = (send_end - chunk_start) as usize + 1;
                    chunk.slice(from..to)
                };
                if tx.send(Ok(slice)).await.is_err() {
                    // Reader disconnected (e.g. a player seek); already-written
                    // bytes stay cached. Dropping `stream` below aborts this one
                    // fetch — don't call origin.cancel() here, it would cancel
                    // the *source*, stalling the completer and every other live
                    // request sharing it.
                    break;
                }
            }
        }

        self.schedule_save(id);
        self.publish_progress(id).await;

        if pos <= end && tx.is_none() {
            // completer only: a short read is a real failure it should
            // surface so the caller stops retrying this gap blindly.
            return Err(CacheError::OriginStreamError(format!(
                "origin stream for {id} ended at {pos}, expected through {end}"
            )));
        }
        Ok(())
    }

    /// The hybrid loop (§4.D): produces the body of one live `GET /stream`
    /// response by alternating cached-range reads and origin fetches in
    /// `CHUNK`-sized windows, sending every byte that reaches the player
    /// down `tx` in strict offset order. Runs as its own task so the HTTP
    /// handler can return the response head as soon as it's computed.
    #[instrument(skip(self, tx))]
    pub async fn serve_hybrid(
        self: &Arc<Self>,
        id: &str,
        start: u64,
        end: u64,
        tx: mpsc::Sender<Result<Bytes, std::io::Error>>,
    ) {
        let mut pos = start;
        while pos <= end {
            let win_end = (pos + CHUNK - 1).min(end);

            let cached = match self.range_cached(id, pos, win_end).await {
                Ok(c) => c,
                Err(e) => {
                    let _ = tx.send(Err(to_io_error(e))).await;
                    return;
                }
            };

            if cached {
                match self.read_range(id, pos, win_end).await {
                    Ok(bytes) => {
                        if tx.send(Ok(bytes)).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        warn!(%id, error = %e, "hybrid loop cached read failed");
                        let _ = tx.send(Err(to_io_error(e))).await;
                        return;
                    }
                }
            } else {
                let (fetch_start, fetch_end) = match self.align_to_cache_blocks(id, pos, win_end).await {
                    Ok(range) => range,
                    Err(e) => {
                        let _ = tx.send(Err(to_io_error(e))).await;
                        return;
                    }
                };
                if let Err(e) = self
                    .fetch_into_cache(id, fetch_start, fetch_end, (pos, win_end), Some(&tx))
                    .await
                {
                    warn!(%id, error = %e, "hybrid loop origin fetch failed");
                    let _ = tx.send(Err(to_io_error(e))).await;
                    return;
                }
            }

            pos = win_end + 1;
        }

        self.schedule_save(id);
        self.publish_progress(id).await;
        if let Err(e) = self.maybe_promote_if_complete(id).await {
            warn!(%id, error = %e, "failed to promote after live serve completed the file");
        }
    }

    pub fn schedule_save(&self, id: &str) {
        let Some((resource, _, saver)) = self.resource_handle(id) else { return };
        let storage_dir = self.config.storage.storage_dir.clone();
        let id = id.to_string();
        tokio::spawn(async move {
            saver
                .schedule(async move {
                    let mut r = resource.lock().await;
                    if let Err(e) = metastore::save(&storage_dir, &mut r).await {
                        warn!(%id, error = %e, "debounced save failed");
                    }
                })
                .await;
        });
    }

    async fn flush_save_now(&self, id: &str) {
        let Some((resource, _, saver)) = self.resource_handle(id) else { return };
        let storage_dir = self.config.storage.storage_dir.clone();
        saver
            .flush_now(async move {
                let mut r = resource.lock().await;
                if let Err(e) = metastore::save(&storage_dir, &mut r).await {
                    warn!(%id, error = %e, "forced save failed");
                }
            })
            .await;
    }

    pub async fn publish_progress(&self, id: &str) {
        let Some((resource, _, _)) = self.resource_handle(id) else { return };
        let mut r = resource.lock().await;
        let progress = r.progress();
        let url = r.origin_url.clone();
        drop(r);
        let _ = self.progress_tx.send((url, progress));
    }

    pub fn progress_stream(&self) -> broadcast::Receiver<(String, f64)> {
        self.progress_tx.subscribe()
    }

    pub fn file_stats_stream(&self) -> broadcast::Receiver<FileStat> {
        self.filestat_tx.subscribe()
    }

    pub async fn progress_for(&self, url: &str) -> Result<f64, CacheError> {
        let id = common::id::resource_id(url);
        let (resource, _, _) = self.resource_handle(&id).ok_or(CacheError::NotFound)?;
        Ok(resource.lock().await.progress())
    }

    // ---- background completion ------------------------------------------

    pub fn start_background(self: &Arc<Self>, url: &str) {
        let id = common::id::resource_id(url);
        self.start_background_by_id(&id);
    }

    fn start_background_by_id(self: &Arc<Self>, id: &str) {
        if self.completers.contains_key(id) {
            return;
        }
        if self.resource_handle(id).is_none() {
            return;
        }

        let cancel = CancellationToken::new();
        let manager = self.clone();
        let task_id = id.to_string();
        let task_cancel = cancel.clone();
        let join = tokio::spawn(async move {
            crate::completer::run(manager, task_id, task_cancel).await;
        });

        self.completers.insert(id.to_string(), CompleterHandle { cancel, join });
    }

    pub fn stop_background(&self, url: &str) {
        let id = common::id::resource_id(url);
        self.stop_background_by_id(&id);
    }

    fn stop_background_by_id(&self, id: &str) {
        if let Some((_, handle)) = self.completers.remove(id) {
            handle.cancel.cancel();
        }
    }

    /// Starts a completer for every known resource that isn't complete and
    /// doesn't already have one running.
    pub async fn resume_all(self: &Arc<Self>) {
        let ids: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            let Some((resource, _, _)) = self.resource_handle(&id) else { continue };
            let complete = resource.lock().await.is_complete();
            if !complete {
                self.start_background_by_id(&id);
            }
        }
    }

    pub fn cancel(&self, url: &str) {
        let id = common::id::resource_id(url);
        self.stop_background_by_id(&id);
        if let Some((_, origin, _)) = self.resource_handle(&id) {
            origin.cancel();
        }
    }

    pub(crate) fn completer_finished(&self, id: &str) {
        self.completers.remove(id);
    }

    // ---- promotion / removal ---------------------------------------------

    /// Promotes a completed resource: deletes its meta file, moves the data
    /// file to its `promotion_target` or `<collections>/<id>.<ext>`, and
    /// drops it from the active map. Returns `Ok(false)` (not an error)
    /// when the destination already exists.
    #[instrument(skip(self))]
    pub async fn promote(&self, id: &str) -> Result<bool, CacheError> {
        let Some((resource, origin, _)) = self.resource_handle(id) else {
            return Err(CacheError::NotFound);
        };

        let (target, storage_dir) = {
            let r = resource.lock().await;
            let target = r
                .promotion_target
                .clone()
                .unwrap_or_else(|| self.config.storage.collections_dir().join(format!("{}.{}", r.id, r.extension())));
            (target, self.config.storage.storage_dir.clone())
        };

        if tokio::fs::try_exists(&target).await.unwrap_or(false) {
            return Ok(false);
        }

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| CacheError::StorageIo { id: id.to_string(), source })?;
        }

        let data_path = metastore::data_path(&storage_dir, id);
        tokio::fs::rename(&data_path, &target)
            .await
            .map_err(|source| CacheError::StorageIo { id: id.to_string(), source })?;
        metastore::delete(&storage_dir, id)
            .await
            .map_err(|source| CacheError::StorageIo { id: id.to_string(), source })?;

        origin.dispose().await;
        self.stop_background_by_id(id);
        self.entries.remove(id);

        info!(%id, path = %target.display(), "promoted completed resource");
        Ok(true)
    }

    pub async fn maybe_promote_if_complete(&self, id: &str) -> Result<bool, CacheError> {
        let Some((resource, _, _)) = self.resource_handle(id) else {
            return Ok(false);
        };
        let complete = resource.lock().await.is_complete();
        if complete {
            self.promote(id).await
        } else {
            Ok(false)
        }
    }

    #[instrument(skip(self))]
    pub async fn remove_by_id(&self, id: &str) -> Result<(), CacheError> {
        self.stop_background_by_id(id);
        if let Some((_, origin, _)) = self.resource_handle(id) {
            origin.cancel();
            origin.dispose().await;
        }
        self.entries.remove(id);

        let storage_dir = &self.config.storage.storage_dir;
        let _ = tokio::fs::remove_file(metastore::data_path(storage_dir, id)).await;
        metastore::delete(storage_dir, id).await.ok();

        let collections = self.config.storage.collections_dir();
        if let Ok(mut rd) = tokio::fs::read_dir(&collections).await {
            while let Ok(Some(entry)) = rd.next_entry().await {
                let name = entry.file_name();
                let name = name.to_string_lossy();
                if name.rsplit_once('.').map(|(stem, _)| stem) == Some(id) {
                    let _ = tokio::fs::remove_file(entry.path()).await;
                }
            }
        }

        Ok(())
    }

    pub async fn remove_by_url(&self, url: &str) -> Result<(), CacheError> {
        self.remove_by_id(&common::id::resource_id(url)).await
    }

    #[instrument(skip(self))]
    pub async fn clear_all(&self) -> Result<(), CacheError> {
        let ids: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.remove_by_id(&id).await?;
        }

        let storage_dir = self.config.storage.storage_dir.clone();
        if let Ok(mut rd) = tokio::fs::read_dir(&storage_dir).await {
            while let Ok(Some(entry)) = rd.next_entry().await {
                let _ = tokio::fs::remove_file(entry.path()).await;
            }
        }
        Ok(())
    }

    pub async fn list_all(&self) -> Vec<DownloadInfo> {
        let mut out = Vec::new();
        for entry in self.entries.iter() {
            let id = entry.key().clone();
            let mut r = entry.value().resource.lock().await;
            out.push(DownloadInfo {
                id: id.clone(),
                local_path: metastore::data_path(&self.config.storage.storage_dir, &id),
                total_size: r.total_size,
                is_complete: r.is_complete(),
                progress: r.progress(),
                file_name: r.file_name.clone(),
                origin_url: Some(r.origin_url.clone()),
            });
        }
        out
    }

    // ---- export / move / retarget -----------------------------------------

    pub async fn export(&self, url: &str, target: &Path) -> Result<bool, CacheError> {
        self.export_by_id(&common::id::resource_id(url), target).await
    }

    pub async fn export_by_id(&self, id: &str, target: &Path) -> Result<bool, CacheError> {
        let Some((resource, _, _)) = self.resource_handle(id) else {
            return Err(CacheError::NotFound);
        };
        if !resource.lock().await.is_complete() {
            return Ok(false);
        }
        let data_path = metastore::data_path(&self.config.storage.storage_dir, id);
        tokio::fs::copy(&data_path, target)
            .await
            .map_err(|source| CacheError::StorageIo { id: id.to_string(), source })?;
        Ok(true)
    }

    pub async fn move_to(&self, url: &str, target: &Path) -> Result<bool, CacheError> {
        self.move_by_id(&common::id::resource_id(url), target).await
    }

    pub async fn move_by_id(&self, id: &str, target: &Path) -> Result<bool, CacheError> {
        let Some((resource, origin, _)) = self.resource_handle(id) else {
            return Err(CacheError::NotFound);
        };
        if !resource.lock().await.is_complete() {
            return Ok(false);
        }
        let data_path = metastore::data_path(&self.config.storage.storage_dir, id);
        tokio::fs::rename(&data_path, target)
            .await
            .map_err(|source| CacheError::StorageIo { id: id.to_string(), source })?;
        metastore::delete(&self.config.storage.storage_dir, id).await.ok();
        origin.dispose().await;
        self.stop_background_by_id(id);
        self.entries.remove(id);
        Ok(true)
    }

    pub async fn export_auto_name(&self, url: &str, dir: &Path) -> Result<Option<PathBuf>, CacheError> {
        let id = common::id::resource_id(url);
        let Some((resource, _, _)) = self.resource_handle(&id) else {
            return Err(CacheError::NotFound);
        };
        let name = resource.lock().await.suggested_name();
        let target = dir.join(name);
        if self.export_by_id(&id, &target).await? {
            Ok(Some(target))
        } else {
            Ok(None)
        }
    }

    pub async fn move_auto_name(&self, url: &str, dir: &Path) -> Result<Option<PathBuf>, CacheError> {
        let id = common::id::resource_id(url);
        let Some((resource, _, _)) = self.resource_handle(&id) else {
            return Err(CacheError::NotFound);
        };
        let name = resource.lock().await.suggested_name();
        let target = dir.join(name);
        if self.move_by_id(&id, &target).await? {
            Ok(Some(target))
        } else {
            Ok(None)
        }
    }

    pub async fn set_target(&self, url: &str, path: PathBuf) -> Result<(), CacheError> {
        self.set_target_by_id(&common::id::resource_id(url), path).await
    }

    pub async fn set_target_by_id(&self, id: &str, path: PathBuf) -> Result<(), CacheError> {
        let (resource, _, _) = self.resource_handle(id).ok_or(CacheError::NotFound)?;
        resource.lock().await.promotion_target = Some(path);
        self.schedule_save(id);
        Ok(())
    }

    /// Stops every completer, flushes every pending save synchronously,
    /// and joins the HTTP listener task. Idempotent-ish: calling twice on
    /// an already-disposed manager is harmless (everything is already
    /// empty/aborted).
    #[instrument(skip(self))]
    pub async fn dispose(&self) {
        let ids: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        for id in &ids {
            self.stop_background_by_id(id);
            if let Some((_, origin, _)) = self.resource_handle(id) {
                origin.cancel();
                origin.dispose().await;
            }
            self.flush_save_now(id).await;
        }

        if let Some(handle) = self.http_task.lock().await.take() {
            handle.abort();
        }

        info!("cache manager disposed");
    }
}
