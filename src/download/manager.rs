//! The download manager: public surface of the engine.
//!
//! Owns the queue, the busy-worker table and the slow-worker map behind a
//! single lock, so every state mutation — worker data acks, first-response
//! layout decisions, stall restarts, completion — runs serialized while
//! the workers' network I/O proceeds concurrently.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{self, HeaderMap};
use tokio::sync::{oneshot, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::auth::CookieStore;
use crate::resolver::HandlerRegistry;

use super::assembler::{FileAssembler, WriteAck};
use super::chunk::{ChunkCheckpoint, ChunkJob, ChunkState, Chunkable};
use super::constants::{
    CONNECT_TIMEOUT, MIN_CHUNK_SIZE, SLOW_WORKER_TOLERANCE, SPEED_WINDOW_SECS,
    STALL_RESTART_WINDOW,
};
use super::error::DownloadError;
use super::filename::{
    filename_from_url, reserve_unique_name, sanitize_filename, split_referer, FileExistsCb,
    RedownloadMode,
};
use super::speed::{SpeedCalculator, WorkerHealth};
use super::throttle::{BandwidthFn, BandwidthThrottle};
use super::worker::{
    spawn_worker, JobSpec, ResponseInfo, WorkerContext, WorkerHandle, WorkerOutcome, WorkerSink,
};
use super::WorkerId;

/// Default user agent when the caller supplies none.
const DEFAULT_USER_AGENT: &str = concat!("downpour/", env!("CARGO_PKG_VERSION"));

/// Snapshot delivered to the caller's progress callback.
#[derive(Debug, Clone)]
pub struct ProgressUpdate {
    /// Caller identifier of the download.
    pub id: String,
    /// Bytes durably accepted by the assembler.
    pub received: u64,
    /// Total size, once a server disclosed it.
    pub total_size: Option<u64>,
    /// Persistable chunk snapshots; present only on synced acks.
    pub chunks: Option<Vec<ChunkCheckpoint>>,
    /// Whether the server honours range requests.
    pub chunkable: Chunkable,
    /// The download's input URLs.
    pub urls: Vec<String>,
    /// Current on-disk path of the partial file.
    pub file_path: PathBuf,
}

/// Per-download progress callback.
pub type ProgressCb = Arc<dyn Fn(ProgressUpdate) + Send + Sync>;

/// Aggregate speed sink, fed once a second with bytes/second.
pub type SpeedCb = Arc<dyn Fn(u64) + Send + Sync>;

/// Terminal report of a download.
#[derive(Debug)]
pub struct DownloadOutcome {
    /// Final path of the file on disk.
    pub file_path: PathBuf,
    /// Response headers of the first response, when any arrived.
    pub headers: Option<HeaderMap>,
    /// Checkpoints for every chunk that still owes bytes; feed these to
    /// `resume` to continue.
    pub unfinished_chunks: Vec<ChunkCheckpoint>,
    /// Whether any chunk ended prematurely.
    pub had_errors: bool,
    /// Best-known total size.
    pub size: u64,
}

/// Awaits a download's terminal callback.
#[derive(Debug)]
pub struct CompletionHandle {
    rx: oneshot::Receiver<Result<DownloadOutcome, DownloadError>>,
}

impl CompletionHandle {
    /// Waits for the download to finish or fail.
    ///
    /// # Errors
    ///
    /// The download's failure, or [`DownloadError::ProcessCanceled`] when
    /// the manager was dropped first.
    pub async fn wait(self) -> Result<DownloadOutcome, DownloadError> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(DownloadError::process_canceled("download manager shut down")),
        }
    }
}

/// A new download job.
#[derive(Clone)]
pub struct DownloadRequest {
    /// Opaque caller identifier.
    pub id: String,
    /// Mirror URLs, each optionally suffixed `<referer`.
    pub urls: Vec<String>,
    /// Preferred filename; derived from the first URL when absent.
    pub filename: Option<String>,
    /// Destination directory; the manager default when absent.
    pub dest_path: Option<PathBuf>,
    /// Collision policy for the reserved filename.
    pub redownload: RedownloadMode,
    /// Per-download progress callback.
    pub progress: Option<ProgressCb>,
}

impl DownloadRequest {
    /// A request with defaults for everything but id and URLs.
    #[must_use]
    pub fn new(id: impl Into<String>, urls: Vec<String>) -> Self {
        Self {
            id: id.into(),
            urls,
            filename: None,
            dest_path: None,
            redownload: RedownloadMode::default(),
            progress: None,
        }
    }

    /// Sets the preferred filename.
    #[must_use]
    pub fn filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    /// Sets the destination directory.
    #[must_use]
    pub fn dest_path(mut self, dest: impl Into<PathBuf>) -> Self {
        self.dest_path = Some(dest.into());
        self
    }

    /// Sets the collision policy.
    #[must_use]
    pub fn redownload(mut self, mode: RedownloadMode) -> Self {
        self.redownload = mode;
        self
    }

    /// Sets the progress callback.
    #[must_use]
    pub fn progress(mut self, progress: ProgressCb) -> Self {
        self.progress = Some(progress);
        self
    }
}

/// A download rebuilt from persisted chunk checkpoints.
#[derive(Clone)]
pub struct ResumeRequest {
    /// Opaque caller identifier.
    pub id: String,
    /// The partial file on disk.
    pub file_path: PathBuf,
    /// Mirror URLs.
    pub urls: Vec<String>,
    /// Bytes already durable in the partial file.
    pub received: u64,
    /// Total size, when known at pause time.
    pub size: Option<u64>,
    /// Checkpoints returned by `pause` (or the completion callback).
    pub chunks: Vec<ChunkCheckpoint>,
    /// Per-download progress callback.
    pub progress: Option<ProgressCb>,
}

/// Manager configuration.
#[derive(Clone)]
pub struct DownloadManagerConfig {
    /// Default destination directory.
    pub download_path: PathBuf,
    /// Worker slots shared across all downloads.
    pub max_workers: usize,
    /// Upper bound on chunks per download (further capped by
    /// `max_workers`).
    pub max_chunks: usize,
    /// User-Agent header for every request.
    pub user_agent: String,
    /// Global bandwidth ceiling, polled; `None` or zero = unlimited.
    pub max_bandwidth: Option<BandwidthFn>,
    /// Aggregate speed sink, fed once a second.
    pub speed_cb: Option<SpeedCb>,
    /// Collision prompt for `redownload = ask`.
    pub file_exists_cb: Option<FileExistsCb>,
    /// Host cookie store consulted per request URL.
    pub cookies: Option<Arc<CookieStore>>,
}

impl DownloadManagerConfig {
    /// Defaults: four workers, four chunks, stock user agent, no
    /// throttle.
    #[must_use]
    pub fn new(download_path: impl Into<PathBuf>) -> Self {
        Self {
            download_path: download_path.into(),
            max_workers: 4,
            max_chunks: 4,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            max_bandwidth: None,
            speed_cb: None,
            file_exists_cb: None,
            cookies: None,
        }
    }
}

struct BusySlot {
    download_id: String,
    handle: WorkerHandle,
}

struct RunningDownload {
    id: String,
    urls: Vec<String>,
    temp_path: PathBuf,
    final_path: Option<PathBuf>,
    orig_name: String,
    size: Option<u64>,
    received: u64,
    chunks: Vec<ChunkJob>,
    chunkable: Chunkable,
    started: Instant,
    headers: Option<HeaderMap>,
    assembler: Option<Arc<FileAssembler>>,
    progress_cb: Option<ProgressCb>,
    completion_tx: Option<oneshot::Sender<Result<DownloadOutcome, DownloadError>>>,
    error: bool,
}

#[derive(Default)]
struct ManagerState {
    queue: Vec<RunningDownload>,
    busy: HashMap<WorkerId, BusySlot>,
    slow: HashMap<WorkerId, u32>,
    next_worker_id: WorkerId,
}

struct ManagerInner {
    cfg: DownloadManagerConfig,
    registry: Arc<HandlerRegistry>,
    client: reqwest::Client,
    throttle: BandwidthThrottle,
    speed: SpeedCalculator,
    state: Mutex<ManagerState>,
    /// Back-reference handed to spawned workers as their sink.
    self_ref: Weak<ManagerInner>,
}

/// Parallel, resumable, chunked download manager.
///
/// Cloning shares the same queue and worker pool. Construction must
/// happen inside a tokio runtime (the speed ticker is spawned on it).
#[derive(Clone)]
pub struct DownloadManager {
    inner: Arc<ManagerInner>,
}

impl DownloadManager {
    /// Creates a manager with the given configuration and protocol
    /// handlers.
    ///
    /// # Errors
    ///
    /// [`DownloadError::DataInvalid`] for a zero worker or chunk limit,
    /// [`DownloadError::ClientBuild`] when the HTTP client cannot be
    /// constructed.
    pub fn new(
        cfg: DownloadManagerConfig,
        registry: HandlerRegistry,
    ) -> Result<Self, DownloadError> {
        if cfg.max_workers == 0 {
            return Err(DownloadError::data_invalid("max_workers must be at least 1"));
        }
        if cfg.max_chunks == 0 {
            return Err(DownloadError::data_invalid("max_chunks must be at least 1"));
        }

        // Redirects are followed manually and connections are not reused
        // across requests.
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .pool_max_idle_per_host(0)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(DownloadError::ClientBuild)?;

        let throttle = match &cfg.max_bandwidth {
            Some(max_bandwidth) => BandwidthThrottle::new(Arc::clone(max_bandwidth)),
            None => BandwidthThrottle::unlimited(),
        };

        debug!(
            max_workers = cfg.max_workers,
            max_chunks = cfg.max_chunks,
            throttled = cfg.max_bandwidth.is_some(),
            "creating download manager"
        );

        let inner = Arc::new_cyclic(|self_ref| ManagerInner {
            cfg,
            registry: Arc::new(registry),
            client,
            throttle,
            speed: SpeedCalculator::new(SPEED_WINDOW_SECS),
            state: Mutex::new(ManagerState::default()),
            self_ref: self_ref.clone(),
        });

        spawn_speed_ticker(&inner);

        Ok(Self { inner })
    }

    /// Enqueues a new download and kicks the scheduler.
    ///
    /// The returned handle resolves when the download finishes or fails;
    /// `stop`, `pause` and progress reporting run independently of it.
    ///
    /// # Errors
    ///
    /// [`DownloadError::DataInvalid`] for an empty URL list or
    /// unparseable first URL; reservation errors per the `redownload`
    /// policy; [`DownloadError::Io`] when the destination cannot be
    /// created.
    #[instrument(skip(self, request), fields(id = %request.id))]
    pub async fn enqueue(
        &self,
        request: DownloadRequest,
    ) -> Result<CompletionHandle, DownloadError> {
        if request.urls.is_empty() {
            return Err(DownloadError::data_invalid("no download urls supplied"));
        }

        let (base_url, _) = split_referer(&request.urls[0]);
        let parsed = Url::parse(base_url)
            .map_err(|_| DownloadError::data_invalid(format!("unparseable url: {base_url}")))?;
        let name_template = request
            .filename
            .clone()
            .unwrap_or_else(|| filename_from_url(&parsed));

        let dest = request
            .dest_path
            .clone()
            .unwrap_or_else(|| self.inner.cfg.download_path.clone());
        tokio::fs::create_dir_all(&dest)
            .await
            .map_err(|error| DownloadError::io(dest.clone(), error))?;

        let temp_path = reserve_unique_name(
            &dest,
            &name_template,
            request.redownload,
            self.inner.cfg.file_exists_cb.as_ref(),
        )
        .await?;

        let (tx, rx) = oneshot::channel();
        let download = RunningDownload {
            id: request.id.clone(),
            urls: request.urls.clone(),
            orig_name: sanitize_filename(&name_template),
            temp_path,
            final_path: None,
            size: None,
            received: 0,
            chunks: vec![ChunkJob::new(&request.urls[0], 0, MIN_CHUNK_SIZE, true)],
            chunkable: Chunkable::Unknown,
            started: Instant::now(),
            headers: None,
            assembler: None,
            progress_cb: request.progress.clone(),
            completion_tx: Some(tx),
            error: false,
        };

        info!(path = %download.temp_path.display(), "download enqueued");

        let callback = download
            .progress_cb
            .clone()
            .map(|cb| (cb, progress_update(&download, false)));
        {
            let mut state = self.inner.state.lock().await;
            state.queue.push(download);
        }
        if let Some((cb, update)) = callback {
            cb(update);
        }

        self.inner.tick().await;
        Ok(CompletionHandle { rx })
    }

    /// Rebuilds a download from persisted checkpoints and schedules it.
    ///
    /// # Errors
    ///
    /// [`DownloadError::ProcessCanceled`] when no unfinished chunks
    /// remain, [`DownloadError::DataInvalid`] for an empty URL list.
    #[instrument(skip(self, request), fields(id = %request.id))]
    pub async fn resume(&self, request: ResumeRequest) -> Result<CompletionHandle, DownloadError> {
        if request.urls.is_empty() {
            return Err(DownloadError::data_invalid("no download urls supplied"));
        }
        if request.chunks.is_empty() {
            return Err(DownloadError::process_canceled("no unfinished chunks"));
        }

        let chunks: Vec<ChunkJob> = request
            .chunks
            .iter()
            .enumerate()
            .map(|(index, checkpoint)| ChunkJob::from_checkpoint(checkpoint, index == 0))
            .collect();

        let orig_name = request
            .file_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        let (tx, rx) = oneshot::channel();
        let download = RunningDownload {
            id: request.id.clone(),
            urls: request.urls.clone(),
            temp_path: request.file_path.clone(),
            final_path: None,
            orig_name,
            size: request.size,
            received: request.received,
            chunks,
            chunkable: Chunkable::Unknown,
            started: Instant::now(),
            headers: None,
            assembler: None,
            progress_cb: request.progress.clone(),
            completion_tx: Some(tx),
            error: false,
        };

        info!(path = %download.temp_path.display(), received = download.received, "download resumed");

        let callback = download
            .progress_cb
            .clone()
            .map(|cb| (cb, progress_update(&download, false)));
        {
            let mut state = self.inner.state.lock().await;
            state.queue.push(download);
        }
        if let Some((cb, update)) = callback {
            cb(update);
        }

        self.inner.tick().await;
        Ok(CompletionHandle { rx })
    }

    /// Cancels a download. Running workers are aborted; the terminal
    /// callback fires once their shutdown completes. Returns whether the
    /// id was known.
    #[instrument(skip(self))]
    pub async fn stop(&self, id: &str) -> bool {
        let mut state = self.inner.state.lock().await;
        let Some(index) = state.queue.iter().position(|d| d.id == id) else {
            return false;
        };

        let never_started = state.queue[index].assembler.is_none()
            && state.queue[index]
                .chunks
                .iter()
                .all(|chunk| chunk.state == ChunkState::Init);
        if never_started {
            let mut download = state.queue.remove(index);
            info!("download stopped before any chunk started");
            if let Some(tx) = download.completion_tx.take() {
                let _ = tx.send(Err(DownloadError::UserCanceled));
            }
            return true;
        }

        let mut worker_ids = Vec::new();
        {
            let download = &mut state.queue[index];
            for chunk in &mut download.chunks {
                if chunk.state == ChunkState::Init {
                    chunk.state = ChunkState::Finished;
                }
                if chunk.state == ChunkState::Running {
                    if let Some(worker_id) = chunk.worker_id {
                        worker_ids.push(worker_id);
                    }
                }
            }
        }
        info!(workers = worker_ids.len(), "stopping download");
        for worker_id in &worker_ids {
            if let Some(slot) = state.busy.get(worker_id) {
                slot.handle.cancel();
            }
        }
        if worker_ids.is_empty() {
            self.inner.maybe_complete(&mut state, index).await;
        }
        true
    }

    /// Pauses a download and returns the checkpoints to persist.
    ///
    /// The checkpoint list reflects the confirmed (durable) counters at
    /// the time of the call; the in-flight shutdown completes
    /// asynchronously and the terminal callback then reports the same
    /// chunks as unfinished.
    #[instrument(skip(self))]
    pub async fn pause(&self, id: &str) -> Vec<ChunkCheckpoint> {
        let mut state = self.inner.state.lock().await;
        let Some(index) = state.queue.iter().position(|d| d.id == id) else {
            return Vec::new();
        };

        let mut checkpoints = Vec::new();
        let mut worker_ids = Vec::new();
        {
            let download = &mut state.queue[index];
            for chunk in &mut download.chunks {
                if chunk.state == ChunkState::Init {
                    chunk.state = ChunkState::Paused;
                }
                if chunk.is_unfinished() {
                    checkpoints.push(chunk.checkpoint());
                }
                if chunk.state == ChunkState::Running {
                    if let Some(worker_id) = chunk.worker_id {
                        worker_ids.push(worker_id);
                    }
                }
            }
        }
        info!(workers = worker_ids.len(), chunks = checkpoints.len(), "pausing download");
        for worker_id in &worker_ids {
            if let Some(slot) = state.busy.get(worker_id) {
                slot.handle.pause();
            }
        }
        if worker_ids.is_empty() {
            self.inner.maybe_complete(&mut state, index).await;
        }
        checkpoints
    }

    /// Number of busy worker slots, across all downloads.
    pub async fn active_workers(&self) -> usize {
        self.inner.state.lock().await.busy.len()
    }
}

fn spawn_speed_ticker(inner: &Arc<ManagerInner>) {
    let weak = Arc::downgrade(inner);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let Some(inner) = weak.upgrade() else { break };
            let rate = inner.speed.rotate();
            if let Some(cb) = &inner.cfg.speed_cb {
                cb(rate);
            }
        }
    });
}

impl ManagerInner {
    /// Scheduler pass: hand free worker slots to `init` chunks in queue
    /// order.
    async fn tick(&self) {
        let mut state = self.state.lock().await;
        let mut free = self.cfg.max_workers.saturating_sub(state.busy.len());

        let mut index = 0;
        while index < state.queue.len() && free > 0 {
            let mut removed = false;
            while free > 0 {
                let Some(chunk_index) = state.queue[index]
                    .chunks
                    .iter()
                    .position(|chunk| chunk.state == ChunkState::Init)
                else {
                    break;
                };
                match self.start_worker(&mut state, index, chunk_index).await {
                    Ok(()) => free -= 1,
                    Err(error) => {
                        self.fail_download(&mut state, index, error).await;
                        removed = true;
                        break;
                    }
                }
            }
            if !removed {
                index += 1;
            }
        }
    }

    /// Marks a chunk running and spawns its worker; creates the assembler
    /// lazily on the download's first started chunk.
    async fn start_worker(
        &self,
        state: &mut ManagerState,
        index: usize,
        chunk_index: usize,
    ) -> Result<(), DownloadError> {
        let Some(sink) = self.self_ref.upgrade() else {
            return Err(DownloadError::process_canceled("download manager shut down"));
        };
        if state.queue[index].assembler.is_none() {
            let temp_path = state.queue[index].temp_path.clone();
            let assembler = FileAssembler::create(&temp_path).await?;
            if let Some(size) = state.queue[index].size {
                assembler.set_total_size(size).await?;
            }
            state.queue[index].assembler = Some(Arc::new(assembler));
        }

        let worker_id = state.next_worker_id;
        state.next_worker_id += 1;

        let download = &mut state.queue[index];
        let download_id = download.id.clone();
        let chunk = &mut download.chunks[chunk_index];
        chunk.state = ChunkState::Running;
        chunk.worker_id = Some(worker_id);
        let spec = JobSpec {
            url: chunk.url.clone(),
            offset: chunk.offset,
            size: chunk.size,
        };

        debug!(
            worker_id,
            id = %download_id,
            offset = spec.offset,
            size = spec.size,
            "starting worker"
        );

        self.speed.init_worker(worker_id);
        let ctx = WorkerContext {
            worker_id,
            client: self.client.clone(),
            user_agent: self.cfg.user_agent.clone(),
            throttle: self.throttle.clone(),
            registry: Arc::clone(&self.registry),
            cookies: self.cfg.cookies.clone(),
        };
        let handle = spawn_worker(ctx, spec, sink as Arc<dyn WorkerSink>);
        state.busy.insert(
            worker_id,
            BusySlot {
                download_id,
                handle,
            },
        );
        Ok(())
    }

    /// First-response handling for the first chunk: records chunkability,
    /// adopts the server's size, grows the chunk layout, and runs the
    /// rename-on-name-discovery flow.
    async fn update_download(&self, state: &mut ManagerState, index: usize, info: &ResponseInfo) {
        let max_chunks = self.cfg.max_chunks.min(self.cfg.max_workers);
        let download = &mut state.queue[index];
        download.chunkable = if info.chunkable {
            Chunkable::Yes
        } else {
            Chunkable::No
        };

        if let Some(total) = info.total_size {
            let fresh = download.chunks.len() == 1
                && download.received == 0
                && download.chunks[0].received == 0;

            if download.size != Some(total) {
                debug!(id = %download.id, total, "adopting server-reported size");
                download.size = Some(total);
                if fresh {
                    // The speculative first chunk adjusts to the real
                    // size before any byte arrived: the chunk minimum
                    // when the layout will grow, the whole file when the
                    // server serves it in one piece.
                    let first_size = if info.chunkable && total > MIN_CHUNK_SIZE {
                        MIN_CHUNK_SIZE
                    } else {
                        total
                    };
                    let chunk = &mut download.chunks[0];
                    chunk.size = first_size;
                    chunk.confirmed_size = first_size;
                }
                if let Some(assembler) = &download.assembler {
                    if let Err(error) = assembler.set_total_size(total).await {
                        warn!(id = %download.id, error = %error, "pre-allocation failed");
                    }
                }
            }

            if info.chunkable && total > MIN_CHUNK_SIZE && fresh {
                grow_chunks(download, total, max_chunks);
            }
        }

        if let Some(server_name) = &info.server_filename {
            let new_name = sanitize_filename(server_name);
            if download.final_path.is_none() && new_name != download.orig_name {
                self.rename_download(download, &new_name).await;
            }
        }
    }

    /// Reserves the server-provided name and renames the open assembly
    /// file onto it. Failures are logged, never fatal.
    async fn rename_download(&self, download: &mut RunningDownload, new_name: &str) {
        let dir = download
            .temp_path
            .parent()
            .map_or_else(|| self.cfg.download_path.clone(), Path::to_path_buf);
        let Some(assembler) = download.assembler.clone() else {
            return;
        };
        match reserve_unique_name(&dir, new_name, RedownloadMode::Always, None).await {
            Ok(new_path) => match assembler.rename(&new_path).await {
                Ok(()) => {
                    info!(
                        id = %download.id,
                        from = %download.temp_path.display(),
                        to = %new_path.display(),
                        "adopted server filename"
                    );
                    download.temp_path.clone_from(&new_path);
                    download.final_path = Some(new_path);
                }
                Err(error) => {
                    warn!(id = %download.id, error = %error, "rename failed; keeping original name");
                    let _ = tokio::fs::remove_file(&new_path).await;
                }
            },
            Err(error) => {
                warn!(id = %download.id, error = %error, "could not reserve server filename");
            }
        }
    }

    /// Handles a worker's terminal report.
    async fn finish_chunk(
        &self,
        state: &mut ManagerState,
        index: usize,
        worker_id: WorkerId,
        outcome: WorkerOutcome,
    ) {
        let download = &mut state.queue[index];
        let Some(chunk_index) = download
            .chunks
            .iter()
            .position(|chunk| chunk.worker_id == Some(worker_id))
        else {
            return;
        };

        let (first, residual) = {
            let chunk = &mut download.chunks[chunk_index];
            chunk.worker_id = None;
            (chunk.first, chunk.confirmed_size)
        };

        match outcome.error {
            Some(error) if first => {
                // First-chunk errors take the whole download down.
                self.fail_download(state, index, error).await;
                return;
            }
            Some(error) => {
                warn!(
                    id = %download.id,
                    worker_id,
                    error = %error,
                    "chunk failed; download will conclude with errors"
                );
                download.error = true;
                download.chunks[chunk_index].state = if residual > 0 {
                    ChunkState::Paused
                } else {
                    ChunkState::Finished
                };
            }
            None => {
                download.chunks[chunk_index].state = if outcome.paused || residual > 0 {
                    ChunkState::Paused
                } else {
                    ChunkState::Finished
                };
                if !outcome.paused && residual > 0 {
                    download.error = true;
                }
            }
        }

        self.maybe_complete(state, index).await;
    }

    /// Concludes a download once no chunk remains schedulable: closes the
    /// assembler, settles the final name, and fires the completion
    /// callback.
    async fn maybe_complete(&self, state: &mut ManagerState, index: usize) {
        if state.queue[index].chunks.iter().any(|chunk| !chunk.is_terminal()) {
            return;
        }
        let mut download = state.queue.remove(index);

        let unfinished_chunks: Vec<ChunkCheckpoint> = download
            .chunks
            .iter()
            .filter(|chunk| chunk.is_unfinished())
            .map(ChunkJob::checkpoint)
            .collect();
        let had_errors = download.error;
        let size = download.size.unwrap_or(0).max(download.received);

        if let Some(assembler) = download.assembler.take() {
            if let Err(error) = assembler.close().await {
                warn!(id = %download.id, error = %error, "closing assembly file failed");
            }
        }

        let mut file_path = download.temp_path.clone();
        if let Some(final_path) = download.final_path.clone() {
            if final_path != download.temp_path {
                match tokio::fs::rename(&download.temp_path, &final_path).await {
                    Ok(()) => file_path = final_path,
                    Err(error) => {
                        warn!(id = %download.id, error = %error, "final rename failed");
                    }
                }
            }
        } else if headers_say_html(download.headers.as_ref())
            && file_path.extension().and_then(|ext| ext.to_str()) != Some("html")
        {
            // An HTML body that was written out is a server error page,
            // not the file.
            debug!(id = %download.id, "removing html error page");
            let _ = tokio::fs::remove_file(&file_path).await;
        }

        info!(
            id = %download.id,
            path = %file_path.display(),
            received = download.received,
            unfinished = unfinished_chunks.len(),
            had_errors,
            "download concluded"
        );

        if let Some(tx) = download.completion_tx.take() {
            let _ = tx.send(Ok(DownloadOutcome {
                file_path,
                headers: download.headers.clone(),
                unfinished_chunks,
                had_errors,
                size,
            }));
        }
    }

    /// Removes a download after a fatal error: cancels its other
    /// workers, closes the assembler, cleans up HTML bodies, and fires
    /// the failure callback.
    async fn fail_download(
        &self,
        state: &mut ManagerState,
        index: usize,
        error: DownloadError,
    ) {
        let mut download = state.queue.remove(index);

        for chunk in &mut download.chunks {
            if chunk.state == ChunkState::Init {
                chunk.state = ChunkState::Finished;
            }
        }
        for chunk in &download.chunks {
            if let Some(worker_id) = chunk.worker_id {
                if let Some(slot) = state.busy.get(&worker_id) {
                    slot.handle.cancel();
                }
            }
        }

        if let Some(assembler) = download.assembler.take() {
            if let Err(close_error) = assembler.close().await {
                warn!(id = %download.id, error = %close_error, "closing assembly file failed");
            }
        }
        if matches!(error, DownloadError::DownloadIsHtml { .. }) {
            debug!(id = %download.id, path = %download.temp_path.display(), "removing html error page");
            let _ = tokio::fs::remove_file(&download.temp_path).await;
        }

        warn!(id = %download.id, error = %error, "download failed");
        if let Some(tx) = download.completion_tx.take() {
            let _ = tx.send(Err(error));
        }
    }
}

#[async_trait]
impl WorkerSink for ManagerInner {
    async fn data(
        &self,
        worker_id: WorkerId,
        offset: u64,
        data: Bytes,
    ) -> Result<WriteAck, DownloadError> {
        let len = data.len() as u64;
        let assembler = {
            let mut state = self.state.lock().await;
            let Some((index, chunk_index)) = locate(&state, worker_id) else {
                return Err(DownloadError::process_canceled("worker detached"));
            };
            let download = &mut state.queue[index];
            download.chunks[chunk_index].record_submitted(len);
            match &download.assembler {
                Some(assembler) => Arc::clone(assembler),
                None => return Err(DownloadError::process_canceled("assembler closed")),
            }
        };

        // The write happens outside the state lock; the assembler
        // serializes concurrent writers internally.
        let ack = assembler.add_chunk(offset, data).await?;

        let mut state = self.state.lock().await;
        if let Some((index, chunk_index)) = locate(&state, worker_id) {
            let download = &mut state.queue[index];
            download.chunks[chunk_index].record_confirmed(len);
            download.received += len;
            // Invoked under the state lock so updates stay ordered per
            // download; callbacks must not block.
            if let Some(cb) = download.progress_cb.clone() {
                let update = progress_update(download, ack.synced);
                cb(update);
            }
        }
        // else: the download went away mid-write (stop); the bytes are
        // on disk but there is no state left to advance.
        Ok(ack)
    }

    async fn response(
        &self,
        worker_id: WorkerId,
        info: ResponseInfo,
    ) -> Result<(), DownloadError> {
        let mut state = self.state.lock().await;
        let Some((index, chunk_index)) = locate(&state, worker_id) else {
            return Err(DownloadError::process_canceled("worker detached"));
        };

        let first = state.queue[index].chunks[chunk_index].first;
        if state.queue[index].headers.is_none() {
            // First worker wins.
            state.queue[index].headers = Some(info.headers.clone());
        }

        if first {
            self.update_download(&mut state, index, &info).await;
        } else {
            update_download_size(&mut state.queue[index], info.total_size);
        }

        let download = &state.queue[index];
        if let Some(cb) = download.progress_cb.clone() {
            let update = progress_update(download, false);
            cb(update);
        }
        drop(state);
        // Chunk growth may have produced schedulable work.
        self.tick().await;
        Ok(())
    }

    async fn progress(&self, worker_id: WorkerId, bytes: u64) {
        match self.speed.add(worker_id, bytes) {
            Some(WorkerHealth::Starving) => {
                let mut state = self.state.lock().await;
                let count = {
                    let counter = state.slow.entry(worker_id).or_insert(0);
                    *counter += 1;
                    *counter
                };
                if count > SLOW_WORKER_TOLERANCE {
                    // Restarting only helps while the download's URLs are
                    // young enough to still be valid.
                    let young = locate(&state, worker_id).is_some_and(|(index, _)| {
                        state.queue[index].started.elapsed() < STALL_RESTART_WINDOW
                    });
                    if young {
                        if let Some(slot) = state.busy.get(&worker_id) {
                            info!(worker_id, "restarting starving worker");
                            slot.handle.restart();
                        }
                        state.slow.insert(worker_id, 0);
                    }
                }
            }
            Some(WorkerHealth::Healthy) => {
                let mut state = self.state.lock().await;
                state.slow.remove(&worker_id);
            }
            None => {}
        }
    }

    async fn finished(&self, worker_id: WorkerId, outcome: WorkerOutcome) {
        {
            let mut state = self.state.lock().await;
            self.speed.stop_worker(worker_id);
            state.slow.remove(&worker_id);
            if let Some(slot) = state.busy.remove(&worker_id) {
                if let Some(index) = state
                    .queue
                    .iter()
                    .position(|download| download.id == slot.download_id)
                {
                    self.finish_chunk(&mut state, index, worker_id, outcome).await;
                }
            }
        }
        // The freed slot may unblock queued chunks.
        self.tick().await;
    }
}

fn locate(state: &ManagerState, worker_id: WorkerId) -> Option<(usize, usize)> {
    let download_id = &state.busy.get(&worker_id)?.download_id;
    let index = state.queue.iter().position(|d| &d.id == download_id)?;
    let chunk_index = state.queue[index]
        .chunks
        .iter()
        .position(|chunk| chunk.worker_id == Some(worker_id))?;
    Some((index, chunk_index))
}

/// Non-first chunks only adopt a changed total size.
fn update_download_size(download: &mut RunningDownload, total_size: Option<u64>) {
    if let Some(total) = total_size {
        if download.size != Some(total) {
            warn!(
                id = %download.id,
                old = ?download.size,
                new = total,
                "server changed the reported size mid-download"
            );
            download.size = Some(total);
        }
    }
}

/// Appends the additional chunks once the first response proves the
/// download is large and the server honours ranges.
fn grow_chunks(download: &mut RunningDownload, total: u64, max_chunks: usize) {
    let remaining = total - MIN_CHUNK_SIZE;
    let per_chunk = remaining.div_ceil(max_chunks.max(1) as u64);
    let chunk_size = remaining.min(per_chunk.max(MIN_CHUNK_SIZE));
    let url = download.urls[0].clone();

    // The layout intentionally starts one past MIN_CHUNK_SIZE; the first
    // chunk's inclusive range end covers the byte in between.
    let mut offset = MIN_CHUNK_SIZE + 1;
    while offset < total {
        let size = chunk_size.min(total - offset);
        download.chunks.push(ChunkJob::new(url.clone(), offset, size, false));
        offset += size;
    }
    debug!(
        id = %download.id,
        total,
        chunks = download.chunks.len(),
        chunk_size,
        "grew chunk layout"
    );
}

fn headers_say_html(headers: Option<&HeaderMap>) -> bool {
    headers
        .and_then(|headers| headers.get(header::CONTENT_TYPE))
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.trim_start().to_ascii_lowercase().starts_with("text/html"))
}

fn progress_update(download: &RunningDownload, synced: bool) -> ProgressUpdate {
    ProgressUpdate {
        id: download.id.clone(),
        received: download.received,
        total_size: download.size,
        chunks: synced.then(|| {
            download
                .chunks
                .iter()
                .filter(|chunk| chunk.is_unfinished())
                .map(ChunkJob::checkpoint)
                .collect()
        }),
        chunkable: download.chunkable,
        urls: download.urls.clone(),
        file_path: download.temp_path.clone(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const MIB: u64 = 1024 * 1024;

    fn test_download(size: Option<u64>) -> RunningDownload {
        RunningDownload {
            id: "dl".to_string(),
            urls: vec!["https://cdn.test/file.bin".to_string()],
            temp_path: PathBuf::from("/tmp/file.bin"),
            final_path: None,
            orig_name: "file.bin".to_string(),
            size,
            received: 0,
            chunks: vec![ChunkJob::new("https://cdn.test/file.bin", 0, MIN_CHUNK_SIZE, true)],
            chunkable: Chunkable::Unknown,
            started: Instant::now(),
            headers: None,
            assembler: None,
            progress_cb: None,
            completion_tx: None,
            error: false,
        }
    }

    // ==================== chunk layout ====================

    #[test]
    fn test_grow_chunks_eighty_mebibytes_four_workers() {
        let mut download = test_download(Some(80 * MIB));
        grow_chunks(&mut download, 80 * MIB, 4);

        // remaining = 60 MiB; ceil(60/4) = 15 MiB, floored up to the
        // 20 MiB minimum.
        assert_eq!(download.chunks.len(), 4);
        assert_eq!(download.chunks[1].offset, 20 * MIB + 1);
        assert_eq!(download.chunks[1].size, 20 * MIB);
        assert_eq!(download.chunks[2].offset, 40 * MIB + 1);
        assert_eq!(download.chunks[2].size, 20 * MIB);
        assert_eq!(download.chunks[3].offset, 60 * MIB + 1);
        assert_eq!(download.chunks[3].size, 20 * MIB - 1);
        assert!(download.chunks.iter().skip(1).all(|c| !c.first));
        assert!(download.chunks.iter().skip(1).all(|c| c.state == ChunkState::Init));
    }

    #[test]
    fn test_grow_chunks_caps_at_worker_count() {
        // 200 MiB across at most 2 chunks-worth of extra workers:
        // remaining = 180 MiB, ceil(180/2) = 90 MiB per chunk.
        let mut download = test_download(Some(200 * MIB));
        grow_chunks(&mut download, 200 * MIB, 2);
        assert_eq!(download.chunks.len(), 3);
        assert_eq!(download.chunks[1].size, 90 * MIB);
        assert_eq!(download.chunks[2].offset, 110 * MIB + 1);
        assert_eq!(download.chunks[2].size, 90 * MIB - 1);
    }

    #[test]
    fn test_grow_chunks_layout_covers_the_file() {
        for (total, max_chunks) in [
            (80 * MIB, 4),
            (21 * MIB, 4),
            (200 * MIB + 7, 3),
            (1024 * MIB, 8),
        ] {
            let mut download = test_download(Some(total));
            download.chunks[0].size = total.min(MIN_CHUNK_SIZE);
            grow_chunks(&mut download, total, max_chunks);

            // With the inclusive range end, chunk N covers
            // [offset, offset + size]; the union must reach total.
            let mut covered = download.chunks[0].size + 1;
            for chunk in download.chunks.iter().skip(1) {
                assert!(chunk.offset <= covered, "gap before offset {}", chunk.offset);
                covered = covered.max(chunk.offset + chunk.size);
            }
            assert!(covered >= total, "layout stops at {covered} of {total}");
        }
    }

    // ==================== size adoption ====================

    #[test]
    fn test_update_download_size_adopts_changed_total() {
        let mut download = test_download(Some(100));
        update_download_size(&mut download, Some(250));
        assert_eq!(download.size, Some(250));
        update_download_size(&mut download, None);
        assert_eq!(download.size, Some(250));
    }

    // ==================== progress snapshots ====================

    #[test]
    fn test_progress_update_includes_chunks_only_when_synced() {
        let download = test_download(Some(80 * MIB));
        assert!(progress_update(&download, false).chunks.is_none());
        let snapshot = progress_update(&download, true).chunks.unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].size, MIN_CHUNK_SIZE);
    }

    // ==================== html detection ====================

    #[test]
    fn test_headers_say_html() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, "text/html; charset=utf-8".parse().unwrap());
        assert!(headers_say_html(Some(&headers)));

        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, "application/zip".parse().unwrap());
        assert!(!headers_say_html(Some(&headers)));
        assert!(!headers_say_html(None));
    }

    // ==================== configuration ====================

    #[tokio::test]
    async fn test_manager_rejects_zero_workers() {
        let mut cfg = DownloadManagerConfig::new("/tmp/downloads");
        cfg.max_workers = 0;
        let result = DownloadManager::new(cfg, HandlerRegistry::new());
        assert!(matches!(result, Err(DownloadError::DataInvalid { .. })));
    }

    #[tokio::test]
    async fn test_manager_rejects_zero_chunks() {
        let mut cfg = DownloadManagerConfig::new("/tmp/downloads");
        cfg.max_chunks = 0;
        let result = DownloadManager::new(cfg, HandlerRegistry::new());
        assert!(matches!(result, Err(DownloadError::DataInvalid { .. })));
    }

    #[tokio::test]
    async fn test_enqueue_rejects_empty_url_list() {
        let cfg = DownloadManagerConfig::new(std::env::temp_dir());
        let manager = DownloadManager::new(cfg, HandlerRegistry::new()).unwrap();
        let result = manager
            .enqueue(DownloadRequest::new("dl", Vec::new()))
            .await;
        assert!(matches!(result, Err(DownloadError::DataInvalid { .. })));
    }

    #[tokio::test]
    async fn test_stop_unknown_download_is_false() {
        let cfg = DownloadManagerConfig::new(std::env::temp_dir());
        let manager = DownloadManager::new(cfg, HandlerRegistry::new()).unwrap();
        assert!(!manager.stop("missing").await);
        assert!(manager.pause("missing").await.is_empty());
    }
}
