//! The download worker: one ranged HTTP request streamed into the
//! assembler.
//!
//! A worker resolves its chunk's URL, issues a single ranged GET, and
//! pumps the body through the shared throttle and (when the server
//! compressed it) a streaming decoder, buffering bytes until a merged
//! write is worth submitting. Redirects, mid-flight socket errors and
//! manager-driven restarts all loop back through one explicit state
//! machine instead of recursing.

use std::io::Write as _;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use reqwest::header;
use reqwest::StatusCode;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};
use url::Url;

use crate::auth::CookieStore;
use crate::resolver::HandlerRegistry;

use super::assembler::WriteAck;
use super::constants::{
    BUFFER_SIZE, BUFFER_SIZE_CAP, MAX_REDIRECT_FOLLOW, REDIRECT_SETTLE_DELAY,
};
use super::error::DownloadError;
use super::filename::{parse_content_disposition, split_referer};
use super::throttle::BandwidthThrottle;
use super::WorkerId;

/// Metadata extracted from a chunk's first 2xx response.
#[derive(Debug, Clone)]
pub(crate) struct ResponseInfo {
    /// Total size of the remote resource, when the server disclosed it.
    pub total_size: Option<u64>,
    /// Filename from Content-Disposition, when present.
    pub server_filename: Option<String>,
    /// Whether the server honoured the range request (Content-Range seen).
    pub chunkable: bool,
    /// The raw response headers.
    pub headers: header::HeaderMap,
}

/// Final report of one worker run.
#[derive(Debug)]
pub(crate) struct WorkerOutcome {
    /// `true` when the worker stopped due to a pause command.
    pub paused: bool,
    /// The error that ended the attempt, if any.
    pub error: Option<DownloadError>,
}

/// Manager-side callbacks a worker drives.
///
/// All byte accounting (in-flight on `data` submission, confirmed on its
/// return) happens behind this seam, in the manager's serialized state.
#[async_trait]
pub(crate) trait WorkerSink: Send + Sync {
    /// Submits a merged buffer at an absolute offset; returns once the
    /// assembler accepted it.
    async fn data(
        &self,
        worker_id: WorkerId,
        offset: u64,
        data: Bytes,
    ) -> Result<WriteAck, DownloadError>;

    /// Delivers first-response metadata. An error aborts the worker.
    async fn response(&self, worker_id: WorkerId, info: ResponseInfo)
        -> Result<(), DownloadError>;

    /// Reports raw network bytes for speed accounting.
    async fn progress(&self, worker_id: WorkerId, bytes: u64);

    /// Terminal report; called exactly once per worker.
    async fn finished(&self, worker_id: WorkerId, outcome: WorkerOutcome);
}

/// Control commands a running worker reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WorkerCommand {
    /// Abort the request and end with `paused = true`.
    Pause,
    /// Abort the request and end with `paused = false`.
    Cancel,
    /// Abort the request without ending and re-issue it.
    Restart,
}

/// Handle for steering a spawned worker.
#[derive(Debug, Clone)]
pub(crate) struct WorkerHandle {
    tx: mpsc::UnboundedSender<WorkerCommand>,
}

impl WorkerHandle {
    pub fn pause(&self) {
        let _ = self.tx.send(WorkerCommand::Pause);
    }

    pub fn cancel(&self) {
        let _ = self.tx.send(WorkerCommand::Cancel);
    }

    pub fn restart(&self) {
        let _ = self.tx.send(WorkerCommand::Restart);
    }
}

/// Immutable per-worker environment.
pub(crate) struct WorkerContext {
    pub worker_id: WorkerId,
    pub client: reqwest::Client,
    pub user_agent: String,
    pub throttle: BandwidthThrottle,
    pub registry: Arc<HandlerRegistry>,
    pub cookies: Option<Arc<CookieStore>>,
}

/// The slice of chunk state a worker needs to issue requests.
#[derive(Debug, Clone)]
pub(crate) struct JobSpec {
    /// Current chunk URL (may carry the `<referer` suffix).
    pub url: String,
    /// Next absolute byte offset to write.
    pub offset: u64,
    /// Residual bytes to fetch.
    pub size: u64,
}

/// Spawns a worker task for one chunk job.
pub(crate) fn spawn_worker(
    ctx: WorkerContext,
    spec: JobSpec,
    sink: Arc<dyn WorkerSink>,
) -> WorkerHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let worker = Worker {
        sink,
        url: spec.url,
        offset: spec.offset,
        size: spec.size,
        redirects: 0,
        ctx,
    };
    tokio::spawn(worker.run(rx));
    WorkerHandle { tx }
}

/// Outcome of a single request attempt.
enum Attempt {
    /// Stream ended; all buffered bytes flushed.
    Complete,
    /// Follow this URL after the settle delay.
    Redirect(String),
    /// Socket error after progress; re-resolve and re-issue.
    Retry,
    /// Manager asked for a restart; re-issue with current counters.
    Restart,
    /// Pause command honoured.
    Paused,
    /// Cancel command honoured (or the manager dropped the handle).
    Canceled,
    /// Terminal failure for this worker.
    Failed(DownloadError),
}

struct Worker {
    ctx: WorkerContext,
    sink: Arc<dyn WorkerSink>,
    url: String,
    offset: u64,
    size: u64,
    redirects: u32,
}

impl Worker {
    #[instrument(skip(self, commands), fields(worker_id = self.ctx.worker_id))]
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<WorkerCommand>) {
        let outcome = loop {
            match self.attempt(&mut commands).await {
                Attempt::Complete => {
                    break WorkerOutcome {
                        paused: false,
                        error: None,
                    };
                }
                Attempt::Redirect(next) => {
                    self.redirects += 1;
                    debug!(to = %next, redirects = self.redirects, "following redirect");
                    self.url = next;
                    match settle_delay(&mut commands).await {
                        Some(WorkerCommand::Pause) => {
                            break WorkerOutcome {
                                paused: true,
                                error: None,
                            };
                        }
                        Some(WorkerCommand::Cancel) => {
                            break WorkerOutcome {
                                paused: false,
                                error: None,
                            };
                        }
                        Some(WorkerCommand::Restart) | None => {}
                    }
                }
                Attempt::Retry => {
                    debug!(url = %self.url, "retrying after mid-flight socket error");
                }
                Attempt::Restart => {
                    debug!(url = %self.url, "restarting request");
                }
                Attempt::Paused => {
                    break WorkerOutcome {
                        paused: true,
                        error: None,
                    };
                }
                Attempt::Canceled => {
                    break WorkerOutcome {
                        paused: false,
                        error: None,
                    };
                }
                Attempt::Failed(error) => {
                    break WorkerOutcome {
                        paused: false,
                        error: Some(error),
                    };
                }
            }
        };
        // The single terminal report; anything after this is dropped.
        self.sink.finished(self.ctx.worker_id, outcome).await;
    }

    /// Issues one ranged request and streams its body.
    async fn attempt(&mut self, commands: &mut mpsc::UnboundedReceiver<WorkerCommand>) -> Attempt {
        let resolved = self.ctx.registry.resolve_url(&self.url).await;
        let Some(target) = resolved.into_iter().next() else {
            return Attempt::Failed(DownloadError::process_canceled(format!(
                "no download urls for {}",
                self.url
            )));
        };

        let (request_url, referer) = split_referer(&target);
        let parsed = match Url::parse(request_url) {
            Ok(parsed) => parsed,
            Err(_) => {
                return Attempt::Failed(DownloadError::data_invalid(format!(
                    "unparseable url: {request_url}"
                )));
            }
        };

        // The range end is offset + size, inclusive: one byte more than
        // the chunk nominally owns. Kept for server compatibility; it
        // papers over the one-byte gap the chunk layout leaves between
        // the first and second chunk.
        let mut request = self
            .ctx
            .client
            .get(parsed.clone())
            .header(
                header::RANGE,
                format!("bytes={}-{}", self.offset, self.offset + self.size),
            )
            .header(header::USER_AGENT, self.ctx.user_agent.clone())
            .header(header::ACCEPT_ENCODING, "gzip, deflate");
        if let Some(referer) = referer {
            request = request.header(header::REFERER, referer.to_string());
        }
        // Cookie lookup is best effort; no cookies is never a failure.
        if let Some(cookies) = &self.ctx.cookies {
            if let Some(value) = cookies.header_for(&parsed) {
                request = request.header(header::COOKIE, value);
            }
        }

        let response = tokio::select! {
            biased;
            cmd = commands.recv() => return attempt_for_command(cmd),
            result = request.send() => match result {
                Ok(response) => response,
                Err(error) => {
                    return Attempt::Failed(DownloadError::network(request_url, error));
                }
            },
        };

        let status = response.status();
        if status.is_redirection() {
            return self.handle_redirect(&response, &parsed, request_url, referer);
        }
        if !status.is_success() {
            return Attempt::Failed(DownloadError::http_error(
                status.as_u16(),
                status.canonical_reason().unwrap_or("unknown status"),
                request_url,
            ));
        }
        if is_html_response(response.headers()) {
            return Attempt::Failed(DownloadError::download_is_html(request_url));
        }
        if self.offset > 0 && !response.headers().contains_key(header::CONTENT_RANGE) {
            // A 200 to a mid-file range request would deliver the file
            // from byte zero and corrupt the assembly.
            return Attempt::Failed(DownloadError::process_canceled(format!(
                "server ignored range request at offset {} for {request_url}",
                self.offset
            )));
        }

        let info = response_info(response.headers());
        if let Err(error) = self.sink.response(self.ctx.worker_id, info).await {
            return Attempt::Failed(error);
        }

        self.stream_body(response, request_url, commands).await
    }

    fn handle_redirect(
        &self,
        response: &reqwest::Response,
        parsed: &Url,
        request_url: &str,
        referer: Option<&str>,
    ) -> Attempt {
        let status = response.status();
        let followable = matches!(
            status,
            StatusCode::MOVED_PERMANENTLY
                | StatusCode::FOUND
                | StatusCode::TEMPORARY_REDIRECT
                | StatusCode::PERMANENT_REDIRECT
        );
        if followable && self.redirects < MAX_REDIRECT_FOLLOW {
            let location = response
                .headers()
                .get(header::LOCATION)
                .and_then(|value| value.to_str().ok())
                .and_then(|location| parsed.join(location).ok());
            if let Some(next) = location {
                let next = match referer {
                    Some(referer) => format!("{next}<{referer}"),
                    None => next.to_string(),
                };
                return Attempt::Redirect(next);
            }
        }
        Attempt::Failed(DownloadError::http_error(
            status.as_u16(),
            status.canonical_reason().unwrap_or("unknown status"),
            request_url,
        ))
    }

    /// Pumps the body: throttle, decode, buffer, submit merged writes.
    async fn stream_body(
        &mut self,
        response: reqwest::Response,
        request_url: &str,
        commands: &mut mpsc::UnboundedReceiver<WorkerCommand>,
    ) -> Attempt {
        let mut decoder = BodyDecoder::from_headers(response.headers());
        let mut stream = response.bytes_stream();
        let mut buffers: Vec<Bytes> = Vec::new();
        let mut buffered: usize = 0;
        let mut inflight: Option<JoinHandle<Result<WriteAck, DownloadError>>> = None;
        let mut attempt_bytes: u64 = 0;

        loop {
            // Backpressure: once the cap is reached while a write is in
            // flight, stop reading the response until the write acks.
            let read_blocked = inflight.is_some() && buffered >= BUFFER_SIZE_CAP;

            tokio::select! {
                biased;
                cmd = commands.recv() => {
                    if let Err(error) = settle_inflight(&mut inflight).await {
                        return Attempt::Failed(error);
                    }
                    match cmd {
                        Some(WorkerCommand::Restart) => {
                            // Flush buffered bytes so the next attempt's
                            // range starts past them.
                            if let Err(error) = self.flush_buffers(&mut buffers, &mut buffered).await {
                                return Attempt::Failed(error);
                            }
                            return Attempt::Restart;
                        }
                        Some(WorkerCommand::Pause) => return Attempt::Paused,
                        Some(WorkerCommand::Cancel) | None => return Attempt::Canceled,
                    }
                }
                result = await_inflight(&mut inflight), if inflight.is_some() => {
                    inflight = None;
                    if let Err(error) = result {
                        return Attempt::Failed(error);
                    }
                    if buffered >= BUFFER_SIZE {
                        self.submit(&mut buffers, &mut buffered, &mut inflight);
                    }
                }
                item = stream.next(), if !read_blocked => {
                    match item {
                        Some(Ok(raw)) => {
                            self.ctx.throttle.acquire(raw.len()).await;
                            attempt_bytes += raw.len() as u64;
                            let decoded = match decoder.feed(&raw) {
                                Ok(decoded) => decoded,
                                Err(error) => {
                                    return Attempt::Failed(DownloadError::data_invalid(format!(
                                        "corrupt compressed body from {request_url}: {error}"
                                    )));
                                }
                            };
                            self.sink.progress(self.ctx.worker_id, raw.len() as u64).await;
                            if !decoded.is_empty() {
                                buffered += decoded.len();
                                buffers.push(decoded);
                            }
                            if buffered >= BUFFER_SIZE && inflight.is_none() {
                                self.submit(&mut buffers, &mut buffered, &mut inflight);
                            }
                        }
                        Some(Err(error)) => {
                            if let Err(write_error) = settle_inflight(&mut inflight).await {
                                return Attempt::Failed(write_error);
                            }
                            if attempt_bytes > 0 && is_socket_error(&error) {
                                warn!(
                                    url = %request_url,
                                    error = %error,
                                    received = attempt_bytes,
                                    "socket error after progress; will retry"
                                );
                                if let Err(flush_error) =
                                    self.flush_buffers(&mut buffers, &mut buffered).await
                                {
                                    return Attempt::Failed(flush_error);
                                }
                                return Attempt::Retry;
                            }
                            return Attempt::Failed(DownloadError::network(request_url, error));
                        }
                        None => {
                            match decoder.finish() {
                                Ok(tail) if !tail.is_empty() => {
                                    buffered += tail.len();
                                    buffers.push(tail);
                                }
                                Ok(_) => {}
                                Err(error) => {
                                    return Attempt::Failed(DownloadError::data_invalid(format!(
                                        "corrupt compressed body from {request_url}: {error}"
                                    )));
                                }
                            }
                            if let Err(error) = settle_inflight(&mut inflight).await {
                                return Attempt::Failed(error);
                            }
                            if let Err(error) = self.flush_buffers(&mut buffers, &mut buffered).await {
                                return Attempt::Failed(error);
                            }
                            return Attempt::Complete;
                        }
                    }
                }
            }
        }
    }

    /// Merges the buffer list and spawns the write, advancing the
    /// in-flight counters immediately.
    fn submit(
        &mut self,
        buffers: &mut Vec<Bytes>,
        buffered: &mut usize,
        inflight: &mut Option<JoinHandle<Result<WriteAck, DownloadError>>>,
    ) {
        let merged = merge_buffers(buffers, *buffered);
        *buffered = 0;
        let offset = self.offset;
        self.offset += merged.len() as u64;
        self.size = self.size.saturating_sub(merged.len() as u64);

        let sink = Arc::clone(&self.sink);
        let worker_id = self.ctx.worker_id;
        *inflight = Some(tokio::spawn(async move {
            sink.data(worker_id, offset, merged).await
        }));
    }

    /// Synchronously submits whatever is buffered and waits for the ack.
    async fn flush_buffers(
        &mut self,
        buffers: &mut Vec<Bytes>,
        buffered: &mut usize,
    ) -> Result<(), DownloadError> {
        if *buffered == 0 {
            return Ok(());
        }
        let merged = merge_buffers(buffers, *buffered);
        *buffered = 0;
        let offset = self.offset;
        self.offset += merged.len() as u64;
        self.size = self.size.saturating_sub(merged.len() as u64);
        self.sink
            .data(self.ctx.worker_id, offset, merged)
            .await
            .map(|_| ())
    }
}

/// Sleeps out the redirect settle delay, reporting any command that
/// arrived during it.
async fn settle_delay(commands: &mut mpsc::UnboundedReceiver<WorkerCommand>) -> Option<WorkerCommand> {
    tokio::select! {
        biased;
        cmd = commands.recv() => cmd.or(Some(WorkerCommand::Cancel)),
        () = tokio::time::sleep(REDIRECT_SETTLE_DELAY) => None,
    }
}

fn attempt_for_command(cmd: Option<WorkerCommand>) -> Attempt {
    match cmd {
        Some(WorkerCommand::Pause) => Attempt::Paused,
        Some(WorkerCommand::Restart) => Attempt::Restart,
        Some(WorkerCommand::Cancel) | None => Attempt::Canceled,
    }
}

/// Awaits the in-flight write; pends forever when there is none (callers
/// guard with `if inflight.is_some()`).
async fn await_inflight(
    inflight: &mut Option<JoinHandle<Result<WriteAck, DownloadError>>>,
) -> Result<WriteAck, DownloadError> {
    match inflight.as_mut() {
        Some(handle) => match handle.await {
            Ok(result) => result,
            Err(join_error) => Err(DownloadError::process_canceled(format!(
                "write task failed: {join_error}"
            ))),
        },
        None => std::future::pending().await,
    }
}

/// Awaits and clears the in-flight write, if any.
async fn settle_inflight(
    inflight: &mut Option<JoinHandle<Result<WriteAck, DownloadError>>>,
) -> Result<(), DownloadError> {
    if inflight.is_some() {
        let result = await_inflight(inflight).await;
        *inflight = None;
        result?;
    }
    Ok(())
}

fn merge_buffers(buffers: &mut Vec<Bytes>, buffered: usize) -> Bytes {
    if buffers.len() == 1 {
        return buffers.pop().unwrap_or_default();
    }
    let mut merged = BytesMut::with_capacity(buffered);
    for buffer in buffers.drain(..) {
        merged.extend_from_slice(&buffer);
    }
    merged.freeze()
}

/// Whether a mid-stream reqwest error is a socket-level fault worth a
/// retry (timeouts, resets, aborted connections).
fn is_socket_error(error: &reqwest::Error) -> bool {
    if error.is_timeout() {
        return true;
    }
    let mut source = std::error::Error::source(error);
    while let Some(inner) = source {
        if let Some(io) = inner.downcast_ref::<std::io::Error>() {
            return matches!(
                io.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::UnexpectedEof
            );
        }
        source = inner.source();
    }
    false
}

fn is_html_response(headers: &header::HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.trim_start().to_ascii_lowercase().starts_with("text/html"))
}

/// Extracts size, filename and chunkability from response headers.
fn response_info(headers: &header::HeaderMap) -> ResponseInfo {
    let chunkable = headers.contains_key(header::CONTENT_RANGE);
    let total_size = headers
        .get(header::CONTENT_RANGE)
        .and_then(|value| value.to_str().ok())
        .and_then(parse_content_range_total)
        .or_else(|| {
            if chunkable {
                None
            } else {
                headers
                    .get(header::CONTENT_LENGTH)
                    .and_then(|value| value.to_str().ok())
                    .and_then(|value| value.trim().parse().ok())
            }
        });
    let server_filename = headers
        .get(header::CONTENT_DISPOSITION)
        .and_then(|value| value.to_str().ok())
        .and_then(parse_content_disposition);

    ResponseInfo {
        total_size,
        server_filename,
        chunkable,
        headers: headers.clone(),
    }
}

/// Parses the total out of `bytes <start>-<end>/<total>`; `*` totals
/// yield `None`.
fn parse_content_range_total(value: &str) -> Option<u64> {
    value.rsplit_once('/')?.1.trim().parse().ok()
}

/// Streaming decoder for `Content-Encoding: gzip` / `deflate` bodies.
enum BodyDecoder {
    Identity,
    Gzip(flate2::write::GzDecoder<Vec<u8>>),
    Deflate(flate2::write::ZlibDecoder<Vec<u8>>),
}

impl BodyDecoder {
    fn from_headers(headers: &header::HeaderMap) -> Self {
        let encoding = headers
            .get(header::CONTENT_ENCODING)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.trim().to_ascii_lowercase());
        match encoding.as_deref() {
            Some("gzip" | "x-gzip") => Self::Gzip(flate2::write::GzDecoder::new(Vec::new())),
            Some("deflate") => Self::Deflate(flate2::write::ZlibDecoder::new(Vec::new())),
            _ => Self::Identity,
        }
    }

    /// Feeds compressed bytes in, returns whatever decompressed bytes came
    /// out.
    fn feed(&mut self, data: &Bytes) -> std::io::Result<Bytes> {
        match self {
            Self::Identity => Ok(data.clone()),
            Self::Gzip(decoder) => {
                decoder.write_all(data)?;
                decoder.flush()?;
                Ok(Bytes::from(std::mem::take(decoder.get_mut())))
            }
            Self::Deflate(decoder) => {
                decoder.write_all(data)?;
                decoder.flush()?;
                Ok(Bytes::from(std::mem::take(decoder.get_mut())))
            }
        }
    }

    /// Finalizes the stream, returning any trailing decompressed bytes.
    fn finish(&mut self) -> std::io::Result<Bytes> {
        match std::mem::replace(self, Self::Identity) {
            Self::Identity => Ok(Bytes::new()),
            Self::Gzip(decoder) => Ok(Bytes::from(decoder.finish()?)),
            Self::Deflate(decoder) => Ok(Bytes::from(decoder.finish()?)),
        }
    }
}
