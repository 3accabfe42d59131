//! Filename derivation, sanitization, and atomic on-disk name reservation.
//!
//! Covers the three naming flows of the engine: deriving a name template
//! from a URL or a Content-Disposition header, scrubbing it for filesystem
//! safety, and reserving a unique path via exclusive create so that two
//! concurrent downloads can never pick the same file.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::fs::OpenOptions;
use tracing::debug;
use url::Url;

use super::constants::UNNAMED_FALLBACK;
use super::error::DownloadError;

/// Collision policy consulted when the reserved name already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RedownloadMode {
    /// Keep counting up (`base.1.ext`, `base.2.ext`, ...) until a free
    /// name is found.
    Always,
    /// Reject the download with [`DownloadError::AlreadyDownloaded`].
    Never,
    /// Consult the caller's `file_exists_cb`; proceed on `true`, reject
    /// with [`DownloadError::UserCanceled`] otherwise.
    #[default]
    Ask,
    /// Reuse the existing name, overwriting the file.
    Replace,
}

/// Caller hook invoked on a first-iteration collision under
/// [`RedownloadMode::Ask`]. Returns whether to continue with a suffixed
/// name.
pub type FileExistsCb = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Substitutes characters that are invalid in filenames on common
/// filesystems, collapsing an all-invalid result to a fallback name.
#[must_use]
pub fn sanitize_filename(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    let trimmed = sanitized.trim();
    if trimmed.is_empty() || trimmed.chars().all(|c| c == '.' || c == '_') {
        UNNAMED_FALLBACK.to_string()
    } else {
        trimmed.to_string()
    }
}

/// Splits the `real<referer` mirror notation at the first `<`.
///
/// The prefix is the request URL; the suffix, when present, is the value
/// for the `Referer` header.
#[must_use]
pub fn split_referer(input: &str) -> (&str, Option<&str>) {
    match input.split_once('<') {
        Some((url, referer)) => (url, Some(referer)),
        None => (input, None),
    }
}

/// Derives a filename from the last path segment of a URL, percent-decoded
/// and sanitized. Returns the fallback name for bare hosts.
#[must_use]
pub fn filename_from_url(url: &Url) -> String {
    let segment = url
        .path_segments()
        .and_then(|mut segments| segments.next_back().map(str::to_string))
        .unwrap_or_default();
    let decoded = urlencoding::decode(&segment)
        .map(|cow| cow.into_owned())
        .unwrap_or(segment);
    sanitize_filename(&decoded)
}

/// Parses a Content-Disposition header into a filename.
///
/// Handles the RFC 5987 `filename*=UTF-8''...` form first, then quoted and
/// unquoted `filename=` values.
#[must_use]
pub fn parse_content_disposition(header: &str) -> Option<String> {
    if let Some(pos) = header.find("filename*=") {
        let value = header[pos + "filename*=".len()..].trim();
        if let Some(quote_pos) = value.find("''") {
            let encoded = &value[quote_pos + 2..];
            let end = encoded.find(';').unwrap_or(encoded.len());
            if let Ok(decoded) = urlencoding::decode(encoded[..end].trim()) {
                let name = decoded.into_owned();
                if !name.is_empty() {
                    return Some(name);
                }
            }
        }
    }

    if let Some(pos) = header.find("filename=") {
        let value = header[pos + "filename=".len()..].trim();
        if let Some(stripped) = value.strip_prefix('"') {
            if let Some(end) = stripped.find('"') {
                let name = &stripped[..end];
                if !name.is_empty() {
                    return Some(name.to_string());
                }
            }
        } else {
            let end = value.find(';').unwrap_or(value.len());
            let name = value[..end].trim();
            if !name.is_empty() {
                return Some(name.to_string());
            }
        }
    }

    None
}

/// Reserves a unique filename under `dir` by exclusive create.
///
/// The name is sanitized first. On a collision at the very first
/// candidate, the `redownload` policy decides whether to reject, overwrite
/// or start suffixing; later collisions always continue the
/// `base.<counter>.ext` suffix loop. The exclusive create is the
/// serialization point: two concurrent reservations cannot return the same
/// path.
///
/// # Errors
///
/// [`DownloadError::AlreadyDownloaded`] under `never`,
/// [`DownloadError::UserCanceled`] when the `ask` prompt declines, and
/// [`DownloadError::Io`] for any other filesystem failure.
pub async fn reserve_unique_name(
    dir: &Path,
    name: &str,
    redownload: RedownloadMode,
    file_exists_cb: Option<&FileExistsCb>,
) -> Result<PathBuf, DownloadError> {
    let base = sanitize_filename(name);
    let mut counter = 0u32;
    let mut candidate = base.clone();

    loop {
        let path = dir.join(&candidate);
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(file) => {
                // Close failures (EBADF included) are treated as success —
                // the name is reserved either way.
                drop(file);
                debug!(path = %path.display(), "reserved download filename");
                return Ok(path);
            }
            Err(error) if error.kind() == std::io::ErrorKind::AlreadyExists => {
                if counter == 0 {
                    match redownload {
                        RedownloadMode::Always => {}
                        RedownloadMode::Never => {
                            return Err(DownloadError::already_downloaded(candidate));
                        }
                        RedownloadMode::Replace => {
                            debug!(path = %path.display(), "reusing existing filename");
                            return Ok(path);
                        }
                        RedownloadMode::Ask => match file_exists_cb {
                            Some(cb) if cb(&candidate) => {}
                            _ => return Err(DownloadError::UserCanceled),
                        },
                    }
                }
                counter += 1;
                candidate = numbered_candidate(&base, counter);
            }
            Err(error) => return Err(DownloadError::io(path, error)),
        }
    }
}

/// Produces the `base.<counter>.ext` collision candidate.
fn numbered_candidate(base: &str, counter: u32) -> String {
    match base.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{stem}.{counter}.{ext}"),
        _ => format!("{base}.{counter}"),
    }
}
