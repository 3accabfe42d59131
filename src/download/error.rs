//! Error types for the download engine.
//!
//! One structured error enum covers the whole engine surface: invalid
//! requests, internal and user-driven cancellation, HTTP failures, the
//! HTML-body trap, filename collisions, and transient network/IO faults.

use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by the download engine.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// Malformed caller input (empty URL list, unparseable URL).
    #[error("invalid download request: {reason}")]
    DataInvalid {
        /// What was wrong with the input.
        reason: String,
    },

    /// Internal abort: file locked, no unfinished chunks, assembler closed.
    #[error("download canceled: {reason}")]
    ProcessCanceled {
        /// Why the engine gave up.
        reason: String,
    },

    /// Explicit user action or a rejected collision prompt.
    #[error("download canceled by user")]
    UserCanceled,

    /// Non-redirect response with status >= 300.
    #[error("HTTP {status} ({status_text}) fetching {url}")]
    HttpError {
        /// The HTTP status code.
        status: u16,
        /// The canonical reason phrase, or the raw code when unknown.
        status_text: String,
        /// The URL that produced the status.
        url: String,
    },

    /// Server answered 2xx with an HTML body — usually a login or error
    /// page standing in for the file. The caller may want to open a
    /// browser at the URL.
    #[error("server returned an HTML page instead of the file at {url}")]
    DownloadIsHtml {
        /// The URL that served HTML.
        url: String,
    },

    /// Filename collision while `redownload` policy is `never`.
    #[error("\"{filename}\" was already downloaded")]
    AlreadyDownloaded {
        /// The colliding filename.
        filename: String,
    },

    /// Network-level failure (DNS, connect, TLS, mid-body reset).
    #[error("network error fetching {url}: {source}")]
    Network {
        /// The URL that failed.
        url: String,
        /// The underlying transport error.
        #[source]
        source: reqwest::Error,
    },

    /// Filesystem failure on the assembly file or during reservation.
    #[error("IO error at {path}: {source}")]
    Io {
        /// The path where the error occurred.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The shared HTTP client could not be constructed.
    #[error("failed to construct HTTP client: {0}")]
    ClientBuild(#[source] reqwest::Error),
}

impl DownloadError {
    /// Creates a `DataInvalid` error.
    pub fn data_invalid(reason: impl Into<String>) -> Self {
        Self::DataInvalid {
            reason: reason.into(),
        }
    }

    /// Creates a `ProcessCanceled` error.
    pub fn process_canceled(reason: impl Into<String>) -> Self {
        Self::ProcessCanceled {
            reason: reason.into(),
        }
    }

    /// Creates an `HttpError` from a status code and the URL it came from.
    pub fn http_error(status: u16, status_text: impl Into<String>, url: impl Into<String>) -> Self {
        Self::HttpError {
            status,
            status_text: status_text.into(),
            url: url.into(),
        }
    }

    /// Creates a `DownloadIsHtml` error.
    pub fn download_is_html(url: impl Into<String>) -> Self {
        Self::DownloadIsHtml { url: url.into() }
    }

    /// Creates an `AlreadyDownloaded` error.
    pub fn already_downloaded(filename: impl Into<String>) -> Self {
        Self::AlreadyDownloaded {
            filename: filename.into(),
        }
    }

    /// Creates a network error from a reqwest error.
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Network {
            url: url.into(),
            source,
        }
    }

    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether this error came from a user decision rather than a fault.
    #[must_use]
    pub fn is_user_canceled(&self) -> bool {
        matches!(self, Self::UserCanceled)
    }
}

// No `From<reqwest::Error>` / `From<std::io::Error>` impls on purpose: the
// variants require context (url, path) the source errors do not carry, so
// the helper constructors are the conversion points.
