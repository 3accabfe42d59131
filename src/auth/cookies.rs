//! Netscape cookie file parsing and per-URL `Cookie:` header building.
//!
//! Downloads attach cookies from the host's cookie store on a best-effort
//! basis: every failure path here degrades to "no cookies" rather than
//! failing the request. Cookie values are redacted from `Debug` output
//! and never logged.

use std::fmt;
use std::io::BufRead;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, instrument, warn};
use url::Url;

/// A single parsed cookie from a Netscape-format cookie file.
#[derive(Clone)]
pub struct CookieLine {
    /// The domain the cookie belongs to (e.g. `.example.com`).
    pub domain: String,
    /// Whether subdomains should match.
    pub tailmatch: bool,
    /// The URL path scope for the cookie.
    pub path: String,
    /// Whether the cookie may only be sent over HTTPS.
    pub secure: bool,
    /// Unix timestamp for expiry (0 = session cookie).
    pub expires: u64,
    /// Cookie name.
    pub name: String,
    /// Cookie value (sensitive — never log).
    value: String,
}

impl CookieLine {
    /// Returns the cookie value.
    ///
    /// Cookie values are sensitive — avoid logging the return value.
    #[must_use]
    pub fn value(&self) -> &str {
        &self.value
    }

    /// Whether this cookie applies to the given URL right now.
    fn matches(&self, url: &Url, now_unix: u64) -> bool {
        if self.secure && url.scheme() != "https" {
            return false;
        }
        if self.expires > 0 && self.expires <= now_unix {
            return false;
        }
        let Some(host) = url.host_str() else {
            return false;
        };
        if !domain_matches(&self.domain, self.tailmatch, host) {
            return false;
        }
        path_matches(&self.path, url.path())
    }
}

// Redact the value in Debug output.
impl fmt::Debug for CookieLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CookieLine")
            .field("domain", &self.domain)
            .field("tailmatch", &self.tailmatch)
            .field("path", &self.path)
            .field("secure", &self.secure)
            .field("expires", &self.expires)
            .field("name", &self.name)
            .field("value", &"[REDACTED]")
            .finish()
    }
}

/// The host's cookie store, queried per request URL.
#[derive(Debug, Default)]
pub struct CookieStore {
    cookies: Vec<CookieLine>,
}

impl CookieStore {
    /// Creates a store from already-parsed cookies.
    #[must_use]
    pub fn new(cookies: Vec<CookieLine>) -> Self {
        Self { cookies }
    }

    /// Loads a Netscape-format cookie file.
    ///
    /// Best effort: a missing or unreadable file yields an empty store,
    /// with a warning.
    #[instrument(level = "debug")]
    pub fn load(path: &Path) -> Self {
        match std::fs::File::open(path) {
            Ok(file) => Self::parse(std::io::BufReader::new(file)),
            Err(error) => {
                warn!(path = %path.display(), error = %error, "cookie file unavailable");
                Self::default()
            }
        }
    }

    /// Parses Netscape cookie lines from a reader.
    ///
    /// Each data line holds 7 TAB-separated fields: `domain`, `tailmatch`,
    /// `path`, `secure`, `expires`, `name`, `value`. Blank lines and
    /// comments are skipped, except the `#HttpOnly_` prefix which marks a
    /// regular cookie. Malformed lines are skipped with a warning.
    pub fn parse(reader: impl BufRead) -> Self {
        let mut cookies = Vec::new();

        for (idx, line_result) in reader.lines().enumerate() {
            let line_number = idx + 1;
            let Ok(line) = line_result else {
                warn!(line = line_number, "unreadable cookie line; stopping parse");
                break;
            };
            let line = line.trim_end();

            // #HttpOnly_ is a cookie, every other leading # is a comment.
            let line = match line.strip_prefix("#HttpOnly_") {
                Some(rest) => rest,
                None if line.is_empty() || line.starts_with('#') => continue,
                None => line,
            };

            match parse_cookie_line(line) {
                Ok(cookie) => {
                    debug!(
                        line = line_number,
                        domain = %cookie.domain,
                        name = %cookie.name,
                        "parsed cookie"
                    );
                    cookies.push(cookie);
                }
                Err(reason) => {
                    warn!(line = line_number, reason, "skipping malformed cookie line");
                }
            }
        }

        Self { cookies }
    }

    /// Builds the `Cookie:` header value for a URL, or `None` when no
    /// cookie applies.
    #[must_use]
    pub fn header_for(&self, url: &Url) -> Option<String> {
        let now_unix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        let pairs: Vec<String> = self
            .cookies
            .iter()
            .filter(|cookie| cookie.matches(url, now_unix))
            .map(|cookie| format!("{}={}", cookie.name, cookie.value()))
            .collect();

        if pairs.is_empty() {
            None
        } else {
            Some(pairs.join("; "))
        }
    }

    /// Number of cookies in the store.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cookies.len()
    }

    /// Whether the store holds no cookies.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }
}

/// Parses a single 7-field cookie line; the error is a human-readable
/// reason with the value redacted.
fn parse_cookie_line(line: &str) -> Result<CookieLine, String> {
    let fields: Vec<&str> = line.split('\t').collect();
    if fields.len() != 7 {
        return Err(format!(
            "expected 7 TAB-separated fields, found {}",
            fields.len()
        ));
    }

    let domain = fields[0];
    if domain.is_empty() {
        return Err("domain field is empty".to_string());
    }
    let tailmatch = parse_bool_field(fields[1], "tailmatch")?;
    let path = fields[2];
    let secure = parse_bool_field(fields[3], "secure")?;
    let expires = fields[4]
        .parse::<u64>()
        .map_err(|_| format!("expires field must be a non-negative integer, got '{}'", fields[4]))?;
    let name = fields[5];
    if name.is_empty() {
        return Err("cookie name field is empty".to_string());
    }

    Ok(CookieLine {
        domain: domain.to_string(),
        tailmatch,
        path: path.to_string(),
        secure,
        expires,
        name: name.to_string(),
        value: fields[6].to_string(),
    })
}

fn parse_bool_field(value: &str, field_name: &str) -> Result<bool, String> {
    match value {
        "TRUE" => Ok(true),
        "FALSE" => Ok(false),
        _ => Err(format!("{field_name} field must be TRUE or FALSE, got '{value}'")),
    }
}

/// Netscape domain matching: an exact host match always applies; a
/// tail-matching `.domain` entry also covers subdomains.
fn domain_matches(cookie_domain: &str, tailmatch: bool, host: &str) -> bool {
    let stripped = cookie_domain.strip_prefix('.').unwrap_or(cookie_domain);
    if host.eq_ignore_ascii_case(stripped) {
        return true;
    }
    if tailmatch || cookie_domain.starts_with('.') {
        let suffix = format!(".{stripped}");
        return host.to_ascii_lowercase().ends_with(&suffix.to_ascii_lowercase());
    }
    false
}

/// Cookie path matching per RFC 6265 §5.1.4.
fn path_matches(cookie_path: &str, request_path: &str) -> bool {
    if cookie_path.is_empty() || cookie_path == "/" {
        return true;
    }
    if request_path == cookie_path {
        return true;
    }
    request_path.starts_with(cookie_path)
        && (cookie_path.ends_with('/')
            || request_path[cookie_path.len()..].starts_with('/'))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::io::Cursor;

    use super::*;

    const COOKIE_FILE: &str = "\
# Netscape HTTP Cookie File
# This is a comment.

.example.com\tTRUE\t/\tFALSE\t0\tsession\tabc123
files.example.com\tFALSE\t/dl\tTRUE\t0\ttoken\tsecret
#HttpOnly_.example.com\tTRUE\t/\tFALSE\t0\tauth\thidden
malformed line without tabs
.stale.com\tTRUE\t/\tFALSE\t1\told\tgone
";

    fn store() -> CookieStore {
        CookieStore::parse(Cursor::new(COOKIE_FILE))
    }

    #[test]
    fn test_parse_skips_comments_and_malformed_lines() {
        let store = store();
        assert_eq!(store.len(), 4);
    }

    #[test]
    fn test_httponly_prefix_is_a_cookie() {
        let store = store();
        let url = Url::parse("http://example.com/").unwrap();
        let header = store.header_for(&url).unwrap();
        assert!(header.contains("auth=hidden"), "got: {header}");
    }

    #[test]
    fn test_tailmatch_covers_subdomains() {
        let store = store();
        let url = Url::parse("http://dl.example.com/x").unwrap();
        let header = store.header_for(&url).unwrap();
        assert!(header.contains("session=abc123"));
    }

    #[test]
    fn test_exact_domain_does_not_cover_siblings() {
        let store = store();
        let url = Url::parse("https://other.example.com/dl/f.zip").unwrap();
        let header = store.header_for(&url).unwrap();
        assert!(!header.contains("token="));
    }

    #[test]
    fn test_secure_cookie_needs_https() {
        let store = store();
        let http = Url::parse("http://files.example.com/dl/f.zip").unwrap();
        let https = Url::parse("https://files.example.com/dl/f.zip").unwrap();
        assert!(!store.header_for(&http).unwrap_or_default().contains("token="));
        assert!(store.header_for(&https).unwrap().contains("token=secret"));
    }

    #[test]
    fn test_path_scoping() {
        let store = store();
        let outside = Url::parse("https://files.example.com/other").unwrap();
        assert!(!store
            .header_for(&outside)
            .unwrap_or_default()
            .contains("token="));
    }

    #[test]
    fn test_expired_cookie_not_sent() {
        let store = store();
        let url = Url::parse("http://stale.com/").unwrap();
        assert_eq!(store.header_for(&url), None);
    }

    #[test]
    fn test_no_match_yields_none() {
        let store = store();
        let url = Url::parse("https://unrelated.net/").unwrap();
        assert_eq!(store.header_for(&url), None);
    }

    #[test]
    fn test_missing_file_is_empty_store() {
        let store = CookieStore::load(Path::new("/nonexistent/cookies.txt"));
        assert!(store.is_empty());
    }

    #[test]
    fn test_debug_redacts_value() {
        let store = store();
        let debug = format!("{:?}", store.cookies[0]);
        assert!(debug.contains("[REDACTED]"));
        assert!(!debug.contains("abc123"));
    }
}
