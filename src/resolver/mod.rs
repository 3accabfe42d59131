//! Pluggable protocol handlers for turning caller inputs into concrete
//! download URLs.
//!
//! Inputs like `nxm://...` or other custom-scheme links are dispatched to
//! the handler registered for their scheme; plain `http`/`https` inputs
//! pass through unchanged. Results are cached per input URL for a few
//! minutes so that workers re-resolving mid-download (retry, restart) do
//! not hammer the handlers, while expired signed URLs still get renewed.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tracing::{debug, warn};

use crate::download::constants::URL_RESOLVE_EXPIRE;
use crate::download::filename::split_referer;

/// Failure reported by a protocol handler.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// The handler could not produce URLs for the input.
    #[error("handler for scheme \"{scheme}\" failed on {url}: {message}")]
    Handler {
        /// The scheme the handler is registered under.
        scheme: String,
        /// The input URL that failed to resolve.
        url: String,
        /// Handler-provided failure detail.
        message: String,
    },
}

impl ResolveError {
    /// Creates a handler failure.
    pub fn handler(
        scheme: impl Into<String>,
        url: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Handler {
            scheme: scheme.into(),
            url: url.into(),
            message: message.into(),
        }
    }
}

/// Resolves URLs of one scheme into concrete download URLs.
///
/// Handlers are registered by scheme (without the trailing `:`). A
/// handler may return several mirrors for one input.
#[async_trait]
pub trait ProtocolHandler: Send + Sync {
    /// The URL scheme this handler serves, lowercase, no trailing `:`.
    fn scheme(&self) -> &str;

    /// Resolves `url` into zero or more concrete download URLs.
    async fn resolve(&self, url: &str) -> Result<Vec<String>, ResolveError>;
}

#[derive(Debug, Clone)]
struct CachedResolution {
    urls: Vec<String>,
    resolved_at: Instant,
}

/// Scheme-keyed collection of protocol handlers with a result cache.
pub struct HandlerRegistry {
    handlers: HashMap<String, Box<dyn ProtocolHandler>>,
    cache: DashMap<String, CachedResolution>,
    expiry: Duration,
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("schemes", &self.handlers.keys().collect::<Vec<_>>())
            .field("cached", &self.cache.len())
            .finish()
    }
}

impl HandlerRegistry {
    /// Creates an empty registry with the default cache expiry.
    #[must_use]
    pub fn new() -> Self {
        Self::with_expiry(URL_RESOLVE_EXPIRE)
    }

    /// Creates an empty registry with a custom cache expiry.
    #[must_use]
    pub fn with_expiry(expiry: Duration) -> Self {
        Self {
            handlers: HashMap::new(),
            cache: DashMap::new(),
            expiry,
        }
    }

    /// Registers a handler under its scheme, replacing any previous one.
    pub fn register(&mut self, handler: Box<dyn ProtocolHandler>) {
        self.handlers
            .insert(handler.scheme().to_lowercase(), handler);
    }

    /// Resolves one input URL into concrete download URLs.
    ///
    /// Cached results younger than the expiry are served directly. Inputs
    /// without a registered handler resolve to themselves. Handler
    /// failures are logged and resolve to an empty list. The `<referer`
    /// suffix is stripped before handler dispatch and preserved on
    /// identity results.
    pub async fn resolve_url(&self, input: &str) -> Vec<String> {
        if let Some(cached) = self.cache.get(input) {
            if cached.resolved_at.elapsed() < self.expiry {
                return cached.urls.clone();
            }
        }

        let (request_url, _referer) = split_referer(input);
        let urls = match self.handler_for(request_url) {
            None => vec![input.to_string()],
            Some(handler) => match handler.resolve(request_url).await {
                Ok(urls) => {
                    debug!(input, count = urls.len(), "resolved download url");
                    urls
                }
                Err(error) => {
                    warn!(input, error = %error, "protocol handler failed; treating as no urls");
                    Vec::new()
                }
            },
        };

        self.cache.insert(
            input.to_string(),
            CachedResolution {
                urls: urls.clone(),
                resolved_at: Instant::now(),
            },
        );
        urls
    }

    /// Resolves every input in order and concatenates the results.
    pub async fn resolve_all(&self, inputs: &[String]) -> Vec<String> {
        let mut out = Vec::new();
        for input in inputs {
            out.extend(self.resolve_url(input).await);
        }
        out
    }

    fn handler_for(&self, url: &str) -> Option<&dyn ProtocolHandler> {
        let scheme = url.split_once(':')?.0.to_lowercase();
        self.handlers.get(&scheme).map(Box::as_ref)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    struct CountingHandler {
        scheme: &'static str,
        calls: Arc<AtomicUsize>,
        result: Result<Vec<String>, ()>,
    }

    #[async_trait]
    impl ProtocolHandler for CountingHandler {
        fn scheme(&self) -> &str {
            self.scheme
        }

        async fn resolve(&self, url: &str) -> Result<Vec<String>, ResolveError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.result {
                Ok(urls) => Ok(urls.clone()),
                Err(()) => Err(ResolveError::handler(self.scheme, url, "boom")),
            }
        }
    }

    fn counting(
        scheme: &'static str,
        result: Result<Vec<String>, ()>,
    ) -> (Box<CountingHandler>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        (
            Box::new(CountingHandler {
                scheme,
                calls: Arc::clone(&calls),
                result,
            }),
            calls,
        )
    }

    #[tokio::test]
    async fn test_unregistered_scheme_resolves_to_itself() {
        let registry = HandlerRegistry::new();
        let urls = registry.resolve_url("https://cdn.test/file.zip").await;
        assert_eq!(urls, vec!["https://cdn.test/file.zip".to_string()]);
    }

    #[tokio::test]
    async fn test_identity_preserves_referer_suffix() {
        let registry = HandlerRegistry::new();
        let input = "https://cdn.test/file.zip<https://site.test";
        assert_eq!(registry.resolve_url(input).await, vec![input.to_string()]);
    }

    #[tokio::test]
    async fn test_handler_dispatch_by_scheme() {
        let mut registry = HandlerRegistry::new();
        let (handler, calls) = counting("game", Ok(vec!["https://cdn.test/real.zip".to_string()]));
        registry.register(handler);

        let urls = registry.resolve_url("game://mods/42").await;
        assert_eq!(urls, vec!["https://cdn.test/real.zip".to_string()]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_handler_failure_resolves_empty() {
        let mut registry = HandlerRegistry::new();
        let (handler, _) = counting("game", Err(()));
        registry.register(handler);

        assert!(registry.resolve_url("game://mods/42").await.is_empty());
    }

    #[tokio::test]
    async fn test_results_are_cached_per_input() {
        let mut registry = HandlerRegistry::new();
        let (handler, calls) = counting("game", Ok(vec!["https://cdn.test/a".to_string()]));
        registry.register(handler);

        registry.resolve_url("game://mods/42").await;
        registry.resolve_url("game://mods/42").await;
        registry.resolve_url("game://mods/42").await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // A different input misses the cache.
        registry.resolve_url("game://mods/43").await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_expired_cache_entries_re_resolve() {
        let mut registry = HandlerRegistry::with_expiry(Duration::ZERO);
        let (handler, calls) = counting("game", Ok(vec!["https://cdn.test/a".to_string()]));
        registry.register(handler);

        registry.resolve_url("game://mods/42").await;
        registry.resolve_url("game://mods/42").await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_resolve_all_concatenates_in_order() {
        let mut registry = HandlerRegistry::new();
        let (handler, _) = counting("game", Ok(vec!["https://a.test/1".to_string()]));
        registry.register(handler);

        let urls = registry
            .resolve_all(&[
                "game://mods/42".to_string(),
                "https://b.test/2".to_string(),
            ])
            .await;
        assert_eq!(
            urls,
            vec!["https://a.test/1".to_string(), "https://b.test/2".to_string()]
        );
    }
}
