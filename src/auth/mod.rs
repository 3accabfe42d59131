//! Host-capability integration: the cookie store consulted per request.

pub mod cookies;

pub use cookies::{CookieLine, CookieStore};
