//! Scoped suspension of network-proxy environment variables.
//!
//! Cluster credential loading and API calls must not be routed through an
//! ambient HTTP proxy. [`ProxyGuard`] clears the proxy variables on entry and
//! puts back exactly what it removed when dropped, so restoration also happens
//! on early returns, `?` propagation and panics.
//!
//! The process environment is shared: two guards must never be open at the
//! same time. Callers serialize the operations that use one.

use std::ffi::OsString;
use tracing::debug;

pub const PROXY_VARS: [&str; 8] = [
    "http_proxy",
    "https_proxy",
    "HTTP_PROXY",
    "HTTPS_PROXY",
    "ftp_proxy",
    "FTP_PROXY",
    "no_proxy",
    "NO_PROXY",
];

#[derive(Debug)]
pub struct ProxyGuard {
    /// Value of every proxy variable at entry, `None` when it was unset
    saved: Vec<(&'static str, Option<OsString>)>,
}

impl ProxyGuard {
    /// Captures and clears the proxy variables. With `disable == false` the
    /// guard is inert and restores nothing.
    pub fn enter(disable: bool) -> Self {
        let mut saved = Vec::new();
        if disable {
            for var in PROXY_VARS {
                let value = std::env::var_os(var);
                if value.is_some() {
                    std::env::remove_var(var);
                }
                saved.push((var, value));
            }
            let cleared = saved.iter().filter(|(_, v)| v.is_some()).count();
            if cleared > 0 {
                debug!(count = cleared, "proxy variables suspended");
            }
        }
        Self { saved }
    }

    /// Restores the captured variables now instead of at end of scope.
    pub fn exit(self) {}

    /// Runs `f` with the proxy variables cleared.
    pub fn scope<T>(disable: bool, f: impl FnOnce() -> T) -> T {
        let _guard = Self::enter(disable);
        f()
    }
}

impl Drop for ProxyGuard {
    fn drop(&mut self) {
        for (var, value) in self.saved.drain(..) {
            match value {
                Some(value) => std::env::set_var(var, value),
                None => std::env::remove_var(var),
            }
        }
    }
}
