// SPDX-License-Identifier: MIT OR Apache-2.0

//! DNS name resolution for `dns:///host[:port]` targets.
//!
//! A background task resolves the target every `interval` (and whenever a
//! caller asks for it) and publishes the sorted address set. Resolution
//! failures keep the last known addresses.

use crate::error::{InfraError, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio_util::sync::CancellationToken;
use url::Url;

/// Scheme selecting DNS resolution.
pub const DNS_SCHEME: &str = "dns";

/// A parsed dial target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    host: String,
    port: u16,
}

impl Target {
    /// Parse `dns:///host[:port]` or a bare `host[:port]`.
    ///
    /// # Errors
    ///
    /// Returns [`InfraError::Config`] for other schemes, an empty host or
    /// an invalid port.
    #[allow(clippy::result_large_err)]
    pub fn parse(target: &str, default_port: u16) -> Result<Self> {
        let name = if target.contains("://") {
            let url = Url::parse(target)
                .map_err(|e| InfraError::Config(format!("invalid target {}: {}", target, e)))?;
            if url.scheme() != DNS_SCHEME {
                return Err(InfraError::Config(format!(
                    "unsupported resolver scheme {:?} in {}",
                    url.scheme(),
                    target
                )));
            }
            url.path().trim_start_matches('/').to_string()
        } else {
            target.to_string()
        };

        let (host, port) = split_host_port(&name, default_port)
            .ok_or_else(|| InfraError::Config(format!("invalid target {}", target)))?;
        if host.is_empty() {
            return Err(InfraError::Config(format!("missing host in target {}", target)));
        }
        Ok(Self { host, port })
    }

    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port`, with IPv6 hosts bracketed.
    #[must_use]
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:///{}", DNS_SCHEME, self.authority())
    }
}

fn split_host_port(name: &str, default_port: u16) -> Option<(String, u16)> {
    if let Some(rest) = name.strip_prefix('[') {
        let (host, tail) = rest.split_once(']')?;
        let port = match tail.strip_prefix(':') {
            Some(port) => port.parse().ok()?,
            None if tail.is_empty() => default_port,
            None => return None,
        };
        return Some((host.to_string(), port));
    }
    match name.rsplit_once(':') {
        // A bare IPv6 address carries more than one colon.
        Some((host, _)) if host.contains(':') => Some((name.to_string(), default_port)),
        Some((host, port)) => Some((host.to_string(), port.parse().ok()?)),
        None => Some((name.to_string(), default_port)),
    }
}

/// Receiving side of a running resolver.
#[derive(Debug, Clone)]
pub struct ResolverHandle {
    addresses: watch::Receiver<Arc<Vec<SocketAddr>>>,
    resolve_now: Arc<Notify>,
    cancel: CancellationToken,
}

impl ResolverHandle {
    /// Latest resolved address set.
    #[must_use]
    pub fn addresses(&self) -> Arc<Vec<SocketAddr>> {
        self.addresses.borrow().clone()
    }

    /// Ask the resolver to run before its next scheduled tick.
    pub fn resolve_now(&self) {
        self.resolve_now.notify_one();
    }

    /// Wait until the address set changes. Returns `false` once the
    /// resolver has stopped.
    pub async fn changed(&mut self) -> bool {
        tokio::select! {
            changed = self.addresses.changed() => changed.is_ok(),
            () = self.cancel.cancelled() => false,
        }
    }

    /// Stop the resolver task.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Start resolving `target` every `interval` until the handle is closed.
///
/// Must be called from within a tokio runtime.
pub fn spawn(target: Target, interval: Duration) -> ResolverHandle {
    let (tx, rx) = watch::channel(Arc::new(Vec::new()));
    let resolve_now = Arc::new(Notify::new());
    let cancel = CancellationToken::new();

    tokio::spawn(run(
        target,
        interval,
        tx,
        resolve_now.clone(),
        cancel.clone(),
    ));

    ResolverHandle {
        addresses: rx,
        resolve_now,
        cancel,
    }
}

async fn run(
    target: Target,
    interval: Duration,
    tx: watch::Sender<Arc<Vec<SocketAddr>>>,
    resolve_now: Arc<Notify>,
    cancel: CancellationToken,
) {
    let authority = target.authority();
    loop {
        let resolved = tokio::select! {
            resolved = tokio::net::lookup_host(authority.as_str()) => resolved,
            () = cancel.cancelled() => break,
        };
        match resolved {
            Ok(addrs) => {
                let mut addrs: Vec<SocketAddr> = addrs.collect();
                addrs.sort();
                addrs.dedup();
                let updated = tx.send_if_modified(|current| {
                    if current.as_slice() == addrs.as_slice() {
                        false
                    } else {
                        *current = Arc::new(addrs.clone());
                        true
                    }
                });
                if updated {
                    tracing::debug!(dial_target = %target, addresses = ?addrs, "resolved new address set");
                }
            }
            Err(e) => {
                tracing::warn!(dial_target = %target, error = %e, "name resolution failed");
            }
        }

        tokio::select! {
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(interval) => {}
            () = resolve_now.notified() => {}
        }
    }
    tracing::debug!(dial_target = %target, "resolver stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_dns_target() {
        let target = Target::parse("dns:///chat-room:50051", 443).unwrap();
        assert_eq!(target.host(), "chat-room");
        assert_eq!(target.port(), 50051);
        assert_eq!(target.to_string(), "dns:///chat-room:50051");
    }

    #[test]
    fn test_parse_default_port() {
        let target = Target::parse("dns:///chat-room", 443).unwrap();
        assert_eq!(target.port(), 443);

        let target = Target::parse("chat-room", 50051).unwrap();
        assert_eq!(target.authority(), "chat-room:50051");
    }

    #[test]
    fn test_parse_ipv6() {
        let target = Target::parse("dns:///[::1]:8080", 443).unwrap();
        assert_eq!(target.host(), "::1");
        assert_eq!(target.authority(), "[::1]:8080");

        let target = Target::parse("::1", 443).unwrap();
        assert_eq!(target.authority(), "[::1]:443");
    }

    #[test]
    fn test_parse_rejects_bad_targets() {
        assert!(matches!(
            Target::parse("unix:///tmp/sock", 443),
            Err(InfraError::Config(_))
        ));
        assert!(Target::parse("dns:///", 443).is_err());
        assert!(Target::parse("host:notaport", 443).is_err());
    }

    #[tokio::test]
    async fn test_resolves_localhost() {
        let target = Target::parse("dns:///127.0.0.1:4000", 443).unwrap();
        let mut handle = spawn(target, Duration::from_secs(30));

        if handle.addresses().is_empty() {
            assert!(handle.changed().await);
        }
        assert_eq!(
            *handle.addresses(),
            vec!["127.0.0.1:4000".parse::<SocketAddr>().unwrap()]
        );

        handle.close();
        assert!(!handle.changed().await);
        assert!(handle.is_closed());
    }
}
