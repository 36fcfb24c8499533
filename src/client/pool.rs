// SPDX-License-Identifier: MIT OR Apache-2.0

//! Round-robin balancing across the resolved addresses of a target.
//!
//! [`BalancedChannel`] keeps one lazily connected [`Channel`] per resolved
//! address and hands them out in turn. When the resolver publishes a new
//! address set, channels of addresses that are still present are reused and
//! the others are dropped.
//!
//! # Example
//!
//! ```no_run
//! use chat_infra::client::pool::{BalancedChannel, ChannelSettings};
//! use chat_infra::client::resolver::{self, Target};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), tonic::Status> {
//! let target = Target::parse("dns:///room-service:50051", 443).unwrap();
//! let pool = BalancedChannel::new(
//!     resolver::spawn(target, Duration::from_secs(30)),
//!     ChannelSettings::default(),
//! );
//!
//! let channel = pool.pick().await?;
//! # Ok(())
//! # }
//! ```

use super::resolver::ResolverHandle;
use crate::config::ClientConfig;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tonic::transport::{Channel, Endpoint};

/// Connection settings applied to every address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelSettings {
    pub keepalive_time: Duration,
    pub keepalive_timeout: Duration,
    pub keepalive_permit_without_stream: bool,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self::from(&ClientConfig::default())
    }
}

impl From<&ClientConfig> for ChannelSettings {
    fn from(config: &ClientConfig) -> Self {
        Self {
            keepalive_time: config.keepalive_time,
            keepalive_timeout: config.keepalive_timeout,
            keepalive_permit_without_stream: config.keepalive_permit_without_stream,
        }
    }
}

impl ChannelSettings {
    /// Plaintext endpoint for `addr`.
    fn endpoint(&self, addr: SocketAddr) -> Result<Endpoint, tonic::transport::Error> {
        Ok(Endpoint::from_shared(format!("http://{}", addr))?
            .http2_keep_alive_interval(self.keepalive_time)
            .keep_alive_timeout(self.keepalive_timeout)
            .keep_alive_while_idle(self.keepalive_permit_without_stream))
    }
}

#[derive(Debug, Default)]
struct Snapshot {
    addresses: Arc<Vec<SocketAddr>>,
    channels: Vec<(SocketAddr, Channel)>,
}

#[derive(Debug)]
struct PoolInner {
    resolver: ResolverHandle,
    settings: ChannelSettings,
    snapshot: RwLock<Snapshot>,
    next: AtomicUsize,
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        self.resolver.close();
    }
}

/// Round-robin picker over the channels of the resolved addresses.
#[derive(Debug, Clone)]
pub struct BalancedChannel {
    inner: Arc<PoolInner>,
}

impl BalancedChannel {
    pub fn new(resolver: ResolverHandle, settings: ChannelSettings) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                resolver,
                settings,
                snapshot: RwLock::new(Snapshot::default()),
                next: AtomicUsize::new(0),
            }),
        }
    }

    /// Next channel in round-robin order.
    ///
    /// Waits for the resolver when no address is known yet; callers bound
    /// the wait with their own deadline.
    ///
    /// # Errors
    ///
    /// Returns `Unavailable` once the pool is closed.
    pub async fn pick(&self) -> Result<Channel, tonic::Status> {
        let mut resolver = self.inner.resolver.clone();
        loop {
            if resolver.is_closed() {
                return Err(tonic::Status::unavailable("client connection is closing"));
            }
            if let Some(channel) = self.next_channel() {
                return Ok(channel);
            }
            resolver.resolve_now();
            if !resolver.changed().await {
                return Err(tonic::Status::unavailable("client connection is closing"));
            }
        }
    }

    fn next_channel(&self) -> Option<Channel> {
        let addresses = self.inner.resolver.addresses();
        if addresses.is_empty() {
            return None;
        }

        {
            let snapshot = self
                .inner
                .snapshot
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            if Arc::ptr_eq(&snapshot.addresses, &addresses) {
                return self.select(&snapshot.channels);
            }
        }

        let mut snapshot = self
            .inner
            .snapshot
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if !Arc::ptr_eq(&snapshot.addresses, &addresses) {
            self.rebuild(&mut snapshot, addresses);
        }
        self.select(&snapshot.channels)
    }

    fn select(&self, channels: &[(SocketAddr, Channel)]) -> Option<Channel> {
        if channels.is_empty() {
            return None;
        }
        let idx = self.inner.next.fetch_add(1, Ordering::Relaxed) % channels.len();
        Some(channels[idx].1.clone())
    }

    fn rebuild(&self, snapshot: &mut Snapshot, addresses: Arc<Vec<SocketAddr>>) {
        let mut previous = std::mem::take(&mut snapshot.channels);
        let mut channels = Vec::with_capacity(addresses.len());
        for addr in addresses.iter() {
            if let Some(pos) = previous.iter().position(|(a, _)| a == addr) {
                channels.push(previous.swap_remove(pos));
                continue;
            }
            match self.inner.settings.endpoint(*addr) {
                Ok(endpoint) => channels.push((*addr, endpoint.connect_lazy())),
                Err(e) => tracing::warn!(addr = %addr, error = %e, "skipping address"),
            }
        }
        tracing::debug!(
            addresses = channels.len(),
            dropped = previous.len(),
            "updated balancer channels"
        );
        snapshot.channels = channels;
        snapshot.addresses = addresses;
    }

    /// Addresses currently balanced over.
    #[must_use]
    pub fn addresses(&self) -> Vec<SocketAddr> {
        self.inner.resolver.addresses().to_vec()
    }

    /// Stop the resolver; later picks fail with `Unavailable`.
    pub fn close(&self) {
        self.inner.resolver.close();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.resolver.is_closed()
    }
}
