//! Cache collaborator seam
//!
//! The agent's generic cache owns the actual background refresh of roots and
//! leaf certificates. The core subscribes to two of its topics and receives
//! updates on an mpsc sink until the subscription's cancellation token
//! fires. It can also seed the cache so the first watch event after a
//! bootstrap is not a spurious refetch.

use async_trait::async_trait;
use palisade_proto::{CaRoots, IssuedCert};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Correlation ID the core attaches to its roots subscription.
pub const ROOTS_WATCH_ID: &str = "roots";

/// Correlation ID the core attaches to its leaf-certificate subscription.
pub const LEAF_WATCH_ID: &str = "leaf";

/// Cache topics the core subscribes to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheTopic {
    /// Cluster-managed CA roots for a datacenter.
    CaRoots,
    /// The agent's own leaf certificate.
    LeafCert,
}

/// Parameters of a roots subscription.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RootsQuery {
    /// Datacenter whose roots to watch.
    pub datacenter: String,
}

/// Parameters of a leaf-certificate subscription.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeafQuery {
    /// Datacenter the certificate is issued in.
    pub datacenter: String,
    /// Node name the certificate is issued for.
    pub agent: String,
    /// ACL token the cache uses to authorize the watch; part of the cache
    /// key, so a token change means a new subscription.
    pub token: String,
}

/// A cache subscription request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CacheRequest {
    /// Subscribe to CA roots.
    Roots(RootsQuery),
    /// Subscribe to the agent's leaf certificate.
    Leaf(LeafQuery),
}

/// Payload of one cache update.
#[derive(Clone, Debug, PartialEq)]
pub enum CacheValue {
    /// A new snapshot of the cluster's CA roots.
    Roots(CaRoots),
    /// A re-issued leaf certificate.
    Leaf(IssuedCert),
}

/// One update delivered to a subscription sink.
#[derive(Clone, Debug, PartialEq)]
pub struct CacheUpdate {
    /// Correlation ID the subscription was registered with.
    pub correlation_id: String,
    /// The new value.
    pub value: CacheValue,
    /// Monotonic index of the value.
    pub index: u64,
}

/// The agent's generic cache, as seen by the auto-configuration core.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Cache: Send + Sync {
    /// Subscribe to `topic` with `request`, delivering updates tagged with
    /// `correlation_id` to `sink` until `ctx` is cancelled.
    async fn notify(
        &self,
        ctx: CancellationToken,
        topic: CacheTopic,
        request: CacheRequest,
        correlation_id: String,
        sink: mpsc::Sender<CacheUpdate>,
    ) -> crate::Result<()>;

    /// Seed the cache with a value obtained out of band, so watchers see it
    /// without a refetch.
    async fn prepopulate(
        &self,
        topic: CacheTopic,
        request: CacheRequest,
        value: CacheValue,
        index: u64,
    ) -> crate::Result<()>;
}
