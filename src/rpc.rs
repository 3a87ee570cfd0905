//! RPC collaborator seams for the bootstrap call
//!
//! The transport itself lives outside this crate. The core only needs two
//! capabilities: issue one synchronous unary RPC against a concrete address,
//! and ask the rest of the agent whether it already knows a local server
//! (once gossip is up, that beats re-resolving the configured endpoints).

use std::net::SocketAddr;

use async_trait::async_trait;
use palisade_proto::{AutoConfigRequest, AutoConfigResponse};

/// Method name of the one bootstrap RPC.
pub const INITIAL_CONFIGURATION_METHOD: &str = "AutoConfig.InitialConfiguration";

/// Issues unary RPCs directly against a specific server address, outside any
/// established connection pool.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DirectRpc: Send + Sync {
    /// Send `request` to `addr` and wait for the response.
    async fn rpc(
        &self,
        datacenter: &str,
        node: &str,
        addr: SocketAddr,
        method: &str,
        request: &AutoConfigRequest,
    ) -> crate::Result<AutoConfigResponse>;
}

/// A server the agent already knows about through other channels.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Server {
    /// Transport address of the server.
    pub addr: SocketAddr,
}

/// Supplies a known-good local server, when one is available.
#[cfg_attr(test, mockall::automock)]
pub trait ServerProvider: Send + Sync {
    /// A server discovered since startup, or `None` before any is known.
    fn find_local_server(&self) -> Option<Server>;
}
