//! The bootstrap client: one `AutoConfig.InitialConfiguration` request
//! driven across the candidate server list
//!
//! A pass walks the candidates in declared order, one unary RPC per
//! resolved address. If the agent already knows a local server through
//! other channels, that single address takes the place of the configured
//! list for the pass. Per-attempt failures are logged and the next address
//! tried; an exhausted pass backs off through the waiter before
//! re-resolving. Cancellation wins over everything, including an attempt
//! that is already in flight.

use std::net::SocketAddr;

use palisade_common::RetryWaiter;
use palisade_proto::{AutoConfigRequest, AutoConfigResponse};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Error;
use crate::rpc::{DirectRpc, ServerProvider, INITIAL_CONFIGURATION_METHOD};

use super::resolve;

/// What one bootstrap invocation needs to know.
pub(crate) struct BootstrapParams<'a> {
    pub(crate) datacenter: &'a str,
    pub(crate) node_name: &'a str,
    pub(crate) intro_token: &'a str,
    pub(crate) server_addresses: &'a [String],
}

impl BootstrapParams<'_> {
    fn request(&self) -> AutoConfigRequest {
        AutoConfigRequest {
            datacenter: self.datacenter.to_string(),
            node: self.node_name.to_string(),
            jwt: self.intro_token.to_string(),
        }
    }
}

/// Retry until a server answers or `cancel` fires.
pub(crate) async fn fetch_initial_configuration(
    rpc: &dyn DirectRpc,
    servers: Option<&dyn ServerProvider>,
    waiter: &mut RetryWaiter,
    params: &BootstrapParams<'_>,
    cancel: &CancellationToken,
) -> crate::Result<AutoConfigResponse> {
    loop {
        if let Some(response) = one_pass(rpc, servers, params, cancel).await? {
            return Ok(response);
        }
        if !waiter.wait(cancel).await {
            return Err(Error::cancelled("initial configuration aborted"));
        }
    }
}

/// Walk the candidate addresses once. `Ok(None)` means the pass was
/// exhausted without a response.
pub(crate) async fn one_pass(
    rpc: &dyn DirectRpc,
    servers: Option<&dyn ServerProvider>,
    params: &BootstrapParams<'_>,
    cancel: &CancellationToken,
) -> crate::Result<Option<AutoConfigResponse>> {
    let request = params.request();

    // A server learned since startup beats re-resolving the configured list.
    if let Some(server) = servers.and_then(|s| s.find_local_server()) {
        debug!(addr = %server.addr, "bootstrapping against a known local server");
        return attempt(rpc, server.addr, params, &request, cancel).await;
    }

    for entry in params.server_addresses {
        let Some((host, port)) = resolve::split_host_port(entry) else {
            warn!(entry = %entry, "invalid server address entry; skipping");
            continue;
        };
        for addr in resolve::resolve(&host, port).await {
            if let Some(response) = attempt(rpc, addr, params, &request, cancel).await? {
                return Ok(Some(response));
            }
        }
    }

    Ok(None)
}

/// One RPC against one address. `Ok(None)` means try the next address.
async fn attempt(
    rpc: &dyn DirectRpc,
    addr: SocketAddr,
    params: &BootstrapParams<'_>,
    request: &AutoConfigRequest,
    cancel: &CancellationToken,
) -> crate::Result<Option<AutoConfigResponse>> {
    tokio::select! {
        _ = cancel.cancelled() => Err(Error::cancelled("initial configuration aborted")),
        result = rpc.rpc(
            params.datacenter,
            params.node_name,
            addr,
            INITIAL_CONFIGURATION_METHOD,
            request,
        ) => match result {
            Ok(response) => {
                info!(%addr, "received initial configuration");
                Ok(Some(response))
            }
            Err(e) => {
                warn!(%addr, error = %e, "initial configuration request failed");
                Ok(None)
            }
        },
    }
}
