//! Folding a bootstrap response into installed agent state
//!
//! Validation checks that a response is self-consistent before anything is
//! mutated: the leaf must chain to one of the delivered trust roots or to
//! one of the extra anchors. Installation pushes the complete identity into
//! the TLS configurator in a single call and then seeds the cache, so
//! watchers and observers only ever see matching roots and leaf.

use palisade_common::pki;
use palisade_proto::AutoConfigResponse;
use tracing::{debug, warn};

use crate::cache::{
    CacheRequest, CacheTopic, CacheValue, LeafQuery, RootsQuery, LEAF_WATCH_ID, ROOTS_WATCH_ID,
};
use crate::config::RuntimeConfig;
use crate::error::Error;

use super::Deps;

/// Check that a response carries an installable identity.
pub(crate) fn validate_response(response: &AutoConfigResponse) -> crate::Result<()> {
    let cert = response
        .certificate
        .as_ref()
        .ok_or_else(|| Error::assembly("no certificate in response"))?;
    let roots = response
        .ca_roots
        .as_ref()
        .ok_or_else(|| Error::assembly("no CA roots in response"))?;

    if roots.active_root().is_none() {
        return Err(Error::assembly(format!(
            "active root {} is not among the delivered roots",
            roots.active_root_id
        )));
    }

    let mut trust = roots.root_pems();
    trust.extend(response.extra_ca_certificates.iter().cloned());

    match pki::leaf_chains_to_any(&cert.cert_pem, &trust) {
        Ok(true) => Ok(()),
        Ok(false) => Err(Error::assembly(
            "certificate does not chain to any delivered trust root",
        )),
        Err(e) => Err(Error::assembly(format!("certificate unparseable: {e}"))),
    }
}

/// Install the response's identity into the TLS configurator.
///
/// Exactly one `update_auto_tls` call per invocation, carrying roots, leaf,
/// extra anchors, and the hostname verification policy together.
pub(crate) fn install(
    deps: &Deps,
    config: &RuntimeConfig,
    response: &AutoConfigResponse,
    key_pem: &str,
) -> crate::Result<()> {
    let (Some(cert), Some(roots)) = (&response.certificate, &response.ca_roots) else {
        debug!("response has no complete identity yet; skipping TLS install");
        return Ok(());
    };

    deps.tls.update_auto_tls(
        &response.extra_ca_certificates,
        &roots.root_pems(),
        &cert.cert_pem,
        key_pem,
        config.verify_server_hostname,
    )
}

/// Seed the cache with the response's roots and leaf so the watches see the
/// current values without refetching. Failures are logged, not fatal.
pub(crate) async fn prepopulate(
    deps: &Deps,
    config: &RuntimeConfig,
    response: &AutoConfigResponse,
    key_pem: &str,
) {
    if let Some(roots) = &response.ca_roots {
        let request = CacheRequest::Roots(RootsQuery {
            datacenter: config.datacenter.clone(),
        });
        if let Err(e) = deps
            .cache
            .prepopulate(
                CacheTopic::CaRoots,
                request,
                CacheValue::Roots(roots.clone()),
                roots.index,
            )
            .await
        {
            warn!(correlation_id = ROOTS_WATCH_ID, error = %e, "failed to prepopulate cache");
        }
    }

    if let Some(cert) = &response.certificate {
        // The cache keys the leaf entry by the agent token; use the same
        // snapshot the watch setup will read.
        let request = CacheRequest::Leaf(LeafQuery {
            datacenter: config.datacenter.clone(),
            agent: config.node_name.clone(),
            token: deps.tokens.agent_token(),
        });
        let mut cert = cert.clone();
        cert.private_key_pem = key_pem.to_string();
        let index = cert.index;
        if let Err(e) = deps
            .cache
            .prepopulate(CacheTopic::LeafCert, request, CacheValue::Leaf(cert), index)
            .await
        {
            warn!(correlation_id = LEAF_WATCH_ID, error = %e, "failed to prepopulate cache");
        }
    }
}
