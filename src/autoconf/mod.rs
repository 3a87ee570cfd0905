//! The auto-configuration core
//!
//! [`AutoConfig`] bootstraps an agent's runtime configuration and TLS
//! identity from a cluster of servers and keeps that identity fresh for the
//! life of the process:
//!
//! 1. [`AutoConfig::initial_configuration`] loads persisted state if a
//!    usable copy exists, otherwise drives the one-shot
//!    `AutoConfig.InitialConfiguration` RPC across the configured candidate
//!    servers, persisting and installing whatever the servers return.
//! 2. [`AutoConfig::start`] launches the control loop that watches the
//!    cache for root and leaf updates, re-keys the leaf watch on agent
//!    token changes, and re-bootstraps when the leaf certificate expires
//!    without being rotated.
//!
//! Construction fails fast when a required collaborator is missing; a core
//! with `auto_config.enabled = false` is a no-op that never touches
//! persistence.

mod assemble;
mod bootstrap;
pub mod persist;
mod resolve;
mod run;
#[cfg(test)]
pub(crate) mod testing;
mod watches;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use palisade_common::RetryWaiter;
use palisade_proto::{AgentConfig, AutoConfigResponse};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::Cache;
use crate::config::{ConfigLoader, RuntimeConfig};
use crate::error::Error;
use crate::rpc::{DirectRpc, ServerProvider};
use crate::tls::TlsConfigurator;
use crate::token::TokenStore;

use watches::CacheWatcher;

/// Default interval between fallback attempts once the leaf has expired.
pub const DEFAULT_FALLBACK_RETRY: Duration = Duration::from_secs(60);

/// Default head start before leaf expiry at which the fallback timer fires.
pub const DEFAULT_FALLBACK_LEEWAY: Duration = Duration::from_secs(10);

/// Collaborators and tunables for [`AutoConfig::new`].
///
/// The loader, direct RPC delegate, cache, token store, and TLS configurator
/// are required; everything else has a default.
#[derive(Default)]
pub struct Config {
    /// Merges configuration layers; required.
    pub loader: Option<Arc<dyn ConfigLoader>>,
    /// Issues the bootstrap RPC; required.
    pub direct_rpc: Option<Arc<dyn DirectRpc>>,
    /// The agent's generic cache; required.
    pub cache: Option<Arc<dyn Cache>>,
    /// The agent's token store; required.
    pub tokens: Option<Arc<dyn TokenStore>>,
    /// Installs TLS material; required.
    pub tls: Option<Arc<dyn TlsConfigurator>>,
    /// Supplies an already-known server for bootstrap, if any.
    pub server_provider: Option<Arc<dyn ServerProvider>>,
    /// Backoff pacing between bootstrap passes.
    pub waiter: Option<RetryWaiter>,
    /// Interval between fallback attempts; defaults to one minute.
    pub fallback_retry: Option<Duration>,
    /// Head start before leaf expiry; defaults to ten seconds.
    pub fallback_leeway: Option<Duration>,
}

/// Validated collaborators, shared by every part of the core.
pub(crate) struct Deps {
    pub(crate) loader: Arc<dyn ConfigLoader>,
    pub(crate) direct_rpc: Arc<dyn DirectRpc>,
    pub(crate) cache: Arc<dyn Cache>,
    pub(crate) tokens: Arc<dyn TokenStore>,
    pub(crate) tls: Arc<dyn TlsConfigurator>,
    pub(crate) server_provider: Option<Arc<dyn ServerProvider>>,
    pub(crate) waiter: RetryWaiter,
    pub(crate) fallback_retry: Duration,
    pub(crate) fallback_leeway: Duration,
}

#[derive(Clone)]
pub(crate) struct RunHandle {
    pub(crate) cancel: CancellationToken,
}

/// Mutable state guarded by the core's single lock.
pub(crate) struct CoreState {
    pub(crate) config: Option<RuntimeConfig>,
    pub(crate) source: Option<AgentConfig>,
    pub(crate) response: Option<AutoConfigResponse>,
    /// The leaf private key; lives here and nowhere on disk.
    pub(crate) leaf_key: Option<String>,
    pub(crate) run: Option<RunHandle>,
    /// Cancelled exactly when the control loop is not running.
    pub(crate) done: CancellationToken,
}

pub(crate) struct Inner {
    pub(crate) deps: Deps,
    pub(crate) watcher: CacheWatcher,
    pub(crate) state: Mutex<CoreState>,
}

/// The auto-configuration core. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct AutoConfig {
    pub(crate) inner: Arc<Inner>,
}

impl AutoConfig {
    /// Validate collaborators and build a core in the `Stopped` state.
    pub fn new(config: Config) -> crate::Result<Self> {
        let loader = config
            .loader
            .ok_or_else(|| Error::config("must provide a config loader"))?;
        let direct_rpc = config
            .direct_rpc
            .ok_or_else(|| Error::config("must provide a direct RPC delegate"))?;
        let cache = config
            .cache
            .ok_or_else(|| Error::config("must provide a cache"))?;
        let tokens = config
            .tokens
            .ok_or_else(|| Error::config("must provide a token store"))?;
        let tls = config
            .tls
            .ok_or_else(|| Error::config("must provide a TLS configurator"))?;

        let deps = Deps {
            loader,
            direct_rpc,
            cache: cache.clone(),
            tokens: tokens.clone(),
            tls,
            server_provider: config.server_provider,
            waiter: config.waiter.unwrap_or_default(),
            fallback_retry: config.fallback_retry.unwrap_or(DEFAULT_FALLBACK_RETRY),
            fallback_leeway: config.fallback_leeway.unwrap_or(DEFAULT_FALLBACK_LEEWAY),
        };

        let done = CancellationToken::new();
        done.cancel();

        Ok(Self {
            inner: Arc::new(Inner {
                deps,
                watcher: CacheWatcher::new(cache, tokens),
                state: Mutex::new(CoreState {
                    config: None,
                    source: None,
                    response: None,
                    leaf_key: None,
                    run: None,
                    done,
                }),
            }),
        })
    }

    /// Run the loader with the currently injected auto-config source and
    /// cache the merged result.
    pub fn read_config(&self) -> crate::Result<RuntimeConfig> {
        let source = self.inner.state.lock().unwrap().source.clone();
        let loaded = self.inner.deps.loader.load(source)?;
        for warning in &loaded.warnings {
            warn!(warning = %warning, "configuration warning");
        }
        self.inner.state.lock().unwrap().config = Some(loaded.config.clone());
        Ok(loaded.config)
    }

    /// Obtain the agent's starting configuration.
    ///
    /// When auto-configuration is disabled this merges and returns the
    /// local configuration without touching persistence. When enabled, a
    /// usable persisted response short-circuits the network entirely;
    /// otherwise the bootstrap RPC is retried across the candidate servers
    /// until it succeeds or `cancel` fires.
    pub async fn initial_configuration(
        &self,
        cancel: CancellationToken,
    ) -> crate::Result<RuntimeConfig> {
        let config = self.read_config()?;
        if !config.auto_config.enabled {
            debug!("auto-config is disabled");
            return Ok(config);
        }
        validate_enabled(&config)?;

        if let Some(config) = self.try_restore(&config).await {
            return Ok(config);
        }

        let mut waiter = self.inner.deps.waiter.clone();
        let params = bootstrap::BootstrapParams {
            datacenter: &config.datacenter,
            node_name: &config.node_name,
            intro_token: &config.auto_config.intro_token,
            server_addresses: &config.auto_config.server_addresses,
        };
        let response = bootstrap::fetch_initial_configuration(
            self.inner.deps.direct_rpc.as_ref(),
            self.inner.deps.server_provider.as_deref(),
            &mut waiter,
            &params,
            &cancel,
        )
        .await?;

        info!("auto-config settings received from the servers");
        self.apply_response(response, true).await
    }

    /// Attempt to restore a persisted response. `None` means the caller
    /// should bootstrap over the network.
    async fn try_restore(&self, config: &RuntimeConfig) -> Option<RuntimeConfig> {
        let response = match persist::read(&config.data_dir).await {
            Ok(Some(response)) => response,
            Ok(None) => return None,
            Err(e) => {
                warn!(error = %e, "failed to read persisted auto-config; falling back to live bootstrap");
                return None;
            }
        };

        match self.apply_response(response, false).await {
            Ok(config) => {
                info!("restored auto-config from persisted state");
                Some(config)
            }
            Err(e) => {
                warn!(error = %e, "persisted auto-config is unusable; falling back to live bootstrap");
                None
            }
        }
    }

    /// Fold a bootstrap response into the agent: validate it, inject its
    /// config layer, install the TLS identity, seed the cache, and (when
    /// asked) persist it. Replaces the previous response atomically.
    pub(crate) async fn apply_response(
        &self,
        response: AutoConfigResponse,
        persist_it: bool,
    ) -> crate::Result<RuntimeConfig> {
        assemble::validate_response(&response)?;

        // The key is only ever held in memory. A response without one (for
        // example, restored from disk) can still be applied when a key from
        // an earlier response is around.
        let key_pem = response
            .certificate
            .as_ref()
            .filter(|c| c.has_private_key())
            .map(|c| c.private_key_pem.clone())
            .or_else(|| self.inner.state.lock().unwrap().leaf_key.clone())
            .ok_or_else(|| Error::assembly("leaf private key unavailable"))?;

        {
            let mut state = self.inner.state.lock().unwrap();
            state.source = response.config.clone();
            state.leaf_key = Some(key_pem.clone());
        }

        let config = self.read_config()?;
        assemble::install(&self.inner.deps, &config, &response, &key_pem)?;
        assemble::prepopulate(&self.inner.deps, &config, &response, &key_pem).await;

        if persist_it {
            if let Err(e) = persist::write(&config.data_dir, &response).await {
                warn!(error = %e, "failed to persist auto-config response");
            }
        }

        self.inner.state.lock().unwrap().response = Some(response);
        Ok(config)
    }
}

/// Check the option invariants that only matter once auto-config is on.
fn validate_enabled(config: &RuntimeConfig) -> crate::Result<()> {
    if !config.verify_outgoing {
        return Err(Error::config(
            "auto_config.enabled requires verify_outgoing = true",
        ));
    }
    if config.auto_config.intro_token.is_empty() {
        return Err(Error::config(
            "auto_config.intro_token must be set when auto_config is enabled",
        ));
    }
    if config.auto_config.server_addresses.is_empty() {
        return Err(Error::config(
            "auto_config.server_addresses must not be empty when auto_config is enabled",
        ));
    }
    if config.data_dir.as_os_str().is_empty() {
        return Err(Error::config(
            "data_dir must be configured when auto_config is enabled",
        ));
    }
    Ok(())
}
