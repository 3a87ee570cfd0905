//! The control loop: running/stopped lifecycle and update multiplexing
//!
//! While running, one task multiplexes four sources: cache updates for
//! roots and leaf, agent-token change notifications, and the fallback
//! timer. Events are handled strictly one at a time; every handled event
//! re-derives the fallback deadline only after installation and
//! persistence, so a concurrent expiry check never observes stale material.
//!
//! The fallback deadline is `min(leaf expiry - leeway, now + retry)`. A
//! tick that finds the certificate unexpired merely re-arms; a tick that
//! finds it expired re-bootstraps through the local-server hint, installs
//! and persists the fresh identity, and starts a new watch epoch because
//! the token-keyed leaf entry may have gone stale.

use std::time::{Duration, SystemTime};

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{CacheUpdate, CacheValue};
use crate::error::Error;
use crate::token::{TokenKind, TokenNotifier};

use super::{assemble, bootstrap, persist, AutoConfig, RunHandle};

/// Upper bound on how long [`AutoConfig::stop`] waits for the loop to exit.
pub const STOP_GRACE: Duration = Duration::from_secs(5);

const EVENT_CHANNEL_CAPACITY: usize = 16;

impl AutoConfig {
    /// Launch the control loop. Fails when already running, or before any
    /// configuration has been read.
    pub async fn start(&self, parent: CancellationToken) -> crate::Result<()> {
        let config = self
            .inner
            .state
            .lock()
            .unwrap()
            .config
            .clone()
            .ok_or_else(|| {
                Error::config("configuration must be loaded before starting the watcher")
            })?;

        let cancel = parent.child_token();
        let done = CancellationToken::new();
        {
            let mut state = self.inner.state.lock().unwrap();
            if state.run.is_some() {
                return Err(Error::AlreadyRunning);
            }
            state.run = Some(RunHandle {
                cancel: cancel.clone(),
            });
            state.done = done.clone();
        }

        let (sink, events) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let notifier = self.inner.deps.tokens.notify(TokenKind::Agent);

        if let Err(e) = self
            .inner
            .watcher
            .start(
                cancel.clone(),
                config.datacenter.clone(),
                config.node_name.clone(),
                sink.clone(),
            )
            .await
        {
            self.inner.deps.tokens.stop_notify(notifier);
            let mut state = self.inner.state.lock().unwrap();
            state.run = None;
            state.done.cancel();
            return Err(e);
        }

        tokio::spawn(
            self.clone()
                .run_loop(events, sink, notifier, cancel, done),
        );
        info!("auto-config watcher started");
        Ok(())
    }

    /// Cancel the control loop and wait up to the stop grace period (five
    /// seconds) for it to exit. Returns whether it was running; a stopped
    /// core is untouched.
    pub async fn stop(&self) -> bool {
        let (cancel, done) = {
            let state = self.inner.state.lock().unwrap();
            match &state.run {
                Some(handle) => (handle.cancel.clone(), state.done.clone()),
                None => return false,
            }
        };

        cancel.cancel();
        if tokio::time::timeout(STOP_GRACE, done.cancelled())
            .await
            .is_err()
        {
            warn!("auto-config watcher did not stop within the grace period");
        }
        true
    }

    /// Whether the control loop is currently running.
    pub fn is_running(&self) -> bool {
        !self.inner.state.lock().unwrap().done.is_cancelled()
    }

    /// A token that is cancelled exactly when the loop is not running:
    /// already cancelled before the first start, open while running, and
    /// cancelled again once the loop exits.
    pub fn done(&self) -> CancellationToken {
        self.inner.state.lock().unwrap().done.clone()
    }

    async fn run_loop(
        self,
        mut events: mpsc::Receiver<CacheUpdate>,
        sink: mpsc::Sender<CacheUpdate>,
        mut notifier: TokenNotifier,
        cancel: CancellationToken,
        done: CancellationToken,
    ) {
        debug!("auto-config watcher loop running");
        let mut token_changes_open = true;
        // floor prevents a failed fallback from spinning the timer
        let mut fallback_floor = Instant::now();

        loop {
            let deadline = self.next_fallback_deadline().max(fallback_floor);
            tokio::select! {
                _ = cancel.cancelled() => break,
                update = events.recv() => match update {
                    Some(update) => {
                        self.handle_cache_update(update).await;
                        fallback_floor = Instant::now();
                    }
                    None => break,
                },
                change = notifier.changes.recv(), if token_changes_open => match change {
                    Some(()) => self.handle_token_update().await,
                    None => token_changes_open = false,
                },
                _ = tokio::time::sleep_until(deadline) => {
                    self.handle_fallback_tick(&cancel, &sink).await;
                    fallback_floor = Instant::now() + self.inner.deps.fallback_retry;
                }
            }
        }

        self.inner.watcher.stop().await;
        self.inner.deps.tokens.stop_notify(notifier);
        self.inner.state.lock().unwrap().run = None;
        done.cancel();
        debug!("auto-config watcher loop exited");
    }

    async fn handle_cache_update(&self, update: CacheUpdate) {
        debug!(
            correlation_id = %update.correlation_id,
            index = update.index,
            "cache update received"
        );

        {
            let mut state = self.inner.state.lock().unwrap();
            match update.value {
                CacheValue::Roots(roots) => {
                    state.response.get_or_insert_with(Default::default).ca_roots = Some(roots);
                }
                CacheValue::Leaf(cert) => {
                    if cert.has_private_key() {
                        state.leaf_key = Some(cert.private_key_pem.clone());
                    }
                    state.response.get_or_insert_with(Default::default).certificate = Some(cert);
                }
            }
        }

        self.install_and_persist().await;
    }

    /// Push the current identity into the TLS configurator and persist it.
    /// Failures are logged; the loop keeps going either way.
    async fn install_and_persist(&self) {
        let (config, response, key_pem) = {
            let state = self.inner.state.lock().unwrap();
            let (Some(config), Some(response)) = (state.config.clone(), state.response.clone())
            else {
                return;
            };
            let Some(key_pem) = state.leaf_key.clone() else {
                debug!("no leaf private key yet; deferring TLS install");
                return;
            };
            (config, response, key_pem)
        };

        if response.certificate.is_none() || response.ca_roots.is_none() {
            debug!("identity incomplete; deferring TLS install");
            return;
        }

        if let Err(e) = assemble::install(&self.inner.deps, &config, &response, &key_pem) {
            warn!(error = %e, "failed to update TLS material");
        }
        if let Err(e) = persist::write(&config.data_dir, &response).await {
            warn!(error = %e, "failed to persist auto-config response");
        }
    }

    async fn handle_token_update(&self) {
        debug!("agent token changed; resetting the leaf certificate watch");
        if let Err(e) = self.inner.watcher.restart_leaf_watch().await {
            warn!(error = %e, "failed to restart the leaf certificate watch");
        }
    }

    async fn handle_fallback_tick(
        &self,
        cancel: &CancellationToken,
        sink: &mpsc::Sender<CacheUpdate>,
    ) {
        if !self.inner.deps.tls.auto_tls_cert_expired() {
            return;
        }

        warn!("installed certificate has expired; falling back to a fresh bootstrap");
        let Some(config) = self.inner.state.lock().unwrap().config.clone() else {
            return;
        };

        let params = bootstrap::BootstrapParams {
            datacenter: &config.datacenter,
            node_name: &config.node_name,
            intro_token: &config.auto_config.intro_token,
            server_addresses: &config.auto_config.server_addresses,
        };
        let outcome = bootstrap::one_pass(
            self.inner.deps.direct_rpc.as_ref(),
            self.inner.deps.server_provider.as_deref(),
            &params,
            cancel,
        )
        .await;

        let response = match outcome {
            Ok(Some(response)) => response,
            Ok(None) => {
                warn!("fallback bootstrap exhausted all servers; will retry");
                return;
            }
            Err(e) => {
                debug!(error = %e, "fallback bootstrap cancelled");
                return;
            }
        };

        match self.apply_response(response, true).await {
            Ok(config) => {
                // The leaf cache entry is keyed by the agent token and may
                // now be stale; start a fresh watch epoch.
                self.inner.watcher.stop().await;
                if let Err(e) = self
                    .inner
                    .watcher
                    .start(
                        cancel.clone(),
                        config.datacenter.clone(),
                        config.node_name.clone(),
                        sink.clone(),
                    )
                    .await
                {
                    warn!(error = %e, "failed to restart cache watches after fallback");
                }
                info!("fallback bootstrap complete");
            }
            Err(e) => warn!(error = %e, "fallback bootstrap produced an unusable response"),
        }
    }

    fn next_fallback_deadline(&self) -> Instant {
        let deps = &self.inner.deps;
        let delay = match deps.tls.auto_tls_cert_not_after() {
            Some(not_after) => not_after
                .duration_since(SystemTime::now())
                .unwrap_or(Duration::ZERO)
                .saturating_sub(deps.fallback_leeway)
                .min(deps.fallback_retry),
            None => deps.fallback_retry,
        };
        Instant::now() + delay
    }
}
