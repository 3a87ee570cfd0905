//! The cache-watch driver: roots and leaf-certificate subscriptions
//!
//! Both subscriptions live under one epoch token derived from the token the
//! control loop hands in, so stopping the driver (or the loop) cancels both
//! at once. The leaf subscription is keyed by the agent token; when the
//! token changes, the old subscription's context is cancelled *before* a
//! replacement is created, so at most one leaf subscription is ever active.
//! All updates from both subscriptions funnel into a single sink, which
//! serializes them for the control loop.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::cache::{
    Cache, CacheRequest, CacheTopic, CacheUpdate, LeafQuery, RootsQuery, LEAF_WATCH_ID,
    ROOTS_WATCH_ID,
};
use crate::error::Error;
use crate::token::TokenStore;

pub(crate) struct CacheWatcher {
    cache: Arc<dyn Cache>,
    tokens: Arc<dyn TokenStore>,
    state: Mutex<Option<WatchState>>,
}

struct WatchState {
    /// Epoch token owning both subscriptions.
    epoch: CancellationToken,
    leaf_ctx: CancellationToken,
    datacenter: String,
    node_name: String,
    sink: mpsc::Sender<CacheUpdate>,
}

impl CacheWatcher {
    pub(crate) fn new(cache: Arc<dyn Cache>, tokens: Arc<dyn TokenStore>) -> Self {
        Self {
            cache,
            tokens,
            state: Mutex::new(None),
        }
    }

    /// Subscribe to roots and leaf updates. Errors if already started.
    pub(crate) async fn start(
        &self,
        parent: CancellationToken,
        datacenter: String,
        node_name: String,
        sink: mpsc::Sender<CacheUpdate>,
    ) -> crate::Result<()> {
        let mut state = self.state.lock().await;
        if state.is_some() {
            return Err(Error::AlreadyRunning);
        }

        let epoch = parent.child_token();

        let roots_ctx = epoch.child_token();
        self.cache
            .notify(
                roots_ctx,
                CacheTopic::CaRoots,
                CacheRequest::Roots(RootsQuery {
                    datacenter: datacenter.clone(),
                }),
                ROOTS_WATCH_ID.to_string(),
                sink.clone(),
            )
            .await?;

        let leaf_ctx = epoch.child_token();
        self.cache
            .notify(
                leaf_ctx.clone(),
                CacheTopic::LeafCert,
                CacheRequest::Leaf(LeafQuery {
                    datacenter: datacenter.clone(),
                    agent: node_name.clone(),
                    token: self.tokens.agent_token(),
                }),
                LEAF_WATCH_ID.to_string(),
                sink.clone(),
            )
            .await
            .inspect_err(|_| epoch.cancel())?;

        *state = Some(WatchState {
            epoch,
            leaf_ctx,
            datacenter,
            node_name,
            sink,
        });
        debug!("cache watches established");
        Ok(())
    }

    /// Cancel both subscriptions. Returns whether the driver was running.
    pub(crate) async fn stop(&self) -> bool {
        match self.state.lock().await.take() {
            Some(state) => {
                state.epoch.cancel();
                debug!("cache watches cancelled");
                true
            }
            None => false,
        }
    }

    /// Re-key the leaf subscription with the current agent token.
    ///
    /// The old subscription is cancelled before the replacement is created;
    /// the roots subscription is untouched. A no-op when not running.
    pub(crate) async fn restart_leaf_watch(&self) -> crate::Result<()> {
        let mut guard = self.state.lock().await;
        let Some(state) = guard.as_mut() else {
            return Ok(());
        };

        state.leaf_ctx.cancel();

        let leaf_ctx = state.epoch.child_token();
        self.cache
            .notify(
                leaf_ctx.clone(),
                CacheTopic::LeafCert,
                CacheRequest::Leaf(LeafQuery {
                    datacenter: state.datacenter.clone(),
                    agent: state.node_name.clone(),
                    token: self.tokens.agent_token(),
                }),
                LEAF_WATCH_ID.to_string(),
                state.sink.clone(),
            )
            .await?;

        state.leaf_ctx = leaf_ctx;
        debug!("leaf certificate watch restarted");
        Ok(())
    }
}
