//! Token store collaborator seam
//!
//! The agent token keys the leaf-certificate cache subscription. The store
//! is written elsewhere (API, config reload); the core only reads snapshots
//! and subscribes to change notifications so it can re-key the leaf watch.

use tokio::sync::mpsc;

/// Which token a notification subscription covers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenKind {
    /// The agent's own token.
    Agent,
}

/// A registered token-change subscription.
///
/// Hold on to it to receive change signals; hand it back via
/// [`TokenStore::stop_notify`] when done.
#[derive(Debug)]
pub struct TokenNotifier {
    /// Identifier the store uses to deregister this subscription.
    pub id: u64,
    /// Receives one message per token change.
    pub changes: mpsc::Receiver<()>,
}

/// The agent's token store, as seen by the auto-configuration core.
#[cfg_attr(test, mockall::automock)]
pub trait TokenStore: Send + Sync {
    /// Current agent token, as an atomic snapshot.
    fn agent_token(&self) -> String;

    /// Subscribe to changes of the given token.
    fn notify(&self, kind: TokenKind) -> TokenNotifier;

    /// Deregister a subscription created by [`TokenStore::notify`].
    fn stop_notify(&self, notifier: TokenNotifier);
}
