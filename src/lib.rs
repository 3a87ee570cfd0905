//! Palisade - auto-configuration core for a distributed agent
//!
//! A fresh agent, given only a signed introduction credential and a list of
//! candidate server endpoints, obtains its full operational configuration,
//! its initial signed certificate, the trust roots of the cluster, and any
//! additional trust anchors. After bootstrap, the core keeps roots and leaf
//! certificates current by watching the agent's cache, persists updates for
//! crash recovery, and falls back to a fresh bootstrap when the leaf
//! certificate becomes unrecoverable.
//!
//! # Architecture
//!
//! The core talks to the rest of the agent exclusively through narrow
//! collaborator traits: [`rpc::DirectRpc`] for the one bootstrap RPC,
//! [`cache::Cache`] for watch subscriptions, [`token::TokenStore`] for the
//! agent token keying the leaf watch, [`tls::TlsConfigurator`] for installing
//! TLS material, and [`config::ConfigLoader`] for layering delivered
//! configuration between defaults and user overrides. The transport, the
//! cache, and the TLS plumbing themselves live elsewhere.
//!
//! [`autoconf::AutoConfig`] wires these together: `initial_configuration`
//! drives the one-shot bootstrap (or restores persisted state), and
//! `start`/`stop` manage the long-running loop that reacts to root and leaf
//! updates, token changes, and certificate expiry.

pub mod autoconf;
pub mod cache;
pub mod config;
pub mod error;
pub mod rpc;
pub mod tls;
pub mod token;

pub use autoconf::AutoConfig;
pub use error::Error;

/// Result type alias using the crate's [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
