//! TLS configurator collaborator seam
//!
//! The installer owns the agent's actual TLS state (rustls configs,
//! listeners, outgoing verification). The core hands it complete identities
//! only: every update carries roots, leaf, extra anchors, and the hostname
//! verification policy in a single call, so observers never see a partially
//! updated identity.

use std::time::SystemTime;

/// The agent's TLS installer, as seen by the auto-configuration core.
#[cfg_attr(test, mockall::automock)]
pub trait TlsConfigurator: Send + Sync {
    /// Atomically install a complete auto-TLS identity.
    fn update_auto_tls(
        &self,
        extra_cas: &[String],
        root_pems: &[String],
        cert_pem: &str,
        key_pem: &str,
        verify_server_hostname: bool,
    ) -> crate::Result<()>;

    /// Expiry of the currently installed leaf, if one is installed.
    fn auto_tls_cert_not_after(&self) -> Option<SystemTime>;

    /// Whether the currently installed leaf has expired.
    fn auto_tls_cert_expired(&self) -> bool;
}
