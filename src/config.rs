//! Runtime configuration for the agent
//!
//! The agent's configuration is assembled from three layers, lowest
//! precedence first: baseline defaults, fields delivered by the servers
//! during auto-configuration, and user-supplied overrides. User overrides
//! always win. Parsing configuration *files* is someone else's job; this
//! module works on already-parsed layers and exposes the [`ConfigLoader`]
//! seam the auto-configuration core drives.

use std::path::PathBuf;

use palisade_proto::AgentConfig;
use serde::{Deserialize, Serialize};

/// Fully merged configuration the agent runs with.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RuntimeConfig {
    /// Datacenter this agent belongs to.
    pub datacenter: String,
    /// Node name of this agent.
    pub node_name: String,
    /// Name of the primary datacenter of the cluster.
    pub primary_datacenter: String,
    /// Directory for persistent agent state.
    pub data_dir: PathBuf,
    /// Address the agent binds to.
    pub bind_addr: String,
    /// Whether outgoing connections require TLS verification.
    pub verify_outgoing: bool,
    /// Whether outgoing TLS connections verify the server hostname.
    pub verify_server_hostname: bool,
    /// ACL token used when a request carries no explicit token.
    pub acl_default_token: Option<String>,
    /// Auto-configuration options.
    pub auto_config: AutoConfigSettings,
}

/// The `auto_config` option block.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AutoConfigSettings {
    /// Master switch; when false the core is a no-op.
    pub enabled: bool,
    /// Introduction credential presented on the bootstrap RPC.
    pub intro_token: String,
    /// Candidate bootstrap endpoints as `host:port` strings.
    pub server_addresses: Vec<String>,
}

/// One configuration layer; every field optional so layers compose.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PartialConfig {
    /// Datacenter override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datacenter: Option<String>,
    /// Node name override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,
    /// Primary datacenter override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_datacenter: Option<String>,
    /// Data directory override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
    /// Bind address override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind_addr: Option<String>,
    /// `verify_outgoing` override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verify_outgoing: Option<bool>,
    /// `verify_server_hostname` override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verify_server_hostname: Option<bool>,
    /// ACL default token override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acl_default_token: Option<String>,
    /// `auto_config` block override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_config: Option<PartialAutoConfig>,
}

/// The `auto_config` block of one configuration layer.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialAutoConfig {
    /// Master switch override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    /// Introduction credential override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intro_token: Option<String>,
    /// Bootstrap endpoint list override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_addresses: Option<Vec<String>>,
}

/// Merge defaults, the server-delivered layer, and user overrides into a
/// [`RuntimeConfig`]. Pure and deterministic; returns non-fatal warnings.
pub fn build_runtime_config(
    user: &PartialConfig,
    delivered: Option<&AgentConfig>,
) -> (RuntimeConfig, Vec<String>) {
    let mut cfg = RuntimeConfig {
        datacenter: "dc1".to_string(),
        bind_addr: "0.0.0.0".to_string(),
        ..RuntimeConfig::default()
    };
    let mut warnings = Vec::new();

    if let Some(agent_cfg) = delivered {
        if let Some(primary) = &agent_cfg.primary_datacenter {
            cfg.primary_datacenter = primary.clone();
        }
        if let Some(tls) = &agent_cfg.tls {
            if let Some(verify) = tls.verify_server_hostname {
                cfg.verify_server_hostname = verify;
            }
        }
        if let Some(acl) = &agent_cfg.acl {
            if let Some(token) = &acl.default_token {
                cfg.acl_default_token = Some(token.clone());
            }
        }
        for key in agent_cfg.unknown.keys() {
            warnings.push(format!(
                "ignoring unrecognized field in server-delivered config: {key}"
            ));
        }
    }

    if let Some(dc) = &user.datacenter {
        cfg.datacenter = dc.clone();
    }
    if let Some(node) = &user.node_name {
        cfg.node_name = node.clone();
    }
    if let Some(primary) = &user.primary_datacenter {
        cfg.primary_datacenter = primary.clone();
    }
    if let Some(dir) = &user.data_dir {
        cfg.data_dir = dir.clone();
    }
    if let Some(bind) = &user.bind_addr {
        cfg.bind_addr = bind.clone();
    }
    if let Some(verify) = user.verify_outgoing {
        cfg.verify_outgoing = verify;
    }
    if let Some(verify) = user.verify_server_hostname {
        cfg.verify_server_hostname = verify;
    }
    if let Some(token) = &user.acl_default_token {
        cfg.acl_default_token = Some(token.clone());
    }
    if let Some(ac) = &user.auto_config {
        if let Some(enabled) = ac.enabled {
            cfg.auto_config.enabled = enabled;
        }
        if let Some(token) = &ac.intro_token {
            cfg.auto_config.intro_token = token.clone();
        }
        if let Some(addrs) = &ac.server_addresses {
            cfg.auto_config.server_addresses = addrs.clone();
        }
    }

    if cfg.primary_datacenter.is_empty() {
        cfg.primary_datacenter = cfg.datacenter.clone();
    }

    (cfg, warnings)
}

/// The result of one [`ConfigLoader::load`] call.
#[derive(Clone, Debug)]
pub struct LoadedConfig {
    /// The merged runtime configuration.
    pub config: RuntimeConfig,
    /// Non-fatal problems discovered while merging.
    pub warnings: Vec<String>,
}

/// Loads the agent's configuration, layering an optional server-delivered
/// source between defaults and user overrides.
///
/// The auto-configuration core re-invokes the loader whenever the delivered
/// layer changes.
#[cfg_attr(test, mockall::automock)]
pub trait ConfigLoader: Send + Sync {
    /// Merge configuration with `source` injected below user overrides.
    fn load(&self, source: Option<AgentConfig>) -> crate::Result<LoadedConfig>;
}

/// [`ConfigLoader`] over a fixed, already-parsed user layer.
#[derive(Clone, Debug, Default)]
pub struct LayeredLoader {
    /// The user-supplied configuration layer.
    pub user: PartialConfig,
}

impl LayeredLoader {
    /// Create a loader for the given user layer.
    pub fn new(user: PartialConfig) -> Self {
        Self { user }
    }
}

impl ConfigLoader for LayeredLoader {
    fn load(&self, source: Option<AgentConfig>) -> crate::Result<LoadedConfig> {
        let (config, warnings) = build_runtime_config(&self.user, source.as_ref());
        Ok(LoadedConfig { config, warnings })
    }
}
