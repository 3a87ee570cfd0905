//! Hand-rolled collaborator fakes for exercising the core end to end
//!
//! Mockall mocks work well for strict call-shape expectations; the
//! event-driven scenarios need doubles with real plumbing instead: an RPC
//! delegate scripted per address, a cache that hands test code the
//! registered sinks so it can inject updates, a TLS recorder that derives
//! expiry from the certificates it is given, and a token store whose value
//! and change channel the test controls.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use palisade_common::{pki, RetryWaiter};
use palisade_proto::{
    AgentConfig, AutoConfigRequest, AutoConfigResponse, CaRoot, CaRoots, IssuedCert, TlsSettings,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::cache::{Cache, CacheRequest, CacheTopic, CacheUpdate, CacheValue};
use crate::config::{LayeredLoader, PartialAutoConfig, PartialConfig};
use crate::error::Error;
use crate::rpc::{DirectRpc, Server, ServerProvider};
use crate::tls::TlsConfigurator;
use crate::token::{TokenKind, TokenNotifier, TokenStore};

use super::{persist, AutoConfig, Config};

pub(crate) fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")),
        )
        .with_test_writer()
        .try_init();
}

/// Poll `condition` every few milliseconds for up to two seconds.
pub(crate) async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

// =============================================================================
// Scripted RPC delegate
// =============================================================================

#[derive(Clone, Debug)]
pub(crate) struct RecordedCall {
    pub datacenter: String,
    pub node: String,
    pub addr: SocketAddr,
    pub method: String,
    pub request: AutoConfigRequest,
}

enum AddrScript {
    /// Fail `remaining` more times, then answer.
    FailThenRespond {
        remaining: u32,
        response: AutoConfigResponse,
    },
}

/// [`DirectRpc`] double scripted per address. Addresses without a script
/// always fail, which is also the default for every address.
#[derive(Default)]
pub(crate) struct FakeRpc {
    script: Mutex<HashMap<SocketAddr, AddrScript>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl FakeRpc {
    pub(crate) fn respond(&self, addr: SocketAddr, response: AutoConfigResponse) {
        self.fail_then_respond(addr, 0, response);
    }

    pub(crate) fn fail_then_respond(
        &self,
        addr: SocketAddr,
        failures: u32,
        response: AutoConfigResponse,
    ) {
        self.script.lock().unwrap().insert(
            addr,
            AddrScript::FailThenRespond {
                remaining: failures,
                response,
            },
        );
    }

    pub(crate) fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn call_addrs(&self) -> Vec<SocketAddr> {
        self.calls.lock().unwrap().iter().map(|c| c.addr).collect()
    }
}

#[async_trait]
impl DirectRpc for FakeRpc {
    async fn rpc(
        &self,
        datacenter: &str,
        node: &str,
        addr: SocketAddr,
        method: &str,
        request: &AutoConfigRequest,
    ) -> crate::Result<AutoConfigResponse> {
        self.calls.lock().unwrap().push(RecordedCall {
            datacenter: datacenter.to_string(),
            node: node.to_string(),
            addr,
            method: method.to_string(),
            request: request.clone(),
        });

        let mut script = self.script.lock().unwrap();
        match script.get_mut(&addr) {
            Some(AddrScript::FailThenRespond { remaining, response }) => {
                if *remaining > 0 {
                    *remaining -= 1;
                    Err(Error::rpc(format!("injected failure for {addr}")))
                } else {
                    Ok(response.clone())
                }
            }
            None => Err(Error::rpc(format!("injected failure for {addr}"))),
        }
    }
}

// =============================================================================
// Channel-backed cache
// =============================================================================

#[derive(Clone)]
pub(crate) struct Registration {
    pub topic: CacheTopic,
    pub request: CacheRequest,
    pub correlation_id: String,
    pub ctx: CancellationToken,
    pub sink: mpsc::Sender<CacheUpdate>,
}

#[derive(Clone)]
pub(crate) struct Prepopulation {
    pub topic: CacheTopic,
    pub request: CacheRequest,
    pub value: CacheValue,
    pub index: u64,
}

/// [`Cache`] double that records registrations and lets tests push updates
/// into the most recent live subscription for a correlation ID.
#[derive(Default)]
pub(crate) struct FakeCache {
    registrations: Mutex<Vec<Registration>>,
    prepopulations: Mutex<Vec<Prepopulation>>,
}

impl FakeCache {
    pub(crate) fn registrations(&self) -> Vec<Registration> {
        self.registrations.lock().unwrap().clone()
    }

    pub(crate) fn prepopulations(&self) -> Vec<Prepopulation> {
        self.prepopulations.lock().unwrap().clone()
    }

    /// Deliver an update through the latest live subscription registered
    /// under `correlation_id`. Returns whether one accepted it.
    pub(crate) async fn send_update(
        &self,
        correlation_id: &str,
        value: CacheValue,
        index: u64,
    ) -> bool {
        let registration = self
            .registrations
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|r| r.correlation_id == correlation_id && !r.ctx.is_cancelled())
            .cloned();

        match registration {
            Some(registration) => registration
                .sink
                .send(CacheUpdate {
                    correlation_id: correlation_id.to_string(),
                    value,
                    index,
                })
                .await
                .is_ok(),
            None => false,
        }
    }
}

#[async_trait]
impl Cache for FakeCache {
    async fn notify(
        &self,
        ctx: CancellationToken,
        topic: CacheTopic,
        request: CacheRequest,
        correlation_id: String,
        sink: mpsc::Sender<CacheUpdate>,
    ) -> crate::Result<()> {
        self.registrations.lock().unwrap().push(Registration {
            topic,
            request,
            correlation_id,
            ctx,
            sink,
        });
        Ok(())
    }

    async fn prepopulate(
        &self,
        topic: CacheTopic,
        request: CacheRequest,
        value: CacheValue,
        index: u64,
    ) -> crate::Result<()> {
        self.prepopulations.lock().unwrap().push(Prepopulation {
            topic,
            request,
            value,
            index,
        });
        Ok(())
    }
}

// =============================================================================
// Swappable token store
// =============================================================================

pub(crate) struct FakeTokens {
    token: Mutex<String>,
    change_tx: Mutex<Option<mpsc::Sender<()>>>,
    next_id: AtomicU64,
    stopped: Mutex<Vec<u64>>,
}

impl FakeTokens {
    pub(crate) fn new(token: &str) -> Self {
        Self {
            token: Mutex::new(token.to_string()),
            change_tx: Mutex::new(None),
            next_id: AtomicU64::new(1),
            stopped: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn set_token(&self, token: &str) {
        *self.token.lock().unwrap() = token.to_string();
    }

    pub(crate) fn agent_token_value(&self) -> String {
        self.token.lock().unwrap().clone()
    }

    /// Signal a token change to whoever subscribed last.
    pub(crate) async fn trigger_change(&self) {
        let tx = self
            .change_tx
            .lock()
            .unwrap()
            .clone()
            .expect("no token-change subscription registered");
        tx.send(()).await.expect("token-change receiver dropped");
    }

    pub(crate) fn stop_count(&self) -> usize {
        self.stopped.lock().unwrap().len()
    }
}

impl TokenStore for FakeTokens {
    fn agent_token(&self) -> String {
        self.token.lock().unwrap().clone()
    }

    fn notify(&self, _kind: TokenKind) -> TokenNotifier {
        let (tx, rx) = mpsc::channel(4);
        *self.change_tx.lock().unwrap() = Some(tx);
        TokenNotifier {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            changes: rx,
        }
    }

    fn stop_notify(&self, notifier: TokenNotifier) {
        self.stopped.lock().unwrap().push(notifier.id);
    }
}

// =============================================================================
// Recording TLS configurator
// =============================================================================

#[derive(Clone, Debug)]
pub(crate) struct TlsUpdate {
    pub extra_cas: Vec<String>,
    pub roots: Vec<String>,
    pub cert_pem: String,
    pub key_pem: String,
    pub verify_server_hostname: bool,
}

/// [`TlsConfigurator`] double that records installs and answers expiry
/// queries from the validity window of the last installed certificate.
#[derive(Default)]
pub(crate) struct RecordingTls {
    updates: Mutex<Vec<TlsUpdate>>,
}

impl RecordingTls {
    pub(crate) fn updates(&self) -> Vec<TlsUpdate> {
        self.updates.lock().unwrap().clone()
    }
}

impl TlsConfigurator for RecordingTls {
    fn update_auto_tls(
        &self,
        extra_cas: &[String],
        root_pems: &[String],
        cert_pem: &str,
        key_pem: &str,
        verify_server_hostname: bool,
    ) -> crate::Result<()> {
        self.updates.lock().unwrap().push(TlsUpdate {
            extra_cas: extra_cas.to_vec(),
            roots: root_pems.to_vec(),
            cert_pem: cert_pem.to_string(),
            key_pem: key_pem.to_string(),
            verify_server_hostname,
        });
        Ok(())
    }

    fn auto_tls_cert_not_after(&self) -> Option<SystemTime> {
        let updates = self.updates.lock().unwrap();
        let info = pki::CertificateInfo::from_pem(&updates.last()?.cert_pem).ok()?;
        Some(UNIX_EPOCH + Duration::from_secs(info.not_after.max(0) as u64))
    }

    fn auto_tls_cert_expired(&self) -> bool {
        self.auto_tls_cert_not_after()
            .map(|not_after| not_after <= SystemTime::now())
            .unwrap_or(false)
    }
}

// =============================================================================
// Server provider
// =============================================================================

#[derive(Default)]
pub(crate) struct FakeServers {
    addr: Mutex<Option<SocketAddr>>,
}

impl FakeServers {
    pub(crate) fn set(&self, addr: Option<SocketAddr>) {
        *self.addr.lock().unwrap() = addr;
    }
}

impl ServerProvider for FakeServers {
    fn find_local_server(&self) -> Option<Server> {
        self.addr.lock().unwrap().map(|addr| Server { addr })
    }
}

// =============================================================================
// Certificate material
// =============================================================================

pub(crate) fn test_ca(name: &str) -> pki::CertificateAuthority {
    pki::CertificateAuthority::new(name).expect("CA creation should succeed")
}

pub(crate) fn root_entry(id: &str, ca: &pki::CertificateAuthority, active: bool) -> CaRoot {
    CaRoot {
        id: id.to_string(),
        name: format!("{id} CA"),
        root_cert: ca.ca_cert_pem().to_string(),
        active,
    }
}

pub(crate) fn issued_cert(
    ca: &mut pki::CertificateAuthority,
    common_name: &str,
    ttl: ::time::Duration,
    index: u64,
) -> IssuedCert {
    let material = ca
        .issue_leaf(common_name, ttl)
        .expect("leaf issuance should succeed");
    IssuedCert {
        cert_pem: material.cert_pem,
        private_key_pem: material.key_pem,
        serial: material.serial.to_string(),
        valid_after: material.not_before,
        valid_before: material.not_after,
        index,
    }
}

/// Everything `Harness::material` minted: the CA and the response built
/// from it, for tests that need to derive further certificates.
pub(crate) struct Material {
    pub ca: pki::CertificateAuthority,
    pub roots: CaRoots,
    pub response: AutoConfigResponse,
}

// =============================================================================
// Harness
// =============================================================================

pub(crate) struct Harness {
    pub dir: tempfile::TempDir,
    pub rpc: Arc<FakeRpc>,
    pub cache: Arc<FakeCache>,
    pub tokens: Arc<FakeTokens>,
    pub tls: Arc<RecordingTls>,
    pub servers: Arc<FakeServers>,
    pub ac: AutoConfig,
}

impl Harness {
    /// Mint a CA, a ten-minute leaf, an extra trust anchor, and the
    /// server response delivering them with `primary_datacenter = primary`
    /// and hostname verification on.
    pub(crate) fn material(&self) -> Material {
        let mut ca = test_ca("Cluster CA");
        let cert = issued_cert(&mut ca, "autoconf", ::time::Duration::minutes(10), 2);
        let roots = CaRoots {
            active_root_id: "root-1".to_string(),
            trust_domain: "11111111-2222-3333-4444-555555555555.cluster".to_string(),
            roots: vec![root_entry("root-1", &ca, true)],
            index: 1,
        };
        let extra = test_ca("Extra CA");

        let response = AutoConfigResponse {
            config: Some(AgentConfig {
                primary_datacenter: Some("primary".to_string()),
                tls: Some(TlsSettings {
                    verify_server_hostname: Some(true),
                }),
                ..AgentConfig::default()
            }),
            ca_roots: Some(roots.clone()),
            certificate: Some(cert),
            extra_ca_certificates: vec![extra.ca_cert_pem().to_string()],
        };

        Material { ca, roots, response }
    }
}

/// A user configuration layer in the shape most scenarios need.
pub(crate) fn base_user_config(enabled: bool, server_addresses: &[&str]) -> PartialConfig {
    PartialConfig {
        datacenter: Some("dc1".to_string()),
        node_name: Some("autoconf".to_string()),
        bind_addr: Some("127.0.0.1".to_string()),
        verify_outgoing: Some(true),
        auto_config: Some(PartialAutoConfig {
            enabled: Some(enabled),
            intro_token: Some("blarg".to_string()),
            server_addresses: Some(server_addresses.iter().map(|s| s.to_string()).collect()),
        }),
        ..PartialConfig::default()
    }
}

/// Build a core wired entirely to fakes, with a fast waiter and a fresh
/// data directory injected into the user layer.
pub(crate) fn harness(mut user: PartialConfig) -> Harness {
    init_logging();

    let dir = tempfile::tempdir().expect("temp dir creation should succeed");
    if user.data_dir.is_none() {
        user.data_dir = Some(dir.path().to_path_buf());
    }

    let rpc = Arc::new(FakeRpc::default());
    let cache = Arc::new(FakeCache::default());
    let tokens = Arc::new(FakeTokens::new("a5deaa25-11ca-48bf-a979-4c3a7aa4b9a9"));
    let tls = Arc::new(RecordingTls::default());
    let servers = Arc::new(FakeServers::default());

    let ac = AutoConfig::new(Config {
        loader: Some(Arc::new(LayeredLoader::new(user))),
        direct_rpc: Some(rpc.clone()),
        cache: Some(cache.clone()),
        tokens: Some(tokens.clone()),
        tls: Some(tls.clone()),
        server_provider: Some(servers.clone()),
        waiter: Some(RetryWaiter::new(
            Duration::from_millis(1),
            Duration::from_millis(10),
        )),
        ..Config::default()
    })
    .expect("harness construction should succeed");

    Harness {
        dir,
        rpc,
        cache,
        tokens,
        tls,
        servers,
        ac,
    }
}

/// Write a response the way an external tool would: JSON with the private
/// key inline, which this core's own writes never produce.
pub(crate) fn write_persisted_with_key(dir: &Path, response: &AutoConfigResponse) {
    let mut value = serde_json::to_value(response).expect("serialization should succeed");
    if let Some(cert) = response.certificate.as_ref() {
        value["certificate"]["private_key_pem"] =
            serde_json::Value::String(cert.private_key_pem.clone());
    }
    std::fs::write(
        persist::file_path(dir),
        serde_json::to_vec_pretty(&value).expect("serialization should succeed"),
    )
    .expect("file write should succeed");
}

/// Read the persisted file synchronously, `None` if absent or unparseable.
pub(crate) fn read_persisted_sync(dir: &Path) -> Option<AutoConfigResponse> {
    let data = std::fs::read(persist::file_path(dir)).ok()?;
    serde_json::from_slice(&data).ok()
}
