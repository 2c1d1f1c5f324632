//! Container daemon client abstraction.
//!
//! ```text
//! EngineController ──► Arc<dyn EngineApi>
//!                          ├── HttpDaemon   (hyper, TCP or unix socket)
//!                          └── MockDaemon   (in-memory, tests)
//! ```
//!
//! The controller never talks HTTP itself; everything it needs from a
//! daemon is expressed through [`EngineApi`].

use std::net::Ipv4Addr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use packgrid_core::{ConnectionProtocol, ContainerSpec, EngineInfo, GridConfig, PortMap};

use crate::constants::{DEFAULT_HTTP_PORT, LOCAL_SOCKET};
use crate::error::{DaemonResult, EngineError, EngineResult};

pub mod http;
pub mod mock;
pub mod stream;

pub use http::{Endpoint, HttpDaemon};
pub use mock::MockDaemon;

// ── Daemon-side views ──────────────────────────────────────────────

/// One entry of the daemon's container listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSummary {
    pub id: String,
    pub names: Vec<String>,
    pub image: String,
    pub state: String,
    pub status: String,
}

impl ContainerSummary {
    /// Primary name without the leading slash.
    pub fn name(&self) -> &str {
        self.names
            .first()
            .map(|n| n.trim_start_matches('/'))
            .unwrap_or("")
    }

    pub fn has_name(&self, name: &str) -> bool {
        self.names.iter().any(|n| n.trim_start_matches('/') == name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountPoint {
    pub kind: String,
    pub source: String,
    pub destination: String,
    pub rw: bool,
    pub propagation: String,
}

impl MountPoint {
    /// `source:destination[:ro][,propagation]` bind string for a bind mount.
    pub fn as_bind(&self) -> Option<String> {
        if self.kind != "bind" {
            return None;
        }
        let mut bind = format!("{}:{}", self.source, self.destination);
        let mut opts = Vec::new();
        if !self.rw {
            opts.push("ro");
        }
        if !self.propagation.is_empty() {
            opts.push(self.propagation.as_str());
        }
        if !opts.is_empty() {
            bind.push(':');
            bind.push_str(&opts.join(","));
        }
        Some(bind)
    }
}

/// The parts of a container inspection the controller uses.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerDetails {
    pub id: String,
    pub name: String,
    pub running: bool,
    pub restarting: bool,
    pub cmd: Option<Vec<String>>,
    pub entrypoint: Option<Vec<String>>,
    pub env: Vec<String>,
    pub exposed_ports: Vec<String>,
    pub cap_add: Vec<String>,
    pub binds: Vec<String>,
    pub port_bindings: PortMap,
    pub mounts: Vec<MountPoint>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSummary {
    pub name: String,
    pub driver: String,
    pub subnets: Vec<String>,
    pub gateways: Vec<Ipv4Addr>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkSpec {
    pub name: String,
    pub driver: String,
    pub subnet: String,
    pub gateway: Ipv4Addr,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogsOptions {
    pub tail: Option<u32>,
    /// Epoch seconds.
    pub since: Option<u64>,
    pub timestamps: bool,
}

/// A throwaway container: create, run to completion, collect output, remove.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OneShot {
    pub image: String,
    pub cmd: Vec<String>,
    pub binds: Vec<String>,
    pub privileged: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OneShotOutput {
    pub exit_code: i64,
    pub output: String,
}

/// State changes an operator can request for one container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "action")]
pub enum ContainerAction {
    Start,
    Stop { timeout_secs: u64 },
    Restart { timeout_secs: u64 },
    Pause,
    Unpause,
    Kill { signal: String },
}

// ── Trait ──────────────────────────────────────────────────────────

/// Everything the controller asks of a container daemon.
///
/// Stop and start are idempotent: acting on a container that is already
/// in the target state succeeds.
#[async_trait]
pub trait EngineApi: Send + Sync {
    async fn ping(&self) -> DaemonResult<()>;

    /// All containers, running or not.
    async fn list_containers(&self) -> DaemonResult<Vec<ContainerSummary>>;

    /// Returns the daemon-assigned id.
    async fn create_container(&self, name: &str, spec: &ContainerSpec) -> DaemonResult<String>;
    async fn start_container(&self, id: &str) -> DaemonResult<()>;
    async fn stop_container(&self, id: &str, timeout_secs: u64) -> DaemonResult<()>;
    async fn restart_container(&self, id: &str, timeout_secs: u64) -> DaemonResult<()>;
    async fn pause_container(&self, id: &str) -> DaemonResult<()>;
    async fn unpause_container(&self, id: &str) -> DaemonResult<()>;
    async fn kill_container(&self, id: &str, signal: &str) -> DaemonResult<()>;
    /// Force-removes the container and its anonymous volumes.
    async fn remove_container(&self, id: &str) -> DaemonResult<()>;
    async fn inspect_container(&self, id: &str) -> DaemonResult<ContainerDetails>;

    /// Run a command inside a container and return stdout and stderr.
    async fn exec(&self, id: &str, cmd: &[String], working_dir: &str) -> DaemonResult<String>;
    async fn logs(&self, id: &str, opts: &LogsOptions) -> DaemonResult<String>;

    /// Completes only when the pull has fully finished.
    async fn pull_image(&self, image: &str) -> DaemonResult<()>;
    async fn tag_image(&self, image: &str, repo: &str, tag: &str) -> DaemonResult<()>;
    async fn push_image(&self, repo: &str, tag: &str) -> DaemonResult<()>;
    /// Remove dangling images older than `until` (e.g. `72h`).
    async fn prune_images(&self, until: &str) -> DaemonResult<()>;
    async fn prune_volumes(&self) -> DaemonResult<()>;

    async fn list_networks(&self) -> DaemonResult<Vec<NetworkSummary>>;
    async fn create_network(&self, spec: &NetworkSpec) -> DaemonResult<()>;

    async fn run_oneshot(&self, job: &OneShot) -> DaemonResult<OneShotOutput>;
}

// ── Connectors ─────────────────────────────────────────────────────

/// Builds a daemon client for an engine.
///
/// `tunnel_port` is the local end of the SSH forward for SSH engines.
pub trait DaemonConnector: Send + Sync {
    fn connect(
        &self,
        engine: &EngineInfo,
        tunnel_port: Option<u16>,
    ) -> EngineResult<Arc<dyn EngineApi>>;
}

/// Connects over HTTP to the endpoint the engine's connection describes.
#[derive(Debug, Clone, Default)]
pub struct HttpConnector;

impl DaemonConnector for HttpConnector {
    fn connect(
        &self,
        engine: &EngineInfo,
        tunnel_port: Option<u16>,
    ) -> EngineResult<Arc<dyn EngineApi>> {
        let endpoint = endpoint_for(engine, tunnel_port)?;
        Ok(Arc::new(HttpDaemon::new(endpoint)))
    }
}

/// Hands out one shared daemon regardless of the engine.
#[derive(Clone)]
pub struct StaticConnector(pub Arc<dyn EngineApi>);

impl DaemonConnector for StaticConnector {
    fn connect(&self, _: &EngineInfo, _: Option<u16>) -> EngineResult<Arc<dyn EngineApi>> {
        Ok(self.0.clone())
    }
}

pub fn endpoint_for(engine: &EngineInfo, tunnel_port: Option<u16>) -> EngineResult<Endpoint> {
    let conn = &engine.connection;
    match conn.protocol {
        ConnectionProtocol::Local => Ok(Endpoint::Unix(LOCAL_SOCKET.into())),
        ConnectionProtocol::Unix => {
            if conn.host.is_empty() {
                return Err(EngineError::Rejected(format!(
                    "engine {}: unix connection without a socket path",
                    engine.id
                )));
            }
            Ok(Endpoint::Unix(conn.host.clone().into()))
        }
        ConnectionProtocol::Http => Ok(Endpoint::Tcp(format!(
            "{}:{}",
            conn.host,
            conn.port.unwrap_or(DEFAULT_HTTP_PORT)
        ))),
        ConnectionProtocol::Ssh => match tunnel_port {
            Some(port) => Ok(Endpoint::Tcp(format!("127.0.0.1:{port}"))),
            None => Err(EngineError::Tunnel(format!(
                "engine {}: no local tunnel port",
                engine.id
            ))),
        },
    }
}

/// Path of the SSH key for an engine, if it names one.
pub fn ssh_key_path(config: &GridConfig, engine: &EngineInfo) -> Option<std::path::PathBuf> {
    engine
        .connection
        .ssh_key
        .as_ref()
        .map(|key| config.ssh_keys_dir().join(key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use packgrid_core::ConnectionInfo;

    fn engine(protocol: ConnectionProtocol, host: &str, port: Option<u16>) -> EngineInfo {
        EngineInfo {
            id: "e1".into(),
            connection: ConnectionInfo {
                protocol,
                host: host.into(),
                port,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn endpoints_follow_protocol() {
        assert_eq!(
            endpoint_for(&engine(ConnectionProtocol::Local, "", None), None).unwrap(),
            Endpoint::Unix(LOCAL_SOCKET.into())
        );
        assert_eq!(
            endpoint_for(&engine(ConnectionProtocol::Http, "10.1.1.1", None), None).unwrap(),
            Endpoint::Tcp("10.1.1.1:2375".into())
        );
        assert_eq!(
            endpoint_for(&engine(ConnectionProtocol::Ssh, "h", None), Some(2223)).unwrap(),
            Endpoint::Tcp("127.0.0.1:2223".into())
        );
        assert!(endpoint_for(&engine(ConnectionProtocol::Ssh, "h", None), None).is_err());
        assert!(endpoint_for(&engine(ConnectionProtocol::Unix, "", None), None).is_err());
    }

    #[test]
    fn bind_mounts_render_options() {
        let mount = MountPoint {
            kind: "bind".into(),
            source: "/data".into(),
            destination: "/var/data".into(),
            rw: false,
            propagation: "rprivate".into(),
        };
        assert_eq!(mount.as_bind().unwrap(), "/data:/var/data:ro,rprivate");

        let volume = MountPoint {
            kind: "volume".into(),
            ..mount
        };
        assert_eq!(volume.as_bind(), None);
    }
}
