//! SSH local-forward supervision for remote engines.
//!
//! ```text
//! 127.0.0.1:<port> ──ssh -L──► <host>:<remote daemon socket>
//! ```
//!
//! The supervisor keeps one `ssh` child alive: when it exits it is
//! respawned after a backoff that grows with consecutive failures and is
//! reset once a connectivity check through the tunnel succeeds.

use std::collections::BTreeSet;
use std::net::TcpListener;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use packgrid_core::config::EngineSettings;

use crate::error::{EngineError, EngineResult};

/// How many ports above the base are probed before giving up.
const PORT_SEARCH_SPAN: u16 = 1000;

// ── Local ports ────────────────────────────────────────────────────

/// Hands out local ports for tunnels, shared by every controller in the
/// process so two engines never race for the same port.
#[derive(Clone, Default)]
pub struct PortAllocator {
    taken: Arc<Mutex<BTreeSet<u16>>>,
}

impl PortAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// First port at or above `base` that is neither handed out nor bound.
    pub fn reserve(&self, base: u16) -> EngineResult<u16> {
        let mut taken = self.taken.lock();
        let end = base.saturating_add(PORT_SEARCH_SPAN);
        for port in base..end {
            if taken.contains(&port) {
                continue;
            }
            if TcpListener::bind(("127.0.0.1", port)).is_ok() {
                taken.insert(port);
                return Ok(port);
            }
        }
        Err(EngineError::Tunnel(format!(
            "no free local port in {base}..{end}"
        )))
    }

    pub fn release(&self, port: u16) {
        self.taken.lock().remove(&port);
    }
}

// ── Tunnel ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelConfig {
    pub host: String,
    pub ssh_port: Option<u16>,
    pub username: Option<String>,
    pub key_path: Option<PathBuf>,
    pub local_port: u16,
    pub remote_socket: String,
}

impl TunnelConfig {
    /// Arguments passed to `ssh`.
    pub fn args(&self) -> Vec<String> {
        let mut args = vec![
            "-nNT".to_string(),
            "-L".to_string(),
            format!("127.0.0.1:{}:{}", self.local_port, self.remote_socket),
        ];
        if let Some(port) = self.ssh_port {
            args.push("-p".into());
            args.push(port.to_string());
        }
        if let Some(key) = &self.key_path {
            args.push("-i".into());
            args.push(key.display().to_string());
        }
        for opt in [
            "StrictHostKeyChecking=no",
            "ExitOnForwardFailure=yes",
            "ServerAliveInterval=15",
        ] {
            args.push("-o".into());
            args.push(opt.into());
        }
        args.push(match &self.username {
            Some(user) => format!("{user}@{}", self.host),
            None => self.host.clone(),
        });
        args
    }
}

/// A running tunnel supervisor. Dropping it without `shutdown` aborts the
/// supervisor and kills the child.
pub struct SshTunnel {
    config: TunnelConfig,
    failures: Arc<AtomicU32>,
    shutdown: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

impl SshTunnel {
    pub fn spawn(config: TunnelConfig, settings: EngineSettings) -> Self {
        let failures = Arc::new(AtomicU32::new(0));
        let (shutdown, rx) = watch::channel(false);
        let handle = tokio::spawn(supervise(config.clone(), settings, failures.clone(), rx));
        Self {
            config,
            failures,
            shutdown,
            handle: Some(handle),
        }
    }

    pub fn local_port(&self) -> u16 {
        self.config.local_port
    }

    /// Reset the respawn backoff after a successful check.
    pub fn mark_healthy(&self) {
        self.failures.store(0, Ordering::Relaxed);
    }

    pub fn failures(&self) -> u32 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Stop the supervisor and wait up to `wait` for the child to exit.
    ///
    /// A tunnel that does not close in time is aborted and reported.
    pub async fn shutdown(mut self, wait: Duration) -> EngineResult<()> {
        let _ = self.shutdown.send(true);
        let Some(mut handle) = self.handle.take() else {
            return Ok(());
        };
        match tokio::time::timeout(wait, &mut handle).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(EngineError::Tunnel(format!(
                "{} supervisor failed: {e}",
                self.config.host
            ))),
            Err(_) => {
                warn!(host = %self.config.host, "tunnel did not close in time, aborting");
                handle.abort();
                Err(EngineError::Tunnel(format!(
                    "{} did not close within {}s",
                    self.config.host,
                    wait.as_secs()
                )))
            }
        }
    }
}

impl Drop for SshTunnel {
    fn drop(&mut self) {
        if let Some(handle) = &self.handle {
            handle.abort();
        }
    }
}

async fn supervise(
    config: TunnelConfig,
    settings: EngineSettings,
    failures: Arc<AtomicU32>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            return;
        }

        let mut cmd = Command::new("ssh");
        cmd.args(config.args())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        match cmd.spawn() {
            Ok(mut child) => {
                info!(host = %config.host, local_port = config.local_port, "ssh tunnel started");
                if let Some(stderr) = child.stderr.take() {
                    let host = config.host.clone();
                    tokio::spawn(async move {
                        let mut lines = BufReader::new(stderr).lines();
                        while let Ok(Some(line)) = lines.next_line().await {
                            warn!(%host, "ssh: {line}");
                        }
                    });
                }

                tokio::select! {
                    status = child.wait() => {
                        warn!(host = %config.host, ?status, "ssh tunnel exited");
                    }
                    _ = shutdown.changed() => {
                        let _ = child.kill().await;
                        info!(host = %config.host, "ssh tunnel closed");
                        return;
                    }
                }
            }
            Err(e) => {
                warn!(host = %config.host, error = %e, "failed to spawn ssh");
            }
        }

        let delay = settings.retry_delay(failures.fetch_add(1, Ordering::Relaxed));
        debug!(host = %config.host, delay_secs = delay.as_secs(), "respawning ssh tunnel");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ssh_arguments() {
        let config = TunnelConfig {
            host: "10.1.1.1".into(),
            ssh_port: Some(2200),
            username: Some("ops".into()),
            key_path: Some(PathBuf::from("/keys/e1")),
            local_port: 2223,
            remote_socket: "/var/run/docker.sock".into(),
        };
        let args = config.args();
        assert_eq!(args[0], "-nNT");
        assert_eq!(args[2], "127.0.0.1:2223:/var/run/docker.sock");
        assert!(args.windows(2).any(|w| w == ["-i", "/keys/e1"]));
        assert!(args.windows(2).any(|w| w == ["-p", "2200"]));
        assert!(args.contains(&"ExitOnForwardFailure=yes".to_string()));
        assert_eq!(args.last().unwrap(), "ops@10.1.1.1");
    }

    fn tunnel_with(handle: JoinHandle<()>, shutdown: watch::Sender<bool>) -> SshTunnel {
        SshTunnel {
            config: TunnelConfig {
                host: "10.1.1.1".into(),
                ssh_port: None,
                username: None,
                key_path: None,
                local_port: 2223,
                remote_socket: "/var/run/docker.sock".into(),
            },
            failures: Arc::new(AtomicU32::new(0)),
            shutdown,
            handle: Some(handle),
        }
    }

    #[tokio::test]
    async fn shutdown_waits_for_the_supervisor() {
        let (tx, mut rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let _ = rx.changed().await;
        });
        let tunnel = tunnel_with(handle, tx);
        tunnel.shutdown(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn tunnel_that_does_not_close_is_an_error() {
        let (tx, _rx) = watch::channel(false);
        let handle = tokio::spawn(std::future::pending::<()>());
        let tunnel = tunnel_with(handle, tx);
        let err = tunnel.shutdown(Duration::from_millis(20)).await.unwrap_err();
        assert!(
            matches!(&err, EngineError::Tunnel(msg) if msg.contains("did not close")),
            "{err:?}"
        );
    }

    #[test]
    fn allocator_skips_handed_out_and_bound_ports() {
        let ports = PortAllocator::new();
        let busy = TcpListener::bind("127.0.0.1:0").unwrap();
        let busy_port = busy.local_addr().unwrap().port();

        let first = ports.reserve(busy_port).unwrap();
        assert_ne!(first, busy_port);
        let second = ports.reserve(busy_port).unwrap();
        assert_ne!(second, first);

        ports.release(first);
        assert_eq!(ports.reserve(busy_port).unwrap(), first);
    }
}
