//! Re-init, stop, destroy and the connection bootstrap.

use std::net::Ipv4Addr;
use std::time::Duration;

use serde_json::json;
use tracing::{debug, info, warn};

use packgrid_core::{ConnectionProtocol, EngineInfo, Severity};

use crate::constants::{CORE_PATTERN, NETWORK_NAME};
use crate::controller::{EngineController, EngineStatus};
use crate::daemon::{ContainerSummary, EngineApi, NetworkSpec, ssh_key_path};
use crate::error::{EngineError, EngineResult};
use crate::ip_pool::IpPool;
use crate::container_spec::{container_index, is_managed_name, pack_index};
use crate::tunnel::{SshTunnel, TunnelConfig};

impl EngineController {
    /// Apply a new engine item: tear down, rebuild and reconnect.
    ///
    /// A re-init requested while another one is pending supersedes it. On
    /// failure a retry is scheduled with a growing backoff.
    pub async fn reinit(&self, info: EngineInfo) {
        let generation = {
            let mut rt = self.inner.rt.lock();
            if rt.removed {
                return;
            }
            rt.reinit_generation += 1;
            rt.reinit_generation
        };
        *self.inner.info.write() = info;
        self.cancel_retry();

        let queue = &self.inner.reinit_queue;
        queue.stop().await;
        // A newer request arrived while the running one drained; it posts.
        let superseded = {
            let rt = self.inner.rt.lock();
            rt.removed || rt.reinit_generation != generation
        };
        if superseded {
            debug!(engine = %self.inner.id, "re-init superseded before posting");
            return;
        }
        queue.start();

        let this = self.clone();
        let handle = queue.post(
            "re_init",
            json!({ "engine": self.inner.id }),
            move || async move { this.run_reinit().await },
        );

        let this = self.clone();
        tokio::spawn(async move {
            match handle.wait().await {
                Ok(()) => {}
                Err(e) if e.is_cancelled() => {
                    debug!(engine = %this.inner.id, "re-init superseded");
                }
                Err(e) => {
                    this.report(Severity::Error, "engine init failed", &e);
                    this.schedule_retry();
                }
            }
        });
    }

    /// Wait until the controller settles in a state that needs no further
    /// connection work.
    pub async fn wait_reinit(&self) {
        let mut rx = self.subscribe_status();
        let _ = rx
            .wait_for(|s| {
                matches!(
                    s,
                    EngineStatus::Ready
                        | EngineStatus::Disabled
                        | EngineStatus::Stopped
                        | EngineStatus::Removed
                )
            })
            .await;
    }

    /// Permanently stop the controller. Nothing restarts it afterwards.
    ///
    /// Fails when the tunnel cannot be closed; the controller is marked
    /// removed either way.
    pub async fn destroy(&self) -> EngineResult<()> {
        info!(engine = %self.inner.id, "destroying engine controller");
        self.inner.rt.lock().removed = true;
        self.cancel_retry();
        self.inner.reinit_queue.stop().await;
        let stopped = self.stop_runtime().await;
        self.set_status(EngineStatus::Removed);
        stopped
    }

    fn cancel_retry(&self) {
        if let Some(handle) = self.inner.rt.lock().retry.take() {
            handle.abort();
        }
    }

    fn schedule_retry(&self) {
        let delay = {
            let mut rt = self.inner.rt.lock();
            if rt.removed {
                return;
            }
            let delay = self.settings().retry_delay(rt.init_failures);
            rt.init_failures += 1;
            delay
        };
        warn!(engine = %self.inner.id, delay_secs = delay.as_secs(), "engine init retry scheduled");

        let this = self.clone();
        let mut rt = self.inner.rt.lock();
        rt.retry = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // Detach first so reinit's cancel_retry does not abort this task.
            drop(this.inner.rt.lock().retry.take());
            let info = this.info();
            this.reinit(info).await;
        }));
    }

    async fn run_reinit(&self) -> EngineResult<()> {
        self.stop_runtime().await?;
        let info = self.info();
        self.init_data(&info);

        if info.disabled {
            info!(engine = %self.inner.id, "engine disabled");
            self.set_status(EngineStatus::Disabled);
            return Ok(());
        }

        self.set_status(EngineStatus::Connecting);
        if let Err(e) = self.connect(&info).await {
            if let Err(se) = self.stop_runtime().await {
                warn!(engine = %self.inner.id, error = %se, "cleanup after failed connect");
            }
            return Err(e);
        }

        for q in self.queues().all() {
            q.start();
        }
        self.resume_interrupted();
        self.start_timers();

        if info.auto_core_pattern {
            let cmd = format!("echo '{CORE_PATTERN}' > /proc/sys/kernel/core_pattern");
            if let Err(e) = self
                .exec_engine_host(vec!["sh".into(), "-c".into(), cmd], Vec::new(), true)
                .await
            {
                self.report(Severity::Warning, "setting core pattern failed", &e);
            }
        }

        self.inner.rt.lock().init_failures = 0;
        self.set_status(EngineStatus::Ready);
        info!(engine = %self.inner.id, free_ips = self.free_ip_count(), "engine ready");
        Ok(())
    }

    /// Stop timers and queues, close the tunnel and drop the client.
    ///
    /// Every step runs; a tunnel that fails to close is reported at the end.
    pub(crate) async fn stop_runtime(&self) -> EngineResult<()> {
        let was = self.status();
        if matches!(was, EngineStatus::Ready | EngineStatus::Connecting) {
            self.set_status(EngineStatus::Draining);
        }

        let timers = self.inner.rt.lock().timers.take();
        if let Some(timers) = timers {
            timers.stop();
        }
        for q in self.queues().all() {
            q.stop().await;
        }

        let (tunnel, port) = {
            let mut rt = self.inner.rt.lock();
            rt.api = None;
            (rt.tunnel.take(), rt.tunnel_port.take())
        };
        let closed = match tunnel {
            Some(tunnel) => {
                tunnel
                    .shutdown(Duration::from_secs(self.settings().tunnel_close_wait_secs))
                    .await
            }
            None => Ok(()),
        };
        if let Some(port) = port {
            self.inner.ctx.ports.release(port);
        }
        self.inner.shared_checked.lock().clear();

        if was != EngineStatus::Uninitialized && was != EngineStatus::Removed {
            self.set_status(EngineStatus::Stopped);
        }
        closed
    }

    /// Rebuild the IP pool and counters from the packs this engine owns.
    fn init_data(&self, info: &EngineInfo) {
        let packs = self.registry().engine_packs(&self.inner.id);
        let held = packs.iter().flat_map(|p| p.ip_list.iter().copied());
        let pool = IpPool::new(info.network.full_pool(), held);
        let capacity_used = packs.iter().map(|p| p.load).sum();
        let last_pack_idx = packs
            .iter()
            .filter_map(|p| pack_index(&p.id))
            .max()
            .unwrap_or(0);
        let last_container_idx = packs
            .iter()
            .flat_map(|p| p.containers.iter())
            .filter_map(|c| container_index(&c.name))
            .max()
            .unwrap_or(0);

        let mut rt = self.inner.rt.lock();
        rt.pool = pool;
        rt.capacity_used = capacity_used;
        rt.last_pack_idx = rt.last_pack_idx.max(last_pack_idx);
        rt.last_container_idx = rt.last_container_idx.max(last_container_idx);
        rt.gateway = info.network.gateway;
        debug!(
            engine = %self.inner.id,
            packs = packs.len(),
            free_ips = rt.pool.free_count(),
            capacity_used,
            "engine data rebuilt"
        );
    }

    async fn connect(&self, info: &EngineInfo) -> EngineResult<()> {
        let tunnel_port = if info.connection.protocol == ConnectionProtocol::Ssh {
            let port = self
                .inner
                .ctx
                .ports
                .reserve(self.settings().tunnel_port_base)?;
            let tunnel = SshTunnel::spawn(
                TunnelConfig {
                    host: info.connection.host.clone(),
                    ssh_port: info.connection.port,
                    username: info.connection.username.clone(),
                    key_path: ssh_key_path(self.config(), info),
                    local_port: port,
                    remote_socket: self.settings().remote_socket.clone(),
                },
                self.settings().clone(),
            );
            let mut rt = self.inner.rt.lock();
            rt.tunnel = Some(tunnel);
            rt.tunnel_port = Some(port);
            Some(port)
        } else {
            None
        };

        let api = self.inner.ctx.connector.connect(info, tunnel_port)?;
        self.inner.rt.lock().api = Some(api.clone());

        self.ping_with_retry(api.as_ref()).await?;
        self.ensure_network(api.as_ref(), info).await?;

        match api.list_containers().await {
            Ok(listed) => self.report_drift(&listed),
            Err(e) => self.report(Severity::Warning, "drift check failed", &e),
        }
        Ok(())
    }

    async fn ping_with_retry(&self, api: &dyn EngineApi) -> EngineResult<()> {
        let attempts = self.settings().ping_attempts.max(1);
        let delay = Duration::from_millis(self.settings().ping_retry_delay_ms);
        let mut last = None;
        for attempt in 1..=attempts {
            match api.ping().await {
                Ok(()) => {
                    let mut rt = self.inner.rt.lock();
                    rt.last_pong = Some(packgrid_core::epoch_millis());
                    if let Some(tunnel) = &rt.tunnel {
                        tunnel.mark_healthy();
                    }
                    return Ok(());
                }
                Err(e) => {
                    debug!(engine = %self.inner.id, attempt, error = %e, "ping failed");
                    last = Some(e);
                    if attempt < attempts {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
        Err(last
            .map(EngineError::from)
            .unwrap_or_else(|| EngineError::NotReady(self.inner.id.clone())))
    }

    /// Find or create the private bridge network and record its gateway.
    async fn ensure_network(&self, api: &dyn EngineApi, info: &EngineInfo) -> EngineResult<()> {
        let networks = api.list_networks().await?;
        if let Some(existing) = networks.iter().find(|n| n.name == NETWORK_NAME) {
            let gateway = existing.gateways.first().copied().or(info.network.gateway);
            self.inner.rt.lock().gateway = gateway;
            debug!(engine = %self.inner.id, ?gateway, "network present");
            return gateway
                .map(|_| ())
                .ok_or_else(|| EngineError::Rejected(format!("{NETWORK_NAME} has no gateway")));
        }

        let gateway = match info.network.gateway {
            Some(gw) => gw,
            None => {
                let used: Vec<Ipv4Addr> =
                    networks.iter().flat_map(|n| n.gateways.iter().copied()).collect();
                (1..=254u8)
                    .rev()
                    .map(|b| Ipv4Addr::new(172, b, 0, 1))
                    .find(|gw| !used.iter().any(|u| u.octets()[..2] == gw.octets()[..2]))
                    .ok_or_else(|| EngineError::Rejected("no free private subnet".into()))?
            }
        };
        let [a, b, _, _] = gateway.octets();
        api.create_network(&NetworkSpec {
            name: NETWORK_NAME.to_string(),
            driver: "bridge".into(),
            subnet: format!("{a}.{b}.0.0/16"),
            gateway,
        })
        .await?;
        self.inner.rt.lock().gateway = Some(gateway);
        info!(engine = %self.inner.id, %gateway, "network created");
        Ok(())
    }

    /// Managed-looking containers that no pack knows about.
    pub(crate) fn drifted(&self, listed: &[ContainerSummary]) -> Vec<ContainerSummary> {
        let known: std::collections::BTreeSet<String> = self
            .registry()
            .engine_packs(&self.inner.id)
            .into_iter()
            .flat_map(|p| p.containers.into_iter().map(|c| c.name))
            .collect();
        listed
            .iter()
            .filter(|c| is_managed_name(c.name()) && !known.contains(c.name()))
            .cloned()
            .collect()
    }

    fn report_drift(&self, listed: &[ContainerSummary]) {
        for c in self.drifted(listed) {
            self.inner.ctx.notifier().post(
                packgrid_core::Component::Engine,
                Severity::Warning,
                format!("{}: unregistered managed container {}", self.inner.id, c.name()),
                Some(json!({ "engine": self.inner.id, "id": c.id, "name": c.name() })),
            );
        }
    }

    /// Report managed containers no pack accounts for. Nothing is removed.
    pub async fn drift_report(&self) -> EngineResult<Vec<ContainerSummary>> {
        let listed = self.list_containers().await?;
        let drifted = self.drifted(&listed);
        self.report_drift(&listed);
        Ok(drifted)
    }

    /// Finish the removal of packs a previous run left half-deployed or
    /// half-deleted.
    fn resume_interrupted(&self) {
        let stale = self
            .registry()
            .packs
            .filter(|p| p.engine_id == self.inner.id && (p.deploy_in_progress || p.marked_for_delete));
        for pack in stale {
            info!(engine = %self.inner.id, pack = %pack.id, "removing interrupted pack");
            let this = self.clone();
            tokio::spawn(async move {
                if let Err(e) = this.remove_pack(&pack.id).await {
                    warn!(engine = %this.inner.id, pack = %pack.id, error = %e, "resume removal failed");
                }
            });
        }
    }
}
