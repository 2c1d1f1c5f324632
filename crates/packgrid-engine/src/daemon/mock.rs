//! In-memory daemon used by tests across the workspace.
//!
//! Behaves like a small, obedient daemon: containers are created from
//! their spec, images must be pulled before use when marked missing, and
//! every call is recorded for assertions. Failure injection covers the
//! paths the controller has to survive: unreachable daemons, failing
//! creates and images that cannot be pulled.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use packgrid_core::ContainerSpec;

use crate::daemon::{
    ContainerDetails, ContainerSummary, EngineApi, LogsOptions, MountPoint, NetworkSpec,
    NetworkSummary, OneShot, OneShotOutput,
};
use crate::error::{DaemonError, DaemonResult};
use crate::container_spec::parse_bind_destination;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockContainer {
    pub id: String,
    pub name: String,
    pub spec: ContainerSpec,
    pub running: bool,
    pub paused: bool,
}

#[derive(Default)]
struct MockState {
    containers: Vec<MockContainer>,
    networks: Vec<NetworkSummary>,
    missing_images: BTreeSet<String>,
    unavailable_images: BTreeSet<String>,
    exec_outputs: Vec<(String, String)>,
    ping_failures: u32,
    ping_delay: Option<Duration>,
    create_failures: u32,
    remove_failures: u32,
    calls: Vec<String>,
    next_id: u64,
}

#[derive(Default)]
pub struct MockDaemon {
    state: Mutex<MockState>,
}

impl MockDaemon {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creation fails with "no such image" until the image is pulled.
    pub fn missing_image(&self, image: &str) {
        self.state.lock().missing_images.insert(image.to_string());
    }

    /// Neither creation nor pulling will ever succeed.
    pub fn unavailable_image(&self, image: &str) {
        self.state.lock().unavailable_images.insert(image.to_string());
    }

    pub fn fail_pings(&self, count: u32) {
        self.state.lock().ping_failures = count;
    }

    pub fn fail_removes(&self, count: u32) {
        self.state.lock().remove_failures = count;
    }

    /// Every ping answers only after `delay`.
    pub fn delay_pings(&self, delay: Duration) {
        self.state.lock().ping_delay = Some(delay);
    }

    pub fn fail_creates(&self, count: u32) {
        self.state.lock().create_failures = count;
    }

    /// Output returned by exec or one-shot runs whose command line starts
    /// with `prefix`.
    pub fn set_exec_output(&self, prefix: &str, output: &str) {
        let mut state = self.state.lock();
        state.exec_outputs.retain(|(p, _)| p != prefix);
        state
            .exec_outputs
            .push((prefix.to_string(), output.to_string()));
    }

    /// A running container the controller did not create.
    pub fn add_external_container(&self, name: &str) -> String {
        let mut state = self.state.lock();
        let id = next_id(&mut state);
        state.containers.push(MockContainer {
            id: id.clone(),
            name: name.to_string(),
            spec: ContainerSpec::default(),
            running: true,
            paused: false,
        });
        id
    }

    /// Remove a container behind the controller's back.
    pub fn drop_container(&self, id: &str) {
        self.state.lock().containers.retain(|c| c.id != id);
    }

    pub fn add_network(&self, network: NetworkSummary) {
        self.state.lock().networks.push(network);
    }

    pub fn containers(&self) -> Vec<MockContainer> {
        self.state.lock().containers.clone()
    }

    pub fn container_by_name(&self, name: &str) -> Option<MockContainer> {
        self.state
            .lock()
            .containers
            .iter()
            .find(|c| c.name == name)
            .cloned()
    }

    pub fn networks(&self) -> Vec<NetworkSummary> {
        self.state.lock().networks.clone()
    }

    /// Every call so far, e.g. `"pull alpine"` or `"create PG_1_web_0_1_e1_5"`.
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    pub fn count_calls(&self, prefix: &str) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    fn record(&self, call: String) {
        self.state.lock().calls.push(call);
    }

    fn with_container<R>(
        &self,
        id: &str,
        f: impl FnOnce(&mut MockContainer) -> R,
    ) -> DaemonResult<R> {
        let mut state = self.state.lock();
        state
            .containers
            .iter_mut()
            .find(|c| c.id == id || c.name == id)
            .map(f)
            .ok_or_else(|| DaemonError::NotFound(format!("No such container: {id}")))
    }

    fn exec_output(&self, cmd: &[String]) -> String {
        let line = cmd.join(" ");
        self.state
            .lock()
            .exec_outputs
            .iter()
            .find(|(prefix, _)| line.starts_with(prefix.as_str()))
            .map(|(_, out)| out.clone())
            .unwrap_or_default()
    }
}

fn next_id(state: &mut MockState) -> String {
    state.next_id += 1;
    format!("{:012x}", 0xc0de_0000_0000u64 + state.next_id)
}

fn state_name(c: &MockContainer) -> &'static str {
    match (c.running, c.paused) {
        (true, true) => "paused",
        (true, false) => "running",
        _ => "exited",
    }
}

#[async_trait]
impl EngineApi for MockDaemon {
    async fn ping(&self) -> DaemonResult<()> {
        let delay = {
            let mut state = self.state.lock();
            state.calls.push("ping".into());
            if state.ping_failures > 0 {
                state.ping_failures -= 1;
                return Err(DaemonError::Transport("connection refused".into()));
            }
            state.ping_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    async fn list_containers(&self) -> DaemonResult<Vec<ContainerSummary>> {
        let state = self.state.lock();
        Ok(state
            .containers
            .iter()
            .map(|c| ContainerSummary {
                id: c.id.clone(),
                names: vec![format!("/{}", c.name)],
                image: c.spec.image.clone(),
                state: state_name(c).to_string(),
                status: if c.running { "Up" } else { "Exited (0)" }.to_string(),
            })
            .collect())
    }

    async fn create_container(&self, name: &str, spec: &ContainerSpec) -> DaemonResult<String> {
        let mut state = self.state.lock();
        state.calls.push(format!("create {name}"));
        if state.create_failures > 0 {
            state.create_failures -= 1;
            return Err(DaemonError::Status {
                status: 500,
                message: "injected create failure".into(),
            });
        }
        if state.unavailable_images.contains(&spec.image)
            || state.missing_images.contains(&spec.image)
        {
            return Err(DaemonError::NotFound(format!("No such image: {}", spec.image)));
        }
        if state.containers.iter().any(|c| c.name == name) {
            return Err(DaemonError::Conflict(format!("name {name} is already in use")));
        }
        let id = next_id(&mut state);
        state.containers.push(MockContainer {
            id: id.clone(),
            name: name.to_string(),
            spec: spec.clone(),
            running: false,
            paused: false,
        });
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> DaemonResult<()> {
        self.record(format!("start {id}"));
        self.with_container(id, |c| c.running = true)
    }

    async fn stop_container(&self, id: &str, _timeout_secs: u64) -> DaemonResult<()> {
        self.record(format!("stop {id}"));
        self.with_container(id, |c| {
            c.running = false;
            c.paused = false;
        })
    }

    async fn restart_container(&self, id: &str, _timeout_secs: u64) -> DaemonResult<()> {
        self.record(format!("restart {id}"));
        self.with_container(id, |c| {
            c.running = true;
            c.paused = false;
        })
    }

    async fn pause_container(&self, id: &str) -> DaemonResult<()> {
        self.record(format!("pause {id}"));
        self.with_container(id, |c| c.paused = true)
    }

    async fn unpause_container(&self, id: &str) -> DaemonResult<()> {
        self.record(format!("unpause {id}"));
        self.with_container(id, |c| c.paused = false)
    }

    async fn kill_container(&self, id: &str, signal: &str) -> DaemonResult<()> {
        self.record(format!("kill {id} {signal}"));
        self.with_container(id, |c| c.running = false)
    }

    async fn remove_container(&self, id: &str) -> DaemonResult<()> {
        let mut state = self.state.lock();
        state.calls.push(format!("remove {id}"));
        if state.remove_failures > 0 {
            state.remove_failures -= 1;
            return Err(DaemonError::Status {
                status: 500,
                message: "device or resource busy".into(),
            });
        }
        let before = state.containers.len();
        state.containers.retain(|c| c.id != id && c.name != id);
        if state.containers.len() == before {
            return Err(DaemonError::NotFound(format!("No such container: {id}")));
        }
        Ok(())
    }

    async fn inspect_container(&self, id: &str) -> DaemonResult<ContainerDetails> {
        self.with_container(id, |c| {
            let hc = &c.spec.host_config;
            let mounts = hc
                .binds
                .iter()
                .filter_map(|b| {
                    let dst = parse_bind_destination(b).ok()?;
                    let source = b.split(':').next().unwrap_or_default().to_string();
                    Some(MountPoint {
                        kind: "bind".into(),
                        source,
                        destination: dst.to_string(),
                        rw: !b.ends_with(":ro"),
                        propagation: String::new(),
                    })
                })
                .collect();
            ContainerDetails {
                id: c.id.clone(),
                name: c.name.clone(),
                running: c.running,
                restarting: false,
                cmd: c.spec.cmd.clone(),
                entrypoint: c.spec.entrypoint.clone(),
                env: c.spec.env.clone(),
                exposed_ports: c.spec.exposed_ports.clone(),
                cap_add: hc.cap_add.clone(),
                binds: hc.binds.clone(),
                port_bindings: hc.port_bindings.clone(),
                mounts,
            }
        })
    }

    async fn exec(&self, id: &str, cmd: &[String], _working_dir: &str) -> DaemonResult<String> {
        self.record(format!("exec {id} {}", cmd.join(" ")));
        let running = self.with_container(id, |c| c.running)?;
        if !running {
            return Err(DaemonError::Conflict(format!("container {id} is not running")));
        }
        Ok(self.exec_output(cmd))
    }

    async fn logs(&self, id: &str, opts: &LogsOptions) -> DaemonResult<String> {
        let name = self.with_container(id, |c| c.name.clone())?;
        Ok(format!("log line of {name} (tail {:?})\n", opts.tail))
    }

    async fn pull_image(&self, image: &str) -> DaemonResult<()> {
        let mut state = self.state.lock();
        state.calls.push(format!("pull {image}"));
        if state.unavailable_images.contains(image) {
            return Err(DaemonError::Status {
                status: 404,
                message: format!("pull {image}: manifest unknown"),
            });
        }
        state.missing_images.remove(image);
        Ok(())
    }

    async fn tag_image(&self, image: &str, repo: &str, tag: &str) -> DaemonResult<()> {
        self.record(format!("tag {image} {repo}:{tag}"));
        Ok(())
    }

    async fn push_image(&self, repo: &str, tag: &str) -> DaemonResult<()> {
        self.record(format!("push {repo}:{tag}"));
        Ok(())
    }

    async fn prune_images(&self, until: &str) -> DaemonResult<()> {
        self.record(format!("prune_images {until}"));
        Ok(())
    }

    async fn prune_volumes(&self) -> DaemonResult<()> {
        self.record("prune_volumes".into());
        Ok(())
    }

    async fn list_networks(&self) -> DaemonResult<Vec<NetworkSummary>> {
        Ok(self.state.lock().networks.clone())
    }

    async fn create_network(&self, spec: &NetworkSpec) -> DaemonResult<()> {
        let mut state = self.state.lock();
        state.calls.push(format!("create_network {}", spec.name));
        if state.networks.iter().any(|n| n.name == spec.name) {
            return Err(DaemonError::Conflict(format!("network {} exists", spec.name)));
        }
        state.networks.push(NetworkSummary {
            name: spec.name.clone(),
            driver: spec.driver.clone(),
            subnets: vec![spec.subnet.clone()],
            gateways: vec![spec.gateway],
        });
        Ok(())
    }

    async fn run_oneshot(&self, job: &OneShot) -> DaemonResult<OneShotOutput> {
        self.record(format!("oneshot {} {}", job.image, job.cmd.join(" ")));
        Ok(OneShotOutput {
            exit_code: 0,
            output: self.exec_output(&job.cmd),
        })
    }
}
