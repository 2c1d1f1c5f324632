//! HTTP daemon client over TCP or a unix socket.
//!
//! Every call opens a fresh HTTP/1.1 connection, the same way the health
//! prober does: connect, handshake, drive the connection in a background
//! task, send one request and collect the full body.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{Method, Request, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use packgrid_core::{ContainerSpec, PortBinding, PortMap};

use crate::daemon::stream::{demux, progress_error};
use crate::daemon::{
    ContainerDetails, ContainerSummary, EngineApi, LogsOptions, MountPoint, NetworkSpec,
    NetworkSummary, OneShot, OneShotOutput,
};
use crate::error::{DaemonError, DaemonResult};
use crate::container_spec::split_repo_tag;

const PING_TIMEOUT: Duration = Duration::from_secs(5);

/// Base64 of `{}`: anonymous registry credentials.
const ANONYMOUS_AUTH: &str = "e30=";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// `host:port`
    Tcp(String),
    Unix(PathBuf),
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Endpoint::Tcp(addr) => write!(f, "tcp://{addr}"),
            Endpoint::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpDaemon {
    endpoint: Endpoint,
}

impl HttpDaemon {
    pub fn new(endpoint: Endpoint) -> Self {
        Self { endpoint }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    async fn call(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
        headers: &[(&str, &str)],
    ) -> DaemonResult<Bytes> {
        let (status, bytes) = self.send(method.clone(), path, body, headers).await?;
        debug!(endpoint = %self.endpoint, %method, path, status = status.as_u16(), "daemon call");
        check_status(status, bytes)
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
        headers: &[(&str, &str)],
    ) -> DaemonResult<(StatusCode, Bytes)> {
        let mut builder = Request::builder()
            .method(method)
            .uri(path)
            .header("host", "docker")
            .header("user-agent", "packgrid/0.1");
        let payload = match body {
            Some(value) => {
                builder = builder.header("content-type", "application/json");
                Bytes::from(serde_json::to_vec(&value).map_err(|e| bad(e.to_string()))?)
            }
            None => Bytes::new(),
        };
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let req = builder
            .body(Full::new(payload))
            .map_err(|e| DaemonError::Transport(e.to_string()))?;

        match &self.endpoint {
            Endpoint::Tcp(addr) => {
                let stream = tokio::net::TcpStream::connect(addr)
                    .await
                    .map_err(|e| DaemonError::Transport(format!("{addr}: {e}")))?;
                exchange(stream, req).await
            }
            #[cfg(unix)]
            Endpoint::Unix(path) => {
                let stream = tokio::net::UnixStream::connect(path)
                    .await
                    .map_err(|e| DaemonError::Transport(format!("{}: {e}", path.display())))?;
                exchange(stream, req).await
            }
            #[cfg(not(unix))]
            Endpoint::Unix(_) => Err(DaemonError::Unsupported(
                "unix sockets on this platform".into(),
            )),
        }
    }

    async fn call_json<T: for<'de> Deserialize<'de>>(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> DaemonResult<T> {
        let bytes = self.call(method, path, body, &[]).await?;
        serde_json::from_slice(&bytes).map_err(|e| bad(format!("{path}: {e}")))
    }

    /// State-change calls tolerate "already in that state" (304).
    async fn post_action(&self, path: &str) -> DaemonResult<()> {
        let (status, bytes) = self.send(Method::POST, path, None, &[]).await?;
        if status == StatusCode::NOT_MODIFIED {
            return Ok(());
        }
        check_status(status, bytes).map(|_| ())
    }

    async fn create_raw(&self, name: Option<&str>, body: Value) -> DaemonResult<String> {
        let path = match name {
            Some(name) => format!("/containers/create?name={}", urlencoding::encode(name)),
            None => "/containers/create".to_string(),
        };
        let created: IdResponse = self.call_json(Method::POST, &path, Some(body)).await?;
        Ok(created.id)
    }
}

async fn exchange<S>(stream: S, req: Request<Full<Bytes>>) -> DaemonResult<(StatusCode, Bytes)>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
        .await
        .map_err(|e| DaemonError::Transport(format!("handshake: {e}")))?;

    tokio::spawn(async move {
        let _ = conn.await;
    });

    let resp = sender
        .send_request(req)
        .await
        .map_err(|e| DaemonError::Transport(e.to_string()))?;
    let status = resp.status();
    let body = resp
        .into_body()
        .collect()
        .await
        .map_err(|e| DaemonError::Transport(format!("reading body: {e}")))?
        .to_bytes();
    Ok((status, body))
}

fn check_status(status: StatusCode, body: Bytes) -> DaemonResult<Bytes> {
    if status.is_success() {
        return Ok(body);
    }
    let message = serde_json::from_slice::<Value>(&body)
        .ok()
        .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| String::from_utf8_lossy(&body).trim().to_string());
    Err(match status {
        StatusCode::NOT_FOUND => DaemonError::NotFound(message),
        StatusCode::CONFLICT => DaemonError::Conflict(message),
        other => DaemonError::Status {
            status: other.as_u16(),
            message,
        },
    })
}

fn bad(msg: String) -> DaemonError {
    DaemonError::BadResponse(msg)
}

fn enc(s: &str) -> String {
    urlencoding::encode(s).into_owned()
}

// ── Wire formats ───────────────────────────────────────────────────

#[derive(Deserialize)]
struct IdResponse {
    #[serde(rename = "Id")]
    id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListedContainer {
    id: String,
    #[serde(default)]
    names: Vec<String>,
    #[serde(default)]
    image: String,
    #[serde(default)]
    state: String,
    #[serde(default)]
    status: String,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "PascalCase", default)]
struct Inspected {
    id: String,
    name: String,
    state: InspectedState,
    config: InspectedConfig,
    host_config: InspectedHostConfig,
    mounts: Vec<InspectedMount>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "PascalCase", default)]
struct InspectedState {
    running: bool,
    restarting: bool,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "PascalCase", default)]
struct InspectedConfig {
    cmd: Option<Vec<String>>,
    entrypoint: Option<Vec<String>>,
    env: Option<Vec<String>>,
    exposed_ports: Option<serde_json::Map<String, Value>>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "PascalCase", default)]
struct InspectedHostConfig {
    binds: Option<Vec<String>>,
    cap_add: Option<Vec<String>>,
    port_bindings: Option<std::collections::BTreeMap<String, Option<Vec<WirePortBinding>>>>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "PascalCase", default)]
struct WirePortBinding {
    host_ip: String,
    host_port: String,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "PascalCase", default)]
struct InspectedMount {
    #[serde(rename = "Type")]
    kind: String,
    source: String,
    destination: String,
    #[serde(rename = "RW")]
    rw: bool,
    propagation: String,
}

impl From<Inspected> for ContainerDetails {
    fn from(raw: Inspected) -> Self {
        let port_bindings: PortMap = raw
            .host_config
            .port_bindings
            .unwrap_or_default()
            .into_iter()
            .map(|(port, bindings)| {
                let bindings = bindings
                    .unwrap_or_default()
                    .into_iter()
                    .map(|b| PortBinding {
                        host_ip: b.host_ip,
                        host_port: b.host_port,
                    })
                    .collect();
                (port, bindings)
            })
            .collect();
        ContainerDetails {
            id: raw.id,
            name: raw.name.trim_start_matches('/').to_string(),
            running: raw.state.running,
            restarting: raw.state.restarting,
            cmd: raw.config.cmd,
            entrypoint: raw.config.entrypoint,
            env: raw.config.env.unwrap_or_default(),
            exposed_ports: raw
                .config
                .exposed_ports
                .map(|m| m.keys().cloned().collect())
                .unwrap_or_default(),
            cap_add: raw.host_config.cap_add.unwrap_or_default(),
            binds: raw.host_config.binds.unwrap_or_default(),
            port_bindings,
            mounts: raw
                .mounts
                .into_iter()
                .map(|m| MountPoint {
                    kind: m.kind,
                    source: m.source,
                    destination: m.destination,
                    rw: m.rw,
                    propagation: m.propagation,
                })
                .collect(),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListedNetwork {
    name: String,
    #[serde(default)]
    driver: String,
    #[serde(rename = "IPAM", default)]
    ipam: Option<Ipam>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "PascalCase", default)]
struct Ipam {
    config: Option<Vec<IpamConfig>>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "PascalCase", default)]
struct IpamConfig {
    subnet: Option<String>,
    gateway: Option<String>,
}

/// Request body for container creation.
pub fn create_body(spec: &ContainerSpec) -> Value {
    let set = |keys: &[String]| -> Value {
        Value::Object(keys.iter().map(|k| (k.clone(), json!({}))).collect())
    };
    let hc = &spec.host_config;
    let port_bindings: serde_json::Map<String, Value> = hc
        .port_bindings
        .iter()
        .map(|(port, bindings)| {
            let list: Vec<Value> = bindings
                .iter()
                .map(|b| json!({ "HostIp": b.host_ip, "HostPort": b.host_port }))
                .collect();
            (port.clone(), Value::Array(list))
        })
        .collect();

    let mut host_config = json!({
        "Binds": hc.binds,
        "CapAdd": hc.cap_add,
        "PortBindings": port_bindings,
        "RestartPolicy": { "Name": hc.restart_policy.as_str() },
        "VolumesFrom": hc.volumes_from,
        "Privileged": hc.privileged,
        "AutoRemove": hc.auto_remove,
    });
    if let Some(mode) = &hc.network_mode {
        host_config["NetworkMode"] = json!(mode);
    }
    if let Some(log) = &hc.log_config {
        host_config["LogConfig"] = json!({
            "Type": log.driver,
            "Config": { "max-size": log.max_size, "max-file": log.max_file },
        });
    }

    let mut body = json!({
        "Image": spec.image,
        "Env": spec.env,
        "Volumes": set(&spec.volumes),
        "ExposedPorts": set(&spec.exposed_ports),
        "Tty": spec.tty,
        "AttachStdout": true,
        "AttachStderr": true,
        "HostConfig": host_config,
    });
    if let Some(hostname) = &spec.hostname {
        body["Hostname"] = json!(hostname);
    }
    if let Some(cmd) = &spec.cmd {
        body["Cmd"] = json!(cmd);
    }
    if let Some(entrypoint) = &spec.entrypoint {
        body["Entrypoint"] = json!(entrypoint);
    }
    if let Some(signal) = &spec.stop_signal {
        body["StopSignal"] = json!(signal);
    }
    if let Some(net) = &spec.network {
        let mut endpoints = serde_json::Map::new();
        endpoints.insert(
            net.network.clone(),
            json!({ "IPAMConfig": { "IPv4Address": net.ipv4_address.to_string() } }),
        );
        body["NetworkingConfig"] = json!({ "EndpointsConfig": endpoints });
    }
    body
}

// ── EngineApi ──────────────────────────────────────────────────────

#[async_trait]
impl EngineApi for HttpDaemon {
    async fn ping(&self) -> DaemonResult<()> {
        match tokio::time::timeout(PING_TIMEOUT, self.call(Method::GET, "/_ping", None, &[])).await
        {
            Ok(res) => res.map(|_| ()),
            Err(_) => Err(DaemonError::Timeout(format!("ping {}", self.endpoint))),
        }
    }

    async fn list_containers(&self) -> DaemonResult<Vec<ContainerSummary>> {
        let listed: Vec<ListedContainer> = self
            .call_json(Method::GET, "/containers/json?all=1", None)
            .await?;
        Ok(listed
            .into_iter()
            .map(|c| ContainerSummary {
                id: c.id,
                names: c.names,
                image: c.image,
                state: c.state,
                status: c.status,
            })
            .collect())
    }

    async fn create_container(&self, name: &str, spec: &ContainerSpec) -> DaemonResult<String> {
        self.create_raw(Some(name), create_body(spec)).await
    }

    async fn start_container(&self, id: &str) -> DaemonResult<()> {
        self.post_action(&format!("/containers/{}/start", enc(id))).await
    }

    async fn stop_container(&self, id: &str, timeout_secs: u64) -> DaemonResult<()> {
        self.post_action(&format!("/containers/{}/stop?t={timeout_secs}", enc(id)))
            .await
    }

    async fn restart_container(&self, id: &str, timeout_secs: u64) -> DaemonResult<()> {
        self.post_action(&format!("/containers/{}/restart?t={timeout_secs}", enc(id)))
            .await
    }

    async fn pause_container(&self, id: &str) -> DaemonResult<()> {
        self.post_action(&format!("/containers/{}/pause", enc(id))).await
    }

    async fn unpause_container(&self, id: &str) -> DaemonResult<()> {
        self.post_action(&format!("/containers/{}/unpause", enc(id))).await
    }

    async fn kill_container(&self, id: &str, signal: &str) -> DaemonResult<()> {
        self.post_action(&format!(
            "/containers/{}/kill?signal={}",
            enc(id),
            enc(signal)
        ))
        .await
    }

    async fn remove_container(&self, id: &str) -> DaemonResult<()> {
        self.call(
            Method::DELETE,
            &format!("/containers/{}?force=1&v=1", enc(id)),
            None,
            &[],
        )
        .await
        .map(|_| ())
    }

    async fn inspect_container(&self, id: &str) -> DaemonResult<ContainerDetails> {
        let raw: Inspected = self
            .call_json(Method::GET, &format!("/containers/{}/json", enc(id)), None)
            .await?;
        Ok(raw.into())
    }

    async fn exec(&self, id: &str, cmd: &[String], working_dir: &str) -> DaemonResult<String> {
        let created: IdResponse = self
            .call_json(
                Method::POST,
                &format!("/containers/{}/exec", enc(id)),
                Some(json!({
                    "AttachStdout": true,
                    "AttachStderr": true,
                    "Cmd": cmd,
                    "WorkingDir": working_dir,
                })),
            )
            .await?;
        let body = self
            .call(
                Method::POST,
                &format!("/exec/{}/start", enc(&created.id)),
                Some(json!({ "Detach": false, "Tty": false })),
                &[],
            )
            .await?;
        Ok(demux(&body))
    }

    async fn logs(&self, id: &str, opts: &LogsOptions) -> DaemonResult<String> {
        let mut path = format!(
            "/containers/{}/logs?stdout=1&stderr=1&timestamps={}",
            enc(id),
            u8::from(opts.timestamps)
        );
        if let Some(tail) = opts.tail {
            path.push_str(&format!("&tail={tail}"));
        }
        if let Some(since) = opts.since {
            path.push_str(&format!("&since={since}"));
        }
        let body = self.call(Method::GET, &path, None, &[]).await?;
        Ok(demux(&body))
    }

    async fn pull_image(&self, image: &str) -> DaemonResult<()> {
        let (repo, tag) = split_repo_tag(image);
        let body = self
            .call(
                Method::POST,
                &format!("/images/create?fromImage={}&tag={}", enc(repo), enc(tag)),
                None,
                &[("X-Registry-Auth", ANONYMOUS_AUTH)],
            )
            .await?;
        match progress_error(&body) {
            Some(err) => Err(DaemonError::Status {
                status: 500,
                message: format!("pull {image}: {err}"),
            }),
            None => Ok(()),
        }
    }

    async fn tag_image(&self, image: &str, repo: &str, tag: &str) -> DaemonResult<()> {
        self.call(
            Method::POST,
            &format!(
                "/images/{}/tag?repo={}&tag={}",
                image,
                enc(repo),
                enc(tag)
            ),
            None,
            &[],
        )
        .await
        .map(|_| ())
    }

    async fn push_image(&self, repo: &str, tag: &str) -> DaemonResult<()> {
        let body = self
            .call(
                Method::POST,
                &format!("/images/{repo}/push?tag={}", enc(tag)),
                None,
                &[("X-Registry-Auth", ANONYMOUS_AUTH)],
            )
            .await?;
        match progress_error(&body) {
            Some(err) => Err(DaemonError::Status {
                status: 500,
                message: format!("push {repo}:{tag}: {err}"),
            }),
            None => Ok(()),
        }
    }

    async fn prune_images(&self, until: &str) -> DaemonResult<()> {
        let filters = json!({ "until": [until] }).to_string();
        self.call(
            Method::POST,
            &format!("/images/prune?filters={}", enc(&filters)),
            None,
            &[],
        )
        .await
        .map(|_| ())
    }

    async fn prune_volumes(&self) -> DaemonResult<()> {
        self.call(Method::POST, "/volumes/prune", None, &[])
            .await
            .map(|_| ())
    }

    async fn list_networks(&self) -> DaemonResult<Vec<NetworkSummary>> {
        let listed: Vec<ListedNetwork> = self.call_json(Method::GET, "/networks", None).await?;
        Ok(listed
            .into_iter()
            .map(|n| {
                let configs = n.ipam.and_then(|i| i.config).unwrap_or_default();
                NetworkSummary {
                    name: n.name,
                    driver: n.driver,
                    subnets: configs.iter().filter_map(|c| c.subnet.clone()).collect(),
                    gateways: configs
                        .iter()
                        .filter_map(|c| c.gateway.as_deref().and_then(|g| g.parse().ok()))
                        .collect(),
                }
            })
            .collect())
    }

    async fn create_network(&self, spec: &NetworkSpec) -> DaemonResult<()> {
        self.call(
            Method::POST,
            "/networks/create",
            Some(json!({
                "Name": spec.name,
                "Driver": spec.driver,
                "CheckDuplicate": true,
                "IPAM": {
                    "Config": [{ "Subnet": spec.subnet, "Gateway": spec.gateway.to_string() }]
                },
            })),
            &[],
        )
        .await
        .map(|_| ())
    }

    async fn run_oneshot(&self, job: &OneShot) -> DaemonResult<OneShotOutput> {
        let id = self
            .create_raw(
                None,
                json!({
                    "Image": job.image,
                    "Cmd": job.cmd,
                    "Tty": false,
                    "HostConfig": { "Binds": job.binds, "Privileged": job.privileged },
                }),
            )
            .await?;

        let result = async {
            self.start_container(&id).await?;
            let waited: Value = self
                .call_json(Method::POST, &format!("/containers/{}/wait", enc(&id)), None)
                .await?;
            let exit_code = waited.get("StatusCode").and_then(Value::as_i64).unwrap_or(-1);
            let output = self.logs(&id, &LogsOptions::default()).await?;
            Ok::<_, DaemonError>(OneShotOutput { exit_code, output })
        }
        .await;

        if let Err(e) = self.remove_container(&id).await {
            debug!(%id, error = %e, "one-shot container cleanup failed");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use packgrid_core::{HostConfig, LogConfig, NetworkAttachment, RestartPolicy};
    use std::net::Ipv4Addr;

    #[test]
    fn create_body_maps_every_section() {
        let mut ports = PortMap::new();
        ports.insert(
            "80/tcp".into(),
            vec![PortBinding {
                host_ip: "10.0.0.5".into(),
                host_port: "8080".into(),
            }],
        );
        let spec = ContainerSpec {
            image: "reg:5000/web:1".into(),
            hostname: Some("web_0_1_e1".into()),
            cmd: Some(vec!["run".into()]),
            entrypoint: None,
            env: vec!["A=1".into()],
            volumes: vec!["/data".into()],
            exposed_ports: vec!["80/tcp".into()],
            tty: false,
            stop_signal: Some("SIGINT".into()),
            host_config: HostConfig {
                binds: vec!["/a:/b".into()],
                cap_add: vec!["SYS_PTRACE".into()],
                port_bindings: ports,
                restart_policy: RestartPolicy::UnlessStopped,
                log_config: Some(LogConfig {
                    driver: "json-file".into(),
                    max_size: "10m".into(),
                    max_file: "10".into(),
                }),
                ..Default::default()
            },
            network: Some(NetworkAttachment {
                network: "pg_network".into(),
                ipv4_address: Ipv4Addr::new(172, 30, 5, 1),
            }),
        };

        let body = create_body(&spec);
        assert_eq!(body["Image"], "reg:5000/web:1");
        assert_eq!(body["Volumes"], json!({ "/data": {} }));
        assert_eq!(body["ExposedPorts"], json!({ "80/tcp": {} }));
        assert!(body.get("Entrypoint").is_none());
        assert_eq!(body["HostConfig"]["RestartPolicy"]["Name"], "unless-stopped");
        assert_eq!(
            body["HostConfig"]["PortBindings"]["80/tcp"][0]["HostPort"],
            "8080"
        );
        assert_eq!(body["HostConfig"]["LogConfig"]["Config"]["max-file"], "10");
        assert_eq!(
            body["NetworkingConfig"]["EndpointsConfig"]["pg_network"]["IPAMConfig"]["IPv4Address"],
            "172.30.5.1"
        );
    }

    #[test]
    fn error_statuses_map_to_kinds() {
        let body = Bytes::from_static(br#"{"message":"No such container: abc"}"#);
        assert_eq!(
            check_status(StatusCode::NOT_FOUND, body.clone()),
            Err(DaemonError::NotFound("No such container: abc".into()))
        );
        assert!(matches!(
            check_status(StatusCode::CONFLICT, body.clone()),
            Err(DaemonError::Conflict(_))
        ));
        assert!(matches!(
            check_status(StatusCode::INTERNAL_SERVER_ERROR, Bytes::from_static(b"boom")),
            Err(DaemonError::Status { status: 500, .. })
        ));
        assert!(check_status(StatusCode::NO_CONTENT, Bytes::new()).is_ok());
    }

    #[test]
    fn inspection_parses_into_details() {
        let raw: Inspected = serde_json::from_value(json!({
            "Id": "abc",
            "Name": "/PG_1_web_0_1_e1_5",
            "State": { "Running": true, "Restarting": false },
            "Config": {
                "Cmd": ["serve"],
                "Entrypoint": null,
                "Env": ["A=1"],
                "ExposedPorts": { "80/tcp": {} }
            },
            "HostConfig": {
                "Binds": ["/a:/b"],
                "CapAdd": null,
                "PortBindings": { "80/tcp": [{ "HostIp": "10.0.0.5", "HostPort": "80" }], "81/tcp": null }
            },
            "Mounts": [{ "Type": "bind", "Source": "/a", "Destination": "/b", "RW": true, "Propagation": "" }]
        }))
        .unwrap();
        let details = ContainerDetails::from(raw);
        assert_eq!(details.name, "PG_1_web_0_1_e1_5");
        assert!(details.running);
        assert_eq!(details.cmd, Some(vec!["serve".to_string()]));
        assert_eq!(details.entrypoint, None);
        assert!(details.cap_add.is_empty());
        assert_eq!(details.exposed_ports, vec!["80/tcp"]);
        assert_eq!(details.port_bindings["81/tcp"], vec![]);
        assert_eq!(details.mounts[0].as_bind().unwrap(), "/a:/b");
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_a_transport_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let daemon = HttpDaemon::new(Endpoint::Tcp(addr.to_string()));
        assert!(matches!(
            daemon.ping().await,
            Err(DaemonError::Transport(_))
        ));
    }
}
