//! Container spec resolution.
//!
//! Pure functions that turn a role template, per-deploy overrides and the
//! pack's network facts into a [`ContainerSpec`]. Nothing here touches a
//! daemon or the store, which keeps every merge rule unit-testable.
//!
//! ```text
//! RoleTemplate ─┐
//! Overrides ────┼─► resolve() ─► ContainerSpec
//! IPs, names ───┘
//! ```

use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::sync::LazyLock;

use regex::Regex;

use packgrid_core::{
    ContainerSpec, HostConfig, LogConfig, NetworkAttachment, OverrideParams, PackInfo, PortBinding,
    PortMap, RestartPolicy, RoleTemplate,
};

use crate::constants::{
    CONTAINER_DUMPS_DIR, CONTAINER_PREFIX, DEFAULT_CAPS, DUMPS_ROOT, HOST_TZ_BINDS, HOSTNAME_MAX,
    NETWORK_NAME,
};
use crate::error::{EngineError, EngineResult};

/// Names of containers this system created, in any pack.
static MANAGED_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^PG_\d+_.+\d+$").expect("static regex"));

static CONTAINER_INDEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^PG_(\d+)_").expect("static regex"));

// ── Names ──────────────────────────────────────────────────────────

/// `PG_<idx>_<role>_<clone>_<pack>_<ms>`
pub fn container_name(idx: u64, pcid: &str, clone_id: u32, pack_id: &str, ts: u64) -> String {
    format!("{CONTAINER_PREFIX}_{idx}_{pcid}_{clone_id}_{pack_id}_{ts}")
}

pub fn is_managed_name(name: &str) -> bool {
    MANAGED_NAME.is_match(name)
}

/// Creation index encoded in a managed container name.
pub fn container_index(name: &str) -> Option<u64> {
    CONTAINER_INDEX
        .captures(name)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Leading numeric index of a pack id (`<idx>_<engine>`).
pub fn pack_index(pack_id: &str) -> Option<u64> {
    pack_id.split('_').next().and_then(|n| n.parse().ok())
}

pub fn hostname(pcid: &str, clone_id: u32, pack_id: &str) -> String {
    format!("{pcid}_{clone_id}_{pack_id}")
        .chars()
        .take(HOSTNAME_MAX)
        .collect()
}

// ── Images ─────────────────────────────────────────────────────────

/// Split `repo[:tag]` on the last colon after the last slash.
pub fn split_repo_tag(image: &str) -> (&str, &str) {
    let slash = image.rfind('/').map(|i| i + 1).unwrap_or(0);
    match image[slash..].rfind(':') {
        Some(i) => (&image[..slash + i], &image[slash + i + 1..]),
        None => (image, "latest"),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageName {
    /// `host[:port]` when the name carries one.
    pub registry: Option<String>,
    pub repo: String,
    pub tag: String,
}

/// Parse `[host[:port]/]repo[:tag]`.
///
/// The first path component is a registry when it contains a dot or a
/// colon, or is `localhost`.
pub fn parse_image_name(name: &str) -> EngineResult<ImageName> {
    let name = name.trim();
    if name.is_empty() || name.contains(char::is_whitespace) {
        return Err(EngineError::InvalidImage(name.to_string()));
    }
    let (registry, rest) = match name.split_once('/') {
        Some((first, rest))
            if first.contains('.') || first.contains(':') || first == "localhost" =>
        {
            (Some(first.to_string()), rest)
        }
        _ => (None, name),
    };
    let (repo, tag) = split_repo_tag(rest);
    if repo.is_empty() || tag.is_empty() {
        return Err(EngineError::InvalidImage(name.to_string()));
    }
    Ok(ImageName {
        registry,
        repo: repo.to_string(),
        tag: tag.to_string(),
    })
}

// ── Binds ──────────────────────────────────────────────────────────

/// Destination path of `source:destination[:options]`.
pub fn parse_bind_destination(bind: &str) -> EngineResult<&str> {
    let mut parts = bind.splitn(3, ':');
    let source = parts.next().unwrap_or_default();
    let destination = parts.next().unwrap_or_default();
    if source.is_empty() || destination.is_empty() {
        return Err(EngineError::InvalidBind(bind.to_string()));
    }
    Ok(destination)
}

/// One bind per destination: the last source given for a destination wins,
/// destinations keep the order they first appeared in.
pub fn dedup_binds(binds: &[String]) -> EngineResult<Vec<String>> {
    let mut out: Vec<(String, String)> = Vec::new();
    for bind in binds {
        let dst = parse_bind_destination(bind)?;
        match out.iter_mut().find(|(d, _)| d == dst) {
            Some(slot) => slot.1 = bind.clone(),
            None => out.push((dst.to_string(), bind.clone())),
        }
    }
    Ok(out.into_iter().map(|(_, b)| b).collect())
}

/// `source:destination` with the destination moved under `/PG/<pcid>_<clone>`.
pub fn remap_bind(bind: &str, pcid: &str, clone_id: u32) -> Option<String> {
    let (source, rest) = bind.split_once(':')?;
    Some(format!("{source}:/PG/{pcid}_{clone_id}{rest}"))
}

// ── Ports ──────────────────────────────────────────────────────────

fn parse_range(part: &str, spec: &str) -> EngineResult<(u16, u16)> {
    let bad = || EngineError::InvalidPortSpec(spec.to_string());
    let (start, end) = match part.split_once('-') {
        Some((a, b)) => (a, b),
        None => (part, part),
    };
    let start: u16 = start.trim().parse().map_err(|_| bad())?;
    let end: u16 = end.trim().parse().map_err(|_| bad())?;
    if end < start {
        return Err(bad());
    }
    Ok((start, end))
}

/// Expand `host[-hostEnd][:inner[-innerEnd]]` entries into exposed ports and
/// host bindings on `host_ip`.
///
/// Ranges are inclusive on both ends and must have equal lengths.
pub fn expand_ports(
    specs: &[String],
    proto: &str,
    host_ip: &str,
) -> EngineResult<(Vec<String>, PortMap)> {
    let mut exposed = Vec::new();
    let mut bindings = PortMap::new();
    for spec in specs {
        let spec = spec.trim();
        if spec.is_empty() {
            continue;
        }
        let (host, inner) = match spec.split_once(':') {
            Some((h, i)) => (parse_range(h, spec)?, parse_range(i, spec)?),
            None => {
                let r = parse_range(spec, spec)?;
                (r, r)
            }
        };
        if host.1 - host.0 != inner.1 - inner.0 {
            return Err(EngineError::InvalidPortSpec(spec.to_string()));
        }
        for offset in 0..=(inner.1 - inner.0) {
            let key = format!("{}/{proto}", inner.0 + offset);
            if !exposed.contains(&key) {
                exposed.push(key.clone());
            }
            bindings.insert(
                key,
                vec![PortBinding {
                    host_ip: host_ip.to_string(),
                    host_port: (host.0 + offset).to_string(),
                }],
            );
        }
    }
    Ok((exposed, bindings))
}

// ── Addresses ──────────────────────────────────────────────────────

/// First pack IP not already used by a container of the same role.
pub fn pick_external_ip(pack: &PackInfo, pcid: &str) -> EngineResult<Ipv4Addr> {
    pack.ip_list
        .iter()
        .copied()
        .find(|ip| {
            !pack
                .containers
                .iter()
                .any(|c| c.pcid == pcid && c.ip == Some(*ip))
        })
        .ok_or(EngineError::NoFreeIps { needed: 1, free: 0 })
}

/// `<gw.a>.<gw.b>.<last octet of ip>.<n>` for the lowest free `n` in 1..=253.
pub fn next_internal_ip(
    gateway: Ipv4Addr,
    external: Ipv4Addr,
    pack: &PackInfo,
) -> EngineResult<Ipv4Addr> {
    let [a, b, _, _] = gateway.octets();
    let third = external.octets()[3];
    let taken: BTreeSet<Ipv4Addr> = pack.containers.iter().filter_map(|c| c.internal_ip).collect();
    (1..=253u8)
        .map(|n| Ipv4Addr::new(a, b, third, n))
        .find(|ip| !taken.contains(ip))
        .ok_or_else(|| EngineError::InternalIpExhausted(format!("{}/{external}", pack.id)))
}

// ── Resolution ─────────────────────────────────────────────────────

/// Variables substituted in cmd, entrypoint and env entries.
#[derive(Debug, Clone)]
pub struct SpecVars {
    /// `${CIP}`: this container's external IP.
    pub container_ip: Ipv4Addr,
    /// `${MIP}`: the pack's first IP.
    pub main_ip: Ipv4Addr,
}

pub fn substitute(value: &str, vars: &SpecVars) -> String {
    value
        .replace("${CIP}", &vars.container_ip.to_string())
        .replace("${MIP}", &vars.main_ip.to_string())
        .replace("${DUMPS}", CONTAINER_DUMPS_DIR)
}

/// An empty list or a list whose first entry is blank means "unset".
fn non_blank(list: Vec<String>) -> Option<Vec<String>> {
    match list.first() {
        Some(first) if !first.trim().is_empty() => Some(list),
        _ => None,
    }
}

pub fn log_config() -> LogConfig {
    LogConfig {
        driver: "json-file".into(),
        max_size: "10m".into(),
        max_file: "10".into(),
    }
}

pub struct SpecInput<'a> {
    pub template: &'a RoleTemplate,
    pub overrides: &'a OverrideParams,
    pub image: String,
    pub pcid: &'a str,
    pub clone_id: u32,
    pub pack_id: &'a str,
    pub vars: SpecVars,
    pub internal_ip: Ipv4Addr,
    pub restart: RestartPolicy,
    pub bind_host_tz: bool,
    /// Replacement containers inherit data through binds only.
    pub is_upgrade: bool,
}

/// Merge template and overrides into a full creation spec.
///
/// Overrides replace template values field by field; they never merge
/// element-wise, except for capabilities, which always include the
/// debugging defaults.
pub fn resolve(input: SpecInput<'_>) -> EngineResult<ContainerSpec> {
    let t = input.template;
    let o = input.overrides;
    let vars = &input.vars;
    let subst = |list: Vec<String>| -> Vec<String> {
        list.iter().map(|v| substitute(v, vars)).collect()
    };

    let cmd = non_blank(o.cmd.clone().unwrap_or_else(|| t.cmd.clone())).map(subst);
    let entrypoint =
        non_blank(o.entrypoint.clone().unwrap_or_else(|| t.entrypoint.clone())).map(subst);
    let env = subst(o.env.clone().unwrap_or_else(|| t.env.clone()));

    let mut cap_add: Vec<String> = DEFAULT_CAPS.iter().map(|c| c.to_string()).collect();
    for cap in o.cap_add.as_ref().unwrap_or(&t.cap_add) {
        if !cap_add.contains(cap) {
            cap_add.push(cap.clone());
        }
    }

    let mut binds = o.binds.clone().unwrap_or_else(|| t.binds.clone());
    if input.bind_host_tz {
        binds.extend(HOST_TZ_BINDS.iter().map(|b| b.to_string()));
    }
    let has_dumps = binds
        .iter()
        .any(|b| parse_bind_destination(b).is_ok_and(|d| d == CONTAINER_DUMPS_DIR));
    if !has_dumps {
        binds.push(format!("{DUMPS_ROOT}/{}:{CONTAINER_DUMPS_DIR}", input.pcid));
    }
    let binds = dedup_binds(&binds)?;
    let bind_dests: BTreeSet<&str> = binds
        .iter()
        .filter_map(|b| parse_bind_destination(b).ok())
        .collect();

    let volumes = if input.is_upgrade {
        Vec::new()
    } else {
        let mut seen = BTreeSet::new();
        o.volumes
            .as_ref()
            .unwrap_or(&t.volumes)
            .iter()
            .filter(|v| !bind_dests.contains(v.as_str()))
            .filter(|v| seen.insert(v.as_str()))
            .cloned()
            .collect()
    };

    let (exposed_ports, port_bindings) = match &o.port_bindings {
        Some(inherited) => (
            o.exposed_ports
                .clone()
                .unwrap_or_else(|| inherited.keys().cloned().collect()),
            inherited.clone(),
        ),
        None => {
            let host_ip = vars.container_ip.to_string();
            let (mut exposed, mut bindings) =
                expand_ports(o.tcp_ports.as_ref().unwrap_or(&t.tcp_ports), "tcp", &host_ip)?;
            let (udp_exposed, udp_bindings) =
                expand_ports(o.udp_ports.as_ref().unwrap_or(&t.udp_ports), "udp", &host_ip)?;
            exposed.extend(udp_exposed);
            bindings.extend(udp_bindings);
            (exposed, bindings)
        }
    };

    Ok(ContainerSpec {
        image: input.image,
        hostname: Some(hostname(input.pcid, input.clone_id, input.pack_id)),
        cmd,
        entrypoint,
        env,
        volumes,
        exposed_ports,
        tty: false,
        stop_signal: Some("SIGINT".into()),
        host_config: HostConfig {
            binds,
            cap_add,
            port_bindings,
            restart_policy: input.restart,
            log_config: Some(log_config()),
            ..Default::default()
        },
        network: Some(NetworkAttachment {
            network: NETWORK_NAME.to_string(),
            ipv4_address: input.internal_ip,
        }),
    })
}
