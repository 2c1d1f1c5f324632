//! Names and paths shared by every engine.

/// Prefix of every managed container name.
pub const CONTAINER_PREFIX: &str = "PG";

/// Private bridge network created on each engine.
pub const NETWORK_NAME: &str = "pg_network";

/// Prefix of shared-resource data containers.
pub const SHARED_RESOURCE_PREFIX: &str = "PG_SR_";

/// Role id of the per-pack support sidecar.
pub const SUPPORT_PCID: &str = "support";

/// Role id of the optional traffic-capture sidecar.
pub const CAPTURE_PCID: &str = "capture";

/// Helper image in the resources registry.
pub const SUPPORT_IMAGE: &str = "alpine";

pub const CAPTURE_IMAGE: &str = "sniffer:latest";

/// Per-role dump directories on the engine host live under this root.
pub const DUMPS_ROOT: &str = "/var/opt/packgrid/dumps";

/// Where the dumps root is mounted inside the support sidecar.
pub const SIDECAR_DUMPS_ROOT: &str = "/HostDumpsRoot";

/// Dump directory inside role containers.
pub const CONTAINER_DUMPS_DIR: &str = "/tmp/cores";

/// Kernel core pattern the engine host is expected to carry.
pub const CORE_PATTERN: &str = "/tmp/cores/core.%e.%p.%h.%t";

pub const DEFAULT_CAPS: [&str; 2] = ["SYS_PTRACE", "SYS_ADMIN"];

pub const HOST_TZ_BINDS: [&str; 2] = [
    "/etc/timezone:/etc/timezone:ro",
    "/etc/localtime:/etc/localtime:ro",
];

/// Hostnames are cut to this many characters.
pub const HOSTNAME_MAX: usize = 15;

/// Default port of a plain-HTTP daemon endpoint.
pub const DEFAULT_HTTP_PORT: u16 = 2375;

/// Socket used for [`ConnectionProtocol::Local`](packgrid_core::ConnectionProtocol).
pub const LOCAL_SOCKET: &str = "/var/run/docker.sock";

pub const PERF_HEADER: &str = "pid,pcpu,vsz,rss,cputimes,etimes,thcount,timestamp";
