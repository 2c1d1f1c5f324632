//! Shared domain types for packgrid.
//!
//! Every persisted entity carries an [`ItemMeta`] and implements
//! [`StoreItem`], which is all the persistent store needs to know about it.
//! Requests (deploy, upgrade, build) are transient and never persisted.

use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

pub type EngineId = String;
pub type PackId = String;
pub type BundleId = String;
pub type BuilderId = String;
pub type RegistryId = String;

/// Registry item seeded at startup; sidecar and helper images come from it.
pub const RESOURCES_REGISTRY_ID: &str = "PG_Resources";

/// Label an engine must carry to accept build requests.
pub const BUILDER_LABEL: &str = "builder";

/// Capacity budget used when an engine item does not set one.
pub const DEFAULT_CAPACITY_LIMIT: u32 = 100;

/// Milliseconds since the Unix epoch.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ── Store items ────────────────────────────────────────────────────

/// Bookkeeping stamped by the store on every successful write.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ItemMeta {
    /// Epoch ms of the last successful save.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_save: Option<u64>,
    /// Epoch ms of the first successful save.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<u64>,
}

/// An entity that can live in a persistent collection.
pub trait StoreItem: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    fn id(&self) -> &str;
    fn set_id(&mut self, id: String);
    fn meta(&self) -> &ItemMeta;
    fn meta_mut(&mut self) -> &mut ItemMeta;
}

macro_rules! store_item {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl StoreItem for $ty {
                fn id(&self) -> &str {
                    &self.id
                }
                fn set_id(&mut self, id: String) {
                    self.id = id;
                }
                fn meta(&self) -> &ItemMeta {
                    &self.meta
                }
                fn meta_mut(&mut self) -> &mut ItemMeta {
                    &mut self.meta
                }
            }
        )+
    };
}

store_item!(
    EngineInfo,
    BuilderInfo,
    BundleInfo,
    PackInfo,
    RegistryInfo,
    SharedDataInfo,
);

// ── Engines ────────────────────────────────────────────────────────

/// How the controller reaches an engine's daemon.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionProtocol {
    /// The daemon socket on this host.
    #[default]
    Local,
    /// An explicit unix socket path in `host`.
    Unix,
    /// Plain HTTP to `host:port`.
    Http,
    /// A remote daemon reached through an SSH local forward.
    Ssh,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionInfo {
    #[serde(default)]
    pub protocol: ConnectionProtocol,
    #[serde(default)]
    pub host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Key file name inside the configured SSH key directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IpRange {
    pub start: Ipv4Addr,
    pub count: u32,
}

impl IpRange {
    /// Addresses covered by the range, stopping at the end of the v4 space.
    pub fn addresses(&self) -> impl Iterator<Item = Ipv4Addr> + '_ {
        let base = u32::from(self.start);
        (0..self.count).filter_map(move |i| base.checked_add(i).map(Ipv4Addr::from))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkInfo {
    /// Gateway of the private bridge network; detected when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<Ipv4Addr>,
    #[serde(default)]
    pub ip_list: Vec<Ipv4Addr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_range: Option<IpRange>,
}

impl NetworkInfo {
    /// The full configured pool: static list followed by the range.
    pub fn full_pool(&self) -> BTreeSet<Ipv4Addr> {
        let mut pool: BTreeSet<Ipv4Addr> = self.ip_list.iter().copied().collect();
        if let Some(range) = &self.ip_range {
            pool.extend(range.addresses());
        }
        pool
    }
}

/// One managed container-engine host.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EngineInfo {
    pub id: EngineId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub connection: ConnectionInfo,
    #[serde(default)]
    pub network: NetworkInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity_limit: Option<u32>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub auto_core_pattern: bool,
    /// Timer name → epoch ms of its last run.
    #[serde(default)]
    pub last_timer_marks: BTreeMap<String, u64>,
    #[serde(flatten)]
    pub meta: ItemMeta,
}

impl EngineInfo {
    pub fn capacity_limit(&self) -> u32 {
        self.capacity_limit.unwrap_or(DEFAULT_CAPACITY_LIMIT)
    }

    /// Configured labels plus the engine's own id.
    pub fn effective_labels(&self) -> BTreeSet<String> {
        let mut labels: BTreeSet<String> = self.labels.iter().cloned().collect();
        labels.insert(self.id.clone());
        labels
    }

    /// Whether two versions differ in anything an operator configures.
    ///
    /// Runtime bookkeeping (timer marks, save stamps) is ignored so that the
    /// controller persisting its own marks does not trigger a re-init.
    pub fn same_config(&self, other: &EngineInfo) -> bool {
        self.id == other.id
            && self.name == other.name
            && self.disabled == other.disabled
            && self.connection == other.connection
            && self.network == other.network
            && self.capacity_limit() == other.capacity_limit()
            && self.effective_labels() == other.effective_labels()
            && self.auto_core_pattern == other.auto_core_pattern
    }
}

// ── Builders & bundles ─────────────────────────────────────────────

/// Where a role's image is re-tagged and pushed during a build.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheTarget {
    pub repo_name: String,
    #[serde(default)]
    pub tag_prefix: String,
    pub registry_id: RegistryId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StaticImage {
    /// `repo[:tag]`, tag defaults to `latest`.
    pub image: String,
    pub registry_id: RegistryId,
}

/// Per-role template inside a builder.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RoleTemplate {
    pub pcid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_dst: Option<CacheTarget>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub static_image: Option<StaticImage>,
    pub shared_resources: Vec<String>,
    pub tcp_ports: Vec<String>,
    pub udp_ports: Vec<String>,
    pub env: Vec<String>,
    pub cmd: Vec<String>,
    pub entrypoint: Vec<String>,
    pub cap_add: Vec<String>,
    pub binds: Vec<String>,
    pub volumes: Vec<String>,
    /// Binary sampled by performance collection.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_bin_path: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BuilderInfo {
    pub id: BuilderId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default)]
    pub result_prefix: String,
    #[serde(default)]
    pub next_result_id: u64,
    #[serde(default)]
    pub images: Vec<RoleTemplate>,
    #[serde(flatten)]
    pub meta: ItemMeta,
}

impl BuilderInfo {
    pub fn role(&self, pcid: &str) -> Option<&RoleTemplate> {
        self.images.iter().find(|r| r.pcid == pcid)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageRef {
    pub registry_id: RegistryId,
    pub repo_name: String,
    pub image_tag: String,
}

/// Concrete image for one role of a bundle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoleImage {
    pub pcid: String,
    pub repo_name: String,
    pub image_tag: String,
    pub registry_id: RegistryId,
    /// Upstream reference when the image was cached under a new tag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original: Option<ImageRef>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BundleInfo {
    pub id: BundleId,
    pub builder_id: BuilderId,
    #[serde(default)]
    pub images_to_deploy: Vec<RoleImage>,
    #[serde(default)]
    pub build_info: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub corrupted: bool,
    #[serde(flatten)]
    pub meta: ItemMeta,
}

impl BundleInfo {
    pub fn role(&self, pcid: &str) -> Option<&RoleImage> {
        self.images_to_deploy.iter().find(|r| r.pcid == pcid)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RegistryInfo {
    pub id: RegistryId,
    #[serde(default)]
    pub name: String,
    /// `host[:port]`; empty means the daemon's default registry.
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub hidden: bool,
    #[serde(flatten)]
    pub meta: ItemMeta,
}

/// A data-only container shared between packs on one engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SharedDataInfo {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub image: String,
    pub registry_id: RegistryId,
    pub data_path: String,
    #[serde(default)]
    pub hidden: bool,
    #[serde(flatten)]
    pub meta: ItemMeta,
}

// ── Containers ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    #[default]
    No,
    UnlessStopped,
}

impl RestartPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RestartPolicy::No => "no",
            RestartPolicy::UnlessStopped => "unless-stopped",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortBinding {
    pub host_ip: String,
    pub host_port: String,
}

/// `"80/tcp"` → host bindings.
pub type PortMap = BTreeMap<String, Vec<PortBinding>>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogConfig {
    pub driver: String,
    pub max_size: String,
    pub max_file: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HostConfig {
    pub binds: Vec<String>,
    pub cap_add: Vec<String>,
    pub port_bindings: PortMap,
    pub restart_policy: RestartPolicy,
    pub volumes_from: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_mode: Option<String>,
    pub privileged: bool,
    pub auto_remove: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_config: Option<LogConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkAttachment {
    pub network: String,
    pub ipv4_address: Ipv4Addr,
}

/// Fully resolved creation options for one container.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ContainerSpec {
    pub image: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<Vec<String>>,
    pub env: Vec<String>,
    pub volumes: Vec<String>,
    /// `"80/tcp"` entries.
    pub exposed_ports: Vec<String>,
    pub tty: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_signal: Option<String>,
    pub host_config: HostConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<NetworkAttachment>,
}

/// One container inside a pack.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ContainerRecord {
    pub pcid: String,
    pub clone_id: u32,
    #[serde(default)]
    pub is_system: bool,
    /// Daemon-assigned id; absent between persisting and creating.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bundle_id: Option<BundleId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<Ipv4Addr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internal_ip: Option<Ipv4Addr>,
    #[serde(default)]
    pub created_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<ContainerSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default)]
    pub no_ps: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_bin_path: Option<String>,
}

// ── Packs ──────────────────────────────────────────────────────────

/// Policy flags shared by deploy and upgrade requests.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DeployOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_tag: Option<String>,
    pub bind_host_tz: bool,
    pub collect_performance: bool,
    pub monitor_dumps: bool,
    pub add_capture: bool,
    pub auto_restart: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CorePatternCheck {
    pub current: String,
    pub expected: String,
    pub is_ok: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoleDumps {
    /// Written by this very container.
    pub own: Vec<String>,
    /// Written through the kernel core-pattern hook.
    pub kernel: Vec<String>,
    /// Anything else that looks like a core file.
    pub manual: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DumpsReport {
    pub config: CorePatternCheck,
    pub dumps: BTreeMap<String, RoleDumps>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

/// One live deployment of a bundle on one engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PackInfo {
    pub id: PackId,
    pub engine_id: EngineId,
    pub builder_id: BuilderId,
    pub initial_bundle_id: BundleId,
    #[serde(default)]
    pub ip_list: Vec<Ipv4Addr>,
    #[serde(default)]
    pub containers: Vec<ContainerRecord>,
    /// Capacity weight debited from the engine budget.
    #[serde(default)]
    pub load: u32,
    #[serde(default)]
    pub keep_alive: bool,
    #[serde(default)]
    pub last_ping: u64,
    #[serde(default)]
    pub deploy_in_progress: bool,
    #[serde(default)]
    pub upgrade_in_progress: bool,
    #[serde(default)]
    pub marked_for_delete: bool,
    #[serde(default)]
    pub corrupted: bool,
    /// Build info of each role container, keyed `<pcid>_<clone>`.
    #[serde(default)]
    pub build_info: BTreeMap<String, serde_json::Value>,
    #[serde(flatten)]
    pub options: DeployOptions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_dumps_check: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_dumps_info: Option<DumpsReport>,
    #[serde(flatten)]
    pub meta: ItemMeta,
}

impl PackInfo {
    pub fn container(&self, id: &str) -> Option<&ContainerRecord> {
        self.containers.iter().find(|c| c.id.as_deref() == Some(id))
    }

    /// Role containers only, sidecars excluded.
    pub fn role_containers(&self) -> impl Iterator<Item = &ContainerRecord> {
        self.containers.iter().filter(|c| !c.is_system)
    }

    /// Pack IPs no container currently uses.
    pub fn unused_ips(&self) -> Vec<Ipv4Addr> {
        self.ip_list
            .iter()
            .copied()
            .filter(|ip| !self.containers.iter().any(|c| c.ip == Some(*ip)))
            .collect()
    }

    pub fn max_clone_id(&self, pcid: &str) -> Option<u32> {
        self.containers
            .iter()
            .filter(|c| c.pcid == pcid)
            .map(|c| c.clone_id)
            .max()
    }
}

// ── Requests ───────────────────────────────────────────────────────

/// Per-role overrides applied on top of the builder template.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OverrideParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volumes: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shared_resources: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tcp_ports: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub udp_ports: Option<Vec<String>>,
    /// Take this role's image from another bundle.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_from_bundle_id: Option<BundleId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cap_add: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub binds: Option<Vec<String>>,
    /// Inherited from a running container during upgrade.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port_bindings: Option<PortMap>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exposed_ports: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DeployRequest {
    pub bundle_id: BundleId,
    /// Labels the target engine must carry.
    #[serde(default)]
    pub engine_filters: Vec<String>,
    #[serde(default)]
    pub overrides: BTreeMap<String, OverrideParams>,
    /// Role → clones beyond the first one.
    #[serde(default)]
    pub extra_clones: BTreeMap<String, u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load: Option<u32>,
    #[serde(default)]
    pub keep_alive: bool,
    #[serde(flatten)]
    pub options: DeployOptions,
}

impl DeployRequest {
    /// IPs the pack needs: one per clone of its most replicated role.
    pub fn max_clones(&self) -> usize {
        (self.extra_clones.values().copied().max().unwrap_or(0) as usize).saturating_add(1)
    }

    pub fn clone_count(&self, pcid: &str) -> u32 {
        self.extra_clones.get(pcid).copied().unwrap_or(0).saturating_add(1)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ContainerUpgrade {
    pub id: String,
    #[serde(default)]
    pub overrides: OverrideParams,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RoleAddition {
    pub pcid: String,
    pub count: u32,
    #[serde(default)]
    pub overrides: OverrideParams,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct UpgradeRequest {
    pub pack_id: PackId,
    #[serde(default)]
    pub containers_to_upgrade: Vec<ContainerUpgrade>,
    #[serde(default)]
    pub roles_to_add: Vec<RoleAddition>,
    #[serde(default)]
    pub containers_to_delete: Vec<String>,
    #[serde(flatten)]
    pub options: DeployOptions,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RoleBuildInput {
    /// `host[:port]/repo[:tag]`; unused for static roles.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_info: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BuildRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<BundleId>,
    pub builder_id: BuilderId,
    #[serde(default)]
    pub images_info: BTreeMap<String, RoleBuildInput>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clone_counts_saturate() {
        let req = DeployRequest {
            extra_clones: BTreeMap::from([("web".to_string(), u32::MAX), ("db".to_string(), 2)]),
            ..Default::default()
        };
        assert_eq!(req.clone_count("web"), u32::MAX);
        assert_eq!(req.clone_count("db"), 3);
        assert_eq!(req.clone_count("cache"), 1);
        assert_eq!(req.max_clones(), u32::MAX as usize + 1);
    }

    #[test]
    fn engine_labels_always_include_own_id() {
        let engine = EngineInfo {
            id: "e1".into(),
            labels: vec!["gpu".into()],
            ..Default::default()
        };
        let labels = engine.effective_labels();
        assert!(labels.contains("e1"));
        assert!(labels.contains("gpu"));
    }

    #[test]
    fn timer_marks_do_not_count_as_config_change() {
        let a = EngineInfo {
            id: "e1".into(),
            ..Default::default()
        };
        let mut b = a.clone();
        b.last_timer_marks.insert("prune".into(), 42);
        b.meta.last_save = Some(7);
        assert!(a.same_config(&b));

        b.capacity_limit = Some(5);
        assert!(!a.same_config(&b));
    }

    #[test]
    fn full_pool_merges_list_and_range() {
        let net = NetworkInfo {
            gateway: None,
            ip_list: vec![Ipv4Addr::new(10, 0, 0, 9), Ipv4Addr::new(10, 0, 0, 1)],
            ip_range: Some(IpRange {
                start: Ipv4Addr::new(10, 0, 0, 1),
                count: 3,
            }),
        };
        let pool: Vec<_> = net.full_pool().into_iter().collect();
        assert_eq!(
            pool,
            vec![
                Ipv4Addr::new(10, 0, 0, 1),
                Ipv4Addr::new(10, 0, 0, 2),
                Ipv4Addr::new(10, 0, 0, 3),
                Ipv4Addr::new(10, 0, 0, 9),
            ]
        );
    }

    #[test]
    fn max_clones_counts_the_first_instance() {
        let mut req = DeployRequest::default();
        assert_eq!(req.max_clones(), 1);
        req.extra_clones.insert("web".into(), 2);
        req.extra_clones.insert("db".into(), 0);
        assert_eq!(req.max_clones(), 3);
        assert_eq!(req.clone_count("web"), 3);
        assert_eq!(req.clone_count("cache"), 1);
    }

    #[test]
    fn pack_json_keeps_flattened_options_and_meta() {
        let pack = PackInfo {
            id: "1_e1".into(),
            engine_id: "e1".into(),
            options: DeployOptions {
                auto_restart: true,
                ..Default::default()
            },
            meta: ItemMeta {
                last_save: Some(10),
                created_at: Some(5),
            },
            ..Default::default()
        };
        let json = serde_json::to_value(&pack).unwrap();
        assert_eq!(json["auto_restart"], true);
        assert_eq!(json["last_save"], 10);
        let back: PackInfo = serde_json::from_value(json).unwrap();
        assert_eq!(back, pack);
    }

    #[test]
    fn unused_ips_skip_assigned_ones() {
        let pack = PackInfo {
            ip_list: vec![Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2)],
            containers: vec![ContainerRecord {
                pcid: "web".into(),
                ip: Some(Ipv4Addr::new(10, 0, 0, 2)),
                ..Default::default()
            }],
            ..Default::default()
        };
        assert_eq!(pack.unused_ips(), vec![Ipv4Addr::new(10, 0, 0, 1)]);
    }
}
