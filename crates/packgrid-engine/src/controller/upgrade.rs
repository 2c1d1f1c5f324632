//! In-place pack upgrade.
//!
//! ```text
//! snapshot ─► plan (pure, on copies) ──fail──► Err, pack untouched
//!                │ ok
//!                ▼
//!   reserve extra IPs onto the pack (same lock as the plan)
//!                │
//!                ▼
//!   packs queue: sidecars off ─► delete ─► replace upgraded ─► add clones ─► sidecars on
//!                │
//!                ▼ always
//!   release unused IPs, clear upgrade flag (corrupted on failure)
//! ```

use std::collections::BTreeSet;
use std::net::Ipv4Addr;

use serde_json::json;
use tracing::{info, warn};

use packgrid_core::{
    BundleInfo, ContainerRecord, ContainerUpgrade, OverrideParams, PackInfo, RoleAddition,
    RoleTemplate, Severity, UpgradeRequest,
};

use crate::controller::container::NewContainer;
use crate::controller::{EngineController, finish};
use crate::daemon::ContainerDetails;
use crate::error::{EngineError, EngineResult};

/// Grace period for the replaced container to stop.
const UPGRADE_STOP_TIMEOUT_SECS: u64 = 600;

/// Validate an upgrade against a snapshot of the pack and the free-IP
/// count. Returns how many extra IPs the new clones need.
///
/// Works on copies only; nothing live is touched.
pub(crate) fn plan_upgrade(pack: &PackInfo, req: &UpgradeRequest, free_ips: usize) -> EngineResult<usize> {
    let mut pack = pack.clone();

    for id in &req.containers_to_delete {
        if pack.container(id).is_none_or(|c| c.is_system) {
            return Err(EngineError::not_found("container", id));
        }
        pack.containers.retain(|c| c.id.as_deref() != Some(id.as_str()));
    }
    for item in &req.containers_to_upgrade {
        if pack.container(&item.id).is_none_or(|c| c.is_system) {
            return Err(EngineError::not_found("container", &item.id));
        }
    }

    let mut extra = 0;
    for add in &req.roles_to_add {
        let taken: BTreeSet<Ipv4Addr> = pack
            .containers
            .iter()
            .filter(|c| c.pcid == add.pcid)
            .filter_map(|c| c.ip)
            .collect();
        let usable = pack.ip_list.iter().filter(|ip| !taken.contains(ip)).count();
        extra = extra.max((add.count as usize).saturating_sub(usable));
    }
    if extra > free_ips {
        return Err(EngineError::NoFreeIps {
            needed: extra,
            free: free_ips,
        });
    }
    Ok(extra)
}

/// Fill unset overrides from the running container.
fn inherit_from(details: &ContainerDetails, mut overrides: OverrideParams) -> OverrideParams {
    if overrides.cmd.is_none() {
        overrides.cmd = details.cmd.clone();
    }
    if overrides.entrypoint.is_none() {
        overrides.entrypoint = details.entrypoint.clone();
    }
    if overrides.env.is_none() {
        overrides.env = Some(details.env.clone());
    }
    if overrides.cap_add.is_none() {
        overrides.cap_add = Some(details.cap_add.clone());
    }
    if overrides.binds.is_none() {
        let binds: Vec<String> = details.mounts.iter().filter_map(|m| m.as_bind()).collect();
        overrides.binds = Some(if binds.is_empty() {
            details.binds.clone()
        } else {
            binds
        });
    }
    if overrides.port_bindings.is_none() && !details.port_bindings.is_empty() {
        overrides.port_bindings = Some(details.port_bindings.clone());
    }
    if overrides.exposed_ports.is_none() && !details.exposed_ports.is_empty() {
        overrides.exposed_ports = Some(details.exposed_ports.clone());
    }
    overrides
}

impl EngineController {
    /// Upgrade a long-lived pack in place.
    pub async fn upgrade_pack(&self, req: UpgradeRequest) -> EngineResult<PackInfo> {
        if !self.is_ready() {
            return Err(EngineError::NotReady(self.inner.id.clone()));
        }
        let pack_id = req.pack_id.clone();
        let pack = self.pack(&pack_id)?;
        if pack.marked_for_delete {
            return Err(EngineError::Rejected("Already queued for deletion".into()));
        }
        if !pack.keep_alive {
            return Err(EngineError::Rejected("Temporary pack upgrades blocked.".into()));
        }
        if pack.upgrade_in_progress {
            return Err(EngineError::Rejected("Upgrade already queued.".into()));
        }
        // Planned and reserved under one lock so a concurrent deploy cannot
        // take the IPs the new clones need.
        let reserved = {
            let mut rt = self.inner.rt.lock();
            let extra = plan_upgrade(&pack, &req, rt.pool.free_count())?;
            rt.pool.reserve(extra)?
        };
        let extra = reserved.len();

        let _op = self.begin_op();
        let added = reserved.clone();
        let marked = self
            .registry()
            .packs
            .update(&pack_id, move |p| {
                p.upgrade_in_progress = true;
                p.ip_list.extend(added);
            })
            .await;
        if let Err(e) = marked {
            self.inner.rt.lock().pool.release(reserved);
            return Err(e.into());
        }
        info!(
            engine = %self.inner.id,
            pack = %pack_id,
            upgrade = req.containers_to_upgrade.len(),
            delete = req.containers_to_delete.len(),
            add = req.roles_to_add.len(),
            extra_ips = extra,
            "upgrade accepted"
        );

        let this = self.clone();
        let params = json!({ "pack_id": pack_id });
        let handle = self.queues().packs.post("pack_upgrade", params, move || async move {
            this.run_upgrade(&req).await
        });
        let result = finish(handle).await;

        if let Err(e) = &result {
            self.report(Severity::Error, &format!("upgrade of {pack_id} failed"), e);
            if let Err(se) = self.registry().packs.update(&pack_id, |p| p.corrupted = true).await {
                warn!(engine = %self.inner.id, pack = %pack_id, error = %se, "could not mark pack corrupted");
            }
        }
        if let Err(e) = self.release_unused_ips(&pack_id).await {
            warn!(engine = %self.inner.id, pack = %pack_id, error = %e, "could not release unused IPs");
        }
        let (pack, ()) = self
            .registry()
            .packs
            .update(&pack_id, |p| p.upgrade_in_progress = false)
            .await?;
        result.map(|_| pack)
    }

    async fn run_upgrade(&self, req: &UpgradeRequest) -> EngineResult<()> {
        let pack_id = req.pack_id.as_str();
        let options = req.options.clone();
        self.registry()
            .packs
            .update(pack_id, move |p| p.options = options)
            .await?;
        self.remove_system_containers(pack_id).await?;

        for id in &req.containers_to_delete {
            let record = self.role_container(pack_id, id)?;
            self.remove_container_by_name(&record.name).await?;
            self.registry()
                .packs
                .update(pack_id, |p| p.containers.retain(|c| c.name != record.name))
                .await?;
        }

        for item in &req.containers_to_upgrade {
            self.replace_container(pack_id, item).await?;
        }

        for add in &req.roles_to_add {
            self.add_role_clones(pack_id, add).await?;
        }

        self.add_system_containers(pack_id).await?;
        info!(engine = %self.inner.id, pack = %pack_id, "pack upgraded");
        Ok(())
    }

    fn role_container(&self, pack_id: &str, container_id: &str) -> EngineResult<ContainerRecord> {
        self.pack(pack_id)?
            .container(container_id)
            .filter(|c| !c.is_system)
            .cloned()
            .ok_or_else(|| EngineError::not_found("container", container_id))
    }

    fn initial_bundle(&self, pack: &PackInfo) -> EngineResult<BundleInfo> {
        self.registry()
            .bundles
            .get(&pack.initial_bundle_id)
            .ok_or_else(|| EngineError::not_found("bundle", &pack.initial_bundle_id))
    }

    /// Stop, inspect and replace one role container under the same
    /// external IP.
    async fn replace_container(&self, pack_id: &str, item: &ContainerUpgrade) -> EngineResult<()> {
        let pack = self.pack(pack_id)?;
        let old = self.role_container(pack_id, &item.id)?;

        let api = self.api()?;
        let id = item.id.clone();
        let handle = self.queues().containers.post(
            "stop_container",
            json!({ "container": item.id }),
            move || async move {
                Ok::<_, EngineError>(api.stop_container(&id, UPGRADE_STOP_TIMEOUT_SECS).await?)
            },
        );
        finish(handle).await?;
        let details = self.inspect_container(&item.id).await?;
        let overrides = inherit_from(&details, item.overrides.clone());

        let fallback = match old.bundle_id.as_deref() {
            Some(id) => self
                .registry()
                .bundles
                .get(id)
                .ok_or_else(|| EngineError::not_found("bundle", id))?,
            None => self.initial_bundle(&pack)?,
        };
        let (image, bundle_id) = self.role_image(&old.pcid, &overrides, &fallback)?;
        let template = self.role_template(&pack, &old.pcid)?;

        self.create_container(NewContainer {
            pack_id: pack_id.to_string(),
            pcid: old.pcid.clone(),
            clone_id: old.clone_id,
            bundle_id,
            image,
            template,
            overrides,
            force_ip: old.ip,
            replaces: Some(old.name.clone()),
            is_upgrade: true,
        })
        .await?;
        self.remove_container_by_name(&old.name).await?;
        info!(engine = %self.inner.id, pack = %pack_id, container = %old.name, "container replaced");
        Ok(())
    }

    async fn add_role_clones(&self, pack_id: &str, add: &RoleAddition) -> EngineResult<()> {
        let pack = self.pack(pack_id)?;
        let template = self.role_template(&pack, &add.pcid)?;
        let sibling_bundle = pack
            .role_containers()
            .filter(|c| c.pcid == add.pcid)
            .find_map(|c| c.bundle_id.clone())
            .and_then(|id| self.registry().bundles.get(&id));
        let fallback = match sibling_bundle {
            Some(bundle) => bundle,
            None => self.initial_bundle(&pack)?,
        };
        let (image, bundle_id) = self.role_image(&add.pcid, &add.overrides, &fallback)?;

        let first = pack.max_clone_id(&add.pcid).map_or(0, |m| m + 1);
        for clone_id in first..first + add.count {
            self.create_container(NewContainer {
                pack_id: pack_id.to_string(),
                pcid: add.pcid.clone(),
                clone_id,
                bundle_id: bundle_id.clone(),
                image: image.clone(),
                template: template.clone(),
                overrides: add.overrides.clone(),
                force_ip: None,
                replaces: None,
                is_upgrade: false,
            })
            .await?;
        }
        Ok(())
    }

    fn role_template(&self, pack: &PackInfo, pcid: &str) -> EngineResult<RoleTemplate> {
        let builder = self
            .registry()
            .builders
            .get(&pack.builder_id)
            .ok_or_else(|| EngineError::not_found("builder", &pack.builder_id))?;
        builder
            .role(pcid)
            .cloned()
            .ok_or_else(|| EngineError::not_found("role", format!("{}/{pcid}", builder.id)))
    }

    /// Drop pack IPs no container uses and hand them back to the pool.
    async fn release_unused_ips(&self, pack_id: &str) -> EngineResult<Vec<Ipv4Addr>> {
        let (_, released) = self
            .registry()
            .packs
            .update(pack_id, |p| {
                let unused = p.unused_ips();
                p.ip_list.retain(|ip| !unused.contains(ip));
                unused
            })
            .await?;
        if !released.is_empty() {
            self.inner.rt.lock().pool.release(released.iter().copied());
            info!(engine = %self.inner.id, pack = %pack_id, ips = ?released, "unused IPs released");
        }
        Ok(released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::MountPoint;

    fn ip(last: u8) -> Ipv4Addr {
        Ipv4Addr::new(10, 0, 0, last)
    }

    fn record(id: &str, pcid: &str, clone_id: u32, last: u8) -> ContainerRecord {
        ContainerRecord {
            id: Some(id.into()),
            pcid: pcid.into(),
            clone_id,
            ip: Some(ip(last)),
            name: format!("PG_1_{pcid}_{clone_id}_1_e1_1"),
            ..Default::default()
        }
    }

    fn pack() -> PackInfo {
        PackInfo {
            id: "1_e1".into(),
            ip_list: vec![ip(1)],
            keep_alive: true,
            containers: vec![record("aaa", "web", 0, 1), record("bbb", "db", 0, 1)],
            ..Default::default()
        }
    }

    fn add(pcid: &str, count: u32) -> RoleAddition {
        RoleAddition {
            pcid: pcid.into(),
            count,
            overrides: OverrideParams::default(),
        }
    }

    #[test]
    fn new_clones_beyond_free_ips_fail_the_plan() {
        let before = pack();
        let req = UpgradeRequest {
            pack_id: before.id.clone(),
            roles_to_add: vec![add("web", 2)],
            ..Default::default()
        };
        let err = plan_upgrade(&before, &req, 1).unwrap_err();
        assert!(matches!(err, EngineError::NoFreeIps { needed: 2, free: 1 }));
        assert_eq!(before, pack());
    }

    #[test]
    fn deleted_containers_free_their_ip_for_the_same_role() {
        let req = UpgradeRequest {
            pack_id: "1_e1".into(),
            containers_to_delete: vec!["aaa".into()],
            roles_to_add: vec![add("web", 1)],
            ..Default::default()
        };
        assert_eq!(plan_upgrade(&pack(), &req, 0).unwrap(), 0);
    }

    #[test]
    fn extra_ips_are_shared_across_roles() {
        let req = UpgradeRequest {
            pack_id: "1_e1".into(),
            roles_to_add: vec![add("web", 2), add("db", 1)],
            ..Default::default()
        };
        assert_eq!(plan_upgrade(&pack(), &req, 5).unwrap(), 2);
    }

    #[test]
    fn unknown_containers_fail_the_plan() {
        let req = UpgradeRequest {
            pack_id: "1_e1".into(),
            containers_to_upgrade: vec![ContainerUpgrade {
                id: "zzz".into(),
                overrides: OverrideParams::default(),
            }],
            ..Default::default()
        };
        assert!(matches!(
            plan_upgrade(&pack(), &req, 5),
            Err(EngineError::NotFound { kind: "container", .. })
        ));
    }

    #[test]
    fn overrides_win_over_the_running_container() {
        let details = ContainerDetails {
            cmd: Some(vec!["/app/old".into()]),
            env: vec!["A=1".into()],
            binds: vec!["/ignored:/x".into()],
            mounts: vec![
                MountPoint {
                    kind: "bind".into(),
                    source: "/srv/data".into(),
                    destination: "/data".into(),
                    rw: false,
                    propagation: String::new(),
                },
                MountPoint {
                    kind: "volume".into(),
                    source: "abc".into(),
                    destination: "/cache".into(),
                    rw: true,
                    propagation: String::new(),
                },
            ],
            ..Default::default()
        };
        let given = OverrideParams {
            env: Some(vec!["B=2".into()]),
            ..Default::default()
        };
        let merged = inherit_from(&details, given);
        assert_eq!(merged.cmd, Some(vec!["/app/old".to_string()]));
        assert_eq!(merged.env, Some(vec!["B=2".to_string()]));
        assert_eq!(merged.binds, Some(vec!["/srv/data:/data:ro".to_string()]));
        assert_eq!(merged.port_bindings, None);
    }
}
