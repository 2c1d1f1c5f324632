//! System sidecars attached to every pack.
//!
//! `support` shares every role's volumes and remapped binds so operators
//! can reach role files and the dump directory from one place. `capture`
//! sniffs the pack's internal addresses from the host network.

use tracing::info;

use packgrid_core::{
    ContainerRecord, ContainerSpec, HostConfig, PackInfo, RESOURCES_REGISTRY_ID, RestartPolicy,
    epoch_millis,
};

use crate::constants::{
    CAPTURE_IMAGE, CAPTURE_PCID, DUMPS_ROOT, SIDECAR_DUMPS_ROOT, SUPPORT_IMAGE, SUPPORT_PCID,
};
use crate::controller::EngineController;
use crate::error::{EngineError, EngineResult};
use crate::container_spec;

/// Support sidecar spec for the current role containers of `pack`.
pub(crate) fn support_spec(pack: &PackInfo, image: String) -> EngineResult<ContainerSpec> {
    let mut binds = vec![format!("{DUMPS_ROOT}:{SIDECAR_DUMPS_ROOT}")];
    let mut volumes_from = Vec::new();
    for c in pack.role_containers() {
        volumes_from.push(c.name.clone());
        let role_binds = c
            .spec
            .as_ref()
            .map(|s| s.host_config.binds.as_slice())
            .unwrap_or_default();
        binds.extend(
            role_binds
                .iter()
                .filter_map(|b| container_spec::remap_bind(b, &c.pcid, c.clone_id)),
        );
    }
    Ok(ContainerSpec {
        image,
        hostname: Some(container_spec::hostname(SUPPORT_PCID, 0, &pack.id)),
        cmd: Some(vec!["/bin/sh".into()]),
        tty: true,
        stop_signal: Some("SIGKILL".into()),
        host_config: HostConfig {
            binds: container_spec::dedup_binds(&binds)?,
            volumes_from,
            restart_policy: RestartPolicy::UnlessStopped,
            log_config: Some(container_spec::log_config()),
            ..Default::default()
        },
        ..Default::default()
    })
}

/// Capture sidecar spec watching every internal address of `pack`.
pub(crate) fn capture_spec(pack: &PackInfo, image: String, gateway: std::net::Ipv4Addr) -> ContainerSpec {
    let targets: Vec<String> = pack
        .role_containers()
        .filter_map(|c| c.internal_ip)
        .map(|ip| ip.to_string())
        .collect();
    ContainerSpec {
        image,
        env: vec![
            format!("targets={}", targets.join(" or ")),
            format!("gateway={gateway}"),
        ],
        volumes: vec!["/snifferOutput".into()],
        stop_signal: Some("SIGINT".into()),
        host_config: HostConfig {
            cap_add: vec!["NET_ADMIN".into()],
            network_mode: Some("host".into()),
            restart_policy: RestartPolicy::UnlessStopped,
            log_config: Some(container_spec::log_config()),
            ..Default::default()
        },
        ..Default::default()
    }
}

impl EngineController {
    /// Attach the support sidecar and, when the pack asks for it, capture.
    pub(crate) async fn add_system_containers(&self, pack_id: &str) -> EngineResult<()> {
        let pack = self.pack(pack_id)?;
        let image = self.resource_image(SUPPORT_IMAGE)?;
        self.add_system_container(pack_id, SUPPORT_PCID, support_spec(&pack, image)?)
            .await?;

        if pack.options.add_capture {
            let gateway = self
                .gateway()
                .ok_or_else(|| EngineError::NotReady(self.inner.id.clone()))?;
            let image = self.resource_image(CAPTURE_IMAGE)?;
            self.add_system_container(pack_id, CAPTURE_PCID, capture_spec(&pack, image, gateway))
                .await?;
        }
        Ok(())
    }

    async fn add_system_container(
        &self,
        pack_id: &str,
        pcid: &str,
        spec: ContainerSpec,
    ) -> EngineResult<ContainerRecord> {
        let now = epoch_millis();
        let name = container_spec::container_name(self.next_container_idx(), pcid, 0, pack_id, now);
        let record = ContainerRecord {
            pcid: pcid.to_string(),
            clone_id: 0,
            is_system: true,
            name: name.clone(),
            created_at: now,
            spec: Some(spec.clone()),
            ..Default::default()
        };
        let stored = record.clone();
        self.registry()
            .packs
            .update(pack_id, move |p| {
                p.containers.retain(|c| !(c.is_system && c.pcid == stored.pcid));
                p.containers.push(stored);
            })
            .await?;

        if spec.image.ends_with(":latest") {
            self.pull_image(&spec.image).await?;
        }
        let id = self.create_with_fallback(&name, spec).await?;
        let stored_id = id.clone();
        let key = name.clone();
        self.registry()
            .packs
            .update(pack_id, move |p| {
                if let Some(c) = p.containers.iter_mut().find(|c| c.name == key) {
                    c.id = Some(stored_id);
                }
            })
            .await?;
        self.start_and_wait(&id).await?;
        info!(engine = %self.inner.id, pack = %pack_id, %pcid, container = %name, "sidecar started");
        Ok(ContainerRecord {
            id: Some(id),
            ..record
        })
    }

    /// Remove both sidecars from the daemon and the pack record.
    pub(crate) async fn remove_system_containers(&self, pack_id: &str) -> EngineResult<()> {
        let pack = self.pack(pack_id)?;
        for c in pack.containers.iter().filter(|c| c.is_system) {
            self.remove_container_by_name(&c.name).await?;
        }
        self.registry()
            .packs
            .update(pack_id, |p| p.containers.retain(|c| !c.is_system))
            .await?;
        Ok(())
    }

    fn resource_image(&self, image: &str) -> EngineResult<String> {
        self.registry()
            .image_name(RESOURCES_REGISTRY_ID, image)
            .ok_or_else(|| EngineError::not_found("registry", RESOURCES_REGISTRY_ID))
    }

    pub(crate) fn pack(&self, pack_id: &str) -> EngineResult<PackInfo> {
        self.registry()
            .packs
            .get(pack_id)
            .filter(|p| p.engine_id == self.inner.id)
            .ok_or_else(|| EngineError::not_found("pack", pack_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn role(pcid: &str, clone_id: u32, binds: &[&str], internal: u8) -> ContainerRecord {
        ContainerRecord {
            pcid: pcid.into(),
            clone_id,
            name: format!("PG_{internal}_{pcid}_{clone_id}_1_e1_5"),
            internal_ip: Some(Ipv4Addr::new(172, 20, 5, internal)),
            spec: Some(ContainerSpec {
                host_config: HostConfig {
                    binds: binds.iter().map(|b| b.to_string()).collect(),
                    ..Default::default()
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn pack() -> PackInfo {
        PackInfo {
            id: "1_e1".into(),
            containers: vec![
                role("web", 0, &["/srv/web:/var/www:ro"], 1),
                role("web", 1, &["/srv/web:/var/www:ro"], 2),
                ContainerRecord {
                    pcid: SUPPORT_PCID.into(),
                    is_system: true,
                    name: "PG_9_support_0_1_e1_5".into(),
                    ..Default::default()
                },
            ],
            ..Default::default()
        }
    }

    #[test]
    fn support_shares_role_volumes_and_binds() {
        let spec = support_spec(&pack(), "alpine".into()).unwrap();
        let hc = &spec.host_config;
        assert_eq!(hc.volumes_from, vec!["PG_1_web_0_1_e1_5", "PG_2_web_1_1_e1_5"]);
        assert_eq!(
            hc.binds,
            vec![
                format!("{DUMPS_ROOT}:{SIDECAR_DUMPS_ROOT}"),
                "/srv/web:/PG/web_0/var/www:ro".to_string(),
                "/srv/web:/PG/web_1/var/www:ro".to_string(),
            ]
        );
        assert_eq!(hc.restart_policy, RestartPolicy::UnlessStopped);
        assert_eq!(spec.stop_signal.as_deref(), Some("SIGKILL"));
        assert!(spec.tty);
    }

    #[test]
    fn capture_targets_internal_addresses() {
        let spec = capture_spec(&pack(), "sniffer:latest".into(), Ipv4Addr::new(172, 20, 0, 1));
        assert_eq!(spec.env[0], "targets=172.20.5.1 or 172.20.5.2");
        assert_eq!(spec.env[1], "gateway=172.20.0.1");
        assert_eq!(spec.host_config.network_mode.as_deref(), Some("host"));
        assert_eq!(spec.host_config.cap_add, vec!["NET_ADMIN"]);
    }
}
