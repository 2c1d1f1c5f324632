//! Container creation and the single-container operations.
//!
//! ```text
//! shared resources ─► record persisted ─► (pull) ─► create ─► id persisted ─► start
//!                                              ▲        │
//!                                              └────────┘ "no such image": pull, retry once
//! ```

use std::net::Ipv4Addr;
use std::time::Duration;

use serde_json::json;
use tracing::{debug, info, warn};

use packgrid_core::{
    ContainerRecord, ContainerSpec, OverrideParams, RESOURCES_REGISTRY_ID, RestartPolicy, RoleImage,
    RoleTemplate, epoch_millis,
};

use crate::constants::{SHARED_RESOURCE_PREFIX, SUPPORT_IMAGE};
use crate::controller::{EngineController, finish};
use crate::daemon::{
    ContainerAction, ContainerDetails, ContainerSummary, LogsOptions, OneShot, OneShotOutput,
};
use crate::error::{DaemonError, EngineError, EngineResult};
use crate::container_spec::{self, SpecInput, SpecVars};

const START_ATTEMPTS: u32 = 5;
const START_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Everything needed to add one role container to a pack.
#[derive(Debug, Clone)]
pub(crate) struct NewContainer {
    pub pack_id: String,
    pub pcid: String,
    pub clone_id: u32,
    pub bundle_id: String,
    pub image: RoleImage,
    pub template: RoleTemplate,
    pub overrides: OverrideParams,
    /// Keep this external IP instead of picking one.
    pub force_ip: Option<Ipv4Addr>,
    /// Name of the record this container replaces in the same save.
    pub replaces: Option<String>,
    pub is_upgrade: bool,
}

impl EngineController {
    /// Persist, create and start one role container.
    pub(crate) async fn create_container(&self, req: NewContainer) -> EngineResult<ContainerRecord> {
        let shared = req
            .overrides
            .shared_resources
            .clone()
            .unwrap_or_else(|| req.template.shared_resources.clone());
        let mut volumes_from = Vec::with_capacity(shared.len());
        for resource in &shared {
            volumes_from.push(self.ensure_shared_resource(resource).await?);
        }

        let image = self
            .registry()
            .image_name(
                &req.image.registry_id,
                &format!("{}:{}", req.image.repo_name, req.image.image_tag),
            )
            .ok_or_else(|| EngineError::not_found("registry", &req.image.registry_id))?;
        let gateway = self
            .gateway()
            .ok_or_else(|| EngineError::NotReady(self.inner.id.clone()))?;
        let role_build_info = self
            .registry()
            .bundles
            .get(&req.bundle_id)
            .and_then(|b| b.build_info.get(&req.pcid).cloned());
        let now = epoch_millis();
        let name = container_spec::container_name(
            self.next_container_idx(),
            &req.pcid,
            req.clone_id,
            &req.pack_id,
            now,
        );

        let (_, built) = self
            .registry()
            .packs
            .update(&req.pack_id, |p| -> EngineResult<ContainerRecord> {
                let ip = match req.force_ip {
                    Some(ip) => ip,
                    None => container_spec::pick_external_ip(p, &req.pcid)?,
                };
                let internal_ip = container_spec::next_internal_ip(gateway, ip, p)?;
                let mut spec = container_spec::resolve(SpecInput {
                    template: &req.template,
                    overrides: &req.overrides,
                    image: image.clone(),
                    pcid: &req.pcid,
                    clone_id: req.clone_id,
                    pack_id: &req.pack_id,
                    vars: SpecVars {
                        container_ip: ip,
                        main_ip: p.ip_list.first().copied().unwrap_or(ip),
                    },
                    internal_ip,
                    restart: if p.options.auto_restart {
                        RestartPolicy::UnlessStopped
                    } else {
                        RestartPolicy::No
                    },
                    bind_host_tz: p.options.bind_host_tz,
                    is_upgrade: req.is_upgrade,
                })?;
                spec.host_config.volumes_from = volumes_from.clone();

                if let Some(old) = &req.replaces {
                    p.containers.retain(|c| &c.name != old);
                }
                if p.containers
                    .iter()
                    .any(|c| c.pcid == req.pcid && c.clone_id == req.clone_id)
                {
                    return Err(EngineError::Rejected(format!(
                        "pack {} already has {} clone {}",
                        p.id, req.pcid, req.clone_id
                    )));
                }
                let record = ContainerRecord {
                    pcid: req.pcid.clone(),
                    clone_id: req.clone_id,
                    is_system: false,
                    id: None,
                    name: name.clone(),
                    bundle_id: Some(req.bundle_id.clone()),
                    ip: Some(ip),
                    internal_ip: Some(internal_ip),
                    created_at: now,
                    spec: Some(spec),
                    app_bin_path: req.template.app_bin_path.clone(),
                    ..Default::default()
                };
                let clone_key = format!("{}_{}", req.pcid, req.clone_id);
                match role_build_info.clone() {
                    Some(info) => p.build_info.insert(clone_key, info),
                    None => p.build_info.remove(&clone_key),
                };
                p.containers.push(record.clone());
                Ok(record)
            })
            .await?;
        let record = built?;
        let spec = record.spec.clone().unwrap_or_default();

        if spec.image.ends_with(":latest") {
            self.pull_image(&spec.image).await?;
        }
        let id = self.create_with_fallback(&name, spec).await?;
        let (_, ()) = self
            .registry()
            .packs
            .update(&req.pack_id, |p| {
                if let Some(c) = p.containers.iter_mut().find(|c| c.name == name) {
                    c.id = Some(id.clone());
                }
            })
            .await?;
        self.start_and_wait(&id).await?;

        info!(
            engine = %self.inner.id,
            pack = %req.pack_id,
            pcid = %req.pcid,
            clone = req.clone_id,
            container = %name,
            ip = ?record.ip,
            "container started"
        );
        Ok(ContainerRecord {
            id: Some(id),
            ..record
        })
    }

    /// Create, pulling and retrying once when the daemon lacks the image.
    pub(crate) async fn create_with_fallback(
        &self,
        name: &str,
        spec: ContainerSpec,
    ) -> EngineResult<String> {
        match self.daemon_create(name, spec.clone()).await {
            Err(e) if e.is_daemon_not_found() => {
                debug!(engine = %self.inner.id, image = %spec.image, "image missing, pulling");
                self.pull_image(&spec.image).await?;
                self.daemon_create(name, spec).await
            }
            other => other,
        }
    }

    pub(super) async fn daemon_create(&self, name: &str, spec: ContainerSpec) -> EngineResult<String> {
        let api = self.api()?;
        let name = name.to_string();
        let handle = self.queues().containers.post(
            "create_container",
            json!({ "name": name, "image": spec.image }),
            move || async move { Ok::<_, EngineError>(api.create_container(&name, &spec).await?) },
        );
        finish(handle).await
    }

    pub(super) async fn start_and_wait(&self, id: &str) -> EngineResult<()> {
        let api = self.api()?;
        for attempt in 1..=START_ATTEMPTS {
            api.start_container(id).await?;
            let details = api.inspect_container(id).await?;
            if details.running {
                return Ok(());
            }
            debug!(engine = %self.inner.id, container = %id, attempt, "container not running yet");
            tokio::time::sleep(START_RETRY_DELAY).await;
        }
        Err(EngineError::StartFailed(id.to_string()))
    }

    // ── Images ─────────────────────────────────────────────────────

    /// Pull an image. Concurrent requests for the same image share one pull.
    pub async fn pull_image(&self, image: &str) -> EngineResult<()> {
        let api = self.api()?;
        let owned = image.to_string();
        let key = owned.clone();
        let handle = self.queues().images.post_unique(
            "pull_image",
            json!({ "image": image }),
            move |t| t.kind == "pull_image" && t.params["image"].as_str() == Some(key.as_str()),
            move || async move {
                info!(image = %owned, "pulling image");
                Ok::<_, EngineError>(api.pull_image(&owned).await?)
            },
        );
        finish(handle).await
    }

    // ── Listing & removal ──────────────────────────────────────────

    pub async fn list_containers(&self) -> EngineResult<Vec<ContainerSummary>> {
        let api = self.api()?;
        let handle = self.queues().other.post_unique(
            "list_containers",
            json!({}),
            |t| t.kind == "list_containers",
            move || async move { Ok::<_, EngineError>(api.list_containers().await?) },
        );
        finish(handle).await
    }

    /// Force-remove a container; one that is already gone counts as removed.
    pub async fn remove_container_by_name(&self, name: &str) -> EngineResult<()> {
        let api = self.api()?;
        let owned = name.to_string();
        let handle = self.queues().containers.post(
            "remove_container",
            json!({ "name": name }),
            move || async move {
                match api.remove_container(&owned).await {
                    Ok(()) => Ok(()),
                    Err(e) if e.is_not_found() => {
                        debug!(container = %owned, "container already gone");
                        Ok(())
                    }
                    Err(e) => Err(EngineError::from(e)),
                }
            },
        );
        finish(handle).await
    }

    // ── Shared resources ───────────────────────────────────────────

    /// Make sure the data container of a shared resource exists and return
    /// its name.
    pub async fn ensure_shared_resource(&self, resource_id: &str) -> EngineResult<String> {
        let name = format!("{SHARED_RESOURCE_PREFIX}{resource_id}");
        if self.inner.shared_checked.lock().contains(&name) {
            return Ok(name);
        }

        let info = self
            .registry()
            .shared_data
            .get(resource_id)
            .ok_or_else(|| EngineError::not_found("shared data", resource_id))?;
        let listed = self.list_containers().await?;
        if !listed.iter().any(|c| c.has_name(&name)) {
            let image = self
                .registry()
                .image_name(&info.registry_id, &info.image)
                .ok_or_else(|| EngineError::not_found("registry", &info.registry_id))?;
            self.pull_image(&image).await?;
            let spec = ContainerSpec {
                image,
                volumes: vec![info.data_path.clone()],
                ..Default::default()
            };
            match self.daemon_create(&name, spec).await {
                Ok(id) => self.api()?.start_container(&id).await?,
                Err(EngineError::Daemon(DaemonError::Conflict(_))) => {
                    debug!(engine = %self.inner.id, resource = %name, "shared resource created concurrently");
                }
                Err(e) => return Err(e),
            }
            info!(engine = %self.inner.id, resource = %name, "shared resource created");
        }
        self.inner.shared_checked.lock().insert(name.clone());
        Ok(name)
    }

    /// Remove every shared-resource container and prune their volumes.
    pub async fn clear_shared_resources(&self) -> EngineResult<usize> {
        let listed = self.list_containers().await?;
        let mut removed = 0;
        for c in listed
            .iter()
            .filter(|c| c.name().starts_with(SHARED_RESOURCE_PREFIX))
        {
            self.remove_container_by_name(c.name()).await?;
            removed += 1;
        }
        self.inner.shared_checked.lock().clear();
        self.api()?.prune_volumes().await?;
        info!(engine = %self.inner.id, removed, "shared resources cleared");
        Ok(removed)
    }

    // ── Operator actions ───────────────────────────────────────────

    /// Container ids must belong to one of this engine's packs.
    fn owned_container(&self, container_id: &str) -> EngineResult<(String, ContainerRecord)> {
        self.registry()
            .engine_packs(&self.inner.id)
            .into_iter()
            .find_map(|p| p.container(container_id).cloned().map(|c| (p.id.clone(), c)))
            .ok_or_else(|| EngineError::not_found("container", container_id))
    }

    pub async fn change_container_state(
        &self,
        container_id: &str,
        action: ContainerAction,
        refresh: bool,
    ) -> EngineResult<()> {
        let (pack_id, record) = self.owned_container(container_id)?;
        let api = self.api()?;
        let id = container_id.to_string();
        let params = json!({ "container": container_id, "action": action });
        let handle = self.queues().containers.post("container_action", params, move || async move {
            let result = match action {
                ContainerAction::Start => api.start_container(&id).await,
                ContainerAction::Stop { timeout_secs } => api.stop_container(&id, timeout_secs).await,
                ContainerAction::Restart { timeout_secs } => {
                    api.restart_container(&id, timeout_secs).await
                }
                ContainerAction::Pause => api.pause_container(&id).await,
                ContainerAction::Unpause => api.unpause_container(&id).await,
                ContainerAction::Kill { signal } => api.kill_container(&id, &signal).await,
            };
            result.map_err(EngineError::from)
        });
        finish(handle).await?;
        info!(engine = %self.inner.id, pack = %pack_id, container = %record.name, "container action applied");

        if refresh {
            self.update_containers_state().await?;
        }
        Ok(())
    }

    pub async fn container_logs(
        &self,
        container_id: &str,
        opts: LogsOptions,
    ) -> EngineResult<String> {
        self.owned_container(container_id)?;
        let api = self.api()?;
        let id = container_id.to_string();
        let handle = self.queues().container_data.post(
            "container_logs",
            json!({ "container": container_id }),
            move || async move { Ok::<_, EngineError>(api.logs(&id, &opts).await?) },
        );
        finish(handle).await
    }

    pub async fn inspect_container(&self, container_id: &str) -> EngineResult<ContainerDetails> {
        let api = self.api()?;
        let id = container_id.to_string();
        let handle = self.queues().container_data.post(
            "inspect_container",
            json!({ "container": container_id }),
            move || async move { Ok::<_, EngineError>(api.inspect_container(&id).await?) },
        );
        finish(handle).await
    }

    /// Run a command in a container, bounded by the exec timeout.
    pub async fn exec_in_container(
        &self,
        container_id: &str,
        cmd: Vec<String>,
    ) -> EngineResult<String> {
        let api = self.api()?;
        let id = container_id.to_string();
        let timeout = Duration::from_secs(self.settings().exec_timeout_secs);
        let params = json!({ "container": container_id, "cmd": cmd });
        let handle = self.queues().container_data.post("exec", params, move || async move {
            match tokio::time::timeout(timeout, api.exec(&id, &cmd, "/")).await {
                Ok(result) => result.map_err(EngineError::from),
                Err(_) => Err(EngineError::Timeout(format!("exec in {id}: {}", cmd.join(" ")))),
            }
        });
        finish(handle).await
    }

    /// Run a throwaway helper container on the engine host.
    pub async fn exec_engine_host(
        &self,
        cmd: Vec<String>,
        binds: Vec<String>,
        privileged: bool,
    ) -> EngineResult<OneShotOutput> {
        let image = self
            .registry()
            .image_name(RESOURCES_REGISTRY_ID, SUPPORT_IMAGE)
            .ok_or_else(|| EngineError::not_found("registry", RESOURCES_REGISTRY_ID))?;
        self.pull_image(&image).await?;

        let api = self.api()?;
        let job = OneShot {
            image,
            cmd,
            binds,
            privileged,
        };
        let params = json!({ "image": job.image, "cmd": job.cmd });
        let handle = self.queues().other.post("exec_engine_host", params, move || async move {
            let output = api.run_oneshot(&job).await?;
            if output.exit_code != 0 {
                warn!(image = %job.image, exit_code = output.exit_code, output = %output.output, "host command failed");
            }
            Ok::<_, EngineError>(output)
        });
        finish(handle).await
    }
}
