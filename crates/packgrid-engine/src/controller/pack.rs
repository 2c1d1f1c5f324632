//! Pack deploy, removal and ping.
//!
//! ```text
//! add_pack ──sync──► reserve IPs + capacity ──► PackTicket
//!                         │
//!                         ▼ (spawned)
//!                 save record ─► packs queue: roles ─► sidecars ─► done
//!                                     │ error
//!                                     ▼
//!                                remove_pack (compensation)
//! ```
//!
//! Reservation happens before the first await, so a scheduler matching
//! right after `add_pack` returns already sees the reduced pool.

use std::net::Ipv4Addr;

use serde_json::json;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use packgrid_core::{BundleInfo, DeployRequest, OverrideParams, PackInfo, RoleImage, Severity, epoch_millis};
use packgrid_queue::TaskInfo;

use crate::controller::container::NewContainer;
use crate::controller::{EngineController, finish};
use crate::error::{EngineError, EngineResult};

const DELETE_QUEUED: &str = "Already queued for deletion";

/// Completion of an accepted deploy.
#[derive(Debug)]
pub struct PackTicket {
    pack_id: String,
    rx: oneshot::Receiver<EngineResult<PackInfo>>,
}

impl PackTicket {
    pub fn pack_id(&self) -> &str {
        &self.pack_id
    }

    /// Resolves with the finished pack, or the error that made the deploy
    /// roll back.
    pub async fn wait(self) -> EngineResult<PackInfo> {
        self.rx
            .await
            .unwrap_or_else(|_| Err(EngineError::Rejected(format!("deploy of {} abandoned", self.pack_id))))
    }
}

fn is_remove_of(pack_id: &str) -> impl Fn(&TaskInfo) -> bool + Send + 'static {
    let pack_id = pack_id.to_string();
    move |t| t.kind == "pack_remove" && t.params["pack_id"].as_str() == Some(pack_id.as_str())
}

impl EngineController {
    /// Packs this engine owns.
    pub fn packs(&self) -> Vec<PackInfo> {
        self.registry().engine_packs(&self.inner.id)
    }

    /// Accept a deploy: reserve IPs and capacity now, build in the
    /// background.
    pub fn add_pack(&self, request: DeployRequest) -> EngineResult<PackTicket> {
        if !self.is_ready() {
            return Err(EngineError::NotReady(self.inner.id.clone()));
        }
        let bundle = self
            .registry()
            .bundles
            .get(&request.bundle_id)
            .ok_or_else(|| EngineError::not_found("bundle", &request.bundle_id))?;
        if bundle.corrupted {
            return Err(EngineError::Rejected(format!("bundle {} is not built", bundle.id)));
        }
        if !self.registry().builders.contains(&bundle.builder_id) {
            return Err(EngineError::not_found("builder", &bundle.builder_id));
        }

        let load = request.load.unwrap_or(0);
        let limit = self.capacity_limit();
        let (ips, idx) = {
            let mut rt = self.inner.rt.lock();
            if load > 0 && rt.capacity_used.saturating_add(load) > limit {
                return Err(EngineError::Rejected(format!(
                    "engine {} capacity exceeded: {} + {load} > {limit}",
                    self.inner.id, rt.capacity_used
                )));
            }
            let ips = rt.pool.reserve(request.max_clones())?;
            rt.capacity_used += load;
            rt.last_pack_idx += 1;
            (ips, rt.last_pack_idx)
        };
        let guard = self.begin_op();

        let pack = PackInfo {
            id: format!("{idx}_{}", self.inner.id),
            engine_id: self.inner.id.clone(),
            builder_id: bundle.builder_id.clone(),
            initial_bundle_id: bundle.id.clone(),
            ip_list: ips,
            load,
            keep_alive: request.keep_alive,
            last_ping: epoch_millis(),
            deploy_in_progress: true,
            options: request.options.clone(),
            ..Default::default()
        };
        info!(
            engine = %self.inner.id,
            pack = %pack.id,
            bundle = %bundle.id,
            ips = ?pack.ip_list,
            load,
            "deploy accepted"
        );

        let (tx, rx) = oneshot::channel();
        let pack_id = pack.id.clone();
        let this = self.clone();
        tokio::spawn(async move {
            let _op = guard;
            let result = this.run_deploy(pack, request).await;
            let _ = tx.send(result);
        });
        Ok(PackTicket { pack_id, rx })
    }

    async fn run_deploy(&self, pack: PackInfo, request: DeployRequest) -> EngineResult<PackInfo> {
        let pack_id = pack.id.clone();
        let ips = pack.ip_list.clone();
        if let Err(e) = self.registry().packs.save(pack).await {
            self.release_reservation(&ips, request.load.unwrap_or(0));
            return Err(e.into());
        }

        let this = self.clone();
        let id = pack_id.clone();
        let params = json!({ "pack_id": pack_id, "bundle_id": request.bundle_id });
        let handle = self.queues().packs.post("bundle_deploy", params, move || async move {
            this.create_pack_containers(&id, &request).await
        });
        match finish(handle).await {
            Ok(pack) => Ok(pack),
            Err(e) => {
                self.report(Severity::Error, &format!("deploy of {pack_id} failed"), &e);
                if let Err(re) = self.remove_pack(&pack_id).await {
                    warn!(engine = %self.inner.id, pack = %pack_id, error = %re, "rollback failed");
                }
                Err(e)
            }
        }
    }

    fn release_reservation(&self, ips: &[Ipv4Addr], load: u32) {
        let mut rt = self.inner.rt.lock();
        rt.pool.release(ips.iter().copied());
        rt.capacity_used = rt.capacity_used.saturating_sub(load);
    }

    async fn create_pack_containers(
        &self,
        pack_id: &str,
        request: &DeployRequest,
    ) -> EngineResult<PackInfo> {
        let bundle = self
            .registry()
            .bundles
            .get(&request.bundle_id)
            .ok_or_else(|| EngineError::not_found("bundle", &request.bundle_id))?;
        let builder = self
            .registry()
            .builders
            .get(&bundle.builder_id)
            .ok_or_else(|| EngineError::not_found("builder", &bundle.builder_id))?;

        for role in &bundle.images_to_deploy {
            let overrides = request.overrides.get(&role.pcid).cloned().unwrap_or_default();
            let template = builder
                .role(&role.pcid)
                .cloned()
                .ok_or_else(|| EngineError::not_found("role", format!("{}/{}", builder.id, role.pcid)))?;
            let (image, bundle_id) = self.role_image(&role.pcid, &overrides, &bundle)?;
            for clone_id in 0..request.clone_count(&role.pcid) {
                self.create_container(NewContainer {
                    pack_id: pack_id.to_string(),
                    pcid: role.pcid.clone(),
                    clone_id,
                    bundle_id: bundle_id.clone(),
                    image: image.clone(),
                    template: template.clone(),
                    overrides: overrides.clone(),
                    force_ip: None,
                    replaces: None,
                    is_upgrade: false,
                })
                .await?;
            }
        }
        self.add_system_containers(pack_id).await?;

        let (pack, ()) = self
            .registry()
            .packs
            .update(pack_id, |p| p.deploy_in_progress = false)
            .await?;
        info!(
            engine = %self.inner.id,
            pack = %pack_id,
            containers = pack.containers.len(),
            "pack deployed"
        );
        Ok(pack)
    }

    /// Image of a role, from the override bundle when one is named.
    pub(crate) fn role_image(
        &self,
        pcid: &str,
        overrides: &OverrideParams,
        fallback: &BundleInfo,
    ) -> EngineResult<(RoleImage, String)> {
        let bundle = match &overrides.image_from_bundle_id {
            Some(id) => self
                .registry()
                .bundles
                .get(id)
                .ok_or_else(|| EngineError::not_found("bundle", id))?,
            None => fallback.clone(),
        };
        let image = bundle
            .role(pcid)
            .cloned()
            .ok_or_else(|| EngineError::not_found("role", format!("{}/{pcid}", bundle.id)))?;
        Ok((image, bundle.id))
    }

    // ── Removal ────────────────────────────────────────────────────

    /// Remove a pack with all its containers. A second request for a pack
    /// whose removal is queued or running is rejected.
    pub async fn remove_pack(&self, pack_id: &str) -> EngineResult<()> {
        let queue = &self.queues().packs;
        if queue.find_in_progress::<()>(is_remove_of(pack_id)).is_some() {
            return Err(EngineError::Rejected(DELETE_QUEUED.into()));
        }
        self.pack(pack_id)?;
        self.registry()
            .packs
            .update(pack_id, |p| p.marked_for_delete = true)
            .await?;

        let _op = self.begin_op();
        let this = self.clone();
        let id = pack_id.to_string();
        let handle = queue
            .try_post(
                "pack_remove",
                json!({ "pack_id": pack_id }),
                is_remove_of(pack_id),
                move || async move { this.do_remove_pack(&id).await },
            )
            .ok_or_else(|| EngineError::Rejected(DELETE_QUEUED.into()))?;

        match finish(handle).await {
            Ok(()) => Ok(()),
            Err(e) => {
                if let Err(se) = self
                    .registry()
                    .packs
                    .update(pack_id, |p| {
                        p.corrupted = true;
                        p.marked_for_delete = false;
                    })
                    .await
                {
                    warn!(engine = %self.inner.id, pack = %pack_id, error = %se, "could not mark pack corrupted");
                }
                self.report(Severity::Error, &format!("removal of {pack_id} failed"), &e);
                Err(e)
            }
        }
    }

    async fn do_remove_pack(&self, pack_id: &str) -> EngineResult<()> {
        let pack = self.pack(pack_id)?;
        for c in &pack.containers {
            self.remove_container_by_name(&c.name).await?;
        }

        // Released before the delete event fires, so listeners that react
        // to the removal already see the freed IPs.
        self.release_reservation(&pack.ip_list, pack.load);
        if let Err(e) = self.registry().packs.delete(pack_id).await {
            let mut rt = self.inner.rt.lock();
            rt.pool.claim(&pack.ip_list);
            rt.capacity_used += pack.load;
            return Err(e.into());
        }
        self.schedule_volume_prune();
        info!(
            engine = %self.inner.id,
            pack = %pack_id,
            released_ips = pack.ip_list.len(),
            free_ips = self.free_ip_count(),
            "pack removed"
        );
        Ok(())
    }

    fn schedule_volume_prune(&self) {
        let Ok(api) = self.api() else {
            return;
        };
        let handle = self.queues().prune.post_unique(
            "prune_volumes",
            json!({}),
            |t| t.kind == "prune_volumes",
            move || async move { Ok::<_, EngineError>(api.prune_volumes().await?) },
        );
        let engine = self.inner.id.clone();
        tokio::spawn(async move {
            match handle.wait().await {
                Ok(()) => debug!(%engine, "volumes pruned"),
                Err(e) if e.is_cancelled() => {}
                Err(e) => warn!(%engine, error = %e, "volume prune failed"),
            }
        });
    }

    /// Keep a temporary pack alive.
    pub async fn ping_pack(&self, pack_id: &str) -> EngineResult<PackInfo> {
        let pack = self.pack(pack_id)?;
        if pack.marked_for_delete {
            return Err(EngineError::Rejected(DELETE_QUEUED.into()));
        }
        let (pack, ()) = self
            .registry()
            .packs
            .update(pack_id, |p| p.last_ping = epoch_millis())
            .await?;
        Ok(pack)
    }
}
