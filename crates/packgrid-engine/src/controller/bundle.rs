//! Bundle builds: resolve every role of a builder to a concrete image.
//!
//! The bundle is saved as corrupted first and only cleared once every role
//! resolved, so an interrupted build is never deployable.

use std::collections::BTreeMap;

use serde_json::json;
use tracing::info;

use packgrid_core::{
    BuildRequest, BuilderInfo, BundleInfo, ImageRef, RegistryInfo, RoleBuildInput, RoleImage,
    RoleTemplate, Severity,
};

use crate::controller::{EngineController, finish};
use crate::error::{EngineError, EngineResult};
use crate::container_spec::{parse_image_name, split_repo_tag};

/// Registry id for image names without a host.
pub const DEFAULT_REGISTRY_ID: &str = "default";

/// `<prefix>_<n>` with doubled underscores collapsed.
pub(crate) fn bundle_id(prefix: &str, n: u64) -> String {
    let mut id = format!("{prefix}_{n}");
    while id.contains("__") {
        id = id.replace("__", "_");
    }
    id
}

/// Registry id minted for an auto-registered address.
pub(crate) fn registry_id_for(address: &str) -> String {
    address.replace(':', "_")
}

impl EngineController {
    /// Build a bundle from a builder. Cached roles are re-tagged and pushed
    /// through this engine's daemon.
    pub async fn create_bundle(&self, req: BuildRequest) -> EngineResult<BundleInfo> {
        if !self.is_ready() {
            return Err(EngineError::NotReady(self.inner.id.clone()));
        }
        let builder = self
            .registry()
            .builders
            .get(&req.builder_id)
            .ok_or_else(|| EngineError::not_found("builder", &req.builder_id))?;
        for role in builder.images.iter().filter(|r| r.static_image.is_none()) {
            let named = req
                .images_info
                .get(&role.pcid)
                .and_then(|i| i.image_name.as_deref())
                .is_some_and(|n| !n.trim().is_empty());
            if !named {
                return Err(EngineError::InvalidImage(format!(
                    "role {} of builder {} needs an image name",
                    role.pcid, builder.id
                )));
            }
        }

        let id = match req.id.clone() {
            Some(id) => id,
            None => {
                let (_, n) = self
                    .registry()
                    .builders
                    .update(&builder.id, |b| {
                        let n = b.next_result_id;
                        b.next_result_id += 1;
                        n
                    })
                    .await?;
                bundle_id(&builder.result_prefix, n)
            }
        };
        let build_info: BTreeMap<String, serde_json::Value> = req
            .images_info
            .iter()
            .filter_map(|(pcid, input)| input.build_info.clone().map(|v| (pcid.clone(), v)))
            .collect();
        self.registry()
            .bundles
            .save(BundleInfo {
                id: id.clone(),
                builder_id: builder.id.clone(),
                build_info,
                corrupted: true,
                ..Default::default()
            })
            .await?;
        info!(engine = %self.inner.id, bundle = %id, builder = %builder.id, "bundle build started");

        let this = self.clone();
        let bundle = id.clone();
        let handle = self.queues().packs.post(
            "bundle_build",
            json!({ "bundle_id": id, "builder_id": builder.id }),
            move || async move { this.build_roles(&bundle, &builder, &req.images_info).await },
        );
        let images = match finish(handle).await {
            Ok(images) => images,
            Err(e) => {
                self.report(Severity::Error, &format!("build of bundle {id} failed"), &e);
                return Err(e);
            }
        };

        let (bundle, ()) = self
            .registry()
            .bundles
            .update(&id, move |b| {
                b.images_to_deploy = images;
                b.corrupted = false;
            })
            .await?;
        info!(engine = %self.inner.id, bundle = %id, roles = bundle.images_to_deploy.len(), "bundle built");
        Ok(bundle)
    }

    async fn build_roles(
        &self,
        bundle_id: &str,
        builder: &BuilderInfo,
        inputs: &BTreeMap<String, RoleBuildInput>,
    ) -> EngineResult<Vec<RoleImage>> {
        let mut images = Vec::with_capacity(builder.images.len());
        for role in &builder.images {
            let mut image = self.resolve_role(role, inputs.get(&role.pcid)).await?;
            if role.cache_dst.is_some() {
                image = self.cache_role(bundle_id, role, image).await?;
            }
            images.push(image);
        }
        Ok(images)
    }

    async fn resolve_role(
        &self,
        role: &RoleTemplate,
        input: Option<&RoleBuildInput>,
    ) -> EngineResult<RoleImage> {
        if let Some(fixed) = &role.static_image {
            let (repo, tag) = split_repo_tag(&fixed.image);
            return Ok(RoleImage {
                pcid: role.pcid.clone(),
                repo_name: repo.to_string(),
                image_tag: tag.to_string(),
                registry_id: fixed.registry_id.clone(),
                original: None,
            });
        }
        let name = input
            .and_then(|i| i.image_name.as_deref())
            .ok_or_else(|| EngineError::InvalidImage(format!("role {} has no image name", role.pcid)))?;
        let parsed = parse_image_name(name)?;
        let registry_id = self.ensure_registry(parsed.registry.as_deref()).await?;
        Ok(RoleImage {
            pcid: role.pcid.clone(),
            repo_name: parsed.repo,
            image_tag: parsed.tag,
            registry_id,
            original: None,
        })
    }

    /// Registry item for an address, registering unknown ones.
    async fn ensure_registry(&self, address: Option<&str>) -> EngineResult<String> {
        let address = address.unwrap_or_default();
        if let Some(known) = self.registry().registries.find(|r| !r.hidden && r.address == address) {
            return Ok(known.id);
        }
        let id = if address.is_empty() {
            DEFAULT_REGISTRY_ID.to_string()
        } else {
            registry_id_for(address)
        };
        self.registry()
            .registries
            .save(RegistryInfo {
                id: id.clone(),
                name: if address.is_empty() { id.clone() } else { address.to_string() },
                address: address.to_string(),
                ..Default::default()
            })
            .await?;
        info!(engine = %self.inner.id, registry = %id, %address, "registry registered");
        Ok(id)
    }

    /// Pull, re-tag under the role's cache target and push.
    async fn cache_role(
        &self,
        bundle_id: &str,
        role: &RoleTemplate,
        image: RoleImage,
    ) -> EngineResult<RoleImage> {
        let Some(dst) = &role.cache_dst else {
            return Ok(image);
        };
        let source = self
            .registry()
            .image_name(&image.registry_id, &format!("{}:{}", image.repo_name, image.image_tag))
            .ok_or_else(|| EngineError::not_found("registry", &image.registry_id))?;
        let target = self
            .registry()
            .image_name(&dst.registry_id, &dst.repo_name)
            .ok_or_else(|| EngineError::not_found("registry", &dst.registry_id))?;
        let tag = format!("{}{bundle_id}", dst.tag_prefix);

        self.pull_image(&source).await?;
        let api = self.api()?;
        let (src, repo, t) = (source.clone(), target.clone(), tag.clone());
        let handle = self.queues().images.post(
            "cache_image",
            json!({ "source": source, "target": target, "tag": tag }),
            move || async move {
                api.tag_image(&src, &repo, &t).await?;
                api.push_image(&repo, &t).await?;
                Ok::<_, EngineError>(())
            },
        );
        finish(handle).await?;
        info!(engine = %self.inner.id, %source, %target, %tag, "role image cached");

        Ok(RoleImage {
            pcid: image.pcid.clone(),
            repo_name: dst.repo_name.clone(),
            image_tag: tag,
            registry_id: dst.registry_id.clone(),
            original: Some(ImageRef {
                registry_id: image.registry_id,
                repo_name: image.repo_name,
                image_tag: image.image_tag,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bundle_ids_collapse_underscores() {
        assert_eq!(bundle_id("web_", 7), "web_7");
        assert_eq!(bundle_id("web", 0), "web_0");
        assert_eq!(bundle_id("", 3), "_3");
        assert_eq!(bundle_id("a___", 1), "a_1");
    }

    #[test]
    fn registry_ids_come_from_addresses() {
        assert_eq!(registry_id_for("registry.local:5000"), "registry.local_5000");
        assert_eq!(registry_id_for("ghcr.io"), "ghcr.io");
    }
}
