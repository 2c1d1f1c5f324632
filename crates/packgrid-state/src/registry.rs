//! Registry: the explicit set of collections shared by every component.
//!
//! Built once at startup and handed to the scheduler and each engine
//! controller.

use std::path::{Path, PathBuf};

use tracing::info;

use packgrid_core::{
    BuilderInfo, BundleInfo, EngineInfo, ItemMeta, NotificationHub, PackInfo,
    RESOURCES_REGISTRY_ID, RegistryInfo, SharedDataInfo,
};

use crate::error::StateResult;
use crate::store::Collection;

#[derive(Clone)]
pub struct Registry {
    root: PathBuf,
    pub engines: Collection<EngineInfo>,
    pub packs: Collection<PackInfo>,
    pub bundles: Collection<BundleInfo>,
    pub builders: Collection<BuilderInfo>,
    pub registries: Collection<RegistryInfo>,
    pub shared_data: Collection<SharedDataInfo>,
    notifier: NotificationHub,
}

impl Registry {
    pub fn open(root: &Path, notifier: NotificationHub) -> Self {
        Self {
            root: root.to_path_buf(),
            engines: Collection::new(root, "engines", notifier.clone()),
            packs: Collection::new(root, "packs", notifier.clone()),
            bundles: Collection::new(root, "bundles", notifier.clone()),
            builders: Collection::new(root, "builders", notifier.clone()),
            registries: Collection::new(root, "registries", notifier.clone()),
            shared_data: Collection::new(root, "shared_data", notifier.clone()),
            notifier,
        }
    }

    /// Run crash recovery and loading for every collection, then seed the
    /// resources registry if it does not exist yet.
    pub async fn init_all(&self) -> StateResult<()> {
        self.registries.init().await?;
        self.builders.init().await?;
        self.bundles.init().await?;
        self.shared_data.init().await?;
        self.packs.init().await?;
        self.engines.init().await?;

        if !self.registries.contains(RESOURCES_REGISTRY_ID) {
            self.registries
                .save(RegistryInfo {
                    id: RESOURCES_REGISTRY_ID.to_string(),
                    name: "Resources".to_string(),
                    address: String::new(),
                    hidden: true,
                    meta: ItemMeta::default(),
                })
                .await?;
            info!("resources registry seeded");
        }
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn notifier(&self) -> &NotificationHub {
        &self.notifier
    }

    /// Packs owned by one engine.
    pub fn engine_packs(&self, engine_id: &str) -> Vec<PackInfo> {
        self.packs.filter(|p| p.engine_id == engine_id)
    }

    /// `address/repo` or just `repo` for an empty address.
    pub fn image_name(&self, registry_id: &str, repo: &str) -> Option<String> {
        self.registries
            .get(registry_id)
            .map(|r| qualify_image(&r.address, repo))
    }
}

pub fn qualify_image(address: &str, repo: &str) -> String {
    if address.is_empty() {
        repo.to_string()
    } else {
        format!("{address}/{repo}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn init_seeds_resources_registry_once() {
        let tmp = tempfile::tempdir().unwrap();
        let reg = Registry::open(tmp.path(), NotificationHub::new());
        reg.init_all().await.unwrap();
        let first = reg.registries.get(RESOURCES_REGISTRY_ID).unwrap();

        let reg = Registry::open(tmp.path(), NotificationHub::new());
        reg.init_all().await.unwrap();
        let second = reg.registries.get(RESOURCES_REGISTRY_ID).unwrap();
        assert_eq!(first.meta, second.meta);
        assert!(tmp.path().join("packs").is_dir());
    }

    #[tokio::test]
    async fn image_name_uses_registry_address() {
        let tmp = tempfile::tempdir().unwrap();
        let reg = Registry::open(tmp.path(), NotificationHub::new());
        reg.init_all().await.unwrap();
        reg.registries
            .save(RegistryInfo {
                id: "r1".into(),
                address: "reg.local:5000".into(),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(
            reg.image_name("r1", "app:1.0").as_deref(),
            Some("reg.local:5000/app:1.0")
        );
        assert_eq!(
            reg.image_name(RESOURCES_REGISTRY_ID, "alpine").as_deref(),
            Some("alpine")
        );
        assert_eq!(reg.image_name("missing", "x"), None);
    }
}
