//! Collection: one crash-safe, file-per-item persistent collection.
//!
//! Each item lives in `<dir>/<id>.json`. A save first moves the previous
//! version aside to `<id>.json.bak`, writes the new content, and only then
//! drops the shadow. `init()` repairs whatever a crash left behind, so one
//! of the two versions always survives.
//!
//! Writes and deletes are serialized per collection through an async
//! mutex; reads come from an in-memory mirror and never touch the disk.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use packgrid_core::{Component, NotificationHub, Severity, StoreItem, epoch_millis};

use crate::error::{StateError, StateResult};
use crate::subscribe::{Subscribers, Subscription};

const ITEM_EXT: &str = ".json";
const SHADOW_EXT: &str = ".json.bak";

/// What `delete` does when the backing file is already gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeletePolicy {
    /// Report the missing file as an error.
    #[default]
    Strict,
    /// Treat a missing file as already deleted.
    Lenient,
}

/// Emitted synchronously after every durable save or delete.
#[derive(Debug, Clone)]
pub enum ChangeEvent<T> {
    Changed { collection: String, item: T },
    Deleted { collection: String, id: String },
}

impl<T> ChangeEvent<T> {
    pub fn id(&self) -> &str
    where
        T: StoreItem,
    {
        match self {
            ChangeEvent::Changed { item, .. } => item.id(),
            ChangeEvent::Deleted { id, .. } => id,
        }
    }
}

struct CollectionInner<T: StoreItem> {
    name: String,
    dir: PathBuf,
    items: RwLock<Vec<T>>,
    write_lock: Mutex<()>,
    subscribers: Subscribers<ChangeEvent<T>>,
    notifier: NotificationHub,
    delete_policy: DeletePolicy,
}

/// Thread-safe handle to one collection. Cloning shares the collection.
pub struct Collection<T: StoreItem> {
    inner: Arc<CollectionInner<T>>,
}

impl<T: StoreItem> Clone for Collection<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: StoreItem> Collection<T> {
    /// Bind a collection to `<root>/<name>`. Nothing is read until `init()`.
    pub fn new(root: &Path, name: &str, notifier: NotificationHub) -> Self {
        Self::with_policy(root, name, notifier, DeletePolicy::default())
    }

    pub fn with_policy(
        root: &Path,
        name: &str,
        notifier: NotificationHub,
        delete_policy: DeletePolicy,
    ) -> Self {
        Self {
            inner: Arc::new(CollectionInner {
                name: name.to_string(),
                dir: root.join(name),
                items: RwLock::new(Vec::new()),
                write_lock: Mutex::new(()),
                subscribers: Subscribers::new(),
                notifier,
                delete_policy,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    // ── Loading ────────────────────────────────────────────────────

    /// Recover from interrupted writes, then load every item into memory.
    ///
    /// Corrupt files are reported as critical notifications and skipped.
    pub async fn init(&self) -> StateResult<()> {
        let dir = &self.inner.dir;
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(StateError::io(dir))?;

        let _guard = self.inner.write_lock.lock().await;

        let names = list_file_names(dir).await?;
        for shadow in names.iter().filter(|n| n.ends_with(SHADOW_EXT)) {
            self.recover_shadow(shadow).await?;
        }

        let names = list_file_names(dir).await?;
        let mut loaded = Vec::new();
        let mut renamed = Vec::new();
        for name in names.iter().filter(|n| n.ends_with(ITEM_EXT)) {
            let stem = &name[..name.len() - ITEM_EXT.len()];
            let path = dir.join(name);
            match read_item::<T>(&path).await {
                Ok(mut item) => {
                    if item.id() != stem {
                        warn!(collection = %self.inner.name, file = %name, id = %item.id(), "item id does not match file name, correcting");
                        item.set_id(stem.to_string());
                        renamed.push(stem.to_string());
                    }
                    loaded.push(item);
                }
                Err(e) => {
                    self.inner.notifier.post(
                        Component::Database,
                        Severity::Critical,
                        format!("{}: failed to load item", self.inner.name),
                        Some(serde_json::json!({ "file": name, "error": e.to_string() })),
                    );
                }
            }
        }

        loaded.sort_by_key(|item| item.meta().last_save.unwrap_or(0));
        let count = loaded.len();
        *self.inner.items.write() = loaded;

        for id in renamed {
            if let Some(item) = self.get(&id) {
                self.write_and_publish(item).await?;
            }
        }

        info!(collection = %self.inner.name, items = count, "collection loaded");
        Ok(())
    }

    async fn recover_shadow(&self, shadow_name: &str) -> StateResult<()> {
        let dir = &self.inner.dir;
        let live_name = &shadow_name[..shadow_name.len() - ".bak".len()];
        let shadow = dir.join(shadow_name);
        let live = dir.join(live_name);

        let live_ok = match tokio::fs::try_exists(&live).await {
            Ok(true) => read_item::<T>(&live).await.is_ok(),
            _ => false,
        };

        if live_ok {
            debug!(collection = %self.inner.name, file = %shadow_name, "discarding shadow of completed write");
            remove_if_exists(&shadow).await
        } else {
            warn!(collection = %self.inner.name, file = %live_name, "restoring item from shadow after interrupted write");
            tokio::fs::rename(&shadow, &live)
                .await
                .map_err(StateError::io(&shadow))
        }
    }

    // ── Reads ──────────────────────────────────────────────────────

    /// Snapshot of every item, oldest save first.
    pub fn items(&self) -> Vec<T> {
        self.inner.items.read().clone()
    }

    pub fn get(&self, id: &str) -> Option<T> {
        self.inner.items.read().iter().find(|i| i.id() == id).cloned()
    }

    pub fn find(&self, pred: impl Fn(&T) -> bool) -> Option<T> {
        self.inner.items.read().iter().find(|i| pred(i)).cloned()
    }

    pub fn filter(&self, pred: impl Fn(&T) -> bool) -> Vec<T> {
        self.inner
            .items
            .read()
            .iter()
            .filter(|i| pred(i))
            .cloned()
            .collect()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.items.read().iter().any(|i| i.id() == id)
    }

    pub fn len(&self) -> usize {
        self.inner.items.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ── Writes ─────────────────────────────────────────────────────

    /// Durably write `item`, mirror it in memory and notify subscribers.
    ///
    /// Returns the item as stored, with fresh save stamps. Last writer
    /// wins: there is no check against concurrent modification.
    pub async fn save(&self, item: T) -> StateResult<T> {
        validate_id(item.id())?;
        let _guard = self.inner.write_lock.lock().await;
        self.write_and_publish(item).await
    }

    /// Read-modify-write of one item inside the write pipeline.
    ///
    /// The closure sees the latest in-memory version, so concurrent
    /// `update` calls on the same item never lose each other's changes.
    pub async fn update<R>(&self, id: &str, f: impl FnOnce(&mut T) -> R) -> StateResult<(T, R)> {
        validate_id(id)?;
        let _guard = self.inner.write_lock.lock().await;
        let mut item = self.get(id).ok_or_else(|| StateError::NotFound {
            collection: self.inner.name.clone(),
            id: id.to_string(),
        })?;
        let out = f(&mut item);
        let item = self.write_and_publish(item).await?;
        Ok((item, out))
    }

    async fn write_and_publish(&self, mut item: T) -> StateResult<T> {
        let id = item.id().to_string();
        if let Err(e) = self.write_item(&mut item).await {
            self.report("save", &id, &e);
            return Err(e);
        }

        {
            let mut items = self.inner.items.write();
            match items.iter_mut().find(|i| i.id() == id) {
                Some(slot) => *slot = item.clone(),
                None => items.push(item.clone()),
            }
        }
        debug!(collection = %self.inner.name, %id, "item saved");

        self.inner.subscribers.emit(&ChangeEvent::Changed {
            collection: self.inner.name.clone(),
            item: item.clone(),
        });
        Ok(item)
    }

    async fn write_item(&self, item: &mut T) -> StateResult<()> {
        let live = self.item_path(item.id());
        let shadow = self.shadow_path(item.id());

        remove_if_exists(&shadow).await?;
        let had_old = match tokio::fs::rename(&live, &shadow).await {
            Ok(()) => true,
            Err(e) if e.kind() == ErrorKind::NotFound => false,
            Err(e) => return Err(StateError::Io { path: live, source: e }),
        };

        let now = epoch_millis();
        item.meta_mut().last_save = Some(now);
        if !had_old {
            item.meta_mut().created_at = Some(now);
        }

        let body =
            serde_json::to_vec_pretty(item).map_err(|e| StateError::Serialize(e.to_string()))?;
        let mut file = tokio::fs::File::create(&live)
            .await
            .map_err(StateError::io(&live))?;
        file.write_all(&body).await.map_err(StateError::io(&live))?;
        file.sync_all().await.map_err(StateError::io(&live))?;

        if had_old {
            remove_if_exists(&shadow).await?;
        }
        Ok(())
    }

    /// Remove the item's file and its in-memory copy.
    pub async fn delete(&self, id: &str) -> StateResult<()> {
        validate_id(id)?;
        let _guard = self.inner.write_lock.lock().await;

        let path = self.item_path(id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {
                if self.inner.delete_policy == DeletePolicy::Strict {
                    let err = StateError::NotFound {
                        collection: self.inner.name.clone(),
                        id: id.to_string(),
                    };
                    self.report("delete", id, &err);
                    return Err(err);
                }
                debug!(collection = %self.inner.name, %id, "delete of missing item ignored");
            }
            Err(e) => {
                let err = StateError::Io { path, source: e };
                self.report("delete", id, &err);
                return Err(err);
            }
        }

        let existed = {
            let mut items = self.inner.items.write();
            let before = items.len();
            items.retain(|i| i.id() != id);
            items.len() != before
        };
        if !existed && self.inner.delete_policy == DeletePolicy::Lenient {
            return Ok(());
        }

        debug!(collection = %self.inner.name, %id, "item deleted");
        self.inner.subscribers.emit(&ChangeEvent::Deleted {
            collection: self.inner.name.clone(),
            id: id.to_string(),
        });
        Ok(())
    }

    // ── Subscriptions ──────────────────────────────────────────────

    /// Register a listener for every save and delete, in write order.
    ///
    /// Listeners run synchronously inside the write path and must not
    /// block; hand work off to a task when it needs to await.
    pub fn subscribe(
        &self,
        listener: impl Fn(&ChangeEvent<T>) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner.subscribers.subscribe(listener)
    }

    fn item_path(&self, id: &str) -> PathBuf {
        self.inner.dir.join(format!("{id}{ITEM_EXT}"))
    }

    fn shadow_path(&self, id: &str) -> PathBuf {
        self.inner.dir.join(format!("{id}{SHADOW_EXT}"))
    }

    fn report(&self, op: &str, id: &str, err: &StateError) {
        self.inner.notifier.post(
            Component::Database,
            Severity::Error,
            format!("{}: {op} failed", self.inner.name),
            Some(serde_json::json!({ "id": id, "error": err.to_string() })),
        );
    }
}

fn validate_id(id: &str) -> StateResult<()> {
    if id.is_empty() {
        return Err(StateError::MissingId);
    }
    if id.contains(['/', '\\']) || id == "." || id == ".." {
        return Err(StateError::InvalidId(id.to_string()));
    }
    Ok(())
}

async fn list_file_names(dir: &Path) -> StateResult<Vec<String>> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(StateError::io(dir))?;
    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(StateError::io(dir))? {
        if let Some(name) = entry.file_name().to_str() {
            names.push(name.to_string());
        }
    }
    names.sort();
    Ok(names)
}

async fn read_item<T: StoreItem>(path: &Path) -> StateResult<T> {
    let bytes = tokio::fs::read(path).await.map_err(StateError::io(path))?;
    serde_json::from_slice(&bytes).map_err(|e| StateError::Deserialize {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

async fn remove_if_exists(path: &Path) -> StateResult<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StateError::Io {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use packgrid_core::{ItemMeta, RegistryInfo};

    fn registry(id: &str, address: &str) -> RegistryInfo {
        RegistryInfo {
            id: id.into(),
            name: id.into(),
            address: address.into(),
            hidden: false,
            meta: ItemMeta::default(),
        }
    }

    async fn open(root: &Path) -> (Collection<RegistryInfo>, NotificationHub) {
        let hub = NotificationHub::new();
        let col = Collection::new(root, "registries", hub.clone());
        col.init().await.unwrap();
        (col, hub)
    }

    #[tokio::test]
    async fn test_save_and_reload() {
        let tmp = tempfile::tempdir().unwrap();
        let (col, _) = open(tmp.path()).await;

        let saved = col.save(registry("r1", "reg.local:5000")).await.unwrap();
        assert!(saved.meta.last_save.is_some());
        assert_eq!(saved.meta.created_at, saved.meta.last_save);
        assert!(tmp.path().join("registries/r1.json").exists());

        let (reloaded, _) = open(tmp.path()).await;
        assert_eq!(reloaded.get("r1").unwrap().address, "reg.local:5000");
    }

    #[tokio::test]
    async fn test_resave_keeps_created_stamp() {
        let tmp = tempfile::tempdir().unwrap();
        let (col, _) = open(tmp.path()).await;

        let first = col.save(registry("r1", "a")).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let mut second = first.clone();
        second.address = "b".into();
        let second = col.save(second).await.unwrap();

        assert_eq!(second.meta.created_at, first.meta.created_at);
        assert!(second.meta.last_save > first.meta.last_save);
        assert_eq!(col.len(), 1);
        assert!(!tmp.path().join("registries/r1.json.bak").exists());
    }

    #[tokio::test]
    async fn test_save_rejects_bad_ids() {
        let tmp = tempfile::tempdir().unwrap();
        let (col, _) = open(tmp.path()).await;
        assert!(matches!(
            col.save(registry("", "a")).await,
            Err(StateError::MissingId)
        ));
        assert!(matches!(
            col.save(registry("../x", "a")).await,
            Err(StateError::InvalidId(_))
        ));
    }

    #[tokio::test]
    async fn test_crash_before_write_restores_previous_version() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let (col, _) = open(tmp.path()).await;
            col.save(registry("r1", "old")).await.unwrap();
        }
        // Crash after the rename-to-shadow step, before the new write.
        let dir = tmp.path().join("registries");
        std::fs::rename(dir.join("r1.json"), dir.join("r1.json.bak")).unwrap();

        let (col, _) = open(tmp.path()).await;
        assert_eq!(col.get("r1").unwrap().address, "old");
        assert!(dir.join("r1.json").exists());
        assert!(!dir.join("r1.json.bak").exists());
    }

    #[tokio::test]
    async fn test_crash_after_write_keeps_new_version() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("registries");
        {
            let (col, _) = open(tmp.path()).await;
            col.save(registry("r1", "old")).await.unwrap();
        }
        let old = std::fs::read(dir.join("r1.json")).unwrap();
        {
            let (col, _) = open(tmp.path()).await;
            col.save(registry("r1", "new")).await.unwrap();
        }
        // Crash after the write, before the shadow was removed.
        std::fs::write(dir.join("r1.json.bak"), old).unwrap();

        let (col, _) = open(tmp.path()).await;
        assert_eq!(col.get("r1").unwrap().address, "new");
        assert!(!dir.join("r1.json.bak").exists());
    }

    #[tokio::test]
    async fn test_torn_write_falls_back_to_shadow() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("registries");
        {
            let (col, _) = open(tmp.path()).await;
            col.save(registry("r1", "old")).await.unwrap();
        }
        std::fs::rename(dir.join("r1.json"), dir.join("r1.json.bak")).unwrap();
        std::fs::write(dir.join("r1.json"), b"{\"id\": \"r1\", \"addr").unwrap();

        let (col, hub) = open(tmp.path()).await;
        assert_eq!(col.get("r1").unwrap().address, "old");
        assert!(hub.recent().is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_item_is_reported_and_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("registries");
        {
            let (col, _) = open(tmp.path()).await;
            col.save(registry("good", "a")).await.unwrap();
        }
        std::fs::write(dir.join("bad.json"), b"not json").unwrap();

        let (col, hub) = open(tmp.path()).await;
        assert_eq!(col.len(), 1);
        assert!(col.contains("good"));
        let notes = hub.recent();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].severity, Severity::Critical);
    }

    #[tokio::test]
    async fn test_mismatched_id_is_corrected_and_resaved() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("registries");
        std::fs::create_dir_all(&dir).unwrap();
        let body = serde_json::to_vec(&registry("wrong", "a")).unwrap();
        std::fs::write(dir.join("right.json"), body).unwrap();

        let (col, _) = open(tmp.path()).await;
        assert!(col.contains("right"));
        assert!(!col.contains("wrong"));

        let on_disk: RegistryInfo =
            serde_json::from_slice(&std::fs::read(dir.join("right.json")).unwrap()).unwrap();
        assert_eq!(on_disk.id, "right");
    }

    #[tokio::test]
    async fn test_items_ordered_by_last_save() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("registries");
        std::fs::create_dir_all(&dir).unwrap();
        for (id, stamp) in [("a", 30), ("b", 10), ("c", 20)] {
            let mut item = registry(id, "x");
            item.meta.last_save = Some(stamp);
            std::fs::write(
                dir.join(format!("{id}.json")),
                serde_json::to_vec(&item).unwrap(),
            )
            .unwrap();
        }

        let (col, _) = open(tmp.path()).await;
        let ids: Vec<_> = col.items().into_iter().map(|i| i.id).collect();
        assert_eq!(ids, vec!["b", "c", "a"]);
    }

    #[tokio::test]
    async fn test_strict_delete_of_missing_item_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let (col, hub) = open(tmp.path()).await;

        let err = col.delete("ghost").await.unwrap_err();
        assert!(matches!(err, StateError::NotFound { .. }));
        assert_eq!(hub.recent().len(), 1);
        assert_eq!(hub.recent()[0].severity, Severity::Error);

        // The pipeline keeps working after a failure.
        col.save(registry("r1", "a")).await.unwrap();
        col.delete("r1").await.unwrap();
        assert!(col.is_empty());
    }

    #[tokio::test]
    async fn test_lenient_delete_of_missing_item_succeeds() {
        let tmp = tempfile::tempdir().unwrap();
        let hub = NotificationHub::new();
        let col: Collection<RegistryInfo> =
            Collection::with_policy(tmp.path(), "registries", hub.clone(), DeletePolicy::Lenient);
        col.init().await.unwrap();

        let events = Arc::new(parking_lot::Mutex::new(0));
        let _sub = {
            let events = events.clone();
            col.subscribe(move |_| *events.lock() += 1)
        };

        col.delete("ghost").await.unwrap();
        assert!(hub.recent().is_empty());
        assert_eq!(*events.lock(), 0);
    }

    #[tokio::test]
    async fn test_subscribers_see_writes_in_order() {
        let tmp = tempfile::tempdir().unwrap();
        let (col, _) = open(tmp.path()).await;

        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sub = {
            let log = log.clone();
            col.subscribe(move |ev| {
                let entry = match ev {
                    ChangeEvent::Changed { item, .. } => format!("change:{}", item.id),
                    ChangeEvent::Deleted { id, .. } => format!("delete:{id}"),
                };
                log.lock().push(entry);
            })
        };

        col.save(registry("a", "1")).await.unwrap();
        col.save(registry("b", "1")).await.unwrap();
        col.delete("a").await.unwrap();
        sub.unsubscribe();
        col.save(registry("c", "1")).await.unwrap();

        assert_eq!(*log.lock(), vec!["change:a", "change:b", "delete:a"]);
    }

    #[tokio::test]
    async fn test_concurrent_updates_do_not_lose_changes() {
        let tmp = tempfile::tempdir().unwrap();
        let (col, _) = open(tmp.path()).await;
        col.save(registry("r1", "")).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..10 {
            let col = col.clone();
            handles.push(tokio::spawn(async move {
                col.update("r1", |r| r.address.push_str(&i.to_string())).await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(col.get("r1").unwrap().address.len(), 10);

        assert!(matches!(
            col.update("ghost", |_| ()).await,
            Err(StateError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_concurrent_saves_are_serialized() {
        let tmp = tempfile::tempdir().unwrap();
        let (col, _) = open(tmp.path()).await;

        let mut handles = Vec::new();
        for i in 0..20 {
            let col = col.clone();
            handles.push(tokio::spawn(async move {
                col.save(registry("shared", &format!("v{i}"))).await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }

        assert_eq!(col.len(), 1);
        let dir = tmp.path().join("registries");
        let names: Vec<_> = std::fs::read_dir(&dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec!["shared.json"]);

        let on_disk: RegistryInfo =
            serde_json::from_slice(&std::fs::read(dir.join("shared.json")).unwrap()).unwrap();
        assert_eq!(on_disk.address, col.get("shared").unwrap().address);
    }
}
