//! Periodic reconciliation.
//!
//! Each timer runs on its own task. The last run of every timer is stamped
//! on the engine item, so a restart keeps the configured spacing instead of
//! firing everything at once.
//!
//! ```text
//! delay = max(minimum, interval - (now - last mark))
//! ```

use std::time::Duration;

use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use packgrid_core::config::TimerConfig;
use packgrid_core::{PackInfo, Severity, epoch_millis};
use packgrid_state::StateError;

use crate::controller::{EngineController, finish};
use crate::daemon::ContainerSummary;
use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    StateRefresh,
    AutoDelete,
    PingCheck,
    DumpsCheck,
    PerfCollection,
    ImagePrune,
}

impl TimerKind {
    pub const ALL: [TimerKind; 6] = [
        TimerKind::StateRefresh,
        TimerKind::AutoDelete,
        TimerKind::PingCheck,
        TimerKind::DumpsCheck,
        TimerKind::PerfCollection,
        TimerKind::ImagePrune,
    ];

    /// Key of the persisted mark.
    pub fn as_str(&self) -> &'static str {
        match self {
            TimerKind::StateRefresh => "state_refresh",
            TimerKind::AutoDelete => "auto_delete",
            TimerKind::PingCheck => "ping_check",
            TimerKind::DumpsCheck => "dumps_check",
            TimerKind::PerfCollection => "perf_collection",
            TimerKind::ImagePrune => "image_prune",
        }
    }

    /// `(interval, minimum delay)`.
    pub fn schedule(&self, config: &TimerConfig) -> (Duration, Duration) {
        let (interval, min) = match self {
            TimerKind::StateRefresh => (config.state_refresh_secs, config.state_refresh_first_secs),
            TimerKind::AutoDelete => (config.auto_delete_check_secs, config.auto_delete_check_secs),
            TimerKind::PingCheck => (config.ping_check_secs, config.ping_check_secs),
            TimerKind::DumpsCheck => (config.dumps_check_secs, config.dumps_check_secs),
            TimerKind::PerfCollection => {
                (config.perf_collection_secs, config.perf_collection_min_secs)
            }
            TimerKind::ImagePrune => (config.image_prune_secs, config.image_prune_min_secs),
        };
        (Duration::from_secs(interval), Duration::from_secs(min))
    }
}

/// Delay until the next run given the epoch-ms stamp of the previous one.
pub fn next_delay(interval: Duration, min: Duration, last_mark: Option<u64>, now: u64) -> Duration {
    let Some(mark) = last_mark else {
        return min;
    };
    let elapsed = Duration::from_millis(now.saturating_sub(mark));
    interval.saturating_sub(elapsed).max(min)
}

/// Running timer tasks of one controller run.
pub(crate) struct TimerSet {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl TimerSet {
    /// Timers finish the run they are in and exit before the next one.
    pub fn stop(self) {
        let _ = self.shutdown.send(true);
        drop(self.handles);
    }
}

impl EngineController {
    pub(crate) fn start_timers(&self) {
        let (shutdown, rx) = watch::channel(false);
        let handles = TimerKind::ALL
            .iter()
            .map(|kind| tokio::spawn(self.clone().run_timer(*kind, rx.clone())))
            .collect();
        self.inner.rt.lock().timers = Some(TimerSet { shutdown, handles });
    }

    async fn run_timer(self, kind: TimerKind, mut shutdown: watch::Receiver<bool>) {
        let (interval, min) = kind.schedule(&self.config().timers);
        let mark = self.info().last_timer_marks.get(kind.as_str()).copied();
        let mut delay = next_delay(interval, min, mark, epoch_millis());
        debug!(engine = %self.inner.id, timer = kind.as_str(), delay_secs = delay.as_secs(), "timer armed");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => return,
            }
            if *shutdown.borrow() {
                return;
            }

            if let Err(e) = self.run_timer_once(kind).await {
                warn!(engine = %self.inner.id, timer = kind.as_str(), error = %e, "timer run failed");
                self.report(Severity::Warning, &format!("{} failed", kind.as_str()), &e);
            }
            self.mark_timer(kind).await;
            delay = interval.max(min);
        }
    }

    /// Run one timer body now.
    pub async fn run_timer_once(&self, kind: TimerKind) -> EngineResult<()> {
        match kind {
            TimerKind::StateRefresh => self.update_containers_state().await,
            TimerKind::AutoDelete => {
                self.check_auto_delete().await;
                Ok(())
            }
            TimerKind::PingCheck => self.ping_check().await,
            TimerKind::DumpsCheck => {
                for pack in self.packs_where(|p| p.options.monitor_dumps) {
                    if let Err(e) = self.collect_dumps(&pack.id).await {
                        warn!(engine = %self.inner.id, pack = %pack.id, error = %e, "dump inspection failed");
                    }
                }
                Ok(())
            }
            TimerKind::PerfCollection => {
                for pack in self.packs_where(|p| p.options.collect_performance) {
                    if let Err(e) = self.collect_performance(&pack.id).await {
                        warn!(engine = %self.inner.id, pack = %pack.id, error = %e, "performance sampling failed");
                    }
                }
                Ok(())
            }
            TimerKind::ImagePrune => self.cleanup_old_images().await,
        }
    }

    /// Settled packs of this engine matching `pred`.
    fn packs_where(&self, pred: impl Fn(&PackInfo) -> bool) -> Vec<PackInfo> {
        self.registry().packs.filter(|p| {
            p.engine_id == self.inner.id
                && !p.deploy_in_progress
                && !p.marked_for_delete
                && !p.upgrade_in_progress
                && pred(p)
        })
    }

    async fn mark_timer(&self, kind: TimerKind) {
        let now = epoch_millis();
        self.inner
            .info
            .write()
            .last_timer_marks
            .insert(kind.as_str().to_string(), now);
        let result = self
            .registry()
            .engines
            .update(&self.inner.id, |e| {
                e.last_timer_marks.insert(kind.as_str().to_string(), now);
            })
            .await;
        match result {
            Ok(_) | Err(StateError::NotFound { .. }) => {}
            Err(e) => warn!(engine = %self.inner.id, timer = kind.as_str(), error = %e, "saving timer mark failed"),
        }
    }

    // ── Bodies ─────────────────────────────────────────────────────

    /// Copy daemon state onto container records. Containers the daemon no
    /// longer knows are marked lost and their pack corrupted.
    pub async fn update_containers_state(&self) -> EngineResult<()> {
        let listed = self.list_containers().await?;
        for pack in self.packs_where(|_| true) {
            let mut probe = pack.clone();
            if !apply_listing(&mut probe, &listed).0 {
                continue;
            }
            let result = self
                .registry()
                .packs
                .update(&pack.id, |p| apply_listing(p, &listed).1)
                .await;
            match result {
                Ok((_, true)) => {
                    warn!(engine = %self.inner.id, pack = %pack.id, "pack lost containers");
                    self.report(
                        Severity::Error,
                        &format!("pack {} has lost containers", pack.id),
                        &"marked corrupted",
                    );
                }
                Ok(_) | Err(StateError::NotFound { .. }) => {}
                Err(e) => {
                    warn!(engine = %self.inner.id, pack = %pack.id, error = %e, "saving container state failed");
                }
            }
        }
        Ok(())
    }

    /// Remove temporary packs nobody pinged within the timeout.
    pub async fn check_auto_delete(&self) {
        let timeout_ms = self.config().timers.auto_delete_timeout_secs * 1000;
        let now = epoch_millis();
        let stale = self.registry().packs.filter(|p| {
            p.engine_id == self.inner.id
                && !p.keep_alive
                && !p.deploy_in_progress
                && !p.marked_for_delete
                && now.saturating_sub(p.last_ping) > timeout_ms
        });
        for pack in stale {
            info!(engine = %self.inner.id, pack = %pack.id, last_ping = pack.last_ping, "auto-deleting idle pack");
            if let Err(e) = self.remove_pack(&pack.id).await {
                warn!(engine = %self.inner.id, pack = %pack.id, error = %e, "auto-delete failed");
            }
        }
    }

    async fn ping_check(&self) -> EngineResult<()> {
        let api = self.api()?;
        let timeout = Duration::from_secs(self.settings().exec_timeout_secs);
        match tokio::time::timeout(timeout, api.ping()).await {
            Ok(Ok(())) => {
                let mut rt = self.inner.rt.lock();
                rt.last_pong = Some(epoch_millis());
                if let Some(tunnel) = &rt.tunnel {
                    tunnel.mark_healthy();
                }
                Ok(())
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(EngineError::Timeout(format!("ping {}", self.inner.id))),
        }
    }

    /// Remove dangling images older than the configured age.
    pub async fn cleanup_old_images(&self) -> EngineResult<()> {
        let api = self.api()?;
        let until = self.config().timers.image_prune_until.clone();
        let handle = self.queues().prune.post_unique(
            "prune_images",
            json!({ "until": until }),
            |t| t.kind == "prune_images",
            move || async move {
                api.prune_images(&until).await?;
                Ok::<_, EngineError>(())
            },
        );
        finish(handle).await
    }
}

/// Reconcile `pack` against a daemon listing.
///
/// Returns `(changed, lost)`.
fn apply_listing(pack: &mut PackInfo, listed: &[ContainerSummary]) -> (bool, bool) {
    let mut changed = false;
    let mut lost = false;
    for c in pack.containers.iter_mut() {
        let Some(id) = c.id.as_deref() else {
            continue;
        };
        let (state, status) = match listed.iter().find(|s| s.id.starts_with(id) || id.starts_with(&s.id)) {
            Some(s) => (s.state.clone(), s.status.clone()),
            None => {
                lost = true;
                ("lost".to_string(), "404".to_string())
            }
        };
        if c.state.as_deref() != Some(state.as_str()) || c.status.as_deref() != Some(status.as_str())
        {
            c.state = Some(state);
            c.status = Some(status);
            changed = true;
        }
    }
    if lost && !pack.corrupted {
        pack.corrupted = true;
        changed = true;
    }
    (changed, lost)
}

#[cfg(test)]
mod tests {
    use super::*;
    use packgrid_core::ContainerRecord;

    #[test]
    fn delay_honours_previous_mark() {
        let interval = Duration::from_secs(60);
        let min = Duration::from_secs(5);
        assert_eq!(next_delay(interval, min, None, 1_000_000), min);
        assert_eq!(
            next_delay(interval, min, Some(1_000_000 - 20_000), 1_000_000),
            Duration::from_secs(40)
        );
        assert_eq!(next_delay(interval, min, Some(0), 1_000_000), min);
        // a mark from the future still waits the full interval at most
        assert_eq!(next_delay(interval, min, Some(2_000_000), 1_000_000), interval);
    }

    #[test]
    fn every_timer_has_a_schedule() {
        let config = TimerConfig::default();
        let (interval, min) = TimerKind::PerfCollection.schedule(&config);
        assert_eq!((interval.as_secs(), min.as_secs()), (300, 60));
        let (interval, min) = TimerKind::ImagePrune.schedule(&config);
        assert_eq!((interval.as_secs(), min.as_secs()), (3 * 86_400, 30 * 60));
        let keys: std::collections::BTreeSet<_> = TimerKind::ALL.iter().map(|k| k.as_str()).collect();
        assert_eq!(keys.len(), TimerKind::ALL.len());
    }

    fn summary(id: &str, state: &str) -> ContainerSummary {
        ContainerSummary {
            id: id.into(),
            names: vec![format!("/{id}")],
            image: "img".into(),
            state: state.into(),
            status: "Up".into(),
        }
    }

    #[test]
    fn listing_marks_missing_containers_lost() {
        let mut pack = PackInfo {
            id: "1_e1".into(),
            containers: vec![
                ContainerRecord {
                    pcid: "web".into(),
                    id: Some("aaa".into()),
                    name: "a".into(),
                    ..Default::default()
                },
                ContainerRecord {
                    pcid: "db".into(),
                    id: Some("bbb".into()),
                    name: "b".into(),
                    ..Default::default()
                },
                ContainerRecord {
                    pcid: "cache".into(),
                    name: "pending".into(),
                    ..Default::default()
                },
            ],
            ..Default::default()
        };

        let (changed, lost) = apply_listing(&mut pack, &[summary("aaa", "running")]);
        assert!(changed && lost);
        assert!(pack.corrupted);
        assert_eq!(pack.containers[0].state.as_deref(), Some("running"));
        assert_eq!(pack.containers[1].state.as_deref(), Some("lost"));
        assert_eq!(pack.containers[1].status.as_deref(), Some("404"));
        assert_eq!(pack.containers[2].state, None);

        let (changed, _) = apply_listing(&mut pack, &[summary("aaa", "running")]);
        assert!(!changed);
    }
}
