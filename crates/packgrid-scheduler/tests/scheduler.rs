//! Fleet scheduler tests: a real store, the in-memory daemon and engines
//! brought up through the `engines` collection.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use packgrid_core::config::{EngineSettings, SchedulerSettings, TimerConfig};
use packgrid_core::{
    BuildRequest, BuilderInfo, BundleInfo, Component, DeployRequest, EngineInfo, GridConfig,
    NetworkInfo, NotificationHub, RegistryInfo, RoleAddition, RoleBuildInput, RoleImage,
    RoleTemplate, UpgradeRequest,
};
use packgrid_engine::{
    ControllerContext, EngineController, EngineError, EngineStatus, MockDaemon, PortAllocator,
    StaticConnector,
};
use packgrid_scheduler::{Scheduler, SchedulerError};
use packgrid_state::Registry;
use tempfile::TempDir;

struct Fleet {
    _tmp: TempDir,
    registry: Registry,
    daemon: Arc<MockDaemon>,
    scheduler: Scheduler,
}

impl Fleet {
    fn engine(&self) -> EngineController {
        self.scheduler.engine("e1").unwrap()
    }
}

/// Poll `check` until it holds, failing the test after five seconds.
async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn engine_info(ips: &[u8], labels: &[&str]) -> EngineInfo {
    EngineInfo {
        id: "e1".into(),
        labels: labels.iter().map(|l| l.to_string()).collect(),
        network: NetworkInfo {
            gateway: Some(Ipv4Addr::new(172, 20, 0, 1)),
            ip_list: ips.iter().map(|n| Ipv4Addr::new(10, 0, 0, *n)).collect(),
            ip_range: None,
        },
        ..Default::default()
    }
}

async fn seed(registry: &Registry) {
    registry
        .registries
        .save(RegistryInfo {
            id: "local".into(),
            name: "local".into(),
            address: "registry.local:5000".into(),
            ..Default::default()
        })
        .await
        .unwrap();
    registry
        .builders
        .save(BuilderInfo {
            id: "shop".into(),
            result_prefix: "shop".into(),
            images: vec![
                RoleTemplate {
                    pcid: "web".into(),
                    ..Default::default()
                },
                RoleTemplate {
                    pcid: "db".into(),
                    ..Default::default()
                },
            ],
            ..Default::default()
        })
        .await
        .unwrap();
    let role = |pcid: &str| RoleImage {
        pcid: pcid.into(),
        repo_name: format!("acme/{pcid}"),
        image_tag: "1.0".into(),
        registry_id: "local".into(),
        original: None,
    };
    registry
        .bundles
        .save(BundleInfo {
            id: "shop_1".into(),
            builder_id: "shop".into(),
            images_to_deploy: vec![role("web"), role("db")],
            ..Default::default()
        })
        .await
        .unwrap();
}

async fn fleet(ips: &[u8], labels: &[&str]) -> Fleet {
    let tmp = tempfile::tempdir().unwrap();
    let registry = Registry::open(tmp.path(), NotificationHub::new());
    registry.init_all().await.unwrap();
    seed(&registry).await;
    registry.engines.save(engine_info(ips, labels)).await.unwrap();

    let daemon = Arc::new(MockDaemon::new());
    let config = GridConfig {
        data_dir: tmp.path().to_path_buf(),
        timers: TimerConfig {
            state_refresh_first_secs: 3600,
            auto_delete_check_secs: 3600,
            ping_check_secs: 3600,
            dumps_check_secs: 3600,
            perf_collection_min_secs: 3600,
            ..Default::default()
        },
        engine: EngineSettings {
            ping_retry_delay_ms: 10,
            ..Default::default()
        },
        // Matching must be driven by events alone in these tests.
        scheduler: SchedulerSettings {
            build_retry_secs: 1,
            rematch_secs: 0,
        },
        ..Default::default()
    };
    let scheduler = Scheduler::new(ControllerContext {
        registry: registry.clone(),
        config: Arc::new(config),
        connector: Arc::new(StaticConnector(daemon.clone())),
        ports: PortAllocator::new(),
    });
    scheduler.start();
    eventually("engine ready", || {
        scheduler.engine("e1").is_some_and(|e| e.is_ready())
    })
    .await;

    Fleet {
        _tmp: tmp,
        registry,
        daemon,
        scheduler,
    }
}

/// Two IPs: web runs one extra clone.
fn two_clone_request() -> DeployRequest {
    DeployRequest {
        bundle_id: "shop_1".into(),
        extra_clones: BTreeMap::from([("web".to_string(), 1)]),
        keep_alive: true,
        ..Default::default()
    }
}

fn single_request() -> DeployRequest {
    DeployRequest {
        bundle_id: "shop_1".into(),
        keep_alive: true,
        ..Default::default()
    }
}

#[tokio::test]
async fn pending_deploy_runs_once_a_pack_is_removed() {
    let f = fleet(&[1, 2, 3], &[]).await;

    let first = f.scheduler.submit_deploy(two_clone_request());
    let second = f.scheduler.submit_deploy(two_clone_request());
    let second_id = second.id().to_string();

    let pack = first.wait().await.unwrap();
    assert_eq!(pack.ip_list.len(), 2);
    let telemetry = f.scheduler.telemetry();
    assert_eq!((telemetry[0].id.as_str(), telemetry[0].free_ips), ("e1", 1));

    eventually("second request to miss", || {
        f.scheduler
            .pending_deploys()
            .iter()
            .any(|e| e.id == second_id && e.item.misses >= 1)
    })
    .await;
    assert_eq!(f.scheduler.pending_deploys().len(), 1);

    f.engine().remove_pack(&pack.id).await.unwrap();

    let next = second.wait().await.unwrap();
    assert_eq!(next.ip_list.len(), 2);
    assert!(f.scheduler.pending_deploys().is_empty());
    assert_eq!(f.engine().free_ip_count(), 1);
    assert!(f.engine().ip_accounting_ok());
}

#[tokio::test]
async fn upgrade_dry_run_failure_leaves_pack_untouched() {
    let f = fleet(&[1, 2], &[]).await;
    let pack = f.scheduler.deploy(single_request()).await.unwrap();
    let containers = f.daemon.containers().len();
    assert_eq!(f.engine().free_ip_count(), 1);

    let err = f
        .engine()
        .upgrade_pack(UpgradeRequest {
            pack_id: pack.id.clone(),
            roles_to_add: vec![RoleAddition {
                pcid: "web".into(),
                count: 2,
                ..Default::default()
            }],
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NoFreeIps { needed: 2, free: 1 }));

    let after = f.registry.packs.get(&pack.id).unwrap();
    assert_eq!(after.ip_list, pack.ip_list);
    assert_eq!(after.containers, pack.containers);
    assert_eq!(f.daemon.containers().len(), containers);
    assert_eq!(f.engine().free_ip_count(), 1);
}

#[tokio::test]
async fn removed_deploy_request_rejects_its_caller() {
    let f = fleet(&[1], &[]).await;
    let ticket = f.scheduler.submit_deploy(two_clone_request());
    let id = ticket.id().to_string();

    eventually("request to miss", || {
        f.scheduler
            .pending_deploys()
            .first()
            .is_some_and(|e| e.item.misses >= 1)
    })
    .await;

    assert!(f.scheduler.remove_deploy_request(&id));
    assert!(!f.scheduler.remove_deploy_request(&id));
    assert!(matches!(ticket.wait().await, Err(SchedulerError::Removed(r)) if r == id));
    assert!(f.scheduler.pending_deploys().is_empty());
}

#[tokio::test]
async fn label_change_lets_filtered_request_through() {
    let f = fleet(&[1, 2], &[]).await;
    let mut request = single_request();
    request.engine_filters = vec!["gpu".into()];
    let ticket = f.scheduler.submit_deploy(request);

    eventually("filtered request to miss", || {
        f.scheduler
            .pending_deploys()
            .first()
            .is_some_and(|e| e.item.misses >= 1)
    })
    .await;

    f.registry
        .engines
        .save(engine_info(&[1, 2], &["gpu"]))
        .await
        .unwrap();

    let pack = ticket.wait().await.unwrap();
    assert_eq!(pack.engine_id, "e1");
    assert!(f.engine().labels().contains("gpu"));
}

#[tokio::test]
async fn timer_marks_do_not_reinit_engine() {
    let f = fleet(&[1], &[]).await;
    let mut status = f.engine().subscribe_status();
    let _ = status.borrow_and_update();

    let mut info = engine_info(&[1], &[]);
    info.last_timer_marks.insert("prune".into(), 42);
    f.registry.engines.save(info).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(!status.has_changed().unwrap());
    assert_eq!(f.engine().status(), EngineStatus::Ready);
}

#[tokio::test]
async fn dispatch_error_fails_request_and_notifies() {
    let f = fleet(&[1], &[]).await;
    let mut request = single_request();
    request.bundle_id = "missing".into();

    let err = f.scheduler.deploy(request).await.unwrap_err();
    assert!(matches!(
        err,
        SchedulerError::Dispatch {
            source: EngineError::NotFound { kind: "bundle", .. },
            ..
        }
    ));
    assert!(f.scheduler.pending_deploys().is_empty());
    assert!(
        f.registry
            .notifier()
            .recent()
            .iter()
            .any(|n| n.component == Component::Scheduler && n.message.contains("failed on e1"))
    );
}

#[tokio::test]
async fn build_runs_on_builder_engine() {
    let f = fleet(&[1], &["builder"]).await;
    let bundle = f
        .scheduler
        .build(BuildRequest {
            id: None,
            builder_id: "shop".into(),
            images_info: BTreeMap::from([
                (
                    "web".to_string(),
                    RoleBuildInput {
                        image_name: Some("registry.local:5000/acme/web:2.0".into()),
                        build_info: None,
                    },
                ),
                (
                    "db".to_string(),
                    RoleBuildInput {
                        image_name: Some("acme/db:2.0".into()),
                        build_info: None,
                    },
                ),
            ]),
        })
        .await
        .unwrap();

    assert!(bundle.id.starts_with("shop_"));
    assert!(!bundle.corrupted);
    let web = bundle.role("web").unwrap();
    assert_eq!((web.registry_id.as_str(), web.image_tag.as_str()), ("local", "2.0"));
    assert_eq!(bundle.role("db").unwrap().registry_id, "default");
    assert!(f.scheduler.pending_builds().is_empty());
}

#[tokio::test]
async fn build_waits_for_a_builder_and_can_be_removed() {
    let f = fleet(&[1], &[]).await;
    let ticket = f.scheduler.submit_build(BuildRequest {
        builder_id: "shop".into(),
        ..Default::default()
    });
    let id = ticket.id().to_string();

    eventually("build to miss", || {
        f.scheduler
            .pending_builds()
            .first()
            .is_some_and(|e| e.item.misses >= 1 && !e.item.in_progress)
    })
    .await;

    assert!(f.scheduler.remove_build_request(&id));
    assert!(matches!(ticket.wait().await, Err(SchedulerError::Removed(_))));
    assert!(f.scheduler.pending_builds().is_empty());
}

#[tokio::test]
async fn deleted_engine_is_destroyed() {
    let f = fleet(&[1], &[]).await;
    let engine = f.engine();

    f.registry.engines.delete("e1").await.unwrap();
    eventually("controller dropped", || { f.scheduler.engine("e1").is_none() }).await;
    assert_eq!(engine.status(), EngineStatus::Removed);
    assert!(f.scheduler.engines().is_empty());
}

#[tokio::test]
async fn shutdown_closes_pending_tickets() {
    let f = fleet(&[1], &[]).await;
    let ticket = f.scheduler.submit_deploy(two_clone_request());

    f.scheduler.shutdown().await;
    assert!(matches!(ticket.wait().await, Err(SchedulerError::Closed)));
    assert!(f.scheduler.engines().is_empty());
}
