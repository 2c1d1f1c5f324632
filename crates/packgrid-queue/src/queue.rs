//! TaskQueue: bounded, FIFO, cancellable execution of async work units.
//!
//! A unit is posted with a kind, free-form JSON params and a closure that
//! builds its future. At most `limit` units run at once; the rest wait in
//! arrival order. Every unit runs on its own spawned task, so posting never
//! executes work on the caller's stack.
//!
//! Results are published through a `watch` channel, which lets any number
//! of waiters share one unit: that is how identical pending work (two pulls
//! of the same image) is collapsed onto a single execution.

use std::any::Any;
use std::collections::VecDeque;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::{TaskError, TaskResult};

type TaskOutput = Arc<dyn Any + Send + Sync>;
type Outcome = Option<TaskResult<TaskOutput>>;
type BoxTask = Pin<Box<dyn Future<Output = anyhow::Result<TaskOutput>> + Send>>;
type TaskFactory = Box<dyn FnOnce() -> BoxTask + Send>;

/// Description of a queued or running unit, used for lookups.
#[derive(Debug, Clone)]
pub struct TaskInfo {
    pub id: String,
    pub kind: String,
    pub params: serde_json::Value,
    pub queued_at: Instant,
}

struct Pending {
    info: TaskInfo,
    factory: TaskFactory,
    tx: watch::Sender<Outcome>,
}

struct Running {
    info: TaskInfo,
    rx: watch::Receiver<Outcome>,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Pending>,
    running: Vec<Running>,
    disabled: bool,
}

struct QueueInner {
    name: String,
    limit: usize,
    id_prefix: u64,
    next_id: AtomicU64,
    state: Mutex<QueueState>,
}

/// Snapshot of a queue's load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: usize,
    pub running: usize,
    pub disabled: bool,
}

/// Cheaply cloneable handle to a bounded queue.
#[derive(Clone)]
pub struct TaskQueue {
    inner: Arc<QueueInner>,
}

impl TaskQueue {
    /// Create an enabled queue running at most `limit` units at once.
    pub fn new(name: impl Into<String>, limit: usize) -> Self {
        let id_prefix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            inner: Arc::new(QueueInner {
                name: name.into(),
                limit: limit.max(1),
                id_prefix,
                next_id: AtomicU64::new(1),
                state: Mutex::new(QueueState::default()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn limit(&self) -> usize {
        self.inner.limit
    }

    /// Enqueue a unit. The returned handle resolves with its outcome.
    ///
    /// Units posted while the queue is stopped wait until `start()`, or are
    /// cancelled by the next `stop()`.
    pub fn post<T, E, F, Fut>(
        &self,
        kind: &str,
        params: serde_json::Value,
        task: F,
    ) -> TaskHandle<T>
    where
        T: Clone + Send + Sync + 'static,
        E: Into<anyhow::Error> + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let handle = {
            let mut state = self.inner.state.lock();
            self.enqueue(&mut state, kind, params, task)
        };
        self.inner.pump();
        handle
    }

    /// Return the waiting unit matching `pred`, or post a new one.
    ///
    /// Lookup and insertion happen under one lock, so two racing callers
    /// can never both enqueue.
    pub fn post_unique<T, E, F, Fut>(
        &self,
        kind: &str,
        params: serde_json::Value,
        pred: impl Fn(&TaskInfo) -> bool,
        task: F,
    ) -> TaskHandle<T>
    where
        T: Clone + Send + Sync + 'static,
        E: Into<anyhow::Error> + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let handle = {
            let mut state = self.inner.state.lock();
            match find_pending(&state, &pred) {
                Some(existing) => {
                    debug!(queue = %self.inner.name, %kind, id = %existing.id, "joining queued task");
                    return existing;
                }
                None => self.enqueue(&mut state, kind, params, task),
            }
        };
        self.inner.pump();
        handle
    }

    /// Post only when no queued or running unit matches `pred`.
    ///
    /// Returns `None` when a matching unit already exists.
    pub fn try_post<T, E, F, Fut>(
        &self,
        kind: &str,
        params: serde_json::Value,
        pred: impl Fn(&TaskInfo) -> bool,
        task: F,
    ) -> Option<TaskHandle<T>>
    where
        T: Clone + Send + Sync + 'static,
        E: Into<anyhow::Error> + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let handle = {
            let mut state = self.inner.state.lock();
            let busy = state.pending.iter().any(|p| pred(&p.info))
                || state.running.iter().any(|r| pred(&r.info));
            if busy {
                return None;
            }
            self.enqueue(&mut state, kind, params, task)
        };
        self.inner.pump();
        Some(handle)
    }

    fn enqueue<T, E, F, Fut>(
        &self,
        state: &mut QueueState,
        kind: &str,
        params: serde_json::Value,
        task: F,
    ) -> TaskHandle<T>
    where
        T: Clone + Send + Sync + 'static,
        E: Into<anyhow::Error> + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let n = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let info = TaskInfo {
            id: format!("{}_{n}", self.inner.id_prefix),
            kind: kind.to_string(),
            params,
            queued_at: Instant::now(),
        };
        let (tx, rx) = watch::channel(None);
        let factory: TaskFactory = Box::new(move || {
            Box::pin(async move {
                task()
                    .await
                    .map(|v| Arc::new(v) as TaskOutput)
                    .map_err(Into::into)
            })
        });

        debug!(queue = %self.inner.name, %kind, id = %info.id, "task queued");
        let handle = TaskHandle::new(info.id.clone(), info.kind.clone(), rx);
        state.pending.push_back(Pending { info, factory, tx });
        handle
    }

    /// Find a unit that has not started yet.
    pub fn find_in_queue<T>(&self, pred: impl Fn(&TaskInfo) -> bool) -> Option<TaskHandle<T>> {
        find_pending(&self.inner.state.lock(), &pred)
    }

    /// Find a unit that is queued or currently running.
    pub fn find_in_progress<T>(&self, pred: impl Fn(&TaskInfo) -> bool) -> Option<TaskHandle<T>> {
        let state = self.inner.state.lock();
        if let Some(found) = find_pending(&state, &pred) {
            return Some(found);
        }
        state
            .running
            .iter()
            .find(|r| pred(&r.info))
            .map(|r| TaskHandle::new(r.info.id.clone(), r.info.kind.clone(), r.rx.clone()))
    }

    /// Drop a unit that has not started; its waiters see `Removed`.
    pub fn remove_task(&self, id: &str) -> bool {
        let removed = {
            let mut state = self.inner.state.lock();
            let pos = state.pending.iter().position(|p| p.info.id == id);
            pos.and_then(|pos| state.pending.remove(pos))
        };
        match removed {
            Some(p) => {
                p.tx.send_replace(Some(Err(TaskError::Removed {
                    kind: p.info.kind.clone(),
                })));
                true
            }
            None => false,
        }
    }

    /// Disable the queue, cancel every unit not yet started, and wait for
    /// the running ones to finish.
    pub async fn stop(&self) {
        let (cancelled, mut running) = {
            let mut state = self.inner.state.lock();
            state.disabled = true;
            let cancelled: Vec<Pending> = state.pending.drain(..).collect();
            let running: Vec<watch::Receiver<Outcome>> =
                state.running.iter().map(|r| r.rx.clone()).collect();
            (cancelled, running)
        };

        if !cancelled.is_empty() || !running.is_empty() {
            debug!(
                queue = %self.inner.name,
                cancelled = cancelled.len(),
                running = running.len(),
                "queue stopping"
            );
        }

        for p in cancelled {
            p.tx.send_replace(Some(Err(TaskError::Cancelled {
                kind: p.info.kind.clone(),
            })));
        }
        for rx in running.iter_mut() {
            // A closed channel means the unit is gone already.
            let _ = rx.wait_for(|o| o.is_some()).await;
        }
    }

    /// Re-enable the queue and resume scheduling.
    pub fn start(&self) {
        self.inner.state.lock().disabled = false;
        self.inner.pump();
    }

    pub fn is_disabled(&self) -> bool {
        self.inner.state.lock().disabled
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.inner.state.lock();
        QueueStats {
            pending: state.pending.len(),
            running: state.running.len(),
            disabled: state.disabled,
        }
    }
}

fn find_pending<T>(state: &QueueState, pred: &impl Fn(&TaskInfo) -> bool) -> Option<TaskHandle<T>> {
    state
        .pending
        .iter()
        .find(|p| pred(&p.info))
        .map(|p| TaskHandle::new(p.info.id.clone(), p.info.kind.clone(), p.tx.subscribe()))
}

impl QueueInner {
    /// Start as many pending units as the limit allows.
    fn pump(self: &Arc<Self>) {
        loop {
            let next = {
                let mut state = self.state.lock();
                if state.disabled || state.running.len() >= self.limit {
                    None
                } else {
                    state.pending.pop_front().inspect(|p| {
                        state.running.push(Running {
                            info: p.info.clone(),
                            rx: p.tx.subscribe(),
                        });
                    })
                }
            };
            match next {
                Some(unit) => {
                    let inner = Arc::clone(self);
                    tokio::spawn(async move { inner.run(unit).await });
                }
                None => break,
            }
        }
    }

    async fn run(self: Arc<Self>, unit: Pending) {
        let Pending { info, factory, tx } = unit;
        let started = Instant::now();
        debug!(
            queue = %self.name,
            kind = %info.kind,
            id = %info.id,
            waited_ms = started.duration_since(info.queued_at).as_millis() as u64,
            "task started"
        );

        let outcome = match tokio::spawn(factory()).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(error)) => {
                warn!(queue = %self.name, kind = %info.kind, id = %info.id, error = %error, "task failed");
                Err(TaskError::Failed {
                    kind: info.kind.clone(),
                    error: Arc::new(error),
                })
            }
            Err(join) => {
                warn!(queue = %self.name, kind = %info.kind, id = %info.id, error = %join, "task panicked");
                Err(TaskError::Panicked {
                    kind: info.kind.clone(),
                })
            }
        };

        debug!(
            queue = %self.name,
            kind = %info.kind,
            id = %info.id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            ok = outcome.is_ok(),
            "task finished"
        );

        self.state.lock().running.retain(|r| r.info.id != info.id);
        tx.send_replace(Some(outcome));
        self.pump();
    }
}

/// Awaitable outcome of a posted unit. Clones share the same unit.
pub struct TaskHandle<T> {
    id: String,
    kind: String,
    rx: watch::Receiver<Outcome>,
    _output: PhantomData<fn() -> T>,
}

impl<T> Clone for TaskHandle<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            kind: self.kind.clone(),
            rx: self.rx.clone(),
            _output: PhantomData,
        }
    }
}

impl<T> std::fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}

impl<T> TaskHandle<T> {
    fn new(id: String, kind: String, rx: watch::Receiver<Outcome>) -> Self {
        Self {
            id,
            kind,
            rx,
            _output: PhantomData,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn is_finished(&self) -> bool {
        self.rx.borrow().is_some()
    }
}

impl<T: Clone + Send + Sync + 'static> TaskHandle<T> {
    /// Wait for the unit to finish and return its value.
    pub async fn wait(mut self) -> TaskResult<T> {
        let outcome = match self.rx.wait_for(|o| o.is_some()).await {
            Ok(outcome) => outcome.clone(),
            Err(_) => {
                return Err(TaskError::Dropped {
                    kind: self.kind.clone(),
                });
            }
        };
        match outcome {
            Some(Ok(value)) => value
                .downcast_ref::<T>()
                .cloned()
                .ok_or(TaskError::OutputType { kind: self.kind }),
            Some(Err(e)) => Err(e),
            None => Err(TaskError::Dropped { kind: self.kind }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use serde_json::json;
    use tokio::sync::oneshot;

    type Log = Arc<Mutex<Vec<String>>>;

    fn logging_task(
        log: Log,
        name: &'static str,
        ms: u64,
    ) -> impl FnOnce() -> Pin<Box<dyn Future<Output = anyhow::Result<&'static str>> + Send>> {
        move || {
            Box::pin(async move {
                log.lock().push(format!("start {name}"));
                tokio::time::sleep(Duration::from_millis(ms)).await;
                log.lock().push(format!("end {name}"));
                Ok(name)
            })
        }
    }

    /// A unit that runs until the returned sender fires.
    fn gate() -> (
        oneshot::Sender<()>,
        impl FnOnce() -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>,
    ) {
        let (tx, rx) = oneshot::channel::<()>();
        (tx, move || {
            Box::pin(async move {
                let _ = rx.await;
                Ok(())
            })
        })
    }

    #[tokio::test]
    async fn test_limit_one_runs_fifo_without_overlap() {
        let q = TaskQueue::new("test", 1);
        let log: Log = Arc::default();

        let h1 = q.post("t", json!(1), logging_task(log.clone(), "t1", 30));
        let h2 = q.post("t", json!(2), logging_task(log.clone(), "t2", 5));
        let h3 = q.post("t", json!(3), logging_task(log.clone(), "t3", 1));

        assert_eq!(h3.wait().await.unwrap(), "t3");
        assert_eq!(h1.wait().await.unwrap(), "t1");
        assert_eq!(h2.wait().await.unwrap(), "t2");
        assert_eq!(
            *log.lock(),
            vec!["start t1", "end t1", "start t2", "end t2", "start t3", "end t3"]
        );
    }

    #[tokio::test]
    async fn test_concurrency_ceiling_is_respected() {
        let q = TaskQueue::new("test", 2);
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..6)
            .map(|i| {
                let active = active.clone();
                let peak = peak.clone();
                q.post("work", json!(i), move || async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, anyhow::Error>(i)
                })
            })
            .collect();

        for (i, h) in handles.into_iter().enumerate() {
            assert_eq!(h.wait().await.unwrap(), i);
        }
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_identical_pending_pull_is_shared() {
        let q = TaskQueue::new("images", 1);
        let (release, blocker) = gate();
        let blocking = q.post("pull", json!({"image": "busy"}), blocker);

        let runs = Arc::new(AtomicUsize::new(0));
        let pull = |image: &str| {
            let runs = runs.clone();
            let wanted = image.to_string();
            q.post_unique(
                "pull",
                json!({ "image": image }),
                move |t| t.kind == "pull" && t.params["image"] == wanted.as_str(),
                move || async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, anyhow::Error>("pulled".to_string())
                },
            )
        };

        let a = pull("alpine:latest");
        let b = pull("alpine:latest");
        assert_eq!(a.id(), b.id());
        assert_eq!(q.stats().pending, 1);

        let found: TaskHandle<String> = q
            .find_in_queue(|t| t.params["image"] == "alpine:latest")
            .unwrap();
        assert_eq!(found.id(), a.id());

        release.send(()).unwrap();
        blocking.wait().await.unwrap();
        assert_eq!(a.wait().await.unwrap(), "pulled");
        assert_eq!(b.wait().await.unwrap(), "pulled");
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_find_in_progress_sees_running_units() {
        let q = TaskQueue::new("other", 1);
        let (release, blocker) = gate();
        let running = q.post("list_containers", json!(null), blocker);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(q.find_in_queue::<()>(|t| t.kind == "list_containers").is_none());
        let found: TaskHandle<()> = q
            .find_in_progress(|t| t.kind == "list_containers")
            .unwrap();
        assert_eq!(found.id(), running.id());

        release.send(()).unwrap();
        found.wait().await.unwrap();
        assert!(q.find_in_progress::<()>(|_| true).is_none());
    }

    #[tokio::test]
    async fn test_stop_cancels_pending_and_drains_running() {
        let q = TaskQueue::new("test", 1);
        let log: Log = Arc::default();

        let running = q.post("slow", json!(null), logging_task(log.clone(), "slow", 30));
        let queued = q.post("queued", json!(null), logging_task(log.clone(), "queued", 1));
        tokio::time::sleep(Duration::from_millis(5)).await;

        q.stop().await;
        assert!(running.is_finished());
        assert_eq!(*log.lock(), vec!["start slow", "end slow"]);
        assert!(matches!(
            queued.wait().await,
            Err(TaskError::Cancelled { kind }) if kind == "queued"
        ));

        let parked = q.post("later", json!(null), logging_task(log.clone(), "later", 1));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!parked.is_finished());
        q.start();
        assert_eq!(parked.wait().await.unwrap(), "later");
    }

    #[tokio::test]
    async fn test_failure_rejects_only_that_unit() {
        let q = TaskQueue::new("test", 1);
        let bad = q.post("boom", json!(null), || async {
            Err::<(), _>(anyhow::anyhow!("daemon said no"))
        });
        let good = q.post("fine", json!(null), || async { Ok::<_, anyhow::Error>(7u32) });

        let err = bad.wait().await.unwrap_err();
        assert!(err.to_string().contains("daemon said no"));
        assert!(err.failure().is_some());
        assert_eq!(good.wait().await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_panicking_unit_is_reported() {
        let q = TaskQueue::new("test", 1);
        let h = q.post("panic", json!(null), || async {
            if true {
                panic!("oops");
            }
            Ok::<(), anyhow::Error>(())
        });
        assert!(matches!(h.wait().await, Err(TaskError::Panicked { .. })));

        let after = q.post("after", json!(null), || async { Ok::<_, anyhow::Error>(()) });
        after.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_try_post_refuses_duplicates_while_running() {
        let q = TaskQueue::new("packs", 4);
        let (release, blocker) = gate();
        let is_remove = |t: &TaskInfo| t.kind == "pack_remove" && t.params["pack_id"] == "1_e1";

        let first = q
            .try_post("pack_remove", json!({"pack_id": "1_e1"}), is_remove, blocker)
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(
            q.try_post("pack_remove", json!({"pack_id": "1_e1"}), is_remove, || async {
                Ok::<_, anyhow::Error>(())
            })
            .is_none()
        );

        release.send(()).unwrap();
        first.wait().await.unwrap();
        assert!(
            q.try_post("pack_remove", json!({"pack_id": "1_e1"}), is_remove, || async {
                Ok::<_, anyhow::Error>(())
            })
            .is_some()
        );
    }

    #[tokio::test]
    async fn test_remove_task_rejects_waiters() {
        let q = TaskQueue::new("test", 1);
        let (release, blocker) = gate();
        let _busy = q.post("busy", json!(null), blocker);
        let victim = q.post("victim", json!(null), || async { Ok::<_, anyhow::Error>(()) });

        assert!(q.remove_task(victim.id()));
        assert!(!q.remove_task(victim.id()));
        assert!(matches!(victim.wait().await, Err(TaskError::Removed { .. })));
        release.send(()).unwrap();
    }
}
