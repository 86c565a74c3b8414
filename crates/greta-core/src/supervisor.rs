//! Task supervisor: one scope per run of the bot.
//!
//! ```text
//!   spawn_on(kind, name, routine) ──► JoinSet, task placed on `kind`
//!                                       │ (own token, kept in the running table)
//!   scope token cancelled ──────────────┤
//!     (command, signal,                 ├─► gate := ShuttingDown
//!      failing task)                    └─► each running task's token cancelled
//!
//!   run(): join every task ─► teardown steps in order ─► first error
//! ```
//!
//! The scope token is what the outside world cancels. Task tokens are only
//! cancelled by the supervisor, after the gate reads ShuttingDown, so no task
//! ever observes cancellation while producers are still allowed to emit.

use std::{
    collections::HashMap,
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

use tokio::{runtime::Handle, task::JoinSet};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::{
    bridge::SchedulerKind, gate::ReadinessGate, logging::INTERNAL_TARGET, Error, Result,
};

type TeardownStep = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// Fire-and-forget work tracked by the supervisor.
///
/// Used by the bridge when a call site has no scheduler. Work is dropped once
/// the supervisor has closed.
#[derive(Clone)]
pub struct DetachedSpawner {
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl DetachedSpawner {
    pub fn new(tracker: TaskTracker, cancel: CancellationToken) -> Self {
        Self { tracker, cancel }
    }

    pub fn spawn_on<F>(&self, handle: &Handle, fut: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.tracker.is_closed() {
            return Err(Error::SupervisorClosed);
        }
        let cancel = self.cancel.clone();
        self.tracker.spawn_on(
            async move {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = fut => {}
                }
            },
            handle,
        );
        Ok(())
    }
}

/// A supervised task as seen from outside: its name and how to stop it.
#[derive(Clone, Debug)]
pub struct BackgroundTaskHandle {
    pub name: String,
    pub cancel: CancellationToken,
}

pub struct TaskSupervisor {
    gate: Arc<ReadinessGate>,
    client: Handle,
    worker: Handle,
    scope: CancellationToken,
    tracker: TaskTracker,
    set: JoinSet<(String, std::result::Result<Result<()>, tokio::task::JoinError>)>,
    running: Arc<Mutex<HashMap<u64, BackgroundTaskHandle>>>,
    next_id: AtomicU64,
    teardown: Vec<(&'static str, TeardownStep)>,
}

impl TaskSupervisor {
    /// `scope` is usually a child of the process shutdown token.
    pub fn new(
        gate: Arc<ReadinessGate>,
        client: Handle,
        worker: Handle,
        scope: CancellationToken,
    ) -> Self {
        Self {
            gate,
            client,
            worker,
            scope,
            tracker: TaskTracker::new(),
            set: JoinSet::new(),
            running: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
            teardown: Vec::new(),
        }
    }

    pub fn gate(&self) -> &Arc<ReadinessGate> {
        &self.gate
    }

    /// Cancelling this token asks the whole run to stop.
    pub fn scope_token(&self) -> CancellationToken {
        self.scope.clone()
    }

    pub fn detached(&self) -> DetachedSpawner {
        DetachedSpawner::new(self.tracker.clone(), self.scope.clone())
    }

    /// Starts `routine` on the worker scheduler as a member of this scope.
    ///
    /// The routine receives its own cancellation token and should return once it fires.
    pub fn spawn<F, Fut>(&mut self, name: &str, routine: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.spawn_on(SchedulerKind::Worker, name, routine);
    }

    pub fn spawn_on<F, Fut>(&mut self, kind: SchedulerKind, name: &str, routine: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let name = name.to_string();

        locked(&self.running).insert(
            id,
            BackgroundTaskHandle {
                name: name.clone(),
                cancel: cancel.clone(),
            },
        );
        // Started after the stop: it must see cancellation at once.
        if self.gate.is_shutting_down() {
            cancel.cancel();
        }

        let handle = match kind {
            SchedulerKind::Client => &self.client,
            SchedulerKind::Worker => &self.worker,
        };
        let inner = handle.spawn(kind.scope(routine(cancel)));
        let running = self.running.clone();
        self.set.spawn_on(
            async move {
                let out = AbortOnDrop(inner).join().await;
                locked(&running).remove(&id);
                (name, out)
            },
            handle,
        );
    }

    /// Names of the tasks that have not exited yet.
    pub fn running(&self) -> Vec<String> {
        let mut names: Vec<String> = locked(&self.running)
            .values()
            .map(|h| h.name.clone())
            .collect();
        names.sort();
        names
    }

    /// Registers a teardown step. Steps run once, in registration order, after
    /// every task has exited.
    pub fn on_teardown<Fut>(&mut self, step: &'static str, fut: Fut)
    where
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.teardown.push((step, Box::pin(fut)));
    }

    /// Waits for every task, tears down, and returns the first task error.
    pub async fn run(mut self) -> Result<()> {
        let mut first_error: Option<Error> = None;
        let mut stopping = false;

        loop {
            tokio::select! {
                biased;
                _ = self.scope.cancelled(), if !stopping => {
                    stopping = true;
                    tracing::debug!(
                        target: INTERNAL_TARGET,
                        tasks = ?self.running(),
                        "stopping background tasks"
                    );
                    self.stop_producers();
                }
                next = self.set.join_next() => {
                    let Some(joined) = next else { break };
                    let (name, out) = match joined {
                        Ok(v) => v,
                        Err(e) => ("supervisor".to_string(), Err(e)),
                    };
                    if let Some(err) = task_failure(&name, out) {
                        tracing::error!(task = %name, error = %err, "background task failed");
                        if first_error.is_none() {
                            first_error = Some(err);
                        }
                        self.scope.cancel();
                    } else {
                        tracing::debug!(task = %name, "background task finished");
                    }
                }
            }
        }

        self.scope.cancel();
        self.teardown().await;

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Runs the teardown steps without waiting for tasks. For runs that fail
    /// before any task was started.
    pub async fn teardown(mut self) {
        self.scope.cancel();
        self.stop_producers();
        self.set.shutdown().await;

        self.tracker.close();
        self.tracker.wait().await;

        for (step, fut) in self.teardown.drain(..) {
            match fut.await {
                Ok(()) => tracing::debug!(target: INTERNAL_TARGET, step, "teardown step done"),
                Err(e) => tracing::warn!(step, error = %e, "teardown step failed"),
            }
        }
    }

    fn stop_producers(&self) {
        self.gate.set_shutting_down();
        for task in locked(&self.running).values() {
            task.cancel.cancel();
        }
    }
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn task_failure(
    name: &str,
    out: std::result::Result<Result<()>, tokio::task::JoinError>,
) -> Option<Error> {
    match out {
        Ok(Ok(())) | Ok(Err(Error::Cancelled)) => None,
        Ok(Err(e)) => Some(e),
        Err(e) if e.is_panic() => Some(Error::TaskPanicked {
            name: name.to_string(),
        }),
        Err(_) => None,
    }
}

/// Aborts the inner task if its watcher is dropped before it finishes.
struct AbortOnDrop<T>(tokio::task::JoinHandle<T>);

impl<T> AbortOnDrop<T> {
    async fn join(mut self) -> std::result::Result<T, tokio::task::JoinError> {
        (&mut self.0).await
    }
}

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::WorkerScheduler;
    use std::time::Duration;

    fn supervisor() -> TaskSupervisor {
        TaskSupervisor::new(
            Arc::new(ReadinessGate::new()),
            Handle::current(),
            Handle::current(),
            CancellationToken::new(),
        )
    }

    fn log() -> Arc<Mutex<Vec<String>>> {
        Arc::new(Mutex::new(Vec::new()))
    }

    fn push(log: &Arc<Mutex<Vec<String>>>, entry: impl Into<String>) {
        log.lock().unwrap().push(entry.into());
    }

    #[tokio::test]
    async fn scope_exits_when_all_tasks_finish() {
        let mut sup = supervisor();
        let events = log();
        for i in 0..3 {
            let events = events.clone();
            sup.spawn(&format!("task-{i}"), move |_cancel| async move {
                push(&events, format!("task-{i} done"));
                Ok(())
            });
        }
        sup.run().await.unwrap();
        assert_eq!(events.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn failing_task_unwinds_siblings_before_teardown() {
        let mut sup = supervisor();
        let gate = sup.gate().clone();
        gate.set_ready();
        let events = log();

        for i in 0..4 {
            let events = events.clone();
            sup.spawn(&format!("sibling-{i}"), move |cancel| async move {
                cancel.cancelled().await;
                tokio::time::sleep(Duration::from_millis(5 * i)).await;
                push(&events, format!("sibling-{i} exited"));
                Ok(())
            });
        }
        let e = events.clone();
        sup.spawn("flaky", move |_cancel| async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            push(&e, "flaky failed");
            Err(Error::Transport("socket closed".into()))
        });
        let e = events.clone();
        sup.on_teardown("close-store", async move {
            push(&e, "store closed");
            Ok(())
        });

        let err = sup.run().await.unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
        assert!(gate.is_shutting_down());

        let events = events.lock().unwrap().clone();
        assert_eq!(events.len(), 6);
        assert_eq!(events.first().map(String::as_str), Some("flaky failed"));
        assert_eq!(events.last().map(String::as_str), Some("store closed"));
    }

    #[tokio::test]
    async fn gate_reads_shutting_down_before_tasks_see_cancellation() {
        let mut sup = supervisor();
        let gate = sup.gate().clone();
        gate.set_ready();
        let scope = sup.scope_token();

        let g = gate.clone();
        let (tx, rx) = tokio::sync::oneshot::channel();
        sup.spawn("observer", move |cancel| async move {
            cancel.cancelled().await;
            let _ = tx.send(g.is_shutting_down());
            Ok(())
        });

        scope.cancel();
        sup.run().await.unwrap();
        assert!(rx.await.unwrap());
    }

    #[tokio::test]
    async fn panicking_task_is_reported_by_name() {
        let mut sup = supervisor();
        sup.spawn("status-updater", |_cancel| async move {
            if true {
                panic!("boom");
            }
            Ok(())
        });
        let err = sup.run().await.unwrap_err();
        match err {
            Error::TaskPanicked { name } => assert_eq!(name, "status-updater"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn first_error_wins_and_cancelled_is_not_a_failure() {
        let mut sup = supervisor();
        sup.spawn("first", |_cancel| async move {
            Err(Error::Transport("first".into()))
        });
        sup.spawn("second", |cancel| async move {
            cancel.cancelled().await;
            tokio::time::sleep(Duration::from_millis(5)).await;
            Err(Error::Cancelled)
        });
        match sup.run().await {
            Err(Error::Transport(msg)) => assert_eq!(msg, "first"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn teardown_steps_run_in_order_and_swallow_errors() {
        let mut sup = supervisor();
        let events = log();
        for step in ["close-relay", "close-store", "flush-logs"] {
            let events = events.clone();
            sup.on_teardown(step, async move {
                push(&events, step);
                if step == "close-store" {
                    return Err(Error::Store("already closed".into()));
                }
                Ok(())
            });
        }
        sup.teardown().await;
        assert_eq!(
            *events.lock().unwrap(),
            vec!["close-relay", "close-store", "flush-logs"]
        );
    }

    #[tokio::test]
    async fn tasks_run_on_the_worker_scheduler() {
        let worker = WorkerScheduler::start("supervisor-test-worker").unwrap();
        let mut sup = TaskSupervisor::new(
            Arc::new(ReadinessGate::new()),
            Handle::current(),
            worker.handle(),
            CancellationToken::new(),
        );
        let report_where = || {
            let (tx, rx) = tokio::sync::oneshot::channel();
            let routine = move |_cancel: CancellationToken| async move {
                let _ = tx.send((
                    SchedulerKind::current(),
                    std::thread::current().name().map(str::to_string),
                ));
                Ok::<(), Error>(())
            };
            (routine, rx)
        };
        let (on_worker, worker_rx) = report_where();
        let (on_client, client_rx) = report_where();
        sup.spawn("worker-side", on_worker);
        sup.spawn_on(SchedulerKind::Client, "client-side", on_client);
        sup.run().await.unwrap();

        let (kind, thread) = worker_rx.await.unwrap();
        assert_eq!(kind, Some(SchedulerKind::Worker));
        assert_eq!(thread.as_deref(), Some("supervisor-test-worker"));
        let (kind, _) = client_rx.await.unwrap();
        assert_eq!(kind, Some(SchedulerKind::Client));
        worker.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn running_lists_live_tasks_and_stop_cancels_each_of_them() {
        let mut sup = supervisor();
        let gate = sup.gate().clone();
        let scope = sup.scope_token();
        let (started_tx, mut started_rx) = tokio::sync::mpsc::unbounded_channel();
        let events = log();

        for name in ["log-relay", "status-updater"] {
            let events = events.clone();
            let started = started_tx.clone();
            sup.spawn(name, move |cancel| async move {
                let _ = started.send(());
                cancel.cancelled().await;
                push(&events, format!("{name} stopped"));
                Ok(())
            });
        }
        sup.spawn("one-shot", |_cancel| async move { Ok(()) });
        started_rx.recv().await.unwrap();
        started_rx.recv().await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), async {
            while sup.running().len() > 2 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(sup.running(), vec!["log-relay", "status-updater"]);

        let running = sup.running.clone();
        scope.cancel();
        sup.run().await.unwrap();
        assert!(gate.is_shutting_down());
        assert!(running.lock().unwrap().is_empty());
        let mut stopped = events.lock().unwrap().clone();
        stopped.sort();
        assert_eq!(stopped, vec!["log-relay stopped", "status-updater stopped"]);
    }

    #[tokio::test]
    async fn task_spawned_after_stop_is_cancelled_at_once() {
        let mut sup = supervisor();
        sup.stop_producers();
        let (tx, rx) = tokio::sync::oneshot::channel();
        sup.spawn("late", move |cancel| async move {
            let _ = tx.send(cancel.is_cancelled());
            Ok(())
        });
        sup.run().await.unwrap();
        assert!(rx.await.unwrap());
    }

    #[tokio::test]
    async fn detached_work_stops_after_close() {
        let sup = supervisor();
        let spawner = sup.detached();
        let (tx, rx) = tokio::sync::oneshot::channel();
        spawner
            .spawn_on(&Handle::current(), async move {
                let _ = tx.send(());
            })
            .unwrap();
        rx.await.unwrap();

        sup.teardown().await;
        assert!(matches!(
            spawner.spawn_on(&Handle::current(), async {}),
            Err(Error::SupervisorClosed)
        ));
    }
}
