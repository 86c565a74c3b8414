//! Cross-scheduler bridge.
//!
//! The bot runs two independent tokio runtimes:
//! - the **client** scheduler: the process runtime that hosts the chat client
//!   and delivers its event callbacks;
//! - the **worker** scheduler: a current-thread runtime on its own OS thread
//!   that hosts the supervised background tasks.
//!
//! [`Bridge::call`] lets a routine on one scheduler await a routine that must run
//! on the other. Detection is a task-local lookup; every future the bridge or the
//! supervisor places on a runtime is wrapped in [`SchedulerKind::scope`]. Unscoped
//! code on the worker thread or its blocking pool is recognised by a thread-local
//! flag set when those threads start.
//!
//! ```text
//!   caller on A ── call(B, f) ──► spawn scope(B, f()) on B ──► JoinHandle
//!        ▲                                                        │
//!        └──────────── value / resumed panic / Cancelled ◄────────┘
//! ```

use std::{cell::Cell, future::Future, thread, time::Duration};

use tokio::{runtime::Handle, sync::oneshot, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{logging::INTERNAL_TARGET, supervisor::DetachedSpawner, Error, Result};

tokio::task_local! {
    static CURRENT: SchedulerKind;
}

thread_local! {
    static ON_WORKER: Cell<bool> = const { Cell::new(false) };
}

fn mark_worker_thread() {
    ON_WORKER.with(|flag| flag.set(true));
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SchedulerKind {
    Client,
    Worker,
}

impl SchedulerKind {
    /// Which scheduler the calling code is running under, if any.
    ///
    /// An explicit scope wins. Otherwise threads owned by the worker runtime
    /// count as the worker, and any other runtime thread is the client: tasks
    /// spawned by the chat client library live on the process runtime.
    pub fn current() -> Option<SchedulerKind> {
        if let Ok(kind) = CURRENT.try_with(|k| *k) {
            return Some(kind);
        }
        if ON_WORKER.with(Cell::get) {
            return Some(SchedulerKind::Worker);
        }
        Handle::try_current().ok().map(|_| SchedulerKind::Client)
    }

    /// Marks `fut` as running under this scheduler.
    pub fn scope<F: Future>(self, fut: F) -> impl Future<Output = F::Output> {
        CURRENT.scope(self, fut)
    }
}

/// The worker scheduler: a current-thread runtime driven by a dedicated thread.
pub struct WorkerScheduler {
    handle: Handle,
    stop: Option<oneshot::Sender<()>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl WorkerScheduler {
    pub fn start(name: &str) -> Result<Self> {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .thread_name(format!("{name}-blocking"))
            .on_thread_start(mark_worker_thread)
            .build()
            .map_err(|e| Error::WorkerRuntime(e.to_string()))?;
        let handle = rt.handle().clone();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();

        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                mark_worker_thread();
                rt.block_on(SchedulerKind::Worker.scope(async {
                    let _ = stop_rx.await;
                }));
                // Tasks still parked on the worker are dropped here.
                rt.shutdown_timeout(Duration::from_secs(1));
            })
            .map_err(|e| Error::WorkerRuntime(e.to_string()))?;

        Ok(Self {
            handle,
            stop: Some(stop_tx),
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> Handle {
        self.handle.clone()
    }

    /// Stops the worker runtime and joins its thread without blocking the caller's runtime.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };
        tokio::task::spawn_blocking(move || thread.join())
            .await
            .map_err(|e| Error::WorkerRuntime(e.to_string()))?
            .map_err(|_| Error::WorkerRuntime("worker thread panicked".to_string()))
    }
}

impl Drop for WorkerScheduler {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

/// Aborts the remote half of a marshalled call when the caller goes away.
struct RemoteCall<T>(JoinHandle<T>);

impl<T> Drop for RemoteCall<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[derive(Clone)]
pub struct Bridge {
    client: Handle,
    worker: Handle,
    scope: CancellationToken,
    detached: DetachedSpawner,
}

impl Bridge {
    pub fn new(
        client: Handle,
        worker: Handle,
        scope: CancellationToken,
        detached: DetachedSpawner,
    ) -> Self {
        Self {
            client,
            worker,
            scope,
            detached,
        }
    }

    pub fn handle(&self, kind: SchedulerKind) -> &Handle {
        match kind {
            SchedulerKind::Client => &self.client,
            SchedulerKind::Worker => &self.worker,
        }
    }

    /// Runs `f` on `target` and returns its output to the caller.
    ///
    /// The callee's output is passed through untouched, so a callee returning
    /// `Result<T, E>` yields that exact `Result` inside the bridge's `Ok`. A panic in
    /// the callee is resumed in the caller. When no scheduler is active the work
    /// is detached onto the supervisor and [`Error::Detached`] is returned.
    pub async fn call<F, Fut, T>(&self, target: SchedulerKind, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        match SchedulerKind::current() {
            Some(kind) if kind == target => Ok(f().await),
            Some(_) => self.marshal(target, f).await,
            None => {
                tracing::warn!(
                    target: INTERNAL_TARGET,
                    ?target,
                    "bridge called outside any scheduler; detaching"
                );
                self.detach(target, async move {
                    let _ = f().await;
                });
                Err(Error::Detached)
            }
        }
    }

    async fn marshal<F, Fut, T>(&self, target: SchedulerKind, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        if self.scope.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let mut remote = RemoteCall(
            self.handle(target)
                .spawn(target.scope(async move { f().await })),
        );

        tokio::select! {
            res = &mut remote.0 => match res {
                Ok(v) => Ok(v),
                Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                Err(_) if self.scope.is_cancelled() => Err(Error::Cancelled),
                Err(_) => Err(Error::SchedulerGone(target)),
            },
            _ = self.scope.cancelled() => Err(Error::Cancelled),
        }
    }

    /// Fire-and-forget entry point for synchronous call sites.
    ///
    /// Never fails loudly: if the supervisor is already closed the work is dropped
    /// and the failure is logged.
    pub fn submit<Fut>(&self, target: SchedulerKind, fut: Fut)
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        if SchedulerKind::current().is_none() {
            tracing::warn!(
                target: INTERNAL_TARGET,
                ?target,
                "submit called outside any scheduler; detaching"
            );
        }
        self.detach(target, fut);
    }

    fn detach<Fut>(&self, target: SchedulerKind, fut: Fut)
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        if let Err(e) = self
            .detached
            .spawn_on(self.handle(target), target.scope(fut))
        {
            tracing::warn!(
                target: INTERNAL_TARGET,
                error = %e,
                "dropping detached work"
            );
        }
    }
}

/// Runs blocking work on the current runtime's blocking pool and awaits it.
pub async fn offload<F, T>(f: F) -> Result<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    if Handle::try_current().is_err() {
        return Err(Error::NoScheduler);
    }
    match tokio::task::spawn_blocking(f).await {
        Ok(v) => Ok(v),
        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
        Err(_) => Err(Error::Cancelled),
    }
}
