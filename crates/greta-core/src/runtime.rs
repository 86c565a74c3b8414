//! One full run of the bot: startup, supervised background work, teardown.
//!
//! Startup order:
//! 1. worker scheduler, supervisor, bridge, relay; client identity; handlers
//!    and commands registered on the hub
//! 2. storage `connect` + `create_schema` (offloaded)
//! 3. gate -> Ready
//! 4. background tasks: chat client, status updater, log consumer, quote seeding
//!
//! Teardown (inside [`TaskSupervisor`], once): gate -> ShuttingDown, relay send
//! side closed, storage closed, relay detached from logging.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use crate::{
    app::{BotContext, BotContextParts},
    bridge::{Bridge, SchedulerKind, WorkerScheduler},
    commands::CommandRegistry,
    config::Config,
    domain::ChatId,
    events::EventHub,
    gate::ReadinessGate,
    handlers,
    logging::{self, INTERNAL_TARGET},
    ports::ChatClient,
    relay::{self, LogSink},
    retry::{RetryAttempt, RunExit},
    store::{QuoteStore, QuoteStoreHandle},
    supervisor::TaskSupervisor,
    Error, Result,
};

pub const STATUS_LINES: &[&str] = &[
    "guarding the quote jar",
    "counting emoticons \\o/",
    "planning to take over the world >:)",
    "reading the logs so you don't have to",
    "poking the other bots :p",
    "practising my yes/no questions",
];

/// Everything a run needs that outlives it.
pub struct RunDeps {
    pub config: Arc<Config>,
    pub client: Arc<dyn ChatClient>,
    pub store: Arc<dyn QuoteStore>,
    /// Cancelled on OS signals; ends the current run and the retry loop.
    pub shutdown: CancellationToken,
}

/// Runs the bot once. Must be called on the client scheduler.
pub async fn run_once(deps: &RunDeps, attempt: RetryAttempt) -> Result<RunExit> {
    if let Some(prev) = &attempt.last_error {
        tracing::info!(attempt = attempt.attempt_number, previous = %prev, "starting run");
    } else {
        tracing::info!(attempt = attempt.attempt_number, "starting run");
    }

    let config = deps.config.clone();
    let worker = WorkerScheduler::start("greta-worker")?;
    let gate = Arc::new(ReadinessGate::new());
    let mut sup = TaskSupervisor::new(
        gate.clone(),
        Handle::current(),
        worker.handle(),
        deps.shutdown.child_token(),
    );
    let scope = sup.scope_token();
    let bridge = Bridge::new(
        Handle::current(),
        worker.handle(),
        scope.clone(),
        sup.detached(),
    );
    let store = QuoteStoreHandle::new(deps.store.clone());

    // Teardown steps are registered before anything that can fail.
    let (relay_tx, relay_rx) = relay::log_relay(config.log_relay_capacity);
    logging::relay_slot().attach(relay_tx.clone());
    sup.on_teardown("close-relay", async move {
        relay_tx.close();
        tracing::debug!(target: INTERNAL_TARGET, dropped = relay_tx.dropped(), "log relay closed");
        Ok(())
    });
    let closing = store.clone();
    sup.on_teardown("close-store", async move { closing.close().await });
    sup.on_teardown("detach-relay", async move {
        logging::relay_slot().detach();
        Ok(())
    });

    let ctx = match startup(deps, &config, &gate, &bridge, &store, &scope).await {
        Ok(ctx) => ctx,
        Err(e) => {
            sup.teardown().await;
            stop_worker(worker).await;
            return Err(e);
        }
    };

    spawn_background(&mut sup, deps, &ctx, relay_rx);
    tracing::info!(username = %ctx.identity().username, "bot is up");

    let outcome = sup.run().await;
    stop_worker(worker).await;
    outcome?;

    if deps.shutdown.is_cancelled() {
        return Ok(RunExit::Shutdown);
    }
    Ok(ctx.requested_exit())
}

async fn startup(
    deps: &RunDeps,
    config: &Arc<Config>,
    gate: &Arc<ReadinessGate>,
    bridge: &Bridge,
    store: &QuoteStoreHandle,
    scope: &CancellationToken,
) -> Result<BotContext> {
    let identity = deps.client.identity().await?;
    tracing::info!(username = %identity.username, user_id = identity.user_id.0, "logged in");

    let hub = Arc::new(EventHub::new());
    let ctx = BotContext::new(BotContextParts {
        config: config.clone(),
        gate: gate.clone(),
        bridge: bridge.clone(),
        client: deps.client.clone(),
        hub: hub.clone(),
        store: store.clone(),
        identity,
        scope: scope.clone(),
    });
    let commands = Arc::new(CommandRegistry::with_builtins(config.command_prefix.clone()));
    handlers::register_all(&hub, &ctx, commands);

    store.connect().await?;
    store.create_schema().await?;
    tracing::debug!(path = %config.db_path.display(), "quote store ready");

    gate.set_ready();
    Ok(ctx)
}

fn spawn_background(
    sup: &mut TaskSupervisor,
    deps: &RunDeps,
    ctx: &BotContext,
    relay_rx: relay::LogReceiver,
) {
    let client = deps.client.clone();
    let hub = ctx.hub().clone();
    sup.spawn_on(SchedulerKind::Client, "chat-client", move |cancel| async move {
        client.run(hub, cancel.clone()).await?;
        if cancel.is_cancelled() {
            Ok(())
        } else {
            Err(Error::Transport("chat client stopped unexpectedly".to_string()))
        }
    });

    let status_ctx = ctx.clone();
    sup.spawn("status-updater", move |cancel| status_updater(status_ctx, cancel));

    let sink: Arc<dyn LogSink> = Arc::new(ChatLogSink {
        ctx: ctx.clone(),
        chat: deps.config.log_chat,
    });
    let gate = ctx.gate().clone();
    let interval = deps.config.log_relay_interval;
    sup.spawn("log-consumer", move |cancel| {
        relay::drain(relay_rx, gate, sink, interval, cancel)
    });

    let seed_ctx = ctx.clone();
    sup.spawn("seed-quotes", move |_cancel| async move {
        let added = seed_ctx.store().seed_global_quotes().await?;
        tracing::debug!(added, "global quotes checked");
        Ok(())
    });
}

/// Rotates the status line every period while the gate reads Ready.
pub async fn status_updater(ctx: BotContext, cancel: CancellationToken) -> Result<()> {
    let cfg = ctx.config();
    if !sleep_or_cancel(cfg.status_initial_delay, &cancel).await {
        return Ok(());
    }

    let mut next = 0usize;
    loop {
        if ctx.gate().is_ready() {
            let line = STATUS_LINES[next % STATUS_LINES.len()];
            next += 1;
            match ctx.set_status_text_both(line).await {
                Ok(()) => tracing::debug!(status = line, "status updated"),
                Err(Error::Cancelled) => return Ok(()),
                Err(e) if e.is_recoverable() => return Err(e),
                Err(e) => tracing::warn!(error = %e, "status update failed"),
            }
        }
        if !sleep_or_cancel(cfg.status_period, &cancel).await {
            return Ok(());
        }
    }
}

async fn sleep_or_cancel(d: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(d) => true,
    }
}

async fn stop_worker(worker: WorkerScheduler) {
    if let Err(e) = worker.shutdown().await {
        tracing::warn!(error = %e, "worker scheduler did not stop cleanly");
    }
}

/// Forwards relayed log lines to the log chat, if one is configured.
struct ChatLogSink {
    ctx: BotContext,
    chat: Option<ChatId>,
}

#[async_trait]
impl LogSink for ChatLogSink {
    async fn forward(&self, text: &str) -> Result<()> {
        match self.chat {
            Some(chat) => self.ctx.send_message_both(chat, text).await,
            None => Ok(()),
        }
    }
}
