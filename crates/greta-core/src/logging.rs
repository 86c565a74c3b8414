use std::{fmt::Write as _, path::PathBuf, sync::Mutex};

use tracing::{
    field::{Field, Visit},
    Event, Level, Subscriber,
};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::Context, prelude::*, EnvFilter, Layer};

use crate::{relay::LogSender, Error, Result};

/// Target for bridge/relay internals. The relay layer never forwards it, so a
/// failing forward cannot feed itself.
pub const INTERNAL_TARGET: &str = "greta::internal";

/// Targets whose events would be produced by forwarding a relayed line.
const SKIPPED_TARGET_PREFIXES: &[&str] = &[INTERNAL_TARGET, "teloxide", "reqwest", "hyper"];

#[derive(Clone, Debug, Default)]
pub struct LogSettings {
    pub debug: bool,
    /// Directory for the daily-rotated log file; `None` disables file logging.
    pub log_dir: Option<PathBuf>,
}

/// Keeps the non-blocking file writer alive. Dropping it flushes pending lines.
pub struct LoggingGuard {
    _file: Option<WorkerGuard>,
}

impl LoggingGuard {
    pub fn flush(self) {}
}

/// Initialize logging/tracing for the bot.
///
/// Console output always, a rotating file when `log_dir` is set, and the relay
/// layer that mirrors INFO+ lines into the chat log channel of the active run.
pub fn init(service_name: &str, settings: &LogSettings) -> Result<LoggingGuard> {
    let default_level = if settings.debug { "debug" } else { "info" };

    // Default: info for our crates, warn for the chat client.
    // Can be overridden with `RUST_LOG`.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "{default_level},teloxide=warn,{service_name}={default_level}"
        ))
    });

    let (file_layer, file_guard) = match &settings.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::daily(dir, format!("{service_name}.log"));
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_ansi(false)
                .with_target(true)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(false)
                .with_ansi(true)
                .with_writer(std::io::stderr),
        )
        .with(file_layer)
        .with(RelayLayer::new(relay_slot()))
        .try_init()
        .map_err(|e| Error::Config(format!("logging already initialised: {e}")))?;

    Ok(LoggingGuard { _file: file_guard })
}

/// Process-wide attachment point for the relay of the current run.
///
/// Producers only ever `try_lock` it, so a contended slot drops the line
/// instead of waiting.
pub struct RelaySlot {
    sender: Mutex<Option<LogSender>>,
}

static RELAY_SLOT: RelaySlot = RelaySlot::new();

pub fn relay_slot() -> &'static RelaySlot {
    &RELAY_SLOT
}

impl RelaySlot {
    pub const fn new() -> Self {
        Self {
            sender: Mutex::new(None),
        }
    }

    pub fn attach(&self, sender: LogSender) {
        if let Ok(mut slot) = self.sender.lock() {
            *slot = Some(sender);
        }
    }

    pub fn detach(&self) -> Option<LogSender> {
        self.sender.lock().ok().and_then(|mut slot| slot.take())
    }

    pub fn try_send(&self, text: String) -> bool {
        match self.sender.try_lock() {
            Ok(slot) => slot.as_ref().map(|s| s.try_send(text)).unwrap_or(false),
            Err(_) => false,
        }
    }
}

impl Default for RelaySlot {
    fn default() -> Self {
        Self::new()
    }
}

/// Mirrors INFO-and-above events into the log relay.
pub struct RelayLayer {
    slot: &'static RelaySlot,
}

impl RelayLayer {
    pub fn new(slot: &'static RelaySlot) -> Self {
        Self { slot }
    }
}

impl<S: Subscriber> Layer<S> for RelayLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let meta = event.metadata();
        if *meta.level() > Level::INFO {
            return;
        }
        if SKIPPED_TARGET_PREFIXES
            .iter()
            .any(|p| meta.target().starts_with(p))
        {
            return;
        }

        let mut fields = FieldCollector::default();
        event.record(&mut fields);
        self.slot
            .try_send(format_line(*meta.level(), meta.target(), &fields.render()));
    }
}

fn format_line(level: Level, target: &str, body: &str) -> String {
    let ts = chrono::Local::now().format("%H:%M:%S%.3f");
    format!("```{ts} | {level:<5} | {target} - {body}```")
}

#[derive(Default)]
struct FieldCollector {
    message: String,
    extra: String,
}

impl FieldCollector {
    fn render(self) -> String {
        if self.extra.is_empty() {
            self.message
        } else {
            format!("{}{}", self.message, self.extra)
        }
    }
}

impl Visit for FieldCollector {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.extra, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{value:?}");
        } else {
            let _ = write!(self.extra, " {}={:?}", field.name(), value);
        }
    }
}
