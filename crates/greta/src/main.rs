use std::{process::ExitCode, sync::Arc};

use tokio_util::sync::CancellationToken;

use greta_core::{
    config::{log_settings_from_env, Config},
    logging,
    retry::run_with_retry,
    runtime::{run_once, RunDeps},
    store::JsonQuoteStore,
};
use greta_telegram::TelegramClient;

mod signals;

#[tokio::main]
async fn main() -> ExitCode {
    let guard = match logging::init("greta", &log_settings_from_env()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("greta: {e}");
            return ExitCode::from(e.exit_code());
        }
    };

    let code = match run().await {
        Ok(()) => {
            tracing::info!("bye");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, kind = e.as_label(), "greta stopped");
            ExitCode::from(e.exit_code())
        }
    };
    guard.flush();
    code
}

async fn run() -> greta_core::Result<()> {
    let cfg = Arc::new(Config::load()?);

    let shutdown = CancellationToken::new();
    signals::cancel_on_signal(shutdown.clone());

    let deps = Arc::new(RunDeps {
        client: Arc::new(TelegramClient::new(&cfg.bot_token, cfg.status_chat)),
        store: Arc::new(JsonQuoteStore::new(cfg.db_path.clone())),
        config: cfg.clone(),
        shutdown: shutdown.clone(),
    });

    run_with_retry(&cfg.retry_policy(), &shutdown, move |attempt| {
        let deps = deps.clone();
        async move { run_once(&deps, attempt).await }
    })
    .await
}
