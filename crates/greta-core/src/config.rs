use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{
    domain::{ChatId, UserId},
    errors::Error,
    logging::LogSettings,
    retry::RetryPolicy,
    Result,
};

/// Typed configuration, read from the environment (and an optional `.env`).
#[derive(Clone, Debug)]
pub struct Config {
    // Core
    pub bot_token: String,
    /// First entry is the main owner.
    pub owners: Vec<UserId>,
    pub command_prefix: String,

    // Chats
    pub log_chat: Option<ChatId>,
    pub main_chat: Option<ChatId>,
    pub status_chat: Option<ChatId>,

    // Storage / logging
    pub db_path: PathBuf,
    pub log_dir: Option<PathBuf>,
    pub debug: bool,

    // Runtime
    pub retry_delay: Duration,
    pub log_relay_capacity: usize,
    pub log_relay_interval: Duration,
    pub status_period: Duration,
    pub status_initial_delay: Duration,
    pub event_wait: Duration,
}

impl Config {
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));
        Self::from_lookup(env_str)
    }

    /// Builds the config from any key/value source. `load()` uses the process environment.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        // Required
        let bot_token = get("GRETA_BOT_TOKEN").unwrap_or_default();
        if bot_token.trim().is_empty() {
            return Err(Error::Config(
                "GRETA_BOT_TOKEN environment variable is required".to_string(),
            ));
        }
        let owners: Vec<UserId> = parse_csv_i64(get("GRETA_OWNERS"))
            .into_iter()
            .map(UserId)
            .collect();
        if owners.is_empty() {
            return Err(Error::Config(
                "GRETA_OWNERS environment variable is required".to_string(),
            ));
        }

        let command_prefix = get("GRETA_COMMAND_PREFIX")
            .and_then(non_empty)
            .unwrap_or_else(|| "/".to_string());

        // `0` or empty means "not configured" for every chat id.
        let chat = |key: &str| -> Result<Option<ChatId>> {
            match get(key).and_then(non_empty) {
                None => Ok(None),
                Some(s) => match s.trim().parse::<i64>() {
                    Ok(0) => Ok(None),
                    Ok(id) => Ok(Some(ChatId(id))),
                    Err(_) => Err(Error::Config(format!("{key} must be a numeric chat id"))),
                },
            }
        };
        let log_chat = chat("GRETA_LOG_CHAT")?;
        let main_chat = chat("GRETA_MAIN_CHAT")?;
        let status_chat = chat("GRETA_STATUS_CHAT")?;

        let db_path = PathBuf::from(
            get("GRETA_DB_PATH")
                .and_then(non_empty)
                .unwrap_or_else(|| "greta-quotes.json".to_string()),
        );
        // An explicitly empty GRETA_LOG_DIR disables file logging.
        let log_dir = match get("GRETA_LOG_DIR") {
            None => Some(PathBuf::from("logs")),
            Some(s) if s.trim().is_empty() => None,
            Some(s) => Some(PathBuf::from(s.trim())),
        };
        let debug = parse_bool(get("GRETA_DEBUG")).unwrap_or(false);

        let secs = |key: &str, default: u64| {
            Duration::from_secs(parse_u64(get(key)).unwrap_or(default))
        };
        let retry_delay = secs("GRETA_RETRY_DELAY_SECS", 60);
        let status_period = secs("GRETA_STATUS_PERIOD_SECS", 300);
        let status_initial_delay = secs("GRETA_STATUS_INITIAL_DELAY_SECS", 15);
        let event_wait = secs("GRETA_EVENT_WAIT_SECS", 15);
        let log_relay_interval =
            Duration::from_millis(parse_u64(get("GRETA_LOG_RELAY_INTERVAL_MS")).unwrap_or(3000));
        let log_relay_capacity = parse_u64(get("GRETA_LOG_RELAY_CAPACITY"))
            .map(|n| n as usize)
            .unwrap_or(crate::relay::DEFAULT_CAPACITY)
            .max(1);

        if status_period.is_zero() {
            return Err(Error::Config(
                "GRETA_STATUS_PERIOD_SECS must be greater than zero".to_string(),
            ));
        }

        Ok(Self {
            bot_token,
            owners,
            command_prefix,
            log_chat,
            main_chat,
            status_chat,
            db_path,
            log_dir,
            debug,
            retry_delay,
            log_relay_capacity,
            log_relay_interval,
            status_period,
            status_initial_delay,
            event_wait,
        })
    }

    pub fn is_owner(&self, user: UserId) -> bool {
        self.owners.contains(&user)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            delay: self.retry_delay,
            max_attempts: None,
        }
    }
}

/// Reads logging settings only. Used before the full config is validated so
/// that config errors still reach the log.
pub fn log_settings_from_env() -> LogSettings {
    load_dotenv_if_present(Path::new(".env"));
    LogSettings {
        debug: parse_bool(env_str("GRETA_DEBUG")).unwrap_or(false),
        log_dir: match env_str("GRETA_LOG_DIR") {
            None => Some(PathBuf::from("logs")),
            Some(s) if s.trim().is_empty() => None,
            Some(s) => Some(PathBuf::from(s.trim())),
        },
    }
}

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() {
            continue;
        }
        if env::var_os(key).is_some() {
            continue; // do not override existing env
        }

        env::set_var(key, unquote(v.trim()));
    }
}

fn unquote(val: &str) -> &str {
    if val.len() >= 2
        && ((val.starts_with('"') && val.ends_with('"'))
            || (val.starts_with('\'') && val.ends_with('\'')))
    {
        &val[1..val.len() - 1]
    } else {
        val
    }
}

fn parse_bool(v: Option<String>) -> Option<bool> {
    v.map(|s| {
        matches!(
            s.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}

fn parse_u64(v: Option<String>) -> Option<u64> {
    v.and_then(|s| s.trim().parse::<u64>().ok())
}

fn parse_csv_i64(v: Option<String>) -> Vec<i64> {
    v.unwrap_or_default()
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .filter_map(|s| s.parse::<i64>().ok())
        .collect()
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}
