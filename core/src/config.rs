/// Configuration management
use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_FALLBACK_REFRESH_MS: u64 = 2_000;
const DEFAULT_REFRESH_INTERVAL_SECS: u64 = 60;

/// Sync session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Id of the signed-in user; messages from this id never count as unread
    pub local_user_id: String,

    /// Delay before the safety-net bulk refresh after a conversation is created
    pub fallback_refresh_delay: Duration,

    /// Periodic bulk refresh (None disables it)
    pub periodic_refresh_interval: Option<Duration>,

    /// Refresh cycles an unconfirmed placeholder survives while absent from the snapshot
    pub placeholder_grace_cycles: u32,

    /// Issue a bulk fetch as soon as the session starts
    pub refresh_on_start: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            local_user_id: String::new(),
            fallback_refresh_delay: Duration::from_millis(DEFAULT_FALLBACK_REFRESH_MS),
            periodic_refresh_interval: Some(Duration::from_secs(DEFAULT_REFRESH_INTERVAL_SECS)),
            placeholder_grace_cycles: 1,
            refresh_on_start: true,
        }
    }
}

impl SyncConfig {
    pub fn new(local_user_id: impl Into<String>) -> Self {
        Self {
            local_user_id: local_user_id.into(),
            ..Default::default()
        }
    }

    /// Create config from command line arguments
    ///
    /// `args[0]` is the program name, `args[1]` the local user id; the rest are flags.
    /// Positional arguments after the user id are returned untouched in `rest`.
    pub fn from_args(args: &[String]) -> Result<(Self, Vec<String>)> {
        if args.len() < 2 {
            return Err(SyncError::Config(format!(
                "Usage: {} <local_user_id> [--fallback-delay-ms <ms>] [--refresh-interval-ms <ms>] [--grace-cycles <n>] [--no-initial-refresh] [files...]",
                args.first().map(String::as_str).unwrap_or("chatsync")
            )));
        }

        let mut config = Self::new(args[1].clone());
        let mut rest = Vec::new();

        let mut i = 2;
        while i < args.len() {
            match args[i].as_str() {
                "--fallback-delay-ms" => {
                    let ms = parse_flag_u64(args, i, "--fallback-delay-ms")?;
                    config.fallback_refresh_delay = Duration::from_millis(ms);
                    i += 2;
                }
                "--refresh-interval-ms" => {
                    let ms = parse_flag_u64(args, i, "--refresh-interval-ms")?;
                    config.periodic_refresh_interval = interval_from_ms(ms);
                    i += 2;
                }
                "--grace-cycles" => {
                    let n = parse_flag_u64(args, i, "--grace-cycles")?;
                    config.placeholder_grace_cycles = u32::try_from(n).map_err(|_| {
                        SyncError::Config("--grace-cycles is out of range".to_string())
                    })?;
                    i += 2;
                }
                "--no-initial-refresh" => {
                    config.refresh_on_start = false;
                    i += 1;
                }
                other => {
                    rest.push(other.to_string());
                    i += 1;
                }
            }
        }

        config.apply_env_overrides();
        config.validate()?;
        Ok((config, rest))
    }

    /// Env overrides (nice for scripts)
    pub fn apply_env_overrides(&mut self) {
        if let Ok(user) = std::env::var("CHATSYNC_LOCAL_USER") {
            if !user.is_empty() {
                self.local_user_id = user;
            }
        }
        if let Some(ms) = env_u64("CHATSYNC_FALLBACK_DELAY_MS") {
            self.fallback_refresh_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = env_u64("CHATSYNC_REFRESH_INTERVAL_MS") {
            self.periodic_refresh_interval = interval_from_ms(ms);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.local_user_id.trim().is_empty() {
            return Err(SyncError::Config("local user id must not be empty".to_string()));
        }
        if self.periodic_refresh_interval == Some(Duration::ZERO) {
            return Err(SyncError::Config(
                "periodic refresh interval must be non-zero (use None to disable)".to_string(),
            ));
        }
        if self.placeholder_grace_cycles == 0 {
            return Err(SyncError::Config(
                "placeholders must survive at least one refresh (--grace-cycles >= 1)".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_flag_u64(args: &[String], i: usize, flag: &str) -> Result<u64> {
    let raw = args
        .get(i + 1)
        .ok_or_else(|| SyncError::Config(format!("{} requires a numeric argument", flag)))?;
    raw.parse::<u64>()
        .map_err(|_| SyncError::Config(format!("{} must be a non-negative number", flag)))
}

fn interval_from_ms(ms: u64) -> Option<Duration> {
    if ms == 0 {
        None
    } else {
        Some(Duration::from_millis(ms))
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|s| s.parse::<u64>().ok())
}
