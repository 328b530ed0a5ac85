//! Runtime configuration read from `GRIDRECON_*` environment variables.

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use thiserror::Error;

use crate::aggregate::TieBreak;
use crate::matcher::MatchWindow;
use crate::validate::ValidationPolicy;

pub const ENV_DB_PATH: &str = "GRIDRECON_DB_PATH";
pub const ENV_ADDR: &str = "GRIDRECON_ADDR";
pub const ENV_LOOKBACK_HOURS: &str = "GRIDRECON_LOOKBACK_HOURS";
pub const ENV_LOOKAHEAD_HOURS: &str = "GRIDRECON_LOOKAHEAD_HOURS";
pub const ENV_TIE_BREAK: &str = "GRIDRECON_TIE_BREAK";
pub const ENV_MAX_FUTURE_SKEW_HOURS: &str = "GRIDRECON_MAX_FUTURE_SKEW_HOURS";

/// Upper bound for any configured hour span (ten years).
pub const MAX_CONFIG_HOURS: i64 = 24 * 366 * 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileConfig {
    pub db_path: PathBuf,
    pub bind_addr: SocketAddr,
    pub window: MatchWindow,
    pub tie_break: TieBreak,
    pub validation: ValidationPolicy,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/gridrecon.sqlite"),
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            window: MatchWindow::default(),
            tie_break: TieBreak::default(),
            validation: ValidationPolicy::default(),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {var}: '{value}' ({reason})")]
    InvalidValue {
        var: &'static str,
        value: String,
        reason: String,
    },
    #[error("invalid match window: {0}")]
    InvalidWindow(String),
}

pub fn reconcile_config_from_env() -> Result<ReconcileConfig, ConfigError> {
    let mut config = ReconcileConfig::default();

    if let Some(path) = env_value(ENV_DB_PATH) {
        config.db_path = PathBuf::from(path);
    }
    if let Some(addr) = parsed_env::<SocketAddr>(ENV_ADDR)? {
        config.bind_addr = addr;
    }
    if let Some(hours) = parsed_env::<i64>(ENV_LOOKBACK_HOURS)? {
        config.window.lookback_hours = hours;
    }
    if let Some(hours) = parsed_env::<i64>(ENV_LOOKAHEAD_HOURS)? {
        config.window.lookahead_hours = hours;
    }
    if let Some(tie_break) = parsed_env::<TieBreak>(ENV_TIE_BREAK)? {
        config.tie_break = tie_break;
    }
    if let Some(hours) = parsed_env::<i64>(ENV_MAX_FUTURE_SKEW_HOURS)? {
        if !(0..=MAX_CONFIG_HOURS).contains(&hours) {
            return Err(ConfigError::InvalidValue {
                var: ENV_MAX_FUTURE_SKEW_HOURS,
                value: hours.to_string(),
                reason: format!("must be within 0..={MAX_CONFIG_HOURS}"),
            });
        }
        config.validation.max_future_skew_hours = hours;
    }

    validate_window(&config.window)?;
    Ok(config)
}

pub fn validate_window(window: &MatchWindow) -> Result<(), ConfigError> {
    if window.lookback_hours < 0 {
        return Err(ConfigError::InvalidWindow(
            "lookback_hours must be >= 0".to_string(),
        ));
    }
    if window.lookahead_hours < 1 {
        return Err(ConfigError::InvalidWindow(
            "lookahead_hours must be >= 1".to_string(),
        ));
    }
    if window.lookback_hours > MAX_CONFIG_HOURS || window.lookahead_hours > MAX_CONFIG_HOURS {
        return Err(ConfigError::InvalidWindow(format!(
            "window hours must be <= {MAX_CONFIG_HOURS}"
        )));
    }
    Ok(())
}

fn env_value(var: &str) -> Option<String> {
    env::var(var)
        .ok()
        .map(|raw| raw.trim().to_string())
        .filter(|raw| !raw.is_empty())
}

fn parsed_env<T>(var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: ToString,
{
    match env_value(var) {
        None => Ok(None),
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|err| ConfigError::InvalidValue {
                var,
                value: raw,
                reason: err.to_string(),
            }),
    }
}
