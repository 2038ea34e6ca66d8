use std::time::Duration;

use crate::error::{EngineError, Result};

pub const DEFAULT_REFRESH_SECS: u64 = 300;
pub const DEFAULT_CLEANUP_SECS: u64 = 3600;
pub const DEFAULT_MAX_LOAD_GAP: usize = 1;
pub const DEFAULT_DB_MAX_CONNECTIONS: u32 = 5;

/// Runtime tunables, read from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub refresh_interval: Duration,
    pub cleanup_interval: Duration,
    pub cleanup_enabled: bool,
    /// Largest tolerated difference between the busiest and idlest evaluator.
    pub max_load_gap: usize,
    pub db_max_connections: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(DEFAULT_REFRESH_SECS),
            cleanup_interval: Duration::from_secs(DEFAULT_CLEANUP_SECS),
            cleanup_enabled: true,
            max_load_gap: DEFAULT_MAX_LOAD_GAP,
            db_max_connections: DEFAULT_DB_MAX_CONNECTIONS,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let refresh_secs = parse_var(&lookup, "WINDOW_REFRESH_SECS", DEFAULT_REFRESH_SECS)?;
        let cleanup_secs = parse_var(&lookup, "WINDOW_CLEANUP_SECS", DEFAULT_CLEANUP_SECS)?;
        if refresh_secs == 0 {
            return Err(EngineError::validation(
                "WINDOW_REFRESH_SECS must be greater than zero",
            ));
        }
        if cleanup_secs == 0 {
            return Err(EngineError::validation(
                "WINDOW_CLEANUP_SECS must be greater than zero",
            ));
        }

        let cleanup_enabled = match lookup("WINDOW_CLEANUP_ENABLED") {
            None => defaults.cleanup_enabled,
            Some(raw) => parse_flag(&raw).ok_or_else(|| {
                EngineError::validation(format!(
                    "WINDOW_CLEANUP_ENABLED must be true or false, got {raw:?}"
                ))
            })?,
        };

        let db_max_connections =
            parse_var(&lookup, "DB_MAX_CONNECTIONS", DEFAULT_DB_MAX_CONNECTIONS)?;

        Ok(Self {
            refresh_interval: Duration::from_secs(refresh_secs),
            cleanup_interval: Duration::from_secs(cleanup_secs),
            cleanup_enabled,
            max_load_gap: parse_var(&lookup, "EVALUATOR_MAX_LOAD_GAP", DEFAULT_MAX_LOAD_GAP)?,
            db_max_connections: db_max_connections.max(1),
        })
    }
}

fn parse_var<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|_| {
            EngineError::validation(format!("{key} must be a non-negative integer, got {raw:?}"))
        }),
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = EngineConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.refresh_interval, Duration::from_secs(300));
        assert_eq!(config.cleanup_interval, Duration::from_secs(3600));
    }

    #[test]
    fn overrides_are_parsed() {
        let config = EngineConfig::from_lookup(lookup(&[
            ("WINDOW_REFRESH_SECS", "60"),
            ("WINDOW_CLEANUP_ENABLED", "off"),
            ("EVALUATOR_MAX_LOAD_GAP", "2"),
        ]))
        .unwrap();
        assert_eq!(config.refresh_interval, Duration::from_secs(60));
        assert!(!config.cleanup_enabled);
        assert_eq!(config.max_load_gap, 2);
    }

    #[test]
    fn zero_period_is_rejected() {
        let err = EngineConfig::from_lookup(lookup(&[("WINDOW_REFRESH_SECS", "0")])).unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[test]
    fn garbage_names_the_variable() {
        let err =
            EngineConfig::from_lookup(lookup(&[("EVALUATOR_MAX_LOAD_GAP", "lots")])).unwrap_err();
        assert!(err.to_string().contains("EVALUATOR_MAX_LOAD_GAP"));
    }
}
