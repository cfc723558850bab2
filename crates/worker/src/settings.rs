//! Worker settings, read from `TASKFORGE_*` environment variables.

use std::time::Duration;

use thiserror::Error;

pub const REDIS_URL: &str = "TASKFORGE_REDIS_URL";
pub const QUEUE: &str = "TASKFORGE_QUEUE";
pub const GROUP: &str = "TASKFORGE_GROUP";
pub const CONSUMER: &str = "TASKFORGE_CONSUMER";
pub const MAX_RETRIES: &str = "TASKFORGE_MAX_RETRIES";
pub const PROMOTER_INTERVAL_MS: &str = "TASKFORGE_PROMOTER_INTERVAL_MS";
pub const SCHEDULER_INTERVAL_MS: &str = "TASKFORGE_SCHEDULER_INTERVAL_MS";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SettingsError {
    #[error("{var} must be a non-negative integer, got {value:?}")]
    NotANumber { var: &'static str, value: String },

    #[error("{var} must not be empty")]
    Empty { var: &'static str },

    #[error("{var} must be greater than zero")]
    Zero { var: &'static str },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSettings {
    /// Redis URL; `None` runs against an in-process broker.
    pub redis_url: Option<String>,
    pub queue: String,
    pub group: String,
    /// Stable consumer name, needed to recover pending entries after a restart.
    pub consumer: Option<String>,
    pub max_retries: u32,
    pub promoter_interval: Duration,
    pub scheduler_interval: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            redis_url: None,
            queue: "tasks".to_string(),
            group: "taskforge-workers".to_string(),
            consumer: None,
            max_retries: 3,
            promoter_interval: Duration::from_secs(5),
            scheduler_interval: Duration::from_secs(60),
        }
    }
}

impl WorkerSettings {
    pub fn from_env() -> Result<Self, SettingsError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build settings from any name → value source. Unset names keep defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, SettingsError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let text = |var: &'static str| -> Result<Option<String>, SettingsError> {
            match lookup(var) {
                None => Ok(None),
                Some(value) if value.trim().is_empty() => Err(SettingsError::Empty { var }),
                Some(value) => Ok(Some(value.trim().to_string())),
            }
        };
        let number = |var: &'static str| -> Result<Option<u64>, SettingsError> {
            match lookup(var) {
                None => Ok(None),
                Some(value) => value
                    .trim()
                    .parse::<u64>()
                    .map(Some)
                    .map_err(|_| SettingsError::NotANumber { var, value }),
            }
        };

        let interval = |var: &'static str| -> Result<Option<Duration>, SettingsError> {
            match number(var)? {
                Some(0) => Err(SettingsError::Zero { var }),
                ms => Ok(ms.map(Duration::from_millis)),
            }
        };

        let max_retries = match number(MAX_RETRIES)? {
            Some(n) => u32::try_from(n).map_err(|_| SettingsError::NotANumber {
                var: MAX_RETRIES,
                value: n.to_string(),
            })?,
            None => defaults.max_retries,
        };

        Ok(Self {
            redis_url: text(REDIS_URL)?,
            queue: text(QUEUE)?.unwrap_or(defaults.queue),
            group: text(GROUP)?.unwrap_or(defaults.group),
            consumer: text(CONSUMER)?,
            max_retries,
            promoter_interval: interval(PROMOTER_INTERVAL_MS)?
                .unwrap_or(defaults.promoter_interval),
            scheduler_interval: interval(SCHEDULER_INTERVAL_MS)?
                .unwrap_or(defaults.scheduler_interval),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn unset_variables_keep_defaults() {
        let settings = WorkerSettings::from_lookup(lookup(&[])).unwrap();
        assert_eq!(settings, WorkerSettings::default());
    }

    #[test]
    fn variables_override_defaults() {
        let settings = WorkerSettings::from_lookup(lookup(&[
            (REDIS_URL, "redis://cache:6379"),
            (QUEUE, "emails"),
            (CONSUMER, "worker-a"),
            (MAX_RETRIES, "7"),
            (PROMOTER_INTERVAL_MS, "250"),
        ]))
        .unwrap();

        assert_eq!(settings.redis_url.as_deref(), Some("redis://cache:6379"));
        assert_eq!(settings.queue, "emails");
        assert_eq!(settings.group, "taskforge-workers");
        assert_eq!(settings.consumer.as_deref(), Some("worker-a"));
        assert_eq!(settings.max_retries, 7);
        assert_eq!(settings.promoter_interval, Duration::from_millis(250));
        assert_eq!(settings.scheduler_interval, Duration::from_secs(60));
    }

    #[test]
    fn bad_values_are_reported() {
        assert_eq!(
            WorkerSettings::from_lookup(lookup(&[(MAX_RETRIES, "many")])),
            Err(SettingsError::NotANumber {
                var: MAX_RETRIES,
                value: "many".to_string()
            })
        );
        assert_eq!(
            WorkerSettings::from_lookup(lookup(&[(QUEUE, "  ")])),
            Err(SettingsError::Empty { var: QUEUE })
        );
        assert_eq!(
            WorkerSettings::from_lookup(lookup(&[(SCHEDULER_INTERVAL_MS, "0")])),
            Err(SettingsError::Zero { var: SCHEDULER_INTERVAL_MS })
        );
        assert_eq!(
            WorkerSettings::from_lookup(lookup(&[(PROMOTER_INTERVAL_MS, "0")])),
            Err(SettingsError::Zero { var: PROMOTER_INTERVAL_MS })
        );
    }
}
