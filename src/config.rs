//! Process-wide configuration, loaded once at startup from `AGENTGATE_*`
//! environment variables. Follows the teacher's `Config::load()` pattern:
//! explicit parsing per field, fail-fast on anything out of range, no
//! silent defaults for security-relevant values.

use crate::error::{AgentGateError, Result};
use serde::{Deserialize, Serialize};
use std::env;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub engine: EngineConfig,
    pub resource_monitor: ResourceMonitorConfig,
    pub scheduler: SchedulerConfig,
    pub retry: RetryConfig,
    pub events: EventConfig,
    pub audit: AuditConfig,
    pub api: ApiConfig,
    pub store: StoreConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub max_concurrent_runs: usize,
    pub default_max_iterations: u32,
    pub default_max_wall_clock_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceMonitorConfig {
    pub max_concurrent_slots: usize,
    pub memory_per_slot_mb: u64,
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub tick_interval_ms: u64,
    pub stagger_delay_ms: u64,
    pub stale_check_interval_ms: u64,
    pub stale_threshold_ms: u64,
    pub max_running_time_ms: u64,
    pub shutdown_grace_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter_factor: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventConfig {
    pub max_events_per_work_order: usize,
    pub max_total_events: usize,
    pub retention_minutes: u64,
    pub max_events_per_second: u32,
    pub batch_window_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    pub max_events: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
    pub api_key: String,
    pub allowed_origins: Vec<String>,
    pub stream_catchup_events: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub data_dir: String,
}

/// Parses an env var into a bounded numeric range, falling back to
/// `default` when unset, and failing startup when set but out of range or
/// unparsable — matching the teacher's `CLAUDE_MAX_TOKENS`-style handling,
/// but stricter: the teacher silently falls back on a parse failure, which
/// this crate treats as a configuration error instead (a REDESIGN-worthy
/// tightening, recorded in DESIGN.md).
fn bounded_env<T>(key: &str, default: T, min: T, max: T) -> Result<T>
where
    T: std::str::FromStr + PartialOrd + std::fmt::Display + Copy,
{
    match env::var(key) {
        Err(_) => Ok(default),
        Ok(raw) => {
            let value: T = raw.parse().map_err(|_| {
                AgentGateError::Configuration(format!("{key}={raw:?} is not a valid number"))
            })?;
            if value < min || value > max {
                return Err(AgentGateError::Configuration(format!(
                    "{key}={value} out of range [{min}, {max}]"
                )));
            }
            Ok(value)
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

impl Config {
    pub fn load() -> Result<Self> {
        match dotenvy::dotenv() {
            Ok(path) => tracing::info!("loaded .env file from {:?}", path),
            Err(e) => tracing::debug!("no .env file loaded: {e}"),
        }

        let engine = EngineConfig {
            max_concurrent_runs: bounded_env("AGENTGATE_MAX_CONCURRENT_RUNS", 4usize, 1, 256)?,
            default_max_iterations: bounded_env("AGENTGATE_DEFAULT_MAX_ITERATIONS", 3u32, 1, 10)?,
            default_max_wall_clock_secs: bounded_env(
                "AGENTGATE_DEFAULT_MAX_WALL_CLOCK_SECS",
                3600u64,
                60,
                3600,
            )?,
        };

        let resource_monitor = ResourceMonitorConfig {
            max_concurrent_slots: bounded_env("AGENTGATE_MAX_CONCURRENT_SLOTS", 4usize, 1, 256)?,
            memory_per_slot_mb: bounded_env("AGENTGATE_MEMORY_PER_SLOT_MB", 512u64, 1, 1_048_576)?,
            poll_interval_ms: bounded_env("AGENTGATE_RESOURCE_POLL_INTERVAL_MS", 2_000u64, 100, 60_000)?,
        };

        let scheduler = SchedulerConfig {
            tick_interval_ms: bounded_env("AGENTGATE_SCHEDULER_TICK_MS", 5_000u64, 100, 600_000)?,
            stagger_delay_ms: bounded_env("AGENTGATE_STAGGER_DELAY_MS", 250u64, 0, 60_000)?,
            stale_check_interval_ms: bounded_env("AGENTGATE_STALE_CHECK_INTERVAL_MS", 60_000u64, 1_000, 600_000)?,
            stale_threshold_ms: bounded_env("AGENTGATE_STALE_THRESHOLD_MS", 600_000u64, 1_000, 86_400_000)?,
            max_running_time_ms: bounded_env("AGENTGATE_MAX_RUNNING_TIME_MS", 14_400_000u64, 1_000, 604_800_000)?,
            shutdown_grace_ms: bounded_env("AGENTGATE_SHUTDOWN_GRACE_MS", 30_000u64, 0, 600_000)?,
        };

        let retry = RetryConfig {
            max_retries: bounded_env("AGENTGATE_RETRY_MAX_RETRIES", 3u32, 0, 20)?,
            base_delay_ms: bounded_env("AGENTGATE_RETRY_BASE_DELAY_MS", 5_000u64, 1, 600_000)?,
            max_delay_ms: bounded_env("AGENTGATE_RETRY_MAX_DELAY_MS", 300_000u64, 1, 3_600_000)?,
            backoff_multiplier: bounded_env("AGENTGATE_RETRY_BACKOFF_MULTIPLIER", 2.0f64, 1.0, 10.0)?,
            jitter_factor: bounded_env("AGENTGATE_RETRY_JITTER_FACTOR", 0.1f64, 0.0, 1.0)?,
        };

        let events = EventConfig {
            max_events_per_work_order: bounded_env("AGENTGATE_MAX_EVENTS_PER_WORK_ORDER", 1_000usize, 1, 1_000_000)?,
            max_total_events: bounded_env("AGENTGATE_MAX_TOTAL_EVENTS", 10_000usize, 1, 10_000_000)?,
            retention_minutes: bounded_env("AGENTGATE_EVENT_RETENTION_MINUTES", 60u64, 1, 10_080)?,
            max_events_per_second: bounded_env("AGENTGATE_MAX_EVENTS_PER_SECOND", 50u32, 1, 10_000)?,
            batch_window_ms: bounded_env("AGENTGATE_EVENT_BATCH_WINDOW_MS", 100u64, 0, 10_000)?,
        };

        let audit = AuditConfig {
            max_events: bounded_env("AGENTGATE_AUDIT_MAX_EVENTS", 10_000usize, 1, 10_000_000)?,
        };

        let api_key = env::var("AGENTGATE_API_KEY").map_err(|_| {
            AgentGateError::Configuration("AGENTGATE_API_KEY environment variable is required".to_string())
        })?;
        if api_key.trim().len() < 32 {
            return Err(AgentGateError::Configuration(
                "AGENTGATE_API_KEY must be at least 32 characters; generate one with `openssl rand -hex 32`"
                    .to_string(),
            ));
        }

        let allowed_origins = env_or("AGENTGATE_ALLOWED_ORIGINS", "http://localhost:3000")
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let api = ApiConfig {
            host: env_or("AGENTGATE_API_HOST", "127.0.0.1"),
            port: bounded_env("AGENTGATE_API_PORT", 8080u16, 1, 65535)?,
            api_key,
            allowed_origins,
            stream_catchup_events: bounded_env("AGENTGATE_STREAM_CATCHUP_EVENTS", 50usize, 0, 10_000)?,
        };

        let store = StoreConfig {
            data_dir: env_or("AGENTGATE_DATA_DIR", "./data"),
        };

        Ok(Self {
            engine,
            resource_monitor,
            scheduler,
            retry,
            events,
            audit,
            api,
            store,
        })
    }
}

/// Parses strings like `"2h"`, `"30m"`, `"90s"` into seconds, per
/// `spec.md` §4.12 (`maxWallClock`). Bare integers are seconds.
pub fn parse_duration_to_secs(input: &str) -> Result<u64> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(AgentGateError::Validation("empty duration string".to_string()));
    }
    let (number_part, unit) = match trimmed.chars().last() {
        Some(c) if c.is_ascii_alphabetic() => (&trimmed[..trimmed.len() - 1], c.to_ascii_lowercase()),
        _ => (trimmed, 's'),
    };
    let number: u64 = number_part
        .parse()
        .map_err(|_| AgentGateError::Validation(format!("invalid duration: {input:?}")))?;
    let secs = match unit {
        's' => number,
        'm' => number * 60,
        'h' => number * 3600,
        other => {
            return Err(AgentGateError::Validation(format!(
                "unknown duration unit {other:?} in {input:?}"
            )))
        }
    };
    Ok(secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_hours_minutes_seconds() {
        assert_eq!(parse_duration_to_secs("2h").unwrap(), 7200);
        assert_eq!(parse_duration_to_secs("30m").unwrap(), 1800);
        assert_eq!(parse_duration_to_secs("90s").unwrap(), 90);
        assert_eq!(parse_duration_to_secs("45").unwrap(), 45);
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_duration_to_secs("").is_err());
        assert!(parse_duration_to_secs("abc").is_err());
        assert!(parse_duration_to_secs("5x").is_err());
    }

    #[test]
    fn bounded_env_rejects_out_of_range() {
        std::env::set_var("AGENTGATE_TEST_BOUND", "999999");
        let result: Result<u32> = bounded_env("AGENTGATE_TEST_BOUND", 1, 1, 10);
        assert!(result.is_err());
        std::env::remove_var("AGENTGATE_TEST_BOUND");
    }
}
