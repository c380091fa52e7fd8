//! Engine configuration from the environment.
//!
//! Reads `WEFT_*` environment variables into [`EngineConfig`], falling back
//! to the defaults for anything missing or malformed. A bare environment
//! yields a working single-node engine.

use weft_types::config::{EngineConfig, MonitorConfig};

/// Load engine configuration from `WEFT_*` environment variables.
///
/// Recognized variables:
/// - `WEFT_STEP_CONSUMERS` -- number of concurrent step consumers
/// - `WEFT_POLL_INTERVAL_MS` -- broker poll interval when idle
/// - `WEFT_DELIVERY_LIMIT` -- deliveries before dead-lettering
/// - `WEFT_LEASE_MS` -- consumer lease on received messages
/// - `WEFT_BARRIER_REQUEUE_DELAY_MS` -- dependency-barrier requeue delay
/// - `WEFT_ERROR_RATE_THRESHOLD`, `WEFT_RETRY_RATE_THRESHOLD`,
///   `WEFT_DURATION_THRESHOLD_MS`, `WEFT_MONITOR_WINDOW_SECS` -- alerting
///
/// Malformed values log a warning and keep the default.
pub fn load_engine_config() -> EngineConfig {
    let defaults = EngineConfig::default();
    let monitor_defaults = MonitorConfig::default();

    EngineConfig {
        step_consumers: env_parse("WEFT_STEP_CONSUMERS", defaults.step_consumers),
        poll_interval_ms: env_parse("WEFT_POLL_INTERVAL_MS", defaults.poll_interval_ms),
        delivery_limit: env_parse("WEFT_DELIVERY_LIMIT", defaults.delivery_limit),
        lease_ms: env_parse("WEFT_LEASE_MS", defaults.lease_ms),
        barrier_requeue_delay_ms: env_parse(
            "WEFT_BARRIER_REQUEUE_DELAY_MS",
            defaults.barrier_requeue_delay_ms,
        ),
        monitor: MonitorConfig {
            error_rate_threshold: env_parse(
                "WEFT_ERROR_RATE_THRESHOLD",
                monitor_defaults.error_rate_threshold,
            ),
            retry_rate_threshold: env_parse(
                "WEFT_RETRY_RATE_THRESHOLD",
                monitor_defaults.retry_rate_threshold,
            ),
            duration_threshold_ms: env_parse(
                "WEFT_DURATION_THRESHOLD_MS",
                monitor_defaults.duration_threshold_ms,
            ),
            window_secs: env_parse("WEFT_MONITOR_WINDOW_SECS", monitor_defaults.window_secs),
        },
    }
}

/// Database URL: `WEFT_DATABASE_URL` if set, otherwise `weft.db` under the
/// data directory (`WEFT_DATA_DIR`, default `~/.weft`).
pub fn database_url() -> String {
    if let Ok(url) = std::env::var("WEFT_DATABASE_URL") {
        return url;
    }
    let data_dir = std::env::var("WEFT_DATA_DIR").unwrap_or_else(|_| {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        format!("{home}/.weft")
    });
    format!("sqlite://{data_dir}/weft.db")
}

fn env_parse<T: std::str::FromStr + Copy>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(raw) => match raw.trim().parse::<T>() {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!(var = name, value = raw.as_str(), "unparsable value, using default");
                default
            }
        },
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_environment() {
        // Env var names unique to this test avoid cross-test interference.
        let config = load_engine_config();
        assert!(config.step_consumers >= 1);
        assert!(config.delivery_limit >= 1);
    }

    #[test]
    fn env_parse_falls_back_on_garbage() {
        // SAFETY: test-local variable name, no concurrent reader cares.
        unsafe {
            std::env::set_var("WEFT_TEST_GARBAGE", "not-a-number");
        }
        let value: u64 = env_parse("WEFT_TEST_GARBAGE", 42);
        assert_eq!(value, 42);
        unsafe {
            std::env::remove_var("WEFT_TEST_GARBAGE");
        }
    }

    #[test]
    fn database_url_default_shape() {
        if std::env::var("WEFT_DATABASE_URL").is_err() {
            let url = database_url();
            assert!(url.starts_with("sqlite://"));
            assert!(url.ends_with("weft.db"));
        }
    }
}
