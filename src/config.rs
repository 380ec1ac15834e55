//! Configuration module

use std::env;
use std::time::Duration;

/// Application configuration.
///
/// The autonomy thresholds and timeouts are policy defaults, not hard-coded
/// law; every one of them can be overridden from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// Optional database connection URL; when absent or unreachable the
    /// process runs on the in-memory store.
    pub database_url: Option<String>,

    /// Server port
    pub port: u16,

    /// Minimum confidence for auto-executing a Medium-risk action
    pub medium_confidence: f64,

    /// Minimum confidence for auto-executing a High-risk action
    pub high_confidence: f64,

    /// Confidence reported by the deterministic scoring fallback
    pub fallback_confidence: f64,

    /// How long an action may sit in AwaitingConfirmation
    pub confirmation_timeout: Duration,

    /// Interval of the expiry sweep
    pub sweep_interval: Duration,

    /// Per-call timeout for scoring/policy collaborators
    pub scoring_timeout: Duration,

    /// Per-attempt timeout for the executor collaborator
    pub execution_timeout: Duration,

    /// Execution attempts before an action is terminally failed
    pub execution_max_attempts: u32,

    /// Base backoff between execution retries, doubled per attempt
    pub execution_backoff: Duration,

    /// Broadcast buffer per stream subscriber
    pub stream_buffer: usize,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self {
            database_url: env::var("DATABASE_URL").ok().filter(|v| !v.is_empty()),

            port: parse_env("PORT", 8080),

            medium_confidence: parse_env("SENTINEL_MEDIUM_CONFIDENCE", 0.75),
            high_confidence: parse_env("SENTINEL_HIGH_CONFIDENCE", 0.9),
            fallback_confidence: parse_env("SENTINEL_FALLBACK_CONFIDENCE", 0.5),

            confirmation_timeout: Duration::from_secs(parse_env(
                "SENTINEL_CONFIRMATION_TIMEOUT_SECS",
                300,
            )),
            sweep_interval: Duration::from_secs(parse_env("SENTINEL_SWEEP_INTERVAL_SECS", 30)),
            scoring_timeout: Duration::from_millis(parse_env(
                "SENTINEL_SCORING_TIMEOUT_MS",
                2_000,
            )),
            execution_timeout: Duration::from_millis(parse_env(
                "SENTINEL_EXECUTION_TIMEOUT_MS",
                5_000,
            )),
            execution_max_attempts: parse_env("SENTINEL_EXECUTION_MAX_ATTEMPTS", 3),
            execution_backoff: Duration::from_millis(parse_env(
                "SENTINEL_EXECUTION_BACKOFF_MS",
                250,
            )),

            stream_buffer: parse_env("SENTINEL_STREAM_BUFFER", 256),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_env()
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
