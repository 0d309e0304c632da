pub mod loader;
pub mod validator;
pub mod watcher;

use chrono::{FixedOffset, Offset, Utc};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Complete application configuration
#[derive(Debug, Clone, Default)]
pub struct AppConfig {
    /// HTTP listener for the admin API
    pub server: ServerConfig,

    /// Port for the Prometheus endpoint (0 disables it)
    pub metrics_port: u16,

    /// Quota definitions file (JSON array). `None` keeps quotas in memory only.
    pub quota_file: Option<PathBuf>,

    /// Reload the quota file when it changes on disk
    pub watch_quota_file: bool,

    pub limiter: LimiterConfig,
    pub traces: TraceConfig,
    pub metrics: MetricsConfig,
    pub events: EventConfig,
    pub scheduler: SchedulerConfig,
}

impl AppConfig {
    /// Load configuration from `LIMITER_*` environment variables
    pub fn from_env() -> Self {
        Self {
            server: ServerConfig::from_env(),
            metrics_port: env_or("LIMITER_METRICS_PORT", 9090),
            quota_file: std::env::var("LIMITER_QUOTA_FILE").ok().map(PathBuf::from),
            watch_quota_file: env_flag("LIMITER_WATCH_QUOTA_FILE", true),
            limiter: LimiterConfig::from_env(),
            traces: TraceConfig::from_env(),
            metrics: MetricsConfig::from_env(),
            events: EventConfig::from_env(),
            scheduler: SchedulerConfig::from_env(),
        }
    }
}

/// HTTP server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self {
            host: std::env::var("LIMITER_HTTP_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env_or("LIMITER_HTTP_PORT", 8000),
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// What the engine answers when it cannot reach a quota's state in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Deny the request
    #[default]
    FailClosed,
    /// Admit the request without accounting
    FailOpen,
}

impl FromStr for FailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "fail_closed" | "closed" | "deny" => Ok(Self::FailClosed),
            "fail_open" | "open" | "allow" => Ok(Self::FailOpen),
            other => Err(format!("unknown failure policy '{other}'")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LimiterConfig {
    /// Upper bound on waiting for a quota's lock
    pub lock_timeout: Duration,
    pub failure_policy: FailurePolicy,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_millis(50),
            failure_policy: FailurePolicy::FailClosed,
        }
    }
}

impl LimiterConfig {
    pub fn from_env() -> Self {
        Self {
            lock_timeout: Duration::from_millis(env_or("LIMITER_LOCK_TIMEOUT_MS", 50)),
            failure_policy: env_or("LIMITER_FAILURE_POLICY", FailurePolicy::FailClosed),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TraceConfig {
    /// Records buffered between producers and the writer task
    pub queue_capacity: usize,
    /// Oldest records are evicted past this count; 0 keeps everything
    pub max_records: usize,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            max_records: 100_000,
        }
    }
}

impl TraceConfig {
    pub fn from_env() -> Self {
        Self {
            queue_capacity: env_or("LIMITER_TRACE_QUEUE", 1024),
            max_records: env_or("LIMITER_TRACE_MAX_RECORDS", 100_000),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MetricsConfig {
    /// Reporting window rolled into the series
    pub window: Duration,
    /// Series points kept per quota
    pub series_capacity: usize,
    /// Latency samples kept per window for p95
    pub reservoir_size: usize,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            series_capacity: 1440,
            reservoir_size: 512,
        }
    }
}

impl MetricsConfig {
    pub fn from_env() -> Self {
        Self {
            window: Duration::from_secs(env_or("LIMITER_METRICS_WINDOW_SECS", 60)),
            series_capacity: env_or("LIMITER_SERIES_CAPACITY", 1440),
            reservoir_size: env_or("LIMITER_RESERVOIR_SIZE", 512),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventConfig {
    /// Events buffered per subscriber before the oldest are dropped
    pub buffer: usize,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self { buffer: 256 }
    }
}

impl EventConfig {
    pub fn from_env() -> Self {
        Self {
            buffer: env_or("LIMITER_EVENT_BUFFER", 256),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub tick: Duration,
    /// Offset used for cron evaluation and for "today" in trace pruning
    pub tz_offset: FixedOffset,
    pub alerts: AlertConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(1000),
            tz_offset: default_offset(),
            alerts: AlertConfig::default(),
        }
    }
}

impl SchedulerConfig {
    pub fn from_env() -> Self {
        let tz_offset = match std::env::var("LIMITER_TZ_OFFSET") {
            Ok(raw) => parse_offset(&raw).unwrap_or_else(|| {
                tracing::warn!("Ignoring invalid LIMITER_TZ_OFFSET '{}'", raw);
                default_offset()
            }),
            Err(_) => default_offset(),
        };

        Self {
            tick: Duration::from_millis(env_or("LIMITER_SCHEDULER_TICK_MS", 1000)),
            tz_offset,
            alerts: AlertConfig::from_env(),
        }
    }
}

/// Thresholds for the periodic health check job
#[derive(Debug, Clone)]
pub struct AlertConfig {
    pub error_rate: f64,
    pub rate_429: f64,
    pub window: Duration,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            error_rate: 0.3,
            rate_429: 0.3,
            window: Duration::from_secs(3 * 60),
        }
    }
}

impl AlertConfig {
    pub fn from_env() -> Self {
        Self {
            error_rate: env_or("LIMITER_ALERT_ERROR_RATE", 0.3),
            rate_429: env_or("LIMITER_ALERT_429_RATE", 0.3),
            window: Duration::from_secs(60 * env_or("LIMITER_ALERT_WINDOW_MINUTES", 3u64)),
        }
    }
}

/// Parse `+08:00`, `-0530`, `+8` or `Z` into a fixed offset.
pub fn parse_offset(raw: &str) -> Option<FixedOffset> {
    let raw = raw.trim();
    if raw.eq_ignore_ascii_case("z") || raw.eq_ignore_ascii_case("utc") {
        return FixedOffset::east_opt(0);
    }

    let (sign, rest) = match raw.chars().next()? {
        '+' => (1, &raw[1..]),
        '-' => (-1, &raw[1..]),
        _ => (1, raw),
    };

    let (hours, minutes) = match rest.split_once(':') {
        Some((h, m)) => (h.parse::<i32>().ok()?, m.parse::<i32>().ok()?),
        None if rest.len() == 4 => (rest[..2].parse().ok()?, rest[2..].parse().ok()?),
        None => (rest.parse().ok()?, 0),
    };

    if !(0..=23).contains(&hours) || !(0..=59).contains(&minutes) {
        return None;
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

fn default_offset() -> FixedOffset {
    // Asia/Shanghai, the deployment zone of the dashboard
    FixedOffset::east_opt(8 * 3600).unwrap_or_else(|| Utc.fix())
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| v.to_lowercase() == "true" || v == "1")
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_common_offset_spellings() {
        assert_eq!(parse_offset("+08:00").unwrap().local_minus_utc(), 8 * 3600);
        assert_eq!(parse_offset("-0530").unwrap().local_minus_utc(), -(5 * 3600 + 30 * 60));
        assert_eq!(parse_offset("+3").unwrap().local_minus_utc(), 3 * 3600);
        assert_eq!(parse_offset("Z").unwrap().local_minus_utc(), 0);
        assert!(parse_offset("+25:00").is_none());
        assert!(parse_offset("east").is_none());
    }

    #[test]
    fn failure_policy_from_str() {
        assert_eq!("fail_open".parse::<FailurePolicy>().unwrap(), FailurePolicy::FailOpen);
        assert_eq!("DENY".parse::<FailurePolicy>().unwrap(), FailurePolicy::FailClosed);
        assert!("maybe".parse::<FailurePolicy>().is_err());
    }

    #[test]
    fn defaults_are_fail_closed_and_shanghai_offset() {
        let config = AppConfig::default();
        assert_eq!(config.limiter.failure_policy, FailurePolicy::FailClosed);
        assert_eq!(config.scheduler.tz_offset.local_minus_utc(), 8 * 3600);
        assert_eq!(config.metrics.window, Duration::from_secs(60));
    }
}
