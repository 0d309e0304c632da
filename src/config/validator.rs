use crate::config::AppConfig;
use crate::errors::{LimiterError, Result};
use crate::quota::{
    LeakyBucketConfig, Policy, Quota, TokenBucketConfig, LEAKY_BUCKET, TOKEN_BUCKET,
};
use tracing::{debug, warn};

const MAX_ID_LEN: usize = 100;

/// Validate the entire application configuration
pub fn validate_config(config: &AppConfig) -> Result<()> {
    debug!("Validating configuration...");

    if config.server.host.is_empty() {
        return Err(LimiterError::InvalidConfig(
            "HTTP host cannot be empty".to_string(),
        ));
    }

    if config.metrics_port != 0 && config.metrics_port == config.server.port {
        return Err(LimiterError::InvalidConfig(format!(
            "metrics port {} collides with the HTTP port",
            config.metrics_port
        )));
    }

    if config.traces.queue_capacity == 0 {
        return Err(LimiterError::InvalidConfig(
            "trace queue capacity must be greater than 0".to_string(),
        ));
    }

    if config.metrics.window.is_zero() {
        return Err(LimiterError::InvalidConfig(
            "metrics window must be greater than 0".to_string(),
        ));
    }

    if config.metrics.series_capacity == 0 || config.metrics.reservoir_size == 0 {
        return Err(LimiterError::InvalidConfig(
            "series capacity and reservoir size must be greater than 0".to_string(),
        ));
    }

    if config.events.buffer == 0 {
        return Err(LimiterError::InvalidConfig(
            "event buffer must be greater than 0".to_string(),
        ));
    }

    if config.scheduler.tick.is_zero() {
        return Err(LimiterError::InvalidConfig(
            "scheduler tick must be greater than 0".to_string(),
        ));
    }

    let alerts = &config.scheduler.alerts;
    for (name, value) in [("error rate", alerts.error_rate), ("429 rate", alerts.rate_429)] {
        if !(0.0..=1.0).contains(&value) {
            return Err(LimiterError::InvalidConfig(format!(
                "alert {} threshold must be within [0, 1] (got {})",
                name, value
            )));
        }
    }

    if config.limiter.lock_timeout.is_zero() {
        warn!("Lock timeout is zero; every contended admission will hit the failure policy");
    }

    debug!("Configuration validation successful");
    Ok(())
}

/// Validate a quota definition and derive its engine policy.
///
/// Nothing is applied when this returns an error.
pub fn validate_quota(quota: &Quota) -> Result<Policy> {
    let id = quota.id.as_str();

    if id.trim().is_empty() {
        return Err(LimiterError::InvalidConfig(
            "Quota id cannot be empty".to_string(),
        ));
    }

    if id.len() > MAX_ID_LEN || id.trim() != id {
        return Err(LimiterError::InvalidConfig(format!(
            "Quota id '{}' must be at most {} characters without surrounding whitespace",
            id, MAX_ID_LEN
        )));
    }

    if quota.capacity <= 0 {
        return Err(LimiterError::InvalidConfig(format!(
            "capacity must be positive for quota '{}' (got {})",
            id, quota.capacity
        )));
    }
    let capacity = quota.capacity as f64;

    let policy = match quota.algo.as_str() {
        TOKEN_BUCKET => {
            let refill_rate = validate_rate(id, "refill_rate", quota.refill_rate)?;
            let burst = match quota.burst {
                Some(burst) if burst < 0 => {
                    return Err(LimiterError::InvalidConfig(format!(
                        "burst cannot be negative for quota '{}' (got {})",
                        id, burst
                    )));
                }
                Some(burst) => burst as f64,
                None => 0.0,
            };
            Policy::TokenBucket(TokenBucketConfig {
                capacity,
                refill_rate,
                burst,
            })
        }
        LEAKY_BUCKET => {
            let leak_rate = match quota.leak_rate {
                Some(rate) => validate_rate(id, "leak_rate", rate)?,
                None => {
                    warn!(
                        "Leaky bucket quota '{}' has no leak_rate; its queue will never drain",
                        id
                    );
                    0.0
                }
            };
            Policy::LeakyBucket(LeakyBucketConfig {
                capacity,
                leak_rate,
            })
        }
        other => {
            return Err(LimiterError::InvalidConfig(format!(
                "unknown algo '{}' for quota '{}' (expected {} or {})",
                other, id, TOKEN_BUCKET, LEAKY_BUCKET
            )));
        }
    };

    warn_on_fill_time(id, &policy);
    Ok(policy)
}

fn validate_rate(id: &str, field: &str, rate: f64) -> Result<f64> {
    if !rate.is_finite() || rate < 0.0 {
        return Err(LimiterError::InvalidConfig(format!(
            "{} must be a non-negative number for quota '{}' (got {})",
            field, id, rate
        )));
    }

    if rate > 1_000_000.0 {
        warn!("Very high {} ({}) for quota '{}'", field, rate, id);
    }

    Ok(rate)
}

/// Flag configurations that are legal but probably not what was meant.
fn warn_on_fill_time(id: &str, policy: &Policy) {
    let (capacity, rate) = match policy {
        Policy::TokenBucket(cfg) => (cfg.capacity, cfg.refill_rate),
        Policy::LeakyBucket(cfg) => (cfg.capacity, cfg.leak_rate),
    };

    if rate == 0.0 {
        return;
    }

    let seconds_to_fill = capacity / rate;
    if seconds_to_fill > 86400.0 {
        warn!(
            "Quota '{}' takes {:.2} hours to refill completely",
            id,
            seconds_to_fill / 3600.0
        );
    }
}
