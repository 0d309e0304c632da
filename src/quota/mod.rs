pub mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::validator::validate_quota;
use crate::errors::Result;

pub use store::{JsonFileBackend, MemoryBackend, QuotaBackend, QuotaStore};

pub const TOKEN_BUCKET: &str = "token_bucket";
pub const LEAKY_BUCKET: &str = "leaky_bucket";

/// Stored quota definition, in the flat shape the dashboard reads and writes.
///
/// The engine never looks at these fields directly; it works on the
/// [`Policy`] returned by [`Quota::policy`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quota {
    pub id: String,

    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub domain: Option<String>,

    #[serde(default)]
    pub endpoint: Option<String>,

    #[serde(default = "default_algo")]
    pub algo: String,

    #[serde(default = "default_capacity")]
    pub capacity: i64,

    /// Tokens per second, token bucket only
    #[serde(default = "default_refill_rate")]
    pub refill_rate: f64,

    /// Tokens per second, leaky bucket only
    #[serde(default)]
    pub leak_rate: Option<f64>,

    #[serde(default)]
    pub burst: Option<i64>,

    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub notes: Option<String>,

    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,

    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl Quota {
    /// Validate the definition and derive the engine policy from it.
    pub fn policy(&self) -> Result<Policy> {
        validate_quota(self)
    }
}

/// Body of `POST /quotas`.
#[derive(Debug, Clone, Deserialize)]
pub struct NewQuota {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_algo")]
    pub algo: String,
    #[serde(default = "default_capacity")]
    pub capacity: i64,
    #[serde(default = "default_refill_rate")]
    pub refill_rate: f64,
    #[serde(default)]
    pub leak_rate: Option<f64>,
    #[serde(default)]
    pub burst: Option<i64>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub notes: Option<String>,
}

impl NewQuota {
    pub fn into_quota(self, now: DateTime<Utc>) -> Quota {
        Quota {
            id: self.id,
            name: self.name,
            domain: self.domain,
            endpoint: self.endpoint,
            algo: self.algo,
            capacity: self.capacity,
            refill_rate: self.refill_rate,
            leak_rate: self.leak_rate,
            burst: self.burst,
            enabled: self.enabled,
            notes: self.notes,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Body of `PUT /quotas/{id}`. Absent fields are left unchanged; the id is
/// not patchable.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct QuotaPatch {
    pub name: Option<String>,
    pub domain: Option<String>,
    pub endpoint: Option<String>,
    pub algo: Option<String>,
    pub capacity: Option<i64>,
    pub refill_rate: Option<f64>,
    pub leak_rate: Option<f64>,
    pub burst: Option<i64>,
    pub enabled: Option<bool>,
    pub notes: Option<String>,
}

impl QuotaPatch {
    pub fn apply_to(self, quota: &Quota, now: DateTime<Utc>) -> Quota {
        let mut next = quota.clone();
        if let Some(v) = self.name {
            next.name = Some(v);
        }
        if let Some(v) = self.domain {
            next.domain = Some(v);
        }
        if let Some(v) = self.endpoint {
            next.endpoint = Some(v);
        }
        if let Some(v) = self.algo {
            next.algo = v;
        }
        if let Some(v) = self.capacity {
            next.capacity = v;
        }
        if let Some(v) = self.refill_rate {
            next.refill_rate = v;
        }
        if let Some(v) = self.leak_rate {
            next.leak_rate = Some(v);
        }
        if let Some(v) = self.burst {
            next.burst = Some(v);
        }
        if let Some(v) = self.enabled {
            next.enabled = v;
        }
        if let Some(v) = self.notes {
            next.notes = Some(v);
        }
        next.updated_at = now;
        next
    }
}

/// Quota as returned by the API: the stored definition plus the live level.
#[derive(Debug, Clone, Serialize)]
pub struct QuotaView {
    #[serde(flatten)]
    pub quota: Quota,
    pub current_tokens: Option<f64>,
}

/// Admission algorithm with only the parameters that algorithm uses.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Policy {
    TokenBucket(TokenBucketConfig),
    LeakyBucket(LeakyBucketConfig),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenBucketConfig {
    pub capacity: f64,
    pub refill_rate: f64,
    pub burst: f64,
}

impl TokenBucketConfig {
    /// Highest level the bucket may hold.
    pub fn ceiling(&self) -> f64 {
        self.capacity + self.burst
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LeakyBucketConfig {
    pub capacity: f64,
    pub leak_rate: f64,
}

impl Policy {
    /// Nominal capacity, as shown to observers.
    pub fn capacity(&self) -> f64 {
        match self {
            Policy::TokenBucket(cfg) => cfg.capacity,
            Policy::LeakyBucket(cfg) => cfg.capacity,
        }
    }

    pub fn algo(&self) -> &'static str {
        match self {
            Policy::TokenBucket(_) => TOKEN_BUCKET,
            Policy::LeakyBucket(_) => LEAKY_BUCKET,
        }
    }

    pub fn same_algorithm(&self, other: &Policy) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

fn default_algo() -> String {
    TOKEN_BUCKET.to_string()
}

fn default_capacity() -> i64 {
    60
}

fn default_refill_rate() -> f64 {
    1.0
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_body_fills_documented_defaults() {
        let body: NewQuota = serde_json::from_str(r#"{"id": "search"}"#).unwrap();
        let quota = body.into_quota(Utc::now());

        assert_eq!(quota.algo, TOKEN_BUCKET);
        assert_eq!(quota.capacity, 60);
        assert_eq!(quota.refill_rate, 1.0);
        assert!(quota.enabled);
        assert_eq!(quota.created_at, quota.updated_at);
    }

    #[test]
    fn patch_keeps_id_and_creation_time() {
        let created = Utc::now() - chrono::Duration::hours(1);
        let quota = NewQuota {
            id: "search".into(),
            name: None,
            domain: None,
            endpoint: None,
            algo: TOKEN_BUCKET.into(),
            capacity: 10,
            refill_rate: 1.0,
            leak_rate: None,
            burst: None,
            enabled: true,
            notes: None,
        }
        .into_quota(created);

        let patch = QuotaPatch { capacity: Some(20), name: Some("Search".into()), ..Default::default() };
        let now = Utc::now();
        let next = patch.apply_to(&quota, now);

        assert_eq!(next.id, "search");
        assert_eq!(next.capacity, 20);
        assert_eq!(next.name.as_deref(), Some("Search"));
        assert_eq!(next.created_at, created);
        assert_eq!(next.updated_at, now);
    }

    #[test]
    fn view_flattens_the_definition() {
        let quota = NewQuota {
            id: "q".into(),
            name: None,
            domain: None,
            endpoint: None,
            algo: LEAKY_BUCKET.into(),
            capacity: 5,
            refill_rate: 0.0,
            leak_rate: Some(2.0),
            burst: None,
            enabled: false,
            notes: None,
        }
        .into_quota(Utc::now());
        let view = QuotaView { quota, current_tokens: Some(3.0) };

        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["id"], "q");
        assert_eq!(json["algo"], "leaky_bucket");
        assert_eq!(json["current_tokens"], 3.0);
    }
}
