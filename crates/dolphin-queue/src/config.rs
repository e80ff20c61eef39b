//! Store and admission configuration.

use std::time::Duration;

use dolphin_models::JobKind;

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// Durable store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Redis URL
    pub redis_url: String,
    /// Prefix for every key the store touches
    pub key_prefix: String,
    /// How long a dequeued job stays owned without renewal
    pub lease: Duration,
    /// Retention of terminal job records
    pub record_ttl: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            key_prefix: "dolphin".to_string(),
            lease: Duration::from_secs(600), // 10 minutes
            record_ttl: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

impl StoreConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self {
            redis_url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            key_prefix: std::env::var("QUEUE_KEY_PREFIX").unwrap_or_else(|_| "dolphin".to_string()),
            lease: Duration::from_secs(env_or("QUEUE_LEASE_SECS", 600)),
            record_ttl: Duration::from_secs(env_or("JOB_RECORD_TTL_SECS", 7 * 24 * 3600)),
        }
    }
}

/// Admission gate configuration.
#[derive(Debug, Clone)]
pub struct AdmissionConfig {
    /// Attempts allowed in flight across every worker
    pub max_concurrent: usize,
    /// Expiry of a slot whose holder stopped renewing it
    pub slot_ttl: Duration,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            slot_ttl: Duration::from_secs(600),
        }
    }
}

impl AdmissionConfig {
    pub fn from_env() -> Self {
        Self {
            max_concurrent: env_or("MAX_CONCURRENT_JOBS", 10),
            slot_ttl: Duration::from_secs(env_or("ADMISSION_SLOT_TTL_SECS", 600)),
        }
    }
}

/// Attempts granted to each job kind at enqueue time.
#[derive(Debug, Clone, Copy)]
pub struct AttemptLimits {
    pub video: u32,
    pub certificate: u32,
}

impl Default for AttemptLimits {
    fn default() -> Self {
        Self {
            video: 3,
            certificate: 3,
        }
    }
}

impl AttemptLimits {
    pub fn from_env() -> Self {
        Self {
            video: env_or("VIDEO_MAX_ATTEMPTS", 3),
            certificate: env_or("CERT_MAX_ATTEMPTS", 3),
        }
    }

    pub fn for_kind(&self, kind: JobKind) -> u32 {
        match kind {
            JobKind::VideoGeneration => self.video,
            JobKind::CertificateGeneration => self.certificate,
        }
    }
}
