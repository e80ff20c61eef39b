//! Worker configuration.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use dolphin_models::JobKind;

use crate::retry::RetryPolicy;

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Maximum attempts this process runs at once
    pub max_concurrent_jobs: usize,
    /// Root for per-attempt temporary files
    pub work_dir: PathBuf,
    /// Sleep between polls when there is nothing to do
    pub poll_interval: Duration,
    /// How often delayed jobs are promoted and expired leases reaped
    pub reap_interval: Duration,
    /// How often a running job renews its lease and admission slot
    pub lease_renew_interval: Duration,
    /// Graceful shutdown timeout
    pub shutdown_timeout: Duration,
    /// Upper bound for a single FFmpeg invocation
    pub ffmpeg_timeout: Duration,
    pub video_retry: RetryPolicy,
    pub certificate_retry: RetryPolicy,
    /// Prometheus listener, disabled when unset
    pub metrics_addr: Option<SocketAddr>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 2,
            work_dir: PathBuf::from("/tmp/dolphin"),
            poll_interval: Duration::from_millis(500),
            reap_interval: Duration::from_secs(30),
            lease_renew_interval: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(60),
            ffmpeg_timeout: Duration::from_secs(600),
            video_retry: RetryPolicy::new(3, Duration::from_secs(5), Duration::from_secs(60)),
            certificate_retry: RetryPolicy::new(3, Duration::from_secs(2), Duration::from_secs(60)),
            metrics_addr: None,
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let max_delay = Duration::from_millis(env_or("BACKOFF_MAX_MS", 60_000));

        Self {
            max_concurrent_jobs: env_or("WORKER_MAX_JOBS", 2usize).max(1),
            work_dir: PathBuf::from(
                std::env::var("WORKER_WORK_DIR").unwrap_or_else(|_| "/tmp/dolphin".to_string()),
            ),
            poll_interval: Duration::from_millis(env_or("WORKER_POLL_INTERVAL_MS", 500)),
            reap_interval: Duration::from_secs(env_or("WORKER_REAP_INTERVAL_SECS", 30)),
            lease_renew_interval: Duration::from_secs(env_or("WORKER_LEASE_RENEW_SECS", 60)),
            shutdown_timeout: Duration::from_secs(env_or("WORKER_SHUTDOWN_TIMEOUT_SECS", 60)),
            ffmpeg_timeout: Duration::from_secs(env_or("FFMPEG_TIMEOUT_SECS", 600)),
            video_retry: RetryPolicy::new(
                env_or("VIDEO_MAX_ATTEMPTS", 3),
                Duration::from_millis(env_or("VIDEO_BACKOFF_BASE_MS", 5_000)),
                max_delay,
            ),
            certificate_retry: RetryPolicy::new(
                env_or("CERT_MAX_ATTEMPTS", 3),
                Duration::from_millis(env_or("CERT_BACKOFF_BASE_MS", 2_000)),
                max_delay,
            ),
            metrics_addr: std::env::var("METRICS_ADDR")
                .ok()
                .and_then(|s| s.parse().ok()),
        }
    }

    /// Keep lease renewal well inside the job lease and admission slot TTL.
    ///
    /// An interval at or above either TTL lets a healthy attempt lose its
    /// lease or slot between renewals. Such an interval is lowered to a third
    /// of the shorter TTL and the previous value is returned.
    pub fn clamp_lease_renew(&mut self, lease: Duration, slot_ttl: Duration) -> Option<Duration> {
        let shortest = lease.min(slot_ttl);
        if self.lease_renew_interval < shortest && !self.lease_renew_interval.is_zero() {
            return None;
        }
        let previous = self.lease_renew_interval;
        self.lease_renew_interval = (shortest / 3).max(Duration::from_secs(1));
        Some(previous)
    }

    pub fn retry_policy(&self, kind: JobKind) -> &RetryPolicy {
        match kind {
            JobKind::VideoGeneration => &self.video_retry,
            JobKind::CertificateGeneration => &self.certificate_retry,
        }
    }
}

/// Source clips, templates and output locations.
#[derive(Debug, Clone)]
pub struct AssetConfig {
    pub intro_clip: PathBuf,
    pub script_clip: PathBuf,
    pub video_output_dir: PathBuf,
    pub templates_dir: PathBuf,
    pub fonts_dir: PathBuf,
    pub certificate_output_dir: PathBuf,
    /// Base of every download URL, without a trailing slash
    pub public_url: String,
}

impl Default for AssetConfig {
    fn default() -> Self {
        Self {
            intro_clip: PathBuf::from("assets/videos/intro.mp4"),
            script_clip: PathBuf::from("assets/videos/script.mp4"),
            video_output_dir: PathBuf::from("output/videos"),
            templates_dir: PathBuf::from("assets/certificates"),
            fonts_dir: PathBuf::from("assets/fonts"),
            certificate_output_dir: PathBuf::from("output/certificates"),
            public_url: "http://localhost:5000".to_string(),
        }
    }
}

impl AssetConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let path = |name: &str, default: PathBuf| {
            std::env::var(name).map(PathBuf::from).unwrap_or(default)
        };

        Self {
            intro_clip: path("VIDEO_INTRO_PATH", defaults.intro_clip),
            script_clip: path("VIDEO_SCRIPT_PATH", defaults.script_clip),
            video_output_dir: path("VIDEO_OUTPUT_DIR", defaults.video_output_dir),
            templates_dir: path("CERT_TEMPLATES_DIR", defaults.templates_dir),
            fonts_dir: path("CERT_FONTS_DIR", defaults.fonts_dir),
            certificate_output_dir: path("CERTIFICATE_OUTPUT_DIR", defaults.certificate_output_dir),
            public_url: std::env::var("PUBLIC_URL")
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or(defaults.public_url),
        }
    }

    pub fn video_url(&self, file_name: &str) -> String {
        format!("{}/api/videos/download/{}", self.public_url, file_name)
    }

    pub fn certificate_url(&self, file_name: &str) -> String {
        format!("{}/api/certificates/download/{}", self.public_url, file_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_download_urls() {
        let assets = AssetConfig {
            public_url: "https://dolphin.example".to_string(),
            ..AssetConfig::default()
        };
        assert_eq!(
            assets.video_url("abc.mp4"),
            "https://dolphin.example/api/videos/download/abc.mp4"
        );
        assert_eq!(
            assets.certificate_url("abc_ar.png"),
            "https://dolphin.example/api/certificates/download/abc_ar.png"
        );
    }

    #[test]
    fn test_renew_interval_inside_ttls_is_kept() {
        let mut config = WorkerConfig::default();
        let clamped =
            config.clamp_lease_renew(Duration::from_secs(600), Duration::from_secs(600));
        assert_eq!(clamped, None);
        assert_eq!(config.lease_renew_interval, Duration::from_secs(60));
    }

    #[test]
    fn test_renew_interval_is_lowered_below_shorter_ttl() {
        let mut config = WorkerConfig {
            lease_renew_interval: Duration::from_secs(120),
            ..WorkerConfig::default()
        };
        let clamped =
            config.clamp_lease_renew(Duration::from_secs(600), Duration::from_secs(90));
        assert_eq!(clamped, Some(Duration::from_secs(120)));
        assert_eq!(config.lease_renew_interval, Duration::from_secs(30));

        // Equal to the lease is still too late.
        let mut config = WorkerConfig {
            lease_renew_interval: Duration::from_secs(60),
            ..WorkerConfig::default()
        };
        assert!(config
            .clamp_lease_renew(Duration::from_secs(60), Duration::from_secs(600))
            .is_some());
        assert_eq!(config.lease_renew_interval, Duration::from_secs(20));
    }

    #[test]
    fn test_zero_renew_interval_is_replaced() {
        let mut config = WorkerConfig {
            lease_renew_interval: Duration::ZERO,
            ..WorkerConfig::default()
        };
        config.clamp_lease_renew(Duration::from_secs(2), Duration::from_secs(2));
        assert_eq!(config.lease_renew_interval, Duration::from_secs(1));
    }

    #[test]
    fn test_retry_policy_per_kind() {
        let config = WorkerConfig::default();
        assert_eq!(
            config.retry_policy(JobKind::VideoGeneration).base_delay,
            Duration::from_secs(5)
        );
        assert_eq!(
            config.retry_policy(JobKind::CertificateGeneration).base_delay,
            Duration::from_secs(2)
        );
    }
}
