//! Generation worker binary.

use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use dolphin_media::{AzureSpeech, FfmpegCompositor, FfmpegTransform, NormalizeProfile, SpeechConfig};
use dolphin_queue::{AdmissionConfig, RedisAdmissionGate, RedisJobStore, StoreConfig};
use dolphin_worker::{
    metrics, AssetConfig, CertificatePipeline, JobExecutor, Pipeline, VideoPipeline, WorkerConfig,
};

fn init_tracing() -> anyhow::Result<()> {
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let env_filter = EnvFilter::from_default_env()
        .add_directive("dolphin=info".parse()?)
        .add_directive("dolphin_worker=info".parse()?)
        .add_directive("dolphin_queue=info".parse()?)
        .add_directive("dolphin_media=info".parse()?);

    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_ansi(true)
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .with(env_filter)
            .init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // reqwest and redis both speak TLS through rustls
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    dotenvy::dotenv().ok();
    init_tracing()?;

    info!("Starting dolphin-worker");

    let mut config = WorkerConfig::from_env();
    let assets = AssetConfig::from_env();
    let store_config = StoreConfig::from_env();
    let admission_config = AdmissionConfig::from_env();
    let lease = store_config.lease;
    if let Some(requested) = config.clamp_lease_renew(lease, admission_config.slot_ttl) {
        warn!(
            "WORKER_LEASE_RENEW_SECS={}s is not below the job lease ({}s) and slot TTL ({}s); renewing every {}s instead",
            requested.as_secs(),
            lease.as_secs(),
            admission_config.slot_ttl.as_secs(),
            config.lease_renew_interval.as_secs()
        );
    }
    info!("Worker config: {:?}", config);

    if let Some(addr) = config.metrics_addr {
        metrics::install_exporter(addr).context("failed to install metrics exporter")?;
        info!("Serving metrics on {}", addr);
    }

    let gate = RedisAdmissionGate::new(&store_config, admission_config)
        .context("failed to create admission gate")?;
    let store = RedisJobStore::new(store_config).context("failed to create job store")?;
    if let Err(e) = store.ping().await {
        // The executor keeps polling; Redis may come up later.
        error!("Redis is not reachable yet: {}", e);
    }

    let speech_config = SpeechConfig::from_env();
    let voice = speech_config.voice();
    let speech = AzureSpeech::new(speech_config).context("failed to create speech client")?;
    let ffmpeg_timeout = config.ffmpeg_timeout.as_secs();
    let transform = FfmpegTransform::new(NormalizeProfile::default()).with_timeout(ffmpeg_timeout);
    let compositor =
        FfmpegCompositor::new(&assets.templates_dir, &assets.fonts_dir).with_timeout(ffmpeg_timeout);

    let pipelines: Vec<Arc<dyn Pipeline>> = vec![
        Arc::new(VideoPipeline::new(
            Arc::new(speech),
            Arc::new(transform),
            voice,
            assets.clone(),
        )),
        Arc::new(CertificatePipeline::new(Arc::new(compositor), assets)),
    ];

    let executor = Arc::new(JobExecutor::new(
        config,
        Arc::new(store),
        Arc::new(gate),
        lease,
        pipelines,
    ));

    let signal_executor = Arc::clone(&executor);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal");
            signal_executor.shutdown();
        }
    });

    executor.run().await.context("executor error")?;

    info!("Worker shutdown complete");
    Ok(())
}
