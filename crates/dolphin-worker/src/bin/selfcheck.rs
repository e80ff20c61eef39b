use std::path::Path;

use dolphin_media::{check_ffmpeg, check_ffprobe, FfmpegCompositor};
use dolphin_models::Language;
use dolphin_worker::{AssetConfig, WorkerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = WorkerConfig::from_env();
    let assets = AssetConfig::from_env();

    println!(
        "dolphin-selfcheck: starting with work_dir={}",
        config.work_dir.display()
    );
    ensure_dir(&config.work_dir).await?;
    ensure_dir(&assets.video_output_dir).await?;
    ensure_dir(&assets.certificate_output_dir).await?;

    let ffmpeg = check_ffmpeg().map_err(|e| anyhow::anyhow!("ffmpeg not available: {}", e))?;
    let ffprobe = check_ffprobe().map_err(|e| anyhow::anyhow!("ffprobe not available: {}", e))?;
    println!("dolphin-selfcheck: ffmpeg={} ffprobe={}", ffmpeg.display(), ffprobe.display());

    ensure_file(&assets.intro_clip)?;
    ensure_file(&assets.script_clip)?;

    let compositor = FfmpegCompositor::new(&assets.templates_dir, &assets.fonts_dir);
    for language in [Language::Ar, Language::En] {
        let (template, font) = compositor.asset_paths(language);
        ensure_file(&template)?;
        ensure_file(&font)?;
    }

    ensure_env_present(&["REDIS_URL", "AZURE_SPEECH_KEY", "AZURE_SPEECH_REGION"])?;

    println!("dolphin-selfcheck: ok");
    Ok(())
}

async fn ensure_dir(path: &Path) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|e| anyhow::anyhow!("cannot create {}: {}", path.display(), e))
}

fn ensure_file(path: &Path) -> anyhow::Result<()> {
    if !path.is_file() {
        return Err(anyhow::anyhow!("missing asset {}", path.display()));
    }
    Ok(())
}

fn ensure_env_present(vars: &[&str]) -> anyhow::Result<()> {
    for var in vars {
        if std::env::var(var).is_err() {
            return Err(anyhow::anyhow!("missing required env var {}", var));
        }
    }
    Ok(())
}
