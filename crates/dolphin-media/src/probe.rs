//! Media inspection through ffprobe.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::command::check_ffprobe;
use crate::error::{MediaError, MediaResult};

const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// What ffprobe reports about a clip or audio file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaInfo {
    pub duration: f64,
    /// Zero for audio-only files
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub has_video: bool,
    pub has_audio: bool,
}

#[derive(Debug, Deserialize)]
struct ProbeReport {
    format: ProbeFormat,
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
}

#[derive(Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
enum StreamKind {
    Video,
    Audio,
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    codec_type: StreamKind,
    width: Option<u32>,
    height: Option<u32>,
    avg_frame_rate: Option<String>,
    r_frame_rate: Option<String>,
}

impl ProbeStream {
    fn fps(&self) -> Option<f64> {
        [&self.avg_frame_rate, &self.r_frame_rate]
            .into_iter()
            .flatten()
            .find_map(|rate| parse_rational(rate))
    }
}

/// Run ffprobe on `path`.
pub async fn probe_media(path: impl AsRef<Path>) -> MediaResult<MediaInfo> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(MediaError::FileNotFound(path.to_path_buf()));
    }
    let ffprobe = check_ffprobe()?;

    let run = Command::new(ffprobe)
        .args(["-v", "error", "-print_format", "json", "-show_format", "-show_streams"])
        .arg(path)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output();
    let output = tokio::time::timeout(PROBE_TIMEOUT, run)
        .await
        .map_err(|_| MediaError::Timeout(PROBE_TIMEOUT.as_secs()))??;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(MediaError::ffprobe_failed(
            format!("could not read {}", path.display()),
            (!stderr.is_empty()).then_some(stderr),
        ));
    }

    parse_report(&output.stdout)
}

/// Container duration in seconds.
pub async fn get_duration(path: impl AsRef<Path>) -> MediaResult<f64> {
    Ok(probe_media(path).await?.duration)
}

fn parse_report(json: &[u8]) -> MediaResult<MediaInfo> {
    let report: ProbeReport = serde_json::from_slice(json)?;

    let duration = match report.format.duration.as_deref().map(str::parse::<f64>) {
        Some(Ok(d)) if d.is_finite() && d >= 0.0 => d,
        _ => return Err(MediaError::invalid_media("missing or malformed duration")),
    };

    let video = report.streams.iter().find(|s| s.codec_type == StreamKind::Video);
    let has_audio = report.streams.iter().any(|s| s.codec_type == StreamKind::Audio);

    let Some(video) = video else {
        if !has_audio {
            return Err(MediaError::invalid_media("no audio or video stream"));
        }
        return Ok(MediaInfo {
            duration,
            width: 0,
            height: 0,
            fps: 0.0,
            has_video: false,
            has_audio,
        });
    };

    Ok(MediaInfo {
        duration,
        width: video.width.unwrap_or(0),
        height: video.height.unwrap_or(0),
        fps: video.fps().unwrap_or(0.0),
        has_video: true,
        has_audio,
    })
}

/// "30000/1001" or "29.97".
fn parse_rational(rate: &str) -> Option<f64> {
    let value = match rate.split_once('/') {
        Some((num, den)) => {
            let den: f64 = den.trim().parse().ok()?;
            if den == 0.0 {
                return None;
            }
            num.trim().parse::<f64>().ok()? / den
        }
        None => rate.trim().parse().ok()?,
    };
    (value.is_finite() && value > 0.0).then_some(value)
}
