//! Video normalization, freeze-frame extension, muxing and concatenation.
//!
//! Every output shares one encoding profile so the final concatenation never
//! has to reconcile resolutions, frame rates or audio layouts.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, info};

use crate::command::{FfmpegCommand, FfmpegRunner};
use crate::error::{MediaError, MediaResult};
use crate::probe::{get_duration, probe_media};

/// Offset from the end used when grabbing the last frame.
pub const LAST_FRAME_OFFSET_SECS: f64 = 0.05;

/// Media transform adapter.
///
/// Callers allocate every output path; implementations only write to it.
#[async_trait]
pub trait MediaTransform: Send + Sync {
    /// Re-encode a clip to the common profile.
    async fn normalize(&self, input: &Path, output: &Path) -> MediaResult<()>;

    /// Grab the final frame of a clip as an image.
    async fn extract_last_frame(&self, input: &Path, output: &Path) -> MediaResult<()>;

    /// Turn a still image into a clip of `duration` seconds.
    async fn image_to_video(&self, image: &Path, duration: f64, output: &Path) -> MediaResult<()>;

    /// Replace the audio of `video` with `audio`, stopping at the shorter one.
    async fn mux_audio_video(&self, video: &Path, audio: &Path, output: &Path) -> MediaResult<()>;

    /// Join clips end to end.
    async fn concatenate(&self, inputs: &[PathBuf], output: &Path) -> MediaResult<()>;

    /// Duration in seconds.
    async fn duration(&self, path: &Path) -> MediaResult<f64>;
}

/// Target encoding profile.
#[derive(Debug, Clone)]
pub struct NormalizeProfile {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub video_codec: String,
    pub preset: String,
    pub crf: u8,
    pub pixel_format: String,
    pub audio_codec: String,
    pub audio_rate: u32,
    pub audio_channels: u8,
    pub audio_bitrate: String,
}

impl Default for NormalizeProfile {
    fn default() -> Self {
        Self {
            width: 1080,
            height: 1920,
            fps: 30,
            video_codec: "libx264".to_string(),
            preset: "faster".to_string(),
            crf: 23,
            pixel_format: "yuv420p".to_string(),
            audio_codec: "aac".to_string(),
            audio_rate: 44100,
            audio_channels: 2,
            audio_bitrate: "192k".to_string(),
        }
    }
}

impl NormalizeProfile {
    /// Fit inside the frame, pad the rest with black, resample the frame rate.
    pub fn fit_filter(&self) -> String {
        format!(
            "scale={w}:{h}:force_original_aspect_ratio=decrease,setsar=1,\
             pad={w}:{h}:({w}-iw)/2:({h}-ih)/2:color=black,fps={fps},format={pix}",
            w = self.width,
            h = self.height,
            fps = self.fps,
            pix = self.pixel_format
        )
    }

    /// Silent source matching the audio layout.
    pub fn silence_source(&self) -> String {
        format!(
            "anullsrc=channel_layout={}:sample_rate={}",
            channel_layout(self.audio_channels),
            self.audio_rate
        )
    }

    fn encode(&self, cmd: FfmpegCommand) -> FfmpegCommand {
        cmd.video_codec(&self.video_codec)
            .preset(&self.preset)
            .crf(self.crf)
            .pixel_format(&self.pixel_format)
            .audio_codec(&self.audio_codec)
            .audio_bitrate(&self.audio_bitrate)
            .audio_rate(self.audio_rate)
            .audio_channels(self.audio_channels)
    }
}

fn channel_layout(channels: u8) -> &'static str {
    if channels == 1 {
        "mono"
    } else {
        "stereo"
    }
}

/// Build the concat graph. `silent[i]` holds the duration of a silent track
/// to synthesize for a video-only segment.
fn concat_filter(silent: &[Option<f64>], silence_source: &str) -> String {
    let mut graph = String::new();
    let mut pads = String::new();

    for (i, gap) in silent.iter().enumerate() {
        match gap {
            Some(duration) => {
                graph.push_str(&format!(
                    "{},atrim=0:{:.3}[s{}];",
                    silence_source, duration, i
                ));
                pads.push_str(&format!("[{}:v:0][s{}]", i, i));
            }
            None => pads.push_str(&format!("[{}:v:0][{}:a:0]", i, i)),
        }
    }

    graph.push_str(&format!(
        "{}concat=n={}:v=1:a=1[outv][outa]",
        pads,
        silent.len()
    ));
    graph
}

/// FFmpeg-backed transform adapter.
#[derive(Debug, Clone, Default)]
pub struct FfmpegTransform {
    profile: NormalizeProfile,
    timeout_secs: Option<u64>,
}

impl FfmpegTransform {
    pub fn new(profile: NormalizeProfile) -> Self {
        Self {
            profile,
            timeout_secs: None,
        }
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn profile(&self) -> &NormalizeProfile {
        &self.profile
    }

    fn runner(&self, operation: &'static str) -> FfmpegRunner {
        let runner = FfmpegRunner::new().operation(operation);
        match self.timeout_secs {
            Some(secs) => runner.with_timeout(secs),
            None => runner,
        }
    }
}

fn require_input(path: &Path) -> MediaResult<()> {
    if path.exists() {
        Ok(())
    } else {
        Err(MediaError::FileNotFound(path.to_path_buf()))
    }
}

#[async_trait]
impl MediaTransform for FfmpegTransform {
    async fn normalize(&self, input: &Path, output: &Path) -> MediaResult<()> {
        let info = probe_media(input).await?;
        if !info.has_video {
            return Err(MediaError::invalid_media(format!(
                "{} has no video stream",
                input.display()
            )));
        }

        let mut cmd = FfmpegCommand::new(output).input(input);
        if !info.has_audio {
            // Concatenation needs an audio stream on every segment.
            cmd = cmd
                .lavfi_input(self.profile.silence_source())
                .map("0:v:0")
                .map("1:a:0")
                .shortest();
        }
        let cmd = self
            .profile
            .encode(cmd.video_filter(self.profile.fit_filter()));

        self.runner("normalize").run(&cmd).await?;
        debug!(input = %input.display(), "Normalized clip");
        Ok(())
    }

    async fn extract_last_frame(&self, input: &Path, output: &Path) -> MediaResult<()> {
        let duration = get_duration(input).await?;
        let seek = (duration - LAST_FRAME_OFFSET_SECS).max(0.0);

        let cmd = FfmpegCommand::new(output)
            .input_with(["-ss".to_string(), format!("{:.3}", seek)], input.to_string_lossy())
            .single_frame();

        self.runner("extract_last_frame").run(&cmd).await
    }

    async fn image_to_video(&self, image: &Path, duration: f64, output: &Path) -> MediaResult<()> {
        require_input(image)?;
        if !(duration.is_finite() && duration > 0.0) {
            return Err(MediaError::invalid_media(format!(
                "invalid still duration {}",
                duration
            )));
        }

        let cmd = FfmpegCommand::new(output)
            .input_with(["-loop", "1"], image.to_string_lossy())
            .lavfi_input(self.profile.silence_source())
            .map("0:v:0")
            .map("1:a:0")
            .video_filter(self.profile.fit_filter())
            .duration(duration);
        let cmd = self.profile.encode(cmd);

        self.runner("image_to_video").run(&cmd).await
    }

    async fn mux_audio_video(&self, video: &Path, audio: &Path, output: &Path) -> MediaResult<()> {
        require_input(video)?;
        require_input(audio)?;

        let cmd = FfmpegCommand::new(output)
            .input(video)
            .input(audio)
            .map("0:v:0")
            .map("1:a:0")
            .video_filter(format!(
                "fps={},format={}",
                self.profile.fps, self.profile.pixel_format
            ));
        let cmd = self.profile.encode(cmd).shortest().faststart();

        self.runner("mux").run(&cmd).await
    }

    async fn concatenate(&self, inputs: &[PathBuf], output: &Path) -> MediaResult<()> {
        if inputs.is_empty() {
            return Err(MediaError::invalid_media("nothing to concatenate"));
        }

        let mut cmd = FfmpegCommand::new(output);
        let mut silent = Vec::with_capacity(inputs.len());
        for input in inputs {
            let info = probe_media(input).await?;
            silent.push((!info.has_audio).then_some(info.duration));
            cmd = cmd.input(input);
        }

        let cmd = cmd
            .filter_complex(concat_filter(&silent, &self.profile.silence_source()))
            .map("[outv]")
            .map("[outa]")
            .frame_rate(self.profile.fps);
        let cmd = self.profile.encode(cmd).faststart();

        self.runner("concatenate").run(&cmd).await?;
        info!(segments = inputs.len(), output = %output.display(), "Concatenated clips");
        Ok(())
    }

    async fn duration(&self, path: &Path) -> MediaResult<f64> {
        get_duration(path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fit_filter_matches_portrait_profile() {
        let filter = NormalizeProfile::default().fit_filter();
        assert_eq!(
            filter,
            "scale=1080:1920:force_original_aspect_ratio=decrease,setsar=1,\
             pad=1080:1920:(1080-iw)/2:(1920-ih)/2:color=black,fps=30,format=yuv420p"
        );
    }

    #[test]
    fn test_concat_filter_with_audio_on_every_segment() {
        let filter = concat_filter(&[None, None], "anullsrc");
        assert_eq!(
            filter,
            "[0:v:0][0:a:0][1:v:0][1:a:0]concat=n=2:v=1:a=1[outv][outa]"
        );
    }

    #[test]
    fn test_concat_filter_synthesizes_silence_for_video_only_segment() {
        let filter = concat_filter(&[None, Some(2.5)], "anullsrc=channel_layout=stereo:sample_rate=44100");
        assert!(filter.starts_with(
            "anullsrc=channel_layout=stereo:sample_rate=44100,atrim=0:2.500[s1];"
        ));
        assert!(filter.ends_with("[0:v:0][0:a:0][1:v:0][s1]concat=n=2:v=1:a=1[outv][outa]"));
    }

    #[test]
    fn test_silence_source_follows_profile() {
        let profile = NormalizeProfile {
            audio_channels: 1,
            audio_rate: 22050,
            ..NormalizeProfile::default()
        };
        assert_eq!(
            profile.silence_source(),
            "anullsrc=channel_layout=mono:sample_rate=22050"
        );
    }

    #[tokio::test]
    async fn test_missing_inputs_fail_before_spawning() {
        let transform = FfmpegTransform::default();
        let err = transform
            .mux_audio_video(Path::new("/nonexistent/v.mp4"), Path::new("/nonexistent/a.wav"), Path::new("/tmp/o.mp4"))
            .await
            .unwrap_err();
        assert!(matches!(err, MediaError::FileNotFound(_)));

        let err = transform
            .concatenate(&[], Path::new("/tmp/o.mp4"))
            .await
            .unwrap_err();
        assert!(matches!(err, MediaError::InvalidMedia(_)));
    }
}
