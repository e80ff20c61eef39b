//! Narrated greeting video.
//!
//! The intro clip is stretched with a frozen last frame when the greeting
//! runs longer than it, narrated, and joined with the script clip.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::fs;
use tracing::debug;

use dolphin_media::{greeting_text, rename_into_place, MediaError, MediaTransform, SpeechSynthesizer, VoiceProfile};
use dolphin_models::{JobKind, JobPayload, JobRecord, JobResult};

use crate::config::AssetConfig;
use crate::error::{WorkerError, WorkerResult};
use crate::pipeline::{partial_path, Pipeline, StageContext, StageTimer};

/// Narration may outrun the intro by this much before the intro is extended.
pub const EXTENSION_TOLERANCE_SECS: f64 = 0.05;

/// Longest freeze-frame filler appended to the intro.
pub const MAX_EXTENSION_SECS: f64 = 5.0;

/// Filler needed to cover `audio` seconds of narration with `video` seconds
/// of intro, or `None` when the intro is long enough.
pub fn extension_duration(audio: f64, video: f64) -> Option<f64> {
    if audio > video + EXTENSION_TOLERANCE_SECS {
        Some((audio - video).min(MAX_EXTENSION_SECS))
    } else {
        None
    }
}

/// Stages of the video pipeline, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoStage {
    Synthesize,
    Normalize,
    Extend,
    Concatenate,
    Publish,
    Done,
}

impl VideoStage {
    pub const ALL: [VideoStage; 6] = [
        VideoStage::Synthesize,
        VideoStage::Normalize,
        VideoStage::Extend,
        VideoStage::Concatenate,
        VideoStage::Publish,
        VideoStage::Done,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            VideoStage::Synthesize => "synthesize",
            VideoStage::Normalize => "normalize",
            VideoStage::Extend => "extend",
            VideoStage::Concatenate => "concatenate",
            VideoStage::Publish => "publish",
            VideoStage::Done => "done",
        }
    }

    pub fn checkpoint(&self) -> u8 {
        match self {
            VideoStage::Synthesize => 10,
            VideoStage::Normalize => 30,
            VideoStage::Extend => 50,
            VideoStage::Concatenate => 80,
            VideoStage::Publish => 95,
            VideoStage::Done => 100,
        }
    }

    /// Stage log message. Publishing is silent.
    pub fn message(&self) -> &'static str {
        match self {
            VideoStage::Synthesize => "🎤 جاري إنشاء الصوت...",
            VideoStage::Normalize => "🎬 جاري تجهيز الفيديو...",
            VideoStage::Extend => "✨ نضيف اللمسة السحرية...",
            VideoStage::Concatenate => "🎯 اقتربنا من النهاية...",
            VideoStage::Publish => "",
            VideoStage::Done => "🎉 تم إنشاء الفيديو بنجاح!",
        }
    }
}

async fn enter(ctx: &StageContext, stage: VideoStage) -> WorkerResult<StageTimer> {
    ctx.enter(stage.name(), stage.checkpoint(), stage.message()).await
}

async fn require_source(path: &Path) -> WorkerResult<()> {
    match fs::metadata(path).await {
        Ok(meta) if meta.is_file() => Ok(()),
        _ => Err(MediaError::AssetMissing(path.to_path_buf()).into()),
    }
}

/// Builds the narrated greeting video.
pub struct VideoPipeline {
    speech: Arc<dyn SpeechSynthesizer>,
    transform: Arc<dyn MediaTransform>,
    voice: VoiceProfile,
    assets: AssetConfig,
}

impl VideoPipeline {
    pub fn new(
        speech: Arc<dyn SpeechSynthesizer>,
        transform: Arc<dyn MediaTransform>,
        voice: VoiceProfile,
        assets: AssetConfig,
    ) -> Self {
        Self {
            speech,
            transform,
            voice,
            assets,
        }
    }
}

#[async_trait]
impl Pipeline for VideoPipeline {
    fn kind(&self) -> JobKind {
        JobKind::VideoGeneration
    }

    async fn run(&self, job: &JobRecord, ctx: &StageContext) -> WorkerResult<JobResult> {
        if !matches!(job.payload, JobPayload::VideoGeneration(_)) {
            return Err(WorkerError::validation(format!(
                "{} payload sent to the video pipeline",
                job.payload.kind()
            )));
        }
        let name = job.payload.display_name();
        if name.is_empty() {
            return Err(WorkerError::validation("student name is empty"));
        }

        // Fail before paying for synthesis when a source clip is gone.
        require_source(&self.assets.intro_clip).await?;
        require_source(&self.assets.script_clip).await?;

        let stage = enter(ctx, VideoStage::Synthesize).await?;
        let narration = ctx.artifacts.path("narration.wav");
        self.speech
            .synthesize(&greeting_text(&name), &self.voice, &narration)
            .await?;
        let audio_duration = self.speech.duration(&narration).await?;
        stage.finish();

        let stage = enter(ctx, VideoStage::Normalize).await?;
        let intro = ctx.artifacts.path("intro_normalized.mp4");
        let script = ctx.artifacts.path("script_normalized.mp4");
        self.transform.normalize(&self.assets.intro_clip, &intro).await?;
        self.transform.normalize(&self.assets.script_clip, &script).await?;
        stage.finish();

        let stage = enter(ctx, VideoStage::Extend).await?;
        let intro_duration = self.transform.duration(&intro).await?;
        let video_track = match extension_duration(audio_duration, intro_duration) {
            Some(filler) => {
                ctx.logger.log_warning(&format!(
                    "narration {:.2}s outruns intro {:.2}s, freezing last frame for {:.2}s",
                    audio_duration, intro_duration, filler
                ));
                let frame = ctx.artifacts.path("intro_last_frame.png");
                let freeze = ctx.artifacts.path("intro_freeze.mp4");
                let extended = ctx.artifacts.path("intro_extended.mp4");
                self.transform.extract_last_frame(&intro, &frame).await?;
                self.transform.image_to_video(&frame, filler, &freeze).await?;
                self.transform
                    .concatenate(&[intro.clone(), freeze], &extended)
                    .await?;
                extended
            }
            None => {
                debug!(audio_duration, intro_duration, "Intro covers narration, muxing directly");
                intro
            }
        };
        let narrated = ctx.artifacts.path("intro_narrated.mp4");
        self.transform
            .mux_audio_video(&video_track, &narration, &narrated)
            .await?;
        stage.finish();

        let stage = enter(ctx, VideoStage::Concatenate).await?;
        fs::create_dir_all(&self.assets.video_output_dir).await?;
        let file_name = format!("{}.mp4", job.id);
        let final_path = self.assets.video_output_dir.join(&file_name);
        let partial = partial_path(&final_path);
        ctx.artifacts.track(partial.clone());
        self.transform.concatenate(&[narrated, script], &partial).await?;
        rename_into_place(&partial, &final_path).await?;
        stage.finish();

        let stage = enter(ctx, VideoStage::Publish).await?;
        let result = JobResult {
            url: self.assets.video_url(&file_name),
            path: final_path.to_string_lossy().into_owned(),
            file_name,
        };
        stage.finish();

        enter(ctx, VideoStage::Done).await?.finish();
        ctx.logger.log_completion(&result.url);
        Ok(result)
    }
}
