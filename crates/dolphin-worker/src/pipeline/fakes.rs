//! In-process adapters and fixtures for pipeline and executor tests.
//!
//! Fake media files hold their duration in seconds as text, so durations
//! survive normalization, muxing, concatenation and renames.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use dolphin_media::{
    ImageCompositor, LanguageProfile, MediaError, MediaResult, MediaTransform, SpeechSynthesizer,
    TemplateHandle, TextAnchor, VoiceProfile,
};
use dolphin_models::{JobPayload, JobRecord, Language};
use dolphin_queue::{JobStore, MemoryJobStore, ProgressReporter};

use crate::artifacts::TempArtifacts;
use crate::config::AssetConfig;
use crate::logging::JobLogger;
use crate::pipeline::{StageContext, VideoPipeline};

pub const TEST_WORKER: &str = "test-worker";

pub fn write_duration(path: &Path, secs: f64) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, format!("{}", secs)).unwrap();
}

pub fn read_duration(path: &Path) -> f64 {
    std::fs::read_to_string(path).unwrap().trim().parse().unwrap()
}

fn probe(path: &Path) -> MediaResult<f64> {
    let text = std::fs::read_to_string(path).map_err(|_| MediaError::FileNotFound(path.to_path_buf()))?;
    text.trim()
        .parse()
        .map_err(|_| MediaError::invalid_media(format!("{} is not a fake clip", path.display())))
}

pub fn dir_is_empty(dir: &Path) -> bool {
    std::fs::read_dir(dir)
        .map(|mut entries| entries.next().is_none())
        .unwrap_or(true)
}

/// Sorted file names in `dir`, empty when it does not exist.
pub fn file_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(Result::ok)
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    names
}

/// Temporary directories, asset paths and a memory store.
pub struct TestEnv {
    _root: TempDir,
    work_dir: PathBuf,
    pub store: Arc<MemoryJobStore>,
    pub assets: AssetConfig,
}

impl TestEnv {
    pub async fn new() -> Self {
        let root = TempDir::new().unwrap();
        let work_dir = root.path().join("work");
        std::fs::create_dir_all(&work_dir).unwrap();

        let assets = AssetConfig {
            intro_clip: root.path().join("assets/intro.mp4"),
            script_clip: root.path().join("assets/script.mp4"),
            video_output_dir: root.path().join("output/videos"),
            templates_dir: root.path().join("assets/certificates"),
            fonts_dir: root.path().join("assets/fonts"),
            certificate_output_dir: root.path().join("output/certificates"),
            public_url: "http://localhost:5000".to_string(),
        };

        Self {
            _root: root,
            work_dir,
            store: Arc::new(MemoryJobStore::new()),
            assets,
        }
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn store(&self) -> Arc<dyn JobStore> {
        self.store.clone()
    }

    /// Video pipeline over `media` with source clips of the given lengths.
    pub fn video_pipeline(&self, media: &Arc<FakeMedia>, intro_secs: f64, script_secs: f64) -> VideoPipeline {
        write_duration(&self.assets.intro_clip, intro_secs);
        write_duration(&self.assets.script_clip, script_secs);
        VideoPipeline::new(
            media.clone(),
            media.clone(),
            VoiceProfile::default(),
            self.assets.clone(),
        )
    }

    /// Enqueue and lease a job, returning a context for its first attempt.
    pub async fn leased_context(&self, payload: JobPayload) -> (JobRecord, StageContext) {
        self.store.enqueue(payload, 3).await.unwrap();
        let job = self
            .store
            .dequeue(TEST_WORKER, Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();

        let ctx = StageContext::new(
            ProgressReporter::new(self.store(), job.id.clone(), TEST_WORKER),
            TempArtifacts::create(&self.work_dir, &job.id, job.attempt)
                .await
                .unwrap(),
            JobLogger::new(&job.id, job.kind, job.attempt),
        );
        (job, ctx)
    }
}

/// Speech and transform adapter backed by duration files.
pub struct FakeMedia {
    narration_secs: f64,
    ops: Mutex<Vec<String>>,
    spoken: Mutex<Vec<String>>,
    failures: Mutex<HashMap<&'static str, VecDeque<MediaError>>>,
}

impl FakeMedia {
    pub fn new(narration_secs: f64) -> Self {
        Self {
            narration_secs,
            ops: Mutex::new(Vec::new()),
            spoken: Mutex::new(Vec::new()),
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Make the next call of `op` fail with `error`.
    pub fn fail_next(&self, op: &'static str, error: MediaError) {
        self.failures
            .lock()
            .unwrap()
            .entry(op)
            .or_default()
            .push_back(error);
    }

    pub fn operations(&self) -> Vec<String> {
        self.ops.lock().unwrap().clone()
    }

    pub fn spoken(&self) -> Vec<String> {
        self.spoken.lock().unwrap().clone()
    }

    fn record(&self, op: &'static str, entry: String) -> MediaResult<()> {
        if let Some(error) = self
            .failures
            .lock()
            .unwrap()
            .get_mut(op)
            .and_then(VecDeque::pop_front)
        {
            return Err(error);
        }
        self.ops.lock().unwrap().push(entry);
        Ok(())
    }
}

#[async_trait]
impl SpeechSynthesizer for FakeMedia {
    async fn synthesize(&self, text: &str, _voice: &VoiceProfile, output: &Path) -> MediaResult<()> {
        self.record("synthesize", "synthesize".to_string())?;
        self.spoken.lock().unwrap().push(text.to_string());
        write_duration(output, self.narration_secs);
        Ok(())
    }

    async fn duration(&self, audio: &Path) -> MediaResult<f64> {
        probe(audio)
    }
}

#[async_trait]
impl MediaTransform for FakeMedia {
    async fn normalize(&self, input: &Path, output: &Path) -> MediaResult<()> {
        self.record("normalize", "normalize".to_string())?;
        write_duration(output, probe(input)?);
        Ok(())
    }

    async fn extract_last_frame(&self, input: &Path, output: &Path) -> MediaResult<()> {
        self.record("extract_last_frame", "extract_last_frame".to_string())?;
        probe(input)?;
        write_duration(output, 0.0);
        Ok(())
    }

    async fn image_to_video(&self, image: &Path, duration: f64, output: &Path) -> MediaResult<()> {
        self.record("image_to_video", format!("image_to_video:{:.2}", duration))?;
        probe(image)?;
        write_duration(output, duration);
        Ok(())
    }

    async fn mux_audio_video(&self, video: &Path, audio: &Path, output: &Path) -> MediaResult<()> {
        self.record("mux", "mux".to_string())?;
        write_duration(output, probe(video)?.min(probe(audio)?));
        Ok(())
    }

    async fn concatenate(&self, inputs: &[PathBuf], output: &Path) -> MediaResult<()> {
        self.record("concatenate", format!("concatenate:{}", inputs.len()))?;
        let mut total = 0.0;
        for input in inputs {
            total += probe(input)?;
        }
        write_duration(output, total);
        Ok(())
    }

    async fn duration(&self, path: &Path) -> MediaResult<f64> {
        probe(path)
    }
}

/// Compositor that records what it was asked to draw.
#[derive(Default)]
pub struct FakeCompositor {
    missing_template: bool,
    rendered: Mutex<Vec<(String, TextAnchor)>>,
}

impl FakeCompositor {
    pub fn missing_template() -> Self {
        Self {
            missing_template: true,
            ..Self::default()
        }
    }

    pub fn png_for(text: &str) -> Vec<u8> {
        let mut bytes = b"\x89PNG\r\n".to_vec();
        bytes.extend_from_slice(text.as_bytes());
        bytes
    }

    pub fn rendered(&self) -> Vec<(String, TextAnchor)> {
        self.rendered.lock().unwrap().clone()
    }
}

#[async_trait]
impl ImageCompositor for FakeCompositor {
    async fn load_template(&self, language: Language) -> MediaResult<TemplateHandle> {
        let profile = LanguageProfile::for_language(language);
        if self.missing_template {
            return Err(MediaError::AssetMissing(PathBuf::from(profile.template_file)));
        }
        Ok(TemplateHandle {
            language,
            path: PathBuf::from(profile.template_file),
            font_path: PathBuf::from(profile.font_file),
            width: 2480,
            height: 1754,
        })
    }

    async fn render_text(
        &self,
        _template: &TemplateHandle,
        text: &str,
        profile: &LanguageProfile,
    ) -> MediaResult<Vec<u8>> {
        self.rendered
            .lock()
            .unwrap()
            .push((text.to_string(), profile.anchor));
        Ok(Self::png_for(text))
    }
}
