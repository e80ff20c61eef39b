//! Certificate compositing.
//!
//! Text is drawn with FFmpeg's `drawtext` filter, which shapes Arabic script
//! and applies bidi reordering. The text reaches FFmpeg through a `textfile`
//! so student input never has to be escaped into the filter graph.

use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use image::ImageFormat;
use tracing::{debug, info};

use dolphin_models::Language;

use crate::command::{escape_filter_path, FfmpegCommand, FfmpegRunner};
use crate::error::{MediaError, MediaResult};

/// Where the text block is anchored on the template.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextAnchor {
    /// Horizontally centered, vertically centered on `y`.
    Centered { y: u32 },
    /// Top-left corner of the text block at (`x`, `y`).
    TopLeft { x: u32, y: u32 },
}

/// Typography and placement for one certificate language.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LanguageProfile {
    pub language: Language,
    pub template_file: &'static str,
    pub font_file: &'static str,
    pub font_size: u32,
    pub color: &'static str,
    pub anchor: TextAnchor,
}

impl LanguageProfile {
    pub fn for_language(language: Language) -> Self {
        match language {
            Language::Ar => Self {
                language,
                template_file: "template_ar.png",
                font_file: "Amiri-Regular.ttf",
                font_size: 130,
                color: "black",
                anchor: TextAnchor::Centered { y: 900 },
            },
            Language::En => Self {
                language,
                template_file: "template_en.jpeg",
                font_file: "Roboto-Bold.ttf",
                font_size: 80,
                color: "black",
                anchor: TextAnchor::TopLeft { x: 1850, y: 1080 },
            },
        }
    }

    /// `x` and `y` expressions for `drawtext`.
    pub fn position(&self) -> (String, String) {
        match self.anchor {
            TextAnchor::Centered { y } => ("(w-text_w)/2".to_string(), format!("{}-text_h/2", y)),
            TextAnchor::TopLeft { x, y } => (x.to_string(), y.to_string()),
        }
    }

    /// Full `drawtext` filter reading the text from `text_file`.
    pub fn drawtext_filter(&self, font: &Path, text_file: &Path) -> String {
        let (x, y) = self.position();
        let mut filter = format!(
            "drawtext=fontfile='{}':textfile='{}':fontsize={}:fontcolor={}:x={}:y={}",
            escape_filter_path(font),
            escape_filter_path(text_file),
            self.font_size,
            self.color,
            x,
            y
        );
        if self.language.is_rtl() {
            filter.push_str(":text_shaping=1");
        }
        filter
    }
}

/// A verified template ready for drawing.
#[derive(Debug, Clone)]
pub struct TemplateHandle {
    pub language: Language,
    pub path: PathBuf,
    pub font_path: PathBuf,
    pub width: u32,
    pub height: u32,
}

/// Image compositing adapter.
#[async_trait]
pub trait ImageCompositor: Send + Sync {
    /// Locate and verify the template and font for `language`.
    async fn load_template(&self, language: Language) -> MediaResult<TemplateHandle>;

    /// Draw `text` onto the template and return the PNG bytes.
    async fn render_text(
        &self,
        template: &TemplateHandle,
        text: &str,
        profile: &LanguageProfile,
    ) -> MediaResult<Vec<u8>>;
}

/// FFmpeg-backed compositor.
#[derive(Debug, Clone)]
pub struct FfmpegCompositor {
    templates_dir: PathBuf,
    fonts_dir: PathBuf,
    timeout_secs: u64,
}

impl FfmpegCompositor {
    pub fn new(templates_dir: impl Into<PathBuf>, fonts_dir: impl Into<PathBuf>) -> Self {
        Self {
            templates_dir: templates_dir.into(),
            fonts_dir: fonts_dir.into(),
            timeout_secs: 60,
        }
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    /// Template and font paths for `language`.
    pub fn asset_paths(&self, language: Language) -> (PathBuf, PathBuf) {
        let profile = LanguageProfile::for_language(language);
        (
            self.templates_dir.join(profile.template_file),
            self.fonts_dir.join(profile.font_file),
        )
    }
}

fn require_asset(path: &Path) -> MediaResult<()> {
    if path.is_file() {
        Ok(())
    } else {
        Err(MediaError::AssetMissing(path.to_path_buf()))
    }
}

#[async_trait]
impl ImageCompositor for FfmpegCompositor {
    async fn load_template(&self, language: Language) -> MediaResult<TemplateHandle> {
        let (path, font_path) = self.asset_paths(language);
        require_asset(&path)?;
        require_asset(&font_path)?;

        let probe_path = path.clone();
        let (width, height) = tokio::task::spawn_blocking(move || image::image_dimensions(probe_path))
            .await
            .map_err(|e| MediaError::invalid_media(format!("template probe panicked: {}", e)))??;

        debug!(language = %language, width, height, "Loaded certificate template");
        Ok(TemplateHandle {
            language,
            path,
            font_path,
            width,
            height,
        })
    }

    async fn render_text(
        &self,
        template: &TemplateHandle,
        text: &str,
        profile: &LanguageProfile,
    ) -> MediaResult<Vec<u8>> {
        require_asset(&template.path)?;
        require_asset(&template.font_path)?;

        // Removed when dropped, on every exit path.
        let mut text_file = tempfile::Builder::new()
            .prefix("dolphin-text-")
            .suffix(".txt")
            .tempfile()?;
        text_file.write_all(text.as_bytes())?;
        text_file.flush()?;

        let cmd = FfmpegCommand::to_stdout()
            .input(&template.path)
            .video_filter(profile.drawtext_filter(&template.font_path, text_file.path()))
            .single_frame()
            .video_codec("png")
            .format("image2pipe");

        let bytes = FfmpegRunner::new()
            .with_timeout(self.timeout_secs)
            .operation("render_text")
            .run_to_bytes(&cmd)
            .await?;

        let decoded = image::load_from_memory_with_format(&bytes, ImageFormat::Png)?;
        if (decoded.width(), decoded.height()) != (template.width, template.height) {
            return Err(MediaError::invalid_media(format!(
                "rendered {}x{}, template is {}x{}",
                decoded.width(),
                decoded.height(),
                template.width,
                template.height
            )));
        }

        info!(language = %template.language, bytes = bytes.len(), "Rendered certificate text");
        Ok(bytes)
    }
}
