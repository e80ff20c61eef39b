//! Certificate image.

use std::sync::Arc;

use async_trait::async_trait;

use dolphin_media::{persist_atomically, ImageCompositor, LanguageProfile};
use dolphin_models::{JobKind, JobPayload, JobRecord, JobResult};

use crate::config::AssetConfig;
use crate::error::{WorkerError, WorkerResult};
use crate::pipeline::{Pipeline, StageContext, StageTimer};

/// Stages of the certificate pipeline, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertificateStage {
    LoadTemplate,
    PrepareSurface,
    RenderName,
    Save,
    Done,
}

impl CertificateStage {
    pub const ALL: [CertificateStage; 5] = [
        CertificateStage::LoadTemplate,
        CertificateStage::PrepareSurface,
        CertificateStage::RenderName,
        CertificateStage::Save,
        CertificateStage::Done,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            CertificateStage::LoadTemplate => "load_template",
            CertificateStage::PrepareSurface => "prepare_surface",
            CertificateStage::RenderName => "render_name",
            CertificateStage::Save => "save",
            CertificateStage::Done => "done",
        }
    }

    pub fn checkpoint(&self) -> u8 {
        match self {
            CertificateStage::LoadTemplate => 20,
            CertificateStage::PrepareSurface => 40,
            CertificateStage::RenderName => 70,
            CertificateStage::Save => 90,
            CertificateStage::Done => 100,
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            CertificateStage::LoadTemplate => "📄 جاري تحميل القالب...",
            CertificateStage::PrepareSurface => "✍️ نكتب اسمك على الشهادة...",
            CertificateStage::RenderName => "🖋️ نضيف التوقيع الرسمي...",
            CertificateStage::Save => "💾 جاري الحفظ...",
            CertificateStage::Done => "🎉 تم إنشاء الشهادة بنجاح!",
        }
    }
}

async fn enter(ctx: &StageContext, stage: CertificateStage) -> WorkerResult<StageTimer> {
    ctx.enter(stage.name(), stage.checkpoint(), stage.message()).await
}

/// Draws the student's name onto the language template.
pub struct CertificatePipeline {
    compositor: Arc<dyn ImageCompositor>,
    assets: AssetConfig,
}

impl CertificatePipeline {
    pub fn new(compositor: Arc<dyn ImageCompositor>, assets: AssetConfig) -> Self {
        Self { compositor, assets }
    }
}

#[async_trait]
impl Pipeline for CertificatePipeline {
    fn kind(&self) -> JobKind {
        JobKind::CertificateGeneration
    }

    async fn run(&self, job: &JobRecord, ctx: &StageContext) -> WorkerResult<JobResult> {
        let language = match &job.payload {
            JobPayload::CertificateGeneration(payload) => payload.language,
            other => {
                return Err(WorkerError::validation(format!(
                    "{} payload sent to the certificate pipeline",
                    other.kind()
                )))
            }
        };
        let name = job.payload.display_name();
        if name.is_empty() {
            return Err(WorkerError::validation("student name is empty"));
        }

        let stage = enter(ctx, CertificateStage::LoadTemplate).await?;
        let template = self.compositor.load_template(language).await?;
        stage.finish();

        let stage = enter(ctx, CertificateStage::PrepareSurface).await?;
        let profile = LanguageProfile::for_language(language);
        stage.finish();

        let stage = enter(ctx, CertificateStage::RenderName).await?;
        let png = self.compositor.render_text(&template, &name, &profile).await?;
        stage.finish();

        let stage = enter(ctx, CertificateStage::Save).await?;
        let file_name = format!("{}_{}.png", job.id, language);
        let final_path = self.assets.certificate_output_dir.join(&file_name);
        persist_atomically(&png, &final_path).await?;
        let result = JobResult {
            url: self.assets.certificate_url(&file_name),
            path: final_path.to_string_lossy().into_owned(),
            file_name,
        };
        stage.finish();

        enter(ctx, CertificateStage::Done).await?.finish();
        ctx.logger.log_completion(&result.url);
        Ok(result)
    }
}
