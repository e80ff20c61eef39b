//! Narration synthesis through the Azure Speech REST API.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::error::{MediaError, MediaResult};
use crate::fs_utils::persist_atomically;
use crate::probe::get_duration;

/// Voice used when none is configured.
pub const DEFAULT_VOICE: &str = "ar-LB-LaylaNeural";

/// RIFF WAV, 24 kHz mono.
const OUTPUT_FORMAT: &str = "riff-24khz-16bit-mono-pcm";

/// Greeting spoken at the start of the video.
pub fn greeting_text(student_name: &str) -> String {
    format!("يا هلا يا {} بطل منصة الدلفين التعليمية", student_name)
}

/// Voice and prosody applied to a synthesis request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceProfile {
    pub voice_name: String,
    pub lang: String,
    pub rate: String,
    pub pitch: String,
}

impl VoiceProfile {
    pub fn new(voice_name: impl Into<String>) -> Self {
        let voice_name = voice_name.into();
        // Voice names look like `ar-LB-LaylaNeural`; the first two parts are the locale.
        let lang = voice_name
            .splitn(3, '-')
            .take(2)
            .collect::<Vec<_>>()
            .join("-");
        Self {
            voice_name,
            lang,
            rate: "4%".to_string(),
            pitch: "+14%".to_string(),
        }
    }

    /// SSML document for `text`.
    pub fn ssml(&self, text: &str) -> String {
        format!(
            "<speak version='1.0' xmlns='http://www.w3.org/2001/10/synthesis' xml:lang='{}'>\
             <voice name='{}'><prosody rate=\"{}\" pitch=\"{}\">{}</prosody></voice></speak>",
            escape_xml(&self.lang),
            escape_xml(&self.voice_name),
            escape_xml(&self.rate),
            escape_xml(&self.pitch),
            escape_xml(text)
        )
    }
}

impl Default for VoiceProfile {
    fn default() -> Self {
        Self::new(DEFAULT_VOICE)
    }
}

fn escape_xml(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            other => out.push(other),
        }
    }
    out
}

/// Speech adapter.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Synthesize `text` into an audio file at `output`.
    async fn synthesize(&self, text: &str, voice: &VoiceProfile, output: &Path) -> MediaResult<()>;

    /// Duration of a synthesized file in seconds.
    async fn duration(&self, audio: &Path) -> MediaResult<f64>;
}

/// Azure Speech credentials and endpoint.
#[derive(Debug, Clone)]
pub struct SpeechConfig {
    pub key: Option<String>,
    pub region: String,
    pub voice_name: String,
    /// Overrides the regional endpoint
    pub endpoint: Option<String>,
    pub timeout: Duration,
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            key: None,
            region: "westeurope".to_string(),
            voice_name: DEFAULT_VOICE.to_string(),
            endpoint: None,
            timeout: Duration::from_secs(30),
        }
    }
}

impl SpeechConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            key: std::env::var("AZURE_SPEECH_KEY")
                .ok()
                .filter(|k| !k.trim().is_empty()),
            region: std::env::var("AZURE_SPEECH_REGION").unwrap_or(defaults.region),
            voice_name: std::env::var("AZURE_VOICE_NAME").unwrap_or(defaults.voice_name),
            endpoint: std::env::var("AZURE_SPEECH_ENDPOINT").ok(),
            timeout: std::env::var("AZURE_SPEECH_TIMEOUT_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
        }
    }

    pub fn endpoint_url(&self) -> String {
        match &self.endpoint {
            Some(endpoint) => endpoint.clone(),
            None => format!(
                "https://{}.tts.speech.microsoft.com/cognitiveservices/v1",
                self.region
            ),
        }
    }

    pub fn voice(&self) -> VoiceProfile {
        VoiceProfile::new(&self.voice_name)
    }
}

/// Azure Speech REST client.
pub struct AzureSpeech {
    http: reqwest::Client,
    config: SpeechConfig,
}

impl AzureSpeech {
    pub fn new(config: SpeechConfig) -> MediaResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent("dolphin-media-worker")
            .build()
            .map_err(|e| MediaError::config(format!("http client: {}", e)))?;
        Ok(Self { http, config })
    }

    pub fn config(&self) -> &SpeechConfig {
        &self.config
    }

    fn map_transport_error(&self, e: reqwest::Error) -> MediaError {
        if e.is_timeout() {
            MediaError::Timeout(self.config.timeout.as_secs())
        } else {
            MediaError::synthesis_failed(e.to_string(), e.status().map(|s| s.as_u16()))
        }
    }
}

#[async_trait]
impl SpeechSynthesizer for AzureSpeech {
    async fn synthesize(&self, text: &str, voice: &VoiceProfile, output: &Path) -> MediaResult<()> {
        let key = self
            .config
            .key
            .as_deref()
            .ok_or_else(|| MediaError::config("AZURE_SPEECH_KEY is not set"))?;

        debug!(voice = %voice.voice_name, chars = text.chars().count(), "Requesting speech synthesis");

        let response = self
            .http
            .post(self.config.endpoint_url())
            .header("Ocp-Apim-Subscription-Key", key)
            .header("Content-Type", "application/ssml+xml")
            .header("X-Microsoft-OutputFormat", OUTPUT_FORMAT)
            .body(voice.ssml(text))
            .send()
            .await
            .map_err(|e| self.map_transport_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(MediaError::synthesis_failed(
                format!("provider returned {}: {}", status, detail.trim()),
                Some(status.as_u16()),
            ));
        }

        let audio = response
            .bytes()
            .await
            .map_err(|e| self.map_transport_error(e))?;
        if audio.is_empty() {
            return Err(MediaError::synthesis_failed("provider returned no audio", None));
        }

        persist_atomically(&audio, output).await?;
        info!(bytes = audio.len(), output = %output.display(), "Speech synthesized");
        Ok(())
    }

    async fn duration(&self, audio: &Path) -> MediaResult<f64> {
        get_duration(audio).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config_for(server: &MockServer) -> SpeechConfig {
        SpeechConfig {
            key: Some("test-key".to_string()),
            endpoint: Some(format!("{}/cognitiveservices/v1", server.uri())),
            ..SpeechConfig::default()
        }
    }

    #[test]
    fn test_ssml_escapes_student_text() {
        let ssml = VoiceProfile::default().ssml(&greeting_text("<Omar & Co>"));

        assert!(ssml.contains("xml:lang='ar-LB'"));
        assert!(ssml.contains("<voice name='ar-LB-LaylaNeural'>"));
        assert!(ssml.contains("<prosody rate=\"4%\" pitch=\"+14%\">"));
        assert!(ssml.contains("&lt;Omar &amp; Co&gt;"));
        assert!(!ssml.contains("<Omar"));
    }

    #[test]
    fn test_greeting_text() {
        assert_eq!(
            greeting_text("سارة"),
            "يا هلا يا سارة بطل منصة الدلفين التعليمية"
        );
    }

    #[tokio::test]
    async fn test_synthesize_writes_audio() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/cognitiveservices/v1"))
            .and(header("Ocp-Apim-Subscription-Key", "test-key"))
            .and(header("X-Microsoft-OutputFormat", OUTPUT_FORMAT))
            .and(body_string_contains("Omar"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"RIFF....WAVE".to_vec()))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("narration.wav");
        let speech = AzureSpeech::new(config_for(&server)).unwrap();

        speech
            .synthesize("Omar", &VoiceProfile::default(), &output)
            .await
            .unwrap();
        assert_eq!(std::fs::read(&output).unwrap(), b"RIFF....WAVE");
    }

    #[tokio::test]
    async fn test_provider_error_is_synthesis_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_string("Too many requests"))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("narration.wav");
        let speech = AzureSpeech::new(config_for(&server)).unwrap();

        let err = speech
            .synthesize("Omar", &VoiceProfile::default(), &output)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            MediaError::SynthesisFailed {
                status: Some(429),
                ..
            }
        ));
        assert!(!output.exists());
    }

    #[tokio::test]
    async fn test_missing_key_is_config_error() {
        let speech = AzureSpeech::new(SpeechConfig::default()).unwrap();
        let err = speech
            .synthesize("Omar", &VoiceProfile::default(), Path::new("/tmp/never.wav"))
            .await
            .unwrap_err();
        assert!(matches!(err, MediaError::Config(_)));
    }
}
