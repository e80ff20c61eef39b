//! Media adapters for the Dolphin pipelines.
//!
//! This crate provides:
//! - Type-safe FFmpeg command building with multiple inputs
//! - FFprobe duration and stream probing
//! - Clip normalization, freeze-frame extension, muxing and concatenation
//! - Narration synthesis over the Azure Speech REST API
//! - Certificate text rendering onto language templates
//! - Atomic publishing of output files

pub mod command;
pub mod compositor;
pub mod error;
pub mod fs_utils;
pub mod probe;
pub mod speech;
pub mod transform;

pub use command::{check_ffmpeg, check_ffprobe, FfmpegCommand, FfmpegRunner};
pub use compositor::{
    FfmpegCompositor, ImageCompositor, LanguageProfile, TemplateHandle, TextAnchor,
};
pub use error::{MediaError, MediaResult};
pub use fs_utils::{hidden_sibling, persist_atomically, rename_into_place};
pub use probe::{get_duration, probe_media, MediaInfo};
pub use speech::{
    greeting_text, AzureSpeech, SpeechConfig, SpeechSynthesizer, VoiceProfile, DEFAULT_VOICE,
};
pub use transform::{FfmpegTransform, MediaTransform, NormalizeProfile, LAST_FRAME_OFFSET_SECS};
