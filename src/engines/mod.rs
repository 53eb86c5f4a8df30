//! OCR engine interface.
//!
//! Every backend (a cloud vision API, a generative vision model, or a local
//! recognizer) sits behind [`OcrEngine`]. Engines take a [`PixelBuffer`] and
//! either return a normalized [`OcrResult`] or an [`EngineError`] saying what
//! kind of failure happened, so that the orchestrator can decide whether to
//! move on to the next engine.

use std::{error, fmt, sync::Arc, time::Duration};

use clap::ValueEnum;
use schemars::JsonSchema;

use crate::{config::OcrConfig, preprocess::pixel_buffer::PixelBuffer, prelude::*};

pub mod google_vision;
pub mod gpt_vision;
pub mod local;

/// The engines we know how to talk to.
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    Hash,
    JsonSchema,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
    ValueEnum,
)]
#[serde(rename_all = "snake_case")]
#[clap(rename_all = "snake_case")]
pub enum EngineId {
    /// Google Cloud Vision `DOCUMENT_TEXT_DETECTION`.
    GoogleVision,
    /// An OpenAI-compatible vision model.
    GptVision,
    /// The local `tesseract` recognizer.
    LocalOcr,
}

impl EngineId {
    /// Engines in the order that automatic selection tries them.
    pub const PRIORITY: [EngineId; 3] =
        [EngineId::GoogleVision, EngineId::GptVision, EngineId::LocalOcr];

    /// The name used in output and on the command line.
    pub fn as_str(self) -> &'static str {
        match self {
            EngineId::GoogleVision => "google_vision",
            EngineId::GptVision => "gpt_vision",
            EngineId::LocalOcr => "local_ocr",
        }
    }
}

impl fmt::Display for EngineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which engine an [`OcrResult`] came from. Hybrid results are labelled
/// `hybrid` rather than with the engine that won.
#[derive(Clone, Copy, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineTag {
    GoogleVision,
    GptVision,
    LocalOcr,
    Hybrid,
}

impl From<EngineId> for EngineTag {
    fn from(id: EngineId) -> Self {
        match id {
            EngineId::GoogleVision => EngineTag::GoogleVision,
            EngineId::GptVision => EngineTag::GptVision,
            EngineId::LocalOcr => EngineTag::LocalOcr,
        }
    }
}

/// How much detail a generative engine should look at. Other engines ignore
/// this.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
#[clap(rename_all = "snake_case")]
pub enum DetailLevel {
    Low,
    #[default]
    High,
    Auto,
}

impl DetailLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            DetailLevel::Low => "low",
            DetailLevel::High => "high",
            DetailLevel::Auto => "auto",
        }
    }
}

/// Per-request options passed to [`OcrEngine::extract`].
#[derive(Clone, Debug)]
pub struct ExtractOptions {
    /// Tesseract-style language code, such as `por` or `eng`.
    pub language: String,

    /// Detail level for generative engines.
    pub detail: DetailLevel,

    /// Was the image run through the preprocessing pipeline? Recorded in the
    /// result metadata.
    pub preprocessed: bool,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            language: "por".to_owned(),
            detail: DetailLevel::default(),
            preprocessed: false,
        }
    }
}

/// Extra information about an [`OcrResult`].
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct OcrMetadata {
    /// Was the image preprocessed before recognition?
    pub preprocessed: bool,

    /// The language requested.
    pub language: String,

    /// Number of whitespace-separated words in `text`.
    pub word_count: u32,
}

/// Text recognized from one image.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct OcrResult {
    /// The recognized text.
    pub text: String,

    /// How reliable the engine thinks `text` is, from 0 to 100.
    pub confidence: f32,

    /// The engine that produced this result.
    pub engine: EngineTag,

    /// How long recognition took, in milliseconds.
    pub processing_time_ms: u64,

    /// Extra information about the result.
    pub metadata: OcrMetadata,
}

impl OcrResult {
    /// Build a result, clamping `confidence` into `0..=100` and counting words.
    pub fn new(
        engine: EngineId,
        text: String,
        confidence: f32,
        elapsed: Duration,
        options: &ExtractOptions,
    ) -> Self {
        let word_count = u32::try_from(text.split_whitespace().count()).unwrap_or(u32::MAX);
        let confidence = if confidence.is_finite() {
            confidence.clamp(0.0, 100.0)
        } else {
            0.0
        };
        Self {
            text,
            confidence,
            engine: engine.into(),
            processing_time_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            metadata: OcrMetadata {
                preprocessed: options.preprocessed,
                language: options.language.clone(),
                word_count,
            },
        }
    }
}

/// Why an engine didn't produce a result.
#[derive(Debug)]
pub enum EngineError {
    /// Credentials are missing or were rejected. No request was made if they
    /// were missing.
    Configuration(String),

    /// The call to the backend failed: a network error, a non-2xx response,
    /// or a recognizer process that could not run.
    Transport(String),

    /// The backend answered, but without any usable text.
    Extraction(String),

    /// The backend took longer than we were willing to wait.
    Timeout(Duration),

    /// The request was cancelled while the engine was running.
    Cancelled,
}

impl EngineError {
    /// Is this a missing or invalid credential?
    pub fn is_configuration(&self) -> bool {
        matches!(self, EngineError::Configuration(_))
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Configuration(msg) => write!(f, "configuration error: {msg}"),
            EngineError::Transport(msg) => write!(f, "transport error: {msg}"),
            EngineError::Extraction(msg) => write!(f, "extraction error: {msg}"),
            EngineError::Timeout(timeout) => {
                write!(f, "engine timed out after {}s", timeout.as_secs_f32())
            }
            EngineError::Cancelled => write!(f, "engine call was cancelled"),
        }
    }
}

impl error::Error for EngineError {}

/// Interface to an OCR engine.
#[async_trait]
pub trait OcrEngine: Send + Sync + 'static {
    /// Which engine is this?
    fn id(&self) -> EngineId;

    /// Do we have the credentials we need to call this engine?
    fn is_available(&self) -> bool;

    /// Recognize the text in `image`. Must not modify `image`.
    async fn extract(
        &self,
        image: &PixelBuffer,
        options: &ExtractOptions,
    ) -> Result<OcrResult, EngineError>;
}

/// Build every engine we support, in [`EngineId::PRIORITY`] order.
///
/// Engines without credentials are still built, but report themselves as
/// unavailable.
pub fn engines_for_config(config: &OcrConfig) -> Result<Vec<Arc<dyn OcrEngine>>> {
    EngineId::PRIORITY
        .iter()
        .map(|&id| -> Result<Arc<dyn OcrEngine>> {
            Ok(match id {
                EngineId::GoogleVision => {
                    Arc::new(google_vision::GoogleVisionEngine::new(config)?)
                }
                EngineId::GptVision => Arc::new(gpt_vision::GptVisionEngine::new(config)),
                EngineId::LocalOcr => Arc::new(local::LocalOcrEngine::new(config)),
            })
        })
        .collect()
}

/// Reject empty or whitespace-only text.
pub fn require_text(engine: EngineId, text: String) -> Result<String, EngineError> {
    if text.trim().is_empty() {
        Err(EngineError::Extraction(format!("{engine} returned no text")))
    } else {
        Ok(text)
    }
}

/// Map a Tesseract language code to the ISO 639-1 code cloud APIs expect.
///
/// Unknown codes are passed through unchanged.
pub fn iso_639_1(language: &str) -> &str {
    match language {
        "por" => "pt",
        "eng" => "en",
        "spa" => "es",
        "fra" => "fr",
        "deu" => "de",
        "ita" => "it",
        "nld" => "nl",
        other => other,
    }
}
