//! OCR using Google Cloud Vision's `DOCUMENT_TEXT_DETECTION`.

use std::time::Instant;

use base64::{Engine as _, prelude::BASE64_STANDARD};
use leaky_bucket::RateLimiter;
use reqwest::StatusCode;
use serde_json::json;

use crate::{config::OcrConfig, preprocess::pixel_buffer::PixelBuffer, prelude::*};

use super::{
    EngineError, EngineId, ExtractOptions, OcrEngine, OcrResult, iso_639_1, require_text,
};

/// The `images:annotate` endpoint.
const ANNOTATE_URL: &str = "https://vision.googleapis.com/v1/images:annotate";

/// Confidence we report when Vision doesn't give us any per-token scores.
const DEFAULT_CONFIDENCE: f32 = 90.0;

/// Body of an `images:annotate` response. We only look at the fields we need.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct AnnotateResponse {
    responses: Vec<AnnotateImageResponse>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct AnnotateImageResponse {
    /// The first annotation is the whole text block. The rest are tokens.
    text_annotations: Vec<TextAnnotation>,
    error: Option<ApiStatus>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct TextAnnotation {
    description: String,
    /// Between 0 and 1, when present.
    confidence: Option<f32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ApiStatus {
    code: i32,
    message: String,
}

/// OCR engine wrapping the Google Cloud Vision REST API.
pub struct GoogleVisionEngine {
    /// HTTP client.
    client: reqwest::Client,

    /// API key. `None` means the engine is unavailable.
    api_key: Option<String>,

    /// Optional rate limiter, to avoid hitting API quotas.
    rate_limiter: Option<RateLimiter>,
}

impl GoogleVisionEngine {
    /// Create a new Google Vision engine.
    pub fn new(config: &OcrConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.engine_timeout())
            .build()
            .context("could not build HTTP client for Google Vision")?;
        Ok(Self {
            client,
            api_key: config.google_vision_api_key().map(str::to_owned),
            rate_limiter: config.rate_limit.as_ref().map(|r| r.to_rate_limiter()),
        })
    }

    /// Send one annotate request and return the parsed body.
    async fn annotate(
        &self,
        api_key: &str,
        png: &[u8],
        options: &ExtractOptions,
    ) -> Result<AnnotateResponse, EngineError> {
        let body = json!({
            "requests": [{
                "image": { "content": BASE64_STANDARD.encode(png) },
                "features": [{ "type": "DOCUMENT_TEXT_DETECTION" }],
                "imageContext": { "languageHints": [iso_639_1(&options.language)] },
            }]
        });

        let response = self
            .client
            .post(ANNOTATE_URL)
            .query(&[("key", api_key)])
            .json(&body)
            .send()
            .await
            .map_err(|e| EngineError::Transport(format!("Google Vision request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(status_error(status, &text));
        }
        response.json::<AnnotateResponse>().await.map_err(|e| {
            EngineError::Transport(format!("could not parse Google Vision response: {e}"))
        })
    }
}

/// Classify a non-2xx response. Rejected keys are a configuration problem;
/// everything else is transport.
fn status_error(status: StatusCode, body: &str) -> EngineError {
    let rejected_key = matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN)
        || (status == StatusCode::BAD_REQUEST && body.contains("API_KEY_INVALID"));
    if rejected_key {
        EngineError::Configuration(format!("Google Vision rejected the API key ({status})"))
    } else {
        EngineError::Transport(format!("Google Vision returned {status}: {body}"))
    }
}

/// Pull the text and a 0–100 confidence out of an annotate response.
fn text_and_confidence(response: AnnotateResponse) -> Result<(String, f32), EngineError> {
    let Some(image_response) = response.responses.into_iter().next() else {
        return Err(EngineError::Extraction(
            "Google Vision returned no responses".to_owned(),
        ));
    };
    if let Some(error) = image_response.error {
        return Err(EngineError::Transport(format!(
            "Google Vision error {}: {}",
            error.code, error.message
        )));
    }

    let mut annotations = image_response.text_annotations.into_iter();
    let Some(full_text) = annotations.next() else {
        return Err(EngineError::Extraction(
            "Google Vision found no text".to_owned(),
        ));
    };

    // Average the token confidences, skipping the full-text block.
    let (total, count) = annotations
        .filter_map(|a| a.confidence)
        .fold((0.0f32, 0u32), |(total, count), c| (total + c, count + 1));
    let confidence = if count == 0 {
        DEFAULT_CONFIDENCE
    } else {
        total / count as f32 * 100.0
    };
    Ok((full_text.description, confidence))
}

#[async_trait]
impl OcrEngine for GoogleVisionEngine {
    fn id(&self) -> EngineId {
        EngineId::GoogleVision
    }

    fn is_available(&self) -> bool {
        self.api_key.is_some()
    }

    #[instrument(level = "debug", skip_all, fields(engine = %self.id()))]
    async fn extract(
        &self,
        image: &PixelBuffer,
        options: &ExtractOptions,
    ) -> Result<OcrResult, EngineError> {
        let Some(api_key) = self.api_key.as_deref() else {
            return Err(EngineError::Configuration(
                "GOOGLE_VISION_API_KEY is not set".to_owned(),
            ));
        };
        let started = Instant::now();

        let png = image
            .to_png()
            .map_err(|e| EngineError::Extraction(format!("could not encode image: {e:#}")))?;

        if let Some(rate_limiter) = &self.rate_limiter {
            rate_limiter.acquire_one().await;
        }

        let response = self.annotate(api_key, &png, options).await?;
        trace!(?response, "Google Vision response");
        let (text, confidence) = text_and_confidence(response)?;
        let text = require_text(self.id(), text)?;
        debug!(confidence, chars = text.len(), "Google Vision extracted text");
        Ok(OcrResult::new(
            self.id(),
            text,
            confidence,
            started.elapsed(),
            options,
        ))
    }
}
