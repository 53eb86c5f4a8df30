//! OCR using an OpenAI-compatible vision model.
//!
//! Generative models don't report a confidence score, so we use a fixed
//! estimate.

use std::time::Instant;

use async_openai::{
    Client,
    config::OpenAIConfig,
    error::OpenAIError,
    types::{CreateChatCompletionResponse, FinishReason},
};
use leaky_bucket::RateLimiter;
use serde_json::json;

use crate::{
    config::OcrConfig, data_url::data_url, preprocess::pixel_buffer::PixelBuffer,
    prelude::*,
};

use super::{EngineError, EngineId, ExtractOptions, OcrEngine, OcrResult, require_text};

/// Instructions sent with every page.
const SYSTEM_PROMPT: &str = include_str!("gpt_vision/system_prompt.md");

/// Confidence we report for every successful transcription.
const FIXED_CONFIDENCE: f32 = 95.0;

/// Upper bound on the transcription length, in tokens.
const MAX_COMPLETION_TOKENS: u32 = 4096;

/// OCR engine that asks a vision-capable chat model to transcribe the page.
pub struct GptVisionEngine {
    /// OpenAI-compatible client. `None` if we have no API key.
    client: Option<Client<OpenAIConfig>>,

    /// The model to ask.
    model: String,

    /// Optional rate limiter, to avoid hitting API quotas.
    rate_limiter: Option<RateLimiter>,
}

impl GptVisionEngine {
    /// Create a new GPT Vision engine.
    pub fn new(config: &OcrConfig) -> Self {
        let client = config.openai_api_key().map(|api_key| {
            let mut client_config = OpenAIConfig::new().with_api_key(api_key);
            if let Some(api_base) = &config.openai_api_base {
                client_config = client_config.with_api_base(api_base);
            }
            Client::with_config(client_config)
        });
        Self {
            client,
            model: config.gpt_model.clone(),
            rate_limiter: config.rate_limit.as_ref().map(|r| r.to_rate_limiter()),
        }
    }

    /// Build our chat completion request.
    fn request(&self, page_data_url: String, options: &ExtractOptions) -> Value {
        json!({
            "model": self.model,
            "temperature": 0,
            "max_tokens": MAX_COMPLETION_TOKENS,
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                {
                    "role": "user",
                    "content": [
                        {
                            "type": "text",
                            "text": format!(
                                "Transcribe this page. Expected language: {}.",
                                options.language
                            ),
                        },
                        {
                            "type": "image_url",
                            "image_url": {
                                "url": page_data_url,
                                "detail": options.detail.as_str(),
                            },
                        },
                    ],
                },
            ],
        })
    }
}

/// Classify an error from the OpenAI client.
fn client_error(err: OpenAIError) -> EngineError {
    match err {
        OpenAIError::ApiError(api_error) if api_error.message.contains("API key") => {
            EngineError::Configuration(format!(
                "GPT Vision rejected the API key: {}",
                api_error.message
            ))
        }
        other => EngineError::Transport(format!("GPT Vision request failed: {other}")),
    }
}

/// Get the transcription out of a chat completion.
fn transcription(response: CreateChatCompletionResponse) -> Result<String, EngineError> {
    let Some(choice) = response.choices.into_iter().next() else {
        return Err(EngineError::Extraction(
            "no choices in GPT Vision response".to_owned(),
        ));
    };
    if choice.finish_reason == Some(FinishReason::ContentFilter) {
        return Err(EngineError::Extraction(
            "GPT Vision content filter triggered".to_owned(),
        ));
    }
    Ok(choice.message.content.unwrap_or_default())
}

#[async_trait]
impl OcrEngine for GptVisionEngine {
    fn id(&self) -> EngineId {
        EngineId::GptVision
    }

    fn is_available(&self) -> bool {
        self.client.is_some()
    }

    #[instrument(level = "debug", skip_all, fields(engine = %self.id(), model = %self.model))]
    async fn extract(
        &self,
        image: &PixelBuffer,
        options: &ExtractOptions,
    ) -> Result<OcrResult, EngineError> {
        let Some(client) = &self.client else {
            return Err(EngineError::Configuration(
                "OPENAI_API_KEY is not set".to_owned(),
            ));
        };
        let started = Instant::now();

        let png = image
            .to_png()
            .map_err(|e| EngineError::Extraction(format!("could not encode image: {e:#}")))?;
        let request = self.request(data_url("image/png", &png), options);
        drop(png);

        if let Some(rate_limiter) = &self.rate_limiter {
            rate_limiter.acquire_one().await;
        }

        let response: CreateChatCompletionResponse = client
            .chat()
            .create_byot(request)
            .await
            .map_err(client_error)?;
        let text = require_text(self.id(), transcription(response)?)?;
        debug!(chars = text.len(), "GPT Vision extracted text");
        Ok(OcrResult::new(
            self.id(),
            text,
            FIXED_CONFIDENCE,
            started.elapsed(),
            options,
        ))
    }
}
