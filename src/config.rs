//! Service configuration.
//!
//! Everything here is read once at startup (from the command line, the
//! environment, or a `.env` file) and never changes afterwards. Engines get
//! their credentials from an [`OcrConfig`] when they're built, and never look
//! at the environment themselves.

use std::time::Duration;

use clap::Args;

use crate::{preprocess::PreprocessConfig, prelude::*, rate_limit::RateLimit};

/// Engine credentials and limits.
#[derive(Args, Clone, Debug)]
pub struct OcrConfig {
    /// API key for Google Cloud Vision. If missing, Google Vision is
    /// unavailable.
    #[clap(long, env = "GOOGLE_VISION_API_KEY", hide_env_values = true)]
    pub google_vision_api_key: Option<String>,

    /// API key for the OpenAI-compatible vision model. If missing, GPT Vision
    /// is unavailable.
    #[clap(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    pub openai_api_key: Option<String>,

    /// Override the OpenAI-compatible server URL.
    #[clap(long, env = "OPENAI_API_BASE")]
    pub openai_api_base: Option<String>,

    /// The vision model to use for GPT Vision.
    #[clap(long, default_value = "gpt-4o")]
    pub gpt_model: String,

    /// The `tesseract` executable used for local OCR.
    #[clap(long, default_value = "tesseract")]
    pub tesseract_cmd: String,

    /// How long to wait for a single engine call, in seconds.
    #[clap(long, default_value = "60")]
    pub engine_timeout: u64,

    /// A rate limit for each cloud engine, of the form "10/s" or "600/m".
    #[clap(long)]
    pub rate_limit: Option<RateLimit>,

    #[clap(flatten)]
    pub preprocess: PreprocessOpts,
}

impl OcrConfig {
    /// The Google Vision key, if it's set to something non-empty.
    pub fn google_vision_api_key(&self) -> Option<&str> {
        non_empty(self.google_vision_api_key.as_deref())
    }

    /// The OpenAI key, if it's set to something non-empty.
    pub fn openai_api_key(&self) -> Option<&str> {
        non_empty(self.openai_api_key.as_deref())
    }

    /// The per-engine timeout.
    pub fn engine_timeout(&self) -> Duration {
        Duration::from_secs(self.engine_timeout)
    }

    /// Check the configuration before building anything from it.
    pub fn validate(&self) -> Result<()> {
        if self.engine_timeout == 0 {
            return Err(anyhow!("--engine-timeout must be at least 1 second"));
        }
        self.preprocess.to_config().validate()
    }
}

// Matches the command-line defaults.
impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            google_vision_api_key: None,
            openai_api_key: None,
            openai_api_base: None,
            gpt_model: "gpt-4o".to_owned(),
            tesseract_cmd: "tesseract".to_owned(),
            engine_timeout: 60,
            rate_limit: None,
            preprocess: PreprocessOpts::default(),
        }
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Command-line overrides for [`PreprocessConfig`].
#[derive(Args, Clone, Debug)]
pub struct PreprocessOpts {
    /// The resolution to scale images to, assuming they were captured at
    /// 72 DPI.
    #[clap(long, default_value = "300")]
    pub target_dpi: u32,

    /// The largest width or height a preprocessed image may have.
    #[clap(long, default_value = "4096")]
    pub max_dimension: u32,

    /// Contrast factor applied before binarization.
    #[clap(long, default_value = "1.5")]
    pub contrast_factor: f32,
}

impl Default for PreprocessOpts {
    fn default() -> Self {
        let defaults = PreprocessConfig::default();
        Self {
            target_dpi: defaults.target_dpi,
            max_dimension: defaults.max_dimension,
            contrast_factor: defaults.contrast_factor,
        }
    }
}

impl PreprocessOpts {
    pub fn to_config(&self) -> PreprocessConfig {
        PreprocessConfig {
            target_dpi: self.target_dpi,
            max_dimension: self.max_dimension,
            contrast_factor: self.contrast_factor,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_keys_count_as_missing() {
        let config = OcrConfig {
            google_vision_api_key: Some("   ".to_owned()),
            openai_api_key: Some("sk-1234".to_owned()),
            ..OcrConfig::default()
        };
        assert_eq!(config.google_vision_api_key(), None);
        assert_eq!(config.openai_api_key(), Some("sk-1234"));
    }

    #[test]
    fn zero_timeout_is_rejected() {
        assert!(OcrConfig::default().validate().is_ok());
        let config = OcrConfig {
            engine_timeout: 0,
            ..OcrConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
