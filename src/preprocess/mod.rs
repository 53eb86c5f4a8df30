//! Image preprocessing for OCR.
//!
//! We run a fixed sequence of stages over a private copy of the input image:
//!
//! 1. Resize so the image looks like a 300 DPI scan.
//! 2. Grayscale.
//! 3. Boost contrast.
//! 4. Median denoise.
//! 5. Otsu binarization.
//! 6. Sharpen.
//!
//! All of this is CPU-bound, so [`preprocess`] runs it on Tokio's blocking
//! pool while holding a CPU permit. The caller's [`CancellationToken`] is
//! checked between stages.

use std::{error, fmt, sync::Arc};

use schemars::JsonSchema;
use tokio_util::sync::CancellationToken;

use crate::{
    async_utils::spawn_blocking_catching_panics, cpu_limit::with_cpu_semaphore, prelude::*,
};

use self::pixel_buffer::PixelBuffer;

pub mod pixel_buffer;
pub mod stages;

/// Tuning knobs for the preprocessing pipeline.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct PreprocessConfig {
    /// The resolution we want the recognizer to see. Inputs are assumed to be
    /// 72 DPI.
    pub target_dpi: u32,

    /// Neither side of the resized image may exceed this many pixels.
    pub max_dimension: u32,

    /// Linear contrast factor. `1.0` leaves the image unchanged.
    pub contrast_factor: f32,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            target_dpi: 300,
            max_dimension: 4096,
            contrast_factor: 1.5,
        }
    }
}

impl PreprocessConfig {
    /// Check that this configuration can actually be used.
    pub fn validate(&self) -> Result<()> {
        if self.target_dpi == 0 {
            return Err(anyhow!("target DPI must be greater than 0"));
        }
        if self.max_dimension == 0 {
            return Err(anyhow!("maximum dimension must be greater than 0"));
        }
        if !self.contrast_factor.is_finite() || self.contrast_factor < 0.0 {
            return Err(anyhow!(
                "contrast factor must be a non-negative number, not {}",
                self.contrast_factor
            ));
        }
        Ok(())
    }
}

/// Why preprocessing didn't produce an image.
#[derive(Debug)]
pub enum PreprocessError {
    /// The input has no pixels.
    EmptyImage,

    /// A stage failed.
    Stage {
        stage: &'static str,
        error: anyhow::Error,
    },

    /// The worker thread panicked or could not be scheduled.
    Worker(String),

    /// The request was cancelled.
    Cancelled,
}

impl fmt::Display for PreprocessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PreprocessError::EmptyImage => write!(f, "image has no pixels"),
            PreprocessError::Stage { stage, error } => {
                write!(f, "preprocessing stage {stage} failed: {error:#}")
            }
            PreprocessError::Worker(msg) => write!(f, "preprocessing worker failed: {msg}"),
            PreprocessError::Cancelled => write!(f, "preprocessing was cancelled"),
        }
    }
}

impl error::Error for PreprocessError {}

/// Runs the preprocessing stages. Holds a scratch buffer that the
/// neighbourhood stages share.
pub struct Pipeline {
    config: PreprocessConfig,
    scratch: Vec<u8>,
}

impl Pipeline {
    /// Create a new pipeline.
    pub fn new(config: PreprocessConfig) -> Self {
        Self {
            config,
            scratch: Vec::new(),
        }
    }

    /// Run every stage, returning a new buffer. `image` is never modified.
    pub fn run(
        &mut self,
        image: &PixelBuffer,
        cancel: &CancellationToken,
    ) -> Result<PixelBuffer, PreprocessError> {
        if image.is_empty() {
            return Err(PreprocessError::EmptyImage);
        }

        let mut buffer = stages::resize_for_dpi(image, &self.config).map_err(|error| {
            PreprocessError::Stage {
                stage: "resize",
                error,
            }
        })?;
        checkpoint(cancel)?;

        stages::grayscale(&mut buffer);
        checkpoint(cancel)?;

        stages::enhance_contrast(&mut buffer, self.config.contrast_factor);
        checkpoint(cancel)?;

        stages::denoise(&mut buffer, &mut self.scratch);
        checkpoint(cancel)?;

        let threshold = stages::binarize(&mut buffer);
        trace!(threshold, "Otsu threshold");
        checkpoint(cancel)?;

        stages::sharpen(&mut buffer, &mut self.scratch);
        debug!(
            width = buffer.width(),
            height = buffer.height(),
            threshold,
            "Preprocessed image"
        );
        Ok(buffer)
    }
}

/// Bail out if the request has been cancelled.
fn checkpoint(cancel: &CancellationToken) -> Result<(), PreprocessError> {
    if cancel.is_cancelled() {
        Err(PreprocessError::Cancelled)
    } else {
        Ok(())
    }
}

/// Preprocess `image` on a blocking worker thread.
#[instrument(level = "debug", skip_all, fields(width = image.width(), height = image.height()))]
pub async fn preprocess(
    image: Arc<PixelBuffer>,
    config: PreprocessConfig,
    cancel: CancellationToken,
) -> Result<PixelBuffer, PreprocessError> {
    let result = with_cpu_semaphore(|| {
        spawn_blocking_catching_panics(move || Pipeline::new(config).run(&image, &cancel))
    })
    .await;
    match result {
        Ok(output) => output,
        // A panicking stage is a preprocessing failure, and the caller falls
        // back to the original image.
        Err(err) => Err(PreprocessError::Worker(format!("{err:#}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preprocess::pixel_buffer::CHANNELS;

    fn checkerboard(width: u32, height: u32) -> PixelBuffer {
        let values = (0..width * height)
            .map(|i| if (i % width + i / width) % 2 == 0 { 30 } else { 220 })
            .collect::<Vec<u8>>();
        PixelBuffer::from_gray(width, height, &values).unwrap()
    }

    #[test]
    fn pipeline_output_is_binary_and_fits() {
        let config = PreprocessConfig {
            target_dpi: 144,
            max_dimension: 50,
            contrast_factor: 1.5,
        };
        let image = checkerboard(40, 10);
        let output = Pipeline::new(config.clone())
            .run(&image, &CancellationToken::new())
            .unwrap();
        assert_eq!((output.width(), output.height()), (50, 13));
        for px in output.pixels().chunks_exact(CHANNELS) {
            assert!(px[0] == 0 || px[0] == 255);
            assert_eq!(px[0], px[1]);
            assert_eq!(px[1], px[2]);
        }
        // The input is untouched.
        assert_eq!(image, checkerboard(40, 10));
    }

    #[test]
    fn pipeline_rejects_empty_images() {
        let image = PixelBuffer::from_rgba(0, 0, vec![]).unwrap();
        let result = Pipeline::new(PreprocessConfig::default())
            .run(&image, &CancellationToken::new());
        assert!(matches!(result, Err(PreprocessError::EmptyImage)));
    }

    #[test]
    fn pipeline_stops_when_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result =
            Pipeline::new(PreprocessConfig::default()).run(&checkerboard(4, 4), &cancel);
        assert!(matches!(result, Err(PreprocessError::Cancelled)));
    }

    #[test]
    fn config_validation() {
        assert!(PreprocessConfig::default().validate().is_ok());
        let bad = PreprocessConfig {
            max_dimension: 0,
            ..PreprocessConfig::default()
        };
        assert!(bad.validate().is_err());
        let bad = PreprocessConfig {
            contrast_factor: f32::NAN,
            ..PreprocessConfig::default()
        };
        assert!(bad.validate().is_err());
    }

    #[tokio::test]
    async fn preprocess_runs_on_worker() {
        let image = Arc::new(checkerboard(8, 8));
        let output = preprocess(
            image.clone(),
            PreprocessConfig::default(),
            CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!((output.width(), output.height()), (33, 33));
    }
}
