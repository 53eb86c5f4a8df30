//! Choosing OCR engines and combining their results.
//!
//! [`OcrService`] is the main entry point. For each request it:
//!
//! 1. Decodes the image, if we were given file bytes.
//! 2. Runs the preprocessing pipeline, unless asked not to. If preprocessing
//!    fails, we log it and carry on with the original image.
//! 3. Calls one or more engines, depending on [`EngineChoice`]:
//!    - [`EngineChoice::Specific`]: one engine. Its errors go straight back to
//!      the caller.
//!    - [`EngineChoice::Auto`]: each available engine in priority order, at
//!      most once each, until one succeeds.
//!    - [`EngineChoice::Hybrid`]: every available engine at once. The most
//!      confident result wins.
//!
//! Every engine call is bounded by a timeout and by the caller's
//! [`CancellationToken`].

use std::{error, fmt, sync::Arc, time::Duration, time::Instant};

use futures::future;
use tokio::time;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    async_utils::spawn_blocking_catching_panics,
    config::OcrConfig,
    engines::{
        DetailLevel, EngineError, EngineId, EngineTag, ExtractOptions, OcrEngine, OcrResult,
        engines_for_config,
    },
    preprocess::{PreprocessConfig, PreprocessError, pixel_buffer::PixelBuffer, preprocess},
    prelude::*,
    recommend::recommend_engine,
};

/// The image to OCR.
pub enum ImageInput {
    /// An already-decoded raster.
    #[cfg(test)]
    Pixels(PixelBuffer),
    /// The bytes of an image file (PNG, JPEG, WebP, GIF or TIFF).
    Encoded(Vec<u8>),
}

/// Which engines to use for a request.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum EngineChoice {
    /// Try engines in priority order until one succeeds.
    #[default]
    Auto,
    /// Run every available engine and keep the most confident result.
    Hybrid,
    /// Use exactly this engine, with no fallback.
    Specific(EngineId),
}

/// A request to OCR one image.
pub struct OcrRequest {
    /// The image.
    pub image: ImageInput,

    /// Run the preprocessing pipeline first?
    pub preprocess: bool,

    /// Which engines to use.
    pub engine: EngineChoice,

    /// Tesseract-style language code.
    pub language: String,

    /// Detail level for generative engines.
    pub detail: DetailLevel,
}

impl OcrRequest {
    /// A request with default options: preprocess, automatic engine choice,
    /// Portuguese.
    #[cfg(test)]
    pub fn new(image: ImageInput) -> Self {
        Self {
            image,
            preprocess: true,
            engine: EngineChoice::Auto,
            language: "por".to_owned(),
            detail: DetailLevel::default(),
        }
    }
}

/// Errors returned to callers of [`OcrService::extract_text`].
#[derive(Debug)]
pub enum OcrError {
    /// The engine named in an explicit request failed.
    Engine {
        engine: EngineId,
        error: EngineError,
    },

    /// No engine produced a usable result. Contains the failure for every
    /// engine we considered.
    AllEnginesExhausted {
        failures: Vec<(EngineId, EngineError)>,
    },

    /// The input could not be decoded, or isn't a valid raster.
    InvalidImage(String),

    /// The caller cancelled the request.
    Cancelled,
}

impl fmt::Display for OcrError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OcrError::Engine { engine, error } => write!(f, "{engine} failed: {error}"),
            OcrError::AllEnginesExhausted { failures } => {
                write!(f, "all OCR engines failed")?;
                for (engine, error) in failures {
                    write!(f, "\n  - {engine}: {error}")?;
                }
                Ok(())
            }
            OcrError::InvalidImage(msg) => write!(f, "invalid image: {msg}"),
            OcrError::Cancelled => write!(f, "OCR request was cancelled"),
        }
    }
}

impl error::Error for OcrError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            OcrError::Engine { error, .. } => Some(error),
            _ => None,
        }
    }
}

/// Runs OCR requests against a fixed set of engines.
///
/// Holds nothing but immutable configuration, so one service can be shared
/// by any number of concurrent requests.
pub struct OcrService {
    /// Engines, in priority order.
    engines: Vec<Arc<dyn OcrEngine>>,

    /// Preprocessing settings.
    preprocess_config: PreprocessConfig,

    /// Maximum time for one engine call.
    engine_timeout: Duration,
}

impl OcrService {
    /// Create a service from explicit engines. `engines` must be in priority
    /// order.
    pub fn new(
        engines: Vec<Arc<dyn OcrEngine>>,
        preprocess_config: PreprocessConfig,
        engine_timeout: Duration,
    ) -> Self {
        Self {
            engines,
            preprocess_config,
            engine_timeout,
        }
    }

    /// Create a service with all our built-in engines.
    pub fn from_config(config: &OcrConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::new(
            engines_for_config(config)?,
            config.preprocess.to_config(),
            config.engine_timeout(),
        ))
    }

    /// Engines we have credentials for, in priority order.
    pub fn available_engines(&self) -> Vec<EngineId> {
        self.engines
            .iter()
            .filter(|engine| engine.is_available())
            .map(|engine| engine.id())
            .collect()
    }

    /// Suggest an engine for a file. Purely advisory.
    pub fn recommend_engine(&self, file_type: &str, file_size: u64) -> EngineId {
        recommend_engine(file_type, file_size, &self.available_engines())
    }

    /// OCR one image.
    #[instrument(level = "debug", skip_all, fields(request_id = %Uuid::new_v4(), engine = ?request.engine))]
    pub async fn extract_text(
        &self,
        request: OcrRequest,
        cancel: &CancellationToken,
    ) -> Result<OcrResult, OcrError> {
        // An explicit engine without credentials fails before we spend any
        // time on the image.
        let explicit = match request.engine {
            EngineChoice::Specific(id) => Some(self.explicit_engine(id)?),
            EngineChoice::Auto | EngineChoice::Hybrid => None,
        };

        let original = Arc::new(decode(request.image).await?);
        if cancel.is_cancelled() {
            return Err(OcrError::Cancelled);
        }

        let started = Instant::now();
        let (image, preprocessed) = if request.preprocess {
            match preprocess(
                original.clone(),
                self.preprocess_config.clone(),
                cancel.clone(),
            )
            .await
            {
                Ok(image) => (Arc::new(image), true),
                Err(PreprocessError::Cancelled) => return Err(OcrError::Cancelled),
                Err(err) => {
                    warn!("Preprocessing failed, using original image: {err}");
                    (original, false)
                }
            }
        } else {
            (original, false)
        };

        let options = ExtractOptions {
            language: request.language,
            detail: request.detail,
            preprocessed,
        };
        match (explicit, request.engine) {
            (Some(engine), _) => self.extract_explicit(engine, &image, &options, cancel).await,
            (None, EngineChoice::Hybrid) => {
                self.extract_hybrid(&image, &options, cancel, started).await
            }
            (None, _) => self.extract_auto(&image, &options, cancel).await,
        }
    }

    /// Look up the engine for an explicit request, failing if we can't call it.
    fn explicit_engine(&self, id: EngineId) -> Result<&dyn OcrEngine, OcrError> {
        let engine = self
            .engines
            .iter()
            .find(|engine| engine.id() == id)
            .ok_or_else(|| OcrError::Engine {
                engine: id,
                error: EngineError::Configuration(format!("{id} is not installed")),
            })?;
        if !engine.is_available() {
            return Err(OcrError::Engine {
                engine: id,
                error: EngineError::Configuration(format!("{id} has no credentials configured")),
            });
        }
        Ok(engine.as_ref())
    }

    /// Use exactly one engine.
    async fn extract_explicit(
        &self,
        engine: &dyn OcrEngine,
        image: &PixelBuffer,
        options: &ExtractOptions,
        cancel: &CancellationToken,
    ) -> Result<OcrResult, OcrError> {
        match self.attempt(engine, image, options, cancel).await {
            Ok(result) => Ok(result),
            Err(EngineError::Cancelled) => Err(OcrError::Cancelled),
            Err(error) => Err(OcrError::Engine {
                engine: engine.id(),
                error,
            }),
        }
    }

    /// Try each available engine once, in priority order.
    async fn extract_auto(
        &self,
        image: &PixelBuffer,
        options: &ExtractOptions,
        cancel: &CancellationToken,
    ) -> Result<OcrResult, OcrError> {
        let mut failures = vec![];
        for engine in &self.engines {
            let id = engine.id();
            if !engine.is_available() {
                debug!(engine = %id, "Skipping engine without credentials");
                failures.push((
                    id,
                    EngineError::Configuration("no credentials configured".to_owned()),
                ));
                continue;
            }
            match self.attempt(engine.as_ref(), image, options, cancel).await {
                Ok(result) => return Ok(result),
                Err(EngineError::Cancelled) => return Err(OcrError::Cancelled),
                Err(error) if error.is_configuration() => {
                    warn!(engine = %id, "OCR engine rejected our credentials, trying next engine: {error}");
                    failures.push((id, error));
                }
                Err(error) => {
                    warn!(engine = %id, "OCR engine failed, trying next engine: {error}");
                    failures.push((id, error));
                }
            }
        }
        Err(OcrError::AllEnginesExhausted { failures })
    }

    /// Run every available engine concurrently and keep the most confident
    /// result.
    async fn extract_hybrid(
        &self,
        image: &PixelBuffer,
        options: &ExtractOptions,
        cancel: &CancellationToken,
        started: Instant,
    ) -> Result<OcrResult, OcrError> {
        let engines = self
            .engines
            .iter()
            .filter(|engine| engine.is_available())
            .collect::<Vec<_>>();
        let outcomes = future::join_all(
            engines
                .iter()
                .map(|engine| self.attempt(engine.as_ref(), image, options, cancel)),
        )
        .await;
        if cancel.is_cancelled() {
            return Err(OcrError::Cancelled);
        }

        let mut best: Option<OcrResult> = None;
        let mut failures = vec![];
        // `outcomes` is in priority order, so ties go to the higher-priority
        // engine regardless of which one finished first.
        for (engine, outcome) in engines.iter().zip(outcomes) {
            match outcome {
                Ok(result) => {
                    debug!(engine = %engine.id(), confidence = result.confidence, "Hybrid candidate");
                    if best
                        .as_ref()
                        .is_none_or(|best| result.confidence > best.confidence)
                    {
                        best = Some(result);
                    }
                }
                Err(error) => {
                    warn!(engine = %engine.id(), "OCR engine failed in hybrid mode: {error}");
                    failures.push((engine.id(), error));
                }
            }
        }

        let Some(mut best) = best else {
            return Err(OcrError::AllEnginesExhausted { failures });
        };
        info!(winner = ?best.engine, confidence = best.confidence, "Hybrid OCR picked result");
        best.engine = EngineTag::Hybrid;
        best.processing_time_ms =
            u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        Ok(best)
    }

    /// Call one engine, with a timeout, giving up early if cancelled.
    #[instrument(level = "debug", skip_all, fields(engine = %engine.id()))]
    async fn attempt(
        &self,
        engine: &dyn OcrEngine,
        image: &PixelBuffer,
        options: &ExtractOptions,
        cancel: &CancellationToken,
    ) -> Result<OcrResult, EngineError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(EngineError::Cancelled),
            outcome = time::timeout(self.engine_timeout, engine.extract(image, options)) => {
                match outcome {
                    Ok(result) => result,
                    Err(_) => Err(EngineError::Timeout(self.engine_timeout)),
                }
            }
        }
    }
}

/// Turn the request image into a raster.
async fn decode(image: ImageInput) -> Result<PixelBuffer, OcrError> {
    match image {
        #[cfg(test)]
        ImageInput::Pixels(buffer) => Ok(buffer),
        ImageInput::Encoded(bytes) => {
            spawn_blocking_catching_panics(move || PixelBuffer::decode(&bytes))
                .await
                .and_then(|decoded| decoded)
                .map_err(|err| OcrError::InvalidImage(format!("{err:#}")))
        }
    }
}
