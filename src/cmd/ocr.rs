//! The `ocr` subcommand.

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use clap::{Args, ValueEnum};
use futures::{StreamExt as _, stream};
use schemars::JsonSchema;
use tokio_util::sync::CancellationToken;

use crate::{
    async_utils::io::write_jsonl,
    config::OcrConfig,
    engines::{DetailLevel, EngineId, OcrResult},
    orchestrator::{EngineChoice, ImageInput, OcrRequest, OcrService},
    prelude::*,
    ui::{ProgressConfig, Ui},
};

use super::{check_not_cancelled, service_from_config};

/// Engine selection on the command line.
#[derive(Clone, Copy, Debug, Default, ValueEnum)]
#[clap(rename_all = "snake_case")]
pub enum EngineArg {
    /// Try each configured engine in priority order.
    #[default]
    Auto,
    /// Run every configured engine and keep the most confident result.
    Hybrid,
    /// Google Cloud Vision only.
    GoogleVision,
    /// GPT Vision only.
    GptVision,
    /// Local `tesseract` only.
    LocalOcr,
}

impl From<EngineArg> for EngineChoice {
    fn from(arg: EngineArg) -> Self {
        match arg {
            EngineArg::Auto => EngineChoice::Auto,
            EngineArg::Hybrid => EngineChoice::Hybrid,
            EngineArg::GoogleVision => EngineChoice::Specific(EngineId::GoogleVision),
            EngineArg::GptVision => EngineChoice::Specific(EngineId::GptVision),
            EngineArg::LocalOcr => EngineChoice::Specific(EngineId::LocalOcr),
        }
    }
}

/// OCR command line arguments.
#[derive(Debug, Args)]
pub struct OcrOpts {
    /// Image files to OCR.
    #[clap(required = true, value_name = "FILE")]
    pub inputs: Vec<PathBuf>,

    /// Which engine to use.
    #[clap(long, value_enum, default_value_t)]
    pub engine: EngineArg,

    /// Send the original image to the engines, without cleaning it up first.
    #[clap(long)]
    pub no_preprocess: bool,

    /// The document language, as a Tesseract language code.
    #[clap(long, default_value = "por")]
    pub language: String,

    /// How closely GPT Vision should look at the image.
    #[clap(long, value_enum, default_value_t)]
    pub detail: DetailLevel,

    /// Max number of files to OCR at a time.
    #[clap(short = 'j', long = "jobs", default_value = "4")]
    pub job_count: usize,

    /// Output location. Defaults to standard output.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,

    #[clap(flatten)]
    pub config: OcrConfig,
}

/// One line of `ocr` output.
#[derive(Debug, JsonSchema, Serialize)]
pub struct OcrLine {
    /// The input file.
    pub path: PathBuf,

    /// The OCR result, if we have one.
    #[serde(flatten)]
    pub result: Option<OcrResult>,

    /// Why OCR failed, if it did.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The `ocr` subcommand.
#[instrument(level = "debug", skip_all, fields(files = opts.inputs.len()))]
pub async fn cmd_ocr(ui: Ui, opts: &OcrOpts, cancel: CancellationToken) -> Result<()> {
    if opts.job_count == 0 {
        return Err(anyhow!("--jobs must be at least 1"));
    }
    let service = Arc::new(service_from_config(&opts.config)?);
    let available = service.available_engines();
    info!(?available, "Configured OCR engines");

    let pb = ui.new_progress_bar(
        &ProgressConfig {
            emoji: "📄",
            msg: "OCRing files",
            done_msg: "OCRed files",
        },
        u64::try_from(opts.inputs.len()).unwrap_or(u64::MAX),
    );

    let failures = Arc::new(AtomicUsize::new(0));
    let preprocess = !opts.no_preprocess;
    let engine = EngineChoice::from(opts.engine);
    let language = opts.language.clone();
    let detail = opts.detail;
    let lines = stream::iter(opts.inputs.clone())
        .map({
            let failures = failures.clone();
            let cancel = cancel.clone();
            move |path| {
                let service = service.clone();
                let failures = failures.clone();
                let cancel = cancel.clone();
                let language = language.clone();
                async move {
                    let settings = OcrSettings {
                        preprocess,
                        engine,
                        language,
                        detail,
                    };
                    let line = ocr_file(&service, path, settings, &cancel).await;
                    if line.error.is_some() {
                        failures.fetch_add(1, Ordering::SeqCst);
                    }
                    Ok::<_, anyhow::Error>(line)
                }
            }
        })
        .buffered(opts.job_count);
    let lines = pb.wrap_stream(lines).boxed();

    write_jsonl(opts.output_path.as_deref(), lines).await?;
    check_not_cancelled(&cancel)?;

    let failures = failures.load(Ordering::SeqCst);
    if failures > 0 {
        return Err(anyhow!(
            "{} of {} files could not be OCRed",
            failures,
            opts.inputs.len()
        ));
    }
    Ok(())
}

/// Per-file request settings from the command line.
struct OcrSettings {
    preprocess: bool,
    engine: EngineChoice,
    language: String,
    detail: DetailLevel,
}

/// OCR a single file. Failures are reported in the returned line.
#[instrument(level = "debug", skip_all, fields(path = %path.display()))]
async fn ocr_file(
    service: &OcrService,
    path: PathBuf,
    settings: OcrSettings,
    cancel: &CancellationToken,
) -> OcrLine {
    let bytes = match tokio::fs::read(&path).await {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!("Could not read {}: {}", path.display(), err);
            return OcrLine {
                path,
                result: None,
                error: Some(format!("could not read file: {err}")),
            };
        }
    };

    let request = OcrRequest {
        image: ImageInput::Encoded(bytes),
        preprocess: settings.preprocess,
        engine: settings.engine,
        language: settings.language,
        detail: settings.detail,
    };
    match service.extract_text(request, cancel).await {
        Ok(result) => {
            debug!(engine = ?result.engine, confidence = result.confidence, "OCRed file");
            OcrLine {
                path,
                result: Some(result),
                error: None,
            }
        }
        Err(err) => {
            warn!("Could not OCR {}: {}", path.display(), err);
            OcrLine {
                path,
                result: None,
                error: Some(err.to_string()),
            }
        }
    }
}
