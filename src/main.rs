use std::str::FromStr;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{
    EnvFilter, Layer as _, filter::Directive, fmt::format::FmtSpan, layer::SubscriberExt,
    util::SubscriberInitExt as _,
};

use self::{prelude::*, ui::Ui};

mod async_utils;
mod cmd;
mod config;
mod cpu_limit;
mod data_url;
mod engines;
mod orchestrator;
mod prelude;
mod preprocess;
mod rate_limit;
mod recommend;
mod ui;

/// OCR scanned documents using cloud vision APIs, a vision LLM, or local
/// Tesseract.
#[derive(Debug, Parser)]
#[clap(
    version,
    author,
    after_help = r#"
Environment Variables:
  - GOOGLE_VISION_API_KEY (optional): Enables Google Cloud Vision.
  - OPENAI_API_KEY (optional): Enables GPT Vision.
  - OPENAI_API_BASE (optional): Override the OpenAI-compatible server URL.

  Local OCR needs `tesseract` on your PATH, with language data for
  the languages you use.

  These variables may be set in a standard `.env` file.
"#
)]
struct Opts {
    #[clap(subcommand)]
    subcmd: Cmd,
}

/// The subcommands we support.
#[derive(Debug, Subcommand)]
enum Cmd {
    /// OCR image files, writing one JSON line per file.
    Ocr(cmd::ocr::OcrOpts),
    /// List the engines we have credentials for.
    Engines(cmd::engines::EnginesOpts),
    /// Recommend an engine for a file.
    Recommend(cmd::recommend::RecommendOpts),
    /// Print schemas for output formats.
    Schema(cmd::schema::SchemaOpts),
}

impl Cmd {
    /// Are we using stdout for output?
    fn using_stdout_for_output(&self) -> bool {
        match self {
            Cmd::Ocr(opts) => opts.output_path.is_none(),
            Cmd::Engines(_) | Cmd::Recommend(_) => true,
            Cmd::Schema(opts) => opts.output_path.is_none(),
        }
    }
}

/// Our entry point, which can return an error. [`anyhow::Result`] will
/// automatically print a nice error message with optional backtrace.
#[tokio::main]
async fn main() -> Result<()> {
    let ui = Ui::init();

    // Initialize tracing.
    let directive = Directive::from_str("info").context("bad built-in log directive")?;
    let env_filter = EnvFilter::builder()
        .with_default_directive(directive)
        .from_env_lossy();

    let subscriber = tracing_subscriber::fmt::layer()
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_writer(ui.get_stderr_writer())
        .with_filter(env_filter);

    tracing_subscriber::registry().with(subscriber).init();

    real_main(ui).await
}

/// Our real entry point.
#[instrument(level = "debug", name = "main", skip_all)]
async fn real_main(ui: Ui) -> Result<()> {
    // Load environment variables from a `.env` file, if it exists.
    dotenvy::dotenv().ok();

    let opts = Opts::parse();

    // Hide the progress bar if we're using stdout for output.
    if opts.subcmd.using_stdout_for_output() {
        ui.hide_progress_bars();
    }

    // Ctrl-C cancels any OCR requests in flight. We still write out whatever
    // results we already have.
    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, cancelling OCR requests");
                cancel.cancel();
            }
        }
    });

    match &opts.subcmd {
        Cmd::Ocr(opts) => cmd::ocr::cmd_ocr(ui, opts, cancel).await,
        Cmd::Engines(opts) => cmd::engines::cmd_engines(opts).await,
        Cmd::Recommend(opts) => cmd::recommend::cmd_recommend(opts).await,
        Cmd::Schema(opts) => cmd::schema::cmd_schema(opts).await,
    }
}
