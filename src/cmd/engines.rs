//! The `engines` subcommand.

use clap::Args;

use crate::{config::OcrConfig, prelude::*};

use super::service_from_config;

/// Engine listing command line arguments.
#[derive(Debug, Args)]
pub struct EnginesOpts {
    #[clap(flatten)]
    pub config: OcrConfig,
}

/// The `engines` subcommand. Prints each available engine on its own line, in
/// the order that automatic selection tries them.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_engines(opts: &EnginesOpts) -> Result<()> {
    let service = service_from_config(&opts.config)?;
    for engine in service.available_engines() {
        println!("{engine}");
    }
    Ok(())
}
