//! Command-line entry points.

use tokio_util::sync::CancellationToken;

use crate::{config::OcrConfig, orchestrator::OcrService, prelude::*};

pub mod engines;
pub mod ocr;
pub mod recommend;
pub mod schema;

/// Build an [`OcrService`] from our command-line configuration.
pub fn service_from_config(config: &OcrConfig) -> Result<OcrService> {
    OcrService::from_config(config).context("could not configure OCR engines")
}

/// Fail if the user interrupted us.
pub fn check_not_cancelled(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(anyhow!("interrupted"))
    } else {
        Ok(())
    }
}
