//! Advisory engine recommendations.
//!
//! The orchestrator never calls this. It's for planning and for showing users
//! which engine would probably do best on a given file.

use crate::{engines::EngineId, prelude::*};

/// Files larger than this go to the cloud vision engine when we can.
pub const LARGE_DOCUMENT_BYTES: u64 = 2 * 1024 * 1024;

/// Recommend an engine for a file of type `file_type` and `file_size` bytes,
/// given the engines that are currently `available`.
///
/// Large scans tend to be complex, and the document-text engine handles those
/// best. Otherwise, we prefer the generative engine if we have one.
pub fn recommend_engine(file_type: &str, file_size: u64, available: &[EngineId]) -> EngineId {
    let has = |id| available.contains(&id);
    let recommended = if file_size > LARGE_DOCUMENT_BYTES && has(EngineId::GoogleVision) {
        EngineId::GoogleVision
    } else if has(EngineId::GptVision) {
        EngineId::GptVision
    } else if has(EngineId::GoogleVision) {
        EngineId::GoogleVision
    } else {
        EngineId::LocalOcr
    };
    debug!(file_type, file_size, %recommended, "Recommended engine");
    recommended
}
