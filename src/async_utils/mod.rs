//! Asynchronous utilities for use with Tokio.

use std::pin::Pin;

use futures::Stream;

use crate::prelude::*;

pub mod io;

/// A type alias for a boxed stream. This is used to make it easier to work
/// streams that return complex types.
pub type BoxedStream<Item> = Pin<Box<dyn Stream<Item = Item> + Send>>;

/// Run a CPU-heavy closure on Tokio's blocking pool.
///
/// Panics in the closure become errors, because a single corrupt image should
/// not take down a whole batch.
pub async fn spawn_blocking_catching_panics<F, T>(f: F) -> Result<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .context("background task failed")
}

/// Report any command failures, and include any error output.
///
/// Standard output and standard error are logged at debug level. A non-zero
/// exit status is an error that includes standard error.
pub fn check_for_command_failure(
    command_name: &str,
    output: &std::process::Output,
) -> Result<()> {
    let stderr = String::from_utf8_lossy(&output.stderr);
    trace!(
        command_name = command_name,
        output = %String::from_utf8_lossy(&output.stdout),
        "Standard output from command"
    );
    debug!(
        command_name = command_name,
        output = %stderr,
        "Standard error from command",
    );

    if output.status.success() {
        Ok(())
    } else if let Some(exit_code) = output.status.code() {
        Err(anyhow!(
            "{} failed with exit code {} and error output:\n{}",
            command_name,
            exit_code,
            stderr,
        ))
    } else {
        Err(anyhow!(
            "{} failed with error output:\n{}",
            command_name,
            stderr,
        ))
    }
}
