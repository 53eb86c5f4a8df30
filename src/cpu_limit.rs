//! Limits on concurrent CPU-bound work.
//!
//! Pixel pipelines and `tesseract` processes each keep a core busy. When a
//! large batch is in flight, we let at most one of them run per CPU and make
//! the rest wait for a permit.

use std::sync::LazyLock;

use tokio::sync::Semaphore;

use crate::prelude::*;

/// One permit per CPU.
static CPU_PERMITS: LazyLock<Semaphore> = LazyLock::new(|| Semaphore::new(num_cpus::get()));

/// Run `f` to completion while holding a CPU permit.
#[instrument(level = "trace", skip_all, fields(available = CPU_PERMITS.available_permits()))]
pub async fn with_cpu_semaphore<Func, Fut, R>(f: Func) -> Result<R>
where
    Func: FnOnce() -> Fut,
    Fut: Future<Output = Result<R>>,
{
    let _permit = CPU_PERMITS
        .acquire()
        .await
        .context("CPU permit semaphore was closed")?;
    f().await
}
