//! grainhost: per-grain sandboxed container registry.
//!
//! A grain is a document-scoped unit of sandboxed compute. Its container is
//! expensive to start, so [`ContainerRegistry`] keeps at most one live container
//! per grain, shares it among concurrent callers, reclaims it once idle, and
//! notices when it dies on its own.
//!
//! ```rust,no_run
//! # async fn example() -> grainhost::GrainhostResult<()> {
//! use grainhost::{ContainerRegistry, ProcessStarter, ProcessStarterOptions, RegistryOptions};
//! use grainhost::{GrainCatalog, GrainRecord};
//! use std::collections::HashMap;
//! use tokio_util::sync::CancellationToken;
//!
//! let starter = ProcessStarter::new(
//!     ProcessStarterOptions::new("/usr/libexec/grain-runner").arg("{grain_id}"),
//! )?;
//! let registry = ContainerRegistry::new(starter, RegistryOptions::from_env()?)?;
//!
//! let mut catalog: HashMap<String, GrainRecord> = HashMap::new();
//! catalog.insert("g1".into(), GrainRecord { grain_id: "g1".into(), package_id: "notes".into() });
//!
//! let ctx = CancellationToken::new();
//! let lease = registry.acquire(&ctx, &catalog as &dyn GrainCatalog, "g1").await?;
//! println!("grain g1 runs as pid {}", lease.pid());
//! # Ok(())
//! # }
//! ```

pub mod container;
pub mod metrics;
pub mod registry;
pub mod runtime;
pub mod util;

pub use container::{
    Container, ContainerStarter, GrainCatalog, GrainRecord, ProcessContainer, ProcessStarter,
};
pub use grainhost_shared::{GrainhostError, GrainhostResult};
pub use metrics::RegistryMetrics;
pub use registry::{ContainerLease, ContainerRegistry};
pub use runtime::{
    GrainId, GrainInfo, HandleStatus, InstanceId, LoggingOptions, ProcessStarterOptions,
    RegistryOptions,
};

use std::sync::OnceLock;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

const DEFAULT_LOG_FILTER: &str = "grainhost=info";
const LOG_FILE_PREFIX: &str = "grainhost.log";

/// Keeps the non-blocking file writer flushing for the life of the process.
static LOG_GUARD: OnceLock<Option<WorkerGuard>> = OnceLock::new();

/// Install the global tracing subscriber.
///
/// Logs go to a daily-rolling file under `log_dir` when set, stderr otherwise.
/// `RUST_LOG` overrides the filter. Only the first call has any effect; if the
/// host application already installed a subscriber, that one is kept.
pub fn init_logging(options: &LoggingOptions) -> GrainhostResult<()> {
    if LOG_GUARD.get().is_some() {
        return Ok(());
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(
            options
                .default_filter
                .as_deref()
                .unwrap_or(DEFAULT_LOG_FILTER),
        )
    });

    let guard = match &options.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir).map_err(|e| {
                GrainhostError::Config(format!(
                    "failed to create log directory {}: {}",
                    dir.display(),
                    e
                ))
            })?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true);
            if tracing_subscriber::registry()
                .with(filter)
                .with(layer)
                .try_init()
                .is_err()
            {
                return Ok(());
            }
            Some(guard)
        }
        None => {
            let layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
            if tracing_subscriber::registry()
                .with(filter)
                .with(layer)
                .try_init()
                .is_err()
            {
                return Ok(());
            }
            None
        }
    };

    let _ = LOG_GUARD.set(guard);
    tracing::debug!(log_dir = ?options.log_dir, "Logging initialized");
    Ok(())
}

// ============================================================================
// THREAD SAFETY ASSERTIONS
// ============================================================================

const _: () = {
    const fn assert_send_sync<T: Send + Sync>() {}
    let _ = assert_send_sync::<ContainerRegistry<ProcessStarter>>;
    let _ = assert_send_sync::<ContainerLease<ProcessStarter>>;
};

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_init_logging_creates_dir_and_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let log_dir = temp_dir.path().join("logs");
        let options = LoggingOptions {
            log_dir: Some(log_dir.clone()),
            default_filter: Some("grainhost=debug".into()),
        };

        init_logging(&options).unwrap();
        assert!(log_dir.is_dir());
        init_logging(&options).unwrap();
    }
}
