//! Container seams consumed by the registry.
//!
//! ## Architecture
//!
//! - **ContainerStarter**: the start operation (creates a Container)
//! - **Container**: runtime operations on a started container (shutdown, exit watch)
//!
//! The registry never looks inside a container. It only starts one, hands it out,
//! asks it to shut down, and waits for it to exit.

mod process;

use grainhost_shared::GrainhostResult;
use tokio_util::sync::CancellationToken;

pub use process::{GrainCatalog, GrainRecord, ProcessContainer, ProcessStarter};

/// Runtime operations on a started container.
#[async_trait::async_trait]
pub trait Container: Send + Sync + 'static {
    /// Request shutdown and wait until the container is gone.
    async fn shutdown(&self) -> GrainhostResult<()>;

    /// Resolve once the container has terminated, whoever caused it.
    ///
    /// Must be safe to call concurrently and after the container already exited.
    async fn wait_exit(&self);
}

/// The opaque "start a container for grain G" operation.
///
/// Implementations may be slow and must observe `ctx`: once it is cancelled the
/// start should give up and return `GrainhostError::Canceled`.
#[async_trait::async_trait]
pub trait ContainerStarter: Send + Sync + 'static {
    type Container: Container;
    /// Metadata store handed through to `start` untouched by the registry.
    type Database: Send + Sync + ?Sized;

    async fn start(
        &self,
        ctx: &CancellationToken,
        db: &Self::Database,
        grain_id: &str,
    ) -> GrainhostResult<Self::Container>;
}
