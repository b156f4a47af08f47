//! Reference starter that runs one OS process per grain.

use super::{Container, ContainerStarter};
use crate::runtime::options::ProcessStarterOptions;
use crate::runtime::types::GrainId;
use crate::util::{is_process_alive, kill_process, terminate_process};
use grainhost_shared::{GrainhostError, GrainhostResult};
use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Grain metadata needed to launch its process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrainRecord {
    pub grain_id: GrainId,
    pub package_id: String,
}

/// Narrow read-only view of the grain database.
pub trait GrainCatalog: Send + Sync {
    /// Returns `Ok(None)` if the grain does not exist.
    fn lookup(&self, grain_id: &str) -> GrainhostResult<Option<GrainRecord>>;
}

impl GrainCatalog for HashMap<GrainId, GrainRecord> {
    fn lookup(&self, grain_id: &str) -> GrainhostResult<Option<GrainRecord>> {
        Ok(self.get(grain_id).cloned())
    }
}

/// Starts grains as child processes of the host.
#[derive(Debug, Clone)]
pub struct ProcessStarter {
    options: ProcessStarterOptions,
}

impl ProcessStarter {
    pub fn new(options: ProcessStarterOptions) -> GrainhostResult<Self> {
        options.sanitize()?;
        Ok(Self { options })
    }
}

#[async_trait::async_trait]
impl ContainerStarter for ProcessStarter {
    type Container = ProcessContainer;
    type Database = dyn GrainCatalog;

    async fn start(
        &self,
        ctx: &CancellationToken,
        db: &Self::Database,
        grain_id: &str,
    ) -> GrainhostResult<ProcessContainer> {
        let record = db
            .lookup(grain_id)
            .map_err(|e| GrainhostError::start_failed(grain_id, e))?
            .ok_or_else(|| GrainhostError::start_failed(grain_id, "grain not found"))?;

        if ctx.is_cancelled() {
            return Err(GrainhostError::Canceled(format!(
                "start of grain {grain_id} canceled before spawn"
            )));
        }

        let mut cmd = Command::new(&self.options.program);
        cmd.args(self.options.args_for(grain_id))
            .env("GRAIN_ID", grain_id)
            .env("GRAIN_PACKAGE_ID", &record.package_id)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        if let Ok(rust_log) = std::env::var("RUST_LOG") {
            cmd.env("RUST_LOG", rust_log);
        }
        if let Some(dir) = &self.options.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| {
            let msg = format!(
                "failed to spawn {}: {}",
                self.options.program.display(),
                e
            );
            tracing::error!(grain_id = %grain_id, "{}", msg);
            GrainhostError::start_failed(grain_id, msg)
        })?;

        let pid = child.id().ok_or_else(|| {
            GrainhostError::start_failed(grain_id, "child exited before reporting a pid")
        })?;

        let (exit_tx, exit_rx) = watch::channel(None);
        let reaped_grain = grain_id.to_string();
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status.code(),
                Err(e) => {
                    tracing::warn!(grain_id = %reaped_grain, error = %e, "Failed to wait on grain process");
                    None
                }
            };
            tracing::debug!(grain_id = %reaped_grain, pid, code = ?code, "Grain process exited");
            exit_tx.send_replace(Some(code));
        });

        tracing::info!(
            grain_id = %grain_id,
            package_id = %record.package_id,
            pid,
            "Spawned grain process"
        );

        Ok(ProcessContainer {
            grain_id: grain_id.to_string(),
            pid,
            shutdown_grace: self.options.shutdown_grace,
            exit_rx,
        })
    }
}

/// A grain running as a child process.
#[derive(Debug)]
pub struct ProcessContainer {
    grain_id: GrainId,
    pid: u32,
    shutdown_grace: Duration,
    /// `Some(code)` once the child has been reaped.
    exit_rx: watch::Receiver<Option<Option<i32>>>,
}

impl ProcessContainer {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn has_exited(&self) -> bool {
        self.exit_rx.borrow().is_some()
    }

    /// Exit code once reaped; `None` while running or when killed by a signal.
    pub fn exit_code(&self) -> Option<i32> {
        (*self.exit_rx.borrow()).flatten()
    }

    async fn wait_exit_for(&self, limit: Duration) -> bool {
        tokio::time::timeout(limit, self.wait_exit()).await.is_ok()
    }
}

#[async_trait::async_trait]
impl Container for ProcessContainer {
    async fn shutdown(&self) -> GrainhostResult<()> {
        // Never signal a pid that has already been reaped and may be reused.
        if self.has_exited() {
            return Ok(());
        }

        tracing::debug!(grain_id = %self.grain_id, pid = self.pid, "Sending SIGTERM to grain process");
        if !terminate_process(self.pid) && is_process_alive(self.pid) {
            return Err(GrainhostError::Engine(format!(
                "failed to signal grain process {}",
                self.pid
            )));
        }

        if self.wait_exit_for(self.shutdown_grace).await {
            return Ok(());
        }

        tracing::warn!(
            grain_id = %self.grain_id,
            pid = self.pid,
            grace_secs = self.shutdown_grace.as_secs(),
            "Grain process ignored SIGTERM, sending SIGKILL"
        );
        if self.has_exited() {
            return Ok(());
        }
        if !kill_process(self.pid) {
            return Err(GrainhostError::Engine(format!(
                "failed to kill grain process {}",
                self.pid
            )));
        }
        self.wait_exit().await;
        Ok(())
    }

    async fn wait_exit(&self) {
        let mut rx = self.exit_rx.clone();
        // A closed channel means the reaper task is gone; treat as exited.
        let _ = rx.wait_for(|exit| exit.is_some()).await;
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn catalog() -> HashMap<GrainId, GrainRecord> {
        let mut map = HashMap::new();
        map.insert(
            "grain-1".to_string(),
            GrainRecord {
                grain_id: "grain-1".to_string(),
                package_id: "pkg-notes".to_string(),
            },
        );
        map
    }

    fn sh(script: &str) -> ProcessStarter {
        let mut options = ProcessStarterOptions::new("/bin/sh").arg("-c").arg(script);
        options.shutdown_grace = Duration::from_secs(2);
        ProcessStarter::new(options).unwrap()
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let starter = sh("sleep 30");
        let ctx = CancellationToken::new();
        let container = starter
            .start(&ctx, &catalog(), "grain-1")
            .await
            .unwrap();

        assert!(is_process_alive(container.pid()));
        assert!(!container.has_exited());

        container.shutdown().await.unwrap();
        assert!(container.has_exited());
        // Second shutdown is a no-op.
        container.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_sigterm_ignored_escalates_to_sigkill() {
        let starter = sh("trap '' TERM; sleep 30");
        let ctx = CancellationToken::new();
        let container = starter
            .start(&ctx, &catalog(), "grain-1")
            .await
            .unwrap();

        // Give the shell a moment to install the trap.
        tokio::time::sleep(Duration::from_millis(200)).await;
        container.shutdown().await.unwrap();
        assert!(container.has_exited());
    }

    #[tokio::test]
    async fn test_wait_exit_observes_self_termination() {
        let starter = sh("exit 3");
        let ctx = CancellationToken::new();
        let container = starter
            .start(&ctx, &catalog(), "grain-1")
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), container.wait_exit())
            .await
            .unwrap();
        assert_eq!(container.exit_code(), Some(3));
    }

    #[tokio::test]
    async fn test_grain_id_and_package_passed_to_child() {
        let starter = sh(r#"[ "$GRAIN_ID" = grain-1 ] && [ "$GRAIN_PACKAGE_ID" = pkg-notes ]"#);
        let ctx = CancellationToken::new();
        let container = starter
            .start(&ctx, &catalog(), "grain-1")
            .await
            .unwrap();

        container.wait_exit().await;
        assert_eq!(container.exit_code(), Some(0));
    }

    #[tokio::test]
    async fn test_unknown_grain_is_start_failure() {
        let starter = sh("sleep 30");
        let ctx = CancellationToken::new();
        let err = starter
            .start(&ctx, &catalog(), "missing")
            .await
            .unwrap_err();

        assert!(matches!(err, GrainhostError::StartFailed { ref grain_id, .. } if grain_id == "missing"));
    }

    #[tokio::test]
    async fn test_missing_program_is_start_failure() {
        let starter =
            ProcessStarter::new(ProcessStarterOptions::new("/nonexistent/grain-runner")).unwrap();
        let ctx = CancellationToken::new();
        let err = starter
            .start(&ctx, &catalog(), "grain-1")
            .await
            .unwrap_err();

        assert!(err.to_string().contains("failed to spawn"));
    }

    #[tokio::test]
    async fn test_canceled_context_does_not_spawn() {
        let starter = sh("sleep 30");
        let ctx = CancellationToken::new();
        ctx.cancel();
        let err = starter
            .start(&ctx, &catalog(), "grain-1")
            .await
            .unwrap_err();

        assert!(err.is_canceled());
    }

    #[tokio::test]
    async fn test_registry_drops_process_that_exits_on_its_own() {
        use crate::registry::ContainerRegistry;
        use crate::runtime::options::RegistryOptions;
        use crate::runtime::types::HandleStatus;

        let registry = ContainerRegistry::new(sh("sleep 0.2"), RegistryOptions::default()).unwrap();
        let catalog = catalog();
        let ctx = CancellationToken::new();

        let lease = registry.acquire(&ctx, &catalog, "grain-1").await.unwrap();
        assert_eq!(registry.status("grain-1"), Some(HandleStatus::Running));

        tokio::time::timeout(Duration::from_secs(5), lease.wait_exit())
            .await
            .unwrap();
        // Watcher runs on its own task.
        for _ in 0..50 {
            if registry.status("grain-1").is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(registry.status("grain-1"), None);
        assert_eq!(registry.metrics().unsolicited_stops_total(), 1);
        drop(lease);

        let fresh = registry.get(&ctx, &catalog, "grain-1").await.unwrap();
        assert_eq!(registry.metrics().starts_total(), 2);
        assert_eq!(registry.shutdown_all().await.unwrap(), 1);
        assert!(fresh.has_exited());
    }
}
