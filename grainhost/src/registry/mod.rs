//! Grain container registry.
//!
//! Maps a grain id to at most one live container and arbitrates its existence:
//! starting it on first use, handing it out to concurrent callers, evicting it
//! once idle, and dropping it when it exits on its own.
//!
//! ## Locking
//!
//! One `parking_lot::Mutex` guards the map and is only held for short, synchronous
//! edits. Starts and shutdowns are slow and run outside the lock. A `Starting`
//! placeholder is inserted before the lock is released, so at most one caller
//! starts a given grain; everyone else subscribes to the placeholder's watch
//! channel and sleeps until it settles. Waiting is per grain and never blocks
//! unrelated grains.
//!
//! ## Cancellation
//!
//! A waiter whose token fires returns `Canceled` and leaves the slot alone. The
//! caller that performs a start owns the placeholder through `StartGuard`: if the
//! start fails, is cancelled, or the future is dropped, the guard removes the
//! placeholder and wakes the waiters. Shutdowns run on a detached task so they
//! always finish, even if the caller that requested them goes away.

mod lease;
mod reaper;
mod slot;

pub use lease::ContainerLease;

use crate::container::{Container, ContainerStarter};
use crate::metrics::{RegistryMetrics, RegistryMetricsStorage};
use crate::runtime::options::RegistryOptions;
use crate::runtime::types::{GrainId, GrainInfo, HandleStatus, InstanceId};
use futures::future::join_all;
use grainhost_shared::{GrainhostError, GrainhostResult};
use parking_lot::Mutex;
use slot::{Phase, Settled, Slot, settle};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Thread-safe registry of running grain containers.
///
/// Cheap to clone; all clones share the same map.
pub struct ContainerRegistry<S: ContainerStarter> {
    inner: Arc<RegistryInner<S>>,
}

pub(crate) struct RegistryInner<S: ContainerStarter> {
    starter: S,
    options: RegistryOptions,
    slots: Mutex<HashMap<GrainId, Slot<S::Container>>>,
    metrics: RegistryMetricsStorage,
}

/// Result of looking a grain up under the map lock.
enum Lookup<C> {
    Ready(Arc<C>, InstanceId),
    Wait(watch::Receiver<Phase<C>>),
    Reserved(InstanceId),
}

impl<S: ContainerStarter> Clone for ContainerRegistry<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: ContainerStarter> std::fmt::Debug for ContainerRegistry<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerRegistry")
            .field("grains", &self.len())
            .field("options", &self.inner.options)
            .finish()
    }
}

impl<S: ContainerStarter> ContainerRegistry<S> {
    /// Create an empty registry around the given start operation.
    pub fn new(starter: S, options: RegistryOptions) -> GrainhostResult<Self> {
        options.sanitize()?;
        Ok(Self {
            inner: Arc::new(RegistryInner {
                starter,
                options,
                slots: Mutex::new(HashMap::new()),
                metrics: RegistryMetricsStorage::new(),
            }),
        })
    }

    pub fn options(&self) -> &RegistryOptions {
        &self.inner.options
    }

    /// Get the live container for a grain, starting it if needed.
    ///
    /// Each successful call counts as one use; pair it with [`release`](Self::release)
    /// (or use [`acquire`](Self::acquire)) so the container can be evicted later.
    ///
    /// # Errors
    ///
    /// - `StartFailed` if the start this call issued or waited on failed
    /// - `Canceled` if `ctx` fired while waiting or starting
    /// - `InvalidArgument` for an empty grain id
    pub async fn get(
        &self,
        ctx: &CancellationToken,
        db: &S::Database,
        grain_id: &str,
    ) -> GrainhostResult<Arc<S::Container>> {
        self.checkout(ctx, db, grain_id)
            .await
            .map(|(container, _)| container)
    }

    /// Like [`get`](Self::get), but the use is released when the lease drops.
    pub async fn acquire(
        &self,
        ctx: &CancellationToken,
        db: &S::Database,
        grain_id: &str,
    ) -> GrainhostResult<ContainerLease<S>> {
        let (container, instance_id) = self.checkout(ctx, db, grain_id).await?;
        Ok(ContainerLease::new(
            Arc::clone(&self.inner),
            grain_id.to_string(),
            instance_id,
            container,
        ))
    }

    /// Drop one use of a grain's container.
    ///
    /// Returns `false` if the grain has no handle, which is harmless: it was
    /// most likely evicted or stopped in the meantime.
    pub fn release(&self, grain_id: &str) -> bool {
        let mut slots = self.inner.slots.lock();
        match slots.get_mut(grain_id) {
            Some(slot) => {
                slot.release();
                tracing::trace!(grain_id, in_use = slot.in_use(), "Released grain container");
                true
            }
            None => {
                tracing::debug!(grain_id, "Release for unknown grain ignored");
                false
            }
        }
    }

    /// Evict a grain's container if it is running, unused, and idle long enough.
    ///
    /// Returns whether the container was evicted. When the shutdown fails or
    /// times out the handle goes back to `Running` and the error is returned.
    pub async fn evict(&self, grain_id: &str) -> GrainhostResult<bool> {
        let (instance_id, container) = {
            let mut slots = self.inner.slots.lock();
            let Some(slot) = slots.get_mut(grain_id) else {
                return Ok(false);
            };
            if !slot.is_evictable(self.inner.options.idle_timeout) {
                tracing::trace!(
                    grain_id,
                    status = ?slot.status(),
                    in_use = slot.in_use(),
                    "Grain not eligible for eviction"
                );
                return Ok(false);
            }
            let Some(container) = slot.mark_stopping() else {
                return Ok(false);
            };
            (slot.instance_id(), container)
        };

        tracing::info!(grain_id, instance = %instance_id.short(), "Evicting idle grain container");
        self.stop_detached(grain_id, instance_id, container).await?;
        RegistryMetricsStorage::incr(&self.inner.metrics.evictions);
        Ok(true)
    }

    /// Evict every container that is currently eligible.
    ///
    /// Shutdown errors are logged; those grains stay running and are retried on
    /// the next pass.
    pub async fn evict_idle(&self) -> Vec<GrainId> {
        let candidates: Vec<GrainId> = {
            let slots = self.inner.slots.lock();
            slots
                .iter()
                .filter(|(_, slot)| slot.is_evictable(self.inner.options.idle_timeout))
                .map(|(id, _)| id.clone())
                .collect()
        };
        if candidates.is_empty() {
            return Vec::new();
        }

        let results = join_all(candidates.iter().map(|id| self.evict(id))).await;

        let mut evicted = Vec::new();
        for (id, result) in candidates.into_iter().zip(results) {
            match result {
                Ok(true) => evicted.push(id),
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(grain_id = %id, error = %e, "Failed to evict grain container");
                }
            }
        }
        evicted
    }

    /// Record that a grain's container terminated without the registry asking.
    ///
    /// The handle is dropped so the next `get` starts a fresh container. A start
    /// still in flight is never affected. Returns whether a handle was removed.
    pub fn notify_stopped(&self, grain_id: &str) -> bool {
        self.inner.remove_stopped(grain_id, None)
    }

    /// Shut down every running container, in use or not.
    ///
    /// Starts still in flight are left to complete. Containers that fail to
    /// shut down stay registered as running. Returns how many containers shut
    /// down cleanly, or the first error once all were attempted.
    pub async fn shutdown_all(&self) -> GrainhostResult<usize> {
        let stopping: Vec<(GrainId, InstanceId, Arc<S::Container>)> = {
            let mut slots = self.inner.slots.lock();
            slots
                .iter_mut()
                .filter_map(|(id, slot)| {
                    slot.mark_stopping()
                        .map(|container| (id.clone(), slot.instance_id(), container))
                })
                .collect()
        };

        tracing::info!(count = stopping.len(), "Shutting down all grain containers");

        let results = join_all(stopping.into_iter().map(|(id, instance_id, container)| async move {
            let result = self.stop_detached(&id, instance_id, container).await;
            (id, result)
        }))
        .await;

        let mut stopped = 0;
        let mut first_err = None;
        for (id, result) in results {
            match result {
                Ok(()) => stopped += 1,
                Err(e) => {
                    tracing::warn!(grain_id = %id, error = %e, "Grain container failed to shut down");
                    first_err.get_or_insert(e);
                }
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(stopped),
        }
    }

    /// Current status of a grain's handle, `None` if it has none.
    pub fn status(&self, grain_id: &str) -> Option<HandleStatus> {
        self.inner.slots.lock().get(grain_id).map(Slot::status)
    }

    pub fn get_info(&self, grain_id: &str) -> Option<GrainInfo> {
        self.inner
            .slots
            .lock()
            .get(grain_id)
            .map(|slot| slot.info(grain_id))
    }

    /// Snapshot of all handles, most recently active first.
    pub fn list(&self) -> Vec<GrainInfo> {
        let mut infos: Vec<GrainInfo> = {
            let slots = self.inner.slots.lock();
            slots.iter().map(|(id, slot)| slot.info(id)).collect()
        };
        infos.sort_by(|a, b| b.last_active_at.cmp(&a.last_active_at));
        infos
    }

    pub fn len(&self) -> usize {
        self.inner.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn metrics(&self) -> RegistryMetrics {
        RegistryMetrics::new(self.inner.metrics.clone())
    }

    // ========================================================================
    // INTERNAL HELPERS
    // ========================================================================

    async fn checkout(
        &self,
        ctx: &CancellationToken,
        db: &S::Database,
        grain_id: &str,
    ) -> GrainhostResult<(Arc<S::Container>, InstanceId)> {
        if grain_id.is_empty() {
            return Err(GrainhostError::InvalidArgument(
                "grain id must not be empty".into(),
            ));
        }

        loop {
            let mut rx = match self.inner.lookup_or_reserve(grain_id) {
                Lookup::Ready(container, instance_id) => return Ok((container, instance_id)),
                Lookup::Reserved(instance_id) => {
                    let container = self.start(ctx, db, grain_id, instance_id).await?;
                    return Ok((container, instance_id));
                }
                Lookup::Wait(rx) => rx,
            };

            tracing::trace!(grain_id, "Waiting for in-flight transition");
            let settled = tokio::select! {
                biased;
                _ = ctx.cancelled() => {
                    return Err(GrainhostError::Canceled(format!(
                        "wait for grain {grain_id} canceled"
                    )));
                }
                settled = settle(&mut rx) => settled,
            };

            if let Settled::Failed(e) = settled {
                return Err(e);
            }
        }
    }

    /// Run the start operation for a reserved placeholder.
    async fn start(
        &self,
        ctx: &CancellationToken,
        db: &S::Database,
        grain_id: &str,
        instance_id: InstanceId,
    ) -> GrainhostResult<Arc<S::Container>> {
        let guard = StartGuard {
            inner: &self.inner,
            grain_id,
            instance_id,
            armed: true,
        };

        RegistryMetricsStorage::incr(&self.inner.metrics.starts);
        tracing::info!(grain_id, instance = %instance_id.short(), "Starting grain container");
        let started = Instant::now();

        match self.inner.starter.start(ctx, db, grain_id).await {
            Ok(container) => {
                let container = Arc::new(container);
                if !guard.complete(Arc::clone(&container)) {
                    tracing::error!(grain_id, "Start slot vanished before completion, shutting container down");
                    tokio::spawn(async move {
                        if let Err(e) = container.shutdown().await {
                            tracing::warn!(error = %e, "Failed to shut down orphaned container");
                        }
                    });
                    return Err(GrainhostError::Internal(format!(
                        "slot for grain {grain_id} vanished during start"
                    )));
                }

                tracing::info!(
                    grain_id,
                    instance = %instance_id.short(),
                    duration_ms = started.elapsed().as_millis() as u64,
                    "Grain container running"
                );
                self.spawn_watcher(grain_id, instance_id, Arc::clone(&container));
                Ok(container)
            }
            Err(e) => {
                RegistryMetricsStorage::incr(&self.inner.metrics.start_failures);
                tracing::warn!(grain_id, error = %e, "Grain container failed to start");
                guard.fail(e.clone());
                Err(e)
            }
        }
    }

    /// Watch one container instance and drop its handle when it exits.
    fn spawn_watcher(&self, grain_id: &str, instance_id: InstanceId, container: Arc<S::Container>) {
        let registry = Arc::downgrade(&self.inner);
        let grain_id = grain_id.to_string();
        tokio::spawn(async move {
            container.wait_exit().await;
            drop(container);
            if let Some(inner) = registry.upgrade() {
                inner.remove_stopped(&grain_id, Some(instance_id));
            }
        });
    }

    /// Shut a Stopping container down on a detached task and wait for it.
    async fn stop_detached(
        &self,
        grain_id: &str,
        instance_id: InstanceId,
        container: Arc<S::Container>,
    ) -> GrainhostResult<()> {
        let inner = Arc::clone(&self.inner);
        let grain = grain_id.to_string();
        let task = tokio::spawn(async move { inner.stop_container(&grain, instance_id, container).await });
        task.await.map_err(|e| {
            GrainhostError::Internal(format!("stop task for grain {grain_id} failed: {e}"))
        })?
    }
}

impl<S: ContainerStarter> RegistryInner<S> {
    fn lookup_or_reserve(&self, grain_id: &str) -> Lookup<S::Container> {
        let mut slots = self.slots.lock();

        if let Some(slot) = slots.get_mut(grain_id) {
            if let Some(container) = slot.acquire() {
                RegistryMetricsStorage::incr(&self.metrics.hits);
                tracing::trace!(grain_id, in_use = slot.in_use(), "Reusing running grain container");
                return Lookup::Ready(container, slot.instance_id());
            }
            debug_assert!(slot.status().is_transitional());
            return Lookup::Wait(slot.subscribe());
        }

        let slot = Slot::starting();
        let instance_id = slot.instance_id();
        tracing::debug!(grain_id, instance = %instance_id.short(), "Reserved slot for new start");
        slots.insert(grain_id.to_string(), slot);
        Lookup::Reserved(instance_id)
    }

    fn mark_started(
        &self,
        grain_id: &str,
        instance_id: InstanceId,
        container: Arc<S::Container>,
    ) -> bool {
        let mut slots = self.slots.lock();
        match slots.get_mut(grain_id) {
            Some(slot)
                if slot.instance_id() == instance_id && slot.status() == HandleStatus::Starting =>
            {
                slot.mark_running(container);
                true
            }
            _ => false,
        }
    }

    fn abort_start(&self, grain_id: &str, instance_id: InstanceId, phase: Phase<S::Container>) {
        let mut slots = self.slots.lock();
        let owned = slots.get(grain_id).is_some_and(|slot| {
            slot.instance_id() == instance_id && slot.status() == HandleStatus::Starting
        });
        if owned {
            if let Some(slot) = slots.remove(grain_id) {
                tracing::debug!(grain_id, instance = %instance_id.short(), "Removed start placeholder");
                slot.close(phase);
            }
        }
    }

    /// Drop one use held by a lease, ignoring leases from an older instance.
    pub(crate) fn release_instance(&self, grain_id: &str, instance_id: InstanceId) {
        let mut slots = self.slots.lock();
        match slots.get_mut(grain_id) {
            Some(slot) if slot.instance_id() == instance_id => {
                slot.release();
                tracing::trace!(grain_id, in_use = slot.in_use(), "Lease released");
            }
            _ => tracing::trace!(grain_id, "Lease outlived its container instance"),
        }
    }

    /// Stopped → removed, for a Running or Stopping handle.
    ///
    /// With `instance_id` set, only that incarnation is removed.
    fn remove_stopped(&self, grain_id: &str, instance_id: Option<InstanceId>) -> bool {
        let mut slots = self.slots.lock();
        let Some(slot) = slots.get(grain_id) else {
            return false;
        };
        if instance_id.is_some_and(|id| id != slot.instance_id()) {
            tracing::trace!(grain_id, "Ignoring exit of a stale container instance");
            return false;
        }

        let status = slot.status();
        if !status.can_stop() {
            tracing::debug!(grain_id, status = ?status, "Ignoring stop notification while start is in flight");
            return false;
        }
        if status == HandleStatus::Running {
            RegistryMetricsStorage::incr(&self.metrics.unsolicited_stops);
            tracing::warn!(
                grain_id,
                instance = %slot.instance_id().short(),
                in_use = slot.in_use(),
                "Grain container stopped on its own"
            );
        } else {
            tracing::debug!(grain_id, "Grain container stopped");
        }

        if let Some(slot) = slots.remove(grain_id) {
            slot.close(Phase::Gone);
        }
        true
    }

    async fn stop_container(
        &self,
        grain_id: &str,
        instance_id: InstanceId,
        container: Arc<S::Container>,
    ) -> GrainhostResult<()> {
        let timeout = self.options.shutdown_timeout;
        let result = match tokio::time::timeout(timeout, container.shutdown()).await {
            Ok(result) => result,
            Err(_) => Err(GrainhostError::Engine(format!(
                "shutdown of grain {grain_id} timed out after {}s",
                timeout.as_secs()
            ))),
        };

        match &result {
            Ok(()) => {
                self.remove_stopped(grain_id, Some(instance_id));
            }
            Err(e) => {
                // Not confirmed gone; keep the handle so no second instance can start.
                if self.restore_running(grain_id, instance_id, container) {
                    tracing::warn!(grain_id, error = %e, "Grain container did not shut down, kept running");
                }
            }
        }
        result
    }

    /// Stopping → Running for the given instance, if it is still in the map.
    fn restore_running(
        &self,
        grain_id: &str,
        instance_id: InstanceId,
        container: Arc<S::Container>,
    ) -> bool {
        let mut slots = self.slots.lock();
        match slots.get_mut(grain_id) {
            Some(slot) if slot.instance_id() == instance_id => slot.restore_running(container),
            _ => false,
        }
    }
}

/// Owns a `Starting` placeholder until the start resolves.
///
/// Dropping it unresolved (cancelled future, panic) removes the placeholder
/// and tells waiters to retry.
struct StartGuard<'a, S: ContainerStarter> {
    inner: &'a RegistryInner<S>,
    grain_id: &'a str,
    instance_id: InstanceId,
    armed: bool,
}

impl<S: ContainerStarter> StartGuard<'_, S> {
    /// Starting → Running. Returns `false` if the placeholder is gone.
    fn complete(mut self, container: Arc<S::Container>) -> bool {
        self.armed = false;
        self.inner
            .mark_started(self.grain_id, self.instance_id, container)
    }

    fn fail(mut self, error: GrainhostError) {
        self.armed = false;
        // A cancelled initiator is not a verdict on the grain; let a waiter retry.
        let phase = if error.is_canceled() {
            Phase::Abandoned
        } else {
            Phase::Failed(error)
        };
        self.inner.abort_start(self.grain_id, self.instance_id, phase);
    }
}

impl<S: ContainerStarter> Drop for StartGuard<'_, S> {
    fn drop(&mut self) {
        if self.armed {
            tracing::debug!(grain_id = self.grain_id, "Start abandoned before completion");
            self.inner
                .abort_start(self.grain_id, self.instance_id, Phase::Abandoned);
        }
    }
}
