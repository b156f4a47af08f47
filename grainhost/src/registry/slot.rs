//! Per-grain registry entry.
//!
//! A slot is the registry's handle on one incarnation of a grain's container.
//! Every transition is published on a `watch` channel so callers that found the
//! slot mid-transition can sleep on it without holding the registry lock.

use crate::runtime::types::{GrainInfo, HandleStatus, InstanceId};
use chrono::{DateTime, Utc};
use grainhost_shared::GrainhostError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// What waiters observe on a slot's channel.
pub(crate) enum Phase<C> {
    Starting,
    Running(Arc<C>),
    /// Start failed; every waiter receives this error.
    Failed(GrainhostError),
    /// The initiating caller was cancelled or dropped; waiters retry.
    Abandoned,
    Stopping,
    /// Slot removed from the map.
    Gone,
}

impl<C> Phase<C> {
    pub(crate) fn is_settled(&self) -> bool {
        !matches!(self, Phase::Starting | Phase::Stopping)
    }
}

/// Outcome handed back to a waiter once its slot settles.
pub(crate) enum Settled {
    /// Look the grain up again.
    Retry,
    Failed(GrainhostError),
}

/// Sleep until the slot behind `rx` leaves Starting/Stopping.
pub(crate) async fn settle<C>(rx: &mut watch::Receiver<Phase<C>>) -> Settled {
    match rx.wait_for(Phase::is_settled).await {
        Ok(phase) => match &*phase {
            Phase::Failed(e) => Settled::Failed(e.clone()),
            _ => Settled::Retry,
        },
        // Sender dropped with the slot.
        Err(_) => Settled::Retry,
    }
}

enum SlotState<C> {
    Starting,
    Running(Arc<C>),
    Stopping,
}

pub(crate) struct Slot<C> {
    instance_id: InstanceId,
    state: SlotState<C>,
    in_use: usize,
    last_active: Instant,
    last_active_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    phase_tx: watch::Sender<Phase<C>>,
}

impl<C> Slot<C> {
    /// Placeholder installed before the start operation runs.
    pub(crate) fn starting() -> Self {
        let (phase_tx, _) = watch::channel(Phase::Starting);
        Self {
            instance_id: InstanceId::new(),
            state: SlotState::Starting,
            in_use: 0,
            last_active: Instant::now(),
            last_active_at: Utc::now(),
            started_at: None,
            phase_tx,
        }
    }

    pub(crate) fn instance_id(&self) -> InstanceId {
        self.instance_id
    }

    pub(crate) fn status(&self) -> HandleStatus {
        match self.state {
            SlotState::Starting => HandleStatus::Starting,
            SlotState::Running(_) => HandleStatus::Running,
            SlotState::Stopping => HandleStatus::Stopping,
        }
    }

    pub(crate) fn in_use(&self) -> usize {
        self.in_use
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<Phase<C>> {
        self.phase_tx.subscribe()
    }

    fn touch(&mut self) {
        self.last_active = Instant::now();
        self.last_active_at = Utc::now();
    }

    /// Hand the running container to one more caller.
    pub(crate) fn acquire(&mut self) -> Option<Arc<C>> {
        let SlotState::Running(container) = &self.state else {
            return None;
        };
        let container = Arc::clone(container);
        self.in_use += 1;
        self.touch();
        Some(container)
    }

    pub(crate) fn release(&mut self) {
        self.in_use = self.in_use.saturating_sub(1);
        self.touch();
    }

    /// Starting → Running. The initiating caller holds the first use.
    pub(crate) fn mark_running(&mut self, container: Arc<C>) {
        self.state = SlotState::Running(Arc::clone(&container));
        self.in_use = 1;
        self.started_at = Some(Utc::now());
        self.touch();
        self.phase_tx.send_replace(Phase::Running(container));
    }

    /// Running → Stopping. Returns the container so the caller can shut it down.
    pub(crate) fn mark_stopping(&mut self) -> Option<Arc<C>> {
        let SlotState::Running(container) = &self.state else {
            return None;
        };
        let container = Arc::clone(container);
        self.state = SlotState::Stopping;
        self.phase_tx.send_replace(Phase::Stopping);
        Some(container)
    }

    /// Stopping → Running after a shutdown that did not go through.
    ///
    /// Use count and activity clocks are left as they were.
    pub(crate) fn restore_running(&mut self, container: Arc<C>) -> bool {
        if !matches!(self.state, SlotState::Stopping) {
            return false;
        }
        self.state = SlotState::Running(Arc::clone(&container));
        self.phase_tx.send_replace(Phase::Running(container));
        true
    }

    pub(crate) fn is_evictable(&self, idle_timeout: Duration) -> bool {
        matches!(self.state, SlotState::Running(_))
            && self.in_use == 0
            && self.last_active.elapsed() >= idle_timeout
    }

    /// Final notification before the slot is dropped from the map.
    pub(crate) fn close(self, phase: Phase<C>) {
        self.phase_tx.send_replace(phase);
    }

    pub(crate) fn info(&self, grain_id: &str) -> GrainInfo {
        GrainInfo {
            grain_id: grain_id.to_string(),
            instance_id: self.instance_id,
            status: self.status(),
            in_use: self.in_use,
            started_at: self.started_at,
            last_active_at: self.last_active_at,
        }
    }
}
