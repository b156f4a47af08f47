//! Public data types shared by the registry and its callers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Opaque grain identifier supplied by callers.
pub type GrainId = String;

/// Identifies one incarnation of a grain's container.
///
/// A grain may be started many times over its life; each start gets a fresh
/// ULID so exit notifications from an older incarnation can be told apart
/// from the current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceId(Ulid);

impl InstanceId {
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Short form for log lines (last 8 chars of the ULID, the random part).
    pub fn short(&self) -> String {
        let s = self.0.to_string();
        s[s.len() - 8..].to_string()
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Lifecycle status of a grain's container handle.
///
/// ```text
/// Starting ──→ Running ⇄ Stopping ──→ Stopped (removed)
///    │            │     (failed stop)        ▲
///    │            └──────────────────────────┤  unsolicited exit
///    └──→ (removed) on start failure         │
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandleStatus {
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl HandleStatus {
    /// Callers arriving in this state must wait rather than use or start.
    pub fn is_transitional(&self) -> bool {
        matches!(self, HandleStatus::Starting | HandleStatus::Stopping)
    }

    /// Eviction and unsolicited-exit handling never touch a start in flight.
    pub fn can_stop(&self) -> bool {
        matches!(self, HandleStatus::Running | HandleStatus::Stopping)
    }
}

/// Point-in-time snapshot of one handle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrainInfo {
    pub grain_id: GrainId,
    pub instance_id: InstanceId,
    pub status: HandleStatus,
    pub in_use: usize,
    pub started_at: Option<DateTime<Utc>>,
    pub last_active_at: DateTime<Utc>,
}
