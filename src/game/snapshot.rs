//! Snapshot framing - each outbound message is serialized once and shared

use std::sync::Arc;

use serde::Serialize;
use tracing::error;

use crate::ws::protocol::ServerMsg;

use super::world::WorldState;

/// Serialized outbound message, shared by every recipient
pub type Frame = Arc<str>;

/// Wire shape of the per-tick `{type:"state", state}` push
#[derive(Serialize)]
struct StateFrame<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    state: &'a WorldState,
}

/// Builds frames for network transmission
#[derive(Debug, Default)]
pub struct SnapshotBuilder {
    stats: SnapshotStats,
}

impl SnapshotBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Full world snapshot; no delta encoding
    pub fn state_frame(&mut self, world: &WorldState) -> Option<Frame> {
        let frame = StateFrame {
            kind: "state",
            state: world,
        };
        match serde_json::to_string(&frame) {
            Ok(json) => {
                self.stats.record(world.objects.len(), json.len());
                Some(Arc::from(json))
            }
            Err(e) => {
                error!(map = %world.meta.name, error = %e, "Failed to serialize snapshot");
                None
            }
        }
    }

    pub fn stats(&self) -> &SnapshotStats {
        &self.stats
    }
}

/// Serialize a control message once for fan-out
pub fn message_frame(msg: &ServerMsg) -> Option<Frame> {
    match serde_json::to_string(msg) {
        Ok(json) => Some(Arc::from(json)),
        Err(e) => {
            error!(error = %e, "Failed to serialize server message");
            None
        }
    }
}

/// Snapshot size stats for debugging
#[derive(Debug, Default, Clone)]
pub struct SnapshotStats {
    pub total_snapshots: u64,
    pub total_bytes: u64,
    pub avg_objects_per_snapshot: f32,
}

impl SnapshotStats {
    pub fn record(&mut self, object_count: usize, bytes: usize) {
        self.total_snapshots += 1;
        self.total_bytes += bytes as u64;

        // Running average
        let n = self.total_snapshots as f32;
        self.avg_objects_per_snapshot =
            self.avg_objects_per_snapshot * ((n - 1.0) / n) + (object_count as f32 / n);
    }
}
