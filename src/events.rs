//! Event fan-out: per-job broadcast channels pushed over WebSocket.
//!
//! Delivery is at-most-once/best-effort. Clients that miss events (lagged
//! receivers, dropped connections) re-fetch current state via the polling
//! path, which converges to the same truth independently of the fan-out.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Mutex;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Per-channel buffer; slow consumers skip ahead past this.
const CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Status,
    Progress,
    Done,
    Error,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Status => "status",
            Self::Progress => "progress",
            Self::Done => "done",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "status" => Ok(Self::Status),
            "progress" => Ok(Self::Progress),
            "done" => Ok(Self::Done),
            "error" => Ok(Self::Error),
            _ => Err(format!("Invalid event kind: {}", s)),
        }
    }
}

/// Wire frame pushed to subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub channel: String,
    pub timestamp: String,
    pub data: serde_json::Value,
}

/// Channel name for a job id.
pub fn job_channel(job_id: &str) -> String {
    format!("job:{}", job_id)
}

/// Publish/subscribe hub keyed by job id.
///
/// Channels are created lazily on first subscribe or publish and pruned
/// once the last receiver is gone. Publishing to a channel nobody listens
/// on is a no-op.
#[derive(Default)]
pub struct EventHub {
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to a job's event stream. Tenant authorization happens at
    /// the WebSocket layer before this is called.
    pub fn subscribe(&self, job_id: &str) -> broadcast::Receiver<String> {
        let mut channels = self.lock_channels();
        channels
            .entry(job_channel(job_id))
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Serialize and broadcast an event to the job's subscribers.
    pub fn publish(&self, job_id: &str, kind: EventKind, data: serde_json::Value) {
        let channel = job_channel(job_id);
        let event = JobEvent {
            kind,
            channel: channel.clone(),
            timestamp: Utc::now().to_rfc3339(),
            data,
        };
        let json = match serde_json::to_string(&event) {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!(job_id, error = %e, "Failed to serialize job event");
                return;
            }
        };

        let mut channels = self.lock_channels();
        let stale = match channels.get(&channel) {
            Some(tx) => tx.send(json).is_err() || tx.receiver_count() == 0,
            None => false,
        };
        if stale {
            // Last receiver gone; drop the channel.
            channels.remove(&channel);
        }
    }

    /// The map holds no invariants a panicked holder could have broken, so
    /// a poisoned lock is recovered rather than propagated.
    fn lock_channels(&self) -> std::sync::MutexGuard<'_, HashMap<String, broadcast::Sender<String>>> {
        self.channels.lock().unwrap_or_else(|e| e.into_inner())
    }

    #[cfg(test)]
    pub(crate) fn channel_count(&self) -> usize {
        self.lock_channels().len()
    }
}
