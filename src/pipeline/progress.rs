//! Per-run fan-out of progress updates.
//!
//! Each run gets its own `broadcast` channel carrying serialized
//! [`WsMessage`](super::ws::WsMessage) frames. Every subscriber receives an
//! independent copy; closing the channel ends every subscription once the
//! already-published frames are drained.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use tokio::sync::broadcast;

use super::models::RunId;
use super::ws::WsMessage;

pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

pub struct ProgressHub {
    channels: Mutex<HashMap<RunId, broadcast::Sender<String>>>,
    capacity: usize,
}

impl Default for ProgressHub {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

impl ProgressHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    fn channels(&self) -> std::sync::MutexGuard<'_, HashMap<RunId, broadcast::Sender<String>>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create the run's channel. Idempotent.
    pub fn open(&self, run_id: RunId) {
        self.channels()
            .entry(run_id)
            .or_insert_with(|| broadcast::channel(self.capacity).0);
    }

    /// Subscribe to a live run. `None` once the run's channel is closed.
    pub fn subscribe(&self, run_id: RunId) -> Option<broadcast::Receiver<String>> {
        self.channels().get(&run_id).map(broadcast::Sender::subscribe)
    }

    pub fn is_open(&self, run_id: RunId) -> bool {
        self.channels().contains_key(&run_id)
    }

    /// Publish to every current subscriber; returns how many received it.
    /// Publishing with no subscribers (or to a closed run) is not an error.
    pub fn publish(&self, run_id: RunId, msg: &WsMessage) -> usize {
        let Some(tx) = self.channels().get(&run_id).cloned() else {
            return 0;
        };
        match serde_json::to_string(msg) {
            Ok(json) => tx.send(json).unwrap_or(0),
            Err(e) => {
                tracing::error!(run_id = %run_id, error = %e, "Failed to serialize progress message");
                0
            }
        }
    }

    /// Drop the run's channel; subscribers see the stream end after draining.
    pub fn close(&self, run_id: RunId) {
        self.channels().remove(&run_id);
    }

    pub fn open_channels(&self) -> usize {
        self.channels().len()
    }
}
