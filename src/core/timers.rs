// src/core/timers.rs

//! Per-attribute dampening timers (component B, spec.md §4.2).
//!
//! A timer conceptually belongs to an attribute, but per spec.md §9's design
//! note it is expressed as an opaque `(name, generation)` pair rather than
//! holding a reference to the attribute: on fire, the owning event loop looks
//! the attribute up by name and compares generations to detect staleness.

use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Sent back into the event loop when a previously started timer elapses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerFired {
    pub name: String,
    pub generation: u64,
    pub is_backoff: bool,
}

/// The failure-backoff retry period installed when a CDB write fails for an
/// attribute with no configured dampening (spec.md §4.2).
pub const FAILURE_BACKOFF: Duration = Duration::from_secs(2);

/// Owns the set of currently-running per-attribute timers and fires
/// [`TimerFired`] events back to the caller's channel. Lives entirely on the
/// event-loop task; nothing here is shared across tasks except the channel.
pub struct TimerDriver {
    tx: mpsc::Sender<TimerFired>,
    handles: HashMap<String, JoinHandle<()>>,
}

impl TimerDriver {
    pub fn new(tx: mpsc::Sender<TimerFired>) -> Self {
        Self {
            tx,
            handles: HashMap::new(),
        }
    }

    /// Starts (replacing any existing) timer for `name`, firing after
    /// `duration` with the given `generation`/`is_backoff` tag.
    pub fn start(&mut self, name: &str, duration: Duration, generation: u64, is_backoff: bool) {
        self.cancel(name);
        let tx = self.tx.clone();
        let fired = TimerFired {
            name: name.to_string(),
            generation,
            is_backoff,
        };
        let handle = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            let _ = tx.send(fired).await;
        });
        self.handles.insert(name.to_string(), handle);
    }

    /// Cancels the running timer for `name`, if any. Idempotent.
    pub fn cancel(&mut self, name: &str) {
        if let Some(handle) = self.handles.remove(name) {
            handle.abort();
        }
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.handles.contains_key(name)
    }
}
