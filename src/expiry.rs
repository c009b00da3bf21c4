//! Deadline timers for pending alerts.
//!
//! Every alert entering `pending` gets one timer. When it fires, the alert id
//! is sent on the channel returned by [`ExpiryScheduler::new`]; the consumer
//! attempts the `pending -> expired` CAS, which is a no-op if the alert has
//! moved on. Timers are cancelled as soon as the alert leaves `pending`, so a
//! long-running service does not accumulate sleeping tasks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

struct Timer {
    generation: u64,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct Timers {
    next_generation: u64,
    by_alert: HashMap<Uuid, Timer>,
}

/// Cancellable per-alert deadline timers.
pub struct ExpiryScheduler {
    deadline: Duration,
    timers: Arc<Mutex<Timers>>,
    fired: mpsc::UnboundedSender<Uuid>,
}

impl ExpiryScheduler {
    /// Create a scheduler and the receiver on which fired alert ids arrive.
    pub fn new(deadline: Duration) -> (Self, mpsc::UnboundedReceiver<Uuid>) {
        let (fired, rx) = mpsc::unbounded_channel();
        let scheduler = Self {
            deadline,
            timers: Arc::new(Mutex::new(Timers::default())),
            fired,
        };
        (scheduler, rx)
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    /// Start the default deadline for `alert_id`.
    pub fn schedule(&self, alert_id: Uuid) {
        self.schedule_in(alert_id, self.deadline);
    }

    /// Start a timer firing after `delay`, replacing any existing one.
    pub fn schedule_in(&self, alert_id: Uuid, delay: Duration) {
        let mut timers = self.timers.lock().unwrap_or_else(|e| e.into_inner());
        timers.next_generation += 1;
        let generation = timers.next_generation;

        let registry = Arc::clone(&self.timers);
        let fired = self.fired.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut timers = registry.lock().unwrap_or_else(|e| e.into_inner());
                // A newer timer for the same alert owns the entry.
                if timers
                    .by_alert
                    .get(&alert_id)
                    .is_some_and(|t| t.generation == generation)
                {
                    timers.by_alert.remove(&alert_id);
                }
            }
            debug!(alert_id = %alert_id, "Expiry deadline reached");
            let _ = fired.send(alert_id);
        });

        if let Some(previous) = timers
            .by_alert
            .insert(alert_id, Timer { generation, handle })
        {
            previous.handle.abort();
        }
    }

    /// Cancel the timer for `alert_id`. Returns `false` if none was pending.
    pub fn cancel(&self, alert_id: Uuid) -> bool {
        let mut timers = self.timers.lock().unwrap_or_else(|e| e.into_inner());
        match timers.by_alert.remove(&alert_id) {
            Some(timer) => {
                timer.handle.abort();
                debug!(alert_id = %alert_id, "Expiry timer cancelled");
                true
            }
            None => false,
        }
    }

    pub fn is_scheduled(&self, alert_id: Uuid) -> bool {
        let timers = self.timers.lock().unwrap_or_else(|e| e.into_inner());
        timers.by_alert.contains_key(&alert_id)
    }

    /// Number of timers still waiting to fire.
    pub fn pending_count(&self) -> usize {
        self.timers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .by_alert
            .len()
    }
}

impl Drop for ExpiryScheduler {
    fn drop(&mut self) {
        let mut timers = self.timers.lock().unwrap_or_else(|e| e.into_inner());
        for (_, timer) in timers.by_alert.drain() {
            timer.handle.abort();
        }
    }
}
