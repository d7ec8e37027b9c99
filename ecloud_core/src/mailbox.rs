//! Single-slot trigger mailbox.
//!
//! Decouples whatever decides *when* to advance (the simulator, a test, a
//! wall-clock driver) from the orchestrator loop that executes a tick. The
//! slot holds at most one trigger: offering a second one before the first
//! was taken is a backpressure violation and fails fast.

use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;

use crate::error::EcloudError;
use crate::protocol::Trigger;

#[derive(Debug, Default)]
struct Slot {
    trigger: Option<Trigger>,
    closed: bool,
}

/// Single-producer, single-consumer hand-off with capacity one.
#[derive(Debug, Default)]
pub struct TriggerMailbox {
    slot: Mutex<Slot>,
    notify: Notify,
}

impl TriggerMailbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an Arc-wrapped mailbox for sharing between producer and loop.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        // Slot is plain data, recover from poisoning
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Offers a trigger.
    ///
    /// # Errors
    /// * `MailboxFull` - the previous trigger has not been consumed yet
    /// * `OrchestratorClosed` - the consumer has shut down
    pub fn offer(&self, trigger: Trigger) -> Result<(), EcloudError> {
        {
            let mut slot = self.lock();
            if slot.closed {
                return Err(EcloudError::OrchestratorClosed);
            }
            if slot.trigger.is_some() {
                return Err(EcloudError::MailboxFull);
            }
            slot.trigger = Some(trigger);
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Waits for a trigger and empties the slot.
    ///
    /// Returns `None` once the mailbox is closed. Cancel-safe: dropping the
    /// future never loses a trigger.
    pub async fn take(&self) -> Option<Trigger> {
        loop {
            if let Some(result) = self.poll_slot() {
                return result;
            }
            self.notify.notified().await;
        }
    }

    /// Non-blocking variant of [`take`](Self::take).
    pub fn try_take(&self) -> Option<Trigger> {
        self.lock().trigger.take()
    }

    fn poll_slot(&self) -> Option<Option<Trigger>> {
        let mut slot = self.lock();
        if let Some(trigger) = slot.trigger.take() {
            return Some(Some(trigger));
        }
        if slot.closed {
            return Some(None);
        }
        None
    }

    /// Returns true if a trigger is waiting.
    pub fn is_occupied(&self) -> bool {
        self.lock().trigger.is_some()
    }

    /// Closes the mailbox, discarding any pending trigger and waking the consumer.
    pub fn close(&self) {
        {
            let mut slot = self.lock();
            slot.closed = true;
            slot.trigger = None;
        }
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}
