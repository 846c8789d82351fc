use crate::models::{Folder, Message};
use chrono::{DateTime, Utc};
use tokio::task::AbortHandle;

/// A delete that can still be reverted.
#[derive(Debug, Clone)]
pub struct UndoRecord {
    /// The message as it looked in its folder before deletion.
    pub snapshot: Message,
    /// Id of the copy now sitting in deleted items.
    pub trashed_id: String,
    pub origin: Folder,
    pub deleted_at: DateTime<Utc>,
}

impl UndoRecord {
    /// Returns a human-readable description for status messages
    pub fn description(&self) -> String {
        format!("Deleted \"{}\"", self.snapshot.subject_or_default())
    }
}

/// Holds at most one live record together with its expiry timer.
///
/// Every arm bumps a generation; the timer only clears the record it was
/// started for, so an explicit restore/dismiss and the timeout can race
/// without harm.
#[derive(Debug, Default)]
pub struct UndoSlot {
    record: Option<UndoRecord>,
    timer: Option<AbortHandle>,
    generation: u64,
}

impl UndoSlot {
    /// Replaces any live record, cancelling its timer. Returns the
    /// generation the new timer must present to `expire`.
    pub fn arm(&mut self, record: UndoRecord) -> u64 {
        self.cancel_timer();
        self.generation += 1;
        self.record = Some(record);
        self.generation
    }

    pub fn attach_timer(&mut self, generation: u64, timer: AbortHandle) {
        if generation == self.generation && self.record.is_some() {
            self.timer = Some(timer);
        } else {
            timer.abort();
        }
    }

    /// Removes the live record for restore; the timer is cancelled first.
    pub fn take(&mut self) -> Option<UndoRecord> {
        self.cancel_timer();
        self.record.take()
    }

    /// Timer callback. A no-op unless `generation` is still current.
    pub fn expire(&mut self, generation: u64) -> bool {
        if generation != self.generation || self.record.is_none() {
            return false;
        }
        self.timer = None;
        self.record = None;
        true
    }

    pub fn current(&self) -> Option<&UndoRecord> {
        self.record.as_ref()
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

impl Drop for UndoSlot {
    fn drop(&mut self) {
        self.cancel_timer();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str) -> UndoRecord {
        UndoRecord {
            snapshot: Message {
                id: id.to_string(),
                ..Default::default()
            },
            trashed_id: format!("{}-trash", id),
            origin: Folder::Inbox,
            deleted_at: Utc::now(),
        }
    }

    #[test]
    fn test_new_arm_supersedes_previous() {
        let mut slot = UndoSlot::default();
        let first = slot.arm(record("a"));
        let second = slot.arm(record("b"));
        assert_ne!(first, second);
        assert!(!slot.expire(first), "stale timer must not clear the new record");
        assert_eq!(slot.current().unwrap().snapshot.id, "b");
        assert!(slot.expire(second));
        assert!(slot.current().is_none());
    }

    #[test]
    fn test_take_then_expire_is_noop() {
        let mut slot = UndoSlot::default();
        let generation = slot.arm(record("a"));
        assert!(slot.take().is_some());
        assert!(slot.take().is_none());
        assert!(!slot.expire(generation));
    }

    #[test]
    fn test_description_uses_subject_placeholder() {
        assert_eq!(record("a").description(), "Deleted \"(No Subject)\"");
    }
}
