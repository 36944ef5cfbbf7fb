use crate::core::{BackupError, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Stage of a collection's backup state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Idle,
    Capturing,
    Compressing,
    Uploading,
    Recording,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SlotStatus {
    pub phase: Phase,
    pub next_due: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    /// Set by a fatal backend error; cleared by an operator resume.
    pub suspended: Option<String>,
}

pub(crate) enum Admission {
    NotDue(DateTime<Utc>),
    Busy,
    Suspended,
    /// The slot left `Idle`; the guard returns it there when dropped.
    Started {
        guard: PhaseGuard,
        due_at: DateTime<Utc>,
    },
}

/// Per-collection state for one manager.
#[derive(Debug, Default)]
pub(crate) struct SlotTable {
    slots: Mutex<HashMap<String, SlotStatus>>,
}

impl SlotTable {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn status(&self, collection: &str) -> Result<SlotStatus> {
        let slots = self.slots.lock()?;
        Ok(slots.get(collection).cloned().unwrap_or_default())
    }

    pub(crate) fn needs_schedule(&self, collection: &str) -> Result<bool> {
        let slots = self.slots.lock()?;
        Ok(slots.get(collection).is_none_or(|slot| slot.next_due.is_none()))
    }

    pub(crate) fn set_next_due(&self, collection: &str, next_due: DateTime<Utc>) -> Result<()> {
        let mut slots = self.slots.lock()?;
        slots.entry(collection.to_string()).or_default().next_due = Some(next_due);
        Ok(())
    }

    /// Moves the slot out of `Idle` when it is due (or `force` is set), not
    /// already in flight, and not suspended.
    pub(crate) fn try_begin(
        self: &Arc<Self>,
        collection: &str,
        now: DateTime<Utc>,
        force: bool,
    ) -> Result<Admission> {
        let mut slots = self.slots.lock()?;
        let slot = slots.entry(collection.to_string()).or_default();

        if slot.suspended.is_some() {
            return Ok(Admission::Suspended);
        }
        if slot.phase != Phase::Idle {
            return Ok(Admission::Busy);
        }
        let due_at = match slot.next_due {
            Some(next_due) if !force && now < next_due => return Ok(Admission::NotDue(next_due)),
            Some(next_due) if !force => next_due,
            _ => now,
        };

        slot.phase = Phase::Capturing;
        Ok(Admission::Started {
            guard: PhaseGuard {
                table: Arc::clone(self),
                collection: collection.to_string(),
            },
            due_at,
        })
    }

    pub(crate) fn succeeded(&self, collection: &str, next_due: DateTime<Utc>) -> Result<()> {
        let mut slots = self.slots.lock()?;
        let slot = slots.entry(collection.to_string()).or_default();
        slot.consecutive_failures = 0;
        slot.next_due = Some(next_due);
        Ok(())
    }

    /// Counts a failed run. `next_due` stays put so the next tick retries.
    pub(crate) fn failed(&self, collection: &str, error: &BackupError) -> Result<u32> {
        let mut slots = self.slots.lock()?;
        let slot = slots.entry(collection.to_string()).or_default();
        slot.consecutive_failures += 1;
        if error.suspends_collection() {
            slot.suspended = Some(error.to_string());
        }
        Ok(slot.consecutive_failures)
    }

    pub(crate) fn resume(&self, collection: &str) -> Result<bool> {
        let mut slots = self.slots.lock()?;
        match slots.get_mut(collection) {
            Some(slot) if slot.suspended.is_some() => {
                slot.suspended = None;
                slot.consecutive_failures = 0;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn set_phase(&self, collection: &str, phase: Phase) {
        // A poisoned table only loses the phase label; the guard must not panic.
        if let Ok(mut slots) = self.slots.lock() {
            if let Some(slot) = slots.get_mut(collection) {
                slot.phase = phase;
            }
        }
    }
}

/// Holds a slot out of `Idle` for the duration of one run.
#[derive(Debug)]
pub(crate) struct PhaseGuard {
    table: Arc<SlotTable>,
    collection: String,
}

impl PhaseGuard {
    pub(crate) fn advance(&self, phase: Phase) {
        self.table.set_phase(&self.collection, phase);
    }
}

impl Drop for PhaseGuard {
    fn drop(&mut self) {
        self.table.set_phase(&self.collection, Phase::Idle);
    }
}
