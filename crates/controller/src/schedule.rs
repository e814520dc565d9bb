//! One-shot time-of-day schedule: the queue of pending entries, pairing of
//! correlation keys with entries, and the per-tick firing engine.
//!
//! ## Firing guard
//!
//! ```text
//! Idle ──[entry due at HH:MM]──▶ ActionFired(HH:MM)
//!  ▲                                   │
//!  └────────[no entry due now]─────────┘
//! ```
//!
//! The loop ticks about once a second, so an entry's minute is seen roughly
//! sixty times. The guard lets exactly one entry fire per matching minute.
//!
//! ## Key pairing
//!
//! A create message may carry its correlation key inline. Keys that arrive
//! on the separate key topic are paired explicitly, in creation order, with
//! entries that were created without one. An entry that fires or is
//! deleted before its key shows up keeps its place in that line: the late
//! key goes to it (deleted remotely, or discarded) and never shifts onto a
//! younger entry. A key with no entry waiting for it sits in a FIFO and
//! goes to the next entry created without an inline key.

use std::collections::VecDeque;

use serde::Serialize;
use tracing::{info, warn};

use crate::arbiter::{self, Command, CommandSource};
use crate::clock::LocalMinute;
use crate::hw::Actuator;
use crate::state::{ControlState, Mode};

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleEntry {
    pub time: LocalMinute,
    pub on: bool,
    pub key: Option<String>,
    /// Creation sequence number, used to match late keys.
    id: u64,
}

/// Status-API view of an entry. The key itself stays private.
#[derive(Debug, Clone, Serialize)]
pub struct ScheduleView {
    pub time: LocalMinute,
    pub on: bool,
    pub has_key: bool,
}

impl From<&ScheduleEntry> for ScheduleView {
    fn from(e: &ScheduleEntry) -> Self {
        Self {
            time: e.time,
            on: e.on,
            has_key: e.key.is_some(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("schedule queue full ({0} entries)")]
    Full(usize),
    #[error("pending key queue full ({0} keys)")]
    KeysFull(usize),
}

/// Where a key from the key topic ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyPairing {
    Attached(LocalMinute),
    /// Its entry already fired; the key still has to be deleted remotely.
    Fired(LocalMinute, String),
    /// Its entry was deleted before the key arrived.
    Discarded(LocalMinute),
    Pending,
}

/// An entry created without a key, in creation order, waiting for the key
/// topic to catch up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeySlot {
    Queued(u64),
    Fired(LocalMinute),
    Deleted(LocalMinute),
}

impl KeySlot {
    fn is_owed(&self) -> bool {
        !matches!(self, KeySlot::Queued(_))
    }
}

/// Insertion-ordered pending entries, bounded by `capacity`.
#[derive(Debug)]
pub struct ScheduleQueue {
    entries: Vec<ScheduleEntry>,
    /// Keys that arrived before any entry was waiting for one.
    pending_keys: VecDeque<String>,
    /// Keyless entries, queued or gone, still owed a key.
    awaiting: VecDeque<KeySlot>,
    next_id: u64,
    capacity: usize,
}

impl ScheduleQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::new(),
            pending_keys: VecDeque::new(),
            awaiting: VecDeque::new(),
            next_id: 0,
            capacity,
        }
    }

    /// Append an entry. Without an inline key it takes the oldest waiting key.
    pub fn push(
        &mut self,
        time: LocalMinute,
        on: bool,
        key: Option<String>,
    ) -> Result<(), QueueError> {
        if self.entries.len() >= self.capacity {
            return Err(QueueError::Full(self.capacity));
        }
        let id = self.next_id;
        self.next_id += 1;

        let key = key.or_else(|| self.pending_keys.pop_front());
        if key.is_none() {
            self.awaiting.push_back(KeySlot::Queued(id));
        }
        self.entries.push(ScheduleEntry { time, on, key, id });
        Ok(())
    }

    /// Pair a key from the key topic with the oldest entry still owed one,
    /// whether that entry is queued, fired or deleted.
    pub fn attach_key(&mut self, key: String) -> Result<KeyPairing, QueueError> {
        while let Some(slot) = self.awaiting.pop_front() {
            match slot {
                KeySlot::Queued(id) => {
                    if let Some(entry) = self.entries.iter_mut().find(|e| e.id == id) {
                        entry.key = Some(key);
                        return Ok(KeyPairing::Attached(entry.time));
                    }
                }
                KeySlot::Fired(time) => return Ok(KeyPairing::Fired(time, key)),
                KeySlot::Deleted(time) => return Ok(KeyPairing::Discarded(time)),
            }
        }
        if self.pending_keys.len() >= self.capacity {
            return Err(QueueError::KeysFull(self.capacity));
        }
        self.pending_keys.push_back(key);
        Ok(KeyPairing::Pending)
    }

    /// Remove every entry at `time`, keys included. Returns how many went.
    pub fn remove_time(&mut self, time: LocalMinute) -> usize {
        let (gone, kept): (Vec<_>, Vec<_>) =
            self.entries.drain(..).partition(|e| e.time == time);
        self.entries = kept;
        for entry in &gone {
            if entry.key.is_none() {
                self.mark_owed(entry.id, KeySlot::Deleted(entry.time));
            }
        }
        gone.len()
    }

    pub fn has_due(&self, now: LocalMinute) -> bool {
        self.entries.iter().any(|e| e.time == now)
    }

    /// Remove and return the first entry due at `now`.
    pub fn take_due(&mut self, now: LocalMinute) -> Option<ScheduleEntry> {
        let idx = self.entries.iter().position(|e| e.time == now)?;
        let entry = self.entries.remove(idx);
        if entry.key.is_none() {
            self.mark_owed(entry.id, KeySlot::Fired(entry.time));
        }
        Some(entry)
    }

    /// Keep the departed entry's place in line for its key. Owed slots are
    /// bounded by `capacity`; past that the oldest is forgotten.
    fn mark_owed(&mut self, id: u64, owed: KeySlot) {
        if let Some(slot) = self.awaiting.iter_mut().find(|s| **s == KeySlot::Queued(id)) {
            *slot = owed;
        }
        if self.awaiting.iter().filter(|s| s.is_owed()).count() > self.capacity {
            if let Some(idx) = self.awaiting.iter().position(KeySlot::is_owed) {
                self.awaiting.remove(idx);
                warn!(capacity = self.capacity, "too many keys outstanding, forgetting the oldest");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn pending_keys(&self) -> usize {
        self.pending_keys.len()
    }

    pub fn entries(&self) -> &[ScheduleEntry] {
        &self.entries
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FireGuard {
    Idle,
    ActionFired(LocalMinute),
}

/// What a fired entry did, for the caller to publish.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleAction {
    pub time: LocalMinute,
    pub command: Command,
    /// The entry forced a switch from auto to manual.
    pub mode_changed: bool,
    /// Correlation key to delete remotely.
    pub key: Option<String>,
}

#[derive(Debug)]
pub struct ScheduleEngine {
    guard: FireGuard,
}

impl Default for ScheduleEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ScheduleEngine {
    pub fn new() -> Self {
        Self {
            guard: FireGuard::Idle,
        }
    }

    /// Run one tick at local minute `now`: fire at most one due entry.
    pub fn tick(
        &mut self,
        state: &mut ControlState,
        now: LocalMinute,
        actuator: &mut impl Actuator,
    ) -> Option<ScheduleAction> {
        if !state.schedule.has_due(now) {
            self.guard = FireGuard::Idle;
            return None;
        }
        if self.guard == FireGuard::ActionFired(now) {
            return None;
        }

        let entry = state.schedule.take_due(now)?;
        self.guard = FireGuard::ActionFired(now);

        let mode_changed = state.mode != Mode::Manual;
        state.mode = Mode::Manual;
        let command = arbiter::drive(state, entry.on, CommandSource::Schedule, actuator);

        info!(
            time = %entry.time,
            on = entry.on,
            has_key = entry.key.is_some(),
            remaining = state.schedule.len(),
            "schedule: entry fired"
        );
        state.record_schedule(format!(
            "{} fired: light {}",
            entry.time,
            if entry.on { "ON" } else { "OFF" }
        ));

        Some(ScheduleAction {
            time: entry.time,
            command,
            mode_changed,
            key: entry.key,
        })
    }
}

// ===========================================================================
// Tests
// ===========================================================================
