use serde::Serialize;
use std::collections::VecDeque;
use std::time::Instant;
use time::OffsetDateTime;

use crate::schedule::{ScheduleQueue, ScheduleView};

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

/// Who decides the light: the light sensor, or remote commands and schedules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Auto,
    Manual,
}

impl Mode {
    /// Wire representation on the mode topic.
    pub fn as_payload(self) -> &'static str {
        match self {
            Self::Auto => "1",
            Self::Manual => "0",
        }
    }
}

/// Last reported position of the curtains (hall-effect sensor).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CurtainState {
    Open,
    Closed,
}

impl CurtainState {
    pub fn as_payload(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Closed => "closed",
        }
    }

    /// Open curtains hand control back to the light sensor; closed curtains
    /// make its reading meaningless, so control goes manual.
    pub fn mode(self) -> Mode {
        match self {
            Self::Open => Mode::Auto,
            Self::Closed => Mode::Manual,
        }
    }
}

/// The single block of controller state, owned by the tick loop.
pub struct ControlState {
    pub started_at: Instant,
    pub mode: Mode,
    pub sensitivity: f32,
    pub actuator_on: bool,
    /// Last light state published to observers; `None` until the first
    /// command goes out.
    pub last_reported_on: Option<bool>,
    pub light_level: Option<f32>,
    pub curtain: Option<CurtainState>,
    pub mqtt_connected: bool,
    pub schedule: ScheduleQueue,
    pub events: VecDeque<SystemEvent>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Message,
    Actuator,
    Schedule,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub mqtt_connected: bool,
    pub mode: Mode,
    pub sensitivity: f32,
    pub light_on: bool,
    pub light_level: Option<f32>,
    pub curtain: Option<CurtainState>,
    pub schedule: Vec<ScheduleView>,
    pub pending_keys: usize,
    pub events: Vec<SystemEvent>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl ControlState {
    pub fn new(sensitivity: f32, max_schedule_entries: usize) -> Self {
        Self {
            started_at: Instant::now(),
            mode: Mode::Auto,
            sensitivity,
            actuator_on: false,
            last_reported_on: None,
            light_level: None,
            curtain: None,
            mqtt_connected: false,
            schedule: ScheduleQueue::new(max_schedule_entries),
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    /// Record an applied inbound message.
    pub fn record_message(&mut self, detail: String) {
        self.push_event(EventKind::Message, detail);
    }

    /// Record an actuator change and what caused it.
    pub fn record_actuator(&mut self, on: bool, cause: &str) {
        let state_str = if on { "ON" } else { "OFF" };
        self.push_event(EventKind::Actuator, format!("light {state_str} ({cause})"));
    }

    pub fn record_schedule(&mut self, detail: String) {
        self.push_event(EventKind::Schedule, detail);
    }

    /// Record an error event.
    pub fn record_error(&mut self, detail: String) {
        self.push_event(EventKind::Error, detail);
    }

    /// Record a generic system event.
    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    /// Build the JSON-serialisable status snapshot.
    pub fn to_status(&self) -> StatusResponse {
        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            mqtt_connected: self.mqtt_connected,
            mode: self.mode,
            sensitivity: self.sensitivity,
            light_on: self.actuator_on,
            light_level: self.light_level,
            curtain: self.curtain,
            schedule: self.schedule.entries().iter().map(ScheduleView::from).collect(),
            pending_keys: self.schedule.pending_keys(),
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SystemEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            detail,
        });
    }
}

// ===========================================================================
// Tests
// ===========================================================================
