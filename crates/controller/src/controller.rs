//! Per-tick orchestration.
//!
//! [`Controller`] owns the control state and every component that mutates
//! it. Hardware comes in through the port traits at each call, and the
//! outbound side goes back as plain data, so the whole engine runs
//! synchronously in tests.
//!
//! ```text
//!  inbound ──▶ handle_message ──┐
//!                               ▼
//!  hw ──▶ tick: curtains · light/arbiter · schedule · aggregate ──▶ TickOutput
//! ```

use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::arbiter::{self, CommandSource};
use crate::clock::LocalMinute;
use crate::config::{Config, Topics};
use crate::hw::{Actuator, LightSensor, ProximitySensor};
use crate::mqtt::{self, Inbound, Outbound};
use crate::sampler::{self, Aggregator};
use crate::schedule::{KeyPairing, ScheduleEngine};
use crate::state::{ControlState, Mode, StatusResponse};

/// What one tick wants done on the network, in order.
#[derive(Debug, Default, PartialEq)]
pub struct TickOutput {
    pub publishes: Vec<Outbound>,
    /// Correlation keys of consumed entries, for remote deletion.
    pub deletes: Vec<String>,
}

pub struct Controller {
    state: ControlState,
    topics: Topics,
    engine: ScheduleEngine,
    aggregator: Aggregator,
    /// Set while the light sensor is failing, so the fault logs once.
    light_fault: bool,
    /// Late keys of entries that already fired, flushed on the next tick.
    late_deletes: Vec<String>,
}

impl Controller {
    pub fn new(config: &Config, now: Instant) -> Self {
        let mut state = ControlState::new(
            config.control.default_sensitivity,
            config.control.max_schedule_entries,
        );
        state.record_system("controller started".into());

        Self {
            state,
            topics: config.topics.clone(),
            engine: ScheduleEngine::new(),
            aggregator: Aggregator::new(
                Duration::from_secs(config.aggregate.interval_sec),
                config.aggregate.max_samples,
                now,
            ),
            light_fault: false,
            late_deletes: Vec::new(),
        }
    }

    pub fn topics(&self) -> &Topics {
        &self.topics
    }

    pub fn status(&self) -> StatusResponse {
        self.state.to_status()
    }

    /// Messages to publish every time the broker link comes up.
    pub fn announce(&self) -> Vec<Outbound> {
        vec![
            self.topics.sensitivity(self.state.sensitivity),
            self.topics.mode_changed(self.state.mode),
        ]
    }

    pub fn link_up(&mut self) {
        self.state.mqtt_connected = true;
        self.state.record_system("mqtt connected".into());
    }

    pub fn link_down(&mut self, reason: &str) {
        if self.state.mqtt_connected {
            self.state.record_system(format!("mqtt disconnected: {reason}"));
        }
        self.state.mqtt_connected = false;
    }

    pub fn record_error(&mut self, detail: String) {
        self.state.record_error(detail);
    }

    // ── Inbound ───────────────────────────────────────────────

    /// Decode and apply one inbound publish. Malformed input is logged and
    /// dropped without touching the state.
    pub fn handle_message(&mut self, topic: &str, payload: &[u8], actuator: &mut impl Actuator) {
        match mqtt::decode(&self.topics, topic, payload) {
            Ok(event) => self.apply(event, actuator),
            Err(e) => {
                let detail = match std::error::Error::source(&e) {
                    Some(src) => format!("{e}: {src}"),
                    None => e.to_string(),
                };
                warn!(topic, error = %detail, "dropping inbound message");
                self.state.record_error(format!("{topic}: {detail}"));
            }
        }
    }

    fn apply(&mut self, event: Inbound, actuator: &mut impl Actuator) {
        let st = &mut self.state;
        match event {
            Inbound::SetActuator(on) => {
                info!(on, mode = ?st.mode, "remote light command");
                arbiter::drive(st, on, CommandSource::Remote, actuator);
            }
            Inbound::SetMode(mode) => {
                if st.mode != mode {
                    info!(?mode, "mode set remotely");
                    st.record_message(format!("mode set to {}", mode_name(mode)));
                }
                st.mode = mode;
            }
            Inbound::SetSensitivity(value) => {
                if st.sensitivity != value {
                    info!(sensitivity = value, "sensitivity updated");
                    st.record_message(format!("sensitivity set to {value}"));
                }
                st.sensitivity = value;
            }
            Inbound::ScheduleCreate { time, on, key } => {
                let inline_key = key.is_some();
                match st.schedule.push(time, on, key) {
                    Ok(()) => {
                        info!(%time, on, inline_key, queued = st.schedule.len(), "schedule entry added");
                        st.record_schedule(format!(
                            "added {time}: light {}",
                            if on { "ON" } else { "OFF" }
                        ));
                    }
                    Err(e) => {
                        warn!(%time, error = %e, "schedule entry dropped");
                        st.record_error(format!("schedule {time} dropped: {e}"));
                    }
                }
            }
            Inbound::ScheduleDelete(time) => {
                let removed = st.schedule.remove_time(time);
                info!(%time, removed, "schedule entries deleted");
                st.record_schedule(format!("deleted {time} ({removed} removed)"));
            }
            Inbound::ScheduleKey(key) => match st.schedule.attach_key(key) {
                Ok(KeyPairing::Attached(time)) => {
                    debug!(%time, "key attached to schedule entry");
                }
                Ok(KeyPairing::Fired(time, key)) => {
                    info!(%time, "key arrived after its entry fired");
                    self.late_deletes.push(key);
                }
                Ok(KeyPairing::Discarded(time)) => {
                    info!(%time, "key arrived after its entry was deleted, dropping it");
                }
                Ok(KeyPairing::Pending) => {
                    debug!(pending = st.schedule.pending_keys(), "key waiting for an entry");
                }
                Err(e) => {
                    warn!(error = %e, "schedule key dropped");
                    st.record_error(format!("schedule key dropped: {e}"));
                }
            },
        }
    }

    // ── Tick ──────────────────────────────────────────────────

    /// Run one control tick at local minute `now` and monotonic time `at`.
    pub fn tick<B>(&mut self, hw: &mut B, now: LocalMinute, at: Instant) -> TickOutput
    where
        B: Actuator + LightSensor + ProximitySensor,
    {
        let mut out = TickOutput::default();

        match hw.is_open() {
            Ok(Some(open)) => {
                if let Some(curtain) = sampler::observe_curtain(&mut self.state, open) {
                    out.publishes.push(self.topics.mode_changed(self.state.mode));
                    out.publishes.push(self.topics.curtain(curtain));
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, "proximity sensor read failed");
                self.state.record_error(format!("proximity sensor: {e}"));
            }
        }

        match hw.read_raw() {
            Ok(raw) => {
                if self.light_fault {
                    info!("light sensor recovered");
                    self.state.record_system("light sensor recovered".into());
                    self.light_fault = false;
                }
                let level = sampler::normalize(raw);
                self.state.light_level = Some(level);
                if let Some(cmd) = arbiter::reconcile(&mut self.state, level, hw) {
                    debug!(on = cmd.on, source = ?cmd.source, "light command");
                    out.publishes.extend(self.topics.light(cmd.on));
                }
                self.aggregator.push(level);
            }
            Err(e) => {
                if !self.light_fault {
                    warn!(error = %e, "light sensor read failed");
                    self.state.record_error(format!("light sensor: {e}"));
                    self.light_fault = true;
                }
                debug!(error = %e, "skipping light-dependent steps");
            }
        }

        out.deletes.append(&mut self.late_deletes);
        if let Some(action) = self.engine.tick(&mut self.state, now, hw) {
            debug!(time = %action.time, source = ?action.command.source, "light command");
            if action.mode_changed {
                out.publishes.push(self.topics.mode_changed(self.state.mode));
            }
            out.publishes.extend(self.topics.light(action.command.on));
            if let Some(key) = action.key {
                out.deletes.push(key);
            }
        }

        let buffered = self.aggregator.len();
        if let Some(median) = self.aggregator.poll(at) {
            debug!(median, samples = buffered, "publishing aggregated light level");
            out.publishes.push(self.topics.light_level(median));
        }

        out
    }

    /// Force the light off for shutdown and return what to publish.
    pub fn shutdown(&mut self, actuator: &mut impl Actuator) -> Vec<Outbound> {
        arbiter::drive(&mut self.state, false, CommandSource::Shutdown, actuator);
        self.state.record_system("controller stopping".into());
        self.topics.light(false).to_vec()
    }
}

fn mode_name(mode: Mode) -> &'static str {
    match mode {
        Mode::Auto => "auto",
        Mode::Manual => "manual",
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::testing::FakeBoard;
    use crate::state::{CurtainState, EventKind};

    /// Raw reading that normalises to roughly `pct` percent.
    fn raw(pct: f32) -> Option<u16> {
        Some((pct / 100.0 * 65535.0).round() as u16)
    }

    fn hm(s: &str) -> LocalMinute {
        s.parse().unwrap()
    }

    fn setup() -> (Controller, FakeBoard, Instant) {
        let t0 = Instant::now();
        let ctl = Controller::new(&Config::default(), t0);
        let board = FakeBoard {
            raw: raw(80.0),
            ..FakeBoard::default()
        };
        (ctl, board, t0)
    }

    fn send(ctl: &mut Controller, board: &mut FakeBoard, topic: &str, payload: &str) {
        ctl.handle_message(topic, payload.as_bytes(), board);
    }

    fn light_msgs(on: bool) -> Vec<Outbound> {
        Topics::default().light(on).to_vec()
    }

    // -- Arbiter through the tick -------------------------------------------

    #[test]
    fn repeated_ticks_with_unchanged_input_are_silent() {
        let (mut ctl, mut board, t0) = setup();
        let first = ctl.tick(&mut board, hm("12:00"), t0);
        assert_eq!(first.publishes, light_msgs(false));

        for i in 1..20 {
            let out = ctl.tick(&mut board, hm("12:00"), t0 + Duration::from_secs(i));
            assert!(out.publishes.is_empty(), "tick {i}: {:?}", out.publishes);
        }
        assert_eq!(board.writes, 1);
    }

    #[test]
    fn darkness_switches_light_on_once() {
        let (mut ctl, mut board, t0) = setup();
        ctl.tick(&mut board, hm("18:00"), t0);

        board.raw = raw(10.0);
        let out = ctl.tick(&mut board, hm("18:00"), t0);
        assert_eq!(out.publishes, light_msgs(true));
        assert!(board.on);
        assert!(ctl.tick(&mut board, hm("18:00"), t0).publishes.is_empty());
    }

    #[test]
    fn manual_mode_ignores_light_level() {
        let (mut ctl, mut board, t0) = setup();
        send(&mut ctl, &mut board, "automanual", "0");
        for pct in [10.0, 90.0, 5.0] {
            board.raw = raw(pct);
            assert!(ctl.tick(&mut board, hm("18:00"), t0).publishes.is_empty());
        }
        assert_eq!(board.writes, 0);
    }

    #[test]
    fn sensitivity_message_moves_threshold() {
        let (mut ctl, mut board, t0) = setup();
        board.raw = raw(40.0);
        assert_eq!(ctl.tick(&mut board, hm("18:00"), t0).publishes, light_msgs(true));

        send(&mut ctl, &mut board, "sensor", "sensitivity:30");
        assert_eq!(ctl.status().sensitivity, 30.0);
        assert_eq!(ctl.tick(&mut board, hm("18:00"), t0).publishes, light_msgs(false));
    }

    // -- Remote switch ------------------------------------------------------

    #[test]
    fn remote_switch_drives_output_without_republish() {
        let (mut ctl, mut board, t0) = setup();
        send(&mut ctl, &mut board, "automanual", "0");
        send(&mut ctl, &mut board, "lightswitch", "1");
        assert!(board.on);
        assert!(ctl.status().light_on);
        assert!(ctl.tick(&mut board, hm("12:00"), t0).publishes.is_empty());
    }

    #[test]
    fn switch_echo_is_idempotent() {
        let (mut ctl, mut board, t0) = setup();
        board.raw = raw(10.0);
        let out = ctl.tick(&mut board, hm("18:00"), t0);
        // The broker hands our own echo back.
        for msg in out.publishes.iter().filter(|m| m.topic == "lightswitch") {
            send(&mut ctl, &mut board, &msg.topic, &msg.payload);
        }
        assert!(board.on);
        assert!(ctl.tick(&mut board, hm("18:00"), t0).publishes.is_empty());
    }

    #[test]
    fn auto_mode_corrects_remote_switch_on_next_tick() {
        let (mut ctl, mut board, t0) = setup();
        ctl.tick(&mut board, hm("12:00"), t0);
        send(&mut ctl, &mut board, "lightswitch", "1");
        let out = ctl.tick(&mut board, hm("12:00"), t0);
        assert_eq!(out.publishes, light_msgs(false));
        assert!(!board.on);
    }

    // -- Schedule -----------------------------------------------------------

    #[test]
    fn scheduled_entry_fires_once_and_requests_delete() {
        let (mut ctl, mut board, t0) = setup();
        ctl.tick(&mut board, hm("06:59"), t0);
        send(&mut ctl, &mut board, "schedulekey", r#"{"fakeKey":"K1"}"#);
        send(&mut ctl, &mut board, "handleschedule", r#"{"method":1,"time":"07:00","state":1}"#);

        let out = ctl.tick(&mut board, hm("07:00"), t0);
        let mut expected = vec![Outbound::new("automanual", "0")];
        expected.extend(light_msgs(true));
        assert_eq!(out.publishes, expected);
        assert_eq!(out.deletes, vec!["K1".to_string()]);
        assert!(board.on);
        assert_eq!(ctl.status().mode, Mode::Manual);

        let again = ctl.tick(&mut board, hm("07:00"), t0);
        assert_eq!(again, TickOutput::default());
    }

    #[test]
    fn keyless_entry_fires_without_delete() {
        let (mut ctl, mut board, t0) = setup();
        send(&mut ctl, &mut board, "handleschedule", r#"{"method":"1","time":"07:00","state":"0"}"#);
        let out = ctl.tick(&mut board, hm("07:00"), t0);
        assert!(out.deletes.is_empty());
        assert!(out.publishes.contains(&Outbound::new("lightswitchstate", "0")));
    }

    #[test]
    fn key_after_firing_is_still_deleted_and_next_entry_keeps_its_own() {
        let (mut ctl, mut board, t0) = setup();
        send(&mut ctl, &mut board, "handleschedule", r#"{"method":1,"time":"07:00","state":1}"#);
        let out = ctl.tick(&mut board, hm("07:00"), t0);
        assert!(out.deletes.is_empty());

        send(&mut ctl, &mut board, "schedulekey", r#"{"fakeKey":"K_A"}"#);
        send(&mut ctl, &mut board, "handleschedule", r#"{"method":1,"time":"08:00","state":0}"#);
        send(&mut ctl, &mut board, "schedulekey", r#"{"fakeKey":"K_B"}"#);

        let out = ctl.tick(&mut board, hm("07:01"), t0);
        assert_eq!(out.deletes, vec!["K_A".to_string()]);
        let out = ctl.tick(&mut board, hm("08:00"), t0);
        assert_eq!(out.deletes, vec!["K_B".to_string()]);
    }

    #[test]
    fn key_after_deletion_is_dropped() {
        let (mut ctl, mut board, t0) = setup();
        send(&mut ctl, &mut board, "handleschedule", r#"{"method":1,"time":"07:00","state":1}"#);
        send(&mut ctl, &mut board, "handleschedule", r#"{"method":1,"time":"08:00","state":0}"#);
        send(&mut ctl, &mut board, "handleschedule", r#"{"method":0,"time":"07:00"}"#);
        send(&mut ctl, &mut board, "schedulekey", r#"{"fakeKey":"K_A"}"#);
        send(&mut ctl, &mut board, "schedulekey", r#"{"fakeKey":"K_B"}"#);

        assert!(ctl.tick(&mut board, hm("07:00"), t0).deletes.is_empty());
        let out = ctl.tick(&mut board, hm("08:00"), t0);
        assert_eq!(out.deletes, vec!["K_B".to_string()]);
    }

    #[test]
    fn deleted_entry_never_fires() {
        let (mut ctl, mut board, t0) = setup();
        send(&mut ctl, &mut board, "handleschedule", r#"{"method":1,"time":"07:00","state":1}"#);
        send(&mut ctl, &mut board, "handleschedule", r#"{"method":1,"time":"08:00","state":0}"#);
        send(&mut ctl, &mut board, "handleschedule", r#"{"method":0,"time":"07:00"}"#);

        let status = ctl.status();
        assert_eq!(status.schedule.len(), 1);
        assert_eq!(status.schedule[0].time, hm("08:00"));
        assert!(!status.schedule[0].on);

        ctl.tick(&mut board, hm("12:00"), t0);
        assert!(ctl.tick(&mut board, hm("07:00"), t0).deletes.is_empty());
        assert_eq!(ctl.status().mode, Mode::Auto);
    }

    #[test]
    fn schedule_fires_even_when_light_sensor_fails() {
        let (mut ctl, mut board, t0) = setup();
        board.raw = None;
        send(&mut ctl, &mut board, "handleschedule", r#"{"method":1,"time":"07:00","state":1,"key":"K9"}"#);
        let out = ctl.tick(&mut board, hm("07:00"), t0);
        assert_eq!(out.deletes, vec!["K9".to_string()]);
        assert!(board.on);
    }

    #[test]
    fn full_queue_drops_entry_and_records_error() {
        let t0 = Instant::now();
        let mut cfg = Config::default();
        cfg.control.max_schedule_entries = 1;
        let mut ctl = Controller::new(&cfg, t0);
        let mut board = FakeBoard::default();
        send(&mut ctl, &mut board, "handleschedule", r#"{"method":1,"time":"07:00","state":1}"#);
        send(&mut ctl, &mut board, "handleschedule", r#"{"method":1,"time":"08:00","state":1}"#);
        let status = ctl.status();
        assert_eq!(status.schedule.len(), 1);
        assert_eq!(status.events[0].kind, EventKind::Error);
    }

    // -- Malformed input ----------------------------------------------------

    #[test]
    fn malformed_messages_change_nothing() {
        let (mut ctl, mut board, _) = setup();
        for (topic, payload) in [
            ("handleschedule", "not json"),
            ("handleschedule", r#"{"method":1,"time":"7am","state":1}"#),
            ("sensor", "sensitivity:abc"),
            ("automanual", "auto"),
            ("lightswitch", "toggle"),
            ("unknown/topic", "1"),
        ] {
            send(&mut ctl, &mut board, topic, payload);
        }
        let status = ctl.status();
        assert_eq!(status.mode, Mode::Auto);
        assert_eq!(status.sensitivity, 50.0);
        assert!(status.schedule.is_empty());
        assert_eq!(board.writes, 0);
        let errors = status.events.iter().filter(|e| e.kind == EventKind::Error).count();
        assert_eq!(errors, 6);
    }

    // -- Sensors ------------------------------------------------------------

    #[test]
    fn light_sensor_failure_skips_arbiter_and_logs_once() {
        let (mut ctl, mut board, t0) = setup();
        board.raw = None;
        for _ in 0..5 {
            assert!(ctl.tick(&mut board, hm("12:00"), t0).publishes.is_empty());
        }
        assert_eq!(board.writes, 0);
        let status = ctl.status();
        let errors = status.events.iter().filter(|e| e.kind == EventKind::Error).count();
        assert_eq!(errors, 1);
        assert_eq!(status.light_level, None);
    }

    #[test]
    fn curtain_close_publishes_mode_and_state() {
        let (mut ctl, mut board, t0) = setup();
        board.curtain_open = Some(true);
        let first = ctl.tick(&mut board, hm("12:00"), t0);
        assert_eq!(first.publishes[0], Outbound::new("automanual", "1"));
        assert_eq!(first.publishes[1], Outbound::new("curtains", "open"));

        board.curtain_open = Some(false);
        let out = ctl.tick(&mut board, hm("12:00"), t0);
        assert_eq!(
            out.publishes,
            vec![
                Outbound::new("automanual", "0"),
                Outbound::new("curtains", "closed")
            ]
        );
        assert_eq!(ctl.status().curtain, Some(CurtainState::Closed));
        assert!(ctl.tick(&mut board, hm("12:00"), t0).publishes.is_empty());
    }

    #[test]
    fn proximity_failure_keeps_light_control() {
        let (mut ctl, mut board, t0) = setup();
        board.fail_proximity = true;
        board.raw = raw(10.0);
        let out = ctl.tick(&mut board, hm("18:00"), t0);
        assert_eq!(out.publishes, light_msgs(true));
    }

    // -- Aggregation --------------------------------------------------------

    #[test]
    fn median_published_after_interval() {
        let (mut ctl, mut board, t0) = setup();
        for (i, pct) in [80.0, 70.0, 90.0].into_iter().enumerate() {
            board.raw = raw(pct);
            let out = ctl.tick(&mut board, hm("12:00"), t0 + Duration::from_secs(i as u64));
            assert!(out.publishes.iter().all(|m| m.topic != "data"));
        }
        board.raw = raw(75.0);
        let out = ctl.tick(&mut board, hm("12:00"), t0 + Duration::from_secs(30));
        let data: Vec<_> = out.publishes.iter().filter(|m| m.topic == "data").collect();
        assert_eq!(data.len(), 1);
        // Median of {80, 70, 90, 75} = (75 + 80) / 2.
        assert_eq!(data[0].payload, "77.5");
    }

    // -- Lifecycle ----------------------------------------------------------

    #[test]
    fn announce_reports_current_settings() {
        let (mut ctl, mut board, _) = setup();
        send(&mut ctl, &mut board, "sensor", "sensitivity:35");
        send(&mut ctl, &mut board, "automanual", "0");
        assert_eq!(
            ctl.announce(),
            vec![
                Outbound::new("sensor", "sensitivity:35"),
                Outbound::new("automanual", "0")
            ]
        );
    }

    #[test]
    fn shutdown_turns_light_off() {
        let (mut ctl, mut board, t0) = setup();
        board.raw = raw(10.0);
        ctl.tick(&mut board, hm("18:00"), t0);
        assert!(board.on);

        let out = ctl.shutdown(&mut board);
        assert!(!board.on);
        assert_eq!(out, light_msgs(false));
        assert!(!ctl.status().light_on);
    }

    #[test]
    fn link_state_tracked() {
        let (mut ctl, _, _) = setup();
        ctl.link_up();
        assert!(ctl.status().mqtt_connected);
        ctl.link_down("connection refused");
        assert!(!ctl.status().mqtt_connected);
    }
}
