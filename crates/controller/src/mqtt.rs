//! MQTT boundary: topic classification, inbound payload decoding, outbound
//! message construction and the link task that drives the rumqttc event loop.

use std::time::Duration;

use rumqttc::{Event, EventLoop, Packet};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::clock::{LocalMinute, ParseMinuteError};
use crate::config::Topics;
use crate::state::{CurtainState, Mode};

// ---------------------------------------------------------------------------
// Topics
// ---------------------------------------------------------------------------

/// The feeds the controller subscribes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicKind {
    LightSwitch,
    Mode,
    Schedule,
    ScheduleKey,
    Sensor,
}

impl Topics {
    pub fn classify(&self, topic: &str) -> Option<TopicKind> {
        if topic == self.light_switch {
            Some(TopicKind::LightSwitch)
        } else if topic == self.mode {
            Some(TopicKind::Mode)
        } else if topic == self.schedule {
            Some(TopicKind::Schedule)
        } else if topic == self.schedule_key {
            Some(TopicKind::ScheduleKey)
        } else if topic == self.sensor {
            Some(TopicKind::Sensor)
        } else {
            None
        }
    }

    pub fn subscriptions(&self) -> [&str; 5] {
        [
            self.light_switch.as_str(),
            self.mode.as_str(),
            self.schedule.as_str(),
            self.schedule_key.as_str(),
            self.sensor.as_str(),
        ]
    }

    /// A light transition goes out as the state feed plus a switch echo.
    pub fn light(&self, on: bool) -> [Outbound; 2] {
        let payload = if on { "1" } else { "0" };
        [
            Outbound::new(&self.light_state, payload),
            Outbound::new(&self.light_switch, payload),
        ]
    }

    pub fn mode_changed(&self, mode: Mode) -> Outbound {
        Outbound::new(&self.mode, mode.as_payload())
    }

    pub fn sensitivity(&self, value: f32) -> Outbound {
        Outbound::new(&self.sensor, format!("sensitivity:{value}"))
    }

    pub fn light_level(&self, median: f32) -> Outbound {
        Outbound::new(&self.data, median.to_string())
    }

    pub fn curtain(&self, curtain: CurtainState) -> Outbound {
        Outbound::new(&self.curtains, curtain.as_payload())
    }
}

// ---------------------------------------------------------------------------
// Inbound
// ---------------------------------------------------------------------------

/// A decoded inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    SetActuator(bool),
    SetMode(Mode),
    ScheduleCreate {
        time: LocalMinute,
        on: bool,
        key: Option<String>,
    },
    ScheduleDelete(LocalMinute),
    ScheduleKey(String),
    SetSensitivity(f32),
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("no handler for topic '{0}'")]
    UnknownTopic(String),

    #[error("payload is not UTF-8")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("expected 1 or 0, got {0:?}")]
    Flag(String),

    #[error("failed to parse JSON payload")]
    Json(#[source] serde_json::Error),

    #[error("missing field '{0}'")]
    MissingField(&'static str),

    #[error("unknown schedule method {0:?}")]
    Method(String),

    #[error("bad schedule time")]
    Time(#[from] ParseMinuteError),

    #[error("bad sensitivity {0:?} (expected sensitivity:<0-100>)")]
    Sensitivity(String),
}

/// A JSON value the dashboard may send either as a number or a string.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Scalar {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
}

impl Scalar {
    fn as_flag(&self) -> Option<bool> {
        match self {
            Self::Int(1) => Some(true),
            Self::Int(0) => Some(false),
            Self::Float(f) if *f == 1.0 => Some(true),
            Self::Float(f) if *f == 0.0 => Some(false),
            Self::Bool(b) => Some(*b),
            Self::Str(s) => parse_flag(s),
            _ => None,
        }
    }

    fn describe(&self) -> String {
        match self {
            Self::Int(i) => i.to_string(),
            Self::Float(f) => f.to_string(),
            Self::Bool(b) => b.to_string(),
            Self::Str(s) => s.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SchedulePayload {
    method: Option<Scalar>,
    time: Option<String>,
    state: Option<Scalar>,
    #[serde(alias = "fakeKey")]
    key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct KeyPayload {
    #[serde(rename = "fakeKey", alias = "key")]
    key: Option<String>,
}

fn parse_flag(s: &str) -> Option<bool> {
    match s.trim() {
        "1" => Some(true),
        "0" => Some(false),
        _ => None,
    }
}

/// Decode a raw publish into a typed event.
pub fn decode(topics: &Topics, topic: &str, payload: &[u8]) -> Result<Inbound, DecodeError> {
    let kind = topics
        .classify(topic)
        .ok_or_else(|| DecodeError::UnknownTopic(topic.to_string()))?;
    let text = std::str::from_utf8(payload)?;

    match kind {
        TopicKind::LightSwitch => parse_flag(text)
            .map(Inbound::SetActuator)
            .ok_or_else(|| DecodeError::Flag(text.to_string())),
        TopicKind::Mode => parse_flag(text)
            .map(|auto| Inbound::SetMode(if auto { Mode::Auto } else { Mode::Manual }))
            .ok_or_else(|| DecodeError::Flag(text.to_string())),
        TopicKind::Schedule => decode_schedule(text),
        TopicKind::ScheduleKey => {
            let msg: KeyPayload = serde_json::from_str(text).map_err(DecodeError::Json)?;
            match msg.key {
                Some(key) if !key.trim().is_empty() => Ok(Inbound::ScheduleKey(key)),
                _ => Err(DecodeError::MissingField("fakeKey")),
            }
        }
        TopicKind::Sensor => decode_sensitivity(text),
    }
}

fn decode_schedule(text: &str) -> Result<Inbound, DecodeError> {
    let msg: SchedulePayload = serde_json::from_str(text).map_err(DecodeError::Json)?;
    let method = msg.method.ok_or(DecodeError::MissingField("method"))?;
    let time: LocalMinute = msg
        .time
        .ok_or(DecodeError::MissingField("time"))?
        .parse()?;

    match method.as_flag() {
        Some(true) => {
            let state = msg.state.ok_or(DecodeError::MissingField("state"))?;
            let on = state
                .as_flag()
                .ok_or_else(|| DecodeError::Flag(state.describe()))?;
            let key = msg.key.filter(|k| !k.trim().is_empty());
            Ok(Inbound::ScheduleCreate { time, on, key })
        }
        Some(false) => Ok(Inbound::ScheduleDelete(time)),
        None => Err(DecodeError::Method(method.describe())),
    }
}

fn decode_sensitivity(text: &str) -> Result<Inbound, DecodeError> {
    let err = || DecodeError::Sensitivity(text.to_string());
    let value: f32 = text
        .trim()
        .strip_prefix("sensitivity:")
        .ok_or_else(err)?
        .trim()
        .parse()
        .map_err(|_| err())?;
    if !(0.0..=100.0).contains(&value) {
        return Err(err());
    }
    Ok(Inbound::SetSensitivity(value))
}

// ---------------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub topic: String,
    pub payload: String,
}

impl Outbound {
    pub fn new(topic: &str, payload: impl Into<String>) -> Self {
        Self {
            topic: topic.to_string(),
            payload: payload.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Link task
// ---------------------------------------------------------------------------

/// What the link task reports to the tick loop.
#[derive(Debug)]
pub enum LinkEvent {
    Connected,
    Disconnected(String),
    Message { topic: String, payload: Vec<u8> },
}

/// Poll the rumqttc event loop forever, forwarding what matters. Returns
/// when the receiving side is gone.
pub async fn run_link(mut eventloop: EventLoop, tx: mpsc::Sender<LinkEvent>) {
    loop {
        let event = match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(p))) => LinkEvent::Message {
                topic: p.topic.clone(),
                payload: p.payload.to_vec(),
            },
            Ok(Event::Incoming(Packet::ConnAck(_))) => LinkEvent::Connected,
            Ok(Event::Incoming(Packet::Disconnect)) => {
                LinkEvent::Disconnected("broker sent disconnect".into())
            }
            Ok(other) => {
                debug!(?other, "mqtt event");
                continue;
            }
            Err(e) => {
                warn!(error = %e, "mqtt error, reconnecting");
                if tx.send(LinkEvent::Disconnected(e.to_string())).await.is_err() {
                    return;
                }
                sleep(Duration::from_secs(2)).await;
                continue;
            }
        };
        if tx.send(event).await.is_err() {
            return;
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn topics() -> Topics {
        Topics::default()
    }

    fn hm(s: &str) -> LocalMinute {
        s.parse().unwrap()
    }

    fn dec(topic: &str, payload: &str) -> Result<Inbound, DecodeError> {
        decode(&topics(), topic, payload.as_bytes())
    }

    // -- classify -----------------------------------------------------------

    #[test]
    fn classify_known_topics() {
        let t = topics();
        assert_eq!(t.classify("lightswitch"), Some(TopicKind::LightSwitch));
        assert_eq!(t.classify("automanual"), Some(TopicKind::Mode));
        assert_eq!(t.classify("handleschedule"), Some(TopicKind::Schedule));
        assert_eq!(t.classify("schedulekey"), Some(TopicKind::ScheduleKey));
        assert_eq!(t.classify("sensor"), Some(TopicKind::Sensor));
    }

    #[test]
    fn classify_publish_only_topics_is_none() {
        let t = topics();
        assert_eq!(t.classify("lightswitchstate"), None);
        assert_eq!(t.classify("data"), None);
        assert_eq!(t.classify(""), None);
    }

    // -- flags --------------------------------------------------------------

    #[test]
    fn light_switch_flags() {
        assert_eq!(dec("lightswitch", "1").unwrap(), Inbound::SetActuator(true));
        assert_eq!(dec("lightswitch", "0").unwrap(), Inbound::SetActuator(false));
        assert_eq!(dec("lightswitch", " 1\n").unwrap(), Inbound::SetActuator(true));
    }

    #[test]
    fn light_switch_garbage() {
        assert!(matches!(dec("lightswitch", "ON"), Err(DecodeError::Flag(_))));
        assert!(matches!(dec("lightswitch", ""), Err(DecodeError::Flag(_))));
    }

    #[test]
    fn mode_flags() {
        assert_eq!(dec("automanual", "1").unwrap(), Inbound::SetMode(Mode::Auto));
        assert_eq!(dec("automanual", "0").unwrap(), Inbound::SetMode(Mode::Manual));
    }

    #[test]
    fn non_utf8_rejected() {
        let err = decode(&topics(), "automanual", &[0xff, 0xfe]).unwrap_err();
        assert!(matches!(err, DecodeError::Utf8(_)));
    }

    #[test]
    fn unknown_topic_rejected() {
        let err = dec("kitchen/light", "1").unwrap_err();
        assert_eq!(err.to_string(), "no handler for topic 'kitchen/light'");
    }

    // -- schedule -----------------------------------------------------------

    #[test]
    fn schedule_create_numeric() {
        let ev = dec("handleschedule", r#"{"method":1,"time":"07:00","state":1}"#).unwrap();
        assert_eq!(
            ev,
            Inbound::ScheduleCreate {
                time: hm("07:00"),
                on: true,
                key: None
            }
        );
    }

    #[test]
    fn schedule_create_string_fields() {
        let ev = dec("handleschedule", r#"{"method":"1","time":"21:30","state":"0"}"#).unwrap();
        assert_eq!(
            ev,
            Inbound::ScheduleCreate {
                time: hm("21:30"),
                on: false,
                key: None
            }
        );
    }

    #[test]
    fn schedule_create_with_inline_key() {
        let ev = dec(
            "handleschedule",
            r#"{"method":1,"time":"07:00","state":1,"key":"0F3A"}"#,
        )
        .unwrap();
        assert_eq!(
            ev,
            Inbound::ScheduleCreate {
                time: hm("07:00"),
                on: true,
                key: Some("0F3A".into())
            }
        );
    }

    #[test]
    fn schedule_delete() {
        let ev = dec("handleschedule", r#"{"method":0,"time":"08:00"}"#).unwrap();
        assert_eq!(ev, Inbound::ScheduleDelete(hm("08:00")));
    }

    #[test]
    fn schedule_extra_fields_ignored() {
        let ev = dec(
            "handleschedule",
            r#"{"method":0,"time":"08:00","state":1,"created_by":"web"}"#,
        )
        .unwrap();
        assert_eq!(ev, Inbound::ScheduleDelete(hm("08:00")));
    }

    #[test]
    fn schedule_bad_json() {
        assert!(matches!(dec("handleschedule", "{method:1"), Err(DecodeError::Json(_))));
    }

    #[test]
    fn schedule_missing_fields() {
        assert!(matches!(
            dec("handleschedule", r#"{"time":"07:00"}"#),
            Err(DecodeError::MissingField("method"))
        ));
        assert!(matches!(
            dec("handleschedule", r#"{"method":1,"state":1}"#),
            Err(DecodeError::MissingField("time"))
        ));
        assert!(matches!(
            dec("handleschedule", r#"{"method":1,"time":"07:00"}"#),
            Err(DecodeError::MissingField("state"))
        ));
    }

    #[test]
    fn schedule_unknown_method() {
        let err = dec("handleschedule", r#"{"method":2,"time":"07:00"}"#).unwrap_err();
        assert!(matches!(err, DecodeError::Method(ref m) if m == "2"));
    }

    #[test]
    fn schedule_bad_time() {
        assert!(matches!(
            dec("handleschedule", r#"{"method":1,"time":"25:00","state":1}"#),
            Err(DecodeError::Time(_))
        ));
    }

    #[test]
    fn schedule_bad_state() {
        assert!(matches!(
            dec("handleschedule", r#"{"method":1,"time":"07:00","state":"maybe"}"#),
            Err(DecodeError::Flag(_))
        ));
    }

    // -- key ----------------------------------------------------------------

    #[test]
    fn schedule_key_fake_key_field() {
        let ev = dec("schedulekey", r#"{"fakeKey":"0ABC123"}"#).unwrap();
        assert_eq!(ev, Inbound::ScheduleKey("0ABC123".into()));
    }

    #[test]
    fn schedule_key_alias() {
        let ev = dec("schedulekey", r#"{"key":"k-1"}"#).unwrap();
        assert_eq!(ev, Inbound::ScheduleKey("k-1".into()));
    }

    #[test]
    fn schedule_key_missing() {
        assert!(matches!(
            dec("schedulekey", r#"{"id":"x"}"#),
            Err(DecodeError::MissingField("fakeKey"))
        ));
        assert!(matches!(
            dec("schedulekey", r#"{"fakeKey":""}"#),
            Err(DecodeError::MissingField("fakeKey"))
        ));
    }

    // -- sensitivity --------------------------------------------------------

    #[test]
    fn sensitivity_parsed() {
        assert_eq!(
            dec("sensor", "sensitivity:42.5").unwrap(),
            Inbound::SetSensitivity(42.5)
        );
        assert_eq!(dec("sensor", "sensitivity:0").unwrap(), Inbound::SetSensitivity(0.0));
        assert_eq!(
            dec("sensor", "sensitivity:100").unwrap(),
            Inbound::SetSensitivity(100.0)
        );
    }

    #[test]
    fn sensitivity_out_of_range() {
        assert!(matches!(
            dec("sensor", "sensitivity:120"),
            Err(DecodeError::Sensitivity(_))
        ));
        assert!(matches!(
            dec("sensor", "sensitivity:-1"),
            Err(DecodeError::Sensitivity(_))
        ));
    }

    #[test]
    fn sensitivity_garbage() {
        for bad in ["50", "sensitivity:", "sensitivity:abc", "threshold:50"] {
            assert!(
                matches!(dec("sensor", bad), Err(DecodeError::Sensitivity(_))),
                "accepted {bad:?}"
            );
        }
    }

    // -- outbound -----------------------------------------------------------

    #[test]
    fn light_publishes_state_and_echo() {
        let [state, echo] = topics().light(true);
        assert_eq!(state, Outbound::new("lightswitchstate", "1"));
        assert_eq!(echo, Outbound::new("lightswitch", "1"));
    }

    #[test]
    fn announcement_payloads() {
        let t = topics();
        assert_eq!(t.sensitivity(50.0).payload, "sensitivity:50");
        assert_eq!(t.sensitivity(37.5).payload, "sensitivity:37.5");
        assert_eq!(t.mode_changed(Mode::Auto), Outbound::new("automanual", "1"));
    }

    #[test]
    fn own_sensitivity_echo_decodes() {
        let t = topics();
        let out = t.sensitivity(37.5);
        let ev = decode(&t, &out.topic, out.payload.as_bytes()).unwrap();
        assert_eq!(ev, Inbound::SetSensitivity(37.5));
    }

    #[test]
    fn data_and_curtain_payloads() {
        let t = topics();
        assert_eq!(t.light_level(42.25), Outbound::new("data", "42.25"));
        assert_eq!(t.curtain(CurtainState::Closed), Outbound::new("curtains", "closed"));
    }
}
