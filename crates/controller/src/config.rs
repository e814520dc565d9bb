//! TOML config file loading and validation, plus the environment overrides
//! applied on top of it.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::env;

use crate::adc;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub mqtt: MqttConfig,
    pub topics: Topics,
    pub control: ControlConfig,
    pub aggregate: AggregateConfig,
    pub clock: ClockConfig,
    pub hardware: HardwareConfig,
    /// Absent section: consumed keys are not deleted remotely.
    pub remote: Option<RemoteConfig>,
    pub web: WebConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive_sec: u64,
    /// Consecutive link failures tolerated before the controller shuts down.
    pub max_reconnect_attempts: u32,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 1883,
            client_id: "lightswitch-controller".into(),
            username: None,
            password: None,
            keep_alive_sec: 30,
            max_reconnect_attempts: 10,
        }
    }
}

/// Topic names. The defaults are the dashboard feed names.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Topics {
    pub light_switch: String,
    pub light_state: String,
    pub mode: String,
    pub schedule: String,
    pub schedule_key: String,
    pub sensor: String,
    pub data: String,
    pub curtains: String,
}

impl Default for Topics {
    fn default() -> Self {
        Self {
            light_switch: "lightswitch".into(),
            light_state: "lightswitchstate".into(),
            mode: "automanual".into(),
            schedule: "handleschedule".into(),
            schedule_key: "schedulekey".into(),
            sensor: "sensor".into(),
            data: "data".into(),
            curtains: "curtains".into(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub tick_ms: u64,
    pub default_sensitivity: f32,
    pub max_messages_per_tick: usize,
    pub max_schedule_entries: usize,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            tick_ms: 1000,
            default_sensitivity: 50.0,
            max_messages_per_tick: 16,
            max_schedule_entries: 32,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct AggregateConfig {
    pub interval_sec: u64,
    /// Flush early once this many samples are buffered.
    pub max_samples: Option<usize>,
}

impl Default for AggregateConfig {
    fn default() -> Self {
        Self {
            interval_sec: 30,
            max_samples: None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ClockConfig {
    pub utc_offset_minutes: i32,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            utc_offset_minutes: 120,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HardwareConfig {
    pub light_pin: u8,
    /// Many common relay boards are active-low.
    pub active_low: bool,
    pub adc_address: u16,
    pub light_channel: usize,
    /// Hall-effect curtain sensor. Unset disables curtain tracking.
    pub hall_pin: Option<u8>,
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            light_pin: 17,
            active_low: false,
            adc_address: 0x48,
            light_channel: 0,
            hall_pin: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
    /// URL template; `{key}` is replaced by the correlation key.
    pub delete_url: String,
    pub api_key: Option<String>,
    #[serde(default = "default_api_key_header")]
    pub api_key_header: String,
    #[serde(default = "default_timeout_sec")]
    pub timeout_sec: u64,
}

fn default_api_key_header() -> String {
    "X-AIO-Key".into()
}

fn default_timeout_sec() -> u64 {
    5
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 8080,
        }
    }
}

// ---------------------------------------------------------------------------
// GPIO whitelist
// ---------------------------------------------------------------------------

/// BCM GPIO pins available on the Raspberry Pi 40-pin header for general
/// use. GPIO 0-1 are reserved for the ID EEPROM and must never be used.
/// GPIO 28+ are not exposed on the standard header.
const VALID_GPIO_PINS: &[u8] = &[
    2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25, 26, 27,
];

/// ADDR pin strapping gives the ADS1115 one of four addresses.
const ADS1115_ADDRESSES: &[u16] = &[0x48, 0x49, 0x4a, 0x4b];

/// A schedule minute must be seen at least once.
const MAX_TICK_MS: u64 = 60_000;
/// Offsets in use world-wide stay within +/-14 h.
const MAX_UTC_OFFSET_MINUTES: u32 = 14 * 60;

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_mqtt(&mut errors);
        self.validate_topics(&mut errors);
        self.validate_control(&mut errors);
        self.validate_hardware(&mut errors);
        self.validate_remote(&mut errors);

        if self.aggregate.interval_sec == 0 {
            errors.push("aggregate.interval_sec must be positive".into());
        }
        if self.aggregate.max_samples == Some(0) {
            errors.push("aggregate.max_samples must be positive when set".into());
        }
        if self.clock.utc_offset_minutes.unsigned_abs() > MAX_UTC_OFFSET_MINUTES {
            errors.push(format!(
                "clock.utc_offset_minutes {} out of range [-{MAX_UTC_OFFSET_MINUTES}, {MAX_UTC_OFFSET_MINUTES}]",
                self.clock.utc_offset_minutes
            ));
        }
        if self.web.enabled && self.web.port == 0 {
            errors.push("web.port must be non-zero".into());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_mqtt(&self, errors: &mut Vec<String>) {
        let m = &self.mqtt;
        if m.host.trim().is_empty() {
            errors.push("mqtt.host is empty".into());
        }
        if m.port == 0 {
            errors.push("mqtt.port must be non-zero".into());
        }
        if m.client_id.trim().is_empty() {
            errors.push("mqtt.client_id is empty".into());
        }
        if m.keep_alive_sec < 5 {
            errors.push(format!(
                "mqtt.keep_alive_sec must be at least 5, got {}",
                m.keep_alive_sec
            ));
        }
        if m.password.is_some() && m.username.is_none() {
            errors.push("mqtt.password is set without mqtt.username".into());
        }
    }

    fn validate_topics(&self, errors: &mut Vec<String>) {
        let t = &self.topics;
        let all = [
            ("light_switch", &t.light_switch),
            ("light_state", &t.light_state),
            ("mode", &t.mode),
            ("schedule", &t.schedule),
            ("schedule_key", &t.schedule_key),
            ("sensor", &t.sensor),
            ("data", &t.data),
            ("curtains", &t.curtains),
        ];
        for (name, topic) in all {
            if topic.trim().is_empty() {
                errors.push(format!("topics.{name} is empty"));
            } else if topic.contains(['+', '#']) {
                errors.push(format!(
                    "topics.{name} '{topic}' must not contain MQTT wildcards"
                ));
            }
        }

        // Inbound dispatch is by exact topic, so subscriptions must differ.
        let mut seen: HashSet<&str> = HashSet::new();
        for topic in t.subscriptions() {
            if !topic.is_empty() && !seen.insert(topic) {
                errors.push(format!(
                    "topic '{topic}' is used by more than one subscribed feed"
                ));
            }
        }
    }

    fn validate_control(&self, errors: &mut Vec<String>) {
        let c = &self.control;
        if c.tick_ms == 0 || c.tick_ms > MAX_TICK_MS {
            errors.push(format!(
                "control.tick_ms {} out of range [1, {MAX_TICK_MS}]",
                c.tick_ms
            ));
        }
        if !(0.0..=100.0).contains(&c.default_sensitivity) {
            errors.push(format!(
                "control.default_sensitivity {} out of range [0, 100]",
                c.default_sensitivity
            ));
        }
        if c.max_messages_per_tick == 0 {
            errors.push("control.max_messages_per_tick must be positive".into());
        }
        if c.max_schedule_entries == 0 {
            errors.push("control.max_schedule_entries must be positive".into());
        }
    }

    fn validate_hardware(&self, errors: &mut Vec<String>) {
        let h = &self.hardware;
        if !VALID_GPIO_PINS.contains(&h.light_pin) {
            errors.push(format!(
                "hardware.light_pin {} is not a valid BCM GPIO pin (allowed: 2-27)",
                h.light_pin
            ));
        }
        if let Some(pin) = h.hall_pin {
            if !VALID_GPIO_PINS.contains(&pin) {
                errors.push(format!(
                    "hardware.hall_pin {pin} is not a valid BCM GPIO pin (allowed: 2-27)"
                ));
            } else if pin == h.light_pin {
                errors.push(format!(
                    "hardware.hall_pin {pin} is already used by light_pin"
                ));
            }
        }
        if !ADS1115_ADDRESSES.contains(&h.adc_address) {
            errors.push(format!(
                "hardware.adc_address 0x{:02x} is not an ADS1115 address (0x48-0x4b)",
                h.adc_address
            ));
        }
        if h.light_channel > adc::MAX_CHANNEL {
            errors.push(format!(
                "hardware.light_channel {} out of range [0, {}]",
                h.light_channel,
                adc::MAX_CHANNEL
            ));
        }
    }

    fn validate_remote(&self, errors: &mut Vec<String>) {
        let Some(r) = &self.remote else {
            return;
        };
        if !r.delete_url.starts_with("http://") && !r.delete_url.starts_with("https://") {
            errors.push(format!(
                "remote.delete_url '{}' must be an http(s) URL",
                r.delete_url
            ));
        }
        if !r.delete_url.contains("{key}") {
            errors.push("remote.delete_url must contain a {key} placeholder".into());
        }
        if r.api_key_header.trim().is_empty() {
            errors.push("remote.api_key_header is empty".into());
        }
        if r.timeout_sec == 0 {
            errors.push("remote.timeout_sec must be positive".into());
        }
    }

    /// Apply `MQTT_HOST`, `MQTT_PORT` and `WEB_PORT` on top of the file.
    fn apply_env(&mut self) -> Result<()> {
        if let Ok(host) = env::var("MQTT_HOST") {
            self.mqtt.host = host;
        }
        if let Ok(port) = env::var("MQTT_PORT") {
            self.mqtt.port = port
                .parse()
                .with_context(|| format!("MQTT_PORT is not a port number: {port}"))?;
        }
        if let Ok(port) = env::var("WEB_PORT") {
            self.web.port = port
                .parse()
                .with_context(|| format!("WEB_PORT is not a port number: {port}"))?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file. A missing file yields the
/// defaults, so a bare board runs against a local broker out of the box.
pub fn load(path: &str) -> Result<Config> {
    let mut config = match std::fs::read_to_string(path) {
        Ok(contents) => {
            toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!(path, "config file not found, using defaults");
            Config::default()
        }
        Err(e) => {
            return Err(e).with_context(|| format!("failed to read config: {path}"));
        }
    };
    config.apply_env()?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================
