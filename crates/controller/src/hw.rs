//! Hardware ports and the board that implements them. The `gpio` feature
//! gates the real rppal driver; without it, a simulated light sensor (the
//! default `sim` feature) and a mock output stand in.

use anyhow::Result;

#[cfg(feature = "gpio")]
use anyhow::Context;
#[cfg(feature = "gpio")]
use rppal::gpio::{Gpio, InputPin, OutputPin};
#[cfg(not(feature = "gpio"))]
use tracing::info;

#[cfg(feature = "gpio")]
use crate::adc::Ads1115;
use crate::config::HardwareConfig;
#[cfg(not(feature = "gpio"))]
use crate::sim::{LightSim, Scenario};

// ---------------------------------------------------------------------------
// Ports
// ---------------------------------------------------------------------------

pub trait Actuator {
    fn set_on(&mut self, on: bool);
}

pub trait LightSensor {
    /// Raw reading on a 0–65535 scale.
    fn read_raw(&mut self) -> Result<u16>;
}

pub trait ProximitySensor {
    /// `Some(true)` when the magnet is away (curtains open); `None` when no
    /// sensor is fitted.
    fn is_open(&mut self) -> Result<Option<bool>>;
}

// ---------------------------------------------------------------------------
// Real board (production, requires rppal + Raspberry Pi hardware)
// ---------------------------------------------------------------------------
#[cfg(feature = "gpio")]
pub(crate) struct Board {
    light: OutputPin,
    active_low: bool,
    adc: Ads1115,
    light_channel: usize,
    hall: Option<InputPin>,
}

#[cfg(feature = "gpio")]
impl Board {
    pub(crate) fn new(cfg: &HardwareConfig) -> Result<Self> {
        let gpio = Gpio::new().context("failed to open gpio")?;

        let mut light = gpio
            .get(cfg.light_pin)
            .with_context(|| format!("failed to claim light pin {}", cfg.light_pin))?
            .into_output();
        // Fail-safe: ensure "OFF" at startup
        if cfg.active_low {
            light.set_high();
        } else {
            light.set_low();
        }

        let hall = match cfg.hall_pin {
            Some(pin) => Some(
                gpio.get(pin)
                    .with_context(|| format!("failed to claim hall pin {pin}"))?
                    .into_input_pullup(),
            ),
            None => None,
        };

        let adc = Ads1115::new(cfg.adc_address)?;
        tracing::info!(
            light_pin = cfg.light_pin,
            hall_pin = ?cfg.hall_pin,
            channel = cfg.light_channel,
            "board initialised"
        );

        Ok(Self {
            light,
            active_low: cfg.active_low,
            adc,
            light_channel: cfg.light_channel,
            hall,
        })
    }
}

#[cfg(feature = "gpio")]
impl Actuator for Board {
    fn set_on(&mut self, on: bool) {
        // active-low: LOW = ON, HIGH = OFF
        if on != self.active_low {
            self.light.set_high();
        } else {
            self.light.set_low();
        }
        tracing::debug!(on, "light output set");
    }
}

#[cfg(feature = "gpio")]
impl LightSensor for Board {
    fn read_raw(&mut self) -> Result<u16> {
        let raw = self.adc.read_channel(self.light_channel)?;
        Ok(crate::adc::to_full_scale(raw))
    }
}

#[cfg(feature = "gpio")]
impl ProximitySensor for Board {
    fn is_open(&mut self) -> Result<Option<bool>> {
        // Magnet present pulls the line low: curtains closed.
        Ok(self.hall.as_ref().map(InputPin::is_high))
    }
}

// ---------------------------------------------------------------------------
// Simulated board (development, no hardware, logs output changes)
// ---------------------------------------------------------------------------
#[cfg(not(feature = "gpio"))]
pub(crate) struct Board {
    pub(super) on: bool,
    sim: LightSim,
    curtain_open: Option<bool>,
}

#[cfg(not(feature = "gpio"))]
impl Board {
    pub(crate) fn new(cfg: &HardwareConfig) -> Result<Self> {
        let scenario = Scenario::from_str_lossy(&std::env::var("SIM_SCENARIO").unwrap_or_default());
        let day_secs: f64 = std::env::var("SIM_DAY_SECONDS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(600.0);

        info!(
            light_pin = cfg.light_pin,
            hall_pin = ?cfg.hall_pin,
            %scenario,
            day_secs,
            "[mock-gpio] board initialised (no hardware)"
        );
        Ok(Self {
            on: false,
            sim: LightSim::new(scenario, day_secs),
            curtain_open: cfg.hall_pin.map(|_| true),
        })
    }
}

#[cfg(not(feature = "gpio"))]
impl Actuator for Board {
    fn set_on(&mut self, on: bool) {
        if self.on != on {
            info!("[mock-gpio] light set {}", if on { "ON" } else { "OFF" });
        }
        self.on = on;
    }
}

#[cfg(not(feature = "gpio"))]
impl LightSensor for Board {
    fn read_raw(&mut self) -> Result<u16> {
        Ok(self.sim.sample())
    }
}

#[cfg(not(feature = "gpio"))]
impl ProximitySensor for Board {
    fn is_open(&mut self) -> Result<Option<bool>> {
        Ok(self.curtain_open)
    }
}

// ---------------------------------------------------------------------------
// Test double
// ---------------------------------------------------------------------------


// ===========================================================================
// Tests
// ===========================================================================
