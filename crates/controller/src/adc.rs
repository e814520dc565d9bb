//! ADS1115 16-bit ADC over I2C, reading the photo-resistor divider.
//!
//! Single-ended channels at PGA ±4.096 V, 128 SPS, single-shot mode. The
//! register arithmetic is always compiled; the driver needs the `gpio`
//! feature.

#![cfg_attr(not(feature = "gpio"), allow(dead_code))]

#[cfg(feature = "gpio")]
use rppal::i2c::I2c;
#[cfg(feature = "gpio")]
use std::thread;
use std::time::Duration;

// ── ADS1115 register addresses ──────────────────────────────────────────────

/// Conversion result register (read-only, 16-bit signed).
const REG_CONVERSION: u8 = 0x00;
/// Configuration register (read/write).
const REG_CONFIG: u8 = 0x01;

// ── Config register bit fields ──────────────────────────────────────────────
//
// Layout (MSB first):
//   [15] OS: write 1 to start single-shot conversion
//   [14:12] MUX: input multiplexer (channel selection)
//   [11:9] PGA: programmable gain amplifier
//   [8] MODE: 0 = continuous, 1 = single-shot
//   [7:5] DR: data rate
//   [1:0] COMP_QUE: 11 = disable comparator

/// OS=1 (start), PGA=001 (±4.096 V), MODE=1 (single-shot),
/// DR=100 (128 SPS), COMP_QUE=11 (comparator off).
const CONFIG_BASE: u16 = 0b1_000_001_1_100_0_0_0_11;

const MUX_SHIFT: u8 = 12;
/// AIN0..AIN3 against GND.
const MUX_SINGLE_ENDED: [u16; 4] = [0b100, 0b101, 0b110, 0b111];

pub const MAX_CHANNEL: usize = 3;

/// Largest single-ended conversion result.
const ADS1115_MAX: i16 = i16::MAX;

/// Conversion time at 128 SPS is ~7.8 ms.
const CONVERSION_WAIT: Duration = Duration::from_millis(9);

/// Bit 15 of the config register: conversion-ready flag when read.
const OS_READY_BIT: u16 = 1 << 15;

fn config_for_channel(channel: usize) -> u16 {
    CONFIG_BASE | (MUX_SINGLE_ENDED[channel] << MUX_SHIFT)
}

/// Scale a 15-bit single-ended result onto the 0–65535 range the light
/// normalisation expects. Negative results (bus noise) clamp to zero.
pub fn to_full_scale(raw: i16) -> u16 {
    let clamped = raw.clamp(0, ADS1115_MAX) as u32;
    (clamped * u32::from(u16::MAX) / ADS1115_MAX as u32) as u16
}

// ── Driver ──────────────────────────────────────────────────────────────────

#[cfg(feature = "gpio")]
pub struct Ads1115 {
    i2c: I2c,
}

#[cfg(feature = "gpio")]
impl Ads1115 {
    /// Open I2C bus 1 and address the ADS1115 at `addr`.
    pub fn new(addr: u16) -> anyhow::Result<Self> {
        let mut i2c = I2c::new()?;
        i2c.set_slave_address(addr)?;
        tracing::info!(addr = format_args!("0x{addr:02x}"), "ads1115 initialised");
        Ok(Self { i2c })
    }

    /// Single-shot read on `channel`.
    pub fn read_channel(&mut self, channel: usize) -> anyhow::Result<i16> {
        anyhow::ensure!(
            channel <= MAX_CHANNEL,
            "ADS1115 channel {channel} out of range (0–{MAX_CHANNEL})"
        );
        self.i2c
            .block_write(REG_CONFIG, &config_for_channel(channel).to_be_bytes())?;
        thread::sleep(CONVERSION_WAIT);

        for _ in 0..3 {
            let mut buf = [0u8; 2];
            self.i2c.block_read(REG_CONFIG, &mut buf)?;
            if u16::from_be_bytes(buf) & OS_READY_BIT != 0 {
                break;
            }
            thread::sleep(Duration::from_millis(2));
        }

        let mut buf = [0u8; 2];
        self.i2c.block_read(REG_CONVERSION, &mut buf)?;
        Ok(i16::from_be_bytes(buf))
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
