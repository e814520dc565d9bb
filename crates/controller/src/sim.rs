//! Stateful photo-resistor simulator for local development.
//!
//! Models a light sensor on a window sill:
//! - Diurnal (day/night) cycle
//! - Temporal coherence via random walk with mean reversion
//! - Per-reading electronic noise
//! - Occasional shadows (someone walks past)

use std::fmt;

// ---------------------------------------------------------------------------
// Gaussian approximation (no extra dependency)
// ---------------------------------------------------------------------------

/// Approximate a sample from N(0,1) using the Irwin-Hall method:
/// sum of 12 uniform [0,1) values minus 6.
fn approx_std_normal() -> f64 {
    let mut sum: f64 = 0.0;
    for _ in 0..12 {
        sum += fastrand::f64();
    }
    sum - 6.0
}

fn gaussian(mean: f64, sigma: f64) -> f64 {
    mean + sigma * approx_std_normal()
}

// ---------------------------------------------------------------------------
// Scenario presets
// ---------------------------------------------------------------------------

/// Simulation profiles selectable via the `SIM_SCENARIO` env var.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// Full day/night swing. Crosses any mid-range sensitivity twice a day.
    Diurnal,
    /// Bright room, little variation. The light should stay off.
    Bright,
    /// Dark room, little variation. The light should stay on.
    Dark,
    /// Diurnal swing with heavy noise and frequent shadows.
    Flaky,
}

impl Scenario {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "bright" => Self::Bright,
            "dark" => Self::Dark,
            "flaky" => Self::Flaky,
            _ => Self::Diurnal, // default
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Diurnal => write!(f, "diurnal"),
            Self::Bright => write!(f, "bright"),
            Self::Dark => write!(f, "dark"),
            Self::Flaky => write!(f, "flaky"),
        }
    }
}

// ---------------------------------------------------------------------------
// Simulator
// ---------------------------------------------------------------------------

/// Produces raw 16-bit light readings.
pub struct LightSim {
    /// Current "true" light level, in raw units. Evolves each sample.
    base: f64,
    center: f64,
    amplitude: f64,
    walk_sigma: f64,
    mean_reversion: f64,
    noise_sigma: f64,
    shadow_prob: f32,
    period_s: f64,
}

impl LightSim {
    /// `period_s` is the length of a simulated day. Use 600 for fast dev
    /// iteration or 86400 for real time.
    pub fn new(scenario: Scenario, period_s: f64) -> Self {
        let full = f64::from(u16::MAX);
        let (center_frac, amp_frac, walk, mean_rev, noise, shadow) = match scenario {
            Scenario::Diurnal => (0.5, 0.4, 300.0, 0.05, 200.0, 0.01_f32),
            Scenario::Bright => (0.85, 0.05, 150.0, 0.1, 100.0, 0.005),
            Scenario::Dark => (0.1, 0.03, 100.0, 0.1, 80.0, 0.0),
            Scenario::Flaky => (0.5, 0.4, 800.0, 0.03, 1500.0, 0.08),
        };
        let center = full * center_frac;

        Self {
            base: center,
            center,
            amplitude: full * amp_frac,
            walk_sigma: walk,
            mean_reversion: mean_rev,
            noise_sigma: noise,
            shadow_prob: shadow,
            period_s: period_s.max(1.0),
        }
    }

    /// Next reading, using wall-clock time for the day/night phase.
    pub fn sample(&mut self) -> u16 {
        let now_s = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64();
        self.sample_at(now_s)
    }

    /// Next reading at simulated time `t_s` (seconds).
    pub fn sample_at(&mut self, t_s: f64) -> u16 {
        let phase = 2.0 * std::f64::consts::PI * t_s / self.period_s;
        let target = self.center + self.amplitude * phase.sin();

        // Mean reversion toward the diurnal target plus a random walk step.
        let pull = self.mean_reversion * (target - self.base);
        self.base = (self.base + pull + gaussian(0.0, self.walk_sigma))
            .clamp(0.0, f64::from(u16::MAX));

        let shadow = if fastrand::f32() < self.shadow_prob {
            -self.base * 0.5
        } else {
            0.0
        };
        let reading = self.base + gaussian(0.0, self.noise_sigma) + shadow;
        reading.round().clamp(0.0, f64::from(u16::MAX)) as u16
    }
}

// ===========================================================================
// Tests
// ===========================================================================
