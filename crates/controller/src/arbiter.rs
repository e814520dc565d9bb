//! Mode arbiter: decides the light from the light level while in auto mode.
//!
//! Every actuator change, whatever its cause, goes through [`drive`] so the
//! physical output, `actuator_on` and `last_reported_on` never disagree.

use tracing::info;

use crate::hw::Actuator;
use crate::state::{ControlState, Mode};

/// Why the light changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandSource {
    Auto,
    Remote,
    Schedule,
    Shutdown,
}

impl CommandSource {
    fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Remote => "remote",
            Self::Schedule => "schedule",
            Self::Shutdown => "shutdown",
        }
    }
}

/// A light transition that observers must hear about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Command {
    pub on: bool,
    pub source: CommandSource,
}

/// Reconcile the light against `light_level`. Emits a command only in auto
/// mode and only when the desired state differs from the last one reported.
pub fn reconcile(
    state: &mut ControlState,
    light_level: f32,
    actuator: &mut impl Actuator,
) -> Option<Command> {
    if state.mode == Mode::Manual {
        return None;
    }

    let desired = light_level < state.sensitivity;
    if state.last_reported_on == Some(desired) {
        return None;
    }

    info!(
        light_level,
        sensitivity = state.sensitivity,
        on = desired,
        "arbiter: light level crossed sensitivity"
    );
    Some(drive(state, desired, CommandSource::Auto, actuator))
}

/// Set the light and record it as reported.
pub(crate) fn drive(
    state: &mut ControlState,
    on: bool,
    source: CommandSource,
    actuator: &mut impl Actuator,
) -> Command {
    actuator.set_on(on);
    state.actuator_on = on;
    state.last_reported_on = Some(on);
    state.record_actuator(on, source.as_str());
    Command { on, source }
}

// ===========================================================================
// Tests
// ===========================================================================
