use super::{Device, DeviceCore, DeviceType};
use crate::datapoint::{DataPointSet, DpValue};
use crate::discovery::EntityDiscovery;
use crate::mapper::{CommandError, StateMessage};
use crate::registry::{EntityKind, ValueDomain};

/// The DP used both to command the motor and to report what it is doing.
pub const MOTION_DP: &str = "1";

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, strum::Display, strum::IntoStaticStr, strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
pub enum CoverState {
    Unknown,
    Opening,
    Open,
    Closing,
    Closed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display, strum::IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
}

/// The values of the motion DP.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, strum::Display, strum::IntoStaticStr, strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
pub enum CoverSignal {
    Open,
    Close,
    Stop,
}

impl CoverSignal {
    /// The signal that brings the cover into the requested state.
    ///
    /// Both imperative (`close`) and descriptive (`closed`, `closing`) forms are accepted.
    pub fn for_state(state: &str) -> Option<Self> {
        match state {
            "open" | "opening" => Some(CoverSignal::Open),
            "close" | "closed" | "closing" => Some(CoverSignal::Close),
            "stop" => Some(CoverSignal::Stop),
            _ => None,
        }
    }

    /// The signal that moves the cover from `current` towards `target`.
    pub fn for_position(target: u8, current: u8) -> Self {
        match target.cmp(&current) {
            std::cmp::Ordering::Less => CoverSignal::Open,
            std::cmp::Ordering::Greater => CoverSignal::Close,
            std::cmp::Ordering::Equal => CoverSignal::Stop,
        }
    }

    fn observed(delta: &DataPointSet) -> Option<Self> {
        delta.get(MOTION_DP)?.as_str()?.parse().ok()
    }
}

/// Estimated motion state of a cover.
///
/// The motor only reports the last command it executed, so the state and the position are
/// inferred from the sequence of commands seen.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CoverRuntime {
    pub state: CoverState,
    pub last_move: Direction,
    /// 0 is fully open, 100 is fully closed.
    pub position: u8,
}

impl Default for CoverRuntime {
    fn default() -> Self {
        Self {
            state: CoverState::Unknown,
            last_move: Direction::Up,
            position: CoverRuntime::POSITION_UNKNOWN,
        }
    }
}

impl CoverRuntime {
    pub const POSITION_OPEN: u8 = 0;
    pub const POSITION_CLOSED: u8 = 100;
    pub const POSITION_UNKNOWN: u8 = 50;

    pub fn advanced(self, signal: CoverSignal) -> Self {
        let (state, last_move) = match signal {
            CoverSignal::Open => (CoverState::Opening, Direction::Up),
            CoverSignal::Close => (CoverState::Closing, Direction::Down),
            CoverSignal::Stop => match self.last_move {
                Direction::Up => (CoverState::Open, Direction::Up),
                Direction::Down => (CoverState::Closed, Direction::Down),
            },
        };
        Self { state, last_move, position: Self::position_of(state, last_move) }
    }

    /// The runtime after observing a data point update. Updates without a motion signal leave
    /// the runtime unchanged.
    pub fn observed(self, delta: &DataPointSet) -> Self {
        match CoverSignal::observed(delta) {
            Some(signal) => self.advanced(signal),
            None => self,
        }
    }

    fn position_of(state: CoverState, last_move: Direction) -> u8 {
        match (state, last_move) {
            (CoverState::Open, _) => Self::POSITION_OPEN,
            (CoverState::Closed, _) => Self::POSITION_CLOSED,
            (CoverState::Unknown, _) => Self::POSITION_UNKNOWN,
            (_, Direction::Up) => Self::POSITION_OPEN,
            (_, Direction::Down) => Self::POSITION_CLOSED,
        }
    }
}

pub struct Cover {
    core: DeviceCore,
    runtime: CoverRuntime,
}

impl Cover {
    pub fn new(core: DeviceCore) -> Self {
        Self { core, runtime: CoverRuntime::default() }
    }

    pub fn runtime(&self) -> CoverRuntime {
        self.runtime
    }

    pub fn send(&self, signal: CoverSignal) {
        let signal: &'static str = signal.into();
        self.core.write(DataPointSet::from([(MOTION_DP.to_string(), DpValue::from(signal))]));
    }

    pub fn set_position(&self, target: u8) {
        self.send(CoverSignal::for_position(target, self.runtime.position))
    }
}

impl Device for Cover {
    fn core(&self) -> &DeviceCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut DeviceCore {
        &mut self.core
    }

    fn device_type(&self) -> DeviceType {
        DeviceType::Cover
    }

    fn root_entity(&self) -> EntityKind {
        EntityKind::Cover
    }

    fn model(&self) -> Option<&'static str> {
        Some("Cover")
    }

    fn on_kind_update(&mut self, delta: &DataPointSet) {
        let runtime = self.runtime.observed(delta);
        if runtime != self.runtime {
            tracing::debug!(
                device = %self.core.identity().sanitized_name,
                state = %runtime.state,
                position = runtime.position,
                "cover moved"
            );
        }
        self.runtime = runtime;
    }

    fn kind_state(&self, delta: Option<&DataPointSet>, message: &mut StateMessage) {
        // Applying a delta that has already been observed is a no-op, so this is also correct
        // for the delta that was just merged.
        let runtime = delta.map_or(self.runtime, |delta| self.runtime.observed(delta));
        message.insert("state".into(), runtime.state.to_string().into());
        message.insert("position".into(), runtime.position.into());
        message.insert("last_move".into(), runtime.last_move.to_string().into());
    }

    fn adjust_root_entity(&self, topic: &str, entity: &mut EntityDiscovery) {
        entity.position_topic = Some(format!("{topic}/position"));
        entity.set_position_topic = Some(format!("{topic}/set_position"));
        entity.position_open = Some(CoverRuntime::POSITION_OPEN);
        entity.position_closed = Some(CoverRuntime::POSITION_CLOSED);
        entity.optimistic = Some(true);
    }

    fn kind_command(&self, command: &str, argument: &str) -> Result<bool, CommandError> {
        match command {
            "command" | "set" => {
                let state = argument.trim().to_lowercase();
                let signal = CoverSignal::for_state(&state)
                    .ok_or_else(|| CommandError::UnknownCoverCommand(argument.trim().to_string()))?;
                self.send(signal);
                Ok(true)
            }
            "set_position" => {
                let target = argument.trim().parse::<i64>().map_err(|_| {
                    CommandError::MalformedArgument(command.to_string(), argument.to_string())
                })?;
                let valid = i64::from(CoverRuntime::POSITION_OPEN)
                    ..=i64::from(CoverRuntime::POSITION_CLOSED);
                if !valid.contains(&target) {
                    return Err(CommandError::OutOfRange(
                        command.to_string(),
                        target,
                        ValueDomain::Range { min: *valid.start(), max: *valid.end() },
                    ));
                }
                self.set_position(target as u8);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
