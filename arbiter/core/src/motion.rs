//! Motion Translator
//!
//! Pure translation from semantic movement commands to the motor directives
//! the brick understands. Nothing here touches the hardware: every operation
//! returns a list of [`MotorDirective`]s that the action executor forwards to
//! the driver verbatim.
//!
//! # Differential Steering
//!
//! ```text
//!   ratio < 0            ratio = 0            ratio > 0
//!  left  = speed        left  = speed         left  = speed * r
//!  right = speed * |r|  right = speed         right = speed
//!   (curves right)       (straight)           (curves left)
//! ```
//!
//! # Precise Rotation
//!
//! The calibration factor converts a requested body rotation (degrees) into
//! the wheel's native rotation units. The named wheel runs backward and its
//! partner forward by the same unit count, spinning the vehicle in place.

use std::fmt;
use std::str::FromStr;

use rand::distributions::Open01;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Highest power magnitude accepted by the brick
pub const MAX_SPEED: u8 = 100;

/// Native units per requested degree of body rotation (measured)
pub const DEFAULT_CALIBRATION_FACTOR: f64 = 5.40;

/// Native units for one full cycle of the shooter mechanism
pub const SHOOT_UNITS: u32 = 360;

/// Slowest speed a dance step may pick
pub const DANCE_MIN_SPEED: u8 = 60;

/// Fastest speed a dance step may pick
pub const DANCE_MAX_SPEED: u8 = 100;

/// Errors raised while translating a command
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MotionError {
    /// Speed above [`MAX_SPEED`]
    #[error("speed {0} exceeds the maximum of 100")]
    SpeedOutOfRange(u8),

    /// Steering ratio outside [-1, 1]
    #[error("turn ratio {0} must be between -1 and 1")]
    RatioOutOfRange(f64),

    /// Precise turn angle that is not a positive finite number
    #[error("rotation of {0} degrees is not a positive angle")]
    InvalidDegrees(f64),

    /// Pivot turn requested on a channel without a drive partner
    #[error("channel '{0}' has no pivot partner")]
    NoPivotPartner(Channel),

    /// Channel has no port mapped in the motor configuration
    #[error("channel '{0}' is not mapped to a port")]
    ChannelUnmapped(Channel),

    /// Command needs a direction or channel and none was given
    #[error("'{0}' requires a direction")]
    MissingDirection(&'static str),

    /// Direction string was not forward/backward
    #[error("unknown direction '{0}'")]
    UnknownDirection(String),

    /// Channel string was not left/right/aux
    #[error("unknown channel '{0}'")]
    UnknownChannel(String),

    /// Port string was not A/B/C
    #[error("unknown port '{0}'")]
    UnknownPort(String),

    /// Two channels mapped onto the same port
    #[error("port {port} is mapped to both '{first}' and '{second}'")]
    DuplicatePort {
        /// The shared port
        port: Port,
        /// First channel using it
        first: Channel,
        /// Second channel using it
        second: Channel,
    },
}

/// Logical motor role on the vehicle
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    /// Left drive wheel
    Left,
    /// Right drive wheel
    Right,
    /// Auxiliary motor driving the shooter
    Aux,
}

impl Channel {
    /// Wire name of the channel
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Left => "left",
            Self::Right => "right",
            Self::Aux => "aux",
        }
    }

    /// The opposite drive channel used as a pivot partner
    #[must_use]
    pub fn pivot_partner(self) -> Option<Self> {
        match self {
            Self::Left => Some(Self::Right),
            Self::Right => Some(Self::Left),
            Self::Aux => None,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Channel {
    type Err = MotionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "left" => Ok(Self::Left),
            "right" => Ok(Self::Right),
            "aux" => Ok(Self::Aux),
            _ => Err(MotionError::UnknownChannel(s.to_string())),
        }
    }
}

/// Drive direction for straight and steered moves
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Drive forward
    Forward,
    /// Drive backward (speed negated)
    Backward,
}

impl FromStr for Direction {
    type Err = MotionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "forward" | "fwd" => Ok(Self::Forward),
            "backward" | "bwd" => Ok(Self::Backward),
            _ => Err(MotionError::UnknownDirection(s.to_string())),
        }
    }
}

/// Physical output port on the brick
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Port {
    /// Output A
    #[serde(alias = "a")]
    A,
    /// Output B
    #[serde(alias = "b")]
    B,
    /// Output C
    #[serde(alias = "c")]
    C,
}

impl Port {
    /// Port number used on the wire
    #[must_use]
    pub fn number(self) -> u8 {
        match self {
            Self::A => 1,
            Self::B => 2,
            Self::C => 3,
        }
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let letter = match self {
            Self::A => "A",
            Self::B => "B",
            Self::C => "C",
        };
        f.write_str(letter)
    }
}

impl FromStr for Port {
    type Err = MotionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "A" => Ok(Self::A),
            "B" => Ok(Self::B),
            "C" => Ok(Self::C),
            _ => Err(MotionError::UnknownPort(s.to_string())),
        }
    }
}

/// Channel-to-port mapping, fixed at startup
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MotorConfig {
    /// Port driving the left wheel
    pub left: Port,
    /// Port driving the right wheel
    pub right: Port,
    /// Port driving the shooter (optional on drive-only builds)
    pub aux: Option<Port>,
}

impl Default for MotorConfig {
    fn default() -> Self {
        Self {
            left: Port::A,
            right: Port::B,
            aux: Some(Port::C),
        }
    }
}

impl MotorConfig {
    /// Resolve a channel to its port
    #[must_use]
    pub fn port(&self, channel: Channel) -> Option<Port> {
        match channel {
            Channel::Left => Some(self.left),
            Channel::Right => Some(self.right),
            Channel::Aux => self.aux,
        }
    }

    /// Check that no two channels share a port
    ///
    /// # Errors
    ///
    /// Returns [`MotionError::DuplicatePort`] for the first collision found.
    pub fn validate(&self) -> Result<(), MotionError> {
        let mapped: Vec<(Channel, Port)> = [Channel::Left, Channel::Right, Channel::Aux]
            .into_iter()
            .filter_map(|ch| self.port(ch).map(|p| (ch, p)))
            .collect();

        for (i, (first, port)) in mapped.iter().enumerate() {
            if let Some((second, _)) = mapped[i + 1..].iter().find(|(_, p)| p == port) {
                return Err(MotionError::DuplicatePort {
                    port: *port,
                    first: *first,
                    second: *second,
                });
            }
        }
        Ok(())
    }
}

/// Motor regulation mode
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MotorMode {
    /// Run at a set power until told otherwise (or for a unit count)
    ContinuousRotation,
}

impl MotorMode {
    /// Mode byte sent to the brick
    #[must_use]
    pub fn code(self) -> u8 {
        match self {
            Self::ContinuousRotation => 32,
        }
    }
}

/// A single set-power instruction for one port
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MotorDirective {
    /// Target port
    pub port: Port,
    /// Regulation mode
    pub mode: MotorMode,
    /// Signed power, -100..=100
    pub power: i8,
    /// Rotation limit in native units (None = run until stopped)
    pub target_units: Option<u32>,
}

impl MotorDirective {
    /// Run a port continuously at the given power
    #[must_use]
    pub fn run(port: Port, power: i8) -> Self {
        Self {
            port,
            mode: MotorMode::ContinuousRotation,
            power,
            target_units: None,
        }
    }

    /// Run a port for a fixed number of native units
    #[must_use]
    pub fn rotate(port: Port, power: i8, target_units: u32) -> Self {
        Self {
            port,
            mode: MotorMode::ContinuousRotation,
            power,
            target_units: Some(target_units),
        }
    }
}

/// Semantic movement command issued by the current holder
#[derive(Clone, Debug, PartialEq)]
pub enum MovementCommand {
    /// Straight or proportionally steered drive
    Move {
        /// Forward or backward
        direction: Direction,
        /// Power magnitude
        speed: u8,
        /// Optional steering ratio in [-1, 1]
        ratio: Option<f64>,
    },
    /// Pivot about the vehicle's center
    Turn {
        /// Channel driven forward
        channel: Channel,
        /// Power magnitude
        speed: u8,
    },
    /// In-place spin by approximately the requested angle
    PreciseTurn {
        /// Channel driven backward
        channel: Channel,
        /// Power magnitude
        speed: u8,
        /// Requested body rotation
        degrees: f64,
    },
    /// One full shooter cycle
    Shoot {
        /// Power magnitude
        speed: u8,
    },
    /// Random choreography until stopped
    Dance,
}

impl MovementCommand {
    /// Action type name used in audit messages
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Move { .. } => "move",
            Self::Turn { .. } => "turn",
            Self::PreciseTurn { .. } => "precise-turn",
            Self::Shoot { .. } => "shoot",
            Self::Dance => "dance",
        }
    }
}

/// Converts movement commands into motor directives
#[derive(Clone, Debug)]
pub struct MotionTranslator {
    motors: MotorConfig,
    calibration_factor: f64,
}

impl MotionTranslator {
    /// Create a translator for a motor layout and calibration
    #[must_use]
    pub fn new(motors: MotorConfig, calibration_factor: f64) -> Self {
        Self {
            motors,
            calibration_factor,
        }
    }

    /// The motor layout this translator targets
    #[must_use]
    pub fn motors(&self) -> &MotorConfig {
        &self.motors
    }

    /// Translate any one-shot command
    ///
    /// `Dance` yields a single choreography step; the executor repeats it.
    ///
    /// # Errors
    ///
    /// Returns a [`MotionError`] if the command's parameters are invalid.
    pub fn translate(&self, command: &MovementCommand) -> Result<Vec<MotorDirective>, MotionError> {
        match *command {
            MovementCommand::Move {
                direction,
                speed,
                ratio,
            } => self.drive(direction, speed, ratio),
            MovementCommand::Turn { channel, speed } => self.turn(channel, speed),
            MovementCommand::PreciseTurn {
                channel,
                speed,
                degrees,
            } => self.precise_turn(channel, speed, degrees),
            MovementCommand::Shoot { speed } => self.shoot(speed),
            MovementCommand::Dance => Ok(self.dance_step(&mut rand::thread_rng())),
        }
    }

    /// Straight or steered drive on both wheels
    ///
    /// # Errors
    ///
    /// Fails on speed above [`MAX_SPEED`] or a ratio outside [-1, 1].
    pub fn drive(
        &self,
        direction: Direction,
        speed: u8,
        ratio: Option<f64>,
    ) -> Result<Vec<MotorDirective>, MotionError> {
        let base = signed_power(speed)?;
        let base = match direction {
            Direction::Forward => base,
            Direction::Backward => -base,
        };

        let (left, right) = match ratio {
            Some(r) if !(-1.0..=1.0).contains(&r) => {
                return Err(MotionError::RatioOutOfRange(r));
            }
            Some(r) if r < 0.0 => (base, scale(base, r.abs())),
            Some(r) if r > 0.0 => (scale(base, r), base),
            _ => (base, base),
        };

        Ok(vec![
            MotorDirective::run(self.motors.left, left),
            MotorDirective::run(self.motors.right, right),
        ])
    }

    /// Pivot turn: the named wheel forward, its partner backward
    ///
    /// # Errors
    ///
    /// Fails on speed above [`MAX_SPEED`] or a channel without a partner.
    pub fn turn(&self, channel: Channel, speed: u8) -> Result<Vec<MotorDirective>, MotionError> {
        let power = signed_power(speed)?;
        let (named, partner) = self.drive_pair(channel)?;

        Ok(vec![
            MotorDirective::run(named, power),
            MotorDirective::run(partner, -power),
        ])
    }

    /// In-place spin of approximately `degrees`
    ///
    /// # Errors
    ///
    /// Fails on speed above [`MAX_SPEED`], a non-positive angle, or a
    /// channel without a partner.
    pub fn precise_turn(
        &self,
        channel: Channel,
        speed: u8,
        degrees: f64,
    ) -> Result<Vec<MotorDirective>, MotionError> {
        let power = signed_power(speed)?;
        if !degrees.is_finite() || degrees <= 0.0 {
            return Err(MotionError::InvalidDegrees(degrees));
        }
        let (named, partner) = self.drive_pair(channel)?;
        let units = self.target_units(degrees);

        Ok(vec![
            MotorDirective::rotate(partner, power, units),
            MotorDirective::rotate(named, -power, units),
        ])
    }

    /// One shooter cycle on the aux channel
    ///
    /// # Errors
    ///
    /// Fails on speed above [`MAX_SPEED`] or when no aux port is mapped.
    pub fn shoot(&self, speed: u8) -> Result<Vec<MotorDirective>, MotionError> {
        let power = signed_power(speed)?;
        let aux = self
            .motors
            .port(Channel::Aux)
            .ok_or(MotionError::ChannelUnmapped(Channel::Aux))?;

        Ok(vec![MotorDirective::rotate(aux, power, SHOOT_UNITS)])
    }

    /// Zero both drive wheels
    #[must_use]
    pub fn stop(&self) -> Vec<MotorDirective> {
        vec![
            MotorDirective::run(self.motors.left, 0),
            MotorDirective::run(self.motors.right, 0),
        ]
    }

    /// One dance step: stop, then a random steered move
    pub fn dance_step<R: Rng + ?Sized>(&self, rng: &mut R) -> Vec<MotorDirective> {
        let direction = if rng.gen_bool(0.5) {
            Direction::Forward
        } else {
            Direction::Backward
        };
        let open: f64 = rng.sample(Open01);
        let ratio = open * 2.0 - 1.0;
        let speed = rng.gen_range(DANCE_MIN_SPEED..=DANCE_MAX_SPEED);

        let mut directives = self.stop();
        // speed and ratio are in range by construction
        if let Ok(step) = self.drive(direction, speed, Some(ratio)) {
            directives.extend(step);
        }
        directives
    }

    /// Native units for a requested body rotation
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn target_units(&self, degrees: f64) -> u32 {
        (degrees * self.calibration_factor).round().max(0.0) as u32
    }

    fn drive_pair(&self, channel: Channel) -> Result<(Port, Port), MotionError> {
        let partner = channel
            .pivot_partner()
            .ok_or(MotionError::NoPivotPartner(channel))?;
        let named = self
            .motors
            .port(channel)
            .ok_or(MotionError::ChannelUnmapped(channel))?;
        let partner = self
            .motors
            .port(partner)
            .ok_or(MotionError::ChannelUnmapped(partner))?;
        Ok((named, partner))
    }
}

impl Default for MotionTranslator {
    fn default() -> Self {
        Self::new(MotorConfig::default(), DEFAULT_CALIBRATION_FACTOR)
    }
}

fn signed_power(speed: u8) -> Result<i8, MotionError> {
    if speed > MAX_SPEED {
        return Err(MotionError::SpeedOutOfRange(speed));
    }
    i8::try_from(speed).map_err(|_| MotionError::SpeedOutOfRange(speed))
}

#[allow(clippy::cast_possible_truncation)]
fn scale(power: i8, factor: f64) -> i8 {
    (f64::from(power) * factor).round() as i8
}
