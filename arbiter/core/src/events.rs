//! Operator Events
//!
//! Events sent from operator surfaces to the arbiter. Surfaces report what
//! the operator asked for; the arbiter decides whether it is allowed and what
//! the motors should do.
//!
//! ```json
//! {"event":"register","displayName":"Alice"}
//! {"event":"action-start","type":"move","direction":"forward","speed":80,"ratio":-0.5}
//! {"event":"action-stop"}
//! ```
//!
//! Socket close is the implicit `disconnect`; it has no frame of its own.

use serde::{Deserialize, Serialize};

use crate::motion::{Channel, Direction, MotionError, MovementCommand, MAX_SPEED};

/// Events from operator surface to arbiter
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum InboundEvent {
    /// Claim a display name and join the turn queue
    Register {
        /// Requested display name
        #[serde(rename = "displayName", alias = "username")]
        display_name: String,
    },

    /// Ask the bot to do something
    ActionStart(ActionRequest),

    /// Stop whatever the bot is doing
    ActionStop,
}

/// Kind of action requested
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionKind {
    /// Straight or steered drive
    Move,
    /// Pivot turn
    Turn,
    /// Angle-limited spin
    #[serde(alias = "preciseTurn", alias = "turnPrecise")]
    PreciseTurn,
    /// Fire the shooter
    Shoot,
    /// Random choreography
    Dance,
}

/// Raw `action-start` payload as sent by a surface
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActionRequest {
    /// Action kind
    #[serde(rename = "type")]
    pub kind: ActionKind,
    /// `forward`/`backward` for moves, a channel name for turns
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direction: Option<String>,
    /// Power magnitude, 0..=100
    #[serde(default = "default_speed")]
    pub speed: u8,
    /// Steering ratio for moves
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ratio: Option<f64>,
    /// Rotation angle for precise turns
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub degrees: Option<f64>,
}

fn default_speed() -> u8 {
    MAX_SPEED
}

impl ActionRequest {
    /// A request of the given kind with default speed and no parameters
    #[must_use]
    pub fn new(kind: ActionKind) -> Self {
        Self {
            kind,
            direction: None,
            speed: default_speed(),
            ratio: None,
            degrees: None,
        }
    }

    /// Set the direction or channel
    #[must_use]
    pub fn with_direction(mut self, direction: impl Into<String>) -> Self {
        self.direction = Some(direction.into());
        self
    }

    /// Set the speed
    #[must_use]
    pub fn with_speed(mut self, speed: u8) -> Self {
        self.speed = speed;
        self
    }

    /// Set the steering ratio
    #[must_use]
    pub fn with_ratio(mut self, ratio: f64) -> Self {
        self.ratio = Some(ratio);
        self
    }

    /// Set the rotation angle
    #[must_use]
    pub fn with_degrees(mut self, degrees: f64) -> Self {
        self.degrees = Some(degrees);
        self
    }

    fn required_direction(&self, what: &'static str) -> Result<&str, MotionError> {
        self.direction
            .as_deref()
            .ok_or(MotionError::MissingDirection(what))
    }
}

impl TryFrom<&ActionRequest> for MovementCommand {
    type Error = MotionError;

    fn try_from(request: &ActionRequest) -> Result<Self, Self::Error> {
        if request.speed > MAX_SPEED {
            return Err(MotionError::SpeedOutOfRange(request.speed));
        }

        let command = match request.kind {
            ActionKind::Move => {
                let direction: Direction = request.required_direction("move")?.parse()?;
                if let Some(r) = request.ratio {
                    if !(-1.0..=1.0).contains(&r) {
                        return Err(MotionError::RatioOutOfRange(r));
                    }
                }
                MovementCommand::Move {
                    direction,
                    speed: request.speed,
                    ratio: request.ratio,
                }
            }
            ActionKind::Turn => {
                let channel = pivot_channel(request.required_direction("turn")?)?;
                MovementCommand::Turn {
                    channel,
                    speed: request.speed,
                }
            }
            ActionKind::PreciseTurn => {
                let channel = pivot_channel(request.required_direction("precise-turn")?)?;
                let degrees = request.degrees.unwrap_or(0.0);
                if !degrees.is_finite() || degrees <= 0.0 {
                    return Err(MotionError::InvalidDegrees(degrees));
                }
                MovementCommand::PreciseTurn {
                    channel,
                    speed: request.speed,
                    degrees,
                }
            }
            ActionKind::Shoot => MovementCommand::Shoot {
                speed: request.speed,
            },
            ActionKind::Dance => MovementCommand::Dance,
        };
        Ok(command)
    }
}

fn pivot_channel(name: &str) -> Result<Channel, MotionError> {
    let channel: Channel = name.parse()?;
    if channel.pivot_partner().is_none() {
        return Err(MotionError::NoPivotPartner(channel));
    }
    Ok(channel)
}
