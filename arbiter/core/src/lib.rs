//! Arbiter Core - Turn Arbitration for a Shared Turret Bot
//!
//! This crate decides who may drive the bot right now and turns their
//! commands into motor directives. Remote operators register a display name,
//! wait in a round-robin queue, and get exclusive control for one rotation
//! interval at a time. It has no transport of its own; the daemon crate puts
//! it behind a WebSocket listener.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Operator Surfaces                           │
//! │   ┌──────────┐    ┌──────────┐    ┌──────────┐    ┌──────────┐  │
//! │   │ operator │    │ operator │    │ operator │    │spectator │  │
//! │   └────┬─────┘    └────┬─────┘    └────┬─────┘    └────┬─────┘  │
//! │        └───────────────┴───────┬───────┴───────────────┘        │
//! │                     InboundEvent (up)                           │
//! │                    OutboundEvent (down)                         │
//! └────────────────────────────────┼────────────────────────────────┘
//!                                  │
//! ┌────────────────────────────────┼────────────────────────────────┐
//! │                          ARBITER CORE                           │
//! │  ┌─────────────────────────────┴─────────────────────────────┐  │
//! │  │                     Arbiter task                          │  │
//! │  │  ┌──────────┐  ┌───────────┐  ┌──────────┐  ┌──────────┐  │  │
//! │  │  │ Session  │  │   Turn    │  │  Action  │  │  Event   │  │  │
//! │  │  │ Registry │  │ Scheduler │  │ Executor │  │Broadcast │  │  │
//! │  │  └──────────┘  └───────────┘  └────┬─────┘  └──────────┘  │  │
//! │  └────────────────────────────────────┼──────────────────────┘  │
//! │                          MotionTranslator → MotorDriver         │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key Types
//!
//! - [`Arbiter`]: The state-owning task; spawn it and talk to it through an [`ArbiterHandle`]
//! - [`SessionContext`]: Per-connection context held by a transport reader
//! - [`InboundEvent`]: Events sent from operator surfaces
//! - [`OutboundEvent`]: Events sent to operator surfaces
//! - [`MotionTranslator`]: Semantic commands to motor directives
//! - [`MotorDriver`]: Seam to the physical motor controller
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use arbiter_core::{Arbiter, ArbiterConfig, SessionContext, SimulatedDriver};
//! use tokio::sync::mpsc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = ArbiterConfig::default();
//!     let (handle, _task) = Arbiter::spawn(&config);
//!
//!     let driver = SimulatedDriver::connect(config.device_address.clone()).await.unwrap();
//!     handle.hardware_ready(Arc::new(driver)).await.unwrap();
//!
//!     let (tx, mut rx) = mpsc::channel(64);
//!     let ctx = SessionContext::open(handle.clone(), "127.0.0.1", tx).await.unwrap();
//!     ctx.register("Alice").await.unwrap();
//!
//!     while let Some(event) = rx.recv().await {
//!         // Render event
//!     }
//! }
//! ```
//!
//! # Module Overview
//!
//! - [`arbiter`]: The state-owning task, its handle and per-connection context
//! - [`session`]: Connection ids and the registry of display names
//! - [`scheduler`]: Round-robin turn queue with current and next holders
//! - [`guard`]: The access check in front of every command
//! - [`executor`]: Gating, ammo and ordered dispatch to the driver
//! - [`motion`]: Channels, ports and the motion math
//! - [`driver`]: Motor driver trait and the simulated driver
//! - [`broadcast`]: Non-blocking fan-out to connections
//! - [`events`]: Events from operator surfaces
//! - [`messages`]: Events to operator surfaces
//! - [`codec`]: JSON text frames
//! - [`config`]: Layered configuration

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod arbiter;
pub mod broadcast;
pub mod codec;
pub mod config;
pub mod driver;
pub mod events;
pub mod executor;
pub mod guard;
pub mod messages;
pub mod motion;
pub mod scheduler;
pub mod session;

pub use arbiter::{
    Arbiter, ArbiterCommand, ArbiterError, ArbiterHandle, ArbiterSnapshot, SessionContext,
};
pub use broadcast::{BroadcastResult, Broadcaster, ConnectionHandle};
pub use codec::{decode_inbound, encode_outbound, CodecError};
pub use config::{
    default_config_path, load_config, load_config_from_path, ArbiterConfig, ConfigError,
    ConfigOverrides, ConfigSource,
};
pub use driver::{DriverCall, DriverError, MotorDriver, SimulatedDriver, DEFAULT_CALL_LOG_CAPACITY};
pub use events::{ActionKind, ActionRequest, InboundEvent};
pub use executor::{ActionError, ActionExecutor, DispatchFailure, DispatchReport};
pub use guard::AccessGuard;
pub use messages::{HolderView, MessageKind, OutboundEvent, TurnSnapshot};
pub use motion::{
    Channel, Direction, MotionError, MotionTranslator, MotorConfig, MotorDirective, MotorMode,
    MovementCommand, Port,
};
pub use scheduler::{Holder, Rotation, SchedulerState, TurnQueue, TurnScheduler};
pub use session::{ConnectionId, RegistrationError, Session, SessionRegistry};
