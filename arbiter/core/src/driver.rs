//! Motor Driver
//!
//! Trait seam between the arbiter and the physical brick. The arbiter only
//! ever hands a driver fully translated [`MotorDirective`]s; framing and
//! transport to the device are the driver's business.
//!
//! # Design Philosophy
//!
//! The `MotorDriver` trait provides a common interface for:
//! - Applying a power setting to one port
//! - Stopping every port at once
//! - Reporting whether the link is up
//!
//! [`SimulatedDriver`] records calls instead of talking to hardware. The
//! daemon uses it when no brick is attached and the tests use it to observe
//! dispatch order. The record is a ring: only the most recent
//! [`DEFAULT_CALL_LOG_CAPACITY`] calls are kept unless configured otherwise.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;

use crate::motion::MotorDirective;

/// Calls a [`SimulatedDriver`] remembers by default
pub const DEFAULT_CALL_LOG_CAPACITY: usize = 1024;

/// Errors reported by a motor driver
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DriverError {
    /// The link to the brick is down
    #[error("hardware is not connected")]
    NotConnected,

    /// Opening the link failed
    #[error("failed to connect to {address}: {reason}")]
    ConnectFailed {
        /// Device address that was tried
        address: String,
        /// Underlying failure
        reason: String,
    },
}

/// A connection to the motor controller
#[async_trait]
pub trait MotorDriver: Send + Sync {
    /// Human-readable driver name for logs
    fn name(&self) -> &str;

    /// Whether the link is currently usable
    fn is_connected(&self) -> bool;

    /// Apply one directive
    async fn set_channel_power(&self, directive: &MotorDirective) -> Result<(), DriverError>;

    /// Zero every port
    async fn stop_all(&self) -> Result<(), DriverError>;
}

/// A call observed by [`SimulatedDriver`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverCall {
    /// `set_channel_power`
    SetPower(MotorDirective),
    /// `stop_all`
    StopAll,
}

/// In-process driver that records calls
#[derive(Debug)]
pub struct SimulatedDriver {
    address: String,
    connected: AtomicBool,
    calls: Mutex<VecDeque<DriverCall>>,
    log_capacity: usize,
}

impl SimulatedDriver {
    /// Open a simulated link to `address`
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::ConnectFailed`] for an empty address.
    pub async fn connect(address: impl Into<String>) -> Result<Self, DriverError> {
        let address = address.into();
        if address.trim().is_empty() {
            return Err(DriverError::ConnectFailed {
                address,
                reason: "no device address configured".into(),
            });
        }

        tracing::info!(device = %address, "Simulated motor driver connected");
        Ok(Self {
            address,
            connected: AtomicBool::new(true),
            calls: Mutex::new(VecDeque::new()),
            log_capacity: DEFAULT_CALL_LOG_CAPACITY,
        })
    }

    /// Keep at most `capacity` recent calls; zero disables recording
    #[must_use]
    pub fn with_log_capacity(mut self, capacity: usize) -> Self {
        self.log_capacity = capacity;
        let calls = self.calls.get_mut();
        while calls.len() > capacity {
            calls.pop_front();
        }
        self
    }

    fn record(&self, call: DriverCall) {
        if self.log_capacity == 0 {
            return;
        }
        let mut calls = self.calls.lock();
        if calls.len() == self.log_capacity {
            calls.pop_front();
        }
        calls.push_back(call);
    }

    /// Device address this driver was opened with
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Simulate the link going up or down
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Recorded calls, oldest first
    #[must_use]
    pub fn calls(&self) -> Vec<DriverCall> {
        self.calls.lock().iter().cloned().collect()
    }

    /// Only the directives, in order
    #[must_use]
    pub fn directives(&self) -> Vec<MotorDirective> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                DriverCall::SetPower(d) => Some(*d),
                DriverCall::StopAll => None,
            })
            .collect()
    }

    /// Forget recorded calls
    pub fn clear(&self) {
        self.calls.lock().clear();
    }
}

#[async_trait]
impl MotorDriver for SimulatedDriver {
    fn name(&self) -> &str {
        "simulated"
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn set_channel_power(&self, directive: &MotorDirective) -> Result<(), DriverError> {
        if !self.is_connected() {
            return Err(DriverError::NotConnected);
        }
        tracing::trace!(
            port = %directive.port,
            power = directive.power,
            units = ?directive.target_units,
            "Set power"
        );
        self.record(DriverCall::SetPower(*directive));
        Ok(())
    }

    async fn stop_all(&self) -> Result<(), DriverError> {
        if !self.is_connected() {
            return Err(DriverError::NotConnected);
        }
        self.record(DriverCall::StopAll);
        Ok(())
    }
}
