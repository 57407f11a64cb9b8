//! Action Executor
//!
//! Turns an authorized operator request into motor directives and hands them
//! to the hardware.
//!
//! # Pipeline
//!
//! ```text
//!   ActionRequest
//!        │
//!        ▼
//!   AccessGuard ──✗──> NotYourTurn
//!        │
//!        ▼
//!   MovementCommand::try_from ──✗──> InvalidCommand
//!        │
//!        ▼
//!   ammo check (shoot) ──✗──> NoAmmoRemaining
//!        │
//!        ▼
//!   MotionTranslator ──✗──> InvalidCommand
//!        │
//!        ▼
//!   hardware ready? ──✗──> HardwareUnavailable
//!        │
//!        ▼
//!   dispatch worker ──> MotorDriver   (ammo spent once queued)
//!        │
//!        ▼
//!   DispatchReport ──> arbiter        (refund, end dance, link status)
//! ```
//!
//! Directives go through one ordered dispatch worker per driver, so the
//! arbiter task never waits on the link and one action's directives are
//! never interleaved with another's. The worker never touches state; it
//! reports failures and recoveries back through [`ActionExecutor::next_report`]
//! and the arbiter applies them with [`ActionExecutor::handle_report`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::driver::{DriverError, MotorDriver};
use crate::events::ActionRequest;
use crate::guard::AccessGuard;
use crate::motion::{MotionError, MotionTranslator, MotorDirective, MovementCommand};
use crate::scheduler::TurnScheduler;
use crate::session::ConnectionId;

/// Default spacing between dance steps
pub const DEFAULT_DANCE_PERIOD: Duration = Duration::from_millis(500);

/// Jobs buffered ahead of the dispatch worker
pub const DISPATCH_QUEUE_CAPACITY: usize = 64;

/// How long shutdown waits for queued directives to drain
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Reasons an action is refused
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ActionError {
    /// The sender is not the current holder
    #[error("not your turn")]
    NotYourTurn,

    /// The holder already used this turn's shot
    #[error("no ammo remaining this turn")]
    NoAmmoRemaining,

    /// No usable hardware link
    #[error("hardware unavailable: {0}")]
    HardwareUnavailable(String),

    /// The request could not be turned into motor output
    #[error("invalid command: {0}")]
    InvalidCommand(#[from] MotionError),
}

/// A job the driver did not complete
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchFailure {
    /// Connection that asked for the job, if any
    pub requester: Option<ConnectionId>,
    /// Action name
    pub action: &'static str,
    /// Rotation count of the turn a shot was spent in
    pub refund_turn: Option<u64>,
    /// What the driver reported
    pub error: DriverError,
}

impl fmt::Display for DispatchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed: {}", self.action, self.error)
    }
}

/// Link news from the dispatch worker
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchReport {
    /// A job stopped at the driver
    Failed(DispatchFailure),
    /// The driver completed a job after an earlier failure
    Recovered,
}

/// Work item for the dispatch worker
#[derive(Debug)]
enum DispatchJob {
    /// Apply directives in order
    Directives {
        directives: Vec<MotorDirective>,
        requester: Option<ConnectionId>,
        action: &'static str,
        refund_turn: Option<u64>,
    },
    /// Zero every port
    StopAll,
}

struct Hardware {
    driver: Arc<dyn MotorDriver>,
    jobs: mpsc::Sender<DispatchJob>,
    worker: JoinHandle<()>,
}

/// Executes authorized actions against the installed driver
pub struct ActionExecutor {
    translator: MotionTranslator,
    dance_period: Duration,
    hardware: Option<Hardware>,
    link_healthy: bool,
    dance: Option<JoinHandle<()>>,
    reports_tx: mpsc::UnboundedSender<DispatchReport>,
    reports: mpsc::UnboundedReceiver<DispatchReport>,
}

impl ActionExecutor {
    /// Create an executor with no hardware installed
    #[must_use]
    pub fn new(translator: MotionTranslator, dance_period: Duration) -> Self {
        let (reports_tx, reports) = mpsc::unbounded_channel();
        Self {
            translator,
            dance_period,
            hardware: None,
            link_healthy: false,
            dance: None,
            reports_tx,
            reports,
        }
    }

    /// Install the driver and start its dispatch worker
    ///
    /// Replacing a driver lets the previous worker drain and exit.
    pub fn install_hardware(&mut self, driver: Arc<dyn MotorDriver>) {
        self.cancel_dance();
        let (jobs, rx) = mpsc::channel(DISPATCH_QUEUE_CAPACITY);
        let worker = tokio::spawn(run_dispatcher(
            Arc::clone(&driver),
            rx,
            self.reports_tx.clone(),
        ));
        self.link_healthy = true;

        tracing::info!(driver = driver.name(), "Motor driver installed");
        if self
            .hardware
            .replace(Hardware {
                driver,
                jobs,
                worker,
            })
            .is_some()
        {
            tracing::warn!("Replaced a previously installed motor driver");
        }
    }

    /// Whether a driver is installed, its link is up and the last dispatch went through
    #[must_use]
    pub fn hardware_ready(&self) -> bool {
        self.link_healthy
            && self
                .hardware
                .as_ref()
                .is_some_and(|h| h.driver.is_connected())
    }

    /// Wait for the next report from the dispatch worker
    pub async fn next_report(&mut self) -> Option<DispatchReport> {
        self.reports.recv().await
    }

    /// Apply a worker report
    ///
    /// A failure ends any dance and gives back a shot that never fired, as
    /// long as its holder still has the same turn. Returns true if ammo was
    /// refunded.
    pub fn handle_report(&mut self, scheduler: &mut TurnScheduler, report: &DispatchReport) -> bool {
        match report {
            DispatchReport::Failed(failure) => {
                self.link_healthy = false;
                self.cancel_dance();
                match (failure.requester, failure.refund_turn) {
                    (Some(id), Some(turn)) => {
                        let refunded = scheduler.refund_ammo(id, turn);
                        if refunded {
                            tracing::info!(connection_id = %id, "Refunded shot that never fired");
                        }
                        refunded
                    }
                    _ => false,
                }
            }
            DispatchReport::Recovered => {
                tracing::info!("Motor link recovered");
                self.link_healthy = true;
                false
            }
        }
    }

    /// Whether a dance loop is running
    #[must_use]
    pub fn is_dancing(&self) -> bool {
        self.dance.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Execute an operator request
    ///
    /// On success the command has been queued for the driver and, for a
    /// shot, the holder's ammo has been spent.
    ///
    /// # Errors
    ///
    /// Returns an [`ActionError`]; nothing is consumed or dispatched on error.
    pub fn execute(
        &mut self,
        scheduler: &mut TurnScheduler,
        acting: ConnectionId,
        request: &ActionRequest,
    ) -> Result<MovementCommand, ActionError> {
        if !AccessGuard::authorize(scheduler, acting) {
            return Err(ActionError::NotYourTurn);
        }

        let command = MovementCommand::try_from(request)?;
        let is_shot = matches!(command, MovementCommand::Shoot { .. });
        if is_shot && scheduler.ammo_remaining().unwrap_or(0) == 0 {
            return Err(ActionError::NoAmmoRemaining);
        }

        if command == MovementCommand::Dance {
            let jobs = self.ready_jobs()?;
            self.start_dance(jobs, acting);
        } else {
            let directives = self.translator.translate(&command)?;
            let jobs = self.ready_jobs()?;
            self.cancel_dance();
            let refund_turn = is_shot.then(|| scheduler.rotations());
            enqueue(&jobs, directives, Some(acting), command.kind(), refund_turn)?;
        }

        if is_shot {
            scheduler.spend_ammo();
        }

        tracing::debug!(connection_id = %acting, action = command.kind(), "Action dispatched");
        Ok(command)
    }

    /// Stop on behalf of the current holder
    ///
    /// Ends a dance and zeroes both drive wheels.
    ///
    /// # Errors
    ///
    /// Same gating as [`execute`](Self::execute).
    pub fn stop(
        &mut self,
        scheduler: &TurnScheduler,
        acting: ConnectionId,
    ) -> Result<(), ActionError> {
        if !AccessGuard::authorize(scheduler, acting) {
            return Err(ActionError::NotYourTurn);
        }
        let jobs = self.ready_jobs()?;
        self.cancel_dance();
        enqueue(&jobs, self.translator.stop(), Some(acting), "stop", None)
    }

    /// Stop everything without an operator request
    ///
    /// Used when the turn changes hands.
    pub fn halt(&mut self) {
        self.cancel_dance();
        if let Some(hardware) = &self.hardware {
            if enqueue(&hardware.jobs, self.translator.stop(), None, "halt", None).is_err() {
                tracing::warn!("Could not queue halt directives");
            }
        }
    }

    /// Stop the motors and wait for queued directives to drain
    pub async fn shutdown(&mut self) {
        self.cancel_dance();
        let Some(hardware) = self.hardware.take() else {
            return;
        };

        if hardware.jobs.try_send(DispatchJob::StopAll).is_err() {
            tracing::warn!("Could not queue final stop");
        }
        drop(hardware.jobs);

        match tokio::time::timeout(SHUTDOWN_DRAIN_TIMEOUT, hardware.worker).await {
            Ok(_) => tracing::info!("Dispatch worker drained"),
            Err(_) => tracing::warn!("Dispatch worker did not drain in time"),
        }
    }

    fn ready_jobs(&self) -> Result<mpsc::Sender<DispatchJob>, ActionError> {
        match &self.hardware {
            None => Err(ActionError::HardwareUnavailable(
                "no motor driver connected yet".into(),
            )),
            Some(hardware) if !hardware.driver.is_connected() => Err(
                ActionError::HardwareUnavailable(DriverError::NotConnected.to_string()),
            ),
            Some(hardware) => Ok(hardware.jobs.clone()),
        }
    }

    fn start_dance(&mut self, jobs: mpsc::Sender<DispatchJob>, acting: ConnectionId) {
        self.cancel_dance();
        let translator = self.translator.clone();
        let period = self.dance_period;

        self.dance = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let directives = translator.dance_step(&mut rand::thread_rng());
                match enqueue(&jobs, directives, Some(acting), "dance", None) {
                    Ok(()) => {}
                    Err(_) if jobs.is_closed() => break,
                    // worker is behind; skip this step
                    Err(_) => {}
                }
            }
            tracing::debug!("Dance loop ended");
        }));
        tracing::info!(connection_id = %acting, "Dance started");
    }

    fn cancel_dance(&mut self) {
        if let Some(task) = self.dance.take() {
            task.abort();
            tracing::info!("Dance stopped");
        }
    }
}

impl Drop for ActionExecutor {
    fn drop(&mut self) {
        self.cancel_dance();
    }
}

fn enqueue(
    jobs: &mpsc::Sender<DispatchJob>,
    directives: Vec<MotorDirective>,
    requester: Option<ConnectionId>,
    action: &'static str,
    refund_turn: Option<u64>,
) -> Result<(), ActionError> {
    jobs.try_send(DispatchJob::Directives {
        directives,
        requester,
        action,
        refund_turn,
    })
    .map_err(|e| {
        let reason = match e {
            mpsc::error::TrySendError::Full(_) => "dispatch queue is full",
            mpsc::error::TrySendError::Closed(_) => "dispatch worker has stopped",
        };
        ActionError::HardwareUnavailable(reason.into())
    })
}

async fn run_dispatcher(
    driver: Arc<dyn MotorDriver>,
    mut jobs: mpsc::Receiver<DispatchJob>,
    reports: mpsc::UnboundedSender<DispatchReport>,
) {
    tracing::debug!(driver = driver.name(), "Dispatch worker started");
    let mut failing = false;

    while let Some(job) = jobs.recv().await {
        let (result, requester, action, refund_turn) = match job {
            DispatchJob::Directives {
                directives,
                requester,
                action,
                refund_turn,
            } => (
                apply(driver.as_ref(), &directives).await,
                requester,
                action,
                refund_turn,
            ),
            DispatchJob::StopAll => (driver.stop_all().await, None, "stop-all", None),
        };

        let report = match result {
            Ok(()) if failing => {
                failing = false;
                DispatchReport::Recovered
            }
            Ok(()) => continue,
            Err(error) => {
                tracing::error!(action = action, error = %error, "Motor dispatch failed");
                failing = true;
                DispatchReport::Failed(DispatchFailure {
                    requester,
                    action,
                    refund_turn,
                    error,
                })
            }
        };
        if reports.send(report).is_err() {
            tracing::debug!("Executor gone, dropping dispatch report");
        }
    }

    tracing::debug!(driver = driver.name(), "Dispatch worker stopped");
}

async fn apply(driver: &dyn MotorDriver, directives: &[MotorDirective]) -> Result<(), DriverError> {
    for directive in directives {
        driver.set_channel_power(directive).await?;
    }
    Ok(())
}
