//! Arbiter
//!
//! The single owner of all mutable arbitration state: the session registry,
//! the turn scheduler and the action executor. Every caller (socket readers,
//! the startup hardware task, tests) talks to it through an
//! [`ArbiterHandle`], which only enqueues commands. The arbiter task applies
//! them one at a time, in arrival order, interleaved with rotation ticks from
//! its own timer.
//!
//! # Architecture
//!
//! ```text
//!   socket reader ─┐
//!   socket reader ─┼──> mpsc<ArbiterCommand> ──> Arbiter task ──> Broadcaster ──> sockets
//!   hardware task ─┘                               │    ▲
//!                                                  │    └── rotation interval (select!)
//!                                                  ▼
//!                                           dispatch worker ──> MotorDriver
//! ```
//!
//! Resetting the timer replaces the interval, so the next rotation is one
//! full period after the reset. Reports from the dispatch worker arrive on a
//! third `select!` branch and are applied like any other command.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

use crate::broadcast::{Broadcaster, ConnectionHandle};
use crate::config::ArbiterConfig;
use crate::driver::MotorDriver;
use crate::events::{ActionRequest, InboundEvent};
use crate::executor::{ActionError, ActionExecutor, DispatchReport};
use crate::messages::{MessageKind, OutboundEvent, TurnSnapshot};
use crate::motion::{MotionTranslator, MovementCommand};
use crate::scheduler::{SchedulerState, TurnScheduler};
use crate::session::{ConnectionId, SessionRegistry};

/// Errors from talking to the arbiter task
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ArbiterError {
    /// The arbiter task has exited
    #[error("arbiter task has stopped")]
    Closed,
}

/// Commands processed by the arbiter task
pub enum ArbiterCommand {
    /// A transport connection was accepted
    Connect {
        /// Connection id
        id: ConnectionId,
        /// Peer address
        origin: String,
        /// Channel to the connection's writer
        tx: mpsc::Sender<OutboundEvent>,
    },
    /// A connection asked to join the queue
    Register {
        /// Connection id
        id: ConnectionId,
        /// Requested name
        display_name: String,
    },
    /// A connection asked the bot to act
    Action {
        /// Connection id
        id: ConnectionId,
        /// Raw request
        request: ActionRequest,
    },
    /// A connection asked the bot to stop
    Stop {
        /// Connection id
        id: ConnectionId,
    },
    /// A connection closed
    Disconnect {
        /// Connection id
        id: ConnectionId,
    },
    /// The motor driver finished connecting
    HardwareReady {
        /// Connected driver
        driver: Arc<dyn MotorDriver>,
    },
    /// Rotate now, outside the timer
    Rotate,
    /// Restart the rotation timer
    ResetTimer,
    /// Report current state
    Snapshot {
        /// Where to send it
        reply: oneshot::Sender<ArbiterSnapshot>,
    },
    /// Stop the motors and exit
    Shutdown,
}

/// Point-in-time view of the arbiter
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArbiterSnapshot {
    /// Registered names in queue order
    pub roster: Vec<String>,
    /// Holder state
    pub turn: TurnSnapshot,
    /// Scheduler macro-state
    pub state: SchedulerState,
    /// Whether a usable driver is installed
    pub hardware_ready: bool,
    /// Attached connections, registered or not
    pub connections: usize,
    /// Completed promotions
    pub rotations: u64,
}

/// Cloneable sender side of the arbiter
#[derive(Clone, Debug)]
pub struct ArbiterHandle {
    tx: mpsc::Sender<ArbiterCommand>,
}

impl ArbiterHandle {
    /// Handle over a fresh command channel
    ///
    /// Whoever owns the receiver serves the commands; [`Arbiter::spawn`]
    /// builds its own handle this way.
    #[must_use]
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ArbiterCommand>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    async fn send(&self, command: ArbiterCommand) -> Result<(), ArbiterError> {
        self.tx.send(command).await.map_err(|_| ArbiterError::Closed)
    }

    /// Attach a connection
    pub async fn connect(
        &self,
        id: ConnectionId,
        origin: impl Into<String>,
        tx: mpsc::Sender<OutboundEvent>,
    ) -> Result<(), ArbiterError> {
        self.send(ArbiterCommand::Connect {
            id,
            origin: origin.into(),
            tx,
        })
        .await
    }

    /// Register a display name
    pub async fn register(
        &self,
        id: ConnectionId,
        display_name: impl Into<String>,
    ) -> Result<(), ArbiterError> {
        self.send(ArbiterCommand::Register {
            id,
            display_name: display_name.into(),
        })
        .await
    }

    /// Submit an action request
    pub async fn action(&self, id: ConnectionId, request: ActionRequest) -> Result<(), ArbiterError> {
        self.send(ArbiterCommand::Action { id, request }).await
    }

    /// Submit a stop request
    pub async fn stop(&self, id: ConnectionId) -> Result<(), ArbiterError> {
        self.send(ArbiterCommand::Stop { id }).await
    }

    /// Report a closed connection
    pub async fn disconnect(&self, id: ConnectionId) -> Result<(), ArbiterError> {
        self.send(ArbiterCommand::Disconnect { id }).await
    }

    /// Install the connected motor driver
    pub async fn hardware_ready(&self, driver: Arc<dyn MotorDriver>) -> Result<(), ArbiterError> {
        self.send(ArbiterCommand::HardwareReady { driver }).await
    }

    /// Rotate immediately
    pub async fn rotate(&self) -> Result<(), ArbiterError> {
        self.send(ArbiterCommand::Rotate).await
    }

    /// Restart the rotation timer
    pub async fn reset_timer(&self) -> Result<(), ArbiterError> {
        self.send(ArbiterCommand::ResetTimer).await
    }

    /// Fetch a snapshot of the current state
    pub async fn snapshot(&self) -> Result<ArbiterSnapshot, ArbiterError> {
        let (reply, rx) = oneshot::channel();
        self.send(ArbiterCommand::Snapshot { reply }).await?;
        rx.await.map_err(|_| ArbiterError::Closed)
    }

    /// Ask the arbiter to stop
    pub async fn shutdown(&self) -> Result<(), ArbiterError> {
        self.send(ArbiterCommand::Shutdown).await
    }
}

/// Per-connection context held by a transport reader
#[derive(Debug)]
pub struct SessionContext {
    id: ConnectionId,
    origin: String,
    handle: ArbiterHandle,
}

impl SessionContext {
    /// Allocate an id and attach the connection
    pub async fn open(
        handle: ArbiterHandle,
        origin: impl Into<String>,
        tx: mpsc::Sender<OutboundEvent>,
    ) -> Result<Self, ArbiterError> {
        Self::attach(handle, ConnectionId::new(), origin, tx).await
    }

    /// Attach a connection under an id the transport already allocated
    pub async fn attach(
        handle: ArbiterHandle,
        id: ConnectionId,
        origin: impl Into<String>,
        tx: mpsc::Sender<OutboundEvent>,
    ) -> Result<Self, ArbiterError> {
        let origin = origin.into();
        handle.connect(id, origin.clone(), tx).await?;
        Ok(Self { id, origin, handle })
    }

    /// Connection id
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Peer address
    #[must_use]
    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Register a display name for this connection
    pub async fn register(&self, display_name: impl Into<String>) -> Result<(), ArbiterError> {
        self.handle.register(self.id, display_name).await
    }

    /// Start an action for this connection
    pub async fn action_start(&self, request: ActionRequest) -> Result<(), ArbiterError> {
        self.handle.action(self.id, request).await
    }

    /// Stop the bot for this connection
    pub async fn action_stop(&self) -> Result<(), ArbiterError> {
        self.handle.stop(self.id).await
    }

    /// Forward a decoded inbound event
    pub async fn dispatch(&self, event: InboundEvent) -> Result<(), ArbiterError> {
        match event {
            InboundEvent::Register { display_name } => self.register(display_name).await,
            InboundEvent::ActionStart(request) => self.action_start(request).await,
            InboundEvent::ActionStop => self.action_stop().await,
        }
    }

    /// Detach this connection
    pub async fn close(self) -> Result<(), ArbiterError> {
        self.handle.disconnect(self.id).await
    }
}

enum Flow {
    Continue,
    ResetTimer,
    Stop,
}

/// The arbiter task state
pub struct Arbiter {
    sessions: SessionRegistry,
    scheduler: TurnScheduler,
    executor: ActionExecutor,
    broadcaster: Broadcaster,
    hardware_shown: bool,
    rotation_interval: Duration,
    rx: mpsc::Receiver<ArbiterCommand>,
}

impl Arbiter {
    /// Spawn the arbiter task
    ///
    /// Returns the handle for enqueueing commands and the task's join handle.
    #[must_use]
    pub fn spawn(config: &ArbiterConfig) -> (ArbiterHandle, JoinHandle<()>) {
        let (handle, rx) = ArbiterHandle::channel(config.command_capacity);
        let arbiter = Self {
            sessions: SessionRegistry::new(config.max_display_name_len, config.enforce_unique_origin),
            scheduler: TurnScheduler::new(config.ammo_per_turn),
            executor: ActionExecutor::new(
                MotionTranslator::new(config.motors.clone(), config.calibration_factor),
                config.dance_period,
            ),
            broadcaster: Broadcaster::new(),
            hardware_shown: false,
            rotation_interval: config.rotation_interval,
            rx,
        };
        let task = tokio::spawn(arbiter.run());
        (handle, task)
    }

    async fn run(mut self) {
        tracing::info!(
            rotation_secs = self.rotation_interval.as_secs_f64(),
            "Arbiter started"
        );
        let mut ticker = self.new_ticker();

        loop {
            tokio::select! {
                command = self.rx.recv() => {
                    let Some(command) = command else {
                        tracing::info!("All arbiter handles dropped");
                        break;
                    };
                    match self.handle_command(command) {
                        Flow::Continue => {}
                        Flow::ResetTimer => ticker = self.new_ticker(),
                        Flow::Stop => break,
                    }
                }
                Some(report) = self.executor.next_report() => self.on_dispatch_report(&report),
                _ = ticker.tick() => self.rotate(),
            }
        }

        self.executor.shutdown().await;
        tracing::info!("Arbiter stopped");
    }

    fn new_ticker(&self) -> Interval {
        let mut ticker = interval_at(Instant::now() + self.rotation_interval, self.rotation_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    }

    fn handle_command(&mut self, command: ArbiterCommand) -> Flow {
        match command {
            ArbiterCommand::Connect { id, origin, tx } => {
                self.on_connect(id, origin, tx);
                Flow::Continue
            }
            ArbiterCommand::Register { id, display_name } => self.on_register(id, &display_name),
            ArbiterCommand::Action { id, request } => {
                self.on_action(id, &request);
                Flow::Continue
            }
            ArbiterCommand::Stop { id } => {
                self.on_stop(id);
                Flow::Continue
            }
            ArbiterCommand::Disconnect { id } => {
                self.on_disconnect(id);
                Flow::Continue
            }
            ArbiterCommand::HardwareReady { driver } => {
                self.on_hardware_ready(driver);
                Flow::Continue
            }
            ArbiterCommand::Rotate => {
                self.rotate();
                Flow::Continue
            }
            ArbiterCommand::ResetTimer => Flow::ResetTimer,
            ArbiterCommand::Snapshot { reply } => {
                // requester may have given up
                let _ = reply.send(self.snapshot());
                Flow::Continue
            }
            ArbiterCommand::Shutdown => {
                tracing::info!("Arbiter shutdown requested");
                Flow::Stop
            }
        }
    }

    fn on_connect(&mut self, id: ConnectionId, origin: String, tx: mpsc::Sender<OutboundEvent>) {
        self.broadcaster.attach(ConnectionHandle::new(id, origin, tx));

        self.broadcaster.send_to(
            id,
            OutboundEvent::RosterUpdate {
                names: self.sessions.list(),
            },
        );
        self.broadcaster
            .send_to(id, OutboundEvent::TurnUpdate(self.scheduler.snapshot()));
        self.broadcaster.send_to(
            id,
            OutboundEvent::HardwareStatus {
                connected: self.executor.hardware_ready(),
            },
        );
    }

    fn on_register(&mut self, id: ConnectionId, display_name: &str) -> Flow {
        let Some(origin) = self.broadcaster.origin_of(id) else {
            tracing::warn!(connection_id = %id, "Register from unknown connection");
            return Flow::Continue;
        };

        match self.sessions.register(id, &origin, display_name) {
            Ok(session) => {
                self.scheduler.enqueue(id);
                let sessions = &self.sessions;
                if self
                    .scheduler
                    .refresh_lookahead(|sid| sessions.display_name(sid).map(str::to_owned))
                {
                    self.broadcaster.broadcast_turn(self.scheduler.snapshot());
                }
                self.broadcaster.broadcast_roster(self.sessions.list());
                self.broadcaster.broadcast_message(
                    MessageKind::System,
                    format!("{} joined the queue", session.display_name),
                );

                if self.scheduler.state() == SchedulerState::Idle {
                    self.rotate();
                    return Flow::ResetTimer;
                }
                Flow::Continue
            }
            Err(e) => {
                tracing::warn!(connection_id = %id, error = %e, "Registration refused");
                self.broadcaster.send_to(
                    id,
                    OutboundEvent::RegistrationError {
                        reason: e.to_string(),
                    },
                );
                Flow::Continue
            }
        }
    }

    fn on_dispatch_report(&mut self, report: &DispatchReport) {
        if let DispatchReport::Failed(failure) = report {
            if let Some(id) = failure.requester {
                self.broadcaster.send_to(
                    id,
                    OutboundEvent::ActionError {
                        message: failure.to_string(),
                    },
                );
            }
        }
        if self.executor.handle_report(&mut self.scheduler, report) {
            self.broadcaster.broadcast_turn(self.scheduler.snapshot());
        }
        self.sync_hardware_status();
    }

    /// Broadcast the link state when it differs from what surfaces last saw
    fn sync_hardware_status(&mut self) {
        let ready = self.executor.hardware_ready();
        if ready != self.hardware_shown {
            self.hardware_shown = ready;
            self.broadcaster.broadcast_hardware(ready);
        }
    }

    fn on_action(&mut self, id: ConnectionId, request: &ActionRequest) {
        match self.executor.execute(&mut self.scheduler, id, request) {
            Ok(command) => {
                let name = self.sessions.display_name(id).unwrap_or("someone");
                self.broadcaster.broadcast_message(
                    MessageKind::Action,
                    format!("{name} triggered {}", command.kind()),
                );
                if matches!(command, MovementCommand::Shoot { .. }) {
                    self.broadcaster.broadcast_turn(self.scheduler.snapshot());
                }
            }
            Err(e) => self.refuse(id, &e),
        }
        self.sync_hardware_status();
    }

    fn on_stop(&mut self, id: ConnectionId) {
        match self.executor.stop(&self.scheduler, id) {
            Ok(()) => {
                let name = self.sessions.display_name(id).unwrap_or("someone");
                self.broadcaster
                    .broadcast_message(MessageKind::Action, format!("{name} stopped the bot"));
            }
            Err(e) => self.refuse(id, &e),
        }
    }

    fn refuse(&self, id: ConnectionId, error: &ActionError) {
        tracing::debug!(connection_id = %id, error = %error, "Action refused");
        let event = match error {
            ActionError::NotYourTurn => OutboundEvent::QueueError {
                message: error.to_string(),
            },
            _ => OutboundEvent::ActionError {
                message: error.to_string(),
            },
        };
        self.broadcaster.send_to(id, event);
    }

    fn on_disconnect(&mut self, id: ConnectionId) {
        self.broadcaster.detach(id);

        let Some(session) = self.sessions.remove(id) else {
            tracing::debug!(connection_id = %id, "Spectator disconnected");
            return;
        };

        if self.scheduler.current().is_some_and(|h| h.session_id == id) {
            self.executor.halt();
        }

        let sessions = &self.sessions;
        let lookahead_changed = self
            .scheduler
            .dequeue(id, |sid| sessions.display_name(sid).map(str::to_owned));
        if lookahead_changed {
            self.broadcaster.broadcast_turn(self.scheduler.snapshot());
        }

        self.broadcaster.broadcast_roster(self.sessions.list());
        self.broadcaster.broadcast_message(
            MessageKind::System,
            format!("{} left the queue", session.display_name),
        );
    }

    fn on_hardware_ready(&mut self, driver: Arc<dyn MotorDriver>) {
        let name = driver.name().to_string();
        self.executor.install_hardware(driver);

        self.hardware_shown = self.executor.hardware_ready();
        self.broadcaster.broadcast_hardware(self.hardware_shown);
        self.broadcaster.broadcast_message(
            MessageKind::Hardware,
            format!("bot connected via {name} driver"),
        );
    }

    fn rotate(&mut self) {
        for id in self.broadcaster.cleanup_disconnected() {
            self.on_disconnect(id);
        }

        let sessions = &self.sessions;
        let Some(rotation) = self
            .scheduler
            .tick(|id| sessions.display_name(id).map(str::to_owned))
        else {
            return;
        };

        if rotation.changed_hands() {
            if rotation.previous.is_some() {
                self.executor.halt();
            }
            let text = match &rotation.snapshot.current {
                Some(holder) => format!("it is now {}'s turn", holder.name),
                None => "nobody is in the queue".to_string(),
            };
            self.broadcaster.broadcast_message(MessageKind::Turn, text);
        }
        self.broadcaster.broadcast_turn(rotation.snapshot);
    }

    fn snapshot(&self) -> ArbiterSnapshot {
        ArbiterSnapshot {
            roster: self.sessions.list(),
            turn: self.scheduler.snapshot(),
            state: self.scheduler.state(),
            hardware_ready: self.executor.hardware_ready(),
            connections: self.broadcaster.count(),
            rotations: self.scheduler.rotations(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::SimulatedDriver;
    use crate::events::ActionKind;
    use pretty_assertions::assert_eq;

    fn config() -> ArbiterConfig {
        let mut config = ArbiterConfig::default();
        config.enforce_unique_origin = false;
        config
    }

    async fn join(handle: &ArbiterHandle, name: &str) -> (SessionContext, mpsc::Receiver<OutboundEvent>) {
        let (tx, rx) = mpsc::channel(64);
        let ctx = SessionContext::open(handle.clone(), format!("10.0.0.{}", name.len()), tx)
            .await
            .unwrap();
        ctx.register(name).await.unwrap();
        (ctx, rx)
    }

    fn drain(rx: &mut mpsc::Receiver<OutboundEvent>) -> Vec<OutboundEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_new_connection_gets_state() {
        let (handle, _task) = Arbiter::spawn(&config());
        let (tx, mut rx) = mpsc::channel(8);
        let _ctx = SessionContext::open(handle.clone(), "10.0.0.9", tx).await.unwrap();
        handle.snapshot().await.unwrap();

        let events = drain(&mut rx);
        assert_eq!(
            events,
            vec![
                OutboundEvent::RosterUpdate { names: vec![] },
                OutboundEvent::TurnUpdate(TurnSnapshot::default()),
                OutboundEvent::HardwareStatus { connected: false },
            ]
        );
    }

    #[tokio::test]
    async fn test_first_registration_takes_the_turn() {
        let (handle, _task) = Arbiter::spawn(&config());
        let (_alice, _rx) = join(&handle, "Alice").await;

        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.roster, vec!["Alice"]);
        assert_eq!(snapshot.state, SchedulerState::Active);
        assert_eq!(snapshot.turn.current.unwrap().name, "Alice");
    }

    #[tokio::test]
    async fn test_duplicate_name_reported_to_requester_only() {
        let (handle, _task) = Arbiter::spawn(&config());
        let (_alice, mut rx_alice) = join(&handle, "Alice").await;
        let (_imposter, mut rx_imposter) = join(&handle, "Alice").await;
        handle.snapshot().await.unwrap();

        assert!(drain(&mut rx_imposter)
            .iter()
            .any(|e| matches!(e, OutboundEvent::RegistrationError { .. })));
        assert!(!drain(&mut rx_alice)
            .iter()
            .any(|e| matches!(e, OutboundEvent::RegistrationError { .. })));
        assert_eq!(handle.snapshot().await.unwrap().roster, vec!["Alice"]);
    }

    #[tokio::test]
    async fn test_non_holder_gets_queue_error() {
        let (handle, _task) = Arbiter::spawn(&config());
        let (_alice, _rx_alice) = join(&handle, "Alice").await;
        let (bob, mut rx_bob) = join(&handle, "Bob").await;
        handle.snapshot().await.unwrap();
        drain(&mut rx_bob);

        bob.action_start(ActionRequest::new(ActionKind::Shoot))
            .await
            .unwrap();
        handle.snapshot().await.unwrap();

        assert_eq!(
            drain(&mut rx_bob),
            vec![OutboundEvent::QueueError {
                message: "not your turn".into()
            }]
        );
    }

    #[tokio::test]
    async fn test_action_before_hardware_is_refused() {
        let (handle, _task) = Arbiter::spawn(&config());
        let (alice, mut rx) = join(&handle, "Alice").await;
        handle.snapshot().await.unwrap();
        drain(&mut rx);

        alice
            .action_start(ActionRequest::new(ActionKind::Shoot))
            .await
            .unwrap();
        let snapshot = handle.snapshot().await.unwrap();

        assert!(matches!(
            drain(&mut rx).as_slice(),
            [OutboundEvent::ActionError { .. }]
        ));
        assert_eq!(snapshot.turn.current.unwrap().ammo_remaining, 1);
    }

    #[tokio::test]
    async fn test_hardware_ready_broadcasts_status() {
        let (handle, _task) = Arbiter::spawn(&config());
        let (_alice, mut rx) = join(&handle, "Alice").await;
        let driver = Arc::new(SimulatedDriver::connect("/dev/null").await.unwrap());
        handle.hardware_ready(driver).await.unwrap();

        let snapshot = handle.snapshot().await.unwrap();
        assert!(snapshot.hardware_ready);
        assert!(drain(&mut rx)
            .iter()
            .any(|e| *e == OutboundEvent::HardwareStatus { connected: true }));
    }

    #[tokio::test]
    async fn test_spectator_disconnect_keeps_queue() {
        let (handle, _task) = Arbiter::spawn(&config());
        let (_alice, _rx) = join(&handle, "Alice").await;
        let (tx, _spectator_rx) = mpsc::channel(8);
        let spectator = SessionContext::open(handle.clone(), "10.0.0.99", tx).await.unwrap();
        assert_eq!(handle.snapshot().await.unwrap().connections, 2);

        spectator.close().await.unwrap();
        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.connections, 1);
        assert_eq!(snapshot.roster, vec!["Alice"]);
    }

    #[tokio::test]
    async fn test_shutdown_ends_task() {
        let (handle, task) = Arbiter::spawn(&config());
        handle.shutdown().await.unwrap();
        task.await.unwrap();
        assert_eq!(handle.snapshot().await, Err(ArbiterError::Closed));
    }
}
