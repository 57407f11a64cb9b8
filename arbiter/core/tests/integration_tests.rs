//! Integration tests for turn arbitration
//!
//! These tests drive a spawned arbiter through its public handle, the same
//! way the daemon does, with a simulated driver standing in for the brick.
//! Tests cover:
//! - Round-robin rotation on the timer
//! - Ammo accounting across turns
//! - Refusals for non-holders
//! - Holder disconnects and lookahead repair
//! - Halting motion when the turn changes hands
//! - Timer reset
//! - Link failures and recovery
//! - Wire frames through the codec

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use arbiter_core::{
    decode_inbound, encode_outbound, ActionKind, ActionRequest, Arbiter, ArbiterConfig,
    ArbiterHandle, ArbiterSnapshot, DriverError, MotorDirective, MotorDriver, OutboundEvent, Port,
    SchedulerState, SessionContext, SimulatedDriver,
};

// =============================================================================
// Helpers
// =============================================================================

struct Rig {
    handle: ArbiterHandle,
    _task: JoinHandle<()>,
    driver: Arc<SimulatedDriver>,
}

async fn rig() -> Rig {
    let config = ArbiterConfig::default();
    let (handle, task) = Arbiter::spawn(&config);
    let driver = Arc::new(SimulatedDriver::connect("/dev/null").await.unwrap());
    handle.hardware_ready(driver.clone()).await.unwrap();
    Rig {
        handle,
        _task: task,
        driver,
    }
}

struct Operator {
    ctx: SessionContext,
    rx: mpsc::Receiver<OutboundEvent>,
}

impl Operator {
    async fn join(rig: &Rig, name: &str, octet: u8) -> Self {
        Self::open(&rig.handle, name, octet).await
    }

    async fn open(handle: &ArbiterHandle, name: &str, octet: u8) -> Self {
        let (tx, rx) = mpsc::channel(256);
        let ctx = SessionContext::open(handle.clone(), format!("10.0.0.{octet}"), tx)
            .await
            .unwrap();
        ctx.register(name).await.unwrap();
        Self { ctx, rx }
    }

    fn drain(&mut self) -> Vec<OutboundEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        events
    }
}

async fn current(handle: &ArbiterHandle) -> Option<String> {
    handle.snapshot().await.unwrap().turn.current.map(|h| h.name)
}

async fn settle(driver: &SimulatedDriver, calls: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while driver.calls().len() < calls {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();
}

async fn until<F>(handle: &ArbiterHandle, done: F) -> ArbiterSnapshot
where
    F: Fn(&ArbiterSnapshot) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let snapshot = handle.snapshot().await.unwrap();
            if done(&snapshot) {
                return snapshot;
            }
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap()
}

fn shoot() -> ActionRequest {
    ActionRequest::new(ActionKind::Shoot)
}

/// Reports a live link but fails writes while `failing` is set
#[derive(Default)]
struct UnreliableDriver {
    failing: AtomicBool,
    writes: AtomicUsize,
}

impl UnreliableDriver {
    fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn write(&self) -> Result<(), DriverError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(DriverError::NotConnected);
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl MotorDriver for UnreliableDriver {
    fn name(&self) -> &str {
        "unreliable"
    }

    fn is_connected(&self) -> bool {
        true
    }

    async fn set_channel_power(&self, _directive: &MotorDirective) -> Result<(), DriverError> {
        self.write()
    }

    async fn stop_all(&self) -> Result<(), DriverError> {
        self.write()
    }
}

async fn unreliable_arbiter() -> (ArbiterHandle, JoinHandle<()>, Arc<UnreliableDriver>) {
    let (handle, task) = Arbiter::spawn(&ArbiterConfig::default());
    let driver = Arc::new(UnreliableDriver::default());
    handle.hardware_ready(driver.clone()).await.unwrap();
    (handle, task, driver)
}

fn hardware_status(events: &[OutboundEvent]) -> Vec<bool> {
    events
        .iter()
        .filter_map(|e| match e {
            OutboundEvent::HardwareStatus { connected } => Some(*connected),
            _ => None,
        })
        .collect()
}

// =============================================================================
// Rotation
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_rotation_visits_each_operator_in_order() {
    let rig = rig().await;
    let _a = Operator::join(&rig, "A", 1).await;
    let _b = Operator::join(&rig, "B", 2).await;
    let _c = Operator::join(&rig, "C", 3).await;

    let mut seen = vec![current(&rig.handle).await.unwrap()];
    // sample just after each tick
    tokio::time::sleep(Duration::from_secs(1)).await;
    for _ in 0..3 {
        tokio::time::sleep(Duration::from_secs(30)).await;
        seen.push(current(&rig.handle).await.unwrap());
    }

    assert_eq!(seen, vec!["A", "B", "C", "A"]);
}

#[tokio::test(start_paused = true)]
async fn test_reset_timer_postpones_rotation() {
    let rig = rig().await;
    let _a = Operator::join(&rig, "A", 1).await;
    let _b = Operator::join(&rig, "B", 2).await;

    tokio::time::sleep(Duration::from_secs(20)).await;
    rig.handle.reset_timer().await.unwrap();

    tokio::time::sleep(Duration::from_secs(20)).await;
    assert_eq!(current(&rig.handle).await.as_deref(), Some("A"));

    tokio::time::sleep(Duration::from_secs(11)).await;
    assert_eq!(current(&rig.handle).await.as_deref(), Some("B"));
}

#[tokio::test]
async fn test_turn_update_broadcast_to_spectators() {
    let rig = rig().await;
    let (tx, mut spectator) = mpsc::channel(64);
    let _watch = SessionContext::open(rig.handle.clone(), "10.0.0.50", tx)
        .await
        .unwrap();
    let _a = Operator::join(&rig, "A", 1).await;
    rig.handle.snapshot().await.unwrap();

    let mut saw_turn = false;
    while let Ok(event) = spectator.try_recv() {
        if let OutboundEvent::TurnUpdate(snapshot) = event {
            if snapshot.current.is_some_and(|h| h.name == "A") {
                saw_turn = true;
            }
        }
    }
    assert!(saw_turn);
}

// =============================================================================
// Authorization and ammo
// =============================================================================

#[tokio::test]
async fn test_non_holder_action_produces_no_directive() {
    let rig = rig().await;
    let _a = Operator::join(&rig, "A", 1).await;
    let mut b = Operator::join(&rig, "B", 2).await;
    rig.handle.snapshot().await.unwrap();
    b.drain();

    b.ctx
        .action_start(
            ActionRequest::new(ActionKind::Move)
                .with_direction("forward")
                .with_speed(80),
        )
        .await
        .unwrap();
    rig.handle.snapshot().await.unwrap();
    tokio::task::yield_now().await;

    assert_eq!(
        b.drain(),
        vec![OutboundEvent::QueueError {
            message: "not your turn".into()
        }]
    );
    assert!(rig.driver.directives().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_one_shot_per_turn() {
    let rig = rig().await;
    let mut a = Operator::join(&rig, "A", 1).await;

    a.ctx.action_start(shoot()).await.unwrap();
    let snapshot = rig.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.turn.current.unwrap().ammo_remaining, 0);
    settle(&rig.driver, 1).await;
    assert_eq!(
        rig.driver.directives(),
        vec![MotorDirective::rotate(Port::C, 100, 360)]
    );

    a.drain();
    a.ctx.action_start(shoot()).await.unwrap();
    rig.handle.snapshot().await.unwrap();
    let refused = a.drain();
    assert!(matches!(
        refused.as_slice(),
        [OutboundEvent::ActionError { message }] if message.contains("no ammo")
    ));

    // sole operator keeps the turn and gets a fresh shot
    tokio::time::sleep(Duration::from_secs(31)).await;
    let snapshot = rig.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.turn.current.unwrap().ammo_remaining, 1);

    a.ctx.action_start(shoot()).await.unwrap();
    rig.handle.snapshot().await.unwrap();
    settle(&rig.driver, 2).await;
}

#[tokio::test]
async fn test_action_audit_message() {
    let rig = rig().await;
    let a = Operator::join(&rig, "Alice", 1).await;
    let mut b = Operator::join(&rig, "Bob", 2).await;
    rig.handle.snapshot().await.unwrap();
    b.drain();

    a.ctx
        .action_start(ActionRequest::new(ActionKind::Turn).with_direction("left"))
        .await
        .unwrap();
    rig.handle.snapshot().await.unwrap();

    let texts: Vec<String> = b
        .drain()
        .into_iter()
        .filter_map(|e| match e {
            OutboundEvent::Message { text, .. } => Some(text),
            _ => None,
        })
        .collect();
    assert_eq!(texts, vec!["Alice triggered turn"]);
}

// =============================================================================
// Disconnects
// =============================================================================

#[tokio::test]
async fn test_disconnected_holder_is_skipped() {
    let rig = rig().await;
    let a = Operator::join(&rig, "A", 1).await;
    let _b = Operator::join(&rig, "B", 2).await;
    let _c = Operator::join(&rig, "C", 3).await;

    a.ctx.close().await.unwrap();
    let snapshot = rig.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.roster, vec!["B", "C"]);

    let mut seen = Vec::new();
    for _ in 0..4 {
        rig.handle.rotate().await.unwrap();
        seen.push(current(&rig.handle).await.unwrap());
    }
    assert_eq!(seen, vec!["B", "C", "B", "C"]);
}

#[tokio::test]
async fn test_disconnected_next_is_replaced() {
    let rig = rig().await;
    let _a = Operator::join(&rig, "A", 1).await;
    let b = Operator::join(&rig, "B", 2).await;
    let mut c = Operator::join(&rig, "C", 3).await;
    rig.handle.snapshot().await.unwrap();
    c.drain();

    b.ctx.close().await.unwrap();
    let snapshot = rig.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.turn.next.unwrap().name, "C");
    assert!(c.drain().iter().any(|e| matches!(
        e,
        OutboundEvent::TurnUpdate(turn) if turn.next.as_ref().is_some_and(|h| h.name == "C")
    )));
}

#[tokio::test]
async fn test_everyone_leaves_returns_to_idle() {
    let rig = rig().await;
    let a = Operator::join(&rig, "A", 1).await;
    a.ctx.close().await.unwrap();
    rig.handle.rotate().await.unwrap();

    let snapshot = rig.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.state, SchedulerState::Idle);
    assert!(snapshot.roster.is_empty());

    let _b = Operator::join(&rig, "B", 2).await;
    assert_eq!(current(&rig.handle).await.as_deref(), Some("B"));
}

#[tokio::test]
async fn test_joiner_after_sole_holder_leaves_takes_turn_at_once() {
    let rig = rig().await;
    let a = Operator::join(&rig, "A", 1).await;
    a.ctx.close().await.unwrap();

    let mut b = Operator::join(&rig, "B", 2).await;
    let snapshot = rig.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.state, SchedulerState::Active);
    assert_eq!(snapshot.turn.current.unwrap().name, "B");

    let holders: Vec<String> = b
        .drain()
        .into_iter()
        .filter_map(|e| match e {
            OutboundEvent::TurnUpdate(turn) => turn.current.map(|h| h.name),
            _ => None,
        })
        .collect();
    assert!(!holders.is_empty());
    assert!(holders.iter().all(|name| name == "B"));

    b.ctx.action_start(shoot()).await.unwrap();
    rig.handle.snapshot().await.unwrap();
    assert!(b
        .drain()
        .iter()
        .all(|e| !matches!(e, OutboundEvent::QueueError { .. })));
}

#[tokio::test]
async fn test_name_is_reusable_after_disconnect() {
    let rig = rig().await;
    let a = Operator::join(&rig, "Alice", 1).await;
    a.ctx.close().await.unwrap();

    let mut again = Operator::join(&rig, "Alice", 1).await;
    rig.handle.snapshot().await.unwrap();
    assert!(!again
        .drain()
        .iter()
        .any(|e| matches!(e, OutboundEvent::RegistrationError { .. })));
}

// =============================================================================
// Motion lifecycle
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_dance_halts_when_turn_changes_hands() {
    let rig = rig().await;
    let a = Operator::join(&rig, "A", 1).await;
    let _b = Operator::join(&rig, "B", 2).await;

    a.ctx
        .action_start(ActionRequest::new(ActionKind::Dance))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(rig.driver.directives().len() >= 4);

    rig.handle.rotate().await.unwrap();
    assert_eq!(current(&rig.handle).await.as_deref(), Some("B"));
    tokio::time::sleep(Duration::from_millis(10)).await;
    let after_halt = rig.driver.calls().len();

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(rig.driver.calls().len(), after_halt);

    let directives = rig.driver.directives();
    assert_eq!(
        &directives[directives.len() - 2..],
        &[MotorDirective::run(Port::A, 0), MotorDirective::run(Port::B, 0)]
    );
}

#[tokio::test]
async fn test_link_loss_refuses_actions() {
    let rig = rig().await;
    let mut a = Operator::join(&rig, "A", 1).await;
    rig.handle.snapshot().await.unwrap();
    a.drain();

    rig.driver.set_connected(false);
    a.ctx.action_start(shoot()).await.unwrap();
    let snapshot = rig.handle.snapshot().await.unwrap();

    assert!(!snapshot.hardware_ready);
    assert_eq!(snapshot.turn.current.unwrap().ammo_remaining, 1);
    let events = a.drain();
    assert!(matches!(
        events.first(),
        Some(OutboundEvent::ActionError { message }) if message.contains("hardware")
    ));
    assert_eq!(hardware_status(&events), vec![false]);
}

#[tokio::test]
async fn test_reconnected_driver_is_announced() {
    let rig = rig().await;
    let mut a = Operator::join(&rig, "A", 1).await;
    rig.handle.snapshot().await.unwrap();
    a.drain();

    rig.driver.set_connected(false);
    a.ctx.action_start(shoot()).await.unwrap();
    rig.driver.set_connected(true);
    a.ctx.action_start(shoot()).await.unwrap();
    let snapshot = rig.handle.snapshot().await.unwrap();

    assert!(snapshot.hardware_ready);
    assert_eq!(hardware_status(&a.drain()), vec![false, true]);
    settle(&rig.driver, 1).await;
}

// =============================================================================
// Link failures
// =============================================================================

#[tokio::test]
async fn test_shot_lost_to_failed_write_is_refunded() {
    let (handle, _task, driver) = unreliable_arbiter().await;
    let mut a = Operator::open(&handle, "A", 1).await;
    handle.snapshot().await.unwrap();
    a.drain();

    driver.set_failing(true);
    a.ctx.action_start(shoot()).await.unwrap();
    let snapshot = until(&handle, |s| !s.hardware_ready).await;
    assert_eq!(snapshot.turn.current.unwrap().ammo_remaining, 1);

    let events = a.drain();
    assert!(events.iter().any(|e| matches!(
        e,
        OutboundEvent::ActionError { message } if message.contains("shoot failed")
    )));
    assert_eq!(hardware_status(&events), vec![false]);
    let last_ammo = events.iter().rev().find_map(|e| match e {
        OutboundEvent::TurnUpdate(turn) => turn.current.as_ref().map(|h| h.ammo_remaining),
        _ => None,
    });
    assert_eq!(last_ammo, Some(1));
}

#[tokio::test]
async fn test_recovered_link_is_announced() {
    let (handle, _task, driver) = unreliable_arbiter().await;
    let mut a = Operator::open(&handle, "A", 1).await;

    driver.set_failing(true);
    a.ctx.action_start(shoot()).await.unwrap();
    until(&handle, |s| !s.hardware_ready).await;
    a.drain();

    // the refunded shot succeeds once writes go through again
    driver.set_failing(false);
    a.ctx.action_start(shoot()).await.unwrap();
    let snapshot = until(&handle, |s| s.hardware_ready).await;

    assert_eq!(snapshot.turn.current.unwrap().ammo_remaining, 0);
    assert_eq!(hardware_status(&a.drain()), vec![true]);
    assert_eq!(driver.writes(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_dance_stops_after_failed_write() {
    let (handle, _task, driver) = unreliable_arbiter().await;
    let mut a = Operator::open(&handle, "A", 1).await;
    handle.snapshot().await.unwrap();
    a.drain();

    driver.set_failing(true);
    a.ctx
        .action_start(ActionRequest::new(ActionKind::Dance))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(10)).await;
    handle.snapshot().await.unwrap();

    let events = a.drain();
    let errors = events
        .iter()
        .filter(|e| matches!(e, OutboundEvent::ActionError { .. }))
        .count();
    assert_eq!(errors, 1);
    assert_eq!(hardware_status(&events), vec![false]);
}

// =============================================================================
// Wire frames
// =============================================================================

#[tokio::test]
async fn test_frames_round_trip_through_arbiter() {
    let rig = rig().await;
    let (tx, mut rx) = mpsc::channel(64);
    let ctx = SessionContext::open(rig.handle.clone(), "10.0.0.7", tx)
        .await
        .unwrap();

    let frame = r#"{"event":"register","displayName":"Alice"}"#;
    ctx.dispatch(decode_inbound(frame).unwrap()).await.unwrap();
    let frame = r#"{"event":"action-start","type":"move","direction":"BWD","speed":80,"ratio":0}"#;
    ctx.dispatch(decode_inbound(frame).unwrap()).await.unwrap();
    rig.handle.snapshot().await.unwrap();
    settle(&rig.driver, 2).await;

    assert_eq!(
        rig.driver.directives(),
        vec![MotorDirective::run(Port::A, -80), MotorDirective::run(Port::B, -80)]
    );

    let mut frames = Vec::new();
    while let Ok(event) = rx.try_recv() {
        frames.push(encode_outbound(&event).unwrap());
    }
    assert!(frames
        .iter()
        .any(|f| f.contains(r#""event":"roster-update""#) && f.contains("Alice")));
    assert!(frames
        .iter()
        .any(|f| f.contains(r#""event":"turn-update""#) && f.contains(r#""ammoRemaining":1"#)));
}

// =============================================================================
// Configuration
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_config_file_drives_arbiter() {
    use std::io::Write;

    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
[turns]
rotation_interval_secs = 5
ammo_per_turn = 2
"#
    )
    .unwrap();

    let config = arbiter_core::load_config_from_path(Some(file.path().to_path_buf())).unwrap();
    assert_eq!(config.rotation_interval, Duration::from_secs(5));

    let (handle, _task) = Arbiter::spawn(&config);
    let driver = Arc::new(SimulatedDriver::connect("/dev/null").await.unwrap());
    handle.hardware_ready(driver.clone()).await.unwrap();
    let rig = Rig {
        handle,
        _task,
        driver,
    };

    let a = Operator::join(&rig, "A", 1).await;
    let _b = Operator::join(&rig, "B", 2).await;
    a.ctx.action_start(shoot()).await.unwrap();
    a.ctx.action_start(shoot()).await.unwrap();
    let snapshot = rig.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.turn.current.unwrap().ammo_remaining, 0);
    settle(&rig.driver, 2).await;

    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(current(&rig.handle).await.as_deref(), Some("B"));
}
