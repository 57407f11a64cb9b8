//! Turn Scheduler
//!
//! Round-robin ownership of the bot. The scheduler owns the turn queue and
//! the two holder records (current and next) and advances them on every
//! rotation tick.
//!
//! # Rotation
//!
//! ```text
//!   queue: [A, B, C]
//!
//!   tick 0 (idle):  current = -    next = -
//!   tick 1:         current = A    next = B     (empty promotion re-runs)
//!   tick 2:         current = B    next = C
//!   tick 3:         current = C    next = A     (wraps)
//! ```
//!
//! The lookahead is located by session id in the live queue. A next holder
//! that has left the queue resolves to position -1, so the following rotation
//! starts again from the head. Display names are resolved live at promotion
//! time through the caller-supplied resolver.
//!
//! The scheduler is plain data: the arbiter task drives ticks from its timer
//! and is the only writer.

use crate::messages::{HolderView, TurnSnapshot};
use crate::session::ConnectionId;

/// Shots granted at the start of every turn
pub const DEFAULT_AMMO_PER_TURN: u32 = 1;

/// A session that holds (or will hold) the turn
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Holder {
    /// Session id of the holder
    pub session_id: ConnectionId,
    /// Display name resolved at promotion time
    pub display_name: String,
    /// Shots left in this turn
    pub ammo_remaining: u32,
}

impl Holder {
    fn view(&self) -> HolderView {
        HolderView {
            name: self.display_name.clone(),
            ammo_remaining: self.ammo_remaining,
        }
    }
}

/// Macro-state of the scheduler
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedulerState {
    /// No eligible current holder
    Idle,
    /// A queued current holder exists and access is enforced
    Active,
}

/// Registered session ids in registration order
#[derive(Clone, Debug, Default)]
pub struct TurnQueue {
    ids: Vec<ConnectionId>,
}

impl TurnQueue {
    /// Append a session (ignored if already queued)
    pub fn push(&mut self, id: ConnectionId) {
        if !self.contains(id) {
            self.ids.push(id);
        }
    }

    /// Remove a session, returning the position it held
    pub fn remove(&mut self, id: ConnectionId) -> Option<usize> {
        let index = self.position(id)?;
        self.ids.remove(index);
        Some(index)
    }

    /// Position of a session in the queue
    #[must_use]
    pub fn position(&self, id: ConnectionId) -> Option<usize> {
        self.ids.iter().position(|queued| *queued == id)
    }

    /// Session at a position
    #[must_use]
    pub fn get(&self, index: usize) -> Option<ConnectionId> {
        self.ids.get(index).copied()
    }

    /// Whether a session is queued
    #[must_use]
    pub fn contains(&self, id: ConnectionId) -> bool {
        self.ids.contains(&id)
    }

    /// Number of queued sessions
    #[must_use]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Whether the queue is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Queued ids in order
    pub fn iter(&self) -> impl Iterator<Item = ConnectionId> + '_ {
        self.ids.iter().copied()
    }
}

/// Outcome of a rotation tick
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rotation {
    /// Current holder before the tick
    pub previous: Option<ConnectionId>,
    /// Current holder after the tick
    pub current: Option<ConnectionId>,
    /// Public state after the tick
    pub snapshot: TurnSnapshot,
}

impl Rotation {
    /// Whether the turn moved to a different session
    #[must_use]
    pub fn changed_hands(&self) -> bool {
        self.previous != self.current
    }
}

/// Round-robin turn state machine
#[derive(Debug)]
pub struct TurnScheduler {
    queue: TurnQueue,
    current: Option<Holder>,
    next: Option<Holder>,
    ammo_per_turn: u32,
    rotations: u64,
}

impl Default for TurnScheduler {
    fn default() -> Self {
        Self::new(DEFAULT_AMMO_PER_TURN)
    }
}

impl TurnScheduler {
    /// Create an idle scheduler
    #[must_use]
    pub fn new(ammo_per_turn: u32) -> Self {
        Self {
            queue: TurnQueue::default(),
            current: None,
            next: None,
            ammo_per_turn,
            rotations: 0,
        }
    }

    /// Current macro-state
    #[must_use]
    pub fn state(&self) -> SchedulerState {
        // a departed holder stays recorded until the next tick but holds nothing
        if self
            .current
            .as_ref()
            .is_some_and(|h| self.queue.contains(h.session_id))
        {
            SchedulerState::Active
        } else {
            SchedulerState::Idle
        }
    }

    /// The turn queue
    #[must_use]
    pub fn queue(&self) -> &TurnQueue {
        &self.queue
    }

    /// Current holder, possibly stale until the next tick
    #[must_use]
    pub fn current(&self) -> Option<&Holder> {
        self.current.as_ref()
    }

    /// Lookahead holder
    #[must_use]
    pub fn next(&self) -> Option<&Holder> {
        self.next.as_ref()
    }

    /// Number of completed promotions
    #[must_use]
    pub fn rotations(&self) -> u64 {
        self.rotations
    }

    /// Whether a session is still queued
    #[must_use]
    pub fn is_queued(&self, id: ConnectionId) -> bool {
        self.queue.contains(id)
    }

    /// Append a newly registered session
    pub fn enqueue(&mut self, id: ConnectionId) {
        self.queue.push(id);
        tracing::debug!(connection_id = %id, queue_len = self.queue.len(), "Enqueued session");
    }

    /// Point a wrapped lookahead at a joiner that landed right after the holder
    ///
    /// A lookahead computed while the holder sat at the tail wraps to the head
    /// of the queue; once someone queues behind the holder, they are next.
    /// Returns true if the lookahead moved.
    pub fn refresh_lookahead<F>(&mut self, resolve: F) -> bool
    where
        F: Fn(ConnectionId) -> Option<String>,
    {
        let len = self.queue.len();
        let Some(holder_at) = self
            .current
            .as_ref()
            .and_then(|h| self.queue.position(h.session_id))
        else {
            return false;
        };
        let wrapped = match self
            .next
            .as_ref()
            .and_then(|h| self.queue.position(h.session_id))
        {
            Some(at) => at <= holder_at,
            None => true,
        };

        if holder_at + 2 != len || !wrapped {
            return false;
        }
        match self.holder_at(len - 1, &resolve) {
            Some(holder) => {
                tracing::debug!(next = %holder.display_name, "Lookahead moved to new joiner");
                self.next = Some(holder);
                true
            }
            None => false,
        }
    }

    /// Remove a session from the queue
    ///
    /// A removed current holder stays recorded until the next tick (the
    /// access guard already refuses it). A removed next holder is replaced by
    /// the session that inherited its queue position, so the rotation order
    /// of everyone else is unchanged.
    ///
    /// Returns true if the public turn state changed.
    pub fn dequeue<F>(&mut self, id: ConnectionId, resolve: F) -> bool
    where
        F: Fn(ConnectionId) -> Option<String>,
    {
        let Some(removed_at) = self.queue.remove(id) else {
            return false;
        };
        tracing::debug!(connection_id = %id, queue_len = self.queue.len(), "Dequeued session");

        if self.next.as_ref().is_some_and(|h| h.session_id == id) {
            let index = if removed_at < self.queue.len() {
                removed_at
            } else {
                0
            };
            self.next = self.holder_at(index, &resolve);
            return true;
        }
        false
    }

    /// Advance the rotation
    ///
    /// Returns `None` for an idle no-op (nothing queued, nothing held).
    pub fn tick<F>(&mut self, resolve: F) -> Option<Rotation>
    where
        F: Fn(ConnectionId) -> Option<String>,
    {
        if self.queue.is_empty() && self.current.is_none() && self.next.is_none() {
            tracing::trace!("Rotation tick while idle");
            return None;
        }

        let previous = self.current.as_ref().map(|h| h.session_id);
        self.advance(&resolve);

        if self.current.is_none() && self.next.is_some() {
            tracing::debug!("Promotion left no current holder, rotating again");
            self.advance(&resolve);
        }

        self.rotations += 1;
        let current = self.current.as_ref().map(|h| h.session_id);
        tracing::info!(
            current = self.current.as_ref().map_or("-", |h| h.display_name.as_str()),
            next = self.next.as_ref().map_or("-", |h| h.display_name.as_str()),
            rotation = self.rotations,
            "Turn rotated"
        );

        Some(Rotation {
            previous,
            current,
            snapshot: self.snapshot(),
        })
    }

    /// Shots left for the current holder
    #[must_use]
    pub fn ammo_remaining(&self) -> Option<u32> {
        self.current.as_ref().map(|h| h.ammo_remaining)
    }

    /// Spend one shot from the current holder
    ///
    /// Returns false (and changes nothing) when no shot is left.
    pub fn spend_ammo(&mut self) -> bool {
        match self.current.as_mut() {
            Some(holder) if holder.ammo_remaining > 0 => {
                holder.ammo_remaining -= 1;
                true
            }
            _ => false,
        }
    }

    /// Give back a shot that never fired
    ///
    /// Applies only while `session` still holds the turn numbered `turn`,
    /// and never above the per-turn allotment.
    pub fn refund_ammo(&mut self, session: ConnectionId, turn: u64) -> bool {
        if self.rotations != turn || !self.queue.contains(session) {
            return false;
        }
        match self.current.as_mut() {
            Some(holder)
                if holder.session_id == session && holder.ammo_remaining < self.ammo_per_turn =>
            {
                holder.ammo_remaining += 1;
                true
            }
            _ => false,
        }
    }

    /// Public view of both holders
    ///
    /// A departed holder is left out so surfaces never show it as current.
    #[must_use]
    pub fn snapshot(&self) -> TurnSnapshot {
        TurnSnapshot {
            current: self
                .current
                .as_ref()
                .filter(|h| self.queue.contains(h.session_id))
                .map(Holder::view),
            next: self.next.as_ref().map(Holder::view),
        }
    }

    fn advance<F>(&mut self, resolve: &F)
    where
        F: Fn(ConnectionId) -> Option<String>,
    {
        // absent lookahead counts as position -1
        let advanced = match self
            .next
            .as_ref()
            .and_then(|h| self.queue.position(h.session_id))
        {
            Some(position) if position + 1 < self.queue.len() => position + 1,
            _ => 0,
        };

        let promoted = self
            .next
            .take()
            .filter(|h| self.queue.contains(h.session_id));
        self.current = promoted.map(|holder| Holder {
            ammo_remaining: self.ammo_per_turn,
            ..holder
        });
        self.next = self.holder_at(advanced, resolve);
    }

    fn holder_at<F>(&self, index: usize, resolve: &F) -> Option<Holder>
    where
        F: Fn(ConnectionId) -> Option<String>,
    {
        let session_id = self.queue.get(index)?;
        let display_name = resolve(session_id)?;
        Some(Holder {
            session_id,
            display_name,
            ammo_remaining: self.ammo_per_turn,
        })
    }
}
