//! Access Guard
//!
//! The single gate in front of every motion command. A command is allowed
//! only when the acting session is the current holder and has not left the
//! turn queue since it was promoted.

use crate::scheduler::TurnScheduler;
use crate::session::ConnectionId;

/// Decides whether a session may command the bot right now
#[derive(Debug, Default, Clone, Copy)]
pub struct AccessGuard;

impl AccessGuard {
    /// Whether `acting` holds the turn
    ///
    /// False when there is no current holder, when the current holder is a
    /// different session, and when the current holder has disconnected but
    /// the scheduler has not ticked yet.
    #[must_use]
    pub fn authorize(scheduler: &TurnScheduler, acting: ConnectionId) -> bool {
        let allowed = scheduler
            .current()
            .is_some_and(|holder| holder.session_id == acting)
            && scheduler.is_queued(acting);

        if !allowed {
            tracing::debug!(connection_id = %acting, "Access denied");
        }
        allowed
    }
}
