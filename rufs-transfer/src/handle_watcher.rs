//! Idle-close watcher: the 60-second "nobody is reading this file and no
//! orchestration session needs it alive" timer (spec.md §4.6), plus a
//! once-a-second debug heartbeat (`original_source/client/transfer/
//! transfer.go`'s `Transfer.init()` spawns a dedicated goroutine for
//! exactly this).
//!
//! Grounded on `transfer.go`'s `openHandlesWatcher`, reshaped onto
//! `actor.rs`'s `Actor`/`Act::WaitOr` pattern instead of Go's bare `select`
//! over a handles channel and a `time.After` deadline. Rather than juggling
//! two independent timers, the watcher always waits on a 1-second tick and
//! tracks elapsed idle time itself -- one timer channel serving both the
//! heartbeat and the idle-close deadline, instead of a third background
//! thread.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use crate::actor::{Act, Actor, ActorHandle, Capacity};
use crate::transfer::Transfer;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);
const IDLE_CLOSE_TIMEOUT: Duration = Duration::from_secs(60);

/// Posted whenever the handle count changes, and synthesized by the actor
/// loop itself on every heartbeat tick.
pub enum HandleEvent {
    Handles(usize),
    Tick,
}

struct Watcher {
    transfer: Weak<Transfer>,
    idle_since: Option<Instant>,
}

impl Actor for Watcher {
    type Message = HandleEvent;
    type Error = std::convert::Infallible;

    fn handle(&mut self, msg: HandleEvent) -> Result<Act<Self>, Self::Error> {
        let transfer = match self.transfer.upgrade() {
            Some(t) => t,
            // The Transfer was dropped without going through close(); nothing
            // left to watch.
            None => return Ok(Act::Shutdown),
        };

        match msg {
            HandleEvent::Handles(n) => {
                if let Some(session) = transfer.current_session() {
                    session.set_have_handles(n > 0);
                }
                self.idle_since = if n == 0 && !transfer.is_orchestrated() {
                    Some(self.idle_since.unwrap_or_else(Instant::now))
                } else {
                    None
                };
            }
            HandleEvent::Tick => {
                transfer.trace_progress();
                if let Some(since) = self.idle_since {
                    if since.elapsed() >= IDLE_CLOSE_TIMEOUT {
                        transfer.close();
                        return Ok(Act::Shutdown);
                    }
                }
            }
        }

        Ok(Act::WaitOr {
            timeout: HEARTBEAT_INTERVAL,
            timeout_msg: HandleEvent::Tick,
        })
    }
}

/// Spawns the watcher thread for `transfer`, returning the handle the
/// `Transfer` uses to post handle-count updates. Holds only a `Weak`
/// reference back, so the watcher thread is never what keeps a `Transfer`
/// alive.
pub fn spawn(transfer: &Arc<Transfer>) -> ActorHandle<HandleEvent> {
    let weak = Arc::downgrade(transfer);
    Actor::spawn(Capacity::Bounded(10), move |_sender| Watcher {
        transfer: weak,
        idle_since: None,
    })
}
