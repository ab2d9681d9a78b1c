//! Per-key FIFO gates.
//!
//! A gate admits one holder per key at a time. Places in line are taken
//! synchronously with [`KeyedGates::reserve`], so the admission order is the
//! order in which callers reserved, no matter when their futures are first
//! polled. Different keys never block each other. The scheduler reserves one
//! place per task when the task is created; the pool uses gates to keep
//! creation and eviction of the same conversation from interleaving.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;

// ============================================================================
// Gate
// ============================================================================

#[derive(Default)]
struct GateState {
    held: bool,
    /// Reservations behind the holder, oldest first.
    waiters: VecDeque<(u64, oneshot::Sender<()>)>,
}

/// One key's line.
#[derive(Default)]
struct Gate {
    // Never held across an await
    state: Mutex<GateState>,
}

impl Gate {
    fn state(&self) -> std::sync::MutexGuard<'_, GateState> {
        self.state.lock().expect("mutex poisoned")
    }

    /// Hand the gate to the oldest live waiter, or open it.
    fn release(&self) {
        let mut state = self.state();
        while let Some((_, tx)) = state.waiters.pop_front() {
            // A failed send means the waiter went away without withdrawing
            if tx.send(()).is_ok() {
                return;
            }
        }
        state.held = false;
    }
}

/// Maps key to (gate, last access time).
type GateStorage = DashMap<String, (Arc<Gate>, Instant)>;

/// Per-key FIFO gates with stale entry cleanup.
#[derive(Clone, Default)]
pub struct KeyedGates {
    gates: Arc<GateStorage>,
    next_ticket: Arc<AtomicU64>,
}

/// A place in line for one key.
///
/// Dropping a ticket before its turn gives up the place without blocking the
/// waiters behind it.
pub struct GateTicket {
    key: String,
    gate: Arc<Gate>,
    id: u64,
    /// `None` when the gate was free at reservation time.
    turn: Option<oneshot::Receiver<()>>,
    used: bool,
}

impl GateTicket {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Wait for this ticket's turn.
    pub async fn enter(mut self) -> KeyGuard {
        if let Some(turn) = self.turn.as_mut() {
            // Senders are only dropped after a send, so an error cannot
            // leave the gate held by someone else
            let _ = turn.await;
        }
        self.used = true;
        KeyGuard {
            key: std::mem::take(&mut self.key),
            gate: self.gate.clone(),
        }
    }
}

impl Drop for GateTicket {
    fn drop(&mut self) {
        if self.used {
            return;
        }
        let mut state = self.gate.state();
        if let Some(pos) = state.waiters.iter().position(|(id, _)| *id == self.id) {
            state.waiters.remove(pos);
            return;
        }
        // Our turn already came: pass it on
        drop(state);
        self.gate.release();
    }
}

/// Proof of holding the gate for one key. Dropping it admits the next waiter.
pub struct KeyGuard {
    key: String,
    gate: Arc<Gate>,
}

impl KeyGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        self.gate.release();
    }
}

impl std::fmt::Debug for KeyGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyGuard").field("key", &self.key).finish()
    }
}

impl KeyedGates {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the gate for `key`, refreshing its access time.
    fn gate(&self, key: &str) -> Arc<Gate> {
        let now = Instant::now();
        self.gates
            .entry(key.to_string())
            .and_modify(|(_, last_access)| *last_access = now)
            .or_insert_with(|| (Arc::new(Gate::default()), now))
            .0
            .clone()
    }

    /// Take a place in line for `key` without waiting.
    pub fn reserve(&self, key: &str) -> GateTicket {
        let gate = self.gate(key);
        let id = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let turn = {
            let mut state = gate.state();
            if !state.held && state.waiters.is_empty() {
                state.held = true;
                None
            } else {
                let (tx, rx) = oneshot::channel();
                state.waiters.push_back((id, tx));
                Some(rx)
            }
        };
        GateTicket {
            key: key.to_string(),
            gate,
            id,
            turn,
            used: false,
        }
    }

    /// Wait for the gate of `key` in FIFO order.
    pub async fn enter(&self, key: &str) -> KeyGuard {
        self.reserve(key).enter().await
    }

    /// Take the gate of `key` only if nobody holds or waits for it.
    pub fn try_enter(&self, key: &str) -> Option<KeyGuard> {
        let gate = self.gate(key);
        {
            let mut state = gate.state();
            if state.held || !state.waiters.is_empty() {
                return None;
            }
            state.held = true;
        }
        Some(KeyGuard {
            key: key.to_string(),
            gate,
        })
    }

    /// Whether someone currently holds the gate of `key`.
    pub fn is_held(&self, key: &str) -> bool {
        self.gates
            .get(key)
            .is_some_and(|entry| entry.0.state().held)
    }

    /// Remove gates that nobody holds or waits on and that were not touched
    /// within `max_age`. Returns the number of entries removed.
    pub fn cleanup_stale(&self, max_age: Duration) -> usize {
        let now = Instant::now();
        let before = self.gates.len();
        // strong_count == 1: only the map references the gate
        self.gates.retain(|_, (gate, last_access)| {
            Arc::strong_count(gate) > 1 || now.duration_since(*last_access) <= max_age
        });
        before.saturating_sub(self.gates.len())
    }

    /// Periodically drop stale gates until the runtime shuts down.
    pub fn spawn_cleanup_task(self, interval: Duration, max_age: Duration, name: &'static str) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let removed = self.cleanup_stale(max_age);
                if removed > 0 {
                    debug!(
                        removed = removed,
                        remaining = self.len(),
                        gates = name,
                        "Cleaned up stale gates"
                    );
                }
            }
        });
    }

    pub fn len(&self) -> usize {
        self.gates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gates.is_empty()
    }
}
