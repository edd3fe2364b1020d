//! Signal Channel
//!
//! Per-buffer busy/idle signalling for coordinating threads (and async
//! tasks) that operate on the same cell.
//!
//! # 1) Waiting for idle
//!
//! In the first approximation, the workflow is as follows:
//!
//! 10. Client: check that the channel is busy
//! 20. Client: call `wait_idle`
//! 30. Channel-for-client: add client to the waiting list
//! 40. Channel-for-client: block until released
//!
//! 50. Worker: finish the operation, `publish(false)`
//! 60. Channel-for-worker: extract the client(s) from the waiting list
//! 70. Channel-for-worker: release the client(s)
//!
//! The worker runs in a different thread, so the step 50 can happen
//! between the steps 10 and 30. The client would then wait for a transition
//! that has already happened. To avoid this, the client holds the channel
//! lock over the steps 10-30:
//!
//! ```
//! use buffcell::signal::SignalChannel;
//!
//! let channel = SignalChannel::new("cfg", 16);
//! let lock = channel.get_lock();
//! if lock.is_busy() {
//!     // lock is consumed and released before blocking
//!     channel.wait_idle("reader", lock).wait();
//! }
//! ```
//!
//! Waking up only means "the operation I saw running has finished". Another
//! operation may have claimed the channel in between, so the client should
//! re-check whatever it was waiting for.
//!
//! # 2) Claiming
//!
//! `try_claim` and `claim_or_wait` move the channel from idle to busy under
//! the same lock. The returned `BusyClaim` publishes idle when dropped, also
//! when the owner returns early with an error or unwinds from a panic.
//!
//! # 3) Subscribing
//!
//! Nothing special here. Subscribers see the transitions published after
//! they subscribed, in publication order.

use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;
use tokio::sync::{broadcast, oneshot};

// ============================================================================
// Client Types
// ============================================================================

/// Represents a client waiting for the channel to become idle
struct WaitingClient {
    sender: oneshot::Sender<()>,
    debug_hint: String,
}

impl std::fmt::Debug for WaitingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WaitingClient")
            .field("debug_hint", &self.debug_hint)
            .finish_non_exhaustive()
    }
}

/// Broadcast channel for busy/idle transitions, created on first subscription
struct BroadcastChannel {
    sender: broadcast::Sender<bool>,
}

impl std::fmt::Debug for BroadcastChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastChannel")
            .field("subscriber_count", &self.sender.receiver_count())
            .finish()
    }
}

// ============================================================================
// Internal State
// ============================================================================

#[derive(Debug)]
pub struct ChannelState {
    busy: bool,
    waiting_clients: Vec<WaitingClient>,
    broadcast: Option<BroadcastChannel>,
}

impl ChannelState {
    fn new() -> Self {
        Self {
            busy: false,
            waiting_clients: Vec::new(),
            broadcast: None,
        }
    }

    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.busy
    }
}

fn state_label(busy: bool) -> &'static str {
    if busy {
        "busy"
    } else {
        "idle"
    }
}

// ============================================================================
// Main Channel
// ============================================================================

/// Busy/idle broadcast point for one named buffer
#[derive(Clone)]
pub struct SignalChannel {
    inner: Arc<Mutex<ChannelState>>,
    name: Arc<str>,
    channel_capacity: usize,
}

impl std::fmt::Debug for SignalChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalChannel")
            .field("name", &self.name)
            .field("busy", &self.is_busy())
            .finish_non_exhaustive()
    }
}

impl SignalChannel {
    /// Create an idle channel
    ///
    /// # Arguments
    /// * `name` - Name of the buffer, used in log lines
    /// * `channel_capacity` - Capacity of the broadcast channel for subscribers,
    ///   at least one
    #[must_use]
    pub fn new(name: &str, channel_capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ChannelState::new())),
            name: Arc::from(name),
            channel_capacity: channel_capacity.max(1),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the lock for atomic condition-check + wait operations
    pub fn get_lock(&self) -> MutexGuard<'_, ChannelState> {
        self.inner.lock()
    }

    /// Snapshot of the busy flag. Stale as soon as it is returned.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.inner.lock().busy
    }

    /// Publish a new state to waiters and subscribers
    ///
    /// Publishing `false` releases every client blocked in `wait_idle`.
    pub fn publish(&self, busy: bool) {
        let mut state = self.inner.lock();
        self.publish_locked(&mut state, busy);
    }

    /// Wait until the channel becomes idle
    ///
    /// Precondition: The caller should acquire the lock before calling this method.
    /// Post-condition: The lock is released after the method returns.
    ///
    /// If the channel is idle already, the returned waiter completes at once.
    /// See the module documentation for the lock acquisition pattern.
    pub fn wait_idle(
        &self,
        debug_hint: &str,
        mut lock: MutexGuard<'_, ChannelState>,
    ) -> IdleWaiter {
        if !lock.busy {
            return IdleWaiter { receiver: None };
        }
        let (tx, rx) = oneshot::channel();
        lock.waiting_clients.push(WaitingClient {
            sender: tx,
            debug_hint: debug_hint.to_string(),
        });
        drop(lock);
        IdleWaiter { receiver: Some(rx) }
    }

    /// Claim the channel if it is idle
    ///
    /// Returns `None` without waiting if another claim is active.
    pub fn try_claim(&self, debug_hint: &'static str) -> Option<BusyClaim<'_>> {
        let mut state = self.inner.lock();
        if state.busy {
            return None;
        }
        self.publish_locked(&mut state, true);
        Some(BusyClaim {
            channel: self,
            debug_hint,
        })
    }

    /// Claim the channel, or get a waiter for the running claim to finish
    ///
    /// Both the check and the waiter registration happen under one lock,
    /// so the idle transition of the running claim cannot be missed.
    pub fn claim_or_wait(&self, debug_hint: &'static str) -> Claim<'_> {
        let mut state = self.inner.lock();
        if state.busy {
            return Claim::Wait(self.wait_idle(debug_hint, state));
        }
        self.publish_locked(&mut state, true);
        Claim::Acquired(BusyClaim {
            channel: self,
            debug_hint,
        })
    }

    /// Subscribe to the busy/idle transitions
    ///
    /// Returns a broadcast Receiver. All subscribers receive all transitions
    /// published after this call. Drop the Receiver to unsubscribe.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<bool> {
        let mut state = self.inner.lock();
        let capacity = self.channel_capacity;
        let broadcast = state.broadcast.get_or_insert_with(|| {
            let (tx, _rx) = broadcast::channel(capacity);
            BroadcastChannel { sender: tx }
        });
        broadcast.sender.subscribe()
    }

    // No unsubscribe() needed - just drop the Receiver!

    fn publish_locked(&self, state: &mut ChannelState, busy: bool) {
        if state.busy == busy {
            log::warn!(
                "signal.publish: buffer '{}' is already {}",
                self.name,
                state_label(busy)
            );
        }
        state.busy = busy;

        let waiters = if busy {
            Vec::new()
        } else {
            std::mem::take(&mut state.waiting_clients)
        };

        log::debug!(
            "signal.publish: buffer '{}', state={}, waiters: {}, subscribers: {}",
            self.name,
            state_label(busy),
            waiters.len(),
            state
                .broadcast
                .as_ref()
                .map_or(0, |bc| bc.sender.receiver_count())
        );

        for waiter in waiters {
            if waiter.sender.send(()).is_err() {
                log::debug!(
                    "signal.publish: waiter gone for buffer '{}' (hint: {})",
                    self.name,
                    waiter.debug_hint
                );
            }
        }

        // Sent under the lock, so every subscriber sees the same order
        if let Some(bc) = &state.broadcast {
            if let Err(e) = bc.sender.send(busy) {
                log::debug!(
                    "signal.publish: no subscribers left for buffer '{}': {}",
                    self.name,
                    e
                );
            }
        }
    }
}

// ============================================================================
// Waiting and Claiming
// ============================================================================

/// Pending wait for the channel to become idle
#[derive(Debug)]
#[must_use = "an IdleWaiter does nothing until waited on"]
pub struct IdleWaiter {
    receiver: Option<oneshot::Receiver<()>>,
}

impl IdleWaiter {
    /// Block the current thread until the channel is released
    ///
    /// # Panics
    ///
    /// Panics if called from inside an async runtime; use `wait_async` there.
    pub fn wait(self) {
        if let Some(rx) = self.receiver {
            // An error means the channel was dropped with clients still
            // waiting. Nothing is left to wait for in that case.
            let _ = rx.blocking_recv();
        }
    }

    /// Wait asynchronously until the channel is released
    pub async fn wait_async(self) {
        if let Some(rx) = self.receiver {
            let _ = rx.await;
        }
    }
}

/// Result of `SignalChannel::claim_or_wait`
#[derive(Debug)]
pub enum Claim<'a> {
    /// The caller now owns the busy state
    Acquired(BusyClaim<'a>),
    /// Another claim is running; wait for it, then try again
    Wait(IdleWaiter),
}

/// Ownership of the busy state. Publishes idle on drop.
#[derive(Debug)]
#[must_use = "dropping a BusyClaim releases the channel immediately"]
pub struct BusyClaim<'a> {
    channel: &'a SignalChannel,
    debug_hint: &'static str,
}

impl Drop for BusyClaim<'_> {
    fn drop(&mut self) {
        log::debug!(
            "signal.release: buffer '{}' (hint: {})",
            self.channel.name,
            self.debug_hint
        );
        self.channel.publish(false);
    }
}
