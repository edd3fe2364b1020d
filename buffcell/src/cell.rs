//! Buffer Cell - one named value with lazy reload
//!
//! A cell owns a value, a "needs reload" flag and the time of the last
//! change. Every operation that writes any of them first claims the cell's
//! `SignalChannel`, so at most one of `clear`, `modify` and the reload branch
//! of `load` runs at a time. Callers that find the cell busy wait for the
//! running operation to finish and then look at the cell again. A `load`
//! that waited for a reload which failed returns that failure instead of
//! calling the reload function once more.
//!
//! ```
//! use buffcell::BufferCell;
//!
//! let cell = BufferCell::new("cfg", 0, |x: &i32| x + 1);
//! assert_eq!(cell.load().unwrap(), 1);
//!
//! cell.modify(100);
//! assert_eq!(cell.load().unwrap(), 100);
//!
//! cell.clear();
//! assert_eq!(cell.load().unwrap(), 101);
//! ```

use std::error::Error;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::config::DEFAULT_CHANNEL_CAPACITY;
use crate::error::{BuffError, ReloadError, Result};
use crate::signal::{BusyClaim, Claim, SignalChannel};

/// Type-erased reload function as stored in a cell
pub(crate) type ReloadFn<T> = dyn Fn(&T) -> std::result::Result<T, ReloadError> + Send + Sync;

struct CellState<T> {
    value: T,
    needs_reload: bool,
    last_modified: DateTime<Utc>,
    failed_reloads: u64,
    // Cleared by the next successful reload or modify
    last_failure: Option<Arc<dyn Error + Send + Sync>>,
}

enum Lookup<T> {
    Fresh(T),
    /// Needs a reload; carries `failed_reloads` as seen at that moment
    Stale(u64),
}

struct CellInner<T> {
    name: String,
    state: RwLock<CellState<T>>,
    signal: SignalChannel,
    reload: Box<ReloadFn<T>>,
}

/// Handle to a named buffer cell
///
/// Clones share the same cell. The handle is `Send + Sync` when `T` is,
/// so it can be passed to worker threads as is.
///
/// The busy/idle channel of the cell can be observed through `subscribe`
/// and `is_busy`, but not published to or claimed from outside:
///
/// ```compile_fail
/// use buffcell::BufferCell;
///
/// let cell = BufferCell::new("cfg", 0, |x: &i32| x + 1);
/// cell.signal().publish(false);
/// ```
pub struct BufferCell<T> {
    inner: Arc<CellInner<T>>,
}

impl<T> Clone for BufferCell<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> std::fmt::Debug for BufferCell<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.read();
        f.debug_struct("BufferCell")
            .field("name", &self.inner.name)
            .field("needs_reload", &state.needs_reload)
            .field("last_modified", &state.last_modified)
            .finish_non_exhaustive()
    }
}

impl<T: Clone + 'static> BufferCell<T> {
    /// Create a standalone cell with an infallible reload function
    ///
    /// The cell starts out needing a reload, so the first `load` calls
    /// `reload` on `initial`.
    pub fn new<F>(name: impl Into<String>, initial: T, reload: F) -> Self
    where
        F: Fn(&T) -> T + Send + Sync + 'static,
    {
        Self::from_parts(
            name.into(),
            initial,
            Box::new(move |value: &T| Ok(reload(value))),
            DEFAULT_CHANNEL_CAPACITY,
        )
    }

    /// Create a standalone cell whose reload function may fail
    pub fn new_fallible<F, E>(name: impl Into<String>, initial: T, reload: F) -> Self
    where
        F: Fn(&T) -> std::result::Result<T, E> + Send + Sync + 'static,
        E: Into<ReloadError>,
    {
        Self::from_parts(
            name.into(),
            initial,
            Box::new(move |value: &T| reload(value).map_err(Into::into)),
            DEFAULT_CHANNEL_CAPACITY,
        )
    }

    pub(crate) fn from_parts(
        name: String,
        initial: T,
        reload: Box<ReloadFn<T>>,
        channel_capacity: usize,
    ) -> Self {
        let signal = SignalChannel::new(&name, channel_capacity);
        Self {
            inner: Arc::new(CellInner {
                name,
                state: RwLock::new(CellState {
                    value: initial,
                    needs_reload: true,
                    last_modified: Utc::now(),
                    failed_reloads: 0,
                    last_failure: None,
                }),
                signal,
                reload,
            }),
        }
    }

    // ------------------------------------------------------------------------
    // Operations
    // ------------------------------------------------------------------------

    /// Return the current value, reloading it first if needed
    ///
    /// Without a pending reload this only takes the value's read lock. With
    /// a pending reload, the first caller to claim the cell runs the reload
    /// function; concurrent callers wait for it and return its result,
    /// whether a value or an error.
    ///
    /// # Errors
    ///
    /// Returns `BuffError::ReloadFailed` if the reload function fails, both
    /// to the caller that ran it and to the callers waiting for it. The
    /// cell keeps needing a reload, so the next `load` tries again.
    ///
    /// # Panics
    ///
    /// Panics if called from inside an async runtime while another
    /// operation holds the cell; use `load_async` there.
    pub fn load(&self) -> Result<T> {
        loop {
            let failures_seen = match self.lookup() {
                Lookup::Fresh(value) => return Ok(value),
                Lookup::Stale(failures) => failures,
            };
            match self.inner.signal.claim_or_wait("load") {
                Claim::Acquired(claim) => return self.reload_claimed(&claim),
                Claim::Wait(waiter) => {
                    debug!(buffer = %self.inner.name, "load waits for running operation");
                    waiter.wait();
                    self.check_failed_since(failures_seen)?;
                }
            }
        }
    }

    /// Replace the value and cancel any pending reload
    ///
    /// # Panics
    ///
    /// Panics if called from inside an async runtime while another
    /// operation holds the cell; use `modify_async` there.
    pub fn modify(&self, value: T) {
        let _claim = self.claim("modify");
        debug!(buffer = %self.inner.name, "modify buffer");
        self.store(value);
    }

    /// Mark the value as outdated; the next `load` reloads it
    ///
    /// # Panics
    ///
    /// Panics if called from inside an async runtime while another
    /// operation holds the cell; use `clear_async` there.
    pub fn clear(&self) {
        let _claim = self.claim("clear");
        debug!(buffer = %self.inner.name, "clear buffer");
        self.inner.state.write().needs_reload = true;
    }

    /// Async version of `load`
    ///
    /// The reload function itself still runs synchronously on the calling task.
    ///
    /// # Errors
    ///
    /// Returns `BuffError::ReloadFailed` if the reload function fails.
    pub async fn load_async(&self) -> Result<T> {
        loop {
            let failures_seen = match self.lookup() {
                Lookup::Fresh(value) => return Ok(value),
                Lookup::Stale(failures) => failures,
            };
            match self.inner.signal.claim_or_wait("load_async") {
                Claim::Acquired(claim) => return self.reload_claimed(&claim),
                Claim::Wait(waiter) => {
                    debug!(buffer = %self.inner.name, "load waits for running operation");
                    waiter.wait_async().await;
                    self.check_failed_since(failures_seen)?;
                }
            }
        }
    }

    /// Async version of `modify`
    pub async fn modify_async(&self, value: T) {
        let _claim = self.claim_async("modify_async").await;
        debug!(buffer = %self.inner.name, "modify buffer");
        self.store(value);
    }

    /// Async version of `clear`
    pub async fn clear_async(&self) {
        let _claim = self.claim_async("clear_async").await;
        debug!(buffer = %self.inner.name, "clear buffer");
        self.inner.state.write().needs_reload = true;
    }

    // ------------------------------------------------------------------------
    // Observers
    // ------------------------------------------------------------------------

    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Current value, without reloading and without waiting for a running operation
    #[must_use]
    pub fn peek(&self) -> T {
        self.inner.state.read().value.clone()
    }

    #[must_use]
    pub fn needs_reload(&self) -> bool {
        self.inner.state.read().needs_reload
    }

    /// Time of registration, or of the last `modify` or successful reload
    #[must_use]
    pub fn last_modified(&self) -> DateTime<Utc> {
        self.inner.state.read().last_modified
    }

    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.inner.signal.is_busy()
    }

    /// Subscribe to the busy (`true`) / idle (`false`) transitions of this cell
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<bool> {
        self.inner.signal.subscribe()
    }

    pub(crate) fn signal(&self) -> &SignalChannel {
        &self.inner.signal
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    fn lookup(&self) -> Lookup<T> {
        let state = self.inner.state.read();
        if state.needs_reload {
            Lookup::Stale(state.failed_reloads)
        } else {
            Lookup::Fresh(state.value.clone())
        }
    }

    /// Fail with the error of a reload that failed while the caller waited
    fn check_failed_since(&self, failures_seen: u64) -> Result<()> {
        let state = self.inner.state.read();
        if !state.needs_reload || state.failed_reloads == failures_seen {
            return Ok(());
        }
        match &state.last_failure {
            Some(source) => {
                debug!(buffer = %self.inner.name, "load shares failure of awaited reload");
                Err(BuffError::ReloadFailed {
                    name: self.inner.name.clone(),
                    source: Arc::clone(source),
                })
            }
            None => Ok(()),
        }
    }

    fn claim(&self, debug_hint: &'static str) -> BusyClaim<'_> {
        loop {
            match self.inner.signal.claim_or_wait(debug_hint) {
                Claim::Acquired(claim) => return claim,
                Claim::Wait(waiter) => waiter.wait(),
            }
        }
    }

    async fn claim_async(&self, debug_hint: &'static str) -> BusyClaim<'_> {
        loop {
            match self.inner.signal.claim_or_wait(debug_hint) {
                Claim::Acquired(claim) => return claim,
                Claim::Wait(waiter) => waiter.wait_async().await,
            }
        }
    }

    fn store(&self, value: T) {
        let mut state = self.inner.state.write();
        state.value = value;
        state.last_modified = Utc::now();
        state.needs_reload = false;
        state.last_failure = None;
    }

    /// Run the reload function. The caller must hold the cell's claim.
    fn reload_claimed(&self, _claim: &BusyClaim<'_>) -> Result<T> {
        let reloaded = {
            let state = self.inner.state.read();
            // The previous claim holder may have reloaded already
            if !state.needs_reload {
                return Ok(state.value.clone());
            }
            debug!(buffer = %self.inner.name, "reload buffer");
            (self.inner.reload)(&state.value)
        };

        match reloaded {
            Ok(value) => {
                let mut state = self.inner.state.write();
                state.value = value;
                state.last_modified = Utc::now();
                state.needs_reload = false;
                state.last_failure = None;
                Ok(state.value.clone())
            }
            Err(source) => {
                warn!(buffer = %self.inner.name, error = %source, "reload failed");
                let source: Arc<dyn Error + Send + Sync> = Arc::from(source);
                let mut state = self.inner.state.write();
                state.failed_reloads += 1;
                state.last_failure = Some(Arc::clone(&source));
                Err(BuffError::ReloadFailed {
                    name: self.inner.name.clone(),
                    source,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    fn counting_cell(initial: i32) -> (BufferCell<i32>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);
        let cell = BufferCell::new("counting", initial, move |x: &i32| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
            x + 1
        });
        (cell, calls)
    }

    #[test]
    fn test_new_cell_needs_reload() {
        let (cell, calls) = counting_cell(0);
        assert!(cell.needs_reload());
        assert!(!cell.is_busy());
        assert_eq!(cell.peek(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_first_load_reloads() {
        let (cell, calls) = counting_cell(0);
        assert_eq!(cell.load().unwrap(), 1);
        assert!(!cell.needs_reload());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_second_load_uses_cached_value() {
        let (cell, calls) = counting_cell(0);
        assert_eq!(cell.load().unwrap(), 1);
        assert_eq!(cell.load().unwrap(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_clear_keeps_value() {
        let (cell, _calls) = counting_cell(0);
        cell.modify(7);
        cell.clear();
        assert!(cell.needs_reload());
        assert_eq!(cell.peek(), 7);
    }

    #[test]
    fn test_modify_updates_timestamp() {
        let (cell, _calls) = counting_cell(0);
        let before = cell.last_modified();
        cell.modify(5);
        assert!(cell.last_modified() >= before);
    }

    #[test]
    fn test_failed_reload_keeps_old_timestamp() {
        let cell = BufferCell::new_fallible("failing", 0, |_: &i32| {
            Err::<i32, _>("backend down")
        });
        let before = cell.last_modified();
        assert!(cell.load().is_err());
        assert_eq!(cell.last_modified(), before);
        assert!(cell.needs_reload());
    }

    #[test]
    fn test_reload_under_foreign_claim_is_skipped_when_fresh() {
        let (cell, calls) = counting_cell(0);
        cell.modify(3);
        let claim = cell.signal().try_claim("test").unwrap();
        assert_eq!(cell.reload_claimed(&claim).unwrap(), 3);
        drop(claim);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_load_behind_clear_reloads_itself() {
        let (cell, calls) = counting_cell(0);
        assert_eq!(cell.load().unwrap(), 1);
        cell.clear();

        // Stand-in for a clear that is still running
        let claim = cell.signal().try_claim("clear").unwrap();

        let loader = {
            let cell = cell.clone();
            thread::spawn(move || cell.load().unwrap())
        };
        thread::sleep(Duration::from_millis(20));
        drop(claim);

        assert_eq!(loader.join().unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_load_behind_failed_reload_shares_error() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);
        let cell = BufferCell::new_fallible("failing", 0, move |_: &i32| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
            Err::<i32, _>("backend down")
        });

        let claim = cell.signal().try_claim("load").unwrap();
        let loader = {
            let cell = cell.clone();
            thread::spawn(move || cell.load())
        };
        thread::sleep(Duration::from_millis(20));
        assert!(cell.reload_claimed(&claim).is_err());
        drop(claim);

        match loader.join().unwrap() {
            Err(BuffError::ReloadFailed { name, source }) => {
                assert_eq!(name, "failing");
                assert_eq!(source.to_string(), "backend down");
            }
            other => panic!("Expected ReloadFailed, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // A new call retries
        assert!(cell.load().is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_successful_reload_forgets_failure() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);
        let cell = BufferCell::new_fallible("recovering", 0, move |x: &i32| {
            if calls_clone.fetch_add(1, Ordering::SeqCst) == 0 {
                Err("backend down")
            } else {
                Ok(x + 1)
            }
        });
        assert!(cell.load().is_err());
        assert_eq!(cell.load().unwrap(), 1);
        assert!(cell.inner.state.read().last_failure.is_none());
    }

    #[test]
    fn test_clones_share_state() {
        let (cell, _calls) = counting_cell(0);
        let other = cell.clone();
        other.modify(42);
        assert_eq!(cell.load().unwrap(), 42);
        assert_eq!(cell.name(), "counting");
    }
}
