//! Scheduling Primitives - Park/Unpark on Typed Wait Queues
//!
//! The paging code never sleeps on a raw condition variable. Each shared
//! resource that threads can wait for gets its own `WaitQueue`, and the
//! actual blocking is delegated to a `Parker` supplied by the kernel's
//! scheduler.
//!
//! Waiting follows the usual condition-variable contract without tying the
//! queue to any particular lock:
//! 1. While holding the lock that guards the predicate, call `prepare()`.
//! 2. Release the lock.
//! 3. Call `wait(token)`; it returns once some `wake_all()` happened after
//!    `prepare()`.
//! 4. Re-acquire the lock and re-check the predicate.
//!
//! A wakeup that races with step 2 is never lost: it advances the queue's
//! epoch, and `wait` returns immediately for a stale token.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

// ============================================================================
// Wait Reason
// ============================================================================

/// What a queue's waiters are blocked on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum WaitReason {
    /// Every physical frame is pinned
    FrameUnpinned = 1,
    /// Another thread is paging this page in or out
    PageTransit = 2,
}

// ============================================================================
// Parker
// ============================================================================

/// Thread blocking primitive supplied by the scheduler
pub trait Parker: Send + Sync {
    /// Block the calling thread until `ready` returns true
    ///
    /// Implementations may wake spuriously; `ready` is re-checked each time.
    fn park(&self, ready: &dyn Fn() -> bool);

    /// Wake every parked thread so it re-checks its condition
    fn unpark_all(&self);
}

/// Parker that spins with a CPU hint
///
/// For bare configurations with no scheduler to yield to.
#[derive(Debug, Default, Clone, Copy)]
pub struct SpinParker;

impl Parker for SpinParker {
    fn park(&self, ready: &dyn Fn() -> bool) {
        while !ready() {
            core::hint::spin_loop();
        }
    }

    fn unpark_all(&self) {}
}

/// Parker backed by an OS mutex and condition variable
#[cfg(feature = "std")]
#[derive(Debug, Default)]
pub struct ThreadParker {
    lock: std::sync::Mutex<()>,
    cond: std::sync::Condvar,
}

#[cfg(feature = "std")]
impl ThreadParker {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(feature = "std")]
impl Parker for ThreadParker {
    fn park(&self, ready: &dyn Fn() -> bool) {
        let mut guard = self
            .lock
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        while !ready() {
            guard = self
                .cond
                .wait(guard)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
    }

    fn unpark_all(&self) {
        // Taking the lock orders this wakeup after any in-progress check
        let _guard = self
            .lock
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        self.cond.notify_all();
    }
}

/// The parker the crate uses when none is supplied
pub fn default_parker() -> Arc<dyn Parker> {
    #[cfg(feature = "std")]
    {
        Arc::new(ThreadParker::new())
    }
    #[cfg(not(feature = "std"))]
    {
        Arc::new(SpinParker)
    }
}

// ============================================================================
// Wait Queue
// ============================================================================

/// Snapshot of a queue's epoch taken under the guarding lock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "a prepared wait must be passed to WaitQueue::wait"]
pub struct WaitToken(u64);

/// Queue of threads waiting for one kind of event
pub struct WaitQueue {
    reason: WaitReason,
    epoch: AtomicU64,
    waiters: AtomicU32,
    parker: Arc<dyn Parker>,
}

impl WaitQueue {
    /// Create a wait queue
    pub fn new(reason: WaitReason, parker: Arc<dyn Parker>) -> Self {
        Self {
            reason,
            epoch: AtomicU64::new(0),
            waiters: AtomicU32::new(0),
            parker,
        }
    }

    /// What this queue waits for
    pub fn reason(&self) -> WaitReason {
        self.reason
    }

    /// Start a wait; call while holding the lock guarding the condition
    pub fn prepare(&self) -> WaitToken {
        WaitToken(self.epoch.load(Ordering::SeqCst))
    }

    /// Block until a wakeup newer than `token`; call after releasing the lock
    pub fn wait(&self, token: WaitToken) {
        self.waiters.fetch_add(1, Ordering::SeqCst);
        let epoch = &self.epoch;
        self.parker.park(&|| epoch.load(Ordering::SeqCst) != token.0);
        self.waiters.fetch_sub(1, Ordering::SeqCst);
    }

    /// Wake every waiter
    pub fn wake_all(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        if self.waiters.load(Ordering::SeqCst) > 0 {
            self.parker.unpark_all();
        }
    }

    /// Number of threads currently parked here
    pub fn waiters(&self) -> u32 {
        self.waiters.load(Ordering::SeqCst)
    }
}

impl core::fmt::Debug for WaitQueue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("WaitQueue")
            .field("reason", &self.reason)
            .field("epoch", &self.epoch.load(Ordering::Relaxed))
            .field("waiters", &self.waiters())
            .finish()
    }
}
