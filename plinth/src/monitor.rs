//! Per-object monitor: a mutex and condition variable pair with intrinsic
//! lock/wait/notify semantics.
//!
//! A monitor is embedded in the header of every instance whose descriptor is
//! declared lockable. The lock is not recursive: a thread taking a monitor it
//! already owns is a usage error and traps instead of deadlocking. Ownership
//! is tracked by thread id so misuse (unlock or wait without holding the
//! lock) traps as well.

use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
struct MonitorState {
    owner: Option<ThreadId>,
}

/// Monitor embedded in lockable object headers.
///
/// Two condition variables share the state mutex: `entry` hands the lock to
/// the next contender, `signal` carries notify/wait traffic. There is no
/// fairness contract between waiters and fresh lockers.
#[derive(Debug)]
pub(crate) struct Monitor {
    state: Mutex<MonitorState>,
    entry: Condvar,
    signal: Condvar,
}

impl Monitor {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(MonitorState::default()),
            entry: Condvar::new(),
            signal: Condvar::new(),
        }
    }

    /// Block until the monitor is owned by the calling thread.
    pub(crate) fn lock(&self) {
        let me = thread::current().id();
        let mut state = self.state.lock();
        if state.owner == Some(me) {
            panic!("recursive monitor lock by thread {me:?}");
        }
        while state.owner.is_some() {
            self.entry.wait(&mut state);
        }
        state.owner = Some(me);
    }

    /// Non-blocking lock. Returns false if another thread owns the monitor.
    pub(crate) fn try_lock(&self) -> bool {
        let me = thread::current().id();
        let mut state = self.state.lock();
        if state.owner == Some(me) {
            panic!("recursive monitor try_lock by thread {me:?}");
        }
        if state.owner.is_some() {
            return false;
        }
        state.owner = Some(me);
        true
    }

    pub(crate) fn unlock(&self) {
        let me = thread::current().id();
        let mut state = self.state.lock();
        if state.owner != Some(me) {
            panic!("monitor unlock by thread {me:?} which does not hold the lock");
        }
        state.owner = None;
        drop(state);
        self.entry.notify_one();
    }

    pub(crate) fn is_locked(&self) -> bool {
        self.state.lock().owner.is_some()
    }

    /// Release the lock, block until notified, reacquire the lock.
    pub(crate) fn wait(&self) {
        let me = thread::current().id();
        let mut state = self.state.lock();
        if state.owner != Some(me) {
            panic!("monitor wait by thread {me:?} which does not hold the lock");
        }
        state.owner = None;
        self.entry.notify_one();
        self.signal.wait(&mut state);
        while state.owner.is_some() {
            self.entry.wait(&mut state);
        }
        state.owner = Some(me);
    }

    /// Like [`wait`](Self::wait) with a timeout. Returns true when woken by a
    /// notification, false when the duration elapsed first. The lock is held
    /// again on return either way.
    pub(crate) fn wait_for(&self, timeout: Duration) -> bool {
        let me = thread::current().id();
        let mut state = self.state.lock();
        if state.owner != Some(me) {
            panic!("monitor wait_for by thread {me:?} which does not hold the lock");
        }
        state.owner = None;
        self.entry.notify_one();
        let result = self.signal.wait_for(&mut state, timeout);
        while state.owner.is_some() {
            self.entry.wait(&mut state);
        }
        state.owner = Some(me);
        !result.timed_out()
    }

    /// Like [`wait_for`](Self::wait_for) with an absolute deadline.
    pub(crate) fn wait_until(&self, deadline: Instant) -> bool {
        let me = thread::current().id();
        let mut state = self.state.lock();
        if state.owner != Some(me) {
            panic!("monitor wait_until by thread {me:?} which does not hold the lock");
        }
        state.owner = None;
        self.entry.notify_one();
        let result = self.signal.wait_until(&mut state, deadline);
        while state.owner.is_some() {
            self.entry.wait(&mut state);
        }
        state.owner = Some(me);
        !result.timed_out()
    }

    /// Wake one waiter. The lock stays held by the caller.
    pub(crate) fn notify(&self) {
        let me = thread::current().id();
        let state = self.state.lock();
        if state.owner != Some(me) {
            panic!("monitor notify by thread {me:?} which does not hold the lock");
        }
        self.signal.notify_one();
    }

    /// Wake every waiter. The lock stays held by the caller.
    pub(crate) fn notify_all(&self) {
        let me = thread::current().id();
        let state = self.state.lock();
        if state.owner != Some(me) {
            panic!("monitor notify_all by thread {me:?} which does not hold the lock");
        }
        self.signal.notify_all();
    }
}
