// Inter-fiber synchronisation: channel, mutex, rwlock, latch.
//
// All of these coordinate fibers, not threads. Wait queues are FIFO
// (tokio's fair primitives underneath); a timed-out waiter's queue
// entry disappears with its dropped future, so the fiber stays alive
// and consistent. Every blocking operation has a `_timeout` variant
// that reports `DbError::TimedOut` once the deadline fires.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;

use tokio::sync::Notify;

use crate::error::{DbError, Result};

// ---------------------------------------------------------------------------
// Channel
// ---------------------------------------------------------------------------

struct ChannelState<T> {
    queue: VecDeque<T>,
    /// Values handed directly to blocked getters by `broadcast`;
    /// drained before the ordinary queue.
    handoff: VecDeque<T>,
    getters: usize,
}

struct ChannelInner<T> {
    capacity: usize,
    state: RefCell<ChannelState<T>>,
    not_empty: Notify,
    not_full: Notify,
}

/// Bounded FIFO channel between fibers. `put` suspends when full,
/// `get` when empty. Clones share the same channel.
pub struct Channel<T> {
    inner: Rc<ChannelInner<T>>,
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Channel {
            inner: self.inner.clone(),
        }
    }
}

struct GetterGuard<'a, T> {
    inner: &'a ChannelInner<T>,
}

impl<T> Drop for GetterGuard<'_, T> {
    fn drop(&mut self) {
        self.inner.state.borrow_mut().getters -= 1;
    }
}

impl<T> Channel<T> {
    pub fn new(capacity: usize) -> Channel<T> {
        assert!(capacity >= 1, "channel capacity must be at least one");
        Channel {
            inner: Rc::new(ChannelInner {
                capacity,
                state: RefCell::new(ChannelState {
                    queue: VecDeque::with_capacity(capacity),
                    handoff: VecDeque::new(),
                    getters: 0,
                }),
                not_empty: Notify::new(),
                not_full: Notify::new(),
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.state.borrow().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn try_put(&self, value: T) -> std::result::Result<(), T> {
        let mut state = self.inner.state.borrow_mut();
        if state.queue.len() >= self.inner.capacity {
            return Err(value);
        }
        state.queue.push_back(value);
        drop(state);
        self.inner.not_empty.notify_one();
        Ok(())
    }

    pub async fn put(&self, mut value: T) {
        loop {
            match self.try_put(value) {
                Ok(()) => return,
                Err(back) => {
                    value = back;
                    self.inner.not_full.notified().await;
                }
            }
        }
    }

    pub async fn put_timeout(&self, value: T, timeout: Duration) -> Result<()> {
        match tokio::time::timeout(timeout, self.put(value)).await {
            Ok(()) => Ok(()),
            Err(_) => Err(DbError::TimedOut),
        }
    }

    pub fn try_get(&self) -> Option<T> {
        let mut state = self.inner.state.borrow_mut();
        if let Some(value) = state.handoff.pop_front() {
            return Some(value);
        }
        let value = state.queue.pop_front();
        if value.is_some() {
            drop(state);
            self.inner.not_full.notify_one();
        }
        value
    }

    pub async fn get(&self) -> T {
        loop {
            if let Some(value) = self.try_get() {
                return value;
            }
            let notified = self.inner.not_empty.notified();
            self.inner.state.borrow_mut().getters += 1;
            let guard = GetterGuard {
                inner: self.inner.as_ref(),
            };
            notified.await;
            drop(guard);
        }
    }

    pub async fn get_timeout(&self, timeout: Duration) -> Result<T> {
        match tokio::time::timeout(timeout, self.get()).await {
            Ok(value) => Ok(value),
            Err(_) => Err(DbError::TimedOut),
        }
    }
}

impl<T: Clone> Channel<T> {
    /// Hand `value` to every getter currently blocked on the channel
    /// and return how many were woken.
    pub fn broadcast(&self, value: T) -> usize {
        let mut state = self.inner.state.borrow_mut();
        let waiting = state.getters;
        for _ in 0..waiting {
            state.handoff.push_back(value.clone());
        }
        drop(state);
        if waiting > 0 {
            self.inner.not_empty.notify_waiters();
        }
        waiting
    }
}

// ---------------------------------------------------------------------------
// Mutex
// ---------------------------------------------------------------------------

/// Fiber mutex with a FIFO wait queue.
pub struct Mutex {
    inner: tokio::sync::Mutex<()>,
}

pub struct MutexGuard<'a> {
    _inner: tokio::sync::MutexGuard<'a, ()>,
}

impl Mutex {
    pub fn new() -> Mutex {
        Mutex {
            inner: tokio::sync::Mutex::new(()),
        }
    }

    pub async fn lock(&self) -> MutexGuard<'_> {
        MutexGuard {
            _inner: self.inner.lock().await,
        }
    }

    /// Acquire, or give up after `timeout`. A timed-out waiter is
    /// removed from the wait queue before this returns.
    pub async fn lock_timeout(&self, timeout: Duration) -> Result<MutexGuard<'_>> {
        match tokio::time::timeout(timeout, self.inner.lock()).await {
            Ok(guard) => Ok(MutexGuard { _inner: guard }),
            Err(_) => Err(DbError::TimedOut),
        }
    }

    pub fn try_lock(&self) -> Result<MutexGuard<'_>> {
        match self.inner.try_lock() {
            Ok(guard) => Ok(MutexGuard { _inner: guard }),
            Err(_) => Err(DbError::Busy),
        }
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// RwLock
// ---------------------------------------------------------------------------

/// Fiber read/write lock. Writer-preferring: a reader arriving while a
/// writer waits queues behind it.
pub struct RwLock {
    inner: tokio::sync::RwLock<()>,
}

pub struct ReadGuard<'a> {
    _inner: tokio::sync::RwLockReadGuard<'a, ()>,
}

pub struct WriteGuard<'a> {
    _inner: tokio::sync::RwLockWriteGuard<'a, ()>,
}

impl RwLock {
    pub fn new() -> RwLock {
        RwLock {
            inner: tokio::sync::RwLock::new(()),
        }
    }

    pub async fn read(&self) -> ReadGuard<'_> {
        ReadGuard {
            _inner: self.inner.read().await,
        }
    }

    pub async fn write(&self) -> WriteGuard<'_> {
        WriteGuard {
            _inner: self.inner.write().await,
        }
    }

    pub async fn read_timeout(&self, timeout: Duration) -> Result<ReadGuard<'_>> {
        match tokio::time::timeout(timeout, self.inner.read()).await {
            Ok(guard) => Ok(ReadGuard { _inner: guard }),
            Err(_) => Err(DbError::TimedOut),
        }
    }

    pub async fn write_timeout(&self, timeout: Duration) -> Result<WriteGuard<'_>> {
        match tokio::time::timeout(timeout, self.inner.write()).await {
            Ok(guard) => Ok(WriteGuard { _inner: guard }),
            Err(_) => Err(DbError::TimedOut),
        }
    }
}

impl Default for RwLock {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Latch
// ---------------------------------------------------------------------------

/// Non-blocking try-lock protecting the short staging window between
/// index mutation and commit. A caller that cannot acquire it fails
/// fast with `Busy` instead of queueing.
pub struct Latch {
    locked: Cell<bool>,
}

pub struct LatchGuard<'a> {
    latch: &'a Latch,
}

impl Latch {
    pub fn new() -> Latch {
        Latch {
            locked: Cell::new(false),
        }
    }

    pub fn try_lock(&self) -> Result<LatchGuard<'_>> {
        if self.locked.replace(true) {
            return Err(DbError::Busy);
        }
        Ok(LatchGuard { latch: self })
    }

    pub fn is_locked(&self) -> bool {
        self.locked.get()
    }
}

impl Default for Latch {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for LatchGuard<'_> {
    fn drop(&mut self) {
        self.latch.locked.set(false);
    }
}
