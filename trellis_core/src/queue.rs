use crate::oracle::{PathCondition, Solution};
use crate::shutdown::Shutdown;
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

const SHUTDOWN_POLL: Duration = Duration::from_millis(50);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("solution queue is closed")]
    Closed,
    #[error("solution queue is full ({0} entries)")]
    Full(usize),
}

/// A solved path condition waiting to be written out as an input file.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingSolution {
    pub path_condition: PathCondition,
    pub solution: Solution,
    /// Input size the solving run was pinned to.
    pub input_size: usize,
}

#[derive(Debug)]
struct State {
    items: VecDeque<PendingSolution>,
    closed: bool,
}

/// Thread-safe bounded queue with blocking `put`/`take`.
///
/// A producer hitting capacity waits until a consumer makes room; nothing is
/// dropped. Closing the queue wakes every waiter: producers fail with
/// [`QueueError::Closed`], consumers drain what is left and then get `None`.
/// A queue bound to a [`Shutdown`] closes itself once the signal fires.
#[derive(Debug)]
pub struct SolutionQueue {
    capacity: usize,
    state: Mutex<State>,
    not_empty: Condvar,
    not_full: Condvar,
    shutdown: Option<Shutdown>,
}

impl SolutionQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(State {
                items: VecDeque::new(),
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            shutdown: None,
        }
    }

    pub fn with_shutdown(capacity: usize, shutdown: Shutdown) -> Self {
        Self {
            shutdown: Some(shutdown),
            ..Self::new(capacity)
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn closed(&self, state: &mut State) -> bool {
        if self.shutdown.as_ref().is_some_and(Shutdown::is_triggered) {
            state.closed = true;
        }
        state.closed
    }

    fn wait<'a>(&self, condvar: &Condvar, state: MutexGuard<'a, State>) -> MutexGuard<'a, State> {
        match self.shutdown {
            Some(_) => condvar
                .wait_timeout(state, SHUTDOWN_POLL)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0),
            None => condvar
                .wait(state)
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    /// Appends `item`, blocking while the queue is full.
    pub fn put(&self, item: PendingSolution) -> Result<(), QueueError> {
        let mut state = self.lock();
        while !self.closed(&mut state) && state.items.len() >= self.capacity {
            state = self.wait(&self.not_full, state);
        }
        if state.closed {
            return Err(QueueError::Closed);
        }
        state.items.push_back(item);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Appends `item` without waiting.
    pub fn try_put(&self, item: PendingSolution) -> Result<(), QueueError> {
        let mut state = self.lock();
        if self.closed(&mut state) {
            return Err(QueueError::Closed);
        }
        if state.items.len() >= self.capacity {
            return Err(QueueError::Full(self.capacity));
        }
        state.items.push_back(item);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Removes the oldest entry, blocking while the queue is empty.
    /// Returns `None` once the queue is closed and drained.
    pub fn take(&self) -> Option<PendingSolution> {
        let mut state = self.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                self.not_full.notify_one();
                return Some(item);
            }
            if self.closed(&mut state) {
                return None;
            }
            state = self.wait(&self.not_empty, state);
        }
    }

    /// Removes the oldest entry if there is one.
    pub fn try_take(&self) -> Option<PendingSolution> {
        let item = self.lock().items.pop_front();
        if item.is_some() {
            self.not_full.notify_one();
        }
        item
    }

    /// Removes every queued entry without blocking.
    pub fn drain(&self) -> Vec<PendingSolution> {
        let items: Vec<_> = self.lock().items.drain(..).collect();
        if !items.is_empty() {
            self.not_full.notify_all();
        }
        items
    }

    pub fn close(&self) {
        self.lock().closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.closed(&mut self.lock())
    }
}

impl Default for SolutionQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}
