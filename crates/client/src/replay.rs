use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

/// Lines kept per execution for late subscribers.
pub const REPLAY_CAPACITY: usize = 3600;

/// How an execution ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The server sent `EOF`.
    Completed,
    /// The server sent `ERROR`.
    Failed,
    /// The server sent `RATE_LIMITED`.
    RateLimited,
    /// The connection dropped before a terminal message arrived.
    Disconnected,
    /// No terminal message arrived before the caller's deadline.
    TimedOut,
}

/// Bounded history of one execution's lines. Positions are absolute, so a
/// reader keeps its place while old lines are evicted.
#[derive(Debug)]
pub(crate) struct ReplayBuffer {
    lines: VecDeque<String>,
    capacity: usize,
    evicted: usize,
    outcome: Option<Outcome>,
}

impl ReplayBuffer {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            capacity: capacity.max(1),
            evicted: 0,
            outcome: None,
        }
    }

    /// Returns false once the buffer is complete; late lines are dropped.
    pub(crate) fn push(&mut self, line: String) -> bool {
        if self.outcome.is_some() {
            return false;
        }
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
            self.evicted += 1;
        }
        self.lines.push_back(line);
        true
    }

    /// The first outcome wins.
    pub(crate) fn complete(&mut self, outcome: Outcome) -> bool {
        if self.outcome.is_some() {
            return false;
        }
        self.outcome = Some(outcome);
        true
    }

    pub(crate) fn outcome(&self) -> Option<Outcome> {
        self.outcome
    }

    /// Line at absolute `position`, skipping ahead past evicted lines.
    /// Returns the position after the line.
    pub(crate) fn read_from(&self, position: usize) -> Option<(usize, &str)> {
        let position = position.max(self.evicted);
        self.lines
            .get(position - self.evicted)
            .map(|line| (position + 1, line.as_str()))
    }
}

/// A replay buffer shared between the dispatcher and any subscribers.
#[derive(Debug)]
pub(crate) struct Execution {
    buffer: Mutex<ReplayBuffer>,
    changed: Notify,
}

impl Execution {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            buffer: Mutex::new(ReplayBuffer::new(capacity)),
            changed: Notify::new(),
        }
    }

    pub(crate) fn buffer(&self) -> MutexGuard<'_, ReplayBuffer> {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn push(&self, line: String) -> bool {
        let accepted = self.buffer().push(line);
        if accepted {
            self.changed.notify_waiters();
        }
        accepted
    }

    pub(crate) fn complete(&self, outcome: Outcome) -> bool {
        let completed = self.buffer().complete(outcome);
        if completed {
            self.changed.notify_waiters();
        }
        completed
    }

    /// Waits for the line at `position`. `None` means the execution is
    /// complete and everything up to its end has been read.
    pub(crate) async fn next_from(&self, position: usize) -> Option<(usize, String)> {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let buffer = self.buffer();
                if let Some((next, line)) = buffer.read_from(position) {
                    return Some((next, line.to_string()));
                }
                if buffer.outcome().is_some() {
                    return None;
                }
            }
            notified.await;
        }
    }
}
