use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::Context;
use tokio::sync::mpsc;
use uuid::Uuid;

use protocol::{ClientMessage, ProbeCommand, ServerMessage};

use crate::replay::{Execution, Outcome, REPLAY_CAPACITY};

/// Finished executions kept for replay before the oldest is dropped.
pub const RETAINED_FINISHED: usize = 256;

#[derive(Default)]
struct Executions {
    by_id: HashMap<String, Arc<Execution>>,
    finished: VecDeque<String>,
}

impl Executions {
    fn retire(&mut self, id: &str, retained: usize) {
        self.finished.push_back(id.to_string());
        while self.finished.len() > retained {
            if let Some(oldest) = self.finished.pop_front() {
                self.by_id.remove(&oldest);
                tracing::debug!(event = "execution.evicted", id = %oldest);
            }
        }
    }
}

/// Correlates submitted probes with the lines streamed back for them.
///
/// One registry serves one connection. Completed executions leave the live
/// dispatch set but stay subscribable until [`ExecutionRegistry::forget`] or
/// until [`RETAINED_FINISHED`] newer executions have finished.
pub struct ExecutionRegistry {
    outbound: mpsc::Sender<ClientMessage>,
    executions: Mutex<Executions>,
    capacity: usize,
    retained: usize,
}

impl ExecutionRegistry {
    pub fn new(outbound: mpsc::Sender<ClientMessage>) -> Self {
        Self::with_limits(outbound, REPLAY_CAPACITY, RETAINED_FINISHED)
    }

    /// `capacity` bounds lines per execution, `retained` bounds finished
    /// executions.
    pub fn with_limits(
        outbound: mpsc::Sender<ClientMessage>,
        capacity: usize,
        retained: usize,
    ) -> Self {
        Self {
            outbound,
            executions: Mutex::new(Executions::default()),
            capacity,
            retained,
        }
    }

    fn executions(&self) -> MutexGuard<'_, Executions> {
        self.executions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn execution(&self, id: &str) -> Option<Arc<Execution>> {
        self.executions().by_id.get(id).cloned()
    }

    /// Opens a replay buffer under a fresh id and queues the request.
    pub async fn submit(&self, command: ProbeCommand, target: &str) -> anyhow::Result<String> {
        let id = Uuid::new_v4().to_string();
        self.executions()
            .by_id
            .insert(id.clone(), Arc::new(Execution::new(self.capacity)));
        let request = ClientMessage::execute(id.clone(), command, target);
        if let Err(err) = self.outbound.send(request).await {
            self.executions().by_id.remove(&id);
            return Err(err).context("connection closed");
        }
        tracing::debug!(
            event = "execution.submitted",
            id = %id,
            command = %command,
            probe_target = %target,
        );
        Ok(id)
    }

    /// Routes one server message to its execution. Messages for unknown or
    /// already completed ids are dropped.
    pub fn dispatch(&self, message: ServerMessage) {
        let Some(execution) = self.execution(message.id()) else {
            tracing::debug!(event = "execution.unknown_id", id = %message.id());
            return;
        };
        let accepted = match &message {
            ServerMessage::Line { text, .. } => execution.push(text.clone()),
            ServerMessage::Eof { .. } => execution.complete(Outcome::Completed),
            ServerMessage::Error { .. } => execution.complete(Outcome::Failed),
            ServerMessage::RateLimited { .. } => execution.complete(Outcome::RateLimited),
        };
        if !accepted {
            tracing::debug!(event = "execution.late_message");
        } else if message.is_terminal() {
            self.executions().retire(message.id(), self.retained);
        }
    }

    /// Marks executions whose connection went away before they finished.
    pub fn abandon<'a>(&self, ids: impl IntoIterator<Item = &'a String>) {
        let mut executions = self.executions();
        for id in ids {
            let abandoned = executions
                .by_id
                .get(id)
                .is_some_and(|execution| execution.complete(Outcome::Disconnected));
            if abandoned {
                tracing::info!(event = "execution.abandoned", id = %id);
                executions.retire(id, self.retained);
            }
        }
    }

    /// Gives up on a live execution: subscribers drain what is buffered and
    /// then see [`Outcome::TimedOut`]. Returns false if it had already ended.
    pub fn expire(&self, id: &str) -> bool {
        let mut executions = self.executions();
        let expired = executions
            .by_id
            .get(id)
            .is_some_and(|execution| execution.complete(Outcome::TimedOut));
        if expired {
            tracing::info!(event = "execution.expired", id = %id);
            executions.retire(id, self.retained);
        }
        expired
    }

    /// Replays everything buffered for `id`, then follows it live.
    pub fn subscribe(&self, id: &str) -> Option<Subscription> {
        self.execution(id).map(|execution| Subscription {
            execution,
            position: 0,
        })
    }

    pub fn is_live(&self, id: &str) -> bool {
        self.execution(id)
            .is_some_and(|execution| execution.buffer().outcome().is_none())
    }

    /// Drops the replay buffer. Existing subscriptions keep their copy.
    pub fn forget(&self, id: &str) -> bool {
        let mut executions = self.executions();
        executions.finished.retain(|finished| finished != id);
        executions.by_id.remove(id).is_some()
    }
}

/// A reader over one execution's lines.
pub struct Subscription {
    execution: Arc<Execution>,
    position: usize,
}

impl Subscription {
    /// Next line, or `None` once the execution has ended and every buffered
    /// line has been read.
    pub async fn next(&mut self) -> Option<String> {
        let (next, line) = self.execution.next_from(self.position).await?;
        self.position = next;
        Some(line)
    }

    pub fn outcome(&self) -> Option<Outcome> {
        self.execution.buffer().outcome()
    }
}
