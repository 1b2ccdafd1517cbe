//! Client side of the looking glass protocol: submits probes over a
//! reconnecting websocket and keeps each execution's output replayable for
//! late subscribers.

pub mod connection;
pub mod registry;
mod replay;

pub use registry::{ExecutionRegistry, Subscription, RETAINED_FINISHED};
pub use replay::{Outcome, REPLAY_CAPACITY};
