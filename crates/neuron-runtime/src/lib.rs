//! Neuron Runtime
//!
//! This crate runs the two roles of the Neuron command bus on tokio:
//! - `Commander`: accepts worker connections, routes queued frames to them and
//!   collects their heartbeats and replies
//! - `Receiver`: dials a commander, keeps a heartbeat going and executes the
//!   operations the commander asks for
//! - `scheduler`: supervised recurring tasks shared by both roles
//! - `twins`: the behavior-tree publisher and subscriber services
//!
//! Framing, obfuscation and the data model live in `neuron-core`.

pub mod commander;
pub mod connection;
pub mod operations;
pub mod receiver;
pub mod scheduler;
pub mod server;
pub mod system;
pub mod twins;

pub use commander::{ClientEntry, Commander, OutboundFrame, ReplyRecord, ServiceState};
pub use connection::{eval_frame, ConnectionHandle, Outbound};
pub use operations::{FnOperation, Invocation, Operation, OperationTable};
pub use receiver::{ConnectionState, Receiver};
pub use scheduler::{
    after, cancel_interval, retry, run_interval, run_with_timeout, select_next, supervise,
    CancelSignal, Retiming, Signal, TaskFault, Tick,
};
pub use server::{request_enqueue, CommanderServer};
pub use system::SystemService;
pub use twins::{ActionHandler, ActionTable, Publisher, Subscriber};

// Re-export core types for convenience
pub use neuron_core::{Message, NeuronConfig, NeuronError, Result, StatusCode};
