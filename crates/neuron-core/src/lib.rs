//! Neuron Core Protocol Implementation
//!
//! This crate provides the foundational pieces of the Neuron master/worker
//! command bus: the text frame codec, the transport obfuscation pipeline,
//! the bounded queue and sharded registry used for shared state, the
//! behavior-tree task model, status codes and configuration. It has no async
//! runtime dependency; the runtime crate builds the services on top of it.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod behavior;
pub mod codec;
pub mod config;
pub mod errors;
pub mod obfuscation;
pub mod queue;
pub mod registry;
pub mod status;
pub mod value;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use behavior::{
    branch_to_tree, fetch_branch, json_to_tree, tree_to_json, Action, Branch, Correlation, Forest,
    Task, Tree,
};
pub use codec::{analyze_bytes, analyze_message, generate_message, Envelope, Head};
pub use config::{BehaviorTreeConfig, IntervalConfig, NeuronConfig, QueueConfig};
pub use errors::{CodecError, NeuronError, Result, TransportError};
pub use obfuscation::Obfuscator;
pub use queue::{BoundedQueue, Handle};
pub use registry::ShardedMap;
pub use status::{report, Message, StatusCode};
pub use value::Value;
