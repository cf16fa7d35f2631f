//! Built-in `System` service
//!
//! Registered on both roles. `System.Ping` answers the caller with a `REPLY`
//! frame carrying `{"Code":100,"Message":"Success","Data":"Pong"}`.

use neuron_core::{Message, Result};
use tracing::debug;

use crate::operations::{Invocation, OperationTable};

pub const SERVICE: &str = "System";

/// Health-check operations available on every node
pub struct SystemService;

impl SystemService {
    pub fn register(table: &OperationTable) {
        table.register_fn(SERVICE, "Ping", ping);
    }
}

async fn ping(invocation: Invocation) -> Result<()> {
    debug!("Ping from {} ({})", invocation.connection.peer(), invocation.envelope_id);
    invocation
        .connection
        .reply(&invocation.envelope_id, &Message::success("Pong"))
}
