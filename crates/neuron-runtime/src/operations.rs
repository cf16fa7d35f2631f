//! Operation table
//!
//! Remote `?EVAL` frames name a `(service, operation)` pair. Services register
//! async handlers under such pairs; dispatch looks the pair up and runs the
//! handler in its own supervised task.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use neuron_core::{report, Message, NeuronError, Result, ShardedMap, StatusCode};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::connection::ConnectionHandle;
use crate::scheduler::supervise;

/// Context handed to an operation
#[derive(Debug, Clone)]
pub struct Invocation {
    /// Connection the request arrived on
    pub connection: ConnectionHandle,
    /// Correlation id of the request, empty when absent
    pub envelope_id: String,
    /// Remaining frame commands after service and operation
    pub args: Vec<String>,
}

impl Invocation {
    /// Answer the caller with a failure carrying the error's status
    pub fn refuse(&self, err: &NeuronError) {
        let message = Message::new(err.status(), err.to_string());
        if let Err(e) = self.connection.reply(&self.envelope_id, &message) {
            debug!("Could not refuse {} on {}: {}", self.envelope_id, self.connection.peer(), e);
        }
    }

    pub fn arg(&self, index: usize) -> Option<&str> {
        self.args.get(index).map(String::as_str)
    }

    /// Base64-decode an argument into text
    pub fn decoded_arg(&self, index: usize) -> Result<String> {
        let raw = self
            .arg(index)
            .ok_or_else(|| NeuronError::missing_parameter(format!("argument {index}")))?;
        let bytes = STANDARD
            .decode(raw)
            .map_err(neuron_core::CodecError::from)?;
        String::from_utf8(bytes)
            .map_err(|e| neuron_core::CodecError::from(e.utf8_error()).into())
    }
}

/// An async handler reachable through the operation table
#[async_trait]
pub trait Operation: Send + Sync {
    async fn invoke(&self, invocation: Invocation) -> Result<()>;
}

/// Adapter turning an async closure into an [`Operation`]
pub struct FnOperation<F, Fut> {
    handler: F,
    _future: PhantomData<fn() -> Fut>,
}

impl<F, Fut> FnOperation<F, Fut>
where
    F: Fn(Invocation) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            _future: PhantomData,
        }
    }
}

#[async_trait]
impl<F, Fut> Operation for FnOperation<F, Fut>
where
    F: Fn(Invocation) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    async fn invoke(&self, invocation: Invocation) -> Result<()> {
        (self.handler)(invocation).await
    }
}

/// Registry key of a pair, `#` cannot occur inside a frame field
fn operation_key(service: &str, operation: &str) -> String {
    format!("{service}#{operation}")
}

/// Registry of operations keyed by `(service, operation)`
#[derive(Default)]
pub struct OperationTable {
    operations: ShardedMap<Arc<dyn Operation>>,
}

impl OperationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one under the same pair
    pub fn register(&self, service: &str, operation: &str, handler: impl Operation + 'static) {
        debug!("Registering operation {}.{}", service, operation);
        self.operations
            .set(operation_key(service, operation), Arc::new(handler));
    }

    /// Register an async closure
    pub fn register_fn<F, Fut>(&self, service: &str, operation: &str, handler: F)
    where
        F: Fn(Invocation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.register(service, operation, FnOperation::new(handler));
    }

    pub fn unregister(&self, service: &str, operation: &str) -> bool {
        self.operations.delete(&operation_key(service, operation))
    }

    pub fn contains(&self, service: &str, operation: &str) -> bool {
        self.operations
            .contains_key(&operation_key(service, operation))
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    fn lookup(&self, service: &str, operation: &str) -> Result<Arc<dyn Operation>> {
        self.operations
            .get(&operation_key(service, operation))
            .ok_or_else(|| NeuronError::operation_not_found(service, operation))
    }

    /// Run an operation to completion on the current task
    pub async fn invoke(
        &self,
        service: &str,
        operation: &str,
        invocation: Invocation,
    ) -> Result<()> {
        let handler = self.lookup(service, operation)?;
        handler.invoke(invocation).await
    }

    /// Spawn an operation in its own supervised task
    ///
    /// Unknown pairs fail immediately with a not-found error, which is also
    /// sent back to the caller as a `REPLY`. Failures and panics inside the
    /// handler are reported, not returned.
    pub fn dispatch(
        &self,
        service: &str,
        operation: &str,
        invocation: Invocation,
    ) -> Result<JoinHandle<()>> {
        let handler = match self.lookup(service, operation) {
            Ok(handler) => handler,
            Err(e) => {
                invocation.refuse(&e);
                return Err(e);
            }
        };
        let context = format!("{service}.{operation}");
        Ok(tokio::spawn(async move {
            match supervise(context.clone(), handler.invoke(invocation)).await {
                Ok(Ok(())) => debug!("Operation {} finished", context),
                Ok(Err(e)) => report("Operations", &context, e.status(), e.to_string()),
                Err(fault) => {
                    report("Operations", &context, StatusCode::SYSTEM_ERROR, fault.to_string())
                }
            }
        }))
    }
}

impl std::fmt::Debug for OperationTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self
            .operations
            .keys()
            .into_iter()
            .map(|key| key.replacen('#', ".", 1))
            .collect();
        f.debug_struct("OperationTable").field("operations", &names).finish()
    }
}
