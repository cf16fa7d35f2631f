//! Behavior-tree service twins
//!
//! The [`Publisher`] runs next to a commander and ships planted trees to
//! workers; the [`Subscriber`] runs next to a receiver, executes the trees one
//! action at a time and returns every result as a single-branch tree.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::scheduler::{cancel_interval, CancelSignal};

pub mod publisher;
pub mod subscriber;

pub use publisher::Publisher;
pub use subscriber::{ActionHandler, ActionTable, Subscriber};

/// Operation a subscriber exposes for receiving trees
pub const PUSH_OPERATION: &str = "BehaviorTreePush";
/// Operation a publisher exposes for returned branches
pub const ANALYZE_OPERATION: &str = "BehaviorTreeAnalyze";
/// Operation a publisher exposes for error reports
pub const ERROR_OPERATION: &str = "BehaviorTreeError";

/// Running looper of a twin
pub(crate) struct Looper {
    cancel: CancelSignal,
    handle: JoinHandle<()>,
}

impl Looper {
    pub(crate) fn new(cancel: CancelSignal, handle: JoinHandle<()>) -> Self {
        Self { cancel, handle }
    }

    /// Cancel and wait for the acknowledgement, aborting on timeout
    pub(crate) async fn stop(self, grace: Duration) {
        if !cancel_interval(&self.cancel, grace).await {
            self.handle.abort();
        }
    }
}

/// Slot holding at most one running looper
#[derive(Default)]
pub(crate) struct LooperSlot(Mutex<Option<Looper>>);

impl LooperSlot {
    pub(crate) fn is_running(&self) -> bool {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|looper| !looper.handle.is_finished())
    }

    pub(crate) fn set(&self, looper: Looper) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = Some(looper);
    }

    pub(crate) fn take(&self) -> Option<Looper> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}
