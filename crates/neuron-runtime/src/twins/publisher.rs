//! Publisher twin
//!
//! Planted trees wait in a [`Forest`]. A looper paced by the number of live
//! workers walks them round-robin and evals `Subscriber.BehaviorTreePush` on
//! the next one with the tree as JSON. Every executed action comes back
//! through `Publisher.BehaviorTreeAnalyze` and is correlated against the
//! planted tree by its id. Trees sent to a worker that has since gone away
//! are dropped from the forest.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use neuron_core::{
    json_to_tree, report, tree_to_json, BoundedQueue, Correlation, Forest, Message, NeuronError,
    Result, StatusCode, Tree,
};
use tracing::{debug, error, info, warn};

use super::{Looper, LooperSlot, ANALYZE_OPERATION, ERROR_OPERATION, PUSH_OPERATION};
use crate::commander::Commander;
use crate::operations::{Invocation, OperationTable};
use crate::scheduler::{
    retime, run_interval, select_next, CancelSignal, Retiming, Signal, Tick,
};

pub const SERVICE: &str = "Publisher";

/// A tree whose every action has been answered
#[derive(Debug, Clone)]
pub struct CompletedTree {
    pub id: String,
    pub tree: Arc<Tree>,
}

/// Commander-side half of the behavior-tree twins
pub struct Publisher {
    commander: Arc<Commander>,
    forest: Forest,
    completed: BoundedQueue<CompletedTree>,
    cursor: Mutex<Option<usize>>,
    looper: LooperSlot,
}

impl Publisher {
    pub fn new(commander: Arc<Commander>) -> Arc<Self> {
        let config = commander.config();
        Arc::new(Self {
            forest: Forest::new(SERVICE, config.behavior_tree.error_queue_len),
            completed: BoundedQueue::with_capacity(config.queues.reply_capacity),
            cursor: Mutex::new(None),
            looper: LooperSlot::default(),
            commander,
        })
    }

    pub fn forest(&self) -> &Forest {
        &self.forest
    }

    /// Trees answered in full, oldest first
    pub fn completed(&self) -> &BoundedQueue<CompletedTree> {
        &self.completed
    }

    /// Queue a tree for dispatch under this publisher's tag
    pub fn plant(&self, mut tree: Tree) -> String {
        tree.tag = self.forest.tag.clone();
        let id = self.forest.plant(tree);
        debug!("Planted tree {}", id);
        id
    }

    /// Expose the analyze and error operations on `table`
    pub fn register(self: &Arc<Self>, table: &OperationTable) {
        let weak = Arc::downgrade(self);
        table.register_fn(SERVICE, ANALYZE_OPERATION, move |invocation: Invocation| {
            let weak = weak.clone();
            async move {
                match weak.upgrade() {
                    Some(publisher) => publisher.analyze(&invocation),
                    None => Err(NeuronError::shutdown("publisher dropped")),
                }
            }
        });

        let weak = Arc::downgrade(self);
        table.register_fn(SERVICE, ERROR_OPERATION, move |invocation: Invocation| {
            let weak = weak.clone();
            async move {
                match weak.upgrade() {
                    Some(publisher) => publisher.collect_error(&invocation),
                    None => Err(NeuronError::shutdown("publisher dropped")),
                }
            }
        });
    }

    pub fn is_started(&self) -> bool {
        self.looper.is_running()
    }

    /// Start the dispatch looper
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.is_started() {
            return Err(NeuronError::config_error("publisher is already started"));
        }

        let cancel = CancelSignal::new();
        let weak = Arc::downgrade(self);
        let interval = self.commander.config().intervals.publisher();
        let looper_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            run_interval(
                "Publisher.Looper",
                move || {
                    let weak = weak.clone();
                    async move {
                        match weak.upgrade() {
                            Some(publisher) => {
                                let pending = publisher.publish_once();
                                Tick::proceed(pending).with_slices(publisher.worker_count())
                            }
                            None => Tick::with_status(StatusCode::SYSTEM_SHUTDOWN, 0),
                        }
                    }
                },
                |signal: Signal<usize>| {
                    if signal.is_final() {
                        report(SERVICE, "Looper", signal.status(), signal.to_string());
                    }
                },
                interval,
                looper_cancel,
                Retiming::Adaptive,
            )
            .await;
        });

        self.looper.set(Looper::new(cancel, handle));
        info!("Publisher started");
        Ok(())
    }

    pub async fn stop(&self) {
        if let Some(looper) = self.looper.take() {
            looper.stop(self.commander.config().intervals.publisher() * 10).await;
            info!("Publisher stopped");
        }
    }

    /// Tags of the workers that have announced themselves, sorted
    pub fn live_workers(&self) -> Vec<String> {
        self.commander
            .workers()
            .into_iter()
            .map(|(_, tag)| tag)
            .filter(|tag| !tag.is_empty())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn worker_count(&self) -> u32 {
        u32::try_from(self.live_workers().len()).unwrap_or(u32::MAX)
    }

    /// Wait before the looper's next round
    pub fn next_wait(&self) -> Duration {
        retime(
            self.commander.config().intervals.publisher(),
            self.worker_count(),
            Retiming::Adaptive,
        )
    }

    /// Send the next pending tree to the next worker, returning what is left
    pub fn publish_once(&self) -> usize {
        let workers = self.live_workers();
        let lost = self.forest.evict_lost(&workers);
        if !lost.is_empty() {
            warn!("Dropped {} trees sent to workers that went away", lost.len());
        }

        let worker = {
            let mut cursor = self.cursor.lock().unwrap_or_else(PoisonError::into_inner);
            let Some(index) = select_next(workers.len(), *cursor) else {
                return self.forest.pending_len();
            };
            *cursor = Some(index);
            workers.get(index).cloned()
        };
        let Some(worker) = worker else {
            return self.forest.pending_len();
        };

        if let Some((id, tree)) = self.forest.take_next() {
            match tree_to_json(&tree) {
                Ok(json) => {
                    match self
                        .commander
                        .eval(&worker, &id, super::subscriber::SERVICE, PUSH_OPERATION, &json)
                    {
                        Ok(()) => {
                            self.forest.dispatched(&id, &worker);
                            debug!("Tree {} sent to {}", id, worker);
                        }
                        Err(e) => {
                            warn!("Dispatch of tree {} failed: {}", id, e);
                            self.forest.requeue(id);
                        }
                    }
                }
                Err(e) => {
                    report(SERVICE, "Looper", e.status(), e.to_string());
                    self.forest.record_error(format!("{id}: {e}"));
                }
            }
        }
        self.forest.pending_len()
    }

    /// Correlate a returned single-branch tree with its planted tree
    pub fn analyze(&self, invocation: &Invocation) -> Result<()> {
        let json = invocation.decoded_arg(0)?;
        let branch = json_to_tree(&json)?;
        if branch.tag != self.forest.tag {
            report(
                SERVICE,
                ANALYZE_OPERATION,
                StatusCode::DATA_TYPE_ERROR,
                format!("tree tag {} is not {}", branch.tag, self.forest.tag),
            );
            return Ok(());
        }

        for task in branch.tasks.to_vec() {
            for action in task.actions.to_vec() {
                match Message::from_json(&action.callback) {
                    Ok(message) if message.is_success() => {
                        debug!("{}/{} answered {:?}", task.tag, action.tag, message.data)
                    }
                    Ok(message) => report(SERVICE, ANALYZE_OPERATION, message.code, &message.data),
                    Err(e) => {
                        let status = StatusCode::DATA_TYPE_ERROR;
                        report(SERVICE, ANALYZE_OPERATION, status, e.to_string())
                    }
                }
            }
        }

        let id = &invocation.envelope_id;
        match self.forest.complete(id, &branch) {
            Correlation::Completed(tree) => {
                info!("Tree {} completed", id);
                self.completed.push(CompletedTree {
                    id: id.clone(),
                    tree,
                });
            }
            Correlation::Updated => debug!("Tree {} updated", id),
            Correlation::Duplicate => debug!("Tree {} got a duplicate answer", id),
            Correlation::Unmatched => warn!("Branch for tree {} names no known action", id),
            Correlation::Unknown => warn!("Tree {} is not in the forest", id),
        }
        Ok(())
    }

    /// Keep an error reported by a subscriber
    pub fn collect_error(&self, invocation: &Invocation) -> Result<()> {
        let text = invocation.decoded_arg(0)?;
        error!("{} reported: {}", invocation.connection.peer(), text);
        if self.forest.discard(&invocation.envelope_id) {
            debug!("Tree {} dropped after a worker error", invocation.envelope_id);
        }
        self.forest.record_error(text);
        Ok(())
    }
}

impl std::fmt::Debug for Publisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher")
            .field("forest", &self.forest.len())
            .field("pending", &self.forest.pending_len())
            .field("completed", &self.completed.len())
            .finish()
    }
}
