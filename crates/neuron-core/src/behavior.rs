//! Behavior-tree task model
//!
//! A tree holds an ordered queue of tasks, a task holds an ordered queue of
//! actions. Trees are consumed front to back one action at a time with
//! [`fetch_branch`]; each executed action is shipped back as a single-branch
//! tree ([`branch_to_tree`]) whose action carries the result in its callback.
//!
//! A [`Forest`] is the publisher-side container: planted trees wait in a
//! pending queue, dispatched trees stay in the forest until every action has
//! been answered.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::Result;
use crate::queue::BoundedQueue;
use crate::registry::ShardedMap;

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

// ----------------------------------------------------------------------------
// Action
// ----------------------------------------------------------------------------

/// Smallest unit of work: a command with parameters and, once run, a result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    #[serde(rename = "Tag")]
    pub tag: String,
    #[serde(rename = "Command")]
    pub command: String,
    #[serde(rename = "Params", default)]
    pub params: String,
    /// Empty until the action has been executed
    #[serde(rename = "Callback", default)]
    pub callback: String,
}

impl Action {
    pub fn new(
        tag: impl Into<String>,
        command: impl Into<String>,
        params: impl Into<String>,
    ) -> Self {
        Self {
            tag: tag.into(),
            command: command.into(),
            params: params.into(),
            callback: String::new(),
        }
    }

    pub fn has_callback(&self) -> bool {
        !self.callback.is_empty()
    }

    /// Store a result, refusing to overwrite one already present
    pub fn fill_callback(&mut self, callback: impl Into<String>) -> bool {
        if self.has_callback() {
            warn!("Discarding redelivered callback for action {}", self.tag);
            return false;
        }
        self.callback = callback.into();
        true
    }
}

// ----------------------------------------------------------------------------
// Task
// ----------------------------------------------------------------------------

/// Ordered group of actions
#[derive(Debug)]
pub struct Task {
    pub tag: String,
    /// Creation time in milliseconds since the Unix epoch
    pub created_at: u64,
    pub actions: BoundedQueue<Action>,
}

impl Task {
    pub fn new(tag: impl Into<String>) -> Self {
        Self::with_timestamp(tag, now_millis())
    }

    pub fn with_timestamp(tag: impl Into<String>, created_at: u64) -> Self {
        Self {
            tag: tag.into(),
            created_at,
            actions: BoundedQueue::new(),
        }
    }

    /// Append an action, builder style
    pub fn with_action(self, action: Action) -> Self {
        self.actions.push(action);
        self
    }

    /// Handle of the first action tagged `tag`
    pub fn find_action(&self, tag: &str) -> Option<crate::queue::Handle> {
        self.actions.find(|action| action.tag == tag)
    }
}

// ----------------------------------------------------------------------------
// Tree
// ----------------------------------------------------------------------------

/// Ordered group of tasks
#[derive(Debug)]
pub struct Tree {
    pub tag: String,
    pub tasks: BoundedQueue<Arc<Task>>,
}

impl Tree {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            tasks: BoundedQueue::new(),
        }
    }

    /// Append a task, builder style
    pub fn with_task(self, task: Task) -> Self {
        self.tasks.push(Arc::new(task));
        self
    }

    pub fn find_task(&self, tag: &str) -> Option<Arc<Task>> {
        self.tasks
            .find(|task| task.tag == tag)
            .and_then(|handle| self.tasks.get(handle))
    }

    /// True once every remaining action carries a callback
    pub fn is_complete(&self) -> bool {
        self.tasks
            .to_vec()
            .iter()
            .all(|task| task.actions.to_vec().iter().all(Action::has_callback))
    }

    /// Number of actions across all tasks
    pub fn action_count(&self) -> usize {
        self.tasks.to_vec().iter().map(|task| task.actions.len()).sum()
    }
}

// ----------------------------------------------------------------------------
// Branch Consumption
// ----------------------------------------------------------------------------

/// Current position in a queue of trees
#[derive(Debug, Clone)]
pub struct Branch {
    pub tree: Arc<Tree>,
    /// `None` when the tree has run out of tasks
    pub task: Option<Arc<Task>>,
    pub action: Option<Action>,
}

impl Branch {
    /// True when the tree has nothing left and should be evicted by its owner
    pub fn is_spent(&self) -> bool {
        self.task.is_none()
    }
}

/// Fetch the current tree, task and action from a queue of trees
///
/// The front tree is only peeked. Tasks without actions are shifted out of
/// the tree and skipped. With `shift_action` the returned action is removed
/// from its task, and a task emptied that way is removed from its tree.
pub fn fetch_branch(hub: &BoundedQueue<Arc<Tree>>, shift_action: bool) -> Option<Branch> {
    let tree = hub.peek_front()?;

    loop {
        let Some(task) = tree.tasks.peek_front() else {
            return Some(Branch {
                tree,
                task: None,
                action: None,
            });
        };

        let action = if shift_action {
            task.actions.shift()
        } else {
            task.actions.peek_front()
        };

        let Some(action) = action else {
            debug!("Skipping exhausted task {}", task.tag);
            tree.tasks.shift();
            continue;
        };

        if shift_action && task.actions.is_empty() {
            tree.tasks.shift();
        }

        return Some(Branch {
            tree,
            task: Some(task),
            action: Some(action),
        });
    }
}

/// Build a single-task, single-action tree from a branch
///
/// Tags and the task's creation time are preserved.
pub fn branch_to_tree(tree: &Tree, task: &Task, action: Action) -> Tree {
    Tree::new(tree.tag.clone())
        .with_task(Task::with_timestamp(task.tag.clone(), task.created_at).with_action(action))
}

// ----------------------------------------------------------------------------
// JSON Conversion
// ----------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
struct TreeDocument {
    #[serde(rename = "Tag")]
    tag: String,
    #[serde(rename = "Task", default)]
    tasks: Vec<TaskDocument>,
}

#[derive(Debug, Serialize, Deserialize)]
struct TaskDocument {
    #[serde(rename = "Tag")]
    tag: String,
    #[serde(rename = "Timestamp", default, skip_serializing_if = "Option::is_none")]
    timestamp: Option<u64>,
    #[serde(rename = "Action", default)]
    actions: Vec<Action>,
}

/// Serialize a tree with its remaining tasks and actions
pub fn tree_to_json(tree: &Tree) -> Result<String> {
    let document = TreeDocument {
        tag: tree.tag.clone(),
        tasks: tree
            .tasks
            .to_vec()
            .into_iter()
            .map(|task| TaskDocument {
                tag: task.tag.clone(),
                timestamp: Some(task.created_at),
                actions: task.actions.to_vec(),
            })
            .collect(),
    };
    Ok(serde_json::to_string(&document)?)
}

/// Rebuild a tree from its JSON form
///
/// Tasks without a timestamp are stamped with the current time.
pub fn json_to_tree(json: &str) -> Result<Tree> {
    let document: TreeDocument = serde_json::from_str(json)?;
    let tree = Tree::new(document.tag);
    for task in document.tasks {
        let created_at = task.timestamp.unwrap_or_else(now_millis);
        let rebuilt = Task::with_timestamp(task.tag, created_at);
        for action in task.actions {
            rebuilt.actions.push(action);
        }
        tree.tasks.push(Arc::new(rebuilt));
    }
    Ok(tree)
}

// ----------------------------------------------------------------------------
// Forest
// ----------------------------------------------------------------------------

/// Outcome of correlating a returned branch with a dispatched tree
#[derive(Debug, Clone)]
pub enum Correlation {
    /// No tree is known under the id
    Unknown,
    /// The branch does not name a task and action of the tree
    Unmatched,
    /// The action already had a callback; the new one was discarded
    Duplicate,
    /// Callback stored, other actions are still outstanding
    Updated,
    /// Callback stored and the tree is now fully answered
    Completed(Arc<Tree>),
}

/// Publisher-side container of trees awaiting dispatch or answers
#[derive(Debug)]
pub struct Forest {
    pub tag: String,
    pending: BoundedQueue<String>,
    trees: ShardedMap<Arc<Tree>>,
    in_flight: ShardedMap<String>,
    errors: BoundedQueue<String>,
}

impl Forest {
    pub fn new(tag: impl Into<String>, error_queue_len: usize) -> Self {
        Self {
            tag: tag.into(),
            pending: BoundedQueue::new(),
            trees: ShardedMap::new(),
            in_flight: ShardedMap::new(),
            errors: BoundedQueue::with_capacity(error_queue_len),
        }
    }

    /// Add a tree and queue it for dispatch, returning its id
    pub fn plant(&self, tree: Tree) -> String {
        let id = uuid::Uuid::new_v4().simple().to_string();
        self.trees.set(id.clone(), Arc::new(tree));
        self.pending.push(id.clone());
        id
    }

    /// Next pending tree, skipping ids whose tree has gone
    pub fn take_next(&self) -> Option<(String, Arc<Tree>)> {
        while let Some(id) = self.pending.shift() {
            if let Some(tree) = self.trees.get(&id) {
                return Some((id, tree));
            }
        }
        None
    }

    /// Put a tree back at the front of the pending queue
    pub fn requeue(&self, id: String) {
        self.in_flight.delete(&id);
        self.pending.unshift(id);
    }

    /// Remember which worker a tree was sent to
    pub fn dispatched(&self, id: &str, worker: &str) {
        self.in_flight.set(id, worker.to_string());
    }

    pub fn worker_of(&self, id: &str) -> Option<String> {
        self.in_flight.get(id)
    }

    pub fn tree(&self, id: &str) -> Option<Arc<Tree>> {
        self.trees.get(id)
    }

    /// Store the callback carried by a returned branch
    pub fn complete(&self, id: &str, branch: &Tree) -> Correlation {
        let Some(tree) = self.trees.get(id) else {
            return Correlation::Unknown;
        };

        let mut stored = None;
        for returned in branch.tasks.to_vec() {
            let Some(task) = tree.find_task(&returned.tag) else {
                continue;
            };
            for action in returned.actions.to_vec() {
                let Some(handle) = task.find_action(&action.tag) else {
                    continue;
                };
                let filled = task
                    .actions
                    .with_mut(handle, |target| target.fill_callback(action.callback.clone()))
                    .unwrap_or(false);
                stored = Some(stored.unwrap_or(false) || filled);
            }
        }

        match stored {
            None => Correlation::Unmatched,
            Some(false) => Correlation::Duplicate,
            Some(true) if tree.is_complete() => {
                self.trees.delete(id);
                self.in_flight.delete(id);
                Correlation::Completed(tree)
            }
            Some(true) => Correlation::Updated,
        }
    }

    /// Drop a tree wherever it is held
    pub fn discard(&self, id: &str) -> bool {
        self.in_flight.delete(id);
        self.trees.delete(id)
    }

    /// Drop in-flight trees whose worker is not in `live`, returning their ids
    pub fn evict_lost(&self, live: &[String]) -> Vec<String> {
        let mut lost = Vec::new();
        self.in_flight.iterate(|_, id, worker| {
            if !live.iter().any(|tag| tag == worker) {
                lost.push(id.to_string());
            }
            true
        });

        for id in &lost {
            let worker = self.in_flight.get(id).unwrap_or_default();
            self.discard(id);
            self.record_error(format!("{id}: worker {worker} went away"));
        }
        lost
    }

    /// Keep an error report, evicting the oldest when full
    pub fn record_error(&self, error: impl Into<String>) {
        self.errors.push(error.into());
    }

    pub fn errors(&self) -> Vec<String> {
        self.errors.to_vec()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    /// Trees held, pending or in flight
    pub fn len(&self) -> usize {
        self.trees.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trees.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tree() -> Tree {
        Tree::new("Sample")
            .with_task(
                Task::new("T1")
                    .with_action(Action::new("A1", "Echo", "one"))
                    .with_action(Action::new("A2", "Echo", "two")),
            )
            .with_task(
                Task::new("T2")
                    .with_action(Action::new("A3", "Echo", "three"))
                    .with_action(Action::new("A4", "Echo", "four")),
            )
    }

    #[test]
    fn test_fetch_branch_consumes_in_order() {
        let hub = BoundedQueue::new();
        hub.push(Arc::new(sample_tree()));

        let mut seen = Vec::new();
        for _ in 0..4 {
            let branch = fetch_branch(&hub, true).unwrap();
            seen.push(branch.action.unwrap().tag);
        }
        assert_eq!(seen, vec!["A1", "A2", "A3", "A4"]);

        let spent = fetch_branch(&hub, true).unwrap();
        assert!(spent.is_spent());
        assert!(spent.tree.tasks.is_empty());
        assert_eq!(hub.len(), 1);
    }

    #[test]
    fn test_fetch_branch_peek_does_not_consume() {
        let hub = BoundedQueue::new();
        hub.push(Arc::new(sample_tree()));
        let first = fetch_branch(&hub, false).unwrap();
        let second = fetch_branch(&hub, false).unwrap();
        assert_eq!(first.action, second.action);
        assert_eq!(first.tree.action_count(), 4);
    }

    #[test]
    fn test_fetch_branch_skips_empty_tasks() {
        let tree = Tree::new("Gaps")
            .with_task(Task::new("Empty"))
            .with_task(Task::new("Full").with_action(Action::new("A", "Echo", "")));
        let hub = BoundedQueue::new();
        hub.push(Arc::new(tree));

        let branch = fetch_branch(&hub, false).unwrap();
        assert_eq!(branch.task.unwrap().tag, "Full");
        assert_eq!(branch.tree.tasks.len(), 1);
    }

    #[test]
    fn test_fetch_branch_empty_hub() {
        let hub: BoundedQueue<Arc<Tree>> = BoundedQueue::new();
        assert!(fetch_branch(&hub, true).is_none());
    }

    #[test]
    fn test_branch_to_tree_keeps_timestamp() {
        let tree = sample_tree();
        let task = tree.find_task("T2").unwrap();
        let action = Action::new("A3", "Echo", "three");
        let branch = branch_to_tree(&tree, &task, action.clone());

        assert_eq!(branch.tag, "Sample");
        let only = branch.tasks.peek_front().unwrap();
        assert_eq!(only.created_at, task.created_at);
        assert_eq!(only.actions.to_vec(), vec![action]);
    }

    #[test]
    fn test_json_round_trip() {
        let tree = sample_tree();
        let json = tree_to_json(&tree).unwrap();
        assert!(json.contains(r#""Tag":"Sample""#));
        assert!(json.contains(r#""Command":"Echo""#));

        let rebuilt = json_to_tree(&json).unwrap();
        assert_eq!(rebuilt.tag, "Sample");
        assert_eq!(rebuilt.action_count(), 4);
        assert_eq!(
            rebuilt.find_task("T1").unwrap().created_at,
            tree.find_task("T1").unwrap().created_at
        );
    }

    #[test]
    fn test_json_without_timestamp_or_callback() {
        let json = concat!(
            r#"{"Tag":"X","Task":[{"Tag":"T","#,
            r#""Action":[{"Tag":"A","Command":"Ping","Params":""}]}]}"#
        );
        let tree = json_to_tree(json).unwrap();
        let task = tree.find_task("T").unwrap();
        assert!(task.created_at > 0);
        assert!(!task.actions.peek_front().unwrap().has_callback());
    }

    #[test]
    fn test_json_decode_error_status() {
        let err = json_to_tree("{not json").unwrap_err();
        assert_eq!(err.status(), crate::status::StatusCode::JSON_ERROR);
    }

    #[test]
    fn test_fill_callback_is_write_once() {
        let mut action = Action::new("A", "Echo", "");
        assert!(action.fill_callback("first"));
        assert!(!action.fill_callback("second"));
        assert_eq!(action.callback, "first");
    }

    #[test]
    fn test_forest_correlation_completes_tree() {
        let forest = Forest::new("Forest", 4);
        let id = forest.plant(
            Tree::new("Pair").with_task(
                Task::new("T")
                    .with_action(Action::new("A1", "Echo", "x"))
                    .with_action(Action::new("A2", "Echo", "y")),
            ),
        );

        let (taken, tree) = forest.take_next().unwrap();
        assert_eq!(taken, id);
        forest.dispatched(&id, "worker");
        assert_eq!(forest.in_flight_len(), 1);

        let task = tree.find_task("T").unwrap();
        let mut first = Action::new("A1", "Echo", "x");
        first.fill_callback("r1");
        let reply = branch_to_tree(&tree, &task, first);
        assert!(matches!(forest.complete(&id, &reply), Correlation::Updated));
        assert!(matches!(forest.complete(&id, &reply), Correlation::Duplicate));

        let mut second = Action::new("A2", "Echo", "y");
        second.fill_callback("r2");
        let reply = branch_to_tree(&tree, &task, second);
        assert!(matches!(forest.complete(&id, &reply), Correlation::Completed(_)));
        assert!(forest.is_empty());
        assert_eq!(forest.in_flight_len(), 0);
        assert!(matches!(forest.complete(&id, &reply), Correlation::Unknown));
    }

    #[test]
    fn test_forest_error_queue_is_bounded() {
        let forest = Forest::new("Forest", 2);
        forest.record_error("e1");
        forest.record_error("e2");
        forest.record_error("e3");
        assert_eq!(forest.errors(), vec!["e2".to_string(), "e3".to_string()]);
    }

    #[test]
    fn test_forest_evicts_trees_of_lost_workers() {
        let forest = Forest::new("Forest", 8);
        for n in 0..1000 {
            forest.plant(Tree::new(format!("T{n}")).with_task(Task::new("T")));
            let (id, _) = forest.take_next().unwrap();
            forest.dispatched(&id, if n == 0 { "alive" } else { "gone" });
        }
        assert_eq!(forest.len(), 1000);
        assert_eq!(forest.in_flight_len(), 1000);

        let lost = forest.evict_lost(&["alive".to_string()]);
        assert_eq!(lost.len(), 999);
        assert_eq!(forest.len(), 1);
        assert_eq!(forest.in_flight_len(), 1);
        assert!(forest.errors()[7].contains("worker gone went away"));

        assert_eq!(forest.evict_lost(&[]).len(), 1);
        assert!(forest.is_empty());
        assert_eq!(forest.in_flight_len(), 0);
    }

    #[test]
    fn test_forest_discard_drops_pending_tree() {
        let forest = Forest::new("Forest", 2);
        let id = forest.plant(Tree::new("Dropped"));
        assert!(forest.discard(&id));
        assert!(!forest.discard(&id));
        assert!(forest.take_next().is_none());
    }
}
