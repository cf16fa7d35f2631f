//! Subscriber twin
//!
//! Trees pushed by a publisher queue up in a hub together with the
//! connection and id they arrived with. A processor looper takes one action
//! per tick, runs it through the [`ActionTable`], stores the result as the
//! action's callback and sends the branch back to the publisher.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use neuron_core::{
    branch_to_tree, fetch_branch, generate_message, json_to_tree, report, tree_to_json, Action,
    BoundedQueue, Head, Message, NeuronConfig, NeuronError, Result, ShardedMap, StatusCode, Task,
    Tree,
};
use tracing::{debug, info, warn};

use super::{Looper, LooperSlot, ANALYZE_OPERATION, ERROR_OPERATION, PUSH_OPERATION};
use crate::connection::ConnectionHandle;
use crate::operations::{Invocation, OperationTable};
use crate::scheduler::{run_interval, supervise, CancelSignal, Retiming, Signal, Tick};

pub const SERVICE: &str = "Subscriber";

// ----------------------------------------------------------------------------
// Action Table
// ----------------------------------------------------------------------------

/// Executes one action command
#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn run(&self, params: &str) -> Message;
}

/// Answers with its parameters
pub struct EchoAction;

#[async_trait]
impl ActionHandler for EchoAction {
    async fn run(&self, params: &str) -> Message {
        Message::success(params)
    }
}

/// Answers `Pong`
pub struct PingAction;

#[async_trait]
impl ActionHandler for PingAction {
    async fn run(&self, _params: &str) -> Message {
        Message::success("Pong")
    }
}

/// Action handlers keyed by command name
#[derive(Default)]
pub struct ActionTable {
    handlers: ShardedMap<Arc<dyn ActionHandler>>,
}

impl ActionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Table with the `Echo` and `Ping` commands
    pub fn with_builtins() -> Self {
        let table = Self::new();
        table.register("Echo", EchoAction);
        table.register("Ping", PingAction);
        table
    }

    pub fn register(&self, command: &str, handler: impl ActionHandler + 'static) {
        self.handlers.set(command, Arc::new(handler));
    }

    pub fn contains(&self, command: &str) -> bool {
        self.handlers.contains_key(command)
    }

    /// Run an action; unknown commands and panics become failure messages
    pub async fn run(&self, action: &Action) -> Message {
        let Some(handler) = self.handlers.get(&action.command) else {
            return Message::new(
                StatusCode::COMMAND_ERROR,
                format!("Command {} not found", action.command),
            );
        };

        match supervise(format!("Action.{}", action.command), handler.run(&action.params)).await {
            Ok(message) => message,
            Err(fault) => Message::new(StatusCode::SYSTEM_ERROR, fault.to_string()),
        }
    }
}

// ----------------------------------------------------------------------------
// Subscriber
// ----------------------------------------------------------------------------

/// Where a pushed tree came from
#[derive(Debug, Clone)]
struct Origin {
    id: String,
    connection: ConnectionHandle,
}

/// Queued trees and their origins, kept in lockstep
struct Hub {
    trees: BoundedQueue<Arc<Tree>>,
    origins: VecDeque<Origin>,
}

/// An action taken off the hub, ready to run
struct Work {
    tree: Arc<Tree>,
    task: Arc<Task>,
    action: Action,
    origin: Origin,
}

/// Worker-side half of the behavior-tree twins
pub struct Subscriber {
    config: Arc<NeuronConfig>,
    actions: ActionTable,
    hub: Mutex<Hub>,
    looper: LooperSlot,
}

impl Subscriber {
    pub fn new(config: Arc<NeuronConfig>, actions: ActionTable) -> Arc<Self> {
        Arc::new(Self {
            config,
            actions,
            hub: Mutex::new(Hub {
                trees: BoundedQueue::new(),
                origins: VecDeque::new(),
            }),
            looper: LooperSlot::default(),
        })
    }

    pub fn actions(&self) -> &ActionTable {
        &self.actions
    }

    fn hub(&self) -> MutexGuard<'_, Hub> {
        self.hub.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Trees waiting to be processed
    pub fn queued_len(&self) -> usize {
        self.hub().trees.len()
    }

    /// Expose the push operation on `table`
    pub fn register(self: &Arc<Self>, table: &OperationTable) {
        let weak = Arc::downgrade(self);
        table.register_fn(SERVICE, PUSH_OPERATION, move |invocation: Invocation| {
            let weak = weak.clone();
            async move {
                match weak.upgrade() {
                    Some(subscriber) => subscriber.push(&invocation),
                    None => Err(NeuronError::shutdown("subscriber dropped")),
                }
            }
        });
    }

    /// Queue a pushed tree, reporting decode failures to the publisher
    pub fn push(&self, invocation: &Invocation) -> Result<()> {
        let tree = match invocation.decoded_arg(0).and_then(|json| json_to_tree(&json)) {
            Ok(tree) => tree,
            Err(e) => {
                let id = invocation.envelope_id.as_str();
                let detail = e.to_string();
                let notice = generate_message(
                    Head::Notification,
                    "ER",
                    [PUSH_OPERATION, detail.as_str()],
                    Some(id),
                );
                if let Err(eval_error) = invocation.connection.eval(
                    id,
                    super::publisher::SERVICE,
                    ERROR_OPERATION,
                    &notice,
                ) {
                    report(SERVICE, PUSH_OPERATION, eval_error.status(), eval_error.to_string());
                }
                return Err(e);
            }
        };

        debug!("Queued tree {} ({} actions)", invocation.envelope_id, tree.action_count());
        let mut hub = self.hub();
        hub.trees.push(Arc::new(tree));
        hub.origins.push_back(Origin {
            id: invocation.envelope_id.clone(),
            connection: invocation.connection.clone(),
        });
        Ok(())
    }

    /// Take the next action off the hub, evicting finished trees
    fn next_work(&self) -> Option<Work> {
        let mut hub = self.hub();
        loop {
            let branch = fetch_branch(&hub.trees, true)?;
            let Some(origin) = hub.origins.front().cloned() else {
                warn!("Dropping trees without an origin");
                hub.trees.renew();
                return None;
            };
            if branch.tree.tasks.is_empty() {
                hub.trees.shift();
                hub.origins.pop_front();
            }
            if let (Some(task), Some(action)) = (branch.task, branch.action) {
                return Some(Work {
                    tree: branch.tree,
                    task,
                    action,
                    origin,
                });
            }
        }
    }

    /// Run one action and send its branch back, returning false when idle
    pub async fn process_once(&self) -> Result<bool> {
        let Some(work) = self.next_work() else {
            return Ok(false);
        };
        let Work {
            tree,
            task,
            mut action,
            origin,
        } = work;

        let message = self.actions.run(&action).await;
        if !message.is_success() {
            report(SERVICE, &action.command, message.code, &message.data);
        }
        action.fill_callback(message.to_json()?);

        let branch = branch_to_tree(&tree, &task, action);
        let json = tree_to_json(&branch)?;
        origin
            .connection
            .eval(&origin.id, super::publisher::SERVICE, ANALYZE_OPERATION, &json)?;
        Ok(true)
    }

    pub fn is_started(&self) -> bool {
        self.looper.is_running()
    }

    /// Start the processor looper
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.is_started() {
            return Err(NeuronError::config_error("subscriber is already started"));
        }

        let cancel = CancelSignal::new();
        let weak = Arc::downgrade(self);
        let looper_cancel = cancel.clone();
        let interval = self.config.intervals.processor();
        let handle = tokio::spawn(async move {
            run_interval(
                "Subscriber.Processor",
                move || {
                    let weak = weak.clone();
                    async move {
                        let Some(subscriber) = weak.upgrade() else {
                            return Tick::with_status(StatusCode::SYSTEM_SHUTDOWN, false);
                        };
                        match subscriber.process_once().await {
                            Ok(processed) => Tick::proceed(processed),
                            Err(e) => {
                                report(SERVICE, "Processor", e.status(), e.to_string());
                                Tick::proceed(false)
                            }
                        }
                    }
                },
                |signal: Signal<bool>| {
                    if signal.is_final() {
                        report(SERVICE, "Processor", signal.status(), signal.to_string());
                    }
                },
                interval,
                looper_cancel,
                Retiming::Fixed,
            )
            .await;
        });

        self.looper.set(Looper::new(cancel, handle));
        info!("Subscriber started");
        Ok(())
    }

    pub async fn stop(&self) {
        if let Some(looper) = self.looper.take() {
            looper.stop(self.config.intervals.processor() * 10).await;
            info!("Subscriber stopped");
        }
    }
}

impl std::fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscriber")
            .field("queued", &self.queued_len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Outbound;
    use base64::{engine::general_purpose::STANDARD, Engine};
    use neuron_core::{analyze_message, Envelope, Obfuscator};
    use tokio::sync::mpsc::UnboundedReceiver;

    fn subscriber() -> Arc<Subscriber> {
        Subscriber::new(Arc::new(NeuronConfig::testing()), ActionTable::with_builtins())
    }

    fn obfuscator() -> Arc<Obfuscator> {
        Arc::new(Obfuscator::new("1.4.7"))
    }

    fn push(
        subscriber: &Subscriber,
        id: &str,
        payload: &str,
    ) -> (Result<()>, UnboundedReceiver<Outbound>) {
        let (connection, receiver) = ConnectionHandle::channel("commander", obfuscator());
        let invocation = Invocation {
            connection,
            envelope_id: id.to_string(),
            args: vec![STANDARD.encode(payload)],
        };
        (subscriber.push(&invocation), receiver)
    }

    fn next_eval(receiver: &mut UnboundedReceiver<Outbound>) -> Envelope {
        let Ok(Outbound::Frame(bytes)) = receiver.try_recv() else {
            panic!("expected an eval frame");
        };
        let frame = obfuscator().decode_str(&bytes).unwrap().unwrap();
        analyze_message(&frame)[0].clone().unwrap()
    }

    fn returned_action(envelope: &Envelope) -> Action {
        let json = String::from_utf8(STANDARD.decode(envelope.cmd(2).unwrap()).unwrap()).unwrap();
        let branch = json_to_tree(&json).unwrap();
        assert_eq!(branch.tasks.len(), 1);
        branch.tasks.peek_front().unwrap().actions.peek_front().unwrap()
    }

    fn sample_tree() -> String {
        let tree = Tree::new("Publisher").with_task(
            Task::with_timestamp("Check", 42)
                .with_action(Action::new("a1", "Ping", ""))
                .with_action(Action::new("a2", "Echo", "hello"))
                .with_action(Action::new("a3", "Launch", "")),
        );
        tree_to_json(&tree).unwrap()
    }

    #[tokio::test]
    async fn test_processes_actions_in_order() {
        let subscriber = subscriber();
        let (result, mut rx) = push(&subscriber, "tree-1", &sample_tree());
        result.unwrap();
        assert_eq!(subscriber.queued_len(), 1);

        assert!(subscriber.process_once().await.unwrap());
        let envelope = next_eval(&mut rx);
        assert_eq!(envelope.id(), Some("tree-1"));
        assert_eq!(envelope.cmd(0), Some("Publisher"));
        assert_eq!(envelope.cmd(1), Some(ANALYZE_OPERATION));
        let action = returned_action(&envelope);
        assert_eq!(action.tag, "a1");
        assert_eq!(Message::from_json(&action.callback).unwrap(), Message::success("Pong"));

        assert!(subscriber.process_once().await.unwrap());
        let action = returned_action(&next_eval(&mut rx));
        assert_eq!(Message::from_json(&action.callback).unwrap(), Message::success("hello"));

        assert!(subscriber.process_once().await.unwrap());
        let action = returned_action(&next_eval(&mut rx));
        assert_eq!(
            Message::from_json(&action.callback).unwrap().code,
            StatusCode::COMMAND_ERROR
        );

        assert_eq!(subscriber.queued_len(), 0);
        assert!(!subscriber.process_once().await.unwrap());
    }

    #[tokio::test]
    async fn test_trees_keep_their_origin() {
        let subscriber = subscriber();
        let one = tree_to_json(
            &Tree::new("Publisher")
                .with_task(Task::new("T").with_action(Action::new("x", "Ping", ""))),
        )
        .unwrap();
        let (_, mut rx_first) = push(&subscriber, "first", &one);
        let (_, mut rx_second) = push(&subscriber, "second", &one);

        assert!(subscriber.process_once().await.unwrap());
        assert!(subscriber.process_once().await.unwrap());
        assert_eq!(next_eval(&mut rx_first).id(), Some("first"));
        assert_eq!(next_eval(&mut rx_second).id(), Some("second"));
    }

    #[tokio::test]
    async fn test_bad_tree_reports_error() {
        let subscriber = subscriber();
        let (result, mut rx) = push(&subscriber, "broken", "{not json");
        assert_eq!(result.unwrap_err().status(), StatusCode::JSON_ERROR);
        assert_eq!(subscriber.queued_len(), 0);

        let envelope = next_eval(&mut rx);
        assert_eq!(envelope.id(), Some("broken"));
        assert_eq!(envelope.cmd(1), Some(ERROR_OPERATION));
        let notice = String::from_utf8(STANDARD.decode(envelope.cmd(2).unwrap()).unwrap()).unwrap();
        assert!(notice.starts_with("broken#!ER#BehaviorTreePush#"));
    }

    #[tokio::test]
    async fn test_panicking_action_becomes_system_error() {
        struct Faulty;

        #[async_trait]
        impl ActionHandler for Faulty {
            async fn run(&self, _params: &str) -> Message {
                if true {
                    panic!("faulty action");
                }
                Message::success(())
            }
        }

        let table = ActionTable::new();
        table.register("Faulty", Faulty);
        let message = table.run(&Action::new("f", "Faulty", "")).await;
        assert_eq!(message.code, StatusCode::SYSTEM_ERROR);
    }

    #[tokio::test]
    async fn test_looper_drains_hub() {
        let subscriber = subscriber();
        let (_, mut rx) = push(&subscriber, "tree-1", &sample_tree());
        subscriber.start().unwrap();

        for _ in 0..3 {
            let outbound = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert!(matches!(outbound, Outbound::Frame(_)));
        }
        subscriber.stop().await;
        assert_eq!(subscriber.queued_len(), 0);
    }
}
