//! Commander (master) service
//!
//! The commander keeps a registry of connected workers, an outbound queue of
//! addressed frames and a queue of replies. A drain looper delivers one
//! outbound frame per tick, either to every worker whose identity matches the
//! target or to every worker when the target is blank.
//!
//! Lifecycle: *stopped → starting → running → stopping → stopped*.

use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

use base64::{engine::general_purpose::STANDARD, Engine};
use neuron_core::{
    analyze_bytes, analyze_message, report, BoundedQueue, Envelope, Head, NeuronConfig,
    NeuronError, Obfuscator, Result, ShardedMap, StatusCode,
};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::connection::{eval_frame, ConnectionHandle};
use crate::operations::{Invocation, OperationTable};
use crate::scheduler::{cancel_interval, run_interval, CancelSignal, Retiming, Signal, Tick};

// ----------------------------------------------------------------------------
// Commander Types
// ----------------------------------------------------------------------------

/// Lifecycle state of a commander
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// A connected worker
#[derive(Debug, Clone)]
pub struct ClientEntry {
    /// Worker identity learned from its heartbeat, empty until then
    pub tag: String,
    pub connection: ConnectionHandle,
}

/// Parsed frame waiting for the drain looper
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundFrame {
    /// Worker identity, blank to broadcast
    pub target: String,
    pub envelope: Envelope,
}

/// A heartbeat or reply received from a worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplyRecord {
    /// Registry key of the connection it arrived on
    pub peer: String,
    /// Envelope id, the worker identity for heartbeats
    pub id: String,
    /// `HEART` or `REPLY`
    pub tag: String,
    /// Raw command, usually base64
    pub command: String,
}

impl ReplyRecord {
    /// Base64-decoded command, or the raw command when it is not base64 text
    pub fn decoded(&self) -> String {
        decode_for_log(&self.command)
    }
}

fn decode_for_log(command: &str) -> String {
    STANDARD
        .decode(command)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .unwrap_or_else(|| command.to_string())
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Looper {
    cancel: CancelSignal,
    handle: JoinHandle<()>,
}

// ----------------------------------------------------------------------------
// Commander
// ----------------------------------------------------------------------------

/// Master side of the command bus
pub struct Commander {
    config: Arc<NeuronConfig>,
    obfuscator: Arc<Obfuscator>,
    operations: Arc<OperationTable>,
    state: RwLock<ServiceState>,
    clients: ShardedMap<ClientEntry>,
    outbound: BoundedQueue<OutboundFrame>,
    replies: BoundedQueue<ReplyRecord>,
    looper: Mutex<Option<Looper>>,
}

impl Commander {
    pub fn new(config: Arc<NeuronConfig>, operations: Arc<OperationTable>) -> Arc<Self> {
        Arc::new(Self {
            obfuscator: Arc::new(Obfuscator::from_config(&config)),
            outbound: BoundedQueue::with_capacity(config.queues.outbound_capacity),
            replies: BoundedQueue::with_capacity(config.queues.reply_capacity),
            clients: ShardedMap::new(),
            state: RwLock::new(ServiceState::Stopped),
            looper: Mutex::new(None),
            operations,
            config,
        })
    }

    pub fn config(&self) -> &NeuronConfig {
        &self.config
    }

    pub fn obfuscator(&self) -> Arc<Obfuscator> {
        Arc::clone(&self.obfuscator)
    }

    pub fn operations(&self) -> &Arc<OperationTable> {
        &self.operations
    }

    pub fn state(&self) -> ServiceState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ServiceState) {
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = state;
    }

    pub fn is_running(&self) -> bool {
        self.state() == ServiceState::Running
    }

    /// Reset the queues and start the drain looper
    pub fn start_service(self: &Arc<Self>) -> Result<()> {
        if self.state() != ServiceState::Stopped {
            return Err(NeuronError::config_error("commander is already started"));
        }
        self.set_state(ServiceState::Starting);
        self.outbound.renew();
        self.replies.renew();

        let cancel = CancelSignal::new();
        let weak: Weak<Self> = Arc::downgrade(self);
        let interval = self.config.intervals.commander();
        let looper_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            run_interval(
                "Commander.Looper",
                move || {
                    let weak = weak.clone();
                    async move {
                        match weak.upgrade() {
                            Some(commander) => Tick::proceed(commander.drain_once()),
                            None => Tick::with_status(StatusCode::SYSTEM_SHUTDOWN, 0),
                        }
                    }
                },
                |signal: Signal<usize>| {
                    if signal.is_final() {
                        report("Commander", "Looper", signal.status(), signal.to_string());
                    }
                },
                interval,
                looper_cancel,
                Retiming::Fixed,
            )
            .await;
        });

        *lock(&self.looper) = Some(Looper { cancel, handle });
        self.set_state(ServiceState::Running);
        info!("Commander service started");
        Ok(())
    }

    /// Stop the looper and close every connection
    pub async fn stop_service(&self) -> Result<()> {
        if self.state() != ServiceState::Running {
            return Ok(());
        }
        self.set_state(ServiceState::Stopping);

        let looper = lock(&self.looper).take();
        if let Some(looper) = looper {
            if !cancel_interval(&looper.cancel, self.config.intervals.commander() * 10).await {
                looper.handle.abort();
            }
        }

        for (peer, entry) in self.clients.drain() {
            debug!("Closing connection {}", peer);
            entry.connection.close();
        }

        self.set_state(ServiceState::Stopped);
        info!("Commander service stopped");
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Connection bookkeeping
    // ------------------------------------------------------------------------

    /// Track a new connection under its peer address
    pub fn register(&self, peer: &str, connection: ConnectionHandle) {
        info!("Worker connected: {}", peer);
        self.clients.set(
            peer,
            ClientEntry {
                tag: String::new(),
                connection,
            },
        );
    }

    pub fn unregister(&self, peer: &str) -> Option<ClientEntry> {
        let entry = self.clients.pop(peer);
        if entry.is_some() {
            info!("Worker disconnected: {}", peer);
        }
        entry
    }

    pub fn client(&self, peer: &str) -> Option<ClientEntry> {
        self.clients.get(peer)
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// `(peer, worker identity)` of every connection, sorted by peer
    pub fn workers(&self) -> Vec<(String, String)> {
        self.clients
            .keys()
            .into_iter()
            .filter_map(|peer| self.clients.get(&peer).map(|entry| (peer, entry.tag)))
            .collect()
    }

    pub fn replies(&self) -> &BoundedQueue<ReplyRecord> {
        &self.replies
    }

    pub fn outbound_len(&self) -> usize {
        self.outbound.len()
    }

    // ------------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------------

    /// Queue a frame for a worker identity, or for everyone when blank
    ///
    /// Only the first frame of `frame` is queued; it must parse.
    pub fn enqueue(&self, target: &str, frame: &str) -> Result<()> {
        if frame.is_empty() {
            return Err(NeuronError::missing_parameter("message"));
        }
        let mut frames = analyze_message(frame).into_iter();
        let Some(Some(envelope)) = frames.next() else {
            return Err(NeuronError::malformed_frame(format!("cannot queue {frame:?}")));
        };
        if frames.next().is_some() {
            warn!("Queuing only the first frame of {:?}", frame);
        }
        self.outbound.push(OutboundFrame {
            target: target.to_string(),
            envelope,
        });
        Ok(())
    }

    /// Queue `?EVAL#service#operation#base64(payload)` for a worker
    pub fn eval(
        &self,
        target: &str,
        id: &str,
        service: &str,
        operation: &str,
        payload: &str,
    ) -> Result<()> {
        self.enqueue(target, &eval_frame(id, service, operation, payload))
    }

    /// Deliver at most one outbound frame, returning how many workers got it
    pub fn drain_once(&self) -> usize {
        let Some(outbound) = self.outbound.shift() else {
            return 0;
        };

        let mut targets = Vec::new();
        self.clients.iterate(|_, peer, entry| {
            if outbound.target.is_empty() || entry.tag == outbound.target {
                targets.push((peer.to_string(), entry.connection.clone()));
            }
            true
        });

        let frame = outbound.envelope.encode();
        let mut delivered = 0;
        for (peer, connection) in targets {
            match connection.send_frame(&frame) {
                Ok(()) => delivered += 1,
                Err(e) => warn!("Delivery to {} failed: {}", peer, e),
            }
        }
        if delivered == 0 {
            debug!("No worker matched target {:?}", outbound.target);
        }
        delivered
    }

    // ------------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------------

    /// Handle one inbound websocket payload from `peer`
    pub fn handle_frames(&self, peer: &str, data: &[u8]) {
        let plain = match self.obfuscator.decode(data) {
            Ok(Some(plain)) => plain,
            Ok(None) => {
                warn!("Dropping unsalted payload from {}", peer);
                return;
            }
            Err(e) => {
                warn!("Dropping undecodable payload from {}: {}", peer, e);
                return;
            }
        };

        let frames = match analyze_bytes(&plain) {
            Ok(frames) => frames,
            Err(e) => {
                warn!("Dropping payload from {}: {}", peer, e);
                return;
            }
        };

        for envelope in frames {
            match envelope {
                Some(envelope) => self.handle_envelope(peer, envelope),
                None => warn!("Dropping malformed frame from {}", peer),
            }
        }
    }

    fn handle_envelope(&self, peer: &str, envelope: Envelope) {
        if self.config.commander_log {
            info!("Frame from {}: {}", peer, envelope);
        }

        match (envelope.head, envelope.tag.as_str()) {
            (Head::Notification, "HEART") => {
                let known = self.clients.atomic_section(peer, |entry| {
                    entry.map(|entry| entry.tag = envelope.id.clone()).is_some()
                });
                if !known {
                    warn!("Heartbeat from unregistered connection {}", peer);
                }
                self.record_replies(peer, &envelope);
            }
            (Head::Notification, "REPLY") => self.record_replies(peer, &envelope),
            (Head::Request, "EVAL") => self.dispatch_eval(peer, envelope),
            _ => warn!("Unhandled frame {}{} from {}", envelope.head, envelope.tag, peer),
        }
    }

    fn record_replies(&self, peer: &str, envelope: &Envelope) {
        for command in &envelope.cmds {
            debug!("{} from {} ({}): {}", envelope.tag, peer, envelope.id, decode_for_log(command));
            self.replies.push(ReplyRecord {
                peer: peer.to_string(),
                id: envelope.id.clone(),
                tag: envelope.tag.clone(),
                command: command.clone(),
            });
        }
    }

    fn dispatch_eval(&self, peer: &str, envelope: Envelope) {
        let Some(entry) = self.clients.get(peer) else {
            warn!("EVAL from unregistered connection {}", peer);
            return;
        };
        let invocation = Invocation {
            connection: entry.connection,
            envelope_id: envelope.id.clone(),
            args: envelope.cmds.iter().skip(2).cloned().collect(),
        };
        let (Some(service), Some(operation)) = (envelope.cmd(0), envelope.cmd(1)) else {
            report("Commander", "EVAL", StatusCode::COMMAND_ERROR, &envelope.cmds);
            invocation.refuse(&NeuronError::missing_parameter("service and operation"));
            return;
        };

        if let Err(e) = self.operations.dispatch(service, operation, invocation) {
            report("Commander", "EVAL", e.status(), e.to_string());
        }
    }
}

impl std::fmt::Debug for Commander {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Commander")
            .field("state", &self.state())
            .field("clients", &self.clients.len())
            .field("outbound", &self.outbound.len())
            .field("replies", &self.replies.len())
            .finish()
    }
}
