//! Receiver (worker) service
//!
//! A receiver dials the commander, announces itself with a heartbeat every
//! heartbeat interval and executes inbound `?EVAL` frames against its
//! operation table. When the connection drops it waits the reconnect delay
//! and dials again until the service is stopped.
//!
//! Lifecycle: *disconnected → connecting → connected → reconnecting*.

use std::sync::{Arc, Mutex, PoisonError, RwLock};

use futures::{Stream, StreamExt};
use neuron_core::{
    analyze_bytes, generate_message, report, Envelope, Head, NeuronConfig, NeuronError, Obfuscator,
    Result, StatusCode, TransportError,
};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration};
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tracing::{debug, info, warn};

use crate::connection::{eval_frame, write_loop, ConnectionHandle};
use crate::operations::{Invocation, OperationTable};
use crate::scheduler::{cancel_interval, retry, run_interval, CancelSignal, Retiming, Signal, Tick};

/// Connection state of a receiver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Worker side of the command bus
pub struct Receiver {
    config: Arc<NeuronConfig>,
    obfuscator: Arc<Obfuscator>,
    operations: Arc<OperationTable>,
    state: RwLock<ConnectionState>,
    connection: RwLock<Option<ConnectionHandle>>,
    shutdown: Mutex<CancelSignal>,
    runner: Mutex<Option<JoinHandle<()>>>,
}

fn read<T: Clone>(lock: &RwLock<T>) -> T {
    lock.read().unwrap_or_else(PoisonError::into_inner).clone()
}

fn write<T>(lock: &RwLock<T>, value: T) {
    *lock.write().unwrap_or_else(PoisonError::into_inner) = value;
}

impl Receiver {
    pub fn new(config: Arc<NeuronConfig>, operations: Arc<OperationTable>) -> Arc<Self> {
        Arc::new(Self {
            obfuscator: Arc::new(Obfuscator::from_config(&config)),
            state: RwLock::new(ConnectionState::Disconnected),
            connection: RwLock::new(None),
            shutdown: Mutex::new(CancelSignal::new()),
            runner: Mutex::new(None),
            operations,
            config,
        })
    }

    pub fn config(&self) -> &NeuronConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        read(&self.state)
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Live connection handle, if any
    pub fn connection(&self) -> Option<ConnectionHandle> {
        read(&self.connection)
    }

    fn shutdown_signal(&self) -> CancelSignal {
        self.shutdown.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Start dialing the commander in the background
    pub fn start_service(self: &Arc<Self>) -> Result<()> {
        let mut runner = self.runner.lock().unwrap_or_else(PoisonError::into_inner);
        if runner.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return Err(NeuronError::config_error("receiver is already started"));
        }

        let shutdown = CancelSignal::new();
        *self.shutdown.lock().unwrap_or_else(PoisonError::into_inner) = shutdown.clone();

        let receiver = Arc::clone(self);
        *runner = Some(tokio::spawn(async move { receiver.run(shutdown).await }));
        info!("Receiver {} started", self.config.node_id);
        Ok(())
    }

    /// Stop dialing and close the live connection
    pub async fn stop_service(&self) -> Result<()> {
        let shutdown = self.shutdown_signal();
        shutdown.cancel();
        if let Some(connection) = self.connection() {
            connection.close();
        }

        let runner = self.runner.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(mut runner) = runner {
            let grace = self.config.intervals.reconnect().max(Duration::from_secs(1));
            if timeout(grace, &mut runner).await.is_err() {
                warn!("Receiver loop did not stop in time, aborting");
                runner.abort();
            }
        }
        write(&self.state, ConnectionState::Disconnected);
        info!("Receiver {} stopped", self.config.node_id);
        Ok(())
    }

    async fn run(self: Arc<Self>, shutdown: CancelSignal) {
        let url = self.config.commander_url.clone();
        while !shutdown.is_cancelled() {
            write(&self.state, ConnectionState::Connecting);
            debug!("Dialing commander at {}", url);

            let connected = tokio::select! {
                _ = shutdown.cancelled() => break,
                result = tokio_tungstenite::connect_async(url.as_str()) => result,
            };

            match connected {
                Ok((socket, _response)) => {
                    let (sink, stream) = socket.split();
                    let (handle, outbound) =
                        ConnectionHandle::channel(&url, Arc::clone(&self.obfuscator));
                    let writer = tokio::spawn(write_loop(sink, outbound, url.clone()));
                    self.serve(handle, stream, &shutdown).await;
                    match writer.await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => warn!("Connection to commander ended: {}", e),
                        Err(e) => warn!("Writer task failed: {}", e),
                    }
                }
                Err(e) => {
                    report(
                        "Receiver",
                        "Connect",
                        StatusCode::WEBSOCKET_ERROR,
                        format!("{}: {}", url, e),
                    );
                }
            }

            if shutdown.is_cancelled() {
                break;
            }
            write(&self.state, ConnectionState::Reconnecting);
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sleep(self.config.intervals.reconnect()) => {}
            }
        }
        write(&self.state, ConnectionState::Disconnected);
    }

    /// Run one connection: heartbeat plus the read loop
    ///
    /// Returns when the peer closes, a read fails, the writer task goes away,
    /// or the service is stopped.
    pub async fn serve<S>(&self, handle: ConnectionHandle, mut stream: S, shutdown: &CancelSignal)
    where
        S: Stream<Item = std::result::Result<WsMessage, WsError>> + Unpin,
    {
        write(&self.connection, Some(handle.clone()));
        write(&self.state, ConnectionState::Connected);
        info!("Connected to commander at {}", handle.peer());

        let heartbeat = CancelSignal::new();
        let lost = CancelSignal::new();
        let node_id = self.config.node_id.as_str();
        let frame = generate_message(Head::Notification, "HEART", [""], Some(node_id));
        let beat_handle = handle.clone();
        let beat_lost = lost.clone();
        let beat_cancel = heartbeat.clone();
        let interval = self.config.intervals.heartbeat();
        tokio::spawn(async move {
            run_interval(
                "Receiver.Heartbeat",
                move || {
                    let handle = beat_handle.clone();
                    let frame = frame.clone();
                    async move {
                        match handle.send_frame(&frame) {
                            Ok(()) => Tick::proceed(()),
                            Err(e) => {
                                warn!("Heartbeat failed: {}", e);
                                Tick::with_status(StatusCode::WEBSOCKET_ERROR, ())
                            }
                        }
                    }
                },
                move |signal: Signal<()>| {
                    if signal.is_final() && signal.status() != StatusCode::PROCESS_SHUTDOWN {
                        beat_lost.cancel();
                    }
                },
                interval,
                beat_cancel,
                Retiming::Fixed,
            )
            .await;
        });

        loop {
            let message = tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = lost.cancelled() => break,
                _ = handle.closed() => break,
                message = stream.next() => message,
            };
            match message {
                Some(Ok(WsMessage::Binary(bytes))) => self.handle_frames(&bytes),
                Some(Ok(WsMessage::Text(text))) => self.handle_frames(text.as_bytes()),
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("Read from commander failed: {}", e);
                    break;
                }
            }
        }

        cancel_interval(&heartbeat, self.config.intervals.heartbeat()).await;
        write(&self.connection, None);
        handle.close();
        info!("Disconnected from commander at {}", handle.peer());
    }

    /// Handle one inbound websocket payload
    pub fn handle_frames(&self, data: &[u8]) {
        let plain = match self.obfuscator.decode(data) {
            Ok(Some(plain)) => plain,
            Ok(None) => {
                warn!("Dropping unsalted payload from commander");
                return;
            }
            Err(e) => {
                warn!("Dropping undecodable payload from commander: {}", e);
                return;
            }
        };
        match analyze_bytes(&plain) {
            Ok(frames) => {
                for envelope in frames {
                    match envelope {
                        Some(envelope) => self.handle_envelope(envelope),
                        None => warn!("Dropping malformed frame from commander"),
                    }
                }
            }
            Err(e) => warn!("Dropping payload from commander: {}", e),
        }
    }

    fn handle_envelope(&self, envelope: Envelope) {
        if !envelope.is(Head::Request, "EVAL") {
            debug!("Ignoring frame {}{} from commander", envelope.head, envelope.tag);
            return;
        }
        let Some(connection) = self.connection() else {
            warn!("EVAL received without a live connection");
            return;
        };
        let invocation = Invocation {
            connection,
            envelope_id: envelope.id.clone(),
            args: envelope.cmds.iter().skip(2).cloned().collect(),
        };
        let (Some(service), Some(operation)) = (envelope.cmd(0), envelope.cmd(1)) else {
            report("Receiver", "EVAL", StatusCode::COMMAND_ERROR, &envelope.cmds);
            invocation.refuse(&NeuronError::missing_parameter("service and operation"));
            return;
        };
        if let Err(e) = self.operations.dispatch(service, operation, invocation) {
            report("Receiver", "EVAL", e.status(), e.to_string());
        }
    }

    /// Write a frame on the live connection, retrying while disconnected
    pub async fn send_message(&self, frame: &str) -> Result<()> {
        let outcome = retry(
            self.config.send_retries,
            self.config.intervals.retry(),
            |_| async {
                match self.connection() {
                    Some(connection) => connection.send_frame(frame),
                    None => Err(TransportError::NotConnected.into()),
                }
            },
        )
        .await;

        match outcome.result {
            Ok(()) => Ok(()),
            Err(e) => {
                report("Receiver", "Message", StatusCode::WEBSOCKET_ERROR, e.to_string());
                Err(TransportError::NotConnected.into())
            }
        }
    }

    /// Ask the commander to run `service.operation` with a payload
    pub async fn eval(
        &self,
        id: &str,
        service: &str,
        operation: &str,
        payload: &str,
    ) -> Result<()> {
        self.send_message(&eval_frame(id, service, operation, payload)).await
    }
}

impl std::fmt::Debug for Receiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Receiver")
            .field("node_id", &self.config.node_id)
            .field("state", &self.state())
            .finish()
    }
}
