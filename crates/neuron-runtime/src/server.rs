//! Commander network front
//!
//! One listener serves both commander endpoints over hyper. Requests for the
//! channel path carrying a websocket upgrade become worker connections;
//! requests for the message path queue a frame for delivery and answer with a
//! JSON [`Message`].

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use hyper::body::HttpBody;
use hyper::header::{self, HeaderName, HeaderValue};
use hyper::server::conn::Http;
use hyper::service::service_fn;
use hyper::{Body, Request, Response, StatusCode as HttpStatus};
use neuron_core::{Message, NeuronError, Result, StatusCode, TransportError};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};
use url::{form_urlencoded, Url};

use crate::commander::Commander;
use crate::connection::{write_loop, ConnectionHandle};
use crate::scheduler::CancelSignal;

/// Largest accepted request body
pub const MAX_BODY_LEN: usize = 1024 * 1024;

/// Budget for reading one request, and for one enqueue round trip
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

// ----------------------------------------------------------------------------
// Request Helpers
// ----------------------------------------------------------------------------

/// Merge url-encoded query and body parameters, body entries winning
pub fn request_params(query: &str, body: &[u8]) -> HashMap<String, String> {
    form_urlencoded::parse(query.as_bytes())
        .chain(form_urlencoded::parse(body))
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect()
}

fn header_has_token(request: &Request<Body>, name: HeaderName, token: &str) -> bool {
    request
        .headers()
        .get_all(name)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|part| part.trim().eq_ignore_ascii_case(token))
}

/// True for `Connection: Upgrade` plus `Upgrade: websocket`
pub fn is_websocket_upgrade(request: &Request<Body>) -> bool {
    header_has_token(request, header::CONNECTION, "upgrade")
        && header_has_token(request, header::UPGRADE, "websocket")
}

/// Collect a request body, refusing anything over [`MAX_BODY_LEN`]
pub async fn read_body(mut body: Body) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    while let Some(chunk) = body.data().await {
        let chunk = chunk.map_err(|e| NeuronError::bad_request(e.to_string()))?;
        if buffer.len() + chunk.len() > MAX_BODY_LEN {
            return Err(NeuronError::bad_request(format!(
                "body exceeds {MAX_BODY_LEN} bytes"
            )));
        }
        buffer.extend_from_slice(&chunk);
    }
    Ok(buffer)
}

fn json_response(status: HttpStatus, message: &Message) -> Response<Body> {
    let mut response = match message.to_json() {
        Ok(json) => Response::new(Body::from(json)),
        Err(e) => {
            warn!("Failed to serialize response: {}", e);
            let mut response = Response::new(Body::empty());
            *response.status_mut() = HttpStatus::INTERNAL_SERVER_ERROR;
            return response;
        }
    };
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
}

// ----------------------------------------------------------------------------
// Enqueue Endpoint
// ----------------------------------------------------------------------------

/// Queue `message` for `neuronId`, answering with a status message
pub fn handle_enqueue(commander: &Commander, params: &HashMap<String, String>) -> Message {
    let Some(target) = params.get("neuronId") else {
        return Message::new(StatusCode::REQUEST_ERROR, "Lack of Parameter -> neuronId");
    };
    let Some(frame) = params.get("message").filter(|frame| !frame.is_empty()) else {
        return Message::new(StatusCode::REQUEST_ERROR, "Lack of Parameter -> message");
    };
    match commander.enqueue(target, frame) {
        Ok(()) => {
            debug!("Queued frame for {:?}", target);
            Message::success(())
        }
        Err(e) => Message::new(e.status(), e.to_string()),
    }
}

// ----------------------------------------------------------------------------
// Server
// ----------------------------------------------------------------------------

/// Listener serving the channel and message endpoints of a commander
pub struct CommanderServer {
    commander: Arc<Commander>,
    listener: TcpListener,
}

impl CommanderServer {
    /// Bind the configured listen address
    pub async fn bind(commander: Arc<Commander>) -> Result<Self> {
        let addr = commander.config().listen_addr.clone();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| NeuronError::connection_failed(&addr, e.to_string()))?;
        info!("Commander listening on {}", addr);
        Ok(Self { commander, listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr().map_err(TransportError::from)?)
    }

    /// Accept connections until `shutdown` fires
    pub async fn run(self, shutdown: CancelSignal) -> Result<()> {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        tokio::spawn(serve_http(Arc::clone(&self.commander), stream, addr));
                    }
                    Err(e) => warn!("Accept failed: {}", e),
                },
            }
        }
        shutdown.acknowledge();
        info!("Commander listener stopped");
        Ok(())
    }

    pub fn spawn(self, shutdown: CancelSignal) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run(shutdown))
    }
}

/// Serve one HTTP/1.1 request on an accepted stream
async fn serve_http(commander: Arc<Commander>, stream: TcpStream, addr: SocketAddr) {
    let service = service_fn(move |request: Request<Body>| {
        let commander = Arc::clone(&commander);
        async move { Ok::<_, Infallible>(route(commander, addr, request).await) }
    });
    let connection = Http::new()
        .http1_only(true)
        .http1_keep_alive(false)
        .serve_connection(stream, service)
        .with_upgrades();

    match timeout(REQUEST_TIMEOUT, connection).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Request from {} failed: {}", addr, e),
        Err(_) => warn!("Request from {} timed out", addr),
    }
}

async fn route(
    commander: Arc<Commander>,
    peer: SocketAddr,
    mut request: Request<Body>,
) -> Response<Body> {
    let path = request.uri().path().to_string();

    if path == commander.config().channel_path() {
        if is_websocket_upgrade(&request) {
            return accept_channel(commander, peer, &mut request);
        }
        let message = Message::new(StatusCode::WEBSOCKET_ERROR, "Upgrade Required");
        return json_response(HttpStatus::INTERNAL_SERVER_ERROR, &message);
    }

    if path != commander.config().message_path() {
        let message = Message::new(StatusCode::REQUEST_ERROR, format!("Path Not Found -> {path}"));
        return json_response(HttpStatus::NOT_FOUND, &message);
    }

    let query = request.uri().query().unwrap_or_default().to_string();
    match read_body(request.into_body()).await {
        Ok(body) => {
            let params = request_params(&query, &body);
            json_response(HttpStatus::OK, &handle_enqueue(&commander, &params))
        }
        Err(e) => {
            warn!("Rejected request from {}: {}", peer, e);
            json_response(HttpStatus::BAD_REQUEST, &Message::new(e.status(), e.to_string()))
        }
    }
}

/// Answer the websocket handshake and hand the upgraded stream to a task
fn accept_channel(
    commander: Arc<Commander>,
    peer: SocketAddr,
    request: &mut Request<Body>,
) -> Response<Body> {
    let accept = match request.headers().get(header::SEC_WEBSOCKET_KEY) {
        Some(key) => derive_accept_key(key.as_bytes()),
        None => {
            let message =
                Message::new(StatusCode::WEBSOCKET_ERROR, "Lack of Parameter -> Sec-WebSocket-Key");
            return json_response(HttpStatus::BAD_REQUEST, &message);
        }
    };
    let Ok(accept) = HeaderValue::from_str(&accept) else {
        let message = Message::new(StatusCode::WEBSOCKET_ERROR, "Invalid handshake key");
        return json_response(HttpStatus::BAD_REQUEST, &message);
    };

    let upgrade = hyper::upgrade::on(request);
    tokio::spawn(async move {
        match upgrade.await {
            Ok(upgraded) => {
                let socket = WebSocketStream::from_raw_socket(upgraded, Role::Server, None).await;
                serve_channel(commander, socket, peer.to_string()).await;
            }
            Err(e) => warn!("Upgrade from {} failed: {}", peer, e),
        }
    });

    let mut response = Response::new(Body::empty());
    *response.status_mut() = HttpStatus::SWITCHING_PROTOCOLS;
    let headers = response.headers_mut();
    headers.insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
    headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
    headers.insert(header::SEC_WEBSOCKET_ACCEPT, accept);
    response
}

/// Run one worker connection until either side closes it or its writer fails
async fn serve_channel<S>(commander: Arc<Commander>, socket: WebSocketStream<S>, peer: String)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, mut source) = socket.split();

    let (connection, outbound) = ConnectionHandle::channel(peer.clone(), commander.obfuscator());
    commander.register(&peer, connection.clone());
    let writer = tokio::spawn(write_loop(sink, outbound, peer.clone()));

    loop {
        let next = tokio::select! {
            _ = connection.closed() => break,
            next = source.next() => next,
        };
        match next {
            Some(Ok(WsMessage::Binary(data))) => commander.handle_frames(&peer, &data),
            Some(Ok(WsMessage::Text(text))) => commander.handle_frames(&peer, text.as_bytes()),
            Some(Ok(WsMessage::Close(_))) | None => break,
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                warn!("Read from {} failed: {}", peer, e);
                break;
            }
        }
    }

    commander.unregister(&peer);
    connection.close();
    match writer.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Connection {} ended: {}", peer, e),
        Err(e) => warn!("Writer for {} failed: {}", peer, e),
    }
}

// ----------------------------------------------------------------------------
// Client
// ----------------------------------------------------------------------------

fn request_failed(endpoint: &str, err: reqwest::Error) -> NeuronError {
    if err.is_timeout() {
        NeuronError::timeout(format!("enqueue request to {endpoint}"))
    } else {
        NeuronError::connection_failed(endpoint, err.to_string())
    }
}

/// Ask a commander's message endpoint to queue `frame` for `target`
pub async fn request_enqueue(endpoint: &str, target: &str, frame: &str) -> Result<Message> {
    let url =
        Url::parse(endpoint).map_err(|e| NeuronError::invalid_url(format!("{endpoint}: {e}")))?;
    let response = reqwest::Client::new()
        .get(url)
        .query(&[("neuronId", target), ("message", frame)])
        .timeout(REQUEST_TIMEOUT)
        .send()
        .await
        .map_err(|e| request_failed(endpoint, e))?;
    let body = response.text().await.map_err(|e| request_failed(endpoint, e))?;
    Message::from_json(&body)
}
