//! Central system WebSocket server
//!
//! [`CentralSystem`] owns the connection registry, the dispatcher and the
//! outbound request tracker. Each accepted station gets three tasks:
//!
//! - reader: decodes frames, applies replies at once, queues calls
//! - worker: answers queued calls one at a time, in arrival order
//! - writer: drains the connection's outgoing queue into the socket
//!
//! Replies never wait behind a call being answered, so a responder may
//! itself call the station it is answering. Both per-connection queues are
//! bounded by `queue_capacity`; a call arriving at a full call queue is
//! answered at once with an `InternalError` CALLERROR.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::auth::Credentials;
use crate::config::ServerConfig;
use crate::dispatcher::{Dispatcher, Inbound, Origin};
use crate::error::{Result, ServerError};
use crate::events::{Handlers, HandlerResult, RequestContext};
use crate::handshake::negotiate;
use crate::ocpp::{Call, CallError, ErrorCode, OcppRequest, Reply, UNKNOWN_MESSAGE_ID};
use crate::registry::{ConnectionHandle, ConnectionRegistry, Outgoing, SendError, StationId};
use crate::tracker::{CallOutcome, RequestError, RequestTracker};

/// Close reason sent to every station when the server stops
pub const SHUTDOWN_REASON: &str = "server shutting down";

/// Description of the CALLERROR answering a call that found the queue full
pub const CALL_QUEUE_FULL: &str = "Too many calls awaiting an answer";

type WsStream = WebSocketStream<TcpStream>;

/// Handle to the central system; cheap to clone
#[derive(Clone)]
pub struct CentralSystem {
    inner: Arc<Inner>,
}

struct Inner {
    config: ServerConfig,
    registry: ConnectionRegistry,
    tracker: Arc<RequestTracker>,
    dispatcher: Dispatcher,
    credentials: Credentials,
    shutdown: CancellationToken,
    next_connection_id: AtomicU64,
}

impl CentralSystem {
    pub fn new(config: ServerConfig) -> Self {
        let tracker = Arc::new(RequestTracker::new());
        let dispatcher = Dispatcher::new(config.version.codec_table(), tracker.clone());

        Self {
            inner: Arc::new(Inner {
                config,
                registry: ConnectionRegistry::new(),
                tracker,
                dispatcher,
                credentials: Credentials::new(),
                shutdown: CancellationToken::new(),
                next_connection_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    // ------------------------------------------------------------------
    // Administration
    // ------------------------------------------------------------------

    /// Set the Basic auth password of a station
    pub fn add_credential(&self, station_id: impl Into<String>, password: impl Into<String>) {
        self.inner.credentials.add(station_id, password);
    }

    pub fn remove_credential(&self, station_id: &str) -> bool {
        self.inner.credentials.remove(station_id)
    }

    pub fn connected_stations(&self) -> Vec<StationId> {
        self.inner.registry.stations()
    }

    pub fn is_connected(&self, station_id: &str) -> bool {
        self.inner.registry.lookup(station_id).is_some()
    }

    /// Number of server-initiated calls still waiting for an answer
    pub fn pending_requests(&self) -> usize {
        self.inner.tracker.len()
    }

    /// Stop accepting and close every station connection
    pub fn shutdown(&self) {
        info!("Central system shutting down");
        self.inner.registry.close_all(SHUTDOWN_REASON);
        self.inner.shutdown.cancel();
    }

    // ------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------

    /// Subscriber lists of an inbound action
    pub fn handlers<R: OcppRequest>(&self) -> Result<Arc<Handlers<R>>> {
        self.inner
            .dispatcher
            .codecs()
            .handlers::<R>()
            .ok_or(ServerError::UnknownAction(R::ACTION))
    }

    pub fn on_request_received<R, F>(&self, observer: F) -> Result<()>
    where
        R: OcppRequest,
        F: Fn(&RequestContext, &R) + Send + Sync + 'static,
    {
        self.handlers::<R>()?.on_request_received(observer);
        Ok(())
    }

    /// Register a responder for an inbound action.
    ///
    /// All responders run concurrently; the earliest registered one that
    /// returns a response decides the answer.
    pub fn respond_with<R, F, Fut>(&self, responder: F) -> Result<()>
    where
        R: OcppRequest,
        F: Fn(RequestContext, R) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult<R::Response>> + Send + 'static,
    {
        self.handlers::<R>()?.respond_with(responder);
        Ok(())
    }

    pub fn on_response_sent<R, F>(&self, observer: F) -> Result<()>
    where
        R: OcppRequest,
        F: Fn(&RequestContext, &R, &R::Response) + Send + Sync + 'static,
    {
        self.handlers::<R>()?.on_response_sent(observer);
        Ok(())
    }

    pub fn on_call_sent<F>(&self, observer: F)
    where
        F: Fn(&StationId, &Call) + Send + Sync + 'static,
    {
        self.inner.tracker.observers().on_call_sent(observer);
    }

    pub fn on_reply_received<F>(&self, observer: F)
    where
        F: Fn(&StationId, &Reply) + Send + Sync + 'static,
    {
        self.inner.tracker.observers().on_reply_received(observer);
    }

    // ------------------------------------------------------------------
    // Server-initiated calls
    // ------------------------------------------------------------------

    /// Send a request to a station and wait up to the configured timeout
    pub async fn call<R: OcppRequest>(&self, station_id: &str, request: R) -> CallOutcome<R::Response> {
        self.call_with_timeout(station_id, request, self.inner.config.request_timeout)
            .await
    }

    /// Send a request to a station and wait up to `timeout`.
    ///
    /// Never fails: a call without a usable answer carries the action's
    /// failed response and the reason in `error`.
    pub async fn call_with_timeout<R: OcppRequest>(
        &self,
        station_id: &str,
        request: R,
        timeout: Duration,
    ) -> CallOutcome<R::Response> {
        let call = match Call::new(R::ACTION, &request) {
            Ok(call) => call,
            Err(e) => {
                error!("Could not encode {} for {}: {}", R::ACTION, station_id, e);
                return CallOutcome::failed(
                    UNKNOWN_MESSAGE_ID,
                    RequestError::TransmissionFailed(e.to_string()),
                );
            }
        };

        let Some(station) = StationId::new(station_id) else {
            return CallOutcome::failed(
                call.message_id,
                RequestError::UnknownClient(station_id.to_string()),
            );
        };

        let pending = self
            .inner
            .tracker
            .send(&self.inner.registry, &station, call, timeout)
            .await;
        CallOutcome::from_pending(pending)
    }

    // ------------------------------------------------------------------
    // Accept loop
    // ------------------------------------------------------------------

    /// Bind the configured address and serve until [`shutdown`](Self::shutdown)
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(self.inner.config.listen_addr).await?;
        self.serve(listener).await
    }

    /// Serve stations on an already bound listener
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        info!(
            "Central system listening on ws://{} ({})",
            listener.local_addr()?,
            self.inner.config.version
        );

        loop {
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let central = self.clone();
                        tokio::spawn(async move {
                            if let Err(e) = central.handle_connection(stream, addr).await {
                                debug!("Connection from {} ended: {}", addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Accept failed: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
            }
        }

        self.inner.registry.close_all(SHUTDOWN_REASON);
        info!("Central system stopped");
        Ok(())
    }

    fn websocket_config(&self) -> WebSocketConfig {
        WebSocketConfig {
            max_message_size: Some(self.inner.config.max_message_size),
            max_frame_size: Some(self.inner.config.max_frame_size),
            ..Default::default()
        }
    }

    async fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) -> Result<()> {
        let subprotocol = self.inner.config.version.subprotocol();
        let credentials = self
            .inner
            .config
            .require_basic_auth
            .then_some(&self.inner.credentials);

        let mut station = None;
        let callback = |request: &Request,
                        response: Response|
         -> std::result::Result<Response, ErrorResponse> {
            let (station_id, response) = negotiate(request, response, subprotocol, credentials)?;
            station = Some(station_id);
            Ok(response)
        };
        let ws = tokio_tungstenite::accept_hdr_async_with_config(
            stream,
            callback,
            Some(self.websocket_config()),
        )
        .await?;

        let Some(station_id) = station else {
            return Ok(());
        };

        let id = self.inner.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let cancel = self.inner.shutdown.child_token();
        let capacity = self.inner.config.queue_capacity;
        let (connection, outgoing) =
            ConnectionHandle::new(id, station_id.clone(), Some(addr), cancel.clone(), capacity);

        info!("Station {} connected from {} as connection {}", station_id, addr, id);
        self.inner.registry.bind(connection.clone());

        let (sink, stream) = ws.split();
        let (calls_tx, calls_rx) = mpsc::channel(capacity.max(1));

        let writer = tokio::spawn(write_frames(sink, outgoing, cancel.clone()));
        let worker = tokio::spawn(self.clone().answer_calls(connection.clone(), calls_rx));

        self.read_frames(&connection, stream, calls_tx).await;

        cancel.cancel();
        self.inner.registry.unbind(&connection);
        if let Err(e) = worker.await {
            error!("Call worker of {} failed: {}", station_id, e);
        }
        if let Err(e) = writer.await {
            error!("Writer of {} failed: {}", station_id, e);
        }

        info!("Station {} disconnected (connection {})", station_id, id);
        Ok(())
    }

    async fn read_frames(
        &self,
        connection: &ConnectionHandle,
        mut stream: SplitStream<WsStream>,
        calls: mpsc::Sender<Inbound>,
    ) {
        let station_id = connection.station_id();
        let cancel = connection.cancel_token();

        loop {
            let message = tokio::select! {
                _ = cancel.cancelled() => break,
                message = stream.next() => message,
            };

            match message {
                Some(Ok(Message::Text(text))) => {
                    debug!("Received from {}: {}", station_id, text.as_str());
                    match Inbound::decode(text.as_str()) {
                        Inbound::Reply(reply) => {
                            self.inner.dispatcher.handle_reply(station_id, reply)
                        }
                        Inbound::Ignored => {}
                        inbound => match calls.try_send(inbound) {
                            Ok(()) => {}
                            Err(TrySendError::Full(inbound)) => {
                                if reject_overflow(connection, inbound).await.is_err() {
                                    break;
                                }
                            }
                            Err(TrySendError::Closed(_)) => break,
                        },
                    }
                }
                Some(Ok(Message::Binary(_))) => {
                    warn!("Ignoring binary frame from {}", station_id);
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!("Close from {}: {:?}", station_id, frame);
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("Read from {} failed: {}", station_id, e);
                    break;
                }
                None => break,
            }
        }
    }

    async fn answer_calls(
        self,
        connection: ConnectionHandle,
        mut calls: mpsc::Receiver<Inbound>,
    ) {
        let origin = Origin {
            station_id: Some(connection.station_id().clone()),
            central: self.clone(),
            cancel: connection.cancel_token().clone(),
        };

        loop {
            let inbound = tokio::select! {
                _ = origin.cancel.cancelled() => break,
                inbound = calls.recv() => match inbound {
                    Some(inbound) => inbound,
                    None => break,
                },
            };

            let frame = match inbound {
                Inbound::Call(call) => self.inner.dispatcher.handle_call(&origin, call).await,
                Inbound::Invalid(error) => error.to_text(),
                Inbound::Reply(_) | Inbound::Ignored => continue,
            };

            debug!("Sending to {}: {}", connection.station_id(), frame);
            if let Err(e) = connection.send_text_wait(frame).await {
                debug!("Answer to {} dropped: {}", connection.station_id(), e);
                break;
            }
        }
    }
}

/// Answer a call that found the worker's queue full
async fn reject_overflow(
    connection: &ConnectionHandle,
    inbound: Inbound,
) -> std::result::Result<(), SendError> {
    let error = match inbound {
        Inbound::Call(call) => {
            CallError::new(call.message_id, ErrorCode::InternalError, CALL_QUEUE_FULL)
        }
        Inbound::Invalid(error) => error,
        Inbound::Reply(_) | Inbound::Ignored => return Ok(()),
    };

    warn!(
        "Call queue of {} is full, rejecting {}",
        connection.station_id(),
        error.message_id
    );
    connection.send_text_wait(error.to_text()).await
}

async fn write_frames(
    mut sink: SplitSink<WsStream, Message>,
    mut outgoing: mpsc::Receiver<Outgoing>,
    cancel: CancellationToken,
) {
    loop {
        // Queued frames go out before cancellation is honoured.
        let next = tokio::select! {
            biased;
            next = outgoing.recv() => next,
            _ = cancel.cancelled() => None,
        };

        match next {
            Some(Outgoing::Text(text)) => {
                if let Err(e) = sink.send(Message::Text(text.into())).await {
                    warn!("Write failed: {}", e);
                    // Wakes the reader and every call waiting on this connection.
                    cancel.cancel();
                    break;
                }
            }
            Some(Outgoing::Close(reason)) => {
                let frame = CloseFrame {
                    code: CloseCode::Normal,
                    reason: reason.into(),
                };
                if let Err(e) = sink.send(Message::Close(Some(frame))).await {
                    debug!("Close frame not sent: {}", e);
                }
                break;
            }
            None => break,
        }
    }

    if let Err(e) = sink.close().await {
        debug!("Socket close failed: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ocpp::v16::DataTransferResponse;
    use crate::ocpp::OcppResponse;
    use serde::{Deserialize, Serialize};
    use std::collections::HashMap;

    /// Serializes to a JSON object with non-string keys, which JSON cannot hold
    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct MeterTable {
        readings: HashMap<(u8, u8), i32>,
    }

    impl OcppRequest for MeterTable {
        const ACTION: &'static str = "DataTransfer";
        type Response = DataTransferResponse;
    }

    #[tokio::test]
    async fn test_unencodable_request_reports_unknown_message_id() {
        let central = CentralSystem::new(ServerConfig::default());
        let request = MeterTable {
            readings: HashMap::from([((1, 2), 42)]),
        };

        let outcome = central.call("CP1", request).await;

        assert_eq!(outcome.message_id, UNKNOWN_MESSAGE_ID);
        assert!(matches!(outcome.error, Some(RequestError::TransmissionFailed(_))));
        assert_eq!(outcome.response, DataTransferResponse::failed());
        assert_eq!(central.pending_requests(), 0);
    }
}
