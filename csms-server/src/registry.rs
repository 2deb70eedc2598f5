//! Connection registry
//!
//! Maps a station identity to its live connection. At most one connection
//! per station is registered; binding a newer one evicts and closes the old.

use std::borrow::Borrow;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Close reason sent to a connection replaced by a reconnect
pub const SUPERSEDED_REASON: &str = "superseded by a newer connection";

/// Charge point identity, taken from the last path segment of the connection URI
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StationId(String);

impl StationId {
    /// Returns `None` for an empty or blank identity
    pub fn new(id: impl Into<String>) -> Option<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            None
        } else {
            Some(Self(id))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for StationId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for StationId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Unique id of one accepted socket, distinguishes reconnects of a station
pub type ConnectionId = u64;

/// Writes queued for a connection's socket
#[derive(Debug, Clone, PartialEq)]
pub enum Outgoing {
    Text(String),
    Close(String),
}

/// Why a frame could not be queued for a connection
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    #[error("connection {0} is closed")]
    Closed(ConnectionId),

    #[error("outgoing queue of connection {0} is full")]
    Full(ConnectionId),
}

/// Handle to a live connection; cheap to clone
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    station_id: StationId,
    remote_addr: Option<SocketAddr>,
    connected_at: DateTime<Utc>,
    outgoing: mpsc::Sender<Outgoing>,
    cancel: CancellationToken,
}

impl ConnectionHandle {
    /// Create a handle and the receiving end its socket writer drains.
    ///
    /// At most `capacity` frames wait for the writer.
    pub fn new(
        id: ConnectionId,
        station_id: StationId,
        remote_addr: Option<SocketAddr>,
        cancel: CancellationToken,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<Outgoing>) {
        let (outgoing, outgoing_rx) = mpsc::channel(capacity.max(1));
        let handle = Self {
            id,
            station_id,
            remote_addr,
            connected_at: Utc::now(),
            outgoing,
            cancel,
        };
        (handle, outgoing_rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn station_id(&self) -> &StationId {
        &self.station_id
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Token cancelled when the connection goes away
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.outgoing.is_closed()
    }

    /// Queue a text frame for the socket writer without waiting for room
    pub fn send_text(&self, text: String) -> Result<(), SendError> {
        if self.cancel.is_cancelled() {
            return Err(SendError::Closed(self.id));
        }
        self.outgoing
            .try_send(Outgoing::Text(text))
            .map_err(|e| match e {
                TrySendError::Full(_) => SendError::Full(self.id),
                TrySendError::Closed(_) => SendError::Closed(self.id),
            })
    }

    /// Queue a text frame, waiting while the writer is behind
    pub async fn send_text_wait(&self, text: String) -> Result<(), SendError> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(SendError::Closed(self.id)),
            sent = self.outgoing.send(Outgoing::Text(text)) => {
                sent.map_err(|_| SendError::Closed(self.id))
            }
        }
    }

    /// Ask the writer to send a close frame, then cancel the connection's tasks
    pub fn close(&self, reason: &str) {
        if let Err(e) = self.outgoing.try_send(Outgoing::Close(reason.to_string())) {
            debug!("Close frame for connection {} not queued: {}", self.id, e);
        }
        self.cancel.cancel();
    }
}

/// Registry of live station connections
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<StationId, ConnectionHandle>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection for its station.
    ///
    /// A connection already registered for the same station is replaced and
    /// closed; the replaced handle is returned.
    pub fn bind(&self, connection: ConnectionHandle) -> Option<ConnectionHandle> {
        let station_id = connection.station_id.clone();
        let connection_id = connection.id;

        let evicted = self
            .connections
            .lock()
            .insert(station_id.clone(), connection)
            .filter(|old| old.id != connection_id);

        match &evicted {
            Some(old) => {
                info!(
                    "Station {} reconnected: connection {} replaces {}",
                    station_id, connection_id, old.id
                );
                // The socket writer sends the close frame on its own task.
                old.close(SUPERSEDED_REASON);
            }
            None => info!("Station {} bound to connection {}", station_id, connection_id),
        }

        evicted
    }

    /// Connection currently registered for a station
    pub fn lookup(&self, station_id: &str) -> Option<ConnectionHandle> {
        self.connections.lock().get(station_id).cloned()
    }

    /// Remove a connection after it closed.
    ///
    /// Only removes the entry if it still belongs to this connection, so a
    /// late close of a replaced connection leaves the newer one in place.
    pub fn unbind(&self, connection: &ConnectionHandle) -> bool {
        let mut connections = self.connections.lock();
        match connections.get(connection.station_id.as_str()) {
            Some(current) if current.id == connection.id => {
                connections.remove(connection.station_id.as_str());
                drop(connections);
                info!(
                    "Station {} unbound from connection {}",
                    connection.station_id, connection.id
                );
                true
            }
            Some(current) => {
                debug!(
                    "Ignoring close of connection {} for station {}, now served by {}",
                    connection.id, connection.station_id, current.id
                );
                false
            }
            // Already drained by close_all
            None => {
                debug!(
                    "Close of connection {} for unregistered station {}",
                    connection.id, connection.station_id
                );
                false
            }
        }
    }

    pub fn stations(&self) -> Vec<StationId> {
        let mut stations: Vec<_> = self.connections.lock().keys().cloned().collect();
        stations.sort();
        stations
    }

    pub fn len(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.lock().is_empty()
    }

    /// Close every registered connection
    pub fn close_all(&self, reason: &str) {
        let connections: Vec<_> = self.connections.lock().drain().map(|(_, c)| c).collect();
        for connection in connections {
            connection.close(reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::{Arc, Mutex as StdMutex};
    use tracing::{Dispatch, Level};
    use tracing_subscriber::fmt::MakeWriter;

    fn handle(id: ConnectionId, station: &str) -> (ConnectionHandle, mpsc::Receiver<Outgoing>) {
        ConnectionHandle::new(
            id,
            StationId::new(station).unwrap(),
            None,
            CancellationToken::new(),
            8,
        )
    }

    #[test]
    fn test_station_id_rejects_blank() {
        assert!(StationId::new("").is_none());
        assert!(StationId::new("   ").is_none());
        assert_eq!(StationId::new("CP-1").unwrap().as_str(), "CP-1");
    }

    #[tokio::test]
    async fn test_bind_and_lookup() {
        let registry = ConnectionRegistry::new();
        let (first, _rx) = handle(1, "CP1");

        assert!(registry.bind(first).is_none());
        assert_eq!(registry.lookup("CP1").map(|c| c.id()), Some(1));
        assert!(registry.lookup("CP2").is_none());
    }

    #[tokio::test]
    async fn test_rebind_evicts_and_closes_previous() {
        let registry = ConnectionRegistry::new();
        let (first, mut first_rx) = handle(1, "CP1");
        let (second, _second_rx) = handle(2, "CP1");

        registry.bind(first.clone());
        let evicted = registry.bind(second).unwrap();

        assert_eq!(evicted.id(), 1);
        assert_eq!(registry.lookup("CP1").map(|c| c.id()), Some(2));
        assert_eq!(registry.len(), 1);

        let closed = first_rx.recv().await.unwrap();
        assert_eq!(closed, Outgoing::Close(SUPERSEDED_REASON.to_string()));
        first.cancel_token().cancelled().await;
        assert!(first.is_closed());
    }

    #[tokio::test]
    async fn test_stale_unbind_keeps_newer_connection() {
        let registry = ConnectionRegistry::new();
        let (first, _first_rx) = handle(1, "CP1");
        let (second, _second_rx) = handle(2, "CP1");

        registry.bind(first.clone());
        registry.bind(second.clone());

        assert!(!registry.unbind(&first));
        assert_eq!(registry.lookup("CP1").map(|c| c.id()), Some(2));

        assert!(registry.unbind(&second));
        assert!(!registry.unbind(&second));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_unbind_does_not_touch_other_stations() {
        let registry = ConnectionRegistry::new();
        let (a, _a_rx) = handle(1, "CP-A");
        let (b, _b_rx) = handle(2, "CP-B");

        registry.bind(a.clone());
        registry.bind(b);

        assert!(registry.unbind(&a));
        assert!(!registry.unbind(&a));
        assert_eq!(registry.stations(), vec![StationId::new("CP-B").unwrap()]);
    }

    #[test]
    fn test_send_after_close_fails() {
        let (conn, _rx) = handle(7, "CP7");
        assert!(conn.send_text("[]".into()).is_ok());

        conn.close("bye");
        assert_eq!(conn.send_text("[]".into()), Err(SendError::Closed(7)));
    }

    #[tokio::test]
    async fn test_full_queue_rejects_without_waiting() {
        let (conn, mut rx) = ConnectionHandle::new(
            3,
            StationId::new("CP3").unwrap(),
            None,
            CancellationToken::new(),
            2,
        );

        assert!(conn.send_text("[1]".into()).is_ok());
        assert!(conn.send_text("[2]".into()).is_ok());
        assert_eq!(conn.send_text("[3]".into()), Err(SendError::Full(3)));

        // A waiting send completes once the writer makes room.
        let waiting = tokio::spawn({
            let conn = conn.clone();
            async move { conn.send_text_wait("[4]".into()).await }
        });
        assert_eq!(rx.recv().await, Some(Outgoing::Text("[1]".into())));
        assert_eq!(waiting.await.unwrap(), Ok(()));
        assert_eq!(rx.recv().await, Some(Outgoing::Text("[2]".into())));
        assert_eq!(rx.recv().await, Some(Outgoing::Text("[4]".into())));
    }

    #[tokio::test]
    async fn test_waiting_send_gives_up_on_close() {
        let (conn, _rx) = ConnectionHandle::new(
            4,
            StationId::new("CP4").unwrap(),
            None,
            CancellationToken::new(),
            1,
        );
        conn.send_text("[1]".into()).unwrap();

        let waiting = tokio::spawn({
            let conn = conn.clone();
            async move { conn.send_text_wait("[2]".into()).await }
        });
        conn.cancel_token().cancel();

        assert_eq!(waiting.await.unwrap(), Err(SendError::Closed(4)));
    }

    struct LogBuffer {
        buffer: Arc<StdMutex<Vec<u8>>>,
    }

    struct LogBufferGuard {
        buffer: Arc<StdMutex<Vec<u8>>>,
    }

    impl<'a> MakeWriter<'a> for LogBuffer {
        type Writer = LogBufferGuard;

        fn make_writer(&'a self) -> Self::Writer {
            LogBufferGuard {
                buffer: self.buffer.clone(),
            }
        }
    }

    impl Write for LogBufferGuard {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.buffer.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_unbind_after_close_all_does_not_warn() {
        let registry = ConnectionRegistry::new();
        let (a, _a_rx) = handle(1, "CP-A");
        let (b, _b_rx) = handle(2, "CP-B");
        registry.bind(a.clone());
        registry.bind(b.clone());

        let buffer = Arc::new(StdMutex::new(Vec::new()));
        let subscriber = tracing_subscriber::fmt()
            .with_writer(LogBuffer {
                buffer: buffer.clone(),
            })
            .with_max_level(Level::WARN)
            .with_ansi(false)
            .finish();

        let dispatch = Dispatch::new(subscriber);
        tracing::dispatcher::with_default(&dispatch, || {
            registry.close_all("server shutting down");
            assert!(!registry.unbind(&a));
            assert!(!registry.unbind(&b));
        });

        assert!(registry.is_empty());
        let logs = String::from_utf8(buffer.lock().unwrap().clone()).unwrap();
        assert!(logs.is_empty(), "unexpected warnings: {}", logs);
    }
}
