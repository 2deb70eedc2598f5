//! Outbound request tracker
//!
//! Correlates server-initiated CALLs with the CALLRESULT or CALLERROR a
//! station sends back. An entry is registered before the frame is written,
//! resolved at most once by the dispatcher, and removed by the issuing task
//! when it resumes, whether it got an answer or hit its deadline.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::events::OutboundObservers;
use crate::ocpp::{Call, ErrorCode, OcppResponse, Reply};
use crate::registry::{ConnectionRegistry, StationId};

/// Why a server-initiated call produced no usable response
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RequestError {
    #[error("station {0} is not connected")]
    UnknownClient(String),

    #[error("could not transmit request: {0}")]
    TransmissionFailed(String),

    #[error("no response within {0:?}")]
    Timeout(Duration),

    #[error("station answered {code}: {description}")]
    Remote {
        code: ErrorCode,
        description: String,
        details: Value,
    },

    #[error("invalid response payload: {0}")]
    InvalidResponse(String),
}

impl RequestError {
    /// Wire error code closest to this failure
    pub fn code(&self) -> ErrorCode {
        match self {
            RequestError::UnknownClient(_) | RequestError::TransmissionFailed(_) => {
                ErrorCode::GenericError
            }
            RequestError::Timeout(_) => ErrorCode::Timeout,
            RequestError::Remote { code, .. } => *code,
            RequestError::InvalidResponse(_) => ErrorCode::FormationViolation,
        }
    }
}

/// Record of one server-initiated call
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub message_id: String,
    pub station_id: StationId,
    pub action: String,
    pub request: Value,
    pub issued_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub timeout: Duration,
    /// CALLRESULT payload, if one arrived in time
    pub response: Option<Value>,
    pub error: Option<RequestError>,
}

impl PendingRequest {
    fn new(station_id: &StationId, call: &Call, timeout: Duration) -> Self {
        let issued_at = Utc::now();
        let deadline = chrono::Duration::from_std(timeout)
            .ok()
            .and_then(|timeout| issued_at.checked_add_signed(timeout))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        Self {
            message_id: call.message_id.clone(),
            station_id: station_id.clone(),
            action: call.action.clone(),
            request: call.payload.clone(),
            issued_at,
            deadline,
            timeout,
            response: None,
            error: None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.response.is_some() || self.error.is_some()
    }
}

/// Result of offering a station's reply to the tracker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// The reply completed the pending call for this action
    Resolved { action: String },
    /// No pending call has this id (never issued, or already expired)
    Unknown,
    /// The id belongs to a call sent to another station
    WrongStation,
    /// The call was already answered
    Duplicate,
}

struct PendingEntry {
    station_id: StationId,
    action: String,
    completion: Option<oneshot::Sender<Reply>>,
}

/// Map of outstanding server-initiated calls, keyed by message id
#[derive(Default)]
pub struct RequestTracker {
    pending: Mutex<HashMap<String, PendingEntry>>,
    observers: OutboundObservers,
}

/// Removes the entry when the issuing call returns or is dropped
struct PendingGuard<'a> {
    tracker: &'a RequestTracker,
    message_id: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.tracker.remove(self.message_id);
    }
}

impl RequestTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Observers told about every call sent and every reply matched
    pub fn observers(&self) -> &OutboundObservers {
        &self.observers
    }

    /// Issue a call to a station and wait for its answer or the timeout.
    ///
    /// Never fails: every failure is recorded in the returned request's
    /// `error` field.
    pub async fn send(
        &self,
        registry: &ConnectionRegistry,
        station_id: &StationId,
        call: Call,
        timeout: Duration,
    ) -> PendingRequest {
        let mut pending = PendingRequest::new(station_id, &call, timeout);

        let Some(connection) = registry.lookup(station_id.as_str()) else {
            warn!("{} for {} not sent: station is not connected", call.action, station_id);
            pending.error = Some(RequestError::UnknownClient(station_id.to_string()));
            return pending;
        };

        let mut completion = self.register(station_id, &call);
        let _guard = PendingGuard {
            tracker: self,
            message_id: &call.message_id,
        };

        let frame = call.to_text();
        debug!("Sending to {}: {}", station_id, frame);
        if let Err(e) = connection.send_text(frame) {
            warn!("{} for {} not sent: {}", call.action, station_id, e);
            pending.error = Some(RequestError::TransmissionFailed(e.to_string()));
            return pending;
        }
        self.observers.call_sent(station_id, &call);

        // The connection going away ends the wait as a transmission failure.
        let closed = connection.cancel_token().clone();
        let waited = tokio::select! {
            answered = tokio::time::timeout(timeout, &mut completion) => {
                answered.map_err(|_| RequestError::Timeout(timeout))
            }
            _ = closed.cancelled() => Err(RequestError::TransmissionFailed(format!(
                "connection {} closed before a reply",
                connection.id()
            ))),
        };
        self.remove(&call.message_id);

        // A reply can land between the wait ending and the removal above.
        let (reply, failure) = match waited {
            Ok(reply) => (reply.ok(), RequestError::Timeout(timeout)),
            Err(failure) => (completion.try_recv().ok(), failure),
        };

        match reply {
            Some(Reply::Result(result)) => {
                pending.response = Some(result.payload);
            }
            Some(Reply::Error(error)) => {
                debug!(
                    "{} {} to {} failed: {} {}",
                    call.action, call.message_id, station_id, error.error_code, error.error_description
                );
                pending.error = Some(RequestError::Remote {
                    code: error.error_code,
                    description: error.error_description,
                    details: error.error_details,
                });
            }
            None => {
                warn!(
                    "{} {} to {} got no reply: {}",
                    call.action, call.message_id, station_id, failure
                );
                pending.error = Some(failure);
            }
        }

        pending
    }

    fn register(&self, station_id: &StationId, call: &Call) -> oneshot::Receiver<Reply> {
        let (completion, receiver) = oneshot::channel();
        self.pending.lock().insert(
            call.message_id.clone(),
            PendingEntry {
                station_id: station_id.clone(),
                action: call.action.clone(),
                completion: Some(completion),
            },
        );
        receiver
    }

    /// Complete the pending call a station's reply belongs to
    pub fn resolve(&self, station_id: &StationId, reply: Reply) -> Resolution {
        let observed = reply.clone();
        let resolution = self.complete(station_id, reply);
        if matches!(resolution, Resolution::Resolved { .. }) {
            self.observers.reply_received(station_id, &observed);
        }
        resolution
    }

    fn complete(&self, station_id: &StationId, reply: Reply) -> Resolution {
        let mut pending = self.pending.lock();

        let Some(entry) = pending.get_mut(reply.message_id()) else {
            return Resolution::Unknown;
        };
        if &entry.station_id != station_id {
            return Resolution::WrongStation;
        }
        let Some(completion) = entry.completion.take() else {
            return Resolution::Duplicate;
        };

        // Sent under the lock so an expiring caller either sees it or finds no entry.
        let action = entry.action.clone();
        if completion.send(reply).is_err() {
            debug!("Caller of {} went away before its reply arrived", action);
        }
        Resolution::Resolved { action }
    }

    fn remove(&self, message_id: &str) -> bool {
        self.pending.lock().remove(message_id).is_some()
    }

    pub fn contains(&self, message_id: &str) -> bool {
        self.pending.lock().contains_key(message_id)
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}

/// Typed result of a server-initiated call.
///
/// Always carries a response: the station's, or the action's generated
/// failure response when `error` is set.
#[derive(Debug, Clone)]
pub struct CallOutcome<T> {
    pub message_id: String,
    pub response: T,
    pub error: Option<RequestError>,
}

impl<T: OcppResponse> CallOutcome<T> {
    pub fn from_pending(pending: PendingRequest) -> Self {
        let PendingRequest {
            message_id,
            response,
            error,
            timeout,
            ..
        } = pending;

        let parsed = match (response, error) {
            (_, Some(error)) => Err(error),
            (Some(payload), None) => {
                T::deserialize(&payload).map_err(|e| RequestError::InvalidResponse(e.to_string()))
            }
            (None, None) => Err(RequestError::Timeout(timeout)),
        };

        match parsed {
            Ok(response) => Self {
                message_id,
                response,
                error: None,
            },
            Err(error) => Self::failed(message_id, error),
        }
    }

    /// Outcome of a call that produced no usable answer
    pub fn failed(message_id: impl Into<String>, error: RequestError) -> Self {
        Self {
            message_id: message_id.into(),
            response: T::failed(),
            error: Some(error),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    pub fn into_result(self) -> Result<T, RequestError> {
        match self.error {
            None => Ok(self.response),
            Some(error) => Err(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ocpp::v16::{ResetResponse, ResetStatus};
    use crate::ocpp::{CallError, CallResult, OcppMessage};
    use crate::registry::{ConnectionHandle, Outgoing};
    use serde_json::json;
    use tokio::sync::mpsc;
    use tokio_test::{assert_pending, assert_ready};
    use tokio_util::sync::CancellationToken;

    fn station(id: &str) -> StationId {
        StationId::new(id).unwrap()
    }

    fn connect(registry: &ConnectionRegistry, id: &str) -> mpsc::Receiver<Outgoing> {
        let (handle, rx) = ConnectionHandle::new(1, station(id), None, CancellationToken::new(), 8);
        registry.bind(handle);
        rx
    }

    fn sent_call(rx: &mut mpsc::Receiver<Outgoing>) -> Call {
        match rx.try_recv().unwrap() {
            Outgoing::Text(text) => match OcppMessage::parse(&text).unwrap() {
                OcppMessage::Call(call) => call,
                other => panic!("Expected Call, got {:?}", other),
            },
            other => panic!("Expected text frame, got {:?}", other),
        }
    }

    fn reset_call() -> Call {
        Call::new("Reset", json!({"type": "Soft"})).unwrap()
    }

    #[tokio::test]
    async fn test_unknown_client_is_not_tracked() {
        let registry = ConnectionRegistry::new();
        let tracker = RequestTracker::new();

        let pending = tracker
            .send(&registry, &station("CP1"), reset_call(), Duration::from_secs(1))
            .await;

        assert_eq!(pending.error, Some(RequestError::UnknownClient("CP1".into())));
        assert!(tracker.is_empty());
    }

    #[tokio::test]
    async fn test_reply_resolves_suspended_call() {
        let registry = ConnectionRegistry::new();
        let tracker = RequestTracker::new();
        let mut rx = connect(&registry, "CP1");
        let cp1 = station("CP1");

        let mut task = tokio_test::task::spawn(tracker.send(
            &registry,
            &cp1,
            reset_call(),
            Duration::from_secs(30),
        ));
        assert_pending!(task.poll());

        let call = sent_call(&mut rx);
        assert!(tracker.contains(&call.message_id));

        let reply = Reply::Result(CallResult::new(&call.message_id, json!({"status": "Accepted"})));
        assert_eq!(
            tracker.resolve(&cp1, reply),
            Resolution::Resolved {
                action: "Reset".into()
            }
        );

        assert!(task.is_woken());
        let pending = assert_ready!(task.poll());
        assert_eq!(pending.response, Some(json!({"status": "Accepted"})));
        assert!(pending.error.is_none());
        drop(task);
        assert!(tracker.is_empty());
    }

    #[tokio::test]
    async fn test_timeout_removes_entry_and_drops_late_reply() {
        let registry = ConnectionRegistry::new();
        let tracker = RequestTracker::new();
        let mut rx = connect(&registry, "CP1");
        let cp1 = station("CP1");

        let started = tokio::time::Instant::now();
        let pending = tracker
            .send(&registry, &cp1, reset_call(), Duration::from_millis(100))
            .await;

        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(pending.error, Some(RequestError::Timeout(Duration::from_millis(100))));
        assert_eq!(pending.error.as_ref().map(RequestError::code), Some(ErrorCode::Timeout));
        assert!(!tracker.contains(&pending.message_id));

        let call = sent_call(&mut rx);
        let late = Reply::Result(CallResult::new(call.message_id, json!({"status": "Accepted"})));
        assert_eq!(tracker.resolve(&cp1, late), Resolution::Unknown);
    }

    #[tokio::test]
    async fn test_unrelated_or_foreign_replies_do_not_resolve() {
        let registry = ConnectionRegistry::new();
        let tracker = RequestTracker::new();
        let mut rx = connect(&registry, "CP1");
        let cp1 = station("CP1");

        let mut task = tokio_test::task::spawn(tracker.send(
            &registry,
            &cp1,
            reset_call(),
            Duration::from_secs(30),
        ));
        assert_pending!(task.poll());
        let call = sent_call(&mut rx);

        let stale = Reply::Result(CallResult::new("some-other-id", json!({})));
        assert_eq!(tracker.resolve(&cp1, stale), Resolution::Unknown);

        let foreign = Reply::Result(CallResult::new(&call.message_id, json!({})));
        assert_eq!(tracker.resolve(&station("CP2"), foreign), Resolution::WrongStation);

        assert!(!task.is_woken());
        assert_pending!(task.poll());

        let error = Reply::Error(CallError::new(&call.message_id, ErrorCode::NotSupported, "nope"));
        assert!(matches!(tracker.resolve(&cp1, error.clone()), Resolution::Resolved { .. }));
        assert_eq!(tracker.resolve(&cp1, error), Resolution::Duplicate);

        let pending = assert_ready!(task.poll());
        assert_eq!(pending.error.map(|e| e.code()), Some(ErrorCode::NotSupported));
    }

    #[tokio::test]
    async fn test_closed_connection_fails_transmission() {
        let registry = ConnectionRegistry::new();
        let tracker = RequestTracker::new();
        let rx = connect(&registry, "CP1");
        drop(rx);

        let pending = tracker
            .send(&registry, &station("CP1"), reset_call(), Duration::from_secs(1))
            .await;

        assert!(matches!(pending.error, Some(RequestError::TransmissionFailed(_))));
        assert!(tracker.is_empty());
    }

    #[tokio::test]
    async fn test_full_outgoing_queue_fails_transmission() {
        let registry = ConnectionRegistry::new();
        let tracker = RequestTracker::new();
        let (handle, _rx) = ConnectionHandle::new(1, station("CP1"), None, CancellationToken::new(), 1);
        handle.send_text("[]".into()).unwrap();
        registry.bind(handle);

        let pending = tracker
            .send(&registry, &station("CP1"), reset_call(), Duration::from_secs(30))
            .await;

        assert!(matches!(pending.error, Some(RequestError::TransmissionFailed(_))));
        assert!(tracker.is_empty());
    }

    #[tokio::test]
    async fn test_connection_lost_after_transmit_fails_without_waiting() {
        let registry = ConnectionRegistry::new();
        let tracker = RequestTracker::new();
        let mut rx = connect(&registry, "CP1");
        let cp1 = station("CP1");

        let mut task = tokio_test::task::spawn(tracker.send(
            &registry,
            &cp1,
            reset_call(),
            Duration::from_secs(30),
        ));
        assert_pending!(task.poll());
        let call = sent_call(&mut rx);

        // The socket writer cancels the connection when a write fails.
        registry.lookup("CP1").unwrap().cancel_token().cancel();

        assert!(task.is_woken());
        let pending = assert_ready!(task.poll());
        assert!(matches!(pending.error, Some(RequestError::TransmissionFailed(_))));
        assert!(tracker.is_empty());

        let late = Reply::Result(CallResult::new(call.message_id, json!({"status": "Accepted"})));
        assert_eq!(tracker.resolve(&cp1, late), Resolution::Unknown);
    }

    #[tokio::test]
    async fn test_dropped_caller_releases_entry() {
        let registry = ConnectionRegistry::new();
        let tracker = RequestTracker::new();
        let _rx = connect(&registry, "CP1");
        let cp1 = station("CP1");

        let mut task = tokio_test::task::spawn(tracker.send(
            &registry,
            &cp1,
            reset_call(),
            Duration::from_secs(30),
        ));
        assert_pending!(task.poll());
        assert_eq!(tracker.len(), 1);

        drop(task);
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_outcome_falls_back_to_failed_response() {
        let call = reset_call();
        let mut pending = PendingRequest::new(&station("CP1"), &call, Duration::from_secs(1));
        pending.response = Some(json!({"status": "Maybe"}));

        let outcome = CallOutcome::<ResetResponse>::from_pending(pending.clone());
        assert_eq!(outcome.response.status, ResetStatus::Rejected);
        assert!(matches!(outcome.error, Some(RequestError::InvalidResponse(_))));

        pending.response = Some(json!({"status": "Accepted"}));
        let outcome = CallOutcome::<ResetResponse>::from_pending(pending);
        assert!(outcome.is_ok());
        assert_eq!(outcome.into_result().unwrap().status, ResetStatus::Accepted);
    }

    #[tokio::test]
    async fn test_observers_see_call_and_reply() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let registry = ConnectionRegistry::new();
        let tracker = RequestTracker::new();
        let mut rx = connect(&registry, "CP1");
        let cp1 = station("CP1");

        let sent = Arc::new(AtomicUsize::new(0));
        let replies = Arc::new(AtomicUsize::new(0));
        let counter = sent.clone();
        tracker.observers().on_call_sent(move |station, call| {
            assert_eq!(station.as_str(), "CP1");
            assert_eq!(call.action, "Reset");
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let counter = replies.clone();
        tracker.observers().on_reply_received(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let mut task = tokio_test::task::spawn(tracker.send(
            &registry,
            &cp1,
            reset_call(),
            Duration::from_secs(30),
        ));
        assert_pending!(task.poll());
        assert_eq!(sent.load(Ordering::SeqCst), 1);

        let call = sent_call(&mut rx);
        tracker.resolve(&cp1, Reply::Result(CallResult::new("stale", json!({}))));
        assert_eq!(replies.load(Ordering::SeqCst), 0);

        tracker.resolve(&cp1, Reply::Result(CallResult::new(call.message_id, json!({"status": "Accepted"}))));
        assert_eq!(replies.load(Ordering::SeqCst), 1);
        assert_ready!(task.poll());
    }
}
