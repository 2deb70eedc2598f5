//! Subscriber fan-out
//!
//! Every inbound action owns a [`Handlers`] with three ordered lists:
//! observers told a request arrived, responders that may produce the
//! response, and observers told which response went out.

use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::future::{join_all, BoxFuture};
use futures_util::FutureExt;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::ocpp::{Call, OcppRequest, OcppResponse, Reply};
use crate::registry::StationId;
use crate::server::CentralSystem;

/// Error a subscriber may return instead of a response
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// What a responder returns: a response, no opinion, or a failure
pub type HandlerResult<T> = Result<Option<T>, HandlerError>;

/// Everything a subscriber knows about the call it is handling
#[derive(Clone)]
pub struct RequestContext {
    pub station_id: StationId,
    pub message_id: String,
    pub received_at: DateTime<Utc>,
    /// Server the call arrived on, for issuing calls back to the station
    pub central: CentralSystem,
    /// Cancelled when the station's connection closes
    pub cancel: CancellationToken,
}

type RequestObserver<R> = Arc<dyn Fn(&RequestContext, &R) + Send + Sync>;
type Responder<R> = Arc<
    dyn Fn(RequestContext, R) -> BoxFuture<'static, HandlerResult<<R as OcppRequest>::Response>>
        + Send
        + Sync,
>;
type ResponseObserver<R> =
    Arc<dyn Fn(&RequestContext, &R, &<R as OcppRequest>::Response) + Send + Sync>;

/// Pick the answer of the earliest registered responder that gave one.
///
/// `answers` is in registration order. Answers of later responders are
/// discarded even when they completed first.
pub fn first_registered<T>(answers: impl IntoIterator<Item = Option<T>>) -> Option<T> {
    answers.into_iter().flatten().next()
}

/// Subscribers for one action
pub struct Handlers<R: OcppRequest> {
    request_received: RwLock<Vec<RequestObserver<R>>>,
    responders: RwLock<Vec<Responder<R>>>,
    response_sent: RwLock<Vec<ResponseObserver<R>>>,
}

impl<R: OcppRequest> Default for Handlers<R> {
    fn default() -> Self {
        Self {
            request_received: RwLock::new(Vec::new()),
            responders: RwLock::new(Vec::new()),
            response_sent: RwLock::new(Vec::new()),
        }
    }
}

impl<R: OcppRequest> Handlers<R> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_request_received<F>(&self, observer: F)
    where
        F: Fn(&RequestContext, &R) + Send + Sync + 'static,
    {
        self.request_received.write().push(Arc::new(observer));
    }

    pub fn respond_with<F, Fut>(&self, responder: F)
    where
        F: Fn(RequestContext, R) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult<R::Response>> + Send + 'static,
    {
        self.responders
            .write()
            .push(Arc::new(move |ctx: RequestContext, request: R| {
                responder(ctx, request).boxed()
            }));
    }

    pub fn on_response_sent<F>(&self, observer: F)
    where
        F: Fn(&RequestContext, &R, &R::Response) + Send + Sync + 'static,
    {
        self.response_sent.write().push(Arc::new(observer));
    }

    pub fn responder_count(&self) -> usize {
        self.responders.read().len()
    }

    /// Run the full subscriber chain for one request and return the response to send
    pub async fn dispatch(&self, ctx: RequestContext, request: R) -> R::Response {
        self.notify_request_received(&ctx, &request);
        let response = self.respond(&ctx, &request).await;
        self.notify_response_sent(&ctx, &request, &response);
        response
    }

    fn notify_request_received(&self, ctx: &RequestContext, request: &R) {
        let observers = self.request_received.read().clone();
        for (index, observer) in observers.iter().enumerate() {
            if catch_unwind(AssertUnwindSafe(|| observer(ctx, request))).is_err() {
                error!(
                    "{} request observer #{} panicked for {}",
                    R::ACTION, index, ctx.station_id
                );
            }
        }
    }

    fn notify_response_sent(&self, ctx: &RequestContext, request: &R, response: &R::Response) {
        let observers = self.response_sent.read().clone();
        for (index, observer) in observers.iter().enumerate() {
            if catch_unwind(AssertUnwindSafe(|| observer(ctx, request, response))).is_err() {
                error!(
                    "{} response observer #{} panicked for {}",
                    R::ACTION, index, ctx.station_id
                );
            }
        }
    }

    /// Run every responder concurrently, then apply [`first_registered`].
    async fn respond(&self, ctx: &RequestContext, request: &R) -> R::Response {
        let responders = self.responders.read().clone();
        if responders.is_empty() {
            debug!("No responder for {}, sending failed response", R::ACTION);
            return R::Response::failed();
        }

        // One task per responder, so a panic only loses that responder's answer.
        let mut tasks: Vec<_> = responders
            .into_iter()
            .map(|responder| {
                let ctx = ctx.clone();
                let request = request.clone();
                tokio::spawn(async move { responder(ctx, request).await })
            })
            .collect();

        let joined = tokio::select! {
            joined = join_all(tasks.iter_mut()) => Some(joined),
            _ = ctx.cancel.cancelled() => None,
        };
        let Some(joined) = joined else {
            for task in &tasks {
                task.abort();
            }
            debug!(
                "Connection of {} closed, aborted {} responders of {}",
                ctx.station_id,
                tasks.len(),
                R::ACTION
            );
            return R::Response::failed();
        };

        let answers: Vec<_> = joined
            .into_iter()
            .enumerate()
            .map(|(index, joined)| match joined {
                Ok(Ok(answer)) => answer,
                Ok(Err(e)) => {
                    warn!(
                        "{} responder #{} failed for {}: {}",
                        R::ACTION, index, ctx.station_id, e
                    );
                    None
                }
                Err(e) => {
                    error!(
                        "{} responder #{} aborted for {}: {}",
                        R::ACTION, index, ctx.station_id, e
                    );
                    None
                }
            })
            .collect();

        first_registered(answers).unwrap_or_else(|| {
            debug!("No responder answered {}, sending failed response", R::ACTION);
            R::Response::failed()
        })
    }
}

type CallSentObserver = Arc<dyn Fn(&StationId, &Call) + Send + Sync>;
type ReplyObserver = Arc<dyn Fn(&StationId, &Reply) + Send + Sync>;

/// Observers of server-initiated calls
#[derive(Default)]
pub struct OutboundObservers {
    call_sent: RwLock<Vec<CallSentObserver>>,
    reply_received: RwLock<Vec<ReplyObserver>>,
}

impl OutboundObservers {
    pub fn on_call_sent<F>(&self, observer: F)
    where
        F: Fn(&StationId, &Call) + Send + Sync + 'static,
    {
        self.call_sent.write().push(Arc::new(observer));
    }

    pub fn on_reply_received<F>(&self, observer: F)
    where
        F: Fn(&StationId, &Reply) + Send + Sync + 'static,
    {
        self.reply_received.write().push(Arc::new(observer));
    }

    pub(crate) fn call_sent(&self, station_id: &StationId, call: &Call) {
        let observers = self.call_sent.read().clone();
        for observer in &observers {
            if catch_unwind(AssertUnwindSafe(|| observer(station_id, call))).is_err() {
                error!("Call observer panicked on {} to {}", call.action, station_id);
            }
        }
    }

    pub(crate) fn reply_received(&self, station_id: &StationId, reply: &Reply) {
        let observers = self.reply_received.read().clone();
        for observer in &observers {
            if catch_unwind(AssertUnwindSafe(|| observer(station_id, reply))).is_err() {
                error!(
                    "Reply observer panicked on {} from {}",
                    reply.message_id(),
                    station_id
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::ocpp::v16::{
        AuthorizationStatus, AuthorizeRequest, AuthorizeResponse, IdTagInfo,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn context() -> RequestContext {
        RequestContext {
            station_id: StationId::new("CP1").unwrap(),
            message_id: "42".into(),
            received_at: Utc::now(),
            central: CentralSystem::new(ServerConfig::default()),
            cancel: CancellationToken::new(),
        }
    }

    fn authorize() -> AuthorizeRequest {
        AuthorizeRequest {
            id_tag: "TAG".into(),
        }
    }

    fn answer(status: AuthorizationStatus) -> AuthorizeResponse {
        AuthorizeResponse {
            id_tag_info: IdTagInfo::new(status),
        }
    }

    #[test]
    fn test_first_registered_ignores_gaps() {
        assert_eq!(first_registered(vec![None, Some(2), Some(3)]), Some(2));
        assert_eq!(first_registered(Vec::<Option<u8>>::new()), None);
        assert_eq!(first_registered(vec![None::<u8>, None]), None);
    }

    #[tokio::test]
    async fn test_first_registered_responder_wins() {
        let handlers = Handlers::<AuthorizeRequest>::new();

        // The first responder is the slowest, it still wins.
        handlers.respond_with(|_, _| async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(Some(answer(AuthorizationStatus::Accepted)))
        });
        handlers.respond_with(|_, _| async { Ok(Some(answer(AuthorizationStatus::Blocked))) });
        handlers.respond_with(|_, _| async { Ok(Some(answer(AuthorizationStatus::Expired))) });

        let response = handlers.dispatch(context(), authorize()).await;
        assert_eq!(response.id_tag_info.status, AuthorizationStatus::Accepted);
    }

    #[tokio::test]
    async fn test_no_responders_yields_failed_response() {
        let handlers = Handlers::<AuthorizeRequest>::new();
        let response = handlers.dispatch(context(), authorize()).await;
        assert_eq!(response, AuthorizeResponse::failed());
    }

    #[tokio::test]
    async fn test_failing_responders_are_isolated() {
        let handlers = Handlers::<AuthorizeRequest>::new();

        handlers.respond_with(|_, _| async {
            if true {
                panic!("responder bug");
            }
            Ok(None)
        });
        handlers.respond_with(|_, _| async { Err::<Option<AuthorizeResponse>, _>("db down".into()) });
        handlers.respond_with(|_, _| async { Ok(None) });
        handlers.respond_with(|_, _| async { Ok(Some(answer(AuthorizationStatus::Accepted))) });

        let response = handlers.dispatch(context(), authorize()).await;
        assert_eq!(response.id_tag_info.status, AuthorizationStatus::Accepted);
    }

    #[tokio::test]
    async fn test_closed_connection_aborts_stuck_responders() {
        let handlers = Handlers::<AuthorizeRequest>::new();
        let (started_tx, started_rx) = tokio::sync::oneshot::channel::<()>();
        let (held_tx, held_rx) = tokio::sync::oneshot::channel::<()>();
        let slots = Arc::new(parking_lot::Mutex::new(Some((started_tx, held_tx))));

        handlers.respond_with(move |_, _| {
            let slot = slots.lock().take();
            async move {
                if let Some((started, _held)) = slot {
                    let _ = started.send(());
                    std::future::pending::<()>().await;
                }
                Ok(Some(answer(AuthorizationStatus::Accepted)))
            }
        });

        let ctx = context();
        let cancel = ctx.cancel.clone();
        let dispatched = tokio::spawn({
            let handlers = Arc::new(handlers);
            async move { handlers.dispatch(ctx, authorize()).await }
        });

        started_rx.await.unwrap();
        cancel.cancel();

        let response = tokio::time::timeout(Duration::from_secs(1), dispatched)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response, AuthorizeResponse::failed());

        // Aborting the task drops everything the responder held.
        let released = tokio::time::timeout(Duration::from_secs(1), held_rx).await.unwrap();
        assert!(released.is_err());
    }

    #[tokio::test]
    async fn test_observers_see_request_and_response() {
        let handlers = Handlers::<AuthorizeRequest>::new();
        let received = Arc::new(AtomicUsize::new(0));
        let sent = Arc::new(AtomicUsize::new(0));

        handlers.on_request_received(|_, _| panic!("observer bug"));
        let counter = received.clone();
        handlers.on_request_received(move |ctx, request| {
            assert_eq!(ctx.message_id, "42");
            assert_eq!(request.id_tag, "TAG");
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let counter = sent.clone();
        handlers.on_response_sent(move |_, _, response| {
            assert_eq!(response.id_tag_info.status, AuthorizationStatus::Invalid);
            counter.fetch_add(1, Ordering::SeqCst);
        });

        handlers.dispatch(context(), authorize()).await;

        assert_eq!(received.load(Ordering::SeqCst), 1);
        assert_eq!(sent.load(Ordering::SeqCst), 1);
    }
}
