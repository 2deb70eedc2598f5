//! Action codec table
//!
//! Maps an action name to the code that parses its payload, runs its
//! subscribers and serializes the response. One generic [`ActionCodec`]
//! per request type replaces a per-action branch in the dispatcher.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde_json::Value;

use crate::events::{Handlers, RequestContext};
use crate::ocpp::OcppRequest;

/// Pending response of a parsed call, serialized to its payload
pub type Invocation = BoxFuture<'static, Result<Value, serde_json::Error>>;

type Invoke =
    Box<dyn Fn(RequestContext, Value) -> Result<Invocation, serde_json::Error> + Send + Sync>;

/// Type-erased pipeline for one action
pub struct ActionCodec {
    action: &'static str,
    invoke: Invoke,
    handlers: Arc<dyn Any + Send + Sync>,
}

impl ActionCodec {
    pub fn new<R: OcppRequest>() -> Self {
        let handlers = Arc::new(Handlers::<R>::new());
        let subscribers = handlers.clone();

        let invoke = move |ctx: RequestContext,
                           payload: Value|
              -> Result<Invocation, serde_json::Error> {
            let request: R = serde_json::from_value(payload)?;
            let subscribers = subscribers.clone();
            Ok(async move {
                let response = subscribers.dispatch(ctx, request).await;
                serde_json::to_value(response)
            }
            .boxed())
        };

        Self {
            action: R::ACTION,
            invoke: Box::new(invoke),
            handlers,
        }
    }

    pub fn action(&self) -> &'static str {
        self.action
    }

    /// Parse a payload into the typed request and start its subscriber chain.
    ///
    /// Fails with the parser's error when the payload does not match the
    /// request type.
    pub fn invoke(&self, ctx: RequestContext, payload: Value) -> Result<Invocation, serde_json::Error> {
        (self.invoke)(ctx, payload)
    }
}

impl fmt::Debug for ActionCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionCodec")
            .field("action", &self.action)
            .finish_non_exhaustive()
    }
}

/// Codecs keyed by action name
#[derive(Debug, Default)]
pub struct CodecTable {
    codecs: HashMap<&'static str, ActionCodec>,
}

impl CodecTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the codec for `R`. Registering an action twice keeps the first codec.
    pub fn register<R: OcppRequest>(&mut self) -> &mut Self {
        self.codecs
            .entry(R::ACTION)
            .or_insert_with(ActionCodec::new::<R>);
        self
    }

    pub fn get(&self, action: &str) -> Option<&ActionCodec> {
        self.codecs.get(action)
    }

    pub fn contains(&self, action: &str) -> bool {
        self.codecs.contains_key(action)
    }

    /// Subscriber lists of `R`, if `R` is the type registered under its action
    pub fn handlers<R: OcppRequest>(&self) -> Option<Arc<Handlers<R>>> {
        self.codecs
            .get(R::ACTION)?
            .handlers
            .clone()
            .downcast::<Handlers<R>>()
            .ok()
    }

    pub fn actions(&self) -> Vec<&'static str> {
        let mut actions: Vec<_> = self.codecs.keys().copied().collect();
        actions.sort_unstable();
        actions
    }

    pub fn len(&self) -> usize {
        self.codecs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codecs.is_empty()
    }
}
