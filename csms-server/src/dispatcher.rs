//! Inbound dispatcher
//!
//! Turns text frames received from a station into either an answered call
//! or a resolved outbound request. Nothing here fails the connection: every
//! problem ends as a CALLERROR frame or a log line.

use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::codec::CodecTable;
use crate::events::RequestContext;
use crate::ocpp::{Call, CallError, CallResult, ErrorCode, OcppMessage, Reply};
use crate::registry::StationId;
use crate::server::CentralSystem;
use crate::tracker::{RequestTracker, Resolution};

/// Description sent when a call arrives on a connection without an identity
pub const MISSING_IDENTITY: &str = "charge box identity must not be null or empty";

/// Text of the ProtocolError answering an action without a codec
pub fn unknown_action(action: &str) -> String {
    format!("The OCPP message '{}' is unknown!", action)
}

/// Connection a frame arrived on
#[derive(Clone)]
pub struct Origin {
    pub station_id: Option<StationId>,
    pub central: CentralSystem,
    pub cancel: CancellationToken,
}

/// A decoded inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Call to answer, in arrival order
    Call(Call),
    /// Answer to one of our calls
    Reply(Reply),
    /// Malformed call, answered with this error
    Invalid(CallError),
    /// Malformed reply, dropped
    Ignored,
}

impl Inbound {
    pub fn decode(text: &str) -> Self {
        match OcppMessage::parse(text) {
            Ok(OcppMessage::Call(call)) => Inbound::Call(call),
            Ok(OcppMessage::CallResult(result)) => Inbound::Reply(Reply::Result(result)),
            Ok(OcppMessage::CallError(error)) => Inbound::Reply(Reply::Error(error)),
            Err(e) if e.is_reply() => {
                warn!("Dropping malformed reply: {}", e);
                Inbound::Ignored
            }
            Err(e) => {
                warn!("Rejecting malformed frame: {}", e);
                Inbound::Invalid(e.to_call_error())
            }
        }
    }
}

pub struct Dispatcher {
    codecs: CodecTable,
    tracker: Arc<RequestTracker>,
}

impl Dispatcher {
    pub fn new(codecs: CodecTable, tracker: Arc<RequestTracker>) -> Self {
        Self { codecs, tracker }
    }

    pub fn codecs(&self) -> &CodecTable {
        &self.codecs
    }

    /// Handle one frame end to end, returning the frame to send back, if any
    pub async fn dispatch(&self, origin: &Origin, text: &str) -> Option<String> {
        match Inbound::decode(text) {
            Inbound::Call(call) => Some(self.handle_call(origin, call).await),
            Inbound::Reply(reply) => {
                match &origin.station_id {
                    Some(station_id) => self.handle_reply(station_id, reply),
                    None => warn!("Dropping reply {} from unidentified connection", reply.message_id()),
                }
                None
            }
            Inbound::Invalid(error) => Some(error.to_text()),
            Inbound::Ignored => None,
        }
    }

    /// Answer a station's call with a CALLRESULT or CALLERROR frame
    pub async fn handle_call(&self, origin: &Origin, call: Call) -> String {
        let Call {
            message_id,
            action,
            payload,
        } = call;

        let Some(station_id) = origin.station_id.clone() else {
            warn!("{} {} arrived without a station identity", action, message_id);
            return CallError::new(message_id, ErrorCode::ProtocolError, MISSING_IDENTITY).to_text();
        };

        let Some(codec) = self.codecs.get(&action) else {
            warn!("Unknown action {} from {}", action, station_id);
            return CallError::new(message_id, ErrorCode::ProtocolError, unknown_action(&action))
                .to_text();
        };

        let ctx = RequestContext {
            station_id: station_id.clone(),
            message_id: message_id.clone(),
            received_at: Utc::now(),
            central: origin.central.clone(),
            cancel: origin.cancel.child_token(),
        };

        let invocation = match codec.invoke(ctx, payload) {
            Ok(invocation) => invocation,
            Err(e) => {
                warn!("Invalid {} payload from {}: {}", action, station_id, e);
                return CallError::new(message_id, ErrorCode::FormationViolation, e.to_string())
                    .to_text();
            }
        };

        match invocation.await {
            Ok(response) => CallResult::new(message_id, response).to_text(),
            Err(e) => {
                warn!("Could not serialize {} response for {}: {}", action, station_id, e);
                CallError::new(message_id, ErrorCode::FormationViolation, e.to_string()).to_text()
            }
        }
    }

    /// Hand a station's reply to the outbound tracker
    pub fn handle_reply(&self, station_id: &StationId, reply: Reply) {
        let message_id = reply.message_id().to_string();

        match self.tracker.resolve(station_id, reply) {
            Resolution::Resolved { action } => {
                debug!("{} {} answered by {}", action, message_id, station_id);
            }
            Resolution::Unknown => {
                warn!("Dropping late or unknown reply {} from {}", message_id, station_id);
            }
            Resolution::WrongStation => {
                warn!(
                    "Dropping reply {} from {}: call was sent to another station",
                    message_id, station_id
                );
            }
            Resolution::Duplicate => {
                debug!("Dropping duplicate reply {} from {}", message_id, station_id);
            }
        }
    }
}
