//! OCPP-J RPC framing
//!
//! OCPP over WebSocket carries one JSON array per text frame:
//! - CALL: [2, messageId, action, payload]
//! - CALLRESULT: [3, messageId, payload]
//! - CALLERROR: [4, messageId, errorCode, errorDescription, errorDetails]
//!
//! Decoding is strict about arity and element types. Every decode failure is
//! reported as a [`FrameError`] that already carries the correlation id the
//! error reply has to use.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;
use uuid::Uuid;

/// Correlation id used when nothing can be recovered from a frame
pub const UNKNOWN_MESSAGE_ID: &str = "unknown";

/// Correlation id used when a CALL carries a non-string id
pub const UNPARSEABLE_CALL_ID: &str = "0";

/// OCPP message type identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Call = 2,
    CallResult = 3,
    CallError = 4,
}

impl MessageType {
    pub fn from_tag(tag: i64) -> Option<Self> {
        match tag {
            2 => Some(MessageType::Call),
            3 => Some(MessageType::CallResult),
            4 => Some(MessageType::CallError),
            _ => None,
        }
    }

    /// CALLRESULT and CALLERROR answer an earlier CALL
    pub fn is_reply(self) -> bool {
        matches!(self, MessageType::CallResult | MessageType::CallError)
    }
}

/// OCPP error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    NotImplemented,
    NotSupported,
    InternalError,
    ProtocolError,
    SecurityError,
    FormationViolation,
    PropertyConstraintViolation,
    OccurenceConstraintViolation,
    TypeConstraintViolation,
    GenericError,
    Timeout,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::NotImplemented => "NotImplemented",
            ErrorCode::NotSupported => "NotSupported",
            ErrorCode::InternalError => "InternalError",
            ErrorCode::ProtocolError => "ProtocolError",
            ErrorCode::SecurityError => "SecurityError",
            ErrorCode::FormationViolation => "FormationViolation",
            ErrorCode::PropertyConstraintViolation => "PropertyConstraintViolation",
            ErrorCode::OccurenceConstraintViolation => "OccurenceConstraintViolation",
            ErrorCode::TypeConstraintViolation => "TypeConstraintViolation",
            ErrorCode::GenericError => "GenericError",
            ErrorCode::Timeout => "Timeout",
        }
    }

    /// Parse an error code as sent by a station.
    ///
    /// Accepts the OCPP 2.0.1 spellings of the two codes that were renamed.
    pub fn from_wire(code: &str) -> Option<Self> {
        let code = match code {
            "NotImplemented" => ErrorCode::NotImplemented,
            "NotSupported" => ErrorCode::NotSupported,
            "InternalError" => ErrorCode::InternalError,
            "ProtocolError" => ErrorCode::ProtocolError,
            "SecurityError" => ErrorCode::SecurityError,
            "FormationViolation" | "FormatViolation" => ErrorCode::FormationViolation,
            "PropertyConstraintViolation" => ErrorCode::PropertyConstraintViolation,
            "OccurenceConstraintViolation" | "OccurrenceConstraintViolation" => {
                ErrorCode::OccurenceConstraintViolation
            }
            "TypeConstraintViolation" => ErrorCode::TypeConstraintViolation,
            "GenericError" => ErrorCode::GenericError,
            "Timeout" => ErrorCode::Timeout,
            _ => return None,
        };
        Some(code)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A frame that could not be decoded into an [`OcppMessage`]
#[derive(Debug, Clone, Error)]
#[error("{code} ({message_id}): {description}")]
pub struct FrameError {
    /// Message type tag, when the frame got far enough to carry one
    pub message_type: Option<MessageType>,
    /// Correlation id for the error reply, fallbacks already applied
    pub message_id: String,
    pub code: ErrorCode,
    pub description: String,
}

impl FrameError {
    fn new(
        message_type: Option<MessageType>,
        message_id: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            message_type,
            message_id: message_id.into(),
            code: ErrorCode::ProtocolError,
            description: description.into(),
        }
    }

    /// Replies are never answered, so a broken one is only worth a log line
    pub fn is_reply(&self) -> bool {
        self.message_type.is_some_and(MessageType::is_reply)
    }

    /// The CALLERROR answering the offending frame
    pub fn to_call_error(&self) -> CallError {
        CallError::new(self.message_id.clone(), self.code, self.description.clone())
    }
}

/// OCPP CALL message (request)
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub message_id: String,
    pub action: String,
    pub payload: Value,
}

impl Call {
    /// Create a new CALL message with auto-generated ID
    pub fn new(action: impl Into<String>, payload: impl Serialize) -> Result<Self, serde_json::Error> {
        Ok(Self {
            message_id: Uuid::new_v4().to_string(),
            action: action.into(),
            payload: serde_json::to_value(payload)?,
        })
    }

    /// Serialize to OCPP wire format: [2, messageId, action, payload]
    pub fn to_text(&self) -> String {
        json!([
            MessageType::Call as i32,
            &self.message_id,
            &self.action,
            &self.payload
        ])
        .to_string()
    }
}

/// OCPP CALLRESULT message (success response)
#[derive(Debug, Clone, PartialEq)]
pub struct CallResult {
    pub message_id: String,
    pub payload: Value,
}

impl CallResult {
    pub fn new(message_id: impl Into<String>, payload: Value) -> Self {
        Self {
            message_id: message_id.into(),
            payload,
        }
    }

    /// Serialize to OCPP wire format: [3, messageId, payload]
    pub fn to_text(&self) -> String {
        json!([MessageType::CallResult as i32, &self.message_id, &self.payload]).to_string()
    }

    /// Parse the payload as a specific response type
    pub fn parse_payload<T: for<'de> Deserialize<'de>>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.payload)
    }
}

/// OCPP CALLERROR message (error response)
#[derive(Debug, Clone, PartialEq)]
pub struct CallError {
    pub message_id: String,
    pub error_code: ErrorCode,
    pub error_description: String,
    pub error_details: Value,
}

impl CallError {
    pub fn new(
        message_id: impl Into<String>,
        error_code: ErrorCode,
        error_description: impl Into<String>,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            error_code,
            error_description: error_description.into(),
            error_details: Value::Object(Map::new()),
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.error_details = details;
        self
    }

    /// Serialize to OCPP wire format: [4, messageId, errorCode, errorDescription, errorDetails]
    pub fn to_text(&self) -> String {
        json!([
            MessageType::CallError as i32,
            &self.message_id,
            self.error_code.as_str(),
            &self.error_description,
            &self.error_details
        ])
        .to_string()
    }
}

/// A station's answer to a server-initiated CALL
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Result(CallResult),
    Error(CallError),
}

impl Reply {
    pub fn message_id(&self) -> &str {
        match self {
            Reply::Result(r) => &r.message_id,
            Reply::Error(e) => &e.message_id,
        }
    }
}

/// Parsed OCPP message (any type)
#[derive(Debug, Clone, PartialEq)]
pub enum OcppMessage {
    Call(Call),
    CallResult(CallResult),
    CallError(CallError),
}

impl OcppMessage {
    /// Parse an OCPP message from a text frame
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        let value: Value = serde_json::from_str(text).map_err(|e| {
            let message_id = extract_message_id(text);
            FrameError::new(
                None,
                message_id.as_deref().unwrap_or(UNKNOWN_MESSAGE_ID),
                format!("Invalid JSON: {}", e),
            )
        })?;

        let Value::Array(array) = value else {
            return Err(FrameError::new(
                None,
                UNKNOWN_MESSAGE_ID,
                "An OCPP message must be a JSON array",
            ));
        };

        let hint = array
            .get(1)
            .and_then(Value::as_str)
            .unwrap_or(UNKNOWN_MESSAGE_ID)
            .to_string();

        let Some(tag) = array.first().and_then(Value::as_i64) else {
            return Err(FrameError::new(
                None,
                hint,
                "The OCPP message type must be an integer",
            ));
        };

        match MessageType::from_tag(tag) {
            Some(MessageType::Call) => Self::parse_call(array),
            Some(MessageType::CallResult) => Self::parse_call_result(array),
            Some(MessageType::CallError) => Self::parse_call_error(array),
            None => Err(FrameError::new(
                None,
                hint,
                format!("Unknown OCPP message type {}", tag),
            )),
        }
    }

    fn parse_call(array: Vec<Value>) -> Result<Self, FrameError> {
        let kind = Some(MessageType::Call);

        let message_id = array
            .get(1)
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or_else(|| {
                FrameError::new(
                    kind,
                    UNPARSEABLE_CALL_ID,
                    "The OCPP message identification must be a string",
                )
            })?;

        let [_, _, action, payload]: [Value; 4] = array.try_into().map_err(|array: Vec<Value>| {
            FrameError::new(
                kind,
                message_id.as_str(),
                format!("An OCPP call must have 4 elements, not {}", array.len()),
            )
        })?;

        let action = match action {
            Value::String(action) if !action.trim().is_empty() => action.trim().to_owned(),
            _ => {
                return Err(FrameError::new(
                    kind,
                    message_id,
                    "The OCPP action must not be null or empty!",
                ))
            }
        };

        if !payload.is_object() {
            return Err(FrameError::new(
                kind,
                message_id,
                "The OCPP call payload must be a JSON object",
            ));
        }

        Ok(OcppMessage::Call(Call {
            message_id,
            action,
            payload,
        }))
    }

    fn parse_call_result(array: Vec<Value>) -> Result<Self, FrameError> {
        let kind = Some(MessageType::CallResult);

        let [_, message_id, payload]: [Value; 3] = array.try_into().map_err(|array: Vec<Value>| {
            FrameError::new(
                kind,
                UNKNOWN_MESSAGE_ID,
                format!("An OCPP call result must have 3 elements, not {}", array.len()),
            )
        })?;

        let Value::String(message_id) = message_id else {
            return Err(FrameError::new(
                kind,
                UNKNOWN_MESSAGE_ID,
                "The OCPP message identification must be a string",
            ));
        };

        if !payload.is_object() {
            return Err(FrameError::new(
                kind,
                message_id,
                "The OCPP call result payload must be a JSON object",
            ));
        }

        Ok(OcppMessage::CallResult(CallResult {
            message_id,
            payload,
        }))
    }

    fn parse_call_error(array: Vec<Value>) -> Result<Self, FrameError> {
        let kind = Some(MessageType::CallError);

        let [_, message_id, code, description, details]: [Value; 5] =
            array.try_into().map_err(|array: Vec<Value>| {
                FrameError::new(
                    kind,
                    UNKNOWN_MESSAGE_ID,
                    format!("An OCPP call error must have 5 elements, not {}", array.len()),
                )
            })?;

        let Value::String(message_id) = message_id else {
            return Err(FrameError::new(
                kind,
                UNKNOWN_MESSAGE_ID,
                "The OCPP message identification must be a string",
            ));
        };

        let (Value::String(code), Value::String(error_description)) = (code, description) else {
            return Err(FrameError::new(
                kind,
                message_id,
                "The OCPP error code and description must be strings",
            ));
        };

        if !details.is_object() {
            return Err(FrameError::new(
                kind,
                message_id,
                "The OCPP error details must be a JSON object",
            ));
        }

        Ok(OcppMessage::CallError(CallError {
            message_id,
            error_code: ErrorCode::from_wire(&code).unwrap_or(ErrorCode::GenericError),
            error_description,
            error_details: details,
        }))
    }

    /// Get the message ID
    pub fn message_id(&self) -> &str {
        match self {
            OcppMessage::Call(c) => &c.message_id,
            OcppMessage::CallResult(r) => &r.message_id,
            OcppMessage::CallError(e) => &e.message_id,
        }
    }

    pub fn to_text(&self) -> String {
        match self {
            OcppMessage::Call(c) => c.to_text(),
            OcppMessage::CallResult(r) => r.to_text(),
            OcppMessage::CallError(e) => e.to_text(),
        }
    }
}

/// Best-effort recovery of the correlation id from a frame that is not valid JSON
fn extract_message_id(text: &str) -> Option<String> {
    let rest = text.trim_start().strip_prefix('[')?;
    let (_, rest) = rest.split_once(',')?;
    let rest = rest.trim_start().strip_prefix('"')?;
    let (id, _) = rest.split_once('"')?;
    (!id.is_empty()).then(|| id.to_owned())
}
