//! OCPP protocol layer
//!
//! - `messages`: RPC framing (CALL, CALLRESULT, CALLERROR)
//! - `action`: binding between payload types and action names
//! - `v16`: OCPP 1.6 JSON payloads

pub mod messages;
pub mod action;
pub mod v16;

use std::fmt;

pub use messages::*;
pub use action::{OcppRequest, OcppResponse};

use crate::codec::CodecTable;

/// Protocol version negotiated through the WebSocket subprotocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OcppVersion {
    #[default]
    V16,
}

impl OcppVersion {
    /// Token expected in `Sec-WebSocket-Protocol`
    pub fn subprotocol(&self) -> &'static str {
        match self {
            OcppVersion::V16 => "ocpp1.6",
        }
    }

    /// Codecs for the actions a station may call under this version
    pub fn codec_table(&self) -> CodecTable {
        match self {
            OcppVersion::V16 => v16::codec_table(),
        }
    }
}

impl fmt::Display for OcppVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.subprotocol())
    }
}
