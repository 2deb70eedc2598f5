//! OCPP 1.6 (JSON) message set
//!
//! - `types`: enumerations and complex types shared between messages
//! - `station`: messages initiated by the charge point, answered here
//! - `central`: messages this server sends to the charge point

pub mod types;
pub mod station;
pub mod central;

pub use types::*;
pub use station::*;
pub use central::*;

use crate::codec::CodecTable;

/// Codec table answering every charge-point-initiated OCPP 1.6 action
pub fn codec_table() -> CodecTable {
    let mut table = CodecTable::new();
    table
        .register::<AuthorizeRequest>()
        .register::<BootNotificationRequest>()
        .register::<DataTransferRequest>()
        .register::<DiagnosticsStatusNotificationRequest>()
        .register::<FirmwareStatusNotificationRequest>()
        .register::<HeartbeatRequest>()
        .register::<MeterValuesRequest>()
        .register::<StartTransactionRequest>()
        .register::<StatusNotificationRequest>()
        .register::<StopTransactionRequest>();
    table
}
