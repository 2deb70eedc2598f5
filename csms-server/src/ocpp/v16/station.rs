//! OCPP 1.6 messages initiated by the charge point

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::types::*;
use crate::ocpp::action::{failed_empty, ocpp_action, OcppResponse};

// ============================================================================
// Request Messages
// ============================================================================

/// Authorize request (CP -> CS)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizeRequest {
    pub id_tag: String,
}

/// BootNotification request (CP -> CS)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootNotificationRequest {
    pub charge_point_vendor: String,
    pub charge_point_model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub charge_point_serial_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub charge_box_serial_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub firmware_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iccid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub imsi: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meter_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meter_serial_number: Option<String>,
}

/// DataTransfer request, sent by either side
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataTransferRequest {
    pub vendor_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

/// DiagnosticsStatusNotification request (CP -> CS)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticsStatusNotificationRequest {
    pub status: DiagnosticsStatus,
}

/// FirmwareStatusNotification request (CP -> CS)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FirmwareStatusNotificationRequest {
    pub status: FirmwareStatus,
}

/// Heartbeat request (CP -> CS)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatRequest {}

/// MeterValues request (CP -> CS)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeterValuesRequest {
    pub connector_id: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<i32>,
    pub meter_value: Vec<MeterValue>,
}

/// StartTransaction request (CP -> CS)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartTransactionRequest {
    pub connector_id: i32,
    pub id_tag: String,
    pub meter_start: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reservation_id: Option<i32>,
    pub timestamp: DateTime<Utc>,
}

/// StatusNotification request (CP -> CS)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusNotificationRequest {
    pub connector_id: i32,
    pub error_code: ChargePointErrorCode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub info: Option<String>,
    pub status: ChargePointStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vendor_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vendor_error_code: Option<String>,
}

/// StopTransaction request (CP -> CS)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopTransactionRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_tag: Option<String>,
    pub meter_stop: i32,
    pub timestamp: DateTime<Utc>,
    pub transaction_id: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<Reason>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transaction_data: Vec<MeterValue>,
}

// ============================================================================
// Response Messages
// ============================================================================

/// Authorize response (CS -> CP)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizeResponse {
    pub id_tag_info: IdTagInfo,
}

/// BootNotification response (CS -> CP)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootNotificationResponse {
    pub status: RegistrationStatus,
    pub current_time: DateTime<Utc>,
    /// Heartbeat interval in seconds, or the retry delay when not accepted
    pub interval: i32,
}

/// DataTransfer response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataTransferResponse {
    pub status: DataTransferStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticsStatusNotificationResponse {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FirmwareStatusNotificationResponse {}

/// Heartbeat response (CS -> CP)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatResponse {
    pub current_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeterValuesResponse {}

/// StartTransaction response (CS -> CP)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartTransactionResponse {
    pub id_tag_info: IdTagInfo,
    pub transaction_id: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusNotificationResponse {}

/// StopTransaction response (CS -> CP)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopTransactionResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_tag_info: Option<IdTagInfo>,
}

/// Retry delay announced in a generated BootNotification rejection
pub const REJECTED_BOOT_RETRY_SECS: i32 = 60;

impl BootNotificationResponse {
    pub fn accepted(interval: i32) -> Self {
        Self {
            status: RegistrationStatus::Accepted,
            current_time: Utc::now(),
            interval,
        }
    }
}

impl OcppResponse for AuthorizeResponse {
    fn failed() -> Self {
        Self {
            id_tag_info: IdTagInfo::new(AuthorizationStatus::Invalid),
        }
    }
}

impl OcppResponse for BootNotificationResponse {
    fn failed() -> Self {
        Self {
            status: RegistrationStatus::Rejected,
            current_time: Utc::now(),
            interval: REJECTED_BOOT_RETRY_SECS,
        }
    }
}

impl OcppResponse for DataTransferResponse {
    fn failed() -> Self {
        Self {
            status: DataTransferStatus::Rejected,
            data: None,
        }
    }
}

impl OcppResponse for HeartbeatResponse {
    fn failed() -> Self {
        Self {
            current_time: Utc::now(),
        }
    }
}

impl OcppResponse for StartTransactionResponse {
    fn failed() -> Self {
        Self {
            id_tag_info: IdTagInfo::new(AuthorizationStatus::Invalid),
            transaction_id: 0,
        }
    }
}

impl OcppResponse for StopTransactionResponse {
    fn failed() -> Self {
        Self {
            id_tag_info: Some(IdTagInfo::new(AuthorizationStatus::Invalid)),
        }
    }
}

failed_empty!(
    DiagnosticsStatusNotificationResponse,
    FirmwareStatusNotificationResponse,
    MeterValuesResponse,
    StatusNotificationResponse,
);

ocpp_action! {
    "Authorize": AuthorizeRequest => AuthorizeResponse;
    "BootNotification": BootNotificationRequest => BootNotificationResponse;
    "DataTransfer": DataTransferRequest => DataTransferResponse;
    "DiagnosticsStatusNotification": DiagnosticsStatusNotificationRequest => DiagnosticsStatusNotificationResponse;
    "FirmwareStatusNotification": FirmwareStatusNotificationRequest => FirmwareStatusNotificationResponse;
    "Heartbeat": HeartbeatRequest => HeartbeatResponse;
    "MeterValues": MeterValuesRequest => MeterValuesResponse;
    "StartTransaction": StartTransactionRequest => StartTransactionResponse;
    "StatusNotification": StatusNotificationRequest => StatusNotificationResponse;
    "StopTransaction": StopTransactionRequest => StopTransactionResponse;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ocpp::action::OcppRequest;

    #[test]
    fn test_boot_notification_request() {
        let req: BootNotificationRequest = serde_json::from_str(
            r#"{"chargePointVendor": "Acme", "chargePointModel": "X1", "firmwareVersion": "1.2"}"#,
        )
        .unwrap();

        assert_eq!(req.charge_point_vendor, "Acme");
        assert_eq!(req.firmware_version.as_deref(), Some("1.2"));
        assert_eq!(BootNotificationRequest::ACTION, "BootNotification");
    }

    #[test]
    fn test_failed_boot_notification_is_rejected() {
        let value = serde_json::to_value(BootNotificationResponse::failed()).unwrap();

        assert_eq!(value["status"], "Rejected");
        assert_eq!(value["interval"], REJECTED_BOOT_RETRY_SECS);
        assert!(value["currentTime"].is_string());
    }

    #[test]
    fn test_empty_responses_serialize_as_objects() {
        let value = serde_json::to_value(StatusNotificationResponse::failed()).unwrap();
        assert_eq!(value, serde_json::json!({}));
    }

    #[test]
    fn test_status_notification_requires_error_code() {
        let missing = serde_json::from_str::<StatusNotificationRequest>(
            r#"{"connectorId": 1, "status": "Available"}"#,
        );
        assert!(missing.is_err());

        let ok: StatusNotificationRequest = serde_json::from_str(
            r#"{"connectorId": 1, "errorCode": "NoError", "status": "SuspendedEVSE"}"#,
        )
        .unwrap();
        assert_eq!(ok.status, ChargePointStatus::SuspendedEVSE);
    }
}
