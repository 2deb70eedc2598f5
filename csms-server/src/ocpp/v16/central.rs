//! OCPP 1.6 messages initiated by the central system

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::types::*;
use crate::ocpp::action::{failed_empty, failed_status, ocpp_action, OcppResponse};

// ============================================================================
// Request Messages
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelReservationRequest {
    pub reservation_id: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeAvailabilityRequest {
    /// 0 addresses the whole charge point
    pub connector_id: i32,
    #[serde(rename = "type")]
    pub kind: AvailabilityType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeConfigurationRequest {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClearCacheRequest {}

/// ClearChargingProfile request; every criterion is optional and they combine
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClearChargingProfileRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connector_id: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub charging_profile_purpose: Option<ChargingProfilePurposeType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack_level: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetCompositeScheduleRequest {
    pub connector_id: i32,
    /// Seconds
    pub duration: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub charging_rate_unit: Option<ChargingRateUnitType>,
}

/// GetConfiguration request; no keys asks for the full configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GetConfigurationRequest {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub key: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetDiagnosticsRequest {
    pub location: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retries: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_interval: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetLocalListVersionRequest {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteStartTransactionRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connector_id: Option<i32>,
    pub id_tag: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub charging_profile: Option<ChargingProfile>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteStopTransactionRequest {
    pub transaction_id: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReserveNowRequest {
    pub connector_id: i32,
    pub expiry_date: DateTime<Utc>,
    pub id_tag: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id_tag: Option<String>,
    pub reservation_id: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResetRequest {
    #[serde(rename = "type")]
    pub kind: ResetType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendLocalListRequest {
    pub list_version: i32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub local_authorization_list: Vec<AuthorizationData>,
    pub update_type: UpdateType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetChargingProfileRequest {
    pub connector_id: i32,
    pub cs_charging_profiles: ChargingProfile,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerMessageRequest {
    pub requested_message: MessageTrigger,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connector_id: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnlockConnectorRequest {
    pub connector_id: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateFirmwareRequest {
    pub location: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retries: Option<i32>,
    pub retrieve_date: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_interval: Option<i32>,
}

// ============================================================================
// Response Messages
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelReservationResponse {
    pub status: CancelReservationStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeAvailabilityResponse {
    pub status: AvailabilityStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeConfigurationResponse {
    pub status: ConfigurationStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClearCacheResponse {
    pub status: ClearCacheStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClearChargingProfileResponse {
    pub status: ClearChargingProfileStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetCompositeScheduleResponse {
    pub status: GetCompositeScheduleStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connector_id: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule_start: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub charging_schedule: Option<ChargingSchedule>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetConfigurationResponse {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub configuration_key: Vec<KeyValue>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unknown_key: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetDiagnosticsResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetLocalListVersionResponse {
    /// 0 means no local list, -1 means local lists are not supported
    pub list_version: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteStartTransactionResponse {
    pub status: RemoteStartStopStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteStopTransactionResponse {
    pub status: RemoteStartStopStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReserveNowResponse {
    pub status: ReservationStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResetResponse {
    pub status: ResetStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendLocalListResponse {
    pub status: UpdateStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetChargingProfileResponse {
    pub status: ChargingProfileStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerMessageResponse {
    pub status: TriggerMessageStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnlockConnectorResponse {
    pub status: UnlockStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateFirmwareResponse {}

impl OcppResponse for GetCompositeScheduleResponse {
    fn failed() -> Self {
        Self {
            status: GetCompositeScheduleStatus::Rejected,
            connector_id: None,
            schedule_start: None,
            charging_schedule: None,
        }
    }
}

impl OcppResponse for GetConfigurationResponse {
    fn failed() -> Self {
        Self {
            configuration_key: Vec::new(),
            unknown_key: Vec::new(),
        }
    }
}

impl OcppResponse for GetDiagnosticsResponse {
    fn failed() -> Self {
        Self { file_name: None }
    }
}

impl OcppResponse for GetLocalListVersionResponse {
    fn failed() -> Self {
        Self { list_version: -1 }
    }
}

failed_status! {
    CancelReservationResponse => CancelReservationStatus::Rejected;
    ChangeAvailabilityResponse => AvailabilityStatus::Rejected;
    ChangeConfigurationResponse => ConfigurationStatus::Rejected;
    ClearCacheResponse => ClearCacheStatus::Rejected;
    ClearChargingProfileResponse => ClearChargingProfileStatus::Unknown;
    RemoteStartTransactionResponse => RemoteStartStopStatus::Rejected;
    RemoteStopTransactionResponse => RemoteStartStopStatus::Rejected;
    ReserveNowResponse => ReservationStatus::Rejected;
    ResetResponse => ResetStatus::Rejected;
    SendLocalListResponse => UpdateStatus::Failed;
    SetChargingProfileResponse => ChargingProfileStatus::Rejected;
    TriggerMessageResponse => TriggerMessageStatus::Rejected;
    UnlockConnectorResponse => UnlockStatus::UnlockFailed;
}

failed_empty!(UpdateFirmwareResponse);

ocpp_action! {
    "CancelReservation": CancelReservationRequest => CancelReservationResponse;
    "ChangeAvailability": ChangeAvailabilityRequest => ChangeAvailabilityResponse;
    "ChangeConfiguration": ChangeConfigurationRequest => ChangeConfigurationResponse;
    "ClearCache": ClearCacheRequest => ClearCacheResponse;
    "ClearChargingProfile": ClearChargingProfileRequest => ClearChargingProfileResponse;
    "GetCompositeSchedule": GetCompositeScheduleRequest => GetCompositeScheduleResponse;
    "GetConfiguration": GetConfigurationRequest => GetConfigurationResponse;
    "GetDiagnostics": GetDiagnosticsRequest => GetDiagnosticsResponse;
    "GetLocalListVersion": GetLocalListVersionRequest => GetLocalListVersionResponse;
    "RemoteStartTransaction": RemoteStartTransactionRequest => RemoteStartTransactionResponse;
    "RemoteStopTransaction": RemoteStopTransactionRequest => RemoteStopTransactionResponse;
    "ReserveNow": ReserveNowRequest => ReserveNowResponse;
    "Reset": ResetRequest => ResetResponse;
    "SendLocalList": SendLocalListRequest => SendLocalListResponse;
    "SetChargingProfile": SetChargingProfileRequest => SetChargingProfileResponse;
    "TriggerMessage": TriggerMessageRequest => TriggerMessageResponse;
    "UnlockConnector": UnlockConnectorRequest => UnlockConnectorResponse;
    "UpdateFirmware": UpdateFirmwareRequest => UpdateFirmwareResponse;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reset_request_uses_type_key() {
        let json = serde_json::to_string(&ResetRequest { kind: ResetType::Hard }).unwrap();
        assert_eq!(json, r#"{"type":"Hard"}"#);
    }

    #[test]
    fn test_failed_responses() {
        assert_eq!(ResetResponse::failed().status, ResetStatus::Rejected);
        assert_eq!(UnlockConnectorResponse::failed().status, UnlockStatus::UnlockFailed);
        assert_eq!(GetLocalListVersionResponse::failed().list_version, -1);
    }

    #[test]
    fn test_get_configuration_response_parsing() {
        let resp: GetConfigurationResponse = serde_json::from_str(
            r#"{"configurationKey": [{"key": "HeartbeatInterval", "readonly": false, "value": "300"}]}"#,
        )
        .unwrap();

        assert_eq!(resp.configuration_key.len(), 1);
        assert!(resp.unknown_key.is_empty());
    }
}
