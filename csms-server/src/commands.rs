//! Typed server-initiated OCPP 1.6 operations
//!
//! One method per action the central system can send. Each goes through
//! [`CentralSystem::call`] and shares its contract: it never fails, and a
//! call without a usable answer returns the action's failed response with
//! the reason in [`CallOutcome::error`].

use crate::ocpp::v16::*;
use crate::ocpp::OcppRequest;
use crate::server::CentralSystem;
use crate::tracker::CallOutcome;

macro_rules! commands {
    ($($(#[$doc:meta])* $method:ident: $request:ty;)*) => {
        impl CentralSystem {
            $(
                $(#[$doc])*
                pub async fn $method(
                    &self,
                    station_id: &str,
                    request: $request,
                ) -> CallOutcome<<$request as OcppRequest>::Response> {
                    self.call(station_id, request).await
                }
            )*
        }
    };
}

commands! {
    cancel_reservation: CancelReservationRequest;
    change_availability: ChangeAvailabilityRequest;
    change_configuration: ChangeConfigurationRequest;
    /// Clear the station's authorization cache
    clear_cache: ClearCacheRequest;
    clear_charging_profile: ClearChargingProfileRequest;
    /// Vendor-specific exchange initiated by the central system
    data_transfer: DataTransferRequest;
    get_composite_schedule: GetCompositeScheduleRequest;
    get_configuration: GetConfigurationRequest;
    /// Ask the station to upload diagnostics to `location`
    get_diagnostics: GetDiagnosticsRequest;
    get_local_list_version: GetLocalListVersionRequest;
    remote_start_transaction: RemoteStartTransactionRequest;
    remote_stop_transaction: RemoteStopTransactionRequest;
    reserve_now: ReserveNowRequest;
    reset: ResetRequest;
    send_local_list: SendLocalListRequest;
    set_charging_profile: SetChargingProfileRequest;
    trigger_message: TriggerMessageRequest;
    unlock_connector: UnlockConnectorRequest;
    update_firmware: UpdateFirmwareRequest;
}
