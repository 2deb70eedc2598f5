//! Binding between OCPP payload types and their action names

use std::fmt::Debug;

use serde::de::DeserializeOwned;
use serde::Serialize;

/// A response payload
pub trait OcppResponse: Serialize + DeserializeOwned + Debug + Clone + Send + Sync + 'static {
    /// Response sent or reported when no real one is available: no
    /// subscriber answered an inbound call, or a server-initiated call failed.
    fn failed() -> Self;
}

/// A request payload, tied to the action name it travels under
pub trait OcppRequest: Serialize + DeserializeOwned + Debug + Clone + Send + Sync + 'static {
    const ACTION: &'static str;

    type Response: OcppResponse;
}

/// Implement [`OcppRequest`] for a request/response pair
macro_rules! ocpp_action {
    ($($action:literal: $request:ty => $response:ty;)*) => {
        $(
            impl $crate::ocpp::action::OcppRequest for $request {
                const ACTION: &'static str = $action;
                type Response = $response;
            }
        )*
    };
}

/// Implement [`OcppResponse`] for responses that only carry a status
macro_rules! failed_status {
    ($($response:ty => $status:expr;)*) => {
        $(
            impl $crate::ocpp::action::OcppResponse for $response {
                fn failed() -> Self {
                    Self { status: $status }
                }
            }
        )*
    };
}

/// Implement [`OcppResponse`] for empty responses
macro_rules! failed_empty {
    ($($response:ty),* $(,)?) => {
        $(
            impl $crate::ocpp::action::OcppResponse for $response {
                fn failed() -> Self {
                    Self {}
                }
            }
        )*
    };
}

pub(crate) use failed_empty;
pub(crate) use failed_status;
pub(crate) use ocpp_action;
