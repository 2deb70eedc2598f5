//! WebSocket upgrade validation
//!
//! Runs inside the tungstenite accept callback, before the upgrade is
//! answered: resolves the station identity from the URI, checks the OCPP
//! subprotocol and, when enabled, the station's Basic credentials.

use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::{
    HeaderValue, AUTHORIZATION, SEC_WEBSOCKET_PROTOCOL, WWW_AUTHENTICATE,
};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tracing::warn;

use crate::auth::{Credentials, REALM};
use crate::registry::StationId;

/// Validate an upgrade request and prepare the response accepting it.
///
/// `credentials` is `None` when Basic authentication is disabled.
pub fn negotiate(
    request: &Request,
    mut response: Response,
    subprotocol: &'static str,
    credentials: Option<&Credentials>,
) -> Result<(StationId, Response), ErrorResponse> {
    let Some(station_id) = station_from_path(request.uri().path()) else {
        warn!("Rejecting upgrade of {}: no station identity", request.uri());
        return Err(reject(StatusCode::BAD_REQUEST, "missing charge point identity"));
    };

    if !offers_subprotocol(request, subprotocol) {
        warn!("Rejecting {}: subprotocol {} not offered", station_id, subprotocol);
        return Err(reject(
            StatusCode::BAD_REQUEST,
            &format!("subprotocol {} required", subprotocol),
        ));
    }

    if let Some(credentials) = credentials {
        let authorization = request
            .headers()
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok());

        if let Err(e) = credentials.verify(station_id.as_str(), authorization) {
            warn!("Rejecting {}: {}", station_id, e);
            let mut rejected = reject(StatusCode::UNAUTHORIZED, "unauthorized");
            if let Ok(challenge) = HeaderValue::from_str(&format!("Basic realm=\"{}\"", REALM)) {
                rejected.headers_mut().insert(WWW_AUTHENTICATE, challenge);
            }
            return Err(rejected);
        }
    }

    response
        .headers_mut()
        .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(subprotocol));
    Ok((station_id, response))
}

fn reject(status: StatusCode, reason: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_string()));
    *response.status_mut() = status;
    response
}

/// Last non-empty segment of the path, percent-decoded
pub fn station_from_path(path: &str) -> Option<StationId> {
    let segment = path.rsplit('/').find(|s| !s.is_empty())?;
    StationId::new(percent_decode(segment))
}

fn offers_subprotocol(request: &Request, subprotocol: &str) -> bool {
    request
        .headers()
        .get_all(SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|token| token.trim() == subprotocol)
}

fn percent_decode(segment: &str) -> String {
    let bytes = segment.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'%' {
            let escaped = bytes
                .get(i + 1..i + 3)
                .filter(|hex| hex.iter().all(u8::is_ascii_hexdigit))
                .and_then(|hex| std::str::from_utf8(hex).ok())
                .and_then(|hex| u8::from_str_radix(hex, 16).ok());
            if let Some(byte) = escaped {
                decoded.push(byte);
                i += 3;
                continue;
            }
        }
        decoded.push(bytes[i]);
        i += 1;
    }

    String::from_utf8_lossy(&decoded).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine as _;

    const OCPP16: &str = "ocpp1.6";

    fn request(path: &str, protocols: Option<&str>, authorization: Option<&str>) -> Request {
        let mut builder = Request::builder().uri(format!("ws://localhost:8180{}", path));
        if let Some(protocols) = protocols {
            builder = builder.header(SEC_WEBSOCKET_PROTOCOL, protocols);
        }
        if let Some(authorization) = authorization {
            builder = builder.header(AUTHORIZATION, authorization);
        }
        builder.body(()).unwrap()
    }

    fn basic(user_and_password: &str) -> String {
        format!(
            "Basic {}",
            base64::engine::general_purpose::STANDARD.encode(user_and_password)
        )
    }

    #[test]
    fn test_station_from_path() {
        assert_eq!(station_from_path("/ocpp/CP1").unwrap().as_str(), "CP1");
        assert_eq!(station_from_path("/ocpp/CP1/").unwrap().as_str(), "CP1");
        assert_eq!(station_from_path("/steve/CP%20Nord").unwrap().as_str(), "CP Nord");
        assert_eq!(station_from_path("/ocpp/100%").unwrap().as_str(), "100%");
        assert!(station_from_path("/").is_none());
        assert!(station_from_path("/ocpp/%20/").is_none());
    }

    #[test]
    fn test_accepts_and_echoes_subprotocol() {
        let req = request("/ocpp/CP1", Some("ocpp2.0.1, ocpp1.6"), None);
        let (station, response) = negotiate(&req, Response::new(()), OCPP16, None).unwrap();

        assert_eq!(station.as_str(), "CP1");
        assert_eq!(response.headers().get(SEC_WEBSOCKET_PROTOCOL).unwrap(), "ocpp1.6");
    }

    #[test]
    fn test_rejects_missing_or_wrong_subprotocol() {
        let missing = request("/ocpp/CP1", None, None);
        let err = negotiate(&missing, Response::new(()), OCPP16, None).unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);

        let wrong = request("/ocpp/CP1", Some("ocpp2.0.1"), None);
        let err = negotiate(&wrong, Response::new(()), OCPP16, None).unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_rejects_missing_identity() {
        let req = request("/", Some(OCPP16), None);
        let err = negotiate(&req, Response::new(()), OCPP16, None).unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_basic_auth() {
        let credentials = Credentials::new();
        credentials.add("CP1", "pw");

        let good = request("/ocpp/CP1", Some(OCPP16), Some(&basic("CP1:pw")));
        assert!(negotiate(&good, Response::new(()), OCPP16, Some(&credentials)).is_ok());

        let bad = request("/ocpp/CP1", Some(OCPP16), Some(&basic("CP1:nope")));
        let err = negotiate(&bad, Response::new(()), OCPP16, Some(&credentials)).unwrap_err();
        assert_eq!(err.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            err.headers().get(WWW_AUTHENTICATE).unwrap(),
            "Basic realm=\"OCPP\""
        );

        let anonymous = request("/ocpp/CP1", Some(OCPP16), None);
        let err = negotiate(&anonymous, Response::new(()), OCPP16, Some(&credentials)).unwrap_err();
        assert_eq!(err.status(), StatusCode::UNAUTHORIZED);
    }
}
