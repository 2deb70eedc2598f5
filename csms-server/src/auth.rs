//! HTTP Basic authentication of connecting stations

use std::collections::HashMap;

use base64::Engine as _;
use parking_lot::RwLock;
use thiserror::Error;

/// Realm announced in `WWW-Authenticate` on a rejected upgrade
pub const REALM: &str = "OCPP";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("missing Authorization header")]
    MissingHeader,

    #[error("unsupported authorization scheme")]
    UnsupportedScheme,

    #[error("malformed basic credentials")]
    Malformed,

    #[error("user {user} does not match station {station}")]
    UserMismatch { user: String, station: String },

    #[error("no credential registered for station {0}")]
    UnknownStation(String),

    #[error("wrong password for station {0}")]
    WrongPassword(String),
}

/// Station id to password lookup
#[derive(Debug, Default)]
pub struct Credentials {
    passwords: RwLock<HashMap<String, String>>,
}

impl Credentials {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the password of a station, replacing any previous one
    pub fn add(&self, station_id: impl Into<String>, password: impl Into<String>) {
        self.passwords.write().insert(station_id.into(), password.into());
    }

    pub fn remove(&self, station_id: &str) -> bool {
        self.passwords.write().remove(station_id).is_some()
    }

    pub fn contains(&self, station_id: &str) -> bool {
        self.passwords.read().contains_key(station_id)
    }

    pub fn len(&self) -> usize {
        self.passwords.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.passwords.read().is_empty()
    }

    /// Check an `Authorization` header value for a station.
    ///
    /// The user name must be the station id itself.
    pub fn verify(&self, station_id: &str, authorization: Option<&str>) -> Result<(), AuthError> {
        let (user, password) = parse_basic(authorization.ok_or(AuthError::MissingHeader)?)?;

        if user != station_id {
            return Err(AuthError::UserMismatch {
                user,
                station: station_id.to_string(),
            });
        }

        match self.passwords.read().get(station_id) {
            None => Err(AuthError::UnknownStation(station_id.to_string())),
            Some(expected) if *expected == password => Ok(()),
            Some(_) => Err(AuthError::WrongPassword(station_id.to_string())),
        }
    }
}

/// Split `Basic <base64(user:password)>` into user and password
fn parse_basic(header: &str) -> Result<(String, String), AuthError> {
    let (scheme, encoded) = header
        .trim()
        .split_once(' ')
        .ok_or(AuthError::UnsupportedScheme)?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return Err(AuthError::UnsupportedScheme);
    }

    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|_| AuthError::Malformed)?;
    let decoded = String::from_utf8(decoded).map_err(|_| AuthError::Malformed)?;

    let (user, password) = decoded.split_once(':').ok_or(AuthError::Malformed)?;
    Ok((user.to_string(), password.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn basic(user_and_password: &str) -> String {
        format!(
            "Basic {}",
            base64::engine::general_purpose::STANDARD.encode(user_and_password)
        )
    }

    #[test]
    fn test_verify_accepts_matching_credentials() {
        let credentials = Credentials::new();
        credentials.add("CP1", "s3cret:with:colons");

        assert_eq!(
            credentials.verify("CP1", Some(&basic("CP1:s3cret:with:colons"))),
            Ok(())
        );
    }

    #[test]
    fn test_verify_rejects() {
        let credentials = Credentials::new();
        credentials.add("CP1", "s3cret");

        assert_eq!(credentials.verify("CP1", None), Err(AuthError::MissingHeader));
        assert_eq!(
            credentials.verify("CP1", Some("Bearer abc")),
            Err(AuthError::UnsupportedScheme)
        );
        assert_eq!(
            credentials.verify("CP1", Some("Basic %%%")),
            Err(AuthError::Malformed)
        );
        assert_eq!(
            credentials.verify("CP1", Some(&basic("CP2:s3cret"))),
            Err(AuthError::UserMismatch {
                user: "CP2".into(),
                station: "CP1".into()
            })
        );
        assert_eq!(
            credentials.verify("CP1", Some(&basic("CP1:guess"))),
            Err(AuthError::WrongPassword("CP1".into()))
        );
        assert_eq!(
            credentials.verify("CP9", Some(&basic("CP9:s3cret"))),
            Err(AuthError::UnknownStation("CP9".into()))
        );
    }

    #[test]
    fn test_remove_revokes_access() {
        let credentials = Credentials::new();
        credentials.add("CP1", "pw");
        assert!(credentials.remove("CP1"));
        assert!(!credentials.remove("CP1"));
        assert!(credentials.is_empty());
        assert!(credentials.verify("CP1", Some(&basic("CP1:pw"))).is_err());
    }

    #[test]
    fn test_scheme_is_case_insensitive() {
        let credentials = Credentials::new();
        credentials.add("CP1", "pw");
        let header = basic("CP1:pw").replacen("Basic", "basic", 1);
        assert!(credentials.verify("CP1", Some(&header)).is_ok());
    }
}
