//! User identity and credentials.

use std::fmt;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

use crate::error::AuthError;

/// Stable numeric user id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub i64);

impl UserId {
    #[inline]
    pub fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<i64> for UserId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// A registered user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    /// Normalised, see [`normalize_username`].
    pub username: String,
    pub email: String,
    /// PHC string produced by the password hasher.
    pub password_hash: String,
}

impl User {
    pub fn new(
        id: impl Into<UserId>,
        username: &str,
        email: impl Into<String>,
        password_hash: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            username: normalize_username(username),
            email: email.into(),
            password_hash: password_hash.into(),
        }
    }
}

/// Trim and lowercase a username. Every cache and bus key uses this form.
#[inline]
pub fn normalize_username(username: &str) -> String {
    username.trim().to_lowercase()
}

/// Basic username/password pair.
///
/// The cleartext password lives only for the duration of one authorization.
#[derive(Clone, PartialEq, Eq)]
pub struct BasicCredentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for BasicCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BasicCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl BasicCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Decode a `Proxy-Authorization` value of the form `Basic <b64(user:pass)>`.
    ///
    /// The scheme is matched case-insensitively and the password may contain `:`.
    pub fn from_header_value(value: &str) -> Result<Self, AuthError> {
        let value = value.trim();
        let (scheme, encoded) = value
            .split_once(' ')
            .ok_or_else(|| AuthError::Malformed("missing auth scheme".into()))?;
        if !scheme.eq_ignore_ascii_case("basic") {
            return Err(AuthError::Malformed(format!("unsupported scheme {scheme}")));
        }

        let decoded = STANDARD
            .decode(encoded.trim())
            .map_err(|e| AuthError::Malformed(format!("bad base64: {e}")))?;
        let decoded = String::from_utf8(decoded)
            .map_err(|_| AuthError::Malformed("credentials are not utf-8".into()))?;
        let (username, password) = decoded
            .split_once(':')
            .ok_or_else(|| AuthError::Malformed("missing ':' separator".into()))?;

        Ok(Self::new(normalize_username(username), password))
    }

    /// Encode back to a `Proxy-Authorization` value.
    pub fn to_header_value(&self) -> String {
        let raw = format!("{}:{}", self.username, self.password);
        format!("Basic {}", STANDARD.encode(raw))
    }
}

/// Credentials presented by a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    Basic(BasicCredentials),
}

impl Credentials {
    pub fn username(&self) -> &str {
        match self {
            Self::Basic(basic) => &basic.username,
        }
    }
}

/// Identity attached to a connection after a successful authorization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizedUser {
    pub user_id: UserId,
    pub username: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_basic_header() {
        let creds = BasicCredentials::from_header_value("Basic dXNlcjpwYXNz").unwrap();
        assert_eq!(creds, BasicCredentials::new("user", "pass"));
    }

    #[test]
    fn scheme_is_case_insensitive_and_username_normalised() {
        let value = format!("basic {}", STANDARD.encode(" Alice :s3cret"));
        let creds = BasicCredentials::from_header_value(&value).unwrap();
        assert_eq!(creds.username, "alice");
        assert_eq!(creds.password, "s3cret");
    }

    #[test]
    fn password_may_contain_colon() {
        let value = format!("Basic {}", STANDARD.encode("bob:a:b:c"));
        let creds = BasicCredentials::from_header_value(&value).unwrap();
        assert_eq!(creds.password, "a:b:c");
    }

    #[test]
    fn rejects_malformed_values() {
        for value in [
            "dXNlcjpwYXNz",
            "Bearer dXNlcjpwYXNz",
            "Basic !!!",
            &format!("Basic {}", STANDARD.encode("nocolon")),
        ] {
            assert!(
                matches!(
                    BasicCredentials::from_header_value(value),
                    Err(AuthError::Malformed(_))
                ),
                "{value}"
            );
        }
    }

    #[test]
    fn header_roundtrip() {
        let creds = BasicCredentials::new("foo", "bar");
        assert_eq!(creds.to_header_value(), "Basic Zm9vOmJhcg==");
    }

    #[test]
    fn debug_redacts_password() {
        let rendered = format!("{:?}", BasicCredentials::new("u", "hunter2"));
        assert!(!rendered.contains("hunter2"));
    }
}
