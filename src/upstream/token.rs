//! Tokens returned by upstream OAuth providers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Refresh this many seconds before the provider-reported expiry
const EXPIRY_BUFFER_SECS: i64 = 60;

/// An OAuth token obtained from an upstream provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthToken {
    /// Access token
    pub access_token: String,
    /// Expiry, when the provider reported one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<DateTime<Utc>>,
    /// Refresh token, when the provider issued one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Token type (usually "Bearer")
    #[serde(default = "default_token_type")]
    pub token_type: String,
    /// Granted scope
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl OAuthToken {
    /// Check if the token is expired (with 60 second buffer)
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiry
            .is_some_and(|expiry| now + chrono::Duration::seconds(EXPIRY_BUFFER_SECS) >= expiry)
    }
}

/// Token endpoint success body
#[derive(Debug, Deserialize)]
pub(crate) struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default, deserialize_with = "lenient_seconds")]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
}

impl TokenResponse {
    pub(crate) fn into_token(self, now: DateTime<Utc>) -> OAuthToken {
        let expiry = self
            .expires_in
            .filter(|secs| *secs > 0)
            .and_then(|secs| i64::try_from(secs).ok())
            .and_then(chrono::Duration::try_seconds)
            .and_then(|lifetime| now.checked_add_signed(lifetime));

        OAuthToken {
            access_token: self.access_token,
            expiry,
            refresh_token: self.refresh_token.filter(|t| !t.is_empty()),
            token_type: self
                .token_type
                .filter(|t| !t.is_empty())
                .unwrap_or_else(default_token_type),
            scope: self.scope.filter(|s| !s.is_empty()),
        }
    }
}

/// Token endpoint error body (RFC 6749 §5.2)
#[derive(Debug, Deserialize)]
pub(crate) struct TokenErrorResponse {
    pub error: String,
    #[serde(default)]
    pub error_description: Option<String>,
}

impl TokenErrorResponse {
    pub(crate) fn describe(&self) -> String {
        match &self.error_description {
            Some(description) => format!("{}: {description}", self.error),
            None => self.error.clone(),
        }
    }
}

/// Some providers answer `200 OK` with an error body, so both shapes are
/// accepted on any status.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(crate) enum TokenEndpointReply {
    Token(TokenResponse),
    Error(TokenErrorResponse),
}

/// Accept `expires_in` as a number or a numeric string.
fn lenient_seconds<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    match value {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::Number(n)) => Ok(n.as_u64()),
        Some(serde_json::Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(serde_json::Value::String(s)) => s
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(serde::de::Error::custom),
        Some(other) => Err(serde::de::Error::custom(format!(
            "expires_in must be a number, got {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expires_in_accepts_numbers_and_strings() {
        let now = Utc::now();
        for body in [
            r#"{"access_token":"a","expires_in":3600}"#,
            r#"{"access_token":"a","expires_in":"3600"}"#,
        ] {
            let reply: TokenEndpointReply = serde_json::from_str(body).unwrap();
            let TokenEndpointReply::Token(response) = reply else {
                panic!("expected token body for {body}");
            };
            let token = response.into_token(now);
            assert_eq!(token.expiry, Some(now + chrono::Duration::seconds(3600)));
            assert_eq!(token.token_type, "Bearer");
        }
    }

    #[test]
    fn out_of_range_expires_in_means_no_expiry() {
        // GIVEN: lifetimes past what a timestamp can hold
        let now = Utc::now();
        for body in [
            r#"{"access_token":"a","expires_in":"9223372036854775807"}"#,
            r#"{"access_token":"a","expires_in":18446744073709551615}"#,
            r#"{"access_token":"a","expires_in":9300000000000000}"#,
        ] {
            let reply: TokenEndpointReply = serde_json::from_str(body).unwrap();
            let TokenEndpointReply::Token(response) = reply else {
                panic!("expected token body for {body}");
            };

            // THEN: the token is kept without an expiry
            let token = response.into_token(now);
            assert_eq!(token.expiry, None, "{body}");
            assert!(!token.is_expired(now));
        }
    }

    #[test]
    fn error_body_is_recognized() {
        let reply: TokenEndpointReply = serde_json::from_str(
            r#"{"error":"bad_verification_code","error_description":"The code is incorrect"}"#,
        )
        .unwrap();
        let TokenEndpointReply::Error(err) = reply else {
            panic!("expected error body");
        };
        assert_eq!(err.describe(), "bad_verification_code: The code is incorrect");
    }

    #[test]
    fn token_without_expiry_never_expires() {
        let token = TokenResponse {
            access_token: "a".to_string(),
            token_type: None,
            expires_in: None,
            refresh_token: Some(String::new()),
            scope: None,
        }
        .into_token(Utc::now());

        assert!(!token.is_expired(Utc::now()));
        assert!(token.refresh_token.is_none());
    }

    #[test]
    fn expiry_uses_a_buffer() {
        let now = Utc::now();
        let token = OAuthToken {
            access_token: "a".to_string(),
            expiry: Some(now + chrono::Duration::seconds(30)),
            refresh_token: None,
            token_type: "Bearer".to_string(),
            scope: None,
        };
        assert!(token.is_expired(now));
    }
}
