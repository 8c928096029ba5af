// Authentication types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AuthErrorKind;

/// The two refresh-token exchange protocols, distinguished by whether
/// OAuth2 client credentials accompany the refresh token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthDialect {
    /// Kiro desktop OAuth
    /// Uses https://prod.{region}.auth.desktop.kiro.dev/refreshToken
    Social,

    /// AWS SSO OIDC (IdC)
    /// Uses https://oidc.{region}.amazonaws.com/token
    Idc,
}

impl AuthDialect {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthDialect::Social => "social",
            AuthDialect::Idc => "idc",
        }
    }
}

/// Complete credential set for one upstream identity
#[derive(Debug, Clone)]
pub struct Credentials {
    pub refresh_token: String,
    pub region: String,
    pub profile_arn: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
}

impl Credentials {
    /// Dialect is decided by the presence of client credentials, set once
    /// at manager construction.
    pub fn dialect(&self) -> AuthDialect {
        if self.client_id.is_some() && self.client_secret.is_some() {
            AuthDialect::Idc
        } else {
            AuthDialect::Social
        }
    }
}

/// Error from a refresh attempt, carrying the HTTP status (when the
/// upstream answered at all) and a classification for retry policy.
#[derive(Debug, Clone)]
pub struct AuthError {
    pub kind: AuthErrorKind,
    pub status: Option<u16>,
    pub message: String,
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status {
            Some(status) => write!(f, "refresh failed ({:?}, HTTP {}): {}", self.kind, status, self.message),
            None => write!(f, "refresh failed ({:?}): {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for AuthError {}

/// Token data from a successful refresh
#[derive(Debug, Clone)]
pub struct TokenData {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub profile_arn: Option<String>,
}

/// Kiro desktop refresh request body
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SocialRefreshRequest {
    pub refresh_token: String,
}

/// AWS SSO OIDC token request body
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IdcRefreshRequest {
    pub client_id: String,
    pub client_secret: String,
    pub grant_type: String,
    pub refresh_token: String,
}

/// Refresh response; both dialects answer in camelCase
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshResponse {
    #[serde(default)]
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: Option<u64>,
    pub profile_arn: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds(client_id: Option<&str>, client_secret: Option<&str>) -> Credentials {
        Credentials {
            refresh_token: "rt".into(),
            region: "us-east-1".into(),
            profile_arn: None,
            client_id: client_id.map(String::from),
            client_secret: client_secret.map(String::from),
        }
    }

    #[test]
    fn test_dialect_detection() {
        assert_eq!(creds(None, None).dialect(), AuthDialect::Social);
        assert_eq!(creds(Some("id"), None).dialect(), AuthDialect::Social);
        assert_eq!(creds(None, Some("secret")).dialect(), AuthDialect::Social);
        assert_eq!(creds(Some("id"), Some("secret")).dialect(), AuthDialect::Idc);
    }

    #[test]
    fn test_idc_request_body_field_names() {
        let body = IdcRefreshRequest {
            client_id: "cid".into(),
            client_secret: "csec".into(),
            grant_type: "refresh_token".into(),
            refresh_token: "rt".into(),
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["clientId"], "cid");
        assert_eq!(json["clientSecret"], "csec");
        assert_eq!(json["grantType"], "refresh_token");
        assert_eq!(json["refreshToken"], "rt");
    }

    #[test]
    fn test_refresh_response_parses_camel_case() {
        let json = serde_json::json!({
            "accessToken": "at",
            "refreshToken": "new-rt",
            "expiresIn": 1800
        });
        let resp: RefreshResponse = serde_json::from_value(json).unwrap();
        assert_eq!(resp.access_token, "at");
        assert_eq!(resp.refresh_token.as_deref(), Some("new-rt"));
        assert_eq!(resp.expires_in, Some(1800));
    }
}
