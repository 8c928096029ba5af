// Per-credential token lifecycle: refresh-token to access-token exchange
// with caching and single-flight coalescing.
//
// N concurrent callers on an expired manager issue exactly one refresh
// POST: the lock winner performs it and fills the cache, losers re-check
// the cache after the lock. The refresh runs in a spawned task against
// shared state, so a caller disconnecting mid-refresh does not cancel
// the POST and the result is still cached for the next request. A failed
// refresh is remembered for a short cooldown so coalesced losers receive
// the same error instead of each re-hitting the endpoint.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reqwest::Client;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};

use super::types::{
    AuthDialect, AuthError, Credentials, IdcRefreshRequest, RefreshResponse, SocialRefreshRequest,
    TokenData,
};
use crate::error::AuthErrorKind;

/// Seconds a cached token must still be valid for to be handed out
const EXPIRY_SAFETY_MARGIN_SECS: i64 = 60;

/// How long a failed refresh is replayed to coalesced callers
const FAILURE_COOLDOWN: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct RecentFailure {
    at: Instant,
    error: AuthError,
}

/// State the detached refresh task needs to outlive its caller
#[derive(Debug)]
struct Shared {
    refresh_token: RwLock<String>,
    region: String,
    profile_arn: RwLock<Option<String>>,
    client_id: Option<String>,
    client_secret: Option<String>,
    dialect: AuthDialect,

    client: Client,
    cache: RwLock<Option<CachedToken>>,
    refresh_lock: Mutex<()>,
    last_failure: RwLock<Option<RecentFailure>>,

    refresh_url_override: Option<String>,
}

#[derive(Debug)]
pub struct AuthManager {
    shared: Arc<Shared>,
    api_url_override: Option<String>,
}

impl AuthManager {
    pub fn new(credentials: Credentials, client: Client) -> Self {
        let dialect = credentials.dialect();
        Self {
            shared: Arc::new(Shared {
                refresh_token: RwLock::new(credentials.refresh_token),
                region: credentials.region,
                profile_arn: RwLock::new(credentials.profile_arn),
                client_id: credentials.client_id,
                client_secret: credentials.client_secret,
                dialect,
                client,
                cache: RwLock::new(None),
                refresh_lock: Mutex::new(()),
                last_failure: RwLock::new(None),
                refresh_url_override: None,
            }),
            api_url_override: None,
        }
    }

    /// Point the refresh POST at a different endpoint (mock upstreams)
    pub fn with_refresh_url(mut self, url: String) -> Self {
        let shared = Arc::get_mut(&mut self.shared)
            .expect("with_refresh_url must be called before the manager is shared");
        shared.refresh_url_override = Some(url);
        self
    }

    /// Point inference requests at a different endpoint (mock upstreams)
    pub fn with_api_url(mut self, url: String) -> Self {
        self.api_url_override = Some(url);
        self
    }

    pub fn dialect(&self) -> AuthDialect {
        self.shared.dialect
    }

    pub fn region(&self) -> &str {
        &self.shared.region
    }

    pub async fn profile_arn(&self) -> Option<String> {
        self.shared.profile_arn.read().await.clone()
    }

    /// Upstream inference endpoint for this credential's region
    pub fn api_url(&self) -> String {
        match &self.api_url_override {
            Some(url) => url.clone(),
            None => format!(
                "https://codewhisperer.{}.amazonaws.com/generateAssistantResponse",
                self.shared.region
            ),
        }
    }

    #[cfg(test)]
    fn refresh_url(&self) -> String {
        self.shared.refresh_url()
    }

    #[cfg(test)]
    async fn current_refresh_token(&self) -> String {
        self.shared.refresh_token.read().await.clone()
    }

    /// Get a valid access token, refreshing through the single-flight
    /// lock when the cache is stale.
    ///
    /// The winning caller spawns the refresh as a detached task: if the
    /// caller disconnects mid-refresh the POST still completes and its
    /// result lands in the cache for the next request.
    pub async fn get_access_token(&self) -> Result<String, AuthError> {
        if let Some(token) = self.shared.cached_token().await {
            return Ok(token);
        }

        let _flight = self.shared.refresh_lock.lock().await;

        // The lock winner may have refreshed while we waited
        if let Some(token) = self.shared.cached_token().await {
            return Ok(token);
        }

        // Replay a very recent failure to coalesced callers
        if let Some(failure) = self.shared.last_failure.read().await.clone() {
            if failure.at.elapsed() < FAILURE_COOLDOWN {
                return Err(failure.error);
            }
        }

        let shared = self.shared.clone();
        let task = tokio::spawn(async move { shared.refresh_and_store().await });
        match task.await {
            Ok(result) => result,
            Err(e) => Err(AuthError {
                kind: AuthErrorKind::Transient,
                status: None,
                message: format!("refresh task failed: {}", e),
            }),
        }
    }

    /// Drop the cached token so the next caller forces a refresh
    pub async fn invalidate(&self) {
        *self.shared.cache.write().await = None;
        *self.shared.last_failure.write().await = None;
    }
}

impl Shared {
    fn refresh_url(&self) -> String {
        if let Some(url) = &self.refresh_url_override {
            return url.clone();
        }
        match self.dialect {
            AuthDialect::Social => format!(
                "https://prod.{}.auth.desktop.kiro.dev/refreshToken",
                self.region
            ),
            AuthDialect::Idc => format!("https://oidc.{}.amazonaws.com/token", self.region),
        }
    }

    async fn cached_token(&self) -> Option<String> {
        let cache = self.cache.read().await;
        cache.as_ref().and_then(|t| {
            let margin = Utc::now() + ChronoDuration::seconds(EXPIRY_SAFETY_MARGIN_SECS);
            (t.expires_at > margin).then(|| t.access_token.clone())
        })
    }

    /// Perform one refresh and record its outcome in the shared state
    async fn refresh_and_store(self: Arc<Self>) -> Result<String, AuthError> {
        match self.refresh_once().await {
            Ok(data) => {
                {
                    let mut cache = self.cache.write().await;
                    *cache = Some(CachedToken {
                        access_token: data.access_token.clone(),
                        expires_at: data.expires_at,
                    });
                }
                if let Some(new_refresh) = &data.refresh_token {
                    *self.refresh_token.write().await = new_refresh.clone();
                }
                if let Some(arn) = &data.profile_arn {
                    *self.profile_arn.write().await = Some(arn.clone());
                }
                *self.last_failure.write().await = None;
                Ok(data.access_token)
            }
            Err(error) => {
                *self.last_failure.write().await = Some(RecentFailure {
                    at: Instant::now(),
                    error: error.clone(),
                });
                Err(error)
            }
        }
    }

    async fn refresh_once(&self) -> Result<TokenData, AuthError> {
        let url = self.refresh_url();
        let refresh_token = self.refresh_token.read().await.clone();

        tracing::debug!(
            dialect = self.dialect.as_str(),
            region = %self.region,
            "Refreshing access token"
        );

        let request = match self.dialect {
            AuthDialect::Social => self
                .client
                .post(&url)
                .header("Content-Type", "application/json")
                .header("User-Agent", format!("KiroIDE-0.7.45-{}", machine_fingerprint()))
                .json(&SocialRefreshRequest { refresh_token }),
            AuthDialect::Idc => {
                // Dialect invariant: both credentials present
                let client_id = self.client_id.clone().unwrap_or_default();
                let client_secret = self.client_secret.clone().unwrap_or_default();
                self.client
                    .post(&url)
                    .header("Content-Type", "application/json")
                    .json(&IdcRefreshRequest {
                        client_id,
                        client_secret,
                        grant_type: "refresh_token".to_string(),
                        refresh_token,
                    })
            }
        };

        let response = request.send().await.map_err(|e| AuthError {
            kind: AuthErrorKind::Transient,
            status: None,
            message: format!("refresh request failed: {}", e),
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(
                status = status.as_u16(),
                dialect = self.dialect.as_str(),
                "Token refresh rejected: {}",
                body.chars().take(200).collect::<String>()
            );
            return Err(classify_refresh_failure(status.as_u16(), &body));
        }

        let data: RefreshResponse = response.json().await.map_err(|e| AuthError {
            kind: AuthErrorKind::Invalid,
            status: Some(status.as_u16()),
            message: format!("unparseable refresh response: {}", e),
        })?;

        if data.access_token.is_empty() {
            return Err(AuthError {
                kind: AuthErrorKind::Invalid,
                status: Some(status.as_u16()),
                message: "refresh response contained no accessToken".to_string(),
            });
        }

        let expires_in = data.expires_in.unwrap_or(3600);
        let expires_at = Utc::now() + ChronoDuration::seconds(expires_in as i64);

        tracing::info!(
            dialect = self.dialect.as_str(),
            expires = %expires_at.to_rfc3339(),
            "Access token refreshed"
        );

        Ok(TokenData {
            access_token: data.access_token,
            refresh_token: data.refresh_token,
            expires_at,
            profile_arn: data.profile_arn,
        })
    }
}

/// Classify a non-2xx refresh response per the retry policy: 401 with a
/// recognized body means the refresh token itself expired, 5xx is
/// transient, anything else invalidates the credential.
fn classify_refresh_failure(status: u16, body: &str) -> AuthError {
    let lower = body.to_lowercase();
    let kind = if status == 401
        && (lower.contains("expired") || lower.contains("invalid_grant") || lower.contains("refresh"))
    {
        AuthErrorKind::Expired
    } else if status >= 500 {
        AuthErrorKind::Transient
    } else {
        AuthErrorKind::Invalid
    };

    AuthError {
        kind,
        status: Some(status),
        message: body.chars().take(200).collect(),
    }
}

/// Stable per-host fingerprint for the Kiro desktop User-Agent
fn machine_fingerprint() -> String {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());

    let mut hasher = DefaultHasher::new();
    host.hash(&mut hasher);
    format!("{:x}", hasher.finish())
}
