// Background token health checker.
//
// Wakes on a configurable interval and probes every active Kiro token by
// driving its AuthManager through a short-deadline refresh. A token whose
// refresh comes back expired or invalid is flipped to `invalid` and its
// manager evicted; transient failures only leave a note.

use std::sync::Arc;
use std::time::Duration;

use crate::auth::{AuthManagerCache, Credentials};
use crate::error::AuthErrorKind;
use crate::store::{KiroToken, Store};

/// Per-token deadline; a probe must never stall the whole cycle
const CHECK_TIMEOUT: Duration = Duration::from_secs(20);

pub struct HealthChecker {
    store: Arc<Store>,
    auth_cache: Arc<AuthManagerCache>,
    interval_secs: u64,
    fallback_profile_arn: Option<String>,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct HealthSummary {
    pub checked: usize,
    pub healthy: usize,
    pub invalidated: usize,
    pub transient: usize,
}

impl HealthChecker {
    pub fn new(
        store: Arc<Store>,
        auth_cache: Arc<AuthManagerCache>,
        interval_secs: u64,
        fallback_profile_arn: Option<String>,
    ) -> Self {
        Self {
            store,
            auth_cache,
            interval_secs,
            fallback_profile_arn,
        }
    }

    /// Spawn the periodic loop. With interval 0 the checker is disabled.
    pub fn spawn(self: Arc<Self>) -> Option<tokio::task::JoinHandle<()>> {
        if self.interval_secs == 0 {
            tracing::info!("Token health checker disabled");
            return None;
        }

        tracing::info!(interval = self.interval_secs, "Token health checker started");
        Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(self.interval_secs)).await;
                let summary = self.check_all_tokens().await;
                tracing::info!(
                    checked = summary.checked,
                    healthy = summary.healthy,
                    invalidated = summary.invalidated,
                    transient = summary.transient,
                    "Health check cycle complete"
                );
            }
        }))
    }

    /// Check every active token once; probes run concurrently.
    pub async fn check_all_tokens(&self) -> HealthSummary {
        let tokens = match self.store.get_all_active_kiro_tokens() {
            Ok(tokens) => tokens,
            Err(e) => {
                tracing::error!("Health check could not list tokens: {}", e);
                return HealthSummary::default();
            }
        };

        if tokens.is_empty() {
            return HealthSummary::default();
        }

        let mut summary = HealthSummary {
            checked: tokens.len(),
            ..Default::default()
        };

        let probes = tokens.into_iter().map(|token| async move {
            let outcome = self.check_token(&token).await;
            (token, outcome)
        });

        for (token, outcome) in futures::future::join_all(probes).await {
            match outcome {
                Ok(()) => summary.healthy += 1,
                Err(kind) if kind.is_fatal() => {
                    summary.invalidated += 1;
                    if let Err(e) = self.store.set_token_status(token.id, "invalid") {
                        tracing::error!("Failed to invalidate token {}: {}", token.id, e);
                    }
                    self.auth_cache.remove(&token.token_hash);
                    tracing::warn!(token_id = token.id, "Token marked invalid by health check");
                }
                Err(_) => summary.transient += 1,
            }
        }

        summary
    }

    async fn check_token(&self, token: &KiroToken) -> Result<(), AuthErrorKind> {
        let credentials = match self.store.get_token_credentials(token.id) {
            Ok(Some(c)) => c,
            Ok(None) => {
                let _ = self
                    .store
                    .record_health_check(token.id, false, Some("credentials missing"));
                return Err(AuthErrorKind::Invalid);
            }
            Err(e) => {
                let note = truncate(&e.to_string());
                let _ = self.store.record_health_check(token.id, false, Some(&note));
                return Err(AuthErrorKind::Transient);
            }
        };

        let manager = self.auth_cache.get_or_create(
            &token.token_hash,
            &Credentials {
                refresh_token: credentials.refresh_token,
                region: credentials.region,
                profile_arn: self.fallback_profile_arn.clone(),
                client_id: credentials.client_id,
                client_secret: credentials.client_secret,
            },
        );

        match tokio::time::timeout(CHECK_TIMEOUT, manager.get_access_token()).await {
            Ok(Ok(_)) => {
                let _ = self.store.record_health_check(token.id, true, None);
                Ok(())
            }
            Ok(Err(err)) => {
                let note = truncate(&err.to_string());
                let _ = self.store.record_health_check(token.id, false, Some(&note));
                Err(err.kind)
            }
            Err(_) => {
                let _ = self
                    .store
                    .record_health_check(token.id, false, Some("health check timed out"));
                Err(AuthErrorKind::Transient)
            }
        }
    }
}

fn truncate(message: &str) -> String {
    message.chars().take(200).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthManager;
    use crate::crypto::{token_hash, SecretBox};
    use crate::store::NewKiroToken;
    use axum::{routing::post, Json, Router};
    use reqwest::Client;

    async fn spawn_refresh_server(
        status: axum::http::StatusCode,
        body: serde_json::Value,
    ) -> String {
        let app = Router::new().route(
            "/refreshToken",
            post(move || {
                let body = body.clone();
                async move { (status, Json(body)) }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/refreshToken", addr)
    }

    fn setup_with_token() -> (Arc<Store>, Arc<AuthManagerCache>, i64, String) {
        let store = Arc::new(Store::open_in_memory(SecretBox::new("health-test")).unwrap());
        let cache = Arc::new(AuthManagerCache::new(Client::new()));
        let user_id = store.create_user("u@x.com", "d", "key").unwrap();
        let refresh_token = "rt-health".to_string();
        let token_id = store
            .insert_kiro_token(
                user_id,
                &NewKiroToken {
                    refresh_token: refresh_token.clone(),
                    auth_type: "social".into(),
                    client_id: None,
                    client_secret: None,
                    region: "us-east-1".into(),
                    visibility: "private".into(),
                    opus_enabled: false,
                },
            )
            .unwrap();
        (store, cache, token_id, token_hash(&refresh_token))
    }

    fn install_mock_manager(cache: &AuthManagerCache, hash: &str, refresh_url: String) {
        let manager = AuthManager::new(
            Credentials {
                refresh_token: "rt-health".into(),
                region: "us-east-1".into(),
                profile_arn: None,
                client_id: None,
                client_secret: None,
            },
            Client::new(),
        )
        .with_refresh_url(refresh_url);
        cache.insert(hash, Arc::new(manager));
    }

    #[tokio::test]
    async fn test_healthy_token_stays_active() {
        let (store, cache, token_id, hash) = setup_with_token();
        let url = spawn_refresh_server(
            axum::http::StatusCode::OK,
            serde_json::json!({"accessToken": "at", "expiresIn": 3600}),
        )
        .await;
        install_mock_manager(&cache, &hash, url);

        let checker = HealthChecker::new(store.clone(), cache, 0, None);
        let summary = checker.check_all_tokens().await;

        assert_eq!(summary.healthy, 1);
        let token = &store.get_all_active_kiro_tokens().unwrap()[0];
        assert_eq!(token.id, token_id);
        assert!(token.last_check.is_some());
        assert!(token.check_note.is_none());
    }

    #[tokio::test]
    async fn test_expired_token_invalidated_and_evicted() {
        let (store, cache, _token_id, hash) = setup_with_token();
        let url = spawn_refresh_server(
            axum::http::StatusCode::UNAUTHORIZED,
            serde_json::json!({"error": "invalid_grant", "error_description": "expired"}),
        )
        .await;
        install_mock_manager(&cache, &hash, url);
        assert_eq!(cache.len(), 1);

        let checker = HealthChecker::new(store.clone(), cache.clone(), 0, None);
        let summary = checker.check_all_tokens().await;

        assert_eq!(summary.invalidated, 1);
        assert!(store.get_all_active_kiro_tokens().unwrap().is_empty());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_transient_failure_leaves_token_active() {
        let (store, cache, _token_id, hash) = setup_with_token();
        let url = spawn_refresh_server(
            axum::http::StatusCode::SERVICE_UNAVAILABLE,
            serde_json::json!({"message": "try later"}),
        )
        .await;
        install_mock_manager(&cache, &hash, url);

        let checker = HealthChecker::new(store.clone(), cache, 0, None);
        let summary = checker.check_all_tokens().await;

        assert_eq!(summary.transient, 1);
        let tokens = store.get_all_active_kiro_tokens().unwrap();
        assert_eq!(tokens.len(), 1);
        assert!(tokens[0].check_note.is_some());
    }
}
