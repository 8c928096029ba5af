// Process-wide cache of AuthManagers keyed by credential fingerprint.
//
// A stable manager per credential is what makes refresh coalescing work:
// every request for the same token lands on the same single-flight lock.
// Entries are evicted only when the owning token row is deleted or marked
// invalid, never by LRU.

use dashmap::DashMap;
use reqwest::Client;
use std::sync::Arc;

use super::manager::AuthManager;
use super::types::Credentials;
use crate::crypto::mask_token;

pub struct AuthManagerCache {
    managers: DashMap<String, Arc<AuthManager>>,
    client: Client,
}

impl AuthManagerCache {
    pub fn new(client: Client) -> Self {
        Self {
            managers: DashMap::new(),
            client,
        }
    }

    /// Get the manager for a credential fingerprint, creating it on first
    /// use. The entry API keeps concurrent callers on one instance.
    pub fn get_or_create(&self, token_hash: &str, credentials: &Credentials) -> Arc<AuthManager> {
        if let Some(existing) = self.managers.get(token_hash) {
            return existing.clone();
        }

        let entry = self
            .managers
            .entry(token_hash.to_string())
            .or_insert_with(|| {
                tracing::info!(
                    token = %mask_token(&credentials.refresh_token),
                    region = %credentials.region,
                    dialect = credentials.dialect().as_str(),
                    "Creating AuthManager"
                );
                Arc::new(AuthManager::new(credentials.clone(), self.client.clone()))
            });
        entry.clone()
    }

    /// Drop the manager for a deleted or invalidated token row
    pub fn remove(&self, token_hash: &str) -> bool {
        self.managers.remove(token_hash).is_some()
    }

    /// Install a pre-built manager (mock endpoints in tests)
    pub fn insert(&self, token_hash: &str, manager: Arc<AuthManager>) {
        self.managers.insert(token_hash.to_string(), manager);
    }

    pub fn len(&self) -> usize {
        self.managers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.managers.is_empty()
    }
}
