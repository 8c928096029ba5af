// Per-request credential selection across the user's Kiro token and
// custom API account pools.
//
// Pro+ models only run on opus-enabled Kiro tokens or on custom accounts
// explicitly bound to the requested model name; when neither exists the
// allocator falls back to the full pool rather than failing.

use rand::Rng;
use std::sync::Arc;

use crate::auth::{AuthManagerCache, Credentials};
use crate::auth::manager::AuthManager;
use crate::error::ApiError;
use crate::store::{CustomAccount, KiroToken, Store};

/// Model names that always require an upgraded credential
pub const PRO_PLUS_MODELS: &[&str] = &[
    "claude-opus-4-5",
    "claude-opus-4-6",
    "claude-opus-4-20250514",
    "claude-opus-4-1-20250805",
];

/// Whether the requested model is in the privileged Pro+ tier
pub fn requires_pro_plus(model: &str) -> bool {
    if model.is_empty() {
        return false;
    }
    if PRO_PLUS_MODELS.contains(&model) {
        return true;
    }
    let lower = model.to_lowercase();
    if lower.contains("opus") {
        return true;
    }
    // sonnet-4-6 / sonnet-4.6 shipped as a Pro+ tier
    lower.contains("sonnet") && (lower.contains("4-6") || lower.contains("4.6"))
}

/// Exact membership test against the account's comma-separated model list;
/// an empty or missing list matches nothing.
fn account_matches_model(account: &CustomAccount, model: &str) -> bool {
    let Some(raw) = account.model.as_deref() else {
        return false;
    };
    raw.split(',').map(str::trim).any(|m| !m.is_empty() && m == model)
}

/// The credential chosen for one request
#[derive(Debug)]
pub enum Allocation {
    Kiro {
        token: KiroToken,
        manager: Arc<AuthManager>,
    },
    Custom {
        account: CustomAccount,
    },
}

pub struct TokenAllocator {
    store: Arc<Store>,
    auth_cache: Arc<AuthManagerCache>,
    fallback_profile_arn: Option<String>,
}

impl TokenAllocator {
    pub fn new(
        store: Arc<Store>,
        auth_cache: Arc<AuthManagerCache>,
        fallback_profile_arn: Option<String>,
    ) -> Self {
        Self {
            store,
            auth_cache,
            fallback_profile_arn,
        }
    }

    /// Select a credential for the user and model.
    pub fn get_best_token(&self, user_id: i64, model: &str) -> Result<Allocation, ApiError> {
        let kiro_tokens = self.store.get_active_kiro_tokens_by_user(user_id)?;
        let custom_accounts = self.store.get_active_custom_accounts_by_user(user_id)?;

        if requires_pro_plus(model) {
            let pro_tokens: Vec<&KiroToken> =
                kiro_tokens.iter().filter(|t| t.opus_enabled).collect();
            let pro_accounts: Vec<&CustomAccount> = custom_accounts
                .iter()
                .filter(|a| account_matches_model(a, model))
                .collect();

            tracing::info!(
                user_id,
                model,
                pro_tokens = pro_tokens.len(),
                pro_accounts = pro_accounts.len(),
                "Pro+ allocation"
            );

            match (pro_tokens.is_empty(), pro_accounts.is_empty()) {
                (false, false) => {
                    // Both sub-pools have a candidate; combine with a fair coin
                    return if rand::thread_rng().gen_bool(0.5) {
                        self.allocate_kiro(weighted_choice(&pro_tokens).clone())
                    } else {
                        Ok(uniform_custom(&pro_accounts))
                    };
                }
                (false, true) => {
                    return self.allocate_kiro(weighted_choice(&pro_tokens).clone());
                }
                (true, false) => {
                    return Ok(uniform_custom(&pro_accounts));
                }
                (true, true) => {
                    tracing::warn!(
                        user_id,
                        model,
                        "No Pro+ credential bound, falling back to the full pool"
                    );
                }
            }
        }

        // Uniform draw over the merged pool, kinds unlabeled
        let total = kiro_tokens.len() + custom_accounts.len();
        if total == 0 {
            return Err(ApiError::NoCredentialAvailable(format!(
                "User {} has no active token or custom API account",
                user_id
            )));
        }

        let pick = rand::thread_rng().gen_range(0..total);
        tracing::info!(
            user_id,
            model,
            kiro = kiro_tokens.len(),
            custom = custom_accounts.len(),
            kind = if pick < kiro_tokens.len() { "kiro" } else { "custom" },
            "Credential allocated"
        );

        if pick < kiro_tokens.len() {
            self.allocate_kiro(kiro_tokens[pick].clone())
        } else {
            Ok(Allocation::Custom {
                account: custom_accounts[pick - kiro_tokens.len()].clone(),
            })
        }
    }

    fn allocate_kiro(&self, token: KiroToken) -> Result<Allocation, ApiError> {
        let credentials = self
            .store
            .get_token_credentials(token.id)?
            .ok_or_else(|| {
                ApiError::NoCredentialAvailable(format!(
                    "Credentials for token {} disappeared",
                    token.id
                ))
            })?;

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

        Ok(Allocation::Kiro { token, manager })
    }
}

/// Weighted random draw; weight = max(1, success_count − fail_count)
fn weighted_choice<'a>(tokens: &[&'a KiroToken]) -> &'a KiroToken {
    if tokens.len() == 1 {
        return tokens[0];
    }

    let weights: Vec<i64> = tokens
        .iter()
        .map(|t| (t.success_count - t.fail_count).max(1))
        .collect();
    let total: i64 = weights.iter().sum();

    let mut roll = rand::thread_rng().gen_range(0..total);
    for (token, weight) in tokens.iter().zip(&weights) {
        roll -= weight;
        if roll < 0 {
            return token;
        }
    }
    tokens[tokens.len() - 1]
}

fn uniform_custom(accounts: &[&CustomAccount]) -> Allocation {
    let pick = rand::thread_rng().gen_range(0..accounts.len());
    Allocation::Custom {
        account: accounts[pick].clone(),
    }
}
