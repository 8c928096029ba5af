// Persistence layer: users, donated Kiro tokens, custom API accounts and
// sessions in a single embedded SQLite file.
//
// Secret columns (refresh tokens, client credentials, API keys) hold
// AES-GCM ciphertext; lookups go through deterministic SHA-256 digests.
// All mutations serialize through the connection mutex so multi-statement
// updates stay atomic on the embedded engine.

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Mutex;

use crate::crypto::{token_hash, SecretBox};

// ==================================================================================================
// Entities
// ==================================================================================================

#[derive(Debug, Clone)]
pub struct User {
    pub id: i64,
    pub email: String,
    #[allow(dead_code)]
    pub password_digest: String,
    pub status: String,
    pub created_at: i64,
}

#[derive(Debug, Clone)]
pub struct KiroToken {
    pub id: i64,
    pub user_id: i64,
    pub token_hash: String,
    pub auth_type: String,
    pub region: String,
    pub visibility: String,
    pub status: String,
    pub opus_enabled: bool,
    pub success_count: i64,
    pub fail_count: i64,
    pub last_used: Option<i64>,
    pub last_check: Option<i64>,
    pub check_note: Option<String>,
    pub created_at: i64,
}

#[derive(Debug, Clone)]
pub struct CustomAccount {
    pub id: i64,
    pub user_id: i64,
    pub name: Option<String>,
    pub api_base: String,
    pub format: String,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub status: String,
    pub success_count: i64,
    pub fail_count: i64,
    pub created_at: i64,
}

/// Decrypted credential bundle for constructing an AuthManager
#[derive(Debug, Clone)]
pub struct TokenCredentials {
    pub refresh_token: String,
    pub auth_type: String,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub region: String,
}

#[derive(Debug, Clone)]
pub struct NewKiroToken {
    pub refresh_token: String,
    pub auth_type: String,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub region: String,
    pub visibility: String,
    pub opus_enabled: bool,
}

#[derive(Debug, Clone)]
pub struct NewCustomAccount {
    pub name: Option<String>,
    pub api_base: String,
    pub api_key: String,
    pub format: String,
    pub provider: Option<String>,
    pub model: Option<String>,
}

/// Partial update for a custom account; only supplied keys are applied.
/// An empty `api_key` means "keep the stored ciphertext".
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct CustomAccountPatch {
    pub name: Option<String>,
    pub api_base: Option<String>,
    pub api_key: Option<String>,
    pub format: Option<String>,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub status: Option<String>,
}

/// Which counter table an outcome applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialKind {
    Kiro,
    Custom,
}

// ==================================================================================================
// Store
// ==================================================================================================

pub struct Store {
    conn: Mutex<Connection>,
    secrets: SecretBox,
}

impl Store {
    pub fn open(path: &Path, secrets: SecretBox) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open SQLite database: {}", path.display()))?;
        Self::init(conn, secrets)
    }

    /// In-memory store for tests
    pub fn open_in_memory(secrets: SecretBox) -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::init(conn, secrets)
    }

    fn init(conn: Connection, secrets: SecretBox) -> Result<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                email TEXT NOT NULL UNIQUE,
                password_digest TEXT NOT NULL,
                api_key_hash TEXT,
                status TEXT NOT NULL DEFAULT 'active',
                created_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS tokens (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                token_hash TEXT NOT NULL UNIQUE,
                refresh_token TEXT NOT NULL,
                auth_type TEXT NOT NULL DEFAULT 'social',
                client_id TEXT,
                client_secret TEXT,
                region TEXT NOT NULL DEFAULT 'us-east-1',
                visibility TEXT NOT NULL DEFAULT 'private',
                status TEXT NOT NULL DEFAULT 'active',
                opus_enabled INTEGER NOT NULL DEFAULT 0,
                success_count INTEGER NOT NULL DEFAULT 0,
                fail_count INTEGER NOT NULL DEFAULT 0,
                last_used INTEGER,
                last_check INTEGER,
                check_note TEXT,
                created_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS custom_api_accounts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                name TEXT,
                api_base TEXT NOT NULL,
                api_key TEXT NOT NULL,
                format TEXT NOT NULL DEFAULT 'openai',
                provider TEXT,
                model TEXT,
                status TEXT NOT NULL DEFAULT 'active',
                success_count INTEGER NOT NULL DEFAULT 0,
                fail_count INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS sessions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                session_hash TEXT NOT NULL UNIQUE,
                expires_at INTEGER NOT NULL,
                created_at INTEGER NOT NULL
            );
            "#,
        )
        .context("Failed to create tables")?;

        migrate(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
            secrets,
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        // A poisoned store mutex is unrecoverable
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ==============================================================================================
    // Users
    // ==============================================================================================

    pub fn create_user(&self, email: &str, password_digest: &str, api_key: &str) -> Result<i64> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO users (email, password_digest, api_key_hash, status, created_at)
             VALUES (?1, ?2, ?3, 'active', ?4)",
            params![email, password_digest, token_hash(api_key), Utc::now().timestamp()],
        )
        .context("Failed to insert user")?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_user_by_api_key(&self, api_key: &str) -> Result<Option<User>> {
        let conn = self.lock();
        conn.query_row(
            "SELECT id, email, password_digest, status, created_at
             FROM users WHERE api_key_hash = ?1 AND status = 'active'",
            params![token_hash(api_key)],
            user_from_row,
        )
        .optional()
        .context("Failed to look up user by API key")
    }

    // ==============================================================================================
    // Kiro tokens
    // ==============================================================================================

    pub fn insert_kiro_token(&self, user_id: i64, new: &NewKiroToken) -> Result<i64> {
        let hash = token_hash(&new.refresh_token);
        let refresh_cipher = self
            .secrets
            .encrypt(&new.refresh_token)
            .map_err(|e| anyhow::anyhow!("Failed to encrypt refresh token: {}", e))?;
        let client_id_cipher = match &new.client_id {
            Some(v) => Some(
                self.secrets
                    .encrypt(v)
                    .map_err(|e| anyhow::anyhow!("Failed to encrypt client_id: {}", e))?,
            ),
            None => None,
        };
        let client_secret_cipher = match &new.client_secret {
            Some(v) => Some(
                self.secrets
                    .encrypt(v)
                    .map_err(|e| anyhow::anyhow!("Failed to encrypt client_secret: {}", e))?,
            ),
            None => None,
        };

        let conn = self.lock();
        conn.execute(
            "INSERT INTO tokens (user_id, token_hash, refresh_token, auth_type, client_id,
                                 client_secret, region, visibility, status, opus_enabled, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'active', ?9, ?10)",
            params![
                user_id,
                hash,
                refresh_cipher,
                new.auth_type,
                client_id_cipher,
                client_secret_cipher,
                new.region,
                new.visibility,
                new.opus_enabled as i64,
                Utc::now().timestamp()
            ],
        )
        .context("Failed to insert token (duplicate refresh token?)")?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_kiro_tokens_by_user(&self, user_id: i64) -> Result<Vec<KiroToken>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, user_id, token_hash, auth_type, region, visibility, status,
                    opus_enabled, success_count, fail_count, last_used, last_check,
                    check_note, created_at
             FROM tokens WHERE user_id = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![user_id], kiro_token_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn get_active_kiro_tokens_by_user(&self, user_id: i64) -> Result<Vec<KiroToken>> {
        Ok(self
            .get_kiro_tokens_by_user(user_id)?
            .into_iter()
            .filter(|t| t.status == "active")
            .collect())
    }

    pub fn get_all_active_kiro_tokens(&self) -> Result<Vec<KiroToken>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, user_id, token_hash, auth_type, region, visibility, status,
                    opus_enabled, success_count, fail_count, last_used, last_check,
                    check_note, created_at
             FROM tokens WHERE status = 'active' ORDER BY id",
        )?;
        let rows = stmt
            .query_map([], kiro_token_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn get_token_credentials(&self, id: i64) -> Result<Option<TokenCredentials>> {
        let row = {
            let conn = self.lock();
            conn.query_row(
                "SELECT refresh_token, auth_type, client_id, client_secret, region
                 FROM tokens WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()
            .context("Failed to load token credentials")?
        };

        let Some((refresh_cipher, auth_type, client_id_cipher, client_secret_cipher, region)) = row
        else {
            return Ok(None);
        };

        let refresh_token = self
            .secrets
            .decrypt(&refresh_cipher)
            .map_err(|e| anyhow::anyhow!("Failed to decrypt refresh token: {}", e))?;
        let client_id = match client_id_cipher {
            Some(c) => Some(
                self.secrets
                    .decrypt(&c)
                    .map_err(|e| anyhow::anyhow!("Failed to decrypt client_id: {}", e))?,
            ),
            None => None,
        };
        let client_secret = match client_secret_cipher {
            Some(c) => Some(
                self.secrets
                    .decrypt(&c)
                    .map_err(|e| anyhow::anyhow!("Failed to decrypt client_secret: {}", e))?,
            ),
            None => None,
        };

        Ok(Some(TokenCredentials {
            refresh_token,
            auth_type,
            client_id,
            client_secret,
            region,
        }))
    }

    pub fn set_token_status(&self, id: i64, status: &str) -> Result<bool> {
        let conn = self.lock();
        let n = conn.execute(
            "UPDATE tokens SET status = ?1 WHERE id = ?2",
            params![status, id],
        )?;
        Ok(n > 0)
    }

    pub fn delete_kiro_token(&self, id: i64, user_id: i64) -> Result<Option<String>> {
        let conn = self.lock();
        let hash: Option<String> = conn
            .query_row(
                "SELECT token_hash FROM tokens WHERE id = ?1 AND user_id = ?2",
                params![id, user_id],
                |row| row.get(0),
            )
            .optional()?;
        if hash.is_some() {
            conn.execute(
                "DELETE FROM tokens WHERE id = ?1 AND user_id = ?2",
                params![id, user_id],
            )?;
        }
        Ok(hash)
    }

    pub fn record_health_check(&self, id: i64, ok: bool, note: Option<&str>) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE tokens SET last_check = ?1, check_note = ?2 WHERE id = ?3",
            params![Utc::now().timestamp(), if ok { None } else { note }, id],
        )?;
        Ok(())
    }

    // ==============================================================================================
    // Custom API accounts
    // ==============================================================================================

    pub fn create_custom_account(&self, user_id: i64, new: &NewCustomAccount) -> Result<i64> {
        let api_key_cipher = self
            .secrets
            .encrypt(&new.api_key)
            .map_err(|e| anyhow::anyhow!("Failed to encrypt API key: {}", e))?;

        let conn = self.lock();
        conn.execute(
            "INSERT INTO custom_api_accounts
                 (user_id, name, api_base, api_key, format, provider, model, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'active', ?8)",
            params![
                user_id,
                new.name,
                new.api_base,
                api_key_cipher,
                new.format,
                new.provider,
                new.model,
                Utc::now().timestamp()
            ],
        )
        .context("Failed to insert custom API account")?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_custom_accounts_by_user(&self, user_id: i64) -> Result<Vec<CustomAccount>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, user_id, name, api_base, format, provider, model, status,
                    success_count, fail_count, created_at
             FROM custom_api_accounts WHERE user_id = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![user_id], custom_account_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn get_active_custom_accounts_by_user(&self, user_id: i64) -> Result<Vec<CustomAccount>> {
        Ok(self
            .get_custom_accounts_by_user(user_id)?
            .into_iter()
            .filter(|a| a.status == "active")
            .collect())
    }

    pub fn get_custom_account(&self, id: i64, user_id: Option<i64>) -> Result<Option<CustomAccount>> {
        let conn = self.lock();
        let account = match user_id {
            Some(uid) => conn
                .query_row(
                    "SELECT id, user_id, name, api_base, format, provider, model, status,
                            success_count, fail_count, created_at
                     FROM custom_api_accounts WHERE id = ?1 AND user_id = ?2",
                    params![id, uid],
                    custom_account_from_row,
                )
                .optional()?,
            None => conn
                .query_row(
                    "SELECT id, user_id, name, api_base, format, provider, model, status,
                            success_count, fail_count, created_at
                     FROM custom_api_accounts WHERE id = ?1",
                    params![id],
                    custom_account_from_row,
                )
                .optional()?,
        };
        Ok(account)
    }

    pub fn admin_list_custom_accounts(&self) -> Result<Vec<CustomAccount>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, user_id, name, api_base, format, provider, model, status,
                    success_count, fail_count, created_at
             FROM custom_api_accounts ORDER BY id",
        )?;
        let rows = stmt
            .query_map([], custom_account_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Apply a partial update. Ownership is enforced by anding `user_id`
    /// into the WHERE clause when present (None = admin). Returns whether
    /// a row matched.
    pub fn update_custom_account(
        &self,
        id: i64,
        user_id: Option<i64>,
        patch: &CustomAccountPatch,
    ) -> Result<bool> {
        let mut sets: Vec<&str> = Vec::new();
        let mut values: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(name) = &patch.name {
            sets.push("name = ?");
            values.push(Box::new(name.clone()));
        }
        if let Some(api_base) = &patch.api_base {
            sets.push("api_base = ?");
            values.push(Box::new(api_base.clone()));
        }
        if let Some(api_key) = &patch.api_key {
            // Empty key means "retain existing ciphertext"
            if !api_key.is_empty() {
                let cipher = self
                    .secrets
                    .encrypt(api_key)
                    .map_err(|e| anyhow::anyhow!("Failed to encrypt API key: {}", e))?;
                sets.push("api_key = ?");
                values.push(Box::new(cipher));
            }
        }
        if let Some(format) = &patch.format {
            sets.push("format = ?");
            values.push(Box::new(format.clone()));
        }
        if let Some(provider) = &patch.provider {
            sets.push("provider = ?");
            values.push(Box::new(provider.clone()));
        }
        if let Some(model) = &patch.model {
            sets.push("model = ?");
            values.push(Box::new(model.clone()));
        }
        if let Some(status) = &patch.status {
            sets.push("status = ?");
            values.push(Box::new(status.clone()));
        }

        if sets.is_empty() {
            // Nothing to change; report whether the row exists at all
            return Ok(self.get_custom_account(id, user_id)?.is_some());
        }

        let mut sql = format!("UPDATE custom_api_accounts SET {} WHERE id = ?", sets.join(", "));
        values.push(Box::new(id));
        if let Some(uid) = user_id {
            sql.push_str(" AND user_id = ?");
            values.push(Box::new(uid));
        }

        let conn = self.lock();
        let n = conn.execute(&sql, rusqlite::params_from_iter(values.iter().map(|v| v.as_ref())))?;
        Ok(n > 0)
    }

    pub fn set_custom_account_status(
        &self,
        id: i64,
        user_id: Option<i64>,
        status: &str,
    ) -> Result<bool> {
        let conn = self.lock();
        let n = match user_id {
            Some(uid) => conn.execute(
                "UPDATE custom_api_accounts SET status = ?1 WHERE id = ?2 AND user_id = ?3",
                params![status, id, uid],
            )?,
            None => conn.execute(
                "UPDATE custom_api_accounts SET status = ?1 WHERE id = ?2",
                params![status, id],
            )?,
        };
        Ok(n > 0)
    }

    pub fn delete_custom_account(&self, id: i64, user_id: Option<i64>) -> Result<bool> {
        let conn = self.lock();
        let n = match user_id {
            Some(uid) => conn.execute(
                "DELETE FROM custom_api_accounts WHERE id = ?1 AND user_id = ?2",
                params![id, uid],
            )?,
            None => conn.execute(
                "DELETE FROM custom_api_accounts WHERE id = ?1",
                params![id],
            )?,
        };
        Ok(n > 0)
    }

    pub fn get_custom_api_key(&self, id: i64) -> Result<Option<String>> {
        let cipher: Option<String> = {
            let conn = self.lock();
            conn.query_row(
                "SELECT api_key FROM custom_api_accounts WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?
        };
        match cipher {
            Some(c) => Ok(Some(self.secrets.decrypt(&c).map_err(|e| {
                anyhow::anyhow!("Failed to decrypt API key: {}", e)
            })?)),
            None => Ok(None),
        }
    }

    // ==============================================================================================
    // Counters
    // ==============================================================================================

    pub fn increment_success(&self, kind: CredentialKind, id: i64) -> Result<()> {
        let conn = self.lock();
        match kind {
            CredentialKind::Kiro => {
                conn.execute(
                    "UPDATE tokens SET success_count = success_count + 1, last_used = ?1
                     WHERE id = ?2",
                    params![Utc::now().timestamp(), id],
                )?;
            }
            CredentialKind::Custom => {
                conn.execute(
                    "UPDATE custom_api_accounts SET success_count = success_count + 1
                     WHERE id = ?1",
                    params![id],
                )?;
            }
        }
        Ok(())
    }

    pub fn increment_fail(&self, kind: CredentialKind, id: i64) -> Result<()> {
        let conn = self.lock();
        match kind {
            CredentialKind::Kiro => {
                conn.execute(
                    "UPDATE tokens SET fail_count = fail_count + 1, last_used = ?1
                     WHERE id = ?2",
                    params![Utc::now().timestamp(), id],
                )?;
            }
            CredentialKind::Custom => {
                conn.execute(
                    "UPDATE custom_api_accounts SET fail_count = fail_count + 1 WHERE id = ?1",
                    params![id],
                )?;
            }
        }
        Ok(())
    }

    // ==============================================================================================
    // Sessions
    // ==============================================================================================

    pub fn create_session(&self, user_id: i64, session_token: &str, ttl_secs: i64) -> Result<i64> {
        let now = Utc::now().timestamp();
        let conn = self.lock();
        conn.execute(
            "INSERT INTO sessions (user_id, session_hash, expires_at, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![user_id, token_hash(session_token), now + ttl_secs, now],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_session_user(&self, session_token: &str) -> Result<Option<i64>> {
        let conn = self.lock();
        conn.query_row(
            "SELECT user_id FROM sessions WHERE session_hash = ?1 AND expires_at > ?2",
            params![token_hash(session_token), Utc::now().timestamp()],
            |row| row.get(0),
        )
        .optional()
        .context("Failed to look up session")
    }

    pub fn purge_expired_sessions(&self) -> Result<usize> {
        let conn = self.lock();
        let n = conn.execute(
            "DELETE FROM sessions WHERE expires_at <= ?1",
            params![Utc::now().timestamp()],
        )?;
        Ok(n)
    }
}

// ==================================================================================================
// Row mapping & migration
// ==================================================================================================

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        email: row.get(1)?,
        password_digest: row.get(2)?,
        status: row.get(3)?,
        created_at: row.get(4)?,
    })
}

fn kiro_token_from_row(row: &Row<'_>) -> rusqlite::Result<KiroToken> {
    Ok(KiroToken {
        id: row.get(0)?,
        user_id: row.get(1)?,
        token_hash: row.get(2)?,
        auth_type: row.get(3)?,
        region: row.get(4)?,
        visibility: row.get(5)?,
        status: row.get(6)?,
        opus_enabled: row.get::<_, i64>(7)? != 0,
        success_count: row.get(8)?,
        fail_count: row.get(9)?,
        last_used: row.get(10)?,
        last_check: row.get(11)?,
        check_note: row.get(12)?,
        created_at: row.get(13)?,
    })
}

fn custom_account_from_row(row: &Row<'_>) -> rusqlite::Result<CustomAccount> {
    Ok(CustomAccount {
        id: row.get(0)?,
        user_id: row.get(1)?,
        name: row.get(2)?,
        api_base: row.get(3)?,
        format: row.get(4)?,
        provider: row.get(5)?,
        model: row.get(6)?,
        status: row.get(7)?,
        success_count: row.get(8)?,
        fail_count: row.get(9)?,
        created_at: row.get(10)?,
    })
}

/// Columns added after the initial schema shipped. On open, any that are
/// missing (older database file) are added with their default.
const EXPECTED_COLUMNS: &[(&str, &str, &str)] = &[
    ("users", "api_key_hash", "TEXT"),
    ("tokens", "auth_type", "TEXT NOT NULL DEFAULT 'social'"),
    ("tokens", "client_id", "TEXT"),
    ("tokens", "client_secret", "TEXT"),
    ("tokens", "region", "TEXT NOT NULL DEFAULT 'us-east-1'"),
    ("tokens", "opus_enabled", "INTEGER NOT NULL DEFAULT 0"),
    ("tokens", "check_note", "TEXT"),
    ("custom_api_accounts", "provider", "TEXT"),
    ("custom_api_accounts", "model", "TEXT"),
];

fn migrate(conn: &Connection) -> Result<()> {
    for (table, column, decl) in EXPECTED_COLUMNS {
        let columns = table_columns(conn, table)?;
        if columns.is_empty() {
            // Table absent entirely; nothing to alter
            continue;
        }
        if !columns.iter().any(|c| c == column) {
            tracing::info!("Migrating: adding column {}.{}", table, column);
            conn.execute(
                &format!("ALTER TABLE {} ADD COLUMN {} {}", table, column, decl),
                [],
            )
            .with_context(|| format!("Failed to add column {}.{}", table, column))?;
        }
    }
    Ok(())
}

fn table_columns(conn: &Connection, table: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(names)
}

#[cfg(test)]
fn column_exists(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    Ok(table_columns(conn, table)?.iter().any(|n| n == column))
}
