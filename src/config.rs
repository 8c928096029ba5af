use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;

/// Regions the gateway accepts for donated tokens and the fallback identity
pub const SUPPORTED_REGIONS: &[&str] = &["us-east-1", "ap-southeast-1", "eu-west-1"];

/// Encrypt keys that must never reach production
const DEFAULT_ENCRYPT_KEYS: &[&str] = &["", "changeme", "default", "kirogate"];

/// KiroGate - multi-tenant Anthropic-compatible gateway
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Server host address
    #[arg(short = 'H', long, env = "SERVER_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Server port
    #[arg(short, long, env = "SERVER_PORT", default_value = "8000")]
    pub port: u16,

    /// Key used to encrypt stored secrets (required)
    #[arg(long, env = "TOKEN_ENCRYPT_KEY")]
    pub token_encrypt_key: Option<String>,

    /// Path to the embedded SQLite database
    #[arg(short = 'd', long, env = "DATABASE_PATH", default_value = "kirogate.db")]
    pub database_path: String,

    /// API key granting access to /admin routes
    #[arg(long, env = "ADMIN_API_KEY")]
    pub admin_api_key: Option<String>,

    /// Default AWS region for the fallback identity
    #[arg(short = 'r', long, env = "REGION", default_value = "us-east-1")]
    pub region: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Health check interval in seconds (0 disables)
    #[arg(long, env = "HEALTH_CHECK_INTERVAL", default_value = "1800")]
    pub health_check_interval: u64,

    /// First token timeout in seconds
    #[arg(long, env = "FIRST_TOKEN_TIMEOUT", default_value = "15")]
    pub first_token_timeout: u64,

    /// Inter-frame stream read timeout in seconds
    #[arg(long, env = "STREAM_READ_TIMEOUT", default_value = "120")]
    pub stream_read_timeout: u64,

    /// HTTP request timeout in seconds
    #[arg(long, env = "HTTP_REQUEST_TIMEOUT", default_value = "300")]
    pub http_timeout: u64,
}

/// Global fallback identity used when a request carries no user context
/// (single-operator deployments, mirrors the original env contract)
#[derive(Clone, Debug, Default)]
pub struct FallbackIdentity {
    pub refresh_token: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub profile_arn: Option<String>,
}

#[derive(Clone, Debug)]
pub struct Config {
    // Server settings
    pub server_host: String,
    pub server_port: u16,

    // Secrets
    pub token_encrypt_key: String,
    pub admin_api_key: Option<String>,

    // Persistence
    pub database_path: PathBuf,

    // Upstream identity
    pub region: String,
    pub fallback: FallbackIdentity,

    // Outbound proxy
    pub http_proxy: Option<String>,
    pub socks5_proxy: Option<String>,

    // Timeouts & intervals
    pub health_check_interval: u64,
    pub first_token_timeout: u64,
    pub stream_read_timeout: u64,
    pub http_request_timeout: u64,
    pub http_connect_timeout: u64,
    pub http_max_connections: usize,

    // Logging
    pub log_level: String,

    // Deployment mode ("production" enables the default-key refusal)
    pub app_env: String,
}

impl Config {
    /// Load configuration from all sources with priority: CLI > ENV > defaults
    pub fn load() -> Result<Self> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        let args = CliArgs::parse();
        Self::from_args(args)
    }

    fn from_args(args: CliArgs) -> Result<Self> {
        let config = Config {
            server_host: args.host,
            server_port: args.port,

            token_encrypt_key: args
                .token_encrypt_key
                .context("TOKEN_ENCRYPT_KEY is required (set TOKEN_ENCRYPT_KEY env var)")?,

            admin_api_key: args.admin_api_key,

            database_path: PathBuf::from(args.database_path),

            region: args.region,

            fallback: FallbackIdentity {
                refresh_token: std::env::var("REFRESH_TOKEN").ok().filter(|s| !s.is_empty()),
                client_id: std::env::var("CLIENT_ID").ok().filter(|s| !s.is_empty()),
                client_secret: std::env::var("CLIENT_SECRET").ok().filter(|s| !s.is_empty()),
                profile_arn: std::env::var("PROFILE_ARN").ok().filter(|s| !s.is_empty()),
            },

            http_proxy: std::env::var("HTTP_PROXY").ok().filter(|s| !s.is_empty()),
            socks5_proxy: std::env::var("SOCKS5_PROXY").ok().filter(|s| !s.is_empty()),

            health_check_interval: args.health_check_interval,
            first_token_timeout: args.first_token_timeout,
            stream_read_timeout: args.stream_read_timeout,
            http_request_timeout: args.http_timeout,

            http_connect_timeout: std::env::var("HTTP_CONNECT_TIMEOUT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(30),

            http_max_connections: std::env::var("HTTP_MAX_CONNECTIONS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(20),

            log_level: args.log_level,

            app_env: std::env::var("APP_ENV").unwrap_or_else(|_| "development".to_string()),
        };

        Ok(config)
    }

    /// Validate configuration; fails fast before anything touches the store
    pub fn validate(&self) -> Result<()> {
        if self.is_production()
            && DEFAULT_ENCRYPT_KEYS.contains(&self.token_encrypt_key.as_str())
        {
            anyhow::bail!(
                "Refusing to start in production with a default/empty TOKEN_ENCRYPT_KEY"
            );
        }

        if !SUPPORTED_REGIONS.contains(&self.region.as_str()) {
            anyhow::bail!(
                "Unsupported REGION '{}' (supported: {})",
                self.region,
                SUPPORTED_REGIONS.join(", ")
            );
        }

        Ok(())
    }

    pub fn is_production(&self) -> bool {
        self.app_env.eq_ignore_ascii_case("production")
    }
}

/// Check whether a region string is in the supported set
pub fn is_supported_region(region: &str) -> bool {
    SUPPORTED_REGIONS.contains(&region)
}
