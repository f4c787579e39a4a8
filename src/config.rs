use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use dotenvy::dotenv;
use std::env;

use crate::error::AppError;

/// Sliding-window rate limit settings.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub user_max_per_window: u64,
    pub conversation_max_per_window: u64,
    pub window_secs: u64,
}

/// Presence session settings.
#[derive(Debug, Clone)]
pub struct PresenceConfig {
    pub session_ttl_secs: u64,
    pub ping_interval_secs: u64,
}

/// Offline notification settings.
#[derive(Debug, Clone)]
pub struct NotificationConfig {
    pub offline_delay_secs: u64,
    pub digest_interval_secs: u64,
}

/// Retention sweep settings. The `max_*` values are the platform-wide
/// ceilings per-conversation overrides are validated against.
#[derive(Debug, Clone)]
pub struct RetentionConfig {
    pub message_retention_days: i64,
    pub max_retention_days: i64,
    pub auto_close_days: i64,
    pub max_auto_close_days: i64,
    pub audit_retention_days: i64,
    pub sweep_interval_secs: u64,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    pub port: u16,
    pub server_secret: Vec<u8>,
    pub kdf_memory_kib: u32,
    pub kdf_iterations: u32,
    pub max_participants: usize,
    pub edit_window_minutes: i64,
    pub rate_limit: RateLimitConfig,
    pub presence: PresenceConfig,
    pub notifications: NotificationConfig,
    pub retention: RetentionConfig,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        dotenv().ok();

        // Both stores are optional: without them the service runs on the
        // in-memory backends (single-node / dev).
        let database_url = env::var("DATABASE_URL").ok();
        let redis_url = env::var("REDIS_URL").ok();
        let port = env_parse("PORT", 3000);

        let server_secret_env = env::var("SERVER_SECRET")
            .map_err(|_| AppError::Config("SERVER_SECRET missing (required for key derivation)".into()))?;
        let server_secret = STANDARD
            .decode(server_secret_env.as_bytes())
            .map_err(|e| AppError::Config(format!("SERVER_SECRET decode: {e}")))?;
        if server_secret.len() < 32 {
            return Err(AppError::Config("SERVER_SECRET must be at least 32 bytes".into()));
        }

        Ok(Self {
            database_url,
            redis_url,
            port,
            server_secret,
            kdf_memory_kib: env_parse("KDF_MEMORY_KIB", 64 * 1024),
            kdf_iterations: env_parse("KDF_ITERATIONS", 3),
            max_participants: env_parse("MAX_PARTICIPANTS", 50),
            edit_window_minutes: env_parse("EDIT_WINDOW_MINUTES", 15),
            rate_limit: RateLimitConfig {
                user_max_per_window: env_parse("RATE_LIMIT_USER_MAX", 30),
                conversation_max_per_window: env_parse("RATE_LIMIT_CONVERSATION_MAX", 100),
                window_secs: env_parse("RATE_LIMIT_WINDOW_SECS", 60),
            },
            presence: PresenceConfig {
                session_ttl_secs: env_parse("PRESENCE_TTL_SECS", 120),
                ping_interval_secs: env_parse("PRESENCE_PING_INTERVAL_SECS", 30),
            },
            notifications: NotificationConfig {
                offline_delay_secs: env_parse("NOTIFICATION_DELAY_SECS", 30),
                digest_interval_secs: env_parse("DIGEST_INTERVAL_SECS", 4 * 3600),
            },
            retention: RetentionConfig {
                message_retention_days: env_parse("MESSAGE_RETENTION_DAYS", 730),
                max_retention_days: env_parse("MAX_RETENTION_DAYS", 3650),
                auto_close_days: env_parse("AUTO_CLOSE_DAYS", 90),
                max_auto_close_days: env_parse("MAX_AUTO_CLOSE_DAYS", 365),
                audit_retention_days: env_parse("AUDIT_RETENTION_DAYS", 2555),
                sweep_interval_secs: env_parse("SWEEP_INTERVAL_SECS", 3600),
            },
        })
    }
}
