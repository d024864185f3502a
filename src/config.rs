use std::{env, fmt::Display, path::PathBuf, str::FromStr};

use tracing::{info, warn};

// === Limits ===
pub const MAX_THUMBNAIL_BYTES: usize = 2_000_000;
pub const MAX_AVATAR_BYTES: usize = 500_000;
pub const MIN_PASSWORD_LENGTH: usize = 6;
pub const MIN_DESCRIPTION_LENGTH: usize = 12;

// === Multipart forms ===
pub const MAX_FORM_BYTES: usize = 8_000_000;
pub const MAX_FORM_PARTS: usize = 16;
pub const MAX_TEXT_FIELD_BYTES: usize = 64 * 1024;

// === Store keys ===
pub const DATABASE_FILE: &str = "quill.db";
pub const USERS_LIST_KEY: &str = "users_list";
pub const POSTS_LIST_KEY: &str = "posts_list";

pub fn user_key(id: &str) -> String {
    format!("user:{}", id)
}

pub fn post_key(id: &str) -> String {
    format!("post:{}", id)
}

pub fn email_key(email: &str) -> String {
    format!("email:{}", email)
}

pub fn token_expiration_hours() -> i64 {
    env::var("QUILL_TOKEN_EXPIRATION_HOURS")
        .ok()
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap_or(24)
}

/// Process-level settings read from the environment at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    /// Directory for the on-disk document store. `None` keeps everything in memory.
    pub data_dir: Option<PathBuf>,
    pub uploads_dir: PathBuf,
    pub jwt_secret: Option<String>,
    pub token_expiration_hours: i64,
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let data_dir: String = try_load("QUILL_DATA_DIR", "data")?;

        Ok(Self {
            bind: try_load("QUILL_BIND", "0.0.0.0:5000")?,
            data_dir: (!data_dir.is_empty()).then(|| PathBuf::from(data_dir)),
            uploads_dir: PathBuf::from(try_load::<String>("QUILL_UPLOADS_DIR", "uploads")?),
            jwt_secret: env::var("QUILL_JWT_SECRET").ok().filter(|s| !s.is_empty()),
            token_expiration_hours: token_expiration_hours(),
        })
    }
}

fn try_load<T: FromStr>(key: &str, default: &str) -> anyhow::Result<T>
where
    T::Err: Display,
{
    let raw = env::var(key).unwrap_or_else(|_| {
        info!("{key} not set, using default: {default}");
        default.to_string()
    });

    raw.parse().map_err(|e| {
        warn!("Invalid {key} value: {e}");
        anyhow::anyhow!("invalid value for {key}: {e}")
    })
}
