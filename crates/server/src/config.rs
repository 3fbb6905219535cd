use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use ::config::{builder::DefaultState, Config, ConfigBuilder, Environment, File};
use anyhow::{bail, Context};
use serde::Deserialize;
use shared::domain::CHAT_ROOM;
use url::Url;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub bind_addr: String,
    pub database_url: String,
    pub jwt_secret: String,
    pub token_ttl_seconds: i64,
    pub bcrypt_cost: u32,
    pub write_timeout_ms: u64,
    pub max_frame_bytes: usize,
    pub max_body_bytes: usize,
    pub relay_url: Option<String>,
    pub relay_channel: String,
    pub relay_queue_capacity: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".into(),
            database_url: "sqlite://./data/chat.db".into(),
            jwt_secret: "dev-secret-change-me".into(),
            token_ttl_seconds: 24 * 60 * 60,
            bcrypt_cost: 12,
            write_timeout_ms: 5_000,
            max_frame_bytes: 16 * 1024 * 1024,
            max_body_bytes: 64 * 1024,
            relay_url: None,
            relay_channel: CHAT_ROOM.into(),
            relay_queue_capacity: 1024,
        }
    }
}

impl Settings {
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    /// Parsed relay endpoint; `None` when forwarding is disabled.
    pub fn relay_endpoint(&self) -> anyhow::Result<Option<Url>> {
        match self.relay_url.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(raw) => {
                let url = Url::parse(raw).with_context(|| format!("invalid relay_url '{raw}'"))?;
                if !matches!(url.scheme(), "http" | "https") {
                    bail!("relay_url must be http or https, got '{}'", url.scheme());
                }
                Ok(Some(url))
            }
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.jwt_secret.trim().is_empty() {
            bail!("jwt_secret cannot be empty");
        }
        if self.token_ttl_seconds <= 0 {
            bail!("token_ttl_seconds must be positive");
        }
        if self.write_timeout_ms == 0 {
            bail!("write_timeout_ms must be positive");
        }
        if !(4..=31).contains(&self.bcrypt_cost) {
            bail!("bcrypt_cost must be between 4 and 31");
        }
        self.relay_endpoint()?;
        Ok(())
    }
}

/// Defaults, then an optional `server.toml`, then `APP__*` environment
/// variables.
pub fn load_settings() -> anyhow::Result<Settings> {
    let builder = Config::builder()
        .add_source(File::with_name("server").required(false))
        .add_source(
            Environment::with_prefix("APP")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );
    load_settings_from(builder)
}

pub fn load_settings_from(builder: ConfigBuilder<DefaultState>) -> anyhow::Result<Settings> {
    let settings: Settings = builder
        .build()
        .context("failed to read configuration")?
        .try_deserialize()
        .context("invalid configuration")?;
    settings.validate()?;
    Ok(settings)
}

pub fn prepare_database_url(raw_database_url: &str) -> anyhow::Result<String> {
    let database_url = normalize_database_url(raw_database_url);
    ensure_parent_dir_exists(&database_url)?;
    Ok(database_url)
}

fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return Settings::default().database_url;
    }

    if raw_database_url.starts_with("sqlite:") || raw_database_url.contains("://") {
        return raw_database_url.replace('\\', "/");
    }

    format!("sqlite://{}", raw_database_url.replace('\\', "/"))
}

fn ensure_parent_dir_exists(database_url: &str) -> anyhow::Result<()> {
    let Some(parent) = sqlite_path(database_url).and_then(|p| p.parent().map(Path::to_path_buf))
    else {
        return Ok(());
    };
    if parent.as_os_str().is_empty() {
        return Ok(());
    }

    fs::create_dir_all(&parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url.starts_with("sqlite::memory:") || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
