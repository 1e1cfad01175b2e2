use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::{bail, Context};
use chat_core::{DEFAULT_MEDIA_BUCKET, DEFAULT_PAGE_SIZE};
use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendMode {
    Local,
    Hosted,
}

impl FromStr for BackendMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" | "sqlite" => Ok(BackendMode::Local),
            "hosted" | "remote" | "supabase" => Ok(BackendMode::Hosted),
            other => bail!("unknown backend '{other}', expected local or hosted"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub backend: BackendMode,
    pub backend_url: Option<String>,
    pub anon_key: Option<String>,
    pub access_token: Option<String>,
    pub database_url: String,
    pub media_dir: PathBuf,
    pub media_bucket: String,
    pub push_url: Option<String>,
    pub page_size: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            backend: BackendMode::Local,
            backend_url: None,
            anon_key: None,
            access_token: None,
            database_url: "sqlite://./data/chat.db".into(),
            media_dir: PathBuf::from("./data/media"),
            media_bucket: DEFAULT_MEDIA_BUCKET.into(),
            push_url: None,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileSettings {
    backend: Option<String>,
    backend_url: Option<String>,
    anon_key: Option<String>,
    access_token: Option<String>,
    database_url: Option<String>,
    media_dir: Option<PathBuf>,
    media_bucket: Option<String>,
    push_url: Option<String>,
    page_size: Option<u64>,
}

pub fn load_settings(config_path: &Path) -> anyhow::Result<Settings> {
    load_settings_with(config_path, |key| std::env::var(key).ok())
}

/// Defaults, then the TOML file if present, then `CHAT_*` and `APP__*`
/// variables (the latter win).
pub fn load_settings_with(
    config_path: &Path,
    env: impl Fn(&str) -> Option<String>,
) -> anyhow::Result<Settings> {
    let mut settings = Settings::default();

    match fs::read_to_string(config_path) {
        Ok(raw) => {
            let file: FileSettings = toml::from_str(&raw)
                .with_context(|| format!("invalid config file '{}'", config_path.display()))?;
            apply_file(&mut settings, file)?;
        }
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to read config file '{}'", config_path.display()))
        }
    }

    let lookup = |name: &str| env(&format!("APP__{name}")).or_else(|| env(&format!("CHAT_{name}")));

    if let Some(v) = lookup("BACKEND") {
        settings.backend = v.parse()?;
    }
    if let Some(v) = lookup("BACKEND_URL") {
        settings.backend_url = Some(v);
    }
    if let Some(v) = lookup("ANON_KEY") {
        settings.anon_key = Some(v);
    }
    if let Some(v) = lookup("ACCESS_TOKEN") {
        settings.access_token = Some(v);
    }
    if let Some(v) = lookup("DATABASE_URL") {
        settings.database_url = v;
    }
    if let Some(v) = lookup("MEDIA_DIR") {
        settings.media_dir = PathBuf::from(v);
    }
    if let Some(v) = lookup("MEDIA_BUCKET") {
        settings.media_bucket = v;
    }
    if let Some(v) = lookup("PUSH_URL") {
        settings.push_url = Some(v);
    }
    if let Some(v) = lookup("PAGE_SIZE") {
        settings.page_size = v
            .parse()
            .with_context(|| format!("page size must be a positive integer, got '{v}'"))?;
    }

    if settings.page_size == 0 {
        bail!("page size must be greater than zero");
    }
    if settings.database_url.trim().is_empty() {
        settings.database_url = Settings::default().database_url;
    }
    Ok(settings)
}

fn apply_file(settings: &mut Settings, file: FileSettings) -> anyhow::Result<()> {
    if let Some(v) = file.backend {
        settings.backend = v.parse()?;
    }
    if file.backend_url.is_some() {
        settings.backend_url = file.backend_url;
    }
    if file.anon_key.is_some() {
        settings.anon_key = file.anon_key;
    }
    if file.access_token.is_some() {
        settings.access_token = file.access_token;
    }
    if let Some(v) = file.database_url {
        settings.database_url = v;
    }
    if let Some(v) = file.media_dir {
        settings.media_dir = v;
    }
    if let Some(v) = file.media_bucket {
        settings.media_bucket = v;
    }
    if file.push_url.is_some() {
        settings.push_url = file.push_url;
    }
    if let Some(v) = file.page_size {
        settings.page_size = v;
    }
    Ok(())
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
