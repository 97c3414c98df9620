use anyhow::{Context, Result, anyhow, bail};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
};

pub const DEFAULT_ENV_FILE: &str = ".env";
pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_API_KEY: &str = "martik";
pub const DEFAULT_SQLITE_PATH: &str = "data/minitube.db";
pub const DEFAULT_JSON_PATH: &str = "data.json";
pub const DEFAULT_PUBLIC_DIR: &str = "public";
pub const DEFAULT_DOCS_DIR: &str = "docs";
pub const DEFAULT_CLOUDINARY_FOLDER: &str = "uploads";
pub const DEFAULT_UPLOAD_LIMIT_MB: usize = 100;

/// Which datastore backs the API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Sqlite,
    Json,
}

/// Where uploaded attachments end up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaBackend {
    Local,
    Cloudinary(CloudinaryCredentials),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudinaryCredentials {
    pub cloud_name: String,
    pub api_key: String,
    pub api_secret: String,
    pub folder: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Process-wide settings, resolved once at startup and handed to the router.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub api_key: String,
    pub store: StoreBackend,
    pub database_path: PathBuf,
    pub media: MediaBackend,
    pub public_dir: PathBuf,
    pub docs_dir: PathBuf,
    pub upload_limit_bytes: usize,
    pub log_format: LogFormat,
}

/// Reads a `KEY=value` env file. Returns `None` when the file does not exist.
pub fn read_env_file(path: &Path) -> Result<Option<HashMap<String, String>>> {
    if !path.exists() {
        return Ok(None);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    let mut values = HashMap::new();
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let trimmed = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        if let Some((key, value_raw)) = trimmed.split_once('=') {
            let value = value_raw.trim().trim_matches('"').trim_matches('\'');
            values.insert(key.trim().to_string(), value.to_string());
        }
    }
    Ok(Some(values))
}

impl Config {
    /// Loads the env file (if any) and overlays the process environment.
    pub fn load() -> Result<Self> {
        let env_file = env::var("MINITUBE_ENV_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_ENV_FILE));
        let mut values = read_env_file(&env_file)?.unwrap_or_default();
        values.extend(env::vars());
        Self::from_lookup(|key| values.get(key).cloned())
    }

    /// Builds the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let host = get("HOST").unwrap_or_else(|| DEFAULT_HOST.to_string());
        let port = match get("PORT") {
            Some(value) => value
                .trim()
                .parse::<u16>()
                .with_context(|| format!("Parsing PORT value {value:?}"))?,
            None => DEFAULT_PORT,
        };
        let api_key = get("API_KEY").unwrap_or_else(|| DEFAULT_API_KEY.to_string());

        let store = match get("STORE_BACKEND").as_deref().map(str::to_ascii_lowercase) {
            None => StoreBackend::Sqlite,
            Some(name) => match name.as_str() {
                "sqlite" => StoreBackend::Sqlite,
                "json" => StoreBackend::Json,
                other => bail!("unknown STORE_BACKEND {other:?}; expected sqlite or json"),
            },
        };
        let database_path = get("DATABASE_PATH").map(PathBuf::from).unwrap_or_else(|| {
            PathBuf::from(match store {
                StoreBackend::Sqlite => DEFAULT_SQLITE_PATH,
                StoreBackend::Json => DEFAULT_JSON_PATH,
            })
        });

        let media = match get("MEDIA_BACKEND").as_deref().map(str::to_ascii_lowercase) {
            None => MediaBackend::Local,
            Some(name) => match name.as_str() {
                "local" => MediaBackend::Local,
                "cloudinary" => {
                    let required = |key: &str| {
                        get(key).ok_or_else(|| {
                            anyhow!("{key} must be set when MEDIA_BACKEND=cloudinary")
                        })
                    };
                    MediaBackend::Cloudinary(CloudinaryCredentials {
                        cloud_name: required("CLOUDINARY_CLOUD_NAME")?,
                        api_key: required("CLOUDINARY_API_KEY")?,
                        api_secret: required("CLOUDINARY_API_SECRET")?,
                        folder: get("CLOUDINARY_FOLDER")
                            .unwrap_or_else(|| DEFAULT_CLOUDINARY_FOLDER.to_string()),
                    })
                }
                other => bail!("unknown MEDIA_BACKEND {other:?}; expected local or cloudinary"),
            },
        };

        let public_dir = get("PUBLIC_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_PUBLIC_DIR));
        let docs_dir = get("DOCS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DOCS_DIR));

        let upload_limit_mb = match get("UPLOAD_LIMIT_MB") {
            Some(value) => value
                .trim()
                .parse::<usize>()
                .with_context(|| format!("Parsing UPLOAD_LIMIT_MB value {value:?}"))?,
            None => DEFAULT_UPLOAD_LIMIT_MB,
        };

        let log_format = match get("LOG_FORMAT").as_deref() {
            Some(value) if value.eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Text,
        };

        Ok(Self {
            host,
            port,
            api_key,
            store,
            database_path,
            media,
            public_dir,
            docs_dir,
            upload_limit_bytes: upload_limit_mb.saturating_mul(1024 * 1024),
            log_format,
        })
    }
}
