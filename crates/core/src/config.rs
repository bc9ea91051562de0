use std::net::SocketAddr;
use std::path::PathBuf;

use crate::remote::parse_socks_proxy;
use crate::{Error, Result};

pub const DEFAULT_HTTP_ADDR: &str = "0.0.0.0:8080";
pub const DEFAULT_STREAM_BUFFER_SIZE: usize = 8 * 1024 * 1024;
pub const DEFAULT_DATABASE_PATH: &str = "teledrive.sqlite3";
pub const DEFAULT_FUSE_DIR: &str = "mnt";
pub const DEFAULT_WORKER_CACHE_ROOT: &str = "cache";
pub const DEFAULT_SESSION_DIR: &str = "sessions";

const BOT_API_CHANNEL_OFFSET: i64 = 1_000_000_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub app_id: i32,
    pub app_hash: String,
    pub bot_token: Option<String>,
    pub worker_tokens: Vec<String>,
    pub channel_id: i64,
    pub socks_proxy: Option<String>,
    pub worker_cache_root: PathBuf,
    pub session_dir: PathBuf,
    /// Unset means the helper is looked up next to the running executable.
    pub mtproto_helper: Option<PathBuf>,
    pub stream_buffer_size: usize,
    pub log_level: Option<String>,
    pub log_format: LogFormat,
    pub http_addr: SocketAddr,
    pub api_token: Option<String>,
    pub web_username: Option<String>,
    pub web_password: Option<String>,
    pub database_path: PathBuf,
    pub fuse_dir: PathBuf,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from an arbitrary key lookup. Blank values count as
    /// unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let require = |key: &str| {
            get(key).ok_or_else(|| Error::InvalidConfig {
                message: format!("{key} is required"),
            })
        };

        let app_id = require("APP_ID")?
            .parse::<i32>()
            .map_err(|e| Error::InvalidConfig {
                message: format!("APP_ID must be a 32-bit integer: {e}"),
            })?;
        let app_hash = require("APP_HASH")?;

        let bot_token = get("BOT_TOKEN");
        let mut worker_tokens: Vec<String> = get("WORKER_TOKENS")
            .map(|raw| {
                raw.split(',')
                    .map(|t| t.trim().to_string())
                    .filter(|t| !t.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        if worker_tokens.is_empty()
            && let Some(token) = &bot_token
        {
            worker_tokens.push(token.clone());
        }
        if worker_tokens.is_empty() {
            return Err(Error::InvalidConfig {
                message: "WORKER_TOKENS (or BOT_TOKEN) is required".to_string(),
            });
        }

        let channel_id = parse_channel_id(&require("CHANNEL_ID")?)?;

        let socks_proxy = get("TG_SOCKS_PROXY");
        if let Some(proxy) = &socks_proxy {
            parse_socks_proxy(proxy)?;
        }

        let stream_buffer_size = match get("STREAM_BUFF_SIZE") {
            Some(raw) => raw
                .parse::<usize>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or_else(|| Error::InvalidConfig {
                    message: format!("STREAM_BUFF_SIZE must be a positive byte count, got {raw}"),
                })?,
            None => DEFAULT_STREAM_BUFFER_SIZE,
        };

        let log_format = match get("LOG_FORMAT").as_deref().map(str::to_ascii_lowercase) {
            None => LogFormat::Text,
            Some(f) if f == "text" => LogFormat::Text,
            Some(f) if f == "json" => LogFormat::Json,
            Some(other) => {
                return Err(Error::InvalidConfig {
                    message: format!("LOG_FORMAT must be text or json, got {other}"),
                });
            }
        };

        let http_addr = get("HTTP_ADDR")
            .unwrap_or_else(|| DEFAULT_HTTP_ADDR.to_string())
            .parse::<SocketAddr>()
            .map_err(|e| Error::InvalidConfig {
                message: format!("HTTP_ADDR: {e}"),
            })?;

        let path_or = |key: &str, default: &str| {
            PathBuf::from(get(key).unwrap_or_else(|| default.to_string()))
        };

        Ok(Self {
            app_id,
            app_hash,
            bot_token,
            worker_tokens,
            channel_id,
            socks_proxy,
            worker_cache_root: path_or("WORKER_CACHE_ROOT", DEFAULT_WORKER_CACHE_ROOT),
            session_dir: path_or("SESSION_DIR", DEFAULT_SESSION_DIR),
            mtproto_helper: get("MTPROTO_HELPER").map(PathBuf::from),
            stream_buffer_size,
            log_level: get("LOG_LEVEL"),
            log_format,
            http_addr,
            api_token: get("API_TOKEN"),
            web_username: get("WEB_USERNAME"),
            web_password: get("WEB_PASSWORD"),
            database_path: path_or("DATABASE_PATH", DEFAULT_DATABASE_PATH),
            fuse_dir: path_or("FUSE_DIR", DEFAULT_FUSE_DIR),
        })
    }

    pub fn require_api_token(&self) -> Result<&str> {
        self.api_token.as_deref().ok_or_else(|| Error::InvalidConfig {
            message: "API_TOKEN is required to serve the web API".to_string(),
        })
    }
}

/// Accepts both the bare channel id and the Bot API `-100…` form.
pub fn parse_channel_id(raw: &str) -> Result<i64> {
    let id = raw.trim().parse::<i64>().map_err(|e| Error::InvalidConfig {
        message: format!("CHANNEL_ID must be an integer: {e}"),
    })?;
    let bare = if id <= -(BOT_API_CHANNEL_OFFSET + 1) {
        -id - BOT_API_CHANNEL_OFFSET
    } else {
        id
    };
    if bare <= 0 {
        return Err(Error::InvalidConfig {
            message: format!("CHANNEL_ID {raw} is not a channel id"),
        });
    }
    Ok(bare)
}
