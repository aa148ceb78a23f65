// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Runtime Configuration
//!
//! Environment variable names, default values, and the [`AppConfig`] parsed
//! from them at startup.
//!
//! ## Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `DATA_DIR` | Root directory for blobs and the metadata database | `/data` |
//! | `HOST` | Server bind address | `0.0.0.0` |
//! | `PORT` | Server bind port | `8080` |
//! | `PUBLIC_BASE_URL` | Base of issued direct-access links | `http://{HOST}:{PORT}/` |
//! | `URL_SIGNING_SECRET` | HMAC key for direct-access links (>= 32 bytes) | Ephemeral, links die on restart |
//! | `STORAGE_BACKEND` | `fs`, `memory` or `s3` | `fs` |
//! | `S3_ENDPOINT` | S3 endpoint URL | Required for `s3` |
//! | `S3_REGION` | S3 region | `us-east-1` |
//! | `S3_BUCKET` | S3 bucket | Required for `s3` |
//! | `S3_ACCESS_KEY_ID` | S3 access key | Required for `s3` |
//! | `S3_SECRET_ACCESS_KEY` | S3 secret key | Required for `s3` |
//! | `S3_FORCE_PATH_STYLE` | Path-style bucket addressing | `true` |
//! | `STORE_CALL_TIMEOUT_SECS` | Per store call timeout, `0` disables | `30` |
//! | `MAX_DOWNLOAD_URL_TTL_SECS` | Longest direct-access link lifetime | `604800` |
//! | `ORPHAN_SWEEP_INTERVAL_SECS` | Enables the orphan sweeper | Unset (disabled) |
//! | `ORPHAN_GRACE_SECS` | Minimum orphan age before deletion | `3600` |
//! | `LOG_FORMAT` | Logging format (`json` or `pretty`) | `pretty` |
//! | `RUST_LOG` | Log level filter | `info,tower_http=debug` |

use std::path::PathBuf;
use std::time::Duration;

use url::Url;
use uuid::Uuid;

use crate::storage::presign::MIN_SECRET_LEN;
use crate::storage::StoragePaths;

/// Environment variable name for the data directory path.
pub const DATA_DIR_ENV: &str = "DATA_DIR";
pub const HOST_ENV: &str = "HOST";
pub const PORT_ENV: &str = "PORT";
pub const PUBLIC_BASE_URL_ENV: &str = "PUBLIC_BASE_URL";
/// Secret for signing direct-access links. Must stay stable across restarts
/// for issued links to remain valid.
pub const URL_SIGNING_SECRET_ENV: &str = "URL_SIGNING_SECRET";
pub const STORAGE_BACKEND_ENV: &str = "STORAGE_BACKEND";
pub const S3_ENDPOINT_ENV: &str = "S3_ENDPOINT";
pub const S3_REGION_ENV: &str = "S3_REGION";
pub const S3_BUCKET_ENV: &str = "S3_BUCKET";
pub const S3_ACCESS_KEY_ID_ENV: &str = "S3_ACCESS_KEY_ID";
pub const S3_SECRET_ACCESS_KEY_ENV: &str = "S3_SECRET_ACCESS_KEY";
pub const S3_FORCE_PATH_STYLE_ENV: &str = "S3_FORCE_PATH_STYLE";
pub const STORE_CALL_TIMEOUT_ENV: &str = "STORE_CALL_TIMEOUT_SECS";
pub const MAX_URL_TTL_ENV: &str = "MAX_DOWNLOAD_URL_TTL_SECS";
pub const ORPHAN_SWEEP_INTERVAL_ENV: &str = "ORPHAN_SWEEP_INTERVAL_SECS";
pub const ORPHAN_GRACE_ENV: &str = "ORPHAN_GRACE_SECS";
pub const LOG_FORMAT_ENV: &str = "LOG_FORMAT";

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 8080;
const DEFAULT_S3_REGION: &str = "us-east-1";
const DEFAULT_CALL_TIMEOUT_SECS: u64 = 30;
const DEFAULT_MAX_URL_TTL_SECS: u64 = 7 * 24 * 60 * 60;
const DEFAULT_ORPHAN_GRACE_SECS: u64 = 60 * 60;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{var} is required")]
    Missing { var: &'static str },

    #[error("{var}={value:?} is invalid: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Where blobs are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    /// Local directory tree plus redb metadata under `DATA_DIR`.
    Fs,
    /// Process memory. Everything is lost on exit.
    Memory,
    /// S3-compatible bucket plus redb metadata under `DATA_DIR`.
    S3,
}

/// Connection settings for the `s3` backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3Config {
    pub endpoint: String,
    pub region: String,
    pub bucket: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub force_path_style: bool,
}

/// Opt-in orphan sweep schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepConfig {
    pub interval: Duration,
    pub grace: Duration,
}

#[derive(Clone)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    pub host: String,
    pub port: u16,
    pub public_base_url: Url,
    pub signing_secret: Vec<u8>,
    /// Whether `signing_secret` was generated at startup.
    pub ephemeral_secret: bool,
    pub backend: StorageBackend,
    pub s3: Option<S3Config>,
    pub call_timeout: Option<Duration>,
    pub max_url_ttl: Duration,
    pub sweep: Option<SweepConfig>,
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("data_dir", &self.data_dir)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("public_base_url", &self.public_base_url.as_str())
            .field("ephemeral_secret", &self.ephemeral_secret)
            .field("backend", &self.backend)
            .field("call_timeout", &self.call_timeout)
            .field("max_url_ttl", &self.max_url_ttl)
            .field("sweep", &self.sweep)
            .finish_non_exhaustive()
    }
}

fn invalid(var: &'static str, value: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        var,
        value: value.to_string(),
        reason: reason.into(),
    }
}

fn parse_secs(var: &'static str, value: &str) -> Result<u64, ConfigError> {
    value
        .trim()
        .parse::<u64>()
        .map_err(|e| invalid(var, value, e.to_string()))
}

fn parse_bool(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid(var, value, "expected a boolean")),
    }
}

impl AppConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Load from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());
        let required = |var: &'static str| get(var).ok_or(ConfigError::Missing { var });

        let data_dir = get(DATA_DIR_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| StoragePaths::default().root().to_path_buf());
        let host = get(HOST_ENV).unwrap_or_else(|| DEFAULT_HOST.to_string());
        let port = match get(PORT_ENV) {
            Some(value) => value
                .trim()
                .parse::<u16>()
                .map_err(|e| invalid(PORT_ENV, &value, e.to_string()))?,
            None => DEFAULT_PORT,
        };

        let public_base_url = match get(PUBLIC_BASE_URL_ENV) {
            Some(value) => Url::parse(&value).map_err(|e| invalid(PUBLIC_BASE_URL_ENV, &value, e.to_string()))?,
            None => {
                let value = format!("http://{host}:{port}/");
                Url::parse(&value).map_err(|e| invalid(HOST_ENV, &host, e.to_string()))?
            }
        };
        if public_base_url.cannot_be_a_base() {
            return Err(invalid(
                PUBLIC_BASE_URL_ENV,
                public_base_url.as_str(),
                "must be an absolute base URL",
            ));
        }

        let (signing_secret, ephemeral_secret) = match get(URL_SIGNING_SECRET_ENV) {
            Some(value) if value.len() < MIN_SECRET_LEN => {
                return Err(invalid(
                    URL_SIGNING_SECRET_ENV,
                    "<redacted>",
                    format!("must be at least {MIN_SECRET_LEN} bytes"),
                ));
            }
            Some(value) => (value.into_bytes(), false),
            None => {
                let mut secret = Uuid::new_v4().into_bytes().to_vec();
                secret.extend_from_slice(Uuid::new_v4().as_bytes());
                (secret, true)
            }
        };

        let backend = match get(STORAGE_BACKEND_ENV).as_deref().map(str::trim) {
            None | Some("fs") => StorageBackend::Fs,
            Some("memory") => StorageBackend::Memory,
            Some("s3") => StorageBackend::S3,
            Some(other) => {
                return Err(invalid(
                    STORAGE_BACKEND_ENV,
                    other,
                    "expected one of fs, memory, s3",
                ))
            }
        };

        let s3 = if backend == StorageBackend::S3 {
            Some(S3Config {
                endpoint: required(S3_ENDPOINT_ENV)?,
                region: get(S3_REGION_ENV).unwrap_or_else(|| DEFAULT_S3_REGION.to_string()),
                bucket: required(S3_BUCKET_ENV)?,
                access_key_id: required(S3_ACCESS_KEY_ID_ENV)?,
                secret_access_key: required(S3_SECRET_ACCESS_KEY_ENV)?,
                force_path_style: match get(S3_FORCE_PATH_STYLE_ENV) {
                    Some(value) => parse_bool(S3_FORCE_PATH_STYLE_ENV, &value)?,
                    None => true,
                },
            })
        } else {
            None
        };

        let call_timeout = match get(STORE_CALL_TIMEOUT_ENV) {
            Some(value) => parse_secs(STORE_CALL_TIMEOUT_ENV, &value)?,
            None => DEFAULT_CALL_TIMEOUT_SECS,
        };
        let call_timeout = (call_timeout > 0).then(|| Duration::from_secs(call_timeout));

        let max_url_ttl = match get(MAX_URL_TTL_ENV) {
            Some(value) => match parse_secs(MAX_URL_TTL_ENV, &value)? {
                0 => return Err(invalid(MAX_URL_TTL_ENV, &value, "must be positive")),
                secs => secs,
            },
            None => DEFAULT_MAX_URL_TTL_SECS,
        };

        let sweep = match get(ORPHAN_SWEEP_INTERVAL_ENV) {
            Some(value) => {
                let interval = parse_secs(ORPHAN_SWEEP_INTERVAL_ENV, &value)?;
                if interval == 0 {
                    return Err(invalid(ORPHAN_SWEEP_INTERVAL_ENV, &value, "must be positive"));
                }
                let grace = match get(ORPHAN_GRACE_ENV) {
                    Some(value) => parse_secs(ORPHAN_GRACE_ENV, &value)?,
                    None => DEFAULT_ORPHAN_GRACE_SECS,
                };
                Some(SweepConfig {
                    interval: Duration::from_secs(interval),
                    grace: Duration::from_secs(grace),
                })
            }
            None => None,
        };

        Ok(Self {
            data_dir,
            host,
            port,
            public_base_url,
            signing_secret,
            ephemeral_secret,
            backend,
            s3,
            call_timeout,
            max_url_ttl: Duration::from_secs(max_url_ttl),
            sweep,
        })
    }

    pub fn storage_paths(&self) -> StoragePaths {
        StoragePaths::new(&self.data_dir)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
