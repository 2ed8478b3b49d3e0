use crate::services::{ServiceSettings, retry::RetryPolicy};
use anyhow::{Context, Result, bail};
use clap::Parser;
use std::{env, fmt, str::FromStr, time::Duration};
use uuid::Uuid;

/// What the process should do once configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Serve,
    /// Apply the schema and exit.
    Migrate,
    /// Run one garbage-collection sweep and exit.
    Sweep,
}

/// Signing secret; never printed.
#[derive(Clone)]
pub struct Secret(pub String);

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    /// Static shard list. Order matters: it drives workspace placement.
    pub locations: Vec<String>,
    pub small_blob_threshold: u64,
    /// Base URL clients use to reach this service, embedded in signed URLs.
    pub public_url: String,
    pub signing_secret: Secret,
    /// Whether `signing_secret` was generated because none was configured.
    pub ephemeral_secret: bool,
    pub signed_url_ttl_secs: u64,
    pub multipart_ttl_secs: u64,
    pub cache_entries: usize,
    pub cache_max_object_bytes: u64,
    pub sweep_interval_secs: Option<u64>,
    pub sweep_grace_secs: u64,
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Content-addressed blob storage service")]
pub struct Args {
    /// Host to bind to (overrides DATALAKE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides DATALAKE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory holding one bucket per location (overrides DATALAKE_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides DATALAKE_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Comma-separated locations (overrides DATALAKE_LOCATIONS)
    #[arg(long)]
    pub locations: Option<String>,

    /// Largest payload hashed before upload, in bytes (overrides DATALAKE_SMALL_BLOB_THRESHOLD)
    #[arg(long)]
    pub small_blob_threshold: Option<u64>,

    /// Public base URL for signed URLs (overrides DATALAKE_PUBLIC_URL)
    #[arg(long)]
    pub public_url: Option<String>,

    /// Run migrations and exit
    #[arg(long, conflicts_with = "sweep")]
    pub migrate: bool,

    /// Run one garbage-collection sweep and exit
    #[arg(long)]
    pub sweep: bool,
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .with_context(|| format!("parsing {} value `{}`", key, value)),
        None => Ok(None),
    }
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and run mode.
    pub fn from_env_and_args() -> Result<(Self, Mode)> {
        Self::from_parts(Args::parse(), |key| env::var(key).ok())
    }

    /// Merge `args` over `lookup`ed environment values, then defaults.
    pub fn from_parts(args: Args, lookup: impl Fn(&str) -> Option<String>) -> Result<(Self, Mode)> {
        let host = args
            .host
            .or_else(|| lookup("DATALAKE_HOST"))
            .unwrap_or_else(|| "0.0.0.0".into());
        let port = match args.port {
            Some(port) => port,
            None => parse_var(&lookup, "DATALAKE_PORT")?.unwrap_or(3000),
        };
        let storage_dir = args
            .storage_dir
            .or_else(|| lookup("DATALAKE_STORAGE_DIR"))
            .unwrap_or_else(|| "./data/objects".into());
        let database_url = args
            .database_url
            .or_else(|| lookup("DATALAKE_DATABASE_URL"))
            .unwrap_or_else(|| "sqlite://./data/meta/datalake.db".into());

        let locations: Vec<String> = args
            .locations
            .or_else(|| lookup("DATALAKE_LOCATIONS"))
            .unwrap_or_else(|| "weur".into())
            .split(',')
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect();
        if locations.is_empty() {
            bail!("DATALAKE_LOCATIONS must name at least one location");
        }
        if let Some(bad) = locations
            .iter()
            .find(|l| !l.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'))
        {
            bail!("invalid location name `{}`", bad);
        }

        let small_blob_threshold = match args.small_blob_threshold {
            Some(t) => t,
            None => parse_var(&lookup, "DATALAKE_SMALL_BLOB_THRESHOLD")?.unwrap_or(10 * 1024 * 1024),
        };

        let public_url = args
            .public_url
            .or_else(|| lookup("DATALAKE_PUBLIC_URL"))
            .unwrap_or_else(|| {
                let shown = if matches!(host.as_str(), "0.0.0.0" | "::") {
                    "localhost"
                } else {
                    host.as_str()
                };
                format!("http://{}:{}", shown, port)
            });

        let (signing_secret, ephemeral_secret) = match lookup("DATALAKE_SIGNING_SECRET") {
            Some(secret) if !secret.is_empty() => (secret, false),
            _ => (Uuid::new_v4().simple().to_string(), true),
        };

        let cfg = Self {
            host,
            port,
            storage_dir,
            database_url,
            locations,
            small_blob_threshold,
            public_url,
            signing_secret: Secret(signing_secret),
            ephemeral_secret,
            signed_url_ttl_secs: parse_var(&lookup, "DATALAKE_SIGNED_URL_TTL_SECS")?.unwrap_or(3600),
            multipart_ttl_secs: parse_var(&lookup, "DATALAKE_MULTIPART_TTL_SECS")?
                .unwrap_or(7 * 24 * 3600),
            cache_entries: parse_var(&lookup, "DATALAKE_CACHE_ENTRIES")?.unwrap_or(1024),
            cache_max_object_bytes: parse_var(&lookup, "DATALAKE_CACHE_MAX_OBJECT_BYTES")?
                .unwrap_or(1024 * 1024),
            sweep_interval_secs: parse_var::<u64>(&lookup, "DATALAKE_SWEEP_INTERVAL_SECS")?
                .filter(|secs| *secs > 0),
            sweep_grace_secs: parse_var(&lookup, "DATALAKE_SWEEP_GRACE_SECS")?.unwrap_or(3600),
            retry_attempts: parse_var::<u32>(&lookup, "DATALAKE_RETRY_ATTEMPTS")?
                .unwrap_or(3)
                .max(1),
            retry_delay_ms: parse_var(&lookup, "DATALAKE_RETRY_DELAY_MS")?.unwrap_or(50),
        };

        let mode = if args.migrate {
            Mode::Migrate
        } else if args.sweep {
            Mode::Sweep
        } else {
            Mode::Serve
        };
        Ok((cfg, mode))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn settings(&self) -> ServiceSettings {
        ServiceSettings {
            small_blob_threshold: self.small_blob_threshold,
            retry: RetryPolicy {
                max_attempts: self.retry_attempts,
                base_delay: Duration::from_millis(self.retry_delay_ms),
                ..RetryPolicy::default()
            },
            multipart_ttl: chrono::Duration::seconds(self.multipart_ttl_secs as i64),
            sweep_grace: chrono::Duration::seconds(self.sweep_grace_secs as i64),
            ..ServiceSettings::default()
        }
    }

    pub fn signed_url_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.signed_url_ttl_secs as i64)
    }
}
