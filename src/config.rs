use crate::providers::{b2::B2Config, r2::R2Config};
use crate::services::{selector::MigrationPolicy, upload_service::SessionSettings};
use anyhow::{Context, Result, bail};
use clap::Parser;
use std::{env, fmt, str::FromStr, time::Duration};

const MIB: i64 = 1024 * 1024;
const GIB: i64 = 1024 * MIB;

/// Smallest non-final part either backend accepts.
pub const MIN_PART_SIZE: i64 = 5 * MIB;

/// S3 caps presigned URLs at seven days.
const MAX_URL_EXPIRY_SECS: u64 = 7 * 24 * 60 * 60;

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub chunk_size: i64,
    pub large_file_threshold: i64,
    pub popularity_threshold: i64,
    pub ttl_days: i64,
    pub url_expiry: Duration,
    pub max_part_size: i64,
    pub abort_grace: Duration,
    pub reap_interval: Duration,
    pub jwt_secret: String,
    /// `None` when any B2 credential is missing.
    pub b2: Option<B2Config>,
    /// `None` when any R2 credential is missing.
    pub r2: Option<R2Config>,
}

// Hand-written so secrets never reach the logs.
impl fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database_url", &self.database_url)
            .field("chunk_size", &self.chunk_size)
            .field("large_file_threshold", &self.large_file_threshold)
            .field("popularity_threshold", &self.popularity_threshold)
            .field("ttl_days", &self.ttl_days)
            .field("url_expiry", &self.url_expiry)
            .field("max_part_size", &self.max_part_size)
            .field("abort_grace", &self.abort_grace)
            .field("reap_interval", &self.reap_interval)
            .field("b2_bucket", &self.b2.as_ref().map(|b| &b.bucket_name))
            .field("r2_bucket", &self.r2.as_ref().map(|r| &r.bucket))
            .finish_non_exhaustive()
    }
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Multi-provider chunked upload broker")]
pub struct Args {
    /// Host to bind to (overrides UPLOAD_BROKER_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides UPLOAD_BROKER_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Database URL (overrides UPLOAD_BROKER_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Chunk size in bytes (overrides CHUNK_SIZE)
    #[arg(long)]
    pub chunk_size: Option<i64>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();
        let migrate = args.migrate;
        let cfg = Self::from_sources(args, |name| env::var(name).ok())?;
        Ok((cfg, migrate))
    }

    /// Merge CLI args over values produced by `lookup`, then validate.
    pub fn from_sources(args: Args, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let env_host = lookup("UPLOAD_BROKER_HOST").unwrap_or_else(|| "0.0.0.0".into());
        let env_port = parse_or(&lookup, "UPLOAD_BROKER_PORT", 3000u16)?;
        let env_db = lookup("UPLOAD_BROKER_DATABASE_URL")
            .unwrap_or_else(|| "sqlite://./data/upload_broker.db".into());
        let env_chunk = parse_or(&lookup, "CHUNK_SIZE", 8 * MIB)?;

        let url_expiry_secs = parse_or(&lookup, "PRESIGNED_URL_EXPIRY", MAX_URL_EXPIRY_SECS)?;
        let url_expiry = Duration::from_secs(url_expiry_secs);

        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            database_url: args.database_url.unwrap_or(env_db),
            chunk_size: args.chunk_size.unwrap_or(env_chunk),
            large_file_threshold: parse_or(&lookup, "THRESHOLD_LARGE_FILE", 100 * MIB)?,
            popularity_threshold: parse_or(&lookup, "POPULARITY_MIGRATION_THRESHOLD", 10)?,
            ttl_days: parse_or(&lookup, "FILE_TTL_DAYS", 3)?,
            url_expiry,
            max_part_size: parse_or(&lookup, "MAX_PART_SIZE", 5 * GIB)?,
            abort_grace: Duration::from_secs(parse_or(&lookup, "ABORT_GRACE_SECS", 3600)?),
            reap_interval: Duration::from_secs(parse_or(&lookup, "REAP_INTERVAL_SECS", 300)?),
            jwt_secret: lookup("JWT_SECRET")
                .filter(|s| !s.is_empty())
                .context("JWT_SECRET must be set")?,
            b2: b2_config(&lookup, url_expiry),
            r2: r2_config(&lookup, url_expiry),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.max_part_size < MIN_PART_SIZE {
            bail!("MAX_PART_SIZE must be at least {MIN_PART_SIZE} bytes");
        }
        if !(MIN_PART_SIZE..=self.max_part_size).contains(&self.chunk_size) {
            bail!(
                "CHUNK_SIZE {} must be between {} and {} bytes",
                self.chunk_size,
                MIN_PART_SIZE,
                self.max_part_size
            );
        }
        if self.large_file_threshold <= 0 {
            bail!("THRESHOLD_LARGE_FILE must be positive");
        }
        if self.popularity_threshold <= 0 {
            bail!("POPULARITY_MIGRATION_THRESHOLD must be positive");
        }
        if self.ttl_days <= 0 {
            bail!("FILE_TTL_DAYS must be positive");
        }
        let secs = self.url_expiry.as_secs();
        if secs == 0 || secs > MAX_URL_EXPIRY_SECS {
            bail!("PRESIGNED_URL_EXPIRY must be between 1 and {MAX_URL_EXPIRY_SECS} seconds");
        }
        if self.reap_interval.is_zero() {
            bail!("REAP_INTERVAL_SECS must be positive");
        }
        Ok(())
    }

    pub fn session_settings(&self) -> Result<SessionSettings> {
        Ok(SessionSettings {
            chunk_size: self.chunk_size,
            large_file_threshold: self.large_file_threshold,
            session_ttl: chrono::Duration::days(self.ttl_days),
            abort_grace: chrono::Duration::from_std(self.abort_grace)
                .context("ABORT_GRACE_SECS out of range")?,
            migration: MigrationPolicy::new(self.popularity_threshold),
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(name) {
        Some(value) => value
            .trim()
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        None => Ok(default),
    }
}

fn b2_config(lookup: &impl Fn(&str) -> Option<String>, url_expiry: Duration) -> Option<B2Config> {
    Some(B2Config {
        key_id: lookup("B2_KEY_ID")?,
        application_key: lookup("B2_APPLICATION_KEY")?,
        bucket_id: lookup("B2_BUCKET_ID")?,
        bucket_name: lookup("B2_BUCKET_NAME")?,
        url_expiry,
        api_base: None,
    })
}

fn r2_config(lookup: &impl Fn(&str) -> Option<String>, url_expiry: Duration) -> Option<R2Config> {
    Some(R2Config {
        account_id: lookup("R2_ACCOUNT_ID")?,
        access_key_id: lookup("R2_ACCESS_KEY_ID")?,
        secret_access_key: lookup("R2_SECRET_ACCESS_KEY")?,
        bucket: lookup("R2_BUCKET_NAME")?,
        url_expiry,
        endpoint: None,
    })
}
