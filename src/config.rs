use anyhow::{Context, Result};
use clap::Parser;
use std::{env, str::FromStr};

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    pub session_ttl_hours: i64,
    pub min_password_len: usize,
    pub reconcile_grace_secs: i64,
    pub storage_limit_bytes: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 3000,
            storage_dir: "./data/objects".into(),
            database_url: "sqlite://./data/meta/cloud_backup.db".into(),
            session_ttl_hours: 24,
            min_password_len: 6,
            reconcile_grace_secs: 600,
            storage_limit_bytes: 5 * 1024 * 1024 * 1024,
        }
    }
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Per-user cloud file backup service")]
pub struct Args {
    /// Host to bind to (overrides CLOUD_BACKUP_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides CLOUD_BACKUP_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where objects are stored (overrides CLOUD_BACKUP_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides CLOUD_BACKUP_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Session lifetime in hours (overrides CLOUD_BACKUP_SESSION_TTL_HOURS)
    #[arg(long)]
    pub session_ttl_hours: Option<i64>,

    /// Minimum password length at signup (overrides CLOUD_BACKUP_MIN_PASSWORD_LEN)
    #[arg(long)]
    pub min_password_len: Option<usize>,

    /// Age in seconds before an unreferenced object counts as orphaned
    /// (overrides CLOUD_BACKUP_RECONCILE_GRACE_SECS)
    #[arg(long)]
    pub reconcile_grace_secs: Option<i64>,

    /// Per-user storage limit reported by /stats (overrides CLOUD_BACKUP_STORAGE_LIMIT_BYTES)
    #[arg(long)]
    pub storage_limit_bytes: Option<u64>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();
        let defaults = Self::default();

        // --- Environment fallback ---
        let env_host = env::var("CLOUD_BACKUP_HOST").unwrap_or(defaults.host);
        let env_port = env_or("CLOUD_BACKUP_PORT", defaults.port)?;
        let env_storage = env::var("CLOUD_BACKUP_STORAGE_DIR").unwrap_or(defaults.storage_dir);
        let env_db = env::var("CLOUD_BACKUP_DATABASE_URL").unwrap_or(defaults.database_url);
        let env_ttl = env_or("CLOUD_BACKUP_SESSION_TTL_HOURS", defaults.session_ttl_hours)?;
        let env_min_password =
            env_or("CLOUD_BACKUP_MIN_PASSWORD_LEN", defaults.min_password_len)?;
        let env_grace = env_or(
            "CLOUD_BACKUP_RECONCILE_GRACE_SECS",
            defaults.reconcile_grace_secs,
        )?;
        let env_limit = env_or(
            "CLOUD_BACKUP_STORAGE_LIMIT_BYTES",
            defaults.storage_limit_bytes,
        )?;

        // --- Merge ---
        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            database_url: args.database_url.unwrap_or(env_db),
            session_ttl_hours: args.session_ttl_hours.unwrap_or(env_ttl),
            min_password_len: args.min_password_len.unwrap_or(env_min_password),
            reconcile_grace_secs: args.reconcile_grace_secs.unwrap_or(env_grace),
            storage_limit_bytes: args.storage_limit_bytes.unwrap_or(env_limit),
        };

        if cfg.session_ttl_hours <= 0 {
            anyhow::bail!("session TTL must be positive, got {}", cfg.session_ttl_hours);
        }

        Ok((cfg, args.migrate))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn env_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => parse_value(name, &value),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}

fn parse_value<T>(name: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse::<T>()
        .with_context(|| format!("parsing {} value `{}`", name, value))
}
