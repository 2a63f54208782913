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
    /// Origin that attachment URLs are built from.
    pub public_base_url: String,
    pub max_object_bytes: usize,
    pub upload_concurrency: usize,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Maintenance records with attached receipts and photos")]
pub struct Args {
    /// Host to bind to (overrides MAINTENANCE_VAULT_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides MAINTENANCE_VAULT_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where attachments are stored (overrides MAINTENANCE_VAULT_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides MAINTENANCE_VAULT_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Public origin for attachment URLs (overrides MAINTENANCE_VAULT_PUBLIC_BASE_URL)
    #[arg(long)]
    pub public_base_url: Option<String>,

    /// Largest accepted attachment in bytes (overrides MAINTENANCE_VAULT_MAX_OBJECT_BYTES)
    #[arg(long)]
    pub max_object_bytes: Option<usize>,

    /// Uploads in flight per staging request (overrides MAINTENANCE_VAULT_UPLOAD_CONCURRENCY)
    #[arg(long)]
    pub upload_concurrency: Option<usize>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

/// Read `name`, falling back to `default` when unset.
fn env_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        Self::merge(Args::parse())
    }

    fn merge(args: Args) -> Result<(Self, bool)> {
        // --- Environment fallback ---
        let env_host = env_or("MAINTENANCE_VAULT_HOST", String::from("0.0.0.0"))?;
        let env_port = env_or("MAINTENANCE_VAULT_PORT", 3000u16)?;
        let env_storage =
            env_or("MAINTENANCE_VAULT_STORAGE_DIR", String::from("./data/objects"))?;
        let env_db = env_or(
            "MAINTENANCE_VAULT_DATABASE_URL",
            String::from("sqlite://./data/meta/maintenance.db"),
        )?;
        let env_base_url = env_or(
            "MAINTENANCE_VAULT_PUBLIC_BASE_URL",
            String::from("http://localhost:3000"),
        )?;
        let env_max_bytes = env_or("MAINTENANCE_VAULT_MAX_OBJECT_BYTES", 25 * 1024 * 1024usize)?;
        let env_concurrency = env_or("MAINTENANCE_VAULT_UPLOAD_CONCURRENCY", 4usize)?;

        // --- Merge ---
        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            database_url: args.database_url.unwrap_or(env_db),
            public_base_url: args
                .public_base_url
                .unwrap_or(env_base_url)
                .trim_end_matches('/')
                .to_string(),
            max_object_bytes: args.max_object_bytes.unwrap_or(env_max_bytes),
            upload_concurrency: args.upload_concurrency.unwrap_or(env_concurrency).max(1),
        };

        Ok((cfg, args.migrate))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
