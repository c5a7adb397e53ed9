// dbbackup/src/config/mod.rs
use anyhow::Context;
use clap::Parser;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use url::Url;

use crate::errors::{AppError, Result};

const DEFAULT_CONFIG_PATH: &str = "config.json";

/// Command-line switches. Every switch can also come from the environment.
#[derive(Debug, Clone, Default, Parser)]
#[command(version, about = "One-shot database backup: dump, compress and optionally upload")]
pub struct CliArgs {
    /// Optional JSON file with the same settings (lowest precedence)
    #[arg(long, env = "CONFIG_PATH")]
    pub config: Option<PathBuf>,

    #[arg(long = "database-type", env = "DATABASE_TYPE")]
    pub database_type: Option<String>,

    #[arg(long, env = "DATABASE_HOST")]
    pub host: Option<String>,

    #[arg(long, env = "DATABASE_PORT")]
    pub port: Option<u16>,

    #[arg(long, env = "DATABASE_USERNAME")]
    pub username: Option<String>,

    #[arg(long, env = "DATABASE_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    #[arg(long, env = "DATABASE_NAME")]
    pub database: Option<String>,

    #[arg(long = "output-path", env = "OUTPUT_PATH")]
    pub output_path: Option<PathBuf>,

    #[arg(long = "backup-location", env = "BACKUP_LOCATION")]
    pub backup_location: Option<String>,

    #[arg(long = "s3-bucket-name", env = "S3_BUCKET_NAME")]
    pub s3_bucket_name: Option<String>,

    #[arg(long = "s3-region", env = "S3_REGION")]
    pub s3_region: Option<String>,

    #[arg(long = "s3-access-key-id", env = "S3_ACCESS_KEY_ID")]
    pub s3_access_key_id: Option<String>,

    #[arg(long = "s3-secret-access-key", env = "S3_SECRET_ACCESS_KEY", hide_env_values = true)]
    pub s3_secret_access_key: Option<String>,

    #[arg(long = "s3-endpoint-url", env = "S3_ENDPOINT_URL")]
    pub s3_endpoint_url: Option<String>,

    #[arg(long = "s3-folder-prefix", env = "S3_FOLDER_PREFIX")]
    pub s3_folder_prefix: Option<String>,
}

// Structs for deserializing config.json
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonS3StorageConfig {
    pub bucket_name: Option<String>,
    pub region: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub endpoint_url: Option<String>,
    pub folder_prefix: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawJsonConfig {
    pub database_type: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub database: Option<String>,
    pub output_path: Option<PathBuf>,
    pub backup_location: Option<String>,
    pub s3_storage: Option<JsonS3StorageConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseEngine {
    Postgres,
    MySql,
}

impl DatabaseEngine {
    pub fn default_port(self) -> u16 {
        match self {
            DatabaseEngine::Postgres => 5432,
            DatabaseEngine::MySql => 3306,
        }
    }
}

impl FromStr for DatabaseEngine {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(DatabaseEngine::Postgres),
            "mysql" => Ok(DatabaseEngine::MySql),
            other => Err(AppError::Config(format!(
                "Unsupported database type '{}'. Expected 'postgres' or 'mysql'.",
                other
            ))),
        }
    }
}

/// Where the compressed backup ends up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackupLocation {
    #[default]
    Local,
    S3,
}

impl FromStr for BackupLocation {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(BackupLocation::Local),
            "s3" => Ok(BackupLocation::S3),
            other => Err(AppError::Config(format!(
                "Unsupported backup location '{}'. Expected 'local' or 's3'.",
                other
            ))),
        }
    }
}

#[derive(Clone)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub database: String,
}

// Keeps the password out of debug logs.
impl std::fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"***")
            .field("database", &self.database)
            .finish()
    }
}

#[derive(Clone)]
pub struct S3StorageConfig {
    pub endpoint_url: String,
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub bucket_name: String,
    pub folder_prefix: Option<String>,
}

impl std::fmt::Debug for S3StorageConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3StorageConfig")
            .field("endpoint_url", &self.endpoint_url)
            .field("region", &self.region)
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"***")
            .field("bucket_name", &self.bucket_name)
            .field("folder_prefix", &self.folder_prefix)
            .finish()
    }
}

/// Fully resolved settings for one backup run.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub engine: DatabaseEngine,
    pub connection: ConnectionConfig,
    pub output_path: PathBuf,
    pub backup_location: BackupLocation,
    pub s3_storage: Option<S3StorageConfig>,
}

impl AppConfig {
    /// Merges CLI/env values over the optional JSON file and validates the result.
    pub fn load(cli: &CliArgs) -> Result<Self> {
        let raw = match &cli.config {
            Some(path) => load_raw_json(path)?,
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_PATH);
                if default_path.is_file() {
                    load_raw_json(default_path)?
                } else {
                    RawJsonConfig::default()
                }
            }
        };
        Self::resolve(cli, raw)
    }

    pub fn resolve(cli: &CliArgs, raw: RawJsonConfig) -> Result<Self> {
        let engine: DatabaseEngine =
            required(cli.database_type.clone().or(raw.database_type), "DATABASE_TYPE", "--database-type")?
                .parse()?;

        let port = cli
            .port
            .or(raw.port)
            .filter(|p| *p != 0)
            .unwrap_or_else(|| engine.default_port());

        let connection = ConnectionConfig {
            host: required(cli.host.clone().or(raw.host), "DATABASE_HOST", "--host")?,
            port,
            username: required(cli.username.clone().or(raw.username), "DATABASE_USERNAME", "--username")?,
            password: required(cli.password.clone().or(raw.password), "DATABASE_PASSWORD", "--password")?,
            database: required(cli.database.clone().or(raw.database), "DATABASE_NAME", "--database")?,
        };

        let output_path = cli
            .output_path
            .clone()
            .or(raw.output_path)
            .filter(|p| !p.as_os_str().is_empty())
            .ok_or_else(|| missing("OUTPUT_PATH", "--output-path"))?;

        let backup_location = match non_empty(cli.backup_location.clone().or(raw.backup_location)) {
            Some(value) => value.parse()?,
            None => BackupLocation::Local,
        };

        let s3_storage = match backup_location {
            BackupLocation::Local => None,
            BackupLocation::S3 => Some(resolve_s3(cli, raw.s3_storage.unwrap_or_default())?),
        };

        Ok(AppConfig {
            engine,
            connection,
            output_path,
            backup_location,
            s3_storage,
        })
    }
}

fn resolve_s3(cli: &CliArgs, raw: JsonS3StorageConfig) -> Result<S3StorageConfig> {
    let endpoint_url = required(
        cli.s3_endpoint_url.clone().or(raw.endpoint_url),
        "S3_ENDPOINT_URL",
        "--s3-endpoint-url",
    )?;
    Url::parse(&endpoint_url).map_err(|e| {
        AppError::Config(format!("Invalid S3 endpoint URL '{}': {}", endpoint_url, e))
    })?;

    Ok(S3StorageConfig {
        endpoint_url,
        region: required(cli.s3_region.clone().or(raw.region), "S3_REGION", "--s3-region")?,
        access_key_id: required(
            cli.s3_access_key_id.clone().or(raw.access_key_id),
            "S3_ACCESS_KEY_ID",
            "--s3-access-key-id",
        )?,
        secret_access_key: required(
            cli.s3_secret_access_key.clone().or(raw.secret_access_key),
            "S3_SECRET_ACCESS_KEY",
            "--s3-secret-access-key",
        )?,
        bucket_name: required(
            cli.s3_bucket_name.clone().or(raw.bucket_name),
            "S3_BUCKET_NAME",
            "--s3-bucket-name",
        )?,
        folder_prefix: non_empty(cli.s3_folder_prefix.clone().or(raw.folder_prefix)),
    })
}

fn load_raw_json(config_path: &Path) -> Result<RawJsonConfig> {
    let parsed: anyhow::Result<RawJsonConfig> = fs::read_to_string(config_path)
        .with_context(|| format!("Failed to read config file at {}", config_path.display()))
        .and_then(|content| {
            serde_json::from_str(&content).with_context(|| {
                format!("Failed to parse JSON from config file at {}", config_path.display())
            })
        });
    parsed.map_err(|e| AppError::Config(format!("{:#}", e)))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}

fn required(value: Option<String>, key: &str, switch: &str) -> Result<String> {
    non_empty(value).ok_or_else(|| missing(key, switch))
}

fn missing(key: &str, switch: &str) -> AppError {
    AppError::Config(format!(
        "Configuration value for key '{}' (or '{}') is missing.",
        key, switch
    ))
}
