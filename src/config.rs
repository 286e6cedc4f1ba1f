use crate::schema::SchemaDescriptor;
use crate::storage::RetryPolicy;
use crate::{Error, Result};
use clap::Args;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Runtime settings shared by every command.
#[derive(Debug, Clone, Args)]
pub struct Config {
    /// JSON file describing the bucket, index database and tables
    #[arg(long, env = "BIOINDEX_CONFIG", default_value = "bioindex.json")]
    pub config: PathBuf,

    /// S3 bucket holding the source data (overrides `s3_bucket`)
    #[arg(long, env = "BIOINDEX_S3_BUCKET")]
    pub s3_bucket: Option<String>,

    /// SQLite index database path (overrides `rds_instance`)
    #[arg(long, env = "BIOINDEX_DATABASE")]
    pub database: Option<PathBuf>,

    /// Read source data from a local directory instead of S3
    #[arg(long, env = "BIOINDEX_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// AWS region (uses SDK defaults if not specified)
    #[arg(long, env = "BIOINDEX_S3_REGION")]
    pub region: Option<String>,

    /// Custom S3 endpoint URL (MinIO, LocalStack, etc.)
    #[arg(long, env = "BIOINDEX_S3_ENDPOINT")]
    pub endpoint: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    pub log_level: String,

    /// Records per page when a request gives no limit
    #[arg(long, env = "BIOINDEX_PAGE_SIZE", default_value = "1000")]
    pub page_size: usize,

    /// Largest page a request may ask for
    #[arg(long, env = "BIOINDEX_MAX_PAGE_SIZE", default_value = "10000")]
    pub max_page_size: usize,

    /// Concurrent record reads per request
    #[arg(long, env = "BIOINDEX_FETCH_CONCURRENCY", default_value = "20")]
    pub fetch_concurrency: usize,

    /// Objects read concurrently during an index build
    #[arg(long, env = "BIOINDEX_BUILD_WORKERS", default_value = "4")]
    pub build_workers: usize,

    /// Rows per index insert batch
    #[arg(long, env = "BIOINDEX_BATCH_SIZE", default_value = "5000")]
    pub batch_size: usize,

    /// Continuation token signing secret (random per process if unset)
    #[arg(long, env = "BIOINDEX_TOKEN_SECRET")]
    pub token_secret: Option<String>,

    /// Seconds a paginated query stays resumable
    #[arg(long, env = "BIOINDEX_TOKEN_TTL", default_value = "3600")]
    pub token_ttl: u64,

    /// Attempts per object store request, including the first
    #[arg(long, env = "BIOINDEX_RETRY_ATTEMPTS", default_value = "5")]
    pub retry_attempts: u32,

    /// Initial retry backoff in milliseconds
    #[arg(long, env = "BIOINDEX_RETRY_BASE_MS", default_value = "100")]
    pub retry_base_ms: u64,

    /// Retry backoff cap in milliseconds
    #[arg(long, env = "BIOINDEX_RETRY_MAX_MS", default_value = "5000")]
    pub retry_max_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            config: PathBuf::from("bioindex.json"),
            s3_bucket: None,
            database: None,
            data_dir: None,
            region: None,
            endpoint: None,
            log_level: "info".to_string(),
            page_size: 1000,
            max_page_size: 10000,
            fetch_concurrency: 20,
            build_workers: 4,
            batch_size: 5000,
            token_secret: None,
            token_ttl: 3600,
            retry_attempts: 5,
            retry_base_ms: 100,
            retry_max_ms: 5000,
        }
    }
}

impl Config {
    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl)
    }

    /// Backoff for object store requests, including reads resumed mid-object.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_attempts.max(1),
            base_delay: Duration::from_millis(self.retry_base_ms),
            max_delay: Duration::from_millis(self.retry_max_ms),
        }
    }

    /// Index database path: the flag wins over the tables file.
    pub fn database_path(&self, tables: &TablesFile) -> Result<PathBuf> {
        self.database
            .clone()
            .or_else(|| tables.rds_instance.as_ref().map(PathBuf::from))
            .ok_or_else(|| {
                Error::Config("no index database configured (--database or rds_instance)".to_string())
            })
    }

    pub fn bucket(&self, tables: &TablesFile) -> Option<String> {
        self.s3_bucket.clone().or_else(|| tables.s3_bucket.clone())
    }
}

/// The JSON configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TablesFile {
    #[serde(default)]
    pub s3_bucket: Option<String>,
    #[serde(default)]
    pub rds_instance: Option<String>,
    #[serde(default)]
    pub tables: BTreeMap<String, TableEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TableEntry {
    pub path: String,
    pub schema: String,
}

impl TablesFile {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| Error::Config(format!("invalid config file: {e}")))
    }
}

/// An indexed name's source prefix and schema.
#[derive(Debug, Clone, PartialEq)]
pub struct TableDef {
    pub prefix: String,
    pub schema: SchemaDescriptor,
}

/// Read-only map of indexed names, validated once at startup.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    tables: BTreeMap<String, TableDef>,
}

impl Registry {
    pub fn from_file(file: &TablesFile) -> Result<Self> {
        let mut tables = BTreeMap::new();
        for (name, entry) in &file.tables {
            if !is_valid_name(name) {
                return Err(Error::Config(format!(
                    "invalid index name `{name}`: use letters, digits, `_` and `-`"
                )));
            }
            let schema = SchemaDescriptor::parse(&entry.schema)?;
            let mut prefix = entry.path.trim_start_matches('/').to_string();
            if !prefix.is_empty() && !prefix.ends_with('/') {
                prefix.push('/');
            }
            tables.insert(name.clone(), TableDef { prefix, schema });
        }
        Ok(Self { tables })
    }

    pub fn get(&self, name: &str) -> Result<&TableDef> {
        self.tables
            .get(name)
            .ok_or_else(|| Error::IndexNotFound(name.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &TableDef)> {
        self.tables.iter().map(|(name, table)| (name.as_str(), table))
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}
