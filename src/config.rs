//! Process configuration
//!
//! `BackupConfig` is built once at startup (JSON file, then environment
//! overlay, then directory fallbacks) and handed to every component behind
//! an `Arc`. This is the only module that reads the process environment.
//!
//! Precedence for each directory: environment variable, then config file,
//! then the fallback for the detected runtime (container or local checkout).

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::http_server::HttpServerConfig;
use crate::observability::Severity;

/// Name of the OAuth token file kept under the data directory
pub const GOOGLE_DRIVE_TOKEN_FILE: &str = ".google-drive-tokens.json";

/// Archive entry reserved for the manifest; never a valid table name
pub const MANIFEST_ENTRY: &str = "backup_manifest.json";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Failed to read config {0}")]
    Read(String),

    #[error("Invalid config JSON: {0}")]
    Parse(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Snapshot of the process environment taken once at startup
#[derive(Debug, Clone, Default)]
pub struct Environment {
    vars: HashMap<String, String>,
    containerized: bool,
}

impl Environment {
    /// Capture the real process environment
    pub fn capture() -> Self {
        let containerized = Path::new("/.dockerenv").exists()
            || std::env::current_dir()
                .map(|dir| dir == Path::new("/app"))
                .unwrap_or(false);
        Self {
            vars: std::env::vars().collect(),
            containerized,
        }
    }

    /// Build an environment from explicit pairs
    pub fn from_pairs<I, K, V>(pairs: I, containerized: bool) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            containerized,
        }
    }

    /// Non-empty value of a variable
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    pub fn is_containerized(&self) -> bool {
        self.containerized
    }
}

/// Which tables belong to the `settings` and `data` scopes.
///
/// Both lists are declared parent-first.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScopeConfig {
    #[serde(default = "default_settings_tables")]
    pub settings_tables: Vec<String>,

    #[serde(default = "default_data_tables")]
    pub data_tables: Vec<String>,
}

fn default_settings_tables() -> Vec<String> {
    [
        "service_category",
        "service_catalog",
        "service_type",
        "email_template",
        "email_template_version",
        "document_template",
        "appointment_type",
        "knowledge_base_item",
        "report_definition",
        "tag",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_data_tables() -> Vec<String> {
    [
        "client",
        "client_contact",
        "client_link",
        "client_communication",
        "client_beneficial_owner",
        "client_aml_assessment",
        "client_emergency_contact",
        "client_employment_info",
        "matter",
        "matter_checklist",
        "matter_note",
        "matter_link",
        "document",
        "document_verification",
        "deadline",
        "deadline_reminder",
        "appointment",
        "appointment_reminder",
        "invoice",
        "invoice_line_item",
        "invoice_payment",
        "time_entry",
        "tax_calculations",
        "courses",
        "course_schedules",
        "enrollments",
        "activity_log",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Default for ScopeConfig {
    fn default() -> Self {
        Self {
            settings_tables: default_settings_tables(),
            data_tables: default_data_tables(),
        }
    }
}

impl ScopeConfig {
    /// Explicit table lists
    pub fn new(settings: &[&str], data: &[&str]) -> Self {
        Self {
            settings_tables: settings.iter().map(|s| s.to_string()).collect(),
            data_tables: data.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Tables must be valid identifiers, unique, and the two scopes disjoint
    pub fn validate(&self) -> ConfigResult<()> {
        let ident = Regex::new(r"^[a-z_][a-z0-9_]*$")
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        let reserved = MANIFEST_ENTRY.trim_end_matches(".json");

        let mut seen = std::collections::HashSet::new();
        for table in self.settings_tables.iter().chain(self.data_tables.iter()) {
            if !ident.is_match(table) {
                return Err(ConfigError::Invalid(format!(
                    "table name '{}' is not a lowercase SQL identifier",
                    table
                )));
            }
            if table == reserved {
                return Err(ConfigError::Invalid(format!(
                    "table name '{}' is reserved",
                    table
                )));
            }
            if !seen.insert(table.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "table '{}' is listed more than once across settings_tables and data_tables",
                    table
                )));
            }
        }
        Ok(())
    }
}

/// Remote destination used for cloud sync
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CloudProviderKind {
    GoogleDrive,
    S3,
}

impl CloudProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloudProviderKind::GoogleDrive => "google_drive",
            CloudProviderKind::S3 => "s3",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GoogleDriveConfig {
    #[serde(default)]
    pub client_id: Option<String>,

    #[serde(default)]
    pub client_secret: Option<String>,

    #[serde(default)]
    pub redirect_uri: Option<String>,

    /// Destination folder; uploads go to the drive root when unset
    #[serde(default)]
    pub folder_id: Option<String>,

    #[serde(default = "default_google_auth_url")]
    pub auth_url: String,

    #[serde(default = "default_google_token_url")]
    pub token_url: String,

    #[serde(default = "default_google_upload_url")]
    pub upload_url: String,

    /// Files API used to list, download and delete archives
    #[serde(default = "default_google_api_url")]
    pub api_url: String,
}

fn default_google_auth_url() -> String {
    "https://accounts.google.com/o/oauth2/v2/auth".to_string()
}

fn default_google_token_url() -> String {
    "https://oauth2.googleapis.com/token".to_string()
}

fn default_google_upload_url() -> String {
    "https://www.googleapis.com/upload/drive/v3".to_string()
}

fn default_google_api_url() -> String {
    "https://www.googleapis.com/drive/v3".to_string()
}

impl Default for GoogleDriveConfig {
    fn default() -> Self {
        Self {
            client_id: None,
            client_secret: None,
            redirect_uri: None,
            folder_id: None,
            auth_url: default_google_auth_url(),
            token_url: default_google_token_url(),
            upload_url: default_google_upload_url(),
            api_url: default_google_api_url(),
        }
    }
}

impl GoogleDriveConfig {
    pub fn is_configured(&self) -> bool {
        self.client_id.is_some() && self.client_secret.is_some() && self.redirect_uri.is_some()
    }
}

/// S3-compatible storage (AWS S3, Cloudflare R2, MinIO)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct S3Config {
    #[serde(default)]
    pub endpoint: Option<String>,

    #[serde(default)]
    pub access_key_id: Option<String>,

    #[serde(default)]
    pub secret_access_key: Option<String>,

    #[serde(default)]
    pub bucket: Option<String>,

    /// `auto` is what R2 expects; it is signed as us-east-1
    #[serde(default = "default_s3_region")]
    pub region: String,

    #[serde(default = "default_s3_prefix")]
    pub prefix: String,
}

fn default_s3_region() -> String {
    "auto".to_string()
}

fn default_s3_prefix() -> String {
    "backups".to_string()
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            endpoint: None,
            access_key_id: None,
            secret_access_key: None,
            bucket: None,
            region: default_s3_region(),
            prefix: default_s3_prefix(),
        }
    }
}

impl S3Config {
    pub fn is_configured(&self) -> bool {
        self.endpoint.is_some()
            && self.access_key_id.is_some()
            && self.secret_access_key.is_some()
            && self.bucket.is_some()
    }

    /// Region used in the SigV4 credential scope
    pub fn signing_region(&self) -> &str {
        if self.region == "auto" {
            "us-east-1"
        } else {
            &self.region
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CloudConfig {
    /// Provider used when a backup asks for cloud sync
    #[serde(default)]
    pub provider: Option<CloudProviderKind>,

    /// Per-attempt upload timeout
    #[serde(default = "default_upload_timeout_secs")]
    pub upload_timeout_secs: u64,

    #[serde(default)]
    pub google_drive: GoogleDriveConfig,

    #[serde(default)]
    pub s3: S3Config,
}

fn default_upload_timeout_secs() -> u64 {
    300
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            provider: None,
            upload_timeout_secs: default_upload_timeout_secs(),
            google_drive: GoogleDriveConfig::default(),
            s3: S3Config::default(),
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Where archives are written
    #[serde(default)]
    pub backup_dir: PathBuf,

    /// Live uploads tree included in `full` backups
    #[serde(default)]
    pub uploads_dir: PathBuf,

    /// Record store, schedule store and OAuth tokens live here
    #[serde(default)]
    pub data_dir: PathBuf,

    /// JSON database file used by the CLI; defaults to `<data_dir>/database.json`
    #[serde(default)]
    pub database_file: Option<PathBuf>,

    #[serde(default = "default_app_version")]
    pub app_version: String,

    #[serde(default = "default_schema_version")]
    pub schema_version: String,

    #[serde(default)]
    pub scopes: ScopeConfig,

    #[serde(default)]
    pub cloud: CloudConfig,

    #[serde(default)]
    pub http: HttpServerConfig,

    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_app_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_schema_version() -> String {
    "1".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            backup_dir: PathBuf::new(),
            uploads_dir: PathBuf::new(),
            data_dir: PathBuf::new(),
            database_file: None,
            app_version: default_app_version(),
            schema_version: default_schema_version(),
            scopes: ScopeConfig::default(),
            cloud: CloudConfig::default(),
            http: HttpServerConfig::default(),
            log_level: default_log_level(),
        }
    }
}

impl BackupConfig {
    /// Configuration rooted at explicit directories, everything else default
    pub fn with_dirs(
        backup_dir: impl Into<PathBuf>,
        uploads_dir: impl Into<PathBuf>,
        data_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            backup_dir: backup_dir.into(),
            uploads_dir: uploads_dir.into(),
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// Load from file (missing file means all defaults), overlay the
    /// environment, then validate
    pub fn load(path: &Path, env: &Environment) -> ConfigResult<Self> {
        let mut config = if path.exists() {
            let content = fs::read_to_string(path)
                .map_err(|e| ConfigError::Read(format!("{}: {}", path.display(), e)))?;
            serde_json::from_str::<BackupConfig>(&content)
                .map_err(|e| ConfigError::Parse(e.to_string()))?
        } else {
            BackupConfig::default()
        };

        config.apply_env(env);
        config.validate()?;
        Ok(config)
    }

    /// Environment overlay plus directory fallbacks
    pub fn apply_env(&mut self, env: &Environment) {
        let fallback_root = if env.is_containerized() {
            PathBuf::from("/app")
        } else {
            PathBuf::from(".")
        };

        resolve_dir(&mut self.backup_dir, env.get("BACKUP_DIR"), &fallback_root, "backups");
        resolve_dir(&mut self.uploads_dir, env.get("UPLOADS_DIR"), &fallback_root, "uploads");
        resolve_dir(&mut self.data_dir, env.get("DATA_DIR"), &fallback_root, "data");

        if let Some(level) = env.get("NEXUS_LOG_LEVEL") {
            self.log_level = level.to_string();
        }

        let gd = &mut self.cloud.google_drive;
        overlay(&mut gd.client_id, env.get("GOOGLE_CLIENT_ID"));
        overlay(&mut gd.client_secret, env.get("GOOGLE_CLIENT_SECRET"));
        overlay(&mut gd.redirect_uri, env.get("GOOGLE_REDIRECT_URI"));
        overlay(&mut gd.folder_id, env.get("GOOGLE_DRIVE_FOLDER_ID"));

        let s3 = &mut self.cloud.s3;
        overlay(&mut s3.endpoint, env.get("BACKUP_S3_ENDPOINT"));
        overlay(&mut s3.access_key_id, env.get("BACKUP_S3_ACCESS_KEY_ID"));
        overlay(&mut s3.secret_access_key, env.get("BACKUP_S3_SECRET_ACCESS_KEY"));
        overlay(&mut s3.bucket, env.get("BACKUP_S3_BUCKET"));
        if let Some(region) = env.get("BACKUP_S3_REGION") {
            s3.region = region.to_string();
        }

        if self.cloud.provider.is_none() {
            if self.cloud.s3.is_configured() {
                self.cloud.provider = Some(CloudProviderKind::S3);
            } else if self.cloud.google_drive.is_configured() {
                self.cloud.provider = Some(CloudProviderKind::GoogleDrive);
            }
        }
    }

    pub fn validate(&self) -> ConfigResult<()> {
        self.scopes.validate()?;

        if Severity::parse(&self.log_level).is_none() {
            return Err(ConfigError::Invalid(format!(
                "log_level '{}' must be one of trace, info, warn, error, fatal",
                self.log_level
            )));
        }
        if self.cloud.upload_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "cloud.upload_timeout_secs must be > 0".to_string(),
            ));
        }
        if version_major(&self.app_version).is_none() {
            return Err(ConfigError::Invalid(format!(
                "app_version '{}' has no numeric major component",
                self.app_version
            )));
        }
        for (name, dir) in [
            ("backup_dir", &self.backup_dir),
            ("uploads_dir", &self.uploads_dir),
            ("data_dir", &self.data_dir),
        ] {
            if dir.as_os_str().is_empty() {
                return Err(ConfigError::Invalid(format!("{} is not set", name)));
            }
        }
        Ok(())
    }

    /// Minimum log severity from `log_level`
    pub fn log_severity(&self) -> Severity {
        Severity::parse(&self.log_level).unwrap_or(Severity::Info)
    }

    pub fn records_path(&self) -> PathBuf {
        self.data_dir.join("backup-records.json")
    }

    pub fn schedules_path(&self) -> PathBuf {
        self.data_dir.join("backup-schedules.json")
    }

    pub fn token_path(&self) -> PathBuf {
        self.data_dir.join(GOOGLE_DRIVE_TOKEN_FILE)
    }

    pub fn database_path(&self) -> PathBuf {
        self.database_file
            .clone()
            .unwrap_or_else(|| self.data_dir.join("database.json"))
    }
}

/// Leading numeric component of a dotted version string
pub fn version_major(version: &str) -> Option<u64> {
    version
        .trim_start_matches('v')
        .split('.')
        .next()
        .and_then(|major| major.parse().ok())
}

fn resolve_dir(target: &mut PathBuf, from_env: Option<&str>, root: &Path, leaf: &str) {
    if let Some(value) = from_env {
        *target = PathBuf::from(value);
    } else if target.as_os_str().is_empty() {
        *target = root.join(leaf);
    }
}

fn overlay(target: &mut Option<String>, from_env: Option<&str>) {
    if let Some(value) = from_env {
        *target = Some(value.to_string());
    }
}
