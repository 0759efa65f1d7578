//! Process-wide configuration, resolved once from the environment.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{PipelineError, Result};
use crate::poller::PollPolicy;

pub const DEFAULT_STORAGE_BASE_URL: &str = "https://storage.yandexcloud.net/s3-sprint3";
pub const DEFAULT_EXTRACT_FILENAME: &str = "user_order_log_inc.csv";
pub const DEFAULT_STATUS: &str = "shipped";

/// Identity and endpoint of the report service.
#[derive(Clone)]
pub struct ApiConfig {
    pub base_url: String,
    pub api_key: String,
    pub nickname: String,
    pub cohort: String,
    pub project: bool,
    pub timeout: Duration,
}

impl fmt::Debug for ApiConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .field("nickname", &self.nickname)
            .field("cohort", &self.cohort)
            .field("project", &self.project)
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[derive(Clone)]
pub struct S3Settings {
    pub bucket: String,
    pub region: String,
    pub endpoint: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub force_path_style: bool,
}

impl fmt::Debug for S3Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Settings")
            .field("bucket", &self.bucket)
            .field("region", &self.region)
            .field("endpoint", &self.endpoint)
            .field("access_key_id", &self.access_key_id.as_ref().map(|_| "<redacted>"))
            .field("secret_access_key", &self.secret_access_key.as_ref().map(|_| "<redacted>"))
            .field("force_path_style", &self.force_path_style)
            .finish()
    }
}

/// Where increment artifacts are fetched from.
#[derive(Debug, Clone)]
pub enum StorageConfig {
    /// Public objects under a base URL.
    Http { base_url: String },
    /// Private bucket; requires the `s3` feature at runtime.
    S3(S3Settings),
}

/// Schema-qualified staging table. Both parts are plain SQL identifiers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagingTarget {
    schema: String,
    table: String,
}

impl StagingTarget {
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Result<Self> {
        let schema = schema.into();
        let table = table.into();
        for ident in [&schema, &table] {
            if !is_plain_identifier(ident) {
                return Err(PipelineError::Config(format!(
                    "'{ident}' is not a valid SQL identifier"
                )));
            }
        }
        Ok(Self { schema, table })
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn qualified(&self) -> String {
        format!("{}.{}", self.schema, self.table)
    }

    /// Scratch table recreated on every load.
    pub fn scratch_qualified(&self) -> String {
        format!("{}.{}_tmp", self.schema, self.table)
    }
}

impl Default for StagingTarget {
    fn default() -> Self {
        Self {
            schema: "staging".to_string(),
            table: "user_order_log".to_string(),
        }
    }
}

fn is_plain_identifier(value: &str) -> bool {
    let mut chars = value.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() || c == '_' => {}
        _ => return false,
    }
    value.len() <= 63
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub api: ApiConfig,
    pub storage: StorageConfig,
    pub database_url: Option<String>,
    pub poll: PollPolicy,
    pub work_dir: PathBuf,
    pub sql_dir: PathBuf,
    pub extract_filename: String,
    pub default_status: String,
    pub staging: StagingTarget,
}

impl PipelineConfig {
    /// Reads configuration from process environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        let required = |key: &str| {
            get(key).ok_or_else(|| PipelineError::Config(format!("{key} must be set")))
        };

        let api = ApiConfig {
            base_url: required("SALESMART_API_BASE_URL")?
                .trim_end_matches('/')
                .to_string(),
            api_key: required("SALESMART_API_KEY")?,
            nickname: required("SALESMART_NICKNAME")?,
            cohort: required("SALESMART_COHORT")?,
            project: true,
            timeout: Duration::from_secs(parse_number(
                "SALESMART_HTTP_TIMEOUT_SECS",
                get("SALESMART_HTTP_TIMEOUT_SECS"),
                60,
            )?),
        };

        let storage = match get("SALESMART_STORAGE_KIND").as_deref() {
            None | Some("http") => StorageConfig::Http {
                base_url: get("SALESMART_STORAGE_BASE_URL")
                    .unwrap_or_else(|| DEFAULT_STORAGE_BASE_URL.to_string())
                    .trim_end_matches('/')
                    .to_string(),
            },
            Some("s3") => StorageConfig::S3(S3Settings {
                bucket: required("S3_BUCKET")?,
                region: get("S3_REGION").unwrap_or_else(|| "us-east-1".to_string()),
                endpoint: get("S3_ENDPOINT_URL"),
                access_key_id: get("S3_ACCESS_KEY_ID"),
                secret_access_key: get("S3_SECRET_ACCESS_KEY"),
                force_path_style: get("S3_FORCE_PATH_STYLE")
                    .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
                    .unwrap_or(false),
            }),
            Some(other) => {
                return Err(PipelineError::Config(format!(
                    "unknown SALESMART_STORAGE_KIND '{other}' (expected http or s3)"
                )))
            }
        };

        let poll = PollPolicy {
            max_attempts: parse_number("SALESMART_POLL_ATTEMPTS", get("SALESMART_POLL_ATTEMPTS"), 20)?,
            delay: Duration::from_secs(parse_number(
                "SALESMART_POLL_DELAY_SECS",
                get("SALESMART_POLL_DELAY_SECS"),
                10,
            )?),
        };
        if poll.max_attempts == 0 {
            return Err(PipelineError::Config(
                "SALESMART_POLL_ATTEMPTS must be at least 1".into(),
            ));
        }

        let staging = StagingTarget::new(
            get("SALESMART_STAGING_SCHEMA").unwrap_or_else(|| "staging".to_string()),
            get("SALESMART_STAGING_TABLE").unwrap_or_else(|| "user_order_log".to_string()),
        )?;

        Ok(Self {
            api,
            storage,
            database_url: get("DATABASE_URL").or_else(|| get("SALESMART_DATABASE_URL")),
            poll,
            work_dir: get("SALESMART_WORK_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".")),
            sql_dir: get("SALESMART_SQL_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(default_sql_dir),
            extract_filename: get("SALESMART_EXTRACT_FILENAME")
                .unwrap_or_else(|| DEFAULT_EXTRACT_FILENAME.to_string()),
            default_status: get("SALESMART_DEFAULT_STATUS")
                .unwrap_or_else(|| DEFAULT_STATUS.to_string()),
            staging,
        })
    }

    pub fn require_database_url(&self) -> Result<&str> {
        self.database_url.as_deref().ok_or_else(|| {
            PipelineError::Config("DATABASE_URL (or SALESMART_DATABASE_URL) must be set".into())
        })
    }
}

/// SQL scripts shipped with this crate.
pub fn default_sql_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("sql")
}

fn parse_number<T>(key: &str, raw: Option<String>, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: fmt::Display,
{
    match raw {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|err| PipelineError::Config(format!("{key}='{value}' is invalid: {err}"))),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    const BASE: &[(&str, &str)] = &[
        ("SALESMART_API_BASE_URL", "https://api.example.test/"),
        ("SALESMART_API_KEY", "secret-key"),
        ("SALESMART_NICKNAME", "student"),
        ("SALESMART_COHORT", "7"),
    ];

    #[test]
    fn applies_defaults() {
        let config = PipelineConfig::from_lookup(lookup(BASE)).unwrap();
        assert_eq!(config.api.base_url, "https://api.example.test");
        assert_eq!(config.poll.max_attempts, 20);
        assert_eq!(config.poll.delay, Duration::from_secs(10));
        assert_eq!(config.extract_filename, DEFAULT_EXTRACT_FILENAME);
        assert_eq!(config.default_status, "shipped");
        assert_eq!(config.staging.qualified(), "staging.user_order_log");
        assert_eq!(config.staging.scratch_qualified(), "staging.user_order_log_tmp");
        assert!(config.database_url.is_none());
        assert!(matches!(
            config.storage,
            StorageConfig::Http { ref base_url } if base_url == DEFAULT_STORAGE_BASE_URL
        ));
    }

    #[test]
    fn missing_credentials_are_reported() {
        let err = PipelineConfig::from_lookup(lookup(&BASE[..3])).unwrap_err();
        assert!(err.to_string().contains("SALESMART_COHORT"));
    }

    #[test]
    fn rejects_bad_numbers_and_identifiers() {
        let mut pairs = BASE.to_vec();
        pairs.push(("SALESMART_POLL_ATTEMPTS", "many"));
        assert!(PipelineConfig::from_lookup(lookup(&pairs)).is_err());

        let mut pairs = BASE.to_vec();
        pairs.push(("SALESMART_STAGING_TABLE", "orders; drop table x"));
        assert!(PipelineConfig::from_lookup(lookup(&pairs)).is_err());
    }

    #[test]
    fn debug_output_hides_api_key() {
        let config = PipelineConfig::from_lookup(lookup(BASE)).unwrap();
        let rendered = format!("{:?}", config.api);
        assert!(!rendered.contains("secret-key"));
    }
}
