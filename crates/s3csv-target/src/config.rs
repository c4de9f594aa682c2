//! Target configuration
//!
//! Loaded from the JSON file given with `--config`. Credentials and the S3
//! endpoint may also come from the environment (or a `.env` file), matching
//! the variable names the AWS tooling uses.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::encode::HeaderPolicy;
use crate::error::{Result, TargetError};
use crate::processor::ValidationPolicy;
use crate::retry::RetryPolicy;
use crate::transform::ArrayStrategy;

// ============================================================================
// Defaults
// ============================================================================

pub const DEFAULT_DELIMITER: &str = ",";

pub const DEFAULT_QUOTECHAR: &str = "\"";

/// Rows buffered per stream before a part is uploaded
pub const DEFAULT_UPLOAD_BATCH_RECORD_COUNT: usize = 100_000;

pub const DEFAULT_NAMING_CONVENTION: &str = "{stream}-{timestamp}.csv";

pub const DEFAULT_RETRY_MAX_ATTEMPTS: u32 = 3;

pub const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 1_000;

pub const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 30_000;

pub const DEFAULT_AWS_REGION: &str = "us-east-1";

/// Format of the `{timestamp}` token in object keys
pub const KEY_TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%S";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetConfig {
    /// Destination bucket (required)
    pub s3_bucket: Option<String>,

    pub aws_access_key_id: Option<String>,
    pub aws_secret_access_key: Option<String>,
    pub aws_session_token: Option<String>,
    pub aws_region: Option<String>,

    /// Custom endpoint for S3-compatible services (MinIO, LocalStack)
    pub aws_endpoint_url: Option<String>,
    pub s3_path_style: bool,

    pub delimiter: String,
    pub quotechar: String,

    /// Inject `_sdc_*` metadata columns instead of stripping them
    pub add_metadata_columns: bool,

    #[serde(alias = "s3_key_prefix")]
    pub object_key_prefix: String,

    /// Object key template with `{stream}`, `{timestamp}` and `{date}` tokens
    pub naming_convention: Option<String>,

    pub upload_batch_record_count: usize,

    pub validation_policy: ValidationPolicy,
    pub header_policy: HeaderPolicy,
    pub array_strategy: ArrayStrategy,

    pub retry_max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            s3_bucket: None,
            aws_access_key_id: None,
            aws_secret_access_key: None,
            aws_session_token: None,
            aws_region: None,
            aws_endpoint_url: None,
            s3_path_style: false,
            delimiter: DEFAULT_DELIMITER.to_string(),
            quotechar: DEFAULT_QUOTECHAR.to_string(),
            add_metadata_columns: false,
            object_key_prefix: String::new(),
            naming_convention: None,
            upload_batch_record_count: DEFAULT_UPLOAD_BATCH_RECORD_COUNT,
            validation_policy: ValidationPolicy::default(),
            header_policy: HeaderPolicy::default(),
            array_strategy: ArrayStrategy::default(),
            retry_max_attempts: DEFAULT_RETRY_MAX_ATTEMPTS,
            retry_base_delay_ms: DEFAULT_RETRY_BASE_DELAY_MS,
            retry_max_delay_ms: DEFAULT_RETRY_MAX_DELAY_MS,
        }
    }
}

impl TargetConfig {
    /// Parse a JSON config file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            TargetError::Config(vec![format!("Cannot read config file {}: {}", path.display(), e)])
        })?;
        Self::from_json(&content)
            .map_err(|e| TargetError::Config(vec![format!("{} ({})", e, path.display())]))
    }

    /// Parse config from a JSON document
    pub fn from_json(content: &str) -> std::result::Result<Self, String> {
        serde_json::from_str(content).map_err(|e| format!("Config is not valid: {e}"))
    }

    /// Fill unset credential and endpoint fields from the environment
    ///
    /// Environment variables:
    /// - `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY`, `AWS_SESSION_TOKEN`
    /// - `AWS_REGION`
    /// - `S3_ENDPOINT`
    pub fn with_env(mut self) -> Self {
        fn fill(slot: &mut Option<String>, var: &str) {
            if slot.is_none() {
                *slot = std::env::var(var).ok().filter(|v| !v.is_empty());
            }
        }

        fill(&mut self.aws_access_key_id, "AWS_ACCESS_KEY_ID");
        fill(&mut self.aws_secret_access_key, "AWS_SECRET_ACCESS_KEY");
        fill(&mut self.aws_session_token, "AWS_SESSION_TOKEN");
        fill(&mut self.aws_region, "AWS_REGION");
        fill(&mut self.aws_endpoint_url, "S3_ENDPOINT");
        self
    }

    /// Every distinct problem with this configuration; empty when valid
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.s3_bucket.as_deref().map_or(true, str::is_empty) {
            errors.push("s3_bucket is required".to_string());
        }

        match (&self.aws_access_key_id, &self.aws_secret_access_key) {
            (Some(_), None) => errors.push(
                "aws_secret_access_key is required when aws_access_key_id is set".to_string(),
            ),
            (None, Some(_)) => errors.push(
                "aws_access_key_id is required when aws_secret_access_key is set".to_string(),
            ),
            _ => {},
        }

        if single_ascii(&self.delimiter).is_none() {
            errors.push(format!(
                "delimiter must be a single ASCII character, got {:?}",
                self.delimiter
            ));
        }

        if single_ascii(&self.quotechar).is_none() {
            errors.push(format!(
                "quotechar must be a single ASCII character, got {:?}",
                self.quotechar
            ));
        } else if self.quotechar == self.delimiter {
            errors.push("quotechar and delimiter must differ".to_string());
        }

        if self.upload_batch_record_count == 0 {
            errors.push("upload_batch_record_count must be at least 1".to_string());
        }

        if let Some(convention) = &self.naming_convention {
            if !convention.contains("{stream}") {
                errors.push(format!(
                    "naming_convention must contain {{stream}} so streams get distinct objects, got {convention:?}"
                ));
            }
        }

        if self.retry_max_attempts == 0 {
            errors.push("retry_max_attempts must be at least 1".to_string());
        }

        if self.retry_base_delay_ms > self.retry_max_delay_ms {
            errors.push(format!(
                "retry_base_delay_ms ({}) cannot be greater than retry_max_delay_ms ({})",
                self.retry_base_delay_ms, self.retry_max_delay_ms
            ));
        }

        errors
    }

    /// [`Self::validate`] as a `Result`
    pub fn ensure_valid(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(TargetError::Config(errors))
        }
    }

    pub fn bucket(&self) -> &str {
        self.s3_bucket.as_deref().unwrap_or_default()
    }

    pub fn region(&self) -> &str {
        self.aws_region.as_deref().unwrap_or(DEFAULT_AWS_REGION)
    }

    pub fn delimiter_byte(&self) -> u8 {
        single_ascii(&self.delimiter).unwrap_or(b',')
    }

    pub fn quote_byte(&self) -> u8 {
        single_ascii(&self.quotechar).unwrap_or(b'"')
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry_max_attempts,
            Duration::from_millis(self.retry_base_delay_ms),
            Duration::from_millis(self.retry_max_delay_ms),
        )
    }

    /// Object key for `stream` in a run started at `run_started`
    pub fn object_key(&self, stream: &str, run_started: &DateTime<Local>) -> String {
        let convention = self
            .naming_convention
            .as_deref()
            .unwrap_or(DEFAULT_NAMING_CONVENTION);

        let key = convention
            .replace("{stream}", stream)
            .replace("{timestamp}", &run_started.format(KEY_TIMESTAMP_FORMAT).to_string())
            .replace("{date}", &run_started.format("%Y-%m-%d").to_string());

        format!("{}{}", self.object_key_prefix, key)
    }
}

fn single_ascii(value: &str) -> Option<u8> {
    match value.as_bytes() {
        [b] if b.is_ascii() => Some(*b),
        _ => None,
    }
}
