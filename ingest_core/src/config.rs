//! Run settings: object store connection, retry and write options, and the errors
//! raised when they are invalid.
/*
 * Copyright 2022-2025 Crown Copyright
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */
use crate::{
    encoder::ParquetOptions, reader::CsvOptions, retry::RetryPolicy, schema::SchemaError,
    writer::WriteMode,
};
use aws_credential_types::Credentials;
use aws_types::region::Region;
use object_store::aws::AmazonS3Builder;
use objectstore_ext::s3::{StoreFactoryError, config_for_s3_module};
use serde::{Deserialize, Serialize};
use std::{
    fmt::{Debug, Display, Formatter},
    path::PathBuf,
    time::Duration,
};
use thiserror::Error;
use url::Url;

/// Problems with the settings a run was started with. Raised before any data
/// is read or written.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("object store endpoint is missing")]
    MissingEndpoint,
    #[error("object store access key is missing")]
    MissingAccessKey,
    #[error("object store secret key is missing")]
    MissingSecretKey,
    #[error("invalid object store endpoint \"{endpoint}\": {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },
    #[error("invalid storage location \"{location}\": {reason}")]
    InvalidLocation { location: String, reason: String },
    #[error("partition column \"{column}\" is not in the schema of dataset \"{dataset}\"")]
    UnknownPartitionColumn { dataset: String, column: String },
    #[error(
        "partition column \"{column}\" is the only column of dataset \"{dataset}\", the data files would be empty"
    )]
    PartitionColumnOnly { dataset: String, column: String },
    #[error("unknown compression codec \"{0}\"")]
    UnknownCodec(String),
    #[error("invalid option: {0}")]
    InvalidOption(String),
    #[error("could not read job file {path}: {source}")]
    JobFile {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid job file {path}: {source}")]
    JobJson {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error(transparent)]
    Store(#[from] StoreFactoryError),
}

fn default_region() -> String {
    String::from("us-east-1")
}

const fn default_path_style() -> bool {
    true
}

const fn default_connect_timeout_secs() -> u64 {
    5
}

/// Connection settings for an S3 compatible object store.
///
/// Holds no retry settings of its own: every request made through the
/// resulting client is wrapped in the run's [`RetryPolicy`].
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectStoreConfig {
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub access_key: String,
    #[serde(default)]
    pub secret_key: String,
    #[serde(default)]
    pub session_token: Option<String>,
    #[serde(default = "default_region")]
    pub region: String,
    /// Address buckets as `<endpoint>/<bucket>` rather than `<bucket>.<endpoint>`.
    #[serde(default = "default_path_style")]
    pub path_style: bool,
    /// Permit plain HTTP. When unset, allowed only for `http://` endpoints.
    #[serde(default)]
    pub allow_http: Option<bool>,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl Default for ObjectStoreConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            access_key: String::new(),
            secret_key: String::new(),
            session_token: None,
            region: default_region(),
            path_style: default_path_style(),
            allow_http: None,
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

impl ObjectStoreConfig {
    /// Check the endpoint and credentials are present and usable.
    ///
    /// # Errors
    /// If the endpoint is missing or not an `http`/`https` URL, or either key is missing.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.endpoint.trim().is_empty() {
            return Err(ConfigError::MissingEndpoint);
        }
        let url = Url::parse(&self.endpoint).map_err(|e| ConfigError::InvalidEndpoint {
            endpoint: self.endpoint.clone(),
            reason: e.to_string(),
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigError::InvalidEndpoint {
                endpoint: self.endpoint.clone(),
                reason: format!("unsupported scheme \"{}\"", url.scheme()),
            });
        }
        if self.access_key.is_empty() {
            return Err(ConfigError::MissingAccessKey);
        }
        if self.secret_key.is_empty() {
            return Err(ConfigError::MissingSecretKey);
        }
        Ok(())
    }

    /// Whether requests may use plain HTTP.
    #[must_use]
    pub fn allows_http(&self) -> bool {
        self.allow_http
            .unwrap_or_else(|| self.endpoint.starts_with("http://"))
    }

    /// Create an [`AmazonS3Builder`] from this configuration.
    ///
    /// The builder still needs a bucket name before it can be built.
    ///
    /// # Errors
    /// If the configuration doesn't validate.
    pub fn to_s3_builder(&self) -> Result<AmazonS3Builder, ConfigError> {
        self.validate()?;
        let creds = Credentials::from_keys(
            &self.access_key,
            &self.secret_key,
            self.session_token.clone(),
        );
        let region = Region::new(self.region.clone());
        Ok(config_for_s3_module(
            &creds,
            &region,
            Duration::from_secs(self.connect_timeout_secs),
        )
        .with_endpoint(&self.endpoint)
        .with_allow_http(self.allows_http())
        .with_virtual_hosted_style_request(!self.path_style))
    }
}

/// Keeps the secret key and session token out of logs.
impl Debug for ObjectStoreConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStoreConfig")
            .field("endpoint", &self.endpoint)
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .field(
                "session_token",
                &self.session_token.as_ref().map(|_| "<redacted>"),
            )
            .field("region", &self.region)
            .field("path_style", &self.path_style)
            .field("allow_http", &self.allow_http)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .finish()
    }
}

impl Display for ObjectStoreConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "endpoint {} region {} path style {} allow http {}",
            self.endpoint,
            self.region,
            self.path_style,
            self.allows_http()
        )
    }
}

/// Settings shared by every dataset in a run.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestOptions {
    /// What to do when the target already holds data
    write_mode: WriteMode,
    /// Upper bound on rows in one Parquet file
    max_rows_per_file: usize,
    /// Upper bound on uploads in flight at once
    max_concurrent_uploads: usize,
    /// Retry policy for every object store request
    retry: RetryPolicy,
    /// Parquet writer settings
    parquet: ParquetOptions,
    /// CSV parser settings
    csv: CsvOptions,
}

impl IngestOptions {
    #[must_use]
    pub fn write_mode(&self) -> WriteMode {
        self.write_mode
    }

    #[must_use]
    pub fn max_rows_per_file(&self) -> usize {
        self.max_rows_per_file
    }

    #[must_use]
    pub fn max_concurrent_uploads(&self) -> usize {
        self.max_concurrent_uploads
    }

    #[must_use]
    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    #[must_use]
    pub fn parquet(&self) -> &ParquetOptions {
        &self.parquet
    }

    #[must_use]
    pub fn csv(&self) -> &CsvOptions {
        &self.csv
    }
}

impl Default for IngestOptions {
    fn default() -> Self {
        IngestOptionsBuilder::default().into_options()
    }
}

impl Display for IngestOptions {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "write mode {}, codec {}, max rows per file {}, max concurrent uploads {}, {} attempts per request",
            self.write_mode,
            self.parquet.compression,
            self.max_rows_per_file,
            self.max_concurrent_uploads,
            self.retry.max_attempts
        )
    }
}

/// Builder for `IngestOptions`.
#[derive(Debug, Clone)]
pub struct IngestOptionsBuilder {
    write_mode: WriteMode,
    max_rows_per_file: usize,
    max_concurrent_uploads: usize,
    retry: RetryPolicy,
    parquet: ParquetOptions,
    csv: CsvOptions,
}

impl Default for IngestOptionsBuilder {
    fn default() -> Self {
        Self {
            write_mode: WriteMode::default(),
            max_rows_per_file: 1_000_000,
            max_concurrent_uploads: 8,
            retry: RetryPolicy::default(),
            parquet: ParquetOptions::default(),
            csv: CsvOptions::default(),
        }
    }
}

impl IngestOptionsBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn write_mode(mut self, write_mode: WriteMode) -> Self {
        self.write_mode = write_mode;
        self
    }

    #[must_use]
    pub fn max_rows_per_file(mut self, max_rows_per_file: usize) -> Self {
        self.max_rows_per_file = max_rows_per_file;
        self
    }

    #[must_use]
    pub fn max_concurrent_uploads(mut self, max_concurrent_uploads: usize) -> Self {
        self.max_concurrent_uploads = max_concurrent_uploads;
        self
    }

    #[must_use]
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn parquet(mut self, parquet: ParquetOptions) -> Self {
        self.parquet = parquet;
        self
    }

    #[must_use]
    pub fn csv(mut self, csv: CsvOptions) -> Self {
        self.csv = csv;
        self
    }

    /// Build the `IngestOptions`, consuming the builder and validating it.
    ///
    /// # Errors
    /// Row and upload limits must be positive and the compression codec known.
    pub fn build(self) -> Result<IngestOptions, ConfigError> {
        self.validate()?;
        Ok(self.into_options())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_rows_per_file == 0 {
            return Err(ConfigError::InvalidOption(
                "max rows per file must be at least 1".into(),
            ));
        }
        if self.max_concurrent_uploads == 0 {
            return Err(ConfigError::InvalidOption(
                "max concurrent uploads must be at least 1".into(),
            ));
        }
        if self.retry.multiplier.is_nan() {
            return Err(ConfigError::InvalidOption(
                "retry multiplier must be a number".into(),
            ));
        }
        self.parquet.compression()?;
        self.csv.validate()
    }

    fn into_options(self) -> IngestOptions {
        IngestOptions {
            write_mode: self.write_mode,
            max_rows_per_file: self.max_rows_per_file,
            max_concurrent_uploads: self.max_concurrent_uploads,
            retry: self.retry,
            parquet: self.parquet,
            csv: self.csv,
        }
    }
}
