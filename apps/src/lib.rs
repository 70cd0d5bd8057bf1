//! Command line plumbing shared by the ingest binaries: logging set-up, object store
//! and run option flags, and result printing.
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
use chrono::Local;
use clap::{ArgAction, Args};
use env_logger::Env;
use ingest_core::{
    ConfigError, CsvOptions, DatasetSchema, IngestOptionsBuilder, ObjectStoreConfig,
    ParquetOptions, RetryPolicy, WriteMode,
};
use owo_colors::OwoColorize;
use std::{io::Write, path::Path, process::ExitCode};

/// Exit code for invalid settings.
pub const EXIT_CONFIG: u8 = 2;

/// Install the logger used by every binary. `RUST_LOG` overrides the default
/// `info` filter.
pub fn init_logging() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{}] {}:{} - {}",
                Local::now().format("%Y-%m-%dT%H:%M:%S%.3f"),
                record.level(),
                record.file().unwrap_or("??"),
                record.line().unwrap_or(0),
                record.args()
            )
        })
        .init();
}

/// S3 compatible object store connection flags.
#[derive(Args, Debug, Clone)]
pub struct StoreArgs {
    /// Object store endpoint URL, e.g. `http://localhost:9000`
    #[arg(long = "s3-endpoint", env = "INGEST_S3_ENDPOINT")]
    pub endpoint: Option<String>,
    /// Access key
    #[arg(long = "s3-access-key", env = "INGEST_S3_ACCESS_KEY", hide_env_values = true)]
    pub access_key: Option<String>,
    /// Secret key
    #[arg(long = "s3-secret-key", env = "INGEST_S3_SECRET_KEY", hide_env_values = true)]
    pub secret_key: Option<String>,
    /// Region sent with signed requests
    #[arg(long = "s3-region", env = "INGEST_S3_REGION", default_value = "us-east-1")]
    pub region: String,
    /// Address buckets by path rather than by host name
    #[arg(long = "s3-path-style", env = "INGEST_S3_PATH_STYLE", default_value_t = true, action = ArgAction::Set)]
    pub path_style: bool,
    /// Permit plain HTTP (default: only for `http://` endpoints)
    #[arg(long = "s3-allow-http", env = "INGEST_S3_ALLOW_HTTP", action = ArgAction::Set)]
    pub allow_http: Option<bool>,
}

impl StoreArgs {
    /// Object store settings if any connection flag was given.
    #[must_use]
    pub fn to_config(&self) -> Option<ObjectStoreConfig> {
        if self.endpoint.is_none() && self.access_key.is_none() && self.secret_key.is_none() {
            return None;
        }
        Some(ObjectStoreConfig {
            endpoint: self.endpoint.clone().unwrap_or_default(),
            access_key: self.access_key.clone().unwrap_or_default(),
            secret_key: self.secret_key.clone().unwrap_or_default(),
            region: self.region.clone(),
            path_style: self.path_style,
            allow_http: self.allow_http,
            ..ObjectStoreConfig::default()
        })
    }
}

/// CSV dialect flags.
#[derive(Args, Debug, Clone)]
pub struct CsvArgs {
    /// Field delimiter
    #[arg(long, default_value_t = ',')]
    pub delimiter: char,
    /// Quote character
    #[arg(long, default_value_t = '"')]
    pub quote: char,
}

impl CsvArgs {
    /// # Errors
    /// If either character is not a single byte.
    pub fn to_options(&self) -> Result<CsvOptions, ConfigError> {
        let byte = |c: char, what: &str| {
            u8::try_from(c)
                .ok()
                .filter(u8::is_ascii)
                .ok_or_else(|| ConfigError::InvalidOption(format!("{what} '{c}' is not ASCII")))
        };
        Ok(CsvOptions {
            delimiter: byte(self.delimiter, "delimiter")?,
            quote: byte(self.quote, "quote character")?,
            ..CsvOptions::default()
        })
    }
}

/// Flags controlling how datasets are written.
#[derive(Args, Debug, Clone)]
pub struct WriteArgs {
    /// One of error-if-exists, overwrite or overwrite-partitions
    #[arg(short = 'm', long, default_value = "overwrite")]
    pub write_mode: WriteMode,
    /// Most rows written to one file
    #[arg(long, default_value = "1000000")]
    pub max_rows_per_file: usize,
    /// Most uploads in flight at once
    #[arg(long, default_value = "8")]
    pub max_concurrent_uploads: usize,
    /// Parquet compression codec
    #[arg(short = 'c', long, default_value = "snappy")]
    pub compression: String,
    /// Attempts per object store request
    #[arg(long, default_value = "4")]
    pub retry_attempts: u32,
}

impl WriteArgs {
    #[must_use]
    pub fn to_builder(&self) -> IngestOptionsBuilder {
        IngestOptionsBuilder::new()
            .write_mode(self.write_mode)
            .max_rows_per_file(self.max_rows_per_file)
            .max_concurrent_uploads(self.max_concurrent_uploads)
            .retry(RetryPolicy {
                max_attempts: self.retry_attempts,
                ..RetryPolicy::default()
            })
            .parquet(ParquetOptions {
                compression: self.compression.clone(),
                ..ParquetOptions::default()
            })
    }
}

/// A built-in schema name or the path of a schema file.
///
/// # Errors
/// If the name is not built in and the file can't be loaded.
pub fn load_schema(name_or_path: &str) -> Result<DatasetSchema, ConfigError> {
    match DatasetSchema::builtin(name_or_path) {
        Ok(schema) => Ok(schema),
        Err(_) if Path::new(name_or_path).is_file() => {
            Ok(DatasetSchema::load(Path::new(name_or_path))?)
        }
        Err(e) => Err(e.into()),
    }
}

/// Report a settings problem and return the matching exit code.
#[must_use]
pub fn config_failure(err: &ConfigError) -> ExitCode {
    eprintln!("{} {err}", "Configuration error:".red().bold());
    ExitCode::from(EXIT_CONFIG)
}

/// Print a heading then a block of text to standard output.
pub fn print_section(heading: &str, body: &str) {
    println!("{}", heading.green().bold());
    println!("{body}");
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser, Debug)]
    struct TestArgs {
        #[command(flatten)]
        store: StoreArgs,
        #[command(flatten)]
        csv: CsvArgs,
        #[command(flatten)]
        write: WriteArgs,
    }

    #[test]
    fn should_have_no_store_config_without_flags() {
        // Given
        let args = StoreArgs {
            endpoint: None,
            access_key: None,
            secret_key: None,
            region: "eu-west-2".into(),
            path_style: true,
            allow_http: None,
        };

        // Then
        assert!(args.to_config().is_none());
    }

    #[test]
    fn should_build_store_config_from_flags() {
        // Given
        let args = TestArgs::parse_from([
            "test",
            "--s3-endpoint",
            "http://localhost:9000",
            "--s3-access-key",
            "minioadmin",
            "--s3-secret-key",
            "minioadmin",
            "--s3-path-style",
            "false",
        ]);

        // When
        let config = args.store.to_config().expect("store flags given");

        // Then
        assert_eq!(config.endpoint, "http://localhost:9000");
        assert!(!config.path_style);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn should_parse_write_flags() -> Result<(), ConfigError> {
        // Given
        let args = TestArgs::parse_from([
            "test",
            "--write-mode",
            "overwrite-partitions",
            "--compression",
            "zstd",
            "--max-rows-per-file",
            "500",
        ]);

        // When
        let options = args.write.to_builder().build()?;

        // Then
        assert_eq!(options.write_mode(), WriteMode::OverwritePartitions);
        assert_eq!(options.max_rows_per_file(), 500);
        assert_eq!(options.parquet().compression, "zstd");
        Ok(())
    }

    #[test]
    fn should_reject_non_ascii_delimiter() {
        // Given
        let args = TestArgs::parse_from(["test", "--delimiter", "§"]);

        // Then
        assert!(args.csv.to_options().is_err());
        assert_eq!(
            TestArgs::parse_from(["test", "--delimiter", ";"])
                .csv
                .to_options()
                .map(|o| o.delimiter)
                .ok(),
            Some(b';')
        );
    }

    #[test]
    fn should_load_builtin_schema() -> Result<(), ConfigError> {
        assert_eq!(load_schema("sales")?, ingest_core::schema::sales());
        assert!(load_schema("/nonexistent/schema.json").is_err());
        Ok(())
    }
}
