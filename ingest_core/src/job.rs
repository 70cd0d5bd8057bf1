//! Job files: JSON descriptions of an ingestion run and the datasets it processes.
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
    config::{ConfigError, IngestOptions, IngestOptionsBuilder, ObjectStoreConfig},
    encoder::ParquetOptions,
    pipeline::DatasetJob,
    retry::RetryPolicy,
    schema::{ColumnDef, DatasetSchema},
    target::StorageTarget,
    writer::WriteMode,
};
use serde::Deserialize;
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

/// Where a dataset's schema comes from.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum SchemaSource {
    /// A built-in schema name, or else the path of a schema file
    Named(String),
    Inline(Vec<ColumnDef>),
}

impl SchemaSource {
    /// Resolve to a schema. Relative file paths are taken from `base_dir`.
    ///
    /// # Errors
    /// If the name is neither built-in nor a readable schema file, or inline
    /// columns don't form a valid schema.
    pub fn resolve(&self, base_dir: &Path) -> Result<DatasetSchema, ConfigError> {
        match self {
            Self::Inline(columns) => Ok(DatasetSchema::new(columns.clone())?),
            Self::Named(name) => match DatasetSchema::builtin(name) {
                Ok(schema) => Ok(schema),
                Err(builtin_err) => {
                    let path = base_dir.join(name);
                    if path.is_file() {
                        Ok(DatasetSchema::load(&path)?)
                    } else {
                        Err(builtin_err.into())
                    }
                }
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DatasetEntry {
    pub name: String,
    pub csv: PathBuf,
    pub target: String,
    pub partition_column: String,
    pub schema: SchemaSource,
}

/// A job file: object store settings, run options and the datasets to ingest.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobFile {
    #[serde(default)]
    pub object_store: Option<ObjectStoreConfig>,
    #[serde(default)]
    pub write_mode: Option<String>,
    #[serde(default)]
    pub max_rows_per_file: Option<usize>,
    #[serde(default)]
    pub max_concurrent_uploads: Option<usize>,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    #[serde(default)]
    pub parquet: Option<ParquetOptions>,
    pub datasets: Vec<DatasetEntry>,
    #[serde(skip)]
    base_dir: PathBuf,
}

impl JobFile {
    /// Read a job file. Relative paths inside it are resolved against the
    /// directory holding it.
    ///
    /// # Errors
    /// If the file can't be read or isn't a valid job.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::JobFile {
            path: path.to_owned(),
            source,
        })?;
        let mut job = Self::from_json(&text).map_err(|source| ConfigError::JobJson {
            path: path.to_owned(),
            source,
        })?;
        job.base_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
        Ok(job)
    }

    /// Parse a job from JSON text. Relative paths resolve against the current
    /// directory.
    ///
    /// # Errors
    /// If the text isn't a valid job.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Run options from this job, starting from `builder` so that settings the
    /// job leaves out keep the caller's values.
    ///
    /// # Errors
    /// If an option is invalid.
    pub fn options(&self, builder: IngestOptionsBuilder) -> Result<IngestOptions, ConfigError> {
        let mut builder = builder;
        if let Some(mode) = &self.write_mode {
            builder = builder.write_mode(
                mode.parse::<WriteMode>()
                    .map_err(ConfigError::InvalidOption)?,
            );
        }
        if let Some(rows) = self.max_rows_per_file {
            builder = builder.max_rows_per_file(rows);
        }
        if let Some(uploads) = self.max_concurrent_uploads {
            builder = builder.max_concurrent_uploads(uploads);
        }
        if let Some(retry) = self.retry {
            builder = builder.retry(retry);
        }
        if let Some(parquet) = &self.parquet {
            builder = builder.parquet(parquet.clone());
        }
        builder.build()
    }

    /// The datasets of this job with schemas and targets resolved.
    ///
    /// # Errors
    /// If a schema can't be resolved, a target is invalid or two datasets share a name.
    pub fn dataset_jobs(&self) -> Result<Vec<DatasetJob>, ConfigError> {
        if self.datasets.is_empty() {
            return Err(ConfigError::InvalidOption("job lists no datasets".into()));
        }
        let mut jobs: Vec<DatasetJob> = Vec::with_capacity(self.datasets.len());
        for entry in &self.datasets {
            if jobs.iter().any(|j| j.name == entry.name) {
                return Err(ConfigError::InvalidOption(format!(
                    "dataset \"{}\" is listed more than once",
                    entry.name
                )));
            }
            let target = StorageTarget::parse(&entry.target, entry.partition_column.clone())?;
            let schema = entry.schema.resolve(&self.base_dir)?;
            target.validate_for(&entry.name, &schema)?;
            jobs.push(DatasetJob {
                name: entry.name.clone(),
                csv: self.base_dir.join(&entry.csv),
                schema: Arc::new(schema),
                target,
            });
        }
        Ok(jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnType, SchemaError, employees};

    const JOB: &str = r#"{
        "object_store": {
            "endpoint": "http://localhost:9000",
            "access_key": "minioadmin",
            "secret_key": "minioadmin"
        },
        "write_mode": "overwrite-partitions",
        "retry": { "max_attempts": 2 },
        "parquet": { "compression": "zstd" },
        "datasets": [
            {
                "name": "employees",
                "csv": "data/employees.csv",
                "target": "s3a://spark-data/employees",
                "partition_column": "department",
                "schema": "employees"
            },
            {
                "name": "scores",
                "csv": "/data/scores.csv",
                "target": "memory://scratch/scores",
                "partition_column": "team",
                "schema": [
                    { "name": "team", "type": "string" },
                    { "name": "score", "type": "integer", "nullable": false }
                ]
            }
        ]
    }"#;

    #[test]
    fn should_parse_job() -> Result<(), Box<dyn std::error::Error>> {
        // When
        let job = JobFile::from_json(JOB)?;

        // Then
        let store = job.object_store.as_ref().expect("object store block");
        assert_eq!(store.endpoint, "http://localhost:9000");
        assert_eq!(store.region, "us-east-1");
        assert!(store.path_style);
        assert_eq!(job.datasets.len(), 2);
        assert_eq!(job.datasets[0].schema, SchemaSource::Named("employees".into()));
        Ok(())
    }

    #[test]
    fn should_apply_options_over_defaults() -> Result<(), Box<dyn std::error::Error>> {
        // Given
        let job = JobFile::from_json(JOB)?;

        // When
        let options = job.options(IngestOptionsBuilder::new().max_rows_per_file(10))?;

        // Then
        assert_eq!(options.write_mode(), WriteMode::OverwritePartitions);
        assert_eq!(options.max_rows_per_file(), 10);
        assert_eq!(options.retry().max_attempts, 2);
        assert_eq!(options.retry().initial_backoff, RetryPolicy::default().initial_backoff);
        assert_eq!(options.parquet().compression, "zstd");
        Ok(())
    }

    #[test]
    fn should_resolve_datasets() -> Result<(), Box<dyn std::error::Error>> {
        // Given
        let job = JobFile::from_json(JOB)?;

        // When
        let jobs = job.dataset_jobs()?;

        // Then
        assert_eq!(jobs[0].schema.as_ref(), &employees());
        assert!(jobs[0].target.is_s3());
        assert_eq!(jobs[0].csv, PathBuf::from("data/employees.csv"));
        assert_eq!(jobs[1].schema.len(), 2);
        assert_eq!(
            jobs[1].schema.column("score").map(|(_, c)| c.column_type),
            Some(ColumnType::Integer)
        );
        Ok(())
    }

    #[test]
    fn should_reject_bad_write_mode() -> Result<(), Box<dyn std::error::Error>> {
        // Given
        let mut job = JobFile::from_json(JOB)?;
        job.write_mode = Some("append".into());

        // When
        let result = job.options(IngestOptionsBuilder::new());

        // Then
        assert!(matches!(result, Err(ConfigError::InvalidOption(_))));
        Ok(())
    }

    #[test]
    fn should_reject_unknown_schema_name() -> Result<(), Box<dyn std::error::Error>> {
        // Given
        let mut job = JobFile::from_json(JOB)?;
        job.datasets[0].schema = SchemaSource::Named("customers".into());

        // When
        let result = job.dataset_jobs();

        // Then
        assert!(matches!(
            result,
            Err(ConfigError::Schema(SchemaError::UnknownBuiltin(_)))
        ));
        Ok(())
    }

    #[test]
    fn should_reject_duplicate_names() -> Result<(), Box<dyn std::error::Error>> {
        // Given
        let mut job = JobFile::from_json(JOB)?;
        let first = job.datasets[0].clone();
        job.datasets.push(first);

        // Then
        assert!(matches!(
            job.dataset_jobs(),
            Err(ConfigError::InvalidOption(_))
        ));
        Ok(())
    }

    #[test]
    fn should_load_schema_file_relative_to_job() -> Result<(), Box<dyn std::error::Error>> {
        // Given
        let dir = tempfile::tempdir()?;
        employees().save(&dir.path().join("people.json"))?;
        let job_path = dir.path().join("job.json");
        std::fs::write(
            &job_path,
            r#"{"datasets": [{"name": "people", "csv": "people.csv",
                "target": "memory://test/people", "partition_column": "department",
                "schema": "people.json"}]}"#,
        )?;

        // When
        let jobs = JobFile::load(&job_path)?.dataset_jobs()?;

        // Then
        assert_eq!(jobs[0].schema.as_ref(), &employees());
        assert_eq!(jobs[0].csv, dir.path().join("people.csv"));
        Ok(())
    }

    #[test]
    fn should_report_missing_job_file() {
        assert!(matches!(
            JobFile::load(Path::new("/nonexistent/job.json")),
            Err(ConfigError::JobFile { .. })
        ));
    }
}
