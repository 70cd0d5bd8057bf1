//! The `ingest_core` crate reads CSV datasets under an explicit schema, encodes them to
//! Parquet, writes them to an object store partitioned Hive style by one column and reads
//! them back to verify the round trip.
//!
//! Every stage takes an [`IngestContext`] built once at start-up. The context owns the
//! object store clients and run options and is shut down explicitly at the end of a run.
//! The [`Pipeline`] drives one dataset through the stages and [`run_all`] drives a job of
//! several.
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
pub mod config;
pub mod context;
pub mod dataset;
pub mod encoder;
pub mod job;
pub mod manifest;
pub mod partition;
pub mod pipeline;
pub mod reader;
pub mod retry;
pub mod schema;
pub mod target;
pub mod verifier;
pub mod writer;

pub use config::{ConfigError, IngestOptions, IngestOptionsBuilder, ObjectStoreConfig};
pub use context::IngestContext;
pub use dataset::Dataset;
pub use encoder::{EncodeError, EncodedDataset, EncodedFile, ParquetEncoder, ParquetOptions};
pub use job::{DatasetEntry, JobFile, SchemaSource};
pub use manifest::{MANIFEST_FILE, Manifest};
pub use partition::{DEFAULT_PARTITION, PartitionValue};
pub use pipeline::{
    DatasetJob, IngestError, IngestReport, JobOutcome, Pipeline, PipelineError, PipelineState,
    Stage, run_all,
};
pub use reader::{CsvOptions, ReadError, infer_schema, read_csv};
pub use retry::{RetryPolicy, StorageError};
pub use schema::{ColumnDef, ColumnType, DatasetSchema, SchemaError};
pub use target::StorageTarget;
pub use verifier::{ReadBack, VerificationError, VerificationResult, read_back, verify};
pub use writer::{PartitionedWriter, WriteConflictError, WriteError, WriteMode, WriteSummary};

/// Ingests one CSV file into a partitioned dataset and verifies it.
///
/// Convenience wrapper that builds an [`IngestContext`], runs a [`Pipeline`] and shuts
/// the context down again. `store_config` is needed only for `s3` targets.
///
/// # Examples
/// ```no_run
/// # use std::{path::PathBuf, sync::Arc};
/// # use ingest_core::{ingest, schema::employees, DatasetJob, IngestOptions, ObjectStoreConfig,
/// # StorageTarget};
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let store = ObjectStoreConfig {
///     endpoint: "http://localhost:9000".into(),
///     access_key: "minioadmin".into(),
///     secret_key: "minioadmin".into(),
///     ..ObjectStoreConfig::default()
/// };
/// let job = DatasetJob {
///     name: "employees".into(),
///     csv: PathBuf::from("data/employees.csv"),
///     schema: Arc::new(employees()),
///     target: StorageTarget::parse("s3a://spark-data/employees", "department")?,
/// };
/// # tokio_test::block_on(async {
/// let report = ingest(Some(&store), IngestOptions::default(), &job).await;
/// # });
/// # Ok(())
/// # }
/// ```
///
/// # Errors
/// If the options are invalid or any stage fails.
pub async fn ingest(
    store_config: Option<&ObjectStoreConfig>,
    options: IngestOptions,
    job: &DatasetJob,
) -> Result<IngestReport, PipelineError> {
    let ctx = IngestContext::new(store_config, options).map_err(|e| PipelineError {
        dataset: job.name.clone(),
        stage: Stage::Configuring,
        source: e.into(),
    })?;
    let result = Pipeline::new(&ctx).run(job).await;
    ctx.shutdown();
    result
}
