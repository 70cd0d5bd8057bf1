//! Reads committed datasets back from the object store and checks them against
//! their source.
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
    config::ConfigError,
    context::IngestContext,
    dataset::Dataset,
    manifest::{MANIFEST_FILE, Manifest},
    partition::PartitionValue,
    retry::{StorageError, with_retry},
    schema::{ColumnDef, DatasetSchema, SchemaError},
    target::StorageTarget,
    writer::{fetch_manifest, list_objects},
};
use arrow::{array::RecordBatch, datatypes::Schema, error::ArrowError};
use log::{info, warn};
use num_format::{Locale, ToFormattedString};
use parquet::{arrow::arrow_reader::ParquetRecordBatchReaderBuilder, errors::ParquetError};
use std::{collections::HashSet, sync::Arc};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VerificationError {
    #[error("row count mismatch: expected {expected} rows, read back {observed}")]
    RowCountMismatch { expected: usize, observed: usize },
    #[error("schema mismatch: expected [{expected}], read back [{observed}]")]
    SchemaMismatch { expected: String, observed: String },
    #[error("no committed dataset at {0}")]
    MissingManifest(String),
    #[error("manifest at {location} is invalid: {reason}")]
    InvalidManifest { location: String, reason: String },
    #[error("{0} is named by the manifest but missing from storage")]
    MissingFile(String),
    #[error("could not decode {location}: {source}")]
    Decode {
        location: String,
        source: ParquetError,
    },
    #[error("could not rebuild rows of {location}: {source}")]
    Rebuild {
        location: String,
        source: ArrowError,
    },
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Outcome of checking a written dataset against its source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerificationResult {
    pub expected_rows: usize,
    pub observed_rows: usize,
    pub schema_match: bool,
}

impl VerificationResult {
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.schema_match && self.expected_rows == self.observed_rows
    }
}

/// A dataset as read back from storage.
#[derive(Debug, Clone)]
pub struct ReadBack {
    pub manifest: Manifest,
    /// Rows with the partition column restored from the path and columns in the
    /// order the manifest declares. Declared columns the files lack are left out
    /// and undeclared file columns are kept so a mismatch shows.
    pub dataset: Dataset,
    /// Objects under the base path the manifest doesn't name
    pub stale_files: Vec<String>,
}

fn describe(columns: &[ColumnDef]) -> String {
    columns
        .iter()
        .map(|c| format!("{}: {}", c.name, c.column_type))
        .collect::<Vec<_>>()
        .join(", ")
}

fn invalid_manifest(location: &str, reason: impl Into<String>) -> VerificationError {
    VerificationError::InvalidManifest {
        location: location.to_owned(),
        reason: reason.into(),
    }
}

/// Declared columns in declared order, the partition column among them and the
/// rest only if `file_schema` has them, then any file columns the manifest
/// doesn't know.
fn observed_columns(
    declared: &DatasetSchema,
    partition_column: &ColumnDef,
    file_schema: &Schema,
) -> Result<Vec<ColumnDef>, SchemaError> {
    let file_columns = DatasetSchema::from_arrow(file_schema)?;
    let mut columns = declared
        .columns()
        .iter()
        .filter_map(|c| {
            if c.name == partition_column.name {
                Some(partition_column.clone())
            } else {
                file_columns.column(&c.name).map(|(_, f)| f.clone())
            }
        })
        .collect::<Vec<_>>();
    columns.extend(
        file_columns
            .columns()
            .iter()
            .filter(|f| declared.column(&f.name).is_none())
            .cloned(),
    );
    Ok(columns)
}

/// Partition value of a file, decoded from the `<column>=<value>` directory it
/// sits in.
fn path_partition_value(column: &str, file_path: &str) -> Option<PartitionValue> {
    let (directory, _) = file_path.rsplit_once('/')?;
    PartitionValue::parse_directory(column, directory)
}

/// Read a committed dataset back from `target`.
///
/// Only files named by the manifest are read. Every one of them must be
/// present in a listing of the base path and sit in the directory of the
/// partition the manifest puts it in. The partition column is restored from
/// that directory name. Does not modify storage.
///
/// # Errors
/// If there is no manifest, a named file is missing or undecodable, or the
/// store can't be reached.
pub async fn read_back(
    ctx: &IngestContext,
    target: &StorageTarget,
) -> Result<ReadBack, VerificationError> {
    let store = ctx.store_for(target)?;
    let policy = ctx.retry_policy();
    let location = target.location().to_string();

    let manifest = match fetch_manifest(&store, target, policy).await? {
        Some(Ok(manifest)) => manifest,
        Some(Err(e)) => return Err(invalid_manifest(&location, e.to_string())),
        None => return Err(VerificationError::MissingManifest(location)),
    };
    if manifest.partition_column != target.partition_column() {
        return Err(invalid_manifest(
            &location,
            format!(
                "dataset is partitioned by \"{}\", not \"{}\"",
                manifest.partition_column,
                target.partition_column()
            ),
        ));
    }
    let declared = DatasetSchema::new(manifest.columns.clone())
        .map_err(|e| invalid_manifest(&location, e.to_string()))?;
    let Some((_, partition_def)) = declared.column(&manifest.partition_column) else {
        return Err(invalid_manifest(
            &location,
            "partition column is not among the declared columns",
        ));
    };
    let mut partition_def = partition_def.clone();

    let listed = list_objects(&store, target, policy)
        .await?
        .into_iter()
        .filter_map(|meta| target.relative(&meta.location).map(ToOwned::to_owned))
        .collect::<HashSet<_>>();
    let named = manifest
        .file_paths()
        .map(ToOwned::to_owned)
        .collect::<HashSet<_>>();
    let mut stale_files = listed
        .iter()
        .filter(|rel| rel.as_str() != MANIFEST_FILE && !named.contains(*rel))
        .cloned()
        .collect::<Vec<_>>();
    stale_files.sort();
    for stale in &stale_files {
        warn!(
            "Ignoring {}/{stale}: not part of committed run {}",
            target.location(),
            manifest.run_id
        );
    }

    // (partition value, file batches) per file
    let mut decoded: Vec<(PartitionValue, Vec<RecordBatch>)> = Vec::new();
    let mut file_schema: Option<Arc<Schema>> = None;
    for partition in &manifest.partitions {
        let recorded = partition.partition_value();
        if recorded.directory(&manifest.partition_column) != partition.directory {
            return Err(invalid_manifest(
                &location,
                format!(
                    "partition directory {} does not match its value",
                    partition.directory
                ),
            ));
        }
        for file in &partition.files {
            if !listed.contains(&file.path) {
                return Err(VerificationError::MissingFile(format!(
                    "{}/{}",
                    target.location(),
                    file.path
                )));
            }
            let value = path_partition_value(&manifest.partition_column, &file.path)
                .filter(|value| *value == recorded)
                .ok_or_else(|| {
                    invalid_manifest(
                        &location,
                        format!(
                            "{} is not in the directory of partition {}",
                            file.path, partition.directory
                        ),
                    )
                })?;
            if value == PartitionValue::Default {
                partition_def.nullable = true;
            }
            let path = target
                .child(&file.path)
                .map_err(|e| invalid_manifest(&location, e.to_string()))?;
            let file_location = target.describe(&path);
            let store = store.as_ref();
            let path_ref = &path;
            let bytes = with_retry(policy, "GET", &file_location, move || async move {
                store.get(path_ref).await?.bytes().await
            })
            .await?;
            let decode = |source| VerificationError::Decode {
                location: file_location.clone(),
                source,
            };
            let builder = ParquetRecordBatchReaderBuilder::try_new(bytes).map_err(decode)?;
            let schema = builder.schema().clone();
            let reader = builder.build().map_err(decode)?;
            match &file_schema {
                Some(first) if first.fields() != schema.fields() => {
                    return Err(VerificationError::SchemaMismatch {
                        expected: first.to_string(),
                        observed: format!("{file_location}: {schema}"),
                    });
                }
                Some(_) => {}
                None => file_schema = Some(schema.clone()),
            }
            let batches = reader
                .collect::<Result<Vec<_>, _>>()
                .map_err(|source| VerificationError::Rebuild {
                    location: file_location.clone(),
                    source,
                })?;
            decoded.push((value, batches));
        }
    }

    let dataset = match file_schema {
        None => Dataset::try_new(manifest.dataset.clone(), Arc::new(declared), vec![]).map_err(
            |source| VerificationError::Rebuild {
                location: location.clone(),
                source,
            },
        )?,
        Some(file_schema) => {
            let columns = observed_columns(&declared, &partition_def, &file_schema).map_err(
                |e| VerificationError::SchemaMismatch {
                    expected: describe(declared.columns()),
                    observed: e.to_string(),
                },
            )?;
            let observed = Arc::new(
                DatasetSchema::new(columns)
                    .map_err(|e| invalid_manifest(&location, e.to_string()))?,
            );
            rebuild(&manifest.dataset, observed, &partition_def, decoded).map_err(|source| {
                VerificationError::Rebuild {
                    location: location.clone(),
                    source,
                }
            })?
        }
    };
    info!(
        "Read back {} rows of dataset \"{}\" from {}",
        dataset.num_rows().to_formatted_string(&Locale::en),
        manifest.dataset,
        target.location()
    );
    Ok(ReadBack {
        manifest,
        dataset,
        stale_files,
    })
}

/// Reassemble file batches into `schema`, filling the partition column from
/// each file's partition value.
fn rebuild(
    name: &str,
    schema: Arc<DatasetSchema>,
    partition_def: &ColumnDef,
    decoded: Vec<(PartitionValue, Vec<RecordBatch>)>,
) -> Result<Dataset, ArrowError> {
    let arrow_schema = schema.arrow_schema();
    let mut batches = Vec::new();
    for (value, file_batches) in decoded {
        for batch in file_batches {
            let columns = schema
                .columns()
                .iter()
                .map(|column| {
                    if column.name == partition_def.name {
                        value.to_array(partition_def.column_type, batch.num_rows())
                    } else {
                        batch.column_by_name(&column.name).cloned().ok_or_else(|| {
                            ArrowError::SchemaError(format!("missing column \"{}\"", column.name))
                        })
                    }
                })
                .collect::<Result<Vec<_>, _>>()?;
            batches.push(RecordBatch::try_new(arrow_schema.clone(), columns)?);
        }
    }
    Dataset::try_new(name, schema, batches)
}

/// Compare a read back dataset with its source.
///
/// # Errors
/// [`VerificationError::RowCountMismatch`] or
/// [`VerificationError::SchemaMismatch`] if they differ.
pub fn check(source: &Dataset, read_back: &ReadBack) -> Result<VerificationResult, VerificationError> {
    let observed = &read_back.dataset;
    let result = VerificationResult {
        expected_rows: source.num_rows(),
        observed_rows: observed.num_rows(),
        schema_match: source.schema().same_columns(observed.schema()),
    };
    if result.expected_rows != result.observed_rows {
        return Err(VerificationError::RowCountMismatch {
            expected: result.expected_rows,
            observed: result.observed_rows,
        });
    }
    if !result.schema_match {
        return Err(VerificationError::SchemaMismatch {
            expected: describe(source.schema().columns()),
            observed: describe(observed.schema().columns()),
        });
    }
    if read_back.manifest.total_rows() != result.observed_rows {
        warn!(
            "Manifest of dataset \"{}\" records {} rows but {} were read",
            read_back.manifest.dataset,
            read_back.manifest.total_rows(),
            result.observed_rows
        );
    }
    Ok(result)
}

/// Read `target` back and check it holds exactly the rows and columns of `source`.
///
/// # Errors
/// As for [`read_back`] and [`check`].
pub async fn verify(
    ctx: &IngestContext,
    source: &Dataset,
    target: &StorageTarget,
) -> Result<VerificationResult, VerificationError> {
    let read_back = read_back(ctx, target).await?;
    let result = check(source, &read_back)?;
    info!(
        "Verified dataset \"{}\": {} rows, schema match {}",
        source.name(),
        result.observed_rows.to_formatted_string(&Locale::en),
        result.schema_match
    );
    Ok(result)
}
