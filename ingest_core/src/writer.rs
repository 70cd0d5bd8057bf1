//! Writes encoded datasets to an object store as Hive style partitions and
//! commits each write with a manifest.
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
    encoder::{EncodeError, EncodedDataset},
    manifest::{MANIFEST_FILE, MANIFEST_VERSION, Manifest, ManifestFile, ManifestPartition},
    retry::{RetryPolicy, StorageError, with_retry},
    target::StorageTarget,
};
use bytes::Bytes;
use chrono::Utc;
use futures::{StreamExt, TryStreamExt, stream};
use log::{info, warn};
use num_format::{Locale, ToFormattedString};
use object_store::{ObjectMeta, ObjectStore, PutPayload, path::Path};
use std::{
    collections::HashSet,
    fmt::{Display, Formatter},
    str::FromStr,
    sync::Arc,
};
use thiserror::Error;

/// The target already holds data that the chosen [`WriteMode`] may not replace.
#[derive(Error, Debug)]
#[error("can't write to {location}: {reason}")]
pub struct WriteConflictError {
    pub location: String,
    pub reason: String,
}

#[derive(Error, Debug)]
pub enum WriteError {
    #[error(transparent)]
    Conflict(#[from] WriteConflictError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("invalid object path {path}: {source}")]
    Path {
        path: String,
        source: object_store::path::Error,
    },
}

/// What to do about data already at the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteMode {
    /// Fail before writing anything if the target holds any object.
    ErrorIfExists,
    /// Replace the whole dataset.
    #[default]
    Overwrite,
    /// Replace the partitions present in the new data and keep the rest.
    OverwritePartitions,
}

impl Display for WriteMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::ErrorIfExists => "error-if-exists",
            Self::Overwrite => "overwrite",
            Self::OverwritePartitions => "overwrite-partitions",
        })
    }
}

impl FromStr for WriteMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "error-if-exists" | "errorifexists" | "error" => Ok(Self::ErrorIfExists),
            "overwrite" => Ok(Self::Overwrite),
            "overwrite-partitions" => Ok(Self::OverwritePartitions),
            _ => Err(format!(
                "unknown write mode \"{s}\", expected error-if-exists, overwrite or overwrite-partitions"
            )),
        }
    }
}

/// Outcome of a committed write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteSummary {
    pub run_id: String,
    /// Partitions written by this run
    pub partitions: usize,
    pub files: usize,
    pub rows: usize,
    pub bytes: u64,
    /// Partitions of an earlier write kept by [`WriteMode::OverwritePartitions`]
    pub kept_partitions: usize,
    /// Superseded objects deleted after the commit
    pub removed_files: usize,
}

impl Display for WriteSummary {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "run {} wrote {} rows in {} files ({} bytes) across {} partitions, kept {} partitions, removed {} old files",
            self.run_id,
            self.rows.to_formatted_string(&Locale::en),
            self.files,
            self.bytes.to_formatted_string(&Locale::en),
            self.partitions,
            self.kept_partitions,
            self.removed_files
        )
    }
}

/// Fetch the committed manifest of a target, [`None`] if it has none.
///
/// # Errors
/// If the store can't be reached. An unreadable manifest is returned as
/// `Ok(Some(Err(_)))` so callers decide how serious it is.
pub(crate) async fn fetch_manifest(
    store: &Arc<dyn ObjectStore>,
    target: &StorageTarget,
    policy: &RetryPolicy,
) -> Result<Option<Result<Manifest, serde_json::Error>>, StorageError> {
    let path = target.child(MANIFEST_FILE).map_err(|source| StorageError {
        operation: "GET".into(),
        location: target.to_string(),
        attempts: 0,
        source: source.into(),
    })?;
    let store = store.as_ref();
    let path_ref = &path;
    match with_retry(policy, "GET", &target.describe(&path), move || async move {
        store.get(path_ref).await?.bytes().await
    })
    .await
    {
        Ok(bytes) => Ok(Some(Manifest::from_json(&bytes))),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

/// List every object under the target's base path.
///
/// # Errors
/// If the store can't be reached.
pub(crate) async fn list_objects(
    store: &Arc<dyn ObjectStore>,
    target: &StorageTarget,
    policy: &RetryPolicy,
) -> Result<Vec<ObjectMeta>, StorageError> {
    let store = store.as_ref();
    let base = target.base_path();
    let prefix = (!base.as_ref().is_empty()).then_some(base);
    with_retry(policy, "LIST", &target.describe(base), move || {
        store.list(prefix).try_collect::<Vec<_>>()
    })
    .await
}

async fn delete_quietly(
    store: &dyn ObjectStore,
    target: &StorageTarget,
    policy: &RetryPolicy,
    path: &Path,
) -> bool {
    match with_retry(policy, "DELETE", &target.describe(path), move || {
        store.delete(path)
    })
    .await
    {
        Ok(()) => true,
        Err(e) if e.is_not_found() => true,
        Err(e) => {
            warn!("Could not remove {}: {e}", target.describe(path));
            false
        }
    }
}

/// Groups a dataset's rows by partition, encodes them and writes them to a
/// [`StorageTarget`].
///
/// A write is all-or-nothing. Files are uploaded under names unique to the run
/// and only become part of the dataset when the manifest naming them is
/// written. Superseded files are removed after that. If any upload fails the
/// manifest is left alone, so readers keep seeing the previous data.
#[derive(Debug)]
pub struct PartitionedWriter<'a> {
    ctx: &'a IngestContext,
}

impl<'a> PartitionedWriter<'a> {
    #[must_use]
    pub fn new(ctx: &'a IngestContext) -> Self {
        Self { ctx }
    }

    /// Split and encode `dataset` for `target`.
    ///
    /// # Errors
    /// If encoding fails.
    pub fn encode(
        &self,
        dataset: &Dataset,
        target: &StorageTarget,
    ) -> Result<EncodedDataset, EncodeError> {
        self.ctx.encoder().encode_partitioned(
            dataset,
            target.partition_column(),
            self.ctx.options().max_rows_per_file(),
        )
    }

    /// Encode `dataset` and write it to `target`.
    ///
    /// # Errors
    /// As for [`PartitionedWriter::encode`] and [`PartitionedWriter::upload`].
    pub async fn write(
        &self,
        dataset: &Dataset,
        target: &StorageTarget,
    ) -> Result<WriteSummary, WriteError> {
        let encoded = self.encode(dataset, target)?;
        self.upload(&encoded, target).await
    }

    /// Write already encoded partitions to `target` and commit them.
    ///
    /// # Errors
    /// [`WriteError::Conflict`] if the write mode forbids replacing what is
    /// there, [`WriteError::Storage`] if the store fails.
    pub async fn upload(
        &self,
        encoded: &EncodedDataset,
        target: &StorageTarget,
    ) -> Result<WriteSummary, WriteError> {
        let ctx = self.ctx;
        let policy = ctx.retry_policy();
        let mode = ctx.options().write_mode();
        let store = ctx.store_for(target)?;

        let existing = list_objects(&store, target, policy).await?;
        let previous = match fetch_manifest(&store, target, policy).await? {
            Some(Ok(manifest)) => Some(manifest),
            Some(Err(e)) if mode == WriteMode::OverwritePartitions => {
                return Err(WriteConflictError {
                    location: target.location().to_string(),
                    reason: format!("existing manifest is unreadable: {e}"),
                }
                .into());
            }
            Some(Err(e)) => {
                warn!("Ignoring unreadable manifest at {}: {e}", target.location());
                None
            }
            None => None,
        };
        match mode {
            WriteMode::ErrorIfExists if !existing.is_empty() => {
                return Err(WriteConflictError {
                    location: target.location().to_string(),
                    reason: format!(
                        "{} objects already present and write mode is {mode}",
                        existing.len()
                    ),
                }
                .into());
            }
            WriteMode::OverwritePartitions => {
                if let Some(previous) = &previous
                    && !previous.same_layout(&encoded.partition_column, &encoded.columns)
                {
                    return Err(WriteConflictError {
                        location: target.location().to_string(),
                        reason: "existing dataset has a different partition column or schema"
                            .into(),
                    }
                    .into());
                }
            }
            _ => {}
        }

        let run_id = ctx.new_run_id();
        let plan = plan_uploads(encoded, target, &run_id)?;
        info!(
            "Writing {} files of dataset \"{}\" to {target} as run {run_id} in {mode} mode",
            plan.len(),
            encoded.dataset
        );
        if let Err(e) = self.upload_all(&store, target, &plan).await {
            warn!("Upload of run {run_id} failed, removing its files");
            for (path, _) in &plan {
                delete_quietly(store.as_ref(), target, policy, path).await;
            }
            return Err(e.into());
        }

        let (manifest, kept_partitions) = build_manifest(
            encoded,
            target,
            &run_id,
            &plan,
            previous,
            mode == WriteMode::OverwritePartitions,
        );
        self.commit(&store, target, &manifest).await?;

        let committed = manifest
            .file_paths()
            .map(ToOwned::to_owned)
            .collect::<HashSet<_>>();
        let mut removed_files = 0;
        for object in &existing {
            let keep = target
                .relative(&object.location)
                .is_some_and(|rel| rel == MANIFEST_FILE || committed.contains(rel));
            if !keep && delete_quietly(store.as_ref(), target, policy, &object.location).await {
                removed_files += 1;
            }
        }

        let summary = WriteSummary {
            run_id,
            partitions: encoded.partitions.len(),
            files: plan.len(),
            rows: encoded.total_rows(),
            bytes: plan.iter().map(|(_, b)| b.len() as u64).sum(),
            kept_partitions,
            removed_files,
        };
        info!("Dataset \"{}\": {summary}", encoded.dataset);
        Ok(summary)
    }

    async fn upload_all(
        &self,
        store: &Arc<dyn ObjectStore>,
        target: &StorageTarget,
        plan: &[(Path, Bytes)],
    ) -> Result<(), StorageError> {
        let policy = self.ctx.retry_policy();
        let store = store.as_ref();
        stream::iter(plan)
            .map(move |(path, bytes)| async move {
                with_retry(policy, "PUT", &target.describe(path), move || {
                    store.put(path, PutPayload::from(bytes.clone()))
                })
                .await
            })
            .buffer_unordered(self.ctx.options().max_concurrent_uploads())
            .try_for_each(|_| async { Ok(()) })
            .await
    }

    async fn commit(
        &self,
        store: &Arc<dyn ObjectStore>,
        target: &StorageTarget,
        manifest: &Manifest,
    ) -> Result<(), WriteError> {
        let path = target.child(MANIFEST_FILE).map_err(|source| WriteError::Path {
            path: MANIFEST_FILE.into(),
            source,
        })?;
        let body = Bytes::from(manifest.to_json().map_err(|e| StorageError {
            operation: "PUT".into(),
            location: target.describe(&path),
            attempts: 0,
            source: object_store::Error::Generic {
                store: "manifest",
                source: Box::new(e),
            },
        })?);
        let store = store.as_ref();
        let path_ref = &path;
        with_retry(
            self.ctx.retry_policy(),
            "PUT",
            &target.describe(&path),
            move || store.put(path_ref, PutPayload::from(body.clone())),
        )
        .await?;
        info!(
            "Committed run {} of dataset \"{}\" with {} rows",
            manifest.run_id,
            manifest.dataset,
            manifest.total_rows().to_formatted_string(&Locale::en)
        );
        Ok(())
    }
}

fn file_name(index: usize, run_id: &str, extension: &str) -> String {
    format!("part-{index:05}-{run_id}.c000.{extension}")
}

fn plan_uploads(
    encoded: &EncodedDataset,
    target: &StorageTarget,
    run_id: &str,
) -> Result<Vec<(Path, Bytes)>, WriteError> {
    let mut plan = Vec::with_capacity(encoded.total_files());
    for partition in &encoded.partitions {
        for (index, file) in partition.files.iter().enumerate() {
            let relative = format!(
                "{}/{}",
                partition.directory,
                file_name(index, run_id, encoded.file_extension)
            );
            let path = target
                .child(&relative)
                .map_err(|source| WriteError::Path {
                    path: relative.clone(),
                    source,
                })?;
            plan.push((path, file.bytes.clone()));
        }
    }
    Ok(plan)
}

fn build_manifest(
    encoded: &EncodedDataset,
    target: &StorageTarget,
    run_id: &str,
    plan: &[(Path, Bytes)],
    previous: Option<Manifest>,
    keep_previous: bool,
) -> (Manifest, usize) {
    let mut uploaded = plan.iter();
    let mut partitions = encoded
        .partitions
        .iter()
        .map(|partition| ManifestPartition {
            value: partition.value.as_text().map(ToOwned::to_owned),
            directory: partition.directory.clone(),
            files: partition
                .files
                .iter()
                .zip(uploaded.by_ref())
                .map(|(file, (path, bytes))| ManifestFile {
                    path: target.relative(path).unwrap_or(path.as_ref()).to_owned(),
                    rows: file.rows,
                    bytes: bytes.len() as u64,
                })
                .collect(),
        })
        .collect::<Vec<_>>();

    let mut kept = 0;
    if keep_previous && let Some(previous) = previous {
        let written = partitions
            .iter()
            .map(|p| p.directory.clone())
            .collect::<HashSet<_>>();
        for partition in previous.partitions {
            if !written.contains(&partition.directory) {
                partitions.push(partition);
                kept += 1;
            }
        }
        partitions.sort_by(|a, b| a.directory.cmp(&b.directory));
    }

    let manifest = Manifest {
        version: MANIFEST_VERSION,
        dataset: encoded.dataset.clone(),
        run_id: run_id.to_owned(),
        committed_at: Utc::now().to_rfc3339(),
        partition_column: encoded.partition_column.clone(),
        compression: encoded.compression.clone(),
        columns: encoded.columns.clone(),
        partitions,
    };
    (manifest, kept)
}
