//! The `_manifest.json` file that commits a written dataset.
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
use crate::{partition::PartitionValue, schema::ColumnDef};
use serde::{Deserialize, Serialize};

/// Name of the manifest object under a dataset's base path.
pub const MANIFEST_FILE: &str = "_manifest.json";

pub const MANIFEST_VERSION: u32 = 1;

/// A committed file, relative to the dataset's base path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestFile {
    pub path: String,
    pub rows: usize,
    pub bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestPartition {
    /// Partition value, absent for the default partition
    pub value: Option<String>,
    pub directory: String,
    pub files: Vec<ManifestFile>,
}

impl ManifestPartition {
    #[must_use]
    pub fn partition_value(&self) -> PartitionValue {
        self.value
            .clone()
            .map_or(PartitionValue::Default, PartitionValue::Value)
    }

    #[must_use]
    pub fn rows(&self) -> usize {
        self.files.iter().map(|f| f.rows).sum()
    }
}

/// Record of the files making up a dataset. Writing it commits a run: readers
/// trust only files it names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    pub dataset: String,
    pub run_id: String,
    /// RFC 3339 commit time
    pub committed_at: String,
    pub partition_column: String,
    pub compression: String,
    pub columns: Vec<ColumnDef>,
    pub partitions: Vec<ManifestPartition>,
}

impl Manifest {
    #[must_use]
    pub fn total_rows(&self) -> usize {
        self.partitions.iter().map(ManifestPartition::rows).sum()
    }

    /// Every committed file path, relative to the base path.
    pub fn file_paths(&self) -> impl Iterator<Item = &str> {
        self.partitions
            .iter()
            .flat_map(|p| p.files.iter().map(|f| f.path.as_str()))
    }

    /// True if a dataset with this manifest can take partitions written with
    /// `partition_column` and `columns` alongside its own.
    #[must_use]
    pub fn same_layout(&self, partition_column: &str, columns: &[ColumnDef]) -> bool {
        self.partition_column == partition_column
            && self.columns.len() == columns.len()
            && self
                .columns
                .iter()
                .zip(columns)
                .all(|(a, b)| a.name == b.name && a.column_type == b.column_type)
    }

    /// # Errors
    /// If serialisation fails.
    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec_pretty(self)
    }

    /// # Errors
    /// If `bytes` is not a manifest.
    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnType, sales};

    fn manifest() -> Manifest {
        Manifest {
            version: MANIFEST_VERSION,
            dataset: "sales".into(),
            run_id: "20250101000000-0000abcd".into(),
            committed_at: "2025-01-01T00:00:00+00:00".into(),
            partition_column: "region".into(),
            compression: "snappy".into(),
            columns: sales().columns().to_vec(),
            partitions: vec![
                ManifestPartition {
                    value: Some("North".into()),
                    directory: "region=North".into(),
                    files: vec![
                        ManifestFile {
                            path: "region=North/part-00000-x.c000.snappy.parquet".into(),
                            rows: 10,
                            bytes: 100,
                        },
                        ManifestFile {
                            path: "region=North/part-00001-x.c000.snappy.parquet".into(),
                            rows: 5,
                            bytes: 60,
                        },
                    ],
                },
                ManifestPartition {
                    value: None,
                    directory: "region=__HIVE_DEFAULT_PARTITION__".into(),
                    files: vec![ManifestFile {
                        path: "region=__HIVE_DEFAULT_PARTITION__/part-00000-x.c000.snappy.parquet"
                            .into(),
                        rows: 3,
                        bytes: 40,
                    }],
                },
            ],
        }
    }

    #[test]
    fn should_total_rows_and_files() {
        // Given
        let manifest = manifest();

        // Then
        assert_eq!(manifest.total_rows(), 18);
        assert_eq!(manifest.file_paths().count(), 3);
        assert_eq!(
            manifest.partitions[1].partition_value(),
            PartitionValue::Default
        );
    }

    #[test]
    fn should_read_back_written_json() -> Result<(), serde_json::Error> {
        // Given
        let manifest = manifest();

        // When
        let parsed = Manifest::from_json(&manifest.to_json()?)?;

        // Then
        assert_eq!(parsed, manifest);
        Ok(())
    }

    #[test]
    fn should_reject_other_json() {
        assert!(Manifest::from_json(br#"{"files": []}"#).is_err());
    }

    #[test]
    fn should_compare_layout() {
        // Given
        let manifest = manifest();
        let mut retyped = sales().columns().to_vec();
        retyped[3].column_type = ColumnType::Float;

        // Then
        assert!(manifest.same_layout("region", sales().columns()));
        assert!(!manifest.same_layout("product", sales().columns()));
        assert!(!manifest.same_layout("region", &retyped));
    }
}
