//! Serialises Arrow record batches into Parquet files held in memory.
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
    dataset::Dataset,
    partition::{PartitionValue, data_file_schema, split_by_partition},
    schema::{ColumnDef, ColumnType},
};
use arrow::{
    array::RecordBatch,
    datatypes::{Schema, SchemaRef},
    error::ArrowError,
};
use bytes::Bytes;
use log::info;
use num_format::{Locale, ToFormattedString};
use parquet::{
    arrow::ArrowWriter,
    basic::{BrotliLevel, Compression, GzipLevel, ZstdLevel},
    errors::ParquetError,
    file::properties::{WriterProperties, WriterVersion},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("a dataset must have at least one column to encode")]
    EmptySchema,
    #[error("column \"{name}\" has type {data_type} which can't be encoded")]
    UnsupportedType { name: String, data_type: String },
    #[error("record batch columns [{found}] do not match the declared columns [{expected}]")]
    SchemaMismatch { expected: String, found: String },
    #[error(transparent)]
    Arrow(#[from] ArrowError),
    #[error("Parquet encoding failed: {0}")]
    Parquet(#[from] ParquetError),
}

/// Parquet writer settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParquetOptions {
    /// One of `uncompressed`, `snappy`, `gzip`, `lz4`, `zstd` or `brotli`
    pub compression: String,
    pub max_row_group_size: usize,
    pub max_page_size: usize,
    /// `1.0` or `2.0`
    pub writer_version: String,
    pub dictionary_enabled: bool,
    pub column_truncate_length: usize,
}

impl Default for ParquetOptions {
    fn default() -> Self {
        Self {
            compression: "snappy".into(),
            max_row_group_size: 1_000_000,
            max_page_size: 1024 * 1024,
            writer_version: "1.0".into(),
            dictionary_enabled: true,
            column_truncate_length: 128,
        }
    }
}

impl ParquetOptions {
    /// Parse the compression codec name.
    ///
    /// # Errors
    /// If the codec is not one of the supported names.
    pub fn compression(&self) -> Result<Compression, ConfigError> {
        match self.compression.to_lowercase().as_str() {
            "uncompressed" | "none" => Ok(Compression::UNCOMPRESSED),
            "snappy" => Ok(Compression::SNAPPY),
            "gzip" => Ok(Compression::GZIP(GzipLevel::default())),
            "lz4" => Ok(Compression::LZ4_RAW),
            "zstd" => Ok(Compression::ZSTD(ZstdLevel::default())),
            "brotli" => Ok(Compression::BROTLI(BrotliLevel::default())),
            _ => Err(ConfigError::UnknownCodec(self.compression.clone())),
        }
    }

    /// File name suffix for the codec, such as `snappy.parquet`.
    ///
    /// # Errors
    /// If the codec is not one of the supported names.
    pub fn file_extension(&self) -> Result<&'static str, ConfigError> {
        Ok(match self.compression()? {
            Compression::SNAPPY => "snappy.parquet",
            Compression::GZIP(_) => "gz.parquet",
            Compression::LZ4_RAW => "lz4raw.parquet",
            Compression::ZSTD(_) => "zstd.parquet",
            Compression::BROTLI(_) => "brotli.parquet",
            _ => "parquet",
        })
    }

    fn writer_version(&self) -> Result<WriterVersion, ConfigError> {
        match self.writer_version.as_str() {
            "1.0" => Ok(WriterVersion::PARQUET_1_0),
            "2.0" => Ok(WriterVersion::PARQUET_2_0),
            other => Err(ConfigError::InvalidOption(format!(
                "unknown Parquet writer version \"{other}\""
            ))),
        }
    }

    /// Create the writer properties these options describe.
    ///
    /// # Errors
    /// If the codec or writer version is unknown.
    pub fn writer_properties(&self) -> Result<WriterProperties, ConfigError> {
        Ok(WriterProperties::builder()
            .set_compression(self.compression()?)
            .set_writer_version(self.writer_version()?)
            .set_max_row_group_size(self.max_row_group_size.max(1))
            .set_data_page_size_limit(self.max_page_size)
            .set_dictionary_enabled(self.dictionary_enabled)
            .set_column_index_truncate_length(Some(self.column_truncate_length))
            .set_created_by(format!("ingest_core version {}", env!("CARGO_PKG_VERSION")))
            .build())
    }
}

/// One encoded Parquet file.
#[derive(Debug, Clone)]
pub struct EncodedFile {
    pub bytes: Bytes,
    pub rows: usize,
}

/// Every file of one partition.
#[derive(Debug, Clone)]
pub struct EncodedPartition {
    pub value: PartitionValue,
    /// `<column>=<value>` directory name
    pub directory: String,
    pub files: Vec<EncodedFile>,
}

impl EncodedPartition {
    #[must_use]
    pub fn rows(&self) -> usize {
        self.files.iter().map(|f| f.rows).sum()
    }
}

/// A dataset encoded for a partitioned write.
#[derive(Debug, Clone)]
pub struct EncodedDataset {
    pub dataset: String,
    pub partition_column: String,
    /// Columns of the source dataset, partition column included
    pub columns: Vec<ColumnDef>,
    pub compression: String,
    pub file_extension: &'static str,
    pub partitions: Vec<EncodedPartition>,
}

impl EncodedDataset {
    #[must_use]
    pub fn total_rows(&self) -> usize {
        self.partitions.iter().map(EncodedPartition::rows).sum()
    }

    #[must_use]
    pub fn total_files(&self) -> usize {
        self.partitions.iter().map(|p| p.files.len()).sum()
    }
}

/// Check every field of `schema` has a type the encoder supports.
///
/// # Errors
/// If the schema has no fields or a field's type is not supported.
pub fn check_encodable(schema: &Schema) -> Result<(), EncodeError> {
    if schema.fields().is_empty() {
        return Err(EncodeError::EmptySchema);
    }
    if let Some(field) = schema
        .fields()
        .iter()
        .find(|f| ColumnType::from_data_type(f.data_type()).is_none())
    {
        return Err(EncodeError::UnsupportedType {
            name: field.name().clone(),
            data_type: field.data_type().to_string(),
        });
    }
    Ok(())
}

fn describe(schema: &Schema) -> String {
    schema
        .fields()
        .iter()
        .map(|f| format!("{}: {}", f.name(), f.data_type()))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Encodes record batches to Parquet with fixed writer properties.
#[derive(Debug, Clone)]
pub struct ParquetEncoder {
    props: WriterProperties,
    compression: String,
    file_extension: &'static str,
}

impl ParquetEncoder {
    /// # Errors
    /// If the options name an unknown codec or writer version.
    pub fn new(options: &ParquetOptions) -> Result<Self, ConfigError> {
        Ok(Self {
            props: options.writer_properties()?,
            compression: options.compression.to_lowercase(),
            file_extension: options.file_extension()?,
        })
    }

    #[must_use]
    pub fn file_extension(&self) -> &'static str {
        self.file_extension
    }

    /// Encode `batches` into a single Parquet file.
    ///
    /// Values keep their declared types; the Arrow schema is embedded in the
    /// file so that reading it back yields the same types.
    ///
    /// # Errors
    /// If the schema is empty or has an unsupported type, a batch's columns
    /// differ from `schema` or Parquet encoding fails.
    pub fn encode(
        &self,
        schema: &SchemaRef,
        batches: &[RecordBatch],
    ) -> Result<EncodedFile, EncodeError> {
        check_encodable(schema)?;
        for batch in batches {
            let batch_schema = batch.schema();
            let matches = batch_schema.fields().len() == schema.fields().len()
                && batch_schema
                    .fields()
                    .iter()
                    .zip(schema.fields())
                    .all(|(a, e)| a.name() == e.name() && a.data_type() == e.data_type());
            if !matches {
                return Err(EncodeError::SchemaMismatch {
                    expected: describe(schema),
                    found: describe(&batch_schema),
                });
            }
        }

        let mut writer = ArrowWriter::try_new(Vec::new(), schema.clone(), Some(self.props.clone()))?;
        let mut rows = 0;
        for batch in batches {
            let batch = RecordBatch::try_new(schema.clone(), batch.columns().to_vec())?;
            writer.write(&batch)?;
            rows += batch.num_rows();
        }
        let bytes = writer.into_inner()?;
        Ok(EncodedFile {
            bytes: Bytes::from(bytes),
            rows,
        })
    }

    /// Split `dataset` by `partition_column` and encode every partition into
    /// files of at most `max_rows_per_file` rows. Data files leave out the
    /// partition column.
    ///
    /// # Errors
    /// If the dataset can't be encoded or split.
    pub fn encode_partitioned(
        &self,
        dataset: &Dataset,
        partition_column: &str,
        max_rows_per_file: usize,
    ) -> Result<EncodedDataset, EncodeError> {
        let full_schema = dataset.schema().arrow_schema();
        check_encodable(&full_schema)?;
        let file_schema = Arc::new(data_file_schema(&full_schema, partition_column));
        let max_rows = max_rows_per_file.max(1);

        let mut partitions = Vec::new();
        for slice in split_by_partition(dataset, partition_column)? {
            let rows = slice.batch.num_rows();
            let mut files = Vec::new();
            for offset in (0..rows).step_by(max_rows) {
                let chunk = slice.batch.slice(offset, max_rows.min(rows - offset));
                files.push(self.encode(&file_schema, &[chunk])?);
            }
            partitions.push(EncodedPartition {
                value: slice.value,
                directory: slice.directory,
                files,
            });
        }
        let encoded = EncodedDataset {
            dataset: dataset.name().to_owned(),
            partition_column: partition_column.to_owned(),
            columns: dataset.schema().columns().to_vec(),
            compression: self.compression.clone(),
            file_extension: self.file_extension,
            partitions,
        };
        info!(
            "Encoded {} rows of dataset \"{}\" into {} files across {} partitions",
            encoded.total_rows().to_formatted_string(&Locale::en),
            encoded.dataset,
            encoded.total_files(),
            encoded.partitions.len()
        );
        Ok(encoded)
    }
}
