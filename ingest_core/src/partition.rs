//! Hive style partitioning: mapping column values to `<column>=<value>`
//! directory names and splitting datasets by them.
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
use crate::{dataset::Dataset, schema::ColumnType};
use arrow::{
    array::{
        Array, ArrayRef, AsArray, Date32Array, Float64Array, Int64Array, RecordBatch, StringArray,
        UInt32Array, new_null_array,
    },
    compute::take_record_batch,
    datatypes::{Date32Type, Float64Type, Int64Type, Schema},
    error::ArrowError,
};
use chrono::NaiveDate;
use std::{collections::BTreeMap, fmt::Write, sync::Arc};

/// Directory value for rows whose partition value is null or empty.
pub const DEFAULT_PARTITION: &str = "__HIVE_DEFAULT_PARTITION__";

const DATE_FORMAT: &str = "%Y-%m-%d";

fn needs_escape(c: char) -> bool {
    c.is_ascii_control()
        || matches!(
            c,
            '"' | '#' | '%' | '\'' | '*' | '/' | ':' | '=' | '?' | '\\' | '{' | '[' | ']' | '^'
        )
}

/// Escape a value for use in a path segment, writing reserved characters as
/// `%XX` with upper-case hex digits.
#[must_use]
pub fn escape_path_value(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if needs_escape(c) {
            let _ = write!(escaped, "%{:02X}", c as u32);
        } else {
            escaped.push(c);
        }
    }
    escaped
}

/// Inverse of [`escape_path_value`]. A `%` not followed by two hex digits is kept as is.
#[must_use]
pub fn unescape_path_value(segment: &str) -> String {
    let bytes = segment.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
            if let Some(decoded) = hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                out.push(decoded);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// The value a row is partitioned on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PartitionValue {
    /// Null or empty source value
    Default,
    Value(String),
}

impl PartitionValue {
    fn from_text(text: &str) -> Self {
        if text.is_empty() {
            Self::Default
        } else {
            Self::Value(text.to_owned())
        }
    }

    /// The `<column>=<value>` directory name for this value.
    #[must_use]
    pub fn directory(&self, column: &str) -> String {
        match self {
            Self::Default => format!("{}={DEFAULT_PARTITION}", escape_path_value(column)),
            Self::Value(v) => format!("{}={}", escape_path_value(column), escape_path_value(v)),
        }
    }

    /// Parse a `<column>=<value>` directory name.
    ///
    /// Returns [`None`] if the segment is not a directory for `column`.
    #[must_use]
    pub fn parse_directory(column: &str, segment: &str) -> Option<Self> {
        let (name, value) = segment.split_once('=')?;
        if unescape_path_value(name) != column {
            return None;
        }
        if value == DEFAULT_PARTITION {
            Some(Self::Default)
        } else {
            Some(Self::from_text(&unescape_path_value(value)))
        }
    }

    /// The textual value, [`None`] for the default partition.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Default => None,
            Self::Value(v) => Some(v),
        }
    }

    /// Build a column of `len` copies of this value with the declared type.
    ///
    /// The default partition becomes nulls, so a directory named
    /// [`DEFAULT_PARTITION`] always reads back as null. [`partition_values`]
    /// refuses to write that text as a real value.
    ///
    /// # Errors
    /// If the text doesn't parse as `column_type`.
    pub fn to_array(&self, column_type: ColumnType, len: usize) -> Result<ArrayRef, ArrowError> {
        let Some(text) = self.as_text() else {
            return Ok(new_null_array(&column_type.data_type(), len));
        };
        let invalid = |e: &dyn std::fmt::Display| {
            ArrowError::ParseError(format!(
                "partition value \"{text}\" is not a valid {column_type}: {e}"
            ))
        };
        Ok(match column_type {
            ColumnType::Integer => {
                let v = text.parse::<i64>().map_err(|e| invalid(&e))?;
                Arc::new(Int64Array::from(vec![v; len]))
            }
            ColumnType::Float => {
                let v = text.parse::<f64>().map_err(|e| invalid(&e))?;
                Arc::new(Float64Array::from(vec![v; len]))
            }
            ColumnType::String => Arc::new(StringArray::from(vec![text; len])),
            ColumnType::Date => {
                let v = NaiveDate::parse_from_str(text, DATE_FORMAT).map_err(|e| invalid(&e))?;
                Arc::new(Date32Array::from(vec![Date32Type::from_naive_date(v); len]))
            }
        })
    }
}

/// Render each row of `array` as a partition value.
///
/// # Errors
/// If the array's type doesn't match `column_type`, or a string value is the
/// reserved [`DEFAULT_PARTITION`] text, which would read back as null.
pub fn partition_values(
    array: &dyn Array,
    column_type: ColumnType,
) -> Result<Vec<PartitionValue>, ArrowError> {
    if array.data_type() != &column_type.data_type() {
        return Err(ArrowError::SchemaError(format!(
            "partition column has type {} but {column_type} was declared",
            array.data_type()
        )));
    }
    let render = |i: usize, text: String| {
        if array.is_null(i) {
            PartitionValue::Default
        } else {
            PartitionValue::from_text(&text)
        }
    };
    Ok(match column_type {
        ColumnType::Integer => {
            let values = array.as_primitive::<Int64Type>();
            (0..array.len())
                .map(|i| render(i, values.value(i).to_string()))
                .collect()
        }
        ColumnType::Float => {
            let values = array.as_primitive::<Float64Type>();
            (0..array.len())
                .map(|i| render(i, values.value(i).to_string()))
                .collect()
        }
        ColumnType::String => {
            let values = array.as_string::<i32>();
            if let Some(row) =
                (0..array.len()).find(|&i| array.is_valid(i) && values.value(i) == DEFAULT_PARTITION)
            {
                return Err(ArrowError::InvalidArgumentError(format!(
                    "row {} has partition value \"{DEFAULT_PARTITION}\", which is reserved for null and empty values",
                    row + 1
                )));
            }
            (0..array.len())
                .map(|i| render(i, values.value(i).to_owned()))
                .collect()
        }
        ColumnType::Date => {
            let values = array.as_primitive::<Date32Type>();
            (0..array.len())
                .map(|i| {
                    render(
                        i,
                        Date32Type::to_naive_date(values.value(i))
                            .format(DATE_FORMAT)
                            .to_string(),
                    )
                })
                .collect()
        }
    })
}

/// The rows of one partition, without the partition column.
#[derive(Debug, Clone)]
pub struct PartitionSlice {
    pub value: PartitionValue,
    /// `<column>=<value>` directory name
    pub directory: String,
    pub batch: RecordBatch,
}

/// Group the rows of `dataset` by the value of `column`.
///
/// Every row lands in exactly one slice; rows with a null or empty value go to
/// the [`DEFAULT_PARTITION`]. Slices are ordered by directory name and keep the
/// source order of their rows.
///
/// # Errors
/// If `column` is not in the dataset or Arrow fails to gather the rows.
pub fn split_by_partition(
    dataset: &Dataset,
    column: &str,
) -> Result<Vec<PartitionSlice>, ArrowError> {
    let schema = dataset.schema();
    let (column_idx, column_def) = schema.column(column).ok_or_else(|| {
        ArrowError::SchemaError(format!(
            "partition column \"{column}\" is not in dataset \"{}\"",
            dataset.name()
        ))
    })?;
    let all = dataset.concat()?;
    let values = partition_values(all.column(column_idx).as_ref(), column_def.column_type)?;

    let mut groups: BTreeMap<String, (PartitionValue, Vec<u32>)> = BTreeMap::new();
    for (row, value) in values.into_iter().enumerate() {
        let row = u32::try_from(row).map_err(|_| {
            ArrowError::ComputeError("too many rows to partition in one dataset".into())
        })?;
        groups
            .entry(value.directory(column))
            .or_insert_with(|| (value, Vec::new()))
            .1
            .push(row);
    }

    let data_columns = (0..schema.len())
        .filter(|&i| i != column_idx)
        .collect::<Vec<_>>();
    let data = all.project(&data_columns)?;
    groups
        .into_iter()
        .map(|(directory, (value, rows))| {
            let batch = take_record_batch(&data, &UInt32Array::from(rows))?;
            Ok(PartitionSlice {
                value,
                directory,
                batch,
            })
        })
        .collect()
}

/// The Arrow schema of data files: every column but the partition column.
#[must_use]
pub fn data_file_schema(schema: &Schema, column: &str) -> Schema {
    Schema::new(
        schema
            .fields()
            .iter()
            .filter(|f| f.name() != column)
            .cloned()
            .collect::<Vec<_>>(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnDef, DatasetSchema};

    #[test]
    fn should_leave_plain_values_alone() {
        assert_eq!(escape_path_value("Engineering"), "Engineering");
        assert_eq!(escape_path_value("North East"), "North East");
        assert_eq!(escape_path_value("Zürich"), "Zürich");
    }

    #[test]
    fn should_escape_reserved_characters() {
        assert_eq!(escape_path_value("R&D/Ops"), "R&D%2FOps");
        assert_eq!(escape_path_value("a=b"), "a%3Db");
        assert_eq!(escape_path_value("50%"), "50%25");
        assert_eq!(escape_path_value("what?"), "what%3F");
        assert_eq!(escape_path_value("tab\there"), "tab%09here");
        assert_eq!(escape_path_value("x:y#z"), "x%3Ay%23z");
    }

    #[test]
    fn should_unescape_to_original() {
        for value in ["R&D/Ops", "50%", "a=b", "[x]^{y}", "\"q\"", "Zürich", "dot.ted"] {
            assert_eq!(unescape_path_value(&escape_path_value(value)), value);
        }
    }

    #[test]
    fn should_keep_incomplete_escapes() {
        assert_eq!(unescape_path_value("100%"), "100%");
        assert_eq!(unescape_path_value("%zz"), "%zz");
        assert_eq!(unescape_path_value("%4"), "%4");
    }

    #[test]
    fn should_name_directories() {
        assert_eq!(
            PartitionValue::Value("Sales".into()).directory("department"),
            "department=Sales"
        );
        assert_eq!(
            PartitionValue::Default.directory("region"),
            "region=__HIVE_DEFAULT_PARTITION__"
        );
    }

    #[test]
    fn should_parse_directories() {
        assert_eq!(
            PartitionValue::parse_directory("department", "department=R&D%2FOps"),
            Some(PartitionValue::Value("R&D/Ops".into()))
        );
        assert_eq!(
            PartitionValue::parse_directory("region", "region=__HIVE_DEFAULT_PARTITION__"),
            Some(PartitionValue::Default)
        );
        assert_eq!(
            PartitionValue::parse_directory("region", "department=Sales"),
            None
        );
        assert_eq!(PartitionValue::parse_directory("region", "part-0.parquet"), None);
    }

    #[test]
    fn should_rebuild_typed_columns() -> Result<(), ArrowError> {
        // When
        let ints = PartitionValue::Value("42".into()).to_array(ColumnType::Integer, 2)?;
        let dates = PartitionValue::Value("2023-03-01".into()).to_array(ColumnType::Date, 1)?;
        let nulls = PartitionValue::Default.to_array(ColumnType::Float, 3)?;

        // Then
        assert_eq!(ints.as_primitive::<Int64Type>().values().to_vec(), vec![42, 42]);
        assert_eq!(
            Date32Type::to_naive_date(dates.as_primitive::<Date32Type>().value(0)),
            NaiveDate::from_ymd_opt(2023, 3, 1).unwrap()
        );
        assert_eq!(nulls.null_count(), 3);
        Ok(())
    }

    #[test]
    fn should_fail_to_rebuild_bad_value() {
        // When
        let result = PartitionValue::Value("abc".into()).to_array(ColumnType::Integer, 1);

        // Then
        assert!(matches!(result, Err(ArrowError::ParseError(_))));
    }

    fn regions(values: Vec<Option<&str>>) -> Dataset {
        let schema = Arc::new(
            DatasetSchema::new(vec![
                ColumnDef::new("id", ColumnType::Integer, false),
                ColumnDef::new("region", ColumnType::String, true),
            ])
            .unwrap(),
        );
        let ids = (0..values.len() as i64).collect::<Vec<_>>();
        let batch = RecordBatch::try_new(
            schema.arrow_schema(),
            vec![
                Arc::new(Int64Array::from(ids)),
                Arc::new(StringArray::from(values)),
            ],
        )
        .unwrap();
        Dataset::try_new("sales", schema, vec![batch]).unwrap()
    }

    #[test]
    fn should_split_rows_by_value() -> Result<(), ArrowError> {
        // Given
        let dataset = regions(vec![
            Some("South"),
            Some("North"),
            None,
            Some("South"),
            Some(""),
        ]);

        // When
        let slices = split_by_partition(&dataset, "region")?;

        // Then
        let summary = slices
            .iter()
            .map(|s| (s.directory.as_str(), s.batch.num_rows()))
            .collect::<Vec<_>>();
        assert_eq!(
            summary,
            vec![
                ("region=North", 1),
                ("region=South", 2),
                ("region=__HIVE_DEFAULT_PARTITION__", 2),
            ]
        );
        let south_ids = slices[1].batch.column(0).as_primitive::<Int64Type>();
        assert_eq!(south_ids.values().to_vec(), vec![0, 3]);
        assert_eq!(slices[1].batch.num_columns(), 1);
        Ok(())
    }

    #[test]
    fn should_split_deterministically() -> Result<(), ArrowError> {
        // Given
        let dataset = regions(vec![Some("b"), Some("a"), Some("c"), Some("a")]);

        // When
        let first = split_by_partition(&dataset, "region")?;
        let second = split_by_partition(&dataset, "region")?;

        // Then
        let dirs = |s: &[PartitionSlice]| s.iter().map(|p| p.directory.clone()).collect::<Vec<_>>();
        assert_eq!(dirs(&first), dirs(&second));
        assert_eq!(
            first.iter().map(|s| s.batch.num_rows()).sum::<usize>(),
            dataset.num_rows()
        );
        Ok(())
    }

    #[test]
    fn should_refuse_value_spelled_like_default_partition() {
        // Given
        let dataset = regions(vec![Some("North"), Some(DEFAULT_PARTITION), None]);

        // When
        let result = split_by_partition(&dataset, "region");

        // Then
        match result {
            Err(ArrowError::InvalidArgumentError(message)) => {
                assert!(message.starts_with("row 2 has partition value"), "{message}");
            }
            other => panic!("expected the reserved value to be refused, got {other:?}"),
        }
    }

    #[test]
    fn should_fail_on_unknown_column() {
        // Given
        let dataset = regions(vec![Some("a")]);

        // When
        let result = split_by_partition(&dataset, "department");

        // Then
        assert!(matches!(result, Err(ArrowError::SchemaError(_))));
    }

    #[test]
    fn should_drop_partition_column_from_file_schema() {
        // Given
        let dataset = regions(vec![]);

        // When
        let schema = data_file_schema(&dataset.schema().arrow_schema(), "region");

        // Then
        assert_eq!(schema.fields().len(), 1);
        assert_eq!(schema.field(0).name(), "id");
    }
}
