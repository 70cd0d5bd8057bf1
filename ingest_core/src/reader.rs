//! Loads delimited text files into [`Dataset`]s under an explicit schema.
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
    schema::{ColumnDef, ColumnType, DatasetSchema, SchemaError},
};
use arrow::{
    csv::reader::{Format, ReaderBuilder},
    datatypes::Schema,
    error::ArrowError,
};
use log::{info, warn};
use num_format::{Locale, ToFormattedString};
use std::{
    fs::File,
    io::{Seek, SeekFrom},
    path::{Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReadError {
    #[error("source file {0} does not exist")]
    Missing(PathBuf),
    #[error("could not read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("{0} has no header row")]
    NoHeader(PathBuf),
    #[error("header of {path} does not match the schema: expected [{expected}], found [{found}]")]
    HeaderMismatch {
        path: PathBuf,
        expected: String,
        found: String,
    },
    #[error("could not parse {path}: {source}")]
    Parse { path: PathBuf, source: ArrowError },
    #[error("could not derive a schema from {path}: {source}")]
    Schema { path: PathBuf, source: SchemaError },
}

/// CSV dialect and batching settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CsvOptions {
    pub delimiter: u8,
    pub quote: u8,
    /// Rows per record batch
    pub batch_size: usize,
}

impl Default for CsvOptions {
    fn default() -> Self {
        Self {
            delimiter: b',',
            quote: b'"',
            batch_size: 8192,
        }
    }
}

impl CsvOptions {
    /// # Errors
    /// If the batch size is zero or the delimiter and quote are the same byte.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::InvalidOption(
                "CSV batch size must be at least 1".into(),
            ));
        }
        if self.delimiter == self.quote {
            return Err(ConfigError::InvalidOption(
                "CSV delimiter and quote character must differ".into(),
            ));
        }
        Ok(())
    }

    fn format(&self) -> Format {
        Format::default()
            .with_header(true)
            .with_delimiter(self.delimiter)
            .with_quote(self.quote)
    }
}

fn open(path: &Path) -> Result<File, ReadError> {
    if !path.exists() {
        return Err(ReadError::Missing(path.to_owned()));
    }
    File::open(path).map_err(|source| ReadError::Io {
        path: path.to_owned(),
        source,
    })
}

/// Read only the header row, leaving `file` rewound to the start.
fn read_header(path: &Path, file: &mut File, options: &CsvOptions) -> Result<Schema, ReadError> {
    let len = file
        .metadata()
        .map_err(|source| ReadError::Io {
            path: path.to_owned(),
            source,
        })?
        .len();
    if len == 0 {
        return Err(ReadError::NoHeader(path.to_owned()));
    }
    let (header, _) = options
        .format()
        .infer_schema(&mut *file, Some(0))
        .map_err(|source| ReadError::Parse {
            path: path.to_owned(),
            source,
        })?;
    file.seek(SeekFrom::Start(0))
        .map_err(|source| ReadError::Io {
            path: path.to_owned(),
            source,
        })?;
    if header.fields().is_empty() {
        return Err(ReadError::NoHeader(path.to_owned()));
    }
    Ok(header)
}

/// Load a CSV file as a dataset.
///
/// The header row must name exactly the schema's columns, in order and
/// case-sensitively. Every value is parsed as its declared type; empty fields
/// become nulls. Rows with the wrong number of fields and values that fail to
/// parse are errors, never padded, truncated or coerced.
///
/// # Errors
/// If the file is missing or unreadable, the header doesn't match the schema or
/// any row fails to parse.
pub fn read_csv(
    name: &str,
    path: &Path,
    schema: Arc<DatasetSchema>,
    options: &CsvOptions,
) -> Result<Dataset, ReadError> {
    let mut file = open(path)?;
    let header = read_header(path, &mut file, options)?;
    let found = header
        .fields()
        .iter()
        .map(|f| f.name().as_str())
        .collect::<Vec<_>>();
    let expected = schema.names().collect::<Vec<_>>();
    if found != expected {
        return Err(ReadError::HeaderMismatch {
            path: path.to_owned(),
            expected: expected.join(", "),
            found: found.join(", "),
        });
    }

    let reader = ReaderBuilder::new(schema.arrow_schema())
        .with_format(options.format())
        .with_batch_size(options.batch_size)
        .build(file)
        .map_err(|source| ReadError::Parse {
            path: path.to_owned(),
            source,
        })?;
    let batches = reader
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| ReadError::Parse {
            path: path.to_owned(),
            source,
        })?;
    let dataset = Dataset::try_new(name, schema, batches).map_err(|source| ReadError::Parse {
        path: path.to_owned(),
        source,
    })?;
    info!(
        "Read {} rows of dataset \"{name}\" from {}",
        dataset.num_rows().to_formatted_string(&Locale::en),
        path.display()
    );
    Ok(dataset)
}

/// Derive a schema from the header and the first `max_records` rows of a CSV file.
///
/// Inference is a one-off step: callers save the result with
/// [`DatasetSchema::save`] and pass the saved schema to later runs. Columns
/// whose values fit none of the supported types are declared as strings.
///
/// # Errors
/// If the file can't be read or has no header.
pub fn infer_schema(
    path: &Path,
    options: &CsvOptions,
    max_records: Option<usize>,
) -> Result<DatasetSchema, ReadError> {
    let mut file = open(path)?;
    read_header(path, &mut file, options)?;
    let (inferred, records) = options
        .format()
        .infer_schema(file, max_records)
        .map_err(|source| ReadError::Parse {
            path: path.to_owned(),
            source,
        })?;
    let columns = inferred
        .fields()
        .iter()
        .map(|field| {
            let column_type = ColumnType::from_data_type(field.data_type()).unwrap_or_else(|| {
                warn!(
                    "Column \"{}\" looks like {}, declaring it as string",
                    field.name(),
                    field.data_type()
                );
                ColumnType::String
            });
            ColumnDef::new(field.name(), column_type, true)
        })
        .collect();
    info!(
        "Inferred schema of {} from {} records",
        path.display(),
        records.to_formatted_string(&Locale::en)
    );
    DatasetSchema::new(columns).map_err(|source| ReadError::Schema {
        path: path.to_owned(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{employees, sales};
    use arrow::array::{Array, AsArray, RecordBatch};
    use arrow::datatypes::{Date32Type, Float64Type, Int64Type};
    use chrono::NaiveDate;
    use std::io::Write;
    use tempfile::{NamedTempFile, tempdir};

    fn write_csv(lines: &[&str]) -> NamedTempFile {
        let mut tmp = NamedTempFile::new().unwrap();
        for line in lines {
            writeln!(tmp, "{line}").unwrap();
        }
        tmp
    }

    fn employees_csv() -> NamedTempFile {
        write_csv(&[
            "employee_id,name,department,salary,hire_date",
            "1,Alice,Engineering,85000.5,2020-01-15",
            "2,Bob,Sales,,2019-06-01",
            "3,\"Smith, Carol\",HR,61000,",
        ])
    }

    fn first_batch(dataset: &Dataset) -> &RecordBatch {
        &dataset.batches()[0]
    }

    #[test]
    fn should_read_typed_values() -> Result<(), ReadError> {
        // Given
        let csv = employees_csv();

        // When
        let dataset = read_csv(
            "employees",
            csv.path(),
            Arc::new(employees()),
            &CsvOptions::default(),
        )?;

        // Then
        assert_eq!(dataset.num_rows(), 3);
        let batch = first_batch(&dataset);
        let ids = batch.column(0).as_primitive::<Int64Type>();
        assert_eq!(ids.values().to_vec(), vec![1, 2, 3]);
        let names = batch.column(1).as_string::<i32>();
        assert_eq!(names.value(2), "Smith, Carol");
        let salaries = batch.column(3).as_primitive::<Float64Type>();
        assert!((salaries.value(0) - 85000.5).abs() < f64::EPSILON);
        assert!(salaries.is_null(1));
        let dates = batch.column(4).as_primitive::<Date32Type>();
        assert_eq!(
            Date32Type::to_naive_date(dates.value(0)),
            NaiveDate::from_ymd_opt(2020, 1, 15).unwrap()
        );
        assert!(dates.is_null(2));
        Ok(())
    }

    #[test]
    fn should_fail_on_missing_file() {
        // Given
        let dir = tempdir().unwrap();

        // When
        let result = read_csv(
            "employees",
            &dir.path().join("missing.csv"),
            Arc::new(employees()),
            &CsvOptions::default(),
        );

        // Then
        assert!(matches!(result, Err(ReadError::Missing(_))));
    }

    #[test]
    fn should_fail_on_empty_file() {
        // Given
        let csv = write_csv(&[]);

        // When
        let result = read_csv(
            "employees",
            csv.path(),
            Arc::new(employees()),
            &CsvOptions::default(),
        );

        // Then
        assert!(matches!(result, Err(ReadError::NoHeader(_))));
    }

    #[test]
    fn should_fail_on_header_case_mismatch() {
        // Given
        let csv = write_csv(&[
            "Employee_Id,name,department,salary,hire_date",
            "1,Alice,Engineering,1.0,2020-01-15",
        ]);

        // When
        let result = read_csv(
            "employees",
            csv.path(),
            Arc::new(employees()),
            &CsvOptions::default(),
        );

        // Then
        let Err(ReadError::HeaderMismatch { found, .. }) = result else {
            panic!("expected header mismatch, got {result:?}");
        };
        assert!(found.starts_with("Employee_Id"));
    }

    #[test]
    fn should_fail_on_reordered_header() {
        // Given
        let csv = write_csv(&[
            "name,employee_id,department,salary,hire_date",
            "Alice,1,Engineering,1.0,2020-01-15",
        ]);

        // When
        let result = read_csv(
            "employees",
            csv.path(),
            Arc::new(employees()),
            &CsvOptions::default(),
        );

        // Then
        assert!(matches!(result, Err(ReadError::HeaderMismatch { .. })));
    }

    #[test]
    fn should_fail_on_non_numeric_integer() {
        // Given
        let csv = write_csv(&[
            "employee_id,name,department,salary,hire_date",
            "1,Alice,Engineering,1.0,2020-01-15",
            "two,Bob,Sales,2.0,2020-01-16",
        ]);

        // When
        let result = read_csv(
            "employees",
            csv.path(),
            Arc::new(employees()),
            &CsvOptions::default(),
        );

        // Then
        assert!(matches!(result, Err(ReadError::Parse { .. })));
    }

    #[test]
    fn should_fail_on_short_row() {
        // Given
        let csv = write_csv(&[
            "employee_id,name,department,salary,hire_date",
            "1,Alice,Engineering,1.0",
        ]);

        // When
        let result = read_csv(
            "employees",
            csv.path(),
            Arc::new(employees()),
            &CsvOptions::default(),
        );

        // Then
        assert!(matches!(result, Err(ReadError::Parse { .. })));
    }

    #[test]
    fn should_fail_on_null_in_required_column() {
        // Given
        let csv = write_csv(&[
            "employee_id,name,department,salary,hire_date",
            ",Alice,Engineering,1.0,2020-01-15",
        ]);

        // When
        let result = read_csv(
            "employees",
            csv.path(),
            Arc::new(employees()),
            &CsvOptions::default(),
        );

        // Then
        assert!(matches!(result, Err(ReadError::Parse { .. })));
    }

    #[test]
    fn should_fail_on_invalid_date() {
        // Given
        let csv = write_csv(&[
            "sale_id,product,region,quantity,unit_price,sale_date",
            "1,Widget,North,2,9.99,15/01/2023",
        ]);

        // When
        let result = read_csv(
            "sales",
            csv.path(),
            Arc::new(sales()),
            &CsvOptions::default(),
        );

        // Then
        assert!(matches!(result, Err(ReadError::Parse { .. })));
    }

    #[test]
    fn should_honour_delimiter_and_batch_size() -> Result<(), ReadError> {
        // Given
        let csv = write_csv(&[
            "sale_id;product;region;quantity;unit_price;sale_date",
            "1;Widget;North;2;9.99;2023-01-15",
            "2;Gadget;South;1;19.5;2023-01-16",
            "3;Widget;;4;9.99;2023-01-17",
        ]);
        let options = CsvOptions {
            delimiter: b';',
            batch_size: 2,
            ..CsvOptions::default()
        };

        // When
        let dataset = read_csv("sales", csv.path(), Arc::new(sales()), &options)?;

        // Then
        assert_eq!(dataset.batches().len(), 2);
        assert_eq!(dataset.num_rows(), 3);
        Ok(())
    }

    #[test]
    fn should_infer_schema_from_sample() -> Result<(), ReadError> {
        // Given
        let csv = employees_csv();

        // When
        let schema = infer_schema(csv.path(), &CsvOptions::default(), None)?;

        // Then
        let types = schema
            .columns()
            .iter()
            .map(|c| (c.name.as_str(), c.column_type))
            .collect::<Vec<_>>();
        assert_eq!(
            types,
            vec![
                ("employee_id", ColumnType::Integer),
                ("name", ColumnType::String),
                ("department", ColumnType::String),
                ("salary", ColumnType::Float),
                ("hire_date", ColumnType::Date),
            ]
        );
        Ok(())
    }

    #[test]
    fn should_reject_equal_delimiter_and_quote() {
        // Given
        let options = CsvOptions {
            delimiter: b'"',
            ..CsvOptions::default()
        };

        // Then
        assert!(options.validate().is_err());
    }
}
