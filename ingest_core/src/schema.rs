//! Explicit column declarations for ingested datasets.
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
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashSet,
    fmt::{Display, Formatter},
    path::{Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("column names must not be empty")]
    EmptyColumnName,
    #[error("duplicate column \"{0}\"")]
    DuplicateColumn(String),
    #[error("column \"{name}\" has unsupported type {data_type}")]
    UnsupportedType { name: String, data_type: DataType },
    #[error("unknown built-in schema \"{0}\"")]
    UnknownBuiltin(String),
    #[error("could not access schema file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid schema file {path}: {source}")]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// The semantic type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Integer,
    Float,
    String,
    Date,
}

impl ColumnType {
    /// The Arrow type values of this column are held as.
    #[must_use]
    pub fn data_type(self) -> DataType {
        match self {
            Self::Integer => DataType::Int64,
            Self::Float => DataType::Float64,
            Self::String => DataType::Utf8,
            Self::Date => DataType::Date32,
        }
    }

    /// Inverse of [`ColumnType::data_type`]. No widening is applied, so `Int32`
    /// is not an integer column.
    #[must_use]
    pub fn from_data_type(data_type: &DataType) -> Option<Self> {
        match data_type {
            DataType::Int64 => Some(Self::Integer),
            DataType::Float64 => Some(Self::Float),
            DataType::Utf8 => Some(Self::String),
            DataType::Date32 => Some(Self::Date),
            _ => None,
        }
    }
}

impl Display for ColumnType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Integer => "integer",
            Self::Float => "float",
            Self::String => "string",
            Self::Date => "date",
        })
    }
}

const fn nullable_default() -> bool {
    true
}

/// A single declared column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    #[serde(default = "nullable_default")]
    pub nullable: bool,
}

impl ColumnDef {
    #[must_use]
    pub fn new(name: impl Into<String>, column_type: ColumnType, nullable: bool) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable,
        }
    }

    fn to_field(&self) -> Field {
        Field::new(&self.name, self.column_type.data_type(), self.nullable)
    }
}

/// Ordered, immutable set of column declarations attached to a dataset.
///
/// The schema decides how each CSV field is parsed and how it is encoded, so
/// it is built once and shared behind an [`Arc`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<ColumnDef>", into = "Vec<ColumnDef>")]
pub struct DatasetSchema {
    columns: Vec<ColumnDef>,
    arrow: SchemaRef,
}

impl DatasetSchema {
    /// Create a schema from column declarations.
    ///
    /// An empty column list is accepted here; the encoder rejects it.
    ///
    /// # Errors
    /// If a column name is empty or repeated.
    pub fn new(columns: Vec<ColumnDef>) -> Result<Self, SchemaError> {
        let mut seen = HashSet::new();
        for column in &columns {
            if column.name.is_empty() {
                return Err(SchemaError::EmptyColumnName);
            }
            if !seen.insert(column.name.as_str()) {
                return Err(SchemaError::DuplicateColumn(column.name.clone()));
            }
        }
        let arrow = Arc::new(Schema::new(
            columns.iter().map(ColumnDef::to_field).collect::<Vec<_>>(),
        ));
        Ok(Self { columns, arrow })
    }

    /// Derive a schema from an Arrow schema.
    ///
    /// # Errors
    /// If a field has a type outside the four supported column types.
    pub fn from_arrow(schema: &Schema) -> Result<Self, SchemaError> {
        let columns = schema
            .fields()
            .iter()
            .map(|field| {
                ColumnType::from_data_type(field.data_type())
                    .map(|column_type| {
                        ColumnDef::new(field.name(), column_type, field.is_nullable())
                    })
                    .ok_or_else(|| SchemaError::UnsupportedType {
                        name: field.name().clone(),
                        data_type: field.data_type().clone(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(columns)
    }

    #[must_use]
    pub fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Column names in declaration order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }

    /// Find a column by (case-sensitive) name.
    #[must_use]
    pub fn column(&self, name: &str) -> Option<(usize, &ColumnDef)> {
        self.columns.iter().enumerate().find(|(_, c)| c.name == name)
    }

    #[must_use]
    pub fn arrow_schema(&self) -> SchemaRef {
        self.arrow.clone()
    }

    /// True when both schemas declare the same column names with the same types,
    /// irrespective of order and nullability.
    #[must_use]
    pub fn same_columns(&self, other: &DatasetSchema) -> bool {
        let mut ours = self
            .columns
            .iter()
            .map(|c| (c.name.as_str(), c.column_type))
            .collect::<Vec<_>>();
        let mut theirs = other
            .columns
            .iter()
            .map(|c| (c.name.as_str(), c.column_type))
            .collect::<Vec<_>>();
        ours.sort_unstable();
        theirs.sort_unstable();
        ours == theirs
    }

    /// Load a schema from a JSON file holding a list of columns.
    ///
    /// # Errors
    /// If the file can't be read or doesn't hold a valid schema.
    pub fn load(path: &Path) -> Result<Self, SchemaError> {
        let text = std::fs::read_to_string(path).map_err(|source| SchemaError::Io {
            path: path.to_owned(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| SchemaError::Json {
            path: path.to_owned(),
            source,
        })
    }

    /// Write this schema to a JSON file that [`DatasetSchema::load`] reads.
    ///
    /// # Errors
    /// If the file can't be written.
    pub fn save(&self, path: &Path) -> Result<(), SchemaError> {
        let text = serde_json::to_string_pretty(self).map_err(|source| SchemaError::Json {
            path: path.to_owned(),
            source,
        })?;
        std::fs::write(path, text + "\n").map_err(|source| SchemaError::Io {
            path: path.to_owned(),
            source,
        })
    }

    /// Look up one of the built-in dataset schemas by name.
    ///
    /// # Errors
    /// If there is no built-in schema with that name.
    pub fn builtin(name: &str) -> Result<Self, SchemaError> {
        match name {
            "employees" => Ok(employees()),
            "sales" => Ok(sales()),
            _ => Err(SchemaError::UnknownBuiltin(name.to_owned())),
        }
    }
}

impl TryFrom<Vec<ColumnDef>> for DatasetSchema {
    type Error = SchemaError;

    fn try_from(columns: Vec<ColumnDef>) -> Result<Self, Self::Error> {
        Self::new(columns)
    }
}

impl From<DatasetSchema> for Vec<ColumnDef> {
    fn from(schema: DatasetSchema) -> Self {
        schema.columns
    }
}

/// Prints the schema as a tree, one column per line.
impl Display for DatasetSchema {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "root")?;
        for column in &self.columns {
            writeln!(
                f,
                " |-- {}: {} (nullable = {})",
                column.name, column.column_type, column.nullable
            )?;
        }
        Ok(())
    }
}

/// Schema of the employees dataset.
///
/// # Panics
/// Never: the column list is fixed and valid.
#[must_use]
pub fn employees() -> DatasetSchema {
    DatasetSchema::new(vec![
        ColumnDef::new("employee_id", ColumnType::Integer, false),
        ColumnDef::new("name", ColumnType::String, true),
        ColumnDef::new("department", ColumnType::String, true),
        ColumnDef::new("salary", ColumnType::Float, true),
        ColumnDef::new("hire_date", ColumnType::Date, true),
    ])
    .expect("built-in employees schema is valid")
}

/// Schema of the sales dataset.
///
/// # Panics
/// Never: the column list is fixed and valid.
#[must_use]
pub fn sales() -> DatasetSchema {
    DatasetSchema::new(vec![
        ColumnDef::new("sale_id", ColumnType::Integer, false),
        ColumnDef::new("product", ColumnType::String, true),
        ColumnDef::new("region", ColumnType::String, true),
        ColumnDef::new("quantity", ColumnType::Integer, true),
        ColumnDef::new("unit_price", ColumnType::Float, true),
        ColumnDef::new("sale_date", ColumnType::Date, true),
    ])
    .expect("built-in sales schema is valid")
}
