//! In-memory datasets: named record batches under a declared schema.
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
use crate::schema::DatasetSchema;
use arrow::{
    array::RecordBatch, compute::concat_batches, error::ArrowError,
    util::pretty::pretty_format_batches,
};
use std::sync::Arc;

/// A named, in-memory table whose every batch carries exactly the columns of
/// its schema.
#[derive(Debug, Clone)]
pub struct Dataset {
    name: String,
    schema: Arc<DatasetSchema>,
    batches: Vec<RecordBatch>,
}

impl Dataset {
    /// Create a dataset.
    ///
    /// # Errors
    /// If a batch doesn't have the schema's column names and types.
    pub fn try_new(
        name: impl Into<String>,
        schema: Arc<DatasetSchema>,
        batches: Vec<RecordBatch>,
    ) -> Result<Self, ArrowError> {
        let expected = schema.arrow_schema();
        for batch in &batches {
            let actual = batch.schema();
            let matches = actual.fields().len() == expected.fields().len()
                && actual
                    .fields()
                    .iter()
                    .zip(expected.fields())
                    .all(|(a, e)| a.name() == e.name() && a.data_type() == e.data_type());
            if !matches {
                return Err(ArrowError::SchemaError(format!(
                    "record batch schema {actual} does not match dataset schema {expected}"
                )));
            }
        }
        Ok(Self {
            name: name.into(),
            schema,
            batches,
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn schema(&self) -> &Arc<DatasetSchema> {
        &self.schema
    }

    #[must_use]
    pub fn batches(&self) -> &[RecordBatch] {
        &self.batches
    }

    #[must_use]
    pub fn num_rows(&self) -> usize {
        self.batches.iter().map(RecordBatch::num_rows).sum()
    }

    /// All rows as one batch.
    ///
    /// # Errors
    /// If Arrow fails to concatenate the batches.
    pub fn concat(&self) -> Result<RecordBatch, ArrowError> {
        concat_batches(&self.schema.arrow_schema(), &self.batches)
    }

    /// Render the first `rows` rows as a text table.
    ///
    /// # Errors
    /// If Arrow can't format a value.
    pub fn preview(&self, rows: usize) -> Result<String, ArrowError> {
        let mut remaining = rows;
        let mut head = Vec::new();
        for batch in &self.batches {
            if remaining == 0 {
                break;
            }
            let take = remaining.min(batch.num_rows());
            head.push(batch.slice(0, take));
            remaining -= take;
        }
        if head.is_empty() {
            head.push(RecordBatch::new_empty(self.schema.arrow_schema()));
        }
        Ok(pretty_format_batches(&head)?.to_string())
    }
}
