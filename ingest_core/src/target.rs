//! Parsing and validation of dataset storage locations.
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
use crate::{config::ConfigError, schema::DatasetSchema};
use object_store::path::Path;
use std::fmt::{Display, Formatter};
use url::Url;

/// Where a dataset is written and which column partitions it.
///
/// Locations are `s3://<bucket>/<base path>`, `file:///<base path>` or
/// `memory://<name>/<base path>` URLs. `s3a` URLs are treated as `s3`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageTarget {
    location: Url,
    base_path: Path,
    partition_column: String,
}

impl StorageTarget {
    /// # Errors
    /// If the location has no bucket where one is needed, or its path is not a
    /// valid object store path, or the partition column name is empty.
    pub fn new(mut location: Url, partition_column: impl Into<String>) -> Result<Self, ConfigError> {
        let partition_column = partition_column.into();
        let invalid = |location: &Url, reason: &str| ConfigError::InvalidLocation {
            location: location.to_string(),
            reason: reason.to_owned(),
        };
        if location.scheme() == "s3a" && location.set_scheme("s3").is_err() {
            return Err(invalid(&location, "can't be rewritten as an s3 location"));
        }
        if matches!(location.scheme(), "s3" | "memory")
            && location.host_str().is_none_or(str::is_empty)
        {
            return Err(invalid(&location, "no bucket name"));
        }
        if partition_column.is_empty() {
            return Err(invalid(&location, "partition column name is empty"));
        }
        let base_path = Path::from_url_path(location.path())
            .map_err(|e| invalid(&location, &e.to_string()))?;
        Ok(Self {
            location,
            base_path,
            partition_column,
        })
    }

    /// Parse a location that is either a URL or a local file system path.
    ///
    /// # Errors
    /// As for [`StorageTarget::new`], or if a local path can't be made absolute.
    pub fn parse(location: &str, partition_column: impl Into<String>) -> Result<Self, ConfigError> {
        let url = match Url::parse(location) {
            Ok(url) if url.scheme().len() > 1 => url,
            _ => std::path::absolute(location)
                .ok()
                .and_then(|p| Url::from_directory_path(p).ok())
                .ok_or_else(|| ConfigError::InvalidLocation {
                    location: location.to_owned(),
                    reason: "not a URL or an absolute path".into(),
                })?,
        };
        Self::new(url, partition_column)
    }

    #[must_use]
    pub fn location(&self) -> &Url {
        &self.location
    }

    #[must_use]
    pub fn is_s3(&self) -> bool {
        self.location.scheme() == "s3"
    }

    #[must_use]
    pub fn bucket(&self) -> Option<&str> {
        self.location.host_str()
    }

    /// The object path data is written under.
    #[must_use]
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    #[must_use]
    pub fn partition_column(&self) -> &str {
        &self.partition_column
    }

    /// Path of an object below the base path. `relative` is taken verbatim so
    /// escapes already applied to it are kept.
    ///
    /// # Errors
    /// If `relative` is not a valid object store path.
    pub fn child(&self, relative: &str) -> Result<Path, object_store::path::Error> {
        if self.base_path.as_ref().is_empty() {
            Path::parse(relative)
        } else {
            Path::parse(format!("{}/{relative}", self.base_path))
        }
    }

    /// `path` relative to the base path, if it is below it.
    #[must_use]
    pub fn relative<'a>(&self, path: &'a Path) -> Option<&'a str> {
        let base = self.base_path.as_ref();
        if base.is_empty() {
            Some(path.as_ref())
        } else {
            path.as_ref()
                .strip_prefix(base)
                .and_then(|rest| rest.strip_prefix('/'))
        }
    }

    /// Full location of an object for messages.
    #[must_use]
    pub fn describe(&self, path: &Path) -> String {
        match self.location.host_str() {
            Some(host) if !host.is_empty() => {
                format!("{}://{host}/{path}", self.location.scheme())
            }
            _ => format!("{}:///{path}", self.location.scheme()),
        }
    }

    /// Check the partition column belongs to `schema` and isn't its only column.
    ///
    /// # Errors
    /// If the column is missing from the schema or is the only column.
    pub fn validate_for(&self, dataset: &str, schema: &DatasetSchema) -> Result<(), ConfigError> {
        if schema.column(&self.partition_column).is_none() {
            return Err(ConfigError::UnknownPartitionColumn {
                dataset: dataset.to_owned(),
                column: self.partition_column.clone(),
            });
        }
        if schema.len() == 1 {
            return Err(ConfigError::PartitionColumnOnly {
                dataset: dataset.to_owned(),
                column: self.partition_column.clone(),
            });
        }
        Ok(())
    }
}

impl Display for StorageTarget {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} partitioned by \"{}\"",
            self.location, self.partition_column
        )
    }
}
