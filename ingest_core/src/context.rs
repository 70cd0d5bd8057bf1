//! Defines the execution context shared by every stage of an ingestion run.
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
    config::{ConfigError, IngestOptions, ObjectStoreConfig},
    encoder::ParquetEncoder,
    retry::RetryPolicy,
    target::StorageTarget,
};
use chrono::Utc;
use log::info;
use num_format::{Locale, ToFormattedString};
use object_store::ObjectStore;
use objectstore_ext::s3::ObjectStoreFactory;
use std::{sync::Arc, time::Instant};

/// Holds the object store clients, encoder and options of a run.
///
/// Built once at start-up and passed explicitly to every stage. Call
/// [`IngestContext::shutdown`] when the run is over to release the clients and
/// log what they did.
#[derive(Debug)]
pub struct IngestContext {
    factory: ObjectStoreFactory,
    encoder: ParquetEncoder,
    options: IngestOptions,
    started: Instant,
}

impl IngestContext {
    /// Create a context. `store_config` is required only for `s3` targets and
    /// is validated here when given.
    ///
    /// # Errors
    /// If `store_config` doesn't validate or the Parquet options are invalid.
    pub fn new(
        store_config: Option<&ObjectStoreConfig>,
        options: IngestOptions,
    ) -> Result<Self, ConfigError> {
        let s3_config = store_config
            .map(ObjectStoreConfig::to_s3_builder)
            .transpose()?;
        if let Some(config) = store_config {
            info!("Object store {config}");
        }
        info!("Ingest options: {options}");
        Ok(Self {
            factory: ObjectStoreFactory::new(s3_config),
            encoder: ParquetEncoder::new(options.parquet())?,
            options,
            started: Instant::now(),
        })
    }

    #[must_use]
    pub fn options(&self) -> &IngestOptions {
        &self.options
    }

    #[must_use]
    pub fn retry_policy(&self) -> &RetryPolicy {
        self.options.retry()
    }

    #[must_use]
    pub fn encoder(&self) -> &ParquetEncoder {
        &self.encoder
    }

    /// The object store holding `target`. Stores are created on first use and
    /// reused for later targets in the same bucket.
    ///
    /// # Errors
    /// If the target's scheme is unsupported or it is an `s3` target and no
    /// object store configuration was given.
    pub fn store_for(&self, target: &StorageTarget) -> Result<Arc<dyn ObjectStore>, ConfigError> {
        let store = self.factory.get_object_store(target.location())?;
        Ok(store)
    }

    /// A new identifier for a write, unique to the run and ordered by time.
    #[must_use]
    pub fn new_run_id(&self) -> String {
        format!(
            "{}-{:08x}",
            Utc::now().format("%Y%m%d%H%M%S"),
            rand::random::<u32>()
        )
    }

    /// End the run, logging the requests made through each object store.
    pub fn shutdown(self) {
        for store in self.factory.stores() {
            let stats = store.stats();
            info!(
                "{store}: {} GET, {} PUT, {} LIST and {} DELETE requests",
                stats.get_count.to_formatted_string(&Locale::en),
                stats.put_count.to_formatted_string(&Locale::en),
                stats.list_count.to_formatted_string(&Locale::en),
                stats.delete_count.to_formatted_string(&Locale::en),
            );
        }
        info!(
            "Ingest context shut down after {:.3} seconds",
            self.started.elapsed().as_secs_f64()
        );
    }
}
