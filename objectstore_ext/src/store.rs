//! An [`ObjectStore`] wrapper that logs each request at debug level and counts the
//! traffic of an ingestion run so it can be summarised at shutdown.
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
use async_trait::async_trait;
use futures::stream::BoxStream;
use log::{debug, info};
use num_format::{Locale, ToFormattedString};
use object_store::{
    GetOptions, GetResult, ListResult, MultipartUpload, ObjectMeta, ObjectStore,
    PutMultipartOptions, PutOptions, PutPayload, PutResult, Result, path::Path,
};
use std::{
    fmt::{Display, Formatter},
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
};

/// Request totals of a [`LoggingObjectStore`] at one point in time.
#[derive(Debug, Default, Eq, PartialEq, Clone, Copy)]
pub struct RequestStats {
    /// GET requests, HEAD requests excluded.
    pub get_count: usize,
    /// Bytes returned by GET requests.
    pub get_bytes: u64,
    /// PUT requests, multipart uploads included.
    pub put_count: usize,
    /// Bytes sent in single PUT requests.
    pub put_bytes: u64,
    pub list_count: usize,
    pub delete_count: usize,
}

#[derive(Debug, Default)]
struct Counters {
    gets: AtomicUsize,
    get_bytes: AtomicU64,
    puts: AtomicUsize,
    put_bytes: AtomicU64,
    lists: AtomicUsize,
    deletes: AtomicUsize,
}

impl Counters {
    fn snapshot(&self) -> RequestStats {
        RequestStats {
            get_count: self.gets.load(Ordering::Relaxed),
            get_bytes: self.get_bytes.load(Ordering::Relaxed),
            put_count: self.puts.load(Ordering::Relaxed),
            put_bytes: self.put_bytes.load(Ordering::Relaxed),
            list_count: self.lists.load(Ordering::Relaxed),
            delete_count: self.deletes.load(Ordering::Relaxed),
        }
    }
}

/// Wraps the store behind one bucket or root and records [`RequestStats`] for it.
///
/// `kind` names the backend (`S3`, `Local`, `Memory`) and `root` is the URL the
/// request paths are relative to. Both only appear in log messages.
#[derive(Debug)]
#[allow(clippy::module_name_repetitions)]
pub struct LoggingObjectStore {
    inner: Arc<dyn ObjectStore>,
    kind: &'static str,
    root: String,
    counters: Counters,
}

impl LoggingObjectStore {
    #[must_use]
    pub fn new(inner: Arc<dyn ObjectStore>, kind: &'static str, root: impl Into<String>) -> Self {
        Self {
            inner,
            kind,
            root: root.into().trim_end_matches('/').to_owned(),
            counters: Counters::default(),
        }
    }

    /// Request totals so far.
    #[must_use]
    pub fn stats(&self) -> RequestStats {
        self.counters.snapshot()
    }

    fn describe(&self, location: Option<&Path>) -> String {
        format!(
            "{}/{}",
            self.root,
            location.map_or("", Path::as_ref)
        )
    }
}

impl Display for LoggingObjectStore {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} store {} ({})", self.kind, self.root, self.inner)
    }
}

impl Drop for LoggingObjectStore {
    fn drop(&mut self) {
        let stats = self.stats();
        if stats == RequestStats::default() {
            return;
        }
        info!(
            "{} store {} closed: {} GET ({} bytes), {} PUT ({} bytes), {} LIST, {} DELETE",
            self.kind,
            self.root,
            stats.get_count.to_formatted_string(&Locale::en),
            stats.get_bytes.to_formatted_string(&Locale::en),
            stats.put_count.to_formatted_string(&Locale::en),
            stats.put_bytes.to_formatted_string(&Locale::en),
            stats.list_count.to_formatted_string(&Locale::en),
            stats.delete_count.to_formatted_string(&Locale::en),
        );
    }
}

#[async_trait]
impl ObjectStore for LoggingObjectStore {
    async fn put_opts(
        &self,
        location: &Path,
        payload: PutPayload,
        opts: PutOptions,
    ) -> Result<PutResult> {
        let len = payload.content_length() as u64;
        self.counters.puts.fetch_add(1, Ordering::Relaxed);
        self.counters.put_bytes.fetch_add(len, Ordering::Relaxed);
        debug!(
            "{} PUT {} ({} bytes)",
            self.kind,
            self.describe(Some(location)),
            len.to_formatted_string(&Locale::en)
        );
        self.inner.put_opts(location, payload, opts).await
    }

    async fn put_multipart_opts(
        &self,
        location: &Path,
        opts: PutMultipartOptions,
    ) -> Result<Box<dyn MultipartUpload>> {
        self.counters.puts.fetch_add(1, Ordering::Relaxed);
        debug!(
            "{} PUT (multipart) {}",
            self.kind,
            self.describe(Some(location))
        );
        self.inner.put_multipart_opts(location, opts).await
    }

    async fn get_opts(&self, location: &Path, options: GetOptions) -> Result<GetResult> {
        if options.head {
            return self.inner.get_opts(location, options).await;
        }
        let result = self.inner.get_opts(location, options).await?;
        let len = result.range.end.saturating_sub(result.range.start);
        self.counters.gets.fetch_add(1, Ordering::Relaxed);
        self.counters.get_bytes.fetch_add(len, Ordering::Relaxed);
        debug!(
            "{} GET {} ({} bytes)",
            self.kind,
            self.describe(Some(location)),
            len.to_formatted_string(&Locale::en)
        );
        Ok(result)
    }

    async fn head(&self, location: &Path) -> Result<ObjectMeta> {
        debug!("{} HEAD {}", self.kind, self.describe(Some(location)));
        self.inner.head(location).await
    }

    async fn delete(&self, location: &Path) -> Result<()> {
        self.counters.deletes.fetch_add(1, Ordering::Relaxed);
        debug!("{} DELETE {}", self.kind, self.describe(Some(location)));
        self.inner.delete(location).await
    }

    fn list(&self, prefix: Option<&Path>) -> BoxStream<'static, Result<ObjectMeta>> {
        self.counters.lists.fetch_add(1, Ordering::Relaxed);
        debug!("{} LIST {}", self.kind, self.describe(prefix));
        self.inner.list(prefix)
    }

    async fn list_with_delimiter(&self, prefix: Option<&Path>) -> Result<ListResult> {
        self.counters.lists.fetch_add(1, Ordering::Relaxed);
        debug!("{} LIST (delimited) {}", self.kind, self.describe(prefix));
        self.inner.list_with_delimiter(prefix).await
    }

    async fn copy(&self, from: &Path, to: &Path) -> Result<()> {
        debug!(
            "{} COPY {} to {}",
            self.kind,
            self.describe(Some(from)),
            self.describe(Some(to))
        );
        self.inner.copy(from, to).await
    }

    async fn copy_if_not_exists(&self, from: &Path, to: &Path) -> Result<()> {
        self.inner.copy_if_not_exists(from, to).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use log::Level;
    use object_store::{integration::*, memory::InMemory};

    fn bucket() -> LoggingObjectStore {
        LoggingObjectStore::new(Arc::new(InMemory::new()), "Memory", "memory://landing/")
    }

    const PART: &str = "sales/region=North/part-00000-run.c000.snappy.parquet";

    #[tokio::test]
    async fn should_pass_object_store_conformance() {
        let store = bucket();

        put_get_delete_list(&store).await;
        list_uses_directories_correctly(&store).await;
        list_with_delimiter(&store).await;
        rename_and_copy(&store).await;
        copy_if_not_exists(&store).await;
        stream_get(&store).await;
    }

    #[tokio::test]
    async fn should_count_uploads_and_downloads() -> Result<()> {
        // Given
        let store = bucket();
        assert_eq!(store.stats(), RequestStats::default());

        // When
        store.put(&PART.into(), "PAR1....PAR1".into()).await?;
        store.put(&"sales/_manifest.json".into(), "{}".into()).await?;
        store.get(&PART.into()).await?.bytes().await?;
        store.get_range(&PART.into(), 8..12).await?;
        store.head(&PART.into()).await?;

        // Then
        assert_eq!(
            store.stats(),
            RequestStats {
                get_count: 2,
                get_bytes: 16,
                put_count: 2,
                put_bytes: 14,
                list_count: 0,
                delete_count: 0,
            }
        );
        Ok(())
    }

    #[tokio::test]
    async fn should_count_listing_and_cleanup() -> Result<()> {
        // Given
        let store = bucket();
        store.put(&PART.into(), "x".into()).await?;

        // When
        store.list_with_delimiter(Some(&"sales".into())).await?;
        store.delete(&PART.into()).await?;

        // Then
        let stats = store.stats();
        assert_eq!((stats.list_count, stats.delete_count), (1, 1));
        Ok(())
    }

    #[tokio::test]
    async fn should_log_each_request_and_summary_on_drop() -> Result<()> {
        // Given
        testing_logger::setup();
        let store = bucket();
        store.put(&"sales/_manifest.json".into(), "{\"files\":[]}".into()).await?;

        // When
        store.get(&"sales/_manifest.json".into()).await?;
        store.head(&"sales/_manifest.json".into()).await?;
        store.delete(&"sales/_manifest.json".into()).await?;
        drop(store);

        // Then
        testing_logger::validate(|captured_logs| {
            let bodies: Vec<_> = captured_logs
                .iter()
                .map(|log| (log.level, log.body.as_str()))
                .collect();
            assert_eq!(
                bodies,
                vec![
                    (Level::Debug, "Memory PUT memory://landing/sales/_manifest.json (12 bytes)"),
                    (Level::Debug, "Memory GET memory://landing/sales/_manifest.json (12 bytes)"),
                    (Level::Debug, "Memory HEAD memory://landing/sales/_manifest.json"),
                    (Level::Debug, "Memory DELETE memory://landing/sales/_manifest.json"),
                    (
                        Level::Info,
                        "Memory store memory://landing closed: 1 GET (12 bytes), 1 PUT (12 bytes), 0 LIST, 1 DELETE"
                    ),
                ]
            );
        });
        Ok(())
    }

    #[tokio::test]
    async fn should_stay_quiet_when_unused() {
        // Given
        testing_logger::setup();

        // When
        drop(bucket());

        // Then
        testing_logger::validate(|captured_logs| assert!(captured_logs.is_empty()));
    }

    #[tokio::test]
    async fn should_log_listing_prefix() {
        // Given
        testing_logger::setup();
        let store = bucket();

        // When
        let _listing = store.list(Some(&"sales/region=North".into()));

        // Then
        testing_logger::validate(|captured_logs| {
            assert_eq!(captured_logs[0].body, "Memory LIST memory://landing/sales/region=North");
        });
    }
}
