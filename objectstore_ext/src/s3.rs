//! Functions and structs for creating object stores from location URLs, including
//! bridging S3 credentials into the [`object_store`] crate.
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
use std::{
    collections::{HashMap, hash_map::Entry},
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use aws_types::region::Region;
use object_store::{
    BackoffConfig, ClientOptions, CredentialProvider, RetryConfig,
    aws::{AmazonS3, AmazonS3Builder, AwsCredential},
    local::LocalFileSystem,
    memory::InMemory,
};
use thiserror::Error;
use url::Url;

use crate::store::LoggingObjectStore;

/// Errors raised while turning a URL into an object store.
#[derive(Error, Debug)]
pub enum StoreFactoryError {
    #[error("invalid bucket name in URL \"{0}\"")]
    InvalidBucket(String),
    #[error("no object store for URL scheme \"{0}\"")]
    UnsupportedScheme(String),
    #[error("can't create S3 object store for \"{0}\": no S3 configuration provided")]
    MissingS3Config(String),
    #[error("could not build object store: {0}")]
    Build(#[from] object_store::Error),
}

/// A tuple struct to bridge credentials held as [`aws_credential_types::Credentials`]
/// and the [`CredentialProvider`] trait in the [`object_store`] crate.
#[derive(Debug)]
struct CredentialsFromConfigProvider(Arc<AwsCredential>);

impl CredentialsFromConfigProvider {
    fn new(creds: &aws_credential_types::Credentials) -> Self {
        Self(Arc::new(AwsCredential {
            key_id: creds.access_key_id().to_owned(),
            secret_key: creds.secret_access_key().to_owned(),
            token: creds.session_token().map(ToOwned::to_owned),
        }))
    }
}

#[async_trait]
impl CredentialProvider for CredentialsFromConfigProvider {
    type Credential = AwsCredential;

    async fn get_credential(&self) -> object_store::Result<Arc<Self::Credential>> {
        Ok(self.0.clone())
    }
}

/// Create an [`AmazonS3Builder`] for the given region and with provided credentials.
///
/// The HTTP client's own retry loop is switched off: callers wrap each request
/// in their own bounded retry policy and must see every failure.
pub fn config_for_s3_module(
    creds: &aws_credential_types::Credentials,
    region: &Region,
    connect_timeout: Duration,
) -> AmazonS3Builder {
    AmazonS3Builder::new()
        .with_credentials(Arc::new(CredentialsFromConfigProvider::new(creds)))
        .with_client_options(ClientOptions::new().with_connect_timeout(connect_timeout))
        .with_retry(RetryConfig {
            backoff: BackoffConfig::default(),
            max_retries: 0,
            retry_timeout: connect_timeout,
        })
        .with_region(region.as_ref())
}

/// Extract the bucket (host) name from a URL.
fn extract_bucket(src: &Url) -> Result<String, StoreFactoryError> {
    src.host_str()
        .filter(|host| !host.is_empty())
        .map(ToOwned::to_owned)
        .ok_or_else(|| StoreFactoryError::InvalidBucket(src.to_string()))
}

/// Creates [`object_store::ObjectStore`] implementations from a URL and loads credentials into the S3
/// object store.
///
/// Supported schemes are `s3` (and `s3a`), `file` and `memory`. Every store handed out is
/// wrapped in a [`LoggingObjectStore`].
#[derive(Debug)]
pub struct ObjectStoreFactory {
    s3_config: Option<AmazonS3Builder>,
    store_map: Mutex<HashMap<String, Arc<LoggingObjectStore>>>,
}

impl ObjectStoreFactory {
    #[must_use]
    pub fn new(s3_config: Option<AmazonS3Builder>) -> Self {
        Self {
            s3_config,
            store_map: Mutex::new(HashMap::new()),
        }
    }

    /// Create a cache key for the given URL.
    ///
    /// Local stores are keyed purely off the scheme, but S3 and in-memory stores
    /// are per bucket, so the host is part of the key.
    fn make_cache_key_for(url: &Url) -> Result<String, StoreFactoryError> {
        match url.scheme() {
            "s3" | "s3a" => Ok(format!("s3://{}", extract_bucket(url)?)),
            "memory" => Ok(format!("memory://{}", extract_bucket(url)?)),
            scheme => Ok(scheme.to_owned()),
        }
    }

    /// Retrieves the appropriate [`object_store::ObjectStore`] for a given URL.
    ///
    /// Subsequent calls for the same scheme (and bucket) return the same store.
    ///
    /// # Errors
    /// If the scheme is not supported, the bucket name is missing, or an S3 URL
    /// is given but no S3 configuration was provided.
    ///
    /// # Panics
    /// If the store cache lock is poisoned.
    pub fn get_object_store(&self, src: &Url) -> Result<Arc<LoggingObjectStore>, StoreFactoryError> {
        let mut stores = self
            .store_map
            .lock()
            .expect("ObjectStoreFactory cache lock poisoned");
        match stores.entry(Self::make_cache_key_for(src)?) {
            Entry::Occupied(occupied) => Ok(occupied.get().clone()),
            Entry::Vacant(vacant) => {
                let store = self.make_object_store(src)?;
                Ok(vacant.insert(store).clone())
            }
        }
    }

    fn make_object_store(&self, src: &Url) -> Result<Arc<LoggingObjectStore>, StoreFactoryError> {
        match src.scheme() {
            "s3" | "s3a" => {
                let bucket = extract_bucket(src)?;
                let store = self.connect_s3(src, &bucket)?;
                Ok(Arc::new(LoggingObjectStore::new(
                    Arc::new(store),
                    "S3",
                    format!("s3://{bucket}"),
                )))
            }
            "file" => Ok(Arc::new(LoggingObjectStore::new(
                Arc::new(LocalFileSystem::new()),
                "Local",
                "file:/",
            ))),
            "memory" => Ok(Arc::new(LoggingObjectStore::new(
                Arc::new(InMemory::new()),
                "Memory",
                format!("memory://{}", extract_bucket(src)?),
            ))),
            scheme => Err(StoreFactoryError::UnsupportedScheme(scheme.to_owned())),
        }
    }

    fn connect_s3(&self, src: &Url, bucket: &str) -> Result<AmazonS3, StoreFactoryError> {
        match &self.s3_config {
            Some(config) => Ok(config.clone().with_bucket_name(bucket).build()?),
            None => Err(StoreFactoryError::MissingS3Config(src.to_string())),
        }
    }

    /// Every store created so far, for end of run reporting.
    ///
    /// # Panics
    /// If the store cache lock is poisoned.
    pub fn stores(&self) -> Vec<Arc<LoggingObjectStore>> {
        self.store_map
            .lock()
            .expect("ObjectStoreFactory cache lock poisoned")
            .values()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use aws_credential_types::Credentials;
    use aws_types::region::Region;
    use url::Url;

    use super::{ObjectStoreFactory, StoreFactoryError, config_for_s3_module, extract_bucket};

    #[test]
    fn should_extract_bucket() -> Result<(), Box<dyn std::error::Error>> {
        // Given
        let url = Url::parse("s3://spark-data/employees/part.parquet")?;

        // When
        let bucket = extract_bucket(&url)?;

        // Then
        assert_eq!(bucket, "spark-data");
        Ok(())
    }

    #[test]
    fn should_be_invalid_bucket() -> Result<(), Box<dyn std::error::Error>> {
        // Given
        let url = Url::parse("s3:/path/something.ext")?;

        // When
        let bucket = extract_bucket(&url);

        // Then
        assert!(matches!(bucket, Err(StoreFactoryError::InvalidBucket(_))));
        Ok(())
    }

    #[test]
    fn should_create_scheme_cache_key_for_local() -> Result<(), Box<dyn std::error::Error>> {
        // Given
        let url = Url::parse("file:///some/file")?;

        // When
        let cache_key = ObjectStoreFactory::make_cache_key_for(&url)?;

        // Then
        assert_eq!(cache_key, "file");
        Ok(())
    }

    #[test]
    fn should_create_bucket_cache_key_for_s3a() -> Result<(), Box<dyn std::error::Error>> {
        // Given
        let url = Url::parse("s3a://test-bucket/key")?;

        // When
        let cache_key = ObjectStoreFactory::make_cache_key_for(&url)?;

        // Then
        assert_eq!(cache_key, "s3://test-bucket");
        Ok(())
    }

    #[test]
    fn should_reuse_memory_store_for_same_bucket() -> Result<(), Box<dyn std::error::Error>> {
        // Given
        let factory = ObjectStoreFactory::new(None);

        // When
        let first = factory.get_object_store(&Url::parse("memory://a/x")?)?;
        let second = factory.get_object_store(&Url::parse("memory://a/y")?)?;
        let other = factory.get_object_store(&Url::parse("memory://b/x")?)?;

        // Then
        assert!(Arc::ptr_eq(&first, &second));
        assert!(!Arc::ptr_eq(&first, &other));
        assert_eq!(factory.stores().len(), 2);
        Ok(())
    }

    #[test]
    fn should_fail_s3_without_config() -> Result<(), Box<dyn std::error::Error>> {
        // Given
        let factory = ObjectStoreFactory::new(None);

        // When
        let result = factory.get_object_store(&Url::parse("s3://bucket/key")?);

        // Then
        assert!(matches!(result, Err(StoreFactoryError::MissingS3Config(_))));
        Ok(())
    }

    #[test]
    fn should_reject_unknown_scheme() -> Result<(), Box<dyn std::error::Error>> {
        // Given
        let factory = ObjectStoreFactory::new(None);

        // When
        let result = factory.get_object_store(&Url::parse("gs://bucket/key")?);

        // Then
        assert_eq!(
            result.unwrap_err().to_string(),
            "no object store for URL scheme \"gs\""
        );
        Ok(())
    }

    #[test]
    fn should_build_s3_store_with_config() -> Result<(), Box<dyn std::error::Error>> {
        // Given
        let creds = Credentials::from_keys("minioadmin", "minioadmin", None);
        let builder = config_for_s3_module(
            &creds,
            &Region::new("us-east-1"),
            Duration::from_secs(1),
        )
        .with_endpoint("http://localhost:9000")
        .with_allow_http(true);
        let factory = ObjectStoreFactory::new(Some(builder));

        // When
        let store = factory.get_object_store(&Url::parse("s3://spark-data/employees")?)?;

        // Then
        assert!(store.to_string().contains("s3://spark-data"));
        Ok(())
    }
}
