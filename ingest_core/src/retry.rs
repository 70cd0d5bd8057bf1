//! Bounded retry with exponential backoff for object store requests.
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
use log::warn;
use serde::{Deserialize, Serialize};
use std::{error::Error, future::Future, time::Duration};
use thiserror::Error;

/// A request to the object store that failed for good, either because the
/// failure was permanent or because the retry budget ran out.
#[derive(Error, Debug)]
#[error("{operation} {location} failed after {attempts} attempt(s): {source}")]
pub struct StorageError {
    pub operation: String,
    pub location: String,
    pub attempts: u32,
    #[source]
    pub source: object_store::Error,
}

impl StorageError {
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self.source, object_store::Error::NotFound { .. })
    }
}

/// How often and how patiently to retry a failed request.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first. Zero is treated as one.
    pub max_attempts: u32,
    #[serde(with = "millis")]
    pub initial_backoff: Duration,
    #[serde(with = "millis")]
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// A policy that makes exactly one attempt.
    #[must_use]
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (1 based).
    #[must_use]
    pub fn backoff_for(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry.saturating_sub(1)).unwrap_or(i32::MAX);
        let delay = self.initial_backoff.as_secs_f64() * self.multiplier.max(1.0).powi(exponent);
        if delay.is_finite() && delay < self.max_backoff.as_secs_f64() {
            Duration::from_secs_f64(delay)
        } else {
            self.max_backoff
        }
    }
}

/// Message the HTTP client gives a response with an unsuccessful status.
const STATUS_MESSAGE: &str = "Server returned non-2xx status code: ";

/// HTTP status of the response that failed a request, if one was received.
///
/// The S3 client wraps some failures, LIST among them, in
/// [`object_store::Error::Generic`] whatever the status, and its error types can't
/// be named outside the crate. The status is taken from the message of the first
/// error in the source chain that reports one.
#[must_use]
pub fn response_status(err: &object_store::Error) -> Option<u16> {
    let mut next: Option<&(dyn Error + 'static)> = Some(err);
    while let Some(current) = next {
        let message = current.to_string();
        if let Some(start) = message.find(STATUS_MESSAGE) {
            return message[start + STATUS_MESSAGE.len()..]
                .get(..3)
                .and_then(|code| code.parse().ok());
        }
        next = current.source();
    }
    None
}

/// Only failures that may succeed when repeated are retried: connection failures,
/// timeouts, throttling and server errors. Not found, permission and
/// authentication failures fail at once, whether the client gives them their own
/// variant or reports them as [`object_store::Error::Generic`] with a 4xx status.
#[must_use]
pub fn is_transient(err: &object_store::Error) -> bool {
    match err {
        object_store::Error::Generic { .. } => match response_status(err) {
            Some(status) => status >= 500 || status == 429 || status == 408,
            None => true,
        },
        _ => false,
    }
}

/// Run `request` until it succeeds, fails permanently or `policy` is exhausted.
///
/// `operation` and `location` only label log messages and the returned error.
///
/// # Errors
/// The last failure, wrapped in a [`StorageError`].
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    location: &str,
    mut request: F,
) -> Result<T, StorageError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = object_store::Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match request().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < max_attempts && is_transient(&e) => {
                let delay = policy.backoff_for(attempt);
                warn!(
                    "{operation} {location} failed on attempt {attempt} of {max_attempts}, retrying in {delay:?}: {e}"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(source) => {
                return Err(StorageError {
                    operation: operation.to_owned(),
                    location: location.to_owned(),
                    attempts: attempt,
                    source,
                });
            }
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[allow(clippy::cast_possible_truncation)]
    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
