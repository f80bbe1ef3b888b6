//! Object fetcher: retrieves script bytes from S3-compatible storage
//!
//! The store is an injected trait object so the service can run against a
//! test double. The production implementation is a plain HTTPS client; the
//! endpoint is expected to permit reads for the buckets in use (public-read
//! policy, gateway, or presigning proxy in front).

use async_trait::async_trait;
use std::time::Duration;

use crate::config::StorageConfig;
use crate::errors::{ExecError, Result};

/// Number of attempts for transient storage failures.
const RETRY_ATTEMPTS: u32 = 3;
/// Base delay for exponential backoff between attempts.
const RETRY_BASE_DELAY: Duration = Duration::from_millis(100);

/// Fetch-by-key contract against object storage.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Retrieve the raw bytes of one object. No side effects beyond the read.
    async fn fetch(&self, bucket: &str, key: &str) -> Result<Vec<u8>>;
}

/// Fetch with bounded exponential backoff on transient failures.
///
/// Only `TransientStorage` is retried; `NotFound` and `AccessDenied` propagate
/// on the first attempt.
pub async fn fetch_with_retry(store: &dyn ObjectStore, bucket: &str, key: &str) -> Result<Vec<u8>> {
    let mut delay = RETRY_BASE_DELAY;
    let mut attempt = 1;
    loop {
        match store.fetch(bucket, key).await {
            Ok(bytes) => return Ok(bytes),
            Err(e) if e.is_transient() && attempt < RETRY_ATTEMPTS => {
                log::warn!(
                    "transient storage error fetching {}/{} (attempt {}/{}): {}",
                    bucket,
                    key,
                    attempt,
                    RETRY_ATTEMPTS,
                    e
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// HTTP object store for S3-compatible endpoints.
pub struct HttpObjectStore {
    client: reqwest::Client,
    endpoint: String,
    access_key: Option<String>,
    secret_key: Option<String>,
}

impl HttpObjectStore {
    pub fn new(config: &StorageConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| ExecError::internal(format!("failed to build storage client: {}", e)))?;
        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            access_key: config.access_key.clone(),
            secret_key: config.secret_key.clone(),
        })
    }

    fn object_url(&self, bucket: &str, key: &str) -> String {
        format!("{}/{}/{}", self.endpoint, bucket, key)
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn fetch(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        let url = self.object_url(bucket, key);
        log::debug!("fetching object {}/{}", bucket, key);

        let mut request = self.client.get(&url);
        if let Some(ref access_key) = self.access_key {
            request = request.basic_auth(access_key, self.secret_key.as_deref());
        }

        let response = request.send().await.map_err(|e| {
            // Connect failures and timeouts are worth a retry; the URL is not
            // included because it embeds the endpoint.
            ExecError::transient(format!("storage request for {}/{} failed: {}", bucket, key, e))
        })?;

        let status = response.status();
        if status.is_success() {
            let bytes = response.bytes().await.map_err(|e| {
                ExecError::transient(format!("reading object {}/{} failed: {}", bucket, key, e))
            })?;
            return Ok(bytes.to_vec());
        }

        match status.as_u16() {
            404 => Err(ExecError::not_found(format!("object {}/{}", bucket, key))),
            401 | 403 => Err(ExecError::access_denied(format!("object {}/{}", bucket, key))),
            s if status.is_server_error() => Err(ExecError::transient(format!(
                "storage returned HTTP {} for {}/{}",
                s, bucket, key
            ))),
            s => Err(ExecError::internal(format!(
                "storage returned unexpected HTTP {} for {}/{}",
                s, bucket, key
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Store that fails transiently `failures` times before succeeding.
    struct FlakyStore {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl ObjectStore for FlakyStore {
        async fn fetch(&self, _bucket: &str, _key: &str) -> Result<Vec<u8>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(ExecError::transient("simulated 503"))
            } else {
                Ok(b"print('ok')".to_vec())
            }
        }
    }

    struct MissingStore;

    #[async_trait]
    impl ObjectStore for MissingStore {
        async fn fetch(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
            Err(ExecError::not_found(format!("object {}/{}", bucket, key)))
        }
    }

    #[tokio::test]
    async fn retries_transient_failures_up_to_the_bound() {
        let store = FlakyStore {
            failures: 2,
            calls: AtomicU32::new(0),
        };
        let bytes = fetch_with_retry(&store, "scripts", "job.py").await.unwrap();
        assert_eq!(bytes, b"print('ok')");
        assert_eq!(store.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_retries_exhaust() {
        let store = FlakyStore {
            failures: 10,
            calls: AtomicU32::new(0),
        };
        let err = fetch_with_retry(&store, "scripts", "job.py").await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(store.calls.load(Ordering::SeqCst), RETRY_ATTEMPTS);
    }

    #[tokio::test]
    async fn not_found_is_not_retried() {
        let store = MissingStore;
        let err = fetch_with_retry(&store, "scripts", "absent.py").await.unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[test]
    fn object_url_joins_without_double_slash() {
        let store = HttpObjectStore::new(&StorageConfig {
            endpoint: "http://localhost:9000/".to_string(),
            access_key: None,
            secret_key: None,
            request_timeout_secs: 30,
        })
        .unwrap();
        assert_eq!(
            store.object_url("scripts", "job.py"),
            "http://localhost:9000/scripts/job.py"
        );
    }
}
