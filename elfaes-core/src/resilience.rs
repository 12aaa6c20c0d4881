//! Exponential-backoff retry of transient failures on data-store and
//! document-store operations (§4.7, §5 Retries).
//!
//! [`Resilient`] is a decorator in the same shape as the teacher crate's
//! `InstrumentedAggregateRepository`/`InstrumentedEventStore`
//! (`eventually::tracing`) and `Notifier` (`eventually_util::notify`): it
//! wraps an inner capability and re-exposes the same trait, so retrying is
//! opt-in via composition rather than baked into a single backend.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use rand::Rng;

use crate::data_store::{DataStore, DataStoreError, NewEvent};
use crate::document_store::{DocumentStore, DocumentStoreError};
use crate::model::{ObjectDocument, StreamChunk};
use crate::version::Version;

/// Backoff schedule for [`Resilient`] (§4.7: base delay, multiplier, max
/// attempts, max delay, all configurable with sane teacher-style defaults).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(50),
            multiplier: 2.0,
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Delay before the `attempt`-th retry (1-based), with up to 20% of
    /// full jitter applied on top of the exponential backoff.
    fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let scaled = self.base_delay.as_secs_f64() * exponent;
        let capped = scaled.min(self.max_delay.as_secs_f64());

        let jitter_fraction = rand::thread_rng().gen_range(0.0..0.2);
        let jittered = capped * (1.0 + jitter_fraction);

        Duration::from_secs_f64(jittered)
    }
}

/// Retries `operation` per `policy` as long as it returns a transient error,
/// per the classification `is_transient` supplies (§5 Retries: HTTP
/// 408/429/500/502/503/504, timeout, connection-reset ⇒ transient; domain
/// and precondition errors surface unchanged on the first attempt).
async fn retry<T, E, Fut>(
    policy: &RetryPolicy,
    is_transient: impl Fn(&E) -> bool,
    mut operation: impl FnMut() -> Fut,
) -> Result<T, E>
where
    Fut: std::future::Future<Output = Result<T, E>>,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(error) if attempt + 1 < policy.max_attempts && is_transient(&error) => {
                attempt += 1;
                let delay = policy.delay_for(attempt);
                #[cfg(feature = "tracing")]
                tracing::warn!(attempt, delay_ms = delay.as_millis() as u64, "retrying transient backend failure");
                tokio::time::sleep(delay).await;
            }
            Err(error) => return Err(error),
        }
    }
}

/// A [`DataStore`] (or [`DocumentStore`]) decorator that retries transient
/// failures from the wrapped backend with exponential backoff and jitter
/// (§4.7).
#[derive(Debug, Clone)]
pub struct Resilient<Inner> {
    inner: Inner,
    policy: RetryPolicy,
}

impl<Inner> Resilient<Inner> {
    #[must_use]
    pub fn new(inner: Inner) -> Self {
        Self {
            inner,
            policy: RetryPolicy::default(),
        }
    }

    #[must_use]
    pub fn with_policy(inner: Inner, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl<Inner> DataStore for Resilient<Inner>
where
    Inner: DataStore,
{
    async fn create_initial_blob(&self, document: &ObjectDocument) -> Result<(), DataStoreError> {
        retry(
            &self.policy,
            DataStoreError::is_transient,
            || self.inner.create_initial_blob(document),
        )
        .await
    }

    async fn append(
        &self,
        document: &ObjectDocument,
        events: Vec<NewEvent>,
        preserve_timestamp: bool,
    ) -> Result<(), DataStoreError> {
        // Events are consumed by a failed attempt's serialization step, so
        // each retry needs its own clone of the batch; the backend never
        // observes a partially-consumed batch across attempts.
        retry(&self.policy, DataStoreError::is_transient, || {
            self.inner
                .append(document, events.clone(), preserve_timestamp)
        })
        .await
    }

    async fn read(
        &self,
        document: &ObjectDocument,
        start_version: Version,
        until_version: Option<Version>,
        chunk: Option<&StreamChunk>,
    ) -> Result<Vec<crate::codec::EventRecord>, DataStoreError> {
        retry(&self.policy, DataStoreError::is_transient, || {
            self.inner.read(document, start_version, until_version, chunk)
        })
        .await
    }

    fn read_as_stream<'a>(
        &'a self,
        document: &'a ObjectDocument,
        start_version: Version,
        until_version: Option<Version>,
        chunk: Option<&'a StreamChunk>,
    ) -> BoxStream<'a, Result<crate::codec::EventRecord, DataStoreError>> {
        // Retries happen per-line inside the inner implementation's own
        // `read`; the stream itself is a thin projection over a retried,
        // fully-materialized batch, keeping cancellation semantics simple.
        Box::pin(async_stream::try_stream! {
            let events = self.read(document, start_version, until_version, chunk).await?;
            for event in events {
                yield event;
            }
        })
    }

    async fn remove_events_for_failed_commit(
        &self,
        document: &ObjectDocument,
        from: Version,
        to: Version,
    ) -> Result<u64, DataStoreError> {
        retry(&self.policy, DataStoreError::is_transient, || {
            self.inner.remove_events_for_failed_commit(document, from, to)
        })
        .await
    }
}

#[async_trait]
impl<Inner> DocumentStore for Resilient<Inner>
where
    Inner: DocumentStore,
{
    async fn get(
        &self,
        object_name: &str,
        object_id: &str,
        store_override: Option<&str>,
    ) -> Result<ObjectDocument, DocumentStoreError> {
        retry(&self.policy, DocumentStoreError::is_transient, || {
            self.inner.get(object_name, object_id, store_override)
        })
        .await
    }

    async fn set(&self, document: &mut ObjectDocument) -> Result<(), DocumentStoreError> {
        // A conditional write either lands or is refused by the precondition;
        // retrying it blind on a transient network error is safe because the
        // precondition, not the retry, is what guarantees at-most-once
        // application.
        let mut attempt = 0;
        loop {
            match self.inner.set(document).await {
                Ok(()) => return Ok(()),
                Err(error)
                    if attempt + 1 < self.policy.max_attempts && error.is_transient() =>
                {
                    attempt += 1;
                    tokio::time::sleep(self.policy.delay_for(attempt)).await;
                }
                Err(error) => return Err(error),
            }
        }
    }

    async fn get_first_by_tag(&self, tag: &str) -> Result<ObjectDocument, DocumentStoreError> {
        retry(&self.policy, DocumentStoreError::is_transient, || {
            self.inner.get_first_by_tag(tag)
        })
        .await
    }

    async fn get_by_tag(&self, tag: &str) -> Result<Vec<ObjectDocument>, DocumentStoreError> {
        retry(&self.policy, DocumentStoreError::is_transient, || {
            self.inner.get_by_tag(tag)
        })
        .await
    }

    async fn ensure_container(&self, auto_create: bool) -> Result<(), DocumentStoreError> {
        retry(&self.policy, DocumentStoreError::is_transient, || {
            self.inner.ensure_container(auto_create)
        })
        .await
    }
}

/// Extension trait mirroring the teacher crate's `AggregateRepositoryExt`/
/// `EventStoreExt` (`eventually::tracing`, `eventually_util::notify`): wrap
/// any backend in resilience with a single method call.
pub trait ResilientExt: Sized {
    fn with_retries(self) -> Resilient<Self> {
        Resilient::new(self)
    }
}

impl<T> ResilientExt for T {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    use crate::codec::EventRecord;

    struct FlakyDataStore {
        failures_remaining: AtomicU32,
        reads: Mutex<u32>,
    }

    #[async_trait]
    impl DataStore for FlakyDataStore {
        async fn create_initial_blob(&self, _document: &ObjectDocument) -> Result<(), DataStoreError> {
            Ok(())
        }

        async fn append(
            &self,
            _document: &ObjectDocument,
            _events: Vec<NewEvent>,
            _preserve_timestamp: bool,
        ) -> Result<(), DataStoreError> {
            if self.failures_remaining.load(Ordering::SeqCst) > 0 {
                self.failures_remaining.fetch_sub(1, Ordering::SeqCst);
                return Err(DataStoreError::from_blob_error(TransientFakeError));
            }
            Ok(())
        }

        async fn read(
            &self,
            _document: &ObjectDocument,
            _start_version: Version,
            _until_version: Option<Version>,
            _chunk: Option<&StreamChunk>,
        ) -> Result<Vec<EventRecord>, DataStoreError> {
            *self.reads.lock().unwrap() += 1;
            Ok(Vec::new())
        }

        fn read_as_stream<'a>(
            &'a self,
            document: &'a ObjectDocument,
            start_version: Version,
            until_version: Option<Version>,
            chunk: Option<&'a StreamChunk>,
        ) -> BoxStream<'a, Result<EventRecord, DataStoreError>> {
            Box::pin(async_stream::try_stream! {
                let events = self.read(document, start_version, until_version, chunk).await?;
                for event in events {
                    yield event;
                }
            })
        }

        async fn remove_events_for_failed_commit(
            &self,
            _document: &ObjectDocument,
            _from: Version,
            _to: Version,
        ) -> Result<u64, DataStoreError> {
            Ok(0)
        }
    }

    #[derive(Debug, thiserror::Error)]
    #[error("transient fake error")]
    struct TransientFakeError;

    impl crate::data_store::BlobError for TransientFakeError {
        fn is_not_found(&self) -> bool {
            false
        }
        fn is_precondition_failed(&self) -> bool {
            false
        }
        fn is_transient(&self) -> bool {
            true
        }
    }

    #[derive(Debug, thiserror::Error)]
    #[error("non-transient fake error")]
    struct NonTransientFakeError;

    impl crate::data_store::BlobError for NonTransientFakeError {
        fn is_not_found(&self) -> bool {
            false
        }
        fn is_precondition_failed(&self) -> bool {
            false
        }
        fn is_transient(&self) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn retries_until_the_transient_failure_clears() {
        let resilient = Resilient::with_policy(
            FlakyDataStore {
                failures_remaining: AtomicU32::new(2),
                reads: Mutex::new(0),
            },
            RetryPolicy {
                max_attempts: 5,
                base_delay: Duration::from_millis(1),
                multiplier: 1.0,
                max_delay: Duration::from_millis(5),
            },
        );

        let document = ObjectDocument::new("order", "abc");
        resilient.append(&document, Vec::new(), false).await.unwrap();
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let resilient = Resilient::with_policy(
            FlakyDataStore {
                failures_remaining: AtomicU32::new(10),
                reads: Mutex::new(0),
            },
            RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(1),
                multiplier: 1.0,
                max_delay: Duration::from_millis(5),
            },
        );

        let document = ObjectDocument::new("order", "abc");
        let err = resilient
            .append(&document, Vec::new(), false)
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn non_transient_errors_are_not_retried() {
        struct AlwaysFails;

        #[async_trait]
        impl DataStore for AlwaysFails {
            async fn create_initial_blob(&self, _d: &ObjectDocument) -> Result<(), DataStoreError> {
                Ok(())
            }
            async fn append(
                &self,
                _d: &ObjectDocument,
                _e: Vec<NewEvent>,
                _p: bool,
            ) -> Result<(), DataStoreError> {
                Err(DataStoreError::from_blob_error(NonTransientFakeError))
            }
            async fn read(
                &self,
                _d: &ObjectDocument,
                _s: Version,
                _u: Option<Version>,
                _c: Option<&StreamChunk>,
            ) -> Result<Vec<EventRecord>, DataStoreError> {
                Ok(Vec::new())
            }
            fn read_as_stream<'a>(
                &'a self,
                _d: &'a ObjectDocument,
                _s: Version,
                _u: Option<Version>,
                _c: Option<&'a StreamChunk>,
            ) -> BoxStream<'a, Result<EventRecord, DataStoreError>> {
                Box::pin(futures::stream::empty())
            }
            async fn remove_events_for_failed_commit(
                &self,
                _d: &ObjectDocument,
                _f: Version,
                _t: Version,
            ) -> Result<u64, DataStoreError> {
                Ok(0)
            }
        }

        let resilient = Resilient::new(AlwaysFails);
        let document = ObjectDocument::new("order", "abc");
        let err = resilient
            .append(&document, Vec::new(), false)
            .await
            .unwrap_err();
        assert!(!err.is_transient());
    }
}
