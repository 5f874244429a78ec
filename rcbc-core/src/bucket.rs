//! The bucket is the engine's wiring record: built once at construction
//! with its key mapper, node locator, and configuration listener, then
//! handed out by reference. No dynamic resolution happens at call time.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::collection::Collection;
use crate::config::KvConfig;
use crate::error::Error;
use crate::keymap::{ConfigListener, KeyMapper, NodeLocator, VBucket};
use crate::operation::response::RawResponse;
use crate::operation::Operation;
use crate::pool::{ConnectionPool, SendRequest};
use crate::protocol::Status;
use crate::transcoder::{JsonTranscoder, Transcoder};

pub(crate) struct BucketInner {
    name: String,
    config: KvConfig,
    mapper: Arc<dyn KeyMapper>,
    locator: Arc<dyn NodeLocator>,
    config_listener: Arc<dyn ConfigListener>,
    cid_cache: Mutex<HashMap<(String, String), u32>>,
}

impl BucketInner {
    pub(crate) fn config(&self) -> &KvConfig {
        &self.config
    }

    pub(crate) fn mapper(&self) -> &Arc<dyn KeyMapper> {
        &self.mapper
    }

    pub(crate) fn locator(&self) -> &Arc<dyn NodeLocator> {
        &self.locator
    }

    pub(crate) fn cached_cid(&self, scope: &str, name: &str) -> Option<u32> {
        self.cid_cache
            .lock()
            .unwrap()
            .get(&(scope.to_string(), name.to_string()))
            .copied()
    }

    /// A freshly resolved cid replaces whatever was cached for the pair.
    pub(crate) fn store_cid(&self, scope: &str, name: &str, cid: u32) {
        self.cid_cache
            .lock()
            .unwrap()
            .insert((scope.to_string(), name.to_string()), cid);
    }

    pub(crate) fn invalidate_cid(&self, scope: &str, name: &str) {
        self.cid_cache
            .lock()
            .unwrap()
            .remove(&(scope.to_string(), name.to_string()));
    }

    /// Resolve the primary route for an operation. Operations without a
    /// key (cid lookups) route by their value so they still spread over
    /// the cluster deterministically.
    pub(crate) fn route(&self, op: &Operation) -> Result<(VBucket, Arc<ConnectionPool>), Error> {
        let route_key: &[u8] = if op.key.is_empty() {
            &op.content
        } else {
            &op.key
        };
        let vbucket = self.mapper.map_key(route_key);
        let pool = self.locator.pool_for(&vbucket, None).ok_or_else(|| {
            Error::transport(format!(
                "no node serving vbucket {}",
                vbucket.index
            ))
            .with_context(op.op_code, &op.key)
        })?;
        Ok((vbucket, pool))
    }

    /// Submit to a specific pool and await the completion under the
    /// timeout guard. Timeout cancels the in-flight token and surfaces as
    /// a semantic timeout, distinct from caller cancellation.
    pub(crate) async fn dispatch_to(
        &self,
        pool: &ConnectionPool,
        op: Operation,
        timeout: Option<Duration>,
        cancel: Option<CancellationToken>,
    ) -> Result<RawResponse, Error> {
        let timeout = timeout.unwrap_or(self.config.default_operation_timeout);
        let op_code = op.op_code;
        let key = op.key.clone();
        let token = cancel.unwrap_or_default();

        let (tx, rx) = oneshot::channel();
        let request = SendRequest::new(op, token.clone(), tx);
        let submit_and_wait = async {
            pool.send(request).await?;
            match rx.await {
                Ok(result) => result,
                Err(_) => Err(Error::transport("request dropped before completion")
                    .with_context(op_code, &key)),
            }
        };
        match tokio::time::timeout(timeout, submit_and_wait).await {
            Ok(result) => result,
            Err(_) => {
                // Free the worker promptly; a late server response is
                // discarded by the connection's read loop.
                token.cancel();
                Err(Error::timeout(op_code, &key))
            }
        }
    }

    /// Route, submit, await. A NotMyVBucket response pokes the
    /// configuration listener and retries once against the (possibly
    /// refreshed) map before surfacing.
    pub(crate) async fn dispatch(
        &self,
        op: Operation,
        timeout: Option<Duration>,
        cancel: Option<CancellationToken>,
    ) -> Result<RawResponse, Error> {
        let mut refreshed = false;
        loop {
            let mut attempt = op.clone();
            let (vbucket, pool) = self.route(&attempt)?;
            attempt.vbucket = vbucket.index;
            let resp = self
                .dispatch_to(&pool, attempt, timeout, cancel.clone())
                .await?;
            if resp.status == Status::VBucketBelongsToAnotherServer && !refreshed {
                refreshed = true;
                self.config_listener.map_refresh_needed(self.mapper.revision());
                continue;
            }
            return Ok(resp);
        }
    }
}

/// A named bucket: the entry point for KV traffic. Cheap to clone.
#[derive(Clone)]
pub struct Bucket {
    inner: Arc<BucketInner>,
}

impl Bucket {
    /// Wire the bucket up. Everything it needs is passed here, once.
    pub fn new(
        name: impl Into<String>,
        config: KvConfig,
        mapper: Arc<dyn KeyMapper>,
        locator: Arc<dyn NodeLocator>,
        config_listener: Arc<dyn ConfigListener>,
    ) -> Self {
        Bucket {
            inner: Arc::new(BucketInner {
                name: name.into(),
                config,
                mapper,
                locator,
                config_listener,
                cid_cache: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> &KvConfig {
        &self.inner.config
    }

    /// The default collection of the default scope.
    pub fn default_collection(&self) -> Collection<JsonTranscoder> {
        self.collection("_default", "_default")
    }

    pub fn collection(&self, scope: &str, name: &str) -> Collection<JsonTranscoder> {
        self.collection_with_transcoder(scope, name, JsonTranscoder)
    }

    pub fn collection_with_transcoder<T: Transcoder>(
        &self,
        scope: &str,
        name: &str,
        transcoder: T,
    ) -> Collection<T> {
        Collection::new(self.inner.clone(), scope, name, transcoder)
    }

    /// Legacy entry point for higher layers that already hold a framed
    /// operation: route it and hand the raw completion back untranslated.
    pub async fn send(
        &self,
        mut operation: Operation,
        completion: oneshot::Sender<Result<RawResponse, Error>>,
    ) -> Result<(), Error> {
        let (vbucket, pool) = self.inner.route(&operation)?;
        operation.vbucket = vbucket.index;
        pool.send(SendRequest::new(
            operation,
            CancellationToken::new(),
            completion,
        ))
        .await
    }
}
