//! The public KV API. A collection resolves its cid once (cached on the
//! bucket), builds one [`Operation`] per call, routes it through the
//! bucket's dispatcher, and translates response statuses into the error
//! taxonomy.

use std::sync::Arc;
use std::time::Duration;

use futures::future::{select_ok, BoxFuture};
use futures::stream::FuturesUnordered;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::bucket::BucketInner;
use crate::error::Error;
use crate::operation::response::{MutationToken, RawResponse};
use crate::operation::subdoc::{self, LookupInSpec, MutateInSpec, SubDocField};
use crate::operation::{DurabilityRequirement, Operation};
use crate::protocol::Status;
use crate::transcoder::{Transcoder, JSON_COMMON_FLAGS};

const DEFAULT_SCOPE: &str = "_default";
const DEFAULT_COLLECTION: &str = "_default";

/// The expiry xattr consulted when a projected get asks for the TTL.
const EXPTIME_XATTR: &str = "$document.exptime";

/// Timeout and cancellation knobs shared by every call.
#[derive(Debug, Default, Clone)]
pub struct CommonOptions {
    pub timeout: Option<Duration>,
    pub cancel: Option<CancellationToken>,
}

#[derive(Debug, Default, Clone)]
pub struct GetOptions {
    pub timeout: Option<Duration>,
    pub cancel: Option<CancellationToken>,
    /// Paths to project. Empty means the whole document.
    pub project_list: Vec<String>,
    pub include_expiry: bool,
}

#[derive(Debug, Default, Clone)]
pub struct StoreOptions {
    pub timeout: Option<Duration>,
    pub cancel: Option<CancellationToken>,
    /// TTL in the memcached convention: 0 never expires, values up to 30
    /// days are relative seconds, larger values are absolute unix time.
    pub expiry: u32,
    /// Required match for replace; ignored by upsert/insert.
    pub cas: u64,
    pub durability: Option<DurabilityRequirement>,
}

#[derive(Debug, Default, Clone)]
pub struct RemoveOptions {
    pub timeout: Option<Duration>,
    pub cancel: Option<CancellationToken>,
    pub cas: u64,
    pub durability: Option<DurabilityRequirement>,
}

#[derive(Debug, Clone)]
pub struct CounterOptions {
    pub timeout: Option<Duration>,
    pub cancel: Option<CancellationToken>,
    pub delta: u64,
    /// Seeded when the counter does not exist yet.
    pub initial: u64,
    pub expiry: u32,
}

impl Default for CounterOptions {
    fn default() -> Self {
        CounterOptions {
            timeout: None,
            cancel: None,
            delta: 1,
            initial: 0,
            expiry: 0,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct MutateInOptions {
    pub timeout: Option<Duration>,
    pub cancel: Option<CancellationToken>,
    pub expiry: u32,
    pub cas: u64,
    pub durability: Option<DurabilityRequirement>,
    pub doc_flags: u8,
}

/// A fetched document plus the metadata needed to decode it.
#[derive(Debug, Clone)]
pub struct GetResult<T: Transcoder> {
    pub cas: u64,
    /// Populated only when the call asked for it.
    pub expiry: Option<u32>,
    flags: u32,
    content: Vec<u8>,
    transcoder: T,
}

impl<T: Transcoder> GetResult<T> {
    pub fn content_as<V: DeserializeOwned>(&self) -> Result<V, Error> {
        self.transcoder.decode(&self.content, self.flags)
    }

    pub fn content_raw(&self) -> &[u8] {
        &self.content
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }
}

#[derive(Debug, Clone)]
pub struct GetReplicaResult<T: Transcoder> {
    pub cas: u64,
    /// False when the primary answered the race.
    pub is_replica: bool,
    flags: u32,
    content: Vec<u8>,
    transcoder: T,
}

impl<T: Transcoder> GetReplicaResult<T> {
    pub fn content_as<V: DeserializeOwned>(&self) -> Result<V, Error> {
        self.transcoder.decode(&self.content, self.flags)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MutationResult {
    pub cas: u64,
    pub token: Option<MutationToken>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterResult {
    pub cas: u64,
    pub content: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExistsResult {
    pub exists: bool,
    pub cas: Option<u64>,
}

/// Per-path outcomes of a lookup-in. Path failures live on the fields,
/// not in an error, as long as the envelope succeeded.
#[derive(Debug, Clone)]
pub struct LookupInResult {
    pub cas: u64,
    fields: Vec<SubDocField>,
}

impl LookupInResult {
    pub fn exists(&self, index: usize) -> bool {
        self.fields.get(index).map(|f| f.exists()).unwrap_or(false)
    }

    pub fn field_status(&self, index: usize) -> Option<Status> {
        self.fields.get(index).map(|f| f.status)
    }

    pub fn content_as<V: DeserializeOwned>(&self, index: usize) -> Result<V, Error> {
        let field = self
            .fields
            .get(index)
            .ok_or_else(|| Error::invalid_argument(format!("no lookup field {}", index)))?;
        Ok(serde_json::from_slice(&field.value)?)
    }
}

#[derive(Debug, Clone)]
pub struct MutateInResult {
    pub cas: u64,
    pub token: Option<MutationToken>,
    fields: Vec<SubDocField>,
}

impl MutateInResult {
    /// Counter specs report their post-mutation value here.
    pub fn content_as<V: DeserializeOwned>(&self, index: usize) -> Result<V, Error> {
        let field = self
            .fields
            .get(index)
            .ok_or_else(|| Error::invalid_argument(format!("no mutation field {}", index)))?;
        Ok(serde_json::from_slice(&field.value)?)
    }
}

/// An identified set of documents with a lazily resolved cid.
#[derive(Clone)]
pub struct Collection<T: Transcoder> {
    inner: Arc<BucketInner>,
    scope: String,
    name: String,
    transcoder: T,
}

impl<T: Transcoder> Collection<T> {
    pub(crate) fn new(
        inner: Arc<BucketInner>,
        scope: &str,
        name: &str,
        transcoder: T,
    ) -> Self {
        Collection {
            inner,
            scope: scope.to_string(),
            name: name.to_string(),
            transcoder,
        }
    }

    pub fn scope_name(&self) -> &str {
        &self.scope
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn is_default(&self) -> bool {
        self.scope == DEFAULT_SCOPE && self.name == DEFAULT_COLLECTION
    }

    /// Name → cid, cached on the bucket. The default collection never
    /// needs a lookup.
    async fn resolve_cid(
        &self,
        timeout: Option<Duration>,
        cancel: Option<CancellationToken>,
    ) -> Result<Option<u32>, Error> {
        if self.is_default() {
            return Ok(None);
        }
        if let Some(cid) = self.inner.cached_cid(&self.scope, &self.name) {
            return Ok(Some(cid));
        }
        let qualified = format!("{}.{}", self.scope, self.name);
        let op = Operation::get_cid_by_name(&qualified);
        let op_code = op.op_code;
        let resp = self.inner.dispatch(op, timeout, cancel).await?;
        if let Err(status) = resp.error_for_status() {
            return Err(Error::from_status(
                status,
                resp.raw_status,
                op_code,
                qualified.as_bytes(),
            ));
        }
        let cid = resp.collection_id()?;
        self.inner.store_cid(&self.scope, &self.name, cid);
        Ok(Some(cid))
    }

    /// Dispatch and translate any failure status. An unknown-collection
    /// status additionally drops the cached cid so the next call
    /// re-resolves.
    async fn dispatch_checked(
        &self,
        op: Operation,
        timeout: Option<Duration>,
        cancel: Option<CancellationToken>,
    ) -> Result<RawResponse, Error> {
        let op_code = op.op_code;
        let key = op.key.clone();
        let resp = self.inner.dispatch(op, timeout, cancel).await?;
        if let Err(status) = resp.error_for_status() {
            if matches!(
                status,
                Status::UnknownCollection | Status::NoCollectionsManifest | Status::UnknownScope
            ) {
                self.inner.invalidate_cid(&self.scope, &self.name);
            }
            return Err(Error::from_status(status, resp.raw_status, op_code, &key));
        }
        Ok(resp)
    }

    /// Like [`dispatch_checked`], but a multi-path failure envelope is a
    /// per-field outcome for lookups, not an error.
    async fn dispatch_lookup(
        &self,
        op: Operation,
        timeout: Option<Duration>,
        cancel: Option<CancellationToken>,
    ) -> Result<RawResponse, Error> {
        let op_code = op.op_code;
        let key = op.key.clone();
        let resp = self.inner.dispatch(op, timeout, cancel).await?;
        match resp.status {
            s if s.is_success() => Ok(resp),
            Status::SubDocMultiPathFailure => Ok(resp),
            status => Err(Error::from_status(status, resp.raw_status, op_code, &key)),
        }
    }

    fn fill_durability(
        &self,
        durability: Option<DurabilityRequirement>,
    ) -> Option<DurabilityRequirement> {
        durability.map(|mut d| {
            if d.timeout.is_none() {
                d.timeout = Some(self.inner.config().durability_timeout);
            }
            d
        })
    }

    /// Fetch a document. A non-empty `project_list` becomes a sub-doc
    /// lookup with one SubGet per path while the paths (plus the expiry
    /// xattr, when requested) fit in one request; past that threshold the
    /// whole document is fetched and filtered locally.
    pub async fn get(
        &self,
        id: impl AsRef<[u8]>,
        options: GetOptions,
    ) -> Result<GetResult<T>, Error> {
        let key = id.as_ref();
        if use_subdoc_projection(options.project_list.len(), options.include_expiry) {
            return self.get_projected(key, options).await;
        }

        let cid = self
            .resolve_cid(options.timeout, options.cancel.clone())
            .await?;
        let op = Operation::get(key).with_cid(cid);
        let resp = self
            .dispatch_checked(op, options.timeout, options.cancel)
            .await?;
        let flags = resp.content_flags();
        let content = if options.project_list.is_empty() {
            resp.value.to_vec()
        } else {
            // Over-threshold projection: the caller-side projector
            // filters fields out of the whole document.
            filter_json(&resp.value, &options.project_list)?
        };
        Ok(GetResult {
            cas: resp.cas,
            expiry: None,
            flags,
            content,
            transcoder: self.transcoder.clone(),
        })
    }

    async fn get_projected(
        &self,
        key: &[u8],
        options: GetOptions,
    ) -> Result<GetResult<T>, Error> {
        let cid = self
            .resolve_cid(options.timeout, options.cancel.clone())
            .await?;
        let mut specs = Vec::with_capacity(options.project_list.len() + 1);
        if options.include_expiry {
            // Xattr specs must precede document specs.
            specs.push(LookupInSpec::get(EXPTIME_XATTR).xattr());
        }
        for path in &options.project_list {
            specs.push(LookupInSpec::get(path.clone()));
        }
        let spec_count = specs.len();
        let op = Operation::lookup_in(key, specs, 0).with_cid(cid);
        let resp = self
            .dispatch_lookup(op, options.timeout, options.cancel)
            .await?;
        let fields = subdoc::parse_lookup_fields(&resp.value, spec_count)?;

        let mut fields = fields.into_iter();
        let expiry = if options.include_expiry {
            fields.next().and_then(|f| parse_expiry_field(&f))
        } else {
            None
        };

        let mut doc = Value::Object(Map::new());
        for (path, field) in options.project_list.iter().zip(fields) {
            if !field.exists() {
                continue;
            }
            let value: Value = serde_json::from_slice(&field.value)?;
            insert_path(&mut doc, path, value);
        }
        Ok(GetResult {
            cas: resp.cas,
            expiry,
            flags: JSON_COMMON_FLAGS,
            content: serde_json::to_vec(&doc)?,
            transcoder: self.transcoder.clone(),
        })
    }

    /// Observe-based existence check. A missing key reports
    /// `exists: false` instead of failing.
    pub async fn exists(
        &self,
        id: impl AsRef<[u8]>,
        options: CommonOptions,
    ) -> Result<ExistsResult, Error> {
        let key = id.as_ref();
        let cid = self
            .resolve_cid(options.timeout, options.cancel.clone())
            .await?;
        let op = Operation::observe(key).with_cid(cid);
        let op_code = op.op_code;
        let resp = self.inner.dispatch(op, options.timeout, options.cancel).await?;
        match resp.error_for_status() {
            Ok(()) => {
                let (state, cas) = resp.observe_state()?;
                Ok(ExistsResult {
                    exists: state.exists(),
                    cas: if state.exists() { Some(cas) } else { None },
                })
            }
            Err(Status::KeyNotFound) => Ok(ExistsResult {
                exists: false,
                cas: None,
            }),
            Err(status) => Err(Error::from_status(status, resp.raw_status, op_code, key)),
        }
    }

    pub async fn upsert<V: Serialize + ?Sized>(
        &self,
        id: impl AsRef<[u8]>,
        content: &V,
        options: StoreOptions,
    ) -> Result<MutationResult, Error> {
        self.store(|k, c, f, e| Operation::set(k, c, f, e), id.as_ref(), content, options)
            .await
    }

    /// Create-only store; fails with `KeyExists` when the document is
    /// already there.
    pub async fn insert<V: Serialize + ?Sized>(
        &self,
        id: impl AsRef<[u8]>,
        content: &V,
        options: StoreOptions,
    ) -> Result<MutationResult, Error> {
        self.store(|k, c, f, e| Operation::add(k, c, f, e), id.as_ref(), content, options)
            .await
    }

    /// Replace an existing document, optionally pinned to a cas.
    pub async fn replace<V: Serialize + ?Sized>(
        &self,
        id: impl AsRef<[u8]>,
        content: &V,
        options: StoreOptions,
    ) -> Result<MutationResult, Error> {
        self.store(
            |k, c, f, e| Operation::replace(k, c, f, e),
            id.as_ref(),
            content,
            options,
        )
        .await
    }

    async fn store<V: Serialize + ?Sized>(
        &self,
        build: impl FnOnce(Vec<u8>, Vec<u8>, u32, u32) -> Operation,
        key: &[u8],
        content: &V,
        options: StoreOptions,
    ) -> Result<MutationResult, Error> {
        let (bytes, flags, datatype) = self.transcoder.encode(content)?;
        let cid = self
            .resolve_cid(options.timeout, options.cancel.clone())
            .await?;
        let mut op = build(key.to_vec(), bytes, flags, options.expiry)
            .with_cid(cid)
            .with_cas(options.cas)
            .with_durability(self.fill_durability(options.durability));
        op.data_type = datatype;
        let resp = self
            .dispatch_checked(op, options.timeout, options.cancel)
            .await?;
        Ok(MutationResult {
            cas: resp.cas,
            token: resp.mutation_token(),
        })
    }

    pub async fn remove(
        &self,
        id: impl AsRef<[u8]>,
        options: RemoveOptions,
    ) -> Result<MutationResult, Error> {
        let key = id.as_ref();
        let cid = self
            .resolve_cid(options.timeout, options.cancel.clone())
            .await?;
        let op = Operation::delete(key)
            .with_cid(cid)
            .with_cas(options.cas)
            .with_durability(self.fill_durability(options.durability));
        let resp = self
            .dispatch_checked(op, options.timeout, options.cancel)
            .await?;
        Ok(MutationResult {
            cas: resp.cas,
            token: resp.mutation_token(),
        })
    }

    pub async fn touch(
        &self,
        id: impl AsRef<[u8]>,
        expiry: u32,
        options: CommonOptions,
    ) -> Result<MutationResult, Error> {
        let key = id.as_ref();
        let cid = self
            .resolve_cid(options.timeout, options.cancel.clone())
            .await?;
        let op = Operation::touch(key, expiry).with_cid(cid);
        let resp = self
            .dispatch_checked(op, options.timeout, options.cancel)
            .await?;
        Ok(MutationResult {
            cas: resp.cas,
            token: None,
        })
    }

    pub async fn get_and_touch(
        &self,
        id: impl AsRef<[u8]>,
        expiry: u32,
        options: CommonOptions,
    ) -> Result<GetResult<T>, Error> {
        let key = id.as_ref();
        let cid = self
            .resolve_cid(options.timeout, options.cancel.clone())
            .await?;
        let op = Operation::get_and_touch(key, expiry).with_cid(cid);
        let resp = self
            .dispatch_checked(op, options.timeout, options.cancel)
            .await?;
        Ok(GetResult {
            cas: resp.cas,
            expiry: None,
            flags: resp.content_flags(),
            content: resp.value.to_vec(),
            transcoder: self.transcoder.clone(),
        })
    }

    /// Fetch and write-lock a document; the returned cas is required to
    /// unlock it.
    pub async fn get_and_lock(
        &self,
        id: impl AsRef<[u8]>,
        lock_time: u32,
        options: CommonOptions,
    ) -> Result<GetResult<T>, Error> {
        let key = id.as_ref();
        let cid = self
            .resolve_cid(options.timeout, options.cancel.clone())
            .await?;
        let op = Operation::get_and_lock(key, lock_time).with_cid(cid);
        let resp = self
            .dispatch_checked(op, options.timeout, options.cancel)
            .await?;
        Ok(GetResult {
            cas: resp.cas,
            expiry: None,
            flags: resp.content_flags(),
            content: resp.value.to_vec(),
            transcoder: self.transcoder.clone(),
        })
    }

    pub async fn unlock(
        &self,
        id: impl AsRef<[u8]>,
        cas: u64,
        options: CommonOptions,
    ) -> Result<(), Error> {
        let key = id.as_ref();
        let cid = self
            .resolve_cid(options.timeout, options.cancel.clone())
            .await?;
        let op = Operation::unlock(key, cas).with_cid(cid);
        self.dispatch_checked(op, options.timeout, options.cancel)
            .await?;
        Ok(())
    }

    pub async fn increment(
        &self,
        id: impl AsRef<[u8]>,
        options: CounterOptions,
    ) -> Result<CounterResult, Error> {
        self.counter(
            |k, d, i, e| Operation::increment(k, d, i, e),
            id.as_ref(),
            options,
        )
        .await
    }

    pub async fn decrement(
        &self,
        id: impl AsRef<[u8]>,
        options: CounterOptions,
    ) -> Result<CounterResult, Error> {
        self.counter(
            |k, d, i, e| Operation::decrement(k, d, i, e),
            id.as_ref(),
            options,
        )
        .await
    }

    async fn counter(
        &self,
        build: impl FnOnce(Vec<u8>, u64, u64, u32) -> Operation,
        key: &[u8],
        options: CounterOptions,
    ) -> Result<CounterResult, Error> {
        let cid = self
            .resolve_cid(options.timeout, options.cancel.clone())
            .await?;
        let op = build(key.to_vec(), options.delta, options.initial, options.expiry).with_cid(cid);
        let resp = self
            .dispatch_checked(op, options.timeout, options.cancel)
            .await?;
        Ok(CounterResult {
            cas: resp.cas,
            content: resp.counter_value()?,
        })
    }

    /// Append raw bytes to a document; no transcoding.
    pub async fn append(
        &self,
        id: impl AsRef<[u8]>,
        content: Vec<u8>,
        options: CommonOptions,
    ) -> Result<MutationResult, Error> {
        let key = id.as_ref();
        let cid = self
            .resolve_cid(options.timeout, options.cancel.clone())
            .await?;
        let op = Operation::append(key, content).with_cid(cid);
        let resp = self
            .dispatch_checked(op, options.timeout, options.cancel)
            .await?;
        Ok(MutationResult {
            cas: resp.cas,
            token: resp.mutation_token(),
        })
    }

    /// Prepend raw bytes to a document; no transcoding.
    pub async fn prepend(
        &self,
        id: impl AsRef<[u8]>,
        content: Vec<u8>,
        options: CommonOptions,
    ) -> Result<MutationResult, Error> {
        let key = id.as_ref();
        let cid = self
            .resolve_cid(options.timeout, options.cancel.clone())
            .await?;
        let op = Operation::prepend(key, content).with_cid(cid);
        let resp = self
            .dispatch_checked(op, options.timeout, options.cancel)
            .await?;
        Ok(MutationResult {
            cas: resp.cas,
            token: resp.mutation_token(),
        })
    }

    pub async fn lookup_in(
        &self,
        id: impl AsRef<[u8]>,
        specs: Vec<LookupInSpec>,
        options: CommonOptions,
    ) -> Result<LookupInResult, Error> {
        let key = id.as_ref();
        let cid = self
            .resolve_cid(options.timeout, options.cancel.clone())
            .await?;
        let spec_count = specs.len();
        let op = Operation::lookup_in(key, specs, 0).with_cid(cid);
        let resp = self
            .dispatch_lookup(op, options.timeout, options.cancel)
            .await?;
        Ok(LookupInResult {
            cas: resp.cas,
            fields: subdoc::parse_lookup_fields(&resp.value, spec_count)?,
        })
    }

    pub async fn mutate_in(
        &self,
        id: impl AsRef<[u8]>,
        specs: Vec<MutateInSpec>,
        options: MutateInOptions,
    ) -> Result<MutateInResult, Error> {
        let key = id.as_ref();
        let cid = self
            .resolve_cid(options.timeout, options.cancel.clone())
            .await?;
        let spec_count = specs.len();
        let op = Operation::mutate_in(key, specs, options.doc_flags, options.expiry)
            .with_cid(cid)
            .with_cas(options.cas)
            .with_durability(self.fill_durability(options.durability));
        let resp = self
            .dispatch_checked(op, options.timeout, options.cancel)
            .await?;
        Ok(MutateInResult {
            cas: resp.cas,
            token: resp.mutation_token(),
            fields: subdoc::parse_mutate_fields(&resp.value, spec_count)?,
        })
    }

    /// Race the primary and every replica; the first successful response
    /// wins and the rest are cancelled. A key without replicas still
    /// races the primary alone.
    pub async fn get_any_replica(
        &self,
        id: impl AsRef<[u8]>,
        options: CommonOptions,
    ) -> Result<GetReplicaResult<T>, Error> {
        let race = match &options.cancel {
            Some(caller) => caller.child_token(),
            None => CancellationToken::new(),
        };
        let cid = self
            .resolve_cid(options.timeout, options.cancel.clone())
            .await?;
        let futures = self.replica_read_futures(id.as_ref(), cid, options.timeout, race.clone())?;
        let (winner, _losers) = select_ok(futures).await?;
        // Cancel the losing requests; late server responses are discarded
        // by the read loops.
        race.cancel();
        Ok(winner)
    }

    /// One future per copy of the document (primary first); the caller
    /// iterates them in completion order.
    pub async fn get_all_replicas(
        &self,
        id: impl AsRef<[u8]>,
        options: CommonOptions,
    ) -> Result<FuturesUnordered<BoxFuture<'static, Result<GetReplicaResult<T>, Error>>>, Error>
    {
        let cancel = options.cancel.clone().unwrap_or_default();
        let cid = self
            .resolve_cid(options.timeout, options.cancel.clone())
            .await?;
        let futures = self.replica_read_futures(id.as_ref(), cid, options.timeout, cancel)?;
        Ok(futures.into_iter().collect())
    }

    fn replica_read_futures(
        &self,
        key: &[u8],
        cid: Option<u32>,
        timeout: Option<Duration>,
        cancel: CancellationToken,
    ) -> Result<Vec<BoxFuture<'static, Result<GetReplicaResult<T>, Error>>>, Error> {
        let vbucket = self.inner.mapper().map_key(key);
        let mut futures: Vec<BoxFuture<'static, Result<GetReplicaResult<T>, Error>>> = Vec::new();

        // The primary contends even when the replica set is empty.
        let mut copies: Vec<(Option<usize>, Operation)> = vec![(
            None,
            Operation::get(key).with_cid(cid),
        )];
        for replica_index in 0..vbucket.replicas.len() {
            copies.push((
                Some(replica_index),
                Operation::get_replica(key).with_cid(cid),
            ));
        }

        for (replica_index, mut op) in copies {
            let pool = match self.inner.locator().pool_for(&vbucket, replica_index) {
                Some(pool) => pool,
                None => continue,
            };
            op.vbucket = vbucket.index;
            let inner = self.inner.clone();
            let transcoder = self.transcoder.clone();
            let cancel = cancel.clone();
            let is_replica = replica_index.is_some();
            futures.push(Box::pin(async move {
                let op_code = op.op_code;
                let key = op.key.clone();
                let resp = inner
                    .dispatch_to(&pool, op, timeout, Some(cancel))
                    .await?;
                if let Err(status) = resp.error_for_status() {
                    return Err(Error::from_status(status, resp.raw_status, op_code, &key));
                }
                Ok(GetReplicaResult {
                    cas: resp.cas,
                    is_replica,
                    flags: resp.content_flags(),
                    content: resp.value.to_vec(),
                    transcoder,
                })
            }));
        }

        if futures.is_empty() {
            return Err(Error::transport("no node serving any copy of the key"));
        }
        Ok(futures)
    }
}

/// The projection threshold: a sub-doc lookup is used iff the list is
/// non-empty and the paths plus the optional expiry xattr fit in one
/// multi-spec request.
fn use_subdoc_projection(project_count: usize, include_expiry: bool) -> bool {
    project_count > 0 && project_count + include_expiry as usize <= subdoc::MAX_SPECS
}

fn parse_expiry_field(field: &SubDocField) -> Option<u32> {
    if !field.exists() {
        return None;
    }
    std::str::from_utf8(&field.value)
        .ok()
        .and_then(|s| s.trim().parse::<u32>().ok())
}

/// Insert `value` at a dotted path, creating intermediate objects.
fn insert_path(target: &mut Value, path: &str, value: Value) {
    let mut current = target;
    let mut segments = path.split('.').peekable();
    while let Some(segment) = segments.next() {
        let map = match current {
            Value::Object(map) => map,
            _ => return,
        };
        if segments.peek().is_none() {
            map.insert(segment.to_string(), value);
            return;
        }
        current = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
}

fn lookup_path<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(doc, |value, segment| value.get(segment))
}

/// Caller-side projector for the over-threshold fallback: fetch the whole
/// document, keep only the requested paths.
fn filter_json(doc: &[u8], paths: &[String]) -> Result<Vec<u8>, Error> {
    let parsed: Value = serde_json::from_slice(doc)?;
    let mut out = Value::Object(Map::new());
    for path in paths {
        if let Some(value) = lookup_path(&parsed, path) {
            insert_path(&mut out, path, value.clone());
        }
    }
    Ok(serde_json::to_vec(&out)?)
}
