//! A single TCP endpoint: frames requests out, demultiplexes responses in
//! by opaque, and signals liveness to the owning pool. The socket itself
//! comes from a [`ConnectionFactory`] so the core stays runtime-neutral;
//! the tokio crate provides the TCP implementation.

use std::collections::HashMap;
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{oneshot, Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::Error;
use crate::operation::response::RawResponse;
use crate::operation::Operation;
use crate::protocol::{ResponseHeader, ServerFeatures, HEADER_LEN};

/// The raw byte stream a connection runs over.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + std::fmt::Debug {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + std::fmt::Debug> Transport for T {}

pub type BoxedTransport = Box<dyn Transport>;

/// A cluster node's KV service address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Endpoint {
            host: host.into(),
            port,
        }
    }
}

impl Display for Endpoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Produces a ready transport for an endpoint: TCP connect plus whatever
/// transport-level setup (TLS, auth) the deployment needs.
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    async fn connect(&self, endpoint: &Endpoint) -> Result<BoxedTransport, Error>;
}

/// Prepares a fresh transport for service: bucket selection and feature
/// negotiation. Returns what the server agreed to.
#[async_trait]
pub trait ConnectionInitializer: Send + Sync + 'static {
    async fn initialize(
        &self,
        transport: &mut BoxedTransport,
        endpoint: &Endpoint,
    ) -> Result<ServerFeatures, Error>;
}

/// Initializer for deployments where the handshake happens elsewhere (or
/// in tests): assumes default features.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopInitializer;

#[async_trait]
impl ConnectionInitializer for NoopInitializer {
    async fn initialize(
        &self,
        _transport: &mut BoxedTransport,
        _endpoint: &Endpoint,
    ) -> Result<ServerFeatures, Error> {
        Ok(ServerFeatures::default())
    }
}

type Waiter = oneshot::Sender<Result<RawResponse, Error>>;

/// One live socket. Writes are serialised by the pool worker; responses
/// stream back through the read loop, which completes waiters by opaque.
/// The correlation table is the only thing that pipelines on the wire.
pub struct Connection {
    endpoint: Endpoint,
    features: ServerFeatures,
    dead: AtomicBool,
    opaque: AtomicU32,
    waiters: Mutex<HashMap<u32, Waiter>>,
    writer: AsyncMutex<WriteHalf<BoxedTransport>>,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    last_activity: Mutex<Instant>,
    death_notify: Arc<Notify>,
    read_task: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    /// Take ownership of an initialized transport and start its read
    /// loop. `death_notify` is poked once when the connection dies so the
    /// pool can schedule recovery.
    pub fn spawn(
        endpoint: Endpoint,
        transport: BoxedTransport,
        features: ServerFeatures,
        death_notify: Arc<Notify>,
    ) -> Arc<Self> {
        let (read_half, write_half) = tokio::io::split(transport);
        let conn = Arc::new(Connection {
            endpoint,
            features,
            dead: AtomicBool::new(false),
            opaque: AtomicU32::new(1),
            waiters: Mutex::new(HashMap::new()),
            writer: AsyncMutex::new(write_half),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            last_activity: Mutex::new(Instant::now()),
            death_notify,
            read_task: Mutex::new(None),
        });
        let handle = tokio::spawn(Connection::read_loop(read_half, Arc::downgrade(&conn)));
        *conn.read_task.lock().unwrap() = Some(handle);
        conn
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn features(&self) -> &ServerFeatures {
        &self.features
    }

    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Acquire)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    pub fn last_activity(&self) -> Instant {
        *self.last_activity.lock().unwrap()
    }

    fn touch(&self) {
        *self.last_activity.lock().unwrap() = Instant::now();
    }

    /// Number of requests awaiting a response.
    pub fn in_flight(&self) -> usize {
        self.waiters.lock().unwrap().len()
    }

    /// Send one operation and await its correlated response. Cancellation
    /// resolves the call promptly; the registered waiter stays behind for
    /// the read loop to discard if the response arrives anyway.
    pub async fn execute(
        &self,
        op: &Operation,
        cancel: &CancellationToken,
    ) -> Result<RawResponse, Error> {
        if self.is_dead() {
            return Err(Error::transport(format!(
                "connection to {} is dead",
                self.endpoint
            ))
            .with_context(op.op_code, &op.key));
        }

        let opaque = self.next_opaque();
        let frame = op
            .encode(opaque, &self.features)
            .map_err(|e| Error::from(e).with_context(op.op_code, &op.key))?;

        let (tx, rx) = oneshot::channel();
        self.waiters.lock().unwrap().insert(opaque, tx);

        {
            let mut writer = self.writer.lock().await;
            if let Err(err) = writer.write_all(&frame).await {
                self.waiters.lock().unwrap().remove(&opaque);
                self.mark_dead("write failure");
                return Err(Error::from(err).with_context(op.op_code, &op.key));
            }
        }
        self.bytes_sent.fetch_add(frame.len() as u64, Ordering::Relaxed);
        self.touch();
        trace!(endpoint = %self.endpoint, opaque, op = ?op.op_code, "request written");

        tokio::select! {
            res = rx => match res {
                Ok(result) => result,
                Err(_) => Err(Error::transport(format!(
                    "connection to {} closed while awaiting response",
                    self.endpoint
                ))
                .with_context(op.op_code, &op.key)),
            },
            _ = cancel.cancelled() => Err(Error::cancelled().with_context(op.op_code, &op.key)),
        }
    }

    /// In-flight opaques are unique: the counter is monotonic within the
    /// connection's lifetime and entries leave the table on delivery or
    /// teardown.
    fn next_opaque(&self) -> u32 {
        self.opaque.fetch_add(1, Ordering::Relaxed)
    }

    /// Mark dead (monotonic) and fail every pending waiter with a
    /// transport error. Idempotent.
    pub fn mark_dead(&self, reason: &str) {
        if self.dead.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(endpoint = %self.endpoint, reason, "kv connection dead");
        let waiters: Vec<Waiter> = {
            let mut table = self.waiters.lock().unwrap();
            table.drain().map(|(_, w)| w).collect()
        };
        for waiter in waiters {
            let _ = waiter.send(Err(Error::transport(format!(
                "connection to {} lost: {}",
                self.endpoint, reason
            ))));
        }
        self.death_notify.notify_one();
    }

    /// Tear the connection down: refuse further sends, fail pending
    /// waiters, stop the read loop.
    pub fn close(&self) {
        self.mark_dead("connection closed");
        if let Some(handle) = self.read_task.lock().unwrap().take() {
            handle.abort();
        }
    }

    async fn read_loop(mut read_half: ReadHalf<BoxedTransport>, conn: Weak<Connection>) {
        let mut header_buf = [0u8; HEADER_LEN];
        loop {
            if let Err(err) = read_half.read_exact(&mut header_buf).await {
                if let Some(conn) = conn.upgrade() {
                    conn.mark_dead(&format!("read failure: {}", err));
                }
                return;
            }
            let conn = match conn.upgrade() {
                Some(conn) => conn,
                None => return,
            };
            let header = match ResponseHeader::parse(&header_buf) {
                Ok(header) => header,
                Err(err) => {
                    conn.mark_dead(&format!("unparseable response header: {}", err));
                    return;
                }
            };
            let body_len = header.body_len as usize;
            if body_len > conn.features.max_body {
                conn.mark_dead("response body exceeds negotiated maximum");
                return;
            }
            let mut body = vec![0u8; body_len];
            if let Err(err) = read_half.read_exact(&mut body).await {
                conn.mark_dead(&format!("read failure: {}", err));
                return;
            }
            conn.bytes_received
                .fetch_add((HEADER_LEN + body_len) as u64, Ordering::Relaxed);
            conn.touch();

            let waiter = conn.waiters.lock().unwrap().remove(&header.opaque);
            match waiter {
                Some(tx) => {
                    let result =
                        RawResponse::from_parts(&header, body.into()).map_err(Error::from);
                    // A dropped receiver means the caller gave up
                    // (cancelled or timed out); nothing left to do.
                    let _ = tx.send(result);
                }
                None => {
                    debug!(
                        endpoint = %conn.endpoint,
                        opaque = header.opaque,
                        "discarding response with no registered waiter"
                    );
                }
            }
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(handle) = self.read_task.lock().unwrap().take() {
            handle.abort();
        }
    }
}
