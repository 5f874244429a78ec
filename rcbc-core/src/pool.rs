//! The per-node connection pool: a bounded send queue fanned out to one
//! worker per live connection, with replace-dead-and-retry recovery, a
//! freeze discipline for reconfiguration, and explicit disposal.
//!
//! A worker never holds more than one request; parallelism comes from the
//! number of live connections, and pipelining on the wire comes from the
//! connection's correlation table alone.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use futures::future::join_all;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex, MutexGuard, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::KvConfig;
use crate::connection::{Connection, ConnectionFactory, ConnectionInitializer, Endpoint};
use crate::error::Error;
use crate::operation::response::RawResponse;
use crate::operation::Operation;

/// A request handed to a pool: the operation, the caller's cancellation
/// token, and the one-shot channel its result travels back on.
pub struct SendRequest {
    pub operation: Operation,
    pub cancel: CancellationToken,
    pub completion: oneshot::Sender<Result<RawResponse, Error>>,
    requeues: u8,
}

impl SendRequest {
    pub fn new(
        operation: Operation,
        cancel: CancellationToken,
        completion: oneshot::Sender<Result<RawResponse, Error>>,
    ) -> Self {
        SendRequest {
            operation,
            cancel,
            completion,
            requeues: 0,
        }
    }
}

struct PoolMember {
    conn: Arc<Connection>,
    worker: JoinHandle<()>,
}

struct PoolState {
    members: Vec<PoolMember>,
}

/// Scoped quiescence: while the guard lives, no connections are added or
/// removed (recovery waits on the same mutex).
pub struct PoolFreezeGuard<'a> {
    state: MutexGuard<'a, PoolState>,
}

impl PoolFreezeGuard<'_> {
    pub fn connection_count(&self) -> usize {
        self.state.members.len()
    }

    pub fn live_connections(&self) -> usize {
        self.state
            .members
            .iter()
            .filter(|m| !m.conn.is_dead())
            .count()
    }
}

/// One pool per cluster node KV endpoint.
pub struct ConnectionPool {
    endpoint: Endpoint,
    config: KvConfig,
    factory: Arc<dyn ConnectionFactory>,
    initializer: Arc<dyn ConnectionInitializer>,
    queue_tx: mpsc::Sender<SendRequest>,
    queue_rx: Arc<AsyncMutex<mpsc::Receiver<SendRequest>>>,
    state: AsyncMutex<PoolState>,
    live: AtomicUsize,
    disposed: AtomicBool,
    death_notify: Arc<Notify>,
    shutdown: CancellationToken,
    maintenance: Mutex<Option<JoinHandle<()>>>,
    weak: Weak<ConnectionPool>,
}

impl ConnectionPool {
    /// Build the pool, fill it to `num_kv_connections` (connect failures
    /// are logged, not propagated), and start the recovery task.
    pub async fn start(
        endpoint: Endpoint,
        config: KvConfig,
        factory: Arc<dyn ConnectionFactory>,
        initializer: Arc<dyn ConnectionInitializer>,
    ) -> Arc<Self> {
        let (queue_tx, queue_rx) = mpsc::channel(config.send_queue_capacity);
        let pool = Arc::new_cyclic(|weak| ConnectionPool {
            endpoint,
            config,
            factory,
            initializer,
            queue_tx,
            queue_rx: Arc::new(AsyncMutex::new(queue_rx)),
            state: AsyncMutex::new(PoolState {
                members: Vec::new(),
            }),
            live: AtomicUsize::new(0),
            disposed: AtomicBool::new(false),
            death_notify: Arc::new(Notify::new()),
            shutdown: CancellationToken::new(),
            maintenance: Mutex::new(None),
            weak: weak.clone(),
        });

        pool.recover().await;

        let weak = Arc::downgrade(&pool);
        let notify = pool.death_notify.clone();
        let shutdown = pool.shutdown.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = notify.notified() => {}
                    _ = shutdown.cancelled() => return,
                }
                match weak.upgrade() {
                    Some(pool) => pool.recover().await,
                    None => return,
                }
            }
        });
        *pool.maintenance.lock().unwrap() = Some(handle);
        pool
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn live_connections(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Submit a request. Blocks while the queue is full (the back-pressure
    /// signal), fails fast if the request is cancelled while waiting, and
    /// fails with a disposed error after disposal.
    pub async fn send(&self, request: SendRequest) -> Result<(), Error> {
        if self.is_disposed() {
            return Err(Error::disposed());
        }
        if self.live_connections() == 0 {
            // No live connection can drain the queue; run a recovery
            // cycle before posting.
            self.recover().await;
        }
        let cancel = request.cancel.clone();
        tokio::select! {
            res = self.queue_tx.send(request) => res.map_err(|_| Error::disposed()),
            _ = cancel.cancelled() => Err(Error::cancelled()),
        }
    }

    /// Atomically quiesce the pool; recovery cannot add or remove
    /// connections until the guard drops.
    pub async fn freeze(&self) -> PoolFreezeGuard<'_> {
        PoolFreezeGuard {
            state: self.state.lock().await,
        }
    }

    /// Tear the pool down: stop workers, drain the queue (failing every
    /// queued request), and close every connection. Idempotent; later
    /// submissions fail with a disposed error.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown.cancel();
        let mut state = self.state.lock().await;
        {
            let mut rx = self.queue_rx.lock().await;
            rx.close();
            while let Ok(request) = rx.try_recv() {
                let _ = request.completion.send(Err(Error::disposed()));
            }
        }
        for member in state.members.drain(..) {
            member.worker.abort();
            member.conn.close();
        }
        self.live.store(0, Ordering::Release);
        if let Some(handle) = self.maintenance.lock().unwrap().take() {
            handle.abort();
        }
        debug!(endpoint = %self.endpoint, "kv pool disposed");
    }

    /// Single-writer recovery cycle: unlink and close dead connections,
    /// then reconnect in parallel up to the configured minimum. Creation
    /// failures are logged and dropped; the pool stays below minimum
    /// until the next cycle.
    async fn recover(&self) {
        if self.is_disposed() {
            return;
        }
        let mut state = self.state.lock().await;
        if self.is_disposed() {
            return;
        }

        let before = state.members.len();
        state.members.retain(|member| {
            if member.conn.is_dead() {
                member.worker.abort();
                member.conn.close();
                false
            } else {
                true
            }
        });
        let removed = before - state.members.len();
        if removed > 0 {
            debug!(
                endpoint = %self.endpoint,
                removed,
                "removed dead kv connections"
            );
        }

        let live = state.members.len();
        let floor = self.config.num_kv_connections.max(1);
        let ceiling = self.config.max_kv_connections.max(floor);
        let need = floor.saturating_sub(live).min(ceiling.saturating_sub(live));
        if need > 0 {
            let created = join_all((0..need).map(|_| self.create_connection())).await;
            for result in created {
                match result {
                    Ok(conn) => {
                        let worker = self.spawn_worker(conn.clone());
                        state.members.push(PoolMember { conn, worker });
                    }
                    Err(err) => {
                        warn!(
                            endpoint = %self.endpoint,
                            error = %err,
                            "failed to create kv connection"
                        );
                    }
                }
            }
        }
        self.live.store(state.members.len(), Ordering::Release);
    }

    async fn create_connection(&self) -> Result<Arc<Connection>, Error> {
        let factory = &self.factory;
        let initializer = &self.initializer;
        let endpoint = &self.endpoint;
        let handshake = async move {
            let mut transport = factory.connect(endpoint).await?;
            let features = initializer.initialize(&mut transport, endpoint).await?;
            Ok::<_, Error>((transport, features))
        };
        let (transport, features) = tokio::time::timeout(self.config.kv_connect_timeout, handshake)
            .await
            .map_err(|_| {
                Error::transport(format!("connect to {} timed out", self.endpoint))
            })??;
        Ok(Connection::spawn(
            self.endpoint.clone(),
            transport,
            features,
            self.death_notify.clone(),
        ))
    }

    fn spawn_worker(&self, conn: Arc<Connection>) -> JoinHandle<()> {
        let queue = self.queue_rx.clone();
        let pool = self.weak.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(worker_loop(conn, queue, pool, shutdown))
    }

    /// Transparent requeue of a request bounced off a dead connection.
    /// Every dead worker exits after bouncing at most one request, so a
    /// request can bounce once per concurrently-dead connection; more
    /// than `max_kv_connections` bounces means the pool is flapping and
    /// the request fails with a transport error instead of looping.
    async fn requeue(&self, mut request: SendRequest) {
        if request.requeues as usize >= self.config.max_kv_connections.max(1) {
            let _ = request.completion.send(Err(Error::transport(format!(
                "no live connection to {}",
                self.endpoint
            ))));
            return;
        }
        request.requeues += 1;
        if let Err(mpsc::error::SendError(request)) = self.queue_tx.send(request).await {
            let _ = request.completion.send(Err(Error::disposed()));
        }
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        self.shutdown.cancel();
        if let Some(handle) = self.maintenance.lock().unwrap().take() {
            handle.abort();
        }
    }
}

/// Worker bound to one connection. Pulls at most one request at a time
/// from the shared queue; a dead connection bounces the request back and
/// leaves the worker quiescent for recovery to unlink.
async fn worker_loop(
    conn: Arc<Connection>,
    queue: Arc<AsyncMutex<mpsc::Receiver<SendRequest>>>,
    pool: Weak<ConnectionPool>,
    shutdown: CancellationToken,
) {
    loop {
        let next = {
            let mut rx = tokio::select! {
                guard = queue.lock() => guard,
                _ = shutdown.cancelled() => return,
            };
            tokio::select! {
                item = rx.recv() => item,
                _ = shutdown.cancelled() => return,
            }
        };
        let request = match next {
            Some(request) => request,
            None => return,
        };

        if conn.is_dead() {
            match pool.upgrade() {
                Some(pool) => {
                    pool.requeue(request).await;
                    pool.death_notify.notify_one();
                }
                None => {
                    let _ = request.completion.send(Err(Error::disposed()));
                }
            }
            return;
        }

        if request.cancel.is_cancelled() {
            let _ = request.completion.send(Err(Error::cancelled()));
            continue;
        }

        let result = conn.execute(&request.operation, &request.cancel).await;
        let _ = request.completion.send(result);
    }
}
