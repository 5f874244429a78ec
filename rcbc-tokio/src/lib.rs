//! TCP transport binding for rcbc using the tokio runtime. Wire a
//! [`TcpConnectionFactory`] into the core's pools to talk to a real
//! cluster:
//!
//! ```ignore
//! use rcbc_tokio::{ConnectionPool, KvConfig, TcpConnectionFactory};
//!
//! let factory = Arc::new(TcpConnectionFactory::default());
//! let pool = ConnectionPool::start(endpoint, config, factory, initializer).await;
//! ```

use async_trait::async_trait;
use std::time::Duration;
use tokio::net::TcpStream;

use rcbc_core::{BoxedTransport, ConnectionFactory, Endpoint, Error};

pub use rcbc_core::{
    Bucket, Collection, ConnectionPool, Endpoint as KvEndpoint, Error as KvError,
    JsonTranscoder, KvConfig, NoopConfigListener, NoopInitializer, StaticNodeLocator,
    VBucketKeyMapper, VBucketMap,
};

/// Dials cluster nodes over TCP. Nagle is disabled: KV frames are small
/// and latency-bound.
#[derive(Debug, Clone)]
pub struct TcpConnectionFactory {
    connect_timeout: Duration,
}

impl TcpConnectionFactory {
    pub fn new(connect_timeout: Duration) -> Self {
        TcpConnectionFactory { connect_timeout }
    }
}

impl Default for TcpConnectionFactory {
    fn default() -> Self {
        TcpConnectionFactory::new(Duration::from_secs(10))
    }
}

#[async_trait]
impl ConnectionFactory for TcpConnectionFactory {
    async fn connect(&self, endpoint: &Endpoint) -> Result<BoxedTransport, Error> {
        let addr = format!("{}:{}", endpoint.host, endpoint.port);
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| Error::transport(format!("connect to {} timed out", endpoint)))??;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}
