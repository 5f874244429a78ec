use std::time::Duration;

/// Tunables for the KV engine. One value is shared by every pool a bucket
/// creates.
#[derive(Debug, Clone)]
pub struct KvConfig {
    /// Minimum connections per node pool; recovery restores to this.
    pub num_kv_connections: usize,
    /// Maximum connections per node pool.
    pub max_kv_connections: usize,
    /// Socket connect plus handshake deadline.
    pub kv_connect_timeout: Duration,
    /// Capacity of a pool's bounded send queue; submission blocks when
    /// full (the back-pressure signal to callers).
    pub send_queue_capacity: usize,
    /// Applied to any KV call whose options carry no timeout.
    pub default_operation_timeout: Duration,
    /// Default per-operation durability deadline.
    pub durability_timeout: Duration,
}

impl Default for KvConfig {
    fn default() -> Self {
        KvConfig {
            num_kv_connections: 2,
            max_kv_connections: 5,
            kv_connect_timeout: Duration::from_secs(10),
            send_queue_capacity: 1024,
            default_operation_timeout: Duration::from_millis(2500),
            durability_timeout: Duration::from_millis(1500),
        }
    }
}

impl KvConfig {
    pub fn new() -> Self {
        KvConfig::default()
    }

    pub fn with_num_kv_connections(mut self, n: usize) -> Self {
        self.num_kv_connections = n;
        self
    }

    pub fn with_max_kv_connections(mut self, n: usize) -> Self {
        self.max_kv_connections = n;
        self
    }

    pub fn with_kv_connect_timeout(mut self, timeout: Duration) -> Self {
        self.kv_connect_timeout = timeout;
        self
    }

    pub fn with_send_queue_capacity(mut self, capacity: usize) -> Self {
        self.send_queue_capacity = capacity;
        self
    }

    pub fn with_default_operation_timeout(mut self, timeout: Duration) -> Self {
        self.default_operation_timeout = timeout;
        self
    }

    pub fn with_durability_timeout(mut self, timeout: Duration) -> Self {
        self.durability_timeout = timeout;
        self
    }
}
