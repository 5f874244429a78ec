//! Key placement: hash a key to a vBucket, resolve the vBucket to its
//! primary and replica nodes, and find the pool serving a node. The map
//! is immutable per revision and atomically replaced when the
//! configuration collaborator publishes a new one.

use arc_swap::ArcSwap;
use murmur3::murmur3_32;
use std::sync::Arc;

use crate::connection::Endpoint;
use crate::pool::ConnectionPool;

/// Where a key lives: the shard index, the primary node, the replicas.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VBucket {
    pub index: u16,
    pub primary: Option<usize>,
    pub replicas: Vec<usize>,
}

impl VBucket {
    pub fn has_replicas(&self) -> bool {
        !self.replicas.is_empty()
    }
}

pub trait KeyMapper: Send + Sync + 'static {
    fn map_key(&self, key: &[u8]) -> VBucket;
    /// Revision of the map the answer came from.
    fn revision(&self) -> u64;
}

/// One revision of the cluster's vbucket map.
#[derive(Debug, Clone)]
pub struct VBucketMap {
    pub revision: u64,
    pub nodes: Vec<Endpoint>,
    /// `entries[vb]` lists node indexes: primary first, then replicas.
    /// A negative index means no node holds that copy yet.
    pub entries: Vec<Vec<i32>>,
}

impl VBucketMap {
    pub fn new(revision: u64, nodes: Vec<Endpoint>, entries: Vec<Vec<i32>>) -> Self {
        VBucketMap {
            revision,
            nodes,
            entries,
        }
    }

    /// A map spreading `num_vbuckets` shards round-robin over the nodes
    /// with the given replica count. Handy for tests and single-node
    /// deployments; real maps come from the configuration collaborator.
    pub fn uniform(
        revision: u64,
        nodes: Vec<Endpoint>,
        num_vbuckets: usize,
        replicas: usize,
    ) -> Self {
        let n = nodes.len().max(1);
        let entries = (0..num_vbuckets)
            .map(|vb| {
                (0..=replicas.min(n - 1))
                    .map(|copy| ((vb + copy) % n) as i32)
                    .collect()
            })
            .collect();
        VBucketMap::new(revision, nodes, entries)
    }

    fn lookup(&self, index: u16) -> VBucket {
        let entry = &self.entries[index as usize];
        let primary = entry
            .first()
            .and_then(|&n| if n >= 0 { Some(n as usize) } else { None });
        let replicas = entry
            .iter()
            .skip(1)
            .filter(|&&n| n >= 0)
            .map(|&n| n as usize)
            .collect();
        VBucket {
            index,
            primary,
            replicas,
        }
    }
}

/// The default [`KeyMapper`]: murmur3 over the key, mod the map size.
pub struct VBucketKeyMapper {
    map: ArcSwap<VBucketMap>,
}

impl VBucketKeyMapper {
    pub fn new(map: VBucketMap) -> Self {
        VBucketKeyMapper {
            map: ArcSwap::from_pointee(map),
        }
    }

    /// Atomically publish a new map revision. In-flight lookups keep the
    /// revision they started with.
    pub fn replace_map(&self, map: VBucketMap) {
        self.map.store(Arc::new(map));
    }

    pub fn current(&self) -> Arc<VBucketMap> {
        self.map.load_full()
    }
}

impl KeyMapper for VBucketKeyMapper {
    fn map_key(&self, key: &[u8]) -> VBucket {
        let map = self.map.load();
        let mut reader = key;
        // Reading from a slice cannot fail.
        let hash = murmur3_32(&mut reader, 0).unwrap();
        let index = (hash % map.entries.len() as u32) as u16;
        map.lookup(index)
    }

    fn revision(&self) -> u64 {
        self.map.load().revision
    }
}

/// Finds the pool serving a vbucket's primary (or a replica copy).
pub trait NodeLocator: Send + Sync + 'static {
    fn pool_for(
        &self,
        vbucket: &VBucket,
        replica_index: Option<usize>,
    ) -> Option<Arc<ConnectionPool>>;
}

/// Node index → pool, aligned with the map's node list.
pub struct StaticNodeLocator {
    pools: Vec<Arc<ConnectionPool>>,
}

impl StaticNodeLocator {
    pub fn new(pools: Vec<Arc<ConnectionPool>>) -> Self {
        StaticNodeLocator { pools }
    }

    pub fn pools(&self) -> &[Arc<ConnectionPool>] {
        &self.pools
    }
}

impl NodeLocator for StaticNodeLocator {
    fn pool_for(
        &self,
        vbucket: &VBucket,
        replica_index: Option<usize>,
    ) -> Option<Arc<ConnectionPool>> {
        let node = match replica_index {
            None => vbucket.primary?,
            Some(i) => *vbucket.replicas.get(i)?,
        };
        self.pools.get(node).cloned()
    }
}

/// Hook the dispatcher pulls when the server reports a vbucket moved;
/// the configuration collaborator should fetch and publish a new map.
pub trait ConfigListener: Send + Sync + 'static {
    fn map_refresh_needed(&self, revision: u64);
}

/// For wirings without a configuration collaborator.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopConfigListener;

impl ConfigListener for NoopConfigListener {
    fn map_refresh_needed(&self, _revision: u64) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nodes(n: usize) -> Vec<Endpoint> {
        (0..n)
            .map(|i| Endpoint::new(format!("node{}", i), 11210))
            .collect()
    }

    #[test]
    fn test_map_key_is_deterministic() {
        let mapper = VBucketKeyMapper::new(VBucketMap::uniform(1, nodes(3), 1024, 1));
        let a = mapper.map_key(b"some-key");
        let b = mapper.map_key(b"some-key");
        assert_eq!(a, b);
        assert!(a.index < 1024);
        assert!(a.primary.is_some());
        assert_eq!(1, a.replicas.len());
    }

    #[test]
    fn test_distinct_keys_spread_over_vbuckets() {
        let mapper = VBucketKeyMapper::new(VBucketMap::uniform(1, nodes(3), 1024, 0));
        let indexes: std::collections::HashSet<u16> = (0..100)
            .map(|i| mapper.map_key(format!("key-{}", i).as_bytes()).index)
            .collect();
        assert!(indexes.len() > 50);
    }

    #[test]
    fn test_negative_entry_means_no_node() {
        let map = VBucketMap::new(1, nodes(2), vec![vec![-1, 1], vec![0, -1]]);
        let vb0 = map.lookup(0);
        assert_eq!(None, vb0.primary);
        assert_eq!(vec![1], vb0.replicas);
        let vb1 = map.lookup(1);
        assert_eq!(Some(0), vb1.primary);
        assert!(!vb1.has_replicas());
    }

    #[test]
    fn test_replace_map_swaps_revision() {
        let mapper = VBucketKeyMapper::new(VBucketMap::uniform(1, nodes(2), 64, 0));
        assert_eq!(1, mapper.revision());
        mapper.replace_map(VBucketMap::uniform(2, nodes(3), 64, 1));
        assert_eq!(2, mapper.revision());
        assert_eq!(3, mapper.current().nodes.len());
    }

    #[test]
    fn test_uniform_replicas_differ_from_primary() {
        let map = VBucketMap::uniform(1, nodes(3), 128, 2);
        for vb in 0..128u16 {
            let placed = map.lookup(vb);
            let primary = placed.primary.unwrap();
            for replica in placed.replicas {
                assert_ne!(primary, replica);
            }
        }
    }
}
