use crate::config::Config;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

/// Immutable bucket -> backend address mapping for one configuration generation
#[derive(Debug, Clone)]
pub struct BucketTable {
    buckets: u64,
    reduction: u64,
    servers: HashMap<u64, String>,
}

impl BucketTable {
    pub fn new(
        buckets: u64,
        reduction: u64,
        servers: HashMap<u64, String>,
    ) -> Result<Self, RouteTableError> {
        if buckets == 0 {
            return Err(RouteTableError::InvalidBuckets(
                "bucket count must be positive".to_string(),
            ));
        }
        if reduction == 0 || buckets % reduction != 0 {
            return Err(RouteTableError::InvalidBuckets(format!(
                "reduction factor {} must evenly divide bucket count {}",
                reduction, buckets
            )));
        }
        if let Some((bucket, _)) = servers.iter().find(|(_, addr)| addr.is_empty()) {
            return Err(RouteTableError::InvalidBuckets(format!(
                "bucket {} has an empty address",
                bucket
            )));
        }
        Ok(Self {
            buckets,
            reduction,
            servers,
        })
    }

    /// Number of buckets keys actually hash into
    pub fn effective_buckets(&self) -> u64 {
        self.buckets / self.reduction
    }

    pub fn buckets(&self) -> u64 {
        self.buckets
    }

    pub fn reduction(&self) -> u64 {
        self.reduction
    }

    pub fn bucket_for(&self, key: &[u8]) -> u64 {
        key_hash(key) % self.effective_buckets()
    }

    /// Resolve a (tag-stripped) key to its backend address
    pub fn resolve(&self, key: &[u8]) -> Result<&str, RouteError> {
        let bucket = self.bucket_for(key);
        self.servers
            .get(&bucket)
            .map(String::as_str)
            .ok_or(RouteError::UnknownBucket(bucket))
    }

    /// Distinct backend addresses, sorted
    pub fn addresses(&self) -> Vec<String> {
        self.servers
            .values()
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Effective buckets with no address; keys landing there fail to route
    pub fn unmapped_buckets(&self) -> Vec<u64> {
        (0..self.effective_buckets())
            .filter(|b| !self.servers.contains_key(b))
            .collect()
    }
}

/// Sum of the key's byte values
pub fn key_hash(key: &[u8]) -> u64 {
    key.iter().map(|&b| u64::from(b)).sum()
}

/// Shared, reloadable handle to the current bucket table
#[derive(Debug)]
pub struct BucketRouter {
    table: RwLock<Arc<BucketTable>>,
}

impl BucketRouter {
    pub fn new(table: BucketTable) -> Self {
        Self {
            table: RwLock::new(Arc::new(table)),
        }
    }

    /// Snapshot of the current table; the lock is released before returning
    pub fn table(&self) -> Arc<BucketTable> {
        match self.table.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Resolve every key against one table snapshot
    pub fn resolve_all<'k, I>(&self, keys: I) -> Result<Vec<String>, RouteError>
    where
        I: IntoIterator<Item = &'k [u8]>,
    {
        let table = self.table();
        keys.into_iter()
            .map(|key| table.resolve(key).map(str::to_string))
            .collect()
    }

    /// Swap in a new table generation
    pub fn reload(&self, table: BucketTable) {
        let next = Arc::new(table);
        match self.table.write() {
            Ok(mut guard) => *guard = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
        tracing::info!("Bucket table reloaded");
    }
}

/// Builder for creating bucket tables from configuration
pub struct RouteTableBuilder;

impl RouteTableBuilder {
    pub fn build_from_config(config: &Config) -> Result<BucketTable, RouteTableError> {
        let servers = config
            .bucket_servers
            .iter()
            .map(|(bucket, addr)| (*bucket, addr.clone()))
            .collect();

        let table = BucketTable::new(config.buckets, config.reduce_buckets, servers)?;

        let unmapped = table.unmapped_buckets();
        if !unmapped.is_empty() {
            tracing::warn!(
                "{} of {} effective buckets have no backend: {:?}",
                unmapped.len(),
                table.effective_buckets(),
                unmapped
            );
        }

        tracing::info!(
            "🗺️  Bucket table built: {} buckets, reduction {}, {} backends",
            table.buckets(),
            table.reduction(),
            table.addresses().len()
        );

        Ok(table)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    #[error("no backend configured for bucket {0}")]
    UnknownBucket(u64),
}

#[derive(Debug, thiserror::Error)]
pub enum RouteTableError {
    #[error("Invalid bucket layout: {0}")]
    InvalidBuckets(String),
}
