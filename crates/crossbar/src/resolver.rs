//! Partition resolution for URI-addressed calls.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::error::ErrorCode;
use crate::types::{Gpid, RpcAddress, UriAddress};

/// Outcome of a successful resolution: the partition the key hashed to and
/// the endpoint currently owning it.
#[derive(Clone)]
pub struct ResolveResult {
    pub gpid: Gpid,
    pub address: RpcAddress,
}

/// Maps a partition key to a concrete endpoint for one URI.
///
/// `on_access_failure` is feedback from the caller: the endpoint the
/// resolver handed out rejected the partition, so cached placement should
/// be refreshed before the next resolve.
#[async_trait]
pub trait PartitionResolver: Send + Sync {
    async fn resolve(
        &self,
        partition_hash: u64,
        timeout: Duration,
    ) -> Result<ResolveResult, ErrorCode>;

    fn on_access_failure(&self, partition_index: u32, err: ErrorCode);
}

/// Registry of resolvers keyed by URI.
pub struct UriResolverManager {
    resolvers: DashMap<String, Arc<dyn PartitionResolver>>,
}

impl UriResolverManager {
    pub fn new() -> Self {
        Self {
            resolvers: DashMap::new(),
        }
    }

    pub fn register(&self, uri: impl Into<String>, resolver: Arc<dyn PartitionResolver>) {
        self.resolvers.insert(uri.into(), resolver);
    }

    pub fn lookup(&self, uri: &str) -> Option<Arc<dyn PartitionResolver>> {
        self.resolvers.get(uri).map(|r| Arc::clone(&r))
    }

    /// Build a URI address, binding its resolver when one is registered.
    pub fn make_uri(&self, uri: impl Into<String>) -> Arc<UriAddress> {
        let uri = uri.into();
        let address = Arc::new(UriAddress::new(uri.clone()));
        if let Some(resolver) = self.lookup(&uri) {
            address.bind_resolver(resolver);
        }
        address
    }
}

impl Default for UriResolverManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddrV4};

    struct FixedResolver(SocketAddrV4);

    #[async_trait]
    impl PartitionResolver for FixedResolver {
        async fn resolve(
            &self,
            _partition_hash: u64,
            _timeout: Duration,
        ) -> Result<ResolveResult, ErrorCode> {
            Ok(ResolveResult {
                gpid: Gpid::new(1, 0),
                address: RpcAddress::Ipv4(self.0),
            })
        }

        fn on_access_failure(&self, _partition_index: u32, _err: ErrorCode) {}
    }

    #[tokio::test]
    async fn make_uri_binds_registered_resolver() {
        let manager = UriResolverManager::new();
        let endpoint = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 7000);
        manager.register("raft://meta/app", Arc::new(FixedResolver(endpoint)));

        let bound = manager.make_uri("raft://meta/app");
        let resolver = bound.resolver().expect("resolver bound");
        let result = resolver.resolve(0, Duration::from_secs(1)).await.unwrap();
        assert_eq!(result.address, RpcAddress::Ipv4(endpoint));

        let unbound = manager.make_uri("raft://meta/other");
        assert!(unbound.resolver().is_none());
    }
}
