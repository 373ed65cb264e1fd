use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;

use crate::resolver::PartitionResolver;

/// A logical service URI whose concrete endpoint is obtained through an
/// attached [`PartitionResolver`].
///
/// Calls against an unbound URI fail with `ServiceNotFound`.
pub struct UriAddress {
    uri: String,
    resolver: RwLock<Option<Arc<dyn PartitionResolver>>>,
}

impl UriAddress {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            resolver: RwLock::new(None),
        }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn resolver(&self) -> Option<Arc<dyn PartitionResolver>> {
        self.resolver.read().clone()
    }

    pub fn bind_resolver(&self, resolver: Arc<dyn PartitionResolver>) {
        *self.resolver.write() = Some(resolver);
    }
}

impl fmt::Debug for UriAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UriAddress")
            .field("uri", &self.uri)
            .field("bound", &self.resolver.read().is_some())
            .finish()
    }
}
