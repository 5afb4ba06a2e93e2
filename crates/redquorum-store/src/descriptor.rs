//! Store descriptors accepted by the coordinator

use std::sync::Arc;

use redis::Client;
use redis::aio::ConnectionManager;

use crate::backend::StoreBackend;
use crate::error::Result;
use crate::memory::MemoryStore;
use crate::redis_store::RedisStore;

/// One configured store, in any of the forms a caller may have at hand
pub enum StoreDescriptor {
    /// `redis://` URL, connected lazily
    Url(String),
    /// Pre-built Redis client
    Client(Client),
    /// Already connected Redis connection manager
    Connection(ConnectionManager),
    /// Any other backend, e.g. one borrowing connections from a pool per call
    Backend(Arc<dyn StoreBackend>),
}

impl StoreDescriptor {
    /// Normalize into a backend. Only URL parsing can fail.
    pub fn into_backend(self) -> Result<Arc<dyn StoreBackend>> {
        match self {
            StoreDescriptor::Url(url) => Ok(Arc::new(RedisStore::open(&url)?)),
            StoreDescriptor::Client(client) => {
                let name = format!("{:?}", client.get_connection_info().addr);
                Ok(Arc::new(RedisStore::from_client(name, client)))
            }
            StoreDescriptor::Connection(connection) => Ok(Arc::new(
                RedisStore::from_connection("redis-connection", connection),
            )),
            StoreDescriptor::Backend(backend) => Ok(backend),
        }
    }
}

impl std::fmt::Debug for StoreDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreDescriptor::Url(_) => write!(f, "StoreDescriptor::Url(..)"),
            StoreDescriptor::Client(_) => write!(f, "StoreDescriptor::Client(..)"),
            StoreDescriptor::Connection(_) => write!(f, "StoreDescriptor::Connection(..)"),
            StoreDescriptor::Backend(backend) => {
                write!(f, "StoreDescriptor::Backend({})", backend.name())
            }
        }
    }
}

impl From<&str> for StoreDescriptor {
    fn from(url: &str) -> Self {
        StoreDescriptor::Url(url.to_string())
    }
}

impl From<String> for StoreDescriptor {
    fn from(url: String) -> Self {
        StoreDescriptor::Url(url)
    }
}

impl From<&String> for StoreDescriptor {
    fn from(url: &String) -> Self {
        StoreDescriptor::Url(url.clone())
    }
}

impl From<Client> for StoreDescriptor {
    fn from(client: Client) -> Self {
        StoreDescriptor::Client(client)
    }
}

impl From<ConnectionManager> for StoreDescriptor {
    fn from(connection: ConnectionManager) -> Self {
        StoreDescriptor::Connection(connection)
    }
}

impl From<Arc<dyn StoreBackend>> for StoreDescriptor {
    fn from(backend: Arc<dyn StoreBackend>) -> Self {
        StoreDescriptor::Backend(backend)
    }
}

impl From<MemoryStore> for StoreDescriptor {
    fn from(store: MemoryStore) -> Self {
        StoreDescriptor::Backend(Arc::new(store))
    }
}

impl From<RedisStore> for StoreDescriptor {
    fn from(store: RedisStore) -> Self {
        StoreDescriptor::Backend(Arc::new(store))
    }
}
