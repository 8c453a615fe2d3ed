use std::collections::HashMap;
use std::sync::Arc;

use deadpool_postgres::{Object, Pool};
use indexmap::IndexMap;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::catalog::{self, ServerVersion};
use super::executor::Executor;
use super::pool;
use super::procedures::ProcedureCatalog;
use super::transaction::TransactionHandle;
use crate::config::ConnectionOptions;
use crate::error::{AdapterError, Result};
use crate::schema::{build_schema, CollectionInput, Schema};

/// One registered database: its pool, the schema built from the caller's
/// collections and the stored procedures found at registration.
pub struct Connection {
    options: ConnectionOptions,
    pool: Pool,
    schema: Schema,
    procedures: ProcedureCatalog,
    version: ServerVersion,
    postgis: Option<ServerVersion>,
    idle_sweep: JoinHandle<()>,
}

impl Connection {
    pub fn identity(&self) -> &str {
        &self.options.identity
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn procedures(&self) -> &ProcedureCatalog {
        &self.procedures
    }

    pub fn server_version(&self) -> ServerVersion {
        self.version
    }

    pub fn postgis_version(&self) -> Option<ServerVersion> {
        self.postgis
    }

    pub fn transactions_enabled(&self) -> bool {
        self.options.enable_transactions
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub async fn client(&self) -> Result<Object> {
        Ok(self.pool.get().await?)
    }

    pub fn executor<'c>(&self, client: &'c tokio_postgres::Client) -> Executor<'c> {
        Executor::new(client, self.options.debug)
    }

    /// Open a caller-managed transaction, or a pass-through handle when
    /// transactions are disabled.
    pub async fn transaction(&self) -> Result<TransactionHandle> {
        let client = self.client().await?;
        if self.transactions_enabled() {
            TransactionHandle::begin(client).await
        } else {
            Ok(TransactionHandle::passthrough(client))
        }
    }

    fn close(&self) {
        self.idle_sweep.abort();
        self.pool.close();
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.idle_sweep.abort();
    }
}

/// Live connections keyed by identity.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<String, Arc<Connection>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open, validate and publish a connection. The entry only becomes
    /// visible once every registration step has succeeded.
    pub async fn register(
        &self,
        options: ConnectionOptions,
        collections: &IndexMap<String, CollectionInput>,
    ) -> Result<Arc<Connection>> {
        let identity = options.identity.clone();
        if identity.trim().is_empty() {
            return Err(AdapterError::IdentityMissing);
        }
        if self.connections.read().await.contains_key(&identity) {
            return Err(AdapterError::IdentityDuplicate(identity));
        }

        let pool = pool::create_pool(&options)?;
        match self.prepare(options, pool.clone(), collections).await {
            Ok(connection) => {
                let mut connections = self.connections.write().await;
                if connections.contains_key(&identity) {
                    connection.close();
                    return Err(AdapterError::IdentityDuplicate(identity));
                }
                let connection = Arc::new(connection);
                connections.insert(identity.clone(), connection.clone());
                info!(
                    identity = %identity,
                    server = %connection.version,
                    tables = connection.schema.len(),
                    "connection registered"
                );
                Ok(connection)
            }
            Err(err) => {
                pool.close();
                Err(err)
            }
        }
    }

    async fn prepare(
        &self,
        options: ConnectionOptions,
        pool: Pool,
        collections: &IndexMap<String, CollectionInput>,
    ) -> Result<Connection> {
        pool::warm(&pool, &options.pool).await?;
        let client = pool.get().await?;

        let version = catalog::server_version(&client).await?;
        let schema = build_schema(collections);
        let postgis = if schema.has_spatial_columns() {
            Some(catalog::postgis_version(&client).await?)
        } else {
            None
        };

        if options.schema_sync {
            for table in schema.tables() {
                if catalog::ensure_table(&client, table).await? {
                    info!(identity = %options.identity, table = %table.name, "table created");
                }
            }
        }

        let procedures = ProcedureCatalog::load(&client, version).await?;
        drop(client);

        let idle_sweep = pool::spawn_idle_sweep(&options.identity, pool.clone(), &options.pool);
        Ok(Connection {
            options,
            pool,
            schema,
            procedures,
            version,
            postgis,
            idle_sweep,
        })
    }

    pub async fn get(&self, identity: &str) -> Result<Arc<Connection>> {
        self.connections
            .read()
            .await
            .get(identity)
            .cloned()
            .ok_or_else(|| AdapterError::UnknownConnection(identity.to_string()))
    }

    pub async fn identities(&self) -> Vec<String> {
        let mut identities: Vec<String> = self.connections.read().await.keys().cloned().collect();
        identities.sort();
        identities
    }

    /// Close one connection, or every connection when `identity` is `None`.
    /// The pool is closed before the entry is removed; unknown identities are
    /// ignored.
    pub async fn teardown(&self, identity: Option<&str>) -> Result<()> {
        let targets = match identity {
            Some(identity) => vec![identity.to_string()],
            None => self.identities().await,
        };
        for identity in targets {
            let connection = self.connections.read().await.get(&identity).cloned();
            let Some(connection) = connection else {
                warn!(identity = %identity, "teardown of unknown connection ignored");
                continue;
            };
            connection.close();
            self.connections.write().await.remove(&identity);
            info!(identity = %identity, "connection closed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_requires_identity() {
        let registry = ConnectionRegistry::new();
        let err = registry
            .register(ConnectionOptions::new("  "), &IndexMap::new())
            .await
            .err()
            .unwrap();
        assert_eq!(err.code(), "E_IDENTITY_MISSING");
        assert!(registry.identities().await.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_connection() {
        let registry = ConnectionRegistry::new();
        let err = registry.get("nope").await.err().unwrap();
        assert_eq!(err.code(), "E_UNKNOWN_CONNECTION");
    }

    #[tokio::test]
    async fn test_teardown_of_unknown_identity_is_a_no_op() {
        let registry = ConnectionRegistry::new();
        registry.teardown(Some("ghost")).await.unwrap();
        registry.teardown(None).await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_registration_is_not_published() {
        let registry = ConnectionRegistry::new();
        let mut options = ConnectionOptions::new("unreachable");
        options.host = "127.0.0.1".into();
        options.port = 1;
        options.ssl_mode = crate::config::SslMode::Disable;
        options.pool.acquire_timeout_ms = 2_000;
        let err = registry.register(options, &IndexMap::new()).await.err().unwrap();
        assert_eq!(err.code(), "E_CONNECTION");
        assert!(registry.get("unreachable").await.is_err());
    }
}
