//! Public operation surface.
//!
//! Every operation resolves its connection, compiles criteria against the
//! connection's schema, runs the statement in a transaction scope and casts
//! the rows it gets back.

use std::sync::Arc;

use indexmap::IndexMap;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_postgres::Client;
use tracing::{debug, info, warn};

use crate::codec::{cast_record, sanitize, Record};
use crate::config::ConnectionOptions;
use crate::criteria::{translate_placeholders, Criteria, CriteriaCompiler, DialectOptions};
use crate::db::{
    describe_table, ensure_table, Connection, ConnectionRegistry, QueryOutput, TableDescription,
    TransactionHandle, TxScope,
};
use crate::error::{AdapterError, Result};
use crate::schema::{resolve_definition, resolve_single, AttributeSpec, CollectionInput};
use crate::types::{add_column_statements, drop_column_statement, drop_table_statement};

/// Handle to a set of registered connections. Cloning is cheap and clones
/// share the same registry.
#[derive(Clone, Default)]
pub struct Adapter {
    registry: Arc<ConnectionRegistry>,
    dialect: DialectOptions,
}

impl Adapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dialect(dialect: DialectOptions) -> Self {
        Self {
            registry: Arc::new(ConnectionRegistry::new()),
            dialect,
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn dialect(&self) -> &DialectOptions {
        &self.dialect
    }

    async fn connection(&self, identity: &str) -> Result<Arc<Connection>> {
        self.registry.get(identity).await
    }

    pub async fn register_connection(
        &self,
        options: ConnectionOptions,
        collections: &IndexMap<String, CollectionInput>,
    ) -> Result<()> {
        self.registry.register(options, collections).await?;
        Ok(())
    }

    pub async fn teardown(&self, connection: Option<&str>) -> Result<()> {
        self.registry.teardown(connection).await
    }

    pub async fn get_primary_key(&self, connection: &str, table: &str) -> Result<String> {
        let conn = self.connection(connection).await?;
        let definition = conn.schema().table(table)?;
        Ok(definition.primary_key().to_string())
    }

    /// Open a transaction the caller commits or rolls back.
    pub async fn transaction(&self, connection: &str) -> Result<TransactionHandle> {
        self.connection(connection).await?.transaction().await
    }

    pub async fn describe(&self, connection: &str, table: &str) -> Result<Option<TableDescription>> {
        let conn = self.connection(connection).await?;
        let client = conn.client().await?;
        describe_table(&client, table).await
    }

    /// Create `table` from `attributes` unless it already exists.
    pub async fn define(
        &self,
        connection: &str,
        table: &str,
        attributes: &IndexMap<String, AttributeSpec>,
    ) -> Result<()> {
        let conn = self.connection(connection).await?;
        let definition = resolve_definition(table, attributes, conn.schema());
        let client = conn.client().await?;
        if ensure_table(&client, &definition).await? {
            info!(connection, table, "table defined");
        }
        Ok(())
    }

    /// Drop `table`, then each of `relations` on a best-effort basis.
    pub async fn drop_table(&self, connection: &str, table: &str, relations: &[String]) -> Result<()> {
        let conn = self.connection(connection).await?;
        let client = conn.client().await?;
        client.batch_execute(&drop_table_statement(table)).await?;
        for relation in relations {
            if let Err(e) = client.batch_execute(&drop_table_statement(relation)).await {
                warn!(connection, relation = %relation, error = %e, "could not drop relation");
            }
        }
        Ok(())
    }

    pub async fn add_attribute(
        &self,
        connection: &str,
        table: &str,
        attribute: &str,
        spec: &AttributeSpec,
    ) -> Result<()> {
        let conn = self.connection(connection).await?;
        let Some(resolved) = resolve_single(table, attribute, spec, conn.schema()) else {
            debug!(connection, table, attribute, "association attribute has no column");
            return Ok(());
        };
        let client = conn.client().await?;
        for statement in add_column_statements(table, &resolved) {
            client.batch_execute(&statement).await?;
        }
        Ok(())
    }

    pub async fn remove_attribute(&self, connection: &str, table: &str, attribute: &str) -> Result<()> {
        let conn = self.connection(connection).await?;
        let client = conn.client().await?;
        client
            .batch_execute(&drop_column_statement(table, attribute))
            .await?;
        Ok(())
    }

    pub async fn create(
        &self,
        connection: &str,
        table: &str,
        record: Record,
        txn: Option<&mut TransactionHandle>,
    ) -> Result<Record> {
        let conn = self.connection(connection).await?;
        let scope = TxScope::acquire(&conn, txn).await?;
        let result = match scope.client() {
            Ok(client) => self.insert(&conn, client, table, record).await,
            Err(e) => Err(e),
        };
        scope.finish(result).await
    }

    /// Insert every record in one transaction; nothing is kept if any insert
    /// fails.
    pub async fn create_each(
        &self,
        connection: &str,
        table: &str,
        records: Vec<Record>,
        txn: Option<&mut TransactionHandle>,
    ) -> Result<Vec<Record>> {
        let conn = self.connection(connection).await?;
        let scope = TxScope::acquire(&conn, txn).await?;
        let result = match scope.client() {
            Ok(client) => {
                let mut created = Vec::with_capacity(records.len());
                let mut failure = None;
                for record in records {
                    match self.insert(&conn, client, table, record).await {
                        Ok(row) => created.push(row),
                        Err(e) => {
                            failure = Some(e);
                            break;
                        }
                    }
                }
                match failure {
                    Some(e) => Err(e),
                    None => Ok(created),
                }
            }
            Err(e) => Err(e),
        };
        scope.finish(result).await
    }

    async fn insert(
        &self,
        conn: &Connection,
        client: &Client,
        table: &str,
        record: Record,
    ) -> Result<Record> {
        let definition = conn.schema().table(table)?;
        let values = sanitize(record, definition)?;
        let query = CriteriaCompiler::new(conn.schema(), &self.dialect).insert(table, &values)?;
        let rows = conn.executor(client).fetch_records(&query).await?;
        Ok(rows
            .into_iter()
            .next()
            .map(|row| cast_record(row, definition))
            .unwrap_or_default())
    }

    /// Apply `changes` to every matching row and return the rows as written.
    /// An empty change set is a plain find.
    pub async fn update(
        &self,
        connection: &str,
        table: &str,
        criteria: &Criteria,
        changes: Record,
        txn: Option<&mut TransactionHandle>,
    ) -> Result<Vec<Record>> {
        let conn = self.connection(connection).await?;
        let definition = conn.schema().table(table)?;
        let values = sanitize(changes, definition)?;
        if values.is_empty() {
            debug!(connection, table, "empty update treated as find");
            return self.find(connection, table, criteria, txn).await;
        }
        let query = CriteriaCompiler::new(conn.schema(), &self.dialect)
            .update(table, criteria, &values)?;

        let scope = TxScope::acquire(&conn, txn).await?;
        let result = match scope.client() {
            Ok(client) => conn
                .executor(client)
                .fetch_records(&query)
                .await
                .map(|rows| rows.into_iter().map(|row| cast_record(row, definition)).collect()),
            Err(e) => Err(e),
        };
        scope.finish(result).await
    }

    pub async fn destroy(
        &self,
        connection: &str,
        table: &str,
        criteria: &Criteria,
        txn: Option<&mut TransactionHandle>,
    ) -> Result<Vec<Record>> {
        let conn = self.connection(connection).await?;
        let definition = conn.schema().table(table)?;
        let query = CriteriaCompiler::new(conn.schema(), &self.dialect).destroy(table, criteria)?;

        let scope = TxScope::acquire(&conn, txn).await?;
        let result = match scope.client() {
            Ok(client) => conn
                .executor(client)
                .fetch_records(&query)
                .await
                .map(|rows| rows.into_iter().map(|row| cast_record(row, definition)).collect()),
            Err(e) => Err(e),
        };
        scope.finish(result).await
    }

    /// Rows matching `criteria`. Criteria carrying joins are answered by
    /// [`Adapter::join`].
    pub async fn find(
        &self,
        connection: &str,
        table: &str,
        criteria: &Criteria,
        txn: Option<&mut TransactionHandle>,
    ) -> Result<Vec<Record>> {
        if !criteria.joins.is_empty() {
            return self.join(connection, table, criteria, txn).await;
        }
        let conn = self.connection(connection).await?;
        let definition = conn.schema().table(table)?;
        let query = CriteriaCompiler::new(conn.schema(), &self.dialect).find(table, criteria)?;

        let scope = TxScope::read(&conn, txn).await?;
        let result = match scope.client() {
            Ok(client) => conn
                .executor(client)
                .fetch_records(&query)
                .await
                .map(|rows| rows.into_iter().map(|row| cast_record(row, definition)).collect()),
            Err(e) => Err(e),
        };
        scope.finish(result).await
    }

    pub async fn count(
        &self,
        connection: &str,
        table: &str,
        criteria: &Criteria,
        txn: Option<&mut TransactionHandle>,
    ) -> Result<u64> {
        let conn = self.connection(connection).await?;
        let query = CriteriaCompiler::new(conn.schema(), &self.dialect).count(table, criteria)?;

        let scope = TxScope::read(&conn, txn).await?;
        let result = match scope.client() {
            Ok(client) => match conn.executor(client).fetch(&query).await {
                Ok(rows) => match rows.first() {
                    Some(row) => row
                        .try_get::<_, i64>("count")
                        .map(|count| count.max(0) as u64)
                        .map_err(AdapterError::from),
                    None => Ok(0),
                },
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };
        scope.finish(result).await
    }

    /// Parent rows with their associations embedded, in one round trip.
    pub async fn join(
        &self,
        connection: &str,
        table: &str,
        criteria: &Criteria,
        txn: Option<&mut TransactionHandle>,
    ) -> Result<Vec<Record>> {
        let conn = self.connection(connection).await?;
        let compiler = CriteriaCompiler::new(conn.schema(), &self.dialect);
        let query = compiler.join(table, criteria)?;

        let scope = TxScope::read(&conn, txn).await?;
        let result = match scope.client() {
            Ok(client) => match conn.executor(client).fetch_records(&query).await {
                Ok(rows) => compiler.nest_children(table, criteria, rows),
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };
        scope.finish(result).await
    }

    /// Run caller-supplied SQL. `?` markers are rewritten to `$n`; `args`
    /// are encoded against the types the server infers for them.
    pub async fn query(
        &self,
        connection: &str,
        table: &str,
        sql: &str,
        args: Vec<Value>,
        txn: Option<&mut TransactionHandle>,
    ) -> Result<QueryOutput> {
        let conn = self.connection(connection).await?;
        let sql = translate_placeholders(sql);
        debug!(connection, table, "raw query");

        let scope = TxScope::read(&conn, txn).await?;
        let result = match scope.client() {
            Ok(client) => conn.executor(client).raw(&sql, args).await,
            Err(e) => Err(e),
        };
        scope.finish(result).await
    }

    /// Invoke a stored procedure found at registration.
    pub async fn procedure(&self, connection: &str, name: &str, args: Vec<Value>) -> Result<Vec<Record>> {
        let conn = self.connection(connection).await?;
        let query = conn.procedures().get(name)?.invocation(args);
        let client = conn.client().await?;
        conn.executor(&client).fetch_records(&query).await
    }

    /// Send matching rows into `sink` as the server produces them. Resolves
    /// with the number of rows delivered once the result is exhausted or the
    /// receiver is dropped.
    pub async fn stream(
        &self,
        connection: &str,
        table: &str,
        criteria: &Criteria,
        sink: mpsc::Sender<Record>,
    ) -> Result<u64> {
        let conn = self.connection(connection).await?;
        let definition = conn.schema().table(table)?;
        let query = CriteriaCompiler::new(conn.schema(), &self.dialect).find(table, criteria)?;
        let client = conn.client().await?;
        conn.executor(&client)
            .stream(&query, &sink, |row| cast_record(row, definition))
            .await
    }
}
