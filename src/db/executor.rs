use std::time::{Duration, Instant};

use futures_util::{pin_mut, TryStreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_postgres::{Client, Row, Statement};
use tracing::{debug, info};

use crate::codec::{decode_row, decode_rows, encode_params, Record, WireValue};
use crate::criteria::CompiledQuery;
use crate::error::Result;

/// Outcome of a raw SQL statement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryOutput {
    pub rows: Vec<Record>,
    /// Set for statements that do not return rows.
    pub affected_rows: Option<u64>,
    pub execution_time: Duration,
}

/// Runs compiled statements on one client, logging each at debug level, or
/// at info level when the connection has `debug` enabled.
pub struct Executor<'c> {
    client: &'c Client,
    verbose: bool,
}

impl<'c> Executor<'c> {
    pub fn new(client: &'c Client, verbose: bool) -> Self {
        Self { client, verbose }
    }

    fn log(&self, sql: &str, params: usize, elapsed: Duration, rows: u64) {
        let elapsed_ms = elapsed.as_secs_f64() * 1000.0;
        if self.verbose {
            info!(sql, params, rows, elapsed_ms, "statement executed");
        } else {
            debug!(sql, params, rows, elapsed_ms, "statement executed");
        }
    }

    async fn bind(&self, query: &CompiledQuery) -> Result<(Statement, Vec<WireValue>)> {
        let statement = self.client.prepare(&query.sql).await?;
        let params = encode_params(&query.values, statement.params())?;
        Ok((statement, params))
    }

    pub async fn fetch(&self, query: &CompiledQuery) -> Result<Vec<Row>> {
        let start = Instant::now();
        let (statement, params) = self.bind(query).await?;
        let rows: Vec<Row> = self
            .client
            .query_raw(&statement, params.iter())
            .await?
            .try_collect()
            .await?;
        self.log(&query.sql, params.len(), start.elapsed(), rows.len() as u64);
        Ok(rows)
    }

    pub async fn fetch_records(&self, query: &CompiledQuery) -> Result<Vec<Record>> {
        let rows = self.fetch(query).await?;
        Ok(decode_rows(&rows))
    }

    pub async fn execute(&self, query: &CompiledQuery) -> Result<u64> {
        let start = Instant::now();
        let (statement, params) = self.bind(query).await?;
        let affected = self.client.execute_raw(&statement, params.iter()).await?;
        self.log(&query.sql, params.len(), start.elapsed(), affected);
        Ok(affected)
    }

    /// Send decoded rows into `sink` as they arrive. Returns the number of
    /// rows delivered; a closed receiver ends the stream early.
    pub async fn stream(
        &self,
        query: &CompiledQuery,
        sink: &mpsc::Sender<Record>,
        cast: impl Fn(Record) -> Record,
    ) -> Result<u64> {
        let start = Instant::now();
        let (statement, params) = self.bind(query).await?;
        let rows = self.client.query_raw(&statement, params.iter()).await?;
        pin_mut!(rows);

        let mut delivered = 0u64;
        while let Some(row) = rows.try_next().await? {
            if sink.send(cast(decode_row(&row))).await.is_err() {
                debug!(delivered, "stream receiver dropped");
                break;
            }
            delivered += 1;
        }
        self.log(&query.sql, params.len(), start.elapsed(), delivered);
        Ok(delivered)
    }

    /// Run caller-supplied SQL. Row-returning statements yield records;
    /// anything else yields the affected row count.
    pub async fn raw(&self, sql: &str, args: Vec<Value>) -> Result<QueryOutput> {
        let start = Instant::now();
        let query = CompiledQuery::new(sql.trim(), args);
        if is_row_returning(&query.sql) {
            let records = self.fetch_records(&query).await?;
            Ok(QueryOutput {
                rows: records,
                affected_rows: None,
                execution_time: start.elapsed(),
            })
        } else {
            let affected = self.execute(&query).await?;
            Ok(QueryOutput {
                rows: Vec::new(),
                affected_rows: Some(affected),
                execution_time: start.elapsed(),
            })
        }
    }
}

/// Whether a statement produces a result set.
pub fn is_row_returning(sql: &str) -> bool {
    let upper = sql.trim_start().to_uppercase();
    upper.starts_with("SELECT")
        || upper.starts_with("WITH")
        || upper.starts_with("SHOW")
        || upper.starts_with("EXPLAIN")
        || upper.starts_with("TABLE")
        || upper.starts_with("VALUES")
        || upper.contains("RETURNING")
}
