use deadpool_postgres::Object;
use tokio_postgres::Client;
use tracing::{debug, warn};

use super::registry::Connection;
use crate::error::{AdapterError, Result};

/// A pooled client with an open transaction, or a plain client when
/// transactions are disabled for the connection.
///
/// Dropping an active handle without committing rolls it back.
pub struct TransactionHandle {
    client: Option<Object>,
    active: bool,
}

impl TransactionHandle {
    pub(crate) async fn begin(client: Object) -> Result<Self> {
        client.batch_execute("BEGIN").await?;
        debug!("transaction opened");
        Ok(Self {
            client: Some(client),
            active: true,
        })
    }

    /// A handle whose commit and rollback do nothing.
    pub(crate) fn passthrough(client: Object) -> Self {
        Self {
            client: Some(client),
            active: false,
        }
    }

    /// True when BEGIN was issued and neither COMMIT nor ROLLBACK has been.
    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn client(&self) -> Result<&Client> {
        self.client
            .as_deref()
            .map(|wrapper| &**wrapper)
            .ok_or_else(|| AdapterError::Transaction("transaction handle already finished".into()))
    }

    pub async fn commit(mut self) -> Result<()> {
        self.finish("COMMIT").await
    }

    pub async fn rollback(mut self) -> Result<()> {
        self.finish("ROLLBACK").await
    }

    async fn finish(&mut self, statement: &str) -> Result<()> {
        if !self.active {
            return Ok(());
        }
        self.active = false;
        let client = self.client()?;
        client.batch_execute(statement).await?;
        debug!(statement, "transaction finished");
        Ok(())
    }
}

impl Drop for TransactionHandle {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        let Some(client) = self.client.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(e) = client.batch_execute("ROLLBACK").await {
                        warn!(error = %e, "rollback of abandoned transaction failed");
                    }
                });
            }
            Err(_) => {
                // closing the session makes the server discard the transaction
                drop(Object::take(client));
            }
        }
    }
}

/// The transaction an operation runs in: either one the caller passed in,
/// or one the operation opened and must finish itself.
pub enum TxScope<'t> {
    Borrowed(&'t mut TransactionHandle),
    Owned(TransactionHandle),
}

impl<'t> TxScope<'t> {
    /// Reuse `existing` or open a new transaction on `connection`.
    pub async fn acquire(
        connection: &Connection,
        existing: Option<&'t mut TransactionHandle>,
    ) -> Result<TxScope<'t>> {
        if let Some(handle) = existing {
            return Ok(TxScope::Borrowed(handle));
        }
        let client = connection.client().await?;
        let handle = if connection.transactions_enabled() {
            TransactionHandle::begin(client).await?
        } else {
            TransactionHandle::passthrough(client)
        };
        Ok(TxScope::Owned(handle))
    }

    /// Reuse `existing` or check out a plain client; reads never BEGIN.
    pub async fn read(
        connection: &Connection,
        existing: Option<&'t mut TransactionHandle>,
    ) -> Result<TxScope<'t>> {
        match existing {
            Some(handle) => Ok(TxScope::Borrowed(handle)),
            None => Ok(TxScope::Owned(TransactionHandle::passthrough(
                connection.client().await?,
            ))),
        }
    }

    pub fn client(&self) -> Result<&Client> {
        match self {
            TxScope::Borrowed(handle) => handle.client(),
            TxScope::Owned(handle) => handle.client(),
        }
    }

    pub fn is_owned(&self) -> bool {
        matches!(self, TxScope::Owned(_))
    }

    /// Commit an owned transaction on success, roll it back on failure.
    /// Borrowed transactions are left to their owner. A failed rollback is
    /// logged and the original error is returned.
    pub async fn finish<T>(self, result: Result<T>) -> Result<T> {
        let TxScope::Owned(handle) = self else {
            return result;
        };
        match result {
            Ok(value) => {
                handle.commit().await?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = handle.rollback().await {
                    warn!(error = %rollback_err, original = %err, "rollback failed");
                }
                Err(err)
            }
        }
    }
}
