use std::sync::Arc;

use sqlx::Sqlite;
use tokio::sync::Mutex;

use crate::{Database, Error, Result};

/// The transaction a [`Database`] currently routes its statements through.
pub(crate) type TransactionSlot = Arc<Mutex<Option<sqlx::Transaction<'static, Sqlite>>>>;

/// Transaction control.
///
/// A `Database` holds at most one open transaction. While it is open, every query
/// issued through the handle (or any of its clones) is part of it.
///
/// # Example
///
/// ```rust,ignore
/// db.begin().await?;
/// orm.table("orders").insert(order).await?;
/// orm.table("order_items").insert(item).await?;
/// db.commit().await?;
/// ```
impl Database {
    /// Starts a new transaction. Fails with a state error when one is already open.
    pub async fn begin(&self) -> Result<()> {
        let mut slot = self.tx.lock().await;
        if slot.is_some() {
            return Err(Error::state("a transaction is already open"));
        }
        *slot = Some(self.pool.begin().await?);
        log::debug!("BEGIN");
        Ok(())
    }

    /// Commits the open transaction.
    ///
    /// Persists all changes made during the transaction to the database.
    pub async fn commit(&self) -> Result<()> {
        let tx = self.tx.lock().await.take().ok_or_else(|| Error::state("no open transaction to commit"))?;
        tx.commit().await?;
        log::debug!("COMMIT");
        Ok(())
    }

    /// Rolls back the open transaction.
    ///
    /// Reverts all changes made during the transaction.
    pub async fn rollback(&self) -> Result<()> {
        let tx = self.tx.lock().await.take().ok_or_else(|| Error::state("no open transaction to roll back"))?;
        tx.rollback().await?;
        log::debug!("ROLLBACK");
        Ok(())
    }

    pub async fn in_transaction(&self) -> bool {
        self.tx.lock().await.is_some()
    }

    /// Opens a transaction unless one is already open.
    ///
    /// Returns `true` when this call opened it, in which case the caller owns the
    /// commit or rollback.
    pub(crate) async fn begin_if_idle(&self) -> Result<bool> {
        let mut slot = self.tx.lock().await;
        if slot.is_some() {
            return Ok(false);
        }
        *slot = Some(self.pool.begin().await?);
        log::debug!("BEGIN");
        Ok(true)
    }

    /// Closes a transaction opened by [`Database::begin_if_idle`]: commit on success,
    /// rollback on failure. A failed rollback is logged and the original error returned.
    pub(crate) async fn finish<T>(&self, opened: bool, outcome: Result<T>) -> Result<T> {
        if !opened {
            return outcome;
        }
        match outcome {
            Ok(value) => {
                self.commit().await?;
                Ok(value)
            }
            Err(error) => {
                if let Err(rollback) = self.rollback().await {
                    log::error!("rollback failed after `{error}`: {rollback}");
                }
                Err(error)
            }
        }
    }
}
