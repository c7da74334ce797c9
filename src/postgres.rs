//! Postgres store backed by a sqlx pool
//!
//! Inside a unit of work, [`PgTx::conn`] gives access to the transaction's
//! connection, so any sqlx query can run in it:
//!
//! ```ignore
//! sqlx::query("INSERT INTO tweet_threads (user_id, title) VALUES ($1, $2)")
//!     .bind(user_id)
//!     .bind(title)
//!     .execute(&mut *tx.conn())
//!     .await?;
//! ```
//!
//! Such queries are not raced against the context; wrap them in
//! [`Context::run`] when they should be.

use log::{debug, warn};
use sqlx::postgres::{PgPoolOptions, Postgres};
use sqlx::{Executor, PgConnection, PgPool, Transaction};

use crate::config::DbConfig;
use crate::context::{Context, ContextError};
use crate::store::{StoreTransaction, TransactionalStore, TxOptions};

#[derive(Debug, thiserror::Error)]
pub enum PgStoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Context(#[from] ContextError),
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(config: &DbConfig) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect(&config.database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

impl TransactionalStore for PgStore {
    type Tx = PgTx;
    type Error = PgStoreError;

    async fn begin(&self, ctx: &Context, opts: &TxOptions) -> Result<PgTx, PgStoreError> {
        let mut tx = ctx.run(self.pool.begin()).await??;

        if let Some(stmt) = opts.sql() {
            let applied = match ctx.run((&mut *tx).execute(sqlx::raw_sql(&stmt))).await {
                Ok(result) => result.map(|_| ()).map_err(PgStoreError::from),
                Err(err) => Err(err.into()),
            };
            if let Err(err) = applied {
                warn!("Failed to apply transaction options ({}): {}", stmt, err);
                let _ = tx.rollback().await;
                return Err(err);
            }
        }

        debug!("Transaction began");
        Ok(PgTx {
            tx,
            ctx: ctx.clone(),
        })
    }
}

/// An open Postgres transaction. Dropping it unfinished rolls it back when
/// the connection returns to the pool.
pub struct PgTx {
    tx: Transaction<'static, Postgres>,
    ctx: Context,
}

impl PgTx {
    pub fn conn(&mut self) -> &mut PgConnection {
        &mut self.tx
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }
}

impl StoreTransaction for PgTx {
    type Error = PgStoreError;

    async fn execute(&mut self, sql: &str) -> Result<u64, PgStoreError> {
        let result = self
            .ctx
            .run((&mut *self.tx).execute(sqlx::raw_sql(sql)))
            .await??;
        Ok(result.rows_affected())
    }

    async fn commit(self) -> Result<(), PgStoreError> {
        if let Some(err) = self.ctx.err() {
            warn!("Refusing to commit, rolling back: {}", err);
            if let Err(e) = self.tx.rollback().await {
                warn!("Rollback error: {}", e);
            }
            return Err(err.into());
        }

        self.tx.commit().await?;
        debug!("Transaction committed");
        Ok(())
    }

    async fn rollback(self) -> Result<(), PgStoreError> {
        self.tx.rollback().await.map_err(|e| {
            warn!("Rollback error: {}", e);
            PgStoreError::from(e)
        })?;
        debug!("Transaction rolled back");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use scoped_futures::ScopedFutureExt;

    use super::*;
    use crate::runner::{TxError, run};

    fn assert_send<T: Send>(_: &T) {}

    fn lazy_store() -> PgStore {
        // Lazy pool: nothing connects unless a connection is requested.
        let pool = PgPoolOptions::new()
            .connect_lazy("postgres://localhost/unreachable")
            .unwrap();
        PgStore::from_pool(pool)
    }

    #[test]
    fn context_errors_stay_distinguishable() {
        let err = PgStoreError::from(ContextError::DeadlineExceeded);
        assert!(matches!(
            err,
            PgStoreError::Context(ContextError::DeadlineExceeded)
        ));
        assert_eq!(err.to_string(), "context deadline exceeded");
    }

    #[test]
    fn sqlx_errors_are_wrapped() {
        let err = PgStoreError::from(sqlx::Error::PoolTimedOut);
        assert!(err.to_string().starts_with("database error: "));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[tokio::test]
    async fn begin_on_cancelled_context_never_touches_the_pool() {
        let store = lazy_store();
        let ctx = Context::background();
        ctx.cancel();

        let err = store
            .begin(&ctx, &TxOptions::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, PgStoreError::Context(ContextError::Cancelled)));
        assert_eq!(store.pool().size(), 0);
    }

    #[tokio::test]
    async fn run_over_postgres_is_send() {
        let store = lazy_store();
        let ctx = Context::background();
        ctx.cancel();

        let fut = run(&ctx, &store, |_ctx, tx| {
            async move {
                tx.execute("SELECT 1").await?;
                Ok::<_, PgStoreError>(())
            }
            .scope_boxed()
        });
        assert_send(&fut);

        let err = fut.await.unwrap_err();
        assert!(matches!(
            err,
            TxError::Begin(PgStoreError::Context(ContextError::Cancelled))
        ));
        assert_eq!(store.pool().size(), 0);
    }
}
