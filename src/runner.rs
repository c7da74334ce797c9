//! The transaction runner
//!
//! [`run`] begins a transaction, hands it to a unit of work, and finishes it:
//!
//! - the unit of work returns `Ok` → commit
//! - the unit of work returns `Err` → rollback, the error is passed through
//! - the unit of work panics → rollback, then the panic resumes unchanged
//!
//! Rollback failures are discarded so they never shadow the original cause.

use std::panic::{self, AssertUnwindSafe};

use futures::FutureExt;
use scoped_futures::ScopedBoxFuture;

use crate::context::Context;
use crate::store::{StoreTransaction, TransactionalStore, TxOptions};

/// The future a unit of work returns. `'t` is the borrow of the transaction,
/// `'a` bounds anything the unit of work captures from the caller.
///
/// Build one with `async move { ... }.scope_boxed()`.
pub type UnitOfWork<'a, 't, T, E> = ScopedBoxFuture<'a, 't, Result<T, E>>;

/// How [`run`] failed: the store could not begin, the unit of work returned
/// an error (passed through untouched), or the store could not commit.
#[derive(Debug, thiserror::Error)]
pub enum TxError<S, E> {
    #[error("begin transaction failed: {0}")]
    Begin(#[source] S),
    #[error(transparent)]
    UnitOfWork(E),
    #[error("commit failed: {0}")]
    Commit(#[source] S),
}

impl<S, E> TxError<S, E> {
    pub fn is_begin(&self) -> bool {
        matches!(self, TxError::Begin(_))
    }

    pub fn is_commit(&self) -> bool {
        matches!(self, TxError::Commit(_))
    }

    pub fn unit_of_work(&self) -> Option<&E> {
        match self {
            TxError::UnitOfWork(err) => Some(err),
            _ => None,
        }
    }

    /// The unit of work's own error, unchanged.
    pub fn into_unit_of_work(self) -> Option<E> {
        match self {
            TxError::UnitOfWork(err) => Some(err),
            _ => None,
        }
    }
}

/// Run `unit_of_work` in a transaction on `store` with default options.
///
/// ```ignore
/// use std::time::Duration;
///
/// use dbtx::{Context, PgStoreError, StoreTransaction};
/// use scoped_futures::ScopedFutureExt;
///
/// let ctx = Context::background().with_timeout(Duration::from_secs(5));
/// dbtx::run(&ctx, &store, |_ctx, tx| {
///     async move {
///         tx.execute("UPDATE accounts SET balance = balance - 10 WHERE id = 1").await?;
///         tx.execute("UPDATE accounts SET balance = balance + 10 WHERE id = 2").await?;
///         Ok::<_, PgStoreError>(())
///     }
///     .scope_boxed()
/// })
/// .await?;
/// ```
pub async fn run<'a, S, F, T, E>(
    ctx: &Context,
    store: &S,
    unit_of_work: F,
) -> Result<T, TxError<S::Error, E>>
where
    S: TransactionalStore,
    F: for<'t> FnOnce(&'t Context, &'t mut S::Tx) -> UnitOfWork<'a, 't, T, E> + Send + 'a,
    T: Send + 'a,
    E: Send + 'a,
{
    run_with_options(ctx, store, &TxOptions::default(), unit_of_work).await
}

/// Like [`run`], with isolation level and access mode applied at begin.
pub async fn run_with_options<'a, S, F, T, E>(
    ctx: &Context,
    store: &S,
    opts: &TxOptions,
    unit_of_work: F,
) -> Result<T, TxError<S::Error, E>>
where
    S: TransactionalStore,
    F: for<'t> FnOnce(&'t Context, &'t mut S::Tx) -> UnitOfWork<'a, 't, T, E> + Send + 'a,
    T: Send + 'a,
    E: Send + 'a,
{
    let mut tx = store.begin(ctx, opts).await.map_err(TxError::Begin)?;

    // Calling the closure inside the async block catches panics raised
    // before the unit of work's future exists, too.
    let outcome = {
        let tx = &mut tx;
        AssertUnwindSafe(async move { unit_of_work(ctx, tx).await })
            .catch_unwind()
            .await
    };

    match outcome {
        Ok(Ok(value)) => {
            tx.commit().await.map_err(TxError::Commit)?;
            Ok(value)
        }
        Ok(Err(err)) => {
            let _ = tx.rollback().await;
            Err(TxError::UnitOfWork(err))
        }
        Err(payload) => {
            let _ = tx.rollback().await;
            panic::resume_unwind(payload)
        }
    }
}
