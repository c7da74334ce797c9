//! Run a unit of work inside a database transaction.
//!
//! [`run`] begins a transaction on a [`TransactionalStore`], hands it to the
//! caller's closure, and commits if the closure succeeds. On error it rolls
//! back and returns the closure's error untouched; on panic it rolls back and
//! resumes the panic. The transaction is bound to a [`Context`], so a
//! cancelled or expired context makes the store's operations fail and the
//! transaction roll back.
//!
//! ```ignore
//! use dbtx::{Context, DbConfig, PgStore, StoreTransaction};
//! use scoped_futures::ScopedFutureExt;
//!
//! let config = DbConfig::from_env();
//! let store = PgStore::connect(&config).await?;
//!
//! dbtx::run(&config.context(), &store, |_ctx, tx| {
//!     async move {
//!         tx.execute("DELETE FROM refresh_tokens WHERE expires_at < NOW()").await?;
//!         Ok::<_, dbtx::PgStoreError>(())
//!     }
//!     .scope_boxed()
//! })
//! .await?;
//! ```

pub mod config;
pub mod context;
pub mod memory;
pub mod postgres;
pub mod runner;
pub mod store;

pub use config::DbConfig;
pub use context::{Context, ContextError};
pub use postgres::{PgStore, PgStoreError, PgTx};
pub use runner::{TxError, UnitOfWork, run, run_with_options};
pub use store::{IsolationLevel, StoreTransaction, TransactionalStore, TxOptions};
