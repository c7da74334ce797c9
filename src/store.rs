//! The transactional store abstraction
//!
//! [`run`](crate::run) only needs a way to begin a transaction and to finish
//! it. Anything that can do that, a sqlx pool or an in-memory fake, implements
//! [`TransactionalStore`].

use std::fmt;
use std::future::Future;

use crate::context::Context;

pub trait TransactionalStore: Sync {
    type Tx: StoreTransaction<Error = Self::Error>;
    type Error: std::error::Error + Send + Sync + 'static;

    /// Open a transaction whose lifetime is tied to `ctx`.
    ///
    /// Must fail without side effects if `ctx` is already done.
    fn begin(
        &self,
        ctx: &Context,
        opts: &TxOptions,
    ) -> impl Future<Output = Result<Self::Tx, Self::Error>> + Send;
}

/// An open transaction. `commit` and `rollback` consume the handle, so a
/// transaction is finished at most once.
pub trait StoreTransaction: Send + Sized {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Execute a statement inside the transaction, returning the number of
    /// rows affected. Fails promptly once the begin context is done.
    fn execute(&mut self, sql: &str) -> impl Future<Output = Result<u64, Self::Error>> + Send;

    fn commit(self) -> impl Future<Output = Result<(), Self::Error>> + Send;

    fn rollback(self) -> impl Future<Output = Result<(), Self::Error>> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    pub fn as_sql(&self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

/// Options applied when a transaction begins. The default leaves the
/// database's own defaults in place.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxOptions {
    pub isolation: Option<IsolationLevel>,
    pub read_only: bool,
}

impl TxOptions {
    pub fn isolation(mut self, level: IsolationLevel) -> Self {
        self.isolation = Some(level);
        self
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// The `SET TRANSACTION` statement for these options, if any are set.
    pub fn sql(&self) -> Option<String> {
        let mut modes = Vec::new();
        if let Some(level) = self.isolation {
            modes.push(format!("ISOLATION LEVEL {}", level));
        }
        if self.read_only {
            modes.push("READ ONLY".to_string());
        }

        if modes.is_empty() {
            None
        } else {
            Some(format!("SET TRANSACTION {}", modes.join(", ")))
        }
    }
}
