//! In-memory transactional store
//!
//! Records every operation it sees and can be told to fail at any step. It
//! honours the context the same way [`PgStore`](crate::postgres::PgStore)
//! does, which makes it a drop-in fake for exercising code built on
//! [`run`](crate::run) without a database.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use log::debug;

use crate::context::{Context, ContextError};
use crate::store::{StoreTransaction, TransactionalStore, TxOptions};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MemoryError {
    #[error("injected failure: {0}")]
    Injected(String),
    #[error(transparent)]
    Context(#[from] ContextError),
}

/// One recorded store operation, tagged with the transaction id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    Begin(u64, TxOptions),
    Execute(u64, String),
    Commit(u64),
    Rollback(u64),
    /// Dropped without commit or rollback
    Abandoned(u64),
}

#[derive(Default)]
struct State {
    ops: Vec<Op>,
    committed: Vec<String>,
    next_id: u64,
    execute_delay: Option<Duration>,
    fail_begin: Option<String>,
    fail_execute: Option<String>,
    fail_commit: Option<String>,
    fail_rollback: Option<String>,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn record(&self, op: Op) {
        self.state().ops.push(op);
    }

    pub fn fail_begin(&self, reason: &str) {
        self.state().fail_begin = Some(reason.to_string());
    }

    pub fn fail_execute(&self, reason: &str) {
        self.state().fail_execute = Some(reason.to_string());
    }

    pub fn fail_commit(&self, reason: &str) {
        self.state().fail_commit = Some(reason.to_string());
    }

    pub fn fail_rollback(&self, reason: &str) {
        self.state().fail_rollback = Some(reason.to_string());
    }

    /// Make every statement take `delay` before it completes.
    pub fn set_execute_delay(&self, delay: Duration) {
        self.state().execute_delay = Some(delay);
    }

    pub fn ops(&self) -> Vec<Op> {
        self.state().ops.clone()
    }

    /// Statements from committed transactions, in commit order.
    pub fn committed(&self) -> Vec<String> {
        self.state().committed.clone()
    }

    pub fn begins(&self) -> usize {
        self.count(|op| matches!(op, Op::Begin(..)))
    }

    /// Commit attempts, successful or not.
    pub fn commits(&self) -> usize {
        self.count(|op| matches!(op, Op::Commit(_)))
    }

    pub fn rollbacks(&self) -> usize {
        self.count(|op| matches!(op, Op::Rollback(_)))
    }

    fn count(&self, pred: impl Fn(&Op) -> bool) -> usize {
        self.state().ops.iter().filter(|op| pred(op)).count()
    }
}

impl TransactionalStore for MemoryStore {
    type Tx = MemoryTx;
    type Error = MemoryError;

    async fn begin(&self, ctx: &Context, opts: &TxOptions) -> Result<MemoryTx, MemoryError> {
        if let Some(err) = ctx.err() {
            return Err(err.into());
        }

        let id = {
            let mut state = self.state();
            if let Some(reason) = &state.fail_begin {
                return Err(MemoryError::Injected(reason.clone()));
            }
            state.next_id += 1;
            let id = state.next_id;
            state.ops.push(Op::Begin(id, *opts));
            id
        };
        debug!("memory tx {} began", id);

        Ok(MemoryTx {
            id,
            store: self.clone(),
            ctx: ctx.clone(),
            pending: Vec::new(),
            finished: false,
        })
    }
}

pub struct MemoryTx {
    id: u64,
    store: MemoryStore,
    ctx: Context,
    pending: Vec<String>,
    finished: bool,
}

impl MemoryTx {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Statements executed so far and not yet committed.
    pub fn pending(&self) -> &[String] {
        &self.pending
    }
}

impl StoreTransaction for MemoryTx {
    type Error = MemoryError;

    async fn execute(&mut self, sql: &str) -> Result<u64, MemoryError> {
        let (delay, failure) = {
            let state = self.store.state();
            (state.execute_delay, state.fail_execute.clone())
        };

        match delay {
            Some(delay) => self.ctx.run(tokio::time::sleep(delay)).await?,
            None => {
                if let Some(err) = self.ctx.err() {
                    return Err(err.into());
                }
            }
        }
        if let Some(reason) = failure {
            return Err(MemoryError::Injected(reason));
        }

        self.store.record(Op::Execute(self.id, sql.to_string()));
        self.pending.push(sql.to_string());
        Ok(1)
    }

    async fn commit(mut self) -> Result<(), MemoryError> {
        self.finished = true;

        if let Some(err) = self.ctx.err() {
            debug!("memory tx {} rolled back: {}", self.id, err);
            self.store.record(Op::Rollback(self.id));
            return Err(err.into());
        }

        let mut state = self.store.state();
        state.ops.push(Op::Commit(self.id));
        if let Some(reason) = &state.fail_commit {
            return Err(MemoryError::Injected(reason.clone()));
        }
        state.committed.append(&mut self.pending);
        debug!("memory tx {} committed", self.id);
        Ok(())
    }

    async fn rollback(mut self) -> Result<(), MemoryError> {
        self.finished = true;
        self.pending.clear();

        let mut state = self.store.state();
        state.ops.push(Op::Rollback(self.id));
        if let Some(reason) = &state.fail_rollback {
            return Err(MemoryError::Injected(reason.clone()));
        }
        debug!("memory tx {} rolled back", self.id);
        Ok(())
    }
}

impl Drop for MemoryTx {
    fn drop(&mut self) {
        if !self.finished {
            self.store.record(Op::Abandoned(self.id));
        }
    }
}
