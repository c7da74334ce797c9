//! Cancellation contexts
//!
//! A [`Context`] carries a cancellation flag and an optional deadline. Contexts
//! form a tree: a child is done as soon as any ancestor is, but cancelling a
//! child leaves its parent untouched.
//!
//! Store operations take a `&Context` and are expected to fail promptly once it
//! is done, either by checking [`Context::err`] up front or by racing their
//! work against it with [`Context::run`].

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

/// Why a context is done
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ContextError {
    #[error("context cancelled")]
    Cancelled,
    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

#[derive(Clone)]
pub struct Context {
    inner: Arc<Inner>,
}

struct Inner {
    cancelled: watch::Sender<bool>,
    // Already clamped to the parent's deadline
    deadline: Option<Instant>,
    // Live descendants one level down; cancel cascades through them
    children: Mutex<Vec<Weak<Inner>>>,
    // Keeps ancestors alive for as long as a descendant is
    _parent: Option<Arc<Inner>>,
}

impl Inner {
    fn children(&self) -> MutexGuard<'_, Vec<Weak<Inner>>> {
        self.children
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn cancel(&self) {
        if self.cancelled.send_replace(true) {
            return;
        }
        let children: Vec<Arc<Inner>> = self
            .children()
            .drain(..)
            .filter_map(|child| child.upgrade())
            .collect();
        for child in children {
            child.cancel();
        }
    }
}

impl Context {
    /// A root context that is never cancelled and has no deadline.
    pub fn background() -> Self {
        let (cancelled, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                cancelled,
                deadline: None,
                children: Mutex::new(Vec::new()),
                _parent: None,
            }),
        }
    }

    /// Derive a context that is done when `self` is, and can be cancelled on its own.
    pub fn child(&self) -> Self {
        self.derive(self.inner.deadline)
    }

    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Derive a context with a deadline. The parent's deadline still applies
    /// if it is earlier.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.inner.deadline {
            Some(parent) => parent.min(deadline),
            None => deadline,
        };
        self.derive(Some(deadline))
    }

    fn derive(&self, deadline: Option<Instant>) -> Self {
        // Registration and the parent's flag are checked under the same lock
        // that cancel takes, so a concurrent cancel is never missed.
        let mut children = self.inner.children();
        let (cancelled, _) = watch::channel(*self.inner.cancelled.borrow());
        let inner = Arc::new(Inner {
            cancelled,
            deadline,
            children: Mutex::new(Vec::new()),
            _parent: Some(self.inner.clone()),
        });
        children.retain(|c| c.strong_count() > 0);
        children.push(Arc::downgrade(&inner));
        Self { inner }
    }

    /// Cancel this context and every context derived from it.
    pub fn cancel(&self) {
        self.inner.cancel();
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }

    /// `None` while the context is live. Cancellation wins over an expired deadline.
    pub fn err(&self) -> Option<ContextError> {
        if *self.inner.cancelled.borrow() {
            return Some(ContextError::Cancelled);
        }
        match self.inner.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(ContextError::DeadlineExceeded),
            _ => None,
        }
    }

    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// Resolves once the context is done.
    pub async fn done(&self) -> ContextError {
        if let Some(err) = self.err() {
            return err;
        }

        let mut rx = self.inner.cancelled.subscribe();
        let cancelled = async move {
            loop {
                let cancelled = *rx.borrow_and_update();
                if cancelled {
                    return;
                }
                if rx.changed().await.is_err() {
                    // Unreachable while `self` holds the sender
                    return std::future::pending().await;
                }
            }
        };
        match self.inner.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = cancelled => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => cancelled.await,
        }
        self.err().unwrap_or(ContextError::Cancelled)
    }

    /// Drive `fut` to completion unless the context is done first, in which
    /// case `fut` is dropped.
    pub async fn run<F>(&self, fut: F) -> Result<F::Output, ContextError>
    where
        F: Future,
    {
        if let Some(err) = self.err() {
            return Err(err);
        }
        tokio::select! {
            biased;
            err = self.done() => Err(err),
            out = fut => Ok(out),
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("deadline", &self.inner.deadline)
            .field("err", &self.err())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn background_is_never_done() {
        let ctx = Context::background();
        assert_eq!(ctx.err(), None);
        assert_eq!(ctx.deadline(), None);
    }

    #[test]
    fn cancel_reaches_children_but_not_parents() {
        let parent = Context::background();
        let child = parent.child();
        let grandchild = child.child();

        child.cancel();
        assert_eq!(parent.err(), None);
        assert_eq!(child.err(), Some(ContextError::Cancelled));
        assert_eq!(grandchild.err(), Some(ContextError::Cancelled));

        let sibling = parent.child();
        parent.cancel();
        assert_eq!(sibling.err(), Some(ContextError::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_expires() {
        let ctx = Context::background().with_timeout(Duration::from_secs(5));
        assert!(!ctx.is_done());

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(ctx.err(), Some(ContextError::DeadlineExceeded));
    }

    #[tokio::test(start_paused = true)]
    async fn child_keeps_earlier_parent_deadline() {
        let parent = Context::background().with_timeout(Duration::from_secs(1));
        let child = parent.with_timeout(Duration::from_secs(60));
        assert_eq!(child.deadline(), parent.deadline());

        let tighter = parent.with_timeout(Duration::from_millis(10));
        assert!(tighter.deadline() < parent.deadline());
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_wins_over_deadline() {
        let ctx = Context::background().with_timeout(Duration::from_millis(1));
        tokio::time::advance(Duration::from_millis(5)).await;
        ctx.cancel();
        assert_eq!(ctx.err(), Some(ContextError::Cancelled));
    }

    #[tokio::test]
    async fn done_wakes_on_parent_cancel() {
        let parent = Context::background();
        let child = parent.child();

        let waiter = tokio::spawn(async move { child.done().await });
        tokio::task::yield_now().await;
        parent.cancel();

        assert_eq!(waiter.await.unwrap(), ContextError::Cancelled);
    }

    #[test]
    fn child_of_cancelled_context_starts_cancelled() {
        let parent = Context::background();
        parent.cancel();
        assert_eq!(parent.child().err(), Some(ContextError::Cancelled));
    }

    #[test]
    fn cancel_cascades_through_deep_chains() {
        let root = Context::background();
        let mut leaf = root.child();
        for _ in 0..64 {
            leaf = leaf.child();
        }
        root.cancel();
        assert_eq!(leaf.err(), Some(ContextError::Cancelled));
    }

    #[test]
    fn dropped_children_are_pruned() {
        let parent = Context::background();
        for _ in 0..10 {
            drop(parent.child());
        }
        let _live = parent.child();
        assert_eq!(parent.inner.children().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn run_gives_up_at_deadline() {
        let ctx = Context::background().with_timeout(Duration::from_secs(2));
        let result = ctx.run(std::future::pending::<()>()).await;
        assert_eq!(result, Err(ContextError::DeadlineExceeded));
    }

    #[tokio::test]
    async fn run_refuses_done_context() {
        let ctx = Context::background();
        ctx.cancel();
        let result = ctx.run(async { 42 }).await;
        assert_eq!(result, Err(ContextError::Cancelled));
    }

    #[tokio::test]
    async fn run_returns_output_when_live() {
        let ctx = Context::background();
        assert_eq!(ctx.run(async { 42 }).await, Ok(42));
    }
}
