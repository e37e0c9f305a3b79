//! Cooperative cancellation.
//!
//! Every component that can be asked to stop owns a [`CancelToken`]. Tokens form a tree: a
//! session's token is a child of the token belonging to the pool or registry that created
//! it, so stopping the pool is observed by every in-flight transfer without the pool having
//! to know about individual sessions.
//!
//! Cancellation never preempts anything. Code doing blocking work checks
//! [`CancelToken::is_cancelled`] whenever it gets control back.
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

#[derive(Debug, Default)]
struct Inner {
    cancelled: AtomicBool,
    parent: Option<CancelToken>,
}

/// Shared, clonable stop flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a token that is cancelled whenever `self` (or any of its ancestors) is.
    /// Cancelling the child leaves the parent untouched.
    pub fn child(&self) -> Self {
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                parent: Some(self.clone()),
            }),
        }
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        let mut token = self;
        loop {
            if token.inner.cancelled.load(Ordering::SeqCst) {
                return true;
            }
            match &token.inner.parent {
                Some(parent) => token = parent,
                None => return false,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_token_is_not_cancelled() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
    }

    #[test]
    fn clones_share_state() {
        let token = CancelToken::new();
        let other = token.clone();

        other.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn parent_cancels_children() {
        let root = CancelToken::new();
        let child = root.child();
        let grandchild = child.child();

        root.cancel();
        assert!(child.is_cancelled());
        assert!(grandchild.is_cancelled());
    }

    #[test]
    fn child_does_not_cancel_parent() {
        let root = CancelToken::new();
        let child = root.child();
        let sibling = root.child();

        child.cancel();
        assert!(child.is_cancelled());
        assert!(!root.is_cancelled());
        assert!(!sibling.is_cancelled());
    }
}
