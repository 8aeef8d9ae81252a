use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{FsError, FsResult};

/// Cooperative cancellation flag with an optional deadline.
///
/// Cloning shares the flag. [`CancelToken::child`] creates a token that is
/// cancelled when its parent is, but can also be cancelled (or time out) on
/// its own without affecting the parent. The assembler hands one child to
/// each source so a hung download only fails that source.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    parent: Option<Arc<CancelToken>>,
    deadline: Option<Instant>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// A root token that expires after `timeout`.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: Some(Instant::now() + timeout),
            ..Self::default()
        }
    }

    /// A token tied to this one, optionally with a tighter deadline.
    pub fn child(&self, timeout: Option<Duration>) -> Self {
        let own = timeout.map(|t| Instant::now() + t);
        let deadline = match (self.deadline, own) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            parent: Some(Arc::new(self.clone())),
            deadline,
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
            || self.parent.as_ref().is_some_and(|p| p.is_cancelled())
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline; `None` when there is no deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// `Err` if the token was cancelled or its deadline has passed.
    pub fn check(&self) -> FsResult<()> {
        if self.is_cancelled() {
            return Err(FsError::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(FsError::TimedOut),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_token_passes() {
        assert!(CancelToken::new().check().is_ok());
    }

    #[test]
    fn cancel_is_shared_between_clones() {
        let token = CancelToken::new();
        let clone = token.clone();
        token.cancel();
        assert!(matches!(clone.check(), Err(FsError::Cancelled)));
    }

    #[test]
    fn parent_cancel_reaches_child() {
        let parent = CancelToken::new();
        let child = parent.child(None);
        parent.cancel();
        assert!(child.is_cancelled());
    }

    #[test]
    fn child_cancel_does_not_reach_parent() {
        let parent = CancelToken::new();
        let child = parent.child(None);
        child.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());
    }

    #[test]
    fn expired_deadline_times_out() {
        let token = CancelToken::with_timeout(Duration::ZERO);
        assert!(matches!(token.check(), Err(FsError::TimedOut)));
    }

    #[test]
    fn child_takes_tighter_deadline() {
        let parent = CancelToken::with_timeout(Duration::from_secs(3600));
        let child = parent.child(Some(Duration::ZERO));
        assert!(child.deadline() < parent.deadline());
        assert!(matches!(child.check(), Err(FsError::TimedOut)));
        assert!(parent.check().is_ok());
    }
}
