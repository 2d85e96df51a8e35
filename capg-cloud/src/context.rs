//! Cancellation and deadline context passed to every reconciler call.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{CloudError, Result};

/// Per-pass context: a cancellation token plus an optional deadline.
///
/// Cloning shares the token, so cancelling any clone cancels them all.
#[derive(Debug, Clone, Default)]
pub struct Context {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context driven by an existing token, e.g. a process-wide shutdown token.
    pub fn with_token(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    /// Same token, with a deadline `timeout` from now.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        Self {
            token: self.token.clone(),
            deadline: Some(Instant::now() + timeout),
        }
    }

    /// Child context: cancelled when the parent is, but cancelling it does not
    /// affect the parent.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Run a backend call, aborting it when the context is cancelled or its
    /// deadline passes.
    ///
    /// The dropped future is never polled again, so an aborted call reports
    /// `Cancelled`/`DeadlineExceeded` and never a partial success.
    pub async fn run<T, F>(&self, call: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if self.token.is_cancelled() {
            return Err(CloudError::Cancelled);
        }

        let deadline = self.deadline;
        let expired = async move {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(CloudError::Cancelled),
            _ = expired => Err(CloudError::DeadlineExceeded),
            res = call => res,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_passes_through_result() {
        let ctx = Context::new();
        let res = ctx.run(async { Ok::<_, CloudError>(42) }).await;
        assert_eq!(res, Ok(42));
    }

    #[tokio::test]
    async fn test_cancelled_before_call() {
        let ctx = Context::new();
        ctx.cancel();
        let res = ctx
            .run(async { Ok::<_, CloudError>("should not run") })
            .await;
        assert_eq!(res, Err(CloudError::Cancelled));
    }

    #[tokio::test]
    async fn test_cancel_aborts_pending_call() {
        let ctx = Context::new();
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });

        let res = ctx
            .run(async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok::<_, CloudError>(())
            })
            .await;
        assert_eq!(res, Err(CloudError::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_exceeded() {
        let ctx = Context::new().with_timeout(Duration::from_secs(1));
        let res = ctx
            .run(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, CloudError>(())
            })
            .await;
        assert_eq!(res, Err(CloudError::DeadlineExceeded));
    }

    #[test]
    fn test_child_does_not_cancel_parent() {
        let parent = Context::new();
        let child = parent.child();
        child.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());

        let other = parent.child();
        parent.cancel();
        assert!(other.is_cancelled());
    }
}
