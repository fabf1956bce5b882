//! Per-request retry and failover state
//!
//! A [`RetryContext`] is created for every proxied request and replaced by a
//! new value after each transport error. It is never shared between requests.

use std::time::Duration;

/// Retries against one backend before moving on to the next one
pub const RETRY_WITH_SAME_BACKEND_TIMES: u32 = 1;

/// Delay before re-issuing a request against the same backend
pub const RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// Position of one client request in the upstream failover sequence
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryContext {
    backend_index: usize,
    same_backend_retries: u32,
}

/// What to do after a transport error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStep {
    /// Wait for the backoff, then re-issue against the same backend
    RetrySame(RetryContext),
    /// Move on to the next backend
    Failover(RetryContext),
    /// Every backend has used its budget
    Exhausted,
}

impl RetryContext {
    /// Context positioned at the given backend with a fresh retry budget
    pub fn at(backend_index: usize) -> Self {
        Self {
            backend_index,
            same_backend_retries: 0,
        }
    }

    pub fn backend_index(&self) -> usize {
        self.backend_index
    }

    pub fn same_backend_retries(&self) -> u32 {
        self.same_backend_retries
    }

    /// Derive the next step after a transport error on the current backend.
    ///
    /// `budget` is the number of retries allowed on one backend before
    /// failing over. The backend index only ever moves forward.
    pub fn after_transport_error(&self, backend_count: usize, budget: u32) -> RetryStep {
        if self.same_backend_retries < budget {
            return RetryStep::RetrySame(Self {
                backend_index: self.backend_index,
                same_backend_retries: self.same_backend_retries + 1,
            });
        }

        let next = self.backend_index + 1;
        if next >= backend_count {
            RetryStep::Exhausted
        } else {
            RetryStep::Failover(Self::at(next))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_context() {
        let ctx = RetryContext::default();
        assert_eq!(ctx.backend_index(), 0);
        assert_eq!(ctx.same_backend_retries(), 0);
    }

    #[test]
    fn test_first_failure_retries_same_backend() {
        let ctx = RetryContext::default();
        let step = ctx.after_transport_error(2, RETRY_WITH_SAME_BACKEND_TIMES);

        match step {
            RetryStep::RetrySame(next) => {
                assert_eq!(next.backend_index(), 0);
                assert_eq!(next.same_backend_retries(), 1);
            }
            other => panic!("expected RetrySame, got {:?}", other),
        }
        // The original value is untouched
        assert_eq!(ctx.same_backend_retries(), 0);
    }

    #[test]
    fn test_second_failure_fails_over_and_resets() {
        let ctx = RetryContext::default();
        let RetryStep::RetrySame(retried) = ctx.after_transport_error(2, 1) else {
            panic!("expected retry");
        };

        match retried.after_transport_error(2, 1) {
            RetryStep::Failover(next) => {
                assert_eq!(next.backend_index(), 1);
                assert_eq!(next.same_backend_retries(), 0);
            }
            other => panic!("expected Failover, got {:?}", other),
        }
    }

    #[test]
    fn test_exhausted_on_last_backend() {
        let ctx = RetryContext::default();
        let RetryStep::RetrySame(retried) = ctx.after_transport_error(1, 1) else {
            panic!("expected retry");
        };
        assert_eq!(retried.after_transport_error(1, 1), RetryStep::Exhausted);
    }

    #[test]
    fn test_zero_budget_fails_over_immediately() {
        let ctx = RetryContext::at(0);
        assert_eq!(
            ctx.after_transport_error(3, 0),
            RetryStep::Failover(RetryContext::at(1))
        );
    }

    #[test]
    fn test_full_sequence_visits_each_backend_twice() {
        let mut ctx = RetryContext::default();
        let mut visited = vec![ctx.backend_index()];

        loop {
            match ctx.after_transport_error(3, RETRY_WITH_SAME_BACKEND_TIMES) {
                RetryStep::RetrySame(next) | RetryStep::Failover(next) => {
                    assert!(next.backend_index() >= ctx.backend_index());
                    ctx = next;
                    visited.push(ctx.backend_index());
                }
                RetryStep::Exhausted => break,
            }
        }

        assert_eq!(visited, vec![0, 0, 1, 1, 2, 2]);
    }
}
