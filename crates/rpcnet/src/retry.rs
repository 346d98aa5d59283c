//! Retry classification for invocations
//!
//! Only local errors are ever retried, and a request that may already have
//! reached the server is retried only when doing so cannot violate
//! at-most-once semantics.

use std::time::Duration;

use tracing::debug;

use crate::error::{LocalError, RpcError};
use crate::properties::Properties;
use crate::trace::{TraceLevels, RETRY_CATEGORY};

/// Operation mode as declared by the interface
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum OperationMode {
    #[default]
    Normal,
    Nonmutating,
    Idempotent,
}

impl OperationMode {
    pub fn to_u8(self) -> u8 {
        match self {
            OperationMode::Normal => 0,
            OperationMode::Nonmutating => 1,
            OperationMode::Idempotent => 2,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(OperationMode::Normal),
            1 => Some(OperationMode::Nonmutating),
            2 => Some(OperationMode::Idempotent),
            _ => None,
        }
    }

    /// Nonmutating and idempotent operations may safely run twice
    pub fn is_idempotent(self) -> bool {
        !matches!(self, OperationMode::Normal)
    }
}

/// What the invocation path knows about a failed attempt
#[derive(Debug, Clone, Copy)]
pub struct RetryContext {
    /// The request may have been written to the connection
    pub sent: bool,
    pub mode: OperationMode,
    /// The proxy resolves its endpoints through a locator
    pub indirect: bool,
}

/// Retry intervals read from `Rpc.RetryIntervals`
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    intervals: Vec<Duration>,
    traces: TraceLevels,
}

impl RetryPolicy {
    pub fn new(intervals: Vec<Duration>) -> Self {
        Self {
            intervals,
            traces: TraceLevels::default(),
        }
    }

    /// A policy that never retries
    pub fn disabled() -> Self {
        Self::new(Vec::new())
    }

    /// Parse `Rpc.RetryIntervals`. Unset means a single immediate retry; a
    /// leading `-1` disables retries. Malformed or negative values count as 0.
    pub fn from_properties(props: &Properties, traces: TraceLevels) -> Self {
        let values = props.get_property_as_list("Rpc.RetryIntervals");
        let mut intervals = Vec::new();
        if values.is_empty() {
            intervals.push(Duration::ZERO);
        }
        for (i, value) in values.iter().enumerate() {
            let ms = value.parse::<i64>().unwrap_or(0);
            if i == 0 && ms == -1 {
                break;
            }
            intervals.push(Duration::from_millis(ms.max(0) as u64));
        }
        Self { intervals, traces }
    }

    pub fn intervals(&self) -> &[Duration] {
        &self.intervals
    }

    /// Whether an error could be retried at all, ignoring the attempt budget
    pub fn is_retryable(err: &RpcError, ctx: &RetryContext) -> bool {
        let local = match err {
            RpcError::User(_) => return false,
            RpcError::Local(local) => local,
        };

        match local {
            LocalError::ObjectNotExist { .. } => return ctx.indirect,
            LocalError::FacetNotExist { .. }
            | LocalError::OperationNotExist { .. }
            | LocalError::UnknownLocal(_)
            | LocalError::UnknownUser(_)
            | LocalError::Unknown(_)
            | LocalError::Marshal(_)
            | LocalError::CommunicatorDestroyed
            | LocalError::ObjectAdapterDeactivated(_)
            | LocalError::ConnectionManuallyClosed { .. }
            | LocalError::InvocationTimeout
            | LocalError::InvocationCanceled => return false,
            _ => {}
        }

        !ctx.sent || ctx.mode.is_idempotent() || matches!(local, LocalError::CloseConnection)
    }

    /// Decide whether attempt number `attempt` (1-based) should be retried.
    ///
    /// Returns the delay before the next attempt, or `None` when the caller
    /// must surface the error.
    pub fn check_retry(&self, err: &RpcError, ctx: &RetryContext, attempt: usize) -> Option<Duration> {
        if !Self::is_retryable(err, ctx) {
            return None;
        }

        let interval = *self.intervals.get(attempt.checked_sub(1)?)?;
        if self.traces.retry >= 1 {
            debug!(
                target: RETRY_CATEGORY,
                "retrying operation call in {}ms because of exception\n{}",
                interval.as_millis(),
                err
            );
        }
        Some(interval)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(vec![Duration::ZERO])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::UserError;

    fn ctx(sent: bool, mode: OperationMode) -> RetryContext {
        RetryContext {
            sent,
            mode,
            indirect: false,
        }
    }

    #[test]
    fn test_intervals_from_properties() {
        let props = Properties::new();
        let policy = RetryPolicy::from_properties(&props, TraceLevels::default());
        assert_eq!(policy.intervals(), &[Duration::ZERO]);

        props.set_property("Rpc.RetryIntervals", "0 100 bogus -5");
        let policy = RetryPolicy::from_properties(&props, TraceLevels::default());
        assert_eq!(
            policy.intervals(),
            &[
                Duration::ZERO,
                Duration::from_millis(100),
                Duration::ZERO,
                Duration::ZERO
            ]
        );

        props.set_property("Rpc.RetryIntervals", "-1");
        let policy = RetryPolicy::from_properties(&props, TraceLevels::default());
        assert!(policy.intervals().is_empty());
    }

    #[test]
    fn test_unsent_requests_are_retried() {
        let policy = RetryPolicy::new(vec![Duration::from_millis(10)]);
        let err = RpcError::from(LocalError::ConnectionRefused("x".into()));
        assert_eq!(
            policy.check_retry(&err, &ctx(false, OperationMode::Normal), 1),
            Some(Duration::from_millis(10))
        );
        // Budget exhausted
        assert_eq!(policy.check_retry(&err, &ctx(false, OperationMode::Normal), 2), None);
    }

    #[test]
    fn test_sent_requests_need_idempotence() {
        let policy = RetryPolicy::default();
        let lost = RpcError::from(LocalError::ConnectionLost("reset".into()));
        assert_eq!(policy.check_retry(&lost, &ctx(true, OperationMode::Normal), 1), None);
        assert!(policy
            .check_retry(&lost, &ctx(true, OperationMode::Idempotent), 1)
            .is_some());
        assert!(policy
            .check_retry(&lost, &ctx(true, OperationMode::Nonmutating), 1)
            .is_some());

        let closed = RpcError::from(LocalError::CloseConnection);
        assert!(policy
            .check_retry(&closed, &ctx(true, OperationMode::Normal), 1)
            .is_some());
    }

    #[test]
    fn test_never_retried() {
        let policy = RetryPolicy::default();
        let unsent = ctx(false, OperationMode::Idempotent);
        for err in [
            LocalError::Marshal("bad".into()),
            LocalError::CommunicatorDestroyed,
            LocalError::ObjectAdapterDeactivated("a".into()),
            LocalError::ConnectionManuallyClosed { graceful: true },
            LocalError::InvocationTimeout,
            LocalError::InvocationCanceled,
        ] {
            assert_eq!(policy.check_retry(&err.into(), &unsent, 1), None);
        }

        let user = RpcError::from(UserError::new("::Demo::E", bytes::Bytes::new()));
        assert_eq!(policy.check_retry(&user, &unsent, 1), None);
    }

    #[test]
    fn test_object_not_exist_only_for_indirect() {
        let policy = RetryPolicy::default();
        let err = RpcError::from(LocalError::ObjectNotExist {
            identity: "x".into(),
            facet: String::new(),
            operation: "op".into(),
        });
        let mut c = ctx(true, OperationMode::Normal);
        assert_eq!(policy.check_retry(&err, &c, 1), None);
        c.indirect = true;
        assert!(policy.check_retry(&err, &c, 1).is_some());
    }

    #[test]
    fn test_disabled() {
        let policy = RetryPolicy::disabled();
        let err = RpcError::from(LocalError::ConnectTimeout);
        assert_eq!(policy.check_retry(&err, &ctx(false, OperationMode::Normal), 1), None);
    }
}
