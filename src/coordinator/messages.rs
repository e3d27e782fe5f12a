//! Command protocol between coordinator handles and the command loop

use thiserror::Error;
use tokio::sync::oneshot;

/// Errors surfaced by the coordinator itself, never by user tasks.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CoordinatorError {
    /// The command loop is gone; no further runs can be served.
    #[error("coordinator command loop is no longer running")]
    Closed,
}

/// Snapshot of coordinator state and counters for introspection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoordinatorMetrics {
    /// Monotonic dependency version; bumped on every successful refresh.
    pub version: u64,
    /// Whether a refresh is currently in flight.
    pub is_refreshing: bool,
    /// Whether a dependency value is currently stored.
    pub has_dependency: bool,
    /// Calls parked behind the in-flight refresh.
    pub waiter_count: usize,
    /// Attempt counter of the in-flight refresh; 0 when idle.
    pub refresh_attempt: u32,
    /// Tasks handed a dependency snapshot.
    pub tasks_dispatched: u64,
    /// Calls parked because a refresh was in flight on arrival.
    pub tasks_parked: u64,
    /// Stale reports answered with a plain re-attempt instead of a refresh.
    pub tasks_retried: u64,
    pub refreshes_started: u64,
    pub refreshes_succeeded: u64,
    pub refreshes_failed: u64,
    pub refreshes_cancelled: u64,
}

/// Requests processed by the command loop.
pub(crate) enum Command<D, E> {
    /// A `run` call wants a dependency snapshot or a parking spot.
    Enter {
        reply: oneshot::Sender<EnterDirective<D, E>>,
    },

    /// A task attempt finished with a terminal outcome.
    Settle { reply: oneshot::Sender<()> },

    /// A task attempt declared its snapshot stale.
    Stale {
        snapshot: D,
        version: u64,
        reply: oneshot::Sender<StaleVerdict<E>>,
    },

    /// Replace the stored dependency without refreshing.
    SetDependency {
        dependency: Option<D>,
        reply: oneshot::Sender<()>,
    },

    /// Read the stored dependency.
    GetDependency {
        reply: oneshot::Sender<Option<D>>,
    },

    /// Read the introspection snapshot.
    GetMetrics {
        reply: oneshot::Sender<CoordinatorMetrics>,
    },
}

/// Reply to [`Command::Enter`].
pub(crate) enum EnterDirective<D, E> {
    /// Run the task against this snapshot.
    Attempt { dependency: D, version: u64 },

    /// A refresh is in flight (or was just triggered by this very call);
    /// await resumption.
    Parked(oneshot::Receiver<Resumption<E>>),
}

/// Reply to [`Command::Stale`].
pub(crate) enum StaleVerdict<E> {
    /// The snapshot was already outdated or a refresh is in flight; loop
    /// back without triggering anything.
    Reattempt,

    /// This call triggered the refresh; await resumption as its originator.
    Parked(oneshot::Receiver<Resumption<E>>),
}

/// Payload delivered to a parked call when the in-flight refresh resolves.
///
/// The origin flag travels in the payload rather than being derived from
/// state: the originator's channel is loaded with `origin: true`, waiter
/// channels with `origin: false`.
pub(crate) enum Resumption<E> {
    /// Refresh succeeded; re-enter from the top.
    Retry,

    /// Refresh failed; surface the error.
    Failed { error: E, origin: bool },

    /// Refresh was cancelled.
    Cancelled { origin: bool },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coordinator_error_display() {
        assert_eq!(
            CoordinatorError::Closed.to_string(),
            "coordinator command loop is no longer running"
        );
    }

    #[test]
    fn test_metrics_default_is_zeroed() {
        let metrics = CoordinatorMetrics::default();
        assert_eq!(metrics.version, 0);
        assert!(!metrics.is_refreshing);
        assert!(!metrics.has_dependency);
        assert_eq!(metrics.waiter_count, 0);
        assert_eq!(metrics.refreshes_started, 0);
    }
}
