//! Coordinator - the public handle driving the per-call state machine

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::config::CoordinatorConfig;
use super::core::{Core, run_loop};
use super::messages::{
    Command, CoordinatorError, CoordinatorMetrics, EnterDirective, Resumption, StaleVerdict,
};
use super::outcome::{FinalOutcome, TaskOutcome};
use super::refresh::Refresher;

/// Dependency-gated task coordinator.
///
/// Runs user tasks that all consume a shared refreshable dependency of type
/// `D` (an access token, a session, a lease). Tasks are handed a dependency
/// snapshot and may declare it stale; the coordinator then refreshes the
/// value exactly once regardless of how many callers are contending, and
/// re-runs each affected task against the fresh value.
///
/// The handle is cheap to clone; clones address the same state. Dropping
/// every handle shuts the coordinator down once any in-flight refresh has
/// resolved.
pub struct Coordinator<D, E> {
    tx: mpsc::Sender<Command<D, E>>,
}

impl<D, E> Clone for Coordinator<D, E> {
    fn clone(&self) -> Self {
        Self { tx: self.tx.clone() }
    }
}

impl<D, E> Coordinator<D, E>
where
    D: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    /// Create a coordinator and spawn its command loop.
    ///
    /// No refresh work starts here; the first `run` against a missing
    /// dependency triggers it.
    pub fn new(initial: Option<D>, refresher: impl Refresher<D, E> + 'static) -> Self {
        Self::with_config(CoordinatorConfig::default(), initial, refresher)
    }

    /// Create a coordinator with explicit configuration.
    pub fn with_config(
        config: CoordinatorConfig,
        initial: Option<D>,
        refresher: impl Refresher<D, E> + 'static,
    ) -> Self {
        let (tx, command_rx) = mpsc::channel(config.command_buffer);
        // Single-flight means at most one completion can ever be pending.
        let (done_tx, done_rx) = mpsc::channel(1);
        let core = Core::new(initial, Arc::new(refresher), done_tx);
        tokio::spawn(run_loop(core, command_rx, done_rx));
        Self { tx }
    }

    /// Submit one task and return its final verdict after at most one
    /// refresh-and-retry cycle.
    ///
    /// The task is handed a clone of the current dependency. It may be
    /// invoked a second time when it declares its first snapshot stale,
    /// which is why it is `FnMut` rather than `FnOnce`. The task must not
    /// call back into this coordinator.
    pub async fn run<S, T, Fut>(&self, task: T) -> Result<FinalOutcome<S, E>, CoordinatorError>
    where
        T: FnMut(D) -> Fut,
        Fut: Future<Output = TaskOutcome<S, E>>,
    {
        self.run_cancellable(task, CancellationToken::new()).await
    }

    /// Submit one task, honoring the caller's cancellation token.
    ///
    /// The token is checked at entry and again when a resumed or settled
    /// call is about to report success; a raised token yields
    /// `Cancelled { origin: true }`. A call parked behind a refresh is not
    /// unparked early: cancellation is observed when the refresh resolves.
    pub async fn run_cancellable<S, T, Fut>(
        &self,
        mut task: T,
        cancel: CancellationToken,
    ) -> Result<FinalOutcome<S, E>, CoordinatorError>
    where
        T: FnMut(D) -> Fut,
        Fut: Future<Output = TaskOutcome<S, E>>,
    {
        loop {
            if cancel.is_cancelled() {
                return Ok(FinalOutcome::Cancelled { origin: true });
            }

            let directive = self.request(|reply| Command::Enter { reply }).await?;
            let parked = match directive {
                EnterDirective::Attempt { dependency, version } => {
                    let outcome = task(dependency.clone()).await;
                    match outcome {
                        TaskOutcome::Success(value) => {
                            self.request(|reply| Command::Settle { reply }).await?;
                            if cancel.is_cancelled() {
                                return Ok(FinalOutcome::Cancelled { origin: true });
                            }
                            return Ok(FinalOutcome::Success(value));
                        }
                        TaskOutcome::Failure(error) => {
                            self.request(|reply| Command::Settle { reply }).await?;
                            return Ok(FinalOutcome::Failure { error, origin: true });
                        }
                        TaskOutcome::Cancelled { .. } => {
                            self.request(|reply| Command::Settle { reply }).await?;
                            return Ok(FinalOutcome::Cancelled { origin: true });
                        }
                        TaskOutcome::RefreshDependency => {
                            let verdict = self
                                .request(|reply| Command::Stale {
                                    snapshot: dependency,
                                    version,
                                    reply,
                                })
                                .await?;
                            match verdict {
                                StaleVerdict::Reattempt => continue,
                                StaleVerdict::Parked(resume_rx) => resume_rx,
                            }
                        }
                    }
                }
                EnterDirective::Parked(resume_rx) => resume_rx,
            };

            match parked.await.map_err(|_| CoordinatorError::Closed)? {
                Resumption::Retry => continue,
                Resumption::Failed { error, origin } => {
                    return Ok(FinalOutcome::Failure { error, origin });
                }
                Resumption::Cancelled { origin } => {
                    return Ok(FinalOutcome::Cancelled { origin });
                }
            }
        }
    }

    /// Replace the stored dependency without running a refresh.
    ///
    /// The version counter is not advanced: a task keying staleness off the
    /// version cannot distinguish an injected value from the one it
    /// replaced. `None` clears the value, so the next `run` triggers a
    /// refresh.
    pub async fn set_dependency(&self, dependency: Option<D>) -> Result<(), CoordinatorError> {
        self.request(|reply| Command::SetDependency { dependency, reply }).await
    }

    /// Current dependency value, if any.
    pub async fn dependency(&self) -> Result<Option<D>, CoordinatorError> {
        self.request(|reply| Command::GetDependency { reply }).await
    }

    /// Snapshot of coordinator state and counters.
    pub async fn metrics(&self) -> Result<CoordinatorMetrics, CoordinatorError> {
        self.request(|reply| Command::GetMetrics { reply }).await
    }

    /// Send a command and await its reply.
    async fn request<R>(
        &self,
        build: impl FnOnce(oneshot::Sender<R>) -> Command<D, E>,
    ) -> Result<R, CoordinatorError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| CoordinatorError::Closed)?;
        reply_rx.await.map_err(|_| CoordinatorError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::super::outcome::RefreshOutcome;
    use super::super::refresh::{RefreshContext, refresh_fn};
    use super::*;

    fn counting_refresher() -> impl Refresher<u32, String> + 'static {
        refresh_fn(|ctx: RefreshContext<u32>| async move {
            let next = match ctx.reason.prior_dependency() {
                Some(prior) => prior + 1,
                None => 1,
            };
            RefreshOutcome::<u32, String>::Success(next)
        })
    }

    #[tokio::test]
    async fn test_run_refreshes_missing_dependency_then_succeeds() {
        let coordinator = Coordinator::new(None, counting_refresher());

        let outcome = coordinator
            .run(|dependency| async move { TaskOutcome::<u32, String>::Success(dependency * 10) })
            .await
            .unwrap();

        assert_eq!(outcome, FinalOutcome::Success(10));

        let metrics = coordinator.metrics().await.unwrap();
        assert_eq!(metrics.version, 1);
        assert_eq!(metrics.refreshes_started, 1);
        assert!(!metrics.is_refreshing);
    }

    #[tokio::test]
    async fn test_stale_task_is_retried_once_against_fresh_value() {
        let coordinator = Coordinator::new(Some(1), counting_refresher());

        let outcome = coordinator
            .run(|dependency| async move {
                if dependency == 1 {
                    TaskOutcome::<u32, String>::RefreshDependency
                } else {
                    TaskOutcome::Success(dependency)
                }
            })
            .await
            .unwrap();

        assert_eq!(outcome, FinalOutcome::Success(2));

        let metrics = coordinator.metrics().await.unwrap();
        assert_eq!(metrics.version, 1);
        assert_eq!(metrics.refreshes_started, 1);
    }

    #[tokio::test]
    async fn test_task_failure_is_direct_and_final() {
        let coordinator = Coordinator::new(Some(1), counting_refresher());

        let outcome = coordinator
            .run(|_dependency| async move { TaskOutcome::<u32, String>::Failure("task broke".to_string()) })
            .await
            .unwrap();

        assert_eq!(
            outcome,
            FinalOutcome::Failure {
                error: "task broke".to_string(),
                origin: true,
            }
        );

        // A real failure never triggers a refresh.
        let metrics = coordinator.metrics().await.unwrap();
        assert_eq!(metrics.refreshes_started, 0);
    }

    #[tokio::test]
    async fn test_task_cancellation_is_direct() {
        let coordinator = Coordinator::new(Some(1), counting_refresher());

        let outcome = coordinator
            .run(|_dependency| async move { TaskOutcome::<u32, String>::Cancelled { origin: false } })
            .await
            .unwrap();

        assert_eq!(outcome, FinalOutcome::Cancelled { origin: true });
    }

    #[tokio::test]
    async fn test_cancelled_token_short_circuits_before_entry() {
        let coordinator = Coordinator::new(Some(1), counting_refresher());

        let cancel = CancellationToken::new();
        cancel.cancel();

        let entered = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&entered);
        let outcome = coordinator
            .run_cancellable(
                move |_dependency| {
                    let flag = Arc::clone(&flag);
                    async move {
                        flag.store(true, Ordering::SeqCst);
                        TaskOutcome::<u32, String>::Success(0)
                    }
                },
                cancel,
            )
            .await
            .unwrap();

        assert_eq!(outcome, FinalOutcome::Cancelled { origin: true });
        assert!(!entered.load(Ordering::SeqCst));
        let metrics = coordinator.metrics().await.unwrap();
        assert_eq!(metrics.tasks_dispatched, 0);
    }

    #[tokio::test]
    async fn test_set_dependency_skips_refresh_and_version_bump() {
        let coordinator: Coordinator<u32, String> = Coordinator::new(None, counting_refresher());

        coordinator.set_dependency(Some(99)).await.unwrap();
        assert_eq!(coordinator.dependency().await.unwrap(), Some(99));

        let outcome = coordinator
            .run(|dependency| async move { TaskOutcome::<u32, String>::Success(dependency) })
            .await
            .unwrap();

        assert_eq!(outcome, FinalOutcome::Success(99));

        let metrics = coordinator.metrics().await.unwrap();
        assert_eq!(metrics.version, 0);
        assert_eq!(metrics.refreshes_started, 0);
    }

    #[tokio::test]
    async fn test_clearing_dependency_forces_refresh_on_next_run() {
        let coordinator = Coordinator::new(Some(5), counting_refresher());

        coordinator.set_dependency(None).await.unwrap();

        let outcome = coordinator
            .run(|dependency| async move { TaskOutcome::<u32, String>::Success(dependency) })
            .await
            .unwrap();

        assert_eq!(outcome, FinalOutcome::Success(1));
        assert_eq!(coordinator.metrics().await.unwrap().refreshes_started, 1);
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let coordinator = Coordinator::new(Some(3), counting_refresher());
        let clone = coordinator.clone();

        clone.set_dependency(Some(4)).await.unwrap();
        assert_eq!(coordinator.dependency().await.unwrap(), Some(4));
    }
}
