//! Command loop owning all coordinator state
//!
//! Every state transition happens inside this single task, so no two
//! transitions can interleave. User callables never run while a command is
//! being processed: the task callable runs in the caller's own context
//! between two commands, and the refresh callable runs in a spawned task
//! that reports completion back over a dedicated channel.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::messages::{Command, CoordinatorMetrics, EnterDirective, Resumption, StaleVerdict};
use super::outcome::RefreshOutcome;
use super::refresh::{RefreshContext, RefreshReason, Refresher};

/// State owned exclusively by the command loop.
pub(crate) struct Core<D, E> {
    /// Current dependency value; `None` until the first successful refresh
    /// or an explicit injection.
    dependency: Option<D>,
    /// Bumped on every successful refresh, and only then.
    version: u64,
    is_refreshing: bool,
    /// 1-based while a refresh is in flight; reset on every terminal task
    /// or refresh outcome.
    refresh_attempt: u32,
    /// Calls parked behind the in-flight refresh, in arrival order.
    waiters: VecDeque<oneshot::Sender<Resumption<E>>>,
    /// The call whose entry or stale report triggered the in-flight refresh.
    originator: Option<oneshot::Sender<Resumption<E>>>,
    refresher: Arc<dyn Refresher<D, E>>,
    /// Handed to each spawned refresh task to report its outcome.
    done_tx: mpsc::Sender<RefreshOutcome<D, E>>,
    metrics: CoordinatorMetrics,
}

impl<D, E> Core<D, E>
where
    D: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    pub(crate) fn new(
        initial: Option<D>,
        refresher: Arc<dyn Refresher<D, E>>,
        done_tx: mpsc::Sender<RefreshOutcome<D, E>>,
    ) -> Self {
        Self {
            dependency: initial,
            version: 0,
            is_refreshing: false,
            refresh_attempt: 0,
            waiters: VecDeque::new(),
            originator: None,
            refresher,
            done_tx,
            metrics: CoordinatorMetrics::default(),
        }
    }

    fn handle(&mut self, command: Command<D, E>) {
        match command {
            Command::Enter { reply } => self.handle_enter(reply),
            Command::Settle { reply } => self.handle_settle(reply),
            Command::Stale {
                snapshot,
                version,
                reply,
            } => self.handle_stale(snapshot, version, reply),
            Command::SetDependency { dependency, reply } => self.handle_set_dependency(dependency, reply),
            Command::GetDependency { reply } => {
                let _ = reply.send(self.dependency.clone());
            }
            Command::GetMetrics { reply } => {
                let _ = reply.send(self.metrics_snapshot());
            }
        }
    }

    /// Dispatch an arriving call: hand out a snapshot, park it behind the
    /// in-flight refresh, or trigger a refresh for a missing dependency.
    fn handle_enter(&mut self, reply: oneshot::Sender<EnterDirective<D, E>>) {
        if self.is_refreshing {
            let (resume_tx, resume_rx) = oneshot::channel();
            self.waiters.push_back(resume_tx);
            self.metrics.tasks_parked += 1;
            debug!(waiters = self.waiters.len(), "refresh in flight, parking caller");
            let _ = reply.send(EnterDirective::Parked(resume_rx));
        } else if let Some(dependency) = self.dependency.clone() {
            self.metrics.tasks_dispatched += 1;
            debug!(version = self.version, "dispatching task");
            let _ = reply.send(EnterDirective::Attempt {
                dependency,
                version: self.version,
            });
        } else {
            let resume_rx = self.begin_refresh(RefreshReason::MissingDependency);
            let _ = reply.send(EnterDirective::Parked(resume_rx));
        }
    }

    /// A task attempt finished with a terminal outcome.
    fn handle_settle(&mut self, reply: oneshot::Sender<()>) {
        self.refresh_attempt = 0;
        let _ = reply.send(());
    }

    /// A task declared its snapshot stale. Only a report whose snapshot is
    /// still current may trigger a refresh; an outdated one (or one racing
    /// an in-flight refresh) is sent back around the loop so it parks or
    /// re-attempts against the newer value.
    fn handle_stale(&mut self, snapshot: D, version: u64, reply: oneshot::Sender<StaleVerdict<E>>) {
        if self.is_refreshing || version < self.version {
            self.metrics.tasks_retried += 1;
            debug!(
                observed = version,
                current = self.version,
                refreshing = self.is_refreshing,
                "stale report outdated, re-attempting without refresh"
            );
            let _ = reply.send(StaleVerdict::Reattempt);
        } else {
            let resume_rx = self.begin_refresh(RefreshReason::TaskRequiredUpdate(snapshot));
            let _ = reply.send(StaleVerdict::Parked(resume_rx));
        }
    }

    fn handle_set_dependency(&mut self, dependency: Option<D>, reply: oneshot::Sender<()>) {
        // Injection bypasses the refresh machinery entirely: the version
        // counter stays where it is.
        debug!(present = dependency.is_some(), "replacing stored dependency");
        self.dependency = dependency;
        let _ = reply.send(());
    }

    /// Start the single refresh and park the triggering call as its
    /// originator. Returns the originator's resumption handle.
    fn begin_refresh(&mut self, reason: RefreshReason<D>) -> oneshot::Receiver<Resumption<E>> {
        debug_assert!(!self.is_refreshing, "refresh already in flight");

        self.is_refreshing = true;
        self.refresh_attempt += 1;
        self.metrics.refreshes_started += 1;
        info!(
            attempt = self.refresh_attempt,
            missing = matches!(reason, RefreshReason::MissingDependency),
            "starting dependency refresh"
        );

        let ctx = RefreshContext {
            attempt: self.refresh_attempt,
            reason,
        };
        let refresher = Arc::clone(&self.refresher);
        let done_tx = self.done_tx.clone();
        tokio::spawn(async move {
            let outcome = refresher.refresh(ctx).await;
            let _ = done_tx.send(outcome).await;
        });

        let (resume_tx, resume_rx) = oneshot::channel();
        self.originator = Some(resume_tx);
        resume_rx
    }

    /// Fan a finished refresh out to every parked call.
    ///
    /// Waiters are resolved in arrival order before the originator, so the
    /// originator cannot observe an idle coordinator and trigger another
    /// refresh while waiters are still pending. Resolution is send-only;
    /// nothing here blocks on the resumed callers.
    pub(crate) fn finish_refresh(&mut self, outcome: RefreshOutcome<D, E>) {
        debug_assert!(self.is_refreshing, "refresh completion without a refresh in flight");

        self.is_refreshing = false;
        self.refresh_attempt = 0;

        match outcome {
            RefreshOutcome::Success(dependency) => {
                self.dependency = Some(dependency);
                self.version += 1;
                self.metrics.refreshes_succeeded += 1;
                info!(
                    version = self.version,
                    waiters = self.waiters.len(),
                    "dependency refreshed"
                );
                for waiter in self.waiters.drain(..) {
                    let _ = waiter.send(Resumption::Retry);
                }
                if let Some(originator) = self.originator.take() {
                    let _ = originator.send(Resumption::Retry);
                }
            }
            RefreshOutcome::Failure(error) => {
                self.metrics.refreshes_failed += 1;
                warn!(waiters = self.waiters.len(), "dependency refresh failed");
                for waiter in self.waiters.drain(..) {
                    let _ = waiter.send(Resumption::Failed {
                        error: error.clone(),
                        origin: false,
                    });
                }
                if let Some(originator) = self.originator.take() {
                    let _ = originator.send(Resumption::Failed { error, origin: true });
                }
            }
            RefreshOutcome::Cancelled { .. } => {
                self.metrics.refreshes_cancelled += 1;
                warn!(waiters = self.waiters.len(), "dependency refresh cancelled");
                for waiter in self.waiters.drain(..) {
                    let _ = waiter.send(Resumption::Cancelled { origin: false });
                }
                if let Some(originator) = self.originator.take() {
                    let _ = originator.send(Resumption::Cancelled { origin: true });
                }
            }
        }
    }

    fn metrics_snapshot(&self) -> CoordinatorMetrics {
        let mut metrics = self.metrics.clone();
        metrics.version = self.version;
        metrics.is_refreshing = self.is_refreshing;
        metrics.has_dependency = self.dependency.is_some();
        metrics.waiter_count = self.waiters.len();
        metrics.refresh_attempt = self.refresh_attempt;
        metrics
    }
}

/// Run the command loop until every handle and any in-flight refresh is
/// dropped.
pub(crate) async fn run_loop<D, E>(
    mut core: Core<D, E>,
    mut command_rx: mpsc::Receiver<Command<D, E>>,
    mut done_rx: mpsc::Receiver<RefreshOutcome<D, E>>,
) where
    D: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    debug!("coordinator command loop started");

    loop {
        tokio::select! {
            command = command_rx.recv() => match command {
                Some(command) => core.handle(command),
                None => break,
            },
            Some(outcome) = done_rx.recv() => core.finish_refresh(outcome),
        }
    }

    debug!("coordinator command loop stopped");
}
