//! TaskGate - dependency-gated task coordination
//!
//! A reusable concurrency primitive for running asynchronous tasks that all
//! need a shared refreshable dependency (canonical example: an OAuth access
//! token). The coordinator guarantees that tasks see a valid dependency,
//! that at most one refresh executes at any time across all concurrent
//! callers, and that tasks observing staleness are transparently retried
//! against the freshly produced value.
//!
//! # Core concepts
//!
//! - **Dependency**: the shared value every task needs; opaque to the
//!   coordinator, cloned into each task invocation
//! - **Refresher**: the user-supplied procedure that produces a new
//!   dependency value
//! - **Single-flight**: at most one refresh executes at a time; callers
//!   arriving during a refresh park in FIFO order and inherit its outcome
//! - **Origin flag**: failures and cancellations carry a boolean telling
//!   the caller whether the result arose on its own code path or was
//!   inherited from a refresh it shared with other callers
//!
//! # Example
//!
//! ```no_run
//! use taskgate::{Coordinator, RefreshContext, RefreshOutcome, TaskOutcome, refresh_fn};
//!
//! # async fn demo() {
//! let coordinator: Coordinator<String, String> = Coordinator::new(
//!     None,
//!     refresh_fn(|_ctx: RefreshContext<String>| async {
//!         RefreshOutcome::Success("token-1".to_string())
//!     }),
//! );
//!
//! let outcome = coordinator
//!     .run(|token| async move {
//!         if token.starts_with("token") {
//!             TaskOutcome::Success(format!("called with {token}"))
//!         } else {
//!             TaskOutcome::RefreshDependency
//!         }
//!     })
//!     .await
//!     .unwrap();
//! assert!(outcome.is_success());
//! # }
//! ```

pub mod coordinator;

pub use coordinator::{
    Coordinator, CoordinatorConfig, CoordinatorError, CoordinatorMetrics, FinalOutcome,
    RefreshContext, RefreshFn, RefreshOutcome, RefreshReason, Refresher, TaskOutcome, refresh_fn,
};
