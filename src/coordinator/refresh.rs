//! Refresh contract: the context handed to a refresher and the trait itself

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use super::outcome::RefreshOutcome;

/// Why a refresh was triggered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshReason<D> {
    /// No dependency is stored: either none was ever produced, or it was
    /// cleared externally.
    MissingDependency,

    /// A task declared the current dependency stale; carries the value the
    /// task saw.
    TaskRequiredUpdate(D),
}

impl<D> RefreshReason<D> {
    /// The stale dependency that prompted this refresh, if any.
    pub fn prior_dependency(&self) -> Option<&D> {
        match self {
            RefreshReason::MissingDependency => None,
            RefreshReason::TaskRequiredUpdate(prior) => Some(prior),
        }
    }
}

/// Context passed to every refresh invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshContext<D> {
    /// 1-based attempt counter within the current triggering.
    pub attempt: u32,

    /// What prompted the refresh.
    pub reason: RefreshReason<D>,
}

/// Produces a fresh dependency value.
///
/// Implementations may suspend freely but must terminate with one of the
/// three [`RefreshOutcome`] variants. Calling back into the owning
/// coordinator from inside `refresh` deadlocks.
#[async_trait]
pub trait Refresher<D, E>: Send + Sync {
    async fn refresh(&self, ctx: RefreshContext<D>) -> RefreshOutcome<D, E>;
}

#[async_trait]
impl<D, E, T> Refresher<D, E> for Arc<T>
where
    T: Refresher<D, E> + ?Sized,
    D: Send + 'static,
    E: 'static,
{
    async fn refresh(&self, ctx: RefreshContext<D>) -> RefreshOutcome<D, E> {
        (**self).refresh(ctx).await
    }
}

/// Adapter turning an async closure into a [`Refresher`].
///
/// Built with [`refresh_fn`].
pub struct RefreshFn<F> {
    f: F,
}

/// Wrap an async closure as a [`Refresher`].
pub fn refresh_fn<F>(f: F) -> RefreshFn<F> {
    RefreshFn { f }
}

#[async_trait]
impl<D, E, F, Fut> Refresher<D, E> for RefreshFn<F>
where
    D: Send + 'static,
    E: 'static,
    F: Fn(RefreshContext<D>) -> Fut + Send + Sync,
    Fut: Future<Output = RefreshOutcome<D, E>> + Send,
{
    async fn refresh(&self, ctx: RefreshContext<D>) -> RefreshOutcome<D, E> {
        (self.f)(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prior_dependency_accessor() {
        let missing: RefreshReason<u32> = RefreshReason::MissingDependency;
        assert_eq!(missing.prior_dependency(), None);

        let stale = RefreshReason::TaskRequiredUpdate(7u32);
        assert_eq!(stale.prior_dependency(), Some(&7));
    }

    #[tokio::test]
    async fn test_refresh_fn_adapter() {
        let refresher = refresh_fn(|ctx: RefreshContext<u32>| async move {
            match ctx.reason.prior_dependency() {
                Some(prior) => RefreshOutcome::<u32, String>::Success(prior + 1),
                None => RefreshOutcome::Success(0),
            }
        });

        let ctx = RefreshContext {
            attempt: 1,
            reason: RefreshReason::MissingDependency,
        };
        assert_eq!(refresher.refresh(ctx).await, RefreshOutcome::Success(0));

        let ctx = RefreshContext {
            attempt: 1,
            reason: RefreshReason::TaskRequiredUpdate(41),
        };
        assert_eq!(refresher.refresh(ctx).await, RefreshOutcome::Success(42));
    }

    #[tokio::test]
    async fn test_arc_refresher_delegates() {
        let refresher = Arc::new(refresh_fn(|_ctx: RefreshContext<u32>| async move {
            RefreshOutcome::<u32, String>::Success(1)
        }));

        let ctx = RefreshContext {
            attempt: 1,
            reason: RefreshReason::MissingDependency,
        };
        assert_eq!(refresher.refresh(ctx).await, RefreshOutcome::Success(1));
    }
}
