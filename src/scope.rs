// scope.rs

use crate::errors::LifecycleError;
use crate::handle::OwnershipHandle;
use crate::ledger::{LifecycleLedger, ReleasePath};
use crate::resource::{ReleaseStatus, ReleaseWatch, Reply, ResourceSpec};

/// Lifecycle of a scope.
///
/// A live `ScopeGuard` never reports `Unacquired`: a failed `acquire` returns
/// an error and no guard. The variant names that state for callers that track
/// a scope before acquiring it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeState {
    Unacquired,
    Acquired,
    Released,
}

/// Stack-scoped ownership of one [`OwnershipHandle`].
///
/// The handle is released when the guard leaves scope, whether the scope ends
/// normally, through `?`, or by unwinding. Release never waits on host
/// reclamation.
#[derive(Debug)]
pub struct ScopeGuard {
    handle: OwnershipHandle,
    state: ScopeState,
}

impl ScopeGuard {
    /// Acquire a new resource for the current scope. On failure no guard
    /// exists and nothing is left alive.
    pub fn acquire(ledger: &LifecycleLedger, spec: ResourceSpec) -> Result<Self, LifecycleError> {
        let handle = OwnershipHandle::create(ledger, spec)?;
        tracing::debug!(resource = %handle.id(), "scope acquired");
        Ok(ScopeGuard {
            handle,
            state: ScopeState::Acquired,
        })
    }

    pub fn state(&self) -> ScopeState {
        self.state
    }

    pub fn watch(&self) -> ReleaseWatch {
        self.handle.watch()
    }

    pub fn handle(&self) -> Result<&OwnershipHandle, LifecycleError> {
        match self.state {
            ScopeState::Acquired => Ok(&self.handle),
            _ => Err(LifecycleError::use_after_release(self.handle.id(), "handle")),
        }
    }

    pub fn invoke(&self, op: &str, args: &[i64]) -> Result<Reply, LifecycleError> {
        self.handle()?.invoke(op, args)
    }

    /// Leave the scope early. Dropping the guard afterwards does nothing more.
    pub fn exit(&mut self) -> ReleaseStatus {
        if self.state != ScopeState::Acquired {
            return ReleaseStatus::AlreadyReleased;
        }
        self.state = ScopeState::Released;
        let status = self.handle.release_via(ReleasePath::ScopeExit);
        tracing::debug!(resource = %self.handle.id(), "scope released");
        status
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        self.exit();
    }
}

/// Run `body` with a freshly acquired guard. The resource is released before
/// this returns, and the body's result (success or error) is passed through.
pub fn with_scope<T, E, F>(ledger: &LifecycleLedger, spec: ResourceSpec, body: F) -> Result<T, E>
where
    E: From<LifecycleError>,
    F: FnOnce(&ScopeGuard) -> Result<T, E>,
{
    let mut guard = ScopeGuard::acquire(ledger, spec)?;
    let outcome = body(&guard);
    guard.exit();
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::{catch_unwind, AssertUnwindSafe};

    fn spec(name: &str) -> ResourceSpec {
        ResourceSpec::new(name, 0)
    }

    #[test]
    fn scope_exit_releases() {
        let ledger = LifecycleLedger::default();
        let watch = {
            let guard = ScopeGuard::acquire(&ledger, spec("scoped")).unwrap();
            assert_eq!(guard.state(), ScopeState::Acquired);
            assert_eq!(guard.invoke("ping", &[]).unwrap(), Reply::Pong);
            guard.watch()
        };
        assert!(watch.is_released());
        assert_eq!(ledger.snapshot().live, 0);
    }

    #[test]
    fn nested_scopes_release_lifo() {
        let ledger = LifecycleLedger::default();
        let outer;
        let middle;
        let inner;
        {
            let a = ScopeGuard::acquire(&ledger, spec("outer")).unwrap();
            outer = a.watch();
            {
                let b = ScopeGuard::acquire(&ledger, spec("middle")).unwrap();
                middle = b.watch();
                {
                    let c = ScopeGuard::acquire(&ledger, spec("inner")).unwrap();
                    inner = c.watch();
                }
                assert!(inner.is_released());
                assert!(!middle.is_released());
            }
            assert!(!outer.is_released());
        }

        let order = [inner, middle, outer].map(|w| w.destroyed_at().unwrap());
        assert!(order[0] < order[1] && order[1] < order[2], "{order:?}");
    }

    #[test]
    fn early_exit_then_use_fails() {
        let ledger = LifecycleLedger::default();
        let mut guard = ScopeGuard::acquire(&ledger, spec("early")).unwrap();

        assert_eq!(guard.exit(), ReleaseStatus::Released);
        assert_eq!(guard.state(), ScopeState::Released);
        assert!(guard.invoke("ping", &[]).unwrap_err().is_use_after_release());
        assert_eq!(guard.exit(), ReleaseStatus::AlreadyReleased);

        drop(guard);
        assert_eq!(ledger.snapshot().destroyed, 1);
    }

    #[test]
    fn error_propagates_after_release() {
        let ledger = LifecycleLedger::default();
        let mut seen = None;

        let result: Result<(), LifecycleError> = with_scope(&ledger, spec("failing"), |guard| {
            seen = Some(guard.watch());
            guard.invoke("bogus", &[])?;
            Ok(())
        });

        assert_eq!(
            result.unwrap_err(),
            LifecycleError::UnknownOperation("bogus".into())
        );
        assert!(seen.unwrap().is_released());
    }

    #[test]
    fn panic_still_releases() {
        let ledger = LifecycleLedger::default();
        let mut seen = None;

        let outcome = catch_unwind(AssertUnwindSafe(|| {
            let guard = ScopeGuard::acquire(&ledger, spec("panicking")).unwrap();
            seen = Some(guard.watch());
            panic!("boom");
        }));

        assert!(outcome.is_err());
        assert!(seen.unwrap().is_released());
        assert_eq!(ledger.snapshot().live, 0);
    }

    #[test]
    fn failed_acquire_never_enters_body() {
        let ledger = LifecycleLedger::default();
        let result: Result<(), LifecycleError> =
            with_scope(&ledger, spec(""), |_| panic!("body must not run"));

        assert!(matches!(result, Err(LifecycleError::Construction { .. })));
        assert_eq!(ledger.snapshot().live, 0);
    }

    #[test]
    fn guards_only_report_acquired_or_released() {
        let ledger = LifecycleLedger::default();
        let mut guard = ScopeGuard::acquire(&ledger, spec("states")).unwrap();
        assert_ne!(guard.state(), ScopeState::Unacquired);

        guard.exit();
        assert_eq!(guard.state(), ScopeState::Released);
    }
}
