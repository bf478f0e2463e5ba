// handle.rs

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use pyo3::prelude::*;
use pyo3::types::PyTuple;

use crate::errors::LifecycleError;
use crate::ledger::{process_ledger, LifecycleLedger, ReleasePath};
use crate::resource::{NativeResource, ReleaseStatus, ReleaseWatch, Reply, ResourceId, ResourceSpec};

/// Anything that can be released exactly once along a given path.
pub trait Disposable {
    fn resource_id(&self) -> ResourceId;
    fn dispose(&self, path: ReleasePath) -> ReleaseStatus;
    fn is_disposed(&self) -> bool;
}

impl<D: Disposable + ?Sized> Disposable for Arc<D> {
    fn resource_id(&self) -> ResourceId {
        (**self).resource_id()
    }

    fn dispose(&self, path: ReleasePath) -> ReleaseStatus {
        (**self).dispose(path)
    }

    fn is_disposed(&self) -> bool {
        (**self).is_disposed()
    }
}

/// Owns exactly one [`NativeResource`] and releases it exactly once.
///
/// `release()` is the deterministic path. If the handle is dropped while
/// still holding its resource, `Drop` releases it through the finalizer path.
/// Inside a Python object that happens whenever the host reclaims the
/// object, which may be much later or never.
pub struct OwnershipHandle {
    id: ResourceId,
    watch: ReleaseWatch,
    released: AtomicBool,
    resource: Mutex<Option<NativeResource>>,
}

impl fmt::Debug for OwnershipHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OwnershipHandle")
            .field("id", &self.id)
            .field("released", &self.is_released())
            .finish()
    }
}

impl OwnershipHandle {
    pub fn create(ledger: &LifecycleLedger, spec: ResourceSpec) -> Result<Self, LifecycleError> {
        let resource = NativeResource::construct(ledger, spec)?;
        Ok(OwnershipHandle {
            id: resource.id(),
            watch: resource.watch(),
            released: AtomicBool::new(false),
            resource: Mutex::new(Some(resource)),
        })
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Destruction ordinal of the underlying resource, once released.
    pub fn released_at(&self) -> Option<u64> {
        self.watch.destroyed_at()
    }

    pub fn watch(&self) -> ReleaseWatch {
        self.watch.clone()
    }

    pub fn invoke(&self, op: &str, args: &[i64]) -> Result<Reply, LifecycleError> {
        if self.is_released() {
            return Err(LifecycleError::use_after_release(self.id, op));
        }
        let mut slot = self.resource.lock();
        match slot.as_mut() {
            Some(resource) => resource.invoke(op, args),
            None => Err(LifecycleError::use_after_release(self.id, op)),
        }
    }

    pub fn release(&self) -> ReleaseStatus {
        self.release_via(ReleasePath::Explicit)
    }

    /// Release along `path`. The flag is swapped before the resource is
    /// touched, so racing callers (explicit release against a finalizer)
    /// destroy at most once.
    pub fn release_via(&self, path: ReleasePath) -> ReleaseStatus {
        if self
            .released
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::trace!(resource = %self.id, %path, "release skipped, already released");
            return ReleaseStatus::AlreadyReleased;
        }

        let taken = self.resource.lock().take();
        match taken {
            Some(mut resource) => resource.destroy(path),
            None => ReleaseStatus::AlreadyReleased,
        }
    }
}

impl Disposable for OwnershipHandle {
    fn resource_id(&self) -> ResourceId {
        self.id
    }

    fn dispose(&self, path: ReleasePath) -> ReleaseStatus {
        self.release_via(path)
    }

    fn is_disposed(&self) -> bool {
        self.is_released()
    }
}

impl Drop for OwnershipHandle {
    fn drop(&mut self) {
        if !self.is_released() {
            tracing::warn!(resource = %self.id, "handle dropped without release, finalizing");
            self.release_via(ReleasePath::Finalizer);
        }
    }
}

/// Python view of an [`OwnershipHandle`].
///
/// Instances made by `ResourceHandle(name, value)` own their handle outright.
/// Instances returned from `ManagedResource.__enter__` share it with the
/// context manager, which releases it on `__exit__`.
#[pyclass(name = "ResourceHandle", frozen)]
pub struct PyResourceHandle {
    inner: Arc<OwnershipHandle>,
}

impl PyResourceHandle {
    pub fn from_shared(inner: Arc<OwnershipHandle>) -> Self {
        PyResourceHandle { inner }
    }

    pub fn handle(&self) -> &OwnershipHandle {
        &self.inner
    }
}

#[pymethods]
impl PyResourceHandle {
    #[new]
    #[pyo3(signature = (name, value=0))]
    fn new(name: String, value: i64) -> PyResult<Self> {
        let handle = OwnershipHandle::create(process_ledger(), ResourceSpec::new(name, value))?;
        Ok(PyResourceHandle {
            inner: Arc::new(handle),
        })
    }

    /// Forward `op` to the native resource.
    ///
    /// Raises `UseAfterReleaseError` once the handle has been released.
    #[pyo3(signature = (op, *args))]
    fn invoke(&self, op: &str, args: &Bound<'_, PyTuple>) -> PyResult<Reply> {
        let args: Vec<i64> = args.extract()?;
        Ok(self.inner.invoke(op, &args)?)
    }

    /// Release the native resource. Safe to call more than once.
    fn release(&self) -> ReleaseStatus {
        self.inner.release()
    }

    #[getter]
    fn id(&self) -> u64 {
        self.inner.id().as_raw()
    }

    #[getter]
    fn released(&self) -> bool {
        self.inner.is_released()
    }

    #[getter]
    fn released_at(&self) -> Option<u64> {
        self.inner.released_at()
    }

    fn __repr__(&self) -> String {
        let state = if self.inner.is_released() {
            "released"
        } else {
            "alive"
        };
        format!("ResourceHandle({}, {})", self.inner.id(), state)
    }
}

pub fn register_handle(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<ReleaseStatus>()?;
    m.add_class::<PyResourceHandle>()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{EventKind, LedgerConfig};
    use proptest::prelude::*;
    use rayon::prelude::*;

    fn handle(ledger: &LifecycleLedger) -> OwnershipHandle {
        OwnershipHandle::create(ledger, ResourceSpec::new("handle", 1)).unwrap()
    }

    #[test]
    fn ping_release_ping() {
        let ledger = LifecycleLedger::default();
        let h = handle(&ledger);

        assert_eq!(h.invoke("ping", &[]).unwrap(), Reply::Pong);
        assert_eq!(h.release(), ReleaseStatus::Released);
        let err = h.invoke("ping", &[]).unwrap_err();
        assert_eq!(err, LifecycleError::use_after_release(h.id(), "ping"));
    }

    #[test]
    fn second_release_is_a_no_op() {
        let ledger = LifecycleLedger::default();
        let h = handle(&ledger);

        assert_eq!(h.release(), ReleaseStatus::Released);
        let after_first = ledger.snapshot();
        let released_at = h.released_at();

        assert_eq!(h.release(), ReleaseStatus::AlreadyReleased);
        assert_eq!(ledger.snapshot(), after_first);
        assert_eq!(h.released_at(), released_at);
    }

    #[test]
    fn failed_create_leaves_nothing_alive() {
        let ledger = LifecycleLedger::new(LedgerConfig::default().with_max_live(1));
        let _first = handle(&ledger);

        let err = OwnershipHandle::create(&ledger, ResourceSpec::new("second", 0)).unwrap_err();
        assert!(matches!(err, LifecycleError::Construction { .. }));
        assert_eq!(ledger.snapshot().constructed, 1);
        assert_eq!(ledger.snapshot().live, 1);
    }

    #[test]
    fn drop_without_release_runs_the_finalizer() {
        let ledger = LifecycleLedger::default();
        let h = handle(&ledger);
        let id = h.id();
        let watch = h.watch();
        drop(h);

        assert!(watch.is_released());
        assert_eq!(
            ledger.events_for(id).pop().unwrap().kind,
            EventKind::Destroyed {
                path: ReleasePath::Finalizer
            }
        );
    }

    #[test]
    fn drop_after_release_does_not_destroy_again() {
        let ledger = LifecycleLedger::default();
        let h = handle(&ledger);
        h.release();
        drop(h);

        assert_eq!(ledger.snapshot().destroyed, 1);
    }

    #[test]
    fn concurrent_release_destroys_once() {
        let ledger = LifecycleLedger::default();
        let h = Arc::new(handle(&ledger));

        let released = (0..64)
            .into_par_iter()
            .map(|i| {
                let path = if i % 2 == 0 {
                    ReleasePath::Explicit
                } else {
                    ReleasePath::Finalizer
                };
                h.dispose(path)
            })
            .filter(ReleaseStatus::was_released)
            .count();

        assert_eq!(released, 1);
        assert_eq!(ledger.snapshot().destroyed, 1);
        assert!(h.is_disposed());
    }

    proptest! {
        #[test]
        fn any_number_of_releases_destroys_exactly_once(extra in 0usize..16) {
            let ledger = LifecycleLedger::default();
            let h = handle(&ledger);

            prop_assert_eq!(h.release(), ReleaseStatus::Released);
            for _ in 0..extra {
                prop_assert_eq!(h.release(), ReleaseStatus::AlreadyReleased);
            }
            drop(h);

            let snapshot = ledger.snapshot();
            prop_assert_eq!(snapshot.constructed, 1);
            prop_assert_eq!(snapshot.destroyed, 1);
        }
    }
}
