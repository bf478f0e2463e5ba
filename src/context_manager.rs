// context_manager.rs

use std::error::Error;
use std::fmt;
use std::sync::Arc;

use pyo3::prelude::*;

use crate::errors::LifecycleError;
use crate::handle::{Disposable, OwnershipHandle, PyResourceHandle};
use crate::ledger::{process_ledger, LifecycleLedger, ReleasePath};
use crate::resource::{ReleaseStatus, ResourceSpec};

/// An enter/exit capability pair.
///
/// `exit` receives the failure (if any) that ended the protected block so it
/// can log it, but it must not swallow it: the caller keeps propagating.
pub trait ContextManager {
    type Target;

    fn enter(&mut self) -> Result<&Self::Target, LifecycleError>;
    fn exit(&mut self, failure: Option<&(dyn Error + 'static)>) -> ReleaseStatus;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Idle,
    Active,
    Closed,
}

impl fmt::Display for ContextState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ContextState::Idle => "idle",
            ContextState::Active => "active",
            ContextState::Closed => "closed",
        };
        f.write_str(label)
    }
}

type Factory<D> = Box<dyn FnOnce() -> Result<D, LifecycleError> + Send + Sync>;

enum Slot<D> {
    Deferred(Factory<D>),
    Bound(D),
    Empty,
}

/// Drives a [`Disposable`] through `Idle -> Active -> Closed`.
///
/// The resource is either wrapped up front or acquired on `enter()`. `exit()`
/// releases it with [`ReleasePath::ContextExit`]; calling it again is a no-op.
/// An adapter dropped while still active exits on the way out.
pub struct ContextManagerAdapter<D: Disposable> {
    label: String,
    state: ContextState,
    slot: Slot<D>,
}

impl<D: Disposable> fmt::Debug for ContextManagerAdapter<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextManagerAdapter")
            .field("label", &self.label)
            .field("state", &self.state)
            .finish()
    }
}

impl<D: Disposable> ContextManagerAdapter<D> {
    pub fn wrap(label: impl Into<String>, resource: D) -> Self {
        ContextManagerAdapter {
            label: label.into(),
            state: ContextState::Idle,
            slot: Slot::Bound(resource),
        }
    }

    pub fn deferred<F>(label: impl Into<String>, factory: F) -> Self
    where
        F: FnOnce() -> Result<D, LifecycleError> + Send + Sync + 'static,
    {
        ContextManagerAdapter {
            label: label.into(),
            state: ContextState::Idle,
            slot: Slot::Deferred(Box::new(factory)),
        }
    }

    pub fn state(&self) -> ContextState {
        self.state
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// The wrapped resource, if one has been bound.
    pub fn resource(&self) -> Option<&D> {
        match &self.slot {
            Slot::Bound(resource) => Some(resource),
            _ => None,
        }
    }

    /// Run a deferred factory once. A failed factory leaves the slot empty.
    fn acquire(&mut self) -> Result<(), LifecycleError> {
        match std::mem::replace(&mut self.slot, Slot::Empty) {
            Slot::Deferred(factory) => self.slot = Slot::Bound(factory()?),
            other => self.slot = other,
        }
        Ok(())
    }
}

impl ContextManagerAdapter<OwnershipHandle> {
    /// An adapter that creates a fresh handle on `enter()`.
    pub fn acquiring(ledger: &LifecycleLedger, spec: ResourceSpec) -> Self {
        let ledger = ledger.clone();
        let label = spec.name.clone();
        ContextManagerAdapter::deferred(label, move || OwnershipHandle::create(&ledger, spec))
    }
}

impl<D: Disposable> ContextManager for ContextManagerAdapter<D> {
    type Target = D;

    fn enter(&mut self) -> Result<&D, LifecycleError> {
        match self.state {
            ContextState::Active => return Err(LifecycleError::AlreadyEntered(self.label.clone())),
            ContextState::Closed => return Err(self.unusable("enter")),
            ContextState::Idle => {}
        }

        self.acquire()?;
        match &self.slot {
            Slot::Bound(resource) => {
                self.state = ContextState::Active;
                tracing::debug!(context = %self.label, "entered");
                Ok(resource)
            }
            _ => Err(self.unusable("enter")),
        }
    }

    fn exit(&mut self, failure: Option<&(dyn Error + 'static)>) -> ReleaseStatus {
        if self.state == ContextState::Closed {
            return ReleaseStatus::AlreadyReleased;
        }
        self.state = ContextState::Closed;

        let status = match &self.slot {
            Slot::Bound(resource) => resource.dispose(ReleasePath::ContextExit),
            Slot::Deferred(_) | Slot::Empty => ReleaseStatus::AlreadyReleased,
        };
        if let Slot::Deferred(_) = self.slot {
            self.slot = Slot::Empty;
        }

        match failure {
            Some(err) => tracing::debug!(context = %self.label, error = %err, "exited with failure"),
            None => tracing::debug!(context = %self.label, "exited"),
        }
        status
    }
}

impl<D: Disposable> ContextManagerAdapter<D> {
    /// Error for an adapter that can no longer hand out its resource.
    fn unusable(&self, op: &str) -> LifecycleError {
        match &self.slot {
            Slot::Bound(resource) => LifecycleError::use_after_release(resource.resource_id(), op),
            Slot::Deferred(_) | Slot::Empty => {
                LifecycleError::construction(&self.label, "context has no resource to enter")
            }
        }
    }
}

impl<D: Disposable> Drop for ContextManagerAdapter<D> {
    fn drop(&mut self) {
        if self.state == ContextState::Active {
            self.exit(None);
        }
    }
}

/// Exits the borrowed context if dropped while armed, i.e. while unwinding
/// out of a `with_context` body.
struct ExitOnUnwind<'a, C: ContextManager> {
    cm: &'a mut C,
    armed: bool,
}

impl<C: ContextManager> Drop for ExitOnUnwind<'_, C> {
    fn drop(&mut self) {
        if self.armed {
            tracing::warn!("context body panicked; exiting during unwind");
            self.cm.exit(None);
        }
    }
}

/// Enter `cm`, run `body`, then exit with the body's failure (if any) and
/// return the body's result untouched. A panicking body still exits before
/// the panic leaves this function.
pub fn with_context<C, T, E, F>(cm: &mut C, body: F) -> Result<T, E>
where
    C: ContextManager,
    E: Error + From<LifecycleError> + 'static,
    F: FnOnce(&C::Target) -> Result<T, E>,
{
    let mut guard = ExitOnUnwind { cm, armed: false };
    let outcome = {
        let target = guard.cm.enter()?;
        guard.armed = true;
        body(target)
    };
    guard.armed = false;
    guard
        .cm
        .exit(outcome.as_ref().err().map(|err| err as &(dyn Error + 'static)));
    outcome
}

/// A Python context manager around one native resource.
///
/// ```python
/// with ManagedResource("db", 1) as handle:
///     handle.invoke("ping")
/// # the resource is destroyed here, even if the block raised
/// ```
///
/// `__exit__` never suppresses the exception that ended the block.
#[pyclass(name = "ManagedResource")]
pub struct PyManagedResource {
    adapter: ContextManagerAdapter<Arc<OwnershipHandle>>,
}

#[pymethods]
impl PyManagedResource {
    #[new]
    #[pyo3(signature = (name, value=0))]
    pub fn new(name: String, value: i64) -> Self {
        let spec = ResourceSpec::new(name.clone(), value);
        PyManagedResource {
            adapter: ContextManagerAdapter::deferred(name, move || {
                OwnershipHandle::create(process_ledger(), spec).map(Arc::new)
            }),
        }
    }

    /// __enter__ acquires the resource and returns a `ResourceHandle` for it.
    fn __enter__(&mut self, py: Python<'_>) -> PyResult<Py<PyResourceHandle>> {
        let handle = Arc::clone(self.adapter.enter()?);
        Py::new(py, PyResourceHandle::from_shared(handle))
    }

    /// __exit__ releases the resource and lets any exception continue.
    #[pyo3(signature = (_exc_type=None, exc_value=None, _traceback=None))]
    fn __exit__(
        &mut self,
        py: Python<'_>,
        _exc_type: Option<PyObject>,
        exc_value: Option<PyObject>,
        _traceback: Option<PyObject>,
    ) -> PyResult<bool> {
        let failure = exc_value.map(|value| PyErr::from_value(value.into_bound(py)));
        self.adapter
            .exit(failure.as_ref().map(|err| err as &(dyn Error + 'static)));
        Ok(false)
    }

    #[getter]
    fn state(&self) -> String {
        self.adapter.state().to_string()
    }

    fn __repr__(&self) -> String {
        format!(
            "ManagedResource({:?}, state={})",
            self.adapter.label(),
            self.adapter.state()
        )
    }
}

pub fn register_context_manager(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<PyManagedResource>()?;
    Ok(())
}
