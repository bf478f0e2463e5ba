// resource.rs

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use pyo3::prelude::*;
use pyo3::types::PyString;

use crate::errors::LifecycleError;
use crate::ledger::{LifecycleLedger, ReleasePath};

/// Opaque identity of a native resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(u64);

impl ResourceId {
    pub fn from_raw(raw: u64) -> Self {
        ResourceId(raw)
    }

    pub fn as_raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "res#{}", self.0)
    }
}

/// Outcome of a release request. Releasing twice is reported, not raised.
#[pyclass(eq, eq_int)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReleaseStatus {
    Released,
    AlreadyReleased,
}

impl ReleaseStatus {
    pub fn was_released(&self) -> bool {
        matches!(self, ReleaseStatus::Released)
    }
}

/// Construction arguments for a [`NativeResource`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceSpec {
    pub name: String,
    pub value: i64,
}

impl ResourceSpec {
    pub fn new(name: impl Into<String>, value: i64) -> Self {
        ResourceSpec {
            name: name.into(),
            value,
        }
    }
}

/// Operations a native resource understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Ping,
    Get,
    Set,
    Add,
    Name,
}

impl Operation {
    fn arity(&self) -> usize {
        match self {
            Operation::Ping | Operation::Get | Operation::Name => 0,
            Operation::Set | Operation::Add => 1,
        }
    }
}

impl FromStr for Operation {
    type Err = LifecycleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ping" => Ok(Operation::Ping),
            "get" => Ok(Operation::Get),
            "set" => Ok(Operation::Set),
            "add" => Ok(Operation::Add),
            "name" => Ok(Operation::Name),
            other => Err(LifecycleError::UnknownOperation(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Pong,
    Value(i64),
    Name(String),
}

impl<'py> IntoPyObject<'py> for Reply {
    type Target = PyAny;
    type Output = Bound<'py, PyAny>;
    type Error = PyErr;

    fn into_pyobject(self, py: Python<'py>) -> Result<Self::Output, Self::Error> {
        match self {
            Reply::Pong => Ok(PyString::new(py, "pong").into_any()),
            Reply::Value(value) => Ok(value.into_pyobject(py)?.into_any()),
            Reply::Name(name) => Ok(PyString::new(py, &name).into_any()),
        }
    }
}

/// Observes a resource's destruction ordinal without keeping the resource alive.
#[derive(Debug, Clone)]
pub struct ReleaseWatch {
    id: ResourceId,
    destroyed_at: Arc<OnceCell<u64>>,
}

impl ReleaseWatch {
    pub fn id(&self) -> ResourceId {
        self.id
    }

    pub fn destroyed_at(&self) -> Option<u64> {
        self.destroyed_at.get().copied()
    }

    pub fn is_released(&self) -> bool {
        self.destroyed_at.get().is_some()
    }
}

/// A natively owned object with explicit construction and destruction.
///
/// Every transition is stamped on the [`LifecycleLedger`] it was built with.
/// Dropping a resource that is still alive destroys it, the same way a native
/// destructor would run; a resource that is leaked is never destroyed.
pub struct NativeResource {
    id: ResourceId,
    name: String,
    value: i64,
    constructed_at: u64,
    destroyed_at: Arc<OnceCell<u64>>,
    ledger: LifecycleLedger,
}

impl fmt::Debug for NativeResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeResource")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("value", &self.value)
            .field("constructed_at", &self.constructed_at)
            .field("destroyed_at", &self.destroyed_at())
            .finish()
    }
}

impl NativeResource {
    pub fn construct(ledger: &LifecycleLedger, spec: ResourceSpec) -> Result<Self, LifecycleError> {
        if spec.name.trim().is_empty() {
            return Err(LifecycleError::construction(
                spec.name,
                "name must not be empty",
            ));
        }

        let (id, constructed_at) = ledger.record_construction(&spec.name)?;
        tracing::debug!(resource = %id, name = %spec.name, ordinal = constructed_at, "constructed");

        Ok(NativeResource {
            id,
            name: spec.name,
            value: spec.value,
            constructed_at,
            destroyed_at: Arc::new(OnceCell::new()),
            ledger: ledger.clone(),
        })
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn constructed_at(&self) -> u64 {
        self.constructed_at
    }

    pub fn destroyed_at(&self) -> Option<u64> {
        self.destroyed_at.get().copied()
    }

    pub fn is_alive(&self) -> bool {
        self.destroyed_at.get().is_none()
    }

    pub fn watch(&self) -> ReleaseWatch {
        ReleaseWatch {
            id: self.id,
            destroyed_at: Arc::clone(&self.destroyed_at),
        }
    }

    pub fn invoke(&mut self, op: &str, args: &[i64]) -> Result<Reply, LifecycleError> {
        if !self.is_alive() {
            return Err(LifecycleError::use_after_release(self.id, op));
        }

        let operation: Operation = op.parse()?;
        if args.len() != operation.arity() {
            return Err(LifecycleError::InvalidArguments {
                op: op.to_string(),
                expected: operation.arity(),
                got: args.len(),
            });
        }

        let reply = match operation {
            Operation::Ping => Reply::Pong,
            Operation::Get => Reply::Value(self.value),
            Operation::Set => Reply::Value(std::mem::replace(&mut self.value, args[0])),
            Operation::Add => {
                self.value = self.value.checked_add(args[0]).ok_or_else(|| {
                    LifecycleError::Overflow {
                        id: self.id,
                        op: op.to_string(),
                    }
                })?;
                Reply::Value(self.value)
            }
            Operation::Name => Reply::Name(self.name.clone()),
        };
        Ok(reply)
    }

    /// Destroy the resource. Only the first call has an effect; later calls
    /// report `AlreadyReleased` and leave the ledger untouched.
    pub fn destroy(&mut self, path: ReleasePath) -> ReleaseStatus {
        if !self.is_alive() {
            return ReleaseStatus::AlreadyReleased;
        }
        let ordinal = self.ledger.record_destruction(self.id, path);
        // The cell was empty above and only this method fills it.
        let _ = self.destroyed_at.set(ordinal);
        tracing::debug!(resource = %self.id, %path, ordinal, "destroyed");
        ReleaseStatus::Released
    }
}

impl Drop for NativeResource {
    fn drop(&mut self) {
        self.destroy(ReleasePath::NativeDrop);
    }
}
