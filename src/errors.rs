// errors.rs

use pyo3::exceptions::{PyException, PyValueError};
use pyo3::prelude::*;
use thiserror::Error;

use crate::resource::ResourceId;

/// Failures surfaced by the lifecycle bridge.
///
/// Releasing something twice is not an error; see [`ReleaseStatus`](crate::ReleaseStatus).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LifecycleError {
    /// The native resource could not be constructed. Nothing was left alive.
    #[error("failed to construct resource {name:?}: {reason}")]
    Construction { name: String, reason: String },

    /// An operation reached a handle whose resource was already destroyed.
    #[error("{op} called on released resource {id}")]
    UseAfterRelease { id: ResourceId, op: String },

    #[error("unknown operation {0:?}")]
    UnknownOperation(String),

    #[error("operation {op:?} expects {expected} argument(s), got {got}")]
    InvalidArguments {
        op: String,
        expected: usize,
        got: usize,
    },

    #[error("operation {op:?} overflowed on resource {id}")]
    Overflow { id: ResourceId, op: String },

    /// `enter()` was called on a context that is already active.
    #[error("context for {0} is already active")]
    AlreadyEntered(String),
}

impl LifecycleError {
    pub fn construction(name: impl Into<String>, reason: impl Into<String>) -> Self {
        LifecycleError::Construction {
            name: name.into(),
            reason: reason.into(),
        }
    }

    pub fn use_after_release(id: ResourceId, op: impl Into<String>) -> Self {
        LifecycleError::UseAfterRelease { id, op: op.into() }
    }

    pub fn is_use_after_release(&self) -> bool {
        matches!(self, LifecycleError::UseAfterRelease { .. })
    }
}

/// Python-side exception hierarchy.
pub mod exc {
    use super::PyException;

    pyo3::create_exception!(
        handlebridge,
        LifecycleError,
        PyException,
        "Base class for handlebridge lifecycle failures."
    );
    pyo3::create_exception!(
        handlebridge,
        ConstructionError,
        LifecycleError,
        "The native resource could not be constructed."
    );
    pyo3::create_exception!(
        handlebridge,
        UseAfterReleaseError,
        LifecycleError,
        "The handle's native resource was already released."
    );
}

impl From<LifecycleError> for PyErr {
    fn from(err: LifecycleError) -> PyErr {
        let message = err.to_string();
        match err {
            LifecycleError::Construction { .. } => exc::ConstructionError::new_err(message),
            LifecycleError::UseAfterRelease { .. } => exc::UseAfterReleaseError::new_err(message),
            LifecycleError::UnknownOperation(_)
            | LifecycleError::InvalidArguments { .. }
            | LifecycleError::Overflow { .. } => PyValueError::new_err(message),
            LifecycleError::AlreadyEntered(_) => exc::LifecycleError::new_err(message),
        }
    }
}

pub fn register_errors(m: &Bound<'_, PyModule>) -> PyResult<()> {
    let py = m.py();
    m.add("LifecycleError", py.get_type::<exc::LifecycleError>())?;
    m.add("ConstructionError", py.get_type::<exc::ConstructionError>())?;
    m.add("UseAfterReleaseError", py.get_type::<exc::UseAfterReleaseError>())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_resource_and_operation() {
        let err = LifecycleError::use_after_release(ResourceId::from_raw(7), "ping");
        assert_eq!(err.to_string(), "ping called on released resource res#7");
        assert!(err.is_use_after_release());

        let err = LifecycleError::construction("", "name must not be empty");
        assert_eq!(
            err.to_string(),
            "failed to construct resource \"\": name must not be empty"
        );
        assert!(!err.is_use_after_release());
    }
}
