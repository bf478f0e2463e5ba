use pyo3::prelude::*;
use tracing_subscriber::EnvFilter;

pub mod context_manager;
pub mod errors;
pub mod handle;
pub mod ledger;
pub mod probe;
pub mod resource;
pub mod scenarios;
pub mod scope;

pub use context_manager::{with_context, ContextManager, ContextManagerAdapter, ContextState};
pub use errors::LifecycleError;
pub use handle::{Disposable, OwnershipHandle};
pub use ledger::{
    process_ledger, EventKind, LedgerConfig, LedgerSnapshot, LifecycleEvent, LifecycleLedger,
    ReleasePath,
};
pub use probe::{CycleCollector, LeakOutcome, LeakProbe, LeakProbeConfig, LeakReport, Reclamation};
pub use resource::{NativeResource, ReleaseStatus, ReleaseWatch, Reply, ResourceId, ResourceSpec};
pub use scope::{with_scope, ScopeGuard, ScopeState};

/// Install a `tracing` subscriber that writes lifecycle events to stderr.
///
/// Returns `False` when a global subscriber is already installed.
#[pyfunction]
#[pyo3(signature = (filter="info"))]
pub fn enable_logging(filter: &str) -> PyResult<bool> {
    let filter = EnvFilter::try_new(filter)
        .map_err(|err| pyo3::exceptions::PyValueError::new_err(err.to_string()))?;
    Ok(tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .is_ok())
}

#[pymodule]
pub fn handlebridge(m: &Bound<'_, PyModule>) -> PyResult<()> {
    errors::register_errors(m)?;
    ledger::register_ledger(m)?;
    handle::register_handle(m)?;
    context_manager::register_context_manager(m)?;
    probe::register_probe(m)?;
    scenarios::register_scenarios(m)?;
    m.add_function(wrap_pyfunction!(enable_logging, m)?)?;
    m.add(
        "__doc__",
        "Deterministic lifecycle bridge for natively owned resources.",
    )?;
    Ok(())
}
