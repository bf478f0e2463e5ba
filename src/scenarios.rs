// scenarios.rs

use pyo3::prelude::*;

use crate::context_manager::{with_context, ContextManager, ContextManagerAdapter};
use crate::errors::LifecycleError;
use crate::handle::OwnershipHandle;
use crate::ledger::{process_ledger, LifecycleLedger, ReleasePath};
use crate::probe::{probe_host_cycle, LeakReport};
use crate::resource::{NativeResource, ReleaseWatch, ResourceSpec};
use crate::scope::ScopeGuard;

/// Summary of one demonstration run.
#[pyclass(name = "ScenarioReport", frozen, get_all)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScenarioReport {
    pub scenario: String,
    pub constructed: usize,
    pub released: usize,
    pub detail: String,
}

impl ScenarioReport {
    fn new(scenario: &str, watches: &[ReleaseWatch], detail: impl Into<String>) -> Self {
        let report = ScenarioReport {
            scenario: scenario.to_string(),
            constructed: watches.len(),
            released: watches.iter().filter(|w| w.is_released()).count(),
            detail: detail.into(),
        };
        tracing::info!(
            scenario = %report.scenario,
            constructed = report.constructed,
            released = report.released,
            detail = %report.detail,
            "scenario finished"
        );
        report
    }
}

#[pymethods]
impl ScenarioReport {
    fn __repr__(&self) -> String {
        format!(
            "ScenarioReport({:?}, constructed={}, released={}, detail={:?})",
            self.scenario, self.constructed, self.released, self.detail
        )
    }
}

/// Native code constructs, uses and destroys a resource with no handle.
pub fn run_direct_construction(ledger: &LifecycleLedger) -> Result<ScenarioReport, LifecycleError> {
    let mut resource = NativeResource::construct(ledger, ResourceSpec::new("direct", 1))?;
    let watch = resource.watch();

    resource.invoke("ping", &[])?;
    resource.invoke("add", &[41])?;
    let first = resource.destroy(ReleasePath::Direct);
    let second = resource.destroy(ReleasePath::Direct);
    drop(resource);

    Ok(ScenarioReport::new(
        "direct construction",
        &[watch],
        format!("first destroy: {first:?}, second destroy: {second:?}"),
    ))
}

/// Ping through a handle, release it, then show the handle refuses reuse.
pub fn run_wrapped_handle(ledger: &LifecycleLedger) -> Result<ScenarioReport, LifecycleError> {
    let handle = OwnershipHandle::create(ledger, ResourceSpec::new("wrapped", 0))?;
    let watch = handle.watch();

    handle.invoke("ping", &[])?;
    let first = handle.release();
    let second = handle.release();
    let reuse = match handle.invoke("ping", &[]) {
        Err(err) if err.is_use_after_release() => "reuse rejected".to_string(),
        Err(err) => return Err(err),
        Ok(reply) => format!("reuse unexpectedly answered {reply:?}"),
    };

    Ok(ScenarioReport::new(
        "wrapped handle",
        &[watch],
        format!("release: {first:?} then {second:?}, {reuse}"),
    ))
}

/// One clean context block and one that fails inside; both release.
pub fn run_context_manager(ledger: &LifecycleLedger) -> Result<ScenarioReport, LifecycleError> {
    let mut watches = Vec::with_capacity(2);

    let mut clean = ContextManagerAdapter::acquiring(ledger, ResourceSpec::new("context", 5));
    let value = with_context(&mut clean, |handle| {
        watches.push(handle.watch());
        handle.invoke("get", &[])
    })?;

    let mut failing =
        ContextManagerAdapter::acquiring(ledger, ResourceSpec::new("context-failing", 0));
    let failure = with_context(&mut failing, |handle| {
        watches.push(handle.watch());
        handle.invoke("no-such-op", &[])
    });
    let propagated = match failure {
        Err(LifecycleError::UnknownOperation(op)) => op,
        Err(err) => return Err(err),
        Ok(reply) => format!("unexpected {reply:?}"),
    };
    let repeat_exit = failing.exit(None);

    Ok(ScenarioReport::new(
        "context manager",
        &watches,
        format!(
            "clean block read {value:?}, failing block propagated {propagated:?}, repeat exit: {repeat_exit:?}"
        ),
    ))
}

/// Three nested stack scopes; the innermost is destroyed first.
pub fn run_stack_scope(ledger: &LifecycleLedger) -> Result<ScenarioReport, LifecycleError> {
    let mut watches = Vec::with_capacity(3);
    {
        let outer = ScopeGuard::acquire(ledger, ResourceSpec::new("outer", 1))?;
        watches.push(outer.watch());
        {
            let middle = ScopeGuard::acquire(ledger, ResourceSpec::new("middle", 2))?;
            watches.push(middle.watch());
            {
                let inner = ScopeGuard::acquire(ledger, ResourceSpec::new("inner", 3))?;
                watches.push(inner.watch());
                inner.invoke("ping", &[])?;
            }
            middle.invoke("ping", &[])?;
        }
        outer.invoke("ping", &[])?;
    }

    let order: Vec<String> = watches
        .iter()
        .rev()
        .map(|w| format!("{}@{}", w.id(), w.destroyed_at().unwrap_or_default()))
        .collect();
    Ok(ScenarioReport::new(
        "stack scope",
        &watches,
        format!("destroyed {}", order.join(" < ")),
    ))
}

/// Construct a resource directly, use it, and destroy it twice.
#[pyfunction]
pub fn demo_direct_construction() -> PyResult<ScenarioReport> {
    Ok(run_direct_construction(process_ledger())?)
}

/// Abandon a handle in a reference cycle and report whether the host's
/// collector released it.
#[pyfunction]
#[pyo3(signature = (collect=true))]
pub fn demo_memory_leak(py: Python<'_>, collect: bool) -> PyResult<LeakReport> {
    probe_host_cycle(py, collect)
}

#[pyfunction]
pub fn demo_wrapped_handle() -> PyResult<ScenarioReport> {
    Ok(run_wrapped_handle(process_ledger())?)
}

#[pyfunction]
pub fn demo_context_manager() -> PyResult<ScenarioReport> {
    Ok(run_context_manager(process_ledger())?)
}

#[pyfunction]
pub fn demo_stack_scope() -> PyResult<ScenarioReport> {
    Ok(run_stack_scope(process_ledger())?)
}

pub fn register_scenarios(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<ScenarioReport>()?;
    m.add_function(wrap_pyfunction!(demo_direct_construction, m)?)?;
    m.add_function(wrap_pyfunction!(demo_memory_leak, m)?)?;
    m.add_function(wrap_pyfunction!(demo_wrapped_handle, m)?)?;
    m.add_function(wrap_pyfunction!(demo_context_manager, m)?)?;
    m.add_function(wrap_pyfunction!(demo_stack_scope, m)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_construction_destroys_once() {
        let ledger = LifecycleLedger::default();
        let report = run_direct_construction(&ledger).unwrap();

        assert_eq!((report.constructed, report.released), (1, 1));
        assert!(report.detail.contains("second destroy: AlreadyReleased"));
        assert_eq!(ledger.snapshot().destroyed, 1);
    }

    #[test]
    fn wrapped_handle_rejects_reuse() {
        let ledger = LifecycleLedger::default();
        let report = run_wrapped_handle(&ledger).unwrap();

        assert_eq!(report.released, 1);
        assert!(report.detail.ends_with("reuse rejected"), "{}", report.detail);
    }

    #[test]
    fn context_manager_releases_both_blocks() {
        let ledger = LifecycleLedger::default();
        let report = run_context_manager(&ledger).unwrap();

        assert_eq!((report.constructed, report.released), (2, 2));
        assert!(report.detail.contains("read Value(5)"));
        assert!(report.detail.ends_with("repeat exit: AlreadyReleased"));
        assert!(report.detail.contains("\"no-such-op\""));
        assert_eq!(ledger.snapshot().live, 0);
    }

    #[test]
    fn stack_scope_releases_everything() {
        let ledger = LifecycleLedger::default();
        let report = run_stack_scope(&ledger).unwrap();

        assert_eq!((report.constructed, report.released), (3, 3));
        assert_eq!(ledger.snapshot().live, 0);
    }

    #[test]
    fn scenarios_surface_construction_failures() {
        let ledger = LifecycleLedger::new(crate::ledger::LedgerConfig::default().with_max_live(2));
        let err = run_stack_scope(&ledger).unwrap_err();

        assert!(matches!(err, LifecycleError::Construction { .. }));
        assert_eq!(ledger.snapshot().live, 0);
    }
}
