// probe.rs

use std::cell::RefCell;
use std::rc::{Rc, Weak};
use std::sync::Arc;

use pyo3::prelude::*;
use pyo3::types::PyList;

use crate::errors::LifecycleError;
use crate::handle::{OwnershipHandle, PyResourceHandle};
use crate::ledger::{process_ledger, LifecycleLedger};
use crate::resource::{ReleaseWatch, ResourceSpec};

/// Whether the probe runs a reclamation pass after abandoning its handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reclamation {
    Disabled,
    Forced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeakProbeConfig {
    pub handles: usize,
    pub reclamation: Reclamation,
}

impl Default for LeakProbeConfig {
    fn default() -> Self {
        LeakProbeConfig {
            handles: 1,
            reclamation: Reclamation::Forced,
        }
    }
}

#[pyclass(eq, eq_int)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeakOutcome {
    /// Every abandoned resource was eventually released.
    Reclaimed,
    Partial,
    /// Nothing was released within the probe's window.
    Leaked,
}

/// What a leak probe observed.
#[pyclass(name = "LeakReport", frozen, get_all)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeakReport {
    pub handles: usize,
    pub released_before_collect: usize,
    /// Objects the reclamation pass freed, if one ran.
    pub collected: Option<usize>,
    pub released_after_collect: Option<usize>,
    pub outcome: LeakOutcome,
}

impl LeakReport {
    fn from_watches(
        watches: &[ReleaseWatch],
        released_before_collect: usize,
        collected: Option<usize>,
    ) -> Self {
        let released_after_collect = collected.map(|_| count_released(watches));
        let released = released_after_collect.unwrap_or(released_before_collect);
        let outcome = if released == watches.len() {
            LeakOutcome::Reclaimed
        } else if released == 0 {
            LeakOutcome::Leaked
        } else {
            LeakOutcome::Partial
        };
        LeakReport {
            handles: watches.len(),
            released_before_collect,
            collected,
            released_after_collect,
            outcome,
        }
    }
}

#[pymethods]
impl LeakReport {
    fn __repr__(&self) -> String {
        format!(
            "LeakReport(handles={}, released_before_collect={}, released_after_collect={:?}, outcome={:?})",
            self.handles, self.released_before_collect, self.released_after_collect, self.outcome
        )
    }
}

fn count_released(watches: &[ReleaseWatch]) -> usize {
    watches.iter().filter(|watch| watch.is_released()).count()
}

struct CycleNode {
    handle: OwnershipHandle,
    peer: RefCell<Option<Rc<CycleNode>>>,
}

/// A minimal cycle collector: it remembers cycle nodes weakly and, when asked,
/// breaks the cycles of those still alive so ordinary drops can run.
#[derive(Default)]
pub struct CycleCollector {
    tracked: RefCell<Vec<Weak<CycleNode>>>,
}

impl CycleCollector {
    pub fn new() -> Self {
        Self::default()
    }

    fn track(&self, node: &Rc<CycleNode>) {
        self.tracked.borrow_mut().push(Rc::downgrade(node));
    }

    /// Nodes still alive, reachable or not.
    pub fn pending(&self) -> usize {
        self.tracked
            .borrow()
            .iter()
            .filter(|node| node.strong_count() > 0)
            .count()
    }

    /// Break every tracked cycle. Returns how many nodes were freed.
    pub fn collect(&self) -> usize {
        let nodes: Vec<Rc<CycleNode>> = self
            .tracked
            .borrow_mut()
            .drain(..)
            .filter_map(|node| node.upgrade())
            .collect();
        for node in &nodes {
            let peer = node.peer.borrow_mut().take();
            drop(peer);
        }
        let freed = nodes.len();
        drop(nodes);
        tracing::debug!(freed, "cycle collection finished");
        freed
    }
}

/// Abandons handles inside reference cycles to make deferred reclamation
/// observable.
///
/// The handles are never released explicitly, so whether they are destroyed
/// at all depends on a reclamation pass.
pub struct LeakProbe {
    ledger: LifecycleLedger,
    config: LeakProbeConfig,
    collector: CycleCollector,
}

impl LeakProbe {
    pub fn new(ledger: &LifecycleLedger, config: LeakProbeConfig) -> Self {
        LeakProbe {
            ledger: ledger.clone(),
            config,
            collector: CycleCollector::new(),
        }
    }

    pub fn collector(&self) -> &CycleCollector {
        &self.collector
    }

    /// Fails with a construction error when configured with zero handles,
    /// since an empty run would trivially look reclaimed.
    pub fn run_leak_scenario(&self) -> Result<LeakReport, LifecycleError> {
        if self.config.handles == 0 {
            return Err(LifecycleError::construction(
                "leak probe",
                "needs at least one handle to abandon",
            ));
        }
        let watches = self.abandon_in_cycle()?;
        let released_before_collect = count_released(&watches);
        tracing::info!(
            handles = watches.len(),
            released_before_collect,
            "abandoned handles in a reference cycle"
        );

        let collected = match self.config.reclamation {
            Reclamation::Disabled => None,
            Reclamation::Forced => Some(self.collector.collect()),
        };
        Ok(LeakReport::from_watches(
            &watches,
            released_before_collect,
            collected,
        ))
    }

    /// Link fresh handles into a ring and drop every reference to it.
    fn abandon_in_cycle(&self) -> Result<Vec<ReleaseWatch>, LifecycleError> {
        let mut nodes: Vec<Rc<CycleNode>> = Vec::with_capacity(self.config.handles);
        for index in 0..self.config.handles {
            let spec = ResourceSpec::new(format!("leak-{index}"), index as i64);
            let node = Rc::new(CycleNode {
                handle: OwnershipHandle::create(&self.ledger, spec)?,
                peer: RefCell::new(None),
            });
            self.collector.track(&node);
            nodes.push(node);
        }

        for (index, node) in nodes.iter().enumerate() {
            let next = &nodes[(index + 1) % nodes.len()];
            *node.peer.borrow_mut() = Some(Rc::clone(next));
        }

        Ok(nodes.iter().map(|node| node.handle.watch()).collect())
    }
}

/// Abandon a `ResourceHandle` inside a Python reference cycle with the host
/// collector paused, then optionally run `gc.collect()`.
///
/// The collector's previous enabled state is restored before returning.
pub fn probe_host_cycle(py: Python<'_>, collect: bool) -> PyResult<LeakReport> {
    let gc = py.import("gc")?;
    let was_enabled: bool = gc.call_method0("isenabled")?.extract()?;
    gc.call_method0("disable")?;

    let outcome = abandon_host_cycle(py, &gc, collect);

    if was_enabled {
        gc.call_method0("enable")?;
    }
    outcome
}

fn abandon_host_cycle(
    py: Python<'_>,
    gc: &Bound<'_, PyModule>,
    collect: bool,
) -> PyResult<LeakReport> {
    let watch = {
        let handle = OwnershipHandle::create(process_ledger(), ResourceSpec::new("host-leak", 0))?;
        let handle = Bound::new(py, PyResourceHandle::from_shared(Arc::new(handle)))?;
        let watch = handle.get().handle().watch();

        let cycle = PyList::empty(py);
        cycle.append(&handle)?;
        cycle.append(&cycle)?;
        watch
    };
    let watches = [watch];
    let released_before_collect = count_released(&watches);

    let collected = if collect {
        Some(gc.call_method0("collect")?.extract::<usize>()?)
    } else {
        None
    };
    Ok(LeakReport::from_watches(
        &watches,
        released_before_collect,
        collected,
    ))
}

pub fn register_probe(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<LeakOutcome>()?;
    m.add_class::<LeakReport>()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn probe(ledger: &LifecycleLedger, handles: usize, reclamation: Reclamation) -> LeakProbe {
        LeakProbe::new(
            ledger,
            LeakProbeConfig {
                handles,
                reclamation,
            },
        )
    }

    #[test]
    fn disabled_reclamation_leaks() {
        let ledger = LifecycleLedger::default();
        let report = probe(&ledger, 3, Reclamation::Disabled)
            .run_leak_scenario()
            .unwrap();

        assert_eq!(report.handles, 3);
        assert_eq!(report.released_before_collect, 0);
        assert_eq!(report.collected, None);
        assert_eq!(report.outcome, LeakOutcome::Leaked);
        assert_eq!(ledger.snapshot().destroyed, 0);
        assert_eq!(ledger.snapshot().live, 3);
    }

    #[test]
    fn forced_collection_reclaims() {
        let ledger = LifecycleLedger::default();
        let report = probe(&ledger, 3, Reclamation::Forced)
            .run_leak_scenario()
            .unwrap();

        assert_eq!(report.released_before_collect, 0);
        assert_eq!(report.collected, Some(3));
        assert_eq!(report.released_after_collect, Some(3));
        assert_eq!(report.outcome, LeakOutcome::Reclaimed);
        assert_eq!(ledger.snapshot().destroyed, 3);
    }

    #[test]
    fn self_cycle_of_one() {
        let ledger = LifecycleLedger::default();
        let report = probe(&ledger, 1, Reclamation::Forced)
            .run_leak_scenario()
            .unwrap();
        assert_eq!(report.outcome, LeakOutcome::Reclaimed);
    }

    #[test]
    fn late_collection_still_reclaims() {
        let ledger = LifecycleLedger::default();
        let probe = probe(&ledger, 2, Reclamation::Disabled);
        probe.run_leak_scenario().unwrap();
        assert_eq!(probe.collector().pending(), 2);

        assert_eq!(probe.collector().collect(), 2);
        assert_eq!(probe.collector().pending(), 0);
        assert_eq!(ledger.snapshot().destroyed, 2);
    }

    #[test]
    fn empty_probe_is_rejected() {
        let ledger = LifecycleLedger::default();
        let err = probe(&ledger, 0, Reclamation::Forced)
            .run_leak_scenario()
            .unwrap_err();

        assert!(matches!(err, LifecycleError::Construction { .. }));
        assert_eq!(ledger.snapshot().constructed, 0);
    }

    #[test]
    fn construction_failure_is_reported() {
        let ledger = LifecycleLedger::new(crate::ledger::LedgerConfig::default().with_max_live(1));
        let err = probe(&ledger, 2, Reclamation::Forced)
            .run_leak_scenario()
            .unwrap_err();
        assert!(matches!(err, LifecycleError::Construction { .. }));
    }
}
