// ledger.rs

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use pyo3::prelude::*;

use crate::errors::LifecycleError;
use crate::resource::ResourceId;

const DEFAULT_EVENT_CAPACITY: usize = 4096;

/// Why a native resource was destroyed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReleasePath {
    /// `NativeResource::destroy` called by native code with no handle involved.
    Direct,
    /// `OwnershipHandle::release`.
    Explicit,
    ScopeExit,
    ContextExit,
    /// The handle was dropped (or reclaimed by the host) without being released.
    Finalizer,
    /// The bare resource was dropped while still alive.
    NativeDrop,
}

impl fmt::Display for ReleasePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ReleasePath::Direct => "direct",
            ReleasePath::Explicit => "explicit",
            ReleasePath::ScopeExit => "scope-exit",
            ReleasePath::ContextExit => "context-exit",
            ReleasePath::Finalizer => "finalizer",
            ReleasePath::NativeDrop => "native-drop",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    Constructed { name: String },
    Destroyed { path: ReleasePath },
}

/// One recorded lifecycle transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleEvent {
    pub ordinal: u64,
    pub resource: ResourceId,
    pub kind: EventKind,
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            EventKind::Constructed { name } => {
                write!(f, "#{} construct {} ({})", self.ordinal, self.resource, name)
            }
            EventKind::Destroyed { path } => {
                write!(f, "#{} destroy {} via {}", self.ordinal, self.resource, path)
            }
        }
    }
}

/// Ledger settings.
///
/// The process-wide ledger reads these from the environment once, on first use:
///
/// * `HANDLEBRIDGE_MAX_LIVE` – maximum number of simultaneously alive resources.
/// * `HANDLEBRIDGE_RECORD_EVENTS` – `0`/`false` turns the event log off.
/// * `HANDLEBRIDGE_EVENT_CAPACITY` – how many events the log retains.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerConfig {
    pub max_live: Option<usize>,
    pub record_events: bool,
    pub event_capacity: usize,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        LedgerConfig {
            max_live: None,
            record_events: true,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl LedgerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup. Unparseable values are
    /// logged and the default is kept.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = LedgerConfig::default();

        if let Some(raw) = lookup("HANDLEBRIDGE_MAX_LIVE") {
            match raw.trim().parse::<usize>() {
                Ok(limit) => config.max_live = Some(limit),
                Err(_) => tracing::warn!(value = %raw, "ignoring invalid HANDLEBRIDGE_MAX_LIVE"),
            }
        }

        if let Some(raw) = lookup("HANDLEBRIDGE_RECORD_EVENTS") {
            match raw.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => config.record_events = true,
                "0" | "false" | "no" | "off" => config.record_events = false,
                _ => tracing::warn!(value = %raw, "ignoring invalid HANDLEBRIDGE_RECORD_EVENTS"),
            }
        }

        if let Some(raw) = lookup("HANDLEBRIDGE_EVENT_CAPACITY") {
            match raw.trim().parse::<usize>() {
                Ok(capacity) => config.event_capacity = capacity,
                Err(_) => {
                    tracing::warn!(value = %raw, "ignoring invalid HANDLEBRIDGE_EVENT_CAPACITY")
                }
            }
        }

        config
    }

    pub fn with_max_live(mut self, limit: usize) -> Self {
        self.max_live = Some(limit);
        self
    }

    pub fn without_events(mut self) -> Self {
        self.record_events = false;
        self
    }
}

struct LedgerInner {
    config: LedgerConfig,
    clock: AtomicU64,
    next_id: AtomicU64,
    constructed: AtomicU64,
    destroyed: AtomicU64,
    live: AtomicUsize,
    events: Mutex<VecDeque<LifecycleEvent>>,
}

/// Counters, a logical clock and an event log for native resource transitions.
///
/// Cloning is cheap and every clone observes the same state. Only
/// [`NativeResource`](crate::NativeResource) writes to it.
#[derive(Clone)]
pub struct LifecycleLedger {
    inner: Arc<LedgerInner>,
}

impl fmt::Debug for LifecycleLedger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleLedger")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

impl Default for LifecycleLedger {
    fn default() -> Self {
        LifecycleLedger::new(LedgerConfig::default())
    }
}

impl LifecycleLedger {
    pub fn new(config: LedgerConfig) -> Self {
        LifecycleLedger {
            inner: Arc::new(LedgerInner {
                config,
                clock: AtomicU64::new(0),
                next_id: AtomicU64::new(1),
                constructed: AtomicU64::new(0),
                destroyed: AtomicU64::new(0),
                live: AtomicUsize::new(0),
                events: Mutex::new(VecDeque::new()),
            }),
        }
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.inner.config
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            constructed: self.inner.constructed.load(Ordering::Acquire),
            destroyed: self.inner.destroyed.load(Ordering::Acquire),
            live: self.inner.live.load(Ordering::Acquire),
            clock: self.inner.clock.load(Ordering::Acquire),
        }
    }

    /// The retained event log, oldest first.
    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.inner.events.lock().iter().cloned().collect()
    }

    pub fn events_for(&self, resource: ResourceId) -> Vec<LifecycleEvent> {
        self.inner
            .events
            .lock()
            .iter()
            .filter(|event| event.resource == resource)
            .cloned()
            .collect()
    }

    fn tick(&self) -> u64 {
        self.inner.clock.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Reserve a live slot and stamp a construction. Fails without touching
    /// any counter when the live limit is reached.
    pub(crate) fn record_construction(
        &self,
        name: &str,
    ) -> Result<(ResourceId, u64), LifecycleError> {
        let limit = self.inner.config.max_live;
        self.inner
            .live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| match limit {
                Some(max) if live >= max => None,
                _ => Some(live + 1),
            })
            .map_err(|live| {
                LifecycleError::construction(
                    name,
                    format!("live resource limit reached ({live} alive)"),
                )
            })?;

        let id = ResourceId::from_raw(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let ordinal = self.tick();
        self.inner.constructed.fetch_add(1, Ordering::AcqRel);
        self.push(LifecycleEvent {
            ordinal,
            resource: id,
            kind: EventKind::Constructed {
                name: name.to_string(),
            },
        });
        Ok((id, ordinal))
    }

    pub(crate) fn record_destruction(&self, resource: ResourceId, path: ReleasePath) -> u64 {
        let ordinal = self.tick();
        self.inner.destroyed.fetch_add(1, Ordering::AcqRel);
        self.inner.live.fetch_sub(1, Ordering::AcqRel);
        self.push(LifecycleEvent {
            ordinal,
            resource,
            kind: EventKind::Destroyed { path },
        });
        ordinal
    }

    fn push(&self, event: LifecycleEvent) {
        let config = &self.inner.config;
        if !config.record_events || config.event_capacity == 0 {
            return;
        }
        let mut events = self.inner.events.lock();
        if events.len() == config.event_capacity {
            events.pop_front();
        }
        events.push_back(event);
    }
}

static PROCESS_LEDGER: Lazy<LifecycleLedger> =
    Lazy::new(|| LifecycleLedger::new(LedgerConfig::from_env()));

/// The ledger shared by every object created from Python. It starts empty
/// when the module is first used and is never reset.
pub fn process_ledger() -> &'static LifecycleLedger {
    &PROCESS_LEDGER
}

/// A point-in-time copy of the ledger counters.
#[pyclass(name = "LedgerSnapshot", frozen, get_all)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LedgerSnapshot {
    pub constructed: u64,
    pub destroyed: u64,
    pub live: usize,
    pub clock: u64,
}

impl LedgerSnapshot {
    /// Constructions and destructions that happened between `earlier` and `self`.
    pub fn since(&self, earlier: &LedgerSnapshot) -> (u64, u64) {
        (
            self.constructed.saturating_sub(earlier.constructed),
            self.destroyed.saturating_sub(earlier.destroyed),
        )
    }
}

#[pymethods]
impl LedgerSnapshot {
    fn __repr__(&self) -> String {
        format!(
            "LedgerSnapshot(constructed={}, destroyed={}, live={}, clock={})",
            self.constructed, self.destroyed, self.live, self.clock
        )
    }
}

/// Return the current counters of the process ledger.
#[pyfunction]
pub fn ledger_snapshot() -> LedgerSnapshot {
    process_ledger().snapshot()
}

/// Return the most recent lifecycle events as text, oldest first.
#[pyfunction]
#[pyo3(signature = (limit=None))]
pub fn recent_events(limit: Option<usize>) -> Vec<String> {
    let events = process_ledger().events();
    let skip = limit.map_or(0, |limit| events.len().saturating_sub(limit));
    events.iter().skip(skip).map(ToString::to_string).collect()
}

pub fn register_ledger(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<LedgerSnapshot>()?;
    m.add_function(wrap_pyfunction!(ledger_snapshot, m)?)?;
    m.add_function(wrap_pyfunction!(recent_events, m)?)?;
    Ok(())
}
