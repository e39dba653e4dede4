use std::fmt;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use rdma::rdmacm::CmEventKind;

use crate::error::Failure;

/// Connection state of an endpoint. The order of the variants is the order an endpoint moves
/// through them; a state is never re-entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EndpointState {
    Initialized,
    AddrResolved,
    RouteResolved,
    ResourcesAllocated,
    Connected,
    Closed,
}

impl fmt::Display for EndpointState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug)]
struct Inner {
    state: EndpointState,
    /// The last error event nobody has waited for yet.
    failure: Option<(CmEventKind, i32)>,
}

/// A state cell the CM event thread advances and application threads block on.
#[derive(Debug)]
pub(crate) struct StateMonitor {
    inner: Mutex<Inner>,
    cond: Condvar,
}

impl Default for StateMonitor {
    fn default() -> Self {
        StateMonitor {
            inner: Mutex::new(Inner {
                state: EndpointState::Initialized,
                failure: None,
            }),
            cond: Condvar::new(),
        }
    }
}

impl StateMonitor {
    #[inline]
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[inline]
    pub(crate) fn get(&self) -> EndpointState {
        self.lock().state
    }

    /// Move forward to `target`. Returns false, leaving the state untouched, if the endpoint is
    /// already at or past it.
    pub(crate) fn advance(&self, target: EndpointState) -> bool {
        let mut inner = self.lock();
        if target <= inner.state {
            return false;
        }
        inner.state = target;
        self.cond.notify_all();
        true
    }

    /// Record an error event for the pending step.
    pub(crate) fn fail(&self, kind: CmEventKind, status: i32) {
        let mut inner = self.lock();
        inner.failure = Some((kind, status));
        self.cond.notify_all();
    }

    pub(crate) fn clear_failure(&self) {
        self.lock().failure = None;
    }

    /// Block until the state reaches `target`, an error event is recorded, or `timeout` elapses.
    /// Reaching `Closed` while waiting for an earlier state is a failure.
    pub(crate) fn wait_until(
        &self,
        target: EndpointState,
        timeout: Duration,
    ) -> Result<(), Failure> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.lock();
        loop {
            if inner.state == EndpointState::Closed && target != EndpointState::Closed {
                return Err(Failure::Closed);
            }
            if inner.state >= target {
                return Ok(());
            }
            if let Some((kind, status)) = inner.failure.take() {
                return Err(Failure::Event { kind, status });
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Failure::Timeout);
            }
            inner = self
                .cond
                .wait_timeout(inner, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|e| e.into_inner().0);
        }
    }
}
