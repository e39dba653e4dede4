//! The connection manager event loop.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use rdma::rdmacm::{CmEvent, ConnectionProvider, EventChannel};

use crate::error::{Error, Result};

/// Where the processor routes the events it receives.
pub(crate) trait CmEventSink: Send + Sync {
    fn dispatch_cm_event(&self, event: &CmEvent) -> Result<()>;

    /// Once the owner is closed, a failing channel ends the loop instead of being retried.
    fn is_closed(&self) -> bool;
}

struct Inner {
    cm: Arc<dyn ConnectionProvider>,
    channel: EventChannel,
    sink: Arc<dyn CmEventSink>,
    running: AtomicBool,
    /// Set when the processor was closed from its own worker, which then destroys the channel.
    release_on_exit: AtomicBool,
    timeout: Duration,
}

/// Owns the event channel of a group and the worker polling it.
pub(crate) struct CmProcessor {
    inner: Arc<Inner>,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_id: ThreadId,
}

impl CmProcessor {
    /// Start polling `channel`. The processor takes ownership of the channel and destroys it on
    /// close.
    pub(crate) fn start(
        cm: Arc<dyn ConnectionProvider>,
        channel: EventChannel,
        sink: Arc<dyn CmEventSink>,
        timeout: Duration,
    ) -> Result<Self> {
        let inner = Arc::new(Inner {
            cm,
            channel,
            sink,
            running: AtomicBool::new(true),
            release_on_exit: AtomicBool::new(false),
            timeout,
        });
        let worker_inner = Arc::clone(&inner);
        let handle = thread::Builder::new()
            .name(format!("cm-processor-{}", channel.0))
            .spawn(move || worker_inner.mainloop())
            .map_err(Error::RdmaCm)?;
        tracing::debug!(channel = %channel.0, "cm processor started");
        Ok(CmProcessor {
            inner,
            worker_id: handle.thread().id(),
            worker: Mutex::new(Some(handle)),
        })
    }

    #[inline]
    pub(crate) fn channel(&self) -> EventChannel {
        self.inner.channel
    }

    #[inline]
    pub(crate) fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Stop and join the worker, then destroy the channel. Idempotent.
    ///
    /// Called while dispatching, the worker destroys the channel after acking the current event.
    pub(crate) fn close(&self) -> Result<()> {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        if thread::current().id() == self.worker_id {
            self.inner.release_on_exit.store(true, Ordering::Release);
            tracing::debug!(channel = %self.inner.channel.0, "cm processor closed from its worker");
            return Ok(());
        }
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::warn!("cm processor worker panicked");
            }
        }
        let res = self
            .inner
            .cm
            .destroy_event_channel(&self.inner.channel)
            .map_err(Error::RdmaCm);
        tracing::debug!(channel = %self.inner.channel.0, "cm processor closed");
        res
    }
}

impl Inner {
    fn mainloop(&self) {
        while self.running.load(Ordering::Acquire) {
            match self.cm.get_cm_event(&self.channel, self.timeout) {
                Ok(Some(event)) => {
                    tracing::trace!("cm event: {}", event);
                    if let Err(e) = self.sink.dispatch_cm_event(&event) {
                        tracing::warn!("dispatching {}: {}", event, e);
                    }
                    if let Err(e) = self.cm.ack_cm_event(event) {
                        tracing::warn!("ack_cm_event: {}", e);
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    if !self.running.load(Ordering::Acquire) || self.sink.is_closed() {
                        break;
                    }
                    tracing::warn!("get_cm_event: {}", e);
                    thread::sleep(self.timeout);
                }
            }
        }
        if self.release_on_exit.load(Ordering::Acquire) {
            if let Err(e) = self.cm.destroy_event_channel(&self.channel) {
                tracing::warn!("destroying event channel on worker exit: {}", e);
            }
        }
        tracing::trace!("cm processor worker exits");
    }
}
