//! Completion queue assignment and dispatch.
//!
//! In active mode every device gets one [`CqProcessor`]: a completion queue shared by all queue
//! pairs on the device and a worker thread that demultiplexes completions by queue pair number.
//! In passive mode each endpoint owns a private queue and polls it itself.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use crossbeam::utils::Backoff;
use fnv::FnvHashMap as HashMap;

use rdma::ibv::{
    CompletionChannel, CompletionQueue, DeviceContext, VerbProvider, WorkCompletion,
};

use crate::config::{GroupConfig, NotifyMode};
use crate::error::{Error, Result};

/// Channel events acknowledged in one call.
const ACK_BATCH: u32 = 8;

/// Per-endpoint reaction to its own completions.
///
/// In active mode it runs on the processor's worker thread, so it should not block for long.
/// It may close its own endpoint.
pub trait CompletionHandler: Send + Sync {
    fn on_completion(&self, wc: &WorkCompletion);
}

impl<F> CompletionHandler for F
where
    F: Fn(&WorkCompletion) + Send + Sync,
{
    #[inline]
    fn on_completion(&self, wc: &WorkCompletion) {
        self(wc)
    }
}

/// The completion queue an endpoint's queue pair was created on.
#[derive(Clone)]
pub(crate) enum CqAssignment {
    /// Owned by the device's processor, completions arrive through the handler.
    Shared(Arc<CqProcessor>),
    /// Owned by the endpoint, the application polls it.
    Private(CompletionQueue),
}

impl CqAssignment {
    pub(crate) fn queue(&self) -> CompletionQueue {
        match self {
            CqAssignment::Shared(processor) => processor.cq(),
            CqAssignment::Private(cq) => *cq,
        }
    }
}

struct Registration {
    handler: Arc<dyn CompletionHandler>,
    live: AtomicBool,
    /// Held while the handler runs, so unregistering can wait out an in-flight dispatch.
    dispatching: Mutex<()>,
}

impl Registration {
    fn deliver(&self, wc: &WorkCompletion) {
        let _guard = self
            .dispatching
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if self.live.load(Ordering::Acquire) {
            self.handler.on_completion(wc);
        }
    }
}

struct Inner {
    verbs: Arc<dyn VerbProvider>,
    ctx: DeviceContext,
    cq: CompletionQueue,
    channel: Option<CompletionChannel>,
    table: spin::Mutex<HashMap<u32, Arc<Registration>>>,
    running: AtomicBool,
    /// Set when the processor was closed from its own worker, which then destroys the queues.
    release_on_exit: AtomicBool,
    poll_batch: usize,
    event_timeout: Duration,
}

/// One shared completion queue and the worker draining it.
pub struct CqProcessor {
    inner: Arc<Inner>,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_id: ThreadId,
}

impl CqProcessor {
    /// Create the queue (and its channel in blocking mode) on `ctx` and start the worker.
    pub fn start(
        verbs: Arc<dyn VerbProvider>,
        ctx: DeviceContext,
        config: &GroupConfig,
    ) -> Result<Self> {
        let channel = match config.notify {
            NotifyMode::Blocking => Some(verbs.create_comp_channel(ctx).map_err(Error::Ibv)?),
            NotifyMode::Polling => None,
        };
        let cq = match verbs.create_cq(ctx, config.cq_size, channel.as_ref()) {
            Ok(cq) => cq,
            Err(e) => {
                if let Some(channel) = channel {
                    let _ = verbs.destroy_comp_channel(&channel);
                }
                return Err(Error::Ibv(e));
            }
        };

        let inner = Arc::new(Inner {
            verbs,
            ctx,
            cq,
            channel,
            table: spin::Mutex::new(HashMap::default()),
            running: AtomicBool::new(true),
            release_on_exit: AtomicBool::new(false),
            poll_batch: config.poll_batch.max(1),
            event_timeout: config.cq_event_timeout(),
        });

        let worker_inner = Arc::clone(&inner);
        let handle = thread::Builder::new()
            .name(format!("cq-processor-{}", ctx.0))
            .spawn(move || worker_inner.mainloop());
        let handle = match handle {
            Ok(handle) => handle,
            Err(e) => {
                inner.running.store(false, Ordering::Release);
                let _ = inner.destroy_queues();
                return Err(Error::Ibv(e));
            }
        };
        tracing::debug!(?ctx, cq = %cq.handle, mode = ?config.notify, "cq processor started");

        Ok(CqProcessor {
            inner,
            worker_id: handle.thread().id(),
            worker: Mutex::new(Some(handle)),
        })
    }

    #[inline]
    pub fn device_context(&self) -> DeviceContext {
        self.inner.ctx
    }

    #[inline]
    pub fn cq(&self) -> CompletionQueue {
        self.inner.cq
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    pub fn registered(&self) -> usize {
        self.inner.table.lock().len()
    }

    /// Route completions of `qp_num` to `handler`.
    pub fn register(&self, qp_num: u32, handler: Arc<dyn CompletionHandler>) -> Result<()> {
        let mut table = self.inner.table.lock();
        if table.contains_key(&qp_num) {
            return Err(Error::Exists);
        }
        table.insert(
            qp_num,
            Arc::new(Registration {
                handler,
                live: AtomicBool::new(true),
                dispatching: Mutex::new(()),
            }),
        );
        Ok(())
    }

    /// Stop routing completions of `qp_num`. Once this returns, the handler is not running and
    /// will not run again, except when called from the handler itself, in which case only future
    /// completions are suppressed.
    pub fn unregister(&self, qp_num: u32) -> bool {
        let reg = self.inner.table.lock().remove(&qp_num);
        let Some(reg) = reg else {
            return false;
        };
        reg.live.store(false, Ordering::Release);
        if thread::current().id() != self.worker_id {
            drop(reg.dispatching.lock());
        }
        true
    }

    /// Stop the worker, then destroy the queue and its channel. Idempotent.
    ///
    /// Called from a handler, the queues outlive the call: the worker destroys them after the
    /// handler returns and its last events are acknowledged.
    pub fn close(&self) -> Result<()> {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        if thread::current().id() == self.worker_id {
            self.inner.release_on_exit.store(true, Ordering::Release);
            self.inner.table.lock().clear();
            tracing::debug!(ctx = ?self.inner.ctx, "cq processor closed from its worker");
            return Ok(());
        }
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::warn!(ctx = ?self.inner.ctx, "cq processor worker panicked");
            }
        }
        self.inner.table.lock().clear();
        let res = self.inner.destroy_queues();
        tracing::debug!(ctx = ?self.inner.ctx, "cq processor closed");
        res
    }
}

impl Drop for CqProcessor {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!("closing cq processor: {}", e);
        }
    }
}

impl Inner {
    fn mainloop(&self) {
        let mut wcs = Vec::with_capacity(self.poll_batch);
        match self.channel {
            Some(channel) => self.run_blocking(&channel, &mut wcs),
            None => self.run_polling(&mut wcs),
        }
        if self.release_on_exit.load(Ordering::Acquire) {
            if let Err(e) = self.destroy_queues() {
                tracing::warn!(ctx = ?self.ctx, "destroying cq on worker exit: {}", e);
            }
        }
        tracing::trace!(ctx = ?self.ctx, "cq processor worker exits");
    }

    fn run_blocking(&self, channel: &CompletionChannel, wcs: &mut Vec<WorkCompletion>) {
        let mut unacked = 0;
        // arm before the first drain, anything arriving in between raises an event
        if let Err(e) = self.verbs.req_notify_cq(&self.cq, false) {
            tracing::warn!(ctx = ?self.ctx, "req_notify_cq: {}", e);
        }
        self.drain(wcs);

        while self.running.load(Ordering::Acquire) {
            match self.verbs.get_cq_event(channel, self.event_timeout) {
                Ok(Some(_cq)) => {
                    unacked += 1;
                    if unacked >= ACK_BATCH {
                        self.verbs.ack_cq_events(&self.cq, unacked);
                        unacked = 0;
                    }
                    if let Err(e) = self.verbs.req_notify_cq(&self.cq, false) {
                        tracing::warn!(ctx = ?self.ctx, "req_notify_cq: {}", e);
                    }
                    self.drain(wcs);
                }
                Ok(None) => {}
                Err(e) => {
                    if !self.running.load(Ordering::Acquire) {
                        break;
                    }
                    tracing::warn!(ctx = ?self.ctx, "get_cq_event: {}", e);
                    thread::sleep(self.event_timeout);
                }
            }
        }

        if unacked > 0 {
            self.verbs.ack_cq_events(&self.cq, unacked);
        }
    }

    fn run_polling(&self, wcs: &mut Vec<WorkCompletion>) {
        let backoff = Backoff::new();
        while self.running.load(Ordering::Acquire) {
            if self.drain(wcs) > 0 {
                backoff.reset();
            } else {
                backoff.snooze();
            }
        }
    }

    /// Poll until the queue is empty; one notification may stand for many completions.
    fn drain(&self, wcs: &mut Vec<WorkCompletion>) -> usize {
        let mut total = 0;
        loop {
            wcs.clear();
            match self.verbs.poll_cq(&self.cq, self.poll_batch, wcs) {
                Ok(0) => return total,
                Ok(n) => {
                    total += n;
                    for wc in wcs.iter() {
                        self.dispatch(wc);
                    }
                    if !self.running.load(Ordering::Acquire) {
                        return total;
                    }
                }
                Err(e) => {
                    if self.running.load(Ordering::Acquire) {
                        tracing::warn!(ctx = ?self.ctx, "poll_cq: {}", e);
                    }
                    return total;
                }
            }
        }
    }

    fn dispatch(&self, wc: &WorkCompletion) {
        let reg = self.table.lock().get(&wc.qp_num).cloned();
        match reg {
            Some(reg) => reg.deliver(wc),
            None => tracing::trace!(
                qp_num = wc.qp_num,
                wr_id = wc.wr_id,
                "dropping completion of an unregistered queue pair"
            ),
        }
    }

    /// The queue goes first, the channel cannot be destroyed while a queue is attached to it.
    fn destroy_queues(&self) -> Result<()> {
        let mut res = self.verbs.destroy_cq(&self.cq).map_err(Error::Ibv);
        if let Some(channel) = &self.channel {
            if let Err(e) = self.verbs.destroy_comp_channel(channel) {
                res = res.and(Err(Error::Ibv(e)));
            }
        }
        res
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Weak;
    use std::time::Instant;

    use rdma::ibv::{QpCapability, QpInitAttr, QpType, QueuePair, RecvWr, SendWr, Sge};
    use rdma::loopback::Fabric;
    use rdma::rdmacm::{CmId, ConnParam, ConnectionProvider, EventChannel, PortSpace};

    use super::*;

    struct Wire {
        fabric: Arc<Fabric>,
        ids: [CmId; 2],
        client_qp: QueuePair,
        server_qp: QueuePair,
    }

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        cond()
    }

    fn next_request(fabric: &Fabric, channel: &EventChannel) -> CmId {
        loop {
            let ev = fabric
                .get_cm_event(channel, Duration::from_secs(1))
                .unwrap()
                .unwrap();
            let req = ev.get_request();
            fabric.ack_cm_event(ev).unwrap();
            if let Some((id, _)) = req {
                return id;
            }
        }
    }

    /// Connect two queue pairs over `processor`'s shared queue without the endpoint layer.
    fn wire(fabric: Arc<Fabric>, ctx: DeviceContext, processor: &CqProcessor) -> Wire {
        let channel = fabric.create_event_channel().unwrap();
        let addr: SocketAddr = "10.0.0.1:9000".parse().unwrap();
        let listener = fabric.create_id(&channel, PortSpace::Tcp).unwrap();
        fabric.bind_addr(&listener, &addr).unwrap();
        fabric.listen(&listener, 4).unwrap();
        let client = fabric.create_id(&channel, PortSpace::Tcp).unwrap();
        fabric.resolve_addr(&client, None, &addr, 10).unwrap();
        fabric.resolve_route(&client, 10).unwrap();

        let pd = fabric.alloc_pd(ctx).unwrap();
        let attr = QpInitAttr::with_cq(processor.cq(), QpCapability::default(), QpType::RC);
        let client_qp = fabric.create_qp(&client, &pd, &attr).unwrap();
        fabric.connect(&client, &ConnParam::default()).unwrap();
        let server = next_request(&fabric, &channel);
        let server_qp = fabric.create_qp(&server, &pd, &attr).unwrap();
        fabric.accept(&server, &ConnParam::default()).unwrap();
        Wire {
            fabric,
            ids: [client, server],
            client_qp,
            server_qp,
        }
    }

    fn sge() -> Vec<Sge> {
        vec![Sge {
            addr: 0,
            length: 8,
            lkey: 0,
        }]
    }

    fn setup(notify: NotifyMode) -> (Arc<Fabric>, DeviceContext, CqProcessor) {
        let fabric = Arc::new(Fabric::new());
        let ctx = fabric.add_device(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));
        let config = GroupConfig {
            notify,
            cq_event_timeout_ms: 10,
            ..Default::default()
        };
        let processor = CqProcessor::start(fabric.clone(), ctx, &config).unwrap();
        (fabric, ctx, processor)
    }

    fn counter() -> (Arc<AtomicUsize>, Arc<dyn CompletionHandler>) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let handler: Arc<dyn CompletionHandler> = Arc::new(move |_wc: &WorkCompletion| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        (count, handler)
    }

    #[test]
    fn dispatches_by_qp_num() {
        for notify in [NotifyMode::Blocking, NotifyMode::Polling] {
            let (fabric, ctx, processor) = setup(notify);
            let w = wire(fabric, ctx, &processor);
            let (client_count, client_handler) = counter();
            let (server_count, server_handler) = counter();
            processor.register(w.client_qp.qp_num, client_handler).unwrap();
            processor.register(w.server_qp.qp_num, server_handler).unwrap();

            unsafe {
                w.fabric
                    .post_recv(&w.server_qp, &[RecvWr::new(1, sge()), RecvWr::new(2, sge())])
                    .unwrap();
                w.fabric
                    .post_send(&w.client_qp, &[SendWr::send(3, sge()), SendWr::send(4, sge())])
                    .unwrap();
            }
            assert!(wait_for(|| client_count.load(Ordering::SeqCst) == 2));
            assert!(wait_for(|| server_count.load(Ordering::SeqCst) == 2));
            processor.unregister(w.client_qp.qp_num);
            processor.unregister(w.server_qp.qp_num);
        }
    }

    #[test]
    fn no_delivery_after_unregister() {
        let (fabric, ctx, processor) = setup(NotifyMode::Blocking);
        let w = wire(fabric, ctx, &processor);
        let (count, handler) = counter();
        processor.register(w.client_qp.qp_num, handler).unwrap();
        assert!(processor.unregister(w.client_qp.qp_num));
        assert!(!processor.unregister(w.client_qp.qp_num));
        unsafe {
            w.fabric
                .post_send(&w.client_qp, &[SendWr::send(1, sge())])
                .unwrap();
        }
        // the completion is consumed and dropped
        let mut wcs = Vec::new();
        assert!(wait_for(|| {
            wcs.clear();
            w.fabric.poll_cq(&processor.cq(), 8, &mut wcs).unwrap() == 0
        }));
        thread::sleep(Duration::from_millis(30));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn duplicate_registration() {
        let (_fabric, _ctx, processor) = setup(NotifyMode::Polling);
        let (_, handler) = counter();
        processor.register(7, Arc::clone(&handler)).unwrap();
        assert!(matches!(processor.register(7, handler), Err(Error::Exists)));
        assert_eq!(processor.registered(), 1);
    }

    #[test]
    fn close_tears_down_queue_and_channel() {
        let (fabric, _ctx, processor) = setup(NotifyMode::Blocking);
        assert!(processor.is_running());
        processor.close().unwrap();
        processor.close().unwrap();
        assert!(!processor.is_running());
        let stats = fabric.stats();
        assert_eq!(stats.cqs_created, stats.cqs_destroyed);
        assert_eq!(stats.comp_channels_created, stats.comp_channels_destroyed);
    }

    #[test]
    fn handler_may_close_the_processor() {
        let (fabric, ctx, processor) = setup(NotifyMode::Blocking);
        let processor = Arc::new(processor);
        let w = wire(fabric.clone(), ctx, &processor);

        let closed = Arc::new(AtomicBool::new(false));
        let weak: Weak<CqProcessor> = Arc::downgrade(&processor);
        let (f, c, ids) = (fabric.clone(), Arc::clone(&closed), w.ids);
        let handler: Arc<dyn CompletionHandler> = Arc::new(move |_wc: &WorkCompletion| {
            for id in &ids {
                f.destroy_qp(id).unwrap();
            }
            if let Some(processor) = weak.upgrade() {
                processor.close().unwrap();
                c.store(true, Ordering::SeqCst);
            }
        });
        processor.register(w.client_qp.qp_num, handler).unwrap();
        unsafe {
            w.fabric
                .post_send(&w.client_qp, &[SendWr::send(1, sge())])
                .unwrap();
        }

        assert!(wait_for(|| closed.load(Ordering::SeqCst)));
        assert!(!processor.is_running());
        assert_eq!(processor.registered(), 0);
        // the worker releases the queues once the handler has returned
        assert!(wait_for(|| fabric.stats().comp_channels_destroyed == 1));
        let stats = fabric.stats();
        assert_eq!(stats.cqs_destroyed, 1);
        assert_eq!(stats.cq_events_acked, 1);
        processor.close().unwrap();
        assert_eq!(fabric.stats().cqs_destroyed, 1);
    }
}
