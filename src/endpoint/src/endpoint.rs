use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use rdma::ibv::{
    DeviceContext, ProtectionDomain, QpInitAttr, QueuePair, RecvWr, SendWr, WorkCompletion,
};
use rdma::mr::{AccessFlags, MemoryRegion};
use rdma::rdmacm::{CmEvent, CmEventKind, CmId};

use crate::cq::{CompletionHandler, CqAssignment};
use crate::error::{Error, Result};
use crate::group::Shared;
use crate::state::{EndpointState, StateMonitor};

/// What an endpoint holds once its queue pair exists.
struct Resources {
    pd: ProtectionDomain,
    qp: QueuePair,
    cq: CqAssignment,
}

/// A connected (or connecting) RDMA endpoint.
///
/// Created by [`EndpointGroup::create_endpoint`](crate::EndpointGroup::create_endpoint) on the
/// active side, or handed out by [`ServerEndpoint::accept`](crate::ServerEndpoint::accept) on
/// the passive side.
pub struct Endpoint {
    id: CmId,
    server_side: bool,
    group: Weak<Shared>,
    monitor: StateMonitor,
    handler: Arc<dyn CompletionHandler>,
    resources: spin::Mutex<Option<Resources>>,
    /// Serializes connect and accept.
    op: Mutex<()>,
    released: AtomicBool,
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("id", &self.id)
            .field("server_side", &self.server_side)
            .field("state", &self.state())
            .field("qp_num", &self.qp_num())
            .finish()
    }
}

impl Endpoint {
    pub(crate) fn new(
        id: CmId,
        server_side: bool,
        group: Weak<Shared>,
        handler: Arc<dyn CompletionHandler>,
    ) -> Self {
        Endpoint {
            id,
            server_side,
            group,
            monitor: StateMonitor::default(),
            handler,
            resources: spin::Mutex::new(None),
            op: Mutex::new(()),
            released: AtomicBool::new(false),
        }
    }

    #[inline]
    fn shared(&self) -> Result<Arc<Shared>> {
        self.group.upgrade().ok_or(Error::AlreadyClosed)
    }

    #[inline]
    pub fn id(&self) -> CmId {
        self.id
    }

    #[inline]
    pub fn state(&self) -> EndpointState {
        self.monitor.get()
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.state() == EndpointState::Connected
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.state() == EndpointState::Closed
    }

    /// True for endpoints produced by a server's accept.
    #[inline]
    pub fn is_server_side(&self) -> bool {
        self.server_side
    }

    pub fn qp_num(&self) -> Option<u32> {
        self.resources.lock().as_ref().map(|r| r.qp.qp_num)
    }

    pub fn queue_pair(&self) -> Result<QueuePair> {
        self.resources
            .lock()
            .as_ref()
            .map(|r| r.qp)
            .ok_or(Error::NoQueuePair)
    }

    pub(crate) fn protection_domain(&self) -> Option<ProtectionDomain> {
        self.resources.lock().as_ref().map(|r| r.pd)
    }

    pub fn device_context(&self) -> Option<DeviceContext> {
        self.shared().ok()?.cm.device_context(&self.id)
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.shared()?.cm.local_addr(&self.id).map_err(Error::RdmaCm)
    }

    pub fn peer_addr(&self) -> Result<SocketAddr> {
        self.shared()?.cm.peer_addr(&self.id).map_err(Error::RdmaCm)
    }

    /// Connect to `addr`. Each step (address resolution, route resolution, establishment) may
    /// take up to `timeout`.
    pub fn connect(&self, addr: SocketAddr, timeout: Duration) -> Result<()> {
        self.connect_with(addr, timeout, None)
    }

    /// Like [`connect`](Self::connect), carrying `private_data` in the connect request.
    pub fn connect_with(
        &self,
        addr: SocketAddr,
        timeout: Duration,
        private_data: Option<Vec<u8>>,
    ) -> Result<()> {
        let _op = self.op.lock().unwrap_or_else(PoisonError::into_inner);
        match self.state() {
            _ if self.released.load(Ordering::Acquire) => return Err(Error::AlreadyClosed),
            EndpointState::Closed => return Err(Error::AlreadyClosed),
            EndpointState::Initialized => {}
            _ => return Err(Error::AlreadyConnected),
        }
        let shared = self.shared()?;
        let config = &shared.config;
        tracing::debug!(id = %self.id, %addr, "connecting");

        self.monitor.clear_failure();
        shared
            .cm
            .resolve_addr(&self.id, None, &addr, config.resolve_timeout_ms)
            .map_err(Error::RdmaCm)?;
        self.monitor
            .wait_until(EndpointState::AddrResolved, timeout)
            .map_err(Error::AddressResolutionFailed)?;

        shared
            .cm
            .resolve_route(&self.id, config.resolve_timeout_ms)
            .map_err(Error::RdmaCm)?;
        self.monitor
            .wait_until(EndpointState::RouteResolved, timeout)
            .map_err(Error::RouteResolutionFailed)?;

        self.allocate_resources(&shared)
            .map_err(|e| Error::ResourceAllocationFailed(Box::new(e)))?;

        let param = config.conn.to_conn_param(private_data);
        shared.cm.connect(&self.id, &param).map_err(Error::RdmaCm)?;
        self.monitor
            .wait_until(EndpointState::Connected, timeout)
            .map_err(Error::ConnectFailed)?;

        tracing::debug!(id = %self.id, %addr, qp_num = ?self.qp_num(), "connected");
        Ok(())
    }

    /// The passive half of the handshake, driven by the server's accept.
    pub(crate) fn accept_connection(&self, shared: &Shared, timeout: Duration) -> Result<()> {
        let _op = self.op.lock().unwrap_or_else(PoisonError::into_inner);
        if self.released.load(Ordering::Acquire) || self.is_closed() {
            return Err(Error::AlreadyClosed);
        }
        if self.state() != EndpointState::Initialized {
            return Err(Error::AlreadyConnected);
        }
        self.monitor.clear_failure();
        self.allocate_resources(shared)
            .map_err(|e| Error::ResourceAllocationFailed(Box::new(e)))?;

        let param = shared.config.conn.to_conn_param(None);
        shared.cm.accept(&self.id, &param).map_err(Error::RdmaCm)?;
        self.monitor
            .wait_until(EndpointState::Connected, timeout)
            .map_err(Error::AcceptFailed)?;
        tracing::debug!(id = %self.id, qp_num = ?self.qp_num(), "accepted");
        Ok(())
    }

    /// Protection domain, completion queue and queue pair, then `ResourcesAllocated`.
    fn allocate_resources(&self, shared: &Shared) -> Result<()> {
        if shared.is_closed() {
            return Err(Error::AlreadyClosed);
        }
        let ctx = shared
            .cm
            .device_context(&self.id)
            .ok_or(Error::NoDeviceContext)?;
        let pd = shared.create_protection_domain(ctx)?;
        let cq = shared.assign_cq(ctx)?;

        let config = &shared.config;
        let mut attr = QpInitAttr::with_cq(cq.queue(), config.qp_cap, config.qp_type);
        attr.sq_sig_all = config.sq_sig_all;
        let qp = match shared.cm.create_qp(&self.id, &pd, &attr) {
            Ok(qp) => qp,
            Err(e) => {
                release_cq(shared, &cq);
                return Err(Error::RdmaCm(e));
            }
        };

        let undo = |shared: &Shared| {
            if let Err(e) = shared.cm.destroy_qp(&self.id) {
                tracing::warn!(id = %self.id, "destroy_qp: {}", e);
            }
            release_cq(shared, &cq);
        };
        if let CqAssignment::Shared(processor) = &cq {
            if let Err(e) = processor.register(qp.qp_num, Arc::clone(&self.handler)) {
                undo(shared);
                return Err(e);
            }
        }

        {
            let mut resources = self.resources.lock();
            if self.released.load(Ordering::Acquire) {
                drop(resources);
                if let CqAssignment::Shared(processor) = &cq {
                    processor.unregister(qp.qp_num);
                }
                undo(shared);
                return Err(Error::AlreadyClosed);
            }
            *resources = Some(Resources {
                pd,
                qp,
                cq: cq.clone(),
            });
        }
        self.monitor.advance(EndpointState::ResourcesAllocated);
        tracing::debug!(id = %self.id, ?ctx, qp_num = qp.qp_num, "resources allocated");
        Ok(())
    }

    /// Apply a connection manager event addressed to this endpoint.
    pub(crate) fn handle_event(&self, event: &CmEvent) {
        let kind = event.kind();
        match kind {
            CmEventKind::AddrResolved => {
                self.monitor.advance(EndpointState::AddrResolved);
            }
            CmEventKind::RouteResolved => {
                self.monitor.advance(EndpointState::RouteResolved);
            }
            CmEventKind::Established | CmEventKind::ConnectResponse => {
                self.monitor.advance(EndpointState::Connected);
            }
            CmEventKind::Disconnected | CmEventKind::DeviceRemoval => {
                self.monitor.advance(EndpointState::Closed);
            }
            k if k.is_error() => {
                tracing::debug!(id = %self.id, "{}", event);
                self.monitor.fail(k, event.status());
            }
            _ => tracing::trace!(id = %self.id, "ignoring {}", event),
        }
    }

    /// Register `buf` with the protection domain of this endpoint's device. The region does not
    /// borrow `buf`; the caller keeps it alive until the region is deregistered.
    pub fn register_memory(&self, buf: &[u8], access: AccessFlags) -> Result<MemoryRegion> {
        let shared = self.shared()?;
        let pd = match self.protection_domain() {
            Some(pd) => pd,
            None => {
                let ctx = shared
                    .cm
                    .device_context(&self.id)
                    .ok_or(Error::NoDeviceContext)?;
                shared.create_protection_domain(ctx)?
            }
        };
        shared
            .verbs
            .reg_mr(&pd, buf.as_ptr() as u64, buf.len(), access)
            .map_err(Error::Ibv)
    }

    pub fn deregister_memory(&self, mr: &MemoryRegion) -> Result<()> {
        self.shared()?.verbs.dereg_mr(mr).map_err(Error::Ibv)
    }

    /// # Safety
    ///
    /// The memory referenced by the work requests can only be safely reused or dropped after the
    /// request is fully executed and a work completion has been retrieved.
    pub unsafe fn post_send(&self, wrs: &[SendWr]) -> Result<()> {
        let qp = self.queue_pair()?;
        self.shared()?.verbs.post_send(&qp, wrs).map_err(Error::Ibv)
    }

    /// # Safety
    ///
    /// Same as [`post_send`](Self::post_send).
    pub unsafe fn post_recv(&self, wrs: &[RecvWr]) -> Result<()> {
        let qp = self.queue_pair()?;
        self.shared()?.verbs.post_recv(&qp, wrs).map_err(Error::Ibv)
    }

    /// Poll the private completion queue. Only valid in passive mode; in active mode the queue
    /// belongs to the device's processor.
    pub fn poll_completions(&self, max: usize, wc: &mut Vec<WorkCompletion>) -> Result<usize> {
        let cq = match self.resources.lock().as_ref().map(|r| &r.cq) {
            Some(CqAssignment::Private(cq)) => *cq,
            Some(CqAssignment::Shared(_)) => return Err(Error::CompletionQueueShared),
            None => return Err(Error::NoQueuePair),
        };
        self.shared()?.verbs.poll_cq(&cq, max, wc).map_err(Error::Ibv)
    }

    /// Disconnect and release the queue pair and the identifier. Idempotent.
    pub fn close(&self) -> Result<()> {
        if self.released.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let Some(shared) = self.group.upgrade() else {
            self.monitor.advance(EndpointState::Closed);
            return Ok(());
        };

        let mut res = Ok(());
        if self.state() == EndpointState::Connected {
            match shared.cm.disconnect(&self.id) {
                Ok(()) => {
                    if let Err(f) = self
                        .monitor
                        .wait_until(EndpointState::Closed, shared.config.close_timeout())
                    {
                        tracing::debug!(id = %self.id, "waiting for disconnect: {}", f);
                    }
                }
                Err(e) => {
                    tracing::warn!(id = %self.id, "disconnect: {}", e);
                    res = Err(Error::RdmaCm(e));
                }
            }
        }
        self.monitor.advance(EndpointState::Closed);

        let resources = self.resources.lock().take();
        if let Some(resources) = resources {
            if let CqAssignment::Shared(processor) = &resources.cq {
                processor.unregister(resources.qp.qp_num);
            }
            if let Err(e) = shared.cm.destroy_qp(&self.id) {
                tracing::warn!(id = %self.id, "destroy_qp: {}", e);
                res = res.and(Err(Error::RdmaCm(e)));
            }
            release_cq(&shared, &resources.cq);
        }
        if let Err(e) = shared.cm.destroy_id(&self.id) {
            tracing::warn!(id = %self.id, "destroy_id: {}", e);
            res = res.and(Err(Error::RdmaCm(e)));
        }
        let _ = shared.clients.remove(&self.id);
        tracing::debug!(id = %self.id, "endpoint closed");
        res
    }
}

/// Private queues die with their endpoint; shared ones with the group.
fn release_cq(shared: &Shared, cq: &CqAssignment) {
    if let CqAssignment::Private(cq) = cq {
        if let Err(e) = shared.verbs.destroy_cq(cq) {
            tracing::warn!(cq = %cq.handle, "destroy_cq: {}", e);
        }
    }
}
