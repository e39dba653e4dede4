use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use rdma::ibv::{DeviceContext, ProtectionDomain, VerbProvider};
use rdma::rdmacm::{CmEvent, CmEventKind, CmId, ConnectionProvider, EventChannel, PortSpace};

use crate::cm::{CmEventSink, CmProcessor};
use crate::config::{CqMode, GroupConfig};
use crate::cq::{CompletionHandler, CqAssignment, CqProcessor};
use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::resource::ResourceTable;
use crate::server::ServerEndpoint;

/// Builds the completion handler of every endpoint a group creates.
pub trait EndpointFactory: Send + Sync {
    fn new_handler(&self, id: CmId, server_side: bool) -> Arc<dyn CompletionHandler>;
}

impl<F> EndpointFactory for F
where
    F: Fn(CmId, bool) -> Arc<dyn CompletionHandler> + Send + Sync,
{
    #[inline]
    fn new_handler(&self, id: CmId, server_side: bool) -> Arc<dyn CompletionHandler> {
        self(id, server_side)
    }
}

/// State shared by a group, its endpoints and its CM event processor.
pub(crate) struct Shared {
    me: Weak<Shared>,
    pub(crate) verbs: Arc<dyn VerbProvider>,
    pub(crate) cm: Arc<dyn ConnectionProvider>,
    pub(crate) config: GroupConfig,
    channel: EventChannel,
    factory: Arc<dyn EndpointFactory>,
    /// connection id -> endpoint, both active and passive side
    pub(crate) clients: ResourceTable<CmId, Endpoint>,
    /// listening id -> server endpoint
    pub(crate) servers: ResourceTable<CmId, ServerEndpoint>,
    pds: ResourceTable<DeviceContext, ProtectionDomain>,
    cq_processors: ResourceTable<DeviceContext, CqProcessor>,
    closed: AtomicBool,
}

impl fmt::Debug for Shared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shared")
            .field("channel", &self.channel)
            .field("clients", &self.clients.len())
            .field("servers", &self.servers.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Shared {
    #[inline]
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// The protection domain of `ctx`, allocated on first use.
    pub(crate) fn create_protection_domain(&self, ctx: DeviceContext) -> Result<ProtectionDomain> {
        let (pd, created) = self.pds.get_or_try_create(ctx, || {
            self.verbs.alloc_pd(ctx).map_err(Error::Ibv)
        })?;
        if created {
            tracing::debug!(?ctx, pd = %pd.handle, "protection domain allocated");
        }
        Ok(*pd)
    }

    /// Pick the completion queue for a new queue pair on `ctx` according to the group's mode.
    pub(crate) fn assign_cq(&self, ctx: DeviceContext) -> Result<CqAssignment> {
        match self.config.cq_mode {
            CqMode::Active => {
                let (processor, _) = self.cq_processors.get_or_try_create(ctx, || {
                    CqProcessor::start(Arc::clone(&self.verbs), ctx, &self.config)
                })?;
                Ok(CqAssignment::Shared(processor))
            }
            CqMode::Passive => {
                let cq = self
                    .verbs
                    .create_cq(ctx, self.config.cq_size, None)
                    .map_err(Error::Ibv)?;
                Ok(CqAssignment::Private(cq))
            }
        }
    }

    fn new_endpoint(&self, id: CmId, server_side: bool) -> Result<Arc<Endpoint>> {
        let handler = self.factory.new_handler(id, server_side);
        let endpoint = Arc::new(Endpoint::new(id, server_side, self.me.clone(), handler));
        self.clients.insert(id, Arc::clone(&endpoint))?;
        Ok(endpoint)
    }

    fn on_connect_request(&self, event: &CmEvent) -> Result<()> {
        let (id, listen_id) = event.get_request().ok_or(Error::UnknownEndpoint)?;
        let server = match self.servers.get(&listen_id) {
            Ok(server) => server,
            Err(_) => {
                tracing::warn!(%listen_id, conn = %id, "connect request for an unknown listener, dropped");
                return Ok(());
            }
        };
        let endpoint = self.new_endpoint(id, true)?;
        tracing::debug!(%listen_id, conn = %id, "connect request queued");
        server.on_connect_request(endpoint);
        Ok(())
    }
}

impl CmEventSink for Shared {
    fn dispatch_cm_event(&self, event: &CmEvent) -> Result<()> {
        let id = event.id();
        match event.kind() {
            CmEventKind::ConnectRequest => self.on_connect_request(event),
            CmEventKind::Disconnected => {
                if let Ok(endpoint) = self.clients.get(&id) {
                    endpoint.handle_event(event);
                } else if let Ok(server) = self.servers.get(&id) {
                    server.on_disconnected();
                } else {
                    tracing::debug!("{}: no endpoint, dropped", event);
                }
                Ok(())
            }
            _ => match self.clients.get(&id) {
                Ok(endpoint) => {
                    endpoint.handle_event(event);
                    Ok(())
                }
                Err(_) => {
                    tracing::debug!("{}: no endpoint, dropped", event);
                    Ok(())
                }
            },
        }
    }

    #[inline]
    fn is_closed(&self) -> bool {
        Shared::is_closed(self)
    }
}

/// The resource broker: creates endpoints, caches per-device resources and runs the connection
/// manager event loop shared by its endpoints.
pub struct EndpointGroup {
    shared: Arc<Shared>,
    cm_processor: CmProcessor,
}

impl fmt::Debug for EndpointGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointGroup")
            .field("shared", &self.shared)
            .field("cm_channel", &self.cm_processor.channel())
            .field("cm_running", &self.cm_processor.is_running())
            .finish()
    }
}

impl EndpointGroup {
    /// Create the group's event channel and start its CM event processor.
    pub fn new(
        verbs: Arc<dyn VerbProvider>,
        cm: Arc<dyn ConnectionProvider>,
        config: GroupConfig,
        factory: Arc<dyn EndpointFactory>,
    ) -> Result<Self> {
        let channel = cm.create_event_channel().map_err(Error::RdmaCm)?;
        let timeout = config.cm_event_timeout();
        let shared = Arc::new_cyclic(|me| Shared {
            me: me.clone(),
            verbs,
            cm: Arc::clone(&cm),
            config,
            channel,
            factory,
            clients: ResourceTable::default(),
            servers: ResourceTable::default(),
            pds: ResourceTable::default(),
            cq_processors: ResourceTable::default(),
            closed: AtomicBool::new(false),
        });
        let sink: Arc<dyn CmEventSink> = shared.clone();
        let cm_processor = match CmProcessor::start(Arc::clone(&cm), channel, sink, timeout) {
            Ok(processor) => processor,
            Err(e) => {
                let _ = cm.destroy_event_channel(&channel);
                return Err(e);
            }
        };
        tracing::debug!(channel = %channel.0, mode = ?shared.config.cq_mode, "endpoint group created");
        Ok(EndpointGroup {
            shared,
            cm_processor,
        })
    }

    #[inline]
    pub fn config(&self) -> &GroupConfig {
        &self.shared.config
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    pub fn create_endpoint(&self) -> Result<Arc<Endpoint>> {
        if self.is_closed() {
            return Err(Error::AlreadyClosed);
        }
        let id = self
            .shared
            .cm
            .create_id(&self.shared.channel, PortSpace::Tcp)
            .map_err(Error::RdmaCm)?;
        self.shared.new_endpoint(id, false)
    }

    pub fn create_server_endpoint(&self) -> Result<Arc<ServerEndpoint>> {
        if self.is_closed() {
            return Err(Error::AlreadyClosed);
        }
        let id = self
            .shared
            .cm
            .create_id(&self.shared.channel, PortSpace::Tcp)
            .map_err(Error::RdmaCm)?;
        let server = Arc::new(ServerEndpoint::new(id, Arc::downgrade(&self.shared)));
        self.shared.servers.insert(id, Arc::clone(&server))?;
        Ok(server)
    }

    /// Endpoints currently registered, both active and passive side.
    pub fn endpoint_count(&self) -> usize {
        self.shared.clients.len()
    }

    pub fn server_count(&self) -> usize {
        self.shared.servers.len()
    }

    pub fn cq_processor_count(&self) -> usize {
        self.shared.cq_processors.len()
    }

    pub fn cq_processor(&self, ctx: DeviceContext) -> Option<Arc<CqProcessor>> {
        self.shared.cq_processors.get(&ctx).ok()
    }

    pub fn protection_domain_count(&self) -> usize {
        self.shared.pds.len()
    }

    /// The protection domain `endpoint`'s queue pair was created in.
    pub fn protection_domain(&self, endpoint: &Endpoint) -> Option<ProtectionDomain> {
        endpoint.protection_domain()
    }

    /// Close every endpoint and server endpoint, then the event processor, then the completion
    /// processors, then release the protection domains. Idempotent.
    pub fn close(&self) -> Result<()> {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        tracing::debug!(
            endpoints = self.endpoint_count(),
            servers = self.server_count(),
            "closing endpoint group"
        );
        let mut res = Ok(());

        // endpoints remove themselves; their disconnect events are still being routed
        for endpoint in self.shared.clients.values() {
            if let Err(e) = endpoint.close() {
                tracing::warn!(id = %endpoint.id(), "closing endpoint: {}", e);
                res = res.and(Err(e));
            }
        }
        for server in self.shared.servers.values() {
            if let Err(e) = server.close() {
                tracing::warn!(id = %server.id(), "closing server endpoint: {}", e);
                res = res.and(Err(e));
            }
        }
        // passive endpoints that arrived while the servers were closing
        for (_, endpoint) in self.shared.clients.drain() {
            let _ = endpoint.close();
        }

        if let Err(e) = self.cm_processor.close() {
            tracing::warn!("closing cm processor: {}", e);
            res = res.and(Err(e));
        }
        for (ctx, processor) in self.shared.cq_processors.drain() {
            if let Err(e) = processor.close() {
                tracing::warn!(?ctx, "closing cq processor: {}", e);
                res = res.and(Err(e));
            }
        }
        for (ctx, pd) in self.shared.pds.drain() {
            if let Err(e) = self.shared.verbs.dealloc_pd(&pd) {
                tracing::warn!(?ctx, "dealloc_pd: {}", e);
                res = res.and(Err(Error::Ibv(e)));
            }
        }
        tracing::debug!("endpoint group closed");
        res
    }
}

impl Drop for EndpointGroup {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!("closing endpoint group: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::{Duration, Instant};

    use rdma::loopback::Fabric;
    use rdma::rdmacm::CmEvent;

    use super::*;

    fn handler_factory() -> Arc<dyn EndpointFactory> {
        Arc::new(|_id: CmId, _server_side: bool| -> Arc<dyn CompletionHandler> {
            Arc::new(|_wc: &rdma::ibv::WorkCompletion| {})
        })
    }

    fn group(fabric: &Arc<Fabric>) -> EndpointGroup {
        let config = GroupConfig {
            cm_event_timeout_ms: 10,
            cq_event_timeout_ms: 10,
            ..Default::default()
        };
        EndpointGroup::new(fabric.clone(), fabric.clone(), config, handler_factory()).unwrap()
    }

    #[test]
    fn unknown_listener_request_is_dropped() {
        let fabric = Arc::new(Fabric::new());
        fabric.add_device(IpAddr::V4(Ipv4Addr::LOCALHOST));
        let group = group(&fabric);
        let bogus = CmEvent::new(CmEventKind::ConnectRequest, CmId(rdma::Handle(9001)))
            .with_listen_id(CmId(rdma::Handle(9002)));
        fabric
            .inject_cm_event(&group.cm_processor.channel(), bogus)
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while fabric.stats().cm_events_acked < 1 {
            assert!(Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(group.endpoint_count(), 0);
        assert!(group.cm_processor.is_running());
    }

    #[test]
    fn closed_group_refuses_new_endpoints() {
        let fabric = Arc::new(Fabric::new());
        let group = group(&fabric);
        group.close().unwrap();
        group.close().unwrap();
        assert!(group.is_closed());
        assert!(matches!(group.create_endpoint(), Err(Error::AlreadyClosed)));
        assert!(matches!(
            group.create_server_endpoint(),
            Err(Error::AlreadyClosed)
        ));
        assert_eq!(fabric.stats().event_channels_destroyed, 1);
    }
}
