//! Connection manager objects and primitives.
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::handle::{AsHandle, Handle};
use crate::ibv::{DeviceContext, ProtectionDomain, QpInitAttr, QueuePair};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PortSpace {
    Tcp,
    Udp,
    Ib,
}

impl Default for PortSpace {
    fn default() -> Self {
        PortSpace::Tcp
    }
}

/// A connection identifier, the rdmacm analogue of a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CmId(pub Handle);

impl AsHandle for CmId {
    #[inline]
    fn as_handle(&self) -> Handle {
        self.0
    }
}

impl fmt::Display for CmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cmid-{}", self.0)
    }
}

/// The channel CM events of every id created on it are reported to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventChannel(pub Handle);

impl AsHandle for EventChannel {
    #[inline]
    fn as_handle(&self) -> Handle {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CmEventKind {
    AddrResolved,
    AddrError,
    RouteResolved,
    RouteError,
    ConnectRequest,
    ConnectResponse,
    ConnectError,
    Unreachable,
    Rejected,
    Established,
    Disconnected,
    DeviceRemoval,
    TimewaitExit,
}

impl CmEventKind {
    /// Events reporting that the pending operation on the id failed.
    #[inline]
    pub fn is_error(self) -> bool {
        matches!(
            self,
            CmEventKind::AddrError
                | CmEventKind::RouteError
                | CmEventKind::ConnectError
                | CmEventKind::Unreachable
                | CmEventKind::Rejected
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CmEventKind::AddrResolved => "RDMA_CM_EVENT_ADDR_RESOLVED",
            CmEventKind::AddrError => "RDMA_CM_EVENT_ADDR_ERROR",
            CmEventKind::RouteResolved => "RDMA_CM_EVENT_ROUTE_RESOLVED",
            CmEventKind::RouteError => "RDMA_CM_EVENT_ROUTE_ERROR",
            CmEventKind::ConnectRequest => "RDMA_CM_EVENT_CONNECT_REQUEST",
            CmEventKind::ConnectResponse => "RDMA_CM_EVENT_CONNECT_RESPONSE",
            CmEventKind::ConnectError => "RDMA_CM_EVENT_CONNECT_ERROR",
            CmEventKind::Unreachable => "RDMA_CM_EVENT_UNREACHABLE",
            CmEventKind::Rejected => "RDMA_CM_EVENT_REJECTED",
            CmEventKind::Established => "RDMA_CM_EVENT_ESTABLISHED",
            CmEventKind::Disconnected => "RDMA_CM_EVENT_DISCONNECTED",
            CmEventKind::DeviceRemoval => "RDMA_CM_EVENT_DEVICE_REMOVAL",
            CmEventKind::TimewaitExit => "RDMA_CM_EVENT_TIMEWAIT_EXIT",
        }
    }
}

impl fmt::Display for CmEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One connection manager event.
///
/// All events returned by `ConnectionProvider::get_cm_event` must be released through
/// `ConnectionProvider::ack_cm_event`; there should be a one-to-one correspondence between
/// successful gets and acks. The type is deliberately not `Clone`.
#[derive(Debug, PartialEq, Eq)]
pub struct CmEvent {
    kind: CmEventKind,
    id: CmId,
    listen_id: Option<CmId>,
    status: i32,
    private_data: Vec<u8>,
}

impl fmt::Display for CmEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} on {}", self.kind, self.id)?;
        if self.status != 0 {
            write!(f, " (status {})", self.status)?;
        }
        Ok(())
    }
}

impl CmEvent {
    pub fn new(kind: CmEventKind, id: CmId) -> Self {
        CmEvent {
            kind,
            id,
            listen_id: None,
            status: 0,
            private_data: Vec::new(),
        }
    }

    pub fn with_listen_id(mut self, listen_id: CmId) -> Self {
        self.listen_id = Some(listen_id);
        self
    }

    pub fn with_status(mut self, status: i32) -> Self {
        self.status = status;
        self
    }

    pub fn with_private_data(mut self, private_data: Vec<u8>) -> Self {
        self.private_data = private_data;
        self
    }

    #[inline]
    pub fn kind(&self) -> CmEventKind {
        self.kind
    }

    /// The id this event reports on. For a connect request, it is the newly created id of the
    /// incoming connection.
    #[inline]
    pub fn id(&self) -> CmId {
        self.id
    }

    /// The listening id that received a connect request.
    #[inline]
    pub fn listen_id(&self) -> Option<CmId> {
        self.listen_id
    }

    #[inline]
    pub fn status(&self) -> i32 {
        self.status
    }

    #[inline]
    pub fn private_data(&self) -> &[u8] {
        &self.private_data
    }

    /// Only valid for a new connect request.
    #[inline]
    pub fn get_request(&self) -> Option<(CmId, CmId)> {
        if self.kind != CmEventKind::ConnectRequest {
            return None;
        }
        self.listen_id.map(|listen_id| (self.id, listen_id))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnParam {
    pub private_data: Option<Vec<u8>>,
    pub responder_resources: u8,
    pub initiator_depth: u8,
    pub flow_control: u8,
    pub retry_count: u8,
    pub rnr_retry_count: u8,
}

/// Connection manager primitives. Operations that complete asynchronously (address and route
/// resolution, connect, accept, disconnect) report their outcome as a `CmEvent` on the id's event
/// channel.
pub trait ConnectionProvider: Send + Sync {
    fn create_event_channel(&self) -> io::Result<EventChannel>;

    fn destroy_event_channel(&self, channel: &EventChannel) -> io::Result<()>;

    fn create_id(&self, channel: &EventChannel, ps: PortSpace) -> io::Result<CmId>;

    fn destroy_id(&self, id: &CmId) -> io::Result<()>;

    fn resolve_addr(
        &self,
        id: &CmId,
        src: Option<&SocketAddr>,
        dst: &SocketAddr,
        timeout_ms: i32,
    ) -> io::Result<()>;

    fn resolve_route(&self, id: &CmId, timeout_ms: i32) -> io::Result<()>;

    fn bind_addr(&self, id: &CmId, addr: &SocketAddr) -> io::Result<()>;

    fn listen(&self, id: &CmId, backlog: i32) -> io::Result<()>;

    fn connect(&self, id: &CmId, conn_param: &ConnParam) -> io::Result<()>;

    fn accept(&self, id: &CmId, conn_param: &ConnParam) -> io::Result<()>;

    fn disconnect(&self, id: &CmId) -> io::Result<()>;

    /// Block until the next event arrives on `channel`. Returns `Ok(None)` when `timeout`
    /// elapses first.
    fn get_cm_event(&self, channel: &EventChannel, timeout: Duration)
        -> io::Result<Option<CmEvent>>;

    fn ack_cm_event(&self, event: CmEvent) -> io::Result<()>;

    /// Create a QueuePair bound to `id`. The ProtectionDomain must be bound to the same RDMA
    /// device as the id.
    fn create_qp(
        &self,
        id: &CmId,
        pd: &ProtectionDomain,
        qp_init_attr: &QpInitAttr,
    ) -> io::Result<QueuePair>;

    fn destroy_qp(&self, id: &CmId) -> io::Result<()>;

    /// The device the id is bound to, `None` before address resolution or binding.
    fn device_context(&self, id: &CmId) -> Option<DeviceContext>;

    fn local_addr(&self, id: &CmId) -> io::Result<SocketAddr>;

    fn peer_addr(&self, id: &CmId) -> io::Result<SocketAddr>;
}
