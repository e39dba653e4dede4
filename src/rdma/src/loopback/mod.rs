//! An in-process software fabric implementing both provider traits.
//!
//! Devices are plain IP addresses registered with [`Fabric::add_device`]. Connection management
//! follows the rdmacm event protocol; queue pairs exchange completions but no payload bytes.
use std::collections::VecDeque;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};

use fnv::FnvHashMap as HashMap;

use crate::handle::Handle;
use crate::ibv::{
    CompletionQueue, DeviceContext, ProtectionDomain, QueuePair, WcFlags, WcOpcode, WcStatus,
    WorkCompletion,
};
use crate::mr::MemoryRegion;
use crate::rdmacm::{CmEvent, CmId, EventChannel, PortSpace};

mod cm;
mod verbs;

const EPHEMERAL_PORT_BASE: u16 = 40000;
const QP_NUM_BASE: u32 = 0x100;

#[inline]
pub(crate) fn errno(code: i32) -> io::Error {
    io::Error::from_raw_os_error(code)
}

/// Allocation and delivery counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FabricStats {
    pub pds_allocated: usize,
    pub pds_deallocated: usize,
    pub comp_channels_created: usize,
    pub comp_channels_destroyed: usize,
    pub cqs_created: usize,
    pub cqs_destroyed: usize,
    pub qps_created: usize,
    pub qps_destroyed: usize,
    pub ids_created: usize,
    pub ids_destroyed: usize,
    pub event_channels_created: usize,
    pub event_channels_destroyed: usize,
    pub cm_events_delivered: usize,
    pub cm_events_acked: usize,
    pub cq_events_acked: usize,
    pub mrs_registered: usize,
    pub mrs_deregistered: usize,
}

/// The queue behind an event file descriptor. Removing it from the fabric drops the sender:
/// waiters holding a receiver drain what is left, then fail with `EBADF`.
#[derive(Debug)]
pub(crate) struct Mailbox<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
}

impl<T> Mailbox<T> {
    pub(crate) fn new() -> Self {
        let (tx, rx) = channel::unbounded();
        Mailbox { tx, rx }
    }

    /// Fails only if the receiving side is gone, which the mailbox itself prevents.
    pub(crate) fn push(&self, item: T) -> bool {
        self.tx.send(item).is_ok()
    }

    pub(crate) fn receiver(&self) -> Receiver<T> {
        self.rx.clone()
    }

    pub(crate) fn len(&self) -> usize {
        self.rx.len()
    }
}

/// Wait at most `timeout` for the next item; `Ok(None)` on timeout.
pub(crate) fn recv_timeout<T>(rx: &Receiver<T>, timeout: Duration) -> io::Result<Option<T>> {
    match rx.recv_timeout(timeout) {
        Ok(item) => Ok(Some(item)),
        Err(RecvTimeoutError::Timeout) => Ok(None),
        Err(RecvTimeoutError::Disconnected) => Err(errno(libc::EBADF)),
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Device {
    pub(crate) ctx: DeviceContext,
    pub(crate) addr: IpAddr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnState {
    Idle,
    AddrResolved,
    RouteResolved,
    Listening,
    /// Passive side of a connect request that has not been accepted yet.
    Requested,
    /// Active side waiting for the peer to accept.
    Connecting,
    Connected,
    Disconnected,
}

#[derive(Debug)]
pub(crate) struct IdState {
    pub(crate) channel: Handle,
    pub(crate) ps: PortSpace,
    pub(crate) device: Option<DeviceContext>,
    pub(crate) local: Option<SocketAddr>,
    pub(crate) peer: Option<SocketAddr>,
    pub(crate) bound: bool,
    pub(crate) conn: ConnState,
    pub(crate) qp: Option<u32>,
    /// The id on the other end of the connection.
    pub(crate) remote: Option<Handle>,
    /// For passive ids, the listener that received the request.
    pub(crate) listener: Option<Handle>,
    pub(crate) backlog: usize,
    pub(crate) pending: usize,
}

impl IdState {
    pub(crate) fn new(channel: Handle, ps: PortSpace) -> Self {
        IdState {
            channel,
            ps,
            device: None,
            local: None,
            peer: None,
            bound: false,
            conn: ConnState::Idle,
            qp: None,
            remote: None,
            listener: None,
            backlog: 0,
            pending: 0,
        }
    }
}

#[derive(Debug)]
pub(crate) struct CqState {
    pub(crate) cq: CompletionQueue,
    pub(crate) channel: Option<Handle>,
    pub(crate) armed: bool,
    pub(crate) entries: VecDeque<WorkCompletion>,
    pub(crate) users: usize,
}

/// A send that arrived before the peer posted a receive for it.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Inbound {
    pub(crate) byte_len: u32,
    pub(crate) imm_data: Option<u32>,
    pub(crate) opcode: WcOpcode,
}

#[derive(Debug)]
pub(crate) struct QpState {
    pub(crate) qp: QueuePair,
    pub(crate) id: Handle,
    pub(crate) pd: Handle,
    pub(crate) send_cq: Handle,
    pub(crate) recv_cq: Handle,
    pub(crate) sq_sig_all: bool,
    pub(crate) remote: Option<u32>,
    pub(crate) recvs: VecDeque<(u64, u32)>,
    pub(crate) inbound: VecDeque<Inbound>,
}

#[derive(Debug, Default)]
pub(crate) struct Inner {
    next_handle: u64,
    next_qp_num: u32,
    next_key: u32,
    next_port: u16,
    pub(crate) devices: Vec<Device>,
    /// Destinations whose route resolution fails.
    pub(crate) unroutable: Vec<IpAddr>,
    pub(crate) event_channels: HashMap<Handle, Mailbox<CmEvent>>,
    pub(crate) comp_channels: HashMap<Handle, (DeviceContext, Mailbox<CompletionQueue>)>,
    pub(crate) ids: HashMap<Handle, IdState>,
    pub(crate) pds: HashMap<Handle, ProtectionDomain>,
    pub(crate) cqs: HashMap<Handle, CqState>,
    pub(crate) qps: HashMap<u32, QpState>,
    pub(crate) mrs: HashMap<Handle, MemoryRegion>,
    pub(crate) stats: FabricStats,
}

impl Inner {
    pub(crate) fn alloc_handle(&mut self) -> Handle {
        self.next_handle += 1;
        Handle(self.next_handle)
    }

    pub(crate) fn alloc_qp_num(&mut self) -> u32 {
        self.next_qp_num += 1;
        QP_NUM_BASE + self.next_qp_num
    }

    pub(crate) fn alloc_key(&mut self) -> u32 {
        self.next_key += 1;
        self.next_key
    }

    pub(crate) fn alloc_port(&mut self) -> u16 {
        let port = EPHEMERAL_PORT_BASE.wrapping_add(self.next_port);
        self.next_port = self.next_port.wrapping_add(1);
        port
    }

    pub(crate) fn device(&self, ctx: DeviceContext) -> Option<&Device> {
        self.devices.iter().find(|d| d.ctx == ctx)
    }

    pub(crate) fn device_by_ip(&self, ip: &IpAddr) -> Option<Device> {
        let found = self.devices.iter().find(|d| d.addr == *ip).copied();
        if found.is_none() && ip.is_loopback() {
            return self.devices.first().copied();
        }
        found
    }

    pub(crate) fn id(&self, id: &CmId) -> io::Result<&IdState> {
        self.ids.get(&id.0).ok_or_else(|| errno(libc::EBADF))
    }

    pub(crate) fn id_mut(&mut self, id: &CmId) -> io::Result<&mut IdState> {
        self.ids.get_mut(&id.0).ok_or_else(|| errno(libc::EBADF))
    }

    /// Queue `event` on the channel the id of the event was created on.
    pub(crate) fn deliver(&mut self, channel: Handle, event: CmEvent) {
        match self.event_channels.get(&channel) {
            Some(mailbox) => {
                log::trace!("loopback: delivering {} to channel {}", event, channel);
                if mailbox.push(event) {
                    self.stats.cm_events_delivered += 1;
                }
            }
            None => log::debug!("loopback: dropping {}, channel {} is gone", event, channel),
        }
    }

    /// Push a completion into `cq`, raising a channel event if the queue is armed.
    pub(crate) fn complete(&mut self, cq: Handle, wc: WorkCompletion) {
        let Some(state) = self.cqs.get_mut(&cq) else {
            log::debug!("loopback: dropping completion {:?}, cq {} is gone", wc, cq);
            return;
        };
        state.entries.push_back(wc);
        if state.armed {
            if let Some(channel) = state.channel {
                state.armed = false;
                let cq = state.cq;
                if let Some((_, mailbox)) = self.comp_channels.get(&channel) {
                    mailbox.push(cq);
                }
            }
        }
    }

    /// Hand an inbound message to the next posted receive of `qp_num`, or park it.
    pub(crate) fn receive(&mut self, qp_num: u32, inbound: Inbound) {
        let Some(qp) = self.qps.get_mut(&qp_num) else {
            return;
        };
        match qp.recvs.pop_front() {
            Some((wr_id, _len)) => {
                let recv_cq = qp.recv_cq;
                let wc = recv_completion(qp_num, wr_id, &inbound);
                self.complete(recv_cq, wc);
            }
            None => qp.inbound.push_back(inbound),
        }
    }

    /// Move the QP out of the connected state, flushing its posted receives.
    pub(crate) fn flush_qp(&mut self, qp_num: u32) {
        let Some(qp) = self.qps.get_mut(&qp_num) else {
            return;
        };
        qp.remote = None;
        qp.inbound.clear();
        let recv_cq = qp.recv_cq;
        let flushed: Vec<_> = qp.recvs.drain(..).collect();
        for (wr_id, _len) in flushed {
            let wc = WorkCompletion::new(qp_num, wr_id, WcStatus::WR_FLUSH_ERR, WcOpcode::Recv, 0);
            self.complete(recv_cq, wc);
        }
    }

    /// Tear down the connection of `id` and report `Disconnected` to every connected side.
    pub(crate) fn disconnect_pair(&mut self, id: Handle) {
        let mut sides = vec![id];
        if let Some(remote) = self.ids.get(&id).and_then(|s| s.remote) {
            sides.push(remote);
        }
        for side in sides {
            let Some(state) = self.ids.get_mut(&side) else {
                continue;
            };
            if state.conn != ConnState::Connected {
                continue;
            }
            state.conn = ConnState::Disconnected;
            let channel = state.channel;
            let qp = state.qp;
            if let Some(qp_num) = qp {
                self.flush_qp(qp_num);
            }
            self.deliver(
                channel,
                CmEvent::new(crate::rdmacm::CmEventKind::Disconnected, CmId(side)),
            );
        }
    }
}

pub(crate) fn recv_completion(qp_num: u32, wr_id: u64, inbound: &Inbound) -> WorkCompletion {
    let mut wc = WorkCompletion::new(
        qp_num,
        wr_id,
        WcStatus::Success,
        inbound.opcode,
        inbound.byte_len,
    );
    if let Some(imm) = inbound.imm_data {
        wc.imm_data = imm;
        wc.wc_flags = WcFlags::WITH_IMM;
    }
    wc
}

/// The software fabric. Share it as `Arc<Fabric>` between the verbs and connection sides.
#[derive(Debug, Default)]
pub struct Fabric {
    inner: Mutex<Inner>,
}

impl Fabric {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub(crate) fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a device reachable at `addr`.
    pub fn add_device(&self, addr: IpAddr) -> DeviceContext {
        let mut inner = self.lock();
        let ctx = DeviceContext(inner.alloc_handle());
        inner.devices.push(Device { ctx, addr });
        log::debug!("loopback: added device {:?} at {}", ctx, addr);
        ctx
    }

    /// Make route resolution towards `ip` fail with `ENETUNREACH` from now on.
    pub fn block_route(&self, ip: IpAddr) {
        let mut inner = self.lock();
        if !inner.unroutable.contains(&ip) {
            inner.unroutable.push(ip);
        }
    }

    pub fn devices(&self) -> Vec<DeviceContext> {
        self.lock().devices.iter().map(|d| d.ctx).collect()
    }

    pub fn device_addr(&self, ctx: DeviceContext) -> Option<IpAddr> {
        self.lock().device(ctx).map(|d| d.addr)
    }

    pub fn stats(&self) -> FabricStats {
        self.lock().stats
    }

    /// Number of events waiting on `channel`.
    pub fn pending_cm_events(&self, channel: &EventChannel) -> usize {
        self.lock()
            .event_channels
            .get(&channel.0)
            .map_or(0, |mailbox| mailbox.len())
    }

    /// Queue an arbitrary event on `channel`, as if the wire had produced it.
    pub fn inject_cm_event(&self, channel: &EventChannel, event: CmEvent) -> io::Result<()> {
        let mut inner = self.lock();
        if !inner.event_channels.contains_key(&channel.0) {
            return Err(errno(libc::EBADF));
        }
        inner.deliver(channel.0, event);
        Ok(())
    }
}
