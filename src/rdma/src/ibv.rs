//! Verbs objects and the primitive operations the endpoint layer consumes.
use std::io;
use std::time::Duration;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::handle::{AsHandle, Handle};
use crate::mr::{AccessFlags, MemoryRegion};

/// Identifies one physical RDMA device. The key is stable for the lifetime of the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceContext(pub Handle);

impl AsHandle for DeviceContext {
    #[inline]
    fn as_handle(&self) -> Handle {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProtectionDomain {
    pub handle: Handle,
    pub context: DeviceContext,
}

impl AsHandle for ProtectionDomain {
    #[inline]
    fn as_handle(&self) -> Handle {
        self.handle
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CompletionChannel {
    pub handle: Handle,
    pub context: DeviceContext,
}

impl AsHandle for CompletionChannel {
    #[inline]
    fn as_handle(&self) -> Handle {
        self.handle
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CompletionQueue {
    pub handle: Handle,
    pub context: DeviceContext,
    /// The number of entries the queue was created with.
    pub capacity: u32,
}

impl AsHandle for CompletionQueue {
    #[inline]
    fn as_handle(&self) -> Handle {
        self.handle
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueuePair {
    pub handle: Handle,
    pub qp_num: u32,
    pub context: DeviceContext,
}

impl AsHandle for QueuePair {
    #[inline]
    fn as_handle(&self) -> Handle {
        self.handle
    }
}

/// The type of QP used for communciation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QpType {
    /// reliable connection
    RC,
    /// unreliable connection
    UC,
    /// unreliable datagram
    UD,
}

impl Default for QpType {
    fn default() -> Self {
        QpType::RC
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QpCapability {
    pub max_send_wr: u32,
    pub max_recv_wr: u32,
    pub max_send_sge: u32,
    pub max_recv_sge: u32,
    pub max_inline_data: u32,
}

impl Default for QpCapability {
    fn default() -> Self {
        QpCapability {
            max_send_wr: 128,
            max_recv_wr: 128,
            max_send_sge: 4,
            max_recv_sge: 4,
            max_inline_data: 64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QpInitAttr {
    pub send_cq: Option<CompletionQueue>,
    pub recv_cq: Option<CompletionQueue>,
    pub cap: QpCapability,
    pub qp_type: QpType,
    pub sq_sig_all: bool,
}

impl QpInitAttr {
    /// Both directions complete into `cq`.
    pub fn with_cq(cq: CompletionQueue, cap: QpCapability, qp_type: QpType) -> Self {
        QpInitAttr {
            send_cq: Some(cq),
            recv_cq: Some(cq),
            cap,
            qp_type,
            sq_sig_all: false,
        }
    }
}

/// A scatter/gather element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sge {
    pub addr: u64,
    pub length: u32,
    pub lkey: u32,
}

impl Sge {
    pub fn from_mr(mr: &MemoryRegion, offset: usize, length: usize) -> Self {
        assert!(offset + length <= mr.length, "sge out of the memory region");
        Sge {
            addr: mr.addr + offset as u64,
            length: length as u32,
            lkey: mr.lkey,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WrOpcode {
    Send,
    SendWithImm,
    RdmaWrite,
    RdmaWriteWithImm,
    RdmaRead,
}

/// Target of a one-sided operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteAddr {
    pub addr: u64,
    pub rkey: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendWr {
    pub wr_id: u64,
    pub sg_list: Vec<Sge>,
    pub opcode: WrOpcode,
    pub send_flags: SendFlags,
    pub imm_data: u32,
    pub rdma: Option<RemoteAddr>,
}

impl SendWr {
    pub fn send(wr_id: u64, sg_list: Vec<Sge>) -> Self {
        SendWr {
            wr_id,
            sg_list,
            opcode: WrOpcode::Send,
            send_flags: SendFlags::SIGNALED,
            imm_data: 0,
            rdma: None,
        }
    }

    pub fn write(wr_id: u64, sg_list: Vec<Sge>, remote: RemoteAddr) -> Self {
        SendWr {
            wr_id,
            sg_list,
            opcode: WrOpcode::RdmaWrite,
            send_flags: SendFlags::SIGNALED,
            imm_data: 0,
            rdma: Some(remote),
        }
    }

    pub fn read(wr_id: u64, sg_list: Vec<Sge>, remote: RemoteAddr) -> Self {
        SendWr {
            wr_id,
            sg_list,
            opcode: WrOpcode::RdmaRead,
            send_flags: SendFlags::SIGNALED,
            imm_data: 0,
            rdma: Some(remote),
        }
    }

    #[inline]
    pub fn byte_len(&self) -> u32 {
        self.sg_list.iter().map(|sge| sge.length).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecvWr {
    pub wr_id: u64,
    pub sg_list: Vec<Sge>,
}

impl RecvWr {
    pub fn new(wr_id: u64, sg_list: Vec<Sge>) -> Self {
        RecvWr { wr_id, sg_list }
    }

    #[inline]
    pub fn byte_len(&self) -> u32 {
        self.sg_list.iter().map(|sge| sge.length).sum()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum WcStatus {
    Success,
    Error(u32),
}

impl WcStatus {
    /// Work request flushed because the QP left the connected state.
    pub const WR_FLUSH_ERR: WcStatus = WcStatus::Error(5);

    #[inline]
    pub fn is_success(&self) -> bool {
        matches!(self, WcStatus::Success)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum WcOpcode {
    Send,
    RdmaWrite,
    RdmaRead,
    Recv,
    RecvRdmaWithImm,
    Invalid,
}

bitflags! {
    /// Flags of the completed WR.
    #[derive(Serialize, Deserialize)]
    #[derive(Default)]
    pub struct WcFlags: u32 {
        /// GRH is present (valid only for UD QPs).
        const GRH = 0b00000001;
        /// Immediate data value is valid.
        const WITH_IMM = 0b00000010;
    }

    /// Flags of the WR properties.
    #[derive(Serialize, Deserialize)]
    #[derive(Default)]
    pub struct SendFlags: u32 {
        /// Set the fence indicator. Valid only for QPs with Transport Service Type RC.
        const FENCE = 0b00000001;
        /// Set the completion notification indicator. Relevant only if QP was created with
        /// sq_sig_all=0.
        const SIGNALED = 0b00000010;
        /// Set the solicited event indicator. Valid only for Send and RDMA Write with immediate.
        const SOLICITED = 0b00000100;
        /// Send data in given gather list as inline data in a send WQE.  Valid only for Send and
        /// RDMA Write.  The L_Key will not be checked.
        const INLINE = 0b00001000;
    }
}

/// A structure represent completion of some work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkCompletion {
    pub qp_num: u32,
    pub wr_id: u64,
    pub status: WcStatus,
    pub opcode: WcOpcode,
    pub vendor_err: u32,
    pub byte_len: u32,
    pub imm_data: u32,
    pub wc_flags: WcFlags,
}

impl WorkCompletion {
    pub fn new(qp_num: u32, wr_id: u64, status: WcStatus, opcode: WcOpcode, byte_len: u32) -> Self {
        WorkCompletion {
            qp_num,
            wr_id,
            status,
            opcode,
            vendor_err: 0,
            byte_len,
            imm_data: 0,
            wc_flags: WcFlags::empty(),
        }
    }
}

/// Synchronous verbs primitives.
///
/// Every failure is an `io::Error` carrying the errno reported by the device.
pub trait VerbProvider: Send + Sync {
    fn alloc_pd(&self, ctx: DeviceContext) -> io::Result<ProtectionDomain>;

    fn dealloc_pd(&self, pd: &ProtectionDomain) -> io::Result<()>;

    fn create_comp_channel(&self, ctx: DeviceContext) -> io::Result<CompletionChannel>;

    fn destroy_comp_channel(&self, channel: &CompletionChannel) -> io::Result<()>;

    fn create_cq(
        &self,
        ctx: DeviceContext,
        cqe: u32,
        channel: Option<&CompletionChannel>,
    ) -> io::Result<CompletionQueue>;

    fn destroy_cq(&self, cq: &CompletionQueue) -> io::Result<()>;

    /// Arm the CQ so the next completion raises one event on its channel.
    fn req_notify_cq(&self, cq: &CompletionQueue, solicited_only: bool) -> io::Result<()>;

    /// Block until a CQ attached to `channel` raises an event. Returns `Ok(None)` when `timeout`
    /// elapses first.
    fn get_cq_event(
        &self,
        channel: &CompletionChannel,
        timeout: Duration,
    ) -> io::Result<Option<CompletionQueue>>;

    fn ack_cq_events(&self, cq: &CompletionQueue, nevents: u32);

    /// Append at most `max` completions to `wc`. Returns the number appended.
    fn poll_cq(
        &self,
        cq: &CompletionQueue,
        max: usize,
        wc: &mut Vec<WorkCompletion>,
    ) -> io::Result<usize>;

    /// # Safety
    ///
    /// The memory referenced by the work requests can only be safely reused or dropped after the
    /// request is fully executed and a work completion has been retrieved from the corresponding
    /// completion queue.
    unsafe fn post_send(&self, qp: &QueuePair, wrs: &[SendWr]) -> io::Result<()>;

    /// # Safety
    ///
    /// The memory referenced by the work requests can only be safely reused or dropped after the
    /// request is fully executed and a work completion has been retrieved from the corresponding
    /// completion queue.
    unsafe fn post_recv(&self, qp: &QueuePair, wrs: &[RecvWr]) -> io::Result<()>;

    fn reg_mr(
        &self,
        pd: &ProtectionDomain,
        addr: u64,
        length: usize,
        access: AccessFlags,
    ) -> io::Result<MemoryRegion>;

    fn dereg_mr(&self, mr: &MemoryRegion) -> io::Result<()>;
}
