use std::io;
use std::time::Duration;

use super::{errno, recv_timeout, CqState, Fabric, Inbound, Mailbox};
use crate::ibv::{
    CompletionChannel, CompletionQueue, DeviceContext, ProtectionDomain, QueuePair, RecvWr,
    SendFlags, SendWr, VerbProvider, WcOpcode, WcStatus, WorkCompletion, WrOpcode,
};
use crate::mr::{AccessFlags, MemoryRegion};

fn send_opcode(opcode: WrOpcode) -> WcOpcode {
    match opcode {
        WrOpcode::Send | WrOpcode::SendWithImm => WcOpcode::Send,
        WrOpcode::RdmaWrite | WrOpcode::RdmaWriteWithImm => WcOpcode::RdmaWrite,
        WrOpcode::RdmaRead => WcOpcode::RdmaRead,
    }
}

impl VerbProvider for Fabric {
    fn alloc_pd(&self, ctx: DeviceContext) -> io::Result<ProtectionDomain> {
        let mut inner = self.lock();
        if inner.device(ctx).is_none() {
            return Err(errno(libc::ENODEV));
        }
        let pd = ProtectionDomain {
            handle: inner.alloc_handle(),
            context: ctx,
        };
        inner.pds.insert(pd.handle, pd);
        inner.stats.pds_allocated += 1;
        Ok(pd)
    }

    fn dealloc_pd(&self, pd: &ProtectionDomain) -> io::Result<()> {
        let mut inner = self.lock();
        if !inner.pds.contains_key(&pd.handle) {
            return Err(errno(libc::EBADF));
        }
        let in_use = inner.qps.values().any(|qp| qp.pd == pd.handle)
            || inner.mrs.values().any(|mr| mr.pd.handle == pd.handle);
        if in_use {
            return Err(errno(libc::EBUSY));
        }
        inner.pds.remove(&pd.handle);
        inner.stats.pds_deallocated += 1;
        Ok(())
    }

    fn create_comp_channel(&self, ctx: DeviceContext) -> io::Result<CompletionChannel> {
        let mut inner = self.lock();
        if inner.device(ctx).is_none() {
            return Err(errno(libc::ENODEV));
        }
        let channel = CompletionChannel {
            handle: inner.alloc_handle(),
            context: ctx,
        };
        inner
            .comp_channels
            .insert(channel.handle, (ctx, Mailbox::new()));
        inner.stats.comp_channels_created += 1;
        Ok(channel)
    }

    fn destroy_comp_channel(&self, channel: &CompletionChannel) -> io::Result<()> {
        let mut inner = self.lock();
        if !inner.comp_channels.contains_key(&channel.handle) {
            return Err(errno(libc::EBADF));
        }
        if inner
            .cqs
            .values()
            .any(|cq| cq.channel == Some(channel.handle))
        {
            return Err(errno(libc::EBUSY));
        }
        inner.comp_channels.remove(&channel.handle);
        inner.stats.comp_channels_destroyed += 1;
        Ok(())
    }

    fn create_cq(
        &self,
        ctx: DeviceContext,
        cqe: u32,
        channel: Option<&CompletionChannel>,
    ) -> io::Result<CompletionQueue> {
        let mut inner = self.lock();
        if inner.device(ctx).is_none() {
            return Err(errno(libc::ENODEV));
        }
        if cqe == 0 {
            return Err(errno(libc::EINVAL));
        }
        if let Some(channel) = channel {
            match inner.comp_channels.get(&channel.handle) {
                Some((owner, _)) if *owner == ctx => {}
                Some(_) => return Err(errno(libc::EINVAL)),
                None => return Err(errno(libc::EBADF)),
            }
        }
        let cq = CompletionQueue {
            handle: inner.alloc_handle(),
            context: ctx,
            capacity: cqe,
        };
        inner.cqs.insert(
            cq.handle,
            CqState {
                cq,
                channel: channel.map(|c| c.handle),
                armed: false,
                entries: Default::default(),
                users: 0,
            },
        );
        inner.stats.cqs_created += 1;
        Ok(cq)
    }

    fn destroy_cq(&self, cq: &CompletionQueue) -> io::Result<()> {
        let mut inner = self.lock();
        match inner.cqs.get(&cq.handle) {
            None => return Err(errno(libc::EBADF)),
            Some(state) if state.users > 0 => return Err(errno(libc::EBUSY)),
            Some(_) => {}
        }
        inner.cqs.remove(&cq.handle);
        inner.stats.cqs_destroyed += 1;
        Ok(())
    }

    fn req_notify_cq(&self, cq: &CompletionQueue, _solicited_only: bool) -> io::Result<()> {
        let mut inner = self.lock();
        let state = inner
            .cqs
            .get_mut(&cq.handle)
            .ok_or_else(|| errno(libc::EBADF))?;
        if state.channel.is_none() {
            return Err(errno(libc::EINVAL));
        }
        state.armed = true;
        Ok(())
    }

    fn get_cq_event(
        &self,
        channel: &CompletionChannel,
        timeout: Duration,
    ) -> io::Result<Option<CompletionQueue>> {
        let rx = self
            .lock()
            .comp_channels
            .get(&channel.handle)
            .map(|(_, mailbox)| mailbox.receiver())
            .ok_or_else(|| errno(libc::EBADF))?;
        recv_timeout(&rx, timeout)
    }

    fn ack_cq_events(&self, _cq: &CompletionQueue, nevents: u32) {
        self.lock().stats.cq_events_acked += nevents as usize;
    }

    fn poll_cq(
        &self,
        cq: &CompletionQueue,
        max: usize,
        wc: &mut Vec<WorkCompletion>,
    ) -> io::Result<usize> {
        let mut inner = self.lock();
        let state = inner
            .cqs
            .get_mut(&cq.handle)
            .ok_or_else(|| errno(libc::EBADF))?;
        let n = max.min(state.entries.len());
        wc.extend(state.entries.drain(..n));
        Ok(n)
    }

    unsafe fn post_send(&self, qp: &QueuePair, wrs: &[SendWr]) -> io::Result<()> {
        let mut inner = self.lock();
        let (send_cq, sq_sig_all, remote) = {
            let state = inner.qps.get(&qp.qp_num).ok_or_else(|| errno(libc::EBADF))?;
            let remote = state.remote.ok_or_else(|| errno(libc::EINVAL))?;
            (state.send_cq, state.sq_sig_all, remote)
        };
        for wr in wrs {
            let byte_len = wr.byte_len();
            let inbound = match wr.opcode {
                WrOpcode::Send => Some((None, WcOpcode::Recv)),
                WrOpcode::SendWithImm => Some((Some(wr.imm_data), WcOpcode::Recv)),
                WrOpcode::RdmaWriteWithImm => Some((Some(wr.imm_data), WcOpcode::RecvRdmaWithImm)),
                WrOpcode::RdmaWrite | WrOpcode::RdmaRead => None,
            };
            if let Some((imm_data, opcode)) = inbound {
                inner.receive(
                    remote,
                    Inbound {
                        byte_len,
                        imm_data,
                        opcode,
                    },
                );
            }
            if sq_sig_all || wr.send_flags.contains(SendFlags::SIGNALED) {
                let wc = WorkCompletion::new(
                    qp.qp_num,
                    wr.wr_id,
                    WcStatus::Success,
                    send_opcode(wr.opcode),
                    byte_len,
                );
                inner.complete(send_cq, wc);
            }
        }
        Ok(())
    }

    unsafe fn post_recv(&self, qp: &QueuePair, wrs: &[RecvWr]) -> io::Result<()> {
        let mut inner = self.lock();
        if !inner.qps.contains_key(&qp.qp_num) {
            return Err(errno(libc::EBADF));
        }
        for wr in wrs {
            let state = inner
                .qps
                .get_mut(&qp.qp_num)
                .ok_or_else(|| errno(libc::EBADF))?;
            match state.inbound.pop_front() {
                Some(inbound) => {
                    let recv_cq = state.recv_cq;
                    let wc = super::recv_completion(qp.qp_num, wr.wr_id, &inbound);
                    inner.complete(recv_cq, wc);
                }
                None => state.recvs.push_back((wr.wr_id, wr.byte_len())),
            }
        }
        Ok(())
    }

    fn reg_mr(
        &self,
        pd: &ProtectionDomain,
        addr: u64,
        length: usize,
        access: AccessFlags,
    ) -> io::Result<MemoryRegion> {
        let mut inner = self.lock();
        if !inner.pds.contains_key(&pd.handle) {
            return Err(errno(libc::EBADF));
        }
        if length == 0 {
            return Err(errno(libc::EINVAL));
        }
        let key = inner.alloc_key();
        let mr = MemoryRegion {
            handle: inner.alloc_handle(),
            pd: *pd,
            addr,
            length,
            lkey: key,
            rkey: key,
            access,
        };
        inner.mrs.insert(mr.handle, mr);
        inner.stats.mrs_registered += 1;
        Ok(mr)
    }

    fn dereg_mr(&self, mr: &MemoryRegion) -> io::Result<()> {
        let mut inner = self.lock();
        inner
            .mrs
            .remove(&mr.handle)
            .ok_or_else(|| errno(libc::EBADF))?;
        inner.stats.mrs_deregistered += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use super::*;

    #[test]
    fn pd_busy_while_memory_registered() {
        let fabric = Fabric::new();
        let ctx = fabric.add_device(IpAddr::V4(Ipv4Addr::LOCALHOST));
        let pd = fabric.alloc_pd(ctx).unwrap();
        let mr = fabric
            .reg_mr(&pd, 0x4000, 4096, AccessFlags::LOCAL_WRITE)
            .unwrap();
        assert!(mr.contains(0x4000, 4096));
        let err = fabric.dealloc_pd(&pd).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EBUSY));
        fabric.dereg_mr(&mr).unwrap();
        fabric.dealloc_pd(&pd).unwrap();
        let stats = fabric.stats();
        assert_eq!((stats.pds_allocated, stats.pds_deallocated), (1, 1));
    }

    #[test]
    fn channel_busy_while_cq_attached() {
        let fabric = Fabric::new();
        let ctx = fabric.add_device(IpAddr::V4(Ipv4Addr::LOCALHOST));
        let channel = fabric.create_comp_channel(ctx).unwrap();
        let cq = fabric.create_cq(ctx, 8, Some(&channel)).unwrap();
        let err = fabric.destroy_comp_channel(&channel).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EBUSY));
        fabric.destroy_cq(&cq).unwrap();
        fabric.destroy_comp_channel(&channel).unwrap();
        let err = fabric
            .get_cq_event(&channel, Duration::from_millis(1))
            .unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EBADF));
    }

    #[test]
    fn unknown_device() {
        let fabric = Fabric::new();
        let err = fabric.alloc_pd(DeviceContext(crate::Handle(42))).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENODEV));
    }
}
