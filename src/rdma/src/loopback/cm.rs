use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use super::{errno, recv_timeout, ConnState, Fabric, IdState, Mailbox, QpState};
use crate::ibv::{DeviceContext, ProtectionDomain, QpInitAttr, QueuePair};
use crate::rdmacm::{
    CmEvent, CmEventKind, CmId, ConnParam, ConnectionProvider, EventChannel, PortSpace,
};

impl ConnectionProvider for Fabric {
    fn create_event_channel(&self) -> io::Result<EventChannel> {
        let mut inner = self.lock();
        let channel = EventChannel(inner.alloc_handle());
        inner
            .event_channels
            .insert(channel.0, Mailbox::new());
        inner.stats.event_channels_created += 1;
        Ok(channel)
    }

    fn destroy_event_channel(&self, channel: &EventChannel) -> io::Result<()> {
        let mut inner = self.lock();
        // dropping the mailbox wakes the waiters
        inner
            .event_channels
            .remove(&channel.0)
            .ok_or_else(|| errno(libc::EBADF))?;
        inner.stats.event_channels_destroyed += 1;
        Ok(())
    }

    fn create_id(&self, channel: &EventChannel, ps: PortSpace) -> io::Result<CmId> {
        let mut inner = self.lock();
        if !inner.event_channels.contains_key(&channel.0) {
            return Err(errno(libc::EBADF));
        }
        let id = CmId(inner.alloc_handle());
        inner.ids.insert(id.0, IdState::new(channel.0, ps));
        inner.stats.ids_created += 1;
        Ok(id)
    }

    fn destroy_id(&self, id: &CmId) -> io::Result<()> {
        let mut inner = self.lock();
        let (conn, remote, listener, has_qp) = {
            let state = inner.id(id)?;
            (state.conn, state.remote, state.listener, state.qp.is_some())
        };
        if has_qp {
            return Err(errno(libc::EBUSY));
        }
        match conn {
            ConnState::Connected => inner.disconnect_pair(id.0),
            ConnState::Requested => {
                // never accepted: the active side learns it was turned down
                if let Some(l) = listener.and_then(|l| inner.ids.get_mut(&l)) {
                    l.pending = l.pending.saturating_sub(1);
                }
                if let Some(remote) = remote {
                    if let Some(client) = inner.ids.get_mut(&remote) {
                        if client.conn == ConnState::Connecting {
                            client.conn = ConnState::RouteResolved;
                            client.remote = None;
                            let channel = client.channel;
                            let event = CmEvent::new(CmEventKind::Rejected, CmId(remote))
                                .with_status(-libc::ECONNREFUSED);
                            inner.deliver(channel, event);
                        }
                    }
                }
            }
            ConnState::Connecting => {
                // a request still queued on the listener is withdrawn
                let mut withdrawn = None;
                if let Some(server) = remote.and_then(|r| inner.ids.get_mut(&r)) {
                    server.remote = None;
                    if server.conn == ConnState::Requested {
                        server.conn = ConnState::Disconnected;
                        withdrawn = Some((server.channel, server.listener));
                    }
                }
                if let (Some(server), Some((channel, listener))) = (remote, withdrawn) {
                    if let Some(l) = listener.and_then(|l| inner.ids.get_mut(&l)) {
                        l.pending = l.pending.saturating_sub(1);
                    }
                    inner.deliver(channel, CmEvent::new(CmEventKind::Disconnected, CmId(server)));
                }
            }
            _ => {}
        }
        inner.ids.remove(&id.0);
        inner.stats.ids_destroyed += 1;
        Ok(())
    }

    fn resolve_addr(
        &self,
        id: &CmId,
        src: Option<&SocketAddr>,
        dst: &SocketAddr,
        _timeout_ms: i32,
    ) -> io::Result<()> {
        let mut inner = self.lock();
        let channel = {
            let state = inner.id(id)?;
            if state.conn != ConnState::Idle {
                return Err(errno(libc::EINVAL));
            }
            state.channel
        };
        let device = match src {
            Some(src) if !src.ip().is_unspecified() => inner.device_by_ip(&src.ip()),
            _ => inner.device_by_ip(&dst.ip()),
        };
        let Some(device) = device else {
            let event = CmEvent::new(CmEventKind::AddrError, *id).with_status(-libc::EHOSTUNREACH);
            inner.deliver(channel, event);
            return Ok(());
        };
        let port = match src {
            Some(src) if src.port() != 0 => src.port(),
            _ => inner.alloc_port(),
        };
        let state = inner.id_mut(id)?;
        state.device = Some(device.ctx);
        state.local = Some(SocketAddr::new(device.addr, port));
        state.peer = Some(*dst);
        state.conn = ConnState::AddrResolved;
        inner.deliver(channel, CmEvent::new(CmEventKind::AddrResolved, *id));
        Ok(())
    }

    fn resolve_route(&self, id: &CmId, _timeout_ms: i32) -> io::Result<()> {
        let mut inner = self.lock();
        let state = inner.id_mut(id)?;
        if state.conn != ConnState::AddrResolved {
            return Err(errno(libc::EINVAL));
        }
        let (channel, peer) = (state.channel, state.peer);
        if peer.map_or(false, |peer| inner.unroutable.contains(&peer.ip())) {
            let event = CmEvent::new(CmEventKind::RouteError, *id).with_status(-libc::ENETUNREACH);
            inner.deliver(channel, event);
            return Ok(());
        }
        inner.id_mut(id)?.conn = ConnState::RouteResolved;
        inner.deliver(channel, CmEvent::new(CmEventKind::RouteResolved, *id));
        Ok(())
    }

    fn bind_addr(&self, id: &CmId, addr: &SocketAddr) -> io::Result<()> {
        let mut inner = self.lock();
        if inner.id(id)?.bound {
            return Err(errno(libc::EINVAL));
        }
        let device = if addr.ip().is_unspecified() {
            None
        } else {
            let device = inner
                .devices
                .iter()
                .find(|d| d.addr == addr.ip())
                .copied()
                .ok_or_else(|| errno(libc::EADDRNOTAVAIL))?;
            Some(device.ctx)
        };
        let port = if addr.port() == 0 {
            inner.alloc_port()
        } else {
            addr.port()
        };
        let local = SocketAddr::new(addr.ip(), port);
        let in_use = inner.ids.values().any(|other| {
            other.bound
                && other.local.map_or(false, |l| {
                    l.port() == port
                        && (l.ip() == local.ip() || l.ip().is_unspecified() || local.ip().is_unspecified())
                })
        });
        if in_use {
            return Err(errno(libc::EADDRINUSE));
        }
        let state = inner.id_mut(id)?;
        state.bound = true;
        state.device = device;
        state.local = Some(local);
        Ok(())
    }

    fn listen(&self, id: &CmId, backlog: i32) -> io::Result<()> {
        let mut inner = self.lock();
        let state = inner.id_mut(id)?;
        if !state.bound {
            return Err(errno(libc::EINVAL));
        }
        state.conn = ConnState::Listening;
        state.backlog = backlog.max(1) as usize;
        Ok(())
    }

    fn connect(&self, id: &CmId, conn_param: &ConnParam) -> io::Result<()> {
        let mut inner = self.lock();
        let (channel, dst, device, peer_of_server) = {
            let state = inner.id(id)?;
            if state.conn != ConnState::RouteResolved || state.qp.is_none() {
                return Err(errno(libc::EINVAL));
            }
            let dst = state.peer.ok_or_else(|| errno(libc::EINVAL))?;
            (state.channel, dst, state.device, state.local)
        };
        let listener = inner
            .ids
            .iter()
            .find(|(_, s)| {
                s.conn == ConnState::Listening
                    && s.local.map_or(false, |l| {
                        l.port() == dst.port()
                            && (l.ip().is_unspecified()
                                || l.ip() == dst.ip()
                                || s.device.is_some() && s.device == device)
                    })
            })
            .map(|(h, s)| (*h, s.channel, s.pending < s.backlog));
        let (listen_handle, listen_channel) = match listener {
            Some((h, c, true)) => (h, c),
            Some((_, _, false)) | None => {
                log::debug!("loopback: no listener accepting on {}", dst);
                let event = CmEvent::new(CmEventKind::Rejected, *id).with_status(-libc::ECONNREFUSED);
                inner.deliver(channel, event);
                return Ok(());
            }
        };

        let server = inner.alloc_handle();
        let mut state = IdState::new(listen_channel, PortSpace::Tcp);
        state.device = device;
        state.local = Some(dst);
        state.peer = peer_of_server;
        state.conn = ConnState::Requested;
        state.remote = Some(id.0);
        state.listener = Some(listen_handle);
        inner.ids.insert(server, state);
        inner.stats.ids_created += 1;
        if let Some(l) = inner.ids.get_mut(&listen_handle) {
            l.pending += 1;
        }
        let client = inner.id_mut(id)?;
        client.conn = ConnState::Connecting;
        client.remote = Some(server);

        let mut event = CmEvent::new(CmEventKind::ConnectRequest, CmId(server))
            .with_listen_id(CmId(listen_handle));
        if let Some(data) = &conn_param.private_data {
            event = event.with_private_data(data.clone());
        }
        inner.deliver(listen_channel, event);
        Ok(())
    }

    fn accept(&self, id: &CmId, conn_param: &ConnParam) -> io::Result<()> {
        let mut inner = self.lock();
        let (server_channel, server_qp, remote, listener) = {
            let state = inner.id(id)?;
            if state.conn != ConnState::Requested {
                return Err(errno(libc::EINVAL));
            }
            let qp = state.qp.ok_or_else(|| errno(libc::EINVAL))?;
            (state.channel, qp, state.remote, state.listener)
        };
        let remote = remote.ok_or_else(|| errno(libc::ECONNABORTED))?;
        let (client_channel, client_qp) = match inner.ids.get(&remote) {
            Some(c) if c.conn == ConnState::Connecting => {
                (c.channel, c.qp.ok_or_else(|| errno(libc::ECONNABORTED))?)
            }
            _ => return Err(errno(libc::ECONNABORTED)),
        };

        if let Some(qp) = inner.qps.get_mut(&server_qp) {
            qp.remote = Some(client_qp);
        }
        if let Some(qp) = inner.qps.get_mut(&client_qp) {
            qp.remote = Some(server_qp);
        }
        inner.id_mut(id)?.conn = ConnState::Connected;
        if let Some(client) = inner.ids.get_mut(&remote) {
            client.conn = ConnState::Connected;
        }
        if let Some(l) = listener.and_then(|l| inner.ids.get_mut(&l)) {
            l.pending = l.pending.saturating_sub(1);
        }

        inner.deliver(server_channel, CmEvent::new(CmEventKind::Established, *id));
        let mut event = CmEvent::new(CmEventKind::Established, CmId(remote));
        if let Some(data) = &conn_param.private_data {
            event = event.with_private_data(data.clone());
        }
        inner.deliver(client_channel, event);
        Ok(())
    }

    fn disconnect(&self, id: &CmId) -> io::Result<()> {
        let mut inner = self.lock();
        match inner.id(id)?.conn {
            ConnState::Connected => {
                inner.disconnect_pair(id.0);
                Ok(())
            }
            ConnState::Disconnected => Ok(()),
            _ => Err(errno(libc::EINVAL)),
        }
    }

    fn get_cm_event(
        &self,
        channel: &EventChannel,
        timeout: Duration,
    ) -> io::Result<Option<CmEvent>> {
        let rx = self
            .lock()
            .event_channels
            .get(&channel.0)
            .ok_or_else(|| errno(libc::EBADF))?
            .receiver();
        recv_timeout(&rx, timeout)
    }

    fn ack_cm_event(&self, event: CmEvent) -> io::Result<()> {
        log::trace!("loopback: ack {}", event);
        self.lock().stats.cm_events_acked += 1;
        Ok(())
    }

    fn create_qp(
        &self,
        id: &CmId,
        pd: &ProtectionDomain,
        qp_init_attr: &QpInitAttr,
    ) -> io::Result<QueuePair> {
        let mut inner = self.lock();
        {
            let state = inner.id(id)?;
            if state.qp.is_some() {
                return Err(errno(libc::EEXIST));
            }
            if state.device != Some(pd.context) {
                return Err(errno(libc::EINVAL));
            }
        }
        if !inner.pds.contains_key(&pd.handle) {
            return Err(errno(libc::EBADF));
        }
        let (send_cq, recv_cq) = match (qp_init_attr.send_cq, qp_init_attr.recv_cq) {
            (Some(s), Some(r)) => (s.handle, r.handle),
            _ => return Err(errno(libc::EINVAL)),
        };
        for cq in [send_cq, recv_cq] {
            match inner.cqs.get(&cq) {
                Some(state) if state.cq.context == pd.context => {}
                Some(_) => return Err(errno(libc::EINVAL)),
                None => return Err(errno(libc::EBADF)),
            }
        }
        let qp = QueuePair {
            handle: inner.alloc_handle(),
            qp_num: inner.alloc_qp_num(),
            context: pd.context,
        };
        for cq in [send_cq, recv_cq] {
            if let Some(state) = inner.cqs.get_mut(&cq) {
                state.users += 1;
            }
        }
        inner.qps.insert(
            qp.qp_num,
            QpState {
                qp,
                id: id.0,
                pd: pd.handle,
                send_cq,
                recv_cq,
                sq_sig_all: qp_init_attr.sq_sig_all,
                remote: None,
                recvs: Default::default(),
                inbound: Default::default(),
            },
        );
        inner.id_mut(id)?.qp = Some(qp.qp_num);
        inner.stats.qps_created += 1;
        Ok(qp)
    }

    fn destroy_qp(&self, id: &CmId) -> io::Result<()> {
        let mut inner = self.lock();
        let qp_num = inner.id_mut(id)?.qp.take().ok_or_else(|| errno(libc::EINVAL))?;
        if let Some(qp) = inner.qps.remove(&qp_num) {
            debug_assert_eq!(qp.id, id.0);
            if let Some(peer) = qp.remote.and_then(|r| inner.qps.get_mut(&r)) {
                peer.remote = None;
            }
            for cq in [qp.send_cq, qp.recv_cq] {
                if let Some(state) = inner.cqs.get_mut(&cq) {
                    state.users = state.users.saturating_sub(1);
                }
            }
            log::trace!("loopback: destroyed qp {:#x} of {}", qp.qp.qp_num, id);
        }
        inner.stats.qps_destroyed += 1;
        Ok(())
    }

    fn device_context(&self, id: &CmId) -> Option<DeviceContext> {
        self.lock().ids.get(&id.0).and_then(|s| s.device)
    }

    fn local_addr(&self, id: &CmId) -> io::Result<SocketAddr> {
        self.lock()
            .id(id)?
            .local
            .ok_or_else(|| errno(libc::ENOTCONN))
    }

    fn peer_addr(&self, id: &CmId) -> io::Result<SocketAddr> {
        let inner = self.lock();
        let state = inner.id(id)?;
        match state.conn {
            ConnState::Idle | ConnState::Listening => Err(errno(libc::ENOTCONN)),
            _ => state.peer.ok_or_else(|| errno(libc::ENOTCONN)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use super::*;
    use crate::ibv::{QpCapability, QpType, RecvWr, Sge, VerbProvider, WcStatus};

    const TIMEOUT: Duration = Duration::from_secs(1);

    struct Pair {
        channel: EventChannel,
        client: CmId,
        server: CmId,
        client_qp: QueuePair,
        server_qp: QueuePair,
        cq: crate::ibv::CompletionQueue,
    }

    fn drain(fabric: &Fabric, channel: &EventChannel) -> Vec<CmEvent> {
        let mut events = Vec::new();
        while let Some(ev) = fabric
            .get_cm_event(channel, Duration::from_millis(20))
            .unwrap()
        {
            events.push(ev);
        }
        events
    }

    fn establish(fabric: &Fabric) -> Pair {
        let ctx = fabric.add_device(IpAddr::V4(Ipv4Addr::new(192, 168, 0, 1)));
        let channel = fabric.create_event_channel().unwrap();
        let addr: SocketAddr = "192.168.0.1:5000".parse().unwrap();
        let listener = fabric.create_id(&channel, PortSpace::Tcp).unwrap();
        fabric.bind_addr(&listener, &addr).unwrap();
        fabric.listen(&listener, 8).unwrap();

        let client = fabric.create_id(&channel, PortSpace::Tcp).unwrap();
        fabric.resolve_addr(&client, None, &addr, 100).unwrap();
        fabric.resolve_route(&client, 100).unwrap();
        let pd = fabric.alloc_pd(ctx).unwrap();
        let cq = fabric.create_cq(ctx, 64, None).unwrap();
        let attr = QpInitAttr::with_cq(cq, QpCapability::default(), QpType::RC);
        let client_qp = fabric.create_qp(&client, &pd, &attr).unwrap();
        fabric.connect(&client, &ConnParam::default()).unwrap();
        let request = drain(fabric, &channel)
            .into_iter()
            .find(|e| e.kind() == CmEventKind::ConnectRequest)
            .unwrap();
        let (server, _) = request.get_request().unwrap();
        let server_qp = fabric.create_qp(&server, &pd, &attr).unwrap();
        fabric.accept(&server, &ConnParam::default()).unwrap();
        drain(fabric, &channel);
        Pair {
            channel,
            client,
            server,
            client_qp,
            server_qp,
            cq,
        }
    }

    #[test]
    fn bind_twice_is_in_use() {
        let fabric = Fabric::new();
        fabric.add_device(IpAddr::V4(Ipv4Addr::new(10, 1, 1, 1)));
        let channel = fabric.create_event_channel().unwrap();
        let a = fabric.create_id(&channel, PortSpace::Tcp).unwrap();
        let b = fabric.create_id(&channel, PortSpace::Tcp).unwrap();
        let addr: SocketAddr = "10.1.1.1:6000".parse().unwrap();
        fabric.bind_addr(&a, &addr).unwrap();
        let err = fabric.bind_addr(&b, &addr).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EADDRINUSE));
        let err = fabric
            .bind_addr(&b, &"10.9.9.9:6000".parse().unwrap())
            .unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EADDRNOTAVAIL));
    }

    #[test]
    fn ephemeral_port_on_zero() {
        let fabric = Fabric::new();
        fabric.add_device(IpAddr::V4(Ipv4Addr::new(10, 1, 1, 1)));
        let channel = fabric.create_event_channel().unwrap();
        let id = fabric.create_id(&channel, PortSpace::Tcp).unwrap();
        fabric
            .bind_addr(&id, &"10.1.1.1:0".parse().unwrap())
            .unwrap();
        assert_ne!(fabric.local_addr(&id).unwrap().port(), 0);
    }

    #[test]
    fn disconnect_flushes_posted_receives() {
        let fabric = Fabric::new();
        let pair = establish(&fabric);
        let sge = vec![Sge {
            addr: 0,
            length: 32,
            lkey: 0,
        }];
        unsafe {
            fabric
                .post_recv(&pair.server_qp, &[RecvWr::new(9, sge)])
                .unwrap();
        }
        fabric.disconnect(&pair.client).unwrap();

        let events = drain(&fabric, &pair.channel);
        let mut ids: Vec<_> = events
            .iter()
            .filter(|e| e.kind() == CmEventKind::Disconnected)
            .map(|e| e.id())
            .collect();
        ids.sort();
        let mut expected = vec![pair.client, pair.server];
        expected.sort();
        assert_eq!(ids, expected);

        let mut wcs = Vec::new();
        fabric.poll_cq(&pair.cq, 8, &mut wcs).unwrap();
        assert_eq!(wcs.len(), 1);
        assert_eq!(wcs[0].wr_id, 9);
        assert_eq!(wcs[0].status, WcStatus::WR_FLUSH_ERR);

        // a disconnected qp no longer accepts sends
        let err = unsafe {
            fabric.post_send(
                &pair.client_qp,
                &[crate::ibv::SendWr::send(1, Vec::new())],
            )
        }
        .unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EINVAL));
    }

    #[test]
    fn destroy_id_requires_qp_released() {
        let fabric = Fabric::new();
        let pair = establish(&fabric);
        let err = fabric.destroy_id(&pair.client).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EBUSY));
        fabric.destroy_qp(&pair.client).unwrap();
        fabric.destroy_id(&pair.client).unwrap();
        // the peer observes the teardown
        let events = drain(&fabric, &pair.channel);
        assert!(events
            .iter()
            .any(|e| e.kind() == CmEventKind::Disconnected && e.id() == pair.server));
    }

    #[test]
    fn withdrawn_request_disconnects_passive_side() {
        let fabric = Fabric::new();
        let ctx = fabric.add_device(IpAddr::V4(Ipv4Addr::new(192, 168, 0, 1)));
        let channel = fabric.create_event_channel().unwrap();
        let addr: SocketAddr = "192.168.0.1:5000".parse().unwrap();
        let listener = fabric.create_id(&channel, PortSpace::Tcp).unwrap();
        fabric.bind_addr(&listener, &addr).unwrap();
        fabric.listen(&listener, 1).unwrap();

        let client = fabric.create_id(&channel, PortSpace::Tcp).unwrap();
        fabric.resolve_addr(&client, None, &addr, 100).unwrap();
        fabric.resolve_route(&client, 100).unwrap();
        let pd = fabric.alloc_pd(ctx).unwrap();
        let cq = fabric.create_cq(ctx, 64, None).unwrap();
        let attr = QpInitAttr::with_cq(cq, QpCapability::default(), QpType::RC);
        fabric.create_qp(&client, &pd, &attr).unwrap();
        fabric.connect(&client, &ConnParam::default()).unwrap();
        let (server, _) = drain(&fabric, &channel)
            .iter()
            .find_map(CmEvent::get_request)
            .unwrap();

        fabric.destroy_qp(&client).unwrap();
        fabric.destroy_id(&client).unwrap();
        let events = drain(&fabric, &channel);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind(), CmEventKind::Disconnected);
        assert_eq!(events[0].id(), server);
        // the backlog slot is free again
        let other = fabric.create_id(&channel, PortSpace::Tcp).unwrap();
        fabric.resolve_addr(&other, None, &addr, 100).unwrap();
        fabric.resolve_route(&other, 100).unwrap();
        fabric.create_qp(&other, &pd, &attr).unwrap();
        fabric.connect(&other, &ConnParam::default()).unwrap();
        assert!(drain(&fabric, &channel)
            .iter()
            .any(|e| e.kind() == CmEventKind::ConnectRequest));
        fabric.destroy_id(&server).unwrap();
    }
}
