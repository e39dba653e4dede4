#![allow(dead_code)]
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::thread;

use rdma::ibv::{RecvWr, SendWr, Sge, WorkCompletion};
use rdma::loopback::Fabric;
use rdma::rdmacm::CmId;
use rdma_endpoint::{
    CompletionHandler, CqMode, Endpoint, EndpointFactory, EndpointGroup, GroupConfig, NotifyMode,
    ServerEndpoint,
};

pub const TIMEOUT: Duration = Duration::from_secs(5);
pub const DEVICE_IP: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));

/// Completions observed by the handlers a group hands out, tagged with the endpoint id.
#[derive(Default)]
pub struct Recorder {
    pub completions: spin::Mutex<Vec<(CmId, WorkCompletion)>>,
}

impl Recorder {
    pub fn count(&self, id: CmId) -> usize {
        self.completions
            .lock()
            .iter()
            .filter(|(i, _)| *i == id)
            .count()
    }

    pub fn wr_ids(&self, id: CmId) -> Vec<u64> {
        self.completions
            .lock()
            .iter()
            .filter(|(i, _)| *i == id)
            .map(|(_, wc)| wc.wr_id)
            .collect()
    }
}

pub fn recording_factory(recorder: &Arc<Recorder>) -> Arc<dyn EndpointFactory> {
    let recorder = Arc::clone(recorder);
    Arc::new(move |id: CmId, _server_side: bool| -> Arc<dyn CompletionHandler> {
        let recorder = Arc::clone(&recorder);
        Arc::new(move |wc: &WorkCompletion| {
            recorder.completions.lock().push((id, wc.clone()));
        })
    })
}

pub fn fabric() -> Arc<Fabric> {
    // the first test of a binary installs the subscriber
    let _ = rdma_endpoint::logging::init_log("warn", false);
    let fabric = Arc::new(Fabric::new());
    fabric.add_device(DEVICE_IP);
    fabric
}

pub fn config(cq_mode: CqMode, notify: NotifyMode) -> GroupConfig {
    GroupConfig {
        cq_mode,
        notify,
        cm_event_timeout_ms: 10,
        cq_event_timeout_ms: 10,
        ..Default::default()
    }
}

pub fn group_with(
    fabric: &Arc<Fabric>,
    config: GroupConfig,
    factory: Arc<dyn EndpointFactory>,
) -> EndpointGroup {
    EndpointGroup::new(fabric.clone(), fabric.clone(), config, factory).unwrap()
}

pub fn group(fabric: &Arc<Fabric>, recorder: &Arc<Recorder>) -> EndpointGroup {
    group_with(
        fabric,
        config(CqMode::Active, NotifyMode::Blocking),
        recording_factory(recorder),
    )
}

pub fn listen(group: &EndpointGroup) -> (Arc<ServerEndpoint>, SocketAddr) {
    let server = group.create_server_endpoint().unwrap();
    server.bind(SocketAddr::new(DEVICE_IP, 0), 16).unwrap();
    let addr = server.local_addr().unwrap();
    (server, addr)
}

/// Connect a fresh endpoint of `group` to `server`, returning both ends.
pub fn connect_pair(
    group: &EndpointGroup,
    server: &ServerEndpoint,
    addr: SocketAddr,
) -> (Arc<Endpoint>, Arc<Endpoint>) {
    let client = group.create_endpoint().unwrap();
    let accepted = thread::scope(|s| {
        let acceptor = s.spawn(|_| server.accept_timeout(TIMEOUT).unwrap());
        client.connect(addr, TIMEOUT).unwrap();
        acceptor.join().unwrap()
    })
    .unwrap();
    (client, accepted)
}

pub fn sge() -> Vec<Sge> {
    vec![Sge {
        addr: 0,
        length: 16,
        lkey: 0,
    }]
}

/// `receiver` posts one receive, `sender` one signaled send.
pub fn exchange(sender: &Endpoint, receiver: &Endpoint, wr_id: u64) {
    unsafe {
        receiver.post_recv(&[RecvWr::new(wr_id, sge())]).unwrap();
        sender.post_send(&[SendWr::send(wr_id, sge())]).unwrap();
    }
}

pub fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    cond()
}
