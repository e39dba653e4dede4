mod common;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crossbeam::thread;

use rdma::rdmacm::CmEventKind;
use rdma_endpoint::{EndpointState, Error, Failure, ServerState};

use common::*;

#[test]
fn bind_rules() {
    let fabric = fabric();
    let recorder = Arc::new(Recorder::default());
    let group = group(&fabric, &recorder);
    let server = group.create_server_endpoint().unwrap();
    assert_eq!(server.state(), ServerState::Initialized);
    assert!(matches!(server.accept(), Err(Error::NotBound)));

    server.bind(SocketAddr::new(DEVICE_IP, 0), 4).unwrap();
    assert!(server.is_bound());
    assert_ne!(server.local_addr().unwrap().port(), 0);
    assert!(matches!(
        server.bind(SocketAddr::new(DEVICE_IP, 0), 4),
        Err(Error::AlreadyBound)
    ));

    // a second listener cannot take the same address
    let other = group.create_server_endpoint().unwrap();
    let err = other.bind(server.local_addr().unwrap(), 4).unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::EADDRINUSE));
    assert_eq!(other.state(), ServerState::Initialized);

    server.close().unwrap();
    server.close().unwrap();
    assert!(matches!(server.accept(), Err(Error::AlreadyClosed)));
    assert!(matches!(
        server.bind(SocketAddr::new(DEVICE_IP, 0), 4),
        Err(Error::AlreadyClosed)
    ));
    assert_eq!(group.server_count(), 1);
}

#[test]
fn accept_times_out() {
    let fabric = fabric();
    let recorder = Arc::new(Recorder::default());
    let group = group(&fabric, &recorder);
    let (server, _addr) = listen(&group);
    assert!(matches!(
        server.accept_timeout(Duration::from_millis(20)),
        Err(Error::AcceptFailed(Failure::Timeout))
    ));
    assert_eq!(server.state(), ServerState::ReadyForAccept);
}

#[test]
fn requests_are_accepted_in_arrival_order() {
    let fabric = fabric();
    let recorder = Arc::new(Recorder::default());
    let group = group(&fabric, &recorder);
    let (server, addr) = listen(&group);
    let clients: Vec<_> = (0..3).map(|_| group.create_endpoint().unwrap()).collect();

    thread::scope(|s| {
        let mut connecting = Vec::new();
        for (i, client) in clients.iter().enumerate() {
            connecting.push(s.spawn(move |_| client.connect(addr, TIMEOUT)));
            assert!(wait_for(|| server.pending() == i + 1));
        }
        for client in &clients {
            let accepted = server.accept_timeout(TIMEOUT).unwrap();
            assert!(accepted.is_server_side());
            assert_eq!(accepted.peer_addr().unwrap(), client.local_addr().unwrap());
        }
        for handle in connecting {
            handle.join().unwrap().unwrap();
        }
    })
    .unwrap();

    assert_eq!(server.pending(), 0);
    assert!(clients.iter().all(|c| c.is_connected()));
}

#[test]
fn close_rejects_pending_requests() {
    let fabric = fabric();
    let recorder = Arc::new(Recorder::default());
    let group = group(&fabric, &recorder);
    let (server, addr) = listen(&group);
    let client = group.create_endpoint().unwrap();

    thread::scope(|s| {
        let connecting = s.spawn(|_| client.connect(addr, TIMEOUT));
        assert!(wait_for(|| server.pending() == 1));
        server.close().unwrap();
        let err = connecting.join().unwrap().unwrap_err();
        assert!(matches!(
            err,
            Error::ConnectFailed(Failure::Event {
                kind: CmEventKind::Rejected,
                ..
            })
        ));
    })
    .unwrap();

    assert_eq!(server.state(), ServerState::Closed);
    assert_eq!(server.pending(), 0);
    assert_eq!(client.state(), EndpointState::ResourcesAllocated);
    // only the active side is left
    assert_eq!(group.endpoint_count(), 1);
    assert_eq!(group.server_count(), 0);

    // nobody listens on the address anymore
    let late = group.create_endpoint().unwrap();
    assert!(matches!(
        late.connect(addr, TIMEOUT),
        Err(Error::ConnectFailed(Failure::Event {
            kind: CmEventKind::Rejected,
            ..
        }))
    ));
}

#[test]
fn withdrawn_request_is_skipped() {
    let fabric = fabric();
    let recorder = Arc::new(Recorder::default());
    let group = group(&fabric, &recorder);
    let (server, addr) = listen(&group);
    let quitter = group.create_endpoint().unwrap();
    let stayer = group.create_endpoint().unwrap();

    thread::scope(|s| {
        let quitting = s.spawn(|_| quitter.connect(addr, TIMEOUT));
        assert!(wait_for(|| server.pending() == 1));
        quitter.close().unwrap();
        assert!(matches!(
            quitting.join().unwrap(),
            Err(Error::ConnectFailed(Failure::Closed))
        ));

        // the withdrawal is routed before the second request arrives
        let staying = s.spawn(|_| stayer.connect(addr, TIMEOUT));
        assert!(wait_for(|| server.pending() == 2));
        let accepted = server.accept_timeout(TIMEOUT).unwrap();
        assert_eq!(accepted.peer_addr().unwrap(), stayer.local_addr().unwrap());
        staying.join().unwrap().unwrap();
    })
    .unwrap();

    assert_eq!(server.pending(), 0);
    assert_eq!(server.state(), ServerState::ReadyForAccept);
    assert!(stayer.is_connected());
    // only the connected pair is left
    assert_eq!(group.endpoint_count(), 2);
}

#[test]
fn blocked_accept_wakes_on_close() {
    let fabric = fabric();
    let recorder = Arc::new(Recorder::default());
    let group = group(&fabric, &recorder);
    let (server, _addr) = listen(&group);

    thread::scope(|s| {
        let acceptor = s.spawn(|_| server.accept());
        std::thread::sleep(Duration::from_millis(20));
        server.close().unwrap();
        assert!(matches!(
            acceptor.join().unwrap(),
            Err(Error::AlreadyClosed)
        ));
    })
    .unwrap();
}

#[test]
fn connect_request_carries_to_separate_group() {
    let fabric = fabric();
    let recorder = Arc::new(Recorder::default());
    let server_group = group(&fabric, &recorder);
    let client_group = group(&fabric, &recorder);
    let (server, addr) = listen(&server_group);
    let (client, accepted) = connect_pair(&client_group, &server, addr);

    assert_eq!(client_group.endpoint_count(), 1);
    assert_eq!(server_group.endpoint_count(), 1);
    assert!(client.is_connected());
    assert!(accepted.is_connected());

    server_group.close().unwrap();
    assert!(wait_for(|| client.is_closed()));
    client_group.close().unwrap();
}
