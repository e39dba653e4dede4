use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use rdma::rdmacm::CmId;

use crate::endpoint::Endpoint;
use crate::error::{Error, Failure, Result};
use crate::group::Shared;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Initialized,
    ReadyForAccept,
    Closed,
}

#[derive(Debug)]
struct Inner {
    state: ServerState,
    /// Incoming connections in arrival order, not yet claimed by accept.
    pending: VecDeque<Arc<Endpoint>>,
}

/// A listening endpoint.
#[derive(Debug)]
pub struct ServerEndpoint {
    id: CmId,
    group: Weak<Shared>,
    inner: Mutex<Inner>,
    cond: Condvar,
}

impl ServerEndpoint {
    pub(crate) fn new(id: CmId, group: Weak<Shared>) -> Self {
        ServerEndpoint {
            id,
            group,
            inner: Mutex::new(Inner {
                state: ServerState::Initialized,
                pending: VecDeque::new(),
            }),
            cond: Condvar::new(),
        }
    }

    #[inline]
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[inline]
    fn shared(&self) -> Result<Arc<Shared>> {
        self.group.upgrade().ok_or(Error::AlreadyClosed)
    }

    #[inline]
    pub fn id(&self) -> CmId {
        self.id
    }

    pub fn state(&self) -> ServerState {
        self.lock().state
    }

    pub fn is_bound(&self) -> bool {
        self.state() == ServerState::ReadyForAccept
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ServerState::Closed
    }

    /// Connection requests received but not yet accepted.
    pub fn pending(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.shared()?.cm.local_addr(&self.id).map_err(Error::RdmaCm)
    }

    /// Bind to `addr` and start listening. A port of 0 picks an unused port; see
    /// [`local_addr`](Self::local_addr).
    pub fn bind(&self, addr: SocketAddr, backlog: i32) -> Result<()> {
        let shared = self.shared()?;
        let mut inner = self.lock();
        match inner.state {
            ServerState::Initialized => {}
            ServerState::ReadyForAccept => return Err(Error::AlreadyBound),
            ServerState::Closed => return Err(Error::AlreadyClosed),
        }
        shared.cm.bind_addr(&self.id, &addr).map_err(Error::RdmaCm)?;
        shared.cm.listen(&self.id, backlog).map_err(Error::RdmaCm)?;
        inner.state = ServerState::ReadyForAccept;
        tracing::debug!(id = %self.id, %addr, backlog, "listening");
        Ok(())
    }

    /// Block until a connection request arrives, then complete the handshake.
    pub fn accept(&self) -> Result<Arc<Endpoint>> {
        self.accept_inner(None)
    }

    /// Like [`accept`](Self::accept), waiting at most `timeout` for a request.
    pub fn accept_timeout(&self, timeout: Duration) -> Result<Arc<Endpoint>> {
        self.accept_inner(Some(timeout))
    }

    fn accept_inner(&self, timeout: Option<Duration>) -> Result<Arc<Endpoint>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let endpoint = self.next_pending(deadline)?;
            let shared = self.shared()?;
            match endpoint.accept_connection(&shared, shared.config.connect_timeout()) {
                Ok(()) => return Ok(endpoint),
                Err(Error::AlreadyClosed) => {
                    // the peer withdrew while the request was queued
                    tracing::debug!(id = %endpoint.id(), "skipping withdrawn connect request");
                    if let Err(e) = endpoint.close() {
                        tracing::warn!(id = %endpoint.id(), "closing withdrawn endpoint: {}", e);
                    }
                }
                Err(e) => {
                    tracing::debug!(id = %endpoint.id(), "accept failed: {}", e);
                    if let Err(e) = endpoint.close() {
                        tracing::warn!(id = %endpoint.id(), "closing rejected endpoint: {}", e);
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Pop the oldest pending request, waiting for one until `deadline`.
    fn next_pending(&self, deadline: Option<Instant>) -> Result<Arc<Endpoint>> {
        let mut inner = self.lock();
        loop {
            match inner.state {
                ServerState::Initialized => return Err(Error::NotBound),
                ServerState::Closed => return Err(Error::AlreadyClosed),
                ServerState::ReadyForAccept => {}
            }
            if let Some(endpoint) = inner.pending.pop_front() {
                return Ok(endpoint);
            }
            inner = match deadline {
                None => self
                    .cond
                    .wait(inner)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(Error::AcceptFailed(Failure::Timeout));
                    }
                    self.cond
                        .wait_timeout(inner, deadline - now)
                        .map(|(guard, _)| guard)
                        .unwrap_or_else(|e| e.into_inner().0)
                }
            };
        }
    }

    /// Queue an incoming connection. Called on the event thread.
    pub(crate) fn on_connect_request(&self, endpoint: Arc<Endpoint>) {
        let mut inner = self.lock();
        if inner.state != ServerState::ReadyForAccept {
            drop(inner);
            tracing::debug!(id = %self.id, conn = %endpoint.id(), "server not accepting, rejecting");
            if let Err(e) = endpoint.close() {
                tracing::warn!(conn = %endpoint.id(), "rejecting: {}", e);
            }
            return;
        }
        inner.pending.push_back(endpoint);
        self.cond.notify_all();
    }

    /// The listening identifier itself was disconnected.
    pub(crate) fn on_disconnected(&self) {
        let mut inner = self.lock();
        inner.state = ServerState::Closed;
        self.cond.notify_all();
    }

    /// Stop listening, reject unclaimed requests and release the identifier. Idempotent.
    pub fn close(&self) -> Result<()> {
        let pending = {
            let mut inner = self.lock();
            inner.state = ServerState::Closed;
            self.cond.notify_all();
            std::mem::take(&mut inner.pending)
        };
        for endpoint in pending {
            if let Err(e) = endpoint.close() {
                tracing::warn!(conn = %endpoint.id(), "closing pending endpoint: {}", e);
            }
        }
        let Some(shared) = self.group.upgrade() else {
            return Ok(());
        };
        if shared.servers.remove(&self.id).is_err() {
            // already released
            return Ok(());
        }
        let res = shared.cm.destroy_id(&self.id).map_err(Error::RdmaCm);
        tracing::debug!(id = %self.id, "server endpoint closed");
        res
    }
}
