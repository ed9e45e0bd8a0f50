//! Peer connection state machine.
//!
//! One [`PeerConn`] record exists per remote peer: per address for physical
//! NIs, per node for logical NIs. Establishment runs through the transport's
//! asynchronous steps (`ResolvingAddr` to `Connected`); operations that need
//! the peer queue on the record and are released in FIFO order once the
//! connection is usable, or failed with [`Error::ConnectionFailed`] when the
//! retry budget runs out.
//!
//! Only the event-processing thread advances the asynchronous steps, by
//! feeding [`TransportEvent`]s through [`ConnRegistry::dispatch`].

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use quanta::Instant;

use crate::error::{Error, Result};
use crate::transport::{ConnToken, Interface, PeerAddr, PeerInfo, TransportEvent};

/// Default retry budget per resolution phase.
pub const DEFAULT_RETRY_LIMIT: u32 = 3;

/// Connection establishment state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Disconnected,
    ResolvingAddr,
    ResolvingRoute,
    /// Route resolved; the connect request is being issued.
    Connect,
    /// Connect request sent, awaiting `Established`.
    Connecting,
    Connected,
}

/// Identity of the remote end of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerId {
    /// Physical addressing: the peer's node address.
    Addr(PeerAddr),
    /// Logical addressing: the peer's rank.
    Rank(u32),
    /// Inbound physical peer, known only by process id.
    Pid(u32),
}

/// An operation waiting for its connection to become usable.
///
/// Invoked with `Ok(())` when the connection reaches `Connected`, or with
/// `Err(ConnectionFailed)` when establishment fails or the peer tears the
/// connection down.
pub type PendingOp = Box<dyn FnOnce(Result<()>) + Send>;

/// Per-phase retry counters.
#[derive(Debug, Default, Clone, Copy)]
struct Retries {
    addr: u32,
    route: u32,
    connect: u32,
}

struct ConnInner {
    state: ConnState,
    token: Option<ConnToken>,
    retries: Retries,
    /// Peer record learned from the `Established` private data.
    peer_info: Option<PeerInfo>,
    /// Time of the last state transition, for diagnostics.
    since: Instant,
}

/// Per-peer connection record.
pub struct PeerConn {
    peer: PeerId,
    /// Address this record connects to. `None` for records that never own
    /// a transport connection (logical non-main ranks, inbound records).
    target: Option<PeerAddr>,
    /// Local endpoint record sent as connection private data.
    local: PeerInfo,
    iface: Arc<dyn Interface>,
    registry: Arc<ConnRegistry>,
    retry_limit: u32,
    inner: Mutex<ConnInner>,
    /// Operations we initiated, waiting for the connection.
    initiator_q: Mutex<VecDeque<PendingOp>>,
    /// Operations driven by the remote side (inbound transactions).
    target_q: Mutex<VecDeque<PendingOp>>,
    /// For logical non-main ranks: the node's main connection.
    main: Mutex<Option<Arc<PeerConn>>>,
    /// For logical main connections: dependent rank records, drained in
    /// rank order on establishment.
    dependents: Mutex<Vec<(u32, Arc<PeerConn>)>>,
}

impl PeerConn {
    fn new_record(
        peer: PeerId,
        target: Option<PeerAddr>,
        local: PeerInfo,
        iface: Arc<dyn Interface>,
        registry: Arc<ConnRegistry>,
        retry_limit: u32,
        state: ConnState,
        token: Option<ConnToken>,
    ) -> Arc<Self> {
        Arc::new(PeerConn {
            peer,
            target,
            local,
            iface,
            registry,
            retry_limit,
            inner: Mutex::new(ConnInner {
                state,
                token,
                retries: Retries::default(),
                peer_info: None,
                since: Instant::now(),
            }),
            initiator_q: Mutex::new(VecDeque::new()),
            target_q: Mutex::new(VecDeque::new()),
            main: Mutex::new(None),
            dependents: Mutex::new(Vec::new()),
        })
    }

    /// Create an active-side record that will connect to `target` on first
    /// use.
    pub fn outbound(
        peer: PeerId,
        target: PeerAddr,
        local: PeerInfo,
        iface: Arc<dyn Interface>,
        registry: Arc<ConnRegistry>,
        retry_limit: u32,
    ) -> Arc<Self> {
        Self::new_record(
            peer,
            Some(target),
            local,
            iface,
            registry,
            retry_limit,
            ConnState::Disconnected,
            None,
        )
    }

    /// Create a record for a logical non-main rank. It never owns a
    /// transport connection; all progress is driven by `main`.
    pub fn dependent(rank: u32, main: &Arc<PeerConn>) -> Arc<Self> {
        let conn = Self::new_record(
            PeerId::Rank(rank),
            None,
            main.local.clone(),
            main.iface.clone(),
            main.registry.clone(),
            main.retry_limit,
            ConnState::Disconnected,
            None,
        );
        *conn.main.lock().unwrap() = Some(main.clone());
        let mut deps = main.dependents.lock().unwrap();
        deps.push((rank, conn.clone()));
        deps.sort_by_key(|(r, _)| *r);
        conn
    }

    /// Accept an inbound connect request, creating a passive-side record in
    /// `Connecting` state. Registers the token and sends the accept.
    pub fn inbound(
        peer: PeerId,
        token: ConnToken,
        private: &[u8],
        local: PeerInfo,
        iface: Arc<dyn Interface>,
        registry: Arc<ConnRegistry>,
        retry_limit: u32,
    ) -> Arc<Self> {
        let conn = Self::new_record(
            peer,
            None,
            local,
            iface,
            registry,
            retry_limit,
            ConnState::Connecting,
            Some(token),
        );
        conn.inner.lock().unwrap().peer_info = PeerInfo::from_private(private);
        conn.registry.register(token, &conn);
        conn.iface.accept(token, &conn.local.to_private());
        conn
    }

    /// The remote identity of this record.
    pub fn peer(&self) -> PeerId {
        self.peer
    }

    /// Current establishment state.
    pub fn state(&self) -> ConnState {
        self.inner.lock().unwrap().state
    }

    /// Peer record learned during establishment, if connected.
    pub fn peer_info(&self) -> Option<PeerInfo> {
        self.inner.lock().unwrap().peer_info.clone()
    }

    /// Number of operations queued on this record.
    pub fn queued(&self) -> usize {
        self.initiator_q.lock().unwrap().len() + self.target_q.lock().unwrap().len()
    }

    /// Submit an operation that needs this peer.
    ///
    /// Runs `op` immediately if the connection is up. Otherwise queues it
    /// and, if the connection is idle, starts establishment. For a logical
    /// non-main rank the node's main connection is the one established.
    pub fn submit(self: &Arc<Self>, op: PendingOp) {
        let main = self.main.lock().unwrap().clone();
        let driver = main.as_ref().unwrap_or(self);

        let start = {
            let mut inner = driver.inner.lock().unwrap();
            if inner.state == ConnState::Connected {
                drop(inner);
                op(Ok(()));
                return;
            }
            // Queue under the driver's state lock so the establishment
            // drain cannot slip between the check and the push.
            self.initiator_q.lock().unwrap().push_back(op);
            if inner.state == ConnState::Disconnected {
                inner.state = ConnState::ResolvingAddr;
                inner.retries = Retries::default();
                inner.since = Instant::now();
                true
            } else {
                false
            }
        };
        if start {
            driver.kick_resolve_addr();
        }
    }

    /// Queue a target-side operation (remote-driven transaction) behind the
    /// connection. Runs immediately if already connected.
    pub fn submit_target(self: &Arc<Self>, op: PendingOp) {
        let inner = self.inner.lock().unwrap();
        if inner.state == ConnState::Connected {
            drop(inner);
            op(Ok(()));
        } else {
            self.target_q.lock().unwrap().push_back(op);
        }
    }

    /// Issue (or re-issue) address resolution. The caller must have set the
    /// state to `ResolvingAddr` already; transport calls are made without
    /// holding the state lock.
    fn kick_resolve_addr(self: &Arc<Self>) {
        let Some(target) = self.target else {
            log::error!("conn {:?}: no target address to resolve", self.peer);
            self.fail_all();
            return;
        };
        let token = {
            let mut inner = self.inner.lock().unwrap();
            match inner.token {
                Some(t) => t,
                None => {
                    let t = self.iface.create_conn();
                    inner.token = Some(t);
                    t
                }
            }
        };
        self.registry.register(token, self);
        log::debug!("conn {:?}: resolving address of {}", self.peer, target);
        self.iface.resolve_addr(token, target);
    }

    pub(crate) fn on_addr_resolved(self: &Arc<Self>) {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.state != ConnState::ResolvingAddr {
                log::debug!("conn {:?}: stale address-resolved event", self.peer);
                return;
            }
            inner.state = ConnState::ResolvingRoute;
            inner.since = Instant::now();
        }
        self.kick_resolve_route();
    }

    pub(crate) fn on_addr_error(self: &Arc<Self>) {
        let retry = {
            let mut inner = self.inner.lock().unwrap();
            if inner.state != ConnState::ResolvingAddr {
                return;
            }
            inner.retries.addr += 1;
            inner.retries.addr <= self.retry_limit
        };
        if retry {
            log::warn!("conn {:?}: address resolution failed, retrying", self.peer);
            self.kick_resolve_addr();
        } else {
            log::error!(
                "conn {:?}: address resolution failed {} times, giving up",
                self.peer,
                self.retry_limit + 1
            );
            self.fail_all();
        }
    }

    fn kick_resolve_route(self: &Arc<Self>) {
        let token = self.inner.lock().unwrap().token;
        if let Some(token) = token {
            self.iface.resolve_route(token);
        }
    }

    pub(crate) fn on_route_resolved(self: &Arc<Self>) {
        let token = {
            let mut inner = self.inner.lock().unwrap();
            if inner.state != ConnState::ResolvingRoute {
                log::debug!("conn {:?}: stale route-resolved event", self.peer);
                return;
            }
            inner.state = ConnState::Connect;
            inner.since = Instant::now();
            inner.token
        };
        if let Some(token) = token {
            log::debug!("conn {:?}: route resolved, connecting", self.peer);
            self.iface.connect(token, &self.local.to_private());
            let mut inner = self.inner.lock().unwrap();
            if inner.state == ConnState::Connect {
                inner.state = ConnState::Connecting;
            }
        }
    }

    pub(crate) fn on_route_error(self: &Arc<Self>) {
        let retry = {
            let mut inner = self.inner.lock().unwrap();
            if inner.state != ConnState::ResolvingRoute {
                return;
            }
            inner.retries.route += 1;
            inner.retries.route <= self.retry_limit
        };
        if retry {
            log::warn!("conn {:?}: route resolution failed, retrying", self.peer);
            self.kick_resolve_route();
        } else {
            log::error!("conn {:?}: route resolution retry budget spent", self.peer);
            self.fail_all();
        }
    }

    pub(crate) fn on_connect_error(self: &Arc<Self>) {
        let (retry, token) = {
            let mut inner = self.inner.lock().unwrap();
            if !matches!(inner.state, ConnState::Connect | ConnState::Connecting) {
                return;
            }
            inner.retries.connect += 1;
            (inner.retries.connect <= self.retry_limit, inner.token)
        };
        if retry {
            log::warn!("conn {:?}: connect failed, retrying", self.peer);
            if let Some(token) = token {
                self.iface.connect(token, &self.local.to_private());
            }
        } else {
            log::error!("conn {:?}: connect retry budget spent", self.peer);
            self.fail_all();
        }
    }

    /// The connection is established. Drain queued operations in FIFO
    /// order, then dependent rank records in rank order.
    pub(crate) fn on_established(self: &Arc<Self>, private: &[u8]) {
        let waited = {
            let mut inner = self.inner.lock().unwrap();
            if inner.state == ConnState::Connected {
                return;
            }
            let waited = inner.since.elapsed();
            inner.state = ConnState::Connected;
            inner.retries = Retries::default();
            inner.peer_info = PeerInfo::from_private(private);
            inner.since = Instant::now();
            waited
        };
        log::debug!("conn {:?}: established after {:?}", self.peer, waited);
        self.drain_queues(Ok(()));

        let deps: Vec<_> = self.dependents.lock().unwrap().clone();
        for (_, dep) in deps {
            dep.inner.lock().unwrap().state = ConnState::Connected;
            dep.drain_queues(Ok(()));
        }
    }

    pub(crate) fn on_disconnected(self: &Arc<Self>) {
        log::debug!("conn {:?}: peer disconnected", self.peer);
        self.fail_all();
    }

    /// Tear this connection down. The peer observes a disconnect event.
    pub fn shutdown(self: &Arc<Self>) {
        let token = self.inner.lock().unwrap().token;
        if let Some(token) = token {
            self.iface.disconnect(token);
        }
    }

    /// Fail every queued operation and return to `Disconnected`. Dependent
    /// rank records are failed the same way.
    fn fail_all(self: &Arc<Self>) {
        let token = {
            let mut inner = self.inner.lock().unwrap();
            inner.state = ConnState::Disconnected;
            inner.retries = Retries::default();
            inner.peer_info = None;
            inner.since = Instant::now();
            inner.token.take()
        };
        if let Some(token) = token {
            self.registry.unregister(token);
            self.iface.destroy_conn(token);
        }
        self.drain_queues(Err(Error::ConnectionFailed));

        let deps: Vec<_> = self.dependents.lock().unwrap().clone();
        for (_, dep) in deps {
            dep.inner.lock().unwrap().state = ConnState::Disconnected;
            dep.drain_queues(Err(Error::ConnectionFailed));
        }
    }

    fn drain_queues(&self, result: Result<()>) {
        let ops: Vec<PendingOp> = {
            let mut q = self.initiator_q.lock().unwrap();
            q.drain(..).collect()
        };
        for op in ops {
            op(result.clone());
        }
        let ops: Vec<PendingOp> = {
            let mut q = self.target_q.lock().unwrap();
            q.drain(..).collect()
        };
        for op in ops {
            op(result.clone());
        }
    }
}

impl fmt::Debug for PeerConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerConn")
            .field("peer", &self.peer)
            .field("target", &self.target)
            .finish()
    }
}

/// Maps transport connection tokens to the records they advance.
///
/// Owned by the global state; written by connecting threads and read by the
/// event thread.
pub struct ConnRegistry {
    map: Mutex<HashMap<ConnToken, Weak<PeerConn>>>,
}

impl ConnRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(ConnRegistry {
            map: Mutex::new(HashMap::new()),
        })
    }

    fn register(&self, token: ConnToken, conn: &Arc<PeerConn>) {
        self.map
            .lock()
            .unwrap()
            .insert(token, Arc::downgrade(conn));
    }

    fn unregister(&self, token: ConnToken) {
        self.map.lock().unwrap().remove(&token);
    }

    fn lookup(&self, token: ConnToken) -> Option<Arc<PeerConn>> {
        self.map.lock().unwrap().get(&token).and_then(Weak::upgrade)
    }

    /// Route a connection-management event to its record.
    ///
    /// Returns events this layer does not handle (`ConnectRequest` needs an
    /// NI-level accept decision, `Shutdown` stops the event loop) back to
    /// the caller.
    pub fn dispatch(&self, ev: TransportEvent) -> Option<TransportEvent> {
        use TransportEvent::*;
        match ev {
            AddrResolved(t) => {
                if let Some(c) = self.lookup(t) {
                    c.on_addr_resolved();
                }
            }
            AddrError(t) => {
                if let Some(c) = self.lookup(t) {
                    c.on_addr_error();
                }
            }
            RouteResolved(t) => {
                if let Some(c) = self.lookup(t) {
                    c.on_route_resolved();
                }
            }
            RouteError(t) => {
                if let Some(c) = self.lookup(t) {
                    c.on_route_error();
                }
            }
            Established { token, private } => {
                if let Some(c) = self.lookup(token) {
                    c.on_established(&private);
                }
            }
            ConnectError(t) => {
                if let Some(c) = self.lookup(t) {
                    c.on_connect_error();
                }
            }
            Disconnected(t) => {
                if let Some(c) = self.lookup(t) {
                    c.on_disconnected();
                }
            }
            ev @ (ConnectRequest { .. } | Shutdown) => return Some(ev),
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::sim::{SimIface, SimNet};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn local_info() -> PeerInfo {
        PeerInfo {
            rank: None,
            pid: 42,
            srq_num: 1,
        }
    }

    /// Drive the sim interface the way the event thread would, answering
    /// inbound connect requests with an accept.
    fn pump(iface: &Arc<SimIface>, registry: &Arc<ConnRegistry>) {
        while let Some(ev) = iface.poll_event(Duration::from_millis(10)) {
            if let Some(TransportEvent::ConnectRequest { token, private }) =
                registry.dispatch(ev)
            {
                PeerConn::inbound(
                    PeerId::Rank(0),
                    token,
                    &private,
                    local_info(),
                    iface.clone() as Arc<dyn Interface>,
                    registry.clone(),
                    DEFAULT_RETRY_LIMIT,
                );
            }
        }
    }

    fn outbound_loopback(
        iface: &Arc<SimIface>,
        registry: &Arc<ConnRegistry>,
    ) -> Arc<PeerConn> {
        PeerConn::outbound(
            PeerId::Addr(iface.addr()),
            iface.addr(),
            local_info(),
            iface.clone() as Arc<dyn Interface>,
            registry.clone(),
            DEFAULT_RETRY_LIMIT,
        )
    }

    #[test]
    fn queued_ops_release_in_fifo_order() {
        let net = SimNet::new();
        let iface = net.add_iface("sim0");
        let registry = ConnRegistry::new();
        let conn = outbound_loopback(&iface, &registry);

        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5 {
            let order = order.clone();
            conn.submit(Box::new(move |r| {
                assert!(r.is_ok());
                order.lock().unwrap().push(i);
            }));
        }
        assert_eq!(conn.queued(), 5);

        pump(&iface, &registry);
        assert_eq!(conn.state(), ConnState::Connected);
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
        assert_eq!(conn.queued(), 0);
    }

    #[test]
    fn op_after_connected_runs_immediately() {
        let net = SimNet::new();
        let iface = net.add_iface("sim0");
        let registry = ConnRegistry::new();
        let conn = outbound_loopback(&iface, &registry);

        conn.submit(Box::new(|_| {}));
        pump(&iface, &registry);
        assert_eq!(conn.state(), ConnState::Connected);

        let ran = Arc::new(AtomicUsize::new(0));
        let r = ran.clone();
        conn.submit(Box::new(move |res| {
            assert!(res.is_ok());
            r.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn addr_retry_exhaustion_fails_all_queued() {
        let net = SimNet::new();
        let iface = net.add_iface("sim0");
        let registry = ConnRegistry::new();
        let conn = outbound_loopback(&iface, &registry);

        // Initial attempt plus every retry fails.
        iface.fail_next_addr_resolves(DEFAULT_RETRY_LIMIT + 1);

        let failures = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let failures = failures.clone();
            conn.submit(Box::new(move |r| {
                assert_eq!(r, Err(Error::ConnectionFailed));
                failures.fetch_add(1, Ordering::SeqCst);
            }));
        }

        pump(&iface, &registry);
        assert_eq!(conn.state(), ConnState::Disconnected);
        assert_eq!(failures.load(Ordering::SeqCst), 3);
        assert_eq!(conn.queued(), 0);
    }

    #[test]
    fn addr_retry_under_budget_succeeds() {
        let net = SimNet::new();
        let iface = net.add_iface("sim0");
        let registry = ConnRegistry::new();
        let conn = outbound_loopback(&iface, &registry);

        iface.fail_next_addr_resolves(DEFAULT_RETRY_LIMIT);
        let ok = Arc::new(AtomicUsize::new(0));
        let o = ok.clone();
        conn.submit(Box::new(move |r| {
            assert!(r.is_ok());
            o.fetch_add(1, Ordering::SeqCst);
        }));

        pump(&iface, &registry);
        assert_eq!(conn.state(), ConnState::Connected);
        assert_eq!(ok.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dependent_rank_drains_after_main() {
        let net = SimNet::new();
        let iface = net.add_iface("sim0");
        let registry = ConnRegistry::new();
        let main = outbound_loopback(&iface, &registry);
        let dep_b = PeerConn::dependent(7, &main);
        let dep_a = PeerConn::dependent(3, &main);

        let order = Arc::new(Mutex::new(Vec::new()));
        for (tag, conn) in [(7u32, &dep_b), (3, &dep_a)] {
            let order = order.clone();
            conn.submit(Box::new(move |r| {
                assert!(r.is_ok());
                order.lock().unwrap().push(tag);
            }));
        }
        // Dependents never own a transport connection.
        assert_eq!(dep_a.state(), ConnState::Disconnected);

        pump(&iface, &registry);
        assert_eq!(main.state(), ConnState::Connected);
        assert_eq!(dep_a.state(), ConnState::Connected);
        assert_eq!(dep_b.state(), ConnState::Connected);
        // Rank order, not submission order.
        assert_eq!(*order.lock().unwrap(), vec![3, 7]);
    }

    #[test]
    fn disconnect_fails_connected_peers_queues() {
        let net = SimNet::new();
        let iface = net.add_iface("sim0");
        let registry = ConnRegistry::new();
        let conn = outbound_loopback(&iface, &registry);

        conn.submit(Box::new(|_| {}));
        pump(&iface, &registry);
        assert_eq!(conn.state(), ConnState::Connected);

        conn.shutdown();
        pump(&iface, &registry);
        assert_eq!(conn.state(), ConnState::Disconnected);
    }
}
