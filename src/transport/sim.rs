//! Deterministic in-process transport.
//!
//! [`SimNet`] models a network of transport interfaces living inside one
//! process. Connection management runs through the same asynchronous event
//! flow as a hardware transport (resolve address, resolve route, connect,
//! establish), with every step materialized as a [`TransportEvent`] on the
//! destination interface's queue. Failure injection hooks let tests
//! exercise the retry and partial-post recovery paths.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::Duration;

use super::{
    CompQueue, ConnToken, IfaceInfo, Interface, MemoryKey, PeerAddr, RecvWr, SharedRecvQueue,
    TransportEvent, TransportProvider, Wc, WcOpcode, WcStatus,
};

/// The port every sim interface listens on.
const SIM_PORT: u16 = 7710;

/// A connect request waiting for the passive side to accept or reject.
struct PendingConnect {
    active: Weak<SimIface>,
    active_token: ConnToken,
    active_private: Vec<u8>,
}

/// One side of an established pairing; maps a token to the opposite side.
struct Paired {
    iface: Weak<SimIface>,
    token: ConnToken,
}

#[derive(Default)]
struct NetState {
    ifaces: Vec<Arc<SimIface>>,
    /// Target address recorded by a successful `resolve_addr`, per token.
    resolved: HashMap<ConnToken, PeerAddr>,
    /// Connect requests awaiting accept/reject, keyed by passive token.
    pending: HashMap<ConnToken, PendingConnect>,
    /// Established pairings, keyed by either side's token.
    paired: HashMap<ConnToken, Paired>,
    /// Created shared receive queues, so tests can drive completions.
    srqs: HashMap<u32, Weak<SimSrq>>,
    next_token: ConnToken,
    next_srq_num: u32,
}

/// An in-process network of simulated transport interfaces.
pub struct SimNet {
    state: Mutex<NetState>,
}

impl SimNet {
    /// Create an empty network.
    pub fn new() -> Arc<Self> {
        Arc::new(SimNet {
            state: Mutex::new(NetState {
                next_token: 1,
                next_srq_num: 1,
                ..Default::default()
            }),
        })
    }

    /// Add an interface to the network. Addresses are assigned in order:
    /// `10.77.0.1`, `10.77.0.2`, ...
    pub fn add_iface(self: &Arc<Self>, name: &str) -> Arc<SimIface> {
        let mut state = self.state.lock().unwrap();
        let index = state.ifaces.len() as u32;
        let addr = PeerAddr::new(Ipv4Addr::new(10, 77, 0, (index + 1) as u8), SIM_PORT);
        let iface = Arc::new(SimIface {
            net: Arc::downgrade(self),
            name: name.to_owned(),
            addr,
            events: Mutex::new(VecDeque::new()),
            events_cv: Condvar::new(),
            faults: Mutex::new(Faults::default()),
            next_key: AtomicU32::new(1),
        });
        state.ifaces.push(iface.clone());
        iface
    }

    /// Find an interface by name.
    pub fn iface(&self, name: &str) -> Option<Arc<SimIface>> {
        let state = self.state.lock().unwrap();
        state.ifaces.iter().find(|i| i.name == name).cloned()
    }

    /// Find a shared receive queue by its number.
    pub fn srq(&self, num: u32) -> Option<Arc<SimSrq>> {
        let state = self.state.lock().unwrap();
        state.srqs.get(&num).and_then(Weak::upgrade)
    }

    fn iface_at(&self, addr: PeerAddr) -> Option<Arc<SimIface>> {
        let state = self.state.lock().unwrap();
        state.ifaces.iter().find(|i| i.addr == addr).cloned()
    }

    fn fresh_token(&self) -> ConnToken {
        let mut state = self.state.lock().unwrap();
        let token = state.next_token;
        state.next_token += 1;
        token
    }

    fn fresh_srq_num(&self) -> u32 {
        let mut state = self.state.lock().unwrap();
        let num = state.next_srq_num;
        state.next_srq_num += 1;
        num
    }
}

impl TransportProvider for SimNet {
    fn list(&self) -> Vec<IfaceInfo> {
        let state = self.state.lock().unwrap();
        state
            .ifaces
            .iter()
            .enumerate()
            .map(|(index, iface)| IfaceInfo {
                name: iface.name.clone(),
                addr: iface.addr,
                index: index as u32,
            })
            .collect()
    }

    fn open(&self, info: &IfaceInfo) -> io::Result<Arc<dyn Interface>> {
        self.iface(&info.name)
            .map(|i| i as Arc<dyn Interface>)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such sim interface"))
    }
}

/// Failure injection budgets. Each consumed failure decrements its budget.
#[derive(Default)]
struct Faults {
    fail_addr: u32,
    fail_route: u32,
    fail_connect: u32,
    reject_posts_from: Option<usize>,
}

/// One simulated transport interface.
pub struct SimIface {
    net: Weak<SimNet>,
    name: String,
    addr: PeerAddr,
    events: Mutex<VecDeque<TransportEvent>>,
    events_cv: Condvar,
    faults: Mutex<Faults>,
    next_key: AtomicU32,
}

impl SimIface {
    /// Fail the next `n` address resolutions with `AddrError`.
    pub fn fail_next_addr_resolves(&self, n: u32) {
        self.faults.lock().unwrap().fail_addr = n;
    }

    /// Fail the next `n` route resolutions with `RouteError`.
    pub fn fail_next_route_resolves(&self, n: u32) {
        self.faults.lock().unwrap().fail_route = n;
    }

    /// Fail the next `n` connect attempts with `ConnectError`.
    pub fn fail_next_connects(&self, n: u32) {
        self.faults.lock().unwrap().fail_connect = n;
    }

    /// Make the next SRQ post on this interface reject every work request
    /// starting at chain index `i`.
    pub fn reject_posts_from(&self, i: usize) {
        self.faults.lock().unwrap().reject_posts_from = Some(i);
    }

    /// Number of events waiting to be polled.
    pub fn pending_events(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    fn push_event(&self, ev: TransportEvent) {
        self.events.lock().unwrap().push_back(ev);
        self.events_cv.notify_one();
    }

    fn net(&self) -> Option<Arc<SimNet>> {
        self.net.upgrade()
    }

    /// The `Arc` this interface is registered under.
    fn me(&self) -> Option<Arc<SimIface>> {
        self.net().and_then(|n| n.iface_at(self.addr))
    }
}

impl Interface for SimIface {
    fn name(&self) -> &str {
        &self.name
    }

    fn addr(&self) -> PeerAddr {
        self.addr
    }

    fn create_srq(
        &self,
        _cq_depth: u32,
        _max_wr: u32,
    ) -> io::Result<Arc<dyn SharedRecvQueue>> {
        let net = self
            .net()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "network gone"))?;
        let num = net.fresh_srq_num();
        let srq = Arc::new(SimSrq {
            num,
            cq: Arc::new(SimCq {
                entries: Mutex::new(VecDeque::new()),
            }),
            posted: Mutex::new(VecDeque::new()),
            iface: self.me().map(|i| Arc::downgrade(&i)),
        });
        net.state
            .lock()
            .unwrap()
            .srqs
            .insert(num, Arc::downgrade(&srq));
        Ok(srq as Arc<dyn SharedRecvQueue>)
    }

    fn register(&self, _len: usize) -> MemoryKey {
        MemoryKey(self.next_key.fetch_add(1, Ordering::Relaxed))
    }

    fn create_conn(&self) -> ConnToken {
        self.net().map(|n| n.fresh_token()).unwrap_or(0)
    }

    fn resolve_addr(&self, token: ConnToken, addr: PeerAddr) {
        {
            let mut faults = self.faults.lock().unwrap();
            if faults.fail_addr > 0 {
                faults.fail_addr -= 1;
                drop(faults);
                self.push_event(TransportEvent::AddrError(token));
                return;
            }
        }
        let Some(net) = self.net() else {
            self.push_event(TransportEvent::AddrError(token));
            return;
        };
        if net.iface_at(addr).is_some() {
            net.state.lock().unwrap().resolved.insert(token, addr);
            self.push_event(TransportEvent::AddrResolved(token));
        } else {
            self.push_event(TransportEvent::AddrError(token));
        }
    }

    fn resolve_route(&self, token: ConnToken) {
        let mut faults = self.faults.lock().unwrap();
        if faults.fail_route > 0 {
            faults.fail_route -= 1;
            drop(faults);
            self.push_event(TransportEvent::RouteError(token));
        } else {
            drop(faults);
            self.push_event(TransportEvent::RouteResolved(token));
        }
    }

    fn connect(&self, token: ConnToken, private: &[u8]) {
        {
            let mut faults = self.faults.lock().unwrap();
            if faults.fail_connect > 0 {
                faults.fail_connect -= 1;
                drop(faults);
                self.push_event(TransportEvent::ConnectError(token));
                return;
            }
        }
        let Some(net) = self.net() else {
            self.push_event(TransportEvent::ConnectError(token));
            return;
        };
        let resolved = {
            let state = net.state.lock().unwrap();
            state.resolved.get(&token).copied()
        };
        let Some(dst) = resolved.and_then(|addr| net.iface_at(addr)) else {
            // Connect without a resolved address.
            self.push_event(TransportEvent::ConnectError(token));
            return;
        };

        let passive = net.fresh_token();
        let me = self.me().map(|i| Arc::downgrade(&i)).unwrap_or_default();
        {
            let mut state = net.state.lock().unwrap();
            state.pending.insert(
                passive,
                PendingConnect {
                    active: me,
                    active_token: token,
                    active_private: private.to_vec(),
                },
            );
        }
        dst.push_event(TransportEvent::ConnectRequest {
            token: passive,
            private: private.to_vec(),
        });
    }

    fn accept(&self, token: ConnToken, private: &[u8]) {
        let Some(net) = self.net() else { return };
        let pending = net.state.lock().unwrap().pending.remove(&token);
        let Some(pending) = pending else {
            log::warn!("sim: accept on unknown token {}", token);
            return;
        };
        let Some(active_iface) = pending.active.upgrade() else {
            return;
        };

        let me = self.me().map(|i| Arc::downgrade(&i)).unwrap_or_default();
        {
            let mut state = net.state.lock().unwrap();
            state.paired.insert(
                token,
                Paired {
                    iface: pending.active.clone(),
                    token: pending.active_token,
                },
            );
            state.paired.insert(
                pending.active_token,
                Paired {
                    iface: me,
                    token,
                },
            );
        }

        // Each side learns the other's private data.
        self.push_event(TransportEvent::Established {
            token,
            private: pending.active_private,
        });
        active_iface.push_event(TransportEvent::Established {
            token: pending.active_token,
            private: private.to_vec(),
        });
    }

    fn reject(&self, token: ConnToken) {
        let Some(net) = self.net() else { return };
        let pending = net.state.lock().unwrap().pending.remove(&token);
        if let Some(pending) = pending {
            if let Some(active) = pending.active.upgrade() {
                active.push_event(TransportEvent::ConnectError(pending.active_token));
            }
        }
    }

    fn disconnect(&self, token: ConnToken) {
        let Some(net) = self.net() else { return };
        let peer = {
            let mut state = net.state.lock().unwrap();
            let peer = state.paired.remove(&token);
            if let Some(p) = &peer {
                state.paired.remove(&p.token);
            }
            peer
        };
        if let Some(peer) = peer {
            if let Some(iface) = peer.iface.upgrade() {
                iface.push_event(TransportEvent::Disconnected(peer.token));
            }
        }
        self.push_event(TransportEvent::Disconnected(token));
    }

    fn destroy_conn(&self, token: ConnToken) {
        if let Some(net) = self.net() {
            let mut state = net.state.lock().unwrap();
            state.resolved.remove(&token);
            state.pending.remove(&token);
            if let Some(p) = state.paired.remove(&token) {
                state.paired.remove(&p.token);
            }
        }
    }

    fn poll_event(&self, timeout: Duration) -> Option<TransportEvent> {
        let mut events = self.events.lock().unwrap();
        if let Some(ev) = events.pop_front() {
            return Some(ev);
        }
        let (mut events, _) = self.events_cv.wait_timeout(events, timeout).unwrap();
        events.pop_front()
    }

    fn wake(&self) {
        self.events_cv.notify_all();
    }
}

/// Simulated completion queue.
pub struct SimCq {
    entries: Mutex<VecDeque<Wc>>,
}

impl SimCq {
    fn push(&self, wc: Wc) {
        self.entries.lock().unwrap().push_back(wc);
    }
}

impl CompQueue for SimCq {
    fn poll(&self, max: usize) -> Vec<Wc> {
        let mut entries = self.entries.lock().unwrap();
        let n = entries.len().min(max);
        entries.drain(..n).collect()
    }
}

/// Simulated shared receive queue. Owns its completion queue.
pub struct SimSrq {
    num: u32,
    cq: Arc<SimCq>,
    posted: Mutex<VecDeque<RecvWr>>,
    iface: Option<Weak<SimIface>>,
}

impl SimSrq {
    /// Number of work requests currently owned by the queue.
    pub fn depth(&self) -> usize {
        self.posted.lock().unwrap().len()
    }

    /// Complete up to `count` oldest posted receives with `byte_len` bytes
    /// each, pushing entries onto the CQ. Returns how many completed.
    pub fn complete_recvs(&self, count: usize, byte_len: u32) -> usize {
        let mut posted = self.posted.lock().unwrap();
        let n = posted.len().min(count);
        for wr in posted.drain(..n) {
            self.cq.push(Wc {
                wr_id: wr.wr_id,
                status: WcStatus::Success,
                opcode: WcOpcode::Recv,
                byte_len,
            });
        }
        n
    }

    /// Flush every posted receive, as a teardown path would.
    pub fn flush(&self) {
        let mut posted = self.posted.lock().unwrap();
        for wr in posted.drain(..) {
            self.cq.push(Wc {
                wr_id: wr.wr_id,
                status: WcStatus::Flushed,
                opcode: WcOpcode::Recv,
                byte_len: 0,
            });
        }
    }
}

impl SharedRecvQueue for SimSrq {
    fn srq_num(&self) -> u32 {
        self.num
    }

    fn cq(&self) -> Arc<dyn CompQueue> {
        self.cq.clone()
    }

    fn post_chain(&self, wrs: &[RecvWr]) -> std::result::Result<(), usize> {
        let reject_from = self
            .iface
            .as_ref()
            .and_then(|w| w.upgrade())
            .and_then(|iface| iface.faults.lock().unwrap().reject_posts_from.take());

        let accepted = match reject_from {
            Some(i) if i < wrs.len() => i,
            _ => wrs.len(),
        };
        let mut posted = self.posted.lock().unwrap();
        posted.extend(wrs[..accepted].iter().copied());
        if accepted < wrs.len() {
            log::warn!(
                "sim srq {}: rejected work requests from chain index {}",
                self.num,
                accepted
            );
            Err(accepted)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Sge;

    #[test]
    fn resolve_and_connect_loopback() {
        let net = SimNet::new();
        let iface = net.add_iface("sim0");

        let token = iface.create_conn();
        iface.resolve_addr(token, iface.addr());
        match iface.poll_event(Duration::from_millis(10)) {
            Some(TransportEvent::AddrResolved(t)) => assert_eq!(t, token),
            other => panic!("unexpected event: {:?}", other),
        }

        iface.resolve_route(token);
        assert!(matches!(
            iface.poll_event(Duration::from_millis(10)),
            Some(TransportEvent::RouteResolved(_))
        ));

        iface.connect(token, b"{}");
        let passive = match iface.poll_event(Duration::from_millis(10)) {
            Some(TransportEvent::ConnectRequest { token, .. }) => token,
            other => panic!("unexpected event: {:?}", other),
        };

        iface.accept(passive, b"{}");
        let mut established = 0;
        while let Some(ev) = iface.poll_event(Duration::from_millis(10)) {
            if matches!(ev, TransportEvent::Established { .. }) {
                established += 1;
            }
        }
        assert_eq!(established, 2);
    }

    #[test]
    fn connect_crosses_interfaces() {
        let net = SimNet::new();
        let a = net.add_iface("sim0");
        let b = net.add_iface("sim1");

        let token = a.create_conn();
        a.resolve_addr(token, b.addr());
        assert!(matches!(
            a.poll_event(Duration::from_millis(10)),
            Some(TransportEvent::AddrResolved(_))
        ));
        a.resolve_route(token);
        assert!(matches!(
            a.poll_event(Duration::from_millis(10)),
            Some(TransportEvent::RouteResolved(_))
        ));

        a.connect(token, b"{}");
        let passive = match b.poll_event(Duration::from_millis(10)) {
            Some(TransportEvent::ConnectRequest { token, .. }) => token,
            other => panic!("unexpected event: {:?}", other),
        };
        b.accept(passive, b"{}");
        assert!(matches!(
            a.poll_event(Duration::from_millis(10)),
            Some(TransportEvent::Established { token: t, .. }) if t == token
        ));
        assert!(matches!(
            b.poll_event(Duration::from_millis(10)),
            Some(TransportEvent::Established { token: t, .. }) if t == passive
        ));

        a.disconnect(token);
        assert!(matches!(
            b.poll_event(Duration::from_millis(10)),
            Some(TransportEvent::Disconnected(t)) if t == passive
        ));
    }

    #[test]
    fn injected_addr_failures_are_consumed() {
        let net = SimNet::new();
        let iface = net.add_iface("sim0");
        iface.fail_next_addr_resolves(2);

        let token = iface.create_conn();
        for _ in 0..2 {
            iface.resolve_addr(token, iface.addr());
            assert!(matches!(
                iface.poll_event(Duration::from_millis(10)),
                Some(TransportEvent::AddrError(_))
            ));
        }
        iface.resolve_addr(token, iface.addr());
        assert!(matches!(
            iface.poll_event(Duration::from_millis(10)),
            Some(TransportEvent::AddrResolved(_))
        ));
    }

    #[test]
    fn partial_post_reports_first_rejected() {
        let net = SimNet::new();
        let iface = net.add_iface("sim0");
        let srq = iface.create_srq(16, 16).unwrap();

        let key = iface.register(4096);
        let wrs: Vec<RecvWr> = (0..10)
            .map(|i| RecvWr {
                wr_id: i,
                sge: Sge {
                    addr: 0x1000 * i,
                    length: 4096,
                    lkey: key,
                },
            })
            .collect();

        iface.reject_posts_from(5);
        assert_eq!(srq.post_chain(&wrs), Err(5));
        // The fault is one-shot.
        assert_eq!(srq.post_chain(&wrs[5..]), Ok(()));
    }
}
