//! Network interfaces.
//!
//! An [`Ni`] is the local endpoint applications allocate from the global
//! pool. Its body owns the per-type sub-object pools, the shared receive
//! queue and completion queue, the receive-buffer accounting, and the peer
//! connection records in one of two addressing modes fixed at creation:
//! logical (peers named by rank, with node-level connection sharing) or
//! physical (peers named by address).

pub mod rank;

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::buf::{self, Buf};
use crate::conn::{ConnRegistry, PeerConn, PeerId, DEFAULT_RETRY_LIMIT};
use crate::eq::{Ct, Eq};
use crate::error::{Error, Result};
use crate::gbl;
use crate::me::{Le, Me};
use crate::mr::{Md, Mr};
use crate::pool::{Handle, ObjRef, Pool, PoolKind, Pooled};
use crate::transport::{
    CompQueue, ConnToken, Interface, PeerAddr, PeerInfo, SharedRecvQueue, Wc, WcOpcode,
};
use crate::xact::{RecvXact, SendXact};

pub use self::rank::{RankEntry, RankMap, RankMapError};

/// Completions drained per event-loop pass, per NI.
const COMPLETION_BATCH: usize = 64;

/// Identity of a local endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessId {
    /// Node id.
    pub nid: u32,
    /// Process id.
    pub pid: u32,
}

/// Per-NI resource caps. Each cap bounds one sub-object pool.
#[derive(Debug, Clone, Copy)]
pub struct NiLimits {
    pub max_mrs: usize,
    pub max_mds: usize,
    pub max_entries: usize,
    pub max_eqs: usize,
    pub max_cts: usize,
    pub max_xacts: usize,
    pub max_bufs: usize,
}

impl Default for NiLimits {
    fn default() -> Self {
        NiLimits {
            max_mrs: 128,
            max_mds: 128,
            max_entries: 128,
            max_eqs: 16,
            max_cts: 16,
            max_xacts: 256,
            max_bufs: 256,
        }
    }
}

/// Peer addressing mode, chosen once at NI creation.
pub enum AddressingConfig {
    /// Peers named by rank; ranks on one node share the node's main
    /// connection.
    Logical { map: RankMap, my_rank: u32 },
    /// Peers named by network address.
    Physical,
}

/// NI creation parameters.
pub struct NiConfig {
    pub addressing: AddressingConfig,
    pub limits: NiLimits,
    pub pid: u32,
    pub uid: u32,
    /// Size of each transport buffer.
    pub buf_size: usize,
    /// Receive buffers posted at creation.
    pub prepost_recv: usize,
    /// Retry budget per connection-establishment phase.
    pub retry_limit: u32,
}

impl NiConfig {
    pub fn physical() -> Self {
        NiConfig {
            addressing: AddressingConfig::Physical,
            limits: NiLimits::default(),
            pid: std::process::id(),
            uid: 0,
            buf_size: 4096,
            prepost_recv: 16,
            retry_limit: DEFAULT_RETRY_LIMIT,
        }
    }

    pub fn logical(map: RankMap, my_rank: u32) -> Self {
        NiConfig {
            addressing: AddressingConfig::Logical { map, my_rank },
            ..Self::physical()
        }
    }
}

/// The pooled NI wrapper. The body is installed after allocation and torn
/// down when the last reference drops.
pub struct Ni {
    body: Mutex<Option<Arc<NiBody>>>,
}

impl Ni {
    fn new() -> Self {
        Ni {
            body: Mutex::new(None),
        }
    }

    pub(crate) fn install(&self, body: Arc<NiBody>) {
        *self.body.lock().unwrap() = Some(body);
    }

    /// The NI body. Fails if the NI is mid-creation or already closed.
    pub fn body(&self) -> Result<Arc<NiBody>> {
        self.body
            .lock()
            .unwrap()
            .clone()
            .ok_or(Error::NotInitialized)
    }

    /// Allocate an NI from the global pool.
    ///
    /// Creates the transport queues, builds the connection records for the
    /// addressing mode, and pre-posts receive buffers.
    pub fn alloc(config: NiConfig) -> Result<ObjRef<Ni>> {
        let g = gbl::get()?;
        let prepost = config.prepost_recv;

        let ni = g.ni_pool.alloc()?;
        let body = NiBody::new(config, g.iface.clone(), g.registry.clone())?;
        ni.install(body.clone());
        g.track_ni(&body);

        if prepost > 0 {
            buf::post_recv(&ni, prepost)?;
        }
        log::debug!("allocated NI {:?} ({:?})", ni.handle(), body.id());
        Ok(ni)
    }

    /// Look a live NI up by handle.
    pub fn lookup(handle: Handle) -> Result<ObjRef<Ni>> {
        gbl::get()?.ni_pool.lookup(handle)
    }
}

pub(crate) fn make_ni_pool(cap: usize) -> Pool<Ni> {
    Pool::new(cap, |_| Ni::new())
}

impl Pooled for Ni {
    const KIND: PoolKind = PoolKind::Ni;

    fn on_checkin(&self) {
        if let Some(body) = self.body.lock().unwrap().take() {
            body.close();
        }
    }
}

/// Logical addressing state: the rank table and one connection record per
/// remote rank. Dependent ranks reference their node's main connection.
pub struct LogicalNi {
    map: RankMap,
    my_rank: u32,
    is_main: bool,
    conns: Vec<Option<Arc<PeerConn>>>,
}

/// Physical addressing state: connection records keyed by peer address,
/// created on first use.
pub struct PhysicalNi {
    conns: Mutex<BTreeMap<PeerAddr, Arc<PeerConn>>>,
}

/// Peer addressing state, fixed at creation.
pub enum NiAddressing {
    Logical(LogicalNi),
    Physical(PhysicalNi),
}

/// The state behind a live NI.
pub struct NiBody {
    id: ProcessId,
    uid: u32,
    limits: NiLimits,
    retry_limit: u32,
    iface: Arc<dyn Interface>,
    registry: Arc<ConnRegistry>,
    pub(crate) srq: Arc<dyn SharedRecvQueue>,
    cq: Arc<dyn CompQueue>,

    pub(crate) mr_pool: Pool<Mr>,
    pub(crate) md_pool: Pool<Md>,
    pub(crate) le_pool: Pool<Le>,
    pub(crate) me_pool: Pool<Me>,
    pub(crate) eq_pool: Pool<Eq>,
    pub(crate) ct_pool: Pool<Ct>,
    pub(crate) send_xact_pool: Pool<SendXact>,
    pub(crate) recv_xact_pool: Pool<RecvXact>,
    pub(crate) buf_pool: Pool<Buf>,

    /// Buffers currently owned by the hardware receive queue, in post
    /// order.
    pub(crate) recv_list: Mutex<VecDeque<ObjRef<Buf>>>,
    pub(crate) send_list: Mutex<VecDeque<ObjRef<Buf>>>,
    /// Handles of regions registered through this NI.
    mr_list: Mutex<Vec<Handle>>,
    pub(crate) posted_recv: AtomicUsize,

    addressing: NiAddressing,
    /// Inbound connections accepted on this NI.
    passive: Mutex<Vec<Arc<PeerConn>>>,
}

impl NiBody {
    pub(crate) fn new(
        config: NiConfig,
        iface: Arc<dyn Interface>,
        registry: Arc<ConnRegistry>,
    ) -> Result<Arc<Self>> {
        let limits = config.limits;
        let srq = iface
            .create_srq((limits.max_bufs * 2) as u32, limits.max_bufs as u32)
            .map_err(|e| {
                log::error!("failed to create shared receive queue: {}", e);
                Error::OutOfMemory
            })?;
        let cq = srq.cq();

        let (nid, my_rank) = match &config.addressing {
            AddressingConfig::Logical { map, my_rank } => {
                let entry = map
                    .get(*my_rank)
                    .ok_or(Error::InvalidArgument("my_rank not in rank map"))?;
                (entry.nid, Some(*my_rank))
            }
            AddressingConfig::Physical => (0, None),
        };
        let id = ProcessId {
            nid,
            pid: config.pid,
        };
        let local = PeerInfo {
            rank: my_rank,
            pid: config.pid,
            srq_num: srq.srq_num(),
        };

        let addressing = match config.addressing {
            AddressingConfig::Logical { map, my_rank } => NiAddressing::Logical(
                Self::build_logical(map, my_rank, &local, &iface, &registry, config.retry_limit),
            ),
            AddressingConfig::Physical => NiAddressing::Physical(PhysicalNi {
                conns: Mutex::new(BTreeMap::new()),
            }),
        };

        Ok(Arc::new(NiBody {
            id,
            uid: config.uid,
            limits,
            retry_limit: config.retry_limit,
            iface: iface.clone(),
            registry,
            srq,
            cq,
            mr_pool: Pool::new(limits.max_mrs, |_| Mr::new()),
            md_pool: Pool::new(limits.max_mds, |_| Md::new()),
            le_pool: Pool::new(limits.max_entries, |_| Le::new()),
            me_pool: Pool::new(limits.max_entries, |_| Me::new()),
            eq_pool: Pool::new(limits.max_eqs, |_| Eq::new()),
            ct_pool: Pool::new(limits.max_cts, |_| Ct::new()),
            send_xact_pool: Pool::new(limits.max_xacts, |_| SendXact::new()),
            recv_xact_pool: Pool::new(limits.max_xacts, |_| RecvXact::new()),
            buf_pool: buf::make_pool(limits.max_bufs, config.buf_size, iface),
            recv_list: Mutex::new(VecDeque::new()),
            send_list: Mutex::new(VecDeque::new()),
            mr_list: Mutex::new(Vec::new()),
            posted_recv: AtomicUsize::new(0),
            addressing,
            passive: Mutex::new(Vec::new()),
        }))
    }

    /// Build the per-rank connection table. Each node's main rank gets an
    /// outbound record; the node's other ranks get dependent records that
    /// ride on it.
    fn build_logical(
        map: RankMap,
        my_rank: u32,
        local: &PeerInfo,
        iface: &Arc<dyn Interface>,
        registry: &Arc<ConnRegistry>,
        retry_limit: u32,
    ) -> LogicalNi {
        let is_main = map
            .get(my_rank)
            .map(|e| e.main_rank == my_rank)
            .unwrap_or(false);

        let mut mains: HashMap<u32, Arc<PeerConn>> = HashMap::new();
        let mut conns: Vec<Option<Arc<PeerConn>>> = vec![None; map.size()];

        for entry in map.entries() {
            if entry.rank == entry.main_rank {
                let conn = PeerConn::outbound(
                    PeerId::Rank(entry.rank),
                    entry.addr,
                    local.clone(),
                    iface.clone(),
                    registry.clone(),
                    retry_limit,
                );
                mains.insert(entry.rank, conn.clone());
                if entry.rank != my_rank {
                    conns[entry.rank as usize] = Some(conn);
                }
            }
        }
        for entry in map.entries() {
            if entry.rank != entry.main_rank && entry.rank != my_rank {
                // Validation guarantees the main entry exists.
                if let Some(main) = mains.get(&entry.main_rank) {
                    conns[entry.rank as usize] = Some(PeerConn::dependent(entry.rank, main));
                }
            }
        }

        LogicalNi {
            map,
            my_rank,
            is_main,
            conns,
        }
    }

    pub fn id(&self) -> ProcessId {
        self.id
    }

    pub fn uid(&self) -> u32 {
        self.uid
    }

    pub fn limits(&self) -> &NiLimits {
        &self.limits
    }

    /// Endpoint record sent to peers as connection private data.
    pub fn local_info(&self) -> PeerInfo {
        PeerInfo {
            rank: match &self.addressing {
                NiAddressing::Logical(l) => Some(l.my_rank),
                NiAddressing::Physical(_) => None,
            },
            pid: self.id.pid,
            srq_num: self.srq.srq_num(),
        }
    }

    /// Whether this process is the elected main rank on its node.
    /// Always true for physical NIs.
    pub fn is_main(&self) -> bool {
        match &self.addressing {
            NiAddressing::Logical(l) => l.is_main,
            NiAddressing::Physical(_) => true,
        }
    }

    /// The rank table, for logical NIs.
    pub fn rank_map(&self) -> Option<&RankMap> {
        match &self.addressing {
            NiAddressing::Logical(l) => Some(&l.map),
            NiAddressing::Physical(_) => None,
        }
    }

    /// The connection record for a remote rank (logical NIs).
    pub fn conn_for_rank(&self, rank: u32) -> Result<Arc<PeerConn>> {
        match &self.addressing {
            NiAddressing::Logical(l) => {
                if rank == l.my_rank {
                    return Err(Error::InvalidArgument("rank is the local process"));
                }
                l.conns
                    .get(rank as usize)
                    .and_then(|c| c.clone())
                    .ok_or(Error::InvalidArgument("rank out of range"))
            }
            NiAddressing::Physical(_) => Err(Error::InvalidArgument(
                "physical NI addresses peers by address",
            )),
        }
    }

    /// The connection record for a peer address (physical NIs). Created on
    /// first use.
    pub fn conn_for_peer(&self, addr: PeerAddr) -> Result<Arc<PeerConn>> {
        match &self.addressing {
            NiAddressing::Physical(p) => {
                let mut conns = p.conns.lock().unwrap();
                Ok(conns
                    .entry(addr)
                    .or_insert_with(|| {
                        PeerConn::outbound(
                            PeerId::Addr(addr),
                            addr,
                            self.local_info(),
                            self.iface.clone(),
                            self.registry.clone(),
                            self.retry_limit,
                        )
                    })
                    .clone())
            }
            NiAddressing::Logical(_) => Err(Error::InvalidArgument(
                "logical NI addresses peers by rank",
            )),
        }
    }

    /// Offer an inbound connect request to this NI.
    ///
    /// A logical NI accepts only if it is the main rank on its node and the
    /// peer is logical too; a physical NI accepts physical peers. Returns
    /// whether the request was taken.
    pub(crate) fn offer_connect(self: &Arc<Self>, token: ConnToken, private: &[u8]) -> bool {
        let Some(info) = PeerInfo::from_private(private) else {
            return false;
        };
        let peer = match (&self.addressing, info.rank) {
            (NiAddressing::Logical(l), Some(rank)) => {
                if !l.is_main {
                    return false;
                }
                PeerId::Rank(rank)
            }
            (NiAddressing::Physical(_), None) => PeerId::Pid(info.pid),
            _ => return false,
        };

        let conn = PeerConn::inbound(
            peer,
            token,
            private,
            self.local_info(),
            self.iface.clone(),
            self.registry.clone(),
            self.retry_limit,
        );
        self.passive.lock().unwrap().push(conn);
        log::debug!("NI {:?}: accepted inbound connection {:?}", self.id, peer);
        true
    }

    /// Number of buffers currently owned by the hardware receive queue.
    pub fn posted_recv(&self) -> usize {
        self.posted_recv.load(Ordering::Acquire)
    }

    /// Buffers currently checked out of the buffer pool.
    pub fn bufs_live(&self) -> usize {
        self.buf_pool.live()
    }

    /// Free-list length of the buffer pool.
    pub fn bufs_available(&self) -> usize {
        self.buf_pool.available()
    }

    /// Length of the receive list.
    pub fn recv_queued(&self) -> usize {
        self.recv_list.lock().unwrap().len()
    }

    /// Drain pending work completions. Called from the event thread.
    pub(crate) fn poll_completions(&self) {
        for wc in self.cq.poll(COMPLETION_BATCH) {
            match wc.opcode {
                WcOpcode::Recv => self.on_recv_complete(&wc),
                WcOpcode::Send => self.on_send_complete(&wc),
            }
        }
    }

    fn on_recv_complete(&self, wc: &Wc) {
        let handle = Handle::from_raw(wc.wr_id);
        let Ok(body_buf) = self.buf_pool.lookup(handle) else {
            log::warn!("receive completion for unknown buffer {:?}", handle);
            return;
        };
        let removed = {
            let mut list = self.recv_list.lock().unwrap();
            match list.iter().position(|b| b.handle() == handle) {
                Some(pos) => {
                    list.remove(pos);
                    true
                }
                None => false,
            }
        };
        if !removed {
            // Teardown already reclaimed this buffer and its count.
            return;
        }
        self.posted_recv.fetch_sub(1, Ordering::AcqRel);

        if wc.ok() {
            if let Ok(xact) = self.recv_xact_pool.lookup(body_buf.xact()) {
                xact.set_nbytes(wc.byte_len as usize);
                xact.mark_ready();
            }
        }
        // Dropping the last reference returns the buffer to the pool.
    }

    fn on_send_complete(&self, wc: &Wc) {
        let handle = Handle::from_raw(wc.wr_id);
        let buf = {
            let mut list = self.send_list.lock().unwrap();
            list.iter()
                .position(|b| b.handle() == handle)
                .and_then(|pos| list.remove(pos))
        };
        let Some(buf) = buf else {
            log::warn!("send completion for unknown buffer {:?}", handle);
            return;
        };
        if wc.ok() {
            if let Ok(xact) = self.send_xact_pool.lookup(buf.xact()) {
                xact.mark_ready();
            }
        }
    }

    /// Tear the NI down: shut connections, reclaim hardware-owned buffers,
    /// drop list state. Runs when the last NI reference is released.
    pub(crate) fn close(&self) {
        match &self.addressing {
            NiAddressing::Logical(l) => {
                for conn in l.conns.iter().flatten() {
                    conn.shutdown();
                }
            }
            NiAddressing::Physical(p) => {
                for conn in p.conns.lock().unwrap().values() {
                    conn.shutdown();
                }
            }
        }
        for conn in self.passive.lock().unwrap().drain(..) {
            conn.shutdown();
        }

        let reclaimed: Vec<_> = self.recv_list.lock().unwrap().drain(..).collect();
        self.posted_recv.fetch_sub(reclaimed.len(), Ordering::AcqRel);
        drop(reclaimed);
        self.send_list.lock().unwrap().clear();
        self.mr_list.lock().unwrap().clear();
        log::debug!("closed NI {:?}", self.id);
    }
}

/// Register a memory region through the NI.
pub fn alloc_mr(ni: &ObjRef<Ni>, addr: u64, len: usize) -> Result<ObjRef<Mr>> {
    let body = ni.body()?;
    let mr = body.mr_pool.alloc()?;
    mr.parent.attach(ni.clone());
    let key = body.iface.register(len);
    mr.bind(key, addr, len);
    body.mr_list.lock().unwrap().push(mr.handle());
    Ok(mr)
}

/// Create a memory descriptor over a registered region.
pub fn alloc_md(
    ni: &ObjRef<Ni>,
    mr: Handle,
    eq: Handle,
    ct: Handle,
    options: u32,
) -> Result<ObjRef<Md>> {
    let body = ni.body()?;
    // The backing region must be live.
    body.mr_pool.lookup(mr)?;
    let md = body.md_pool.alloc()?;
    md.parent.attach(ni.clone());
    md.describe(mr, eq, ct, options);
    Ok(md)
}

/// Create a target-side list entry.
pub fn alloc_le(
    ni: &ObjRef<Ni>,
    start: u64,
    length: usize,
    ct: Handle,
    options: u32,
) -> Result<ObjRef<Le>> {
    let body = ni.body()?;
    let le = body.le_pool.alloc()?;
    le.parent.attach(ni.clone());
    le.describe(start, length, ct, options);
    Ok(le)
}

/// Create a target-side match entry.
#[allow(clippy::too_many_arguments)]
pub fn alloc_me(
    ni: &ObjRef<Ni>,
    start: u64,
    length: usize,
    ct: Handle,
    options: u32,
    match_bits: u64,
    ignore_bits: u64,
) -> Result<ObjRef<Me>> {
    let body = ni.body()?;
    let me = body.me_pool.alloc()?;
    me.parent.attach(ni.clone());
    me.describe(start, length, ct, options, match_bits, ignore_bits);
    Ok(me)
}

/// Create an event queue of `capacity` entries.
pub fn alloc_eq(ni: &ObjRef<Ni>, capacity: usize) -> Result<ObjRef<Eq>> {
    let body = ni.body()?;
    let eq = body.eq_pool.alloc()?;
    eq.parent.attach(ni.clone());
    eq.set_capacity(capacity);
    Ok(eq)
}

/// Create a counting event.
pub fn alloc_ct(ni: &ObjRef<Ni>) -> Result<ObjRef<Ct>> {
    let body = ni.body()?;
    let ct = body.ct_pool.alloc()?;
    ct.parent.attach(ni.clone());
    Ok(ct)
}

/// Create an initiator-side transaction record.
pub fn alloc_send_xact(ni: &ObjRef<Ni>) -> Result<ObjRef<SendXact>> {
    let body = ni.body()?;
    let xact = body.send_xact_pool.alloc()?;
    xact.parent.attach(ni.clone());
    Ok(xact)
}

/// Create a target-side transaction record.
pub fn alloc_recv_xact(ni: &ObjRef<Ni>) -> Result<ObjRef<RecvXact>> {
    let body = ni.body()?;
    let xact = body.recv_xact_pool.alloc()?;
    xact.parent.attach(ni.clone());
    Ok(xact)
}

/// Keeps the owning NI checked out for a sub-object's lifetime.
///
/// Attached on allocation, cleared on checkin, so an NI's reference count
/// stays above zero while any of its sub-objects is live.
pub struct NiParent(Mutex<Option<ObjRef<Ni>>>);

impl NiParent {
    pub(crate) fn new() -> Self {
        NiParent(Mutex::new(None))
    }

    pub(crate) fn attach(&self, ni: ObjRef<Ni>) {
        *self.0.lock().unwrap() = Some(ni);
    }

    pub(crate) fn clear(&self) {
        self.0.lock().unwrap().take();
    }

    /// The owning NI, if attached.
    pub fn ni(&self) -> Option<ObjRef<Ni>> {
        self.0.lock().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buf::BufType;
    use crate::transport::sim::SimNet;
    use crate::transport::WcStatus;

    #[test]
    fn late_completion_after_close_keeps_count_at_zero() {
        let net = SimNet::new();
        let iface = net.add_iface("sim0");
        let body = NiBody::new(
            NiConfig::physical(),
            iface as Arc<dyn Interface>,
            ConnRegistry::new(),
        )
        .unwrap();

        // Post one buffer by hand, the way post_recv does.
        let buf = body.buf_pool.alloc().unwrap();
        buf.set_type(BufType::Recv);
        buf.set_ni(body.clone());
        let handle = buf.handle();
        body.recv_list.lock().unwrap().push_back(buf.clone());
        body.posted_recv.fetch_add(1, Ordering::AcqRel);

        // Teardown reclaims the posted buffer and its count.
        body.close();
        assert_eq!(body.posted_recv(), 0);

        // A completion that raced teardown still finds the buffer checked
        // out but already off the receive list; the count must not move.
        body.on_recv_complete(&Wc {
            wr_id: handle.as_raw(),
            status: WcStatus::Success,
            opcode: WcOpcode::Recv,
            byte_len: 16,
        });
        assert_eq!(body.posted_recv(), 0);
        drop(buf);
    }
}
