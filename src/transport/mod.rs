//! Transport collaborator interface.
//!
//! The substrate does not drive RDMA hardware itself; it programs an opaque
//! transport service through the traits in this module. A transport must
//! provide asynchronous address/route resolution and connection
//! establishment with events identifying the connection record that
//! advanced, completion queues, and a shared receive queue that accepts a
//! chain of work requests and reports the first rejected one on partial
//! failure.
//!
//! The [`sim`] submodule ships a deterministic in-process implementation
//! used by the test suite and by loopback deployments.

pub mod iface;
pub mod sim;

use std::io;
use std::net::SocketAddrV4;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use self::iface::{IfaceFinder, IfaceInfo, IfaceProbeError};

/// Network address of a peer process' node.
pub type PeerAddr = SocketAddrV4;

/// Identifies one connection record inside a transport instance.
pub type ConnToken = u64;

/// Local key of a transport-registered memory range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct MemoryKey(pub u32);

/// A scatter/gather element of a work request.
#[derive(Debug, Clone, Copy)]
pub struct Sge {
    pub addr: u64,
    pub length: u32,
    pub lkey: MemoryKey,
}

/// A receive work request. `wr_id` is echoed back in the completion.
#[derive(Debug, Clone, Copy)]
pub struct RecvWr {
    pub wr_id: u64,
    pub sge: Sge,
}

/// Work completion status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WcStatus {
    Success,
    /// The queue was flushed during teardown; the buffer was not consumed.
    Flushed,
    /// Transport-specific failure code.
    Failure(u32),
}

/// Work completion opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WcOpcode {
    Send,
    Recv,
}

/// A work completion entry.
#[derive(Debug, Clone, Copy)]
pub struct Wc {
    pub wr_id: u64,
    pub status: WcStatus,
    pub opcode: WcOpcode,
    pub byte_len: u32,
}

impl Wc {
    /// Whether the completion finished successfully.
    #[inline]
    pub fn ok(&self) -> bool {
        self.status == WcStatus::Success
    }
}

/// Endpoint record exchanged as connection private data.
///
/// Serialized with `serde_json` on the wire; both sides learn who they are
/// talking to before the connection is reported established.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerInfo {
    /// Logical rank of the sender, if the sender's NI is logical.
    pub rank: Option<u32>,
    /// Process id of the sender.
    pub pid: u32,
    /// Shared receive queue number of the sender, for transports that
    /// route receives by SRQ.
    pub srq_num: u32,
}

impl PeerInfo {
    /// Serialize for use as connection private data.
    pub fn to_private(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("PeerInfo serialization cannot fail")
    }

    /// Decode connection private data.
    pub fn from_private(data: &[u8]) -> Option<Self> {
        serde_json::from_slice(data).ok()
    }
}

/// Asynchronous transport event, drained by the event-processing thread.
///
/// Connection-management events carry the [`ConnToken`] of the record that
/// advanced. Exactly one thread (the event thread) consumes these.
#[derive(Debug)]
pub enum TransportEvent {
    /// Address resolution finished for an active connection.
    AddrResolved(ConnToken),
    /// Address resolution failed; the requester may retry.
    AddrError(ConnToken),
    /// Route resolution finished.
    RouteResolved(ConnToken),
    /// Route resolution failed; the requester may retry.
    RouteError(ConnToken),
    /// A remote peer asked to connect. The token identifies the new
    /// passive-side record; `private` is the peer's private data.
    ConnectRequest { token: ConnToken, private: Vec<u8> },
    /// The connection is established and usable, on either side.
    Established { token: ConnToken, private: Vec<u8> },
    /// Connection establishment failed after the transport accepted the
    /// connect request.
    ConnectError(ConnToken),
    /// The peer tore the connection down, or a fatal local error occurred.
    Disconnected(ConnToken),
    /// The transport is shutting down; the event loop should exit.
    Shutdown,
}

/// A completion queue.
pub trait CompQueue: Send + Sync {
    /// Non-blockingly poll up to `max` work completions.
    fn poll(&self, max: usize) -> Vec<Wc>;
}

/// A shared receive queue servicing all peers of one NI.
///
/// The queue owns the completion queue its receives complete into.
pub trait SharedRecvQueue: Send + Sync {
    /// Identifier of this queue, exchanged in [`PeerInfo`].
    fn srq_num(&self) -> u32;

    /// The completion queue receives on this queue complete into.
    fn cq(&self) -> Arc<dyn CompQueue>;

    /// Post a chain of receive work requests, in order.
    ///
    /// On success all requests are owned by the queue. On partial failure
    /// returns `Err(i)` where `i` is the index of the first rejected
    /// request; requests `0..i` were accepted, `i..` were not.
    fn post_chain(&self, wrs: &[RecvWr]) -> std::result::Result<(), usize>;
}

/// An opened transport interface.
///
/// One instance per process (held by the global state); all NIs share it.
pub trait Interface: Send + Sync {
    /// Interface name, e.g. `sim0`.
    fn name(&self) -> &str;

    /// The local node address peers use to reach this interface.
    fn addr(&self) -> PeerAddr;

    /// Create a shared receive queue of at most `max_wr` outstanding work
    /// requests, together with a completion queue of at least `cq_depth`
    /// entries for it to deliver into.
    fn create_srq(&self, cq_depth: u32, max_wr: u32) -> io::Result<Arc<dyn SharedRecvQueue>>;

    /// Register `len` bytes of receive-capable memory, returning its key.
    fn register(&self, len: usize) -> MemoryKey;

    /// Create an active-side connection record.
    fn create_conn(&self) -> ConnToken;

    /// Start asynchronous address resolution toward `addr`.
    /// Completion arrives as `AddrResolved` or `AddrError`.
    fn resolve_addr(&self, token: ConnToken, addr: PeerAddr);

    /// Start asynchronous route resolution. Requires a resolved address.
    fn resolve_route(&self, token: ConnToken);

    /// Start connection establishment, sending `private` to the peer.
    fn connect(&self, token: ConnToken, private: &[u8]);

    /// Accept an inbound connect request, sending `private` back.
    fn accept(&self, token: ConnToken, private: &[u8]);

    /// Reject an inbound connect request.
    fn reject(&self, token: ConnToken);

    /// Tear a connection down. The peer observes `Disconnected`.
    fn disconnect(&self, token: ConnToken);

    /// Drop a connection record that will not be used again.
    fn destroy_conn(&self, token: ConnToken);

    /// Block up to `timeout` for the next transport event.
    fn poll_event(&self, timeout: Duration) -> Option<TransportEvent>;

    /// Wake a thread blocked in [`poll_event`](Self::poll_event) without
    /// delivering an event. Used to stop the event loop.
    fn wake(&self);
}

/// Discovers and opens transport interfaces.
pub trait TransportProvider: Send + Sync {
    /// Enumerate the interfaces this provider can open.
    fn list(&self) -> Vec<IfaceInfo>;

    /// Open an enumerated interface.
    fn open(&self, info: &IfaceInfo) -> io::Result<Arc<dyn Interface>>;
}
