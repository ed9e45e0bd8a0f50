//! A Portals-style point-to-point messaging substrate core.
//!
//! `rportals` manages the machinery beneath a message-passing API: typed,
//! handle-addressable object pools, per-peer connection establishment with
//! retries and node-level connection sharing, receive-buffer pre-posting
//! with partial-failure recovery, and the process-wide lifecycle that owns
//! the event-processing thread.
//!
//! Resources are reference-counted pool objects: an [`ObjRef`] keeps its
//! object checked out, and the object's [`Handle`] is valid for lookup
//! exactly as long as a reference exists. Sub-objects (memory regions,
//! match entries, event queues, ...) keep their owning [`Ni`] alive, so a
//! handle obtained through an NI never dangles.
//!
//! The RDMA driver itself is an external collaborator behind the
//! [`transport`] traits; [`transport::sim`] ships a deterministic
//! in-process implementation used by the test suite and for loopback
//! deployments.
//!
//! # Example
//!
//! ```rust
//! use rportals::*;
//! use anyhow::Result;
//!
//! fn main() -> Result<()> {
//!     init()?;
//!
//!     let ni = Ni::alloc(NiConfig::physical())?;
//!     let mr = alloc_mr(&ni, 0x1000, 4096)?;
//!     assert!(Ni::lookup(ni.handle()).is_ok());
//!
//!     drop(mr);
//!     drop(ni);
//!     fini();
//!     Ok(())
//! }
//! ```
//!
//! ## Warning
//!
//! **The interfaces are unstable and up to change!**

mod error;
pub use error::{Error, Result};

mod pool;
pub use pool::{Handle, ObjRef, Pool, PoolKind, Pooled};

/// Transport collaborator traits and the in-process implementation.
pub mod transport;

/// Peer connection state machine.
pub mod conn;
pub use conn::{ConnState, PeerConn, PeerId};

/// Receive-buffer lifecycle.
pub mod buf;
pub use buf::{post_recv, Buf, BufType};

/// Network interfaces.
pub mod ni;
pub use ni::{
    alloc_ct, alloc_eq, alloc_le, alloc_md, alloc_me, alloc_mr, alloc_recv_xact, alloc_send_xact,
    AddressingConfig, Ni, NiConfig, NiLimits, ProcessId, RankEntry, RankMap,
};

mod mr;
pub use mr::{md_options, Md, Mr};

mod me;
pub use me::{entry_options, Le, Me};

mod eq;
pub use eq::{Ct, CtValue, Eq, Event, EventKind};

mod xact;
pub use xact::{RecvXact, SendXact, XactState};

mod gbl;
pub use gbl::{fini, init, init_with, is_initialized};
