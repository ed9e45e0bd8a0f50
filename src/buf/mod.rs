//! Transport buffer lifecycle.
//!
//! A [`Buf`] is a fixed-size region registered with the transport when its
//! pool slot is first carved, reused across checkouts. Receive buffers are
//! pre-posted in batches to the NI's shared receive queue by
//! [`post_recv`]; a partial post is recovered by releasing every buffer
//! from the first rejected one onward and correcting the posted count.

use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};
use crate::mr::Mr;
use crate::ni::{Ni, NiBody};
use crate::pool::{Handle, ObjRef, Pool, PoolKind, Pooled};
use crate::transport::{Interface, MemoryKey, RecvWr, Sge};

/// What a buffer is currently used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufType {
    Free,
    Send,
    Recv,
    Ack,
}

struct BufState {
    btype: BufType,
    /// Region references borrowed for the current operation; dropped on
    /// checkin.
    mrs: Vec<ObjRef<Mr>>,
    /// Transaction this buffer is delivering into, if any.
    xact: Handle,
    /// Keeps the owning NI body alive while the hardware owns this buffer.
    ni: Option<Arc<NiBody>>,
}

impl BufState {
    fn cleared() -> Self {
        BufState {
            btype: BufType::Free,
            mrs: Vec::new(),
            xact: Handle::NONE,
            ni: None,
        }
    }
}

/// A fixed-size transport-registered buffer.
pub struct Buf {
    data: Box<[u8]>,
    key: MemoryKey,
    state: Mutex<BufState>,
}

impl Buf {
    fn new(size: usize, key: MemoryKey) -> Self {
        Buf {
            data: vec![0u8; size].into_boxed_slice(),
            key,
            state: Mutex::new(BufState::cleared()),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn btype(&self) -> BufType {
        self.state.lock().unwrap().btype
    }

    pub(crate) fn set_type(&self, btype: BufType) {
        self.state.lock().unwrap().btype = btype;
    }

    pub(crate) fn set_ni(&self, ni: Arc<NiBody>) {
        self.state.lock().unwrap().ni = Some(ni);
    }

    /// Handle of the transaction this buffer delivers into.
    pub fn xact(&self) -> Handle {
        self.state.lock().unwrap().xact
    }

    pub fn attach_xact(&self, xact: Handle) {
        self.state.lock().unwrap().xact = xact;
    }

    /// Borrow a memory-region reference for the duration of the current
    /// operation.
    pub fn borrow_mr(&self, mr: ObjRef<Mr>) {
        self.state.lock().unwrap().mrs.push(mr);
    }

    /// The receive work request covering this buffer. `handle` is echoed
    /// back as the completion's `wr_id`.
    fn recv_wr(&self, handle: Handle) -> RecvWr {
        RecvWr {
            wr_id: handle.as_raw(),
            sge: Sge {
                addr: self.data.as_ptr() as u64,
                length: self.data.len() as u32,
                lkey: self.key,
            },
        }
    }
}

impl Pooled for Buf {
    const KIND: PoolKind = PoolKind::Buf;

    fn on_checkin(&self) {
        *self.state.lock().unwrap() = BufState::cleared();
    }
}

/// Build a buffer pool whose slots register their region on first carve.
pub(crate) fn make_pool(cap: usize, size: usize, iface: Arc<dyn Interface>) -> Pool<Buf> {
    Pool::new(cap, move |_| Buf::new(size, iface.register(size)))
}

/// Pre-post up to `count` receive buffers onto the NI's shared receive
/// queue.
///
/// Buffers are chained and posted in allocation order and appended to the
/// NI's receive list before the post, so teardown can account for every
/// buffer the hardware may own. If the transport rejects the chain partway,
/// the rejected tail is unlinked, released back to the pool, and excluded
/// from the posted count.
///
/// Returns the number of buffers the queue accepted. Fails with
/// [`Error::PostFailed`] only when no buffer could be allocated at all.
pub fn post_recv(ni: &ObjRef<Ni>, count: usize) -> Result<usize> {
    let body = ni.body()?;

    let mut bufs = Vec::with_capacity(count);
    for _ in 0..count {
        match body.buf_pool.alloc() {
            Ok(buf) => bufs.push(buf),
            Err(Error::OutOfMemory) => break,
            Err(e) => return Err(e),
        }
    }
    if bufs.is_empty() {
        log::warn!("post_recv: buffer pool exhausted, nothing posted");
        return Err(Error::PostFailed);
    }
    let actual = bufs.len();

    let mut wrs = Vec::with_capacity(actual);
    for buf in &bufs {
        buf.set_type(BufType::Recv);
        buf.set_ni(body.clone());
        wrs.push(buf.recv_wr(buf.handle()));
    }

    {
        let mut list = body.recv_list.lock().unwrap();
        for buf in &bufs {
            list.push_back(buf.clone());
        }
    }
    // Count the whole batch optimistically; corrected below on rejection.
    body.posted_recv.fetch_add(actual, Ordering::AcqRel);

    match body.srq.post_chain(&wrs) {
        Ok(()) => {
            log::trace!("post_recv: posted {} receive buffers", actual);
            Ok(actual)
        }
        Err(first_bad) => {
            let rejected: HashSet<u64> = bufs[first_bad..]
                .iter()
                .map(|b| b.handle().as_raw())
                .collect();
            {
                let mut list = body.recv_list.lock().unwrap();
                list.retain(|b| !rejected.contains(&b.handle().as_raw()));
            }
            body.posted_recv.fetch_sub(actual - first_bad, Ordering::AcqRel);
            log::warn!(
                "post_recv: queue accepted {}/{} buffers, releasing the rest",
                first_bad,
                actual
            );
            // Dropping the tail refs returns those buffers to the pool.
            drop(bufs);
            Ok(first_bad)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkin_clears_operation_state() {
        let buf = Buf::new(256, MemoryKey(1));
        buf.set_type(BufType::Recv);
        buf.attach_xact(Handle::from_raw(5));
        assert_eq!(buf.btype(), BufType::Recv);

        buf.on_checkin();
        assert_eq!(buf.btype(), BufType::Free);
        assert_eq!(buf.xact(), Handle::NONE);
    }

    #[test]
    fn recv_wr_covers_whole_buffer() {
        let buf = Buf::new(512, MemoryKey(9));
        let wr = buf.recv_wr(Handle::from_raw(3));
        assert_eq!(wr.wr_id, 3);
        assert_eq!(wr.sge.length, 512);
        assert_eq!(wr.sge.lkey, MemoryKey(9));
        assert_eq!(wr.sge.addr, buf.data().as_ptr() as u64);
    }
}
