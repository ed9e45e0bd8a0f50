//! Send and receive transaction records.
//!
//! A transaction tracks one in-flight operation. Initiator-side records
//! queue on a peer connection until it is usable; target-side records bind
//! an inbound buffer to the entry it is delivering into.

use std::ops::Deref;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::ni::NiParent;
use crate::pool::{Handle, PoolKind, Pooled};

/// Progress of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XactState {
    /// Waiting for its connection to become usable.
    Queued,
    /// Released for processing; the connection is up.
    Ready,
    /// The connection failed; the operation will not run.
    Failed,
}

/// State shared by send and receive transactions.
pub struct XactCore {
    inner: Mutex<XactInner>,
    advanced: Condvar,
}

struct XactInner {
    state: XactState,
    error: Option<Error>,
    nbytes: usize,
    /// Buffer carrying this transaction's data, if one is attached.
    buf: Handle,
}

impl XactCore {
    fn new() -> Self {
        XactCore {
            inner: Mutex::new(XactInner {
                state: XactState::Queued,
                error: None,
                nbytes: 0,
                buf: Handle::NONE,
            }),
            advanced: Condvar::new(),
        }
    }

    pub fn state(&self) -> XactState {
        self.inner.lock().unwrap().state
    }

    pub fn nbytes(&self) -> usize {
        self.inner.lock().unwrap().nbytes
    }

    pub fn buf(&self) -> Handle {
        self.inner.lock().unwrap().buf
    }

    pub fn attach_buf(&self, buf: Handle) {
        self.inner.lock().unwrap().buf = buf;
    }

    /// Mark the transaction released for processing.
    pub fn mark_ready(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = XactState::Ready;
        drop(inner);
        self.advanced.notify_all();
    }

    /// Mark the transaction failed with `error`.
    pub fn mark_failed(&self, error: Error) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = XactState::Failed;
        inner.error = Some(error);
        drop(inner);
        self.advanced.notify_all();
    }

    pub fn set_nbytes(&self, nbytes: usize) {
        self.inner.lock().unwrap().nbytes = nbytes;
    }

    /// Outcome of a connection release, to hand to [`mark_ready`] or
    /// [`mark_failed`].
    ///
    /// [`mark_ready`]: Self::mark_ready
    /// [`mark_failed`]: Self::mark_failed
    pub fn complete(&self, result: Result<()>) {
        match result {
            Ok(()) => self.mark_ready(),
            Err(e) => self.mark_failed(e),
        }
    }

    /// Block until the transaction leaves `Queued` or `timeout` elapses.
    ///
    /// Returns `Some(Ok(()))` once ready, `Some(Err(..))` with the recorded
    /// error once failed, and `None` on timeout (the record stays queued).
    pub fn wait_released(&self, timeout: Duration) -> Option<Result<()>> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock().unwrap();
        loop {
            match inner.state {
                XactState::Ready => return Some(Ok(())),
                XactState::Failed => {
                    return Some(Err(inner.error.clone().unwrap_or(Error::ConnectionFailed)))
                }
                XactState::Queued => {}
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (i, _) = self.advanced.wait_timeout(inner, deadline - now).unwrap();
            inner = i;
        }
    }

    fn reset(&self) {
        *self.inner.lock().unwrap() = XactInner {
            state: XactState::Queued,
            error: None,
            nbytes: 0,
            buf: Handle::NONE,
        };
    }
}

/// An initiator-side transaction.
pub struct SendXact {
    pub(crate) parent: NiParent,
    core: XactCore,
}

impl SendXact {
    pub(crate) fn new() -> Self {
        SendXact {
            parent: NiParent::new(),
            core: XactCore::new(),
        }
    }
}

impl Deref for SendXact {
    type Target = XactCore;

    fn deref(&self) -> &XactCore {
        &self.core
    }
}

impl Pooled for SendXact {
    const KIND: PoolKind = PoolKind::SendXact;

    fn on_checkin(&self) {
        self.core.reset();
        self.parent.clear();
    }
}

/// A target-side transaction.
pub struct RecvXact {
    pub(crate) parent: NiParent,
    core: XactCore,
}

impl RecvXact {
    pub(crate) fn new() -> Self {
        RecvXact {
            parent: NiParent::new(),
            core: XactCore::new(),
        }
    }
}

impl Deref for RecvXact {
    type Target = XactCore;

    fn deref(&self) -> &XactCore {
        &self.core
    }
}

impl Pooled for RecvXact {
    const KIND: PoolKind = PoolKind::RecvXact;

    fn on_checkin(&self) {
        self.core.reset();
        self.parent.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn wait_sees_ready_transition() {
        let xact = Arc::new(SendXact::new());
        let marker = xact.clone();
        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            marker.mark_ready();
        });
        assert_eq!(xact.wait_released(Duration::from_secs(2)), Some(Ok(())));
        t.join().unwrap();
    }

    #[test]
    fn failed_transaction_reports_error() {
        let xact = RecvXact::new();
        xact.mark_failed(Error::ConnectionFailed);
        assert_eq!(
            xact.wait_released(Duration::from_millis(1)),
            Some(Err(Error::ConnectionFailed))
        );
    }

    #[test]
    fn timeout_leaves_record_queued() {
        let xact = SendXact::new();
        assert_eq!(xact.wait_released(Duration::from_millis(10)), None);
        assert_eq!(xact.state(), XactState::Queued);
    }

    #[test]
    fn checkin_resets_for_reuse() {
        let xact = SendXact::new();
        xact.set_nbytes(128);
        xact.attach_buf(Handle::from_raw(9));
        xact.mark_ready();

        xact.on_checkin();
        assert_eq!(xact.state(), XactState::Queued);
        assert_eq!(xact.nbytes(), 0);
        assert_eq!(xact.buf(), Handle::NONE);
    }
}
