//! Process-wide lifecycle.
//!
//! [`init`] lazily constructs the global state on the first call: transport
//! interface discovery, the event-processing thread, and the NI pool.
//! Later calls only bump a reference count. [`fini`] releases a reference;
//! the last one waits for every NI to drain, stops the event thread, and
//! tears the state down in reverse construction order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::Duration;

use crate::conn::ConnRegistry;
use crate::error::{Error, Result};
use crate::ni::{self, Ni, NiBody};
use crate::pool::Pool;
use crate::transport::sim::SimNet;
use crate::transport::{ConnToken, IfaceFinder, Interface, TransportEvent, TransportProvider};

/// NIs a process may hold at once.
const MAX_NIS: usize = 8;

/// How long the event thread blocks for a transport event per pass.
const EVENT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long teardown waits for outstanding NI references.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// The state behind an initialized process.
pub(crate) struct GlobalInner {
    pub(crate) iface: Arc<dyn Interface>,
    pub(crate) registry: Arc<ConnRegistry>,
    pub(crate) ni_pool: Pool<Ni>,
    /// Live NI bodies, for completion polling and inbound dispatch.
    nis: Mutex<Vec<Weak<NiBody>>>,
    stop: Arc<AtomicBool>,
    /// Keeps the provider (and with it the transport fabric) alive.
    _provider: Arc<dyn TransportProvider>,
}

impl GlobalInner {
    pub(crate) fn track_ni(&self, body: &Arc<NiBody>) {
        let mut nis = self.nis.lock().unwrap();
        nis.retain(|w| w.strong_count() > 0);
        nis.push(Arc::downgrade(body));
    }

    fn live_nis(&self) -> Vec<Arc<NiBody>> {
        let mut nis = self.nis.lock().unwrap();
        nis.retain(|w| w.strong_count() > 0);
        nis.iter().filter_map(Weak::upgrade).collect()
    }
}

struct GlobalState {
    refs: usize,
    inner: Option<Arc<GlobalInner>>,
    thread: Option<thread::JoinHandle<()>>,
}

static GLOBAL: Mutex<GlobalState> = Mutex::new(GlobalState {
    refs: 0,
    inner: None,
    thread: None,
});

/// Initialize the process-wide state with a loopback transport.
///
/// Safe to call repeatedly and concurrently; construction happens once.
/// Every successful call must be balanced by a [`fini`].
pub fn init() -> Result<()> {
    let net = SimNet::new();
    net.add_iface("sim0");
    init_with(net)
}

/// Initialize the process-wide state with the given transport provider.
///
/// If the state is already up, the provider is ignored and the reference
/// count is incremented.
pub fn init_with(provider: Arc<dyn TransportProvider>) -> Result<()> {
    let mut g = GLOBAL.lock().unwrap();
    if g.refs == 0 {
        let iface = IfaceFinder::new().probe(provider.as_ref()).map_err(|e| {
            log::error!("transport interface discovery failed: {}", e);
            Error::NotInitialized
        })?;
        let inner = Arc::new(GlobalInner {
            iface,
            registry: ConnRegistry::new(),
            ni_pool: ni::make_ni_pool(MAX_NIS),
            nis: Mutex::new(Vec::new()),
            stop: Arc::new(AtomicBool::new(false)),
            _provider: provider,
        });
        let thread_inner = inner.clone();
        let handle = thread::Builder::new()
            .name("rportals-events".into())
            .spawn(move || event_loop(thread_inner))
            .map_err(|e| {
                log::error!("failed to start event thread: {}", e);
                Error::NotInitialized
            })?;
        g.inner = Some(inner);
        g.thread = Some(handle);
        log::debug!("global state initialized");
    }
    g.refs += 1;
    Ok(())
}

/// Release one reference to the process-wide state.
///
/// The last release stops the event thread and tears everything down. An
/// NI still outstanding at that point is a lifetime-tracking bug and
/// aborts the process after the drain barrier times out.
pub fn fini() {
    let mut g = GLOBAL.lock().unwrap();
    if g.refs == 0 {
        log::warn!("fini without a matching init");
        return;
    }
    g.refs -= 1;
    if g.refs > 0 {
        return;
    }
    let Some(inner) = g.inner.take() else { return };

    // Deterministic drain barrier: every NI reference must be gone before
    // the transport goes away under it.
    let started = quanta::Instant::now();
    if !inner.ni_pool.drain(DRAIN_TIMEOUT) {
        log::error!(
            "{} NI(s) still referenced after {:?}; lifetime tracking is broken",
            inner.ni_pool.live(),
            started.elapsed()
        );
        panic!("global teardown with outstanding NI references");
    }

    inner.stop.store(true, Ordering::Release);
    inner.iface.wake();
    if let Some(thread) = g.thread.take() {
        let _ = thread.join();
    }
    log::debug!("global state torn down");
}

/// The current global state, for internal callers.
pub(crate) fn get() -> Result<Arc<GlobalInner>> {
    GLOBAL
        .lock()
        .unwrap()
        .inner
        .clone()
        .ok_or(Error::NotInitialized)
}

/// Whether the process-wide state is up. Diagnostics only; the answer can
/// change concurrently.
pub fn is_initialized() -> bool {
    GLOBAL.lock().unwrap().refs > 0
}

fn event_loop(g: Arc<GlobalInner>) {
    log::debug!("event thread started on {}", g.iface.name());
    loop {
        if g.stop.load(Ordering::Acquire) {
            break;
        }
        if let Some(ev) = g.iface.poll_event(EVENT_POLL_INTERVAL) {
            match g.registry.dispatch(ev) {
                Some(TransportEvent::ConnectRequest { token, private }) => {
                    offer_connect(&g, token, &private)
                }
                Some(TransportEvent::Shutdown) => break,
                _ => {}
            }
        }
        for ni in g.live_nis() {
            ni.poll_completions();
        }
    }
    log::debug!("event thread exiting");
}

/// Offer an inbound connect request to each live NI; reject it if none
/// takes it.
fn offer_connect(g: &Arc<GlobalInner>, token: ConnToken, private: &[u8]) {
    for ni in g.live_nis() {
        if ni.offer_connect(token, private) {
            return;
        }
    }
    log::warn!("no NI accepted inbound connection, rejecting");
    g.iface.reject(token);
}
