//! Registered memory regions and memory descriptors.

use std::sync::Mutex;

use crate::ni::NiParent;
use crate::pool::{Handle, PoolKind, Pooled};
use crate::transport::MemoryKey;

/// A transport-registered memory region.
///
/// The region is described to the pool empty and bound to an address range
/// and key on checkout, via [`Mr::bind`].
pub struct Mr {
    pub(crate) parent: NiParent,
    state: Mutex<MrState>,
}

#[derive(Default)]
struct MrState {
    key: Option<MemoryKey>,
    addr: u64,
    length: usize,
}

impl Mr {
    pub(crate) fn new() -> Self {
        Mr {
            parent: NiParent::new(),
            state: Mutex::new(MrState::default()),
        }
    }

    /// Bind the region to a registered range.
    pub fn bind(&self, key: MemoryKey, addr: u64, length: usize) {
        let mut state = self.state.lock().unwrap();
        state.key = Some(key);
        state.addr = addr;
        state.length = length;
    }

    /// The transport key, if the region is bound.
    pub fn key(&self) -> Option<MemoryKey> {
        self.state.lock().unwrap().key
    }

    /// Start address of the bound range.
    pub fn addr(&self) -> u64 {
        self.state.lock().unwrap().addr
    }

    /// Length of the bound range in bytes.
    pub fn length(&self) -> usize {
        self.state.lock().unwrap().length
    }

    /// Whether `[addr, addr + len)` falls inside the bound range.
    pub fn covers(&self, addr: u64, len: usize) -> bool {
        let state = self.state.lock().unwrap();
        state.key.is_some()
            && addr >= state.addr
            && addr.saturating_add(len as u64) <= state.addr.saturating_add(state.length as u64)
    }
}

impl Pooled for Mr {
    const KIND: PoolKind = PoolKind::Mr;

    fn on_checkin(&self) {
        *self.state.lock().unwrap() = MrState::default();
        self.parent.clear();
    }
}

/// Memory-descriptor options.
pub mod md_options {
    /// Suppress full events for operations on this descriptor.
    pub const EVENT_DISABLE: u32 = 1 << 0;
    /// Count successes on the attached counting event.
    pub const CT_SEND: u32 = 1 << 1;
    /// Count acknowledgements on the attached counting event.
    pub const CT_ACK: u32 = 1 << 2;
}

/// A memory descriptor: a view over a registered region that initiator-side
/// operations read from or write into.
pub struct Md {
    pub(crate) parent: NiParent,
    state: Mutex<MdState>,
}

struct MdState {
    mr: Handle,
    eq: Handle,
    ct: Handle,
    options: u32,
}

impl Default for MdState {
    fn default() -> Self {
        MdState {
            mr: Handle::NONE,
            eq: Handle::NONE,
            ct: Handle::NONE,
            options: 0,
        }
    }
}

impl Md {
    pub(crate) fn new() -> Self {
        Md {
            parent: NiParent::new(),
            state: Mutex::new(MdState::default()),
        }
    }

    /// Describe the descriptor: backing region, event targets, options.
    pub fn describe(&self, mr: Handle, eq: Handle, ct: Handle, options: u32) {
        let mut state = self.state.lock().unwrap();
        state.mr = mr;
        state.eq = eq;
        state.ct = ct;
        state.options = options;
    }

    /// Handle of the backing memory region.
    pub fn mr(&self) -> Handle {
        self.state.lock().unwrap().mr
    }

    /// Handle of the event queue full events are delivered to.
    pub fn eq(&self) -> Handle {
        self.state.lock().unwrap().eq
    }

    /// Handle of the attached counting event.
    pub fn ct(&self) -> Handle {
        self.state.lock().unwrap().ct
    }

    pub fn options(&self) -> u32 {
        self.state.lock().unwrap().options
    }
}

impl Pooled for Md {
    const KIND: PoolKind = PoolKind::Md;

    fn on_checkin(&self) {
        *self.state.lock().unwrap() = MdState::default();
        self.parent.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mr_covers_bound_range_only() {
        let mr = Mr::new();
        assert!(!mr.covers(0x1000, 16));

        mr.bind(MemoryKey(7), 0x1000, 0x100);
        assert!(mr.covers(0x1000, 0x100));
        assert!(mr.covers(0x10f0, 0x10));
        assert!(!mr.covers(0x10f0, 0x11));
        assert!(!mr.covers(0xfff, 1));
    }

    #[test]
    fn covers_near_address_space_end() {
        let mr = Mr::new();
        mr.bind(MemoryKey(3), u64::MAX - 64, 128);
        assert!(mr.covers(u64::MAX - 64, 64));
        assert!(!mr.covers(0x1000, 16));
    }

    #[test]
    fn checkin_resets_descriptor() {
        let md = Md::new();
        md.describe(Handle::from_raw(3), Handle::NONE, Handle::NONE, md_options::CT_SEND);
        assert_eq!(md.options(), md_options::CT_SEND);

        md.on_checkin();
        assert_eq!(md.mr(), Handle::NONE);
        assert_eq!(md.options(), 0);
    }
}
