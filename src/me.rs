//! List entries and match entries.
//!
//! Target-side receive resources. A list entry exposes a plain memory
//! range; a match entry additionally carries match/ignore bit patterns an
//! inbound header must satisfy.

use std::sync::Mutex;

use crate::ni::NiParent;
use crate::pool::{Handle, PoolKind, Pooled};

/// List/match entry options.
pub mod entry_options {
    /// The entry services put operations.
    pub const OP_PUT: u32 = 1 << 0;
    /// The entry services get operations.
    pub const OP_GET: u32 = 1 << 1;
    /// The entry is unlinked after its first use.
    pub const USE_ONCE: u32 = 1 << 2;
}

struct EntryState {
    start: u64,
    length: usize,
    ct: Handle,
    options: u32,
}

impl Default for EntryState {
    fn default() -> Self {
        EntryState {
            start: 0,
            length: 0,
            ct: Handle::NONE,
            options: 0,
        }
    }
}

/// A list entry: a target-side memory range with no matching.
pub struct Le {
    pub(crate) parent: NiParent,
    state: Mutex<EntryState>,
}

impl Le {
    pub(crate) fn new() -> Self {
        Le {
            parent: NiParent::new(),
            state: Mutex::new(EntryState::default()),
        }
    }

    pub fn describe(&self, start: u64, length: usize, ct: Handle, options: u32) {
        let mut state = self.state.lock().unwrap();
        state.start = start;
        state.length = length;
        state.ct = ct;
        state.options = options;
    }

    pub fn start(&self) -> u64 {
        self.state.lock().unwrap().start
    }

    pub fn length(&self) -> usize {
        self.state.lock().unwrap().length
    }

    pub fn ct(&self) -> Handle {
        self.state.lock().unwrap().ct
    }

    pub fn options(&self) -> u32 {
        self.state.lock().unwrap().options
    }
}

impl Pooled for Le {
    const KIND: PoolKind = PoolKind::Le;

    fn on_checkin(&self) {
        *self.state.lock().unwrap() = EntryState::default();
        self.parent.clear();
    }
}

#[derive(Default)]
struct MatchState {
    match_bits: u64,
    ignore_bits: u64,
}

/// A match entry: a list entry plus match/ignore bit patterns.
pub struct Me {
    pub(crate) parent: NiParent,
    entry: Mutex<EntryState>,
    matching: Mutex<MatchState>,
}

impl Me {
    pub(crate) fn new() -> Self {
        Me {
            parent: NiParent::new(),
            entry: Mutex::new(EntryState::default()),
            matching: Mutex::new(MatchState::default()),
        }
    }

    pub fn describe(
        &self,
        start: u64,
        length: usize,
        ct: Handle,
        options: u32,
        match_bits: u64,
        ignore_bits: u64,
    ) {
        {
            let mut entry = self.entry.lock().unwrap();
            entry.start = start;
            entry.length = length;
            entry.ct = ct;
            entry.options = options;
        }
        let mut matching = self.matching.lock().unwrap();
        matching.match_bits = match_bits;
        matching.ignore_bits = ignore_bits;
    }

    /// Whether an inbound header's match bits satisfy this entry.
    ///
    /// Bits set in `ignore_bits` are masked out of the comparison.
    pub fn matches(&self, bits: u64) -> bool {
        let matching = self.matching.lock().unwrap();
        (matching.match_bits ^ bits) & !matching.ignore_bits == 0
    }

    pub fn start(&self) -> u64 {
        self.entry.lock().unwrap().start
    }

    pub fn length(&self) -> usize {
        self.entry.lock().unwrap().length
    }

    pub fn options(&self) -> u32 {
        self.entry.lock().unwrap().options
    }
}

impl Pooled for Me {
    const KIND: PoolKind = PoolKind::Me;

    fn on_checkin(&self) {
        *self.entry.lock().unwrap() = EntryState::default();
        *self.matching.lock().unwrap() = MatchState::default();
        self.parent.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn match_bits_with_ignore_mask() {
        let me = Me::new();
        me.describe(0, 4096, Handle::NONE, entry_options::OP_PUT, 0xdead_0000, 0xffff);

        assert!(me.matches(0xdead_0000));
        // Ignored low bits may differ.
        assert!(me.matches(0xdead_1234));
        assert!(!me.matches(0xbeef_0000));
    }

    #[test]
    fn exact_match_without_ignore() {
        let me = Me::new();
        me.describe(0, 0, Handle::NONE, 0, 42, 0);
        assert!(me.matches(42));
        assert!(!me.matches(43));
    }
}
