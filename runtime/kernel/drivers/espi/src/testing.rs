// Licensed under the Apache-2.0 license

//! Small fakes for unit tests that do not need the full controller model.

use crate::hil::{Channel, Clock, VirtualWire, Wire};
use std::cell::{Cell, RefCell};

/// Advances one cycle per read.
#[derive(Default)]
pub struct FakeClock {
    pub cycles: Cell<u64>,
}

impl Clock for FakeClock {
    fn now(&self) -> u64 {
        let now = self.cycles.get();
        self.cycles.set(now + 1);
        now
    }
}

pub struct FakeVw {
    pub ready: Cell<bool>,
    pub wires: RefCell<Vec<(Wire, bool)>>,
    pub updates: Cell<usize>,
    pub platform_resets: Cell<usize>,
}

impl Default for FakeVw {
    fn default() -> Self {
        FakeVw {
            ready: Cell::new(true),
            wires: RefCell::new(Vec::new()),
            updates: Cell::new(0),
            platform_resets: Cell::new(0),
        }
    }
}

impl FakeVw {
    pub fn count(&self, wire: Wire) -> usize {
        self.wires
            .borrow()
            .iter()
            .filter(|(w, level)| *w == wire && *level)
            .count()
    }
}

impl VirtualWire for FakeVw {
    fn set_wire(&self, wire: Wire, level: bool) {
        self.wires.borrow_mut().push((wire, level));
    }

    fn channel_ready(&self, _channel: Channel) -> bool {
        self.ready.get()
    }

    fn handle_update(&self) {
        self.updates.set(self.updates.get() + 1);
    }

    fn handle_platform_reset(&self) {
        self.platform_resets.set(self.platform_resets.get() + 1);
    }
}

/// A zeroed buffer that lives for the rest of the test binary.
pub fn leak(len: usize) -> &'static mut [u8] {
    Box::leak(vec![0u8; len].into_boxed_slice())
}
