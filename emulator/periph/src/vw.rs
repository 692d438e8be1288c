/*++

Licensed under the Apache-2.0 license.

File Name:

    vw.rs

Abstract:

    File contains the emulated cycle counter and virtual-wire channel used
    alongside the emulated eSPI controller.

--*/

use espi_driver::hil::{Channel, Clock, VirtualWire, Wire};
use std::cell::{Cell, RefCell};

/// Advances one cycle every time it is read.
#[derive(Default)]
pub struct EmulatedClock {
    cycles: Cell<u64>,
}

impl EmulatedClock {
    pub fn cycles(&self) -> u64 {
        self.cycles.get()
    }
}

impl Clock for EmulatedClock {
    fn now(&self) -> u64 {
        let now = self.cycles.get();
        self.cycles.set(now.wrapping_add(1));
        now
    }
}

/// Records every wire the slave drives and lets tests take channels down.
#[derive(Default)]
pub struct EmulatedVw {
    wires: RefCell<Vec<(Wire, bool)>>,
    not_ready: RefCell<Vec<Channel>>,
    updates: Cell<usize>,
    platform_resets: Cell<usize>,
}

impl EmulatedVw {
    pub fn set_ready(&self, channel: Channel, ready: bool) {
        let mut not_ready = self.not_ready.borrow_mut();
        not_ready.retain(|c| *c != channel);
        if !ready {
            not_ready.push(channel);
        }
    }

    /// How many times `wire` was asserted.
    pub fn asserted(&self, wire: Wire) -> usize {
        self.wires
            .borrow()
            .iter()
            .filter(|(w, level)| *w == wire && *level)
            .count()
    }

    /// Level `wire` was last driven to, if it was ever driven.
    pub fn level(&self, wire: Wire) -> Option<bool> {
        self.wires
            .borrow()
            .iter()
            .rev()
            .find(|(w, _)| *w == wire)
            .map(|(_, level)| *level)
    }

    pub fn wires(&self) -> Vec<(Wire, bool)> {
        self.wires.borrow().clone()
    }

    pub fn updates(&self) -> usize {
        self.updates.get()
    }

    pub fn platform_resets(&self) -> usize {
        self.platform_resets.get()
    }
}

impl VirtualWire for EmulatedVw {
    fn set_wire(&self, wire: Wire, level: bool) {
        self.wires.borrow_mut().push((wire, level));
    }

    fn channel_ready(&self, channel: Channel) -> bool {
        !self.not_ready.borrow().contains(&channel)
    }

    fn handle_update(&self) {
        self.updates.set(self.updates.get() + 1);
    }

    fn handle_platform_reset(&self) {
        self.platform_resets.set(self.platform_resets.get() + 1);
    }
}
