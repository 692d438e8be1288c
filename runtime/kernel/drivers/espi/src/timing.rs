// Licensed under the Apache-2.0 license

//! Bounded busy-waits and interrupt-enable save/restore for polling callers.

use crate::error::EspiError;
use crate::hil::Clock;
use crate::regs::{EspiBus, RegisterAccess, ESPIIE};

/// Spin until `cond` holds or `budget` cycles have elapsed.
pub fn busy_wait(
    clock: &dyn Clock,
    budget: u64,
    mut cond: impl FnMut() -> bool,
) -> Result<(), EspiError> {
    let start = clock.now();
    loop {
        if cond() {
            return Ok(());
        }
        if clock.now().wrapping_sub(start) >= budget {
            return Err(EspiError::Timeout);
        }
    }
}

/// Clears a set of ESPIIE bits for the lifetime of the guard and restores the
/// ones that were set when it drops.
pub struct MaskedInterrupts<'a> {
    bus: &'a dyn EspiBus,
    saved: u32,
}

impl<'a> MaskedInterrupts<'a> {
    pub fn new(bus: &'a dyn EspiBus, bits: u32) -> Self {
        let ie = bus.get_raw(ESPIIE);
        let saved = ie & bits;
        if saved != 0 {
            bus.set_raw(ESPIIE, ie & !bits);
        }
        MaskedInterrupts { bus, saved }
    }

    pub fn saved(&self) -> u32 {
        self.saved
    }
}

impl Drop for MaskedInterrupts<'_> {
    fn drop(&mut self) {
        if self.saved != 0 {
            let ie = self.bus.get_raw(ESPIIE);
            self.bus.set_raw(ESPIIE, ie | self.saved);
        }
    }
}
