// Licensed under the Apache-2.0 license

//! Slave-side eSPI transaction engine.
//!
//! The bus-master ([`pcbm`]) and flash ([`flash`]) channels move data between
//! the embedded controller and the host. [`dispatch::Espi`] owns both engines
//! and routes controller interrupts to them.

#![cfg_attr(target_arch = "riscv32", no_std)]

pub mod config;
pub mod dispatch;
pub mod error;
pub mod flash;
pub mod hil;
pub mod packet;
pub mod pcbm;
pub mod regs;
pub mod request;
pub mod timing;

#[cfg(test)]
pub(crate) mod testing;

pub use config::EspiConfig;
pub use dispatch::Espi;
pub use error::{EspiError, ProtocolError, Status, TafStatus};

use hil::{Clock, DmaAdapter, DmaChannel, DmaDirection, DmaRequestor, DmaWidth, VirtualWire, Wire};
use log::warn;
use regs::EspiBus;

/// The hardware an engine drives, bundled so engines can copy it around.
#[derive(Clone, Copy)]
pub struct EspiHw<'a> {
    pub bus: &'a dyn EspiBus,
    pub clock: &'a dyn Clock,
    pub vw: &'a dyn VirtualWire,
    pub dma: Option<&'a dyn DmaAdapter>,
    /// Cycle budget of every busy-wait.
    pub timeout: u64,
}

impl<'a> EspiHw<'a> {
    pub fn new(bus: &'a dyn EspiBus, clock: &'a dyn Clock, vw: &'a dyn VirtualWire) -> Self {
        EspiHw {
            bus,
            clock,
            vw,
            dma: None,
            timeout: config::BUSY_WAIT_TIMEOUT,
        }
    }

    pub fn with_dma(mut self, dma: &'a dyn DmaAdapter) -> Self {
        self.dma = Some(dma);
        self
    }

    pub fn with_timeout(mut self, timeout: u64) -> Self {
        self.timeout = timeout;
        self
    }

    /// Busy-wait on `cond` with the configured budget.
    pub fn wait(&self, cond: impl FnMut() -> bool) -> Result<(), EspiError> {
        timing::busy_wait(self.clock, self.timeout, cond)
    }

    pub fn raise_non_fatal(&self) {
        self.vw.set_wire(Wire::NonFatalError, true);
    }

    pub fn clear_non_fatal(&self) {
        self.vw.set_wire(Wire::NonFatalError, false);
    }

    /// Allocates and arms a DMA channel for `len` bytes at `addr`.
    pub fn attach_dma(
        &self,
        requestor: DmaRequestor,
        direction: DmaDirection,
        addr: usize,
        len: usize,
    ) -> Result<DmaChannel, EspiError> {
        let dma = self
            .dma
            .ok_or(EspiError::Dma(hil::DmaError::NoChannel))?;
        let width = DmaWidth::select(addr, len).ok_or(EspiError::Unaligned)?;
        let channel = dma.alloc_channel(width)?;
        let armed = dma
            .config(channel, width, direction)
            .and_then(|_| dma.config_requestor(channel, requestor))
            .and_then(|_| dma.transfer(channel, addr, len));
        if let Err(err) = armed {
            warn!("[espi] dma setup failed: {:?}", err);
            dma.free_channel(channel);
            return Err(err.into());
        }
        Ok(channel)
    }

    pub fn release_dma(&self, channel: Option<DmaChannel>) {
        if let (Some(dma), Some(channel)) = (self.dma, channel) {
            dma.free_channel(channel);
        }
    }
}

/// A channel's hold on the non-fatal error wire. The channel that raised it
/// drops it again once it takes new work or is reset.
#[derive(Debug, Default)]
pub(crate) struct ErrorWire {
    asserted: bool,
}

impl ErrorWire {
    pub fn raise(&mut self, hw: &EspiHw) {
        hw.raise_non_fatal();
        self.asserted = true;
    }

    pub fn release(&mut self, hw: &EspiHw) {
        if core::mem::take(&mut self.asserted) {
            hw.clear_non_fatal();
        }
    }

    pub fn is_asserted(&self) -> bool {
        self.asserted
    }
}
