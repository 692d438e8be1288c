// Licensed under the Apache-2.0 license

//! Top-level interrupt service for the eSPI controller.

use crate::config::{EspiConfig, FlashMode};
use crate::error::EspiError;
use crate::flash::maf::Maf;
use crate::flash::taf::Taf;
use crate::hil::{Channel, EspiClient, EspiEvent, OobChannel, Wire};
use crate::pcbm::PcBm;
use crate::regs::{EspiSts, RegisterAccess, ESPIERR, ESPIIE, ESPISTS, ESPIWE};
use crate::EspiHw;
use log::{debug, info, trace, warn};
use tock_registers::LocalRegisterCopy;

/// Adds the error bits that share an enable bit with their done bit.
fn effective(enabled: u32) -> u32 {
    let mut mask = LocalRegisterCopy::<u32, EspiSts::Register>::new(enabled);
    if mask.is_set(EspiSts::AmDone) {
        mask.modify(EspiSts::AmErr::SET);
    }
    if mask.is_set(EspiSts::BmBurstDone) {
        mask.modify(EspiSts::BmBurstErr::SET);
    }
    mask.get()
}

/// Owns the channel engines and routes controller events to them.
pub struct Espi<'a> {
    hw: EspiHw<'a>,
    config: EspiConfig,
    pcbm: PcBm<'a>,
    maf: Maf<'a>,
    taf: Taf<'a>,
    client: Option<&'a dyn EspiClient>,
    oob: Option<&'a dyn OobChannel>,
}

impl<'a> Espi<'a> {
    pub fn new(hw: EspiHw<'a>, config: EspiConfig) -> Self {
        let hw = hw.with_timeout(config.busy_wait_timeout);
        Espi {
            hw,
            config,
            pcbm: PcBm::new(hw),
            maf: Maf::new(hw),
            taf: Taf::new(hw),
            client: None,
            oob: None,
        }
    }

    /// Reads the negotiated capabilities, sets up the flash channel mode and
    /// programs the interrupt and wake enables.
    pub fn init(&mut self) -> Result<(), EspiError> {
        let bus = self.hw.bus;
        self.pcbm.init(&self.config.pcbm);
        match self.config.flash.mode {
            FlashMode::Maf => self.maf.init(&self.config.flash, self.config.errata),
            FlashMode::Taf => self.taf.config(&self.config.flash)?,
        }
        bus.set_raw(ESPIIE, self.config.irq_enable);
        bus.set_raw(ESPIWE, self.config.wake_enable);
        info!(
            "[espi] ready, flash {:?} ie {:#x} we {:#x}",
            self.config.flash.mode, self.config.irq_enable, self.config.wake_enable
        );
        Ok(())
    }

    pub fn set_client(&mut self, client: &'a dyn EspiClient) {
        self.client = Some(client);
    }

    pub fn set_oob(&mut self, oob: &'a dyn OobChannel) {
        self.oob = Some(oob);
    }

    pub fn pcbm(&mut self) -> &mut PcBm<'a> {
        &mut self.pcbm
    }

    pub fn maf(&mut self) -> &mut Maf<'a> {
        &mut self.maf
    }

    pub fn taf(&mut self) -> &mut Taf<'a> {
        &mut self.taf
    }

    pub fn config(&self) -> &EspiConfig {
        &self.config
    }

    /// Reports the outcome of the boot image load to the host. Status is
    /// driven ahead of done so the host never samples done with a stale
    /// status.
    pub fn boot_load_done(&self, success: bool) -> Result<(), EspiError> {
        let vw = self.hw.vw;
        if !vw.channel_ready(Channel::VirtualWire) {
            return Err(EspiError::ChannelDisabled);
        }
        vw.set_wire(Wire::BootLoadStatus, success);
        vw.set_wire(Wire::BootLoadDone, true);
        info!("[espi] boot load done, status {}", success);
        Ok(())
    }

    fn notify(&self, event: EspiEvent) {
        match self.client {
            Some(client) => client.event(event),
            None => trace!("[espi] unhandled {:?}", event),
        }
    }

    /// Services every pending condition, re-reading ESPISTS until nothing
    /// enabled is left.
    pub fn handle_interrupt(&mut self) {
        let bus = self.hw.bus;
        loop {
            let enabled = effective(bus.get_raw(ESPIIE) | bus.get_raw(ESPIWE));
            let pending = bus.get_raw(ESPISTS) & enabled;
            if pending == 0 {
                break;
            }
            bus.clear_status(ESPISTS, pending);
            let handled = pending & effective(bus.get_raw(ESPIIE));
            trace!("[espi] pending {:#x} handled {:#x}", pending, handled);
            self.service(handled);
        }
    }

    fn service(&mut self, bits: u32) {
        let sts = LocalRegisterCopy::<u32, EspiSts::Register>::new(bits);
        let vw = self.hw.vw;

        if sts.is_set(EspiSts::Berr) {
            let err = self.hw.bus.get_raw(ESPIERR);
            self.hw.bus.clear_status(ESPIERR, err);
            warn!("[espi] bus error {:#x}", err);
            self.notify(EspiEvent::BusError(err));
        }
        if sts.is_set(EspiSts::EspiRst) {
            self.reset_channels("espi reset");
            self.notify(EspiEvent::EspiReset);
        }
        if sts.is_set(EspiSts::PltRst) {
            vw.handle_platform_reset();
            self.reset_channels("platform reset");
            self.notify(EspiEvent::PlatformReset);
        }
        if sts.is_set(EspiSts::CfgUpd) {
            self.pcbm.init(&self.config.pcbm);
            if self.config.flash.mode == FlashMode::Maf {
                self.maf.init(&self.config.flash, self.config.errata);
            }
            self.notify(EspiEvent::ConfigUpdate);
        }
        if sts.is_set(EspiSts::FlashRx) {
            self.flash_rx();
        }
        if sts.is_set(EspiSts::AmDone) || sts.is_set(EspiSts::AmErr) {
            self.maf.handle_auto(bits);
        }
        if sts.is_set(EspiSts::OobRx) {
            match self.oob {
                Some(oob) => oob.handle_rx(),
                None => debug!("[espi] oob packet with no handler"),
            }
        }
        if sts.is_set(EspiSts::VwUpd) {
            vw.handle_update();
        }
        if sts.is_set(EspiSts::PerAcc) {
            self.notify(EspiEvent::PeripheralAccess);
        }
        if sts.is_set(EspiSts::Dfrd) {
            self.notify(EspiEvent::DeferredAccess);
        }
        if sts.is_set(EspiSts::FltVw) {
            vw.handle_update();
        }
        if sts.is_set(EspiSts::SFlashRd) {
            self.notify(EspiEvent::FlashReadDetected);
        }
        if sts.is_set(EspiSts::IbRst) {
            self.reset_channels("in-band reset");
            self.notify(EspiEvent::InBandReset);
        }
        if sts.is_set(EspiSts::BmBurstDone)
            || sts.is_set(EspiSts::BmWBurstDone)
            || sts.is_set(EspiSts::BmBurstErr)
        {
            self.pcbm.handle_burst(bits);
        }
        if sts.is_set(EspiSts::PMsgRx) {
            self.notify(EspiEvent::PeripheralMessage);
        }
        if sts.is_set(EspiSts::BmTxDone) {
            self.pcbm.handle_tx_done();
        }
        if sts.is_set(EspiSts::PbmRx) {
            self.pcbm.handle_rx();
        }
    }

    fn flash_rx(&mut self) {
        if self.config.flash.mode == FlashMode::Maf {
            self.maf.handle_rx();
            return;
        }
        match self.taf.handle_req() {
            Ok(_) if self.config.flash.auto_respond => {
                if let Err(err) = self.taf.respond_all() {
                    warn!("[espi] flash response failed: {}", err);
                }
            }
            Ok(_) => {}
            Err(err) => warn!("[espi] flash request not handled: {}", err),
        }
    }

    fn reset_channels(&mut self, why: &str) {
        info!("[espi] {}, aborting channel requests", why);
        self.pcbm.handle_reset();
        match self.config.flash.mode {
            FlashMode::Maf => self.maf.handle_reset(),
            FlashMode::Taf => self.taf.handle_reset(),
        }
    }
}
