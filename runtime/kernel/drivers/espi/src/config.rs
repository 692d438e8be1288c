// Licensed under the Apache-2.0 license

use crate::regs::EspiSts;

/// Default cycle budget for every busy-wait.
pub const BUSY_WAIT_TIMEOUT: u64 = 100_000;

/// Bus-master channel limits. The controller's capability registers can lower
/// these further at init.
pub struct PcBmConfig {
    /// Largest payload of a single transaction.
    pub max_payload: usize,
    /// Upper bound on the number of transactions in one burst.
    pub max_burst_transactions: u32,
}

impl Default for PcBmConfig {
    fn default() -> Self {
        PcBmConfig {
            max_payload: 64,
            max_burst_transactions: 64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlashMode {
    /// Flash hangs off the master; the slave issues requests.
    #[default]
    Maf,
    /// Flash hangs off the slave; the master issues requests.
    Taf,
}

pub struct FlashConfig {
    pub mode: FlashMode,
    /// Program/erase page size used for write and erase chunking.
    pub page_size: usize,
    /// TAF: value of FLASHBASE, added to every host offset.
    pub base_address: u32,
    /// TAF: answer requests from the interrupt handler without waiting for
    /// the caller to call `send_res`.
    pub auto_respond: bool,
}

impl Default for FlashConfig {
    fn default() -> Self {
        FlashConfig {
            mode: FlashMode::Maf,
            page_size: 256,
            base_address: 0,
            auto_respond: true,
        }
    }
}

/// Silicon workarounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Errata {
    /// Automatic reads need the flash offset aligned to the next power of two
    /// of the transfer size.
    pub auto_read_pow2_alignment: bool,
    /// A reset that lands during an automatic read leaves the flash channel
    /// out of step until one manual read has completed.
    pub dummy_read_after_reset: bool,
}

pub struct EspiConfig {
    pub pcbm: PcBmConfig,
    pub flash: FlashConfig,
    pub busy_wait_timeout: u64,
    /// ESPIIE value programmed at init.
    pub irq_enable: u32,
    /// ESPIWE value programmed at init.
    pub wake_enable: u32,
    pub errata: Errata,
}

impl Default for EspiConfig {
    fn default() -> Self {
        let irq = EspiSts::Berr::SET
            + EspiSts::EspiRst::SET
            + EspiSts::PltRst::SET
            + EspiSts::CfgUpd::SET
            + EspiSts::FlashRx::SET
            + EspiSts::AmDone::SET
            + EspiSts::OobRx::SET
            + EspiSts::VwUpd::SET
            + EspiSts::IbRst::SET
            + EspiSts::BmBurstDone::SET
            + EspiSts::BmWBurstDone::SET
            + EspiSts::BmTxDone::SET
            + EspiSts::PbmRx::SET;
        EspiConfig {
            pcbm: PcBmConfig::default(),
            flash: FlashConfig::default(),
            busy_wait_timeout: BUSY_WAIT_TIMEOUT,
            irq_enable: irq.value,
            wake_enable: (EspiSts::EspiRst::SET + EspiSts::PltRst::SET).value,
            errata: Errata::default(),
        }
    }
}
