// Licensed under the Apache-2.0 license

//! Flash-access channel, in its master-attached ([`maf`]) and target-attached
//! ([`taf`]) forms.

pub mod maf;
pub mod protection;
pub mod taf;

use crate::config::FlashConfig;
use crate::hil::{Channel, EraseSizes};
use crate::packet;
use crate::regs::{EspiCfg, FlashCfg, RegisterAccess, ESPICFG, FLASHCFG};
use crate::EspiHw;

/// Largest flash payload that fits the transfer windows.
pub const FLASH_MAX_PAYLOAD: usize = 64;
/// Hardware cap on automatic transactions.
pub const MAX_AUTO_TRANSACTIONS: usize = 256;

/// Negotiated flash channel parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashCaps {
    pub max_payload: usize,
    pub max_read_request: usize,
    pub page_size: usize,
    /// Erase sizes the channel declares to the host.
    pub erase_sizes: EraseSizes,
    /// Modulus of manual request tags.
    pub tag_modulus: u8,
}

impl Default for FlashCaps {
    fn default() -> Self {
        FlashCaps {
            max_payload: FLASH_MAX_PAYLOAD,
            max_read_request: FLASH_MAX_PAYLOAD,
            page_size: 256,
            erase_sizes: EraseSizes::ALL,
            tag_modulus: 16,
        }
    }
}

impl FlashCaps {
    /// Reads FLASHCFG, bounding the results by `config`.
    pub fn read(hw: &EspiHw, config: &FlashConfig) -> Self {
        let cfg = hw.bus.get(FLASHCFG);
        let max_payload =
            packet::max_payload(cfg.read(FlashCfg::MaxPayload)).min(FLASH_MAX_PAYLOAD);
        FlashCaps {
            max_payload,
            max_read_request: packet::max_read_request(cfg.read(FlashCfg::MaxReadReq)),
            page_size: config.page_size.max(1),
            erase_sizes: EraseSizes(cfg.read(FlashCfg::EraseSizes) as u8),
            tag_modulus: if cfg.matches_all(FlashCfg::TagMode::Tag2) {
                2
            } else {
                16
            },
        }
    }
}

/// Whether both ends have the flash channel up.
pub(crate) fn channel_enabled(hw: &EspiHw) -> bool {
    let cfg = hw.bus.get(ESPICFG);
    cfg.is_set(EspiCfg::FlashEn) && hw.vw.channel_ready(Channel::Flash)
}
