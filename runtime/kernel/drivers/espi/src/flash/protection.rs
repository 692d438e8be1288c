// Licensed under the Apache-2.0 license

//! Firmware-enforced access control for host flash requests.
//!
//! Sixteen region slots live in FLASH_PRTR_BADDR/HADDR and FLASH_RGN_TAG_OVR.
//! Regions are 4 KiB granular: a slot covers every byte from its base page up
//! to and including its top page. Once a slot's lock bit is set it cannot be
//! changed until the controller is reset.

use crate::error::EspiError;
use crate::regs::{
    flash_prtr_baddr, flash_prtr_haddr, flash_rgn_tag_ovr, EspiBus, PrtrBaddr, PrtrHaddr,
    RegisterAccess, RgnTagOvr, PROTECTION_REGIONS,
};
use log::{debug, warn};

const PAGE_SHIFT: u32 = 12;
const PAGE_MASK: u32 = (1 << PAGE_SHIFT) - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProtectionRegion {
    /// First byte; must be page aligned.
    pub base: u32,
    /// Any address inside the last covered page.
    pub top: u32,
    pub read_protect: bool,
    pub write_protect: bool,
    /// Bit `i` lets tag `i` through regardless of the protect flags.
    pub tag_override: u16,
    pub locked: bool,
}

impl ProtectionRegion {
    pub fn new(base: u32, top: u32) -> Self {
        ProtectionRegion {
            base,
            top,
            ..Default::default()
        }
    }

    pub fn read_protected(mut self) -> Self {
        self.read_protect = true;
        self
    }

    pub fn write_protected(mut self) -> Self {
        self.write_protect = true;
        self
    }

    pub fn allow_tag(mut self, tag: u8) -> Self {
        self.tag_override |= 1 << (tag & 0xf);
        self
    }

    pub fn is_active(&self) -> bool {
        self.read_protect || self.write_protect
    }

    /// Last byte covered by the region.
    pub fn end(&self) -> u32 {
        self.top | PAGE_MASK
    }

    pub fn overlaps(&self, start: u32, last: u32) -> bool {
        start <= self.end() && last >= self.base
    }

    /// Whether this region stops `access` from `tag`.
    pub fn blocks(&self, access: Access, tag: u8) -> bool {
        let protected = match access {
            Access::Read => self.read_protect,
            Access::Write => self.write_protect,
        };
        protected && self.tag_override & (1 << (tag & 0xf)) == 0
    }
}

fn check_slot(slot: usize) -> Result<(), EspiError> {
    if slot >= PROTECTION_REGIONS {
        return Err(EspiError::InvalidRegion);
    }
    Ok(())
}

pub fn read_region(bus: &dyn EspiBus, slot: usize) -> Result<ProtectionRegion, EspiError> {
    check_slot(slot)?;
    let baddr = bus.get(flash_prtr_baddr(slot));
    let haddr = bus.get(flash_prtr_haddr(slot));
    Ok(ProtectionRegion {
        base: baddr.read(PrtrBaddr::Base) << PAGE_SHIFT,
        top: haddr.read(PrtrHaddr::Top) << PAGE_SHIFT,
        read_protect: baddr.is_set(PrtrBaddr::Rpr),
        write_protect: baddr.is_set(PrtrBaddr::Wpr),
        tag_override: bus.read_field(flash_rgn_tag_ovr(slot), RgnTagOvr::Tags) as u16,
        locked: baddr.is_set(PrtrBaddr::Lock),
    })
}

/// Programs a slot. A locked slot is left untouched.
pub fn set_rw_protect(
    bus: &dyn EspiBus,
    slot: usize,
    region: &ProtectionRegion,
) -> Result<(), EspiError> {
    check_slot(slot)?;
    if region.base & PAGE_MASK != 0 || region.top < region.base {
        return Err(EspiError::InvalidRegion);
    }
    if read_region(bus, slot)?.locked {
        warn!("[espi-taf] region {} is locked", slot);
        return Err(EspiError::RegionLocked);
    }
    bus.set(
        flash_rgn_tag_ovr(slot),
        RgnTagOvr::Tags.val(region.tag_override as u32),
    );
    bus.set(
        flash_prtr_haddr(slot),
        PrtrHaddr::Top.val(region.top >> PAGE_SHIFT),
    );
    // The lock bit goes in last, together with the base.
    bus.set(
        flash_prtr_baddr(slot),
        PrtrBaddr::Base.val(region.base >> PAGE_SHIFT)
            + PrtrBaddr::Rpr.val(region.read_protect as u32)
            + PrtrBaddr::Wpr.val(region.write_protect as u32)
            + PrtrBaddr::Lock.val(region.locked as u32),
    );
    debug!(
        "[espi-taf] region {}: {:#x}..={:#x} rpr {} wpr {}",
        slot,
        region.base,
        region.end(),
        region.read_protect,
        region.write_protect
    );
    Ok(())
}

/// Drops the protect flags of a slot.
pub fn clear_rw_protect(bus: &dyn EspiBus, slot: usize) -> Result<(), EspiError> {
    check_slot(slot)?;
    if read_region(bus, slot)?.locked {
        warn!("[espi-taf] region {} is locked", slot);
        return Err(EspiError::RegionLocked);
    }
    bus.modify(
        flash_prtr_baddr(slot),
        PrtrBaddr::Rpr::CLEAR + PrtrBaddr::Wpr::CLEAR,
    );
    bus.set(flash_rgn_tag_ovr(slot), RgnTagOvr::Tags.val(0));
    Ok(())
}

/// Freezes a slot until reset.
pub fn lock_region(bus: &dyn EspiBus, slot: usize) -> Result<(), EspiError> {
    check_slot(slot)?;
    bus.modify(flash_prtr_baddr(slot), PrtrBaddr::Lock::SET);
    Ok(())
}

/// Checks `len` bytes at `offset` against every active slot. On refusal the
/// offending slot is returned.
pub fn check_access(
    bus: &dyn EspiBus,
    offset: u32,
    len: usize,
    tag: u8,
    access: Access,
) -> Result<(), usize> {
    if len == 0 {
        return Ok(());
    }
    let last = offset.saturating_add(len as u32 - 1);
    for slot in 0..PROTECTION_REGIONS {
        let Ok(region) = read_region(bus, slot) else {
            continue;
        };
        if region.is_active() && region.overlaps(offset, last) && region.blocks(access, tag) {
            return Err(slot);
        }
    }
    Ok(())
}
