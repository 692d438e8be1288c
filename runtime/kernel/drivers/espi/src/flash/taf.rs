// Licensed under the Apache-2.0 license

//! Target-attached flash: the host reads, writes and erases flash that sits
//! behind the slave.
//!
//! Every request the host queues in FLASHRXBUF goes through [`Taf::handle_req`],
//! which parses it, checks its size class and the protection regions and runs
//! writes and erases on the [`FlashDevice`]. [`Taf::send_res`] then answers it,
//! one completion packet per call. Reads are answered in max-payload segments
//! straight from the device.

use super::protection::{self, Access, ProtectionRegion};
use super::{channel_enabled, FlashCaps};
use crate::config::{FlashConfig, FlashMode};
use crate::error::{EspiError, Status, TafStatus};
use crate::hil::{EraseSize, EraseSizes, FlashDevice, TafClient};
use crate::packet::{
    chunk_len, Address, AddressKind, CommonHeader, CompletionCode, FlashCycleType, Header,
    COMPLETION_HEADER_LEN,
};
use crate::regs::{
    EspiSts, FlashAccCtl, FlashCfg, FlashCtl, RegisterAccess, Window, BUF_BYTES, ESPISTS,
    FLASHACCCTL, FLASHBASE, FLASHCFG, FLASHCTL,
};
use crate::timing::MaskedInterrupts;
use crate::{ErrorWire, EspiHw};
use log::{debug, error, info, trace, warn};

const FLASH_RX: u32 = 1 << 4;
const MAX_WRITE: usize = super::FLASH_MAX_PAYLOAD;

/// A host request, from parse to the last completion packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TafRequest {
    /// Cycle type byte as received.
    pub cycle: u8,
    /// `None` for cycle types the channel does not know.
    pub kind: Option<FlashCycleType>,
    pub tag: u8,
    /// Flash offset: host offset plus FLASHBASE.
    pub offset: u32,
    /// Bytes to read or write, or the erase block size.
    pub size: usize,
    /// Read bytes still to be returned.
    pub remaining: usize,
    /// Read bytes already returned.
    pub sent: usize,
    pub status: TafStatus,
    data: [u8; MAX_WRITE],
    data_len: usize,
}

impl TafRequest {
    fn new(header: &Header, offset: u32) -> Self {
        TafRequest {
            cycle: header.cycle_type,
            kind: FlashCycleType::try_from(header.cycle_type).ok(),
            tag: header.tag,
            offset,
            size: header.length,
            remaining: 0,
            sent: 0,
            status: TafStatus::Ok,
            data: [0; MAX_WRITE],
            data_len: 0,
        }
    }

    /// Write or RPMC payload carried by the request.
    pub fn payload(&self) -> &[u8] {
        &self.data[..self.data_len]
    }

    fn is_read(&self) -> bool {
        self.kind == Some(FlashCycleType::Read)
    }
}

/// Erase length field of a flash request.
fn erase_size(code: usize) -> Option<EraseSize> {
    match code {
        1 => Some(EraseSize::Sector4K),
        2 => Some(EraseSize::Block32K),
        3 => Some(EraseSize::Block64K),
        _ => None,
    }
}

pub struct Taf<'a> {
    hw: EspiHw<'a>,
    device: Option<&'a dyn FlashDevice>,
    client: Option<&'a dyn TafClient>,
    caps: FlashCaps,
    base: u32,
    pending: Option<TafRequest>,
    status: Status,
    error_wire: ErrorWire,
}

impl<'a> Taf<'a> {
    pub fn new(hw: EspiHw<'a>) -> Self {
        Taf {
            hw,
            device: None,
            client: None,
            caps: FlashCaps::default(),
            base: 0,
            pending: None,
            status: Status::Ok,
            error_wire: ErrorWire::default(),
        }
    }

    pub fn set_device(&mut self, device: &'a dyn FlashDevice) {
        self.device = Some(device);
    }

    pub fn set_client(&mut self, client: &'a dyn TafClient) {
        self.client = Some(client);
    }

    pub fn caps(&self) -> &FlashCaps {
        &self.caps
    }

    /// Switches the flash channel to target-attached mode, programs the base
    /// address and lets the host send its first request.
    pub fn config(&mut self, config: &FlashConfig) -> Result<(), EspiError> {
        if config.mode != FlashMode::Taf {
            return Err(EspiError::InvalidType);
        }
        let bus = self.hw.bus;
        bus.set_raw(FLASHBASE, config.base_address);
        bus.modify(FLASHCFG, FlashCfg::TafMode::SET);
        self.caps = FlashCaps::read(&self.hw, config);
        if let Some(device) = self.device {
            self.caps.page_size = device.page_size();
        }
        self.base = config.base_address;
        self.pending = None;
        self.status = Status::Ok;
        bus.modify(FLASHCTL, FlashCtl::NpFree::SET);
        info!(
            "[espi-taf] base {:#x} max payload {} max read {}",
            self.base, self.caps.max_payload, self.caps.max_read_request
        );
        Ok(())
    }

    pub fn set_rw_protect(&self, slot: usize, region: &ProtectionRegion) -> Result<(), EspiError> {
        protection::set_rw_protect(self.hw.bus, slot, region)
    }

    pub fn clear_rw_protect(&self, slot: usize) -> Result<(), EspiError> {
        protection::clear_rw_protect(self.hw.bus, slot)
    }

    pub fn lock_region(&self, slot: usize) -> Result<(), EspiError> {
        protection::lock_region(self.hw.bus, slot)
    }

    pub fn get_status(&self) -> Status {
        if self.pending.is_some() {
            Status::Busy
        } else {
            self.status
        }
    }

    /// Whether a refused request left the non-fatal error wire asserted.
    pub fn error_wire_asserted(&self) -> bool {
        self.error_wire.is_asserted()
    }

    pub fn is_pending_res(&self) -> bool {
        self.pending.is_some()
    }

    pub fn pending(&self) -> Option<&TafRequest> {
        self.pending.as_ref()
    }

    /// Stops the host from queueing new flash requests. Fails with `Busy`,
    /// leaving everything as it was, if a request or response is in the way.
    pub fn prevent_host_access(&mut self) -> Result<(), EspiError> {
        let hw = self.hw;
        let bus = hw.bus;
        let _masked = MaskedInterrupts::new(bus, FLASH_RX);

        let quiet = |taf: &Self| {
            let acc = bus.get(FLASHACCCTL);
            taf.pending.is_none()
                && !acc.is_set(FlashAccCtl::ResPend)
                && !acc.is_set(FlashAccCtl::AutoRdPend)
                && !bus.is_set(ESPISTS, EspiSts::FlashRx)
        };
        if !quiet(self) {
            debug!("[espi-taf] host access still in use");
            return Err(EspiError::Busy);
        }

        bus.modify(FLASHACCCTL, FlashAccCtl::AutoRdDisCtl::SET);
        let took = hw.wait(|| bus.is_set(FLASHACCCTL, FlashAccCtl::AutoRdDisSts));
        if took.is_err() || !quiet(self) {
            warn!("[espi-taf] could not quiesce host access");
            bus.modify(FLASHACCCTL, FlashAccCtl::AutoRdDisCtl::CLEAR);
            return Err(EspiError::Busy);
        }
        bus.modify(FLASHACCCTL, FlashAccCtl::BlockNpFree::SET);
        info!("[espi-taf] host access blocked");
        Ok(())
    }

    pub fn reenable_host_access(&mut self) {
        self.hw.bus.modify(
            FLASHACCCTL,
            FlashAccCtl::BlockNpFree::CLEAR + FlashAccCtl::AutoRdDisCtl::CLEAR,
        );
        info!("[espi-taf] host access restored");
    }

    /// Parses the request in FLASHRXBUF, checks it and performs writes and
    /// erases. The request stays pending until [`Taf::send_res`] has answered
    /// it in full.
    pub fn handle_req(&mut self) -> Result<TafStatus, EspiError> {
        if self.pending.is_some() {
            warn!("[espi-taf] request while a response is pending");
            return Err(EspiError::Busy);
        }
        if !channel_enabled(&self.hw) {
            return Err(EspiError::ChannelDisabled);
        }
        let mut pkt = [0u8; BUF_BYTES];
        let bus = self.hw.bus;
        bus.read_window(Window::FlashRx, &mut pkt);
        bus.clear_status(ESPISTS, bus.get_raw(ESPISTS) & FLASH_RX);
        let header = Header::decode(&pkt, AddressKind::Addr32)?;
        let host_offset = match header.address {
            Address::Addr32(addr) => addr,
            _ => 0,
        };
        let rebased = host_offset.checked_add(self.base);
        let mut req = TafRequest::new(&header, rebased.unwrap_or(host_offset));
        trace!(
            "[espi-taf] request {:#04x} tag {} len {} at {:#x}",
            req.cycle,
            req.tag,
            req.size,
            req.offset
        );

        self.error_wire.release(&self.hw);
        req.status = match rebased {
            Some(_) => self.check(&mut req, &pkt[header.len()..]),
            None => {
                warn!(
                    "[espi-taf] host offset {:#x} overflows base {:#x}",
                    host_offset, self.base
                );
                self.deny()
            }
        };
        if req.status.is_ok() {
            req.status = self.perform(&req);
        }
        if req.status.is_ok() && req.is_read() {
            req.remaining = req.size;
        }
        if !req.status.is_ok() {
            warn!(
                "[espi-taf] request {:#04x} at {:#x} refused: {:?}",
                req.cycle, req.offset, req.status
            );
        }

        let status = req.status;
        self.status = if status.is_ok() {
            Status::Ok
        } else {
            Status::Failed
        };
        if let Some(client) = self.client {
            client.request_handled(&req, status);
        }
        self.pending = Some(req);
        Ok(status)
    }

    /// Parse, size class and access checks.
    fn check(&mut self, req: &mut TafRequest, payload: &[u8]) -> TafStatus {
        let Some(kind) = req.kind else {
            return TafStatus::InvalidType;
        };
        let Some(device) = self.device else {
            error!("[espi-taf] no flash device");
            return TafStatus::Failed;
        };

        let access = match kind {
            FlashCycleType::Read => {
                if req.size == 0 || req.size > self.caps.max_read_request {
                    return TafStatus::InvalidDataSize;
                }
                Some(Access::Read)
            }
            FlashCycleType::Write | FlashCycleType::RpmcOp1 | FlashCycleType::RpmcOp2 => {
                let is_write = kind == FlashCycleType::Write;
                if (is_write && req.size == 0)
                    || req.size > self.caps.max_payload
                    || req.size > payload.len()
                {
                    return TafStatus::InvalidDataSize;
                }
                req.data[..req.size].copy_from_slice(&payload[..req.size]);
                req.data_len = req.size;
                is_write.then_some(Access::Write)
            }
            FlashCycleType::Erase => {
                let supported: EraseSizes = self.caps.erase_sizes.intersect(device.erase_sizes());
                match erase_size(req.size) {
                    Some(size) if supported.contains(size) => {
                        req.size = size.bytes() as usize;
                        req.offset &= !(size.bytes() - 1);
                    }
                    _ => return TafStatus::InvalidDataSize,
                }
                Some(Access::Write)
            }
        };

        let Some(access) = access else {
            return TafStatus::Ok;
        };
        if req.offset as u64 + req.size as u64 > device.capacity() as u64 {
            return self.deny();
        }
        if let Err(slot) =
            protection::check_access(self.hw.bus, req.offset, req.size, req.tag, access)
        {
            warn!(
                "[espi-taf] tag {} {:?} at {:#x} blocked by region {}",
                req.tag, access, req.offset, slot
            );
            return self.deny();
        }
        TafStatus::Ok
    }

    /// Refuses the request without touching the device and tells the host
    /// through the non-fatal error wire.
    fn deny(&mut self) -> TafStatus {
        self.error_wire.raise(&self.hw);
        TafStatus::AccessDenied
    }

    fn wait_device(&self, device: &dyn FlashDevice) -> Result<(), EspiError> {
        self.hw.wait(|| !device.is_busy())
    }

    /// Runs writes and erases on the device. Reads run as they are answered;
    /// RPMC operations are acknowledged without touching the device.
    fn perform(&self, req: &TafRequest) -> TafStatus {
        let Some(device) = self.device else {
            return TafStatus::Failed;
        };
        let result = match req.kind {
            Some(FlashCycleType::Write) => self.write(device, req),
            Some(FlashCycleType::Erase) => {
                let size = match req.size {
                    0x1000 => EraseSize::Sector4K,
                    0x8000 => EraseSize::Block32K,
                    _ => EraseSize::Block64K,
                };
                self.wait_device(device)
                    .and_then(|_| device.erase(req.offset, size))
            }
            Some(FlashCycleType::RpmcOp1) | Some(FlashCycleType::RpmcOp2) => {
                debug!("[espi-taf] rpmc op {:#04x} acknowledged", req.cycle);
                Ok(())
            }
            _ => Ok(()),
        };
        match result {
            Ok(()) => TafStatus::Ok,
            Err(err) => {
                error!("[espi-taf] device operation failed: {}", err);
                TafStatus::Failed
            }
        }
    }

    fn write(&self, device: &dyn FlashDevice, req: &TafRequest) -> Result<(), EspiError> {
        let data = req.payload();
        let mut done = 0;
        while done < data.len() {
            let offset = req.offset + done as u32;
            let chunk = chunk_len(
                offset as u64,
                data.len() - done,
                self.caps.page_size,
                data.len(),
            );
            self.wait_device(device)?;
            device.write_page(offset, &data[done..done + chunk])?;
            done += chunk;
        }
        Ok(())
    }

    /// Queues the next completion packet of the pending request. Returns
    /// `false` when there was nothing to answer.
    pub fn send_res(&mut self) -> Result<bool, EspiError> {
        let Some(mut req) = self.pending.take() else {
            debug!("[espi-taf] no response pending");
            return Ok(false);
        };
        let hw = self.hw;
        if let Err(err) = hw.wait(|| !hw.bus.is_set(FLASHCTL, FlashCtl::TxAvail)) {
            error!("[espi-taf] transmit queue stuck");
            self.pending = Some(req);
            return Err(err);
        }

        let mut pkt = [0u8; BUF_BYTES];
        let len = if req.is_read() && req.status.is_ok() {
            self.read_segment(&mut req, &mut pkt)?
        } else {
            let code = if req.status.is_ok() {
                CompletionCode::SuccessNoData
            } else {
                CompletionCode::Unsuccessful
            };
            CommonHeader::new(code.into(), req.tag, 0).encode(&mut pkt)?;
            req.remaining = 0;
            COMPLETION_HEADER_LEN
        };
        hw.bus.write_window(Window::FlashTx, &pkt[..len]);
        hw.bus.modify(FLASHCTL, FlashCtl::TxAvail::SET);

        if req.remaining > 0 {
            self.pending = Some(req);
        } else {
            hw.bus.modify(FLASHCTL, FlashCtl::NpFree::SET);
            trace!("[espi-taf] request tag {} answered", req.tag);
        }
        Ok(true)
    }

    /// Builds the next read segment into `pkt`, falling back to an
    /// unsuccessful completion when the device fails.
    fn read_segment(&mut self, req: &mut TafRequest, pkt: &mut [u8]) -> Result<usize, EspiError> {
        let max = self.caps.max_payload;
        let count = req.size.div_ceil(max);
        let index = req.sent / max;
        let chunk = req.remaining.min(max);
        let data = &mut pkt[COMPLETION_HEADER_LEN..COMPLETION_HEADER_LEN + chunk];
        let read = match self.device {
            Some(device) => self
                .wait_device(device)
                .and_then(|_| device.read(req.offset + req.sent as u32, data)),
            None => Err(EspiError::FlashDevice),
        };

        let code = match read {
            Ok(()) => CompletionCode::for_segment(index, count),
            Err(err) => {
                error!("[espi-taf] read at {:#x} failed: {}", req.offset, err);
                req.status = TafStatus::Failed;
                self.status = Status::Failed;
                req.remaining = 0;
                let header = CommonHeader::new(CompletionCode::Unsuccessful.into(), req.tag, 0);
                return header.encode(pkt);
            }
        };
        let header = CommonHeader::new(code.into(), req.tag, chunk);
        header.encode(pkt)?;
        req.sent += chunk;
        req.remaining -= chunk;
        Ok(COMPLETION_HEADER_LEN + chunk)
    }

    /// Answers the pending request in full.
    pub fn respond_all(&mut self) -> Result<(), EspiError> {
        while self.is_pending_res() {
            self.send_res()?;
        }
        Ok(())
    }

    /// Drops any pending response. The host starts over after a reset.
    pub fn handle_reset(&mut self) {
        if let Some(req) = self.pending.take() {
            warn!("[espi-taf] dropping response to tag {}", req.tag);
            self.status = Status::Failed;
        }
        self.error_wire.release(&self.hw);
        self.hw
            .bus
            .modify(FLASHCTL, FlashCtl::BufRst::SET + FlashCtl::NpFree::SET);
    }
}
