// Licensed under the Apache-2.0 license

//! Master-attached flash: the slave reads, writes and erases flash that sits
//! behind the eSPI master.
//!
//! Manual requests are sent one packet at a time through FLASHTXBUF and their
//! completions parsed from FLASHRXBUF. Reads never cross a 4 KiB sector, writes
//! never cross a page and each erase packet covers exactly one block.
//! Automatic reads let the hardware generate up to 256 read packets starting at
//! FLASHAUTOADDR.

use super::{channel_enabled, FlashCaps, MAX_AUTO_TRANSACTIONS};
use crate::config::{Errata, FlashConfig};
use crate::error::{EspiError, ProtocolError, Status};
use crate::hil::{DmaDirection, DmaRequestor, DmaStatus, EraseSize, FlashClient};
use crate::packet::{
    self, check_completion, Address, CommonHeader, Expected, FlashCycleType, Header, TagCounter,
    COMPLETION_HEADER_LEN, SECTOR_SIZE,
};
use crate::regs::{
    EspiBus, EspiSts, ErrMask, FlashCtl, RegisterAccess, Window, BUF_BYTES, ESPISTS,
    FLASHAUTOADDR, FLASHAUTODATA, FLASHAUTOLVL, FLASHCTL, FLASHERR,
};
use crate::request::{BufError, ChannelState, Direction, Issued, Mode, RequestDescriptor, Rule};
use crate::timing::MaskedInterrupts;
use crate::{ErrorWire, EspiHw};
use log::{debug, error, info, trace, warn};
use tock_registers::LocalRegisterCopy;

/// Size of the read that resynchronises the channel after a reset.
pub const DUMMY_READ_SIZE: usize = 16;

const FLASH_RX: u32 = 1 << 4;
const AUTO_STATUS: u32 = (1 << 5) | (1 << 6);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MafKind {
    ReadManual,
    ReadAuto,
    Write,
    Erase,
}

impl MafKind {
    pub const fn rule(self) -> Rule {
        match self {
            MafKind::ReadManual | MafKind::Write => Rule::MANUAL,
            MafKind::ReadAuto => Rule {
                dma_align: 4,
                ..Rule::MANUAL
            },
            MafKind::Erase => Rule {
                zero_size: false,
                min_size: SECTOR_SIZE,
                align: SECTOR_SIZE,
                dma_align: 1,
            },
        }
    }

    fn direction(self) -> Direction {
        match self {
            MafKind::ReadManual | MafKind::ReadAuto => Direction::Read,
            MafKind::Write => Direction::Write,
            MafKind::Erase => Direction::Erase,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MafRequest {
    pub kind: MafKind,
    /// Flash offset.
    pub offset: u32,
    pub size: usize,
    pub polling: bool,
    pub strip_header: bool,
    /// Automatic reads only.
    pub use_dma: bool,
}

impl MafRequest {
    fn new(kind: MafKind, offset: u32, size: usize) -> Self {
        MafRequest {
            kind,
            offset,
            size,
            polling: false,
            strip_header: true,
            use_dma: false,
        }
    }

    pub fn read(offset: u32, size: usize) -> Self {
        Self::new(MafKind::ReadManual, offset, size)
    }

    pub fn write(offset: u32, size: usize) -> Self {
        Self::new(MafKind::Write, offset, size)
    }

    /// Erases `size` bytes, a multiple of 4 KiB, using the largest blocks the
    /// channel supports.
    pub fn erase(offset: u32, size: usize) -> Self {
        Self::new(MafKind::Erase, offset, size)
    }

    pub fn auto(mut self) -> Self {
        if self.kind == MafKind::ReadManual {
            self.kind = MafKind::ReadAuto;
        }
        self
    }

    pub fn polling(mut self) -> Self {
        self.polling = true;
        self
    }

    pub fn keep_headers(mut self) -> Self {
        self.strip_header = false;
        self
    }

    pub fn with_dma(mut self) -> Self {
        self.use_dma = true;
        self
    }
}

pub struct Maf<'a> {
    hw: EspiHw<'a>,
    client: Option<&'a dyn FlashClient>,
    state: ChannelState,
    status: Status,
    error_wire: ErrorWire,
    caps: FlashCaps,
    errata: Errata,
    manual_tags: TagCounter,
    auto_tags: TagCounter,
    dummy_read_pending: bool,
}

impl<'a> Maf<'a> {
    pub fn new(hw: EspiHw<'a>) -> Self {
        Maf {
            hw,
            client: None,
            state: ChannelState::Idle,
            status: Status::Ok,
            error_wire: ErrorWire::default(),
            caps: FlashCaps::default(),
            errata: Errata::default(),
            manual_tags: TagCounter::new(16),
            auto_tags: TagCounter::new(2),
            dummy_read_pending: false,
        }
    }

    pub fn init(&mut self, config: &FlashConfig, errata: Errata) {
        self.caps = FlashCaps::read(&self.hw, config);
        self.errata = errata;
        self.manual_tags = TagCounter::new(self.caps.tag_modulus);
        debug!("[espi-maf] {:?}", self.caps);
    }

    pub fn set_client(&mut self, client: &'a dyn FlashClient) {
        self.client = Some(client);
    }

    pub fn get_status(&self) -> Status {
        self.state.status(self.status)
    }

    /// Whether this channel currently holds the non-fatal error wire.
    pub fn error_wire_asserted(&self) -> bool {
        self.error_wire.is_asserted()
    }

    pub fn caps(&self) -> &FlashCaps {
        &self.caps
    }

    pub fn current_tag(&self) -> u8 {
        self.manual_tags.current()
    }

    pub fn dummy_read_pending(&self) -> bool {
        self.dummy_read_pending
    }

    pub fn send_req(&mut self, req: MafRequest, buf: &'static mut [u8]) -> Result<Issued, BufError> {
        if let Err(err) = self.validate(&req, buf) {
            warn!("[espi-maf] rejected {:?}: {}", req.kind, err);
            return Err((err, buf));
        }
        if !self.state.is_idle() || self.hw.bus.is_set(FLASHCTL, FlashCtl::TxAvail) {
            return Err((EspiError::Busy, buf));
        }
        if !channel_enabled(&self.hw) {
            return Err((EspiError::ChannelDisabled, buf));
        }
        if self.dummy_read_pending {
            self.dummy_read();
        }
        self.error_wire.release(&self.hw);
        trace!(
            "[espi-maf] {:?} offset {:#x} size {}",
            req.kind,
            req.offset,
            req.size
        );
        match req.kind {
            MafKind::ReadAuto => self.start_auto(req, buf),
            _ => self.start_manual(req, buf),
        }
    }

    fn validate(&self, req: &MafRequest, buf: &[u8]) -> Result<(), EspiError> {
        if req.use_dma && req.kind != MafKind::ReadAuto {
            return Err(EspiError::InvalidType);
        }
        let dma_addr = req.use_dma.then_some(buf.as_ptr() as usize);
        req.kind.rule().check(req.offset as u64, req.size, dma_addr)?;
        if req.kind == MafKind::ReadAuto {
            let count = req.size / self.caps.max_payload;
            if req.size % self.caps.max_payload != 0 || count > MAX_AUTO_TRANSACTIONS {
                return Err(EspiError::InvalidSize);
            }
            let align = if self.errata.auto_read_pow2_alignment {
                req.size.next_power_of_two()
            } else {
                req.size
            };
            if req.offset as usize % align != 0 {
                return Err(EspiError::Unaligned);
            }
        }
        if req.kind == MafKind::Erase {
            if self.caps.erase_sizes.0 == 0 {
                return Err(EspiError::InvalidType);
            }
            self.check_erase_range(req.offset as u64, req.size)?;
        }
        if buf.len() < self.buffer_len(req.kind, req.offset, req.size, req.strip_header) {
            return Err(EspiError::BufferTooSmall);
        }
        Ok(())
    }

    fn buffer_len(&self, kind: MafKind, offset: u32, size: usize, strip: bool) -> usize {
        match kind {
            MafKind::Erase => 0,
            MafKind::Write => size,
            _ if strip => size,
            MafKind::ReadAuto => {
                size + (size / self.caps.max_payload) * COMPLETION_HEADER_LEN
            }
            MafKind::ReadManual => {
                let mut packets = 0;
                let mut pos = offset as u64;
                let mut left = size;
                while left > 0 {
                    let chunk = packet::chunk_len(pos, left, SECTOR_SIZE, self.caps.max_payload);
                    pos += chunk as u64;
                    left -= chunk;
                    packets += 1;
                }
                size + packets * COMPLETION_HEADER_LEN
            }
        }
    }

    /// Largest supported erase block that starts at `offset` and fits in
    /// `remaining`.
    fn erase_block(&self, offset: u64, remaining: usize) -> Option<EraseSize> {
        [EraseSize::Block64K, EraseSize::Block32K, EraseSize::Sector4K]
            .into_iter()
            .find(|size| {
                let bytes = size.bytes() as u64;
                self.caps.erase_sizes.contains(*size)
                    && offset % bytes == 0
                    && remaining as u64 >= bytes
            })
    }

    /// Walks the range block by block the way `send_chunk` will, so a range
    /// the supported blocks cannot tile is refused before anything is erased.
    fn check_erase_range(&self, offset: u64, size: usize) -> Result<(), EspiError> {
        let mut pos = offset;
        let mut left = size;
        while left > 0 {
            let block = self
                .erase_block(pos, left)
                .ok_or(EspiError::Unaligned)?
                .bytes() as usize;
            pos += block as u64;
            left -= block;
        }
        Ok(())
    }

    fn start_manual(&mut self, req: MafRequest, buf: &'static mut [u8]) -> Result<Issued, BufError> {
        let mut desc = RequestDescriptor::new(
            req.kind.direction(),
            Mode::Manual,
            req.offset as u64,
            req.size,
            buf,
        );
        desc.strip_header = req.strip_header;
        desc.polling = req.polling;

        if req.polling {
            return self.run_manual_polling(desc);
        }
        if let Err(err) = self.send_chunk(&mut desc) {
            return Err((err, desc.buf));
        }
        self.state = ChannelState::InFlight(desc);
        Ok(Issued::Pending)
    }

    fn queue_packet(&self, header: &Header, payload: &[u8]) {
        let mut pkt = [0u8; BUF_BYTES];
        let len = header.encode(&mut pkt).unwrap_or(0);
        pkt[len..len + payload.len()].copy_from_slice(payload);
        let bus = self.hw.bus;
        bus.write_window(Window::FlashTx, &pkt[..len + payload.len()]);
        bus.modify(FLASHCTL, FlashCtl::TxAvail::SET);
    }

    fn send_chunk(&mut self, desc: &mut RequestDescriptor) -> Result<(), EspiError> {
        let offset = desc.current_offset();
        let (cycle, chunk, length) = match desc.direction {
            Direction::Write => {
                let chunk = packet::chunk_len(
                    offset,
                    desc.remaining(),
                    self.caps.page_size,
                    self.caps.max_payload,
                );
                (FlashCycleType::Write, chunk, chunk)
            }
            Direction::Erase => {
                let block = self
                    .erase_block(offset, desc.remaining())
                    .ok_or(EspiError::Unaligned)?;
                let code = match block {
                    EraseSize::Sector4K => 1,
                    EraseSize::Block32K => 2,
                    EraseSize::Block64K => 3,
                };
                (FlashCycleType::Erase, block.bytes() as usize, code)
            }
            _ => {
                let chunk = packet::chunk_len(
                    offset,
                    desc.remaining(),
                    SECTOR_SIZE,
                    self.caps.max_payload,
                );
                (FlashCycleType::Read, chunk, chunk)
            }
        };

        let header = Header {
            cycle_type: cycle.into(),
            tag: self.manual_tags.current(),
            length,
            address: Address::Addr32(offset as u32),
        };
        let payload: &[u8] = if desc.direction == Direction::Write {
            &desc.buf[desc.transferred..desc.transferred + chunk]
        } else {
            &[]
        };
        self.queue_packet(&header, payload);
        desc.tag = header.tag;
        desc.chunk = chunk;
        self.manual_tags.advance();
        trace!(
            "[espi-maf] queued {:?} tag {} chunk {} at {:#x}",
            cycle,
            header.tag,
            chunk,
            offset
        );
        Ok(())
    }

    /// Parses the completion for the packet on the wire.
    fn take_completion(&self, desc: &mut RequestDescriptor) -> Result<(), EspiError> {
        let with_data = desc.direction == Direction::Read;
        let expected_len = if with_data { desc.chunk } else { 0 };
        let mut pkt = [0u8; BUF_BYTES];
        let len = COMPLETION_HEADER_LEN + expected_len;
        self.hw.bus.read_window(Window::FlashRx, &mut pkt[..len]);
        let header = CommonHeader::decode(&pkt)?;
        check_completion(
            &header,
            Expected {
                tag: Some(desc.tag),
                length: expected_len,
                with_data,
            },
        )?;
        if with_data {
            let pos = desc.buf_pos;
            let stored = if desc.strip_header {
                desc.buf[pos..pos + desc.chunk]
                    .copy_from_slice(&pkt[COMPLETION_HEADER_LEN..len]);
                desc.chunk
            } else {
                desc.buf[pos..pos + len].copy_from_slice(&pkt[..len]);
                len
            };
            desc.buf_pos += stored;
        }
        desc.transferred += desc.chunk;
        Ok(())
    }

    fn run_manual_polling(&mut self, mut desc: RequestDescriptor) -> Result<Issued, BufError> {
        let hw = self.hw;
        let _masked = MaskedInterrupts::new(hw.bus, FLASH_RX);
        loop {
            let step = self.send_chunk(&mut desc).and_then(|_| {
                hw.wait(|| hw.bus.is_set(ESPISTS, EspiSts::FlashRx))
            });
            hw.bus.clear_status(ESPISTS, hw.bus.get_raw(ESPISTS) & FLASH_RX);
            if let Err(err) = step.and_then(|_| self.take_completion(&mut desc)) {
                error!("[espi-maf] polling request failed: {}", err);
                self.reset_channel(desc.dma.take());
                self.status = Status::Failed;
                return Err((err, desc.buf));
            }
            if desc.is_done() {
                break;
            }
        }
        self.status = Status::Ok;
        Ok(Issued::Complete(desc.buf))
    }

    fn start_auto(&mut self, req: MafRequest, buf: &'static mut [u8]) -> Result<Issued, BufError> {
        let bus = self.hw.bus;
        let count = req.size / self.caps.max_payload;
        let mut desc =
            RequestDescriptor::new(Direction::Read, Mode::Auto, req.offset as u64, req.size, buf);
        desc.strip_header = req.strip_header;
        desc.polling = req.polling;
        desc.transactions = count;
        desc.tag = self.auto_tags.current();

        let header = Header {
            cycle_type: FlashCycleType::Read.into(),
            tag: desc.tag,
            length: self.caps.max_payload,
            address: Address::Addr32(req.offset),
        };
        let mut pkt = [0u8; BUF_BYTES];
        let len = header.encode(&mut pkt).unwrap_or(0);
        bus.write_window(Window::FlashTx, &pkt[..len]);
        bus.set_raw(FLASHAUTOADDR, req.offset);

        if req.use_dma {
            let len = self.buffer_len(req.kind, req.offset, req.size, req.strip_header);
            let addr = desc.buf.as_ptr() as usize;
            match self
                .hw
                .attach_dma(DmaRequestor::Flash, DmaDirection::ToMemory, addr, len)
            {
                Ok(channel) => desc.dma = Some(channel),
                Err(err) => return Err((err, desc.buf)),
            }
        }

        let strip = if req.strip_header {
            FlashCtl::Strip::SET
        } else {
            FlashCtl::Strip::CLEAR
        };
        let dma_en = if req.use_dma {
            FlashCtl::DmaEn::SET
        } else {
            FlashCtl::DmaEn::CLEAR
        };
        bus.modify(
            FLASHCTL,
            strip + dma_en + FlashCtl::AutoCnt.val(count as u32 - 1) + FlashCtl::AutoEn::SET,
        );
        self.auto_tags.advance_by(count);
        debug!(
            "[espi-maf] automatic read of {} packets at {:#x}",
            count, req.offset
        );

        if req.polling {
            return self.run_auto_polling(desc);
        }
        self.state = ChannelState::InFlight(desc);
        Ok(Issued::Pending)
    }

    fn run_auto_polling(&mut self, mut desc: RequestDescriptor) -> Result<Issued, BufError> {
        let hw = self.hw;
        let _masked = MaskedInterrupts::new(hw.bus, AUTO_STATUS);
        let drain = desc.dma.is_none();
        let waited = hw.wait(|| {
            if drain {
                drain_fifo(hw.bus, &mut desc, false);
            }
            let sts = hw.bus.get(ESPISTS);
            sts.is_set(EspiSts::AmDone) || sts.is_set(EspiSts::AmErr)
        });
        if let Err(err) = waited {
            error!("[espi-maf] automatic read timed out");
            self.reset_channel(desc.dma.take());
            self.status = Status::Failed;
            return Err((err, desc.buf));
        }
        let sts = hw.bus.get_raw(ESPISTS);
        self.finish_auto(desc, sts).map(Issued::Complete)
    }

    fn finish_auto(
        &mut self,
        mut desc: RequestDescriptor,
        sts: u32,
    ) -> Result<&'static mut [u8], BufError> {
        let bus = self.hw.bus;
        let sts = LocalRegisterCopy::<u32, EspiSts::Register>::new(sts);
        if sts.is_set(EspiSts::AmErr) {
            let mask = bus.get_raw(FLASHERR);
            bus.clear_status(FLASHERR, mask);
            let errs = LocalRegisterCopy::<u32, ErrMask::Register>::new(mask);
            if !errs.is_set(ErrMask::UnsucCpl) && !errs.is_set(ErrMask::ProtErr) {
                self.error_wire.raise(&self.hw);
            }
            error!("[espi-maf] automatic read error {:#x}", mask);
            self.reset_channel(desc.dma.take());
            self.status = Status::Failed;
            return Err((EspiError::AutoModeError { mask }, desc.buf));
        }

        let expected = if desc.strip_header {
            desc.size
        } else {
            desc.size + desc.transactions * COMPLETION_HEADER_LEN
        };
        let mut result = Ok(());
        match desc.dma.take() {
            Some(channel) => {
                if let Some(dma) = self.hw.dma {
                    if dma.status(channel) == DmaStatus::Error {
                        result = Err(EspiError::Dma(crate::hil::DmaError::TransferFailed));
                    }
                }
                self.hw.release_dma(Some(channel));
                desc.buf_pos = expected;
            }
            None => {
                drain_fifo(bus, &mut desc, true);
                if desc.buf_pos != expected {
                    result = Err(ProtocolError::LengthMismatch {
                        expected,
                        got: desc.buf_pos,
                    }
                    .into());
                }
            }
        }

        bus.modify(FLASHCTL, FlashCtl::AutoEn::CLEAR + FlashCtl::DmaEn::CLEAR);
        bus.clear_status(ESPISTS, bus.get_raw(ESPISTS) & (AUTO_STATUS | FLASH_RX));

        match result {
            Ok(()) => {
                desc.transferred = desc.size;
                self.status = Status::Ok;
                Ok(desc.buf)
            }
            Err(err) => {
                error!("[espi-maf] automatic read failed: {}", err);
                self.reset_channel(None);
                self.status = Status::Failed;
                Err((err, desc.buf))
            }
        }
    }

    /// Issues a 16 byte manual read and throws the result away. Clears the
    /// pending flag whatever the outcome.
    fn dummy_read(&mut self) {
        self.dummy_read_pending = false;
        let hw = self.hw;
        let _masked = MaskedInterrupts::new(hw.bus, FLASH_RX);
        let tag = self.manual_tags.current();
        let header = Header {
            cycle_type: FlashCycleType::Read.into(),
            tag,
            length: DUMMY_READ_SIZE,
            address: Address::Addr32(0),
        };
        self.queue_packet(&header, &[]);
        self.manual_tags.advance();
        let waited = hw.wait(|| hw.bus.is_set(ESPISTS, EspiSts::FlashRx));
        hw.bus.clear_status(ESPISTS, hw.bus.get_raw(ESPISTS) & FLASH_RX);
        match waited {
            Ok(()) => info!("[espi-maf] post-reset dummy read done"),
            Err(err) => {
                warn!("[espi-maf] post-reset dummy read: {}", err);
                self.reset_channel(None);
            }
        }
    }

    /// FLASHRX: a completion for a manual request arrived.
    pub fn handle_rx(&mut self) {
        let Some(mut desc) = self.state.take() else {
            warn!("[espi-maf] completion with no request");
            return;
        };
        if desc.mode != Mode::Manual {
            self.state = ChannelState::InFlight(desc);
            return;
        }
        let step = self.take_completion(&mut desc);
        match step {
            Err(err) => self.fail(desc, err),
            Ok(()) if desc.is_done() => {
                self.status = Status::Ok;
                if let Some(client) = self.client {
                    client.request_done(desc.buf, Ok(desc.size));
                }
            }
            Ok(()) => match self.send_chunk(&mut desc) {
                Ok(()) => self.state = ChannelState::InFlight(desc),
                Err(err) => self.fail(desc, err),
            },
        }
    }

    /// AMDONE / AMERR.
    pub fn handle_auto(&mut self, sts: u32) {
        let Some(desc) = self.state.take() else {
            warn!("[espi-maf] automatic event with no request");
            return;
        };
        if desc.mode != Mode::Auto {
            self.state = ChannelState::InFlight(desc);
            return;
        }
        let size = desc.size;
        let client = self.client;
        let (buf, result) = match self.finish_auto(desc, sts) {
            Ok(buf) => (buf, Ok(size)),
            Err((err, buf)) => (buf, Err(err)),
        };
        if let Some(client) = client {
            client.request_done(buf, result);
        }
    }

    fn fail(&mut self, mut desc: RequestDescriptor, err: EspiError) {
        error!("[espi-maf] request failed: {}", err);
        self.reset_channel(desc.dma.take());
        self.status = Status::Failed;
        if let Some(client) = self.client {
            client.request_done(desc.buf, Err(err));
        }
    }

    fn reset_channel(&mut self, dma: Option<crate::hil::DmaChannel>) {
        let bus = self.hw.bus;
        bus.modify(
            FLASHCTL,
            FlashCtl::AutoEn::CLEAR + FlashCtl::DmaEn::CLEAR + FlashCtl::BufRst::SET,
        );
        bus.clear_status(ESPISTS, bus.get_raw(ESPISTS) & (AUTO_STATUS | FLASH_RX));
        self.hw.release_dma(dma);
    }

    /// Drops any live request and resets the channel. Idempotent.
    pub fn abort(&mut self) -> Option<&'static mut [u8]> {
        match self.state.take() {
            Some(mut desc) => {
                warn!("[espi-maf] aborting request at {:#x}", desc.offset);
                self.reset_channel(desc.dma.take());
                self.status = Status::Failed;
                Some(desc.buf)
            }
            None => {
                self.reset_channel(None);
                None
            }
        }
    }

    /// Abort on reset. A reset that catches an automatic read arms the dummy
    /// read when the erratum applies.
    pub fn handle_reset(&mut self) {
        let in_auto = matches!(&self.state, ChannelState::InFlight(desc) if desc.mode == Mode::Auto);
        if in_auto && self.errata.dummy_read_after_reset {
            info!("[espi-maf] reset during automatic read, dummy read armed");
            self.dummy_read_pending = true;
        }
        if let Some(buf) = self.abort() {
            if let Some(client) = self.client {
                client.request_done(buf, Err(EspiError::Aborted));
            }
        }
        self.error_wire.release(&self.hw);
    }
}

fn drain_fifo(bus: &dyn EspiBus, desc: &mut RequestDescriptor, all: bool) {
    let expected = if desc.strip_header {
        desc.size
    } else {
        desc.size + desc.transactions * COMPLETION_HEADER_LEN
    };
    loop {
        let level = bus.get_raw(FLASHAUTOLVL) as usize;
        if level == 0 || (level < 4 && !all) || desc.buf_pos >= expected {
            break;
        }
        let word = bus.get_raw(FLASHAUTODATA).to_le_bytes();
        let take = level.min(4).min(expected - desc.buf_pos);
        let pos = desc.buf_pos;
        desc.buf[pos..pos + take].copy_from_slice(&word[..take]);
        desc.buf_pos += take;
    }
}
