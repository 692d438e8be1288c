// Licensed under the Apache-2.0 license

//! Peripheral-channel bus mastering: reads, writes and LTR messages the slave
//! issues into host memory.
//!
//! Manual requests move one packet per step through PBMTXBUF/PBMRXBUF and
//! never cross a 4 KiB boundary. Automatic requests hand the hardware a first
//! header plus a transaction count and let it generate the rest, with data
//! flowing through BMAUTODATA or a DMA channel.

use crate::config::PcBmConfig;
use crate::error::{EspiError, Status};
use crate::hil::{Channel, DmaDirection, DmaRequestor, DmaStatus, PcBmClient};
use crate::packet::{
    self, check_completion, Address, CommonHeader, CycleType, Expected, Header, LtrMessage,
    TagCounter, COMPLETION_HEADER_LEN, SECTOR_SIZE,
};
use crate::regs::{
    BmCtl, EspiBus, EspiCfg, EspiSts, ErrMask, RegisterAccess, Window, BMAUTOADDR_HI,
    BMAUTOADDR_LO, BMAUTOCNT, BMAUTODATA, BMAUTOLVL, BMCFG, BMCTL, BMERR, BUF_BYTES, ESPICFG,
    ESPISTS,
};
use crate::request::{
    BufError, ChannelState, Direction, Issued, Mode, RequestDescriptor, Rule,
};
use crate::timing::MaskedInterrupts;
use crate::{ErrorWire, EspiHw};
use log::{debug, error, trace, warn};
use tock_registers::LocalRegisterCopy;

/// Largest payload that fits the transmit window next to a 64-bit header.
pub const PC_MAX_PAYLOAD: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PcBmKind {
    ReadManual,
    ReadAuto,
    WriteManual,
    WriteAuto,
    Message,
}

impl PcBmKind {
    /// Size and alignment rules, evaluated once before dispatch.
    pub const fn rule(self) -> Rule {
        match self {
            PcBmKind::ReadManual | PcBmKind::WriteManual => Rule::MANUAL,
            PcBmKind::ReadAuto => Rule {
                zero_size: false,
                min_size: 2 * PC_MAX_PAYLOAD,
                align: PC_MAX_PAYLOAD,
                dma_align: 4,
            },
            // Writes accept a single-transaction burst (64 bytes), below the
            // 128-byte read minimum. Such a burst always runs without DMA.
            PcBmKind::WriteAuto => Rule {
                zero_size: false,
                min_size: PC_MAX_PAYLOAD,
                align: PC_MAX_PAYLOAD,
                dma_align: 16,
            },
            PcBmKind::Message => Rule {
                zero_size: true,
                ..Rule::MANUAL
            },
        }
    }

    fn direction(self) -> Direction {
        match self {
            PcBmKind::ReadManual | PcBmKind::ReadAuto => Direction::Read,
            PcBmKind::WriteManual | PcBmKind::WriteAuto => Direction::Write,
            PcBmKind::Message => Direction::Message,
        }
    }

    fn mode(self) -> Mode {
        match self {
            PcBmKind::ReadAuto | PcBmKind::WriteAuto => Mode::Auto,
            _ => Mode::Manual,
        }
    }
}

/// A bus-master request as the caller describes it.
#[derive(Debug, Clone, Copy)]
pub struct PcBmRequest {
    pub kind: PcBmKind,
    /// Host memory address.
    pub offset: u64,
    pub size: usize,
    pub polling: bool,
    /// Reads only: drop completion headers instead of keeping each one in
    /// front of its payload.
    pub strip_header: bool,
    /// Automatic requests only.
    pub use_dma: bool,
    pub ltr: LtrMessage,
}

impl PcBmRequest {
    fn new(kind: PcBmKind, offset: u64, size: usize) -> Self {
        PcBmRequest {
            kind,
            offset,
            size,
            polling: false,
            strip_header: true,
            use_dma: false,
            ltr: LtrMessage::default(),
        }
    }

    pub fn read(offset: u64, size: usize) -> Self {
        Self::new(PcBmKind::ReadManual, offset, size)
    }

    pub fn write(offset: u64, size: usize) -> Self {
        Self::new(PcBmKind::WriteManual, offset, size)
    }

    pub fn ltr(ltr: LtrMessage) -> Self {
        PcBmRequest {
            ltr,
            ..Self::new(PcBmKind::Message, 0, 0)
        }
    }

    /// Switch to the automatic (burst) variant.
    pub fn auto(mut self) -> Self {
        self.kind = match self.kind {
            PcBmKind::ReadManual => PcBmKind::ReadAuto,
            PcBmKind::WriteManual => PcBmKind::WriteAuto,
            kind => kind,
        };
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

const BURST_STATUS: u32 = (1 << 14) | (1 << 15) | (1 << 16);
const MANUAL_STATUS: u32 = (1 << 18) | (1 << 19);

pub struct PcBm<'a> {
    hw: EspiHw<'a>,
    client: Option<&'a dyn PcBmClient>,
    state: ChannelState,
    status: Status,
    error_wire: ErrorWire,
    tags: TagCounter,
    max_payload: usize,
    max_transactions: u32,
    message: LtrMessage,
}

impl<'a> PcBm<'a> {
    pub fn new(hw: EspiHw<'a>) -> Self {
        PcBm {
            hw,
            client: None,
            state: ChannelState::Idle,
            status: Status::Ok,
            error_wire: ErrorWire::default(),
            tags: TagCounter::new(16),
            max_payload: PC_MAX_PAYLOAD,
            max_transactions: PcBmConfig::default().max_burst_transactions,
            message: LtrMessage::default(),
        }
    }

    /// Reads the negotiated payload size and burst ceiling, bounded by `config`.
    pub fn init(&mut self, config: &PcBmConfig) {
        let bus = self.hw.bus;
        let code = bus.read_field(ESPICFG, EspiCfg::PcMaxPayload);
        self.max_payload = packet::max_payload(code)
            .min(config.max_payload)
            .min(PC_MAX_PAYLOAD);
        let hw_max = bus.read_field(BMCFG, crate::regs::BmCfg::MaxTrans);
        self.max_transactions = match hw_max {
            0 => config.max_burst_transactions,
            n => n.min(config.max_burst_transactions),
        };
        debug!(
            "[espi-pcbm] max payload {} max burst {}",
            self.max_payload, self.max_transactions
        );
    }

    pub fn set_client(&mut self, client: &'a dyn PcBmClient) {
        self.client = Some(client);
    }

    pub fn get_status(&self) -> Status {
        self.state.status(self.status)
    }

    /// Whether this channel currently holds the non-fatal error wire.
    pub fn error_wire_asserted(&self) -> bool {
        self.error_wire.is_asserted()
    }

    pub fn current_tag(&self) -> u8 {
        self.tags.current()
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// Issues a request. Message requests take an empty buffer.
    ///
    /// Polling requests return [`Issued::Complete`] with the buffer once the
    /// whole transfer is done; interrupt requests return [`Issued::Pending`]
    /// and report through [`PcBmClient::request_done`].
    pub fn send_req(
        &mut self,
        req: PcBmRequest,
        buf: &'static mut [u8],
    ) -> Result<Issued, BufError> {
        if let Err(err) = self.validate(&req, buf) {
            warn!("[espi-pcbm] rejected {:?}: {}", req.kind, err);
            return Err((err, buf));
        }
        if !self.state.is_idle() || self.hw.bus.is_set(BMCTL, BmCtl::TxAvail) {
            return Err((EspiError::Busy, buf));
        }
        if !self.channel_enabled() {
            return Err((EspiError::ChannelDisabled, buf));
        }
        self.error_wire.release(&self.hw);
        trace!(
            "[espi-pcbm] {:?} offset {:#x} size {}",
            req.kind,
            req.offset,
            req.size
        );
        match req.kind.mode() {
            Mode::Manual => self.start_manual(req, buf),
            Mode::Auto => self.start_auto(req, buf),
        }
    }

    fn validate(&self, req: &PcBmRequest, buf: &[u8]) -> Result<(), EspiError> {
        let mode = req.kind.mode();
        if req.use_dma && mode == Mode::Manual {
            return Err(EspiError::InvalidType);
        }
        let dma_addr = req.use_dma.then_some(buf.as_ptr() as usize);
        req.kind.rule().check(req.offset, req.size, dma_addr)?;
        if mode == Mode::Auto {
            let count = req.size / self.max_payload;
            if req.size % self.max_payload != 0 || count as u32 > self.max_transactions {
                return Err(EspiError::InvalidSize);
            }
        }
        if buf.len() < self.buffer_len(req) {
            return Err(EspiError::BufferTooSmall);
        }
        Ok(())
    }

    /// Bytes the caller's buffer must hold, counting kept completion headers.
    fn buffer_len(&self, req: &PcBmRequest) -> usize {
        if req.kind.direction() != Direction::Read || req.strip_header {
            return req.size;
        }
        let packets = match req.kind.mode() {
            Mode::Auto => req.size / self.max_payload,
            Mode::Manual => {
                let mut packets = 0;
                let mut pos = req.offset;
                let mut left = req.size;
                while left > 0 {
                    let chunk = packet::chunk_len(pos, left, SECTOR_SIZE, self.max_payload);
                    pos += chunk as u64;
                    left -= chunk;
                    packets += 1;
                }
                packets
            }
        };
        req.size + packets * COMPLETION_HEADER_LEN
    }

    fn channel_enabled(&self) -> bool {
        let cfg = self.hw.bus.get(ESPICFG);
        cfg.is_set(EspiCfg::BmEn) && self.hw.vw.channel_ready(Channel::BusMaster)
    }

    fn start_manual(&mut self, req: PcBmRequest, buf: &'static mut [u8]) -> Result<Issued, BufError> {
        let mut desc = RequestDescriptor::new(
            req.kind.direction(),
            Mode::Manual,
            req.offset,
            req.size,
            buf,
        );
        desc.strip_header = req.strip_header;
        desc.polling = req.polling;
        self.message = req.ltr;

        if req.polling {
            return self.run_manual_polling(desc);
        }
        self.send_chunk(&mut desc);
        self.state = ChannelState::InFlight(desc);
        Ok(Issued::Pending)
    }

    /// Builds and queues the next sub-request of `desc`.
    fn send_chunk(&mut self, desc: &mut RequestDescriptor) {
        let offset = desc.current_offset();
        let wide = offset > u32::MAX as u64;
        let (cycle, chunk) = match desc.direction {
            Direction::Read => (
                if wide { CycleType::MemRead64 } else { CycleType::MemRead32 },
                packet::chunk_len(offset, desc.remaining(), SECTOR_SIZE, self.max_payload),
            ),
            Direction::Write | Direction::Erase => (
                if wide { CycleType::MemWrite64 } else { CycleType::MemWrite32 },
                packet::chunk_len(offset, desc.remaining(), SECTOR_SIZE, self.max_payload),
            ),
            Direction::Message => (CycleType::Message, 0),
        };

        let mut header = Header {
            cycle_type: cycle.into(),
            tag: self.tags.current(),
            length: chunk,
            address: if wide {
                Address::Addr64(offset)
            } else {
                Address::Addr32(offset as u32)
            },
        };
        if desc.direction == Direction::Message {
            packet::set_ltr_msg_hdr(&mut header, self.message);
        }

        let mut pkt = [0u8; BUF_BYTES];
        // Chunk and header sizes are bounded so that this always fits.
        let len = header.encode(&mut pkt).unwrap_or(0);
        if desc.direction == Direction::Write {
            let start = desc.transferred;
            pkt[len..len + chunk].copy_from_slice(&desc.buf[start..start + chunk]);
        }
        let total = if desc.direction == Direction::Write {
            len + chunk
        } else {
            len
        };

        desc.tag = header.tag;
        desc.chunk = chunk;
        self.tags.advance();

        let bus = self.hw.bus;
        bus.write_window(Window::PbmTx, &pkt[..total]);
        bus.modify(BMCTL, BmCtl::TxAvail::SET);
        trace!(
            "[espi-pcbm] queued tag {} chunk {} at {:#x}",
            header.tag,
            chunk,
            offset
        );
    }

    /// Consumes the completion for the read chunk currently on the wire.
    fn take_completion(&self, desc: &mut RequestDescriptor) -> Result<(), EspiError> {
        let mut pkt = [0u8; BUF_BYTES];
        let len = COMPLETION_HEADER_LEN + desc.chunk;
        self.hw.bus.read_window(Window::PbmRx, &mut pkt[..len]);
        let header = CommonHeader::decode(&pkt)?;
        // Hardware matches completion tags on this channel.
        check_completion(
            &header,
            Expected {
                tag: None,
                length: desc.chunk,
                with_data: true,
            },
        )?;
        let pos = desc.buf_pos;
        let stored = if desc.strip_header {
            desc.buf[pos..pos + desc.chunk].copy_from_slice(&pkt[COMPLETION_HEADER_LEN..len]);
            desc.chunk
        } else {
            desc.buf[pos..pos + len].copy_from_slice(&pkt[..len]);
            len
        };
        desc.buf_pos += stored;
        desc.transferred += desc.chunk;
        Ok(())
    }

    /// Records the end of one posted sub-request.
    fn step_done(&self, desc: &mut RequestDescriptor) -> Result<(), EspiError> {
        match desc.direction {
            Direction::Read => self.take_completion(desc),
            _ => {
                desc.transferred += desc.chunk;
                Ok(())
            }
        }
    }

    fn run_manual_polling(&mut self, mut desc: RequestDescriptor) -> Result<Issued, BufError> {
        let hw = self.hw;
        let _masked = MaskedInterrupts::new(hw.bus, MANUAL_STATUS);
        loop {
            self.send_chunk(&mut desc);
            let waited = match desc.direction {
                Direction::Read => hw.wait(|| hw.bus.is_set(ESPISTS, EspiSts::PbmRx)),
                _ => hw.wait(|| {
                    !hw.bus.is_set(BMCTL, BmCtl::TxAvail)
                        || hw.bus.is_set(ESPISTS, EspiSts::BmTxDone)
                }),
            };
            hw.bus.clear_status(ESPISTS, hw.bus.get_raw(ESPISTS) & MANUAL_STATUS);
            if let Err(err) = waited.and_then(|_| self.step_done(&mut desc)) {
                error!("[espi-pcbm] polling request failed: {}", err);
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

    fn start_auto(&mut self, req: PcBmRequest, buf: &'static mut [u8]) -> Result<Issued, BufError> {
        let bus = self.hw.bus;
        let direction = req.kind.direction();
        let count = req.size / self.max_payload;
        let mut use_dma = req.use_dma;
        if direction == Direction::Write && count == 1 && use_dma {
            debug!("[espi-pcbm] single transaction write burst, dma off");
            use_dma = false;
        }

        let mut desc = RequestDescriptor::new(direction, Mode::Auto, req.offset, req.size, buf);
        desc.strip_header = req.strip_header;
        desc.polling = req.polling;
        desc.transactions = count;
        desc.tag = self.tags.current();

        let wide = req.offset > u32::MAX as u64;
        let cycle = match (direction, wide) {
            (Direction::Read, false) => CycleType::MemRead32,
            (Direction::Read, true) => CycleType::MemRead64,
            (_, false) => CycleType::MemWrite32,
            (_, true) => CycleType::MemWrite64,
        };
        let header = Header {
            cycle_type: cycle.into(),
            tag: desc.tag,
            length: self.max_payload,
            address: if wide {
                Address::Addr64(req.offset)
            } else {
                Address::Addr32(req.offset as u32)
            },
        };
        let mut pkt = [0u8; BUF_BYTES];
        let len = header.encode(&mut pkt).unwrap_or(0);
        bus.write_window(Window::PbmTx, &pkt[..len]);
        bus.set_raw(BMAUTOADDR_LO, req.offset as u32);
        bus.set_raw(BMAUTOADDR_HI, (req.offset >> 32) as u32);

        if use_dma {
            let (dma_dir, dma_len) = match direction {
                Direction::Read => (DmaDirection::ToMemory, self.buffer_len(&req)),
                _ => (DmaDirection::FromMemory, req.size),
            };
            let addr = desc.buf.as_ptr() as usize;
            match self
                .hw
                .attach_dma(DmaRequestor::BusMaster, dma_dir, addr, dma_len)
            {
                Ok(channel) => desc.dma = Some(channel),
                Err(err) => {
                    warn!("[espi-pcbm] dma unavailable: {}", err);
                    return Err((err, desc.buf));
                }
            }
        } else if direction == Direction::Write {
            for word in desc.buf[..req.size].chunks(4) {
                let mut bytes = [0u8; 4];
                bytes[..word.len()].copy_from_slice(word);
                bus.set_raw(BMAUTODATA, u32::from_le_bytes(bytes));
            }
        }

        let dir = if direction == Direction::Read {
            BmCtl::AutoDir::Read
        } else {
            BmCtl::AutoDir::Write
        };
        let strip = if req.strip_header {
            BmCtl::Strip::SET
        } else {
            BmCtl::Strip::CLEAR
        };
        let dma_en = if use_dma {
            BmCtl::DmaEn::SET
        } else {
            BmCtl::DmaEn::CLEAR
        };
        bus.modify(
            BMCTL,
            dir + strip + dma_en + BmCtl::TransCnt.val(count as u32 - 1) + BmCtl::AutoEn::SET,
        );
        self.tags.advance_by(count);
        debug!(
            "[espi-pcbm] burst of {} at {:#x}, first tag {}",
            count, req.offset, desc.tag
        );

        if req.polling {
            return self.run_auto_polling(desc);
        }
        self.state = ChannelState::InFlight(desc);
        Ok(Issued::Pending)
    }

    fn run_auto_polling(&mut self, mut desc: RequestDescriptor) -> Result<Issued, BufError> {
        let hw = self.hw;
        let _masked = MaskedInterrupts::new(hw.bus, BURST_STATUS);
        let done = if desc.direction == Direction::Read {
            EspiSts::BmBurstDone
        } else {
            EspiSts::BmWBurstDone
        };
        let drain = desc.direction == Direction::Read && desc.dma.is_none();
        let waited = hw.wait(|| {
            if drain {
                drain_fifo(hw.bus, &mut desc, false);
            }
            let sts = hw.bus.get(ESPISTS);
            sts.is_set(done) || sts.is_set(EspiSts::BmBurstErr)
        });
        if let Err(err) = waited {
            error!("[espi-pcbm] burst timed out");
            self.reset_channel(desc.dma.take());
            self.status = Status::Failed;
            return Err((err, desc.buf));
        }
        let sts = hw.bus.get_raw(ESPISTS);
        self.finish_burst(desc, sts).map(Issued::Complete)
    }

    /// Wraps up a burst once the hardware reports done or error.
    fn finish_burst(
        &mut self,
        mut desc: RequestDescriptor,
        sts: u32,
    ) -> Result<&'static mut [u8], BufError> {
        let bus = self.hw.bus;
        let sts = LocalRegisterCopy::<u32, EspiSts::Register>::new(sts);
        if sts.is_set(EspiSts::BmBurstErr) {
            let mask = bus.get_raw(BMERR);
            bus.clear_status(BMERR, mask);
            let transaction = bus.get_raw(BMAUTOCNT);
            let errs = LocalRegisterCopy::<u32, ErrMask::Register>::new(mask);
            if !errs.is_set(ErrMask::UnsucCpl) && !errs.is_set(ErrMask::ProtErr) {
                self.error_wire.raise(&self.hw);
            }
            error!(
                "[espi-pcbm] burst error {:#x} at transaction {}",
                mask, transaction
            );
            self.reset_channel(desc.dma.take());
            self.status = Status::Failed;
            return Err((EspiError::BurstError { transaction, mask }, desc.buf));
        }

        let mut result = Ok(());
        match desc.dma.take() {
            Some(channel) => {
                if let Some(dma) = self.hw.dma {
                    if dma.status(channel) == DmaStatus::Error {
                        result = Err(EspiError::Dma(crate::hil::DmaError::TransferFailed));
                    }
                }
                self.hw.release_dma(Some(channel));
                if result.is_ok() && desc.direction == Direction::Read {
                    desc.buf_pos = self.buffer_len_for(&desc);
                }
            }
            None if desc.direction == Direction::Read => {
                drain_fifo(bus, &mut desc, true);
                let expected = self.buffer_len_for(&desc);
                if desc.buf_pos != expected {
                    result = Err(EspiError::Protocol(
                        crate::error::ProtocolError::LengthMismatch {
                            expected,
                            got: desc.buf_pos,
                        },
                    ));
                }
            }
            None => {}
        }

        // Leave automatic mode so the next caller starts from manual.
        bus.modify(BMCTL, BmCtl::AutoEn::CLEAR + BmCtl::DmaEn::CLEAR);
        bus.clear_status(ESPISTS, bus.get_raw(ESPISTS) & (BURST_STATUS | MANUAL_STATUS));

        match result {
            Ok(()) => {
                desc.transferred = desc.size;
                self.status = Status::Ok;
                Ok(desc.buf)
            }
            Err(err) => {
                error!("[espi-pcbm] burst failed: {}", err);
                self.reset_channel(None);
                self.status = Status::Failed;
                Err((err, desc.buf))
            }
        }
    }

    fn buffer_len_for(&self, desc: &RequestDescriptor) -> usize {
        if desc.strip_header {
            desc.size
        } else {
            desc.size + desc.transactions * COMPLETION_HEADER_LEN
        }
    }

    /// PBMRX: a manual read completion arrived.
    pub fn handle_rx(&mut self) {
        let Some(mut desc) = self.state.take() else {
            warn!("[espi-pcbm] completion with no request");
            return;
        };
        if desc.mode != Mode::Manual || desc.direction != Direction::Read {
            self.state = ChannelState::InFlight(desc);
            return;
        }
        match self.take_completion(&mut desc) {
            Err(err) => self.fail(desc, err),
            Ok(()) if desc.is_done() => self.complete(desc),
            Ok(()) => {
                self.send_chunk(&mut desc);
                self.state = ChannelState::InFlight(desc);
            }
        }
    }

    /// BMTXDONE: a manual write or message left the queue.
    pub fn handle_tx_done(&mut self) {
        let Some(mut desc) = self.state.take() else {
            return;
        };
        if desc.mode != Mode::Manual || desc.direction == Direction::Read {
            self.state = ChannelState::InFlight(desc);
            return;
        }
        desc.transferred += desc.chunk;
        if desc.is_done() {
            self.complete(desc);
        } else {
            self.send_chunk(&mut desc);
            self.state = ChannelState::InFlight(desc);
        }
    }

    /// BMBURSTDONE / BMWBURSTDONE / BMBURSTERR.
    pub fn handle_burst(&mut self, sts: u32) {
        let Some(desc) = self.state.take() else {
            warn!("[espi-pcbm] burst event with no request");
            return;
        };
        if desc.mode != Mode::Auto {
            self.state = ChannelState::InFlight(desc);
            return;
        }
        let size = desc.size;
        let client = self.client;
        match self.finish_burst(desc, sts) {
            Ok(buf) => {
                if let Some(client) = client {
                    client.request_done(buf, Ok(size));
                }
            }
            Err((err, buf)) => {
                if let Some(client) = client {
                    client.request_done(buf, Err(err));
                }
            }
        }
    }

    fn complete(&mut self, desc: RequestDescriptor) {
        self.status = Status::Ok;
        trace!("[espi-pcbm] request of {} bytes done", desc.size);
        if let Some(client) = self.client {
            client.request_done(desc.buf, Ok(desc.size));
        }
    }

    fn fail(&mut self, mut desc: RequestDescriptor, err: EspiError) {
        error!("[espi-pcbm] request failed: {}", err);
        self.reset_channel(desc.dma.take());
        self.status = Status::Failed;
        if let Some(client) = self.client {
            client.request_done(desc.buf, Err(err));
        }
    }

    /// Forces the channel back to manual mode with empty queues.
    fn reset_channel(&mut self, dma: Option<crate::hil::DmaChannel>) {
        let bus = self.hw.bus;
        bus.modify(
            BMCTL,
            BmCtl::AutoEn::CLEAR + BmCtl::DmaEn::CLEAR + BmCtl::BufRst::SET,
        );
        bus.clear_status(ESPISTS, bus.get_raw(ESPISTS) & (BURST_STATUS | MANUAL_STATUS));
        self.hw.release_dma(dma);
    }

    /// Drops any live request and resets the channel. Calling it again has no
    /// further effect. The held buffer, if any, is returned.
    pub fn abort(&mut self) -> Option<&'static mut [u8]> {
        let desc = self.state.take();
        match desc {
            Some(mut desc) => {
                warn!("[espi-pcbm] aborting request at {:#x}", desc.offset);
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

    /// Abort on reset, returning the buffer to the client.
    pub fn handle_reset(&mut self) {
        if let Some(buf) = self.abort() {
            if let Some(client) = self.client {
                client.request_done(buf, Err(EspiError::Aborted));
            }
        }
        self.error_wire.release(&self.hw);
    }
}

/// Moves whatever the burst FIFO holds into the request buffer. With `all`
/// set, a trailing partial word is taken too.
fn drain_fifo(bus: &dyn EspiBus, desc: &mut RequestDescriptor, all: bool) {
    let expected = if desc.strip_header {
        desc.size
    } else {
        desc.size + desc.transactions * COMPLETION_HEADER_LEN
    };
    loop {
        let level = bus.get_raw(BMAUTOLVL) as usize;
        if level == 0 || (level < 4 && !all) || desc.buf_pos >= expected {
            break;
        }
        let word = bus.get_raw(BMAUTODATA).to_le_bytes();
        let take = level.min(4).min(expected - desc.buf_pos);
        let pos = desc.buf_pos;
        desc.buf[pos..pos + take].copy_from_slice(&word[..take]);
        desc.buf_pos += take;
    }
}
