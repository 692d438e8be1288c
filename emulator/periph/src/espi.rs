/*++

Licensed under the Apache-2.0 license.

File Name:

    espi.rs

Abstract:

    File contains the emulated eSPI slave controller together with the host
    that sits on the other end of the link.

--*/

use crate::dma::EmulatedDma;
use crate::host::{FlashImage, HostMemory};
use espi_driver::hil::{DmaRequestor, EraseSizes};
use espi_driver::packet::{
    Address, AddressKind, CommonHeader, CompletionCode, CycleType, FlashCycleType, Header,
    COMPLETION_HEADER_LEN, LTR_MESSAGE_CODE,
};
use espi_driver::regs::{
    BmCtl, EspiBus, EspiCfg, EspiSts, FlashAccCtl, FlashCfg, FlashCtl, PrtrBaddr, RegId,
    BUF_BYTES, BUF_WORDS,
};
use log::{debug, trace, warn};
use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;
use tock_registers::fields::FieldValue;
use tock_registers::LocalRegisterCopy;

/// Capabilities the emulated host negotiates, as register field codes.
#[derive(Debug, Clone, Copy)]
pub struct EmulatorConfig {
    pub pc_max_payload: u32,
    pub flash_max_payload: u32,
    pub flash_max_read_request: u32,
    pub erase_sizes: EraseSizes,
    /// Flash channel only supports two outstanding tags.
    pub flash_tag2: bool,
    pub bm_max_transactions: u32,
    pub flash_size: usize,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            pc_max_payload: 1,
            flash_max_payload: 1,
            flash_max_read_request: 3,
            erase_sizes: EraseSizes::ALL,
            flash_tag2: false,
            bm_max_transactions: 64,
            flash_size: 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BurstFault {
    /// Zero-based index of the failing transaction.
    pub transaction: u32,
    /// BMERR bits to report.
    pub mask: u32,
}

/// Misbehaviour the emulated host can be told to show.
#[derive(Debug, Clone, Copy, Default)]
pub struct Faults {
    /// Bus-master packets are never picked up.
    pub bm_stall: bool,
    /// Bus-master reads complete unsuccessfully.
    pub bm_unsuccessful: bool,
    pub bm_burst_error: Option<BurstFault>,
    pub flash_stall: bool,
    pub flash_unsuccessful: bool,
    /// Flash completions carry a tag other than the request's.
    pub flash_wrong_tag: bool,
    /// FLASHERR bits to report on the next automatic read.
    pub flash_auto_error: Option<u32>,
    /// AUTO_RD_DIS_STS never follows AUTO_RD_DIS_CTL.
    pub auto_rd_dis_stuck: bool,
}

/// A request packet as the host saw it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoggedRequest {
    pub cycle: u8,
    pub tag: u8,
    pub address: u64,
    pub length: usize,
}

/// A completion the slave sent for a host flash request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub code: u8,
    pub tag: u8,
    pub data: Vec<u8>,
}

fn bit(value: FieldValue<u32, EspiSts::Register>) -> u32 {
    value.value
}

fn erase_bytes(code: usize) -> Option<u32> {
    match code {
        1 => Some(4 * 1024),
        2 => Some(32 * 1024),
        3 => Some(64 * 1024),
        _ => None,
    }
}

fn pop_word(fifo: &mut VecDeque<u8>) -> u32 {
    let mut word = [0u8; 4];
    for byte in word.iter_mut() {
        match fifo.pop_front() {
            Some(b) => *byte = b,
            None => break,
        }
    }
    u32::from_le_bytes(word)
}

struct Controller {
    config: EmulatorConfig,
    regs: BTreeMap<RegId, u32>,
    espi_cfg: LocalRegisterCopy<u32, EspiCfg::Register>,
    sts: u32,
    espi_err: u32,
    flash_cfg: LocalRegisterCopy<u32, FlashCfg::Register>,
    flash_ctl: LocalRegisterCopy<u32, FlashCtl::Register>,
    acc_ctl: LocalRegisterCopy<u32, FlashAccCtl::Register>,
    flash_err: u32,
    flash_fifo: VecDeque<u8>,
    bm_ctl: LocalRegisterCopy<u32, BmCtl::Register>,
    bm_err: u32,
    bm_fifo: VecDeque<u8>,
    /// A host flash request sits in FLASHRXBUF unacknowledged.
    host_pending: bool,
    host: HostMemory,
    flash: FlashImage,
    faults: Faults,
    dma: Option<Rc<EmulatedDma>>,
    bm_log: Vec<LoggedRequest>,
    flash_log: Vec<LoggedRequest>,
    flash_erases: Vec<(u32, u32)>,
    ltr: Vec<u16>,
    taf_completions: Vec<Completion>,
}

impl Controller {
    fn new(config: EmulatorConfig) -> Self {
        let espi_cfg = EspiCfg::PcEn::SET
            + EspiCfg::VwEn::SET
            + EspiCfg::OobEn::SET
            + EspiCfg::FlashEn::SET
            + EspiCfg::BmEn::SET
            + EspiCfg::PcReady::SET
            + EspiCfg::FlashReady::SET
            + EspiCfg::PcMaxPayload.val(config.pc_max_payload);
        let tag_mode = if config.flash_tag2 {
            FlashCfg::TagMode::Tag2
        } else {
            FlashCfg::TagMode::Tag16
        };
        let flash_cfg = FlashCfg::MaxPayload.val(config.flash_max_payload)
            + FlashCfg::MaxReadReq.val(config.flash_max_read_request)
            + FlashCfg::EraseSizes.val(config.erase_sizes.0 as u32)
            + tag_mode;
        Self {
            config,
            regs: BTreeMap::new(),
            espi_cfg: LocalRegisterCopy::new(espi_cfg.value),
            sts: 0,
            espi_err: 0,
            flash_cfg: LocalRegisterCopy::new(flash_cfg.value),
            flash_ctl: LocalRegisterCopy::new(0),
            acc_ctl: LocalRegisterCopy::new(0),
            flash_err: 0,
            flash_fifo: VecDeque::new(),
            bm_ctl: LocalRegisterCopy::new(0),
            bm_err: 0,
            bm_fifo: VecDeque::new(),
            host_pending: false,
            host: HostMemory::default(),
            flash: FlashImage::new(config.flash_size),
            faults: Faults::default(),
            dma: None,
            bm_log: Vec::new(),
            flash_log: Vec::new(),
            flash_erases: Vec::new(),
            ltr: Vec::new(),
            taf_completions: Vec::new(),
        }
    }

    fn reg(&self, reg: RegId) -> u32 {
        self.regs.get(&reg).copied().unwrap_or(0)
    }

    fn window(&self, word: fn(u8) -> RegId) -> [u8; BUF_BYTES] {
        let mut pkt = [0u8; BUF_BYTES];
        for (index, chunk) in pkt.chunks_mut(4).enumerate() {
            chunk.copy_from_slice(&self.reg(word(index as u8)).to_le_bytes());
        }
        pkt
    }

    fn fill_window(&mut self, word: fn(u8) -> RegId, bytes: &[u8]) {
        for (index, chunk) in bytes.chunks(4).take(BUF_WORDS).enumerate() {
            let mut value = [0u8; 4];
            value[..chunk.len()].copy_from_slice(chunk);
            self.regs
                .insert(word(index as u8), u32::from_le_bytes(value));
        }
    }

    fn respond(&mut self, word: fn(u8) -> RegId, code: CompletionCode, tag: u8, data: &[u8]) {
        let mut pkt = [0u8; BUF_BYTES];
        let header = CommonHeader::new(code.into(), tag, data.len()).bytes();
        let len = header.len();
        pkt[..len].copy_from_slice(&header);
        let end = (len + data.len()).min(BUF_BYTES);
        pkt[len..end].copy_from_slice(&data[..end - len]);
        self.fill_window(word, &pkt[..end]);
    }

    fn taf_mode(&self) -> bool {
        self.flash_cfg.is_set(FlashCfg::TafMode)
    }

    fn slot_locked(&self, slot: u8) -> bool {
        PrtrBaddr::Lock.is_set(self.reg(RegId::FlashPrtrBaddr(slot)))
    }

    fn flash_acc_ctl(&self) -> u32 {
        let mut acc = self.acc_ctl;
        let disabled =
            acc.is_set(FlashAccCtl::AutoRdDisCtl) && !self.faults.auto_rd_dis_stuck;
        let res_pend = self.taf_mode() && self.flash_ctl.is_set(FlashCtl::TxAvail);
        acc.modify(
            FlashAccCtl::AutoRdDisSts.val(disabled as u32)
                + FlashAccCtl::AutoRdPend.val(self.host_pending as u32)
                + FlashAccCtl::ResPend.val(res_pend as u32),
        );
        acc.get()
    }

    fn bus_error(&mut self, detail: u32) {
        warn!("[espi-emu] bus error {:#x}", detail);
        self.espi_err |= detail;
        self.sts |= bit(EspiSts::Berr::SET);
    }

    /// Hands burst data to the local side, through DMA when enabled.
    fn deliver(&mut self, requestor: DmaRequestor, dma: bool, data: Vec<u8>) {
        if !dma {
            match requestor {
                DmaRequestor::BusMaster => self.bm_fifo.extend(data),
                DmaRequestor::Flash => self.flash_fifo.extend(data),
            }
            return;
        }
        let delivered = self
            .dma
            .as_ref()
            .is_some_and(|dma| dma.deliver(requestor, &data));
        if !delivered {
            warn!("[espi-emu] {:?} burst dropped, no dma channel", requestor);
        }
    }

    fn write_bm_ctl(&mut self, value: u32) {
        let new = LocalRegisterCopy::<u32, BmCtl::Register>::new(value);
        if new.is_set(BmCtl::BufRst) {
            self.bm_fifo.clear();
            self.bm_ctl.set(value);
            self.bm_ctl
                .modify(BmCtl::BufRst::CLEAR + BmCtl::TxAvail::CLEAR);
            return;
        }
        let was_auto = self.bm_ctl.is_set(BmCtl::AutoEn);
        self.bm_ctl.set(value);
        if new.is_set(BmCtl::AutoEn) {
            if !was_auto {
                self.run_bm_burst();
            }
        } else if new.is_set(BmCtl::TxAvail) {
            self.run_bm_manual();
        }
    }

    fn run_bm_manual(&mut self) {
        let pkt = self.window(RegId::PbmTxBuf);
        let Ok(common) = CommonHeader::decode(&pkt) else {
            return;
        };
        let Ok(cycle) = CycleType::try_from(common.cycle_type()) else {
            self.bus_error(1 << 0);
            return;
        };
        let Ok(header) = Header::decode(&pkt, AddressKind::for_cycle(cycle)) else {
            return;
        };
        let address = match header.address {
            Address::Addr32(addr) => addr as u64,
            Address::Addr64(addr) => addr,
            Address::Message { value, .. } => value as u64,
            Address::None => 0,
        };
        self.bm_log.push(LoggedRequest {
            cycle: header.cycle_type,
            tag: header.tag,
            address,
            length: header.length,
        });
        if self.faults.bm_stall {
            trace!("[espi-emu] bm packet tag {} left queued", header.tag);
            return;
        }
        match cycle {
            CycleType::MemRead32 | CycleType::MemRead64 => {
                if self.faults.bm_unsuccessful {
                    self.respond(RegId::PbmRxBuf, CompletionCode::Unsuccessful, header.tag, &[]);
                } else {
                    let data = self.host.read(address, header.length);
                    self.respond(RegId::PbmRxBuf, CompletionCode::SuccessData, header.tag, &data);
                }
                self.bm_ctl.modify(BmCtl::TxAvail::CLEAR);
                self.sts |= bit(EspiSts::PbmRx::SET);
            }
            CycleType::MemWrite32 | CycleType::MemWrite64 => {
                let start = header.len();
                if let Some(payload) = pkt.get(start..start + header.length) {
                    self.host.write(address, payload);
                }
                self.bm_ctl.modify(BmCtl::TxAvail::CLEAR);
                self.sts |= bit(EspiSts::BmTxDone::SET);
            }
            CycleType::Message => {
                if let Address::Message { code, value } = header.address {
                    if code == LTR_MESSAGE_CODE {
                        self.ltr.push(value as u16);
                    }
                }
                self.bm_ctl.modify(BmCtl::TxAvail::CLEAR);
                self.sts |= bit(EspiSts::BmTxDone::SET);
            }
        }
    }

    fn run_bm_burst(&mut self) {
        let pkt = self.window(RegId::PbmTxBuf);
        let Ok(common) = CommonHeader::decode(&pkt) else {
            return;
        };
        let count = self.bm_ctl.read(BmCtl::TransCnt) as usize + 1;
        let read = self.bm_ctl.matches_all(BmCtl::AutoDir::Read);
        let strip = self.bm_ctl.is_set(BmCtl::Strip);
        let dma = self.bm_ctl.is_set(BmCtl::DmaEn);
        let len = common.length();
        let base = self.reg(RegId::BmAutoAddrLo) as u64
            | (self.reg(RegId::BmAutoAddrHi) as u64) << 32;
        debug!(
            "[espi-emu] bm burst {} x {} at {:#x}, {}",
            count,
            len,
            base,
            if read { "read" } else { "write" }
        );

        let source = if read {
            Vec::new()
        } else if dma {
            self.dma
                .as_ref()
                .and_then(|d| d.fetch(DmaRequestor::BusMaster, count * len))
                .unwrap_or_default()
        } else {
            let take = (count * len).min(self.bm_fifo.len());
            self.bm_fifo.drain(..take).collect()
        };

        let mut out = Vec::new();
        for t in 0..count {
            let tag = ((common.tag() as usize + t) % 16) as u8;
            let addr = base + (t * len) as u64;
            self.bm_log.push(LoggedRequest {
                cycle: common.cycle_type(),
                tag,
                address: addr,
                length: len,
            });
            self.regs.insert(RegId::BmAutoCnt, t as u32);
            if let Some(fault) = self.faults.bm_burst_error {
                if fault.transaction as usize == t {
                    warn!("[espi-emu] bm burst fails at transaction {}", t);
                    self.bm_err |= fault.mask;
                    self.sts |= bit(EspiSts::BmBurstErr::SET);
                    return;
                }
            }
            if read {
                if !strip {
                    let header = CommonHeader::new(CompletionCode::SuccessData.into(), tag, len);
                    out.extend_from_slice(&header.bytes());
                }
                out.extend(self.host.read(addr, len));
            } else if let Some(chunk) = source.get(t * len..(t + 1) * len) {
                self.host.write(addr, chunk);
            }
        }
        if read {
            self.deliver(DmaRequestor::BusMaster, dma, out);
            self.sts |= bit(EspiSts::BmBurstDone::SET);
        } else {
            self.sts |= bit(EspiSts::BmWBurstDone::SET);
        }
    }

    fn write_flash_ctl(&mut self, value: u32) {
        let new = LocalRegisterCopy::<u32, FlashCtl::Register>::new(value);
        if new.is_set(FlashCtl::BufRst) {
            self.flash_fifo.clear();
            self.flash_ctl.set(value);
            self.flash_ctl
                .modify(FlashCtl::BufRst::CLEAR + FlashCtl::TxAvail::CLEAR);
            return;
        }
        let was_auto = self.flash_ctl.is_set(FlashCtl::AutoEn);
        self.flash_ctl.set(value);
        if self.taf_mode() {
            if new.is_set(FlashCtl::TxAvail) {
                self.take_taf_completion();
            }
            return;
        }
        if new.is_set(FlashCtl::AutoEn) {
            if !was_auto {
                self.run_flash_auto();
            }
        } else if new.is_set(FlashCtl::TxAvail) {
            self.run_flash_manual();
        }
    }

    fn run_flash_manual(&mut self) {
        let pkt = self.window(RegId::FlashTxBuf);
        let Ok(header) = Header::decode(&pkt, AddressKind::Addr32) else {
            return;
        };
        let Address::Addr32(offset) = header.address else {
            return;
        };
        self.flash_log.push(LoggedRequest {
            cycle: header.cycle_type,
            tag: header.tag,
            address: offset as u64,
            length: header.length,
        });
        if self.faults.flash_stall {
            trace!("[espi-emu] flash packet tag {} left queued", header.tag);
            return;
        }
        let tag = if self.faults.flash_wrong_tag {
            header.tag ^ 1
        } else {
            header.tag
        };
        let cycle = FlashCycleType::try_from(header.cycle_type);
        let (code, data) = match cycle {
            _ if self.faults.flash_unsuccessful => (CompletionCode::Unsuccessful, Vec::new()),
            Ok(FlashCycleType::Read) => match self.flash.read(offset, header.length) {
                Some(data) => (CompletionCode::SuccessData, data),
                None => (CompletionCode::Unsuccessful, Vec::new()),
            },
            Ok(FlashCycleType::Write) => {
                let start = header.len();
                let written = pkt
                    .get(start..start + header.length)
                    .is_some_and(|payload| self.flash.write(offset, payload));
                if written {
                    (CompletionCode::SuccessNoData, Vec::new())
                } else {
                    (CompletionCode::Unsuccessful, Vec::new())
                }
            }
            Ok(FlashCycleType::Erase) => match erase_bytes(header.length) {
                Some(size) if self.flash.erase(offset, size) => {
                    self.flash_erases.push((offset, size));
                    (CompletionCode::SuccessNoData, Vec::new())
                }
                _ => (CompletionCode::Unsuccessful, Vec::new()),
            },
            _ => (CompletionCode::Unsuccessful, Vec::new()),
        };
        self.respond(RegId::FlashRxBuf, code, tag, &data);
        self.flash_ctl.modify(FlashCtl::TxAvail::CLEAR);
        self.sts |= bit(EspiSts::FlashRx::SET);
    }

    fn run_flash_auto(&mut self) {
        let pkt = self.window(RegId::FlashTxBuf);
        let Ok(common) = CommonHeader::decode(&pkt) else {
            return;
        };
        let count = self.flash_ctl.read(FlashCtl::AutoCnt) as usize + 1;
        let strip = self.flash_ctl.is_set(FlashCtl::Strip);
        let dma = self.flash_ctl.is_set(FlashCtl::DmaEn);
        let len = common.length();
        let base = self.reg(RegId::FlashAutoAddr);
        debug!("[espi-emu] flash auto read {} x {} at {:#x}", count, len, base);

        if let Some(mask) = self.faults.flash_auto_error {
            warn!("[espi-emu] flash auto read fails with {:#x}", mask);
            self.flash_err |= mask;
            self.sts |= bit(EspiSts::AmErr::SET);
            return;
        }
        let mut out = Vec::new();
        for t in 0..count {
            let tag = ((common.tag() as usize + t) % 2) as u8;
            let offset = base + (t * len) as u32;
            self.flash_log.push(LoggedRequest {
                cycle: FlashCycleType::Read.into(),
                tag,
                address: offset as u64,
                length: len,
            });
            let Some(data) = self.flash.read(offset, len) else {
                self.flash_err |= 1;
                self.sts |= bit(EspiSts::AmErr::SET);
                return;
            };
            if !strip {
                let header = CommonHeader::new(CompletionCode::SuccessData.into(), tag, len);
                out.extend_from_slice(&header.bytes());
            }
            out.extend(data);
        }
        self.deliver(DmaRequestor::Flash, dma, out);
        self.sts |= bit(EspiSts::AmDone::SET);
    }

    fn take_taf_completion(&mut self) {
        let pkt = self.window(RegId::FlashTxBuf);
        if let Ok(header) = CommonHeader::decode(&pkt) {
            let len = header.length().min(BUF_BYTES - COMPLETION_HEADER_LEN);
            trace!(
                "[espi-emu] taf completion {:#04x} tag {} len {}",
                header.cycle_type(),
                header.tag(),
                len
            );
            self.taf_completions.push(Completion {
                code: header.cycle_type(),
                tag: header.tag(),
                data: pkt[COMPLETION_HEADER_LEN..COMPLETION_HEADER_LEN + len].to_vec(),
            });
        }
        self.flash_ctl.modify(FlashCtl::TxAvail::CLEAR);
    }
}

/// Emulated eSPI slave controller. Register side effects happen on the
/// access that triggers them, so completions are visible to the very next
/// status read.
pub struct EmulatedEspi {
    ctrl: RefCell<Controller>,
}

impl Default for EmulatedEspi {
    fn default() -> Self {
        Self::new(EmulatorConfig::default())
    }
}

impl EmulatedEspi {
    pub fn new(config: EmulatorConfig) -> Self {
        Self {
            ctrl: RefCell::new(Controller::new(config)),
        }
    }

    pub fn attach_dma(&self, dma: Rc<EmulatedDma>) {
        self.ctrl.borrow_mut().dma = Some(dma);
    }

    pub fn inject(&self, faults: Faults) {
        self.ctrl.borrow_mut().faults = faults;
    }

    pub fn configure(&self, value: FieldValue<u32, EspiCfg::Register>) {
        self.ctrl.borrow_mut().espi_cfg.modify(value);
    }

    /// Raises ESPISTS bits as if the link had signalled them.
    pub fn raise(&self, value: FieldValue<u32, EspiSts::Register>) {
        self.ctrl.borrow_mut().sts |= value.value;
    }

    pub fn raise_bus_error(&self, detail: u32) {
        self.ctrl.borrow_mut().bus_error(detail);
    }

    pub fn status(&self) -> u32 {
        self.ctrl.borrow().sts
    }

    /// Whether an enabled interrupt or wake condition is pending.
    pub fn irq_pending(&self) -> bool {
        let ctrl = self.ctrl.borrow();
        let enabled = ctrl.reg(RegId::EspiIe) | ctrl.reg(RegId::EspiWe);
        ctrl.sts & enabled != 0
    }

    pub fn host_read(&self, addr: u64, len: usize) -> Vec<u8> {
        self.ctrl.borrow().host.read(addr, len)
    }

    pub fn host_write(&self, addr: u64, data: &[u8]) {
        self.ctrl.borrow_mut().host.write(addr, data);
    }

    pub fn flash_image(&self, offset: u32, len: usize) -> Option<Vec<u8>> {
        self.ctrl.borrow().flash.read(offset, len)
    }

    pub fn bm_requests(&self) -> Vec<LoggedRequest> {
        self.ctrl.borrow().bm_log.clone()
    }

    pub fn flash_requests(&self) -> Vec<LoggedRequest> {
        self.ctrl.borrow().flash_log.clone()
    }

    pub fn flash_erases(&self) -> Vec<(u32, u32)> {
        self.ctrl.borrow().flash_erases.clone()
    }

    pub fn ltr_messages(&self) -> Vec<u16> {
        self.ctrl.borrow().ltr.clone()
    }

    pub fn taf_completions(&self) -> Vec<Completion> {
        self.ctrl.borrow().taf_completions.clone()
    }

    /// Sends a target-attached flash request from the host. Refused while the
    /// slave has not freed its receive buffer or blocks host access.
    pub fn host_flash_request(&self, header: &Header, payload: &[u8]) -> bool {
        let mut ctrl = self.ctrl.borrow_mut();
        if !ctrl.flash_ctl.is_set(FlashCtl::NpFree)
            || ctrl.acc_ctl.is_set(FlashAccCtl::BlockNpFree)
        {
            debug!("[espi-emu] host flash request held back");
            return false;
        }
        let mut pkt = [0u8; BUF_BYTES];
        let Ok(len) = header.encode(&mut pkt) else {
            return false;
        };
        let end = (len + payload.len()).min(BUF_BYTES);
        pkt[len..end].copy_from_slice(&payload[..end - len]);
        ctrl.fill_window(RegId::FlashRxBuf, &pkt[..end]);
        ctrl.flash_ctl.modify(FlashCtl::NpFree::CLEAR);
        ctrl.host_pending = true;
        ctrl.sts |= bit(EspiSts::FlashRx::SET);
        true
    }

    pub fn host_flash_cycle(
        &self,
        cycle: FlashCycleType,
        tag: u8,
        offset: u32,
        length: usize,
        payload: &[u8],
    ) -> bool {
        let header = Header {
            cycle_type: cycle.into(),
            tag,
            length,
            address: Address::Addr32(offset),
        };
        self.host_flash_request(&header, payload)
    }
}

impl EspiBus for EmulatedEspi {
    fn read(&self, reg: RegId) -> u32 {
        let mut ctrl = self.ctrl.borrow_mut();
        match reg {
            RegId::EspiCfg => ctrl.espi_cfg.get(),
            RegId::EspiSts => ctrl.sts,
            RegId::EspiErr => ctrl.espi_err,
            RegId::FlashCfg => ctrl.flash_cfg.get(),
            RegId::FlashCtl => ctrl.flash_ctl.get(),
            RegId::FlashAccCtl => ctrl.flash_acc_ctl(),
            RegId::FlashErr => ctrl.flash_err,
            RegId::FlashAutoData => pop_word(&mut ctrl.flash_fifo),
            RegId::FlashAutoLvl => ctrl.flash_fifo.len() as u32,
            RegId::BmCfg => ctrl.config.bm_max_transactions,
            RegId::BmCtl => ctrl.bm_ctl.get(),
            RegId::BmErr => ctrl.bm_err,
            RegId::BmAutoData => pop_word(&mut ctrl.bm_fifo),
            RegId::BmAutoLvl => ctrl.bm_fifo.len() as u32,
            _ => ctrl.reg(reg),
        }
    }

    fn write(&self, reg: RegId, value: u32) {
        let mut ctrl = self.ctrl.borrow_mut();
        match reg {
            RegId::EspiSts => {
                if value & bit(EspiSts::FlashRx::SET) != 0 {
                    ctrl.host_pending = false;
                }
                ctrl.sts &= !value;
            }
            RegId::EspiErr => ctrl.espi_err &= !value,
            RegId::FlashErr => ctrl.flash_err &= !value,
            RegId::BmErr => ctrl.bm_err &= !value,
            RegId::FlashCfg => {
                let taf = FlashCfg::TafMode.read(value);
                ctrl.flash_cfg.modify(FlashCfg::TafMode.val(taf));
            }
            RegId::FlashCtl => ctrl.write_flash_ctl(value),
            RegId::FlashAccCtl => {
                let writable =
                    (FlashAccCtl::AutoRdDisCtl::SET + FlashAccCtl::BlockNpFree::SET).value;
                ctrl.acc_ctl.set(value & writable);
            }
            RegId::FlashAutoData => ctrl.flash_fifo.extend(value.to_le_bytes()),
            RegId::BmAutoData => ctrl.bm_fifo.extend(value.to_le_bytes()),
            RegId::BmCtl => ctrl.write_bm_ctl(value),
            RegId::BmCfg | RegId::FlashAutoLvl | RegId::BmAutoLvl => {}
            RegId::FlashPrtrBaddr(slot)
            | RegId::FlashPrtrHaddr(slot)
            | RegId::FlashRgnTagOvr(slot)
                if ctrl.slot_locked(slot) =>
            {
                warn!("[espi-emu] write to locked region {} ignored", slot);
            }
            _ => {
                ctrl.regs.insert(reg, value);
            }
        }
    }
}
