/*++

Licensed under the Apache-2.0 license.

File Name:

    spi_flash.rs

Abstract:

    File contains SPI NOR flash emulation at the JEDEC command level and the
    adapter that exposes it to the eSPI target-attached flash engine.

--*/

use espi_driver::hil::{EraseSize, EraseSizes, FlashDevice};
use espi_driver::EspiError;
use log::{trace, warn};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::cell::RefCell;

#[derive(Debug)]
pub enum SpiFlashInput {
    CsLow,
    CsHigh,
    BytesSend(Vec<u8>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpiFlashErr {
    CsChangeUnsupported,
    InvalidOpcode,
    Unimplemented,
    InvalidAddress,
    SpiFlashBusy,
    WriteDisabled,
    CrossPageProgram,
    PageProgramNotFF,
    EraseAddressUnaligned,
    EraseUnsupported,
    BytesReqNothingToSend,
    CommandNotSuccessful,
    InvalidTimePassWhileNotIdle,
}

pub struct FlashPartInfo {
    pub part_name: &'static str,
    pub id: &'static [u8],
    pub chip_size: u32,
    pub max_page_program_size: u32,
    /// Zero when the part has no such erase command.
    pub se_20_size: u32,
    pub be_52_size: u32,
    pub be_d8_size: u32,
}

pub const SUPPORTED_FLASH: &[FlashPartInfo] = &[
    FlashPartInfo {
        part_name: "w25q16jv",
        id: &[0xef, 0x40, 0x15],
        chip_size: 2 * 1024 * 1024,
        max_page_program_size: 256,
        se_20_size: 4 * 1024,
        be_52_size: 32 * 1024,
        be_d8_size: 64 * 1024,
    },
    // Uniform 32 KiB blocks, no 4 KiB sector erase.
    FlashPartInfo {
        part_name: "at25sl32b",
        id: &[0x1f, 0x42, 0x16],
        chip_size: 4 * 1024 * 1024,
        max_page_program_size: 256,
        se_20_size: 0,
        be_52_size: 32 * 1024,
        be_d8_size: 0,
    },
];

#[derive(Debug, Default, Clone, Copy, IntoPrimitive, TryFromPrimitive, PartialEq, Eq)]
#[repr(u8)]
pub enum JedecSpiFlashCmd {
    #[default]
    Noop = 0x00,
    PageProgram = 0x02,
    Read = 0x03,
    WriteDisable = 0x04,
    Rdsr1 = 0x05,
    WriteEnable = 0x06,
    PageProgram4ba = 0x12,
    Read4ba = 0x13,
    SectorErase = 0x20,
    BlockErase52 = 0x52,
    Rdid = 0x9f,
    Enter4ba = 0xb7,
    BlockErased8 = 0xd8,
    Exit4ba = 0xe9,
}

#[derive(Default)]
struct FlashState {
    data: Vec<u8>,
    page_buffer: Vec<u8>,
    outbuffer: Vec<u8>,
    idle: bool,
    /// Time left until a program or erase finishes.
    busy: Option<u64>,
    write_enable: bool,
    four_bytes_address: bool,
    cmd: JedecSpiFlashCmd,
    address_bytes: u32,
    address: u32,
    /// Next byte to stream out of a read.
    read_cursor: Option<u32>,
    /// The command in progress was rejected; chip select high discards it.
    failed: bool,
}

pub struct SpiFlashImpl {
    info: &'static FlashPartInfo,
    state: FlashState,
}

impl SpiFlashImpl {
    const PAGE_PROGRAM_TIME: u64 = 1;
    const SECTOR_ERASE_TIME: u64 = 50;
    const BLOCK_32K_ERASE_TIME: u64 = 120;
    const BLOCK_64K_ERASE_TIME: u64 = 150;

    pub fn new(name: &str) -> Option<Self> {
        let info = SUPPORTED_FLASH.iter().find(|f| f.part_name == name)?;
        Some(Self {
            info,
            state: FlashState {
                data: vec![0xff; info.chip_size as usize],
                idle: true,
                ..Default::default()
            },
        })
    }

    pub fn info(&self) -> &'static FlashPartInfo {
        self.info
    }

    pub fn contents(&self) -> &[u8] {
        &self.state.data
    }

    fn address_length(&self) -> u32 {
        if self.state.four_bytes_address {
            4
        } else {
            3
        }
    }

    fn process_cmd(&mut self, byte: u8) -> Result<(), SpiFlashErr> {
        let cmd = JedecSpiFlashCmd::try_from(byte).map_err(|_| SpiFlashErr::InvalidOpcode)?;
        if self.state.busy.is_some() && cmd != JedecSpiFlashCmd::Rdsr1 {
            return Err(SpiFlashErr::SpiFlashBusy);
        }
        self.state.address = 0;
        self.state.address_bytes = match cmd {
            JedecSpiFlashCmd::Read => self.address_length(),
            JedecSpiFlashCmd::Read4ba | JedecSpiFlashCmd::PageProgram4ba => 4,
            JedecSpiFlashCmd::PageProgram
            | JedecSpiFlashCmd::SectorErase
            | JedecSpiFlashCmd::BlockErase52
            | JedecSpiFlashCmd::BlockErased8 => {
                if !self.state.write_enable {
                    return Err(SpiFlashErr::WriteDisabled);
                }
                self.address_length()
            }
            JedecSpiFlashCmd::Noop => return Err(SpiFlashErr::Unimplemented),
            _ => 0,
        };
        if cmd == JedecSpiFlashCmd::PageProgram4ba && !self.state.write_enable {
            return Err(SpiFlashErr::WriteDisabled);
        }
        self.state.cmd = cmd;
        Ok(())
    }

    fn process_address(&mut self, byte: u8) -> Result<(), SpiFlashErr> {
        self.state.address = (self.state.address << 8) | byte as u32;
        self.state.address_bytes -= 1;
        if self.state.address_bytes == 0 && self.state.address >= self.info.chip_size {
            return Err(SpiFlashErr::InvalidAddress);
        }
        Ok(())
    }

    fn process_page_program_input(&mut self, byte: u8) -> Result<(), SpiFlashErr> {
        let page = self.info.max_page_program_size;
        let new_addr = self.state.address + self.state.page_buffer.len() as u32;
        if new_addr / page != self.state.address / page {
            self.state.page_buffer.clear();
            return Err(SpiFlashErr::CrossPageProgram);
        }
        if self.state.data[new_addr as usize] != 0xff {
            self.state.page_buffer.clear();
            return Err(SpiFlashErr::PageProgramNotFF);
        }
        self.state.page_buffer.push(byte);
        Ok(())
    }

    fn perform_page_program(&mut self) {
        let address = self.state.address as usize;
        let len = self.state.page_buffer.len();
        self.state.data[address..address + len].copy_from_slice(&self.state.page_buffer);
        self.state.page_buffer.clear();
        self.state.busy = Some(Self::PAGE_PROGRAM_TIME);
    }

    fn perform_erase(&mut self) -> Result<(), SpiFlashErr> {
        let (size, erase_time) = match self.state.cmd {
            JedecSpiFlashCmd::SectorErase => (self.info.se_20_size, Self::SECTOR_ERASE_TIME),
            JedecSpiFlashCmd::BlockErase52 => (self.info.be_52_size, Self::BLOCK_32K_ERASE_TIME),
            JedecSpiFlashCmd::BlockErased8 => (self.info.be_d8_size, Self::BLOCK_64K_ERASE_TIME),
            _ => (0, 0),
        };
        if size == 0 {
            return Err(SpiFlashErr::EraseUnsupported);
        }
        let address = self.state.address;
        if address & (size - 1) != 0 {
            return Err(SpiFlashErr::EraseAddressUnaligned);
        }
        self.state.data[address as usize..(address + size) as usize].fill(0xff);
        self.state.busy = Some(erase_time);
        Ok(())
    }

    fn process_input_bytes(&mut self, bytes: &[u8]) -> Result<(), SpiFlashErr> {
        for &byte in bytes {
            if self.state.cmd == JedecSpiFlashCmd::Noop {
                self.process_cmd(byte)?;
            } else if self.state.address_bytes > 0 {
                self.process_address(byte)?;
            } else if matches!(
                self.state.cmd,
                JedecSpiFlashCmd::PageProgram | JedecSpiFlashCmd::PageProgram4ba
            ) {
                self.process_page_program_input(byte)?;
            } else {
                return Err(SpiFlashErr::CommandNotSuccessful);
            }
        }
        if self.state.address_bytes == 0 {
            self.prepare_output();
        }
        Ok(())
    }

    fn prepare_output(&mut self) {
        match self.state.cmd {
            JedecSpiFlashCmd::Rdid => self.state.outbuffer = self.info.id.to_vec(),
            JedecSpiFlashCmd::Rdsr1 => {
                let mut status = 0;
                if self.state.busy.is_some() {
                    status |= 1;
                }
                if self.state.write_enable {
                    status |= 1 << 1;
                }
                self.state.outbuffer = vec![status];
            }
            JedecSpiFlashCmd::Read | JedecSpiFlashCmd::Read4ba => {
                self.state.read_cursor = Some(self.state.address);
            }
            _ => {}
        }
    }

    pub fn input(&mut self, input: &SpiFlashInput) -> Result<(), SpiFlashErr> {
        match input {
            SpiFlashInput::CsLow => {
                if !self.state.idle {
                    return Err(SpiFlashErr::CsChangeUnsupported);
                }
                self.state.idle = false;
                Ok(())
            }
            SpiFlashInput::CsHigh => {
                if self.state.idle {
                    return Err(SpiFlashErr::CsChangeUnsupported);
                }
                let incomplete = self.state.address_bytes != 0 || self.state.failed;
                let result = match self.state.cmd {
                    _ if incomplete => Err(SpiFlashErr::CommandNotSuccessful),
                    JedecSpiFlashCmd::PageProgram | JedecSpiFlashCmd::PageProgram4ba => {
                        self.perform_page_program();
                        self.state.write_enable = false;
                        Ok(())
                    }
                    JedecSpiFlashCmd::SectorErase
                    | JedecSpiFlashCmd::BlockErase52
                    | JedecSpiFlashCmd::BlockErased8 => {
                        self.state.write_enable = false;
                        self.perform_erase()
                    }
                    JedecSpiFlashCmd::WriteEnable => {
                        self.state.write_enable = true;
                        Ok(())
                    }
                    JedecSpiFlashCmd::WriteDisable => {
                        self.state.write_enable = false;
                        Ok(())
                    }
                    JedecSpiFlashCmd::Enter4ba => {
                        self.state.four_bytes_address = true;
                        Ok(())
                    }
                    JedecSpiFlashCmd::Exit4ba => {
                        self.state.four_bytes_address = false;
                        Ok(())
                    }
                    _ => Ok(()),
                };
                self.state.idle = true;
                self.state.cmd = JedecSpiFlashCmd::Noop;
                self.state.address_bytes = 0;
                self.state.page_buffer.clear();
                self.state.outbuffer.clear();
                self.state.read_cursor = None;
                self.state.failed = false;
                result
            }
            SpiFlashInput::BytesSend(bytes) => {
                let result = self.process_input_bytes(bytes);
                self.state.failed |= result.is_err();
                result
            }
        }
    }

    pub fn time_pass(&mut self, time: u64) -> Result<(), SpiFlashErr> {
        if !self.state.idle {
            return Err(SpiFlashErr::InvalidTimePassWhileNotIdle);
        }
        if let Some(left) = self.state.busy {
            self.state.busy = left.checked_sub(time).filter(|left| *left > 0);
        }
        Ok(())
    }

    pub fn req_output(&mut self, n_bytes: usize) -> Result<Vec<u8>, SpiFlashErr> {
        if let Some(cursor) = self.state.read_cursor {
            let start = cursor as usize;
            let end = (start + n_bytes).min(self.state.data.len());
            self.state.read_cursor = Some(end as u32);
            return Ok(self.state.data[start..end].to_vec());
        }
        if self.state.outbuffer.is_empty() {
            return Err(SpiFlashErr::BytesReqNothingToSend);
        }
        let rest = self
            .state
            .outbuffer
            .split_off(n_bytes.min(self.state.outbuffer.len()));
        Ok(std::mem::replace(&mut self.state.outbuffer, rest))
    }
}

/// Drives an emulated SPI NOR through its command set on behalf of the
/// target-attached flash engine. Every status poll lets one unit of device
/// time pass.
pub struct SpiNorFlash {
    flash: RefCell<SpiFlashImpl>,
}

impl SpiNorFlash {
    pub fn new(name: &str) -> Option<Self> {
        Some(Self {
            flash: RefCell::new(SpiFlashImpl::new(name)?),
        })
    }

    pub fn contents(&self, offset: u32, len: usize) -> Vec<u8> {
        let flash = self.flash.borrow();
        flash.contents()[offset as usize..offset as usize + len].to_vec()
    }

    pub fn read_id(&self) -> Result<Vec<u8>, SpiFlashErr> {
        self.transaction(&[JedecSpiFlashCmd::Rdid.into()], 3)
    }

    fn transaction(&self, bytes: &[u8], out: usize) -> Result<Vec<u8>, SpiFlashErr> {
        let mut flash = self.flash.borrow_mut();
        flash.input(&SpiFlashInput::CsLow)?;
        let sent = flash.input(&SpiFlashInput::BytesSend(bytes.to_vec()));
        let output = match sent {
            Ok(()) if out > 0 => flash.req_output(out),
            Ok(()) => Ok(Vec::new()),
            Err(err) => Err(err),
        };
        let closed = flash.input(&SpiFlashInput::CsHigh);
        let output = output?;
        closed?;
        Ok(output)
    }

    fn command(cmd: JedecSpiFlashCmd, offset: u32) -> Vec<u8> {
        let mut bytes = vec![cmd.into()];
        bytes.extend_from_slice(&offset.to_be_bytes()[1..]);
        bytes
    }

    fn write_enable(&self) -> Result<(), SpiFlashErr> {
        self.transaction(&[JedecSpiFlashCmd::WriteEnable.into()], 0)
            .map(|_| ())
    }

    fn map_err(op: &str, offset: u32, err: SpiFlashErr) -> EspiError {
        warn!("[spi-flash] {} at {:#x} failed: {:?}", op, offset, err);
        EspiError::FlashDevice
    }
}

impl FlashDevice for SpiNorFlash {
    fn read(&self, offset: u32, buf: &mut [u8]) -> Result<(), EspiError> {
        let data = self
            .transaction(&Self::command(JedecSpiFlashCmd::Read, offset), buf.len())
            .map_err(|err| Self::map_err("read", offset, err))?;
        if data.len() != buf.len() {
            return Err(Self::map_err("read", offset, SpiFlashErr::InvalidAddress));
        }
        buf.copy_from_slice(&data);
        Ok(())
    }

    fn write_page(&self, offset: u32, data: &[u8]) -> Result<(), EspiError> {
        trace!("[spi-flash] program {} bytes at {:#x}", data.len(), offset);
        let mut bytes = Self::command(JedecSpiFlashCmd::PageProgram, offset);
        bytes.extend_from_slice(data);
        self.write_enable()
            .and_then(|_| self.transaction(&bytes, 0))
            .map(|_| ())
            .map_err(|err| Self::map_err("program", offset, err))
    }

    fn erase(&self, offset: u32, size: EraseSize) -> Result<(), EspiError> {
        let cmd = match size {
            EraseSize::Sector4K => JedecSpiFlashCmd::SectorErase,
            EraseSize::Block32K => JedecSpiFlashCmd::BlockErase52,
            EraseSize::Block64K => JedecSpiFlashCmd::BlockErased8,
        };
        trace!("[spi-flash] erase {:?} at {:#x}", size, offset);
        self.write_enable()
            .and_then(|_| self.transaction(&Self::command(cmd, offset), 0))
            .map(|_| ())
            .map_err(|err| Self::map_err("erase", offset, err))
    }

    fn is_busy(&self) -> bool {
        let status = self.transaction(&[JedecSpiFlashCmd::Rdsr1.into()], 1);
        if let Err(err) = self.flash.borrow_mut().time_pass(1) {
            // Time only passes with chip select high.
            warn!("[spi-flash] device clock stalled: {:?}", err);
            return true;
        }
        matches!(status.as_deref(), Ok([status, ..]) if status & 1 != 0)
    }

    fn page_size(&self) -> usize {
        self.flash.borrow().info().max_page_program_size as usize
    }

    fn capacity(&self) -> usize {
        self.flash.borrow().info().chip_size as usize
    }

    fn erase_sizes(&self) -> EraseSizes {
        let info = self.flash.borrow().info();
        let mut sizes = EraseSizes::default();
        if info.se_20_size == 4 * 1024 {
            sizes = sizes.with(EraseSize::Sector4K);
        }
        if info.be_52_size == 32 * 1024 {
            sizes = sizes.with(EraseSize::Block32K);
        }
        if info.be_d8_size == 64 * 1024 {
            sizes = sizes.with(EraseSize::Block64K);
        }
        sizes
    }
}
