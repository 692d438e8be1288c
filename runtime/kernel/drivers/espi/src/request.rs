// Licensed under the Apache-2.0 license

//! Per-channel request bookkeeping shared by the bus-master and flash engines.

use crate::error::{EspiError, Status};
use crate::hil::DmaChannel;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
    Erase,
    Message,
}

/// How a request moves through the hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// One packet per firmware step.
    Manual,
    /// Hardware generates the packets back to back.
    Auto,
}

/// Size and alignment rules for one kind of request.
#[derive(Debug, Clone, Copy)]
pub struct Rule {
    /// Message requests carry no payload and must have size 0.
    pub zero_size: bool,
    /// Smallest accepted size.
    pub min_size: usize,
    /// Offset and size alignment.
    pub align: usize,
    /// Buffer alignment when DMA is used.
    pub dma_align: usize,
}

impl Rule {
    pub const MANUAL: Rule = Rule {
        zero_size: false,
        min_size: 1,
        align: 1,
        dma_align: 1,
    };

    /// Checks `offset`/`size` and, when `dma_addr` is given, the buffer
    /// address. Touches no hardware.
    pub fn check(&self, offset: u64, size: usize, dma_addr: Option<usize>) -> Result<(), EspiError> {
        if self.zero_size {
            return if size == 0 {
                Ok(())
            } else {
                Err(EspiError::InvalidSize)
            };
        }
        if size < self.min_size || size % self.align != 0 {
            return Err(EspiError::InvalidSize);
        }
        if offset % self.align as u64 != 0 {
            return Err(EspiError::Unaligned);
        }
        if let Some(addr) = dma_addr {
            if addr % self.dma_align != 0 {
                return Err(EspiError::Unaligned);
            }
        }
        Ok(())
    }
}

/// The single outstanding request of a channel.
#[derive(Debug)]
pub struct RequestDescriptor {
    pub direction: Direction,
    pub mode: Mode,
    pub offset: u64,
    pub size: usize,
    pub transferred: usize,
    /// Size of the sub-transaction currently on the wire.
    pub chunk: usize,
    /// Bytes written into `buf` so far, including kept completion headers.
    pub buf_pos: usize,
    pub strip_header: bool,
    pub polling: bool,
    pub dma: Option<DmaChannel>,
    /// Tag of the sub-transaction currently on the wire.
    pub tag: u8,
    /// Burst transaction count.
    pub transactions: usize,
    pub buf: &'static mut [u8],
}

impl RequestDescriptor {
    pub fn new(
        direction: Direction,
        mode: Mode,
        offset: u64,
        size: usize,
        buf: &'static mut [u8],
    ) -> Self {
        RequestDescriptor {
            direction,
            mode,
            offset,
            size,
            transferred: 0,
            chunk: 0,
            buf_pos: 0,
            strip_header: true,
            polling: false,
            dma: None,
            tag: 0,
            transactions: 0,
            buf,
        }
    }

    pub fn remaining(&self) -> usize {
        self.size - self.transferred
    }

    pub fn is_done(&self) -> bool {
        self.transferred == self.size
    }

    pub fn current_offset(&self) -> u64 {
        self.offset + self.transferred as u64
    }
}

/// A channel either has nothing outstanding or exactly one live request.
#[derive(Debug, Default)]
pub enum ChannelState {
    #[default]
    Idle,
    InFlight(RequestDescriptor),
}

impl ChannelState {
    pub fn is_idle(&self) -> bool {
        matches!(self, ChannelState::Idle)
    }

    /// Moves the live request out, leaving the channel idle.
    pub fn take(&mut self) -> Option<RequestDescriptor> {
        match core::mem::take(self) {
            ChannelState::Idle => None,
            ChannelState::InFlight(req) => Some(req),
        }
    }

    pub fn status(&self, last: Status) -> Status {
        match self {
            ChannelState::Idle => last,
            ChannelState::InFlight(_) => Status::Busy,
        }
    }
}

/// What a successful submission did.
#[derive(Debug)]
pub enum Issued {
    /// Polling request finished; the buffer comes straight back.
    Complete(&'static mut [u8]),
    /// Interrupt request started; the client gets the buffer back.
    Pending,
}

/// Error return of buffer-carrying calls.
pub type BufError = (EspiError, &'static mut [u8]);
