// Licensed under the Apache-2.0 license

//! Interfaces between the eSPI transaction engine and the rest of the system.
//!
//! The engine consumes a cycle counter, the virtual-wire and out-of-band
//! channels, a DMA engine and a physical flash device through the traits
//! below. Completions are reported back through the client traits, which
//! hand ownership of the caller's buffer back in the same call.

use crate::error::{EspiError, TafStatus};
use crate::flash::taf::TafRequest;

/// Free-running cycle counter used to bound busy-waits.
pub trait Clock {
    fn now(&self) -> u64;
}

/// Virtual-wire signals the engine drives towards the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wire {
    NonFatalError,
    /// SLAVE_BOOT_LOAD_DONE.
    BootLoadDone,
    /// SLAVE_BOOT_LOAD_STATUS: set when the boot image was found good.
    BootLoadStatus,
}

/// eSPI logical channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Peripheral,
    BusMaster,
    VirtualWire,
    Oob,
    Flash,
}

/// The virtual-wire channel.
pub trait VirtualWire {
    /// Drive a slave-to-master wire.
    fn set_wire(&self, wire: Wire, level: bool);

    /// Whether the master has enabled and readied the given channel.
    fn channel_ready(&self, channel: Channel) -> bool;

    /// Called on VWUPD and floating virtual-wire events.
    fn handle_update(&self);

    /// Called when the host asserts the platform reset wire.
    fn handle_platform_reset(&self);
}

/// The out-of-band (tunnelled SMBus) channel.
pub trait OobChannel {
    fn handle_rx(&self);
}

/// DMA transfer width. The wider setting is preferred when the buffer allows
/// it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaWidth {
    Word = 4,
    Line = 16,
}

impl DmaWidth {
    pub const fn bytes(self) -> usize {
        self as usize
    }

    /// Widest transfer width that `addr` and `len` allow.
    pub fn select(addr: usize, len: usize) -> Option<DmaWidth> {
        if addr % 16 == 0 && len % 16 == 0 {
            Some(DmaWidth::Line)
        } else if addr % 4 == 0 {
            Some(DmaWidth::Word)
        } else {
            None
        }
    }
}

/// Direction of a DMA transfer relative to local memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaDirection {
    /// Controller FIFO to local memory.
    ToMemory,
    /// Local memory to controller FIFO.
    FromMemory,
}

/// The controller block that paces a DMA channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaRequestor {
    BusMaster,
    Flash,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaChannel(pub u8);

/// Where a burst channel stands. `Error` means the engine stopped short of
/// the armed length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaStatus {
    Idle,
    Busy,
    Done,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaError {
    /// Every channel of the requested width is taken.
    NoChannel,
    /// Width, direction or requestor rejected by the engine.
    InvalidConfig,
    TransferFailed,
}

/// DMA engine used for burst transfers.
pub trait DmaAdapter {
    /// Reserve a channel able to move data at `width`.
    fn alloc_channel(&self, width: DmaWidth) -> Result<DmaChannel, DmaError>;

    /// Set width and direction of the channel.
    fn config(
        &self,
        channel: DmaChannel,
        width: DmaWidth,
        direction: DmaDirection,
    ) -> Result<(), DmaError>;

    /// Bind the channel to the controller block that paces it.
    fn config_requestor(
        &self,
        channel: DmaChannel,
        requestor: DmaRequestor,
    ) -> Result<(), DmaError>;

    /// Arm a transfer of `len` bytes at local address `addr`.
    fn transfer(&self, channel: DmaChannel, addr: usize, len: usize) -> Result<(), DmaError>;

    fn status(&self, channel: DmaChannel) -> DmaStatus;

    fn free_channel(&self, channel: DmaChannel);
}

/// Erase granularities a flash device may support.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EraseSize {
    Sector4K,
    Block32K,
    Block64K,
}

impl EraseSize {
    pub const fn bytes(self) -> u32 {
        match self {
            EraseSize::Sector4K => 4 * 1024,
            EraseSize::Block32K => 32 * 1024,
            EraseSize::Block64K => 64 * 1024,
        }
    }

    /// Bit of this size in an [`EraseSizes`] mask.
    pub const fn mask(self) -> u8 {
        match self {
            EraseSize::Sector4K => 1 << 0,
            EraseSize::Block32K => 1 << 1,
            EraseSize::Block64K => 1 << 2,
        }
    }
}

/// Set of supported erase sizes, laid out like the FLASHCFG erase-size field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EraseSizes(pub u8);

impl EraseSizes {
    pub const ALL: EraseSizes = EraseSizes(0b111);

    pub const fn contains(self, size: EraseSize) -> bool {
        self.0 & size.mask() != 0
    }

    pub const fn with(self, size: EraseSize) -> EraseSizes {
        EraseSizes(self.0 | size.mask())
    }

    pub const fn intersect(self, other: EraseSizes) -> EraseSizes {
        EraseSizes(self.0 & other.0)
    }
}

/// Physical flash behind the target-attached flash channel.
pub trait FlashDevice {
    fn read(&self, offset: u32, buf: &mut [u8]) -> Result<(), EspiError>;

    /// Program bytes within a single page.
    fn write_page(&self, offset: u32, data: &[u8]) -> Result<(), EspiError>;

    /// Erase the block of `size` containing `offset`.
    fn erase(&self, offset: u32, size: EraseSize) -> Result<(), EspiError>;

    fn is_busy(&self) -> bool;

    fn page_size(&self) -> usize;

    fn capacity(&self) -> usize;

    fn erase_sizes(&self) -> EraseSizes;
}

/// Completion of a bus-master request issued in interrupt mode.
pub trait PcBmClient {
    /// `result` carries the number of bytes moved.
    fn request_done(&self, buf: &'static mut [u8], result: Result<usize, EspiError>);
}

/// Completion of a master-attached flash request issued in interrupt mode.
pub trait FlashClient {
    fn request_done(&self, buf: &'static mut [u8], result: Result<usize, EspiError>);
}

/// Notification that a host flash request was parsed and checked.
pub trait TafClient {
    fn request_handled(&self, request: &TafRequest, status: TafStatus);
}

/// Events the dispatcher reports that have no dedicated channel handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EspiEvent {
    BusError(u32),
    EspiReset,
    PlatformReset,
    InBandReset,
    ConfigUpdate,
    PeripheralAccess,
    DeferredAccess,
    FlashReadDetected,
    PeripheralMessage,
}

pub trait EspiClient {
    fn event(&self, event: EspiEvent);
}
