/*++

Licensed under the Apache-2.0 license.

File Name:

    dma.rs

Abstract:

    File contains the emulated DMA engine that moves burst data between the
    emulated eSPI controller FIFOs and local memory.

--*/

use espi_driver::hil::{
    DmaAdapter, DmaChannel, DmaDirection, DmaError, DmaRequestor, DmaStatus, DmaWidth,
};
use log::{debug, warn};
use std::cell::{Cell, RefCell};

pub const DMA_CHANNELS: usize = 2;

#[derive(Clone, Copy)]
struct ChannelCtx {
    width: DmaWidth,
    direction: Option<DmaDirection>,
    requestor: Option<DmaRequestor>,
    addr: usize,
    len: usize,
    status: DmaStatus,
}

impl ChannelCtx {
    fn new(width: DmaWidth) -> Self {
        Self {
            width,
            direction: None,
            requestor: None,
            addr: 0,
            len: 0,
            status: DmaStatus::Idle,
        }
    }
}

#[derive(Default)]
pub struct EmulatedDma {
    channels: RefCell<[Option<ChannelCtx>; DMA_CHANNELS]>,
    fail_transfers: Cell<bool>,
    transfers: Cell<usize>,
}

impl EmulatedDma {
    /// Makes every following transfer end in [`DmaStatus::Error`].
    pub fn fail_transfers(&self, fail: bool) {
        self.fail_transfers.set(fail);
    }

    /// Number of transfers that moved data.
    pub fn transfers(&self) -> usize {
        self.transfers.get()
    }

    pub fn channels_in_use(&self) -> usize {
        self.channels.borrow().iter().filter(|c| c.is_some()).count()
    }

    fn armed(
        &self,
        requestor: DmaRequestor,
        direction: DmaDirection,
    ) -> Option<(usize, ChannelCtx)> {
        self.channels
            .borrow()
            .iter()
            .enumerate()
            .find_map(|(index, ctx)| match ctx {
                Some(ctx)
                    if ctx.requestor == Some(requestor)
                        && ctx.direction == Some(direction)
                        && ctx.status == DmaStatus::Busy =>
                {
                    Some((index, *ctx))
                }
                _ => None,
            })
    }

    fn finish(&self, index: usize, status: DmaStatus) {
        if let Some(ctx) = self.channels.borrow_mut()[index].as_mut() {
            ctx.status = status;
        }
    }

    /// Writes `bytes` from a controller FIFO into the memory armed by the
    /// channel bound to `requestor`. Returns false when no channel is armed.
    pub fn deliver(&self, requestor: DmaRequestor, bytes: &[u8]) -> bool {
        let Some((index, ctx)) = self.armed(requestor, DmaDirection::ToMemory) else {
            warn!("[dma] nothing armed for {:?}", requestor);
            return false;
        };
        if self.fail_transfers.get() {
            self.finish(index, DmaStatus::Error);
            return true;
        }
        let len = bytes.len().min(ctx.len);
        // SAFETY: `addr` and `len` come from `transfer`, which the eSPI
        // driver arms with a buffer it owns and does not touch until the
        // channel is released.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), ctx.addr as *mut u8, len);
        }
        self.transfers.set(self.transfers.get() + 1);
        debug!("[dma] ch{} delivered {} bytes", index, len);
        self.finish(index, DmaStatus::Done);
        true
    }

    /// Reads `len` bytes of local memory for a controller FIFO.
    pub fn fetch(&self, requestor: DmaRequestor, len: usize) -> Option<Vec<u8>> {
        let (index, ctx) = self.armed(requestor, DmaDirection::FromMemory)?;
        if self.fail_transfers.get() {
            self.finish(index, DmaStatus::Error);
            return None;
        }
        let len = len.min(ctx.len);
        let mut out = vec![0u8; len];
        // SAFETY: see `deliver`.
        unsafe {
            std::ptr::copy_nonoverlapping(ctx.addr as *const u8, out.as_mut_ptr(), len);
        }
        self.transfers.set(self.transfers.get() + 1);
        debug!("[dma] ch{} fetched {} bytes", index, len);
        self.finish(index, DmaStatus::Done);
        Some(out)
    }

    fn with_channel<T>(
        &self,
        channel: DmaChannel,
        f: impl FnOnce(&mut ChannelCtx) -> Result<T, DmaError>,
    ) -> Result<T, DmaError> {
        let mut channels = self.channels.borrow_mut();
        let ctx = channels
            .get_mut(channel.0 as usize)
            .and_then(|c| c.as_mut())
            .ok_or(DmaError::InvalidConfig)?;
        f(ctx)
    }
}

impl DmaAdapter for EmulatedDma {
    fn alloc_channel(&self, width: DmaWidth) -> Result<DmaChannel, DmaError> {
        let mut channels = self.channels.borrow_mut();
        let index = channels
            .iter()
            .position(|c| c.is_none())
            .ok_or(DmaError::NoChannel)?;
        channels[index] = Some(ChannelCtx::new(width));
        Ok(DmaChannel(index as u8))
    }

    fn config(
        &self,
        channel: DmaChannel,
        width: DmaWidth,
        direction: DmaDirection,
    ) -> Result<(), DmaError> {
        self.with_channel(channel, |ctx| {
            ctx.width = width;
            ctx.direction = Some(direction);
            Ok(())
        })
    }

    fn config_requestor(
        &self,
        channel: DmaChannel,
        requestor: DmaRequestor,
    ) -> Result<(), DmaError> {
        self.with_channel(channel, |ctx| {
            ctx.requestor = Some(requestor);
            Ok(())
        })
    }

    fn transfer(&self, channel: DmaChannel, addr: usize, len: usize) -> Result<(), DmaError> {
        self.with_channel(channel, |ctx| {
            if ctx.direction.is_none() || ctx.requestor.is_none() {
                return Err(DmaError::InvalidConfig);
            }
            if addr % ctx.width.bytes() != 0 {
                return Err(DmaError::InvalidConfig);
            }
            ctx.addr = addr;
            ctx.len = len;
            ctx.status = DmaStatus::Busy;
            Ok(())
        })
    }

    fn status(&self, channel: DmaChannel) -> DmaStatus {
        self.channels
            .borrow()
            .get(channel.0 as usize)
            .and_then(|c| c.as_ref())
            .map_or(DmaStatus::Idle, |ctx| ctx.status)
    }

    fn free_channel(&self, channel: DmaChannel) {
        if let Some(slot) = self.channels.borrow_mut().get_mut(channel.0 as usize) {
            *slot = None;
        }
    }
}
