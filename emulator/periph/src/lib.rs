/*++

Licensed under the Apache-2.0 license.

File Name:

    lib.rs

Abstract:

    File contains exports for the eSPI emulator peripheral library.

--*/

mod dma;
mod espi;
mod host;
mod spi_flash;
mod vw;

pub use dma::{EmulatedDma, DMA_CHANNELS};
pub use espi::{
    BurstFault, Completion, EmulatedEspi, EmulatorConfig, Faults, LoggedRequest,
};
pub use host::{FlashImage, HostMemory};
pub use spi_flash::{
    FlashPartInfo, JedecSpiFlashCmd, SpiFlashErr, SpiFlashImpl, SpiFlashInput, SpiNorFlash,
    SUPPORTED_FLASH,
};
pub use vw::{EmulatedClock, EmulatedVw};
