// Licensed under the Apache-2.0 license

use crate::hil::DmaError;
use thiserror::Error;

/// Problems found while parsing a completion packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("completion tag {got} does not match request tag {expected}")]
    TagMismatch { expected: u8, got: u8 },
    #[error("unexpected completion type {0:#04x}")]
    TypeMismatch(u8),
    #[error("completion carries {got} bytes, expected {expected}")]
    LengthMismatch { expected: usize, got: usize },
    #[error("segmented completion where a single packet was expected")]
    UnexpectedSegment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EspiError {
    #[error("invalid transfer size")]
    InvalidSize,
    #[error("unaligned buffer or offset")]
    Unaligned,
    #[error("unsupported request type")]
    InvalidType,
    #[error("buffer too small for the transfer")]
    BufferTooSmall,
    #[error("invalid protection region")]
    InvalidRegion,
    #[error("channel busy")]
    Busy,
    #[error("channel disabled")]
    ChannelDisabled,
    #[error("protection region is locked")]
    RegionLocked,
    #[error("protocol error: {0}")]
    Protocol(ProtocolError),
    #[error("unsuccessful completion")]
    UnsuccessfulCompletion,
    #[error("burst failed at transaction {transaction} (mask {mask:#x})")]
    BurstError { transaction: u32, mask: u32 },
    #[error("automatic mode failed (mask {mask:#x})")]
    AutoModeError { mask: u32 },
    #[error("dma error: {0:?}")]
    Dma(DmaError),
    #[error("flash device error")]
    FlashDevice,
    #[error("timed out")]
    Timeout,
    #[error("aborted by reset")]
    Aborted,
    #[error("access denied")]
    AccessDenied,
}

impl From<ProtocolError> for EspiError {
    fn from(err: ProtocolError) -> Self {
        EspiError::Protocol(err)
    }
}

impl From<DmaError> for EspiError {
    fn from(err: DmaError) -> Self {
        EspiError::Dma(err)
    }
}

/// Caller-visible state of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Status {
    #[default]
    Ok,
    Busy,
    Failed,
}

/// Outcome of a target-attached flash request, reported to the host in the
/// completion code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TafStatus {
    #[default]
    Ok,
    Failed,
    InvalidDataSize,
    InvalidType,
    AccessDenied,
}

impl TafStatus {
    pub fn is_ok(self) -> bool {
        self == TafStatus::Ok
    }
}
