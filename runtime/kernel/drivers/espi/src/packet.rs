// Licensed under the Apache-2.0 license

//! Transaction header codec shared by the bus-master and flash channels.
//!
//! Every packet starts with a three byte common header: the cycle type (or
//! completion code), the tag in the high nibble of byte 1 together with bits
//! 11:8 of the payload length, and the low length byte. Requests follow it
//! with a little-endian address field whose width depends on the cycle type.

use crate::error::{EspiError, ProtocolError};
use bitfield::bitfield;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use zerocopy::{FromBytes, Immutable, IntoBytes};

pub const COMMON_HEADER_LEN: usize = 3;
pub const COMPLETION_HEADER_LEN: usize = COMMON_HEADER_LEN;
pub const MAX_LENGTH: usize = 0xfff;
pub const SECTOR_SIZE: usize = 4096;
pub const LTR_MESSAGE_CODE: u8 = 0x14;

bitfield! {
    #[repr(C)]
    #[derive(Copy, Clone, FromBytes, IntoBytes, Immutable, PartialEq)]
    pub struct CommonHeader([u8]);
    impl Debug;
    pub u8, cycle_type, set_cycle_type: 7, 0;
    pub u8, len_hi, set_len_hi: 11, 8;
    pub u8, tag, set_tag: 15, 12;
    pub u8, len_lo, set_len_lo: 23, 16;
}

impl CommonHeader<[u8; COMMON_HEADER_LEN]> {
    pub fn new(cycle_type: u8, tag: u8, length: usize) -> Self {
        let mut header = CommonHeader([0; COMMON_HEADER_LEN]);
        header.set_cycle_type(cycle_type);
        header.set_tag(tag & 0xf);
        header.set_length(length);
        header
    }

    pub fn length(&self) -> usize {
        ((self.len_hi() as usize) << 8) | self.len_lo() as usize
    }

    /// The header as it goes on the wire.
    pub fn bytes(&self) -> [u8; COMMON_HEADER_LEN] {
        self.0
    }

    pub fn set_length(&mut self, length: usize) {
        self.set_len_hi(((length >> 8) & 0xf) as u8);
        self.set_len_lo((length & 0xff) as u8);
    }

    pub fn decode(buf: &[u8]) -> Result<Self, EspiError> {
        Ok(Self::read_from_prefix(buf)
            .map_err(|_| EspiError::BufferTooSmall)?
            .0)
    }

    pub fn encode(&self, buf: &mut [u8]) -> Result<usize, EspiError> {
        self.write_to_prefix(buf)
            .map_err(|_| EspiError::BufferTooSmall)
            .map(|_| COMMON_HEADER_LEN)
    }
}

bitfield! {
    /// Latency tolerance report carried in the message-specific field.
    #[derive(Copy, Clone, PartialEq, Eq)]
    pub struct LtrMessage(u16);
    impl Debug;
    pub u16, latency, set_latency: 9, 0;
    pub u8, scale, set_scale: 12, 10;
    pub requirement, set_requirement: 15;
}

impl LtrMessage {
    pub fn new(requirement: bool, scale: u8, latency: u16) -> Self {
        let mut msg = LtrMessage(0);
        msg.set_requirement(requirement);
        msg.set_scale(scale);
        msg.set_latency(latency);
        msg
    }

    pub fn bits(&self) -> u16 {
        self.0
    }
}

impl Default for LtrMessage {
    fn default() -> Self {
        LtrMessage(0)
    }
}

/// Peripheral-channel cycle types used for bus mastering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum CycleType {
    MemRead32 = 0x00,
    MemWrite32 = 0x01,
    MemRead64 = 0x02,
    MemWrite64 = 0x03,
    Message = 0x10,
}

/// Flash-channel request types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum FlashCycleType {
    Read = 0x00,
    Write = 0x01,
    Erase = 0x02,
    RpmcOp1 = 0x03,
    RpmcOp2 = 0x04,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum CompletionCode {
    SuccessNoData = 0x06,
    Unsuccessful = 0x08,
    SuccessData = 0x09,
    SuccessDataFirst = 0x0b,
    SuccessDataMiddle = 0x0d,
    SuccessDataLast = 0x0f,
}

impl CompletionCode {
    const FIRST: u8 = 0x02;
    const MIDDLE: u8 = 0x04;
    const LAST: u8 = 0x06;

    /// Code for packet `index` of a data response split into `count` packets.
    pub fn for_segment(index: usize, count: usize) -> CompletionCode {
        let base = CompletionCode::SuccessData as u8;
        let code = if count <= 1 {
            base
        } else if index == 0 {
            base | Self::FIRST
        } else if index + 1 >= count {
            base | Self::LAST
        } else {
            base | Self::MIDDLE
        };
        // Every value produced above is a declared variant.
        CompletionCode::try_from(code).unwrap_or(CompletionCode::SuccessData)
    }

    pub fn carries_data(self) -> bool {
        matches!(
            self,
            CompletionCode::SuccessData
                | CompletionCode::SuccessDataFirst
                | CompletionCode::SuccessDataMiddle
                | CompletionCode::SuccessDataLast
        )
    }
}

/// Address field that follows the common header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Address {
    None,
    Addr32(u32),
    Addr64(u64),
    Message { code: u8, value: u32 },
}

/// Width class of an address field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressKind {
    None,
    Addr32,
    Addr64,
    Message,
}

impl AddressKind {
    pub const fn len(self) -> usize {
        match self {
            AddressKind::None => 0,
            AddressKind::Addr32 => 4,
            AddressKind::Addr64 => 8,
            AddressKind::Message => 5,
        }
    }

    /// Address layout of a bus-master request.
    pub fn for_cycle(cycle: CycleType) -> AddressKind {
        match cycle {
            CycleType::MemRead32 | CycleType::MemWrite32 => AddressKind::Addr32,
            CycleType::MemRead64 | CycleType::MemWrite64 => AddressKind::Addr64,
            CycleType::Message => AddressKind::Message,
        }
    }
}

impl Address {
    pub fn kind(&self) -> AddressKind {
        match self {
            Address::None => AddressKind::None,
            Address::Addr32(_) => AddressKind::Addr32,
            Address::Addr64(_) => AddressKind::Addr64,
            Address::Message { .. } => AddressKind::Message,
        }
    }
}

/// Size of a complete header for the given address layout.
pub const fn header_len(kind: AddressKind) -> usize {
    COMMON_HEADER_LEN + kind.len()
}

/// A decoded transaction header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub cycle_type: u8,
    pub tag: u8,
    pub length: usize,
    pub address: Address,
}

impl Header {
    pub fn len(&self) -> usize {
        header_len(self.address.kind())
    }

    pub fn encode(&self, buf: &mut [u8]) -> Result<usize, EspiError> {
        if self.tag > 0xf || self.length > MAX_LENGTH {
            return Err(EspiError::InvalidSize);
        }
        let total = self.len();
        if buf.len() < total {
            return Err(EspiError::BufferTooSmall);
        }
        CommonHeader::new(self.cycle_type, self.tag, self.length).encode(buf)?;
        let field = &mut buf[COMMON_HEADER_LEN..total];
        match self.address {
            Address::None => {}
            Address::Addr32(addr) => field.copy_from_slice(&addr.to_le_bytes()),
            Address::Addr64(addr) => field.copy_from_slice(&addr.to_le_bytes()),
            Address::Message { code, value } => {
                field[0] = code;
                field[1..].copy_from_slice(&value.to_le_bytes());
            }
        }
        Ok(total)
    }

    pub fn decode(buf: &[u8], kind: AddressKind) -> Result<Self, EspiError> {
        let common = CommonHeader::decode(buf)?;
        if buf.len() < header_len(kind) {
            return Err(EspiError::BufferTooSmall);
        }
        let field = &buf[COMMON_HEADER_LEN..header_len(kind)];
        let address = match kind {
            AddressKind::None => Address::None,
            AddressKind::Addr32 => Address::Addr32(u32::from_le_bytes(
                field.try_into().map_err(|_| EspiError::BufferTooSmall)?,
            )),
            AddressKind::Addr64 => Address::Addr64(u64::from_le_bytes(
                field.try_into().map_err(|_| EspiError::BufferTooSmall)?,
            )),
            AddressKind::Message => Address::Message {
                code: field[0],
                value: u32::from_le_bytes(
                    field[1..].try_into().map_err(|_| EspiError::BufferTooSmall)?,
                ),
            },
        };
        Ok(Header {
            cycle_type: common.cycle_type(),
            tag: common.tag(),
            length: common.length(),
            address,
        })
    }
}

/// Puts a latency tolerance report into a message header.
pub fn set_ltr_msg_hdr(header: &mut Header, ltr: LtrMessage) {
    header.cycle_type = CycleType::Message.into();
    header.length = 0;
    header.address = Address::Message {
        code: LTR_MESSAGE_CODE,
        value: ltr.bits() as u32,
    };
}

/// Payload size encoded in a max-payload capability field.
pub fn max_payload(code: u32) -> usize {
    match code {
        0 => 16,
        1 => 64,
        2 => 128,
        3 => 256,
        _ => 64,
    }
}

/// Read request size encoded in a max-read-request capability field.
pub fn max_read_request(code: u32) -> usize {
    match code {
        1..=7 => 64 << (code - 1),
        _ => 64,
    }
}

/// Largest chunk starting at `offset` that moves at most `max` of the
/// `remaining` bytes without crossing a `boundary`-sized block.
pub fn chunk_len(offset: u64, remaining: usize, boundary: usize, max: usize) -> usize {
    let to_boundary = boundary - (offset % boundary as u64) as usize;
    remaining.min(max).min(to_boundary)
}

/// Cycling per-channel tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TagCounter {
    value: u8,
    modulus: u8,
}

impl TagCounter {
    pub const fn new(modulus: u8) -> Self {
        TagCounter { value: 0, modulus }
    }

    pub fn current(&self) -> u8 {
        self.value
    }

    pub fn modulus(&self) -> u8 {
        self.modulus
    }

    pub fn advance(&mut self) {
        self.advance_by(1);
    }

    pub fn advance_by(&mut self, count: usize) {
        let step = (count % self.modulus as usize) as u8;
        self.value = (self.value + step) % self.modulus;
    }

    pub fn reset(&mut self) {
        self.value = 0;
    }
}

/// What a caller expects back from a completion.
#[derive(Debug, Clone, Copy)]
pub struct Expected {
    /// `None` when hardware already matched the tag.
    pub tag: Option<u8>,
    pub length: usize,
    pub with_data: bool,
}

/// Checks a completion header against the outstanding request.
pub fn check_completion(header: &CommonHeader<[u8; 3]>, expected: Expected) -> Result<(), EspiError> {
    let code = CompletionCode::try_from(header.cycle_type())
        .map_err(|_| ProtocolError::TypeMismatch(header.cycle_type()))?;
    if code == CompletionCode::Unsuccessful {
        return Err(EspiError::UnsuccessfulCompletion);
    }
    if code.carries_data() != expected.with_data {
        return Err(ProtocolError::TypeMismatch(code.into()).into());
    }
    if code.carries_data() && code != CompletionCode::SuccessData {
        return Err(ProtocolError::UnexpectedSegment.into());
    }
    if let Some(tag) = expected.tag {
        if header.tag() != tag {
            return Err(ProtocolError::TagMismatch {
                expected: tag,
                got: header.tag(),
            }
            .into());
        }
    }
    let length = if expected.with_data { header.length() } else { 0 };
    if length != expected.length {
        return Err(ProtocolError::LengthMismatch {
            expected: expected.length,
            got: length,
        }
        .into());
    }
    Ok(())
}
