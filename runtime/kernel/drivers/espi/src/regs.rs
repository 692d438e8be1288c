// Licensed under the Apache-2.0 license

//! Register map of the eSPI slave controller and the typed access layer every
//! channel engine goes through.
//!
//! Hardware access is funneled through [`EspiBus`], a word-level read/write
//! seam. [`RegisterAccess`] layers tock-registers fields on top of it so that
//! read-modify-write of a named bit range is checked against the register it
//! belongs to at compile time. The emulator implements [`EspiBus`] directly,
//! production code uses [`MmioBus`].

use core::marker::PhantomData;
use tock_registers::fields::{Field, FieldValue};
use tock_registers::{register_bitfields, LocalRegisterCopy, RegisterLongName};

/// Number of 32-bit words in each transmit/receive window.
pub const BUF_WORDS: usize = 20;
/// Size of each transmit/receive window in bytes.
pub const BUF_BYTES: usize = BUF_WORDS * 4;
/// Number of flash protection region slots.
pub const PROTECTION_REGIONS: usize = 16;

register_bitfields! [
    u32,
    pub EspiCfg [
        PcEn OFFSET(0) NUMBITS(1) [],
        VwEn OFFSET(1) NUMBITS(1) [],
        OobEn OFFSET(2) NUMBITS(1) [],
        FlashEn OFFSET(3) NUMBITS(1) [],
        BmEn OFFSET(4) NUMBITS(1) [],
        PcReady OFFSET(8) NUMBITS(1) [],
        FlashReady OFFSET(11) NUMBITS(1) [],
        PcMaxPayload OFFSET(12) NUMBITS(3) [],
    ],
    pub EspiSts [
        Berr OFFSET(0) NUMBITS(1) [],
        EspiRst OFFSET(1) NUMBITS(1) [],
        PltRst OFFSET(2) NUMBITS(1) [],
        CfgUpd OFFSET(3) NUMBITS(1) [],
        FlashRx OFFSET(4) NUMBITS(1) [],
        AmDone OFFSET(5) NUMBITS(1) [],
        AmErr OFFSET(6) NUMBITS(1) [],
        OobRx OFFSET(7) NUMBITS(1) [],
        VwUpd OFFSET(8) NUMBITS(1) [],
        PerAcc OFFSET(9) NUMBITS(1) [],
        Dfrd OFFSET(10) NUMBITS(1) [],
        FltVw OFFSET(11) NUMBITS(1) [],
        SFlashRd OFFSET(12) NUMBITS(1) [],
        IbRst OFFSET(13) NUMBITS(1) [],
        BmBurstDone OFFSET(14) NUMBITS(1) [],
        BmWBurstDone OFFSET(15) NUMBITS(1) [],
        BmBurstErr OFFSET(16) NUMBITS(1) [],
        PMsgRx OFFSET(17) NUMBITS(1) [],
        BmTxDone OFFSET(18) NUMBITS(1) [],
        PbmRx OFFSET(19) NUMBITS(1) [],
    ],
    pub FlashCfg [
        MaxPayload OFFSET(0) NUMBITS(3) [],
        MaxReadReq OFFSET(4) NUMBITS(3) [],
        TafMode OFFSET(8) NUMBITS(1) [],
        EraseSizes OFFSET(9) NUMBITS(3) [],
        TagMode OFFSET(12) NUMBITS(1) [
            Tag16 = 0,
            Tag2 = 1
        ],
    ],
    pub FlashCtl [
        TxAvail OFFSET(0) NUMBITS(1) [],
        NpFree OFFSET(1) NUMBITS(1) [],
        AutoEn OFFSET(2) NUMBITS(1) [],
        Strip OFFSET(3) NUMBITS(1) [],
        DmaEn OFFSET(4) NUMBITS(1) [],
        BufRst OFFSET(5) NUMBITS(1) [],
        AutoCnt OFFSET(8) NUMBITS(8) [],
    ],
    pub FlashAccCtl [
        AutoRdDisCtl OFFSET(0) NUMBITS(1) [],
        AutoRdDisSts OFFSET(1) NUMBITS(1) [],
        BlockNpFree OFFSET(2) NUMBITS(1) [],
        AutoRdPend OFFSET(3) NUMBITS(1) [],
        ResPend OFFSET(4) NUMBITS(1) [],
    ],
    pub ErrMask [
        UnsucCpl OFFSET(0) NUMBITS(1) [],
        ProtErr OFFSET(1) NUMBITS(1) [],
        Malformed OFFSET(2) NUMBITS(1) [],
        TagErr OFFSET(3) NUMBITS(1) [],
        BufOvf OFFSET(4) NUMBITS(1) [],
        CplTimeout OFFSET(5) NUMBITS(1) [],
    ],
    pub PrtrBaddr [
        Rpr OFFSET(0) NUMBITS(1) [],
        Wpr OFFSET(1) NUMBITS(1) [],
        Lock OFFSET(2) NUMBITS(1) [],
        Base OFFSET(12) NUMBITS(20) [],
    ],
    pub PrtrHaddr [
        Top OFFSET(12) NUMBITS(20) [],
    ],
    pub RgnTagOvr [
        Tags OFFSET(0) NUMBITS(16) [],
    ],
    pub BmCfg [
        MaxTrans OFFSET(0) NUMBITS(8) [],
    ],
    pub BmCtl [
        TxAvail OFFSET(0) NUMBITS(1) [],
        AutoEn OFFSET(1) NUMBITS(1) [],
        AutoDir OFFSET(2) NUMBITS(1) [
            Read = 0,
            Write = 1
        ],
        Strip OFFSET(3) NUMBITS(1) [],
        DmaEn OFFSET(4) NUMBITS(1) [],
        BufRst OFFSET(5) NUMBITS(1) [],
        TransCnt OFFSET(8) NUMBITS(8) [],
    ],
];

/// Identifies one 32-bit register of the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RegId {
    EspiCfg,
    EspiIe,
    EspiWe,
    EspiSts,
    EspiErr,
    FlashCfg,
    FlashCtl,
    FlashAutoAddr,
    FlashBase,
    FlashAccCtl,
    FlashErr,
    FlashAutoData,
    FlashAutoLvl,
    FlashPrtrBaddr(u8),
    FlashPrtrHaddr(u8),
    FlashRgnTagOvr(u8),
    FlashRxBuf(u8),
    FlashTxBuf(u8),
    BmCfg,
    BmCtl,
    BmErr,
    BmAutoAddrLo,
    BmAutoAddrHi,
    BmAutoCnt,
    BmAutoData,
    BmAutoLvl,
    PbmTxBuf(u8),
    PbmRxBuf(u8),
}

impl RegId {
    /// Byte offset of the register from the controller base.
    pub const fn offset(self) -> usize {
        match self {
            RegId::EspiCfg => 0x000,
            RegId::EspiIe => 0x004,
            RegId::EspiWe => 0x008,
            RegId::EspiSts => 0x00c,
            RegId::EspiErr => 0x010,
            RegId::FlashCfg => 0x020,
            RegId::FlashCtl => 0x024,
            RegId::FlashAutoAddr => 0x028,
            RegId::FlashBase => 0x02c,
            RegId::FlashAccCtl => 0x030,
            RegId::FlashErr => 0x034,
            RegId::FlashAutoData => 0x038,
            RegId::FlashAutoLvl => 0x03c,
            RegId::FlashPrtrBaddr(i) => 0x040 + 4 * i as usize,
            RegId::FlashPrtrHaddr(i) => 0x080 + 4 * i as usize,
            RegId::FlashRgnTagOvr(i) => 0x0c0 + 4 * i as usize,
            RegId::FlashRxBuf(i) => 0x100 + 4 * i as usize,
            RegId::FlashTxBuf(i) => 0x180 + 4 * i as usize,
            RegId::BmCfg => 0x200,
            RegId::BmCtl => 0x204,
            RegId::BmErr => 0x208,
            RegId::BmAutoAddrLo => 0x20c,
            RegId::BmAutoAddrHi => 0x210,
            RegId::BmAutoCnt => 0x214,
            RegId::BmAutoData => 0x218,
            RegId::BmAutoLvl => 0x21c,
            RegId::PbmTxBuf(i) => 0x240 + 4 * i as usize,
            RegId::PbmRxBuf(i) => 0x2c0 + 4 * i as usize,
        }
    }
}

/// A register tagged with the bitfield layout that applies to it.
pub struct Reg<R: RegisterLongName = ()> {
    id: RegId,
    _layout: PhantomData<R>,
}

impl<R: RegisterLongName> Clone for Reg<R> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<R: RegisterLongName> Copy for Reg<R> {}

impl<R: RegisterLongName> Reg<R> {
    pub const fn new(id: RegId) -> Self {
        Reg {
            id,
            _layout: PhantomData,
        }
    }

    pub const fn id(&self) -> RegId {
        self.id
    }
}

pub const ESPICFG: Reg<EspiCfg::Register> = Reg::new(RegId::EspiCfg);
pub const ESPIIE: Reg<EspiSts::Register> = Reg::new(RegId::EspiIe);
pub const ESPIWE: Reg<EspiSts::Register> = Reg::new(RegId::EspiWe);
pub const ESPISTS: Reg<EspiSts::Register> = Reg::new(RegId::EspiSts);
pub const ESPIERR: Reg = Reg::new(RegId::EspiErr);
pub const FLASHCFG: Reg<FlashCfg::Register> = Reg::new(RegId::FlashCfg);
pub const FLASHCTL: Reg<FlashCtl::Register> = Reg::new(RegId::FlashCtl);
pub const FLASHAUTOADDR: Reg = Reg::new(RegId::FlashAutoAddr);
pub const FLASHBASE: Reg = Reg::new(RegId::FlashBase);
pub const FLASHACCCTL: Reg<FlashAccCtl::Register> = Reg::new(RegId::FlashAccCtl);
pub const FLASHERR: Reg<ErrMask::Register> = Reg::new(RegId::FlashErr);
pub const FLASHAUTODATA: Reg = Reg::new(RegId::FlashAutoData);
pub const FLASHAUTOLVL: Reg = Reg::new(RegId::FlashAutoLvl);
pub const BMCFG: Reg<BmCfg::Register> = Reg::new(RegId::BmCfg);
pub const BMCTL: Reg<BmCtl::Register> = Reg::new(RegId::BmCtl);
pub const BMERR: Reg<ErrMask::Register> = Reg::new(RegId::BmErr);
pub const BMAUTOADDR_LO: Reg = Reg::new(RegId::BmAutoAddrLo);
pub const BMAUTOADDR_HI: Reg = Reg::new(RegId::BmAutoAddrHi);
pub const BMAUTOCNT: Reg = Reg::new(RegId::BmAutoCnt);
pub const BMAUTODATA: Reg = Reg::new(RegId::BmAutoData);
pub const BMAUTOLVL: Reg = Reg::new(RegId::BmAutoLvl);

pub const fn flash_prtr_baddr(slot: usize) -> Reg<PrtrBaddr::Register> {
    Reg::new(RegId::FlashPrtrBaddr(slot as u8))
}

pub const fn flash_prtr_haddr(slot: usize) -> Reg<PrtrHaddr::Register> {
    Reg::new(RegId::FlashPrtrHaddr(slot as u8))
}

pub const fn flash_rgn_tag_ovr(slot: usize) -> Reg<RgnTagOvr::Register> {
    Reg::new(RegId::FlashRgnTagOvr(slot as u8))
}

/// A transmit or receive window made of [`BUF_WORDS`] consecutive registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Window {
    FlashRx,
    FlashTx,
    PbmRx,
    PbmTx,
}

impl Window {
    fn word(self, index: usize) -> RegId {
        let index = index as u8;
        match self {
            Window::FlashRx => RegId::FlashRxBuf(index),
            Window::FlashTx => RegId::FlashTxBuf(index),
            Window::PbmRx => RegId::PbmRxBuf(index),
            Window::PbmTx => RegId::PbmTxBuf(index),
        }
    }
}

/// Word-level access to the controller. This is the seam the emulator plugs
/// into.
pub trait EspiBus {
    fn read(&self, reg: RegId) -> u32;
    fn write(&self, reg: RegId, value: u32);
}

/// Field-level helpers shared by every engine.
pub trait RegisterAccess: EspiBus {
    fn get<R: RegisterLongName>(&self, reg: Reg<R>) -> LocalRegisterCopy<u32, R> {
        LocalRegisterCopy::new(self.read(reg.id()))
    }

    fn get_raw<R: RegisterLongName>(&self, reg: Reg<R>) -> u32 {
        self.read(reg.id())
    }

    fn set<R: RegisterLongName>(&self, reg: Reg<R>, value: FieldValue<u32, R>) {
        self.write(reg.id(), value.value);
    }

    fn set_raw<R: RegisterLongName>(&self, reg: Reg<R>, value: u32) {
        self.write(reg.id(), value);
    }

    fn modify<R: RegisterLongName>(&self, reg: Reg<R>, value: FieldValue<u32, R>) {
        let current = self.read(reg.id());
        self.write(reg.id(), value.modify(current));
    }

    fn is_set<R: RegisterLongName>(&self, reg: Reg<R>, field: Field<u32, R>) -> bool {
        field.is_set(self.read(reg.id()))
    }

    fn read_field<R: RegisterLongName>(&self, reg: Reg<R>, field: Field<u32, R>) -> u32 {
        field.read(self.read(reg.id()))
    }

    /// Acknowledges status bits. ESPISTS, BMERR and FLASHERR are
    /// write-1-to-clear, so only the given bits are written.
    fn clear_status<R: RegisterLongName>(&self, reg: Reg<R>, bits: u32) {
        if bits != 0 {
            self.write(reg.id(), bits);
        }
    }

    /// Copies `bytes` into a transmit window, packing them little-endian into
    /// words. Bytes past the end of the window are dropped.
    fn write_window(&self, window: Window, bytes: &[u8]) {
        for (index, chunk) in bytes.chunks(4).take(BUF_WORDS).enumerate() {
            let mut word = [0u8; 4];
            word[..chunk.len()].copy_from_slice(chunk);
            self.write(window.word(index), u32::from_le_bytes(word));
        }
    }

    /// Fills `out` from a receive window.
    fn read_window(&self, window: Window, out: &mut [u8]) {
        for (index, chunk) in out.chunks_mut(4).take(BUF_WORDS).enumerate() {
            let word = self.read(window.word(index)).to_le_bytes();
            let len = chunk.len();
            chunk.copy_from_slice(&word[..len]);
        }
    }
}

impl<T: EspiBus + ?Sized> RegisterAccess for T {}

/// Memory-mapped access to a physical controller.
pub struct MmioBus {
    base: usize,
}

impl MmioBus {
    /// # Safety
    ///
    /// `base` must be the address of an eSPI controller register block that
    /// stays mapped for the lifetime of the returned value, and no other code
    /// may access the block concurrently.
    pub const unsafe fn new(base: usize) -> Self {
        MmioBus { base }
    }
}

impl EspiBus for MmioBus {
    fn read(&self, reg: RegId) -> u32 {
        let addr = (self.base + reg.offset()) as *const u32;
        // SAFETY: `new` requires `base` to point at a mapped register block,
        // and every `RegId` offset lies within that block.
        unsafe { core::ptr::read_volatile(addr) }
    }

    fn write(&self, reg: RegId, value: u32) {
        let addr = (self.base + reg.offset()) as *mut u32;
        // SAFETY: see `read`.
        unsafe { core::ptr::write_volatile(addr, value) }
    }
}
