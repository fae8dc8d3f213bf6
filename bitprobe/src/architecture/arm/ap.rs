//! Access port register definitions and AP discovery.

use bitfield::bitfield;
use jep106::JEP106Code;

use super::communication_interface::ArmCommunicationInterface;
use super::{ApAddress, ApRegister, ArmError};

bitfield! {
    /// The identification register of an access port.
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct IDR(u32);
    impl Debug;
    /// Revision of the AP implementation.
    pub u8, revision, _: 31, 28;
    /// JEP106 designer, continuation in [27:24], identity in [23:17].
    pub u8, jep_cc, _: 27, 24;
    pub u8, jep_id, _: 23, 17;
    /// The class of the AP.
    pub u8, class, _: 16, 13;
    /// Designer-assigned variant.
    pub u8, variant, _: 7, 4;
    /// AP type within its class.
    pub u8, ap_type, _: 3, 0;
}

impl From<u32> for IDR {
    fn from(raw: u32) -> Self {
        IDR(raw)
    }
}

impl From<IDR> for u32 {
    fn from(raw: IDR) -> Self {
        raw.0
    }
}

impl ApRegister for IDR {
    const ADDRESS: u8 = 0xFC;
    const NAME: &'static str = "IDR";
}

impl IDR {
    /// Whether any AP is present at all. A missing AP reads IDR as zero.
    pub fn exists(&self) -> bool {
        self.0 != 0
    }

    /// The designer of the AP.
    pub fn designer_code(&self) -> JEP106Code {
        JEP106Code::new(self.jep_cc(), self.jep_id())
    }

    /// The class of the AP.
    pub fn ap_class(&self) -> ApClass {
        ApClass::from_class(self.class())
    }

    /// The bus type of a MEM-AP, meaningless for other classes.
    pub fn memory_ap_type(&self) -> ApType {
        ApType::from_type(self.ap_type())
    }
}

/// The broad class of an access port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApClass {
    /// No defined class; JTAG-AP and other designer-specific ports.
    Undefined,
    /// A COM access port.
    ComAp,
    /// A memory access port; participates in target memory transfers.
    MemAp,
    /// A class value this implementation does not know.
    Unknown(u8),
}

impl ApClass {
    fn from_class(value: u8) -> Self {
        match value {
            0x0 => ApClass::Undefined,
            0x1 => ApClass::ComAp,
            0x8 => ApClass::MemAp,
            other => ApClass::Unknown(other),
        }
    }
}

/// The bus a MEM-AP bridges to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApType {
    /// JTAG connection (type 0x0 in class 0x0).
    JtagComAp,
    /// AMBA AHB3 bus.
    AmbaAhb3,
    /// AMBA APB2 or APB3 bus.
    AmbaApb2Apb3,
    /// AMBA AXI3 or AXI4 bus.
    AmbaAxi3Axi4,
    /// AMBA AHB5 bus.
    AmbaAhb5,
    /// AMBA APB4 or APB5 bus.
    AmbaApb4Apb5,
    /// AMBA AXI5 bus.
    AmbaAxi5,
    /// AMBA AHB5 bus with enhanced HPROT control.
    AmbaAhb5Hprot,
    /// A type value this implementation does not know.
    Unknown(u8),
}

impl ApType {
    fn from_type(value: u8) -> Self {
        match value {
            0x0 => ApType::JtagComAp,
            0x1 => ApType::AmbaAhb3,
            0x2 => ApType::AmbaApb2Apb3,
            0x4 => ApType::AmbaAxi3Axi4,
            0x5 => ApType::AmbaAhb5,
            0x6 => ApType::AmbaApb4Apb5,
            0x7 => ApType::AmbaAxi5,
            0x8 => ApType::AmbaAhb5Hprot,
            other => ApType::Unknown(other),
        }
    }
}

/// The width of a single MEM-AP transfer beat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataSize {
    /// 8 bit.
    U8 = 0b000,
    /// 16 bit.
    U16 = 0b001,
    /// 32 bit.
    #[default]
    U32 = 0b010,
    /// 64 bit, only on capable APs.
    U64 = 0b011,
}

impl DataSize {
    /// Number of bytes moved per DRW beat.
    pub fn bytes(self) -> usize {
        match self {
            DataSize::U8 => 1,
            DataSize::U16 => 2,
            DataSize::U32 => 4,
            DataSize::U64 => 8,
        }
    }
}

/// TAR auto-increment behaviour across DRW accesses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AddressIncrement {
    /// TAR stays put.
    Off = 0b00,
    /// TAR advances by the transfer size after every access.
    #[default]
    Single = 0b01,
    /// Packed transfers; not used by this implementation.
    Packed = 0b10,
}

bitfield! {
    /// The control and status word of a MEM-AP.
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct CSW(u32);
    impl Debug;
    /// Debug software access enable.
    pub dbg_sw_enable, set_dbg_sw_enable: 31;
    /// Bus access protection control.
    pub u8, prot, set_prot: 30, 24;
    /// Secure debug enabled.
    pub spiden, _: 23;
    /// Memory tagging access.
    pub u8, mode, set_mode: 11, 8;
    /// A transfer is in progress on the bus.
    pub tr_in_prog, _: 7;
    /// The connection to the memory system is enabled.
    pub device_en, _: 6;
    /// Address auto-increment mode.
    pub u8, addr_inc, set_addr_inc: 5, 4;
    /// Transfer size.
    pub u8, size, set_size: 2, 0;
}

impl From<u32> for CSW {
    fn from(raw: u32) -> Self {
        CSW(raw)
    }
}

impl From<CSW> for u32 {
    fn from(raw: CSW) -> Self {
        raw.0
    }
}

impl ApRegister for CSW {
    const ADDRESS: u8 = 0x00;
    const NAME: &'static str = "CSW";
}

impl CSW {
    /// Builds a CSW for an AHB access with the given beat size: data access,
    /// privileged, auto-increment single.
    pub fn for_access(size: DataSize, increment: AddressIncrement) -> Self {
        let mut csw = CSW(0);
        csw.set_dbg_sw_enable(true);
        // HPROT[1:0]: data access, privileged.
        csw.set_prot(0b011);
        csw.set_addr_inc(increment as u8);
        csw.set_size(size as u8);
        csw
    }
}

/// The transfer address register, lower 32 bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TAR(pub u32);

impl From<u32> for TAR {
    fn from(raw: u32) -> Self {
        TAR(raw)
    }
}

impl From<TAR> for u32 {
    fn from(raw: TAR) -> Self {
        raw.0
    }
}

impl ApRegister for TAR {
    const ADDRESS: u8 = 0x04;
    const NAME: &'static str = "TAR";
}

/// The transfer address register, upper 32 bits. Only implemented by APs
/// with large address support.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TAR2(pub u32);

impl From<u32> for TAR2 {
    fn from(raw: u32) -> Self {
        TAR2(raw)
    }
}

impl From<TAR2> for u32 {
    fn from(raw: TAR2) -> Self {
        raw.0
    }
}

impl ApRegister for TAR2 {
    const ADDRESS: u8 = 0x08;
    const NAME: &'static str = "TAR2";
}

/// The data read/write register. Accesses go out on the bus at the address
/// held in TAR.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DRW(pub u32);

impl From<u32> for DRW {
    fn from(raw: u32) -> Self {
        DRW(raw)
    }
}

impl From<DRW> for u32 {
    fn from(raw: DRW) -> Self {
        raw.0
    }
}

impl ApRegister for DRW {
    const ADDRESS: u8 = 0x0C;
    const NAME: &'static str = "DRW";
}

bitfield! {
    /// The debug base address register.
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct BASE(u32);
    impl Debug;
    /// Bits [31:12] of the ROM table base address.
    pub u32, baseaddr, _: 31, 12;
    /// The register format: `true` for the ADIv5 format.
    pub format, _: 1;
    /// Whether a debug component is present behind this AP.
    pub entry_present, _: 0;
}

impl From<u32> for BASE {
    fn from(raw: u32) -> Self {
        BASE(raw)
    }
}

impl From<BASE> for u32 {
    fn from(raw: BASE) -> Self {
        raw.0
    }
}

impl ApRegister for BASE {
    const ADDRESS: u8 = 0xF8;
    const NAME: &'static str = "BASE";
}

/// Bits [63:32] of the debug base address on large-address APs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BASE2(pub u32);

impl From<u32> for BASE2 {
    fn from(raw: u32) -> Self {
        BASE2(raw)
    }
}

impl From<BASE2> for u32 {
    fn from(raw: BASE2) -> Self {
        raw.0
    }
}

impl ApRegister for BASE2 {
    const ADDRESS: u8 = 0xF0;
    const NAME: &'static str = "BASE2";
}

bitfield! {
    /// The configuration register of a MEM-AP.
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct CFG(u32);
    impl Debug;
    /// Large data extension: 64-bit DRW support.
    pub ld, _: 2;
    /// Large address extension: TAR2/BASE2 are implemented.
    pub la, _: 1;
    /// Big-endian bus. RES0 on modern parts.
    pub be, _: 0;
}

impl From<u32> for CFG {
    fn from(raw: u32) -> Self {
        CFG(raw)
    }
}

impl From<CFG> for u32 {
    fn from(raw: CFG) -> Self {
        raw.0
    }
}

impl ApRegister for CFG {
    const ADDRESS: u8 = 0xF4;
    const NAME: &'static str = "CFG";
}

/// Everything we learn about an AP during the scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApInformation {
    /// Where the AP lives.
    pub address: ApAddress,
    /// Its identification register.
    pub idr: IDR,
    /// The debug base address, if the AP is a MEM-AP with one.
    pub base_address: Option<u64>,
    /// Whether the AP supports 64-bit addressing.
    pub large_address: bool,
}

/// Number of consecutive unpopulated AP selectors after which the ADIv5
/// scan gives up. Designers allocate APs densely from zero.
const AP_SCAN_GAP: usize = 8;

/// Probe the ADIv5 AP address space and report every AP that answers.
pub fn valid_access_ports(
    interface: &mut ArmCommunicationInterface,
) -> Result<Vec<ApInformation>, ArmError> {
    let mut found = Vec::new();
    let mut gap = 0;

    for selector in 0..=255u8 {
        let address = ApAddress::V1(selector);
        let idr: IDR = interface.read_ap_register(address)?;

        if !idr.exists() {
            gap += 1;
            if gap >= AP_SCAN_GAP {
                break;
            }
            continue;
        }
        gap = 0;

        tracing::debug!(
            "{address}: class {:?}, type {:?}, designer {:?}",
            idr.ap_class(),
            idr.memory_ap_type(),
            idr.designer_code().get()
        );

        let mut info = ApInformation {
            address,
            idr,
            base_address: None,
            large_address: false,
        };

        if idr.ap_class() == ApClass::MemAp {
            let cfg: CFG = interface.read_ap_register(address)?;
            let base: BASE = interface.read_ap_register(address)?;
            info.large_address = cfg.la();

            if base.entry_present() {
                let mut base_address = u64::from(base.baseaddr()) << 12;
                if cfg.la() {
                    let base2: BASE2 = interface.read_ap_register(address)?;
                    base_address |= u64::from(base2.0) << 32;
                }
                info.base_address = Some(base_address);
            }
        }

        found.push(info);
    }

    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idr_decode_ahb_ap() {
        // The AHB-AP of a Cortex-M3: designer ARM, class MEM-AP, type AHB3.
        let idr = IDR(0x2477_0011);
        assert!(idr.exists());
        assert_eq!(idr.ap_class(), ApClass::MemAp);
        assert_eq!(idr.memory_ap_type(), ApType::AmbaAhb3);
        assert_eq!(idr.designer_code().get(), Some("ARM Ltd"));
        assert_eq!(idr.revision(), 2);
        assert_eq!(idr.variant(), 1);
    }

    #[test]
    fn missing_ap_reads_zero() {
        assert!(!IDR(0).exists());
    }

    #[test]
    fn csw_for_word_access() {
        let csw = CSW::for_access(DataSize::U32, AddressIncrement::Single);
        assert_eq!(csw.size(), 0b010);
        assert_eq!(csw.addr_inc(), 0b01);
        assert!(csw.dbg_sw_enable());
    }

    #[test]
    fn base_register_decode() {
        // STM32F103's AHB-AP BASE: ROM table at 0xE00FF000, present, ADIv5
        // format.
        let base = BASE(0xE00F_F003);
        assert!(base.entry_present());
        assert!(base.format());
        assert_eq!(u64::from(base.baseaddr()) << 12, 0xE00F_F000);
    }
}
