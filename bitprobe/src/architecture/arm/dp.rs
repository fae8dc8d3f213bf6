//! Debug port register definitions.

use bitfield::bitfield;
use jep106::JEP106Code;

use super::DpRegister;

/// The version of a debug port, decoded from DPIDR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugPortVersion {
    /// ADIv5 DPv0: no DPIDR, JTAG only.
    DPv0,
    /// ADIv5 DPv1.
    DPv1,
    /// ADIv5 DPv2: adds TARGETID and multidrop.
    DPv2,
    /// ADIv6 DPv3: AP address space behind SELECT/SELECT1.
    DPv3,
    /// A version this implementation does not know.
    Unsupported(u8),
}

impl From<u8> for DebugPortVersion {
    fn from(value: u8) -> Self {
        match value {
            0 => DebugPortVersion::DPv0,
            1 => DebugPortVersion::DPv1,
            2 => DebugPortVersion::DPv2,
            3 => DebugPortVersion::DPv3,
            other => DebugPortVersion::Unsupported(other),
        }
    }
}

impl std::fmt::Display for DebugPortVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DebugPortVersion::DPv0 => f.write_str("DPv0"),
            DebugPortVersion::DPv1 => f.write_str("DPv1"),
            DebugPortVersion::DPv2 => f.write_str("DPv2"),
            DebugPortVersion::DPv3 => f.write_str("DPv3"),
            DebugPortVersion::Unsupported(other) => write!(f, "<unsupported ({other})>"),
        }
    }
}

bitfield! {
    /// The debug port identification register.
    #[derive(Clone)]
    pub struct DPIDR(u32);
    impl Debug;
    /// Revision code.
    pub u8, revision, _: 31, 28;
    /// Part number of the debug port.
    pub u8, part_no, _: 27, 20;
    /// Minimal debug port implementation.
    pub min, _: 16;
    /// Debug port architecture version.
    pub u8, version, _: 15, 12;
    /// JEP106 designer code, continuation in bits [11:8], identity in [7:1].
    pub u16, designer, _: 11, 1;
    pub u8, jep_cc, _: 11, 8;
    pub u8, jep_id, _: 7, 1;
}

impl From<u32> for DPIDR {
    fn from(raw: u32) -> Self {
        DPIDR(raw)
    }
}

impl From<DPIDR> for u32 {
    fn from(raw: DPIDR) -> Self {
        raw.0
    }
}

impl DpRegister for DPIDR {
    const BANK: u8 = 0;
    const ADDRESS: u8 = 0x0;
    const NAME: &'static str = "DPIDR";
}

impl DPIDR {
    /// The debug port architecture version.
    pub fn port_version(&self) -> DebugPortVersion {
        DebugPortVersion::from(self.version())
    }

    /// The designer of the debug port.
    pub fn designer_code(&self) -> JEP106Code {
        JEP106Code::new(self.jep_cc(), self.jep_id())
    }
}

bitfield! {
    /// The abort register. Write-only; clears sticky error conditions.
    #[derive(Clone, Default)]
    pub struct Abort(u32);
    impl Debug;
    /// Clears CTRL/STAT.STICKYORUN.
    pub _, set_orunerrclr: 4;
    /// Clears CTRL/STAT.WDATAERR.
    pub _, set_wderrclr: 3;
    /// Clears CTRL/STAT.STICKYERR.
    pub _, set_stkerrclr: 2;
    /// Clears CTRL/STAT.STICKYCMP.
    pub _, set_stkcmpclr: 1;
    /// Aborts the current AP transaction.
    pub _, set_dapabort: 0;
}

impl From<u32> for Abort {
    fn from(raw: u32) -> Self {
        Abort(raw)
    }
}

impl From<Abort> for u32 {
    fn from(raw: Abort) -> Self {
        raw.0
    }
}

impl DpRegister for Abort {
    const BANK: u8 = 0;
    const ADDRESS: u8 = 0x0;
    const NAME: &'static str = "ABORT";
}

bitfield! {
    /// The control/status register.
    #[derive(Clone, Default)]
    pub struct Ctrl(u32);
    impl Debug;
    pub csyspwrupack, _: 31;
    pub csyspwrupreq, set_csyspwrupreq: 30;
    pub cdbgpwrupack, _: 29;
    pub cdbgpwrupreq, set_cdbgpwrupreq: 28;
    pub cdbgrstack, _: 27;
    pub cdbgrstreq, set_cdbgrstreq: 26;
    pub u16, trn_cnt, set_trn_cnt: 23, 12;
    pub u8, mask_lane, set_mask_lane: 11, 8;
    pub w_data_err, _: 7;
    pub read_ok, _: 6;
    pub sticky_err, _: 5;
    pub sticky_cmp, _: 4;
    pub u8, trn_mode, _: 3, 2;
    pub sticky_orun, _: 1;
    pub orun_detect, set_orun_detect: 0;
}

impl From<u32> for Ctrl {
    fn from(raw: u32) -> Self {
        Ctrl(raw)
    }
}

impl From<Ctrl> for u32 {
    fn from(raw: Ctrl) -> Self {
        raw.0
    }
}

impl DpRegister for Ctrl {
    const BANK: u8 = 0;
    const ADDRESS: u8 = 0x4;
    const NAME: &'static str = "CTRL/STAT";
}

bitfield! {
    /// The AP select register in its ADIv5 layout.
    #[derive(Clone, Copy, Default, PartialEq, Eq)]
    pub struct SelectV1(u32);
    impl Debug;
    /// Selects the current access port.
    pub u8, ap_sel, set_ap_sel: 31, 24;
    /// Selects the 16-byte register bank of the current access port.
    pub u8, ap_bank_sel, set_ap_bank_sel: 7, 4;
    /// Selects the register bank of the debug port itself.
    pub u8, dp_bank_sel, set_dp_bank_sel: 3, 0;
}

impl From<u32> for SelectV1 {
    fn from(raw: u32) -> Self {
        SelectV1(raw)
    }
}

impl From<SelectV1> for u32 {
    fn from(raw: SelectV1) -> Self {
        raw.0
    }
}

impl DpRegister for SelectV1 {
    const BANK: u8 = 0;
    const ADDRESS: u8 = 0x8;
    const NAME: &'static str = "SELECT";
}

bitfield! {
    /// The AP select register in its ADIv6 layout: ADDR[31:4] of the
    /// selected AP register, plus the DP bank.
    #[derive(Clone, Copy, Default, PartialEq, Eq)]
    pub struct SelectV3(u32);
    impl Debug;
    /// Bits [31:4] of the AP register address.
    pub u32, addr, set_addr: 31, 4;
    /// Selects the register bank of the debug port itself.
    pub u8, dp_bank_sel, set_dp_bank_sel: 3, 0;
}

impl From<u32> for SelectV3 {
    fn from(raw: u32) -> Self {
        SelectV3(raw)
    }
}

impl From<SelectV3> for u32 {
    fn from(raw: SelectV3) -> Self {
        raw.0
    }
}

impl DpRegister for SelectV3 {
    const BANK: u8 = 0;
    const ADDRESS: u8 = 0x8;
    const NAME: &'static str = "SELECT";
}

bitfield! {
    /// Bits [63:32] of the AP register address on an ADIv6 debug port.
    #[derive(Clone, Copy, Default, PartialEq, Eq)]
    pub struct Select1(u32);
    impl Debug;
    pub u32, addr, set_addr: 31, 0;
}

impl From<u32> for Select1 {
    fn from(raw: u32) -> Self {
        Select1(raw)
    }
}

impl From<Select1> for u32 {
    fn from(raw: Select1) -> Self {
        raw.0
    }
}

impl DpRegister for Select1 {
    const BANK: u8 = 5;
    const ADDRESS: u8 = 0x4;
    const NAME: &'static str = "SELECT1";
}

/// The read buffer. Reading it returns the result of the last posted AP
/// read without starting a new transaction.
#[derive(Debug, Clone, Default)]
pub struct RdBuff(pub u32);

impl From<u32> for RdBuff {
    fn from(raw: u32) -> Self {
        RdBuff(raw)
    }
}

impl From<RdBuff> for u32 {
    fn from(raw: RdBuff) -> Self {
        raw.0
    }
}

impl DpRegister for RdBuff {
    const BANK: u8 = 0;
    const ADDRESS: u8 = 0xC;
    const NAME: &'static str = "RDBUFF";
}

bitfield! {
    /// The target identification register of a DPv2+.
    #[derive(Clone)]
    pub struct TargetId(u32);
    impl Debug;
    /// Target revision.
    pub u8, trevision, _: 31, 28;
    /// Designer-assigned part number.
    pub u16, tpartno, _: 27, 12;
    /// JEP106 designer of the target, continuation in [11:8], identity in [7:1].
    pub u16, tdesigner, _: 11, 1;
    pub u8, tjep_cc, _: 11, 8;
    pub u8, tjep_id, _: 7, 1;
}

impl From<u32> for TargetId {
    fn from(raw: u32) -> Self {
        TargetId(raw)
    }
}

impl From<TargetId> for u32 {
    fn from(raw: TargetId) -> Self {
        raw.0
    }
}

impl DpRegister for TargetId {
    const BANK: u8 = 2;
    const ADDRESS: u8 = 0x4;
    const NAME: &'static str = "TARGETID";
}

impl TargetId {
    /// The designer of the target part, as advertised by the DP.
    pub fn designer_code(&self) -> JEP106Code {
        JEP106Code::new(self.tjep_cc(), self.tjep_id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dpidr_decode_stm32f1() {
        // The SW-DP of an STM32F103: designer ARM, DPv1.
        let dpidr = DPIDR(0x1BA0_1477);
        assert_eq!(dpidr.port_version(), DebugPortVersion::DPv1);
        assert_eq!(dpidr.designer_code().get(), Some("ARM Ltd"));
        assert!(!dpidr.min());
    }

    #[test]
    fn select_v1_packing() {
        let mut select = SelectV1(0);
        select.set_ap_sel(0xAB);
        select.set_ap_bank_sel(0xF);
        select.set_dp_bank_sel(0x2);
        assert_eq!(u32::from(select), 0xAB00_00F2);
    }

    #[test]
    fn targetid_decode() {
        // STM32F1 TARGETID style value: designer ST (0x20, bank 0), part 0x410.
        let id = TargetId(0x0041_0041);
        assert_eq!(id.tpartno(), 0x0410);
        assert_eq!(id.tdesigner(), 0x020);
    }
}
