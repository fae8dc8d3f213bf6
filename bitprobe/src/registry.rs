//! The target registry: routing discovered parts to probe routines.
//!
//! A static table of `(designer, part, probe)` rows with match masks,
//! scanned in order. The first probe routine that claims the part builds
//! the target description: name, core kind, memory map and flash regions.
//! Rows for identifiable vendors come first; the generic fallback rows at
//! the end always match so every debuggable core ends up usable, if
//! nameless.

use crate::architecture::arm::ArmMemoryInterface;
use crate::config::{MemoryRegion, NvmRegion, RamRegion};
use crate::core::CoreKind;
use crate::flashing::{FlashRegion, Stm32F1Flash};
use crate::Error;

/// JEP106 designer codes as `(continuation << 7) | identity`.
pub mod designers {
    /// ARM Ltd.
    pub const ARM: u16 = (4 << 7) | 0x3B;
    /// STMicroelectronics.
    pub const ST: u16 = 0x20;
    /// Nordic Semiconductor.
    pub const NORDIC: u16 = (2 << 7) | 0x44;
    /// NXP.
    pub const NXP: u16 = 0x15;
}

/// What the scan learned about a part before dispatch.
pub struct ProbeContext<'a> {
    /// JEP106 designer code, from TARGETID when available, else from the
    /// root ROM table component.
    pub designer: u16,
    /// Part number from the same source.
    pub part: u16,
    /// Memory access for identification reads.
    pub memory: &'a mut dyn ArmMemoryInterface,
}

/// A constructed target description.
pub struct TargetInfo {
    /// Human readable driver name.
    pub name: String,
    /// The core family.
    pub kind: CoreKind,
    /// RAM and NVM regions advertised to the debugger.
    pub memory_map: Vec<MemoryRegion>,
    /// Programmable regions with their drivers.
    pub flash: Vec<FlashRegion>,
}

/// One row of the dispatch table.
pub struct ProbeTableEntry {
    /// Designer code this row applies to.
    pub designer: u16,
    /// Mask applied to the designer before comparing; 0 matches any.
    pub designer_mask: u16,
    /// Part number this row applies to.
    pub part: u16,
    /// Mask applied to the part before comparing; 0 matches any.
    pub part_mask: u16,
    /// Row name for logs.
    pub name: &'static str,
    /// The probe routine. Returns `Ok(None)` to pass on the part.
    pub probe: fn(&mut ProbeContext<'_>) -> Result<Option<TargetInfo>, Error>,
}

impl ProbeTableEntry {
    fn matches(&self, designer: u16, part: u16) -> bool {
        (designer & self.designer_mask) == (self.designer & self.designer_mask)
            && (part & self.part_mask) == (self.part & self.part_mask)
    }
}

/// The dispatch table, scanned in order; first success wins.
pub static PROBE_TABLE: &[ProbeTableEntry] = &[
    ProbeTableEntry {
        designer: designers::ST,
        designer_mask: 0x7FF,
        part: 0x410,
        part_mask: 0xFF0,
        name: "STM32F1 (TARGETID)",
        probe: probe_stm32f1,
    },
    // ARM-designed identification blocks say nothing about the vendor;
    // these rows try the vendors whose parts identify that way.
    ProbeTableEntry {
        designer: designers::ARM,
        designer_mask: 0x7FF,
        part: 0,
        part_mask: 0,
        name: "STM32F1 (DBGMCU)",
        probe: probe_stm32f1,
    },
    ProbeTableEntry {
        designer: designers::NORDIC,
        designer_mask: 0x7FF,
        part: 0,
        part_mask: 0,
        name: "nRF52",
        probe: probe_nrf52,
    },
    ProbeTableEntry {
        designer: designers::NXP,
        designer_mask: 0x7FF,
        part: 0,
        part_mask: 0,
        name: "LPC11xx",
        probe: probe_lpc11xx,
    },
    ProbeTableEntry {
        designer: 0,
        designer_mask: 0,
        part: 0,
        part_mask: 0,
        name: "Generic Cortex-M",
        probe: probe_generic_cortex_m,
    },
];

/// Run the table against a discovered part.
pub fn dispatch(context: &mut ProbeContext<'_>) -> Result<Option<TargetInfo>, Error> {
    for entry in PROBE_TABLE {
        if !entry.matches(context.designer, context.part) {
            continue;
        }
        tracing::debug!("Trying probe routine '{}'", entry.name);
        if let Some(info) = (entry.probe)(context)? {
            tracing::info!("Probe routine '{}' claimed the target: {}", entry.name, info.name);
            return Ok(Some(info));
        }
    }
    Ok(None)
}

// STM32F1 identification registers.
const DBGMCU_IDCODE: u64 = 0xE004_2000;
const FLASH_SIZE_REG: u64 = 0x1FFF_F7E0;

fn probe_stm32f1(context: &mut ProbeContext<'_>) -> Result<Option<TargetInfo>, Error> {
    let idcode = context.memory.read_word_32(DBGMCU_IDCODE)?;
    let dev_id = idcode & 0xFFF;

    let (name, sector_size) = match dev_id {
        0x410 => ("STM32F103 (medium density)", 0x400u64),
        0x412 => ("STM32F103 (low density)", 0x400),
        0x414 => ("STM32F103 (high density)", 0x800),
        0x418 => ("STM32F105/F107", 0x800),
        _ => return Ok(None),
    };

    // Flash size in KiB, from the factory-programmed size register.
    let flash_kib = u64::from(context.memory.read_word_32(FLASH_SIZE_REG)? & 0xFFFF);
    let flash_size = flash_kib.clamp(16, 1024) * 1024;

    let flash_region = NvmRegion {
        start: 0x0800_0000,
        length: flash_size,
        block_size: sector_size,
        write_size: 0x400,
        erased_byte: 0xFF,
    };

    Ok(Some(TargetInfo {
        name: name.to_string(),
        kind: CoreKind::CortexM,
        memory_map: vec![
            MemoryRegion::Ram(RamRegion {
                start: 0x2000_0000,
                length: 0x5000,
            }),
            MemoryRegion::Nvm(flash_region.clone()),
        ],
        flash: vec![FlashRegion {
            info: flash_region,
            algorithm: Box::new(Stm32F1Flash::new()),
        }],
    }))
}

fn probe_nrf52(_context: &mut ProbeContext<'_>) -> Result<Option<TargetInfo>, Error> {
    // Identification only; the NVMC flash driver is not part of this tree.
    Ok(Some(TargetInfo {
        name: "nRF52".to_string(),
        kind: CoreKind::CortexM,
        memory_map: vec![MemoryRegion::Ram(RamRegion {
            start: 0x2000_0000,
            length: 0x1_0000,
        })],
        flash: Vec::new(),
    }))
}

fn probe_lpc11xx(_context: &mut ProbeContext<'_>) -> Result<Option<TargetInfo>, Error> {
    Ok(Some(TargetInfo {
        name: "LPC11xx".to_string(),
        kind: CoreKind::CortexM,
        memory_map: vec![MemoryRegion::Ram(RamRegion {
            start: 0x1000_0000,
            length: 0x2000,
        })],
        flash: Vec::new(),
    }))
}

fn probe_generic_cortex_m(_context: &mut ProbeContext<'_>) -> Result<Option<TargetInfo>, Error> {
    Ok(Some(TargetInfo {
        name: "Generic Cortex-M".to_string(),
        kind: CoreKind::CortexM,
        memory_map: Vec::new(),
        flash: Vec::new(),
    }))
}

/// The description used for RISC-V harts, which have no ADI identification
/// to dispatch on.
pub fn generic_rv32() -> TargetInfo {
    TargetInfo {
        name: "Generic RV32".to_string(),
        kind: CoreKind::Riscv32,
        memory_map: Vec::new(),
        flash: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::architecture::arm::romtable::tests::TableMemory;

    fn context<'a>(
        designer: u16,
        part: u16,
        memory: &'a mut TableMemory,
    ) -> ProbeContext<'a> {
        ProbeContext {
            designer,
            part,
            memory,
        }
    }

    #[test]
    fn stm32f1_claims_on_dbgmcu_idcode() {
        let mut memory = TableMemory::default();
        memory.words.insert(DBGMCU_IDCODE, 0x2000_6410);
        memory.words.insert(FLASH_SIZE_REG, 64);

        let mut ctx = context(designers::ARM, 0x4C4, &mut memory);
        let info = dispatch(&mut ctx).unwrap().unwrap();
        assert_eq!(info.name, "STM32F103 (medium density)");
        assert_eq!(info.flash.len(), 1);
        assert_eq!(info.flash[0].info.length, 0x1_0000);
        assert_eq!(info.flash[0].info.block_size, 0x400);
    }

    #[test]
    fn unknown_arm_part_falls_through_to_generic() {
        let mut memory = TableMemory::default();
        // DBGMCU reads as zero: not an STM32.
        let mut ctx = context(designers::ARM, 0x4C4, &mut memory);
        let info = dispatch(&mut ctx).unwrap().unwrap();
        assert_eq!(info.name, "Generic Cortex-M");
        assert!(info.flash.is_empty());
    }

    #[test]
    fn nordic_designer_takes_the_nrf_row() {
        let mut memory = TableMemory::default();
        let mut ctx = context(designers::NORDIC, 0x52, &mut memory);
        let info = dispatch(&mut ctx).unwrap().unwrap();
        assert_eq!(info.name, "nRF52");
    }

    #[test]
    fn st_targetid_matches_masked_part_family() {
        let mut memory = TableMemory::default();
        memory.words.insert(DBGMCU_IDCODE, 0x2000_6410);
        memory.words.insert(FLASH_SIZE_REG, 128);

        // Part 0x414 still matches the 0x410/0xFF0 family row.
        let mut ctx = context(designers::ST, 0x414, &mut memory);
        let info = dispatch(&mut ctx).unwrap().unwrap();
        assert!(info.name.starts_with("STM32F10"));
    }
}
