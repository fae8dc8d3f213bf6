//! CoreSight ROM table parsing and component discovery.
//!
//! Every CoreSight component carries identification registers at fixed
//! offsets below the top of its 4 KiB block: CIDR0..3 classify the
//! component, PIDR0..4 identify designer and part. ROM tables (class 0x1,
//! and class 0x9 tables identified by DEVARCH) list child components as
//! signed offsets from their own base; the walker recurses through them with
//! a fixed depth bound, reporting every component it can identify.

use jep106::JEP106Code;

use super::memory::ArmMemoryInterface;
use super::ArmError;

/// Maximum nesting depth of ROM tables. Acts as the cycle breaker for
/// malformed or self-referencing tables; real trees are much shallower.
const MAX_ROM_TABLE_DEPTH: usize = 8;

/// Maximum entries in one ROM table: the 4 KiB block minus the
/// identification registers, in 32-bit entries.
const MAX_ROM_TABLE_ENTRIES: usize = 960;

/// An error to report any errors that are romtable discovery specific.
#[derive(thiserror::Error, Debug)]
pub enum RomTableError {
    /// The component does not carry the expected CIDR preamble.
    #[error("The CoreSight component could not be identified")]
    ComponentIdentification,
    /// Memory access during the walk failed.
    #[error("Could not access the component's identification registers")]
    Memory(#[source] Box<ArmError>),
}

impl RomTableError {
    fn memory(error: ArmError) -> Self {
        RomTableError::Memory(Box::new(error))
    }
}

/// The class of a CoreSight component, from CIDR1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentClass {
    /// Generic verification component.
    GenericVerification,
    /// A class 0x1 ROM table.
    RomTable,
    /// A CoreSight component; class 0x9 ROM tables also identify this way.
    CoreSight,
    /// Peripheral test block.
    PeripheralTestBlock,
    /// Generic IP component, e.g. the Cortex-M system control space.
    GenericIp,
    /// CoreLink, PrimeCell or legacy system component.
    SystemLegacy,
}

impl ComponentClass {
    fn from_cidr1(value: u32) -> Option<Self> {
        match (value >> 4) & 0xF {
            0x0 => Some(ComponentClass::GenericVerification),
            0x1 => Some(ComponentClass::RomTable),
            0x9 => Some(ComponentClass::CoreSight),
            0xB => Some(ComponentClass::PeripheralTestBlock),
            0xE => Some(ComponentClass::GenericIp),
            0xF => Some(ComponentClass::SystemLegacy),
            _ => None,
        }
    }
}

/// Peripheral ID information for a CoreSight component.
#[derive(Debug, Clone, PartialEq)]
pub struct PeripheralId {
    /// Minor errata field.
    pub revand: u8,
    /// Customer modification field.
    pub cmod: u8,
    /// Major revision of the component.
    pub revision: u8,
    /// The designer, when the part uses JEP106 identification.
    pub jep106: Option<JEP106Code>,
    /// The designer-assigned 12-bit part number.
    pub part: u16,
    /// Size of the component in 4 KiB blocks.
    pub blocks: u8,
    /// DEVTYPE, meaningful for CoreSight-class components.
    pub dev_type: u8,
    /// DEVARCH architecture id, when advertised.
    pub arch_id: u16,
}

impl PeripheralId {
    fn from_raw(data: &[u32; 8], dev_type: u8, arch_id: u16) -> Self {
        let jep106id = (((data[2] & 0x07) << 4) | ((data[1] >> 4) & 0x0F)) as u8;
        let uses_jep106 = (data[2] & 0x8) != 0;

        PeripheralId {
            revand: ((data[3] >> 4) & 0x0F) as u8,
            cmod: (data[3] & 0x0F) as u8,
            revision: ((data[2] >> 4) & 0x0F) as u8,
            jep106: uses_jep106
                .then(|| JEP106Code::new((data[4] & 0x0F) as u8, jep106id)),
            part: (((data[1] & 0x0F) << 8) | (data[0] & 0xFF)) as u16,
            blocks: 2u32.pow((data[4] >> 4) & 0x0F) as u8,
            dev_type,
            arch_id,
        }
    }

    /// The designer name, if the JEP106 code is known.
    pub fn designer(&self) -> Option<&'static str> {
        self.jep106.and_then(|code| code.get())
    }

    /// Matches the identification against the table of known debug blocks.
    pub fn peripheral_kind(&self) -> PeripheralKind {
        match (self.designer().unwrap_or(""), self.part) {
            ("ARM Ltd", 0x000 | 0x008 | 0x00C | 0xD20 | 0xD21) => PeripheralKind::Scs,
            ("ARM Ltd", 0x002 | 0x00A) => PeripheralKind::Dwt,
            ("ARM Ltd", 0x003 | 0x00B | 0x00E) => PeripheralKind::Fpb,
            ("ARM Ltd", 0x001 | 0x913) => PeripheralKind::Itm,
            ("ARM Ltd", 0x912 | 0x923 | 0x9A1) => PeripheralKind::Tpiu,
            ("ARM Ltd", 0x924 | 0x925 | 0x975) => PeripheralKind::Etm,
            ("ARM Ltd", 0x471 | 0x4C0 | 0x4C3 | 0x4C4) => PeripheralKind::Rom,
            _ => match (self.dev_type, self.arch_id) {
                (0x00, 0x2A04) => PeripheralKind::Scs,
                (0x00, 0x1A02) => PeripheralKind::Dwt,
                (0x00, 0x1A03) => PeripheralKind::Fpb,
                (0x43, 0x1A01) => PeripheralKind::Itm,
                (0x11, _) => PeripheralKind::Tpiu,
                (0x13, _) => PeripheralKind::Etm,
                _ => PeripheralKind::Other,
            },
        }
    }
}

/// The debug blocks the walker can recognise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeripheralKind {
    /// System control space: the core debug registers live here.
    Scs,
    /// Data watchpoint and trace unit.
    Dwt,
    /// Flash patch and breakpoint unit.
    Fpb,
    /// Instrumentation trace macrocell.
    Itm,
    /// Trace port interface unit.
    Tpiu,
    /// Embedded trace macrocell.
    Etm,
    /// A nested ROM table.
    Rom,
    /// Anything else.
    Other,
}

/// Identification of one discovered component.
#[derive(Debug, Clone, PartialEq)]
pub struct ComponentId {
    /// Base address of the component's 4 KiB block.
    pub address: u64,
    /// The component class from CIDR.
    pub class: ComponentClass,
    /// The decoded peripheral identification.
    pub peripheral_id: PeripheralId,
}

impl ComponentId {
    /// Reads and validates CIDR/PIDR at `base`.
    fn read_from(
        memory: &mut dyn ArmMemoryInterface,
        base: u64,
    ) -> Result<ComponentId, RomTableError> {
        let mut cidr = [0u32; 4];
        memory
            .read_32(base + 0xFF0, &mut cidr)
            .map_err(RomTableError::memory)?;

        let preambles = [
            cidr[0] & 0xFF,
            cidr[1] & 0x0F,
            cidr[2] & 0xFF,
            cidr[3] & 0xFF,
        ];
        let expected = [0x0D, 0x00, 0x05, 0xB1];
        for (index, (got, want)) in preambles.iter().zip(expected).enumerate() {
            if *got != want {
                tracing::warn!(
                    "Component at {base:#010x}: CIDR{index} preamble is {got:#04x}, expected {want:#04x}"
                );
                return Err(RomTableError::ComponentIdentification);
            }
        }

        let class =
            ComponentClass::from_cidr1(cidr[1]).ok_or(RomTableError::ComponentIdentification)?;

        let mut pidr = [0u32; 8];
        memory
            .read_32(base + 0xFD0, &mut pidr[4..])
            .map_err(RomTableError::memory)?;
        memory
            .read_32(base + 0xFE0, &mut pidr[..4])
            .map_err(RomTableError::memory)?;

        // DEVTYPE and DEVARCH only exist on CoreSight-class components.
        let (dev_type, arch_id) = if class == ComponentClass::CoreSight {
            let dev_type = memory
                .read_word_32(base + 0xFCC)
                .map_err(RomTableError::memory)? as u8;
            let devarch = memory
                .read_word_32(base + 0xFBC)
                .map_err(RomTableError::memory)?;
            let arch_id = if devarch & (1 << 20) != 0 {
                (devarch & 0xFFFF) as u16
            } else {
                0
            };
            (dev_type, arch_id)
        } else {
            (0, 0)
        };

        Ok(ComponentId {
            address: base,
            class,
            peripheral_id: PeripheralId::from_raw(&pidr, dev_type, arch_id),
        })
    }
}

/// DEVARCH architecture id of a class 0x9 ROM table.
const DEVARCH_CLASS9_ROM: u16 = 0x0AF7;

/// A parsed CoreSight component tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Component {
    /// A ROM table with its children.
    RomTable(ComponentId, Vec<Component>),
    /// A leaf component.
    Leaf(ComponentId),
}

impl Component {
    /// Parse the component at `base` and, for ROM tables, everything below
    /// it.
    pub fn try_parse(
        memory: &mut dyn ArmMemoryInterface,
        base: u64,
    ) -> Result<Component, RomTableError> {
        Self::parse_at_depth(memory, base, 0)
    }

    fn parse_at_depth(
        memory: &mut dyn ArmMemoryInterface,
        base: u64,
        depth: usize,
    ) -> Result<Component, RomTableError> {
        tracing::debug!("Reading component data at {base:#010x}");
        let id = ComponentId::read_from(memory, base)?;

        let is_rom = match id.class {
            ComponentClass::RomTable => true,
            ComponentClass::CoreSight => id.peripheral_id.arch_id == DEVARCH_CLASS9_ROM,
            _ => false,
        };

        if !is_rom {
            return Ok(Component::Leaf(id));
        }
        if depth >= MAX_ROM_TABLE_DEPTH {
            tracing::warn!("ROM table at {base:#010x} exceeds the depth bound, not descending");
            return Ok(Component::Leaf(id));
        }

        let mut children = Vec::new();
        for index in 0..MAX_ROM_TABLE_ENTRIES {
            let entry_address = base + (index as u64) * 4;
            let raw = memory
                .read_word_32(entry_address)
                .map_err(RomTableError::memory)?;

            // The first all-zero entry ends the table.
            if raw == 0 {
                break;
            }
            // Bit 0: entry present. Absent entries still occupy a slot.
            if raw & 1 == 0 {
                continue;
            }

            // The offset is signed, in 4 KiB units.
            let offset = i64::from((raw & 0xFFFF_F000) as i32);
            let child_base = (base as i64).wrapping_add(offset) as u64;
            tracing::debug!("ROM table entry {index}: component at {child_base:#010x}");

            match Self::parse_at_depth(memory, child_base, depth + 1) {
                Ok(child) => children.push(child),
                Err(RomTableError::ComponentIdentification) => {
                    // A dud entry is not fatal to the rest of the table.
                    tracing::warn!("Skipping unidentifiable component at {child_base:#010x}");
                }
                Err(error) => return Err(error),
            }
        }

        Ok(Component::RomTable(id, children))
    }

    /// The identification of this component.
    pub fn id(&self) -> &ComponentId {
        match self {
            Component::RomTable(id, _) => id,
            Component::Leaf(id) => id,
        }
    }

    /// Call `visitor` for this component and every component below it.
    pub fn visit(&self, visitor: &mut dyn FnMut(&ComponentId)) {
        visitor(self.id());
        if let Component::RomTable(_, children) = self {
            for child in children {
                child.visit(visitor);
            }
        }
    }

    /// Find the first component of the given kind, depth first.
    pub fn find(&self, kind: PeripheralKind) -> Option<&ComponentId> {
        let mut found = None;
        self.visit(&mut |id| {
            if found.is_none() && id.peripheral_id.peripheral_kind() == kind {
                found = Some(id.clone());
            }
        });
        // Re-borrow from self so the caller gets a reference with the right
        // lifetime.
        let address = found?.address;
        self.find_by_address(address)
    }

    fn find_by_address(&self, address: u64) -> Option<&ComponentId> {
        if self.id().address == address {
            return Some(self.id());
        }
        if let Component::RomTable(_, children) = self {
            for child in children {
                if let Some(id) = child.find_by_address(address) {
                    return Some(id);
                }
            }
        }
        None
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::BTreeMap;

    /// Word-granular memory for building identification blocks in tests.
    #[derive(Default)]
    pub(crate) struct TableMemory {
        pub words: BTreeMap<u64, u32>,
    }

    impl TableMemory {
        fn put(&mut self, address: u64, value: u32) {
            self.words.insert(address, value);
        }

        /// Installs CIDR/PIDR for a component: ARM designer, given class and
        /// part number.
        pub fn install_component(&mut self, base: u64, class: u8, part: u16) {
            self.put(base + 0xFF0, 0x0D);
            self.put(base + 0xFF4, u32::from(class) << 4);
            self.put(base + 0xFF8, 0x05);
            self.put(base + 0xFFC, 0xB1);

            // PIDR for designer "ARM Ltd": identity 0x3B, continuation 4.
            self.put(base + 0xFE0, u32::from(part & 0xFF));
            self.put(base + 0xFE4, (u32::from(part >> 8) & 0xF) | 0xB0);
            self.put(base + 0xFE8, 0x0B);
            self.put(base + 0xFEC, 0x00);
            self.put(base + 0xFD0, 0x04);
        }
    }

    impl ArmMemoryInterface for TableMemory {
        fn read_word_32(&mut self, address: u64) -> Result<u32, ArmError> {
            Ok(self.words.get(&address).copied().unwrap_or(0))
        }
        fn read_word_16(&mut self, _address: u64) -> Result<u16, ArmError> {
            unimplemented!()
        }
        fn read_word_8(&mut self, _address: u64) -> Result<u8, ArmError> {
            unimplemented!()
        }
        fn write_word_32(&mut self, address: u64, data: u32) -> Result<(), ArmError> {
            self.put(address, data);
            Ok(())
        }
        fn write_word_16(&mut self, _address: u64, _data: u16) -> Result<(), ArmError> {
            unimplemented!()
        }
        fn write_word_8(&mut self, _address: u64, _data: u8) -> Result<(), ArmError> {
            unimplemented!()
        }
        fn read_32(&mut self, address: u64, data: &mut [u32]) -> Result<(), ArmError> {
            for (index, slot) in data.iter_mut().enumerate() {
                *slot = self.read_word_32(address + index as u64 * 4)?;
            }
            Ok(())
        }
        fn write_32(&mut self, address: u64, data: &[u32]) -> Result<(), ArmError> {
            for (index, word) in data.iter().enumerate() {
                self.write_word_32(address + index as u64 * 4, *word)?;
            }
            Ok(())
        }
        fn read(&mut self, _address: u64, _data: &mut [u8]) -> Result<(), ArmError> {
            unimplemented!()
        }
        fn write(&mut self, _address: u64, _data: &[u8]) -> Result<(), ArmError> {
            unimplemented!()
        }
    }

    /// The identification blocks of a Cortex-M3: a ROM table at 0xE00FF000
    /// pointing at SCS, DWT and FPB.
    pub(crate) fn cortex_m3_rom() -> TableMemory {
        let mut memory = TableMemory::default();
        let rom = 0xE00F_F000u64;

        memory.install_component(rom, 0x1, 0x4C4);
        // Entries: signed 4 KiB offsets from the table base, present bit set.
        memory.put(rom, 0xFFF0_F003); // SCS at rom - 0xF1000 = 0xE000E000
        memory.put(rom + 4, 0xFFF0_2003); // DWT at 0xE0001000
        memory.put(rom + 8, 0xFFF0_3003); // FPB at 0xE0002000
        memory.put(rom + 12, 0);

        memory.install_component(0xE000_E000, 0xE, 0x000);
        memory.install_component(0xE000_1000, 0xE, 0x002);
        memory.install_component(0xE000_2000, 0xE, 0x003);
        memory
    }

    #[test]
    fn walks_cortex_m3_tree() {
        let mut memory = cortex_m3_rom();
        let component = Component::try_parse(&mut memory, 0xE00F_F000).unwrap();

        let mut discovered = Vec::new();
        component.visit(&mut |id| {
            discovered.push((id.address, id.peripheral_id.peripheral_kind()))
        });

        assert_eq!(
            discovered,
            vec![
                (0xE00F_F000, PeripheralKind::Rom),
                (0xE000_E000, PeripheralKind::Scs),
                (0xE000_1000, PeripheralKind::Dwt),
                (0xE000_2000, PeripheralKind::Fpb),
            ]
        );
    }

    #[test]
    fn finds_the_scs() {
        let mut memory = cortex_m3_rom();
        let component = Component::try_parse(&mut memory, 0xE00F_F000).unwrap();

        let scs = component.find(PeripheralKind::Scs).unwrap();
        assert_eq!(scs.address, 0xE000_E000);
        assert_eq!(scs.peripheral_id.designer(), Some("ARM Ltd"));
        assert_eq!(scs.peripheral_id.part, 0x000);
    }

    #[test]
    fn self_referencing_table_terminates() {
        let mut memory = TableMemory::default();
        memory.install_component(0x1000_0000, 0x1, 0x4C4);
        // Entry pointing at the table itself.
        memory.put(0x1000_0000, 0x0000_0003);

        // Must not loop forever; the depth bound cuts the recursion.
        let component = Component::try_parse(&mut memory, 0x1000_0000).unwrap();
        let mut count = 0;
        component.visit(&mut |_| count += 1);
        assert!(count <= MAX_ROM_TABLE_DEPTH + 1);
    }

    #[test]
    fn bad_preamble_is_rejected() {
        let mut memory = TableMemory::default();
        // No identification registers installed at all.
        let result = Component::try_parse(&mut memory, 0x2000_0000);
        assert!(matches!(
            result,
            Err(RomTableError::ComponentIdentification)
        ));
    }

    #[test]
    fn absent_entries_are_skipped() {
        let mut memory = TableMemory::default();
        let rom = 0xE00F_F000u64;
        memory.install_component(rom, 0x1, 0x4C4);
        memory.put(rom, 0xFFF0_F002); // present bit clear
        memory.put(rom + 4, 0xFFF0_2003);
        memory.put(rom + 8, 0);
        memory.install_component(0xE000_1000, 0xE, 0x002);

        let component = Component::try_parse(&mut memory, rom).unwrap();
        let Component::RomTable(_, children) = &component else {
            panic!("expected a rom table");
        };
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].id().address, 0xE000_1000);
    }
}
