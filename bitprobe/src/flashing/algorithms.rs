//! Flash drivers.
//!
//! `SimulatedNor` models a plain NOR array through target memory writes and
//! backs the framework tests; `Stm32F1Flash` drives the STM32F1 embedded
//! flash controller (FPEC) and is the template every other vendor driver
//! follows.

use std::time::Instant;

use super::{FlashError, FlashMemory};
use crate::config::NvmRegion;

/// A NOR-semantics flash behind plain memory accesses: erase sets a sector
/// to the erased value, programming can only clear bits.
#[derive(Debug, Default)]
pub struct SimulatedNor {
    unlocked: bool,
    /// When set, `prepare` reports the array as write protected.
    locked_down: bool,
}

impl SimulatedNor {
    pub fn new() -> Self {
        Self::default()
    }

    /// A variant whose controller refuses to unlock, for exercising the
    /// protection error path.
    pub fn write_protected() -> Self {
        Self {
            unlocked: false,
            locked_down: true,
        }
    }
}

impl super::FlashAlgorithm for SimulatedNor {
    fn prepare(
        &mut self,
        _memory: &mut dyn FlashMemory,
        region: &NvmRegion,
    ) -> Result<(), FlashError> {
        if self.locked_down {
            return Err(FlashError::Protected {
                address: region.start,
            });
        }
        self.unlocked = true;
        Ok(())
    }

    fn erase_sector(
        &mut self,
        memory: &mut dyn FlashMemory,
        region: &NvmRegion,
        address: u64,
        _deadline: Instant,
    ) -> Result<(), FlashError> {
        if !self.unlocked {
            return Err(FlashError::Protected { address });
        }
        let blank = vec![region.erased_byte; region.block_size as usize];
        memory.write(address, &blank).map_err(FlashError::memory)
    }

    fn program_page(
        &mut self,
        memory: &mut dyn FlashMemory,
        _region: &NvmRegion,
        address: u64,
        data: &[u8],
        _deadline: Instant,
    ) -> Result<(), FlashError> {
        if !self.unlocked {
            return Err(FlashError::Protected { address });
        }

        // NOR programming clears bits; it never sets them.
        let mut current = vec![0u8; data.len()];
        memory
            .read(address, &mut current)
            .map_err(FlashError::memory)?;
        for (slot, byte) in current.iter_mut().zip(data) {
            *slot &= byte;
        }
        memory.write(address, &current).map_err(FlashError::memory)
    }

    fn done(
        &mut self,
        _memory: &mut dyn FlashMemory,
        _region: &NvmRegion,
    ) -> Result<(), FlashError> {
        self.unlocked = false;
        Ok(())
    }
}

// STM32F1 FPEC register block.
const FLASH_KEYR: u64 = 0x4002_2004;
const FLASH_SR: u64 = 0x4002_200C;
const FLASH_CR: u64 = 0x4002_2010;
const FLASH_AR: u64 = 0x4002_2014;

const KEY1: u32 = 0x4567_0123;
const KEY2: u32 = 0xCDEF_89AB;

const SR_BSY: u32 = 1 << 0;
const SR_PGERR: u32 = 1 << 2;
const SR_WRPRTERR: u32 = 1 << 4;
const SR_EOP: u32 = 1 << 5;

const CR_PG: u32 = 1 << 0;
const CR_PER: u32 = 1 << 1;
const CR_STRT: u32 = 1 << 6;
const CR_LOCK: u32 = 1 << 7;

/// The embedded flash controller of the STM32F1 family.
#[derive(Debug, Default)]
pub struct Stm32F1Flash;

impl Stm32F1Flash {
    pub fn new() -> Self {
        Self
    }

    /// Spin on SR.BSY, then check and clear the completion flags.
    fn wait_operation(
        memory: &mut dyn FlashMemory,
        address: u64,
        deadline: Instant,
    ) -> Result<(), FlashError> {
        loop {
            let sr = memory
                .read_word_32(FLASH_SR)
                .map_err(FlashError::memory)?;
            if sr & SR_BSY == 0 {
                // Write-one-to-clear the completion flags.
                memory
                    .write_word_32(FLASH_SR, SR_EOP | SR_PGERR | SR_WRPRTERR)
                    .map_err(FlashError::memory)?;

                if sr & SR_WRPRTERR != 0 {
                    return Err(FlashError::Protected { address });
                }
                if sr & SR_PGERR != 0 {
                    return Err(FlashError::Program { address });
                }
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(FlashError::Timeout { address });
            }
        }
    }
}

impl super::FlashAlgorithm for Stm32F1Flash {
    fn prepare(
        &mut self,
        memory: &mut dyn FlashMemory,
        region: &NvmRegion,
    ) -> Result<(), FlashError> {
        let cr = memory
            .read_word_32(FLASH_CR)
            .map_err(FlashError::memory)?;
        if cr & CR_LOCK != 0 {
            memory
                .write_word_32(FLASH_KEYR, KEY1)
                .map_err(FlashError::memory)?;
            memory
                .write_word_32(FLASH_KEYR, KEY2)
                .map_err(FlashError::memory)?;
        }

        // Unlocking fails silently on a protected part; verify.
        let cr = memory
            .read_word_32(FLASH_CR)
            .map_err(FlashError::memory)?;
        if cr & CR_LOCK != 0 {
            return Err(FlashError::Protected {
                address: region.start,
            });
        }
        Ok(())
    }

    fn erase_sector(
        &mut self,
        memory: &mut dyn FlashMemory,
        _region: &NvmRegion,
        address: u64,
        deadline: Instant,
    ) -> Result<(), FlashError> {
        memory
            .write_word_32(FLASH_CR, CR_PER)
            .map_err(FlashError::memory)?;
        memory
            .write_word_32(FLASH_AR, address as u32)
            .map_err(FlashError::memory)?;
        memory
            .write_word_32(FLASH_CR, CR_PER | CR_STRT)
            .map_err(FlashError::memory)?;

        Self::wait_operation(memory, address, deadline)
    }

    fn program_page(
        &mut self,
        memory: &mut dyn FlashMemory,
        _region: &NvmRegion,
        address: u64,
        data: &[u8],
        deadline: Instant,
    ) -> Result<(), FlashError> {
        memory
            .write_word_32(FLASH_CR, CR_PG)
            .map_err(FlashError::memory)?;

        // The FPEC programs one halfword per bus write.
        for (offset, pair) in data.chunks(2).enumerate() {
            let halfword = u16::from_le_bytes([pair[0], *pair.get(1).unwrap_or(&0xFF)]);
            memory
                .write_word_16(address + offset as u64 * 2, halfword)
                .map_err(FlashError::memory)?;
            Self::wait_operation(memory, address, deadline)?;
        }

        memory
            .write_word_32(FLASH_CR, 0)
            .map_err(FlashError::memory)
    }

    fn done(
        &mut self,
        memory: &mut dyn FlashMemory,
        _region: &NvmRegion,
    ) -> Result<(), FlashError> {
        memory
            .write_word_32(FLASH_CR, CR_LOCK)
            .map_err(FlashError::memory)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flashing::FlashAlgorithm;
    use crate::Error;
    use std::collections::BTreeMap;

    fn region() -> NvmRegion {
        NvmRegion {
            start: 0x0800_0000,
            length: 0x1_0000,
            block_size: 0x400,
            write_size: 0x400,
            erased_byte: 0xFF,
        }
    }

    /// Behavioural FPEC: unlock sequence, sector erase on CR.STRT, halfword
    /// programming while CR.PG is set.
    #[derive(Default)]
    struct FpecModel {
        flash: BTreeMap<u64, u8>,
        keyr_stage: u8,
        locked: bool,
        cr: u32,
        ar: u32,
    }

    impl FpecModel {
        fn new() -> Self {
            Self {
                locked: true,
                ..Self::default()
            }
        }
    }

    impl FlashMemory for FpecModel {
        fn read(&mut self, address: u64, data: &mut [u8]) -> Result<(), Error> {
            for (index, slot) in data.iter_mut().enumerate() {
                let address = address + index as u64;
                *slot = if (FLASH_CR..FLASH_CR + 4).contains(&address) {
                    let cr = self.cr | if self.locked { CR_LOCK } else { 0 };
                    cr.to_le_bytes()[(address - FLASH_CR) as usize]
                } else if (FLASH_SR..FLASH_SR + 4).contains(&address) {
                    // Never busy, no error flags pending.
                    0
                } else {
                    self.flash.get(&address).copied().unwrap_or(0xFF)
                };
            }
            Ok(())
        }

        fn write(&mut self, address: u64, data: &[u8]) -> Result<(), Error> {
            match address {
                FLASH_KEYR => {
                    let value = u32::from_le_bytes(data[..4].try_into().unwrap());
                    match (self.keyr_stage, value) {
                        (0, KEY1) => self.keyr_stage = 1,
                        (1, KEY2) => {
                            self.locked = false;
                            self.keyr_stage = 0;
                        }
                        _ => self.keyr_stage = 0,
                    }
                }
                FLASH_CR => {
                    let value = u32::from_le_bytes(data[..4].try_into().unwrap());
                    if value & CR_LOCK != 0 {
                        self.locked = true;
                    }
                    self.cr = value & !CR_LOCK;
                    if self.cr & (CR_PER | CR_STRT) == CR_PER | CR_STRT {
                        let base = u64::from(self.ar);
                        for offset in 0..0x400 {
                            self.flash.insert(base + offset, 0xFF);
                        }
                    }
                }
                FLASH_AR => {
                    self.ar = u32::from_le_bytes(data[..4].try_into().unwrap());
                }
                FLASH_SR => {}
                _ if self.cr & CR_PG != 0 && !self.locked => {
                    for (index, byte) in data.iter().enumerate() {
                        let slot = self
                            .flash
                            .entry(address + index as u64)
                            .or_insert(0xFF);
                        *slot &= byte;
                    }
                }
                _ => {}
            }
            Ok(())
        }
    }

    #[test]
    fn unlock_erase_program_lock_cycle() {
        let mut fpec = FpecModel::new();
        let mut driver = Stm32F1Flash::new();
        let region = region();
        let deadline = Instant::now() + crate::flashing::FLASH_OP_TIMEOUT;

        driver.prepare(&mut fpec, &region).unwrap();
        assert!(!fpec.locked);

        driver
            .erase_sector(&mut fpec, &region, 0x0800_0000, deadline)
            .unwrap();

        let data = vec![0xAA; 0x400];
        driver
            .program_page(&mut fpec, &region, 0x0800_0000, &data, deadline)
            .unwrap();

        driver.done(&mut fpec, &region).unwrap();
        assert!(fpec.locked);

        assert_eq!(fpec.flash.get(&0x0800_0000), Some(&0xAA));
        assert_eq!(fpec.flash.get(&0x0800_03FF), Some(&0xAA));
    }

    #[test]
    fn protected_part_reports_at_prepare() {
        /// An FPEC that ignores the unlock sequence entirely.
        struct LockedFpec(FpecModel);

        impl FlashMemory for LockedFpec {
            fn read(&mut self, address: u64, data: &mut [u8]) -> Result<(), Error> {
                self.0.read(address, data)
            }
            fn write(&mut self, address: u64, data: &[u8]) -> Result<(), Error> {
                if address == FLASH_KEYR {
                    return Ok(());
                }
                self.0.write(address, data)
            }
        }

        let mut fpec = LockedFpec(FpecModel::new());
        let mut driver = Stm32F1Flash::new();

        assert!(matches!(
            driver.prepare(&mut fpec, &region()),
            Err(FlashError::Protected { .. })
        ));
    }

    #[test]
    fn simulated_nor_only_clears_bits() {
        let mut memory = crate::flashing::test_support::SparseMemory::default();
        let mut nor = SimulatedNor::new();
        let region = region();
        let deadline = Instant::now() + crate::flashing::FLASH_OP_TIMEOUT;

        nor.prepare(&mut memory, &region).unwrap();
        nor.erase_sector(&mut memory, &region, 0x0800_0000, deadline)
            .unwrap();
        nor.program_page(&mut memory, &region, 0x0800_0000, &[0xF0; 16], deadline)
            .unwrap();
        // Programming over existing data ANDs the bits.
        nor.program_page(&mut memory, &region, 0x0800_0000, &[0x0F; 16], deadline)
            .unwrap();

        let mut read = [0u8; 1];
        memory.read(0x0800_0000, &mut read).unwrap();
        assert_eq!(read[0], 0x00);
    }

    #[test]
    fn write_protected_nor_fails_prepare() {
        let mut memory = crate::flashing::test_support::SparseMemory::default();
        let mut nor = SimulatedNor::write_protected();

        assert!(matches!(
            nor.prepare(&mut memory, &region()),
            Err(FlashError::Protected { .. })
        ));
    }
}
