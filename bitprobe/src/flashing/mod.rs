//! The flash programming framework.
//!
//! Vendors implement [`FlashAlgorithm`] for their flash controller; the
//! framework owns the sector model and the staged-write pipeline around it:
//! erase requests are widened to sector boundaries, writes are buffered
//! until a full write granule is available, partial tails are padded with
//! the erased-byte value, and every region whose `prepare` ran gets its
//! `done` callback even when the transaction aborts.

mod algorithms;
mod transaction;

pub use algorithms::{SimulatedNor, Stm32F1Flash};
pub use transaction::FlashTransaction;

use std::time::Duration;

use crate::config::NvmRegion;
use crate::core::CoreInterface;
use crate::Error;

/// Deadline granted to a single erase or program callback.
pub const FLASH_OP_TIMEOUT: Duration = Duration::from_secs(5);

/// An error during flash programming.
#[derive(Debug, thiserror::Error)]
pub enum FlashError {
    /// The flash controller reports the region as locked.
    #[error("The flash at {address:#010x} is write protected.")]
    Protected {
        /// Address of the failed operation.
        address: u64,
    },
    /// The erase of a sector did not complete.
    #[error("Erasing the flash sector at {address:#010x} failed.")]
    Erase {
        /// Sector base address.
        address: u64,
    },
    /// Programming a granule did not complete.
    #[error("Programming the flash at {address:#010x} failed.")]
    Program {
        /// Granule base address.
        address: u64,
    },
    /// The controller did not finish an operation before its deadline.
    #[error("The flash operation at {address:#010x} timed out.")]
    Timeout {
        /// Address of the failed operation.
        address: u64,
    },
    /// The address is not covered by any flash region of the target.
    #[error("Address {address:#010x} is outside any flash region.")]
    OutsideFlash {
        /// The offending address.
        address: u64,
    },
    /// A target memory access performed by the framework or a driver
    /// failed.
    #[error("Target memory access during flash programming failed")]
    Memory(#[source] Box<Error>),
}

impl FlashError {
    pub(crate) fn memory(error: Error) -> Self {
        FlashError::Memory(Box::new(error))
    }
}

/// Target memory access as seen by flash drivers.
///
/// Every attached core provides this through the blanket impl; tests supply
/// scripted implementations.
pub trait FlashMemory {
    /// Read bytes from the target.
    fn read(&mut self, address: u64, data: &mut [u8]) -> Result<(), Error>;
    /// Write bytes to the target.
    fn write(&mut self, address: u64, data: &[u8]) -> Result<(), Error>;

    /// Read one little-endian word.
    fn read_word_32(&mut self, address: u64) -> Result<u32, Error> {
        let mut bytes = [0u8; 4];
        self.read(address, &mut bytes)?;
        Ok(u32::from_le_bytes(bytes))
    }

    /// Write one little-endian word.
    fn write_word_32(&mut self, address: u64, value: u32) -> Result<(), Error> {
        self.write(address, &value.to_le_bytes())
    }

    /// Write one little-endian halfword.
    fn write_word_16(&mut self, address: u64, value: u16) -> Result<(), Error> {
        self.write(address, &value.to_le_bytes())
    }
}

impl<C: CoreInterface + ?Sized> FlashMemory for C {
    fn read(&mut self, address: u64, data: &mut [u8]) -> Result<(), Error> {
        self.read_memory(address, data)
    }

    fn write(&mut self, address: u64, data: &[u8]) -> Result<(), Error> {
        self.write_memory(address, data)
    }
}

/// The vendor-specific side of flash programming.
///
/// All addresses handed to the callbacks are absolute and pre-aligned by
/// the framework: erase addresses to `block_size`, program addresses to
/// `write_size` with exactly one granule of data.
pub trait FlashAlgorithm {
    /// Ready the controller for erase/program operations, typically by
    /// unlocking it.
    fn prepare(
        &mut self,
        memory: &mut dyn FlashMemory,
        region: &NvmRegion,
    ) -> Result<(), FlashError>;

    /// Erase one sector.
    fn erase_sector(
        &mut self,
        memory: &mut dyn FlashMemory,
        region: &NvmRegion,
        address: u64,
        deadline: std::time::Instant,
    ) -> Result<(), FlashError>;

    /// Program one write granule.
    fn program_page(
        &mut self,
        memory: &mut dyn FlashMemory,
        region: &NvmRegion,
        address: u64,
        data: &[u8],
        deadline: std::time::Instant,
    ) -> Result<(), FlashError>;

    /// Restore the controller to its resting state, typically by locking
    /// it again. Called exactly once for every successful `prepare`, even
    /// when the transaction failed in between.
    fn done(
        &mut self,
        memory: &mut dyn FlashMemory,
        region: &NvmRegion,
    ) -> Result<(), FlashError>;
}

/// One programmable region of a target: its geometry plus the driver that
/// knows how to program it.
pub struct FlashRegion {
    /// Geometry and location.
    pub info: NvmRegion,
    /// The vendor driver.
    pub algorithm: Box<dyn FlashAlgorithm>,
}

impl std::fmt::Debug for FlashRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlashRegion").field("info", &self.info).finish()
    }
}
