//! MEM-AP memory transfers.
//!
//! Turns `CSW`/`TAR`/`DRW` register traffic into byte-addressed target
//! memory access. The TAR auto-increment only operates within a 1 KiB
//! aligned page, so every block transfer is chunked at page boundaries with
//! a TAR rewrite in between. Sub-word transfers use the 8/16-bit CSW sizes
//! and shift data into the byte lane selected by the low address bits.

use scroll::{Pread, Pwrite, LE};

use super::ap::{AddressIncrement, DataSize, CSW, DRW, TAR, TAR2};
use super::communication_interface::ArmCommunicationInterface;
use super::{ApAddress, ArmError};

/// The auto-increment wrap boundary of a MEM-AP.
const AUTOINC_PAGE: u64 = 0x400;

/// A MEM-AP selected for memory access.
#[derive(Debug, Clone, Copy)]
pub struct MemoryAp {
    /// Where the AP lives.
    pub address: ApAddress,
    /// Whether TAR2 is implemented and 64-bit addresses are usable.
    pub large_address: bool,
}

/// Byte-addressed access to target memory.
///
/// Implemented by the MEM-AP interface below and by the architecture
/// runtimes that expose memory through other means.
pub trait ArmMemoryInterface {
    /// Read a 32-bit word from a 4-byte aligned address.
    fn read_word_32(&mut self, address: u64) -> Result<u32, ArmError>;
    /// Read a 16-bit word from a 2-byte aligned address.
    fn read_word_16(&mut self, address: u64) -> Result<u16, ArmError>;
    /// Read an 8-bit word.
    fn read_word_8(&mut self, address: u64) -> Result<u8, ArmError>;
    /// Write a 32-bit word to a 4-byte aligned address.
    fn write_word_32(&mut self, address: u64, data: u32) -> Result<(), ArmError>;
    /// Write a 16-bit word to a 2-byte aligned address.
    fn write_word_16(&mut self, address: u64, data: u16) -> Result<(), ArmError>;
    /// Write an 8-bit word.
    fn write_word_8(&mut self, address: u64, data: u8) -> Result<(), ArmError>;
    /// Read a block of 32-bit words from a 4-byte aligned address.
    fn read_32(&mut self, address: u64, data: &mut [u32]) -> Result<(), ArmError>;
    /// Write a block of 32-bit words to a 4-byte aligned address.
    fn write_32(&mut self, address: u64, data: &[u32]) -> Result<(), ArmError>;
    /// Read arbitrarily aligned bytes, choosing transfer widths for best
    /// throughput.
    fn read(&mut self, address: u64, data: &mut [u8]) -> Result<(), ArmError>;
    /// Write arbitrarily aligned bytes.
    fn write(&mut self, address: u64, data: &[u8]) -> Result<(), ArmError>;
}

/// A memory interface over one MEM-AP of a connected debug port.
#[derive(Debug)]
pub struct AdiMemoryInterface<'interface> {
    interface: &'interface mut ArmCommunicationInterface,
    ap: MemoryAp,
    /// The last CSW written, so repeated same-width accesses skip the write.
    cached_csw: Option<CSW>,
}

impl<'interface> AdiMemoryInterface<'interface> {
    pub(super) fn new(
        interface: &'interface mut ArmCommunicationInterface,
        ap: MemoryAp,
    ) -> Self {
        Self {
            interface,
            ap,
            cached_csw: None,
        }
    }

    /// The AP this interface reads and writes through.
    pub fn ap_address(&self) -> ApAddress {
        self.ap.address
    }

    fn set_csw(&mut self, size: DataSize, increment: AddressIncrement) -> Result<(), ArmError> {
        let csw = CSW::for_access(size, increment);
        if self.cached_csw != Some(csw) {
            self.interface.write_ap_register(self.ap.address, csw)?;
            self.cached_csw = Some(csw);
        }
        Ok(())
    }

    fn set_tar(&mut self, address: u64) -> Result<(), ArmError> {
        if address > u64::from(u32::MAX) && !self.ap.large_address {
            return Err(ArmError::OutOfBounds);
        }

        self.interface
            .write_ap_register(self.ap.address, TAR(address as u32))?;
        if self.ap.large_address {
            self.interface
                .write_ap_register(self.ap.address, TAR2((address >> 32) as u32))?;
        }
        Ok(())
    }

    fn read_drw(&mut self) -> Result<u32, ArmError> {
        Ok(self
            .interface
            .read_ap_register::<DRW>(self.ap.address)?
            .0)
    }

    fn write_drw(&mut self, value: u32) -> Result<(), ArmError> {
        self.interface.write_ap_register(self.ap.address, DRW(value))
    }

    fn check_alignment(address: u64, alignment: usize) -> Result<(), ArmError> {
        if address as usize % alignment != 0 {
            Err(ArmError::MemoryNotAligned { address, alignment })
        } else {
            Ok(())
        }
    }

    /// Number of beats that fit before the auto-increment would wrap.
    fn beats_until_page_end(address: u64, beat: usize) -> usize {
        ((AUTOINC_PAGE - (address & (AUTOINC_PAGE - 1))) as usize) / beat
    }

    /// Block transfer skeleton shared by reads and writes of any width:
    /// chunk at page boundaries and rewrite TAR for each chunk.
    fn for_each_page(
        &mut self,
        mut address: u64,
        total_beats: usize,
        beat_bytes: usize,
        mut f: impl FnMut(&mut Self, usize, usize) -> Result<(), ArmError>,
    ) -> Result<(), ArmError> {
        let mut done = 0;
        while done < total_beats {
            let chunk = Self::beats_until_page_end(address, beat_bytes)
                .min(total_beats - done);

            self.set_tar(address)?;
            f(self, done, chunk)?;

            done += chunk;
            address += (chunk * beat_bytes) as u64;
        }
        Ok(())
    }
}

impl ArmMemoryInterface for AdiMemoryInterface<'_> {
    fn read_word_32(&mut self, address: u64) -> Result<u32, ArmError> {
        Self::check_alignment(address, 4)?;
        self.set_csw(DataSize::U32, AddressIncrement::Off)?;
        self.set_tar(address)?;
        self.read_drw()
    }

    fn read_word_16(&mut self, address: u64) -> Result<u16, ArmError> {
        Self::check_alignment(address, 2)?;
        self.set_csw(DataSize::U16, AddressIncrement::Off)?;
        self.set_tar(address)?;
        let lane_shift = (address & 0b10) * 8;
        Ok((self.read_drw()? >> lane_shift) as u16)
    }

    fn read_word_8(&mut self, address: u64) -> Result<u8, ArmError> {
        self.set_csw(DataSize::U8, AddressIncrement::Off)?;
        self.set_tar(address)?;
        let lane_shift = (address & 0b11) * 8;
        Ok((self.read_drw()? >> lane_shift) as u8)
    }

    fn write_word_32(&mut self, address: u64, data: u32) -> Result<(), ArmError> {
        Self::check_alignment(address, 4)?;
        self.set_csw(DataSize::U32, AddressIncrement::Off)?;
        self.set_tar(address)?;
        self.write_drw(data)
    }

    fn write_word_16(&mut self, address: u64, data: u16) -> Result<(), ArmError> {
        Self::check_alignment(address, 2)?;
        self.set_csw(DataSize::U16, AddressIncrement::Off)?;
        self.set_tar(address)?;
        let lane_shift = (address & 0b10) * 8;
        self.write_drw(u32::from(data) << lane_shift)
    }

    fn write_word_8(&mut self, address: u64, data: u8) -> Result<(), ArmError> {
        self.set_csw(DataSize::U8, AddressIncrement::Off)?;
        self.set_tar(address)?;
        let lane_shift = (address & 0b11) * 8;
        self.write_drw(u32::from(data) << lane_shift)
    }

    fn read_32(&mut self, address: u64, data: &mut [u32]) -> Result<(), ArmError> {
        if data.is_empty() {
            return Ok(());
        }
        Self::check_alignment(address, 4)?;
        self.set_csw(DataSize::U32, AddressIncrement::Single)?;

        let ap = self.ap.address;
        self.for_each_page(address, data.len(), 4, |this, done, chunk| {
            this.interface
                .read_ap_register_repeated::<DRW>(ap, &mut data[done..done + chunk])
        })
    }

    fn write_32(&mut self, address: u64, data: &[u32]) -> Result<(), ArmError> {
        if data.is_empty() {
            return Ok(());
        }
        Self::check_alignment(address, 4)?;
        self.set_csw(DataSize::U32, AddressIncrement::Single)?;

        let ap = self.ap.address;
        self.for_each_page(address, data.len(), 4, |this, done, chunk| {
            this.interface
                .write_ap_register_repeated::<DRW>(ap, &data[done..done + chunk])
        })
    }

    fn read(&mut self, address: u64, data: &mut [u8]) -> Result<(), ArmError> {
        if data.is_empty() {
            return Ok(());
        }

        // Unaligned head, word-sized body, byte tail.
        let head = ((4 - (address % 4)) % 4).min(data.len() as u64) as usize;
        let body_words = (data.len() - head) / 4;
        let tail_start = head + body_words * 4;

        if head > 0 {
            self.read_bytes(address, &mut data[..head])?;
        }

        if body_words > 0 {
            let mut words = vec![0u32; body_words];
            self.read_32(address + head as u64, &mut words)?;
            for (index, word) in words.iter().enumerate() {
                data.pwrite_with(*word, head + index * 4, LE)
                    .map_err(|_| ArmError::OutOfBounds)?;
            }
        }

        if tail_start < data.len() {
            let tail_address = address + tail_start as u64;
            self.read_bytes(tail_address, &mut data[tail_start..])?;
        }

        Ok(())
    }

    fn write(&mut self, address: u64, data: &[u8]) -> Result<(), ArmError> {
        if data.is_empty() {
            return Ok(());
        }

        let head = ((4 - (address % 4)) % 4).min(data.len() as u64) as usize;
        let body_words = (data.len() - head) / 4;
        let tail_start = head + body_words * 4;

        if head > 0 {
            self.write_bytes(address, &data[..head])?;
        }

        if body_words > 0 {
            let mut words = vec![0u32; body_words];
            for (index, word) in words.iter_mut().enumerate() {
                *word = data
                    .pread_with(head + index * 4, LE)
                    .map_err(|_| ArmError::OutOfBounds)?;
            }
            self.write_32(address + head as u64, &words)?;
        }

        if tail_start < data.len() {
            let tail_address = address + tail_start as u64;
            self.write_bytes(tail_address, &data[tail_start..])?;
        }

        Ok(())
    }
}

impl AdiMemoryInterface<'_> {
    /// Byte-wise block read using 8-bit transfers with auto-increment.
    fn read_bytes(&mut self, address: u64, data: &mut [u8]) -> Result<(), ArmError> {
        self.set_csw(DataSize::U8, AddressIncrement::Single)?;

        self.for_each_page(address, data.len(), 1, |this, done, chunk| {
            for index in 0..chunk {
                let byte_address = address + (done + index) as u64;
                let lane_shift = (byte_address & 0b11) * 8;
                data[done + index] = (this.read_drw()? >> lane_shift) as u8;
            }
            Ok(())
        })
    }

    /// Byte-wise block write using 8-bit transfers with auto-increment.
    fn write_bytes(&mut self, address: u64, data: &[u8]) -> Result<(), ArmError> {
        self.set_csw(DataSize::U8, AddressIncrement::Single)?;

        self.for_each_page(address, data.len(), 1, |this, done, chunk| {
            for index in 0..chunk {
                let byte_address = address + (done + index) as u64;
                let lane_shift = (byte_address & 0b11) * 8;
                this.write_drw(u32::from(data[done + index]) << lane_shift)?;
            }
            Ok(())
        })
    }
}
