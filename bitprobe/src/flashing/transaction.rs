//! The staged flash write transaction.

use std::time::Instant;

use super::{FlashError, FlashMemory, FlashRegion, FLASH_OP_TIMEOUT};

/// A granule being assembled from partial writes.
#[derive(Debug)]
struct Stage {
    region_index: usize,
    base: u64,
    buffer: Vec<u8>,
}

/// A flash write transaction, created by the first erase and closed by
/// `commit` (or `abort`).
///
/// Tracks which regions had their `prepare` callback run; every one of them
/// is guaranteed a `done` call on either exit path.
#[derive(Debug, Default)]
pub struct FlashTransaction {
    prepared: Vec<usize>,
    stage: Option<Stage>,
}

impl FlashTransaction {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether any region was prepared by this transaction.
    pub fn is_active(&self) -> bool {
        !self.prepared.is_empty()
    }

    fn region_containing(regions: &[FlashRegion], address: u64) -> Result<usize, FlashError> {
        regions
            .iter()
            .position(|region| region.info.contains(address))
            .ok_or(FlashError::OutsideFlash { address })
    }

    fn ensure_prepared(
        &mut self,
        regions: &mut [FlashRegion],
        memory: &mut dyn FlashMemory,
        index: usize,
    ) -> Result<(), FlashError> {
        if !self.prepared.contains(&index) {
            let region = &mut regions[index];
            tracing::debug!(
                "Preparing flash region at {:#010x}",
                region.info.start
            );
            region.algorithm.prepare(memory, &region.info)?;
            self.prepared.push(index);
        }
        Ok(())
    }

    /// Erase every sector touching `address..address + length`, splitting
    /// the request where it spans regions.
    pub fn erase(
        &mut self,
        regions: &mut [FlashRegion],
        memory: &mut dyn FlashMemory,
        address: u64,
        length: u64,
    ) -> Result<(), FlashError> {
        let mut cursor = address;
        let end = address + length;

        while cursor < end {
            let index = Self::region_containing(regions, cursor)?;
            self.ensure_prepared(regions, memory, index)?;

            let region = &mut regions[index];
            let region_end = region.info.range().end.min(end);

            let mut sector = region.info.block_base(cursor);
            while sector < region_end {
                tracing::debug!("Erasing flash sector at {sector:#010x}");
                let deadline = Instant::now() + FLASH_OP_TIMEOUT;
                region
                    .algorithm
                    .erase_sector(memory, &region.info, sector, deadline)?;
                sector += region.info.block_size;
            }

            cursor = region.info.range().end.min(end);
        }

        Ok(())
    }

    /// Stage bytes for programming, emitting a `program_page` call whenever
    /// a write granule is complete.
    pub fn write(
        &mut self,
        regions: &mut [FlashRegion],
        memory: &mut dyn FlashMemory,
        address: u64,
        data: &[u8],
    ) -> Result<(), FlashError> {
        let mut cursor = address;
        let mut remaining = data;

        while !remaining.is_empty() {
            let index = Self::region_containing(regions, cursor)?;
            self.ensure_prepared(regions, memory, index)?;

            let granule_base = regions[index].info.granule_base(cursor);
            let granule_size = regions[index].info.write_size as usize;

            // A write landing outside the current stage flushes it first.
            if let Some(stage) = &self.stage {
                if stage.region_index != index || stage.base != granule_base {
                    self.flush(regions, memory)?;
                }
            }

            let stage = self.stage.get_or_insert_with(|| Stage {
                region_index: index,
                base: granule_base,
                buffer: vec![regions[index].info.erased_byte; granule_size],
            });

            let offset = (cursor - stage.base) as usize;
            let span = remaining.len().min(granule_size - offset);
            stage.buffer[offset..offset + span].copy_from_slice(&remaining[..span]);
            cursor += span as u64;
            remaining = &remaining[span..];

            if offset + span == granule_size {
                self.flush(regions, memory)?;
            }
        }

        Ok(())
    }

    /// Program the active stage, if any. Partial granules go out as staged:
    /// untouched bytes still hold the erased value.
    fn flush(
        &mut self,
        regions: &mut [FlashRegion],
        memory: &mut dyn FlashMemory,
    ) -> Result<(), FlashError> {
        let Some(stage) = self.stage.take() else {
            return Ok(());
        };

        let region = &mut regions[stage.region_index];
        tracing::debug!(
            "Programming {} bytes at {:#010x}",
            stage.buffer.len(),
            stage.base
        );
        let deadline = Instant::now() + FLASH_OP_TIMEOUT;
        region
            .algorithm
            .program_page(memory, &region.info, stage.base, &stage.buffer, deadline)
    }

    /// Flush the pending granule and run every prepared region's `done`.
    /// Later `done` callbacks still run when an earlier one fails; the
    /// first error wins.
    pub fn commit(
        mut self,
        regions: &mut [FlashRegion],
        memory: &mut dyn FlashMemory,
    ) -> Result<(), FlashError> {
        let flush_result = self.flush(regions, memory);
        let done_result = self.finish(regions, memory);
        flush_result.and(done_result)
    }

    /// Drop any staged data and close every prepared region, best effort.
    pub fn abort(mut self, regions: &mut [FlashRegion], memory: &mut dyn FlashMemory) {
        self.stage = None;
        if let Err(error) = self.finish(regions, memory) {
            tracing::warn!("Error while closing an aborted flash transaction: {error}");
        }
    }

    fn finish(
        &mut self,
        regions: &mut [FlashRegion],
        memory: &mut dyn FlashMemory,
    ) -> Result<(), FlashError> {
        let mut result = Ok(());
        for index in self.prepared.drain(..) {
            let region = &mut regions[index];
            if let Err(error) = region.algorithm.done(memory, &region.info) {
                tracing::warn!(
                    "Closing flash region at {:#010x} failed: {error}",
                    region.info.start
                );
                if result.is_ok() {
                    result = Err(error);
                }
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NvmRegion;
    use crate::flashing::test_support::SparseMemory;
    use crate::flashing::{FlashAlgorithm, SimulatedNor};

    fn nor_region(start: u64, length: u64) -> FlashRegion {
        FlashRegion {
            info: NvmRegion {
                start,
                length,
                block_size: 0x400,
                write_size: 8,
                erased_byte: 0xFF,
            },
            algorithm: Box::new(SimulatedNor::new()),
        }
    }

    fn read_back(memory: &mut SparseMemory, address: u64, length: usize) -> Vec<u8> {
        let mut data = vec![0; length];
        memory.read(address, &mut data).unwrap();
        data
    }

    #[test]
    fn erase_write_commit_roundtrip() {
        let mut regions = vec![nor_region(0x0800_0000, 0x1_0000)];
        let mut memory = SparseMemory::default();
        let mut txn = FlashTransaction::new();

        let data: Vec<u8> = (0..0x40).map(|i| i as u8).collect();
        txn.erase(&mut regions, &mut memory, 0x0800_0000, 0x400)
            .unwrap();
        txn.write(&mut regions, &mut memory, 0x0800_0000, &data)
            .unwrap();
        txn.commit(&mut regions, &mut memory).unwrap();

        assert_eq!(read_back(&mut memory, 0x0800_0000, 0x40), data);
    }

    #[test]
    fn unaligned_erase_covers_enclosing_sectors() {
        let mut regions = vec![nor_region(0x0800_0000, 0x1_0000)];
        let mut memory = SparseMemory::default();

        // Pre-program some data across two sectors.
        memory.write(0x0800_03FC, &[0u8; 8]).unwrap();

        let mut txn = FlashTransaction::new();
        // An erase request straddling the sector boundary by a few bytes.
        txn.erase(&mut regions, &mut memory, 0x0800_03FE, 4).unwrap();
        txn.commit(&mut regions, &mut memory).unwrap();

        // Both sectors are erased in full.
        assert_eq!(read_back(&mut memory, 0x0800_03FC, 8), vec![0xFF; 8]);
    }

    #[test]
    fn partial_tail_is_padded_with_erased_byte() {
        let mut regions = vec![nor_region(0x0800_0000, 0x1_0000)];
        let mut memory = SparseMemory::default();
        let mut txn = FlashTransaction::new();

        txn.erase(&mut regions, &mut memory, 0x0800_0000, 0x400)
            .unwrap();
        // Three bytes into an 8-byte granule.
        txn.write(&mut regions, &mut memory, 0x0800_0000, &[1, 2, 3])
            .unwrap();
        txn.commit(&mut regions, &mut memory).unwrap();

        assert_eq!(
            read_back(&mut memory, 0x0800_0000, 8),
            vec![1, 2, 3, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF]
        );
    }

    #[test]
    fn write_outside_any_region_is_rejected() {
        let mut regions = vec![nor_region(0x0800_0000, 0x1_0000)];
        let mut memory = SparseMemory::default();
        let mut txn = FlashTransaction::new();

        let result = txn.write(&mut regions, &mut memory, 0x2000_0000, &[0; 4]);
        assert!(matches!(
            result,
            Err(FlashError::OutsideFlash { address: 0x2000_0000 })
        ));
    }

    #[test]
    fn every_prepared_region_gets_done_after_failure() {
        /// A driver that fails all programming but records lifecycle calls.
        struct FailingDriver {
            prepared: std::rc::Rc<std::cell::Cell<u32>>,
            closed: std::rc::Rc<std::cell::Cell<u32>>,
        }

        impl FlashAlgorithm for FailingDriver {
            fn prepare(
                &mut self,
                _memory: &mut dyn FlashMemory,
                _region: &NvmRegion,
            ) -> Result<(), FlashError> {
                self.prepared.set(self.prepared.get() + 1);
                Ok(())
            }

            fn erase_sector(
                &mut self,
                _memory: &mut dyn FlashMemory,
                _region: &NvmRegion,
                address: u64,
                _deadline: Instant,
            ) -> Result<(), FlashError> {
                Err(FlashError::Erase { address })
            }

            fn program_page(
                &mut self,
                _memory: &mut dyn FlashMemory,
                _region: &NvmRegion,
                address: u64,
                _data: &[u8],
                _deadline: Instant,
            ) -> Result<(), FlashError> {
                Err(FlashError::Program { address })
            }

            fn done(
                &mut self,
                _memory: &mut dyn FlashMemory,
                _region: &NvmRegion,
            ) -> Result<(), FlashError> {
                self.closed.set(self.closed.get() + 1);
                Ok(())
            }
        }

        let prepared = std::rc::Rc::new(std::cell::Cell::new(0));
        let closed = std::rc::Rc::new(std::cell::Cell::new(0));

        let mut regions = vec![FlashRegion {
            info: NvmRegion {
                start: 0x0800_0000,
                length: 0x1000,
                block_size: 0x400,
                write_size: 8,
                erased_byte: 0xFF,
            },
            algorithm: Box::new(FailingDriver {
                prepared: prepared.clone(),
                closed: closed.clone(),
            }),
        }];
        let mut memory = SparseMemory::default();

        let mut txn = FlashTransaction::new();
        let result = txn.erase(&mut regions, &mut memory, 0x0800_0000, 0x400);
        assert!(matches!(result, Err(FlashError::Erase { .. })));

        // The abort path still closes the prepared region.
        txn.abort(&mut regions, &mut memory);
        assert_eq!(prepared.get(), 1);
        assert_eq!(closed.get(), 1);
    }

    #[test]
    fn spanning_erase_touches_both_regions() {
        let mut regions = vec![
            nor_region(0x0800_0000, 0x1000),
            nor_region(0x0800_1000, 0x1000),
        ];
        let mut memory = SparseMemory::default();
        memory.write(0x0800_0FFC, &[0u8; 8]).unwrap();

        let mut txn = FlashTransaction::new();
        txn.erase(&mut regions, &mut memory, 0x0800_0C00, 0x800)
            .unwrap();
        txn.commit(&mut regions, &mut memory).unwrap();

        assert_eq!(read_back(&mut memory, 0x0800_0FFC, 8), vec![0xFF; 8]);
    }
}
