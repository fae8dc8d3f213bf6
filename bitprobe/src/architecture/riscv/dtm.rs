//! The JTAG debug transport module.
//!
//! Bridges DMI register access onto the two JTAG data registers defined by
//! the RISC-V debug specification: `dtmcs` for transport control and `dmi`
//! for the actual debug module bus, including the in-progress/busy recovery
//! dance.

use bitvec::prelude::*;

use crate::probe::jtag::JtagAccess;

/// IR value of the transport control register.
const IR_DTMCS: u8 = 0x10;
/// IR value of the debug module interface register.
const IR_DMI: u8 = 0x11;
/// IR length of a RISC-V debug transport module.
const IR_LENGTH: usize = 5;

/// dtmcs.dmireset, clears a sticky busy condition.
const DTMCS_DMIRESET: u32 = 1 << 16;

/// DMI operation codes.
const DMI_OP_NOP: u8 = 0;
const DMI_OP_READ: u8 = 1;
const DMI_OP_WRITE: u8 = 2;

/// DMI response codes.
const DMI_STATUS_OK: u8 = 0;
const DMI_STATUS_FAILED: u8 = 2;
const DMI_STATUS_BUSY: u8 = 3;

/// How often a busy DMI operation is retried before giving up.
const DMI_BUSY_RETRIES: usize = 32;

/// An error in the debug transport module.
#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum DtmError {
    /// The DTM stayed busy through every retry.
    #[error("The debug transport module stayed busy.")]
    Busy,
    /// The DTM reported a failed operation.
    #[error("The debug transport module reported a failed operation.")]
    Failed,
    /// The dtmcs version field is one this implementation does not speak.
    #[error("Unsupported debug transport module version {0}.")]
    UnsupportedVersion(u8),
}

/// Access to the debug module interface bus.
pub trait DmiAccess {
    /// Read a DMI register.
    fn dmi_read(&mut self, address: u8) -> Result<u32, DtmError>;
    /// Write a DMI register.
    fn dmi_write(&mut self, address: u8, value: u32) -> Result<(), DtmError>;
}

/// The JTAG DTM of a RISC-V hart.
pub struct JtagDtm<J: JtagAccess> {
    jtag: J,
    /// Width of the DMI address field, from dtmcs.
    abits: u8,
    /// Run-Test/Idle cycles to insert after a DMI scan, from dtmcs, grown
    /// on busy responses.
    idle_cycles: u8,
    current_ir: Option<u8>,
}

impl<J: JtagAccess> JtagDtm<J> {
    /// Attach to the DTM: reset the TAP, read `dtmcs` and verify the
    /// transport version.
    pub fn new(mut jtag: J) -> Result<Self, DtmError> {
        jtag.tap_reset();

        let mut this = Self {
            jtag,
            abits: 7,
            idle_cycles: 1,
            current_ir: None,
        };

        let dtmcs = this.scan_dtmcs(0)?;
        let version = (dtmcs & 0xF) as u8;
        // Version 1 encodes debug spec 0.13 and later 1.0 transports.
        if version != 1 {
            return Err(DtmError::UnsupportedVersion(version));
        }

        this.abits = ((dtmcs >> 4) & 0x3F) as u8;
        this.idle_cycles = (((dtmcs >> 12) & 0x7) as u8).max(1);
        tracing::debug!(
            "DTM: abits={}, {} idle cycles recommended",
            this.abits,
            this.idle_cycles
        );
        Ok(this)
    }

    pub fn into_inner(self) -> J {
        self.jtag
    }

    fn select_ir(&mut self, ir: u8) {
        if self.current_ir != Some(ir) {
            let bits: BitVec<u8, Lsb0> = (0..IR_LENGTH).map(|i| ir & (1 << i) != 0).collect();
            self.jtag.scan_ir(&bits);
            self.current_ir = Some(ir);
        }
    }

    fn scan_dtmcs(&mut self, value: u32) -> Result<u32, DtmError> {
        self.select_ir(IR_DTMCS);
        let tdi: BitVec<u8, Lsb0> = (0..32).map(|i| value & (1 << i) != 0).collect();
        let tdo = self.jtag.scan_dr(&tdi);
        Ok(crate::probe::bits_to_u32(tdo.iter().by_vals()))
    }

    /// One raw `dmi` scan. The captured fields describe the *previous*
    /// operation.
    fn scan_dmi(&mut self, op: u8, address: u8, data: u32) -> (u32, u8) {
        self.select_ir(IR_DMI);

        let width = 34 + usize::from(self.abits);
        let mut tdi: BitVec<u8, Lsb0> = BitVec::repeat(false, width);
        for bit in 0..2 {
            tdi.set(bit, op & (1 << bit) != 0);
        }
        for bit in 0..32 {
            tdi.set(2 + bit, data & (1 << bit) != 0);
        }
        for bit in 0..usize::from(self.abits).min(8) {
            tdi.set(34 + bit, address & (1 << bit) != 0);
        }

        let tdo = self.jtag.scan_dr(&tdi);
        self.jtag.run_test_idle(usize::from(self.idle_cycles));

        let status = crate::probe::bits_to_u32(tdo[0..2].iter().by_vals()) as u8;
        let captured = crate::probe::bits_to_u32(tdo[2..34].iter().by_vals());
        (captured, status)
    }

    /// A full DMI operation: issue the request, then collect the result
    /// with a nop scan, recovering from busy responses via dmireset.
    fn dmi_op(&mut self, op: u8, address: u8, data: u32) -> Result<u32, DtmError> {
        for _ in 0..DMI_BUSY_RETRIES {
            let (_, _) = self.scan_dmi(op, address, data);
            let (value, status) = self.scan_dmi(DMI_OP_NOP, 0, 0);

            match status {
                DMI_STATUS_OK => return Ok(value),
                DMI_STATUS_BUSY => {
                    // The operation may still complete; clear the sticky
                    // flag, give the hart more idle time and reissue.
                    tracing::trace!("DMI busy, resetting and retrying");
                    self.scan_dtmcs(DTMCS_DMIRESET)?;
                    self.idle_cycles = self.idle_cycles.saturating_mul(2).min(64);
                }
                DMI_STATUS_FAILED => {
                    self.scan_dtmcs(DTMCS_DMIRESET)?;
                    return Err(DtmError::Failed);
                }
                _ => return Err(DtmError::Failed),
            }
        }
        Err(DtmError::Busy)
    }
}

impl<J: JtagAccess> DmiAccess for JtagDtm<J> {
    fn dmi_read(&mut self, address: u8) -> Result<u32, DtmError> {
        self.dmi_op(DMI_OP_READ, address, 0)
    }

    fn dmi_write(&mut self, address: u8, value: u32) -> Result<(), DtmError> {
        self.dmi_op(DMI_OP_WRITE, address, value).map(|_| ())
    }
}
