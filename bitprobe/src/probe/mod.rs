//! Wire-level drivers.
//!
//! Everything in this module operates on the five debug pins exposed by
//! [`PinIo`]. The SWD and JTAG drivers are pure bit sequencers: they know the
//! electrical rules of their protocol (sampling edges, turnarounds, TAP state
//! moves) but nothing about the ADI register model layered on top.

use std::fmt;

pub mod jtag;
pub mod swd;

#[cfg(any(test, feature = "fake-probe"))]
pub mod fake;

/// The protocol that is to be used on the wire.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum WireProtocol {
    /// ARM Serial Wire Debug, two wires.
    Swd,
    /// IEEE 1149.1 JTAG, four wires.
    Jtag,
}

impl fmt::Display for WireProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireProtocol::Swd => f.write_str("SWD"),
            WireProtocol::Jtag => f.write_str("JTAG"),
        }
    }
}

/// Raw access to the debug pins.
///
/// Platforms implement this once for their GPIO block; everything above it is
/// portable. The pin names follow the shared-pin convention of SWJ probes:
/// `swdio` doubles as TMS and `swclk` as TCK when the JTAG driver is active.
///
/// All operations are infallible. A bit-banged pin write cannot report
/// failure; protocol-level misbehaviour is detected by the layers above
/// (missing ACK, bad parity, unexpected IDCODE).
pub trait PinIo {
    /// Switch the SWDIO/TMS driver on (`true`) or release the line (`false`).
    fn swdio_set_output(&mut self, output: bool);
    /// Drive SWDIO/TMS. Only meaningful while the host owns the line.
    fn swdio_write(&mut self, high: bool);
    /// Sample SWDIO/TMS.
    fn swdio_read(&mut self) -> bool;
    /// Drive SWCLK/TCK.
    fn swclk_write(&mut self, high: bool);
    /// Drive TDI.
    fn tdi_write(&mut self, high: bool);
    /// Sample TDO.
    fn tdo_read(&mut self) -> bool;
    /// Drive (`true`) or release (`false`) the target reset line.
    fn nrst_write(&mut self, asserted: bool);
    /// Sense the target reset line.
    fn nrst_read(&mut self) -> bool {
        false
    }
    /// Burn one half-period delay unit. Called `cycles` times between edges
    /// when a non-zero divider is active; never called on the fast path.
    fn delay(&mut self, cycles: u32);
}

/// Tuning knobs for the wire drivers.
///
/// The defaults are safe for slow targets; probes with well-behaved targets
/// can drop the idle cycles to gain throughput.
#[derive(Debug, Clone)]
pub struct WireSettings {
    /// Idle (SWDIO low) cycles clocked after every transfer so posted writes
    /// have a chance to drain before the next request header.
    pub idle_cycles_after_transfer: u8,
    /// Clock divider. `0` selects the no-delay fast path, which toggles the
    /// pins as fast as the platform allows.
    pub divider: u32,
}

impl Default for WireSettings {
    fn default() -> Self {
        Self {
            idle_cycles_after_transfer: 8,
            divider: 0,
        }
    }
}

/// Collapse an LSB-first bit iterator into a word.
pub(crate) fn bits_to_u32(bits: impl IntoIterator<Item = bool>) -> u32 {
    let mut value = 0u32;

    for (index, bit) in bits.into_iter().take(32).enumerate() {
        if bit {
            value |= 1 << index;
        }
    }

    value
}

bitfield::bitfield! {
    /// A JTAG IDCODE.
    /// Identifies a particular Test Access Port (TAP) on the JTAG scan chain.
    #[derive(Copy, Clone, Eq, PartialEq)]
    pub struct IdCode(u32);
    impl Debug;

    u8;
    /// The IDCODE version.
    pub version, set_version: 31, 28;

    u16;
    /// The part number.
    pub part_number, set_part_number: 27, 12;

    /// The JEDEC JEP-106 Manufacturer ID.
    pub manufacturer, set_manufacturer: 11, 1;

    u8;
    /// The continuation code of the JEDEC JEP-106 Manufacturer ID.
    pub manufacturer_continuation, set_manufacturer_continuation: 11, 8;

    /// The identity code of the JEDEC JEP-106 Manufacturer ID.
    pub manufacturer_identity, set_manufacturer_identity: 7, 1;

    bool;
    /// The least-significant bit. Always set on a valid IDCODE.
    pub lsbit, set_lsbit: 0;
}

impl IdCode {
    /// Returns `true` if the IDCODE is plausibly valid.
    pub fn is_valid(&self) -> bool {
        self.lsbit() && self.0 != 0 && self.0 != u32::MAX
    }

    /// Returns the manufacturer name, if it is known.
    pub fn manufacturer_name(&self) -> Option<&'static str> {
        let cc = self.manufacturer_continuation();
        let id = self.manufacturer_identity();
        jep106::JEP106Code::new(cc, id).get()
    }
}

impl fmt::Display for IdCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(mfn) = self.manufacturer_name() {
            write!(f, "0x{:08X} ({})", self.0, mfn)
        } else {
            write!(f, "0x{:08X}", self.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bits_to_u32_is_lsb_first() {
        let bits = [true, false, true, true];
        assert_eq!(bits_to_u32(bits), 0b1101);
    }

    #[test]
    fn idcode_fields() {
        // An STM32F103 boundary-scan TAP.
        let id = IdCode(0x3BA0_0477);
        assert!(id.is_valid());
        assert_eq!(id.version(), 3);
        assert_eq!(id.part_number(), 0xBA00);
        assert_eq!(id.manufacturer_name(), Some("ARM Ltd"));
    }

    #[test]
    fn all_ones_idcode_is_invalid() {
        assert!(!IdCode(u32::MAX).is_valid());
        assert!(!IdCode(0).is_valid());
    }
}
