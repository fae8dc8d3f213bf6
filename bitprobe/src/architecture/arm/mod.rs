//! ARM debug architecture: ADIv5/v6 debug and access ports, MEM-AP memory
//! access, CoreSight component discovery and the Cortex-M core runtime.

pub mod ap;
pub mod communication_interface;
pub mod cortex_m;
pub mod dp;
pub mod memory;
pub mod romtable;

pub use communication_interface::ArmCommunicationInterface;
pub use memory::ArmMemoryInterface;

use crate::probe::WireProtocol;

/// An error in the communication with an access port or debug port.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq, Copy)]
pub enum DapError {
    /// An error occurred in the SWD communication between probe and device.
    #[error("An error occurred in the SWD communication between probe and device.")]
    SwdProtocol,
    /// The target device did not respond to the request.
    #[error("Target device did not respond to request.")]
    NoAcknowledge,
    /// The target device responded with a FAULT response to the request.
    #[error("Target device responded with a FAULT response to the request.")]
    FaultResponse,
    /// Target device responded with a WAIT response to the request.
    #[error("Target device responded with a WAIT response to the request.")]
    WaitResponse,
    /// The parity bit on the read request was incorrect.
    #[error("Incorrect parity on READ request.")]
    IncorrectParity,
}

/// An ARM architecture specific error.
#[derive(Debug, thiserror::Error)]
pub enum ArmError {
    /// The target kept answering WAIT past the retry deadline.
    #[error("The request timed out: the target kept responding WAIT.")]
    WaitTimeout,
    /// The target signalled a FAULT; the sticky flags have been cleared.
    #[error("The target responded with a FAULT, indicating a bus error.")]
    Fault,
    /// The wire protocol broke down and could not be recovered by a line
    /// reset. The debug port must be reconnected.
    #[error("The connection to the debug port was lost: {0}")]
    Protocol(DapError),
    /// A timeout while waiting on a target condition.
    #[error("An operation timed out.")]
    Timeout,
    /// Memory access with improper alignment for the requested width.
    #[error("Memory access at {address:#010x} is not aligned to {alignment} bytes.")]
    MemoryNotAligned {
        /// The requested address.
        address: u64,
        /// The required alignment.
        alignment: usize,
    },
    /// Address computation left the 32-bit (or AP-supported) address space.
    #[error("Memory access is out of bounds of the address space.")]
    OutOfBounds,
    /// The addressed AP is not a MEM-AP and cannot serve memory transfers.
    #[error("Access port {0:?} is not a memory access port.")]
    NotAMemAp(ApAddress),
    /// No access port answered at the given address.
    #[error("No access port found at {0:?}.")]
    ApNotFound(ApAddress),
    /// The debug port version does not support the requested operation.
    #[error("The debug port does not support {0}.")]
    UnsupportedDpOperation(&'static str),
    /// ROM table traversal failed.
    #[error("Error while parsing a CoreSight component tree")]
    RomTable(#[from] romtable::RomTableError),
    /// Error while operating a core register transfer.
    #[error("Core register transfer did not complete.")]
    CoreRegisterTransfer,
    /// The requested register is not part of the advertised register file.
    #[error("Register {0} is not available on this core.")]
    InvalidRegister(u16),
    /// No free hardware comparator for the requested breakpoint/watchpoint.
    #[error("All hardware breakpoint/watchpoint units are in use.")]
    NoHardwareResource,
}

impl From<DapError> for ArmError {
    fn from(value: DapError) -> Self {
        match value {
            DapError::FaultResponse => ArmError::Fault,
            DapError::WaitResponse => ArmError::WaitTimeout,
            other => ArmError::Protocol(other),
        }
    }
}

/// The port a DAP transfer addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortType {
    /// The debug port itself.
    DebugPort,
    /// The currently selected access port.
    AccessPort,
}

/// Address of an access port behind a debug port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ApAddress {
    /// ADIv5: an APSEL value, 0..=255.
    V1(u8),
    /// ADIv6: the base address of the AP within the DP address space.
    V2(u64),
}

impl std::fmt::Display for ApAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApAddress::V1(sel) => write!(f, "AP{sel}"),
            ApAddress::V2(base) => write!(f, "AP@{base:#x}"),
        }
    }
}

/// A typed debug port register.
pub trait DpRegister: From<u32> + Into<u32> + Clone {
    /// The register's DPBANKSEL bank.
    const BANK: u8;
    /// The register's address, one of `0x0`, `0x4`, `0x8`, `0xC`.
    const ADDRESS: u8;
    /// The register's name.
    const NAME: &'static str;
}

/// A typed access port register.
pub trait ApRegister: From<u32> + Into<u32> + Clone {
    /// Byte offset of the register within the AP register file.
    const ADDRESS: u8;
    /// The register's name.
    const NAME: &'static str;
}

/// Lowest-level DAP access: single register transfers over the wire with
/// classical read semantics (the transport hides read posting), plus the
/// wire housekeeping operations the engine needs.
///
/// Implemented by the SWD driver and the JTAG DPACC/APACC transport. All
/// WAIT/FAULT retry policy lives a level up, in
/// [`ArmCommunicationInterface`].
pub trait RawDapAccess {
    /// Read a DP or AP register.
    fn raw_read_register(&mut self, port: PortType, address: u8) -> Result<u32, DapError>;

    /// Write a DP or AP register.
    fn raw_write_register(
        &mut self,
        port: PortType,
        address: u8,
        value: u32,
    ) -> Result<(), DapError>;

    /// Clock out a raw bit string on SWDIO/TMS, LSB first.
    fn swj_sequence(&mut self, bit_len: u8, bits: u64);

    /// Reset the wire interface (SWD line reset / JTAG TAP reset).
    fn line_reset(&mut self);

    /// Run the protocol selection sequence for this transport.
    fn protocol_switch(&mut self);

    /// Clock idle cycles.
    fn idle_cycles(&mut self, count: usize);

    /// Set the clock divider. `0` is the fastest the platform can toggle.
    fn set_divider(&mut self, divider: u32);

    /// The current clock divider.
    fn divider(&self) -> u32;

    /// The active wire protocol.
    fn protocol(&self) -> WireProtocol;

    /// Drive or release the target reset line.
    fn set_nrst(&mut self, asserted: bool);

    /// Sense the target reset line.
    fn nrst(&mut self) -> bool {
        false
    }
}
