use crate::architecture::arm::ArmError;
use crate::architecture::riscv::RiscvError;
use crate::flashing::FlashError;

/// The overarching error type which contains all possible errors as
/// variants.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// An ARM specific error occurred.
    #[error("An ARM specific error occurred.")]
    Arm(#[from] ArmError),
    /// A RISC-V specific error occurred.
    #[error("A RISC-V specific error occurred.")]
    Riscv(#[from] RiscvError),
    /// An error during flash programming occurred.
    #[error("An error during flash programming occurred.")]
    Flash(#[from] FlashError),
    /// A command needed an attached target but none is attached.
    #[error("No target is attached.")]
    NoTarget,
    /// The target with the given id does not exist.
    #[error("Target {0} does not exist.")]
    TargetNotFound(usize),
    /// Communication with the target broke down; it must be rescanned.
    #[error("The connection to the target was lost.")]
    TargetLost,
    /// An operation timed out.
    #[error("An operation timed out.")]
    Timeout,
    /// The request addressed a register outside the advertised file.
    #[error("Register {0} is not part of the register file.")]
    InvalidRegister(u16),
    /// All matching hardware comparator units are occupied.
    #[error("No free hardware breakpoint/watchpoint unit.")]
    NoHardwareResource,
    /// The requested operation is not supported by this core.
    #[error("The operation is not supported: {0}")]
    Unsupported(&'static str),
}

impl Error {
    /// Whether this error means the wire itself is gone, requiring a
    /// reattach rather than a retry.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::Arm(ArmError::Protocol(_)) => true,
            Error::Riscv(RiscvError::Transport(_)) => true,
            Error::TargetLost => true,
            _ => false,
        }
    }
}
