//! The generic core abstraction.
//!
//! A [`CoreInterface`] is the capability set every debuggable CPU core
//! offers, independent of its architecture: halt control, register and
//! memory access, and breakpoint/watchpoint management. The Cortex-M and
//! RISC-V runtimes implement it; everything above (session, GDB server)
//! talks only to the trait.

use std::time::Duration;

use crate::Error;

/// The halt confirmation deadline used by the runtimes.
pub const HALT_POLL_TIMEOUT: Duration = Duration::from_millis(250);

/// What a core is currently doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreStatus {
    /// The core is executing.
    Running,
    /// The core is halted in debug state.
    Halted(HaltReason),
    /// The core sits in an unrecoverable lockup.
    LockedUp,
    /// The core is sleeping, waiting for an event or interrupt.
    Sleeping,
    /// The probe lost contact with the core.
    Lost,
}

impl CoreStatus {
    /// Whether the core is halted in debug state.
    pub fn is_halted(&self) -> bool {
        matches!(self, CoreStatus::Halted(_))
    }
}

/// Why a core entered debug state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaltReason {
    /// An explicit halt request from the probe.
    Request,
    /// A breakpoint, hardware or software.
    Breakpoint,
    /// A data watchpoint.
    Watchpoint,
    /// A single step completed.
    Step,
    /// The core halted out of reset (vector catch or reset-halt).
    Reset,
    /// An external debug request.
    External,
    /// Several causes were flagged at once.
    Multiple,
    /// The reason could not be determined.
    Unknown,
}

/// Core state snapshot returned by halt-like operations.
#[derive(Debug, Clone, Copy)]
pub struct CoreInformation {
    /// The program counter at the halt.
    pub pc: u64,
}

/// Index of a register in the core's advertised register file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterId(pub u16);

/// Description of one register in the file advertised to the debugger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoreRegister {
    /// Register name as shown to the user.
    pub name: &'static str,
    /// Index in the register file.
    pub id: RegisterId,
    /// Width in bits.
    pub bits: usize,
}

/// The family a core belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreKind {
    /// ARM Cortex-M.
    CortexM,
    /// ARM Cortex-A.
    CortexA,
    /// ARM Cortex-R.
    CortexR,
    /// 32-bit RISC-V.
    Riscv32,
}

impl CoreKind {
    /// The conventional name of the core family.
    pub fn as_str(&self) -> &'static str {
        match self {
            CoreKind::CortexM => "cortex-m",
            CoreKind::CortexA => "cortex-a",
            CoreKind::CortexR => "cortex-r",
            CoreKind::Riscv32 => "rv32",
        }
    }

    /// The GDB architecture name for the target description.
    pub fn gdb_arch(&self) -> &'static str {
        match self {
            CoreKind::CortexM => "arm",
            CoreKind::CortexA | CoreKind::CortexR => "arm",
            CoreKind::Riscv32 => "riscv:rv32",
        }
    }
}

/// The kinds of breakpoints and watchpoints a debugger can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakwatchKind {
    /// A software breakpoint planted into code memory.
    SoftwareBreak,
    /// A hardware breakpoint comparator.
    HardwareBreak,
    /// Break on read access.
    ReadWatch,
    /// Break on write access.
    WriteWatch,
    /// Break on any access.
    AccessWatch,
}

/// A user-visible breakpoint or watchpoint request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Breakwatch {
    /// What to watch for.
    pub kind: BreakwatchKind,
    /// Target address.
    pub address: u64,
    /// Size in bytes. For breakpoints this is the instruction kind GDB
    /// passed (2 or 4 on ARM); for watchpoints the watched range.
    pub size: u64,
    /// Opaque per-driver storage, typically the hardware unit index and the
    /// saved instruction of a software breakpoint.
    pub reserved: [u32; 2],
}

impl Breakwatch {
    /// A new request with empty driver state.
    pub fn new(kind: BreakwatchKind, address: u64, size: u64) -> Self {
        Self {
            kind,
            address,
            size,
            reserved: [0; 2],
        }
    }
}

/// A memory mapped register, e.g. the ARM debug registers (DHCSR and
/// friends). Also used for registers living in other probe-visible address
/// spaces, such as the RISC-V debug module registers, where `ADDRESS` is the
/// address within that space.
pub trait MemoryMappedRegister<T>: Clone + From<T> + Into<T> {
    /// The register's address in its address space.
    const ADDRESS: u64;
    /// The register's name.
    const NAME: &'static str;
}

/// Defines a [`MemoryMappedRegister`] bitfield type in one go: the
/// `bitfield!` mapping, the `From` conversions and the trait impl with
/// address and name.
macro_rules! memory_mapped_bitfield_register {
    ($(#[$outer:meta])* pub struct $name:ident($reg:ty); $addr:expr, $reg_name:expr, impl From; $($rest:tt)*) => {
        bitfield::bitfield! {
            $(#[$outer])*
            #[derive(Copy, Clone)]
            pub struct $name($reg);
            impl Debug;
            $($rest)*
        }

        impl From<$reg> for $name {
            fn from(value: $reg) -> Self {
                Self(value)
            }
        }

        impl From<$name> for $reg {
            fn from(register: $name) -> Self {
                register.0
            }
        }

        impl $crate::core::MemoryMappedRegister<$reg> for $name {
            const ADDRESS: u64 = $addr;
            const NAME: &'static str = $reg_name;
        }
    };
}

pub(crate) use memory_mapped_bitfield_register;

/// The capability set of a debuggable core.
pub trait CoreInterface {
    /// Poll the current status.
    fn status(&mut self) -> Result<CoreStatus, Error>;

    /// Whether the core is halted right now.
    fn core_halted(&mut self) -> Result<bool, Error> {
        Ok(self.status()?.is_halted())
    }

    /// Request a halt and wait for it to take effect.
    fn halt(&mut self, timeout: Duration) -> Result<CoreInformation, Error>;

    /// Resume execution.
    fn run(&mut self) -> Result<(), Error>;

    /// Execute a single instruction and halt again.
    fn step(&mut self) -> Result<CoreInformation, Error>;

    /// Reset the core and let it run.
    fn reset(&mut self) -> Result<(), Error>;

    /// Reset the core and catch it before the first instruction.
    fn reset_and_halt(&mut self, timeout: Duration) -> Result<CoreInformation, Error>;

    /// Read one register of the advertised file.
    fn read_core_reg(&mut self, id: RegisterId) -> Result<u32, Error>;

    /// Write one register of the advertised file.
    fn write_core_reg(&mut self, id: RegisterId, value: u32) -> Result<(), Error>;

    /// The register file advertised to the debugger, in `g`-packet order.
    fn registers(&self) -> &'static [CoreRegister];

    /// Read target memory.
    fn read_memory(&mut self, address: u64, data: &mut [u8]) -> Result<(), Error>;

    /// Write target memory.
    fn write_memory(&mut self, address: u64, data: &[u8]) -> Result<(), Error>;

    /// Install a breakpoint or watchpoint, stashing whatever the driver
    /// needs for removal in `breakwatch.reserved`.
    fn set_breakwatch(&mut self, breakwatch: &mut Breakwatch) -> Result<(), Error>;

    /// Remove a previously installed breakpoint or watchpoint.
    fn clear_breakwatch(&mut self, breakwatch: &Breakwatch) -> Result<(), Error>;

    /// The core family.
    fn kind(&self) -> CoreKind;
}
