//! RISC-V debug support, debug specification v0.13.
//!
//! Talks to the debug module through a [`DmiAccess`] transport: halt and
//! resume through `dmcontrol`/`dmstatus`, registers through abstract
//! commands, memory through small program buffer sequences, and hardware
//! breakpoints/watchpoints through the trigger module.

pub mod dtm;

use std::time::{Duration, Instant};

use crate::core::{
    memory_mapped_bitfield_register, Breakwatch, BreakwatchKind, CoreInformation, CoreInterface,
    CoreKind, CoreRegister, CoreStatus, HaltReason, MemoryMappedRegister, RegisterId,
    HALT_POLL_TIMEOUT,
};
use crate::Error;
use dtm::{DmiAccess, DtmError};

/// Some error occurred when working with the RISC-V core.
#[derive(thiserror::Error, Debug)]
pub enum RiscvError {
    /// An error occurred during transport.
    #[error("Error during the debug module transport")]
    Transport(#[from] DtmError),
    /// A timeout occurred while waiting on the debug module.
    #[error("Timeout while waiting on the debug module.")]
    Timeout,
    /// An error occurred during the execution of an abstract command.
    #[error("Error occurred during execution of an abstract command: {0:?}")]
    AbstractCommand(AbstractCommandErrorKind),
    /// The request for reset, resume or halt was not acknowledged.
    #[error("The core did not acknowledge a request for reset, resume or halt")]
    RequestNotAcknowledged,
    /// This version of the debug module is not supported.
    #[error("The version '{0}' of the debug module is currently not supported.")]
    UnsupportedDebugModuleVersion(u8),
    /// The program buffer is too small for the required sequence.
    #[error("Program buffer is too small for the required sequence.")]
    ProgramBufferTooSmall,
    /// No free trigger of the required type is available.
    #[error("No trigger unit supporting the requested match is free.")]
    NoFreeTrigger,
}

/// Errors which can occur while executing an abstract command, from
/// abstractcs.cmderr.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbstractCommandErrorKind {
    /// A command was issued while one was executing.
    Busy,
    /// The command is not supported.
    NotSupported,
    /// An exception occurred while executing the command.
    Exception,
    /// The hart was not in the required state.
    HaltResume,
    /// A bus error occurred.
    Bus,
    /// Some other error occurred.
    Other,
}

impl AbstractCommandErrorKind {
    fn parse(cmderr: u8) -> Option<Self> {
        match cmderr {
            0 => None,
            1 => Some(AbstractCommandErrorKind::Busy),
            2 => Some(AbstractCommandErrorKind::NotSupported),
            3 => Some(AbstractCommandErrorKind::Exception),
            4 => Some(AbstractCommandErrorKind::HaltResume),
            5 => Some(AbstractCommandErrorKind::Bus),
            _ => Some(AbstractCommandErrorKind::Other),
        }
    }
}

memory_mapped_bitfield_register! {
    /// Debug module control.
    pub struct Dmcontrol(u32); 0x10, "dmcontrol", impl From;
    pub haltreq, set_haltreq: 31;
    pub resumereq, set_resumereq: 30;
    pub hartreset, set_hartreset: 29;
    pub ackhavereset, set_ackhavereset: 28;
    pub u16, hartsello, set_hartsello: 25, 16;
    pub ndmreset, set_ndmreset: 1;
    pub dmactive, set_dmactive: 0;
}

memory_mapped_bitfield_register! {
    /// Debug module status.
    pub struct Dmstatus(u32); 0x11, "dmstatus", impl From;
    pub allhavereset, _: 19;
    pub anyhavereset, _: 18;
    pub allresumeack, _: 17;
    pub anyresumeack, _: 16;
    pub allunavail, _: 13;
    pub allrunning, _: 11;
    pub anyrunning, _: 10;
    pub allhalted, _: 9;
    pub anyhalted, _: 8;
    pub authenticated, _: 7;
    pub u8, version, _: 3, 0;
}

memory_mapped_bitfield_register! {
    /// Abstract command control and status.
    pub struct Abstractcs(u32); 0x16, "abstractcs", impl From;
    pub u8, progbufsize, _: 28, 24;
    pub busy, _: 12;
    pub u8, cmderr, set_cmderr: 10, 8;
    pub u8, datacount, _: 3, 0;
}

memory_mapped_bitfield_register! {
    /// Abstract command request.
    pub struct Command(u32); 0x17, "command", impl From;
    pub u8, cmdtype, set_cmdtype: 31, 24;
    pub u8, aarsize, set_aarsize: 22, 20;
    pub aarpostincrement, set_aarpostincrement: 19;
    pub postexec, set_postexec: 18;
    pub transfer, set_transfer: 17;
    pub write, set_write: 16;
    pub u16, regno, set_regno: 15, 0;
}

/// DMI addresses of data0 and data1.
const DM_DATA0: u8 = 0x04;
const DM_DATA1: u8 = 0x05;
/// DMI address of progbuf0.
const DM_PROGBUF0: u8 = 0x20;

/// Abstract regno base of the general purpose registers.
const REGNO_GPR_BASE: u16 = 0x1000;
/// Abstract regno of s0/x8 and s1/x9, the scratch registers of the program
/// buffer sequences.
const REGNO_S0: u16 = REGNO_GPR_BASE + 8;
const REGNO_S1: u16 = REGNO_GPR_BASE + 9;

/// CSR numbers used by the runtime.
const CSR_TSELECT: u16 = 0x7A0;
const CSR_TDATA1: u16 = 0x7A1;
const CSR_TDATA2: u16 = 0x7A2;
const CSR_DCSR: u16 = 0x7B0;
const CSR_DPC: u16 = 0x7B1;

/// dcsr.step.
const DCSR_STEP: u32 = 1 << 2;
/// dcsr.cause field.
const DCSR_CAUSE_SHIFT: u32 = 6;
const DCSR_CAUSE_MASK: u32 = 0x7;

/// RV32I encodings for the program buffer.
mod assembly {
    /// `lw rd, offset(rs1)`
    pub fn lw(offset: u32, rs1: u32, rd: u32) -> u32 {
        (offset << 20) | (rs1 << 15) | (0b010 << 12) | (rd << 7) | 0b0000011
    }

    /// `lh rd, offset(rs1)`
    pub fn lh(offset: u32, rs1: u32, rd: u32) -> u32 {
        (offset << 20) | (rs1 << 15) | (0b001 << 12) | (rd << 7) | 0b0000011
    }

    /// `lb rd, offset(rs1)`
    pub fn lb(offset: u32, rs1: u32, rd: u32) -> u32 {
        (offset << 20) | (rs1 << 15) | (0b000 << 12) | (rd << 7) | 0b0000011
    }

    /// `sw rs2, offset(rs1)`
    pub fn sw(offset: u32, rs1: u32, rs2: u32) -> u32 {
        ((offset & 0xFE0) << 20)
            | (rs2 << 20)
            | (rs1 << 15)
            | (0b010 << 12)
            | ((offset & 0x1F) << 7)
            | 0b0100011
    }

    /// `sh rs2, offset(rs1)`
    pub fn sh(offset: u32, rs1: u32, rs2: u32) -> u32 {
        ((offset & 0xFE0) << 20)
            | (rs2 << 20)
            | (rs1 << 15)
            | (0b001 << 12)
            | ((offset & 0x1F) << 7)
            | 0b0100011
    }

    /// `sb rs2, offset(rs1)`
    pub fn sb(offset: u32, rs1: u32, rs2: u32) -> u32 {
        ((offset & 0xFE0) << 20)
            | (rs2 << 20)
            | (rs1 << 15)
            | (0b000 << 12)
            | ((offset & 0x1F) << 7)
            | 0b0100011
    }

    /// `ebreak`
    pub const EBREAK: u32 = 0x0010_0073;
}

/// Discovered facts about the debug module connection.
#[derive(Debug, Default)]
pub struct RiscvState {
    progbuf_size: usize,
    /// Whether the access-memory abstract command works; probed on first
    /// use, `None` until then.
    abstract_memory: Option<bool>,
}

/// Communication with a RISC-V debug module.
pub struct RiscvCommunicationInterface {
    dtm: Box<dyn DmiAccess>,
    state: RiscvState,
}

impl RiscvCommunicationInterface {
    /// Attach to the debug module and bring it out of reset.
    pub fn new(dtm: Box<dyn DmiAccess>) -> Result<Self, RiscvError> {
        let mut this = Self {
            dtm,
            state: RiscvState::default(),
        };
        this.enter_debug_mode()?;
        Ok(this)
    }

    pub fn close(self) -> Box<dyn DmiAccess> {
        self.dtm
    }

    fn enter_debug_mode(&mut self) -> Result<(), RiscvError> {
        // Reset the debug module state machine, then activate it.
        let mut dmcontrol = Dmcontrol(0);
        self.write_dm_register(dmcontrol)?;
        dmcontrol.set_dmactive(true);
        self.write_dm_register(dmcontrol)?;

        let dmstatus: Dmstatus = self.read_dm_register()?;
        if dmstatus.version() != 2 {
            return Err(RiscvError::UnsupportedDebugModuleVersion(
                dmstatus.version(),
            ));
        }

        let abstractcs: Abstractcs = self.read_dm_register()?;
        self.state.progbuf_size = usize::from(abstractcs.progbufsize());
        tracing::debug!(
            "Debug module: progbuf {} words, {} data registers",
            self.state.progbuf_size,
            abstractcs.datacount()
        );
        Ok(())
    }

    pub(crate) fn read_dm_register<R: MemoryMappedRegister<u32>>(
        &mut self,
    ) -> Result<R, RiscvError> {
        let value = self.dtm.dmi_read(R::ADDRESS as u8)?;
        tracing::trace!("Read DM register {}: {value:#010x}", R::NAME);
        Ok(R::from(value))
    }

    pub(crate) fn write_dm_register<R: MemoryMappedRegister<u32>>(
        &mut self,
        register: R,
    ) -> Result<(), RiscvError> {
        let value: u32 = register.into();
        tracing::trace!("Writing DM register {}: {value:#010x}", R::NAME);
        self.dtm.dmi_write(R::ADDRESS as u8, value)?;
        Ok(())
    }

    /// Execute one abstract command and decode cmderr.
    fn execute_abstract_command(&mut self, command: Command) -> Result<(), RiscvError> {
        self.write_dm_register(command)?;

        let start = Instant::now();
        let abstractcs = loop {
            let abstractcs: Abstractcs = self.read_dm_register()?;
            if !abstractcs.busy() {
                break abstractcs;
            }
            if start.elapsed() > HALT_POLL_TIMEOUT {
                return Err(RiscvError::Timeout);
            }
        };

        if let Some(kind) = AbstractCommandErrorKind::parse(abstractcs.cmderr()) {
            // cmderr is sticky, write-one-to-clear.
            let mut clear = Abstractcs(0);
            clear.set_cmderr(0x7);
            self.write_dm_register(clear)?;
            return Err(RiscvError::AbstractCommand(kind));
        }
        Ok(())
    }

    /// Read a register through an access-register abstract command.
    pub fn abstract_register_read(&mut self, regno: u16) -> Result<u32, RiscvError> {
        let mut command = Command(0);
        command.set_cmdtype(0);
        command.set_aarsize(2);
        command.set_transfer(true);
        command.set_regno(regno);
        self.execute_abstract_command(command)?;
        Ok(self.dtm.dmi_read(DM_DATA0)?)
    }

    /// Write a register through an access-register abstract command.
    pub fn abstract_register_write(&mut self, regno: u16, value: u32) -> Result<(), RiscvError> {
        self.dtm.dmi_write(DM_DATA0, value)?;
        let mut command = Command(0);
        command.set_cmdtype(0);
        command.set_aarsize(2);
        command.set_transfer(true);
        command.set_write(true);
        command.set_regno(regno);
        self.execute_abstract_command(command)
    }

    /// Load the program buffer. The sequence must leave room for the
    /// trailing `ebreak`.
    fn setup_program_buffer(&mut self, program: &[u32]) -> Result<(), RiscvError> {
        if program.len() + 1 > self.state.progbuf_size {
            return Err(RiscvError::ProgramBufferTooSmall);
        }
        for (index, instruction) in program.iter().enumerate() {
            self.dtm
                .dmi_write(DM_PROGBUF0 + index as u8, *instruction)?;
        }
        self.dtm
            .dmi_write(DM_PROGBUF0 + program.len() as u8, assembly::EBREAK)?;
        Ok(())
    }

    /// Write a register and run the program buffer afterwards.
    fn register_write_with_exec(&mut self, regno: u16, value: u32) -> Result<(), RiscvError> {
        self.dtm.dmi_write(DM_DATA0, value)?;
        let mut command = Command(0);
        command.set_cmdtype(0);
        command.set_aarsize(2);
        command.set_transfer(true);
        command.set_write(true);
        command.set_postexec(true);
        command.set_regno(regno);
        self.execute_abstract_command(command)
    }

    fn save_s0(&mut self) -> Result<u32, RiscvError> {
        self.abstract_register_read(REGNO_S0)
    }

    fn restore_s0(&mut self, saved: u32) -> Result<(), RiscvError> {
        self.abstract_register_write(REGNO_S0, saved)
    }

    /// One memory beat: the access-memory abstract command where the
    /// module implements it, else a load through the program buffer.
    fn read_memory_word(&mut self, address: u32, width: usize) -> Result<u32, RiscvError> {
        if self.state.abstract_memory != Some(false) {
            match self.abstract_memory_access(address, width, None) {
                Ok(value) => {
                    self.state.abstract_memory = Some(true);
                    return Ok(value);
                }
                Err(RiscvError::AbstractCommand(AbstractCommandErrorKind::NotSupported)) => {
                    tracing::debug!("No access-memory support; using the program buffer");
                    self.state.abstract_memory = Some(false);
                }
                Err(error) => return Err(error),
            }
        }
        self.read_memory_word_progbuf(address, width)
    }

    /// One memory beat through an access-memory abstract command. `data`
    /// selects between a write (`Some`) and a read (`None`).
    fn abstract_memory_access(
        &mut self,
        address: u32,
        width: usize,
        data: Option<u32>,
    ) -> Result<u32, RiscvError> {
        self.dtm.dmi_write(DM_DATA1, address)?;
        if let Some(value) = data {
            self.dtm.dmi_write(DM_DATA0, value)?;
        }

        let mut command = Command(0);
        command.set_cmdtype(2);
        command.set_aarsize(match width {
            1 => 0,
            2 => 1,
            _ => 2,
        });
        command.set_write(data.is_some());
        self.execute_abstract_command(command)?;

        if data.is_some() {
            Ok(0)
        } else {
            Ok(self.dtm.dmi_read(DM_DATA0)?)
        }
    }

    fn read_memory_word_progbuf(&mut self, address: u32, width: usize) -> Result<u32, RiscvError> {
        let saved_s0 = self.save_s0()?;

        let load = match width {
            1 => assembly::lb(0, 8, 8),
            2 => assembly::lh(0, 8, 8),
            _ => assembly::lw(0, 8, 8),
        };
        self.setup_program_buffer(&[load])?;
        self.register_write_with_exec(REGNO_S0, address)?;
        let value = self.abstract_register_read(REGNO_S0)?;

        self.restore_s0(saved_s0)?;
        Ok(value)
    }

    /// One memory beat out: access-memory when available, else a store
    /// through the program buffer.
    fn write_memory_word(&mut self, address: u32, width: usize, value: u32) -> Result<(), RiscvError> {
        if self.state.abstract_memory != Some(false) {
            match self.abstract_memory_access(address, width, Some(value)) {
                Ok(_) => {
                    self.state.abstract_memory = Some(true);
                    return Ok(());
                }
                Err(RiscvError::AbstractCommand(AbstractCommandErrorKind::NotSupported)) => {
                    tracing::debug!("No access-memory support; using the program buffer");
                    self.state.abstract_memory = Some(false);
                }
                Err(error) => return Err(error),
            }
        }
        self.write_memory_word_progbuf(address, width, value)
    }

    fn write_memory_word_progbuf(
        &mut self,
        address: u32,
        width: usize,
        value: u32,
    ) -> Result<(), RiscvError> {
        let saved_s0 = self.save_s0()?;
        let saved_s1 = self.abstract_register_read(REGNO_S1)?;

        let store = match width {
            1 => assembly::sb(0, 8, 9),
            2 => assembly::sh(0, 8, 9),
            _ => assembly::sw(0, 8, 9),
        };
        self.setup_program_buffer(&[store])?;
        self.abstract_register_write(REGNO_S0, address)?;
        self.register_write_with_exec(REGNO_S1, value)?;

        self.abstract_register_write(REGNO_S1, saved_s1)?;
        self.restore_s0(saved_s0)?;
        Ok(())
    }

    pub fn halt(&mut self, timeout: Duration) -> Result<(), RiscvError> {
        let mut dmcontrol = Dmcontrol(0);
        dmcontrol.set_dmactive(true);
        dmcontrol.set_haltreq(true);
        self.write_dm_register(dmcontrol)?;

        let start = Instant::now();
        loop {
            let dmstatus: Dmstatus = self.read_dm_register()?;
            if dmstatus.allhalted() {
                break;
            }
            if start.elapsed() > timeout {
                return Err(RiscvError::RequestNotAcknowledged);
            }
        }

        let mut dmcontrol = Dmcontrol(0);
        dmcontrol.set_dmactive(true);
        self.write_dm_register(dmcontrol)?;
        Ok(())
    }

    pub fn resume(&mut self) -> Result<(), RiscvError> {
        let mut dmcontrol = Dmcontrol(0);
        dmcontrol.set_dmactive(true);
        dmcontrol.set_resumereq(true);
        self.write_dm_register(dmcontrol)?;

        let start = Instant::now();
        loop {
            let dmstatus: Dmstatus = self.read_dm_register()?;
            if dmstatus.allresumeack() {
                break;
            }
            if start.elapsed() > HALT_POLL_TIMEOUT {
                return Err(RiscvError::RequestNotAcknowledged);
            }
        }

        let mut dmcontrol = Dmcontrol(0);
        dmcontrol.set_dmactive(true);
        self.write_dm_register(dmcontrol)?;
        Ok(())
    }

    fn halted(&mut self) -> Result<bool, RiscvError> {
        let dmstatus: Dmstatus = self.read_dm_register()?;
        Ok(dmstatus.allhalted())
    }

    /// The debug entry cause from dcsr.
    fn halt_cause(&mut self) -> Result<HaltReason, RiscvError> {
        let dcsr = self.abstract_register_read(CSR_DCSR)?;
        Ok(match (dcsr >> DCSR_CAUSE_SHIFT) & DCSR_CAUSE_MASK {
            1 => HaltReason::Breakpoint,
            2 => HaltReason::Watchpoint,
            3 => HaltReason::Request,
            4 => HaltReason::Step,
            5 => HaltReason::Reset,
            _ => HaltReason::Unknown,
        })
    }
}

/// Number of triggers probed before concluding the list ended.
const MAX_TRIGGERS: u16 = 16;

/// mcontrol field encodings (debug spec §5.2).
const MCONTROL_TYPE_MATCH: u32 = 2 << 28;
const MCONTROL_DMODE: u32 = 1 << 27;
const MCONTROL_ACTION_DEBUG: u32 = 1 << 12;
const MCONTROL_M: u32 = 1 << 6;
const MCONTROL_S: u32 = 1 << 4;
const MCONTROL_U: u32 = 1 << 3;
const MCONTROL_EXECUTE: u32 = 1 << 2;
const MCONTROL_STORE: u32 = 1 << 1;
const MCONTROL_LOAD: u32 = 1 << 0;

impl RiscvCommunicationInterface {
    fn mcontrol_for(kind: BreakwatchKind) -> u32 {
        let base = MCONTROL_TYPE_MATCH
            | MCONTROL_DMODE
            | MCONTROL_ACTION_DEBUG
            | MCONTROL_M
            | MCONTROL_S
            | MCONTROL_U;
        match kind {
            BreakwatchKind::HardwareBreak | BreakwatchKind::SoftwareBreak => {
                base | MCONTROL_EXECUTE
            }
            BreakwatchKind::ReadWatch => base | MCONTROL_LOAD,
            BreakwatchKind::WriteWatch => base | MCONTROL_STORE,
            BreakwatchKind::AccessWatch => base | MCONTROL_LOAD | MCONTROL_STORE,
        }
    }

    /// Find a free address-match trigger.
    fn free_trigger(&mut self) -> Result<u16, RiscvError> {
        for index in 0..MAX_TRIGGERS {
            if self
                .abstract_register_write(CSR_TSELECT, u32::from(index))
                .is_err()
            {
                break;
            }
            // Writing tselect beyond the last trigger doesn't read back.
            if self.abstract_register_read(CSR_TSELECT)? != u32::from(index) {
                break;
            }

            let tdata1 = self.abstract_register_read(CSR_TDATA1)?;
            let trigger_type = tdata1 >> 28;
            // Type 0 is an unused slot; type 2 with no match bits armed is
            // an mcontrol trigger nobody owns.
            if trigger_type == 0
                || (trigger_type == 2
                    && tdata1 & (MCONTROL_EXECUTE | MCONTROL_LOAD | MCONTROL_STORE) == 0)
            {
                return Ok(index);
            }
        }
        Err(RiscvError::NoFreeTrigger)
    }

    fn set_trigger(&mut self, breakwatch: &mut Breakwatch) -> Result<(), RiscvError> {
        let index = self.free_trigger()?;
        self.abstract_register_write(CSR_TSELECT, u32::from(index))?;
        self.abstract_register_write(CSR_TDATA2, breakwatch.address as u32)?;
        self.abstract_register_write(CSR_TDATA1, Self::mcontrol_for(breakwatch.kind))?;
        breakwatch.reserved[0] = u32::from(index);
        tracing::debug!(
            "Trigger {index} armed at {:#010x} for {:?}",
            breakwatch.address,
            breakwatch.kind
        );
        Ok(())
    }

    fn clear_trigger(&mut self, breakwatch: &Breakwatch) -> Result<(), RiscvError> {
        self.abstract_register_write(CSR_TSELECT, breakwatch.reserved[0])?;
        self.abstract_register_write(CSR_TDATA1, 0)?;
        self.abstract_register_write(CSR_TDATA2, 0)?;
        Ok(())
    }
}

/// The register file advertised for an RV32 hart: the 32 GPRs by ABI name,
/// then the program counter.
#[rustfmt::skip]
static RISCV_REGISTERS: [CoreRegister; 33] = [
    CoreRegister { name: "zero", id: RegisterId(0), bits: 32 },
    CoreRegister { name: "ra", id: RegisterId(1), bits: 32 },
    CoreRegister { name: "sp", id: RegisterId(2), bits: 32 },
    CoreRegister { name: "gp", id: RegisterId(3), bits: 32 },
    CoreRegister { name: "tp", id: RegisterId(4), bits: 32 },
    CoreRegister { name: "t0", id: RegisterId(5), bits: 32 },
    CoreRegister { name: "t1", id: RegisterId(6), bits: 32 },
    CoreRegister { name: "t2", id: RegisterId(7), bits: 32 },
    CoreRegister { name: "fp", id: RegisterId(8), bits: 32 },
    CoreRegister { name: "s1", id: RegisterId(9), bits: 32 },
    CoreRegister { name: "a0", id: RegisterId(10), bits: 32 },
    CoreRegister { name: "a1", id: RegisterId(11), bits: 32 },
    CoreRegister { name: "a2", id: RegisterId(12), bits: 32 },
    CoreRegister { name: "a3", id: RegisterId(13), bits: 32 },
    CoreRegister { name: "a4", id: RegisterId(14), bits: 32 },
    CoreRegister { name: "a5", id: RegisterId(15), bits: 32 },
    CoreRegister { name: "a6", id: RegisterId(16), bits: 32 },
    CoreRegister { name: "a7", id: RegisterId(17), bits: 32 },
    CoreRegister { name: "s2", id: RegisterId(18), bits: 32 },
    CoreRegister { name: "s3", id: RegisterId(19), bits: 32 },
    CoreRegister { name: "s4", id: RegisterId(20), bits: 32 },
    CoreRegister { name: "s5", id: RegisterId(21), bits: 32 },
    CoreRegister { name: "s6", id: RegisterId(22), bits: 32 },
    CoreRegister { name: "s7", id: RegisterId(23), bits: 32 },
    CoreRegister { name: "s8", id: RegisterId(24), bits: 32 },
    CoreRegister { name: "s9", id: RegisterId(25), bits: 32 },
    CoreRegister { name: "s10", id: RegisterId(26), bits: 32 },
    CoreRegister { name: "s11", id: RegisterId(27), bits: 32 },
    CoreRegister { name: "t3", id: RegisterId(28), bits: 32 },
    CoreRegister { name: "t4", id: RegisterId(29), bits: 32 },
    CoreRegister { name: "t5", id: RegisterId(30), bits: 32 },
    CoreRegister { name: "t6", id: RegisterId(31), bits: 32 },
    CoreRegister { name: "pc", id: RegisterId(32), bits: 32 },
];

/// Index of the program counter in the register file.
pub const RISCV_PC: RegisterId = RegisterId(32);

/// An RV32 hart as a generic debuggable core.
pub struct Riscv32<'probe> {
    interface: &'probe mut RiscvCommunicationInterface,
}

impl<'probe> Riscv32<'probe> {
    pub fn new(interface: &'probe mut RiscvCommunicationInterface) -> Self {
        Self { interface }
    }

    fn regno(id: RegisterId) -> Result<u16, Error> {
        match id.0 {
            0..=31 => Ok(REGNO_GPR_BASE + id.0),
            32 => Ok(CSR_DPC),
            other => Err(Error::InvalidRegister(other)),
        }
    }

    fn pc(&mut self) -> Result<u64, Error> {
        Ok(u64::from(
            self.interface.abstract_register_read(CSR_DPC).map_err(Error::from)?,
        ))
    }
}

impl CoreInterface for Riscv32<'_> {
    fn status(&mut self) -> Result<CoreStatus, Error> {
        if self.interface.halted()? {
            Ok(CoreStatus::Halted(self.interface.halt_cause()?))
        } else {
            Ok(CoreStatus::Running)
        }
    }

    fn halt(&mut self, timeout: Duration) -> Result<CoreInformation, Error> {
        self.interface.halt(timeout)?;
        let pc = self.pc()?;
        Ok(CoreInformation { pc })
    }

    fn run(&mut self) -> Result<(), Error> {
        self.interface.resume()?;
        Ok(())
    }

    fn step(&mut self) -> Result<CoreInformation, Error> {
        let dcsr = self.interface.abstract_register_read(CSR_DCSR)?;
        self.interface
            .abstract_register_write(CSR_DCSR, dcsr | DCSR_STEP)?;

        self.interface.resume()?;

        let start = Instant::now();
        while !self.interface.halted()? {
            if start.elapsed() > HALT_POLL_TIMEOUT {
                return Err(Error::Timeout);
            }
        }

        let dcsr = self.interface.abstract_register_read(CSR_DCSR)?;
        self.interface
            .abstract_register_write(CSR_DCSR, dcsr & !DCSR_STEP)?;

        let pc = self.pc()?;
        Ok(CoreInformation { pc })
    }

    fn reset(&mut self) -> Result<(), Error> {
        let mut dmcontrol = Dmcontrol(0);
        dmcontrol.set_dmactive(true);
        dmcontrol.set_ndmreset(true);
        self.interface.write_dm_register(dmcontrol)?;

        let mut dmcontrol = Dmcontrol(0);
        dmcontrol.set_dmactive(true);
        self.interface.write_dm_register(dmcontrol)?;
        Ok(())
    }

    fn reset_and_halt(&mut self, timeout: Duration) -> Result<CoreInformation, Error> {
        // Hold the halt request across the reset so the hart stops on the
        // first instruction.
        let mut dmcontrol = Dmcontrol(0);
        dmcontrol.set_dmactive(true);
        dmcontrol.set_haltreq(true);
        dmcontrol.set_ndmreset(true);
        self.interface.write_dm_register(dmcontrol)?;

        let mut dmcontrol = Dmcontrol(0);
        dmcontrol.set_dmactive(true);
        dmcontrol.set_haltreq(true);
        self.interface.write_dm_register(dmcontrol)?;

        self.interface.halt(timeout)?;
        let pc = self.pc()?;
        Ok(CoreInformation { pc })
    }

    fn read_core_reg(&mut self, id: RegisterId) -> Result<u32, Error> {
        let regno = Self::regno(id)?;
        Ok(self.interface.abstract_register_read(regno)?)
    }

    fn write_core_reg(&mut self, id: RegisterId, value: u32) -> Result<(), Error> {
        let regno = Self::regno(id)?;
        Ok(self.interface.abstract_register_write(regno, value)?)
    }

    fn registers(&self) -> &'static [CoreRegister] {
        &RISCV_REGISTERS
    }

    fn read_memory(&mut self, address: u64, data: &mut [u8]) -> Result<(), Error> {
        let mut address = address as u32;
        let mut remaining = data;

        while !remaining.is_empty() {
            if address % 4 == 0 && remaining.len() >= 4 {
                let word = self.interface.read_memory_word(address, 4)?;
                remaining[..4].copy_from_slice(&word.to_le_bytes());
                remaining = &mut remaining[4..];
                address += 4;
            } else {
                let byte = self.interface.read_memory_word(address, 1)?;
                remaining[0] = byte as u8;
                remaining = &mut remaining[1..];
                address += 1;
            }
        }
        Ok(())
    }

    fn write_memory(&mut self, address: u64, data: &[u8]) -> Result<(), Error> {
        let mut address = address as u32;
        let mut remaining = data;

        while !remaining.is_empty() {
            if address % 4 == 0 && remaining.len() >= 4 {
                let word = u32::from_le_bytes(remaining[..4].try_into().unwrap());
                self.interface.write_memory_word(address, 4, word)?;
                remaining = &remaining[4..];
                address += 4;
            } else {
                self.interface
                    .write_memory_word(address, 1, u32::from(remaining[0]))?;
                remaining = &remaining[1..];
                address += 1;
            }
        }
        Ok(())
    }

    fn set_breakwatch(&mut self, breakwatch: &mut Breakwatch) -> Result<(), Error> {
        match self.interface.set_trigger(breakwatch) {
            Ok(()) => Ok(()),
            Err(RiscvError::NoFreeTrigger) => Err(Error::NoHardwareResource),
            Err(error) => Err(error.into()),
        }
    }

    fn clear_breakwatch(&mut self, breakwatch: &Breakwatch) -> Result<(), Error> {
        Ok(self.interface.clear_trigger(breakwatch)?)
    }

    fn kind(&self) -> CoreKind {
        CoreKind::Riscv32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    /// A behavioural debug module: enough dmcontrol/dmstatus/abstract
    /// command emulation to exercise the runtime, including a one-deep
    /// program buffer interpreter for the load/store sequences.
    struct FakeDm {
        halted: bool,
        resumeack: bool,
        data0: u32,
        cmderr: u8,
        progbuf: [u32; 16],
        gprs: [u32; 32],
        csrs: BTreeMap<u16, u32>,
        memory: BTreeMap<u32, u8>,
        triggers: usize,
    }

    impl FakeDm {
        fn new() -> Self {
            Self {
                halted: false,
                resumeack: false,
                data0: 0,
                cmderr: 0,
                progbuf: [0; 16],
                gprs: [0; 32],
                csrs: BTreeMap::new(),
                memory: BTreeMap::new(),
                triggers: 2,
            }
        }

        fn reg_read(&self, regno: u16) -> u32 {
            if regno >= REGNO_GPR_BASE {
                self.gprs[usize::from(regno - REGNO_GPR_BASE)]
            } else {
                self.csrs.get(&regno).copied().unwrap_or(0)
            }
        }

        fn reg_write(&mut self, regno: u16, value: u32) {
            if regno == CSR_TSELECT && value as usize >= self.triggers {
                // Out-of-range tselect writes don't stick.
                return;
            }
            if regno >= REGNO_GPR_BASE {
                self.gprs[usize::from(regno - REGNO_GPR_BASE)] = value;
            } else {
                self.csrs.insert(regno, value);
            }
        }

        /// Interpret the first program buffer instruction.
        fn run_progbuf(&mut self) {
            let instruction = self.progbuf[0];
            let opcode = instruction & 0x7F;
            let funct3 = (instruction >> 12) & 0x7;
            match opcode {
                0b0000011 => {
                    // Loads through s0.
                    let address = self.gprs[8];
                    let value = match funct3 {
                        0b000 => u32::from(self.mem8(address)),
                        0b001 => u32::from(self.mem8(address))
                            | (u32::from(self.mem8(address + 1)) << 8),
                        _ => (0..4)
                            .map(|i| u32::from(self.mem8(address + i)) << (8 * i))
                            .sum(),
                    };
                    let rd = ((instruction >> 7) & 0x1F) as usize;
                    self.gprs[rd] = value;
                }
                0b0100011 => {
                    // Stores of s1 through s0.
                    let address = self.gprs[8];
                    let value = self.gprs[((instruction >> 20) & 0x1F) as usize];
                    let bytes = match funct3 {
                        0b000 => 1,
                        0b001 => 2,
                        _ => 4,
                    };
                    for i in 0..bytes {
                        self.memory
                            .insert(address + i, (value >> (8 * i)) as u8);
                    }
                }
                _ => {}
            }
        }

        fn mem8(&self, address: u32) -> u8 {
            self.memory.get(&address).copied().unwrap_or(0)
        }
    }

    impl DmiAccess for FakeDm {
        fn dmi_read(&mut self, address: u8) -> Result<u32, DtmError> {
            Ok(match address {
                0x11 => {
                    // dmstatus
                    let mut value = 2; // version 0.13
                    value |= 1 << 7; // authenticated
                    if self.halted {
                        value |= (1 << 9) | (1 << 8);
                    } else {
                        value |= (1 << 11) | (1 << 10);
                    }
                    if self.resumeack {
                        value |= (1 << 17) | (1 << 16);
                    }
                    value
                }
                0x16 => (8 << 24) | (u32::from(self.cmderr) << 8), // abstractcs
                0x04 => self.data0,
                _ => 0,
            })
        }

        fn dmi_write(&mut self, address: u8, value: u32) -> Result<(), DtmError> {
            match address {
                0x10 => {
                    // dmcontrol
                    if value & (1 << 31) != 0 {
                        self.halted = true;
                    }
                    if value & (1 << 30) != 0 {
                        self.resumeack = true;
                        let stepping =
                            self.csrs.get(&CSR_DCSR).copied().unwrap_or(0) & DCSR_STEP != 0;
                        if stepping {
                            // One instruction, then back to debug state.
                            let pc = self.csrs.entry(CSR_DPC).or_insert(0);
                            *pc = pc.wrapping_add(4);
                            self.halted = true;
                        } else {
                            self.halted = false;
                        }
                    }
                }
                0x04 => self.data0 = value,
                0x16 => {
                    // abstractcs: cmderr is write-one-to-clear.
                    if value & (0x7 << 8) != 0 {
                        self.cmderr = 0;
                    }
                }
                0x17 => {
                    // command: this module only implements access-register.
                    let cmdtype = (value >> 24) as u8;
                    if cmdtype != 0 {
                        self.cmderr = 2;
                        return Ok(());
                    }
                    let regno = (value & 0xFFFF) as u16;
                    let write = value & (1 << 16) != 0;
                    let transfer = value & (1 << 17) != 0;
                    let postexec = value & (1 << 18) != 0;
                    if transfer {
                        if write {
                            self.reg_write(regno, self.data0);
                        } else {
                            self.data0 = self.reg_read(regno);
                        }
                    }
                    if postexec {
                        self.run_progbuf();
                    }
                }
                a if (0x20..0x30).contains(&a) => {
                    self.progbuf[usize::from(a - 0x20)] = value;
                }
                _ => {}
            }
            Ok(())
        }
    }

    fn interface() -> RiscvCommunicationInterface {
        RiscvCommunicationInterface::new(Box::new(FakeDm::new())).unwrap()
    }

    #[test]
    fn attach_reads_module_capabilities() {
        let iface = interface();
        assert_eq!(iface.state.progbuf_size, 8);
    }

    #[test]
    fn halt_and_resume_roundtrip() {
        let mut iface = interface();
        iface.halt(HALT_POLL_TIMEOUT).unwrap();
        let mut core = Riscv32::new(&mut iface);
        assert!(core.status().unwrap().is_halted());

        core.run().unwrap();
        assert_eq!(core.status().unwrap(), CoreStatus::Running);
    }

    #[test]
    fn register_access_via_abstract_commands() {
        let mut iface = interface();
        iface.halt(HALT_POLL_TIMEOUT).unwrap();
        let mut core = Riscv32::new(&mut iface);

        core.write_core_reg(RegisterId(10), 0xDEAD_BEEF).unwrap();
        assert_eq!(core.read_core_reg(RegisterId(10)).unwrap(), 0xDEAD_BEEF);
    }

    #[test]
    fn memory_access_via_program_buffer() {
        let mut iface = interface();
        iface.halt(HALT_POLL_TIMEOUT).unwrap();
        let mut core = Riscv32::new(&mut iface);

        let data = [0x11, 0x22, 0x33, 0x44, 0x55];
        core.write_memory(0x8000_0000, &data).unwrap();

        let mut read_back = [0u8; 5];
        core.read_memory(0x8000_0000, &mut read_back).unwrap();
        assert_eq!(read_back, data);
    }

    #[test]
    fn scratch_registers_are_preserved() {
        let mut iface = interface();
        iface.halt(HALT_POLL_TIMEOUT).unwrap();
        let mut core = Riscv32::new(&mut iface);

        core.write_core_reg(RegisterId(8), 0x1111_1111).unwrap();
        core.write_core_reg(RegisterId(9), 0x2222_2222).unwrap();

        core.write_memory(0x2000_0000, &[0xAB; 8]).unwrap();

        assert_eq!(core.read_core_reg(RegisterId(8)).unwrap(), 0x1111_1111);
        assert_eq!(core.read_core_reg(RegisterId(9)).unwrap(), 0x2222_2222);
    }

    #[test]
    fn step_advances_pc_and_stays_halted() {
        let mut iface = interface();
        iface.halt(HALT_POLL_TIMEOUT).unwrap();
        let mut core = Riscv32::new(&mut iface);

        let before = core.read_core_reg(RISCV_PC).unwrap();
        let info = core.step().unwrap();
        assert_eq!(info.pc, u64::from(before) + 4);
        assert!(core.status().unwrap().is_halted());
    }

    #[test]
    fn triggers_allocate_and_exhaust() {
        let mut iface = interface();
        iface.halt(HALT_POLL_TIMEOUT).unwrap();
        let mut core = Riscv32::new(&mut iface);

        let mut first = Breakwatch::new(BreakwatchKind::HardwareBreak, 0x2000_0000, 4);
        let mut second = Breakwatch::new(BreakwatchKind::WriteWatch, 0x2000_1000, 4);
        let mut third = Breakwatch::new(BreakwatchKind::HardwareBreak, 0x2000_2000, 4);

        core.set_breakwatch(&mut first).unwrap();
        core.set_breakwatch(&mut second).unwrap();
        assert_ne!(first.reserved[0], second.reserved[0]);

        // Both triggers of the fake are in use now.
        assert!(matches!(
            core.set_breakwatch(&mut third),
            Err(Error::NoHardwareResource)
        ));

        core.clear_breakwatch(&first).unwrap();
        core.set_breakwatch(&mut third).unwrap();
        assert_eq!(third.reserved[0], first.reserved[0]);
    }
}
