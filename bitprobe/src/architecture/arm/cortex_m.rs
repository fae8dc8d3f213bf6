//! The Cortex-M debug runtime.
//!
//! Halt, resume and single step through DHCSR; the core register file
//! through DCRSR/DCRDR; reset through AIRCR (optionally caught by
//! DEMCR.VC_CORERESET); hardware breakpoints in the FPB and watchpoints in
//! the DWT; software breakpoints by planting BKPT #0.

use std::time::{Duration, Instant};

use bitfield::bitfield;

use super::memory::{AdiMemoryInterface, ArmMemoryInterface};
use crate::core::{
    Breakwatch, BreakwatchKind, CoreInformation, CoreInterface, CoreKind, CoreRegister,
    CoreStatus, HaltReason, MemoryMappedRegister, RegisterId, HALT_POLL_TIMEOUT,
};
use crate::Error;

bitfield! {
    /// Debug Halting Control and Status Register (armv7-M C1.6.2).
    ///
    /// Writes only take effect with the debug key set, see
    /// [`Dhcsr::enable_write`].
    #[derive(Copy, Clone)]
    pub struct Dhcsr(u32);
    impl Debug;
    /// At least one reset happened since the last read. Clears on read.
    pub s_reset_st, _: 25;
    /// An instruction retired since the last read. Clears on read.
    pub s_retire_st, _: 24;
    /// The core is locked up on an unrecoverable exception.
    pub s_lockup, _: 19;
    /// The core is sleeping.
    pub s_sleep, _: 18;
    /// The core is in debug state.
    pub s_halt, _: 17;
    /// Handshake flag for DCRSR/DCRDR transfers.
    pub s_regrdy, _: 16;
    /// Mask PendSV, SysTick and external interrupts while stepping.
    pub c_maskints, set_c_maskints: 3;
    /// Single step while in debug state.
    pub c_step, set_c_step: 2;
    /// Request debug state.
    pub c_halt, set_c_halt: 1;
    /// Enable halting debug.
    pub c_debugen, set_c_debugen: 0;
}

impl Dhcsr {
    /// Software must write 0xA05F to bits [31:16] to enable write access to
    /// the control bits; the processor ignores the write otherwise.
    pub fn enable_write(&mut self) {
        self.0 &= !(0xFFFF << 16);
        self.0 |= 0xA05F << 16;
    }
}

impl From<u32> for Dhcsr {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<Dhcsr> for u32 {
    fn from(value: Dhcsr) -> Self {
        value.0
    }
}

impl MemoryMappedRegister<u32> for Dhcsr {
    const ADDRESS: u64 = 0xE000_EDF0;
    const NAME: &'static str = "DHCSR";
}

bitfield! {
    /// Debug Core Register Selector Register.
    #[derive(Copy, Clone, Default)]
    pub struct Dcrsr(u32);
    impl Debug;
    /// `true` writes the selected register, `false` reads it.
    pub _, set_regwnr: 16;
    /// The register selector.
    pub _, set_regsel: 6, 0;
}

impl From<u32> for Dcrsr {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<Dcrsr> for u32 {
    fn from(value: Dcrsr) -> Self {
        value.0
    }
}

impl MemoryMappedRegister<u32> for Dcrsr {
    const ADDRESS: u64 = 0xE000_EDF4;
    const NAME: &'static str = "DCRSR";
}

/// Debug Core Register Data Register.
#[derive(Debug, Copy, Clone)]
pub struct Dcrdr(pub u32);

impl From<u32> for Dcrdr {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<Dcrdr> for u32 {
    fn from(value: Dcrdr) -> Self {
        value.0
    }
}

impl MemoryMappedRegister<u32> for Dcrdr {
    const ADDRESS: u64 = 0xE000_EDF8;
    const NAME: &'static str = "DCRDR";
}

bitfield! {
    /// Debug Exception and Monitor Control Register.
    #[derive(Copy, Clone, Default)]
    pub struct Demcr(u32);
    impl Debug;
    /// Global DWT and ITM enable.
    pub trcena, set_trcena: 24;
    /// Halt the core immediately out of a local reset.
    pub vc_corereset, set_vc_corereset: 0;
}

impl From<u32> for Demcr {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<Demcr> for u32 {
    fn from(value: Demcr) -> Self {
        value.0
    }
}

impl MemoryMappedRegister<u32> for Demcr {
    const ADDRESS: u64 = 0xE000_EDFC;
    const NAME: &'static str = "DEMCR";
}

bitfield! {
    /// Application Interrupt and Reset Control Register.
    #[derive(Copy, Clone, Default)]
    pub struct Aircr(u32);
    impl Debug;
    pub u16, vectkeystat, set_vectkey: 31, 16;
    pub sysresetreq, set_sysresetreq: 2;
    pub vectclractive, set_vectclractive: 1;
}

impl Aircr {
    /// Writes are ignored without the key.
    pub fn vectkey(&mut self) {
        self.set_vectkey(0x05FA);
    }
}

impl From<u32> for Aircr {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<Aircr> for u32 {
    fn from(value: Aircr) -> Self {
        value.0
    }
}

impl MemoryMappedRegister<u32> for Aircr {
    const ADDRESS: u64 = 0xE000_ED0C;
    const NAME: &'static str = "AIRCR";
}

bitfield! {
    /// Debug Fault Status Register. All bits are sticky, write-one-to-clear.
    #[derive(Copy, Clone, Default)]
    pub struct Dfsr(u32);
    impl Debug;
    /// An external debug request halted the core.
    pub external, _: 4;
    /// A vector catch halted the core.
    pub vcatch, _: 3;
    /// A DWT comparator matched.
    pub dwttrap, _: 2;
    /// A breakpoint (FPB or BKPT instruction) halted the core.
    pub bkpt, _: 1;
    /// A halt request (or single step) halted the core.
    pub halted, _: 0;
}

impl Dfsr {
    fn clear_all() -> Self {
        Dfsr(0b11111)
    }

    fn halt_reason(&self, stepping: bool) -> HaltReason {
        match self.0 & 0b11111 {
            0b00000 => HaltReason::Unknown,
            0b00001 if stepping => HaltReason::Step,
            0b00001 => HaltReason::Request,
            0b00010 => HaltReason::Breakpoint,
            0b00100 => HaltReason::Watchpoint,
            0b01000 => HaltReason::Reset,
            0b10000 => HaltReason::External,
            _ => HaltReason::Multiple,
        }
    }
}

impl From<u32> for Dfsr {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<Dfsr> for u32 {
    fn from(value: Dfsr) -> Self {
        value.0
    }
}

impl MemoryMappedRegister<u32> for Dfsr {
    const ADDRESS: u64 = 0xE000_ED30;
    const NAME: &'static str = "DFSR";
}

/// Media and FP Feature Register 0; non-zero when an FPU is implemented.
const MVFR0_ADDRESS: u64 = 0xE000_EF40;

bitfield! {
    /// Flash Patch Control Register.
    #[derive(Copy, Clone)]
    pub struct FpCtrl(u32);
    impl Debug;
    /// Flash patch revision: 0 is the original unit, 1 the v2 unit with
    /// direct address comparators.
    pub u8, rev, _: 31, 28;
    num_code_1, _: 14, 12;
    num_code_0, _: 7, 4;
    /// Writes are ignored unless this is set.
    pub _, set_key: 1;
    /// Global FPB enable.
    pub enable, set_enable: 0;
}

impl FpCtrl {
    /// The number of instruction comparators.
    pub fn num_code(&self) -> usize {
        ((self.num_code_1() << 4) | self.num_code_0()) as usize
    }
}

impl From<u32> for FpCtrl {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<FpCtrl> for u32 {
    fn from(value: FpCtrl) -> Self {
        value.0
    }
}

impl MemoryMappedRegister<u32> for FpCtrl {
    const ADDRESS: u64 = 0xE000_2000;
    const NAME: &'static str = "FP_CTRL";
}

/// Base of the FP_COMPn array.
const FP_COMP_BASE: u64 = 0xE000_2008;

/// A rev.1 FPB comparator value for an instruction address. The address
/// must lie in the code region; the matched halfword is selected by the
/// REPLACE field.
fn fpb_rev1_comparator(address: u32) -> Result<u32, Error> {
    if address >= 0x2000_0000 {
        return Err(Error::Unsupported(
            "rev.1 flash patch units only match code-region addresses",
        ));
    }

    let replace = if address & 0b10 == 0 { 0b01 } else { 0b10 };
    Ok((replace << 30) | (address & 0x1FFF_FFFC) | 1)
}

/// A rev.2 FPB comparator value: the halfword address with the enable bit.
fn fpb_rev2_comparator(address: u32) -> u32 {
    (address & 0xFFFF_FFFE) | 1
}

/// DWT register block.
const DWT_CTRL: u64 = 0xE000_1000;
const DWT_COMP_BASE: u64 = 0xE000_1020;
const DWT_UNIT_STRIDE: u64 = 0x10;

/// DWT FUNCTION encodings for data address watchpoints (armv7-M C1.8.7).
const DWT_FUNCTION_READ: u32 = 0b0101;
const DWT_FUNCTION_WRITE: u32 = 0b0110;
const DWT_FUNCTION_ACCESS: u32 = 0b0111;

/// The BKPT #0 instruction used for software breakpoints.
const BKPT_INSTRUCTION: u16 = 0xBE00;

/// Discovered hardware facts and sticky state of one Cortex-M core.
#[derive(Debug, Clone, Default)]
pub struct CortexMState {
    initialized: bool,
    /// Number of FPB instruction comparators.
    pub fpb_units: usize,
    /// FPB revision, 0 or 1 as encoded in FP_CTRL.REV.
    pub fpb_rev: u8,
    /// Number of DWT comparators.
    pub dwt_units: usize,
    /// Whether an FPU is implemented (and its registers advertised).
    pub fpu: bool,
    /// Whether the last halt was caused by a single step request.
    stepping: bool,
}

impl CortexMState {
    pub fn new() -> Self {
        Self::default()
    }
}

/// The register file in `g`-packet order.
#[rustfmt::skip]
static CORTEX_M_REGISTERS: [CoreRegister; 23] = [
    CoreRegister { name: "r0", id: RegisterId(0), bits: 32 },
    CoreRegister { name: "r1", id: RegisterId(1), bits: 32 },
    CoreRegister { name: "r2", id: RegisterId(2), bits: 32 },
    CoreRegister { name: "r3", id: RegisterId(3), bits: 32 },
    CoreRegister { name: "r4", id: RegisterId(4), bits: 32 },
    CoreRegister { name: "r5", id: RegisterId(5), bits: 32 },
    CoreRegister { name: "r6", id: RegisterId(6), bits: 32 },
    CoreRegister { name: "r7", id: RegisterId(7), bits: 32 },
    CoreRegister { name: "r8", id: RegisterId(8), bits: 32 },
    CoreRegister { name: "r9", id: RegisterId(9), bits: 32 },
    CoreRegister { name: "r10", id: RegisterId(10), bits: 32 },
    CoreRegister { name: "r11", id: RegisterId(11), bits: 32 },
    CoreRegister { name: "r12", id: RegisterId(12), bits: 32 },
    CoreRegister { name: "sp", id: RegisterId(13), bits: 32 },
    CoreRegister { name: "lr", id: RegisterId(14), bits: 32 },
    CoreRegister { name: "pc", id: RegisterId(15), bits: 32 },
    CoreRegister { name: "xpsr", id: RegisterId(16), bits: 32 },
    CoreRegister { name: "msp", id: RegisterId(17), bits: 32 },
    CoreRegister { name: "psp", id: RegisterId(18), bits: 32 },
    CoreRegister { name: "primask", id: RegisterId(19), bits: 32 },
    CoreRegister { name: "basepri", id: RegisterId(20), bits: 32 },
    CoreRegister { name: "faultmask", id: RegisterId(21), bits: 32 },
    CoreRegister { name: "control", id: RegisterId(22), bits: 32 },
];

/// Index of the program counter in the register file.
pub const PC: RegisterId = RegisterId(15);

/// DCRSR selector for the packed CONTROL/FAULTMASK/BASEPRI/PRIMASK word.
const REGSEL_SPECIAL: u8 = 0b10100;
/// DCRSR selector for FPSCR.
const REGSEL_FPSCR: u8 = 0b100_0001;
/// DCRSR selector of s0; s1..s31 follow.
const REGSEL_FP_BASE: u8 = 0b100_0000;

/// How a register file index maps onto the DCRSR selector space.
enum RegSel {
    /// Plain selector.
    Direct(u8),
    /// A byte lane of the packed special register.
    SpecialByte(u8),
}

fn regsel(id: RegisterId, fpu: bool) -> Result<RegSel, Error> {
    match id.0 {
        0..=16 => Ok(RegSel::Direct(id.0 as u8)),
        17 => Ok(RegSel::Direct(0b10001)),
        18 => Ok(RegSel::Direct(0b10010)),
        // primask, basepri, faultmask, control share one transfer.
        19..=22 => Ok(RegSel::SpecialByte((id.0 - 19) as u8)),
        23 if fpu => Ok(RegSel::Direct(REGSEL_FPSCR)),
        24..=55 if fpu => Ok(RegSel::Direct(REGSEL_FP_BASE + (id.0 - 24) as u8)),
        _ => Err(Error::InvalidRegister(id.0)),
    }
}

/// A Cortex-M core behind a MEM-AP.
pub struct CortexM<'probe> {
    memory: AdiMemoryInterface<'probe>,
    state: &'probe mut CortexMState,
}

impl<'probe> CortexM<'probe> {
    pub fn new(
        memory: AdiMemoryInterface<'probe>,
        state: &'probe mut CortexMState,
    ) -> Result<Self, Error> {
        let mut this = Self { memory, state };
        if !this.state.initialized {
            this.enable_debug()?;
            this.discover_units()?;
            this.state.initialized = true;
        }
        Ok(this)
    }

    fn enable_debug(&mut self) -> Result<(), Error> {
        let mut dhcsr = Dhcsr(0);
        dhcsr.set_c_debugen(true);
        dhcsr.enable_write();
        self.write_reg::<Dhcsr>(dhcsr.into())
    }

    fn discover_units(&mut self) -> Result<(), Error> {
        let fp_ctrl = FpCtrl::from(self.read_reg::<FpCtrl>()?);
        self.state.fpb_units = fp_ctrl.num_code();
        self.state.fpb_rev = fp_ctrl.rev();

        let dwt_ctrl = self.memory.read_word_32(DWT_CTRL)?;
        self.state.dwt_units = (dwt_ctrl >> 28) as usize;

        let mvfr0 = self.memory.read_word_32(MVFR0_ADDRESS)?;
        self.state.fpu = mvfr0 != 0;

        tracing::debug!(
            "Cortex-M debug units: {} FPB (rev {}), {} DWT, FPU: {}",
            self.state.fpb_units,
            self.state.fpb_rev + 1,
            self.state.dwt_units,
            self.state.fpu
        );
        Ok(())
    }

    fn read_reg<R: MemoryMappedRegister<u32>>(&mut self) -> Result<u32, Error> {
        Ok(self.memory.read_word_32(R::ADDRESS)?)
    }

    fn write_reg<R: MemoryMappedRegister<u32>>(&mut self, value: u32) -> Result<(), Error> {
        Ok(self.memory.write_word_32(R::ADDRESS, value)?)
    }

    fn wait_for_halt(&mut self, timeout: Duration) -> Result<(), Error> {
        let start = Instant::now();
        loop {
            let dhcsr = Dhcsr(self.read_reg::<Dhcsr>()?);
            if dhcsr.s_halt() {
                return Ok(());
            }
            if start.elapsed() >= timeout {
                return Err(Error::Timeout);
            }
        }
    }

    fn wait_for_regrdy(&mut self) -> Result<(), Error> {
        let start = Instant::now();
        loop {
            let dhcsr = Dhcsr(self.read_reg::<Dhcsr>()?);
            if dhcsr.s_regrdy() {
                return Ok(());
            }
            if start.elapsed() >= HALT_POLL_TIMEOUT {
                return Err(super::ArmError::CoreRegisterTransfer.into());
            }
        }
    }

    fn dcrsr_read(&mut self, selector: u8) -> Result<u32, Error> {
        let mut dcrsr = Dcrsr::default();
        dcrsr.set_regwnr(false);
        dcrsr.set_regsel(u32::from(selector));
        self.write_reg::<Dcrsr>(dcrsr.into())?;
        self.wait_for_regrdy()?;
        self.read_reg::<Dcrdr>()
    }

    fn dcrsr_write(&mut self, selector: u8, value: u32) -> Result<(), Error> {
        self.write_reg::<Dcrdr>(value)?;
        let mut dcrsr = Dcrsr::default();
        dcrsr.set_regwnr(true);
        dcrsr.set_regsel(u32::from(selector));
        self.write_reg::<Dcrsr>(dcrsr.into())?;
        self.wait_for_regrdy()
    }

    fn current_pc(&mut self) -> Result<u64, Error> {
        Ok(u64::from(self.dcrsr_read(PC.0 as u8)?))
    }

    /// Allocate the lowest free FPB comparator; `None` when all are in use.
    fn free_fpb_unit(&mut self) -> Result<Option<usize>, Error> {
        for unit in 0..self.state.fpb_units {
            let comp = self.memory.read_word_32(FP_COMP_BASE + unit as u64 * 4)?;
            if comp & 1 == 0 {
                return Ok(Some(unit));
            }
        }
        Ok(None)
    }

    fn free_dwt_unit(&mut self) -> Result<Option<usize>, Error> {
        for unit in 0..self.state.dwt_units {
            let function = self
                .memory
                .read_word_32(DWT_COMP_BASE + 8 + unit as u64 * DWT_UNIT_STRIDE)?;
            if function & 0xF == 0 {
                return Ok(Some(unit));
            }
        }
        Ok(None)
    }

    fn set_hw_breakpoint(&mut self, breakwatch: &mut Breakwatch) -> Result<(), Error> {
        let Some(unit) = self.free_fpb_unit()? else {
            return Err(Error::NoHardwareResource);
        };

        // Make sure the unit is globally enabled before arming a comparator.
        let mut fp_ctrl = FpCtrl::from(self.read_reg::<FpCtrl>()?);
        if !fp_ctrl.enable() {
            fp_ctrl.set_enable(true);
            fp_ctrl.set_key(true);
            self.write_reg::<FpCtrl>(fp_ctrl.into())?;
        }

        let address = breakwatch.address as u32;
        let comparator = if self.state.fpb_rev == 0 {
            fpb_rev1_comparator(address)?
        } else {
            fpb_rev2_comparator(address)
        };

        self.memory
            .write_word_32(FP_COMP_BASE + unit as u64 * 4, comparator)?;
        breakwatch.reserved[0] = unit as u32;
        tracing::debug!("FPB comparator {unit} armed at {address:#010x}");
        Ok(())
    }

    fn clear_hw_breakpoint(&mut self, breakwatch: &Breakwatch) -> Result<(), Error> {
        let unit = breakwatch.reserved[0] as u64;
        self.memory.write_word_32(FP_COMP_BASE + unit * 4, 0)?;
        Ok(())
    }

    fn set_sw_breakpoint(&mut self, breakwatch: &mut Breakwatch) -> Result<(), Error> {
        let address = breakwatch.address & !1;
        let original = self.memory.read_word_16(address)?;
        self.memory.write_word_16(address, BKPT_INSTRUCTION)?;
        breakwatch.reserved[0] = u32::from(original);
        Ok(())
    }

    fn clear_sw_breakpoint(&mut self, breakwatch: &Breakwatch) -> Result<(), Error> {
        let address = breakwatch.address & !1;
        self.memory
            .write_word_16(address, breakwatch.reserved[0] as u16)?;
        Ok(())
    }

    fn set_watchpoint(&mut self, breakwatch: &mut Breakwatch) -> Result<(), Error> {
        let Some(unit) = self.free_dwt_unit()? else {
            return Err(Error::NoHardwareResource);
        };

        // DWT needs TRCENA before the comparators operate.
        let mut demcr = Demcr::from(self.read_reg::<Demcr>()?);
        if !demcr.trcena() {
            demcr.set_trcena(true);
            self.write_reg::<Demcr>(demcr.into())?;
        }

        let function = match breakwatch.kind {
            BreakwatchKind::ReadWatch => DWT_FUNCTION_READ,
            BreakwatchKind::WriteWatch => DWT_FUNCTION_WRITE,
            BreakwatchKind::AccessWatch => DWT_FUNCTION_ACCESS,
            _ => unreachable!("set_watchpoint is only called for watch kinds"),
        };

        // The comparator masks out the low log2(size) address bits.
        let mask = breakwatch.size.next_power_of_two().trailing_zeros();

        let base = DWT_COMP_BASE + unit as u64 * DWT_UNIT_STRIDE;
        self.memory
            .write_word_32(base, breakwatch.address as u32)?;
        self.memory.write_word_32(base + 4, mask)?;
        self.memory.write_word_32(base + 8, function)?;
        breakwatch.reserved[0] = unit as u32;
        tracing::debug!(
            "DWT comparator {unit} armed at {:#010x}, mask {mask}",
            breakwatch.address
        );
        Ok(())
    }

    fn clear_watchpoint(&mut self, breakwatch: &Breakwatch) -> Result<(), Error> {
        let base = DWT_COMP_BASE + u64::from(breakwatch.reserved[0]) * DWT_UNIT_STRIDE;
        self.memory.write_word_32(base + 8, 0)?;
        self.memory.write_word_32(base + 4, 0)?;
        self.memory.write_word_32(base, 0)?;
        Ok(())
    }
}

impl CoreInterface for CortexM<'_> {
    fn status(&mut self) -> Result<CoreStatus, Error> {
        let dhcsr = Dhcsr(self.read_reg::<Dhcsr>()?);

        if dhcsr.s_lockup() {
            return Ok(CoreStatus::LockedUp);
        }
        if dhcsr.s_halt() {
            let dfsr = Dfsr(self.read_reg::<Dfsr>()?);
            return Ok(CoreStatus::Halted(dfsr.halt_reason(self.state.stepping)));
        }
        if dhcsr.s_sleep() {
            return Ok(CoreStatus::Sleeping);
        }
        Ok(CoreStatus::Running)
    }

    fn halt(&mut self, timeout: Duration) -> Result<CoreInformation, Error> {
        let mut dhcsr = Dhcsr(0);
        dhcsr.set_c_halt(true);
        dhcsr.set_c_debugen(true);
        dhcsr.enable_write();
        self.write_reg::<Dhcsr>(dhcsr.into())?;

        self.wait_for_halt(timeout)?;
        self.state.stepping = false;
        let pc = self.current_pc()?;
        Ok(CoreInformation { pc })
    }

    fn run(&mut self) -> Result<(), Error> {
        // Drop the stale halt causes so the next stop reports cleanly.
        self.write_reg::<Dfsr>(Dfsr::clear_all().into())?;
        self.state.stepping = false;

        let mut dhcsr = Dhcsr(0);
        dhcsr.set_c_debugen(true);
        dhcsr.enable_write();
        self.write_reg::<Dhcsr>(dhcsr.into())
    }

    fn step(&mut self) -> Result<CoreInformation, Error> {
        self.write_reg::<Dfsr>(Dfsr::clear_all().into())?;

        // Mask interrupts for the step so a pending IRQ does not hijack it;
        // C_MASKINTS may only change while C_HALT is set.
        let mut masked = Dhcsr(0);
        masked.set_c_halt(true);
        masked.set_c_maskints(true);
        masked.set_c_debugen(true);
        masked.enable_write();
        self.write_reg::<Dhcsr>(masked.into())?;

        let mut step = Dhcsr(0);
        step.set_c_step(true);
        step.set_c_maskints(true);
        step.set_c_debugen(true);
        step.enable_write();
        self.write_reg::<Dhcsr>(step.into())?;

        self.wait_for_halt(HALT_POLL_TIMEOUT)?;

        // Back to plain halted with interrupts unmasked.
        let mut halted = Dhcsr(0);
        halted.set_c_halt(true);
        halted.set_c_debugen(true);
        halted.enable_write();
        self.write_reg::<Dhcsr>(halted.into())?;

        self.state.stepping = true;
        let pc = self.current_pc()?;
        Ok(CoreInformation { pc })
    }

    fn reset(&mut self) -> Result<(), Error> {
        let mut aircr = Aircr::default();
        aircr.vectkey();
        aircr.set_sysresetreq(true);
        self.write_reg::<Aircr>(aircr.into())?;
        self.state.stepping = false;
        Ok(())
    }

    fn reset_and_halt(&mut self, timeout: Duration) -> Result<CoreInformation, Error> {
        let mut demcr = Demcr::from(self.read_reg::<Demcr>()?);
        demcr.set_vc_corereset(true);
        self.write_reg::<Demcr>(demcr.into())?;

        self.reset()?;
        self.wait_for_halt(timeout)?;

        demcr.set_vc_corereset(false);
        self.write_reg::<Demcr>(demcr.into())?;

        let pc = self.current_pc()?;
        Ok(CoreInformation { pc })
    }

    fn read_core_reg(&mut self, id: RegisterId) -> Result<u32, Error> {
        match regsel(id, self.state.fpu)? {
            RegSel::Direct(selector) => self.dcrsr_read(selector),
            RegSel::SpecialByte(lane) => {
                let word = self.dcrsr_read(REGSEL_SPECIAL)?;
                Ok((word >> (lane * 8)) & 0xFF)
            }
        }
    }

    fn write_core_reg(&mut self, id: RegisterId, value: u32) -> Result<(), Error> {
        match regsel(id, self.state.fpu)? {
            RegSel::Direct(selector) => self.dcrsr_write(selector, value),
            RegSel::SpecialByte(lane) => {
                let word = self.dcrsr_read(REGSEL_SPECIAL)?;
                let shift = lane * 8;
                let merged = (word & !(0xFF << shift)) | ((value & 0xFF) << shift);
                self.dcrsr_write(REGSEL_SPECIAL, merged)
            }
        }
    }

    fn registers(&self) -> &'static [CoreRegister] {
        if self.state.fpu {
            &CORTEX_M_FP_REGISTERS
        } else {
            &CORTEX_M_REGISTERS
        }
    }

    fn read_memory(&mut self, address: u64, data: &mut [u8]) -> Result<(), Error> {
        Ok(self.memory.read(address, data)?)
    }

    fn write_memory(&mut self, address: u64, data: &[u8]) -> Result<(), Error> {
        Ok(self.memory.write(address, data)?)
    }

    fn set_breakwatch(&mut self, breakwatch: &mut Breakwatch) -> Result<(), Error> {
        match breakwatch.kind {
            BreakwatchKind::SoftwareBreak => self.set_sw_breakpoint(breakwatch),
            BreakwatchKind::HardwareBreak => self.set_hw_breakpoint(breakwatch),
            BreakwatchKind::ReadWatch
            | BreakwatchKind::WriteWatch
            | BreakwatchKind::AccessWatch => self.set_watchpoint(breakwatch),
        }
    }

    fn clear_breakwatch(&mut self, breakwatch: &Breakwatch) -> Result<(), Error> {
        match breakwatch.kind {
            BreakwatchKind::SoftwareBreak => self.clear_sw_breakpoint(breakwatch),
            BreakwatchKind::HardwareBreak => self.clear_hw_breakpoint(breakwatch),
            BreakwatchKind::ReadWatch
            | BreakwatchKind::WriteWatch
            | BreakwatchKind::AccessWatch => self.clear_watchpoint(breakwatch),
        }
    }

    fn kind(&self) -> CoreKind {
        CoreKind::CortexM
    }
}

/// The FPU-extended register file: the core file plus FPSCR and s0..s31.
#[rustfmt::skip]
static CORTEX_M_FP_REGISTERS: [CoreRegister; 56] = [
    CoreRegister { name: "r0", id: RegisterId(0), bits: 32 },
    CoreRegister { name: "r1", id: RegisterId(1), bits: 32 },
    CoreRegister { name: "r2", id: RegisterId(2), bits: 32 },
    CoreRegister { name: "r3", id: RegisterId(3), bits: 32 },
    CoreRegister { name: "r4", id: RegisterId(4), bits: 32 },
    CoreRegister { name: "r5", id: RegisterId(5), bits: 32 },
    CoreRegister { name: "r6", id: RegisterId(6), bits: 32 },
    CoreRegister { name: "r7", id: RegisterId(7), bits: 32 },
    CoreRegister { name: "r8", id: RegisterId(8), bits: 32 },
    CoreRegister { name: "r9", id: RegisterId(9), bits: 32 },
    CoreRegister { name: "r10", id: RegisterId(10), bits: 32 },
    CoreRegister { name: "r11", id: RegisterId(11), bits: 32 },
    CoreRegister { name: "r12", id: RegisterId(12), bits: 32 },
    CoreRegister { name: "sp", id: RegisterId(13), bits: 32 },
    CoreRegister { name: "lr", id: RegisterId(14), bits: 32 },
    CoreRegister { name: "pc", id: RegisterId(15), bits: 32 },
    CoreRegister { name: "xpsr", id: RegisterId(16), bits: 32 },
    CoreRegister { name: "msp", id: RegisterId(17), bits: 32 },
    CoreRegister { name: "psp", id: RegisterId(18), bits: 32 },
    CoreRegister { name: "primask", id: RegisterId(19), bits: 32 },
    CoreRegister { name: "basepri", id: RegisterId(20), bits: 32 },
    CoreRegister { name: "faultmask", id: RegisterId(21), bits: 32 },
    CoreRegister { name: "control", id: RegisterId(22), bits: 32 },
    CoreRegister { name: "fpscr", id: RegisterId(23), bits: 32 },
    CoreRegister { name: "s0", id: RegisterId(24), bits: 32 },
    CoreRegister { name: "s1", id: RegisterId(25), bits: 32 },
    CoreRegister { name: "s2", id: RegisterId(26), bits: 32 },
    CoreRegister { name: "s3", id: RegisterId(27), bits: 32 },
    CoreRegister { name: "s4", id: RegisterId(28), bits: 32 },
    CoreRegister { name: "s5", id: RegisterId(29), bits: 32 },
    CoreRegister { name: "s6", id: RegisterId(30), bits: 32 },
    CoreRegister { name: "s7", id: RegisterId(31), bits: 32 },
    CoreRegister { name: "s8", id: RegisterId(32), bits: 32 },
    CoreRegister { name: "s9", id: RegisterId(33), bits: 32 },
    CoreRegister { name: "s10", id: RegisterId(34), bits: 32 },
    CoreRegister { name: "s11", id: RegisterId(35), bits: 32 },
    CoreRegister { name: "s12", id: RegisterId(36), bits: 32 },
    CoreRegister { name: "s13", id: RegisterId(37), bits: 32 },
    CoreRegister { name: "s14", id: RegisterId(38), bits: 32 },
    CoreRegister { name: "s15", id: RegisterId(39), bits: 32 },
    CoreRegister { name: "s16", id: RegisterId(40), bits: 32 },
    CoreRegister { name: "s17", id: RegisterId(41), bits: 32 },
    CoreRegister { name: "s18", id: RegisterId(42), bits: 32 },
    CoreRegister { name: "s19", id: RegisterId(43), bits: 32 },
    CoreRegister { name: "s20", id: RegisterId(44), bits: 32 },
    CoreRegister { name: "s21", id: RegisterId(45), bits: 32 },
    CoreRegister { name: "s22", id: RegisterId(46), bits: 32 },
    CoreRegister { name: "s23", id: RegisterId(47), bits: 32 },
    CoreRegister { name: "s24", id: RegisterId(48), bits: 32 },
    CoreRegister { name: "s25", id: RegisterId(49), bits: 32 },
    CoreRegister { name: "s26", id: RegisterId(50), bits: 32 },
    CoreRegister { name: "s27", id: RegisterId(51), bits: 32 },
    CoreRegister { name: "s28", id: RegisterId(52), bits: 32 },
    CoreRegister { name: "s29", id: RegisterId(53), bits: 32 },
    CoreRegister { name: "s30", id: RegisterId(54), bits: 32 },
    CoreRegister { name: "s31", id: RegisterId(55), bits: 32 },
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rev1_comparator_encodes_halfword_selection() {
        // Lower halfword: REPLACE = 0b01.
        assert_eq!(fpb_rev1_comparator(0x0800_0404).unwrap(), 0x4800_0405);
        // Upper halfword: REPLACE = 0b10.
        assert_eq!(fpb_rev1_comparator(0x0800_0406).unwrap(), 0x8800_0405);
    }

    #[test]
    fn rev1_comparator_rejects_sram_addresses() {
        assert!(fpb_rev1_comparator(0x2000_0000).is_err());
    }

    #[test]
    fn rev2_comparator_is_address_plus_enable() {
        assert_eq!(fpb_rev2_comparator(0x0800_0404), 0x0800_0405);
        assert_eq!(fpb_rev2_comparator(0x0800_0407), 0x0800_0407);
    }

    #[test]
    fn register_files_are_consistent() {
        assert_eq!(CORTEX_M_REGISTERS.len(), 23);
        assert_eq!(CORTEX_M_FP_REGISTERS.len(), 56);
        for (index, register) in CORTEX_M_FP_REGISTERS.iter().enumerate() {
            assert_eq!(register.id.0 as usize, index);
        }
    }

    #[test]
    fn regsel_maps_packed_special_registers() {
        assert!(matches!(
            regsel(RegisterId(19), false),
            Ok(RegSel::SpecialByte(0))
        ));
        assert!(matches!(
            regsel(RegisterId(22), false),
            Ok(RegSel::SpecialByte(3))
        ));
        assert!(matches!(
            regsel(RegisterId(23), false),
            Err(Error::InvalidRegister(23))
        ));
        assert!(matches!(
            regsel(RegisterId(24), true),
            Ok(RegSel::Direct(REGSEL_FP_BASE))
        ));
    }

    #[test]
    fn dfsr_decodes_halt_reasons() {
        assert_eq!(Dfsr(0b00010).halt_reason(false), HaltReason::Breakpoint);
        assert_eq!(Dfsr(0b00100).halt_reason(false), HaltReason::Watchpoint);
        assert_eq!(Dfsr(0b00001).halt_reason(false), HaltReason::Request);
        assert_eq!(Dfsr(0b00001).halt_reason(true), HaltReason::Step);
        assert_eq!(Dfsr(0b00110).halt_reason(false), HaltReason::Multiple);
        assert_eq!(Dfsr(0b01000).halt_reason(false), HaltReason::Reset);
    }
}
