//! Simulated wire backends.
//!
//! Three layers of fakery, each exercising a different amount of the real
//! stack:
//!
//! - [`RecordingPins`] records every pin transition and plays back scripted
//!   input bits; the wire driver tests assert waveforms against it.
//! - [`DapModel`] is a behavioural ADIv5 target: a DP, one AHB-AP and a
//!   [`TargetMemory`] with enough MMIO emulation (SCS, FPB, DWT, ROM
//!   tables, the STM32F1 identification words) to run the whole debug stack
//!   against it.
//! - [`SwdTargetSim`] puts the model behind actual pins, decoding the SWD
//!   protocol edge by edge, so the full path from bit sequencer to target
//!   memory is covered. [`FakeDapAccess`] exposes the same model at the
//!   transfer level for tests that don't care about the wire.

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;

use crate::architecture::arm::{DapError, PortType, RawDapAccess};
use crate::probe::{PinIo, WireProtocol};

/// One observable pin transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinEvent {
    /// SWDIO direction change; `true` means the host drives.
    SwdioDir(bool),
    /// SWDIO level driven by the host.
    Swdio(bool),
    /// SWCLK level.
    Swclk(bool),
    /// TDI level.
    Tdi(bool),
    /// nRST level.
    Nrst(bool),
}

/// Pins that record every transition and answer reads from a script.
#[derive(Debug, Default)]
pub struct RecordingPins {
    /// Everything the host did, in order.
    pub events: Vec<PinEvent>,
    input: VecDeque<bool>,
}

impl RecordingPins {
    /// Pins whose SWDIO/TDO reads yield `bits` in order, then `false`.
    pub fn with_input(bits: &[bool]) -> Self {
        Self {
            events: Vec::new(),
            input: bits.iter().copied().collect(),
        }
    }
}

impl PinIo for RecordingPins {
    fn swdio_set_output(&mut self, output: bool) {
        self.events.push(PinEvent::SwdioDir(output));
    }

    fn swdio_write(&mut self, high: bool) {
        self.events.push(PinEvent::Swdio(high));
    }

    fn swdio_read(&mut self) -> bool {
        self.input.pop_front().unwrap_or(false)
    }

    fn swclk_write(&mut self, high: bool) {
        self.events.push(PinEvent::Swclk(high));
    }

    fn tdi_write(&mut self, high: bool) {
        self.events.push(PinEvent::Tdi(high));
    }

    fn tdo_read(&mut self) -> bool {
        self.input.pop_front().unwrap_or(false)
    }

    fn nrst_write(&mut self, asserted: bool) {
        self.events.push(PinEvent::Nrst(asserted));
    }

    fn delay(&mut self, _cycles: u32) {}
}

/// Number of Cortex-M core registers the model holds: r0-r15, xpsr, msp,
/// psp and the packed special register.
const MODEL_REGS: usize = 20;

/// The flash address range the FPEC model guards.
const FLASH_RANGE: std::ops::Range<u64> = 0x0800_0000..0x0801_0000;

// FPEC registers and bits, matching the STM32F1 reference manual.
const FPEC_KEYR: u64 = 0x4002_2004;
const FPEC_SR: u64 = 0x4002_200C;
const FPEC_CR: u64 = 0x4002_2010;
const FPEC_AR: u64 = 0x4002_2014;
const FPEC_KEY1: u32 = 0x4567_0123;
const FPEC_KEY2: u32 = 0xCDEF_89AB;
const FPEC_CR_PG: u32 = 1 << 0;
const FPEC_CR_PER: u32 = 1 << 1;
const FPEC_CR_STRT: u32 = 1 << 6;
const FPEC_CR_LOCK: u32 = 1 << 7;

/// A behavioural target memory: flat storage plus MMIO emulation of the
/// debug peripherals of a small Cortex-M3.
#[derive(Debug)]
pub struct TargetMemory {
    bytes: BTreeMap<u64, u8>,
    /// Core registers, indexed by DCRSR selector (packed special at 20).
    pub regs: [u32; MODEL_REGS],
    /// Whether the core is halted.
    pub halted: bool,
    dhcsr_control: u32,
    dfsr: u32,
    demcr: u32,
    dcrdr: u32,
    fp_ctrl_enable: bool,
    fpec_locked: bool,
    fpec_key_stage: u8,
    fpec_cr: u32,
    fpec_ar: u32,
    /// FPB comparators, read/written raw.
    pub fp_comps: [u32; 6],
    /// DWT comparator/mask/function triples.
    pub dwt_units: [[u32; 3]; 4],
}

// DHCSR bit positions shared with the real runtime.
const C_HALT: u32 = 1 << 1;
const C_STEP: u32 = 1 << 2;
const S_REGRDY: u32 = 1 << 16;
const S_HALT: u32 = 1 << 17;
const DBGKEY: u32 = 0xA05F << 16;

impl Default for TargetMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl TargetMemory {
    pub fn new() -> Self {
        let mut this = Self {
            bytes: BTreeMap::new(),
            regs: [0; MODEL_REGS],
            halted: false,
            dhcsr_control: 0,
            dfsr: 0,
            demcr: 0,
            dcrdr: 0,
            fp_ctrl_enable: false,
            fpec_locked: true,
            fpec_key_stage: 0,
            fpec_cr: 0,
            fpec_ar: 0,
            fp_comps: [0; 6],
            dwt_units: [[0; 3]; 4],
        };
        this.install_identity();
        this.regs[15] = 0x0800_0100;
        this
    }

    /// CoreSight identification of a Cortex-M3 shaped part: the AP ROM
    /// table pointing at SCS/DWT/FPB, plus the STM32F103 flash size and
    /// DBGMCU id words.
    fn install_identity(&mut self) {
        let rom = 0xE00F_F000;
        self.install_component(rom, 0x1, 0x4C4);
        self.put32(rom, 0xFFF0_F003); // SCS at 0xE000E000
        self.put32(rom + 4, 0xFFF0_2003); // DWT at 0xE0001000
        self.put32(rom + 8, 0xFFF0_3003); // FPB at 0xE0002000
        self.put32(rom + 12, 0);

        self.install_component(0xE000_E000, 0xE, 0x000);
        self.install_component(0xE000_1000, 0xE, 0x002);
        self.install_component(0xE000_2000, 0xE, 0x003);

        // Flash size register: KiB of flash on an F103C8.
        self.put32(0x1FFF_F7E0, 64);
        // DBGMCU_IDCODE: medium density F103.
        self.put32(0xE004_2000, 0x2000_6410);
    }

    fn install_component(&mut self, base: u64, class: u32, part: u16) {
        self.put32(base + 0xFF0, 0x0D);
        self.put32(base + 0xFF4, class << 4);
        self.put32(base + 0xFF8, 0x05);
        self.put32(base + 0xFFC, 0xB1);
        self.put32(base + 0xFE0, u32::from(part & 0xFF));
        self.put32(base + 0xFE4, (u32::from(part >> 8) & 0xF) | 0xB0);
        self.put32(base + 0xFE8, 0x0B);
        self.put32(base + 0xFEC, 0x00);
        self.put32(base + 0xFD0, 0x04);
    }

    fn put32(&mut self, address: u64, value: u32) {
        for (index, byte) in value.to_le_bytes().iter().enumerate() {
            self.bytes.insert(address + index as u64, *byte);
        }
    }

    /// Raw byte access to the flat backing store, bypassing MMIO.
    pub fn flat_read(&self, address: u64, data: &mut [u8]) {
        for (index, slot) in data.iter_mut().enumerate() {
            *slot = self
                .bytes
                .get(&(address + index as u64))
                .copied()
                .unwrap_or(0xFF);
        }
    }

    /// Raw byte write to the flat backing store.
    pub fn flat_write(&mut self, address: u64, data: &[u8]) {
        for (index, byte) in data.iter().enumerate() {
            self.bytes.insert(address + index as u64, *byte);
        }
    }

    fn dhcsr_value(&self) -> u32 {
        let mut value = self.dhcsr_control & 0xF;
        value |= S_REGRDY;
        if self.halted {
            value |= S_HALT;
        }
        value
    }

    fn dhcsr_write(&mut self, value: u32) {
        if value & 0xFFFF_0000 != DBGKEY {
            return;
        }
        self.dhcsr_control = value & 0xFFFF;

        if value & C_STEP != 0 && self.halted {
            // One thumb instruction retires.
            self.regs[15] = self.regs[15].wrapping_add(2);
            self.dfsr |= 1;
        } else if value & C_HALT != 0 {
            if !self.halted {
                self.dfsr |= 1;
            }
            self.halted = true;
        } else {
            self.halted = false;
        }
    }

    /// A 32-bit bus read at a word-aligned address.
    pub fn read32(&mut self, address: u64) -> u32 {
        match address {
            0xE000_EDF0 => self.dhcsr_value(),
            0xE000_EDF8 => self.dcrdr,
            0xE000_EDFC => self.demcr,
            0xE000_ED30 => self.dfsr,
            0xE000_EF40 => 0, // MVFR0: no FPU
            0xE000_2000 => {
                // FP_CTRL: rev 0, 6 comparators.
                let num_code = self.fp_comps.len() as u32;
                let mut value = ((num_code & 0xF0) << 8) | ((num_code & 0xF) << 4);
                if self.fp_ctrl_enable {
                    value |= 1;
                }
                value
            }
            a if (0xE000_2008..0xE000_2008 + 4 * self.fp_comps.len() as u64).contains(&a) => {
                self.fp_comps[((a - 0xE000_2008) / 4) as usize]
            }
            0xE000_1000 => (self.dwt_units.len() as u32) << 28,
            FPEC_CR => {
                self.fpec_cr | if self.fpec_locked { FPEC_CR_LOCK } else { 0 }
            }
            FPEC_SR => 0,
            a if (0xE000_1020..0xE000_1060).contains(&a) => {
                let unit = ((a - 0xE000_1020) / 16) as usize;
                let field = (((a - 0xE000_1020) % 16) / 4) as usize;
                if field < 3 {
                    self.dwt_units[unit][field]
                } else {
                    0
                }
            }
            _ => {
                let mut word = [0u8; 4];
                self.flat_read(address, &mut word);
                u32::from_le_bytes(word)
            }
        }
    }

    /// A bus write of `size` bytes within one word lane.
    pub fn write(&mut self, address: u64, value: u32, size: usize) {
        match address {
            0xE000_EDF0 if size == 4 => self.dhcsr_write(value),
            0xE000_EDF4 if size == 4 => {
                // DCRSR: move between DCRDR and the register file.
                let selector = (value & 0x7F) as usize;
                let write = value & (1 << 16) != 0;
                let index = match selector {
                    0..=18 => selector,
                    0b10100 => 19,
                    _ => return,
                };
                if write {
                    self.regs[index] = self.dcrdr;
                } else {
                    self.dcrdr = self.regs[index];
                }
            }
            0xE000_EDF8 if size == 4 => self.dcrdr = value,
            0xE000_EDFC if size == 4 => self.demcr = value,
            0xE000_ED30 if size == 4 => self.dfsr &= !value,
            0xE000_ED0C if size == 4 => {
                // AIRCR: a system reset request with the right key.
                if value >> 16 == 0x05FA && value & (1 << 2) != 0 {
                    self.regs[15] = 0x0800_0100;
                    // VC_CORERESET catches the core before the first
                    // instruction.
                    if self.demcr & 1 != 0 {
                        self.halted = true;
                        self.dfsr |= 1 << 3;
                    } else {
                        self.halted = false;
                    }
                }
            }
            0xE000_2000 if size == 4 => {
                // FP_CTRL honours writes only with the key bit.
                if value & 0b10 != 0 {
                    self.fp_ctrl_enable = value & 1 != 0;
                }
            }
            a if (0xE000_2008..0xE000_2008 + 4 * self.fp_comps.len() as u64).contains(&a)
                && size == 4 =>
            {
                self.fp_comps[((a - 0xE000_2008) / 4) as usize] = value;
            }
            a if (0xE000_1020..0xE000_1060).contains(&a) && size == 4 => {
                let unit = ((a - 0xE000_1020) / 16) as usize;
                let field = (((a - 0xE000_1020) % 16) / 4) as usize;
                if field < 3 {
                    self.dwt_units[unit][field] = value;
                }
            }
            FPEC_KEYR if size == 4 => {
                match (self.fpec_key_stage, value) {
                    (0, FPEC_KEY1) => self.fpec_key_stage = 1,
                    (1, FPEC_KEY2) => {
                        self.fpec_locked = false;
                        self.fpec_key_stage = 0;
                    }
                    _ => self.fpec_key_stage = 0,
                }
            }
            FPEC_CR if size == 4 => {
                if value & FPEC_CR_LOCK != 0 {
                    self.fpec_locked = true;
                }
                self.fpec_cr = value & !FPEC_CR_LOCK;
                if !self.fpec_locked
                    && self.fpec_cr & (FPEC_CR_PER | FPEC_CR_STRT)
                        == FPEC_CR_PER | FPEC_CR_STRT
                {
                    let sector = u64::from(self.fpec_ar) & !0x3FF;
                    for offset in 0..0x400 {
                        self.bytes.insert(sector + offset, 0xFF);
                    }
                }
            }
            FPEC_AR if size == 4 => self.fpec_ar = value,
            FPEC_SR if size == 4 => {}
            a if FLASH_RANGE.contains(&a) => {
                // Flash cells only accept programming with the controller
                // unlocked and in programming mode, and bits only clear.
                if self.fpec_locked || self.fpec_cr & FPEC_CR_PG == 0 {
                    return;
                }
                let bytes = value.to_le_bytes();
                for index in 0..size {
                    let slot = self
                        .bytes
                        .entry(address + index as u64)
                        .or_insert(0xFF);
                    *slot &= bytes[index];
                }
            }
            _ => {
                let bytes = value.to_le_bytes();
                for index in 0..size {
                    self.bytes.insert(address + index as u64, bytes[index]);
                }
            }
        }
    }
}

/// Fault injection knobs for the DAP model.
#[derive(Debug, Default)]
pub struct FaultInjection {
    /// Answer WAIT to this many requests before proceeding.
    pub wait_responses: u32,
    /// Answer FAULT to the next AP transaction and set STICKYERR.
    pub fault_next: bool,
}

/// A behavioural ADIv5 debug port with one AHB-AP.
#[derive(Debug)]
pub struct DapModel {
    /// The memory (and MMIO) behind the AP.
    pub memory: Rc<RefCell<TargetMemory>>,
    /// Fault injection state.
    pub inject: FaultInjection,
    ctrl_stat: u32,
    select: u32,
    rdbuff: u32,
    /// Posted value of the last AP read.
    ap_result: u32,
    csw: u32,
    tar: u32,
}

/// The SW-DP IDCODE of an STM32F103.
pub const FAKE_DPIDR: u32 = 0x1BA0_1477;
/// The AHB-AP identification of a Cortex-M3.
pub const FAKE_AP_IDR: u32 = 0x2477_0011;
/// BASE: ROM table at 0xE00FF000, present, ADIv5 format.
const FAKE_AP_BASE: u32 = 0xE00F_F003;

const CTRL_STICKYERR: u32 = 1 << 5;

impl Default for DapModel {
    fn default() -> Self {
        Self::new()
    }
}

impl DapModel {
    pub fn new() -> Self {
        Self {
            memory: Rc::new(RefCell::new(TargetMemory::new())),
            inject: FaultInjection::default(),
            ctrl_stat: 0,
            select: 0,
            rdbuff: 0,
            ap_result: 0,
            csw: 0,
            tar: 0,
        }
    }

    /// A second handle on the target memory for test assertions.
    pub fn memory_handle(&self) -> Rc<RefCell<TargetMemory>> {
        Rc::clone(&self.memory)
    }

    fn consume_injection(&mut self, ap: bool) -> Option<DapError> {
        if self.inject.wait_responses > 0 {
            self.inject.wait_responses -= 1;
            return Some(DapError::WaitResponse);
        }
        if ap && self.inject.fault_next {
            self.inject.fault_next = false;
            self.ctrl_stat |= CTRL_STICKYERR;
            return Some(DapError::FaultResponse);
        }
        if ap && self.ctrl_stat & CTRL_STICKYERR != 0 {
            // Sticky faults block AP traffic until cleared via ABORT.
            return Some(DapError::FaultResponse);
        }
        None
    }

    fn dp_read(&mut self, address: u8) -> Result<u32, DapError> {
        if let Some(error) = self.consume_injection(false) {
            return Err(error);
        }
        Ok(match address {
            0x0 => FAKE_DPIDR,
            0x4 => match self.select & 0xF {
                // CTRL/STAT with the power-up acks mirroring the requests.
                0 => {
                    let mut value = self.ctrl_stat;
                    if value & (1 << 28) != 0 {
                        value |= 1 << 29;
                    }
                    if value & (1 << 30) != 0 {
                        value |= 1 << 31;
                    }
                    value
                }
                // TARGETID: designer ST, part 0x410.
                2 => 0x0041_0041,
                _ => 0,
            },
            0x8 => self.select,
            0xC => self.rdbuff,
            _ => 0,
        })
    }

    fn dp_write(&mut self, address: u8, value: u32) -> Result<(), DapError> {
        if let Some(error) = self.consume_injection(false) {
            return Err(error);
        }
        match address {
            0x0 => {
                // ABORT: clear the sticky flags.
                if value & (1 << 2) != 0 {
                    self.ctrl_stat &= !CTRL_STICKYERR;
                }
                if value & (1 << 4) != 0 {
                    self.ctrl_stat &= !(1 << 1);
                }
            }
            0x4 if self.select & 0xF == 0 => self.ctrl_stat = value,
            0x8 => self.select = value,
            _ => {}
        }
        Ok(())
    }

    fn ap_register(&self, address: u8) -> u8 {
        (((self.select >> 4) & 0xF) as u8) << 4 | (address & 0xF)
    }

    fn transfer_size(&self) -> usize {
        match self.csw & 0b111 {
            0b000 => 1,
            0b001 => 2,
            _ => 4,
        }
    }

    fn increment_tar(&mut self) {
        if (self.csw >> 4) & 0b11 == 0b01 {
            let next = u64::from(self.tar) + self.transfer_size() as u64;
            let page = u64::from(self.tar) & !0x3FF;
            self.tar = (page | (next & 0x3FF)) as u32;
        }
    }

    /// An AP read. Returns the *posted* result: the value of the previous
    /// AP read, with the fresh value latched for the next one.
    fn ap_read(&mut self, address: u8) -> Result<u32, DapError> {
        if let Some(error) = self.consume_injection(true) {
            return Err(error);
        }
        if self.select >> 24 != 0 {
            // Only AP 0 exists; others read as zero.
            let posted = self.ap_result;
            self.ap_result = 0;
            self.rdbuff = 0;
            return Ok(posted);
        }

        let fresh = match self.ap_register(address) {
            0x00 => self.csw,
            0x04 => self.tar,
            0x0C => {
                let aligned = u64::from(self.tar) & !0b11;
                let value = self.memory.borrow_mut().read32(aligned);
                self.increment_tar();
                value
            }
            0xF4 => 0, // CFG: little endian, no extensions
            0xF8 => FAKE_AP_BASE,
            0xFC => FAKE_AP_IDR,
            _ => 0,
        };

        let posted = self.ap_result;
        self.ap_result = fresh;
        self.rdbuff = fresh;
        Ok(posted)
    }

    fn ap_write(&mut self, address: u8, value: u32) -> Result<(), DapError> {
        if let Some(error) = self.consume_injection(true) {
            return Err(error);
        }
        if self.select >> 24 != 0 {
            return Ok(());
        }

        match self.ap_register(address) {
            0x00 => self.csw = value,
            0x04 => self.tar = value,
            0x0C => {
                let size = self.transfer_size();
                let lane = (self.tar & 0b11) as u64;
                let aligned = u64::from(self.tar) & !0b11;
                let lane_value = value >> (lane * 8);
                self.memory
                    .borrow_mut()
                    .write(aligned + lane, lane_value, size);
                self.increment_tar();
            }
            _ => {}
        }
        Ok(())
    }
}

/// The DAP model exposed at the transfer level, for tests of everything
/// above the wire drivers.
#[derive(Debug, Default)]
pub struct FakeDapAccess {
    /// The model.
    pub model: DapModel,
}

impl FakeDapAccess {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RawDapAccess for FakeDapAccess {
    fn raw_read_register(&mut self, port: PortType, address: u8) -> Result<u32, DapError> {
        match port {
            PortType::DebugPort => self.model.dp_read(address),
            PortType::AccessPort => {
                // Posted semantics: drain through RDBUFF like the real
                // transports do.
                self.model.ap_read(address)?;
                self.model.dp_read(0xC)
            }
        }
    }

    fn raw_write_register(
        &mut self,
        port: PortType,
        address: u8,
        value: u32,
    ) -> Result<(), DapError> {
        match port {
            PortType::DebugPort => self.model.dp_write(address, value),
            PortType::AccessPort => self.model.ap_write(address, value),
        }
    }

    fn swj_sequence(&mut self, _bit_len: u8, _bits: u64) {}
    fn line_reset(&mut self) {}
    fn protocol_switch(&mut self) {}
    fn idle_cycles(&mut self, _count: usize) {}
    fn set_divider(&mut self, _divider: u32) {}
    fn divider(&self) -> u32 {
        0
    }
    fn protocol(&self) -> WireProtocol {
        WireProtocol::Swd
    }
    fn set_nrst(&mut self, _asserted: bool) {}
}

/// Wire-decoding state of the pin-level simulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Waiting for a start bit / collecting a request.
    Request,
    /// Turnaround cycle(s) before the target drives.
    TargetTurnaround,
    /// The target is shifting out its response queue.
    TargetDriving,
    /// Turnaround cycle before write data arrives.
    HostTurnaround,
    /// Collecting the 32+1 write data bits.
    WriteData,
}

/// A pin-level SWD target in front of a [`DapModel`].
///
/// Decodes requests edge by edge: host-driven bits are latched on the
/// rising clock edge, target-driven bits change on the falling edge, which
/// matches the sampling rules of the driver on the other side.
#[derive(Debug)]
pub struct SwdTargetSim {
    /// The target behind the wire.
    pub model: DapModel,
    host_drives: bool,
    swdio_host: bool,
    swclk: bool,
    drive: bool,
    phase: Phase,
    request: u32,
    request_bits: u8,
    out_queue: VecDeque<bool>,
    write_pending: Option<(PortType, u8)>,
    data: u64,
    data_bits: u8,
    ones_run: u32,
}

impl Default for SwdTargetSim {
    fn default() -> Self {
        Self::new()
    }
}

impl SwdTargetSim {
    pub fn new() -> Self {
        Self {
            model: DapModel::new(),
            host_drives: true,
            swdio_host: false,
            swclk: false,
            drive: false,
            phase: Phase::Request,
            request: 0,
            request_bits: 0,
            out_queue: VecDeque::new(),
            write_pending: None,
            data: 0,
            data_bits: 0,
            ones_run: 0,
        }
    }

    /// A second handle on the target memory for test assertions.
    pub fn memory_handle(&self) -> Rc<RefCell<TargetMemory>> {
        self.model.memory_handle()
    }

    fn rising_edge(&mut self) {
        if self.host_drives {
            let bit = self.swdio_host;

            // A long run of ones is a line reset, whatever state we were in.
            self.ones_run = if bit { self.ones_run + 1 } else { 0 };
            if self.ones_run >= 50 {
                self.reset_line_state();
                return;
            }

            match self.phase {
                Phase::Request => self.collect_request_bit(bit),
                Phase::WriteData => self.collect_data_bit(bit),
                // Stray host bits during other phases are protocol noise.
                _ => {}
            }
        } else {
            match self.phase {
                Phase::TargetTurnaround => {
                    self.phase = Phase::TargetDriving;
                }
                Phase::HostTurnaround => {
                    self.phase = Phase::WriteData;
                }
                _ => {}
            }
        }
    }

    fn falling_edge(&mut self) {
        if self.phase == Phase::TargetDriving {
            match self.out_queue.pop_front() {
                Some(bit) => self.drive = bit,
                None => {
                    // Response done; a write continues with its data phase.
                    if self.write_pending.is_some() {
                        self.phase = Phase::HostTurnaround;
                    } else {
                        self.phase = Phase::Request;
                    }
                }
            }
        }
    }

    fn reset_line_state(&mut self) {
        self.phase = Phase::Request;
        self.request = 0;
        self.request_bits = 0;
        self.out_queue.clear();
        self.write_pending = None;
        // A line reset also clears the DP SELECT register.
        self.model.select = 0;
    }

    fn collect_request_bit(&mut self, bit: bool) {
        // Idle low bits before the start bit are ignored.
        if self.request_bits == 0 && !bit {
            return;
        }

        self.request |= u32::from(bit) << self.request_bits;
        self.request_bits += 1;

        if self.request_bits == 8 {
            let request = self.request;
            self.request = 0;
            self.request_bits = 0;
            self.handle_request(request);
        }
    }

    fn collect_data_bit(&mut self, bit: bool) {
        self.data |= u64::from(bit) << self.data_bits;
        self.data_bits += 1;

        if self.data_bits == 33 {
            let value = (self.data & 0xFFFF_FFFF) as u32;
            let parity = self.data >> 32 != 0;
            self.data = 0;
            self.data_bits = 0;
            self.phase = Phase::Request;

            if parity != (value.count_ones() % 2 == 1) {
                tracing::debug!("Simulated target saw bad write parity");
                return;
            }
            if let Some((port, address)) = self.write_pending.take() {
                let result = match port {
                    PortType::DebugPort => self.model.dp_write(address, value),
                    PortType::AccessPort => self.model.ap_write(address, value),
                };
                // The ACK already went out; a late failure is dropped.
                if let Err(error) = result {
                    tracing::debug!("Late write failure in simulation: {error}");
                }
            }
        }
    }

    fn handle_request(&mut self, request: u32) {
        // start(0) APnDP(1) RnW(2) A2(3) A3(4) parity(5) stop(6) park(7)
        let apndp = request & (1 << 1) != 0;
        let rnw = request & (1 << 2) != 0;
        let address = (((request >> 3) & 0b11) << 2) as u8;
        let parity = request & (1 << 5) != 0;

        let request_parity =
            (apndp as u32 + rnw as u32 + ((request >> 3) & 1) + ((request >> 4) & 1)) % 2 == 1;
        if request & 1 == 0 || parity != request_parity {
            // Not a valid request; stay quiet so the host sees no ACK.
            self.queue_response(None, None);
            return;
        }

        let port = if apndp {
            PortType::AccessPort
        } else {
            PortType::DebugPort
        };

        if rnw {
            let result = match port {
                PortType::DebugPort => self.model.dp_read(address),
                PortType::AccessPort => self.model.ap_read(address),
            };
            match result {
                Ok(value) => self.queue_response(Some(0b001), Some(value)),
                Err(DapError::WaitResponse) => self.queue_response(Some(0b010), None),
                Err(DapError::FaultResponse) => self.queue_response(Some(0b100), None),
                Err(_) => self.queue_response(None, None),
            }
        } else {
            // Writes: check for injected responses before accepting data.
            let ack = if let Some(error) = self.model.consume_injection(apndp) {
                match error {
                    DapError::WaitResponse => 0b010,
                    _ => 0b100,
                }
            } else {
                self.write_pending = Some((port, address));
                0b001
            };
            self.queue_response(Some(ack), None);
        }
    }

    fn queue_response(&mut self, ack: Option<u32>, data: Option<u32>) {
        self.out_queue.clear();

        let Some(ack) = ack else {
            // No response at all: the line floats high-ish for the host.
            self.drive = true;
            for _ in 0..36 {
                self.out_queue.push_back(true);
            }
            self.phase = Phase::TargetTurnaround;
            return;
        };

        for bit in 0..3 {
            self.out_queue.push_back(ack & (1 << bit) != 0);
        }
        if let Some(value) = data {
            for bit in 0..32 {
                self.out_queue.push_back(value & (1 << bit) != 0);
            }
            self.out_queue.push_back(value.count_ones() % 2 == 1);
        }
        self.phase = Phase::TargetTurnaround;
    }
}

impl PinIo for SwdTargetSim {
    fn swdio_set_output(&mut self, output: bool) {
        self.host_drives = output;
    }

    fn swdio_write(&mut self, high: bool) {
        self.swdio_host = high;
    }

    fn swdio_read(&mut self) -> bool {
        self.drive
    }

    fn swclk_write(&mut self, high: bool) {
        if high == self.swclk {
            return;
        }
        self.swclk = high;
        if high {
            self.rising_edge();
        } else {
            self.falling_edge();
        }
    }

    fn tdi_write(&mut self, _high: bool) {}

    fn tdo_read(&mut self) -> bool {
        false
    }

    fn nrst_write(&mut self, _asserted: bool) {}

    fn delay(&mut self, _cycles: u32) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::architecture::arm::ap::{ApClass, IDR};
    use crate::architecture::arm::dp::DebugPortVersion;
    use crate::architecture::arm::memory::ArmMemoryInterface;
    use crate::architecture::arm::romtable::{Component, PeripheralKind};
    use crate::architecture::arm::ArmCommunicationInterface;
    use crate::probe::swd::SwdDriver;

    fn connected_interface() -> ArmCommunicationInterface {
        let driver = SwdDriver::new(SwdTargetSim::new());
        let mut iface = ArmCommunicationInterface::new(Box::new(driver));
        iface.connect().unwrap();
        iface
    }

    #[test]
    fn connect_reads_dpidr_over_the_wire() {
        let mut iface = connected_interface();
        let info = iface.debug_port_info().unwrap().clone();
        assert_eq!(info.version, DebugPortVersion::DPv1);
        assert_eq!(info.designer.get(), Some("ARM Ltd"));

        // The probe sequence from a cold wire: DPIDR, SELECT, AP0 IDR.
        let aps = iface.access_ports().unwrap();
        assert_eq!(aps.len(), 1);
        let idr: IDR = aps[0].idr;
        assert_eq!(u32::from(idr), FAKE_AP_IDR);
        assert_eq!(idr.ap_class(), ApClass::MemAp);
        assert_eq!(aps[0].base_address, Some(0xE00F_F000));
    }

    #[test]
    fn rom_table_walk_finds_the_scs() {
        let mut iface = connected_interface();
        let aps = iface.access_ports().unwrap();
        let mut memory = iface.memory_interface(&aps[0]).unwrap();

        let component = Component::try_parse(&mut memory, 0xE00F_F000).unwrap();
        let scs = component.find(PeripheralKind::Scs).unwrap();
        assert_eq!(scs.address, 0xE000_E000);
    }

    #[test]
    fn memory_roundtrip_through_the_pins() {
        let mut iface = connected_interface();
        let aps = iface.access_ports().unwrap();
        let mut memory = iface.memory_interface(&aps[0]).unwrap();

        let data: Vec<u8> = (0..64).map(|i| i as u8 ^ 0x5A).collect();
        memory.write(0x2000_0001, &data).unwrap();

        let mut read_back = vec![0u8; data.len()];
        memory.read(0x2000_0001, &mut read_back).unwrap();
        assert_eq!(read_back, data);
    }

    #[test]
    fn injected_wait_responses_are_survived() {
        let mut fake = FakeDapAccess::new();
        fake.model.inject.wait_responses = 3;
        let mut iface = ArmCommunicationInterface::new(Box::new(fake));
        iface.connect().unwrap();
    }

    #[test]
    fn sticky_fault_blocks_ap_until_cleared() {
        let mut fake = FakeDapAccess::new();
        fake.model.inject.fault_next = true;
        let mut iface = ArmCommunicationInterface::new(Box::new(fake));
        iface.connect().unwrap();

        let aps = iface.access_ports();
        // First AP access faults; the engine clears the sticky flag and
        // reports the error.
        assert!(aps.is_err());

        // After the cleanup the scan works again.
        let aps = iface.access_ports().unwrap();
        assert_eq!(aps.len(), 1);
    }
}
