//! IEEE 1149.1 JTAG driver.
//!
//! A TAP state tracker with minimal-TMS navigation between any two of the 16
//! states, arbitrary-length IR/DR scans, scan-chain enumeration, and the
//! ADIv5 DPACC/APACC transport that maps DAP transfers onto 35-bit DR scans.

use bitvec::prelude::*;

use crate::architecture::arm::dp::{Ctrl, RdBuff};
use crate::architecture::arm::{DapError, DpRegister, PortType, RawDapAccess};
use crate::probe::{IdCode, PinIo, WireProtocol, WireSettings};

/// The 16 TAP controller states.
#[derive(Copy, Clone, PartialEq, Eq, Debug, PartialOrd, Ord)]
#[allow(missing_docs)]
pub enum TapState {
    TestLogicReset,
    RunTestIdle,
    SelectDrScan,
    CaptureDr,
    ShiftDr,
    Exit1Dr,
    PauseDr,
    Exit2Dr,
    UpdateDr,
    SelectIrScan,
    CaptureIr,
    ShiftIr,
    Exit1Ir,
    PauseIr,
    Exit2Ir,
    UpdateIr,
}

impl TapState {
    const ALL: [TapState; 16] = [
        TapState::TestLogicReset,
        TapState::RunTestIdle,
        TapState::SelectDrScan,
        TapState::CaptureDr,
        TapState::ShiftDr,
        TapState::Exit1Dr,
        TapState::PauseDr,
        TapState::Exit2Dr,
        TapState::UpdateDr,
        TapState::SelectIrScan,
        TapState::CaptureIr,
        TapState::ShiftIr,
        TapState::Exit1Ir,
        TapState::PauseIr,
        TapState::Exit2Ir,
        TapState::UpdateIr,
    ];

    /// The state reached from `self` by clocking one TMS bit.
    pub fn step(self, tms: bool) -> TapState {
        use TapState::*;
        match (self, tms) {
            (TestLogicReset, true) => TestLogicReset,
            (TestLogicReset, false) => RunTestIdle,
            (RunTestIdle, true) => SelectDrScan,
            (RunTestIdle, false) => RunTestIdle,
            (SelectDrScan, true) => SelectIrScan,
            (SelectDrScan, false) => CaptureDr,
            (CaptureDr, true) => Exit1Dr,
            (CaptureDr, false) => ShiftDr,
            (ShiftDr, true) => Exit1Dr,
            (ShiftDr, false) => ShiftDr,
            (Exit1Dr, true) => UpdateDr,
            (Exit1Dr, false) => PauseDr,
            (PauseDr, true) => Exit2Dr,
            (PauseDr, false) => PauseDr,
            (Exit2Dr, true) => UpdateDr,
            (Exit2Dr, false) => ShiftDr,
            (UpdateDr, true) => SelectDrScan,
            (UpdateDr, false) => RunTestIdle,
            (SelectIrScan, true) => TestLogicReset,
            (SelectIrScan, false) => CaptureIr,
            (CaptureIr, true) => Exit1Ir,
            (CaptureIr, false) => ShiftIr,
            (ShiftIr, true) => Exit1Ir,
            (ShiftIr, false) => ShiftIr,
            (Exit1Ir, true) => UpdateIr,
            (Exit1Ir, false) => PauseIr,
            (PauseIr, true) => Exit2Ir,
            (PauseIr, false) => PauseIr,
            (Exit2Ir, true) => UpdateIr,
            (Exit2Ir, false) => ShiftIr,
            (UpdateIr, true) => SelectDrScan,
            (UpdateIr, false) => RunTestIdle,
        }
    }

    /// The shortest TMS sequence from `self` to `target`.
    ///
    /// Breadth-first over the 16-state graph; every state is reachable from
    /// every other in at most eight clocks.
    pub fn path_to(self, target: TapState) -> Vec<bool> {
        if self == target {
            return Vec::new();
        }

        let index = |s: TapState| TapState::ALL.iter().position(|&x| x == s).unwrap();

        let mut predecessor: [Option<(TapState, bool)>; 16] = [None; 16];
        let mut queue = std::collections::VecDeque::from([self]);

        while let Some(state) = queue.pop_front() {
            for tms in [false, true] {
                let next = state.step(tms);
                if next != self && predecessor[index(next)].is_none() {
                    predecessor[index(next)] = Some((state, tms));
                    if next == target {
                        let mut path = Vec::new();
                        let mut cursor = target;
                        while cursor != self {
                            let (prev, tms) = predecessor[index(cursor)].unwrap();
                            path.push(tms);
                            cursor = prev;
                        }
                        path.reverse();
                        return path;
                    }
                    queue.push_back(next);
                }
            }
        }

        unreachable!("TAP state graph is fully connected");
    }
}

/// One device on the scan chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanChainElement {
    /// The IDCODE the TAP presented after reset, if it has one.
    pub idcode: Option<IdCode>,
    /// Instruction register length in bits.
    pub ir_len: u8,
}

/// Object-safe access to a JTAG scan chain.
///
/// Implemented by [`JtagDriver`]; consumed by the ARM DPACC/APACC transport
/// and the RISC-V debug transport module.
pub trait JtagAccess {
    /// Reset the TAP controllers and settle in Run-Test/Idle.
    fn tap_reset(&mut self);
    /// Shift `tdi` through the instruction register, returning the captured
    /// bits.
    fn scan_ir(&mut self, tdi: &BitSlice<u8, Lsb0>) -> BitVec<u8, Lsb0>;
    /// Shift `tdi` through the data register, returning the captured bits.
    fn scan_dr(&mut self, tdi: &BitSlice<u8, Lsb0>) -> BitVec<u8, Lsb0>;
    /// Clock `cycles` in Run-Test/Idle.
    fn run_test_idle(&mut self, cycles: usize);
    /// Set the clock divider.
    fn set_divider(&mut self, divider: u32);
    /// Current clock divider.
    fn divider(&self) -> u32;
    /// Drive or release the target reset line.
    fn set_nrst(&mut self, asserted: bool);
    /// Clock a raw TMS bit string, LSB first. Used for SWJ protocol switch
    /// sequences, which are defined on the TMS pin.
    fn tms_sequence(&mut self, bit_len: u8, bits: u64);
}

/// A JTAG driver over raw pins. SWDIO acts as TMS, SWCLK as TCK.
#[derive(Debug)]
pub struct JtagDriver<P: PinIo> {
    pins: P,
    settings: WireSettings,
    state: TapState,
}

/// Upper bound on devices we are prepared to find on one chain.
const MAX_CHAIN_LENGTH: usize = 8;

impl<P: PinIo> JtagDriver<P> {
    pub fn new(pins: P) -> Self {
        Self::with_settings(pins, WireSettings::default())
    }

    pub fn with_settings(mut pins: P, settings: WireSettings) -> Self {
        pins.swdio_set_output(true);
        pins.swdio_write(true);
        pins.swclk_write(false);
        pins.tdi_write(false);
        Self {
            pins,
            settings,
            // Unknown at power-up; the first tap_reset pins it down.
            state: TapState::TestLogicReset,
        }
    }

    pub fn into_pins(self) -> P {
        self.pins
    }

    /// Current TAP state as tracked by the driver.
    pub fn state(&self) -> TapState {
        self.state
    }

    /// Clock one TCK cycle with the given TMS/TDI levels, sampling TDO
    /// before the rising edge.
    fn clock(&mut self, tms: bool, tdi: bool) -> bool {
        self.pins.swdio_write(tms);
        self.pins.tdi_write(tdi);
        self.half_delay();
        let tdo = self.pins.tdo_read();
        self.pins.swclk_write(true);
        self.half_delay();
        self.pins.swclk_write(false);
        self.state = self.state.step(tms);
        tdo
    }

    fn goto(&mut self, target: TapState) {
        for tms in self.state.path_to(target) {
            self.clock(tms, false);
        }
    }

    /// Shift bits through the register reachable from `shift_state`,
    /// leaving via Exit1 and Update back to Run-Test/Idle.
    fn shift(&mut self, shift_state: TapState, tdi: &BitSlice<u8, Lsb0>) -> BitVec<u8, Lsb0> {
        let mut tdo = BitVec::with_capacity(tdi.len());
        if tdi.is_empty() {
            return tdo;
        }

        self.goto(shift_state);

        // The final bit is clocked together with the TMS-high transition to
        // Exit1.
        for bit in &tdi[..tdi.len() - 1] {
            tdo.push(self.clock(false, *bit));
        }
        tdo.push(self.clock(true, tdi[tdi.len() - 1]));

        self.goto(TapState::RunTestIdle);
        tdo
    }

    fn half_delay(&mut self) {
        let divider = self.settings.divider;
        if divider != 0 {
            self.pins.delay(divider);
        }
    }

    /// Enumerate the scan chain after a TAP reset.
    ///
    /// Every TAP with an IDCODE register presents it on the DR path after
    /// reset; TAPs without one present a single BYPASS zero bit. An all-ones
    /// word marks the end of the chain.
    pub fn scan_chain(&mut self) -> Vec<ScanChainElement> {
        self.tap_reset();

        let tdi: BitVec<u8, Lsb0> = BitVec::repeat(true, 32 * MAX_CHAIN_LENGTH + 1);
        let tdo = self.scan_dr(&tdi);

        let mut elements = Vec::new();
        let mut cursor = 0;
        while cursor < tdo.len() && elements.len() < MAX_CHAIN_LENGTH {
            if !tdo[cursor] {
                // BYPASS bit: a TAP without an IDCODE register.
                elements.push(ScanChainElement {
                    idcode: None,
                    ir_len: 4,
                });
                cursor += 1;
                continue;
            }

            if cursor + 32 > tdo.len() {
                break;
            }
            let word = crate::probe::bits_to_u32(tdo[cursor..cursor + 32].iter().by_vals());
            if word == u32::MAX {
                break;
            }

            let idcode = IdCode(word);
            tracing::debug!("Scan chain TAP {}: {}", elements.len(), idcode);
            elements.push(ScanChainElement {
                ir_len: default_ir_len(&idcode),
                idcode: Some(idcode),
            });
            cursor += 32;
        }

        elements
    }
}

/// IR length by designer convention: ARM ADI TAPs use 4 bits, RISC-V debug
/// transport modules use 5.
fn default_ir_len(idcode: &IdCode) -> u8 {
    match idcode.manufacturer_name() {
        Some("ARM Ltd") => 4,
        _ => 5,
    }
}

impl<P: PinIo> JtagAccess for JtagDriver<P> {
    fn tap_reset(&mut self) {
        // Five TMS-high clocks reach Test-Logic-Reset from any state.
        for _ in 0..5 {
            self.clock(true, false);
        }
        self.state = TapState::TestLogicReset;
        self.clock(false, false);
    }

    fn scan_ir(&mut self, tdi: &BitSlice<u8, Lsb0>) -> BitVec<u8, Lsb0> {
        self.shift(TapState::ShiftIr, tdi)
    }

    fn scan_dr(&mut self, tdi: &BitSlice<u8, Lsb0>) -> BitVec<u8, Lsb0> {
        self.shift(TapState::ShiftDr, tdi)
    }

    fn run_test_idle(&mut self, cycles: usize) {
        self.goto(TapState::RunTestIdle);
        for _ in 0..cycles {
            self.clock(false, false);
        }
    }

    fn set_divider(&mut self, divider: u32) {
        self.settings.divider = divider;
    }

    fn divider(&self) -> u32 {
        self.settings.divider
    }

    fn set_nrst(&mut self, asserted: bool) {
        self.pins.nrst_write(asserted);
    }

    fn tms_sequence(&mut self, bit_len: u8, bits: u64) {
        for index in 0..bit_len {
            let tms = bits & (1 << index) != 0;
            self.clock(tms, false);
        }
    }
}

// IR values of the ARM JTAG-DP.
const IR_ABORT: u8 = 0x8;
const IR_DPACC: u8 = 0xA;
const IR_APACC: u8 = 0xB;

// 3-bit status field of a DPACC/APACC capture.
const JTAG_STATUS_WAIT: u32 = 0b001;
const JTAG_STATUS_OK_FAULT: u32 = 0b010;

/// ADIv5 transport over a JTAG-DP.
///
/// DAP transfers become 35-bit DR scans: `[RnW, A[3:2], data]` shifted into
/// DPACC or APACC. The captured status applies to the *previous* scan, so
/// every access is followed by an RDBUFF read that both drains posted data
/// and collects the status. OK/FAULT is disambiguated through CTRL/STAT.
#[derive(Debug)]
pub struct JtagArmTransport<J: JtagAccess> {
    jtag: J,
    current_ir: Option<u8>,
}

impl<J: JtagAccess> JtagArmTransport<J> {
    pub fn new(jtag: J) -> Self {
        Self {
            jtag,
            current_ir: None,
        }
    }

    pub fn into_inner(self) -> J {
        self.jtag
    }

    fn select_ir(&mut self, ir: u8) {
        if self.current_ir != Some(ir) {
            let bits: BitVec<u8, Lsb0> = (0..4).map(|i| ir & (1 << i) != 0).collect();
            self.jtag.scan_ir(&bits);
            self.current_ir = Some(ir);
        }
    }

    /// One DPACC/APACC scan. Returns the captured value and status, both of
    /// which pertain to the previous scan.
    fn scan(&mut self, ir: u8, address: u8, read: bool, value: u32) -> (u32, u32) {
        self.select_ir(ir);

        let mut payload = 0u64;
        payload |= u64::from(read);
        payload |= u64::from(address & 0b1100) >> 1;
        payload |= u64::from(value) << 3;

        let tdi: BitVec<u8, Lsb0> = (0..35).map(|i| payload & (1 << i) != 0).collect();
        let tdo = self.jtag.scan_dr(&tdi);

        let status = crate::probe::bits_to_u32(tdo[0..3].iter().by_vals());
        let captured = crate::probe::bits_to_u32(tdo[3..35].iter().by_vals());
        (captured, status)
    }

    /// Map a captured status field to a transfer result.
    fn check_status(status: u32) -> Result<(), DapError> {
        match status {
            JTAG_STATUS_WAIT => Err(DapError::WaitResponse),
            JTAG_STATUS_OK_FAULT => Ok(()),
            _ => Err(DapError::NoAcknowledge),
        }
    }

    /// After an OK/FAULT response, look at CTRL/STAT to find out which of
    /// the two it was.
    fn check_sticky(&mut self) -> Result<(), DapError> {
        let (_, _) = self.scan(IR_DPACC, Ctrl::ADDRESS, true, 0);
        let (ctrl, status) = self.scan(IR_DPACC, RdBuff::ADDRESS, true, 0);
        Self::check_status(status)?;

        let ctrl = Ctrl(ctrl);
        if ctrl.sticky_err() || ctrl.sticky_orun() {
            Err(DapError::FaultResponse)
        } else {
            Ok(())
        }
    }

    fn port_ir(port: PortType) -> u8 {
        match port {
            PortType::DebugPort => IR_DPACC,
            PortType::AccessPort => IR_APACC,
        }
    }
}

impl<J: JtagAccess> RawDapAccess for JtagArmTransport<J> {
    fn raw_read_register(&mut self, port: PortType, address: u8) -> Result<u32, DapError> {
        let (_, _) = self.scan(Self::port_ir(port), address, true, 0);
        let (value, status) = self.scan(IR_DPACC, RdBuff::ADDRESS, true, 0);
        Self::check_status(status)?;
        self.check_sticky()?;
        Ok(value)
    }

    fn raw_write_register(
        &mut self,
        port: PortType,
        address: u8,
        value: u32,
    ) -> Result<(), DapError> {
        let (_, _) = self.scan(Self::port_ir(port), address, false, value);
        let (_, status) = self.scan(IR_DPACC, RdBuff::ADDRESS, true, 0);
        Self::check_status(status)?;
        self.check_sticky()
    }

    fn swj_sequence(&mut self, bit_len: u8, bits: u64) {
        self.jtag.tms_sequence(bit_len, bits);
        self.current_ir = None;
    }

    fn line_reset(&mut self) {
        self.jtag.tap_reset();
        self.current_ir = None;
    }

    fn protocol_switch(&mut self) {
        self.jtag.tap_reset();
        self.current_ir = None;
    }

    fn idle_cycles(&mut self, count: usize) {
        self.jtag.run_test_idle(count);
    }

    fn set_divider(&mut self, divider: u32) {
        self.jtag.set_divider(divider);
    }

    fn divider(&self) -> u32 {
        self.jtag.divider()
    }

    fn protocol(&self) -> WireProtocol {
        WireProtocol::Jtag
    }

    fn set_nrst(&mut self, asserted: bool) {
        self.jtag.set_nrst(asserted);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::fake::RecordingPins;

    #[test]
    fn canonical_paths_are_minimal() {
        use TapState::*;
        assert_eq!(
            TestLogicReset.path_to(RunTestIdle),
            vec![false],
        );
        assert_eq!(
            RunTestIdle.path_to(ShiftDr),
            vec![true, false, false],
        );
        assert_eq!(
            RunTestIdle.path_to(ShiftIr),
            vec![true, true, false, false],
        );
        assert_eq!(
            ShiftDr.path_to(RunTestIdle),
            vec![true, true, false],
        );
    }

    #[test]
    fn every_state_reachable_within_eight_clocks() {
        for &from in &TapState::ALL {
            for &to in &TapState::ALL {
                let path = from.path_to(to);
                assert!(path.len() <= 8, "{from:?} -> {to:?} took {}", path.len());

                let mut state = from;
                for tms in path {
                    state = state.step(tms);
                }
                assert_eq!(state, to);
            }
        }
    }

    #[test]
    fn tap_reset_lands_in_run_test_idle() {
        let mut jtag = JtagDriver::new(RecordingPins::with_input(&[]));
        jtag.tap_reset();
        assert_eq!(jtag.state(), TapState::RunTestIdle);
    }

    #[test]
    fn dr_scan_returns_to_idle_and_captures_width() {
        let mut jtag = JtagDriver::new(RecordingPins::with_input(&[]));
        jtag.tap_reset();

        let tdi: BitVec<u8, Lsb0> = BitVec::repeat(true, 35);
        let tdo = jtag.scan_dr(&tdi);
        assert_eq!(tdo.len(), 35);
        assert_eq!(jtag.state(), TapState::RunTestIdle);
    }

    #[test]
    fn scan_chain_reads_a_single_idcode() {
        let idcode = 0x3BA0_0477u32;

        // TDO script: 6 reset clocks and 3 state-move clocks before the
        // capture, then the IDCODE, then the all-ones end of chain.
        let mut input = vec![false; 9];
        input.extend((0..32).map(|i| idcode & (1 << i) != 0));
        input.extend(std::iter::repeat(true).take(40));

        let mut jtag = JtagDriver::new(RecordingPins::with_input(&input));
        let chain = jtag.scan_chain();

        assert_eq!(chain.len(), 1);
        assert_eq!(chain[0].idcode.unwrap().0, idcode);
        assert_eq!(chain[0].ir_len, 4);
    }

    #[test]
    fn empty_scan_is_a_no_op() {
        let mut jtag = JtagDriver::new(RecordingPins::with_input(&[]));
        jtag.tap_reset();
        let before = jtag.state();
        let tdo = jtag.scan_dr(BitVec::<u8, Lsb0>::new().as_bitslice());
        assert!(tdo.is_empty());
        assert_eq!(jtag.state(), before);
    }
}
