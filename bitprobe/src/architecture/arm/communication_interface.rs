//! The ADIv5/v6 debug port engine.
//!
//! Sits between the raw wire transports and everything that wants typed
//! register access. Owns the retry policy (WAIT backoff with a hard
//! deadline), sticky-fault cleanup through ABORT, protocol-error recovery
//! through a line reset, and the SELECT cache that makes AP/bank switching
//! cheap.

use std::time::{Duration, Instant};

use super::dp::{Abort, Ctrl, DebugPortVersion, Select1, SelectV1, SelectV3, TargetId, DPIDR};
use super::memory::{AdiMemoryInterface, MemoryAp};
use super::{
    ap::{ApClass, ApInformation},
    ApAddress, ApRegister, ArmError, DapError, DpRegister, PortType, RawDapAccess,
};
use crate::probe::WireProtocol;

/// Total time the engine keeps retrying a transfer that is answered WAIT.
pub const SWD_WAIT_TIMEOUT: Duration = Duration::from_millis(250);

/// How long to wait for the debug domain power-up handshake.
const POWER_UP_TIMEOUT: Duration = Duration::from_millis(100);

/// The SELECT value last written to the debug port, so redundant writes can
/// be elided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SelectCache {
    /// Nothing written since connect; contents unknown.
    Unknown,
    /// ADIv5 layout.
    V1(SelectV1),
    /// ADIv6 layout, SELECT and SELECT1.
    V3(SelectV3, Select1),
}

/// Identity of the connected debug port.
#[derive(Debug, Clone)]
pub struct DebugPortInfo {
    /// The architecture version from DPIDR.
    pub version: DebugPortVersion,
    /// The designer of the DP.
    pub designer: jep106::JEP106Code,
    /// Whether this is a MINDP implementation.
    pub min_dp: bool,
    /// TARGETID contents, read once at connect time on DPv2 and later.
    pub target_id: Option<TargetId>,
}

/// An implementation of the communication protocol between probe and target.
///
/// One instance per physical connection; at most one debug port is active
/// behind it at any time.
pub struct ArmCommunicationInterface {
    probe: Box<dyn RawDapAccess>,
    select: SelectCache,
    info: Option<DebugPortInfo>,
}

impl std::fmt::Debug for ArmCommunicationInterface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArmCommunicationInterface")
            .field("select", &self.select)
            .field("info", &self.info)
            .finish()
    }
}

impl ArmCommunicationInterface {
    pub fn new(probe: Box<dyn RawDapAccess>) -> Self {
        Self {
            probe,
            select: SelectCache::Unknown,
            info: None,
        }
    }

    /// Consume the interface and hand the transport back.
    pub fn close(self) -> Box<dyn RawDapAccess> {
        self.probe
    }

    /// The raw transport, for wire housekeeping (clock divider, nRST).
    pub fn probe_mut(&mut self) -> &mut dyn RawDapAccess {
        &mut *self.probe
    }

    /// The active wire protocol.
    pub fn protocol(&self) -> WireProtocol {
        self.probe.protocol()
    }

    /// Identity of the connected DP, if a connect succeeded.
    pub fn debug_port_info(&self) -> Option<&DebugPortInfo> {
        self.info.as_ref()
    }

    /// Establish communication with the debug port: switch the wire to the
    /// active protocol, read DPIDR, clear leftover sticky errors, power up
    /// the debug domain and read TARGETID where available.
    pub fn connect(&mut self) -> Result<DebugPortInfo, ArmError> {
        self.select = SelectCache::Unknown;
        self.info = None;

        self.probe.protocol_switch();

        let dpidr = DPIDR(self.raw_dp_read(DPIDR::ADDRESS)?);
        let version = dpidr.port_version();
        tracing::info!(
            "Connected to {} DP, designer {:?}",
            version,
            dpidr.designer_code().get()
        );

        // A line reset leaves STICKYORUN set on some parts. Start clean.
        let mut abort = Abort::default();
        abort.set_orunerrclr(true);
        abort.set_stkerrclr(true);
        abort.set_stkcmpclr(true);
        abort.set_wderrclr(true);
        self.raw_dp_write(Abort::ADDRESS, abort.into())?;

        self.select = match version {
            DebugPortVersion::DPv3 => SelectCache::V3(SelectV3(0), Select1(0)),
            _ => SelectCache::V1(SelectV1(0)),
        };
        self.write_select()?;

        self.power_up_debug_domain()?;

        // TARGETID is read exactly once, up front. Parts that rotate it
        // mid-scan present a stable identity for the rest of the session.
        let target_id = if matches!(version, DebugPortVersion::DPv2 | DebugPortVersion::DPv3) {
            Some(self.read_dp_register::<TargetId>()?)
        } else {
            None
        };

        let info = DebugPortInfo {
            version,
            designer: dpidr.designer_code(),
            min_dp: dpidr.min(),
            target_id,
        };
        self.info = Some(info.clone());
        Ok(info)
    }

    fn power_up_debug_domain(&mut self) -> Result<(), ArmError> {
        let mut ctrl = Ctrl::default();
        ctrl.set_csyspwrupreq(true);
        ctrl.set_cdbgpwrupreq(true);
        self.write_dp_register(ctrl)?;

        let start = Instant::now();
        loop {
            let ctrl: Ctrl = self.read_dp_register()?;
            if ctrl.csyspwrupack() && ctrl.cdbgpwrupack() {
                return Ok(());
            }
            if start.elapsed() > POWER_UP_TIMEOUT {
                tracing::error!("Debug domain power-up was not acknowledged");
                return Err(ArmError::Timeout);
            }
        }
    }

    /// Read a typed DP register.
    pub fn read_dp_register<R: DpRegister>(&mut self) -> Result<R, ArmError> {
        self.select_dp_bank(R::BANK, R::ADDRESS)?;
        let value = self.raw_dp_read(R::ADDRESS)?;
        tracing::trace!("Read DP register {}: {value:#010x}", R::NAME);
        Ok(R::from(value))
    }

    /// Write a typed DP register.
    pub fn write_dp_register<R: DpRegister>(&mut self, register: R) -> Result<(), ArmError> {
        self.select_dp_bank(R::BANK, R::ADDRESS)?;
        let value: u32 = register.into();
        tracing::trace!("Writing DP register {}: {value:#010x}", R::NAME);
        self.raw_dp_write(R::ADDRESS, value)
    }

    /// Read a typed AP register.
    pub fn read_ap_register<R: ApRegister>(&mut self, ap: ApAddress) -> Result<R, ArmError> {
        self.select_ap_bank(ap, R::ADDRESS)?;
        let value = self.read_with_retry(PortType::AccessPort, R::ADDRESS & 0xF)?;
        tracing::trace!("Read AP register {} on {ap}: {value:#010x}", R::NAME);
        Ok(R::from(value))
    }

    /// Write a typed AP register.
    pub fn write_ap_register<R: ApRegister>(
        &mut self,
        ap: ApAddress,
        register: R,
    ) -> Result<(), ArmError> {
        self.select_ap_bank(ap, R::ADDRESS)?;
        let value: u32 = register.into();
        tracing::trace!("Writing AP register {} on {ap}: {value:#010x}", R::NAME);
        self.write_with_retry(PortType::AccessPort, R::ADDRESS & 0xF, value)
    }

    /// Read the same AP register repeatedly, e.g. DRW during a block
    /// transfer. Each element is retried independently so a WAIT in the
    /// middle of a block does not disturb auto-increment state.
    pub fn read_ap_register_repeated<R: ApRegister>(
        &mut self,
        ap: ApAddress,
        values: &mut [u32],
    ) -> Result<(), ArmError> {
        self.select_ap_bank(ap, R::ADDRESS)?;
        for value in values.iter_mut() {
            *value = self.read_with_retry(PortType::AccessPort, R::ADDRESS & 0xF)?;
        }
        Ok(())
    }

    /// Write the same AP register repeatedly.
    pub fn write_ap_register_repeated<R: ApRegister>(
        &mut self,
        ap: ApAddress,
        values: &[u32],
    ) -> Result<(), ArmError> {
        self.select_ap_bank(ap, R::ADDRESS)?;
        for &value in values {
            self.write_with_retry(PortType::AccessPort, R::ADDRESS & 0xF, value)?;
        }
        Ok(())
    }

    /// Enumerate the access ports of the connected DP.
    pub fn access_ports(&mut self) -> Result<Vec<ApInformation>, ArmError> {
        match self.info.as_ref().map(|info| info.version) {
            Some(DebugPortVersion::DPv3) => self.enumerate_access_ports_v2(),
            Some(_) => super::ap::valid_access_ports(self),
            None => Err(ArmError::UnsupportedDpOperation("scan before connect")),
        }
    }

    /// A word read from the ADIv6 DP address space: the whole space is
    /// addressed through SELECT, with the low address bits picking the
    /// register within the selected granule.
    fn read_v2_word(&mut self, address: u64) -> Result<u32, ArmError> {
        self.select_ap_bank(ApAddress::V2(address & !0xF), (address & 0xF) as u8)?;
        self.read_with_retry(PortType::AccessPort, (address & 0xC) as u8)
    }

    /// On an ADIv6 DP the APs hang off a ROM table rooted at address 0 of
    /// the DP address space. Walk it, bounded like the MEM-AP ROM walker,
    /// and report every AP frame found.
    fn enumerate_access_ports_v2(&mut self) -> Result<Vec<ApInformation>, ArmError> {
        let mut found = Vec::new();
        self.collect_v2_aps(0, 0, &mut found)?;
        Ok(found)
    }

    fn collect_v2_aps(
        &mut self,
        base: u64,
        depth: usize,
        found: &mut Vec<ApInformation>,
    ) -> Result<(), ArmError> {
        const MAX_DEPTH: usize = 8;
        const MAX_ENTRIES: u64 = 960;
        /// DEVARCH architecture id of a class 0x9 ROM table.
        const DEVARCH_ROM: u32 = 0x0AF7;
        /// Offset of the register file within an ADIv6 AP frame.
        const AP_REGISTER_FILE: u64 = 0xD00;

        if depth > MAX_DEPTH {
            tracing::warn!("AP ROM table at {base:#x} exceeds the depth bound");
            return Ok(());
        }

        // Class from CIDR1; only ROM-shaped components are walkable.
        let cidr1 = self.read_v2_word(base + 0xFF4)?;
        let devarch = self.read_v2_word(base + 0xFBC)?;
        let class = (cidr1 >> 4) & 0xF;
        let is_rom = class == 0x1 || (class == 0x9 && devarch & 0xFFFF == DEVARCH_ROM);

        if !is_rom {
            // A leaf component in the DP address space: an AP frame. Its
            // register file sits in the last 256 bytes before the ID block.
            let ap = ApAddress::V2(base + AP_REGISTER_FILE);
            let idr: super::ap::IDR = self.read_ap_register(ap)?;
            if !idr.exists() {
                return Ok(());
            }

            let mut info = ApInformation {
                address: ap,
                idr,
                base_address: None,
                large_address: false,
            };
            if idr.ap_class() == ApClass::MemAp {
                let cfg: super::ap::CFG = self.read_ap_register(ap)?;
                let ap_base: super::ap::BASE = self.read_ap_register(ap)?;
                info.large_address = cfg.la();
                if ap_base.entry_present() {
                    let mut base_address = u64::from(ap_base.baseaddr()) << 12;
                    if cfg.la() {
                        let base2: super::ap::BASE2 = self.read_ap_register(ap)?;
                        base_address |= u64::from(base2.0) << 32;
                    }
                    info.base_address = Some(base_address);
                }
            }
            tracing::debug!("Found ADIv6 AP at {base:#x}");
            found.push(info);
            return Ok(());
        }

        for index in 0..MAX_ENTRIES {
            let entry = self.read_v2_word(base + index * 4)?;
            if entry == 0 {
                break;
            }
            if entry & 1 == 0 {
                continue;
            }

            let offset = i64::from((entry & 0xFFFF_F000) as i32);
            let child = (base as i64).wrapping_add(offset) as u64;
            self.collect_v2_aps(child, depth + 1, found)?;
        }

        Ok(())
    }

    /// A memory interface through the given AP.
    pub fn memory_interface(
        &mut self,
        ap: &ApInformation,
    ) -> Result<AdiMemoryInterface<'_>, ArmError> {
        if ap.idr.ap_class() != ApClass::MemAp {
            return Err(ArmError::NotAMemAp(ap.address));
        }
        Ok(AdiMemoryInterface::new(
            self,
            MemoryAp {
                address: ap.address,
                large_address: ap.large_address,
            },
        ))
    }

    /// DP register access with bank handling but no SELECT update for APs.
    fn raw_dp_read(&mut self, address: u8) -> Result<u32, ArmError> {
        self.read_with_retry(PortType::DebugPort, address)
    }

    fn raw_dp_write(&mut self, address: u8, value: u32) -> Result<(), ArmError> {
        self.write_with_retry(PortType::DebugPort, address, value)
    }

    /// Make sure DPBANKSEL matches before touching a banked DP address.
    /// Only addresses 0x0 and 0x4 are banked; the rest ignore the bank.
    fn select_dp_bank(&mut self, bank: u8, address: u8) -> Result<(), ArmError> {
        if address != 0x0 && address != 0x4 {
            return Ok(());
        }

        let current = match self.select {
            SelectCache::Unknown => None,
            SelectCache::V1(s) => Some(s.dp_bank_sel()),
            SelectCache::V3(s, _) => Some(s.dp_bank_sel()),
        };
        if current == Some(bank) {
            return Ok(());
        }

        match &mut self.select {
            SelectCache::Unknown => {
                let mut select = SelectV1(0);
                select.set_dp_bank_sel(bank);
                self.select = SelectCache::V1(select);
            }
            SelectCache::V1(s) => s.set_dp_bank_sel(bank),
            SelectCache::V3(s, _) => s.set_dp_bank_sel(bank),
        }

        tracing::debug!("Changing DP_BANK_SEL to {bank}");
        self.write_select()
    }

    /// Make sure SELECT addresses the requested AP register bank.
    fn select_ap_bank(&mut self, ap: ApAddress, address: u8) -> Result<(), ArmError> {
        let previous = self.select;

        match (ap, &mut self.select) {
            (ApAddress::V1(port), SelectCache::V1(s)) => {
                s.set_ap_sel(port);
                s.set_ap_bank_sel(address >> 4);
            }
            (ApAddress::V1(port), select @ SelectCache::Unknown) => {
                let mut s = SelectV1(0);
                s.set_ap_sel(port);
                s.set_ap_bank_sel(address >> 4);
                *select = SelectCache::V1(s);
            }
            (ApAddress::V2(base), SelectCache::V3(s, s1)) => {
                let register_address = base + u64::from(address);
                s.set_addr(((register_address >> 4) & 0x0FFF_FFFF) as u32);
                s1.set_addr((register_address >> 32) as u32);
            }
            (ap, _) => {
                tracing::error!("AP address {ap:?} does not match the DP version");
                return Err(ArmError::ApNotFound(ap));
            }
        }

        if previous != self.select {
            tracing::debug!("Changing SELECT to {:x?}", self.select);
            self.write_select()?;
        }

        Ok(())
    }

    fn write_select(&mut self) -> Result<(), ArmError> {
        match self.select {
            SelectCache::Unknown => Ok(()),
            SelectCache::V1(select) => self.raw_dp_write(SelectV1::ADDRESS, select.into()),
            SelectCache::V3(select, select1) => {
                self.raw_dp_write(SelectV3::ADDRESS, select.into())?;
                // SELECT1 lives in DP bank 5 of address 0x4; selecting that
                // bank goes through SELECT itself, which we just wrote.
                let mut banked = select;
                banked.set_dp_bank_sel(Select1::BANK);
                self.raw_dp_write(SelectV3::ADDRESS, banked.into())?;
                self.raw_dp_write(Select1::ADDRESS, select1.into())?;
                self.raw_dp_write(SelectV3::ADDRESS, select.into())
            }
        }
    }

    /// One logical read with the full recovery ladder.
    fn read_with_retry(&mut self, port: PortType, address: u8) -> Result<u32, ArmError> {
        let deadline = Instant::now() + SWD_WAIT_TIMEOUT;
        let mut protocol_retries = 0;

        loop {
            match self.probe.raw_read_register(port, address) {
                Ok(value) => return Ok(value),
                Err(DapError::WaitResponse) => {
                    self.wait_backoff(deadline)?;
                }
                Err(DapError::FaultResponse) => {
                    self.clear_sticky_fault(port, address)?;
                    return Err(ArmError::Fault);
                }
                Err(error) => {
                    protocol_retries += 1;
                    if protocol_retries > 2 || !self.try_line_recovery() {
                        tracing::error!("Unrecoverable {error} on the wire");
                        return Err(ArmError::Protocol(error));
                    }
                }
            }
        }
    }

    /// One logical write with the full recovery ladder. A posted write that
    /// keeps WAITing past the deadline takes the transport down.
    fn write_with_retry(&mut self, port: PortType, address: u8, value: u32) -> Result<(), ArmError> {
        let deadline = Instant::now() + SWD_WAIT_TIMEOUT;
        let mut protocol_retries = 0;

        loop {
            match self.probe.raw_write_register(port, address, value) {
                Ok(()) => return Ok(()),
                Err(DapError::WaitResponse) => {
                    if self.wait_backoff(deadline).is_err() {
                        tracing::error!("Posted write never drained; transport is dead");
                        return Err(ArmError::Protocol(DapError::WaitResponse));
                    }
                }
                Err(DapError::FaultResponse) => {
                    self.clear_sticky_fault(port, address)?;
                    return Err(ArmError::Fault);
                }
                Err(error) => {
                    protocol_retries += 1;
                    if protocol_retries > 2 || !self.try_line_recovery() {
                        tracing::error!("Unrecoverable {error} on the wire");
                        return Err(ArmError::Protocol(error));
                    }
                }
            }
        }
    }

    fn wait_backoff(&mut self, deadline: Instant) -> Result<(), ArmError> {
        if Instant::now() >= deadline {
            tracing::warn!("Transfer kept WAITing for the full retry budget");
            return Err(ArmError::WaitTimeout);
        }
        // Give the target a little more time before the retry hits it.
        self.probe.idle_cycles(8);
        Ok(())
    }

    /// After a FAULT: look at CTRL/STAT to learn what happened, then clear
    /// the sticky flags so the next transaction can proceed.
    ///
    /// DPBANKSEL is 0 whenever an AP transfer is in flight, so CTRL/STAT is
    /// directly addressable here.
    fn clear_sticky_fault(&mut self, port: PortType, address: u8) -> Result<(), ArmError> {
        if port == PortType::DebugPort && address == Ctrl::ADDRESS {
            tracing::warn!("FAULT while reading CTRL/STAT itself");
            return Ok(());
        }

        let ctrl = Ctrl(
            self.probe
                .raw_read_register(PortType::DebugPort, Ctrl::ADDRESS)
                .map_err(ArmError::Protocol)?,
        );
        tracing::warn!(
            "Transfer faulted; CTRL/STAT: sticky_err={} sticky_orun={} wdataerr={}",
            ctrl.sticky_err(),
            ctrl.sticky_orun(),
            ctrl.w_data_err()
        );

        let mut abort = Abort::default();
        abort.set_stkerrclr(ctrl.sticky_err());
        abort.set_orunerrclr(ctrl.sticky_orun());
        abort.set_wderrclr(ctrl.w_data_err());
        abort.set_stkcmpclr(ctrl.sticky_cmp());
        self.probe
            .raw_write_register(PortType::DebugPort, Abort::ADDRESS, abort.into())
            .map_err(ArmError::Protocol)?;

        Ok(())
    }

    /// Attempt to revive a wedged wire with a line reset. Returns whether
    /// the DP answers again.
    fn try_line_recovery(&mut self) -> bool {
        tracing::debug!("Attempting line reset recovery");
        self.probe.line_reset();
        // SELECT content is architecturally cleared by a line reset.
        if let SelectCache::V1(ref mut s) = self.select {
            *s = SelectV1(0);
        }

        match self.probe.raw_read_register(PortType::DebugPort, DPIDR::ADDRESS) {
            Ok(_) => {
                // The reset may have set STICKYORUN.
                let mut abort = Abort::default();
                abort.set_orunerrclr(true);
                self.probe
                    .raw_write_register(PortType::DebugPort, Abort::ADDRESS, abort.into())
                    .is_ok()
            }
            Err(error) => {
                tracing::debug!("DP does not answer after line reset: {error}");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// A scripted DAP: maps register addresses to values and can be told to
    /// fail the next transfers.
    struct ScriptedDap {
        dp_regs: [u32; 16],
        ap_regs: [u32; 64],
        select: u32,
        failures: VecDeque<DapError>,
        always_fail: Option<DapError>,
    }

    impl ScriptedDap {
        fn new() -> Self {
            Self {
                dp_regs: [0; 16],
                ap_regs: [0; 64],
                select: 0,
                failures: VecDeque::new(),
                always_fail: None,
            }
        }

        fn next_failure(&mut self) -> Option<DapError> {
            self.failures.pop_front().or(self.always_fail)
        }

        fn ap_index(&self, address: u8) -> usize {
            let bank = (self.select >> 4) & 0xF;
            ((bank as usize) << 2) | usize::from(address >> 2)
        }
    }

    impl RawDapAccess for ScriptedDap {
        fn raw_read_register(&mut self, port: PortType, address: u8) -> Result<u32, DapError> {
            if let Some(err) = self.next_failure() {
                return Err(err);
            }
            match port {
                PortType::DebugPort => Ok(self.dp_regs[usize::from(address >> 2)]),
                PortType::AccessPort => Ok(self.ap_regs[self.ap_index(address)]),
            }
        }

        fn raw_write_register(
            &mut self,
            port: PortType,
            address: u8,
            value: u32,
        ) -> Result<(), DapError> {
            if let Some(err) = self.next_failure() {
                return Err(err);
            }
            match port {
                PortType::DebugPort => {
                    if address == 0x8 {
                        self.select = value;
                    } else if address != 0x0 {
                        self.dp_regs[usize::from(address >> 2)] = value;
                    }
                }
                PortType::AccessPort => {
                    let index = self.ap_index(address);
                    self.ap_regs[index] = value;
                }
            }
            Ok(())
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

    fn interface_with(dap: ScriptedDap) -> ArmCommunicationInterface {
        ArmCommunicationInterface::new(Box::new(dap))
    }

    #[test]
    fn wait_responses_are_retried() {
        let mut dap = ScriptedDap::new();
        dap.dp_regs[1] = 0xF000_0040;
        dap.failures.push_back(DapError::WaitResponse);
        dap.failures.push_back(DapError::WaitResponse);

        let mut iface = interface_with(dap);
        let ctrl: Ctrl = iface.read_dp_register().unwrap();
        assert_eq!(u32::from(ctrl), 0xF000_0040);
    }

    #[test]
    fn fault_is_cleaned_up_and_reported() {
        let mut dap = ScriptedDap::new();
        // STICKYERR visible in CTRL/STAT when the engine investigates.
        dap.dp_regs[1] = 1 << 5;
        dap.failures.push_back(DapError::FaultResponse);

        let mut iface = interface_with(dap);
        let result = iface.read_with_retry(PortType::AccessPort, 0xC);
        assert!(matches!(result, Err(ArmError::Fault)));
    }

    #[test]
    fn select_cache_tracks_ap_and_bank() {
        let mut iface = interface_with(ScriptedDap::new());
        iface.select = SelectCache::V1(SelectV1(0));

        // Two reads from the same AP bank: only one SELECT write.
        iface.select_ap_bank(ApAddress::V1(0), 0xFC).unwrap();
        iface.select_ap_bank(ApAddress::V1(0), 0xF8).unwrap();

        // Changing the AP forces a new SELECT.
        iface.select_ap_bank(ApAddress::V1(1), 0xFC).unwrap();

        let SelectCache::V1(select) = iface.select else {
            panic!("expected a v1 select cache");
        };
        assert_eq!(select.ap_sel(), 1);
        assert_eq!(select.ap_bank_sel(), 0xF);
    }

    #[test]
    fn protocol_error_attempts_line_reset() {
        let mut dap = ScriptedDap::new();
        dap.dp_regs[0] = 0x1BA0_1477;
        dap.failures.push_back(DapError::NoAcknowledge);

        let mut iface = interface_with(dap);
        // Recovery reads DPIDR fine, retry succeeds.
        let value = iface.read_with_retry(PortType::DebugPort, 0x0).unwrap();
        assert_eq!(value, 0x1BA0_1477);
    }

    #[test]
    fn posted_write_wait_past_deadline_is_fatal() {
        let mut dap = ScriptedDap::new();
        dap.always_fail = Some(DapError::WaitResponse);

        let mut iface = interface_with(dap);
        let result = iface.write_with_retry(PortType::AccessPort, 0xC, 0xDEAD_BEEF);
        assert!(matches!(
            result,
            Err(ArmError::Protocol(DapError::WaitResponse))
        ));
    }
}
