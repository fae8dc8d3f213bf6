//! The probe session: one wire, one debug port, the discovered targets and
//! the flash transaction in flight.

use std::time::Duration;

use crate::architecture::arm::ap::{ApClass, ApInformation};
use crate::architecture::arm::cortex_m::{CortexM, CortexMState};
use crate::architecture::arm::romtable::{Component, PeripheralKind};
use crate::architecture::arm::{ArmCommunicationInterface, RawDapAccess};
use crate::architecture::riscv::dtm::DmiAccess;
use crate::architecture::riscv::{Riscv32, RiscvCommunicationInterface};
use crate::config::MemoryRegion;
use crate::core::{
    Breakwatch, CoreInformation, CoreInterface, CoreKind, CoreRegister, CoreStatus, RegisterId,
};
use crate::flashing::{FlashRegion, FlashTransaction};
use crate::registry::{self, ProbeContext};
use crate::Error;

/// Index of a target in the session's target arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetId(pub usize);

/// One debuggable core and everything the probe knows about it.
pub struct Target {
    /// Driver name from the registry.
    pub name: String,
    /// The core family.
    pub kind: CoreKind,
    /// JEP106 designer code of the part.
    pub designer: u16,
    /// Part number of the part.
    pub part: u16,
    /// The memory map advertised to the debugger.
    pub memory_map: Vec<MemoryRegion>,
    pub(crate) flash: Vec<FlashRegion>,
    pub(crate) ap: Option<ApInformation>,
    pub(crate) cortex_state: CortexMState,
}

impl std::fmt::Debug for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Target")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("designer", &self.designer)
            .field("part", &self.part)
            .finish()
    }
}

enum DebugInterface {
    Arm(ArmCommunicationInterface),
    Riscv(RiscvCommunicationInterface),
}

/// A debug session over one physical connection.
///
/// Owns the transport, the target list and the flash transaction; all
/// global state of the probe lives here so the whole stack can be
/// instantiated against a simulated wire.
pub struct Session {
    interface: DebugInterface,
    targets: Vec<Target>,
    transaction: Option<(usize, FlashTransaction)>,
    /// The last fatal fault, kept for the `morse` monitor command.
    fault: Option<String>,
}

impl Session {
    /// Attach over SWD (or the ADI JTAG transport): connect the debug port,
    /// scan its access ports and probe every core found.
    pub fn attach_arm(probe: Box<dyn RawDapAccess>) -> Result<Session, Error> {
        let mut session = Session {
            interface: DebugInterface::Arm(ArmCommunicationInterface::new(probe)),
            targets: Vec::new(),
            transaction: None,
            fault: None,
        };
        session.rescan()?;
        Ok(session)
    }

    /// Attach to a RISC-V hart behind a debug transport module.
    pub fn attach_riscv(dtm: Box<dyn DmiAccess>) -> Result<Session, Error> {
        let interface = RiscvCommunicationInterface::new(dtm)?;
        let info = registry::generic_rv32();
        Ok(Session {
            interface: DebugInterface::Riscv(interface),
            targets: vec![Target {
                name: info.name,
                kind: info.kind,
                designer: 0,
                part: 0,
                memory_map: info.memory_map,
                flash: info.flash,
                ap: None,
                cortex_state: CortexMState::new(),
            }],
            transaction: None,
            fault: None,
        })
    }

    /// Re-run discovery: reconnect the debug port and rebuild the target
    /// list. Drops any flash transaction.
    pub fn rescan(&mut self) -> Result<(), Error> {
        self.transaction = None;
        self.targets.clear();

        match &mut self.interface {
            DebugInterface::Arm(interface) => {
                let info = interface.connect()?;

                // The designer/part from TARGETID, where the DP has one,
                // wins over ROM table identification.
                let dp_identity = info
                    .target_id
                    .as_ref()
                    .map(|id| (id.tdesigner(), id.tpartno()));

                let aps = interface.access_ports()?;
                let mut targets = Vec::new();

                for ap in aps {
                    if ap.idr.ap_class() != ApClass::MemAp {
                        continue;
                    }
                    let Some(base) = ap.base_address else {
                        continue;
                    };

                    let mut memory = interface.memory_interface(&ap)?;
                    let component = match Component::try_parse(&mut memory, base) {
                        Ok(component) => component,
                        Err(error) => {
                            tracing::warn!("No identifiable component behind {}: {error}", ap.address);
                            continue;
                        }
                    };

                    // Only cores with a system control space are debuggable.
                    if component.find(PeripheralKind::Scs).is_none() {
                        tracing::debug!("No SCS behind {}, skipping", ap.address);
                        continue;
                    }

                    let root = component.id();
                    let rom_identity = root
                        .peripheral_id
                        .jep106
                        .map(|code| (u16::from(code.cc) << 7 | u16::from(code.id), root.peripheral_id.part));
                    let (designer, part) =
                        dp_identity.or(rom_identity).unwrap_or((0, 0));

                    let mut context = ProbeContext {
                        designer,
                        part,
                        memory: &mut memory,
                    };
                    let Some(info) = registry::dispatch(&mut context)? else {
                        continue;
                    };

                    targets.push(Target {
                        name: info.name,
                        kind: info.kind,
                        designer,
                        part,
                        memory_map: info.memory_map,
                        flash: info.flash,
                        ap: Some(ap),
                        cortex_state: CortexMState::new(),
                    });
                }

                self.targets = targets;
            }
            DebugInterface::Riscv(_) => {
                let info = registry::generic_rv32();
                self.targets = vec![Target {
                    name: info.name,
                    kind: info.kind,
                    designer: 0,
                    part: 0,
                    memory_map: info.memory_map,
                    flash: info.flash,
                    ap: None,
                    cortex_state: CortexMState::new(),
                }];
            }
        }

        tracing::info!("Scan found {} target(s)", self.targets.len());
        Ok(())
    }

    /// The discovered targets.
    pub fn targets(&self) -> &[Target] {
        &self.targets
    }

    /// The active wire protocol, for status displays.
    pub fn protocol_name(&self) -> &'static str {
        match &self.interface {
            DebugInterface::Arm(interface) => match interface.protocol() {
                crate::probe::WireProtocol::Swd => "SWD",
                crate::probe::WireProtocol::Jtag => "JTAG",
            },
            DebugInterface::Riscv(_) => "JTAG",
        }
    }

    /// Record a fatal fault for later `morse` retrieval.
    pub fn set_fault(&mut self, message: impl Into<String>) {
        self.fault = Some(message.into());
    }

    /// The last recorded fatal fault.
    pub fn fault(&self) -> Option<&str> {
        self.fault.as_deref()
    }

    /// Set the wire clock. `0` requests the fastest the probe can do.
    pub fn set_frequency(&mut self, hz: u32) {
        // The divider counts delay units per half period; the fastest clock
        // is divider 0.
        let divider = if hz == 0 { 0 } else { 4_000_000 / hz.max(1_000) };
        match &mut self.interface {
            DebugInterface::Arm(interface) => interface.probe_mut().set_divider(divider),
            // The RISC-V DTM owns its own wire; divider control would go
            // through the same JTAG driver on a real build.
            DebugInterface::Riscv(_) => {}
        }
    }

    /// Pulse the hardware reset line, where the platform wires one.
    /// Software reset through the core (SYSRESETREQ, ndmreset) is the
    /// portable path; this is the big hammer for wedged parts.
    pub fn pulse_reset(&mut self) {
        if let DebugInterface::Arm(interface) = &mut self.interface {
            let probe = interface.probe_mut();
            probe.set_nrst(true);
            probe.set_nrst(false);
        }
    }

    /// The core behind a target.
    pub fn core(&mut self, id: TargetId) -> Result<Core<'_>, Error> {
        let Session {
            interface, targets, ..
        } = self;
        let target = targets
            .get_mut(id.0)
            .ok_or(Error::TargetNotFound(id.0))?;

        match interface {
            DebugInterface::Arm(arm) => {
                let ap = target.ap.ok_or(Error::NoTarget)?;
                let memory = arm.memory_interface(&ap)?;
                let core = CortexM::new(memory, &mut target.cortex_state)?;
                Ok(Core::CortexM(core))
            }
            DebugInterface::Riscv(riscv) => Ok(Core::Riscv32(Riscv32::new(riscv))),
        }
    }

    /// Begin (or continue) a flash transaction with an erase.
    pub fn flash_erase(&mut self, id: TargetId, address: u64, length: u64) -> Result<(), Error> {
        self.with_transaction(id, |txn, regions, core| {
            txn.erase(regions, core, address, length)
        })
    }

    /// Stage flash data, programming granules as they fill up.
    pub fn flash_write(&mut self, id: TargetId, address: u64, data: &[u8]) -> Result<(), Error> {
        self.with_transaction(id, |txn, regions, core| {
            txn.write(regions, core, address, data)
        })
    }

    /// Finish the flash transaction: flush tails and close every prepared
    /// region.
    pub fn flash_done(&mut self, id: TargetId) -> Result<(), Error> {
        let Some((txn_target, txn)) = self.transaction.take() else {
            return Ok(());
        };
        if txn_target != id.0 {
            return Err(Error::TargetNotFound(id.0));
        }

        let Session {
            interface, targets, ..
        } = self;
        let target = targets.get_mut(id.0).ok_or(Error::TargetNotFound(id.0))?;
        let (flash, mut core) = make_core(interface, target)?;
        let result = txn.commit(flash, &mut core);
        drop(core);
        Ok(result?)
    }

    /// Discard the flash transaction, still closing prepared regions.
    pub fn flash_abort(&mut self) {
        let Some((txn_target, txn)) = self.transaction.take() else {
            return;
        };

        let Session {
            interface, targets, ..
        } = self;
        let Some(target) = targets.get_mut(txn_target) else {
            return;
        };
        if let Ok((flash, mut core)) = make_core(interface, target) {
            txn.abort(flash, &mut core);
        }
    }

    fn with_transaction(
        &mut self,
        id: TargetId,
        operation: impl FnOnce(
            &mut FlashTransaction,
            &mut [FlashRegion],
            &mut Core<'_>,
        ) -> Result<(), crate::flashing::FlashError>,
    ) -> Result<(), Error> {
        // A transaction for a different target would mean GDB interleaved
        // two flash sequences, which the protocol forbids.
        let mismatched = matches!(&self.transaction, Some((txn_target, _)) if *txn_target != id.0);
        if mismatched {
            self.flash_abort();
        }
        let mut txn = match self.transaction.take() {
            Some((_, txn)) => txn,
            None => FlashTransaction::new(),
        };

        let Session {
            interface, targets, ..
        } = self;
        let target = targets.get_mut(id.0).ok_or(Error::TargetNotFound(id.0))?;
        let (flash, mut core) = make_core(interface, target)?;

        match operation(&mut txn, flash, &mut core) {
            Ok(()) => {
                drop(core);
                self.transaction = Some((id.0, txn));
                Ok(())
            }
            Err(error) => {
                // Sticky failure: close out every prepared region and
                // report. No partial state is hidden from the debugger.
                txn.abort(flash, &mut core);
                drop(core);
                Err(error.into())
            }
        }
    }
}

/// Split a target into its flash regions and a live core, borrowing the
/// interface. Field-level split keeps the borrow checker happy where a
/// method taking `&mut self` twice would not.
fn make_core<'probe>(
    interface: &'probe mut DebugInterface,
    target: &'probe mut Target,
) -> Result<(&'probe mut [FlashRegion], Core<'probe>), Error> {
    let Target {
        flash,
        ap,
        cortex_state,
        ..
    } = target;

    let core = match interface {
        DebugInterface::Arm(arm) => {
            let ap = ap.ok_or(Error::NoTarget)?;
            let memory = arm.memory_interface(&ap)?;
            Core::CortexM(CortexM::new(memory, cortex_state)?)
        }
        DebugInterface::Riscv(riscv) => Core::Riscv32(Riscv32::new(riscv)),
    };
    Ok((flash, core))
}

/// A borrowed core, dispatching to the architecture runtime.
pub enum Core<'probe> {
    /// An ARM Cortex-M core.
    CortexM(CortexM<'probe>),
    /// A RISC-V RV32 hart.
    Riscv32(Riscv32<'probe>),
}

impl CoreInterface for Core<'_> {
    fn status(&mut self) -> Result<CoreStatus, Error> {
        match self {
            Core::CortexM(core) => core.status(),
            Core::Riscv32(core) => core.status(),
        }
    }

    fn halt(&mut self, timeout: Duration) -> Result<CoreInformation, Error> {
        match self {
            Core::CortexM(core) => core.halt(timeout),
            Core::Riscv32(core) => core.halt(timeout),
        }
    }

    fn run(&mut self) -> Result<(), Error> {
        match self {
            Core::CortexM(core) => core.run(),
            Core::Riscv32(core) => core.run(),
        }
    }

    fn step(&mut self) -> Result<CoreInformation, Error> {
        match self {
            Core::CortexM(core) => core.step(),
            Core::Riscv32(core) => core.step(),
        }
    }

    fn reset(&mut self) -> Result<(), Error> {
        match self {
            Core::CortexM(core) => core.reset(),
            Core::Riscv32(core) => core.reset(),
        }
    }

    fn reset_and_halt(&mut self, timeout: Duration) -> Result<CoreInformation, Error> {
        match self {
            Core::CortexM(core) => core.reset_and_halt(timeout),
            Core::Riscv32(core) => core.reset_and_halt(timeout),
        }
    }

    fn read_core_reg(&mut self, id: RegisterId) -> Result<u32, Error> {
        match self {
            Core::CortexM(core) => core.read_core_reg(id),
            Core::Riscv32(core) => core.read_core_reg(id),
        }
    }

    fn write_core_reg(&mut self, id: RegisterId, value: u32) -> Result<(), Error> {
        match self {
            Core::CortexM(core) => core.write_core_reg(id, value),
            Core::Riscv32(core) => core.write_core_reg(id, value),
        }
    }

    fn registers(&self) -> &'static [CoreRegister] {
        match self {
            Core::CortexM(core) => core.registers(),
            Core::Riscv32(core) => core.registers(),
        }
    }

    fn read_memory(&mut self, address: u64, data: &mut [u8]) -> Result<(), Error> {
        match self {
            Core::CortexM(core) => core.read_memory(address, data),
            Core::Riscv32(core) => core.read_memory(address, data),
        }
    }

    fn write_memory(&mut self, address: u64, data: &[u8]) -> Result<(), Error> {
        match self {
            Core::CortexM(core) => core.write_memory(address, data),
            Core::Riscv32(core) => core.write_memory(address, data),
        }
    }

    fn set_breakwatch(&mut self, breakwatch: &mut Breakwatch) -> Result<(), Error> {
        match self {
            Core::CortexM(core) => core.set_breakwatch(breakwatch),
            Core::Riscv32(core) => core.set_breakwatch(breakwatch),
        }
    }

    fn clear_breakwatch(&mut self, breakwatch: &Breakwatch) -> Result<(), Error> {
        match self {
            Core::CortexM(core) => core.clear_breakwatch(breakwatch),
            Core::Riscv32(core) => core.clear_breakwatch(breakwatch),
        }
    }

    fn kind(&self) -> CoreKind {
        match self {
            Core::CortexM(core) => core.kind(),
            Core::Riscv32(core) => core.kind(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{BreakwatchKind, HALT_POLL_TIMEOUT};
    use crate::probe::fake::FakeDapAccess;

    fn session() -> Session {
        Session::attach_arm(Box::new(FakeDapAccess::new())).unwrap()
    }

    #[test]
    fn scan_builds_the_stm32f1_target() {
        let session = session();
        let targets = session.targets();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].name, "STM32F103 (medium density)");
        assert_eq!(targets[0].kind, CoreKind::CortexM);
        assert_eq!(targets[0].memory_map.len(), 2);
    }

    #[test]
    fn halt_and_resume_through_the_session() {
        let mut session = session();
        let mut core = session.core(TargetId(0)).unwrap();

        let info = core.halt(HALT_POLL_TIMEOUT).unwrap();
        assert_eq!(info.pc, 0x0800_0100);
        assert!(core.status().unwrap().is_halted());

        core.run().unwrap();
        assert_eq!(core.status().unwrap(), CoreStatus::Running);
    }

    #[test]
    fn register_roundtrip_through_the_session() {
        let mut session = session();
        let mut core = session.core(TargetId(0)).unwrap();
        core.halt(HALT_POLL_TIMEOUT).unwrap();

        core.write_core_reg(RegisterId(0), 0x1234_5678).unwrap();
        assert_eq!(core.read_core_reg(RegisterId(0)).unwrap(), 0x1234_5678);
    }

    #[test]
    fn breakwatch_state_restores_bit_exact() {
        let mut session = session();
        let mut core = session.core(TargetId(0)).unwrap();
        core.halt(HALT_POLL_TIMEOUT).unwrap();

        let mut read_comparator = |core: &mut Core<'_>| {
            let mut word = [0u8; 4];
            core.read_memory(0xE000_2008, &mut word).unwrap();
            u32::from_le_bytes(word)
        };

        let before = read_comparator(&mut core);
        let mut bw = Breakwatch::new(BreakwatchKind::HardwareBreak, 0x0800_0404, 2);
        core.set_breakwatch(&mut bw).unwrap();
        assert_eq!(read_comparator(&mut core), 0x4800_0405);

        core.clear_breakwatch(&bw).unwrap();
        assert_eq!(read_comparator(&mut core), before);
    }

    #[test]
    fn flash_pipeline_programs_the_fake() {
        let mut session = session();
        session.core(TargetId(0)).unwrap().halt(HALT_POLL_TIMEOUT).unwrap();

        let data = vec![0xAA; 0x400];
        session.flash_erase(TargetId(0), 0x0800_0000, 0x400).unwrap();
        session.flash_write(TargetId(0), 0x0800_0000, &data).unwrap();
        session.flash_done(TargetId(0)).unwrap();

        let mut core = session.core(TargetId(0)).unwrap();
        let mut read_back = [0u8; 16];
        core.read_memory(0x0800_0000, &mut read_back).unwrap();
        assert_eq!(read_back, [0xAA; 16]);
    }

    #[test]
    fn flash_write_outside_region_aborts_transaction() {
        let mut session = session();

        let result = session.flash_write(TargetId(0), 0x1000_0000, &[0; 4]);
        assert!(result.is_err());
        assert!(session.transaction.is_none());
    }
}
