//! The RSP command dispatcher and run loop.

use std::io;
use std::time::Duration;

use bitprobe::architecture::arm::ArmError;
use bitprobe::core::{CoreInterface, HALT_POLL_TIMEOUT};
use bitprobe::flashing::FlashError;
use bitprobe::{Breakwatch, BreakwatchKind, CoreStatus, Error, RegisterId, Session, TargetId};

use crate::connection::Connection;
use crate::packet::{frame, PacketReader, ReaderEvent, INTERRUPT_BYTE};
use crate::parser::{parse_packet, Action, Packet, QueryPacket, VPacket};
use crate::{desc, monitor};

/// Cadence of the target halt poll inside the run loop. Also bounds the
/// interrupt latency, which must stay below 20 ms.
const HALT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// The packet size advertised in `qSupported`.
const MAX_PACKET_SIZE: usize = 0x1000;

/// A fatal server error; everything protocol-level is handled in-band.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// The connection died.
    #[error("The connection to the host failed")]
    Io(#[from] io::Error),
}

/// What a handled packet asks the serve loop to do.
enum Disposition {
    /// Send this reply.
    Reply(Vec<u8>),
    /// Send nothing (e.g. after `R`).
    NoReply,
    /// Tear the session down.
    Exit,
}

/// The GDB remote serial protocol server for one session.
pub struct GdbServer<C: Connection> {
    session: Session,
    connection: C,
    reader: PacketReader,
    no_ack: bool,
    extended: bool,
    attached: Option<TargetId>,
    /// Active breakpoints and watchpoints, so removal finds the driver
    /// state stashed at insertion.
    breakwatches: Vec<Breakwatch>,
    /// The last framed reply, for `-` retransmission.
    last_reply: Vec<u8>,
    /// Signal number of the last stop, reported by `?`.
    last_signal: u8,
}

impl<C: Connection> GdbServer<C> {
    /// Wrap a session. GDB expects the target halted once it attaches, so
    /// the first target is halted here.
    pub fn new(session: Session, connection: C) -> Self {
        let mut server = Self {
            session,
            connection,
            reader: PacketReader::new(),
            no_ack: false,
            extended: false,
            attached: None,
            breakwatches: Vec::new(),
            last_reply: Vec::new(),
            last_signal: 5,
        };

        if !server.session.targets().is_empty() {
            let id = TargetId(0);
            if let Ok(mut core) = server.session.core(id) {
                if let Err(error) = core.halt(HALT_POLL_TIMEOUT) {
                    tracing::warn!("Could not halt the target on attach: {error}");
                }
            }
            server.attached = Some(id);
        }
        server
    }

    /// Hand the session back, e.g. after the client disconnected.
    pub fn into_session(self) -> Session {
        self.session
    }

    /// The underlying connection.
    pub fn connection_mut(&mut self) -> &mut C {
        &mut self.connection
    }

    /// Serve until the client kills the session or the connection dies.
    pub fn serve(&mut self) -> Result<(), ServerError> {
        loop {
            if self.poll(Duration::from_millis(100))? {
                return Ok(());
            }
        }
    }

    /// Process at most one event. Returns `true` when the server should
    /// shut down.
    pub fn poll(&mut self, timeout: Duration) -> Result<bool, ServerError> {
        let Some(byte) = self.connection.read_byte(timeout)? else {
            return Ok(false);
        };

        let Some(event) = self.reader.feed(byte) else {
            return Ok(false);
        };

        match event {
            ReaderEvent::Packet {
                payload,
                checksum_ok,
            } => {
                if !checksum_ok {
                    if self.no_ack {
                        // There is no retransmission without acks; report
                        // the corruption in-band.
                        self.send_reply(b"E00")?;
                    } else {
                        self.connection.write_all(b"-")?;
                        self.connection.flush()?;
                    }
                    return Ok(false);
                }

                if !self.no_ack {
                    self.connection.write_all(b"+")?;
                }

                let packet = parse_packet(&payload);
                tracing::debug!("Handling packet: {packet:?}");
                match self.dispatch(packet)? {
                    Disposition::Reply(reply) => {
                        self.send_reply(&reply)?;
                        Ok(false)
                    }
                    Disposition::NoReply => Ok(false),
                    Disposition::Exit => Ok(true),
                }
            }
            // A stray interrupt outside the run loop is ignored.
            ReaderEvent::Interrupt => Ok(false),
            ReaderEvent::Ack => Ok(false),
            ReaderEvent::Nak => {
                let reply = self.last_reply.clone();
                self.connection.write_all(&reply)?;
                self.connection.flush()?;
                Ok(false)
            }
        }
    }

    fn send_reply(&mut self, payload: &[u8]) -> Result<(), ServerError> {
        let framed = frame(payload);
        self.connection.write_all(&framed)?;
        self.connection.flush()?;
        self.last_reply = framed;
        Ok(())
    }

    fn dispatch(&mut self, packet: Packet) -> Result<Disposition, ServerError> {
        let reply = match packet {
            Packet::EnableExtendedMode => {
                self.extended = true;
                b"OK".to_vec()
            }
            Packet::HaltReason => self.stop_reply(self.last_signal),
            Packet::StartNoAckMode => {
                // The OK still travels in ack mode; acks stop afterwards.
                self.send_reply(b"OK")?;
                self.no_ack = true;
                return Ok(Disposition::NoReply);
            }
            Packet::SelectThread => b"OK".to_vec(),

            Packet::ReadGeneralRegisters => self.read_all_registers(),
            Packet::WriteGeneralRegisters(values) => self.write_all_registers(&values),
            Packet::ReadRegister(id) => self.read_one_register(id),
            Packet::WriteRegister { id, value } => self.write_one_register(id, value),

            Packet::ReadMemory { address, length } => self.read_memory(address, length),
            Packet::WriteMemory { address, data } => self.write_memory(address, &data),
            Packet::WriteMemoryBinary { address, data } => self.write_memory(address, &data),

            Packet::Continue(address) => {
                return self.resume_at(false, address).map(Disposition::Reply);
            }
            Packet::Step(address) => {
                return self.resume_at(true, address).map(Disposition::Reply);
            }

            Packet::InsertBreakpoint {
                kind,
                address,
                size,
            } => self.insert_breakwatch(kind, address, size),
            Packet::RemoveBreakpoint {
                kind,
                address,
                size,
            } => self.remove_breakwatch(kind, address, size),

            Packet::Query(query) => self.handle_query(query)?,
            Packet::V(v) => return self.handle_v(v),

            Packet::Detach => {
                self.detach();
                self.send_reply(b"OK")?;
                if self.extended {
                    return Ok(Disposition::NoReply);
                }
                return Ok(Disposition::Exit);
            }
            Packet::Kill => {
                self.detach();
                return Ok(Disposition::Exit);
            }
            Packet::Restart => {
                // Extended-remote restart gets no reply.
                self.restart_target();
                return Ok(Disposition::NoReply);
            }

            Packet::Unknown(payload) => {
                tracing::debug!(
                    "Unsupported packet: {:?}",
                    String::from_utf8_lossy(&payload)
                );
                Vec::new()
            }
        };

        Ok(Disposition::Reply(reply))
    }

    fn handle_query(&mut self, query: QueryPacket) -> Result<Vec<u8>, ServerError> {
        Ok(match query {
            QueryPacket::Supported(_) => format!(
                "PacketSize={MAX_PACKET_SIZE:x};qXfer:memory-map:read+;qXfer:features:read+;QStartNoAckMode+;vContSupported+;swbreak+;hwbreak+"
            )
            .into_bytes(),
            QueryPacket::ThreadId => b"QC1".to_vec(),
            QueryPacket::Attached(_) => b"1".to_vec(),
            QueryPacket::FirstThreadInfo => b"m1".to_vec(),
            QueryPacket::SubsequentThreadInfo => b"l".to_vec(),
            QueryPacket::Command(command) => {
                return self.handle_monitor(&command);
            }
            QueryPacket::Crc { address, length } => self.crc(address, length),
            QueryPacket::TransferRead {
                object,
                annex,
                offset,
                length,
            } => self.handle_xfer(&object, &annex, offset, length),
            QueryPacket::Unknown(_) => Vec::new(),
        })
    }

    fn handle_xfer(&mut self, object: &[u8], annex: &[u8], offset: u32, length: u32) -> Vec<u8> {
        match object {
            b"memory-map" => {
                let Some(id) = self.attached else {
                    return b"E01".to_vec();
                };
                let document =
                    desc::memory_map_xml(&self.session.targets()[id.0].memory_map);
                desc::xfer_window(document.as_bytes(), offset, length)
            }
            b"features" if annex == b"target.xml" => {
                let Some(id) = self.attached else {
                    return b"E01".to_vec();
                };
                let Ok(core) = self.session.core(id) else {
                    return b"E01".to_vec();
                };
                let document = desc::target_xml(core.kind(), core.registers());
                desc::xfer_window(document.as_bytes(), offset, length)
            }
            _ => Vec::new(),
        }
    }

    fn handle_monitor(&mut self, command: &[u8]) -> Result<Vec<u8>, ServerError> {
        let command = String::from_utf8_lossy(command).to_string();
        let outcome = monitor::execute(&mut self.session, &command);

        for line in &outcome.console {
            let mut packet = Vec::with_capacity(line.len() * 2 + 1);
            packet.push(b'O');
            packet.extend_from_slice(hex::encode(format!("{line}\n")).as_bytes());
            self.send_reply(&packet)?;
        }

        Ok(match outcome.result {
            Ok(()) => b"OK".to_vec(),
            Err(code) => code.into_bytes(),
        })
    }

    fn handle_v(&mut self, packet: VPacket) -> Result<Disposition, ServerError> {
        let reply = match packet {
            VPacket::QueryContSupport => b"vCont;c;C;s;S;t".to_vec(),
            VPacket::Continue(Action::Continue | Action::ContinueSignal(_)) => {
                return self.resume(false).map(Disposition::Reply);
            }
            VPacket::Continue(Action::Step | Action::StepSignal(_)) => {
                return self.resume(true).map(Disposition::Reply);
            }
            VPacket::Continue(Action::Stop) => {
                let reply = self.with_core(|core| core.halt(HALT_POLL_TIMEOUT).map(|_| ()));
                if reply == b"OK" {
                    self.last_signal = 2;
                    self.stop_reply(2)
                } else {
                    reply
                }
            }
            VPacket::Attach(_) => {
                if self.session.targets().is_empty() {
                    b"E01".to_vec()
                } else {
                    self.attached = Some(TargetId(0));
                    let _ = self.with_core(|core| core.halt(HALT_POLL_TIMEOUT).map(|_| ()));
                    self.last_signal = 5;
                    self.stop_reply(5)
                }
            }
            VPacket::Run => {
                self.restart_target();
                self.last_signal = 5;
                self.stop_reply(5)
            }
            VPacket::FlashErase { address, length } => {
                self.flash_result(|server, id| {
                    server.session.flash_erase(id, address, length)
                })
            }
            VPacket::FlashWrite { address, data } => self.flash_result(|server, id| {
                server.session.flash_write(id, address, &data)
            }),
            VPacket::FlashDone => {
                self.flash_result(|server, id| server.session.flash_done(id))
            }
            VPacket::Unknown(payload) => {
                tracing::debug!(
                    "Unsupported v packet: {:?}",
                    String::from_utf8_lossy(&payload)
                );
                Vec::new()
            }
        };
        Ok(Disposition::Reply(reply))
    }

    fn flash_result(
        &mut self,
        operation: impl FnOnce(&mut Self, TargetId) -> Result<(), Error>,
    ) -> Vec<u8> {
        let Some(id) = self.attached else {
            return b"E01".to_vec();
        };
        match operation(self, id) {
            Ok(()) => b"OK".to_vec(),
            Err(error) => self.error_reply(error),
        }
    }

    /// Run an operation against the attached core, turning errors into
    /// protocol replies and `Ok` into `OK`.
    fn with_core(
        &mut self,
        operation: impl FnOnce(&mut dyn CoreInterface) -> Result<(), Error>,
    ) -> Vec<u8> {
        let Some(id) = self.attached else {
            return b"E01".to_vec();
        };
        let result = match self.session.core(id) {
            Ok(mut core) => operation(&mut core),
            Err(error) => Err(error),
        };
        match result {
            Ok(()) => b"OK".to_vec(),
            Err(error) => self.error_reply(error),
        }
    }

    fn read_all_registers(&mut self) -> Vec<u8> {
        let Some(id) = self.attached else {
            return b"E01".to_vec();
        };
        let mut core = match self.session.core(id) {
            Ok(core) => core,
            Err(error) => return self.error_reply(error),
        };

        let mut blob = String::new();
        for register in core.registers() {
            match core.read_core_reg(register.id) {
                Ok(value) => blob.push_str(&hex::encode(value.to_le_bytes())),
                Err(error) => {
                    drop(core);
                    return self.error_reply(error);
                }
            }
        }
        blob.into_bytes()
    }

    fn write_all_registers(&mut self, values: &[u32]) -> Vec<u8> {
        let Some(id) = self.attached else {
            return b"E01".to_vec();
        };
        let mut core = match self.session.core(id) {
            Ok(core) => core,
            Err(error) => return self.error_reply(error),
        };

        let ids: Vec<RegisterId> = core.registers().iter().map(|r| r.id).collect();
        for (id, value) in ids.into_iter().zip(values) {
            if let Err(error) = core.write_core_reg(id, *value) {
                drop(core);
                return self.error_reply(error);
            }
        }
        b"OK".to_vec()
    }

    fn read_one_register(&mut self, id: u16) -> Vec<u8> {
        let Some(target) = self.attached else {
            return b"E01".to_vec();
        };
        let result = self
            .session
            .core(target)
            .and_then(|mut core| core.read_core_reg(RegisterId(id)));
        match result {
            Ok(value) => hex::encode(value.to_le_bytes()).into_bytes(),
            Err(error) => self.error_reply(error),
        }
    }

    fn write_one_register(&mut self, id: u16, value: u32) -> Vec<u8> {
        self.with_core(|core| core.write_core_reg(RegisterId(id), value))
    }

    fn read_memory(&mut self, address: u64, length: u32) -> Vec<u8> {
        let Some(id) = self.attached else {
            return b"E01".to_vec();
        };
        let mut data = vec![0u8; (length as usize).min(MAX_PACKET_SIZE / 2)];
        let result = self
            .session
            .core(id)
            .and_then(|mut core| core.read_memory(address, &mut data));
        match result {
            Ok(()) => hex::encode(&data).into_bytes(),
            Err(error) => self.error_reply(error),
        }
    }

    fn write_memory(&mut self, address: u64, data: &[u8]) -> Vec<u8> {
        self.with_core(|core| core.write_memory(address, data))
    }

    fn breakwatch_kind(kind: u8) -> Option<BreakwatchKind> {
        match kind {
            0 => Some(BreakwatchKind::SoftwareBreak),
            1 => Some(BreakwatchKind::HardwareBreak),
            2 => Some(BreakwatchKind::WriteWatch),
            3 => Some(BreakwatchKind::ReadWatch),
            4 => Some(BreakwatchKind::AccessWatch),
            _ => None,
        }
    }

    fn insert_breakwatch(&mut self, kind: u8, address: u64, size: u32) -> Vec<u8> {
        let Some(kind) = Self::breakwatch_kind(kind) else {
            return Vec::new();
        };
        let Some(id) = self.attached else {
            return b"E01".to_vec();
        };

        let mut breakwatch = Breakwatch::new(kind, address, u64::from(size));
        let result = self
            .session
            .core(id)
            .and_then(|mut core| core.set_breakwatch(&mut breakwatch));
        match result {
            Ok(()) => {
                self.breakwatches.push(breakwatch);
                b"OK".to_vec()
            }
            Err(error) => self.error_reply(error),
        }
    }

    fn remove_breakwatch(&mut self, kind: u8, address: u64, _size: u32) -> Vec<u8> {
        let Some(kind) = Self::breakwatch_kind(kind) else {
            return Vec::new();
        };
        let Some(id) = self.attached else {
            return b"E01".to_vec();
        };

        let Some(index) = self
            .breakwatches
            .iter()
            .position(|bw| bw.kind == kind && bw.address == address)
        else {
            return b"E02".to_vec();
        };

        let breakwatch = self.breakwatches.remove(index);
        let result = self
            .session
            .core(id)
            .and_then(|mut core| core.clear_breakwatch(&breakwatch));
        match result {
            Ok(()) => b"OK".to_vec(),
            Err(error) => self.error_reply(error),
        }
    }

    /// Resume at a different address: the legacy `c addr`/`s addr` forms
    /// move the program counter first.
    fn resume_at(&mut self, step: bool, address: Option<u64>) -> Result<Vec<u8>, ServerError> {
        if let Some(address) = address {
            let Some(id) = self.attached else {
                return Ok(b"E01".to_vec());
            };
            let result = self.session.core(id).and_then(|mut core| {
                let pc = core
                    .registers()
                    .iter()
                    .find(|reg| reg.name == "pc")
                    .map(|reg| reg.id)
                    .ok_or(Error::Unsupported("core without a program counter"))?;
                core.write_core_reg(pc, address as u32)
            });
            if let Err(error) = result {
                return Ok(self.error_reply(error));
            }
        }
        self.resume(step)
    }

    /// Resume the target and wait for it to stop again, servicing the
    /// interrupt byte in the meantime. The only in-band cancellation is a
    /// 0x03 on the input stream; it halts the target and yields exactly one
    /// `T02` reply.
    fn resume(&mut self, step: bool) -> Result<Vec<u8>, ServerError> {
        let Some(id) = self.attached else {
            return Ok(b"E01".to_vec());
        };

        if step {
            let result = self.session.core(id).and_then(|mut core| core.step());
            return Ok(match result {
                Ok(_) => {
                    self.last_signal = 5;
                    self.stop_reply(5)
                }
                Err(error) => self.error_reply(error),
            });
        }

        if let Err(error) = self.session.core(id).and_then(|mut core| core.run()) {
            return Ok(self.error_reply(error));
        }

        loop {
            // The connection poll doubles as the pacing for the halt poll;
            // both stay within their latency budgets.
            if let Some(byte) = self.connection.read_byte(HALT_POLL_INTERVAL)? {
                if byte == INTERRUPT_BYTE {
                    let result = self
                        .session
                        .core(id)
                        .and_then(|mut core| core.halt(HALT_POLL_TIMEOUT).map(|_| ()));
                    return Ok(match result {
                        Ok(()) => {
                            self.last_signal = 2;
                            self.stop_reply(2)
                        }
                        Err(error) => self.error_reply(error),
                    });
                }
                // While the target runs, nothing else is a valid packet;
                // drop the byte.
                continue;
            }

            let status = self.session.core(id).and_then(|mut core| core.status());
            match status {
                Ok(CoreStatus::Halted(reason)) => {
                    tracing::debug!("Target stopped: {reason:?}");
                    // Breakpoints, watchpoints and steps all surface as
                    // SIGTRAP; only the interrupt above is SIGINT.
                    self.last_signal = 5;
                    return Ok(self.stop_reply(5));
                }
                Ok(_) => continue,
                Err(error) => return Ok(self.error_reply(error)),
            }
        }
    }

    fn stop_reply(&self, signal: u8) -> Vec<u8> {
        format!("T{signal:02x}thread:1;").into_bytes()
    }

    fn crc(&mut self, address: u64, length: u32) -> Vec<u8> {
        use crcxx::crc32::{catalog::CRC_32_MPEG_2, Crc, LookupTable256};

        // GDB's remote CRC: 0x04C11DB7, init all-ones, no reflection.
        const CRC: Crc<LookupTable256> = Crc::<LookupTable256>::new(&CRC_32_MPEG_2);

        let Some(id) = self.attached else {
            return b"E01".to_vec();
        };
        let mut data = vec![0u8; length as usize];
        let result = self
            .session
            .core(id)
            .and_then(|mut core| core.read_memory(address, &mut data));
        match result {
            Ok(()) => format!("C{:08x}", CRC.compute(&data)).into_bytes(),
            Err(error) => self.error_reply(error),
        }
    }

    fn restart_target(&mut self) {
        let Some(id) = self.attached else {
            return;
        };
        let result = self
            .session
            .core(id)
            .and_then(|mut core| core.reset_and_halt(HALT_POLL_TIMEOUT).map(|_| ()));
        if let Err(error) = result {
            tracing::warn!("Restart failed: {error}");
        }
    }

    /// Drop the attachment: clear every breakwatch and let the target run.
    fn detach(&mut self) {
        self.session.flash_abort();

        let Some(id) = self.attached.take() else {
            return;
        };
        if let Ok(mut core) = self.session.core(id) {
            for breakwatch in self.breakwatches.drain(..) {
                if let Err(error) = core.clear_breakwatch(&breakwatch) {
                    tracing::warn!("Could not clear a breakwatch on detach: {error}");
                }
            }
            if let Err(error) = core.run() {
                tracing::warn!("Could not resume the target on detach: {error}");
            }
        }
        self.breakwatches.clear();
    }

    /// Map an error to its protocol reply, tearing the attachment down on
    /// fatal transport errors.
    fn error_reply(&mut self, error: Error) -> Vec<u8> {
        if error.is_fatal() {
            tracing::error!("Fatal transport error: {error}");
            self.session.set_fault(error.to_string());
            self.session.flash_abort();
            self.attached = None;
            self.breakwatches.clear();
            return b"X1D".to_vec();
        }

        let code: &[u8] = match &error {
            Error::NoTarget | Error::TargetNotFound(_) => b"E01",
            Error::Arm(ArmError::WaitTimeout) | Error::Timeout => b"E05",
            Error::Arm(ArmError::Fault) => b"E07",
            Error::Flash(FlashError::Protected { .. }) => b"E06",
            Error::NoHardwareResource => b"E28",
            Error::InvalidRegister(_) => b"E02",
            _ => b"EFF",
        };
        tracing::debug!("Command failed with {error}; replying {:?}", String::from_utf8_lossy(code));
        code.to_vec()
    }
}
