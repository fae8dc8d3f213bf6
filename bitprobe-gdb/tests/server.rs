//! End-to-end protocol tests: a GDB client speaking packets into the
//! server, with the whole target stack running against the simulated wire
//! backend.

use std::time::Duration;

use bitprobe::probe::fake::FakeDapAccess;
use bitprobe::Session;
use bitprobe_gdb::connection::LoopbackConnection;
use bitprobe_gdb::packet::{frame, PacketReader, ReaderEvent};
use bitprobe_gdb::server::GdbServer;

const POLL: Duration = Duration::from_millis(1);

fn server() -> GdbServer<LoopbackConnection> {
    let session = Session::attach_arm(Box::new(FakeDapAccess::new())).unwrap();
    GdbServer::new(session, LoopbackConnection::new())
}

/// Drive the server until it consumed all queued input, then collect the
/// packets it emitted.
fn drain(server: &mut GdbServer<LoopbackConnection>) -> Vec<Vec<u8>> {
    while !server.connection_mut().input.is_empty() {
        server.poll(POLL).unwrap();
    }

    let output = std::mem::take(&mut server.connection_mut().output);

    let mut reader = PacketReader::new();
    let mut packets = Vec::new();
    for byte in output {
        if let Some(ReaderEvent::Packet {
            payload,
            checksum_ok,
        }) = reader.feed(byte)
        {
            // Everything the server emits must satisfy the checksum law.
            assert!(checksum_ok, "server sent a packet with a bad checksum");
            packets.push(payload);
        }
    }
    packets
}

fn exchange(server: &mut GdbServer<LoopbackConnection>, payload: &[u8]) -> Vec<Vec<u8>> {
    server.connection_mut().push_input(&frame(payload));
    drain(server)
}

/// The last (non-console) reply to a command.
fn reply(server: &mut GdbServer<LoopbackConnection>, payload: &[u8]) -> Vec<u8> {
    exchange(server, payload).pop().expect("no reply packet")
}

#[test]
fn supported_features_handshake() {
    let mut server = server();
    let reply = reply(&mut server, b"qSupported:multiprocess+;swbreak+");
    let reply = String::from_utf8(reply).unwrap();

    assert!(reply.contains("PacketSize=1000"));
    assert!(reply.contains("qXfer:memory-map:read+"));
    assert!(reply.contains("qXfer:features:read+"));
    assert!(reply.contains("QStartNoAckMode+"));
    assert!(reply.contains("vContSupported+"));
}

#[test]
fn no_ack_mode_stops_the_acks() {
    let mut server = server();
    assert_eq!(reply(&mut server, b"QStartNoAckMode"), b"OK".to_vec());

    server.connection_mut().push_input(&frame(b"?"));
    while !server.connection_mut().input.is_empty() {
        server.poll(POLL).unwrap();
    }
    let output = std::mem::take(&mut server.connection_mut().output);
    assert!(!output.contains(&b'+'), "ack seen in noack mode");
}

#[test]
fn halt_reason_after_attach() {
    let mut server = server();
    assert_eq!(reply(&mut server, b"?"), b"T05thread:1;".to_vec());
}

#[test]
fn register_file_roundtrip() {
    let mut server = server();

    let blob = reply(&mut server, b"g");
    // 23 registers, 8 hex digits each.
    assert_eq!(blob.len(), 23 * 8);

    // Write r0 and read it back through the single-register packets.
    assert_eq!(reply(&mut server, b"P0=efbeadde"), b"OK".to_vec());
    assert_eq!(reply(&mut server, b"p0"), b"efbeadde".to_vec());

    // The pc (register 15) of the fake halts at its reset vector.
    assert_eq!(reply(&mut server, b"p0f"), b"00010008".to_vec());
}

#[test]
fn memory_map_contains_the_f103_geometry() {
    let mut server = server();
    let xml = reply(&mut server, b"qXfer:memory-map:read::0,fff");
    let xml = String::from_utf8(xml).unwrap();

    assert!(xml.starts_with('l') || xml.starts_with('m'));
    assert!(xml.contains(r#"<memory type="ram" start="0x20000000" length="0x5000"/>"#));
    assert!(xml.contains(r#"<memory type="flash" start="0x8000000" length="0x10000">"#));
    assert!(xml.contains(r#"<property name="blocksize">0x400</property>"#));
}

#[test]
fn target_xml_advertises_the_m_profile() {
    let mut server = server();
    let xml = reply(&mut server, b"qXfer:features:read:target.xml:0,1000");
    let xml = String::from_utf8(xml).unwrap();

    assert!(xml.contains("org.gnu.gdb.arm.m-profile"));
    assert!(xml.contains(r#"<reg name="xpsr" bitsize="32"/>"#));
}

#[test]
fn hardware_breakpoint_programs_and_clears_the_comparator() {
    let mut server = server();

    assert_eq!(reply(&mut server, b"Z1,8000404,2"), b"OK".to_vec());
    // FPB comparator 0, rev.1 encoding for the lower halfword.
    assert_eq!(reply(&mut server, b"me0002008,4"), b"05040048".to_vec());

    assert_eq!(reply(&mut server, b"z1,8000404,2"), b"OK".to_vec());
    assert_eq!(reply(&mut server, b"me0002008,4"), b"00000000".to_vec());
}

#[test]
fn breakpoint_units_exhaust_with_e28() {
    let mut server = server();

    // The fake advertises six FPB comparators.
    for index in 0..6u32 {
        let packet = format!("Z1,{:x},2", 0x0800_0100 + index * 4);
        assert_eq!(reply(&mut server, packet.as_bytes()), b"OK".to_vec());
    }
    assert_eq!(reply(&mut server, b"Z1,8000200,2"), b"E28".to_vec());
}

#[test]
fn memory_write_and_read_back() {
    let mut server = server();

    assert_eq!(
        reply(&mut server, b"M20000000,4:deadbeef"),
        b"OK".to_vec()
    );
    assert_eq!(reply(&mut server, b"m20000000,4"), b"deadbeef".to_vec());

    // Binary write with bytes that need escaping.
    let mut packet = b"X20000010,4:".to_vec();
    packet.extend_from_slice(&[0x23, 0x24, 0x7D, 0x2A]);
    assert_eq!(reply(&mut server, &packet), b"OK".to_vec());
    assert_eq!(reply(&mut server, b"m20000010,4"), b"23247d2a".to_vec());
}

#[test]
fn flash_program_cycle() {
    let mut server = server();

    assert_eq!(reply(&mut server, b"vFlashErase:08000000,400"), b"OK".to_vec());

    let mut write = b"vFlashWrite:08000000:".to_vec();
    write.extend_from_slice(&[0xAA; 0x400]);
    assert_eq!(reply(&mut server, &write), b"OK".to_vec());

    assert_eq!(reply(&mut server, b"vFlashDone"), b"OK".to_vec());

    // Scenario: the programmed sector reads back through plain memory
    // reads.
    assert_eq!(
        reply(&mut server, b"m08000000,10"),
        b"aa".repeat(16).to_vec()
    );
}

#[test]
fn interrupt_during_continue_yields_exactly_one_stop_reply() {
    let mut server = server();

    // Queue the continue and the interrupt byte behind it; the wait loop
    // must pick the 0x03 up, halt the target and emit a single T02.
    server.connection_mut().push_input(&frame(b"vCont;c"));
    server.connection_mut().push_input(&[0x03]);

    let packets = drain(&mut server);
    let stops: Vec<_> = packets
        .iter()
        .filter(|p| p.starts_with(b"T02"))
        .collect();
    assert_eq!(stops.len(), 1);
    assert_eq!(stops[0], &b"T02thread:1;".to_vec());

    // The target is halted and the register file is readable again.
    let blob = reply(&mut server, b"g");
    assert_eq!(blob.len(), 23 * 8);
}

#[test]
fn step_replies_with_sigtrap_and_advances_pc() {
    let mut server = server();

    let before = reply(&mut server, b"p0f");
    assert_eq!(reply(&mut server, b"vCont;s"), b"T05thread:1;".to_vec());
    let after = reply(&mut server, b"p0f");
    assert_ne!(before, after);
}

#[test]
fn crc_matches_local_computation() {
    let mut server = server();

    assert_eq!(
        reply(&mut server, b"M20000000,4:01020304"),
        b"OK".to_vec()
    );

    let answer = reply(&mut server, b"qCRC:20000000,4");
    assert_eq!(answer[0], b'C');
    assert_eq!(answer.len(), 9);

    use crcxx::crc32::{catalog::CRC_32_MPEG_2, Crc, LookupTable256};
    const CRC: Crc<LookupTable256> = Crc::<LookupTable256>::new(&CRC_32_MPEG_2);
    let expected = format!("C{:08x}", CRC.compute(&[1, 2, 3, 4]));
    assert_eq!(answer, expected.as_bytes());
}

#[test]
fn corrupt_packet_gets_a_nak() {
    let mut server = server();

    server.connection_mut().push_input(b"$qSupported#00");
    while !server.connection_mut().input.is_empty() {
        server.poll(POLL).unwrap();
    }
    let output = std::mem::take(&mut server.connection_mut().output);
    assert_eq!(output, b"-".to_vec());
}

#[test]
fn unknown_packets_get_the_empty_reply() {
    let mut server = server();
    assert_eq!(reply(&mut server, b"vMustReplyEmpty"), Vec::<u8>::new());
    assert_eq!(reply(&mut server, b"qHostInfo"), Vec::<u8>::new());
}

#[test]
fn monitor_targets_lists_the_discovered_part() {
    let mut server = server();

    // 'monitor targets' = qRcmd with the hex encoding of the command.
    let packets = exchange(&mut server, b"qRcmd,74617267657473");
    assert!(packets.len() >= 2);

    // Console output arrives as hex-encoded O packets before the OK.
    let console = packets
        .iter()
        .filter(|p| p.first() == Some(&b'O') && p.len() > 1)
        .map(|p| {
            String::from_utf8(hex::decode(&p[1..]).unwrap()).unwrap()
        })
        .collect::<String>();
    assert!(console.contains("STM32F103"));
    assert_eq!(packets.last().unwrap(), &b"OK".to_vec());
}

#[test]
fn detach_clears_breakpoints_and_resumes() {
    let mut server = server();

    assert_eq!(reply(&mut server, b"Z1,8000404,2"), b"OK".to_vec());
    assert_eq!(reply(&mut server, b"D"), b"OK".to_vec());

    let mut session = server.into_session();
    let mut core = session.core(bitprobe::TargetId(0)).unwrap();
    use bitprobe::CoreInterface;

    // Comparator cleared and the core running again.
    let mut word = [0u8; 4];
    core.read_memory(0xE000_2008, &mut word).unwrap();
    assert_eq!(u32::from_le_bytes(word), 0);
    assert_eq!(core.status().unwrap(), bitprobe::CoreStatus::Running);
}
