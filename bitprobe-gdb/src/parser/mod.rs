//! Parser for GDB packets.
//!
//! GDB packets have the format `$packet-data#checksum`. This parser is
//! concerned with the packet-data only; framing and checksums live in
//! [`crate::packet`].

pub(crate) mod query;
pub(crate) mod util;
pub(crate) mod v_packet;

use nom::{
    branch::alt,
    bytes::complete::take,
    character::complete::char,
    combinator::{opt, value},
    multi::many0,
    IResult,
};

pub use query::QueryPacket;
pub use v_packet::{Action, VPacket};

use util::{hex_bytes, hex_u32, hex_u32_le, hex_u64};

/// A parsed command packet.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Packet {
    /// Packet `!`: enable extended-remote mode.
    EnableExtendedMode,
    /// Packet `?`: report the stop reason.
    HaltReason,
    /// Packet `c [addr]`.
    Continue(Option<u64>),
    /// Packet `s [addr]`.
    Step(Option<u64>),
    /// Packet `D`: detach.
    Detach,
    /// Packet `k`: kill.
    Kill,
    /// Packet `g`.
    ReadGeneralRegisters,
    /// Packet `G`: register file values in target byte order.
    WriteGeneralRegisters(Vec<u32>),
    /// Packet `H<op><thread>`: thread selection, a formality here.
    SelectThread,
    /// Packet `m addr,len`.
    ReadMemory {
        /// Start address.
        address: u64,
        /// Number of bytes.
        length: u32,
    },
    /// Packet `M addr,len:hexdata`.
    WriteMemory {
        /// Start address.
        address: u64,
        /// The decoded data.
        data: Vec<u8>,
    },
    /// Packet `X addr,len:binarydata`.
    WriteMemoryBinary {
        /// Start address.
        address: u64,
        /// The raw data.
        data: Vec<u8>,
    },
    /// Packet `p n`.
    ReadRegister(u16),
    /// Packet `P n=value`.
    WriteRegister {
        /// Register file index.
        id: u16,
        /// The new value.
        value: u32,
    },
    /// Packet `R XX`: extended-remote restart.
    Restart,
    /// Packet `Z<type>,addr,kind`.
    InsertBreakpoint {
        /// The breakpoint type digit, 0..=4.
        kind: u8,
        /// Target address.
        address: u64,
        /// Size/kind field.
        size: u32,
    },
    /// Packet `z<type>,addr,kind`.
    RemoveBreakpoint {
        /// The breakpoint type digit, 0..=4.
        kind: u8,
        /// Target address.
        address: u64,
        /// Size/kind field.
        size: u32,
    },
    /// Packet `q…`.
    Query(QueryPacket),
    /// Packet `QStartNoAckMode`.
    StartNoAckMode,
    /// Packet `v…`.
    V(VPacket),
    /// Anything unrecognised; answered with the empty packet.
    Unknown(Vec<u8>),
}

/// Parse one packet payload.
pub fn parse_packet(input: &[u8]) -> Packet {
    let result = alt((
        extended_mode,
        halt_reason,
        continue_packet,
        step_packet,
        detach,
        kill,
        read_general_registers,
        write_general_registers,
        select_thread,
        read_memory,
        write_memory,
        write_memory_binary,
        read_register,
        write_register,
        restart,
        insert_breakpoint,
        remove_breakpoint,
        query,
        start_no_ack_mode,
        v,
    ))(input);

    match result {
        Ok((_, packet)) => packet,
        Err(_) => Packet::Unknown(input.to_owned()),
    }
}

fn extended_mode(input: &[u8]) -> IResult<&[u8], Packet> {
    value(Packet::EnableExtendedMode, char('!'))(input)
}

fn halt_reason(input: &[u8]) -> IResult<&[u8], Packet> {
    value(Packet::HaltReason, char('?'))(input)
}

fn continue_packet(input: &[u8]) -> IResult<&[u8], Packet> {
    let (input, _) = char('c')(input)?;
    let (input, address) = opt(hex_u64)(input)?;
    Ok((input, Packet::Continue(address)))
}

fn step_packet(input: &[u8]) -> IResult<&[u8], Packet> {
    let (input, _) = char('s')(input)?;
    let (input, address) = opt(hex_u64)(input)?;
    Ok((input, Packet::Step(address)))
}

fn detach(input: &[u8]) -> IResult<&[u8], Packet> {
    value(Packet::Detach, char('D'))(input)
}

fn kill(input: &[u8]) -> IResult<&[u8], Packet> {
    value(Packet::Kill, char('k'))(input)
}

fn read_general_registers(input: &[u8]) -> IResult<&[u8], Packet> {
    value(Packet::ReadGeneralRegisters, char('g'))(input)
}

fn write_general_registers(input: &[u8]) -> IResult<&[u8], Packet> {
    let (input, _) = char('G')(input)?;
    let (input, values) = many0(hex_u32_le)(input)?;
    Ok((input, Packet::WriteGeneralRegisters(values)))
}

fn select_thread(input: &[u8]) -> IResult<&[u8], Packet> {
    let (input, _) = char('H')(input)?;
    Ok((&[], Packet::SelectThread))
}

fn read_memory(input: &[u8]) -> IResult<&[u8], Packet> {
    let (input, _) = char('m')(input)?;
    let (input, address) = hex_u64(input)?;
    let (input, _) = char(',')(input)?;
    let (input, length) = hex_u32(input)?;
    Ok((input, Packet::ReadMemory { address, length }))
}

fn write_memory(input: &[u8]) -> IResult<&[u8], Packet> {
    let (input, _) = char('M')(input)?;
    let (input, address) = hex_u64(input)?;
    let (input, _) = char(',')(input)?;
    let (input, _length) = hex_u32(input)?;
    let (input, _) = char(':')(input)?;
    let (input, data) = hex_bytes(input)?;
    Ok((input, Packet::WriteMemory { address, data }))
}

fn write_memory_binary(input: &[u8]) -> IResult<&[u8], Packet> {
    let (input, _) = char('X')(input)?;
    let (input, address) = hex_u64(input)?;
    let (input, _) = char(',')(input)?;
    let (input, length) = hex_u32(input)?;
    let (input, _) = char(':')(input)?;
    let (input, data) = take(length)(input)?;

    Ok((
        input,
        Packet::WriteMemoryBinary {
            address,
            data: data.to_owned(),
        },
    ))
}

fn read_register(input: &[u8]) -> IResult<&[u8], Packet> {
    let (input, _) = char('p')(input)?;
    let (input, id) = hex_u32(input)?;
    Ok((input, Packet::ReadRegister(id as u16)))
}

fn write_register(input: &[u8]) -> IResult<&[u8], Packet> {
    let (input, _) = char('P')(input)?;
    let (input, id) = hex_u32(input)?;
    let (input, _) = char('=')(input)?;
    let (input, value) = hex_u32_le(input)?;
    Ok((
        input,
        Packet::WriteRegister {
            id: id as u16,
            value,
        },
    ))
}

fn restart(input: &[u8]) -> IResult<&[u8], Packet> {
    let (input, _) = char('R')(input)?;
    Ok((&[], Packet::Restart))
}

fn breakpoint_fields(input: &[u8]) -> IResult<&[u8], (u8, u64, u32)> {
    let (input, kind) = nom::character::complete::one_of("01234")(input)?;
    let (input, _) = char(',')(input)?;
    let (input, address) = hex_u64(input)?;
    let (input, _) = char(',')(input)?;
    let (input, size) = hex_u32(input)?;
    Ok((input, (kind as u8 - b'0', address, size)))
}

fn insert_breakpoint(input: &[u8]) -> IResult<&[u8], Packet> {
    let (input, _) = char('Z')(input)?;
    let (input, (kind, address, size)) = breakpoint_fields(input)?;
    Ok((
        input,
        Packet::InsertBreakpoint {
            kind,
            address,
            size,
        },
    ))
}

fn remove_breakpoint(input: &[u8]) -> IResult<&[u8], Packet> {
    let (input, _) = char('z')(input)?;
    let (input, (kind, address, size)) = breakpoint_fields(input)?;
    Ok((
        input,
        Packet::RemoveBreakpoint {
            kind,
            address,
            size,
        },
    ))
}

fn query(input: &[u8]) -> IResult<&[u8], Packet> {
    let (input, _) = char('q')(input)?;
    let (input, packet) = query::query_packet(input)?;
    Ok((input, Packet::Query(packet)))
}

fn start_no_ack_mode(input: &[u8]) -> IResult<&[u8], Packet> {
    let (input, _) = nom::bytes::complete::tag("QStartNoAckMode")(input)?;
    Ok((input, Packet::StartNoAckMode))
}

fn v(input: &[u8]) -> IResult<&[u8], Packet> {
    let (input, _) = char('v')(input)?;
    let (input, packet) = v_packet::v_packet(input)?;
    Ok((input, Packet::V(packet)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_simple_packets() {
        let test_data: [(&[u8], Packet); 7] = [
            (b"!", Packet::EnableExtendedMode),
            (b"?", Packet::HaltReason),
            (b"c", Packet::Continue(None)),
            (b"g", Packet::ReadGeneralRegisters),
            (b"D", Packet::Detach),
            (b"k", Packet::Kill),
            (b"QStartNoAckMode", Packet::StartNoAckMode),
        ];

        for (input, expected) in test_data {
            assert_eq!(parse_packet(input), expected, "input: {input:?}");
        }
    }

    #[test]
    fn parse_read_memory() {
        assert_eq!(
            parse_packet(b"m8000000,40"),
            Packet::ReadMemory {
                address: 0x800_0000,
                length: 0x40,
            }
        );
    }

    #[test]
    fn parse_read_memory_long_address() {
        assert_eq!(
            parse_packet(b"mffffff8000002010,8"),
            Packet::ReadMemory {
                address: 0xffff_ff80_0000_2010,
                length: 0x8,
            }
        );
    }

    #[test]
    fn parse_write_memory() {
        assert_eq!(
            parse_packet(b"M20000000,4:aabbccdd"),
            Packet::WriteMemory {
                address: 0x2000_0000,
                data: vec![0xAA, 0xBB, 0xCC, 0xDD],
            }
        );
    }

    #[test]
    fn parse_write_memory_binary() {
        assert_eq!(
            parse_packet(b"X270,7:.sd223!"),
            Packet::WriteMemoryBinary {
                address: 0x270,
                data: b".sd223!".to_vec(),
            }
        );
    }

    #[test]
    fn parse_registers() {
        assert_eq!(parse_packet(b"p0f"), Packet::ReadRegister(15));
        assert_eq!(
            parse_packet(b"P0f=78563412"),
            Packet::WriteRegister {
                id: 15,
                value: 0x1234_5678,
            }
        );
    }

    #[test]
    fn parse_breakpoints() {
        assert_eq!(
            parse_packet(b"Z1,8000404,2"),
            Packet::InsertBreakpoint {
                kind: 1,
                address: 0x800_0404,
                size: 2,
            }
        );
        assert_eq!(
            parse_packet(b"z1,8000404,2"),
            Packet::RemoveBreakpoint {
                kind: 1,
                address: 0x800_0404,
                size: 2,
            }
        );
    }

    #[test]
    fn parse_vcont() {
        assert_eq!(
            parse_packet(b"vCont;c"),
            Packet::V(VPacket::Continue(Action::Continue))
        );
        assert_eq!(parse_packet(b"vCont?"), Packet::V(VPacket::QueryContSupport));
    }

    #[test]
    fn unknown_packets_are_preserved() {
        assert_eq!(
            parse_packet(b"_unsupported"),
            Packet::Unknown(b"_unsupported".to_vec())
        );
    }
}
