use nom::{
    branch::alt,
    bytes::complete::{tag, take_until},
    character::complete::char,
    combinator::{opt, rest},
    multi::separated_list0,
    sequence::preceded,
    IResult,
};

use super::util::{hex_bytes, hex_u32, hex_u64};

/// A parsed `q` packet.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum QueryPacket {
    /// `qC`: the current thread id.
    ThreadId,
    /// `qAttached[:pid]`.
    Attached(Option<u32>),
    /// `qRcmd,<hex>`: a monitor command, already unhexed.
    Command(Vec<u8>),
    /// `qSupported[:feature;feature…]`.
    Supported(Vec<Vec<u8>>),
    /// `qfThreadInfo`.
    FirstThreadInfo,
    /// `qsThreadInfo`.
    SubsequentThreadInfo,
    /// `qCRC:addr,length`.
    Crc {
        /// Start of the checked range.
        address: u64,
        /// Length of the checked range.
        length: u32,
    },
    /// `qXfer:<object>:read:<annex>:<offset>,<length>`.
    TransferRead {
        /// The transferred object, e.g. `features` or `memory-map`.
        object: Vec<u8>,
        /// The annex, e.g. `target.xml`.
        annex: Vec<u8>,
        /// Read window offset.
        offset: u32,
        /// Read window length.
        length: u32,
    },
    /// Anything else; answered with the empty packet.
    Unknown(Vec<u8>),
}

pub fn query_packet(input: &[u8]) -> IResult<&[u8], QueryPacket> {
    let result = alt((
        query_crc,
        query_thread_id,
        query_attached,
        query_command,
        query_supported,
        query_first_thread_info,
        query_subsequent_thread_info,
        query_transfer,
    ))(input);

    match result {
        Ok(parsed) => Ok(parsed),
        Err(nom::Err::Error(_)) => Ok((&[], QueryPacket::Unknown(input.to_owned()))),
        Err(other) => Err(other),
    }
}

fn query_thread_id(input: &[u8]) -> IResult<&[u8], QueryPacket> {
    let (input, _) = char('C')(input)?;
    Ok((input, QueryPacket::ThreadId))
}

fn query_attached(input: &[u8]) -> IResult<&[u8], QueryPacket> {
    let (input, _) = tag("Attached")(input)?;
    let (input, pid) = opt(preceded(char(':'), hex_u32))(input)?;
    Ok((input, QueryPacket::Attached(pid)))
}

fn query_command(input: &[u8]) -> IResult<&[u8], QueryPacket> {
    let (input, _) = tag("Rcmd,")(input)?;
    let (input, command) = hex_bytes(input)?;
    Ok((input, QueryPacket::Command(command)))
}

fn query_supported(input: &[u8]) -> IResult<&[u8], QueryPacket> {
    let (input, _) = tag("Supported")(input)?;
    let (input, features) = opt(preceded(char(':'), separated_list0(char(';'), feature)))(input)?;
    Ok((input, QueryPacket::Supported(features.unwrap_or_default())))
}

fn feature(input: &[u8]) -> IResult<&[u8], Vec<u8>> {
    let (rest_input, data) = alt((take_until(";"), rest))(input)?;
    Ok((rest_input, data.to_owned()))
}

fn query_first_thread_info(input: &[u8]) -> IResult<&[u8], QueryPacket> {
    let (input, _) = tag("fThreadInfo")(input)?;
    Ok((input, QueryPacket::FirstThreadInfo))
}

fn query_subsequent_thread_info(input: &[u8]) -> IResult<&[u8], QueryPacket> {
    let (input, _) = tag("sThreadInfo")(input)?;
    Ok((input, QueryPacket::SubsequentThreadInfo))
}

fn query_crc(input: &[u8]) -> IResult<&[u8], QueryPacket> {
    let (input, _) = tag("CRC:")(input)?;
    let (input, address) = hex_u64(input)?;
    let (input, _) = char(',')(input)?;
    let (input, length) = hex_u32(input)?;
    Ok((input, QueryPacket::Crc { address, length }))
}

fn query_transfer(input: &[u8]) -> IResult<&[u8], QueryPacket> {
    let (input, _) = tag("Xfer:")(input)?;
    let (input, object) = take_until(":")(input)?;
    let (input, _) = tag(":read:")(input)?;
    let (input, annex) = take_until(":")(input)?;
    let (input, _) = char(':')(input)?;
    let (input, offset) = hex_u32(input)?;
    let (input, _) = char(',')(input)?;
    let (input, length) = hex_u32(input)?;

    Ok((
        input,
        QueryPacket::TransferRead {
            object: object.to_owned(),
            annex: annex.to_owned(),
            offset,
            length,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    const EMPTY: &[u8] = &[];

    #[test]
    fn parse_memory_map_read() {
        assert_eq!(
            query_packet(b"Xfer:memory-map:read::0,fff").unwrap(),
            (
                EMPTY,
                QueryPacket::TransferRead {
                    object: b"memory-map".to_vec(),
                    annex: vec![],
                    offset: 0,
                    length: 0xFFF,
                }
            )
        );
    }

    #[test]
    fn parse_features_read() {
        assert_eq!(
            query_packet(b"Xfer:features:read:target.xml:0,1000").unwrap(),
            (
                EMPTY,
                QueryPacket::TransferRead {
                    object: b"features".to_vec(),
                    annex: b"target.xml".to_vec(),
                    offset: 0,
                    length: 0x1000,
                }
            )
        );
    }

    #[test]
    fn parse_query_supported_with_features() {
        let (_, packet) =
            query_packet(b"Supported:multiprocess+;swbreak+;hwbreak+;vContSupported+").unwrap();
        let QueryPacket::Supported(features) = packet else {
            panic!("expected a supported packet");
        };
        assert_eq!(features.len(), 4);
        assert_eq!(features[1], b"swbreak+");
    }

    #[test]
    fn parse_query_command() {
        assert_eq!(
            query_packet(b"Rcmd,7265736574").unwrap(),
            (EMPTY, QueryPacket::Command(b"reset".to_vec()))
        );
    }

    #[test]
    fn parse_query_attached_with_pid() {
        assert_eq!(
            query_packet(b"Attached:02").unwrap(),
            (EMPTY, QueryPacket::Attached(Some(2)))
        );
    }

    #[test]
    fn parse_query_crc() {
        assert_eq!(
            query_packet(b"CRC:8000000,13c").unwrap(),
            (
                EMPTY,
                QueryPacket::Crc {
                    address: 0x800_0000,
                    length: 0x13C,
                }
            )
        );
    }

    #[test]
    fn unknown_query_is_preserved() {
        assert_eq!(
            query_packet(b"HostInfo").unwrap(),
            (EMPTY, QueryPacket::Unknown(b"HostInfo".to_vec()))
        );
    }
}
