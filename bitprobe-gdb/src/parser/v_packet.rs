use nom::{
    branch::alt,
    bytes::complete::tag,
    character::complete::char,
    combinator::{opt, value},
    sequence::preceded,
    IResult,
};

use super::util::{hex_u32, hex_u64};

/// A parsed `v` packet.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum VPacket {
    /// `vCont?`: which resume actions are supported.
    QueryContSupport,
    /// `vCont;<action>[:thread]…`; only the first action matters on a
    /// single-core probe.
    Continue(Action),
    /// `vAttach;pid`.
    Attach(u32),
    /// `vRun;…`: restart the program.
    Run,
    /// `vFlashErase:addr,length`.
    FlashErase {
        /// Start of the erased range.
        address: u64,
        /// Length of the erased range.
        length: u64,
    },
    /// `vFlashWrite:addr:data` with binary payload.
    FlashWrite {
        /// Program address.
        address: u64,
        /// The raw data bytes.
        data: Vec<u8>,
    },
    /// `vFlashDone`.
    FlashDone,
    /// Anything else; answered with the empty packet.
    Unknown(Vec<u8>),
}

/// A resume action of `vCont`.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Action {
    /// Continue execution.
    Continue,
    /// Continue with a signal; the signal is ignored on bare metal.
    ContinueSignal(u8),
    /// Single step.
    Step,
    /// Step with a signal.
    StepSignal(u8),
    /// Stop the target.
    Stop,
}

pub fn v_packet(input: &[u8]) -> IResult<&[u8], VPacket> {
    let result = alt((
        v_cont_support,
        v_cont,
        v_attach,
        v_run,
        v_flash_erase,
        v_flash_write,
        v_flash_done,
    ))(input);

    match result {
        Ok(parsed) => Ok(parsed),
        // Unknown `v` packets must elicit the empty response, notably
        // `vMustReplyEmpty`.
        Err(nom::Err::Error(_)) => Ok((&[], VPacket::Unknown(input.to_owned()))),
        Err(other) => Err(other),
    }
}

fn v_cont_support(input: &[u8]) -> IResult<&[u8], VPacket> {
    let (input, _) = tag("Cont?")(input)?;
    Ok((input, VPacket::QueryContSupport))
}

fn v_cont(input: &[u8]) -> IResult<&[u8], VPacket> {
    let (input, _) = tag("Cont;")(input)?;
    let (input, action) = v_cont_action(input)?;
    Ok((input, VPacket::Continue(action)))
}

fn v_cont_action(input: &[u8]) -> IResult<&[u8], Action> {
    alt((
        |input| {
            let (input, signal) = preceded(char('C'), hex_u32)(input)?;
            Ok((input, Action::ContinueSignal(signal as u8)))
        },
        |input| {
            let (input, signal) = preceded(char('S'), hex_u32)(input)?;
            Ok((input, Action::StepSignal(signal as u8)))
        },
        value(Action::Continue, char('c')),
        value(Action::Step, char('s')),
        value(Action::Stop, char('t')),
    ))(input)
}

fn v_attach(input: &[u8]) -> IResult<&[u8], VPacket> {
    let (input, _) = tag("Attach;")(input)?;
    let (input, pid) = hex_u32(input)?;
    Ok((input, VPacket::Attach(pid)))
}

fn v_run(input: &[u8]) -> IResult<&[u8], VPacket> {
    let (input, _) = tag("Run")(input)?;
    Ok((&[], VPacket::Run))
}

fn v_flash_erase(input: &[u8]) -> IResult<&[u8], VPacket> {
    let (input, _) = tag("FlashErase:")(input)?;
    let (input, address) = hex_u64(input)?;
    let (input, _) = char(',')(input)?;
    let (input, length) = hex_u64(input)?;
    Ok((input, VPacket::FlashErase { address, length }))
}

fn v_flash_write(input: &[u8]) -> IResult<&[u8], VPacket> {
    let (input, _) = tag("FlashWrite:")(input)?;
    let (input, address) = hex_u64(input)?;
    let (input, _) = char(':')(input)?;
    // Everything after the second separator is raw binary.
    Ok((
        &[],
        VPacket::FlashWrite {
            address,
            data: input.to_owned(),
        },
    ))
}

fn v_flash_done(input: &[u8]) -> IResult<&[u8], VPacket> {
    let (input, _) = tag("FlashDone")(input)?;
    let (input, _) = opt(char(':'))(input)?;
    Ok((input, VPacket::FlashDone))
}

#[cfg(test)]
mod tests {
    use super::*;

    const EMPTY: &[u8] = &[];

    #[test]
    fn parse_v_cont_support() {
        assert_eq!(
            v_packet(b"Cont?").unwrap(),
            (EMPTY, VPacket::QueryContSupport)
        );
    }

    #[test]
    fn parse_v_cont_actions() {
        assert_eq!(
            v_packet(b"Cont;c").unwrap(),
            (EMPTY, VPacket::Continue(Action::Continue))
        );
        assert_eq!(
            v_packet(b"Cont;s:1").unwrap(),
            (":1".as_bytes(), VPacket::Continue(Action::Step))
        );
        assert_eq!(
            v_packet(b"Cont;t").unwrap(),
            (EMPTY, VPacket::Continue(Action::Stop))
        );
        assert_eq!(
            v_packet(b"Cont;C05").unwrap(),
            (EMPTY, VPacket::Continue(Action::ContinueSignal(5)))
        );
    }

    #[test]
    fn parse_v_flash_erase() {
        assert_eq!(
            v_packet(b"FlashErase:08000000,400").unwrap(),
            (
                EMPTY,
                VPacket::FlashErase {
                    address: 0x0800_0000,
                    length: 0x400,
                }
            )
        );
    }

    #[test]
    fn parse_v_flash_write_keeps_binary_tail() {
        assert_eq!(
            v_packet(b"FlashWrite:08000000:\x00\xFFdata").unwrap(),
            (
                EMPTY,
                VPacket::FlashWrite {
                    address: 0x0800_0000,
                    data: b"\x00\xFFdata".to_vec(),
                }
            )
        );
    }

    #[test]
    fn parse_v_flash_done() {
        assert_eq!(v_packet(b"FlashDone").unwrap(), (EMPTY, VPacket::FlashDone));
    }

    #[test]
    fn unknown_v_packet_must_reply_empty() {
        assert_eq!(
            v_packet(b"MustReplyEmpty").unwrap(),
            (EMPTY, VPacket::Unknown(b"MustReplyEmpty".to_vec()))
        );
    }
}
