use nom::{bytes::complete::take_while_m_n, character::is_hex_digit, multi::many1, IResult};

/// Parse bytes encoded as an ASCII hex string.
///
/// For example the string '1275' would result in the bytes 0x12 0x75.
pub fn hex_bytes(input: &[u8]) -> IResult<&[u8], Vec<u8>> {
    many1(hex_byte)(input)
}

fn hex_byte(input: &[u8]) -> IResult<&[u8], u8> {
    let (input, digits) = take_while_m_n(2, 2, is_hex_digit)(input)?;

    let result = (digits[0] as char).to_digit(16).unwrap_or(0) << 4
        | (digits[1] as char).to_digit(16).unwrap_or(0);

    Ok((input, result as u8))
}

/// Parse a big-endian hex number of up to 16 digits.
pub fn hex_u64(input: &[u8]) -> IResult<&[u8], u64> {
    let (input, raw_digits) = take_while_m_n(1, 16, is_hex_digit)(input)?;

    let mut value = 0u64;
    for digit in raw_digits {
        value <<= 4;
        // Only valid hex digits can be in raw_digits at this point.
        value |= (*digit as char).to_digit(16).unwrap() as u64;
    }

    Ok((input, value))
}

/// Parse a big-endian hex number of up to 8 digits.
pub fn hex_u32(input: &[u8]) -> IResult<&[u8], u32> {
    let (input, raw_digits) = take_while_m_n(1, 8, is_hex_digit)(input)?;

    let mut value = 0u32;
    for digit in raw_digits {
        value <<= 4;
        value |= (*digit as char).to_digit(16).unwrap();
    }

    Ok((input, value))
}

/// Parse a 32-bit register value as GDB sends it: hex digits in target
/// (little-endian) byte order.
pub fn hex_u32_le(input: &[u8]) -> IResult<&[u8], u32> {
    let (input, value) = hex_u32(input)?;
    Ok((input, value.swap_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const EMPTY: &[u8] = &[];

    #[test]
    fn parse_hex_bytes() {
        assert_eq!(
            hex_bytes(b"7265736574").unwrap(),
            (EMPTY, vec![0x72, 0x65, 0x73, 0x65, 0x74])
        );
    }

    #[test]
    fn parse_hex_byte_leaves_odd_tail() {
        assert_eq!(hex_bytes(b"853").unwrap(), ("3".as_bytes(), vec![0x85]));
    }

    #[test]
    fn parse_hex_u64() {
        assert_eq!(hex_u64(b"0").unwrap(), (EMPTY, 0x0));
        assert_eq!(hex_u64(b"00000000").unwrap(), (EMPTY, 0x0));
        assert_eq!(
            hex_u64(b"1230000000000000").unwrap(),
            (EMPTY, 0x1230_0000_0000_0000)
        );
        assert_eq!(
            hex_u64(b"ffffff8000002010").unwrap(),
            (EMPTY, 0xffff_ff80_0000_2010)
        );
    }

    #[test]
    fn parse_hex_u32_le_swaps_bytes() {
        assert_eq!(hex_u32_le(b"78563412").unwrap(), (EMPTY, 0x1234_5678));
    }
}
