//! RSP packet framing.
//!
//! A packet travels as `$<payload>#<checksum>` where the checksum is the
//! 8-bit sum of the payload bytes as transmitted, rendered as two hex
//! digits. The bytes `# $ } *` are escaped inside binary payloads with a
//! `}` prefix and XOR 0x20; the checksum covers the escaped form. In ack
//! mode every packet is answered with `+` (accept) or `-` (resend).

/// The one-byte interrupt GDB sends to preempt a running target.
pub const INTERRUPT_BYTE: u8 = 0x03;

const ESCAPE: u8 = b'}';
const ESCAPE_XOR: u8 = 0x20;

/// Something the byte stream produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReaderEvent {
    /// A complete packet with its unescaped payload.
    Packet {
        /// The payload with escapes resolved.
        payload: Vec<u8>,
        /// Whether the transmitted checksum matched.
        checksum_ok: bool,
    },
    /// The 0x03 interrupt byte, only meaningful between packets.
    Interrupt,
    /// A `+` acknowledgement.
    Ack,
    /// A `-` retransmission request.
    Nak,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReaderState {
    Idle,
    Payload,
    PayloadEscape,
    Checksum1,
    Checksum2,
}

/// An incremental packet decoder; feed it bytes one at a time.
#[derive(Debug)]
pub struct PacketReader {
    state: ReaderState,
    payload: Vec<u8>,
    running_sum: u8,
    received_sum: u8,
}

impl Default for PacketReader {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketReader {
    pub fn new() -> Self {
        Self {
            state: ReaderState::Idle,
            payload: Vec::new(),
            running_sum: 0,
            received_sum: 0,
        }
    }

    /// Feed one byte; returns an event when one completes.
    pub fn feed(&mut self, byte: u8) -> Option<ReaderEvent> {
        match self.state {
            ReaderState::Idle => match byte {
                b'$' => {
                    self.payload.clear();
                    self.running_sum = 0;
                    self.state = ReaderState::Payload;
                    None
                }
                INTERRUPT_BYTE => Some(ReaderEvent::Interrupt),
                b'+' => Some(ReaderEvent::Ack),
                b'-' => Some(ReaderEvent::Nak),
                _ => None,
            },
            ReaderState::Payload => match byte {
                b'#' => {
                    self.state = ReaderState::Checksum1;
                    None
                }
                ESCAPE => {
                    self.running_sum = self.running_sum.wrapping_add(byte);
                    self.state = ReaderState::PayloadEscape;
                    None
                }
                _ => {
                    self.running_sum = self.running_sum.wrapping_add(byte);
                    self.payload.push(byte);
                    None
                }
            },
            ReaderState::PayloadEscape => {
                self.running_sum = self.running_sum.wrapping_add(byte);
                self.payload.push(byte ^ ESCAPE_XOR);
                self.state = ReaderState::Payload;
                None
            }
            ReaderState::Checksum1 => {
                self.received_sum = hex_digit(byte) << 4;
                self.state = ReaderState::Checksum2;
                None
            }
            ReaderState::Checksum2 => {
                self.received_sum |= hex_digit(byte);
                self.state = ReaderState::Idle;
                Some(ReaderEvent::Packet {
                    payload: std::mem::take(&mut self.payload),
                    checksum_ok: self.received_sum == self.running_sum,
                })
            }
        }
    }
}

fn hex_digit(byte: u8) -> u8 {
    (byte as char).to_digit(16).unwrap_or(0) as u8
}

/// Frame a payload for the wire: escape, checksum, delimiters.
pub fn frame(payload: &[u8]) -> Vec<u8> {
    let mut framed = Vec::with_capacity(payload.len() + 4);
    framed.push(b'$');

    let mut sum = 0u8;
    for &byte in payload {
        if matches!(byte, b'#' | b'$' | b'}' | b'*') {
            let escaped = byte ^ ESCAPE_XOR;
            sum = sum.wrapping_add(ESCAPE).wrapping_add(escaped);
            framed.push(ESCAPE);
            framed.push(escaped);
        } else {
            sum = sum.wrapping_add(byte);
            framed.push(byte);
        }
    }

    framed.push(b'#');
    framed.extend_from_slice(format!("{sum:02x}").as_bytes());
    framed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_all(reader: &mut PacketReader, bytes: &[u8]) -> Vec<ReaderEvent> {
        bytes.iter().filter_map(|&b| reader.feed(b)).collect()
    }

    #[test]
    fn parses_a_plain_packet() {
        let mut reader = PacketReader::new();
        let events = feed_all(&mut reader, b"$qSupported#37");
        assert_eq!(
            events,
            vec![ReaderEvent::Packet {
                payload: b"qSupported".to_vec(),
                checksum_ok: true,
            }]
        );
    }

    #[test]
    fn detects_checksum_mismatch() {
        let mut reader = PacketReader::new();
        let events = feed_all(&mut reader, b"$qSupported#00");
        assert_eq!(
            events,
            vec![ReaderEvent::Packet {
                payload: b"qSupported".to_vec(),
                checksum_ok: false,
            }]
        );
    }

    #[test]
    fn unescapes_binary_payloads() {
        // 0x03 escaped as-is is fine; `}` itself must be escaped as }]
        let mut reader = PacketReader::new();
        let raw = frame(b"X0,4:}$#*");
        let events = feed_all(&mut reader, &raw);
        assert_eq!(
            events,
            vec![ReaderEvent::Packet {
                payload: b"X0,4:}$#*".to_vec(),
                checksum_ok: true,
            }]
        );
    }

    #[test]
    fn interrupt_between_packets() {
        let mut reader = PacketReader::new();
        assert_eq!(reader.feed(0x03), Some(ReaderEvent::Interrupt));
    }

    #[test]
    fn ack_and_nak() {
        let mut reader = PacketReader::new();
        assert_eq!(reader.feed(b'+'), Some(ReaderEvent::Ack));
        assert_eq!(reader.feed(b'-'), Some(ReaderEvent::Nak));
    }

    #[test]
    fn frame_checksum_law() {
        for payload in [&b"OK"[..], b"T05thread:1;", b"", b"}$#*"] {
            let framed = frame(payload);
            assert_eq!(framed[0], b'$');

            let hash = framed.iter().rposition(|&b| b == b'#').unwrap();
            let sum: u8 = framed[1..hash]
                .iter()
                .fold(0u8, |acc, &b| acc.wrapping_add(b));
            let rendered = std::str::from_utf8(&framed[hash + 1..]).unwrap();
            assert_eq!(u8::from_str_radix(rendered, 16).unwrap(), sum);
        }
    }

    #[test]
    fn roundtrip_through_reader() {
        let mut reader = PacketReader::new();
        let payload: Vec<u8> = (0u8..=255).collect();
        let events = feed_all(&mut reader, &frame(&payload));
        assert_eq!(
            events,
            vec![ReaderEvent::Packet {
                payload,
                checksum_ok: true,
            }]
        );
    }
}
