use bytes::Bytes;
use packed_struct::prelude::*;
use thiserror::Error;
use time::format_description::FormatItem;
use time::macros::format_description;
use time::OffsetDateTime;

use super::address::Address;
use super::command::Command;
use super::crc::crc16;
use super::message::{MessageKind, MessageSet, MessageValue};
use super::{FRAME_END, FRAME_START, MAX_FRAME_SIZE, MIN_FRAME_SIZE};

/// `YYYY-MM-DD HH:MM:SS.mmm`
pub const TIMESTAMP_FORMAT: &[FormatItem<'static>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second].[subsecond digits:3]");

pub fn format_timestamp(timestamp: OffsetDateTime) -> String {
    timestamp.format(TIMESTAMP_FORMAT).unwrap_or_default()
}

/// Why a candidate frame failed to decode. All of these are non-fatal:
/// the pipeline reports them and moves on to the next frame.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("frame does not begin with the start delimiter")]
    InvalidStart,

    #[error("frame length {0} outside the legal range")]
    UnexpectedSize(usize),

    #[error("declared length {declared} does not match frame length {actual}")]
    SizeMismatch { declared: usize, actual: usize },

    #[error("frame does not end with the end delimiter")]
    InvalidEnd,

    #[error("crc mismatch (frame carries {expected:#06x}, computed {actual:#06x})")]
    CrcError { expected: u16, actual: u16 },

    #[error("message record overruns the frame payload")]
    TruncatedMessage,

    #[error("{0} residual bytes after the message list")]
    TrailingBytes(usize),
}

/// A fully decoded bus packet.
///
/// `raw_frame` is the complete on-wire frame including delimiters; it
/// always re-validates: start/end bytes, size field, and CRC over
/// `raw_frame[3..len-3]`.
#[derive(Clone, Debug, PartialEq)]
pub struct Packet {
    pub source: Address,
    pub destination: Address,
    pub command: Command,
    pub messages: Vec<MessageSet>,
    pub raw_frame: Bytes,
    pub timestamp: OffsetDateTime,
}

impl Packet {
    /// Validate and decode one candidate frame, stamping it with the
    /// current wall clock.
    pub fn decode(frame: &[u8]) -> Result<Packet, DecodeError> {
        Self::decode_at(frame, OffsetDateTime::now_utc())
    }

    pub fn decode_at(frame: &[u8], timestamp: OffsetDateTime) -> Result<Packet, DecodeError> {
        if frame.first() != Some(&FRAME_START) {
            return Err(DecodeError::InvalidStart);
        }

        let len = frame.len();
        if !(MIN_FRAME_SIZE..=MAX_FRAME_SIZE).contains(&len) {
            return Err(DecodeError::UnexpectedSize(len));
        }

        let declared = (((frame[1] as usize) << 8) | frame[2] as usize) + 2;
        if declared != len {
            return Err(DecodeError::SizeMismatch {
                declared,
                actual: len,
            });
        }

        if frame[len - 1] != FRAME_END {
            return Err(DecodeError::InvalidEnd);
        }

        let expected = u16::from_be_bytes([frame[len - 3], frame[len - 2]]);
        let actual = crc16(&frame[3..len - 3]);
        if expected != actual {
            return Err(DecodeError::CrcError { expected, actual });
        }

        let source = Address::decode(&frame[3..6].try_into().expect("3-byte address"));
        let destination = Address::decode(&frame[6..9].try_into().expect("3-byte address"));
        let command = Command::unpack(&frame[9..12].try_into().expect("3-byte command"))
            .expect("unpack 3-byte command");

        let payload_end = len - 3;
        let mut cursor = 12;
        let capacity = frame[cursor];
        cursor += 1;

        let mut messages = Vec::with_capacity(capacity as usize);
        for _ in 0..capacity {
            if cursor + 2 > payload_end {
                return Err(DecodeError::TruncatedMessage);
            }
            let number = u16::from_be_bytes([frame[cursor], frame[cursor + 1]]);
            cursor += 2;

            let value = match MessageKind::of(number) {
                MessageKind::Enum => {
                    if cursor + 1 > payload_end {
                        return Err(DecodeError::TruncatedMessage);
                    }
                    let v = MessageValue::Enum(frame[cursor]);
                    cursor += 1;
                    v
                }
                MessageKind::Variable => {
                    if cursor + 2 > payload_end {
                        return Err(DecodeError::TruncatedMessage);
                    }
                    let v = MessageValue::Variable(i16::from_be_bytes([
                        frame[cursor],
                        frame[cursor + 1],
                    ]));
                    cursor += 2;
                    v
                }
                MessageKind::LongVariable => {
                    if cursor + 4 > payload_end {
                        return Err(DecodeError::TruncatedMessage);
                    }
                    let v = MessageValue::LongVariable(i32::from_be_bytes([
                        frame[cursor],
                        frame[cursor + 1],
                        frame[cursor + 2],
                        frame[cursor + 3],
                    ]));
                    cursor += 4;
                    v
                }
                // a structure record absorbs the rest of the payload; a
                // structure followed by further records cannot decode and
                // fails the next iteration as truncated
                MessageKind::Structure => {
                    let v = MessageValue::Structure(frame[cursor..payload_end].to_vec());
                    cursor = payload_end;
                    v
                }
            };

            messages.push(MessageSet::new(number, value));
        }

        if cursor != payload_end {
            return Err(DecodeError::TrailingBytes(payload_end - cursor));
        }

        Ok(Packet {
            source,
            destination,
            command,
            messages,
            raw_frame: Bytes::copy_from_slice(frame),
            timestamp,
        })
    }

    /// Canonical structural signature:
    /// `<source>-><destination>:<data_type>:[<id>,<id>,...]`.
    ///
    /// Packets differing only in values or timestamps share a signature.
    pub fn signature(&self) -> String {
        let ids = self
            .messages
            .iter()
            .map(|m| format!("{:04x}", m.number))
            .collect::<Vec<_>>()
            .join(",");

        format!(
            "{}->{}:{}:[{}]",
            self.source,
            self.destination,
            self.command.data_type_name(),
            ids
        )
    }
}

/// Build a well-formed frame around a header and message list: size
/// field, payload, CRC, delimiters.
pub fn encode_frame(
    source: Address,
    destination: Address,
    command: Command,
    messages: &[MessageSet],
) -> Result<Vec<u8>, packed_struct::PackingError> {
    let payload_len: usize = messages.iter().map(|m| m.wire_size()).sum();
    let len = 3 + 9 + 1 + payload_len + 3;
    let size_field = (len - 2) as u16;

    let mut out = Vec::with_capacity(len);
    out.push(FRAME_START);
    out.extend_from_slice(&size_field.to_be_bytes());
    out.extend_from_slice(&source.encode());
    out.extend_from_slice(&destination.encode());
    out.extend_from_slice(&command.pack()?);
    out.push(messages.len() as u8);
    for msg in messages {
        msg.encode_into(&mut out);
    }

    let crc = crc16(&out[3..]);
    out.extend_from_slice(&crc.to_be_bytes());
    out.push(FRAME_END);

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::command::{DataType, PacketType};

    fn zero_address() -> Address {
        Address::new(0, 0, 0)
    }

    /// The 16-byte minimum legal frame: zero addresses, zero command,
    /// empty message list.
    pub(crate) fn minimal_frame() -> Vec<u8> {
        let command = Command::unpack(&[0, 0, 0]).unwrap();
        encode_frame(zero_address(), zero_address(), command, &[]).unwrap()
    }

    #[test]
    fn minimal_frame_decodes() {
        let frame = minimal_frame();
        assert_eq!(frame.len(), 16);
        assert_eq!(frame[0], FRAME_START);
        assert_eq!(*frame.last().unwrap(), FRAME_END);

        let packet = Packet::decode(&frame).unwrap();
        assert!(packet.messages.is_empty());
        assert_eq!(packet.source, zero_address());
        assert_eq!(packet.destination, zero_address());
        assert_eq!(
            packet.command.packet_type,
            EnumCatchAll::Enum(PacketType::StandBy)
        );
    }

    #[test]
    fn invalid_start() {
        let mut frame = minimal_frame();
        frame[0] = 0x33;
        assert_eq!(Packet::decode(&frame), Err(DecodeError::InvalidStart));
        assert_eq!(Packet::decode(&[]), Err(DecodeError::InvalidStart));
    }

    #[test]
    fn unexpected_size() {
        let frame = minimal_frame();
        assert_eq!(
            Packet::decode(&frame[..15]),
            Err(DecodeError::UnexpectedSize(15))
        );
    }

    #[test]
    fn size_mismatch() {
        let mut frame = minimal_frame();
        frame[2] += 1;
        assert_eq!(
            Packet::decode(&frame),
            Err(DecodeError::SizeMismatch {
                declared: 17,
                actual: 16
            })
        );
    }

    #[test]
    fn invalid_end() {
        let mut frame = minimal_frame();
        let last = frame.len() - 1;
        frame[last] = 0x00;
        assert_eq!(Packet::decode(&frame), Err(DecodeError::InvalidEnd));
    }

    #[test]
    fn crc_error_carries_both_values() {
        let mut frame = minimal_frame();
        frame[5] ^= 0x01; // flip one payload bit

        let carried = u16::from_be_bytes([frame[13], frame[14]]);
        let computed = crc16(&frame[3..13]);

        assert_eq!(
            Packet::decode(&frame),
            Err(DecodeError::CrcError {
                expected: carried,
                actual: computed
            })
        );
    }

    #[test]
    fn mixed_message_kinds() {
        let command = Command::new(PacketType::Normal, DataType::Notification, 1);
        let messages = vec![
            MessageSet::new(0x4000, MessageValue::Enum(0x01)),
            MessageSet::new(0x4201, MessageValue::Variable(0x00dc)),
            MessageSet::new(0x8413, MessageValue::LongVariable(0x0000_0100)),
        ];
        let frame = encode_frame(
            Address::new(0x20, 0, 0),
            Address::new(0x50, 0, 0),
            command,
            &messages,
        )
        .unwrap();

        let packet = Packet::decode(&frame).unwrap();
        assert_eq!(packet.messages.len(), 3);
        assert_eq!(packet.messages, messages);

        let readable: Vec<String> = packet.messages.iter().map(|m| m.readable()).collect();
        assert_eq!(readable, ["ON", "22.0°C", "256"]);

        assert_eq!(
            packet.signature(),
            "20.00.00->50.00.00:Notification:[4000,4201,8413]"
        );
    }

    #[test]
    fn structure_absorbs_remaining_payload() {
        let command = Command::new(PacketType::Normal, DataType::Response, 9);
        let messages = vec![MessageSet::new(
            0x4619,
            MessageValue::Structure(vec![0xde, 0xad, 0xbe, 0xef, 0x00]),
        )];
        let frame = encode_frame(zero_address(), zero_address(), command, &messages).unwrap();

        let packet = Packet::decode(&frame).unwrap();
        assert_eq!(packet.messages, messages);
    }

    #[test]
    fn structure_followed_by_record_is_truncated() {
        let command = Command::new(PacketType::Normal, DataType::Response, 9);
        let messages = vec![
            MessageSet::new(0x4619, MessageValue::Structure(vec![0x01, 0x02])),
            MessageSet::new(0x4000, MessageValue::Enum(1)),
        ];
        let frame = encode_frame(zero_address(), zero_address(), command, &messages).unwrap();

        assert_eq!(Packet::decode(&frame), Err(DecodeError::TruncatedMessage));
    }

    #[test]
    fn capacity_overrun_is_truncated() {
        let mut frame = minimal_frame();
        frame[12] = 1; // claims one record but the payload is empty
        let crc = crc16(&frame[3..13]).to_be_bytes();
        frame[13] = crc[0];
        frame[14] = crc[1];

        assert_eq!(Packet::decode(&frame), Err(DecodeError::TruncatedMessage));
    }

    #[test]
    fn residual_bytes_are_trailing() {
        let command = Command::new(PacketType::Normal, DataType::Notification, 1);
        let messages = [MessageSet::new(0x4000, MessageValue::Enum(1))];
        let mut frame =
            encode_frame(zero_address(), zero_address(), command, &messages).unwrap();

        // shrink the declared capacity below the encoded record count
        frame[12] = 0;
        let crc_at = frame.len() - 3;
        let crc = crc16(&frame[3..crc_at]).to_be_bytes();
        frame[crc_at] = crc[0];
        frame[crc_at + 1] = crc[1];

        assert_eq!(Packet::decode(&frame), Err(DecodeError::TrailingBytes(3)));
    }

    #[test]
    fn reframing_reproduces_bytes() {
        let command = Command::new(PacketType::Normal, DataType::Read, 0x42);
        let messages = vec![
            MessageSet::new(0x4001, MessageValue::Enum(4)),
            MessageSet::new(0x8204, MessageValue::Variable(-55)),
        ];
        let frame = encode_frame(
            Address::new(0x10, 0, 0),
            Address::new(0xb0, 0xff, 0x00),
            command,
            &messages,
        )
        .unwrap();

        let packet = Packet::decode(&frame).unwrap();
        let reframed = encode_frame(
            packet.source,
            packet.destination,
            packet.command,
            &packet.messages,
        )
        .unwrap();

        assert_eq!(reframed, frame);
        assert_eq!(&packet.raw_frame[..], &frame[..]);
    }

    #[test]
    fn signature_ignores_values_and_timestamps() {
        let command = Command::new(PacketType::Normal, DataType::Notification, 1);
        let a = encode_frame(
            Address::new(0x20, 0, 0),
            Address::new(0x50, 0, 0),
            command,
            &[MessageSet::new(0x4201, MessageValue::Variable(220))],
        )
        .unwrap();
        let b = encode_frame(
            Address::new(0x20, 0, 0),
            Address::new(0x50, 0, 0),
            Command::new(PacketType::Normal, DataType::Notification, 99),
            &[MessageSet::new(0x4201, MessageValue::Variable(-10))],
        )
        .unwrap();

        let pa = Packet::decode(&a).unwrap();
        let pb = Packet::decode(&b).unwrap();
        assert_eq!(pa.signature(), pb.signature());
    }

    #[test]
    fn timestamp_format_shape() {
        let ts = OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap();
        let formatted = format_timestamp(ts);
        assert_eq!(formatted, "2023-11-14 22:13:20.000");
    }
}
