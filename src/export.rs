use std::fs;
use std::io;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use bytes::Bytes;
use packed_struct::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::{OffsetDateTime, PrimitiveDateTime};
use tracing::warn;

use crate::protocol::address::Address;
use crate::protocol::command::{Command, DataType, PacketType};
use crate::protocol::message::{hex_string, MessageKind, MessageSet, MessageValue};
use crate::protocol::packet::{encode_frame, format_timestamp, Packet, TIMESTAMP_FORMAT};
use crate::session::SessionEvent;

pub const EXPORT_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Persisted packet record. Field names are deliberately terse; the
/// format is not part of the wire contract and readers must tolerate
/// unknown or missing fields.
#[derive(Serialize, Deserialize, Debug, Default, Clone)]
pub struct PacketRecord {
    #[serde(default)]
    pub t: String,
    #[serde(default)]
    pub s: String,
    #[serde(default)]
    pub sr: String,
    #[serde(default)]
    pub d: String,
    #[serde(default)]
    pub dr: String,
    #[serde(default)]
    pub pt: u8,
    #[serde(default)]
    pub ptn: String,
    #[serde(default)]
    pub dt: u8,
    #[serde(default)]
    pub dtn: String,
    #[serde(default)]
    pub pn: u8,
    #[serde(default)]
    pub pv: u8,
    #[serde(default)]
    pub rc: u8,
    #[serde(default)]
    pub m: Vec<MessageRecord>,
    #[serde(default)]
    pub rd: Vec<u8>,
    #[serde(default)]
    pub rdh: String,
}

#[derive(Serialize, Deserialize, Debug, Default, Clone)]
pub struct MessageRecord {
    #[serde(default)]
    pub mn: u16,
    #[serde(default)]
    pub mnh: String,
    #[serde(default)]
    pub mt: u8,
    #[serde(default)]
    pub mtn: String,
    #[serde(default)]
    pub v: i64,
    #[serde(default)]
    pub rv: String,
    #[serde(default)]
    pub n: String,
}

#[derive(Serialize, Deserialize, Debug, Default)]
pub struct Envelope {
    #[serde(default)]
    pub v: u32,
    #[serde(default)]
    pub ts: String,
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub p: Vec<PacketRecord>,
}

impl MessageRecord {
    pub fn from_message(msg: &MessageSet) -> Self {
        Self {
            mn: msg.number,
            mnh: format!("{:04x}", msg.number),
            mt: msg.kind().to_raw(),
            mtn: msg.kind().name().to_string(),
            v: msg.value.raw(),
            rv: msg.readable(),
            n: msg.name().to_string(),
        }
    }

    fn to_message(&self) -> MessageSet {
        // the wire shape is a function of the number; a disagreeing `mt`
        // field loses
        let value = match MessageKind::of(self.mn) {
            MessageKind::Enum => MessageValue::Enum(self.v as u8),
            MessageKind::Variable => MessageValue::Variable(self.v as i16),
            MessageKind::LongVariable => MessageValue::LongVariable(self.v as i32),
            MessageKind::Structure => MessageValue::Structure(parse_hex_string(&self.rv)),
        };
        MessageSet::new(self.mn, value)
    }
}

impl PacketRecord {
    pub fn from_packet(packet: &Packet) -> Self {
        Self {
            t: format_timestamp(packet.timestamp),
            s: packet.source.to_string(),
            sr: packet.source.describe(),
            d: packet.destination.to_string(),
            dr: packet.destination.describe(),
            pt: packet.command.packet_type_raw(),
            ptn: packet.command.packet_type_name(),
            dt: packet.command.data_type_raw(),
            dtn: packet.command.data_type_name(),
            pn: packet.command.packet_number,
            pv: packet.command.protocol_version,
            rc: packet.command.retry_count,
            m: packet.messages.iter().map(MessageRecord::from_message).collect(),
            rd: packet.raw_frame.to_vec(),
            rdh: hex_string(&packet.raw_frame),
        }
    }

    /// Rebuild a packet from its semantic fields. When the record lacks
    /// raw bytes the frame is re-encoded, so loaded packets always carry
    /// a well-formed `raw_frame`.
    pub fn to_packet(&self) -> Option<Packet> {
        let source = Address::from_str(&self.s).ok()?;
        let destination = Address::from_str(&self.d).ok()?;

        let command = Command {
            packet_information: false,
            protocol_version: self.pv & 0x03,
            retry_count: self.rc & 0x03,
            packet_type: catch_all::<PacketType>(self.pt & 0x0f),
            data_type: catch_all::<DataType>(self.dt & 0x0f),
            packet_number: self.pn,
        };

        let messages: Vec<MessageSet> = self.m.iter().map(MessageRecord::to_message).collect();

        let raw_frame = if self.rd.is_empty() {
            Bytes::from(encode_frame(source, destination, command, &messages).ok()?)
        } else {
            Bytes::from(self.rd.clone())
        };

        let timestamp = PrimitiveDateTime::parse(&self.t, TIMESTAMP_FORMAT)
            .map(|dt| dt.assume_utc())
            .unwrap_or(OffsetDateTime::UNIX_EPOCH);

        Some(Packet {
            source,
            destination,
            command,
            messages,
            raw_frame,
            timestamp,
        })
    }
}

fn catch_all<E>(value: u8) -> EnumCatchAll<E>
where
    E: PrimitiveEnum<Primitive = u8>,
{
    match E::from_primitive(value) {
        Some(e) => EnumCatchAll::Enum(e),
        None => EnumCatchAll::CatchAll(value),
    }
}

fn parse_hex_string(s: &str) -> Vec<u8> {
    s.split_whitespace()
        .filter_map(|pair| u8::from_str_radix(pair, 16).ok())
        .collect()
}

/// Write the history to `path` as a versioned envelope.
pub fn save_packets(path: &Path, packets: &[Arc<Packet>]) -> Result<(), ExportError> {
    let envelope = Envelope {
        v: EXPORT_VERSION,
        ts: format_timestamp(OffsetDateTime::now_utc()),
        total: packets.len() as u64,
        p: packets.iter().map(|p| PacketRecord::from_packet(p)).collect(),
    };

    fs::write(path, serde_json::to_vec(&envelope)?)?;
    Ok(())
}

/// Load a persisted envelope, in order. Records that cannot be
/// reconstructed are skipped with a warning rather than failing the
/// whole file.
pub fn load_packets(path: &Path) -> Result<Vec<Packet>, ExportError> {
    let envelope: Envelope = serde_json::from_slice(&fs::read(path)?)?;

    if envelope.v > EXPORT_VERSION {
        warn!(version = envelope.v, "export is newer than this reader");
    }

    let mut packets = Vec::with_capacity(envelope.p.len());
    for (index, record) in envelope.p.iter().enumerate() {
        match record.to_packet() {
            Some(packet) => packets.push(packet),
            None => warn!(index, "skipping unreadable packet record"),
        }
    }

    Ok(packets)
}

// -- push surface ------------------------------------------------------

/// Per-packet payload on the push channel, long-name form of
/// `PacketRecord`.
#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct PacketJson {
    pub timestamp: String,
    pub source: String,
    pub source_name: String,
    pub destination: String,
    pub destination_name: String,
    pub packet_type: u8,
    pub packet_type_name: String,
    pub data_type: u8,
    pub data_type_name: String,
    pub packet_number: u8,
    pub protocol_version: u8,
    pub retry_count: u8,
    pub messages: Vec<MessageJson>,
    pub raw_data: Vec<u8>,
    pub raw_data_hex: String,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct MessageJson {
    pub message_number: u16,
    pub message_number_hex: String,
    pub message_type: u8,
    pub message_type_name: String,
    pub value: i64,
    pub readable_value: String,
    pub name: String,
}

impl PacketJson {
    pub fn from_packet(packet: &Packet) -> Self {
        Self {
            timestamp: format_timestamp(packet.timestamp),
            source: packet.source.to_string(),
            source_name: packet.source.describe(),
            destination: packet.destination.to_string(),
            destination_name: packet.destination.describe(),
            packet_type: packet.command.packet_type_raw(),
            packet_type_name: packet.command.packet_type_name(),
            data_type: packet.command.data_type_raw(),
            data_type_name: packet.command.data_type_name(),
            packet_number: packet.command.packet_number,
            protocol_version: packet.command.protocol_version,
            retry_count: packet.command.retry_count,
            messages: packet
                .messages
                .iter()
                .map(|m| MessageJson {
                    message_number: m.number,
                    message_number_hex: format!("{:04x}", m.number),
                    message_type: m.kind().to_raw(),
                    message_type_name: m.kind().name().to_string(),
                    value: m.value.raw(),
                    readable_value: m.readable(),
                    name: m.name().to_string(),
                })
                .collect(),
            raw_data: packet.raw_frame.to_vec(),
            raw_data_hex: hex_string(&packet.raw_frame),
        }
    }
}

/// Event envelope pushed to attached clients.
#[derive(Serialize, Debug)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PushEvent {
    Init {
        #[serde(rename = "viewMode")]
        view_mode: bool,
        packets: Vec<PacketJson>,
    },
    Packet {
        data: PacketJson,
    },
    History {
        packets: Vec<PacketJson>,
    },
}

impl From<&SessionEvent> for PushEvent {
    fn from(event: &SessionEvent) -> Self {
        match event {
            SessionEvent::Init { view_mode, packets } => PushEvent::Init {
                view_mode: *view_mode,
                packets: packets.iter().map(|p| PacketJson::from_packet(p)).collect(),
            },
            SessionEvent::Packet(packet) => PushEvent::Packet {
                data: PacketJson::from_packet(packet),
            },
            SessionEvent::History(packets) => PushEvent::History {
                packets: packets.iter().map(|p| PacketJson::from_packet(p)).collect(),
            },
        }
    }
}
