use std::fmt;

use packed_struct::prelude::*;

#[derive(PrimitiveEnum_u8, Debug, Copy, Clone, PartialEq, Eq)]
pub enum PacketType {
    StandBy = 0,
    Normal = 1,
    Gathering = 2,
    Install = 3,
    Download = 4,
}

#[derive(PrimitiveEnum_u8, Debug, Copy, Clone, PartialEq, Eq)]
pub enum DataType {
    Undefined = 0,
    Read = 1,
    Write = 2,
    Request = 3,
    Notification = 4,
    Response = 5,
    Ack = 6,
    Nack = 7,
}

/// The 3-byte bit-packed command header.
///
/// Byte 0 carries the information flag, protocol version and retry count
/// (bits 2..0 are reserved), byte 1 packs the packet type into the high
/// nibble and the data type into the low nibble, byte 2 is the rolling
/// packet number. Nibble values outside the known enumerations are kept
/// as-is via the catch-all.
#[derive(PackedStruct, Debug, Copy, Clone, PartialEq)]
#[packed_struct(bit_numbering = "msb0", size_bytes = "3")]
pub struct Command {
    #[packed_field(bits = "0")]
    pub packet_information: bool,

    #[packed_field(bits = "1:2")]
    pub protocol_version: u8,

    #[packed_field(bits = "3:4")]
    pub retry_count: u8,

    #[packed_field(bits = "8:11", ty = "enum")]
    pub packet_type: EnumCatchAll<PacketType>,

    #[packed_field(bits = "12:15", ty = "enum")]
    pub data_type: EnumCatchAll<DataType>,

    #[packed_field(bytes = "2")]
    pub packet_number: u8,
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} #{}",
            self.packet_type_name(),
            self.data_type_name(),
            self.packet_number
        )
    }
}

impl Command {
    pub fn new(packet_type: PacketType, data_type: DataType, packet_number: u8) -> Self {
        Self {
            packet_information: true,
            protocol_version: 0,
            retry_count: 0,
            packet_type: EnumCatchAll::Enum(packet_type),
            data_type: EnumCatchAll::Enum(data_type),
            packet_number,
        }
    }

    pub fn packet_type_raw(&self) -> u8 {
        self.packet_type.to_primitive()
    }

    pub fn data_type_raw(&self) -> u8 {
        self.data_type.to_primitive()
    }

    pub fn packet_type_name(&self) -> String {
        match self.packet_type {
            EnumCatchAll::Enum(t) => format!("{t:?}"),
            EnumCatchAll::CatchAll(_) => "Unknown".to_string(),
        }
    }

    /// Enumerant spelling of the data type, used in packet signatures.
    pub fn data_type_name(&self) -> String {
        match self.data_type {
            EnumCatchAll::Enum(t) => format!("{t:?}"),
            EnumCatchAll::CatchAll(_) => "Unknown".to_string(),
        }
    }
}
