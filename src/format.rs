use std::sync::Arc;

use colored::{ColoredString, Colorize};

use crate::protocol::address::AddressClass;
use crate::protocol::packet::{format_timestamp, Packet};
use crate::session::PacketSink;

/// One-line human rendering of a decoded packet.
pub fn format_packet(packet: &Packet) -> String {
    let messages = if packet.messages.is_empty() {
        "-".to_string()
    } else {
        packet
            .messages
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    };

    format!(
        "[{}] {: <18} -> {: <18} {}: {}",
        format_timestamp(packet.timestamp),
        packet.source.describe(),
        packet.destination.describe(),
        packet.command,
        messages
    )
}

/// Colour a packet line by who is talking.
pub fn coloured(packet: &Packet, line: String) -> ColoredString {
    use AddressClass::*;

    if packet.destination.is_broadcast() {
        return line.on_blue().bright_white();
    }

    match packet.source.class_kind() {
        Some(Outdoor) => line.on_cyan().bright_white(),
        Some(Indoor) => line.on_green().bright_white(),
        Some(WiredRemote) => line.on_purple().bright_white(),
        Some(CentralController | OnOffController | Dms | WiFiKit) => {
            line.on_magenta().bright_white()
        }
        _ => line.normal(),
    }
}

/// Session sink that prints every published packet to stdout.
pub struct ConsoleSink {
    colour: bool,
}

impl ConsoleSink {
    pub fn new(colour: bool) -> Self {
        Self { colour }
    }
}

impl PacketSink for ConsoleSink {
    fn on_packet(&self, packet: &Arc<Packet>) {
        let line = format_packet(packet);
        if self.colour {
            println!("{}", coloured(packet, line));
        } else {
            println!("{line}");
        }
    }
}
