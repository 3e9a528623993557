use std::fmt;
use std::str::FromStr;

use packed_struct::prelude::*;
use strum_macros::EnumIter;
use thiserror::Error;

/// Device class of a bus address, the first of its three bytes.
///
/// Codes not in this table appear on some installations; they decode fine
/// and render as `Unknown`.
#[derive(PrimitiveEnum_u8, EnumIter, Debug, Copy, Clone, PartialEq, Eq)]
pub enum AddressClass {
    Outdoor = 0x10,
    Htu = 0x11,
    Indoor = 0x20,
    Erv = 0x30,
    Diffuser = 0x35,
    Mcu = 0x38,
    Rmc = 0x40,
    WiredRemote = 0x50,
    Pim = 0x58,
    Sim = 0x59,
    Peak = 0x5a,
    PowerDivider = 0x5b,
    OnOffController = 0x60,
    WiFiKit = 0x62,
    Mim = 0x63,
    CentralController = 0x65,
    Dms = 0x6a,
    JigTester = 0x80,
    BroadcastSelfLayer = 0xb0,
    BroadcastControlLayer = 0xb1,
    BroadcastSetLayer = 0xb2,
    BroadcastControlAndSetLayer = 0xb3,
    BroadcastModuleLayer = 0xb4,
    BroadcastCsm = 0xb7,
    BroadcastLocalLayer = 0xb8,
    BroadcastCsml = 0xbf,
    Undefined = 0xff,
}

impl fmt::Display for AddressClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AddressClass::Outdoor => "Outdoor",
            AddressClass::Htu => "HTU",
            AddressClass::Indoor => "Indoor",
            AddressClass::Erv => "ERV",
            AddressClass::Diffuser => "Diffuser",
            AddressClass::Mcu => "MCU",
            AddressClass::Rmc => "RMC",
            AddressClass::WiredRemote => "WiredRemote",
            AddressClass::Pim => "PIM",
            AddressClass::Sim => "SIM",
            AddressClass::Peak => "Peak",
            AddressClass::PowerDivider => "PowerDivider",
            AddressClass::OnOffController => "OnOffController",
            AddressClass::WiFiKit => "WiFiKit",
            AddressClass::Mim => "MIM",
            AddressClass::CentralController => "CentralController",
            AddressClass::Dms => "DMS",
            AddressClass::JigTester => "JIGTester",
            AddressClass::BroadcastSelfLayer => "BroadcastSelfLayer",
            AddressClass::BroadcastControlLayer => "BroadcastControlLayer",
            AddressClass::BroadcastSetLayer => "BroadcastSetLayer",
            AddressClass::BroadcastControlAndSetLayer => "BroadcastControlAndSetLayer",
            AddressClass::BroadcastModuleLayer => "BroadcastModuleLayer",
            AddressClass::BroadcastCsm => "BroadcastCSM",
            AddressClass::BroadcastLocalLayer => "BroadcastLocalLayer",
            AddressClass::BroadcastCsml => "BroadcastCSML",
            AddressClass::Undefined => "Undefined",
        };
        f.write_str(name)
    }
}

/// A 3-byte bus address: class, channel, node.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Address {
    pub class: u8,
    pub channel: u8,
    pub node: u8,
}

impl Address {
    pub fn new(class: u8, channel: u8, node: u8) -> Self {
        Self {
            class,
            channel,
            node,
        }
    }

    pub fn decode(bytes: &[u8; 3]) -> Self {
        Self {
            class: bytes[0],
            channel: bytes[1],
            node: bytes[2],
        }
    }

    pub fn encode(&self) -> [u8; 3] {
        [self.class, self.channel, self.node]
    }

    pub fn class_kind(&self) -> Option<AddressClass> {
        AddressClass::from_primitive(self.class)
    }

    /// The 0xB0..=0xBF classes address layers rather than single nodes.
    pub fn is_broadcast(&self) -> bool {
        matches!(self.class, 0xb0..=0xbf)
    }

    /// Class name for display; `Unknown` for codes outside the table.
    pub fn class_name(&self) -> String {
        match self.class_kind() {
            Some(class) => class.to_string(),
            None => "Unknown".to_string(),
        }
    }

    /// Human form, e.g. `Indoor(20.00.00)`.
    pub fn describe(&self) -> String {
        format!("{}({})", self.class_name(), self)
    }
}

/// Dotted upper-case hex, e.g. `20.00.00`.
impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02X}.{:02X}.{:02X}",
            self.class, self.channel, self.node
        )
    }
}

#[derive(Error, Debug)]
#[error("invalid address {0:?}, expected CC.HH.NN hex form")]
pub struct AddressParseError(String);

impl FromStr for Address {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('.');

        let mut next = || {
            parts
                .next()
                .and_then(|p| u8::from_str_radix(p, 16).ok())
                .ok_or_else(|| AddressParseError(s.to_string()))
        };

        let (class, channel, node) = (next()?, next()?, next()?);
        if parts.next().is_some() {
            return Err(AddressParseError(s.to_string()));
        }

        Ok(Address::new(class, channel, node))
    }
}

#[cfg(test)]
mod tests {
    use strum::IntoEnumIterator;

    use super::*;

    #[test]
    fn dotted_hex_display() {
        let addr = Address::new(0x20, 0x00, 0x4f);
        assert_eq!(addr.to_string(), "20.00.4F");
        assert_eq!(addr.describe(), "Indoor(20.00.4F)");
    }

    #[test]
    fn unknown_class_renders_unknown() {
        let addr = Address::new(0x99, 0x01, 0x02);
        assert_eq!(addr.class_name(), "Unknown");
        assert_eq!(addr.describe(), "Unknown(99.01.02)");
    }

    #[test]
    fn class_codes_round_trip() {
        for class in AddressClass::iter() {
            let code = class.to_primitive();
            assert_eq!(AddressClass::from_primitive(code), Some(class));
        }
    }

    #[test]
    fn encode_decode_round_trip() {
        let addr = Address::new(0x50, 0x12, 0x34);
        assert_eq!(Address::decode(&addr.encode()), addr);
    }

    #[test]
    fn parse_dotted_form() {
        let addr: Address = "B0.FF.00".parse().unwrap();
        assert_eq!(addr, Address::new(0xb0, 0xff, 0x00));

        assert!("20.00".parse::<Address>().is_err());
        assert!("20.00.00.00".parse::<Address>().is_err());
        assert!("zz.00.00".parse::<Address>().is_err());
    }
}
