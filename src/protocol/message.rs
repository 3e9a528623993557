use std::fmt;

/// Wire shape of a message record, encoded in bits 9-10 of its number.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MessageKind {
    Enum,
    Variable,
    LongVariable,
    Structure,
}

impl MessageKind {
    /// Derive the kind from a message number.
    pub fn of(number: u16) -> Self {
        match (number & 0x0600) >> 9 {
            0 => MessageKind::Enum,
            1 => MessageKind::Variable,
            2 => MessageKind::LongVariable,
            _ => MessageKind::Structure,
        }
    }

    pub fn to_raw(self) -> u8 {
        match self {
            MessageKind::Enum => 0,
            MessageKind::Variable => 1,
            MessageKind::LongVariable => 2,
            MessageKind::Structure => 3,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            MessageKind::Enum => "Enum",
            MessageKind::Variable => "Variable",
            MessageKind::LongVariable => "LongVariable",
            MessageKind::Structure => "Structure",
        }
    }
}

/// Decoded value of a message record. The raw wire bits are preserved;
/// the 16- and 32-bit shapes are signed big-endian two's complement.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MessageValue {
    Enum(u8),
    Variable(i16),
    LongVariable(i32),
    Structure(Vec<u8>),
}

impl MessageValue {
    pub fn kind(&self) -> MessageKind {
        match self {
            MessageValue::Enum(_) => MessageKind::Enum,
            MessageValue::Variable(_) => MessageKind::Variable,
            MessageValue::LongVariable(_) => MessageKind::LongVariable,
            MessageValue::Structure(_) => MessageKind::Structure,
        }
    }

    /// The kind-appropriate integer. Structures are opaque bytes and
    /// expose zero here; consumers wanting their content use the bytes.
    pub fn raw(&self) -> i64 {
        match self {
            MessageValue::Enum(v) => *v as i64,
            MessageValue::Variable(v) => *v as i64,
            MessageValue::LongVariable(v) => *v as i64,
            MessageValue::Structure(_) => 0,
        }
    }

    fn payload_len(&self) -> usize {
        match self {
            MessageValue::Enum(_) => 1,
            MessageValue::Variable(_) => 2,
            MessageValue::LongVariable(_) => 4,
            MessageValue::Structure(bytes) => bytes.len(),
        }
    }
}

/// One record of a packet's message list.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageSet {
    pub number: u16,
    pub value: MessageValue,
}

impl MessageSet {
    pub fn new(number: u16, value: MessageValue) -> Self {
        Self { number, value }
    }

    pub fn kind(&self) -> MessageKind {
        self.value.kind()
    }

    /// Symbolic name, or `UNKNOWN` for numbers outside the table.
    pub fn name(&self) -> &'static str {
        message_name(self.number).unwrap_or("UNKNOWN")
    }

    /// On-wire size: 2-byte number plus the kind's payload.
    pub fn wire_size(&self) -> usize {
        2 + self.value.payload_len()
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.number.to_be_bytes());
        match &self.value {
            MessageValue::Enum(v) => out.push(*v),
            MessageValue::Variable(v) => out.extend_from_slice(&v.to_be_bytes()),
            MessageValue::LongVariable(v) => out.extend_from_slice(&v.to_be_bytes()),
            MessageValue::Structure(bytes) => out.extend_from_slice(bytes),
        }
    }

    /// Heuristic human rendering; observational only, consumers wanting
    /// numbers use the value itself.
    pub fn readable(&self) -> String {
        let name = message_name(self.number).unwrap_or("").to_ascii_lowercase();

        if let MessageValue::Structure(bytes) = &self.value {
            return hex_string(bytes);
        }

        let raw = self.value.raw();

        if name.contains("temp") {
            return format!("{:.1}°C", raw as f64 / 10.0);
        }

        if name.contains("power") {
            let state = if raw != 0 { "ON" } else { "OFF" };
            return state.to_string();
        }

        match self.number {
            0x4001 => index_table(&["Auto", "Cool", "Dry", "Fan", "Heat"], raw),
            0x4006 | 0x4007 => index_table(&["Auto", "Low", "Mid", "High", "Turbo"], raw),
            _ => raw.to_string(),
        }
    }
}

impl fmt::Display for MessageSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match message_name(self.number) {
            Some(name) => write!(f, "{}={}", name, self.readable()),
            None => write!(f, "UNKNOWN({:04x})={}", self.number, self.readable()),
        }
    }
}

fn index_table(table: &[&'static str], raw: i64) -> String {
    usize::try_from(raw)
        .ok()
        .and_then(|i| table.get(i))
        .map(|s| s.to_string())
        .unwrap_or_else(|| format!("Unknown({raw})"))
}

pub fn hex_string(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Symbolic names of known message numbers. The set is the community
/// table for the NASA bus; anything else decodes as a raw value.
pub fn message_name(number: u16) -> Option<&'static str> {
    let name = match number {
        0x0608 => "STR_AD_DBCODE_MICOM_MAIN",
        0x24fb => "LVAR_AD_ADDRESS_MAIN",

        0x4000 => "ENUM_IN_OPERATION_POWER",
        0x4001 => "ENUM_IN_OPERATION_MODE",
        0x4002 => "ENUM_IN_OPERATION_MODE_REAL",
        0x4006 => "ENUM_IN_FAN_MODE",
        0x4007 => "ENUM_IN_FAN_MODE_REAL",
        0x4008 => "ENUM_IN_FAN_VENT_MODE",
        0x4011 => "ENUM_IN_LOUVER_HL_SWING",
        0x4028 => "ENUM_IN_STATE_THERMO",
        0x4038 => "ENUM_IN_STATE_HUMIDITY_PERCENT",
        0x4043 => "ENUM_IN_QUIET_MODE",
        0x4060 => "ENUM_IN_ALTERNATIVE_MODE",
        0x4065 => "ENUM_IN_WATER_HEATER_POWER",
        0x4066 => "ENUM_IN_WATER_HEATER_MODE",

        0x4201 => "VAR_IN_TEMP_TARGET_F",
        0x4203 => "VAR_IN_TEMP_ROOM_F",
        0x4205 => "VAR_IN_TEMP_EVA_IN_F",
        0x4206 => "VAR_IN_TEMP_EVA_OUT_F",
        0x4211 => "VAR_IN_CAPACITY_REQUEST",
        0x4212 => "VAR_IN_CAPACITY_ABSOLUTE",
        0x4217 => "VAR_IN_MODEL_INFORMATION",
        0x4235 => "VAR_IN_TEMP_WATER_HEATER_TARGET_F",
        0x4236 => "VAR_IN_TEMP_WATER_IN_F",
        0x4237 => "VAR_IN_TEMP_WATER_TANK_F",
        0x4238 => "VAR_IN_TEMP_WATER_OUT_F",

        0x4401 => "LVAR_IN_DEVICE_STAFF_ID",
        0x4619 => "STR_IN_INSTALL_INFO",

        0x8000 => "ENUM_OUT_OPERATION_SERVICE_OP",
        0x8001 => "ENUM_OUT_OPERATION_ODU_MODE",
        0x8003 => "ENUM_OUT_OPERATION_HEATCOOL",
        0x8010 => "ENUM_OUT_LOAD_COMP1",
        0x8011 => "ENUM_OUT_LOAD_HOTGAS",
        0x8017 => "ENUM_OUT_LOAD_4WAY",

        0x8204 => "VAR_OUT_SENSOR_AIRTEMP",
        0x8206 => "VAR_OUT_SENSOR_HIGHPRESS",
        0x8208 => "VAR_OUT_SENSOR_LOWPRESS",
        0x820a => "VAR_OUT_SENSOR_CT1",
        0x8217 => "VAR_OUT_SENSOR_TOP1",
        0x8235 => "VAR_OUT_ERROR_CODE",

        0x8411 => "LVAR_OUT_CONTROL_WATTMETER_1W_1MIN_SUM",
        0x8413 => "LVAR_OUT_CONTROL_WATTMETER_ALL_UNIT_ACCUM",
        0x8414 => "LVAR_OUT_CONTROL_WATTMETER_TOTAL_SUM",

        _ => return None,
    };

    Some(name)
}
