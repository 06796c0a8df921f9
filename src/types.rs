//! Shared domain types: modes, slice rows, telemetry records, event enums.
use std::fmt;

/// Hard upper bound on simultaneous radio slices (SDR hardware limit).
pub const MAX_SLICES: usize = 8;

/// Default UDP port the decoder app sends telemetry to.
pub const TELEMETRY_PORT: u16 = 2237;

/// Default TCP port of the radio backend (also its discovery broadcast port).
pub const RADIO_PORT: u16 = 4992;

/// Default base port for per-slice CAT listeners.
pub const CAT_BASE_PORT: u16 = 7809;

/// Operating mode of a slice. Unknown backend strings pass through untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    Lsb,
    Usb,
    Cw,
    Cwr,
    Fm,
    Am,
    Rtty,
    Digu,
    Digl,
    Other(String),
}

impl Mode {
    /// Parse a backend mode token (case-insensitive).
    pub fn from_backend(s: &str) -> Self {
        match s.to_ascii_uppercase().as_str() {
            "LSB" => Mode::Lsb,
            "USB" => Mode::Usb,
            "CW" => Mode::Cw,
            "CWR" => Mode::Cwr,
            "FM" => Mode::Fm,
            "AM" => Mode::Am,
            "RTTY" => Mode::Rtty,
            "DIGU" => Mode::Digu,
            "DIGL" => Mode::Digl,
            _ => Mode::Other(s.to_string()),
        }
    }

    /// Canonical backend token.
    pub fn as_backend(&self) -> &str {
        match self {
            Mode::Lsb => "LSB",
            Mode::Usb => "USB",
            Mode::Cw => "CW",
            Mode::Cwr => "CWR",
            Mode::Fm => "FM",
            Mode::Am => "AM",
            Mode::Rtty => "RTTY",
            Mode::Digu => "DIGU",
            Mode::Digl => "DIGL",
            Mode::Other(s) => s.as_str(),
        }
    }

    /// TS-2000 mode digit for CAT replies. Data modes reuse the RTTY/FSK digits.
    pub fn ts2000_digit(&self) -> char {
        match self {
            Mode::Lsb => '1',
            Mode::Usb => '2',
            Mode::Cw => '3',
            Mode::Fm => '4',
            Mode::Am => '5',
            Mode::Rtty | Mode::Digl => '6',
            Mode::Cwr => '7',
            Mode::Digu => '9',
            Mode::Other(_) => '2',
        }
    }

    /// Interpret a TS-2000 mode digit coming in over CAT.
    ///
    /// A bare USB/LSB digit while a data mode is active keeps the data
    /// flavor: decoder apps poke `MD2;` without meaning to leave DIGU.
    pub fn from_ts2000_digit(d: char, current: &Mode) -> Option<Mode> {
        let is_data = matches!(current, Mode::Digu | Mode::Digl);
        Some(match d {
            '1' | '2' if is_data => current.clone(),
            '1' => Mode::Lsb,
            '2' => Mode::Usb,
            '3' => Mode::Cw,
            '4' => Mode::Fm,
            '5' => Mode::Am,
            '6' => Mode::Digl,
            '7' => Mode::Cwr,
            '9' => Mode::Digu,
            _ => return None,
        })
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_backend())
    }
}

/// One row of the slice table.
#[derive(Debug, Clone, PartialEq)]
pub struct Slice {
    pub index: usize,
    pub frequency_hz: u64,
    pub mode: Mode,
    pub transmit: bool,
    pub in_use: bool,
    /// DAX audio channel (1-based); derived from the index when absent.
    pub dax_channel: u8,
    /// Decoder-app instance bound to this slice, when one is running.
    pub instance_id: Option<String>,
}

impl Slice {
    pub fn empty(index: usize) -> Self {
        Self {
            index,
            frequency_hz: 0,
            mode: Mode::Usb,
            transmit: false,
            in_use: false,
            dax_channel: (index as u8) + 1,
            instance_id: None,
        }
    }

    /// Instance id convention: slice 0 -> "Slice-A", slice 1 -> "Slice-B", ...
    pub fn derived_instance_id(index: usize) -> String {
        let letter = (b'A' + (index as u8 % 26)) as char;
        format!("Slice-{letter}")
    }
}

/// Partial update pushed by the radio backend for one slice.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SliceDelta {
    pub frequency_hz: Option<u64>,
    pub mode: Option<Mode>,
    pub in_use: Option<bool>,
    pub transmit: Option<bool>,
    pub dax_channel: Option<u8>,
}

impl SliceDelta {
    pub fn is_empty(&self) -> bool {
        *self == SliceDelta::default()
    }
}

/// Store notifications, in the order the store produced them.
#[derive(Debug, Clone)]
pub enum SliceEvent {
    /// `in_use` went false -> true; carries the post-merge state.
    Added(Slice),
    /// Any mutation; carries the post-merge state.
    Updated(Slice),
    /// `in_use` went true -> false; carries the prior state.
    Removed(Slice),
}

/// A single decode pushed by a decoder-app instance. Not stored by the core.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodeReport {
    pub instance_id: String,
    pub is_new: bool,
    pub time_ms: u32,
    pub snr_db: i32,
    pub dt_seconds: f64,
    pub df_hz: u32,
    pub mode: String,
    pub raw_text: String,
    pub low_confidence: bool,
}

/// Periodic status snapshot from a decoder-app instance.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusReport {
    pub instance_id: String,
    pub dial_frequency_hz: u64,
    pub mode: String,
    pub dx_call: String,
    pub report: String,
    pub tx_mode: String,
    pub tx_enabled: bool,
    pub transmitting: bool,
    pub decoding: bool,
    pub rx_df_hz: u32,
    pub tx_df_hz: u32,
    pub de_call: String,
    pub de_grid: String,
    pub dx_grid: String,
}

/// Typed telemetry dispatched by the UDP listener.
#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryEvent {
    Heartbeat { instance_id: String },
    Status(StatusReport),
    Decode(DecodeReport),
    Close { instance_id: String },
}

impl TelemetryEvent {
    pub fn instance_id(&self) -> &str {
        match self {
            TelemetryEvent::Heartbeat { instance_id } => instance_id,
            TelemetryEvent::Status(s) => &s.instance_id,
            TelemetryEvent::Decode(d) => &d.instance_id,
            TelemetryEvent::Close { instance_id } => instance_id,
        }
    }
}

/// Mutations requested by a CAT peer; the coordinator mirrors them to the backend.
#[derive(Debug, Clone, PartialEq)]
pub enum CatEvent {
    FrequencyChange { index: usize, hz: u64 },
    ModeChange { index: usize, mode: Mode },
    PttChange { index: usize, on: bool },
}

/// Dashboard bus events. The core publishes; dashboards only consume.
#[derive(Debug, Clone)]
pub enum BusEvent {
    Decode(DecodeReport),
    Status(StatusReport),
    InstanceLaunched { instance_id: String },
    InstanceStopped { instance_id: String },
    SliceUpdated { slice: Slice },
    QsoComplete { instance_id: String, target_call: String },
    QsoFailed { instance_id: String, target_call: String, reason: String },
}
