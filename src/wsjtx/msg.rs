//! Framed telemetry messages exchanged with decoder-app instances.
//!
//! Inbound datagrams carry heartbeat/status/decode/close reports; outbound
//! frames carry the commands that drive an instance (reply, free text,
//! halt-tx, configure, ...). Both directions share the header
//! `magic, schema, type, id` except RigControl, which has no id.

use super::qt::{CodecError, QtReader, QtWriter};
use crate::types::{DecodeReport, StatusReport, TelemetryEvent};

pub const MAGIC: u32 = 0xADBC_CBDA;
pub const SCHEMA: u32 = 2;

/// "No change" sentinel for numeric Configure fields.
pub const NO_CHANGE: u32 = 0xFFFF_FFFF;

pub const TYPE_HEARTBEAT: u32 = 0;
pub const TYPE_STATUS: u32 = 1;
pub const TYPE_DECODE: u32 = 2;
pub const TYPE_CLEAR: u32 = 3;
pub const TYPE_REPLY: u32 = 4;
pub const TYPE_CLOSE: u32 = 6;
pub const TYPE_HALT_TX: u32 = 8;
pub const TYPE_FREE_TEXT: u32 = 9;
pub const TYPE_LOCATION: u32 = 11;
pub const TYPE_RIG_CONTROL: u32 = 12;
pub const TYPE_HIGHLIGHT: u32 = 13;
pub const TYPE_CONFIGURE: u32 = 15;

/// RGBA64 color record inside a HighlightCallsign frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Color {
    pub a: u16,
    pub r: u16,
    pub g: u16,
    pub b: u16,
}

impl Color {
    pub const fn rgb(r: u16, g: u16, b: u16) -> Self {
        Self { a: u16::MAX, r, g, b }
    }

    fn write(&self, w: &mut QtWriter) {
        // spec byte 1 = RGB64 color, then a/r/g/b and a pad word
        w.u8(1).u16(self.a).u16(self.r).u16(self.g).u16(self.b).u16(0);
    }
}

/// Outbound command for one decoder-app instance.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Clear a window: 0 = band activity, 1 = rx frequency, 2 = both.
    Clear { window: u8 },
    /// Reply to a decode. `modifiers` 0x02 arms the app's own TX sequencer.
    Reply {
        time_ms: u32,
        snr_db: i32,
        dt_seconds: f64,
        df_hz: u32,
        mode: String,
        message: String,
        low_confidence: bool,
        modifiers: u8,
    },
    HaltTx { auto_only: bool },
    FreeText { text: String, send: bool },
    Location { grid: String },
    /// Short-header frame: no instance id on the wire.
    RigControl { freq_hz: i64, mode: String },
    HighlightCallsign {
        call: String,
        background: Color,
        foreground: Color,
        highlight_last: bool,
    },
    Configure(Configure),
}

/// Configure frame. Numeric `NO_CHANGE` and empty strings leave the
/// corresponding app setting untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct Configure {
    pub mode: String,
    pub frequency_tolerance: u32,
    pub submode: String,
    pub fast_mode: bool,
    pub tr_period_s: u32,
    pub rx_df_hz: u32,
    pub dx_call: String,
    pub dx_grid: String,
    pub generate_messages: bool,
}

impl Default for Configure {
    fn default() -> Self {
        Self {
            mode: String::new(),
            frequency_tolerance: NO_CHANGE,
            submode: String::new(),
            fast_mode: false,
            tr_period_s: NO_CHANGE,
            rx_df_hz: NO_CHANGE,
            dx_call: String::new(),
            dx_grid: String::new(),
            generate_messages: false,
        }
    }
}

impl Command {
    fn msg_type(&self) -> u32 {
        match self {
            Command::Clear { .. } => TYPE_CLEAR,
            Command::Reply { .. } => TYPE_REPLY,
            Command::HaltTx { .. } => TYPE_HALT_TX,
            Command::FreeText { .. } => TYPE_FREE_TEXT,
            Command::Location { .. } => TYPE_LOCATION,
            Command::RigControl { .. } => TYPE_RIG_CONTROL,
            Command::HighlightCallsign { .. } => TYPE_HIGHLIGHT,
            Command::Configure(_) => TYPE_CONFIGURE,
        }
    }

    /// Encode one command frame addressed to `instance_id`.
    pub fn encode(&self, instance_id: &str) -> Vec<u8> {
        let mut w = QtWriter::new();
        w.u32(MAGIC).u32(SCHEMA).u32(self.msg_type());
        if !matches!(self, Command::RigControl { .. }) {
            w.string(instance_id);
        }
        match self {
            Command::Clear { window } => {
                w.u8(*window);
            }
            Command::Reply {
                time_ms,
                snr_db,
                dt_seconds,
                df_hz,
                mode,
                message,
                low_confidence,
                modifiers,
            } => {
                w.u32(*time_ms)
                    .i32(*snr_db)
                    .f64(*dt_seconds)
                    .u32(*df_hz)
                    .string(mode)
                    .string(message)
                    .bool(*low_confidence)
                    .u8(*modifiers);
            }
            Command::HaltTx { auto_only } => {
                w.bool(*auto_only);
            }
            Command::FreeText { text, send } => {
                w.string(text).bool(*send);
            }
            Command::Location { grid } => {
                w.string(grid);
            }
            Command::RigControl { freq_hz, mode } => {
                w.i64(*freq_hz).string(mode);
            }
            Command::HighlightCallsign {
                call,
                background,
                foreground,
                highlight_last,
            } => {
                w.string(call);
                background.write(&mut w);
                foreground.write(&mut w);
                w.bool(*highlight_last);
            }
            Command::Configure(c) => {
                w.string(&c.mode)
                    .u32(c.frequency_tolerance)
                    .string(&c.submode)
                    .bool(c.fast_mode)
                    .u32(c.tr_period_s)
                    .u32(c.rx_df_hz)
                    .string(&c.dx_call)
                    .string(&c.dx_grid)
                    .bool(c.generate_messages);
            }
        }
        w.into_inner()
    }
}

/// Parse one inbound datagram.
///
/// `Ok(None)` is a recognized frame of a type the core ignores; errors are
/// drops the listener counts. Status tails beyond the fields we consume are
/// tolerated in either direction: extra bytes are ignored, missing
/// optional fields fall back to defaults.
pub fn decode_datagram(buf: &[u8]) -> Result<Option<TelemetryEvent>, CodecError> {
    let mut r = QtReader::new(buf);
    let magic = r.u32()?;
    if magic != MAGIC {
        return Err(CodecError::BadMagic(magic));
    }
    let _schema = r.u32()?;
    let msg_type = r.u32()?;
    let instance_id = r.string()?;

    match msg_type {
        TYPE_HEARTBEAT => Ok(Some(TelemetryEvent::Heartbeat { instance_id })),
        TYPE_STATUS => Ok(Some(TelemetryEvent::Status(parse_status(instance_id, &mut r)?))),
        TYPE_DECODE => Ok(Some(TelemetryEvent::Decode(parse_decode(instance_id, &mut r)?))),
        TYPE_CLOSE => Ok(Some(TelemetryEvent::Close { instance_id })),
        _ => Ok(None),
    }
}

fn parse_status(instance_id: String, r: &mut QtReader<'_>) -> Result<StatusReport, CodecError> {
    let mut s = StatusReport {
        instance_id,
        dial_frequency_hz: r.u64()?,
        mode: r.string()?,
        ..Default::default()
    };
    // Everything past the mode is optional on the wire: older app builds
    // truncate here, newer ones append fields we never look at.
    s.dx_call = r.string().unwrap_or_default();
    s.report = r.string().unwrap_or_default();
    s.tx_mode = r.string().unwrap_or_default();
    s.tx_enabled = r.bool().unwrap_or(false);
    s.transmitting = r.bool().unwrap_or(false);
    s.decoding = r.bool().unwrap_or(false);
    s.rx_df_hz = r.u32().unwrap_or(0);
    s.tx_df_hz = r.u32().unwrap_or(0);
    s.de_call = r.string().unwrap_or_default();
    s.de_grid = r.string().unwrap_or_default();
    s.dx_grid = r.string().unwrap_or_default();
    Ok(s)
}

fn parse_decode(instance_id: String, r: &mut QtReader<'_>) -> Result<DecodeReport, CodecError> {
    Ok(DecodeReport {
        instance_id,
        is_new: r.bool()?,
        time_ms: r.u32()?,
        snr_db: r.i32()?,
        dt_seconds: r.f64()?,
        df_hz: r.u32()?,
        mode: r.string()?,
        raw_text: r.string()?,
        // trailing flags are optional on older app builds
        low_confidence: if r.remaining() > 0 { r.bool()? } else { false },
    })
}
