//! Ham Radio Deluxe dialects.
//!
//! Dialect B is `\r`-terminated lowercase text (`get frequency`,
//! `set frequency-hz 14074000`, ...). Dialect C wraps the same grammar in
//! the HRD v5 binary frame: little-endian `total_len, magic1, magic2,
//! checksum`, then a null-terminated UTF-16LE command string.

use tracing::debug;

use super::CatHandle;
use crate::types::Mode;

pub const HRD_MAGIC1: u32 = 0x1234_ABCD;
pub const HRD_MAGIC2: u32 = 0xABCD_1234;

/// Fixed header: total_len + magic1 + magic2 + checksum.
pub const HRD_HEADER_LEN: usize = 16;

const NAK: &str = "ERROR";

/// Handle one dialect-B request line (terminator already stripped).
pub fn handle_request(line: &str, cat: &CatHandle) -> String {
    let mut line = line.trim();
    // a leading "[context] " routes multi-radio setups; single radio here
    if line.starts_with('[') {
        if let Some(end) = line.find(']') {
            line = line[end + 1..].trim_start();
        }
    }
    let lower = line.to_ascii_lowercase();
    let words: Vec<&str> = lower.split_whitespace().collect();
    match words.as_slice() {
        ["get", "frequency"] => cat.frequency().to_string(),
        ["get", "frequencies"] => {
            let hz = cat.frequency();
            format!("{hz}-{hz}")
        }
        ["set", "frequency-hz", hz] => match hz.parse::<u64>() {
            Ok(hz) => ack(cat.set_frequency(hz)),
            Err(_) => NAK.to_string(),
        },
        ["set", "frequencies-hz", rx, _tx] => match rx.parse::<u64>() {
            Ok(hz) => ack(cat.set_frequency(hz)),
            Err(_) => NAK.to_string(),
        },
        ["get", "mode"] => cat.mode().as_backend().to_string(),
        ["set", "dropdown", "mode", ..] => {
            // the mode name is the original-case tail of the request
            match line.split_whitespace().nth(3) {
                Some(name) => ack(cat.set_mode(Mode::from_backend(name))),
                None => NAK.to_string(),
            }
        }
        ["get", "button-select", "tx"] => (cat.transmit() as u8).to_string(),
        ["set", "button-select", "tx", v @ ("0" | "1")] => ack(cat.set_ptt(*v == "1")),
        ["get", "radios"] => format!("1:{}", cat.rig_name),
        ["get", "radio"] => cat.rig_name.clone(),
        ["get", "id"] => "Ham Radio Deluxe".to_string(),
        ["get", "version"] => "v5.24.0.38".to_string(),
        ["get", "context"] => "1".to_string(),
        ["set", "context", ..] => "OK".to_string(),
        ["get", "vfo-count"] => "1".to_string(),
        ["get", "ptt"] => (cat.transmit() as u8).to_string(),
        _ => {
            debug!(slice = cat.index, line, "unrecognized HRD request");
            NAK.to_string()
        }
    }
}

fn ack(accepted: bool) -> String {
    if accepted {
        "OK".to_string()
    } else {
        NAK.to_string()
    }
}

/// Pull one complete binary frame off the front of `buf`.
///
/// Returns the decoded command and the number of bytes consumed, or `None`
/// while the frame is still incomplete. A frame with an implausible length
/// or the wrong magics yields an empty command so the caller can NAK it.
pub fn decode_frame(buf: &[u8]) -> Option<(Result<String, ()>, usize)> {
    if buf.len() < 4 {
        return None;
    }
    let total = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if !(HRD_HEADER_LEN..=65535).contains(&total) {
        // unrecoverable framing; report one malformed unit covering the buffer
        return Some((Err(()), buf.len()));
    }
    if buf.len() < total {
        return None;
    }
    let m1 = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
    let m2 = u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]);
    if !(is_hrd_magic(m1) && is_hrd_magic(m2)) {
        return Some((Err(()), total));
    }
    let units: Vec<u16> = buf[HRD_HEADER_LEN..total]
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .take_while(|&u| u != 0)
        .collect();
    let cmd: String = char::decode_utf16(units)
        .map(|r| r.unwrap_or(char::REPLACEMENT_CHARACTER))
        .collect();
    Some((Ok(cmd), total))
}

/// Frame a response the way the peer framed its request.
pub fn encode_frame(response: &str) -> Vec<u8> {
    let units: Vec<u16> = response.encode_utf16().chain(std::iter::once(0)).collect();
    let total = HRD_HEADER_LEN + units.len() * 2;
    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(&(total as u32).to_le_bytes());
    out.extend_from_slice(&HRD_MAGIC1.to_le_bytes());
    out.extend_from_slice(&HRD_MAGIC2.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes());
    for u in units {
        out.extend_from_slice(&u.to_le_bytes());
    }
    out
}

pub fn is_hrd_magic(v: u32) -> bool {
    v == HRD_MAGIC1 || v == HRD_MAGIC2 || v == HRD_MAGIC1.swap_bytes() || v == HRD_MAGIC2.swap_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cat::test_support::test_handle;
    use crate::types::Mode;
    use pretty_assertions::assert_eq;

    #[test]
    fn get_and_set_frequency() {
        let (cat, _rx) = test_handle(1, 14_074_000, Mode::Digu);
        assert_eq!(handle_request("get frequency", &cat), "14074000");
        assert_eq!(handle_request("set frequency-hz 14076000", &cat), "OK");
        assert_eq!(handle_request("get frequency", &cat), "14076000");
        assert_eq!(handle_request("set frequencies-hz 7074000 7074000", &cat), "OK");
        assert_eq!(cat.frequency(), 7_074_000);
        assert_eq!(handle_request("set frequency-hz banana", &cat), "ERROR");
    }

    #[test]
    fn context_prefix_is_stripped() {
        let (cat, _rx) = test_handle(1, 14_074_000, Mode::Digu);
        assert_eq!(handle_request("[1] get frequency", &cat), "14074000");
    }

    #[test]
    fn mode_and_ptt_verbs() {
        let (cat, _rx) = test_handle(1, 14_074_000, Mode::Digu);
        assert_eq!(handle_request("get mode", &cat), "DIGU");
        assert_eq!(handle_request("set dropdown mode USB", &cat), "OK");
        assert_eq!(cat.mode(), Mode::Usb);
        assert_eq!(handle_request("get button-select tx", &cat), "0");
        assert_eq!(handle_request("set button-select tx 1", &cat), "OK");
        assert!(cat.transmit());
        assert_eq!(handle_request("get button-select tx", &cat), "1");
        assert_eq!(handle_request("set button-select tx 0", &cat), "OK");
        assert!(!cat.transmit());
    }

    #[test]
    fn identity_verbs() {
        let (cat, _rx) = test_handle(1, 14_074_000, Mode::Digu);
        assert_eq!(handle_request("get radios", &cat), "1:Slice-B");
        assert_eq!(handle_request("get id", &cat), "Ham Radio Deluxe");
        assert_eq!(handle_request("get context", &cat), "1");
        assert_eq!(handle_request("bogus verb", &cat), "ERROR");
    }

    #[test]
    fn binary_frame_round_trip() {
        let frame = encode_frame("get frequency");
        assert_eq!(frame.len() as u32, u32::from_le_bytes(frame[0..4].try_into().unwrap()));
        let (cmd, used) = decode_frame(&frame).unwrap();
        assert_eq!(cmd.unwrap(), "get frequency");
        assert_eq!(used, frame.len());
    }

    #[test]
    fn partial_frame_waits_for_more() {
        let frame = encode_frame("get mode");
        assert!(decode_frame(&frame[..3]).is_none());
        assert!(decode_frame(&frame[..frame.len() - 2]).is_none());
    }

    #[test]
    fn bad_magic_yields_malformed_unit() {
        let mut frame = encode_frame("get mode");
        frame[4..8].copy_from_slice(&0xDEAD_BEEFu32.to_le_bytes());
        let (cmd, used) = decode_frame(&frame).unwrap();
        assert!(cmd.is_err());
        assert_eq!(used, frame.len());
    }

    #[test]
    fn alternate_byte_order_magics_decode() {
        // magics arrive byte-swapped from some HRD builds
        let mut frame = Vec::new();
        let cmd: Vec<u16> = "get id".encode_utf16().chain(std::iter::once(0)).collect();
        let total = HRD_HEADER_LEN + cmd.len() * 2;
        frame.extend_from_slice(&(total as u32).to_le_bytes());
        frame.extend_from_slice(&[0xCD, 0xAB, 0x34, 0x12]);
        frame.extend_from_slice(&[0x34, 0x12, 0xCD, 0xAB]);
        frame.extend_from_slice(&0u32.to_le_bytes());
        for u in &cmd {
            frame.extend_from_slice(&u.to_le_bytes());
        }
        let (decoded, used) = decode_frame(&frame).unwrap();
        assert_eq!(decoded.unwrap(), "get id");
        assert_eq!(used, total);
    }
}
