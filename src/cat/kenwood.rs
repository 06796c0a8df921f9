//! Kenwood TS-2000 ASCII dialect (dialect A).
//!
//! Commands and replies are `;`-terminated ASCII. Query forms return a
//! value; set forms return nothing. A malformed command gets no reply and
//! the connection stays open.

use tracing::debug;

use super::CatHandle;
use crate::types::Mode;

/// Radio identity the decoder app probes before trusting the rig.
const RADIO_ID: &str = "ID019;";

/// Handle one `;`-stripped command. `None` means nothing is written back.
pub fn handle_command(cmd: &str, cat: &CatHandle) -> Option<String> {
    let cmd = cmd.trim();
    if cmd.len() < 2 || !cmd.is_ascii() {
        return None;
    }
    let (token, rest) = cmd.split_at(2);
    match token {
        "FA" | "FB" => frequency(token, rest, cat),
        "IF" if rest.is_empty() => Some(status_line(cat)),
        "MD" => mode(rest, cat),
        "TX" => {
            cat.set_ptt(true);
            None
        }
        "RX" => {
            cat.set_ptt(false);
            None
        }
        "TQ" if rest.is_empty() => {
            Some(format!("TQ{};", cat.transmit() as u8))
        }
        "ID" if rest.is_empty() => Some(RADIO_ID.to_string()),
        "PS" if rest.is_empty() => Some("PS1;".to_string()),
        "AI" if rest.is_empty() => Some("AI0;".to_string()),
        "FR" if rest.len() <= 1 => Some("FR0;".to_string()),
        "FT" if rest.len() <= 1 => Some("FT0;".to_string()),
        "SP" if rest.is_empty() => Some("SP0;".to_string()),
        "SM" if rest.len() <= 1 => Some("SM00000;".to_string()),
        "RS" if rest.is_empty() => Some("RS0;".to_string()),
        // dsp/front-end probes the decoder app issues once at startup;
        // fixed neutral values, sets are accepted and dropped
        "AG" if rest.len() <= 1 => Some("AG0000;".to_string()),
        "NB" if rest.is_empty() => Some("NB0;".to_string()),
        "NR" if rest.is_empty() => Some("NR0;".to_string()),
        "RA" if rest.is_empty() => Some("RA0000;".to_string()),
        "PA" if rest.is_empty() => Some("PA00;".to_string()),
        "RT" if rest.is_empty() => Some("RT0;".to_string()),
        "XT" if rest.is_empty() => Some("XT0;".to_string()),
        "AN" if rest.is_empty() => Some("AN0;".to_string()),
        "FL" if rest.is_empty() => Some("FL000000;".to_string()),
        "FW" if rest.is_empty() => Some("FW0000;".to_string()),
        "SH" if rest.is_empty() => Some("SH00;".to_string()),
        "SL" if rest.is_empty() => Some("SL00;".to_string()),
        "VX" if rest.is_empty() => Some("VX0;".to_string()),
        "AI" | "AG" | "NB" | "NR" | "RA" | "PA" | "RT" | "XT" | "AN" | "FL" | "FW" | "SH"
        | "SL" | "VX" | "SM" | "FR" | "FT" | "SP" => None,
        _ => {
            debug!(slice = cat.index, cmd, "unrecognized CAT command");
            None
        }
    }
}

fn frequency(token: &str, rest: &str, cat: &CatHandle) -> Option<String> {
    if rest.is_empty() {
        // both VFO queries answer from the one slice frequency
        return Some(format!("{token}{:011};", cat.frequency()));
    }
    if rest.len() <= 11 && rest.bytes().all(|b| b.is_ascii_digit()) {
        if let Ok(hz) = rest.parse::<u64>() {
            cat.set_frequency(hz);
        }
    }
    None
}

fn mode(rest: &str, cat: &CatHandle) -> Option<String> {
    if rest.is_empty() {
        return Some(format!("MD{};", cat.mode().ts2000_digit()));
    }
    let digit = rest.chars().next()?;
    if let Some(mode) = Mode::from_ts2000_digit(digit, &cat.mode()) {
        cat.set_mode(mode);
    }
    None
}

/// `IF` status line. The decoder app parses this by column, so the width
/// is fixed: `IF` + freq(11) + 5 spaces + `+00000000` + tx + mode + `0000  ;`.
fn status_line(cat: &CatHandle) -> String {
    format!(
        "IF{:011}     +00000000{}{}0000  ;",
        cat.frequency(),
        cat.transmit() as u8,
        cat.mode().ts2000_digit(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cat::test_support::test_handle;
    use crate::types::Mode;
    use pretty_assertions::assert_eq;

    #[test]
    fn frequency_query_is_zero_padded_to_eleven() {
        let (cat, _rx) = test_handle(0, 14_074_000, Mode::Digu);
        assert_eq!(handle_command("FA", &cat), Some("FA00014074000;".into()));
        assert_eq!(handle_command("FB", &cat), Some("FB00014074000;".into()));
    }

    #[test]
    fn frequency_set_updates_store_and_stays_silent() {
        let (cat, mut rx) = test_handle(0, 14_074_000, Mode::Digu);
        assert_eq!(handle_command("FA00014076000", &cat), None);
        assert_eq!(cat.frequency(), 14_076_000);
        assert!(rx.try_recv().is_ok());
        // immediate re-read is consistent
        assert_eq!(handle_command("FA", &cat), Some("FA00014076000;".into()));
    }

    #[test]
    fn mode_set_preserves_data_flavor() {
        let (cat, _rx) = test_handle(0, 14_074_000, Mode::Digu);
        assert_eq!(handle_command("MD2", &cat), None);
        assert_eq!(cat.mode(), Mode::Digu);
        assert_eq!(handle_command("MD", &cat), Some("MD9;".into()));
        assert_eq!(handle_command("MD3", &cat), None);
        assert_eq!(cat.mode(), Mode::Cw);
    }

    #[test]
    fn if_response_has_exact_width() {
        let (cat, _rx) = test_handle(0, 14_074_000, Mode::Digu);
        let line = handle_command("IF", &cat).unwrap();
        assert_eq!(line, "IF00014074000     +00000000090000  ;");
        assert_eq!(line.len(), 36);
        assert_eq!(&line[2..13], "00014074000");
        assert_eq!(&line[13..18], "     ");
        assert_eq!(&line[18..27], "+00000000");
        assert_eq!(&line[27..28], "0"); // not transmitting
        assert_eq!(&line[28..29], "9"); // DIGU
        assert_eq!(&line[29..], "0000  ;");
    }

    #[test]
    fn tx_rx_toggle_ptt() {
        let (cat, _rx) = test_handle(0, 14_074_000, Mode::Usb);
        handle_command("TX", &cat);
        assert!(cat.transmit());
        assert_eq!(handle_command("TQ", &cat), Some("TQ1;".into()));
        handle_command("RX", &cat);
        assert!(!cat.transmit());
        assert_eq!(handle_command("TQ", &cat), Some("TQ0;".into()));
    }

    #[test]
    fn identity_and_probe_commands() {
        let (cat, _rx) = test_handle(0, 14_074_000, Mode::Usb);
        assert_eq!(handle_command("ID", &cat), Some("ID019;".into()));
        assert_eq!(handle_command("PS", &cat), Some("PS1;".into()));
        assert_eq!(handle_command("AI", &cat), Some("AI0;".into()));
        assert_eq!(handle_command("SM0", &cat), Some("SM00000;".into()));
    }

    #[test]
    fn malformed_commands_get_no_reply() {
        let (cat, _rx) = test_handle(0, 14_074_000, Mode::Usb);
        assert_eq!(handle_command("Q", &cat), None);
        assert_eq!(handle_command("ZZXX", &cat), None);
        assert_eq!(handle_command("FAxx", &cat), None);
        assert_eq!(cat.frequency(), 14_074_000);
    }
}
