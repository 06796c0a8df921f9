//! Autonomous QSO sequencer, one per decoder-app instance.
//!
//! The sequencer consumes decodes for its instance, matches the standard
//! exchange pattern, and emits transmit intents. All transitions run on a
//! single task; a state timeout is armed on entry and disarmed on exit.
//! Exactly one terminal event is published per started QSO.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::LinkError;
use crate::types::{BusEvent, DecodeReport, TelemetryEvent};

pub const DEFAULT_STATE_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_MAX_RETRIES: u32 = 3;

#[derive(Debug, Clone)]
pub struct QsoConfig {
    pub my_call: String,
    pub target_call: String,
    pub my_grid: String,
    pub state_timeout: Duration,
    pub max_retries: u32,
}

impl QsoConfig {
    pub fn new(my_call: &str, target_call: &str, my_grid: &str) -> Self {
        Self {
            my_call: my_call.to_string(),
            target_call: target_call.to_string(),
            my_grid: my_grid.to_string(),
            state_timeout: DEFAULT_STATE_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QsoState {
    Idle,
    Calling,
    WaitingReply,
    SendingReport,
    WaitingReport,
    SendingConfirm,
    WaitingFinal,
    Complete,
    Failed,
}

impl QsoState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, QsoState::Complete | QsoState::Failed)
    }
}

/// One transmission request. Replying to a matched decode is preferred
/// where one exists: it arms the decoder app's own sequencer. Retries fall
/// back to literal text.
#[derive(Debug, Clone, PartialEq)]
pub enum TxIntent {
    Reply { decode: DecodeReport },
    Text { message: String },
}

/// A running (or finished) QSO attempt.
pub struct QsoHandle {
    state: Arc<Mutex<QsoState>>,
    task: JoinHandle<()>,
}

impl QsoHandle {
    pub fn state(&self) -> QsoState {
        *self.state.lock()
    }

    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    /// Hard-cancel on shutdown; no terminal event is produced.
    pub fn abort(&self) {
        self.task.abort();
    }
}

/// Start the sequencer for one instance.
///
/// `decodes` is the telemetry stream (filtered here by instance id),
/// `intents` receives transmissions to realize, `bus` gets the terminal
/// event.
pub fn start(
    instance_id: String,
    cfg: QsoConfig,
    decodes: broadcast::Receiver<TelemetryEvent>,
    intents: mpsc::Sender<TxIntent>,
    bus: broadcast::Sender<BusEvent>,
) -> QsoHandle {
    let state = Arc::new(Mutex::new(QsoState::Idle));
    let task = tokio::spawn(run(instance_id, cfg, decodes, intents, bus, state.clone()));
    QsoHandle { state, task }
}

enum Wait {
    Matched(DecodeReport),
    TimedOut,
    Lost,
}

async fn run(
    instance_id: String,
    cfg: QsoConfig,
    mut decodes: broadcast::Receiver<TelemetryEvent>,
    intents: mpsc::Sender<TxIntent>,
    bus: broadcast::Sender<BusEvent>,
    state: Arc<Mutex<QsoState>>,
) {
    info!(instance_id, target = %cfg.target_call, "qso started");
    let outcome = sequence(&instance_id, &cfg, &mut decodes, &intents, &state).await;
    let terminal = match outcome {
        Ok(()) => {
            *state.lock() = QsoState::Complete;
            info!(instance_id, target = %cfg.target_call, "qso complete");
            BusEvent::QsoComplete {
                instance_id: instance_id.clone(),
                target_call: cfg.target_call.clone(),
            }
        }
        Err(e) => {
            *state.lock() = QsoState::Failed;
            let reason = failure_reason(e);
            info!(instance_id, target = %cfg.target_call, reason, "qso failed");
            BusEvent::QsoFailed {
                instance_id: instance_id.clone(),
                target_call: cfg.target_call.clone(),
                reason,
            }
        }
    };
    let _ = bus.send(terminal);
}

/// Map a terminal error to the short reason carried by `qso-failed`.
fn failure_reason(e: LinkError) -> String {
    match e {
        LinkError::QsoMaxRetries => "max_retries".to_string(),
        LinkError::QsoTimeout => "timeout".to_string(),
        other => other.to_string(),
    }
}

/// The exchange proper. `Ok(())` is a completed contact, `Err` a terminal
/// failure.
async fn sequence(
    instance_id: &str,
    cfg: &QsoConfig,
    decodes: &mut broadcast::Receiver<TelemetryEvent>,
    intents: &mpsc::Sender<TxIntent>,
    state: &Mutex<QsoState>,
) -> Result<(), LinkError> {
    let my = &cfg.my_call;
    let them = &cfg.target_call;

    // ---- call phase -------------------------------------------------
    let mut attempts = 0u32;
    let answer = loop {
        if attempts >= cfg.max_retries {
            return Err(LinkError::QsoMaxRetries);
        }
        attempts += 1;
        *state.lock() = QsoState::Calling;
        send_intent(intents, TxIntent::Text { message: format!("CQ {} {}", my, cfg.my_grid) })
            .await?;
        *state.lock() = QsoState::WaitingReply;
        match wait_for(decodes, instance_id, cfg.state_timeout, |d| {
            is_directed(&d.raw_text, my, them)
        })
        .await
        {
            Wait::Matched(d) => break d,
            Wait::TimedOut => {
                debug!(instance_id, attempts, "no answer to CQ");
            }
            Wait::Lost => return Err(LinkError::QsoTimeout),
        }
    };

    // our report for them is the SNR we decoded them at
    let report = format_report(answer.snr_db);

    // ---- report phase -----------------------------------------------
    let mut fresh = Some(answer);
    let mut attempts = 0u32;
    let rogered = loop {
        if attempts >= cfg.max_retries {
            return Err(LinkError::QsoMaxRetries);
        }
        attempts += 1;
        *state.lock() = QsoState::SendingReport;
        let intent = match fresh.take() {
            Some(decode) => TxIntent::Reply { decode },
            None => TxIntent::Text { message: format!("{them} {my} {report}") },
        };
        send_intent(intents, intent).await?;
        *state.lock() = QsoState::WaitingReport;
        match wait_for(decodes, instance_id, cfg.state_timeout, |d| {
            is_directed(&d.raw_text, my, them) && trailing_report(&d.raw_text).is_some()
        })
        .await
        {
            Wait::Matched(d) => break d,
            Wait::TimedOut => {
                debug!(instance_id, attempts, "report not acknowledged");
            }
            Wait::Lost => return Err(LinkError::QsoTimeout),
        }
    };

    // ---- confirm phase ----------------------------------------------
    let mut fresh = Some(rogered);
    let mut attempts = 0u32;
    loop {
        if attempts >= cfg.max_retries {
            // the peer acknowledged our report already; treat a silent
            // final as a made contact rather than failing the whole QSO
            return Ok(());
        }
        attempts += 1;
        *state.lock() = QsoState::SendingConfirm;
        let intent = match fresh.take() {
            Some(decode) => TxIntent::Reply { decode },
            None => TxIntent::Text { message: format!("{them} {my} RR73") },
        };
        send_intent(intents, intent).await?;
        *state.lock() = QsoState::WaitingFinal;
        match wait_for(decodes, instance_id, cfg.state_timeout, |d| {
            is_directed(&d.raw_text, my, them) && is_final(&d.raw_text)
        })
        .await
        {
            Wait::Matched(_) => return Ok(()),
            Wait::TimedOut => {
                debug!(instance_id, attempts, "no final acknowledgement");
            }
            Wait::Lost => return Err(LinkError::QsoTimeout),
        }
    }
}

async fn send_intent(intents: &mpsc::Sender<TxIntent>, intent: TxIntent) -> Result<(), LinkError> {
    intents
        .send(intent)
        .await
        .map_err(|_| LinkError::Protocol("transmit intent sink closed".to_string()))
}

/// Wait for the first decode of our instance matching `pred`, bounded by
/// the state timeout. First match in arrival order wins; later matches in
/// the same cycle are ignored by construction.
async fn wait_for(
    decodes: &mut broadcast::Receiver<TelemetryEvent>,
    instance_id: &str,
    timeout: Duration,
    pred: impl Fn(&DecodeReport) -> bool,
) -> Wait {
    let deadline = Instant::now() + timeout;
    loop {
        tokio::select! {
            event = decodes.recv() => match event {
                Ok(TelemetryEvent::Decode(d)) if d.instance_id == instance_id && pred(&d) => {
                    return Wait::Matched(d);
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!(instance_id, lagged = n, "decode stream lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return Wait::Lost,
            },
            _ = tokio::time::sleep_until(deadline) => return Wait::TimedOut,
        }
    }
}

/// `<my> <them> ...` directed at us from the station we are working.
pub fn is_directed(text: &str, my_call: &str, their_call: &str) -> bool {
    let mut tokens = text.split_whitespace();
    match (tokens.next(), tokens.next()) {
        (Some(a), Some(b)) => calls_match(a, my_call) && calls_match(b, their_call),
        _ => false,
    }
}

/// Final acknowledgement: a trailing 73 or RR73.
pub fn is_final(text: &str) -> bool {
    text.split_whitespace()
        .skip(2)
        .any(|t| t.eq_ignore_ascii_case("73") || t.eq_ignore_ascii_case("RR73"))
}

/// Signal report anywhere in the trailing tokens: `[+-]\d{1,2}`, with an
/// optional leading `R` (rogered report).
pub fn trailing_report(text: &str) -> Option<i32> {
    for token in text.split_whitespace().skip(2) {
        let t = token.strip_prefix(['R', 'r']).unwrap_or(token);
        let Some(digits) = t.strip_prefix(['+', '-']) else { continue };
        if (1..=2).contains(&digits.len()) && digits.bytes().all(|b| b.is_ascii_digit()) {
            if let Ok(v) = t.parse::<i32>() {
                return Some(v);
            }
        }
    }
    None
}

/// Case-insensitive callsign comparison, ignoring a short portable suffix
/// (`/P`, `/M`, `/MM`, `/QRP`, ...).
pub fn calls_match(a: &str, b: &str) -> bool {
    base_call(a).eq_ignore_ascii_case(base_call(b))
}

fn base_call(call: &str) -> &str {
    match call.rsplit_once('/') {
        Some((base, suffix)) if !base.is_empty() && (1..=3).contains(&suffix.len()) => base,
        _ => call,
    }
}

/// `+NN` / `-NN` with a forced sign and two digits.
pub fn format_report(snr_db: i32) -> String {
    format!("{:+03}", snr_db.clamp(-99, 99))
}
