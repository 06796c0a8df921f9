//! Operator/tool control surface.
//!
//! Line-delimited JSON on stdin, one JSON reply per request on stdout.
//! Each operation maps 1:1 onto a coordinator method; failures come back
//! synchronously with a short reason instead of an exception or a closed
//! stream.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::coordinator::Coordinator;
use crate::types::{DecodeReport, Mode};

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Request {
    StartInstance { slice: usize },
    StopInstance { instance_id: String },
    ExecuteQso { instance_id: String, target_call: String },
    HaltTx { instance_id: String, #[serde(default)] auto_only: bool },
    SetFrequency { instance_id: String, frequency_hz: u64 },
    SetMode { instance_id: String, mode: String },
    ReplyToStation { instance_id: String, decode: DecodeParams },
    EmergencyStop,
    ListInstances,
    ListSlices,
    ListBands,
}

/// Decode coordinates the caller picked off the dashboard.
#[derive(Debug, Deserialize)]
struct DecodeParams {
    time_ms: u32,
    snr_db: i32,
    dt_seconds: f64,
    df_hz: u32,
    #[serde(default = "default_mode")]
    mode: String,
    message: String,
}

fn default_mode() -> String {
    "~".to_string()
}

#[derive(Debug, Serialize)]
pub struct Response {
    pub ok: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl Response {
    fn ok(message: impl Into<String>) -> Self {
        Self { ok: true, message: message.into(), data: None }
    }

    fn err(message: impl ToString) -> Self {
        Self { ok: false, message: message.to_string(), data: None }
    }
}

/// Dispatch one request line.
pub async fn handle_line(coord: &Coordinator, line: &str) -> Response {
    let request: Request = match serde_json::from_str(line) {
        Ok(r) => r,
        Err(e) => return Response::err(format!("bad request: {e}")),
    };
    debug!(?request, "control request");
    match request {
        Request::StartInstance { slice } => match coord.start_instance(slice).await {
            Ok(id) => Response::ok(format!("launched {id}")),
            Err(e) => Response::err(e),
        },
        Request::StopInstance { instance_id } => match coord.stop_instance(&instance_id).await {
            Ok(()) => Response::ok(format!("stopped {instance_id}")),
            Err(e) => Response::err(e),
        },
        Request::ExecuteQso { instance_id, target_call } => {
            match coord.execute_qso(&instance_id, &target_call) {
                Ok(()) => Response::ok(format!("qso with {target_call} started")),
                Err(e) => Response::err(e),
            }
        }
        Request::HaltTx { instance_id, auto_only } => {
            match coord.halt_tx(&instance_id, auto_only).await {
                Ok(()) => Response::ok("transmit halted"),
                Err(e) => Response::err(e),
            }
        }
        Request::SetFrequency { instance_id, frequency_hz } => {
            match coord.set_frequency(&instance_id, frequency_hz).await {
                Ok(()) => Response::ok(format!("tuned to {frequency_hz} Hz")),
                Err(e) => Response::err(e),
            }
        }
        Request::SetMode { instance_id, mode } => {
            match coord.set_mode(&instance_id, Mode::from_backend(&mode)).await {
                Ok(()) => Response::ok(format!("mode set to {mode}")),
                Err(e) => Response::err(e),
            }
        }
        Request::ReplyToStation { instance_id, decode } => {
            let report = DecodeReport {
                instance_id: instance_id.clone(),
                is_new: true,
                time_ms: decode.time_ms,
                snr_db: decode.snr_db,
                dt_seconds: decode.dt_seconds,
                df_hz: decode.df_hz,
                mode: decode.mode,
                raw_text: decode.message,
                low_confidence: false,
            };
            match coord.reply_to_station(&instance_id, &report).await {
                Ok(()) => Response::ok("reply queued"),
                Err(e) => Response::err(e),
            }
        }
        Request::EmergencyStop => match coord.emergency_stop().await {
            Ok(()) => Response::ok("all transmit halted"),
            Err(e) => Response::err(e),
        },
        Request::ListInstances => {
            let list = coord.list_instances();
            Response {
                ok: true,
                message: format!("{} instance(s)", list.len()),
                data: serde_json::to_value(list).ok(),
            }
        }
        Request::ListSlices => {
            let slices: Vec<serde_json::Value> = coord
                .list_slices()
                .iter()
                .map(|s| {
                    serde_json::json!({
                        "index": s.index,
                        "frequency_hz": s.frequency_hz,
                        "mode": s.mode.as_backend(),
                        "transmit": s.transmit,
                        "dax_channel": s.dax_channel,
                        "instance_id": s.instance_id,
                    })
                })
                .collect();
            Response {
                ok: true,
                message: format!("{} slice(s)", slices.len()),
                data: Some(serde_json::Value::Array(slices)),
            }
        }
        Request::ListBands => Response {
            ok: true,
            message: "configured band plan".into(),
            data: serde_json::to_value(coord.band_plan()).ok(),
        },
    }
}

/// Serve requests from stdin until EOF or shutdown.
pub async fn run_stdio(coord: Arc<Coordinator>, mut shutdown: watch::Receiver<bool>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    info!("control surface reading stdin");
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    let response = handle_line(&coord, &line).await;
                    let mut payload = serde_json::to_string(&response)
                        .unwrap_or_else(|_| r#"{"ok":false,"message":"encode failure"}"#.into());
                    payload.push('\n');
                    if stdout.write_all(payload.as_bytes()).await.is_err() {
                        return;
                    }
                    let _ = stdout.flush().await;
                }
                Ok(None) => {
                    info!("control stream closed");
                    return;
                }
                Err(e) => {
                    debug!(error = %e, "control read failed");
                    return;
                }
            },
            _ = shutdown.changed() => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn requests_parse() {
        let r: Request = serde_json::from_str(r#"{"op":"start_instance","slice":0}"#).unwrap();
        assert!(matches!(r, Request::StartInstance { slice: 0 }));
        let r: Request = serde_json::from_str(
            r#"{"op":"execute_qso","instance_id":"Slice-A","target_call":"DL1XYZ"}"#,
        )
        .unwrap();
        assert!(matches!(r, Request::ExecuteQso { .. }));
        let r: Request =
            serde_json::from_str(r#"{"op":"halt_tx","instance_id":"Slice-A"}"#).unwrap();
        match r {
            Request::HaltTx { auto_only, .. } => assert!(!auto_only),
            other => panic!("unexpected {other:?}"),
        }
        let r: Request = serde_json::from_str(
            r#"{"op":"reply_to_station","instance_id":"Slice-A",
                "decode":{"time_ms":1000,"snr_db":-7,"dt_seconds":0.2,"df_hz":1500,
                          "message":"CQ DL1XYZ JO62"}}"#,
        )
        .unwrap();
        match r {
            Request::ReplyToStation { decode, .. } => assert_eq!(decode.mode, "~"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(serde_json::from_str::<Request>(r#"{"op":"sudo"}"#).is_err());
    }

    #[test]
    fn responses_serialize_compactly() {
        let json = serde_json::to_string(&Response::ok("done")).unwrap();
        assert_eq!(json, r#"{"ok":true,"message":"done"}"#);
        let json = serde_json::to_string(&Response::err("no such instance: X")).unwrap();
        assert_eq!(json, r#"{"ok":false,"message":"no such instance: X"}"#);
    }
}
