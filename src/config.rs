//! JSON configuration document.
//!
//! Every key has a default, unknown keys are ignored, and the `MODE`,
//! `FLEX_HOST` and `RIG_NAME` environment variables override their JSON
//! counterparts after parsing.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::types::{CAT_BASE_PORT, RADIO_PORT, TELEMETRY_PORT};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum RunMode {
    #[serde(rename = "STANDARD")]
    Standard,
    #[serde(rename = "FLEX")]
    Flex,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub mode: RunMode,
    pub wsjtx: WsjtxConfig,
    pub station: StationConfig,
    pub standard: StandardConfig,
    pub flex: FlexConfig,
    pub dashboard: DashboardConfig,
    pub web: WebConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WsjtxConfig {
    /// Decoder-app binary; bare name resolves through PATH.
    pub path: PathBuf,
    pub telemetry_port: u16,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StationConfig {
    pub callsign: String,
    pub grid: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StandardConfig {
    pub rig_name: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FlexConfig {
    pub host: String,
    pub port: u16,
    pub cat_base_port: u16,
    /// Dial frequencies offered to operators when retuning, in Hz.
    pub default_bands: Vec<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DashboardConfig {
    pub station_lifetime_s: u64,
    pub snr_weak_threshold: i32,
    pub snr_strong_threshold: i32,
    pub adif_log_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    pub port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: RunMode::Flex,
            wsjtx: WsjtxConfig::default(),
            station: StationConfig::default(),
            standard: StandardConfig::default(),
            flex: FlexConfig::default(),
            dashboard: DashboardConfig::default(),
            web: WebConfig::default(),
        }
    }
}

impl Default for WsjtxConfig {
    fn default() -> Self {
        Self { path: PathBuf::from("wsjtx"), telemetry_port: TELEMETRY_PORT }
    }
}

impl Default for StationConfig {
    fn default() -> Self {
        Self { callsign: String::new(), grid: String::new() }
    }
}

impl Default for StandardConfig {
    fn default() -> Self {
        Self { rig_name: "slicelink".into() }
    }
}

impl Default for FlexConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: RADIO_PORT,
            cat_base_port: CAT_BASE_PORT,
            default_bands: vec![7_074_000, 14_074_000, 21_074_000],
        }
    }
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            station_lifetime_s: 300,
            snr_weak_threshold: -15,
            snr_strong_threshold: 0,
            adif_log_path: None,
        }
    }
}

impl Default for WebConfig {
    fn default() -> Self {
        Self { port: 8080 }
    }
}

impl Config {
    /// Load from a JSON file (missing file means all defaults), then apply
    /// process environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut cfg = match path {
            Some(p) if p.exists() => {
                let raw = std::fs::read_to_string(p)
                    .with_context(|| format!("reading config {}", p.display()))?;
                serde_json::from_str(&raw)
                    .with_context(|| format!("parsing config {}", p.display()))?
            }
            _ => Config::default(),
        };
        cfg.apply_env(|key| std::env::var(key).ok());
        Ok(cfg)
    }

    /// Environment overrides, injectable for tests.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(mode) = var("MODE") {
            match mode.to_ascii_uppercase().as_str() {
                "STANDARD" => self.mode = RunMode::Standard,
                "FLEX" => self.mode = RunMode::Flex,
                other => tracing::warn!(mode = other, "unrecognized MODE override ignored"),
            }
        }
        if let Some(host) = var("FLEX_HOST") {
            self.flex.host = host;
        }
        if let Some(rig) = var("RIG_NAME") {
            self.standard.rig_name = rig;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults_when_keys_missing() {
        let cfg: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.mode, RunMode::Flex);
        assert_eq!(cfg.flex.cat_base_port, CAT_BASE_PORT);
        assert_eq!(cfg.wsjtx.telemetry_port, TELEMETRY_PORT);
        assert_eq!(cfg.web.port, 8080);
    }

    #[test]
    fn unknown_keys_ignored_known_keys_parsed() {
        let raw = r#"{
            "mode": "STANDARD",
            "wsjtx": { "path": "/opt/wsjtx/bin/wsjtx" },
            "station": { "callsign": "W1ABC", "grid": "FN20" },
            "flex": { "host": "10.0.0.7", "cat_base_port": 60001, "default_bands": [14074000] },
            "dashboard": { "snr_weak_threshold": -18, "adif_log_path": "/tmp/log.adi" },
            "web": { "port": 9090 },
            "experimental": { "anything": true }
        }"#;
        let cfg: Config = serde_json::from_str(raw).unwrap();
        assert_eq!(cfg.mode, RunMode::Standard);
        assert_eq!(cfg.station.callsign, "W1ABC");
        assert_eq!(cfg.flex.host, "10.0.0.7");
        assert_eq!(cfg.flex.cat_base_port, 60001);
        assert_eq!(cfg.flex.default_bands, vec![14_074_000]);
        assert_eq!(cfg.dashboard.snr_weak_threshold, -18);
        assert_eq!(cfg.web.port, 9090);
        // section defaults still fill the gaps
        assert_eq!(cfg.dashboard.station_lifetime_s, 300);
    }

    #[test]
    fn environment_overrides_win() {
        let mut cfg = Config::default();
        cfg.apply_env(|key| match key {
            "MODE" => Some("standard".into()),
            "FLEX_HOST" => Some("flex.local".into()),
            "RIG_NAME" => Some("bench-rig".into()),
            _ => None,
        });
        assert_eq!(cfg.mode, RunMode::Standard);
        assert_eq!(cfg.flex.host, "flex.local");
        assert_eq!(cfg.standard.rig_name, "bench-rig");
        // a junk MODE leaves the mode untouched
        cfg.apply_env(|key| (key == "MODE").then(|| "SIDEWAYS".into()));
        assert_eq!(cfg.mode, RunMode::Standard);
    }
}
