//! Per-instance decoder-app settings file.
//!
//! The coordinator pins each instance's CAT port, telemetry target and
//! audio device through the app's own INI. Files a user already edited
//! are merged key by key; unrelated sections and comments survive.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::info;

/// Everything the generated INI pins down for one instance.
#[derive(Debug, Clone)]
pub struct InstanceIni {
    pub rig_name: String,
    pub rig: String,
    pub cat_port: u16,
    pub udp_server: String,
    pub udp_port: u16,
    pub my_call: String,
    pub my_grid: String,
    pub sound_in: String,
    pub sound_out: String,
}

impl InstanceIni {
    /// Settings for a slice-bound instance: CAT on loopback, DAX audio
    /// channel matching the slice.
    pub fn for_slice(
        rig_name: &str,
        cat_port: u16,
        udp_port: u16,
        dax_channel: u8,
        my_call: &str,
        my_grid: &str,
    ) -> Self {
        Self {
            rig_name: rig_name.to_string(),
            rig: "Kenwood TS-2000".to_string(),
            cat_port,
            udp_server: "127.0.0.1".to_string(),
            udp_port,
            my_call: my_call.to_string(),
            my_grid: my_grid.to_string(),
            sound_in: format!("DAX Audio RX {dax_channel}"),
            sound_out: "DAX Audio TX".to_string(),
        }
    }

    fn managed_keys(&self) -> Vec<(&'static str, &'static str, String)> {
        vec![
            ("Configuration", "MyCall", self.my_call.clone()),
            ("Configuration", "MyGrid", self.my_grid.clone()),
            ("Configuration", "Rig", self.rig.clone()),
            ("Configuration", "CATNetworkPort", self.cat_port.to_string()),
            ("Configuration", "PTTMethod", "CAT".to_string()),
            ("Configuration", "SplitMode", "Rig".to_string()),
            ("Configuration", "UDPServer", self.udp_server.clone()),
            ("Configuration", "UDPServerPort", self.udp_port.to_string()),
            ("Configuration", "AcceptUDPRequests", "true".to_string()),
            ("Configuration", "SoundInName", self.sound_in.clone()),
            ("Configuration", "SoundOutName", self.sound_out.clone()),
            ("WideGraph", "BinsPerPixel", "2".to_string()),
            ("WideGraph", "StartFreq", "200".to_string()),
            ("WideGraph", "FreqSpan", "2600".to_string()),
        ]
    }

    /// Render a fresh file.
    pub fn render(&self) -> String {
        let mut lines: Vec<String> = Vec::new();
        for (section, key, value) in self.managed_keys() {
            set_key(&mut lines, section, key, &value);
        }
        let mut out = lines.join("\n");
        out.push('\n');
        out
    }

    /// Merge the managed keys into existing file content.
    pub fn merge_into(&self, existing: &str) -> String {
        let mut lines: Vec<String> = existing.lines().map(|l| l.to_string()).collect();
        for (section, key, value) in self.managed_keys() {
            set_key(&mut lines, section, key, &value);
        }
        let mut out = lines.join("\n");
        out.push('\n');
        out
    }

    /// Conventional per-instance file name inside `dir`.
    pub fn path_in(&self, dir: &Path) -> PathBuf {
        dir.join(format!("WSJT-X - {}.ini", self.rig_name))
    }

    /// Generate or merge the file on disk.
    pub fn write(&self, dir: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating settings dir {}", dir.display()))?;
        let path = self.path_in(dir);
        let content = match std::fs::read_to_string(&path) {
            Ok(existing) => self.merge_into(&existing),
            Err(_) => self.render(),
        };
        std::fs::write(&path, content)
            .with_context(|| format!("writing {}", path.display()))?;
        info!(rig_name = %self.rig_name, path = %path.display(), "instance ini written");
        Ok(path)
    }
}

/// Set `key=value` under `[section]`, creating the section at the end of
/// the file when absent. Matching is by key name up to the first `=`.
fn set_key(lines: &mut Vec<String>, section: &str, key: &str, value: &str) {
    let header = format!("[{section}]");
    let mut in_section = false;
    let mut section_end = lines.len();
    for (i, line) in lines.iter().enumerate() {
        let trimmed = line.trim();
        if trimmed.starts_with('[') {
            if in_section {
                section_end = i;
                break;
            }
            in_section = trimmed == header;
            continue;
        }
        if in_section {
            if let Some((k, _)) = trimmed.split_once('=') {
                if k.trim() == key {
                    lines[i] = format!("{key}={value}");
                    return;
                }
            }
        }
    }
    if in_section {
        // section exists, key does not: append at the section's end
        lines.insert(section_end, format!("{key}={value}"));
        return;
    }
    if !lines.is_empty() && !lines.last().map(|l| l.is_empty()).unwrap_or(true) {
        lines.push(String::new());
    }
    lines.push(header);
    lines.push(format!("{key}={value}"));
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample() -> InstanceIni {
        InstanceIni::for_slice("Slice-A", 7809, 2237, 1, "W1ABC", "FN20")
    }

    #[test]
    fn render_pins_ports_and_audio() {
        let text = sample().render();
        assert!(text.contains("[Configuration]"));
        assert!(text.contains("CATNetworkPort=7809"));
        assert!(text.contains("UDPServerPort=2237"));
        assert!(text.contains("UDPServer=127.0.0.1"));
        assert!(text.contains("AcceptUDPRequests=true"));
        assert!(text.contains("SoundInName=DAX Audio RX 1"));
        assert!(text.contains("Rig=Kenwood TS-2000"));
        assert!(text.contains("[WideGraph]"));
    }

    #[test]
    fn merge_updates_in_place_and_preserves_user_content() {
        let existing = "\
# hand-tuned by the operator
[Configuration]
MyCall=OLDCALL
Decode52=true
CATNetworkPort=60000

[Colors]
Background=#000000
";
        let merged = sample().merge_into(existing);
        assert!(merged.contains("MyCall=W1ABC"));
        assert!(merged.contains("CATNetworkPort=7809"));
        assert!(!merged.contains("OLDCALL"));
        // untouched user data survives
        assert!(merged.contains("# hand-tuned by the operator"));
        assert!(merged.contains("Decode52=true"));
        assert!(merged.contains("Background=#000000"));
        // managed keys land in their section, not a duplicate one
        assert_eq!(merged.matches("[Configuration]").count(), 1);
    }

    #[test]
    fn write_then_rewrite_round_trips() {
        let dir = std::env::temp_dir().join(format!("slicelink-ini-{}", std::process::id()));
        let ini = sample();
        let path = ini.write(&dir).unwrap();
        assert_eq!(path, dir.join("WSJT-X - Slice-A.ini"));
        let first = std::fs::read_to_string(&path).unwrap();
        // second write merges into the first; content stays stable
        ini.write(&dir).unwrap();
        let second = std::fs::read_to_string(&path).unwrap();
        assert_eq!(first, second);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
