//! USBTMC device discovery.
//!
//! Lists `/dev/usbtmc*` nodes, asks each for `*IDN?` and suggests which one to
//! use for each bench role. Probing is sequential; a device that does not
//! answer is reported with its error and otherwise ignored.

use crate::transport::{Transport, UsbTmcTransport};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Directory holding the device nodes.
pub const DEFAULT_DEV_DIR: &str = "/dev";

/// Probe timeout used by `sigbench scan`.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Result of probing one node.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeResult {
    /// Device node.
    pub path: PathBuf,
    /// `*IDN?` response, or the error that prevented one.
    pub idn: Result<String, String>,
}

/// Suggested device per role. First match wins.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RoleSuggestion {
    /// Power supply.
    pub spd: Option<PathBuf>,
    /// Multimeter.
    pub sdm: Option<PathBuf>,
    /// Oscilloscope.
    pub scope: Option<PathBuf>,
}

/// Sorted `usbtmc*` nodes in `dev_dir`.
pub fn list_usbtmc_nodes(dev_dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut nodes: Vec<PathBuf> = std::fs::read_dir(dev_dir)?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name().to_string_lossy().starts_with("usbtmc"))
        .map(|entry| entry.path())
        .collect();
    nodes.sort();
    Ok(nodes)
}

/// Probe every node in `dev_dir` with `*IDN?`.
pub async fn scan_usbtmc(dev_dir: &Path, timeout: Duration) -> std::io::Result<Vec<ProbeResult>> {
    let mut results = Vec::new();
    for path in list_usbtmc_nodes(dev_dir)? {
        let mut transport = UsbTmcTransport::new(&path).with_timeout(timeout);
        let idn = transport.query("*IDN?").await.map_err(|e| e.to_string());
        transport.close().await;
        debug!(path = %path.display(), ?idn, "probed");
        results.push(ProbeResult { path, idn });
    }
    Ok(results)
}

/// Map identification strings onto roles.
pub fn suggest_roles(results: &[ProbeResult]) -> RoleSuggestion {
    let mut roles = RoleSuggestion::default();
    for result in results {
        let Ok(idn) = &result.idn else {
            continue;
        };
        let idn = idn.to_ascii_uppercase();
        let slot = if idn.contains("SPD3303X") {
            &mut roles.spd
        } else if idn.contains("SDM3045X") {
            &mut roles.sdm
        } else if idn.contains("SDS1104X") {
            &mut roles.scope
        } else {
            continue;
        };
        if slot.is_none() {
            *slot = Some(result.path.clone());
        }
    }
    roles
}

#[cfg(test)]
mod tests {
    use super::*;

    fn probe(path: &str, idn: &str) -> ProbeResult {
        ProbeResult {
            path: PathBuf::from(path),
            idn: Ok(idn.to_string()),
        }
    }

    #[test]
    fn first_match_wins_per_role() {
        let results = vec![
            probe("/dev/usbtmc0", "Siglent Technologies,SDM3045X,SDM34X,1.01"),
            probe("/dev/usbtmc1", "Siglent Technologies,SPD3303X-E,SPD3X,1.01"),
            probe("/dev/usbtmc2", "Siglent Technologies,SDM3045X,SDM34Y,1.01"),
            ProbeResult {
                path: PathBuf::from("/dev/usbtmc3"),
                idn: Err("timeout".into()),
            },
        ];
        let roles = suggest_roles(&results);
        assert_eq!(roles.sdm, Some(PathBuf::from("/dev/usbtmc0")));
        assert_eq!(roles.spd, Some(PathBuf::from("/dev/usbtmc1")));
        assert_eq!(roles.scope, None);
    }

    #[tokio::test]
    async fn scans_fake_device_nodes() {
        let dir = tempfile::tempdir().unwrap();
        // The query overwrites the first bytes of a regular file; the rest
        // still identifies the scope.
        std::fs::write(dir.path().join("usbtmc1"), "SIGLENT,SDS1104X-E,X,1\n").unwrap();
        std::fs::write(dir.path().join("ttyS0"), "").unwrap();

        let results = scan_usbtmc(dir.path(), Duration::from_millis(100)).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(suggest_roles(&results).scope, Some(dir.path().join("usbtmc1")));
    }
}
