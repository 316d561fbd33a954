//! Sandbox detection for connected clients
//!
//! A client running inside a flatpak sandbox gets the portal policy; its
//! media operations then go through the desktop consent dialog. Detection
//! reads the control-group file of the client's process and looks for a
//! flatpak scope in the systemd name hierarchy.

use crate::client::ClientInfo;
use std::fs;
use std::path::PathBuf;
use tracing::debug;

/// Prefix of the systemd name hierarchy line in a cgroup file.
const SYSTEMD_HIERARCHY: &str = "1:name=systemd:";

/// Substring marking a flatpak application scope.
const FLATPAK_MARKER: &str = "flatpak-";

/// Decides whether a client runs inside an application sandbox.
///
/// Probe failures classify as not sandboxed; the policy chosen for
/// unsandboxed clients is itself restrictive, so this fails toward the
/// stricter owner checks rather than toward an open portal grant.
#[derive(Debug, Clone)]
pub struct SandboxClassifier {
    proc_root: PathBuf,
}

impl SandboxClassifier {
    /// Create a classifier probing under the given process filesystem root.
    pub fn new(proc_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
        }
    }

    /// Whether the client's process is sandboxed.
    pub fn is_sandboxed(&self, client: &ClientInfo) -> bool {
        if !client.credentials_valid {
            debug!(client = client.index, "no trusted pid, assuming not sandboxed");
            return false;
        }

        let path = self
            .proc_root
            .join(client.pid.to_string())
            .join("cgroup");

        let data = match fs::read_to_string(&path) {
            Ok(data) => data,
            Err(err) => {
                debug!(client = client.index, pid = client.pid, %err, "cgroup unreadable, assuming not sandboxed");
                return false;
            }
        };

        let sandboxed = Self::scan(&data);
        if sandboxed {
            debug!(client = client.index, pid = client.pid, "found a flatpak cgroup, assuming sandboxed");
        }
        sandboxed
    }

    fn scan(data: &str) -> bool {
        data.lines()
            .any(|line| line.starts_with(SYSTEMD_HIERARCHY) && line.contains(FLATPAK_MARKER))
    }
}
