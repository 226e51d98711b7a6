use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Weights used to turn a node's load report into a single cost.
///
/// Each load component is a percentage; its weight is the share (in
/// percent) it contributes to the node's load. Disk utilisation is added on
/// top to form the node's mass, and `level_bias` is charged once per
/// placement level so closer nodes win otherwise even contests.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SelectionWeights {
    pub cpu: u32,
    pub net: u32,
    pub xeq: u32,
    pub mem: u32,
    pub pag: u32,
    pub disk_util: u32,
    pub level_bias: u32,
}

impl Default for SelectionWeights {
    fn default() -> Self {
        Self {
            cpu: 20,
            net: 20,
            xeq: 40,
            mem: 10,
            pag: 10,
            disk_util: 50,
            level_bias: 1,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Name this manager reports itself as.
    pub name: String,
    /// Minimum number of active nodes for the cluster to be up.
    pub min_nodes: u32,
    /// Directory holding the `SUSPEND` and `NOSTAGE` sentinel files.
    pub admin_path: Option<PathBuf>,
    /// How long a disconnected node keeps its slot.
    pub drop_delay: Duration,
    pub heartbeat_interval: Duration,
    /// When set the cluster stays suspended until the front end reports in.
    pub require_front_end: bool,
    pub weights: SelectionWeights,
    /// Host names or glob patterns allowed to log in. Empty allows all.
    pub allowed_hosts: Vec<String>,
    /// How long a positive host authorisation is cached.
    pub auth_lifetime: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            name: local_name(),
            min_nodes: 1,
            admin_path: default_admin_path(),
            drop_delay: Duration::from_secs(600),
            heartbeat_interval: Duration::from_secs(30),
            require_front_end: false,
            weights: SelectionWeights::default(),
            allowed_hosts: Vec::new(),
            auth_lifetime: Duration::from_secs(8 * 60 * 60),
        }
    }
}

fn local_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Per-user admin directory, e.g. `~/.local/share/cmsd/admin` on Linux.
pub fn default_admin_path() -> Option<PathBuf> {
    directories_next::ProjectDirs::from("org", "cmsd", "cmsd")
        .map(|dirs| dirs.data_dir().join("admin"))
}
