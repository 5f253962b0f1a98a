use log::warn;
use once_cell::sync::OnceCell;
use serde_derive::Deserialize;
use std::sync::Mutex;

static INSTANCE: OnceCell<Mutex<RuntimeConfig>> = OnceCell::new();

pub fn instance() -> &'static Mutex<RuntimeConfig> {
    INSTANCE.get_or_init(|| Mutex::new(RuntimeConfig::new()))
}

#[derive(Debug, Deserialize, Clone)]
pub struct NodeConfig {
    pub id: u64,
    pub addr: String,
}

/// One partition hosted by this node. Voters and learners list host ids;
/// this node's own id may appear in either.
#[derive(Debug, Deserialize, Clone)]
pub struct PartConfig {
    pub space_id: i32,
    pub part_id: i32,
    #[serde(default)]
    pub voters: Vec<u64>,
    #[serde(default)]
    pub learners: Vec<u64>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RuntimeConfig {
    pub id: u64,
    pub addr: String,
    pub metrics_addr: String,
    pub wal_path: String,
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
    #[serde(default = "default_worker_queue_depth")]
    pub worker_queue_depth: usize,
    #[serde(default = "default_election_timeout_min_ms")]
    pub election_timeout_min_ms: u64,
    #[serde(default = "default_election_timeout_max_ms")]
    pub election_timeout_max_ms: u64,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_snapshot_interval_secs")]
    pub snapshot_interval_secs: u64,
    pub node_list: Vec<NodeConfig>,
    #[serde(default)]
    pub part_list: Vec<PartConfig>,
}

fn default_worker_threads() -> usize {
    4
}
fn default_worker_queue_depth() -> usize {
    256
}
fn default_election_timeout_min_ms() -> u64 {
    400
}
fn default_election_timeout_max_ms() -> u64 {
    800
}
fn default_heartbeat_interval_ms() -> u64 {
    100
}
fn default_snapshot_interval_secs() -> u64 {
    60
}

impl RuntimeConfig {
    pub fn new() -> Self {
        RuntimeConfig {
            id: 1,
            addr: "0.0.0.0:4500".to_string(),
            metrics_addr: "0.0.0.0:4510".to_string(),
            wal_path: "./raftex-data".to_string(),
            worker_threads: default_worker_threads(),
            worker_queue_depth: default_worker_queue_depth(),
            election_timeout_min_ms: default_election_timeout_min_ms(),
            election_timeout_max_ms: default_election_timeout_max_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            snapshot_interval_secs: default_snapshot_interval_secs(),
            node_list: Vec::new(),
            part_list: Vec::new(),
        }
    }

    pub fn from_toml(path: &str) -> Option<Self> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) => {
                warn!(
                    "Something went wrong reading the runtime config file, {:?}",
                    e
                );
                return Some(RuntimeConfig::new());
            }
        };
        let config: RuntimeConfig = match toml::from_str(&contents) {
            Ok(c) => c,
            Err(e) => {
                warn!(
                    "Something went wrong reading the runtime config file, {:?}",
                    e
                );
                return Some(RuntimeConfig::new());
            }
        };
        *instance().lock().unwrap() = config.clone();
        Some(config)
    }

    /// Address of a peer host, from the node list.
    pub fn addr_of(&self, id: u64) -> Option<String> {
        self.node_list
            .iter()
            .find(|n| n.id == id)
            .map(|n| n.addr.clone())
    }
}
