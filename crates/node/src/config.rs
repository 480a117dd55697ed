//! Node configuration derived from the command line

use mesh_consensus::NodeConfig;
use rand::Rng;
use std::{path::PathBuf, time::Duration};

/// Settings for server mode
#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub node: NodeConfig,
    pub bind_addr: String,
    pub broker_addr: String,
    /// `None` keeps state in memory only
    pub data_dir: Option<PathBuf>,
}

/// Random name for nodes started without one
pub fn generated_name() -> String {
    let suffix: u16 = rand::thread_rng().gen();
    format!("server_{:04x}", suffix)
}

/// Address peers should dial: the bind address with wildcard hosts replaced
pub fn advertised_addr(bind_addr: &str) -> String {
    match bind_addr.rsplit_once(':') {
        Some(("0.0.0.0", port)) | Some(("[::]", port)) => format!("127.0.0.1:{}", port),
        _ => bind_addr.to_string(),
    }
}

/// Port part of `addr`, falling back to `default`
pub fn port_of(addr: &str, default: u16) -> u16 {
    addr.rsplit_once(':')
        .and_then(|(_, port)| port.parse().ok())
        .unwrap_or(default)
}

#[derive(Debug, Clone, Copy)]
pub struct Intervals {
    pub heartbeat: Duration,
    pub election: Duration,
    pub sync: Duration,
    pub request_timeout: Duration,
}

pub fn node_config(name: &str, advertise: &str, reference_addr: &str, intervals: Intervals) -> NodeConfig {
    let mut config = NodeConfig::new(name, advertise)
        .reference_addr(reference_addr)
        .heartbeat_interval(intervals.heartbeat)
        .election_interval(intervals.election)
        .sync_interval(intervals.sync)
        .request_timeout(intervals.request_timeout);
    config.default_port = port_of(advertise, config.default_port);
    config
}
