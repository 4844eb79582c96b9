//! Process-wide configuration (spec §6, SPEC_FULL §3/§K).
//!
//! Startup configuration is layered: CLI flags (each mirrored by an env var
//! via `clap`'s `env` feature) provide the required settings, an optional
//! TOML file supplies per-endpoint slot capacities and pool-size overrides
//! that don't make sense as a single flag each.

use std::{collections::HashMap, net::SocketAddr, path::PathBuf, time::Duration};

use clap::Parser;
use serde::Deserialize;

use crate::error::AnyResult;

const DEFAULT_STREAMING_TIMEOUT_SECS: u64 = 600;
const DEFAULT_SLOT_CAPACITY: usize = 10;
const DEFAULT_POOL_INTERVAL_MS: u64 = 50;
const DEFAULT_NUM_RETRIES: usize = 3;
const DEFAULT_RETRY_WAIT_SECS: u64 = 2;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
const DEFAULT_READ_TIMEOUT_SECS: u64 = 60;
const CHUNK_SIZE: usize = 64 * 1024;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "EIDA federating gateway")]
pub struct Cli {
    /// Port to bind the ingress HTTP server to.
    #[arg(long, env = "EIDA_FEDERATOR_PORT", default_value_t = 8080)]
    pub port: u16,

    /// Enable debug-level logging.
    #[arg(long, env = "EIDA_FEDERATOR_DEBUG")]
    pub debug: bool,

    /// Base URL of the routing service.
    #[arg(long, env = "ROUTING_SERVICE")]
    pub routing: String,

    /// Directory for spooled response files.
    #[arg(long, env = "TMPDIR")]
    pub tmpdir: Option<PathBuf>,

    /// Optional TOML file with per-endpoint slot capacities and pool-size
    /// overrides.
    #[arg(long)]
    pub config: Option<PathBuf>,

    #[arg(long, env = "EIDA_FEDERATOR_STREAMING_TIMEOUT")]
    pub streaming_timeout: Option<u64>,

    #[arg(long, env = "EIDA_FEDERATOR_THREADS_DATASELECT")]
    pub threads_dataselect: Option<usize>,

    #[arg(long, env = "EIDA_FEDERATOR_THREADS_STATION_TEXT")]
    pub threads_station_text: Option<usize>,

    #[arg(long, env = "EIDA_FEDERATOR_THREADS_WFCATALOG")]
    pub threads_wfcatalog: Option<usize>,

    #[arg(long, env = "EIDA_FEDERATOR_POOL_SIZE")]
    pub pool_size: Option<usize>,

    /// Connect timeout for outbound routing/endpoint requests, in seconds.
    #[arg(long, env = "EIDA_FEDERATOR_CONNECT_TIMEOUT")]
    pub connect_timeout: Option<u64>,

    /// Read timeout for outbound routing/endpoint requests, in seconds.
    #[arg(long, env = "EIDA_FEDERATOR_READ_TIMEOUT")]
    pub read_timeout: Option<u64>,
}

/// File-based overlay (`--config`), layered on top of [`Cli`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub slot_capacities: HashMap<String, usize>,
    pub default_slot_capacity: Option<usize>,
    pub pool_size: Option<usize>,
    pub threads_dataselect: Option<usize>,
    pub threads_station_text: Option<usize>,
    pub threads_wfcatalog: Option<usize>,
    pub num_retries: Option<usize>,
    pub retry_wait_secs: Option<u64>,
    pub connect_timeout_secs: Option<u64>,
    pub read_timeout_secs: Option<u64>,
}

impl FileConfig {
    pub fn load(path: &std::path::Path) -> AnyResult<Self> {
        let data = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Ok(serde_json::from_str(&data)?),
            _ => Ok(toml::from_str(&data)?),
        }
    }
}

/// Fully resolved, immutable configuration for the life of the process.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind_addr: SocketAddr,
    pub debug: bool,
    pub routing_service: http::Uri,
    pub tmpdir: PathBuf,
    pub streaming_timeout: Duration,
    pub pool_size: usize,
    pub threads_dataselect: usize,
    pub threads_station_text: usize,
    pub threads_wfcatalog: usize,
    pub slot_capacities: HashMap<String, usize>,
    pub default_slot_capacity: usize,
    pub slot_poll_interval: Duration,
    pub num_retries: usize,
    pub retry_wait: Duration,
    pub chunk_size: usize,
    /// Link FDSN endpoint connect timeout, mirroring the teacher's
    /// `HttpUpstreamTimeout::connect_timeout`.
    pub connect_timeout: Duration,
    /// Link FDSN endpoint response read timeout, mirroring the teacher's
    /// `HttpUpstreamTimeout::read_timeout`.
    pub read_timeout: Duration,
}

impl GatewayConfig {
    pub fn build(cli: Cli) -> AnyResult<Self> {
        let file = match &cli.config {
            Some(path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };
        let routing_service: http::Uri = cli.routing.parse()?;
        let tmpdir = cli.tmpdir.unwrap_or_else(std::env::temp_dir);
        Ok(Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], cli.port)),
            debug: cli.debug,
            routing_service,
            tmpdir,
            streaming_timeout: Duration::from_secs(
                cli.streaming_timeout.unwrap_or(DEFAULT_STREAMING_TIMEOUT_SECS),
            ),
            pool_size: cli.pool_size.or(file.pool_size).unwrap_or(20),
            threads_dataselect: cli
                .threads_dataselect
                .or(file.threads_dataselect)
                .unwrap_or(20),
            threads_station_text: cli
                .threads_station_text
                .or(file.threads_station_text)
                .unwrap_or(20),
            threads_wfcatalog: cli
                .threads_wfcatalog
                .or(file.threads_wfcatalog)
                .unwrap_or(20),
            slot_capacities: file.slot_capacities,
            default_slot_capacity: file.default_slot_capacity.unwrap_or(DEFAULT_SLOT_CAPACITY),
            slot_poll_interval: Duration::from_millis(DEFAULT_POOL_INTERVAL_MS),
            num_retries: file.num_retries.unwrap_or(DEFAULT_NUM_RETRIES),
            retry_wait: Duration::from_secs(file.retry_wait_secs.unwrap_or(DEFAULT_RETRY_WAIT_SECS)),
            chunk_size: CHUNK_SIZE,
            connect_timeout: Duration::from_secs(
                cli.connect_timeout
                    .or(file.connect_timeout_secs)
                    .unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECS),
            ),
            read_timeout: Duration::from_secs(
                cli.read_timeout
                    .or(file.read_timeout_secs)
                    .unwrap_or(DEFAULT_READ_TIMEOUT_SECS),
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_config_toml_round_trip() {
        const TOML: &str = r#"
            default_slot_capacity = 5
            pool_size = 42

            [slot_capacities]
            "http://node1.example.org" = 3
        "#;
        let parsed: FileConfig = toml::from_str(TOML).unwrap();
        assert_eq!(parsed.default_slot_capacity, Some(5));
        assert_eq!(parsed.pool_size, Some(42));
        assert_eq!(
            parsed.slot_capacities.get("http://node1.example.org"),
            Some(&3)
        );
    }
}
