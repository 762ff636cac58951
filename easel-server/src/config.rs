//! Command-line and environment configuration.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use easel_core::{BridgeOptions, DeviceMap, OrchestratorConfig};

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Easel image generation server")]
pub struct Args {
    /// Host address to bind the server to
    #[arg(long, env = "EASEL_HOST", default_value = "127.0.0.1")]
    pub host: String,

    /// Port to bind the server to
    #[arg(long, env = "EASEL_PORT", default_value_t = 8000)]
    pub port: u16,

    /// Directory holding one sub-directory per model
    #[arg(long, env = "EASEL_MODELS_DIR", default_value = "models")]
    pub models_dir: PathBuf,

    /// Directory generated images are written to and served from
    #[arg(long, env = "EASEL_OUTPUTS_DIR", default_value = "outputs")]
    pub outputs_dir: PathBuf,

    /// Use CPU instead of GPU
    #[arg(long, env = "EASEL_CPU")]
    pub cpu: bool,

    /// Comma-separated list of allowed CORS origins; empty allows any
    #[arg(
        long,
        env = "EASEL_CORS_ORIGINS",
        default_value = "http://localhost:5173,http://localhost:3000"
    )]
    pub cors_origins: String,

    /// Send heartbeat events while a streamed generation is quiet
    #[arg(
        long,
        env = "EASEL_HEARTBEAT",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub heartbeat: bool,

    /// `tracing` filter, e.g. `info` or `debug,tower_http=warn`
    #[arg(long, env = "EASEL_LOG", default_value = "info")]
    pub log_level: String,

    /// Emit log records as newline-delimited JSON
    #[arg(long, env = "EASEL_LOG_JSON")]
    pub log_json: bool,
}

impl Args {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn device_map(&self) -> DeviceMap {
        DeviceMap::from_cpu_flag(self.cpu)
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig::new(self.models_dir.clone(), self.outputs_dir.clone())
    }

    pub fn bridge_options(&self) -> BridgeOptions {
        BridgeOptions {
            heartbeat: self.heartbeat,
            poll_interval: Duration::from_millis(100),
            ..BridgeOptions::default()
        }
    }

    /// Configured origins, trimmed, without empty entries.
    pub fn cors_origins(&self) -> Vec<String> {
        self.cors_origins
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_owned)
            .collect()
    }
}
