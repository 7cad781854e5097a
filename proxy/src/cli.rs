//! # CLI Interface
//!
//! `clap` derive definitions for `nvp-proxy`. Every `run` flag also reads
//! an environment variable, so the proxy can be configured entirely from
//! the environment in container deployments.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};

use nvp_core::config::{
    Endpoints, Environment, DEFAULT_LIVE_URL, DEFAULT_LOG_BUFFER_SIZE, DEFAULT_NVP_VERSION,
    DEFAULT_RATE_LIMIT_MAX, DEFAULT_SANDBOX_URL,
};

use crate::logging::LogFormat;

/// Credential-scoped proxy for the legacy NVP payment API.
#[derive(Parser, Debug)]
#[command(
    name = "nvp-proxy",
    about = "Credential-scoped NVP payment API proxy",
    version,
    propagate_version = true
)]
pub struct ProxyCli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the proxy.
    Run(RunArgs),
    /// Print version information and exit.
    Version,
}

#[derive(Parser, Debug, Clone)]
pub struct RunArgs {
    /// Port for the REST, SSE and WebSocket API.
    #[arg(long, env = "PORT", default_value_t = 4000)]
    pub port: u16,

    /// Port for the Prometheus metrics endpoint.
    #[arg(long, env = "METRICS_PORT", default_value_t = 4001)]
    pub metrics_port: u16,

    /// Default upstream environment. Only "live" selects the live
    /// endpoint; anything else means sandbox.
    #[arg(long, env = "PAYPAL_ENV", default_value = "sandbox")]
    pub paypal_env: String,

    /// Value of the `VERSION` field on every NVP call.
    #[arg(long, env = "PAYPAL_NVP_VERSION", default_value = DEFAULT_NVP_VERSION)]
    pub nvp_version: String,

    #[arg(long, env = "NVP_SANDBOX_URL", default_value = DEFAULT_SANDBOX_URL)]
    pub nvp_sandbox_url: String,

    #[arg(long, env = "NVP_LIVE_URL", default_value = DEFAULT_LIVE_URL)]
    pub nvp_live_url: String,

    /// Capacity of the in-memory log ring buffer.
    #[arg(long, env = "LOG_BUFFER_SIZE", default_value_t = DEFAULT_LOG_BUFFER_SIZE)]
    pub log_buffer_size: usize,

    /// Rate-limit window for `/nvp/*`, in seconds.
    #[arg(long, env = "RATE_LIMIT_WINDOW_SECS", default_value_t = 60)]
    pub rate_limit_window_secs: u64,

    /// Maximum `/nvp/*` calls per client per window.
    #[arg(long, env = "RATE_LIMIT_MAX", default_value_t = DEFAULT_RATE_LIMIT_MAX)]
    pub rate_limit_max: u32,

    /// Browser origin allowed by CORS (credentials included).
    #[arg(long, env = "CLIENT_ORIGIN", default_value = "http://localhost:5173")]
    pub client_origin: String,

    /// Directory holding the saved-key database.
    #[arg(long, short = 'd', env = "NVP_DATA_DIR", default_value = "./data")]
    pub data_dir: PathBuf,

    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,
}

impl RunArgs {
    pub fn default_environment(&self) -> Environment {
        Environment::from_str_lossy(&self.paypal_env)
    }

    pub fn endpoints(&self) -> Endpoints {
        Endpoints {
            sandbox: self.nvp_sandbox_url.clone(),
            live: self.nvp_live_url.clone(),
        }
    }

    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_secs(self.rate_limit_window_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli_structure() {
        ProxyCli::command().debug_assert();
    }

    #[test]
    fn run_defaults() {
        let cli = ProxyCli::try_parse_from(["nvp-proxy", "run"]).unwrap();
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.log_buffer_size, 300);
        assert_eq!(args.rate_limit_max, 30);
        assert_eq!(args.rate_limit_window(), Duration::from_secs(60));
        assert_eq!(args.nvp_version, "204.0");
        assert_eq!(args.endpoints(), Endpoints::default());
    }

    #[test]
    fn unknown_env_is_sandbox() {
        let cli =
            ProxyCli::try_parse_from(["nvp-proxy", "run", "--paypal-env", "production"]).unwrap();
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.default_environment(), Environment::Sandbox);
    }
}
