//! # Grid CLI Entry Point
//!
//! ## Usage
//!
//! ```bash
//! # Start a hub on the default port
//! grid hub
//!
//! # Start a hub from a config file, overriding the bind address
//! grid hub --config hub.json -b 0.0.0.0:5555
//!
//! # Queue requests for at most 30 seconds
//! grid hub --new-session-wait-timeout 30000
//!
//! # Print a running hub's status
//! grid status http://127.0.0.1:4444
//! ```

use anyhow::Result;
use argh::FromArgs;
use grid_common::{HttpNodeProxy, NodeProxy};
use grid_hub::{HttpServer, HubConfig, Registry};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::net::TcpListener;

/// Main CLI structure parsed from command-line arguments.
#[derive(FromArgs)]
/// Grid hub - leases browser nodes to test sessions
struct Cli {
    #[argh(subcommand)]
    command: Commands,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Commands {
    Hub(HubArgs),
    Status(StatusArgs),
}

/// Arguments for starting a hub.
///
/// Settings are read from `--config` when given, then overridden by flags.
#[derive(FromArgs)]
#[argh(subcommand, name = "hub")]
/// start a grid hub
struct HubArgs {
    /// address to bind the hub's HTTP server to
    ///
    /// Overrides `host` and `port` from the config file. Defaults to
    /// 0.0.0.0:4444 when neither is set.
    #[argh(option, short = 'b')]
    bind: Option<String>,

    /// path to a JSON hub configuration file
    #[argh(option, long = "config")]
    config: Option<String>,

    /// how long a new session request may wait for a free node, in ms
    ///
    /// Negative values wait forever.
    #[argh(option, long = "new-session-wait-timeout")]
    new_session_wait_timeout: Option<i64>,

    /// reject requests no registered node could ever satisfy
    #[argh(option, long = "throw-on-capability-not-present")]
    throw_on_capability_not_present: Option<bool>,
}

/// Arguments for printing a hub's status.
#[derive(FromArgs)]
#[argh(subcommand, name = "status")]
/// print the status of a running hub
struct StatusArgs {
    /// address of the hub
    ///
    /// Must include the http:// or https:// prefix (e.g., http://127.0.0.1:4444).
    #[argh(positional)]
    hub_address: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    match cli.command {
        Commands::Hub(args) => {
            // Set default log level to INFO, but allow RUST_LOG env var to override
            let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
            tracing_subscriber::fmt().with_env_filter(env_filter).init();

            run_hub(args).await
        }
        Commands::Status(args) => {
            grid_cli::validate_http_url(&args.hub_address, "hub address")?;
            let status = grid_cli::fetch_hub_status(&args.hub_address).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }
    }
}

/// Loads the config file, then applies flag overrides.
fn build_config(args: &HubArgs) -> Result<HubConfig> {
    let mut config = match &args.config {
        Some(path) => HubConfig::from_file(path)?,
        None => HubConfig::default(),
    };

    if let Some(bind) = &args.bind {
        let addr: SocketAddr = bind
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid bind address {}: {}", bind, e))?;
        config.host = addr.ip().to_string();
        config.port = addr.port();
    }
    if let Some(timeout) = args.new_session_wait_timeout {
        config.new_session_wait_timeout = timeout;
    }
    if let Some(throw) = args.throw_on_capability_not_present {
        config.throw_on_capability_not_present = throw;
    }

    Ok(config)
}

async fn run_hub(args: HubArgs) -> Result<()> {
    let config = build_config(&args)?;
    let ip: IpAddr = config
        .host
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid host {}: {}", config.host, e))?;
    let addr = SocketAddr::new(ip, config.port);

    tracing::info!("Starting grid hub");
    tracing::info!("Binding to: {}", addr);
    if let Some(path) = &args.config {
        tracing::info!("Configuration loaded from {}", path);
    }

    let proxy: Arc<dyn NodeProxy> = Arc::new(HttpNodeProxy::new());
    let registry = Registry::new(config, proxy);
    let server = HttpServer::new(registry.clone());

    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind to {}: {}", addr, e))?;
    server.serve(listener, shutdown_signal()).await?;

    registry.shutdown();
    tracing::info!("Grid hub stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown requested");
}

/// CLI argument parsing tests.
#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn parse(args: &[&str]) -> Cli {
        Cli::from_args(&["grid"], args).unwrap()
    }

    fn hub_args(args: &[&str]) -> HubArgs {
        match parse(args).command {
            Commands::Hub(args) => args,
            _ => panic!("Expected Hub command"),
        }
    }

    #[test]
    fn test_cli_parse_hub_defaults() {
        let args = hub_args(&["hub"]);
        assert!(args.bind.is_none());
        assert!(args.config.is_none());
        assert!(args.new_session_wait_timeout.is_none());
        assert!(args.throw_on_capability_not_present.is_none());

        assert_eq!(build_config(&args).unwrap(), HubConfig::default());
    }

    #[test]
    fn test_cli_parse_hub_overrides() {
        let args = hub_args(&[
            "hub",
            "-b", "127.0.0.1:5555",
            "--new-session-wait-timeout", "30000",
            "--throw-on-capability-not-present", "false",
        ]);
        let config = build_config(&args).unwrap();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 5555);
        assert_eq!(config.new_session_wait_timeout, 30000);
        assert!(!config.throw_on_capability_not_present);
    }

    #[test]
    fn test_flags_override_config_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"port": 4000, "newSessionWaitTimeout": 5000, "timeout": 60}}"#).unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let args = hub_args(&["hub", "--config", &path, "--new-session-wait-timeout", "0"]);
        let config = build_config(&args).unwrap();
        assert_eq!(config.port, 4000);
        assert_eq!(config.timeout, 60);
        assert_eq!(config.new_session_wait_timeout, 0);
    }

    #[test]
    fn test_invalid_bind_address() {
        let args = hub_args(&["hub", "-b", "not-an-address"]);
        assert!(build_config(&args).is_err());
    }

    #[test]
    fn test_missing_config_file() {
        let args = hub_args(&["hub", "--config", "/nonexistent/hub.json"]);
        assert!(build_config(&args).is_err());
    }

    #[test]
    fn test_cli_parse_status() {
        match parse(&["status", "http://127.0.0.1:4444"]).command {
            Commands::Status(StatusArgs { hub_address }) => {
                assert_eq!(hub_address, "http://127.0.0.1:4444");
            }
            _ => panic!("Expected Status command"),
        }
    }

    #[test]
    fn test_cli_rejects_unknown_command() {
        assert!(Cli::from_args(&["grid"], &["node"]).is_err());
    }
}
