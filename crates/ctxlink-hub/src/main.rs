use clap::Parser;
use ctxlink_core::{BridgeConfig, ConfigError, LockFileStore};
use ctxlink_hub::command::CommandReader;
use ctxlink_hub::logging::init_logging;
use ctxlink_hub::{AgentBridge, NoopSurface};
use std::{path::PathBuf, process::ExitCode, sync::Arc};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "ctxlink-hub", version)]
struct Args {
    /// TOML config file.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    workspace: Option<PathBuf>,
    #[arg(long)]
    port_min: Option<u16>,
    #[arg(long)]
    port_max: Option<u16>,
    #[arg(long)]
    log_dir: Option<PathBuf>,
    #[arg(long, default_value_t = false)]
    debug: bool,
}

fn load_config(args: &Args) -> Result<BridgeConfig, ConfigError> {
    let mut config = match &args.config {
        Some(path) => {
            let (config, notices) = BridgeConfig::load(path)?;
            for notice in notices {
                warn!(
                    event = "config_legacy_key",
                    legacy = %notice.legacy,
                    replacement = %notice.replacement,
                    applied = notice.applied
                );
            }
            config
        }
        None => BridgeConfig::default(),
    };
    if let Some(workspace) = &args.workspace {
        config.workspace = workspace.clone();
    }
    if let Some(min) = args.port_min {
        config.port_range.min = min;
    }
    if let Some(max) = args.port_max {
        config.port_range.max = max;
    }
    config.validate()?;
    Ok(config)
}

fn resolve_log_dir(args: &Args) -> Option<PathBuf> {
    if let Some(dir) = &args.log_dir {
        return Some(dir.clone());
    }
    match std::env::var("CTXLINK_LOG_DIR") {
        Ok(value) if !value.trim().is_empty() => Some(PathBuf::from(value)),
        _ => None,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let log_dir = resolve_log_dir(&args);
    let _log_guard = init_logging(args.debug, log_dir.as_deref());

    let config = match load_config(&args) {
        Ok(value) => value,
        Err(err) => {
            error!(event = "config_error", error = %err);
            return ExitCode::FAILURE;
        }
    };

    let store = Arc::new(LockFileStore::new(config.discovery_dir.clone()));
    let mut bridge = AgentBridge::new(config, store.clone(), Arc::new(NoopSurface));
    let port = match bridge.start().await {
        Ok(value) => value,
        Err(err) => {
            error!(event = "bridge_start_failed", error = %err);
            return ExitCode::FAILURE;
        }
    };

    let handshake = serde_json::json!({
        "port": port,
        "lock": store.path_for(port).display().to_string(),
    });
    println!("{handshake}");

    let shutdown = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(event = "signal_handler_error", error = %err);
            std::future::pending::<()>().await;
        }
    };
    let mut reader = CommandReader::new();
    let end = reader.run(&bridge, tokio::io::stdin(), shutdown).await;

    info!(
        event = "commands_done",
        end = ?end,
        accepted = reader.accepted(),
        rejected = reader.rejected()
    );
    if let Err(err) = bridge.stop().await {
        warn!(event = "bridge_stop_failed", error = %err);
    }
    ExitCode::SUCCESS
}
