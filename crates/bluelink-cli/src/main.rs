//! bluelink - Bluetooth Low Energy from the command line

use clap::Parser;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use bluelink_cli::{
    cli::{Cli, Commands},
    commands::CommandDispatcher,
    config::CliAppConfig,
    error::Result,
    platform::select_platform,
};
use bluelink_core::{CancellationToken, Manager};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let config = load_configuration(&cli)?;

    // Printing or saving configuration never touches the radio
    if let Commands::Config { example, save } = cli.command {
        return CommandDispatcher::handle_config_command(&config, example, save);
    }

    let platform = select_platform(config.runtime.simulate).await?;
    let manager = Manager::new(platform, config.ble.clone())?;
    manager.start()?;
    info!("Platform {} ready", manager.platform_name());

    let cancel = CancellationToken::new();
    spawn_interrupt_handler(cancel.clone());

    let dispatcher = CommandDispatcher::new(manager, config, cancel);
    let outcome = dispatcher.execute(cli.command).await;

    if let Err(e) = dispatcher.shutdown().await {
        warn!("Shutdown did not complete cleanly: {}", e);
    }

    if let Err(e) = outcome {
        error!("Command failed: {}", e);
        std::process::exit(1);
    }
    Ok(())
}

/// `RUST_LOG` wins; otherwise `info`, or `debug` with `--verbose`
fn setup_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}

fn load_configuration(cli: &Cli) -> Result<CliAppConfig> {
    let config = CliAppConfig::load_with_overrides(
        cli.config.as_deref(),
        cli.simulate,
        cli.adapter.clone(),
    )?;
    debug!("Effective configuration: {:?}", config);
    Ok(config)
}

/// Ctrl-C cancels whatever command is running
fn spawn_interrupt_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Ctrl-C received, stopping");
                cancel.cancel();
            }
            Err(e) => warn!("Could not listen for Ctrl-C: {}", e),
        }
    });
}
