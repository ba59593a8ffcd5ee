use anyhow::Context;
use clap::Parser;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use stackjoin::cli::{Cli, CliHandler, Commands};
use stackjoin::config::Config;
use stackjoin::logging;

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref()).context("loading configuration")?;
    logging::init(&config.logging).context("initialising logging")?;

    if config.node.name.trim().is_empty() {
        let hostname = nix::unistd::gethostname().context("reading hostname")?;
        config.node.name = hostname.to_string_lossy().into_owned();
    }
    if matches!(cli.command, Commands::Join { .. } | Commands::Reconcile { .. }) {
        config.validate().context("invalid configuration")?;
    }

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    ctrlc::set_handler(move || {
        info!("Interrupt received, cancelling");
        on_signal.cancel();
    })
    .context("installing Ctrl-C handler")?;

    let handler = CliHandler::new(config);
    match handler.execute(cli.command, cancel).await {
        Ok(true) => Ok(ExitCode::SUCCESS),
        Ok(false) => Ok(ExitCode::FAILURE),
        Err(e) => {
            error!(error = %e, "Command failed");
            Err(e.into())
        }
    }
}
