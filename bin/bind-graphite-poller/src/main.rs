//! Polls a BIND name server's statistics channel and relays its counters to Graphite.

#![deny(warnings)]
#![deny(missing_docs)]

use std::sync::mpsc;

use bind_stats::{ErrorContext as _, GenericError, PollLoop, StopSignalPause};
use clap::Parser as _;
use tracing::{error, info};

mod config;
use self::config::{Cli, PollerConfig, PollerSettings};

mod logging;
use self::logging::{fatal_and_exit, initialize_logging};

fn main() {
    let cli = Cli::parse();

    let config = match PollerConfig::load(&cli) {
        Ok(config) => config,
        Err(e) => fatal_and_exit(format!("failed to load configuration: {}", e)),
    };

    if let Err(e) = initialize_logging(config.verbose, config.log_format_json) {
        fatal_and_exit(format!("failed to initialize logging: {}", e));
    }

    match run(config) {
        Ok(()) => info!("bind-graphite-poller stopped."),
        Err(e) => {
            error!("{:?}", e);
            std::process::exit(1);
        }
    }
}

fn run(config: PollerConfig) -> Result<(), GenericError> {
    info!("bind-graphite-poller starting...");

    let settings = PollerSettings::from_config(config).error_context("Invalid configuration.")?;
    let namespace = settings.namespace().error_context("Invalid configuration.")?;
    let source = settings.source().error_context("Failed to create statistics source.")?;

    let mut poll_loop = PollLoop::new(source, namespace, settings.transmitter(), settings.interval)
        .with_onetime(settings.onetime);
    poll_loop.run(&mut stop_on_termination()?);

    Ok(())
}

// SIGINT and SIGTERM request a stop, which takes effect once the in-flight cycle finishes.
fn stop_on_termination() -> Result<StopSignalPause, GenericError> {
    let (stop_tx, stop_rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = stop_tx.send(());
    })
    .error_context("Failed to install termination signal handler.")?;

    Ok(StopSignalPause::new(stop_rx))
}
