use std::io::{self, IsTerminal};

use bind_stats::{generic_error, GenericError};
use tracing_subscriber::EnvFilter;

use crate::config::Verbosity;

/// Logs a message to standard error and exits the process with a non-zero exit code.
///
/// Used for failures that happen before logging is available.
pub fn fatal_and_exit(message: String) -> ! {
    eprintln!("FATAL: {}", message);
    std::process::exit(1);
}

/// Initializes the process-wide `tracing` subscriber.
///
/// The configured verbosity sets the default level, which can be refined further with `RUST_LOG`-style directives
/// from the environment.
///
/// # Errors
///
/// If a subscriber was already installed, an error is returned.
pub fn initialize_logging(verbosity: Verbosity, json: bool) -> Result<(), GenericError> {
    let filter = EnvFilter::builder()
        .with_default_directive(verbosity.as_level_filter().into())
        .from_env_lossy();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(io::stderr);
    let result = if json {
        subscriber.json().try_init()
    } else {
        subscriber.compact().with_ansi(ansi_enabled(&io::stderr())).try_init()
    };

    result.map_err(|e| generic_error!("failed to install log subscriber: {}", e))
}

// Colors are only emitted when a person is likely to be reading the output directly.
fn ansi_enabled<W: IsTerminal>(output: &W) -> bool {
    output.is_terminal()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_ansi_when_redirected_to_file() {
        let file = tempfile::tempfile().expect("should create temp file");
        assert!(!ansi_enabled(&file));
    }
}
