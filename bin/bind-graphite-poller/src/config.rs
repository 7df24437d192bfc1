use std::{
    io,
    path::{Path, PathBuf},
    time::Duration,
};

use bind_stats::{
    FetchError, FileStatsSource, HostLabel, HostLabelError, HttpStatsSource, MetricNamespace, StatsSource,
};
use carbon_pickle::{AddressError, CarbonAddress, Transmitter};
use clap::{Parser, ValueEnum};
use figment::{
    providers::{Env, Format as _, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use snafu::{OptionExt as _, ResultExt as _, Snafu};
use tracing::level_filters::LevelFilter;

const ENV_PREFIX: &str = "BIND_POLLER_";

/// A configuration error.
///
/// These are the only errors that stop the poller from starting.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum ConfigurationError {
    /// The configuration file could not be read.
    #[snafu(display("failed to read configuration file '{}': {}", path.display(), source))]
    ReadFile { path: PathBuf, source: io::Error },

    /// The layered configuration could not be extracted.
    #[snafu(display("invalid configuration: {}", source))]
    Extract { source: Box<figment::Error> },

    /// No statistics endpoint was configured.
    #[snafu(display("missing BIND statistics address: pass --bind HOST:PORT"))]
    MissingBind,

    /// An address setting could not be parsed.
    #[snafu(display("invalid {} address: {}", setting, source))]
    InvalidAddress { setting: &'static str, source: AddressError },

    /// The fetch timeout was zero.
    #[snafu(display("timeout must be at least one second"))]
    ZeroTimeout,

    /// The metric prefix was empty or not a valid metric name segment.
    #[snafu(display("invalid metric prefix '{}': must be non-empty and must not start or end with '.'", prefix))]
    InvalidPrefix { prefix: String },

    /// The `<host>` metric segment could not be determined.
    #[snafu(display("failed to determine host label: {}", source))]
    ResolveHostLabel { source: HostLabelError },

    /// The statistics source could not be constructed.
    #[snafu(display("failed to create statistics source: {}", source))]
    Source { source: FetchError },
}

/// Verbosity of log output.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Verbosity {
    /// Errors only.
    Error,

    /// Informational messages and errors.
    #[default]
    Info,

    /// Everything, including per-step diagnostics.
    Debug,
}

impl Verbosity {
    /// Returns the matching log level filter.
    pub fn as_level_filter(self) -> LevelFilter {
        match self {
            Self::Error => LevelFilter::ERROR,
            Self::Info => LevelFilter::INFO,
            Self::Debug => LevelFilter::DEBUG,
        }
    }
}

#[derive(Parser)]
#[command(about = "Parse BIND statistics and insert them into Graphite.")]
pub struct Cli {
    /// Path to a YAML configuration file.
    ///
    /// Settings are layered: the file is applied first, then `BIND_POLLER_*` environment variables, then any flags
    /// given on the command line.
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// BIND DNS hostname and statistics port. Example: dns1:8053
    #[arg(long)]
    bind: Option<String>,

    /// HTTP path of the statistics document. [default: /]
    #[arg(long)]
    bind_path: Option<String>,

    /// Read the statistics XML from this file instead of querying the statistics port.
    #[arg(long)]
    bind_file: Option<PathBuf>,

    /// Carbon hostname and pickle port for receiving statistics. When omitted, statistics are gathered but not sent.
    #[arg(long)]
    carbon: Option<String>,

    /// Seconds between polling/sending executions. [default: 60]
    #[arg(long)]
    interval: Option<u64>,

    /// Query the configured BIND host once and quit.
    #[arg(long)]
    onetime: bool,

    /// Verbosity of output. [default: info]
    #[arg(long, value_enum)]
    verbose: Option<Verbosity>,

    /// Root segment of every metric name. [default: dns]
    #[arg(long)]
    prefix: Option<String>,

    /// Seconds to wait for the statistics document before abandoning a cycle. [default: 10]
    #[arg(long)]
    timeout: Option<u64>,

    /// Emit logs as JSON.
    #[arg(long)]
    log_format_json: bool,
}

// Only the flags that were actually given, so they override lower layers without clobbering them.
#[derive(Serialize)]
struct CliOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    bind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    bind_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    bind_file: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    carbon: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    interval: Option<u64>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    onetime: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    verbose: Option<Verbosity>,
    #[serde(skip_serializing_if = "Option::is_none")]
    prefix: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    timeout: Option<u64>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    log_format_json: bool,
}

impl Cli {
    fn overrides(&self) -> CliOverrides {
        CliOverrides {
            bind: self.bind.clone(),
            bind_path: self.bind_path.clone(),
            bind_file: self.bind_file.clone(),
            carbon: self.carbon.clone(),
            interval: self.interval,
            onetime: self.onetime,
            verbose: self.verbose,
            prefix: self.prefix.clone(),
            timeout: self.timeout,
            log_format_json: self.log_format_json,
        }
    }
}

fn default_bind_path() -> String {
    "/".to_string()
}

const fn default_interval() -> u64 {
    60
}

fn default_prefix() -> String {
    "dns".to_string()
}

const fn default_timeout() -> u64 {
    10
}

/// Poller configuration, as layered from the configuration file, environment, and command line.
#[derive(Debug, Deserialize)]
pub struct PollerConfig {
    /// Statistics endpoint, as `host:port`.
    pub bind: Option<String>,

    /// HTTP path of the statistics document.
    #[serde(default = "default_bind_path")]
    pub bind_path: String,

    /// File to read the statistics document from, instead of querying the endpoint.
    #[serde(default)]
    pub bind_file: Option<PathBuf>,

    /// Carbon pickle receiver, as `host:port`.
    #[serde(default)]
    pub carbon: Option<String>,

    /// Seconds between cycles.
    #[serde(default = "default_interval")]
    pub interval: u64,

    /// Whether to run a single cycle and exit.
    #[serde(default)]
    pub onetime: bool,

    /// Log verbosity.
    #[serde(default)]
    pub verbose: Verbosity,

    /// Root segment of every metric name.
    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// Statistics fetch timeout, in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    /// Whether to emit logs as JSON.
    #[serde(default)]
    pub log_format_json: bool,
}

impl PollerConfig {
    /// Loads the configuration for the given command line.
    ///
    /// # Errors
    ///
    /// If the configuration file cannot be read, or the layered configuration is invalid, an error is returned.
    pub fn load(cli: &Cli) -> Result<Self, ConfigurationError> {
        let mut figment = Figment::new();
        if let Some(path) = &cli.config {
            figment = figment.merge(Yaml::string(&read_config_file(path)?));
        }

        figment
            .merge(Env::prefixed(ENV_PREFIX))
            .merge(Serialized::defaults(cli.overrides()))
            .extract()
            .map_err(Box::new)
            .context(Extract)
    }
}

fn read_config_file(path: &Path) -> Result<String, ConfigurationError> {
    std::fs::read_to_string(path).context(ReadFile { path })
}

/// Validated settings for running the poller.
pub struct PollerSettings {
    pub bind_host: String,
    pub bind_port: u16,
    pub bind_path: String,
    pub bind_file: Option<PathBuf>,
    pub carbon: Option<CarbonAddress>,
    pub interval: Duration,
    pub onetime: bool,
    pub prefix: String,
    pub timeout: Duration,
}

impl PollerSettings {
    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// If a required setting is missing, or any setting is invalid, an error is returned.
    pub fn from_config(config: PollerConfig) -> Result<Self, ConfigurationError> {
        let bind = config.bind.context(MissingBind)?;
        // The statistics address has the same `host:port` shape as the Carbon address.
        let bind = bind
            .parse::<CarbonAddress>()
            .context(InvalidAddress { setting: "BIND statistics" })?;

        let carbon = config
            .carbon
            .map(|carbon| carbon.parse::<CarbonAddress>())
            .transpose()
            .context(InvalidAddress { setting: "Carbon" })?;

        if config.timeout == 0 {
            return ZeroTimeout.fail();
        }

        if config.prefix.is_empty() || config.prefix.starts_with('.') || config.prefix.ends_with('.') {
            return InvalidPrefix { prefix: config.prefix }.fail();
        }

        Ok(Self {
            bind_host: bind.host().to_string(),
            bind_port: bind.port(),
            bind_path: config.bind_path,
            bind_file: config.bind_file,
            carbon,
            interval: Duration::from_secs(config.interval),
            onetime: config.onetime,
            prefix: config.prefix,
            timeout: Duration::from_secs(config.timeout),
        })
    }

    /// Resolves the metric namespace.
    ///
    /// # Errors
    ///
    /// If the host label cannot be determined, an error is returned.
    pub fn namespace(&self) -> Result<MetricNamespace, ConfigurationError> {
        let host = HostLabel::resolve(&self.bind_host).context(ResolveHostLabel)?;
        Ok(MetricNamespace::new(&self.prefix, &host))
    }

    /// Builds the statistics source.
    ///
    /// # Errors
    ///
    /// If the HTTP client cannot be created, an error is returned.
    pub fn source(&self) -> Result<Box<dyn StatsSource>, ConfigurationError> {
        match &self.bind_file {
            Some(path) => Ok(Box::new(FileStatsSource::new(path))),
            None => {
                let source = HttpStatsSource::new(&self.bind_host, self.bind_port, &self.bind_path, self.timeout)
                    .context(Source)?;
                Ok(Box::new(source))
            }
        }
    }

    /// Builds the Carbon transmitter, if a receiver is configured.
    pub fn transmitter(&self) -> Option<Transmitter> {
        self.carbon.clone().map(Transmitter::new)
    }
}
