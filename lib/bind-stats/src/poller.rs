use std::{
    fmt,
    sync::mpsc::{Receiver, RecvTimeoutError},
    time::{Duration, Instant, SystemTime},
};

use carbon_pickle::{Transmitter, WireEncoder};
use snafu::ResultExt as _;
use tracing::{debug, error, info, info_span};

use crate::{
    error::{CycleError, EncodingFailed, MalformedStatistics, SinkUnavailable},
    fetch::{StatsFetcher, StatsSource},
    flatten::{flatten, MetricNamespace},
};

/// Poll loop state.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PollState {
    /// Waiting to start the next cycle.
    Idle,

    /// Retrieving the statistics document.
    Fetching,

    /// Mapping the statistics tree to metrics.
    Flattening,

    /// Encoding and sending the metric batch.
    Transmitting,

    /// Waiting out the poll interval.
    Sleeping,

    /// The loop has finished and will not run another cycle.
    Stopped,
}

impl fmt::Display for PollState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Fetching => "fetching",
            Self::Flattening => "flattening",
            Self::Transmitting => "transmitting",
            Self::Sleeping => "sleeping",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// What a successful cycle did with its batch.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CycleOutcome {
    /// The batch was sent to Carbon.
    Sent {
        /// Number of metrics in the batch.
        metrics: usize,

        /// Number of bytes written, including the frame header.
        bytes: usize,
    },

    /// No Carbon receiver is configured, so the batch was dropped.
    Discarded {
        /// Number of metrics in the batch.
        metrics: usize,
    },
}

/// The result of a single poll cycle.
#[derive(Debug)]
pub struct CycleReport {
    /// Sequence number of the cycle, starting at zero.
    pub cycle: u64,

    /// Timestamp shared by every metric in the cycle, in seconds since the Unix epoch.
    pub timestamp: i64,

    /// Time spent processing the cycle.
    pub elapsed: Duration,

    /// The state the cycle ended in before the loop moved to `Sleeping`.
    pub last_state: PollState,

    /// Outcome of the cycle.
    pub result: Result<CycleOutcome, CycleError>,
}

/// Waits between poll cycles.
pub trait Pause {
    /// Waits for `interval` before the next cycle begins.
    ///
    /// Returns `false` if the loop should stop instead of running another cycle.
    fn pause(&mut self, interval: Duration) -> bool;
}

/// Pauses on the current thread until the interval elapses or a stop is requested.
///
/// A stop request is any message received on the channel, typically sent from a termination signal handler. Once
/// every sender is dropped, the pause falls back to sleeping out the full interval.
#[derive(Debug)]
pub struct StopSignalPause {
    stop: Receiver<()>,
}

impl StopSignalPause {
    /// Creates a new `StopSignalPause` that stops the loop when a message arrives on `stop`.
    pub fn new(stop: Receiver<()>) -> Self {
        Self { stop }
    }
}

impl Pause for StopSignalPause {
    fn pause(&mut self, interval: Duration) -> bool {
        match self.stop.recv_timeout(interval) {
            Ok(()) => {
                info!("Received stop request.");
                false
            }
            Err(RecvTimeoutError::Timeout) => true,
            Err(RecvTimeoutError::Disconnected) => {
                std::thread::sleep(interval);
                true
            }
        }
    }
}

/// Polls a statistics source and relays each cycle's metrics to Carbon.
///
/// Each cycle fetches the statistics document, flattens it into a batch stamped with the time the cycle started,
/// and sends the batch as a single frame. Any failure abandons only the current cycle: it is logged and the loop
/// carries on after the usual interval. The interval is a fixed delay applied after each cycle completes, so the
/// effective cadence is the processing time plus the interval.
///
/// When no transmitter is configured, batches are still computed but are dropped instead of being sent.
pub struct PollLoop<S> {
    fetcher: StatsFetcher<S>,
    namespace: MetricNamespace,
    encoder: WireEncoder,
    transmitter: Option<Transmitter>,
    interval: Duration,
    onetime: bool,
    state: PollState,
    cycles: u64,
}

impl<S: StatsSource> PollLoop<S> {
    /// Creates a new `PollLoop`.
    pub fn new(source: S, namespace: MetricNamespace, transmitter: Option<Transmitter>, interval: Duration) -> Self {
        Self {
            fetcher: StatsFetcher::new(source),
            namespace,
            encoder: WireEncoder,
            transmitter,
            interval,
            onetime: false,
            state: PollState::Idle,
            cycles: 0,
        }
    }

    /// Sets whether the loop stops after a single cycle.
    pub fn with_onetime(mut self, onetime: bool) -> Self {
        self.onetime = onetime;
        self
    }

    /// Returns the current state.
    pub fn state(&self) -> PollState {
        self.state
    }

    /// Returns the number of cycles run so far.
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// Runs cycles until the loop stops, pausing with `pause` between them.
    ///
    /// The loop stops after the first cycle in single-shot mode, or when `pause` asks it to. Returns the number of
    /// cycles that were run.
    pub fn run<P: Pause>(&mut self, pause: &mut P) -> u64 {
        info!(
            source = %self.fetcher.source().describe(),
            carbon = %self.carbon_description(),
            interval_secs = self.interval.as_secs_f64(),
            onetime = self.onetime,
            "Starting poll loop."
        );

        loop {
            let report = self.run_cycle();
            self.log_report(&report);

            if self.onetime {
                info!("One time query. Exiting.");
                self.state = PollState::Stopped;
                break;
            }

            debug!(interval_secs = self.interval.as_secs_f64(), "Sleeping until next cycle.");
            if !pause.pause(self.interval) {
                info!("Poll loop stopped.");
                self.state = PollState::Stopped;
                break;
            }

            self.state = PollState::Idle;
        }

        self.cycles
    }

    /// Runs a single cycle, leaving the loop in the `Sleeping` state.
    pub fn run_cycle(&mut self) -> CycleReport {
        let cycle = self.cycles;
        self.cycles += 1;

        let span = info_span!("poll_cycle", cycle);
        let _enter = span.enter();

        info!(carbon = %self.carbon_description(), "Gathering statistics to send to Carbon.");

        let started = Instant::now();
        let timestamp = unix_timestamp();
        let result = self.process(timestamp);
        let last_state = self.state;
        self.state = PollState::Sleeping;

        CycleReport {
            cycle,
            timestamp,
            elapsed: started.elapsed(),
            last_state,
            result,
        }
    }

    fn process(&mut self, timestamp: i64) -> Result<CycleOutcome, CycleError> {
        self.state = PollState::Fetching;
        let tree = self.fetcher.fetch_tree()?;

        self.state = PollState::Flattening;
        let batch = flatten(&tree, &self.namespace, timestamp).context(MalformedStatistics)?;
        debug!(metrics = batch.len(), "Flattened statistics.");

        self.state = PollState::Transmitting;
        let metrics = batch.len();
        let frame = self.encoder.encode(&batch).context(EncodingFailed)?;

        match &self.transmitter {
            Some(transmitter) => {
                let bytes = transmitter.send(&frame).context(SinkUnavailable)?;
                Ok(CycleOutcome::Sent { metrics, bytes })
            }
            None => {
                info!(metrics, "No Carbon host:port specified to send statistics to. Discarding batch.");
                Ok(CycleOutcome::Discarded { metrics })
            }
        }
    }

    fn log_report(&self, report: &CycleReport) {
        let elapsed_secs = report.elapsed.as_secs_f64();
        match &report.result {
            Ok(CycleOutcome::Sent { metrics, bytes }) => info!(
                cycle = report.cycle,
                metrics,
                bytes,
                "Finished sending BIND statistics to Carbon. (Elapsed time: {:.2} seconds.)",
                elapsed_secs
            ),
            Ok(CycleOutcome::Discarded { metrics }) => info!(
                cycle = report.cycle,
                metrics,
                "Finished gathering BIND statistics. (Elapsed time: {:.2} seconds.)",
                elapsed_secs
            ),
            Err(e) => error!(
                cycle = report.cycle,
                kind = e.kind(),
                state = %report.last_state,
                "Abandoned poll cycle: {} (Elapsed time: {:.2} seconds.)",
                e,
                elapsed_secs
            ),
        }
    }

    fn carbon_description(&self) -> String {
        self.transmitter
            .as_ref()
            .map(|transmitter| transmitter.address().to_string())
            .unwrap_or_else(|| "none".to_string())
    }
}

fn unix_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or_default()
}
