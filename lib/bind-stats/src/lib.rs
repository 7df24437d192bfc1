//! Polling BIND statistics into Carbon.
//!
//! BIND exposes its server, per-zone, and memory counters as an XML document on its statistics channel. This crate
//! fetches that document, parses it into a [`StatsNode`] tree, flattens the tree into dot-delimited Graphite metrics,
//! and drives the poll loop that ships each cycle's batch to Carbon.
#![deny(missing_docs)]

#[doc(hidden)]
pub use anyhow::anyhow as __anyhow;

mod error;
pub use self::error::{CycleError, ErrorContext, GenericError};

mod fetch;
pub use self::fetch::{FetchError, FileStatsSource, HttpStatsSource, StatsFetcher, StatsSource, DEFAULT_FETCH_TIMEOUT};

mod flatten;
pub use self::flatten::{flatten, normalize_label, zone_label, HostLabel, HostLabelError, MetricNamespace, ZONE_CLASS_SUFFIX};

mod poller;
pub use self::poller::{CycleOutcome, CycleReport, Pause, PollLoop, PollState, StopSignalPause};

mod tree;
pub use self::tree::{StatsNode, TreeError};
