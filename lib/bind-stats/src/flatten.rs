//! Statistics flattening.
//!
//! BIND reports its counters as a tree: server-wide counters grouped by opcode and query type, per-zone counters
//! grouped under each view, and a memory summary. Graphite wants a flat, dot-delimited namespace, so every counter
//! is mapped to a metric name of the form `<prefix>.<host>.<section>...<counter>`.
//!
//! Two layouts of the statistics document are understood:
//!
//! - version 2 (`<isc><bind><statistics version="2.x">`), where counters are `name`/`counter` element pairs and zone
//!   names carry their class (`example.com/IN`), and
//! - version 3 (`<statistics version="3.x">`), where counters are `<counter name="...">` elements grouped by a `type`
//!   attribute and zones carry `name` and `rdataclass` attributes.

use std::{fmt, io};

use carbon_pickle::MetricBatch;
use snafu::{ResultExt as _, Snafu};
use tracing::debug;

use crate::tree::{StatsNode, TreeError, UnexpectedNesting, UnsupportedLayout};

/// Class suffix of zones whose counters are reported.
pub const ZONE_CLASS_SUFFIX: &str = "/IN";

const LOCALHOST: &str = "localhost";

/// An error resolving the host label.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum HostLabelError {
    /// The local hostname could not be queried.
    #[snafu(display("failed to query local hostname: {}", source))]
    LocalHostname {
        /// Source of the error.
        source: io::Error,
    },

    /// The hostname was empty once truncated to its first label.
    #[snafu(display("hostname '{}' has an empty first label", hostname))]
    EmptyLabel {
        /// The hostname that was given.
        hostname: String,
    },
}

/// The `<host>` segment of every metric name.
///
/// This is the first label of the statistics source's hostname, so `ns1.example.com` becomes `ns1`. When the source
/// is `localhost`, the machine's own hostname is used instead.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HostLabel(String);

impl HostLabel {
    /// Resolves the host label for the configured statistics source hostname.
    ///
    /// # Errors
    ///
    /// If the local hostname is needed but cannot be queried, or the resulting label is empty, an error is returned.
    pub fn resolve(configured: &str) -> Result<Self, HostLabelError> {
        Self::resolve_with(configured, || {
            hostname::get().map(|hostname| hostname.to_string_lossy().into_owned())
        })
    }

    /// Resolves the host label, using `local_hostname` to query the machine's hostname when needed.
    ///
    /// # Errors
    ///
    /// If `local_hostname` fails, or the resulting label is empty, an error is returned.
    pub fn resolve_with<F>(configured: &str, local_hostname: F) -> Result<Self, HostLabelError>
    where
        F: FnOnce() -> io::Result<String>,
    {
        let hostname = if configured == LOCALHOST {
            local_hostname().context(LocalHostname)?
        } else {
            configured.to_string()
        };

        match hostname.split('.').next() {
            Some(label) if !label.is_empty() => Ok(Self(label.to_string())),
            _ => EmptyLabel { hostname }.fail(),
        }
    }

    /// Returns the label.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HostLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Builds metric names under a fixed `<prefix>.<host>` root.
#[derive(Clone, Debug)]
pub struct MetricNamespace {
    root: String,
}

impl MetricNamespace {
    /// Creates a new `MetricNamespace`.
    pub fn new(prefix: &str, host: &HostLabel) -> Self {
        Self {
            root: format!("{}.{}", prefix, host),
        }
    }

    /// Returns the `<prefix>.<host>` root.
    pub fn root(&self) -> &str {
        &self.root
    }

    fn metric(&self, segments: &[&str]) -> String {
        let mut name = self.root.clone();
        for segment in segments {
            name.push('.');
            name.push_str(segment);
        }
        name
    }
}

/// Replaces every `.` in `name` with `-`, so it can be used as a single metric name segment.
pub fn normalize_label(name: &str) -> String {
    name.replace('.', "-")
}

/// Returns the metric label for a class-qualified zone name, such as `example.com/IN`.
///
/// Only zones in the `IN` class are reported: for any other name, `None` is returned.
pub fn zone_label(qualified: &str) -> Option<String> {
    qualified.strip_suffix(ZONE_CLASS_SUFFIX).map(normalize_label)
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Layout {
    V2,
    V3,
}

impl Layout {
    fn detect(root: &StatsNode) -> Result<Self, TreeError> {
        let version = root.attribute("version");
        match (root.name(), version) {
            ("isc", _) => Ok(Self::V2),
            ("statistics", Some(version)) if version.starts_with("3.") => Ok(Self::V3),
            (name, version) => UnsupportedLayout {
                root: name,
                version: version.map(str::to_string),
            }
            .fail(),
        }
    }

    fn statistics<'a>(&self, root: &'a StatsNode) -> Result<&'a StatsNode, TreeError> {
        match self {
            Self::V2 => root.require_child("bind")?.require_child("statistics"),
            Self::V3 => Ok(root),
        }
    }

    /// Visits the server counters of the given group: `opcode` or `qtype`.
    fn server_counters<F>(&self, server: &StatsNode, group: &str, mut visit: F) -> Result<(), TreeError>
    where
        F: FnMut(&str, i64),
    {
        match self {
            Self::V2 => {
                let (section, entry) = match group {
                    "opcode" => ("requests", "opcode"),
                    _ => ("queries-in", "rdtype"),
                };
                let Some(section) = server.child(section) else {
                    return Ok(());
                };

                for counter in section.children_named(entry) {
                    let name = counter.require_child("name")?.require_text()?;
                    let value = counter.require_child("counter")?.counter_value()?;
                    visit(name, value);
                }
            }
            Self::V3 => {
                let groups = server
                    .children_named("counters")
                    .filter(|counters| counters.attribute("type") == Some(group));
                for counters in groups {
                    for counter in counters.children_named("counter") {
                        let name = counter.require_attribute("name")?;
                        visit(name, counter.counter_value()?);
                    }
                }
            }
        }

        Ok(())
    }

    fn zone_name(&self, zone: &StatsNode) -> Result<String, TreeError> {
        match self {
            Self::V2 => zone.require_child("name")?.require_text().map(str::to_string),
            Self::V3 => {
                let name = zone.require_attribute("name")?;
                let class = zone.require_attribute("rdataclass")?;
                Ok(format!("{}/{}", name, class))
            }
        }
    }
}

/// Flattens a parsed statistics document into a batch of metrics stamped with `timestamp`.
///
/// Records are ordered as server opcode counters, server query-type counters, zone counters (zones and their
/// counters in document order), then memory summary counters.
///
/// # Errors
///
/// If the document layout is not recognized, an expected element or attribute is missing, a counter value is not an
/// integer, or a zone counter is nested more than one level deep, an error is returned and no metrics are produced.
pub fn flatten(root: &StatsNode, namespace: &MetricNamespace, timestamp: i64) -> Result<MetricBatch, TreeError> {
    let layout = Layout::detect(root)?;
    let statistics = layout.statistics(root)?;
    let server = statistics.require_child("server")?;

    let mut batch = MetricBatch::new(timestamp);

    layout.server_counters(server, "opcode", |opcode, value| {
        batch.push(namespace.metric(&["requests", opcode]), value);
    })?;
    layout.server_counters(server, "qtype", |rdtype, value| {
        batch.push(namespace.metric(&["queries-in", rdtype]), value);
    })?;

    flatten_zones(layout, statistics, namespace, &mut batch)?;
    flatten_memory(statistics, namespace, &mut batch)?;

    Ok(batch)
}

fn flatten_zones(
    layout: Layout, statistics: &StatsNode, namespace: &MetricNamespace, batch: &mut MetricBatch,
) -> Result<(), TreeError> {
    let Some(views) = statistics.child("views") else {
        return Ok(());
    };

    let zones = views
        .children_named("view")
        .filter_map(|view| view.child("zones"))
        .flat_map(|zones| zones.children_named("zone"));

    for zone in zones {
        let qualified = layout.zone_name(zone)?;
        let Some(label) = zone_label(&qualified) else {
            debug!(zone = %qualified, "Skipping zone outside of the IN class.");
            continue;
        };

        for child in zone.children() {
            match child.name() {
                "serial" => batch.push(namespace.metric(&["zone", &label, "serial"]), serial_value(child)?),
                "counters" => {
                    for counter in child.children() {
                        let counter_name = counter.attribute("name").unwrap_or_else(|| counter.name());
                        let value = if counter_name == "serial" {
                            serial_value(counter)?
                        } else if counter.is_leaf() {
                            counter.counter_value()?
                        } else {
                            return UnexpectedNesting { path: counter.path() }.fail();
                        };

                        batch.push(namespace.metric(&["zone", &label, counter_name]), value);
                    }
                }
                _ => {}
            }
        }
    }

    Ok(())
}

// A zone serial is either a bare scalar or wrapped in a single `value` element.
fn serial_value(node: &StatsNode) -> Result<i64, TreeError> {
    match node.children() {
        [] => node.counter_value(),
        [value] if value.name() == "value" && value.is_leaf() => value.counter_value(),
        _ => UnexpectedNesting { path: node.path() }.fail(),
    }
}

fn flatten_memory(statistics: &StatsNode, namespace: &MetricNamespace, batch: &mut MetricBatch) -> Result<(), TreeError> {
    let Some(summary) = statistics.child("memory").and_then(|memory| memory.child("summary")) else {
        return Ok(());
    };

    for element in summary.children() {
        if !element.is_leaf() {
            return UnexpectedNesting { path: element.path() }.fail();
        }

        batch.push(namespace.metric(&["memory", element.name()]), element.counter_value()?);
    }

    Ok(())
}
