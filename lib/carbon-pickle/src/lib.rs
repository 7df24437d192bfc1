//! Metric records and the Carbon pickle protocol.
//!
//! Carbon's pickle receiver accepts batches of metrics as a pickled list of `(name, (timestamp, value))` tuples,
//! framed by a 4-byte big-endian length prefix. This crate provides the record types, the frame encoder, and a
//! one-shot TCP transmitter for delivering a frame to a receiver.
#![deny(missing_docs)]

mod encoder;
pub use self::encoder::{EncodeError, WireEncoder, FRAME_HEADER_LEN};

mod metric;
pub use self::metric::{MetricBatch, MetricRecord, MetricValue};

mod transmit;
pub use self::transmit::{AddressError, CarbonAddress, TransmitError, Transmitter, DEFAULT_TRANSMIT_TIMEOUT};
