use bytes::{BufMut as _, Bytes, BytesMut};
use serde_pickle::SerOptions;
use snafu::{OptionExt as _, ResultExt as _, Snafu};
use tracing::trace;

use crate::metric::MetricBatch;

/// Length of the frame header, in bytes.
pub const FRAME_HEADER_LEN: usize = 4;

/// An encoding error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum EncodeError {
    /// The batch could not be pickled.
    #[snafu(display("failed to pickle metric batch: {}", source))]
    Pickle {
        /// Source of the error.
        source: serde_pickle::Error,
    },

    /// The pickled batch does not fit in the frame's length prefix.
    #[snafu(display("pickled batch of {} bytes exceeds the maximum frame size", payload_len))]
    FrameTooLarge {
        /// Length of the pickled payload.
        payload_len: usize,
    },
}

/// Encodes metric batches into Carbon pickle frames.
///
/// A frame is a 4-byte, big-endian payload length followed by the payload itself: a pickled list of
/// `(name, (timestamp, value))` tuples. Pickle protocol 2 is used, as it is understood by every Carbon release.
/// One frame always carries one entire batch; there is no chunking or compression.
#[derive(Clone, Copy, Debug, Default)]
pub struct WireEncoder;

impl WireEncoder {
    /// Encodes the batch into a single length-prefixed frame.
    ///
    /// # Errors
    ///
    /// If the batch cannot be pickled, or the resulting payload is longer than `u32::MAX` bytes, an error is returned.
    pub fn encode(&self, batch: &MetricBatch) -> Result<Bytes, EncodeError> {
        let payload = serde_pickle::to_vec(batch.records(), SerOptions::new().proto_v2()).context(Pickle)?;
        let payload_len = u32::try_from(payload.len()).ok().context(FrameTooLarge {
            payload_len: payload.len(),
        })?;

        let mut frame = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());
        frame.put_u32(payload_len);
        frame.put_slice(&payload);

        trace!(metrics = batch.len(), payload_len, "Encoded metric batch.");

        Ok(frame.freeze())
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use serde_pickle::DeOptions;

    use super::*;

    fn split_frame(frame: &[u8]) -> (usize, &[u8]) {
        let header: [u8; FRAME_HEADER_LEN] = frame[..FRAME_HEADER_LEN].try_into().unwrap();
        (u32::from_be_bytes(header) as usize, &frame[FRAME_HEADER_LEN..])
    }

    #[test]
    fn frame_layout() {
        let mut batch = MetricBatch::new(1_700_000_000);
        batch.push("dns.ns1.queries-in.A", 100);
        batch.push("dns.ns1.zone.foo-com.success", 5);

        let frame = WireEncoder.encode(&batch).expect("should not fail to encode batch");
        let (payload_len, payload) = split_frame(&frame);

        assert_eq!(payload_len, payload.len());
        // PROTO opcode, protocol version 2.
        assert_eq!(&payload[..2], &[0x80, 0x02]);

        let decoded: Vec<(String, (i64, i64))> =
            serde_pickle::from_slice(payload, DeOptions::new()).expect("should not fail to unpickle payload");
        assert_eq!(
            decoded,
            vec![
                ("dns.ns1.queries-in.A".to_string(), (1_700_000_000, 100)),
                ("dns.ns1.zone.foo-com.success".to_string(), (1_700_000_000, 5)),
            ]
        );
    }

    #[test]
    fn empty_batch_is_an_empty_list() {
        let frame = WireEncoder.encode(&MetricBatch::new(0)).expect("should not fail to encode batch");
        let (payload_len, payload) = split_frame(&frame);
        assert_eq!(payload_len, payload.len());

        let decoded: Vec<(String, (i64, i64))> =
            serde_pickle::from_slice(payload, DeOptions::new()).expect("should not fail to unpickle payload");
        assert!(decoded.is_empty());
    }

    #[test]
    fn float_values_survive() {
        let mut batch = MetricBatch::new(42);
        batch.push("dns.ns1.memory.Ratio", 0.25);

        let frame = WireEncoder.encode(&batch).expect("should not fail to encode batch");
        let decoded: Vec<(String, (i64, f64))> =
            serde_pickle::from_slice(&frame[FRAME_HEADER_LEN..], DeOptions::new()).expect("should not fail to unpickle");
        assert_eq!(decoded, vec![("dns.ns1.memory.Ratio".to_string(), (42, 0.25))]);
    }

    proptest! {
        #[test]
        fn length_prefix_matches_payload(
            timestamp in 0i64..4_000_000_000,
            metrics in prop::collection::vec(("[a-z]{1,8}(\\.[a-zA-Z0-9-]{1,12}){1,5}", any::<i64>()), 0..64),
        ) {
            let mut batch = MetricBatch::new(timestamp);
            for (name, value) in &metrics {
                batch.push(name.as_str(), *value);
            }

            let frame = WireEncoder.encode(&batch).expect("should not fail to encode batch");
            let (payload_len, payload) = split_frame(&frame);
            prop_assert_eq!(payload_len, payload.len());

            let decoded: Vec<(String, (i64, i64))> =
                serde_pickle::from_slice(payload, DeOptions::new()).expect("should not fail to unpickle payload");
            prop_assert_eq!(decoded.len(), metrics.len());
            prop_assert!(decoded.iter().all(|(_, (ts, _))| *ts == timestamp));
        }
    }
}
