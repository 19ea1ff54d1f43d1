//! The parameters one endpoint offers for the stream layer of a connection.
//!
//! Each endpoint builds its own [`StreamParameters`], and learns those of the peer during the
//! handshake, just like QUIC transport parameters. The engine takes both:
//! the local ones decide what the peer may send to us, the peer's ones decide what we may send.

use derive_builder::Builder;
use getset::CopyGetters;
use serde::{Deserialize, Serialize};

use crate::sid::MAX_STREAMS_LIMIT;

/// The largest value a variable-length integer of QUIC can carry.
pub const VARINT_MAX: u64 = (1 << 62) - 1;

/// Flow control and concurrency parameters of one endpoint.
///
/// # Example
///
/// ```
/// use qbase::param::StreamParameters;
///
/// let params = StreamParameters::builder()
///     .initial_max_data(1 << 20)
///     .initial_max_streams_bidi(300)
///     .build()
///     .unwrap();
/// assert_eq!(params.initial_max_streams_bidi(), 300);
/// assert!(params.auto_tune());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Builder, CopyGetters, Serialize, Deserialize)]
#[builder(default, build_fn(validate = "Self::validate"))]
#[getset(get_copy = "pub")]
#[serde(default)]
pub struct StreamParameters {
    /// The initial connection-level window offered to the peer.
    initial_max_data: u64,
    /// The initial window offered for bidirectional streams opened locally.
    initial_max_stream_data_bidi_local: u64,
    /// The initial window offered for bidirectional streams opened by peer.
    initial_max_stream_data_bidi_remote: u64,
    /// The initial window offered for unidirectional streams opened by peer.
    initial_max_stream_data_uni: u64,
    /// The number of concurrent bidirectional streams the peer may open.
    initial_max_streams_bidi: u64,
    /// The number of concurrent unidirectional streams the peer may open.
    initial_max_streams_uni: u64,
    /// The bound of the connection-level window when auto-tuning.
    max_data_window: u64,
    /// The bound of every stream-level window when auto-tuning.
    max_stream_data_window: u64,
    /// Whether receive windows grow with the observed consumption rate.
    auto_tune: bool,
}

impl Default for StreamParameters {
    fn default() -> Self {
        Self {
            initial_max_data: 768 * 1024,
            initial_max_stream_data_bidi_local: 512 * 1024,
            initial_max_stream_data_bidi_remote: 512 * 1024,
            initial_max_stream_data_uni: 512 * 1024,
            initial_max_streams_bidi: 100,
            initial_max_streams_uni: 100,
            max_data_window: 15 * 1024 * 1024,
            max_stream_data_window: 6 * 1024 * 1024,
            auto_tune: true,
        }
    }
}

impl StreamParameters {
    pub fn builder() -> StreamParametersBuilder {
        StreamParametersBuilder::default()
    }
}

impl StreamParametersBuilder {
    fn validate(&self) -> Result<(), String> {
        let defaults = StreamParameters::default();
        let pick = |v: Option<u64>, d: u64| v.unwrap_or(d);

        for (name, value) in [
            ("initial_max_streams_bidi", pick(self.initial_max_streams_bidi, defaults.initial_max_streams_bidi)),
            ("initial_max_streams_uni", pick(self.initial_max_streams_uni, defaults.initial_max_streams_uni)),
        ] {
            if value > MAX_STREAMS_LIMIT {
                return Err(format!("{name} {value} exceeds {MAX_STREAMS_LIMIT}"));
            }
        }

        let max_data = pick(self.initial_max_data, defaults.initial_max_data);
        let max_data_window = pick(self.max_data_window, defaults.max_data_window);
        let max_stream_data_window =
            pick(self.max_stream_data_window, defaults.max_stream_data_window);
        let stream_windows = [
            pick(self.initial_max_stream_data_bidi_local, defaults.initial_max_stream_data_bidi_local),
            pick(self.initial_max_stream_data_bidi_remote, defaults.initial_max_stream_data_bidi_remote),
            pick(self.initial_max_stream_data_uni, defaults.initial_max_stream_data_uni),
        ];

        if max_data_window > VARINT_MAX || max_stream_data_window > VARINT_MAX {
            return Err(format!("window maxima must not exceed {VARINT_MAX}"));
        }
        if max_data > max_data_window {
            return Err(format!(
                "initial_max_data {max_data} exceeds max_data_window {max_data_window}"
            ));
        }
        if let Some(window) = stream_windows.iter().find(|w| **w > max_stream_data_window) {
            return Err(format!(
                "initial stream window {window} exceeds max_stream_data_window {max_stream_data_window}"
            ));
        }
        Ok(())
    }
}
