//! Core structures of the stream layer of QUIC: stream identifiers, flow control windows,
//! the frame descriptors exchanged with the packet layer, and the stream parameters.

pub mod error;
pub mod flow;
pub mod frame;
pub mod param;
pub mod role;
pub mod sid;
pub mod util;
