//! The sending half of streams.
//!
//! The application writes through the [`Writer`], the packetizer picks the data up through
//! the [`Outgoing`], both share the same sending state.
mod outgoing;
mod sender;
mod sndbuf;
mod writer;

pub use outgoing::Outgoing;
pub(crate) use sender::{ArcSender, Sender};
pub use sndbuf::SendBuf;
pub use writer::Writer;
