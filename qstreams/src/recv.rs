//! The receiving half of streams.
//!
//! A stream receives fragments from the peer in any order, the [`RecvBuf`] reassembles them.
//! The application reads them through the [`Reader`], the protocol side feeds them
//! through the [`Incoming`], both share the same receiving state.
mod incoming;
mod rcvbuf;
mod reader;
mod recver;

pub use incoming::Incoming;
pub use rcvbuf::RecvBuf;
pub use reader::Reader;
pub(crate) use recver::{ArcRecver, Recver};
