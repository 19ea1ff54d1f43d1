use std::{fmt, ops};

use serde::{Deserialize, Serialize};

/// The endpoint role on a connection.
///
/// The least significant bit of a [`StreamId`](crate::sid::StreamId) records which role
/// initiated the stream: client-initiated streams are even, server-initiated streams are odd.
/// Both roles may open streams, the role only decides which half of the identifier space
/// an endpoint allocates from.
///
/// # Example
///
/// ```
/// use qbase::role::Role;
///
/// let local = Role::Client;
/// assert_eq!(!local, Role::Server);
/// ```
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub enum Role {
    /// The endpoint that initiated the connection
    Client = 0,
    /// The endpoint that accepted the connection
    Server = 1,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match *self {
            Self::Client => "client",
            Self::Server => "server",
        })
    }
}

impl ops::Not for Role {
    type Output = Self;

    fn not(self) -> Self {
        match self {
            Self::Client => Self::Server,
            Self::Server => Self::Client,
        }
    }
}
