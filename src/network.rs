//! Peer-to-peer networking for the Okura node.
//!
//! Every protocol runs on its own topic: a two-byte discriminator bound to a
//! fixed TCP port. Connections on all topics share one [`peers::PeerRegistry`]
//! which tracks trust, bans and open connections per peer address.
//!
//! The transport is plaintext TCP. Frames are `magic ++ payload ++ <-END->`
//! and the payload is a [`codec::WireMessage`]; integrity of consensus data
//! relies on the signatures inside transactions and block headers.

pub mod codec;
pub mod peers;
pub mod protocol;
pub mod transport;

pub use codec::{Codec, CodecError, WireMessage};
pub use peers::{PeerAddress, PeerRegistry};
pub use protocol::{Opcode, Topic};
pub use transport::{Inbound, Transport, TransportError};
