//! # lanlink-core
//!
//! Shared protocol crate for lanlink containing the JSON line envelope codec,
//! the discovery announcement format, and the RPC token counter.
//!
//! This crate is used by every lanlink node. It has zero dependencies on
//! sockets, OS APIs, or the async runtime, so the protocol can be exercised
//! in plain unit tests and benches.
//!
//! Two wire formats live here:
//!
//! - **`protocol::envelope`** – the peer channel format: one UTF-8 JSON object
//!   per line, newline-terminated, with reserved `_Message_` and `_Token_`
//!   fields and `_Result_` replies.
//!
//! - **`protocol::announce`** – the discovery heartbeat: a fixed 8-byte UDP
//!   payload carrying the announcing node's control port and process id.

pub mod protocol;

pub use protocol::announce::{Announcement, AnnouncementError, ANNOUNCEMENT_LEN, DISCOVERY_PORT};
pub use protocol::envelope::{Envelope, ProtocolError, RESULT_MESSAGE};
pub use protocol::token::TokenCounter;

/// Identity of a remote node's control address, used as the peer-table key
/// everywhere: in the broker's pending/established maps and in the discovery
/// engine's known-host set.
pub type PeerEndpoint = std::net::SocketAddr;
