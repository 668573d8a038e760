//! Protocol module containing the envelope codec, announcement format, and
//! token counter.

pub mod announce;
pub mod envelope;
pub mod token;

pub use announce::Announcement;
pub use envelope::{Envelope, ProtocolError};
pub use token::TokenCounter;
