//! Application-level message handlers built on the peer channel.

pub mod presence;
