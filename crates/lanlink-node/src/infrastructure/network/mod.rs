//! Peer networking: UDP discovery, the TCP handshake broker, and the framed
//! message channel that rides on established connections.

pub mod broker;
pub mod channel;
pub mod discovery;

pub use broker::{Broker, BrokerConfig, BrokerError, HandshakeError, PeerInfo};
pub use channel::{spawn_receive_loop, ChannelError, Connection, HandlerRegistry, MessageHandler};
pub use discovery::{Discovery, DiscoveryConfig, DiscoveryError};
