//! Infrastructure adapters: sockets, HTTP surface, and on-disk config.

pub mod http;
pub mod network;
pub mod storage;
