//! HTTP control surface for handshake bootstrap and node introspection.

pub mod control;

pub use control::{bind_control_listener, control_router, ControlError, ControlState};
