//! Discovery announcement payload.
//!
//! The heartbeat datagram is a fixed 8-byte payload broadcast on the
//! discovery UDP port:
//!
//! ```text
//! [control_port: u32 LE][pid: u32 LE]
//! ```
//!
//! The control port tells receivers where to bootstrap a connection; the
//! process id lets a node recognize its own broadcast when it arrives back
//! on a local interface. Both integers are little-endian. Datagrams of any
//! other length are malformed and dropped by the receiver.

use thiserror::Error;

/// Fixed UDP port the discovery engine binds and broadcasts on.
pub const DISCOVERY_PORT: u16 = 9887;

/// Exact length of an announcement datagram in bytes.
pub const ANNOUNCEMENT_LEN: usize = 8;

/// Errors produced while decoding an announcement datagram.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AnnouncementError {
    /// The datagram is not exactly [`ANNOUNCEMENT_LEN`] bytes.
    #[error("announcement must be exactly {ANNOUNCEMENT_LEN} bytes, got {0}")]
    WrongLength(usize),

    /// The encoded control port does not fit in a u16 or is zero.
    #[error("announced control port {0} is out of range")]
    InvalidPort(u32),
}

/// One decoded discovery heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Announcement {
    /// TCP port of the announcing node's control surface.
    pub control_port: u16,
    /// OS process id of the announcing node.
    pub pid: u32,
}

impl Announcement {
    /// Encodes this announcement into the fixed wire layout.
    pub fn encode(&self) -> [u8; ANNOUNCEMENT_LEN] {
        let mut buf = [0u8; ANNOUNCEMENT_LEN];
        buf[..4].copy_from_slice(&u32::from(self.control_port).to_le_bytes());
        buf[4..].copy_from_slice(&self.pid.to_le_bytes());
        buf
    }

    /// Decodes an announcement from a received datagram.
    ///
    /// # Errors
    ///
    /// Returns [`AnnouncementError::WrongLength`] unless the datagram is
    /// exactly 8 bytes, and [`AnnouncementError::InvalidPort`] when the port
    /// field is zero or exceeds `u16::MAX`.
    pub fn decode(datagram: &[u8]) -> Result<Self, AnnouncementError> {
        if datagram.len() != ANNOUNCEMENT_LEN {
            return Err(AnnouncementError::WrongLength(datagram.len()));
        }

        let raw_port = u32::from_le_bytes([datagram[0], datagram[1], datagram[2], datagram[3]]);
        let pid = u32::from_le_bytes([datagram[4], datagram[5], datagram[6], datagram[7]]);

        let control_port =
            u16::try_from(raw_port).map_err(|_| AnnouncementError::InvalidPort(raw_port))?;
        if control_port == 0 {
            return Err(AnnouncementError::InvalidPort(raw_port));
        }

        Ok(Self { control_port, pid })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
