//! Adapter defaults
//!
//! Default values and limits used across the relay adapter for consistency.

/// Ethernet framing limits
pub mod ethernet {
    /// Length of a MAC address in bytes
    pub const ADDRESS_LENGTH: usize = 6;

    /// Destination + source + ethertype
    pub const HEADER_SIZE: usize = 14;

    /// Maximum payload carried by one frame
    pub const MAX_DATA_SIZE: usize = 1500;

    /// Maximum frame size including the header
    pub const MAX_PACKET_SIZE: usize = HEADER_SIZE + MAX_DATA_SIZE;

    /// Smallest frame a transport may legally hand us
    pub const MIN_PACKET_SIZE: usize = 60;
}

/// Transfer pool sizing
pub mod pools {
    /// Outbound transfer blocks per adapter
    pub const MAX_BUSY_SENDS: usize = 20;

    /// Inbound transfer blocks per adapter
    pub const MAX_BUSY_RECVS: usize = 20;

    /// Receive replenishment fires once the busy count drops below this
    pub const RECV_LOW_WATERMARK: usize = 10;

    /// Upper bound accepted by validation for either pool
    pub const MAX_POOL_SIZE: usize = 1024;
}

/// Adapter behaviour
pub mod adapter {
    /// Adapter name used when the configuration does not provide one
    pub const DEFAULT_NAME: &str = "relay0";

    /// Description reported for the virtual interface
    pub const DEFAULT_DESCRIPTION: &str = "Relay Virtual Ethernet Adapter";

    /// Multicast addresses the adapter can track
    pub const MAX_MULTICAST_LIST: usize = 32;

    /// Link speed in kbps reported until the transport answers the query
    pub const DEFAULT_LINK_SPEED_KBPS: u64 = 100_000;

    /// Consecutive hard receive errors tolerated before reads stop
    pub const MAX_CONSECUTIVE_RECV_ERRORS: u32 = 8;

    /// Interval between diagnostic checks while halt waits (milliseconds)
    pub const HALT_CHECK_INTERVAL_MS: u64 = 2_000;
}

/// Notification defaults
pub mod notification {
    /// Channel the transport announces itself on when it becomes available
    pub const TRANSPORT_READY_CHANNEL: &str = "relay.transport.ready";
}
