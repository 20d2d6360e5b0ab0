//! Compile-time configuration defaults.
//!
//! Everything here is a plain constant; sizing beyond these defaults is done
//! through the const generics on the individual types.

/// Largest frame the dispatch layers will emit or accept, in bytes.
pub const MAX_FRAME: usize = 2048;

/// Payload bytes per shared-pool chunk.
pub const MBUF_CHUNK_BYTES: usize = 56;

/// Default packets queued per shared-pool reader.
pub const MBUF_RXPKT: usize = 32;

/// Watchdog for stalled shared-pool writers and readers, in milliseconds.
pub const MBUF_WATCHDOG_MSEC: u32 = 1500;

/// Interval between shared-pool watchdog scans, in milliseconds.
pub const MBUF_SCAN_MSEC: u32 = 100;

/// Default capacity of each polling registry.
pub const POLL_REGISTRY: usize = 32;

/// Default protocol-handler slots per dispatch layer.
pub const DISPATCH_PROTOCOLS: usize = 8;

/// Routing table rows (static plus ephemeral), not counting the default.
pub const ROUTE_TABLE_SIZE: usize = 8;

/// First ARP retry interval in milliseconds; doubles on every attempt.
pub const ARP_RETRY_MSEC: u32 = 100;

/// ARP attempts before a destination is parked unresolved.
pub const ARP_RETRY_MAX: u8 = 8;

/// Listener slots for ARP resolution events.
pub const ARP_LISTENERS: usize = 8;

/// Largest payload per lockstep-pipe frame, in bytes.
pub const TPIPE_MAX_BLOCK: usize = 512;

/// Lockstep-pipe retransmission interval in milliseconds, before jitter.
pub const TPIPE_RETRANSMIT_MSEC: u32 = 500;

/// Lockstep-pipe give-up limit: no acknowledgement progress for this long
/// closes the connection.
pub const TPIPE_TIMEOUT_MSEC: u32 = 30_000;

/// Retry interval while the egress interface refuses a lockstep-pipe frame.
pub const TPIPE_POLL_MSEC: u32 = 10;

/// Time-to-live written into emitted IPv4 headers.
pub const IP_TTL: u8 = 64;

/// First ephemeral UDP source port handed out by the dispatch.
pub const UDP_PORT_EPHEMERAL: u16 = 0xC000;
