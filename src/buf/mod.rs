//! Packet and byte FIFOs.
//!
//! [`PacketBuffer`] is the single-producer/single-consumer workhorse that
//! hardware ports and sockets queue records through; the [`multi`] module
//! shares one pool of fixed-size chunks across many ports so that inbound
//! packets are delivered by reference instead of by copy.

pub mod multi;
mod packet;

pub use self::packet::PacketBuffer;

/// A byte FIFO with no packet boundaries.
pub type StreamBuffer<'a, const CAP: usize> = PacketBuffer<'a, CAP, 0>;
