//! Critical-section primitives.
//!
//! All registry and pool mutations in this crate go through one named lock
//! type. On hosted builds that is a plain spinlock; with the `bare-metal`
//! feature it masks interrupts for the bracket, because interrupt handlers
//! are allowed to touch poll-request flags and port buffers. The bracket is
//! always short: locks are never held across user callbacks.

#[cfg(feature = "bare-metal")]
pub use hermit_sync::InterruptSpinMutex as CritMutex;
#[cfg(not(feature = "bare-metal"))]
pub use hermit_sync::SpinMutex as CritMutex;
