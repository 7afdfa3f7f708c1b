//! Cross-thread wakeup channels and readiness polling for interlock.
//!
//! This crate provides the low-level platform pieces used by the session layer
//! to park a thread until a transport becomes readable or writable, while
//! keeping that thread abortable from another thread.
//!
//! ## Features
//!
//! - **Wakeup Channels**: self-pipe and `eventfd` implementations behind one trait
//! - **Pair Polling**: a single `poll(2)` over the transport and the wakeup endpoint
//! - **Timeout Mapping**: caller timeouts where `0` means "wait forever"
//!
//! ## Example
//!
//! ```rust,no_run
//! use interlock_wakeup::{open_channel, WakeupKind};
//!
//! # fn example() -> std::io::Result<()> {
//! let channel = open_channel(WakeupKind::Auto)?;
//! channel.signal()?;
//! channel.drain();
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod channel;
pub mod poll;
pub mod timeout;

// Re-export main types
pub use channel::{open_channel, PipeWakeup, UnknownWakeupKind, WakeupChannel, WakeupKind};
#[cfg(any(target_os = "linux", target_os = "android"))]
pub use channel::EventFdWakeup;
pub use poll::{poll_pair, Direction, PairEvents, TransportReadiness};
pub use timeout::{Deadline, WaitTimeout};
