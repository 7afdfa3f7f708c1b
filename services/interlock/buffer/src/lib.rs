//! Fixed-capacity duplex ciphertext buffers for interlock engine mode.
//!
//! In engine mode the TLS state machine never touches a socket. Ciphertext
//! arriving from the network is fed into an inbound buffer, and ciphertext the
//! engine produces is queued in an outbound buffer until the caller drains it.
//!
//! ## Properties
//!
//! - **Fixed capacity**: sized once at creation, never grows
//! - **Never blocks**: writers and readers report how much fit or was available
//! - **All-or-nothing feed**: [`DuplexBuffer::offer`] copies the whole chunk or nothing
//! - **Ordered**: bytes come out in the order they went in

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod pair;
pub mod ring;

// Re-export main types
pub use error::BufferError;
pub use pair::{BufferPair, DEFAULT_BUFFER_CAPACITY};
pub use ring::DuplexBuffer;
