//! Framing shared by both ends of a socket relay.
//!
//! - **codec**: length-prefixed JSON frames over any AsyncRead/AsyncWrite
//! - **handshake**: the first frame a worker sends so the parent can pair the
//!   connection with the process it spawned

pub mod codec;
pub mod handshake;
