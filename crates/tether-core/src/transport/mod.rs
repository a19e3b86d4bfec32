//! Wire transport for plugin links.
//!
//! A link is any tokio byte stream (a TCP socket for real plugin processes,
//! an in-memory duplex pipe for in-process links) carrying length-prefixed
//! JSON frames. All endpoints of one broker pair are multiplexed over it.
//!
//! # Architecture
//!
//! - **Frame**: wire message types, status codes and framing
//! - **Link**: reader/writer tasks, request correlation, teardown

pub mod frame;
pub mod link;

pub use frame::{Code, Frame, Status};
pub use link::Link;
