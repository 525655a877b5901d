//! Live face recognition broadcast.
//!
//! Frames come from a camera or stream, faces are detected and matched
//! against a gallery of known people, and the results of every frame are
//! pushed as JSON to all connected WebSocket clients.

pub mod capture;
pub mod config;
pub mod error;
pub mod faces;
pub mod logging;
pub mod stream;
