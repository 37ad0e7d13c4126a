//! Wire types and shared data model for the overlay tunnel coordinator
//! and agent. Kept dependency-light and free of `tokio` runtime
//! assumptions beyond `AsyncRead`/`AsyncWrite` in [`wire`], so both
//! binaries can pull it in without pulling in each other's concerns.

pub mod config;
pub mod error;
pub mod messages;
pub mod model;
pub mod wire;

pub use error::WireError;
