//! HTTP fetch seam.
//!
//! Everything that touches the network goes through [`HttpClient`], so the
//! realtime feeds and static bundle downloads can be faked in tests.

mod basic;
mod client;

pub use basic::BasicClient;
pub use client::HttpClient;
