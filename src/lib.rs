//! LiveBundle - over-the-air bundle distribution and hot-swap
//!
//! `engine` holds the update machinery (storage client, cache, coordinator)
//! and its dev tooling; `bridge` is what a host application embeds.

pub mod bridge;
pub mod engine;
