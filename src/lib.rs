//! Reachwatch Backend Library
//!
//! Prefix outage and recovery detection over a live BGP update feed.
//! Exposes the core modules for the `reachwatch` binary and the integration tests.

pub mod config;
pub mod enrichment; // origin name/region lookup for closed windows
pub mod feed;
pub mod models;
pub mod outage;
pub mod storage;
