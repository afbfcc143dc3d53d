//! Source ranking and two-tier caching for resolving playable URLs of tracks
//! blocked on their origin platform.
//!
//! - [`cache`]: local LRU plus optional shared tier, and the music key scheme
//! - [`sources`]: per-source statistics, ranking and the upstream resolver
//! - [`storage`]: persistence for source statistics
//! - [`service`]: cache-check, rank, resolve, record, cache
//! - [`maintenance`]: periodic sweeps

pub mod cache;
pub mod config;
pub mod maintenance;
pub mod service;
pub mod sources;
pub mod storage;
