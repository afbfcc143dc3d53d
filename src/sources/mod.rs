//! # Sources
//!
//! Alternate platforms that may host a playable copy of a track blocked on
//! its origin platform, and the machinery that decides which one to ask
//! first.
//!
//! - [`stats`]: per-source outcome history ([`SourceStatsRegistry`])
//! - [`ranking`]: ordering of candidate sources ([`SourceRanker`])
//! - [`http_resolver`]: the upstream resolver over HTTP ([`HttpResolver`])

pub mod http_resolver;
pub mod ranking;
pub mod stats;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

pub use http_resolver::HttpResolver;
pub use ranking::{NetworkClass, SourceRanker};
pub use stats::{SourceStats, SourceStatsRegistry};

/// Fallback order for sources with no recorded history.
pub const DEFAULT_SOURCE_ORDER: &[&str] = &[
    "kugou", "kuwo", "migu", "qq", "pyncmd", "bilibili", "youtube", "ytdlp", "joox", "bilivideo",
];

/// Hand-assigned audio quality per platform (0-100).
pub const DEFAULT_QUALITY_SEEDS: &[(&str, u8)] = &[
    ("qq", 90),
    ("pyncmd", 92),
    ("migu", 88),
    ("kuwo", 85),
    ("kugou", 80),
    ("joox", 75),
    ("youtube", 65),
    ("ytdlp", 65),
    ("bilibili", 60),
    ("bilivideo", 55),
];

/// Quality score for sources missing from the seed table.
pub const NEUTRAL_QUALITY_SCORE: u8 = 50;

/// Seeded quality score for `source_id`.
pub fn seeded_quality(seeds: &[(&str, u8)], source_id: &str) -> u8 {
    seeds
        .iter()
        .find(|(id, _)| *id == source_id)
        .map(|(_, score)| *score)
        .unwrap_or(NEUTRAL_QUALITY_SCORE)
}

/// A playable match for a track on some source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SongMatch {
    pub url: String,
    /// Source that produced the URL.
    pub source: String,
    /// Bitrate in bits per second, when known.
    #[serde(default)]
    pub br: Option<u32>,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub md5: Option<String>,
}

/// Why a track could not be resolved.
#[derive(Error, Debug, Clone)]
pub enum ResolveError {
    #[error("resolving {track_id} via {source_id} timed out after {timeout:?}")]
    Timeout {
        track_id: String,
        source_id: String,
        timeout: Duration,
    },

    #[error("no playable match for {0}")]
    NotFound(String),

    #[error("upstream resolver failed: {0}")]
    Upstream(String),

    #[error("no candidate sources for {0}")]
    NoSources(String),

    #[error("all {attempts} sources failed for {track_id}: {last}")]
    Exhausted {
        track_id: String,
        attempts: usize,
        last: Box<ResolveError>,
    },
}

/// The upstream resolution call.
///
/// Implementations try `sources` and return the first playable match.
/// Callers wrap every call in a timeout.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, track_id: &str, sources: &[String]) -> Result<SongMatch, ResolveError>;
}
