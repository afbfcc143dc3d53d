use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;

use super::{SourceStats, SourceStatsRegistry, DEFAULT_SOURCE_ORDER};

/// Sample size a source needs before a poor success rate excludes it.
const MIN_REQUESTS_TO_PENALIZE: u64 = 5;
const MIN_SUCCESS_RATE: f64 = 0.2;

const SUCCESS_WEIGHT: f64 = 0.4;
const QUALITY_WEIGHT: f64 = 0.4;
const SPEED_WEIGHT: f64 = 0.2;
/// Latency at which the speed term reaches zero.
const SPEED_CEILING_MS: f64 = 1000.0;

/// Coarse client bandwidth category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String")]
pub enum NetworkClass {
    #[default]
    #[serde(rename = "wifi")]
    Wifi,
    #[serde(rename = "4g")]
    FourG,
    #[serde(rename = "3g")]
    ThreeG,
    #[serde(rename = "2g")]
    TwoG,
    #[serde(rename = "unknown")]
    Unknown,
}

impl NetworkClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Wifi => "wifi",
            Self::FourG => "4g",
            Self::ThreeG => "3g",
            Self::TwoG => "2g",
            Self::Unknown => "unknown",
        }
    }
}

impl FromStr for NetworkClass {
    type Err = Infallible;

    /// Never fails: unrecognized classes map to [`NetworkClass::Unknown`].
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "wifi" => Self::Wifi,
            "4g" => Self::FourG,
            "3g" => Self::ThreeG,
            "2g" => Self::TwoG,
            _ => Self::Unknown,
        })
    }
}

impl From<String> for NetworkClass {
    fn from(s: String) -> Self {
        s.parse().unwrap_or(Self::Unknown)
    }
}

impl fmt::Display for NetworkClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Composite score of a source, higher is better.
pub fn score(stats: &SourceStats) -> f64 {
    score_with_quality(stats, stats.quality_score as f64)
}

fn score_with_quality(stats: &SourceStats, quality: f64) -> f64 {
    let speed = ((SPEED_CEILING_MS - stats.avg_response_time_ms) / SPEED_CEILING_MS).max(0.0);
    stats.success_rate * SUCCESS_WEIGHT + (quality / 100.0) * QUALITY_WEIGHT + speed * SPEED_WEIGHT
}

fn is_unreliable(stats: &SourceStats) -> bool {
    stats.total_requests > MIN_REQUESTS_TO_PENALIZE && stats.success_rate < MIN_SUCCESS_RATE
}

fn is_heavy(stats: &SourceStats) -> bool {
    stats.quality_score > 85 && stats.avg_response_time_ms > 300.0
}

fn descending(a: f64, b: f64) -> Ordering {
    b.partial_cmp(&a).unwrap_or(Ordering::Equal)
}

/// Orders candidate sources from the registry's current snapshot.
///
/// Pure over that snapshot: nothing is cached and two calls without an
/// intervening `record_result` agree.
#[derive(Debug, Clone)]
pub struct SourceRanker {
    registry: Arc<SourceStatsRegistry>,
}

impl SourceRanker {
    pub fn new(registry: Arc<SourceStatsRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &SourceStatsRegistry {
        &self.registry
    }

    /// Known sources sorted by score, then unknown ones in default order.
    ///
    /// Unreliable sources are dropped unless that would drop every known
    /// candidate, in which case they are ranked like the rest.
    pub fn rank_sources(&self, candidates: &[String]) -> Vec<String> {
        self.ranked_with_stats(candidates)
            .into_iter()
            .map(|(id, _)| id)
            .collect()
    }

    /// [`rank_sources`](Self::rank_sources) biased for the client's bandwidth.
    pub fn adjust_sources_for_network(
        &self,
        candidates: &[String],
        network: NetworkClass,
    ) -> Vec<String> {
        let ranked = self.ranked_with_stats(candidates);

        let adjusted: Vec<(String, Option<SourceStats>)> = match network {
            NetworkClass::Wifi | NetworkClass::Unknown => ranked,
            NetworkClass::FourG => {
                let (mut known, unknown): (Vec<_>, Vec<_>) =
                    ranked.into_iter().partition(|(_, stats)| stats.is_some());

                known.sort_by(|(_, a), (_, b)| match (a, b) {
                    (Some(a), Some(b)) => descending(four_g_score(a), four_g_score(b)),
                    _ => Ordering::Equal,
                });
                known.extend(unknown);
                known
            }
            NetworkClass::ThreeG | NetworkClass::TwoG => ranked
                .into_iter()
                .filter(|(_, stats)| !stats.as_ref().is_some_and(is_heavy))
                .collect(),
        };

        let order: Vec<String> = adjusted.into_iter().map(|(id, _)| id).collect();
        debug!("📶 Orden para red {}: {:?}", network, order);
        order
    }

    /// Head of [`rank_sources`](Self::rank_sources).
    pub fn get_best_source(&self, candidates: &[String]) -> Option<String> {
        self.rank_sources(candidates).into_iter().next()
    }

    fn ranked_with_stats(&self, candidates: &[String]) -> Vec<(String, Option<SourceStats>)> {
        let mut seen = HashSet::new();
        let mut known = Vec::new();
        let mut unknown = Vec::new();

        for id in candidates {
            if !seen.insert(id.as_str()) {
                continue;
            }
            match self.registry.get(id) {
                Some(stats) => known.push((id.clone(), stats)),
                None => unknown.push(id.clone()),
            }
        }

        let reliable: Vec<_> = known
            .iter()
            .filter(|(_, stats)| !is_unreliable(stats))
            .cloned()
            .collect();
        let mut scored = if reliable.is_empty() && unknown.is_empty() {
            known
        } else {
            reliable
        };

        // stable: equal scores keep candidate order
        scored.sort_by(|(_, a), (_, b)| descending(score(a), score(b)));

        unknown.sort_by_key(|id| default_position(id));

        scored
            .into_iter()
            .map(|(id, stats)| (id, Some(stats)))
            .chain(unknown.into_iter().map(|id| (id, None)))
            .collect()
    }
}

fn four_g_score(stats: &SourceStats) -> f64 {
    let mut quality = stats.quality_score as f64;
    if stats.quality_score > 90 && stats.avg_response_time_ms > 500.0 {
        quality *= 0.8;
    }
    score_with_quality(stats, quality)
}

/// Position in [`DEFAULT_SOURCE_ORDER`], sources outside it last.
fn default_position(id: &str) -> usize {
    DEFAULT_SOURCE_ORDER
        .iter()
        .position(|known| *known == id)
        .unwrap_or(DEFAULT_SOURCE_ORDER.len())
}
