//! Match decisions: one query embedding against a registry snapshot.
//!
//! Two scoring strategies are supported. `cosine` selects the most similar
//! record and authorizes when its similarity is at least the threshold.
//! `distance` selects the nearest record and authorizes when its distance is
//! at most the tolerance. Both bounds are inclusive.

use crate::registry::Registry;
use crate::types::{Embedding, IdentityRecord};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.55;
pub const DEFAULT_DISTANCE_TOLERANCE: f32 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    #[default]
    Cosine,
    Distance,
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Metric::Cosine => "cosine",
            Metric::Distance => "distance",
        })
    }
}

impl FromStr for Metric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cosine" => Ok(Metric::Cosine),
            "distance" | "euclidean" => Ok(Metric::Distance),
            other => Err(format!("unknown metric {other:?} (expected cosine or distance)")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchConfig {
    pub metric: Metric,
    /// Minimum cosine similarity for a match (inclusive).
    pub threshold: f32,
    /// Maximum Euclidean distance for a match (inclusive).
    pub tolerance: f32,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            metric: Metric::Cosine,
            threshold: DEFAULT_SIMILARITY_THRESHOLD,
            tolerance: DEFAULT_DISTANCE_TOLERANCE,
        }
    }
}

/// Best score found during a comparison, tagged with its metric.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Score {
    Similarity(f32),
    Distance(f32),
}

impl Score {
    pub fn value(&self) -> f32 {
        match *self {
            Score::Similarity(v) | Score::Distance(v) => v,
        }
    }
}

/// Why a request was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reason {
    NoFace,
    NoKnownFaces,
    NotMatched,
}

impl Reason {
    pub fn code(&self) -> &'static str {
        match self {
            Reason::NoFace => "no_face",
            Reason::NoKnownFaces => "no_known_faces",
            Reason::NotMatched => "not_matched",
        }
    }
}

/// Outcome of one recognition request.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub authorized: bool,
    /// Matched identity; set only when authorized.
    pub name: Option<String>,
    /// Best score seen, reported on denial too. `None` when nothing was scored.
    pub score: Option<Score>,
    /// Set only when denied.
    pub reason: Option<Reason>,
}

impl Decision {
    pub fn denied(reason: Reason, score: Option<Score>) -> Self {
        Self {
            authorized: false,
            name: None,
            score,
            reason: Some(reason),
        }
    }

    pub fn authorized(name: String, score: Score) -> Self {
        Self {
            authorized: true,
            name: Some(name),
            score: Some(score),
            reason: None,
        }
    }
}

/// Result of comparing a query against a gallery.
#[derive(Debug, Clone)]
pub struct MatchResult {
    pub matched: bool,
    /// Best score over the gallery; `None` if no record was comparable.
    pub score: Option<Score>,
    /// Index into the gallery of the best record.
    pub best_index: Option<usize>,
}

/// Strategy for comparing a query embedding against a gallery of enrolled faces.
pub trait Matcher {
    fn compare(&self, query: &Embedding, gallery: &[IdentityRecord]) -> MatchResult;
}

/// Cosine similarity matcher. Always iterates every gallery entry.
pub struct CosineMatcher {
    pub threshold: f32,
}

impl Matcher for CosineMatcher {
    fn compare(&self, query: &Embedding, gallery: &[IdentityRecord]) -> MatchResult {
        let mut best: Option<(usize, f32)> = None;

        for (i, record) in comparable(query, gallery) {
            let sim = query.similarity(&record.embedding);
            if best.map_or(true, |(_, b)| sim > b) {
                best = Some((i, sim));
            }
        }

        MatchResult {
            matched: best.is_some_and(|(_, sim)| sim >= self.threshold),
            score: best.map(|(_, sim)| Score::Similarity(sim)),
            best_index: best.map(|(i, _)| i),
        }
    }
}

/// Euclidean distance matcher. Records within the tolerance are candidate
/// matches; the nearest one wins.
pub struct DistanceMatcher {
    pub tolerance: f32,
}

impl Matcher for DistanceMatcher {
    fn compare(&self, query: &Embedding, gallery: &[IdentityRecord]) -> MatchResult {
        let mut best: Option<(usize, f32)> = None;

        for (i, record) in comparable(query, gallery) {
            let dist = query.euclidean_distance(&record.embedding);
            if best.map_or(true, |(_, b)| dist < b) {
                best = Some((i, dist));
            }
        }

        // The nearest record is a candidate iff any record is.
        MatchResult {
            matched: best.is_some_and(|(_, dist)| dist <= self.tolerance),
            score: best.map(|(_, dist)| Score::Distance(dist)),
            best_index: best.map(|(i, _)| i),
        }
    }
}

fn comparable<'a>(
    query: &'a Embedding,
    gallery: &'a [IdentityRecord],
) -> impl Iterator<Item = (usize, &'a IdentityRecord)> + 'a {
    gallery.iter().enumerate().filter(move |(_, record)| {
        let ok = query.is_comparable(&record.embedding);
        if !ok {
            tracing::warn!(
                name = %record.name,
                query_dim = query.dim(),
                record_dim = record.embedding.dim(),
                "skipping record with incompatible embedding"
            );
        }
        ok
    })
}

impl MatchConfig {
    pub fn matcher(&self) -> Box<dyn Matcher> {
        match self.metric {
            Metric::Cosine => Box::new(CosineMatcher {
                threshold: self.threshold,
            }),
            Metric::Distance => Box::new(DistanceMatcher {
                tolerance: self.tolerance,
            }),
        }
    }
}

/// Decide whether `query` matches an identity in `registry`.
pub fn decide(query: &Embedding, registry: &Registry, config: &MatchConfig) -> Decision {
    if registry.is_empty() {
        return Decision::denied(Reason::NoKnownFaces, None);
    }

    let gallery = registry.records();
    let result = config.matcher().compare(query, gallery);

    match (result.matched, result.best_index, result.score) {
        (true, Some(idx), Some(score)) => Decision::authorized(gallery[idx].name.clone(), score),
        _ => Decision::denied(Reason::NotMatched, result.score),
    }
}
