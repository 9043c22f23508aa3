//! Weighted rank fusion across retrievers.
//!
//! Each input list is normalized on its own (rank-based or min-max), scaled by
//! its weight and summed per document; documents missing from a list get
//! nothing from it. Contributions are summed in sorted order so the result does
//! not depend on the order the lists were given in.

use super::Retriever;
use crate::types::{DocId, Document, RetrievalResult, ScoredDocument};
use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Normalization {
    /// `1 / (k + rank)`, rank starting at 1
    ReciprocalRank { k: usize },
    /// `(s - min) / (max - min)`; a constant list normalizes to 1.0
    MinMax,
}

impl Default for Normalization {
    fn default() -> Self {
        Normalization::ReciprocalRank { k: 60 }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RankFusion {
    pub normalization: Normalization,
    /// Output size; `None` uses the smallest limit among the inputs
    pub limit: Option<usize>,
}

impl RankFusion {
    pub fn reciprocal_rank(k: usize) -> Self {
        Self { normalization: Normalization::ReciprocalRank { k }, limit: None }
    }

    pub fn min_max() -> Self {
        Self { normalization: Normalization::MinMax, limit: None }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn fuse(&self, lists: &[RetrievalResult], weights: &[f32]) -> Result<RetrievalResult> {
        validate_weights(weights, lists.len())?;

        let limit = self
            .limit
            .or_else(|| lists.iter().map(|l| l.limit).min())
            .unwrap_or(0);

        let mut contributions: BTreeMap<DocId, (Document, Vec<f32>)> = BTreeMap::new();
        for (list, &weight) in lists.iter().zip(weights) {
            for (hit, normalized) in list.hits.iter().zip(self.normalize(list)) {
                contributions
                    .entry(hit.document.id)
                    .or_insert_with(|| (hit.document.clone(), Vec::new()))
                    .1
                    .push(weight * normalized);
            }
        }

        let hits = contributions
            .into_values()
            .map(|(document, mut parts)| {
                parts.sort_by(|a, b| a.total_cmp(b));
                ScoredDocument { document, score: parts.iter().sum() }
            })
            .collect();

        let fused = RetrievalResult::new(hits, limit);
        debug!("[FUSION] {} lists -> {} hits", lists.len(), fused.len());
        Ok(fused)
    }

    fn normalize(&self, list: &RetrievalResult) -> Vec<f32> {
        match self.normalization {
            Normalization::ReciprocalRank { k } => (0..list.hits.len())
                .map(|rank| 1.0 / (k + rank + 1) as f32)
                .collect(),
            Normalization::MinMax => {
                let Some((min, max)) = min_max(list) else {
                    return Vec::new();
                };
                let range = max - min;
                list.hits
                    .iter()
                    .map(|h| if range < f32::EPSILON { 1.0 } else { (h.score - min) / range })
                    .collect()
            }
        }
    }
}

fn min_max(list: &RetrievalResult) -> Option<(f32, f32)> {
    let mut scores = list.hits.iter().map(|h| h.score);
    let first = scores.next()?;
    Some(scores.fold((first, first), |(lo, hi), s| (lo.min(s), hi.max(s))))
}

pub fn validate_weights(weights: &[f32], lists: usize) -> Result<()> {
    if weights.len() != lists {
        return Err(Error::InvalidWeights(format!(
            "{} weights for {} result lists",
            weights.len(),
            lists
        )));
    }
    if let Some(bad) = weights.iter().find(|w| !w.is_finite() || **w < 0.0) {
        return Err(Error::InvalidWeights(format!("weight {bad} must be finite and non-negative")));
    }
    Ok(())
}

pub struct EnsembleMember {
    pub retriever: Arc<dyn Retriever>,
    /// Candidates requested from this member
    pub k: usize,
    pub weight: f32,
}

/// Queries every member and fuses their lists
pub struct EnsembleRetriever {
    members: Vec<EnsembleMember>,
    fusion: RankFusion,
}

impl EnsembleRetriever {
    pub fn new(members: Vec<EnsembleMember>, fusion: RankFusion) -> Result<Self> {
        let weights: Vec<f32> = members.iter().map(|m| m.weight).collect();
        validate_weights(&weights, members.len())?;
        if members.is_empty() {
            return Err(Error::InvalidWeights("ensemble has no members".to_string()));
        }
        Ok(Self { members, fusion })
    }
}

#[async_trait]
impl Retriever for EnsembleRetriever {
    async fn query(&self, text: &str, k: usize) -> Result<RetrievalResult> {
        let mut lists = Vec::with_capacity(self.members.len());
        let mut weights = Vec::with_capacity(self.members.len());

        for member in &self.members {
            lists.push(member.retriever.query(text, member.k).await?);
            weights.push(member.weight);
        }

        self.fusion.with_limit(k).fuse(&lists, &weights)
    }

    fn name(&self) -> &str {
        "ensemble"
    }
}
