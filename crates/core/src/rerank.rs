use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const DEFAULT_RRF_K: f64 = 60.0;

/// One ranked hit from a retrieval channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RankedHit {
    pub id: i64,
    pub score: f64,
}

#[async_trait]
pub trait Reranker: Send + Sync {
    async fn rerank(&self, query: &str, channels: &[Vec<RankedHit>], top_n: usize) -> Result<Vec<RankedHit>>;
}

/// Reciprocal rank fusion: `1 / (rank + k)` per channel with 1-based ranks, keeping the best
/// score of an id seen in several channels.
#[derive(Debug, Clone, Copy)]
pub struct RrfReranker {
    pub k: f64,
}

impl Default for RrfReranker {
    fn default() -> Self {
        Self { k: DEFAULT_RRF_K }
    }
}

impl RrfReranker {
    pub fn new(k: f64) -> Self {
        Self { k }
    }

    pub fn fuse(&self, channels: &[Vec<RankedHit>], top_n: usize) -> Vec<RankedHit> {
        let mut best: HashMap<i64, f64> = HashMap::new();
        for channel in channels {
            for (index, hit) in channel.iter().enumerate() {
                let score = 1.0 / ((index + 1) as f64 + self.k);
                best.entry(hit.id)
                    .and_modify(|current| *current = current.max(score))
                    .or_insert(score);
            }
        }

        let mut fused: Vec<RankedHit> = best
            .into_iter()
            .map(|(id, score)| RankedHit { id, score })
            .collect();
        fused.sort_by(|left, right| {
            right
                .score
                .total_cmp(&left.score)
                .then_with(|| left.id.cmp(&right.id))
        });
        fused.truncate(top_n);
        fused
    }
}

#[async_trait]
impl Reranker for RrfReranker {
    async fn rerank(&self, _query: &str, channels: &[Vec<RankedHit>], top_n: usize) -> Result<Vec<RankedHit>> {
        Ok(self.fuse(channels, top_n))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hits(ids: &[i64]) -> Vec<RankedHit> {
        ids.iter().map(|id| RankedHit { id: *id, score: 0.0 }).collect()
    }

    #[test]
    fn duplicate_ids_keep_their_best_rank() {
        let fused = RrfReranker::default().fuse(&[hits(&[1, 2, 3]), hits(&[3, 4])], 10);
        let ids: Vec<_> = fused.iter().map(|hit| hit.id).collect();
        assert_eq!(ids, vec![1, 3, 2, 4]);
        assert!((fused[0].score - 1.0 / 61.0).abs() < f64::EPSILON);
        assert!((fused[1].score - 1.0 / 61.0).abs() < f64::EPSILON);
    }

    #[test]
    fn channel_order_does_not_change_the_result() {
        let vector = hits(&[5, 1, 9]);
        let full_text = hits(&[1, 7]);
        let nl2sql = hits(&[9]);
        let reranker = RrfReranker::new(60.0);

        let forward = reranker.fuse(&[vector.clone(), full_text.clone(), nl2sql.clone()], 5);
        let backward = reranker.fuse(&[nl2sql.clone(), full_text.clone(), vector.clone()], 5);
        let shuffled = reranker.fuse(&[full_text, nl2sql, vector], 5);
        assert_eq!(forward, backward);
        assert_eq!(forward, shuffled);
    }

    #[tokio::test]
    async fn top_n_truncates() -> Result<(), Box<dyn std::error::Error>> {
        let fused = RrfReranker::default()
            .rerank("q", &[hits(&[1, 2, 3, 4])], 2)
            .await?;
        assert_eq!(fused.len(), 2);
        Ok(())
    }
}
