//! Vector database contract and the in-process implementation.

use std::collections::BTreeMap;
use std::sync::RwLock;

use async_trait::async_trait;

#[derive(Debug, Clone, PartialEq)]
pub struct VectorResult {
    pub id: String,
    pub score: f64,
}

#[async_trait]
pub trait VectorDb: Send + Sync {
    async fn get(&self, id: &str) -> Option<Vec<f32>>;

    async fn set_batch(&self, entries: Vec<(String, Vec<f32>)>);

    /// Results with cosine similarity at or above `threshold`, best first,
    /// at most `limit` of them.
    async fn search(&self, vector: &[f32], threshold: f64, limit: usize) -> Vec<VectorResult>;
}

pub fn cosine(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() {
        return 0.0;
    }
    let mut dot = 0f64;
    let mut norm_a = 0f64;
    let mut norm_b = 0f64;
    for (x, y) in a.iter().zip(b) {
        dot += f64::from(*x) * f64::from(*y);
        norm_a += f64::from(*x) * f64::from(*x);
        norm_b += f64::from(*y) * f64::from(*y);
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Brute-force in-memory vector index. The production deployment swaps in
/// a real vector database behind the same trait.
#[derive(Debug, Default)]
pub struct MemoryVectorDb {
    inner: RwLock<BTreeMap<String, Vec<f32>>>,
}

impl MemoryVectorDb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("Locking failed").len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().expect("Locking failed").is_empty()
    }
}

#[async_trait]
impl VectorDb for MemoryVectorDb {
    async fn get(&self, id: &str) -> Option<Vec<f32>> {
        self.inner.read().expect("Locking failed").get(id).cloned()
    }

    async fn set_batch(&self, entries: Vec<(String, Vec<f32>)>) {
        let mut inner = self.inner.write().expect("Locking failed");
        for (id, vector) in entries {
            inner.insert(id, vector);
        }
    }

    async fn search(&self, vector: &[f32], threshold: f64, limit: usize) -> Vec<VectorResult> {
        let inner = self.inner.read().expect("Locking failed");
        let mut results: Vec<VectorResult> = inner
            .iter()
            .filter_map(|(id, candidate)| {
                let score = cosine(vector, candidate);
                (threshold <= score).then(|| VectorResult {
                    id: id.clone(),
                    score,
                })
            })
            .collect();
        results.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
        results.truncate(limit);
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn search_honors_threshold_order_and_cap() {
        let db = MemoryVectorDb::new();
        db.set_batch(vec![
            ("exact".into(), vec![1.0, 0.0]),
            ("close".into(), vec![0.9, 0.1]),
            ("orthogonal".into(), vec![0.0, 1.0]),
            ("opposite".into(), vec![-1.0, 0.0]),
        ])
        .await;

        let results = db.search(&[1.0, 0.0], 0.5, 10).await;
        let ids: Vec<&str> = results.iter().map(|result| result.id.as_str()).collect();
        assert_eq!(ids, ["exact", "close"]);
        assert!((results[0].score - 1.0).abs() < 1e-9);

        let capped = db.search(&[1.0, 0.0], 0.5, 1).await;
        assert_eq!(capped.len(), 1);
        assert_eq!(capped[0].id, "exact");
    }

    #[tokio::test]
    async fn get_returns_stored_vectors() {
        let db = MemoryVectorDb::new();
        assert_eq!(db.get("missing").await, None);
        db.set_batch(vec![("id".into(), vec![0.5, 0.5])]).await;
        assert_eq!(db.get("id").await, Some(vec![0.5, 0.5]));
    }

    #[test]
    fn cosine_edge_cases() {
        assert_eq!(cosine(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert!((cosine(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-9);
    }
}
