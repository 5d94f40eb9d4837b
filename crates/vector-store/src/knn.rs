//! Flat cosine k-NN index.
//!
//! Brute force over normalized vectors. At single-user scale (tens of
//! thousands of chunks) an exact scan is fast and removes a whole class of
//! recall bugs; the store surface would admit an ANN structure later
//! without touching callers.

use crate::embedder::cosine_similarity;
use crate::error::{Result, VectorStoreError};
use std::collections::HashMap;

pub struct CosineIndex {
    dimension: usize,
    vectors: HashMap<String, Vec<f32>>,
}

impl CosineIndex {
    #[must_use]
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            vectors: HashMap::new(),
        }
    }

    #[must_use]
    pub const fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn add(&mut self, id: String, vector: Vec<f32>) -> Result<()> {
        if vector.len() != self.dimension {
            return Err(VectorStoreError::InvalidDimension {
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        self.vectors.insert(id, vector);
        Ok(())
    }

    pub fn remove(&mut self, id: &str) -> bool {
        self.vectors.remove(id).is_some()
    }

    /// Top-`k` ids by cosine similarity, restricted to ids accepted by
    /// `admit`. Scores sort descending; ties break on id for determinism.
    pub fn search<F>(&self, query: &[f32], k: usize, admit: F) -> Result<Vec<(String, f32)>>
    where
        F: Fn(&str) -> bool,
    {
        if query.len() != self.dimension {
            return Err(VectorStoreError::InvalidDimension {
                expected: self.dimension,
                actual: query.len(),
            });
        }
        if k == 0 {
            return Ok(Vec::new());
        }

        let mut scored: Vec<(String, f32)> = self
            .vectors
            .iter()
            .filter(|(id, _)| admit(id))
            .map(|(id, vector)| (id.clone(), cosine_similarity(query, vector)))
            .collect();

        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        scored.truncate(k);
        Ok(scored)
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Vec<f32>> {
        self.vectors.get(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn returns_nearest_first() {
        let mut index = CosineIndex::new(3);
        index.add("exact".into(), vec![1.0, 0.0, 0.0]).unwrap();
        index.add("close".into(), vec![0.9, 0.1, 0.0]).unwrap();
        index.add("far".into(), vec![0.0, 1.0, 0.0]).unwrap();

        let hits = index.search(&[1.0, 0.0, 0.0], 2, |_| true).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].0, "exact");
        assert!((hits[0].1 - 1.0).abs() < 1e-6);
        assert_eq!(hits[1].0, "close");
    }

    #[test]
    fn filter_excludes_ids() {
        let mut index = CosineIndex::new(2);
        index.add("a".into(), vec![1.0, 0.0]).unwrap();
        index.add("b".into(), vec![1.0, 0.0]).unwrap();

        let hits = index.search(&[1.0, 0.0], 10, |id| id == "b").unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, "b");
    }

    #[test]
    fn rejects_dimension_mismatch() {
        let mut index = CosineIndex::new(3);
        assert!(index.add("bad".into(), vec![1.0]).is_err());
        index.add("ok".into(), vec![1.0, 0.0, 0.0]).unwrap();
        assert!(index.search(&[1.0, 0.0], 1, |_| true).is_err());
    }

    #[test]
    fn remove_drops_vector() {
        let mut index = CosineIndex::new(2);
        index.add("gone".into(), vec![1.0, 0.0]).unwrap();
        assert!(index.remove("gone"));
        assert!(!index.remove("gone"));
        assert!(index.is_empty());
    }
}
