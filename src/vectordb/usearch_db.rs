
use crate::{Error, Result};
use std::path::Path;
use usearch::Index;
use usearch::MetricKind;
use usearch::ScalarKind;

/// HNSW graph over document vectors; keys are corpus positions
pub struct HnswGraph {
    index: Index,
    dimension: usize,
}

impl HnswGraph {
    fn create(dimension: usize) -> Result<Index> {
        Index::new(&usearch::IndexOptions {
            dimensions: dimension,
            metric: MetricKind::Cos,
            quantization: ScalarKind::F32,
            connectivity: 16,
            expansion_add: 128,
            expansion_search: 64,
            multi: false,
        }).map_err(|e| Error::VectorDb(format!("Failed to create index: {e:?}")))
    }

    pub fn from_vectors(dimension: usize, vectors: &[Vec<f32>]) -> Result<Self> {
        let index = Self::create(dimension)?;
        index
            .reserve(vectors.len())
            .map_err(|e| Error::VectorDb(format!("Failed to reserve capacity: {e:?}")))?;

        for (position, vector) in vectors.iter().enumerate() {
            if vector.len() != dimension {
                return Err(Error::VectorDb(format!(
                    "Vector dimension mismatch at {position}: expected {dimension}, got {}",
                    vector.len()
                )));
            }
            index
                .add(position as u64, vector.as_slice())
                .map_err(|e| Error::VectorDb(format!("Failed to add vector: {e:?}")))?;
        }

        Ok(Self { index, dimension })
    }

    pub fn load(path: &Path, dimension: usize) -> Result<Self> {
        let index = Self::create(dimension)?;
        index
            .load(&path.to_string_lossy())
            .map_err(|e| Error::VectorDb(format!("Failed to load index: {e:?}")))?;

        if index.dimensions() != dimension {
            return Err(Error::VectorDb(format!(
                "Graph dimension {} does not match stored vectors ({dimension})",
                index.dimensions()
            )));
        }

        Ok(Self { index, dimension })
    }

    /// Save next to `path` and rename into place
    pub fn save(&self, path: &Path) -> Result<()> {
        let tmp = path.with_extension("usearch.tmp");
        self.index
            .save(&tmp.to_string_lossy())
            .map_err(|e| Error::VectorDb(format!("Failed to save index: {e:?}")))?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// `(position, cosine similarity)` pairs, best first
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<(u64, f32)>> {
        if query.len() != self.dimension {
            return Err(Error::VectorDb(format!(
                "Query vector dimension mismatch: expected {}, got {}",
                self.dimension,
                query.len()
            )));
        }
        if k == 0 || self.index.size() == 0 {
            return Ok(Vec::new());
        }

        let matches = self.index
            .search(query, k)
            .map_err(|e| Error::VectorDb(format!("Search failed: {e:?}")))?;

        Ok(matches
            .keys
            .iter()
            .zip(matches.distances.iter())
            .map(|(&key, &distance)| (key, 1.0 - distance))
            .filter(|(_, score)| score.is_finite())
            .collect())
    }

    pub fn size(&self) -> usize {
        self.index.size()
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn vectors() -> Vec<Vec<f32>> {
        let mut axis = vec![0.0; 8];
        axis[0] = 1.0;
        vec![vec![1.0; 8], axis]
    }

    #[test]
    fn test_insert_and_search() {
        let graph = HnswGraph::from_vectors(8, &vectors()).unwrap();

        let results = graph.search(&[1.0; 8], 2).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0, 0);
        assert!(results[0].1 > results[1].1);
        assert!((results[0].1 - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_dimension_checks() {
        assert!(HnswGraph::from_vectors(4, &vectors()).is_err());
        let graph = HnswGraph::from_vectors(8, &vectors()).unwrap();
        assert!(graph.search(&[1.0; 3], 1).is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("index.usearch");

        HnswGraph::from_vectors(8, &vectors()).unwrap().save(&path).unwrap();
        let graph = HnswGraph::load(&path, 8).unwrap();

        assert_eq!(graph.size(), 2);
        assert_eq!(graph.search(&[1.0; 8], 1).unwrap()[0].0, 0);
    }
}
