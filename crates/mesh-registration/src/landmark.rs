//! Landmark pairs: fixed source/target vertex correspondences.

use nalgebra::Point3;

use crate::error::{MeshError, MeshResult};
use crate::types::Mesh;

/// Two equal-length lists of vertex indices; `source[i]` must land on
/// `target[i]`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "registration-config", derive(serde::Serialize, serde::Deserialize))]
pub struct Landmarks {
    pub source: Vec<usize>,
    pub target: Vec<usize>,
}

impl Landmarks {
    /// Pair up two index lists. Fails when their lengths differ.
    pub fn new(source: Vec<usize>, target: Vec<usize>) -> MeshResult<Self> {
        if source.len() != target.len() {
            return Err(MeshError::landmark_mismatch(source.len(), target.len()));
        }
        Ok(Self { source, target })
    }

    /// Number of pairs.
    pub fn len(&self) -> usize {
        self.source.len().min(self.target.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterate over `(source, target)` index pairs.
    pub fn pairs(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.source.iter().copied().zip(self.target.iter().copied())
    }

    /// Check list lengths and that every index exists in its mesh.
    pub fn validate(&self, source_vertices: usize, target_vertices: usize) -> MeshResult<()> {
        if self.source.len() != self.target.len() {
            return Err(MeshError::landmark_mismatch(
                self.source.len(),
                self.target.len(),
            ));
        }
        for (pair, (s, t)) in self.pairs().enumerate() {
            if s >= source_vertices {
                return Err(MeshError::LandmarkOutOfBounds {
                    pair,
                    mesh: "source",
                    index: s,
                    vertex_count: source_vertices,
                });
            }
            if t >= target_vertices {
                return Err(MeshError::LandmarkOutOfBounds {
                    pair,
                    mesh: "target",
                    index: t,
                    vertex_count: target_vertices,
                });
            }
        }
        Ok(())
    }

    /// Target landmark positions, in pair order.
    ///
    /// Indices must already be validated against `target`.
    pub fn target_points(&self, target: &Mesh) -> Vec<Point3<f64>> {
        self.target
            .iter()
            .map(|&t| target.vertices[t].position)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[test]
    fn test_new_rejects_unequal_lengths() {
        let err = Landmarks::new(vec![0, 1, 2], vec![4, 5]).unwrap_err();
        assert_eq!(err.code(), ErrorCode::LandmarkMismatch);
        assert!(Landmarks::new(vec![0], vec![9]).is_ok());
    }

    #[test]
    fn test_validate_reports_first_bad_pair() {
        let marks = Landmarks::new(vec![0, 1, 2], vec![3, 40, 5]).unwrap();
        match marks.validate(10, 10).unwrap_err() {
            MeshError::LandmarkOutOfBounds {
                pair, mesh, index, ..
            } => {
                assert_eq!(pair, 1);
                assert_eq!(mesh, "target");
                assert_eq!(index, 40);
            }
            other => panic!("Expected out of bounds, got {:?}", other),
        }
        assert!(marks.validate(3, 41).is_ok());
        assert!(marks.validate(2, 41).is_err());
    }

    #[test]
    fn test_validate_catches_hand_built_mismatch() {
        let marks = Landmarks {
            source: vec![0, 1],
            target: vec![0],
        };
        assert_eq!(
            marks.validate(5, 5).unwrap_err().code(),
            ErrorCode::LandmarkMismatch
        );
    }

    #[test]
    fn test_pairs_in_order() {
        let marks = Landmarks::new(vec![4, 2], vec![7, 1]).unwrap();
        assert_eq!(marks.pairs().collect::<Vec<_>>(), vec![(4, 7), (2, 1)]);
        assert_eq!(marks.len(), 2);
        assert!(Landmarks::default().is_empty());
    }
}
