//! Validated inputs: point clouds and labeled sample sets.
//!
//! A `PointCloud` is a uniform-weight empirical measure on `R^d`, stored as an `n×d` matrix.
//! It has no identity beyond its position in a `SampleSet`.

use crate::{Error, Result};
use ndarray::{Array2, ArrayView2};

/// An immutable `n×d` point cloud (`n ≥ 1`, `d ≥ 1`, finite coordinates).
#[derive(Debug, Clone, PartialEq)]
pub struct PointCloud {
    points: Array2<f32>,
}

impl PointCloud {
    pub fn new(points: Array2<f32>) -> Result<Self> {
        if points.nrows() == 0 {
            return Err(Error::InvalidInput("point cloud must be non-empty".into()));
        }
        if points.ncols() == 0 {
            return Err(Error::InvalidInput(
                "point cloud must have at least one dimension".into(),
            ));
        }
        if points.iter().any(|x| !x.is_finite()) {
            return Err(Error::InvalidInput(
                "point cloud coordinates must be finite".into(),
            ));
        }
        Ok(Self { points })
    }

    /// Build from row vectors; every row must have the same length.
    pub fn from_rows(rows: &[Vec<f32>]) -> Result<Self> {
        let n = rows.len();
        let d = rows.first().map_or(0, Vec::len);
        if rows.iter().any(|r| r.len() != d) {
            return Err(Error::InvalidInput("rows must have equal length".into()));
        }
        let flat: Vec<f32> = rows.iter().flatten().copied().collect();
        let points = Array2::from_shape_vec((n, d), flat)
            .map_err(|e| Error::InvalidInput(format!("bad row layout: {e}")))?;
        Self::new(points)
    }

    /// Number of points.
    pub fn len(&self) -> usize {
        self.points.nrows()
    }

    /// Always `false`: empty clouds are rejected at construction.
    pub fn is_empty(&self) -> bool {
        self.points.nrows() == 0
    }

    /// Coordinate dimension `d`.
    pub fn dim(&self) -> usize {
        self.points.ncols()
    }

    pub fn view(&self) -> ArrayView2<'_, f32> {
        self.points.view()
    }

    pub fn points(&self) -> &Array2<f32> {
        &self.points
    }

    /// Content fingerprint (shape + coordinate bits). Used for memoization keys.
    pub fn fingerprint(&self) -> u64 {
        use std::hash::{Hash, Hasher};
        let mut h = std::collections::hash_map::DefaultHasher::new();
        self.points.dim().hash(&mut h);
        for x in self.points.iter() {
            x.to_bits().hash(&mut h);
        }
        h.finish()
    }
}

/// An ordered list of clouds with one label per cloud.
#[derive(Debug, Clone)]
pub struct SampleSet {
    clouds: Vec<PointCloud>,
    labels: Vec<String>,
}

impl SampleSet {
    /// Labels default to `sample_{i}` in list order.
    pub fn new(clouds: Vec<PointCloud>) -> Result<Self> {
        let labels = (0..clouds.len()).map(|i| format!("sample_{i}")).collect();
        Self::with_labels(clouds, labels)
    }

    /// An empty set is allowed; it contributes a zero-length axis to the matrix.
    pub fn with_labels(clouds: Vec<PointCloud>, labels: Vec<String>) -> Result<Self> {
        if labels.len() != clouds.len() {
            return Err(Error::InvalidInput(format!(
                "label count ({}) must equal cloud count ({})",
                labels.len(),
                clouds.len()
            )));
        }
        Ok(Self { clouds, labels })
    }

    /// Convenience: validate raw matrices and wrap them.
    pub fn from_arrays(arrays: Vec<Array2<f32>>) -> Result<Self> {
        let clouds = arrays
            .into_iter()
            .map(PointCloud::new)
            .collect::<Result<Vec<_>>>()?;
        Self::new(clouds)
    }

    pub fn len(&self) -> usize {
        self.clouds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clouds.is_empty()
    }

    pub fn get(&self, i: usize) -> Option<&PointCloud> {
        self.clouds.get(i)
    }

    pub fn clouds(&self) -> &[PointCloud] {
        &self.clouds
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn rejects_empty_and_non_finite() {
        assert!(PointCloud::new(Array2::zeros((0, 2))).is_err());
        assert!(PointCloud::new(Array2::zeros((3, 0))).is_err());
        assert!(PointCloud::new(array![[0.0, f32::NAN]]).is_err());
        assert!(PointCloud::from_rows(&[vec![0.0, 1.0], vec![2.0]]).is_err());
    }

    #[test]
    fn default_labels_are_positional() -> Result<()> {
        let set = SampleSet::from_arrays(vec![array![[0.0f32]], array![[1.0f32]]])?;
        assert_eq!(set.labels(), &["sample_0".to_string(), "sample_1".to_string()]);
        Ok(())
    }

    #[test]
    fn label_count_must_match() {
        let c = PointCloud::new(array![[0.0f32, 1.0]]).unwrap();
        let err = SampleSet::with_labels(vec![c], vec!["a".into(), "b".into()]).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn empty_set_is_allowed() -> Result<()> {
        let set = SampleSet::new(Vec::new())?;
        assert!(set.is_empty());
        assert!(set.labels().is_empty());
        Ok(())
    }

    #[test]
    fn fingerprint_tracks_content() -> Result<()> {
        let a = PointCloud::new(array![[0.0f32, 1.0], [2.0, 3.0]])?;
        let b = PointCloud::new(array![[0.0f32, 1.0], [2.0, 3.0]])?;
        let c = PointCloud::new(array![[0.0f32, 1.0, 2.0, 3.0]])?;
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
        Ok(())
    }
}
