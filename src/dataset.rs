//! N-dimensional float array with axis metadata (spec.md §3, "Dataset").

use serde::{Deserialize, Serialize};

/// An axis's coordinate range: an explicit array of length `shape[i]`.
/// The "no range" case (integer index `0..n-1`) is the `None` of the
/// enclosing `Option<AxisRange>`, not a variant here (spec.md §3,
/// §9 "Datasets with optional axis ranges").
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum AxisRange {
    Explicit(Vec<f64>),
}

impl AxisRange {
    pub fn len(&self) -> usize {
        match self {
            AxisRange::Explicit(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// An N-dimensional array of `f32` plus axis/data metadata.
///
/// Invariants (spec.md §3): every metadata vector is indexed `0..ndim`;
/// `axis_ranges[i]`'s length matches `shape[i]` when explicit.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Dataset {
    shape: Vec<usize>,
    data: Vec<f32>,
    pub data_label: String,
    pub data_unit: String,
    pub axis_labels: Vec<String>,
    pub axis_units: Vec<String>,
    pub axis_ranges: Vec<Option<AxisRange>>,
}

impl Dataset {
    /// Build a new dataset, filling with `fill`. Axis metadata defaults to
    /// empty labels/units and `None` (index) ranges.
    pub fn filled(shape: &[usize], fill: f32) -> Self {
        let len: usize = shape.iter().product();
        let ndim = shape.len();
        Dataset {
            shape: shape.to_vec(),
            data: vec![fill; len],
            data_label: String::new(),
            data_unit: String::new(),
            axis_labels: vec![String::new(); ndim],
            axis_units: vec![String::new(); ndim],
            axis_ranges: vec![None; ndim],
        }
    }

    /// Build from raw data, checking that `data.len() == product(shape)`.
    pub fn from_data(shape: &[usize], data: Vec<f32>) -> Result<Self, String> {
        let expected: usize = shape.iter().product();
        if data.len() != expected {
            return Err(format!(
                "data length {} does not match shape {:?} (expected {})",
                data.len(),
                shape,
                expected
            ));
        }
        let ndim = shape.len();
        Ok(Dataset {
            shape: shape.to_vec(),
            data,
            data_label: String::new(),
            data_unit: String::new(),
            axis_labels: vec![String::new(); ndim],
            axis_units: vec![String::new(); ndim],
            axis_ranges: vec![None; ndim],
        })
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    pub fn sum(&self) -> f64 {
        self.data.iter().map(|&v| v as f64).sum()
    }

    /// Checks metadata invariants: vectors indexed `0..ndim`, explicit ranges
    /// sized to match `shape[i]`.
    pub fn validate(&self) -> Result<(), String> {
        let ndim = self.ndim();
        if self.axis_labels.len() != ndim
            || self.axis_units.len() != ndim
            || self.axis_ranges.len() != ndim
        {
            return Err(format!(
                "axis metadata length mismatch: ndim={ndim}, labels={}, units={}, ranges={}",
                self.axis_labels.len(),
                self.axis_units.len(),
                self.axis_ranges.len()
            ));
        }
        for (i, range) in self.axis_ranges.iter().enumerate() {
            if let Some(AxisRange::Explicit(values)) = range {
                if values.len() != self.shape[i] {
                    return Err(format!(
                        "axis_ranges[{i}] has length {} but shape[{i}] is {}",
                        values.len(),
                        self.shape[i]
                    ));
                }
            }
        }
        Ok(())
    }

    /// Remove dimensions of length 1 and their metadata entries, in order.
    pub fn squeeze(&self) -> Dataset {
        let mut new_shape = Vec::new();
        let mut new_labels = Vec::new();
        let mut new_units = Vec::new();
        let mut new_ranges = Vec::new();
        for i in 0..self.ndim() {
            if self.shape[i] != 1 {
                new_shape.push(self.shape[i]);
                new_labels.push(self.axis_labels[i].clone());
                new_units.push(self.axis_units[i].clone());
                new_ranges.push(self.axis_ranges[i].clone());
            }
        }
        if new_shape.is_empty() {
            new_shape.push(1);
            new_labels.push(String::new());
            new_units.push(String::new());
            new_ranges.push(None);
        }
        Dataset {
            shape: new_shape,
            data: self.data.clone(),
            data_label: self.data_label.clone(),
            data_unit: self.data_unit.clone(),
            axis_labels: new_labels,
            axis_units: new_units,
            axis_ranges: new_ranges,
        }
    }

    /// Flat index (row-major) into `data` for a multi-index.
    pub fn flat_index(&self, idx: &[usize]) -> Option<usize> {
        if idx.len() != self.ndim() {
            return None;
        }
        let mut flat = 0usize;
        for (dim, &i) in idx.iter().enumerate() {
            if i >= self.shape[dim] {
                return None;
            }
            flat = flat * self.shape[dim] + i;
        }
        Some(flat)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filled_has_correct_length_and_metadata_width() {
        let ds = Dataset::filled(&[2, 3], f32::NAN);
        assert_eq!(ds.len(), 6);
        assert_eq!(ds.axis_labels.len(), 2);
        assert!(ds.data().iter().all(|v| v.is_nan()));
    }

    #[test]
    fn from_data_rejects_mismatched_length() {
        assert!(Dataset::from_data(&[2, 2], vec![1.0, 2.0]).is_err());
    }

    #[test]
    fn squeeze_removes_unit_dims_and_metadata() {
        let mut ds = Dataset::from_data(&[1, 3, 1], vec![1.0, 2.0, 3.0]).unwrap();
        ds.axis_labels = vec!["a".into(), "b".into(), "c".into()];
        let squeezed = ds.squeeze();
        assert_eq!(squeezed.shape(), &[3]);
        assert_eq!(squeezed.axis_labels, vec!["b".to_string()]);
    }

    #[test]
    fn validate_catches_range_length_mismatch() {
        let mut ds = Dataset::filled(&[3], 0.0);
        ds.axis_ranges[0] = Some(AxisRange::Explicit(vec![0.0, 1.0]));
        assert!(ds.validate().is_err());
    }

    #[test]
    fn flat_index_is_row_major() {
        let ds = Dataset::from_data(&[2, 3], (0..6).map(|v| v as f32).collect()).unwrap();
        assert_eq!(ds.flat_index(&[1, 2]), Some(5));
        assert_eq!(ds.flat_index(&[2, 0]), None);
    }
}
