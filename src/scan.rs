//! `Scan` — the consumed enumeration of input positions (spec.md §3, §4.2).

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScanAxis {
    pub label: String,
    pub unit: String,
    /// `None` means integer index `0..n-1`, matching `Dataset`'s `AxisRange`.
    pub range: Option<Vec<f64>>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Scan {
    shape: Vec<usize>,
    axes: Vec<ScanAxis>,
}

impl Scan {
    pub fn new(shape: Vec<usize>, axes: Vec<ScanAxis>) -> Self {
        assert_eq!(shape.len(), axes.len(), "one axis per scan dimension");
        Scan { shape, axes }
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn n_points(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn axes(&self) -> &[ScanAxis] {
        &self.axes
    }

    /// Map a flat task index to a multi-dimensional scan position, row-major
    /// over `shape` (spec.md GLOSSARY, "Scan position").
    pub fn index_to_scan_position(&self, linear_index: usize) -> Vec<usize> {
        let mut remainder = linear_index;
        let mut pos = vec![0usize; self.shape.len()];
        for dim in (0..self.shape.len()).rev() {
            let extent = self.shape[dim].max(1);
            pos[dim] = remainder % extent;
            remainder /= extent;
        }
        pos
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn axis(label: &str) -> ScanAxis {
        ScanAxis {
            label: label.to_string(),
            unit: String::new(),
            range: None,
        }
    }

    #[test]
    fn n_points_is_shape_product() {
        let scan = Scan::new(vec![5, 7, 3], vec![axis("x"), axis("y"), axis("z")]);
        assert_eq!(scan.n_points(), 105);
    }

    #[test]
    fn index_to_scan_position_is_row_major() {
        let scan = Scan::new(vec![2, 3], vec![axis("x"), axis("y")]);
        assert_eq!(scan.index_to_scan_position(0), vec![0, 0]);
        assert_eq!(scan.index_to_scan_position(1), vec![0, 1]);
        assert_eq!(scan.index_to_scan_position(3), vec![1, 0]);
        assert_eq!(scan.index_to_scan_position(5), vec![1, 2]);
    }
}
