//! `ResultStore` — assembles per-frame outputs into per-node composite
//! arrays (spec.md §3, §4.3), grounded in `processing_results.py`.

use std::collections::HashMap;
use std::path::Path;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::dataset::{AxisRange, Dataset};
use crate::error::{ExecutionError, Result};
use crate::result_writer::ResultWriterRegistry;
use crate::scan::Scan;
use crate::tree::TreeDump;

/// Per-node bookkeeping recorded at `prepare_new_results`, independent of
/// the (not-yet-known) result shape.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeMetadataRecord {
    pub node_label: String,
    pub plugin_name: String,
    pub data_label: String,
    pub data_unit: String,
    pub result_title: String,
}

/// Plugin-side axis metadata for a node's trailing (non-scan) dimensions.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FrameMetadata {
    pub axis_labels: Vec<String>,
    pub axis_units: Vec<String>,
    pub axis_ranges: Vec<Option<AxisRange>>,
    pub data_label: String,
    pub data_unit: String,
}

/// One axis's selector for `ResultStore::get_subset` (spec.md §4.3).
/// `Index` collapses the axis like integer indexing; `List`/`Full` retain
/// it (a list of length 1 still keeps the axis, per SPEC_FULL.md C.3).
#[derive(Clone, Debug)]
pub enum AxisSelector {
    Index(usize),
    List(Vec<usize>),
    Full,
}

pub struct ResultStore {
    composites: HashMap<usize, Dataset>,
    node_meta: HashMap<usize, NodeMetadataRecord>,
    frame_meta: HashMap<usize, FrameMetadata>,
    trailing_shapes: HashMap<usize, Vec<usize>>,
    frozen_scan: Option<Scan>,
    frozen_tree: Option<TreeDump>,
    metadata_complete: bool,
    shapes_set: bool,
    writers: ResultWriterRegistry,
}

impl Default for ResultStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ResultStore {
    pub fn new() -> Self {
        ResultStore {
            composites: HashMap::new(),
            node_meta: HashMap::new(),
            frame_meta: HashMap::new(),
            trailing_shapes: HashMap::new(),
            frozen_scan: None,
            frozen_tree: None,
            metadata_complete: false,
            shapes_set: false,
            writers: ResultWriterRegistry::new(),
        }
    }

    pub fn writers_mut(&mut self) -> &mut ResultWriterRegistry {
        &mut self.writers
    }

    /// Clears state and freezes a scan/tree snapshot against concurrent
    /// edits. Does not allocate composites: shapes may depend on the first
    /// frame's actual output (spec.md §4.3).
    pub fn prepare_new_results(
        &mut self,
        scan: &Scan,
        tree_dump: &TreeDump,
        node_meta: HashMap<usize, NodeMetadataRecord>,
    ) {
        self.composites.clear();
        self.frame_meta.clear();
        self.trailing_shapes.clear();
        self.metadata_complete = false;
        self.shapes_set = false;
        self.frozen_scan = Some(scan.clone());
        self.frozen_tree = Some(tree_dump.clone());
        self.node_meta = node_meta;
        debug!(
            "result store prepared for {} tracked node(s)",
            self.node_meta.len()
        );
    }

    /// Records `composite_shape = scan.shape + trailing_shape` per node.
    /// Fails if the key set doesn't match the set prepared in
    /// `prepare_new_results`.
    pub fn store_frame_shapes(&mut self, shapes: HashMap<usize, Vec<usize>>) -> Result<()> {
        let expected: std::collections::HashSet<_> = self.node_meta.keys().copied().collect();
        let got: std::collections::HashSet<_> = shapes.keys().copied().collect();
        if expected != got {
            return Err(ExecutionError::user_config(format!(
                "store_frame_shapes key set {got:?} does not match prepared set {expected:?}"
            )));
        }
        self.trailing_shapes = shapes;
        self.shapes_set = true;
        Ok(())
    }

    /// Merges scan-axis metadata (leading dims) with plugin-axis metadata
    /// (trailing dims). Idempotent: the first call wins (spec.md §4.3,
    /// SPEC_FULL.md C.5).
    pub fn store_frame_metadata(&mut self, frame_meta: HashMap<usize, FrameMetadata>) {
        if self.metadata_complete {
            for (node_id, meta) in &frame_meta {
                if let Some(existing) = self.frame_meta.get(node_id) {
                    debug_assert_eq!(
                        existing.axis_labels, meta.axis_labels,
                        "store_frame_metadata called twice with differing axis_labels for node {node_id}"
                    );
                }
            }
            return;
        }
        self.frame_meta = frame_meta;
        self.metadata_complete = true;
        self.writers.push_metadata_to_active(&self.frame_meta);
    }

    fn create_composites(&mut self) -> Result<()> {
        let scan = self
            .frozen_scan
            .as_ref()
            .ok_or_else(|| ExecutionError::user_config("no frozen scan to build composites from"))?;
        if !self.shapes_set {
            return Err(ExecutionError::user_config(
                "cannot allocate composites before frame shapes are known",
            ));
        }
        for (&node_id, trailing) in self.trailing_shapes.clone().iter() {
            let mut shape = scan.shape().to_vec();
            shape.extend(trailing.iter().copied());
            let mut composite = Dataset::filled(&shape, f32::NAN);

            let scan_ndim = scan.ndim();
            for (i, axis) in scan.axes().iter().enumerate() {
                composite.axis_labels[i] = axis.label.clone();
                composite.axis_units[i] = axis.unit.clone();
                composite.axis_ranges[i] = axis.range.clone().map(AxisRange::Explicit);
            }
            if let Some(frame) = self.frame_meta.get(&node_id) {
                for j in 0..trailing.len() {
                    if scan_ndim + j < composite.axis_labels.len() {
                        if let Some(label) = frame.axis_labels.get(j) {
                            composite.axis_labels[scan_ndim + j] = label.clone();
                        }
                        if let Some(unit) = frame.axis_units.get(j) {
                            composite.axis_units[scan_ndim + j] = unit.clone();
                        }
                        if let Some(range) = frame.axis_ranges.get(j) {
                            composite.axis_ranges[scan_ndim + j] = range.clone();
                        }
                    }
                }
                composite.data_label = frame.data_label.clone();
                composite.data_unit = frame.data_unit.clone();
            }
            self.composites.insert(node_id, composite);
        }
        info!("allocated {} composite dataset(s)", self.composites.len());
        Ok(())
    }

    /// Writes one task's per-node results into the composites, allocating
    /// them on first call (spec.md §4.3).
    pub fn store_results(
        &mut self,
        scan_index: usize,
        results: HashMap<usize, Dataset>,
    ) -> Result<()> {
        if !self.metadata_complete && !results.is_empty() {
            warn!("store_results called before store_frame_metadata; results will be stored without axis metadata merge until metadata arrives");
        }
        if self.composites.is_empty() {
            self.create_composites()?;
        }
        let scan = self
            .frozen_scan
            .as_ref()
            .ok_or_else(|| ExecutionError::internal("store_results called with no frozen scan"))?;
        let scan_pos = scan.index_to_scan_position(scan_index);

        for (node_id, value) in results {
            let composite = self.composites.get_mut(&node_id).ok_or_else(|| {
                ExecutionError::internal(format!("store_results for untracked node {node_id}"))
            })?;
            write_slice(node_id, composite, &scan_pos, &value)?;
        }
        Ok(())
    }

    pub fn get_results(&self, node_id: usize) -> Option<&Dataset> {
        self.composites.get(&node_id)
    }

    /// Collapses the leading scan dims into one "Chronological scan points"
    /// dimension.
    pub fn get_results_flattened(&self, node_id: usize, squeeze: bool) -> Option<Dataset> {
        let composite = self.composites.get(&node_id)?;
        let scan_ndim = self.frozen_scan.as_ref().map(Scan::ndim).unwrap_or(0);
        let trailing = &composite.shape()[scan_ndim..];
        let n_points: usize = composite.shape()[..scan_ndim].iter().product();

        let mut new_shape = vec![n_points];
        new_shape.extend_from_slice(trailing);
        let mut flattened = Dataset::from_data(&new_shape, composite.data().to_vec())
            .expect("flattening preserves element count");

        flattened.axis_labels[0] = "Chronological scan points".to_string();
        flattened.axis_units[0] = String::new();
        flattened.axis_ranges[0] = None;
        for i in 0..trailing.len() {
            flattened.axis_labels[1 + i] = composite.axis_labels[scan_ndim + i].clone();
            flattened.axis_units[1 + i] = composite.axis_units[scan_ndim + i].clone();
            flattened.axis_ranges[1 + i] = composite.axis_ranges[scan_ndim + i].clone();
        }
        flattened.data_label = composite.data_label.clone();
        flattened.data_unit = composite.data_unit.clone();

        Some(if squeeze { flattened.squeeze() } else { flattened })
    }

    /// Slice a node's composite. `selectors` must have one entry per axis of
    /// the (optionally flattened) composite; `AxisSelector::Index` drops the
    /// axis, `List`/`Full` retain it (spec.md §4.3).
    pub fn get_subset(
        &self,
        node_id: usize,
        selectors: &[AxisSelector],
        flattened_scan_dim: bool,
        squeeze: bool,
    ) -> Result<Dataset> {
        let base = if flattened_scan_dim {
            self.get_results_flattened(node_id, false)
                .ok_or_else(|| ExecutionError::internal(format!("no composite for node {node_id}")))?
        } else {
            self.composites
                .get(&node_id)
                .cloned()
                .ok_or_else(|| ExecutionError::internal(format!("no composite for node {node_id}")))?
        };

        if selectors.len() != base.ndim() {
            return Err(ExecutionError::user_config(format!(
                "get_subset expected {} selectors for node {node_id}, got {}",
                base.ndim(),
                selectors.len()
            )));
        }

        let axis_indices: Vec<Vec<usize>> = selectors
            .iter()
            .enumerate()
            .map(|(dim, sel)| match sel {
                AxisSelector::Index(i) => vec![*i],
                AxisSelector::List(idxs) => idxs.clone(),
                AxisSelector::Full => (0..base.shape()[dim]).collect(),
            })
            .collect();
        let retained: Vec<bool> = selectors.iter().map(|s| !matches!(s, AxisSelector::Index(_))).collect();

        let mut out_shape = Vec::new();
        let mut out_labels = Vec::new();
        let mut out_units = Vec::new();
        let mut out_ranges = Vec::new();
        for dim in 0..base.ndim() {
            if retained[dim] {
                out_shape.push(axis_indices[dim].len());
                out_labels.push(base.axis_labels[dim].clone());
                out_units.push(base.axis_units[dim].clone());
                out_ranges.push(match &base.axis_ranges[dim] {
                    Some(AxisRange::Explicit(values)) => Some(AxisRange::Explicit(
                        axis_indices[dim].iter().map(|&i| values[i]).collect(),
                    )),
                    other => other.clone(),
                });
            }
        }
        if out_shape.is_empty() {
            out_shape.push(1);
            out_labels.push(String::new());
            out_units.push(String::new());
            out_ranges.push(None);
        }

        let total: usize = axis_indices.iter().map(Vec::len).product();
        let mut data = Vec::with_capacity(total);
        let mut counters = vec![0usize; axis_indices.len()];
        for _ in 0..total {
            let coord: Vec<usize> = counters.iter().zip(&axis_indices).map(|(&c, idxs)| idxs[c]).collect();
            let flat = base
                .flat_index(&coord)
                .ok_or_else(|| ExecutionError::internal("get_subset index out of range"))?;
            data.push(base.data()[flat]);
            for dim in (0..counters.len()).rev() {
                counters[dim] += 1;
                if counters[dim] < axis_indices[dim].len().max(1) {
                    break;
                }
                counters[dim] = 0;
            }
        }

        let mut out = Dataset::from_data(&out_shape, data).map_err(ExecutionError::internal)?;
        out.data_label = base.data_label.clone();
        out.data_unit = base.data_unit.clone();
        out.axis_labels = out_labels;
        out.axis_units = out_units;
        out.axis_ranges = out_ranges;

        Ok(if squeeze { out.squeeze() } else { out })
    }

    /// Reset state and repopulate composites/metadata from a directory
    /// previously written by `save_to_disk` (spec.md §4.3, P10). Only the
    /// primary hdf5 container format is understood for import.
    pub fn import_from_directory(&mut self, dir: &Path) -> Result<()> {
        self.composites.clear();
        self.node_meta.clear();
        self.frame_meta.clear();
        self.trailing_shapes.clear();
        self.metadata_complete = false;
        self.shapes_set = false;

        let writer = self
            .writers
            .get("hdf5")
            .ok_or_else(|| ExecutionError::internal("no hdf5 writer registered"))?;

        let mut entries: Vec<_> = std::fs::read_dir(dir)
            .map_err(|e| ExecutionError::storage(dir, e.to_string()))?
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".h5"))
            .collect();
        entries.sort_by_key(|e| e.file_name());

        for entry in entries {
            let imported = writer.import_from_file(&entry.path())?;
            self.node_meta.insert(
                imported.node_id,
                NodeMetadataRecord {
                    node_label: imported.node_label.clone(),
                    plugin_name: imported.plugin_name.clone(),
                    data_label: imported.data_label.clone(),
                    data_unit: imported.data_unit.clone(),
                    result_title: imported.result_title.clone(),
                },
            );
            self.composites.insert(imported.node_id, imported.data);
        }
        self.metadata_complete = true;
        self.shapes_set = true;
        info!("imported {} composite(s) from {:?}", self.composites.len(), dir);
        Ok(())
    }

    /// Save the composites for one (or all) nodes using one or more named
    /// writer formats (SPEC_FULL.md C.6).
    pub fn save_to_disk(
        &self,
        dir: &Path,
        formats: &[&str],
        overwrite: bool,
        node_id: Option<usize>,
    ) -> Result<()> {
        let scan = self
            .frozen_scan
            .as_ref()
            .ok_or_else(|| ExecutionError::user_config("no frozen scan to save results for"))?;
        let targets: Vec<usize> = match node_id {
            Some(id) => vec![id],
            None => {
                let mut ids: Vec<_> = self.composites.keys().copied().collect();
                ids.sort_unstable();
                ids
            }
        };
        for format in formats {
            let writer = self.writers.get(format).ok_or_else(|| {
                ExecutionError::user_config(format!("unknown result writer format '{format}'"))
            })?;
            for &id in &targets {
                let composite = self.composites.get(&id).ok_or_else(|| {
                    ExecutionError::internal(format!("no composite stored for node {id}"))
                })?;
                let meta = self.node_meta.get(&id).ok_or_else(|| {
                    ExecutionError::internal(format!("no metadata recorded for node {id}"))
                })?;
                writer.export_full(dir, id, meta, composite, scan, overwrite)?;
            }
        }
        Ok(())
    }

    pub fn metadata_complete(&self) -> bool {
        self.metadata_complete
    }

    pub fn is_empty(&self) -> bool {
        self.composites.is_empty()
    }
}

/// Writes `value` into `composite[scan_pos]`, validating that `value`'s
/// shape matches the composite's trailing dims.
fn write_slice(node_id: usize, composite: &mut Dataset, scan_pos: &[usize], value: &Dataset) -> Result<()> {
    let scan_ndim = scan_pos.len();
    let trailing = &composite.shape()[scan_ndim..];
    if trailing != value.shape() {
        return Err(ExecutionError::ShapeInconsistency {
            node_id,
            message: format!(
                "frame shape {:?} does not match composite trailing shape {:?}",
                value.shape(),
                trailing
            ),
        });
    }
    let full_shape = composite.shape().to_vec();
    let trailing_len: usize = trailing.iter().product();
    let mut base = 0usize;
    for (dim, &pos) in scan_pos.iter().enumerate() {
        base = base * full_shape[dim] + pos;
    }
    base *= trailing_len;
    composite.data_mut()[base..base + trailing_len].copy_from_slice(value.data());
    Ok(())
}
