//! `ResultWriter` — persists composites to a hierarchical container file
//! (spec.md §4.5, §6). The primary implementation is HDF5-backed
//! (`Hdf5ResultWriter`); `CsvResultWriter`/`BinaryResultWriter` are optional
//! secondary formats behind the same trait (SPEC_FULL.md C.7).

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use log::{info, warn};

use crate::dataset::{AxisRange, Dataset};
use crate::error::{ExecutionError, Result};
use crate::result_store::{FrameMetadata, NodeMetadataRecord};
use crate::scan::Scan;
use crate::tree::TreeDump;

/// Shape/label info known at `prepare` time, before any frame has arrived.
#[derive(Clone, Debug)]
pub struct PrepInfo {
    pub shape: Vec<usize>,
    pub node_label: String,
    pub plugin_name: String,
}

/// What `import_from_file` hands back (spec.md §4.5).
pub struct ImportedResult {
    pub data: Dataset,
    pub node_label: String,
    pub data_label: String,
    pub data_unit: String,
    pub plugin_name: String,
    pub node_id: usize,
    pub result_title: String,
}

/// Collapse whitespace to `_`, strip anything outside `[A-Za-z0-9._-]`, fall
/// back to `node_<id>` if the result is empty (spec.md §4.5).
pub fn sanitized_filename(node_id: usize, label: &str, ext: &str) -> String {
    let mut out = String::new();
    let mut last_was_space = false;
    for c in label.chars() {
        if c.is_whitespace() {
            if !last_was_space {
                out.push('_');
            }
            last_was_space = true;
            continue;
        }
        last_was_space = false;
        if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' {
            out.push(c);
        }
    }
    let sanitized = if out.is_empty() {
        format!("node_{node_id}")
    } else {
        out
    };
    format!("node_{node_id:02}_{sanitized}.{ext}")
}

/// A persistence backend for `ResultStore` composites.
pub trait ResultWriter: Send + Sync {
    fn format_name(&self) -> &'static str;
    fn file_extension(&self) -> &'static str;

    /// Creates `dir` if missing, pre-allocates files/datasets for every
    /// tracked node.
    fn prepare(
        &self,
        dir: &Path,
        nodes: &HashMap<usize, PrepInfo>,
        scan: &Scan,
        tree: &TreeDump,
        overwrite: bool,
    ) -> Result<()>;

    /// Writes one frame's slice into the node's pre-allocated file.
    fn export_frame(&self, dir: &Path, node_id: usize, scan_pos: &[usize], value: &Dataset) -> Result<()>;

    /// Writes plugin-side axis metadata for the trailing dims, once, after
    /// the first frame.
    fn push_metadata(
        &self,
        dir: &Path,
        frame_meta: &HashMap<usize, FrameMetadata>,
        scan: &Scan,
    ) -> Result<()>;

    /// Writes an entire composite in one step (used by `save_to_disk` after
    /// a run, rather than frame-by-frame during it).
    fn export_full(
        &self,
        dir: &Path,
        node_id: usize,
        meta: &NodeMetadataRecord,
        composite: &Dataset,
        scan: &Scan,
        overwrite: bool,
    ) -> Result<()>;

    fn import_from_file(&self, path: &Path) -> Result<ImportedResult>;
}

fn node_file_path(dir: &Path, node_id: usize, label: &str, ext: &str) -> PathBuf {
    dir.join(sanitized_filename(node_id, label, ext))
}

fn ensure_writable_dir(dir: &Path, path: &Path, overwrite: bool) -> Result<()> {
    fs::create_dir_all(dir).map_err(|e| ExecutionError::storage(dir, e.to_string()))?;
    if path.exists() && !overwrite {
        return Err(ExecutionError::storage(
            path,
            "file already exists and overwrite is not enabled",
        ));
    }
    Ok(())
}

/// The primary hierarchical-container writer (spec.md §6, NeXus-like layout).
pub struct Hdf5ResultWriter;

impl Hdf5ResultWriter {
    pub fn new() -> Self {
        Hdf5ResultWriter
    }

    fn write_scan_group(entry: &hdf5::Group, scan: &Scan) -> Result<()> {
        let scan_group = entry
            .create_group("scan")
            .map_err(|e| ExecutionError::storage("entry/scan", e.to_string()))?;
        for (k, axis) in scan.axes().iter().enumerate() {
            let dim_group = scan_group
                .create_group(&format!("dim_{k}"))
                .map_err(|e| ExecutionError::storage(format!("entry/scan/dim_{k}"), e.to_string()))?;
            write_string_dataset(&dim_group, "label", &axis.label)?;
            write_string_dataset(&dim_group, "unit", &axis.unit)?;
            if let Some(range) = &axis.range {
                dim_group
                    .new_dataset::<f64>()
                    .shape(range.len())
                    .create("range")
                    .and_then(|ds| ds.write(range))
                    .map_err(|e| ExecutionError::storage(format!("entry/scan/dim_{k}/range"), e.to_string()))?;
            }
        }
        Ok(())
    }

    fn write_axis_groups(
        data_group: &hdf5::Group,
        scan: &Scan,
        node_id: usize,
        trailing_meta: Option<&FrameMetadata>,
        composite_shape: &[usize],
    ) -> Result<()> {
        for k in 0..scan.ndim() {
            let link_target = format!("/entry/scan/dim_{k}");
            data_group
                .link_soft(&link_target, &format!("axis_{k}"))
                .map_err(|e| ExecutionError::storage(format!("axis_{k}"), e.to_string()))?;
        }
        if let Some(meta) = trailing_meta {
            for j in 0..meta.axis_labels.len() {
                let axis_idx = scan.ndim() + j;
                if axis_idx >= composite_shape.len() {
                    break;
                }
                let axis_group = data_group
                    .create_group(&format!("axis_{axis_idx}"))
                    .map_err(|e| {
                        ExecutionError::storage(format!("node {node_id} axis_{axis_idx}"), e.to_string())
                    })?;
                write_string_dataset(&axis_group, "label", &meta.axis_labels[j])?;
                write_string_dataset(&axis_group, "unit", &meta.axis_units[j])?;
                if let Some(Some(AxisRange::Explicit(values))) = meta.axis_ranges.get(j) {
                    axis_group
                        .new_dataset::<f64>()
                        .shape(values.len())
                        .create("range")
                        .and_then(|ds| ds.write(values))
                        .map_err(|e| ExecutionError::storage(format!("axis_{axis_idx}/range"), e.to_string()))?;
                }
            }
        }
        Ok(())
    }
}

impl Default for Hdf5ResultWriter {
    fn default() -> Self {
        Self::new()
    }
}

fn write_string_dataset(group: &hdf5::Group, name: &str, value: &str) -> Result<()> {
    group
        .new_dataset::<hdf5::types::VarLenUnicode>()
        .create(name)
        .and_then(|ds| {
            let v: hdf5::types::VarLenUnicode = value.parse().unwrap_or_default();
            ds.write_scalar(&v)
        })
        .map_err(|e| ExecutionError::storage(name, e.to_string()))
}

impl ResultWriter for Hdf5ResultWriter {
    fn format_name(&self) -> &'static str {
        "hdf5"
    }

    fn file_extension(&self) -> &'static str {
        "h5"
    }

    fn prepare(
        &self,
        dir: &Path,
        nodes: &HashMap<usize, PrepInfo>,
        scan: &Scan,
        tree: &TreeDump,
        overwrite: bool,
    ) -> Result<()> {
        fs::create_dir_all(dir).map_err(|e| ExecutionError::storage(dir, e.to_string()))?;
        for (&node_id, info) in nodes {
            let path = node_file_path(dir, node_id, &info.node_label, self.file_extension());
            if path.exists() && !overwrite {
                return Err(ExecutionError::storage(
                    &path,
                    "result file already exists and overwrite is not enabled",
                ));
            }
            let file = hdf5::File::create(&path).map_err(|e| ExecutionError::storage(&path, e.to_string()))?;
            let entry = file
                .create_group("entry")
                .map_err(|e| ExecutionError::storage("entry", e.to_string()))?;

            write_string_dataset(&entry, "node_id", &node_id.to_string())?;
            write_string_dataset(&entry, "label", &info.node_label)?;
            write_string_dataset(&entry, "plugin_name", &info.plugin_name)?;
            write_string_dataset(&entry, "definition", "custom (NXxbase-aligned)")?;
            write_string_dataset(&entry, "scanflow_version", env!("CARGO_PKG_VERSION"))?;
            write_string_dataset(&entry, "scan_title", &format!("scan over {} dimension(s)", scan.ndim()))?;

            // Experiment-parameter content (beamline/sample setup) is out of
            // this core's scope; the group is present so the container layout
            // matches, left otherwise empty.
            entry
                .create_group("experiment")
                .map_err(|e| ExecutionError::storage("entry/experiment", e.to_string()))?;

            let instrument = entry
                .create_group("instrument")
                .map_err(|e| ExecutionError::storage("entry/instrument", e.to_string()))?;
            let source = instrument
                .create_group("source")
                .map_err(|e| ExecutionError::storage("entry/instrument/source", e.to_string()))?;
            write_string_dataset(&source, "probe", "x-ray")?;
            write_string_dataset(&source, "type", "synchrotron")?;
            instrument
                .create_group("detector")
                .map_err(|e| ExecutionError::storage("entry/instrument/detector", e.to_string()))?;

            Self::write_scan_group(&entry, scan)?;

            let workflow_group = entry
                .create_group("workflow")
                .map_err(|e| ExecutionError::storage("entry/workflow", e.to_string()))?;
            let tree_yaml = serde_yaml::to_string(tree)?;
            write_string_dataset(&workflow_group, "tree", &tree_yaml)?;
            write_string_dataset(&workflow_group, "version", env!("CARGO_PKG_VERSION"))?;

            let data_group = entry
                .create_group("data")
                .map_err(|e| ExecutionError::storage("entry/data", e.to_string()))?;
            let mut shape = scan.shape().to_vec();
            shape.extend(info.shape.iter().copied());
            data_group
                .new_dataset::<f32>()
                .shape(shape.clone())
                .create("data")
                .map_err(|e| ExecutionError::storage("entry/data/data", e.to_string()))?;

            Self::write_axis_groups(&data_group, scan, node_id, None, &shape)?;
        }
        info!("prepared hdf5 container(s) for {} node(s) in {:?}", nodes.len(), dir);
        Ok(())
    }

    fn export_frame(&self, dir: &Path, node_id: usize, scan_pos: &[usize], value: &Dataset) -> Result<()> {
        let path = existing_node_file(dir, node_id, self.file_extension())?;
        let file = hdf5::File::append(&path).map_err(|e| ExecutionError::storage(&path, e.to_string()))?;
        let dataset = file
            .dataset("entry/data/data")
            .map_err(|e| ExecutionError::storage(&path, e.to_string()))?;

        // No partial-write API is exercised here: read the whole composite,
        // overwrite this frame's slice in memory, write the whole thing back.
        // Simple and correct; per-frame HDF5 I/O cost is not a concern this
        // core optimizes for (spec.md §1 Non-goals).
        let mut array: ndarray::ArrayD<f32> = dataset
            .read()
            .map_err(|e| ExecutionError::storage(&path, e.to_string()))?;
        {
            let mut view = array.view_mut();
            for &pos in scan_pos {
                view.index_axis_inplace(ndarray::Axis(0), pos);
            }
            let frame = ndarray::ArrayD::from_shape_vec(value.shape().to_vec(), value.data().to_vec())
                .map_err(|e| ExecutionError::internal(e.to_string()))?;
            view.assign(&frame);
        }
        dataset
            .write(&array)
            .map_err(|e| ExecutionError::storage(&path, e.to_string()))?;
        Ok(())
    }

    fn push_metadata(&self, dir: &Path, frame_meta: &HashMap<usize, FrameMetadata>, scan: &Scan) -> Result<()> {
        for (&node_id, meta) in frame_meta {
            let path = existing_node_file(dir, node_id, self.file_extension())?;
            let file = hdf5::File::append(&path).map_err(|e| ExecutionError::storage(&path, e.to_string()))?;
            let data_group = file
                .group("entry/data")
                .map_err(|e| ExecutionError::storage(&path, e.to_string()))?;
            let shape = data_group
                .dataset("data")
                .map_err(|e| ExecutionError::storage(&path, e.to_string()))?
                .shape();
            Self::write_axis_groups(&data_group, scan, node_id, Some(meta), &shape)?;
        }
        Ok(())
    }

    fn export_full(
        &self,
        dir: &Path,
        node_id: usize,
        meta: &NodeMetadataRecord,
        composite: &Dataset,
        scan: &Scan,
        overwrite: bool,
    ) -> Result<()> {
        let mut nodes = HashMap::new();
        nodes.insert(
            node_id,
            PrepInfo {
                shape: composite.shape()[scan.ndim()..].to_vec(),
                node_label: meta.node_label.clone(),
                plugin_name: meta.plugin_name.clone(),
            },
        );
        let tree_dump = TreeDump {
            root_id: None,
            next_id: 0,
            nodes: Vec::new(),
        };
        self.prepare(dir, &nodes, scan, &tree_dump, overwrite)?;

        let path = existing_node_file(dir, node_id, self.file_extension())?;
        let file = hdf5::File::append(&path).map_err(|e| ExecutionError::storage(&path, e.to_string()))?;
        let dataset = file
            .dataset("entry/data/data")
            .map_err(|e| ExecutionError::storage(&path, e.to_string()))?;
        let shaped = ndarray::ArrayD::from_shape_vec(composite.shape().to_vec(), composite.data().to_vec())
            .map_err(|e| ExecutionError::internal(e.to_string()))?;
        dataset
            .write(&shaped)
            .map_err(|e| ExecutionError::storage(&path, e.to_string()))?;

        let entry = file
            .group("entry")
            .map_err(|e| ExecutionError::storage(&path, e.to_string()))?;
        write_string_dataset(&entry, "data_label", &meta.data_label)?;
        write_string_dataset(&entry, "data_unit", &meta.data_unit)?;

        let data_group = file
            .group("entry/data")
            .map_err(|e| ExecutionError::storage(&path, e.to_string()))?;
        let trailing_meta = FrameMetadata {
            axis_labels: composite.axis_labels[scan.ndim()..].to_vec(),
            axis_units: composite.axis_units[scan.ndim()..].to_vec(),
            axis_ranges: composite.axis_ranges[scan.ndim()..].to_vec(),
            data_label: meta.data_label.clone(),
            data_unit: meta.data_unit.clone(),
        };
        Self::write_axis_groups(&data_group, scan, node_id, Some(&trailing_meta), composite.shape())?;
        Ok(())
    }

    fn import_from_file(&self, path: &Path) -> Result<ImportedResult> {
        let file = hdf5::File::open(path).map_err(|e| ExecutionError::storage(path, e.to_string()))?;
        let dataset = file
            .dataset("entry/data/data")
            .map_err(|e| ExecutionError::storage(path, e.to_string()))?;
        let array: ndarray::ArrayD<f32> = dataset
            .read()
            .map_err(|e| ExecutionError::storage(path, e.to_string()))?;
        let shape = array.shape().to_vec();
        let data = Dataset::from_data(&shape, array.into_raw_vec())
            .map_err(|e| ExecutionError::internal(e))?;

        let node_id = read_string(&file, "entry/node_id")?.parse().unwrap_or(0);
        Ok(ImportedResult {
            node_label: read_string(&file, "entry/label").unwrap_or_default(),
            data_label: read_string(&file, "entry/data_label").unwrap_or_default(),
            data_unit: read_string(&file, "entry/data_unit").unwrap_or_default(),
            plugin_name: read_string(&file, "entry/plugin_name").unwrap_or_default(),
            result_title: read_string(&file, "entry/label").unwrap_or_default(),
            node_id,
            data,
        })
    }
}

fn read_string(file: &hdf5::File, path: &str) -> Result<String> {
    let ds = file
        .dataset(path)
        .map_err(|e| ExecutionError::storage(path, e.to_string()))?;
    let v: hdf5::types::VarLenUnicode = ds
        .read_scalar()
        .map_err(|e| ExecutionError::storage(path, e.to_string()))?;
    Ok(v.to_string())
}

fn existing_node_file(dir: &Path, node_id: usize, ext: &str) -> Result<PathBuf> {
    let entries = fs::read_dir(dir).map_err(|e| ExecutionError::storage(dir, e.to_string()))?;
    let prefix = format!("node_{node_id:02}_");
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with(&prefix) && name.ends_with(ext) {
            return Ok(entry.path());
        }
    }
    Err(ExecutionError::storage(
        dir,
        format!("no prepared result file found for node {node_id}"),
    ))
}

/// Flattened one-file-per-node CSV writer (scan dims flattened into rows).
pub struct CsvResultWriter;

impl ResultWriter for CsvResultWriter {
    fn format_name(&self) -> &'static str {
        "csv"
    }

    fn file_extension(&self) -> &'static str {
        "csv"
    }

    fn prepare(
        &self,
        dir: &Path,
        nodes: &HashMap<usize, PrepInfo>,
        _scan: &Scan,
        _tree: &TreeDump,
        overwrite: bool,
    ) -> Result<()> {
        for (&node_id, info) in nodes {
            let path = node_file_path(dir, node_id, &info.node_label, self.file_extension());
            ensure_writable_dir(dir, &path, overwrite)?;
            fs::write(&path, "").map_err(|e| ExecutionError::storage(&path, e.to_string()))?;
        }
        Ok(())
    }

    fn export_frame(&self, dir: &Path, node_id: usize, _scan_pos: &[usize], value: &Dataset) -> Result<()> {
        let path = existing_node_file(dir, node_id, self.file_extension())?;
        let mut file = fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .map_err(|e| ExecutionError::storage(&path, e.to_string()))?;
        let row = value.data().iter().map(|v| v.to_string()).collect::<Vec<_>>().join(",");
        writeln!(file, "{row}").map_err(|e| ExecutionError::storage(&path, e.to_string()))?;
        Ok(())
    }

    fn push_metadata(&self, _dir: &Path, _frame_meta: &HashMap<usize, FrameMetadata>, _scan: &Scan) -> Result<()> {
        Ok(())
    }

    fn export_full(
        &self,
        dir: &Path,
        node_id: usize,
        meta: &NodeMetadataRecord,
        composite: &Dataset,
        scan: &Scan,
        overwrite: bool,
    ) -> Result<()> {
        let path = node_file_path(dir, node_id, &meta.node_label, self.file_extension());
        ensure_writable_dir(dir, &path, overwrite)?;
        let trailing: usize = composite.shape()[scan.ndim()..].iter().product();
        let mut out = String::new();
        for chunk in composite.data().chunks(trailing.max(1)) {
            out.push_str(&chunk.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(","));
            out.push('\n');
        }
        fs::write(&path, out).map_err(|e| ExecutionError::storage(&path, e.to_string()))?;
        Ok(())
    }

    fn import_from_file(&self, path: &Path) -> Result<ImportedResult> {
        let contents = fs::read_to_string(path).map_err(|e| ExecutionError::storage(path, e.to_string()))?;
        let mut rows = Vec::new();
        let mut row_len = 0;
        for line in contents.lines() {
            let row: Vec<f32> = line
                .split(',')
                .filter(|s| !s.is_empty())
                .map(|s| s.parse::<f32>().unwrap_or(f32::NAN))
                .collect();
            row_len = row.len();
            rows.extend(row);
        }
        let n_rows = if row_len > 0 { rows.len() / row_len } else { 0 };
        let shape = if row_len > 0 { vec![n_rows, row_len] } else { vec![0] };
        let data = Dataset::from_data(&shape, rows).map_err(ExecutionError::internal)?;
        Ok(ImportedResult {
            data,
            node_label: String::new(),
            data_label: String::new(),
            data_unit: String::new(),
            plugin_name: String::new(),
            node_id: 0,
            result_title: String::new(),
        })
    }
}

/// Flattened one-file-per-node raw little-endian `f32` writer.
pub struct BinaryResultWriter;

impl ResultWriter for BinaryResultWriter {
    fn format_name(&self) -> &'static str {
        "binary"
    }

    fn file_extension(&self) -> &'static str {
        "bin"
    }

    fn prepare(
        &self,
        dir: &Path,
        nodes: &HashMap<usize, PrepInfo>,
        _scan: &Scan,
        _tree: &TreeDump,
        overwrite: bool,
    ) -> Result<()> {
        for (&node_id, info) in nodes {
            let path = node_file_path(dir, node_id, &info.node_label, self.file_extension());
            ensure_writable_dir(dir, &path, overwrite)?;
            fs::write(&path, []).map_err(|e| ExecutionError::storage(&path, e.to_string()))?;
        }
        Ok(())
    }

    fn export_frame(&self, dir: &Path, node_id: usize, _scan_pos: &[usize], value: &Dataset) -> Result<()> {
        let path = existing_node_file(dir, node_id, self.file_extension())?;
        let mut file = fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .map_err(|e| ExecutionError::storage(&path, e.to_string()))?;
        for v in value.data() {
            file.write_all(&v.to_le_bytes())
                .map_err(|e| ExecutionError::storage(&path, e.to_string()))?;
        }
        Ok(())
    }

    fn push_metadata(&self, _dir: &Path, _frame_meta: &HashMap<usize, FrameMetadata>, _scan: &Scan) -> Result<()> {
        Ok(())
    }

    fn export_full(
        &self,
        dir: &Path,
        node_id: usize,
        meta: &NodeMetadataRecord,
        composite: &Dataset,
        _scan: &Scan,
        overwrite: bool,
    ) -> Result<()> {
        let path = node_file_path(dir, node_id, &meta.node_label, self.file_extension());
        ensure_writable_dir(dir, &path, overwrite)?;
        let mut bytes = Vec::with_capacity(composite.len() * 4);
        for v in composite.data() {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        fs::write(&path, bytes).map_err(|e| ExecutionError::storage(&path, e.to_string()))?;
        Ok(())
    }

    fn import_from_file(&self, path: &Path) -> Result<ImportedResult> {
        let bytes = fs::read(path).map_err(|e| ExecutionError::storage(path, e.to_string()))?;
        let data: Vec<f32> = bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        let len = data.len();
        let dataset = Dataset::from_data(&[len], data).map_err(ExecutionError::internal)?;
        Ok(ImportedResult {
            data: dataset,
            node_label: String::new(),
            data_label: String::new(),
            data_unit: String::new(),
            plugin_name: String::new(),
            node_id: 0,
            result_title: String::new(),
        })
    }
}

/// Registry of named writers, plus which one (if any) is "active" for
/// live autosave export during a run (spec.md §4.6).
pub struct ResultWriterRegistry {
    writers: HashMap<&'static str, Box<dyn ResultWriter>>,
    active: Option<(String, PathBuf, Scan)>,
}

impl Default for ResultWriterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ResultWriterRegistry {
    pub fn new() -> Self {
        let mut writers: HashMap<&'static str, Box<dyn ResultWriter>> = HashMap::new();
        writers.insert("hdf5", Box::new(Hdf5ResultWriter::new()));
        writers.insert("csv", Box::new(CsvResultWriter));
        writers.insert("binary", Box::new(BinaryResultWriter));
        ResultWriterRegistry {
            writers,
            active: None,
        }
    }

    pub fn get(&self, format: &str) -> Option<&dyn ResultWriter> {
        self.writers.get(format).map(|b| b.as_ref())
    }

    pub fn activate(&mut self, format: &str, dir: PathBuf, scan: Scan) -> Result<()> {
        if !self.writers.contains_key(format) {
            return Err(ExecutionError::user_config(format!(
                "unknown result writer format '{format}'"
            )));
        }
        self.active = Some((format.to_string(), dir, scan));
        Ok(())
    }

    pub fn deactivate(&mut self) {
        self.active = None;
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// Writes the plugin-side trailing axis metadata into the active
    /// writer's pre-allocated file, once, right after the first frame's
    /// metadata is known (spec.md §4.5, `push_metadata`).
    pub fn push_metadata_to_active(&mut self, frame_meta: &HashMap<usize, FrameMetadata>) {
        let Some((format, dir, scan)) = self.active.clone() else { return };
        let Some(writer) = self.writers.get(format.as_str()) else { return };
        if let Err(e) = writer.push_metadata(&dir, frame_meta, &scan) {
            warn!("autosave push_metadata failed: {e}; disabling autosave for the rest of the run");
            self.active = None;
        }
    }

    pub fn export_frame_to_active(&mut self, node_id: usize, scan_pos: &[usize], value: &Dataset) {
        let Some((format, dir, _scan)) = self.active.clone() else { return };
        let Some(writer) = self.writers.get(format.as_str()) else { return };
        if let Err(e) = writer.export_frame(&dir, node_id, scan_pos, value) {
            warn!("autosave export_frame failed for node {node_id}: {e}; disabling autosave for the rest of the run");
            self.active = None;
        }
    }
}
