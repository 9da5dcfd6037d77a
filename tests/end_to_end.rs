//! Crate-level end-to-end scenarios (spec.md §8), one test per numbered
//! scenario, grounded the way the teacher's `tests/benchmark_audio.rs`
//! exercises its audio subsystem as a whole rather than unit-by-unit.

use std::path::PathBuf;
use std::sync::Arc;

use scanflow::config::ConfigStore;
use scanflow::dataset::Dataset;
use scanflow::error::{ExecutionError, Result};
use scanflow::execution_app::{ExecutionApp, RunConfig};
use scanflow::plugin::builtin::{AddConstantPlugin, SyntheticLoaderPlugin};
use scanflow::plugin::{KwArgs, Plugin, PluginInput, PluginRegistry};
use scanflow::scan::ScanAxis;
use scanflow::tree::ProcessingTree;
use scanflow::Scan;

fn axis(label: &str) -> ScanAxis {
    ScanAxis {
        label: label.to_string(),
        unit: String::new(),
        range: None,
    }
}

fn test_registry() -> Arc<PluginRegistry> {
    let mut registry = PluginRegistry::new();
    scanflow::plugin::builtin::register_all(&mut registry);
    Arc::new(registry)
}

fn base_config() -> RunConfig {
    RunConfig {
        n_workers: 2,
        shared_buffer_size_mb: 64.0,
        shared_buffer_max_n: 64,
        autosave_results: false,
        autosave_directory: None,
        autosave_format: "hdf5".to_string(),
        live_processing: false,
        overwrite: false,
    }
}

/// Scenario 1: linear 3-node tree on a 5x7x3 scan, 10x10 frames, each stage
/// adds 0.1.
#[test]
fn scenario_1_linear_chain_on_3d_scan() {
    let mut tree = ProcessingTree::new();
    let root = tree
        .register_node(Box::new(SyntheticLoaderPlugin::with_shape(10, 10)), None, None)
        .unwrap();
    let mid = tree
        .register_node(Box::new(AddConstantPlugin::new(0.1)), Some(root), None)
        .unwrap();
    tree.register_node(Box::new(AddConstantPlugin::new(0.1)), Some(mid), None)
        .unwrap();

    let scan = Scan::new(vec![5, 7, 3], vec![axis("y"), axis("x"), axis("z")]);
    let mut app = ExecutionApp::new(tree, scan, base_config(), test_registry());
    app.prepare().unwrap();
    let report = app.run().unwrap();
    assert_eq!(report.completed, 5 * 7 * 3);
    assert_eq!(report.failed, 0);

    let leaf_id = 2;
    let composite = app.result_store().get_results(leaf_id).unwrap();
    assert_eq!(composite.shape(), &[5, 7, 3, 10, 10]);

    // scan index 0 is scan position (0,0,0); SyntheticLoaderPlugin fills the
    // loader frame with the task index (0.0 here), so two +0.1 stages give
    // 0.2 per element.
    let frame_len = 10 * 10;
    let first_frame_sum: f64 = composite.data()[..frame_len].iter().map(|&v| v as f64).sum();
    assert!((first_frame_sum - (frame_len as f64 * 0.2)).abs() < 1e-4);
}

/// Scenario 2: branching tree with an intermediate `keep_results` node.
#[test]
fn scenario_2_branching_tree_keeps_intermediate_results() {
    let mut tree = ProcessingTree::new();
    let root = tree
        .register_node(Box::new(SyntheticLoaderPlugin::with_shape(3, 3)), None, None)
        .unwrap();
    let proc1 = tree
        .register_node(
            Box::new(AddConstantPlugin::new(1.0).keeping_results(true)),
            Some(root),
            None,
        )
        .unwrap();
    tree.register_node(Box::new(AddConstantPlugin::new(2.0)), Some(proc1), None)
        .unwrap();

    let scan = Scan::new(vec![2, 2], vec![axis("y"), axis("x")]);
    let mut app = ExecutionApp::new(tree, scan, base_config(), test_registry());
    app.prepare().unwrap();
    let report = app.run().unwrap();
    assert_eq!(report.completed, 4);

    let proc1_composite = app.result_store().get_results(1).unwrap();
    let proc2_composite = app.result_store().get_results(2).unwrap();
    assert_eq!(&proc1_composite.shape()[..2], &[2, 2]);
    assert_eq!(&proc2_composite.shape()[..2], &[2, 2]);

    let dir = tempfile::tempdir().unwrap();
    app.result_store().save_to_disk(dir.path(), &["hdf5"], false, None).unwrap();
    let mut names: Vec<String> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
        .collect();
    names.sort();
    assert!(names.iter().any(|n| n.starts_with("node_01_") && n.ends_with(".h5")));
    assert!(names.iter().any(|n| n.starts_with("node_02_") && n.ends_with(".h5")));
}

struct BadDimPlugin {
    node_id: usize,
    config: ConfigStore,
}

impl Plugin for BadDimPlugin {
    fn plugin_name(&self) -> &'static str {
        "BadDimPlugin"
    }
    fn node_id(&self) -> usize {
        self.node_id
    }
    fn set_node_id(&mut self, id: usize) {
        self.node_id = id;
    }
    fn config(&self) -> &ConfigStore {
        &self.config
    }
    fn config_mut(&mut self) -> &mut ConfigStore {
        &mut self.config
    }
    fn execute(&mut self, input: PluginInput, kwargs: KwArgs) -> Result<(Dataset, KwArgs)> {
        let frame = input.as_frame().unwrap().clone();
        Ok((frame, kwargs))
    }
    fn set_input_shape(&mut self, _shape: Option<Vec<usize>>) {}
    fn calculate_result_shape(&mut self) -> Result<Vec<usize>> {
        // declares 1-D output but actually returns the 2-D input frame
        Ok(vec![2, 2])
    }
    fn output_data_dim(&self) -> Option<usize> {
        Some(1)
    }
    fn dump_params(&self) -> Vec<(String, serde_json::Value)> {
        Vec::new()
    }
    fn load_params(&mut self, _params: &[(String, serde_json::Value)]) {}
}

/// Scenario 3: a node declares `output_data_dim=1` but its actual output is
/// 2-D; `prepare()` must reject this before any worker runs, naming the node.
#[test]
fn scenario_3_unresolvable_output_shape_is_rejected_at_prepare() {
    let mut tree = ProcessingTree::new();
    let root = tree
        .register_node(Box::new(SyntheticLoaderPlugin::with_shape(2, 2)), None, None)
        .unwrap();
    tree.register_node(
        Box::new(BadDimPlugin {
            node_id: 0,
            config: ConfigStore::new(),
        }),
        Some(root),
        None,
    )
    .unwrap();

    let scan = Scan::new(vec![2], vec![axis("y")]);
    let mut app = ExecutionApp::new(tree, scan, base_config(), test_registry());
    let err = app.prepare().unwrap_err();
    assert!(matches!(err, ExecutionError::ShapeInconsistency { node_id: 1, .. }));
}

/// Scenario 4: a shared buffer sized for 1 MB cannot hold 8 workers' worth
/// of 4 MB frames; `prepare()` must fail with the exact required minimum.
#[test]
fn scenario_4_buffer_too_small_reports_required_minimum() {
    let mut tree = ProcessingTree::new();
    tree.register_node(Box::new(SyntheticLoaderPlugin::with_shape(1024, 1024)), None, None)
        .unwrap();

    let scan = Scan::new(vec![8], vec![axis("y")]);
    let mut config = base_config();
    config.n_workers = 8;
    config.shared_buffer_size_mb = 1.0;
    let mut app = ExecutionApp::new(tree, scan, config, test_registry());
    let err = app.prepare().unwrap_err();
    assert!(matches!(err, ExecutionError::UserConfig(_)));
    assert!(err.to_string().contains("required minimum 32.00 MB"));
}

/// A minimal plugin that reads one `f32` frame per task index from a file
/// named `frame_<index>.bin` under a configured directory, modeling a
/// live-acquisition loader whose input may not exist yet at dispatch time.
struct FileLoaderPlugin {
    node_id: usize,
    config: ConfigStore,
    dir: PathBuf,
    rows: usize,
    cols: usize,
}

impl FileLoaderPlugin {
    fn path_for(&self, index: usize) -> PathBuf {
        self.dir.join(format!("frame_{index}.bin"))
    }
}

impl Plugin for FileLoaderPlugin {
    fn plugin_name(&self) -> &'static str {
        "FileLoaderPlugin"
    }
    fn node_id(&self) -> usize {
        self.node_id
    }
    fn set_node_id(&mut self, id: usize) {
        self.node_id = id;
    }
    fn config(&self) -> &ConfigStore {
        &self.config
    }
    fn config_mut(&mut self) -> &mut ConfigStore {
        &mut self.config
    }
    fn execute(&mut self, input: PluginInput, kwargs: KwArgs) -> Result<(Dataset, KwArgs)> {
        let index = match input {
            PluginInput::Index(i) => i,
            PluginInput::Frame(_) => {
                return Err(ExecutionError::internal("FileLoaderPlugin must be the tree root"))
            }
        };
        let path = self.path_for(index);
        let bytes = std::fs::read(&path).map_err(|e| ExecutionError::FrameRead {
            index,
            message: format!("reading {path:?}: {e}"),
        })?;
        let data: Vec<f32> = bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        let ds = Dataset::from_data(&[self.rows, self.cols], data).map_err(ExecutionError::internal)?;
        Ok((ds, kwargs))
    }
    fn set_input_shape(&mut self, _shape: Option<Vec<usize>>) {}
    fn calculate_result_shape(&mut self) -> Result<Vec<usize>> {
        Ok(vec![self.rows, self.cols])
    }
    fn output_data_dim(&self) -> Option<usize> {
        Some(2)
    }
    fn input_available(&self, index: usize) -> bool {
        self.path_for(index).exists()
    }
    fn dump_params(&self) -> Vec<(String, serde_json::Value)> {
        vec![
            ("dir".to_string(), serde_json::Value::from(self.dir.to_string_lossy().to_string())),
            ("rows".to_string(), serde_json::Value::from(self.rows)),
            ("cols".to_string(), serde_json::Value::from(self.cols)),
        ]
    }
    fn load_params(&mut self, params: &[(String, serde_json::Value)]) {
        for (key, value) in params {
            match key.as_str() {
                "dir" => {
                    if let Some(v) = value.as_str() {
                        self.dir = PathBuf::from(v);
                    }
                }
                "rows" => {
                    if let Some(v) = value.as_u64() {
                        self.rows = v as usize;
                    }
                }
                "cols" => {
                    if let Some(v) = value.as_u64() {
                        self.cols = v as usize;
                    }
                }
                _ => {}
            }
        }
    }
}

fn write_frame(dir: &std::path::Path, index: usize, rows: usize, cols: usize, value: f32) {
    let mut bytes = Vec::with_capacity(rows * cols * 4);
    for _ in 0..(rows * cols) {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    std::fs::write(dir.join(format!("frame_{index}.bin")), bytes).unwrap();
}

/// Scenario 5: live processing where the file for one task index appears
/// only after a short delay; the run must still complete and fill every
/// composite position, including the delayed one.
#[test]
fn scenario_5_live_processing_waits_out_a_transient_missing_file() {
    let dir = tempfile::tempdir().unwrap();
    for index in [0usize, 1, 2] {
        write_frame(dir.path(), index, 2, 2, index as f32);
    }
    // frame_3.bin intentionally absent at run start.

    let writer_dir = dir.path().to_path_buf();
    let writer = std::thread::spawn(move || {
        std::thread::sleep(std::time::Duration::from_millis(50));
        write_frame(&writer_dir, 3, 2, 2, 3.0);
    });

    let mut registry = PluginRegistry::new();
    scanflow::plugin::builtin::register_all(&mut registry);
    registry.register("FileLoaderPlugin", || {
        Box::new(FileLoaderPlugin {
            node_id: 0,
            config: ConfigStore::new(),
            dir: PathBuf::new(),
            rows: 2,
            cols: 2,
        })
    });

    let mut tree = ProcessingTree::new();
    tree.register_node(
        Box::new(FileLoaderPlugin {
            node_id: 0,
            config: ConfigStore::new(),
            dir: dir.path().to_path_buf(),
            rows: 2,
            cols: 2,
        }),
        None,
        None,
    )
    .unwrap();

    let scan = Scan::new(vec![4], vec![axis("t")]);
    let mut config = base_config();
    config.n_workers = 1;
    config.live_processing = true;
    let mut app = ExecutionApp::new(tree, scan, config, Arc::new(registry));
    app.prepare().unwrap();
    let report = app.run().unwrap();

    writer.join().unwrap();
    assert_eq!(report.completed, 4);
    assert_eq!(report.failed, 0);

    let composite = app.result_store().get_results(0).unwrap();
    assert!(composite.data().iter().all(|&v| !v.is_nan()));
    let slice_3_start = 3 * 4;
    assert!(composite.data()[slice_3_start..slice_3_start + 4]
        .iter()
        .all(|&v| v == 3.0));
}

/// Scenario 6: reparenting a node onto its own descendant is rejected and
/// leaves the tree (and its hash) unchanged.
#[test]
fn scenario_6_reparent_onto_descendant_is_rejected_and_tree_is_unchanged() {
    let mut tree = ProcessingTree::new();
    let root = tree
        .register_node(Box::new(SyntheticLoaderPlugin::with_shape(2, 2)), None, None)
        .unwrap();
    let child = tree
        .register_node(Box::new(AddConstantPlugin::new(1.0)), Some(root), None)
        .unwrap();
    tree.register_node(Box::new(AddConstantPlugin::new(2.0)), Some(child), None)
        .unwrap();

    let hash_before = tree.hash();
    let err = tree.change_node_parent(child, child + 1).unwrap_err();
    assert!(matches!(err, ExecutionError::UserConfig(_)));
    assert_eq!(tree.hash(), hash_before);
}
