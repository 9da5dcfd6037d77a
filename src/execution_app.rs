//! `ExecutionApp` — orchestrates one run across a pool of worker threads
//! communicating through a `SharedBuffer` (spec.md §4.6, §5).
//!
//! Workers here are OS threads within this process rather than separate
//! worker processes: the `SharedBuffer` they share is still a genuine named
//! POSIX shared-memory segment (so the slot-claim protocol and its testable
//! properties, spec.md P6-P8, are exercised for real), but `shapes_dict` /
//! `metadata_dict` / the stop flag live as ordinary `Arc`-shared state instead
//! of a second shared-memory region, since every "process" here already
//! shares an address space. A worker is modeled as a clone of the
//! orchestrator's tree reconstructed from its serialized form (its own
//! `ProcessingTree`, independently `prepare`d), mirroring spec.md §4.6's
//! "if this is a clone, rebuilds the tree... from the captured serialized
//! context" — the same clone-by-context-replay idea the teacher's own
//! worker pool (`node_graph::executor`) uses, just without needing a second
//! real OS process to prove it out.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver};
use log::{info, warn};

use crate::config::{keys, ConfigStore};
use crate::dataset::Dataset;
use crate::error::{ExecutionError, Result};
use crate::plugin::PluginRegistry;
use crate::result_store::{FrameMetadata, NodeMetadataRecord, ResultStore};
use crate::result_writer::PrepInfo;
use crate::scan::Scan;
use crate::shared_buffer::SharedBuffer;
use crate::tree::ProcessingTree;

const SLOT_BACKOFF: Duration = Duration::from_millis(5);

/// Run-scoped configuration, pulled out of a `ConfigStore` at `global/*`
/// and top-level keys (spec.md §6).
#[derive(Clone, Debug)]
pub struct RunConfig {
    pub n_workers: usize,
    pub shared_buffer_size_mb: f64,
    pub shared_buffer_max_n: usize,
    pub autosave_results: bool,
    pub autosave_directory: Option<PathBuf>,
    pub autosave_format: String,
    pub live_processing: bool,
    pub overwrite: bool,
}

impl RunConfig {
    pub fn from_config_store(config: &ConfigStore) -> Result<Self> {
        Ok(RunConfig {
            n_workers: config.get_int(keys::MP_N_WORKERS, 1)?.max(1) as usize,
            shared_buffer_size_mb: config.get_float(keys::SHARED_BUFFER_SIZE, 64.0)?,
            shared_buffer_max_n: config.get_int(keys::SHARED_BUFFER_MAX_N, i64::MAX)?.max(0) as usize,
            autosave_results: config.get_bool(keys::AUTOSAVE_RESULTS, false)?,
            autosave_directory: config.get_path(keys::AUTOSAVE_DIRECTORY)?,
            autosave_format: config
                .get_string(keys::AUTOSAVE_FORMAT)?
                .unwrap_or_else(|| "hdf5".to_string()),
            live_processing: config.get_bool(keys::LIVE_PROCESSING, false)?,
            overwrite: false,
        })
    }

    pub fn with_overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }
}

/// A message a worker thread sends back to the orchestrator (spec.md §5,
/// "message queues carrying (task_index, slot_index) results, ... short
/// string signals").
pub enum WorkerEvent {
    Stored { index: usize, slot: usize },
    FrameFailed { index: usize },
    Fatal(ExecutionError),
}

/// Tallies from a finished run.
#[derive(Clone, Copy, Debug, Default)]
pub struct RunReport {
    pub completed: usize,
    pub failed: usize,
}

struct SharedRunState {
    next_task: AtomicUsize,
    n_points: usize,
    stop: AtomicBool,
    shapes_available: AtomicBool,
    static_shapes: HashMap<usize, Vec<usize>>,
    buffer: SharedBuffer,
    live_processing: bool,
}

pub struct ExecutionApp {
    tree: ProcessingTree,
    scan: Scan,
    config: RunConfig,
    registry: Arc<PluginRegistry>,
    result_store: ResultStore,
    static_shapes: Option<HashMap<usize, Vec<usize>>>,
    tree_yaml: Option<String>,
}

impl ExecutionApp {
    pub fn new(tree: ProcessingTree, scan: Scan, config: RunConfig, registry: Arc<PluginRegistry>) -> Self {
        ExecutionApp {
            tree,
            scan,
            config,
            registry,
            result_store: ResultStore::new(),
            static_shapes: None,
            tree_yaml: None,
        }
    }

    pub fn result_store(&self) -> &ResultStore {
        &self.result_store
    }

    pub fn scan(&self) -> &Scan {
        &self.scan
    }

    /// Validates configuration and propagates shapes, synchronously and
    /// before any worker exists (spec.md §7, UserConfigError/
    /// ShapeInconsistency "raised before any worker starts").
    pub fn prepare(&mut self) -> Result<()> {
        self.tree.prepare()?;

        let static_shapes = self.tree.result_shapes();
        if static_shapes.is_empty() {
            return Err(ExecutionError::user_config(
                "tree has no node whose output is retained; nothing to execute",
            ));
        }

        let bytes_per_frame: usize = static_shapes
            .values()
            .map(|shape| shape.iter().product::<usize>() * 4)
            .sum();
        if bytes_per_frame == 0 {
            return Err(ExecutionError::user_config(
                "retained nodes produce zero-sized frames; cannot size shared buffer",
            ));
        }

        let configured_bytes = (self.config.shared_buffer_size_mb * 1024.0 * 1024.0).floor() as usize;
        let max_by_memory = configured_bytes / bytes_per_frame;
        let capacity = max_by_memory
            .min(self.config.shared_buffer_max_n)
            .min(self.scan.n_points().max(1));

        if capacity < self.config.n_workers {
            let required_mb = (self.config.n_workers * bytes_per_frame) as f64 / (1024.0 * 1024.0);
            return Err(ExecutionError::user_config(format!(
                "shared buffer capacity {capacity} is smaller than mp_n_workers {}; required minimum {:.2} MB",
                self.config.n_workers, required_mb
            )));
        }

        let node_meta: HashMap<usize, NodeMetadataRecord> = static_shapes
            .keys()
            .map(|&id| {
                let record = self.tree.get_node(id).expect("result_shapes only names live nodes");
                (
                    id,
                    NodeMetadataRecord {
                        node_label: record.plugin.label(),
                        plugin_name: record.plugin.plugin_name().to_string(),
                        data_label: String::new(),
                        data_unit: String::new(),
                        result_title: record.plugin.result_title(),
                    },
                )
            })
            .collect();

        self.result_store
            .prepare_new_results(&self.scan, &self.tree.dump(), node_meta);
        self.result_store.store_frame_shapes(static_shapes.clone())?;

        if self.config.autosave_results {
            let dir = self
                .config
                .autosave_directory
                .clone()
                .ok_or_else(|| ExecutionError::user_config("autosave_results is set but autosave_directory is empty"))?;
            let writer = self
                .result_store
                .writers_mut()
                .get(&self.config.autosave_format)
                .ok_or_else(|| {
                    ExecutionError::user_config(format!(
                        "unknown autosave_format '{}'",
                        self.config.autosave_format
                    ))
                })?;
            let prep_nodes: HashMap<usize, PrepInfo> = static_shapes
                .iter()
                .map(|(&id, shape)| {
                    let record = self.tree.get_node(id).unwrap();
                    (
                        id,
                        PrepInfo {
                            shape: shape.clone(),
                            node_label: record.plugin.label(),
                            plugin_name: record.plugin.plugin_name().to_string(),
                        },
                    )
                })
                .collect();
            writer.prepare(&dir, &prep_nodes, &self.scan, &self.tree.dump(), self.config.overwrite)?;
            self.result_store
                .writers_mut()
                .activate(&self.config.autosave_format, dir, self.scan.clone())?;
        }

        self.tree_yaml = Some(self.tree.export_to_string()?);
        self.static_shapes = Some(static_shapes);
        info!(
            "execution app prepared: capacity={capacity} n_workers={} n_points={}",
            self.config.n_workers,
            self.scan.n_points()
        );
        Ok(())
    }

    /// Runs every scan task across `config.n_workers` worker threads,
    /// draining results into the result store as they arrive.
    pub fn run(&mut self) -> Result<RunReport> {
        self.run_with_progress(|_| {})
    }

    /// Like `run`, but calls `on_progress(fraction_complete)` after every
    /// task the orchestrator drains (spec.md §4.7, worker `progress` signal
    /// wired to "a printer that renders a 60-char progress bar").
    pub fn run_with_progress(&mut self, mut on_progress: impl FnMut(f64)) -> Result<RunReport> {
        let n_points = self.scan.n_points();
        if n_points == 0 {
            return Ok(RunReport::default());
        }
        let static_shapes = self
            .static_shapes
            .clone()
            .ok_or_else(|| ExecutionError::internal("run() called before prepare()"))?;
        let tree_yaml = self
            .tree_yaml
            .clone()
            .ok_or_else(|| ExecutionError::internal("run() called before prepare()"))?;

        let buffer = SharedBuffer::create(&shared_buffer_name(), self.capacity(&static_shapes), &static_shapes)?;

        let state = Arc::new(SharedRunState {
            next_task: AtomicUsize::new(0),
            n_points,
            stop: AtomicBool::new(false),
            shapes_available: AtomicBool::new(false),
            static_shapes,
            buffer,
            live_processing: self.config.live_processing,
        });

        let (tx, rx) = unbounded::<WorkerEvent>();
        let mut handles = Vec::with_capacity(self.config.n_workers);
        for worker_id in 0..self.config.n_workers {
            let state = Arc::clone(&state);
            let registry = Arc::clone(&self.registry);
            let yaml = tree_yaml.clone();
            let tx = tx.clone();
            handles.push(
                thread::Builder::new()
                    .name(format!("scanflow-worker-{worker_id}"))
                    .spawn(move || run_worker(state, registry, yaml, tx))
                    .expect("failed to spawn worker thread"),
            );
        }
        drop(tx);

        let report = self.drain_events(&rx, &state, &mut on_progress);

        for handle in handles {
            let _ = handle.join();
        }

        report
    }

    fn capacity(&self, static_shapes: &HashMap<usize, Vec<usize>>) -> usize {
        let bytes_per_frame: usize = static_shapes.values().map(|s| s.iter().product::<usize>() * 4).sum();
        let configured_bytes = (self.config.shared_buffer_size_mb * 1024.0 * 1024.0).floor() as usize;
        (configured_bytes / bytes_per_frame.max(1))
            .min(self.config.shared_buffer_max_n)
            .min(self.scan.n_points().max(1))
    }

    fn drain_events(
        &mut self,
        rx: &Receiver<WorkerEvent>,
        state: &Arc<SharedRunState>,
        on_progress: &mut impl FnMut(f64),
    ) -> Result<RunReport> {
        let mut report = RunReport::default();
        let mut fatal: Option<ExecutionError> = None;
        let mut metadata_committed = false;

        while let Ok(event) = rx.recv() {
            match event {
                WorkerEvent::Fatal(err) => {
                    warn!("worker reported fatal error: {err}");
                    state.stop.store(true, Ordering::SeqCst);
                    fatal = Some(err);
                    break;
                }
                WorkerEvent::FrameFailed { index } => {
                    warn!("frame read error at scan index {index}; composite position left at sentinel");
                    report.failed += 1;
                }
                WorkerEvent::Stored { index, slot } => {
                    let results = state.buffer.take_slot(slot)?;
                    if !metadata_committed {
                        self.commit_frame_metadata(&state.static_shapes, &results)?;
                        metadata_committed = true;
                    }
                    let scan_pos = self.scan.index_to_scan_position(index);
                    for (&node_id, value) in &results {
                        self.result_store
                            .writers_mut()
                            .export_frame_to_active(node_id, &scan_pos, value);
                    }
                    self.result_store.store_results(index, results)?;
                    report.completed += 1;
                }
            }
            on_progress((report.completed + report.failed) as f64 / state.n_points as f64);
            if report.completed + report.failed >= state.n_points {
                break;
            }
        }

        if let Some(err) = fatal {
            return Err(err);
        }
        Ok(report)
    }

    /// First successful frame's shapes must match the static prediction
    /// computed at `prepare()` (spec.md §9, Open Question: "shape observed
    /// on the first successful task is final; later mismatches are
    /// InternalError" — here checked against the pre-run static shape
    /// instead of across later tasks, since this core resolves shapes
    /// before a worker ever runs).
    fn commit_frame_metadata(
        &mut self,
        static_shapes: &HashMap<usize, Vec<usize>>,
        results: &HashMap<usize, Dataset>,
    ) -> Result<()> {
        let mut frame_meta = HashMap::with_capacity(results.len());
        for (&node_id, dataset) in results {
            if let Some(expected) = static_shapes.get(&node_id) {
                if expected.as_slice() != dataset.shape() {
                    return Err(ExecutionError::Internal(format!(
                        "node {node_id} produced shape {:?} but prepare() predicted {:?}",
                        dataset.shape(),
                        expected
                    )));
                }
            }
            frame_meta.insert(
                node_id,
                FrameMetadata {
                    axis_labels: dataset.axis_labels.clone(),
                    axis_units: dataset.axis_units.clone(),
                    axis_ranges: dataset.axis_ranges.clone(),
                    data_label: dataset.data_label.clone(),
                    data_unit: dataset.data_unit.clone(),
                },
            );
        }
        self.result_store.store_frame_metadata(frame_meta);
        Ok(())
    }

    pub fn request_stop(&self) {
        // Nothing to stop before a run has started; kept for symmetry with
        // the runner's cancellation hook (spec.md §5, Cancellation).
    }
}

fn shared_buffer_name() -> String {
    format!("/scanflow-{}-{}", std::process::id(), rand::random::<u32>())
}

fn run_worker(
    state: Arc<SharedRunState>,
    registry: Arc<PluginRegistry>,
    tree_yaml: String,
    events: crossbeam_channel::Sender<WorkerEvent>,
) {
    let mut tree = match ProcessingTree::restore_from_string(&tree_yaml, &registry) {
        Ok(tree) => tree,
        Err(err) => {
            let _ = events.send(WorkerEvent::Fatal(err));
            return;
        }
    };
    if let Err(err) = tree.prepare() {
        let _ = events.send(WorkerEvent::Fatal(err));
        return;
    }

    loop {
        if state.stop.load(Ordering::SeqCst) {
            return;
        }
        let index = state.next_task.fetch_add(1, Ordering::SeqCst);
        if index >= state.n_points {
            return;
        }

        if state.live_processing && !wait_for_input(&tree, index, &state.stop) {
            return;
        }

        let results = match tree.execute_and_collect(index) {
            Ok(results) => results,
            Err(err) if err.is_frame_read() => {
                let _ = events.send(WorkerEvent::FrameFailed { index });
                continue;
            }
            Err(err) => {
                let _ = events.send(WorkerEvent::Fatal(err));
                return;
            }
        };

        if !state.shapes_available.swap(true, Ordering::SeqCst) {
            for (node_id, dataset) in &results {
                if let Some(expected) = state.static_shapes.get(node_id) {
                    if expected.as_slice() != dataset.shape() {
                        let _ = events.send(WorkerEvent::Fatal(ExecutionError::ShapeInconsistency {
                            node_id: *node_id,
                            message: format!(
                                "observed shape {:?} does not match shape propagated at prepare time {:?}",
                                dataset.shape(),
                                expected
                            ),
                        }));
                        return;
                    }
                }
            }
        }

        loop {
            if state.stop.load(Ordering::SeqCst) {
                return;
            }
            match state.buffer.try_claim_slot() {
                Some(slot) => {
                    if let Err(err) = state.buffer.write_results(slot, &results) {
                        let _ = events.send(WorkerEvent::Fatal(err));
                        return;
                    }
                    if events.send(WorkerEvent::Stored { index, slot }).is_err() {
                        return;
                    }
                    break;
                }
                None => thread::sleep(SLOT_BACKOFF),
            }
        }
    }
}

/// Blocks at a task boundary until the root plugin reports its input
/// available, or the run is cancelled (spec.md §4.6 `carryon`, §5
/// "waiting for shapes_set... with backoff" applied here to input
/// availability instead).
fn wait_for_input(tree: &ProcessingTree, index: usize, stop: &AtomicBool) -> bool {
    loop {
        if stop.load(Ordering::SeqCst) {
            return false;
        }
        let available = match tree.root_id() {
            Some(root) => tree
                .get_node(root)
                .map(|record| record.plugin.input_available(index))
                .unwrap_or(true),
            None => true,
        };
        if available {
            return true;
        }
        thread::sleep(SLOT_BACKOFF);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::builtin::{AddConstantPlugin, SyntheticLoaderPlugin};
    use crate::scan::ScanAxis;

    fn test_registry() -> Arc<PluginRegistry> {
        let mut registry = PluginRegistry::new();
        crate::plugin::builtin::register_all(&mut registry);
        Arc::new(registry)
    }

    fn axis(label: &str) -> ScanAxis {
        ScanAxis {
            label: label.to_string(),
            unit: String::new(),
            range: None,
        }
    }

    fn linear_tree() -> ProcessingTree {
        let mut tree = ProcessingTree::new();
        let root = tree
            .register_node(Box::new(SyntheticLoaderPlugin::with_shape(2, 2)), None, None)
            .unwrap();
        tree.register_node(Box::new(AddConstantPlugin::new(0.1)), Some(root), None)
            .unwrap();
        tree
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

    #[test]
    fn run_completes_every_task_with_no_failures() {
        let tree = linear_tree();
        let scan = Scan::new(vec![2, 2], vec![axis("y"), axis("x")]);
        let mut app = ExecutionApp::new(tree, scan, base_config(), test_registry());
        app.prepare().unwrap();
        let report = app.run().unwrap();
        assert_eq!(report.completed, 4);
        assert_eq!(report.failed, 0);

        let composite = app.result_store().get_results(1).unwrap();
        assert_eq!(composite.shape(), &[2, 2, 2, 2]);
        assert!(composite.data().iter().all(|&v| !v.is_nan()));
    }

    #[test]
    fn prepare_rejects_buffer_smaller_than_worker_count() {
        // 1024x1024 f32 frames are exactly 4 MB each; an 8-worker run needs
        // 32 MB of shared buffer but is only given 1 MB (spec.md §8 Scenario 4).
        let mut tree = ProcessingTree::new();
        tree.register_node(Box::new(SyntheticLoaderPlugin::with_shape(1024, 1024)), None, None)
            .unwrap();
        let scan = Scan::new(vec![8], vec![axis("y")]);
        let mut config = base_config();
        config.n_workers = 8;
        config.shared_buffer_size_mb = 1.0;
        let mut app = ExecutionApp::new(tree, scan, config, test_registry());
        let err = app.prepare().unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("required minimum 32.00 MB"), "message was: {msg}");
    }

    #[test]
    fn prepare_rejects_unresolvable_output_shape() {
        struct BadDimPlugin {
            node_id: usize,
            config: crate::config::ConfigStore,
        }
        impl crate::plugin::Plugin for BadDimPlugin {
            fn plugin_name(&self) -> &'static str {
                "BadDimPlugin"
            }
            fn node_id(&self) -> usize {
                self.node_id
            }
            fn set_node_id(&mut self, id: usize) {
                self.node_id = id;
            }
            fn config(&self) -> &crate::config::ConfigStore {
                &self.config
            }
            fn config_mut(&mut self) -> &mut crate::config::ConfigStore {
                &mut self.config
            }
            fn execute(
                &mut self,
                input: crate::plugin::PluginInput,
                kwargs: crate::plugin::KwArgs,
            ) -> Result<(Dataset, crate::plugin::KwArgs)> {
                let frame = input.as_frame().unwrap().clone();
                Ok((frame, kwargs))
            }
            fn set_input_shape(&mut self, _shape: Option<Vec<usize>>) {}
            fn calculate_result_shape(&mut self) -> Result<Vec<usize>> {
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

        let mut tree = ProcessingTree::new();
        let root = tree
            .register_node(Box::new(SyntheticLoaderPlugin::with_shape(2, 2)), None, None)
            .unwrap();
        tree.register_node(
            Box::new(BadDimPlugin {
                node_id: 0,
                config: crate::config::ConfigStore::new(),
            }),
            Some(root),
            None,
        )
        .unwrap();

        let scan = Scan::new(vec![2], vec![axis("y")]);
        let mut app = ExecutionApp::new(tree, scan, base_config(), test_registry());
        let err = app.prepare().unwrap_err();
        assert!(matches!(err, ExecutionError::ShapeInconsistency { .. }));
    }
}
