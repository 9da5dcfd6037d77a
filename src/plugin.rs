//! `Plugin` — the consumed processing-stage interface (spec.md §3, §4.1).
//!
//! The execution core never constructs plugin *content* (X-ray/pyFAI math is
//! explicitly out of scope, spec.md §1); it only depends on this trait and on
//! a name -> constructor registry so that trees can be serialized and
//! reconstructed by plugin class name (spec.md §9, "Config dispatch").

use std::collections::HashMap;
use std::sync::Mutex;

use once_cell::sync::Lazy;
use serde_json::Value;

use crate::config::ConfigStore;
use crate::dataset::Dataset;
use crate::error::Result;

pub type KwArgs = HashMap<String, Value>;

/// The input handed to a node's plugin. The root node of a tree is fed the
/// scan task index; every other node is fed its parent's output frame.
#[derive(Clone, Debug)]
pub enum PluginInput {
    Index(usize),
    Frame(Dataset),
}

impl PluginInput {
    pub fn as_frame(&self) -> Option<&Dataset> {
        match self {
            PluginInput::Frame(d) => Some(d),
            PluginInput::Index(_) => None,
        }
    }
}

/// A user-supplied processing stage wrapped by a `ProcessingNode`.
pub trait Plugin: Send {
    /// The registered class name, used for tree (de)serialization.
    fn plugin_name(&self) -> &'static str;

    fn node_id(&self) -> usize;
    fn set_node_id(&mut self, id: usize);

    fn config(&self) -> &ConfigStore;
    fn config_mut(&mut self) -> &mut ConfigStore;

    /// One-shot setup per run. Default no-op.
    fn pre_execute(&mut self) -> Result<()> {
        Ok(())
    }

    /// Pure per-frame transform.
    fn execute(&mut self, input: PluginInput, kwargs: KwArgs) -> Result<(Dataset, KwArgs)>;

    /// Record the shape propagated in from the parent (or `None` at the
    /// root, where the input is a task index rather than a frame).
    fn set_input_shape(&mut self, shape: Option<Vec<usize>>);

    /// Derived from the recorded input shape and this plugin's configuration.
    fn calculate_result_shape(&mut self) -> Result<Vec<usize>>;

    /// Whether non-leaf output must still be retained in the result store.
    fn keep_results(&self) -> bool {
        false
    }

    /// Expected number of output dimensions, or `None` if this node produces
    /// no stored output at all.
    fn output_data_dim(&self) -> Option<usize>;

    /// Live-processing input-availability check (spec.md §4.6, `carryon`).
    fn input_available(&self, _index: usize) -> bool {
        true
    }

    /// A human-chosen label, independent of `plugin_name`.
    fn label(&self) -> String {
        self.plugin_name().to_string()
    }

    /// Title used for the result dataset (defaults to the label).
    fn result_title(&self) -> String {
        self.label()
    }

    /// Parameters as an ordered list of (key, value) pairs, for
    /// `ProcessingNode::dump`.
    fn dump_params(&self) -> Vec<(String, Value)>;

    /// Restore parameters previously produced by `dump_params`.
    fn load_params(&mut self, params: &[(String, Value)]);
}

pub type PluginConstructor = fn() -> Box<dyn Plugin>;

/// Registry from plugin class name to constructor (spec.md §9). Populated by
/// `register` calls; in the absence of dynamic loading in Rust this replaces
/// the original's directory-scanning dispatch with static registration.
#[derive(Clone)]
pub struct PluginRegistry {
    constructors: HashMap<&'static str, PluginConstructor>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        PluginRegistry {
            constructors: HashMap::new(),
        }
    }

    pub fn register(&mut self, class_name: &'static str, ctor: PluginConstructor) {
        self.constructors.insert(class_name, ctor);
    }

    pub fn construct(&self, class_name: &str) -> Option<Box<dyn Plugin>> {
        self.constructors.get(class_name).map(|ctor| ctor())
    }

    pub fn contains(&self, class_name: &str) -> bool {
        self.constructors.contains_key(class_name)
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Process-global registry, mirroring the teacher's `once_cell::sync::Lazy`
/// static-registry pattern (e.g. `tracks.rs`, `compositor.rs`).
pub static GLOBAL_PLUGIN_REGISTRY: Lazy<Mutex<PluginRegistry>> = Lazy::new(|| {
    let mut registry = PluginRegistry::new();
    builtin::register_all(&mut registry);
    Mutex::new(registry)
});

/// Built-in demonstration plugins used by tests and as a usage example; not
/// part of the out-of-scope "plugin content" (no X-ray/pyFAI math here).
pub mod builtin {
    use super::*;

    /// Produces a synthetic deterministic frame for a task index: a
    /// `rows x cols` image whose values equal the task index (as f32).
    pub struct SyntheticLoaderPlugin {
        node_id: usize,
        config: ConfigStore,
        rows: usize,
        cols: usize,
    }

    impl SyntheticLoaderPlugin {
        pub fn new() -> Self {
            SyntheticLoaderPlugin {
                node_id: 0,
                config: ConfigStore::new(),
                rows: 10,
                cols: 10,
            }
        }

        pub fn with_shape(rows: usize, cols: usize) -> Self {
            SyntheticLoaderPlugin {
                node_id: 0,
                config: ConfigStore::new(),
                rows,
                cols,
            }
        }
    }

    impl Default for SyntheticLoaderPlugin {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Plugin for SyntheticLoaderPlugin {
        fn plugin_name(&self) -> &'static str {
            "SyntheticLoaderPlugin"
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
                    return Err(crate::error::ExecutionError::internal(
                        "SyntheticLoaderPlugin must be the tree root and receive a task index",
                    ))
                }
            };
            let mut ds = Dataset::filled(&[self.rows, self.cols], index as f32);
            ds.data_label = "intensity".to_string();
            ds.data_unit = "counts".to_string();
            Ok((ds, kwargs))
        }

        fn set_input_shape(&mut self, _shape: Option<Vec<usize>>) {}

        fn calculate_result_shape(&mut self) -> Result<Vec<usize>> {
            Ok(vec![self.rows, self.cols])
        }

        fn output_data_dim(&self) -> Option<usize> {
            Some(2)
        }

        fn dump_params(&self) -> Vec<(String, Value)> {
            vec![
                ("rows".to_string(), Value::from(self.rows)),
                ("cols".to_string(), Value::from(self.cols)),
            ]
        }

        fn load_params(&mut self, params: &[(String, Value)]) {
            for (key, value) in params {
                match key.as_str() {
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

    /// Adds a constant to every element of its input frame. Shape-preserving.
    pub struct AddConstantPlugin {
        node_id: usize,
        config: ConfigStore,
        input_shape: Option<Vec<usize>>,
        pub addend: f32,
        pub keep: bool,
    }

    impl AddConstantPlugin {
        pub fn new(addend: f32) -> Self {
            AddConstantPlugin {
                node_id: 0,
                config: ConfigStore::new(),
                input_shape: None,
                addend,
                keep: false,
            }
        }

        pub fn keeping_results(mut self, keep: bool) -> Self {
            self.keep = keep;
            self
        }
    }

    impl Plugin for AddConstantPlugin {
        fn plugin_name(&self) -> &'static str {
            "AddConstantPlugin"
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
            let frame = match input {
                PluginInput::Frame(f) => f,
                PluginInput::Index(_) => {
                    return Err(crate::error::ExecutionError::internal(
                        "AddConstantPlugin requires a frame input, not a task index",
                    ))
                }
            };
            let mut out = frame;
            for v in out.data_mut() {
                *v += self.addend;
            }
            Ok((out, kwargs))
        }

        fn set_input_shape(&mut self, shape: Option<Vec<usize>>) {
            self.input_shape = shape;
        }

        fn calculate_result_shape(&mut self) -> Result<Vec<usize>> {
            self.input_shape.clone().ok_or_else(|| {
                crate::error::ExecutionError::ShapeInconsistency {
                    node_id: self.node_id,
                    message: "AddConstantPlugin has no input shape to propagate".to_string(),
                }
            })
        }

        fn keep_results(&self) -> bool {
            self.keep
        }

        fn output_data_dim(&self) -> Option<usize> {
            Some(2)
        }

        fn dump_params(&self) -> Vec<(String, Value)> {
            vec![
                ("addend".to_string(), Value::from(self.addend as f64)),
                ("keep".to_string(), Value::from(self.keep)),
            ]
        }

        fn load_params(&mut self, params: &[(String, Value)]) {
            for (key, value) in params {
                match key.as_str() {
                    "addend" => {
                        if let Some(v) = value.as_f64() {
                            self.addend = v as f32;
                        }
                    }
                    "keep" => {
                        if let Some(v) = value.as_bool() {
                            self.keep = v;
                        }
                    }
                    _ => {}
                }
            }
        }
    }

    pub fn register_all(registry: &mut PluginRegistry) {
        registry.register("SyntheticLoaderPlugin", || {
            Box::new(SyntheticLoaderPlugin::new())
        });
        registry.register("AddConstantPlugin", || Box::new(AddConstantPlugin::new(0.0)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use builtin::{AddConstantPlugin, SyntheticLoaderPlugin};

    #[test]
    fn loader_produces_shape_filled_with_index() {
        let mut loader = SyntheticLoaderPlugin::with_shape(2, 2);
        let (ds, _) = loader
            .execute(PluginInput::Index(3), KwArgs::new())
            .unwrap();
        assert_eq!(ds.shape(), &[2, 2]);
        assert!(ds.data().iter().all(|&v| v == 3.0));
    }

    #[test]
    fn add_constant_is_shape_preserving() {
        let mut plugin = AddConstantPlugin::new(0.1);
        plugin.set_input_shape(Some(vec![2, 2]));
        let frame = Dataset::filled(&[2, 2], 1.0);
        let (out, _) = plugin
            .execute(PluginInput::Frame(frame), KwArgs::new())
            .unwrap();
        assert!(out.data().iter().all(|&v| (v - 1.1).abs() < 1e-6));
        assert_eq!(plugin.calculate_result_shape().unwrap(), vec![2, 2]);
    }

    #[test]
    fn registry_constructs_by_name() {
        let registry = GLOBAL_PLUGIN_REGISTRY.lock().unwrap();
        assert!(registry.contains("SyntheticLoaderPlugin"));
        let plugin = registry.construct("SyntheticLoaderPlugin").unwrap();
        assert_eq!(plugin.plugin_name(), "SyntheticLoaderPlugin");
        assert!(registry.construct("DoesNotExist").is_none());
    }
}
