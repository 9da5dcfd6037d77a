//! `ProcessingNode` (spec.md §3, §4.1).
//!
//! The tree is represented as an arena of `NodeRecord`s indexed by integer
//! `node_id`, with `parent_id`/`children_ids` as the links (spec.md §9,
//! "Tree as arena + indices") rather than parent/child back-pointers — this
//! is what lets `ProcessingTree` be deep-copied and serialized trivially.

use serde_json::Value;

use crate::dataset::Dataset;
use crate::error::{ExecutionError, Result};
use crate::plugin::{KwArgs, Plugin, PluginInput};

/// A serializable record of one node, independent of the live plugin object
/// (spec.md §4.1, `dump()`).
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct NodeDump {
    pub node_id: usize,
    pub parent_id: Option<usize>,
    pub children_ids: Vec<usize>,
    pub plugin_class_name: String,
    pub plugin_params: Vec<(String, Value)>,
}

pub struct NodeRecord {
    pub node_id: usize,
    pub parent_id: Option<usize>,
    pub children_ids: Vec<usize>,
    pub plugin: Box<dyn Plugin>,
    pub last_result: Option<Dataset>,
    pub last_result_shape: Option<Vec<usize>>,
}

impl NodeRecord {
    pub fn new(node_id: usize, mut plugin: Box<dyn Plugin>) -> Self {
        plugin.set_node_id(node_id);
        NodeRecord {
            node_id,
            parent_id: None,
            children_ids: Vec::new(),
            plugin,
            last_result: None,
            last_result_shape: None,
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.children_ids.is_empty()
    }

    pub fn dump(&self) -> NodeDump {
        NodeDump {
            node_id: self.node_id,
            parent_id: self.parent_id,
            children_ids: self.children_ids.clone(),
            plugin_class_name: self.plugin.plugin_name().to_string(),
            plugin_params: self.plugin.dump_params(),
        }
    }

    /// Calls `plugin.execute`, storing `last_result` only if this node is a
    /// leaf or `plugin.keep_results()` is true.
    pub fn execute(&mut self, input: PluginInput, kwargs: KwArgs) -> Result<(Dataset, KwArgs)> {
        let (output, kwargs) = self.plugin.execute(input, kwargs)?;
        if self.is_leaf() || self.plugin.keep_results() {
            self.last_result = Some(output.clone());
        }
        Ok((output, kwargs))
    }

    pub fn prepare(&mut self) -> Result<()> {
        self.plugin.pre_execute()
    }

    /// `plugin.calculate_result_shape()`, checked against `output_data_dim`
    /// if the plugin declares one (spec.md §7, `ShapeInconsistency`).
    pub fn propagate_shape(&mut self, input_shape: Option<Vec<usize>>) -> Result<Vec<usize>> {
        self.plugin.set_input_shape(input_shape);
        let shape = self.plugin.calculate_result_shape()?;
        if let Some(expected_ndim) = self.plugin.output_data_dim() {
            if shape.len() != expected_ndim {
                return Err(ExecutionError::ShapeInconsistency {
                    node_id: self.node_id,
                    message: format!(
                        "plugin declared output_data_dim={expected_ndim} but produced a shape of rank {}",
                        shape.len()
                    ),
                });
            }
        }
        if shape.iter().any(|&d| d == 0) {
            return Err(ExecutionError::ShapeInconsistency {
                node_id: self.node_id,
                message: format!("unresolved result shape {shape:?}"),
            });
        }
        self.last_result_shape = Some(shape.clone());
        Ok(shape)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::builtin::{AddConstantPlugin, SyntheticLoaderPlugin};

    #[test]
    fn leaf_always_stores_last_result() {
        let mut node = NodeRecord::new(0, Box::new(SyntheticLoaderPlugin::with_shape(2, 2)));
        let (out, _) = node
            .execute(PluginInput::Index(5), KwArgs::new())
            .unwrap();
        assert_eq!(node.last_result.as_ref().unwrap().shape(), out.shape());
    }

    #[test]
    fn non_leaf_without_keep_results_drops_last_result() {
        let mut node = NodeRecord::new(1, Box::new(AddConstantPlugin::new(1.0)));
        node.children_ids.push(2);
        node.plugin.set_input_shape(Some(vec![2, 2]));
        let frame = Dataset::filled(&[2, 2], 0.0);
        node.execute(PluginInput::Frame(frame), KwArgs::new()).unwrap();
        assert!(node.last_result.is_none());
    }

    #[test]
    fn keep_results_non_leaf_stores_last_result() {
        let mut node = NodeRecord::new(
            1,
            Box::new(AddConstantPlugin::new(1.0).keeping_results(true)),
        );
        node.children_ids.push(2);
        node.plugin.set_input_shape(Some(vec![2, 2]));
        let frame = Dataset::filled(&[2, 2], 0.0);
        node.execute(PluginInput::Frame(frame), KwArgs::new()).unwrap();
        assert!(node.last_result.is_some());
    }

    #[test]
    fn propagate_shape_rejects_dim_mismatch() {
        struct BadPlugin;
        impl Plugin for BadPlugin {
            fn plugin_name(&self) -> &'static str {
                "BadPlugin"
            }
            fn node_id(&self) -> usize {
                0
            }
            fn set_node_id(&mut self, _id: usize) {}
            fn config(&self) -> &crate::config::ConfigStore {
                unimplemented!()
            }
            fn config_mut(&mut self) -> &mut crate::config::ConfigStore {
                unimplemented!()
            }
            fn execute(&mut self, _i: PluginInput, _k: KwArgs) -> Result<(Dataset, KwArgs)> {
                unimplemented!()
            }
            fn set_input_shape(&mut self, _shape: Option<Vec<usize>>) {}
            fn calculate_result_shape(&mut self) -> Result<Vec<usize>> {
                Ok(vec![4, 4])
            }
            fn output_data_dim(&self) -> Option<usize> {
                Some(1)
            }
            fn dump_params(&self) -> Vec<(String, Value)> {
                Vec::new()
            }
            fn load_params(&mut self, _p: &[(String, Value)]) {}
        }

        let mut node = NodeRecord::new(0, Box::new(BadPlugin));
        let err = node.propagate_shape(None).unwrap_err();
        assert!(matches!(err, ExecutionError::ShapeInconsistency { .. }));
    }
}
