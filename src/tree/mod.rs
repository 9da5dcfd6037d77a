//! `ProcessingTree` — the arena-of-ids DAG of `ProcessingNode`s (spec.md §3,
//! §4.1–§4.2).
//!
//! Execution is depth-first from the root, exactly mirroring the original's
//! recursive node walk; `petgraph` is used only for the one place the tree
//! genuinely needs a general-graph algorithm: proving a proposed reparent
//! does not introduce a cycle, the same toposort-or-reject technique the
//! teacher's `node_graph::executor` uses to validate its dependency graph
//! before running it.

pub mod node;

use std::collections::HashMap;

use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use serde::{Deserialize, Serialize};

use crate::dataset::Dataset;
use crate::error::{ExecutionError, Result};
use crate::plugin::{KwArgs, Plugin, PluginInput, PluginRegistry};

pub use node::{NodeDump, NodeRecord};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TreeState {
    Edited,
    Prepared,
    Running,
    Finished,
}

/// A full tree export: enough to reconstruct plugins via a `PluginRegistry`
/// (spec.md §4.2, `export_to_string`/`restore_from_string`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TreeDump {
    pub root_id: Option<usize>,
    pub next_id: usize,
    pub nodes: Vec<NodeDump>,
}

pub struct ProcessingTree {
    nodes: HashMap<usize, NodeRecord>,
    node_ids: Vec<usize>,
    root_id: Option<usize>,
    active_node_id: Option<usize>,
    next_id: usize,
    state: TreeState,
    hash_seed: u64,
}

impl Default for ProcessingTree {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessingTree {
    pub fn new() -> Self {
        ProcessingTree {
            nodes: HashMap::new(),
            node_ids: Vec::new(),
            root_id: None,
            active_node_id: None,
            next_id: 0,
            state: TreeState::Edited,
            hash_seed: rand::random(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn root_id(&self) -> Option<usize> {
        self.root_id
    }

    /// The node most recently registered, used as the default parent for a
    /// registration that omits `parent_id` (spec.md §3, §4.2).
    pub fn active_node_id(&self) -> Option<usize> {
        self.active_node_id
    }

    pub fn state(&self) -> TreeState {
        self.state
    }

    pub fn node_ids(&self) -> &[usize] {
        &self.node_ids
    }

    pub fn get_node(&self, node_id: usize) -> Option<&NodeRecord> {
        self.nodes.get(&node_id)
    }

    /// Register a plugin as a new node. `parent_id = None` attaches to the
    /// last active node (or becomes the root, for the first node in an empty
    /// tree). `node_id = None` auto-assigns the next id; an explicit id is
    /// rejected if it is already in use or smaller than any id used so far.
    /// Node ids are monotonically increasing and never reused, even across
    /// deletions (spec.md §9, grounded in `generic_tree.py`'s
    /// `get_new_nodeid`/`_check_node_ids`).
    pub fn register_node(
        &mut self,
        plugin: Box<dyn Plugin>,
        parent_id: Option<usize>,
        node_id: Option<usize>,
    ) -> Result<usize> {
        let effective_parent = match parent_id {
            Some(pid) => {
                if !self.nodes.contains_key(&pid) {
                    return Err(ExecutionError::user_config(format!(
                        "cannot register node under unknown parent id {pid}"
                    )));
                }
                Some(pid)
            }
            None => self.active_node_id.or(self.root_id),
        };

        let new_id = match node_id {
            Some(id) => {
                if self.nodes.contains_key(&id) {
                    return Err(ExecutionError::user_config(format!(
                        "node id {id} is already in use"
                    )));
                }
                if id < self.next_id {
                    return Err(ExecutionError::user_config(format!(
                        "node id {id} is smaller than a previously used id {}",
                        self.next_id - 1
                    )));
                }
                id
            }
            None => self.next_id,
        };
        self.next_id = new_id + 1;

        let mut record = NodeRecord::new(new_id, plugin);
        record.parent_id = effective_parent;
        self.nodes.insert(new_id, record);
        self.node_ids.push(new_id);

        if let Some(pid) = effective_parent {
            self.nodes.get_mut(&pid).unwrap().children_ids.push(new_id);
        } else {
            self.root_id = Some(new_id);
        }

        self.active_node_id = Some(new_id);
        self.state = TreeState::Edited;
        Ok(new_id)
    }

    /// All ids in `node_id`'s subtree, including `node_id` itself, in
    /// depth-first pre-order.
    pub fn get_recursive_ids(&self, node_id: usize) -> Vec<usize> {
        let mut out = Vec::new();
        self.collect_recursive_ids(node_id, &mut out);
        out
    }

    fn collect_recursive_ids(&self, node_id: usize, out: &mut Vec<usize>) {
        out.push(node_id);
        if let Some(record) = self.nodes.get(&node_id) {
            for &child in &record.children_ids {
                self.collect_recursive_ids(child, out);
            }
        }
    }

    /// Depth-first pre-order over the whole tree, starting at the root.
    /// Used internally by `prepare`, `dump`, and `hash`; does not renumber
    /// anything (that's `order_ids`, spec.md §4.2).
    pub fn depth_first_ids(&self) -> Vec<usize> {
        match self.root_id {
            Some(root) => self.get_recursive_ids(root),
            None => Vec::new(),
        }
    }

    /// Delete a node. `recursive` deletes the whole subtree. Without it,
    /// `keep_children` reattaches the node's children to its parent
    /// (rejected if the node is the root and has more than one child, since
    /// a tree has exactly one root); without either flag, deletion fails if
    /// the node has children (spec.md §4.2).
    pub fn delete_node(&mut self, node_id: usize, recursive: bool, keep_children: bool) -> Result<()> {
        let record = self
            .nodes
            .get(&node_id)
            .ok_or_else(|| ExecutionError::user_config(format!("cannot delete unknown node id {node_id}")))?;
        let parent_id = record.parent_id;
        let children = record.children_ids.clone();

        if recursive {
            let victims = self.get_recursive_ids(node_id);
            for id in &victims {
                self.nodes.remove(id);
                self.node_ids.retain(|&existing| existing != *id);
                if self.active_node_id == Some(*id) {
                    self.active_node_id = parent_id;
                }
            }
            if let Some(pid) = parent_id {
                if let Some(parent) = self.nodes.get_mut(&pid) {
                    parent.children_ids.retain(|&c| c != node_id);
                }
            }
            if self.root_id == Some(node_id) {
                self.root_id = None;
            }
        } else if keep_children {
            if parent_id.is_none() && children.len() > 1 {
                return Err(ExecutionError::user_config(format!(
                    "cannot delete root node {node_id} and keep its children: a tree may have only one root"
                )));
            }
            for &child in &children {
                self.nodes.get_mut(&child).unwrap().parent_id = parent_id;
            }
            if let Some(pid) = parent_id {
                let parent = self.nodes.get_mut(&pid).unwrap();
                let pos = parent.children_ids.iter().position(|&c| c == node_id).unwrap();
                parent.children_ids.splice(pos..=pos, children.iter().copied());
            } else {
                self.root_id = children.first().copied();
            }
            self.nodes.remove(&node_id);
            self.node_ids.retain(|&existing| existing != node_id);
            if self.active_node_id == Some(node_id) {
                self.active_node_id = parent_id;
            }
        } else {
            if !children.is_empty() {
                return Err(ExecutionError::user_config(format!(
                    "node {node_id} has children; pass recursive or keep_children to delete it"
                )));
            }
            if let Some(pid) = parent_id {
                self.nodes.get_mut(&pid).unwrap().children_ids.retain(|&c| c != node_id);
            }
            if self.root_id == Some(node_id) {
                self.root_id = None;
            }
            self.nodes.remove(&node_id);
            self.node_ids.retain(|&existing| existing != node_id);
            if self.active_node_id == Some(node_id) {
                self.active_node_id = parent_id;
            }
        }

        self.state = TreeState::Edited;
        Ok(())
    }

    /// Convenience wrapper over `delete_node` for the common recursive case.
    pub fn delete_node_by_id(&mut self, node_id: usize) -> Result<()> {
        self.delete_node(node_id, true, false)
    }

    /// Renumber every node depth-first from 0, so that `parent_id < child_id`
    /// everywhere; plugin ids are updated in lock-step (spec.md §4.2). A
    /// no-op (modulo reassigning `next_id`) if the tree is already ordered.
    pub fn order_ids(&mut self) -> Result<()> {
        let order = self.depth_first_ids();
        let remap: HashMap<usize, usize> = order.iter().enumerate().map(|(new, &old)| (old, new)).collect();

        let mut renumbered = HashMap::with_capacity(self.nodes.len());
        for (&old_id, mut record) in std::mem::take(&mut self.nodes) {
            let new_id = remap[&old_id];
            record.node_id = new_id;
            record.parent_id = record.parent_id.map(|p| remap[&p]);
            record.children_ids = record.children_ids.iter().map(|c| remap[c]).collect();
            record.plugin.set_node_id(new_id);
            renumbered.insert(new_id, record);
        }
        self.nodes = renumbered;
        self.node_ids = (0..order.len()).collect();
        self.root_id = self.root_id.map(|r| remap[&r]);
        self.active_node_id = self.active_node_id.map(|a| remap[&a]);
        self.next_id = order.len();
        Ok(())
    }

    /// Reassign `node_id`'s parent, rejecting a move that would make
    /// `node_id` an ancestor of `new_parent_id` (a cycle). Validated with
    /// `petgraph::algo::toposort` over a graph built from the proposed new
    /// edge set, the same check the teacher's executor performs on its
    /// dependency graph before running it.
    pub fn change_node_parent(&mut self, node_id: usize, new_parent_id: usize) -> Result<()> {
        if !self.nodes.contains_key(&node_id) {
            return Err(ExecutionError::user_config(format!(
                "cannot reparent unknown node id {node_id}"
            )));
        }
        if !self.nodes.contains_key(&new_parent_id) {
            return Err(ExecutionError::user_config(format!(
                "cannot reparent onto unknown parent id {new_parent_id}"
            )));
        }

        let mut graph = DiGraph::<usize, ()>::new();
        let mut indices = HashMap::new();
        for &id in &self.node_ids {
            indices.insert(id, graph.add_node(id));
        }
        for (&id, record) in &self.nodes {
            if id == node_id {
                continue;
            }
            let effective_parent = if id == node_id { None } else { record.parent_id };
            if let Some(parent) = effective_parent {
                graph.add_edge(indices[&parent], indices[&id], ());
            }
        }
        graph.add_edge(indices[&new_parent_id], indices[&node_id], ());

        if toposort(&graph, None).is_err() {
            return Err(ExecutionError::user_config(format!(
                "reparenting node {node_id} under {new_parent_id} would create a cycle"
            )));
        }

        let old_parent_id = self.nodes.get(&node_id).unwrap().parent_id;
        if let Some(old_pid) = old_parent_id {
            self.nodes
                .get_mut(&old_pid)
                .unwrap()
                .children_ids
                .retain(|&c| c != node_id);
        }
        self.nodes.get_mut(&new_parent_id).unwrap().children_ids.push(node_id);
        self.nodes.get_mut(&node_id).unwrap().parent_id = Some(new_parent_id);
        self.state = TreeState::Edited;
        Ok(())
    }

    /// One-time per-run setup: `pre_execute` on every node, then propagate
    /// shapes root-to-leaves (spec.md §4.1, `prepare_run`/`propagate_shapes`).
    pub fn prepare(&mut self) -> Result<()> {
        for &id in &self.depth_first_ids() {
            self.nodes.get_mut(&id).unwrap().prepare()?;
        }
        self.propagate_shapes()?;
        self.state = TreeState::Prepared;
        Ok(())
    }

    fn propagate_shapes(&mut self) -> Result<()> {
        if let Some(root) = self.root_id {
            self.propagate_shapes_from(root, None)?;
        }
        Ok(())
    }

    fn propagate_shapes_from(&mut self, node_id: usize, input_shape: Option<Vec<usize>>) -> Result<()> {
        let (shape, children) = {
            let record = self.nodes.get_mut(&node_id).unwrap();
            let shape = record.propagate_shape(input_shape)?;
            (shape, record.children_ids.clone())
        };
        for child in children {
            self.propagate_shapes_from(child, Some(shape.clone()))?;
        }
        Ok(())
    }

    /// Result shapes for every node whose output is retained (leaves, and
    /// any node with `keep_results() == true`), keyed by node id.
    pub fn result_shapes(&self) -> HashMap<usize, Vec<usize>> {
        self.nodes
            .iter()
            .filter(|(_, record)| record.is_leaf() || record.plugin.keep_results())
            .filter_map(|(&id, record)| record.last_result_shape.clone().map(|s| (id, s)))
            .collect()
    }

    /// Execute one task (scan position index) through the whole tree,
    /// preparing the tree first if it has been edited since the last
    /// `prepare`. Returns every retained node's output (spec.md §4.1,
    /// `execute`/`execute_and_collect`).
    pub fn execute_and_collect(&mut self, index: usize) -> Result<HashMap<usize, Dataset>> {
        if self.state == TreeState::Edited {
            self.prepare()?;
        }
        let root = self
            .root_id
            .ok_or_else(|| ExecutionError::user_config("tree has no root node to execute"))?;

        self.state = TreeState::Running;
        let result = self.execute_chain(root, PluginInput::Index(index), KwArgs::new());
        self.state = match &result {
            Ok(_) => TreeState::Finished,
            Err(_) => TreeState::Prepared,
        };
        result
    }

    fn execute_chain(
        &mut self,
        node_id: usize,
        input: PluginInput,
        kwargs: KwArgs,
    ) -> Result<HashMap<usize, Dataset>> {
        let (output, kwargs, children, keep) = {
            let record = self.nodes.get_mut(&node_id).unwrap();
            let (output, kwargs) = record.execute(input, kwargs)?;
            (
                output,
                kwargs,
                record.children_ids.clone(),
                record.is_leaf() || record.plugin.keep_results(),
            )
        };

        let mut results = HashMap::new();
        if keep {
            results.insert(node_id, output.clone());
        }
        for child in children {
            let child_results =
                self.execute_chain(child, PluginInput::Frame(output.clone()), kwargs.clone())?;
            results.extend(child_results);
        }
        Ok(results)
    }

    pub fn dump(&self) -> TreeDump {
        TreeDump {
            root_id: self.root_id,
            next_id: self.next_id,
            nodes: self.node_ids.iter().map(|id| self.nodes[id].dump()).collect(),
        }
    }

    pub fn export_to_string(&self) -> Result<String> {
        Ok(serde_yaml::to_string(&self.dump())?)
    }

    pub fn restore_from_string(yaml: &str, registry: &PluginRegistry) -> Result<Self> {
        let dump: TreeDump = serde_yaml::from_str(yaml)?;
        let mut tree = ProcessingTree::new();
        tree.root_id = dump.root_id;
        tree.next_id = dump.next_id;
        for node_dump in &dump.nodes {
            let mut plugin = registry.construct(&node_dump.plugin_class_name).ok_or_else(|| {
                ExecutionError::user_config(format!(
                    "unknown plugin class '{}'",
                    node_dump.plugin_class_name
                ))
            })?;
            plugin.load_params(&node_dump.plugin_params);
            plugin.set_node_id(node_dump.node_id);
            let mut record = NodeRecord::new(node_dump.node_id, plugin);
            record.parent_id = node_dump.parent_id;
            record.children_ids = node_dump.children_ids.clone();
            tree.nodes.insert(node_dump.node_id, record);
            tree.node_ids.push(node_dump.node_id);
        }
        tree.state = TreeState::Edited;
        Ok(tree)
    }

    pub fn export_to_file(&self, path: &std::path::Path) -> Result<()> {
        std::fs::write(path, self.export_to_string()?)?;
        Ok(())
    }

    pub fn import_from_file(path: &std::path::Path, registry: &PluginRegistry) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::restore_from_string(&contents, registry)
    }

    /// A value that changes whenever the tree's structure or parameters
    /// change, combining a per-tree random seed with a hash of its node
    /// dumps (spec.md §9, grounded in `GenericTree.__hash__`).
    pub fn hash(&self) -> u64 {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        self.hash_seed.hash(&mut hasher);
        for id in &self.node_ids {
            let record = &self.nodes[id];
            record.node_id.hash(&mut hasher);
            record.parent_id.hash(&mut hasher);
            record.children_ids.hash(&mut hasher);
            record.plugin.plugin_name().hash(&mut hasher);
        }
        hasher.finish()
    }
}
