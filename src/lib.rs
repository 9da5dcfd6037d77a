//! `scanflow` — a DAG execution core for running data-processing plugins
//! over a structured sweep of scan points across a parallel worker pool,
//! coordinated through a shared-memory ring buffer.
//!
//! See each module for its piece of the pipeline: [`tree`] (the plugin
//! graph), [`execution_app`] (the orchestrator), [`shared_buffer`] (the
//! worker/orchestrator handoff), [`result_store`]/[`result_writer`]
//! (aggregation and persistence), and [`runner`] (the CLI-facing event
//! loop).

pub mod config;
pub mod dataset;
pub mod error;
pub mod execution_app;
pub mod plugin;
pub mod result_store;
pub mod result_writer;
pub mod runner;
pub mod scan;
pub mod shared_buffer;
pub mod tree;

pub use config::ConfigStore;
pub use dataset::Dataset;
pub use error::{ExecutionError, Result};
pub use execution_app::{ExecutionApp, RunConfig, RunReport};
pub use plugin::{Plugin, PluginRegistry, GLOBAL_PLUGIN_REGISTRY};
pub use result_store::ResultStore;
pub use runner::{Runner, RunnerArgs};
pub use scan::Scan;
pub use shared_buffer::SharedBuffer;
pub use tree::ProcessingTree;
