//! CLI entry point for `scanflow-runner` (spec.md §4.7, §6).

use std::sync::Arc;

use anyhow::Context;

use scanflow::config::ConfigStore;
use scanflow::plugin::GLOBAL_PLUGIN_REGISTRY;
use scanflow::runner::{Runner, RunnerArgs};

fn main() {
    if let Err(err) = run() {
        eprintln!("scanflow-runner: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    let args = RunnerArgs::parse(std::env::args().skip(1)).context("parsing command-line arguments")?;

    let mut builder = env_logger::Builder::from_default_env();
    if args.verbose && std::env::var("RUST_LOG").is_err() {
        builder.filter_level(log::LevelFilter::Info);
    }
    builder.init();

    let registry = Arc::new(GLOBAL_PLUGIN_REGISTRY.lock().unwrap().clone());
    let runner = Runner::new(args, registry);
    let config = ConfigStore::new();
    let report = runner.run(&config).context("running workflow")?;
    println!(
        "done: {} frame(s) stored, {} frame(s) failed",
        report.completed, report.failed
    );
    Ok(())
}
