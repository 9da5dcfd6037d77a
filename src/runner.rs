//! `Runner` — the thin event loop that drives one `ExecutionApp` run from
//! the command line (spec.md §4.7, §6).
//!
//! Flag parsing is hand-rolled rather than via a CLI-args crate, matching
//! the rest of this crate's dependency stack (no `clap` in `Cargo.toml`);
//! the `scanflow-runner` binary is a thin `main()` over this module's
//! `Runner::run`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::info;

use crate::config::ConfigStore;
use crate::error::{ExecutionError, Result};
use crate::execution_app::{ExecutionApp, RunConfig, RunReport};
use crate::plugin::PluginRegistry;
use crate::scan::Scan;
use crate::tree::ProcessingTree;

/// Parsed CLI arguments (spec.md §6).
#[derive(Clone, Debug, Default)]
pub struct RunnerArgs {
    pub verbose: bool,
    pub overwrite: bool,
    pub workflow_path: Option<PathBuf>,
    pub scan_path: Option<PathBuf>,
    pub diffraction_exp_path: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
}

impl RunnerArgs {
    /// Parses `--verbose`/`--overwrite` and the four `-flag value` options.
    /// Unrecognized flags are rejected with `UserConfigError`.
    pub fn parse<I, S>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut parsed = RunnerArgs::default();
        let mut iter = args.into_iter();
        while let Some(arg) = iter.next() {
            let arg = arg.as_ref();
            match arg {
                "--verbose" | "-v" => parsed.verbose = true,
                "--overwrite" => parsed.overwrite = true,
                "-workflow" | "-w" => parsed.workflow_path = Some(PathBuf::from(next_value(&mut iter, arg)?)),
                "-scan" | "-s" => parsed.scan_path = Some(PathBuf::from(next_value(&mut iter, arg)?)),
                "-diffraction_exp" | "-d" => {
                    parsed.diffraction_exp_path = Some(PathBuf::from(next_value(&mut iter, arg)?))
                }
                "-output_dir" | "-o" => parsed.output_dir = Some(PathBuf::from(next_value(&mut iter, arg)?)),
                other => {
                    return Err(ExecutionError::user_config(format!("unrecognized argument '{other}'")));
                }
            }
        }
        Ok(parsed)
    }
}

fn next_value<I, S>(iter: &mut I, flag: &str) -> Result<String>
where
    I: Iterator<Item = S>,
    S: AsRef<str>,
{
    iter.next()
        .map(|v| v.as_ref().to_string())
        .ok_or_else(|| ExecutionError::user_config(format!("flag '{flag}' expects a value")))
}

/// Loads the required inputs, validates the output directory, runs the
/// execution app, and writes the final composites (spec.md §4.7).
pub struct Runner {
    args: RunnerArgs,
    registry: Arc<PluginRegistry>,
}

impl Runner {
    pub fn new(args: RunnerArgs, registry: Arc<PluginRegistry>) -> Self {
        Runner { args, registry }
    }

    /// Verifies all four required inputs are present and that the output
    /// directory is absent, empty, or `overwrite` is set (spec.md §4.7).
    fn validate(&self) -> Result<(&Path, &Path, &Path, &Path)> {
        let workflow = self
            .args
            .workflow_path
            .as_deref()
            .ok_or_else(|| ExecutionError::user_config("missing required -workflow/-w PATH"))?;
        let scan = self
            .args
            .scan_path
            .as_deref()
            .ok_or_else(|| ExecutionError::user_config("missing required -scan/-s PATH"))?;
        let experiment = self
            .args
            .diffraction_exp_path
            .as_deref()
            .ok_or_else(|| ExecutionError::user_config("missing required -diffraction_exp/-d PATH"))?;
        let output_dir = self
            .args
            .output_dir
            .as_deref()
            .ok_or_else(|| ExecutionError::user_config("missing required -output_dir/-o PATH"))?;

        if !experiment.exists() {
            return Err(ExecutionError::user_config(format!(
                "diffraction experiment file not found: {}",
                experiment.display()
            )));
        }

        if output_dir.exists() {
            let has_entries = std::fs::read_dir(output_dir)
                .map_err(|e| ExecutionError::storage(output_dir, e.to_string()))?
                .next()
                .is_some();
            if has_entries && !self.args.overwrite {
                return Err(ExecutionError::user_config(format!(
                    "output directory {} is not empty; pass --overwrite to write into it anyway",
                    output_dir.display()
                )));
            }
        }

        Ok((workflow, scan, experiment, output_dir))
    }

    /// Runs one execution, printing a progress bar if `--verbose` is set,
    /// and writes the final composites to `output_dir` on success.
    pub fn run(&self, config: &ConfigStore) -> Result<RunReport> {
        let (workflow_path, scan_path, _experiment_path, output_dir) = self.validate()?;

        let tree = ProcessingTree::import_from_file(workflow_path, &self.registry)?;
        let scan = load_scan(scan_path)?;

        let run_config = RunConfig::from_config_store(config)?.with_overwrite(self.args.overwrite);
        let mut app = ExecutionApp::new(tree, scan, run_config, Arc::clone(&self.registry));
        app.prepare()?;

        let verbose = self.args.verbose;
        let report = app.run_with_progress(|fraction| {
            if verbose {
                print_progress_bar(fraction);
            }
        })?;
        if verbose {
            println!();
        }

        std::fs::create_dir_all(output_dir).map_err(|e| ExecutionError::storage(output_dir, e.to_string()))?;
        app.result_store()
            .save_to_disk(output_dir, &["hdf5"], self.args.overwrite, None)?;
        info!(
            "run finished: {} frame(s) stored, {} frame(s) failed; composites written to {}",
            report.completed,
            report.failed,
            output_dir.display()
        );
        Ok(report)
    }
}

fn load_scan(path: &Path) -> Result<Scan> {
    let contents = std::fs::read_to_string(path).map_err(|e| ExecutionError::storage(path, e.to_string()))?;
    Ok(serde_yaml::from_str(&contents)?)
}

/// Renders a 60-char progress bar (spec.md §4.7).
fn print_progress_bar(fraction: f64) {
    const WIDTH: usize = 60;
    let fraction = fraction.clamp(0.0, 1.0);
    let filled = (fraction * WIDTH as f64).round() as usize;
    print!(
        "\r[{}{}] {:>5.1}%",
        "=".repeat(filled),
        " ".repeat(WIDTH - filled),
        fraction * 100.0
    );
    let _ = std::io::Write::flush(&mut std::io::stdout());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_long_and_short_flags() {
        let args = RunnerArgs::parse([
            "--verbose",
            "--overwrite",
            "-w",
            "workflow.yaml",
            "-s",
            "scan.yaml",
            "-d",
            "exp.yaml",
            "-o",
            "out/",
        ])
        .unwrap();
        assert!(args.verbose);
        assert!(args.overwrite);
        assert_eq!(args.workflow_path, Some(PathBuf::from("workflow.yaml")));
        assert_eq!(args.output_dir, Some(PathBuf::from("out/")));
    }

    #[test]
    fn unrecognized_flag_is_rejected() {
        let err = RunnerArgs::parse(["--bogus"]).unwrap_err();
        assert!(matches!(err, ExecutionError::UserConfig(_)));
    }

    #[test]
    fn flag_missing_value_is_rejected() {
        let err = RunnerArgs::parse(["-workflow"]).unwrap_err();
        assert!(matches!(err, ExecutionError::UserConfig(_)));
    }

    #[test]
    fn validate_rejects_missing_required_paths() {
        let runner = Runner::new(RunnerArgs::default(), Arc::new(PluginRegistry::new()));
        let err = runner.validate().unwrap_err();
        assert!(matches!(err, ExecutionError::UserConfig(_)));
    }

    #[test]
    fn validate_rejects_nonempty_output_dir_without_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("existing.txt"), "x").unwrap();

        let args = RunnerArgs {
            verbose: false,
            overwrite: false,
            workflow_path: Some(PathBuf::from("workflow.yaml")),
            scan_path: Some(PathBuf::from("scan.yaml")),
            diffraction_exp_path: Some(dir.path().join("existing.txt")),
            output_dir: Some(dir.path().to_path_buf()),
        };
        let runner = Runner::new(args, Arc::new(PluginRegistry::new()));
        let err = runner.validate().unwrap_err();
        assert!(matches!(err, ExecutionError::UserConfig(_)));
    }
}
