//! Output formatting for execution records.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use tether_core::{ExecutionRecord, ExecutionStatus, Output};

use crate::colors;

/// Print the outputs of a finished execution.
///
/// Artifacts are scratch files that disappear with the session. With
/// `keep_dir` they are copied there first and the copies are printed.
pub fn print_record(record: &ExecutionRecord, keep_dir: Option<&Path>) -> anyhow::Result<()> {
    let count = record
        .execution_count
        .map(|n| n.to_string())
        .unwrap_or_else(|| " ".to_string());

    for output in &record.outputs {
        match output {
            Output::Stream { name, text } if name == "stderr" => eprint!("{}", text),
            Output::Stream { text, .. } => print!("{}", text),
            Output::Text(text) => {
                println!("{}Out[{}]:{} {}", colors::GREEN, count, colors::RESET, text)
            }
            Output::Error { ename, evalue } => {
                eprintln!("{}{}{}: {}", colors::RED, ename, colors::RESET, evalue)
            }
            Output::Artifact { mime, path } => match keep_dir {
                Some(dir) => println!(
                    "{}[{}]{} {}",
                    colors::CYAN,
                    mime,
                    colors::RESET,
                    keep_artifact(path, dir)?.display()
                ),
                None => println!(
                    "{}[{}]{} {} {}(temporary, pass --keep-artifacts DIR to keep){}",
                    colors::CYAN,
                    mime,
                    colors::RESET,
                    path.display(),
                    colors::DIM,
                    colors::RESET
                ),
            },
        }
    }

    if record.status == ExecutionStatus::Error && record.outputs.is_empty() {
        eprintln!("{}Execution failed{}", colors::RED, colors::RESET);
    }
    Ok(())
}

/// Copy a scratch artifact into `dir`, keeping its file name.
fn keep_artifact(path: &Path, dir: &Path) -> anyhow::Result<PathBuf> {
    fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create artifact directory {}", dir.display()))?;
    let name = path
        .file_name()
        .with_context(|| format!("Artifact path has no file name: {}", path.display()))?;
    let target = dir.join(name);
    fs::copy(path, &target)
        .with_context(|| format!("Failed to keep artifact {}", path.display()))?;
    Ok(target)
}
