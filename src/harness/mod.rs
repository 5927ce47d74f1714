use std::collections::HashSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::info;

use crate::util::{ensure_directory, file_slug, utc_compact_string};

pub mod dataset;
pub mod report;
pub mod runner;
pub mod session;
#[cfg(test)]
mod tests;

/// Output folder of one invocation: `<output_dir>/<run_id>/`. Each call
/// reserves a directory that did not exist before.
#[derive(Debug, Clone)]
pub struct RunLayout {
    pub run_id: String,
    pub run_dir: PathBuf,
}

impl RunLayout {
    pub fn create(output_dir: &Path) -> Result<Self> {
        ensure_directory(output_dir)?;
        let base = format!("run-{}", utc_compact_string(Utc::now()));

        let mut attempt = 1_usize;
        loop {
            let run_id = if attempt == 1 {
                base.clone()
            } else {
                format!("{base}-{attempt}")
            };
            let run_dir = output_dir.join(&run_id);
            match fs::create_dir(&run_dir) {
                Ok(()) => {
                    info!(run_id = %run_id, run_dir = %run_dir.display(), "prepared run directory");
                    return Ok(Self { run_id, run_dir });
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => attempt += 1,
                Err(err) => {
                    return Err(err).with_context(|| {
                        format!("failed to create run directory: {}", run_dir.display())
                    });
                }
            }
        }
    }

    pub fn log_path(&self, label: &str) -> PathBuf {
        self.run_dir.join(format!("{}.jsonl", file_slug(label)))
    }
}

/// Suffixes repeated labels (`name`, `name#2`, ...) so logs and report keys
/// stay distinct.
pub fn unique_labels(labels: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::<String>::new();
    labels
        .into_iter()
        .map(|label| {
            let mut candidate = label.clone();
            let mut counter = 2_usize;
            while !seen.insert(file_slug(&candidate)) {
                candidate = format!("{label}#{counter}");
                counter += 1;
            }
            candidate
        })
        .collect()
}
