use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::config::AnalyzerConfig;
use crate::error::{Error, Result};
use crate::project::CloneId;

/// On-disk layout of one clone's build artifacts:
/// `<project dir>/<output dir>/<clone prefix><N>/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLayout {
    pub project_dir: PathBuf,
    pub output_dir: PathBuf,
    pub clone_dir: PathBuf,
}

impl OutputLayout {
    pub fn new(cfg: &AnalyzerConfig, project_dir: &Path, clone: CloneId) -> Self {
        let output_dir = project_dir.join(&cfg.output_dir_name);
        let clone_dir = output_dir.join(format!("{}{}", cfg.clone_dir_prefix, clone.0));
        Self {
            project_dir: project_dir.to_path_buf(),
            output_dir,
            clone_dir,
        }
    }

    pub fn artifact(&self, file_name: &str) -> PathBuf {
        self.clone_dir.join(file_name)
    }

    /// `<clone dir>/<gpu>_<metadata file name>`
    pub fn metadata_path(&self, gpu: &str, metadata_file_name: &str) -> PathBuf {
        self.clone_dir.join(format!("{gpu}_{metadata_file_name}"))
    }

    pub fn ensure(&self) -> Result<()> {
        ensure_dir(&self.output_dir)?;
        ensure_dir(&self.clone_dir)
    }

    /// Remove every artifact of this clone. Refuses to touch anything outside the project dir.
    pub fn purge(&self) -> Result<()> {
        debug!(dir = %self.clone_dir.display(), "purging clone output");
        safe_remove_dir_all(&self.project_dir, &self.clone_dir)
    }

    pub fn list_artifacts(&self) -> Vec<PathBuf> {
        if !self.clone_dir.is_dir() {
            return Vec::new();
        }
        let mut out: Vec<PathBuf> = WalkDir::new(&self.clone_dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .collect();
        out.sort();
        out
    }
}

pub fn ensure_dir(dir: &Path) -> Result<()> {
    if dir.is_dir() {
        return Ok(());
    }
    fs::create_dir_all(dir)
        .map_err(|e| Error::msg(format!("failed to create dir {}: {e}", dir.display())))
}

/// Delete a single artifact file. Missing files are not an error.
pub fn remove_artifact(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(path = %path.display(), "artifact already gone");
            Ok(())
        }
        Err(e) => Err(Error::msg(format!(
            "failed to remove artifact {}: {e}",
            path.display()
        ))),
    }
}

pub fn safe_remove_dir_all(root: &Path, dir: &Path) -> Result<()> {
    if !dir.exists() {
        return Ok(());
    }
    let root_can = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
    let dir_can = dir.canonicalize().unwrap_or_else(|_| dir.to_path_buf());
    if !dir_can.starts_with(&root_can) || dir_can == root_can {
        return Err(Error::msg(format!(
            "refusing to remove '{}' (outside project dir '{}')",
            dir_can.display(),
            root_can.display()
        )));
    }
    fs::remove_dir_all(&dir_can)
        .map_err(|e| Error::msg(format!("failed to remove dir {}: {e}", dir_can.display())))?;
    Ok(())
}
