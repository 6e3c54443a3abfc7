use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::error::Result;
use crate::project::PipelineKind;
use crate::session_metadata;
use crate::workspace::{OutputLayout, remove_artifact};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ArtifactKind {
    IsaText,
    IsaCsv,
    ResourceUsage,
    LiveRegisters,
}

impl ArtifactKind {
    pub fn label(self) -> &'static str {
        match self {
            ArtifactKind::IsaText => "isa",
            ArtifactKind::IsaCsv => "isa-csv",
            ArtifactKind::ResourceUsage => "resource-usage",
            ArtifactKind::LiveRegisters => "livereg",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputArtifact {
    pub kind: ArtifactKind,
    pub path: PathBuf,
    pub gpu: String,
}

/// Outputs of one kernel or shader stage of an input file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryOutput {
    pub input_file: PathBuf,
    pub entry_name: String,
    /// Kernel type for programs, stage name for pipelines.
    pub entry_type: String,
    pub long_name: Option<String>,
    pub artifacts: Vec<OutputArtifact>,
}

impl EntryOutput {
    pub fn artifact(&self, kind: ArtifactKind) -> Option<&Path> {
        self.artifacts
            .iter()
            .find(|a| a.kind == kind)
            .map(|a| a.path.as_path())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileOutputs {
    pub entries: Vec<EntryOutput>,
}

impl FileOutputs {
    pub fn entry(&self, name: &str) -> Option<&EntryOutput> {
        self.entries.iter().find(|e| e.entry_name == name)
    }
}

/// Everything one target GPU's session metadata describes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpuBuildOutput {
    pub gpu: String,
    pub binary: Option<PathBuf>,
    /// Set for pipeline builds.
    pub pipeline: Option<PipelineKind>,
    pub per_file: BTreeMap<PathBuf, FileOutputs>,
}

impl GpuBuildOutput {
    pub fn new(gpu: impl Into<String>) -> Self {
        Self {
            gpu: gpu.into(),
            binary: None,
            pipeline: None,
            per_file: BTreeMap::new(),
        }
    }

    pub fn push_entry(&mut self, entry: EntryOutput) {
        self.per_file
            .entry(entry.input_file.clone())
            .or_default()
            .entries
            .push(entry);
    }

    pub fn artifact_paths(&self) -> BTreeSet<&Path> {
        self.per_file
            .values()
            .flat_map(|f| f.entries.iter())
            .flat_map(|e| e.artifacts.iter())
            .map(|a| a.path.as_path())
            .collect()
    }
}

/// Target GPU to its parsed build output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildOutputStore {
    outputs: BTreeMap<String, GpuBuildOutput>,
}

impl BuildOutputStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads `<gpu>_<metadata file>` for every GPU. Missing or unparsable files
    /// mean "no output for that GPU". Returns true when any GPU loaded.
    pub fn load_build_output(
        &mut self,
        layout: &OutputLayout,
        gpus: &[String],
        metadata_file_name: &str,
    ) -> bool {
        let mut loaded_any = false;
        for gpu in gpus {
            let path = layout.metadata_path(gpu, metadata_file_name);
            if !path.is_file() {
                debug!(gpu = %gpu, path = %path.display(), "no session metadata");
                continue;
            }
            match session_metadata::read_session_metadata(&path, gpu) {
                Ok(output) => {
                    info!(gpu = %gpu, files = output.per_file.len(), "loaded build output");
                    self.outputs.insert(gpu.clone(), output);
                    loaded_any = true;
                }
                Err(e) => {
                    warn!(gpu = %gpu, path = %path.display(), error = %e, "unreadable session metadata");
                }
            }
        }
        loaded_any
    }

    pub fn insert(&mut self, output: GpuBuildOutput) {
        self.outputs.insert(output.gpu.clone(), output);
    }

    /// Drops `file` from every GPU record and deletes the artifacts only it
    /// referenced. Returns true when a GPU record that held `file` is left
    /// without files, which means the caller should purge the output tree.
    pub fn destroy_outputs_for_file(&mut self, file: &Path) -> Result<bool> {
        let mut removed: Vec<EntryOutput> = Vec::new();
        let mut emptied = false;
        for output in self.outputs.values_mut() {
            if let Some(outputs) = output.per_file.remove(file) {
                removed.extend(outputs.entries);
                emptied |= output.per_file.is_empty();
            }
        }

        let still_used: BTreeSet<PathBuf> = self
            .outputs
            .values()
            .flat_map(|o| o.artifact_paths())
            .map(Path::to_path_buf)
            .collect();
        let mut doomed: BTreeSet<&Path> = BTreeSet::new();
        for entry in &removed {
            for artifact in &entry.artifacts {
                if !still_used.contains(&artifact.path) {
                    doomed.insert(&artifact.path);
                }
            }
        }
        for path in &doomed {
            remove_artifact(path)?;
        }
        debug!(
            file = %file.display(),
            entries = removed.len(),
            deleted = doomed.len(),
            "destroyed outputs for file"
        );
        Ok(emptied)
    }

    /// Forgets every record. Files on disk are untouched.
    pub fn clear(&mut self) {
        self.outputs.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }

    pub fn gpu(&self, gpu: &str) -> Option<&GpuBuildOutput> {
        self.outputs.get(gpu)
    }

    pub fn gpus(&self) -> impl Iterator<Item = &str> {
        self.outputs.keys().map(String::as_str)
    }

    pub fn file_outputs(&self, gpu: &str, file: &Path) -> Option<&FileOutputs> {
        self.outputs.get(gpu)?.per_file.get(file)
    }

    pub fn has_output_for_file(&self, file: &Path) -> bool {
        self.outputs.values().any(|o| o.per_file.contains_key(file))
    }

    /// GPUs that produced output for `file`.
    pub fn gpus_for_file<'a>(&'a self, file: &'a Path) -> impl Iterator<Item = &'a str> + 'a {
        self.outputs
            .iter()
            .filter(move |(_, o)| o.per_file.contains_key(file))
            .map(|(gpu, _)| gpu.as_str())
    }
}
