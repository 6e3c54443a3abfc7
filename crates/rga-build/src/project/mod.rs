pub mod pipeline;

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};

pub use pipeline::{Pipeline, PipelineKind, PipelineStage, PsoState, StageFile};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectApi {
    OpenCl,
    Vulkan,
}

impl ProjectApi {
    /// Value passed to the analyzer's `-s` flag.
    pub fn mode(self) -> &'static str {
        match self {
            ProjectApi::OpenCl => "cl",
            ProjectApi::Vulkan => "vulkan",
        }
    }
}

impl fmt::Display for ProjectApi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ProjectApi::OpenCl => "OpenCL",
            ProjectApi::Vulkan => "Vulkan",
        })
    }
}

/// Index of a clone inside `Project::clones`; also names its `Clone<N>` output dir.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CloneId(pub usize);

impl fmt::Display for CloneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Index into `Project::settings`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SettingsId(pub usize);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFileInfo {
    pub path: PathBuf,
    #[serde(default)]
    pub correlated: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptimizationLevel {
    #[default]
    Default,
    O0,
    O1,
    O2,
    O3,
}

impl OptimizationLevel {
    pub fn flag(self) -> Option<&'static str> {
        match self {
            OptimizationLevel::Default => None,
            OptimizationLevel::O0 => Some("--O0"),
            OptimizationLevel::O1 => Some("--O1"),
            OptimizationLevel::O2 => Some("--O2"),
            OptimizationLevel::O3 => Some("--O3"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompilerPaths {
    pub bin: String,
    pub include: String,
    pub lib: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenClOptions {
    pub optimization_level: OptimizationLevel,
    pub fast_relaxed_math: bool,
    pub correctly_rounded_div_sqrt: bool,
    pub finite_math_only: bool,
    pub unsafe_math_optimizations: bool,
    pub no_signed_zeros: bool,
    pub mad_enable: bool,
    pub strict_aliasing: bool,
    pub denorms_are_zero: bool,
    pub single_precision_constant: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VulkanOptions {
    pub generate_debug_info: bool,
    pub no_explicit_bindings: bool,
    pub hlsl_block_offsets: bool,
    pub hlsl_io_mapping: bool,
    pub enable_validation_layers: bool,
    pub icd_location: String,
    pub glslang_options: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildSettings {
    pub target_gpus: Vec<String>,
    pub predefined_macros: Vec<String>,
    pub include_dirs: Vec<String>,
    pub additional_options: String,
    pub compiler_paths: CompilerPaths,
    pub binary_file_name: String,
    pub opencl: OpenClOptions,
    pub vulkan: VulkanOptions,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectClone {
    pub name: String,
    pub settings: SettingsId,
    #[serde(default)]
    pub source_files: Vec<SourceFileInfo>,
    #[serde(default)]
    pub pipeline: Option<Pipeline>,
    #[serde(default)]
    pub pso_states: Vec<PsoState>,
}

impl ProjectClone {
    pub fn source_file(&self, path: &Path) -> Option<&SourceFileInfo> {
        self.source_files.iter().find(|f| f.path == path)
    }

    pub fn source_file_mut(&mut self, path: &Path) -> Option<&mut SourceFileInfo> {
        self.source_files.iter_mut().find(|f| f.path == path)
    }

    pub fn active_pso(&self) -> Option<&PsoState> {
        self.pso_states.iter().find(|p| p.active)
    }

    /// Files fed to the analyzer: the source list plus any pipeline stage files.
    pub fn input_files(&self) -> Vec<PathBuf> {
        let mut out: Vec<PathBuf> = self.source_files.iter().map(|f| f.path.clone()).collect();
        if let Some(pipeline) = &self.pipeline {
            for path in pipeline.paths() {
                if !out.iter().any(|p| p == path) {
                    out.push(path.to_path_buf());
                }
            }
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub name: String,
    pub api: ProjectApi,
    #[serde(default)]
    pub settings: Vec<BuildSettings>,
    #[serde(default)]
    pub clones: Vec<ProjectClone>,
    #[serde(skip)]
    pub file_path: PathBuf,
}

impl Project {
    pub fn new(name: impl Into<String>, api: ProjectApi, file_path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            api,
            settings: Vec::new(),
            clones: Vec::new(),
            file_path: file_path.into(),
        }
    }

    /// Directory holding the project file; the `Output` tree lives under it.
    pub fn directory(&self) -> PathBuf {
        self.file_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn add_settings(&mut self, settings: BuildSettings) -> SettingsId {
        self.settings.push(settings);
        SettingsId(self.settings.len() - 1)
    }

    pub fn add_clone(&mut self, name: impl Into<String>, settings: SettingsId) -> CloneId {
        self.clones.push(ProjectClone {
            name: name.into(),
            settings,
            source_files: Vec::new(),
            pipeline: None,
            pso_states: Vec::new(),
        });
        CloneId(self.clones.len() - 1)
    }

    pub fn clone_by_id(&self, id: CloneId) -> Result<&ProjectClone> {
        self.clones.get(id.0).ok_or_else(|| {
            Error::invalid_clone(format!(
                "project '{}' has no clone {} ({} clones)",
                self.name,
                id,
                self.clones.len()
            ))
        })
    }

    pub fn clone_by_id_mut(&mut self, id: CloneId) -> Result<&mut ProjectClone> {
        let (name, count) = (self.name.clone(), self.clones.len());
        self.clones.get_mut(id.0).ok_or_else(|| {
            Error::invalid_clone(format!(
                "project '{name}' has no clone {id} ({count} clones)"
            ))
        })
    }

    pub fn settings_for(&self, id: CloneId) -> Result<&BuildSettings> {
        let clone = self.clone_by_id(id)?;
        self.settings.get(clone.settings.0).ok_or_else(|| {
            Error::invalid_clone(format!(
                "clone {} references missing build settings {}",
                id, clone.settings.0
            ))
        })
    }

    pub fn settings_for_mut(&mut self, id: CloneId) -> Result<&mut BuildSettings> {
        let settings = self.clone_by_id(id)?.settings;
        self.settings.get_mut(settings.0).ok_or_else(|| {
            Error::invalid_clone(format!(
                "clone {id} references missing build settings {}",
                settings.0
            ))
        })
    }

    /// Adds a source file to a clone. Returns false when it is already present.
    pub fn add_source_file(&mut self, id: CloneId, path: impl Into<PathBuf>) -> Result<bool> {
        let path = path.into();
        let clone = self.clone_by_id_mut(id)?;
        if clone.source_file(&path).is_some() {
            return Ok(false);
        }
        clone.source_files.push(SourceFileInfo {
            path,
            correlated: false,
        });
        Ok(true)
    }

    pub fn remove_source_file(&mut self, id: CloneId, path: &Path) -> Result<bool> {
        let clone = self.clone_by_id_mut(id)?;
        let before = clone.source_files.len();
        clone.source_files.retain(|f| f.path != path);
        Ok(clone.source_files.len() != before)
    }

    pub fn set_file_correlated(&mut self, id: CloneId, path: &Path, correlated: bool) -> Result<()> {
        let clone = self.clone_by_id_mut(id)?;
        let Some(info) = clone.source_file_mut(path) else {
            return Err(Error::msg(format!(
                "file {} is not part of clone {id}",
                path.display()
            )));
        };
        info.correlated = correlated;
        Ok(())
    }

    /// Arena references must point at existing settings records.
    pub fn validate(&self) -> Result<()> {
        for (idx, clone) in self.clones.iter().enumerate() {
            if clone.settings.0 >= self.settings.len() {
                return Err(Error::parse(format!(
                    "clone {idx} ('{}') references missing build settings {}",
                    clone.name, clone.settings.0
                )));
            }
        }
        Ok(())
    }
}

pub fn load(path: &Path) -> Result<Project> {
    let raw = fs::read_to_string(path)
        .map_err(|e| Error::msg(format!("failed to read project {}: {e}", path.display())))?;
    let mut project: Project = toml::from_str(&raw)
        .map_err(|e| Error::parse(format!("invalid project file {}: {e}", path.display())))?;
    project.file_path = path.to_path_buf();
    project.validate()?;
    info!(project = %project.name, api = %project.api, clones = project.clones.len(), "loaded project");
    Ok(project)
}

pub fn save(project: &Project) -> Result<()> {
    let text = toml::to_string_pretty(project)?;
    if let Some(parent) = project.file_path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }
    fs::write(&project.file_path, text).map_err(|e| {
        Error::msg(format!(
            "failed to write project {}: {e}",
            project.file_path.display()
        ))
    })?;
    debug!(path = %project.file_path.display(), "saved project");
    Ok(())
}
