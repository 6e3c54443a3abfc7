use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineKind {
    Graphics,
    Compute,
    /// Anything else read from a project file. Such a clone cannot be built.
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineStage {
    Vertex,
    TessControl,
    TessEval,
    Geometry,
    Fragment,
    Compute,
}

impl PipelineStage {
    pub const GRAPHICS: [PipelineStage; 5] = [
        PipelineStage::Vertex,
        PipelineStage::TessControl,
        PipelineStage::TessEval,
        PipelineStage::Geometry,
        PipelineStage::Fragment,
    ];

    pub fn abbreviation(self) -> &'static str {
        match self {
            PipelineStage::Vertex => "vert",
            PipelineStage::TessControl => "tesc",
            PipelineStage::TessEval => "tese",
            PipelineStage::Geometry => "geom",
            PipelineStage::Fragment => "frag",
            PipelineStage::Compute => "comp",
        }
    }

    pub fn from_metadata_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "vert" | "vertex" => Some(PipelineStage::Vertex),
            "tesc" | "tesscontrol" | "tessellationcontrol" => Some(PipelineStage::TessControl),
            "tese" | "tesseval" | "tessellationevaluation" => Some(PipelineStage::TessEval),
            "geom" | "geometry" => Some(PipelineStage::Geometry),
            "frag" | "fragment" => Some(PipelineStage::Fragment),
            "comp" | "compute" => Some(PipelineStage::Compute),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageFile {
    pub stage: PipelineStage,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pipeline {
    pub kind: PipelineKind,
    #[serde(default)]
    pub stages: Vec<StageFile>,
}

impl Pipeline {
    pub fn new(kind: PipelineKind) -> Self {
        Self {
            kind,
            stages: Vec::new(),
        }
    }

    pub fn stage(&self, stage: PipelineStage) -> Option<&Path> {
        self.stages
            .iter()
            .find(|s| s.stage == stage)
            .map(|s| s.path.as_path())
    }

    /// Replaces any file already bound to `stage`.
    pub fn set_stage(&mut self, stage: PipelineStage, path: impl Into<PathBuf>) {
        let path = path.into();
        match self.stages.iter_mut().find(|s| s.stage == stage) {
            Some(existing) => existing.path = path,
            None => self.stages.push(StageFile { stage, path }),
        }
    }

    pub fn clear_stage(&mut self, stage: PipelineStage) {
        self.stages.retain(|s| s.stage != stage);
    }

    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        self.stages.iter().map(|s| s.path.as_path())
    }
}

/// Pipeline state file of a Vulkan clone. Only the first active one is passed on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PsoState {
    pub name: String,
    pub path: PathBuf,
    #[serde(default)]
    pub active: bool,
}
