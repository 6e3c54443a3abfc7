//! Session metadata written by the analyzer next to its outputs.
//!
//! Program builds (OpenCL):
//! ```xml
//! <ProgramOutputMetadata>
//!   <Binary>/out/codeobj.bin</Binary>
//!   <InputFile>
//!     <Path>/src/kernel.cl</Path>
//!     <Entry>
//!       <Name>add</Name>
//!       <Type>kernel</Type>
//!       <Output>
//!         <TargetGPU>gfx900</TargetGPU>
//!         <ISA>gfx900_add.isa</ISA>
//!         <CSV_ISA>gfx900_add.csv</CSV_ISA>
//!         <ResourceUsage>gfx900_add_resourceUsage.csv</ResourceUsage>
//!         <LiveReg>gfx900_add_livereg.txt</LiveReg>
//!       </Output>
//!     </Entry>
//!   </InputFile>
//! </ProgramOutputMetadata>
//! ```
//!
//! Pipeline builds (Vulkan) use a `PipelineOutputMetadata` root holding one
//! `Pipeline` with a `Type` and one `Stage` per shader stage. Relative artifact
//! paths resolve against the metadata file's directory.

use std::fs;
use std::path::{Path, PathBuf};

use roxmltree::Node;

use crate::build_output::{ArtifactKind, EntryOutput, GpuBuildOutput, OutputArtifact};
use crate::error::{Error, Result};
use crate::project::PipelineKind;

const PROGRAM_ROOT: &str = "ProgramOutputMetadata";
const PIPELINE_ROOT: &str = "PipelineOutputMetadata";

/// Entry name reported for every pipeline stage.
pub const PIPELINE_ENTRY_NAME: &str = "main";

pub fn read_session_metadata(path: &Path, gpu: &str) -> Result<GpuBuildOutput> {
    let xml = fs::read_to_string(path)
        .map_err(|e| Error::msg(format!("failed to read {}: {e}", path.display())))?;
    let base = path.parent().unwrap_or_else(|| Path::new("."));
    parse_session_metadata(&xml, gpu, base)
        .map_err(|e| Error::parse(format!("{}: {e}", path.display())))
}

pub fn parse_session_metadata(xml: &str, gpu: &str, base_dir: &Path) -> Result<GpuBuildOutput> {
    let doc = roxmltree::Document::parse(xml)?;
    let root = doc.root_element();
    match root.tag_name().name() {
        PROGRAM_ROOT => parse_program(root, gpu, base_dir),
        PIPELINE_ROOT => parse_pipeline(root, gpu, base_dir),
        other => Err(Error::parse(format!(
            "unexpected session metadata root <{other}>"
        ))),
    }
}

fn child<'a, 'input>(node: Node<'a, 'input>, name: &str) -> Option<Node<'a, 'input>> {
    node.children()
        .find(|n| n.is_element() && n.tag_name().name() == name)
}

fn children<'a, 'input>(
    node: Node<'a, 'input>,
    name: &'static str,
) -> impl Iterator<Item = Node<'a, 'input>> {
    node.children()
        .filter(move |n| n.is_element() && n.tag_name().name() == name)
}

fn child_text<'a>(node: Node<'a, '_>, name: &str) -> Option<&'a str> {
    child(node, name)
        .and_then(|n| n.text())
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn required_text<'a>(node: Node<'a, '_>, name: &str) -> Result<&'a str> {
    child_text(node, name).ok_or_else(|| {
        Error::parse(format!(
            "<{}> is missing <{name}>",
            node.tag_name().name()
        ))
    })
}

fn resolve(base_dir: &Path, raw: &str) -> PathBuf {
    let p = PathBuf::from(raw);
    if p.is_absolute() { p } else { base_dir.join(p) }
}

fn parse_program(root: Node<'_, '_>, gpu: &str, base_dir: &Path) -> Result<GpuBuildOutput> {
    let mut out = GpuBuildOutput::new(gpu);
    out.binary = Some(resolve(base_dir, required_text(root, "Binary")?));

    for input in children(root, "InputFile") {
        let input_file = PathBuf::from(required_text(input, "Path")?);
        for entry in children(input, "Entry") {
            let mut artifacts = Vec::new();
            for output in children(entry, "Output") {
                let target = child_text(output, "TargetGPU").unwrap_or(gpu);
                read_artifacts(output, target, base_dir, &mut artifacts);
            }
            out.push_entry(EntryOutput {
                input_file: input_file.clone(),
                entry_name: required_text(entry, "Name")?.to_string(),
                entry_type: child_text(entry, "Type").unwrap_or_default().to_string(),
                long_name: child_text(entry, "ExtremelyLongName").map(str::to_string),
                artifacts,
            });
        }
        // An input file without entries still counts as built.
        out.per_file.entry(input_file).or_default();
    }
    Ok(out)
}

fn parse_pipeline(root: Node<'_, '_>, gpu: &str, base_dir: &Path) -> Result<GpuBuildOutput> {
    let pipeline = child(root, "Pipeline")
        .ok_or_else(|| Error::parse("<PipelineOutputMetadata> is missing <Pipeline>"))?;
    let kind = match required_text(pipeline, "Type")? {
        "Graphics" => PipelineKind::Graphics,
        "Compute" => PipelineKind::Compute,
        other => {
            return Err(Error::parse(format!("unknown pipeline type '{other}'")));
        }
    };

    let mut out = GpuBuildOutput::new(gpu);
    out.pipeline = Some(kind);
    for stage in children(pipeline, "Stage") {
        let stage_type = required_text(stage, "Type")?;
        let input = child(stage, "InputFile")
            .ok_or_else(|| Error::parse(format!("stage '{stage_type}' has no <InputFile>")))?;
        let input_file = PathBuf::from(required_text(input, "Path")?);
        let mut artifacts = Vec::new();
        if let Some(output) = child(stage, "Output") {
            read_artifacts(output, gpu, base_dir, &mut artifacts);
        }
        out.push_entry(EntryOutput {
            input_file,
            entry_name: PIPELINE_ENTRY_NAME.to_string(),
            entry_type: stage_type.to_string(),
            long_name: None,
            artifacts,
        });
    }
    Ok(out)
}

fn read_artifacts(output: Node<'_, '_>, gpu: &str, base_dir: &Path, out: &mut Vec<OutputArtifact>) {
    for (tag, kind) in [
        ("ISA", ArtifactKind::IsaText),
        ("CSV_ISA", ArtifactKind::IsaCsv),
        ("ResourceUsage", ArtifactKind::ResourceUsage),
        ("LiveReg", ArtifactKind::LiveRegisters),
    ] {
        if let Some(raw) = child_text(output, tag) {
            out.push(OutputArtifact {
                kind,
                path: resolve(base_dir, raw),
                gpu: gpu.to_string(),
            });
        }
    }
}
