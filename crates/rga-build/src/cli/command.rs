use std::fmt;
use std::path::Path;
use std::process::Command;

use crate::config::AnalyzerConfig;
use crate::error::{Error, Result};
use crate::project::{
    BuildSettings, PipelineKind, PipelineStage, Project, ProjectApi, ProjectClone,
};
use crate::workspace::OutputLayout;

pub const ISA_FILE_NAME: &str = "disassem.txt";
pub const LIVEREG_FILE_NAME: &str = "livereg.txt";
pub const ANALYSIS_FILE_NAME: &str = "resourceUsage.csv";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Arg {
    pub value: String,
    /// Rendered inside double quotes (paths and option bundles).
    pub quoted: bool,
}

/// One analyzer invocation. `Display` yields the text shown in the build log;
/// `to_process` yields the same argv without shell quoting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub program: String,
    pub args: Vec<Arg>,
}

impl CommandLine {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn flag(&mut self, flag: &str) -> &mut Self {
        self.args.push(Arg {
            value: flag.to_string(),
            quoted: false,
        });
        self
    }

    pub fn quoted(&mut self, value: impl Into<String>) -> &mut Self {
        self.args.push(Arg {
            value: value.into(),
            quoted: true,
        });
        self
    }

    pub fn path(&mut self, path: &Path) -> &mut Self {
        self.quoted(path.to_string_lossy().into_owned())
    }

    pub fn flag_value(&mut self, flag: &str, value: &str) -> &mut Self {
        self.flag(flag).flag(value)
    }

    pub fn flag_path(&mut self, flag: &str, path: &Path) -> &mut Self {
        self.flag(flag).path(path)
    }

    pub fn flag_quoted(&mut self, flag: &str, value: impl Into<String>) -> &mut Self {
        self.flag(flag).quoted(value)
    }

    /// Value following the first occurrence of `flag`.
    pub fn value_of(&self, flag: &str) -> Option<&str> {
        let idx = self.args.iter().position(|a| !a.quoted && a.value == flag)?;
        self.args.get(idx + 1).map(|a| a.value.as_str())
    }

    pub fn contains_flag(&self, flag: &str) -> bool {
        self.args.iter().any(|a| !a.quoted && a.value == flag)
    }

    pub fn to_process(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(self.args.iter().map(|a| a.value.as_str()));
        cmd
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            if arg.quoted {
                write!(f, " \"{}\"", arg.value)?;
            } else {
                write!(f, " {}", arg.value)?;
            }
        }
        Ok(())
    }
}

/// Builds analyzer command lines from project state. Pure: never touches disk.
#[derive(Debug, Clone, Copy)]
pub struct CommandLineBuilder<'a> {
    cfg: &'a AnalyzerConfig,
}

impl<'a> CommandLineBuilder<'a> {
    pub fn new(cfg: &'a AnalyzerConfig) -> Self {
        Self { cfg }
    }

    /// The compile command for one target GPU of `clone`.
    pub fn compile(
        &self,
        project: &Project,
        clone: &ProjectClone,
        settings: &BuildSettings,
        layout: &OutputLayout,
        gpu: &str,
    ) -> Result<CommandLine> {
        let api = project.api;
        let binary_name = self.cfg.binary_name(&settings.binary_file_name);

        let mut cmd = CommandLine::new(&self.cfg.executable);
        cmd.flag_value("-s", api.mode());
        cmd.flag_path("--isa", &layout.artifact(ISA_FILE_NAME))
            .flag("--parse-isa");
        cmd.flag_path("--livereg", &layout.artifact(LIVEREG_FILE_NAME));
        cmd.flag("--line-numbers");
        cmd.flag_path("--analysis", &layout.artifact(ANALYSIS_FILE_NAME));
        cmd.flag_path("-b", &layout.artifact(binary_name));
        if api == ProjectApi::Vulkan && binary_name != self.cfg.default_binary_name {
            cmd.flag("--no-suffix-bin");
        }
        if let Some(log) = &self.cfg.cli_log_file {
            cmd.flag_path("--log", log);
        }

        match api {
            ProjectApi::OpenCl => append_opencl_settings(&mut cmd, settings),
            ProjectApi::Vulkan => append_vulkan_settings(&mut cmd, settings),
        }

        cmd.flag_path(
            "--session-metadata",
            &layout.metadata_path(gpu, &self.cfg.session_metadata_filename),
        );
        cmd.flag_value("--asic", gpu);

        match api {
            ProjectApi::OpenCl => {
                for file in &clone.source_files {
                    cmd.path(&file.path);
                }
            }
            ProjectApi::Vulkan => self.append_pipeline_inputs(&mut cmd, clone)?,
        }
        Ok(cmd)
    }

    fn append_pipeline_inputs(&self, cmd: &mut CommandLine, clone: &ProjectClone) -> Result<()> {
        let Some(pipeline) = &clone.pipeline else {
            return Err(Error::invalid_clone(format!(
                "clone '{}' has no pipeline",
                clone.name
            )));
        };
        if let Some(pso) = clone.active_pso() {
            cmd.flag_path("--pso", &pso.path);
        }
        let stages: &[PipelineStage] = match pipeline.kind {
            PipelineKind::Graphics => &PipelineStage::GRAPHICS,
            PipelineKind::Compute => &[PipelineStage::Compute],
            PipelineKind::Unknown => {
                return Err(Error::invalid_clone(format!(
                    "clone '{}' pipeline is neither graphics nor compute",
                    clone.name
                )));
            }
        };
        for stage in stages {
            let Some(path) = pipeline.stage(*stage) else {
                continue;
            };
            let flag = if self.cfg.is_spv_text(path) {
                format!("--{}-spvas", stage.abbreviation())
            } else {
                format!("--{}", stage.abbreviation())
            };
            cmd.flag_path(&flag, path);
        }
        Ok(())
    }

    pub fn version_info(&self, out_file: &Path) -> CommandLine {
        let mut cmd = CommandLine::new(&self.cfg.executable);
        cmd.flag_path("--version-info", out_file);
        cmd
    }

    pub fn list_kernels(&self, api: ProjectApi, source: &Path) -> CommandLine {
        let mut cmd = CommandLine::new(&self.cfg.executable);
        cmd.flag_value("-s", api.mode());
        cmd.flag_path("--list-kernels", source);
        cmd
    }

    pub fn disassemble_spv(&self, compiler_bin: &str, spv: &Path, out_file: &Path) -> CommandLine {
        let mut cmd = CommandLine::new(&self.cfg.executable);
        cmd.flag_value("-s", ProjectApi::Vulkan.mode());
        if !compiler_bin.trim().is_empty() {
            cmd.flag_quoted("--compiler-bin", compiler_bin);
        }
        cmd.flag_path("--disassemble-spv", out_file);
        cmd.path(spv);
        cmd
    }
}

fn append_common_settings(cmd: &mut CommandLine, settings: &BuildSettings) {
    for dir in &settings.include_dirs {
        let dir = dir.trim_end_matches(['/', '\\']);
        if dir.is_empty() {
            continue;
        }
        cmd.flag_quoted("-I", dir);
    }
    for define in &settings.predefined_macros {
        let define = define.trim();
        if !define.is_empty() {
            cmd.flag_value("-D", define);
        }
    }
}

fn option_bundle(toggles: &[(bool, &str)], additional: &str) -> String {
    let mut parts: Vec<&str> = toggles
        .iter()
        .filter(|(on, _)| *on)
        .map(|(_, opt)| *opt)
        .collect();
    let additional = additional.trim();
    if !additional.is_empty() {
        parts.push(additional);
    }
    parts.join(" ")
}

fn append_opencl_settings(cmd: &mut CommandLine, settings: &BuildSettings) {
    append_common_settings(cmd, settings);

    let cl = &settings.opencl;
    let bundle = option_bundle(
        &[
            (cl.fast_relaxed_math, "-cl-fast-relaxed-math"),
            (
                cl.correctly_rounded_div_sqrt,
                "-cl-fp32-correctly-rounded-divide-sqrt",
            ),
            (cl.finite_math_only, "-cl-finite-math-only"),
            (cl.unsafe_math_optimizations, "-cl-unsafe-math-optimizations"),
            (cl.no_signed_zeros, "-cl-no-signed-zeros"),
            (cl.mad_enable, "-cl-mad-enable"),
            (cl.strict_aliasing, "-cl-strict-aliasing"),
            (cl.denorms_are_zero, "-cl-denorms-are-zero"),
            (cl.single_precision_constant, "-cl-single-precision-constant"),
        ],
        &settings.additional_options,
    );
    if !bundle.is_empty() {
        cmd.flag_quoted("--OpenCLoption", bundle);
    }

    let paths = &settings.compiler_paths;
    for (flag, dir) in [
        ("--compiler-bin", &paths.bin),
        ("--compiler-inc", &paths.include),
        ("--compiler-lib", &paths.lib),
    ] {
        if !dir.trim().is_empty() {
            cmd.flag_quoted(flag, dir.trim());
        }
    }

    if let Some(flag) = cl.optimization_level.flag() {
        cmd.flag(flag);
    }
}

fn append_vulkan_settings(cmd: &mut CommandLine, settings: &BuildSettings) {
    append_common_settings(cmd, settings);

    let vk = &settings.vulkan;
    if vk.enable_validation_layers {
        cmd.flag("--validation");
    }
    if !vk.icd_location.trim().is_empty() {
        cmd.flag_quoted("--icd", vk.icd_location.trim());
    }
    if !vk.glslang_options.trim().is_empty() {
        // '@' delimits glslang options from analyzer options.
        cmd.flag_quoted("--glslang-opt", format!("@{}@", vk.glslang_options.trim()));
    }
    if !settings.compiler_paths.bin.trim().is_empty() {
        cmd.flag_quoted("--compiler-bin", settings.compiler_paths.bin.trim());
    }

    let bundle = option_bundle(
        &[
            (vk.generate_debug_info, "-g"),
            (vk.no_explicit_bindings, "--auto-map-bindings"),
            (vk.hlsl_block_offsets, "--hlsl-offsets"),
            (vk.hlsl_io_mapping, "--hlsl-iomap"),
        ],
        &settings.additional_options,
    );
    if !bundle.is_empty() {
        cmd.flag_quoted("--Vulkanoption", bundle);
    }
}

/// Dashed banner written to the log before each GPU's command.
pub fn build_header(project: &Project, gpu: &str) -> String {
    let title = format!("Building {} project \"{}\" for {}", project.api, project.name, gpu);
    let dashes = "-".repeat(title.chars().count());
    format!("{dashes}\n{title}\n{dashes}\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::{CloneId, Pipeline, PsoState};
    use std::path::PathBuf;

    fn opencl_project() -> Project {
        let mut project = Project::new("demo", ProjectApi::OpenCl, "/work/demo/demo.toml");
        let settings = project.add_settings(BuildSettings {
            target_gpus: vec!["gfx900".into()],
            include_dirs: vec!["/inc/dir/".into()],
            predefined_macros: vec!["FOO=1".into()],
            ..Default::default()
        });
        let clone = project.add_clone("Default", settings);
        project
            .add_source_file(clone, "/work/demo/my kernel.cl")
            .expect("add");
        project
    }

    fn layout(cfg: &AnalyzerConfig) -> OutputLayout {
        OutputLayout::new(cfg, Path::new("/work/demo"), CloneId(0))
    }

    #[test]
    fn opencl_command_has_fixed_flag_order() {
        let cfg = AnalyzerConfig::default();
        let project = opencl_project();
        let clone = &project.clones[0];
        let settings = project.settings_for(CloneId(0)).expect("settings");

        let cmd = CommandLineBuilder::new(&cfg)
            .compile(&project, clone, settings, &layout(&cfg), "gfx900")
            .expect("compile");

        assert_eq!(
            cmd.to_string(),
            "rga -s cl \
             --isa \"/work/demo/Output/Clone0/disassem.txt\" --parse-isa \
             --livereg \"/work/demo/Output/Clone0/livereg.txt\" \
             --line-numbers \
             --analysis \"/work/demo/Output/Clone0/resourceUsage.csv\" \
             -b \"/work/demo/Output/Clone0/codeobj.bin\" \
             -I \"/inc/dir\" -D FOO=1 \
             --session-metadata \"/work/demo/Output/Clone0/gfx900_cliInvocation.xml\" \
             --asic gfx900 \
             \"/work/demo/my kernel.cl\""
        );
    }

    #[test]
    fn opencl_toggles_and_optimization_level_are_emitted_when_set() {
        let cfg = AnalyzerConfig::default();
        let mut project = opencl_project();
        {
            let settings = project.settings_for_mut(CloneId(0)).expect("settings");
            settings.opencl.mad_enable = true;
            settings.opencl.fast_relaxed_math = true;
            settings.opencl.optimization_level = crate::project::OptimizationLevel::O2;
            settings.additional_options = "-DBAR".into();
            settings.compiler_paths.bin = "/llvm/bin".into();
        }
        let settings = project.settings_for(CloneId(0)).expect("settings");
        let cmd = CommandLineBuilder::new(&cfg)
            .compile(&project, &project.clones[0], settings, &layout(&cfg), "gfx900")
            .expect("compile");

        assert_eq!(
            cmd.value_of("--OpenCLoption"),
            Some("-cl-fast-relaxed-math -cl-mad-enable -DBAR")
        );
        assert_eq!(cmd.value_of("--compiler-bin"), Some("/llvm/bin"));
        assert!(cmd.contains_flag("--O2"));
        assert!(!cmd.contains_flag("--compiler-inc"));
    }

    fn vulkan_project(kind: PipelineKind) -> Project {
        let mut project = Project::new("vk", ProjectApi::Vulkan, "/work/vk/vk.toml");
        let settings = project.add_settings(BuildSettings {
            target_gpus: vec!["gfx1030".into()],
            binary_file_name: "pipe.bin".into(),
            ..Default::default()
        });
        let id = project.add_clone("Default", settings);
        let clone = project.clone_by_id_mut(id).expect("clone");
        let mut pipeline = Pipeline::new(kind);
        pipeline.set_stage(PipelineStage::Fragment, "/work/vk/shader.frag");
        pipeline.set_stage(PipelineStage::Vertex, "/work/vk/shader.vert.txt");
        pipeline.set_stage(PipelineStage::Compute, "/work/vk/shader.comp");
        clone.pipeline = Some(pipeline);
        clone.pso_states = vec![
            PsoState {
                name: "off".into(),
                path: PathBuf::from("/work/vk/off.gpso"),
                active: false,
            },
            PsoState {
                name: "on".into(),
                path: PathBuf::from("/work/vk/on.gpso"),
                active: true,
            },
        ];
        project
    }

    #[test]
    fn graphics_pipeline_lists_stages_in_pipeline_order() {
        let cfg = AnalyzerConfig::default();
        let project = vulkan_project(PipelineKind::Graphics);
        let settings = project.settings_for(CloneId(0)).expect("settings");
        let cmd = CommandLineBuilder::new(&cfg)
            .compile(&project, &project.clones[0], settings, &layout(&cfg), "gfx1030")
            .expect("compile");
        let text = cmd.to_string();

        assert!(cmd.contains_flag("--no-suffix-bin"));
        assert_eq!(cmd.value_of("--pso"), Some("/work/vk/on.gpso"));
        let vert = text.find("--vert-spvas \"/work/vk/shader.vert.txt\"").expect("vert");
        let frag = text.find("--frag \"/work/vk/shader.frag\"").expect("frag");
        assert!(vert < frag);
        assert!(!cmd.contains_flag("--comp"));
        assert!(text.ends_with("--frag \"/work/vk/shader.frag\""));
    }

    #[test]
    fn compute_pipeline_passes_only_compute_stage() {
        let cfg = AnalyzerConfig::default();
        let project = vulkan_project(PipelineKind::Compute);
        let settings = project.settings_for(CloneId(0)).expect("settings");
        let cmd = CommandLineBuilder::new(&cfg)
            .compile(&project, &project.clones[0], settings, &layout(&cfg), "gfx1030")
            .expect("compile");
        assert_eq!(cmd.value_of("--comp"), Some("/work/vk/shader.comp"));
        assert!(!cmd.contains_flag("--vert-spvas"));
    }

    #[test]
    fn unknown_pipeline_kind_is_invalid_clone() {
        let cfg = AnalyzerConfig::default();
        let project = vulkan_project(PipelineKind::Unknown);
        let settings = project.settings_for(CloneId(0)).expect("settings");
        let err = CommandLineBuilder::new(&cfg)
            .compile(&project, &project.clones[0], settings, &layout(&cfg), "gfx1030")
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidClone);
    }

    #[test]
    fn header_is_framed_by_dashes_of_equal_length() {
        let project = opencl_project();
        let header = build_header(&project, "gfx900");
        let lines: Vec<&str> = header.lines().collect();
        assert_eq!(lines[1], "Building OpenCL project \"demo\" for gfx900");
        assert_eq!(lines[0].len(), lines[1].len());
        assert_eq!(lines[0], lines[2]);
    }

    #[test]
    fn auxiliary_commands() {
        let cfg = AnalyzerConfig::default();
        let b = CommandLineBuilder::new(&cfg);
        assert_eq!(
            b.version_info(Path::new("/tmp/v.xml")).to_string(),
            "rga --version-info \"/tmp/v.xml\""
        );
        assert_eq!(
            b.list_kernels(ProjectApi::OpenCl, Path::new("/k.cl")).to_string(),
            "rga -s cl --list-kernels \"/k.cl\""
        );
        assert_eq!(
            b.disassemble_spv("", Path::new("/a.spv"), Path::new("/a.txt"))
                .to_string(),
            "rga -s vulkan --disassemble-spv \"/a.txt\" \"/a.spv\""
        );
    }
}
