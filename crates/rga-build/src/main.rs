use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rga_build::build_output::{ArtifactKind, BuildOutputStore};
use rga_build::cli::{CommandLineBuilder, SystemInvoker};
use rga_build::config::AnalyzerConfig;
use rga_build::correlation::{CorrelationTracker, file_mtime};
use rga_build::isa_csv::{IsaRow, IsaTable};
use rga_build::logging::{self, LogFormat};
use rga_build::orchestrator::{BuildSink, BuildStatus, JsonLinesSink, StdoutSink};
use rga_build::project::{self, CloneId, Project};
use rga_build::session::BuildSession;
use rga_build::workspace::OutputLayout;
use rga_build::{Error, Result};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Analyzer config TOML (supports `extends`)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Default tracing filter when RUST_LOG is unset
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,
    /// Emit diagnostics as JSON
    #[arg(long, global = true)]
    log_json: bool,
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the analyzer command line for every target GPU without running it
    Commands {
        project: PathBuf,
        #[arg(long, default_value_t = 0)]
        clone: usize,
    },
    /// Build the clone for every target GPU
    Build {
        project: PathBuf,
        #[arg(long, default_value_t = 0)]
        clone: usize,
        /// Print build events as JSON lines
        #[arg(long)]
        json: bool,
    },
    /// List the artifacts recorded by the last build
    Outputs {
        project: PathBuf,
        #[arg(long, default_value_t = 0)]
        clone: usize,
    },
    /// Show the disassembly rows generated from one source line
    Correlate {
        project: PathBuf,
        #[arg(long)]
        file: PathBuf,
        #[arg(long)]
        line: u32,
        #[arg(long)]
        gpu: Option<String>,
        #[arg(long, default_value_t = 0)]
        clone: usize,
    },
    /// Load config and print the fully-resolved TOML (after extends)
    Resolve { file: PathBuf },
}

fn main() -> Result<()> {
    let args = Args::parse();
    let format = if args.log_json {
        LogFormat::Json
    } else {
        LogFormat::Text
    };
    logging::init(&args.log_level, format);

    match args.cmd {
        Command::Commands { project, clone } => {
            cmd_commands(&load_config(args.config.as_deref())?, &project, CloneId(clone))
        }
        Command::Build {
            project,
            clone,
            json,
        } => cmd_build(load_config(args.config.as_deref())?, &project, CloneId(clone), json),
        Command::Outputs { project, clone } => {
            cmd_outputs(&load_config(args.config.as_deref())?, &project, CloneId(clone))
        }
        Command::Correlate {
            project,
            file,
            line,
            gpu,
            clone,
        } => cmd_correlate(
            &load_config(args.config.as_deref())?,
            &project,
            CloneId(clone),
            &file,
            line,
            gpu.as_deref(),
        ),
        Command::Resolve { file } => cmd_resolve(&file),
    }
}

fn load_config(path: Option<&Path>) -> Result<AnalyzerConfig> {
    match path {
        Some(p) => rga_build::config::load(p),
        None => Ok(AnalyzerConfig::default()),
    }
}

fn cmd_commands(cfg: &AnalyzerConfig, path: &Path, clone_id: CloneId) -> Result<()> {
    let project = project::load(path)?;
    let clone = project.clone_by_id(clone_id)?;
    let settings = project.settings_for(clone_id)?;
    let layout = OutputLayout::new(cfg, &project.directory(), clone_id);
    let builder = CommandLineBuilder::new(cfg);
    for gpu in &settings.target_gpus {
        let cmd = builder.compile(&project, clone, settings, &layout, gpu)?;
        println!("{cmd}");
    }
    Ok(())
}

fn cmd_build(cfg: AnalyzerConfig, path: &Path, clone_id: CloneId, json: bool) -> Result<()> {
    let sink: Arc<dyn BuildSink> = if json {
        Arc::new(JsonLinesSink::new(std::io::stdout()))
    } else {
        Arc::new(StdoutSink::default())
    };
    let mut session = BuildSession::open(
        Arc::new(cfg),
        path,
        clone_id,
        Arc::new(SystemInvoker),
        sink,
    )?;
    session.build()?;
    let report = session
        .wait()
        .ok_or_else(|| Error::msg("build worker did not start"))?;
    match report.status {
        BuildStatus::Succeeded => Ok(()),
        BuildStatus::Failed => Err(Error::msg("build failed")),
        BuildStatus::Cancelled => Err(Error::msg("build cancelled")),
    }
}

fn load_store(cfg: &AnalyzerConfig, project: &Project, clone_id: CloneId) -> Result<BuildOutputStore> {
    let settings = project.settings_for(clone_id)?;
    let layout = OutputLayout::new(cfg, &project.directory(), clone_id);
    let mut store = BuildOutputStore::new();
    if !store.load_build_output(&layout, &settings.target_gpus, &cfg.session_metadata_filename) {
        return Err(Error::msg(format!(
            "no build output under {}",
            layout.clone_dir.display()
        )));
    }
    Ok(store)
}

fn cmd_outputs(cfg: &AnalyzerConfig, path: &Path, clone_id: CloneId) -> Result<()> {
    let project = project::load(path)?;
    let store = load_store(cfg, &project, clone_id)?;
    for gpu in store.gpus() {
        println!("{gpu}");
        let Some(output) = store.gpu(gpu) else {
            continue;
        };
        if let Some(bin) = &output.binary {
            println!("  binary: {}", bin.display());
        }
        for (file, outputs) in &output.per_file {
            println!("  {}", file.display());
            for entry in &outputs.entries {
                println!("    {} ({})", entry.entry_name, entry.entry_type);
                for artifact in &entry.artifacts {
                    println!("      {:<15} {}", artifact.kind.label(), artifact.path.display());
                }
            }
        }
    }
    Ok(())
}

fn cmd_correlate(
    cfg: &AnalyzerConfig,
    path: &Path,
    clone_id: CloneId,
    file: &Path,
    line: u32,
    gpu: Option<&str>,
) -> Result<()> {
    let project = project::load(path)?;
    let store = load_store(cfg, &project, clone_id)?;
    let file = std::path::absolute(file)?;

    let clone = project.clone_by_id(clone_id)?;
    let mut tracker = CorrelationTracker::new();
    tracker.restore_last_build(built_at(cfg, &project, clone_id, &store));
    if !tracker.is_line_correlation_enabled(clone, &file) {
        println!("correlation disabled for {}", file.display());
        return Ok(());
    }
    if let Some(gpu) = gpu {
        tracker.set_active_gpu(clone, &store, gpu);
    }
    let highlight = tracker.select_source_line(clone, &store, &file, line).clone();
    let (Some(gpu), Some(entry)) = (highlight.gpu.as_deref(), highlight.entry.as_deref()) else {
        println!("no disassembly for {}:{line}", file.display());
        return Ok(());
    };

    let csv = store
        .file_outputs(gpu, &file)
        .and_then(|f| f.entry(entry))
        .and_then(|e| e.artifact(ArtifactKind::IsaCsv))
        .ok_or_else(|| Error::msg(format!("entry '{entry}' has no ISA table")))?;
    let table = IsaTable::load(csv)?;
    println!("{gpu} {entry}:");
    for row in &highlight.disassembly_rows {
        if let Some(IsaRow::Instruction(ins)) = table.rows.get(*row) {
            println!("  {:>5}  {:<8} {} {}", row, ins.address, ins.opcode, ins.operands);
        }
    }
    Ok(())
}

/// Newest session metadata write of the last build.
fn built_at(
    cfg: &AnalyzerConfig,
    project: &Project,
    clone_id: CloneId,
    store: &BuildOutputStore,
) -> DateTime<Utc> {
    let layout = OutputLayout::new(cfg, &project.directory(), clone_id);
    store
        .gpus()
        .filter_map(|gpu| file_mtime(&layout.metadata_path(gpu, &cfg.session_metadata_filename)).ok())
        .max()
        .unwrap_or_else(Utc::now)
}

fn cmd_resolve(path: &Path) -> Result<()> {
    let value = rga_build::config::load_value(path)?;
    let s = toml::to_string_pretty(&value).unwrap_or_else(|_| format!("{value:?}"));
    print!("{s}");
    Ok(())
}
