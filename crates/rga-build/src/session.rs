use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};

use crate::build_output::BuildOutputStore;
use crate::cli::command::CommandLineBuilder;
use crate::cli::invoker::ProcessInvoker;
use crate::cli::kernel_list;
use crate::config::AnalyzerConfig;
use crate::config::layout::LayoutStore;
use crate::correlation::{CorrelationTracker, Highlight, file_mtime};
use crate::error::{Error, ErrorKind, Result};
use crate::orchestrator::{BuildOrchestrator, BuildReport, BuildSink, BuildStatus};
use crate::project::{self, CloneId, Project};

/// One open project clone: its builds, outputs and correlation state.
pub struct BuildSession {
    project: Project,
    clone_id: CloneId,
    orchestrator: BuildOrchestrator,
    tracker: CorrelationTracker,
    layout: LayoutStore,
}

impl BuildSession {
    pub fn new(
        project: Project,
        clone_id: CloneId,
        orchestrator: BuildOrchestrator,
        layout: LayoutStore,
    ) -> Result<Self> {
        project.clone_by_id(clone_id)?;
        Ok(Self {
            project,
            clone_id,
            orchestrator,
            tracker: CorrelationTracker::new(),
            layout,
        })
    }

    /// Loads the project file and wires the orchestrator from `cfg`.
    pub fn open(
        cfg: Arc<AnalyzerConfig>,
        project_path: &Path,
        clone_id: CloneId,
        invoker: Arc<dyn ProcessInvoker>,
        sink: Arc<dyn BuildSink>,
    ) -> Result<Self> {
        let project = project::load(project_path)?;
        let layout = match &cfg.layout_file {
            Some(path) => LayoutStore::open(path)?,
            None => LayoutStore::in_memory(),
        };
        let orchestrator = BuildOrchestrator::new(cfg, invoker, sink);
        Self::new(project, clone_id, orchestrator, layout)
    }

    pub fn project(&self) -> &Project {
        &self.project
    }

    pub fn clone_id(&self) -> CloneId {
        self.clone_id
    }

    pub fn orchestrator(&self) -> &BuildOrchestrator {
        &self.orchestrator
    }

    pub fn tracker(&self) -> &CorrelationTracker {
        &self.tracker
    }

    pub fn store(&self) -> &BuildOutputStore {
        self.orchestrator.store()
    }

    pub fn is_line_correlation_enabled(&self, file: &Path) -> bool {
        self.project
            .clone_by_id(self.clone_id)
            .is_ok_and(|c| self.tracker.is_line_correlation_enabled(c, file))
    }

    /// A cancelled worker still owns the output tree until it returns.
    fn busy(&self) -> bool {
        self.orchestrator.is_build_in_progress() || self.orchestrator.has_worker()
    }

    /// Saves the project, then starts a build of the current clone.
    pub fn build(&mut self) -> Result<()> {
        if self.busy() {
            return Err(Error::with_kind(
                ErrorKind::BuildInProgress,
                "a build is already in progress",
            ));
        }
        project::save(&self.project)?;
        self.tracker.on_build_started();
        self.orchestrator
            .build_current_project(&self.project, self.clone_id)
    }

    pub fn cancel(&mut self) -> bool {
        self.orchestrator.cancel_current_build()
    }

    /// Applies a finished build, if any. Never blocks.
    pub fn poll(&mut self) -> Option<BuildReport> {
        let report = self.orchestrator.poll_build()?;
        self.apply(&report);
        Some(report)
    }

    /// Blocks until the running build returns.
    pub fn wait(&mut self) -> Option<BuildReport> {
        let report = self.orchestrator.finish_build()?;
        self.apply(&report);
        Some(report)
    }

    fn apply(&mut self, report: &BuildReport) {
        if report.status != BuildStatus::Succeeded {
            return;
        }
        match self.project.clone_by_id_mut(self.clone_id) {
            Ok(clone) => {
                self.tracker
                    .on_build_succeeded(clone, self.orchestrator.store(), report.finished_at);
            }
            Err(e) => warn!(error = %e, "clone vanished during build"),
        }
        if let Err(e) = project::save(&self.project) {
            warn!(error = %e, "failed to persist correlation state");
        }
    }

    pub fn add_file(&mut self, path: impl Into<PathBuf>) -> Result<bool> {
        let added = self.project.add_source_file(self.clone_id, path)?;
        if added {
            project::save(&self.project)?;
        }
        Ok(added)
    }

    /// Removes a file from the clone and deletes the outputs only it produced.
    /// When a GPU is left with no outputs the clone's output tree is purged.
    pub fn remove_input_file(&mut self, path: &Path) -> Result<bool> {
        if self.busy() {
            return Err(Error::with_kind(
                ErrorKind::BuildInProgress,
                "cannot remove files while a build is running",
            ));
        }
        if !self.project.remove_source_file(self.clone_id, path)? {
            return Ok(false);
        }
        project::save(&self.project)?;

        let emptied = self.orchestrator.store_mut().destroy_outputs_for_file(path)?;
        if emptied {
            info!(file = %path.display(), "no outputs left, purging output directory");
            self.orchestrator.layout(&self.project, self.clone_id).purge()?;
            self.orchestrator.store_mut().clear();
        }
        self.tracker.on_file_removed(path);
        Ok(true)
    }

    /// Records a save of `path`. Returns the file's correlation flag afterwards.
    pub fn save_source_file(&mut self, path: &Path) -> Result<bool> {
        let modified_at = file_mtime(path)?;
        let clone = self.project.clone_by_id_mut(self.clone_id)?;
        let correlated = self.tracker.on_source_file_saved(clone, path, modified_at);
        project::save(&self.project)?;
        Ok(correlated)
    }

    pub fn set_correlation(&mut self, path: &Path, enabled: bool) -> Result<()> {
        let clone = self.project.clone_by_id_mut(self.clone_id)?;
        self.tracker
            .on_correlation_toggled(clone, self.orchestrator.store(), path, enabled);
        Ok(())
    }

    pub fn select_file(&mut self, path: &Path) {
        self.tracker.set_active_file(path);
    }

    pub fn select_line(&mut self, path: &Path, line: u32) -> Result<Highlight> {
        self.ensure_entry_ranges(path);
        let clone = self.project.clone_by_id(self.clone_id)?;
        Ok(self
            .tracker
            .select_source_line(clone, self.orchestrator.store(), path, line)
            .clone())
    }

    pub fn select_disassembly_rows(&mut self, entry: &str, rows: &[usize]) -> Result<Highlight> {
        let clone = self.project.clone_by_id(self.clone_id)?;
        Ok(self
            .tracker
            .select_disassembly_rows(clone, self.orchestrator.store(), entry, rows)
            .clone())
    }

    pub fn select_gpu(&mut self, gpu: &str) -> Result<Highlight> {
        let clone = self.project.clone_by_id(self.clone_id)?;
        Ok(self
            .tracker
            .set_active_gpu(clone, self.orchestrator.store(), gpu)
            .clone())
    }

    pub fn splitter(&self, key: &str) -> Option<&[i32]> {
        self.layout.get(key)
    }

    pub fn record_splitter(&mut self, key: &str, sizes: Vec<i32>) -> Result<()> {
        self.layout.set(key, sizes)
    }

    /// Files holding several entry points need the analyzer's line ranges to
    /// pick the entry for a line.
    fn ensure_entry_ranges(&mut self, path: &Path) {
        if self.tracker.has_entry_ranges(path) {
            return;
        }
        let store = self.orchestrator.store();
        let multi = store
            .gpus_for_file(path)
            .filter_map(|gpu| store.file_outputs(gpu, path))
            .any(|f| f.entries.len() > 1);
        if !multi {
            return;
        }
        let builder = CommandLineBuilder::new(self.orchestrator.config());
        match kernel_list::list_kernels(
            &builder,
            self.orchestrator.invoker().as_ref(),
            self.project.api,
            path,
        ) {
            Ok(ranges) => self.tracker.set_entry_ranges(path, ranges),
            Err(e) => warn!(file = %path.display(), error = %e, "entry listing failed"),
        }
    }
}
