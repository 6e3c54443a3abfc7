use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::thread::JoinHandle;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::build_output::BuildOutputStore;
use crate::cli::command::{CommandLineBuilder, build_header};
use crate::cli::invoker::ProcessInvoker;
use crate::config::AnalyzerConfig;
use crate::error::{Error, ErrorKind, Result};
use crate::log_sanitize::sanitize_output;
use crate::project::{CloneId, Project};
use crate::workspace::OutputLayout;

pub const MSG_INVALID_CLONE: &str = "Build Failed due to invalid clone.";
pub const MSG_COMMAND_FAILED: &str = "Failed to generate command line used for project build.";
pub const MSG_CANCELLED: &str = "Build canceled.";
pub const MSG_NO_OUTPUT: &str = "No target GPU produced build output.";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BuildEvent {
    LogCleared,
    BuildStarted { project: String, clone: usize },
    Log { text: String },
    BuildSucceeded { gpus: Vec<String> },
    BuildFailed { reason: String },
    BuildCancelled,
}

impl BuildEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BuildEvent::BuildSucceeded { .. } | BuildEvent::BuildFailed { .. } | BuildEvent::BuildCancelled
        )
    }
}

/// Receives build events. Called from the build worker as well as from the
/// thread that owns the orchestrator.
pub trait BuildSink: Send + Sync {
    fn emit(&self, ev: BuildEvent);
}

#[derive(Default)]
pub struct StdoutSink {
    state: Mutex<StdoutSinkState>,
}

#[derive(Default)]
struct StdoutSinkState {
    started_at: Option<Instant>,
    log_lines: usize,
}

impl BuildSink for StdoutSink {
    fn emit(&self, ev: BuildEvent) {
        match ev {
            BuildEvent::LogCleared => {}
            BuildEvent::BuildStarted { project, clone } => {
                if let Ok(mut s) = self.state.lock() {
                    *s = StdoutSinkState {
                        started_at: Some(Instant::now()),
                        log_lines: 0,
                    };
                }
                println!("BUILD: {project} (clone {clone})");
            }
            BuildEvent::Log { text } => {
                if let Ok(mut s) = self.state.lock() {
                    s.log_lines = s.log_lines.saturating_add(text.lines().count());
                }
                print!("{text}");
                if !text.ends_with('\n') {
                    println!();
                }
            }
            ev => {
                let (elapsed, lines) = self
                    .state
                    .lock()
                    .ok()
                    .map(|s| {
                        (
                            s.started_at.map(|t| t.elapsed()).unwrap_or_default(),
                            s.log_lines,
                        )
                    })
                    .unwrap_or_default();
                println!("SUMMARY:");
                match ev {
                    BuildEvent::BuildSucceeded { gpus } => {
                        println!("  status: ok");
                        println!("  gpus: {}", gpus.join(", "));
                    }
                    BuildEvent::BuildFailed { reason } => {
                        println!("  status: failed");
                        println!("  error: {reason}");
                    }
                    _ => println!("  status: cancelled"),
                }
                println!("  log_lines: {lines}");
                println!("  elapsed: {:.1}s", elapsed.as_secs_f64());
            }
        }
    }
}

/// Forwards events to another thread, typically the UI loop.
#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<BuildEvent>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<BuildEvent>) -> Self {
        Self { tx }
    }
}

impl BuildSink for ChannelSink {
    fn emit(&self, ev: BuildEvent) {
        let _ = self.tx.send(ev);
    }
}

/// One JSON object per event, newline separated.
pub struct JsonLinesSink<W: Write + Send> {
    out: Mutex<W>,
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }
}

impl<W: Write + Send> BuildSink for JsonLinesSink<W> {
    fn emit(&self, ev: BuildEvent) {
        let Ok(mut out) = self.out.lock() else {
            return;
        };
        if let Err(e) = serde_json::to_writer(&mut *out, &ev) {
            warn!(error = %e, "failed to encode build event");
            return;
        }
        if let Err(e) = out.write_all(b"\n").and_then(|()| out.flush()) {
            warn!(error = %e, "failed to write build event");
        }
    }
}

/// Keeps every event in memory.
#[derive(Default)]
pub struct CollectingSink {
    events: Mutex<Vec<BuildEvent>>,
}

impl CollectingSink {
    pub fn events(&self) -> Vec<BuildEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn log_text(&self) -> String {
        self.events()
            .into_iter()
            .filter_map(|ev| match ev {
                BuildEvent::Log { text } => Some(text),
                _ => None,
            })
            .collect()
    }
}

impl BuildSink for CollectingSink {
    fn emit(&self, ev: BuildEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(ev);
        }
    }
}

const RUNNING: u8 = 0;
const FINISHING: u8 = 1;
const CANCELLED: u8 = 2;

/// Decides a build's outcome once. The worker checks it before each GPU and
/// claims the finish before reporting; a cancel only wins while the build is
/// still running.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicU8>);

impl CancelToken {
    /// Returns false if the worker already claimed the finish or the build
    /// was cancelled before.
    pub fn cancel(&self) -> bool {
        self.0
            .compare_exchange(RUNNING, CANCELLED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst) == CANCELLED
    }

    /// Returns false when a cancel got in first.
    pub fn claim_finish(&self) -> bool {
        self.0
            .compare_exchange(RUNNING, FINISHING, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    Succeeded,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildReport {
    pub status: BuildStatus,
    /// GPUs whose invocation reported success, in build order.
    pub invoked_ok: Vec<String>,
    /// GPUs whose session metadata loaded.
    pub loaded: Vec<String>,
    pub log: String,
    pub finished_at: DateTime<Utc>,
}

struct WorkerResult {
    report: BuildReport,
    store: BuildOutputStore,
}

struct BuildHandle {
    join: JoinHandle<WorkerResult>,
    cancel: CancelToken,
}

/// Everything the worker thread owns for one build.
struct BuildJob {
    cfg: Arc<AnalyzerConfig>,
    invoker: Arc<dyn ProcessInvoker>,
    sink: Arc<dyn BuildSink>,
    cancel: CancelToken,
    in_progress: Arc<AtomicBool>,
    project: Project,
    clone_id: CloneId,
    layout: OutputLayout,
    log: String,
}

impl BuildJob {
    fn log(&mut self, text: String) {
        self.log.push_str(&text);
        self.sink.emit(BuildEvent::Log { text });
    }

    fn finish(mut self, status: BuildStatus, invoked_ok: Vec<String>, store: BuildOutputStore) -> WorkerResult {
        let loaded: Vec<String> = invoked_ok
            .iter()
            .filter(|g| store.gpu(g).is_some())
            .cloned()
            .collect();
        match status {
            BuildStatus::Succeeded => self.sink.emit(BuildEvent::BuildSucceeded {
                gpus: loaded.clone(),
            }),
            BuildStatus::Failed => {
                let reason = self
                    .log
                    .lines()
                    .last()
                    .unwrap_or(MSG_NO_OUTPUT)
                    .to_string();
                self.sink.emit(BuildEvent::BuildFailed { reason });
            }
            // Already announced by cancel_current_build.
            BuildStatus::Cancelled => {}
        }
        self.in_progress.store(false, Ordering::SeqCst);
        info!(status = ?status, gpus = ?loaded, "build finished");
        WorkerResult {
            report: BuildReport {
                status,
                invoked_ok,
                loaded,
                log: std::mem::take(&mut self.log),
                finished_at: Utc::now(),
            },
            store,
        }
    }

    fn fail(mut self, msg: &str, invoked_ok: Vec<String>) -> WorkerResult {
        if !self.cancel.claim_finish() {
            return self.cancelled(invoked_ok);
        }
        self.log(format!("{msg}\n"));
        self.finish(BuildStatus::Failed, invoked_ok, BuildOutputStore::new())
    }

    fn cancelled(mut self, invoked_ok: Vec<String>) -> WorkerResult {
        if let Err(e) = self.layout.purge() {
            warn!(error = %e, "failed to remove partial build artifacts");
        }
        self.log(format!("{MSG_CANCELLED}\n"));
        self.finish(BuildStatus::Cancelled, invoked_ok, BuildOutputStore::new())
    }

    fn run(mut self) -> WorkerResult {
        if let Err(e) = self.layout.ensure() {
            error!(error = %e, "cannot create output directory");
            return self.fail(&format!("Failed to create build output directory: {e}"), Vec::new());
        }

        let settings = match self.project.settings_for(self.clone_id) {
            Ok(s) => s.clone(),
            Err(_) => return self.fail(MSG_INVALID_CLONE, Vec::new()),
        };

        let mut invoked_ok = Vec::new();
        for gpu in &settings.target_gpus {
            if self.cancel.is_cancelled() {
                debug!(gpu = %gpu, "cancel observed before invocation");
                break;
            }

            let built = self
                .project
                .clone_by_id(self.clone_id)
                .and_then(|clone| {
                    CommandLineBuilder::new(&self.cfg).compile(
                        &self.project,
                        clone,
                        &settings,
                        &self.layout,
                        gpu,
                    )
                });
            let cmd = match built {
                Ok(cmd) => cmd,
                Err(e) if e.kind() == ErrorKind::InvalidClone => {
                    warn!(error = %e, "invalid clone");
                    return self.fail(MSG_INVALID_CLONE, invoked_ok);
                }
                Err(e) => {
                    warn!(error = %e, "command generation failed");
                    return self.fail(MSG_COMMAND_FAILED, invoked_ok);
                }
            };

            self.log(format!("{}{cmd}\n", build_header(&self.project, gpu)));
            match self.invoker.invoke(&cmd) {
                Ok(inv) => {
                    let text = sanitize_output(&inv.output);
                    if !text.is_empty() {
                        self.log(text);
                    }
                    if inv.success {
                        invoked_ok.push(gpu.clone());
                    } else {
                        info!(gpu = %gpu, code = ?inv.exit_code, "analyzer reported failure");
                    }
                }
                Err(e) => {
                    warn!(gpu = %gpu, error = %e, "analyzer invocation failed");
                    self.log(format!("{e}\n"));
                }
            }
        }

        if !self.cancel.claim_finish() {
            return self.cancelled(invoked_ok);
        }

        let mut store = BuildOutputStore::new();
        let loaded = store.load_build_output(
            &self.layout,
            &invoked_ok,
            &self.cfg.session_metadata_filename,
        );
        if loaded {
            self.finish(BuildStatus::Succeeded, invoked_ok, store)
        } else {
            self.log(format!("{MSG_NO_OUTPUT}\n"));
            self.finish(BuildStatus::Failed, invoked_ok, BuildOutputStore::new())
        }
    }
}

/// Runs project builds one at a time on a background thread.
///
/// The worker owns the fresh `BuildOutputStore` while it runs and hands it
/// back through its join handle; `finish_build` installs it here.
pub struct BuildOrchestrator {
    cfg: Arc<AnalyzerConfig>,
    invoker: Arc<dyn ProcessInvoker>,
    sink: Arc<dyn BuildSink>,
    store: BuildOutputStore,
    in_progress: Arc<AtomicBool>,
    current: Option<BuildHandle>,
    last_success: Option<DateTime<Utc>>,
}

impl BuildOrchestrator {
    pub fn new(
        cfg: Arc<AnalyzerConfig>,
        invoker: Arc<dyn ProcessInvoker>,
        sink: Arc<dyn BuildSink>,
    ) -> Self {
        Self {
            cfg,
            invoker,
            sink,
            store: BuildOutputStore::new(),
            in_progress: Arc::new(AtomicBool::new(false)),
            current: None,
            last_success: None,
        }
    }

    pub fn config(&self) -> &Arc<AnalyzerConfig> {
        &self.cfg
    }

    pub fn invoker(&self) -> &Arc<dyn ProcessInvoker> {
        &self.invoker
    }

    pub fn layout(&self, project: &Project, clone: CloneId) -> OutputLayout {
        OutputLayout::new(&self.cfg, &project.directory(), clone)
    }

    pub fn store(&self) -> &BuildOutputStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut BuildOutputStore {
        &mut self.store
    }

    pub fn last_successful_build(&self) -> Option<DateTime<Utc>> {
        self.last_success
    }

    pub fn is_build_in_progress(&self) -> bool {
        self.in_progress.load(Ordering::SeqCst)
    }

    /// True while a worker thread is still running, including one that was
    /// cancelled and has not returned yet.
    pub fn has_worker(&self) -> bool {
        self.current
            .as_ref()
            .is_some_and(|h| !h.join.is_finished())
    }

    /// True when a worker exists and has returned.
    pub fn is_finished(&self) -> bool {
        self.current
            .as_ref()
            .is_some_and(|h| h.join.is_finished())
    }

    /// Purges the clone's previous artifacts, announces the build and starts
    /// the worker. Fails if another worker is still running.
    pub fn build_current_project(&mut self, project: &Project, clone_id: CloneId) -> Result<()> {
        if self.is_build_in_progress() || self.has_worker() {
            return Err(Error::with_kind(
                ErrorKind::BuildInProgress,
                "a build is already in progress",
            ));
        }
        // Collect a finished but unclaimed worker first.
        if self.current.is_some() {
            self.finish_build();
        }
        project.clone_by_id(clone_id)?;

        let layout = self.layout(project, clone_id);
        layout.purge()?;
        self.store.clear();

        self.sink.emit(BuildEvent::LogCleared);
        self.in_progress.store(true, Ordering::SeqCst);
        self.sink.emit(BuildEvent::BuildStarted {
            project: project.name.clone(),
            clone: clone_id.0,
        });
        info!(project = %project.name, clone = %clone_id, "starting build");

        let cancel = CancelToken::default();
        let job = BuildJob {
            cfg: Arc::clone(&self.cfg),
            invoker: Arc::clone(&self.invoker),
            sink: Arc::clone(&self.sink),
            cancel: cancel.clone(),
            in_progress: Arc::clone(&self.in_progress),
            project: project.clone(),
            clone_id,
            layout,
            log: String::new(),
        };
        let join = std::thread::Builder::new()
            .name("rga-build-worker".into())
            .spawn(move || job.run())
            .map_err(|e| {
                self.in_progress.store(false, Ordering::SeqCst);
                Error::msg(format!("failed to spawn build worker: {e}"))
            })?;
        self.current = Some(BuildHandle { join, cancel });
        Ok(())
    }

    /// Requests cancellation. The running invocation is left to finish; no
    /// further GPU is started and the worker removes partial artifacts.
    /// Returns false when there is nothing to cancel or the worker is already
    /// reporting its result.
    pub fn cancel_current_build(&mut self) -> bool {
        let Some(handle) = self.current.as_ref() else {
            return false;
        };
        if !handle.cancel.cancel() {
            return false;
        }
        self.in_progress.store(false, Ordering::SeqCst);
        self.store.clear();
        info!("build cancellation requested");
        self.sink.emit(BuildEvent::BuildCancelled);
        true
    }

    /// Collects the worker if it has returned. Never blocks.
    pub fn poll_build(&mut self) -> Option<BuildReport> {
        if self.is_finished() {
            self.finish_build()
        } else {
            None
        }
    }

    /// Joins the worker, blocking until it returns, and installs its store.
    pub fn finish_build(&mut self) -> Option<BuildReport> {
        let handle = self.current.take()?;
        let result = match handle.join.join() {
            Ok(r) => r,
            Err(_) => {
                error!("build worker panicked");
                self.in_progress.store(false, Ordering::SeqCst);
                self.sink.emit(BuildEvent::BuildFailed {
                    reason: "build worker panicked".into(),
                });
                return Some(BuildReport {
                    status: BuildStatus::Failed,
                    invoked_ok: Vec::new(),
                    loaded: Vec::new(),
                    log: String::new(),
                    finished_at: Utc::now(),
                });
            }
        };
        let report = result.report;
        self.store = result.store;
        if report.status == BuildStatus::Succeeded {
            self.last_success = Some(report.finished_at);
        }
        Some(report)
    }

    /// Cancels any running build and waits for the worker.
    pub fn shutdown(&mut self) {
        if self.current.is_some() {
            self.cancel_current_build();
            self.finish_build();
        }
    }
}

impl Drop for BuildOrchestrator {
    fn drop(&mut self) {
        self.shutdown();
    }
}
